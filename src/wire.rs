//! Wire format: the typed value model and the protobuf-shaped messages
//! exchanged between server and client.
//!
//! Two message families travel on the request/response channel
//! ([`CommandMessage`] / [`ResponseMessage`]) and one on the publish
//! channel ([`VariableMessage`]). All payloads are prost-encoded with
//! stable field tags; a [`VariableMessage`] carries exactly one value
//! case so the receiver can reconstruct the [`Value`] variant.
//!
//! [`CommandMessage`]: message::CommandMessage
//! [`ResponseMessage`]: message::ResponseMessage
//! [`VariableMessage`]: message::VariableMessage
//! [`Value`]: value::Value

pub mod message;
pub mod value;
