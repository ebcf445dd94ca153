//! Transport glue: control-socket wake-up and multipart framing helpers.
//!
//! Each role owns exactly one PAIR control socket bound to a
//! process-unique `inproc://` address; its sole purpose is to unblock the
//! role's poll loop on shutdown. Request/response traffic uses the
//! dealer/router three-frame discipline; worker results and caller
//! requests travel over in-process PUSH/PULL relays framed with a small
//! prefix (router index or command id).

pub(crate) mod control;
pub(crate) mod frames;
