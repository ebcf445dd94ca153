//! prost message types for the request/response and publish channels.
//!
//! The types are written by hand (no build-time codegen) with stable field
//! tags, so the encoding is plain protobuf and stays compatible with any
//! peer that speaks the same schema.

use crate::wire::value::{Value, ValueKind};

/// A variable on the wire: name, read-only flag, and exactly one value
/// case. A message with no value case set is treated as unset by
/// receivers.
#[derive(Clone, PartialEq, prost::Message)]
pub struct VariableMessage {
    /// Variable name.
    #[prost(string, tag = "1")]
    pub name: String,
    /// Whether peers may mutate the variable.
    #[prost(bool, tag = "2")]
    pub read_only: bool,
    /// The value case; see [`variable_message::ValueCase`].
    #[prost(oneof = "variable_message::ValueCase", tags = "3, 4, 5, 6")]
    pub value: Option<variable_message::ValueCase>,
}

/// Nested types of [`VariableMessage`].
pub mod variable_message {
    /// The wire value case. Exactly one is set on a well-formed message.
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum ValueCase {
        /// Boolean case.
        #[prost(bool, tag = "3")]
        BoolValue(bool),
        /// Integer case.
        #[prost(sint64, tag = "4")]
        IntValue(i64),
        /// Double case.
        #[prost(double, tag = "5")]
        DoubleValue(f64),
        /// String case.
        #[prost(string, tag = "6")]
        StringValue(String),
    }
}

impl VariableMessage {
    /// Builds a message carrying `value` for variable `name`.
    pub fn from_parts(name: impl Into<String>, value: &Value, read_only: bool) -> Self {
        Self {
            name: name.into(),
            read_only,
            value: Some(value.into()),
        }
    }

    /// Extracts the typed value, or `None` when no value case is set.
    #[must_use]
    pub fn value(&self) -> Option<Value> {
        self.value.as_ref().map(Value::from)
    }

    /// Returns the variant tag of the carried value case, if any.
    #[must_use]
    pub fn kind(&self) -> Option<ValueKind> {
        use variable_message::ValueCase;
        self.value.as_ref().map(|case| match case {
            ValueCase::BoolValue(_) => ValueKind::Bool,
            ValueCase::IntValue(_) => ValueKind::Int,
            ValueCase::DoubleValue(_) => ValueKind::Double,
            ValueCase::StringValue(_) => ValueKind::Str,
        })
    }
}

impl From<&Value> for variable_message::ValueCase {
    fn from(value: &Value) -> Self {
        match value {
            Value::Bool(v) => Self::BoolValue(*v),
            Value::Int(v) => Self::IntValue(*v),
            Value::Double(v) => Self::DoubleValue(*v),
            Value::Str(v) => Self::StringValue(v.clone()),
        }
    }
}

impl From<&variable_message::ValueCase> for Value {
    fn from(case: &variable_message::ValueCase) -> Self {
        use variable_message::ValueCase;
        match case {
            ValueCase::BoolValue(v) => Self::Bool(*v),
            ValueCase::IntValue(v) => Self::Int(*v),
            ValueCase::DoubleValue(v) => Self::Double(*v),
            ValueCase::StringValue(v) => Self::Str(v.clone()),
        }
    }
}

/// A trigger on the wire.
#[derive(Clone, PartialEq, prost::Message)]
pub struct TriggerMessage {
    /// Trigger name.
    #[prost(string, tag = "1")]
    pub name: String,
}

/// The command kinds a client may send.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum CommandKind {
    /// Read one variable by name.
    GetVariable = 0,
    /// Write one variable.
    SetVariable = 1,
    /// Snapshot all variables.
    GetAllVariables = 2,
    /// List all trigger names.
    GetAllTriggers = 3,
    /// Invoke a trigger by name.
    ExecuteTrigger = 4,
}

/// A request sent on the dealer/router channel.
///
/// `command_id` is drawn from a per-client monotonic 64-bit counter and is
/// echoed by the response; it is the only correlation key (frame order is
/// not, since responses are computed in parallel).
#[derive(Clone, PartialEq, prost::Message)]
pub struct CommandMessage {
    /// Correlation id, unique per client.
    #[prost(uint64, tag = "1")]
    pub command_id: u64,
    /// The command kind; see [`CommandKind`].
    #[prost(enumeration = "CommandKind", tag = "2")]
    pub kind: i32,
    /// Variable name, for `GetVariable`.
    #[prost(string, optional, tag = "3")]
    pub variable_name: Option<String>,
    /// Variable payload, for `SetVariable`.
    #[prost(message, optional, tag = "4")]
    pub variable: Option<VariableMessage>,
    /// Trigger payload, for `ExecuteTrigger`.
    #[prost(message, optional, tag = "5")]
    pub trigger: Option<TriggerMessage>,
}

impl CommandMessage {
    /// Returns the decoded command kind, or `None` when the wire value is
    /// outside the known range.
    #[must_use]
    pub fn command_kind(&self) -> Option<CommandKind> {
        CommandKind::try_from(self.kind).ok()
    }

    fn new(command_id: u64, kind: CommandKind) -> Self {
        Self {
            command_id,
            kind: kind as i32,
            variable_name: None,
            variable: None,
            trigger: None,
        }
    }

    /// Builds a `GetVariable` command.
    pub fn get_variable(command_id: u64, name: impl Into<String>) -> Self {
        Self {
            variable_name: Some(name.into()),
            ..Self::new(command_id, CommandKind::GetVariable)
        }
    }

    /// Builds a `SetVariable` command.
    pub fn set_variable(command_id: u64, name: impl Into<String>, value: &Value) -> Self {
        Self {
            variable: Some(VariableMessage::from_parts(name, value, false)),
            ..Self::new(command_id, CommandKind::SetVariable)
        }
    }

    /// Builds a `GetAllVariables` command.
    #[must_use]
    pub fn get_all_variables(command_id: u64) -> Self {
        Self::new(command_id, CommandKind::GetAllVariables)
    }

    /// Builds a `GetAllTriggers` command.
    #[must_use]
    pub fn get_all_triggers(command_id: u64) -> Self {
        Self::new(command_id, CommandKind::GetAllTriggers)
    }

    /// Builds an `ExecuteTrigger` command.
    pub fn execute_trigger(command_id: u64, name: impl Into<String>) -> Self {
        Self {
            trigger: Some(TriggerMessage { name: name.into() }),
            ..Self::new(command_id, CommandKind::ExecuteTrigger)
        }
    }
}

/// A reply sent on the dealer/router channel.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ResponseMessage {
    /// Echo of the request's correlation id.
    #[prost(uint64, tag = "1")]
    pub command_id: u64,
    /// Whether the command succeeded.
    #[prost(bool, tag = "2")]
    pub success: bool,
    /// Human-readable note on success.
    #[prost(string, optional, tag = "3")]
    pub message: Option<String>,
    /// Human-readable reason on failure.
    #[prost(string, optional, tag = "4")]
    pub error_message: Option<String>,
    /// Single-variable payload (`GetVariable`).
    #[prost(message, optional, tag = "5")]
    pub variable: Option<VariableMessage>,
    /// Snapshot payload (`GetAllVariables`).
    #[prost(message, repeated, tag = "6")]
    pub variables: Vec<VariableMessage>,
    /// Trigger-list payload (`GetAllTriggers`).
    #[prost(message, repeated, tag = "7")]
    pub triggers: Vec<TriggerMessage>,
}

impl ResponseMessage {
    /// Builds a success response for `command_id`.
    #[must_use]
    pub fn ok(command_id: u64) -> Self {
        Self {
            command_id,
            success: true,
            ..Self::default()
        }
    }

    /// Builds a failed response carrying `error_message`.
    pub fn failed(command_id: u64, error_message: impl Into<String>) -> Self {
        Self {
            command_id,
            success: false,
            error_message: Some(error_message.into()),
            ..Self::default()
        }
    }

    /// Attaches a success note.
    #[must_use]
    pub fn with_note(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// The failure reason, or `""` on success.
    #[must_use]
    pub fn error_text(&self) -> &str {
        self.error_message.as_deref().unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn set_variable_roundtrip_keeps_value_case() {
        let cmd = CommandMessage::set_variable(9, "exposure", &Value::Double(250.0));
        let decoded = CommandMessage::decode(cmd.encode_to_vec().as_slice()).unwrap();

        assert_eq!(decoded.command_id, 9);
        assert_eq!(decoded.command_kind(), Some(CommandKind::SetVariable));
        let variable = decoded.variable.expect("variable payload");
        assert_eq!(variable.name, "exposure");
        assert_eq!(variable.value(), Some(Value::Double(250.0)));
        assert_eq!(variable.kind(), Some(ValueKind::Double));
    }

    #[test]
    fn int_and_double_are_distinct_cases() {
        let as_int = VariableMessage::from_parts("n", &Value::Int(1), false);
        let as_double = VariableMessage::from_parts("n", &Value::Double(1.0), false);
        assert_eq!(as_int.kind(), Some(ValueKind::Int));
        assert_eq!(as_double.kind(), Some(ValueKind::Double));
        assert_ne!(as_int.value(), as_double.value());
    }

    #[test]
    fn unset_value_case_decodes_as_none() {
        let message = VariableMessage {
            name: "ghost".into(),
            read_only: false,
            value: None,
        };
        let decoded = VariableMessage::decode(message.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded.value(), None);
        assert_eq!(decoded.kind(), None);
    }

    #[test]
    fn out_of_range_kind_is_unknown() {
        let mut cmd = CommandMessage::get_all_variables(1);
        cmd.kind = 99;
        let decoded = CommandMessage::decode(cmd.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded.command_kind(), None);
    }

    #[test]
    fn response_builders() {
        let ok = ResponseMessage::ok(3).with_note("Variable updated: exposure");
        assert!(ok.success);
        assert_eq!(ok.message.as_deref(), Some("Variable updated: exposure"));
        assert_eq!(ok.error_text(), "");

        let failed = ResponseMessage::failed(3, "Variable not found: exposure");
        assert!(!failed.success);
        assert_eq!(failed.error_text(), "Variable not found: exposure");
    }
}
