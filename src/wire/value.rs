//! Typed values, variables, and the callback aliases of the public API.

use std::fmt;
use std::sync::Arc;

/// A typed variable value.
///
/// A sum over the four supported cases. The variant is the type: there is
/// no promotion between [`Value::Int`] and [`Value::Double`], and equality
/// is only ever intra-variant. A variable's variant is pinned at
/// registration and every subsequent write must match it.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Boolean value.
    Bool(bool),
    /// 64-bit signed integer value.
    Int(i64),
    /// Double-precision floating point value.
    Double(f64),
    /// UTF-8 string value.
    Str(String),
}

impl Value {
    /// Returns the variant tag of this value.
    #[must_use]
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Bool(_) => ValueKind::Bool,
            Self::Int(_) => ValueKind::Int,
            Self::Double(_) => ValueKind::Double,
            Self::Str(_) => ValueKind::Str,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => v.fmt(f),
            Self::Int(v) => v.fmt(f),
            Self::Double(v) => v.fmt(f),
            Self::Str(v) => v.fmt(f),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

/// The variant tag of a [`Value`], carried explicitly so type mismatch can
/// be detected on write.
///
/// The [`Display`] text is the wording used in type-mismatch responses.
///
/// [`Display`]: fmt::Display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    /// `Value::Bool`.
    Bool,
    /// `Value::Int`.
    Int,
    /// `Value::Double`.
    Double,
    /// `Value::Str`.
    Str,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Bool => "boolean",
            Self::Int => "integer",
            Self::Double => "numeric",
            Self::Str => "string",
        })
    }
}

/// A named, typed piece of server state observable by peers.
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    /// Unique (per server) non-empty name.
    pub name: String,
    /// Current value; its variant pins the variable's type.
    pub value: Value,
    /// When true, only the server may change the value.
    pub read_only: bool,
}

impl Variable {
    /// Creates a writable variable.
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            read_only: false,
        }
    }

    /// Creates a variable that peers may read but not write.
    pub fn read_only(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            read_only: true,
        }
    }
}

/// Callback invoked with the new value when a variable changes.
///
/// On the server it fires only for peer-originated writes; on the client
/// it fires for received publications that differ from the last delivered
/// value.
pub type VariableChangedCallback = Arc<dyn Fn(&Value) + Send + Sync>;

/// Nullary action invoked when a peer executes a trigger.
pub type TriggerCallback = Arc<dyn Fn() + Send + Sync>;

/// Whether a client send path waits for the server's response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionOptions {
    /// Block until the response arrives, then invoke the callback.
    Sync,
    /// Return after handing off the request; the callback is invoked on
    /// the client reactor thread when the response arrives.
    #[default]
    Async,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_variant() {
        assert_eq!(Value::Bool(true).kind(), ValueKind::Bool);
        assert_eq!(Value::Int(7).kind(), ValueKind::Int);
        assert_eq!(Value::Double(0.5).kind(), ValueKind::Double);
        assert_eq!(Value::from("x").kind(), ValueKind::Str);
    }

    #[test]
    fn equality_is_intra_variant() {
        // 1 (int) and 1.0 (double) are different values on this wire.
        assert_ne!(Value::Int(1), Value::Double(1.0));
        assert_eq!(Value::Int(1), Value::Int(1));
        assert_ne!(Value::Bool(true), Value::Int(1));
    }

    #[test]
    fn kind_display_is_mismatch_wording() {
        assert_eq!(ValueKind::Bool.to_string(), "boolean");
        assert_eq!(ValueKind::Int.to_string(), "integer");
        assert_eq!(ValueKind::Double.to_string(), "numeric");
        assert_eq!(ValueKind::Str.to_string(), "string");
    }

    #[test]
    fn variable_constructors() {
        let v = Variable::new("exposure", 100.0);
        assert!(!v.read_only);
        assert_eq!(v.value, Value::Double(100.0));

        let r = Variable::read_only("fw_ver", "1.2");
        assert!(r.read_only);
        assert_eq!(r.value, Value::Str("1.2".into()));
    }
}
