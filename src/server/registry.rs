//! The authoritative state store and the typed-SET state machine.
//!
//! Variables and triggers live in two maps, each behind its own mutex.
//! Every mutation method copies out whatever the caller needs (new value,
//! callback references) and returns it, so no user callback ever runs
//! while a lock is held.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::wire::value::{
    Value, ValueKind, Variable, VariableChangedCallback, TriggerCallback,
};

struct VariableSlot {
    value: Value,
    read_only: bool,
    callback: Option<VariableChangedCallback>,
}

/// Result of a peer-originated SET.
pub(crate) enum PeerSetOutcome {
    /// The value changed; the caller must invoke the callback (if any)
    /// with the new value, outside the lock.
    Updated {
        value: Value,
        callback: Option<VariableChangedCallback>,
    },
    /// The incoming value equals the stored one; nothing happened.
    Unchanged,
    /// No variable with that name.
    NotFound,
    /// The variable rejects peer writes.
    ReadOnly,
    /// The incoming value case does not match the pinned type. The stored
    /// value is untouched.
    KindMismatch { expected: ValueKind },
}

/// Result of a server-originated SET.
pub(crate) enum ServerSetOutcome {
    /// The value changed and `on_changed` ran.
    Changed { read_only: bool },
    /// Equal value; no publication, no callback.
    Unchanged,
    /// No variable with that name.
    NotFound,
    /// Value variant does not match the pinned type; stored value
    /// untouched.
    KindMismatch { expected: ValueKind },
}

/// `name -> (value, read_only, callback)` and `name -> trigger callback`.
pub(crate) struct Registry {
    variables: Mutex<HashMap<String, VariableSlot>>,
    triggers: Mutex<HashMap<String, TriggerCallback>>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            variables: Mutex::new(HashMap::new()),
            triggers: Mutex::new(HashMap::new()),
        }
    }

    /// Upserts a variable; re-registration re-pins the type.
    pub(crate) fn register_variable(
        &self,
        variable: Variable,
        callback: Option<VariableChangedCallback>,
    ) {
        self.variables.lock().expect("variables poisoned").insert(
            variable.name,
            VariableSlot {
                value: variable.value,
                read_only: variable.read_only,
                callback,
            },
        );
    }

    /// Upserts a trigger.
    pub(crate) fn register_trigger(&self, name: String, callback: TriggerCallback) {
        self.triggers
            .lock()
            .expect("triggers poisoned")
            .insert(name, callback);
    }

    /// Snapshot of all values.
    pub(crate) fn values_snapshot(&self) -> HashMap<String, Value> {
        self.variables
            .lock()
            .expect("variables poisoned")
            .iter()
            .map(|(name, slot)| (name.clone(), slot.value.clone()))
            .collect()
    }

    /// Snapshot of `(name, value, read_only)` for every variable.
    pub(crate) fn variables_snapshot(&self) -> Vec<(String, Value, bool)> {
        self.variables
            .lock()
            .expect("variables poisoned")
            .iter()
            .map(|(name, slot)| (name.clone(), slot.value.clone(), slot.read_only))
            .collect()
    }

    /// The value of one variable.
    pub(crate) fn value(&self, name: &str) -> Option<Value> {
        self.variables
            .lock()
            .expect("variables poisoned")
            .get(name)
            .map(|slot| slot.value.clone())
    }

    /// The `(value, read_only)` pair of one variable.
    pub(crate) fn variable(&self, name: &str) -> Option<(Value, bool)> {
        self.variables
            .lock()
            .expect("variables poisoned")
            .get(name)
            .map(|slot| (slot.value.clone(), slot.read_only))
    }

    /// All registered trigger names.
    pub(crate) fn trigger_names(&self) -> Vec<String> {
        self.triggers
            .lock()
            .expect("triggers poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Copies out the callback for `name` so the caller can invoke it
    /// outside the triggers lock.
    pub(crate) fn trigger_callback(&self, name: &str) -> Option<TriggerCallback> {
        self.triggers
            .lock()
            .expect("triggers poisoned")
            .get(name)
            .cloned()
    }

    /// Applies a peer-originated SET.
    ///
    /// `incoming` is `None` when the wire message carried no value case;
    /// that is reported as a kind mismatch against the pinned type.
    pub(crate) fn apply_peer_set(&self, name: &str, incoming: Option<Value>) -> PeerSetOutcome {
        let mut variables = self.variables.lock().expect("variables poisoned");
        let Some(slot) = variables.get_mut(name) else {
            return PeerSetOutcome::NotFound;
        };
        if slot.read_only {
            return PeerSetOutcome::ReadOnly;
        }
        let expected = slot.value.kind();
        let Some(incoming) = incoming else {
            return PeerSetOutcome::KindMismatch { expected };
        };
        if incoming.kind() != expected {
            return PeerSetOutcome::KindMismatch { expected };
        }
        if slot.value == incoming {
            return PeerSetOutcome::Unchanged;
        }
        slot.value = incoming.clone();
        PeerSetOutcome::Updated {
            value: incoming,
            callback: slot.callback.clone(),
        }
    }

    /// Applies a server-originated SET. When the value actually changes,
    /// `on_changed` runs with the new value and the read-only flag while
    /// the variables lock is still held, so publications cannot be
    /// reordered against the store.
    pub(crate) fn apply_server_set(
        &self,
        name: &str,
        value: Value,
        on_changed: impl FnOnce(&Value, bool),
    ) -> ServerSetOutcome {
        let mut variables = self.variables.lock().expect("variables poisoned");
        let Some(slot) = variables.get_mut(name) else {
            return ServerSetOutcome::NotFound;
        };
        let expected = slot.value.kind();
        if value.kind() != expected {
            return ServerSetOutcome::KindMismatch { expected };
        }
        if slot.value == value {
            return ServerSetOutcome::Unchanged;
        }
        slot.value = value;
        on_changed(&slot.value, slot.read_only);
        ServerSetOutcome::Changed {
            read_only: slot.read_only,
        }
    }
}
