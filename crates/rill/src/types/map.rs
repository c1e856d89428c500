//! The `Map` payload.
//!
//! Entries preserve insertion order (literals and `+` merges read
//! naturally), keys are strings by convention and that convention is
//! enforced: runtime construction from non-string keys raises
//! `IllegalArgumentError`. Equality is pairwise entries; key order is
//! not part of the contract.

use indexmap::IndexMap;

use crate::{
    exceptions::{Exec, Flow, Raised},
    types::class::{ClassRef, CoreClass},
    value::Value,
};

#[derive(Debug, Default)]
pub(crate) struct MapData {
    pub entries: IndexMap<String, Value>,
    pub frozen: bool,
}

impl MapData {
    pub fn check_mutable(&self) -> Exec<()> {
        if self.frozen {
            Err(Flow::Raise(Box::new(Raised::new(
                ClassRef::Builtin(CoreClass::IllegalOperationError),
                "cannot modify a frozen Map",
            ))))
        } else {
            Ok(())
        }
    }

    /// Inserts, keeping first-insertion position for existing keys.
    pub fn put(&mut self, key: String, value: Value) {
        self.entries.insert(key, value);
    }
}

/// Raises the error for a non-string map key.
pub(crate) fn non_string_key(type_name: &str) -> Flow {
    Flow::Raise(Box::new(Raised::new(
        ClassRef::Builtin(CoreClass::IllegalArgumentError),
        format!("Map keys must be String, got {type_name}"),
    )))
}
