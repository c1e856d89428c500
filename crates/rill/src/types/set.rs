//! The `Set` payload.
//!
//! Members are stored alongside their hashable [`ValueKey`] so iteration
//! yields the original values in insertion order.

use indexmap::IndexMap;

use crate::{
    exceptions::{Exec, Flow, Raised},
    types::class::{ClassRef, CoreClass},
    value::{Value, ValueKey},
};

#[derive(Debug, Default)]
pub(crate) struct SetData {
    pub items: IndexMap<ValueKey, Value>,
    pub frozen: bool,
}

impl SetData {
    pub fn check_mutable(&self) -> Exec<()> {
        if self.frozen {
            Err(Flow::Raise(Box::new(Raised::new(
                ClassRef::Builtin(CoreClass::IllegalOperationError),
                "cannot modify a frozen Set",
            ))))
        } else {
            Ok(())
        }
    }

    /// Adds a member; returns whether it was new.
    pub fn add(&mut self, key: ValueKey, value: Value) -> bool {
        self.items.insert(key, value).is_none()
    }
}
