//! The `Buffer` payload: fixed-size unsigned bytes, comparable.

use crate::{
    exceptions::{Exec, Flow, Raised},
    types::class::{ClassRef, CoreClass},
};

#[derive(Debug)]
pub(crate) struct BufferData {
    pub bytes: Vec<u8>,
    pub frozen: bool,
}

impl BufferData {
    pub fn of(bytes: Vec<u8>) -> Self {
        Self { bytes, frozen: false }
    }

    pub fn check_mutable(&self) -> Exec<()> {
        if self.frozen {
            Err(Flow::Raise(Box::new(Raised::new(
                ClassRef::Builtin(CoreClass::IllegalOperationError),
                "cannot modify a frozen Buffer",
            ))))
        } else {
            Ok(())
        }
    }

    /// Stores a byte, rejecting values outside `0..=255`.
    pub fn put(&mut self, index: usize, value: i64) -> Exec<()> {
        if !(0..=255).contains(&value) {
            return Err(Flow::Raise(Box::new(Raised::new(
                ClassRef::Builtin(CoreClass::IllegalArgumentError),
                format!("Buffer bytes must be in 0..255, got {value}"),
            ))));
        }
        self.bytes[index] = value as u8;
        Ok(())
    }
}
