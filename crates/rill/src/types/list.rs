//! The `List` payload: ordered, mutable, freezable.

use crate::{
    exceptions::{Exec, Flow, Raised},
    types::class::{ClassRef, CoreClass},
    value::Value,
};

#[derive(Debug, Default)]
pub(crate) struct List {
    pub items: Vec<Value>,
    pub frozen: bool,
}

impl List {
    pub fn of(items: Vec<Value>) -> Self {
        Self { items, frozen: false }
    }

    /// Rejects mutation of a frozen list.
    pub fn check_mutable(&self) -> Exec<()> {
        if self.frozen {
            Err(Flow::Raise(Box::new(Raised::new(
                ClassRef::Builtin(CoreClass::IllegalOperationError),
                "cannot modify a frozen List",
            ))))
        } else {
            Ok(())
        }
    }
}

/// Normalises a possibly negative index against `size`.
///
/// Negative indices count from the end (`-1` is the last element); a
/// normalised index outside `0..size` raises `IndexOutOfBoundsError`.
pub(crate) fn normalize_index(index: i64, size: usize) -> Exec<usize> {
    let adjusted = if index < 0 { index + size as i64 } else { index };
    if adjusted < 0 || adjusted >= size as i64 {
        Err(Flow::Raise(Box::new(Raised::new(
            ClassRef::Builtin(CoreClass::IndexOutOfBoundsError),
            format!("index {index} out of bounds for size {size}"),
        ))))
    } else {
        Ok(adjusted as usize)
    }
}

/// Like [`normalize_index`], but allows `size` itself (for exclusive slice
/// ends).
pub(crate) fn normalize_bound(index: i64, size: usize) -> Exec<usize> {
    let adjusted = if index < 0 { index + size as i64 } else { index };
    if adjusted < 0 || adjusted > size as i64 {
        Err(Flow::Raise(Box::new(Raised::new(
            ClassRef::Builtin(CoreClass::IndexOutOfBoundsError),
            format!("index {index} out of bounds for size {size}"),
        ))))
    } else {
        Ok(adjusted as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_indices_normalise_from_the_end() {
        assert_eq!(normalize_index(-1, 3).unwrap(), 2);
        assert_eq!(normalize_index(0, 3).unwrap(), 0);
        assert!(normalize_index(-4, 3).is_err());
        assert!(normalize_index(3, 3).is_err());
        assert_eq!(normalize_bound(3, 3).unwrap(), 3);
    }

    #[test]
    fn frozen_lists_reject_mutation() {
        let mut list = List::of(vec![Value::Int(1)]);
        assert!(list.check_mutable().is_ok());
        list.frozen = true;
        assert!(list.check_mutable().is_err());
    }
}
