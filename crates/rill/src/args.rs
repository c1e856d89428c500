//! Evaluated call-site arguments.
//!
//! By the time an [`ArgValues`] exists, splats have been expanded in place
//! and everything is evaluated, strictly left-to-right. Binding against a
//! signature (defaults, variadics, named parameters) happens at the call
//! boundary in `function.rs`; the check helpers here serve builtin methods
//! with fixed arities.

use smallvec::SmallVec;

use crate::{
    exceptions::{Exec, Flow, Raised},
    intern::StringId,
    types::class::{ClassRef, CoreClass},
    value::Value,
};

/// Evaluated arguments: positionals in order, then named.
#[derive(Debug, Default)]
pub(crate) struct ArgValues {
    pub pos: SmallVec<[Value; 4]>,
    pub named: Vec<(StringId, Value)>,
}

fn arg_error(msg: String) -> Flow {
    Flow::Raise(Box::new(Raised::new(
        ClassRef::Builtin(CoreClass::IllegalArgumentError),
        msg,
    )))
}

impl ArgValues {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn one(v: Value) -> Self {
        Self {
            pos: SmallVec::from_slice(&[v]),
            named: Vec::new(),
        }
    }

    pub fn two(a: Value, b: Value) -> Self {
        Self {
            pos: SmallVec::from_slice(&[a, b]),
            named: Vec::new(),
        }
    }

    pub fn positional(values: impl IntoIterator<Item = Value>) -> Self {
        Self {
            pos: values.into_iter().collect(),
            named: Vec::new(),
        }
    }

    pub fn count(&self) -> usize {
        self.pos.len() + self.named.len()
    }

    fn reject_named(&self, name: &str) -> Exec<()> {
        if self.named.is_empty() {
            Ok(())
        } else {
            Err(arg_error(format!("{name}() takes no named arguments")))
        }
    }

    /// Exactly zero arguments.
    pub fn check_zero(self, name: &str) -> Exec<()> {
        self.reject_named(name)?;
        if self.pos.is_empty() {
            Ok(())
        } else {
            Err(arg_error(format!("{name}() takes no arguments, got {}", self.count())))
        }
    }

    /// Exactly one positional argument.
    pub fn get_one(self, name: &str) -> Exec<Value> {
        self.reject_named(name)?;
        match self.pos.as_slice() {
            [v] => Ok(*v),
            other => Err(arg_error(format!("{name}() takes 1 argument, got {}", other.len()))),
        }
    }

    /// Exactly two positional arguments.
    pub fn get_two(self, name: &str) -> Exec<(Value, Value)> {
        self.reject_named(name)?;
        match self.pos.as_slice() {
            [a, b] => Ok((*a, *b)),
            other => Err(arg_error(format!("{name}() takes 2 arguments, got {}", other.len()))),
        }
    }

    /// One required plus one optional positional argument.
    pub fn get_one_two(self, name: &str) -> Exec<(Value, Option<Value>)> {
        self.reject_named(name)?;
        match self.pos.as_slice() {
            [a] => Ok((*a, None)),
            [a, b] => Ok((*a, Some(*b))),
            other => Err(arg_error(format!(
                "{name}() takes 1 or 2 arguments, got {}",
                other.len()
            ))),
        }
    }

    /// Zero or one positional argument.
    pub fn get_zero_one(self, name: &str) -> Exec<Option<Value>> {
        self.reject_named(name)?;
        match self.pos.as_slice() {
            [] => Ok(None),
            [a] => Ok(Some(*a)),
            other => Err(arg_error(format!(
                "{name}() takes at most 1 argument, got {}",
                other.len()
            ))),
        }
    }
}
