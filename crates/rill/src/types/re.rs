//! The `Regex` value, backing `s[regex]` indexing.

use regex::Regex;

use crate::{
    exceptions::{Exec, Flow, Raised},
    types::class::{ClassRef, CoreClass},
};

#[derive(Debug)]
pub(crate) struct RegexData {
    pub pattern: Regex,
}

impl RegexData {
    pub fn compile(pattern: &str) -> Exec<Self> {
        match Regex::new(pattern) {
            Ok(re) => Ok(Self { pattern: re }),
            Err(err) => Err(Flow::Raise(Box::new(Raised::new(
                ClassRef::Builtin(CoreClass::IllegalArgumentError),
                format!("invalid regex pattern: {err}"),
            )))),
        }
    }

    /// First match in `text`, or `None`.
    pub fn first_match<'t>(&self, text: &'t str) -> Option<&'t str> {
        self.pattern.find(text).map(|m| m.as_str())
    }
}
