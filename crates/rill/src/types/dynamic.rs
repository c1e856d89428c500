//! `dynamic { get { ... } set { ... } }` objects.
//!
//! Member reads, writes and indexed access all dispatch to the stored
//! lambdas; a callable returned from `get` behaves as a dynamic method.

use crate::value::Value;

#[derive(Debug)]
pub(crate) struct DynamicData {
    pub getter: Option<Value>,
    pub setter: Option<Value>,
}
