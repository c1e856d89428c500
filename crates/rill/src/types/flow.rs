//! Cold flows.
//!
//! A flow stores its producer callable plus a chain of operators; the
//! producer runs anew inside every `collect`, driven by the consumer, so
//! collection is naturally back-pressured. `take(n)` terminates the
//! producer through the dedicated `StopFlow` control signal.

use crate::value::Value;

#[derive(Debug, Clone)]
pub(crate) enum FlowOp {
    /// Stop the producer after emitting this many values.
    Take(u64),
    /// Transform each emitted value through a callable.
    Map(Value),
}

#[derive(Debug)]
pub(crate) struct FlowData {
    /// The `flow { ... }` body; invoked with `emit` bound in its scope.
    pub producer: Value,
    pub ops: Vec<FlowOp>,
}

impl FlowData {
    /// A new flow with one more operator appended.
    pub fn extended(&self, op: FlowOp) -> Self {
        let mut ops = self.ops.clone();
        ops.push(op);
        Self {
            producer: self.producer,
            ops,
        }
    }
}
