//! Resource limits for embedded execution.
//!
//! The heap is a module-lifetime arena, so a runaway script is bounded by
//! a cell budget rather than a garbage collector; call depth is bounded
//! separately because every call frame is a boxed future, not a machine
//! stack frame.

/// Default maximum number of live heap cells per module.
pub const DEFAULT_MAX_HEAP_CELLS: usize = 1_000_000;

/// Default maximum evaluator call depth.
pub const DEFAULT_MAX_CALL_DEPTH: usize = 512;

/// Limits applied to one evaluation module.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct ResourceLimits {
    pub max_heap_cells: usize,
    pub max_call_depth: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_heap_cells: DEFAULT_MAX_HEAP_CELLS,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
        }
    }
}

impl ResourceLimits {
    /// Effectively unbounded limits, for trusted embedding.
    #[must_use]
    pub fn unlimited() -> Self {
        Self {
            max_heap_cells: usize::MAX,
            max_call_depth: 1 << 16,
        }
    }
}
