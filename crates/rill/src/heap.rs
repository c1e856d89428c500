//! The heap arena.
//!
//! Every non-immediate value lives in one `Vec` of [`HeapData`] cells,
//! referenced by index through [`HeapId`]. The arena lives as long as its
//! module; allocation is bounded by [`ResourceLimits`] instead of a
//! collector, and all memory is reclaimed when the module is dropped.

use crate::{
    exceptions::{Exec, Flow, Raised},
    function::{BoundMethod, Function, NativeFn},
    tasks::{ChannelState, Deferred, MutexState},
    types::{
        buffer::BufferData,
        class::{CastView, ClassObject, ClassRef, CoreClass, Instance},
        dynamic::DynamicData,
        flow::FlowData,
        iter::IterState,
        list::List,
        map::MapData,
        range::RangeData,
        re::RegexData,
        set::SetData,
    },
    value::Value,
};

/// Index of a cell in the heap arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct HeapId(u32);

impl HeapId {
    #[inline]
    pub(crate) fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }

    /// Sentinel id that never resolves; used as a hash key for values
    /// without heap identity.
    pub(crate) fn invalid() -> Self {
        Self(u32::MAX)
    }
}

/// Heap-allocated payloads, one variant per builtin class with by-reference
/// semantics.
#[derive(Debug)]
pub(crate) enum HeapData {
    Str(String),
    List(List),
    Map(MapData),
    Set(SetData),
    /// A two-element entry built by `a => b`.
    Entry(Value, Value),
    Range(RangeData),
    Buffer(BufferData),
    Regex(RegexData),
    Class(ClassObject),
    Instance(Instance),
    /// An instance viewed through an ancestor class (`expr as Type`).
    View(CastView),
    Function(Function),
    Bound(BoundMethod),
    Native(NativeFn),
    Iter(IterState),
    /// A raised (or constructed) error object.
    Exception(Raised),
    Deferred(Deferred),
    Mutex(MutexState),
    Channel(ChannelState),
    Flow(FlowData),
    /// `dynamic { get {..} set {..} }` object.
    Dynamic(DynamicData),
}

impl HeapData {
    pub fn class_of(&self, heap: &Heap) -> ClassRef {
        let core = match self {
            Self::Str(_) => CoreClass::Str,
            Self::List(_) => CoreClass::List,
            Self::Map(_) => CoreClass::Map,
            Self::Set(_) => CoreClass::Set,
            Self::Entry(..) => CoreClass::MapEntry,
            Self::Range(_) => CoreClass::Range,
            Self::Buffer(_) => CoreClass::Buffer,
            Self::Regex(_) => CoreClass::Regex,
            Self::Class(_) => CoreClass::Class,
            Self::Instance(inst) => return ClassRef::User(inst.class),
            Self::View(view) => return view.class,
            Self::Function(_) | Self::Bound(_) | Self::Native(_) => CoreClass::Callable,
            Self::Iter(_) => CoreClass::Iterator,
            Self::Exception(raised) => return raised.class,
            Self::Deferred(_) => CoreClass::Deferred,
            Self::Mutex(_) => CoreClass::Mutex,
            Self::Channel(_) => CoreClass::Channel,
            Self::Flow(_) => CoreClass::Flow,
            Self::Dynamic(_) => CoreClass::Dynamic,
        };
        ClassRef::Builtin(core)
    }
}

use crate::resource::ResourceLimits;

#[derive(Debug)]
pub(crate) struct Heap {
    cells: Vec<HeapData>,
    limits: ResourceLimits,
}

impl Heap {
    pub fn new(limits: ResourceLimits) -> Self {
        Self {
            cells: Vec::with_capacity(64),
            limits,
        }
    }

    pub fn limits(&self) -> ResourceLimits {
        self.limits
    }

    /// Allocates a cell, raising `IllegalStateError` once the module's cell
    /// budget is exhausted.
    pub fn allocate(&mut self, data: HeapData) -> Exec<HeapId> {
        if self.cells.len() >= self.limits.max_heap_cells {
            return Err(Flow::Raise(Box::new(Raised::new(
                ClassRef::Builtin(CoreClass::IllegalStateError),
                "heap cell limit exceeded",
            ))));
        }
        let id = HeapId(self.cells.len() as u32);
        self.cells.push(data);
        Ok(id)
    }

    /// Allocates and wraps as a value in one step.
    pub fn alloc_value(&mut self, data: HeapData) -> Exec<Value> {
        self.allocate(data).map(Value::Ref)
    }

    pub fn alloc_str(&mut self, s: impl Into<String>) -> Exec<Value> {
        self.alloc_value(HeapData::Str(s.into()))
    }

    /// # Panics
    /// Panics if the id did not come from this heap.
    pub fn get(&self, id: HeapId) -> &HeapData {
        &self.cells[id.index()]
    }

    pub fn get_mut(&mut self, id: HeapId) -> &mut HeapData {
        &mut self.cells[id.index()]
    }

    /// Number of live cells (used by tests and resource accounting).
    pub fn len(&self) -> usize {
        self.cells.len()
    }
}
