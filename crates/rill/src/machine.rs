//! Shared interpreter state.
//!
//! One [`Machine`] backs one evaluation module and all coroutines spawned
//! from it. Components sit behind their own `RefCell`s; the evaluator's
//! rule is to finish every borrow before any `await`, which is what makes
//! interleaving at suspension points safe on a single carrier.

use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

use crate::{
    exceptions::{Exec, Flow, Raised},
    heap::{Heap, HeapData},
    intern::{Interns, StringId},
    io::PrintWriter,
    module::{PackageRegistry, SecurityManager},
    resource::ResourceLimits,
    scope::{FrameKind, ScopeId, Scopes},
    sched::Scheduler,
    source::{Source, Span},
    tracer::{EvalTracer, NoopTracer, TraceEvent},
    types::class::{ClassRef, CoreClass},
    value::Value,
};

pub(crate) type Mx = Rc<Machine>;

pub(crate) struct Machine {
    pub heap: RefCell<Heap>,
    pub scopes: RefCell<Scopes>,
    pub interns: RefCell<Interns>,
    pub sched: Scheduler,
    pub registry: RefCell<PackageRegistry>,
    pub out: RefCell<Box<dyn PrintWriter>>,
    pub tracer: RefCell<Box<dyn EvalTracer>>,
    pub security: RefCell<Option<Box<dyn SecurityManager>>>,
    /// Source of the compilation unit currently executing (swapped while a
    /// source package initialises).
    pub source: RefCell<Rc<Source>>,
    /// Root frame holding builtin bindings; parent of every module frame.
    pub root_scope: ScopeId,
    /// Monotonic closure-creation counter; block frames are returned to
    /// the pool only when no closure was created while they were live.
    pub closures_made: Cell<u64>,
    pub call_depth: Cell<usize>,
    pub limits: ResourceLimits,
}

impl Machine {
    pub fn new(limits: ResourceLimits, source: Rc<Source>) -> Mx {
        let mut scopes = Scopes::default();
        let root_scope = scopes.alloc(None, FrameKind::Module);
        Rc::new(Self {
            heap: RefCell::new(Heap::new(limits)),
            scopes: RefCell::new(scopes),
            interns: RefCell::new(Interns::default()),
            sched: Scheduler::default(),
            registry: RefCell::new(PackageRegistry::default()),
            out: RefCell::new(Box::new(crate::io::StdPrint)),
            tracer: RefCell::new(Box::new(NoopTracer)),
            security: RefCell::new(None),
            source: RefCell::new(source),
            root_scope,
            closures_made: Cell::new(0),
            call_depth: Cell::new(0),
            limits,
        })
    }

    pub fn intern(&self, s: &str) -> StringId {
        self.interns.borrow_mut().intern(s)
    }

    /// Owned copy of an interned string.
    pub fn name_of(&self, id: StringId) -> String {
        self.interns.borrow().get(id).to_owned()
    }

    pub fn alloc(&self, data: HeapData) -> Exec<Value> {
        self.heap.borrow_mut().alloc_value(data)
    }

    pub fn alloc_str(&self, s: impl Into<String>) -> Exec<Value> {
        self.heap.borrow_mut().alloc_str(s)
    }

    /// Builds a raise signal and reports it to the tracer.
    pub fn raise(&self, class: CoreClass, message: impl Into<String>) -> Flow {
        let message = message.into();
        self.tracer.borrow_mut().event(&TraceEvent::Raise {
            class_name: class.into(),
            message: &message,
            pos: None,
        });
        Flow::Raise(Box::new(Raised::new(ClassRef::Builtin(class), message)))
    }

    pub fn raise_at(&self, class: CoreClass, message: impl Into<String>, span: Span) -> Flow {
        self.raise(class, message).with_span(span)
    }

    /// Observes cancellation of the current coroutine; called at every
    /// suspension point.
    pub fn check_cancelled(&self) -> Exec<()> {
        if self.sched.is_cancelled(self.sched.current_task()) {
            Err(Flow::Cancelled)
        } else {
            Ok(())
        }
    }

    /// `println`-style rendering of a value.
    pub fn display(&self, v: Value) -> String {
        let heap = self.heap.borrow();
        let interns = self.interns.borrow();
        crate::value::display(v, &heap, &interns)
    }

    pub fn repr(&self, v: Value) -> String {
        let heap = self.heap.borrow();
        let interns = self.interns.borrow();
        crate::value::repr(v, &heap, &interns)
    }

    /// A fresh block/call frame under `parent`.
    pub fn push_frame(&self, parent: ScopeId, kind: FrameKind) -> ScopeId {
        self.scopes.borrow_mut().alloc(Some(parent), kind)
    }

    /// Returns a frame to the pool when it cannot have been captured:
    /// no closure was created anywhere since `mark`.
    pub fn maybe_release_frame(&self, frame: ScopeId, mark: u64) {
        if self.closures_made.get() == mark {
            self.scopes.borrow_mut().release(frame);
        }
    }
}
