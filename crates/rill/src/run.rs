//! Public interface for evaluating Rill code.
//!
//! A [`Module`] is one top-level evaluation scope seeded with the builtin
//! classes and functions. It persists across `eval` calls, so hosts can
//! drive it REPL-style; packages, native functions, native properties and
//! a security manager hook in through the same handle.

use std::rc::Rc;

use crate::{
    exceptions::{Exception, Flow},
    function::{LocalFut, NativeFn},
    heap::HeapData,
    io::PrintWriter,
    machine::{Machine, Mx},
    module::{PackageDef, SecurityManager},
    object::{Object, object_to_value, value_to_object},
    resource::ResourceLimits,
    scope::{FrameKind, Record, ScopeId},
    source::Source,
    tracer::EvalTracer,
    types::dynamic::DynamicData,
    value::Value,
};

/// One evaluation module: a scope seeded with builtins, backed by its own
/// heap, scheduler and package cache.
pub struct Module {
    mx: Mx,
    scope: ScopeId,
}

/// Handle to captured print output (see [`Module::capture_output`]).
#[derive(Clone, Default)]
pub struct OutputHandle(Rc<std::cell::RefCell<String>>);

impl OutputHandle {
    #[must_use]
    pub fn take(&self) -> String {
        std::mem::take(&mut self.0.borrow_mut())
    }

    #[must_use]
    pub fn snapshot(&self) -> String {
        self.0.borrow().clone()
    }
}

struct SharedPrint(Rc<std::cell::RefCell<String>>);

impl PrintWriter for SharedPrint {
    fn print(&mut self, text: &str) {
        self.0.borrow_mut().push_str(text);
    }
}

impl Module {
    /// Creates a module with default resource limits.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self::with_limits(name, ResourceLimits::default())
    }

    #[must_use]
    pub fn with_limits(name: &str, limits: ResourceLimits) -> Self {
        let source = Rc::new(Source::new(name, ""));
        let mx = Machine::new(limits, source);
        crate::builtins::install(&mx);
        let scope = mx.scopes.borrow_mut().alloc(Some(mx.root_scope), FrameKind::Module);
        Self { mx, scope }
    }

    /// Redirects print output into a retrievable buffer.
    pub fn capture_output(&self) -> OutputHandle {
        let handle = OutputHandle::default();
        *self.mx.out.borrow_mut() = Box::new(SharedPrint(Rc::clone(&handle.0)));
        handle
    }

    pub fn set_writer(&self, writer: impl PrintWriter + 'static) {
        *self.mx.out.borrow_mut() = Box::new(writer);
    }

    pub fn set_tracer(&self, tracer: impl EvalTracer + 'static) {
        *self.mx.tracer.borrow_mut() = Box::new(tracer);
    }

    pub fn set_security(&self, manager: impl SecurityManager + 'static) {
        *self.mx.security.borrow_mut() = Some(Box::new(manager));
    }

    /// Registers a package from source text; it is parsed and initialised
    /// lazily on first import and cached afterwards.
    pub fn register_package(&self, path: &str, source: &str) {
        self.mx
            .registry
            .borrow_mut()
            .register(path, PackageDef::Source(source.to_owned()));
    }

    /// Registers a package with a native initializer that binds values
    /// into the package's module scope.
    pub fn register_package_native(
        &self,
        path: &str,
        init: impl Fn(&mut ModuleBinder<'_>) -> Result<(), String> + 'static,
    ) {
        self.mx.registry.borrow_mut().register(
            path,
            PackageDef::Native(Rc::new(move |mx, scope| {
                let mut binder = ModuleBinder { mx, scope };
                init(&mut binder)
                    .map_err(|msg| mx.raise(crate::types::class::CoreClass::UnknownException, msg))
            })),
        );
    }

    /// Binds a synchronous native function into the module scope.
    pub fn bind_native(
        &self,
        name: &str,
        f: impl Fn(&[Object]) -> Result<Object, String> + 'static,
    ) {
        ModuleBinder {
            mx: &self.mx,
            scope: self.scope,
        }
        .bind_native(name, f);
    }

    /// Binds a suspending native function: the returned future is awaited
    /// at the call site without blocking the carrier.
    pub fn bind_native_async(
        &self,
        name: &str,
        f: impl Fn(Vec<Object>) -> LocalFut<Result<Object, String>> + 'static,
    ) {
        ModuleBinder {
            mx: &self.mx,
            scope: self.scope,
        }
        .bind_native_async(name, f);
    }

    /// Binds a native property with a getter and optional setter.
    pub fn bind_property(
        &self,
        name: &str,
        get: impl Fn() -> Result<Object, String> + 'static,
        set: Option<Box<dyn Fn(Object) -> Result<(), String>>>,
    ) {
        ModuleBinder {
            mx: &self.mx,
            scope: self.scope,
        }
        .bind_property(name, get, set);
    }

    /// Binds a plain value into the module scope.
    pub fn bind_value(&self, name: &str, value: Object) -> Result<(), Exception> {
        ModuleBinder {
            mx: &self.mx,
            scope: self.scope,
        }
        .bind_value(name, value)
        .map_err(|message| Exception {
            class_name: "IllegalStateError".to_owned(),
            message,
            pos: None,
            line: None,
            cause: None,
        })
    }

    /// Parses and evaluates source text in this module's scope, returning
    /// the value of the last statement.
    pub fn eval(&mut self, code: &str) -> Result<Object, Exception> {
        let source = Rc::new(Source::new(self.mx.source.borrow().name(), code));
        let nodes = {
            let mut interns = self.mx.interns.borrow_mut();
            crate::parser::parse(&source, &mut interns).map_err(|e| e.to_exception(&source))?
        };
        *self.mx.source.borrow_mut() = Rc::clone(&source);

        let mx = Rc::clone(&self.mx);
        let scope = self.scope;
        let outcome = self
            .mx
            .sched
            .block_on(async move { crate::eval::exec_nodes(&mx, &nodes, scope).await });

        match outcome {
            None => Err(Exception {
                class_name: "IllegalStateError".to_owned(),
                message: "deadlock: every coroutine is suspended and no timer is armed".to_owned(),
                pos: None,
                line: None,
                cause: None,
            }),
            Some(Ok(value)) => Ok(value_to_object(&self.mx, value)),
            Some(Err(flow)) => Err(self.render_flow(flow)),
        }
    }

    fn render_flow(&self, flow: Flow) -> Exception {
        let plain = |class_name: &str, message: &str| Exception {
            class_name: class_name.to_owned(),
            message: message.to_owned(),
            pos: None,
            line: None,
            cause: None,
        };
        match flow {
            Flow::Raise(raised) => {
                let heap = self.mx.heap.borrow();
                let interns = self.mx.interns.borrow();
                let source = self.mx.source.borrow();
                raised.to_exception(&heap, &interns, &source)
            }
            Flow::Break { .. } => plain("IllegalOperationError", "'break' outside of a loop"),
            Flow::Continue { .. } => plain("IllegalOperationError", "'continue' outside of a loop"),
            Flow::Return { .. } => plain("IllegalOperationError", "'return' outside of a function"),
            Flow::StopFlow => plain("IllegalStateError", "flow emission outside of a collect"),
            Flow::Cancelled => plain("IllegalStateError", "coroutine was cancelled"),
        }
    }
}

/// Binds host values into a module or package scope.
pub struct ModuleBinder<'a> {
    mx: &'a Mx,
    scope: ScopeId,
}

impl ModuleBinder<'_> {
    /// Binds a plain value; fails only when the heap budget is exhausted.
    pub fn bind_value(&mut self, name: &str, value: Object) -> Result<(), String> {
        let v = object_to_value(self.mx, &value).map_err(|_| "heap cell limit exceeded".to_owned())?;
        let id = self.mx.intern(name);
        self.mx.scopes.borrow_mut().declare(self.scope, id, Record::immutable(v));
        Ok(())
    }

    pub fn bind_native(&mut self, name: &str, f: impl Fn(&[Object]) -> Result<Object, String> + 'static) {
        let f = Rc::new(f);
        let fn_name = name.to_owned();
        let native = NativeFn::new(name, move |mx, args, span| {
            let f = Rc::clone(&f);
            let fn_name = fn_name.clone();
            Box::pin(async move {
                let host_args: Vec<Object> =
                    args.pos.iter().map(|v| value_to_object(&mx, *v)).collect();
                match f(&host_args) {
                    Ok(out) => object_to_value(&mx, &out),
                    Err(msg) => Err(mx
                        .raise(
                            crate::types::class::CoreClass::UnknownException,
                            format!("{fn_name}: {msg}"),
                        )
                        .with_span(span)),
                }
            })
        });
        self.install(name, native);
    }

    pub fn bind_native_async(
        &mut self,
        name: &str,
        f: impl Fn(Vec<Object>) -> LocalFut<Result<Object, String>> + 'static,
    ) {
        let f = Rc::new(f);
        let fn_name = name.to_owned();
        let native = NativeFn::new(name, move |mx, args, span| {
            let f = Rc::clone(&f);
            let fn_name = fn_name.clone();
            Box::pin(async move {
                let host_args: Vec<Object> =
                    args.pos.iter().map(|v| value_to_object(&mx, *v)).collect();
                mx.check_cancelled()?;
                let result = f(host_args).await;
                mx.check_cancelled()?;
                match result {
                    Ok(out) => object_to_value(&mx, &out),
                    Err(msg) => Err(mx
                        .raise(
                            crate::types::class::CoreClass::UnknownException,
                            format!("{fn_name}: {msg}"),
                        )
                        .with_span(span)),
                }
            })
        });
        self.install(name, native);
    }

    pub fn bind_property(
        &mut self,
        name: &str,
        get: impl Fn() -> Result<Object, String> + 'static,
        set: Option<Box<dyn Fn(Object) -> Result<(), String>>>,
    ) {
        let get = Rc::new(get);
        let getter = NativeFn::new(format!("{name}.get"), move |mx, _args, span| {
            let get = Rc::clone(&get);
            Box::pin(async move {
                match get() {
                    Ok(out) => object_to_value(&mx, &out),
                    Err(msg) => Err(mx
                        .raise(crate::types::class::CoreClass::UnknownException, msg)
                        .with_span(span)),
                }
            })
        });
        let has_setter = set.is_some();
        let setter = set.map(|set| {
            let set = Rc::new(set);
            NativeFn::new(format!("{name}.set"), move |mx, args, span| {
                let set = Rc::clone(&set);
                Box::pin(async move {
                    // Delegated writes arrive as (name, value).
                    let (_, value) = args.get_two("set")?;
                    let value = value_to_object(&mx, value);
                    match set(value) {
                        Ok(()) => Ok(Value::Void),
                        Err(msg) => Err(mx
                            .raise(crate::types::class::CoreClass::UnknownException, msg)
                            .with_span(span)),
                    }
                })
            })
        });

        let build = || -> crate::exceptions::Exec<()> {
            let getter_value = self.mx.alloc(HeapData::Native(getter))?;
            let setter_value = match setter {
                Some(s) => Some(self.mx.alloc(HeapData::Native(s))?),
                None => None,
            };
            let delegate = self.mx.alloc(HeapData::Dynamic(DynamicData {
                getter: Some(getter_value),
                setter: setter_value,
            }))?;
            let id = self.mx.intern(name);
            self.mx.scopes.borrow_mut().declare(
                self.scope,
                id,
                Record {
                    slot: crate::scope::Slot::Delegated(delegate),
                    mutable: has_setter,
                    visibility: crate::nodes::Visibility::Public,
                },
            );
            Ok(())
        };
        // Heap exhaustion here means the module is already unusable.
        let _ = build();
    }

    fn install(&mut self, name: &str, native: NativeFn) {
        if let Ok(v) = self.mx.alloc(HeapData::Native(native)) {
            let id = self.mx.intern(name);
            self.mx.scopes.borrow_mut().declare(self.scope, id, Record::immutable(v));
        }
    }
}

/// Convenience entry: evaluates one source text in a fresh module.
pub fn eval_source(name: &str, code: &str) -> Result<Object, Exception> {
    Module::new(name).eval(code)
}
