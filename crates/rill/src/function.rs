//! Callable values and the call boundary.
//!
//! Functions, lambdas and methods share one payload: the definition, the
//! captured creator scope and (for methods) the declaring class. Calling
//! creates a child call frame whose parent is the creator scope, binds
//! arguments per the signature, runs the body and catches matching
//! `return` signals - the function boundary is where non-local returns
//! stop unwinding.

use std::{future::Future, pin::Pin, rc::Rc};

use async_recursion::async_recursion;

use crate::{
    args::ArgValues,
    eval,
    exceptions::{Exec, Flow},
    heap::{HeapData, HeapId},
    intern::{StringId, sym},
    machine::Mx,
    nodes::{FunDef, Signature},
    scope::{FrameKind, Record, ScopeId, Slot},
    source::Span,
    tracer::TraceEvent,
    types::{class::CoreClass, list::List},
    value::Value,
};

/// Boxed single-threaded future, the shape of suspending native handlers.
pub type LocalFut<T> = Pin<Box<dyn Future<Output = T> + 'static>>;

/// Handler signature for host-bound and engine-internal native functions.
pub(crate) type NativeHandler = Rc<dyn Fn(Mx, ArgValues, Span) -> LocalFut<Exec<Value>>>;

/// A function or lambda value.
#[derive(Debug)]
pub(crate) struct Function {
    pub name: Option<StringId>,
    /// Target label for `return@label`.
    pub label: Option<StringId>,
    pub def: Rc<FunDef>,
    /// Scope the function was defined in (the closure's creator frame).
    pub creator: ScopeId,
    /// Declaring class for methods: `(class uid, class heap id)`.
    pub owner_class: Option<(u64, HeapId)>,
}

/// A method bound to its receiver (`a.b` read as a value).
#[derive(Debug)]
pub(crate) struct BoundMethod {
    pub recv: Value,
    pub func: HeapId,
}

pub(crate) struct NativeFn {
    pub name: String,
    pub handler: NativeHandler,
}

impl std::fmt::Debug for NativeFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeFn").field("name", &self.name).finish()
    }
}

impl NativeFn {
    /// Wraps a Rust closure as a native function value.
    pub fn new(
        name: impl Into<String>,
        handler: impl Fn(Mx, ArgValues, Span) -> LocalFut<Exec<Value>> + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            handler: Rc::new(handler),
        }
    }
}

/// Calls any callable value. Everything the surface can invoke with
/// `(...)` funnels through here.
#[async_recursion(?Send)]
pub(crate) async fn call_value(mx: &Mx, callee: Value, args: ArgValues, span: Span) -> Exec<Value> {
    match callee {
        Value::Builtin(builtin) => crate::builtins::call_builtin(mx, builtin, args, span).await,
        Value::Class(class) => eval::construct::construct_class(mx, class, args, span).await,
        Value::Ref(id) => {
            enum Kind {
                Function,
                Bound(Value, HeapId),
                Native(NativeHandler),
            }
            let kind = {
                let heap = mx.heap.borrow();
                match heap.get(id) {
                    HeapData::Function(_) => Kind::Function,
                    HeapData::Bound(b) => Kind::Bound(b.recv, b.func),
                    HeapData::Native(n) => Kind::Native(Rc::clone(&n.handler)),
                    _ => {
                        drop(heap);
                        return Err(mx
                            .raise(CoreClass::IllegalOperationError, "value is not callable")
                            .with_span(span));
                    }
                }
            };
            match kind {
                Kind::Function => call_function(mx, id, None, args, span, Vec::new()).await,
                Kind::Bound(recv, func) => {
                    let is_native = matches!(&*mx.heap.borrow().get(func), HeapData::Native(_));
                    if is_native {
                        let handler = {
                            let heap = mx.heap.borrow();
                            match heap.get(func) {
                                HeapData::Native(n) => Rc::clone(&n.handler),
                                _ => unreachable!("checked above"),
                            }
                        };
                        handler(Rc::clone(mx), args, span).await
                    } else {
                        call_function(mx, func, Some(recv), args, span, Vec::new()).await
                    }
                }
                Kind::Native(handler) => handler(Rc::clone(mx), args, span).await,
            }
        }
        other => {
            let type_name = {
                let heap = mx.heap.borrow();
                let interns = mx.interns.borrow();
                other.type_name(&heap, &interns).into_owned()
            };
            Err(mx
                .raise(CoreClass::IllegalOperationError, format!("{type_name} is not callable"))
                .with_span(span))
        }
    }
}

/// Calls a `Function` heap value with an optional receiver and extra
/// pre-bound names (used to inject `emit` into flow producers).
#[async_recursion(?Send)]
pub(crate) async fn call_function(
    mx: &Mx,
    func_id: HeapId,
    this: Option<Value>,
    args: ArgValues,
    span: Span,
    extra: Vec<(StringId, Value)>,
) -> Exec<Value> {
    let depth = mx.call_depth.get();
    if depth >= mx.limits.max_call_depth {
        return Err(mx
            .raise(CoreClass::IllegalStateError, "maximum call depth exceeded")
            .with_span(span));
    }

    let (def, creator, owner_class, label, name) = {
        let heap = mx.heap.borrow();
        let HeapData::Function(f) = heap.get(func_id) else {
            drop(heap);
            return Err(mx.raise(CoreClass::IllegalStateError, "not a function").with_span(span));
        };
        (Rc::clone(&f.def), f.creator, f.owner_class, f.label, f.name)
    };

    {
        let mut tracer = mx.tracer.borrow_mut();
        let interns = mx.interns.borrow();
        let display_name = name.map_or("<lambda>", |n| interns.get(n));
        tracer.event(&TraceEvent::CallEnter {
            name: display_name,
            depth,
        });
    }

    let frame = mx.push_frame(creator, FrameKind::Call);
    {
        let mut scopes = mx.scopes.borrow_mut();
        let f = scopes.get_mut(frame);
        f.this_obj = this;
        f.owner_class = owner_class;
    }
    let mark = mx.closures_made.get();

    mx.call_depth.set(depth + 1);
    let result = async {
        for (name, value) in &extra {
            mx.scopes.borrow_mut().declare(frame, *name, Record::immutable(*value));
        }
        bind_args(mx, frame, &def.sig, args, span).await?;
        eval::exec(&def.body, mx, frame).await
    }
    .await;
    mx.call_depth.set(depth);

    let result = match result {
        Err(Flow::Return {
            label: ret_label,
            value,
        }) => {
            let matches = match ret_label {
                // Unlabelled return unwinds to the innermost function or lambda.
                None => true,
                Some(l) => label == Some(l) || name == Some(l),
            };
            if matches {
                Ok(value)
            } else {
                Err(Flow::Return {
                    label: ret_label,
                    value,
                })
            }
        }
        other => other,
    };

    if result.is_ok() {
        mx.maybe_release_frame(frame, mark);
    }
    result
}

/// Binds evaluated arguments into a call frame per the signature.
///
/// Order: positionals left-to-right, variadic collection, named args,
/// then defaults evaluated in the callee scope for whatever is missing.
/// A headerless lambda binds the implicit `it` instead: `Void` for zero
/// args, the argument itself for one, the argument list otherwise.
#[async_recursion(?Send)]
pub(crate) async fn bind_args(
    mx: &Mx,
    frame: ScopeId,
    sig: &Signature,
    args: ArgValues,
    span: Span,
) -> Exec<()> {
    {
        let mut scopes = mx.scopes.borrow_mut();
        let f = scopes.get_mut(frame);
        f.args.clear();
        f.args.extend(args.pos.iter().copied());
    }

    if !sig.has_header {
        if let Some((name, _)) = args.named.first() {
            let name = mx.name_of(*name);
            return Err(mx
                .raise(
                    CoreClass::IllegalArgumentError,
                    format!("lambda without a parameter list takes no named argument '{name}'"),
                )
                .with_span(span));
        }
        let it = match args.pos.len() {
            0 => Value::Void,
            1 => args.pos[0],
            _ => mx.alloc(HeapData::List(List::of(args.pos.to_vec())))?,
        };
        mx.scopes.borrow_mut().declare(frame, sym::IT, Record::immutable(it));
        return Ok(());
    }

    let variadic_index = sig.variadic_index();
    let mut bound: Vec<Option<Value>> = vec![None; sig.params.len()];
    let mut pos_iter = args.pos.into_iter();

    for (i, param) in sig.params.iter().enumerate() {
        if Some(i) == variadic_index {
            break;
        }
        if let Some(v) = pos_iter.next() {
            bound[i] = Some(v);
        } else {
            break;
        }
    }
    let leftover: Vec<Value> = pos_iter.collect();
    if let Some(vi) = variadic_index {
        bound[vi] = Some(mx.alloc(HeapData::List(List::of(leftover)))?);
    } else if !leftover.is_empty() {
        return Err(mx
            .raise(
                CoreClass::IllegalArgumentError,
                format!(
                    "too many positional arguments: expected {}, got {}",
                    sig.params.len(),
                    sig.params.len() + leftover.len()
                ),
            )
            .with_span(span));
    }

    for (name, value) in args.named {
        let Some(i) = sig.params.iter().position(|p| p.name == name) else {
            let name = mx.name_of(name);
            return Err(mx
                .raise(CoreClass::IllegalArgumentError, format!("unknown argument '{name}'"))
                .with_span(span));
        };
        if Some(i) == variadic_index {
            let name = mx.name_of(name);
            return Err(mx
                .raise(
                    CoreClass::IllegalArgumentError,
                    format!("variadic parameter '{name}' cannot be passed by name"),
                )
                .with_span(span));
        }
        if bound[i].is_some() {
            let name = mx.name_of(name);
            return Err(mx
                .raise(CoreClass::IllegalArgumentError, format!("duplicate argument '{name}'"))
                .with_span(span));
        }
        bound[i] = Some(value);
    }

    // Bind what we have first so earlier parameters are visible to later
    // default expressions, then fill defaults in declaration order.
    for (i, param) in sig.params.iter().enumerate() {
        if let Some(v) = bound[i] {
            mx.scopes.borrow_mut().declare(frame, param.name, Record::mutable(v));
        }
    }
    for (i, param) in sig.params.iter().enumerate() {
        if bound[i].is_some() {
            continue;
        }
        let Some(default) = &param.default else {
            let name = mx.name_of(param.name);
            return Err(mx
                .raise(CoreClass::IllegalArgumentError, format!("missing argument '{name}'"))
                .with_span(span));
        };
        let v = eval::exec(default, mx, frame).await?;
        mx.scopes.borrow_mut().declare(frame, param.name, Record::mutable(v));
    }
    Ok(())
}

/// Builds a `Function` heap value capturing the given creator scope.
pub(crate) fn make_function(
    mx: &Mx,
    def: &Rc<FunDef>,
    creator: ScopeId,
    owner_class: Option<(u64, HeapId)>,
) -> Exec<Value> {
    mx.closures_made.set(mx.closures_made.get() + 1);
    let label = def.label.or(def.name);
    mx.alloc(HeapData::Function(Function {
        name: def.name,
        label,
        def: Rc::clone(def),
        creator,
        owner_class,
    }))
}

/// Reads a value out of a record slot; delegated slots dispatch through
/// their delegate's `getValue(thisRef, name)`.
pub(crate) async fn read_slot(
    mx: &Mx,
    scope: ScopeId,
    slot: Slot,
    name: StringId,
    this_ref: Value,
    span: Span,
) -> Exec<Value> {
    match slot {
        Slot::Plain(Value::Unset) => {
            let name = mx.name_of(name);
            Err(mx
                .raise(
                    CoreClass::IllegalStateError,
                    format!("'{name}' accessed before initialization"),
                )
                .with_span(span))
        }
        Slot::Plain(v) => Ok(v),
        Slot::Delegated(delegate) => {
            let name_str = mx.alloc_str(mx.name_of(name))?;
            eval::attr::delegate_get(mx, scope, delegate, this_ref, name_str, span).await
        }
        Slot::DelegatedFun(delegate) => {
            // Reading a delegated function yields a callable that forwards
            // to the delegate's `invoke`.
            let name_str = mx.alloc_str(mx.name_of(name))?;
            let delegate_copy = delegate;
            let native = NativeFn::new(mx.name_of(name), move |mx, args, span| {
                let mut forwarded = ArgValues::empty();
                forwarded.pos.push(this_ref);
                forwarded.pos.push(name_str);
                forwarded.pos.extend(args.pos.iter().copied());
                forwarded.named = args.named;
                Box::pin(async move {
                    let root = mx.root_scope;
                    eval::call_method(&mx, root, delegate_copy, sym::INVOKE, forwarded, span).await
                })
            });
            mx.alloc(HeapData::Native(native))
        }
    }
}
