//! The tree-walking evaluator.
//!
//! Every node executes against a scope and yields a value; control flow
//! (`break`/`continue`/`return`, raises, cancellation) travels as the
//! `Err` side of [`Exec`] and is caught by the node that owns it. The
//! walk is an `async` recursion: any node may suspend, but suspension
//! only actually happens at the designated points (delay, awaits,
//! channel/mutex operations, spawned-task interleaving).

pub(crate) mod attr;
pub(crate) mod binary;
pub(crate) mod construct;

pub(crate) use attr::{call_method, get_member, has_method, set_member};

use std::rc::Rc;

use async_recursion::async_recursion;

use crate::{
    args::ArgValues,
    exceptions::{Exec, Flow},
    function::{make_function, read_slot},
    heap::HeapData,
    intern::{StringId, sym},
    machine::Mx,
    module::PackageDef,
    nodes::{
        ArgNode, AssignOp, BinOp, ForTarget, ListItem, MapItem, Node, NodeLoc, PatItem, VarDecl,
        WhenCond,
    },
    scope::{FrameKind, Record, ScopeId, Slot},
    source::{Source, Span},
    tracer::TraceEvent,
    types::{
        class::{ClassRef, CoreClass},
        iter,
        list::List,
        map::MapData,
        range::RangeData,
    },
    value::Value,
};

/// Executes one node. The span of the innermost failing node wins for
/// diagnostics; outer nodes only fill in a position when none is set yet.
#[async_recursion(?Send)]
pub(crate) async fn exec(node: &NodeLoc, mx: &Mx, scope: ScopeId) -> Exec<Value> {
    let result = exec_inner(node, mx, scope).await;
    result.map_err(|flow| flow.with_span(node.span))
}

async fn exec_inner(node: &NodeLoc, mx: &Mx, scope: ScopeId) -> Exec<Value> {
    let span = node.span;
    match &node.node {
        Node::Literal(v) => Ok(*v),
        Node::Name(name) => lookup_name(mx, scope, *name, span).await,
        Node::This => mx
            .scopes
            .borrow()
            .find_this(scope)
            .ok_or_else(|| mx.raise(CoreClass::IllegalStateError, "no 'this' in scope")),
        Node::QualifiedThis(type_name) => {
            // `this@Type` selects the declaring class's storage: the
            // instance viewed through that ancestor class.
            let this = mx
                .scopes
                .borrow()
                .find_this(scope)
                .ok_or_else(|| mx.raise(CoreClass::IllegalStateError, "no 'this' in scope"))?;
            let class_value = lookup_name(mx, scope, *type_name, span).await?;
            let class = expect_class(mx, class_value, span)?;
            attr::cast_value(mx, this, class, span)
        }
        Node::Super => Err(mx.raise(
            CoreClass::IllegalOperationError,
            "'super' can only qualify a member access",
        )),
        Node::ListLit(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    ListItem::Item(expr) => out.push(exec(expr, mx, scope).await?),
                    ListItem::Spread(expr) => {
                        let v = exec(expr, mx, scope).await?;
                        out.extend(iterate_collect(mx, scope, v, expr.span).await?);
                    }
                }
            }
            mx.alloc(HeapData::List(List::of(out)))
        }
        Node::MapLit(items) => {
            let mut map = MapData::default();
            for item in items {
                match item {
                    MapItem::Pair { key, value } => {
                        let v = exec(value, mx, scope).await?;
                        map.put(key.clone(), v);
                    }
                    MapItem::Shorthand(name) => {
                        let v = lookup_name(mx, scope, *name, span).await?;
                        map.put(mx.name_of(*name), v);
                    }
                    MapItem::Spread(expr) => {
                        let v = exec(expr, mx, scope).await?;
                        let Value::Ref(id) = v else {
                            return Err(mx.raise(
                                CoreClass::IllegalArgumentError,
                                "map literal spread requires a Map",
                            ));
                        };
                        let entries: Vec<(String, Value)> = {
                            let heap = mx.heap.borrow();
                            match heap.get(id) {
                                HeapData::Map(m) => {
                                    m.entries.iter().map(|(k, v)| (k.clone(), *v)).collect()
                                }
                                _ => {
                                    drop(heap);
                                    return Err(mx.raise(
                                        CoreClass::IllegalArgumentError,
                                        "map literal spread requires a Map",
                                    ));
                                }
                            }
                        };
                        // Merge left-to-right: the rightmost occurrence wins.
                        for (k, v) in entries {
                            map.put(k, v);
                        }
                    }
                }
            }
            mx.alloc(HeapData::Map(map))
        }
        Node::RangeLit {
            start,
            end,
            inclusive,
        } => {
            let start = match start {
                Some(e) => Some(exec(e, mx, scope).await?),
                None => None,
            };
            let end = match end {
                Some(e) => Some(exec(e, mx, scope).await?),
                None => None,
            };
            mx.alloc(HeapData::Range(RangeData {
                start,
                end,
                inclusive: *inclusive,
            }))
        }
        Node::Lambda(def) => make_function(mx, def, scope, None),
        Node::Dynamic { getter, setter } => {
            let getter = match getter {
                Some(def) => Some(make_function(mx, def, scope, None)?),
                None => None,
            };
            let setter = match setter {
                Some(def) => Some(make_function(mx, def, scope, None)?),
                None => None,
            };
            mx.alloc(HeapData::Dynamic(crate::types::dynamic::DynamicData {
                getter,
                setter,
            }))
        }

        Node::Binary { op, lhs, rhs } => {
            let a = exec(lhs, mx, scope).await?;
            let b = exec(rhs, mx, scope).await?;
            binary::binary_op(mx, scope, *op, a, b, span).await
        }
        Node::Logic { and, lhs, rhs } => {
            let a = exec(lhs, mx, scope).await?;
            let a = truthy(mx, a, lhs.span)?;
            let short = if *and { !a } else { a };
            if short {
                return Ok(Value::Bool(a));
            }
            let b = exec(rhs, mx, scope).await?;
            Ok(Value::Bool(truthy(mx, b, rhs.span)?))
        }
        Node::Elvis { lhs, rhs } => {
            let a = exec(lhs, mx, scope).await?;
            if a.is_null() {
                exec(rhs, mx, scope).await
            } else {
                Ok(a)
            }
        }
        Node::Unary { op, operand } => {
            let v = exec(operand, mx, scope).await?;
            binary::unary_op(mx, *op, v, span)
        }
        Node::InTest { negated, lhs, rhs } => {
            let item = exec(lhs, mx, scope).await?;
            let container = exec(rhs, mx, scope).await?;
            let found = binary::contains(mx, scope, container, item, span).await?;
            Ok(Value::Bool(found != *negated))
        }
        Node::TypeTest {
            negated,
            lhs,
            class_expr,
        } => {
            let v = exec(lhs, mx, scope).await?;
            let class = expect_class(mx, exec(class_expr, mx, scope).await?, class_expr.span)?;
            let is = {
                let heap = mx.heap.borrow();
                v.class_of(&heap).is_subclass_of(class, &heap)
            };
            Ok(Value::Bool(is != *negated))
        }
        Node::Cast { lhs, class_expr } => {
            let v = exec(lhs, mx, scope).await?;
            let class = expect_class(mx, exec(class_expr, mx, scope).await?, class_expr.span)?;
            attr::cast_value(mx, v, class, span)
        }
        Node::IncDec { pre, inc, target } => exec_incdec(mx, scope, *pre, *inc, target, span).await,
        Node::Assign { op, target, value } => exec_assign(mx, scope, *op, target, value, span).await,
        Node::Destructure {
            pattern,
            value,
            decl,
        } => {
            let v = exec(value, mx, scope).await?;
            bind_pattern(mx, scope, pattern, v, *decl, span).await?;
            Ok(v)
        }
        Node::ValVar(decl) => exec_valvar(mx, scope, decl, span).await,
        Node::Call {
            callee,
            args,
            optional,
        } => exec_call(mx, scope, callee, args, *optional, span).await,
        Node::Index {
            object,
            index,
            optional,
        } => {
            let obj = exec(object, mx, scope).await?;
            if obj.is_null() && *optional {
                return Ok(Value::Null);
            }
            let idx = exec(index, mx, scope).await?;
            attr::index_get(mx, scope, obj, idx, span).await
        }
        Node::Member {
            object,
            name,
            optional,
        } => {
            let obj = exec_receiver(mx, scope, object).await?;
            if obj.is_null() && *optional {
                return Ok(Value::Null);
            }
            get_member(mx, scope, obj, *name, span).await
        }
        Node::ScopeAccess { object, name } => {
            let obj = exec(object, mx, scope).await?;
            attr::scope_access(mx, scope, obj, *name, span).await
        }
        Node::Block(stmts) => {
            let frame = mx.push_frame(scope, FrameKind::Block);
            let mark = mx.closures_made.get();
            let result = exec_nodes(mx, stmts, frame).await;
            if result.is_ok() {
                mx.maybe_release_frame(frame, mark);
            }
            result
        }
        Node::If {
            cond,
            then,
            otherwise,
        } => {
            let c = exec(cond, mx, scope).await?;
            if truthy(mx, c, cond.span)? {
                exec(then, mx, scope).await
            } else if let Some(e) = otherwise {
                exec(e, mx, scope).await
            } else {
                Ok(Value::Void)
            }
        }
        Node::While {
            label,
            cond,
            body,
            otherwise,
        } => {
            let mut last = Value::Void;
            let mut iterated = false;
            loop {
                let c = exec(cond, mx, scope).await?;
                if !truthy(mx, c, cond.span)? {
                    break;
                }
                iterated = true;
                match exec(body, mx, scope).await {
                    Ok(v) => last = v,
                    Err(flow) => match unwind_loop(flow, *label)? {
                        LoopSignal::Break(v) => return Ok(v),
                        LoopSignal::Continue => {}
                    },
                }
            }
            finish_loop(mx, scope, otherwise.as_deref(), iterated, last).await
        }
        Node::DoWhile {
            label,
            body,
            cond,
            otherwise,
        } => {
            let mut last = Value::Void;
            loop {
                // The condition is evaluated in the body's scope, so names
                // declared in the body are visible to it.
                let frame = mx.push_frame(scope, FrameKind::Block);
                let mark = mx.closures_made.get();
                let body_result = exec_in_frame(mx, body, frame).await;
                match body_result {
                    Ok(v) => {
                        last = v;
                        let c = exec(cond, mx, frame).await?;
                        let again = truthy(mx, c, cond.span)?;
                        mx.maybe_release_frame(frame, mark);
                        if !again {
                            break;
                        }
                    }
                    Err(flow) => match unwind_loop(flow, *label)? {
                        LoopSignal::Break(v) => return Ok(v),
                        LoopSignal::Continue => {
                            let c = exec(cond, mx, frame).await?;
                            let again = truthy(mx, c, cond.span)?;
                            mx.maybe_release_frame(frame, mark);
                            if !again {
                                break;
                            }
                        }
                    },
                }
            }
            finish_loop(mx, scope, otherwise.as_deref(), true, last).await
        }
        Node::For {
            label,
            target,
            iter: iter_expr,
            body,
            otherwise,
        } => exec_for(mx, scope, *label, target, iter_expr, body, otherwise.as_deref(), span).await,
        Node::Break { label, value } => {
            let value = match value {
                Some(expr) => exec(expr, mx, scope).await?,
                None => Value::Void,
            };
            Err(Flow::Break {
                label: *label,
                value,
            })
        }
        Node::Continue { label } => Err(Flow::Continue { label: *label }),
        Node::Return { label, value } => {
            let value = match value {
                Some(expr) => exec(expr, mx, scope).await?,
                None => Value::Void,
            };
            Err(Flow::Return {
                label: *label,
                value,
            })
        }
        Node::Throw { value } => {
            let v = exec(value, mx, scope).await?;
            Err(attr::throw_value(mx, v, span))
        }
        Node::Try {
            body,
            catches,
            finally,
        } => exec_try(mx, scope, body, catches, finally.as_deref(), span).await,
        Node::When {
            subject,
            branches,
            otherwise,
        } => {
            let subject = exec(subject, mx, scope).await?;
            for branch in branches {
                let mut matched = false;
                for cond in &branch.conds {
                    // Comma-separated conditions: logical-or, early exit.
                    let hit = match cond {
                        WhenCond::Equals(expr) => {
                            let v = exec(expr, mx, scope).await?;
                            binary::equals(mx, scope, subject, v, expr.span).await?
                        }
                        WhenCond::In { negated, expr } => {
                            let container = exec(expr, mx, scope).await?;
                            let found =
                                binary::contains(mx, scope, container, subject, expr.span).await?;
                            found != *negated
                        }
                        WhenCond::Is { negated, expr } => {
                            let class = expect_class(mx, exec(expr, mx, scope).await?, expr.span)?;
                            let is = {
                                let heap = mx.heap.borrow();
                                subject.class_of(&heap).is_subclass_of(class, &heap)
                            };
                            is != *negated
                        }
                    };
                    if hit {
                        matched = true;
                        break;
                    }
                }
                if matched {
                    return exec(&branch.body, mx, scope).await;
                }
            }
            match otherwise {
                Some(e) => exec(e, mx, scope).await,
                None => Ok(Value::Void),
            }
        }
        Node::FunDecl(def) => {
            let name = def.name.expect("parser guarantees named function declarations");
            if let Some(delegate_expr) = &def.delegate {
                let delegate = exec(delegate_expr, mx, scope).await?;
                let delegate = attr::bind_delegate(mx, scope, delegate, name, "fun", span).await?;
                mx.scopes.borrow_mut().declare(
                    scope,
                    name,
                    Record {
                        slot: Slot::DelegatedFun(delegate),
                        mutable: false,
                        visibility: crate::nodes::Visibility::Public,
                    },
                );
                return Ok(Value::Void);
            }
            let f = make_function(mx, def, scope, None)?;
            mx.scopes.borrow_mut().declare(scope, name, Record::immutable(f));
            Ok(Value::Void)
        }
        Node::ClassDecl(def) => construct::create_class(mx, def, scope, span).await,
        Node::EnumDecl(def) => construct::create_enum(mx, def, scope, span).await,
        Node::Import { path, star: _ } => exec_import(mx, scope, path, span).await,
        Node::Package { name: _ } => {
            // Package headers are accepted; registration happens host-side.
            Ok(Value::Void)
        }
        Node::Annotated {
            name,
            args,
            target,
        } => exec_annotated(mx, scope, *name, args, target, span).await,
    }
}

/// Runs a statement list in an existing frame, yielding the last value.
pub(crate) async fn exec_nodes(mx: &Mx, stmts: &[NodeLoc], frame: ScopeId) -> Exec<Value> {
    let mut last = Value::Void;
    for stmt in stmts {
        last = exec(stmt, mx, frame).await?;
    }
    Ok(last)
}

/// Executes a node, flattening one block level into `frame` (used where
/// the grammar says the body's scope leaks: do-while conditions, loop
/// bodies binding their variable).
async fn exec_in_frame(mx: &Mx, node: &NodeLoc, frame: ScopeId) -> Exec<Value> {
    match &node.node {
        Node::Block(stmts) => exec_nodes(mx, stmts, frame).await,
        _ => exec(node, mx, frame).await,
    }
}

/// Requires a `Bool` condition value.
pub(crate) fn truthy(mx: &Mx, v: Value, span: Span) -> Exec<bool> {
    v.as_bool().ok_or_else(|| {
        let type_name = {
            let heap = mx.heap.borrow();
            let interns = mx.interns.borrow();
            v.type_name(&heap, &interns).into_owned()
        };
        mx.raise_at(
            CoreClass::IllegalArgumentError,
            format!("condition must be Bool, got {type_name}"),
            span,
        )
    })
}

pub(crate) fn expect_class(mx: &Mx, v: Value, span: Span) -> Exec<ClassRef> {
    match v {
        Value::Class(class) => Ok(class),
        _ => Err(mx.raise_at(CoreClass::IllegalArgumentError, "expected a class", span)),
    }
}

enum LoopSignal {
    Break(Value),
    Continue,
}

/// Routes a control-flow signal for a loop: matching breaks/continues are
/// consumed, everything else re-raises.
fn unwind_loop(flow: Flow, label: Option<StringId>) -> Exec<LoopSignal> {
    match flow {
        Flow::Break {
            label: l,
            value,
        } if l.is_none() || l == label => Ok(LoopSignal::Break(value)),
        Flow::Continue { label: l } if l.is_none() || l == label => Ok(LoopSignal::Continue),
        other => Err(other),
    }
}

/// Loop result per the loop-value rules: zero iterations without `else`
/// is `Void`; normal termination prefers the `else` block, then the last
/// body value. (Break-with-value returns directly from the loop arm.)
async fn finish_loop(
    mx: &Mx,
    scope: ScopeId,
    otherwise: Option<&NodeLoc>,
    iterated: bool,
    last: Value,
) -> Exec<Value> {
    if let Some(e) = otherwise {
        exec(e, mx, scope).await
    } else if iterated {
        Ok(last)
    } else {
        Ok(Value::Void)
    }
}

/// Evaluates the receiver of a member access. `Super` is rejected here;
/// method calls on `super` take a dedicated path in `exec_call`.
async fn exec_receiver(mx: &Mx, scope: ScopeId, object: &NodeLoc) -> Exec<Value> {
    match &object.node {
        Node::QualifiedThis(_) | Node::This => exec(object, mx, scope).await,
        Node::Super => Err(mx.raise_at(
            CoreClass::IllegalOperationError,
            "'super' members can only be called",
            object.span,
        )),
        _ => exec(object, mx, scope).await,
    }
}

// --- names -----------------------------------------------------------------

/// Unqualified name lookup.
///
/// Resolution order: locals along the call/creator chain, then members of
/// the nearest `this`, then module/root frame bindings.
pub(crate) async fn lookup_name(mx: &Mx, scope: ScopeId, name: StringId, span: Span) -> Exec<Value> {
    let chain = mx.scopes.borrow().chain(scope);
    let mut this_obj = None;
    // Pass 1: locals in non-module frames; remember the nearest `this`.
    for id in &chain {
        let (record, frame_this, is_module) = {
            let scopes = mx.scopes.borrow();
            let frame = scopes.get(*id);
            (
                frame.records.get(&name).copied(),
                frame.this_obj,
                frame.kind == FrameKind::Module,
            )
        };
        if this_obj.is_none() {
            this_obj = frame_this;
        }
        if is_module {
            continue;
        }
        if let Some(record) = record {
            let this_ref = this_obj.unwrap_or(Value::Null);
            return read_slot(mx, scope, record.slot, name, this_ref, span).await;
        }
    }
    // Pass 2: members of the nearest `this`.
    if let Some(obj) = this_obj
        && let Some(v) = attr::try_member_get(mx, scope, obj, name, span).await?
    {
        return Ok(v);
    }
    // Pass 3: module and root bindings.
    for id in &chain {
        let (record, is_module) = {
            let scopes = mx.scopes.borrow();
            let frame = scopes.get(*id);
            (frame.records.get(&name).copied(), frame.kind == FrameKind::Module)
        };
        if is_module && let Some(record) = record {
            let this_ref = this_obj.unwrap_or(Value::Null);
            return read_slot(mx, scope, record.slot, name, this_ref, span).await;
        }
    }
    let name = mx.name_of(name);
    Err(mx.raise_at(
        CoreClass::SymbolNotDefinedError,
        format!("symbol '{name}' is not defined"),
        span,
    ))
}

/// Unqualified name assignment, mirroring the lookup order.
pub(crate) async fn assign_name(
    mx: &Mx,
    scope: ScopeId,
    name: StringId,
    value: Value,
    span: Span,
) -> Exec<()> {
    let chain = mx.scopes.borrow().chain(scope);
    let mut this_obj = None;
    for pass_module in [false, true] {
        for id in &chain {
            let (record, frame_this, is_module) = {
                let scopes = mx.scopes.borrow();
                let frame = scopes.get(*id);
                (
                    frame.records.get(&name).copied(),
                    frame.this_obj,
                    frame.kind == FrameKind::Module,
                )
            };
            if this_obj.is_none() {
                this_obj = frame_this;
            }
            if is_module != pass_module {
                continue;
            }
            if let Some(record) = record {
                return write_record(mx, *id, record, name, value, this_obj, scope, span).await;
            }
        }
        // Between local and module passes, try `this` members.
        if !pass_module
            && let Some(obj) = this_obj
            && attr::try_member_set(mx, scope, obj, name, value, span).await?
        {
            return Ok(());
        }
    }
    let name = mx.name_of(name);
    Err(mx.raise_at(
        CoreClass::SymbolNotDefinedError,
        format!("cannot assign to undefined symbol '{name}'"),
        span,
    ))
}

#[expect(clippy::too_many_arguments, reason = "assignment needs full context")]
async fn write_record(
    mx: &Mx,
    frame: ScopeId,
    record: Record,
    name: StringId,
    value: Value,
    this_obj: Option<Value>,
    scope: ScopeId,
    span: Span,
) -> Exec<()> {
    match record.slot {
        Slot::Delegated(delegate) => {
            let this_ref = this_obj.unwrap_or(Value::Null);
            let name_str = mx.alloc_str(mx.name_of(name))?;
            attr::delegate_set(mx, scope, delegate, this_ref, name_str, value, span).await?;
            Ok(())
        }
        Slot::DelegatedFun(_) => Err(mx.raise_at(
            CoreClass::IllegalAssignmentError,
            "cannot assign to a delegated function",
            span,
        )),
        Slot::Plain(current) => {
            // Initialiser-less `val` holds `Unset` and permits exactly one
            // assignment; everything else immutable is rejected.
            if !record.mutable && !matches!(current, Value::Unset) {
                let name = mx.name_of(name);
                return Err(mx.raise_at(
                    CoreClass::IllegalAssignmentError,
                    format!("cannot reassign immutable binding '{name}'"),
                    span,
                ));
            }
            let mut scopes = mx.scopes.borrow_mut();
            if let Some(r) = scopes.get_mut(frame).records.get_mut(&name) {
                r.slot = Slot::Plain(value);
            }
            Ok(())
        }
    }
}

// --- assignment forms ------------------------------------------------------

async fn exec_assign(
    mx: &Mx,
    scope: ScopeId,
    op: AssignOp,
    target: &NodeLoc,
    value: &NodeLoc,
    span: Span,
) -> Exec<Value> {
    // `?=` reads the target first and only assigns when it is Null.
    if matches!(op, AssignOp::IfNull) {
        let current = read_target(mx, scope, target, span).await?;
        if !current.is_null() {
            return Ok(current);
        }
        let v = exec(value, mx, scope).await?;
        write_target(mx, scope, target, v, span).await?;
        return Ok(v);
    }

    let rhs = exec(value, mx, scope).await?;
    let v = match op {
        AssignOp::Set => rhs,
        AssignOp::IfNull => unreachable!("handled above"),
        AssignOp::Add | AssignOp::Sub | AssignOp::Mul | AssignOp::Div | AssignOp::Rem => {
            let current = read_target(mx, scope, target, span).await?;
            let bin = match op {
                AssignOp::Add => BinOp::Add,
                AssignOp::Sub => BinOp::Sub,
                AssignOp::Mul => BinOp::Mul,
                AssignOp::Div => BinOp::Div,
                _ => BinOp::Rem,
            };
            binary::binary_op(mx, scope, bin, current, rhs, span).await?
        }
    };
    write_target(mx, scope, target, v, span).await?;
    // Assignment evaluates to the assigned value.
    Ok(v)
}

/// Reads an l-value node.
async fn read_target(mx: &Mx, scope: ScopeId, target: &NodeLoc, span: Span) -> Exec<Value> {
    match &target.node {
        Node::Name(name) => lookup_name(mx, scope, *name, span).await,
        _ => exec(target, mx, scope).await,
    }
}

/// Writes an l-value node: names, members, indexes.
#[async_recursion(?Send)]
pub(crate) async fn write_target(
    mx: &Mx,
    scope: ScopeId,
    target: &NodeLoc,
    value: Value,
    span: Span,
) -> Exec<()> {
    match &target.node {
        Node::Name(name) => assign_name(mx, scope, *name, value, span).await,
        Node::Member { object, name, .. } => {
            let obj = exec_receiver(mx, scope, object).await?;
            set_member(mx, scope, obj, *name, value, span).await
        }
        Node::Index { object, index, .. } => {
            let obj = exec(object, mx, scope).await?;
            let idx = exec(index, mx, scope).await?;
            attr::index_set(mx, scope, obj, idx, value, span).await
        }
        _ => Err(mx.raise_at(
            CoreClass::IllegalAssignmentError,
            "target cannot be assigned to",
            span,
        )),
    }
}

async fn exec_incdec(
    mx: &Mx,
    scope: ScopeId,
    pre: bool,
    inc: bool,
    target: &NodeLoc,
    span: Span,
) -> Exec<Value> {
    let old = read_target(mx, scope, target, span).await?;
    let new = match old {
        Value::Int(i) => Value::Int(if inc { i + 1 } else { i - 1 }),
        Value::Real(r) => Value::Real(if inc { r + 1.0 } else { r - 1.0 }),
        _ => {
            return Err(mx.raise_at(
                CoreClass::IllegalOperationError,
                "++/-- require a numeric binding",
                span,
            ));
        }
    };
    write_target(mx, scope, target, new, span).await?;
    Ok(if pre { new } else { old })
}

async fn exec_valvar(mx: &Mx, scope: ScopeId, decl: &VarDecl, span: Span) -> Exec<Value> {
    if let Some(delegate_expr) = &decl.delegate {
        let delegate = exec(delegate_expr, mx, scope).await?;
        let access = if decl.mutable { "var" } else { "val" };
        let delegate = attr::bind_delegate(mx, scope, delegate, decl.name, access, span).await?;
        mx.scopes.borrow_mut().declare(
            scope,
            decl.name,
            Record {
                slot: Slot::Delegated(delegate),
                mutable: decl.mutable,
                visibility: decl.visibility,
            },
        );
        return Ok(Value::Void);
    }
    let value = match &decl.init {
        Some(init) => exec(init, mx, scope).await?,
        None => Value::Unset,
    };
    mx.scopes.borrow_mut().declare(
        scope,
        decl.name,
        Record {
            slot: Slot::Plain(value),
            mutable: decl.mutable,
            visibility: decl.visibility,
        },
    );
    Ok(if matches!(value, Value::Unset) {
        Value::Void
    } else {
        value
    })
}

// --- destructuring ---------------------------------------------------------

/// Binds `[head..., splat, ...tail] = value`. Head and tail are drawn from
/// both ends, the splat consumes the interior; nesting recurses.
#[async_recursion(?Send)]
pub(crate) async fn bind_pattern(
    mx: &Mx,
    scope: ScopeId,
    pattern: &[PatItem],
    value: Value,
    decl: Option<bool>,
    span: Span,
) -> Exec<()> {
    let size = attr::value_size(mx, value, span).await?;
    let splat_pos = pattern.iter().position(|p| matches!(p, PatItem::Splat(_)));
    let head_len = splat_pos.unwrap_or(pattern.len());
    let tail_len = splat_pos.map_or(0, |p| pattern.len() - p - 1);

    match splat_pos {
        None if size != pattern.len() => {
            return Err(mx.raise_at(
                CoreClass::IllegalArgumentError,
                format!("cannot destructure {size} elements into {} names", pattern.len()),
                span,
            ));
        }
        Some(_) if size < head_len + tail_len => {
            return Err(mx.raise_at(
                CoreClass::IllegalArgumentError,
                format!(
                    "cannot destructure {size} elements into at least {} names",
                    head_len + tail_len
                ),
                span,
            ));
        }
        _ => {}
    }

    let bind_one = |mx: &Mx, scope: ScopeId, name: StringId, v: Value, decl: Option<bool>| {
        if let Some(mutable) = decl {
            let record = if mutable {
                Record::mutable(v)
            } else {
                Record::immutable(v)
            };
            mx.scopes.borrow_mut().declare(scope, name, record);
        }
    };

    for (i, item) in pattern[..head_len].iter().enumerate() {
        let v = attr::indexed_get(mx, scope, value, i as i64, span).await?;
        match item {
            PatItem::Name(name) => {
                if decl.is_some() {
                    bind_one(mx, scope, *name, v, decl);
                } else {
                    assign_name(mx, scope, *name, v, span).await?;
                }
            }
            PatItem::Nested(inner) => bind_pattern(mx, scope, inner, v, decl, span).await?,
            PatItem::Splat(_) => unreachable!("head excludes the splat"),
        }
    }

    if let Some(splat_idx) = splat_pos {
        let mid_len = size - head_len - tail_len;
        if let PatItem::Splat(Some(name)) = &pattern[splat_idx] {
            let mut mid = Vec::with_capacity(mid_len);
            for i in 0..mid_len {
                mid.push(attr::indexed_get(mx, scope, value, (head_len + i) as i64, span).await?);
            }
            let list = mx.alloc(HeapData::List(List::of(mid)))?;
            if decl.is_some() {
                bind_one(mx, scope, *name, list, decl);
            } else {
                assign_name(mx, scope, *name, list, span).await?;
            }
        }
        for (j, item) in pattern[splat_idx + 1..].iter().enumerate() {
            let v =
                attr::indexed_get(mx, scope, value, (size - tail_len + j) as i64, span).await?;
            match item {
                PatItem::Name(name) => {
                    if decl.is_some() {
                        bind_one(mx, scope, *name, v, decl);
                    } else {
                        assign_name(mx, scope, *name, v, span).await?;
                    }
                }
                PatItem::Nested(inner) => bind_pattern(mx, scope, inner, v, decl, span).await?,
                PatItem::Splat(_) => {
                    return Err(mx.raise_at(
                        CoreClass::IllegalArgumentError,
                        "only one splat is allowed in a destructuring pattern",
                        span,
                    ));
                }
            }
        }
    }
    Ok(())
}

// --- calls -----------------------------------------------------------------

/// Evaluates call-site arguments strictly left-to-right, expanding splats
/// in place. Positional arguments may not follow named ones (the parser
/// enforces the literal case; splats are checked here).
pub(crate) async fn eval_args(
    mx: &Mx,
    scope: ScopeId,
    args: &[ArgNode],
    span: Span,
) -> Exec<ArgValues> {
    let mut out = ArgValues::empty();
    for arg in args {
        match arg {
            ArgNode::Pos(expr) => {
                let v = exec(expr, mx, scope).await?;
                if !out.named.is_empty() {
                    return Err(mx.raise_at(
                        CoreClass::IllegalArgumentError,
                        "positional arguments cannot follow named arguments",
                        span,
                    ));
                }
                out.pos.push(v);
            }
            ArgNode::Named(name, expr) => {
                let v = exec(expr, mx, scope).await?;
                if out.named.iter().any(|(n, _)| n == name) {
                    let name = mx.name_of(*name);
                    return Err(mx.raise_at(
                        CoreClass::IllegalArgumentError,
                        format!("duplicate argument '{name}'"),
                        span,
                    ));
                }
                out.named.push((*name, v));
            }
            ArgNode::Splat(expr) => {
                let v = exec(expr, mx, scope).await?;
                let map_entries: Option<Vec<(String, Value)>> = match v {
                    Value::Ref(id) => {
                        let heap = mx.heap.borrow();
                        match heap.get(id) {
                            HeapData::Map(m) => {
                                Some(m.entries.iter().map(|(k, v)| (k.clone(), *v)).collect())
                            }
                            _ => None,
                        }
                    }
                    _ => None,
                };
                if let Some(entries) = map_entries {
                    for (k, v) in entries {
                        let name = mx.intern(&k);
                        if out.named.iter().any(|(n, _)| *n == name) {
                            return Err(mx.raise_at(
                                CoreClass::IllegalArgumentError,
                                format!("duplicate argument '{k}'"),
                                span,
                            ));
                        }
                        out.named.push((name, v));
                    }
                } else {
                    if !out.named.is_empty() {
                        return Err(mx.raise_at(
                            CoreClass::IllegalArgumentError,
                            "positional splats cannot follow named arguments",
                            span,
                        ));
                    }
                    out.pos
                        .extend(iterate_collect(mx, scope, v, expr.span).await?);
                }
            }
        }
    }
    Ok(out)
}

async fn exec_call(
    mx: &Mx,
    scope: ScopeId,
    callee: &NodeLoc,
    args: &[ArgNode],
    optional: bool,
    span: Span,
) -> Exec<Value> {
    // Method calls bind `this` to the receiver without materialising a
    // bound-method value.
    if let Node::Member {
        object,
        name,
        optional: member_optional,
    } = &callee.node
    {
        if matches!(object.node, Node::Super) {
            let argv = eval_args(mx, scope, args, span).await?;
            return construct::super_call(mx, scope, *name, argv, span).await;
        }
        let obj = exec(object, mx, scope).await?;
        if obj.is_null() && (*member_optional || optional) {
            return Ok(Value::Null);
        }
        let argv = eval_args(mx, scope, args, span).await?;
        return call_method(mx, scope, obj, *name, argv, span).await;
    }

    let f = exec(callee, mx, scope).await?;
    if f.is_null() && optional {
        return Ok(Value::Null);
    }
    let argv = eval_args(mx, scope, args, span).await?;
    crate::function::call_value(mx, f, argv, span).await
}

// --- loops over iterables --------------------------------------------------

/// Materialises any iterable into a `Vec` (list literal spreads, splats).
pub(crate) async fn iterate_collect(
    mx: &Mx,
    scope: ScopeId,
    value: Value,
    span: Span,
) -> Exec<Vec<Value>> {
    let mut out = Vec::new();
    let builtin = {
        let heap = mx.heap.borrow();
        iter::builtin_iter(&heap, value)
    };
    if let Some(state) = builtin {
        let iter_id = match mx.alloc(HeapData::Iter(state))? {
            Value::Ref(id) => id,
            _ => unreachable!("alloc returns a ref"),
        };
        loop {
            let next = {
                let mut heap = mx.heap.borrow_mut();
                let interns = mx.interns.borrow();
                iter::iter_next(&mut heap, &interns, iter_id)?
            };
            match next {
                Some(v) => out.push(v),
                None => break,
            }
        }
        return Ok(out);
    }
    // User iterable: iterator() / hasNext / next protocol.
    let iterator = call_method(mx, scope, value, sym::ITERATOR, ArgValues::empty(), span).await?;
    loop {
        let has = call_method(mx, scope, iterator, sym::HAS_NEXT, ArgValues::empty(), span).await?;
        if !truthy(mx, has, span)? {
            break;
        }
        out.push(call_method(mx, scope, iterator, sym::NEXT, ArgValues::empty(), span).await?);
    }
    Ok(out)
}

#[expect(clippy::too_many_arguments, reason = "loop execution needs full context")]
async fn exec_for(
    mx: &Mx,
    scope: ScopeId,
    label: Option<StringId>,
    target: &ForTarget,
    iter_expr: &NodeLoc,
    body: &NodeLoc,
    otherwise: Option<&NodeLoc>,
    span: Span,
) -> Exec<Value> {
    let iterable = exec(iter_expr, mx, scope).await?;

    // Dedicated fast path for Int ranges.
    let fast_range = {
        let heap = mx.heap.borrow();
        match iterable {
            Value::Ref(id) => match heap.get(id) {
                HeapData::Range(r) if !r.is_char_range() => {
                    r.int_bounds().and_then(|(start, end)| {
                        start.map(|s| (s, end, r.inclusive))
                    })
                }
                _ => None,
            },
            _ => None,
        }
    };

    let mut last = Value::Void;
    let mut iterated = false;

    if let Some((start, end, inclusive)) = fast_range {
        let mut i = start;
        loop {
            let in_range = match end {
                None => true,
                Some(e) => {
                    if inclusive {
                        i <= e
                    } else {
                        i < e
                    }
                }
            };
            if !in_range {
                break;
            }
            iterated = true;
            match run_for_body(mx, scope, target, Value::Int(i), body, span).await {
                Ok(v) => last = v,
                Err(flow) => match unwind_loop(flow, label)? {
                    LoopSignal::Break(v) => return Ok(v),
                    LoopSignal::Continue => {}
                },
            }
            match i.checked_add(1) {
                Some(n) => i = n,
                None => break,
            }
        }
        return finish_loop(mx, scope, otherwise, iterated, last).await;
    }

    let builtin = {
        let heap = mx.heap.borrow();
        iter::builtin_iter(&heap, iterable)
    };
    if let Some(state) = builtin {
        let iter_id = match mx.alloc(HeapData::Iter(state))? {
            Value::Ref(id) => id,
            _ => unreachable!("alloc returns a ref"),
        };
        loop {
            let next = {
                let mut heap = mx.heap.borrow_mut();
                let interns = mx.interns.borrow();
                iter::iter_next(&mut heap, &interns, iter_id)?
            };
            let Some(v) = next else { break };
            iterated = true;
            match run_for_body(mx, scope, target, v, body, span).await {
                Ok(v) => last = v,
                Err(flow) => match unwind_loop(flow, label)? {
                    LoopSignal::Break(v) => {
                        iter::iter_cancel(&mut mx.heap.borrow_mut(), iter_id);
                        return Ok(v);
                    }
                    LoopSignal::Continue => {}
                },
            }
        }
        return finish_loop(mx, scope, otherwise, iterated, last).await;
    }

    // User iterable protocol.
    let iterator = call_method(mx, scope, iterable, sym::ITERATOR, ArgValues::empty(), span).await?;
    loop {
        let has = call_method(mx, scope, iterator, sym::HAS_NEXT, ArgValues::empty(), span).await?;
        if !truthy(mx, has, span)? {
            break;
        }
        let v = call_method(mx, scope, iterator, sym::NEXT, ArgValues::empty(), span).await?;
        iterated = true;
        match run_for_body(mx, scope, target, v, body, span).await {
            Ok(v) => last = v,
            Err(flow) => match unwind_loop(flow, label)? {
                LoopSignal::Break(v) => {
                    // Aborted iteration must cancel the iterator if it
                    // offers cancellation.
                    if has_method(mx, scope, iterator, sym::CANCEL_ITERATION) {
                        call_method(
                            mx,
                            scope,
                            iterator,
                            sym::CANCEL_ITERATION,
                            ArgValues::empty(),
                            span,
                        )
                        .await?;
                    }
                    return Ok(v);
                }
                LoopSignal::Continue => {}
            },
        }
    }
    finish_loop(mx, scope, otherwise, iterated, last).await
}

async fn run_for_body(
    mx: &Mx,
    scope: ScopeId,
    target: &ForTarget,
    value: Value,
    body: &NodeLoc,
    span: Span,
) -> Exec<Value> {
    let frame = mx.push_frame(scope, FrameKind::Block);
    let mark = mx.closures_made.get();
    match target {
        ForTarget::Name(name) => {
            mx.scopes.borrow_mut().declare(frame, *name, Record::immutable(value));
        }
        ForTarget::Pattern(pattern) => {
            bind_pattern(mx, frame, pattern, value, Some(false), span).await?;
        }
    }
    let result = exec_in_frame(mx, body, frame).await;
    if result.is_ok() {
        mx.maybe_release_frame(frame, mark);
    }
    result
}

// --- try / catch / finally -------------------------------------------------

async fn exec_try(
    mx: &Mx,
    scope: ScopeId,
    body: &NodeLoc,
    catches: &[crate::nodes::CatchClause],
    finally: Option<&NodeLoc>,
    span: Span,
) -> Exec<Value> {
    let result = match exec(body, mx, scope).await {
        Err(Flow::Raise(raised)) => run_catches(mx, scope, catches, *raised).await,
        other => other,
    };

    // `finally` runs on every exit path without affecting the value,
    // unless it fails itself.
    if let Some(finally_block) = finally {
        exec(finally_block, mx, scope).await.map_err(|f| f.with_span(span))?;
    }
    result
}

/// Finds and runs the first catch clause whose class is an ancestor of
/// (or equal to) the raised class; re-raises when none matches.
async fn run_catches(
    mx: &Mx,
    scope: ScopeId,
    catches: &[crate::nodes::CatchClause],
    raised: crate::exceptions::Raised,
) -> Exec<Value> {
    for clause in catches {
        let mut matches = clause.classes.is_empty();
        for class_expr in &clause.classes {
            let class = expect_class(mx, exec(class_expr, mx, scope).await?, class_expr.span)?;
            let is_match = {
                let heap = mx.heap.borrow();
                raised.class.is_subclass_of(class, &heap)
            };
            if is_match {
                matches = true;
                break;
            }
        }
        // A bare `catch { ... }` implicitly binds `it: Exception` and only
        // handles classes in the error taxonomy.
        if matches && clause.classes.is_empty() {
            let heap = mx.heap.borrow();
            matches = raised
                .class
                .is_subclass_of(ClassRef::Builtin(CoreClass::Exception), &heap);
        }
        if !matches {
            continue;
        }
        let frame = mx.push_frame(scope, FrameKind::Block);
        let mark = mx.closures_made.get();
        let binding = clause.binding.unwrap_or(sym::IT);
        let exc_value = match raised.value {
            Some(v) => v,
            None => mx.alloc(HeapData::Exception(raised.clone()))?,
        };
        mx.scopes
            .borrow_mut()
            .declare(frame, binding, Record::immutable(exc_value));
        let clause_result = exec_in_frame(mx, &clause.body, frame).await;
        if clause_result.is_ok() {
            mx.maybe_release_frame(frame, mark);
        }
        return clause_result;
    }
    Err(Flow::Raise(Box::new(raised)))
}

// --- imports ---------------------------------------------------------------

async fn exec_import(mx: &Mx, scope: ScopeId, path: &str, span: Span) -> Exec<Value> {
    let allowed = mx
        .security
        .borrow()
        .as_ref()
        .is_none_or(|sm| sm.check_import(path));
    if !allowed {
        return Err(mx.raise_at(
            CoreClass::AccessError,
            format!("import of '{path}' denied"),
            span,
        ));
    }

    let module_frame = mx.scopes.borrow().module_of(scope);

    if let Some(exports) = mx.registry.borrow().cached(path) {
        let mut scopes = mx.scopes.borrow_mut();
        for (name, record) in exports.iter() {
            scopes.declare(module_frame, *name, *record);
        }
        return Ok(Value::Void);
    }

    let Some(def) = mx.registry.borrow().definition(path) else {
        return Err(mx.raise_at(
            CoreClass::SymbolNotDefinedError,
            format!("package '{path}' is not registered"),
            span,
        ));
    };

    mx.tracer.borrow_mut().event(&TraceEvent::Import { path });

    // Initialise the package in a fresh module frame under the root.
    let pkg_frame = mx.scopes.borrow_mut().alloc(Some(mx.root_scope), FrameKind::Module);
    match &*def {
        PackageDef::Native(init) => init(mx, pkg_frame)?,
        PackageDef::Source(text) => {
            let source = Rc::new(Source::new(path, text));
            let nodes = crate::parser::parse(&source, &mut mx.interns.borrow_mut())
                .map_err(|e| mx.raise(CoreClass::IllegalStateError, e.message.clone()))?;
            let saved = mx.source.replace(Rc::clone(&source));
            let result = exec_nodes(mx, &nodes, pkg_frame).await;
            *mx.source.borrow_mut() = saved;
            result?;
        }
    }

    // Public bindings become the package's exports.
    let exports: Vec<(StringId, Record)> = {
        let scopes = mx.scopes.borrow();
        scopes
            .get(pkg_frame)
            .records
            .iter()
            .filter(|(_, r)| r.visibility == crate::nodes::Visibility::Public)
            .map(|(n, r)| (*n, *r))
            .collect()
    };
    let exports = mx.registry.borrow_mut().store(path, exports);
    let mut scopes = mx.scopes.borrow_mut();
    for (name, record) in exports.iter() {
        scopes.declare(module_frame, *name, *record);
    }
    Ok(Value::Void)
}

// --- annotations -----------------------------------------------------------

/// `@Name(args) decl` - calls `Name(declName, body [, args...])` at
/// definition time; the result becomes the effective body or value.
async fn exec_annotated(
    mx: &Mx,
    scope: ScopeId,
    name: StringId,
    args: &[ArgNode],
    target: &NodeLoc,
    span: Span,
) -> Exec<Value> {
    let annotation = lookup_name(mx, scope, name, span).await?;
    let extra = eval_args(mx, scope, args, span).await?;

    match &target.node {
        Node::FunDecl(def) => {
            let fun_name = def.name.expect("parser guarantees named function declarations");
            let body = make_function(mx, def, scope, None)?;
            let name_str = mx.alloc_str(mx.name_of(fun_name))?;
            let mut argv = ArgValues::two(name_str, body);
            argv.pos.extend(extra.pos.iter().copied());
            argv.named = extra.named;
            let effective = crate::function::call_value(mx, annotation, argv, span).await?;
            mx.scopes
                .borrow_mut()
                .declare(scope, fun_name, Record::immutable(effective));
            Ok(Value::Void)
        }
        Node::ValVar(decl) => {
            let initial = match &decl.init {
                Some(init) => exec(init, mx, scope).await?,
                None => Value::Unset,
            };
            let name_str = mx.alloc_str(mx.name_of(decl.name))?;
            let mut argv = ArgValues::two(name_str, initial);
            argv.pos.extend(extra.pos.iter().copied());
            argv.named = extra.named;
            let effective = crate::function::call_value(mx, annotation, argv, span).await?;
            let record = if decl.mutable {
                Record::mutable(effective)
            } else {
                Record::immutable(effective)
            };
            mx.scopes.borrow_mut().declare(scope, decl.name, record);
            Ok(Value::Void)
        }
        _ => Err(mx.raise_at(
            CoreClass::IllegalOperationError,
            "annotations apply to function and val/var declarations",
            span,
        )),
    }
}
