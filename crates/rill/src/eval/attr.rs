//! Member access, indexing and method dispatch.
//!
//! `a.b` resolves along the receiver's class linearization (first
//! declaring class wins); visibility is enforced against the class body
//! executing at the access site, and neither casts nor `this@Type`
//! bypass it. Indexing dispatches to the class's `getAt`/`putAt`
//! operators, with builtin containers handled directly.

use crate::{
    args::ArgValues,
    exceptions::{Exec, Flow, Raised},
    function::{call_function, call_value},
    heap::{Heap, HeapData, HeapId},
    intern::{StringId, sym},
    machine::Mx,
    nodes::Visibility,
    scope::ScopeId,
    source::Span,
    types::{
        class::{CastView, ClassObject, ClassRef, CoreClass, InstSlot, Member, MemberKind},
        dispatch,
        list::{List, normalize_bound, normalize_index},
        map::non_string_key,
        range::RangeData,
    },
    value::Value,
};

/// Field block uid reserved for state owned by builtin base classes
/// (currently the `Exception` message/cause).
pub(crate) const BUILTIN_BASE_UID: u64 = 0;

fn not_defined(mx: &Mx, recv: Value, name: StringId, span: Span) -> Flow {
    let member = mx.name_of(name);
    let type_name = {
        let heap = mx.heap.borrow();
        let interns = mx.interns.borrow();
        recv.type_name(&heap, &interns).into_owned()
    };
    mx.raise_at(
        CoreClass::SymbolNotDefinedError,
        format!("{type_name} has no member '{member}'"),
        span,
    )
}

fn null_receiver(mx: &Mx, what: &str, span: Span) -> Flow {
    mx.raise_at(CoreClass::NullPointerError, format!("{what} on null"), span)
}

/// Resolves a value to `(instance heap id, class to search from)` when it
/// is an instance or a cast view of one.
fn as_instance(heap: &Heap, v: Value) -> Option<(HeapId, ClassRef)> {
    match v {
        Value::Ref(id) => match heap.get(id) {
            HeapData::Instance(inst) => Some((id, ClassRef::User(inst.class))),
            HeapData::View(view) => match view.target {
                Value::Ref(target) => match heap.get(target) {
                    HeapData::Instance(_) => Some((target, view.class)),
                    _ => None,
                },
                _ => None,
            },
            _ => None,
        },
        _ => None,
    }
}

fn declarer_uid(heap: &Heap, declarer: ClassRef) -> Option<u64> {
    match declarer {
        ClassRef::User(id) => match heap.get(id) {
            HeapData::Class(c) => Some(c.uid),
            _ => None,
        },
        ClassRef::Builtin(_) => None,
    }
}

/// Enforces member visibility against the class body executing at the
/// access site.
fn check_visibility(
    mx: &Mx,
    scope: ScopeId,
    declarer: ClassRef,
    member: &Member,
    name: StringId,
    span: Span,
) -> Exec<()> {
    if member.visibility == Visibility::Public {
        return Ok(());
    }
    let heap = mx.heap.borrow();
    let owner = mx.scopes.borrow().find_owner_class(scope);
    let allowed = match member.visibility {
        Visibility::Public => true,
        Visibility::Private => {
            owner.is_some_and(|(uid, _)| Some(uid) == declarer_uid(&heap, declarer))
        }
        Visibility::Protected => owner.is_some_and(|(_, class_id)| {
            ClassRef::User(class_id).is_subclass_of(declarer, &heap)
        }),
    };
    if allowed {
        Ok(())
    } else {
        drop(heap);
        let member_name = mx.name_of(name);
        let kind = if member.visibility == Visibility::Private {
            "private"
        } else {
            "protected"
        };
        Err(mx.raise_at(
            CoreClass::AccessError,
            format!("'{member_name}' is {kind} here"),
            span,
        ))
    }
}

// --- instance members ------------------------------------------------------

enum FoundMember {
    Value(Value),
    CallMethod(HeapId),
    ReadSlot { uid: u64, kind: MemberKind },
    Property { getter: Option<Value>, setter: Option<Value> },
    Abstract,
}

fn resolve_instance_member(
    mx: &Mx,
    scope: ScopeId,
    start_class: ClassRef,
    name: StringId,
    span: Span,
) -> Exec<Option<(ClassRef, FoundMember)>> {
    let found = {
        let heap = mx.heap.borrow();
        ClassObject::find_member(&heap, start_class, name)
    };
    let Some((declarer, member)) = found else {
        return Ok(None);
    };
    check_visibility(mx, scope, declarer, &member, name, span)?;
    let uid = {
        let heap = mx.heap.borrow();
        declarer_uid(&heap, declarer).unwrap_or(BUILTIN_BASE_UID)
    };
    let found = match member.kind {
        MemberKind::Method(f) => match f {
            Value::Ref(fid) => FoundMember::CallMethod(fid),
            other => FoundMember::Value(other),
        },
        MemberKind::Field { .. } | MemberKind::Delegated { .. } => FoundMember::ReadSlot {
            uid,
            kind: member.kind,
        },
        MemberKind::Property { getter, setter } => FoundMember::Property { getter, setter },
        MemberKind::Abstract => FoundMember::Abstract,
    };
    Ok(Some((declarer, found)))
}

/// Reads an instance member; `Ok(None)` when the class chain does not
/// declare it.
async fn instance_member_get(
    mx: &Mx,
    scope: ScopeId,
    recv: Value,
    inst_id: HeapId,
    start_class: ClassRef,
    name: StringId,
    span: Span,
) -> Exec<Option<Value>> {
    let Some((_, found)) = resolve_instance_member(mx, scope, start_class, name, span)? else {
        return Ok(exception_base_member(mx, inst_id, start_class, name)?);
    };
    match found {
        FoundMember::Value(v) => Ok(Some(v)),
        FoundMember::CallMethod(fid) => {
            let bound = mx.alloc(HeapData::Bound(crate::function::BoundMethod {
                recv,
                func: fid,
            }))?;
            Ok(Some(bound))
        }
        FoundMember::ReadSlot { uid, kind } => {
            let slot = {
                let heap = mx.heap.borrow();
                match heap.get(inst_id) {
                    HeapData::Instance(inst) => inst.get(uid, name),
                    _ => None,
                }
            };
            match (slot, kind) {
                (Some(InstSlot::Plain(Value::Unset)), _) | (None, _) => {
                    let member = mx.name_of(name);
                    Err(mx.raise_at(
                        CoreClass::IllegalStateError,
                        format!("field '{member}' accessed before initialization"),
                        span,
                    ))
                }
                (Some(InstSlot::Plain(v)), _) => Ok(Some(v)),
                (Some(InstSlot::Delegated(delegate)), MemberKind::Delegated { fun: true }) => {
                    let name_str = mx.alloc_str(mx.name_of(name))?;
                    Ok(Some(delegate_fun_value(mx, delegate, recv, name_str)?))
                }
                (Some(InstSlot::Delegated(delegate)), _) => {
                    let name_str = mx.alloc_str(mx.name_of(name))?;
                    Ok(Some(delegate_get(mx, scope, delegate, recv, name_str, span).await?))
                }
            }
        }
        FoundMember::Property { getter, setter: _ } => {
            let Some(getter) = getter else {
                let member = mx.name_of(name);
                return Err(mx.raise_at(
                    CoreClass::AccessError,
                    format!("property '{member}' has no getter"),
                    span,
                ));
            };
            let Value::Ref(fid) = getter else {
                return Ok(Some(getter));
            };
            Ok(Some(call_function(mx, fid, Some(recv), ArgValues::empty(), span, Vec::new()).await?))
        }
        FoundMember::Abstract => {
            let member = mx.name_of(name);
            Err(mx.raise_at(
                CoreClass::NotImplementedError,
                format!("member '{member}' is abstract"),
                span,
            ))
        }
    }
}

/// `message`/`cause` on instances of user classes descending from the
/// builtin `Exception` base. Stored in the reserved builtin field block.
fn exception_base_member(
    mx: &Mx,
    inst_id: HeapId,
    start_class: ClassRef,
    name: StringId,
) -> Exec<Option<Value>> {
    if name != sym::MESSAGE && name != sym::CAUSE {
        return Ok(None);
    }
    let heap = mx.heap.borrow();
    if !start_class.is_subclass_of(ClassRef::Builtin(CoreClass::Exception), &heap) {
        return Ok(None);
    }
    let slot = match heap.get(inst_id) {
        HeapData::Instance(inst) => inst.get(BUILTIN_BASE_UID, name),
        _ => None,
    };
    match slot {
        Some(InstSlot::Plain(v)) => Ok(Some(v)),
        _ => Ok(Some(Value::Null)),
    }
}

/// Writes an instance member; `Ok(false)` when not declared.
async fn instance_member_set(
    mx: &Mx,
    scope: ScopeId,
    recv: Value,
    inst_id: HeapId,
    start_class: ClassRef,
    name: StringId,
    value: Value,
    span: Span,
) -> Exec<bool> {
    let Some((_, found)) = resolve_instance_member(mx, scope, start_class, name, span)? else {
        return Ok(false);
    };
    match found {
        FoundMember::ReadSlot { uid, kind } => match kind {
            MemberKind::Field { mutable } => {
                let current = {
                    let heap = mx.heap.borrow();
                    match heap.get(inst_id) {
                        HeapData::Instance(inst) => inst.get(uid, name),
                        _ => None,
                    }
                };
                let is_unset = matches!(current, None | Some(InstSlot::Plain(Value::Unset)));
                if !mutable && !is_unset {
                    let member = mx.name_of(name);
                    return Err(mx.raise_at(
                        CoreClass::IllegalAssignmentError,
                        format!("cannot reassign immutable field '{member}'"),
                        span,
                    ));
                }
                let mut heap = mx.heap.borrow_mut();
                if let HeapData::Instance(inst) = heap.get_mut(inst_id) {
                    inst.set(uid, name, InstSlot::Plain(value));
                }
                Ok(true)
            }
            MemberKind::Delegated { fun: false } => {
                let delegate = {
                    let heap = mx.heap.borrow();
                    match heap.get(inst_id) {
                        HeapData::Instance(inst) => inst.get(uid, name),
                        _ => None,
                    }
                };
                let Some(InstSlot::Delegated(delegate)) = delegate else {
                    return Ok(false);
                };
                let name_str = mx.alloc_str(mx.name_of(name))?;
                delegate_set(mx, scope, delegate, recv, name_str, value, span).await?;
                Ok(true)
            }
            _ => Err(mx.raise_at(
                CoreClass::IllegalAssignmentError,
                "member cannot be assigned to",
                span,
            )),
        },
        FoundMember::Property { setter, .. } => {
            let Some(setter) = setter else {
                let member = mx.name_of(name);
                return Err(mx.raise_at(
                    CoreClass::IllegalAssignmentError,
                    format!("property '{member}' has no setter"),
                    span,
                ));
            };
            let Value::Ref(fid) = setter else {
                return Err(mx.raise_at(
                    CoreClass::IllegalAssignmentError,
                    "property setter is not callable",
                    span,
                ));
            };
            call_function(mx, fid, Some(recv), ArgValues::one(value), span, Vec::new()).await?;
            Ok(true)
        }
        _ => Err(mx.raise_at(
            CoreClass::IllegalAssignmentError,
            "member cannot be assigned to",
            span,
        )),
    }
}

// --- public entry points ---------------------------------------------------

/// `a.b` as an r-value.
pub(crate) async fn get_member(
    mx: &Mx,
    scope: ScopeId,
    obj: Value,
    name: StringId,
    span: Span,
) -> Exec<Value> {
    if obj.is_null() {
        return Err(null_receiver(mx, "member access", span));
    }
    match try_member_get(mx, scope, obj, name, span).await? {
        Some(v) => Ok(v),
        None => Err(not_defined(mx, obj, name, span)),
    }
}

/// Like [`get_member`] but yields `None` instead of raising when the
/// member does not exist (implicit-`this` lookup).
pub(crate) async fn try_member_get(
    mx: &Mx,
    scope: ScopeId,
    obj: Value,
    name: StringId,
    span: Span,
) -> Exec<Option<Value>> {
    if name == sym::CLASS {
        let class = {
            let heap = mx.heap.borrow();
            obj.class_of(&heap)
        };
        return Ok(Some(Value::Class(class)));
    }
    if let Value::Class(class) = obj {
        return class_member_get(mx, class, name);
    }

    let instance = {
        let heap = mx.heap.borrow();
        as_instance(&heap, obj)
    };
    if let Some((inst_id, start_class)) = instance {
        return instance_member_get(mx, scope, obj, inst_id, start_class, name, span).await;
    }

    if let Value::Ref(id) = obj {
        let kind = {
            let heap = mx.heap.borrow();
            match heap.get(id) {
                HeapData::Dynamic(d) => Some(d.getter),
                _ => None,
            }
        };
        if let Some(getter) = kind {
            let Some(getter) = getter else {
                return Ok(None);
            };
            let name_str = mx.alloc_str(mx.name_of(name))?;
            return Ok(Some(call_value(mx, getter, ArgValues::one(name_str), span).await?));
        }
        let exception = {
            let heap = mx.heap.borrow();
            match heap.get(id) {
                HeapData::Exception(raised) => Some((raised.message.clone(), raised.cause.clone())),
                _ => None,
            }
        };
        if let Some((message, cause)) = exception {
            if name == sym::MESSAGE {
                return Ok(Some(mx.alloc_str(message)?));
            }
            if name == sym::CAUSE {
                return match cause {
                    Some(c) => Ok(Some(mx.alloc(HeapData::Exception(*c))?)),
                    None => Ok(Some(Value::Null)),
                };
            }
        }
    }

    dispatch::builtin_member_get(mx, obj, name, span)
}

/// `a.b = v`.
pub(crate) async fn set_member(
    mx: &Mx,
    scope: ScopeId,
    obj: Value,
    name: StringId,
    value: Value,
    span: Span,
) -> Exec<()> {
    if obj.is_null() {
        return Err(null_receiver(mx, "member assignment", span));
    }
    if try_member_set(mx, scope, obj, name, value, span).await? {
        Ok(())
    } else {
        Err(not_defined(mx, obj, name, span))
    }
}

/// Member write attempt; `Ok(false)` when the receiver has no such member.
pub(crate) async fn try_member_set(
    mx: &Mx,
    scope: ScopeId,
    obj: Value,
    name: StringId,
    value: Value,
    span: Span,
) -> Exec<bool> {
    if let Value::Class(ClassRef::User(class_id)) = obj {
        let exists = {
            let heap = mx.heap.borrow();
            match heap.get(class_id) {
                HeapData::Class(c) => c.statics.contains_key(&name),
                _ => false,
            }
        };
        if exists {
            let mut heap = mx.heap.borrow_mut();
            if let HeapData::Class(c) = heap.get_mut(class_id) {
                c.statics.insert(name, value);
            }
            return Ok(true);
        }
        return Ok(false);
    }

    let instance = {
        let heap = mx.heap.borrow();
        as_instance(&heap, obj)
    };
    if let Some((inst_id, start_class)) = instance {
        return instance_member_set(mx, scope, obj, inst_id, start_class, name, value, span).await;
    }

    if let Value::Ref(id) = obj {
        let setter = {
            let heap = mx.heap.borrow();
            match heap.get(id) {
                HeapData::Dynamic(d) => Some(d.setter),
                _ => None,
            }
        };
        if let Some(setter) = setter {
            let Some(setter) = setter else {
                return Err(mx.raise_at(
                    CoreClass::IllegalAssignmentError,
                    "dynamic object has no set handler",
                    span,
                ));
            };
            let name_str = mx.alloc_str(mx.name_of(name))?;
            call_value(mx, setter, ArgValues::two(name_str, value), span).await?;
            return Ok(true);
        }
    }
    Ok(false)
}

/// Members of reflective class values: statics (including enum entries),
/// `name`, `linearization`.
fn class_member_get(mx: &Mx, class: ClassRef, name: StringId) -> Exec<Option<Value>> {
    if name == sym::NAME {
        let text = {
            let heap = mx.heap.borrow();
            let interns = mx.interns.borrow();
            class.name(&heap, &interns).into_owned()
        };
        return Ok(Some(mx.alloc_str(text)?));
    }
    if name == sym::LINEARIZATION {
        let lin: Vec<Value> = {
            let heap = mx.heap.borrow();
            class.linearization(&heap).into_iter().map(Value::Class).collect()
        };
        let mut list = List::of(lin);
        list.frozen = true;
        return Ok(Some(mx.alloc(HeapData::List(list))?));
    }
    if let ClassRef::User(id) = class {
        let found = {
            let heap = mx.heap.borrow();
            match heap.get(id) {
                HeapData::Class(c) => c.statics.get(&name).copied(),
                _ => None,
            }
        };
        if found.is_some() {
            return Ok(found);
        }
    }
    Ok(None)
}

/// `a::b` - reflective access: `expr::class`, class statics, enum
/// entries, `linearization`; otherwise a bound member reference.
pub(crate) async fn scope_access(
    mx: &Mx,
    scope: ScopeId,
    obj: Value,
    name: StringId,
    span: Span,
) -> Exec<Value> {
    if name == sym::CLASS {
        let class = {
            let heap = mx.heap.borrow();
            obj.class_of(&heap)
        };
        return Ok(Value::Class(class));
    }
    get_member(mx, scope, obj, name, span).await
}

// --- method calls ----------------------------------------------------------

/// `a.b(args)` with `this` bound to `a`.
#[async_recursion::async_recursion(?Send)]
pub(crate) async fn call_method(
    mx: &Mx,
    scope: ScopeId,
    recv: Value,
    name: StringId,
    args: ArgValues,
    span: Span,
) -> Exec<Value> {
    if recv.is_null() {
        return Err(null_receiver(mx, "method call", span));
    }

    // Enum `valueOf` and static callables on class values.
    if let Value::Class(class) = recv {
        if name == sym::VALUE_OF
            && let ClassRef::User(class_id) = class
        {
            let is_enum = {
                let heap = mx.heap.borrow();
                matches!(heap.get(class_id), HeapData::Class(c) if c.is_enum)
            };
            if is_enum {
                return enum_value_of(mx, class_id, args, span).await;
            }
        }
        if let Some(static_value) = class_member_get(mx, class, name)? {
            return call_value(mx, static_value, args, span).await;
        }
        return Err(not_defined(mx, recv, name, span));
    }

    let instance = {
        let heap = mx.heap.borrow();
        as_instance(&heap, recv)
    };
    if let Some((inst_id, start_class)) = instance {
        if let Some((_, found)) = resolve_instance_member(mx, scope, start_class, name, span)? {
            return match found {
                FoundMember::CallMethod(fid) => {
                    call_function(mx, fid, Some(recv), args, span, Vec::new()).await
                }
                other => {
                    // Fields, properties and delegates holding callables.
                    let callee = match other {
                        FoundMember::Value(v) => v,
                        _ => instance_member_get(mx, scope, recv, inst_id, start_class, name, span)
                            .await?
                            .ok_or_else(|| not_defined(mx, recv, name, span))?,
                    };
                    call_value(mx, callee, args, span).await
                }
            };
        }
        // Obj defaults for instances.
        return obj_default_method(mx, scope, recv, name, args, span).await;
    }

    if let Value::Ref(id) = recv {
        let dynamic_getter = {
            let heap = mx.heap.borrow();
            match heap.get(id) {
                HeapData::Dynamic(d) => Some(d.getter),
                _ => None,
            }
        };
        if let Some(getter) = dynamic_getter {
            let Some(getter) = getter else {
                return Err(not_defined(mx, recv, name, span));
            };
            let name_str = mx.alloc_str(mx.name_of(name))?;
            let method = call_value(mx, getter, ArgValues::one(name_str), span).await?;
            return call_value(mx, method, args, span).await;
        }
    }

    match dispatch::builtin_call_method(mx, scope, recv, name, args, span).await? {
        Some(v) => Ok(v),
        None => Err(not_defined(mx, recv, name, span)),
    }
}

/// `Obj` defaults: `toString` renders the value, `contains` is equality.
pub(crate) async fn obj_default_method(
    mx: &Mx,
    scope: ScopeId,
    recv: Value,
    name: StringId,
    args: ArgValues,
    span: Span,
) -> Exec<Value> {
    if name == sym::TO_STRING {
        args.check_zero("toString")?;
        return mx.alloc_str(mx.display(recv));
    }
    if name == sym::CONTAINS {
        let item = args.get_one("contains")?;
        let eq = super::binary::equals(mx, scope, recv, item, span).await?;
        return Ok(Value::Bool(eq));
    }
    Err(not_defined(mx, recv, name, span))
}

async fn enum_value_of(mx: &Mx, class_id: HeapId, args: ArgValues, span: Span) -> Exec<Value> {
    let arg = args.get_one("valueOf")?;
    let wanted = {
        let heap = mx.heap.borrow();
        let interns = mx.interns.borrow();
        arg.as_str(&heap, &interns).map(ToOwned::to_owned)
    };
    let Some(wanted) = wanted else {
        return Err(mx.raise_at(CoreClass::IllegalArgumentError, "valueOf expects a String", span));
    };
    let wanted_id = mx.intern(&wanted);
    let found = {
        let heap = mx.heap.borrow();
        match heap.get(class_id) {
            HeapData::Class(c) => c.statics.get(&wanted_id).copied(),
            _ => None,
        }
    };
    let entry = found.filter(|v| {
        let heap = mx.heap.borrow();
        matches!(v, Value::Ref(id) if matches!(heap.get(*id), HeapData::Instance(_)))
    });
    entry.ok_or_else(|| {
        mx.raise_at(
            CoreClass::IllegalArgumentError,
            format!("no enum entry named '{wanted}'"),
            span,
        )
    })
}

/// Whether a user instance (or dynamic object) declares a callable
/// member with this name; used for operator-method dispatch probes.
pub(crate) fn has_user_method(mx: &Mx, v: Value, name: &str) -> bool {
    let Some(name) = mx.interns.borrow().get_id(name) else {
        return false;
    };
    let heap = mx.heap.borrow();
    let Some((_, start_class)) = as_instance(&heap, v) else {
        return false;
    };
    matches!(
        ClassObject::find_member(&heap, start_class, name),
        Some((_, Member { kind: MemberKind::Method(_), .. }))
    )
}

/// Whether a method of this name is callable on the value (user methods
/// and builtin type methods).
pub(crate) fn has_method(mx: &Mx, _scope: ScopeId, v: Value, name: StringId) -> bool {
    {
        let heap = mx.heap.borrow();
        if let Some((_, start_class)) = as_instance(&heap, v)
            && ClassObject::find_member(&heap, start_class, name).is_some()
        {
            return true;
        }
    }
    let name = mx.name_of(name);
    dispatch::is_builtin_method(mx, v, &name)
}

// --- delegation ------------------------------------------------------------

/// `delegate.bind(name, access, thisRef)` at binding time, when the
/// delegate offers it; the result becomes the effective delegate.
pub(crate) async fn bind_delegate(
    mx: &Mx,
    scope: ScopeId,
    delegate: Value,
    name: StringId,
    access: &str,
    span: Span,
) -> Exec<Value> {
    let bind_id = sym::BIND;
    if !has_method(mx, scope, delegate, bind_id) {
        return Ok(delegate);
    }
    let name_str = mx.alloc_str(mx.name_of(name))?;
    let access_str = mx.alloc_str(access)?;
    let this_ref = mx.scopes.borrow().find_this(scope).unwrap_or(Value::Null);
    let mut args = ArgValues::two(name_str, access_str);
    args.pos.push(this_ref);
    call_method(mx, scope, delegate, bind_id, args, span).await
}

/// Delegated read: dynamic delegates use their `get` lambda, everything
/// else goes through `getValue(thisRef, name)`.
pub(crate) async fn delegate_get(
    mx: &Mx,
    scope: ScopeId,
    delegate: Value,
    this_ref: Value,
    name_str: Value,
    span: Span,
) -> Exec<Value> {
    let dynamic_getter = dynamic_handler(mx, delegate, true);
    if let Some(getter) = dynamic_getter {
        return call_value(mx, getter, ArgValues::one(name_str), span).await;
    }
    call_method(
        mx,
        scope,
        delegate,
        sym::GET_VALUE,
        ArgValues::two(this_ref, name_str),
        span,
    )
    .await
}

/// Delegated write: `set` lambda on dynamic delegates, otherwise
/// `setValue(thisRef, name, value)`.
pub(crate) async fn delegate_set(
    mx: &Mx,
    scope: ScopeId,
    delegate: Value,
    this_ref: Value,
    name_str: Value,
    value: Value,
    span: Span,
) -> Exec<()> {
    let dynamic_setter = dynamic_handler(mx, delegate, false);
    if let Some(setter) = dynamic_setter {
        call_value(mx, setter, ArgValues::two(name_str, value), span).await?;
        return Ok(());
    }
    let mut args = ArgValues::two(this_ref, name_str);
    args.pos.push(value);
    call_method(mx, scope, delegate, sym::SET_VALUE, args, span).await?;
    Ok(())
}

fn dynamic_handler(mx: &Mx, delegate: Value, getter: bool) -> Option<Value> {
    let heap = mx.heap.borrow();
    match delegate {
        Value::Ref(id) => match heap.get(id) {
            HeapData::Dynamic(d) => {
                if getter {
                    d.getter
                } else {
                    d.setter
                }
            }
            _ => None,
        },
        _ => None,
    }
}

/// A callable forwarding to `delegate.invoke(thisRef, name, args...)`
/// (reads of `fun f by delegate` members).
fn delegate_fun_value(mx: &Mx, delegate: Value, this_ref: Value, name_str: Value) -> Exec<Value> {
    let native = crate::function::NativeFn::new("delegated", move |mx, args, span| {
        let mut forwarded = ArgValues::empty();
        forwarded.pos.push(this_ref);
        forwarded.pos.push(name_str);
        forwarded.pos.extend(args.pos.iter().copied());
        forwarded.named = args.named;
        Box::pin(async move {
            let root = mx.root_scope;
            call_method(&mx, root, delegate, sym::INVOKE, forwarded, span).await
        })
    });
    mx.alloc(HeapData::Native(native))
}

// --- casts and throws ------------------------------------------------------

/// `expr as Class` - checked, and producing a view for qualified access
/// when casting an instance to one of its ancestor user classes.
pub(crate) fn cast_value(mx: &Mx, v: Value, class: ClassRef, span: Span) -> Exec<Value> {
    let (is_instance_of, underlying) = {
        let heap = mx.heap.borrow();
        let underlying = match v {
            Value::Ref(id) => match heap.get(id) {
                HeapData::View(view) => Some(view.target),
                _ => Some(v),
            },
            _ => Some(v),
        };
        let target = underlying.unwrap_or(v);
        (target.class_of(&heap).is_subclass_of(class, &heap), target)
    };
    if !is_instance_of {
        let (from, to) = {
            let heap = mx.heap.borrow();
            let interns = mx.interns.borrow();
            (
                v.type_name(&heap, &interns).into_owned(),
                class.name(&heap, &interns).into_owned(),
            )
        };
        return Err(mx.raise_at(
            CoreClass::ClassCastError,
            format!("{from} cannot be cast to {to}"),
            span,
        ));
    }
    let is_user_instance = {
        let heap = mx.heap.borrow();
        as_instance(&heap, underlying).is_some() && matches!(class, ClassRef::User(_))
    };
    if is_user_instance {
        mx.alloc(HeapData::View(CastView {
            target: underlying,
            class,
        }))
    } else {
        Ok(underlying)
    }
}

/// Converts a thrown value into a raise signal. Strings wrap into the
/// root error class; otherwise the value must descend from it.
pub(crate) fn throw_value(mx: &Mx, v: Value, span: Span) -> Flow {
    let heap = mx.heap.borrow();
    let interns = mx.interns.borrow();
    if let Some(text) = v.as_str(&heap, &interns) {
        let mut raised = Raised::new(ClassRef::Builtin(CoreClass::Exception), text);
        raised.span = Some(span);
        return Flow::Raise(Box::new(raised));
    }
    if let Value::Ref(id) = v {
        match heap.get(id) {
            HeapData::Exception(raised) => {
                let mut raised = raised.clone();
                raised.span.get_or_insert(span);
                raised.value = Some(v);
                return Flow::Raise(Box::new(raised));
            }
            HeapData::Instance(inst) => {
                let class = ClassRef::User(inst.class);
                if class.is_subclass_of(ClassRef::Builtin(CoreClass::Exception), &heap) {
                    let message = match inst.get(BUILTIN_BASE_UID, sym::MESSAGE) {
                        Some(InstSlot::Plain(m)) => {
                            crate::value::display(m, &heap, &interns)
                        }
                        _ => String::new(),
                    };
                    let mut raised = Raised::new(class, message);
                    raised.span = Some(span);
                    raised.value = Some(v);
                    return Flow::Raise(Box::new(raised));
                }
            }
            _ => {}
        }
    }
    let type_name = v.type_name(&heap, &interns).into_owned();
    drop(interns);
    drop(heap);
    mx.raise_at(
        CoreClass::IllegalArgumentError,
        format!("can only throw Exception values or String, got {type_name}"),
        span,
    )
}

// --- indexing --------------------------------------------------------------

/// Size of an indexable value (destructuring, slices).
pub(crate) async fn value_size(mx: &Mx, v: Value, span: Span) -> Exec<usize> {
    let builtin = {
        let heap = mx.heap.borrow();
        let interns = mx.interns.borrow();
        builtin_size(&heap, &interns, v)
    };
    if let Some(size) = builtin {
        return size;
    }
    // User classes expose a `size` member.
    let size = get_member(mx, mx.root_scope, v, sym::SIZE, span).await?;
    match size {
        Value::Int(i) if i >= 0 => Ok(i as usize),
        _ => Err(mx.raise_at(CoreClass::IllegalArgumentError, "size must be a non-negative Int", span)),
    }
}

fn builtin_size(
    heap: &Heap,
    interns: &crate::intern::Interns,
    v: Value,
) -> Option<Exec<usize>> {
    match v {
        Value::InternStr(_) => Some(Ok(v.as_str(heap, interns)?.chars().count())),
        Value::Ref(id) => match heap.get(id) {
            HeapData::Str(s) => Some(Ok(s.chars().count())),
            HeapData::List(list) => Some(Ok(list.items.len())),
            HeapData::Map(map) => Some(Ok(map.entries.len())),
            HeapData::Set(set) => Some(Ok(set.items.len())),
            HeapData::Buffer(buf) => Some(Ok(buf.bytes.len())),
            HeapData::Range(range) => Some(range.size().map(|s| s as usize)),
            _ => None,
        },
        _ => None,
    }
}

/// `a[i]` for an `Int` index, dispatching to `getAt` for user classes.
pub(crate) async fn indexed_get(
    mx: &Mx,
    scope: ScopeId,
    obj: Value,
    index: i64,
    span: Span,
) -> Exec<Value> {
    index_get(mx, scope, obj, Value::Int(index), span).await
}

/// `a[i]` - class-dispatched `getAt`.
pub(crate) async fn index_get(
    mx: &Mx,
    scope: ScopeId,
    obj: Value,
    index: Value,
    span: Span,
) -> Exec<Value> {
    if obj.is_null() {
        return Err(null_receiver(mx, "indexing", span));
    }

    let out = {
        let heap = mx.heap.borrow();
        let interns = mx.interns.borrow();
        if let Some(text) = obj.as_str(&heap, &interns) {
            str_index(text, index, &heap)?
        } else {
            match obj {
                Value::Ref(id) => match heap.get(id) {
                    HeapData::List(list) => match index {
                        Value::Int(i) => {
                            IndexOut::Value(list.items[normalize_index(i, list.items.len())?])
                        }
                        Value::Ref(rid) => match heap.get(rid) {
                            HeapData::Range(range) => {
                                let (start, end) = range_bounds(range, list.items.len())?;
                                IndexOut::List(list.items[start..end].to_vec())
                            }
                            _ => IndexOut::Unsupported,
                        },
                        _ => IndexOut::Unsupported,
                    },
                    HeapData::Map(map) => {
                        let Some(key) = index.as_str(&heap, &interns) else {
                            drop(interns);
                            drop(heap);
                            let type_name = {
                                let heap = mx.heap.borrow();
                                let interns = mx.interns.borrow();
                                index.type_name(&heap, &interns).into_owned()
                            };
                            return Err(non_string_key(&type_name).with_span(span));
                        };
                        IndexOut::Value(map.entries.get(key).copied().unwrap_or(Value::Null))
                    }
                    HeapData::Buffer(buf) => match index {
                        Value::Int(i) => {
                            IndexOut::Value(Value::Int(i64::from(buf.bytes[normalize_index(i, buf.bytes.len())?])))
                        }
                        Value::Ref(rid) => match heap.get(rid) {
                            HeapData::Range(range) => {
                                let (start, end) = range_bounds(range, buf.bytes.len())?;
                                IndexOut::Buffer(buf.bytes[start..end].to_vec())
                            }
                            _ => IndexOut::Unsupported,
                        },
                        _ => IndexOut::Unsupported,
                    },
                    HeapData::Range(range) => match index {
                        Value::Int(i) => IndexOut::Value(range.get_at(i)?),
                        _ => IndexOut::Unsupported,
                    },
                    HeapData::Entry(k, v) => match index {
                        Value::Int(0) => IndexOut::Value(*k),
                        Value::Int(1) => IndexOut::Value(*v),
                        _ => IndexOut::Unsupported,
                    },
                    HeapData::Instance(_) | HeapData::View(_) => IndexOut::Method,
                    HeapData::Dynamic(_) => IndexOut::Dynamic,
                    _ => IndexOut::Unsupported,
                },
                _ => IndexOut::Unsupported,
            }
        }
    };

    match out {
        IndexOut::Value(v) => Ok(v),
        IndexOut::Str(s) => mx.alloc_str(s),
        IndexOut::StrOrNull(Some(s)) => mx.alloc_str(s),
        IndexOut::StrOrNull(None) => Ok(Value::Null),
        IndexOut::List(items) => mx.alloc(HeapData::List(List::of(items))),
        IndexOut::Buffer(bytes) => mx.alloc(HeapData::Buffer(crate::types::buffer::BufferData::of(bytes))),
        IndexOut::Method => call_method(mx, scope, obj, sym::GET_AT, ArgValues::one(index), span).await,
        IndexOut::Dynamic => {
            let getter = dynamic_handler(mx, obj, true)
                .ok_or_else(|| mx.raise_at(CoreClass::IllegalOperationError, "dynamic object has no get handler", span))?;
            call_value(mx, getter, ArgValues::one(index), span).await
        }
        IndexOut::Unsupported => {
            let type_name = {
                let heap = mx.heap.borrow();
                let interns = mx.interns.borrow();
                obj.type_name(&heap, &interns).into_owned()
            };
            Err(mx.raise_at(
                CoreClass::IllegalOperationError,
                format!("{type_name} does not support this index"),
                span,
            ))
        }
    }
}

fn str_index(text: &str, index: Value, heap: &Heap) -> Result<IndexOut, Flow> {
    match index {
        Value::Int(i) => {
            let len = text.chars().count();
            let idx = normalize_index(i, len)?;
            let c = text.chars().nth(idx).expect("index validated");
            Ok(IndexOut::Value(Value::Char(c)))
        }
        Value::Ref(id) => match heap.get(id) {
            HeapData::Range(range) => {
                let len = text.chars().count();
                let (start, end) = range_bounds(range, len)?;
                let s: String = text.chars().skip(start).take(end - start).collect();
                Ok(IndexOut::Str(s))
            }
            HeapData::Regex(re) => Ok(IndexOut::StrOrNull(
                re.first_match(text).map(ToOwned::to_owned),
            )),
            _ => Ok(IndexOut::Unsupported),
        },
        _ => Ok(IndexOut::Unsupported),
    }
}

/// Slice bounds of a range against a container size: start defaults to 0,
/// end to `size`, inclusive ends extend by one, negatives normalise.
fn range_bounds(range: &RangeData, size: usize) -> Exec<(usize, usize)> {
    let start = match range.start {
        None => 0,
        Some(Value::Int(i)) => normalize_bound(i, size)?,
        Some(_) => 0,
    };
    let end = match range.end {
        None => size,
        Some(Value::Int(i)) => {
            let e = normalize_bound(i, size)?;
            if range.inclusive { (e + 1).min(size) } else { e }
        }
        Some(_) => size,
    };
    Ok((start, end.max(start)))
}

/// `a[i] = v` - class-dispatched `putAt`.
pub(crate) async fn index_set(
    mx: &Mx,
    scope: ScopeId,
    obj: Value,
    index: Value,
    value: Value,
    span: Span,
) -> Exec<()> {
    if obj.is_null() {
        return Err(null_receiver(mx, "indexed assignment", span));
    }
    enum Out {
        Done,
        Method,
        Dynamic,
        Unsupported,
    }
    let out = {
        let mut heap = mx.heap.borrow_mut();
        match obj {
            Value::Ref(id) => {
                // Read map keys before the mutable access below.
                let key = {
                    let interns = mx.interns.borrow();
                    index.as_str(&heap, &interns).map(ToOwned::to_owned)
                };
                match heap.get_mut(id) {
                    HeapData::List(list) => match index {
                        Value::Int(i) => {
                            list.check_mutable()?;
                            let idx = normalize_index(i, list.items.len())?;
                            list.items[idx] = value;
                            Out::Done
                        }
                        _ => Out::Unsupported,
                    },
                    HeapData::Map(map) => {
                        map.check_mutable()?;
                        match key {
                            Some(k) => {
                                map.put(k, value);
                                Out::Done
                            }
                            None => {
                                drop(heap);
                                let type_name = {
                                    let heap = mx.heap.borrow();
                                    let interns = mx.interns.borrow();
                                    index.type_name(&heap, &interns).into_owned()
                                };
                                return Err(non_string_key(&type_name).with_span(span));
                            }
                        }
                    }
                    HeapData::Buffer(buf) => match (index, value) {
                        (Value::Int(i), Value::Int(byte)) => {
                            buf.check_mutable()?;
                            let idx = normalize_index(i, buf.bytes.len())?;
                            buf.put(idx, byte)?;
                            Out::Done
                        }
                        _ => Out::Unsupported,
                    },
                    HeapData::Instance(_) | HeapData::View(_) => Out::Method,
                    HeapData::Dynamic(_) => Out::Dynamic,
                    _ => Out::Unsupported,
                }
            }
            _ => Out::Unsupported,
        }
    };
    match out {
        Out::Done => Ok(()),
        Out::Method => {
            call_method(mx, scope, obj, sym::PUT_AT, ArgValues::two(index, value), span).await?;
            Ok(())
        }
        Out::Dynamic => {
            let setter = dynamic_handler(mx, obj, false).ok_or_else(|| {
                mx.raise_at(CoreClass::IllegalOperationError, "dynamic object has no set handler", span)
            })?;
            call_value(mx, setter, ArgValues::two(index, value), span).await?;
            Ok(())
        }
        Out::Unsupported => {
            let type_name = {
                let heap = mx.heap.borrow();
                let interns = mx.interns.borrow();
                obj.type_name(&heap, &interns).into_owned()
            };
            Err(mx.raise_at(
                CoreClass::IllegalOperationError,
                format!("{type_name} does not support indexed assignment"),
                span,
            ))
        }
    }
}

/// Outcome of the synchronous indexing phase; allocation and method
/// dispatch happen after all borrows are released.
enum IndexOut {
    Value(Value),
    Str(String),
    StrOrNull(Option<String>),
    List(Vec<Value>),
    Buffer(Vec<u8>),
    Method,
    Dynamic,
    Unsupported,
}
