//! Class creation and instance construction.
//!
//! Classes compute their C3 linearization at creation time. Construction
//! walks parents depth-first with a visited set keyed by class uid, so a
//! diamond parent is initialised exactly once and every class sees fully
//! initialised parents before its own field initialisers and `init`
//! blocks run.

use ahash::AHashSet;
use async_recursion::async_recursion;
use std::rc::Rc;

use crate::{
    args::ArgValues,
    exceptions::{Exec, Raised},
    function::{bind_args, call_function, make_function},
    heap::{HeapData, HeapId},
    intern::{StringId, sym},
    machine::Mx,
    nodes::{ClassDef, EnumDef, Signature, Visibility},
    scope::{FrameKind, ScopeId},
    source::Span,
    types::{
        class::{
            ClassObject, ClassRef, CoreClass, InstSlot, Instance, Member, MemberKind, RuntimeBase,
            c3_linearize, fresh_class_uid,
        },
        list::List,
        map::MapData,
        range::RangeData,
        re::RegexData,
        set::SetData,
    },
    value::{Value, value_key},
};

use super::{attr, attr::BUILTIN_BASE_UID, eval_args, exec, expect_class};

/// Evaluates a `class` / `object` / `interface` declaration: builds the
/// class value and binds it (for `object`, binds the eager singleton).
pub(crate) async fn create_class(
    mx: &Mx,
    def: &Rc<ClassDef>,
    scope: ScopeId,
    span: Span,
) -> Exec<Value> {
    let class_value = create_class_value(mx, def, scope, span).await?;
    let bound = if def.is_object {
        let singleton = construct_class(
            mx,
            expect_class(mx, class_value, span)?,
            ArgValues::empty(),
            span,
        )
        .await?;
        if let Value::Class(ClassRef::User(class_id)) = class_value {
            let mut heap = mx.heap.borrow_mut();
            if let HeapData::Class(c) = heap.get_mut(class_id) {
                c.singleton = Some(singleton);
            }
        }
        singleton
    } else {
        class_value
    };
    mx.scopes
        .borrow_mut()
        .declare(scope, def.name, crate::scope::Record::immutable(bound));
    Ok(bound)
}

/// Builds the class object without binding its name (shared by top-level
/// and nested class declarations).
#[async_recursion(?Send)]
pub(crate) async fn create_class_value(
    mx: &Mx,
    def: &Rc<ClassDef>,
    scope: ScopeId,
    span: Span,
) -> Exec<Value> {
    let uid = fresh_class_uid();
    // The class (and its methods) capture the declaration scope.
    mx.closures_made.set(mx.closures_made.get() + 1);

    let class_id = {
        let placeholder = ClassObject {
            name: def.name,
            uid,
            def: Some(Rc::clone(def)),
            sig: Rc::clone(&def.sig),
            bases: Vec::new(),
            lin: Vec::new(),
            members: ahash::AHashMap::new(),
            statics: ahash::AHashMap::new(),
            decl_scope: scope,
            is_abstract: def.is_abstract || def.is_interface,
            is_open: def.is_open || def.is_interface || def.is_abstract,
            is_enum: false,
            singleton: None,
            entries: Vec::new(),
        };
        match mx.alloc(HeapData::Class(placeholder))? {
            Value::Ref(id) => id,
            _ => unreachable!("alloc returns a ref"),
        }
    };

    // Resolve direct bases in declaration order.
    let mut base_refs = Vec::with_capacity(def.bases.len());
    let mut runtime_bases = Vec::with_capacity(def.bases.len());
    for (i, base) in def.bases.iter().enumerate() {
        let v = exec(&base.expr, mx, scope).await?;
        let class = expect_class(mx, v, base.expr.span)?;
        base_refs.push(class);
        runtime_bases.push(RuntimeBase {
            class,
            args_index: i,
        });
    }
    let lin_rest = {
        let heap = mx.heap.borrow();
        c3_linearize(&heap, &base_refs)
    }
    .map_err(|msg| mx.raise_at(CoreClass::IllegalOperationError, msg, span))?;
    let mut lin = Vec::with_capacity(lin_rest.len() + 1);
    lin.push(ClassRef::User(class_id));
    lin.extend(lin_rest);

    // Member table: promoted header params, fields, methods, properties.
    let mut members: ahash::AHashMap<StringId, Member> = ahash::AHashMap::new();
    let mut has_abstract = false;
    for param in &def.sig.params {
        if let Some(promote) = param.promote {
            members.insert(
                param.name,
                Member {
                    kind: MemberKind::Field {
                        mutable: promote.mutable,
                    },
                    visibility: promote.visibility,
                },
            );
        }
    }
    for field in &def.fields {
        let kind = if field.delegate.is_some() {
            MemberKind::Delegated { fun: false }
        } else {
            MemberKind::Field {
                mutable: field.mutable,
            }
        };
        members.insert(
            field.name,
            Member {
                kind,
                visibility: field.visibility,
            },
        );
    }
    for method in &def.methods {
        let name = method
            .def
            .name
            .expect("parser guarantees named methods in class bodies");
        if method.is_abstract {
            has_abstract = true;
            members.insert(
                name,
                Member {
                    kind: MemberKind::Abstract,
                    visibility: method.visibility,
                },
            );
            continue;
        }
        if method.def.delegate.is_some() {
            members.insert(
                name,
                Member {
                    kind: MemberKind::Delegated { fun: true },
                    visibility: method.visibility,
                },
            );
            continue;
        }
        let f = make_function(mx, &method.def, scope, Some((uid, class_id)))?;
        if method.is_static {
            let mut heap = mx.heap.borrow_mut();
            if let HeapData::Class(c) = heap.get_mut(class_id) {
                c.statics.insert(name, f);
            }
            continue;
        }
        members.insert(
            name,
            Member {
                kind: MemberKind::Method(f),
                visibility: method.visibility,
            },
        );
    }
    for prop in &def.props {
        let getter = match &prop.getter {
            Some(g) => Some(make_function(mx, g, scope, Some((uid, class_id)))?),
            None => None,
        };
        let setter = match &prop.setter {
            Some(s) => Some(make_function(mx, s, scope, Some((uid, class_id)))?),
            None => None,
        };
        members.insert(
            prop.name,
            Member {
                kind: MemberKind::Property { getter, setter },
                visibility: prop.visibility,
            },
        );
    }

    // Statics and nested classes evaluate at class-creation time.
    for field in &def.statics {
        let value = match &field.init {
            Some(init) => exec(init, mx, scope).await?,
            None => Value::Unset,
        };
        let mut heap = mx.heap.borrow_mut();
        if let HeapData::Class(c) = heap.get_mut(class_id) {
            c.statics.insert(field.name, value);
        }
    }
    for nested in &def.nested {
        let nested_value = create_class_value(mx, nested, scope, span).await?;
        let mut heap = mx.heap.borrow_mut();
        if let HeapData::Class(c) = heap.get_mut(class_id) {
            c.statics.insert(nested.name, nested_value);
        }
    }

    {
        let mut heap = mx.heap.borrow_mut();
        if let HeapData::Class(c) = heap.get_mut(class_id) {
            c.bases = runtime_bases;
            c.lin = lin;
            c.members = members;
            if has_abstract {
                c.is_abstract = true;
            }
        }
    }
    Ok(Value::Class(ClassRef::User(class_id)))
}

/// Evaluates an `enum` declaration: each entry is a singleton instance
/// carrying `ordinal` and `name`; `entries` is a frozen list in
/// declaration order.
pub(crate) async fn create_enum(
    mx: &Mx,
    def: &Rc<EnumDef>,
    scope: ScopeId,
    _span: Span,
) -> Exec<Value> {
    let uid = fresh_class_uid();
    let class_id = {
        let class = ClassObject {
            name: def.name,
            uid,
            def: None,
            sig: Rc::new(Signature::empty()),
            bases: Vec::new(),
            lin: vec![
                ClassRef::Builtin(CoreClass::Enum),
                ClassRef::Builtin(CoreClass::Obj),
            ],
            members: ahash::AHashMap::new(),
            statics: ahash::AHashMap::new(),
            decl_scope: scope,
            is_abstract: false,
            is_open: false,
            is_enum: true,
            singleton: None,
            entries: Vec::new(),
        };
        match mx.alloc(HeapData::Class(class))? {
            Value::Ref(id) => id,
            _ => unreachable!("alloc returns a ref"),
        }
    };
    {
        let mut heap = mx.heap.borrow_mut();
        if let HeapData::Class(c) = heap.get_mut(class_id) {
            c.lin.insert(0, ClassRef::User(class_id));
            let field = |name| {
                (
                    name,
                    Member {
                        kind: MemberKind::Field { mutable: false },
                        visibility: Visibility::Public,
                    },
                )
            };
            c.members.extend([field(sym::NAME), field(sym::ORDINAL)]);
        }
    }

    let mut entries = Vec::with_capacity(def.entries.len());
    for (ordinal, entry_name) in def.entries.iter().enumerate() {
        let name_value = mx.alloc_str(mx.name_of(*entry_name))?;
        let mut inst = Instance::new(class_id);
        inst.set(uid, sym::NAME, InstSlot::Plain(name_value));
        inst.set(uid, sym::ORDINAL, InstSlot::Plain(Value::Int(ordinal as i64)));
        let entry = mx.alloc(HeapData::Instance(inst))?;
        entries.push(entry);
        let mut heap = mx.heap.borrow_mut();
        if let HeapData::Class(c) = heap.get_mut(class_id) {
            c.statics.insert(*entry_name, entry);
        }
    }
    let mut entries_list = List::of(entries.clone());
    entries_list.frozen = true;
    let entries_value = mx.alloc(HeapData::List(entries_list))?;
    {
        let mut heap = mx.heap.borrow_mut();
        if let HeapData::Class(c) = heap.get_mut(class_id) {
            c.statics.insert(sym::ENTRIES, entries_value);
            c.entries = entries;
        }
    }

    let class_value = Value::Class(ClassRef::User(class_id));
    mx.scopes
        .borrow_mut()
        .declare(scope, def.name, crate::scope::Record::immutable(class_value));
    Ok(class_value)
}

/// Calls a class value: builtin constructors or user instantiation.
pub(crate) async fn construct_class(
    mx: &Mx,
    class: ClassRef,
    args: ArgValues,
    span: Span,
) -> Exec<Value> {
    match class {
        ClassRef::Builtin(core) => construct_builtin(mx, core, args, span),
        ClassRef::User(class_id) => {
            let (is_abstract, is_enum, singleton, name) = {
                let heap = mx.heap.borrow();
                let interns = mx.interns.borrow();
                match heap.get(class_id) {
                    HeapData::Class(c) => (
                        c.is_abstract,
                        c.is_enum,
                        c.singleton,
                        interns.get(c.name).to_owned(),
                    ),
                    _ => (false, false, None, String::new()),
                }
            };
            if let Some(singleton) = singleton {
                return Ok(singleton);
            }
            if is_abstract {
                return Err(mx.raise_at(
                    CoreClass::IllegalOperationError,
                    format!("cannot instantiate abstract class {name}"),
                    span,
                ));
            }
            if is_enum {
                return Err(mx.raise_at(
                    CoreClass::IllegalOperationError,
                    format!("cannot instantiate enum class {name}"),
                    span,
                ));
            }
            let inst_value = mx.alloc(HeapData::Instance(Instance::new(class_id)))?;
            let mut visited = AHashSet::new();
            construct_into(mx, inst_value, class_id, args, &mut visited, span).await?;
            Ok(inst_value)
        }
    }
}

fn set_field(mx: &Mx, inst_value: Value, uid: u64, name: StringId, slot: InstSlot) {
    if let Value::Ref(id) = inst_value {
        let mut heap = mx.heap.borrow_mut();
        if let HeapData::Instance(inst) = heap.get_mut(id) {
            inst.set(uid, name, slot);
        }
    }
}

/// Runs one class's part of instance construction: bind header params,
/// initialise parents (diamonds once), then own fields and `init` blocks.
#[async_recursion(?Send)]
async fn construct_into(
    mx: &Mx,
    inst_value: Value,
    class_id: HeapId,
    args: ArgValues,
    visited: &mut AHashSet<u64>,
    span: Span,
) -> Exec<()> {
    let (uid, sig, def, decl_scope, bases) = {
        let heap = mx.heap.borrow();
        let HeapData::Class(c) = heap.get(class_id) else {
            drop(heap);
            return Err(mx.raise_at(CoreClass::IllegalStateError, "not a class", span));
        };
        (
            c.uid,
            Rc::clone(&c.sig),
            c.def.clone(),
            c.decl_scope,
            c.bases.clone(),
        )
    };
    visited.insert(uid);

    let frame = mx.push_frame(decl_scope, FrameKind::Call);
    {
        let mut scopes = mx.scopes.borrow_mut();
        let f = scopes.get_mut(frame);
        f.this_obj = Some(inst_value);
        f.owner_class = Some((uid, class_id));
    }
    bind_args(mx, frame, &sig, args, span).await?;

    // Header `val`/`var` params become instance fields.
    for param in &sig.params {
        if param.promote.is_some() {
            let value = mx
                .scopes
                .borrow()
                .find_local(frame, param.name)
                .map(|r| match r.slot {
                    crate::scope::Slot::Plain(v) => v,
                    _ => Value::Unset,
                })
                .unwrap_or(Value::Unset);
            set_field(mx, inst_value, uid, param.name, InstSlot::Plain(value));
        }
    }

    // Parents, in declaration order; each visited exactly once.
    for base in &bases {
        match base.class {
            ClassRef::Builtin(CoreClass::Exception) => {
                if let Some(def) = &def
                    && let Some(base_decl) = def.bases.get(base.args_index)
                {
                    let base_args = eval_args(mx, frame, &base_decl.args, span).await?;
                    let mut pos = base_args.pos.into_iter();
                    if let Some(message) = pos.next() {
                        set_field(
                            mx,
                            inst_value,
                            BUILTIN_BASE_UID,
                            sym::MESSAGE,
                            InstSlot::Plain(message),
                        );
                    }
                    if let Some(cause) = pos.next() {
                        set_field(
                            mx,
                            inst_value,
                            BUILTIN_BASE_UID,
                            sym::CAUSE,
                            InstSlot::Plain(cause),
                        );
                    }
                }
            }
            ClassRef::Builtin(_) => {}
            ClassRef::User(base_id) => {
                let base_uid = {
                    let heap = mx.heap.borrow();
                    match heap.get(base_id) {
                        HeapData::Class(c) => c.uid,
                        _ => continue,
                    }
                };
                if visited.contains(&base_uid) {
                    continue;
                }
                let base_args = match &def {
                    Some(def) => match def.bases.get(base.args_index) {
                        Some(base_decl) => eval_args(mx, frame, &base_decl.args, span).await?,
                        None => ArgValues::empty(),
                    },
                    None => ArgValues::empty(),
                };
                construct_into(mx, inst_value, base_id, base_args, visited, span).await?;
            }
        }
    }

    // Own field initialisers, then init blocks and stray body statements.
    if let Some(def) = &def {
        for field in &def.fields {
            if let Some(delegate_expr) = &field.delegate {
                let delegate = exec(delegate_expr, mx, frame).await?;
                let access = if field.mutable { "var" } else { "val" };
                let delegate =
                    attr::bind_delegate(mx, frame, delegate, field.name, access, span).await?;
                set_field(mx, inst_value, uid, field.name, InstSlot::Delegated(delegate));
                continue;
            }
            let value = match &field.init {
                Some(init) => exec(init, mx, frame).await?,
                None => Value::Unset,
            };
            set_field(mx, inst_value, uid, field.name, InstSlot::Plain(value));
        }
        for method in &def.methods {
            if let Some(delegate_expr) = &method.def.delegate {
                let name = method.def.name.expect("parser guarantees named methods");
                let delegate = exec(delegate_expr, mx, frame).await?;
                let delegate = attr::bind_delegate(mx, frame, delegate, name, "fun", span).await?;
                set_field(mx, inst_value, uid, name, InstSlot::Delegated(delegate));
            }
        }
        for init in &def.inits {
            exec(init, mx, frame).await?;
        }
    }

    // Construction frames stay out of the pool: field initialisers and
    // init blocks routinely create closures that capture them.
    Ok(())
}

/// Builtin class constructors.
fn construct_builtin(mx: &Mx, core: CoreClass, args: ArgValues, span: Span) -> Exec<Value> {
    match core {
        CoreClass::List => {
            let items: Vec<Value> = args.pos.to_vec();
            mx.alloc(HeapData::List(List::of(items)))
        }
        CoreClass::Set => {
            let mut set = SetData::default();
            {
                let heap = mx.heap.borrow();
                let interns = mx.interns.borrow();
                for v in &args.pos {
                    set.add(value_key(*v, &heap, &interns), *v);
                }
            }
            mx.alloc(HeapData::Set(set))
        }
        CoreClass::Map => {
            let mut map = MapData::default();
            let entries: Vec<(String, Value)> = {
                let heap = mx.heap.borrow();
                let interns = mx.interns.borrow();
                let mut out = Vec::with_capacity(args.pos.len());
                for v in &args.pos {
                    let Value::Ref(id) = *v else {
                        drop(interns);
                        drop(heap);
                        return Err(mx.raise_at(
                            CoreClass::IllegalArgumentError,
                            "Map() takes entry arguments (key => value)",
                            span,
                        ));
                    };
                    let HeapData::Entry(k, val) = heap.get(id) else {
                        drop(interns);
                        drop(heap);
                        return Err(mx.raise_at(
                            CoreClass::IllegalArgumentError,
                            "Map() takes entry arguments (key => value)",
                            span,
                        ));
                    };
                    let Some(key) = k.as_str(&heap, &interns) else {
                        let type_name = k.type_name(&heap, &interns).into_owned();
                        drop(interns);
                        drop(heap);
                        return Err(crate::types::map::non_string_key(&type_name).with_span(span));
                    };
                    out.push((key.to_owned(), *val));
                }
                out
            };
            for (k, v) in entries {
                map.put(k, v);
            }
            mx.alloc(HeapData::Map(map))
        }
        CoreClass::Buffer => construct_buffer(mx, args, span),
        CoreClass::Range => {
            let (start, end) = args.get_two("Range")?;
            mx.alloc(HeapData::Range(RangeData {
                start: Some(start),
                end: Some(end),
                inclusive: false,
            }))
        }
        CoreClass::Regex => {
            let pattern = args.get_one("Regex")?;
            let text = {
                let heap = mx.heap.borrow();
                let interns = mx.interns.borrow();
                pattern.as_str(&heap, &interns).map(ToOwned::to_owned)
            };
            let Some(text) = text else {
                return Err(mx.raise_at(
                    CoreClass::IllegalArgumentError,
                    "Regex() takes a String pattern",
                    span,
                ));
            };
            let compiled = RegexData::compile(&text)?;
            mx.alloc(HeapData::Regex(compiled))
        }
        CoreClass::Mutex => {
            args.check_zero("Mutex")?;
            mx.alloc(HeapData::Mutex(crate::tasks::MutexState::default()))
        }
        CoreClass::Deferred => {
            args.check_zero("CompletableDeferred")?;
            mx.alloc(HeapData::Deferred(crate::tasks::Deferred::pending()))
        }
        CoreClass::Channel => {
            let capacity = match args.get_zero_one("Channel")? {
                Some(Value::Int(n)) if n >= 0 => n as usize,
                Some(_) => {
                    return Err(mx.raise_at(
                        CoreClass::IllegalArgumentError,
                        "Channel() capacity must be a non-negative Int",
                        span,
                    ));
                }
                None => 0,
            };
            mx.alloc(HeapData::Channel(crate::tasks::ChannelState::with_capacity(
                capacity,
            )))
        }
        CoreClass::Int => {
            let v = args.get_one("Int")?;
            let converted = {
                let heap = mx.heap.borrow();
                let interns = mx.interns.borrow();
                match v {
                    Value::Int(i) => Some(i),
                    Value::Real(r) => Some(r as i64),
                    Value::Char(c) => Some(i64::from(c as u32)),
                    Value::Bool(b) => Some(i64::from(b)),
                    _ => v.as_str(&heap, &interns).and_then(|s| s.trim().parse().ok()),
                }
            };
            converted.map(Value::Int).ok_or_else(|| {
                mx.raise_at(CoreClass::IllegalArgumentError, "cannot convert to Int", span)
            })
        }
        CoreClass::Real => {
            let v = args.get_one("Real")?;
            let converted = {
                let heap = mx.heap.borrow();
                let interns = mx.interns.borrow();
                match v {
                    Value::Int(i) => Some(i as f64),
                    Value::Real(r) => Some(r),
                    _ => v.as_str(&heap, &interns).and_then(|s| s.trim().parse().ok()),
                }
            };
            converted.map(Value::Real).ok_or_else(|| {
                mx.raise_at(CoreClass::IllegalArgumentError, "cannot convert to Real", span)
            })
        }
        CoreClass::Str => {
            let v = args.get_one("String")?;
            mx.alloc_str(mx.display(v))
        }
        CoreClass::Char => {
            let v = args.get_one("Char")?;
            match v {
                Value::Char(_) => Ok(v),
                Value::Int(i) => u32::try_from(i)
                    .ok()
                    .and_then(char::from_u32)
                    .map(Value::Char)
                    .ok_or_else(|| {
                        mx.raise_at(
                            CoreClass::IllegalArgumentError,
                            "Char() code point out of range",
                            span,
                        )
                    }),
                _ => Err(mx.raise_at(
                    CoreClass::IllegalArgumentError,
                    "Char() takes a code point Int",
                    span,
                )),
            }
        }
        core if core.is_error() => {
            let message = match args.get_zero_one(<&'static str>::from(core))? {
                Some(v) => mx.display(v),
                None => String::new(),
            };
            let raised = Raised::new(ClassRef::Builtin(core), message);
            mx.alloc(HeapData::Exception(raised))
        }
        other => {
            let name: &'static str = other.into();
            Err(mx.raise_at(
                CoreClass::IllegalOperationError,
                format!("cannot instantiate {name}"),
                span,
            ))
        }
    }
}

fn construct_buffer(mx: &Mx, args: ArgValues, span: Span) -> Exec<Value> {
    let bytes: Option<Vec<u8>> = {
        let heap = mx.heap.borrow();
        match args.pos.as_slice() {
            [Value::Int(size)] => usize::try_from(*size).ok().map(|n| vec![0u8; n]),
            [Value::Ref(id)] => match heap.get(*id) {
                HeapData::List(list) => list
                    .items
                    .iter()
                    .map(|v| match v {
                        Value::Int(i) => u8::try_from(*i).ok(),
                        _ => None,
                    })
                    .collect(),
                _ => None,
            },
            many => many
                .iter()
                .map(|v| match v {
                    Value::Int(i) => u8::try_from(*i).ok(),
                    _ => None,
                })
                .collect(),
        }
    };
    match bytes {
        Some(bytes) => mx.alloc(HeapData::Buffer(crate::types::buffer::BufferData::of(bytes))),
        None => Err(mx.raise_at(
            CoreClass::IllegalArgumentError,
            "Buffer() takes a size or bytes in 0..255",
            span,
        )),
    }
}

/// `super.m(args)` - dispatch starting after the current method's
/// declaring class in the receiver's linearization.
pub(crate) async fn super_call(
    mx: &Mx,
    scope: ScopeId,
    name: StringId,
    args: ArgValues,
    span: Span,
) -> Exec<Value> {
    let this = mx
        .scopes
        .borrow()
        .find_this(scope)
        .ok_or_else(|| mx.raise_at(CoreClass::IllegalStateError, "no 'this' in scope", span))?;
    let Some((_, owner_class_id)) = mx.scopes.borrow().find_owner_class(scope) else {
        return Err(mx.raise_at(
            CoreClass::IllegalOperationError,
            "'super' outside of a class body",
            span,
        ));
    };
    let found = {
        let heap = mx.heap.borrow();
        let this_class = this.class_of(&heap);
        ClassObject::find_member_after(&heap, this_class, ClassRef::User(owner_class_id), name)
    };
    match found {
        Some((
            _,
            Member {
                kind: MemberKind::Method(Value::Ref(fid)),
                ..
            },
        )) => call_function(mx, fid, Some(this), args, span, Vec::new()).await,
        Some(_) => Err(mx.raise_at(
            CoreClass::IllegalOperationError,
            "super member is not a method",
            span,
        )),
        None => attr::obj_default_method(mx, scope, this, name, args, span).await,
    }
}
