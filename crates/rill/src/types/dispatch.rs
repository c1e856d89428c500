//! Builtin type methods and properties.
//!
//! Every operator and method on a builtin value funnels through one of
//! the dispatch entry points here; the evaluator falls back to this table
//! after user-class members. `Ok(None)` means "this class has no such
//! member" so the caller can raise `SymbolNotDefinedError` with the
//! receiver's type in the message.

use crate::{
    args::ArgValues,
    eval::{self, binary},
    exceptions::{Exec, Flow},
    function::{NativeFn, call_function, call_value},
    heap::{HeapData, HeapId},
    intern::{StringId, sym},
    machine::Mx,
    scope::ScopeId,
    source::Span,
    tasks::{
        AwaitDeferred, ChannelRecv, ChannelSend, LockMutex, cancel_deferred, channel_close,
        complete_deferred, mutex_unlock,
    },
    types::{
        class::{ClassRef, CoreClass},
        flow::{FlowData, FlowOp},
        iter::{self, IterState},
        list::List,
    },
    value::{Value, value_key},
};

/// Method names per builtin class, used to answer "is this callable"
/// before a bound method value is materialised.
fn method_names(core: CoreClass) -> &'static [&'static str] {
    const COMMON: &[&str] = &["toString", "contains"];
    match core {
        CoreClass::List => &[
            "toString", "contains", "isEmpty", "isNotEmpty", "freeze", "iterator", "toList",
            "add", "addAll", "removeAt", "insertAt", "indexOf", "first", "last", "forEach",
            "map", "filter", "take", "drop", "sorted", "reversed", "joinToString",
        ],
        CoreClass::Str => &[
            "toString", "contains", "isEmpty", "isNotEmpty", "iterator", "toList", "indexOf",
            "startsWith", "endsWith", "trim", "uppercase", "lowercase", "split", "toInt",
            "toReal",
        ],
        CoreClass::Map => &[
            "toString", "contains", "isEmpty", "isNotEmpty", "freeze", "iterator", "toList",
            "put", "remove", "keys", "values", "entries", "forEach",
        ],
        CoreClass::Set => &[
            "toString", "contains", "isEmpty", "isNotEmpty", "freeze", "iterator", "toList",
            "add", "remove", "forEach",
        ],
        CoreClass::Range => &["toString", "contains", "isEmpty", "isNotEmpty", "iterator", "toList"],
        CoreClass::Buffer => &["toString", "contains", "isEmpty", "isNotEmpty", "freeze", "iterator", "toList"],
        CoreClass::Iterator => &["toString", "hasNext", "next", "cancelIteration"],
        CoreClass::Int => &["toString", "contains", "toReal", "toChar", "abs"],
        CoreClass::Real => &["toString", "contains", "toInt", "abs"],
        CoreClass::Deferred => &["toString", "await", "cancel", "complete"],
        CoreClass::Mutex => &["toString", "lock", "unlock", "withLock"],
        CoreClass::Channel => &["toString", "send", "receive", "close"],
        CoreClass::Flow => &["toString", "collect", "take", "map", "toList"],
        _ => COMMON,
    }
}

pub(crate) fn is_builtin_method(mx: &Mx, recv: Value, name: &str) -> bool {
    let core = {
        let heap = mx.heap.borrow();
        match recv.class_of(&heap) {
            ClassRef::Builtin(core) => core,
            ClassRef::User(_) => return false,
        }
    };
    method_names(core).contains(&name)
}

/// Zero-argument builtin properties read without parentheses, plus bound
/// method values for known method names.
pub(crate) fn builtin_member_get(
    mx: &Mx,
    recv: Value,
    name: StringId,
    span: Span,
) -> Exec<Option<Value>> {
    let name_text = mx.name_of(name);
    let prop = {
        let heap = mx.heap.borrow();
        let interns = mx.interns.borrow();
        match (name_text.as_str(), recv) {
            ("size" | "length", _) => match recv {
                Value::InternStr(_) => Some(PropOut::Int(
                    recv.as_str(&heap, &interns).map_or(0, |s| s.chars().count() as i64),
                )),
                Value::Ref(id) => match heap.get(id) {
                    HeapData::Str(s) => Some(PropOut::Int(s.chars().count() as i64)),
                    HeapData::List(l) => Some(PropOut::Int(l.items.len() as i64)),
                    HeapData::Map(m) => Some(PropOut::Int(m.entries.len() as i64)),
                    HeapData::Set(s) => Some(PropOut::Int(s.items.len() as i64)),
                    HeapData::Buffer(b) => Some(PropOut::Int(b.bytes.len() as i64)),
                    HeapData::Range(r) => Some(PropOut::Fallible(r.size())),
                    _ => None,
                },
                _ => None,
            },
            ("code", Value::Char(c)) => Some(PropOut::Int(i64::from(c as u32))),
            _ => match recv {
                Value::Ref(id) => match (heap.get(id), name_text.as_str()) {
                    (HeapData::Range(r), "start") => Some(PropOut::Value(r.start.unwrap_or(Value::Null))),
                    (HeapData::Range(r), "end") => Some(PropOut::Value(r.end.unwrap_or(Value::Null))),
                    (HeapData::Range(r), "endInclusive") => Some(PropOut::Value(Value::Bool(r.inclusive))),
                    (HeapData::Entry(k, _), "key") => Some(PropOut::Value(*k)),
                    (HeapData::Entry(_, v), "value") => Some(PropOut::Value(*v)),
                    (HeapData::Deferred(d), "isActive") => Some(PropOut::Value(Value::Bool(d.is_active()))),
                    (HeapData::Deferred(d), "isCompleted") => {
                        Some(PropOut::Value(Value::Bool(d.is_completed())))
                    }
                    (HeapData::Mutex(m), "isLocked") => Some(PropOut::Value(Value::Bool(m.locked))),
                    _ => None,
                },
                _ => None,
            },
        }
    };
    match prop {
        Some(PropOut::Value(v)) => return Ok(Some(v)),
        Some(PropOut::Int(i)) => return Ok(Some(Value::Int(i))),
        Some(PropOut::Fallible(r)) => return Ok(Some(Value::Int(r.map_err(|e| e.with_span(span))?))),
        None => {}
    }

    if is_builtin_method(mx, recv, &name_text) {
        // Reading a method as a value yields a callable bound to the
        // receiver.
        let native = NativeFn::new(name_text, move |mx, args, span| {
            Box::pin(async move {
                let root = mx.root_scope;
                match builtin_call_method(&mx, root, recv, name, args, span).await? {
                    Some(v) => Ok(v),
                    None => Err(mx.raise_at(
                        CoreClass::SymbolNotDefinedError,
                        "method is not defined",
                        span,
                    )),
                }
            })
        });
        return Ok(Some(mx.alloc(HeapData::Native(native))?));
    }
    Ok(None)
}

enum PropOut {
    Value(Value),
    Int(i64),
    Fallible(Exec<i64>),
}

/// Calls a builtin type method. `Ok(None)` when the class has no method
/// of this name.
#[expect(clippy::too_many_lines, reason = "one match arm per builtin method")]
pub(crate) async fn builtin_call_method(
    mx: &Mx,
    scope: ScopeId,
    recv: Value,
    name: StringId,
    args: ArgValues,
    span: Span,
) -> Exec<Option<Value>> {
    let name_text = mx.name_of(name);
    let n = name_text.as_str();

    // Class-independent defaults.
    match n {
        "toString" => {
            args.check_zero("toString")?;
            return Ok(Some(mx.alloc_str(mx.display(recv))?));
        }
        "contains" => {
            let item = args.get_one("contains")?;
            let found = binary::contains(mx, scope, recv, item, span).await?;
            return Ok(Some(Value::Bool(found)));
        }
        "isEmpty" | "isNotEmpty" => {
            let size = {
                let heap = mx.heap.borrow();
                let interns = mx.interns.borrow();
                sized(&heap, &interns, recv)
            };
            if let Some(size) = size {
                args.check_zero(n)?;
                let empty = size == 0;
                return Ok(Some(Value::Bool(if n == "isEmpty" { empty } else { !empty })));
            }
        }
        "iterator" => {
            let state = {
                let heap = mx.heap.borrow();
                iter::builtin_iter(&heap, recv)
            };
            if let Some(state) = state {
                args.check_zero("iterator")?;
                return Ok(Some(mx.alloc(HeapData::Iter(state))?));
            }
        }
        "toList" => {
            let iterable = {
                let heap = mx.heap.borrow();
                iter::builtin_iter(&heap, recv).is_some()
            };
            let is_flow = matches!(recv, Value::Ref(id) if matches!(mx.heap.borrow().get(id), HeapData::Flow(_)));
            if iterable && !is_flow {
                args.check_zero("toList")?;
                let items = eval::iterate_collect(mx, scope, recv, span).await?;
                return Ok(Some(mx.alloc(HeapData::List(List::of(items)))?));
            }
        }
        "freeze" => {
            let froze = {
                let mut heap = mx.heap.borrow_mut();
                match recv {
                    Value::Ref(id) => match heap.get_mut(id) {
                        HeapData::List(l) => {
                            l.frozen = true;
                            true
                        }
                        HeapData::Map(m) => {
                            m.frozen = true;
                            true
                        }
                        HeapData::Set(s) => {
                            s.frozen = true;
                            true
                        }
                        HeapData::Buffer(b) => {
                            b.frozen = true;
                            true
                        }
                        _ => false,
                    },
                    _ => false,
                }
            };
            if froze {
                args.check_zero("freeze")?;
                return Ok(Some(recv));
            }
        }
        _ => {}
    }

    let Value::Ref(id) = recv else {
        return immediate_method(mx, recv, n, args, span);
    };

    enum Recv {
        List,
        Str(String),
        Map,
        Set,
        Iter,
        Deferred,
        Mutex,
        Channel,
        Flow(FlowData),
        Other,
    }
    let kind = {
        let heap = mx.heap.borrow();
        match heap.get(id) {
            HeapData::List(_) => Recv::List,
            HeapData::Str(s) => Recv::Str(s.clone()),
            HeapData::Map(_) => Recv::Map,
            HeapData::Set(_) => Recv::Set,
            HeapData::Iter(_) => Recv::Iter,
            HeapData::Deferred(_) => Recv::Deferred,
            HeapData::Mutex(_) => Recv::Mutex,
            HeapData::Channel(_) => Recv::Channel,
            HeapData::Flow(f) => Recv::Flow(FlowData {
                producer: f.producer,
                ops: f.ops.clone(),
            }),
            _ => Recv::Other,
        }
    };

    match kind {
        Recv::List => list_method(mx, scope, id, n, args, span).await,
        Recv::Str(text) => str_method(mx, &text, n, args, span),
        Recv::Map => map_method(mx, scope, id, n, args, span).await,
        Recv::Set => set_method(mx, scope, id, n, args, span).await,
        Recv::Iter => iter_method(mx, id, n, args, span),
        Recv::Deferred => deferred_method(mx, id, n, args, span).await,
        Recv::Mutex => mutex_method(mx, id, n, args, span).await,
        Recv::Channel => channel_method(mx, id, n, args, span).await,
        Recv::Flow(flow) => flow_method(mx, flow, n, args, span).await,
        Recv::Other => Ok(None),
    }
}

fn sized(heap: &crate::heap::Heap, interns: &crate::intern::Interns, v: Value) -> Option<usize> {
    match v {
        Value::InternStr(_) => Some(v.as_str(heap, interns)?.chars().count()),
        Value::Ref(id) => match heap.get(id) {
            HeapData::Str(s) => Some(s.chars().count()),
            HeapData::List(l) => Some(l.items.len()),
            HeapData::Map(m) => Some(m.entries.len()),
            HeapData::Set(s) => Some(s.items.len()),
            HeapData::Buffer(b) => Some(b.bytes.len()),
            HeapData::Range(r) => r.size().ok().map(|s| s as usize),
            _ => None,
        },
        _ => None,
    }
}

fn immediate_method(
    mx: &Mx,
    recv: Value,
    n: &str,
    args: ArgValues,
    _span: Span,
) -> Exec<Option<Value>> {
    match (recv, n) {
        (Value::Int(i), "toReal") => {
            args.check_zero("toReal")?;
            Ok(Some(Value::Real(i as f64)))
        }
        (Value::Int(i), "toChar") => {
            args.check_zero("toChar")?;
            Ok(Some(
                u32::try_from(i)
                    .ok()
                    .and_then(char::from_u32)
                    .map_or(Value::Null, Value::Char),
            ))
        }
        (Value::Int(i), "abs") => {
            args.check_zero("abs")?;
            Ok(Some(Value::Int(i.wrapping_abs())))
        }
        (Value::Real(r), "toInt") => {
            args.check_zero("toInt")?;
            Ok(Some(Value::Int(r as i64)))
        }
        (Value::Real(r), "abs") => {
            args.check_zero("abs")?;
            Ok(Some(Value::Real(r.abs())))
        }
        (Value::InternStr(_), _) => {
            let text = mx.display(recv);
            str_method(mx, &text, n, args, _span)
        }
        _ => Ok(None),
    }
}

async fn list_method(
    mx: &Mx,
    scope: ScopeId,
    id: HeapId,
    n: &str,
    args: ArgValues,
    span: Span,
) -> Exec<Option<Value>> {
    let recv = Value::Ref(id);
    match n {
        "add" => {
            {
                let mut heap = mx.heap.borrow_mut();
                if let HeapData::List(list) = heap.get_mut(id) {
                    list.check_mutable()?;
                    list.items.extend(args.pos.iter().copied());
                }
            }
            Ok(Some(recv))
        }
        "addAll" => {
            let other = args.get_one("addAll")?;
            let items = eval::iterate_collect(mx, scope, other, span).await?;
            let mut heap = mx.heap.borrow_mut();
            if let HeapData::List(list) = heap.get_mut(id) {
                list.check_mutable()?;
                list.items.extend(items);
            }
            Ok(Some(recv))
        }
        "removeAt" => {
            let index = args.get_one("removeAt")?;
            let Value::Int(i) = index else {
                return Err(mx.raise_at(CoreClass::IllegalArgumentError, "removeAt takes an Int", span));
            };
            let mut heap = mx.heap.borrow_mut();
            if let HeapData::List(list) = heap.get_mut(id) {
                list.check_mutable()?;
                let idx = crate::types::list::normalize_index(i, list.items.len())?;
                return Ok(Some(list.items.remove(idx)));
            }
            Ok(None)
        }
        "insertAt" => {
            let (index, value) = args.get_two("insertAt")?;
            let Value::Int(i) = index else {
                return Err(mx.raise_at(CoreClass::IllegalArgumentError, "insertAt takes an Int index", span));
            };
            let mut heap = mx.heap.borrow_mut();
            if let HeapData::List(list) = heap.get_mut(id) {
                list.check_mutable()?;
                let idx = crate::types::list::normalize_bound(i, list.items.len())?;
                list.items.insert(idx, value);
            }
            Ok(Some(recv))
        }
        "indexOf" => {
            let wanted = args.get_one("indexOf")?;
            let items = {
                let heap = mx.heap.borrow();
                match heap.get(id) {
                    HeapData::List(list) => list.items.clone(),
                    _ => Vec::new(),
                }
            };
            for (i, item) in items.into_iter().enumerate() {
                if binary::equals(mx, scope, item, wanted, span).await? {
                    return Ok(Some(Value::Int(i as i64)));
                }
            }
            Ok(Some(Value::Int(-1)))
        }
        "first" | "last" => {
            args.check_zero(n)?;
            let heap = mx.heap.borrow();
            let HeapData::List(list) = heap.get(id) else {
                return Ok(None);
            };
            let item = if n == "first" {
                list.items.first()
            } else {
                list.items.last()
            };
            match item {
                Some(v) => Ok(Some(*v)),
                None => {
                    drop(heap);
                    Err(mx.raise_at(CoreClass::IndexOutOfBoundsError, format!("{n} of an empty List"), span))
                }
            }
        }
        "forEach" => {
            let f = args.get_one("forEach")?;
            let items = snapshot_list(mx, id);
            for item in items {
                call_value(mx, f, ArgValues::one(item), span).await?;
            }
            Ok(Some(Value::Void))
        }
        "map" => {
            let f = args.get_one("map")?;
            let items = snapshot_list(mx, id);
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(call_value(mx, f, ArgValues::one(item), span).await?);
            }
            Ok(Some(mx.alloc(HeapData::List(List::of(out)))?))
        }
        "filter" => {
            let f = args.get_one("filter")?;
            let items = snapshot_list(mx, id);
            let mut out = Vec::new();
            for item in items {
                let keep = call_value(mx, f, ArgValues::one(item), span).await?;
                if eval::truthy(mx, keep, span)? {
                    out.push(item);
                }
            }
            Ok(Some(mx.alloc(HeapData::List(List::of(out)))?))
        }
        "take" | "drop" => {
            let count = args.get_one(n)?;
            let Value::Int(count) = count else {
                return Err(mx.raise_at(CoreClass::IllegalArgumentError, format!("{n} takes an Int"), span));
            };
            let count = count.max(0) as usize;
            let items = snapshot_list(mx, id);
            let out: Vec<Value> = if n == "take" {
                items.into_iter().take(count).collect()
            } else {
                items.into_iter().skip(count).collect()
            };
            Ok(Some(mx.alloc(HeapData::List(List::of(out)))?))
        }
        "sorted" => {
            args.check_zero("sorted")?;
            let mut items = snapshot_list(mx, id);
            let mut failed = false;
            {
                let heap = mx.heap.borrow();
                let interns = mx.interns.borrow();
                items.sort_by(|a, b| {
                    crate::value::compare(*a, *b, &heap, &interns).unwrap_or_else(|| {
                        failed = true;
                        std::cmp::Ordering::Equal
                    })
                });
            }
            if failed {
                return Err(mx.raise_at(
                    CoreClass::IllegalOperationError,
                    "sorted() requires comparable elements",
                    span,
                ));
            }
            Ok(Some(mx.alloc(HeapData::List(List::of(items)))?))
        }
        "reversed" => {
            args.check_zero("reversed")?;
            let mut items = snapshot_list(mx, id);
            items.reverse();
            Ok(Some(mx.alloc(HeapData::List(List::of(items)))?))
        }
        "joinToString" => {
            let sep = match args.get_zero_one("joinToString")? {
                Some(v) => mx.display(v),
                None => ", ".to_owned(),
            };
            let items = snapshot_list(mx, id);
            let parts: Vec<String> = items.into_iter().map(|v| mx.display(v)).collect();
            Ok(Some(mx.alloc_str(parts.join(&sep))?))
        }
        _ => Ok(None),
    }
}

fn snapshot_list(mx: &Mx, id: HeapId) -> Vec<Value> {
    let heap = mx.heap.borrow();
    match heap.get(id) {
        HeapData::List(list) => list.items.clone(),
        _ => Vec::new(),
    }
}

fn str_method(mx: &Mx, text: &str, n: &str, args: ArgValues, span: Span) -> Exec<Option<Value>> {
    let arg_str = |mx: &Mx, v: Value| -> Option<String> {
        let heap = mx.heap.borrow();
        let interns = mx.interns.borrow();
        v.as_str(&heap, &interns).map(ToOwned::to_owned)
    };
    match n {
        "indexOf" => {
            let needle = args.get_one("indexOf")?;
            let Some(needle) = arg_str(mx, needle) else {
                return Err(mx.raise_at(CoreClass::IllegalArgumentError, "indexOf takes a String", span));
            };
            let index = text.find(&needle).map_or(-1, |byte| {
                text[..byte].chars().count() as i64
            });
            Ok(Some(Value::Int(index)))
        }
        "startsWith" | "endsWith" => {
            let needle = args.get_one(n)?;
            let Some(needle) = arg_str(mx, needle) else {
                return Err(mx.raise_at(CoreClass::IllegalArgumentError, format!("{n} takes a String"), span));
            };
            let result = if n == "startsWith" {
                text.starts_with(&needle)
            } else {
                text.ends_with(&needle)
            };
            Ok(Some(Value::Bool(result)))
        }
        "trim" => {
            args.check_zero("trim")?;
            Ok(Some(mx.alloc_str(text.trim())?))
        }
        "uppercase" => {
            args.check_zero("uppercase")?;
            Ok(Some(mx.alloc_str(text.to_uppercase())?))
        }
        "lowercase" => {
            args.check_zero("lowercase")?;
            Ok(Some(mx.alloc_str(text.to_lowercase())?))
        }
        "split" => {
            let sep = args.get_one("split")?;
            let Some(sep) = arg_str(mx, sep) else {
                return Err(mx.raise_at(CoreClass::IllegalArgumentError, "split takes a String", span));
            };
            let mut parts = Vec::new();
            for part in text.split(sep.as_str()) {
                parts.push(mx.alloc_str(part)?);
            }
            Ok(Some(mx.alloc(HeapData::List(List::of(parts)))?))
        }
        "toInt" => {
            args.check_zero("toInt")?;
            match text.trim().parse::<i64>() {
                Ok(i) => Ok(Some(Value::Int(i))),
                Err(_) => Err(mx.raise_at(
                    CoreClass::IllegalArgumentError,
                    format!("cannot parse {text:?} as Int"),
                    span,
                )),
            }
        }
        "toReal" => {
            args.check_zero("toReal")?;
            match text.trim().parse::<f64>() {
                Ok(r) => Ok(Some(Value::Real(r))),
                Err(_) => Err(mx.raise_at(
                    CoreClass::IllegalArgumentError,
                    format!("cannot parse {text:?} as Real"),
                    span,
                )),
            }
        }
        _ => Ok(None),
    }
}

async fn map_method(
    mx: &Mx,
    scope: ScopeId,
    id: HeapId,
    n: &str,
    args: ArgValues,
    span: Span,
) -> Exec<Option<Value>> {
    match n {
        "put" => {
            let (key, value) = args.get_two("put")?;
            let key = {
                let heap = mx.heap.borrow();
                let interns = mx.interns.borrow();
                key.as_str(&heap, &interns).map(ToOwned::to_owned)
            };
            let Some(key) = key else {
                return Err(mx.raise_at(CoreClass::IllegalArgumentError, "Map keys must be String", span));
            };
            let mut heap = mx.heap.borrow_mut();
            if let HeapData::Map(map) = heap.get_mut(id) {
                map.check_mutable()?;
                map.put(key, value);
            }
            Ok(Some(Value::Ref(id)))
        }
        "remove" => {
            let key = args.get_one("remove")?;
            let key = {
                let heap = mx.heap.borrow();
                let interns = mx.interns.borrow();
                key.as_str(&heap, &interns).map(ToOwned::to_owned)
            };
            let Some(key) = key else {
                return Err(mx.raise_at(CoreClass::IllegalArgumentError, "Map keys must be String", span));
            };
            let mut heap = mx.heap.borrow_mut();
            if let HeapData::Map(map) = heap.get_mut(id) {
                map.check_mutable()?;
                return Ok(Some(map.entries.shift_remove(&key).unwrap_or(Value::Null)));
            }
            Ok(None)
        }
        "keys" => {
            args.check_zero("keys")?;
            let keys: Vec<String> = {
                let heap = mx.heap.borrow();
                match heap.get(id) {
                    HeapData::Map(map) => map.entries.keys().cloned().collect(),
                    _ => Vec::new(),
                }
            };
            let mut out = Vec::with_capacity(keys.len());
            for k in keys {
                out.push(mx.alloc_str(k)?);
            }
            Ok(Some(mx.alloc(HeapData::List(List::of(out)))?))
        }
        "values" => {
            args.check_zero("values")?;
            let values: Vec<Value> = {
                let heap = mx.heap.borrow();
                match heap.get(id) {
                    HeapData::Map(map) => map.entries.values().copied().collect(),
                    _ => Vec::new(),
                }
            };
            Ok(Some(mx.alloc(HeapData::List(List::of(values)))?))
        }
        "entries" => {
            args.check_zero("entries")?;
            let items = eval::iterate_collect(mx, scope, Value::Ref(id), span).await?;
            Ok(Some(mx.alloc(HeapData::List(List::of(items)))?))
        }
        "forEach" => {
            let f = args.get_one("forEach")?;
            let items = eval::iterate_collect(mx, scope, Value::Ref(id), span).await?;
            for entry in items {
                call_value(mx, f, ArgValues::one(entry), span).await?;
            }
            Ok(Some(Value::Void))
        }
        _ => Ok(None),
    }
}

async fn set_method(
    mx: &Mx,
    scope: ScopeId,
    id: HeapId,
    n: &str,
    args: ArgValues,
    span: Span,
) -> Exec<Option<Value>> {
    match n {
        "add" => {
            let added = {
                let mut heap = mx.heap.borrow_mut();
                let interns = mx.interns.borrow();
                let keys: Vec<(crate::value::ValueKey, Value)> = args
                    .pos
                    .iter()
                    .map(|v| (value_key(*v, &heap, &interns), *v))
                    .collect();
                drop(interns);
                if let HeapData::Set(set) = heap.get_mut(id) {
                    set.check_mutable()?;
                    let mut any = false;
                    for (k, v) in keys {
                        any |= set.add(k, v);
                    }
                    any
                } else {
                    false
                }
            };
            Ok(Some(Value::Bool(added)))
        }
        "remove" => {
            let v = args.get_one("remove")?;
            let removed = {
                let mut heap = mx.heap.borrow_mut();
                let interns = mx.interns.borrow();
                let key = value_key(v, &heap, &interns);
                drop(interns);
                if let HeapData::Set(set) = heap.get_mut(id) {
                    set.check_mutable()?;
                    set.items.shift_remove(&key).is_some()
                } else {
                    false
                }
            };
            Ok(Some(Value::Bool(removed)))
        }
        "forEach" => {
            let f = args.get_one("forEach")?;
            let items = eval::iterate_collect(mx, scope, Value::Ref(id), span).await?;
            for item in items {
                call_value(mx, f, ArgValues::one(item), span).await?;
            }
            Ok(Some(Value::Void))
        }
        _ => Ok(None),
    }
}

fn iter_method(mx: &Mx, id: HeapId, n: &str, args: ArgValues, span: Span) -> Exec<Option<Value>> {
    match n {
        "hasNext" => {
            args.check_zero("hasNext")?;
            let state = {
                let heap = mx.heap.borrow();
                match heap.get(id) {
                    HeapData::Iter(state) => *state,
                    _ => IterState::Done,
                }
            };
            // Peek by advancing a copy; the stored state is untouched.
            let probe = {
                let mut heap = mx.heap.borrow_mut();
                let probe_id = heap.allocate(HeapData::Iter(state))?;
                let interns = mx.interns.borrow();
                iter::iter_next(&mut heap, &interns, probe_id)?
            };
            Ok(Some(Value::Bool(probe.is_some())))
        }
        "next" => {
            args.check_zero("next")?;
            let next = {
                let mut heap = mx.heap.borrow_mut();
                let interns = mx.interns.borrow();
                iter::iter_next(&mut heap, &interns, id)?
            };
            match next {
                Some(v) => Ok(Some(v)),
                None => Err(mx.raise_at(
                    CoreClass::IterationEndException,
                    "iteration past the end",
                    span,
                )),
            }
        }
        "cancelIteration" => {
            args.check_zero("cancelIteration")?;
            iter::iter_cancel(&mut mx.heap.borrow_mut(), id);
            Ok(Some(Value::Void))
        }
        _ => Ok(None),
    }
}

async fn deferred_method(
    mx: &Mx,
    id: HeapId,
    n: &str,
    args: ArgValues,
    _span: Span,
) -> Exec<Option<Value>> {
    match n {
        "await" => {
            args.check_zero("await")?;
            let value = AwaitDeferred {
                mx: std::rc::Rc::clone(mx),
                id,
            }
            .await?;
            Ok(Some(value))
        }
        "cancel" => {
            args.check_zero("cancel")?;
            cancel_deferred(mx, id);
            Ok(Some(Value::Void))
        }
        "complete" => {
            let value = args.get_one("complete")?;
            complete_deferred(mx, id, Ok(value));
            Ok(Some(Value::Void))
        }
        _ => Ok(None),
    }
}

async fn mutex_method(mx: &Mx, id: HeapId, n: &str, args: ArgValues, span: Span) -> Exec<Option<Value>> {
    match n {
        "lock" => {
            args.check_zero("lock")?;
            LockMutex {
                mx: std::rc::Rc::clone(mx),
                id,
            }
            .await?;
            Ok(Some(Value::Void))
        }
        "unlock" => {
            args.check_zero("unlock")?;
            mutex_unlock(mx, id)?;
            Ok(Some(Value::Void))
        }
        "withLock" => {
            let f = args.get_one("withLock")?;
            LockMutex {
                mx: std::rc::Rc::clone(mx),
                id,
            }
            .await?;
            let result = call_value(mx, f, ArgValues::empty(), span).await;
            // The unlock runs on every exit path.
            mutex_unlock(mx, id)?;
            Ok(Some(result?))
        }
        _ => Ok(None),
    }
}

async fn channel_method(mx: &Mx, id: HeapId, n: &str, args: ArgValues, _span: Span) -> Exec<Option<Value>> {
    match n {
        "send" => {
            let value = args.get_one("send")?;
            let out = ChannelSend {
                mx: std::rc::Rc::clone(mx),
                id,
                value,
            }
            .await?;
            Ok(Some(out))
        }
        "receive" => {
            args.check_zero("receive")?;
            let out = ChannelRecv {
                mx: std::rc::Rc::clone(mx),
                id,
            }
            .await?;
            Ok(Some(out))
        }
        "close" => {
            args.check_zero("close")?;
            channel_close(mx, id)?;
            Ok(Some(Value::Void))
        }
        _ => Ok(None),
    }
}

// --- cold flows ------------------------------------------------------------

async fn flow_method(
    mx: &Mx,
    flow: FlowData,
    n: &str,
    args: ArgValues,
    span: Span,
) -> Exec<Option<Value>> {
    match n {
        "take" => {
            let count = args.get_one("take")?;
            let Value::Int(count) = count else {
                return Err(mx.raise_at(CoreClass::IllegalArgumentError, "take expects an Int", span));
            };
            let extended = flow.extended(FlowOp::Take(count.max(0) as u64));
            Ok(Some(mx.alloc(HeapData::Flow(extended))?))
        }
        "map" => {
            let f = args.get_one("map")?;
            let extended = flow.extended(FlowOp::Map(f));
            Ok(Some(mx.alloc(HeapData::Flow(extended))?))
        }
        "collect" => {
            let collector = args.get_one("collect")?;
            flow_collect(mx, &flow, collector, span).await?;
            Ok(Some(Value::Void))
        }
        "toList" => {
            args.check_zero("toList")?;
            let out = mx.alloc(HeapData::List(List::default()))?;
            let Value::Ref(list_id) = out else {
                unreachable!("alloc returns a ref");
            };
            let push = NativeFn::new("push", move |mx, args, span| {
                Box::pin(async move {
                    let v = args.get_one("push")?;
                    let mut heap = mx.heap.borrow_mut();
                    if let HeapData::List(list) = heap.get_mut(list_id) {
                        list.items.push(v);
                    }
                    let _ = span;
                    Ok(Value::Void)
                })
            });
            let collector = mx.alloc(HeapData::Native(push))?;
            flow_collect(mx, &flow, collector, span).await?;
            Ok(Some(out))
        }
        _ => Ok(None),
    }
}

/// Runs the cold producer, driving emissions through the operator chain
/// into the collector. `take` terminates the producer by raising the
/// dedicated `StopFlow` signal once its budget is spent.
async fn flow_collect(mx: &Mx, flow: &FlowData, collector: Value, span: Span) -> Exec<()> {
    use std::cell::Cell;
    use std::rc::Rc;

    let limit = flow
        .ops
        .iter()
        .filter_map(|op| match op {
            FlowOp::Take(n) => Some(*n),
            FlowOp::Map(_) => None,
        })
        .min();
    if limit == Some(0) {
        return Ok(());
    }
    let remaining: Rc<Cell<Option<u64>>> = Rc::new(Cell::new(limit));
    let maps: Vec<Value> = flow
        .ops
        .iter()
        .filter_map(|op| match op {
            FlowOp::Map(f) => Some(*f),
            FlowOp::Take(_) => None,
        })
        .collect();

    let remaining_for_emit = Rc::clone(&remaining);
    let emit = NativeFn::new("emit", move |mx, args, span| {
        let maps = maps.clone();
        let remaining = Rc::clone(&remaining_for_emit);
        Box::pin(async move {
            let mut value = args.get_one("emit")?;
            for f in maps {
                value = call_value(&mx, f, ArgValues::one(value), span).await?;
            }
            call_value(&mx, collector, ArgValues::one(value), span).await?;
            if let Some(n) = remaining.get() {
                let n = n - 1;
                remaining.set(Some(n));
                if n == 0 {
                    return Err(Flow::StopFlow);
                }
            }
            // Emission is a suspension point: consumers drive the pace.
            mx.check_cancelled()?;
            crate::sched::YieldNow::new().await;
            Ok(Value::Void)
        })
    });
    let emit_value = mx.alloc(HeapData::Native(emit))?;

    let producer_fn = match flow.producer {
        Value::Ref(id) => {
            let heap = mx.heap.borrow();
            matches!(heap.get(id), HeapData::Function(_)).then_some(id)
        }
        _ => None,
    };
    let result = match producer_fn {
        Some(fid) => {
            call_function(
                mx,
                fid,
                None,
                ArgValues::empty(),
                span,
                vec![(sym::EMIT, emit_value)],
            )
            .await
        }
        None => call_value(mx, flow.producer, ArgValues::one(emit_value), span).await,
    };
    match result {
        Ok(_) => Ok(()),
        Err(Flow::StopFlow) => Ok(()),
        Err(other) => Err(other),
    }
}
