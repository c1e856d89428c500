//! Host-facing value type.
//!
//! `Object` is the conversion boundary between native code and engine
//! values: inputs to native functions arrive as `Object`s, results and
//! module evaluation values leave as `Object`s. Values without a
//! structural host form (instances, callables, coroutine handles) cross
//! as [`Object::Repr`] carrying their rendering.

use crate::{
    exceptions::Exec,
    heap::{HeapData, HeapId},
    machine::Mx,
    types::{list::List, map::MapData},
    value::Value,
};

const MAX_CONVERT_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Object {
    Void,
    Null,
    Bool(bool),
    Int(i64),
    Real(f64),
    Char(char),
    Str(String),
    List(Vec<Object>),
    /// String-keyed entries in insertion order.
    Map(Vec<(String, Object)>),
    /// Rendering of a value with no structural host form.
    Repr(String),
}

impl From<i64> for Object {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Object {
    fn from(v: f64) -> Self {
        Self::Real(v)
    }
}

impl From<bool> for Object {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for Object {
    fn from(v: &str) -> Self {
        Self::Str(v.to_owned())
    }
}

impl From<String> for Object {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl std::fmt::Display for Object {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Void => f.write_str("void"),
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Real(r) => f.write_str(ryu::Buffer::new().format(*r)),
            Self::Char(c) => write!(f, "{c}"),
            Self::Str(s) => f.write_str(s),
            Self::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Self::Map(entries) => {
                f.write_str("{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k:?}: {v}")?;
                }
                f.write_str("}")
            }
            Self::Repr(s) => f.write_str(s),
        }
    }
}

/// Converts a host object into an engine value (allocating containers).
pub(crate) fn object_to_value(mx: &Mx, obj: &Object) -> Exec<Value> {
    match obj {
        Object::Void => Ok(Value::Void),
        Object::Null => Ok(Value::Null),
        Object::Bool(b) => Ok(Value::Bool(*b)),
        Object::Int(i) => Ok(Value::Int(*i)),
        Object::Real(r) => Ok(Value::Real(*r)),
        Object::Char(c) => Ok(Value::Char(*c)),
        Object::Str(s) | Object::Repr(s) => mx.alloc_str(s.clone()),
        Object::List(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(object_to_value(mx, item)?);
            }
            mx.alloc(HeapData::List(List::of(out)))
        }
        Object::Map(entries) => {
            let mut map = MapData::default();
            for (k, v) in entries {
                let value = object_to_value(mx, v)?;
                map.put(k.clone(), value);
            }
            mx.alloc(HeapData::Map(map))
        }
    }
}

/// Converts an engine value into a host object.
pub(crate) fn value_to_object(mx: &Mx, v: Value) -> Object {
    let heap = mx.heap.borrow();
    let interns = mx.interns.borrow();
    convert_value(mx, v, &heap, &interns, 0)
}

fn convert_value(
    mx: &Mx,
    v: Value,
    heap: &crate::heap::Heap,
    interns: &crate::intern::Interns,
    depth: usize,
) -> Object {
    if depth > MAX_CONVERT_DEPTH {
        return Object::Repr("...".to_owned());
    }
    match v {
        Value::Void => Object::Void,
        Value::Null | Value::Unset => Object::Null,
        Value::Bool(b) => Object::Bool(b),
        Value::Int(i) => Object::Int(i),
        Value::Real(r) => Object::Real(r),
        Value::Char(c) => Object::Char(c),
        Value::InternStr(id) => Object::Str(interns.get(id).to_owned()),
        Value::Ref(id) => convert_heap(mx, id, heap, interns, depth),
        Value::Class(_) | Value::Builtin(_) => Object::Repr(crate::value::repr(v, heap, interns)),
    }
}

fn convert_heap(
    mx: &Mx,
    id: HeapId,
    heap: &crate::heap::Heap,
    interns: &crate::intern::Interns,
    depth: usize,
) -> Object {
    match heap.get(id) {
        HeapData::Str(s) => Object::Str(s.clone()),
        HeapData::List(list) => Object::List(
            list.items
                .iter()
                .map(|v| convert_value(mx, *v, heap, interns, depth + 1))
                .collect(),
        ),
        HeapData::Set(set) => Object::List(
            set.items
                .values()
                .map(|v| convert_value(mx, *v, heap, interns, depth + 1))
                .collect(),
        ),
        HeapData::Map(map) => Object::Map(
            map.entries
                .iter()
                .map(|(k, v)| (k.clone(), convert_value(mx, *v, heap, interns, depth + 1)))
                .collect(),
        ),
        _ => Object::Repr(crate::value::repr(Value::Ref(id), heap, interns)),
    }
}
