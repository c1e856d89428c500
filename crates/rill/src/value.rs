//! The uniform runtime value.
//!
//! Small immediate values (`Int`, `Real`, `Bool`, `Char`, the singletons)
//! are stored inline, which also gives them by-value binding semantics for
//! free; everything else lives in the heap arena behind `Ref(HeapId)`.
//! String literals are interned and carried as `InternStr` so the hot path
//! never allocates for them.
//!
//! `Value` is deliberately `Copy`: equality on the enum itself is reference
//! identity (the `===` operator); structural comparison goes through
//! [`compare`], which dispatches on the operands' classes.

use std::cmp::Ordering;

use crate::{
    builtins::BuiltinFn,
    heap::{Heap, HeapData, HeapId},
    intern::{Interns, StringId},
    types::class::{ClassRef, CoreClass},
};

/// Maximum nesting visited when comparing or rendering containers.
const MAX_DATA_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Value {
    Void,
    Null,
    /// Placeholder held by an initialiser-less `val` until single-assigned.
    Unset,
    Bool(bool),
    Int(i64),
    Real(f64),
    Char(char),
    /// An interned string literal.
    InternStr(StringId),
    /// A reflective class value (`x::class`).
    Class(ClassRef),
    /// A global builtin function.
    Builtin(BuiltinFn),
    /// Heap-allocated payload.
    Ref(HeapId),
}

impl Value {
    /// The ever-present class of this value.
    pub fn class_of(&self, heap: &Heap) -> ClassRef {
        let core = match self {
            Self::Void => CoreClass::Void,
            Self::Null => CoreClass::Null,
            Self::Unset => CoreClass::Unset,
            Self::Bool(_) => CoreClass::Bool,
            Self::Int(_) => CoreClass::Int,
            Self::Real(_) => CoreClass::Real,
            Self::Char(_) => CoreClass::Char,
            Self::InternStr(_) => CoreClass::Str,
            Self::Class(_) => CoreClass::Class,
            Self::Builtin(_) => CoreClass::Callable,
            Self::Ref(id) => return heap.get(*id).class_of(heap),
        };
        ClassRef::Builtin(core)
    }

    pub fn type_name<'a>(&self, heap: &'a Heap, interns: &'a Interns) -> std::borrow::Cow<'a, str> {
        self.class_of(heap).name(heap, interns)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// `Bool` payload, or `None` for everything else (conditions do not
    /// coerce).
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric widening view: `Int` and `Real` both read as `f64`.
    pub fn as_real(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Real(r) => Some(*r),
            _ => None,
        }
    }

    /// Resolves either string representation to text.
    pub fn as_str<'a>(&self, heap: &'a Heap, interns: &'a Interns) -> Option<&'a str> {
        match self {
            Self::InternStr(id) => Some(interns.get(*id)),
            Self::Ref(id) => match heap.get(*id) {
                HeapData::Str(s) => Some(s.as_str()),
                _ => None,
            },
            _ => None,
        }
    }
}

/// Structural comparison for builtin values.
///
/// Returns `None` when the operands are incomparable; `==` treats that as
/// "not equal" while relational operators raise. Instances with a user
/// `compareTo` are handled by the evaluator before falling back here.
pub(crate) fn compare(a: Value, b: Value, heap: &Heap, interns: &Interns) -> Option<Ordering> {
    compare_at(a, b, heap, interns, 0)
}

fn compare_at(a: Value, b: Value, heap: &Heap, interns: &Interns, depth: usize) -> Option<Ordering> {
    if depth > MAX_DATA_DEPTH {
        return None;
    }
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Some(x.cmp(&y)),
        (Value::Int(_) | Value::Real(_), Value::Int(_) | Value::Real(_)) => {
            a.as_real()?.partial_cmp(&b.as_real()?)
        }
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(&y)),
        (Value::Char(x), Value::Char(y)) => Some(x.cmp(&y)),
        (Value::Null, Value::Null) | (Value::Void, Value::Void) | (Value::Unset, Value::Unset) => {
            Some(Ordering::Equal)
        }
        (Value::Class(x), Value::Class(y)) => (x == y).then_some(Ordering::Equal),
        (Value::Builtin(x), Value::Builtin(y)) => (x == y).then_some(Ordering::Equal),
        _ => {
            if let (Some(x), Some(y)) = (a.as_str(heap, interns), b.as_str(heap, interns)) {
                return Some(x.cmp(y));
            }
            let (Value::Ref(xa), Value::Ref(xb)) = (a, b) else {
                return None;
            };
            if xa == xb {
                return Some(Ordering::Equal);
            }
            compare_heap(xa, xb, heap, interns, depth)
        }
    }
}

fn compare_heap(a: HeapId, b: HeapId, heap: &Heap, interns: &Interns, depth: usize) -> Option<Ordering> {
    match (heap.get(a), heap.get(b)) {
        (HeapData::List(x), HeapData::List(y)) => {
            compare_seq(&x.items, &y.items, heap, interns, depth)
        }
        (HeapData::Buffer(x), HeapData::Buffer(y)) => Some(x.bytes.cmp(&y.bytes)),
        (HeapData::Entry(xk, xv), HeapData::Entry(yk, yv)) => {
            match compare_at(*xk, *yk, heap, interns, depth + 1)? {
                Ordering::Equal => compare_at(*xv, *yv, heap, interns, depth + 1),
                other => Some(other),
            }
        }
        (HeapData::Range(x), HeapData::Range(y)) => (x == y).then_some(Ordering::Equal),
        (HeapData::Map(x), HeapData::Map(y)) => {
            // Pairwise-equal entries; key ordering is not part of equality.
            if x.entries.len() != y.entries.len() {
                return None;
            }
            for (k, v) in &x.entries {
                let other = y.entries.get(k)?;
                if compare_at(*v, *other, heap, interns, depth + 1) != Some(Ordering::Equal) {
                    return None;
                }
            }
            Some(Ordering::Equal)
        }
        (HeapData::Set(x), HeapData::Set(y)) => {
            (x.items.len() == y.items.len() && x.items.keys().all(|k| y.items.contains_key(k)))
                .then_some(Ordering::Equal)
        }
        (HeapData::Exception(x), HeapData::Exception(y)) => {
            (x.class == y.class && x.message == y.message).then_some(Ordering::Equal)
        }
        _ => None,
    }
}

fn compare_seq(
    xs: &[Value],
    ys: &[Value],
    heap: &Heap,
    interns: &Interns,
    depth: usize,
) -> Option<Ordering> {
    for (x, y) in xs.iter().zip(ys) {
        match compare_at(*x, *y, heap, interns, depth + 1)? {
            Ordering::Equal => {}
            other => return Some(other),
        }
    }
    Some(xs.len().cmp(&ys.len()))
}

/// Structural equality shortcut: `compare == Equal`.
pub(crate) fn values_equal(a: Value, b: Value, heap: &Heap, interns: &Interns) -> bool {
    compare(a, b, heap, interns) == Some(Ordering::Equal)
}

/// Hashable identity of a value, used as the key type for `Set` members
/// and to detect duplicate map keys. Reals with an exact integral value
/// collapse onto the `Int` key so `1` and `1.0` occupy one slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum ValueKey {
    Void,
    Null,
    Unset,
    Bool(bool),
    Int(i64),
    RealBits(u64),
    Char(char),
    Str(Box<str>),
    Ref(HeapId),
    Class(ClassKey),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum ClassKey {
    Builtin(CoreClass),
    User(HeapId),
}

pub(crate) fn value_key(v: Value, heap: &Heap, interns: &Interns) -> ValueKey {
    match v {
        Value::Void => ValueKey::Void,
        Value::Null => ValueKey::Null,
        Value::Unset => ValueKey::Unset,
        Value::Bool(b) => ValueKey::Bool(b),
        Value::Int(i) => ValueKey::Int(i),
        Value::Real(r) => {
            if r.fract() == 0.0 && r.abs() < i64::MAX as f64 {
                ValueKey::Int(r as i64)
            } else {
                ValueKey::RealBits(r.to_bits())
            }
        }
        Value::Char(c) => ValueKey::Char(c),
        Value::InternStr(id) => ValueKey::Str(interns.get(id).into()),
        Value::Class(ClassRef::Builtin(c)) => ValueKey::Class(ClassKey::Builtin(c)),
        Value::Class(ClassRef::User(id)) => ValueKey::Class(ClassKey::User(id)),
        Value::Builtin(_) => ValueKey::Ref(HeapId::invalid()),
        Value::Ref(id) => match heap.get(id) {
            HeapData::Str(s) => ValueKey::Str(s.as_str().into()),
            _ => ValueKey::Ref(id),
        },
    }
}

/// Renders a value the way `println` shows it: strings bare, containers
/// with their elements in repr form.
pub(crate) fn display(v: Value, heap: &Heap, interns: &Interns) -> String {
    if let Some(s) = v.as_str(heap, interns) {
        return s.to_owned();
    }
    repr_at(v, heap, interns, 0)
}

/// Renders a value in its source-like form (strings quoted).
pub(crate) fn repr(v: Value, heap: &Heap, interns: &Interns) -> String {
    repr_at(v, heap, interns, 0)
}

fn repr_at(v: Value, heap: &Heap, interns: &Interns, depth: usize) -> String {
    if depth > MAX_DATA_DEPTH {
        return "...".to_owned();
    }
    match v {
        Value::Void => "void".to_owned(),
        Value::Null => "null".to_owned(),
        Value::Unset => "unset".to_owned(),
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        // Reals always render with a decimal point or exponent.
        Value::Real(r) => {
            if r.is_finite() {
                ryu::Buffer::new().format(r).to_owned()
            } else {
                r.to_string()
            }
        }
        Value::Char(c) => format!("'{c}'"),
        Value::InternStr(id) => format!("\"{}\"", interns.get(id)),
        Value::Class(class) => class.name(heap, interns).into_owned(),
        Value::Builtin(b) => format!("fun {b}"),
        Value::Ref(id) => repr_heap(id, heap, interns, depth),
    }
}

fn repr_heap(id: HeapId, heap: &Heap, interns: &Interns, depth: usize) -> String {
    match heap.get(id) {
        HeapData::Str(s) => format!("\"{s}\""),
        HeapData::List(list) => {
            let parts: Vec<String> = list
                .items
                .iter()
                .map(|v| repr_at(*v, heap, interns, depth + 1))
                .collect();
            format!("[{}]", parts.join(", "))
        }
        HeapData::Set(set) => {
            let parts: Vec<String> = set
                .items
                .values()
                .map(|v| repr_at(*v, heap, interns, depth + 1))
                .collect();
            format!("Set({})", parts.join(", "))
        }
        HeapData::Map(map) => {
            let parts: Vec<String> = map
                .entries
                .iter()
                .map(|(k, v)| format!("\"{}\": {}", k, repr_at(*v, heap, interns, depth + 1)))
                .collect();
            format!("{{{}}}", parts.join(", "))
        }
        HeapData::Entry(k, v) => format!(
            "{} => {}",
            repr_at(*k, heap, interns, depth + 1),
            repr_at(*v, heap, interns, depth + 1)
        ),
        HeapData::Range(r) => r.render(heap, interns),
        HeapData::Buffer(b) => {
            let parts: Vec<String> = b.bytes.iter().map(ToString::to_string).collect();
            format!("Buffer({})", parts.join(", "))
        }
        HeapData::Regex(r) => format!("Regex(\"{}\")", r.pattern.as_str()),
        HeapData::Class(c) => interns.get(c.name).to_owned(),
        HeapData::Instance(inst) => {
            let class = ClassRef::User(inst.class);
            format!("{}(...)", class.name(heap, interns))
        }
        HeapData::View(view) => repr_at(view.target, heap, interns, depth),
        HeapData::Function(f) => match f.name {
            Some(name) => format!("fun {}", interns.get(name)),
            None => "fun <lambda>".to_owned(),
        },
        HeapData::Bound(b) => repr_at(Value::Ref(b.func), heap, interns, depth),
        HeapData::Native(n) => format!("fun {}", n.name),
        HeapData::Iter(_) => "<iterator>".to_owned(),
        HeapData::Exception(e) => format!("{}({:?})", e.class.name(heap, interns), e.message),
        HeapData::Deferred(_) => "<deferred>".to_owned(),
        HeapData::Mutex(m) => format!("Mutex(locked={})", m.locked),
        HeapData::Channel(_) => "<channel>".to_owned(),
        HeapData::Flow(_) => "<flow>".to_owned(),
        HeapData::Dynamic(_) => "<dynamic>".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceLimits;

    fn heap() -> Heap {
        Heap::new(ResourceLimits::default())
    }

    #[test]
    fn numeric_widening_compare() {
        let heap = heap();
        let interns = Interns::default();
        assert_eq!(compare(Value::Int(1), Value::Real(1.0), &heap, &interns), Some(Ordering::Equal));
        assert_eq!(compare(Value::Int(2), Value::Real(1.5), &heap, &interns), Some(Ordering::Greater));
        assert_eq!(compare(Value::Int(1), Value::Bool(true), &heap, &interns), None);
    }

    #[test]
    fn identity_is_not_structural() {
        // `PartialEq` on Value is reference identity for heap values.
        assert_eq!(Value::Int(3), Value::Int(3));
        assert_ne!(Value::Ref(HeapId::from_raw(0)), Value::Ref(HeapId::from_raw(1)));
    }

    #[test]
    fn reals_render_with_point() {
        let heap = heap();
        let interns = Interns::default();
        assert_eq!(display(Value::Real(1.0), &heap, &interns), "1.0");
        assert_eq!(display(Value::Int(1), &heap, &interns), "1");
    }

    #[test]
    fn strings_bare_at_top_level_quoted_inside() {
        let mut heap = heap();
        let mut interns = Interns::default();
        let id = interns.intern("hi");
        assert_eq!(display(Value::InternStr(id), &heap, &interns), "hi");
        let list = heap
            .allocate(HeapData::List(crate::types::list::List::of(vec![Value::InternStr(id)])))
            .unwrap();
        assert_eq!(display(Value::Ref(list), &heap, &interns), "[\"hi\"]");
    }

    #[test]
    fn integral_real_keys_collapse() {
        let heap = heap();
        let interns = Interns::default();
        assert_eq!(
            value_key(Value::Real(1.0), &heap, &interns),
            value_key(Value::Int(1), &heap, &interns)
        );
    }
}
