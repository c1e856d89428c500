//! Binary and unary operator evaluation.
//!
//! Hot primitive pairs (Int/Int, Real/Real, Bool) are handled with typed
//! arithmetic before any dispatch; user instances get a chance to define
//! the operator as a method (`plus`, `minus`, `times`, `div`, `mod`,
//! `compareTo`, `contains`, `negate`). Equality is `compareTo == 0`;
//! reference identity is the separate `===`.

use std::cmp::Ordering;

use crate::{
    args::ArgValues,
    exceptions::Exec,
    heap::{HeapData, HeapId},
    machine::Mx,
    nodes::{BinOp, UnOp},
    scope::ScopeId,
    source::Span,
    types::{
        class::CoreClass,
        list::List,
        map::MapData,
        set::SetData,
    },
    value::{Value, value_key},
};

use super::{attr, call_method};

fn type_names(mx: &Mx, a: Value, b: Value) -> (String, String) {
    let heap = mx.heap.borrow();
    let interns = mx.interns.borrow();
    (
        a.type_name(&heap, &interns).into_owned(),
        b.type_name(&heap, &interns).into_owned(),
    )
}

fn unsupported(mx: &Mx, op: &str, a: Value, b: Value, span: Span) -> crate::exceptions::Flow {
    let (ta, tb) = type_names(mx, a, b);
    mx.raise_at(
        CoreClass::IllegalOperationError,
        format!("operator '{op}' is not defined for {ta} and {tb}"),
        span,
    )
}

pub(crate) async fn binary_op(
    mx: &Mx,
    scope: ScopeId,
    op: BinOp,
    a: Value,
    b: Value,
    span: Span,
) -> Exec<Value> {
    match op {
        BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Rem => {
            arith(mx, scope, op, a, b, span).await
        }
        BinOp::BitAnd | BinOp::BitOr | BinOp::BitXor | BinOp::Shl | BinOp::Shr | BinOp::Ushr => {
            bitwise(mx, op, a, b, span)
        }
        BinOp::Eq => Ok(Value::Bool(equals(mx, scope, a, b, span).await?)),
        BinOp::NotEq => Ok(Value::Bool(!equals(mx, scope, a, b, span).await?)),
        BinOp::RefEq => Ok(Value::Bool(a == b)),
        BinOp::RefNotEq => Ok(Value::Bool(a != b)),
        BinOp::Lt | BinOp::LtEq | BinOp::Gt | BinOp::GtEq => {
            let Some(ordering) = compare_values(mx, scope, a, b, span).await? else {
                return Err(unsupported(mx, cmp_symbol(op), a, b, span));
            };
            let result = match op {
                BinOp::Lt => ordering == Ordering::Less,
                BinOp::LtEq => ordering != Ordering::Greater,
                BinOp::Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            };
            Ok(Value::Bool(result))
        }
        BinOp::Shuttle => {
            let Some(ordering) = compare_values(mx, scope, a, b, span).await? else {
                return Err(unsupported(mx, "<=>", a, b, span));
            };
            Ok(Value::Int(match ordering {
                Ordering::Less => -1,
                Ordering::Equal => 0,
                Ordering::Greater => 1,
            }))
        }
        BinOp::Entry => mx.alloc(HeapData::Entry(a, b)),
    }
}

fn cmp_symbol(op: BinOp) -> &'static str {
    match op {
        BinOp::Lt => "<",
        BinOp::LtEq => "<=",
        BinOp::Gt => ">",
        BinOp::GtEq => ">=",
        _ => "?",
    }
}

const fn op_symbol(op: BinOp) -> &'static str {
    match op {
        BinOp::Add => "+",
        BinOp::Sub => "-",
        BinOp::Mul => "*",
        BinOp::Div => "/",
        BinOp::Rem => "%",
        _ => "?",
    }
}

const fn op_method(op: BinOp) -> &'static str {
    match op {
        BinOp::Add => "plus",
        BinOp::Sub => "minus",
        BinOp::Mul => "times",
        BinOp::Div => "div",
        BinOp::Rem => "mod",
        _ => "?",
    }
}

async fn arith(mx: &Mx, scope: ScopeId, op: BinOp, a: Value, b: Value, span: Span) -> Exec<Value> {
    // Int (.) Int stays Int; any Real operand widens to Real.
    if let (Value::Int(x), Value::Int(y)) = (a, b) {
        return match op {
            BinOp::Add => Ok(Value::Int(x.wrapping_add(y))),
            BinOp::Sub => Ok(Value::Int(x.wrapping_sub(y))),
            BinOp::Mul => Ok(Value::Int(x.wrapping_mul(y))),
            // Integer division truncates toward zero; `%` keeps the sign
            // of the dividend.
            BinOp::Div => {
                if y == 0 {
                    Err(mx.raise_at(CoreClass::IllegalOperationError, "division by zero", span))
                } else {
                    Ok(Value::Int(x.wrapping_div(y)))
                }
            }
            BinOp::Rem => {
                if y == 0 {
                    Err(mx.raise_at(CoreClass::IllegalOperationError, "division by zero", span))
                } else {
                    Ok(Value::Int(x.wrapping_rem(y)))
                }
            }
            _ => unreachable!("arith covers + - * / %"),
        };
    }
    if let (Some(x), Some(y)) = (a.as_real(), b.as_real()) {
        return Ok(Value::Real(match op {
            BinOp::Add => x + y,
            BinOp::Sub => x - y,
            BinOp::Mul => x * y,
            BinOp::Div => x / y,
            BinOp::Rem => x % y,
            _ => unreachable!("arith covers + - * / %"),
        }));
    }

    // Char arithmetic: Char + Int shifts the code point, Char - Char is
    // the code point distance.
    match (op, a, b) {
        (BinOp::Add, Value::Char(c), Value::Int(n)) | (BinOp::Sub, Value::Char(c), Value::Int(n)) => {
            let delta = if matches!(op, BinOp::Add) { n } else { -n };
            let code = i64::from(c as u32) + delta;
            let shifted = u32::try_from(code).ok().and_then(char::from_u32);
            return match shifted {
                Some(c) => Ok(Value::Char(c)),
                None => Err(mx.raise_at(
                    CoreClass::IllegalArgumentError,
                    "Char arithmetic left the Unicode range",
                    span,
                )),
            };
        }
        (BinOp::Sub, Value::Char(x), Value::Char(y)) => {
            return Ok(Value::Int(i64::from(x as u32) - i64::from(y as u32)));
        }
        _ => {}
    }

    // String concatenation: a String left operand renders the right side.
    if matches!(op, BinOp::Add) {
        let lhs_str = {
            let heap = mx.heap.borrow();
            let interns = mx.interns.borrow();
            a.as_str(&heap, &interns).map(ToOwned::to_owned)
        };
        if let Some(s) = lhs_str {
            let rhs = mx.display(b);
            return mx.alloc_str(format!("{s}{rhs}"));
        }
    }

    if let (Value::Ref(ia), Value::Ref(ib)) = (a, b)
        && let Some(result) = container_arith(mx, op, ia, ib)?
    {
        return Ok(result);
    }

    // User-defined operator methods.
    if attr::has_user_method(mx, a, op_method(op)) {
        let name = mx.intern(op_method(op));
        return call_method(mx, scope, a, name, ArgValues::one(b), span).await;
    }

    Err(unsupported(mx, op_symbol(op), a, b, span))
}

/// Container operators: `List + List`, `Map + Map` (rightmost wins),
/// `Set + Set` (union), `Set - Set` (difference).
fn container_arith(mx: &Mx, op: BinOp, a: HeapId, b: HeapId) -> Exec<Option<Value>> {
    enum Out {
        List(Vec<Value>),
        Map(MapData),
        Set(SetData),
    }
    let out = {
        let heap = mx.heap.borrow();
        match (op, heap.get(a), heap.get(b)) {
            (BinOp::Add, HeapData::List(x), HeapData::List(y)) => {
                let mut items = x.items.clone();
                items.extend(y.items.iter().copied());
                Some(Out::List(items))
            }
            (BinOp::Add, HeapData::Map(x), HeapData::Map(y)) => {
                let mut merged = MapData::default();
                for (k, v) in &x.entries {
                    merged.put(k.clone(), *v);
                }
                for (k, v) in &y.entries {
                    merged.put(k.clone(), *v);
                }
                Some(Out::Map(merged))
            }
            (BinOp::Add, HeapData::Set(x), HeapData::Set(y)) => {
                let mut union = SetData::default();
                for (k, v) in &x.items {
                    union.items.insert(k.clone(), *v);
                }
                for (k, v) in &y.items {
                    union.items.insert(k.clone(), *v);
                }
                Some(Out::Set(union))
            }
            (BinOp::Sub, HeapData::Set(x), HeapData::Set(y)) => {
                let mut diff = SetData::default();
                for (k, v) in &x.items {
                    if !y.items.contains_key(k) {
                        diff.items.insert(k.clone(), *v);
                    }
                }
                Some(Out::Set(diff))
            }
            _ => None,
        }
    };
    match out {
        Some(Out::List(items)) => Ok(Some(mx.alloc(HeapData::List(List::of(items)))?)),
        Some(Out::Map(map)) => Ok(Some(mx.alloc(HeapData::Map(map))?)),
        Some(Out::Set(set)) => Ok(Some(mx.alloc(HeapData::Set(set))?)),
        None => Ok(None),
    }
}

/// Bitwise operators are `Int`-only; shift counts are masked to 0..63,
/// `>>` is arithmetic and `>>>` logical.
fn bitwise(mx: &Mx, op: BinOp, a: Value, b: Value, span: Span) -> Exec<Value> {
    let (Value::Int(x), Value::Int(y)) = (a, b) else {
        return Err(unsupported(
            mx,
            match op {
                BinOp::BitAnd => "&",
                BinOp::BitOr => "|",
                BinOp::BitXor => "^",
                BinOp::Shl => "<<",
                BinOp::Shr => ">>",
                _ => ">>>",
            },
            a,
            b,
            span,
        ));
    };
    let shift = (y & 63) as u32;
    Ok(Value::Int(match op {
        BinOp::BitAnd => x & y,
        BinOp::BitOr => x | y,
        BinOp::BitXor => x ^ y,
        BinOp::Shl => x.wrapping_shl(shift),
        BinOp::Shr => x.wrapping_shr(shift),
        BinOp::Ushr => ((x as u64).wrapping_shr(shift)) as i64,
        _ => unreachable!("bitwise covers & | ^ << >> >>>"),
    }))
}

pub(crate) fn unary_op(mx: &Mx, op: UnOp, v: Value, span: Span) -> Exec<Value> {
    match (op, v) {
        (UnOp::Neg, Value::Int(i)) => Ok(Value::Int(i.wrapping_neg())),
        (UnOp::Neg, Value::Real(r)) => Ok(Value::Real(-r)),
        (UnOp::Pos, Value::Int(_) | Value::Real(_)) => Ok(v),
        (UnOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
        (UnOp::BitNot, Value::Int(i)) => Ok(Value::Int(!i)),
        _ => {
            let type_name = {
                let heap = mx.heap.borrow();
                let interns = mx.interns.borrow();
                v.type_name(&heap, &interns).into_owned()
            };
            let symbol = match op {
                UnOp::Neg => "-",
                UnOp::Pos => "+",
                UnOp::Not => "!",
                UnOp::BitNot => "~",
            };
            Err(mx.raise_at(
                CoreClass::IllegalOperationError,
                format!("unary '{symbol}' is not defined for {type_name}"),
                span,
            ))
        }
    }
}

/// Equality: class-dispatched `compareTo == 0`, falling back to reference
/// identity when the values are incomparable.
pub(crate) async fn equals(mx: &Mx, scope: ScopeId, a: Value, b: Value, span: Span) -> Exec<bool> {
    match compare_values(mx, scope, a, b, span).await? {
        Some(ordering) => Ok(ordering == Ordering::Equal),
        None => Ok(a == b),
    }
}

/// Three-way comparison with user `compareTo` dispatch.
///
/// Enum entries compare by ordinal within one enum; comparing entries of
/// different enums is an error rather than `None` so it cannot silently
/// order.
pub(crate) async fn compare_values(
    mx: &Mx,
    scope: ScopeId,
    a: Value,
    b: Value,
    span: Span,
) -> Exec<Option<Ordering>> {
    if let Some(result) = enum_compare(mx, a, b, span)? {
        return result.map(Some);
    }

    if attr::has_user_method(mx, a, "compareTo") {
        let name = mx.intern("compareTo");
        let out = call_method(mx, scope, a, name, ArgValues::one(b), span).await?;
        let Value::Int(i) = out else {
            return Err(mx.raise_at(
                CoreClass::IllegalArgumentError,
                "compareTo must return an Int",
                span,
            ));
        };
        return Ok(Some(i.cmp(&0)));
    }
    if attr::has_user_method(mx, b, "compareTo") {
        let name = mx.intern("compareTo");
        let out = call_method(mx, scope, b, name, ArgValues::one(a), span).await?;
        let Value::Int(i) = out else {
            return Err(mx.raise_at(
                CoreClass::IllegalArgumentError,
                "compareTo must return an Int",
                span,
            ));
        };
        return Ok(Some(0.cmp(&i)));
    }

    let heap = mx.heap.borrow();
    let interns = mx.interns.borrow();
    Ok(crate::value::compare(a, b, &heap, &interns))
}

/// `Some(result)` when both operands are enum entries.
#[expect(clippy::type_complexity, reason = "nested result mirrors control flow")]
fn enum_compare(mx: &Mx, a: Value, b: Value, span: Span) -> Exec<Option<Exec<Ordering>>> {
    let heap = mx.heap.borrow();
    let (Value::Ref(ia), Value::Ref(ib)) = (a, b) else {
        return Ok(None);
    };
    let (HeapData::Instance(x), HeapData::Instance(y)) = (heap.get(ia), heap.get(ib)) else {
        return Ok(None);
    };
    let enum_info = |class: HeapId| match heap.get(class) {
        HeapData::Class(c) if c.is_enum => Some(c.uid),
        _ => None,
    };
    let (Some(ua), Some(ub)) = (enum_info(x.class), enum_info(y.class)) else {
        return Ok(None);
    };
    if ua != ub {
        drop(heap);
        return Ok(Some(Err(mx.raise_at(
            CoreClass::IllegalArgumentError,
            "cannot compare entries of different enums",
            span,
        ))));
    }
    let ordinal = |inst: &crate::types::class::Instance, uid: u64| {
        match inst.get(uid, crate::intern::sym::ORDINAL) {
            Some(crate::types::class::InstSlot::Plain(Value::Int(i))) => i,
            _ => 0,
        }
    };
    let (oa, ob) = (ordinal(x, ua), ordinal(y, ub));
    Ok(Some(Ok(oa.cmp(&ob))))
}

/// Membership: `right.contains(left)` per the container's class, with the
/// `Obj` default of plain equality.
pub(crate) async fn contains(
    mx: &Mx,
    scope: ScopeId,
    container: Value,
    item: Value,
    span: Span,
) -> Exec<bool> {
    enum Kind {
        ListScan(Vec<Value>),
        Found(bool),
        Method,
        Default,
    }
    let kind = {
        let heap = mx.heap.borrow();
        let interns = mx.interns.borrow();
        match container {
            Value::InternStr(_) => {
                let text = container.as_str(&heap, &interns).unwrap_or_default();
                Kind::Found(str_contains(text, item, &heap, &interns))
            }
            Value::Ref(id) => match heap.get(id) {
                HeapData::Str(_) => {
                    let text = container.as_str(&heap, &interns).unwrap_or_default();
                    Kind::Found(str_contains(text, item, &heap, &interns))
                }
                HeapData::List(list) => Kind::ListScan(list.items.clone()),
                HeapData::Set(set) => {
                    Kind::Found(set.items.contains_key(&value_key(item, &heap, &interns)))
                }
                HeapData::Map(map) => {
                    let key = item.as_str(&heap, &interns);
                    Kind::Found(key.is_some_and(|k| map.entries.contains_key(k)))
                }
                HeapData::Range(range) => Kind::Found(range.contains(item, &heap, &interns)),
                HeapData::Buffer(buf) => Kind::Found(match item {
                    Value::Int(i) => u8::try_from(i).is_ok_and(|b| buf.bytes.contains(&b)),
                    _ => false,
                }),
                HeapData::Instance(_) | HeapData::View(_) | HeapData::Dynamic(_) => Kind::Method,
                _ => Kind::Default,
            },
            _ => Kind::Default,
        }
    };
    match kind {
        Kind::Found(found) => Ok(found),
        Kind::ListScan(items) => {
            for element in items {
                if equals(mx, scope, element, item, span).await? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Kind::Method => {
            if attr::has_user_method(mx, container, "contains") {
                let name = mx.intern("contains");
                let out = call_method(mx, scope, container, name, ArgValues::one(item), span).await?;
                super::truthy(mx, out, span)
            } else {
                equals(mx, scope, container, item, span).await
            }
        }
        Kind::Default => equals(mx, scope, container, item, span).await,
    }
}

fn str_contains(text: &str, item: Value, heap: &crate::heap::Heap, interns: &crate::intern::Interns) -> bool {
    match item {
        Value::Char(c) => text.contains(c),
        _ => item.as_str(heap, interns).is_some_and(|needle| text.contains(needle)),
    }
}
