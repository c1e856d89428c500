//! Builtin iterator state.
//!
//! Index-based iteration keeps state as small `Copy` data so advancing an
//! iterator needs only one read and one write of its heap cell, with any
//! container access in between - no Rust iterators are held across the
//! heap. User iterables go through the `iterator()`/`hasNext`/`next`
//! method protocol in the evaluator instead.

use crate::{
    exceptions::{Exec, Flow, Raised},
    heap::{Heap, HeapData, HeapId},
    intern::Interns,
    types::class::{ClassRef, CoreClass},
    value::Value,
};

#[derive(Debug, Clone, Copy)]
pub(crate) enum IterState {
    List { id: HeapId, idx: usize },
    Buffer { id: HeapId, idx: usize },
    Set { id: HeapId, idx: usize },
    /// Yields freshly allocated `Entry` values.
    Map { id: HeapId, idx: usize },
    /// Iterates code points of either string representation.
    Str { value: Value, byte: usize },
    IntRange {
        cur: i64,
        end: Option<i64>,
        inclusive: bool,
    },
    CharRange {
        cur: u32,
        end: Option<u32>,
        inclusive: bool,
    },
    Done,
}

/// Builds iteration state for a builtin iterable, or `None` when the value
/// must go through the user iterator protocol.
pub(crate) fn builtin_iter(heap: &Heap, value: Value) -> Option<IterState> {
    match value {
        Value::InternStr(_) => Some(IterState::Str { value, byte: 0 }),
        Value::Ref(id) => match heap.get(id) {
            HeapData::List(_) => Some(IterState::List { id, idx: 0 }),
            HeapData::Buffer(_) => Some(IterState::Buffer { id, idx: 0 }),
            HeapData::Set(_) => Some(IterState::Set { id, idx: 0 }),
            HeapData::Map(_) => Some(IterState::Map { id, idx: 0 }),
            HeapData::Str(_) => Some(IterState::Str { value, byte: 0 }),
            HeapData::Range(r) => {
                if r.is_char_range() {
                    let cur = match r.start {
                        Some(Value::Char(c)) => c as u32,
                        _ => return None,
                    };
                    let end = match r.end {
                        Some(Value::Char(c)) => Some(c as u32),
                        None => None,
                        _ => return None,
                    };
                    Some(IterState::CharRange {
                        cur,
                        end,
                        inclusive: r.inclusive,
                    })
                } else {
                    let (start, end) = r.int_bounds()?;
                    Some(IterState::IntRange {
                        cur: start?,
                        end,
                        inclusive: r.inclusive,
                    })
                }
            }
            HeapData::Iter(_) => None,
            _ => None,
        },
        _ => None,
    }
}

/// Advances the iterator stored at `iter_id`.
///
/// Returns `Ok(None)` when exhausted; the `next()` surface method maps
/// that to `IterationEndException` per the iterator protocol.
pub(crate) fn iter_next(heap: &mut Heap, interns: &Interns, iter_id: HeapId) -> Exec<Option<Value>> {
    let HeapData::Iter(state) = heap.get(iter_id) else {
        return Err(Flow::Raise(Box::new(Raised::new(
            ClassRef::Builtin(CoreClass::IllegalStateError),
            "value is not an iterator",
        ))));
    };
    let state = *state;
    let (value, next_state) = advance(heap, interns, state)?;
    *heap.get_mut(iter_id) = HeapData::Iter(next_state);
    Ok(value)
}

/// Marks a builtin iterator as finished (`cancelIteration`).
pub(crate) fn iter_cancel(heap: &mut Heap, iter_id: HeapId) {
    if let HeapData::Iter(state) = heap.get_mut(iter_id) {
        *state = IterState::Done;
    }
}

fn advance(heap: &mut Heap, interns: &Interns, state: IterState) -> Exec<(Option<Value>, IterState)> {
    match state {
        IterState::Done => Ok((None, IterState::Done)),
        IterState::List { id, idx } => {
            let HeapData::List(list) = heap.get(id) else {
                return Ok((None, IterState::Done));
            };
            match list.items.get(idx) {
                Some(v) => Ok((Some(*v), IterState::List { id, idx: idx + 1 })),
                None => Ok((None, IterState::Done)),
            }
        }
        IterState::Buffer { id, idx } => {
            let HeapData::Buffer(buf) = heap.get(id) else {
                return Ok((None, IterState::Done));
            };
            match buf.bytes.get(idx) {
                Some(b) => Ok((
                    Some(Value::Int(i64::from(*b))),
                    IterState::Buffer { id, idx: idx + 1 },
                )),
                None => Ok((None, IterState::Done)),
            }
        }
        IterState::Set { id, idx } => {
            let HeapData::Set(set) = heap.get(id) else {
                return Ok((None, IterState::Done));
            };
            match set.items.get_index(idx) {
                Some((_, v)) => Ok((Some(*v), IterState::Set { id, idx: idx + 1 })),
                None => Ok((None, IterState::Done)),
            }
        }
        IterState::Map { id, idx } => {
            let HeapData::Map(map) = heap.get(id) else {
                return Ok((None, IterState::Done));
            };
            let Some((k, v)) = map.entries.get_index(idx) else {
                return Ok((None, IterState::Done));
            };
            let (k, v) = (k.clone(), *v);
            let key = heap.alloc_str(k)?;
            let entry = heap.alloc_value(HeapData::Entry(key, v))?;
            Ok((Some(entry), IterState::Map { id, idx: idx + 1 }))
        }
        IterState::Str { value, byte } => {
            let Some(text) = value.as_str(heap, interns) else {
                return Ok((None, IterState::Done));
            };
            match text[byte..].chars().next() {
                Some(c) => Ok((
                    Some(Value::Char(c)),
                    IterState::Str {
                        value,
                        byte: byte + c.len_utf8(),
                    },
                )),
                None => Ok((None, IterState::Done)),
            }
        }
        IterState::IntRange { cur, end, inclusive } => {
            let in_range = match end {
                None => true,
                Some(e) => {
                    if inclusive {
                        cur <= e
                    } else {
                        cur < e
                    }
                }
            };
            if !in_range {
                return Ok((None, IterState::Done));
            }
            let next = match cur.checked_add(1) {
                Some(n) => IterState::IntRange {
                    cur: n,
                    end,
                    inclusive,
                },
                None => IterState::Done,
            };
            Ok((Some(Value::Int(cur)), next))
        }
        IterState::CharRange { cur, end, inclusive } => {
            let in_range = match end {
                None => true,
                Some(e) => {
                    if inclusive {
                        cur <= e
                    } else {
                        cur < e
                    }
                }
            };
            let Some(c) = char::from_u32(cur) else {
                // Skip the surrogate gap.
                return advance(
                    heap,
                    interns,
                    IterState::CharRange {
                        cur: cur + 1,
                        end,
                        inclusive,
                    },
                );
            };
            if !in_range {
                return Ok((None, IterState::Done));
            }
            Ok((
                Some(Value::Char(c)),
                IterState::CharRange {
                    cur: cur + 1,
                    end,
                    inclusive,
                },
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{resource::ResourceLimits, types::list::List};

    fn collect_all(heap: &mut Heap, interns: &Interns, iter: HeapId) -> Vec<Value> {
        let mut out = Vec::new();
        while let Some(v) = iter_next(heap, interns, iter).unwrap() {
            out.push(v);
        }
        out
    }

    #[test]
    fn list_iteration_in_order() {
        let mut heap = Heap::new(ResourceLimits::default());
        let interns = Interns::default();
        let items = vec![Value::Int(1), Value::Int(2), Value::Int(3)];
        let list = heap.allocate(HeapData::List(List::of(items.clone()))).unwrap();
        let state = builtin_iter(&heap, Value::Ref(list)).unwrap();
        let iter = heap.allocate(HeapData::Iter(state)).unwrap();
        assert_eq!(collect_all(&mut heap, &interns, iter), items);
    }

    #[test]
    fn string_iteration_yields_code_points() {
        let mut heap = Heap::new(ResourceLimits::default());
        let mut interns = Interns::default();
        let id = interns.intern("aé");
        let state = builtin_iter(&heap, Value::InternStr(id)).unwrap();
        let iter = heap.allocate(HeapData::Iter(state)).unwrap();
        assert_eq!(
            collect_all(&mut heap, &interns, iter),
            vec![Value::Char('a'), Value::Char('é')]
        );
    }

    #[test]
    fn cancelled_iterator_is_done() {
        let mut heap = Heap::new(ResourceLimits::default());
        let interns = Interns::default();
        let iter = heap
            .allocate(HeapData::Iter(IterState::IntRange {
                cur: 0,
                end: None,
                inclusive: false,
            }))
            .unwrap();
        assert_eq!(iter_next(&mut heap, &interns, iter).unwrap(), Some(Value::Int(0)));
        iter_cancel(&mut heap, iter);
        assert_eq!(iter_next(&mut heap, &interns, iter).unwrap(), None);
    }
}
