//! The `Range` payload: closed or half-open, numeric or `Char`, possibly
//! open-ended on either side.

use std::cmp::Ordering;

use crate::{
    exceptions::{Exec, Flow, Raised},
    heap::Heap,
    intern::Interns,
    types::class::{ClassRef, CoreClass},
    value::{Value, compare, repr},
};

#[derive(Debug, PartialEq)]
pub(crate) struct RangeData {
    /// `None` means the start is open (`..n`).
    pub start: Option<Value>,
    /// `None` means the end is open (`n..`).
    pub end: Option<Value>,
    /// `a..b` is end-inclusive, `a..<b` end-exclusive.
    pub inclusive: bool,
}

fn open_range_error(what: &str) -> Flow {
    Flow::Raise(Box::new(Raised::new(
        ClassRef::Builtin(CoreClass::IllegalStateError),
        format!("open-ended range has no {what}"),
    )))
}

impl RangeData {
    /// Integer bounds when this is an `Int` range.
    pub fn int_bounds(&self) -> Option<(Option<i64>, Option<i64>)> {
        let start = match self.start {
            None => None,
            Some(Value::Int(i)) => Some(i),
            Some(_) => return None,
        };
        let end = match self.end {
            None => None,
            Some(Value::Int(i)) => Some(i),
            Some(_) => return None,
        };
        Some((start, end))
    }

    pub fn is_char_range(&self) -> bool {
        matches!(self.start, Some(Value::Char(_))) || matches!(self.end, Some(Value::Char(_)))
    }

    /// Number of elements of a fully-bounded `Int` or `Char` range.
    pub fn size(&self) -> Exec<i64> {
        match (self.start, self.end) {
            (Some(Value::Int(a)), Some(Value::Int(b))) => {
                let span = b - a + i64::from(self.inclusive);
                Ok(span.max(0))
            }
            (Some(Value::Char(a)), Some(Value::Char(b))) => {
                let span = i64::from(b as u32) - i64::from(a as u32) + i64::from(self.inclusive);
                Ok(span.max(0))
            }
            _ => Err(open_range_error("size")),
        }
    }

    /// Membership: `start <= v` and `v < end` (or `<=` when inclusive),
    /// with open sides always passing.
    pub fn contains(&self, v: Value, heap: &Heap, interns: &Interns) -> bool {
        if let Some(start) = self.start {
            match compare(start, v, heap, interns) {
                Some(Ordering::Less | Ordering::Equal) => {}
                _ => return false,
            }
        }
        if let Some(end) = self.end {
            match compare(v, end, heap, interns) {
                Some(Ordering::Less) => {}
                Some(Ordering::Equal) if self.inclusive => {}
                _ => return false,
            }
        }
        true
    }

    /// Indexed access into a bounded `Int` range.
    pub fn get_at(&self, index: i64) -> Exec<Value> {
        let size = self.size()?;
        let idx = if index < 0 { index + size } else { index };
        if idx < 0 || idx >= size {
            return Err(Flow::Raise(Box::new(Raised::new(
                ClassRef::Builtin(CoreClass::IndexOutOfBoundsError),
                format!("index {index} out of bounds for range of size {size}"),
            ))));
        }
        match self.start {
            Some(Value::Int(a)) => Ok(Value::Int(a + idx)),
            Some(Value::Char(a)) => {
                let code = a as u32 + idx as u32;
                Ok(Value::Char(char::from_u32(code).unwrap_or(a)))
            }
            _ => Err(open_range_error("indexed access")),
        }
    }

    pub fn render(&self, heap: &Heap, interns: &Interns) -> String {
        let start = self.start.map(|v| repr(v, heap, interns)).unwrap_or_default();
        let end = self.end.map(|v| repr(v, heap, interns)).unwrap_or_default();
        let op = if self.inclusive { ".." } else { "..<" };
        format!("{start}{op}{end}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceLimits;

    fn int_range(a: i64, b: i64, inclusive: bool) -> RangeData {
        RangeData {
            start: Some(Value::Int(a)),
            end: Some(Value::Int(b)),
            inclusive,
        }
    }

    #[test]
    fn sizes() {
        assert_eq!(int_range(1, 5, true).size().unwrap(), 5);
        assert_eq!(int_range(1, 5, false).size().unwrap(), 4);
        assert_eq!(int_range(5, 1, true).size().unwrap(), 0);
    }

    #[test]
    fn open_ranges_have_no_size() {
        let r = RangeData {
            start: Some(Value::Int(1)),
            end: None,
            inclusive: true,
        };
        assert!(r.size().is_err());
    }

    #[test]
    fn membership_and_open_sides() {
        let heap = Heap::new(ResourceLimits::default());
        let interns = Interns::default();
        assert!(int_range(1, 5, true).contains(Value::Int(5), &heap, &interns));
        assert!(!int_range(1, 5, false).contains(Value::Int(5), &heap, &interns));
        let open = RangeData {
            start: None,
            end: Some(Value::Int(5)),
            inclusive: false,
        };
        assert!(open.contains(Value::Int(-100), &heap, &interns));
        assert!(!open.contains(Value::Int(5), &heap, &interns));
    }

    #[test]
    fn char_range_size() {
        let r = RangeData {
            start: Some(Value::Char('a')),
            end: Some(Value::Char('e')),
            inclusive: true,
        };
        assert_eq!(r.size().unwrap(), 5);
    }

    #[test]
    fn indexed_access() {
        assert_eq!(int_range(3, 10, true).get_at(0).unwrap(), Value::Int(3));
        assert_eq!(int_range(3, 10, true).get_at(-1).unwrap(), Value::Int(10));
        assert!(int_range(3, 10, false).get_at(7).is_err());
    }
}
