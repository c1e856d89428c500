//! String interning.
//!
//! Identifiers, member names and string literals are interned once per
//! engine and referenced by [`StringId`] everywhere else. A fixed set of
//! names the evaluator dispatches on (method names like `iterator`,
//! `hasNext`, the implicit `it` parameter, …) is pre-interned at a known
//! index so hot paths compare ids instead of strings.

use ahash::AHashMap;

/// Index into the interner's string table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct StringId(u32);

impl StringId {
    #[inline]
    #[must_use]
    pub(crate) const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

macro_rules! static_strings {
    ($($konst:ident => $text:literal),+ $(,)?) => {
        /// Pre-interned names the evaluator dispatches on.
        pub(crate) mod sym {
            use super::StringId;
            static_strings!(@consts 0u32; $($konst => $text),+);
        }

        const STATIC_STRINGS: &[&str] = &[$($text),+];
    };
    (@consts $idx:expr; $konst:ident => $text:literal) => {
        pub const $konst: StringId = StringId::from_raw($idx);
    };
    (@consts $idx:expr; $konst:ident => $text:literal, $($rest:ident => $rtext:literal),+) => {
        pub const $konst: StringId = StringId::from_raw($idx);
        static_strings!(@consts $idx + 1u32; $($rest => $rtext),+);
    };
}

static_strings! {
    IT => "it",
    THIS => "this",
    MESSAGE => "message",
    CAUSE => "cause",
    ITERATOR => "iterator",
    HAS_NEXT => "hasNext",
    NEXT => "next",
    CANCEL_ITERATION => "cancelIteration",
    CONTAINS => "contains",
    COMPARE_TO => "compareTo",
    TO_STRING => "toString",
    GET_AT => "getAt",
    PUT_AT => "putAt",
    SIZE => "size",
    BIND => "bind",
    GET_VALUE => "getValue",
    SET_VALUE => "setValue",
    INVOKE => "invoke",
    GET => "get",
    SET => "set",
    EMIT => "emit",
    NAME => "name",
    ORDINAL => "ordinal",
    ENTRIES => "entries",
    VALUE_OF => "valueOf",
    KEY => "key",
    VALUE => "value",
    CLASS => "class",
    LINEARIZATION => "linearization",
    START => "start",
    END => "end",
    END_INCLUSIVE => "endInclusive",
    AWAIT => "await",
    IS_ACTIVE => "isActive",
    IS_COMPLETED => "isCompleted",
}

/// The engine-wide string table.
///
/// Interning is append-only; ids stay valid for the lifetime of the engine.
#[derive(Debug)]
pub(crate) struct Interns {
    strings: Vec<Box<str>>,
    ids: AHashMap<Box<str>, StringId>,
}

impl Default for Interns {
    fn default() -> Self {
        let mut interns = Self {
            strings: Vec::with_capacity(STATIC_STRINGS.len() + 64),
            ids: AHashMap::with_capacity(STATIC_STRINGS.len() + 64),
        };
        for s in STATIC_STRINGS {
            interns.intern(s);
        }
        interns
    }
}

impl Interns {
    /// Interns a string, returning its stable id.
    pub fn intern(&mut self, s: &str) -> StringId {
        if let Some(&id) = self.ids.get(s) {
            return id;
        }
        let id = StringId(self.strings.len() as u32);
        self.strings.push(s.into());
        self.ids.insert(s.into(), id);
        id
    }

    /// Looks up a string without interning it.
    pub fn get_id(&self, s: &str) -> Option<StringId> {
        self.ids.get(s).copied()
    }

    /// Returns the text for an id.
    ///
    /// # Panics
    /// Panics if the id did not come from this interner.
    pub fn get(&self, id: StringId) -> &str {
        &self.strings[id.index()]
    }

    /// Number of interned strings (static set included).
    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_names_have_fixed_ids() {
        let interns = Interns::default();
        assert_eq!(interns.get(sym::IT), "it");
        assert_eq!(interns.get(sym::ITERATOR), "iterator");
        assert_eq!(interns.get(sym::IS_COMPLETED), "isCompleted");
    }

    #[test]
    fn interning_is_idempotent() {
        let mut interns = Interns::default();
        let a = interns.intern("fib");
        let b = interns.intern("fib");
        assert_eq!(a, b);
        assert_eq!(interns.get(a), "fib");
    }

    #[test]
    fn pre_interned_lookup_matches() {
        let mut interns = Interns::default();
        assert_eq!(interns.intern("hasNext"), sym::HAS_NEXT);
        assert_eq!(interns.get_id("emit"), Some(sym::EMIT));
    }
}
