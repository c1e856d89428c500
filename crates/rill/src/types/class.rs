//! The class model: builtin classes, user classes and instances.
//!
//! Every value carries a class. Builtin classes are the process-wide
//! [`CoreClass`] enum with a static parent chain; user classes are
//! [`ClassObject`]s on the heap. [`ClassRef`] unifies the two so
//! linearization, `is` checks and catch matching use one mechanism.
//!
//! # Field storage
//!
//! Instances keep one field block per declaring class (`class uid ->
//! slots`). Unqualified access resolves through the linearization
//! (first declarer wins); qualified access (`this@Type.x`, `(e as T).x`)
//! indexes the declaring class's block directly.

use std::{
    borrow::Cow,
    rc::Rc,
    sync::atomic::{AtomicU64, Ordering},
};

use ahash::AHashMap;
use strum::{Display, EnumString, IntoStaticStr};

use crate::{
    heap::{Heap, HeapData, HeapId},
    intern::{Interns, StringId},
    nodes::{ClassDef, Signature, Visibility},
    scope::ScopeId,
    value::Value,
};

/// Builtin classes, each a process-wide singleton.
///
/// The error taxonomy lives here too: a raised builtin error's class is a
/// `CoreClass`, and catch matching walks the same parent chain as `is`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr, serde::Serialize, serde::Deserialize)]
pub enum CoreClass {
    /// Root of the hierarchy; defines default `toString` and `contains`.
    Obj,
    Int,
    Real,
    Bool,
    Char,
    #[strum(to_string = "String")]
    Str,
    Void,
    Null,
    Unset,
    Iterable,
    Collection,
    Array,
    List,
    Set,
    Map,
    MapEntry,
    Range,
    Buffer,
    Iterator,
    Callable,
    Class,
    Regex,
    Flow,
    Deferred,
    Mutex,
    Channel,
    Enum,
    Dynamic,

    // --- error taxonomy ---
    /// Root error class; every raisable class descends from it.
    Exception,
    NullPointerError,
    AssertionFailed,
    ClassCastError,
    IndexOutOfBoundsError,
    IllegalArgumentError,
    IllegalAssignmentError,
    #[strum(to_string = "SymbolNotDefinedError", serialize = "SymbolNotFound")]
    SymbolNotDefinedError,
    IterationEndException,
    AccessError,
    IllegalOperationError,
    IllegalStateError,
    NotImplementedError,
    /// Adapter for errors raised by the host.
    UnknownException,
}

impl CoreClass {
    /// Parent in the builtin hierarchy; only `Obj` has none.
    #[must_use]
    pub fn parent(self) -> Option<Self> {
        Some(match self {
            Self::Obj => return None,
            Self::Collection => Self::Iterable,
            Self::Array => Self::Collection,
            Self::List | Self::Buffer => Self::Array,
            Self::Set | Self::Map => Self::Collection,
            Self::Range | Self::Str => Self::Iterable,
            Self::NullPointerError
            | Self::AssertionFailed
            | Self::ClassCastError
            | Self::IndexOutOfBoundsError
            | Self::IllegalArgumentError
            | Self::IllegalAssignmentError
            | Self::SymbolNotDefinedError
            | Self::IterationEndException
            | Self::AccessError
            | Self::IllegalOperationError
            | Self::IllegalStateError
            | Self::NotImplementedError
            | Self::UnknownException => Self::Exception,
            _ => Self::Obj,
        })
    }

    /// True for classes in the error taxonomy (catchable by `try`).
    #[must_use]
    pub fn is_error(self) -> bool {
        self == Self::Exception || self.parent() == Some(Self::Exception)
    }

    /// The chain `[self, parent, ..., Obj]`.
    #[must_use]
    pub fn chain(self) -> Vec<Self> {
        let mut out = vec![self];
        let mut cur = self;
        while let Some(p) = cur.parent() {
            out.push(p);
            cur = p;
        }
        out
    }
}

/// A class, builtin or user-defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ClassRef {
    Builtin(CoreClass),
    User(HeapId),
}

impl ClassRef {
    pub fn name<'a>(&self, heap: &'a Heap, interns: &'a Interns) -> Cow<'a, str> {
        match self {
            Self::Builtin(c) => Cow::Borrowed(<&'static str>::from(*c)),
            Self::User(id) => match heap.get(*id) {
                HeapData::Class(class) => Cow::Borrowed(interns.get(class.name)),
                _ => Cow::Borrowed("<class>"),
            },
        }
    }

    /// Full linearization, `self` first, ending at `Obj`.
    pub fn linearization(&self, heap: &Heap) -> Vec<Self> {
        match self {
            Self::Builtin(c) => c.chain().into_iter().map(Self::Builtin).collect(),
            Self::User(id) => match heap.get(*id) {
                HeapData::Class(class) => class.lin.clone(),
                _ => vec![Self::Builtin(CoreClass::Obj)],
            },
        }
    }

    /// `self` is `other` or a transitive descendant of it.
    pub fn is_subclass_of(&self, other: Self, heap: &Heap) -> bool {
        if *self == other {
            return true;
        }
        self.linearization(heap).contains(&other)
    }

    pub fn as_user(&self) -> Option<HeapId> {
        match self {
            Self::User(id) => Some(*id),
            Self::Builtin(_) => None,
        }
    }
}

static NEXT_CLASS_UID: AtomicU64 = AtomicU64::new(1);

/// Allocates a process-unique class uid (keys instance field blocks).
pub(crate) fn fresh_class_uid() -> u64 {
    NEXT_CLASS_UID.fetch_add(1, Ordering::Relaxed)
}

/// What a class member resolves to. Values are small and `Copy`; the nodes
/// backing fields and delegates are read from the class's `def` at
/// construction time.
#[derive(Debug, Clone, Copy)]
pub(crate) enum MemberKind {
    Field { mutable: bool },
    /// The function value captures the class declaration scope.
    Method(Value),
    Property {
        getter: Option<Value>,
        setter: Option<Value>,
    },
    /// `val x by d` / `fun f by d` member; the bound delegate lives in the
    /// instance's field block under the member name.
    Delegated { fun: bool },
    Abstract,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Member {
    pub kind: MemberKind,
    pub visibility: Visibility,
}

/// A resolved base class plus the index of its constructor-argument list
/// in the class definition.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RuntimeBase {
    pub class: ClassRef,
    pub args_index: usize,
}

/// A user class, created by evaluating a `class` / `object` / `enum`
/// declaration.
#[derive(Debug)]
pub(crate) struct ClassObject {
    pub name: StringId,
    /// Process-unique; keys per-declaring-class field blocks.
    pub uid: u64,
    /// The declaration, kept for constructor-time field initialisers and
    /// base constructor arguments. `None` for enum classes.
    pub def: Option<Rc<ClassDef>>,
    pub sig: Rc<Signature>,
    pub bases: Vec<RuntimeBase>,
    /// C3 linearization, starting with this class itself.
    pub lin: Vec<ClassRef>,
    pub members: AHashMap<StringId, Member>,
    pub statics: AHashMap<StringId, Value>,
    /// Scope the class was declared in; methods and field initialisers
    /// resolve free names against it.
    pub decl_scope: ScopeId,
    pub is_abstract: bool,
    pub is_open: bool,
    pub is_enum: bool,
    /// The eager single instance of an `object` declaration.
    pub singleton: Option<Value>,
    /// Enum entries in declaration order.
    pub entries: Vec<Value>,
}

impl ClassObject {
    /// Looks up a member along the linearization: first declaring class
    /// wins. Returns the declaring class together with the member.
    pub fn find_member(heap: &Heap, class: ClassRef, name: StringId) -> Option<(ClassRef, Member)> {
        for entry in class.linearization(heap) {
            if let ClassRef::User(id) = entry
                && let HeapData::Class(c) = heap.get(id)
                && let Some(member) = c.members.get(&name)
            {
                return Some((entry, *member));
            }
        }
        None
    }

    /// Like [`Self::find_member`], but starts searching *after* `after` in
    /// the linearization - the `super.m()` dispatch rule.
    pub fn find_member_after(
        heap: &Heap,
        class: ClassRef,
        after: ClassRef,
        name: StringId,
    ) -> Option<(ClassRef, Member)> {
        let lin = class.linearization(heap);
        let start = lin.iter().position(|c| *c == after).map_or(0, |i| i + 1);
        for entry in &lin[start..] {
            if let ClassRef::User(id) = entry
                && let HeapData::Class(c) = heap.get(*id)
                && let Some(member) = c.members.get(&name)
            {
                return Some((*entry, *member));
            }
        }
        None
    }
}

/// Per-instance storage slot. Delegated slots hold the bound delegate
/// object; reads and writes dispatch through it.
#[derive(Debug, Clone, Copy)]
pub(crate) enum InstSlot {
    Plain(Value),
    Delegated(Value),
}

#[derive(Debug)]
pub(crate) struct FieldBlock {
    pub class_uid: u64,
    pub slots: AHashMap<StringId, InstSlot>,
}

/// A user-class instance.
#[derive(Debug)]
pub(crate) struct Instance {
    pub class: HeapId,
    pub blocks: Vec<FieldBlock>,
}

impl Instance {
    pub fn new(class: HeapId) -> Self {
        Self {
            class,
            blocks: Vec::new(),
        }
    }

    pub fn block(&self, class_uid: u64) -> Option<&FieldBlock> {
        self.blocks.iter().find(|b| b.class_uid == class_uid)
    }

    pub fn block_mut(&mut self, class_uid: u64) -> &mut FieldBlock {
        if let Some(i) = self.blocks.iter().position(|b| b.class_uid == class_uid) {
            return &mut self.blocks[i];
        }
        self.blocks.push(FieldBlock {
            class_uid,
            slots: AHashMap::new(),
        });
        self.blocks.last_mut().expect("just pushed")
    }

    pub fn get(&self, class_uid: u64, name: StringId) -> Option<InstSlot> {
        self.block(class_uid).and_then(|b| b.slots.get(&name).copied())
    }

    pub fn set(&mut self, class_uid: u64, name: StringId, slot: InstSlot) {
        self.block_mut(class_uid).slots.insert(name, slot);
    }
}

/// The result of `expr as Type` on an instance: the same object viewed
/// through one of its ancestor classes, so subsequent member access
/// resolves against that class's storage first. Identity and equality
/// delegate to the target.
#[derive(Debug)]
pub(crate) struct CastView {
    pub target: Value,
    pub class: ClassRef,
}

/// C3 linearization over the direct bases, *excluding* the class itself.
///
/// Merges the linearizations of all bases plus the base list, always
/// taking the head that appears in no other list's tail. An empty merge
/// candidate set means the hierarchy is inconsistent.
pub(crate) fn c3_linearize(heap: &Heap, bases: &[ClassRef]) -> Result<Vec<ClassRef>, String> {
    if bases.is_empty() {
        return Ok(vec![ClassRef::Builtin(CoreClass::Obj)]);
    }
    let mut sequences: Vec<Vec<ClassRef>> = bases.iter().map(|b| b.linearization(heap)).collect();
    sequences.push(bases.to_vec());

    let mut out = Vec::new();
    loop {
        sequences.retain(|s| !s.is_empty());
        if sequences.is_empty() {
            return Ok(out);
        }
        let mut picked = None;
        for seq in &sequences {
            let head = seq[0];
            let in_tail = sequences.iter().any(|s| s[1..].contains(&head));
            if !in_tail {
                picked = Some(head);
                break;
            }
        }
        let Some(head) = picked else {
            return Err("inconsistent class hierarchy: no valid linearization exists".to_owned());
        };
        out.push(head);
        for seq in &mut sequences {
            seq.retain(|c| *c != head);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_chains() {
        assert_eq!(
            CoreClass::List.chain(),
            vec![
                CoreClass::List,
                CoreClass::Array,
                CoreClass::Collection,
                CoreClass::Iterable,
                CoreClass::Obj
            ]
        );
        assert_eq!(CoreClass::Obj.chain(), vec![CoreClass::Obj]);
    }

    #[test]
    fn error_classes_descend_from_exception() {
        assert!(CoreClass::IndexOutOfBoundsError.is_error());
        assert!(CoreClass::IterationEndException.chain().contains(&CoreClass::Exception));
        assert!(!CoreClass::List.is_error());
    }

    #[test]
    fn display_uses_surface_names() {
        assert_eq!(CoreClass::Str.to_string(), "String");
        assert_eq!(CoreClass::SymbolNotDefinedError.to_string(), "SymbolNotDefinedError");
        // the alias parses to the same class
        assert_eq!("SymbolNotFound".parse::<CoreClass>().unwrap(), CoreClass::SymbolNotDefinedError);
    }

    #[test]
    fn c3_diamond_without_user_classes() {
        let heap = Heap::new(crate::resource::ResourceLimits::default());
        let lin = c3_linearize(&heap, &[ClassRef::Builtin(CoreClass::List), ClassRef::Builtin(CoreClass::Set)]).unwrap();
        // List chain comes first, Set slots in before the shared tail.
        assert_eq!(lin[0], ClassRef::Builtin(CoreClass::List));
        assert!(lin.contains(&ClassRef::Builtin(CoreClass::Set)));
        assert_eq!(*lin.last().unwrap(), ClassRef::Builtin(CoreClass::Obj));
        let col = lin.iter().position(|c| *c == ClassRef::Builtin(CoreClass::Collection)).unwrap();
        let set = lin.iter().position(|c| *c == ClassRef::Builtin(CoreClass::Set)).unwrap();
        assert!(set < col);
    }
}
