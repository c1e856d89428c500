//! Lexical binding frames.
//!
//! Frames live in an arena keyed by [`ScopeId`]; closures capture plain
//! ids, so the ancestry walker can traverse with a visited set keyed by
//! each frame's generation uid instead of chasing owned pointers. Walkers
//! are deliberately non-virtual: they loop over raw parent links and check
//! locals directly, which keeps specialised frames (closure call frames,
//! class construction frames) from recursing into each other.
//!
//! Frames are pooled. Every borrow from the pool regenerates the frame
//! uid and fully resets parent, records, `this` and args; if re-parenting
//! would close a cycle the pool falls back to a fresh allocation.

use ahash::{AHashMap, AHashSet};
use smallvec::SmallVec;

use crate::{intern::StringId, nodes::Visibility, value::Value};

/// Index of a frame in the scope arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ScopeId(u32);

impl ScopeId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Storage slot of one binding. Delegated slots hold the bound delegate
/// object (`val x by d`); reads and writes dispatch through it.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Slot {
    Plain(Value),
    Delegated(Value),
    /// `fun f by d` - calls dispatch to the delegate's `invoke`.
    DelegatedFun(Value),
}

/// One named binding.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Record {
    pub slot: Slot,
    pub mutable: bool,
    pub visibility: Visibility,
}

impl Record {
    pub fn immutable(value: Value) -> Self {
        Self {
            slot: Slot::Plain(value),
            mutable: false,
            visibility: Visibility::Public,
        }
    }

    pub fn mutable(value: Value) -> Self {
        Self {
            slot: Slot::Plain(value),
            mutable: true,
            visibility: Visibility::Public,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameKind {
    Module,
    Block,
    Call,
}

#[derive(Debug)]
pub(crate) struct Frame {
    pub parent: Option<ScopeId>,
    pub kind: FrameKind,
    pub records: AHashMap<StringId, Record>,
    /// The `this` object visible in this frame, if any.
    pub this_obj: Option<Value>,
    /// Class whose body/method is executing, for visibility checks:
    /// `(class uid, class heap id)`.
    pub owner_class: Option<(u64, crate::heap::HeapId)>,
    /// Evaluated positional call arguments (call frames only).
    pub args: SmallVec<[Value; 4]>,
    /// Generation uid, regenerated on every borrow from the pool.
    pub frame_uid: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Scopes {
    frames: Vec<Frame>,
    free: Vec<ScopeId>,
    next_uid: u64,
}

/// Upper bound on ancestry walks; beyond this the chain is treated as
/// cyclic regardless of the visited set.
const MAX_CHAIN: usize = 100_000;

impl Scopes {
    /// Borrows a frame from the pool (or allocates) with a fresh uid and
    /// fully reset state.
    pub fn alloc(&mut self, parent: Option<ScopeId>, kind: FrameKind) -> ScopeId {
        let uid = self.fresh_uid();
        if let Some(id) = self.free.pop() {
            // Reject pooled frames whose re-parenting would close a cycle
            // and fall back to a fresh allocation instead.
            if parent.is_some_and(|p| self.would_cycle(id, p)) {
                self.free.push(id);
            } else {
                let frame = &mut self.frames[id.index()];
                frame.parent = parent;
                frame.kind = kind;
                frame.records.clear();
                frame.this_obj = None;
                frame.owner_class = None;
                frame.args.clear();
                frame.frame_uid = uid;
                return id;
            }
        }
        let id = ScopeId(self.frames.len() as u32);
        self.frames.push(Frame {
            parent,
            kind,
            records: AHashMap::new(),
            this_obj: None,
            owner_class: None,
            args: SmallVec::new(),
            frame_uid: uid,
        });
        id
    }

    /// Returns a frame to the pool. The caller must know the frame cannot
    /// have been captured (the evaluator tracks closure creation).
    pub fn release(&mut self, id: ScopeId) {
        self.free.push(id);
    }

    fn fresh_uid(&mut self) -> u64 {
        self.next_uid += 1;
        self.next_uid
    }

    pub fn get(&self, id: ScopeId) -> &Frame {
        &self.frames[id.index()]
    }

    pub fn get_mut(&mut self, id: ScopeId) -> &mut Frame {
        &mut self.frames[id.index()]
    }

    /// True when making `parent` the parent of `child` would close a cycle.
    fn would_cycle(&self, child: ScopeId, parent: ScopeId) -> bool {
        let mut visited = AHashSet::new();
        let mut cur = Some(parent);
        let mut steps = 0;
        while let Some(id) = cur {
            if id == child {
                return true;
            }
            let frame = &self.frames[id.index()];
            if !visited.insert(frame.frame_uid) || steps > MAX_CHAIN {
                // Existing cycle upstream: treat as unusable.
                return true;
            }
            steps += 1;
            cur = frame.parent;
        }
        false
    }

    /// Re-parents a frame; rejected (returning `false`) when it would
    /// close a cycle.
    pub fn set_parent(&mut self, id: ScopeId, parent: Option<ScopeId>) -> bool {
        if let Some(p) = parent
            && self.would_cycle(id, p)
        {
            return false;
        }
        self.frames[id.index()].parent = parent;
        true
    }

    /// The ancestry chain starting at `start`, cycle-safe.
    pub fn chain(&self, start: ScopeId) -> SmallVec<[ScopeId; 8]> {
        let mut out = SmallVec::new();
        let mut visited = AHashSet::new();
        let mut cur = Some(start);
        while let Some(id) = cur {
            let frame = &self.frames[id.index()];
            if !visited.insert(frame.frame_uid) || out.len() > MAX_CHAIN {
                break;
            }
            out.push(id);
            cur = frame.parent;
        }
        out
    }

    /// Looks for a record in exactly one frame.
    pub fn find_local(&self, scope: ScopeId, name: StringId) -> Option<Record> {
        self.frames[scope.index()].records.get(&name).copied()
    }

    /// Declares (or shadows) a binding in a frame.
    pub fn declare(&mut self, scope: ScopeId, name: StringId, record: Record) {
        self.frames[scope.index()].records.insert(name, record);
    }

    /// Finds the frame declaring `name`, walking the parent chain.
    pub fn find_declaring(&self, start: ScopeId, name: StringId) -> Option<ScopeId> {
        self.chain(start)
            .into_iter()
            .find(|id| self.frames[id.index()].records.contains_key(&name))
    }

    /// The nearest `this` object visible from `start`.
    pub fn find_this(&self, start: ScopeId) -> Option<Value> {
        self.chain(start)
            .into_iter()
            .find_map(|id| self.frames[id.index()].this_obj)
    }

    /// The nearest class-body context for visibility checks.
    pub fn find_owner_class(&self, start: ScopeId) -> Option<(u64, crate::heap::HeapId)> {
        self.chain(start)
            .into_iter()
            .find_map(|id| self.frames[id.index()].owner_class)
    }

    /// The module (root) frame of a chain.
    pub fn module_of(&self, start: ScopeId) -> ScopeId {
        self.chain(start)
            .into_iter()
            .find(|id| self.frames[id.index()].kind == FrameKind::Module)
            .unwrap_or(start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pooled_frames_get_fresh_uids() {
        let mut scopes = Scopes::default();
        let a = scopes.alloc(None, FrameKind::Module);
        let b = scopes.alloc(Some(a), FrameKind::Block);
        let uid_b = scopes.get(b).frame_uid;
        scopes.release(b);
        let c = scopes.alloc(Some(a), FrameKind::Block);
        assert_eq!(b, c, "pool reuses the slot");
        assert_ne!(scopes.get(c).frame_uid, uid_b, "uid regenerated on borrow");
        assert!(scopes.get(c).records.is_empty());
    }

    #[test]
    fn cycle_assignment_is_rejected() {
        let mut scopes = Scopes::default();
        let a = scopes.alloc(None, FrameKind::Module);
        let b = scopes.alloc(Some(a), FrameKind::Block);
        assert!(!scopes.set_parent(a, Some(b)), "a->b->a must be rejected");
        // chain stays acyclic and terminates
        assert_eq!(scopes.chain(b).len(), 2);
    }

    #[test]
    fn pool_falls_back_on_cycle() {
        let mut scopes = Scopes::default();
        let a = scopes.alloc(None, FrameKind::Module);
        let b = scopes.alloc(Some(a), FrameKind::Block);
        scopes.release(a);
        // Re-borrowing the freed root with a parent that descends from it
        // must allocate a fresh frame rather than close a loop.
        let c = scopes.alloc(Some(b), FrameKind::Block);
        assert_ne!(c, a);
        assert_eq!(scopes.chain(c).len(), 3);
    }

    #[test]
    fn name_resolution_walks_parents() {
        let mut scopes = Scopes::default();
        let root = scopes.alloc(None, FrameKind::Module);
        let inner = scopes.alloc(Some(root), FrameKind::Block);
        let name = StringId::from_raw(0);
        scopes.declare(root, name, Record::immutable(Value::Int(7)));
        assert_eq!(scopes.find_declaring(inner, name), Some(root));
    }
}
