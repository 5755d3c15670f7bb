//! Frame states.
//!
//! A [`FrameState`] is an immutable snapshot of the abstract interpreter's
//! locals, operand stack and held locks at one bytecode index, linked to its
//! caller frame when inlining. Snapshots become the debug info of
//! safepoints, calls and trapping instructions; the deoptimization path
//! reconstructs interpreter frames from them.
//!
//! The builder mutates a [`MutableState`] and records snapshots from it;
//! snapshots are never edited in place.

use opal_core::Kind;

use crate::hir::instr::{InstrId, ScopeId, StateId};
use crate::runtime::MethodRef;

/// One inlining scope: a method being compiled inside another.
#[derive(Debug, Clone)]
pub struct IrScope {
    /// The method this scope interprets.
    pub method: MethodRef,
    /// Enclosing scope, `None` for the outermost method.
    pub caller: Option<ScopeId>,
    /// Call-site bci in the caller.
    pub caller_bci: u32,
    /// Nesting depth; the outermost scope is level 0.
    pub level: u32,
}

/// An immutable locals/stack/locks snapshot.
///
/// Category-2 values occupy two slots, the upper one empty. Empty slots are
/// `None`; a present id always refers to a live value of a legal kind.
#[derive(Debug, Clone)]
pub struct FrameState {
    pub scope: ScopeId,
    /// Bytecode index the snapshot was taken at.
    pub bci: u32,
    pub locals: Vec<Option<InstrId>>,
    pub stack: Vec<Option<InstrId>>,
    /// Monitor owners, innermost last.
    pub locks: Vec<InstrId>,
    /// Caller frame snapshot, for inlined scopes.
    pub caller: Option<StateId>,
}

impl FrameState {
    /// Operand stack depth in slots.
    #[inline]
    pub fn stack_size(&self) -> usize {
        self.stack.len()
    }

    /// Local slot count.
    #[inline]
    pub fn locals_size(&self) -> usize {
        self.locals.len()
    }

    /// Value in a local slot, if the slot holds one.
    #[inline]
    pub fn local_at(&self, index: usize) -> Option<InstrId> {
        self.locals.get(index).copied().flatten()
    }

    /// Value in a stack slot, if the slot holds one.
    #[inline]
    pub fn stack_at(&self, index: usize) -> Option<InstrId> {
        self.stack.get(index).copied().flatten()
    }

    /// Visit every value the snapshot keeps alive.
    pub fn for_each_value(&self, mut f: impl FnMut(InstrId)) {
        for v in self.locals.iter().chain(self.stack.iter()).flatten() {
            f(*v);
        }
        for v in &self.locks {
            f(*v);
        }
    }
}

/// The builder's working frame.
#[derive(Debug, Clone)]
pub struct MutableState {
    pub scope: ScopeId,
    pub locals: Vec<Option<InstrId>>,
    pub stack: Vec<Option<InstrId>>,
    pub locks: Vec<InstrId>,
    /// Snapshot of the caller frame at the call site, for inlined scopes.
    pub caller: Option<StateId>,
    /// Local indices that start a category-2 value, so torn stores can
    /// invalidate them.
    cat2_starts: Vec<usize>,
}

impl MutableState {
    /// A frame with `max_locals` empty locals and an empty stack.
    pub fn new(scope: ScopeId, max_locals: usize) -> MutableState {
        MutableState {
            scope,
            locals: vec![None; max_locals],
            stack: Vec::new(),
            locks: Vec::new(),
            caller: None,
            cat2_starts: Vec::new(),
        }
    }

    /// Rebuild a working frame from snapshot contents. `cat2_starts` lists
    /// the local indices holding category-2 values.
    pub fn restore(
        scope: ScopeId,
        locals: Vec<Option<InstrId>>,
        stack: Vec<Option<InstrId>>,
        locks: Vec<InstrId>,
        caller: Option<StateId>,
        cat2_starts: Vec<usize>,
    ) -> MutableState {
        MutableState {
            scope,
            locals,
            stack,
            locks,
            caller,
            cat2_starts,
        }
    }

    /// Freeze into a snapshot at `bci`.
    pub fn snapshot(&self, bci: u32) -> FrameState {
        FrameState {
            scope: self.scope,
            bci,
            locals: self.locals.clone(),
            stack: self.stack.clone(),
            locks: self.locks.clone(),
            caller: self.caller,
        }
    }

    /// Push a value of the given kind, reserving the upper slot of
    /// category-2 kinds.
    pub fn push(&mut self, kind: Kind, value: InstrId) {
        self.stack.push(Some(value));
        if kind.is_category2() {
            self.stack.push(None);
        }
    }

    /// Pop a value of the given kind.
    ///
    /// Panics on stack underflow or a malformed category-2 pair; the
    /// builder guards both with bailouts before calling.
    pub fn pop(&mut self, kind: Kind) -> InstrId {
        if kind.is_category2() {
            let empty = self.stack.pop().expect("stack underflow");
            assert!(empty.is_none(), "category-2 upper slot must be empty");
        }
        self.stack
            .pop()
            .expect("stack underflow")
            .expect("popped an empty slot")
    }

    /// Pop one raw slot (for the untyped stack-manipulation bytecodes).
    pub fn pop_raw(&mut self) -> Option<InstrId> {
        self.stack.pop().expect("stack underflow")
    }

    /// Push one raw slot.
    pub fn push_raw(&mut self, slot: Option<InstrId>) {
        self.stack.push(slot);
    }

    /// Current stack depth in slots.
    #[inline]
    pub fn stack_size(&self) -> usize {
        self.stack.len()
    }

    /// Store into a local slot, invalidating any category-2 value the
    /// store tears.
    pub fn store_local(&mut self, index: usize, kind: Kind, value: InstrId) {
        // A store into the upper half of an existing category-2 value
        // invalidates it.
        if index > 0 && self.locals[index - 1].is_some() && self.local_is_cat2_start(index - 1) {
            self.locals[index - 1] = None;
        }
        self.locals[index] = Some(value);
        if kind.is_category2() {
            self.locals[index + 1] = None;
            self.cat2_starts.push(index);
        } else {
            self.cat2_starts.retain(|&s| s != index);
        }
    }

    fn local_is_cat2_start(&self, index: usize) -> bool {
        self.cat2_starts.contains(&index)
    }

    /// Load from a local slot.
    #[inline]
    pub fn load_local(&self, index: usize) -> Option<InstrId> {
        self.locals.get(index).copied().flatten()
    }

    /// Record a monitor acquisition, returning its lock number.
    pub fn lock(&mut self, obj: InstrId) -> u32 {
        self.locks.push(obj);
        (self.locks.len() - 1) as u32
    }

    /// Record a monitor release, returning the released lock number.
    pub fn unlock(&mut self) -> Option<u32> {
        self.locks.pop().map(|_| self.locks.len() as u32)
    }

    /// Number of locks currently held.
    #[inline]
    pub fn lock_depth(&self) -> usize {
        self.locks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> MutableState {
        MutableState::new(ScopeId(0), 4)
    }

    #[test]
    fn test_push_pop_category1() {
        let mut s = state();
        s.push(Kind::Int, InstrId(1));
        assert_eq!(s.stack_size(), 1);
        assert_eq!(s.pop(Kind::Int), InstrId(1));
        assert_eq!(s.stack_size(), 0);
    }

    #[test]
    fn test_push_pop_category2_reserves_upper_slot() {
        let mut s = state();
        s.push(Kind::Long, InstrId(2));
        assert_eq!(s.stack_size(), 2);
        assert_eq!(s.pop(Kind::Long), InstrId(2));
        assert_eq!(s.stack_size(), 0);
    }

    #[test]
    fn test_store_local_cat2_clears_upper() {
        let mut s = state();
        s.store_local(0, Kind::Long, InstrId(5));
        assert_eq!(s.load_local(0), Some(InstrId(5)));
        assert_eq!(s.load_local(1), None);
    }

    #[test]
    fn test_torn_cat2_store_invalidates() {
        let mut s = state();
        s.store_local(0, Kind::Long, InstrId(5));
        s.store_local(1, Kind::Int, InstrId(6));
        assert_eq!(s.load_local(0), None);
        assert_eq!(s.load_local(1), Some(InstrId(6)));
    }

    #[test]
    fn test_locks() {
        let mut s = state();
        assert_eq!(s.lock(InstrId(7)), 0);
        assert_eq!(s.lock(InstrId(8)), 1);
        assert_eq!(s.lock_depth(), 2);
        assert_eq!(s.unlock(), Some(1));
        assert_eq!(s.unlock(), Some(0));
        assert_eq!(s.unlock(), None);
    }

    #[test]
    fn test_snapshot_is_independent() {
        let mut s = state();
        s.push(Kind::Int, InstrId(1));
        let snap = s.snapshot(9);
        s.pop(Kind::Int);
        assert_eq!(snap.stack_size(), 1);
        assert_eq!(snap.stack_at(0), Some(InstrId(1)));
        assert_eq!(snap.bci, 9);
        assert_eq!(s.stack_size(), 0);
    }

    #[test]
    fn test_for_each_value_skips_empty_slots() {
        let mut s = state();
        s.store_local(0, Kind::Long, InstrId(3));
        s.push(Kind::Int, InstrId(4));
        let snap = s.snapshot(0);
        let mut seen = Vec::new();
        snap.for_each_value(|v| seen.push(v));
        assert_eq!(seen, vec![InstrId(3), InstrId(4)]);
    }
}
