//! The HIR graph arena.
//!
//! [`Hir`] exclusively owns every instruction, block, frame state and scope
//! of one compilation. The graph is cyclic (loop back edges, phi inputs);
//! all edges are arena indices, so dropping the `Hir` frees everything at
//! once and no cycle crosses the arena boundary.

use rustc_hash::FxHashSet;
use smallvec::SmallVec;

use crate::hir::block::Block;
use crate::hir::frame_state::{FrameState, IrScope};
use crate::hir::instr::{BlockId, Instr, InstrFlags, InstrId, InstrOp, ScopeId, StateId};

/// Arena-owned HIR graph with a distinguished start block.
#[derive(Debug)]
pub struct Hir {
    instrs: Vec<Instr>,
    blocks: Vec<Block>,
    states: Vec<FrameState>,
    scopes: Vec<IrScope>,
    /// The entry block, holding the `Base` terminator.
    pub start_block: BlockId,
    /// The OSR entry block, when compiling for on-stack replacement.
    pub osr_entry: Option<BlockId>,
}

impl Hir {
    /// An empty graph. The builder sets `start_block` once it exists.
    pub fn new() -> Hir {
        Hir {
            instrs: Vec::new(),
            blocks: Vec::new(),
            states: Vec::new(),
            scopes: Vec::new(),
            start_block: BlockId(0),
            osr_entry: None,
        }
    }

    // -------------------------------------------------------------------------
    // Arena access
    // -------------------------------------------------------------------------

    /// Append an instruction, unlinked.
    pub fn new_instr(&mut self, instr: Instr) -> InstrId {
        let id = InstrId(self.instrs.len() as u32);
        self.instrs.push(instr);
        id
    }

    /// Shared access to an instruction.
    #[inline]
    pub fn instr(&self, id: InstrId) -> &Instr {
        &self.instrs[id.index()]
    }

    /// Mutable access to an instruction.
    #[inline]
    pub fn instr_mut(&mut self, id: InstrId) -> &mut Instr {
        &mut self.instrs[id.index()]
    }

    /// Number of instructions in the arena.
    #[inline]
    pub fn instr_count(&self) -> usize {
        self.instrs.len()
    }

    /// Create an empty block for a leader bci.
    pub fn new_block(&mut self, bci: u32) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Block::new(id, bci));
        id
    }

    /// Shared access to a block.
    #[inline]
    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.index()]
    }

    /// Mutable access to a block.
    #[inline]
    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.index()]
    }

    /// Number of blocks in the arena.
    #[inline]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Iterate over all block ids.
    pub fn block_ids(&self) -> impl Iterator<Item = BlockId> {
        (0..self.blocks.len() as u32).map(BlockId)
    }

    /// Record an immutable frame-state snapshot.
    pub fn record_state(&mut self, state: FrameState) -> StateId {
        let id = StateId(self.states.len() as u32);
        self.states.push(state);
        id
    }

    /// Shared access to a snapshot.
    #[inline]
    pub fn state(&self, id: StateId) -> &FrameState {
        &self.states[id.index()]
    }

    /// Push an inlining scope.
    pub fn push_scope(&mut self, scope: IrScope) -> ScopeId {
        let id = ScopeId(self.scopes.len() as u32);
        self.scopes.push(scope);
        id
    }

    /// Shared access to a scope.
    #[inline]
    pub fn scope(&self, id: ScopeId) -> &IrScope {
        &self.scopes[id.index()]
    }

    // -------------------------------------------------------------------------
    // Structure
    // -------------------------------------------------------------------------

    /// Append an instruction to a block's chain.
    ///
    /// Panics if the block is already terminated.
    pub fn append(&mut self, block: BlockId, instr: InstrId) {
        let terminated = self.block(block).last.map(|last| self.instr(last).op.is_block_end());
        assert_ne!(
            terminated,
            Some(true),
            "appending to terminated block {block}"
        );
        self.instr_mut(instr).flags.insert(InstrFlags::LIVE);
        match self.block(block).last {
            None => {
                let b = self.block_mut(block);
                b.first = Some(instr);
                b.last = Some(instr);
            }
            Some(last) => {
                self.instr_mut(last).next = Some(instr);
                self.block_mut(block).last = Some(instr);
            }
        }
    }

    /// Successors of a block, derived from its terminator.
    pub fn successors(&self, block: BlockId) -> SmallVec<[BlockId; 2]> {
        match self.block(block).last {
            Some(last) => self.instr(last).op.successors(),
            None => SmallVec::new(),
        }
    }

    /// Record an edge `from -> to` in `to`'s predecessor list. The forward
    /// edge must already exist (or be about to exist) in `from`'s
    /// terminator; one call per edge keeps the two in sync.
    pub fn add_pred(&mut self, to: BlockId, from: BlockId) {
        self.block_mut(to).preds.push(from);
    }

    /// Blocks in reverse postorder from the start block. Exception-handler
    /// entries (reachable only through handler edges of reachable
    /// instructions) are appended after the normal flow, each followed by
    /// its own reverse postorder.
    pub fn reverse_postorder(&self) -> Vec<BlockId> {
        let mut order = Vec::with_capacity(self.blocks.len());
        let mut visited = FxHashSet::default();
        self.rpo_from(self.start_block, &mut visited, &mut order);

        // Pull in handler blocks until no reachable instruction names an
        // unvisited handler.
        loop {
            let mut pending = Vec::new();
            for &b in &order {
                for id in self.block_instrs(b) {
                    for edge in &self.instr(id).handlers {
                        if !visited.contains(&edge.block) {
                            pending.push(edge.block);
                        }
                    }
                }
            }
            if pending.is_empty() {
                break;
            }
            for h in pending {
                if !visited.contains(&h) {
                    self.rpo_from(h, &mut visited, &mut order);
                }
            }
        }
        order
    }

    fn rpo_from(&self, root: BlockId, visited: &mut FxHashSet<BlockId>, out: &mut Vec<BlockId>) {
        if !visited.insert(root) {
            return;
        }
        let mut postorder = Vec::new();
        let mut stack: Vec<(BlockId, usize)> = vec![(root, 0)];
        while let Some(&(block, next)) = stack.last() {
            let suxs = self.successors(block);
            if next < suxs.len() {
                stack.last_mut().expect("nonempty stack").1 += 1;
                let sux = suxs[next];
                if visited.insert(sux) {
                    stack.push((sux, 0));
                }
            } else {
                postorder.push(block);
                stack.pop();
            }
        }
        postorder.reverse();
        out.extend(postorder);
    }

    /// Iterate a block's instruction chain.
    pub fn block_instrs(&self, block: BlockId) -> BlockInstrIter<'_> {
        BlockInstrIter {
            hir: self,
            next: self.block(block).first,
        }
    }

    // -------------------------------------------------------------------------
    // Verification
    // -------------------------------------------------------------------------

    /// Check the structural invariants; panics with a diagnostic on the
    /// first violation. Run at pass boundaries in debug builds.
    pub fn verify(&self) {
        let reachable = self.reverse_postorder();
        let reachable_set: FxHashSet<BlockId> = reachable.iter().copied().collect();

        // Count forward edges into each block.
        let mut incoming: Vec<usize> = vec![0; self.blocks.len()];
        for &b in &reachable {
            for sux in self.successors(b) {
                incoming[sux.index()] += 1;
            }
        }

        for &b in &reachable {
            let block = self.block(b);
            // Every reachable block terminates in exactly one block end.
            let last = block
                .last
                .unwrap_or_else(|| panic!("{b} is reachable but has no instructions"));
            assert!(
                self.instr(last).op.is_block_end(),
                "{b} does not end in a terminator"
            );
            let mut ends = 0;
            for id in self.block_instrs(b) {
                if self.instr(id).op.is_block_end() {
                    ends += 1;
                }
            }
            assert_eq!(ends, 1, "{b} contains {ends} terminators");

            // Predecessor list matches the incoming forward edges.
            assert_eq!(
                block.preds.len(),
                incoming[b.index()],
                "{b}: {} predecessors recorded but {} incoming edges",
                block.preds.len(),
                incoming[b.index()]
            );
            for p in &block.preds {
                assert!(
                    reachable_set.contains(p),
                    "{b} lists unreachable predecessor {p}"
                );
            }

            // Phi arity equals the predecessor count; input kinds are
            // compatible with the phi's declared kind. Phis live in the
            // block's entry state, not the instruction chain.
            if let Some(sid) = block.state_before {
                let mut phis: Vec<InstrId> = Vec::new();
                self.state(sid).for_each_value(|v| {
                    if let InstrOp::Phi { block: owner, .. } = &self.instr(v).op {
                        if *owner == b {
                            phis.push(v);
                        }
                    }
                });
                for id in phis {
                    let instr = self.instr(id);
                    let InstrOp::Phi { inputs, .. } = &instr.op else {
                        unreachable!();
                    };
                    assert_eq!(
                        inputs.len(),
                        block.preds.len(),
                        "{id} has arity {} at {b} with {} predecessors",
                        inputs.len(),
                        block.preds.len()
                    );
                    for &input in inputs {
                        let ik = self.instr(input).kind.stack_kind();
                        assert_eq!(
                            ik,
                            instr.kind.stack_kind(),
                            "{id}: input {input} has kind {ik}, phi is {}",
                            instr.kind
                        );
                    }
                }
            }
        }

        // Frame-state slot counts match declared sizes.
        for state in &self.states {
            let scope = self.scope(state.scope);
            if let Some(code) = &scope.method.code {
                assert_eq!(
                    state.locals.len(),
                    code.max_locals as usize,
                    "state at bci {} has {} locals, method declares {}",
                    state.bci,
                    state.locals.len(),
                    code.max_locals
                );
                assert!(
                    state.stack.len() <= code.max_stack as usize,
                    "state at bci {} has stack depth {}, method declares max {}",
                    state.bci,
                    state.stack.len(),
                    code.max_stack
                );
            }
        }
    }

    /// Mark every value transitively used by a reachable instruction or
    /// kept alive by a frame state as a live value.
    pub fn mark_live_values(&mut self) {
        let blocks = self.reverse_postorder();
        let mut work: Vec<InstrId> = Vec::new();
        for b in blocks {
            for id in self.block_instrs(b) {
                self.instr(id).op.for_each_input(|input| work.push(input));
                if let Some(state) = self.instr(id).state {
                    self.state(state).for_each_value(|v| work.push(v));
                }
            }
            if let Some(sid) = self.block(b).state_before {
                self.state(sid).for_each_value(|v| work.push(v));
            }
        }
        // Transitive closure: a used phi keeps its inputs alive, and so on.
        while let Some(id) = work.pop() {
            if self.instr(id).flags.contains(InstrFlags::LIVE_VALUE) {
                continue;
            }
            {
                let flags = &mut self.instr_mut(id).flags;
                flags.insert(InstrFlags::LIVE_VALUE);
                flags.insert(InstrFlags::LIVE);
            }
            let mut inputs = Vec::new();
            self.instr(id).op.for_each_input(|input| inputs.push(input));
            work.extend(inputs);
        }
    }
}

impl Default for Hir {
    fn default() -> Self {
        Hir::new()
    }
}

/// Iterator over a block's instruction chain.
pub struct BlockInstrIter<'a> {
    hir: &'a Hir,
    next: Option<InstrId>,
}

impl Iterator for BlockInstrIter<'_> {
    type Item = InstrId;

    fn next(&mut self) -> Option<InstrId> {
        let id = self.next?;
        self.next = self.hir.instr(id).next;
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hir::block::BlockFlags;
    use crate::hir::instr::{Cond, Instr};
    use crate::value::ConstValue;
    use opal_core::Kind;

    fn constant(hir: &mut Hir, v: i32) -> InstrId {
        hir.new_instr(Instr::new(Kind::Int, InstrOp::Constant(ConstValue::Int(v)), 0))
    }

    /// Build the diamond `entry -> (then | else) -> join`.
    fn diamond() -> Hir {
        let mut hir = Hir::new();
        let entry = hir.new_block(0);
        let then_b = hir.new_block(4);
        let else_b = hir.new_block(8);
        let join = hir.new_block(12);
        hir.start_block = entry;
        hir.block_mut(entry).flags.insert(BlockFlags::STD_ENTRY);

        let x = constant(&mut hir, 1);
        let y = constant(&mut hir, 2);
        hir.append(entry, x);
        hir.append(entry, y);
        let branch = hir.new_instr(Instr::new(
            Kind::Illegal,
            InstrOp::If {
                cond: Cond::Lt,
                x,
                y,
                tsux: then_b,
                fsux: else_b,
            },
            0,
        ));
        hir.append(entry, branch);
        hir.add_pred(then_b, entry);
        hir.add_pred(else_b, entry);

        for b in [then_b, else_b] {
            let goto = hir.new_instr(Instr::new(Kind::Illegal, InstrOp::Goto { sux: join }, 4));
            hir.append(b, goto);
            hir.add_pred(join, b);
        }

        let ret = hir.new_instr(Instr::new(Kind::Illegal, InstrOp::Return { value: None }, 12));
        hir.append(join, ret);
        hir
    }

    #[test]
    fn test_append_links_chain() {
        let mut hir = Hir::new();
        let b = hir.new_block(0);
        let a = constant(&mut hir, 1);
        let c = constant(&mut hir, 2);
        hir.append(b, a);
        hir.append(b, c);
        assert_eq!(hir.block(b).first, Some(a));
        assert_eq!(hir.block(b).last, Some(c));
        assert_eq!(hir.instr(a).next, Some(c));
        let chain: Vec<InstrId> = hir.block_instrs(b).collect();
        assert_eq!(chain, vec![a, c]);
        assert!(hir.instr(a).is_live());
    }

    #[test]
    #[should_panic(expected = "terminated block")]
    fn test_append_after_terminator_panics() {
        let mut hir = Hir::new();
        let b = hir.new_block(0);
        let ret = hir.new_instr(Instr::new(Kind::Illegal, InstrOp::Return { value: None }, 0));
        hir.append(b, ret);
        let c = constant(&mut hir, 1);
        hir.append(b, c);
    }

    #[test]
    fn test_reverse_postorder_starts_at_entry() {
        let hir = diamond();
        let order = hir.reverse_postorder();
        assert_eq!(order.len(), 4);
        assert_eq!(order[0], hir.start_block);
        // Join comes after both branches.
        let join_pos = order.iter().position(|&b| b == BlockId(3)).unwrap();
        assert_eq!(join_pos, 3);
    }

    #[test]
    fn test_verify_accepts_diamond() {
        let hir = diamond();
        hir.verify();
    }

    #[test]
    #[should_panic(expected = "predecessors recorded")]
    fn test_verify_rejects_missing_pred() {
        let mut hir = diamond();
        hir.block_mut(BlockId(3)).preds.pop();
        hir.verify();
    }

    #[test]
    #[should_panic(expected = "arity")]
    fn test_verify_rejects_phi_arity_mismatch() {
        use crate::hir::frame_state::{FrameState, IrScope};
        use crate::runtime::{Method, MethodFlags};
        use opal_core::Signature;
        use std::sync::Arc;

        let mut hir = diamond();
        let join = BlockId(3);
        let input = constant(&mut hir, 9);
        // A single-input phi at a two-predecessor block.
        let phi = hir.new_instr(Instr::new(
            Kind::Int,
            InstrOp::Phi {
                block: join,
                inputs: smallvec::smallvec![input],
                slot: 0,
            },
            12,
        ));
        let method = Arc::new(Method::new(
            "T",
            "m",
            Signature::parse("()V").unwrap(),
            MethodFlags::STATIC,
        ));
        let scope = hir.push_scope(IrScope {
            method,
            caller: None,
            caller_bci: 0,
            level: 0,
        });
        let sid = hir.record_state(FrameState {
            scope,
            bci: 12,
            locals: vec![],
            stack: vec![Some(phi)],
            locks: vec![],
            caller: None,
        });
        hir.block_mut(join).state_before = Some(sid);
        hir.verify();
    }

    #[test]
    fn test_mark_live_values() {
        let mut hir = diamond();
        hir.mark_live_values();
        // The If consumes both constants.
        let entry = hir.start_block;
        let chain: Vec<InstrId> = hir.block_instrs(entry).collect();
        assert!(hir.instr(chain[0]).is_live_value());
        assert!(hir.instr(chain[1]).is_live_value());
        assert!(!hir.instr(chain[2]).is_live_value());
    }
}
