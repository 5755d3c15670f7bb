//! Bytecode to HIR translation.
//!
//! An abstract interpreter over stack-machine bytecode with a worklist of
//! basic blocks. Control-flow merges unify frame states pointwise, creating
//! phis at join points; loop headers get eager phis for all stack slots and
//! for the locals the block map proves are stored inside loops. Recognized
//! invokes become intrinsic nodes, small straight-line callees are inlined
//! under a pushed scope, and synchronized methods are wrapped in an
//! implicit monitor with a catch-all unlock handler.
//!
//! All failures are bailouts: the graph under construction is abandoned
//! with the compilation arena and nothing escapes.

pub mod block_map;
pub mod intrinsics;

use std::sync::Arc;

use rustc_hash::FxHashMap;
use smallvec::{smallvec, SmallVec};

use opal_core::bytecode::{newarray_kind, opcodes::*, BytecodeStream};
use opal_core::{Bailout, CompileResult, Kind};

use crate::hir::block::BlockFlags;
use crate::hir::frame_state::{FrameState, IrScope, MutableState};
use crate::hir::graph::Hir;
use crate::hir::instr::{
    ArithOp, BlockId, CmpVariant, Cond, Conversion, HandlerEdge, Instr, InstrFlags, InstrId,
    InstrOp, IntrinsicId, InvokeKind, LogicOp, ScopeId, ShiftOp, StateId,
};
use crate::options::Options;
use crate::runtime::{ConstantPool, ExceptionHandler, MethodRef, RuntimeInterface};
use crate::value::ConstValue;

use block_map::BlockMap;

/// Callees above this bytecode size are never inlined.
const MAX_INLINE_SIZE: usize = 35;
/// Maximum inlining depth.
const MAX_INLINE_DEPTH: u32 = 9;

/// Build the HIR graph for a method.
pub fn build_graph(
    method: &MethodRef,
    runtime: &dyn RuntimeInterface,
    options: &Options,
    osr_bci: Option<u32>,
) -> CompileResult<Hir> {
    let code = method
        .code
        .as_ref()
        .ok_or_else(|| Bailout::invariant(format!("{} has no code", method.qualified_name())))?;
    check_no_safepoints_constraint(method, &code.bytecode)?;
    let map = BlockMap::build(&code.bytecode, &code.handlers, code.max_locals as usize)?;
    if let Some(bci) = osr_bci {
        if !map.is_loop_header(bci) {
            return Err(Bailout::invariant(format!(
                "osr bci {bci} is not a loop header"
            )));
        }
    }
    let mut builder = GraphBuilder {
        hir: Hir::new(),
        runtime,
        options,
        osr_bci,
        map,
        ctx: InterpContext {
            method: method.clone(),
            code: code.bytecode.clone(),
            pool: Arc::clone(&code.pool),
            handlers: code.handlers.clone(),
        },
        blocks_by_bci: FxHashMap::default(),
        worklist: Vec::new(),
        cur_block: BlockId(0),
        cur_state: MutableState::new(ScopeId(0), 0),
        cur_scope: ScopeId(0),
        vn: FxHashMap::default(),
        sync_handler: None,
        sync_obj: None,
        inline_depth: 0,
        inline_handlers: None,
        inline_result: None,
    };
    builder.run()?;
    Ok(builder.hir)
}

/// A method flagged no-safepoints must not contain monitor operations; the
/// inconsistency is rejected up front instead of being left to downstream
/// passes.
fn check_no_safepoints_constraint(method: &MethodRef, code: &[u8]) -> CompileResult<()> {
    if !method.flags.no_safepoints() {
        return Ok(());
    }
    if method.flags.is_synchronized() {
        return Err(Bailout::invariant(format!(
            "{} is no-safepoints but synchronized",
            method.qualified_name()
        )));
    }
    let stream = BytecodeStream::new(code);
    let mut bci = 0;
    while bci < stream.len() {
        let opcode = stream.byte_at(bci)?;
        if opcode == MONITORENTER || opcode == MONITOREXIT {
            return Err(Bailout::invariant(format!(
                "{} is no-safepoints but contains monitor operations",
                method.qualified_name()
            )));
        }
        bci = stream.next_bci(bci)?;
    }
    Ok(())
}

/// The bytecode context currently being interpreted (switched during
/// inlining).
struct InterpContext {
    method: MethodRef,
    code: Vec<u8>,
    pool: Arc<dyn ConstantPool>,
    handlers: Vec<ExceptionHandler>,
}

/// Value-numbering key for pure operations, per block.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum VnKey {
    Const(ConstValue),
    Arith(ArithOp, Kind, InstrId, InstrId),
    Shift(ShiftOp, Kind, InstrId, InstrId),
    Logic(LogicOp, Kind, InstrId, InstrId),
    Negate(Kind, InstrId),
    Convert(Conversion, InstrId),
    Compare(CmpVariant, InstrId, InstrId),
}

struct GraphBuilder<'a> {
    hir: Hir,
    runtime: &'a dyn RuntimeInterface,
    options: &'a Options,
    osr_bci: Option<u32>,
    map: BlockMap,
    ctx: InterpContext,
    blocks_by_bci: FxHashMap<u32, BlockId>,
    worklist: Vec<BlockId>,
    cur_block: BlockId,
    cur_state: MutableState,
    cur_scope: ScopeId,
    vn: FxHashMap<VnKey, InstrId>,
    sync_handler: Option<BlockId>,
    sync_obj: Option<InstrId>,
    inline_depth: u32,
    /// Handler edges of the call site while interpreting an inlined callee.
    inline_handlers: Option<SmallVec<[HandlerEdge; 1]>>,
    /// Return value observed while interpreting an inlined callee.
    inline_result: Option<Option<InstrId>>,
}

impl GraphBuilder<'_> {
    fn run(&mut self) -> CompileResult<()> {
        // One block per leader, flagged from the map and handler table.
        for bci in self.map.leaders_sorted() {
            let block = self.hir.new_block(bci);
            if self.map.is_loop_header(bci) {
                self.hir.block_mut(block).flags.insert(BlockFlags::LOOP_HEADER);
            }
            self.blocks_by_bci.insert(bci, block);
        }
        for handler in self.ctx.handlers.clone() {
            let block = self.block_at(handler.handler_bci)?;
            self.hir
                .block_mut(block)
                .flags
                .insert(BlockFlags::EXCEPTION_ENTRY);
        }

        self.build_start()?;

        while let Some(block) = self.worklist.pop() {
            if self.hir.block(block).was_visited() {
                continue;
            }
            self.interpret_block(block)?;
        }

        if let Some(osr_bci) = self.osr_bci {
            self.build_osr_entry(osr_bci)?;
        }

        split_critical_edges(&mut self.hir);
        self.hir.mark_live_values();
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Entry
    // -------------------------------------------------------------------------

    fn build_start(&mut self) -> CompileResult<()> {
        let method = self.ctx.method.clone();
        let code = method.code.as_ref().expect("checked by build_graph");
        let start = self.hir.new_block(0);
        self.hir.block_mut(start).flags.insert(BlockFlags::STD_ENTRY);
        self.hir.start_block = start;
        self.cur_block = start;

        let scope = self.hir.push_scope(IrScope {
            method: method.clone(),
            caller: None,
            caller_bci: 0,
            level: 0,
        });
        self.cur_scope = scope;
        self.cur_state = MutableState::new(scope, code.max_locals as usize);

        // Bind incoming parameters to Local nodes.
        let param_slots = method.signature.argument_slots(method.has_receiver());
        if param_slots > u32::from(code.max_locals) {
            return Err(Bailout::malformed(format!(
                "{} declares {} locals for {} parameter slots",
                method.qualified_name(),
                code.max_locals,
                param_slots
            )));
        }
        let mut slot = 0u32;
        for kind in method.argument_kinds() {
            let kind = kind.stack_kind();
            let local = self
                .hir
                .new_instr(Instr::new(kind, InstrOp::Local { index: slot }, 0));
            if slot == 0 && method.has_receiver() {
                self.hir
                    .instr_mut(local)
                    .flags
                    .insert(InstrFlags::NON_NULL);
            }
            self.hir.append(start, local);
            self.cur_state.store_local(slot as usize, kind, local);
            slot += kind.jvm_slots();
        }

        // Synchronized methods lock on entry and unlock on every exit,
        // including the exceptional one.
        if method.flags.is_synchronized() {
            let obj = if method.has_receiver() {
                self.cur_state
                    .load_local(0)
                    .ok_or_else(|| Bailout::invariant("synchronized method without receiver"))?
            } else {
                let holder = Arc::new(crate::runtime::ClassInfo {
                    name: method.holder.clone(),
                    id: class_id_for(&method.holder),
                    elem_kind: None,
                });
                let mirror = self.runtime.class_mirror(&holder);
                self.append_const(mirror, 0)
            };
            self.sync_obj = Some(obj);
            let lock_number = self.cur_state.lock(obj);
            let sid = self.record_cur_state(0);
            let enter = self.hir.new_instr({
                let mut i = Instr::new(Kind::Void, InstrOp::MonitorEnter { obj, lock_number }, 0);
                i.state = Some(sid);
                i.flags.insert(InstrFlags::PINNED);
                i
            });
            self.hir.append(start, enter);

            let handler = self.build_sync_handler(obj)?;
            self.sync_handler = Some(handler);
        }

        // OSR entry block, materialized after the normal flow is built.
        let osr_block = if self.osr_bci.is_some() {
            let b = self.hir.new_block(self.osr_bci.unwrap());
            self.hir.block_mut(b).flags.insert(BlockFlags::OSR_ENTRY);
            self.hir.osr_entry = Some(b);
            Some(b)
        } else {
            None
        };

        let first = self.block_at(0)?;
        let base = self.hir.new_instr(Instr::new(
            Kind::Void,
            InstrOp::Base {
                std_entry: first,
                osr_entry: osr_block,
            },
            0,
        ));
        self.hir.append(start, base);
        if let Some(osr) = osr_block {
            self.hir.add_pred(osr, start);
        }
        self.merge_into(first, start)
    }

    /// The catch-all handler that unlocks and rethrows for synchronized
    /// methods. Locals are dead at this point; the handler only needs the
    /// monitor object, which it carries in its lock stack.
    fn build_sync_handler(&mut self, obj: InstrId) -> CompileResult<BlockId> {
        let code_len = self.ctx.code.len() as u32;
        let handler = self.hir.new_block(code_len);
        self.hir.block_mut(handler).flags.insert(
            BlockFlags::EXCEPTION_ENTRY,
        );
        self.hir.block_mut(handler).flags.insert(BlockFlags::VISITED);

        let max_locals = self
            .ctx
            .method
            .code
            .as_ref()
            .map(|c| c.max_locals as usize)
            .unwrap_or(0);
        let mut state = MutableState::new(self.cur_scope, max_locals);
        state.locks.push(obj);
        let sid = self.hir.record_state(state.snapshot(code_len));
        self.hir.block_mut(handler).state_before = Some(sid);

        let exc = self.hir.new_instr({
            let mut i = Instr::new(Kind::Object, InstrOp::ExceptionObject, code_len);
            i.state = Some(sid);
            i.flags.insert(InstrFlags::NON_NULL);
            i.flags.insert(InstrFlags::PINNED);
            i
        });
        self.hir.append(handler, exc);
        let exit = self.hir.new_instr({
            let mut i = Instr::new(
                Kind::Void,
                InstrOp::MonitorExit {
                    obj,
                    lock_number: 0,
                },
                code_len,
            );
            i.state = Some(sid);
            i.flags.insert(InstrFlags::PINNED);
            i
        });
        self.hir.append(handler, exit);
        let throw = self.hir.new_instr({
            let mut i = Instr::new(Kind::Void, InstrOp::Throw { exception: exc }, code_len);
            i.state = Some(sid);
            i.flags.insert(InstrFlags::PINNED);
            i
        });
        self.hir.append(handler, throw);
        Ok(handler)
    }

    fn build_osr_entry(&mut self, target_bci: u32) -> CompileResult<()> {
        let osr_block = self.hir.osr_entry.expect("osr entry exists");
        let target = self.block_at(target_bci)?;
        let Some(target_sid) = self.hir.block(target).state_before else {
            return Err(Bailout::invariant("osr target was never reached"));
        };
        let target_state = self.hir.state(target_sid).clone();
        if !target_state.stack.is_empty() {
            return Err(Bailout::invariant(
                "osr target has a non-empty expression stack",
            ));
        }
        if !target_state.locks.is_empty() {
            return Err(Bailout::invariant("osr target holds monitors"));
        }

        self.cur_block = osr_block;
        self.vn.clear();
        let mut state = MutableState::new(self.cur_scope, target_state.locals.len());
        let entry_sid = self.hir.record_state(state.snapshot(target_bci));
        self.hir.block_mut(osr_block).state_before = Some(entry_sid);

        let buffer = self.hir.new_instr({
            let mut i = Instr::new(Kind::Word, InstrOp::OsrEntry, target_bci);
            i.flags.insert(InstrFlags::PINNED);
            i
        });
        self.hir.append(osr_block, buffer);

        // Materialize each live local from its slot in the OSR buffer.
        let mut slot = 0usize;
        while slot < target_state.locals.len() {
            if let Some(v) = target_state.locals[slot] {
                let kind = self.hir.instr(v).kind;
                let load = self.append(
                    kind,
                    InstrOp::LoadPointer {
                        pointer: buffer,
                        disp: (slot as i32) * 8,
                        loaded_kind: kind,
                    },
                    target_bci,
                );
                state.store_local(slot, kind, load);
                slot += kind.jvm_slots() as usize;
            } else {
                slot += 1;
            }
        }
        self.cur_state = state;
        let goto = self
            .hir
            .new_instr(Instr::new(Kind::Void, InstrOp::Goto { sux: target }, target_bci));
        self.hir.append(osr_block, goto);
        self.merge_into(target, osr_block)
    }

    // -------------------------------------------------------------------------
    // Merging
    // -------------------------------------------------------------------------

    /// Merge `cur_state` into `target` along the edge `from -> target`.
    fn merge_into(&mut self, target: BlockId, from: BlockId) -> CompileResult<()> {
        self.hir.add_pred(target, from);
        let npreds = self.hir.block(target).pred_count();
        let target_bci = self.hir.block(target).bci;
        let is_loop_header = self.hir.block(target).is_loop_header();
        let is_osr_target = self.osr_bci == Some(target_bci);

        match self.hir.block(target).state_before {
            None => {
                debug_assert_eq!(npreds, 1);
                let mut snap = self.cur_state.snapshot(target_bci);
                if is_loop_header {
                    // Eager phis: all stack slots, plus the locals that can
                    // change inside the loop (all of them for an OSR target).
                    for i in 0..snap.stack.len() {
                        if let Some(v) = snap.stack[i] {
                            snap.stack[i] = Some(self.new_phi(target, target_bci, v));
                        }
                    }
                    for i in 0..snap.locals.len() {
                        if snap.locals[i].is_some()
                            && (self.map.stores_in_loops(i) || is_osr_target)
                        {
                            let v = snap.locals[i].unwrap();
                            snap.locals[i] = Some(self.new_phi(target, target_bci, v));
                        }
                    }
                }
                let sid = self.hir.record_state(snap);
                self.hir.block_mut(target).state_before = Some(sid);
                self.push_worklist(target);
                Ok(())
            }
            Some(sid) => {
                let existing = self.hir.state(sid).clone();
                if existing.stack.len() != self.cur_state.stack.len() {
                    return Err(Bailout::invariant(format!(
                        "stack depth mismatch merging into bci {target_bci}: {} vs {}",
                        existing.stack.len(),
                        self.cur_state.stack.len()
                    )));
                }
                if existing.locks != self.cur_state.locks {
                    return Err(Bailout::invariant(format!(
                        "monitor mismatch merging into bci {target_bci}"
                    )));
                }
                let visited = self.hir.block(target).was_visited();

                let mut new_locals = existing.locals.clone();
                let mut new_stack = existing.stack.clone();
                let mut changed = false;
                let incoming_locals = self.cur_state.locals.clone();
                let incoming_stack = self.cur_state.stack.clone();

                for (slots, incoming) in [
                    (&mut new_stack, &incoming_stack),
                    (&mut new_locals, &incoming_locals),
                ] {
                    for i in 0..slots.len() {
                        let inc = incoming.get(i).copied().flatten();
                        self.merge_slot(
                            target, npreds, visited, &mut slots[i], inc, &mut changed,
                        )?;
                    }
                }

                if changed {
                    if visited {
                        return Err(Bailout::invariant(format!(
                            "jump into already interpreted block at bci {target_bci} \
                             changes its entry state"
                        )));
                    }
                    let snap = FrameState {
                        scope: existing.scope,
                        bci: existing.bci,
                        locals: new_locals,
                        stack: new_stack,
                        locks: existing.locks,
                        caller: existing.caller,
                    };
                    let nid = self.hir.record_state(snap);
                    self.hir.block_mut(target).state_before = Some(nid);
                }
                Ok(())
            }
        }
    }

    /// Pointwise merge of one slot. Matching values pass through, differing
    /// values produce or extend a phi at the target, and a value missing on
    /// either side kills the slot.
    fn merge_slot(
        &mut self,
        target: BlockId,
        npreds: usize,
        visited: bool,
        slot: &mut Option<InstrId>,
        incoming: Option<InstrId>,
        changed: &mut bool,
    ) -> CompileResult<()> {
        match (*slot, incoming) {
            (None, None) => Ok(()),
            (Some(existing), Some(inc)) => {
                if self.is_phi_of(existing, target) {
                    // One input per incoming edge, even when the value is
                    // unchanged around a loop.
                    if let InstrOp::Phi { inputs, .. } = &mut self.hir.instr_mut(existing).op {
                        inputs.push(inc);
                    }
                    Ok(())
                } else if existing == inc {
                    Ok(())
                } else {
                    if visited {
                        return Err(Bailout::invariant(
                            "merge requires a phi in an already interpreted block",
                        ));
                    }
                    let kind = self.hir.instr(existing).kind;
                    let inc_kind = self.hir.instr(inc).kind;
                    if kind.stack_kind() != inc_kind.stack_kind() {
                        // Kinds disagree across paths: the slot is dead.
                        *slot = None;
                        *changed = true;
                        return Ok(());
                    }
                    let mut inputs: SmallVec<[InstrId; 2]> = smallvec![existing; npreds - 1];
                    inputs.push(inc);
                    let bci = self.hir.block(target).bci;
                    let phi = self.hir.new_instr({
                        let mut i = Instr::new(
                            kind.stack_kind(),
                            InstrOp::Phi {
                                block: target,
                                inputs,
                                slot: 0,
                            },
                            bci,
                        );
                        i.flags.insert(InstrFlags::LIVE);
                        i
                    });
                    *slot = Some(phi);
                    *changed = true;
                    Ok(())
                }
            }
            (Some(_), None) | (None, Some(_)) => {
                if slot.is_some() {
                    if visited {
                        return Err(Bailout::invariant(
                            "merge kills a slot in an already interpreted block",
                        ));
                    }
                    *slot = None;
                    *changed = true;
                }
                Ok(())
            }
        }
    }

    /// A single-input phi seeded with `value`, for eager loop-header phis.
    fn new_phi(&mut self, block: BlockId, bci: u32, value: InstrId) -> InstrId {
        let kind = self.hir.instr(value).kind.stack_kind();
        self.hir.new_instr({
            let mut i = Instr::new(
                kind,
                InstrOp::Phi {
                    block,
                    inputs: smallvec![value],
                    slot: 0,
                },
                bci,
            );
            i.flags.insert(InstrFlags::LIVE);
            i
        })
    }

    fn is_phi_of(&self, id: InstrId, block: BlockId) -> bool {
        matches!(&self.hir.instr(id).op, InstrOp::Phi { block: owner, .. } if *owner == block)
    }

    // -------------------------------------------------------------------------
    // Interpretation
    // -------------------------------------------------------------------------

    fn interpret_block(&mut self, block: BlockId) -> CompileResult<()> {
        {
            let b = self.hir.block_mut(block);
            b.flags.insert(BlockFlags::VISITED);
            b.flags.remove(BlockFlags::ON_WORKLIST);
        }
        self.cur_block = block;
        let sid = self
            .hir
            .block(block)
            .state_before
            .expect("worklist block has a state");
        self.cur_state = self.to_mutable(sid);
        self.vn.clear();

        let block_bci = self.hir.block(block).bci;
        if self.hir.block(block).is_exception_entry() {
            let exc = self.hir.new_instr({
                let mut i = Instr::new(Kind::Object, InstrOp::ExceptionObject, block_bci);
                i.state = Some(sid);
                i.flags.insert(InstrFlags::NON_NULL);
                i.flags.insert(InstrFlags::PINNED);
                i
            });
            self.hir.append(block, exc);
            self.cur_state.push(Kind::Object, exc);
        }

        let len = self.ctx.code.len() as u32;
        let mut bci = block_bci;
        loop {
            let ended = self.interpret_one(bci)?;
            if ended {
                break;
            }
            let next = self.stream().next_bci(bci)?;
            if next >= len {
                return Err(Bailout::malformed(format!(
                    "control falls off the end of the method after bci {bci}"
                )));
            }
            if self.map.is_leader(next) {
                self.goto_block(next, bci)?;
                break;
            }
            bci = next;
        }
        Ok(())
    }

    fn stream(&self) -> BytecodeStream<'_> {
        BytecodeStream::new(&self.ctx.code)
    }

    /// Interpret the instruction at `bci`; returns whether it ended the
    /// block (or, in an inlined callee, the whole callee).
    fn interpret_one(&mut self, bci: u32) -> CompileResult<bool> {
        let opcode = self.stream().byte_at(bci)?;
        match opcode {
            NOP => {}

            // -- Constants ----------------------------------------------------
            ACONST_NULL => {
                let id = self.append_const(ConstValue::Null, bci);
                self.cur_state.push(Kind::Object, id);
            }
            ICONST_M1..=ICONST_5 => {
                let v = opcode as i32 - ICONST_0 as i32;
                let id = self.append_const(ConstValue::Int(v), bci);
                self.cur_state.push(Kind::Int, id);
            }
            LCONST_0 | LCONST_1 => {
                let id = self.append_const(ConstValue::Long((opcode - LCONST_0) as i64), bci);
                self.cur_state.push(Kind::Long, id);
            }
            FCONST_0 | FCONST_1 | FCONST_2 => {
                let id = self.append_const(ConstValue::Float((opcode - FCONST_0) as f32), bci);
                self.cur_state.push(Kind::Float, id);
            }
            DCONST_0 | DCONST_1 => {
                let id = self.append_const(ConstValue::Double((opcode - DCONST_0) as f64), bci);
                self.cur_state.push(Kind::Double, id);
            }
            BIPUSH => {
                let v = self.stream().read_u8(bci + 1)? as i8 as i32;
                let id = self.append_const(ConstValue::Int(v), bci);
                self.cur_state.push(Kind::Int, id);
            }
            SIPUSH => {
                let v = self.stream().read_i16(bci + 1)? as i32;
                let id = self.append_const(ConstValue::Int(v), bci);
                self.cur_state.push(Kind::Int, id);
            }
            LDC | LDC_W | LDC2_W => {
                let index = if opcode == LDC {
                    u16::from(self.stream().read_u8(bci + 1)?)
                } else {
                    self.stream().read_u16(bci + 1)?
                };
                let value = self.load_pool_constant(index, bci)?;
                let kind = value.kind();
                let id = self.append_const(value, bci);
                self.cur_state.push(kind, id);
            }

            // -- Locals -------------------------------------------------------
            ILOAD..=ALOAD => {
                let index = u32::from(self.stream().read_u8(bci + 1)?);
                self.load_local(index, bci)?;
            }
            ILOAD_0..=ALOAD_3 => {
                let index = u32::from((opcode - ILOAD_0) & 3);
                self.load_local(index, bci)?;
            }
            ISTORE..=ASTORE => {
                let index = u32::from(self.stream().read_u8(bci + 1)?);
                self.store_local_op(opcode - ISTORE, index, bci)?;
            }
            ISTORE_0..=ASTORE_3 => {
                let group = (opcode - ISTORE_0) / 4;
                let index = u32::from((opcode - ISTORE_0) & 3);
                self.store_local_op(group, index, bci)?;
            }
            IINC => {
                let index = u32::from(self.stream().read_u8(bci + 1)?);
                let delta = self.stream().read_u8(bci + 2)? as i8 as i32;
                self.iinc(index, delta, bci)?;
            }
            WIDE => {
                let modified = self.stream().byte_at(bci + 1)?;
                let index = u32::from(self.stream().read_u16(bci + 2)?);
                match modified {
                    ILOAD..=ALOAD => self.load_local(index, bci)?,
                    ISTORE..=ASTORE => self.store_local_op(modified - ISTORE, index, bci)?,
                    IINC => {
                        let delta = self.stream().read_i16(bci + 4)? as i32;
                        self.iinc(index, delta, bci)?;
                    }
                    _ => return Err(Bailout::unsupported(modified, bci)),
                }
            }

            // -- Array access -------------------------------------------------
            IALOAD..=SALOAD => {
                let elem = ARRAY_KINDS[(opcode - IALOAD) as usize];
                let index = self.pop_checked(Kind::Int, bci)?;
                let array = self.pop_checked(Kind::Object, bci)?;
                let id = self.append_trapping(
                    elem.stack_kind(),
                    InstrOp::LoadIndexed {
                        array,
                        index,
                        elem_kind: elem,
                    },
                    bci,
                )?;
                self.cur_state.push(elem.stack_kind(), id);
            }
            IASTORE..=SASTORE => {
                let elem = ARRAY_KINDS[(opcode - IASTORE) as usize];
                let value = self.pop_checked(elem.stack_kind(), bci)?;
                let index = self.pop_checked(Kind::Int, bci)?;
                let array = self.pop_checked(Kind::Object, bci)?;
                self.append_trapping(
                    Kind::Void,
                    InstrOp::StoreIndexed {
                        array,
                        index,
                        value,
                        elem_kind: elem,
                    },
                    bci,
                )?;
            }

            // -- Stack manipulation -------------------------------------------
            POP => {
                self.pop_slot(bci)?;
            }
            POP2 => {
                self.pop_raw_checked(bci)?;
                self.pop_raw_checked(bci)?;
            }
            DUP => {
                let v = self.pop_slot(bci)?;
                self.cur_state.push_raw(Some(v));
                self.cur_state.push_raw(Some(v));
            }
            DUP_X1 => {
                let v1 = self.pop_slot(bci)?;
                let v2 = self.pop_slot(bci)?;
                self.cur_state.push_raw(Some(v1));
                self.cur_state.push_raw(Some(v2));
                self.cur_state.push_raw(Some(v1));
            }
            DUP_X2 => {
                let v1 = self.pop_slot(bci)?;
                let s2 = self.pop_raw_checked(bci)?;
                let s3 = self.pop_raw_checked(bci)?;
                self.cur_state.push_raw(Some(v1));
                self.cur_state.push_raw(s3);
                self.cur_state.push_raw(s2);
                self.cur_state.push_raw(Some(v1));
            }
            DUP2 => {
                let s1 = self.pop_raw_checked(bci)?;
                let s2 = self.pop_raw_checked(bci)?;
                self.cur_state.push_raw(s2);
                self.cur_state.push_raw(s1);
                self.cur_state.push_raw(s2);
                self.cur_state.push_raw(s1);
            }
            DUP2_X1 => {
                let s1 = self.pop_raw_checked(bci)?;
                let s2 = self.pop_raw_checked(bci)?;
                let s3 = self.pop_raw_checked(bci)?;
                self.cur_state.push_raw(s2);
                self.cur_state.push_raw(s1);
                self.cur_state.push_raw(s3);
                self.cur_state.push_raw(s2);
                self.cur_state.push_raw(s1);
            }
            DUP2_X2 => {
                let s1 = self.pop_raw_checked(bci)?;
                let s2 = self.pop_raw_checked(bci)?;
                let s3 = self.pop_raw_checked(bci)?;
                let s4 = self.pop_raw_checked(bci)?;
                self.cur_state.push_raw(s2);
                self.cur_state.push_raw(s1);
                self.cur_state.push_raw(s4);
                self.cur_state.push_raw(s3);
                self.cur_state.push_raw(s2);
                self.cur_state.push_raw(s1);
            }
            SWAP => {
                let v1 = self.pop_slot(bci)?;
                let v2 = self.pop_slot(bci)?;
                self.cur_state.push_raw(Some(v1));
                self.cur_state.push_raw(Some(v2));
            }

            // -- Arithmetic ---------------------------------------------------
            IADD..=DADD => self.arith(ArithOp::Add, opcode - IADD, bci)?,
            ISUB..=DSUB => self.arith(ArithOp::Sub, opcode - ISUB, bci)?,
            IMUL..=DMUL => self.arith(ArithOp::Mul, opcode - IMUL, bci)?,
            IDIV..=DDIV => self.arith(ArithOp::Div, opcode - IDIV, bci)?,
            IREM..=DREM => self.arith(ArithOp::Rem, opcode - IREM, bci)?,
            INEG..=DNEG => {
                let kind = NUMERIC_KINDS[(opcode - INEG) as usize];
                let x = self.pop_checked(kind, bci)?;
                let id = self.append_value(kind, InstrOp::Negate { x }, bci);
                self.cur_state.push(kind, id);
            }
            ISHL..=LUSHR => {
                let idx = opcode - ISHL;
                let kind = if idx % 2 == 0 { Kind::Int } else { Kind::Long };
                let op = [ShiftOp::Shl, ShiftOp::Shr, ShiftOp::Ushr][(idx / 2) as usize];
                let y = self.pop_checked(Kind::Int, bci)?;
                let x = self.pop_checked(kind, bci)?;
                let id = self.append_value(kind, InstrOp::ShiftOp { op, x, y }, bci);
                self.cur_state.push(kind, id);
            }
            IAND..=LXOR => {
                let idx = opcode - IAND;
                let kind = if idx % 2 == 0 { Kind::Int } else { Kind::Long };
                let op = [LogicOp::And, LogicOp::Or, LogicOp::Xor][(idx / 2) as usize];
                let y = self.pop_checked(kind, bci)?;
                let x = self.pop_checked(kind, bci)?;
                let id = self.append_value(kind, InstrOp::LogicOp { op, x, y }, bci);
                self.cur_state.push(kind, id);
            }

            // -- Conversions --------------------------------------------------
            I2L..=I2S => {
                let op = CONVERSIONS[(opcode - I2L) as usize];
                let x = self.pop_checked(op.input_kind(), bci)?;
                let kind = op.result_kind();
                let id = self.append_value(kind, InstrOp::Convert { op, x }, bci);
                self.cur_state.push(kind, id);
            }

            // -- Comparisons --------------------------------------------------
            LCMP..=DCMPG => {
                let (variant, kind) = match opcode {
                    LCMP => (CmpVariant::Lcmp, Kind::Long),
                    FCMPL => (CmpVariant::Fcmpl, Kind::Float),
                    FCMPG => (CmpVariant::Fcmpg, Kind::Float),
                    DCMPL => (CmpVariant::Dcmpl, Kind::Double),
                    _ => (CmpVariant::Dcmpg, Kind::Double),
                };
                let y = self.pop_checked(kind, bci)?;
                let x = self.pop_checked(kind, bci)?;
                let id = self.append_value(Kind::Int, InstrOp::Compare { op: variant, x, y }, bci);
                self.cur_state.push(Kind::Int, id);
            }

            // -- Branches -----------------------------------------------------
            IFEQ..=IFLE => {
                let cond = CONDS[(opcode - IFEQ) as usize];
                let x = self.pop_checked(Kind::Int, bci)?;
                let y = self.append_const(ConstValue::Int(0), bci);
                return self.branch(cond, x, y, bci);
            }
            IF_ICMPEQ..=IF_ICMPLE => {
                let cond = CONDS[(opcode - IF_ICMPEQ) as usize];
                let y = self.pop_checked(Kind::Int, bci)?;
                let x = self.pop_checked(Kind::Int, bci)?;
                return self.branch(cond, x, y, bci);
            }
            IF_ACMPEQ | IF_ACMPNE => {
                let cond = if opcode == IF_ACMPEQ { Cond::Eq } else { Cond::Ne };
                let y = self.pop_checked(Kind::Object, bci)?;
                let x = self.pop_checked(Kind::Object, bci)?;
                return self.branch(cond, x, y, bci);
            }
            IFNULL | IFNONNULL => {
                let cond = if opcode == IFNULL { Cond::Eq } else { Cond::Ne };
                let x = self.pop_checked(Kind::Object, bci)?;
                let y = self.append_const(ConstValue::Null, bci);
                return self.branch(cond, x, y, bci);
            }
            GOTO => {
                let target = self.stream().branch_dest(bci)?;
                self.goto_target(target, bci)?;
                return Ok(true);
            }
            GOTO_W => {
                let target = self.stream().far_branch_dest(bci)?;
                self.goto_target(target, bci)?;
                return Ok(true);
            }

            // -- Switches -----------------------------------------------------
            TABLESWITCH => {
                self.table_switch(bci)?;
                return Ok(true);
            }
            LOOKUPSWITCH => {
                self.lookup_switch(bci)?;
                return Ok(true);
            }

            // -- Returns ------------------------------------------------------
            IRETURN..=ARETURN => {
                let kind = RETURN_KINDS[(opcode - IRETURN) as usize];
                let value = self.pop_checked(kind, bci)?;
                return self.do_return(Some(value), bci);
            }
            RETURN => {
                return self.do_return(None, bci);
            }

            ATHROW => {
                let exception = self.pop_checked(Kind::Object, bci)?;
                self.append_trapping(Kind::Void, InstrOp::Throw { exception }, bci)?;
                return Ok(true);
            }

            // -- Fields -------------------------------------------------------
            GETSTATIC | PUTSTATIC | GETFIELD | PUTFIELD => {
                let index = self.stream().read_u16(bci + 1)?;
                let field = self
                    .ctx
                    .pool
                    .field_at(index)
                    .ok_or_else(|| Bailout::unresolved(format!("field #{index}"), bci))?;
                let is_static = opcode == GETSTATIC || opcode == PUTSTATIC;
                if field.is_static != is_static {
                    return Err(Bailout::malformed(format!(
                        "field {} static mismatch at bci {bci}",
                        field.name
                    )));
                }
                match opcode {
                    GETFIELD | GETSTATIC => {
                        let obj = if is_static {
                            None
                        } else {
                            Some(self.pop_checked(Kind::Object, bci)?)
                        };
                        let kind = field.kind.stack_kind();
                        let id = self.append_trapping(
                            kind,
                            InstrOp::LoadField { obj, field },
                            bci,
                        )?;
                        self.cur_state.push(kind, id);
                    }
                    _ => {
                        let value = self.pop_checked(field.kind.stack_kind(), bci)?;
                        let obj = if is_static {
                            None
                        } else {
                            Some(self.pop_checked(Kind::Object, bci)?)
                        };
                        self.append_trapping(
                            Kind::Void,
                            InstrOp::StoreField { obj, field, value },
                            bci,
                        )?;
                    }
                }
            }

            // -- Calls --------------------------------------------------------
            INVOKEVIRTUAL | INVOKESPECIAL | INVOKESTATIC | INVOKEINTERFACE => {
                self.invoke(opcode, bci)?;
            }
            INVOKEDYNAMIC => return Err(Bailout::unsupported(opcode, bci)),

            // -- Allocation and type tests ------------------------------------
            NEW => {
                let class = self.class_operand(bci)?;
                let id = self.append_trapping(Kind::Object, InstrOp::NewInstance { class }, bci)?;
                self.hir.instr_mut(id).flags.insert(InstrFlags::NON_NULL);
                self.cur_state.push(Kind::Object, id);
            }
            NEWARRAY => {
                let atype = self.stream().read_u8(bci + 1)?;
                let elem_kind = newarray_kind(atype)
                    .ok_or_else(|| Bailout::malformed(format!("bad newarray type {atype}")))?;
                let length = self.pop_checked(Kind::Int, bci)?;
                let id = self.append_trapping(
                    Kind::Object,
                    InstrOp::NewTypeArray { length, elem_kind },
                    bci,
                )?;
                self.hir.instr_mut(id).flags.insert(InstrFlags::NON_NULL);
                self.cur_state.push(Kind::Object, id);
            }
            ANEWARRAY => {
                let class = self.class_operand(bci)?;
                let length = self.pop_checked(Kind::Int, bci)?;
                let id = self.append_trapping(
                    Kind::Object,
                    InstrOp::NewObjectArray { length, class },
                    bci,
                )?;
                self.hir.instr_mut(id).flags.insert(InstrFlags::NON_NULL);
                self.cur_state.push(Kind::Object, id);
            }
            MULTIANEWARRAY => {
                let class = self.class_operand(bci)?;
                let ndims = self.stream().read_u8(bci + 3)?;
                if ndims == 0 {
                    return Err(Bailout::malformed("multianewarray with zero dimensions"));
                }
                let mut dims: SmallVec<[InstrId; 2]> = SmallVec::new();
                for _ in 0..ndims {
                    dims.push(self.pop_checked(Kind::Int, bci)?);
                }
                dims.reverse();
                let id = self.append_trapping(
                    Kind::Object,
                    InstrOp::NewMultiArray { class, dims },
                    bci,
                )?;
                self.hir.instr_mut(id).flags.insert(InstrFlags::NON_NULL);
                self.cur_state.push(Kind::Object, id);
            }
            ARRAYLENGTH => {
                let array = self.pop_checked(Kind::Object, bci)?;
                let id = self.append_trapping(Kind::Int, InstrOp::ArrayLength { array }, bci)?;
                self.cur_state.push(Kind::Int, id);
            }
            CHECKCAST => {
                let class = self.class_operand(bci)?;
                let obj = self.pop_checked(Kind::Object, bci)?;
                let id = self.append_trapping(Kind::Object, InstrOp::CheckCast { obj, class }, bci)?;
                self.cur_state.push(Kind::Object, id);
            }
            INSTANCEOF => {
                let class = self.class_operand(bci)?;
                let obj = self.pop_checked(Kind::Object, bci)?;
                let id = self.append_trapping(Kind::Int, InstrOp::InstanceOf { obj, class }, bci)?;
                self.cur_state.push(Kind::Int, id);
            }

            // -- Monitors -----------------------------------------------------
            MONITORENTER => {
                let obj = self.pop_checked(Kind::Object, bci)?;
                let lock_number = self.cur_state.lock(obj);
                self.append_trapping(Kind::Void, InstrOp::MonitorEnter { obj, lock_number }, bci)?;
            }
            MONITOREXIT => {
                let obj = self.pop_checked(Kind::Object, bci)?;
                let lock_number = self.cur_state.unlock().ok_or_else(|| {
                    Bailout::invariant(format!("monitorexit without a held monitor at bci {bci}"))
                })?;
                self.append_trapping(Kind::Void, InstrOp::MonitorExit { obj, lock_number }, bci)?;
            }

            _ => return Err(Bailout::unsupported(opcode, bci)),
        }
        Ok(false)
    }

    // -------------------------------------------------------------------------
    // Opcode helpers
    // -------------------------------------------------------------------------

    fn load_local(&mut self, index: u32, bci: u32) -> CompileResult<()> {
        let value = self.cur_state.load_local(index as usize).ok_or_else(|| {
            Bailout::malformed(format!(
                "read of uninitialized local {index} at bci {bci}"
            ))
        })?;
        let kind = self.hir.instr(value).kind;
        self.cur_state.push(kind, value);
        Ok(())
    }

    fn store_local_op(&mut self, group: u8, index: u32, bci: u32) -> CompileResult<()> {
        let kind = [Kind::Int, Kind::Long, Kind::Float, Kind::Double, Kind::Object]
            [group as usize];
        let value = if kind == Kind::Object {
            // astore also accepts word values.
            self.pop_slot(bci)?
        } else {
            self.pop_checked(kind, bci)?
        };
        let stored_kind = self.hir.instr(value).kind;
        let max = self.cur_state.locals.len() as u32;
        if index + stored_kind.jvm_slots() > max {
            return Err(Bailout::malformed(format!(
                "store to local {index} exceeds max locals {max} at bci {bci}"
            )));
        }
        self.cur_state.store_local(index as usize, stored_kind, value);
        Ok(())
    }

    fn iinc(&mut self, index: u32, delta: i32, bci: u32) -> CompileResult<()> {
        let value = self.cur_state.load_local(index as usize).ok_or_else(|| {
            Bailout::malformed(format!("iinc of uninitialized local {index} at bci {bci}"))
        })?;
        let delta = self.append_const(ConstValue::Int(delta), bci);
        let sum = self.append_value(
            Kind::Int,
            InstrOp::ArithmeticOp {
                op: ArithOp::Add,
                x: value,
                y: delta,
            },
            bci,
        );
        self.cur_state.store_local(index as usize, Kind::Int, sum);
        Ok(())
    }

    fn arith(&mut self, op: ArithOp, kind_index: u8, bci: u32) -> CompileResult<()> {
        let kind = NUMERIC_KINDS[kind_index as usize];
        let y = self.pop_checked(kind, bci)?;
        let x = self.pop_checked(kind, bci)?;
        let node = InstrOp::ArithmeticOp { op, x, y };
        let id = if node.can_trap(kind) {
            self.append_trapping(kind, node, bci)?
        } else {
            self.append_value(kind, node, bci)
        };
        self.cur_state.push(kind, id);
        Ok(())
    }

    fn branch(&mut self, cond: Cond, x: InstrId, y: InstrId, bci: u32) -> CompileResult<bool> {
        let tdest = self.stream().branch_dest(bci)?;
        let fdest = self.stream().next_bci(bci)?;
        // Branches on two constants fold to a goto.
        if self.options.canonicalize() {
            if let (Some(a), Some(b)) = (self.const_of(x), self.const_of(y)) {
                if let Some(taken) = eval_cond(cond, a, b) {
                    let dest = if taken { tdest } else { fdest };
                    self.goto_target(dest, bci)?;
                    return Ok(true);
                }
            }
        }
        if tdest <= bci {
            self.loop_safepoint(bci)?;
        }
        let tsux = self.block_at(tdest)?;
        let fsux = self.block_at(fdest)?;
        let branch = self.hir.new_instr(Instr::new(
            Kind::Void,
            InstrOp::If {
                cond,
                x,
                y,
                tsux,
                fsux,
            },
            bci,
        ));
        self.hir.append(self.cur_block, branch);
        let from = self.cur_block;
        self.merge_into(tsux, from)?;
        self.merge_into(fsux, from)?;
        Ok(true)
    }

    fn goto_target(&mut self, target_bci: u32, bci: u32) -> CompileResult<()> {
        if target_bci <= bci {
            self.loop_safepoint(bci)?;
        }
        let target = self.block_at(target_bci)?;
        let goto = self
            .hir
            .new_instr(Instr::new(Kind::Void, InstrOp::Goto { sux: target }, bci));
        self.hir.append(self.cur_block, goto);
        let from = self.cur_block;
        self.merge_into(target, from)
    }

    /// Fall-through into the leader at `next`.
    fn goto_block(&mut self, next: u32, bci: u32) -> CompileResult<()> {
        self.goto_target(next, bci)
    }

    fn loop_safepoint(&mut self, bci: u32) -> CompileResult<()> {
        if self.ctx.method.flags.no_safepoints() {
            return Ok(());
        }
        let sid = self.record_cur_state(bci);
        let sp = self.hir.new_instr({
            let mut i = Instr::new(Kind::Void, InstrOp::Safepoint, bci);
            i.state = Some(sid);
            i.flags.insert(InstrFlags::PINNED);
            i
        });
        self.hir.append(self.cur_block, sp);
        Ok(())
    }

    fn table_switch(&mut self, bci: u32) -> CompileResult<()> {
        let stream = self.stream();
        let payload = stream.switch_payload(bci);
        let default_delta = stream.read_i32(payload)?;
        let lo = stream.read_i32(payload + 4)?;
        let hi = stream.read_i32(payload + 8)?;
        let entries = (hi as i64 - lo as i64 + 1) as u32;
        let mut dests = Vec::with_capacity(entries as usize);
        for i in 0..entries {
            let delta = stream.read_i32(payload + 12 + i * 4)?;
            dests.push(self.checked_switch_target(bci, delta)?);
        }
        let default_dest = self.checked_switch_target(bci, default_delta)?;
        drop(stream);

        let value = self.pop_checked(Kind::Int, bci)?;
        let mut suxs = Vec::with_capacity(dests.len());
        for dest in &dests {
            suxs.push(self.block_at(*dest)?);
        }
        let default = self.block_at(default_dest)?;
        let sw = self.hir.new_instr(Instr::new(
            Kind::Void,
            InstrOp::TableSwitch {
                value,
                lo_key: lo,
                suxs: suxs.clone(),
                default,
            },
            bci,
        ));
        self.hir.append(self.cur_block, sw);
        let from = self.cur_block;
        for sux in suxs {
            self.merge_into(sux, from)?;
        }
        self.merge_into(default, from)
    }

    fn lookup_switch(&mut self, bci: u32) -> CompileResult<()> {
        let stream = self.stream();
        let payload = stream.switch_payload(bci);
        let default_delta = stream.read_i32(payload)?;
        let npairs = stream.read_i32(payload + 4)? as u32;
        let mut keys = Vec::with_capacity(npairs as usize);
        let mut dests = Vec::with_capacity(npairs as usize);
        for i in 0..npairs {
            let key = stream.read_i32(payload + 8 + i * 8)?;
            let delta = stream.read_i32(payload + 8 + i * 8 + 4)?;
            if let Some(&prev) = keys.last() {
                if key <= prev {
                    return Err(Bailout::malformed(format!(
                        "lookupswitch keys not strictly ascending at bci {bci}"
                    )));
                }
            }
            keys.push(key);
            dests.push(self.checked_switch_target(bci, delta)?);
        }
        let default_dest = self.checked_switch_target(bci, default_delta)?;
        drop(stream);

        let value = self.pop_checked(Kind::Int, bci)?;
        let mut suxs = Vec::with_capacity(dests.len());
        for dest in &dests {
            suxs.push(self.block_at(*dest)?);
        }
        let default = self.block_at(default_dest)?;
        let sw = self.hir.new_instr(Instr::new(
            Kind::Void,
            InstrOp::LookupSwitch {
                value,
                keys,
                suxs: suxs.clone(),
                default,
            },
            bci,
        ));
        self.hir.append(self.cur_block, sw);
        let from = self.cur_block;
        for sux in suxs {
            self.merge_into(sux, from)?;
        }
        self.merge_into(default, from)
    }

    fn checked_switch_target(&self, bci: u32, delta: i32) -> CompileResult<u32> {
        let target = bci as i64 + delta as i64;
        if target < 0 || target >= self.ctx.code.len() as i64 {
            return Err(Bailout::malformed(format!(
                "switch at bci {bci} targets {target} outside the method"
            )));
        }
        Ok(target as u32)
    }

    fn do_return(&mut self, value: Option<InstrId>, bci: u32) -> CompileResult<bool> {
        if self.inline_depth > 0 {
            if self.cur_state.lock_depth() != 0 {
                return Err(Bailout::invariant(
                    "inlined callee returns while holding a monitor",
                ));
            }
            self.inline_result = Some(value);
            return Ok(true);
        }
        if let (Some(obj), true) = (self.sync_obj, self.ctx.method.flags.is_synchronized()) {
            let sid = self.record_cur_state(bci);
            let exit = self.hir.new_instr({
                let mut i = Instr::new(
                    Kind::Void,
                    InstrOp::MonitorExit {
                        obj,
                        lock_number: 0,
                    },
                    bci,
                );
                i.state = Some(sid);
                i.flags.insert(InstrFlags::PINNED);
                i
            });
            self.hir.append(self.cur_block, exit);
        }
        let ret = self
            .hir
            .new_instr(Instr::new(Kind::Void, InstrOp::Return { value }, bci));
        self.hir.append(self.cur_block, ret);
        Ok(true)
    }

    fn class_operand(&mut self, bci: u32) -> CompileResult<crate::runtime::ClassRef> {
        let index = self.stream().read_u16(bci + 1)?;
        self.ctx
            .pool
            .class_at(index)
            .ok_or_else(|| Bailout::unresolved(format!("class #{index}"), bci))
    }

    fn load_pool_constant(&mut self, index: u16, bci: u32) -> CompileResult<ConstValue> {
        if let Some(value) = self.ctx.pool.constant_at(index) {
            return Ok(value);
        }
        if let Some(class) = self.ctx.pool.class_at(index) {
            return Ok(self.runtime.class_mirror(&class));
        }
        Err(Bailout::unresolved(format!("constant #{index}"), bci))
    }

    // -------------------------------------------------------------------------
    // Calls
    // -------------------------------------------------------------------------

    fn invoke(&mut self, opcode: u8, bci: u32) -> CompileResult<()> {
        let index = self.stream().read_u16(bci + 1)?;
        let target = self
            .ctx
            .pool
            .method_at(index)
            .ok_or_else(|| Bailout::unresolved(format!("method #{index}"), bci))?;
        let kind = match opcode {
            INVOKESTATIC => InvokeKind::Static,
            INVOKESPECIAL => InvokeKind::Special,
            INVOKEVIRTUAL => InvokeKind::Virtual,
            _ => InvokeKind::Interface,
        };
        if target.flags.is_static() != (kind == InvokeKind::Static) {
            return Err(Bailout::malformed(format!(
                "invoke kind disagrees with {} flags at bci {bci}",
                target.qualified_name()
            )));
        }

        // Pop arguments, receiver first in the final order.
        let arg_kinds = target.argument_kinds();
        let mut args: SmallVec<[InstrId; 4]> = SmallVec::new();
        for &k in arg_kinds.iter().rev() {
            args.push(self.pop_checked(k.stack_kind(), bci)?);
        }
        args.reverse();
        let result_kind = target.signature.result().stack_kind();

        if let Some(id) =
            intrinsics::recognize(&target.holder, &target.name, target.signature.descriptor())
        {
            return self.emit_intrinsic(id, args, result_kind, bci);
        }

        if kind.is_direct() && self.try_inline(&target, &args, bci)? {
            return Ok(());
        }

        let call = self.append_trapping(
            result_kind,
            InstrOp::Invoke {
                kind,
                target: target.clone(),
                args,
            },
            bci,
        )?;
        if result_kind != Kind::Void {
            self.cur_state.push(result_kind, call);
        }
        Ok(())
    }

    fn emit_intrinsic(
        &mut self,
        id: IntrinsicId,
        args: SmallVec<[InstrId; 4]>,
        result_kind: Kind,
        bci: u32,
    ) -> CompileResult<()> {
        match id {
            IntrinsicId::ObjectInit => {
                // Nothing to do beyond consuming the receiver.
                Ok(())
            }
            IntrinsicId::CompareAndSwapInt
            | IntrinsicId::CompareAndSwapLong
            | IntrinsicId::CompareAndSwapObject => {
                let node = self.append_trapping(
                    result_kind,
                    InstrOp::Intrinsic { id, args },
                    bci,
                )?;
                self.cur_state.push(result_kind, node);
                Ok(())
            }
            IntrinsicId::NanoTime | IntrinsicId::CurrentTimeMillis => {
                let node = self.hir.new_instr({
                    let mut i = Instr::new(result_kind, InstrOp::Intrinsic { id, args }, bci);
                    i.flags.insert(InstrFlags::PINNED);
                    i
                });
                self.hir.append(self.cur_block, node);
                self.cur_state.push(result_kind, node);
                Ok(())
            }
            _ => {
                let node = self.append(result_kind, InstrOp::Intrinsic { id, args }, bci);
                self.cur_state.push(result_kind, node);
                Ok(())
            }
        }
    }

    /// Inline a small straight-line callee under a pushed scope. Returns
    /// false when the callee does not qualify.
    fn try_inline(
        &mut self,
        target: &MethodRef,
        args: &[InstrId],
        bci: u32,
    ) -> CompileResult<bool> {
        if !self.options.inline() || self.inline_depth >= MAX_INLINE_DEPTH {
            return Ok(false);
        }
        let Some(code) = target.code.as_ref() else {
            return Ok(false);
        };
        if code.bytecode.len() > MAX_INLINE_SIZE
            || target.flags.is_synchronized()
            || target.flags.is_native()
            || !code.handlers.is_empty()
            || !is_straight_line(&code.bytecode)
        {
            return Ok(false);
        }
        if let Some(profile) = self.runtime.profile(target) {
            if profile.invocation_count == 0 {
                return Ok(false);
            }
        }

        // Resolve the call site's handlers once; every trapping instruction
        // of the callee inherits them.
        let site_handlers = self.handlers_for(bci)?;
        let caller_sid = self.record_cur_state(bci);
        let level = self.hir.scope(self.cur_scope).level + 1;
        let scope = self.hir.push_scope(IrScope {
            method: target.clone(),
            caller: Some(self.cur_scope),
            caller_bci: bci,
            level,
        });

        let mut child = MutableState::new(scope, code.max_locals as usize);
        child.caller = Some(caller_sid);
        let mut slot = 0usize;
        for (&arg, kind) in args.iter().zip(target.argument_kinds()) {
            let kind = kind.stack_kind();
            if slot + kind.jvm_slots() as usize > child.locals.len() {
                return Err(Bailout::malformed(format!(
                    "inlined {} declares too few locals",
                    target.qualified_name()
                )));
            }
            child.store_local(slot, kind, arg);
            slot += kind.jvm_slots() as usize;
        }

        let saved_ctx = std::mem::replace(
            &mut self.ctx,
            InterpContext {
                method: target.clone(),
                code: code.bytecode.clone(),
                pool: Arc::clone(&code.pool),
                handlers: Vec::new(),
            },
        );
        let saved_state = std::mem::replace(&mut self.cur_state, child);
        let saved_scope = std::mem::replace(&mut self.cur_scope, scope);
        let saved_handlers = std::mem::replace(&mut self.inline_handlers, Some(site_handlers));
        let saved_result = self.inline_result.take();
        self.inline_depth += 1;

        let mut callee_bci = 0u32;
        let result = loop {
            let ended = self.interpret_one(callee_bci)?;
            if ended {
                break self.inline_result.take();
            }
            callee_bci = self.stream().next_bci(callee_bci)?;
        };

        self.inline_depth -= 1;
        self.inline_result = saved_result;
        self.inline_handlers = saved_handlers;
        self.cur_scope = saved_scope;
        self.cur_state = saved_state;
        self.ctx = saved_ctx;

        let result_kind = target.signature.result().stack_kind();
        match result {
            Some(Some(v)) => self.cur_state.push(result_kind, v),
            Some(None) => {}
            None => {
                return Err(Bailout::invariant(format!(
                    "inlined {} did not return",
                    target.qualified_name()
                )))
            }
        }
        Ok(true)
    }

    // -------------------------------------------------------------------------
    // Appending
    // -------------------------------------------------------------------------

    fn append(&mut self, kind: Kind, op: InstrOp, bci: u32) -> InstrId {
        let id = self.hir.new_instr(Instr::new(kind, op, bci));
        self.hir.append(self.cur_block, id);
        id
    }

    /// Append a value-producing pure op, canonicalizing and value-numbering
    /// when enabled.
    fn append_value(&mut self, kind: Kind, op: InstrOp, bci: u32) -> InstrId {
        let mut op = op;
        if self.options.canonicalize() {
            if let Some(folded) = self.try_fold(&op) {
                return self.append_const(folded, bci);
            }
            if let Some(existing) = self.try_identity(&op) {
                return existing;
            }
            if let Some(reduced) = self.try_strength_reduce(&op, kind, bci) {
                op = reduced;
            }
        }
        let key = vn_key(&op, kind);
        if self.options.canonicalize() {
            if let Some(key) = &key {
                if let Some(&id) = self.vn.get(key) {
                    return id;
                }
            }
        }
        let id = self.append(kind, op, bci);
        if let Some(key) = key {
            self.vn.insert(key, id);
        }
        id
    }

    fn append_const(&mut self, value: ConstValue, bci: u32) -> InstrId {
        let key = VnKey::Const(value);
        if let Some(&id) = self.vn.get(&key) {
            return id;
        }
        let id = self.append(value.kind(), InstrOp::Constant(value), bci);
        self.vn.insert(key, id);
        id
    }

    /// Append a potentially trapping instruction: pinned, with a frame
    /// state snapshot and the covering exception handlers.
    fn append_trapping(&mut self, kind: Kind, op: InstrOp, bci: u32) -> CompileResult<InstrId> {
        let sid = self.record_cur_state(bci);
        let handlers = self.handlers_for(bci)?;
        let id = self.hir.new_instr({
            let mut i = Instr::new(kind, op, bci);
            i.state = Some(sid);
            i.handlers = handlers;
            i.flags.insert(InstrFlags::PINNED);
            i
        });
        self.hir.append(self.cur_block, id);
        Ok(id)
    }

    fn record_cur_state(&mut self, bci: u32) -> StateId {
        self.hir.record_state(self.cur_state.snapshot(bci))
    }

    /// Handlers covering `bci`, innermost first, with the synchronized
    /// catch-all last. Resolving a handler merges the current locals into
    /// its entry state.
    fn handlers_for(&mut self, bci: u32) -> CompileResult<SmallVec<[HandlerEdge; 1]>> {
        if let Some(h) = &self.inline_handlers {
            return Ok(h.clone());
        }
        let mut edges: SmallVec<[HandlerEdge; 1]> = SmallVec::new();
        let covering: Vec<ExceptionHandler> = self
            .ctx
            .handlers
            .iter()
            .filter(|h| h.covers(bci))
            .cloned()
            .collect();
        for handler in covering {
            let block = self.block_at(handler.handler_bci)?;
            self.merge_exception(block)?;
            edges.push(HandlerEdge {
                block,
                catch_type: handler.catch_type.clone(),
            });
        }
        if let Some(sync) = self.sync_handler {
            edges.push(HandlerEdge {
                block: sync,
                catch_type: None,
            });
        }
        Ok(edges)
    }

    /// Merge the current locals into a handler's entry state. Slots that
    /// disagree across covered sites are dead at the handler.
    fn merge_exception(&mut self, handler: BlockId) -> CompileResult<()> {
        if Some(handler) == self.sync_handler {
            return Ok(());
        }
        match self.hir.block(handler).state_before {
            None => {
                let bci = self.hir.block(handler).bci;
                let snap = FrameState {
                    scope: self.cur_state.scope,
                    bci,
                    locals: self.cur_state.locals.clone(),
                    stack: Vec::new(),
                    locks: self.cur_state.locks.clone(),
                    caller: self.cur_state.caller,
                };
                let sid = self.hir.record_state(snap);
                self.hir.block_mut(handler).state_before = Some(sid);
                self.push_worklist(handler);
                Ok(())
            }
            Some(sid) => {
                let existing = self.hir.state(sid).clone();
                if existing.locks != self.cur_state.locks {
                    return Err(Bailout::invariant(
                        "monitor depth differs across a handler's covered range",
                    ));
                }
                let mut merged = existing.locals.clone();
                let mut changed = false;
                for (i, slot) in merged.iter_mut().enumerate() {
                    let inc = self.cur_state.locals.get(i).copied().flatten();
                    if slot.is_some() && *slot != inc {
                        *slot = None;
                        changed = true;
                    }
                }
                if changed {
                    if self.hir.block(handler).was_visited() {
                        return Err(Bailout::invariant(
                            "handler entry state changed after the handler was built",
                        ));
                    }
                    let snap = FrameState {
                        scope: existing.scope,
                        bci: existing.bci,
                        locals: merged,
                        stack: existing.stack,
                        locks: existing.locks,
                        caller: existing.caller,
                    };
                    let nid = self.hir.record_state(snap);
                    self.hir.block_mut(handler).state_before = Some(nid);
                }
                Ok(())
            }
        }
    }

    // -------------------------------------------------------------------------
    // Canonicalization
    // -------------------------------------------------------------------------

    fn const_of(&self, id: InstrId) -> Option<ConstValue> {
        match &self.hir.instr(id).op {
            InstrOp::Constant(v) => Some(*v),
            _ => None,
        }
    }

    fn try_fold(&self, op: &InstrOp) -> Option<ConstValue> {
        match op {
            InstrOp::ArithmeticOp { op, x, y } => {
                fold_arith(*op, self.const_of(*x)?, self.const_of(*y)?)
            }
            InstrOp::LogicOp { op, x, y } => {
                fold_logic(*op, self.const_of(*x)?, self.const_of(*y)?)
            }
            InstrOp::ShiftOp { op, x, y } => {
                fold_shift(*op, self.const_of(*x)?, self.const_of(*y)?)
            }
            InstrOp::Negate { x } => fold_negate(self.const_of(*x)?),
            InstrOp::Convert { op, x } => fold_convert(*op, self.const_of(*x)?),
            InstrOp::Compare { op, x, y } => {
                fold_compare(*op, self.const_of(*x)?, self.const_of(*y)?)
            }
            _ => None,
        }
    }

    /// Algebraic identities that return an existing value.
    fn try_identity(&self, op: &InstrOp) -> Option<InstrId> {
        match op {
            InstrOp::ArithmeticOp {
                op: ArithOp::Add | ArithOp::Sub,
                x,
                y,
            } => match self.const_of(*y)? {
                ConstValue::Int(0) | ConstValue::Long(0) => Some(*x),
                _ => None,
            },
            InstrOp::ArithmeticOp {
                op: ArithOp::Mul,
                x,
                y,
            } => match self.const_of(*y)? {
                ConstValue::Int(1) | ConstValue::Long(1) => Some(*x),
                _ => None,
            },
            InstrOp::ShiftOp { x, y, .. } => match self.const_of(*y)? {
                ConstValue::Int(0) => Some(*x),
                _ => None,
            },
            _ => None,
        }
    }

    /// Multiplication by a power of two becomes a shift.
    fn try_strength_reduce(&mut self, op: &InstrOp, kind: Kind, bci: u32) -> Option<InstrOp> {
        let InstrOp::ArithmeticOp {
            op: ArithOp::Mul,
            x,
            y,
        } = op
        else {
            return None;
        };
        if !matches!(kind, Kind::Int | Kind::Long) {
            return None;
        }
        let shift = match self.const_of(*y)? {
            ConstValue::Int(v) if v > 1 && (v as u32).is_power_of_two() => v.trailing_zeros(),
            ConstValue::Long(v) if v > 1 && (v as u64).is_power_of_two() => v.trailing_zeros(),
            _ => return None,
        };
        let amount = self.append_const(ConstValue::Int(shift as i32), bci);
        Some(InstrOp::ShiftOp {
            op: ShiftOp::Shl,
            x: *x,
            y: amount,
        })
    }

    // -------------------------------------------------------------------------
    // State plumbing
    // -------------------------------------------------------------------------

    fn pop_checked(&mut self, kind: Kind, bci: u32) -> CompileResult<InstrId> {
        let needed = kind.jvm_slots() as usize;
        if self.cur_state.stack_size() < needed.max(1) {
            return Err(Bailout::malformed(format!(
                "operand stack underflow at bci {bci}"
            )));
        }
        if kind.is_category2() {
            // The upper slot must be the empty half of a category-2 value.
            let top = self.cur_state.pop_raw();
            if top.is_some() {
                return Err(Bailout::malformed(format!(
                    "malformed category-2 stack value at bci {bci}"
                )));
            }
        }
        self.cur_state.pop_raw().ok_or_else(|| {
            Bailout::malformed(format!("popped an empty stack slot at bci {bci}"))
        })
    }

    /// Pop one category-1 slot that must hold a value.
    fn pop_slot(&mut self, bci: u32) -> CompileResult<InstrId> {
        if self.cur_state.stack_size() < 1 {
            return Err(Bailout::malformed(format!(
                "operand stack underflow at bci {bci}"
            )));
        }
        self.cur_state.pop_raw().ok_or_else(|| {
            Bailout::malformed(format!("popped an empty stack slot at bci {bci}"))
        })
    }

    fn pop_raw_checked(&mut self, bci: u32) -> CompileResult<Option<InstrId>> {
        if self.cur_state.stack_size() < 1 {
            return Err(Bailout::malformed(format!(
                "operand stack underflow at bci {bci}"
            )));
        }
        Ok(self.cur_state.pop_raw())
    }

    fn to_mutable(&self, sid: StateId) -> MutableState {
        let st = self.hir.state(sid).clone();
        let mut cat2 = Vec::new();
        for (i, slot) in st.locals.iter().enumerate() {
            if let Some(v) = slot {
                if self.hir.instr(*v).kind.is_category2() {
                    cat2.push(i);
                }
            }
        }
        MutableState::restore(st.scope, st.locals, st.stack, st.locks, st.caller, cat2)
    }

    fn block_at(&self, bci: u32) -> CompileResult<BlockId> {
        self.blocks_by_bci.get(&bci).copied().ok_or_else(|| {
            Bailout::invariant(format!("no block starts at bci {bci}"))
        })
    }

    fn push_worklist(&mut self, block: BlockId) {
        let b = self.hir.block_mut(block);
        if !b.flags.contains(BlockFlags::ON_WORKLIST) && !b.flags.contains(BlockFlags::VISITED) {
            b.flags.insert(BlockFlags::ON_WORKLIST);
            self.worklist.push(block);
        }
    }
}

// Kind groups indexed by opcode distance.
const NUMERIC_KINDS: [Kind; 4] = [Kind::Int, Kind::Long, Kind::Float, Kind::Double];
const RETURN_KINDS: [Kind; 5] = [Kind::Int, Kind::Long, Kind::Float, Kind::Double, Kind::Object];
const ARRAY_KINDS: [Kind; 8] = [
    Kind::Int,
    Kind::Long,
    Kind::Float,
    Kind::Double,
    Kind::Object,
    Kind::Byte,
    Kind::Char,
    Kind::Short,
];
const CONDS: [Cond; 6] = [Cond::Eq, Cond::Ne, Cond::Lt, Cond::Ge, Cond::Gt, Cond::Le];
const CONVERSIONS: [Conversion; 15] = [
    Conversion::I2L,
    Conversion::I2F,
    Conversion::I2D,
    Conversion::L2I,
    Conversion::L2F,
    Conversion::L2D,
    Conversion::F2I,
    Conversion::F2L,
    Conversion::F2D,
    Conversion::D2I,
    Conversion::D2L,
    Conversion::D2F,
    Conversion::I2B,
    Conversion::I2C,
    Conversion::I2S,
];

/// A stable id for classes the compiler synthesizes descriptors for.
fn class_id_for(name: &str) -> u32 {
    let mut hash: u32 = 2166136261;
    for b in name.bytes() {
        hash ^= u32::from(b);
        hash = hash.wrapping_mul(16777619);
    }
    hash | 0x8000_0000
}

/// Whether bytecode is straight-line: no branches, switches or throws, and
/// at least one return.
fn is_straight_line(code: &[u8]) -> bool {
    let stream = BytecodeStream::new(code);
    let mut bci = 0;
    let mut has_return = false;
    while bci < stream.len() {
        let Ok(opcode) = stream.byte_at(bci) else {
            return false;
        };
        match opcode {
            IFEQ..=LOOKUPSWITCH | IFNULL..=JSR_W | ATHROW | MONITORENTER | MONITOREXIT
            | INVOKEDYNAMIC => return false,
            IRETURN..=RETURN => has_return = true,
            _ => {}
        }
        let Ok(next) = stream.next_bci(bci) else {
            return false;
        };
        bci = next;
    }
    has_return
}

/// Split edges from multi-successor blocks into blocks that merge with
/// phis by inserting a forwarding block, so phi moves always have a
/// dedicated edge block to land in. Phi-free merge targets keep their
/// original edges (switch-range construction depends on shared successors
/// staying shared).
fn split_critical_edges(hir: &mut Hir) {
    for b in hir.block_ids().collect::<Vec<_>>() {
        let suxs = hir.successors(b);
        if suxs.len() <= 1 {
            continue;
        }
        for (slot, &sux) in suxs.iter().enumerate() {
            if hir.block(sux).pred_count() <= 1 || !block_has_phis(hir, sux) {
                continue;
            }
            let bci = hir.block(sux).bci;
            let fresh = hir.new_block(bci);
            let goto = hir.new_instr(Instr::new(Kind::Void, InstrOp::Goto { sux }, bci));
            hir.append(fresh, goto);
            hir.block_mut(fresh).preds.push(b);
            // Redirect this occurrence in the predecessor list, preserving
            // the position phi inputs are indexed by.
            let preds = &mut hir.block_mut(sux).preds;
            if let Some(entry) = preds.iter_mut().find(|p| **p == b) {
                *entry = fresh;
            }
            set_successor(hir, b, slot, fresh);
        }
    }
}

/// Whether a block's entry state contains phis it owns.
fn block_has_phis(hir: &Hir, block: BlockId) -> bool {
    let Some(sid) = hir.block(block).state_before else {
        return false;
    };
    let mut found = false;
    hir.state(sid).for_each_value(|v| {
        if let InstrOp::Phi { block: owner, .. } = &hir.instr(v).op {
            if *owner == block {
                found = true;
            }
        }
    });
    found
}

/// Rewrite the `slot`-th successor (in `successors()` order) of a block's
/// terminator.
fn set_successor(hir: &mut Hir, block: BlockId, slot: usize, new_target: BlockId) {
    let last = hir.block(block).last.expect("terminated block");
    match &mut hir.instr_mut(last).op {
        InstrOp::Base {
            std_entry,
            osr_entry,
        } => {
            if slot == 0 {
                *std_entry = new_target;
            } else {
                *osr_entry = Some(new_target);
            }
        }
        InstrOp::If { tsux, fsux, .. } => {
            if slot == 0 {
                *tsux = new_target;
            } else {
                *fsux = new_target;
            }
        }
        InstrOp::TableSwitch { suxs, default, .. }
        | InstrOp::LookupSwitch { suxs, default, .. } => {
            if slot < suxs.len() {
                suxs[slot] = new_target;
            } else {
                *default = new_target;
            }
        }
        InstrOp::Goto { sux } => *sux = new_target,
        other => panic!("cannot rewrite successor of {other:?}"),
    }
}

// -----------------------------------------------------------------------------
// Constant folding
// -----------------------------------------------------------------------------

fn fold_arith(op: ArithOp, a: ConstValue, b: ConstValue) -> Option<ConstValue> {
    use ConstValue::*;
    Some(match (a, b) {
        (Int(x), Int(y)) => Int(match op {
            ArithOp::Add => x.wrapping_add(y),
            ArithOp::Sub => x.wrapping_sub(y),
            ArithOp::Mul => x.wrapping_mul(y),
            ArithOp::Div if y != 0 && !(x == i32::MIN && y == -1) => x / y,
            ArithOp::Rem if y != 0 && !(x == i32::MIN && y == -1) => x % y,
            _ => return None,
        }),
        (Long(x), Long(y)) => Long(match op {
            ArithOp::Add => x.wrapping_add(y),
            ArithOp::Sub => x.wrapping_sub(y),
            ArithOp::Mul => x.wrapping_mul(y),
            ArithOp::Div if y != 0 && !(x == i64::MIN && y == -1) => x / y,
            ArithOp::Rem if y != 0 && !(x == i64::MIN && y == -1) => x % y,
            _ => return None,
        }),
        (Float(x), Float(y)) => Float(match op {
            ArithOp::Add => x + y,
            ArithOp::Sub => x - y,
            ArithOp::Mul => x * y,
            ArithOp::Div => x / y,
            ArithOp::Rem => x % y,
        }),
        (Double(x), Double(y)) => Double(match op {
            ArithOp::Add => x + y,
            ArithOp::Sub => x - y,
            ArithOp::Mul => x * y,
            ArithOp::Div => x / y,
            ArithOp::Rem => x % y,
        }),
        _ => return None,
    })
}

fn fold_logic(op: LogicOp, a: ConstValue, b: ConstValue) -> Option<ConstValue> {
    use ConstValue::*;
    Some(match (a, b) {
        (Int(x), Int(y)) => Int(match op {
            LogicOp::And => x & y,
            LogicOp::Or => x | y,
            LogicOp::Xor => x ^ y,
        }),
        (Long(x), Long(y)) => Long(match op {
            LogicOp::And => x & y,
            LogicOp::Or => x | y,
            LogicOp::Xor => x ^ y,
        }),
        _ => return None,
    })
}

fn fold_shift(op: ShiftOp, a: ConstValue, b: ConstValue) -> Option<ConstValue> {
    use ConstValue::*;
    let Int(amount) = b else { return None };
    Some(match a {
        Int(x) => {
            let s = (amount & 31) as u32;
            Int(match op {
                ShiftOp::Shl => x.wrapping_shl(s),
                ShiftOp::Shr => x.wrapping_shr(s),
                ShiftOp::Ushr => ((x as u32).wrapping_shr(s)) as i32,
            })
        }
        Long(x) => {
            let s = (amount & 63) as u32;
            Long(match op {
                ShiftOp::Shl => x.wrapping_shl(s),
                ShiftOp::Shr => x.wrapping_shr(s),
                ShiftOp::Ushr => ((x as u64).wrapping_shr(s)) as i64,
            })
        }
        _ => return None,
    })
}

fn fold_negate(a: ConstValue) -> Option<ConstValue> {
    use ConstValue::*;
    Some(match a {
        Int(x) => Int(x.wrapping_neg()),
        Long(x) => Long(x.wrapping_neg()),
        Float(x) => Float(-x),
        Double(x) => Double(-x),
        _ => return None,
    })
}

fn fold_convert(op: Conversion, a: ConstValue) -> Option<ConstValue> {
    use ConstValue::*;
    Some(match (op, a) {
        (Conversion::I2L, Int(x)) => Long(i64::from(x)),
        (Conversion::I2F, Int(x)) => Float(x as f32),
        (Conversion::I2D, Int(x)) => Double(f64::from(x)),
        (Conversion::L2I, Long(x)) => Int(x as i32),
        (Conversion::L2F, Long(x)) => Float(x as f32),
        (Conversion::L2D, Long(x)) => Double(x as f64),
        (Conversion::F2I, Float(x)) => Int(f2i(f64::from(x), i32::MIN, i32::MAX) as i32),
        (Conversion::F2L, Float(x)) => Long(f2i(f64::from(x), i64::MIN, i64::MAX)),
        (Conversion::F2D, Float(x)) => Double(f64::from(x)),
        (Conversion::D2I, Double(x)) => Int(f2i(x, i32::MIN, i32::MAX) as i32),
        (Conversion::D2L, Double(x)) => Long(f2i(x, i64::MIN, i64::MAX)),
        (Conversion::D2F, Double(x)) => Float(x as f32),
        (Conversion::I2B, Int(x)) => Int(i32::from(x as i8)),
        (Conversion::I2C, Int(x)) => Int(i32::from(x as u16)),
        (Conversion::I2S, Int(x)) => Int(i32::from(x as i16)),
        _ => return None,
    })
}

/// Saturating float-to-int with NaN mapping to zero.
fn f2i<T: Into<i64>>(x: f64, min: T, max: T) -> i64 {
    if x.is_nan() {
        0
    } else {
        let min = min.into();
        let max = max.into();
        if x <= min as f64 {
            min
        } else if x >= max as f64 {
            max
        } else {
            x as i64
        }
    }
}

fn fold_compare(op: CmpVariant, a: ConstValue, b: ConstValue) -> Option<ConstValue> {
    use ConstValue::*;
    let result = match (op, a, b) {
        (CmpVariant::Lcmp, Long(x), Long(y)) => x.cmp(&y) as i32,
        (CmpVariant::Fcmpl, Float(x), Float(y)) | (CmpVariant::Fcmpg, Float(x), Float(y)) => {
            match x.partial_cmp(&y) {
                Some(ord) => ord as i32,
                None => {
                    if op == CmpVariant::Fcmpl {
                        -1
                    } else {
                        1
                    }
                }
            }
        }
        (CmpVariant::Dcmpl, Double(x), Double(y)) | (CmpVariant::Dcmpg, Double(x), Double(y)) => {
            match x.partial_cmp(&y) {
                Some(ord) => ord as i32,
                None => {
                    if op == CmpVariant::Dcmpl {
                        -1
                    } else {
                        1
                    }
                }
            }
        }
        _ => return None,
    };
    Some(Int(result))
}

fn eval_cond(cond: Cond, a: ConstValue, b: ConstValue) -> Option<bool> {
    use ConstValue::*;
    let (x, y) = match (a, b) {
        (Int(x), Int(y)) => (i64::from(x), i64::from(y)),
        (Long(x), Long(y)) => (x, y),
        (Null, Null) => (0, 0),
        _ => return None,
    };
    Some(match cond {
        Cond::Eq => x == y,
        Cond::Ne => x != y,
        Cond::Lt => x < y,
        Cond::Le => x <= y,
        Cond::Gt => x > y,
        Cond::Ge => x >= y,
        Cond::Below => (x as u64) < (y as u64),
        Cond::AboveEqual => (x as u64) >= (y as u64),
    })
}

fn vn_key(op: &InstrOp, kind: Kind) -> Option<VnKey> {
    Some(match op {
        InstrOp::Constant(v) => VnKey::Const(*v),
        InstrOp::ArithmeticOp { op, x, y } if !op.can_trap(kind) => {
            VnKey::Arith(*op, kind, *x, *y)
        }
        InstrOp::ShiftOp { op, x, y } => VnKey::Shift(*op, kind, *x, *y),
        InstrOp::LogicOp { op, x, y } => VnKey::Logic(*op, kind, *x, *y),
        InstrOp::Negate { x } => VnKey::Negate(kind, *x),
        InstrOp::Convert { op, x } => VnKey::Convert(*op, *x),
        InstrOp::Compare { op, x, y } => VnKey::Compare(*op, *x, *y),
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{
        ClassInfo, ExceptionHandler, HostRuntime, Method, MethodCode, MethodFlags, TablePool,
    };
    use opal_core::Signature;

    fn method_with(
        descriptor: &str,
        flags: MethodFlags,
        code: Vec<u8>,
        max_stack: u16,
        max_locals: u16,
        pool: TablePool,
        handlers: Vec<ExceptionHandler>,
    ) -> MethodRef {
        let signature = Signature::parse(descriptor).unwrap();
        Arc::new(
            Method::new("test/Target", "m", signature, flags).with_code(MethodCode {
                bytecode: code,
                max_stack,
                max_locals,
                handlers,
                pool: Arc::new(pool),
            }),
        )
    }

    fn build(method: &MethodRef) -> Hir {
        let options = Options::default();
        let hir = build_graph(method, &HostRuntime, &options, None).unwrap();
        hir.verify();
        hir
    }

    fn count_ops(hir: &Hir, pred: impl Fn(&InstrOp) -> bool) -> usize {
        let mut n = 0;
        for b in hir.reverse_postorder() {
            for id in hir.block_instrs(b) {
                if pred(&hir.instr(id).op) {
                    n += 1;
                }
            }
        }
        n
    }

    #[test]
    fn test_empty_void_method() {
        let m = method_with("()V", MethodFlags::STATIC, vec![RETURN], 0, 0, TablePool::new(), vec![]);
        let hir = build(&m);
        assert_eq!(count_ops(&hir, |op| matches!(op, InstrOp::Return { value: None })), 1);
        assert_eq!(count_ops(&hir, |op| matches!(op, InstrOp::Base { .. })), 1);
    }

    #[test]
    fn test_static_add() {
        let m = method_with(
            "(II)I",
            MethodFlags::STATIC,
            vec![ILOAD_0, ILOAD_1, IADD, IRETURN],
            2,
            2,
            TablePool::new(),
            vec![],
        );
        let hir = build(&m);
        assert_eq!(
            count_ops(&hir, |op| matches!(
                op,
                InstrOp::ArithmeticOp { op: ArithOp::Add, .. }
            )),
            1
        );
        assert_eq!(count_ops(&hir, |op| matches!(op, InstrOp::Local { .. })), 2);
        assert_eq!(
            count_ops(&hir, |op| matches!(op, InstrOp::Return { value: Some(_) })),
            1
        );
    }

    #[test]
    fn test_loop_builds_header_phis() {
        // int sum(int n) { int s = 0; for (int i = 0; i < n; i++) s += i; return s; }
        let code = vec![
            ICONST_0, // 0
            ISTORE_1, // 1
            ICONST_0, // 2
            ISTORE_2, // 3
            ILOAD_2,  // 4  <- loop header
            ILOAD_0,  // 5
            IF_ICMPGE, 0, 13, // 6 -> 19
            ILOAD_1,  // 9
            ILOAD_2,  // 10
            IADD,     // 11
            ISTORE_1, // 12
            IINC, 2, 1, // 13
            GOTO, 0xff, (-12i8) as u8, // 16 -> 4
            ILOAD_1,  // 19
            IRETURN,  // 20
        ];
        let m = method_with("(I)I", MethodFlags::STATIC, code, 2, 3, TablePool::new(), vec![]);
        let hir = build(&m);

        // Find the loop header block at bci 4.
        let header = hir
            .block_ids()
            .find(|&b| hir.block(b).bci == 4 && hir.block(b).is_loop_header())
            .expect("loop header exists");
        assert_eq!(hir.block(header).pred_count(), 2);

        let sid = hir.block(header).state_before.unwrap();
        let state = hir.state(sid);
        let mut phis = 0;
        state.for_each_value(|v| {
            if let InstrOp::Phi { block, inputs, .. } = &hir.instr(v).op {
                if *block == header {
                    assert_eq!(inputs.len(), 2);
                    phis += 1;
                }
            }
        });
        // s and i both get phis; n is never stored in the loop.
        assert_eq!(phis, 2);
        // A loop safepoint sits on the back edge.
        assert!(count_ops(&hir, |op| matches!(op, InstrOp::Safepoint)) >= 1);
    }

    #[test]
    fn test_constant_branch_folds_to_goto() {
        // if (1 < 2) return 1; else return 0; -- folds, leaving one return.
        let code = vec![
            ICONST_1, ICONST_2, IF_ICMPGE, 0, 5, ICONST_1, IRETURN, ICONST_0, IRETURN,
        ];
        let m = method_with("()I", MethodFlags::STATIC, code, 2, 0, TablePool::new(), vec![]);
        let hir = build(&m);
        assert_eq!(count_ops(&hir, |op| matches!(op, InstrOp::If { .. })), 0);
        assert_eq!(
            count_ops(&hir, |op| matches!(op, InstrOp::Return { value: Some(_) })),
            1
        );
    }

    #[test]
    fn test_exception_handler_block() {
        let callee = Arc::new(Method::new(
            "test/Other",
            "m",
            Signature::parse("()V").unwrap(),
            MethodFlags::STATIC,
        ));
        let ae = Arc::new(ClassInfo {
            name: "java/lang/ArithmeticException".to_string(),
            id: 77,
            elem_kind: None,
        });
        let mut pool = TablePool::new();
        pool.set_method(1, callee);
        // 0: invokestatic #1; 3: iconst_0; 4: ireturn; 5: (handler) pop; 6: iconst_m1; 7: ireturn
        let code = vec![INVOKESTATIC, 0, 1, ICONST_0, IRETURN, POP, ICONST_M1, IRETURN];
        let handlers = vec![ExceptionHandler {
            start_bci: 0,
            end_bci: 3,
            handler_bci: 5,
            catch_type: Some(ae.clone()),
        }];
        let m = method_with("()I", MethodFlags::STATIC, code, 1, 0, pool, handlers);
        let hir = build(&m);

        let handler = hir
            .block_ids()
            .find(|&b| hir.block(b).bci == 5)
            .expect("handler block");
        assert!(hir.block(handler).is_exception_entry());
        let first = hir.block(handler).first.unwrap();
        assert!(matches!(hir.instr(first).op, InstrOp::ExceptionObject));

        // The invoke carries the handler edge with the catch type.
        let mut checked = false;
        for b in hir.reverse_postorder() {
            for id in hir.block_instrs(b) {
                if let InstrOp::Invoke { .. } = hir.instr(id).op {
                    let edges = &hir.instr(id).handlers;
                    assert_eq!(edges.len(), 1);
                    assert_eq!(edges[0].block, handler);
                    assert_eq!(edges[0].catch_type.as_ref().unwrap().id, 77);
                    checked = true;
                }
            }
        }
        assert!(checked, "invoke found");
    }

    #[test]
    fn test_synchronized_method_wraps_monitor() {
        let m = method_with(
            "()V",
            MethodFlags::STATIC.union(MethodFlags::SYNCHRONIZED),
            vec![RETURN],
            0,
            0,
            TablePool::new(),
            vec![],
        );
        let hir = build(&m);
        // The unlock handler is reachable only through exception edges, so
        // count over every block, not just the normal flow.
        let count_all = |pred: &dyn Fn(&InstrOp) -> bool| {
            hir.block_ids()
                .flat_map(|b| hir.block_instrs(b).collect::<Vec<_>>())
                .filter(|&id| pred(&hir.instr(id).op))
                .count()
        };
        assert_eq!(count_all(&|op| matches!(op, InstrOp::MonitorEnter { .. })), 1);
        // One unlock on the return path, one in the catch-all handler.
        assert_eq!(count_all(&|op| matches!(op, InstrOp::MonitorExit { .. })), 2);
        assert_eq!(count_all(&|op| matches!(op, InstrOp::Throw { .. })), 1);
    }

    #[test]
    fn test_inlining_replaces_call() {
        let callee_sig = Signature::parse("(II)I").unwrap();
        let callee = Arc::new(
            Method::new("test/Other", "add", callee_sig, MethodFlags::STATIC).with_code(
                MethodCode {
                    bytecode: vec![ILOAD_0, ILOAD_1, IADD, IRETURN],
                    max_stack: 2,
                    max_locals: 2,
                    handlers: vec![],
                    pool: Arc::new(TablePool::new()),
                },
            ),
        );
        let mut pool = TablePool::new();
        pool.set_method(1, callee);
        let code = vec![ILOAD_0, ILOAD_1, INVOKESTATIC, 0, 1, IRETURN];
        let m = method_with("(II)I", MethodFlags::STATIC, code, 2, 2, pool, vec![]);

        let mut options = Options::default();
        options.set("OptLevel", "2").unwrap();
        let hir = build_graph(&m, &HostRuntime, &options, None).unwrap();
        hir.verify();

        let mut invokes = 0;
        let mut adds = 0;
        for b in hir.reverse_postorder() {
            for id in hir.block_instrs(b) {
                match hir.instr(id).op {
                    InstrOp::Invoke { .. } => invokes += 1,
                    InstrOp::ArithmeticOp { op: ArithOp::Add, .. } => adds += 1,
                    _ => {}
                }
            }
        }
        assert_eq!(invokes, 0, "small straight-line callee is inlined");
        assert_eq!(adds, 1);
    }

    #[test]
    fn test_intrinsic_recognition() {
        let sqrt = Arc::new(Method::new(
            "java/lang/Math",
            "sqrt",
            Signature::parse("(D)D").unwrap(),
            MethodFlags::STATIC,
        ));
        let mut pool = TablePool::new();
        pool.set_method(1, sqrt);
        let code = vec![DLOAD_0, INVOKESTATIC, 0, 1, DRETURN];
        let m = method_with("(D)D", MethodFlags::STATIC, code, 2, 2, pool, vec![]);
        let hir = build(&m);
        assert_eq!(
            count_ops(&hir, |op| matches!(
                op,
                InstrOp::Intrinsic { id: IntrinsicId::MathSqrt, .. }
            )),
            1
        );
        assert_eq!(count_ops(&hir, |op| matches!(op, InstrOp::Invoke { .. })), 0);
    }

    #[test]
    fn test_unsupported_opcode_bails() {
        let m = method_with(
            "()V",
            MethodFlags::STATIC,
            vec![JSR, 0, 3, RETURN],
            1,
            0,
            TablePool::new(),
            vec![],
        );
        let err = build_graph(&m, &HostRuntime, &Options::default(), None).unwrap_err();
        assert!(matches!(err, Bailout::UnsupportedBytecode { .. }));
    }

    #[test]
    fn test_unresolved_field_bails() {
        let code = vec![ALOAD_0, GETFIELD, 0, 7, IRETURN];
        let m = method_with("()I", MethodFlags::default(), code, 1, 1, TablePool::new(), vec![]);
        let err = build_graph(&m, &HostRuntime, &Options::default(), None).unwrap_err();
        assert!(matches!(err, Bailout::UnresolvedReference { .. }));
    }

    #[test]
    fn test_no_safepoints_with_monitor_bails() {
        let code = vec![ALOAD_0, MONITORENTER, RETURN];
        let m = method_with(
            "()V",
            MethodFlags::NO_SAFEPOINTS,
            code,
            1,
            1,
            TablePool::new(),
            vec![],
        );
        let err = build_graph(&m, &HostRuntime, &Options::default(), None).unwrap_err();
        assert!(matches!(err, Bailout::InvariantViolation { .. }));
    }

    #[test]
    fn test_osr_entry_materializes_locals() {
        // Same loop as test_loop_builds_header_phis, compiled at osr bci 4.
        let code = vec![
            ICONST_0, ISTORE_1, ICONST_0, ISTORE_2, ILOAD_2, ILOAD_0, IF_ICMPGE, 0, 13,
            ILOAD_1, ILOAD_2, IADD, ISTORE_1, IINC, 2, 1, GOTO, 0xff, (-12i8) as u8,
            ILOAD_1, IRETURN,
        ];
        let m = method_with("(I)I", MethodFlags::STATIC, code, 2, 3, TablePool::new(), vec![]);
        let hir = build_graph(&m, &HostRuntime, &Options::default(), Some(4)).unwrap();
        hir.verify();
        let osr = hir.osr_entry.expect("osr entry block");
        assert!(hir.block(osr).flags.contains(BlockFlags::OSR_ENTRY));
        let mut loads = 0;
        for id in hir.block_instrs(osr) {
            if matches!(hir.instr(id).op, InstrOp::LoadPointer { .. }) {
                loads += 1;
            }
        }
        // n, s and i all live into the loop header.
        assert_eq!(loads, 3);
    }

    #[test]
    fn test_lookup_switch_graph() {
        // switch(x) { case 0, 1 -> A; case 5 -> B; default -> C }
        // Layout: 0: iload_0; 1: lookupswitch (payload at 4);
        // 36: A; 38: B; 40: C.
        let mut code = vec![ILOAD_0, LOOKUPSWITCH, 0, 0];
        code.extend_from_slice(&39i32.to_be_bytes()); // default -> bci 40
        code.extend_from_slice(&3i32.to_be_bytes()); // npairs
        for (key, offset) in [(0i32, 35i32), (1, 35), (5, 37)] {
            code.extend_from_slice(&key.to_be_bytes());
            code.extend_from_slice(&offset.to_be_bytes());
        }
        code.extend_from_slice(&[ICONST_1, IRETURN, ICONST_2, IRETURN, ICONST_0, IRETURN]);
        assert_eq!(code.len(), 42);

        let m = method_with("(I)I", MethodFlags::STATIC, code, 1, 1, TablePool::new(), vec![]);
        let hir = build(&m);

        let mut found = false;
        for b in hir.reverse_postorder() {
            for id in hir.block_instrs(b) {
                if let InstrOp::LookupSwitch { keys, suxs, .. } = &hir.instr(id).op {
                    assert_eq!(keys, &vec![0, 1, 5]);
                    assert_eq!(suxs.len(), 3);
                    found = true;
                }
            }
        }
        assert!(found, "lookupswitch node built");

        // Both edges for keys 0 and 1 reach the same block.
        let a = hir
            .block_ids()
            .find(|&b| hir.block(b).bci == 36 && hir.block(b).last.is_some())
            .map(|b| hir.block(b).pred_count());
        // After critical-edge splitting the shared case block keeps one
        // predecessor entry per edge.
        assert_eq!(a, Some(2));
    }
}
