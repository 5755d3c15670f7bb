//! LIR to machine code.
//!
//! Walks the block order, appending x64 bytes and recording every side
//! table of the target method: direct/indirect/runtime/stub calls with
//! their frame reference maps, safepoints, data patches, the exception
//! table and stop positions. The method is laid out with the baseline
//! entry at offset 0 (an adapter shim or nop padding), the optimized entry
//! at offset 8 (frame setup), the body, and out-of-line stub and XIR
//! slow-path code at the end.

use rustc_hash::FxHashMap;
use std::sync::Arc;

use opal_core::{CompileResult, Kind};

use crate::backend::code_buffer::Label;
use crate::backend::x64::{Assembler, CondCode, Mem};
use crate::hir::{ArithOp, BlockId, CmpVariant, Cond, Conversion, LogicOp, ShiftOp};
use crate::lir::operand::{Address, Operand, Scale};
use crate::lir::{
    BranchTarget, DebugInfo, FrameRegion, Lir, LirOp, LocalLabel, StubId, XirInstance,
};
use crate::regalloc::AllocResult;
use crate::runtime::MethodRef;
use crate::target::registers::{Gpr, Reg, Xmm};
use crate::target::{MemoryBarriers, Target};
use crate::target_method::{
    DataPatchSite, DirectCallSite, GlobalStubCallSite, HandlerEntry, IndirectCallSite, MarkSite,
    RuntimeCallSite, SafepointSite, TargetMethod, TargetMethodParts, OPT_ENTRY_OFFSET,
};
use crate::value::ConstValue;
use crate::xir::{XirOp, XirTemplate};

/// Argument registers used when expanding template runtime calls.
const XIR_CALL_ARGS: [Gpr; 6] = [Gpr::Rdi, Gpr::Rsi, Gpr::Rdx, Gpr::Rcx, Gpr::R8, Gpr::R9];

/// Emit the LIR into a sealed target method.
pub fn emit(
    lir: &Lir,
    alloc: &AllocResult,
    method: &MethodRef,
    target: &Target,
    osr_entry: Option<BlockId>,
    baseline_prologue: Option<&[u8]>,
    code_limit: usize,
) -> CompileResult<TargetMethod> {
    let frame = FrameLayout::new(lir, alloc, target);
    let mut emitter = Emitter {
        target,
        frame,
        asm: Assembler::new(code_limit),
        block_labels: FxHashMap::default(),
        local_labels: FxHashMap::default(),
        object_spill_slots: alloc.object_spill_slots.clone(),
        direct_calls: Vec::new(),
        indirect_calls: Vec::new(),
        runtime_calls: Vec::new(),
        global_stub_calls: Vec::new(),
        safepoints: Vec::new(),
        data_patches: Vec::new(),
        handlers_raw: Vec::new(),
        stop_positions: Vec::new(),
        marks: Vec::new(),
        stub_requests: Vec::new(),
        slow_paths: Vec::new(),
        reference_literals: Vec::new(),
    };
    emitter.emit_entries(baseline_prologue);
    for b in &lir.order {
        let label = emitter.block_label(*b);
        emitter.asm.buf().bind(label);
        emitter.local_labels.clear();
        let list = lir.list_for(*b).expect("every ordered block was lowered");
        let next = lir
            .order
            .iter()
            .skip_while(|x| *x != b)
            .nth(1)
            .copied();
        for (i, op) in list.ops.iter().enumerate() {
            let is_last = i + 1 == list.ops.len();
            emitter.emit_op(op, next.filter(|_| is_last));
        }
    }
    emitter.emit_out_of_line();

    let osr_entry_offset = osr_entry.and_then(|b| {
        let label = emitter.block_label(b);
        emitter.asm.buf().label_offset(label)
    });

    let Emitter {
        asm,
        frame,
        direct_calls,
        indirect_calls,
        runtime_calls,
        global_stub_calls,
        safepoints,
        data_patches,
        handlers_raw,
        stop_positions,
        marks,
        reference_literals,
        block_labels,
        ..
    } = emitter;

    let buffer = asm.into_buffer();
    let mut exception_handlers = Vec::with_capacity(handlers_raw.len());
    for (try_pos, handler_block, catch_type) in handlers_raw {
        let label = block_labels
            .get(&handler_block)
            .copied()
            .expect("handler block was emitted");
        let catch_pos = buffer
            .label_offset(label)
            .expect("handler label bound during emission");
        exception_handlers.push(HandlerEntry {
            try_pos,
            catch_pos,
            catch_type,
        });
    }
    let code = buffer.finish()?;

    Ok(TargetMethod::seal(TargetMethodParts {
        method: method.clone(),
        code,
        frame_size: frame.frame_size,
        osr_entry_offset,
        direct_calls,
        indirect_calls,
        runtime_calls,
        global_stub_calls,
        safepoints,
        data_patches,
        exception_handlers,
        stop_positions,
        register_ref_map: vec![0, 0],
        encoded_inline_data: Vec::new(),
        reference_literals,
        marks,
        cache_line_size: target.cache_line_size,
    }))
}

/// Resolved frame geometry.
#[derive(Debug, Clone, Copy)]
struct FrameLayout {
    spill_slots: u32,
    monitor_count: u32,
    stack_alloc_bytes: u32,
    frame_size: u32,
}

impl FrameLayout {
    fn new(lir: &Lir, alloc: &AllocResult, target: &Target) -> FrameLayout {
        let raw = alloc.spill_slots * 8
            + lir.monitor_count * 8
            + lir.stack_alloc_bytes
            + lir.outgoing_bytes;
        let align = target.stack_alignment;
        let frame_size = (raw + align - 1) & !(align - 1);
        FrameLayout {
            spill_slots: alloc.spill_slots,
            monitor_count: lir.monitor_count,
            stack_alloc_bytes: lir.stack_alloc_bytes,
            frame_size,
        }
    }

    /// rbp-relative displacement of a spill slot.
    fn spill_disp(&self, slot: i32) -> i32 {
        -8 * (slot + 1)
    }

    /// rbp-relative displacement of an incoming stack argument slot.
    fn caller_disp(&self, slot: i32) -> i32 {
        16 + 8 * slot
    }

    fn monitor_disp(&self, index: u32) -> i32 {
        -((self.spill_slots * 8 + (index + 1) * 8) as i32)
    }

    fn stack_block_disp(&self, offset: i32) -> i32 {
        -((self.spill_slots * 8 + self.monitor_count * 8 + self.stack_alloc_bytes) as i32) + offset
    }
}

struct Emitter<'a> {
    target: &'a Target,
    frame: FrameLayout,
    asm: Assembler,
    block_labels: FxHashMap<BlockId, Label>,
    local_labels: FxHashMap<LocalLabel, Label>,
    object_spill_slots: Vec<i32>,
    direct_calls: Vec<DirectCallSite>,
    indirect_calls: Vec<IndirectCallSite>,
    runtime_calls: Vec<RuntimeCallSite>,
    global_stub_calls: Vec<GlobalStubCallSite>,
    safepoints: Vec<SafepointSite>,
    data_patches: Vec<DataPatchSite>,
    handlers_raw: Vec<(u32, BlockId, Option<crate::runtime::ClassRef>)>,
    stop_positions: Vec<u32>,
    marks: Vec<MarkSite>,
    stub_requests: Vec<StubRequest>,
    slow_paths: Vec<SlowPath>,
    reference_literals: Vec<ConstValue>,
}

struct StubRequest {
    label: Label,
    stub: StubId,
    info: DebugInfo,
}

struct SlowPath {
    template: Arc<XirTemplate>,
    operands: Vec<Operand>,
    labels: Vec<Label>,
    info: Option<DebugInfo>,
}

impl Emitter<'_> {
    // -------------------------------------------------------------------------
    // Layout
    // -------------------------------------------------------------------------

    fn emit_entries(&mut self, baseline_prologue: Option<&[u8]>) {
        if let Some(bytes) = baseline_prologue {
            assert!(
                bytes.len() as u32 <= OPT_ENTRY_OFFSET,
                "baseline prologue of {} bytes overruns the optimized entry",
                bytes.len()
            );
            self.asm.buf().emit_slice(bytes);
        }
        while self.asm.position() < OPT_ENTRY_OFFSET {
            self.asm.nop();
        }
        assert_eq!(self.asm.position(), OPT_ENTRY_OFFSET);

        // Optimized-convention frame setup.
        self.asm.push(Gpr::Rbp);
        self.asm.mov_rr(true, Gpr::Rbp, Gpr::Rsp);
        if self.frame.frame_size > 0 {
            self.asm.sub_ri(true, Gpr::Rsp, self.frame.frame_size as i32);
        }
        // Null out reference spill slots so the conservative stack maps
        // never report stale bits.
        for &slot in &self.object_spill_slots.clone() {
            let mem = Mem::base(Gpr::Rbp, self.frame.spill_disp(slot));
            self.asm.mov_mi(true, &mem, 0);
        }
    }

    fn emit_out_of_line(&mut self) {
        let requests = std::mem::take(&mut self.stub_requests);
        for request in requests {
            self.asm.buf().bind(request.label);
            let pos = self.asm.position();
            let map = self.stack_map(&[]);
            self.global_stub_calls.push(GlobalStubCallSite {
                pos,
                stub: request.stub,
                reg_map: vec![0, 0],
                stack_map: map,
            });
            self.record_info(pos, Some(&request.info));
            self.asm.call_patchable();
            self.asm.int3();
        }
        let slow_paths = std::mem::take(&mut self.slow_paths);
        for slow in slow_paths {
            let ops = slow.template.slow_path.clone();
            for op in &ops {
                self.emit_xir_op(op, &slow.template, &slow.operands, &slow.labels, &slow.info);
            }
        }
    }

    fn block_label(&mut self, block: BlockId) -> Label {
        if let Some(&label) = self.block_labels.get(&block) {
            return label;
        }
        let label = self.asm.buf().create_label();
        self.block_labels.insert(block, label);
        label
    }

    fn local_label(&mut self, local: LocalLabel) -> Label {
        if let Some(&label) = self.local_labels.get(&local) {
            return label;
        }
        let label = self.asm.buf().create_label();
        self.local_labels.insert(local, label);
        label
    }

    fn branch_label(&mut self, target: &BranchTarget) -> Label {
        match target {
            BranchTarget::Block(b) => self.block_label(*b),
            BranchTarget::Local(l) => self.local_label(*l),
        }
    }

    // -------------------------------------------------------------------------
    // Side tables
    // -------------------------------------------------------------------------

    /// Frame reference map: one bit per frame word counted from rsp. The
    /// zapped object spill slots are always marked; `pointer_slots` adds
    /// the outgoing argument words holding references at a call.
    fn stack_map(&self, pointer_slots: &[i32]) -> Vec<u8> {
        let words = (self.frame.frame_size / 8) as usize;
        let mut map = vec![0u8; words.div_ceil(8)];
        let mut set = |index: i64| {
            if index >= 0 && (index as usize) < words {
                map[index as usize / 8] |= 1 << (index as usize % 8);
            }
        };
        for &slot in &self.object_spill_slots {
            let index = self.frame.frame_size as i64 / 8 - i64::from(slot) - 1;
            set(index);
        }
        for &slot in pointer_slots {
            set(i64::from(slot));
        }
        map
    }

    fn record_info(&mut self, pos: u32, info: Option<&DebugInfo>) {
        self.stop_positions.push(pos);
        if let Some(info) = info {
            for edge in &info.handlers {
                self.handlers_raw
                    .push((pos, edge.block, edge.catch_type.clone()));
            }
        }
    }

    fn request_stub(&mut self, stub: StubId, info: DebugInfo) -> Label {
        let label = self.asm.buf().create_label();
        self.stub_requests.push(StubRequest { label, stub, info });
        label
    }

    // -------------------------------------------------------------------------
    // Operand helpers
    // -------------------------------------------------------------------------

    fn stack_mem(&self, slot: i32, caller_frame: bool) -> Mem {
        if caller_frame {
            Mem::base(Gpr::Rbp, self.frame.caller_disp(slot))
        } else {
            Mem::base(Gpr::Rbp, self.frame.spill_disp(slot))
        }
    }

    fn operand_mem(&self, op: &Operand) -> Mem {
        match op {
            Operand::Stack {
                slot, caller_frame, ..
            } => self.stack_mem(*slot, *caller_frame),
            other => panic!("operand {other} is not a stack slot"),
        }
    }

    fn gpr(op: &Operand) -> Option<Gpr> {
        match op {
            Operand::Reg {
                reg: Reg::Gpr(g), ..
            } => Some(*g),
            _ => None,
        }
    }

    fn xmm(op: &Operand) -> Option<Xmm> {
        match op {
            Operand::Reg {
                reg: Reg::Xmm(x), ..
            } => Some(*x),
            _ => None,
        }
    }

    fn is_w(kind: Kind) -> bool {
        !matches!(kind, Kind::Int | Kind::Boolean | Kind::Byte | Kind::Short | Kind::Char)
    }

    /// Load an integer-class operand into a register, using the scratch
    /// register for stack slots and constants.
    fn load_gpr(&mut self, op: &Operand, scratch: Gpr) -> Gpr {
        match op {
            Operand::Reg {
                reg: Reg::Gpr(g), ..
            } => *g,
            Operand::Stack { kind, .. } => {
                let mem = self.operand_mem(op);
                self.asm.mov_rm(Self::is_w(*kind), scratch, &mem);
                scratch
            }
            Operand::Const(c) => {
                self.load_const_gpr(*c, scratch);
                scratch
            }
            other => panic!("cannot load {other} into a gpr"),
        }
    }

    /// Materialize a constant into a register, recording object constants
    /// as data patches.
    fn load_const_gpr(&mut self, c: ConstValue, dst: Gpr) {
        if let ConstValue::Object(_) = c {
            let at = self.asm.mov_ri64_patchable(dst, c.bits());
            self.data_patches.push(DataPatchSite { pos: at, constant: c });
            if !self.reference_literals.contains(&c) {
                self.reference_literals.push(c);
            }
        } else {
            self.asm.mov_ri(dst, c.bits() as i64);
        }
    }

    /// Load a float-class operand into an XMM register, using the scratch
    /// XMM for stack slots and constants.
    fn load_xmm(&mut self, op: &Operand, scratch: Xmm) -> Xmm {
        match op {
            Operand::Reg {
                reg: Reg::Xmm(x), ..
            } => *x,
            Operand::Stack { kind, .. } => {
                let mem = self.operand_mem(op);
                self.asm.movs_rm(*kind == Kind::Double, scratch, &mem);
                scratch
            }
            Operand::Const(c) => {
                self.asm.mov_ri(self.target.scratch_gpr, c.bits() as i64);
                self.asm.movq_xr(scratch, self.target.scratch_gpr);
                scratch
            }
            other => panic!("cannot load {other} into an xmm register"),
        }
    }

    /// Resolve an address expression into a memory operand, combining
    /// spilled components through the scratch register.
    fn mem_for_address(&mut self, addr: &Address) -> Mem {
        let scratch = self.target.scratch_gpr;
        let base_gpr = Self::gpr(&addr.base);
        match (&addr.index, base_gpr) {
            (None, Some(base)) => Mem::base(base, addr.disp),
            (None, None) => {
                let base = self.load_gpr(&addr.base, scratch);
                Mem::base(base, addr.disp)
            }
            (Some(index), Some(base)) => {
                if let Some(idx) = Self::gpr(index) {
                    Mem::indexed(base, idx, addr.scale.shift(), addr.disp)
                } else {
                    // Index in memory or immediate: fold into the scratch.
                    let idx = self.load_gpr(index, scratch);
                    debug_assert_eq!(idx, scratch);
                    if addr.scale.shift() > 0 {
                        self.asm.shl_imm(true, scratch, addr.scale.shift());
                    }
                    self.asm.add_rr(true, scratch, base);
                    Mem::base(scratch, addr.disp)
                }
            }
            (Some(index), None) => {
                // Both in memory: index into scratch first, then fold the
                // base in from its slot.
                let idx = self.load_gpr(index, scratch);
                debug_assert_eq!(idx, scratch);
                if addr.scale.shift() > 0 {
                    self.asm.shl_imm(true, scratch, addr.scale.shift());
                }
                match &*addr.base {
                    Operand::Stack { .. } => {
                        let mem = self.operand_mem(&addr.base);
                        self.asm.add_rm(true, scratch, &mem);
                    }
                    Operand::Const(c) => {
                        // Rare: constant base (card table); add as imm.
                        let bits = c.bits() as i64;
                        if let Ok(imm) = i32::try_from(bits) {
                            self.asm.add_ri(true, scratch, imm);
                        } else {
                            // Fold via push to keep the single scratch.
                            self.asm.push(Gpr::Rax);
                            self.asm.mov_ri(Gpr::Rax, bits);
                            self.asm.add_rr(true, scratch, Gpr::Rax);
                            self.asm.pop(Gpr::Rax);
                        }
                    }
                    other => panic!("unsupported address base {other}"),
                }
                Mem::base(scratch, addr.disp)
            }
        }
    }

    /// The universal move. `kind` decides the width and register class.
    fn move_any(&mut self, src: &Operand, dst: &Operand, kind: Kind) {
        if src == dst {
            return;
        }
        if kind.is_float() {
            let double = kind == Kind::Double;
            match (Self::xmm(src), Self::xmm(dst)) {
                (Some(s), Some(d)) => self.asm.movs_rr(double, d, s),
                (Some(s), None) => {
                    let mem = self.operand_mem(dst);
                    self.asm.movs_mr(double, &mem, s);
                }
                (None, Some(d)) => match src {
                    Operand::Stack { .. } => {
                        let mem = self.operand_mem(src);
                        self.asm.movs_rm(double, d, &mem);
                    }
                    Operand::Const(c) => {
                        self.asm.mov_ri(self.target.scratch_gpr, c.bits() as i64);
                        self.asm.movq_xr(d, self.target.scratch_gpr);
                    }
                    Operand::Reg {
                        reg: Reg::Gpr(g), ..
                    } => self.asm.movq_xr(d, *g),
                    other => panic!("bad float move source {other}"),
                },
                (None, None) => {
                    // Memory to memory through the gpr scratch (raw bits).
                    let scratch = self.target.scratch_gpr;
                    match src {
                        Operand::Stack { .. } => {
                            let mem = self.operand_mem(src);
                            self.asm.mov_rm(double, scratch, &mem);
                        }
                        Operand::Const(c) => self.asm.mov_ri(scratch, c.bits() as i64),
                        other => panic!("bad float move source {other}"),
                    }
                    let mem = self.operand_mem(dst);
                    self.asm.mov_mr(double, &mem, scratch);
                }
            }
            return;
        }

        let w = Self::is_w(kind);
        match (src, dst) {
            (_, Operand::Reg { reg: Reg::Gpr(d), .. }) => match src {
                Operand::Reg { reg: Reg::Gpr(s), .. } => self.asm.mov_rr(w, *d, *s),
                Operand::Reg { reg: Reg::Xmm(s), .. } => self.asm.movq_rx(*d, *s),
                Operand::Stack { .. } => {
                    let mem = self.operand_mem(src);
                    self.asm.mov_rm(w, *d, &mem);
                }
                Operand::Const(c) => self.load_const_gpr(*c, *d),
                other => panic!("bad move source {other}"),
            },
            (_, Operand::Stack { .. }) => {
                let mem = self.operand_mem(dst);
                match src {
                    Operand::Reg { reg: Reg::Gpr(s), .. } => self.asm.mov_mr(w, &mem, *s),
                    Operand::Reg { reg: Reg::Xmm(s), .. } => {
                        self.asm.movs_mr(true, &mem, *s);
                    }
                    Operand::Stack { .. } => {
                        let scratch = self.target.scratch_gpr;
                        let smem = self.operand_mem(src);
                        self.asm.mov_rm(w, scratch, &smem);
                        self.asm.mov_mr(w, &mem, scratch);
                    }
                    Operand::Const(c) => {
                        if c.is_object() && !c.is_null() {
                            self.load_const_gpr(*c, self.target.scratch_gpr);
                            self.asm.mov_mr(true, &mem, self.target.scratch_gpr);
                        } else if c.fits_imm32() {
                            self.asm.mov_mi(w, &mem, c.bits() as i32);
                        } else {
                            self.asm.mov_ri(self.target.scratch_gpr, c.bits() as i64);
                            self.asm.mov_mr(true, &mem, self.target.scratch_gpr);
                        }
                    }
                    other => panic!("bad move source {other}"),
                }
            }
            (_, Operand::Reg { reg: Reg::Xmm(d), .. }) => {
                // Raw-bits move into a float register.
                match src {
                    Operand::Reg { reg: Reg::Gpr(s), .. } => self.asm.movq_xr(*d, *s),
                    _ => {
                        let s = self.load_gpr(src, self.target.scratch_gpr);
                        self.asm.movq_xr(*d, s);
                    }
                }
            }
            (_, other) => panic!("bad move destination {other}"),
        }
    }

    // -------------------------------------------------------------------------
    // Op dispatch
    // -------------------------------------------------------------------------

    fn emit_op(&mut self, op: &LirOp, fallthrough: Option<BlockId>) {
        match op {
            LirOp::Label(l) => {
                let label = self.local_label(*l);
                self.asm.buf().bind(label);
            }
            LirOp::Move { src, dst } => {
                let kind = if dst.kind() == Kind::Illegal {
                    src.kind()
                } else {
                    dst.kind()
                };
                self.move_any(src, dst, kind);
            }
            LirOp::Load { addr, dst, .. } => self.emit_load(addr, dst),
            LirOp::Store { src, addr, .. } => self.emit_store(src, addr),
            LirOp::Lea { addr, dst } => {
                let mem = self.mem_for_address(addr);
                match Self::gpr(dst) {
                    Some(d) => self.asm.lea(d, &mem),
                    None => {
                        let scratch = self.target.scratch_gpr;
                        self.asm.lea(scratch, &mem);
                        let dmem = self.operand_mem(dst);
                        self.asm.mov_mr(true, &dmem, scratch);
                    }
                }
            }
            LirOp::Arith {
                op,
                left,
                right,
                dst,
                ..
            } => self.emit_arith(*op, left, right, dst),
            LirOp::Shift {
                op, count, dst, ..
            } => self.emit_shift(*op, count, dst),
            LirOp::Logic {
                op, right, dst, ..
            } => self.emit_logic(*op, right, dst),
            LirOp::Neg { dst, .. } => self.emit_neg(dst),
            LirOp::Convert { op, src, dst } => self.emit_convert(*op, src, dst),
            LirOp::Cmp { left, right } => self.emit_cmp(left, right),
            LirOp::Cmp3 {
                variant,
                left,
                right,
                dst,
            } => self.emit_cmp3(*variant, left, right, dst),
            LirOp::Branch { cond, target } => {
                let label = self.branch_label(target);
                self.asm.jcc(CondCode::from_cond(*cond), label);
            }
            LirOp::Jump { target } => {
                if let BranchTarget::Block(b) = target {
                    if Some(*b) == fallthrough {
                        return;
                    }
                }
                let label = self.branch_label(target);
                self.asm.jmp(label);
            }
            LirOp::BranchStub { cond, stub, info } => {
                let label = self.request_stub(*stub, info.clone());
                self.asm.jcc(CondCode::from_cond(*cond), label);
            }
            LirOp::Cmove {
                cond,
                tval,
                fval,
                dst,
            } => self.emit_cmove(*cond, tval, fval, dst),
            LirOp::CallDirect {
                target,
                result: _,
                info,
                pointer_slots,
                ..
            } => {
                let pos = self.asm.call_patchable();
                let stack_map = self.stack_map(pointer_slots);
                self.direct_calls.push(DirectCallSite {
                    pos,
                    callee: target.clone(),
                    stack_map,
                });
                self.record_info(pos, Some(info));
            }
            LirOp::CallIndirect {
                target,
                addr,
                info,
                pointer_slots,
                ..
            } => {
                let pos = self.asm.position();
                match Self::gpr(addr) {
                    Some(r) => self.asm.call_r(r),
                    None => {
                        let mem = self.operand_mem(addr);
                        self.asm.call_m(&mem);
                    }
                }
                let stack_map = self.stack_map(pointer_slots);
                self.indirect_calls.push(IndirectCallSite {
                    pos,
                    callee: target.clone(),
                    stack_map,
                });
                self.record_info(pos, Some(info));
            }
            LirOp::CallRuntime {
                call, info, ..
            } => {
                let pos = self.asm.call_patchable();
                let stack_map = self.stack_map(&[]);
                self.runtime_calls.push(RuntimeCallSite {
                    pos,
                    call: *call,
                    stack_map,
                });
                self.record_info(pos, info.as_ref());
            }
            LirOp::Xir(instance) => self.emit_xir(instance),
            LirOp::Membar { barriers } => self.emit_membar(*barriers),
            LirOp::SafepointPoll { info } => {
                let pos = self.asm.position();
                self.asm.test_eax_rip(0);
                let stack_map = self.stack_map(&[]);
                self.safepoints.push(SafepointSite {
                    pos,
                    reg_map: vec![0, 0],
                    stack_map,
                });
                self.record_info(pos, Some(info));
            }
            LirOp::InfoPoint { info } => {
                let pos = self.asm.position();
                self.record_info(pos, Some(info));
            }
            LirOp::NullCheck { value, info } => {
                match Self::gpr(value) {
                    Some(r) => self.asm.cmp_ri(true, r, 0),
                    None => {
                        let mem = self.operand_mem(value);
                        self.asm.cmp_mi(true, &mem, 0);
                    }
                }
                let label = self.request_stub(StubId::ThrowNullPointer, info.clone());
                self.asm.jcc(CondCode::E, label);
            }
            LirOp::Sqrt { src, dst } => {
                let s = self.load_xmm(src, self.target.scratch_xmm);
                match Self::xmm(dst) {
                    Some(d) => self.asm.sqrts(true, d, s),
                    None => {
                        let scratch = self.target.scratch_xmm;
                        self.asm.sqrts(true, scratch, s);
                        let mem = self.operand_mem(dst);
                        self.asm.movs_mr(true, &mem, scratch);
                    }
                }
            }
            LirOp::Abs { src, dst } => self.emit_abs(src, dst),
            LirOp::CompareAndSwap {
                addr,
                expected: _,
                new_value,
                result,
            } => self.emit_cas(addr, new_value, result),
            LirOp::CapturePc { dst } => {
                // lea r, [rip - 7] points back at the lea itself.
                match Self::gpr(dst) {
                    Some(d) => {
                        self.asm.lea_rip(d, -7);
                    }
                    None => {
                        let scratch = self.target.scratch_gpr;
                        self.asm.lea_rip(scratch, -7);
                        let mem = self.operand_mem(dst);
                        self.asm.mov_mr(true, &mem, scratch);
                    }
                }
            }
            LirOp::FrameAddr { region, dst } => {
                let disp = match region {
                    FrameRegion::StackBlock { offset } => self.frame.stack_block_disp(*offset),
                    FrameRegion::Monitor { index } => self.frame.monitor_disp(*index),
                };
                let mem = Mem::base(Gpr::Rbp, disp);
                match Self::gpr(dst) {
                    Some(d) => self.asm.lea(d, &mem),
                    None => {
                        let scratch = self.target.scratch_gpr;
                        self.asm.lea(scratch, &mem);
                        let dmem = self.operand_mem(dst);
                        self.asm.mov_mr(true, &dmem, scratch);
                    }
                }
            }
            LirOp::Return { .. } => {
                self.asm.leave();
                self.asm.ret();
            }
        }
    }

    // -------------------------------------------------------------------------
    // Memory access
    // -------------------------------------------------------------------------

    fn emit_load(&mut self, addr: &Address, dst: &Operand) {
        let mem = self.mem_for_address(addr);
        let kind = addr.kind;
        if kind.is_float() {
            let double = kind == Kind::Double;
            match Self::xmm(dst) {
                Some(d) => self.asm.movs_rm(double, d, &mem),
                None => {
                    let scratch = self.target.scratch_xmm;
                    self.asm.movs_rm(double, scratch, &mem);
                    let dmem = self.operand_mem(dst);
                    self.asm.movs_mr(double, &dmem, scratch);
                }
            }
            return;
        }
        let into = Self::gpr(dst).unwrap_or(self.target.scratch_gpr);
        match kind {
            Kind::Boolean => self.asm.movzx_rm8(into, &mem),
            Kind::Byte => self.asm.movsx_rm8(into, &mem),
            Kind::Char => self.asm.movzx_rm16(into, &mem),
            Kind::Short => self.asm.movsx_rm16(into, &mem),
            Kind::Int => self.asm.mov_rm(false, into, &mem),
            _ => self.asm.mov_rm(true, into, &mem),
        }
        if Self::gpr(dst).is_none() {
            let dmem = self.operand_mem(dst);
            self.asm.mov_mr(Self::is_w(kind), &dmem, into);
        }
    }

    fn emit_store(&mut self, src: &Operand, addr: &Address) {
        let kind = addr.kind;
        // Resolve the source into a register first when it lives in
        // memory, because address resolution may claim the scratch.
        let staged: Operand = match src {
            Operand::Stack { .. } if addr_needs_scratch(addr) => {
                // Address resolution needs the scratch: route the source
                // through a push/pop of RAX instead.
                let mem_src = self.operand_mem(src);
                self.asm.push(Gpr::Rax);
                self.asm.mov_rm(true, Gpr::Rax, &mem_src);
                let mem = self.mem_for_address(&adjust_rsp_address(addr, 8));
                self.store_gpr_kind(kind, &mem, Gpr::Rax);
                self.asm.pop(Gpr::Rax);
                return;
            }
            other => other.clone(),
        };
        let mem = self.mem_for_address(addr);
        if kind.is_float() {
            let double = kind == Kind::Double;
            match Self::xmm(&staged) {
                Some(s) => self.asm.movs_mr(double, &mem, s),
                None => match &staged {
                    Operand::Stack { .. } => {
                        let smem = self.operand_mem(&staged);
                        let scratch = self.target.scratch_xmm;
                        self.asm.movs_rm(double, scratch, &smem);
                        self.asm.movs_mr(double, &mem, scratch);
                    }
                    Operand::Const(c) => {
                        let scratch = self.target.scratch_xmm;
                        self.asm.push(Gpr::Rax);
                        self.asm.mov_ri(Gpr::Rax, c.bits() as i64);
                        self.asm.movq_xr(scratch, Gpr::Rax);
                        self.asm.pop(Gpr::Rax);
                        let mem = self.mem_for_address(addr);
                        self.asm.movs_mr(double, &mem, scratch);
                    }
                    other => panic!("bad store source {other}"),
                },
            }
            return;
        }
        match &staged {
            Operand::Reg { reg: Reg::Gpr(s), .. } => self.store_gpr_kind(kind, &mem, *s),
            Operand::Stack { .. } => {
                // Scratch is free here (checked above).
                let smem = self.operand_mem(&staged);
                let scratch = self.target.scratch_gpr;
                self.asm.mov_rm(true, scratch, &smem);
                self.store_gpr_kind(kind, &mem, scratch);
            }
            Operand::Const(c) => match kind {
                Kind::Boolean | Kind::Byte => self.asm.mov_mi8(&mem, c.bits() as u8),
                Kind::Short | Kind::Char | Kind::Int => {
                    self.asm.mov_mi(false, &mem, c.bits() as i32)
                }
                _ => {
                    if c.fits_imm32() && !c.is_object() {
                        self.asm.mov_mi(true, &mem, c.bits() as i32);
                    } else if addr_needs_scratch(addr) {
                        self.asm.push(Gpr::Rax);
                        self.load_const_gpr(*c, Gpr::Rax);
                        let mem = self.mem_for_address(&adjust_rsp_address(addr, 8));
                        self.asm.mov_mr(true, &mem, Gpr::Rax);
                        self.asm.pop(Gpr::Rax);
                    } else {
                        self.load_const_gpr(*c, self.target.scratch_gpr);
                        self.asm.mov_mr(true, &mem, self.target.scratch_gpr);
                    }
                }
            },
            other => panic!("bad store source {other}"),
        }
    }

    fn store_gpr_kind(&mut self, kind: Kind, mem: &Mem, src: Gpr) {
        match kind {
            Kind::Boolean | Kind::Byte => self.asm.mov_mr8(mem, src),
            Kind::Short | Kind::Char => self.asm.mov_mr16(mem, src),
            Kind::Int => self.asm.mov_mr(false, mem, src),
            _ => self.asm.mov_mr(true, mem, src),
        }
    }

    // -------------------------------------------------------------------------
    // ALU
    // -------------------------------------------------------------------------

    fn emit_arith(&mut self, op: ArithOp, left: &Operand, right: &Operand, dst: &Operand) {
        let kind = dst.kind();
        if kind.is_float() {
            self.emit_float_arith(op, right, dst);
            return;
        }
        let w = Self::is_w(kind);
        match op {
            ArithOp::Add | ArithOp::Sub => {
                let (rr, rm, mr, ri, mi): (
                    fn(&mut Assembler, bool, Gpr, Gpr),
                    fn(&mut Assembler, bool, Gpr, &Mem),
                    fn(&mut Assembler, bool, &Mem, Gpr),
                    fn(&mut Assembler, bool, Gpr, i32),
                    fn(&mut Assembler, bool, &Mem, i32),
                ) = if op == ArithOp::Add {
                    (
                        Assembler::add_rr,
                        Assembler::add_rm,
                        Assembler::add_mr,
                        Assembler::add_ri,
                        Assembler::add_mi,
                    )
                } else {
                    (
                        Assembler::sub_rr,
                        Assembler::sub_rm,
                        Assembler::sub_mr,
                        Assembler::sub_ri,
                        Assembler::sub_mi,
                    )
                };
                self.emit_two_op(w, right, dst, rr, rm, mr, ri, mi);
            }
            ArithOp::Mul => self.emit_mul(w, right, dst),
            ArithOp::Div | ArithOp::Rem => {
                // Dividend is pinned to RAX, the result register (RAX or
                // RDX) is encoded in the fixed bindings; here only the
                // divide sequence remains.
                self.asm.cqo(w);
                match right {
                    Operand::Reg { reg: Reg::Gpr(r), .. } => self.asm.idiv_r(w, *r),
                    Operand::Stack { .. } => {
                        let mem = self.operand_mem(right);
                        self.asm.idiv_m(w, &mem);
                    }
                    Operand::Const(c) => {
                        let scratch = self.target.scratch_gpr;
                        self.asm.mov_ri(scratch, c.bits() as i64);
                        self.asm.idiv_r(w, scratch);
                    }
                    other => panic!("bad divisor {other}"),
                }
                let _ = left;
            }
        }
    }

    /// Generic two-operand ALU dispatch over the operand shapes.
    #[allow(clippy::too_many_arguments)]
    fn emit_two_op(
        &mut self,
        w: bool,
        right: &Operand,
        dst: &Operand,
        rr: fn(&mut Assembler, bool, Gpr, Gpr),
        rm: fn(&mut Assembler, bool, Gpr, &Mem),
        mr: fn(&mut Assembler, bool, &Mem, Gpr),
        ri: fn(&mut Assembler, bool, Gpr, i32),
        mi: fn(&mut Assembler, bool, &Mem, i32),
    ) {
        match (Self::gpr(dst), right) {
            (Some(d), Operand::Reg { reg: Reg::Gpr(r), .. }) => rr(&mut self.asm, w, d, *r),
            (Some(d), Operand::Stack { .. }) => {
                let mem = self.operand_mem(right);
                rm(&mut self.asm, w, d, &mem);
            }
            (Some(d), Operand::Const(c)) => {
                if c.fits_imm32() {
                    ri(&mut self.asm, w, d, c.bits() as i32);
                } else {
                    let scratch = self.target.scratch_gpr;
                    self.asm.mov_ri(scratch, c.bits() as i64);
                    rr(&mut self.asm, w, d, scratch);
                }
            }
            (None, Operand::Reg { reg: Reg::Gpr(r), .. }) => {
                let mem = self.operand_mem(dst);
                mr(&mut self.asm, w, &mem, *r);
            }
            (None, Operand::Const(c)) if c.fits_imm32() => {
                let mem = self.operand_mem(dst);
                mi(&mut self.asm, w, &mem, c.bits() as i32);
            }
            (None, _) => {
                // Memory destination with a memory/large source: stage the
                // source in the scratch.
                let scratch = self.target.scratch_gpr;
                let s = self.load_gpr(right, scratch);
                let mem = self.operand_mem(dst);
                mr(&mut self.asm, w, &mem, s);
            }
            (_, other) => panic!("bad alu operand {other}"),
        }
    }

    fn emit_mul(&mut self, w: bool, right: &Operand, dst: &Operand) {
        match Self::gpr(dst) {
            Some(d) => match right {
                Operand::Reg { reg: Reg::Gpr(r), .. } => self.asm.imul_rr(w, d, *r),
                Operand::Stack { .. } => {
                    let mem = self.operand_mem(right);
                    self.asm.imul_rm(w, d, &mem);
                }
                Operand::Const(c) => {
                    let scratch = self.target.scratch_gpr;
                    self.asm.mov_ri(scratch, c.bits() as i64);
                    self.asm.imul_rr(w, d, scratch);
                }
                other => panic!("bad mul operand {other}"),
            },
            None => {
                let scratch = self.target.scratch_gpr;
                let dmem = self.operand_mem(dst);
                self.asm.mov_rm(w, scratch, &dmem);
                match right {
                    Operand::Reg { reg: Reg::Gpr(r), .. } => self.asm.imul_rr(w, scratch, *r),
                    Operand::Stack { .. } => {
                        let mem = self.operand_mem(right);
                        self.asm.imul_rm(w, scratch, &mem);
                    }
                    Operand::Const(c) => {
                        // Multiply-by-immediate form keeps the scratch free.
                        self.asm.imul_rri(w, scratch, scratch, c.bits() as i32);
                    }
                    other => panic!("bad mul operand {other}"),
                }
                self.asm.mov_mr(w, &dmem, scratch);
            }
        }
    }

    fn emit_float_arith(&mut self, op: ArithOp, right: &Operand, dst: &Operand) {
        let double = dst.kind() == Kind::Double;
        let (rr, rm): (
            fn(&mut Assembler, bool, Xmm, Xmm),
            fn(&mut Assembler, bool, Xmm, &Mem),
        ) = match op {
            ArithOp::Add => (Assembler::adds, Assembler::adds_rm),
            ArithOp::Sub => (Assembler::subs, Assembler::subs_rm),
            ArithOp::Mul => (Assembler::muls, Assembler::muls_rm),
            ArithOp::Div => (Assembler::divs, Assembler::divs_rm),
            ArithOp::Rem => unreachable!("float remainder lowers to a runtime call"),
        };
        match Self::xmm(dst) {
            Some(d) => match right {
                Operand::Reg { reg: Reg::Xmm(r), .. } => rr(&mut self.asm, double, d, *r),
                Operand::Stack { .. } => {
                    let mem = self.operand_mem(right);
                    rm(&mut self.asm, double, d, &mem);
                }
                Operand::Const(c) => {
                    let scratch = self.target.scratch_xmm;
                    self.asm.mov_ri(self.target.scratch_gpr, c.bits() as i64);
                    self.asm.movq_xr(scratch, self.target.scratch_gpr);
                    rr(&mut self.asm, double, d, scratch);
                }
                other => panic!("bad float operand {other}"),
            },
            None => {
                let scratch = self.target.scratch_xmm;
                let dmem = self.operand_mem(dst);
                self.asm.movs_rm(double, scratch, &dmem);
                match right {
                    Operand::Reg { reg: Reg::Xmm(r), .. } => rr(&mut self.asm, double, scratch, *r),
                    Operand::Stack { .. } => {
                        let mem = self.operand_mem(right);
                        rm(&mut self.asm, double, scratch, &mem);
                    }
                    Operand::Const(c) => {
                        self.asm.push(Gpr::Rax);
                        self.asm.mov_ri(Gpr::Rax, c.bits() as i64);
                        self.asm.push(Gpr::Rax);
                        rm(&mut self.asm, double, scratch, &Mem::base(Gpr::Rsp, 0));
                        self.asm.pop(Gpr::Rax);
                        self.asm.pop(Gpr::Rax);
                    }
                    other => panic!("bad float operand {other}"),
                }
                self.asm.movs_mr(double, &dmem, scratch);
            }
        }
    }

    fn emit_shift(&mut self, op: ShiftOp, count: &Operand, dst: &Operand) {
        let kind = dst.kind();
        let w = Self::is_w(kind);
        let by_cl: fn(&mut Assembler, bool, Gpr) = match op {
            ShiftOp::Shl => Assembler::shl_cl,
            ShiftOp::Shr => Assembler::sar_cl,
            ShiftOp::Ushr => Assembler::shr_cl,
        };
        let by_imm: fn(&mut Assembler, bool, Gpr, u8) = match op {
            ShiftOp::Shl => Assembler::shl_imm,
            ShiftOp::Shr => Assembler::sar_imm,
            ShiftOp::Ushr => Assembler::shr_imm,
        };
        let mask = if w { 63 } else { 31 };
        match Self::gpr(dst) {
            Some(d) => match count {
                Operand::Const(c) => by_imm(&mut self.asm, w, d, (c.bits() as u8) & mask),
                _ => by_cl(&mut self.asm, w, d),
            },
            None => {
                let scratch = self.target.scratch_gpr;
                let dmem = self.operand_mem(dst);
                self.asm.mov_rm(w, scratch, &dmem);
                match count {
                    Operand::Const(c) => by_imm(&mut self.asm, w, scratch, (c.bits() as u8) & mask),
                    _ => by_cl(&mut self.asm, w, scratch),
                }
                self.asm.mov_mr(w, &dmem, scratch);
            }
        }
    }

    fn emit_logic(&mut self, op: LogicOp, right: &Operand, dst: &Operand) {
        let w = Self::is_w(dst.kind());
        match op {
            LogicOp::And => self.emit_two_op(
                w,
                right,
                dst,
                Assembler::and_rr,
                Assembler::and_rm,
                Assembler::and_mr,
                Assembler::and_ri,
                Assembler::and_mi,
            ),
            LogicOp::Or => self.emit_two_op(
                w,
                right,
                dst,
                Assembler::or_rr,
                Assembler::or_rm,
                Assembler::or_mr,
                Assembler::or_ri,
                Assembler::or_mi,
            ),
            LogicOp::Xor => self.emit_two_op(
                w,
                right,
                dst,
                Assembler::xor_rr,
                Assembler::xor_rm,
                Assembler::xor_mr,
                Assembler::xor_ri,
                Assembler::xor_mi,
            ),
        }
    }

    fn emit_neg(&mut self, dst: &Operand) {
        let kind = dst.kind();
        if kind.is_float() {
            // Flip the sign bit through the integer side.
            match dst {
                Operand::Stack { .. } => {
                    let mem = self.operand_mem(dst);
                    if kind == Kind::Double {
                        self.asm.btc_mi(&mem, 63);
                    } else {
                        self.asm.xor_mi(false, &mem, i32::MIN);
                    }
                }
                _ => {
                    let x = Self::xmm(dst).expect("float negate operates on xmm or stack");
                    let scratch = self.target.scratch_gpr;
                    self.asm.movq_rx(scratch, x);
                    if kind == Kind::Double {
                        self.asm.btc_ri(scratch, 63);
                    } else {
                        self.asm.xor_ri(false, scratch, i32::MIN);
                    }
                    self.asm.movq_xr(x, scratch);
                }
            }
            return;
        }
        let w = Self::is_w(kind);
        match Self::gpr(dst) {
            Some(d) => self.asm.neg(w, d),
            None => {
                let scratch = self.target.scratch_gpr;
                let mem = self.operand_mem(dst);
                self.asm.mov_rm(w, scratch, &mem);
                self.asm.neg(w, scratch);
                self.asm.mov_mr(w, &mem, scratch);
            }
        }
    }

    fn emit_convert(&mut self, op: Conversion, src: &Operand, dst: &Operand) {
        let scratch_g = self.target.scratch_gpr;
        let scratch_x = self.target.scratch_xmm;
        let src_float = op.input_kind().is_float();
        let _dst_float = op.result_kind().is_float();

        // Stage the source.
        let sg = if src_float {
            Gpr::Rax // unused
        } else {
            self.load_gpr(src, scratch_g)
        };
        let sx = if src_float {
            self.load_xmm(src, scratch_x)
        } else {
            scratch_x // unused
        };

        // Convert into a scratch of the destination class.
        enum Out {
            G(Gpr),
            X(Xmm),
        }
        let out = match op {
            Conversion::I2L => {
                self.asm.movsxd(scratch_g, sg);
                Out::G(scratch_g)
            }
            Conversion::L2I => {
                self.asm.mov_rr(false, scratch_g, sg);
                Out::G(scratch_g)
            }
            Conversion::I2B => {
                self.asm.movsx_rr8(scratch_g, sg);
                Out::G(scratch_g)
            }
            Conversion::I2C => {
                self.asm.movzx_rr16(scratch_g, sg);
                Out::G(scratch_g)
            }
            Conversion::I2S => {
                self.asm.movsx_rr16(scratch_g, sg);
                Out::G(scratch_g)
            }
            Conversion::I2F => {
                self.asm.cvtsi2s(false, false, scratch_x, sg);
                Out::X(scratch_x)
            }
            Conversion::I2D => {
                self.asm.cvtsi2s(true, false, scratch_x, sg);
                Out::X(scratch_x)
            }
            Conversion::L2F => {
                self.asm.cvtsi2s(false, true, scratch_x, sg);
                Out::X(scratch_x)
            }
            Conversion::L2D => {
                self.asm.cvtsi2s(true, true, scratch_x, sg);
                Out::X(scratch_x)
            }
            Conversion::F2I => {
                self.asm.cvtts2si(false, false, scratch_g, sx);
                Out::G(scratch_g)
            }
            Conversion::F2L => {
                self.asm.cvtts2si(false, true, scratch_g, sx);
                Out::G(scratch_g)
            }
            Conversion::D2I => {
                self.asm.cvtts2si(true, false, scratch_g, sx);
                Out::G(scratch_g)
            }
            Conversion::D2L => {
                self.asm.cvtts2si(true, true, scratch_g, sx);
                Out::G(scratch_g)
            }
            Conversion::F2D => {
                self.asm.cvtss2sd(scratch_x, sx);
                Out::X(scratch_x)
            }
            Conversion::D2F => {
                self.asm.cvtsd2ss(scratch_x, sx);
                Out::X(scratch_x)
            }
        };

        // Deliver to the destination.
        match out {
            Out::G(g) => match Self::gpr(dst) {
                Some(d) => self.asm.mov_rr(Self::is_w(op.result_kind()), d, g),
                None => {
                    let mem = self.operand_mem(dst);
                    self.asm.mov_mr(Self::is_w(op.result_kind()), &mem, g);
                }
            },
            Out::X(x) => match Self::xmm(dst) {
                Some(d) => self.asm.movs_rr(op.result_kind() == Kind::Double, d, x),
                None => {
                    let mem = self.operand_mem(dst);
                    self.asm.movs_mr(op.result_kind() == Kind::Double, &mem, x);
                }
            },
        }
    }

    fn emit_cmp(&mut self, left: &Operand, right: &Operand) {
        let w = Self::is_w(left.kind());
        // A constant left operand (possible in template compares) stages
        // through the scratch register.
        let staged;
        let left = if matches!(left, Operand::Const(_)) {
            let reg = self.load_gpr(left, self.target.scratch_gpr);
            staged = Operand::Reg {
                reg: Reg::Gpr(reg),
                kind: left.kind(),
            };
            &staged
        } else {
            left
        };
        match (Self::gpr(left), right) {
            (Some(l), Operand::Reg { reg: Reg::Gpr(r), .. }) => self.asm.cmp_rr(w, l, *r),
            (Some(l), Operand::Stack { .. }) => {
                let mem = self.operand_mem(right);
                self.asm.cmp_rm(w, l, &mem);
            }
            (Some(l), Operand::Const(c)) if c.fits_imm32() => {
                self.asm.cmp_ri(w, l, c.bits() as i32);
            }
            (Some(l), Operand::Const(c)) => {
                let scratch = self.target.scratch_gpr;
                self.asm.mov_ri(scratch, c.bits() as i64);
                self.asm.cmp_rr(w, l, scratch);
            }
            (None, Operand::Reg { reg: Reg::Gpr(r), .. }) => {
                let mem = self.operand_mem(left);
                self.asm.cmp_mr(w, &mem, *r);
            }
            (None, Operand::Const(c)) if c.fits_imm32() => {
                let mem = self.operand_mem(left);
                self.asm.cmp_mi(w, &mem, c.bits() as i32);
            }
            (None, _) => {
                let scratch = self.target.scratch_gpr;
                let l = self.load_gpr(left, scratch);
                match right {
                    Operand::Stack { .. } => {
                        let mem = self.operand_mem(right);
                        self.asm.cmp_rm(w, l, &mem);
                    }
                    other => panic!("unsupported compare combination with {other}"),
                }
            }
            (Some(_), other) => panic!("unsupported compare combination with {other}"),
        }
    }

    fn emit_cmp3(&mut self, variant: CmpVariant, left: &Operand, right: &Operand, dst: &Operand) {
        let scratch = self.target.scratch_gpr;
        let l_gt = self.asm.buf().create_label();
        let l_lt = self.asm.buf().create_label();
        let l_done = self.asm.buf().create_label();

        if variant == CmpVariant::Lcmp {
            self.emit_cmp(left, right);
        } else {
            let double = matches!(variant, CmpVariant::Dcmpl | CmpVariant::Dcmpg);
            let l = self.load_xmm(left, self.target.scratch_xmm);
            match Self::xmm(right) {
                Some(r) => self.asm.ucomis(double, l, r),
                None => {
                    let mem = self.operand_mem(right);
                    self.asm.ucomis_rm(double, l, &mem);
                }
            }
        }

        let nan_result: i64 = match variant {
            CmpVariant::Fcmpl | CmpVariant::Dcmpl => -1,
            _ => 1,
        };
        if variant != CmpVariant::Lcmp {
            let l_nan = self.asm.buf().create_label();
            self.asm.jcc(CondCode::P, l_nan);
            self.asm.jcc(CondCode::A, l_gt);
            self.asm.jcc(CondCode::B, l_lt);
            self.asm.mov_ri(scratch, 0);
            self.asm.jmp(l_done);
            self.asm.buf().bind(l_nan);
            self.asm.mov_ri(scratch, nan_result);
            self.asm.jmp(l_done);
        } else {
            self.asm.jcc(CondCode::G, l_gt);
            self.asm.jcc(CondCode::L, l_lt);
            self.asm.mov_ri(scratch, 0);
            self.asm.jmp(l_done);
        }
        self.asm.buf().bind(l_gt);
        self.asm.mov_ri(scratch, 1);
        self.asm.jmp(l_done);
        self.asm.buf().bind(l_lt);
        self.asm.mov_ri(scratch, -1);
        self.asm.buf().bind(l_done);

        match Self::gpr(dst) {
            Some(d) => self.asm.mov_rr(false, d, scratch),
            None => {
                let mem = self.operand_mem(dst);
                self.asm.mov_mr(false, &mem, scratch);
            }
        }
    }

    fn emit_cmove(&mut self, cond: Cond, tval: &Operand, fval: &Operand, dst: &Operand) {
        let w = Self::is_w(dst.kind());
        let cc = CondCode::from_cond(cond);
        match Self::gpr(dst) {
            Some(d) => {
                self.move_any(fval, dst, dst.kind());
                match tval {
                    Operand::Reg { reg: Reg::Gpr(r), .. } => self.asm.cmovcc_rr(w, cc, d, *r),
                    Operand::Stack { .. } => {
                        let mem = self.operand_mem(tval);
                        self.asm.cmovcc_rm(w, cc, d, &mem);
                    }
                    other => panic!("conditional move needs a loaded true value, got {other}"),
                }
            }
            None => {
                let scratch = self.target.scratch_gpr;
                // Stage in the scratch, then store. Plain moves leave the
                // flags untouched.
                match fval {
                    Operand::Reg { reg: Reg::Gpr(r), .. } => self.asm.mov_rr(w, scratch, *r),
                    Operand::Stack { .. } => {
                        let mem = self.operand_mem(fval);
                        self.asm.mov_rm(w, scratch, &mem);
                    }
                    Operand::Const(c) => self.asm.mov_ri(scratch, c.bits() as i64),
                    other => panic!("bad conditional move source {other}"),
                }
                match tval {
                    Operand::Reg { reg: Reg::Gpr(r), .. } => {
                        self.asm.cmovcc_rr(w, cc, scratch, *r)
                    }
                    Operand::Stack { .. } => {
                        let mem = self.operand_mem(tval);
                        self.asm.cmovcc_rm(w, cc, scratch, &mem);
                    }
                    other => panic!("conditional move needs a loaded true value, got {other}"),
                }
                let mem = self.operand_mem(dst);
                self.asm.mov_mr(w, &mem, scratch);
            }
        }
    }

    fn emit_abs(&mut self, src: &Operand, dst: &Operand) {
        let scratch = self.target.scratch_gpr;
        // Clear the sign bit on the integer side.
        match src {
            Operand::Reg { reg: Reg::Xmm(x), .. } => self.asm.movq_rx(scratch, *x),
            Operand::Stack { .. } => {
                let mem = self.operand_mem(src);
                self.asm.mov_rm(true, scratch, &mem);
            }
            Operand::Const(c) => self.asm.mov_ri(scratch, c.bits() as i64),
            other => panic!("bad abs source {other}"),
        }
        self.asm.btr_ri(scratch, 63);
        match Self::xmm(dst) {
            Some(d) => self.asm.movq_xr(d, scratch),
            None => {
                let mem = self.operand_mem(dst);
                self.asm.mov_mr(true, &mem, scratch);
            }
        }
    }

    fn emit_cas(&mut self, addr: &Address, new_value: &Operand, result: &Operand) {
        let w = Self::is_w(addr.kind);
        let mem = self.mem_for_address(addr);
        match Self::gpr(new_value) {
            Some(n) => self.asm.lock_cmpxchg(w, &mem, n),
            None => {
                // The scratch may back the address: stage through RBX,
                // which this backend never allocates.
                let adjusted = adjust_rsp_address_mem(&mem, 8);
                self.asm.push(Gpr::Rbx);
                let nmem = self.operand_mem(new_value);
                self.asm.mov_rm(true, Gpr::Rbx, &nmem);
                self.asm.lock_cmpxchg(w, &adjusted, Gpr::Rbx);
                self.asm.pop(Gpr::Rbx);
            }
        }
        let scratch = self.target.scratch_gpr;
        self.asm.setcc(CondCode::E, scratch);
        self.asm.movzx_rr8(scratch, scratch);
        match Self::gpr(result) {
            Some(d) => self.asm.mov_rr(false, d, scratch),
            None => {
                let mem = self.operand_mem(result);
                self.asm.mov_mr(false, &mem, scratch);
            }
        }
    }

    fn emit_membar(&mut self, barriers: MemoryBarriers) {
        if barriers.contains(MemoryBarriers::STORE_LOAD) {
            self.asm.mfence();
            return;
        }
        if barriers.contains(MemoryBarriers::LOAD_LOAD)
            || barriers.contains(MemoryBarriers::LOAD_STORE)
        {
            self.asm.lfence();
        }
        if barriers.contains(MemoryBarriers::STORE_STORE) {
            self.asm.sfence();
        }
    }

    // -------------------------------------------------------------------------
    // XIR expansion
    // -------------------------------------------------------------------------

    fn emit_xir(&mut self, instance: &XirInstance) {
        let template = &instance.snippet.template;
        let labels: Vec<Label> = (0..template.label_count())
            .map(|_| self.asm.buf().create_label())
            .collect();
        let fast = template.fast_path.clone();
        for op in &fast {
            self.emit_xir_op(op, template, &instance.operands, &labels, &instance.info);
        }
        if template.has_slow_path() {
            self.slow_paths.push(SlowPath {
                template: Arc::clone(template),
                operands: instance.operands.clone(),
                labels,
                info: instance.info.clone(),
            });
        }
    }

    fn emit_xir_op(
        &mut self,
        op: &XirOp,
        template: &XirTemplate,
        operands: &[Operand],
        labels: &[Label],
        info: &Option<DebugInfo>,
    ) {
        let kind_of = |i: usize| template.operands[i].kind;
        match op {
            XirOp::Mov { dst, src } => {
                self.move_any(&operands[*src], &operands[*dst], kind_of(*dst));
            }
            XirOp::Add { dst, a, b }
            | XirOp::Sub { dst, a, b }
            | XirOp::And { dst, a, b }
            | XirOp::Or { dst, a, b }
            | XirOp::Xor { dst, a, b }
            | XirOp::Shl { dst, a, b }
            | XirOp::Shr { dst, a, b } => {
                self.emit_xir_alu(op, operands, *dst, *a, *b, kind_of(*dst));
            }
            XirOp::PointerLoad {
                dst, base, disp, kind, ..
            } => {
                let addr = Address::base_disp(operands[*base].clone(), *disp, *kind);
                self.emit_load(&addr, &operands[*dst]);
            }
            XirOp::PointerStore {
                base, disp, src, kind, ..
            } => {
                let addr = Address::base_disp(operands[*base].clone(), *disp, *kind);
                self.emit_store(&operands[*src], &addr);
            }
            XirOp::PointerLoadIndexed {
                dst,
                base,
                index,
                scale,
                disp,
                kind,
            } => {
                let addr = Address::indexed(
                    operands[*base].clone(),
                    operands[*index].clone(),
                    Scale::from_size(u32::from(*scale)).expect("template scale"),
                    *disp,
                    *kind,
                );
                self.emit_load(&addr, &operands[*dst]);
            }
            XirOp::PointerStoreIndexed {
                base,
                index,
                scale,
                disp,
                src,
                kind,
            } => {
                let addr = Address::indexed(
                    operands[*base].clone(),
                    operands[*index].clone(),
                    Scale::from_size(u32::from(*scale)).expect("template scale"),
                    *disp,
                    *kind,
                );
                self.emit_store(&operands[*src], &addr);
            }
            XirOp::Jcc { cond, a, b, target } => {
                self.emit_cmp(&operands[*a], &operands[*b]);
                let label = labels[target.0 as usize];
                self.asm.jcc(CondCode::from_cond(*cond), label);
            }
            XirOp::Jmp { target } => {
                let label = labels[target.0 as usize];
                self.asm.jmp(label);
            }
            XirOp::Bind { label } => {
                let l = labels[label.0 as usize];
                self.asm.buf().bind(l);
            }
            XirOp::CallRuntime { call, args, result } => {
                // Materialize arguments via the stack so sources in
                // argument registers cannot clobber each other.
                for &arg in args {
                    match &operands[arg] {
                        Operand::Reg { reg: Reg::Gpr(g), .. } => self.asm.push(*g),
                        Operand::Stack { .. } => {
                            let mem = self.operand_mem(&operands[arg]);
                            let scratch = self.target.scratch_gpr;
                            self.asm.mov_rm(true, scratch, &mem);
                            self.asm.push(scratch);
                        }
                        Operand::Const(c) => {
                            let scratch = self.target.scratch_gpr;
                            self.load_const_gpr(*c, scratch);
                            self.asm.push(scratch);
                        }
                        other => panic!("bad template call argument {other}"),
                    }
                }
                for (i, _) in args.iter().enumerate().rev() {
                    self.asm.pop(XIR_CALL_ARGS[i]);
                }
                let pos = self.asm.call_patchable();
                let stack_map = self.stack_map(&[]);
                self.runtime_calls.push(RuntimeCallSite {
                    pos,
                    call: *call,
                    stack_map,
                });
                self.record_info(pos, info.as_ref());
                if let Some(result) = result {
                    let out = &operands[*result];
                    let kind = kind_of(*result);
                    let src = if kind.is_float() {
                        Operand::Reg {
                            reg: Reg::Xmm(Xmm::Xmm0),
                            kind,
                        }
                    } else {
                        Operand::Reg {
                            reg: Reg::Gpr(Gpr::Rax),
                            kind,
                        }
                    };
                    self.move_any(&src, out, kind);
                }
            }
            XirOp::Safepoint => {
                let pos = self.asm.position();
                self.asm.test_eax_rip(0);
                let stack_map = self.stack_map(&[]);
                self.safepoints.push(SafepointSite {
                    pos,
                    reg_map: vec![0, 0],
                    stack_map,
                });
                self.record_info(pos, info.as_ref());
            }
            XirOp::Mark { mark } => {
                let name = template.marks[*mark].name;
                let pos = self.asm.position();
                self.marks.push(MarkSite { name, pos });
            }
            XirOp::ShouldNotReachHere => self.asm.int3(),
        }
    }

    /// `dst <- a op b` over template operands: stage `a` into the
    /// destination, then apply `b` through the generic ALU helpers.
    fn emit_xir_alu(
        &mut self,
        op: &XirOp,
        operands: &[Operand],
        dst: usize,
        a: usize,
        b: usize,
        kind: Kind,
    ) {
        let dst_op = operands[dst].clone();
        let a_op = operands[a].clone();
        let b_op = operands[b].clone();
        if a_op != dst_op {
            self.move_any(&a_op, &dst_op, kind);
        }
        let w = Self::is_w(kind);
        match op {
            XirOp::Add { .. } => self.emit_two_op(
                w,
                &b_op,
                &dst_op,
                Assembler::add_rr,
                Assembler::add_rm,
                Assembler::add_mr,
                Assembler::add_ri,
                Assembler::add_mi,
            ),
            XirOp::Sub { .. } => self.emit_two_op(
                w,
                &b_op,
                &dst_op,
                Assembler::sub_rr,
                Assembler::sub_rm,
                Assembler::sub_mr,
                Assembler::sub_ri,
                Assembler::sub_mi,
            ),
            XirOp::And { .. } => self.emit_logic(LogicOp::And, &b_op, &dst_op),
            XirOp::Or { .. } => self.emit_logic(LogicOp::Or, &b_op, &dst_op),
            XirOp::Xor { .. } => self.emit_logic(LogicOp::Xor, &b_op, &dst_op),
            XirOp::Shl { .. } | XirOp::Shr { .. } => {
                let Operand::Const(c) = b_op else {
                    panic!("template shift amounts are constants");
                };
                let shift_op = if matches!(op, XirOp::Shl { .. }) {
                    ShiftOp::Shl
                } else {
                    ShiftOp::Ushr
                };
                self.emit_shift(shift_op, &Operand::Const(c), &dst_op);
            }
            _ => unreachable!("not an ALU template op"),
        }
    }
}

/// Whether resolving this address will claim the scratch register.
fn addr_needs_scratch(addr: &Address) -> bool {
    let base_is_reg = matches!(
        &*addr.base,
        Operand::Reg {
            reg: Reg::Gpr(_),
            ..
        }
    );
    let index_is_reg = match &addr.index {
        None => true,
        Some(i) => matches!(
            &**i,
            Operand::Reg {
                reg: Reg::Gpr(_),
                ..
            }
        ),
    };
    !(base_is_reg && index_is_reg)
}

/// Rebase an rsp-relative address after a push shifted the stack pointer.
fn adjust_rsp_address(addr: &Address, shift: i32) -> Address {
    let mut adjusted = addr.clone();
    if let Operand::Reg {
        reg: Reg::Gpr(Gpr::Rsp),
        ..
    } = &*addr.base
    {
        adjusted.disp += shift;
    }
    adjusted
}

/// Rebase a resolved memory operand after a push shifted the stack pointer.
fn adjust_rsp_address_mem(mem: &Mem, shift: i32) -> Mem {
    let mut adjusted = *mem;
    if mem.base == Gpr::Rsp {
        adjusted.disp += shift;
    }
    adjusted
}
