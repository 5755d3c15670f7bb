//! HIR to LIR lowering.
//!
//! A visitor over the HIR in reverse postorder. Every live value either
//! receives a virtual operand or is lowered for its side effects; calling
//! conventions are materialized with explicit moves into fixed-register
//! variables, object operations weave in runtime-supplied XIR snippets,
//! switches lower through key ranges, and phi operands are resolved with
//! dependency-ordered parallel moves at block exits.

use smallvec::SmallVec;

use opal_core::{Bailout, CompileResult, Kind};

use crate::hir::{
    ArithOp, BlockId, Hir, InstrFlags, InstrId, InstrOp, IntrinsicId, InvokeKind, LirListId,
    ShiftOp,
};
use crate::lir::operand::{Address, Operand, OperandPool, Scale};
use crate::lir::phi_resolver::PhiResolver;
use crate::lir::switches::{lookup_ranges, table_ranges, SwitchRange};
use crate::lir::{
    BranchTarget, DebugInfo, Lir, LirList, LirOp, RuntimeCall, StubId, XirInstance,
};
use crate::hir::Cond;
use crate::options::Options;
use crate::runtime::{FieldRef, MethodRef, RuntimeInterface};
use crate::target::call_conv::{self, ArgLocation, CallConv};
use crate::target::registers::{Gpr, Reg};
use crate::target::{MemoryBarriers, Target};
use crate::value::ConstValue;
use crate::xir::{XirArgument, XirRole, XirRuntime, XirSnippet};

/// The register an OSR entry receives its locals buffer in.
pub const OSR_BUFFER_REG: Gpr = Gpr::Rdi;

/// The reserved scratch spill slot used by bit-pattern moves.
const SCRATCH_SLOT: i32 = 0;

/// Lower the graph to LIR.
pub fn generate(
    hir: &mut Hir,
    method: &MethodRef,
    target: &Target,
    options: &Options,
    runtime: &dyn RuntimeInterface,
    xir: &dyn XirRuntime,
) -> CompileResult<Lir> {
    let order = hir.reverse_postorder();
    let mut gen = LirGen {
        hir,
        method,
        target,
        options,
        runtime,
        xir,
        pool: OperandPool::new(),
        cur: LirList::new(BlockId(0)),
        lists: Vec::new(),
        monitor_count: 0,
        stack_alloc_bytes: 0,
        outgoing_bytes: 0,
    };
    for &block in &order {
        gen.lower_block(block)?;
    }
    let LirGen {
        pool,
        lists,
        monitor_count,
        stack_alloc_bytes,
        outgoing_bytes,
        ..
    } = gen;
    Ok(Lir {
        lists,
        pool,
        order,
        monitor_count,
        stack_alloc_bytes,
        outgoing_bytes,
    })
}

struct LirGen<'a> {
    hir: &'a mut Hir,
    method: &'a MethodRef,
    target: &'a Target,
    options: &'a Options,
    runtime: &'a dyn RuntimeInterface,
    xir: &'a dyn XirRuntime,
    pool: OperandPool,
    cur: LirList,
    lists: Vec<LirList>,
    monitor_count: u32,
    stack_alloc_bytes: u32,
    outgoing_bytes: u32,
}

impl LirGen<'_> {
    fn lower_block(&mut self, block: BlockId) -> CompileResult<()> {
        self.cur = LirList::new(block);
        if block == self.hir.start_block {
            self.materialize_parameters();
        }
        let chain: Vec<InstrId> = self.hir.block_instrs(block).collect();
        for id in chain {
            self.lower_instr(id)?;
        }
        let list = std::mem::replace(&mut self.cur, LirList::new(block));
        let list_id = LirListId(self.lists.len() as u32);
        self.lists.push(list);
        self.hir.block_mut(block).lir = Some(list_id);
        Ok(())
    }

    /// Move every parameter from its ABI location into a fresh variable
    /// bound to the corresponding `Local`.
    fn materialize_parameters(&mut self) {
        let kinds: Vec<Kind> = self
            .method
            .argument_kinds()
            .iter()
            .map(|k| k.stack_kind())
            .collect();
        let locs = call_conv::locations_for(
            CallConv::Optimized,
            &kinds,
            self.target.stack_alignment,
        );
        // Map parameter slot index -> location.
        let mut by_slot: Vec<(u32, Kind, ArgLocation)> = Vec::new();
        let mut slot = 0u32;
        for (kind, loc) in kinds.iter().zip(locs.locations.iter()) {
            by_slot.push((slot, *kind, *loc));
            slot += kind.jvm_slots();
        }

        let chain: Vec<InstrId> = self.hir.block_instrs(self.hir.start_block).collect();
        for id in chain {
            if let InstrOp::Local { index } = self.hir.instr(id).op {
                let Some(&(_, kind, loc)) = by_slot.iter().find(|(s, _, _)| *s == index) else {
                    continue;
                };
                let src = match loc {
                    ArgLocation::Reg(reg) => Operand::Reg { reg, kind },
                    ArgLocation::Stack(offset) => Operand::Stack {
                        slot: offset / 8,
                        kind,
                        caller_frame: true,
                    },
                };
                let dst = self.pool.new_variable(kind);
                self.cur.push(LirOp::Move {
                    src,
                    dst: dst.clone(),
                });
                self.hir.instr_mut(id).operand = dst;
            }
        }
    }

    fn lower_instr(&mut self, id: InstrId) -> CompileResult<()> {
        let op = self.hir.instr(id).op.clone();
        let kind = self.hir.instr(id).kind;
        match op {
            // Lazily materialized values.
            InstrOp::Constant(_) | InstrOp::Local { .. } | InstrOp::Phi { .. } => {}

            InstrOp::ArithmeticOp { op, x, y } => self.lower_arith(id, kind, op, x, y)?,
            InstrOp::ShiftOp { op, x, y } => self.lower_shift(id, kind, op, x, y),
            InstrOp::LogicOp { op, x, y } => {
                let left = self.operand_of(x);
                let right = self.operand_of(y);
                let dst = self.result_var(id, kind);
                self.cur.push(LirOp::Move {
                    src: left,
                    dst: dst.clone(),
                });
                self.cur.push(LirOp::Logic {
                    op,
                    left: dst.clone(),
                    right,
                    dst,
                });
            }
            InstrOp::Negate { x } => {
                let value = self.operand_of(x);
                let dst = self.result_var(id, kind);
                self.cur.push(LirOp::Move {
                    src: value,
                    dst: dst.clone(),
                });
                self.cur.push(LirOp::Neg {
                    value: dst.clone(),
                    dst,
                });
            }
            InstrOp::Convert { op, x } => {
                if op.input_kind().is_float() || op.result_kind().is_float() {
                    let fp = if op.input_kind() == Kind::Double
                        || op.result_kind() == Kind::Double
                    {
                        Kind::Double
                    } else {
                        Kind::Float
                    };
                    self.check_fp_strategy(fp)?;
                }
                let src = self.load_to_var(x);
                let dst = self.result_var(id, kind);
                self.cur.push(LirOp::Convert { op, src, dst });
            }
            InstrOp::Compare { op, x, y } => {
                let left = self.load_to_var(x);
                let right = self.load_to_var(y);
                let dst = self.result_var(id, kind);
                self.cur.push(LirOp::Cmp3 {
                    variant: op,
                    left,
                    right,
                    dst,
                });
            }
            InstrOp::IfOp {
                cond,
                x,
                y,
                tval,
                fval,
            } => {
                let left = self.load_to_var(x);
                let right = self.operand_of(y);
                let tv = self.load_to_var(tval);
                let fv = self.operand_of(fval);
                let dst = self.result_var(id, kind);
                self.cur.push(LirOp::Cmp { left, right });
                self.cur.push(LirOp::Cmove {
                    cond,
                    tval: tv,
                    fval: fv,
                    dst,
                });
            }
            InstrOp::NullCheck { obj } => {
                let value = self.operand_of(obj);
                let info = self.require_info(id)?;
                self.cur.push(LirOp::NullCheck { value, info });
                // The checked value is the result.
                let operand = self.operand_of(obj);
                self.hir.instr_mut(id).operand = operand;
            }

            InstrOp::LoadField { obj, field } => self.lower_load_field(id, kind, obj, &field)?,
            InstrOp::StoreField { obj, field, value } => {
                self.lower_store_field(id, obj, &field, value)?
            }
            InstrOp::LoadIndexed {
                array,
                index,
                elem_kind,
            } => self.lower_load_indexed(id, kind, array, index, elem_kind)?,
            InstrOp::StoreIndexed {
                array,
                index,
                value,
                elem_kind,
            } => self.lower_store_indexed(id, array, index, value, elem_kind)?,
            InstrOp::ArrayLength { array } => {
                let array_op = self.load_to_var(array);
                self.null_check(array, &array_op, id);
                if let Some(snippet) = self.xir.gen_array_length(XirArgument::Value(array)) {
                    let args = self.resolve_xir_args(&snippet);
                    self.emit_xir(snippet, args, self.debug_info(id), Some(id));
                } else {
                    let dst = self.result_var(id, Kind::Int);
                    let addr = Address::base_disp(
                        array_op,
                        self.runtime.array_length_offset(),
                        Kind::Int,
                    );
                    self.cur.push(LirOp::Load {
                        addr,
                        dst,
                        info: self.debug_info(id),
                    });
                }
            }

            InstrOp::NewInstance { ref class } => {
                let snippet = self.xir.gen_new_instance(class);
                let mirror = self.runtime.class_mirror(class);
                match snippet {
                    Some(snippet) => {
                        let args = self.resolve_xir_args(&snippet);
                        self.emit_xir(snippet, args, self.debug_info(id), Some(id));
                    }
                    None => {
                        self.runtime_call_value(
                            id,
                            RuntimeCall::NewInstance,
                            vec![Operand::Const(mirror)],
                            Kind::Object,
                        );
                    }
                }
            }
            InstrOp::NewTypeArray { length, elem_kind } => {
                let snippet =
                    self.xir
                        .gen_new_array(XirArgument::Value(length), elem_kind, None);
                match snippet {
                    Some(snippet) => {
                        let args = self.resolve_xir_args(&snippet);
                        self.emit_xir(snippet, args, self.debug_info(id), Some(id));
                    }
                    None => {
                        let len = self.operand_of(length);
                        let tag = Operand::Const(ConstValue::Int(
                            elem_kind.descriptor_char() as i32
                        ));
                        self.runtime_call_value(
                            id,
                            RuntimeCall::NewArray,
                            vec![tag, len],
                            Kind::Object,
                        );
                    }
                }
            }
            InstrOp::NewObjectArray { length, ref class } => {
                let snippet =
                    self.xir
                        .gen_new_array(XirArgument::Value(length), Kind::Object, Some(class));
                match snippet {
                    Some(snippet) => {
                        let args = self.resolve_xir_args(&snippet);
                        self.emit_xir(snippet, args, self.debug_info(id), Some(id));
                    }
                    None => {
                        let len = self.operand_of(length);
                        let mirror = Operand::Const(self.runtime.class_mirror(class));
                        self.runtime_call_value(
                            id,
                            RuntimeCall::NewArray,
                            vec![mirror, len],
                            Kind::Object,
                        );
                    }
                }
            }
            InstrOp::NewMultiArray { ref class, ref dims } => {
                let dim_args: Vec<XirArgument> =
                    dims.iter().map(|d| XirArgument::Value(*d)).collect();
                match self.xir.gen_new_multi_array(&dim_args, class) {
                    Some(snippet) => {
                        let args = self.resolve_xir_args(&snippet);
                        self.emit_xir(snippet, args, self.debug_info(id), Some(id));
                    }
                    None => {
                        let mut args = vec![Operand::Const(self.runtime.class_mirror(class))];
                        args.push(Operand::Const(ConstValue::Int(dims.len() as i32)));
                        for &d in dims.iter() {
                            args.push(self.operand_of(d));
                        }
                        self.runtime_call_value(
                            id,
                            RuntimeCall::NewMultiArray,
                            args,
                            Kind::Object,
                        );
                    }
                }
            }
            InstrOp::CheckCast { obj, ref class } => {
                let obj_op = self.operand_of(obj);
                match self.xir.gen_check_cast(XirArgument::Value(obj), class) {
                    Some(snippet) => {
                        let args = self.resolve_xir_args(&snippet);
                        self.emit_xir(snippet, args, self.debug_info(id), Some(id));
                    }
                    None => {
                        let mirror = Operand::Const(self.runtime.class_mirror(class));
                        self.runtime_call_value(
                            id,
                            RuntimeCall::CheckCast,
                            vec![obj_op, mirror],
                            Kind::Object,
                        );
                    }
                }
            }
            InstrOp::InstanceOf { obj, ref class } => {
                let obj_op = self.operand_of(obj);
                match self.xir.gen_instance_of(XirArgument::Value(obj), class) {
                    Some(snippet) => {
                        let args = self.resolve_xir_args(&snippet);
                        self.emit_xir(snippet, args, self.debug_info(id), Some(id));
                    }
                    None => {
                        let mirror = Operand::Const(self.runtime.class_mirror(class));
                        self.runtime_call_value(
                            id,
                            RuntimeCall::InstanceOf,
                            vec![obj_op, mirror],
                            Kind::Int,
                        );
                    }
                }
            }

            InstrOp::MonitorEnter { obj, lock_number } => {
                self.monitor_count = self.monitor_count.max(lock_number + 1);
                let obj_op = self.operand_of(obj);
                self.null_check(obj, &obj_op, id);
                if self.options.use_biased_locking {
                    // Biased locking needs a dedicated scratch register at
                    // the lock site; a fixed binding reserves it here.
                    let scratch = self.pool.new_fixed(Kind::Word, Reg::Gpr(Gpr::Rcx));
                    self.cur.push(LirOp::Move {
                        src: Operand::Const(ConstValue::Word(0)),
                        dst: scratch,
                    });
                }
                match self.xir.gen_monitor_enter(XirArgument::Value(obj)) {
                    Some(snippet) => {
                        let args = self.resolve_xir_args(&snippet);
                        self.emit_xir(snippet, args, self.debug_info(id), None);
                    }
                    None => {
                        self.runtime_call_effect(
                            id,
                            RuntimeCall::MonitorEnter,
                            vec![obj_op],
                        );
                    }
                }
            }
            InstrOp::MonitorExit { obj, .. } => {
                let obj_op = self.operand_of(obj);
                match self.xir.gen_monitor_exit(XirArgument::Value(obj)) {
                    Some(snippet) => {
                        let args = self.resolve_xir_args(&snippet);
                        self.emit_xir(snippet, args, self.debug_info(id), None);
                    }
                    None => {
                        self.runtime_call_effect(id, RuntimeCall::MonitorExit, vec![obj_op]);
                    }
                }
            }

            InstrOp::Invoke {
                kind: invoke_kind,
                ref target,
                ref args,
            } => self.lower_invoke(id, kind, invoke_kind, target, args)?,
            InstrOp::Intrinsic { id: intrinsic, ref args } => {
                self.lower_intrinsic(id, kind, intrinsic, args)?
            }

            InstrOp::ExceptionObject => {
                let dst = self.result_var(id, Kind::Object);
                self.cur.push(LirOp::Move {
                    src: Operand::Reg {
                        reg: Reg::Gpr(self.target.exception_reg),
                        kind: Kind::Object,
                    },
                    dst,
                });
            }
            InstrOp::OsrEntry => {
                let dst = self.result_var(id, Kind::Word);
                self.cur.push(LirOp::Move {
                    src: Operand::Reg {
                        reg: Reg::Gpr(OSR_BUFFER_REG),
                        kind: Kind::Word,
                    },
                    dst,
                });
            }

            InstrOp::LoadPointer {
                pointer,
                disp,
                loaded_kind,
            } => {
                let base = self.load_to_var(pointer);
                let dst = self.result_var(id, loaded_kind.stack_kind());
                self.cur.push(LirOp::Load {
                    addr: Address::base_disp(base, disp, loaded_kind),
                    dst,
                    info: None,
                });
            }
            InstrOp::StorePointer {
                pointer,
                disp,
                value,
            } => {
                let base = self.load_to_var(pointer);
                let src = self.operand_of(value);
                let value_kind = self.hir.instr(value).kind;
                self.cur.push(LirOp::Store {
                    src,
                    addr: Address::base_disp(base, disp, value_kind),
                    info: None,
                });
            }
            InstrOp::UnsafeGet {
                obj,
                offset,
                loaded_kind,
                is_volatile,
            } => {
                let base = self.load_to_var(obj);
                let index = self.load_to_var(offset);
                let dst = self.result_var(id, loaded_kind.stack_kind());
                let addr = Address::indexed(base, index, Scale::S1, 0, loaded_kind);
                if is_volatile {
                    self.membar(MemoryBarriers::PRE_VOLATILE_READ);
                }
                self.cur.push(LirOp::Load {
                    addr,
                    dst,
                    info: None,
                });
                if is_volatile {
                    self.membar(MemoryBarriers::POST_VOLATILE_READ);
                }
            }
            InstrOp::UnsafePut {
                obj,
                offset,
                value,
                stored_kind,
                is_volatile,
            } => {
                let base = self.load_to_var(obj);
                let index = self.load_to_var(offset);
                let src = self.operand_of(value);
                let addr = Address::indexed(base, index, Scale::S1, 0, stored_kind);
                if is_volatile {
                    self.membar(MemoryBarriers::PRE_VOLATILE_WRITE);
                }
                self.cur.push(LirOp::Store {
                    src,
                    addr,
                    info: None,
                });
                if is_volatile {
                    self.membar(MemoryBarriers::POST_VOLATILE_WRITE);
                }
            }
            InstrOp::UnsafeCast { x } => {
                let src = self.operand_of(x);
                let dst = self.result_var(id, kind);
                self.cur.push(LirOp::Move { src, dst });
            }
            InstrOp::StackAllocate { size } => {
                let offset = self.stack_alloc_bytes as i32;
                self.stack_alloc_bytes += (size as u32 + 7) & !7;
                let dst = self.result_var(id, Kind::Word);
                self.cur.push(LirOp::FrameAddr {
                    region: crate::lir::FrameRegion::StackBlock { offset },
                    dst,
                });
            }
            InstrOp::MonitorAddress { lock_number } => {
                self.monitor_count = self.monitor_count.max(lock_number + 1);
                let dst = self.result_var(id, Kind::Word);
                self.cur.push(LirOp::FrameAddr {
                    region: crate::lir::FrameRegion::Monitor { index: lock_number },
                    dst,
                });
            }
            InstrOp::MemoryBarrier { barriers } => {
                self.membar(MemoryBarriers::from_bits(barriers));
            }
            InstrOp::Safepoint => {
                let info = self.require_info(id)?;
                match self.xir.gen_safepoint() {
                    Some(snippet) => {
                        let args = self.resolve_xir_args(&snippet);
                        self.emit_xir(snippet, args, Some(info), None);
                    }
                    None => self.cur.push(LirOp::SafepointPoll { info }),
                }
            }
            InstrOp::Here => {
                let dst = self.result_var(id, Kind::Word);
                self.cur.push(LirOp::CapturePc { dst });
            }
            InstrOp::Info => {
                let info = self.require_info(id)?;
                self.cur.push(LirOp::InfoPoint { info });
            }

            // -- Block ends ---------------------------------------------------
            InstrOp::Base { std_entry, .. } => {
                self.move_to_phis(std_entry);
                self.cur.push(LirOp::Jump {
                    target: BranchTarget::Block(std_entry),
                });
            }
            InstrOp::Goto { sux } => {
                self.move_to_phis(sux);
                self.cur.push(LirOp::Jump {
                    target: BranchTarget::Block(sux),
                });
            }
            InstrOp::If {
                cond,
                x,
                y,
                tsux,
                fsux,
            } => {
                let left = self.load_to_var(x);
                let right = self.operand_of(y);
                self.cur.push(LirOp::Cmp { left, right });
                self.cur.push(LirOp::Branch {
                    cond,
                    target: BranchTarget::Block(tsux),
                });
                self.cur.push(LirOp::Jump {
                    target: BranchTarget::Block(fsux),
                });
            }
            InstrOp::TableSwitch {
                value,
                lo_key,
                ref suxs,
                default,
            } => {
                let value_op = self.load_to_var(value);
                if self.options.gen_table_ranges {
                    let ranges = table_ranges(lo_key, suxs, default);
                    self.emit_switch_ranges(&ranges, value_op, default);
                } else {
                    for (i, &sux) in suxs.iter().enumerate() {
                        self.cur.push(LirOp::Cmp {
                            left: value_op.clone(),
                            right: Operand::Const(ConstValue::Int(lo_key + i as i32)),
                        });
                        self.cur.push(LirOp::Branch {
                            cond: Cond::Eq,
                            target: BranchTarget::Block(sux),
                        });
                    }
                    self.cur.push(LirOp::Jump {
                        target: BranchTarget::Block(default),
                    });
                }
            }
            InstrOp::LookupSwitch {
                value,
                ref keys,
                ref suxs,
                default,
            } => {
                let value_op = self.load_to_var(value);
                if self.options.gen_table_ranges {
                    let ranges = lookup_ranges(keys, suxs, default);
                    self.emit_switch_ranges(&ranges, value_op, default);
                } else {
                    for (&key, &sux) in keys.iter().zip(suxs.iter()) {
                        self.cur.push(LirOp::Cmp {
                            left: value_op.clone(),
                            right: Operand::Const(ConstValue::Int(key)),
                        });
                        self.cur.push(LirOp::Branch {
                            cond: Cond::Eq,
                            target: BranchTarget::Block(sux),
                        });
                    }
                    self.cur.push(LirOp::Jump {
                        target: BranchTarget::Block(default),
                    });
                }
            }
            InstrOp::Return { value } => {
                let value_op = match value {
                    Some(v) => {
                        let vkind = self.hir.instr(v).kind;
                        let src = self.operand_of(v);
                        let reg = call_conv::result_location(vkind)
                            .expect("non-void return has a location");
                        let fixed = self.pool.new_fixed(vkind, reg);
                        self.cur.push(LirOp::Move {
                            src,
                            dst: fixed.clone(),
                        });
                        Some(fixed)
                    }
                    None => None,
                };
                self.cur.push(LirOp::Return { value: value_op });
            }
            InstrOp::Throw { exception } => {
                let exc = self.operand_of(exception);
                let info = self.require_info(id)?;
                let (args, _) =
                    self.move_call_args(&[exc], &[Kind::Object], &mut SmallVec::new());
                self.cur.push(LirOp::CallRuntime {
                    call: RuntimeCall::Throw,
                    args,
                    result: Operand::Illegal,
                    info: Some(info),
                });
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Arithmetic
    // -------------------------------------------------------------------------

    /// This backend only implements the SSE strategies; an x87 request is
    /// a configuration the compiler cannot honor.
    fn check_fp_strategy(&self, kind: Kind) -> CompileResult<()> {
        let needed = match kind {
            Kind::Float => 1,
            Kind::Double => 2,
            _ => 0,
        };
        if self.options.sse_version < needed {
            return Err(Bailout::invariant(format!(
                "SSEVersion {} cannot compile {kind} arithmetic",
                self.options.sse_version
            )));
        }
        Ok(())
    }

    fn lower_arith(
        &mut self,
        id: InstrId,
        kind: Kind,
        op: ArithOp,
        x: InstrId,
        y: InstrId,
    ) -> CompileResult<()> {
        if kind.is_float() {
            self.check_fp_strategy(kind)?;
        }
        let trapping = op.can_trap(kind);
        if trapping {
            return self.lower_int_div(id, kind, op, x, y);
        }
        if kind.is_float() && matches!(op, ArithOp::Rem) {
            // frem/drem have no machine instruction; call out.
            let xo = self.operand_of(x);
            let yo = self.operand_of(y);
            let call = if kind == Kind::Float {
                RuntimeCall::Frem
            } else {
                RuntimeCall::Drem
            };
            self.runtime_call_value(id, call, vec![xo, yo], kind);
            return Ok(());
        }
        let left = self.operand_of(x);
        let right = self.operand_of(y);
        let dst = self.result_var(id, kind);
        // Two-operand form: dst aliases the left input.
        self.cur.push(LirOp::Move {
            src: left,
            dst: dst.clone(),
        });
        self.cur.push(LirOp::Arith {
            op,
            left: dst.clone(),
            right,
            dst,
            info: None,
        });
        Ok(())
    }

    /// Integer division: dividend pinned to RAX, result read from RAX
    /// (quotient) or RDX (remainder).
    fn lower_int_div(
        &mut self,
        id: InstrId,
        kind: Kind,
        op: ArithOp,
        x: InstrId,
        y: InstrId,
    ) -> CompileResult<()> {
        let info = self.require_info(id)?;
        let divisor = self.load_to_var(y);
        if self.options.gen_explicit_div0_checks {
            self.cur.push(LirOp::Cmp {
                left: divisor.clone(),
                right: zero_of(kind),
            });
            self.cur.push(LirOp::BranchStub {
                cond: Cond::Eq,
                stub: StubId::ThrowDivisionByZero,
                info: info.clone(),
            });
        }
        let dividend = self.operand_of(x);
        let rax_in = self.pool.new_fixed(kind, Reg::Gpr(Gpr::Rax));
        self.cur.push(LirOp::Move {
            src: dividend,
            dst: rax_in.clone(),
        });
        let out_reg = if op == ArithOp::Div { Gpr::Rax } else { Gpr::Rdx };
        let fixed_out = self.pool.new_fixed(kind, Reg::Gpr(out_reg));
        self.cur.push(LirOp::Arith {
            op,
            left: rax_in,
            right: divisor,
            dst: fixed_out.clone(),
            info: if self.options.gen_explicit_div0_checks {
                None
            } else {
                Some(info)
            },
        });
        let dst = self.result_var(id, kind);
        self.cur.push(LirOp::Move {
            src: fixed_out,
            dst,
        });
        Ok(())
    }

    fn lower_shift(&mut self, id: InstrId, kind: Kind, op: ShiftOp, x: InstrId, y: InstrId) {
        let value = self.operand_of(x);
        let count = self.operand_of(y);
        // Non-constant shift counts go through CL.
        let count = if count.is_const() {
            count
        } else {
            let fixed = self.pool.new_fixed(Kind::Int, Reg::Gpr(Gpr::Rcx));
            self.cur.push(LirOp::Move {
                src: count,
                dst: fixed.clone(),
            });
            fixed
        };
        let dst = self.result_var(id, kind);
        self.cur.push(LirOp::Move {
            src: value,
            dst: dst.clone(),
        });
        self.cur.push(LirOp::Shift {
            op,
            value: dst.clone(),
            count,
            dst,
        });
    }

    // -------------------------------------------------------------------------
    // Field and array access
    // -------------------------------------------------------------------------

    fn lower_load_field(
        &mut self,
        id: InstrId,
        kind: Kind,
        obj: Option<InstrId>,
        field: &FieldRef,
    ) -> CompileResult<()> {
        if field.is_volatile {
            self.membar(MemoryBarriers::PRE_VOLATILE_READ);
        }
        let snippet = match obj {
            Some(obj) => {
                let obj_op = self.load_to_var(obj);
                self.null_check(obj, &obj_op, id);
                self.xir.gen_get_field(XirArgument::Value(obj), field)
            }
            None => self.xir.gen_get_static(field),
        };
        match snippet {
            Some(snippet) => {
                let args = self.resolve_xir_args(&snippet);
                self.emit_xir(snippet, args, self.debug_info(id), Some(id));
            }
            None => {
                let base = match obj {
                    Some(obj) => self.operand_of(obj),
                    None => {
                        let statics = self.runtime.class_mirror(&field.holder);
                        self.const_to_var(statics)
                    }
                };
                let dst = self.result_var(id, kind);
                self.cur.push(LirOp::Load {
                    addr: Address::base_disp(base, field.offset, field.kind),
                    dst,
                    info: self.debug_info(id),
                });
            }
        }
        if field.is_volatile {
            self.membar(MemoryBarriers::POST_VOLATILE_READ);
        }
        Ok(())
    }

    fn lower_store_field(
        &mut self,
        id: InstrId,
        obj: Option<InstrId>,
        field: &FieldRef,
        value: InstrId,
    ) -> CompileResult<()> {
        if field.is_volatile {
            self.membar(MemoryBarriers::PRE_VOLATILE_WRITE);
        }
        let base_op = match obj {
            Some(obj) => {
                let obj_op = self.load_to_var(obj);
                self.null_check(obj, &obj_op, id);
                obj_op
            }
            None => {
                let statics = self.runtime.class_mirror(&field.holder);
                self.const_to_var(statics)
            }
        };
        let needs_barrier = field.kind.is_object()
            && !self
                .hir
                .instr(id)
                .flags
                .contains(InstrFlags::NO_WRITE_BARRIER);
        let snippet = match obj {
            Some(obj) => self.xir.gen_put_field(
                XirArgument::Value(obj),
                XirArgument::Value(value),
                field,
            ),
            None => self.xir.gen_put_static(XirArgument::Value(value), field),
        };
        match snippet {
            Some(snippet) => {
                let args = self.resolve_xir_args(&snippet);
                self.emit_xir(snippet, args, self.debug_info(id), None);
            }
            None => {
                let src = self.operand_of(value);
                self.cur.push(LirOp::Store {
                    src,
                    addr: Address::base_disp(base_op.clone(), field.offset, field.kind),
                    info: self.debug_info(id),
                });
            }
        }
        if needs_barrier {
            self.write_barrier(base_op, field.offset, None);
        }
        if field.is_volatile {
            self.membar(MemoryBarriers::POST_VOLATILE_WRITE);
        }
        Ok(())
    }

    fn lower_load_indexed(
        &mut self,
        id: InstrId,
        kind: Kind,
        array: InstrId,
        index: InstrId,
        elem_kind: Kind,
    ) -> CompileResult<()> {
        let array_op = self.load_to_var(array);
        self.null_check(array, &array_op, id);
        let index_op = self.load_to_var(index);
        self.bounds_check(id, &array_op, &index_op)?;
        let addr = self.element_address(array_op, index_op, elem_kind);
        let dst = self.result_var(id, kind);
        self.cur.push(LirOp::Load {
            addr,
            dst,
            info: self.debug_info(id),
        });
        Ok(())
    }

    fn lower_store_indexed(
        &mut self,
        id: InstrId,
        array: InstrId,
        index: InstrId,
        value: InstrId,
        elem_kind: Kind,
    ) -> CompileResult<()> {
        let array_op = self.load_to_var(array);
        self.null_check(array, &array_op, id);
        let index_op = self.load_to_var(index);
        self.bounds_check(id, &array_op, &index_op)?;
        let value_op = self.operand_of(value);
        if elem_kind.is_object()
            && self.options.gen_array_store_check
            && !self
                .hir
                .instr(id)
                .flags
                .contains(InstrFlags::NO_STORE_CHECK)
        {
            let info = self.require_info(id)?;
            let (args, _) = self.move_call_args(
                &[array_op.clone(), value_op.clone()],
                &[Kind::Object, Kind::Object],
                &mut SmallVec::new(),
            );
            self.cur.push(LirOp::CallRuntime {
                call: RuntimeCall::ArrayStoreCheck,
                args,
                result: Operand::Illegal,
                info: Some(info),
            });
        }
        let addr = self.element_address(array_op.clone(), index_op.clone(), elem_kind);
        self.cur.push(LirOp::Store {
            src: value_op,
            addr,
            info: self.debug_info(id),
        });
        if elem_kind.is_object()
            && !self
                .hir
                .instr(id)
                .flags
                .contains(InstrFlags::NO_WRITE_BARRIER)
        {
            let base = self.runtime.array_base_offset(elem_kind);
            self.write_barrier(array_op, base, Some(index_op));
        }
        Ok(())
    }

    fn element_address(&mut self, array: Operand, index: Operand, elem_kind: Kind) -> Address {
        let elem_size = elem_kind.size_in_bytes(self.target.word_size);
        let scale = Scale::from_size(elem_size).expect("element sizes are powers of two");
        Address::indexed(
            array,
            index,
            scale,
            self.runtime.array_base_offset(elem_kind),
            elem_kind,
        )
    }

    fn bounds_check(
        &mut self,
        id: InstrId,
        array_op: &Operand,
        index_op: &Operand,
    ) -> CompileResult<()> {
        if !self.options.gen_bounds_checks
            || self
                .hir
                .instr(id)
                .flags
                .contains(InstrFlags::NO_BOUNDS_CHECK)
        {
            return Ok(());
        }
        let info = self.require_info(id)?;
        let length = self.pool.new_variable(Kind::Int);
        self.cur.push(LirOp::Load {
            addr: Address::base_disp(
                array_op.clone(),
                self.runtime.array_length_offset(),
                Kind::Int,
            ),
            dst: length.clone(),
            info: None,
        });
        self.cur.push(LirOp::Cmp {
            left: index_op.clone(),
            right: length,
        });
        self.cur.push(LirOp::BranchStub {
            cond: Cond::AboveEqual,
            stub: StubId::ThrowBoundsCheck,
            info,
        });
        Ok(())
    }

    /// Post-store card mark: hand the written address to the runtime's
    /// barrier template.
    fn write_barrier(&mut self, base: Operand, disp: i32, index: Option<Operand>) {
        let addr_var = self.pool.new_variable(Kind::Word);
        let addr = match index {
            Some(index) => Address::indexed(base, index, Scale::S8, disp, Kind::Word),
            None => Address::base_disp(base, disp, Kind::Word),
        };
        self.cur.push(LirOp::Lea {
            addr,
            dst: addr_var.clone(),
        });
        // The argument is an internal operand, not a HIR value, so it is
        // resolved here rather than through resolve_xir_args.
        if let Some(snippet) = self.xir.gen_write_barrier(XirArgument::Constant(
            ConstValue::Word(0),
        )) {
            self.emit_xir(snippet, vec![addr_var], None, None);
        }
    }

    // -------------------------------------------------------------------------
    // Calls
    // -------------------------------------------------------------------------

    fn lower_invoke(
        &mut self,
        id: InstrId,
        result_kind: Kind,
        invoke_kind: InvokeKind,
        target: &MethodRef,
        args: &[InstrId],
    ) -> CompileResult<()> {
        let info = self.require_info(id)?;
        // Receiver null check for dispatched calls.
        if invoke_kind != InvokeKind::Static {
            let receiver = args[0];
            let receiver_op = self.load_to_var(receiver);
            self.null_check(receiver, &receiver_op, id);
        }

        // The runtime may supply a dispatch snippet; its placement
        // relative to argument materialization is configurable.
        let snippet = match invoke_kind {
            InvokeKind::Static => self.xir.gen_invoke_static(target),
            InvokeKind::Special => self.xir.gen_invoke_special(XirArgument::Value(args[0]), target),
            InvokeKind::Virtual => self.xir.gen_invoke_virtual(XirArgument::Value(args[0]), target),
            InvokeKind::Interface => {
                self.xir.gen_invoke_interface(XirArgument::Value(args[0]), target)
            }
        };
        let mut snippet_result = Operand::Illegal;
        let mut emit_snippet = |gen: &mut Self| {
            if let Some(snippet) = snippet.clone() {
                let snippet_args = gen.resolve_xir_args(&snippet);
                snippet_result = gen.emit_xir(snippet, snippet_args, None, None);
            }
        };
        if !self.options.invoke_snippet_after_arguments {
            emit_snippet(self);
        }

        let kinds: Vec<Kind> = target.argument_kinds().iter().map(|k| k.stack_kind()).collect();
        let arg_ops: Vec<Operand> = args.iter().map(|&a| self.operand_of(a)).collect();
        let mut pointer_slots: SmallVec<[i32; 2]> = SmallVec::new();
        let (abi_args, _) = self.move_call_args(&arg_ops, &kinds, &mut pointer_slots);

        if self.options.invoke_snippet_after_arguments {
            emit_snippet(self);
        }

        // Dispatch address: a snippet-computed entry point when the
        // runtime provided one, otherwise the built-in dispatch load.
        let addr = if snippet_result.is_legal() {
            Some(snippet_result)
        } else {
            match invoke_kind {
                InvokeKind::Virtual | InvokeKind::Interface => {
                    let receiver_op = self.operand_of(args[0]);
                    let hub = self.pool.new_variable(Kind::Word);
                    self.cur.push(LirOp::Load {
                        addr: Address::base_disp(
                            receiver_op,
                            self.runtime.hub_offset(),
                            Kind::Word,
                        ),
                        dst: hub.clone(),
                        info: None,
                    });
                    let entry = self.pool.new_variable(Kind::Word);
                    let selector = self.runtime.dispatch_entry_offset(target);
                    self.cur.push(LirOp::Load {
                        addr: Address::base_disp(hub, selector, Kind::Word),
                        dst: entry.clone(),
                        info: None,
                    });
                    Some(entry)
                }
                _ => None,
            }
        };

        let result = match call_conv::result_location(result_kind) {
            Some(reg) => self.pool.new_fixed(result_kind, reg),
            None => Operand::Illegal,
        };
        match addr {
            Some(addr) => self.cur.push(LirOp::CallIndirect {
                target: target.clone(),
                addr,
                args: abi_args,
                result: result.clone(),
                info,
                pointer_slots,
            }),
            None => self.cur.push(LirOp::CallDirect {
                target: target.clone(),
                args: abi_args,
                result: result.clone(),
                info,
                pointer_slots,
            }),
        }
        if result.is_legal() {
            let dst = self.result_var(id, result_kind);
            self.cur.push(LirOp::Move { src: result, dst });
        }
        Ok(())
    }

    /// Move argument operands into their ABI locations. Returns the fixed
    /// operands (for lifetime tracking) and fills `pointer_slots` with the
    /// outgoing stack slots that hold references.
    fn move_call_args(
        &mut self,
        arg_ops: &[Operand],
        kinds: &[Kind],
        pointer_slots: &mut SmallVec<[i32; 2]>,
    ) -> (Vec<Operand>, u32) {
        let locs = call_conv::locations_for(
            CallConv::Optimized,
            kinds,
            self.target.stack_alignment,
        );
        self.outgoing_bytes = self.outgoing_bytes.max(locs.overflow_bytes);
        let mut abi_args = Vec::with_capacity(arg_ops.len());
        for ((op, &kind), loc) in arg_ops.iter().zip(kinds).zip(&locs.locations) {
            match *loc {
                ArgLocation::Reg(reg) => {
                    let fixed = self.pool.new_fixed(kind, reg);
                    self.cur.push(LirOp::Move {
                        src: op.clone(),
                        dst: fixed.clone(),
                    });
                    abi_args.push(fixed);
                }
                ArgLocation::Stack(offset) => {
                    if kind.is_object() {
                        pointer_slots.push(offset / 8);
                    }
                    self.cur.push(LirOp::Store {
                        src: op.clone(),
                        addr: Address::base_disp(
                            Operand::Reg {
                                reg: Reg::Gpr(self.target.stack_ptr),
                                kind: Kind::Word,
                            },
                            offset,
                            kind,
                        ),
                        info: None,
                    });
                }
            }
        }
        (abi_args, locs.overflow_bytes)
    }

    fn runtime_call_value(
        &mut self,
        id: InstrId,
        call: RuntimeCall,
        args: Vec<Operand>,
        result_kind: Kind,
    ) {
        let kinds: Vec<Kind> = args.iter().map(|a| a.kind()).collect();
        let (abi_args, _) = self.move_call_args(&args, &kinds, &mut SmallVec::new());
        let reg = call_conv::result_location(result_kind).expect("value call has a result");
        let fixed = self.pool.new_fixed(result_kind, reg);
        self.cur.push(LirOp::CallRuntime {
            call,
            args: abi_args,
            result: fixed.clone(),
            info: self.debug_info(id),
        });
        let dst = self.result_var(id, result_kind);
        self.cur.push(LirOp::Move { src: fixed, dst });
    }

    fn runtime_call_effect(&mut self, id: InstrId, call: RuntimeCall, args: Vec<Operand>) {
        let kinds: Vec<Kind> = args.iter().map(|a| a.kind()).collect();
        let (abi_args, _) = self.move_call_args(&args, &kinds, &mut SmallVec::new());
        self.cur.push(LirOp::CallRuntime {
            call,
            args: abi_args,
            result: Operand::Illegal,
            info: self.debug_info(id),
        });
    }

    // -------------------------------------------------------------------------
    // Intrinsics
    // -------------------------------------------------------------------------

    fn lower_intrinsic(
        &mut self,
        id: InstrId,
        kind: Kind,
        intrinsic: IntrinsicId,
        args: &[InstrId],
    ) -> CompileResult<()> {
        match intrinsic {
            IntrinsicId::MathSqrt => {
                let src = self.load_to_var(args[0]);
                let dst = self.result_var(id, kind);
                self.cur.push(LirOp::Sqrt { src, dst });
            }
            IntrinsicId::MathAbs => {
                let src = self.load_to_var(args[0]);
                let dst = self.result_var(id, kind);
                self.cur.push(LirOp::Abs { src, dst });
            }
            IntrinsicId::MathSin
            | IntrinsicId::MathCos
            | IntrinsicId::MathTan
            | IntrinsicId::MathLog
            | IntrinsicId::MathLog10 => {
                let call = match intrinsic {
                    IntrinsicId::MathSin => RuntimeCall::Sin,
                    IntrinsicId::MathCos => RuntimeCall::Cos,
                    IntrinsicId::MathTan => RuntimeCall::Tan,
                    IntrinsicId::MathLog => RuntimeCall::Log,
                    _ => RuntimeCall::Log10,
                };
                let arg = self.operand_of(args[0]);
                self.runtime_call_value(id, call, vec![arg], kind);
            }
            IntrinsicId::NanoTime | IntrinsicId::CurrentTimeMillis => {
                let call = if intrinsic == IntrinsicId::NanoTime {
                    RuntimeCall::NanoTime
                } else {
                    RuntimeCall::CurrentTimeMillis
                };
                self.runtime_call_value(id, call, vec![], kind);
            }
            IntrinsicId::FloatToRawIntBits
            | IntrinsicId::IntBitsToFloat
            | IntrinsicId::DoubleToRawLongBits
            | IntrinsicId::LongBitsToDouble => {
                // Bit-pattern moves go through the scratch spill slot.
                let (src_kind, dst_kind) = match intrinsic {
                    IntrinsicId::FloatToRawIntBits => (Kind::Float, Kind::Int),
                    IntrinsicId::IntBitsToFloat => (Kind::Int, Kind::Float),
                    IntrinsicId::DoubleToRawLongBits => (Kind::Double, Kind::Long),
                    _ => (Kind::Long, Kind::Double),
                };
                let src = self.load_to_var(args[0]);
                self.cur.push(LirOp::Move {
                    src,
                    dst: Operand::Stack {
                        slot: SCRATCH_SLOT,
                        kind: src_kind,
                        caller_frame: false,
                    },
                });
                let dst = self.result_var(id, dst_kind);
                self.cur.push(LirOp::Move {
                    src: Operand::Stack {
                        slot: SCRATCH_SLOT,
                        kind: dst_kind,
                        caller_frame: false,
                    },
                    dst,
                });
            }
            IntrinsicId::CompareAndSwapInt
            | IntrinsicId::CompareAndSwapLong
            | IntrinsicId::CompareAndSwapObject => {
                // args: unsafe handle, object, offset, expected, new value.
                let value_kind = match intrinsic {
                    IntrinsicId::CompareAndSwapInt => Kind::Int,
                    IntrinsicId::CompareAndSwapLong => Kind::Long,
                    _ => Kind::Object,
                };
                let obj = self.load_to_var(args[1]);
                let offset = self.load_to_var(args[2]);
                let expected_in = self.operand_of(args[3]);
                let new_value = self.load_to_var(args[4]);
                let expected = self.pool.new_fixed(value_kind, Reg::Gpr(Gpr::Rax));
                self.cur.push(LirOp::Move {
                    src: expected_in,
                    dst: expected.clone(),
                });
                let addr = Address::indexed(obj, offset, Scale::S1, 0, value_kind);
                let result = self.result_var(id, Kind::Int);
                self.cur.push(LirOp::CompareAndSwap {
                    addr,
                    expected,
                    new_value,
                    result,
                });
            }
            IntrinsicId::ObjectInit => {}
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // XIR weaving
    // -------------------------------------------------------------------------

    /// Resolve a snippet's declared arguments to operands.
    fn resolve_xir_args(&mut self, snippet: &XirSnippet) -> Vec<Operand> {
        snippet
            .args
            .iter()
            .map(|arg| match arg {
                XirArgument::Constant(v) => Operand::Const(*v),
                XirArgument::Value(id) => self.operand_of(*id),
            })
            .collect()
    }

    /// Allocate operands for every template variable and append the
    /// instance. Input-temps are copied into fresh variables so the
    /// argument value survives the template's writes; fixed registers are
    /// registered as allocation constraints.
    fn emit_xir(
        &mut self,
        snippet: XirSnippet,
        arg_operands: Vec<Operand>,
        info: Option<DebugInfo>,
        result_to: Option<InstrId>,
    ) -> Operand {
        let template = snippet.template.clone();
        let params = template.parameter_indices();
        debug_assert_eq!(params.len(), arg_operands.len());
        let mut operands = vec![Operand::Illegal; template.operands.len()];

        for (param_pos, &operand_index) in params.iter().enumerate() {
            let def = &template.operands[operand_index];
            let incoming = arg_operands[param_pos].clone();
            operands[operand_index] = match def.role {
                XirRole::Input => incoming,
                XirRole::InputTemp => {
                    let copy = match def.fixed {
                        Some(reg) => self.pool.new_fixed(def.kind, reg),
                        None => self.pool.new_variable(def.kind),
                    };
                    self.cur.push(LirOp::Move {
                        src: incoming,
                        dst: copy.clone(),
                    });
                    copy
                }
                _ => unreachable!("parameter indices only name inputs"),
            };
        }
        for (i, def) in template.operands.iter().enumerate() {
            if operands[i].is_legal() {
                continue;
            }
            operands[i] = match &def.role {
                XirRole::Temp => match def.fixed {
                    Some(reg) => self.pool.new_fixed(def.kind, reg),
                    None => self.pool.new_variable(def.kind),
                },
                XirRole::Result => {
                    let dst = match result_to {
                        Some(id) => self.result_var(id, def.kind),
                        None => self.pool.new_variable(def.kind),
                    };
                    dst
                }
                XirRole::Constant(v) => Operand::Const(*v),
                XirRole::Input | XirRole::InputTemp => Operand::Illegal,
            };
        }
        let result = template
            .result
            .map(|i| operands[i].clone())
            .unwrap_or(Operand::Illegal);
        self.cur.push(LirOp::Xir(Box::new(XirInstance {
            snippet,
            operands,
            result: result.clone(),
            info,
        })));
        result
    }

    // -------------------------------------------------------------------------
    // Switch emission
    // -------------------------------------------------------------------------

    /// Compare chain over switch ranges: single keys take one equality
    /// branch, two-key ranges take two, wider ranges skip below the low
    /// bound and take at or below the high bound. The default successor is
    /// jumped last.
    fn emit_switch_ranges(
        &mut self,
        ranges: &[SwitchRange],
        value: Operand,
        default: BlockId,
    ) {
        for range in ranges {
            let dest = BranchTarget::Block(range.sux);
            if range.low_key == range.high_key {
                self.cur.push(LirOp::Cmp {
                    left: value.clone(),
                    right: Operand::Const(ConstValue::Int(range.low_key)),
                });
                self.cur.push(LirOp::Branch { cond: Cond::Eq, target: dest });
            } else if range.width() == 2 {
                for key in [range.low_key, range.high_key] {
                    self.cur.push(LirOp::Cmp {
                        left: value.clone(),
                        right: Operand::Const(ConstValue::Int(key)),
                    });
                    self.cur.push(LirOp::Branch { cond: Cond::Eq, target: dest });
                }
            } else {
                let skip = self.cur.new_label();
                self.cur.push(LirOp::Cmp {
                    left: value.clone(),
                    right: Operand::Const(ConstValue::Int(range.low_key)),
                });
                self.cur.push(LirOp::Branch {
                    cond: Cond::Lt,
                    target: BranchTarget::Local(skip),
                });
                self.cur.push(LirOp::Cmp {
                    left: value.clone(),
                    right: Operand::Const(ConstValue::Int(range.high_key)),
                });
                self.cur.push(LirOp::Branch { cond: Cond::Le, target: dest });
                self.cur.push(LirOp::Label(skip));
            }
        }
        self.cur.push(LirOp::Jump {
            target: BranchTarget::Block(default),
        });
    }

    // -------------------------------------------------------------------------
    // Phis
    // -------------------------------------------------------------------------

    /// Move this block's outgoing values into the successor's phis.
    fn move_to_phis(&mut self, sux: BlockId) {
        if self.hir.block(sux).pred_count() <= 1 {
            return;
        }
        let Some(sid) = self.hir.block(sux).state_before else {
            return;
        };
        let cur_block = self.cur.block;
        let pred_index = self
            .hir
            .block(sux)
            .preds
            .iter()
            .position(|&p| p == cur_block)
            .expect("edge block is a predecessor of its successor");

        // Collect (input, phi) pairs first; operand_of may allocate.
        let mut pairs: Vec<(InstrId, InstrId)> = Vec::new();
        let state = self.hir.state(sid);
        let mut seen = Vec::new();
        state.for_each_value(|v| seen.push(v));
        for v in seen {
            if let InstrOp::Phi { block, inputs, .. } = &self.hir.instr(v).op {
                if *block == sux {
                    pairs.push((inputs[pred_index], v));
                }
            }
        }

        let mut moves: Vec<(Operand, Operand)> = Vec::new();
        for (input, phi) in pairs {
            let src = self.operand_of(input);
            let dst = self.operand_of(phi);
            moves.push((src, dst));
        }
        let mut resolver = PhiResolver::new(&mut self.pool);
        for (src, dst) in moves {
            resolver.add(src, dst);
        }
        let mut out = Vec::new();
        resolver.resolve(&mut out);
        for op in out {
            self.cur.push(op);
        }
    }

    // -------------------------------------------------------------------------
    // Operand plumbing
    // -------------------------------------------------------------------------

    /// The operand of a value, materializing constants, locals and phis
    /// lazily.
    fn operand_of(&mut self, id: InstrId) -> Operand {
        let instr = self.hir.instr(id);
        if instr.operand.is_legal() {
            return instr.operand.clone();
        }
        match &instr.op {
            InstrOp::Constant(v) => {
                let v = *v;
                if self.options.test_patching && matches!(v, ConstValue::Object(_)) {
                    // Forced patching path: object constants resolve at
                    // runtime instead of embedding directly.
                    let kinds = [Kind::Object];
                    let (abi_args, _) = self.move_call_args(
                        &[Operand::Const(v)],
                        &kinds,
                        &mut SmallVec::new(),
                    );
                    let fixed = self.pool.new_fixed(Kind::Object, Reg::Gpr(Gpr::Rax));
                    self.cur.push(LirOp::CallRuntime {
                        call: RuntimeCall::ResolveClass,
                        args: abi_args,
                        result: fixed.clone(),
                        info: None,
                    });
                    let dst = self.pool.new_variable(Kind::Object);
                    self.cur.push(LirOp::Move {
                        src: fixed,
                        dst: dst.clone(),
                    });
                    self.hir.instr_mut(id).operand = dst.clone();
                    return dst;
                }
                let op = Operand::Const(v);
                self.hir.instr_mut(id).operand = op.clone();
                op
            }
            InstrOp::Local { .. } | InstrOp::Phi { .. } => {
                let kind = instr.kind;
                let var = self.pool.new_variable(kind);
                self.hir.instr_mut(id).operand = var.clone();
                var
            }
            other => panic!("operand of {id} requested before its definition ({other:?})"),
        }
    }

    /// Like `operand_of`, but constants are loaded into a variable.
    fn load_to_var(&mut self, id: InstrId) -> Operand {
        let op = self.operand_of(id);
        if op.is_const() {
            let kind = op.kind();
            let var = self.pool.new_variable(kind);
            self.cur.push(LirOp::Move {
                src: op,
                dst: var.clone(),
            });
            var
        } else {
            op
        }
    }

    fn const_to_var(&mut self, value: ConstValue) -> Operand {
        let var = self.pool.new_variable(value.kind());
        self.cur.push(LirOp::Move {
            src: Operand::Const(value),
            dst: var.clone(),
        });
        var
    }

    /// Allocate and bind the result variable of an instruction.
    fn result_var(&mut self, id: InstrId, kind: Kind) -> Operand {
        let var = self.pool.new_variable(kind);
        self.hir.instr_mut(id).operand = var.clone();
        var
    }

    fn null_check(&mut self, obj: InstrId, obj_op: &Operand, site: InstrId) {
        let flags = self.hir.instr(obj).flags;
        if flags.contains(InstrFlags::NON_NULL)
            || self
                .hir
                .instr(site)
                .flags
                .contains(InstrFlags::NO_NULL_CHECK)
        {
            return;
        }
        if let Some(c) = obj_op.as_const() {
            if !c.is_null() {
                return;
            }
        }
        let Some(info) = self.debug_info(site) else {
            return;
        };
        self.cur.push(LirOp::NullCheck {
            value: obj_op.clone(),
            info,
        });
    }

    fn membar(&mut self, barriers: MemoryBarriers) {
        let required = self.target.required_barriers(barriers);
        if !required.is_empty() {
            self.cur.push(LirOp::Membar { barriers: required });
        }
    }

    fn debug_info(&self, id: InstrId) -> Option<DebugInfo> {
        let instr = self.hir.instr(id);
        instr.state.map(|state| DebugInfo {
            state,
            handlers: instr.handlers.clone(),
            bci: instr.bci,
        })
    }

    fn require_info(&self, id: InstrId) -> CompileResult<DebugInfo> {
        self.debug_info(id).ok_or_else(|| {
            Bailout::invariant(format!(
                "instruction {id} needs debug info but carries no state"
            ))
        })
    }
}

fn zero_of(kind: Kind) -> Operand {
    Operand::Const(match kind {
        Kind::Long => ConstValue::Long(0),
        _ => ConstValue::Int(0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hir::builder::build_graph;
    use crate::runtime::{HostRuntime, Method, MethodCode, MethodFlags, TablePool};
    use crate::xir::GenericXir;
    use opal_core::bytecode::opcodes::*;
    use opal_core::Signature;
    use std::sync::Arc;

    fn lower(descriptor: &str, code: Vec<u8>, max_stack: u16, max_locals: u16) -> (Hir, Lir) {
        let method = Arc::new(
            Method::new(
                "t/T",
                "m",
                Signature::parse(descriptor).unwrap(),
                MethodFlags::STATIC,
            )
            .with_code(MethodCode {
                bytecode: code,
                max_stack,
                max_locals,
                handlers: vec![],
                pool: Arc::new(TablePool::new()),
            }),
        );
        let options = Options::default();
        let runtime = HostRuntime;
        let mut hir = build_graph(&method, &runtime, &options, None).unwrap();
        let target = Target::x64();
        let xir = GenericXir::new(Arc::new(HostRuntime), 0x100000);
        let lir = generate(&mut hir, &method, &target, &options, &runtime, &xir).unwrap();
        (hir, lir)
    }

    fn all_ops(lir: &Lir) -> Vec<&LirOp> {
        lir.lists.iter().flat_map(|l| l.ops.iter()).collect()
    }

    #[test]
    fn test_add_lowers_to_two_operand_form() {
        let (_, lir) = lower("(II)I", vec![ILOAD_0, ILOAD_1, IADD, IRETURN], 2, 2);
        let ops = all_ops(&lir);
        let arith = ops
            .iter()
            .find_map(|op| match op {
                LirOp::Arith { op: ArithOp::Add, left, dst, .. } => Some((left, dst)),
                _ => None,
            })
            .expect("add emitted");
        // Two-operand: destination aliases the left input.
        assert_eq!(arith.0, arith.1);
        // The return value lands in the shared result register.
        assert!(ops.iter().any(|op| matches!(op, LirOp::Return { value: Some(_) })));
    }

    #[test]
    fn test_parameters_materialize_from_abi() {
        let (hir, lir) = lower("(II)I", vec![ILOAD_0, ILOAD_1, IADD, IRETURN], 2, 2);
        let start_list = lir.list_for(hir.start_block).unwrap();
        // Two moves out of RDI/RSI precede everything else.
        let mut regs = Vec::new();
        for op in &start_list.ops {
            if let LirOp::Move { src: Operand::Reg { reg, .. }, .. } = op {
                regs.push(*reg);
            }
        }
        assert_eq!(regs, vec![Reg::Gpr(Gpr::Rdi), Reg::Gpr(Gpr::Rsi)]);
    }

    #[test]
    fn test_division_pins_rax_and_checks_zero() {
        let (_, lir) = lower("(II)I", vec![ILOAD_0, ILOAD_1, IDIV, IRETURN], 2, 2);
        let ops = all_ops(&lir);
        assert!(ops.iter().any(|op| matches!(
            op,
            LirOp::BranchStub { stub: StubId::ThrowDivisionByZero, .. }
        )));
        let div_dst = ops
            .iter()
            .find_map(|op| match op {
                LirOp::Arith { op: ArithOp::Div, dst, .. } => dst.as_var(),
                _ => None,
            })
            .expect("div emitted");
        assert_eq!(lir.pool.fixed_binding(div_dst), Some(Reg::Gpr(Gpr::Rax)));
    }

    #[test]
    fn test_loop_emits_phi_moves_and_safepoint() {
        let code = vec![
            ICONST_0, ISTORE_1, ICONST_0, ISTORE_2, ILOAD_2, ILOAD_0, IF_ICMPGE, 0, 13,
            ILOAD_1, ILOAD_2, IADD, ISTORE_1, IINC, 2, 1, GOTO, 0xff, (-12i8) as u8,
            ILOAD_1, IRETURN,
        ];
        let (_, lir) = lower("(I)I", code, 2, 3, );
        let ops = all_ops(&lir);
        // The generic safepoint template expands to an Xir op.
        assert!(ops.iter().any(|op| matches!(op, LirOp::Xir(_))));
        // Phi moves exist somewhere (entry edge seeds s and i with 0).
        let const_moves = ops
            .iter()
            .filter(|op| {
                matches!(
                    op,
                    LirOp::Move { src: Operand::Const(ConstValue::Int(0)), dst: Operand::Var { .. } }
                )
            })
            .count();
        assert!(const_moves >= 2, "phi seeds for s and i");
    }

    #[test]
    fn test_volatile_store_emits_storeload_only() {
        use crate::runtime::{ClassInfo, FieldRef};
        // putfield of a volatile int field.
        let holder = Arc::new(ClassInfo {
            name: "t/T".into(),
            id: 1,
            elem_kind: None,
        });
        let field = FieldRef {
            holder,
            name: "v".into(),
            kind: Kind::Int,
            offset: 16,
            is_static: false,
            is_volatile: true,
        };
        let mut pool = TablePool::new();
        pool.set_field(1, field);
        let method = Arc::new(
            Method::new(
                "t/T",
                "m",
                Signature::parse("(Lt/T;I)V").unwrap(),
                MethodFlags::STATIC,
            )
            .with_code(MethodCode {
                bytecode: vec![ALOAD_0, ILOAD_1, PUTFIELD, 0, 1, RETURN],
                max_stack: 2,
                max_locals: 2,
                handlers: vec![],
                pool: Arc::new(pool),
            }),
        );
        let options = Options::default();
        let runtime = HostRuntime;
        let mut hir = build_graph(&method, &runtime, &options, None).unwrap();
        let target = Target::x64();
        let xir = GenericXir::new(Arc::new(HostRuntime), 0x100000);
        let lir = generate(&mut hir, &method, &target, &options, &runtime, &xir).unwrap();
        let membars: Vec<MemoryBarriers> = all_ops(&lir)
            .iter()
            .filter_map(|op| match op {
                LirOp::Membar { barriers } => Some(*barriers),
                _ => None,
            })
            .collect();
        // On TSO only the post-write STORE_LOAD fence survives.
        assert_eq!(membars, vec![MemoryBarriers::STORE_LOAD]);
    }

    #[test]
    fn test_bounds_check_uses_unsigned_compare() {
        let code = vec![ALOAD_0, ILOAD_1, IALOAD, IRETURN];
        let (_, lir) = lower("([II)I", code, 2, 2);
        let ops = all_ops(&lir);
        assert!(ops.iter().any(|op| matches!(
            op,
            LirOp::BranchStub { cond: Cond::AboveEqual, stub: StubId::ThrowBoundsCheck, .. }
        )));
        assert!(ops.iter().any(|op| matches!(op, LirOp::NullCheck { .. })));
    }

    #[test]
    fn test_outgoing_object_stack_args_recorded() {
        // Seven arguments: six ints fill the registers, the trailing
        // object lands in outgoing stack slot 0 and must be in the
        // pointer-slot list.
        let callee = Arc::new(Method::new(
            "t/Other",
            "take",
            Signature::parse("(IIIIIILjava/lang/Object;)V").unwrap(),
            MethodFlags::STATIC,
        ));
        let mut pool = TablePool::new();
        pool.set_method(1, callee);
        let code = vec![
            ILOAD_0, ILOAD_1, ILOAD_2, ILOAD_3, ILOAD, 4, ILOAD, 5, ALOAD, 6,
            INVOKESTATIC, 0, 1, RETURN,
        ];
        let method = Arc::new(
            Method::new(
                "t/T",
                "m",
                Signature::parse("(IIIIIILjava/lang/Object;)V").unwrap(),
                MethodFlags::STATIC,
            )
            .with_code(MethodCode {
                bytecode: code,
                max_stack: 7,
                max_locals: 7,
                handlers: vec![],
                pool: Arc::new(pool),
            }),
        );
        let options = Options::default();
        let runtime = HostRuntime;
        let mut hir = build_graph(&method, &runtime, &options, None).unwrap();
        let target = Target::x64();
        let xir = GenericXir::new(Arc::new(HostRuntime), 0x100000);
        let lir = generate(&mut hir, &method, &target, &options, &runtime, &xir).unwrap();
        let slots = all_ops(&lir)
            .iter()
            .find_map(|op| match op {
                LirOp::CallDirect { pointer_slots, .. } => Some(pointer_slots.clone()),
                _ => None,
            })
            .expect("direct call emitted");
        // Exactly the object-kinded outgoing slot, nothing else.
        assert_eq!(slots.as_slice(), &[0]);
    }

    #[test]
    fn test_switch_ranges_compare_chain() {
        // tableswitch 0..=1 -> A, default C. Ranges: one two-key range.
        let mut code = vec![ILOAD_0, TABLESWITCH, 0, 0];
        code.extend_from_slice(&27i32.to_be_bytes()); // default -> 28
        code.extend_from_slice(&0i32.to_be_bytes());
        code.extend_from_slice(&1i32.to_be_bytes());
        code.extend_from_slice(&23i32.to_be_bytes()); // key 0 -> 24
        code.extend_from_slice(&23i32.to_be_bytes()); // key 1 -> 24
        code.extend_from_slice(&[ICONST_1, IRETURN, NOP, NOP, ICONST_0, IRETURN]);
        assert_eq!(code.len(), 30);
        let (_, lir) = lower("(I)I", code, 1, 1);
        let ops = all_ops(&lir);
        // A two-key range is two equality branches, not three compares.
        let eq_branches = ops
            .iter()
            .filter(|op| matches!(op, LirOp::Branch { cond: Cond::Eq, .. }))
            .count();
        assert_eq!(eq_branches, 2);
    }
}
