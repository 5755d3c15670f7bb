//! Low-level IR.
//!
//! A target-abstract linear operation list over virtual operands, one list
//! per block. Operations that can trap or stop carry [`DebugInfo`]
//! referencing a frame-state snapshot; the emitter turns that into the
//! safepoint and exception side tables of the target method.

pub mod gen;
pub mod operand;
pub mod phi_resolver;
pub mod switches;

use smallvec::SmallVec;

use crate::hir::{ArithOp, BlockId, CmpVariant, Cond, Conversion, HandlerEdge, LogicOp, ShiftOp, StateId};
use crate::lir::operand::{Address, Operand, OperandPool};
use crate::runtime::MethodRef;
use crate::target::MemoryBarriers;
use crate::xir::XirSnippet;

/// Identifiers of the shared out-of-line stubs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StubId {
    ThrowNullPointer,
    ThrowBoundsCheck,
    ThrowDivisionByZero,
    ThrowClassCast,
    ThrowArrayStore,
}

impl StubId {
    /// The runtime call a stub forwards to.
    pub const fn runtime_call(self) -> RuntimeCall {
        match self {
            StubId::ThrowNullPointer => RuntimeCall::ThrowNullPointer,
            StubId::ThrowBoundsCheck => RuntimeCall::ThrowBoundsCheck,
            StubId::ThrowDivisionByZero => RuntimeCall::ThrowDivisionByZero,
            StubId::ThrowClassCast => RuntimeCall::ThrowClassCast,
            StubId::ThrowArrayStore => RuntimeCall::ThrowArrayStore,
        }
    }
}

/// Calls into the runtime, identified by a stable numeric id in the target
/// method's side tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeCall {
    Sin,
    Cos,
    Tan,
    Log,
    Log10,
    Frem,
    Drem,
    NanoTime,
    CurrentTimeMillis,
    NewInstance,
    NewArray,
    NewMultiArray,
    MonitorEnter,
    MonitorExit,
    Throw,
    ThrowNullPointer,
    ThrowBoundsCheck,
    ThrowDivisionByZero,
    ThrowClassCast,
    ThrowArrayStore,
    ResolveClass,
    InstanceOf,
    CheckCast,
    ArrayStoreCheck,
    WriteBarrier,
}

impl RuntimeCall {
    /// Stable id recorded in side tables.
    pub const fn id(self) -> u16 {
        self as u16
    }
}

/// Debug info attached to stops: the frame-state snapshot to deoptimize
/// from, plus the exception handlers covering the instruction.
#[derive(Debug, Clone)]
pub struct DebugInfo {
    pub state: StateId,
    /// Handlers covering this site, innermost first.
    pub handlers: SmallVec<[HandlerEdge; 1]>,
    /// Originating bytecode index.
    pub bci: u32,
}

/// A label local to one block's operation list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocalLabel(pub u32);

/// A branch destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchTarget {
    /// Another block's entry.
    Block(BlockId),
    /// A label inside the current list.
    Local(LocalLabel),
}

/// Operand role, for allocator visitation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandRole {
    Use,
    Def,
}

/// One low-level operation.
#[derive(Debug, Clone)]
pub enum LirOp {
    /// Bind a local label here.
    Label(LocalLabel),
    /// `dst <- src`. Also materializes constants.
    Move { src: Operand, dst: Operand },
    /// `dst <- [addr]`.
    Load {
        addr: Address,
        dst: Operand,
        info: Option<DebugInfo>,
    },
    /// `[addr] <- src`.
    Store {
        src: Operand,
        addr: Address,
        info: Option<DebugInfo>,
    },
    /// `dst <- &addr`.
    Lea { addr: Address, dst: Operand },
    /// Two-operand arithmetic: `dst (== left) <- left op right`. Integer
    /// division carries debug info for the zero check.
    Arith {
        op: ArithOp,
        left: Operand,
        right: Operand,
        dst: Operand,
        info: Option<DebugInfo>,
    },
    /// `dst (== value) <- value shift count`.
    Shift {
        op: ShiftOp,
        value: Operand,
        count: Operand,
        dst: Operand,
    },
    /// `dst (== left) <- left op right`.
    Logic {
        op: LogicOp,
        left: Operand,
        right: Operand,
        dst: Operand,
    },
    /// `dst (== value) <- -value`.
    Neg { value: Operand, dst: Operand },
    /// Primitive conversion.
    Convert {
        op: Conversion,
        src: Operand,
        dst: Operand,
    },
    /// Compare, setting condition flags for a following branch/cmove.
    Cmp { left: Operand, right: Operand },
    /// Three-way comparison producing -1/0/+1 in `dst`.
    Cmp3 {
        variant: CmpVariant,
        left: Operand,
        right: Operand,
        dst: Operand,
    },
    /// Conditional branch on the current flags.
    Branch { cond: Cond, target: BranchTarget },
    /// Unconditional jump.
    Jump { target: BranchTarget },
    /// Conditional branch to a shared throw stub.
    BranchStub {
        cond: Cond,
        stub: StubId,
        info: DebugInfo,
    },
    /// Conditional move on the current flags: `dst <- cond ? tval : fval`.
    Cmove {
        cond: Cond,
        tval: Operand,
        fval: Operand,
        dst: Operand,
    },
    /// Call with a compile-time-known target.
    CallDirect {
        target: MethodRef,
        /// Arguments already moved to their ABI locations; listed so their
        /// lifetimes reach the call.
        args: Vec<Operand>,
        result: Operand,
        info: DebugInfo,
        /// Outgoing stack slots holding object references.
        pointer_slots: SmallVec<[i32; 2]>,
    },
    /// Call through a computed address (vtable/itable dispatch).
    CallIndirect {
        target: MethodRef,
        addr: Operand,
        /// Arguments already moved to their ABI locations.
        args: Vec<Operand>,
        result: Operand,
        info: DebugInfo,
        /// Outgoing stack slots holding object references.
        pointer_slots: SmallVec<[i32; 2]>,
    },
    /// Call into the runtime.
    CallRuntime {
        call: RuntimeCall,
        args: Vec<Operand>,
        result: Operand,
        info: Option<DebugInfo>,
    },
    /// An expanded runtime-supplied template.
    Xir(Box<XirInstance>),
    /// Memory fence.
    Membar { barriers: MemoryBarriers },
    /// Safepoint poll.
    SafepointPoll { info: DebugInfo },
    /// Record a stop position without polling.
    InfoPoint { info: DebugInfo },
    /// Explicit null check of an operand.
    NullCheck { value: Operand, info: DebugInfo },
    /// `dst <- sqrt(src)`.
    Sqrt { src: Operand, dst: Operand },
    /// `dst <- |src|` (floating point).
    Abs { src: Operand, dst: Operand },
    /// Atomic compare-and-swap at `addr`; `expected` and `result` are
    /// pinned to the architecture's CAS register pair.
    CompareAndSwap {
        addr: Address,
        expected: Operand,
        new_value: Operand,
        result: Operand,
    },
    /// `dst <- address of the instruction itself`.
    CapturePc { dst: Operand },
    /// `dst <- address of a frame region` resolved at emission.
    FrameAddr { region: FrameRegion, dst: Operand },
    /// Return from the method.
    Return { value: Option<Operand> },
}

/// A frame region whose final offset only the emitter knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameRegion {
    /// Byte offset into the stack-allocation area.
    StackBlock { offset: i32 },
    /// A monitor slot by lock number.
    Monitor { index: u32 },
}

/// A bound XIR snippet with operands resolved for every template variable.
#[derive(Debug, Clone)]
pub struct XirInstance {
    pub snippet: XirSnippet,
    /// One operand per template variable, indexed by the template's
    /// operand ids.
    pub operands: Vec<Operand>,
    /// The result operand, `Illegal` when the template has none.
    pub result: Operand,
    pub info: Option<DebugInfo>,
}

impl LirOp {
    /// Visit every operand with its role. Addresses contribute their base
    /// and index as uses.
    pub fn for_each_operand(&self, mut f: impl FnMut(&Operand, OperandRole)) {
        fn addr(a: &Address, f: &mut impl FnMut(&Operand, OperandRole)) {
            f(&a.base, OperandRole::Use);
            if let Some(index) = &a.index {
                f(index, OperandRole::Use);
            }
        }
        match self {
            LirOp::Label(_)
            | LirOp::Branch { .. }
            | LirOp::Jump { .. }
            | LirOp::BranchStub { .. }
            | LirOp::Membar { .. }
            | LirOp::SafepointPoll { .. }
            | LirOp::InfoPoint { .. } => {}
            LirOp::Move { src, dst } => {
                f(src, OperandRole::Use);
                f(dst, OperandRole::Def);
            }
            LirOp::Sqrt { src, dst } | LirOp::Abs { src, dst } => {
                f(src, OperandRole::Use);
                f(dst, OperandRole::Def);
            }
            LirOp::CompareAndSwap {
                addr: a,
                expected,
                new_value,
                result,
            } => {
                addr(a, &mut f);
                f(expected, OperandRole::Use);
                f(new_value, OperandRole::Use);
                f(result, OperandRole::Def);
            }
            LirOp::CapturePc { dst } | LirOp::FrameAddr { dst, .. } => {
                f(dst, OperandRole::Def);
            }
            LirOp::Load { addr: a, dst, .. } => {
                addr(a, &mut f);
                f(dst, OperandRole::Def);
            }
            LirOp::Store { src, addr: a, .. } => {
                f(src, OperandRole::Use);
                addr(a, &mut f);
            }
            LirOp::Lea { addr: a, dst } => {
                addr(a, &mut f);
                f(dst, OperandRole::Def);
            }
            LirOp::Arith {
                left, right, dst, ..
            }
            | LirOp::Logic {
                left, right, dst, ..
            }
            | LirOp::Cmp3 {
                left, right, dst, ..
            } => {
                f(left, OperandRole::Use);
                f(right, OperandRole::Use);
                f(dst, OperandRole::Def);
            }
            LirOp::Shift {
                value, count, dst, ..
            } => {
                f(value, OperandRole::Use);
                f(count, OperandRole::Use);
                f(dst, OperandRole::Def);
            }
            LirOp::Neg { value, dst } => {
                f(value, OperandRole::Use);
                f(dst, OperandRole::Def);
            }
            LirOp::Convert { src, dst, .. } => {
                f(src, OperandRole::Use);
                f(dst, OperandRole::Def);
            }
            LirOp::Cmp { left, right } => {
                f(left, OperandRole::Use);
                f(right, OperandRole::Use);
            }
            LirOp::Cmove {
                tval, fval, dst, ..
            } => {
                f(tval, OperandRole::Use);
                f(fval, OperandRole::Use);
                f(dst, OperandRole::Def);
            }
            LirOp::CallDirect { args, result, .. } => {
                for arg in args {
                    f(arg, OperandRole::Use);
                }
                if result.is_legal() {
                    f(result, OperandRole::Def);
                }
            }
            LirOp::CallIndirect {
                addr, args, result, ..
            } => {
                f(addr, OperandRole::Use);
                for arg in args {
                    f(arg, OperandRole::Use);
                }
                if result.is_legal() {
                    f(result, OperandRole::Def);
                }
            }
            LirOp::CallRuntime { args, result, .. } => {
                for arg in args {
                    f(arg, OperandRole::Use);
                }
                if result.is_legal() {
                    f(result, OperandRole::Def);
                }
            }
            LirOp::Xir(instance) => {
                let template = &instance.snippet.template;
                for (i, operand) in instance.operands.iter().enumerate() {
                    if operand.is_legal() {
                        let role = if template.is_def(i) {
                            OperandRole::Def
                        } else {
                            OperandRole::Use
                        };
                        f(operand, role);
                    }
                }
                if instance.result.is_legal() {
                    f(&instance.result, OperandRole::Def);
                }
            }
            LirOp::NullCheck { value, .. } => f(value, OperandRole::Use),
            LirOp::Return { value } => {
                if let Some(v) = value {
                    f(v, OperandRole::Use);
                }
            }
        }
    }

    /// Visit every operand mutably (allocator rewrite).
    pub fn for_each_operand_mut(&mut self, mut f: impl FnMut(&mut Operand)) {
        fn addr(a: &mut Address, f: &mut impl FnMut(&mut Operand)) {
            f(&mut a.base);
            if let Some(index) = &mut a.index {
                f(index);
            }
        }
        match self {
            LirOp::Label(_)
            | LirOp::Branch { .. }
            | LirOp::Jump { .. }
            | LirOp::BranchStub { .. }
            | LirOp::Membar { .. }
            | LirOp::SafepointPoll { .. }
            | LirOp::InfoPoint { .. } => {}
            LirOp::Move { src, dst } => {
                f(src);
                f(dst);
            }
            LirOp::Sqrt { src, dst } | LirOp::Abs { src, dst } => {
                f(src);
                f(dst);
            }
            LirOp::CompareAndSwap {
                addr: a,
                expected,
                new_value,
                result,
            } => {
                addr(a, &mut f);
                f(expected);
                f(new_value);
                f(result);
            }
            LirOp::CapturePc { dst } | LirOp::FrameAddr { dst, .. } => f(dst),
            LirOp::Load { addr: a, dst, .. } => {
                addr(a, &mut f);
                f(dst);
            }
            LirOp::Store { src, addr: a, .. } => {
                f(src);
                addr(a, &mut f);
            }
            LirOp::Lea { addr: a, dst } => {
                addr(a, &mut f);
                f(dst);
            }
            LirOp::Arith {
                left, right, dst, ..
            }
            | LirOp::Logic {
                left, right, dst, ..
            }
            | LirOp::Cmp3 {
                left, right, dst, ..
            } => {
                f(left);
                f(right);
                f(dst);
            }
            LirOp::Shift {
                value, count, dst, ..
            } => {
                f(value);
                f(count);
                f(dst);
            }
            LirOp::Neg { value, dst } => {
                f(value);
                f(dst);
            }
            LirOp::Convert { src, dst, .. } => {
                f(src);
                f(dst);
            }
            LirOp::Cmp { left, right } => {
                f(left);
                f(right);
            }
            LirOp::Cmove {
                tval, fval, dst, ..
            } => {
                f(tval);
                f(fval);
                f(dst);
            }
            LirOp::CallDirect { args, result, .. } => {
                for arg in args {
                    f(arg);
                }
                f(result);
            }
            LirOp::CallIndirect {
                addr, args, result, ..
            } => {
                f(addr);
                for arg in args {
                    f(arg);
                }
                f(result);
            }
            LirOp::CallRuntime { args, result, .. } => {
                for arg in args {
                    f(arg);
                }
                f(result);
            }
            LirOp::Xir(instance) => {
                for operand in &mut instance.operands {
                    f(operand);
                }
                f(&mut instance.result);
            }
            LirOp::NullCheck { value, .. } => f(value),
            LirOp::Return { value } => {
                if let Some(v) = value {
                    f(v);
                }
            }
        }
    }

    /// Whether this op is a stop position (call, safepoint, or infopoint).
    pub fn is_stop(&self) -> bool {
        matches!(
            self,
            LirOp::CallDirect { .. }
                | LirOp::CallIndirect { .. }
                | LirOp::CallRuntime { .. }
                | LirOp::SafepointPoll { .. }
                | LirOp::InfoPoint { .. }
        )
    }
}

/// The operation list of one block.
#[derive(Debug, Clone)]
pub struct LirList {
    pub block: BlockId,
    pub ops: Vec<LirOp>,
    next_label: u32,
}

impl LirList {
    /// An empty list for a block.
    pub fn new(block: BlockId) -> LirList {
        LirList {
            block,
            ops: Vec::new(),
            next_label: 0,
        }
    }

    /// Append an operation.
    #[inline]
    pub fn push(&mut self, op: LirOp) {
        self.ops.push(op);
    }

    /// Allocate a fresh local label.
    pub fn new_label(&mut self) -> LocalLabel {
        let label = LocalLabel(self.next_label);
        self.next_label += 1;
        label
    }
}

/// The result of LIR generation: one list per lowered block, the operand
/// pool, the block linearization the backend will follow, and the frame
/// demands the emitter folds into the final layout.
#[derive(Debug)]
pub struct Lir {
    pub lists: Vec<LirList>,
    pub pool: OperandPool,
    /// Blocks in emission order (reverse postorder).
    pub order: Vec<BlockId>,
    /// Monitor slots the frame must reserve.
    pub monitor_count: u32,
    /// Bytes of the stack-allocation region.
    pub stack_alloc_bytes: u32,
    /// Largest outgoing-argument area any call needs, in bytes.
    pub outgoing_bytes: u32,
}

impl Lir {
    /// The list lowered for a block, if it was reachable.
    pub fn list_for(&self, block: BlockId) -> Option<&LirList> {
        self.lists.iter().find(|l| l.block == block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lir::operand::VarId;
    use opal_core::Kind;

    fn var(id: u32) -> Operand {
        Operand::Var {
            id: VarId(id),
            kind: Kind::Int,
        }
    }

    #[test]
    fn test_operand_visit_roles() {
        let op = LirOp::Arith {
            op: ArithOp::Add,
            left: var(0),
            right: var(1),
            dst: var(2),
            info: None,
        };
        let mut uses = 0;
        let mut defs = 0;
        op.for_each_operand(|_, role| match role {
            OperandRole::Use => uses += 1,
            OperandRole::Def => defs += 1,
        });
        assert_eq!((uses, defs), (2, 1));
    }

    #[test]
    fn test_address_contributes_uses() {
        let addr = Address::base_disp(var(0), 8, Kind::Int);
        let op = LirOp::Load {
            addr,
            dst: var(1),
            info: None,
        };
        let mut uses = Vec::new();
        op.for_each_operand(|o, role| {
            if role == OperandRole::Use {
                uses.push(o.clone());
            }
        });
        assert_eq!(uses, vec![var(0)]);
    }

    #[test]
    fn test_operand_rewrite() {
        let mut op = LirOp::Move {
            src: var(0),
            dst: var(1),
        };
        op.for_each_operand_mut(|o| {
            if o.as_var() == Some(VarId(0)) {
                *o = Operand::Stack {
                    slot: 3,
                    kind: Kind::Int,
                    caller_frame: false,
                };
            }
        });
        match op {
            LirOp::Move { src, .. } => assert!(src.is_stack()),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_local_labels_are_unique() {
        let mut list = LirList::new(BlockId(0));
        let a = list.new_label();
        let b = list.new_label();
        assert_ne!(a, b);
    }

    #[test]
    fn test_stop_classification() {
        let ret = LirOp::Return { value: None };
        assert!(!ret.is_stop());
        let call = LirOp::CallRuntime {
            call: RuntimeCall::Sin,
            args: vec![],
            result: Operand::Illegal,
            info: None,
        };
        assert!(call.is_stop());
    }
}
