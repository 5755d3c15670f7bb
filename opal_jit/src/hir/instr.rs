//! HIR instructions.
//!
//! Every instruction is a value node in an arena-owned graph; edges between
//! nodes are [`InstrId`] indices, never references. The closed tag set lives
//! in [`InstrOp`]; the fields every instruction shares (kind, flags, result
//! operand, chain link, bci, attached frame state) live on [`Instr`].

use std::fmt;

use smallvec::SmallVec;

use opal_core::Kind;

use crate::lir::operand::Operand;
use crate::runtime::{ClassRef, FieldRef, MethodRef};
use crate::value::ConstValue;

/// Index of an instruction in its graph's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstrId(pub u32);

impl InstrId {
    /// Arena index.
    #[inline(always)]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for InstrId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Index of a basic block in its graph's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl BlockId {
    /// Arena index.
    #[inline(always)]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "B{}", self.0)
    }
}

/// Index of a frame-state snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StateId(pub u32);

impl StateId {
    /// Arena index.
    #[inline(always)]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Index of an inlining scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(pub u32);

impl ScopeId {
    /// Arena index.
    #[inline(always)]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Per-instruction flag bits.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct InstrFlags(u16);

impl InstrFlags {
    /// Reachable; will be lowered.
    pub const LIVE: InstrFlags = InstrFlags(1 << 0);
    /// Used as a value by some consumer (not only for effects).
    pub const LIVE_VALUE: InstrFlags = InstrFlags(1 << 1);
    /// Must stay at its program point (side effects or control).
    pub const PINNED: InstrFlags = InstrFlags(1 << 2);
    /// Statically known non-null.
    pub const NON_NULL: InstrFlags = InstrFlags(1 << 3);
    /// Range check proven redundant.
    pub const NO_BOUNDS_CHECK: InstrFlags = InstrFlags(1 << 4);
    /// Null check proven redundant.
    pub const NO_NULL_CHECK: InstrFlags = InstrFlags(1 << 5);
    /// Store check proven redundant.
    pub const NO_STORE_CHECK: InstrFlags = InstrFlags(1 << 6);
    /// GC read barrier suppressed.
    pub const NO_READ_BARRIER: InstrFlags = InstrFlags(1 << 7);
    /// GC write barrier suppressed.
    pub const NO_WRITE_BARRIER: InstrFlags = InstrFlags(1 << 8);

    /// Whether all bits of `other` are set.
    #[inline(always)]
    pub const fn contains(self, other: InstrFlags) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Set the bits of `other`.
    #[inline(always)]
    pub fn insert(&mut self, other: InstrFlags) {
        self.0 |= other.0;
    }

    /// Clear the bits of `other`.
    #[inline(always)]
    pub fn remove(&mut self, other: InstrFlags) {
        self.0 &= !other.0;
    }
}

impl fmt::Debug for InstrFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InstrFlags(0x{:x})", self.0)
    }
}

/// Binary/unary arithmetic operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

impl ArithOp {
    /// Integer division and remainder can trap on zero.
    #[inline]
    pub const fn can_trap(self, kind: Kind) -> bool {
        matches!(self, ArithOp::Div | ArithOp::Rem) && matches!(kind, Kind::Int | Kind::Long)
    }
}

/// Shift operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShiftOp {
    Shl,
    /// Arithmetic (sign-propagating) right shift.
    Shr,
    /// Logical right shift.
    Ushr,
}

/// Bitwise operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogicOp {
    And,
    Or,
    Xor,
}

/// Branch condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cond {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// Unsigned below; used for range checks.
    Below,
    /// Unsigned at-or-above; used for range checks.
    AboveEqual,
}

impl Cond {
    /// The condition testing the opposite outcome.
    #[inline]
    pub const fn negate(self) -> Cond {
        match self {
            Cond::Eq => Cond::Ne,
            Cond::Ne => Cond::Eq,
            Cond::Lt => Cond::Ge,
            Cond::Ge => Cond::Lt,
            Cond::Gt => Cond::Le,
            Cond::Le => Cond::Gt,
            Cond::Below => Cond::AboveEqual,
            Cond::AboveEqual => Cond::Below,
        }
    }

    /// The condition with operands swapped.
    #[inline]
    pub const fn mirror(self) -> Cond {
        match self {
            Cond::Eq => Cond::Eq,
            Cond::Ne => Cond::Ne,
            Cond::Lt => Cond::Gt,
            Cond::Gt => Cond::Lt,
            Cond::Le => Cond::Ge,
            Cond::Ge => Cond::Le,
            Cond::Below => Cond::AboveEqual,
            Cond::AboveEqual => Cond::Below,
        }
    }
}

/// Primitive conversion operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Conversion {
    I2L,
    I2F,
    I2D,
    L2I,
    L2F,
    L2D,
    F2I,
    F2L,
    F2D,
    D2I,
    D2L,
    D2F,
    I2B,
    I2C,
    I2S,
}

impl Conversion {
    /// Kind of the conversion result on the stack.
    pub const fn result_kind(self) -> Kind {
        match self {
            Conversion::I2L | Conversion::F2L | Conversion::D2L => Kind::Long,
            Conversion::I2F | Conversion::L2F | Conversion::D2F => Kind::Float,
            Conversion::I2D | Conversion::L2D | Conversion::F2D => Kind::Double,
            _ => Kind::Int,
        }
    }

    /// Kind of the conversion input.
    pub const fn input_kind(self) -> Kind {
        match self {
            Conversion::I2L
            | Conversion::I2F
            | Conversion::I2D
            | Conversion::I2B
            | Conversion::I2C
            | Conversion::I2S => Kind::Int,
            Conversion::L2I | Conversion::L2F | Conversion::L2D => Kind::Long,
            Conversion::F2I | Conversion::F2L | Conversion::F2D => Kind::Float,
            Conversion::D2I | Conversion::D2L | Conversion::D2F => Kind::Double,
        }
    }
}

/// Three-way comparison variant (`lcmp`, `fcmpl`, …).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpVariant {
    Lcmp,
    /// Float compare; NaN produces -1.
    Fcmpl,
    /// Float compare; NaN produces +1.
    Fcmpg,
    Dcmpl,
    Dcmpg,
}

/// Call dispatch kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvokeKind {
    Static,
    Special,
    Virtual,
    Interface,
}

impl InvokeKind {
    /// Whether the target is known at compile time.
    #[inline]
    pub const fn is_direct(self) -> bool {
        matches!(self, InvokeKind::Static | InvokeKind::Special)
    }
}

/// Recognized intrinsic methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntrinsicId {
    MathSin,
    MathCos,
    MathTan,
    MathLog,
    MathLog10,
    MathAbs,
    MathSqrt,
    FloatToRawIntBits,
    IntBitsToFloat,
    DoubleToRawLongBits,
    LongBitsToDouble,
    NanoTime,
    CurrentTimeMillis,
    CompareAndSwapInt,
    CompareAndSwapLong,
    CompareAndSwapObject,
    /// `Object.<init>`: nothing to do.
    ObjectInit,
}

/// An edge from a trapping instruction to an exception handler block.
#[derive(Debug, Clone)]
pub struct HandlerEdge {
    /// The handler's entry block.
    pub block: BlockId,
    /// Caught class; `None` is catch-any.
    pub catch_type: Option<ClassRef>,
}

/// The closed instruction tag set.
#[derive(Debug, Clone)]
pub enum InstrOp {
    /// A compile-time constant.
    Constant(ConstValue),
    /// An incoming parameter or OSR local, identified by slot index.
    Local {
        index: u32,
    },
    /// A merge of values at a block with several predecessors. `inputs[i]`
    /// is the value flowing in from `preds[i]`.
    Phi {
        block: BlockId,
        inputs: SmallVec<[InstrId; 2]>,
        /// Index of the merged local slot; stack phis use `!0 - depth`.
        slot: u32,
    },
    ArithmeticOp {
        op: ArithOp,
        x: InstrId,
        y: InstrId,
    },
    ShiftOp {
        op: ShiftOp,
        x: InstrId,
        y: InstrId,
    },
    LogicOp {
        op: LogicOp,
        x: InstrId,
        y: InstrId,
    },
    Negate {
        x: InstrId,
    },
    Convert {
        op: Conversion,
        x: InstrId,
    },
    /// Three-way comparison producing -1/0/+1.
    Compare {
        op: CmpVariant,
        x: InstrId,
        y: InstrId,
    },
    /// Conditional move: `cond(x, y) ? tval : fval`.
    IfOp {
        cond: Cond,
        x: InstrId,
        y: InstrId,
        tval: InstrId,
        fval: InstrId,
    },
    /// Explicit null check, value is the checked object.
    NullCheck {
        obj: InstrId,
    },
    LoadField {
        obj: Option<InstrId>,
        field: FieldRef,
    },
    StoreField {
        obj: Option<InstrId>,
        field: FieldRef,
        value: InstrId,
    },
    LoadIndexed {
        array: InstrId,
        index: InstrId,
        elem_kind: Kind,
    },
    StoreIndexed {
        array: InstrId,
        index: InstrId,
        value: InstrId,
        elem_kind: Kind,
    },
    ArrayLength {
        array: InstrId,
    },
    NewInstance {
        class: ClassRef,
    },
    NewTypeArray {
        length: InstrId,
        elem_kind: Kind,
    },
    NewObjectArray {
        length: InstrId,
        class: ClassRef,
    },
    NewMultiArray {
        class: ClassRef,
        dims: SmallVec<[InstrId; 2]>,
    },
    CheckCast {
        obj: InstrId,
        class: ClassRef,
    },
    InstanceOf {
        obj: InstrId,
        class: ClassRef,
    },
    MonitorEnter {
        obj: InstrId,
        lock_number: u32,
    },
    MonitorExit {
        obj: InstrId,
        lock_number: u32,
    },
    Invoke {
        kind: InvokeKind,
        target: MethodRef,
        args: SmallVec<[InstrId; 4]>,
    },
    Intrinsic {
        id: IntrinsicId,
        args: SmallVec<[InstrId; 4]>,
    },
    /// The in-flight exception at a handler entry.
    ExceptionObject,
    /// Materializes locals from the OSR buffer.
    OsrEntry,
    /// Loads a raw value through a word pointer.
    LoadPointer {
        pointer: InstrId,
        disp: i32,
        loaded_kind: Kind,
    },
    /// Stores a raw value through a word pointer.
    StorePointer {
        pointer: InstrId,
        disp: i32,
        value: InstrId,
    },
    UnsafeGet {
        obj: InstrId,
        offset: InstrId,
        loaded_kind: Kind,
        is_volatile: bool,
    },
    UnsafePut {
        obj: InstrId,
        offset: InstrId,
        value: InstrId,
        stored_kind: Kind,
        is_volatile: bool,
    },
    /// Reinterpret a value as another kind without conversion.
    UnsafeCast {
        x: InstrId,
    },
    /// Reserve `size` bytes in the frame, yielding their address.
    StackAllocate {
        size: i32,
    },
    /// Address of a monitor slot in the frame.
    MonitorAddress {
        lock_number: u32,
    },
    MemoryBarrier {
        barriers: u8,
    },
    /// A safepoint poll.
    Safepoint,
    /// The address of this program point, as a word value.
    Here,
    /// Records a stop position without polling.
    Info,

    // -------------------------------------------------------------------------
    // Block ends
    // -------------------------------------------------------------------------
    /// The root terminator of the entry block.
    Base {
        std_entry: BlockId,
        osr_entry: Option<BlockId>,
    },
    Goto {
        sux: BlockId,
    },
    If {
        cond: Cond,
        x: InstrId,
        y: InstrId,
        tsux: BlockId,
        fsux: BlockId,
    },
    TableSwitch {
        value: InstrId,
        lo_key: i32,
        suxs: Vec<BlockId>,
        default: BlockId,
    },
    LookupSwitch {
        value: InstrId,
        keys: Vec<i32>,
        suxs: Vec<BlockId>,
        default: BlockId,
    },
    Return {
        value: Option<InstrId>,
    },
    Throw {
        exception: InstrId,
    },
}

impl InstrOp {
    /// Whether this tag terminates a block.
    pub fn is_block_end(&self) -> bool {
        matches!(
            self,
            InstrOp::Base { .. }
                | InstrOp::Goto { .. }
                | InstrOp::If { .. }
                | InstrOp::TableSwitch { .. }
                | InstrOp::LookupSwitch { .. }
                | InstrOp::Return { .. }
                | InstrOp::Throw { .. }
        )
    }

    /// Successor blocks of a terminator, in successor order.
    pub fn successors(&self) -> SmallVec<[BlockId; 2]> {
        let mut suxs = SmallVec::new();
        match self {
            InstrOp::Base {
                std_entry,
                osr_entry,
            } => {
                suxs.push(*std_entry);
                if let Some(osr) = osr_entry {
                    suxs.push(*osr);
                }
            }
            InstrOp::Goto { sux } => suxs.push(*sux),
            InstrOp::If { tsux, fsux, .. } => {
                suxs.push(*tsux);
                suxs.push(*fsux);
            }
            InstrOp::TableSwitch { suxs: s, default, .. }
            | InstrOp::LookupSwitch { suxs: s, default, .. } => {
                suxs.extend(s.iter().copied());
                suxs.push(*default);
            }
            _ => {}
        }
        suxs
    }

    /// Whether executing this instruction may raise an exception.
    pub fn can_trap(&self, kind: Kind) -> bool {
        match self {
            InstrOp::ArithmeticOp { op, .. } => op.can_trap(kind),
            InstrOp::NullCheck { .. }
            | InstrOp::LoadField { obj: Some(_), .. }
            | InstrOp::StoreField { obj: Some(_), .. }
            | InstrOp::LoadIndexed { .. }
            | InstrOp::StoreIndexed { .. }
            | InstrOp::ArrayLength { .. }
            | InstrOp::NewInstance { .. }
            | InstrOp::NewTypeArray { .. }
            | InstrOp::NewObjectArray { .. }
            | InstrOp::NewMultiArray { .. }
            | InstrOp::CheckCast { .. }
            | InstrOp::MonitorEnter { .. }
            | InstrOp::MonitorExit { .. }
            | InstrOp::Invoke { .. }
            | InstrOp::Throw { .. } => true,
            _ => false,
        }
    }

    /// Visit every value input of this instruction.
    pub fn for_each_input(&self, mut f: impl FnMut(InstrId)) {
        match self {
            InstrOp::Phi { inputs, .. } => inputs.iter().copied().for_each(&mut f),
            InstrOp::ArithmeticOp { x, y, .. }
            | InstrOp::ShiftOp { x, y, .. }
            | InstrOp::LogicOp { x, y, .. }
            | InstrOp::Compare { x, y, .. } => {
                f(*x);
                f(*y);
            }
            InstrOp::IfOp {
                x, y, tval, fval, ..
            } => {
                f(*x);
                f(*y);
                f(*tval);
                f(*fval);
            }
            InstrOp::Negate { x }
            | InstrOp::Convert { x, .. }
            | InstrOp::UnsafeCast { x }
            | InstrOp::NullCheck { obj: x }
            | InstrOp::ArrayLength { array: x }
            | InstrOp::CheckCast { obj: x, .. }
            | InstrOp::InstanceOf { obj: x, .. }
            | InstrOp::MonitorEnter { obj: x, .. }
            | InstrOp::MonitorExit { obj: x, .. }
            | InstrOp::NewTypeArray { length: x, .. }
            | InstrOp::NewObjectArray { length: x, .. }
            | InstrOp::Throw { exception: x } => f(*x),
            InstrOp::LoadField { obj, .. } => {
                if let Some(obj) = obj {
                    f(*obj);
                }
            }
            InstrOp::StoreField { obj, value, .. } => {
                if let Some(obj) = obj {
                    f(*obj);
                }
                f(*value);
            }
            InstrOp::LoadIndexed { array, index, .. } => {
                f(*array);
                f(*index);
            }
            InstrOp::StoreIndexed {
                array,
                index,
                value,
                ..
            } => {
                f(*array);
                f(*index);
                f(*value);
            }
            InstrOp::NewMultiArray { dims, .. } => dims.iter().copied().for_each(&mut f),
            InstrOp::Invoke { args, .. } | InstrOp::Intrinsic { args, .. } => {
                args.iter().copied().for_each(&mut f)
            }
            InstrOp::LoadPointer { pointer, .. } => f(*pointer),
            InstrOp::StorePointer { pointer, value, .. } => {
                f(*pointer);
                f(*value);
            }
            InstrOp::UnsafeGet { obj, offset, .. } => {
                f(*obj);
                f(*offset);
            }
            InstrOp::UnsafePut {
                obj, offset, value, ..
            } => {
                f(*obj);
                f(*offset);
                f(*value);
            }
            InstrOp::If { x, y, .. } => {
                f(*x);
                f(*y);
            }
            InstrOp::TableSwitch { value, .. } | InstrOp::LookupSwitch { value, .. } => f(*value),
            InstrOp::Return { value } => {
                if let Some(v) = value {
                    f(*v);
                }
            }
            InstrOp::Constant(_)
            | InstrOp::Local { .. }
            | InstrOp::ExceptionObject
            | InstrOp::OsrEntry
            | InstrOp::StackAllocate { .. }
            | InstrOp::MonitorAddress { .. }
            | InstrOp::MemoryBarrier { .. }
            | InstrOp::Safepoint
            | InstrOp::Here
            | InstrOp::Info
            | InstrOp::Base { .. }
            | InstrOp::Goto { .. }
            | InstrOp::NewInstance { .. } => {}
        }
    }
}

/// One instruction: the shared prefix plus its tag.
#[derive(Debug, Clone)]
pub struct Instr {
    /// Kind of the produced value (`Void` for pure effects, `Illegal`
    /// never appears on a constructed instruction).
    pub kind: Kind,
    pub flags: InstrFlags,
    pub op: InstrOp,
    /// Next instruction in the owning block's chain.
    pub next: Option<InstrId>,
    /// Bytecode index this instruction came from.
    pub bci: u32,
    /// Frame state before execution, for traps/calls/safepoints.
    pub state: Option<StateId>,
    /// Result operand; `Operand::Illegal` until LIR generation assigns it.
    pub operand: Operand,
    /// Exception handlers covering this instruction, innermost first.
    pub handlers: SmallVec<[HandlerEdge; 1]>,
}

impl Instr {
    /// Create an instruction with empty linkage.
    pub fn new(kind: Kind, op: InstrOp, bci: u32) -> Instr {
        Instr {
            kind,
            flags: InstrFlags::default(),
            op,
            next: None,
            bci,
            state: None,
            operand: Operand::Illegal,
            handlers: SmallVec::new(),
        }
    }

    /// Whether the instruction is live.
    #[inline]
    pub fn is_live(&self) -> bool {
        self.flags.contains(InstrFlags::LIVE)
    }

    /// Whether some consumer uses the produced value.
    #[inline]
    pub fn is_live_value(&self) -> bool {
        self.flags.contains(InstrFlags::LIVE_VALUE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    #[test]
    fn test_cond_negate_and_mirror() {
        assert_eq!(Cond::Eq.negate(), Cond::Ne);
        assert_eq!(Cond::Lt.negate(), Cond::Ge);
        assert_eq!(Cond::Lt.mirror(), Cond::Gt);
        assert_eq!(Cond::Eq.mirror(), Cond::Eq);
        assert_eq!(Cond::Below.negate(), Cond::AboveEqual);
        for c in [Cond::Eq, Cond::Ne, Cond::Lt, Cond::Le, Cond::Gt, Cond::Ge] {
            assert_eq!(c.negate().negate(), c);
            assert_eq!(c.mirror().mirror(), c);
        }
    }

    #[test]
    fn test_conversion_kinds() {
        assert_eq!(Conversion::I2L.result_kind(), Kind::Long);
        assert_eq!(Conversion::I2L.input_kind(), Kind::Int);
        assert_eq!(Conversion::D2F.result_kind(), Kind::Float);
        assert_eq!(Conversion::I2B.result_kind(), Kind::Int);
        assert_eq!(Conversion::F2L.input_kind(), Kind::Float);
    }

    #[test]
    fn test_successor_order() {
        let op = InstrOp::If {
            cond: Cond::Lt,
            x: InstrId(0),
            y: InstrId(1),
            tsux: BlockId(4),
            fsux: BlockId(5),
        };
        assert_eq!(op.successors().as_slice(), &[BlockId(4), BlockId(5)]);
        let sw = InstrOp::TableSwitch {
            value: InstrId(0),
            lo_key: 0,
            suxs: vec![BlockId(1), BlockId(2)],
            default: BlockId(3),
        };
        assert_eq!(
            sw.successors().as_slice(),
            &[BlockId(1), BlockId(2), BlockId(3)]
        );
        assert!(sw.is_block_end());
    }

    #[test]
    fn test_trap_classification() {
        let div = InstrOp::ArithmeticOp {
            op: ArithOp::Div,
            x: InstrId(0),
            y: InstrId(1),
        };
        assert!(div.can_trap(Kind::Int));
        assert!(!div.can_trap(Kind::Float));
        let add = InstrOp::ArithmeticOp {
            op: ArithOp::Add,
            x: InstrId(0),
            y: InstrId(1),
        };
        assert!(!add.can_trap(Kind::Int));
    }

    #[test]
    fn test_for_each_input_covers_phi_and_call() {
        let phi = InstrOp::Phi {
            block: BlockId(0),
            inputs: smallvec![InstrId(3), InstrId(4)],
            slot: 0,
        };
        let mut seen = Vec::new();
        phi.for_each_input(|id| seen.push(id));
        assert_eq!(seen, vec![InstrId(3), InstrId(4)]);

        let intr = InstrOp::Intrinsic {
            id: IntrinsicId::MathSqrt,
            args: smallvec![InstrId(9)],
        };
        let mut seen = Vec::new();
        intr.for_each_input(|id| seen.push(id));
        assert_eq!(seen, vec![InstrId(9)]);
    }

    #[test]
    fn test_new_instr_defaults() {
        let i = Instr::new(Kind::Int, InstrOp::Constant(ConstValue::Int(3)), 7);
        assert!(!i.is_live());
        assert!(!i.is_live_value());
        assert_eq!(i.bci, 7);
        assert!(matches!(i.operand, Operand::Illegal));
        assert!(i.next.is_none());
    }
}
