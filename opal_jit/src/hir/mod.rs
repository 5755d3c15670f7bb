//! High-level IR: a control-flow graph of basic blocks whose instructions
//! form a value graph with explicit phi nodes.

pub mod block;
pub mod builder;
pub mod frame_state;
pub mod graph;
pub mod instr;

pub use block::{Block, BlockFlags, LirListId};
pub use frame_state::{FrameState, IrScope, MutableState};
pub use graph::Hir;
pub use instr::{
    ArithOp, BlockId, CmpVariant, Cond, Conversion, HandlerEdge, Instr, InstrFlags, InstrId,
    InstrOp, IntrinsicId, InvokeKind, LogicOp, ScopeId, ShiftOp, StateId,
};
