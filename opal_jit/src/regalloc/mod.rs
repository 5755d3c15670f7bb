//! Register assignment.
//!
//! A linear-scan assignment over the operand pool: blocks are already
//! linearized by the LIR generator, ops are numbered, live intervals are
//! built from the per-op operand visitor, and variables receive physical
//! registers or frame slots. Values live across a call are always kept in
//! the frame, so calls never need caller-save shuffles.

mod linear_scan;

pub use linear_scan::{allocate, AllocResult};

use crate::target::registers::Reg;

/// Where a variable ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assignment {
    Reg(Reg),
    /// Frame spill slot index.
    Stack(i32),
}
