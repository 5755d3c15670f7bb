//! x64 backend: instruction encoding over the shared code buffer.

pub mod asm;

pub use asm::{Assembler, CondCode, Mem};
