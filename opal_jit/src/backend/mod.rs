//! Backend: code buffer, x64 encoding, and the LIR emitter.

pub mod code_buffer;
pub mod emitter;
pub mod x64;

pub use code_buffer::{CodeBuffer, Label, RelocKind, Relocation};
pub use emitter::emit;
