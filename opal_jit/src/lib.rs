//! Optimizing method-JIT compiler.
//!
//! Bytecode in, sealed machine code out:
//! - Graph building: abstract interpretation into a block-structured value
//!   graph with explicit phis
//! - XIR: runtime-supplied parameterised templates for object operations
//! - LIR: target-abstract linear operations over virtual operands
//! - Linear-scan register assignment
//! - An x64 emitter producing code plus the GC/deopt side tables
//! - Calling-convention adapters shared per argument signature
#![deny(unsafe_op_in_unsafe_fn)]

pub mod adapter;
pub mod backend;
pub mod compile;
pub mod hir;
pub mod lir;
pub mod options;
pub mod regalloc;
pub mod runtime;
pub mod target;
pub mod target_method;
pub mod value;
pub mod xir;

pub use compile::{compile, Context};
pub use options::Options;
pub use target_method::TargetMethod;
