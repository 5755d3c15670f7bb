//! Core data model shared by the Opal JIT compiler and its embedders.
//!
//! This crate is deliberately small and dependency-light. It provides:
//! - The primitive [`Kind`] model (stack kinds, JVM slot sizing)
//! - Method [`Signature`] parsing from descriptor strings
//! - The bytecode opcode table and a bounds-checked [`bytecode::BytecodeStream`]
//! - The [`Bailout`] error taxonomy and [`CompileResult`] alias

pub mod bytecode;
pub mod error;
pub mod kind;
pub mod signature;

pub use error::{Bailout, CompileResult};
pub use kind::Kind;
pub use signature::Signature;
