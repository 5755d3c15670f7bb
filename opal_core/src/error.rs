//! Error taxonomy for the compiler core.
//!
//! There is exactly one recoverable error kind: a [`Bailout`], which abandons
//! the current compilation and lets the embedding runtime fall back to a
//! baseline compiler or interpreter. Everything that cannot be recovered at
//! the compilation boundary (double label binds, mispatched code, stale
//! arena references) is a panic and is never mapped into `Bailout`.

use thiserror::Error;

/// The result type used throughout the compiler.
pub type CompileResult<T> = Result<T, Bailout>;

/// A recoverable abandonment of one compilation.
///
/// A bailout short-circuits the pipeline; partial IR, LIR, code bytes and
/// side tables are dropped with the compilation's arenas and nothing is
/// installed anywhere.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Bailout {
    /// A bytecode the compiler does not handle.
    #[error("unsupported bytecode 0x{opcode:02x} at bci {bci}")]
    UnsupportedBytecode {
        /// The raw opcode byte.
        opcode: u8,
        /// Bytecode index of the instruction.
        bci: u32,
    },

    /// A constant-pool entry that could not be resolved and patching is off.
    #[error("unresolved {what} at bci {bci}")]
    UnresolvedReference {
        /// What failed to resolve (class, field, method, constant).
        what: String,
        /// Bytecode index of the referencing instruction.
        bci: u32,
    },

    /// An internal consistency check failed while building or lowering.
    #[error("invariant violation: {message}")]
    InvariantViolation {
        /// Description of the violated invariant.
        message: String,
    },

    /// A fixed-register constraint could not be satisfied.
    #[error("register constraint unsatisfiable: {message}")]
    RegisterConstraint {
        /// Description of the conflicting constraint.
        message: String,
    },

    /// The code buffer outgrew its limit.
    #[error("code buffer overflow (limit {limit} bytes)")]
    CodeBufferOverflow {
        /// The configured buffer limit.
        limit: usize,
    },

    /// Truncated or structurally invalid bytecode.
    #[error("malformed code: {message}")]
    MalformedCode {
        /// Description of the defect.
        message: String,
    },
}

impl Bailout {
    /// Create an unsupported-bytecode bailout.
    #[must_use]
    pub fn unsupported(opcode: u8, bci: u32) -> Self {
        Self::UnsupportedBytecode { opcode, bci }
    }

    /// Create an unresolved-reference bailout.
    #[must_use]
    pub fn unresolved(what: impl Into<String>, bci: u32) -> Self {
        Self::UnresolvedReference {
            what: what.into(),
            bci,
        }
    }

    /// Create an invariant-violation bailout.
    #[must_use]
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::InvariantViolation {
            message: message.into(),
        }
    }

    /// Create a register-constraint bailout.
    #[must_use]
    pub fn register_constraint(message: impl Into<String>) -> Self {
        Self::RegisterConstraint {
            message: message.into(),
        }
    }

    /// Create a malformed-code bailout.
    #[must_use]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedCode {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_bytecode_display() {
        let err = Bailout::unsupported(0xba, 17);
        assert_eq!(err.to_string(), "unsupported bytecode 0xba at bci 17");
    }

    #[test]
    fn test_unresolved_reference_display() {
        let err = Bailout::unresolved("field ref #12", 4);
        assert_eq!(err.to_string(), "unresolved field ref #12 at bci 4");
    }

    #[test]
    fn test_invariant_violation_display() {
        let err = Bailout::invariant("phi arity mismatch");
        assert!(err.to_string().contains("phi arity mismatch"));
    }

    #[test]
    fn test_bailout_short_circuits_with_question_mark() {
        fn inner() -> CompileResult<u32> {
            Err(Bailout::malformed("truncated stream"))
        }
        fn outer() -> CompileResult<u32> {
            let v = inner()?;
            Ok(v + 1)
        }
        assert!(matches!(outer(), Err(Bailout::MalformedCode { .. })));
    }

    #[test]
    fn test_bailout_is_clone_and_eq() {
        let a = Bailout::CodeBufferOverflow { limit: 1024 };
        let b = a.clone();
        assert_eq!(a, b);
    }
}
