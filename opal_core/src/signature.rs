//! Method signature parsing.
//!
//! A signature is the ordered sequence of parameter kinds plus one result
//! kind, parsed from a JVM-style method descriptor such as `(I[JLFoo;)V`.
//! Reference and array types collapse to [`Kind::Object`]; the compiler does
//! not model source-level types.

use std::fmt;

use crate::error::{Bailout, CompileResult};
use crate::kind::Kind;

/// Parsed parameter and result kinds of a method descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    params: Vec<Kind>,
    result: Kind,
    descriptor: String,
}

impl Signature {
    /// Parse a method descriptor, e.g. `(IJ)V`.
    pub fn parse(descriptor: &str) -> CompileResult<Signature> {
        let bytes = descriptor.as_bytes();
        if bytes.first() != Some(&b'(') {
            return Err(Bailout::malformed(format!(
                "method descriptor must start with '(': {descriptor:?}"
            )));
        }
        let mut params = Vec::new();
        let mut i = 1;
        while i < bytes.len() && bytes[i] != b')' {
            let (kind, next) = parse_one(bytes, i, descriptor)?;
            params.push(kind);
            i = next;
        }
        if i >= bytes.len() {
            return Err(Bailout::malformed(format!(
                "unterminated parameter list: {descriptor:?}"
            )));
        }
        // Skip ')'
        i += 1;
        let (result, next) = parse_one(bytes, i, descriptor)?;
        if next != bytes.len() {
            return Err(Bailout::malformed(format!(
                "trailing characters after result kind: {descriptor:?}"
            )));
        }
        Ok(Signature {
            params,
            result,
            descriptor: descriptor.to_string(),
        })
    }

    /// The parameter kinds, excluding any receiver.
    #[inline]
    pub fn params(&self) -> &[Kind] {
        &self.params
    }

    /// The result kind (`Void` for no result).
    #[inline]
    pub fn result(&self) -> Kind {
        self.result
    }

    /// The original descriptor string.
    #[inline]
    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    /// Argument kinds as passed at a call site.
    ///
    /// With `receiver` set, an `Object` receiver kind is prepended. The
    /// result is the adapter signature key: the result kind is omitted
    /// because all calling conventions share one result location.
    pub fn argument_kinds(&self, receiver: bool) -> Vec<Kind> {
        let mut kinds = Vec::with_capacity(self.params.len() + usize::from(receiver));
        if receiver {
            kinds.push(Kind::Object);
        }
        kinds.extend_from_slice(&self.params);
        kinds
    }

    /// Total JVM slots occupied by the arguments.
    pub fn argument_slots(&self, receiver: bool) -> u32 {
        let mut slots = u32::from(receiver);
        for &k in &self.params {
            slots += k.jvm_slots();
        }
        slots
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.descriptor)
    }
}

/// Parse one field-type descriptor starting at `i`, returning the kind and
/// the index just past it.
fn parse_one(bytes: &[u8], i: usize, whole: &str) -> CompileResult<(Kind, usize)> {
    let Some(&c) = bytes.get(i) else {
        return Err(Bailout::malformed(format!(
            "truncated descriptor: {whole:?}"
        )));
    };
    match c {
        b'[' => {
            // Consume array dimensions, then the element type; the whole
            // thing is one Object-kinded value.
            let mut j = i;
            while bytes.get(j) == Some(&b'[') {
                j += 1;
            }
            let (_, next) = parse_one(bytes, j, whole)?;
            Ok((Kind::Object, next))
        }
        b'L' => {
            let mut j = i + 1;
            while j < bytes.len() && bytes[j] != b';' {
                j += 1;
            }
            if j >= bytes.len() {
                return Err(Bailout::malformed(format!(
                    "unterminated class name in descriptor: {whole:?}"
                )));
            }
            Ok((Kind::Object, j + 1))
        }
        other => match Kind::from_descriptor_char(other) {
            Some(kind) => Ok((kind, i + 1)),
            None => Err(Bailout::malformed(format!(
                "invalid descriptor character {:?} in {whole:?}",
                other as char
            ))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty_void() {
        let sig = Signature::parse("()V").unwrap();
        assert!(sig.params().is_empty());
        assert_eq!(sig.result(), Kind::Void);
    }

    #[test]
    fn test_parse_primitives() {
        let sig = Signature::parse("(IJFD)I").unwrap();
        assert_eq!(
            sig.params(),
            &[Kind::Int, Kind::Long, Kind::Float, Kind::Double]
        );
        assert_eq!(sig.result(), Kind::Int);
    }

    #[test]
    fn test_parse_references_and_arrays() {
        let sig = Signature::parse("(Ljava/lang/String;[I[[Ljava/lang/Object;)Ljava/lang/Object;")
            .unwrap();
        assert_eq!(sig.params(), &[Kind::Object, Kind::Object, Kind::Object]);
        assert_eq!(sig.result(), Kind::Object);
    }

    #[test]
    fn test_argument_kinds_with_receiver() {
        let sig = Signature::parse("(IJ)V").unwrap();
        assert_eq!(
            sig.argument_kinds(true),
            vec![Kind::Object, Kind::Int, Kind::Long]
        );
        assert_eq!(sig.argument_kinds(false), vec![Kind::Int, Kind::Long]);
    }

    #[test]
    fn test_argument_slots_counts_category2_twice() {
        let sig = Signature::parse("(JDI)V").unwrap();
        assert_eq!(sig.argument_slots(false), 5);
        assert_eq!(sig.argument_slots(true), 6);
    }

    #[test]
    fn test_malformed_descriptors_rejected() {
        assert!(Signature::parse("IJ)V").is_err());
        assert!(Signature::parse("(IJ").is_err());
        assert!(Signature::parse("(Q)V").is_err());
        assert!(Signature::parse("(LFoo)V").is_err());
        assert!(Signature::parse("()VX").is_err());
    }

    #[test]
    fn test_signature_equality_is_elementwise() {
        let a = Signature::parse("(LFoo;I)V").unwrap();
        let b = Signature::parse("(LFoo;I)V").unwrap();
        let c = Signature::parse("(LBar;I)V").unwrap();
        assert_eq!(a, b);
        // Same kinds, different descriptor: equal as adapter keys only.
        assert_eq!(a.argument_kinds(false), c.argument_kinds(false));
        assert_ne!(a, c);
    }
}
