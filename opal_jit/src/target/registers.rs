//! x64 register model.
//!
//! General-purpose and SSE registers with their hardware encodings, plus
//! bitset types for building allocatable/clobber sets in O(1).

use std::fmt;

/// General-purpose 64-bit register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Gpr {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Gpr {
    /// All sixteen registers, in encoding order.
    pub const ALL: [Gpr; 16] = [
        Gpr::Rax,
        Gpr::Rcx,
        Gpr::Rdx,
        Gpr::Rbx,
        Gpr::Rsp,
        Gpr::Rbp,
        Gpr::Rsi,
        Gpr::Rdi,
        Gpr::R8,
        Gpr::R9,
        Gpr::R10,
        Gpr::R11,
        Gpr::R12,
        Gpr::R13,
        Gpr::R14,
        Gpr::R15,
    ];

    /// Hardware encoding (0-15).
    #[inline(always)]
    pub const fn encoding(self) -> u8 {
        self as u8
    }

    /// Low 3 bits for ModRM/SIB fields.
    #[inline(always)]
    pub const fn low_bits(self) -> u8 {
        self.encoding() & 0x7
    }

    /// Whether encoding needs a REX extension bit.
    #[inline(always)]
    pub const fn needs_rex(self) -> bool {
        self.encoding() >= 8
    }

    /// Convert from an encoding value if valid.
    #[inline]
    pub const fn from_encoding(enc: u8) -> Option<Gpr> {
        if enc < 16 {
            Some(Gpr::ALL[enc as usize])
        } else {
            None
        }
    }
}

impl fmt::Display for Gpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Gpr::Rax => "rax",
            Gpr::Rcx => "rcx",
            Gpr::Rdx => "rdx",
            Gpr::Rbx => "rbx",
            Gpr::Rsp => "rsp",
            Gpr::Rbp => "rbp",
            Gpr::Rsi => "rsi",
            Gpr::Rdi => "rdi",
            Gpr::R8 => "r8",
            Gpr::R9 => "r9",
            Gpr::R10 => "r10",
            Gpr::R11 => "r11",
            Gpr::R12 => "r12",
            Gpr::R13 => "r13",
            Gpr::R14 => "r14",
            Gpr::R15 => "r15",
        };
        f.write_str(name)
    }
}

/// SSE register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum Xmm {
    Xmm0 = 0,
    Xmm1 = 1,
    Xmm2 = 2,
    Xmm3 = 3,
    Xmm4 = 4,
    Xmm5 = 5,
    Xmm6 = 6,
    Xmm7 = 7,
    Xmm8 = 8,
    Xmm9 = 9,
    Xmm10 = 10,
    Xmm11 = 11,
    Xmm12 = 12,
    Xmm13 = 13,
    Xmm14 = 14,
    Xmm15 = 15,
}

impl Xmm {
    /// All sixteen registers, in encoding order.
    pub const ALL: [Xmm; 16] = [
        Xmm::Xmm0,
        Xmm::Xmm1,
        Xmm::Xmm2,
        Xmm::Xmm3,
        Xmm::Xmm4,
        Xmm::Xmm5,
        Xmm::Xmm6,
        Xmm::Xmm7,
        Xmm::Xmm8,
        Xmm::Xmm9,
        Xmm::Xmm10,
        Xmm::Xmm11,
        Xmm::Xmm12,
        Xmm::Xmm13,
        Xmm::Xmm14,
        Xmm::Xmm15,
    ];

    /// Hardware encoding (0-15).
    #[inline(always)]
    pub const fn encoding(self) -> u8 {
        self as u8
    }

    /// Low 3 bits for ModRM fields.
    #[inline(always)]
    pub const fn low_bits(self) -> u8 {
        self.encoding() & 0x7
    }

    /// Whether encoding needs a REX extension bit.
    #[inline(always)]
    pub const fn needs_rex(self) -> bool {
        self.encoding() >= 8
    }

    /// Convert from an encoding value if valid.
    #[inline]
    pub const fn from_encoding(enc: u8) -> Option<Xmm> {
        if enc < 16 {
            Some(Xmm::ALL[enc as usize])
        } else {
            None
        }
    }
}

impl fmt::Display for Xmm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "xmm{}", self.encoding())
    }
}

/// A physical register of either class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reg {
    Gpr(Gpr),
    Xmm(Xmm),
}

impl Reg {
    /// Whether this is a general-purpose register.
    #[inline]
    pub const fn is_gpr(self) -> bool {
        matches!(self, Reg::Gpr(_))
    }

    /// The GPR, if this is one.
    #[inline]
    pub const fn gpr(self) -> Option<Gpr> {
        match self {
            Reg::Gpr(r) => Some(r),
            Reg::Xmm(_) => None,
        }
    }

    /// The XMM register, if this is one.
    #[inline]
    pub const fn xmm(self) -> Option<Xmm> {
        match self {
            Reg::Xmm(r) => Some(r),
            Reg::Gpr(_) => None,
        }
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reg::Gpr(r) => r.fmt(f),
            Reg::Xmm(r) => r.fmt(f),
        }
    }
}

/// A set of GPRs as a 16-bit bitfield.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct GprSet(u16);

impl GprSet {
    /// The empty set.
    pub const EMPTY: GprSet = GprSet(0);

    /// Create a set containing a single register.
    #[inline(always)]
    pub const fn singleton(reg: Gpr) -> Self {
        GprSet(1 << reg.encoding())
    }

    /// Create from a raw bitmask.
    #[inline(always)]
    pub const fn from_bits(bits: u16) -> Self {
        GprSet(bits)
    }

    /// Raw bitmask.
    #[inline(always)]
    pub const fn bits(self) -> u16 {
        self.0
    }

    /// Membership test.
    #[inline(always)]
    pub const fn contains(self, reg: Gpr) -> bool {
        (self.0 & (1 << reg.encoding())) != 0
    }

    /// Whether the set is empty.
    #[inline(always)]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Add a register.
    #[inline(always)]
    pub const fn insert(self, reg: Gpr) -> Self {
        GprSet(self.0 | (1 << reg.encoding()))
    }

    /// Remove a register.
    #[inline(always)]
    pub const fn remove(self, reg: Gpr) -> Self {
        GprSet(self.0 & !(1 << reg.encoding()))
    }

    /// Set union.
    #[inline(always)]
    pub const fn union(self, other: GprSet) -> Self {
        GprSet(self.0 | other.0)
    }

    /// Number of registers in the set.
    #[inline(always)]
    pub const fn count(self) -> u32 {
        self.0.count_ones()
    }

    /// Iterate in ascending encoding order.
    pub fn iter(self) -> impl Iterator<Item = Gpr> {
        (0u8..16).filter_map(move |i| {
            if (self.0 & (1 << i)) != 0 {
                Gpr::from_encoding(i)
            } else {
                None
            }
        })
    }
}

impl fmt::Debug for GprSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GprSet{{")?;
        let mut first = true;
        for reg in self.iter() {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{reg}")?;
            first = false;
        }
        write!(f, "}}")
    }
}

/// A set of XMM registers as a 16-bit bitfield.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct XmmSet(u16);

impl XmmSet {
    /// The empty set.
    pub const EMPTY: XmmSet = XmmSet(0);

    /// Create from a raw bitmask.
    #[inline(always)]
    pub const fn from_bits(bits: u16) -> Self {
        XmmSet(bits)
    }

    /// Raw bitmask.
    #[inline(always)]
    pub const fn bits(self) -> u16 {
        self.0
    }

    /// Membership test.
    #[inline(always)]
    pub const fn contains(self, reg: Xmm) -> bool {
        (self.0 & (1 << reg.encoding())) != 0
    }

    /// Add a register.
    #[inline(always)]
    pub const fn insert(self, reg: Xmm) -> Self {
        XmmSet(self.0 | (1 << reg.encoding()))
    }

    /// Remove a register.
    #[inline(always)]
    pub const fn remove(self, reg: Xmm) -> Self {
        XmmSet(self.0 & !(1 << reg.encoding()))
    }

    /// Number of registers in the set.
    #[inline(always)]
    pub const fn count(self) -> u32 {
        self.0.count_ones()
    }

    /// Iterate in ascending encoding order.
    pub fn iter(self) -> impl Iterator<Item = Xmm> {
        (0u8..16).filter_map(move |i| {
            if (self.0 & (1 << i)) != 0 {
                Xmm::from_encoding(i)
            } else {
                None
            }
        })
    }
}

impl fmt::Debug for XmmSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "XmmSet{{")?;
        let mut first = true;
        for reg in self.iter() {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{reg}")?;
            first = false;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encodings() {
        assert_eq!(Gpr::Rax.encoding(), 0);
        assert_eq!(Gpr::R15.encoding(), 15);
        assert_eq!(Gpr::R8.low_bits(), 0);
        assert!(Gpr::R8.needs_rex());
        assert!(!Gpr::Rdi.needs_rex());
        assert_eq!(Gpr::from_encoding(3), Some(Gpr::Rbx));
        assert_eq!(Gpr::from_encoding(16), None);
    }

    #[test]
    fn test_gpr_set_ops() {
        let set = GprSet::EMPTY.insert(Gpr::Rax).insert(Gpr::R11);
        assert!(set.contains(Gpr::Rax));
        assert!(set.contains(Gpr::R11));
        assert!(!set.contains(Gpr::Rbx));
        assert_eq!(set.count(), 2);
        assert_eq!(set.remove(Gpr::Rax).count(), 1);
        let regs: Vec<Gpr> = set.iter().collect();
        assert_eq!(regs, vec![Gpr::Rax, Gpr::R11]);
    }

    #[test]
    fn test_xmm_set_ops() {
        let set = XmmSet::EMPTY.insert(Xmm::Xmm0).insert(Xmm::Xmm15);
        assert_eq!(set.count(), 2);
        assert!(set.contains(Xmm::Xmm15));
        assert!(!set.contains(Xmm::Xmm7));
    }

    #[test]
    fn test_reg_union() {
        let r = Reg::Gpr(Gpr::Rcx);
        assert!(r.is_gpr());
        assert_eq!(r.gpr(), Some(Gpr::Rcx));
        assert_eq!(r.xmm(), None);
        assert_eq!(Reg::Xmm(Xmm::Xmm3).to_string(), "xmm3");
    }
}
