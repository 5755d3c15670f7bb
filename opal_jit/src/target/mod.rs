//! Target architecture description.
//!
//! An immutable descriptor of the machine the backend emits for: word size,
//! byte order, stack alignment, the memory-barrier requirements of the
//! memory model, and the register configuration. Built once at startup and
//! shared read-only by every compilation.

pub mod call_conv;
pub mod registers;

use std::fmt;

use registers::{Gpr, GprSet, Xmm, XmmSet};

/// Byte order of the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    LittleEndian,
    BigEndian,
}

/// A set of memory-barrier requirements.
///
/// The four elementary constraints compose into the pre/post sets required
/// around volatile accesses.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryBarriers(u8);

impl MemoryBarriers {
    /// No ordering constraint.
    pub const EMPTY: MemoryBarriers = MemoryBarriers(0);
    /// Loads before the barrier complete before loads after it.
    pub const LOAD_LOAD: MemoryBarriers = MemoryBarriers(1);
    /// Loads before the barrier complete before stores after it.
    pub const LOAD_STORE: MemoryBarriers = MemoryBarriers(2);
    /// Stores before the barrier complete before loads after it.
    pub const STORE_LOAD: MemoryBarriers = MemoryBarriers(4);
    /// Stores before the barrier complete before stores after it.
    pub const STORE_STORE: MemoryBarriers = MemoryBarriers(8);

    /// Barriers required before a volatile write.
    pub const PRE_VOLATILE_WRITE: MemoryBarriers =
        MemoryBarriers(Self::LOAD_STORE.0 | Self::STORE_STORE.0);
    /// Barriers required after a volatile write.
    pub const POST_VOLATILE_WRITE: MemoryBarriers =
        MemoryBarriers(Self::STORE_LOAD.0 | Self::STORE_STORE.0);
    /// Barriers required before a volatile read.
    pub const PRE_VOLATILE_READ: MemoryBarriers = MemoryBarriers(0);
    /// Barriers required after a volatile read.
    pub const POST_VOLATILE_READ: MemoryBarriers =
        MemoryBarriers(Self::LOAD_LOAD.0 | Self::LOAD_STORE.0);

    /// Create from raw flag bits.
    #[inline(always)]
    pub const fn from_bits(bits: u8) -> Self {
        MemoryBarriers(bits)
    }

    /// Raw flag bits.
    #[inline(always)]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Whether no constraint remains.
    #[inline(always)]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether all of `other`'s constraints are included.
    #[inline(always)]
    pub const fn contains(self, other: MemoryBarriers) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Union of two constraint sets.
    #[inline(always)]
    pub const fn union(self, other: MemoryBarriers) -> Self {
        MemoryBarriers(self.0 | other.0)
    }

    /// Intersection of two constraint sets.
    #[inline(always)]
    pub const fn intersection(self, other: MemoryBarriers) -> Self {
        MemoryBarriers(self.0 & other.0)
    }
}

impl fmt::Debug for MemoryBarriers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.contains(Self::LOAD_LOAD) {
            parts.push("LOAD_LOAD");
        }
        if self.contains(Self::LOAD_STORE) {
            parts.push("LOAD_STORE");
        }
        if self.contains(Self::STORE_LOAD) {
            parts.push("STORE_LOAD");
        }
        if self.contains(Self::STORE_STORE) {
            parts.push("STORE_STORE");
        }
        write!(f, "MemoryBarriers[{}]", parts.join("|"))
    }
}

/// Immutable description of the compilation target.
#[derive(Debug, Clone)]
pub struct Target {
    /// Architecture name, e.g. `"x64"`.
    pub arch: &'static str,
    /// Machine word size in bytes.
    pub word_size: u32,
    /// Byte order of memory accesses.
    pub byte_order: ByteOrder,
    /// Required stack-pointer alignment at call sites.
    pub stack_alignment: u32,
    /// Cache line size; patched call displacements must not straddle one.
    pub cache_line_size: u32,
    /// Size of one spill slot in the frame.
    pub spill_slot_size: u32,
    /// Barrier constraints the hardware does *not* already guarantee; only
    /// these need explicit fence instructions.
    implicit_ordering: MemoryBarriers,
    /// GPRs the register allocator may hand out.
    pub allocatable_gprs: GprSet,
    /// XMM registers the register allocator may hand out.
    pub allocatable_xmms: XmmSet,
    /// Scratch GPR reserved for the emitter (never allocated).
    pub scratch_gpr: Gpr,
    /// Scratch XMM reserved for the emitter (never allocated).
    pub scratch_xmm: Xmm,
    /// Frame pointer.
    pub frame_ptr: Gpr,
    /// Stack pointer.
    pub stack_ptr: Gpr,
    /// Register holding the in-flight exception object at handler entry.
    pub exception_reg: Gpr,
}

impl Target {
    /// The x64 target: little-endian, 8-byte words, 16-byte call-site
    /// alignment, TSO memory model.
    pub fn x64() -> Target {
        let mut gprs = GprSet::EMPTY;
        for reg in Gpr::ALL {
            gprs = gprs.insert(reg);
        }
        // RSP/RBP frame the stack; R11 is the emitter scratch.
        let gprs = gprs.remove(Gpr::Rsp).remove(Gpr::Rbp).remove(Gpr::R11);
        let mut xmms = XmmSet::EMPTY;
        for reg in Xmm::ALL {
            xmms = xmms.insert(reg);
        }
        let xmms = xmms.remove(Xmm::Xmm15);
        Target {
            arch: "x64",
            word_size: 8,
            byte_order: ByteOrder::LittleEndian,
            stack_alignment: 16,
            cache_line_size: 32,
            spill_slot_size: 8,
            // TSO: only store-load reordering is possible.
            implicit_ordering: MemoryBarriers::STORE_LOAD,
            allocatable_gprs: gprs,
            allocatable_xmms: xmms,
            scratch_gpr: Gpr::R11,
            scratch_xmm: Xmm::Xmm15,
            frame_ptr: Gpr::Rbp,
            stack_ptr: Gpr::Rsp,
            exception_reg: Gpr::Rax,
        }
    }

    /// The subset of `barriers` that needs an explicit fence on this
    /// target. An empty result means the op needs no barrier instruction.
    #[inline]
    pub fn required_barriers(&self, barriers: MemoryBarriers) -> MemoryBarriers {
        barriers.intersection(self.implicit_ordering)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_barrier_compositions() {
        assert!(MemoryBarriers::PRE_VOLATILE_WRITE.contains(MemoryBarriers::LOAD_STORE));
        assert!(MemoryBarriers::PRE_VOLATILE_WRITE.contains(MemoryBarriers::STORE_STORE));
        assert!(MemoryBarriers::POST_VOLATILE_WRITE.contains(MemoryBarriers::STORE_LOAD));
        assert!(MemoryBarriers::POST_VOLATILE_READ.contains(MemoryBarriers::LOAD_LOAD));
        assert!(MemoryBarriers::PRE_VOLATILE_READ.is_empty());
    }

    #[test]
    fn test_x64_tso_filters_barriers() {
        let target = Target::x64();
        // Only STORE_LOAD survives on TSO.
        assert!(target
            .required_barriers(MemoryBarriers::POST_VOLATILE_READ)
            .is_empty());
        assert!(target
            .required_barriers(MemoryBarriers::PRE_VOLATILE_WRITE)
            .is_empty());
        assert_eq!(
            target.required_barriers(MemoryBarriers::POST_VOLATILE_WRITE),
            MemoryBarriers::STORE_LOAD
        );
    }

    #[test]
    fn test_x64_register_configuration() {
        let target = Target::x64();
        assert!(!target.allocatable_gprs.contains(Gpr::Rsp));
        assert!(!target.allocatable_gprs.contains(Gpr::Rbp));
        assert!(!target.allocatable_gprs.contains(Gpr::R11));
        assert!(!target.allocatable_xmms.contains(Xmm::Xmm15));
        assert_eq!(target.allocatable_gprs.count(), 13);
        assert_eq!(target.allocatable_xmms.count(), 15);
        assert_eq!(target.word_size, 8);
        assert_eq!(target.cache_line_size, 32);
    }
}
