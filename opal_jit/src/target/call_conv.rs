//! Calling conventions.
//!
//! Two conventions coexist: *optimized* passes leading arguments in
//! registers with the remainder in outgoing stack slots, *baseline* passes
//! everything on the stack in source-frame slot layout. Both return results
//! in the same location (RAX / XMM0) — that shared result location is why
//! adapter signatures omit the result kind.

use opal_core::Kind;

use super::registers::{Gpr, Reg, Xmm};

/// Stack slot size of the optimized convention (one machine word).
pub const OPT_SLOT_SIZE: u32 = 8;

/// Stack slot size of the baseline convention (one JVM slot).
pub const BASELINE_SLOT_SIZE: u32 = 4;

/// The two calling conventions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallConv {
    /// Register arguments, frame pointer set up by the prologue.
    Optimized,
    /// All arguments on the stack in JVM frame layout.
    Baseline,
}

impl CallConv {
    /// The other convention.
    #[inline]
    pub const fn opposite(self) -> CallConv {
        match self {
            CallConv::Optimized => CallConv::Baseline,
            CallConv::Baseline => CallConv::Optimized,
        }
    }

    /// Slot size of a category-1 argument in this convention's frame.
    #[inline]
    pub const fn slot_size(self) -> u32 {
        match self {
            CallConv::Optimized => OPT_SLOT_SIZE,
            CallConv::Baseline => BASELINE_SLOT_SIZE,
        }
    }
}

/// Where one argument lives at a call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgLocation {
    /// In a register.
    Reg(Reg),
    /// In an outgoing stack slot at this byte offset from the stack
    /// pointer at the call.
    Stack(i32),
}

impl ArgLocation {
    /// Whether the argument is passed on the stack.
    #[inline]
    pub const fn is_stack(self) -> bool {
        matches!(self, ArgLocation::Stack(_))
    }
}

/// The locations of every argument of a call plus the outgoing stack space.
#[derive(Debug, Clone)]
pub struct CallSiteLocations {
    /// Per-argument locations, in argument order.
    pub locations: Vec<ArgLocation>,
    /// Bytes of outgoing stack the call needs, stack-alignment padded.
    pub overflow_bytes: u32,
}

/// Integer argument registers of the optimized convention, in order.
pub const OPT_INT_ARGS: [Gpr; 6] = [Gpr::Rdi, Gpr::Rsi, Gpr::Rdx, Gpr::Rcx, Gpr::R8, Gpr::R9];

/// Floating-point argument registers of the optimized convention.
pub const OPT_FP_ARGS: [Xmm; 8] = [
    Xmm::Xmm0,
    Xmm::Xmm1,
    Xmm::Xmm2,
    Xmm::Xmm3,
    Xmm::Xmm4,
    Xmm::Xmm5,
    Xmm::Xmm6,
    Xmm::Xmm7,
];

/// The shared integer/reference result register.
pub const RESULT_GPR: Gpr = Gpr::Rax;

/// The shared floating-point result register.
pub const RESULT_XMM: Xmm = Xmm::Xmm0;

/// Compute argument locations for a call with the given argument kinds.
///
/// `stack_alignment` pads the overflow area so the stack pointer keeps its
/// required alignment across the call.
pub fn locations_for(conv: CallConv, kinds: &[Kind], stack_alignment: u32) -> CallSiteLocations {
    match conv {
        CallConv::Optimized => optimized_locations(kinds, stack_alignment),
        CallConv::Baseline => baseline_locations(kinds, stack_alignment),
    }
}

/// The result location for a given result kind, shared by both conventions.
pub fn result_location(kind: Kind) -> Option<Reg> {
    match kind {
        Kind::Void | Kind::Illegal => None,
        k if k.is_float() => Some(Reg::Xmm(RESULT_XMM)),
        _ => Some(Reg::Gpr(RESULT_GPR)),
    }
}

fn optimized_locations(kinds: &[Kind], stack_alignment: u32) -> CallSiteLocations {
    let mut locations = Vec::with_capacity(kinds.len());
    let mut next_gpr = 0usize;
    let mut next_xmm = 0usize;
    let mut stack: i32 = 0;
    for &kind in kinds {
        let loc = if kind.is_float() {
            if next_xmm < OPT_FP_ARGS.len() {
                let r = OPT_FP_ARGS[next_xmm];
                next_xmm += 1;
                ArgLocation::Reg(Reg::Xmm(r))
            } else {
                let at = stack;
                stack += OPT_SLOT_SIZE as i32;
                ArgLocation::Stack(at)
            }
        } else if next_gpr < OPT_INT_ARGS.len() {
            let r = OPT_INT_ARGS[next_gpr];
            next_gpr += 1;
            ArgLocation::Reg(Reg::Gpr(r))
        } else {
            let at = stack;
            stack += OPT_SLOT_SIZE as i32;
            ArgLocation::Stack(at)
        };
        locations.push(loc);
    }
    CallSiteLocations {
        locations,
        overflow_bytes: align_up(stack as u32, stack_alignment),
    }
}

fn baseline_locations(kinds: &[Kind], stack_alignment: u32) -> CallSiteLocations {
    let mut locations = Vec::with_capacity(kinds.len());
    let mut slot: u32 = 0;
    for &kind in kinds {
        locations.push(ArgLocation::Stack((slot * BASELINE_SLOT_SIZE) as i32));
        slot += kind.jvm_slots();
    }
    CallSiteLocations {
        locations,
        overflow_bytes: align_up(slot * BASELINE_SLOT_SIZE, stack_alignment),
    }
}

#[inline]
const fn align_up(value: u32, alignment: u32) -> u32 {
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_optimized_register_args() {
        let locs = locations_for(
            CallConv::Optimized,
            &[Kind::Object, Kind::Int, Kind::Double],
            16,
        );
        assert_eq!(locs.locations[0], ArgLocation::Reg(Reg::Gpr(Gpr::Rdi)));
        assert_eq!(locs.locations[1], ArgLocation::Reg(Reg::Gpr(Gpr::Rsi)));
        assert_eq!(locs.locations[2], ArgLocation::Reg(Reg::Xmm(Xmm::Xmm0)));
        assert_eq!(locs.overflow_bytes, 0);
    }

    #[test]
    fn test_optimized_overflow_to_stack() {
        let kinds = vec![Kind::Int; 8];
        let locs = locations_for(CallConv::Optimized, &kinds, 16);
        assert!(locs.locations[..6].iter().all(|l| !l.is_stack()));
        assert_eq!(locs.locations[6], ArgLocation::Stack(0));
        assert_eq!(locs.locations[7], ArgLocation::Stack(8));
        assert_eq!(locs.overflow_bytes, 16);
    }

    #[test]
    fn test_fp_and_int_registers_independent() {
        let locs = locations_for(
            CallConv::Optimized,
            &[Kind::Float, Kind::Int, Kind::Float],
            16,
        );
        assert_eq!(locs.locations[0], ArgLocation::Reg(Reg::Xmm(Xmm::Xmm0)));
        assert_eq!(locs.locations[1], ArgLocation::Reg(Reg::Gpr(Gpr::Rdi)));
        assert_eq!(locs.locations[2], ArgLocation::Reg(Reg::Xmm(Xmm::Xmm1)));
    }

    #[test]
    fn test_baseline_all_on_stack_jvm_slots() {
        let locs = locations_for(
            CallConv::Baseline,
            &[Kind::Object, Kind::Long, Kind::Int],
            16,
        );
        assert_eq!(locs.locations[0], ArgLocation::Stack(0));
        assert_eq!(locs.locations[1], ArgLocation::Stack(4));
        // Long took two baseline slots.
        assert_eq!(locs.locations[2], ArgLocation::Stack(12));
        assert_eq!(locs.overflow_bytes, 16);
    }

    #[test]
    fn test_shared_result_location() {
        assert_eq!(result_location(Kind::Int), Some(Reg::Gpr(Gpr::Rax)));
        assert_eq!(result_location(Kind::Object), Some(Reg::Gpr(Gpr::Rax)));
        assert_eq!(result_location(Kind::Double), Some(Reg::Xmm(Xmm::Xmm0)));
        assert_eq!(result_location(Kind::Void), None);
    }

    #[test]
    fn test_slot_sizes() {
        assert_eq!(CallConv::Optimized.slot_size(), 8);
        assert_eq!(CallConv::Baseline.slot_size(), 4);
        assert_eq!(CallConv::Optimized.opposite(), CallConv::Baseline);
    }
}
