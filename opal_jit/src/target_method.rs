//! The sealed compile output.
//!
//! A `TargetMethod` holds the finished machine code plus every side table
//! the runtime needs to execute it: safepoint reference maps, call sites,
//! exception handlers, data patches, stop positions, the reference-literal
//! pool, and the entry-point offsets. It is immutable once built, apart
//! from the two explicit patch operations the runtime uses to relink
//! installed code.

use crate::lir::{RuntimeCall, StubId};
use crate::runtime::{ClassRef, MethodRef};
use crate::value::ConstValue;

/// Offset of the baseline-convention entry point from the code start.
pub const BASELINE_ENTRY_OFFSET: u32 = 0;

/// Offset of the optimized-convention entry point from the code start.
pub const OPT_ENTRY_OFFSET: u32 = 8;

/// A call site with a compile-time-known callee.
#[derive(Debug, Clone)]
pub struct DirectCallSite {
    /// Code offset of the call instruction.
    pub pos: u32,
    pub callee: MethodRef,
    /// Frame reference map at the call.
    pub stack_map: Vec<u8>,
}

/// A dispatched call site.
#[derive(Debug, Clone)]
pub struct IndirectCallSite {
    pub pos: u32,
    pub callee: MethodRef,
    pub stack_map: Vec<u8>,
}

/// A call into the runtime.
#[derive(Debug, Clone)]
pub struct RuntimeCallSite {
    pub pos: u32,
    pub call: RuntimeCall,
    pub stack_map: Vec<u8>,
}

/// A call into a shared global stub.
#[derive(Debug, Clone)]
pub struct GlobalStubCallSite {
    pub pos: u32,
    pub stub: StubId,
    pub reg_map: Vec<u8>,
    pub stack_map: Vec<u8>,
}

/// A safepoint poll.
#[derive(Debug, Clone)]
pub struct SafepointSite {
    pub pos: u32,
    pub reg_map: Vec<u8>,
    pub stack_map: Vec<u8>,
}

/// An embedded constant needing install-time resolution.
#[derive(Debug, Clone)]
pub struct DataPatchSite {
    /// Offset of the 8-byte immediate field.
    pub pos: u32,
    pub constant: ConstValue,
}

/// One exception-table entry.
#[derive(Debug, Clone)]
pub struct HandlerEntry {
    pub try_pos: u32,
    pub catch_pos: u32,
    /// `None` catches everything.
    pub catch_type: Option<ClassRef>,
}

/// A named position from an XIR template.
#[derive(Debug, Clone)]
pub struct MarkSite {
    pub name: &'static str,
    pub pos: u32,
}

/// The compiled method record.
#[derive(Debug)]
pub struct TargetMethod {
    /// Back-reference for the installer.
    pub method: MethodRef,
    code: Vec<u8>,
    /// Runtime address of the first code byte; set on install.
    code_start: u64,
    pub frame_size: u32,
    pub baseline_entry_offset: u32,
    pub opt_entry_offset: u32,
    pub osr_entry_offset: Option<u32>,
    pub direct_calls: Vec<DirectCallSite>,
    pub indirect_calls: Vec<IndirectCallSite>,
    pub runtime_calls: Vec<RuntimeCallSite>,
    pub global_stub_calls: Vec<GlobalStubCallSite>,
    pub safepoints: Vec<SafepointSite>,
    pub data_patches: Vec<DataPatchSite>,
    pub exception_handlers: Vec<HandlerEntry>,
    /// Positions where execution can be stopped: calls and safepoints,
    /// ascending and deduplicated.
    pub stop_positions: Vec<u32>,
    /// Size in bytes of the single register-reference-map template.
    pub register_ref_map_size: u32,
    /// One register map shared by every stop (no references live in
    /// registers across stops in this backend).
    pub register_ref_map: Vec<u8>,
    /// Opaque descriptor blob for data embedded between instructions.
    pub encoded_inline_data: Vec<u8>,
    /// Object constants referenced by the code.
    pub reference_literals: Vec<ConstValue>,
    pub marks: Vec<MarkSite>,
    /// Cache line size the patch invariant is checked against.
    cache_line_size: u32,
}

/// Everything the emitter hands over when sealing a target method.
pub struct TargetMethodParts {
    pub method: MethodRef,
    pub code: Vec<u8>,
    pub frame_size: u32,
    pub osr_entry_offset: Option<u32>,
    pub direct_calls: Vec<DirectCallSite>,
    pub indirect_calls: Vec<IndirectCallSite>,
    pub runtime_calls: Vec<RuntimeCallSite>,
    pub global_stub_calls: Vec<GlobalStubCallSite>,
    pub safepoints: Vec<SafepointSite>,
    pub data_patches: Vec<DataPatchSite>,
    pub exception_handlers: Vec<HandlerEntry>,
    pub stop_positions: Vec<u32>,
    pub register_ref_map: Vec<u8>,
    pub encoded_inline_data: Vec<u8>,
    pub reference_literals: Vec<ConstValue>,
    pub marks: Vec<MarkSite>,
    pub cache_line_size: u32,
}

impl TargetMethod {
    /// Seal the emitter's output. Validates that every recorded position
    /// is inside the code.
    pub fn seal(parts: TargetMethodParts) -> TargetMethod {
        let len = parts.code.len() as u32;
        let check = |pos: u32, what: &str| {
            assert!(pos < len, "{what} position {pos} outside code of {len} bytes");
        };
        for site in &parts.direct_calls {
            check(site.pos, "direct call");
        }
        for site in &parts.indirect_calls {
            check(site.pos, "indirect call");
        }
        for site in &parts.runtime_calls {
            check(site.pos, "runtime call");
        }
        for site in &parts.global_stub_calls {
            check(site.pos, "stub call");
        }
        for site in &parts.safepoints {
            check(site.pos, "safepoint");
        }
        for site in &parts.data_patches {
            check(site.pos, "data patch");
        }
        for entry in &parts.exception_handlers {
            check(entry.try_pos, "handler try");
            check(entry.catch_pos, "handler catch");
        }
        let mut stops = parts.stop_positions;
        stops.sort_unstable();
        stops.dedup();
        TargetMethod {
            method: parts.method,
            code: parts.code,
            code_start: 0,
            frame_size: parts.frame_size,
            baseline_entry_offset: BASELINE_ENTRY_OFFSET,
            opt_entry_offset: OPT_ENTRY_OFFSET,
            osr_entry_offset: parts.osr_entry_offset,
            direct_calls: parts.direct_calls,
            indirect_calls: parts.indirect_calls,
            runtime_calls: parts.runtime_calls,
            global_stub_calls: parts.global_stub_calls,
            safepoints: parts.safepoints,
            data_patches: parts.data_patches,
            exception_handlers: parts.exception_handlers,
            stop_positions: stops,
            register_ref_map_size: parts.register_ref_map.len() as u32,
            register_ref_map: parts.register_ref_map,
            encoded_inline_data: parts.encoded_inline_data,
            reference_literals: parts.reference_literals,
            marks: parts.marks,
            cache_line_size: parts.cache_line_size,
        }
    }

    /// The finished code bytes.
    #[inline]
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Installed base address, zero until installed.
    #[inline]
    pub fn code_start(&self) -> u64 {
        self.code_start
    }

    /// Record the installed base address.
    pub fn set_code_start(&mut self, addr: u64) {
        self.code_start = addr;
    }

    /// Address of the optimized-convention entry.
    #[inline]
    pub fn opt_entry(&self) -> u64 {
        self.code_start + u64::from(self.opt_entry_offset)
    }

    /// Address of the baseline-convention entry.
    #[inline]
    pub fn baseline_entry(&self) -> u64 {
        self.code_start + u64::from(self.baseline_entry_offset)
    }

    /// Rewrite the pc-relative displacement of the call at `offset` to
    /// reach `target`.
    ///
    /// The four displacement bytes must not straddle a cache line, so the
    /// word can be patched atomically; violating that is fatal, not a
    /// bailout.
    pub fn patch_call_site(&mut self, offset: u32, target: u64) {
        assert_eq!(
            self.code[offset as usize], 0xE8,
            "no call instruction at offset {offset}"
        );
        let disp_at = offset + 1;
        let line = self.cache_line_size;
        assert_eq!(
            disp_at / line,
            (disp_at + 3) / line,
            "call displacement at {disp_at} straddles a {line}-byte cache line"
        );
        let next = self.code_start + u64::from(offset) + 5;
        let disp = target.wrapping_sub(next) as i64;
        let disp = i32::try_from(disp).expect("patch target within rel32 range");
        self.code[disp_at as usize..disp_at as usize + 4]
            .copy_from_slice(&disp.to_le_bytes());
    }

    /// Write an unconditional jump at each entry point of this method to
    /// the corresponding entry of `new`, atomically redirecting callers
    /// after recompilation.
    pub fn forward_to(&mut self, new: &TargetMethod) {
        assert!(
            !std::ptr::eq(self, new),
            "cannot forward a method to itself"
        );
        self.write_jump(self.baseline_entry_offset, new.baseline_entry());
        self.write_jump(self.opt_entry_offset, new.opt_entry());
    }

    fn write_jump(&mut self, offset: u32, target: u64) {
        let next = self.code_start + u64::from(offset) + 5;
        let disp = i32::try_from(target.wrapping_sub(next) as i64)
            .expect("forwarding target within rel32 range");
        let at = offset as usize;
        self.code[at] = 0xE9;
        self.code[at + 1..at + 5].copy_from_slice(&disp.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{Method, MethodFlags};
    use opal_core::Signature;
    use std::sync::Arc;

    fn method() -> MethodRef {
        Arc::new(Method::new(
            "T",
            "m",
            Signature::parse("()V").unwrap(),
            MethodFlags::STATIC,
        ))
    }

    fn parts(code: Vec<u8>) -> TargetMethodParts {
        TargetMethodParts {
            method: method(),
            code,
            frame_size: 16,
            osr_entry_offset: None,
            direct_calls: vec![],
            indirect_calls: vec![],
            runtime_calls: vec![],
            global_stub_calls: vec![],
            safepoints: vec![],
            data_patches: vec![],
            exception_handlers: vec![],
            stop_positions: vec![],
            register_ref_map: vec![0, 0],
            encoded_inline_data: vec![],
            reference_literals: vec![],
            marks: vec![],
            cache_line_size: 32,
        }
    }

    /// A method image with a call at a chosen offset.
    fn with_call_at(offset: usize, len: usize) -> TargetMethod {
        let mut code = vec![0x90u8; len];
        code[offset] = 0xE8;
        TargetMethod::seal(parts(code))
    }

    #[test]
    fn test_seal_sorts_and_dedups_stops() {
        let mut p = parts(vec![0x90; 16]);
        p.stop_positions = vec![9, 3, 3, 7];
        let tm = TargetMethod::seal(p);
        assert_eq!(tm.stop_positions, vec![3, 7, 9]);
    }

    #[test]
    #[should_panic(expected = "outside code")]
    fn test_seal_rejects_out_of_bounds_position() {
        let mut p = parts(vec![0x90; 8]);
        p.safepoints.push(SafepointSite {
            pos: 8,
            reg_map: vec![],
            stack_map: vec![],
        });
        TargetMethod::seal(p);
    }

    #[test]
    fn test_patch_call_site_rewrites_displacement() {
        let mut tm = with_call_at(8, 64);
        tm.set_code_start(0x1000);
        // Call at 0x1008, next instruction at 0x100D; target 0x2000.
        tm.patch_call_site(8, 0x2000);
        let disp = i32::from_le_bytes(tm.code()[9..13].try_into().unwrap());
        assert_eq!(disp, (0x2000 - 0x100D) as i32);
    }

    #[test]
    #[should_panic(expected = "straddles")]
    fn test_patch_across_cache_line_is_fatal() {
        // Call at 30: displacement occupies 31..35, straddling the 32-byte
        // boundary.
        let mut tm = with_call_at(30, 64);
        tm.set_code_start(0x1000);
        tm.patch_call_site(30, 0x2000);
    }

    #[test]
    #[should_panic(expected = "no call instruction")]
    fn test_patch_requires_call_opcode() {
        let mut tm = TargetMethod::seal(parts(vec![0x90; 32]));
        tm.patch_call_site(4, 0x2000);
    }

    #[test]
    fn test_forward_to_writes_jumps_at_both_entries() {
        let mut old = TargetMethod::seal(parts(vec![0x90; 64]));
        let mut new = TargetMethod::seal(parts(vec![0x90; 64]));
        old.set_code_start(0x1_0000);
        new.set_code_start(0x2_0000);
        old.forward_to(&new);

        // Baseline entry at 0 jumps to new baseline entry.
        assert_eq!(old.code()[0], 0xE9);
        let disp0 = i32::from_le_bytes(old.code()[1..5].try_into().unwrap());
        assert_eq!(0x1_0000u64.wrapping_add(5).wrapping_add(disp0 as u64), 0x2_0000);

        // Opt entry at 8 jumps to new opt entry.
        assert_eq!(old.code()[8], 0xE9);
        let disp8 = i32::from_le_bytes(old.code()[9..13].try_into().unwrap());
        assert_eq!(
            (0x1_0000u64 + 8 + 5).wrapping_add(disp8 as u64),
            0x2_0000 + 8
        );
    }

    #[test]
    fn test_entry_offsets() {
        let mut tm = TargetMethod::seal(parts(vec![0x90; 16]));
        tm.set_code_start(0x4000);
        assert_eq!(tm.baseline_entry(), 0x4000);
        assert_eq!(tm.opt_entry(), 0x4008);
        assert_eq!(tm.register_ref_map_size, 2);
    }
}
