//! Append-only code buffer with labels and forward patching.
//!
//! Labels carry either a bound offset or the list of 32-bit pc-relative
//! patch sites waiting on them; binding writes every pending site. A label
//! may be bound at most once — rebinding at the same offset is idempotent,
//! rebinding elsewhere is fatal. `finish` seals the buffer; all recorded
//! positions are validated in-bounds and the overflow limit is enforced as
//! a bailout.

use opal_core::{Bailout, CompileResult};

/// A position label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(u32);

impl Label {
    #[inline]
    pub const fn id(self) -> u32 {
        self.0
    }
}

/// Relocation form of a recorded site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocKind {
    /// 32-bit pc-relative displacement.
    PcRelative32,
    /// 64-bit absolute value.
    Absolute64,
}

/// A recorded relocation.
#[derive(Debug, Clone, Copy)]
pub struct Relocation {
    /// Offset of the patched field in the buffer.
    pub offset: u32,
    pub kind: RelocKind,
}

#[derive(Debug)]
enum LabelState {
    /// Offsets of pending 4-byte rel32 fields.
    Unbound(Vec<u32>),
    Bound(u32),
}

/// The append-only byte buffer.
#[derive(Debug)]
pub struct CodeBuffer {
    code: Vec<u8>,
    labels: Vec<LabelState>,
    relocations: Vec<Relocation>,
    limit: usize,
    finished: bool,
}

impl CodeBuffer {
    /// A buffer that may grow to `limit` bytes.
    pub fn new(limit: usize) -> CodeBuffer {
        CodeBuffer {
            code: Vec::with_capacity(limit.min(4096)),
            labels: Vec::new(),
            relocations: Vec::new(),
            limit,
            finished: false,
        }
    }

    /// Current emission position.
    #[inline]
    pub fn position(&self) -> u32 {
        self.code.len() as u32
    }

    /// Emitted bytes so far.
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.code
    }

    fn check_open(&self) {
        assert!(!self.finished, "write into a finished code buffer");
    }

    /// Append one byte.
    #[inline]
    pub fn emit_u8(&mut self, b: u8) {
        self.check_open();
        self.code.push(b);
    }

    /// Append a little-endian 16-bit value.
    #[inline]
    pub fn emit_u16(&mut self, v: u16) {
        self.check_open();
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    /// Append a little-endian 32-bit value.
    #[inline]
    pub fn emit_u32(&mut self, v: u32) {
        self.check_open();
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    /// Append a little-endian 64-bit value.
    #[inline]
    pub fn emit_u64(&mut self, v: u64) {
        self.check_open();
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    /// Append raw bytes.
    pub fn emit_slice(&mut self, bytes: &[u8]) {
        self.check_open();
        self.code.extend_from_slice(bytes);
    }

    /// Overwrite a 32-bit field at `offset`.
    pub fn patch_i32(&mut self, offset: u32, value: i32) {
        let offset = offset as usize;
        self.code[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Pad with single-byte nops to an alignment.
    pub fn align(&mut self, alignment: u32) {
        while self.position() % alignment != 0 {
            self.emit_u8(0x90);
        }
    }

    /// Record a relocation at the current position.
    pub fn record_reloc(&mut self, kind: RelocKind) {
        let offset = self.position();
        self.relocations.push(Relocation { offset, kind });
    }

    /// Recorded relocations.
    pub fn relocations(&self) -> &[Relocation] {
        &self.relocations
    }

    /// Create an unbound label.
    pub fn create_label(&mut self) -> Label {
        let id = self.labels.len() as u32;
        self.labels.push(LabelState::Unbound(Vec::new()));
        Label(id)
    }

    /// Bind a label to the current position, patching every pending site.
    ///
    /// Rebinding at the same offset is idempotent; rebinding elsewhere is a
    /// fatal error.
    pub fn bind(&mut self, label: Label) {
        let pos = self.position();
        let state = &mut self.labels[label.id() as usize];
        match state {
            LabelState::Bound(at) => {
                assert_eq!(
                    *at, pos,
                    "label {} already bound at {}, rebound at {}",
                    label.id(),
                    at,
                    pos
                );
            }
            LabelState::Unbound(sites) => {
                let sites = std::mem::take(sites);
                *state = LabelState::Bound(pos);
                for site in sites {
                    let disp = pos as i64 - (site as i64 + 4);
                    self.patch_i32(site, disp as i32);
                }
            }
        }
    }

    /// The bound offset of a label, if bound.
    pub fn label_offset(&self, label: Label) -> Option<u32> {
        match self.labels[label.id() as usize] {
            LabelState::Bound(at) => Some(at),
            LabelState::Unbound(_) => None,
        }
    }

    /// Emit a 4-byte rel32 field referring to `label`. Bound labels are
    /// resolved immediately; unbound labels record a patch site.
    pub fn emit_rel32(&mut self, label: Label) {
        self.check_open();
        let site = self.position();
        match &mut self.labels[label.id() as usize] {
            LabelState::Bound(at) => {
                let disp = *at as i64 - (site as i64 + 4);
                self.emit_u32(disp as u32);
            }
            LabelState::Unbound(sites) => {
                sites.push(site);
                self.emit_u32(0);
            }
        }
    }

    /// Seal the buffer. Fails on overflow; panics on unbound labels (a
    /// label leak is a compiler bug, not an input condition).
    pub fn finish(mut self) -> CompileResult<Vec<u8>> {
        if self.code.len() > self.limit {
            return Err(Bailout::CodeBufferOverflow { limit: self.limit });
        }
        for (i, state) in self.labels.iter().enumerate() {
            if let LabelState::Unbound(sites) = state {
                assert!(
                    sites.is_empty(),
                    "label {i} used at {sites:?} but never bound"
                );
            }
        }
        self.finished = true;
        Ok(std::mem::take(&mut self.code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_primitives_little_endian() {
        let mut buf = CodeBuffer::new(64);
        buf.emit_u8(0xAA);
        buf.emit_u32(0x0403_0201);
        assert_eq!(buf.bytes(), &[0xAA, 0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn test_backward_label_resolves_immediately() {
        let mut buf = CodeBuffer::new(64);
        let label = buf.create_label();
        buf.bind(label);
        buf.emit_u8(0xE9); // jmp rel32 back to position 0
        buf.emit_rel32(label);
        // disp = 0 - (1 + 4) = -5
        assert_eq!(&buf.bytes()[1..5], &(-5i32).to_le_bytes());
    }

    #[test]
    fn test_forward_label_patches_at_bind() {
        let mut buf = CodeBuffer::new(64);
        let label = buf.create_label();
        buf.emit_u8(0xE9);
        buf.emit_rel32(label);
        buf.emit_u8(0x90);
        buf.bind(label);
        // Site at 1; target 6; disp = 6 - 5 = 1.
        assert_eq!(&buf.bytes()[1..5], &1i32.to_le_bytes());
        assert_eq!(buf.label_offset(label), Some(6));
    }

    #[test]
    fn test_bind_then_emit_equals_emit_then_bind() {
        // The label-bind round-trip law: both orders produce identical
        // bytes for the same layout.
        let forward = {
            let mut buf = CodeBuffer::new(64);
            let label = buf.create_label();
            buf.emit_u8(0xE9);
            buf.emit_rel32(label);
            buf.emit_u8(0x90);
            buf.bind(label);
            buf.emit_u8(0xC3);
            buf.finish().unwrap()
        };
        let backward = {
            let mut buf = CodeBuffer::new(64);
            let label = buf.create_label();
            buf.emit_u8(0xE9);
            // Manually simulate knowing the offset: 6 - 5 = 1.
            buf.emit_u32(1);
            buf.emit_u8(0x90);
            buf.bind(label);
            buf.emit_u8(0xC3);
            buf.finish().unwrap()
        };
        assert_eq!(forward, backward);
    }

    #[test]
    fn test_rebinding_same_offset_idempotent() {
        let mut buf = CodeBuffer::new(64);
        let label = buf.create_label();
        buf.bind(label);
        buf.bind(label);
        assert_eq!(buf.label_offset(label), Some(0));
    }

    #[test]
    #[should_panic(expected = "already bound")]
    fn test_rebinding_elsewhere_is_fatal() {
        let mut buf = CodeBuffer::new(64);
        let label = buf.create_label();
        buf.bind(label);
        buf.emit_u8(0x90);
        buf.bind(label);
    }

    #[test]
    fn test_overflow_is_a_bailout() {
        let mut buf = CodeBuffer::new(2);
        buf.emit_u32(0);
        assert!(matches!(
            buf.finish(),
            Err(Bailout::CodeBufferOverflow { limit: 2 })
        ));
    }

    #[test]
    #[should_panic(expected = "never bound")]
    fn test_unbound_used_label_is_fatal() {
        let mut buf = CodeBuffer::new(64);
        let label = buf.create_label();
        buf.emit_u8(0xE9);
        buf.emit_rel32(label);
        let _ = buf.finish();
    }

    #[test]
    fn test_align_pads_with_nops() {
        let mut buf = CodeBuffer::new(64);
        buf.emit_u8(0xC3);
        buf.align(8);
        assert_eq!(buf.position(), 8);
        assert!(buf.bytes()[1..].iter().all(|&b| b == 0x90));
    }

    #[test]
    fn test_relocations_recorded() {
        let mut buf = CodeBuffer::new(64);
        buf.emit_u8(0x00);
        buf.record_reloc(RelocKind::PcRelative32);
        buf.emit_u32(0);
        let relocs = buf.relocations();
        assert_eq!(relocs.len(), 1);
        assert_eq!(relocs[0].offset, 1);
        assert_eq!(relocs[0].kind, RelocKind::PcRelative32);
    }
}
