//! Calling-convention adapters.
//!
//! The VM runs two calling conventions side by side: *optimized* (leading
//! arguments in registers, frame pointer set up by the prologue) and
//! *baseline* (every argument in a JVM-slot stack layout). When a caller
//! of one convention invokes a callee compiled with the other, a shared
//! adapter thunk reshuffles the arguments and bridges the frames.
//!
//! Adapter bodies depend only on the callee's argument kinds, so they are
//! cached per signature. The cache lock spans the create-if-absent path:
//! at most one thread materializes any given adapter, and every caller
//! observes the same finished object.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use opal_core::Kind;

use crate::backend::x64::{Assembler, Mem};
use crate::backend::CodeBuffer;
use crate::runtime::Method;
use crate::target::call_conv::{self, ArgLocation, CallConv, BASELINE_SLOT_SIZE};
use crate::target::registers::{Gpr, Reg};
use crate::target_method::OPT_ENTRY_OFFSET;

/// Adaptation direction, named after caller-to-callee conventions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdapterKind {
    /// Optimized caller invoking a baseline callee.
    Opt2Baseline,
    /// Baseline caller invoking an optimized callee.
    Baseline2Opt,
}

impl AdapterKind {
    /// The convention of callees this adapter kind leads into.
    pub const fn callee_convention(self) -> CallConv {
        match self {
            AdapterKind::Opt2Baseline => CallConv::Baseline,
            AdapterKind::Baseline2Opt => CallConv::Optimized,
        }
    }

    /// The convention of callers this adapter kind accepts.
    pub const fn caller_convention(self) -> CallConv {
        self.callee_convention().opposite()
    }
}

/// What kind of code a callee is; some callees are never adapted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalleeCategory {
    /// Ordinary compiled method.
    Normal,
    /// An adapter itself.
    Adapter,
    /// A template: not a complete called method.
    Template,
    /// A native-entry stub.
    NativeStub,
}

/// An adapter signature: the callee's argument kinds, receiver included,
/// result omitted (all conventions share the result location).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Sig(pub Vec<Kind>);

impl Sig {
    /// The signature key for a callee.
    pub fn of(callee: &Method) -> Sig {
        Sig(callee.argument_kinds())
    }

    /// Total adapter-frame bytes for these kinds at a slot size.
    pub fn frame_bytes(&self, slot_size: u32) -> u32 {
        self.0.iter().map(|k| k.jvm_slots() * slot_size).sum()
    }
}

impl fmt::Display for Sig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for kind in &self.0 {
            write!(f, "{}", kind.descriptor_char())?;
        }
        f.write_str(")")
    }
}

/// A finished adapter: immutable code plus its frame geometry.
#[derive(Debug)]
pub struct Adapter {
    pub kind: AdapterKind,
    pub sig: Sig,
    code: Vec<u8>,
    pub frame_size: u32,
}

impl Adapter {
    /// The adapter's emitted bytes.
    pub fn code(&self) -> &[u8] {
        &self.code
    }
}

/// Where prologue bytes go: an in-memory assembler buffer when producing
/// an installed method, or a plain byte stream when producing code
/// offline. Either way the same bytes arrive in the same order.
pub trait OutputSink {
    fn write_bytes(&mut self, bytes: &[u8]);
}

impl OutputSink for Vec<u8> {
    fn write_bytes(&mut self, bytes: &[u8]) {
        self.extend_from_slice(bytes);
    }
}

impl OutputSink for CodeBuffer {
    fn write_bytes(&mut self, bytes: &[u8]) {
        self.emit_slice(bytes);
    }
}

/// A stack-walk position. `read_word` dereferences stack memory so the
/// walker can load return addresses.
pub struct StackCursor<'a> {
    pub ip: u64,
    pub sp: u64,
    pub fp: u64,
    pub read_word: &'a dyn Fn(u64) -> u64,
}

/// Generator for one adaptation direction.
pub struct AdapterGenerator {
    kind: AdapterKind,
    adapters: Mutex<FxHashMap<Sig, Arc<Adapter>>>,
}

impl AdapterGenerator {
    /// A generator with an empty cache.
    pub fn new(kind: AdapterKind) -> AdapterGenerator {
        AdapterGenerator {
            kind,
            adapters: Mutex::new(FxHashMap::default()),
        }
    }

    /// The direction this generator serves.
    pub fn kind(&self) -> AdapterKind {
        self.kind
    }

    /// Emit the callee's prologue into `out` and return the shared adapter
    /// for its signature. `None` means no adaptation is needed; nothing is
    /// emitted then, and the emitter pads the entry region itself.
    pub fn adapt(&self, callee: &Method, out: &mut dyn OutputSink) -> Option<Arc<Adapter>> {
        let adapter = self.make(callee)?;
        let prologue = self.prologue_bytes();
        debug_assert_eq!(prologue.len() as u32, self.prologue_size_for_callee(callee));
        out.write_bytes(&prologue);
        Some(adapter)
    }

    /// Get or create the adapter for a callee's signature.
    ///
    /// A zero-argument static callee needs no `Opt2Baseline` adapter; a
    /// parameterless `Baseline2Opt` call still needs one for the frame
    /// pointer save and restore.
    pub fn make(&self, callee: &Method) -> Option<Arc<Adapter>> {
        if self.kind == AdapterKind::Opt2Baseline
            && callee.signature.params().is_empty()
            && callee.flags.is_static()
        {
            return None;
        }
        let sig = Sig::of(callee);
        // The lock spans lookup and creation: one build per signature.
        let mut table = self.adapters.lock();
        let adapter = table
            .entry(sig.clone())
            .or_insert_with(|| Arc::new(self.create(&sig)));
        Some(Arc::clone(adapter))
    }

    /// Exact byte length of the prologue `adapt` emits for this callee.
    pub fn prologue_size_for_callee(&self, callee: &Method) -> u32 {
        if self.kind == AdapterKind::Opt2Baseline
            && callee.signature.params().is_empty()
            && callee.flags.is_static()
        {
            return 0;
        }
        OPT_ENTRY_OFFSET
    }

    /// If the cursor's instruction pointer lies inside a callee prologue
    /// emitted by this generator, advance the cursor to the caller frame.
    pub fn advance_if_in_prologue(
        &self,
        cursor: &mut StackCursor<'_>,
        callee_code_start: u64,
        callee: &Method,
    ) -> bool {
        let size = u64::from(self.prologue_size_for_callee(callee));
        if size == 0 {
            return false;
        }
        let offset = cursor.ip.wrapping_sub(callee_code_start);
        if offset >= size {
            return false;
        }
        // Nothing is pushed yet inside the prologue: the caller's return
        // address sits at the stack pointer.
        cursor.ip = (cursor.read_word)(cursor.sp);
        cursor.sp += 8;
        true
    }

    /// The prologue body: a call to the adapter (patched at install time)
    /// padded to the optimized entry offset.
    fn prologue_bytes(&self) -> Vec<u8> {
        let mut asm = Assembler::new(16);
        asm.call_patchable();
        while asm.position() < OPT_ENTRY_OFFSET {
            asm.nop();
        }
        asm.into_buffer().finish().expect("prologue fits")
    }

    fn create(&self, sig: &Sig) -> Adapter {
        match self.kind {
            AdapterKind::Baseline2Opt => self.create_baseline_to_opt(sig),
            AdapterKind::Opt2Baseline => self.create_opt_to_baseline(sig),
        }
    }

    /// Baseline caller, optimized callee. On entry: `[rsp]` holds the
    /// return address into the callee prologue, `[rsp+8]` the baseline
    /// caller's return address, and the caller's argument slots above it.
    fn create_baseline_to_opt(&self, sig: &Sig) -> Adapter {
        let mut asm = Assembler::new(512);
        asm.push(Gpr::Rbp);
        asm.mov_rr(true, Gpr::Rbp, Gpr::Rsp);

        let locs = call_conv::locations_for(CallConv::Optimized, &sig.0, 16);
        if locs.overflow_bytes > 0 {
            asm.sub_ri(true, Gpr::Rsp, locs.overflow_bytes as i32);
        }

        // Baseline argument area: above the two return addresses.
        let incoming_base: i32 = 24;
        let mut slot: u32 = 0;
        for (kind, loc) in sig.0.iter().zip(&locs.locations) {
            let src = Mem::base(
                Gpr::Rbp,
                incoming_base + (slot * BASELINE_SLOT_SIZE) as i32,
            );
            match *loc {
                ArgLocation::Reg(Reg::Gpr(reg)) => {
                    if kind.is_category2() || kind.is_object() || *kind == Kind::Word {
                        asm.mov_rm(true, reg, &src);
                    } else {
                        asm.mov_rm(false, reg, &src);
                    }
                }
                ArgLocation::Reg(Reg::Xmm(reg)) => {
                    asm.movs_rm(*kind == Kind::Double, reg, &src);
                }
                ArgLocation::Stack(offset) => {
                    asm.mov_rm(true, Gpr::R11, &src);
                    asm.mov_mr(true, &Mem::base(Gpr::Rsp, offset), Gpr::R11);
                }
            }
            slot += kind.jvm_slots();
        }

        // Re-enter the callee just past its prologue call.
        asm.mov_rm(true, Gpr::R11, &Mem::base(Gpr::Rbp, 8));
        asm.call_r(Gpr::R11);

        // Pop the baseline argument slots on behalf of the caller.
        let popped = sig.frame_bytes(BASELINE_SLOT_SIZE) + 8;
        asm.leave();
        asm.ret_imm(popped as u16);

        let code = asm.into_buffer().finish().expect("adapter fits");
        Adapter {
            kind: self.kind,
            sig: sig.clone(),
            code,
            frame_size: locs.overflow_bytes + 16,
        }
    }

    /// Optimized caller, baseline callee. Register arguments spill into a
    /// fresh baseline-layout argument area.
    fn create_opt_to_baseline(&self, sig: &Sig) -> Adapter {
        let mut asm = Assembler::new(512);
        asm.push(Gpr::Rbp);
        asm.mov_rr(true, Gpr::Rbp, Gpr::Rsp);

        let out_bytes = align_up(sig.frame_bytes(BASELINE_SLOT_SIZE), 16);
        if out_bytes > 0 {
            asm.sub_ri(true, Gpr::Rsp, out_bytes as i32);
        }

        let locs = call_conv::locations_for(CallConv::Optimized, &sig.0, 16);
        let mut slot: u32 = 0;
        for (kind, loc) in sig.0.iter().zip(&locs.locations) {
            let dst = Mem::base(Gpr::Rsp, (slot * BASELINE_SLOT_SIZE) as i32);
            match *loc {
                ArgLocation::Reg(Reg::Gpr(reg)) => {
                    if kind.is_category2() || kind.is_object() || *kind == Kind::Word {
                        asm.mov_mr(true, &dst, reg);
                    } else {
                        asm.mov_mr(false, &dst, reg);
                    }
                }
                ArgLocation::Reg(Reg::Xmm(reg)) => {
                    asm.movs_mr(*kind == Kind::Double, &dst, reg);
                }
                ArgLocation::Stack(offset) => {
                    // Incoming optimized stack argument, above the two
                    // return addresses.
                    let src = Mem::base(Gpr::Rbp, 16 + offset);
                    asm.mov_rm(true, Gpr::R11, &src);
                    asm.mov_mr(true, &dst, Gpr::R11);
                }
            }
            slot += kind.jvm_slots();
        }

        asm.mov_rm(true, Gpr::R11, &Mem::base(Gpr::Rbp, 8));
        asm.call_r(Gpr::R11);
        asm.leave();
        asm.ret();

        let code = asm.into_buffer().finish().expect("adapter fits");
        Adapter {
            kind: self.kind,
            sig: sig.clone(),
            code,
            frame_size: out_bytes + 16,
        }
    }
}

const fn align_up(value: u32, alignment: u32) -> u32 {
    (value + alignment - 1) & !(alignment - 1)
}

/// Process-wide registry: one generator per callee entry point, installed
/// once at startup.
pub struct AdapterRegistry {
    baseline2opt: Arc<AdapterGenerator>,
    opt2baseline: Arc<AdapterGenerator>,
    /// Whether two conventions are configured at all; a single-compiler
    /// VM never adapts.
    dual_conventions: bool,
}

impl AdapterRegistry {
    /// Register both directions by callee entry point.
    pub fn init() -> AdapterRegistry {
        AdapterRegistry {
            baseline2opt: Arc::new(AdapterGenerator::new(AdapterKind::Baseline2Opt)),
            opt2baseline: Arc::new(AdapterGenerator::new(AdapterKind::Opt2Baseline)),
            dual_conventions: true,
        }
    }

    /// A registry for a VM with a single calling convention.
    pub fn single_convention() -> AdapterRegistry {
        let mut registry = AdapterRegistry::init();
        registry.dual_conventions = false;
        registry
    }

    /// The generator that adapts calls *to* a callee compiled with
    /// `callee_convention`, or `None` when the callee is never adapted.
    pub fn for_callee(
        &self,
        callee_convention: CallConv,
        category: CalleeCategory,
    ) -> Option<Arc<AdapterGenerator>> {
        if !self.dual_conventions || category != CalleeCategory::Normal {
            return None;
        }
        Some(match callee_convention {
            CallConv::Optimized => Arc::clone(&self.baseline2opt),
            CallConv::Baseline => Arc::clone(&self.opt2baseline),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::MethodFlags;
    use crate::target::call_conv::OPT_SLOT_SIZE;
    use opal_core::Signature;

    fn method(descriptor: &str, flags: MethodFlags) -> Method {
        Method::new("T", "m", Signature::parse(descriptor).unwrap(), flags)
    }

    #[test]
    fn test_sig_equality_is_elementwise_kinds() {
        let a = Sig::of(&method("(ILjava/lang/String;)V", MethodFlags::STATIC));
        let b = Sig::of(&method("(ILjava/lang/Object;)I", MethodFlags::STATIC));
        // Same kind sequence, despite different classes and results.
        assert_eq!(a, b);
        let c = Sig::of(&method("(IJ)V", MethodFlags::STATIC));
        assert_ne!(a, c);
    }

    #[test]
    fn test_receiver_included_in_sig() {
        let s = Sig::of(&method("(I)V", MethodFlags::default()));
        assert_eq!(s.0, vec![Kind::Object, Kind::Int]);
        assert_eq!(s.to_string(), "(AI)");
    }

    #[test]
    fn test_frame_bytes_per_slot_size() {
        let sig = Sig(vec![Kind::Object, Kind::Int, Kind::Long]);
        assert_eq!(sig.frame_bytes(BASELINE_SLOT_SIZE), 16);
        assert_eq!(sig.frame_bytes(OPT_SLOT_SIZE), 32);
    }

    #[test]
    fn test_opt2baseline_elides_zero_arg_static() {
        let generator = AdapterGenerator::new(AdapterKind::Opt2Baseline);
        let callee = method("()V", MethodFlags::STATIC);
        let mut sink = Vec::new();
        assert!(generator.adapt(&callee, &mut sink).is_none());
        assert!(sink.is_empty());
        assert_eq!(generator.prologue_size_for_callee(&callee), 0);
    }

    #[test]
    fn test_baseline2opt_never_elided() {
        // Even parameterless calls need the frame pointer save/restore.
        let generator = AdapterGenerator::new(AdapterKind::Baseline2Opt);
        let callee = method("()V", MethodFlags::STATIC);
        let mut sink = Vec::new();
        let adapter = generator.adapt(&callee, &mut sink).expect("adapter built");
        assert!(!adapter.code().is_empty());
        assert_eq!(sink.len() as u32, OPT_ENTRY_OFFSET);
        // The prologue opens with a call to the adapter.
        assert_eq!(sink[0], 0xE8);
    }

    #[test]
    fn test_same_signature_shares_one_adapter() {
        let generator = AdapterGenerator::new(AdapterKind::Baseline2Opt);
        let a = generator
            .make(&method("(ILFoo;)V", MethodFlags::STATIC))
            .unwrap();
        let b = generator
            .make(&method("(ILBar;)I", MethodFlags::STATIC))
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        let c = generator.make(&method("(JI)V", MethodFlags::STATIC)).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_concurrent_requests_build_once() {
        use std::thread;
        let generator = Arc::new(AdapterGenerator::new(AdapterKind::Baseline2Opt));
        let callee = Arc::new(method("(Ljava/lang/Object;IJ)V", MethodFlags::STATIC));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let generator = Arc::clone(&generator);
            let callee = Arc::clone(&callee);
            handles.push(thread::spawn(move || {
                let mut sink = Vec::new();
                generator.adapt(&callee, &mut sink).expect("adapter")
            }));
        }
        let adapters: Vec<Arc<Adapter>> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();
        for other in &adapters[1..] {
            assert!(Arc::ptr_eq(&adapters[0], other));
        }
    }

    #[test]
    fn test_sink_duality_same_bytes() {
        let generator = AdapterGenerator::new(AdapterKind::Baseline2Opt);
        let callee = method("(II)I", MethodFlags::STATIC);
        let mut stream: Vec<u8> = Vec::new();
        generator.adapt(&callee, &mut stream).unwrap();
        let mut buffer = CodeBuffer::new(64);
        generator.adapt(&callee, &mut buffer).unwrap();
        assert_eq!(stream.as_slice(), buffer.bytes());
    }

    #[test]
    fn test_advance_if_in_prologue() {
        let generator = AdapterGenerator::new(AdapterKind::Baseline2Opt);
        let callee = method("(I)V", MethodFlags::STATIC);
        let read = |addr: u64| -> u64 {
            assert_eq!(addr, 0x7000);
            0xCAFE
        };
        let mut cursor = StackCursor {
            ip: 0x1004,
            sp: 0x7000,
            fp: 0x7100,
            read_word: &read,
        };
        // Inside the 8-byte prologue at 0x1000.
        assert!(generator.advance_if_in_prologue(&mut cursor, 0x1000, &callee));
        assert_eq!(cursor.ip, 0xCAFE);
        assert_eq!(cursor.sp, 0x7008);
        // Past the prologue: untouched.
        let mut cursor = StackCursor {
            ip: 0x1010,
            sp: 0x7000,
            fp: 0x7100,
            read_word: &read,
        };
        assert!(!generator.advance_if_in_prologue(&mut cursor, 0x1000, &callee));
    }

    #[test]
    fn test_registry_dispatch() {
        let registry = AdapterRegistry::init();
        let to_opt = registry
            .for_callee(CallConv::Optimized, CalleeCategory::Normal)
            .unwrap();
        assert_eq!(to_opt.kind(), AdapterKind::Baseline2Opt);
        let to_baseline = registry
            .for_callee(CallConv::Baseline, CalleeCategory::Normal)
            .unwrap();
        assert_eq!(to_baseline.kind(), AdapterKind::Opt2Baseline);
        // Never adapt adapters, templates or native stubs.
        assert!(registry
            .for_callee(CallConv::Optimized, CalleeCategory::Adapter)
            .is_none());
        assert!(registry
            .for_callee(CallConv::Optimized, CalleeCategory::Template)
            .is_none());
        assert!(registry
            .for_callee(CallConv::Optimized, CalleeCategory::NativeStub)
            .is_none());
        // A single-convention VM never adapts anything.
        let single = AdapterRegistry::single_convention();
        assert!(single
            .for_callee(CallConv::Optimized, CalleeCategory::Normal)
            .is_none());
    }
}
