//! The compile pipeline and its shared context.
//!
//! A [`Context`] owns everything that outlives one compilation: the target
//! description, the runtime and XIR interfaces, the options, the adapter
//! registry and the global stub cache. Each call to [`compile`] runs one
//! single-threaded compilation over its own arenas; many compilations may
//! run in parallel against one context.

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use opal_core::CompileResult;

use crate::adapter::{AdapterRegistry, CalleeCategory};
use crate::backend;
use crate::backend::x64::Assembler;
use crate::hir::builder::build_graph;
use crate::lir::gen::generate;
use crate::lir::{RuntimeCall, StubId};
use crate::options::Options;
use crate::regalloc;
use crate::runtime::{MethodRef, RuntimeInterface};
use crate::target::call_conv::CallConv;
use crate::target::registers::Gpr;
use crate::target::Target;
use crate::target_method::TargetMethod;
use crate::xir::XirRuntime;

/// Upper bound on one method's code size.
const CODE_LIMIT: usize = 512 * 1024;

/// Key of a cached global stub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StubKey {
    /// One of the shared throw stubs.
    Throw(StubId),
    /// A runtime-call trampoline.
    Runtime(RuntimeCall),
}

/// A lazily emitted, process-wide code stub.
#[derive(Debug)]
pub struct GlobalStub {
    pub key: StubKey,
    code: Vec<u8>,
}

impl GlobalStub {
    /// The stub's code bytes.
    pub fn code(&self) -> &[u8] {
        &self.code
    }
}

/// Process-wide compiler state, immutable apart from its guarded caches.
pub struct Context {
    pub target: Target,
    pub runtime: Arc<dyn RuntimeInterface>,
    pub xir: Arc<dyn XirRuntime>,
    pub options: Options,
    pub adapters: AdapterRegistry,
    stubs: Mutex<FxHashMap<StubKey, Arc<GlobalStub>>>,
}

impl Context {
    /// Build a context for the x64 target.
    pub fn new(
        runtime: Arc<dyn RuntimeInterface>,
        xir: Arc<dyn XirRuntime>,
        options: Options,
    ) -> Context {
        Context {
            target: Target::x64(),
            runtime,
            xir,
            options,
            adapters: AdapterRegistry::init(),
            stubs: Mutex::new(FxHashMap::default()),
        }
    }

    /// Get or lazily emit a global stub. The lock spans emission, so a
    /// missing stub is emitted exactly once.
    pub fn global_stub(&self, key: StubKey) -> Arc<GlobalStub> {
        let mut stubs = self.stubs.lock();
        let stub = stubs
            .entry(key)
            .or_insert_with(|| Arc::new(emit_global_stub(key)));
        Arc::clone(stub)
    }
}

/// A stub body: identify the request in R10, then jump to the runtime
/// entry (displacement patched at install).
fn emit_global_stub(key: StubKey) -> GlobalStub {
    let id: i64 = match key {
        StubKey::Throw(stub) => i64::from(stub.runtime_call().id()),
        StubKey::Runtime(call) => i64::from(call.id()),
    };
    let mut asm = Assembler::new(64);
    asm.mov_ri(Gpr::R10, id);
    asm.buf().emit_u8(0xE9);
    asm.buf().emit_u32(0);
    let code = asm.into_buffer().finish().expect("stub fits");
    GlobalStub { key, code }
}

/// Compile one method, or an OSR form of it when `osr_bci` is given.
///
/// Returns a sealed [`TargetMethod`] ready to install, or a bailout the
/// installer routes to a fallback compiler. Nothing is shared with the
/// caller on bailout; all intermediate arenas die here.
pub fn compile(
    ctx: &Context,
    method: &MethodRef,
    osr_bci: Option<u32>,
) -> CompileResult<TargetMethod> {
    let traced = ctx.options.matches_filter(&method.qualified_name());
    if traced {
        log::debug!("compiling {}", method.qualified_name());
    }

    let mut hir = build_graph(method, &*ctx.runtime, &ctx.options, osr_bci)?;
    if cfg!(debug_assertions) {
        hir.verify();
    }
    if traced {
        log::debug!(
            "{}: {} blocks, {} instructions",
            method.qualified_name(),
            hir.block_count(),
            hir.instr_count()
        );
    }

    let mut lir = generate(
        &mut hir,
        method,
        &ctx.target,
        &ctx.options,
        &*ctx.runtime,
        &*ctx.xir,
    )?;
    if cfg!(debug_assertions) {
        hir.verify();
    }

    let alloc = regalloc::allocate(&mut lir, &ctx.target)?;

    // The baseline entry of an optimized method runs the adapter prologue.
    let mut prologue: Vec<u8> = Vec::new();
    if let Some(generator) = ctx
        .adapters
        .for_callee(CallConv::Optimized, CalleeCategory::Normal)
    {
        generator.adapt(method, &mut prologue);
    }
    let baseline_prologue = if prologue.is_empty() {
        None
    } else {
        Some(prologue.as_slice())
    };

    let target_method = backend::emit(
        &lir,
        &alloc,
        method,
        &ctx.target,
        hir.osr_entry,
        baseline_prologue,
        CODE_LIMIT,
    )?;
    if traced {
        log::debug!(
            "{}: {} bytes, frame {}, {} stops",
            method.qualified_name(),
            target_method.code().len(),
            target_method.frame_size,
            target_method.stop_positions.len()
        );
    }
    Ok(target_method)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::HostRuntime;
    use crate::xir::GenericXir;

    fn context() -> Context {
        let runtime = Arc::new(HostRuntime);
        let xir = Arc::new(GenericXir::new(runtime.clone(), 0x7f00_0000));
        Context::new(runtime, xir, Options::default())
    }

    #[test]
    fn test_global_stub_emitted_once() {
        let ctx = context();
        let a = ctx.global_stub(StubKey::Throw(StubId::ThrowBoundsCheck));
        let b = ctx.global_stub(StubKey::Throw(StubId::ThrowBoundsCheck));
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!a.code().is_empty());
        let c = ctx.global_stub(StubKey::Runtime(RuntimeCall::MonitorEnter));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_stub_identifies_runtime_call() {
        let stub = emit_global_stub(StubKey::Throw(StubId::ThrowNullPointer));
        // mov r10, id starts the stub.
        assert_eq!(stub.code()[0], 0x49);
        assert_eq!(stub.code()[1], 0xC7);
    }
}
