//! Emission throughput benchmarks.
//!
//! Measures the raw assembler and the whole pipeline on a small hot
//! method, the shapes install-time compilation cares about.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;

use opal_core::bytecode::opcodes::*;
use opal_core::Signature;
use opal_jit::compile::{compile, Context};
use opal_jit::options::Options;
use opal_jit::runtime::{HostRuntime, Method, MethodCode, MethodFlags, TablePool};
use opal_jit::xir::GenericXir;

fn bench_assembler(c: &mut Criterion) {
    use opal_jit::backend::x64::{Assembler, Mem};
    use opal_jit::target::registers::Gpr;

    let mut group = c.benchmark_group("assembler");
    group.bench_function("mov_add_loop", |b| {
        b.iter(|| {
            let mut asm = Assembler::new(64 * 1024);
            for i in 0..512 {
                asm.mov_rm(true, Gpr::Rax, &Mem::base(Gpr::Rbp, -8 * (i % 16) - 8));
                asm.add_ri(true, Gpr::Rax, i);
                asm.mov_mr(true, &Mem::base(Gpr::Rbp, -8), Gpr::Rax);
            }
            black_box(asm.into_buffer().finish().unwrap())
        })
    });
    group.finish();
}

fn bench_pipeline(c: &mut Criterion) {
    let runtime = Arc::new(HostRuntime);
    let xir = Arc::new(GenericXir::new(runtime.clone(), 0x7f80_0000_0000));
    let ctx = Context::new(runtime, xir, Options::default());
    let method = Arc::new(
        Method::new(
            "bench/B",
            "sum",
            Signature::parse("(I)I").unwrap(),
            MethodFlags::STATIC,
        )
        .with_code(MethodCode {
            bytecode: vec![
                ICONST_0, ISTORE_1, ICONST_0, ISTORE_2, ILOAD_2, ILOAD_0, IF_ICMPGE, 0, 13,
                ILOAD_1, ILOAD_2, IADD, ISTORE_1, IINC, 2, 1, GOTO, 0xff, (-12i8) as u8,
                ILOAD_1, IRETURN,
            ],
            max_stack: 2,
            max_locals: 3,
            handlers: vec![],
            pool: Arc::new(TablePool::new()),
        }),
    );

    let mut group = c.benchmark_group("pipeline");
    group.bench_function("compile_loop_method", |b| {
        b.iter(|| black_box(compile(&ctx, &method, None).unwrap()))
    });
    group.finish();
}

criterion_group!(benches, bench_assembler, bench_pipeline);
criterion_main!(benches);
