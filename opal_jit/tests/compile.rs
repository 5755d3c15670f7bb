//! End-to-end pipeline tests: bytecode in, sealed target method out,
//! checked against the observable side tables.

use std::sync::Arc;

use opal_core::bytecode::opcodes::*;
use opal_core::{Kind, Signature};

use opal_jit::compile::{compile, Context};
use opal_jit::options::Options;
use opal_jit::runtime::{
    ClassInfo, ExceptionHandler, HostRuntime, Method, MethodCode, MethodFlags, MethodRef,
    TablePool,
};
use opal_jit::target_method::{BASELINE_ENTRY_OFFSET, OPT_ENTRY_OFFSET};
use opal_jit::xir::GenericXir;

fn context() -> Context {
    let runtime = Arc::new(HostRuntime);
    let xir = Arc::new(GenericXir::new(runtime.clone(), 0x7f80_0000_0000));
    Context::new(runtime, xir, Options::default())
}

fn static_method(
    descriptor: &str,
    code: Vec<u8>,
    max_stack: u16,
    max_locals: u16,
    pool: TablePool,
    handlers: Vec<ExceptionHandler>,
) -> MethodRef {
    Arc::new(
        Method::new(
            "demo/Demo",
            "m",
            Signature::parse(descriptor).unwrap(),
            MethodFlags::STATIC,
        )
        .with_code(MethodCode {
            bytecode: code,
            max_stack,
            max_locals,
            handlers,
            pool: Arc::new(pool),
        }),
    )
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

#[test]
fn empty_void_method_compiles_to_prologue_and_return() {
    let ctx = context();
    let method = static_method("()V", vec![RETURN], 0, 0, TablePool::new(), vec![]);
    let tm = compile(&ctx, &method, None).expect("compiles");

    assert_eq!(tm.baseline_entry_offset, BASELINE_ENTRY_OFFSET);
    assert_eq!(tm.opt_entry_offset, OPT_ENTRY_OFFSET);
    assert!(tm.direct_calls.is_empty());
    assert!(tm.safepoints.is_empty());
    assert!(tm.exception_handlers.is_empty());
    assert_eq!(tm.frame_size % 16, 0);
    // push rbp; mov rbp, rsp at the optimized entry.
    assert_eq!(tm.code()[OPT_ENTRY_OFFSET as usize], 0x55);
    // The epilogue tears the frame down and returns.
    assert!(contains(tm.code(), &[0xC9, 0xC3]));
}

#[test]
fn static_add_has_no_stops_and_one_return() {
    let ctx = context();
    let method = static_method(
        "(II)I",
        vec![ILOAD_0, ILOAD_1, IADD, IRETURN],
        2,
        2,
        TablePool::new(),
        vec![],
    );
    let tm = compile(&ctx, &method, None).expect("compiles");
    assert!(tm.stop_positions.is_empty());
    assert!(tm.exception_handlers.is_empty());
    assert!(tm.safepoints.is_empty());
    // Exactly one ret.
    assert_eq!(tm.code().iter().filter(|&&b| b == 0xC3).count(), 1);
}

#[test]
fn counting_loop_polls_at_the_back_edge() {
    // int sum(int n) { int s = 0; for (int i = 0; i < n; i++) s += i; return s; }
    let code = vec![
        ICONST_0, ISTORE_1, ICONST_0, ISTORE_2, ILOAD_2, ILOAD_0, IF_ICMPGE, 0, 13,
        ILOAD_1, ILOAD_2, IADD, ISTORE_1, IINC, 2, 1, GOTO, 0xff, (-12i8) as u8,
        ILOAD_1, IRETURN,
    ];
    let ctx = context();
    let method = static_method("(I)I", code, 2, 3, TablePool::new(), vec![]);
    let tm = compile(&ctx, &method, None).expect("compiles");
    assert!(!tm.safepoints.is_empty(), "loop back edge polls");
    for sp in &tm.safepoints {
        assert!((sp.pos as usize) < tm.code().len());
        assert!(tm.stop_positions.contains(&sp.pos));
    }
}

#[test]
fn catch_block_produces_one_typed_handler_entry() {
    // try { m(); return 0; } catch (ArithmeticException e) { return -1; }
    let callee = Arc::new(Method::new(
        "demo/Other",
        "m",
        Signature::parse("()V").unwrap(),
        MethodFlags::STATIC,
    ));
    let arithmetic_exception = Arc::new(ClassInfo {
        name: "java/lang/ArithmeticException".to_string(),
        id: 41,
        elem_kind: None,
    });
    let mut pool = TablePool::new();
    pool.set_method(1, callee);
    let code = vec![INVOKESTATIC, 0, 1, ICONST_0, IRETURN, POP, ICONST_M1, IRETURN];
    let handlers = vec![ExceptionHandler {
        start_bci: 0,
        end_bci: 3,
        handler_bci: 5,
        catch_type: Some(arithmetic_exception),
    }];
    let ctx = context();
    let method = static_method("()I", code, 1, 0, pool, handlers);
    let tm = compile(&ctx, &method, None).expect("compiles");

    assert_eq!(tm.direct_calls.len(), 1);
    assert_eq!(tm.exception_handlers.len(), 1);
    let entry = &tm.exception_handlers[0];
    // The try position is the call site of m().
    assert_eq!(entry.try_pos, tm.direct_calls[0].pos);
    assert!((entry.catch_pos as usize) < tm.code().len());
    assert_eq!(entry.catch_type.as_ref().unwrap().id, 41);
    // Calls are stop positions.
    assert!(tm.stop_positions.contains(&tm.direct_calls[0].pos));
}

#[test]
fn shared_contiguous_switch_cases_compile() {
    // switch(x) { case 0: case 1: return 1; case 5: return 2; default: return 0; }
    let mut code = vec![ILOAD_0, LOOKUPSWITCH, 0, 0];
    code.extend_from_slice(&39i32.to_be_bytes()); // default -> 40
    code.extend_from_slice(&3i32.to_be_bytes());
    for (key, offset) in [(0i32, 35i32), (1, 35), (5, 37)] {
        code.extend_from_slice(&key.to_be_bytes());
        code.extend_from_slice(&offset.to_be_bytes());
    }
    code.extend_from_slice(&[ICONST_1, IRETURN, ICONST_2, IRETURN, ICONST_0, IRETURN]);
    let ctx = context();
    let method = static_method("(I)I", code, 1, 1, TablePool::new(), vec![]);
    let tm = compile(&ctx, &method, None).expect("compiles");
    assert!(tm.exception_handlers.is_empty());
    assert_eq!(tm.code().iter().filter(|&&b| b == 0xC3).count(), 3);
}

#[test]
fn volatile_reads_need_no_fence_on_tso() {
    // Two back-to-back volatile loads: the architecture demands no fence
    // for a read, so neither emits one.
    let holder = Arc::new(ClassInfo {
        name: "demo/Demo".to_string(),
        id: 9,
        elem_kind: None,
    });
    let field = opal_jit::runtime::FieldRef {
        holder,
        name: "v".to_string(),
        kind: Kind::Int,
        offset: 16,
        is_static: false,
        is_volatile: true,
    };
    let mut pool = TablePool::new();
    pool.set_field(1, field);
    let code = vec![
        ALOAD_0, GETFIELD, 0, 1, ALOAD_0, GETFIELD, 0, 1, IADD, IRETURN,
    ];
    let method = Arc::new(
        Method::new(
            "demo/Demo",
            "g",
            Signature::parse("(Ldemo/Demo;)I").unwrap(),
            MethodFlags::STATIC,
        )
        .with_code(MethodCode {
            bytecode: code,
            max_stack: 2,
            max_locals: 1,
            handlers: vec![],
            pool: Arc::new(pool),
        }),
    );
    let ctx = context();
    let tm = compile(&ctx, &method, None).expect("compiles");
    // No mfence anywhere in the emitted code.
    assert!(!contains(tm.code(), &[0x0F, 0xAE, 0xF0]));
}

#[test]
fn volatile_store_fences_once() {
    let holder = Arc::new(ClassInfo {
        name: "demo/Demo".to_string(),
        id: 9,
        elem_kind: None,
    });
    let field = opal_jit::runtime::FieldRef {
        holder,
        name: "v".to_string(),
        kind: Kind::Int,
        offset: 16,
        is_static: false,
        is_volatile: true,
    };
    let mut pool = TablePool::new();
    pool.set_field(1, field);
    let code = vec![ALOAD_0, ILOAD_1, PUTFIELD, 0, 1, RETURN];
    let method = Arc::new(
        Method::new(
            "demo/Demo",
            "s",
            Signature::parse("(Ldemo/Demo;I)V").unwrap(),
            MethodFlags::STATIC,
        )
        .with_code(MethodCode {
            bytecode: code,
            max_stack: 2,
            max_locals: 2,
            handlers: vec![],
            pool: Arc::new(pool),
        }),
    );
    let ctx = context();
    let tm = compile(&ctx, &method, None).expect("compiles");
    let fences = tm
        .code()
        .windows(3)
        .filter(|w| *w == [0x0F, 0xAE, 0xF0])
        .count();
    assert_eq!(fences, 1);
}

#[test]
fn forwarding_redirects_both_entries() {
    let ctx = context();
    let method = static_method("()V", vec![RETURN], 0, 0, TablePool::new(), vec![]);
    let mut old = compile(&ctx, &method, None).unwrap();
    let mut new = compile(&ctx, &method, None).unwrap();
    old.set_code_start(0x10_0000);
    new.set_code_start(0x20_0000);
    old.forward_to(&new);
    assert_eq!(old.code()[BASELINE_ENTRY_OFFSET as usize], 0xE9);
    assert_eq!(old.code()[OPT_ENTRY_OFFSET as usize], 0xE9);
}

#[test]
fn array_sum_records_bounds_stub_calls() {
    // int first(int[] a) { return a[0]; }
    let code = vec![ALOAD_0, ICONST_0, IALOAD, IRETURN];
    let ctx = context();
    let method = static_method("([I)I", code, 2, 1, TablePool::new(), vec![]);
    let tm = compile(&ctx, &method, None).expect("compiles");
    // Null check and range check both route to shared stubs.
    assert!(tm.global_stub_calls.len() >= 2);
    for stub in &tm.global_stub_calls {
        assert!((stub.pos as usize) < tm.code().len());
    }
}

#[test]
fn object_allocation_goes_through_runtime_and_literals() {
    let foo = Arc::new(ClassInfo {
        name: "demo/Foo".to_string(),
        id: 3,
        elem_kind: None,
    });
    let mut pool = TablePool::new();
    pool.set_class(1, foo);
    let code = vec![NEW, 0, 1, ARETURN];
    let ctx = context();
    let method = static_method("()Ldemo/Foo;", code, 1, 0, pool, vec![]);
    let tm = compile(&ctx, &method, None).expect("compiles");
    // The generic XIR lowers allocation to a runtime call whose class
    // argument is an object literal.
    assert!(!tm.runtime_calls.is_empty());
    assert!(!tm.reference_literals.is_empty());
    // Every data patch refers to a pooled literal.
    for patch in &tm.data_patches {
        assert!(tm.reference_literals.contains(&patch.constant));
    }
}

#[test]
fn osr_compilation_records_entry_offset() {
    let code = vec![
        ICONST_0, ISTORE_1, ICONST_0, ISTORE_2, ILOAD_2, ILOAD_0, IF_ICMPGE, 0, 13,
        ILOAD_1, ILOAD_2, IADD, ISTORE_1, IINC, 2, 1, GOTO, 0xff, (-12i8) as u8,
        ILOAD_1, IRETURN,
    ];
    let ctx = context();
    let method = static_method("(I)I", code, 2, 3, TablePool::new(), vec![]);
    let tm = compile(&ctx, &method, Some(4)).expect("compiles for osr");
    let osr = tm.osr_entry_offset.expect("osr entry recorded");
    assert!((osr as usize) < tm.code().len());
}

#[test]
fn bailouts_surface_cleanly() {
    let ctx = context();
    // jsr is not supported.
    let method = static_method("()V", vec![JSR, 0, 3, RETURN], 1, 0, TablePool::new(), vec![]);
    assert!(compile(&ctx, &method, None).is_err());
    // Unresolved field with patching off.
    let method = static_method(
        "()I",
        vec![GETSTATIC, 0, 5, IRETURN],
        1,
        0,
        TablePool::new(),
        vec![],
    );
    assert!(compile(&ctx, &method, None).is_err());
}
