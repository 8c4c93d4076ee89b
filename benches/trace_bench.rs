//! Interpreted trace building vs cached native invocation.

use criterion::{criterion_group, criterion_main, Criterion};

use tracelet::ir::builder::{FunctionBuilder, ModuleBuilder};
use tracelet::ir::{FuncTy, Pred, Ty};
use tracelet::Session;

fn i64t() -> Ty {
    Ty::int(64)
}

fn fib_session() -> Session {
    let mut f = FunctionBuilder::new("fib", FuncTy::new(i64t(), vec![i64t()]));
    let base = f.create_block();
    let rec = f.create_block();
    let n = f.arg(0);
    let two = f.iconst(64, 2);
    let c = f.cmp(Pred::Slt, n.clone(), two);
    f.cond_br(c, base, rec);
    f.switch_to_block(base);
    f.ret(Some(n.clone()));
    f.switch_to_block(rec);
    let one = f.iconst(64, 1);
    let two = f.iconst(64, 2);
    let n1 = f.sub(i64t(), n.clone(), one);
    let a = f.call_named(i64t(), "fib", &[n1]);
    let n2 = f.sub(i64t(), n, two);
    let b = f.call_named(i64t(), "fib", &[n2]);
    let r = f.add(i64t(), a, b);
    f.ret(Some(r));

    let mut mb = ModuleBuilder::new("bench");
    mb.define(f.finish());
    let mut session = Session::new();
    session.register_module(mb.finish()).unwrap();
    session
}

fn bench_build_trace(c: &mut Criterion) {
    let session = fib_session();
    let mut group = c.benchmark_group("trace");
    group.sample_size(10);
    group.bench_function("build_fib_10", |b| {
        b.iter(|| {
            let artifact = session.trace_function("fib", &[10]).unwrap();
            assert_eq!(artifact.result, 55);
        })
    });
    group.finish();
}

fn bench_cached_run(c: &mut Criterion) {
    let session = fib_session();
    let target = session
        .jit_target(session.address_of("fib").unwrap(), 1)
        .unwrap();
    // Warm the cache once; everything after is the native pointer.
    assert_eq!(session.try_run(&target, &[10]).unwrap(), 55);

    c.bench_function("run_compiled_fib_10", |b| {
        b.iter(|| {
            let r = session.try_run(&target, &[10]).unwrap();
            assert_eq!(r, 55);
        })
    });
}

criterion_group!(benches, bench_build_trace, bench_cached_run);
criterion_main!(benches);
