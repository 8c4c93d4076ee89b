//! Shared fixtures: IR programs built through the builder API, plus the host
//! glue (symbols, strategy) the scenarios need.

// Each integration binary uses a different slice of the fixtures.
#![allow(dead_code)]

use tracelet::ir::builder::{FunctionBuilder, ModuleBuilder};
use tracelet::ir::{BinOp, Const, FuncTy, Pred, Ty, ValueRef};
use tracelet::Session;

pub fn i64t() -> Ty {
    Ty::int(64)
}

fn global_ref(name: &str) -> ValueRef {
    ValueRef::Const(Const::Global(name.to_string()))
}

/// The x86-64 style va-list record: {i32 index, i32 pad, *stack, *reg}.
pub fn va_list_ty() -> Ty {
    Ty::Struct(vec![
        Ty::int(32),
        Ty::int(32),
        Ty::ptr(Ty::int(8)),
        Ty::ptr(Ty::int(8)),
    ])
}

/// fn zero() -> i64 { return 0 }
fn build_zero() -> FunctionBuilder {
    let mut f = FunctionBuilder::new("zero", FuncTy::new(i64t(), vec![]));
    let z = f.iconst(64, 0);
    f.ret(Some(z));
    f
}

/// fn add2(a, b) = a + b
fn build_add2() -> FunctionBuilder {
    let mut f = FunctionBuilder::new("add2", FuncTy::new(i64t(), vec![i64t(), i64t()]));
    let (a, b) = (f.arg(0), f.arg(1));
    let sum = f.add(i64t(), a, b);
    f.ret(Some(sum));
    f
}

/// fn char_at(s) = s[1], sign-extended to i64
fn build_char_at() -> FunctionBuilder {
    let mut f = FunctionBuilder::new(
        "char_at",
        FuncTy::new(i64t(), vec![Ty::ptr(Ty::int(8))]),
    );
    let s = f.arg(0);
    let one = f.iconst(64, 1);
    let p = f.gep(Ty::int(8), s, &[one]);
    let c = f.load(Ty::int(8), p);
    let wide = f.sext(i64t(), c);
    f.ret(Some(wide));
    f
}

/// fn str_test() = char_at("hello world")
fn build_str_test() -> FunctionBuilder {
    let mut f = FunctionBuilder::new("str_test", FuncTy::new(i64t(), vec![]));
    let zero = f.iconst(32, 0);
    let s = f.gep(
        Ty::array(Ty::int(8), 12),
        global_ref("greeting"),
        &[zero.clone(), zero],
    );
    let r = f.call_named(i64t(), "char_at", &[s]);
    f.ret(Some(r));
    f
}

/// The C switch ladder with a fallthrough:
///
/// ```c
/// switch (x) {
///     case 1: return y;
///     case 2: y += 1;        // falls through
///     case 3: break;
///     default: return x;
/// }
/// return x + y;
/// ```
fn build_switch_test() -> FunctionBuilder {
    let mut f = FunctionBuilder::new(
        "switch_test",
        FuncTy::new(i64t(), vec![i64t(), i64t()]),
    );
    let case1 = f.create_block();
    let case2 = f.create_block();
    let case3 = f.create_block();
    let fallback = f.create_block();
    let (x, y) = (f.arg(0), f.arg(1));

    f.switch(
        x.clone(),
        vec![(1, case1), (2, case2), (3, case3)],
        fallback,
    );

    f.switch_to_block(case1);
    f.ret(Some(y.clone()));

    f.switch_to_block(case2);
    let one = f.iconst(64, 1);
    let y2 = f.add(i64t(), y.clone(), one);
    f.br(case3);

    f.switch_to_block(case3);
    let entry = f.entry();
    let y3 = f.phi(i64t(), vec![(entry, y), (case2, y2)]);
    let sum = f.add(i64t(), x.clone(), y3);
    f.ret(Some(sum));

    f.switch_to_block(fallback);
    f.ret(Some(x));
    f
}

/// fn fib(n) = n < 2 ? n : fib(n-1) + fib(n-2)
fn build_fib() -> FunctionBuilder {
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
    f
}

/// fn set_one(p) { *p = 1 } and fn poke() { let x; set_one(&x); return x }
fn build_poke() -> (FunctionBuilder, FunctionBuilder) {
    let mut set_one = FunctionBuilder::new(
        "set_one",
        FuncTy::new(Ty::Void, vec![Ty::ptr(i64t())]),
    );
    let p = set_one.arg(0);
    let one = set_one.iconst(64, 1);
    set_one.store(one, p);
    set_one.ret(None);

    let mut poke = FunctionBuilder::new("poke", FuncTy::new(i64t(), vec![]));
    let slot = poke.alloca(i64t());
    poke.call_named(Ty::Void, "set_one", &[slot.clone()]);
    let v = poke.load(i64t(), slot);
    poke.ret(Some(v));
    (set_one, poke)
}

/// fn element(i) = table[i], where `table` lives in host memory
fn build_element() -> FunctionBuilder {
    let mut f = FunctionBuilder::new("element", FuncTy::new(i64t(), vec![i64t()]));
    let i = f.arg(0);
    let zero = f.iconst(32, 0);
    let p = f.gep(Ty::array(Ty::int(32), 6), global_ref("table"), &[zero, i]);
    let v = f.load(Ty::int(32), p);
    let wide = f.sext(i64t(), v);
    f.ret(Some(wide));
    f
}

/// fn use_host(x) = host_mul2(x), an opaque native call
fn build_use_host() -> FunctionBuilder {
    let mut f = FunctionBuilder::new("use_host", FuncTy::new(i64t(), vec![i64t()]));
    let x = f.arg(0);
    let r = f.call_named(i64t(), "host_mul2", &[x]);
    f.ret(Some(r));
    f
}

/// fn use_opaque(x) = rt_format_error(x); the registered IR body disagrees
/// with the native implementation so tests can observe which one ran.
fn build_opaque_pair() -> (FunctionBuilder, FunctionBuilder) {
    let mut fake = FunctionBuilder::new(
        "rt_format_error",
        FuncTy::new(i64t(), vec![i64t()]),
    );
    let x = fake.arg(0);
    let hundred = fake.iconst(64, 100);
    let wrong = fake.mul(i64t(), x, hundred);
    fake.ret(Some(wrong));

    let mut caller = FunctionBuilder::new("use_opaque", FuncTy::new(i64t(), vec![i64t()]));
    let x = caller.arg(0);
    let r = caller.call_named(i64t(), "rt_format_error", &[x]);
    caller.ret(Some(r));
    (fake, caller)
}

/// Variadic sum in the shape C's va_arg expansion takes:
///
/// ```c
/// long sum(long n, ...) {
///     va_list va; va_start(va, n);
///     long acc = 0;
///     for (long i = 0; i < n; i++) acc += va_arg(va, long);
///     va_end(va);
///     return acc;
/// }
/// ```
fn build_sum() -> FunctionBuilder {
    let va_ty = va_list_ty();
    let mut f = FunctionBuilder::new("sum", FuncTy::variadic(i64t(), vec![i64t()]));
    let loop_head = f.create_block();
    let loop_body = f.create_block();
    let reg_blk = f.create_block();
    let stack_blk = f.create_block();
    let merge = f.create_block();
    let exit = f.create_block();
    let entry = f.entry();

    let n = f.arg(0);
    let va = f.alloca(va_ty.clone());
    f.call_named(Ty::Void, "va.begin", &[va.clone()]);
    f.br(loop_head);

    f.switch_to_block(loop_head);
    let zero = f.iconst(64, 0);
    let i = f.phi(i64t(), vec![(entry, zero.clone())]);
    let acc = f.phi(i64t(), vec![(entry, zero)]);
    let more = f.cmp(Pred::Slt, i.clone(), n);
    f.cond_br(more, loop_body, exit);

    f.switch_to_block(loop_body);
    let c0 = f.iconst(32, 0);
    let c0b = f.iconst(32, 0);
    let idx_slot = f.gep(va_ty.clone(), va.clone(), &[c0, c0b]);
    let idx = f.load(Ty::int(32), idx_slot.clone());
    let limit = f.iconst(32, 48);
    let in_reg = f.cmp(Pred::Slt, idx.clone(), limit);
    f.cond_br(in_reg, reg_blk, stack_blk);

    f.switch_to_block(reg_blk);
    let c0 = f.iconst(32, 0);
    let c3 = f.iconst(32, 3);
    let reg_field = f.gep(va_ty.clone(), va.clone(), &[c0, c3]);
    let reg_area = f.load(Ty::ptr(Ty::int(8)), reg_field);
    let reg_addr = f.gep(Ty::int(8), reg_area, &[idx.clone()]);
    let reg_ptr = f.bitcast(Ty::ptr(i64t()), reg_addr);
    let reg_val = f.load(i64t(), reg_ptr);
    f.br(merge);

    f.switch_to_block(stack_blk);
    let c0 = f.iconst(32, 0);
    let c2 = f.iconst(32, 2);
    let stack_field = f.gep(va_ty.clone(), va.clone(), &[c0, c2]);
    let stack_area = f.load(Ty::ptr(Ty::int(8)), stack_field);
    let limit = f.iconst(32, 48);
    let off = f.sub(Ty::int(32), idx.clone(), limit);
    let stack_addr = f.gep(Ty::int(8), stack_area, &[off]);
    let stack_ptr = f.bitcast(Ty::ptr(i64t()), stack_addr);
    let stack_val = f.load(i64t(), stack_ptr);
    f.br(merge);

    f.switch_to_block(merge);
    let v = f.phi(i64t(), vec![(reg_blk, reg_val), (stack_blk, stack_val)]);
    let eight = f.iconst(32, 8);
    let idx_next = f.add(Ty::int(32), idx, eight);
    f.store(idx_next, idx_slot);
    let one = f.iconst(64, 1);
    let acc_next = f.add(i64t(), acc.clone(), v);
    let i_next = f.add(i64t(), i.clone(), one);
    f.add_phi_incoming(&i, merge, i_next);
    f.add_phi_incoming(&acc, merge, acc_next);
    f.br(loop_head);

    f.switch_to_block(exit);
    f.call_named(Ty::Void, "va.end", &[va]);
    f.ret(Some(acc));
    f
}

/// fn sum_two(x, y) = sum(2, x, y)
fn build_sum_two() -> FunctionBuilder {
    let mut f = FunctionBuilder::new("sum_two", FuncTy::new(i64t(), vec![i64t(), i64t()]));
    let two = f.iconst(64, 2);
    let (x, y) = (f.arg(0), f.arg(1));
    let r = f.call_named(i64t(), "sum", &[two, x, y]);
    f.ret(Some(r));
    f
}

/// fn sum_ten() = sum(10, 1, 2, ..., 10), spilling past the register area
fn build_sum_ten() -> FunctionBuilder {
    let mut f = FunctionBuilder::new("sum_ten", FuncTy::new(i64t(), vec![]));
    let mut args = vec![f.iconst(64, 10)];
    args.extend((1..=10).map(|v| f.iconst(64, v)));
    let r = f.call_named(i64t(), "sum", &args);
    f.ret(Some(r));
    f
}

/// fn shifts(x) = ((x << 3) | (x & 0xF0)) >> 1, logical
fn build_shifts() -> FunctionBuilder {
    let mut f = FunctionBuilder::new("shifts", FuncTy::new(i64t(), vec![i64t()]));
    let x = f.arg(0);
    let three = f.iconst(64, 3);
    let mask = f.iconst(64, 0xF0);
    let one = f.iconst(64, 1);
    let shifted = f.bin(BinOp::Shl, i64t(), x.clone(), three);
    let masked = f.bin(BinOp::And, i64t(), x, mask);
    let merged = f.bin(BinOp::Or, i64t(), shifted, masked);
    let out = f.bin(BinOp::Lshr, i64t(), merged, one);
    f.ret(Some(out));
    f
}

/// Host-provided implementations the fixtures call natively.
pub extern "C" fn host_mul2(x: i64) -> i64 {
    x * 2
}

pub extern "C" fn host_format_error(x: i64) -> i64 {
    x + 1
}

/// Host-resolved table global read by `element`.
pub static TABLE: [i32; 6] = [1, 2, 3, 4, 5, 6];

/// Build the whole scenario module set and a session wired to it.
pub fn scenario_session() -> Session {
    let mut mb = ModuleBuilder::new("scenarios");
    mb.global(
        "greeting",
        Ty::array(Ty::int(8), 12),
        Some(b"hello world\0".to_vec()),
        true,
        true,
    );
    mb.global("table", Ty::array(Ty::int(32), 6), None, false, false);
    mb.declare("va.begin", FuncTy::new(Ty::Void, vec![Ty::ptr(va_list_ty())]));
    mb.declare("va.end", FuncTy::new(Ty::Void, vec![Ty::ptr(va_list_ty())]));
    mb.declare("host_mul2", FuncTy::new(i64t(), vec![i64t()]));

    mb.define(build_zero().finish());
    mb.define(build_add2().finish());
    mb.define(build_char_at().finish());
    mb.define(build_str_test().finish());
    mb.define(build_switch_test().finish());
    mb.define(build_fib().finish());
    let (set_one, poke) = build_poke();
    mb.define(set_one.finish());
    mb.define(poke.finish());
    mb.define(build_element().finish());
    mb.define(build_use_host().finish());
    let (fake_format, use_opaque) = build_opaque_pair();
    mb.define(fake_format.finish());
    mb.define(use_opaque.finish());
    mb.define(build_sum().finish());
    mb.define(build_sum_two().finish());
    mb.define(build_sum_ten().finish());
    mb.define(build_shifts().finish());

    let mut session = Session::new();
    session
        .register_symbol("host_mul2", host_mul2 as usize)
        .unwrap();
    session
        .register_symbol("rt_format_error", host_format_error as usize)
        .unwrap();
    session
        .register_symbol("table", TABLE.as_ptr() as usize)
        .unwrap();
    session
        .strategy_mut()
        .never_trace_address(host_mul2 as usize);
    session.register_module(mb.finish()).unwrap();
    session
}

/// Run a named target through the session, returning the result.
pub fn run_named(session: &Session, name: &str, args: &[i64]) -> i64 {
    let target = session
        .jit_target_named(name, args.len())
        .unwrap_or_else(|e| panic!("no target for {}: {}", name, e));
    session
        .try_run(&target, args)
        .unwrap_or_else(|e| panic!("running {} failed: {}", name, e))
}
