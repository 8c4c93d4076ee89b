//! End-to-end scenarios: interpreting a target must match the function's
//! direct semantics, and invoking the compiled trace with the same arguments
//! must match the interpreted result.

mod common;

use common::{run_named, scenario_session};

#[test]
fn returns_zero() {
    let session = scenario_session();
    assert_eq!(run_named(&session, "zero", &[]), 0);
    // Same result through the cached trace.
    assert_eq!(run_named(&session, "zero", &[]), 0);
}

#[test]
fn adds_two_numbers() {
    let session = scenario_session();
    assert_eq!(run_named(&session, "add2", &[3, 5]), 8);
    // Nothing is pinned in pure arithmetic; the trace generalizes.
    assert_eq!(run_named(&session, "add2", &[3, 5]), 8);
    assert_eq!(run_named(&session, "add2", &[-7, 7]), 0);
    assert_eq!(run_named(&session, "add2", &[i64::MAX, 1]), i64::MIN);
}

#[test]
fn indexes_a_string_constant() {
    let session = scenario_session();
    // 'e' out of "hello world", through an inlined callee.
    assert_eq!(run_named(&session, "str_test", &[]), 101);
    assert_eq!(run_named(&session, "str_test", &[]), 101);
}

#[test]
fn switch_ladder_with_fallthrough() {
    // One session per case: each discriminant pins its own trace.
    for (x, expected) in [(0, 0), (1, 5), (2, 8), (3, 8), (4, 4)] {
        let session = scenario_session();
        assert_eq!(run_named(&session, "switch_test", &[x, 5]), expected);
        // Replay through the compiled trace with the pinned discriminant.
        assert_eq!(run_named(&session, "switch_test", &[x, 5]), expected);
    }
}

#[test]
fn fib_recurses_through_inlining() {
    let session = scenario_session();
    assert_eq!(run_named(&session, "fib", &[6]), 8);
    assert_eq!(run_named(&session, "fib", &[6]), 8);
}

#[test]
fn stores_through_a_passed_pointer() {
    let session = scenario_session();
    assert_eq!(run_named(&session, "poke", &[]), 1);
    assert_eq!(run_named(&session, "poke", &[]), 1);
}

#[test]
fn reads_host_resolved_global() {
    let session = scenario_session();
    assert_eq!(run_named(&session, "element", &[3]), 4);
    // No branch depends on the index, so the cached trace serves fresh ones.
    assert_eq!(run_named(&session, "element", &[0]), 1);
    assert_eq!(run_named(&session, "element", &[5]), 6);
}

#[test]
fn never_traced_callee_goes_native() {
    let session = scenario_session();
    assert_eq!(run_named(&session, "use_host", &[21]), 42);
    // The compiled trace links the same native callee.
    assert_eq!(run_named(&session, "use_host", &[4]), 8);
}

#[test]
fn opaque_name_beats_registered_body() {
    let session = scenario_session();
    // The registered body computes x*100; the native implementation x+1
    // must win because the name is on the opaque list.
    assert_eq!(run_named(&session, "use_opaque", &[7]), 8);
    assert_eq!(run_named(&session, "use_opaque", &[41]), 42);
}

#[test]
fn width_aware_bit_operations() {
    let session = scenario_session();
    // ((6 << 3) | (6 & 0xF0)) >> 1 = 24
    assert_eq!(run_named(&session, "shifts", &[6]), 24);
    // Logical shift of a negative value stays logical.
    let x = -2i64;
    let expected = (((x << 3) as u64 | (x & 0xF0) as u64) >> 1) as i64;
    assert_eq!(run_named(&session, "shifts", &[x]), expected);
}

#[test]
fn target_cache_transitions_once() {
    let session = scenario_session();
    let target = session.jit_target_named("add2", 2).unwrap();
    assert!(target.compiled().is_none());

    assert_eq!(session.try_run(&target, &[1, 2]).unwrap(), 3);
    let code = target.compiled().expect("first run compiles");

    assert_eq!(session.try_run(&target, &[30, 12]).unwrap(), 42);
    assert_eq!(target.compiled(), Some(code));

    // The cache hands back the same entry for the same address.
    let again = session.jit_target_named("add2", 2).unwrap();
    assert_eq!(again.compiled(), Some(code));
}
