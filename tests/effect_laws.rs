//! Algebraic laws and stack-safety properties of the effect type.

use pureio::test_utils::init_test_logging;
use pureio::{Effect, Error, ErrorKind};

fn run<A: Send + 'static>(effect: Effect<A>) -> pureio::Result<A> {
    effect.run_sync()
}

#[test]
fn monad_left_identity() {
    init_test_logging();
    // pure(a).flat_map(f) == f(a)
    let f = |n: u32| Effect::pure(n * 2);
    let lhs = run(Effect::pure(21).flat_map(f)).unwrap();
    let rhs = run(f(21)).unwrap();
    assert_eq!(lhs, rhs);
}

#[test]
fn monad_right_identity() {
    init_test_logging();
    // m.flat_map(pure) == m
    let lhs = run(Effect::delay(|| 17).flat_map(Effect::pure)).unwrap();
    let rhs = run(Effect::delay(|| 17)).unwrap();
    assert_eq!(lhs, rhs);
}

#[test]
fn monad_associativity() {
    init_test_logging();
    // m.flat_map(f).flat_map(g) == m.flat_map(|x| f(x).flat_map(g))
    let m = || Effect::delay(|| 3_u32);
    let f = |n: u32| Effect::pure(n + 1);
    let g = |n: u32| Effect::pure(n * 10);

    let lhs = run(m().flat_map(f).flat_map(g)).unwrap();
    let rhs = run(m().flat_map(move |x| f(x).flat_map(g))).unwrap();
    assert_eq!(lhs, rhs);
    assert_eq!(lhs, 40);
}

#[test]
fn error_law_handle_recovers_raise() {
    init_test_logging();
    // raise_error(e).handle_error_with(f) == f(e)
    let f = |e: Error| Effect::pure(e.to_string());
    let raised: Effect<String> = Effect::raise_error(Error::user("boom"));
    let lhs = run(raised.handle_error_with(f)).unwrap();
    let rhs = run(f(Error::user("boom"))).unwrap();
    assert_eq!(lhs, rhs);
}

#[test]
fn error_law_handle_ignores_pure() {
    init_test_logging();
    // pure(a).handle_error_with(_) == pure(a)
    let handled = Effect::pure(6).handle_error_with(|_| Effect::pure(0));
    assert_eq!(run(handled).unwrap(), 6);
}

#[test]
fn deferred_law_complete_then_get() {
    init_test_logging();
    // Deferred[A].flat_map(|d| d.complete(a) >> d.get()) == pure(a)
    let program = pureio::sync::deferred::<u32>().flat_map(|cell| {
        let reader = cell.clone();
        cell.complete(99).flat_map(move |()| reader.get())
    });
    assert_eq!(run(program).unwrap(), 99);
}

#[test]
fn stack_safety_left_nested_binds() {
    init_test_logging();
    let mut effect = Effect::pure(0_u64);
    for _ in 0..100_000 {
        effect = effect.flat_map(|n| Effect::pure(n + 1));
    }
    assert_eq!(run(effect).unwrap(), 100_000);
}

#[test]
fn stack_safety_left_nested_maps() {
    init_test_logging();
    let mut effect = Effect::pure(0_u64);
    for _ in 0..100_000 {
        effect = effect.map(|n| n + 1);
    }
    assert_eq!(run(effect).unwrap(), 100_000);
}

#[test]
fn stack_safety_nested_attempts() {
    init_test_logging();
    let mut effect = Effect::pure(0_u64);
    for _ in 0..100_000 {
        effect = effect.attempt().flat_map(|r| match r {
            Ok(n) => Effect::pure(n + 1),
            Err(e) => Effect::raise_error(e),
        });
    }
    assert_eq!(run(effect).unwrap(), 100_000);
}

#[test]
fn stack_safety_nested_recoveries() {
    init_test_logging();
    let mut effect = Effect::pure(0_u64);
    for _ in 0..100_000 {
        effect = effect.handle_error_with(|_| Effect::pure(0)).map(|n| n + 1);
    }
    assert_eq!(run(effect).unwrap(), 100_000);
}

#[test]
fn stack_safety_suspend_recursion() {
    init_test_logging();
    fn countdown(n: u64, acc: u64) -> Effect<u64> {
        Effect::suspend(move || {
            if n == 0 {
                Effect::pure(acc)
            } else {
                countdown(n - 1, acc + 1)
            }
        })
    }
    assert_eq!(run(countdown(100_000, 0)).unwrap(), 100_000);
}

#[test]
fn attempt_flat_map_fold_reaches_ten_thousand() {
    init_test_logging();
    // Folding 10,000 attempt/flat_map steps from pure(0), incrementing on Ok.
    let mut effect = Effect::pure(0_u32);
    for _ in 0..10_000 {
        effect = effect.attempt().flat_map(|r| match r {
            Ok(n) => Effect::pure(n + 1),
            Err(e) => Effect::raise_error(e),
        });
    }
    assert_eq!(run(effect).unwrap(), 10_000);
}

#[test]
fn raise_error_skips_intermediate_work() {
    init_test_logging();
    let effect: Effect<u32> = Effect::raise_error(Error::user("early"))
        .map(|n: u32| n + 1)
        .flat_map(|n| Effect::pure(n * 2));
    let err = run(effect).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::User);
    assert_eq!(err.to_string(), "User: early");
}

#[test]
fn redeem_is_attempt_plus_fold() {
    init_test_logging();
    let ok = Effect::pure(4).redeem(|_| 0_u32, |n| n + 1);
    assert_eq!(run(ok).unwrap(), 5);

    let failed: Effect<u32> = Effect::raise_error(Error::user("x"));
    let folded = failed.redeem(|_| 0_u32, |n| n + 1);
    assert_eq!(run(folded).unwrap(), 0);
}
