//! Core machine behavior: pure programs, state, reader, writer, result,
//! call evaluation, combinators, and stack safety.

mod common;

use common::{just, run_default};
use doeff_core::effects::{
    ask, fail, get, listen, local, modify, put, recover, safe, slog, snapshot, tell,
};
use doeff_core::errors::EffectError;
use doeff_core::expr::{Co, Expr};
use doeff_core::program::Program;
use doeff_core::values::{NativeFn, Value};
use doeff_rt::{run, RunConfig};

use std::collections::BTreeMap;

#[test]
fn pure_program_returns_its_value() {
    let result = run_default(Program::pure(42));
    assert!(result.is_ok());
    assert_eq!(result.value(), Some(&Value::Int(42)));
    assert!(result.store.is_empty());
    assert!(result.log.is_empty());
}

#[test]
fn state_round_trip() {
    let program = Expr::gen(
        "round-trip",
        Co::bind(put("x", 7), |_| Co::just(get("x"))),
    );
    let result = run_default(program);
    assert_eq!(result.value(), Some(&Value::Int(7)));
    assert_eq!(result.store.get("x"), Some(&Value::Int(7)));
}

#[test]
fn get_of_missing_key_is_unit() {
    let result = run_default(just("get-missing", get("nope")));
    assert_eq!(result.value(), Some(&Value::Unit));
}

#[test]
fn modify_applies_and_returns_new_value() {
    let program = Expr::gen(
        "modify",
        Co::bind(put("n", 10), |_| {
            Co::just(modify("n", "double", |v| {
                Value::Int(v.as_int().unwrap_or(0) * 2)
            }))
        }),
    );
    let result = run_default(program);
    assert_eq!(result.value(), Some(&Value::Int(20)));
    assert_eq!(result.store.get("n"), Some(&Value::Int(20)));
}

#[test]
fn snapshot_copies_the_store() {
    let program = Expr::gen(
        "snapshot",
        Co::bind(put("a", 1), |_| {
            Co::bind(snapshot(), |snap| {
                Co::bind(put("a", 2), move |_| Co::done(snap))
            })
        }),
    );
    let result = run_default(program);
    let Some(Value::Map(snap)) = result.value() else {
        panic!("expected snapshot map, got {:?}", result.value());
    };
    assert_eq!(snap.get("a"), Some(&Value::Int(1)));
    assert_eq!(result.store.get("a"), Some(&Value::Int(2)));
}

#[test]
fn ask_reads_the_environment() {
    let mut env = BTreeMap::new();
    env.insert("who".to_string(), Value::Str("world".into()));
    let result = run(
        just("ask", ask("who")),
        RunConfig { env, ..Default::default() },
    );
    assert_eq!(result.value(), Some(&Value::Str("world".into())));
}

#[test]
fn missing_env_key_fails_with_typed_error() {
    let result = run_default(just("ask-missing", ask("nope")));
    assert!(result.is_err());
    let error = result.error().unwrap();
    assert_eq!(error.kind(), "MissingEnvKeyError");
    assert!(error.to_string().contains("nope"));
}

#[test]
fn missing_env_key_is_recoverable() {
    let result = run_default(just("safe-ask", safe(ask("nope"))));
    match result.value() {
        Some(Value::Err(e)) => {
            assert!(matches!(**e, EffectError::MissingEnvKey { .. }));
        }
        other => panic!("expected Err value, got {:?}", other),
    }
}

#[test]
fn local_overlays_scope_dynamically() {
    let mut env = BTreeMap::new();
    env.insert("k".to_string(), Value::Int(1));
    let program = Expr::gen(
        "local",
        Co::bind(
            local([("k".to_string(), Value::Int(2))], just("inner", ask("k"))),
            |inner| Co::bind(ask("k"), move |outer| {
                Co::done(Value::list([inner, outer]))
            }),
        ),
    );
    let result = run(program, RunConfig { env, ..Default::default() });
    assert_eq!(
        result.value(),
        Some(&Value::list([Value::Int(2), Value::Int(1)]))
    );
}

#[test]
fn lazy_env_entries_resolve_once_and_memoize() {
    let lazy = Expr::gen(
        "lazy-entry",
        Co::bind(tell("resolved"), |_| Co::done(Value::Int(42))),
    );
    let mut env = BTreeMap::new();
    env.insert("lazy".to_string(), Value::Program(Box::new(lazy)));
    let program = Expr::gen(
        "ask-twice",
        Co::bind(ask("lazy"), |first| {
            Co::bind(ask("lazy"), move |second| {
                Co::done(Value::list([first, second]))
            })
        }),
    );
    let result = run(program, RunConfig { env, ..Default::default() });
    assert_eq!(
        result.value(),
        Some(&Value::list([Value::Int(42), Value::Int(42)]))
    );
    // Resolved exactly once.
    assert_eq!(result.log, vec![Value::Str("resolved".into())]);
}

#[test]
fn writer_appends_in_program_order() {
    let program = Expr::gen(
        "tells",
        Co::bind(tell("one"), |_| {
            Co::bind(slog(Value::map([("k".to_string(), Value::Int(1))])), |_| {
                Co::bind(tell("two"), |_| Co::done(Value::Unit))
            })
        }),
    );
    let result = run_default(program);
    assert_eq!(result.log.len(), 3);
    assert_eq!(result.log[0], Value::Str("one".into()));
    assert_eq!(result.log[2], Value::Str("two".into()));
}

#[test]
fn listen_captures_a_private_log() {
    let inner = Expr::gen(
        "inner",
        Co::bind(tell("inner entry"), |_| Co::done("inner value")),
    );
    let program = Expr::gen(
        "listen",
        Co::bind(tell("outer entry"), move |_| Co::just(listen(inner))),
    );
    let result = run_default(program);
    let Some(Value::Map(listened)) = result.value() else {
        panic!("expected listen result map");
    };
    assert_eq!(listened.get("value"), Some(&Value::Str("inner value".into())));
    assert_eq!(
        listened.get("log"),
        Some(&Value::list([Value::Str("inner entry".into())]))
    );
    // The outer log is untouched by the inner entries.
    assert_eq!(result.log, vec![Value::Str("outer entry".into())]);
}

#[test]
fn safe_wraps_success_and_failure() {
    let ok = run_default(just("safe-ok", safe(Expr::pure(5))));
    assert_eq!(ok.value(), Some(&Value::ok(Value::Int(5))));

    let err = run_default(just(
        "safe-err",
        safe(fail(EffectError::failure("boom"))),
    ));
    match err.value() {
        Some(Value::Err(e)) => assert_eq!(e.to_string(), "boom"),
        other => panic!("expected Err value, got {:?}", other),
    }
}

#[test]
fn recover_substitutes_the_fallback() {
    let program = just(
        "recover",
        recover(fail(EffectError::failure("boom")), Expr::pure(99)),
    );
    let result = run_default(program);
    assert_eq!(result.value(), Some(&Value::Int(99)));
}

#[test]
fn recover_fallback_may_itself_be_a_program() {
    let fallback = Expr::gen(
        "fallback",
        Co::bind(put("recovered", true), |_| Co::done("fell back")),
    );
    let program = just(
        "recover-prog",
        recover(fail(EffectError::failure("boom")), fallback),
    );
    let result = run_default(program);
    assert_eq!(result.value(), Some(&Value::Str("fell back".into())));
    assert_eq!(result.store.get("recovered"), Some(&Value::Bool(true)));
}

#[test]
fn uncaught_failure_reaches_the_run_result() {
    let result = run_default(just("fail", fail(EffectError::failure("fatal-ish"))));
    assert!(result.is_err());
    assert_eq!(result.error().unwrap().kind(), "Failure");
    // Store and log still report final state.
    assert!(result.store.is_empty());
}

#[test]
fn call_evaluates_arguments_left_to_right() {
    let sum = NativeFn::new("sum", |args| {
        let mut total = 0;
        for a in &args {
            total += a.expect_int()?;
        }
        Ok(Value::Int(total))
    });
    let program = Expr::gen(
        "call",
        Co::bind(put("x", 2), move |_| {
            Co::just(Expr::call(sum, [get("x"), Expr::pure(3)]))
        }),
    );
    let result = run_default(program);
    assert_eq!(result.value(), Some(&Value::Int(5)));
}

#[test]
fn call_result_program_is_evaluated() {
    let make_program = NativeFn::new("make_program", |_| {
        Ok(Value::Program(Box::new(put("made", 1))))
    });
    let program = Expr::gen(
        "call-program",
        Co::bind(Expr::call(make_program, []), |_| Co::just(get("made"))),
    );
    let result = run_default(program);
    assert_eq!(result.value(), Some(&Value::Int(1)));
}

#[test]
fn program_combinators_compose() {
    let doubled = Program::pure(21).map(|v| Value::Int(v.as_int().unwrap() * 2));
    assert_eq!(run_default(doubled).value(), Some(&Value::Int(42)));

    let chained = Program::pure(3).flat_map(|v| put("n", v)).then(get("n"));
    assert_eq!(run_default(chained).value(), Some(&Value::Int(3)));

    let seq = Program::sequence([
        Expr::pure(1),
        Expr::pure(2),
        Expr::pure(3),
    ]);
    assert_eq!(
        run_default(seq).value(),
        Some(&Value::list([Value::Int(1), Value::Int(2), Value::Int(3)]))
    );

    let dict = Program::dict([
        ("a".to_string(), Expr::pure(1)),
        ("b".to_string(), Expr::pure(2)),
    ]);
    let result = run_default(dict);
    let Some(Value::Map(map)) = result.value() else { panic!("expected map") };
    assert_eq!(map.get("a"), Some(&Value::Int(1)));
    assert_eq!(map.get("b"), Some(&Value::Int(2)));

    let set = Program::set([Expr::pure(1), Expr::pure(1), Expr::pure(2)]);
    assert_eq!(
        run_default(set).value(),
        Some(&Value::list([Value::Int(1), Value::Int(2)]))
    );

    let traversed = Program::traverse(
        [Value::Int(1), Value::Int(2)],
        |v| Expr::pure(Value::Int(v.as_int().unwrap() * 10)),
    );
    assert_eq!(
        run_default(traversed).value(),
        Some(&Value::list([Value::Int(10), Value::Int(20)]))
    );
}

#[test]
fn deep_bind_chains_do_not_grow_the_host_stack() {
    fn countdown(n: i64) -> Co {
        if n == 0 {
            Co::done(Value::Int(0))
        } else {
            Co::bind(Expr::pure(n - 1), |v| countdown(v.as_int().unwrap()))
        }
    }
    let result = run_default(Expr::gen("countdown", countdown(50_000)));
    assert_eq!(result.value(), Some(&Value::Int(0)));
}

#[test]
fn repeated_runs_are_deterministic() {
    let build = || {
        Expr::gen(
            "det",
            Co::bind(put("a", 1), |_| {
                Co::bind(tell("step"), |_| Co::just(get("a")))
            }),
        )
    };
    let first = run_default(build());
    let second = run_default(build());
    assert_eq!(first.value(), second.value());
    assert_eq!(first.store, second.store);
    assert_eq!(first.log, second.log);
}

#[test]
fn consuming_a_program_twice_is_an_error() {
    let shared = Expr::gen("one-shot", Co::done(Value::Int(1)));
    let program = Expr::gen(
        "use-twice",
        Co::bind(shared.clone(), move |_| Co::just(shared)),
    );
    let result = run_default(program);
    assert!(result.is_err());
    assert!(result.error().unwrap().to_string().contains("already consumed"));
}
