//! Public API surface: async_run, run_program env merging, the cache
//! handler family, and result accessors.

mod common;

use common::{just, run_default};
use doeff_core::effects::{
    ask, cache_delete, cache_exists, cache_get, cache_put, safe,
};
use doeff_core::errors::EffectError;
use doeff_core::expr::{Co, Expr, Handler};
use doeff_core::program::Program;
use doeff_core::values::Value;
use doeff_rt::{
    async_run, default_handlers, run, run_program, EnvSource, MemoryCache,
    RunConfig, RunProgramOptions,
};

use std::collections::BTreeMap;
use std::sync::Arc;

#[test]
fn async_run_joins_with_the_same_result() {
    let handle = async_run(Program::pure(9), RunConfig::default());
    let result = handle.join();
    assert_eq!(result.value(), Some(&Value::Int(9)));
}

#[test]
fn async_run_can_be_polled() {
    let handle = async_run(Program::pure(1), RunConfig::default());
    // Either the poll or the join observes the value.
    let result = loop {
        if let Some(r) = handle.try_join() {
            break r;
        }
        std::thread::yield_now();
    };
    assert_eq!(result.value(), Some(&Value::Int(1)));
}

#[test]
fn run_program_merges_env_maps_in_order() {
    let mut first = BTreeMap::new();
    first.insert("who".to_string(), Value::Str("first".into()));
    first.insert("keep".to_string(), Value::Int(1));
    let mut second = BTreeMap::new();
    second.insert("who".to_string(), Value::Str("second".into()));

    let program = Expr::gen(
        "program",
        Co::bind(ask("who"), |who| {
            Co::bind(ask("keep"), move |keep| {
                Co::done(Value::list([who, keep]))
            })
        }),
    );
    let outcome = run_program(
        program,
        RunProgramOptions {
            envs: vec![EnvSource::Map(first), EnvSource::Map(second)],
            load_default_env: false,
            ..Default::default()
        },
    );
    assert_eq!(
        outcome.run_result.value(),
        Some(&Value::list([Value::Str("second".into()), Value::Int(1)]))
    );
    assert_eq!(outcome.env_sources, vec!["<map>", "<map>"]);
}

#[test]
fn run_program_loads_env_files() {
    let dir = std::env::temp_dir().join("doeff_api_tests");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("env.toml");
    std::fs::write(&path, "greeting = \"hello\"\ncount = 3\n").unwrap();

    let outcome = run_program(
        just("ask", ask("greeting")),
        RunProgramOptions {
            envs: vec![EnvSource::File(path.clone())],
            load_default_env: false,
            ..Default::default()
        },
    );
    assert_eq!(
        outcome.run_result.value(),
        Some(&Value::Str("hello".into()))
    );
    let _ = std::fs::remove_file(path);
}

#[test]
fn run_program_env_programs_must_yield_maps() {
    let outcome = run_program(
        Program::pure(1),
        RunProgramOptions {
            envs: vec![EnvSource::Program(Expr::pure(7))],
            load_default_env: false,
            ..Default::default()
        },
    );
    assert!(outcome.run_result.is_err());
    assert!(outcome
        .run_result
        .error()
        .unwrap()
        .to_string()
        .contains("must yield a map"));
}

#[test]
fn env_programs_run_before_the_main_program() {
    let env_program = Expr::gen(
        "env",
        Co::done(Value::map([("who".to_string(), Value::Str("generated".into()))])),
    );
    let outcome = run_program(
        just("ask", ask("who")),
        RunProgramOptions {
            envs: vec![EnvSource::Program(env_program)],
            load_default_env: false,
            ..Default::default()
        },
    );
    assert_eq!(
        outcome.run_result.value(),
        Some(&Value::Str("generated".into()))
    );
}

fn with_cache() -> Vec<Handler> {
    let mut handlers = default_handlers();
    handlers.push(Handler::Cache(Arc::new(MemoryCache::new())));
    handlers
}

#[test]
fn cache_round_trip_through_effects() {
    let program = Expr::gen(
        "cache",
        Co::bind(cache_put("k", 42), |_| {
            Co::bind(cache_exists("k"), |exists| {
                Co::bind(cache_get("k"), move |v| {
                    Co::bind(cache_delete("k"), move |removed| {
                        Co::bind(cache_exists("k"), move |after| {
                            Co::done(Value::list([
                                exists.clone(),
                                v.clone(),
                                removed.clone(),
                                after,
                            ]))
                        })
                    })
                })
            })
        }),
    );
    let result = run(program, RunConfig { handlers: with_cache(), ..Default::default() });
    assert_eq!(
        result.value(),
        Some(&Value::list([
            Value::Bool(true),
            Value::Int(42),
            Value::Bool(true),
            Value::Bool(false),
        ]))
    );
}

#[test]
fn cache_miss_is_recoverable() {
    let program = just("miss", safe(cache_get("absent")));
    let result = run(program, RunConfig { handlers: with_cache(), ..Default::default() });
    match result.value() {
        Some(Value::Err(e)) => {
            assert!(matches!(**e, EffectError::CacheMiss { .. }))
        }
        other => panic!("expected Err value, got {:?}", other),
    }
}

#[test]
fn cache_effects_without_a_cache_handler_are_unhandled() {
    let result = run_default(just("miss", cache_get("k")));
    assert!(result.is_err());
    assert_eq!(result.error().unwrap().kind(), "MissingHandlerError");
}

#[test]
fn run_result_accessors_agree() {
    let ok = run_default(Program::pure(5));
    assert!(ok.is_ok() && !ok.is_err());
    assert!(ok.error().is_none());

    let err = run_default(just(
        "failing",
        doeff_core::effects::fail(EffectError::failure("nope")),
    ));
    assert!(err.is_err() && !err.is_ok());
    assert!(err.value().is_none());
    assert_eq!(err.into_result().unwrap_err().to_string(), "nope");
}
