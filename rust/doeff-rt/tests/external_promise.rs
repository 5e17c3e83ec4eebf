//! External promises and the await bridges: completions from host
//! threads, the inline sync await, and the non-blocking background
//! bridge.

mod common;

use common::{just, run_default, OrderLog};
use doeff_core::effects::{await_, create_external_promise, gather, modify, spawn, wait};
use doeff_core::errors::EffectError;
use doeff_core::expr::{Co, Expr};
use doeff_core::values::{Awaitable, ExternalPromise, Value};
use doeff_rt::{run, with_nonblocking_await, RunConfig};

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

#[test]
fn sync_await_runs_the_thunk_inline() {
    let program = just(
        "await",
        await_(Awaitable::new("answer", || Ok(Value::Int(5)))),
    );
    let result = run_default(program);
    assert_eq!(result.value(), Some(&Value::Int(5)));
}

#[test]
fn sync_await_propagates_thunk_failures() {
    let program = just(
        "await-fail",
        doeff_core::effects::safe(await_(Awaitable::new("broken", || {
            Err(EffectError::failure("io failed"))
        }))),
    );
    let result = run_default(program);
    match result.value() {
        Some(Value::Err(e)) => assert_eq!(e.to_string(), "io failed"),
        other => panic!("expected Err value, got {:?}", other),
    }
}

#[test]
fn external_promise_completed_from_another_thread() {
    let (handle_tx, handle_rx) = mpsc::channel::<ExternalPromise>();
    thread::spawn(move || {
        let promise = handle_rx.recv().expect("promise handle");
        thread::sleep(Duration::from_millis(10));
        promise.complete(Value::Int(5));
    });

    let program = Expr::gen(
        "external",
        Co::bind(create_external_promise(), move |pv| {
            let Value::External(promise) = pv.clone() else {
                panic!("expected external promise");
            };
            handle_tx.send(promise).expect("send handle");
            Co::just(wait(pv))
        }),
    );
    let result = run_default(program);
    assert_eq!(result.value(), Some(&Value::Int(5)));
}

#[test]
fn external_promise_failure_rejects_the_waiter() {
    let program = Expr::gen(
        "external-fail",
        Co::bind(create_external_promise(), move |pv| {
            let Value::External(promise) = pv.clone() else {
                panic!("expected external promise");
            };
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(5));
                promise.fail(EffectError::failure("remote exploded"));
            });
            Co::just(doeff_core::effects::safe(wait(pv)))
        }),
    );
    let result = run_default(program);
    match result.value() {
        Some(Value::Err(e)) => assert_eq!(e.to_string(), "remote exploded"),
        other => panic!("expected Err value, got {:?}", other),
    }
}

#[test]
fn first_external_completion_wins() {
    let program = Expr::gen(
        "double-complete",
        Co::bind(create_external_promise(), move |pv| {
            let Value::External(promise) = pv.clone() else {
                panic!("expected external promise");
            };
            promise.complete(Value::Int(1));
            promise.complete(Value::Int(2));
            Co::just(wait(pv))
        }),
    );
    let result = run_default(program);
    assert_eq!(result.value(), Some(&Value::Int(1)));
}

#[test]
fn nonblocking_await_returns_the_result_transparently() {
    let program = with_nonblocking_await(just(
        "await",
        await_(Awaitable::new("slow", || {
            thread::sleep(Duration::from_millis(10));
            Ok(Value::Int(7))
        })),
    ));
    let result = run(program, RunConfig::default());
    assert_eq!(result.value(), Some(&Value::Int(7)));
}

#[test]
fn nonblocking_await_lets_siblings_progress() {
    let order = OrderLog::new();
    let slow_order = order.clone();
    let slow = Expr::gen(
        "slow",
        Co::bind(
            await_(Awaitable::new("slow-io", move || {
                thread::sleep(Duration::from_millis(50));
                Ok(Value::Int(1))
            })),
            move |v| Co::bind(slow_order.mark("slow-done"), move |_| Co::done(v)),
        ),
    );
    let quick_order = order.clone();
    let quick = just(
        "quick",
        modify("n", "bump", move |v| {
            quick_order.push("quick-ran");
            Value::Int(v.as_int().unwrap_or(0) + 1)
        }),
    );
    let program = with_nonblocking_await(Expr::gen(
        "program",
        Co::bind(spawn(slow), move |t1| {
            Co::bind(spawn(quick), move |t2| Co::just(gather([t1, t2])))
        }),
    ));
    let result = run(program, RunConfig::default());
    assert!(result.is_ok());
    // The quick sibling ran while the slow await was parked off-thread.
    assert_eq!(order.entries(), vec!["quick-ran", "slow-done"]);
}
