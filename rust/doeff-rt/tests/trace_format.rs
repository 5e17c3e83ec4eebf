//! Structured failure traces: handler chains, spawn separators, cause
//! links, and the deterministic text rendering.

mod common;

use common::{just, run_default, Ping};
use doeff_core::effects::{fail, perform_user, spawn, wait};
use doeff_core::errors::EffectError;
use doeff_core::expr::{Co, Expr, Handler};
use doeff_rt::TraceEntry;

#[test]
fn failure_inside_a_spawned_task_records_the_spawn_boundary() {
    let worker = just("worker", fail(EffectError::failure("child boom")));
    let program = Expr::gen(
        "program",
        Co::bind(spawn(worker), |task| Co::just(wait(task))),
    );
    let result = run_default(program);
    assert!(result.is_err());
    let trace = result.trace.as_ref().expect("trace on failure");
    assert!(trace
        .entries
        .iter()
        .any(|e| matches!(e, TraceEntry::SpawnBoundary { .. })));
    let rendered = result.error().unwrap().render_trace();
    assert!(rendered.contains("── in task"));
    assert!(rendered.contains("child boom"));
}

#[test]
fn handler_body_failure_is_marked_in_the_chain() {
    let exploding = Handler::user("exploding", |_effect, _k| {
        Co::bind(Expr::pure(0), |_| {
            Co::fail(EffectError::failure("handler boom"))
        })
    });
    let program = Expr::with_handler(exploding, just("ping", perform_user(Ping)));
    let result = run_default(program);
    assert!(result.is_err());
    let trace = result.trace.as_ref().expect("trace on failure");
    assert!(trace.entries.iter().any(|e| matches!(
        e,
        TraceEntry::HandlerFrame { handler, .. } if handler == "exploding"
    )));
    let rendered = result.error().unwrap().render_trace();
    assert!(rendered.contains("handler exploding [failed]"));
}

#[test]
fn unwound_scopes_appear_in_the_trace() {
    let program = just("failing", fail(EffectError::failure("boom")));
    let result = run_default(program);
    let trace = result.trace.as_ref().expect("trace on failure");
    // The failure unwound through the default handler scopes.
    assert!(trace
        .entries
        .iter()
        .any(|e| matches!(e, TraceEntry::Scope { .. })));
}

#[test]
fn cause_chains_render_outermost_first() {
    let inner = EffectError::failure("db unreachable");
    let outer = EffectError::failure_with_cause("login failed", inner);
    let result = run_default(just("failing", fail(outer)));
    let rendered = result.error().unwrap().render_trace();
    let login = rendered.find("login failed").unwrap();
    let db = rendered.find("db unreachable").unwrap();
    assert!(login < db);
}

#[test]
fn trace_is_absent_on_success() {
    let result = run_default(Expr::pure(1));
    assert!(result.trace.is_none());
}

#[test]
fn effect_creation_sites_are_recorded_when_enabled() {
    // Debug builds capture sites by default (DOEFF_DEBUG aside).
    if !doeff_core::effects::effect_sites_enabled() {
        return;
    }
    let result = run_default(just("ask", doeff_core::effects::ask("missing")));
    let trace = result.trace.as_ref().expect("trace on failure");
    let has_sited_effect = trace.entries.iter().any(|e| {
        matches!(e, TraceEntry::Effect { site: Some(site), .. } if site.contains(".rs"))
    });
    assert!(has_sited_effect);
}
