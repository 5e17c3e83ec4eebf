//! Non-blocking await bridge.
//!
//! The default `SyncAwait` handler runs awaitables inline, which blocks
//! the machine thread. This handler instead submits the awaitable to a
//! persistent background bridge thread and parks only the requesting
//! task on an external promise, so sibling tasks keep running while the
//! awaitable is in flight.
//!
//! The handler is transparent: `await_(...)` still yields the actual
//! result. To get concurrency, spawn multiple tasks that each await.
//!
//! The bridge thread is started lazily on first use and left running for
//! the life of the process (it is detached, like a daemon thread).

use doeff_core::effects::{create_external_promise, wait, EffectKind};
use doeff_core::errors::EffectError;
use doeff_core::expr::{Co, Expr, Handler};
use doeff_core::values::{ExternalPromise, Value};

use crossbeam_channel::{unbounded, Sender};
use once_cell::sync::Lazy;

type BridgeThunk = Box<dyn FnOnce() -> Result<Value, EffectError> + Send>;

struct Job {
    thunk: BridgeThunk,
    promise: ExternalPromise,
}

static BRIDGE: Lazy<Sender<Job>> = Lazy::new(|| {
    let (tx, rx) = unbounded::<Job>();
    std::thread::Builder::new()
        .name("doeff-await-bridge".to_string())
        .spawn(move || {
            while let Ok(job) = rx.recv() {
                match (job.thunk)() {
                    Ok(v) => {
                        job.promise.complete(v);
                    }
                    Err(e) => {
                        job.promise.fail(e);
                    }
                }
            }
        })
        .expect("spawn await bridge thread");
    tx
});

fn submit(job: Job) {
    // A send can only fail if the bridge thread died, which it never
    // does on its own; surface that as a failed promise.
    if let Err(e) = BRIDGE.send(job) {
        let job = e.into_inner();
        job.promise
            .fail(EffectError::failure("await bridge thread is gone"));
    }
}

/// A handler that intercepts `Await` and runs the awaitable off-thread.
///
/// Everything else is passed outward, and the handler's own
/// `CreateExternalPromise`/`Wait` effects dispatch to the scheduler
/// handler outside it, so install this *inside* the default stack:
/// `run(with_nonblocking_await(program), RunConfig::default())`.
pub fn nonblocking_await_handler() -> Handler {
    Handler::user("nonblocking-await", |effect, k| {
        let EffectKind::Await { awaitable } = &effect.kind else {
            return Co::just(Expr::Pass);
        };
        let awaitable = awaitable.clone();
        Co::bind(create_external_promise(), move |promise_value| {
            let Value::External(promise) = promise_value.clone() else {
                return Co::fail(EffectError::type_error(
                    "CreateExternalPromise yielded a non-promise",
                ));
            };
            match awaitable.take() {
                None => Co::fail(EffectError::type_error(
                    "awaitable was already consumed",
                )),
                Some(thunk) => {
                    submit(Job { thunk, promise });
                    Co::bind(wait(promise_value), move |v| {
                        Co::just(Expr::resume(k, v))
                    })
                }
            }
        })
    })
}

/// Wrap a program so its awaits go through the background bridge.
pub fn with_nonblocking_await(program: Expr) -> Expr {
    Expr::with_handler(nonblocking_await_handler(), program)
}
