//! Doeff RT — the effect machine and its services.
//!
//! Provides the virtual machine (handler dispatch, one-shot
//! continuations, cooperative scheduler, promises and semaphores), the
//! built-in effect handlers, failure traces, cache backends, and the
//! public `run`/`async_run` API.
#![warn(clippy::all)]

pub mod api;
pub mod cache;
pub mod nonblocking;
pub mod trace;
pub mod vm;

pub use api::{
    async_run, default_handlers, run, run_program, EnvSource, ProgramRunResult,
    RaceResult, RunConfig, RunHandle, RunProgramOptions, RunResult,
};
pub use cache::{cache_key, json_to_value, JsonFileCache, MemoryCache};
pub use nonblocking::{nonblocking_await_handler, with_nonblocking_await};
pub use trace::{EffectTrace, HandlerStatus, RunError, TraceEntry};

// Re-export the core IR so downstream code needs a single dependency.
pub use doeff_core::{
    cache::CacheBackend,
    effects, errors,
    expr::{Co, Continuation, Coroutine, Expr, Handler},
    program::Program,
    values::{Awaitable, ExternalPromise, SemaphoreId, TaskId, Value},
    EffectError,
};
