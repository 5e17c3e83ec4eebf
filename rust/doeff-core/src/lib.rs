//! Doeff Core
//!
//! Shared IR of the effect machine: the dynamic value universe, the
//! effect catalog, the expression/continuation node kinds, the coroutine
//! bridge, and the program combinators used across the runtime and CLI.
#![warn(clippy::all)]

pub mod cache;
pub mod effects;
pub mod errors;
pub mod expr;
pub mod program;
pub mod values;

pub use cache::CacheBackend;
pub use effects::{
    Effect, EffectKind, EffectTag, UserEffect, INTERPRETER_KEY, PRIORITY_HIGH,
    PRIORITY_IDLE, PRIORITY_NORMAL,
};
pub use errors::EffectError;
pub use expr::{
    Co, CoGen, CoStep, Continuation, Coroutine, DoExpr, Expr, Handler, HandlerFn,
    ReturnClause, UserHandler,
};
pub use program::Program;
pub use values::{
    Awaitable, ExternalCompletion, ExternalPromise, NativeFn, PromiseId, SemaphoreId,
    TaskId, UpdateFn, Value,
};
