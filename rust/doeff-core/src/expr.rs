//! Expression IR and the coroutine ("do-notation") bridge.
//!
//! The machine interprets a closed set of expression kinds: pure values,
//! effect requests, generator-backed do-expressions, and the control
//! nodes of the handler dispatch protocol. Do-expressions are driven
//! through the [`Coroutine`] trait; the [`Co`] builder compiles
//! do-notation into a stackless chain of `FnOnce` states, so every
//! suspension point is an explicit state transition rather than a stack
//! frame.
//!
//! # Invariants
//!
//! 1. Expressions are acyclic; a generator that yields its own
//!    `DoExpr` is a program error surfaced as a consumed-generator
//!    `TypeError`.
//! 2. A `DoExpr` cell is one-shot: evaluating it a second time fails
//!    instead of silently re-running the underlying coroutine.
//! 3. `Coroutine::close` is idempotent, and the machine calls it on
//!    every discard path (cancellation, handler abandonment, failure
//!    unwind, normal completion).

use crate::cache::CacheBackend;
use crate::effects::Effect;
use crate::errors::EffectError;
use crate::values::{NativeFn, Value};

use std::fmt;
use std::sync::{Arc, Mutex};

// ---------------------------------------------------------------------------
// Continuation handle
// ---------------------------------------------------------------------------

/// Opaque handle to a captured one-shot continuation.
///
/// The `token` is a per-capture generation stamp; a stale handle (one
/// whose record has already been consumed) compares unequal against the
/// live generation and resuming it is a fatal contract error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Continuation {
    pub id: u64,
    pub token: u64,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// A user handler body factory: `(effect, k) -> Co`.
pub type HandlerFn = Arc<dyn Fn(Effect, Continuation) -> Co + Send + Sync>;

/// A user-supplied handler with a display name for traces.
#[derive(Clone)]
pub struct UserHandler {
    name: Arc<str>,
    f: HandlerFn,
}

impl UserHandler {
    pub fn new(
        name: impl Into<String>,
        f: impl Fn(Effect, Continuation) -> Co + Send + Sync + 'static,
    ) -> Self {
        Self { name: name.into().into(), f: Arc::new(f) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn body(&self, effect: Effect, k: Continuation) -> Co {
        (self.f)(effect, k)
    }
}

impl fmt::Debug for UserHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserHandler({})", self.name)
    }
}

/// A handler installable with `WithHandler`.
///
/// Built-in handlers are interpreted natively by the machine (a switch on
/// the effect kind); user handlers run through the full generator
/// dispatch protocol. Both occupy positions on the handler stack, so a
/// user handler installed inside a built-in one shadows it for the kinds
/// it chooses to handle.
#[derive(Clone)]
pub enum Handler {
    /// `Get` / `Put` / `Modify` / `AtomicGet` / `AtomicUpdate` / `Snapshot`.
    State,
    /// `Ask` / `Dep` / `Local`, including lazy program-valued env entries.
    Reader,
    /// `Tell` / `StructuredLog` / `Listen`.
    Writer,
    /// `Safe` / `Recover` / `Fail`.
    Result,
    /// `Spawn` / `Wait` / `Gather` / `Parallel` / `Race` / `Cancel` and
    /// the semaphore and external-promise primitives.
    Scheduler,
    /// `Await`, executed inline on the machine thread.
    SyncAwait,
    /// `CacheGet` / `CachePut` / `CacheExists` / `CacheDelete` against a
    /// pluggable backend.
    Cache(Arc<dyn CacheBackend>),
    /// A user handler driven through the generator protocol.
    User(UserHandler),
}

impl Handler {
    pub fn user(
        name: impl Into<String>,
        f: impl Fn(Effect, Continuation) -> Co + Send + Sync + 'static,
    ) -> Self {
        Handler::User(UserHandler::new(name, f))
    }

    /// Display name used by traces.
    pub fn name(&self) -> String {
        match self {
            Handler::State => "state".to_string(),
            Handler::Reader => "reader".to_string(),
            Handler::Writer => "writer".to_string(),
            Handler::Result => "result".to_string(),
            Handler::Scheduler => "scheduler".to_string(),
            Handler::SyncAwait => "sync-await".to_string(),
            Handler::Cache(_) => "cache".to_string(),
            Handler::User(h) => h.name().to_string(),
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handler({})", self.name())
    }
}

/// Transform applied to a `WithHandler` scope's final value.
#[derive(Clone)]
pub struct ReturnClause(Arc<dyn Fn(Value) -> Expr + Send + Sync>);

impl ReturnClause {
    pub fn new(f: impl Fn(Value) -> Expr + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn apply(&self, v: Value) -> Expr {
        (self.0)(v)
    }
}

impl fmt::Debug for ReturnClause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReturnClause")
    }
}

// ---------------------------------------------------------------------------
// Expression IR
// ---------------------------------------------------------------------------

/// A node the machine can evaluate.
#[derive(Debug, Clone)]
pub enum Expr {
    /// A resolved value.
    Pure(Value),
    /// Request handler dispatch for an effect.
    Effect(Effect),
    /// Like `Effect`, but legal inside handler bodies: dispatch starts at
    /// the handler's own position, not at the innermost frame.
    Perform(Effect),
    /// A lazy generator-backed sequence of expressions.
    Do(DoExpr),
    /// Establish a handler scope over `body`, optionally transforming the
    /// scope's final value.
    WithHandler {
        handler: Handler,
        body: Box<Expr>,
        return_clause: Option<ReturnClause>,
    },
    /// Supply `value` to a captured continuation; evaluates to the
    /// resumed computation's result.
    Resume { k: Continuation, value: Box<Value> },
    /// Within a handler body: re-raise the dispatched effect outward.
    Delegate,
    /// Within a handler body: decline the effect ("not my kind").
    Pass,
    /// Evaluate every argument left-to-right, then invoke `f`.
    Call { f: NativeFn, args: Vec<Expr> },
    /// Low-level resume: splice the continuation without re-installing
    /// the handler scope it was captured under.
    ResumeContinuation { k: Continuation, value: Box<Value> },
    /// Low-level transfer: splice the continuation, then evaluate `expr`
    /// in its place.
    Transfer { k: Continuation, expr: Box<Expr> },
}

impl Expr {
    pub fn pure(v: impl Into<Value>) -> Expr {
        Expr::Pure(v.into())
    }

    pub fn resume(k: Continuation, value: impl Into<Value>) -> Expr {
        Expr::Resume { k, value: Box::new(value.into()) }
    }

    pub fn resume_continuation(k: Continuation, value: impl Into<Value>) -> Expr {
        Expr::ResumeContinuation { k, value: Box::new(value.into()) }
    }

    pub fn transfer(k: Continuation, expr: Expr) -> Expr {
        Expr::Transfer { k, expr: Box::new(expr) }
    }

    pub fn with_handler(handler: Handler, body: Expr) -> Expr {
        Expr::WithHandler { handler, body: Box::new(body), return_clause: None }
    }

    pub fn with_handler_return(
        handler: Handler,
        body: Expr,
        return_clause: impl Fn(Value) -> Expr + Send + Sync + 'static,
    ) -> Expr {
        Expr::WithHandler {
            handler,
            body: Box::new(body),
            return_clause: Some(ReturnClause::new(return_clause)),
        }
    }

    pub fn call(f: NativeFn, args: impl IntoIterator<Item = Expr>) -> Expr {
        Expr::Call { f, args: args.into_iter().collect() }
    }

    /// Wrap a `Co` chain as a named do-expression.
    pub fn gen(name: impl Into<String>, co: Co) -> Expr {
        Expr::Do(DoExpr::from_co(name, co))
    }

    /// Short node label used in diagnostics.
    pub fn describe(&self) -> String {
        match self {
            Expr::Pure(v) => format!("Pure({})", v),
            Expr::Effect(e) => e.describe(),
            Expr::Perform(e) => format!("Perform({})", e.describe()),
            Expr::Do(d) => format!("Do({})", d.name()),
            Expr::WithHandler { handler, .. } => format!("WithHandler({})", handler.name()),
            Expr::Resume { k, .. } => format!("Resume(continuation-{})", k.id),
            Expr::Delegate => "Delegate".to_string(),
            Expr::Pass => "Pass".to_string(),
            Expr::Call { f, args } => format!("Call({}, {} args)", f.name(), args.len()),
            Expr::ResumeContinuation { k, .. } => {
                format!("ResumeContinuation(continuation-{})", k.id)
            }
            Expr::Transfer { k, .. } => format!("Transfer(continuation-{})", k.id),
        }
    }
}

impl From<Value> for Expr {
    fn from(v: Value) -> Self {
        Expr::Pure(v)
    }
}

// ---------------------------------------------------------------------------
// Coroutine protocol (the generator bridge)
// ---------------------------------------------------------------------------

/// One step of a driven coroutine.
#[derive(Debug)]
pub enum CoStep {
    /// The coroutine yielded an expression for the machine to evaluate;
    /// its value (or failure) is sent back on the next `resume`.
    Yield(Expr),
    /// The coroutine completed with a value.
    Return(Value),
    /// The coroutine terminated with a failure.
    Fail(EffectError),
}

/// A host coroutine drivable by the machine.
///
/// `resume(sent)` advances the coroutine with the result of its previous
/// yield; the first resume carries `Ok(Value::Unit)`. Failures are sent
/// in-band so a coroutine built with [`Co::try_bind`] can intercept them,
/// mirroring `generator.throw` semantics.
pub trait Coroutine: Send {
    fn resume(&mut self, sent: Result<Value, EffectError>) -> CoStep;

    /// Drop any remaining state. Called exactly once when the coroutine
    /// is discarded; must be idempotent.
    fn close(&mut self) {}

    fn name(&self) -> &str {
        "<co>"
    }
}

// ---------------------------------------------------------------------------
// Co — stackless do-notation builder
// ---------------------------------------------------------------------------

type BindFn = Box<dyn FnOnce(Value) -> Co + Send>;
type TryBindFn = Box<dyn FnOnce(Result<Value, EffectError>) -> Co + Send>;

enum CoNode {
    Done(Value),
    Fail(EffectError),
    /// Yield the expression; on success continue with the closure, on
    /// failure propagate.
    Bind(Expr, BindFn),
    /// Yield the expression; the closure sees success and failure both.
    TryBind(Expr, TryBindFn),
}

/// A do-notation chain: each `bind` is one yield point.
///
/// The shape follows the `AndThen`-style `FnOnce` chaining of effect
/// combinator libraries; the machine never sees `Co` directly, only the
/// [`CoGen`] coroutine compiled from it.
pub struct Co {
    node: CoNode,
}

impl Co {
    /// Finish with a value.
    pub fn done(v: impl Into<Value>) -> Co {
        Co { node: CoNode::Done(v.into()) }
    }

    /// Finish with a failure.
    pub fn fail(e: EffectError) -> Co {
        Co { node: CoNode::Fail(e) }
    }

    /// Yield `expr`, then continue with its value. Failures propagate.
    pub fn bind(expr: Expr, then: impl FnOnce(Value) -> Co + Send + 'static) -> Co {
        Co { node: CoNode::Bind(expr, Box::new(then)) }
    }

    /// Yield `expr`, observing success and failure both.
    pub fn try_bind(
        expr: Expr,
        then: impl FnOnce(Result<Value, EffectError>) -> Co + Send + 'static,
    ) -> Co {
        Co { node: CoNode::TryBind(expr, Box::new(then)) }
    }

    /// Yield `expr` and finish with its value: `return (yield expr)`.
    pub fn just(expr: Expr) -> Co {
        Co::bind(expr, Co::done)
    }

    /// Chain another step after this chain completes.
    pub fn then(self, f: impl FnOnce(Value) -> Co + Send + 'static) -> Co {
        match self.node {
            CoNode::Done(v) => f(v),
            CoNode::Fail(e) => Co::fail(e),
            CoNode::Bind(expr, then) => {
                Co::bind(expr, move |v| then(v).then(f))
            }
            CoNode::TryBind(expr, then) => {
                Co::try_bind(expr, move |r| then(r).then(f))
            }
        }
    }
}

impl fmt::Debug for Co {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match &self.node {
            CoNode::Done(_) => "Done",
            CoNode::Fail(_) => "Fail",
            CoNode::Bind(..) => "Bind",
            CoNode::TryBind(..) => "TryBind",
        };
        write!(f, "Co::{}", label)
    }
}

// ---------------------------------------------------------------------------
// CoGen — Co compiled to a Coroutine
// ---------------------------------------------------------------------------

enum CoGenState {
    Ready(Co),
    /// Suspended at a `bind`: failures propagate without entering the
    /// closure.
    Suspended(BindFn),
    /// Suspended at a `try_bind`: the closure sees the raw result.
    SuspendedTry(TryBindFn),
    Finished,
}

/// Drives a [`Co`] chain as a [`Coroutine`].
pub struct CoGen {
    state: CoGenState,
    name: String,
}

impl CoGen {
    pub fn new(name: impl Into<String>, co: Co) -> Self {
        Self { state: CoGenState::Ready(co), name: name.into() }
    }
}

impl Coroutine for CoGen {
    fn resume(&mut self, sent: Result<Value, EffectError>) -> CoStep {
        let co = match std::mem::replace(&mut self.state, CoGenState::Finished) {
            CoGenState::Ready(co) => co,
            CoGenState::Suspended(then) => match sent {
                Ok(v) => then(v),
                Err(e) => return CoStep::Fail(e),
            },
            CoGenState::SuspendedTry(then) => then(sent),
            CoGenState::Finished => {
                return CoStep::Fail(EffectError::type_error(
                    "resumed a finished generator",
                ))
            }
        };
        match co.node {
            CoNode::Done(v) => CoStep::Return(v),
            CoNode::Fail(e) => CoStep::Fail(e),
            CoNode::Bind(expr, then) => {
                self.state = CoGenState::Suspended(then);
                CoStep::Yield(expr)
            }
            CoNode::TryBind(expr, then) => {
                self.state = CoGenState::SuspendedTry(then);
                CoStep::Yield(expr)
            }
        }
    }

    fn close(&mut self) {
        self.state = CoGenState::Finished;
    }

    fn name(&self) -> &str {
        &self.name
    }
}

// ---------------------------------------------------------------------------
// DoExpr — one-shot generator cell
// ---------------------------------------------------------------------------

struct DoCell {
    co: Option<Box<dyn Coroutine>>,
    name: String,
}

/// A lazily-evaluated generator expression.
///
/// Cloning shares the underlying coroutine; whichever evaluation happens
/// first consumes it, and a second evaluation fails the same way a
/// re-iterated host generator would.
#[derive(Clone)]
pub struct DoExpr {
    inner: Arc<Mutex<DoCell>>,
}

impl DoExpr {
    pub fn new(name: impl Into<String>, co: impl Coroutine + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(DoCell {
                co: Some(Box::new(co)),
                name: name.into(),
            })),
        }
    }

    pub fn from_co(name: impl Into<String>, co: Co) -> Self {
        let name = name.into();
        let gen = CoGen::new(name.clone(), co);
        Self::new(name, gen)
    }

    pub fn name(&self) -> String {
        self.inner
            .lock()
            .map(|cell| cell.name.clone())
            .unwrap_or_else(|_| "<poisoned>".to_string())
    }

    /// Consume the coroutine. Returns `Err` if it was already taken.
    pub fn take(&self) -> Result<Box<dyn Coroutine>, EffectError> {
        let mut cell = self.inner.lock().map_err(|_| {
            EffectError::type_error("do-expression cell is poisoned")
        })?;
        cell.co.take().ok_or_else(|| {
            EffectError::type_error(format!(
                "program {:?} was already consumed; do-expressions are one-shot",
                cell.name
            ))
        })
    }

    /// Close the underlying coroutine without running it, if it is still
    /// present. Used by discard paths.
    pub fn close(&self) {
        if let Ok(mut cell) = self.inner.lock() {
            if let Some(mut co) = cell.co.take() {
                co.close();
            }
        }
    }
}

impl fmt::Debug for DoExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DoExpr({})", self.name())
    }
}
