//! Runtime value universe for the effect machine.
//!
//! `Value` is the dynamic value type carried through effects, handlers and
//! run results. Data variants (integers, strings, lists, maps) compare
//! structurally; handle variants (tasks, promises, semaphores,
//! continuations) compare by identity; callable variants compare by
//! allocation identity. Values that cannot be structurally serialized
//! project into JSON as tagged opaque strings.

use crate::errors::EffectError;
use crate::expr::{Continuation, Expr};

use crossbeam_channel::Sender;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};

// ---------------------------------------------------------------------------
// Handle ids
// ---------------------------------------------------------------------------

/// Identifier of a scheduler-managed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

/// Identifier of a promise cell (internal or external).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PromiseId(pub u64);

/// Identifier of a counting semaphore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SemaphoreId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

impl fmt::Display for PromiseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "promise-{}", self.0)
    }
}

impl fmt::Display for SemaphoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "semaphore-{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Callable payloads
// ---------------------------------------------------------------------------

/// A named native function usable as the callee of `Call`.
#[derive(Clone)]
pub struct NativeFn {
    name: &'static str,
    f: Arc<dyn Fn(Vec<Value>) -> Result<Value, EffectError> + Send + Sync>,
}

impl NativeFn {
    pub fn new(
        name: &'static str,
        f: impl Fn(Vec<Value>) -> Result<Value, EffectError> + Send + Sync + 'static,
    ) -> Self {
        Self { name, f: Arc::new(f) }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn call(&self, args: Vec<Value>) -> Result<Value, EffectError> {
        (self.f)(args)
    }
}

impl fmt::Debug for NativeFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeFn({})", self.name)
    }
}

impl PartialEq for NativeFn {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.f, &other.f)
    }
}

/// A pure value-to-value transform, carried by `Modify` and `AtomicUpdate`.
#[derive(Clone)]
pub struct UpdateFn {
    name: &'static str,
    f: Arc<dyn Fn(Value) -> Value + Send + Sync>,
}

impl UpdateFn {
    pub fn new(name: &'static str, f: impl Fn(Value) -> Value + Send + Sync + 'static) -> Self {
        Self { name, f: Arc::new(f) }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn apply(&self, v: Value) -> Value {
        (self.f)(v)
    }
}

impl fmt::Debug for UpdateFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UpdateFn({})", self.name)
    }
}

impl PartialEq for UpdateFn {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.f, &other.f)
    }
}

// ---------------------------------------------------------------------------
// Awaitable
// ---------------------------------------------------------------------------

type AwaitThunk = Box<dyn FnOnce() -> Result<Value, EffectError> + Send>;

/// A host-side unit of asynchrony bridged through the `Await` effect.
///
/// The thunk is one-shot: whichever handler consumes it (the synchronous
/// await handler inline, or the non-blocking bridge off-thread) takes it
/// out of the cell. Consuming it twice is a program error.
#[derive(Clone)]
pub struct Awaitable {
    name: Arc<str>,
    thunk: Arc<Mutex<Option<AwaitThunk>>>,
}

impl Awaitable {
    pub fn new(
        name: impl Into<String>,
        f: impl FnOnce() -> Result<Value, EffectError> + Send + 'static,
    ) -> Self {
        Self {
            name: name.into().into(),
            thunk: Arc::new(Mutex::new(Some(Box::new(f)))),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Take the thunk out of the cell. Returns `None` if already consumed.
    pub fn take(&self) -> Option<AwaitThunk> {
        self.thunk.lock().ok().and_then(|mut guard| guard.take())
    }
}

impl fmt::Debug for Awaitable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Awaitable({})", self.name)
    }
}

impl PartialEq for Awaitable {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.thunk, &other.thunk)
    }
}

// ---------------------------------------------------------------------------
// External promise
// ---------------------------------------------------------------------------

/// A completion message sent from a host thread into the machine loop.
#[derive(Debug, Clone)]
pub struct ExternalCompletion {
    pub promise: PromiseId,
    pub result: Result<Value, EffectError>,
}

/// Handle to a promise whose resolution arrives from outside the VM loop.
///
/// `complete` / `fail` are safe to call from any thread; the machine drains
/// the completion channel between steps (and blocks on it when every task
/// is parked), so a completion always wakes the loop. The first completion
/// wins; later ones are ignored.
#[derive(Clone)]
pub struct ExternalPromise {
    id: PromiseId,
    tx: Sender<ExternalCompletion>,
}

impl ExternalPromise {
    pub fn new(id: PromiseId, tx: Sender<ExternalCompletion>) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> PromiseId {
        self.id
    }

    /// Resolve the promise with `value`. Returns `false` if the machine
    /// loop is gone (the run already ended).
    pub fn complete(&self, value: Value) -> bool {
        self.tx
            .send(ExternalCompletion { promise: self.id, result: Ok(value) })
            .is_ok()
    }

    /// Reject the promise with `error`. Returns `false` if the machine
    /// loop is gone.
    pub fn fail(&self, error: EffectError) -> bool {
        self.tx
            .send(ExternalCompletion { promise: self.id, result: Err(error) })
            .is_ok()
    }
}

impl fmt::Debug for ExternalPromise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExternalPromise({})", self.id)
    }
}

impl PartialEq for ExternalPromise {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

// ---------------------------------------------------------------------------
// Value
// ---------------------------------------------------------------------------

/// The dynamic value type interpreted by the machine.
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Unit,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    /// Success half of the canonical result pair produced by `Safe`.
    Ok(Box<Value>),
    /// Failure half of the canonical result pair produced by `Safe`.
    Err(Box<EffectError>),
    /// Handle to a scheduler task, as returned by `Spawn`.
    Task(TaskId),
    /// Handle to an internal promise.
    Promise(PromiseId),
    /// Handle to an externally-completable promise.
    External(ExternalPromise),
    /// Handle to a counting semaphore.
    Semaphore(SemaphoreId),
    /// A captured one-shot continuation.
    Continuation(Continuation),
    /// An unevaluated program, usable as a lazy env entry or fallback.
    Program(Box<Expr>),
    /// A native function (the callee shape of `Call`).
    Native(NativeFn),
    /// A host awaitable (the payload of `Await`).
    Awaitable(Awaitable),
}

impl Value {
    pub fn list(items: impl IntoIterator<Item = Value>) -> Self {
        Value::List(items.into_iter().collect())
    }

    pub fn map(entries: impl IntoIterator<Item = (String, Value)>) -> Self {
        Value::Map(entries.into_iter().collect())
    }

    pub fn ok(v: Value) -> Self {
        Value::Ok(Box::new(v))
    }

    pub fn err(e: EffectError) -> Self {
        Value::Err(Box::new(e))
    }

    /// Short type label used in diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Unit => "unit",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Ok(_) => "ok",
            Value::Err(_) => "err",
            Value::Task(_) => "task",
            Value::Promise(_) => "promise",
            Value::External(_) => "external-promise",
            Value::Semaphore(_) => "semaphore",
            Value::Continuation(_) => "continuation",
            Value::Program(_) => "program",
            Value::Native(_) => "native-fn",
            Value::Awaitable(_) => "awaitable",
        }
    }

    /// Truthiness in the Python sense: unit, false, 0, "", [] and {} are
    /// falsy, everything else is truthy.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Unit => false,
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            Value::Float(n) => *n != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) => !items.is_empty(),
            Value::Map(entries) => !entries.is_empty(),
            _ => true,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(entries) => Some(entries),
            _ => None,
        }
    }

    pub fn as_task(&self) -> Option<TaskId> {
        match self {
            Value::Task(id) => Some(*id),
            _ => None,
        }
    }

    /// Require an integer, with a typed error for handlers.
    pub fn expect_int(&self) -> Result<i64, EffectError> {
        self.as_int().ok_or_else(|| EffectError::Type {
            message: format!("expected int, got {}", self.type_name()),
        })
    }

    /// Lossy projection into JSON. Handles, callables and programs render
    /// as tagged opaque strings.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;
        match self {
            Value::Unit => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(n) => Json::from(*n),
            Value::Float(n) => serde_json::Number::from_f64(*n)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::Str(s) => Json::String(s.clone()),
            Value::List(items) => Json::Array(items.iter().map(Value::to_json).collect()),
            Value::Map(entries) => Json::Object(
                entries.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            Value::Ok(v) => serde_json::json!({ "ok": v.to_json() }),
            Value::Err(e) => serde_json::json!({ "err": e.to_string() }),
            other => Json::String(format!("<opaque: {}>", other.describe())),
        }
    }

    /// One-line human rendering used by diagnostics and opaque projection.
    pub fn describe(&self) -> String {
        match self {
            Value::Task(id) => id.to_string(),
            Value::Promise(id) => id.to_string(),
            Value::External(p) => format!("external-{}", p.id()),
            Value::Semaphore(id) => id.to_string(),
            Value::Continuation(k) => format!("continuation-{}", k.id),
            Value::Program(_) => "program".to_string(),
            Value::Native(f) => format!("native-fn {}", f.name()),
            Value::Awaitable(a) => format!("awaitable {}", a.name()),
            other => other.to_string(),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Unit, Value::Unit) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Ok(a), Value::Ok(b)) => a == b,
            (Value::Err(a), Value::Err(b)) => a == b,
            (Value::Task(a), Value::Task(b)) => a == b,
            (Value::Promise(a), Value::Promise(b)) => a == b,
            (Value::External(a), Value::External(b)) => a == b,
            (Value::Semaphore(a), Value::Semaphore(b)) => a == b,
            (Value::Continuation(a), Value::Continuation(b)) => a == b,
            (Value::Native(a), Value::Native(b)) => a == b,
            (Value::Awaitable(a), Value::Awaitable(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Unit => write!(f, "()"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(n) => write!(f, "{}", n),
            Value::Float(n) => write!(f, "{}", n),
            Value::Str(s) => write!(f, "{:?}", s),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Map(entries) => {
                write!(f, "{{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{:?}: {}", k, v)?;
                }
                write!(f, "}}")
            }
            Value::Ok(v) => write!(f, "Ok({})", v),
            Value::Err(e) => write!(f, "Err({})", e),
            other => write!(f, "<{}>", other.describe()),
        }
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Unit
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n as i64)
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Value::Int(n as i64)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Float(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(entries: BTreeMap<String, Value>) -> Self {
        Value::Map(entries)
    }
}

impl From<Expr> for Value {
    fn from(expr: Expr) -> Self {
        Value::Program(Box::new(expr))
    }
}
