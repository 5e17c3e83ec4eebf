//! Effect catalog: the closed built-in kinds and the open user extension.
//!
//! Effects are immutable descriptions; constructing one has no observable
//! side effect. Built-ins form a closed tagged union the native handlers
//! switch on; user effects implement [`UserEffect`] and are matched by
//! user handlers via `dispatch_key` or downcast.
//!
//! Constructors are `#[track_caller]` so the creation site can feed the
//! failure trace; capture is skipped unless site recording is enabled
//! (`DOEFF_DEBUG=1`, or by default in debug builds).

use crate::errors::EffectError;
use crate::expr::Expr;
use crate::values::{Awaitable, SemaphoreId, TaskId, UpdateFn, Value};

use once_cell::sync::Lazy;
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::Location;
use std::sync::Arc;
use strum_macros::Display;

/// Scheduling priority of an idle-time task.
pub const PRIORITY_IDLE: i32 = 0;
/// Default scheduling priority.
pub const PRIORITY_NORMAL: i32 = 10;
/// Scheduling priority for latency-sensitive tasks.
pub const PRIORITY_HIGH: i32 = 20;

/// Reserved env key resolving to a handle describing the active machine.
pub const INTERPRETER_KEY: &str = "__interpreter__";

static CAPTURE_SITES: Lazy<bool> = Lazy::new(|| {
    match std::env::var("DOEFF_DEBUG") {
        Ok(v) => v == "1",
        Err(_) => cfg!(debug_assertions),
    }
});

/// Whether effect constructors record their creation site.
pub fn effect_sites_enabled() -> bool {
    *CAPTURE_SITES
}

// ---------------------------------------------------------------------------
// User effects
// ---------------------------------------------------------------------------

/// Open extension point for domain effects.
///
/// The machine routes user effects by identity only; payloads are opaque
/// to it and meaningful to whichever handler claims the effect. Handlers
/// typically match on [`dispatch_key`](UserEffect::dispatch_key) and
/// downcast through [`as_any`](UserEffect::as_any) for the payload.
pub trait UserEffect: Send + Sync + fmt::Debug {
    /// Stable key a handler can match on.
    fn dispatch_key(&self) -> &str;

    /// Human-readable name for traces. Defaults to the dispatch key.
    fn debug_name(&self) -> &str {
        self.dispatch_key()
    }

    fn as_any(&self) -> &dyn Any;
}

// ---------------------------------------------------------------------------
// Built-in kinds
// ---------------------------------------------------------------------------

/// The closed set of built-in effects plus the user extension point.
#[derive(Debug, Clone)]
pub enum EffectKind {
    // State family.
    Get { key: String },
    Put { key: String, value: Value },
    Modify { key: String, f: UpdateFn },
    AtomicGet { key: String },
    AtomicUpdate { key: String, f: UpdateFn, default: Option<Value> },
    Snapshot,

    // Reader family.
    Ask { key: String },
    Dep { key: String },
    Local { overlay: BTreeMap<String, Value>, body: Box<Expr> },

    // Writer family.
    Tell { entry: Value },
    StructuredLog { payload: Value },
    Listen { body: Box<Expr> },

    // Result family.
    Safe { body: Box<Expr> },
    Recover { body: Box<Expr>, fallback: Box<Expr> },
    Fail { error: EffectError },

    // Cache family.
    CacheGet { key: String },
    CachePut { key: String, value: Value },
    CacheExists { key: String },
    CacheDelete { key: String },

    // Future bridge.
    Await { awaitable: Awaitable },

    // Scheduler family.
    Spawn { expr: Box<Expr>, priority: i32, fire_and_forget: bool },
    Wait { target: Value },
    Gather { items: Vec<Value> },
    Parallel { items: Vec<Value> },
    Race { items: Vec<Value> },
    Cancel { task: TaskId },
    CreateSemaphore { permits: i64 },
    AcquireSemaphore { sem: SemaphoreId },
    ReleaseSemaphore { sem: SemaphoreId },
    CreateExternalPromise,

    // Open extension.
    User(Arc<dyn UserEffect>),
}

/// Fieldless tag used for dispatch tables and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "PascalCase")]
pub enum EffectTag {
    Get,
    Put,
    Modify,
    AtomicGet,
    AtomicUpdate,
    Snapshot,
    Ask,
    Dep,
    Local,
    Tell,
    StructuredLog,
    Listen,
    Safe,
    Recover,
    Fail,
    CacheGet,
    CachePut,
    CacheExists,
    CacheDelete,
    Await,
    Spawn,
    Wait,
    Gather,
    Parallel,
    Race,
    Cancel,
    CreateSemaphore,
    AcquireSemaphore,
    ReleaseSemaphore,
    CreateExternalPromise,
    User,
}

impl EffectKind {
    pub fn tag(&self) -> EffectTag {
        match self {
            EffectKind::Get { .. } => EffectTag::Get,
            EffectKind::Put { .. } => EffectTag::Put,
            EffectKind::Modify { .. } => EffectTag::Modify,
            EffectKind::AtomicGet { .. } => EffectTag::AtomicGet,
            EffectKind::AtomicUpdate { .. } => EffectTag::AtomicUpdate,
            EffectKind::Snapshot => EffectTag::Snapshot,
            EffectKind::Ask { .. } => EffectTag::Ask,
            EffectKind::Dep { .. } => EffectTag::Dep,
            EffectKind::Local { .. } => EffectTag::Local,
            EffectKind::Tell { .. } => EffectTag::Tell,
            EffectKind::StructuredLog { .. } => EffectTag::StructuredLog,
            EffectKind::Listen { .. } => EffectTag::Listen,
            EffectKind::Safe { .. } => EffectTag::Safe,
            EffectKind::Recover { .. } => EffectTag::Recover,
            EffectKind::Fail { .. } => EffectTag::Fail,
            EffectKind::CacheGet { .. } => EffectTag::CacheGet,
            EffectKind::CachePut { .. } => EffectTag::CachePut,
            EffectKind::CacheExists { .. } => EffectTag::CacheExists,
            EffectKind::CacheDelete { .. } => EffectTag::CacheDelete,
            EffectKind::Await { .. } => EffectTag::Await,
            EffectKind::Spawn { .. } => EffectTag::Spawn,
            EffectKind::Wait { .. } => EffectTag::Wait,
            EffectKind::Gather { .. } => EffectTag::Gather,
            EffectKind::Parallel { .. } => EffectTag::Parallel,
            EffectKind::Race { .. } => EffectTag::Race,
            EffectKind::Cancel { .. } => EffectTag::Cancel,
            EffectKind::CreateSemaphore { .. } => EffectTag::CreateSemaphore,
            EffectKind::AcquireSemaphore { .. } => EffectTag::AcquireSemaphore,
            EffectKind::ReleaseSemaphore { .. } => EffectTag::ReleaseSemaphore,
            EffectKind::CreateExternalPromise => EffectTag::CreateExternalPromise,
            EffectKind::User(_) => EffectTag::User,
        }
    }
}

// ---------------------------------------------------------------------------
// Effect record
// ---------------------------------------------------------------------------

/// An immutable effect request: kind tag, payload, optional creation site.
#[derive(Debug, Clone)]
pub struct Effect {
    pub kind: EffectKind,
    pub created_at: Option<&'static Location<'static>>,
}

impl Effect {
    #[track_caller]
    pub fn new(kind: EffectKind) -> Self {
        let created_at = if effect_sites_enabled() {
            Some(Location::caller())
        } else {
            None
        };
        Self { kind, created_at }
    }

    pub fn tag(&self) -> EffectTag {
        self.kind.tag()
    }

    /// Downcast helper for user handlers.
    pub fn as_user(&self) -> Option<&Arc<dyn UserEffect>> {
        match &self.kind {
            EffectKind::User(u) => Some(u),
            _ => None,
        }
    }

    /// One-line rendering for traces and `MissingHandler` messages.
    pub fn describe(&self) -> String {
        match &self.kind {
            EffectKind::Get { key }
            | EffectKind::AtomicGet { key }
            | EffectKind::Ask { key }
            | EffectKind::Dep { key }
            | EffectKind::CacheGet { key }
            | EffectKind::CacheExists { key }
            | EffectKind::CacheDelete { key } => format!("{}({:?})", self.tag(), key),
            EffectKind::Put { key, value } => format!("Put({:?}, {})", key, value),
            EffectKind::Modify { key, f } => format!("Modify({:?}, {})", key, f.name()),
            EffectKind::AtomicUpdate { key, f, .. } => {
                format!("AtomicUpdate({:?}, {})", key, f.name())
            }
            EffectKind::CachePut { key, .. } => format!("CachePut({:?})", key),
            EffectKind::Tell { entry } => format!("Tell({})", entry),
            EffectKind::StructuredLog { .. } => "StructuredLog".to_string(),
            EffectKind::Fail { error } => format!("Fail({})", error),
            EffectKind::Await { awaitable } => format!("Await({})", awaitable.name()),
            EffectKind::Spawn { priority, .. } => format!("Spawn(priority={})", priority),
            EffectKind::Wait { target } => format!("Wait({})", target.describe()),
            EffectKind::Gather { items } => format!("Gather({} items)", items.len()),
            EffectKind::Parallel { items } => format!("Parallel({} items)", items.len()),
            EffectKind::Race { items } => format!("Race({} items)", items.len()),
            EffectKind::Cancel { task } => format!("Cancel({})", task),
            EffectKind::CreateSemaphore { permits } => {
                format!("CreateSemaphore({})", permits)
            }
            EffectKind::AcquireSemaphore { sem } => format!("AcquireSemaphore({})", sem),
            EffectKind::ReleaseSemaphore { sem } => format!("ReleaseSemaphore({})", sem),
            EffectKind::User(u) => format!("User({})", u.debug_name()),
            other => other.tag().to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Constructors
// ---------------------------------------------------------------------------

macro_rules! effect_expr {
    ($kind:expr) => {
        Expr::Effect(Effect::new($kind))
    };
}

/// Read a key from the state store. A missing key yields unit.
#[track_caller]
pub fn get(key: impl Into<String>) -> Expr {
    effect_expr!(EffectKind::Get { key: key.into() })
}

/// Write a key into the state store.
#[track_caller]
pub fn put(key: impl Into<String>, value: impl Into<Value>) -> Expr {
    effect_expr!(EffectKind::Put { key: key.into(), value: value.into() })
}

/// Apply `f` to the current value of `key` (unit when absent) and store
/// the result; yields the new value.
#[track_caller]
pub fn modify(
    key: impl Into<String>,
    name: &'static str,
    f: impl Fn(Value) -> Value + Send + Sync + 'static,
) -> Expr {
    effect_expr!(EffectKind::Modify { key: key.into(), f: UpdateFn::new(name, f) })
}

#[track_caller]
pub fn atomic_get(key: impl Into<String>) -> Expr {
    effect_expr!(EffectKind::AtomicGet { key: key.into() })
}

/// Read-modify-write against the store, seeded with `default` when the
/// key is absent; yields the updated value.
#[track_caller]
pub fn atomic_update(
    key: impl Into<String>,
    name: &'static str,
    f: impl Fn(Value) -> Value + Send + Sync + 'static,
    default: Option<Value>,
) -> Expr {
    effect_expr!(EffectKind::AtomicUpdate {
        key: key.into(),
        f: UpdateFn::new(name, f),
        default,
    })
}

/// Yield a deep copy of the entire store.
#[track_caller]
pub fn snapshot() -> Expr {
    effect_expr!(EffectKind::Snapshot)
}

/// Read a key from the environment; missing keys fail with
/// `MissingEnvKeyError`.
#[track_caller]
pub fn ask(key: impl Into<String>) -> Expr {
    effect_expr!(EffectKind::Ask { key: key.into() })
}

/// Alias of `ask` used for dependency-style lookups.
#[track_caller]
pub fn dep(key: impl Into<String>) -> Expr {
    effect_expr!(EffectKind::Dep { key: key.into() })
}

/// Run `body` with `overlay` pushed over the environment for its dynamic
/// extent.
#[track_caller]
pub fn local(
    overlay: impl IntoIterator<Item = (String, Value)>,
    body: Expr,
) -> Expr {
    effect_expr!(EffectKind::Local {
        overlay: overlay.into_iter().collect(),
        body: Box::new(body),
    })
}

/// Append an entry to the writer log.
#[track_caller]
pub fn tell(entry: impl Into<Value>) -> Expr {
    effect_expr!(EffectKind::Tell { entry: entry.into() })
}

/// Append a structured record to the writer log.
#[track_caller]
pub fn slog(payload: impl Into<Value>) -> Expr {
    effect_expr!(EffectKind::StructuredLog { payload: payload.into() })
}

/// Run `body` with a private log; yields `{"value": …, "log": […]}`.
#[track_caller]
pub fn listen(body: Expr) -> Expr {
    effect_expr!(EffectKind::Listen { body: Box::new(body) })
}

/// Run `body`, yielding `Ok(value)` or `Err(error)` instead of failing.
#[track_caller]
pub fn safe(body: Expr) -> Expr {
    effect_expr!(EffectKind::Safe { body: Box::new(body) })
}

/// Run `body`; on failure evaluate `fallback` and yield its value.
#[track_caller]
pub fn recover(body: Expr, fallback: impl Into<Expr>) -> Expr {
    effect_expr!(EffectKind::Recover {
        body: Box::new(body),
        fallback: Box::new(fallback.into()),
    })
}

/// Raise `error` as a failure.
#[track_caller]
pub fn fail(error: EffectError) -> Expr {
    effect_expr!(EffectKind::Fail { error })
}

#[track_caller]
pub fn cache_get(key: impl Into<String>) -> Expr {
    effect_expr!(EffectKind::CacheGet { key: key.into() })
}

#[track_caller]
pub fn cache_put(key: impl Into<String>, value: impl Into<Value>) -> Expr {
    effect_expr!(EffectKind::CachePut { key: key.into(), value: value.into() })
}

#[track_caller]
pub fn cache_exists(key: impl Into<String>) -> Expr {
    effect_expr!(EffectKind::CacheExists { key: key.into() })
}

#[track_caller]
pub fn cache_delete(key: impl Into<String>) -> Expr {
    effect_expr!(EffectKind::CacheDelete { key: key.into() })
}

/// Bridge a host awaitable; the task suspends until it completes.
#[track_caller]
pub fn await_(awaitable: Awaitable) -> Expr {
    effect_expr!(EffectKind::Await { awaitable })
}

/// Spawn `expr` as a task at normal priority; yields the task handle.
#[track_caller]
pub fn spawn(expr: Expr) -> Expr {
    spawn_with(expr, PRIORITY_NORMAL, false)
}

/// Spawn with explicit priority and fire-and-forget marker.
#[track_caller]
pub fn spawn_with(expr: Expr, priority: i32, fire_and_forget: bool) -> Expr {
    effect_expr!(EffectKind::Spawn {
        expr: Box::new(expr),
        priority,
        fire_and_forget,
    })
}

/// Wait on a task handle or promise; yields its value or re-raises its
/// failure.
#[track_caller]
pub fn wait(target: impl Into<Value>) -> Expr {
    effect_expr!(EffectKind::Wait { target: target.into() })
}

/// Run each item to completion in program order; yields the list of
/// results. Items may be programs or already-spawned task handles.
#[track_caller]
pub fn gather(items: impl IntoIterator<Item = Value>) -> Expr {
    effect_expr!(EffectKind::Gather { items: items.into_iter().collect() })
}

/// Spawn all items up front, then collect results in program order.
#[track_caller]
pub fn parallel(items: impl IntoIterator<Item = Value>) -> Expr {
    effect_expr!(EffectKind::Parallel { items: items.into_iter().collect() })
}

/// Run items concurrently; yields `{"index": …, "value": …}` for the
/// first completion and cancels the rest.
#[track_caller]
pub fn race(items: impl IntoIterator<Item = Value>) -> Expr {
    effect_expr!(EffectKind::Race { items: items.into_iter().collect() })
}

/// Cancel a task. Idempotent; finished tasks are left alone.
#[track_caller]
pub fn cancel(task: TaskId) -> Expr {
    effect_expr!(EffectKind::Cancel { task })
}

/// Create a counting semaphore; `permits` must be at least 1.
#[track_caller]
pub fn create_semaphore(permits: i64) -> Expr {
    effect_expr!(EffectKind::CreateSemaphore { permits })
}

#[track_caller]
pub fn acquire_semaphore(sem: SemaphoreId) -> Expr {
    effect_expr!(EffectKind::AcquireSemaphore { sem })
}

#[track_caller]
pub fn release_semaphore(sem: SemaphoreId) -> Expr {
    effect_expr!(EffectKind::ReleaseSemaphore { sem })
}

/// Create a promise completable from any host thread; yields the handle.
#[track_caller]
pub fn create_external_promise() -> Expr {
    effect_expr!(EffectKind::CreateExternalPromise)
}

/// Raise a user effect for dispatch.
#[track_caller]
pub fn perform_user(effect: impl UserEffect + 'static) -> Expr {
    effect_expr!(EffectKind::User(Arc::new(effect)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Ping;

    impl UserEffect for Ping {
        fn dispatch_key(&self) -> &str {
            "ping"
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn tags_are_stable_labels() {
        assert_eq!(EffectTag::AtomicUpdate.to_string(), "AtomicUpdate");
        assert_eq!(EffectTag::CreateExternalPromise.to_string(), "CreateExternalPromise");
    }

    #[test]
    fn describe_names_the_payload() {
        let Expr::Effect(e) = get("counter") else { panic!("expected effect") };
        assert_eq!(e.describe(), "Get(\"counter\")");
        let Expr::Effect(e) = perform_user(Ping) else { panic!("expected effect") };
        assert_eq!(e.describe(), "User(ping)");
    }

    #[test]
    fn user_effects_downcast() {
        let Expr::Effect(e) = perform_user(Ping) else { panic!("expected effect") };
        let user = e.as_user().expect("user effect");
        assert!(user.as_any().downcast_ref::<Ping>().is_some());
    }
}
