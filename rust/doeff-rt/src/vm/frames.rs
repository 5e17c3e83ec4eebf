//! Continuation frames.
//!
//! A task's state between steps is a stack of frames. Plain coroutine
//! frames await the value of the expression above them; boundary frames
//! mark handler scopes; the remaining kinds are the native suspension
//! shapes of the built-in handlers (overlays, listen capture, failure
//! isolation, gather/race bookkeeping).

use doeff_core::effects::Effect;
use doeff_core::expr::{Continuation, Coroutine, Expr, Handler, ReturnClause};
use doeff_core::values::{NativeFn, PromiseId, TaskId, Value};

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

// ---------------------------------------------------------------------------
// Frame kinds
// ---------------------------------------------------------------------------

/// A suspended coroutine awaiting the value of the expression above it.
pub struct CoFrame {
    pub co: Box<dyn Coroutine>,
}

/// A handler scope established by `WithHandler`.
#[derive(Clone)]
pub struct BoundaryFrame {
    pub handler: Handler,
    pub return_clause: Option<ReturnClause>,
    pub scope_id: u64,
    /// Set when the boundary was re-pushed by a handler's `Resume`: the
    /// scope's completion then routes raw into the handler body below it
    /// instead of applying the return clause.
    pub owned_by_body: bool,
}

/// A running handler body, occupying the position its boundary held.
pub struct HandlerBodyFrame {
    pub co: Box<dyn Coroutine>,
    pub k: Continuation,
    pub effect: Effect,
    pub handler_name: String,
    /// The popped scope; re-pushed above this frame when the body resumes
    /// the continuation, so the handler stays installed for the resumed
    /// computation.
    pub boundary: Option<BoundaryFrame>,
    /// Whether this body owns the scope exit (applies the return clause).
    /// False when the boundary it popped was itself a body-owned re-push.
    pub apply_rc: bool,
    pub return_clause: Option<ReturnClause>,
    pub yielded: bool,
    pub resumed: bool,
}

/// Left-to-right argument evaluation for `Call`.
pub struct CallFrame {
    pub f: NativeFn,
    pub evaluated: Vec<Value>,
    pub remaining: VecDeque<Expr>,
}

/// A reader overlay active for the dynamic extent of a `Local` body.
pub struct OverlayFrame {
    pub id: u64,
    pub overlay: BTreeMap<String, Value>,
}

/// Private log capture for `Listen`; holds the outer log while the body
/// writes to a fresh one.
pub struct ListenFrame {
    pub outer_log: Vec<Value>,
}

/// Fallback substitution for `Recover`.
pub struct RecoverFrame {
    pub fallback: Option<Expr>,
}

/// Where a lazily-resolved env value should be memoized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvSlot {
    /// An overlay frame, identified by its stable id.
    FrameOverlay(u64),
    /// An overlay in the task's spawn-time snapshot.
    Base(usize),
    /// The run's root environment.
    Root,
}

/// Evaluation of a program-valued env entry; memoizes on completion.
pub struct ResolveEnvFrame {
    pub key: String,
    pub slot: EnvSlot,
}

/// One unit of work inside a gather.
pub enum GatherItem {
    Program(Expr),
    Task(TaskId),
    Promise(PromiseId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatherMode {
    /// Run each item to completion before starting the next.
    Serial,
    /// All items already spawned; collect in program order.
    Parallel,
}

/// Bookkeeping for `Gather`/`Parallel`.
pub struct GatherFrame {
    pub mode: GatherMode,
    pub pending: VecDeque<GatherItem>,
    pub results: Vec<Value>,
    /// Every task this frame spawned, for failure cancellation.
    pub spawned: Vec<TaskId>,
}

/// Bookkeeping for `Race`: the contenders and the promises carrying their
/// results, indexed in program order.
pub struct RaceFrame {
    pub tasks: Vec<Option<TaskId>>,
    pub promises: Vec<PromiseId>,
}

/// One frame of a task's continuation stack.
pub enum Frame {
    Co(CoFrame),
    Boundary(BoundaryFrame),
    HandlerBody(HandlerBodyFrame),
    Call(CallFrame),
    Overlay(OverlayFrame),
    Listen(ListenFrame),
    Safe,
    Recover(RecoverFrame),
    ResolveEnv(ResolveEnvFrame),
    Gather(GatherFrame),
    Race(RaceFrame),
}

impl Frame {
    /// Short label for traces and debug logging.
    pub fn label(&self) -> String {
        match self {
            Frame::Co(f) => format!("co {}", f.co.name()),
            Frame::Boundary(b) => format!("boundary {}", b.handler.name()),
            Frame::HandlerBody(h) => format!("handler-body {}", h.handler_name),
            Frame::Call(c) => format!("call {}", c.f.name()),
            Frame::Overlay(_) => "overlay".to_string(),
            Frame::Listen(_) => "listen".to_string(),
            Frame::Safe => "safe".to_string(),
            Frame::Recover(_) => "recover".to_string(),
            Frame::ResolveEnv(r) => format!("resolve-env {:?}", r.key),
            Frame::Gather(_) => "gather".to_string(),
            Frame::Race(_) => "race".to_string(),
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame({})", self.label())
    }
}
