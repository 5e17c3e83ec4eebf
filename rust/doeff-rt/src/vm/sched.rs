//! Scheduler state: tasks, the ready-queue, promises and semaphores.
//!
//! The scheduler is single-threaded and cooperative. One loop pops the
//! highest-priority ready task, steps it until it suspends or finishes,
//! and repeats. Ready ordering is `(priority desc, insertion seq asc)`,
//! so same-priority tasks run in spawn order and execution is
//! deterministic.

use crate::trace::Failure;
use crate::vm::frames::Frame;

use doeff_core::expr::Expr;
use doeff_core::values::{PromiseId, TaskId, Value};

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::Location;

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// One store cell: the value plus the global write sequence that set it.
///
/// Sequence numbers drive the merge-at-join conflict rule: a child's
/// write wins unless the parent wrote the same key after the spawn point.
#[derive(Debug, Clone)]
pub struct StoreEntry {
    pub value: Value,
    pub seq: u64,
}

pub type Store = HashMap<String, StoreEntry>;

// ---------------------------------------------------------------------------
// Control
// ---------------------------------------------------------------------------

/// What a task does on its next machine step.
pub enum Control {
    Eval(Expr),
    Deliver(Result<Value, Failure>),
}

/// A pending wake-up for a blocked task.
pub struct Wake {
    /// Identifies which of several registered waits fired (`Race`).
    pub tag: Option<u64>,
    pub result: Result<Value, Failure>,
    /// Set when the wake carries a task's result: the waker merges the
    /// child's store/log delta before delivery.
    pub joined_task: Option<TaskId>,
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Ready,
    Running,
    Blocked,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_finished(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed | TaskState::Cancelled)
    }
}

/// A scheduler-managed unit of execution.
pub struct Task {
    pub id: TaskId,
    pub priority: i32,
    pub state: TaskState,
    pub frames: Vec<Frame>,
    pub control: Option<Control>,
    pub wake: Option<Wake>,
    pub result: PromiseId,
    pub parent: Option<TaskId>,
    pub fire_and_forget: bool,
    /// Someone waited on this task's result at least once.
    pub ever_joined: bool,
    /// The store/log delta was already merged into a joiner.
    pub merged: bool,
    pub cancel_requested: bool,
    pub spawn_site: Option<&'static Location<'static>>,
    /// Store snapshot taken at spawn, mutated by this task's writes.
    pub store: Store,
    /// Global write sequence at the spawn point.
    pub snapshot_seq: u64,
    pub log: Vec<Value>,
    /// Env overlays captured by value at spawn, innermost last.
    pub env_base: Vec<BTreeMap<String, Value>>,
}

// ---------------------------------------------------------------------------
// Promise
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum PromiseState {
    Pending,
    Resolved(Value),
    Rejected(Failure),
}

/// A waiting task, FIFO within the promise.
#[derive(Debug, Clone, Copy)]
pub struct Waiter {
    pub task: TaskId,
    pub tag: Option<u64>,
}

/// A single-result cell: internal (task results) or external (host
/// completions).
pub struct Promise {
    pub state: PromiseState,
    pub waiters: Vec<Waiter>,
    pub external: bool,
    /// The task whose result this promise carries, when any.
    pub owner_task: Option<TaskId>,
}

impl Promise {
    pub fn internal(owner_task: Option<TaskId>) -> Self {
        Self {
            state: PromiseState::Pending,
            waiters: Vec::new(),
            external: false,
            owner_task,
        }
    }

    pub fn external() -> Self {
        Self {
            state: PromiseState::Pending,
            waiters: Vec::new(),
            external: true,
            owner_task: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.state, PromiseState::Pending)
    }
}

// ---------------------------------------------------------------------------
// Semaphore
// ---------------------------------------------------------------------------

/// FIFO counting semaphore.
///
/// Invariant: `0 <= available <= max`. Releasing with a waiter present
/// transfers the permit directly to the head waiter, so `available` never
/// overshoots while tasks are queued.
pub struct Semaphore {
    pub max: i64,
    pub available: i64,
    pub waiters: VecDeque<TaskId>,
}

impl Semaphore {
    pub fn new(max: i64) -> Self {
        Self { max, available: max, waiters: VecDeque::new() }
    }
}

// ---------------------------------------------------------------------------
// Ready queue ordering
// ---------------------------------------------------------------------------

/// Max-heap entry: higher priority first, then earlier insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyEntry {
    pub priority: i32,
    pub seq: u64,
    pub task: TaskId,
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
            .then_with(|| other.task.cmp(&self.task))
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
