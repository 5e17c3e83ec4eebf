//! The effect machine: explicit state, stepped by a cooperative loop.
//!
//! One `Machine` value owns everything a run touches — tasks, promises,
//! semaphores, captured continuations — in id-addressed arenas freed when
//! the run ends. No thread-locals: the scheduler loop pops the
//! highest-priority ready task and steps it until it suspends (waits,
//! blocks on a semaphore, or parks on an external promise) or finishes.
//!
//! A task's step alternates between two controls: `Eval` classifies an
//! expression, `Deliver` feeds a result to the top frame. Failure is a
//! `Deliver(Err)` that unwinds frame by frame, closing every discarded
//! coroutine exactly once; fatal contract violations bypass the unwind
//! and abort the whole run.

use crate::trace::{Failure, TraceEntry};
use crate::vm::continuations::ContinuationArena;
use crate::vm::frames::{
    BoundaryFrame, CallFrame, CoFrame, EnvSlot, Frame, GatherFrame, GatherItem,
    ListenFrame, RecoverFrame, ResolveEnvFrame,
};
use crate::vm::sched::{
    Control, Promise, PromiseState, ReadyEntry, Semaphore, Store, StoreEntry, Task,
    TaskState, Waiter, Wake,
};

use doeff_core::effects::{Effect, EffectKind, PRIORITY_NORMAL};
use doeff_core::errors::EffectError;
use doeff_core::expr::{CoStep, Expr, Handler};
use doeff_core::values::{
    ExternalCompletion, NativeFn, PromiseId, SemaphoreId, TaskId, Value,
};

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::collections::{BTreeMap, BinaryHeap};
use std::panic::Location;
use uuid::Uuid;

/// Render a source location the way traces expect it.
pub(crate) fn site_str(site: &'static Location<'static>) -> String {
    format!("{}:{}:{}", site.file(), site.line(), site.column())
}

/// Close the coroutine cells reachable from an unevaluated expression.
///
/// Discard paths (failure unwind, cancellation, dropped call arguments)
/// route through here so `Coroutine::close` runs exactly once even for
/// generators that never started.
pub(crate) fn discard_expr(expr: &Expr) {
    match expr {
        Expr::Do(d) => d.close(),
        Expr::WithHandler { body, .. } => discard_expr(body),
        Expr::Call { args, .. } => args.iter().for_each(discard_expr),
        Expr::Transfer { expr, .. } => discard_expr(expr),
        Expr::Effect(e) | Expr::Perform(e) => discard_effect(e),
        _ => {}
    }
}

fn discard_effect(effect: &Effect) {
    match &effect.kind {
        EffectKind::Local { body, .. }
        | EffectKind::Listen { body }
        | EffectKind::Safe { body } => discard_expr(body),
        EffectKind::Recover { body, fallback } => {
            discard_expr(body);
            discard_expr(fallback);
        }
        EffectKind::Spawn { expr, .. } => discard_expr(expr),
        EffectKind::Gather { items }
        | EffectKind::Parallel { items }
        | EffectKind::Race { items } => {
            for item in items {
                if let Value::Program(e) = item {
                    discard_expr(e);
                }
            }
        }
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Machine
// ---------------------------------------------------------------------------

pub struct Machine {
    pub(crate) run_id: Uuid,
    pub(crate) tasks: Vec<Task>,
    pub(crate) ready: BinaryHeap<ReadyEntry>,
    pub(crate) ready_seq: u64,
    pub(crate) promises: Vec<Promise>,
    pub(crate) semaphores: Vec<Semaphore>,
    pub(crate) continuations: ContinuationArena,
    pub(crate) root_env: BTreeMap<String, Value>,
    /// Global monotonic store-write counter driving merge-at-join.
    pub(crate) write_seq: u64,
    pub(crate) scope_seq: u64,
    pub(crate) overlay_seq: u64,
    pub(crate) current: TaskId,
    pub(crate) main: TaskId,
    pub(crate) ext_tx: Sender<ExternalCompletion>,
    pub(crate) ext_rx: Receiver<ExternalCompletion>,
    pub(crate) external_outstanding: usize,
    pub(crate) current_wake_tag: Option<u64>,
    pub(crate) fatal: Option<Failure>,
}

impl Machine {
    /// Build a machine for one run: the program wrapped in the handler
    /// stack (first handler outermost), seeded env and store.
    pub fn new(
        program: Expr,
        handlers: Vec<Handler>,
        env: BTreeMap<String, Value>,
        store: BTreeMap<String, Value>,
    ) -> Self {
        let (ext_tx, ext_rx) = unbounded();
        let mut machine = Self {
            run_id: Uuid::new_v4(),
            tasks: Vec::new(),
            ready: BinaryHeap::new(),
            ready_seq: 0,
            promises: Vec::new(),
            semaphores: Vec::new(),
            continuations: ContinuationArena::new(),
            root_env: env,
            write_seq: 0,
            scope_seq: 0,
            overlay_seq: 0,
            current: TaskId(0),
            main: TaskId(0),
            ext_tx,
            ext_rx,
            external_outstanding: 0,
            current_wake_tag: None,
            fatal: None,
        };

        let mut body = program;
        for handler in handlers.into_iter().rev() {
            body = Expr::with_handler(handler, body);
        }
        let main = machine.spawn_task(body, PRIORITY_NORMAL, false, None, None);
        machine.main = main;
        machine.tasks[main.0 as usize].store = store
            .into_iter()
            .map(|(k, v)| (k, StoreEntry { value: v, seq: 0 }))
            .collect();
        machine
    }

    // -- arenas -------------------------------------------------------------

    pub(crate) fn task(&self, id: TaskId) -> &Task {
        &self.tasks[id.0 as usize]
    }

    pub(crate) fn task_mut(&mut self, id: TaskId) -> &mut Task {
        &mut self.tasks[id.0 as usize]
    }

    pub(crate) fn frames_mut(&mut self) -> &mut Vec<Frame> {
        let id = self.current;
        &mut self.task_mut(id).frames
    }

    pub(crate) fn promise(&self, id: PromiseId) -> &Promise {
        &self.promises[id.0 as usize]
    }

    pub(crate) fn promise_mut(&mut self, id: PromiseId) -> &mut Promise {
        &mut self.promises[id.0 as usize]
    }

    pub(crate) fn alloc_promise(&mut self, promise: Promise) -> PromiseId {
        let id = PromiseId(self.promises.len() as u64);
        self.promises.push(promise);
        id
    }

    pub(crate) fn semaphore_mut(&mut self, id: SemaphoreId) -> &mut Semaphore {
        &mut self.semaphores[id.0 as usize]
    }

    pub(crate) fn next_scope_id(&mut self) -> u64 {
        self.scope_seq += 1;
        self.scope_seq
    }

    pub(crate) fn next_overlay_id(&mut self) -> u64 {
        self.overlay_seq += 1;
        self.overlay_seq
    }

    pub(crate) fn next_write_seq(&mut self) -> u64 {
        self.write_seq += 1;
        self.write_seq
    }

    // -- control ------------------------------------------------------------

    pub(crate) fn set_eval(&mut self, expr: Expr) {
        let id = self.current;
        self.task_mut(id).control = Some(Control::Eval(expr));
    }

    pub(crate) fn set_deliver(&mut self, res: Result<Value, Failure>) {
        let id = self.current;
        self.task_mut(id).control = Some(Control::Deliver(res));
    }

    /// Route a failure: fatal ones abort the run, the rest unwind.
    pub(crate) fn fail_current(&mut self, failure: Failure) {
        if failure.is_fatal() {
            self.raise_fatal(failure);
        } else {
            self.set_deliver(Err(failure));
        }
    }

    pub(crate) fn raise_fatal(&mut self, failure: Failure) {
        let id = self.current;
        let frames = std::mem::take(&mut self.task_mut(id).frames);
        self.close_frames(frames);
        self.task_mut(id).state = TaskState::Failed;
        self.fatal = Some(failure);
    }

    // -- task lifecycle -----------------------------------------------------

    pub(crate) fn spawn_task(
        &mut self,
        expr: Expr,
        priority: i32,
        fire_and_forget: bool,
        parent: Option<TaskId>,
        spawn_site: Option<&'static Location<'static>>,
    ) -> TaskId {
        let id = TaskId(self.tasks.len() as u64);
        let result = self.alloc_promise(Promise::internal(Some(id)));
        let (store, snapshot_seq, env_base, handlers) = match parent {
            Some(p) => {
                let parent_task = self.task(p);
                let mut env_base = parent_task.env_base.clone();
                let mut handlers = Vec::new();
                for frame in &parent_task.frames {
                    match frame {
                        Frame::Overlay(of) => env_base.push(of.overlay.clone()),
                        // The child runs under the handler chain active at
                        // the spawn site (handlers shared by reference);
                        // return clauses stay with the parent's scopes.
                        Frame::Boundary(b) => handlers.push(b.handler.clone()),
                        _ => {}
                    }
                }
                (parent_task.store.clone(), self.write_seq, env_base, handlers)
            }
            None => (Store::new(), 0, Vec::new(), Vec::new()),
        };
        let frames = handlers
            .into_iter()
            .map(|handler| {
                self.scope_seq += 1;
                Frame::Boundary(BoundaryFrame {
                    handler,
                    return_clause: None,
                    scope_id: self.scope_seq,
                    owned_by_body: false,
                })
            })
            .collect();
        self.tasks.push(Task {
            id,
            priority,
            state: TaskState::Ready,
            frames,
            control: Some(Control::Eval(expr)),
            wake: None,
            result,
            parent,
            fire_and_forget,
            ever_joined: false,
            merged: false,
            cancel_requested: false,
            spawn_site,
            store,
            snapshot_seq,
            log: Vec::new(),
            env_base,
        });
        tracing::debug!(task = id.0, priority, "spawned task");
        self.push_ready(id);
        id
    }

    pub(crate) fn push_ready(&mut self, id: TaskId) {
        let priority = self.task(id).priority;
        self.task_mut(id).state = TaskState::Ready;
        let seq = self.ready_seq;
        self.ready_seq += 1;
        self.ready.push(ReadyEntry { priority, seq, task: id });
    }

    fn pop_ready(&mut self) -> Option<TaskId> {
        while let Some(entry) = self.ready.pop() {
            if self.task(entry.task).state == TaskState::Ready {
                return Some(entry.task);
            }
        }
        None
    }

    /// Park the current task until `promise` resolves.
    pub(crate) fn block_on_promise(&mut self, promise: PromiseId, tag: Option<u64>) {
        let id = self.current;
        if let Some(owner) = self.promise(promise).owner_task {
            self.task_mut(owner).ever_joined = true;
        }
        self.promise_mut(promise).waiters.push(Waiter { task: id, tag });
        self.task_mut(id).state = TaskState::Blocked;
    }

    /// Non-blocking join: `None` while pending; otherwise the result with
    /// the child's delta merged (success) or the spawn separator pushed
    /// onto the trace (failure).
    pub(crate) fn try_join(&mut self, promise: PromiseId) -> Option<Result<Value, Failure>> {
        let owner = self.promise(promise).owner_task;
        if let Some(owner) = owner {
            self.task_mut(owner).ever_joined = true;
        }
        match self.promise(promise).state.clone() {
            PromiseState::Pending => None,
            PromiseState::Resolved(v) => {
                if let Some(owner) = owner {
                    self.merge_join(self.current, owner);
                }
                Some(Ok(v))
            }
            PromiseState::Rejected(mut f) => {
                if let Some(owner) = owner {
                    f.trace.push(TraceEntry::SpawnBoundary {
                        task: owner.0,
                        site: self.task(owner).spawn_site.map(site_str),
                    });
                }
                Some(Err(f))
            }
        }
    }

    pub(crate) fn resolve_promise(&mut self, promise: PromiseId, value: Value) {
        let p = self.promise_mut(promise);
        if !p.is_pending() {
            return;
        }
        p.state = PromiseState::Resolved(value.clone());
        let waiters = std::mem::take(&mut p.waiters);
        let owner = p.owner_task;
        for w in waiters {
            self.wake_task(w.task, w.tag, Ok(value.clone()), owner);
        }
    }

    pub(crate) fn reject_promise(&mut self, promise: PromiseId, failure: Failure) {
        let p = self.promise_mut(promise);
        if !p.is_pending() {
            return;
        }
        p.state = PromiseState::Rejected(failure.clone());
        let waiters = std::mem::take(&mut p.waiters);
        let owner = p.owner_task;
        for w in waiters {
            self.wake_task(w.task, w.tag, Err(failure.clone()), owner);
        }
    }

    pub(crate) fn remove_waiter(&mut self, promise: PromiseId, task: TaskId) {
        self.promise_mut(promise).waiters.retain(|w| w.task != task);
    }

    pub(crate) fn wake_task(
        &mut self,
        id: TaskId,
        tag: Option<u64>,
        result: Result<Value, Failure>,
        joined_task: Option<TaskId>,
    ) {
        let task = self.task_mut(id);
        if task.state.is_finished() || task.wake.is_some() {
            return;
        }
        task.wake = Some(Wake { tag, result, joined_task });
        if task.state == TaskState::Blocked {
            self.push_ready(id);
        }
    }

    /// Mark a task cancelled. Idempotent; finished tasks are untouched. A
    /// blocked task is pulled off every waiter list (no permit or promise
    /// slot leaks) and woken with the cancellation failure; a ready task
    /// observes it at its next step.
    pub(crate) fn cancel_task(&mut self, id: TaskId) {
        if self.task(id).state.is_finished() || self.task(id).cancel_requested {
            return;
        }
        self.task_mut(id).cancel_requested = true;
        for promise in &mut self.promises {
            promise.waiters.retain(|w| w.task != id);
        }
        for sem in &mut self.semaphores {
            sem.waiters.retain(|t| *t != id);
        }
        if self.task(id).state == TaskState::Blocked {
            self.task_mut(id).wake = None;
            self.push_ready(id);
        }
        tracing::debug!(task = id.0, "cancellation requested");
    }

    /// Merge a finished child's store and log into `parent`.
    ///
    /// Child writes win unless the parent wrote the same key after the
    /// spawn point; the log is appended in join (program) order. The
    /// delta merges at most once.
    pub(crate) fn merge_join(&mut self, parent: TaskId, child: TaskId) {
        if parent == child || self.task(child).merged {
            return;
        }
        self.task_mut(child).merged = true;
        let snapshot_seq = self.task(child).snapshot_seq;
        let delta: Vec<(String, StoreEntry)> = self
            .task(child)
            .store
            .iter()
            .filter(|(_, entry)| entry.seq > snapshot_seq)
            .map(|(k, entry)| (k.clone(), entry.clone()))
            .collect();
        let child_log = self.task(child).log.clone();
        let parent_task = self.task_mut(parent);
        for (key, entry) in delta {
            match parent_task.store.get(&key) {
                Some(existing) if existing.seq > snapshot_seq => {}
                _ => {
                    parent_task.store.insert(key, entry);
                }
            }
        }
        parent_task.log.extend(child_log);
    }

    fn complete_current(&mut self, res: Result<Value, Failure>) {
        let id = self.current;
        let result_promise = self.task(id).result;
        match res {
            Ok(v) => {
                self.task_mut(id).state = TaskState::Completed;
                self.resolve_promise(result_promise, v);
            }
            Err(f) => {
                let cancelled = matches!(f.error, EffectError::TaskCancelled { .. });
                self.task_mut(id).state =
                    if cancelled { TaskState::Cancelled } else { TaskState::Failed };
                if self.task(id).fire_and_forget && id != self.main {
                    tracing::debug!(
                        task = id.0,
                        error = %f.error,
                        "fire-and-forget task failed; error consumed"
                    );
                }
                self.reject_promise(result_promise, f);
            }
        }
    }

    // -- environment --------------------------------------------------------

    /// Walk overlays innermost-first: active `Local` frames, then the
    /// spawn-time snapshot, then the root env.
    pub(crate) fn env_lookup(&self, key: &str) -> Option<(Value, EnvSlot)> {
        let task = self.task(self.current);
        for frame in task.frames.iter().rev() {
            if let Frame::Overlay(of) = frame {
                if let Some(v) = of.overlay.get(key) {
                    return Some((v.clone(), EnvSlot::FrameOverlay(of.id)));
                }
            }
        }
        for (idx, overlay) in task.env_base.iter().enumerate().rev() {
            if let Some(v) = overlay.get(key) {
                return Some((v.clone(), EnvSlot::Base(idx)));
            }
        }
        self.root_env.get(key).map(|v| (v.clone(), EnvSlot::Root))
    }

    /// Memoize a lazily-resolved env value in the overlay it came from.
    /// Skips quietly if the overlay's dynamic extent already ended.
    pub(crate) fn memoize_env(&mut self, key: String, slot: EnvSlot, value: Value) {
        match slot {
            EnvSlot::Root => {
                self.root_env.insert(key, value);
            }
            EnvSlot::Base(idx) => {
                let id = self.current;
                if let Some(overlay) = self.task_mut(id).env_base.get_mut(idx) {
                    overlay.insert(key, value);
                }
            }
            EnvSlot::FrameOverlay(overlay_id) => {
                for frame in self.frames_mut().iter_mut() {
                    if let Frame::Overlay(of) = frame {
                        if of.id == overlay_id {
                            of.overlay.insert(key, value);
                            return;
                        }
                    }
                }
            }
        }
    }

    // -- external completions ----------------------------------------------

    fn drain_external(&mut self, block: bool) {
        if block {
            if let Ok(completion) = self.ext_rx.recv() {
                self.apply_completion(completion);
            }
        }
        while let Ok(completion) = self.ext_rx.try_recv() {
            self.apply_completion(completion);
        }
    }

    fn apply_completion(&mut self, completion: ExternalCompletion) {
        let id = completion.promise;
        if !self.promise(id).is_pending() {
            tracing::debug!(promise = id.0, "late external completion ignored");
            return;
        }
        self.external_outstanding = self.external_outstanding.saturating_sub(1);
        match completion.result {
            Ok(v) => self.resolve_promise(id, v),
            Err(e) => self.reject_promise(id, Failure::new(e)),
        }
    }

    // -- the run loop -------------------------------------------------------

    /// Drive the machine until the main task finishes (or the run aborts
    /// fatally or deadlocks). Returns the number of unjoined tasks.
    pub fn run_to_completion(&mut self) -> usize {
        loop {
            self.drain_external(false);
            if self.fatal.is_some() || self.task(self.main).state.is_finished() {
                break;
            }
            match self.pop_ready() {
                Some(id) => self.run_task(id),
                None => {
                    if self.external_outstanding > 0 {
                        self.drain_external(true);
                    } else {
                        let failure = Failure::new(EffectError::Deadlock);
                        let main_promise = self.task(self.main).result;
                        self.reject_promise(main_promise, failure);
                        self.task_mut(self.main).state = TaskState::Failed;
                        break;
                    }
                }
            }
        }
        self.finish()
    }

    fn finish(&mut self) -> usize {
        // Close every coroutine still parked in an unfinished task so the
        // exactly-once close guarantee holds at run end too.
        for idx in 0..self.tasks.len() {
            let id = TaskId(idx as u64);
            self.current = id;
            let frames = std::mem::take(&mut self.task_mut(id).frames);
            self.close_frames(frames);
            if let Some(Control::Eval(expr)) = self.task_mut(id).control.take() {
                discard_expr(&expr);
            }
        }
        self.current = self.main;
        let unjoined = self
            .tasks
            .iter()
            .filter(|t| t.id != self.main && !t.fire_and_forget && !t.ever_joined)
            .count();
        if unjoined > 0 {
            tracing::warn!(
                count = unjoined,
                "run finished with unjoined tasks; wait on each handle, or spawn \
                 with spawn_with(expr, priority, true) to mark fire-and-forget"
            );
        }
        unjoined
    }

    fn run_task(&mut self, id: TaskId) {
        self.current = id;
        if self.task(id).state.is_finished() {
            return;
        }
        self.task_mut(id).state = TaskState::Running;

        if self.task(id).cancel_requested {
            self.task_mut(id).cancel_requested = false;
            if let Some(Control::Eval(expr)) = self.task_mut(id).control.take() {
                discard_expr(&expr);
            }
            self.task_mut(id).wake = None;
            self.set_deliver(Err(Failure::new(EffectError::TaskCancelled { task: id.0 })));
        } else if let Some(wake) = self.task_mut(id).wake.take() {
            self.intake_wake(wake);
        }

        loop {
            if self.fatal.is_some() {
                return;
            }
            if self.task(self.current).state != TaskState::Running {
                return;
            }
            let Some(control) = self.task_mut(self.current).control.take() else {
                // A running task with no pending control has nothing left
                // to do; treat it as completed with unit.
                self.complete_current(Ok(Value::Unit));
                return;
            };
            match control {
                Control::Eval(expr) => self.eval(expr),
                Control::Deliver(res) => self.deliver(res),
            }
        }
    }

    fn intake_wake(&mut self, wake: Wake) {
        if let (Ok(_), Some(child)) = (&wake.result, wake.joined_task) {
            self.merge_join(self.current, child);
        }
        let mut result = wake.result;
        if let (Err(f), Some(child)) = (&mut result, wake.joined_task) {
            f.trace.push(TraceEntry::SpawnBoundary {
                task: child.0,
                site: self.task(child).spawn_site.map(site_str),
            });
        }
        self.current_wake_tag = wake.tag;
        self.set_deliver(result);
    }

    // -- evaluation ---------------------------------------------------------

    fn eval(&mut self, expr: Expr) {
        match expr {
            Expr::Pure(v) => self.set_deliver(Ok(v)),
            Expr::Effect(e) | Expr::Perform(e) => self.dispatch(e),
            Expr::Do(d) => match d.take() {
                Ok(co) => {
                    self.frames_mut().push(Frame::Co(CoFrame { co }));
                    self.set_deliver(Ok(Value::Unit));
                }
                Err(e) => self.fail_current(Failure::new(e)),
            },
            Expr::WithHandler { handler, body, return_clause } => {
                let scope_id = self.next_scope_id();
                self.frames_mut().push(Frame::Boundary(BoundaryFrame {
                    handler,
                    return_clause,
                    scope_id,
                    owned_by_body: false,
                }));
                self.set_eval(*body);
            }
            Expr::Resume { k, value } | Expr::ResumeContinuation { k, value } => {
                match self.continuations.take(k) {
                    Ok(frames) => {
                        self.frames_mut().extend(frames);
                        self.set_deliver(Ok(*value));
                    }
                    Err(fault) => self.raise_fatal(Failure::new(fault.into_error())),
                }
            }
            Expr::Transfer { k, expr } => match self.continuations.take(k) {
                Ok(frames) => {
                    self.frames_mut().extend(frames);
                    self.set_eval(*expr);
                }
                Err(fault) => self.raise_fatal(Failure::new(fault.into_error())),
            },
            Expr::Call { f, mut args } => {
                if args.is_empty() {
                    self.invoke_native(f, Vec::new());
                } else {
                    let first = args.remove(0);
                    self.frames_mut().push(Frame::Call(CallFrame {
                        f,
                        evaluated: Vec::new(),
                        remaining: args.into(),
                    }));
                    self.set_eval(first);
                }
            }
            Expr::Delegate | Expr::Pass => {
                self.fail_current(Failure::new(EffectError::type_error(
                    "Delegate/Pass is only valid as a direct yield of a handler body",
                )));
            }
        }
    }

    fn invoke_native(&mut self, f: NativeFn, args: Vec<Value>) {
        match f.call(args) {
            Ok(Value::Program(e)) => self.set_eval(*e),
            Ok(v) => self.set_deliver(Ok(v)),
            Err(e) => self.fail_current(Failure::new(e)),
        }
    }

    // -- delivery -----------------------------------------------------------

    fn deliver(&mut self, res: Result<Value, Failure>) {
        let wake_tag = self.current_wake_tag.take();
        let Some(frame) = self.frames_mut().pop() else {
            self.complete_current(res);
            return;
        };
        match frame {
            Frame::Co(cf) => self.deliver_co(cf, res),
            Frame::HandlerBody(hb) => self.deliver_handler_body(hb, res),
            Frame::Boundary(b) => self.deliver_boundary(b, res),
            Frame::Call(cf) => self.deliver_call(cf, res),
            Frame::Overlay(_) => self.set_deliver(res),
            Frame::Listen(lf) => self.deliver_listen(lf, res),
            Frame::Safe => self.deliver_safe(res),
            Frame::Recover(rf) => self.deliver_recover(rf, res),
            Frame::ResolveEnv(rf) => self.deliver_resolve_env(rf, res),
            Frame::Gather(gf) => self.deliver_gather(gf, res),
            Frame::Race(rf) => self.finish_race(rf, res, wake_tag),
        }
    }

    fn deliver_co(&mut self, mut cf: CoFrame, res: Result<Value, Failure>) {
        let pending = res.as_ref().err().cloned();
        let sent = res.map_err(|f| f.error);
        match cf.co.resume(sent) {
            CoStep::Yield(expr) => {
                self.frames_mut().push(Frame::Co(cf));
                self.set_eval(expr);
            }
            CoStep::Return(v) => {
                cf.co.close();
                self.set_deliver(Ok(v));
            }
            CoStep::Fail(e) => {
                cf.co.close();
                let failure = match pending {
                    Some(f) if f.error == e => f,
                    _ => Failure::new(e),
                };
                self.fail_current(failure);
            }
        }
    }

    fn deliver_boundary(&mut self, b: BoundaryFrame, res: Result<Value, Failure>) {
        match res {
            Ok(v) => {
                if b.owned_by_body {
                    // Completion of a resumed computation: route the raw
                    // value into the suspended handler body below.
                    self.set_deliver(Ok(v));
                } else if let Some(rc) = b.return_clause {
                    self.set_eval(rc.apply(v));
                } else {
                    self.set_deliver(Ok(v));
                }
            }
            Err(mut f) => {
                f.trace.push(TraceEntry::Scope { handler: b.handler.name() });
                self.set_deliver(Err(f));
            }
        }
    }

    fn deliver_call(&mut self, mut cf: CallFrame, res: Result<Value, Failure>) {
        match res {
            Ok(v) => {
                cf.evaluated.push(v);
                if let Some(next) = cf.remaining.pop_front() {
                    self.frames_mut().push(Frame::Call(cf));
                    self.set_eval(next);
                } else {
                    self.invoke_native(cf.f, cf.evaluated);
                }
            }
            Err(f) => {
                for expr in &cf.remaining {
                    discard_expr(expr);
                }
                self.set_deliver(Err(f));
            }
        }
    }

    fn deliver_listen(&mut self, lf: ListenFrame, res: Result<Value, Failure>) {
        let id = self.current;
        let inner = std::mem::replace(&mut self.task_mut(id).log, lf.outer_log);
        match res {
            Ok(v) => self.set_deliver(Ok(Value::map([
                ("log".to_string(), Value::List(inner)),
                ("value".to_string(), v),
            ]))),
            Err(f) => self.set_deliver(Err(f)),
        }
    }

    fn deliver_safe(&mut self, res: Result<Value, Failure>) {
        match res {
            Ok(v) => self.set_deliver(Ok(Value::ok(v))),
            Err(f) => self.set_deliver(Ok(Value::err(f.error))),
        }
    }

    fn deliver_recover(&mut self, mut rf: RecoverFrame, res: Result<Value, Failure>) {
        match res {
            Ok(v) => self.set_deliver(Ok(v)),
            Err(f) => match rf.fallback.take() {
                Some(fallback) => self.set_eval(fallback),
                None => self.set_deliver(Err(f)),
            },
        }
    }

    fn deliver_resolve_env(&mut self, rf: ResolveEnvFrame, res: Result<Value, Failure>) {
        match res {
            Ok(v) => {
                self.memoize_env(rf.key, rf.slot, v.clone());
                self.set_deliver(Ok(v));
            }
            Err(f) => self.set_deliver(Err(f)),
        }
    }

    fn deliver_gather(&mut self, mut gf: GatherFrame, res: Result<Value, Failure>) {
        match res {
            Ok(v) => {
                gf.results.push(v);
                self.advance_gather(gf);
            }
            Err(f) => {
                self.abort_gather(gf);
                self.set_deliver(Err(f));
            }
        }
    }

    /// Start/continue the gather: resolve items in program order, blocking
    /// on the first pending one.
    pub(crate) fn advance_gather(&mut self, mut gf: GatherFrame) {
        loop {
            let Some(item) = gf.pending.pop_front() else {
                self.set_deliver(Ok(Value::List(gf.results)));
                return;
            };
            let promise = match item {
                GatherItem::Program(expr) => {
                    let priority = self.task(self.current).priority;
                    let current = self.current;
                    let child =
                        self.spawn_task(expr, priority, false, Some(current), None);
                    gf.spawned.push(child);
                    self.task(child).result
                }
                GatherItem::Task(t) => self.task(t).result,
                GatherItem::Promise(p) => p,
            };
            match self.try_join(promise) {
                Some(Ok(v)) => {
                    gf.results.push(v);
                }
                Some(Err(f)) => {
                    self.abort_gather(gf);
                    self.set_deliver(Err(f));
                    return;
                }
                None => {
                    self.block_on_promise(promise, None);
                    self.frames_mut().push(Frame::Gather(gf));
                    return;
                }
            }
        }
    }

    /// First failure in program order: cancel still-running siblings and
    /// drop unstarted items.
    fn abort_gather(&mut self, gf: GatherFrame) {
        for t in &gf.spawned {
            self.cancel_task(*t);
        }
        for item in gf.pending {
            match item {
                GatherItem::Program(expr) => discard_expr(&expr),
                GatherItem::Task(t) => self.cancel_task(t),
                GatherItem::Promise(_) => {}
            }
        }
    }

    // -- discard ------------------------------------------------------------

    /// Close every coroutine reachable from a discarded frame segment,
    /// cancelling gather/race children and releasing waiter slots.
    pub(crate) fn close_frames(&mut self, frames: Vec<Frame>) {
        let mut work = frames;
        while let Some(frame) = work.pop() {
            match frame {
                Frame::Co(mut cf) => cf.co.close(),
                Frame::HandlerBody(mut hb) => {
                    hb.co.close();
                    if let Some(more) = self.continuations.discard(hb.k) {
                        work.extend(more);
                    }
                }
                Frame::Call(cf) => {
                    for expr in &cf.remaining {
                        discard_expr(expr);
                    }
                }
                Frame::Gather(gf) => {
                    for t in &gf.spawned {
                        self.cancel_task(*t);
                    }
                    for item in gf.pending {
                        if let GatherItem::Program(expr) = item {
                            discard_expr(&expr);
                        }
                    }
                }
                Frame::Race(rf) => {
                    let current = self.current;
                    for promise in &rf.promises {
                        self.remove_waiter(*promise, current);
                    }
                    for t in rf.tasks.into_iter().flatten() {
                        self.cancel_task(t);
                    }
                }
                Frame::Boundary(_)
                | Frame::Overlay(_)
                | Frame::Listen(_)
                | Frame::Safe
                | Frame::Recover(_)
                | Frame::ResolveEnv(_) => {}
            }
        }
    }
}
