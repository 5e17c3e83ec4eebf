//! Effect dispatch and the built-in handlers.
//!
//! A yielded effect walks the frame stack innermost to outermost looking
//! for a boundary whose handler accepts it. Built-in handlers are decided
//! statically (a switch on the effect kind) and executed natively;
//! user handlers always accept and decide at runtime by yielding
//! `Resume`, `Delegate` or `Pass` from their body.
//!
//! Handler-identity rule: a matched boundary is popped before its body
//! runs, so effects performed by the body dispatch to the next outer
//! handler. When the body resumes the continuation, the boundary is
//! re-pushed above it, which keeps the handler installed (deep) for the
//! resumed computation.

use crate::trace::{Failure, HandlerStatus, TraceEntry};
use crate::vm::frames::{
    BoundaryFrame, Frame, GatherFrame, GatherItem, GatherMode, HandlerBodyFrame,
    ListenFrame, OverlayFrame, RaceFrame, RecoverFrame, ResolveEnvFrame,
};
use crate::vm::machine::{site_str, Machine};
use crate::vm::sched::{Promise, Semaphore, StoreEntry, TaskState, Waiter};

use doeff_core::effects::{Effect, EffectKind, EffectTag, INTERPRETER_KEY};
use doeff_core::errors::EffectError;
use doeff_core::expr::{CoGen, CoStep, Continuation, Expr, Handler};
use doeff_core::values::{
    Awaitable, ExternalPromise, PromiseId, SemaphoreId, TaskId, UpdateFn, Value,
};

use std::collections::{BTreeMap, VecDeque};

/// Build a failure annotated with the failing effect's creation site.
fn effect_failure(error: EffectError, effect: &Effect) -> Failure {
    Failure::with_effect(error, effect.describe(), effect.created_at.map(site_str))
}

/// Static accept check for built-in handlers; user handlers decide at
/// runtime.
fn accepts(handler: &Handler, effect: &Effect) -> bool {
    let tag = effect.tag();
    match handler {
        Handler::State => matches!(
            tag,
            EffectTag::Get
                | EffectTag::Put
                | EffectTag::Modify
                | EffectTag::AtomicGet
                | EffectTag::AtomicUpdate
                | EffectTag::Snapshot
        ),
        Handler::Reader => {
            matches!(tag, EffectTag::Ask | EffectTag::Dep | EffectTag::Local)
        }
        Handler::Writer => matches!(
            tag,
            EffectTag::Tell | EffectTag::StructuredLog | EffectTag::Listen
        ),
        Handler::Result => {
            matches!(tag, EffectTag::Safe | EffectTag::Recover | EffectTag::Fail)
        }
        Handler::Scheduler => matches!(
            tag,
            EffectTag::Spawn
                | EffectTag::Wait
                | EffectTag::Gather
                | EffectTag::Parallel
                | EffectTag::Race
                | EffectTag::Cancel
                | EffectTag::CreateSemaphore
                | EffectTag::AcquireSemaphore
                | EffectTag::ReleaseSemaphore
                | EffectTag::CreateExternalPromise
        ),
        Handler::SyncAwait => matches!(tag, EffectTag::Await),
        Handler::Cache(_) => matches!(
            tag,
            EffectTag::CacheGet
                | EffectTag::CachePut
                | EffectTag::CacheExists
                | EffectTag::CacheDelete
        ),
        Handler::User(_) => true,
    }
}

impl Machine {
    // -- dispatch walk ------------------------------------------------------

    pub(crate) fn dispatch(&mut self, effect: Effect) {
        self.dispatch_continue(effect, VecDeque::new());
    }

    /// Continue a dispatch walk with `carry` holding the frames already
    /// popped above the current position (bottom of the segment at the
    /// front).
    pub(crate) fn dispatch_continue(&mut self, effect: Effect, mut carry: VecDeque<Frame>) {
        loop {
            let Some(frame) = self.frames_mut().pop() else {
                // Walked off the stack: restore the segment and fail at
                // the yield point so `Safe` frames inside it still apply.
                self.frames_mut().extend(carry);
                let failure = effect_failure(
                    EffectError::MissingHandler { effect: effect.describe() },
                    &effect,
                );
                self.fail_current(failure);
                return;
            };
            match frame {
                Frame::Boundary(b) if accepts(&b.handler, &effect) => {
                    if matches!(b.handler, Handler::User(_)) {
                        self.begin_user_handler(b, effect, carry);
                    } else {
                        let handler = b.handler.clone();
                        self.frames_mut().push(Frame::Boundary(b));
                        self.frames_mut().extend(carry);
                        self.run_builtin(handler, effect);
                    }
                    return;
                }
                other => carry.push_front(other),
            }
        }
    }

    fn begin_user_handler(
        &mut self,
        boundary: BoundaryFrame,
        effect: Effect,
        carry: VecDeque<Frame>,
    ) {
        let Handler::User(uh) = boundary.handler.clone() else {
            unreachable!("begin_user_handler on a built-in boundary");
        };
        let k = self.continuations.capture(carry.into_iter().collect());
        let co = uh.body(effect.clone(), k);
        let hb = HandlerBodyFrame {
            co: Box::new(CoGen::new(format!("handler:{}", uh.name()), co)),
            k,
            effect,
            handler_name: uh.name().to_string(),
            apply_rc: !boundary.owned_by_body,
            return_clause: boundary.return_clause.clone(),
            boundary: Some(boundary),
            yielded: false,
            resumed: false,
        };
        self.frames_mut().push(Frame::HandlerBody(hb));
        self.set_deliver(Ok(Value::Unit));
    }

    // -- the handler body protocol -------------------------------------------

    pub(crate) fn deliver_handler_body(
        &mut self,
        mut hb: HandlerBodyFrame,
        res: Result<Value, Failure>,
    ) {
        let pending = res.as_ref().err().cloned();
        let sent = res.map_err(|f| f.error);
        match hb.co.resume(sent) {
            CoStep::Yield(expr) => {
                hb.yielded = true;
                match expr {
                    Expr::Resume { k, value } => self.handler_resume(hb, k, *value),
                    Expr::Delegate | Expr::Pass => self.handler_forward(hb),
                    other => {
                        self.frames_mut().push(Frame::HandlerBody(hb));
                        self.set_eval(other);
                    }
                }
            }
            CoStep::Return(v) => self.handler_return(hb, v),
            CoStep::Fail(e) => {
                hb.co.close();
                if let Some(frames) = self.continuations.discard(hb.k) {
                    self.close_frames(frames);
                }
                let mut failure = match pending {
                    Some(f) if f.error == e => f,
                    _ => Failure::new(e),
                };
                failure.trace.push(TraceEntry::HandlerFrame {
                    handler: hb.handler_name.clone(),
                    status: HandlerStatus::Failed,
                    effect: Some(hb.effect.describe()),
                });
                self.fail_current(failure);
            }
        }
    }

    /// `yield Resume(k, value)`: splice the captured frames back, with the
    /// handler's scope re-pushed beneath them so it stays installed for
    /// the resumed computation. The body stays suspended underneath and
    /// receives the computation's final value.
    fn handler_resume(&mut self, mut hb: HandlerBodyFrame, k: Continuation, value: Value) {
        if k != hb.k {
            hb.co.close();
            if let Some(frames) = self.continuations.discard(hb.k) {
                self.close_frames(frames);
            }
            self.raise_fatal(Failure::new(EffectError::handler_contract(
                "handler resumed a continuation it does not own",
            )));
            return;
        }
        match self.continuations.take(k) {
            Err(fault) => {
                hb.co.close();
                self.raise_fatal(Failure::new(fault.into_error()));
            }
            Ok(frames) => {
                hb.resumed = true;
                let boundary = hb.boundary.take();
                self.frames_mut().push(Frame::HandlerBody(hb));
                if let Some(mut b) = boundary {
                    b.owned_by_body = true;
                    self.frames_mut().push(Frame::Boundary(b));
                }
                self.frames_mut().extend(frames);
                self.set_deliver(Ok(value));
            }
        }
    }

    /// `yield Delegate` / `yield Pass`: fold the captured segment and the
    /// traversed scope back into the carry and keep walking outward, so
    /// the inner handler stays installed inside the continuation.
    fn handler_forward(&mut self, mut hb: HandlerBodyFrame) {
        hb.co.close();
        let segment = match self.continuations.take(hb.k) {
            Ok(segment) => segment,
            Err(fault) => {
                self.raise_fatal(Failure::new(fault.into_error()));
                return;
            }
        };
        let mut carry: VecDeque<Frame> = segment.into();
        if let Some(b) = hb.boundary.take() {
            carry.push_front(Frame::Boundary(b));
        }
        tracing::debug!(
            handler = %hb.handler_name,
            effect = %hb.effect.describe(),
            "handler delegated"
        );
        self.dispatch_continue(hb.effect, carry);
    }

    /// The body completed with `v`.
    fn handler_return(&mut self, mut hb: HandlerBodyFrame, v: Value) {
        hb.co.close();
        if !hb.yielded {
            self.raise_fatal(Failure::new(EffectError::handler_contract(
                "handler must return a generator; did you forget 'yield Resume(k, ...)'?",
            )));
            return;
        }
        if !hb.resumed {
            // Abandonment: the effect's continuation never runs.
            if let Some(frames) = self.continuations.discard(hb.k) {
                self.close_frames(frames);
            }
        }
        if hb.apply_rc {
            if let Some(rc) = hb.return_clause.take() {
                self.set_eval(rc.apply(v));
                return;
            }
        }
        self.set_deliver(Ok(v));
    }

    // -- built-in handlers ---------------------------------------------------

    fn run_builtin(&mut self, handler: Handler, effect: Effect) {
        match handler {
            Handler::State => self.builtin_state(effect),
            Handler::Reader => self.builtin_reader(effect),
            Handler::Writer => self.builtin_writer(effect),
            Handler::Result => self.builtin_result(effect),
            Handler::Scheduler => self.builtin_scheduler(effect),
            Handler::SyncAwait => self.builtin_await(effect),
            Handler::Cache(backend) => self.builtin_cache(&*backend, effect),
            Handler::User(_) => unreachable!("user handlers run through dispatch"),
        }
    }

    fn builtin_state(&mut self, effect: Effect) {
        let current = self.current;
        match effect.kind.clone() {
            EffectKind::Get { key } | EffectKind::AtomicGet { key } => {
                let v = self
                    .task(current)
                    .store
                    .get(&key)
                    .map(|e| e.value.clone())
                    .unwrap_or(Value::Unit);
                self.set_deliver(Ok(v));
            }
            EffectKind::Put { key, value } => {
                let seq = self.next_write_seq();
                self.task_mut(current).store.insert(key, StoreEntry { value, seq });
                self.set_deliver(Ok(Value::Unit));
            }
            EffectKind::Modify { key, f } => {
                self.store_update(current, key, f, None);
            }
            EffectKind::AtomicUpdate { key, f, default } => {
                self.store_update(current, key, f, default);
            }
            EffectKind::Snapshot => {
                let snapshot: BTreeMap<String, Value> = self
                    .task(current)
                    .store
                    .iter()
                    .map(|(k, e)| (k.clone(), e.value.clone()))
                    .collect();
                self.set_deliver(Ok(Value::Map(snapshot)));
            }
            _ => unreachable!("state handler accepted a foreign effect"),
        }
    }

    fn store_update(
        &mut self,
        task: TaskId,
        key: String,
        f: UpdateFn,
        default: Option<Value>,
    ) {
        let current = self
            .task(task)
            .store
            .get(&key)
            .map(|e| e.value.clone())
            .or(default)
            .unwrap_or(Value::Unit);
        let updated = f.apply(current);
        let seq = self.next_write_seq();
        self.task_mut(task)
            .store
            .insert(key, StoreEntry { value: updated.clone(), seq });
        self.set_deliver(Ok(updated));
    }

    fn builtin_reader(&mut self, effect: Effect) {
        match effect.kind.clone() {
            EffectKind::Ask { key } | EffectKind::Dep { key } => {
                if key == INTERPRETER_KEY {
                    let handle = Value::map([(
                        "interpreter".to_string(),
                        Value::Str(self.run_id.to_string()),
                    )]);
                    self.set_deliver(Ok(handle));
                    return;
                }
                match self.env_lookup(&key) {
                    None => {
                        let failure = effect_failure(
                            EffectError::MissingEnvKey { key },
                            &effect,
                        );
                        self.fail_current(failure);
                    }
                    Some((Value::Program(e), slot)) => {
                        // Lazy entry: evaluate once, memoize where found.
                        self.frames_mut()
                            .push(Frame::ResolveEnv(ResolveEnvFrame { key, slot }));
                        self.set_eval(*e);
                    }
                    Some((v, _)) => self.set_deliver(Ok(v)),
                }
            }
            EffectKind::Local { overlay, body } => {
                let id = self.next_overlay_id();
                self.frames_mut().push(Frame::Overlay(OverlayFrame { id, overlay }));
                self.set_eval(*body);
            }
            _ => unreachable!("reader handler accepted a foreign effect"),
        }
    }

    fn builtin_writer(&mut self, effect: Effect) {
        let current = self.current;
        match effect.kind.clone() {
            EffectKind::Tell { entry } => {
                self.task_mut(current).log.push(entry);
                self.set_deliver(Ok(Value::Unit));
            }
            EffectKind::StructuredLog { payload } => {
                self.task_mut(current).log.push(payload);
                self.set_deliver(Ok(Value::Unit));
            }
            EffectKind::Listen { body } => {
                let outer_log = std::mem::take(&mut self.task_mut(current).log);
                self.frames_mut().push(Frame::Listen(ListenFrame { outer_log }));
                self.set_eval(*body);
            }
            _ => unreachable!("writer handler accepted a foreign effect"),
        }
    }

    fn builtin_result(&mut self, effect: Effect) {
        match effect.kind.clone() {
            EffectKind::Safe { body } => {
                self.frames_mut().push(Frame::Safe);
                self.set_eval(*body);
            }
            EffectKind::Recover { body, fallback } => {
                self.frames_mut()
                    .push(Frame::Recover(RecoverFrame { fallback: Some(*fallback) }));
                self.set_eval(*body);
            }
            EffectKind::Fail { error } => {
                let failure = effect_failure(error, &effect);
                self.fail_current(failure);
            }
            _ => unreachable!("result handler accepted a foreign effect"),
        }
    }

    fn builtin_await(&mut self, effect: Effect) {
        let EffectKind::Await { awaitable } = effect.kind.clone() else {
            unreachable!("await handler accepted a foreign effect");
        };
        self.run_awaitable_inline(&awaitable, &effect);
    }

    fn run_awaitable_inline(&mut self, awaitable: &Awaitable, effect: &Effect) {
        match awaitable.take() {
            None => {
                let failure = effect_failure(
                    EffectError::type_error("awaitable was already consumed"),
                    effect,
                );
                self.fail_current(failure);
            }
            // Blocking bridge: the machine thread runs the thunk inline.
            Some(thunk) => match thunk() {
                Ok(v) => self.set_deliver(Ok(v)),
                Err(e) => self.fail_current(effect_failure(e, effect)),
            },
        }
    }

    fn builtin_cache(&mut self, backend: &dyn doeff_core::CacheBackend, effect: Effect) {
        let outcome = match effect.kind.clone() {
            EffectKind::CacheGet { key } => match backend.get(&key) {
                Ok(Some(v)) => Ok(v),
                Ok(None) => Err(EffectError::CacheMiss { key }),
                Err(e) => Err(e),
            },
            EffectKind::CachePut { key, value } => {
                backend.put(&key, value).map(|_| Value::Unit)
            }
            EffectKind::CacheExists { key } => backend.exists(&key).map(Value::Bool),
            EffectKind::CacheDelete { key } => backend.delete(&key).map(Value::Bool),
            _ => unreachable!("cache handler accepted a foreign effect"),
        };
        match outcome {
            Ok(v) => self.set_deliver(Ok(v)),
            Err(e) => {
                let failure = effect_failure(e, &effect);
                self.fail_current(failure);
            }
        }
    }

    // -- scheduler effects ---------------------------------------------------

    fn builtin_scheduler(&mut self, effect: Effect) {
        let current = self.current;
        match effect.kind.clone() {
            EffectKind::Spawn { expr, priority, fire_and_forget } => {
                let child = self.spawn_task(
                    *expr,
                    priority,
                    fire_and_forget,
                    Some(current),
                    effect.created_at,
                );
                self.set_deliver(Ok(Value::Task(child)));
            }
            EffectKind::Wait { target } => self.sched_wait(target, &effect),
            EffectKind::Gather { items } => {
                let pending = items.into_iter().map(gather_item).collect();
                self.advance_gather(GatherFrame {
                    mode: GatherMode::Serial,
                    pending,
                    results: Vec::new(),
                    spawned: Vec::new(),
                });
            }
            EffectKind::Parallel { items } => self.sched_parallel(items, &effect),
            EffectKind::Race { items } => self.sched_race(items, &effect),
            EffectKind::Cancel { task } => {
                self.cancel_task(task);
                if task == current {
                    self.set_deliver(Err(Failure::new(EffectError::TaskCancelled {
                        task: task.0,
                    })));
                    self.task_mut(current).cancel_requested = false;
                } else {
                    self.set_deliver(Ok(Value::Unit));
                }
            }
            EffectKind::CreateSemaphore { permits } => {
                if permits < 1 {
                    let failure = effect_failure(
                        EffectError::SemaphoreInit { permits },
                        &effect,
                    );
                    self.fail_current(failure);
                } else {
                    let id = SemaphoreId(self.semaphores.len() as u64);
                    self.semaphores.push(Semaphore::new(permits));
                    self.set_deliver(Ok(Value::Semaphore(id)));
                }
            }
            EffectKind::AcquireSemaphore { sem } => self.sched_acquire(sem, &effect),
            EffectKind::ReleaseSemaphore { sem } => self.sched_release(sem, &effect),
            EffectKind::CreateExternalPromise => {
                let id = self.alloc_promise(Promise::external());
                self.external_outstanding += 1;
                let handle = ExternalPromise::new(id, self.ext_tx.clone());
                self.set_deliver(Ok(Value::External(handle)));
            }
            _ => unreachable!("scheduler handler accepted a foreign effect"),
        }
    }

    fn sched_wait(&mut self, target: Value, effect: &Effect) {
        let promise = match wait_target(&target) {
            Some(p) => p,
            None => {
                let failure = effect_failure(
                    EffectError::type_error(format!(
                        "Wait expects a task or promise, got {}",
                        target.type_name()
                    )),
                    effect,
                );
                self.fail_current(failure);
                return;
            }
        };
        let promise = match promise {
            WaitTarget::Task(t) => self.task(t).result,
            WaitTarget::Promise(p) => p,
        };
        match self.try_join(promise) {
            Some(Ok(v)) => self.set_deliver(Ok(v)),
            Some(Err(f)) => self.set_deliver(Err(f)),
            None => self.block_on_promise(promise, None),
        }
    }

    fn sched_parallel(&mut self, items: Vec<Value>, _effect: &Effect) {
        let current = self.current;
        let priority = self.task(current).priority;
        let mut spawned = Vec::new();
        let pending: VecDeque<GatherItem> = items
            .into_iter()
            .map(|item| match gather_item(item) {
                GatherItem::Program(expr) => {
                    let child =
                        self.spawn_task(expr, priority, false, Some(current), None);
                    spawned.push(child);
                    GatherItem::Task(child)
                }
                other => other,
            })
            .collect();
        self.advance_gather(GatherFrame {
            mode: GatherMode::Parallel,
            pending,
            results: Vec::new(),
            spawned,
        });
    }

    fn sched_race(&mut self, items: Vec<Value>, effect: &Effect) {
        if items.is_empty() {
            let failure = effect_failure(
                EffectError::type_error("Race requires at least one item"),
                effect,
            );
            self.fail_current(failure);
            return;
        }
        let current = self.current;
        let priority = self.task(current).priority;
        let mut tasks: Vec<Option<TaskId>> = Vec::with_capacity(items.len());
        let mut promises: Vec<PromiseId> = Vec::with_capacity(items.len());
        for item in items {
            match gather_item(item) {
                GatherItem::Program(expr) => {
                    let child =
                        self.spawn_task(expr, priority, false, Some(current), None);
                    tasks.push(Some(child));
                    promises.push(self.task(child).result);
                }
                GatherItem::Task(t) => {
                    tasks.push(Some(t));
                    promises.push(self.task(t).result);
                }
                GatherItem::Promise(p) => {
                    tasks.push(None);
                    promises.push(p);
                }
            }
        }

        for promise in &promises {
            if let Some(owner) = self.promise(*promise).owner_task {
                self.task_mut(owner).ever_joined = true;
            }
        }

        // A contender may already be finished; the earliest such index is
        // the winner without blocking.
        let already_done = promises
            .iter()
            .position(|p| !self.promise(*p).is_pending());
        if let Some(idx) = already_done {
            let res = self
                .try_join(promises[idx])
                .expect("non-pending promise joins");
            let rf = RaceFrame { tasks, promises };
            self.finish_race(rf, res, Some(idx as u64));
            return;
        }

        for (idx, promise) in promises.iter().enumerate() {
            self.promise_mut(*promise)
                .waiters
                .push(Waiter { task: current, tag: Some(idx as u64) });
        }
        self.task_mut(current).state = TaskState::Blocked;
        self.frames_mut().push(Frame::Race(RaceFrame { tasks, promises }));
    }

    pub(crate) fn finish_race(
        &mut self,
        rf: RaceFrame,
        res: Result<Value, Failure>,
        wake_tag: Option<u64>,
    ) {
        let current = self.current;
        for (idx, promise) in rf.promises.iter().enumerate() {
            if Some(idx as u64) != wake_tag {
                self.remove_waiter(*promise, current);
            }
        }
        for (idx, task) in rf.tasks.iter().enumerate() {
            if Some(idx as u64) != wake_tag {
                if let Some(t) = task {
                    self.cancel_task(*t);
                }
            }
        }
        match res {
            Ok(v) => {
                let index = wake_tag.unwrap_or(0);
                self.set_deliver(Ok(Value::map([
                    ("index".to_string(), Value::Int(index as i64)),
                    ("value".to_string(), v),
                ])));
            }
            Err(f) => self.set_deliver(Err(f)),
        }
    }

    fn sched_acquire(&mut self, sem: SemaphoreId, effect: &Effect) {
        let current = self.current;
        if sem.0 as usize >= self.semaphores.len() {
            let failure = effect_failure(
                EffectError::type_error("unknown semaphore handle"),
                effect,
            );
            self.fail_current(failure);
            return;
        }
        let semaphore = self.semaphore_mut(sem);
        if semaphore.available > 0 {
            semaphore.available -= 1;
            self.set_deliver(Ok(Value::Unit));
        } else {
            semaphore.waiters.push_back(current);
            self.task_mut(current).state = TaskState::Blocked;
        }
    }

    fn sched_release(&mut self, sem: SemaphoreId, effect: &Effect) {
        if sem.0 as usize >= self.semaphores.len() {
            let failure = effect_failure(
                EffectError::type_error("unknown semaphore handle"),
                effect,
            );
            self.fail_current(failure);
            return;
        }
        let semaphore = self.semaphore_mut(sem);
        if let Some(next) = semaphore.waiters.pop_front() {
            // Transfer the permit straight to the head waiter.
            self.wake_task(next, None, Ok(Value::Unit), None);
            self.set_deliver(Ok(Value::Unit));
        } else if semaphore.available >= semaphore.max {
            let failure = effect_failure(EffectError::SemaphoreRelease, effect);
            self.fail_current(failure);
        } else {
            semaphore.available += 1;
            self.set_deliver(Ok(Value::Unit));
        }
    }
}

enum WaitTarget {
    Task(TaskId),
    Promise(PromiseId),
}

fn wait_target(target: &Value) -> Option<WaitTarget> {
    match target {
        Value::Task(t) => Some(WaitTarget::Task(*t)),
        Value::Promise(p) => Some(WaitTarget::Promise(*p)),
        Value::External(e) => Some(WaitTarget::Promise(e.id())),
        _ => None,
    }
}

/// Classify one gather/race item.
fn gather_item(item: Value) -> GatherItem {
    match item {
        Value::Program(e) => GatherItem::Program(*e),
        Value::Task(t) => GatherItem::Task(t),
        Value::Promise(p) => GatherItem::Promise(p),
        Value::External(e) => GatherItem::Promise(e.id()),
        other => GatherItem::Program(Expr::Pure(other)),
    }
}
