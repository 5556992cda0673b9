// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Implementation of our single-threaded cooperative event loop.
//!
//! The loop owns a [TimerQueue] of time-deferred work and a [ReadyQueue] of
//! runnable work. Every iteration moves due timers into the ready queue,
//! drains the entries that were ready at the start of the drain (work
//! scheduled mid-drain waits for the next iteration, which bounds iteration
//! latency and gives deterministic fairness), and then either parks on the
//! earliest timer deadline or surfaces the stuck-loop failure when nothing
//! can ever become runnable again.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    clock::{
        Clock,
        LoopWaker,
        MonotonicClock,
    },
    collections::id_map::IdMap,
    coroutine::{
        Coroutine,
        ResumeArg,
        Value,
    },
    fail::Fail,
    promise::SharedPromise,
    scheduler::{
        ready::{
            CallbackHandle,
            ReadyQueue,
            ScheduledWork,
            Work,
        },
        task::{
            Parked,
            Progress,
            SharedTask,
            TaskId,
            TaskState,
        },
    },
    timer::{
        TimerHandle,
        TimerQueue,
    },
    SharedObject,
};
use ::slab::Slab;
use ::std::{
    cell::RefCell,
    ops::{
        Deref,
        DerefMut,
    },
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Thread Local Variables
//======================================================================================================================

thread_local! {
    /// Ambient loop for this thread: created lazily by [current], torn down by [SharedEventLoop::close].
    static CURRENT_LOOP: RefCell<Option<SharedEventLoop>> = RefCell::new(None);
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// Internal offset into the slab that holds the task state.
#[derive(Eq, PartialEq, Clone, Copy, Debug)]
struct InternalId(usize);

/// Handler for failures escaping plain callbacks. A malformed callback must not halt unrelated scheduled work, so the
/// loop forwards such failures here and keeps running.
pub type FailureHandler = Box<dyn Fn(&Fail)>;

/// Anything `run_until_complete` can drive to completion.
pub enum Awaitable {
    Coroutine(Box<dyn Coroutine>),
    Task(SharedTask),
    Promise(SharedPromise),
}

/// Event Loop
pub struct EventLoop {
    /// Monotonic time source and idle-wait primitive.
    clock: Box<dyn Clock>,
    /// Immediately-runnable work, strict FIFO.
    ready: ReadyQueue,
    /// Time-deferred work, ordered by (deadline, insertion sequence).
    timers: TimerQueue,
    /// Mapping between external task ids and offsets into the task slab.
    ids: IdMap<TaskId, InternalId>,
    /// Tasks currently owned by the loop; removed as soon as they finish.
    tasks: Slab<SharedTask>,
    /// Set by [SharedEventLoop::stop], consumed by the running loop at its next iteration boundary.
    stop_requested: bool,
    /// Set by [SharedEventLoop::close]; terminal.
    closed: bool,
    /// Receives failures escaping plain callbacks.
    failure_handler: FailureHandler,
}

#[derive(Clone)]
pub struct SharedEventLoop(SharedObject<EventLoop>);

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Returns the ambient event loop for this thread, creating it over the monotonic clock on first use. `close()` on
/// the returned loop tears the ambient slot down, so a later call creates a fresh loop.
pub fn current() -> SharedEventLoop {
    CURRENT_LOOP.with(|slot| {
        let mut slot = slot.borrow_mut();
        if let Some(event_loop) = &*slot {
            if !event_loop.is_closed() {
                return event_loop.clone();
            }
        }
        let event_loop: SharedEventLoop = SharedEventLoop::default();
        *slot = Some(event_loop.clone());
        event_loop
    })
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl SharedEventLoop {
    pub fn new(clock: Box<dyn Clock>) -> Self {
        crate::logging::initialize();
        Self(SharedObject::new(EventLoop {
            clock,
            ready: ReadyQueue::new(),
            timers: TimerQueue::new(),
            ids: IdMap::default(),
            tasks: Slab::new(),
            stop_requested: false,
            closed: false,
            failure_handler: Box::new(|fail: &Fail| {
                error!("unhandled callback failure: {:?}", fail);
            }),
        }))
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Current time according to the loop's clock.
    pub fn time(&self) -> Instant {
        self.clock.now()
    }

    /// Handle for waking this loop out of its idle wait from another thread.
    pub fn waker(&self) -> LoopWaker {
        self.clock.waker()
    }

    /// Moves time forward deterministically. Only meaningful for loops driven by a virtual clock.
    pub fn advance_clock(&mut self, now: Instant) {
        self.clock.advance(now)
    }

    /// Replaces the handler invoked for failures escaping plain callbacks. The default logs and continues.
    pub fn set_failure_handler<F>(&mut self, handler: F)
    where
        F: Fn(&Fail) + 'static,
    {
        self.failure_handler = Box::new(handler);
    }

    /// Enqueues `callback` at the back of the ready queue. Never blocks. Returns a cancellable handle.
    pub fn call_soon<F>(&mut self, callback: F) -> Result<CallbackHandle, Fail>
    where
        F: FnOnce() -> Result<(), Fail> + 'static,
    {
        self.ensure_open()?;
        Ok(self.ready.push(Work::Callback(Box::new(callback))))
    }

    /// Schedules `callback` to become ready once `delay` has elapsed. Returns a cancellable handle.
    pub fn call_later<F>(&mut self, delay: Duration, callback: F) -> Result<TimerHandle, Fail>
    where
        F: FnOnce() -> Result<(), Fail> + 'static,
    {
        let deadline: Instant = self.clock.now() + delay;
        self.call_at(deadline, callback)
    }

    /// Schedules `callback` to become ready at the absolute `deadline`. Returns a cancellable handle.
    pub fn call_at<F>(&mut self, deadline: Instant, callback: F) -> Result<TimerHandle, Fail>
    where
        F: FnOnce() -> Result<(), Fail> + 'static,
    {
        self.ensure_open()?;
        Ok(self.timers.insert(deadline, Work::Callback(Box::new(callback))))
    }

    /// Creates a pending promise whose completion callbacks will be scheduled through this loop.
    pub fn create_promise(&mut self) -> SharedPromise {
        SharedPromise::new(self.clone())
    }

    /// Wraps `coroutine` in a task named `name`, schedules its first resumption, and returns the task. The task's
    /// promise can be awaited or inspected for the eventual result.
    pub fn create_task(&mut self, name: &str, coroutine: Box<dyn Coroutine>) -> Result<SharedTask, Fail> {
        self.ensure_open()?;
        let promise: SharedPromise = self.create_promise();
        let mut task: SharedTask = SharedTask::new(name.to_string(), coroutine, promise);
        let internal_id: InternalId = InternalId(self.tasks.insert(task.clone()));
        let task_id: TaskId = self.ids.insert_with_new_id(internal_id);
        task.set_id(task_id);
        trace!("create_task(): name={:?}, id={:?}", name, task_id);
        let generation: u64 = task.generation();
        self.enqueue_resume(task.clone(), ResumeArg::Value(None), generation)?;
        Ok(task)
    }

    /// Runs the loop until [SharedEventLoop::stop] is called. Parks on the earliest timer deadline when idle. If the
    /// ready queue is empty and no timer is pending, nothing can ever become runnable again: that deadlock is
    /// surfaced as the fatal stuck-loop failure rather than silently returned from.
    pub fn run_forever(&mut self) -> Result<(), Fail> {
        self.ensure_open()?;
        trace!("run_forever(): starting");
        loop {
            if self.take_stop_request() {
                return Ok(());
            }
            self.poll();
            if self.take_stop_request() {
                return Ok(());
            }
            self.idle_wait()?;
        }
    }

    /// Drives the loop until `awaitable`'s promise is done; returns its value or re-raises its failure. A coroutine
    /// is first wrapped into a task. Other scheduled work keeps making progress meanwhile, but the loop returns as
    /// soon as the target is done even if ready work remains.
    pub fn run_until_complete<A>(&mut self, awaitable: A) -> Result<Value, Fail>
    where
        A: Into<Awaitable>,
    {
        self.ensure_open()?;
        let promise: SharedPromise = match awaitable.into() {
            Awaitable::Coroutine(coroutine) => self.create_task("main", coroutine)?.promise(),
            Awaitable::Task(task) => task.promise(),
            Awaitable::Promise(promise) => promise,
        };
        loop {
            if promise.is_done() {
                return promise.result();
            }
            self.poll();
            if promise.is_done() {
                return promise.result();
            }
            if self.take_stop_request() {
                return Err(Fail::interrupted("event loop stopped before the awaitable completed"));
            }
            self.idle_wait()?;
        }
    }

    /// Requests the running loop to finish its current iteration and return. Pending work is not cleared; it remains
    /// schedulable if the loop is run again.
    pub fn stop(&mut self) {
        trace!("stop(): requested");
        self.stop_requested = true;
    }

    /// Releases loop-owned resources: both queues and the task registry are cleared, and the ambient current-loop
    /// slot is torn down if it points at this loop. Terminal: every scheduling entry point fails afterwards.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        debug!("close(): shutting event loop down");
        self.closed = true;
        self.ready.clear();
        self.timers.clear();
        self.tasks.clear();
        CURRENT_LOOP.with(|slot| {
            let mut slot = slot.borrow_mut();
            let is_current: bool = match &*slot {
                Some(current) => SharedObject::ptr_eq(&current.0, &self.0),
                None => false,
            };
            if is_current {
                *slot = None;
            }
        });
    }

    /// Runs a single loop iteration without blocking: moves due timers into the ready queue, then drains exactly the
    /// entries that were ready at the start of the drain.
    pub fn poll(&mut self) {
        let now: Instant = self.clock.now();
        for work in self.timers.pop_due(now) {
            self.ready.push(work);
        }
        let budget: usize = self.ready.len();
        for _ in 0..budget {
            match self.ready.pop() {
                Some(entry) => self.run_work(entry),
                None => break,
            }
        }
    }

    /// Enqueues a task resumption at the back of the ready queue.
    pub(crate) fn enqueue_resume(&mut self, mut task: SharedTask, arg: ResumeArg, generation: u64) -> Result<(), Fail> {
        self.ensure_open()?;
        task.set_state(TaskState::Queued);
        self.ready.push(Work::Resume { task, arg, generation });
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), Fail> {
        if self.closed {
            return Err(Fail::loop_closed());
        }
        Ok(())
    }

    fn take_stop_request(&mut self) -> bool {
        if self.stop_requested {
            trace!("take_stop_request(): honoring stop request");
            self.stop_requested = false;
            return true;
        }
        false
    }

    /// Parks until the earliest timer deadline when both queues are empty; surfaces the stuck-loop failure when
    /// nothing is pending at all.
    fn idle_wait(&mut self) -> Result<(), Fail> {
        if !self.ready.is_empty() {
            return Ok(());
        }
        match self.timers.next_deadline() {
            Some(deadline) => {
                let now: Instant = self.clock.now();
                if deadline > now {
                    self.clock.wait_until(deadline);
                }
                Ok(())
            },
            None => {
                let fail: Fail = Fail::stuck();
                error!("idle_wait(): {:?}", fail);
                Err(fail)
            },
        }
    }

    fn run_work(&mut self, entry: ScheduledWork) {
        if entry.handle.is_cancelled() {
            trace!("run_work(): skipping cancelled entry");
            return;
        }
        match entry.work {
            Work::Callback(callback) => {
                if let Err(fail) = callback() {
                    (self.failure_handler)(&fail);
                }
            },
            Work::Resume { task, arg, generation } => self.resume_task(task, arg, generation),
        }
    }

    /// Resumes `task` with `arg`, then registers whatever wake source its next suspension asks for. Wake-ups carrying
    /// a stale generation (the task was cancelled or otherwise moved on since this wake-up was registered) are
    /// dropped.
    fn resume_task(&mut self, mut task: SharedTask, arg: ResumeArg, generation: u64) {
        if task.is_done() || task.generation() != generation {
            trace!("resume_task(): dropping stale wake (name={:?})", task.get_name());
            return;
        }
        match task.advance(arg) {
            Progress::Finished => {
                let task_id: TaskId = task.get_id();
                self.remove_task(task_id);
            },
            Progress::Suspended(parked) => {
                let generation: u64 = task.bump_generation();
                match parked {
                    Parked::Yielded => {
                        task.set_state(TaskState::Queued);
                        self.ready.push(Work::Resume {
                            task,
                            arg: ResumeArg::Value(None),
                            generation,
                        });
                    },
                    Parked::Delay(delay) => {
                        let deadline: Instant = self.clock.now() + delay;
                        self.park_until(task, deadline, generation);
                    },
                    Parked::Until(deadline) => self.park_until(task, deadline, generation),
                    Parked::Wait(mut promise) => {
                        task.set_state(TaskState::Waiting);
                        let waiter: SharedTask = task.clone();
                        let result: Result<(), Fail> = promise.add_done_callback(move |promise: SharedPromise| {
                            let arg: ResumeArg = match promise.result() {
                                Ok(value) => ResumeArg::Value(Some(value)),
                                Err(fail) => ResumeArg::Failure(fail),
                            };
                            let mut event_loop: SharedEventLoop = promise.event_loop();
                            event_loop.resume_task(waiter, arg, generation);
                        });
                        if let Err(fail) = result {
                            warn!("resume_task(): could not register waiter: {:?}", fail);
                            (self.failure_handler)(&fail);
                        }
                    },
                }
            },
        }
    }

    /// Parks `task` until `deadline` via the timer queue.
    fn park_until(&mut self, mut task: SharedTask, deadline: Instant, generation: u64) {
        task.set_state(TaskState::Waiting);
        let _: TimerHandle = self.timers.insert(
            deadline,
            Work::Resume {
                task,
                arg: ResumeArg::Value(None),
                generation,
            },
        );
    }

    fn remove_task(&mut self, task_id: TaskId) {
        if let Some(internal_id) = self.ids.remove(&task_id) {
            if self.tasks.contains(internal_id.0) {
                let task: SharedTask = self.tasks.remove(internal_id.0);
                trace!("remove_task(): name={:?}, id={:?}", task.get_name(), task_id);
            }
        }
    }

    #[cfg(test)]
    pub fn num_tasks(&self) -> usize {
        self.tasks.len()
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for SharedEventLoop {
    fn default() -> Self {
        Self::new(Box::new(MonotonicClock::new()))
    }
}

impl Deref for SharedEventLoop {
    type Target = EventLoop;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for SharedEventLoop {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.0.deref_mut()
    }
}

impl From<u64> for InternalId {
    fn from(value: u64) -> Self {
        Self(value as usize)
    }
}

impl From<InternalId> for u64 {
    fn from(value: InternalId) -> Self {
        value.0 as u64
    }
}

impl From<Box<dyn Coroutine>> for Awaitable {
    fn from(coroutine: Box<dyn Coroutine>) -> Self {
        Self::Coroutine(coroutine)
    }
}

impl From<SharedTask> for Awaitable {
    fn from(task: SharedTask) -> Self {
        Self::Task(task)
    }
}

impl From<SharedPromise> for Awaitable {
    fn from(promise: SharedPromise) -> Self {
        Self::Promise(promise)
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
