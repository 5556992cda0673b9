// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    coroutine::{
        Coroutine,
        ResumeArg,
        Step,
        Suspend,
        Value,
    },
    fail::Fail,
    promise::SharedPromise,
    SharedObject,
};
use ::std::{
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
// Structures
//======================================================================================================================

/// Externally visible task identifier.
#[derive(Clone, Copy, Hash, PartialEq, Eq, Debug)]
pub struct TaskId(pub u64);

/// Where a task currently is in its runnable/suspended cycle. A task is either enqueued on the ready queue or
/// suspended awaiting exactly one wake source, never both at once.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum TaskState {
    /// Enqueued (or about to be) on the ready queue.
    Queued,
    /// Suspended awaiting a timer deadline or a promise completion.
    Waiting,
    /// Coroutine finished; the owned promise is done. Terminal.
    Done,
}

/// Suspension request handed to the event loop after a resumption slice. Delegation never escapes the task: nested
/// coroutines are driven on the task's own stack, so the loop only ever sees these four parked states.
pub(crate) enum Parked {
    Yielded,
    Delay(Duration),
    Until(Instant),
    Wait(SharedPromise),
}

/// Outcome of one resumption slice.
pub(crate) enum Progress {
    /// The task suspended with this request; the loop must register the matching wake source.
    Suspended(Parked),
    /// The coroutine finished and the owned promise has been completed.
    Finished,
}

/// Task runs a coroutine (and anything it delegates to) to completion and publishes the outcome through its owned
/// promise.
pub struct Task {
    /// Task name, for tracing.
    name: String,
    /// Task identifier.
    task_id: Option<TaskId>,
    /// Delegation stack; the innermost in-progress coroutine is on top.
    stack: Vec<Box<dyn Coroutine>>,
    /// The task's own completion promise.
    promise: SharedPromise,
    state: TaskState,
    /// Identifies the current wake registration; wake-ups carrying an older generation are stale and dropped.
    generation: u64,
    /// Cancellation was requested but not yet injected.
    cancel_requested: bool,
    /// Cancellation was injected; the task finishes as cancelled even if the coroutine swallows the failure.
    cancel_injected: bool,
}

#[derive(Clone)]
pub struct SharedTask(SharedObject<Task>);

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl SharedTask {
    pub(crate) fn new(name: String, coroutine: Box<dyn Coroutine>, promise: SharedPromise) -> Self {
        Self(SharedObject::new(Task {
            name,
            task_id: None,
            stack: vec![coroutine],
            promise,
            state: TaskState::Queued,
            generation: 0,
            cancel_requested: false,
            cancel_injected: false,
        }))
    }

    pub fn get_name(&self) -> String {
        self.name.clone()
    }

    pub fn get_id(&self) -> TaskId {
        self.task_id.expect("should have this set immediately")
    }

    pub(crate) fn set_id(&mut self, id: TaskId) {
        self.task_id = Some(id);
    }

    /// The task's own completion promise. Await or inspect this to observe the task's result or failure.
    pub fn promise(&self) -> SharedPromise {
        self.promise.clone()
    }

    pub fn is_done(&self) -> bool {
        self.state == TaskState::Done
    }

    /// Requests cooperative cancellation. Returns false if the task already finished. The cancellation failure is
    /// injected at the task's next resumption point: code between two suspension points always runs to completion
    /// even when cancelled. A waiting task does not wait out its timer or promise; its pending wake registration is
    /// invalidated and an immediate resumption is scheduled instead.
    pub fn cancel(&mut self) -> bool {
        match self.state {
            TaskState::Done => false,
            TaskState::Queued => {
                trace!("cancel(): name={:?}, already queued", self.name);
                self.cancel_requested = true;
                true
            },
            TaskState::Waiting => {
                trace!("cancel(): name={:?}, waking for cancellation", self.name);
                self.cancel_requested = true;
                self.generation += 1;
                let task: SharedTask = self.clone();
                let generation: u64 = self.generation;
                let mut event_loop = self.promise.event_loop();
                if let Err(fail) = event_loop.enqueue_resume(task, ResumeArg::Value(None), generation) {
                    warn!("cancel(): could not schedule resumption: {:?}", fail);
                }
                true
            },
        }
    }

    pub(crate) fn set_state(&mut self, state: TaskState) {
        self.state = state;
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// Invalidates every outstanding wake registration and starts a fresh one.
    pub(crate) fn bump_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    /// Runs one resumption slice: drives the top of the delegation stack until the task suspends or finishes,
    /// resolving delegation and unwinding failures on the task's own stack.
    pub(crate) fn advance(&mut self, arg: ResumeArg) -> Progress {
        let mut arg: ResumeArg = if self.cancel_requested {
            self.cancel_requested = false;
            self.cancel_injected = true;
            ResumeArg::Failure(Fail::cancelled("task cancelled"))
        } else {
            arg
        };

        loop {
            let step: Result<Step, Fail> = match self.stack.last_mut() {
                Some(coroutine) => coroutine.resume(arg),
                None => {
                    warn!("advance(): name={:?}, resumed with an empty stack", self.name);
                    return Progress::Finished;
                },
            };
            match step {
                Ok(Step::Yield(Suspend::Nested(coroutine))) => {
                    trace!("advance(): name={:?}, delegating to {:?}", self.name, coroutine.name());
                    self.stack.push(coroutine);
                    arg = ResumeArg::Value(None);
                },
                Ok(Step::Yield(Suspend::Yielded)) => return Progress::Suspended(Parked::Yielded),
                Ok(Step::Yield(Suspend::Delay(delay))) => return Progress::Suspended(Parked::Delay(delay)),
                Ok(Step::Yield(Suspend::Until(deadline))) => return Progress::Suspended(Parked::Until(deadline)),
                Ok(Step::Yield(Suspend::Wait(promise))) => return Progress::Suspended(Parked::Wait(promise)),
                Ok(Step::Complete(value)) => {
                    self.stack.pop();
                    if self.stack.is_empty() {
                        self.finish(Ok(value));
                        return Progress::Finished;
                    }
                    arg = ResumeArg::Value(Some(value));
                },
                Err(fail) => {
                    self.stack.pop();
                    if self.stack.is_empty() {
                        self.finish(Err(fail));
                        return Progress::Finished;
                    }
                    arg = ResumeArg::Failure(fail);
                },
            }
        }
    }

    /// Terminal transition: completes the owned promise. A task that had cancellation injected finishes as cancelled
    /// even if its coroutine swallowed the failure and returned a value.
    fn finish(&mut self, outcome: Result<Value, Fail>) {
        self.state = TaskState::Done;
        let outcome: Result<Value, Fail> = match outcome {
            Ok(_) if self.cancel_injected => Err(Fail::cancelled("task cancelled")),
            other => other,
        };
        let mut promise: SharedPromise = self.promise.clone();
        let result: Result<(), Fail> = match outcome {
            Ok(value) => promise.set_result(value),
            Err(fail) => {
                // Captured, not propagated: visible only to whoever inspects or awaits the promise.
                debug!("finish(): name={:?}, task failed: {:?}", self.name, fail);
                promise.set_exception(fail)
            },
        };
        if let Err(fail) = result {
            debug!("finish(): name={:?}, promise already settled: {:?}", self.name, fail);
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl From<u64> for TaskId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<TaskId> for u64 {
    fn from(value: TaskId) -> Self {
        value.0
    }
}

impl Deref for SharedTask {
    type Target = Task;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for SharedTask {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.0.deref_mut()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        Progress,
        SharedTask,
    };
    use crate::{
        clock::VirtualClock,
        coroutine::{
            Coroutine,
            ResumeArg,
            Step,
            Suspend,
            Value,
        },
        event_loop::SharedEventLoop,
        fail::Fail,
    };
    use ::anyhow::Result;

    fn test_task(coroutine: Box<dyn Coroutine>) -> SharedTask {
        let mut event_loop: SharedEventLoop = SharedEventLoop::new(Box::new(VirtualClock::new()));
        let promise = event_loop.create_promise();
        SharedTask::new(String::from("testing"), coroutine, promise)
    }

    /// Completes immediately with a fixed number.
    struct Inner {
        value: u64,
    }

    impl Coroutine for Inner {
        fn resume(&mut self, arg: ResumeArg) -> Result<Step, Fail> {
            if let ResumeArg::Failure(fail) = arg {
                return Err(fail);
            }
            Ok(Step::Complete(Value::new(self.value)))
        }
    }

    /// Delegates to [Inner] and doubles whatever it produces.
    struct Outer {
        started: bool,
    }

    impl Coroutine for Outer {
        fn resume(&mut self, arg: ResumeArg) -> Result<Step, Fail> {
            match arg {
                ResumeArg::Failure(fail) => Err(fail),
                ResumeArg::Value(None) if !self.started => {
                    self.started = true;
                    Ok(Step::Yield(Suspend::Nested(Box::new(Inner { value: 21 }))))
                },
                ResumeArg::Value(Some(value)) => {
                    let inner: u64 = *value.downcast::<u64>()?;
                    Ok(Step::Complete(Value::new(inner * 2)))
                },
                ResumeArg::Value(None) => Err(Fail::invalid_argument("expected a delegated result")),
            }
        }
    }

    /// Fails on first resumption.
    struct Broken;

    impl Coroutine for Broken {
        fn resume(&mut self, _arg: ResumeArg) -> Result<Step, Fail> {
            Err(Fail::invalid_argument("boom"))
        }
    }

    /// Delegates to [Broken] and converts the failure unwound from the inner frame into a value.
    struct Recovering {
        started: bool,
    }

    impl Coroutine for Recovering {
        fn resume(&mut self, arg: ResumeArg) -> Result<Step, Fail> {
            match arg {
                ResumeArg::Failure(fail) => Ok(Step::Complete(Value::new(fail.errno))),
                _ if !self.started => {
                    self.started = true;
                    Ok(Step::Yield(Suspend::Nested(Box::new(Broken))))
                },
                _ => Err(Fail::invalid_argument("expected an unwound failure")),
            }
        }
    }

    /// Swallows an injected cancellation and returns a value anyway.
    struct SwallowCancel;

    impl Coroutine for SwallowCancel {
        fn resume(&mut self, arg: ResumeArg) -> Result<Step, Fail> {
            match arg {
                ResumeArg::Failure(_) => Ok(Step::Complete(Value::new("survived"))),
                _ => Ok(Step::Yield(Suspend::Yielded)),
            }
        }
    }

    #[test]
    fn delegation_is_driven_on_the_task_stack() -> Result<()> {
        let mut task: SharedTask = test_task(Box::new(Outer { started: false }));
        match task.advance(ResumeArg::Value(None)) {
            Progress::Finished => (),
            _ => anyhow::bail!("delegation chain should run to completion in one slice"),
        }
        crate::ensure_eq!(task.is_done(), true);
        crate::ensure_eq!(*task.promise().result()?.downcast::<u64>()?, 42u64);
        Ok(())
    }

    #[test]
    fn failures_unwind_through_delegation_into_the_promise() -> Result<()> {
        let mut task: SharedTask = test_task(Box::new(Broken));
        match task.advance(ResumeArg::Value(None)) {
            Progress::Finished => (),
            _ => anyhow::bail!("failing coroutine should finish the task"),
        }
        let fail: Fail = task.promise().result().unwrap_err();
        crate::ensure_eq!(fail.errno, libc::EINVAL);
        Ok(())
    }

    #[test]
    fn delegated_failure_unwinds_to_the_outer_frame() -> Result<()> {
        let mut task: SharedTask = test_task(Box::new(Recovering { started: false }));
        match task.advance(ResumeArg::Value(None)) {
            Progress::Finished => (),
            _ => anyhow::bail!("the outer frame should handle the failure and complete"),
        }
        // The outer frame saw the inner frame's failure and completed normally with its errno.
        crate::ensure_eq!(*task.promise().result()?.downcast::<i32>()?, libc::EINVAL);
        Ok(())
    }

    #[test]
    fn swallowed_cancellation_still_finishes_as_cancelled() -> Result<()> {
        let mut task: SharedTask = test_task(Box::new(SwallowCancel));
        crate::ensure_eq!(task.cancel(), true);
        match task.advance(ResumeArg::Value(None)) {
            Progress::Finished => (),
            _ => anyhow::bail!("cancelled task should finish at its next resumption"),
        }
        crate::ensure_eq!(task.promise().result().unwrap_err().is_cancelled(), true);

        // Cancelling a finished task is a no-op.
        crate::ensure_eq!(task.cancel(), false);
        Ok(())
    }
}
