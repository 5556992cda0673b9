// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    coroutine::Value,
    event_loop::SharedEventLoop,
    fail::Fail,
    SharedObject,
};
use ::std::{
    fmt,
    mem,
    ops::{
        Deref,
        DerefMut,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Completion callback, invoked with the completed promise.
pub type DoneCallback = Box<dyn FnOnce(SharedPromise)>;

enum PromiseState {
    Pending,
    Done(Result<Value, Fail>),
}

/// Single-assignment result container.
///
/// A promise is created pending and transitions to done exactly once, via
/// `set_result` or `set_exception`. Completion callbacks are never invoked
/// synchronously from inside the setter: they are scheduled through the
/// owning loop's ready queue, in registration order, so running code can
/// never observe a promise complete in the middle of its own slice.
pub struct Promise {
    /// The loop through which completion callbacks are scheduled.
    event_loop: SharedEventLoop,
    state: PromiseState,
    /// Callbacks registered while pending, in registration order.
    callbacks: Vec<DoneCallback>,
}

#[derive(Clone)]
pub struct SharedPromise(SharedObject<Promise>);

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl SharedPromise {
    pub(crate) fn new(event_loop: SharedEventLoop) -> Self {
        Self(SharedObject::new(Promise {
            event_loop,
            state: PromiseState::Pending,
            callbacks: Vec::new(),
        }))
    }

    pub fn is_done(&self) -> bool {
        !matches!(self.state, PromiseState::Pending)
    }

    /// Completes the promise with a value. Fails with the invalid-state failure if the promise is already done.
    pub fn set_result(&mut self, value: Value) -> Result<(), Fail> {
        self.complete(Ok(value))
    }

    /// Completes the promise with a failure. Fails with the invalid-state failure if the promise is already done.
    pub fn set_exception(&mut self, fail: Fail) -> Result<(), Fail> {
        self.complete(Err(fail))
    }

    /// Registers a completion callback. Scheduled immediately if the promise is already done; otherwise appended to
    /// the pending list and scheduled on completion, in registration order.
    pub fn add_done_callback<F>(&mut self, callback: F) -> Result<(), Fail>
    where
        F: FnOnce(SharedPromise) + 'static,
    {
        if self.is_done() {
            self.schedule(Box::new(callback))
        } else {
            self.callbacks.push(Box::new(callback));
            Ok(())
        }
    }

    /// Returns the stored value, re-raises the stored failure, or fails with the invalid-state failure while pending.
    pub fn result(&self) -> Result<Value, Fail> {
        match &self.state {
            PromiseState::Pending => Err(Fail::invalid_state("promise is still pending")),
            PromiseState::Done(Ok(value)) => Ok(value.clone()),
            PromiseState::Done(Err(fail)) => Err(fail.clone()),
        }
    }

    /// Completes a pending promise with the cancellation failure. Returns false if the promise was already done, in
    /// which case cancellation came too late and nothing changes.
    pub fn cancel(&mut self) -> bool {
        if self.is_done() {
            return false;
        }
        if let Err(fail) = self.complete(Err(Fail::cancelled("promise cancelled"))) {
            warn!("cancel(): could not schedule completion callbacks: {:?}", fail);
        }
        true
    }

    pub(crate) fn event_loop(&self) -> SharedEventLoop {
        self.event_loop.clone()
    }

    /// Transitions to done and schedules every registered callback. The state transition always happens; the error
    /// path reports an already-done promise or a closed loop that refused the callback scheduling.
    fn complete(&mut self, outcome: Result<Value, Fail>) -> Result<(), Fail> {
        if self.is_done() {
            return Err(Fail::invalid_state("promise is already done"));
        }
        self.state = PromiseState::Done(outcome);
        let callbacks: Vec<DoneCallback> = mem::take(&mut self.callbacks);
        for callback in callbacks {
            self.schedule(callback)?;
        }
        Ok(())
    }

    /// Schedules one completion callback through the owning loop.
    fn schedule(&self, callback: DoneCallback) -> Result<(), Fail> {
        let promise: SharedPromise = self.clone();
        let mut event_loop: SharedEventLoop = self.event_loop.clone();
        event_loop
            .call_soon(move || {
                callback(promise);
                Ok(())
            })
            .map(|_| ())
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Deref for SharedPromise {
    type Target = Promise;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for SharedPromise {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.0.deref_mut()
    }
}

impl fmt::Debug for SharedPromise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            PromiseState::Pending => write!(f, "Promise(pending)"),
            PromiseState::Done(Ok(_)) => write!(f, "Promise(done)"),
            PromiseState::Done(Err(fail)) => write!(f, "Promise(failed: {:?})", fail),
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::SharedPromise;
    use crate::{
        clock::VirtualClock,
        coroutine::Value,
        event_loop::SharedEventLoop,
        fail::Fail,
    };
    use ::anyhow::Result;
    use ::std::{
        cell::RefCell,
        rc::Rc,
    };

    fn test_loop() -> SharedEventLoop {
        SharedEventLoop::new(Box::new(VirtualClock::new()))
    }

    #[test]
    fn promise_completes_at_most_once() -> Result<()> {
        let mut event_loop: SharedEventLoop = test_loop();
        let mut promise: SharedPromise = event_loop.create_promise();
        crate::ensure_eq!(promise.is_done(), false);

        promise.set_result(Value::new(1u32))?;
        crate::ensure_eq!(promise.is_done(), true);
        crate::ensure_eq!(promise.set_result(Value::new(2u32)).unwrap_err().is_invalid_state(), true);
        crate::ensure_eq!(
            promise.set_exception(Fail::invalid_argument("nope")).unwrap_err().is_invalid_state(),
            true
        );
        crate::ensure_eq!(*promise.result()?.downcast::<u32>()?, 1u32);
        Ok(())
    }

    #[test]
    fn result_before_completion_is_an_invalid_state() -> Result<()> {
        let mut event_loop: SharedEventLoop = test_loop();
        let promise: SharedPromise = event_loop.create_promise();
        crate::ensure_eq!(promise.result().unwrap_err().is_invalid_state(), true);
        Ok(())
    }

    #[test]
    fn callbacks_run_in_registration_order_through_the_loop() -> Result<()> {
        let mut event_loop: SharedEventLoop = test_loop();
        let mut promise: SharedPromise = event_loop.create_promise();
        let order: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));

        let first: Rc<RefCell<Vec<&'static str>>> = order.clone();
        promise.add_done_callback(move |_| first.borrow_mut().push("first"))?;
        let second: Rc<RefCell<Vec<&'static str>>> = order.clone();
        promise.add_done_callback(move |_| second.borrow_mut().push("second"))?;

        promise.set_result(Value::unit())?;
        // Callbacks are scheduled, never invoked synchronously by the setter.
        crate::ensure_eq!(order.borrow().len(), 0);

        event_loop.poll();
        crate::ensure_eq!(*order.borrow(), vec!["first", "second"]);
        Ok(())
    }

    #[test]
    fn late_callback_registration_still_fires() -> Result<()> {
        let mut event_loop: SharedEventLoop = test_loop();
        let mut promise: SharedPromise = event_loop.create_promise();
        promise.set_result(Value::unit())?;

        let fired: Rc<RefCell<bool>> = Rc::new(RefCell::new(false));
        let flag: Rc<RefCell<bool>> = fired.clone();
        promise.add_done_callback(move |p| *flag.borrow_mut() = p.is_done())?;

        event_loop.poll();
        crate::ensure_eq!(*fired.borrow(), true);
        Ok(())
    }

    #[test]
    fn cancel_is_first_come_first_served() -> Result<()> {
        let mut event_loop: SharedEventLoop = test_loop();
        let mut promise: SharedPromise = event_loop.create_promise();
        crate::ensure_eq!(promise.cancel(), true);
        crate::ensure_eq!(promise.result().unwrap_err().is_cancelled(), true);
        crate::ensure_eq!(promise.cancel(), false);

        let mut completed: SharedPromise = event_loop.create_promise();
        completed.set_result(Value::unit())?;
        crate::ensure_eq!(completed.cancel(), false);
        Ok(())
    }
}
