// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    fail::Fail,
    promise::SharedPromise,
};
use ::std::{
    any::Any,
    fmt,
    rc::Rc,
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Dynamically-typed, cheaply clonable result cell.
///
/// One completion value may be fanned out to several waiters, so values are
/// reference-counted rather than moved. Consumers retrieve the payload with a
/// typed [`Value::downcast`].
#[derive(Clone)]
pub struct Value(Rc<dyn Any>);

/// What a resumed coroutine receives: the value it was waiting for (possibly none, e.g. after a timer expiry), or an
/// injected failure (a cancellation, or the failure of an awaited promise or delegated coroutine).
#[derive(Clone, Debug)]
pub enum ResumeArg {
    Value(Option<Value>),
    Failure(Fail),
}

/// Closed set of suspension requests a coroutine may yield to its driver.
pub enum Suspend {
    /// Yield control voluntarily; resume at the back of the ready queue.
    Yielded,
    /// Resume with no value once the delay has elapsed.
    Delay(Duration),
    /// Resume with no value at the absolute deadline.
    Until(Instant),
    /// Resume with the promise's result or failure once it completes.
    Wait(SharedPromise),
    /// Drive the nested coroutine to completion, then resume with its result or failure.
    Nested(Box<dyn Coroutine>),
}

/// Outcome of advancing a coroutine by one slice.
pub enum Step {
    /// The coroutine suspended with this request.
    Yield(Suspend),
    /// The coroutine returned this value. Terminal: it must not be resumed again.
    Complete(Value),
}

//======================================================================================================================
// Traits
//======================================================================================================================

/// A suspendable unit of execution, written as an explicit state machine.
///
/// The driver resumes the coroutine with a [`ResumeArg`] and interprets the
/// returned [`Step`]. Returning `Err` is the uncaught-failure path: it
/// propagates to the delegating coroutine, or completes the owning task's
/// promise with the failure at the bottom of the delegation stack. A
/// coroutine handed a [`ResumeArg::Failure`] decides whether to handle it or
/// to re-raise it by returning `Err`.
pub trait Coroutine {
    /// Advances the coroutine by one slice.
    fn resume(&mut self, arg: ResumeArg) -> Result<Step, Fail>;

    /// Human-readable name, for tracing.
    fn name(&self) -> &str {
        "coroutine"
    }
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Value {
    pub fn new<T: Any>(value: T) -> Self {
        Self(Rc::new(value))
    }

    /// The unit value, used where the protocol requires a value but the coroutine has nothing to say.
    pub fn unit() -> Self {
        Self::new(())
    }

    /// Typed access to the payload.
    pub fn downcast<T: Any>(&self) -> Result<Rc<T>, Fail> {
        self.0
            .clone()
            .downcast::<T>()
            .map_err(|_| Fail::invalid_argument("value has an unexpected type"))
    }

    /// Checks whether the payload has type `T`.
    pub fn is<T: Any>(&self) -> bool {
        self.0.is::<T>()
    }
}

//======================================================================================================================
// Canned Coroutines
//======================================================================================================================

/// Sleeps for a fixed duration, then completes with the unit value.
pub struct Sleep {
    delay: Duration,
    started: bool,
}

/// Yields control exactly once, then completes with the unit value.
pub struct YieldNow {
    yielded: bool,
}

impl Sleep {
    pub fn new(delay: Duration) -> Self {
        Self { delay, started: false }
    }
}

impl YieldNow {
    pub fn new() -> Self {
        Self { yielded: false }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Value(..)")
    }
}

impl Coroutine for Sleep {
    fn resume(&mut self, arg: ResumeArg) -> Result<Step, Fail> {
        if let ResumeArg::Failure(fail) = arg {
            return Err(fail);
        }
        if !self.started {
            self.started = true;
            Ok(Step::Yield(Suspend::Delay(self.delay)))
        } else {
            Ok(Step::Complete(Value::unit()))
        }
    }

    fn name(&self) -> &str {
        "sleep"
    }
}

impl Coroutine for YieldNow {
    fn resume(&mut self, arg: ResumeArg) -> Result<Step, Fail> {
        if let ResumeArg::Failure(fail) = arg {
            return Err(fail);
        }
        if !self.yielded {
            self.yielded = true;
            Ok(Step::Yield(Suspend::Yielded))
        } else {
            Ok(Step::Complete(Value::unit()))
        }
    }

    fn name(&self) -> &str {
        "yield_now"
    }
}

impl Default for YieldNow {
    fn default() -> Self {
        Self::new()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
