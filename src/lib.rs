// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Single-threaded cooperative coroutine scheduler.
//!
//! The crate drives explicit-state-machine coroutines, timed callbacks and
//! single-assignment result containers ([`promise::SharedPromise`]) from one
//! logical thread of control. There is no preemption: a callback or a
//! coroutine slice between two suspension points always runs to completion,
//! and suspension is expressed by yielding a [`coroutine::Suspend`] request
//! to the driving [`event_loop::SharedEventLoop`].

#![cfg_attr(feature = "strict", deny(warnings))]
#![deny(clippy::all)]

#[macro_use]
extern crate log;

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod clock;
pub mod collections;
pub mod coroutine;
pub mod event_loop;
pub mod fail;
pub mod logging;
pub mod promise;
pub mod scheduler;
pub mod timer;

pub use self::{
    clock::{
        Clock,
        LoopWaker,
        MonotonicClock,
        VirtualClock,
    },
    coroutine::{
        Coroutine,
        ResumeArg,
        Sleep,
        Step,
        Suspend,
        Value,
        YieldNow,
    },
    event_loop::{
        current,
        Awaitable,
        SharedEventLoop,
    },
    fail::Fail,
    promise::SharedPromise,
    scheduler::{
        CallbackHandle,
        SharedTask,
        TaskId,
    },
    timer::TimerHandle,
};

//======================================================================================================================
// Imports
//======================================================================================================================

use ::std::{
    convert::{
        AsMut,
        AsRef,
    },
    ops::{
        Deref,
        DerefMut,
    },
    rc::Rc,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// The SharedObject wraps an object that will be shared across coroutines.
pub struct SharedObject<T>(Rc<T>);

//======================================================================================================================
// Macros
//======================================================================================================================

/// Ensures that two expressions are equal, bailing out of the calling test with an [`anyhow`] error otherwise.
#[macro_export]
macro_rules! ensure_eq {
    ($left:expr, $right:expr) => {{
        let left = &$left;
        let right = &$right;
        if *left != *right {
            ::anyhow::bail!(
                "ensure_eq failed: `{}` == `{}` ({:?} != {:?})",
                stringify!($left),
                stringify!($right),
                left,
                right
            );
        }
    }};
}

/// Ensures that two expressions are not equal, bailing out of the calling test with an [`anyhow`] error otherwise.
#[macro_export]
macro_rules! ensure_neq {
    ($left:expr, $right:expr) => {{
        let left = &$left;
        let right = &$right;
        if *left == *right {
            ::anyhow::bail!(
                "ensure_neq failed: `{}` != `{}` ({:?} == {:?})",
                stringify!($left),
                stringify!($right),
                left,
                right
            );
        }
    }};
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl<T> SharedObject<T> {
    pub fn new(object: T) -> Self {
        Self(Rc::new(object))
    }

    /// Checks whether two handles point at the same underlying object.
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        Rc::ptr_eq(&this.0, &other.0)
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

/// Dereferences a shared object for use.
impl<T> Deref for SharedObject<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.0.deref()
    }
}

/// Dereferences a mutable reference to a shared object for use. This breaks Rust's ownership model because it allows
/// more than one mutable dereference of a shared object at a time. The scheduler requires this because the event loop,
/// its tasks and its promises hold handles to each other and re-enter one another while running; however, only one
/// logical thread of control ever runs at a time and a running slice is never preempted. Due to this design, Rust's
/// static borrow checker cannot prove memory safety and we have chosen not to pay for the dynamic borrow checker.
/// Shared objects should be used judiciously with the understanding that the object may be mutated whenever control is
/// handed back to the loop.
impl<T> DerefMut for SharedObject<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        let ptr: *mut T = Rc::as_ptr(&self.0) as *mut T;
        unsafe { &mut *ptr }
    }
}

/// Returns a reference to the interior object, which is borrowed for directly accessing the value. Generally deref
/// should be used unless you absolutely need to borrow the reference.
impl<T> AsRef<T> for SharedObject<T> {
    fn as_ref(&self) -> &T {
        self.0.as_ref()
    }
}

/// Returns a mutable reference to the interior object. Similar to DerefMut, this is only sound because exactly one
/// coroutine or callback runs at a time.
impl<T> AsMut<T> for SharedObject<T> {
    fn as_mut(&mut self) -> &mut T {
        let ptr: *mut T = Rc::as_ptr(&self.0) as *mut T;
        unsafe { &mut *ptr }
    }
}

impl<T> Clone for SharedObject<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}
