// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use ::libc::{
    c_int,
    EBADF,
    EBUSY,
    ECANCELED,
    EDEADLK,
    EINTR,
    EINVAL,
};
use ::std::{
    error,
    fmt,
};

//==============================================================================
// Structures
//==============================================================================

/// Failure
///
/// Failures carry an errno-style error code plus a human-readable cause. The
/// scheduler's taxonomy maps onto a small set of codes:
/// - `EBUSY`: illegal promise transition, or a premature result access;
/// - `ECANCELED`: cooperative cancellation signal;
/// - `EINVAL`: invalid arguments (e.g., a typed value downcast mismatch);
/// - `EBADF`: scheduling on a closed event loop;
/// - `EDEADLK`: the loop has nothing runnable and no timer pending;
/// - `EINTR`: the loop was stopped while driving an awaitable to completion.
#[derive(Clone)]
pub struct Fail {
    /// Error code.
    pub errno: c_int,
    /// Cause.
    pub cause: String,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate Functions for Failures
impl Fail {
    /// Creates a new Failure
    pub fn new(errno: i32, cause: &str) -> Self {
        Self {
            errno,
            cause: cause.to_string(),
        }
    }

    /// Creates a failure for an illegal state transition, such as completing a promise twice.
    pub fn invalid_state(cause: &str) -> Self {
        Self::new(EBUSY, cause)
    }

    /// Creates the cooperative cancellation signal.
    pub fn cancelled(cause: &str) -> Self {
        Self::new(ECANCELED, cause)
    }

    /// Creates a failure for an invalid argument.
    pub fn invalid_argument(cause: &str) -> Self {
        Self::new(EINVAL, cause)
    }

    /// Creates the failure returned by every scheduling entry point of a closed event loop.
    pub fn loop_closed() -> Self {
        Self::new(EBADF, "event loop is closed")
    }

    /// Creates the fatal failure surfaced when the loop has no ready work and no pending timer.
    pub fn stuck() -> Self {
        Self::new(EDEADLK, "event loop stuck")
    }

    /// Creates the failure returned when the loop is stopped before an awaitable completes.
    pub fn interrupted(cause: &str) -> Self {
        Self::new(EINTR, cause)
    }

    /// Checks whether this failure is the cooperative cancellation signal.
    pub fn is_cancelled(&self) -> bool {
        self.errno == ECANCELED
    }

    /// Checks whether this failure denotes an illegal state transition or premature access.
    pub fn is_invalid_state(&self) -> bool {
        self.errno == EBUSY
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

/// Display Trait Implementation for Failures
impl fmt::Display for Fail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error {:?}: {:?}", self.errno, self.cause)
    }
}

/// Debug trait Implementation for Failures
impl fmt::Debug for Fail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error {:?}: {:?}", self.errno, self.cause)
    }
}

/// Error Trait Implementation for Failures
impl error::Error for Fail {}

//==============================================================================
// Unit Tests
//==============================================================================
