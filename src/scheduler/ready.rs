// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    coroutine::ResumeArg,
    fail::Fail,
    scheduler::task::SharedTask,
    SharedObject,
};
use ::std::collections::VecDeque;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Plain scheduled callback. Failures returned here are forwarded to the loop's failure handler; they never crash the
/// loop, since a malformed callback must not halt unrelated scheduled work.
pub type Callback = Box<dyn FnOnce() -> Result<(), Fail>>;

/// A scheduled unit of work.
pub enum Work {
    /// Invoke a plain callback.
    Callback(Callback),
    /// Resume `task` with `arg`. Dropped on execution if the task has finished or moved on to a newer wake
    /// registration (`generation` mismatch).
    Resume {
        task: SharedTask,
        arg: ResumeArg,
        generation: u64,
    },
}

/// Cancellation handle for a scheduled callback. Cancelled entries stay queued but are skipped when they surface.
#[derive(Clone)]
pub struct CallbackHandle {
    cancelled: SharedObject<bool>,
}

pub(crate) struct ScheduledWork {
    pub work: Work,
    pub handle: CallbackHandle,
}

/// Strict FIFO of runnable work: entries execute in the order they became ready, never reordered, never skipped
/// (except when explicitly cancelled).
pub struct ReadyQueue {
    queue: VecDeque<ScheduledWork>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl CallbackHandle {
    pub(crate) fn new() -> Self {
        Self {
            cancelled: SharedObject::new(false),
        }
    }

    /// Requests that this entry be skipped when it surfaces at the front of the queue.
    pub fn cancel(&mut self) {
        *self.cancelled = true;
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancelled
    }
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self { queue: VecDeque::new() }
    }

    /// Enqueues `work` at the back of the queue and returns its cancellation handle.
    pub fn push(&mut self, work: Work) -> CallbackHandle {
        let handle: CallbackHandle = CallbackHandle::new();
        self.queue.push_back(ScheduledWork {
            work,
            handle: handle.clone(),
        });
        handle
    }

    pub(crate) fn pop(&mut self) -> Option<ScheduledWork> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for ReadyQueue {
    fn default() -> Self {
        Self::new()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
