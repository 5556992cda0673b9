// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::crossbeam_channel::{
    unbounded,
    Receiver,
    RecvTimeoutError,
    Sender,
};
use ::std::time::{
    Duration,
    Instant,
};

//======================================================================================================================
// Traits
//======================================================================================================================

/// Monotonic time source consumed by the event loop.
///
/// The loop reads `now()` at the start of every iteration and calls
/// `wait_until()` when both of its queues are empty but a timer is pending.
/// The concrete wait mechanism is opaque to the loop: a real clock blocks the
/// thread until the deadline or an external wake signal, a virtual clock
/// simply jumps time forward.
pub trait Clock {
    /// Returns the current instant.
    fn now(&self) -> Instant;

    /// Blocks (or jumps) until `deadline` is reached or an external wake signal arrives.
    fn wait_until(&mut self, deadline: Instant);

    /// Returns a handle that interrupts `wait_until()` from outside the loop's thread.
    fn waker(&self) -> LoopWaker;

    /// Moves time forward deterministically. Only meaningful for virtual clocks; real clocks ignore it.
    fn advance(&mut self, _now: Instant) {}
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// Handle for waking an event loop that is parked in its idle wait. This is the only scheduler object that may cross
/// thread boundaries.
#[derive(Clone)]
pub struct LoopWaker {
    signal: Option<Sender<()>>,
}

/// Real time: `Instant::now()` plus a channel-backed idle wait.
pub struct MonotonicClock {
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
}

/// Deterministic test time. `wait_until()` jumps straight to the deadline, so loops over a virtual clock never block.
pub struct VirtualClock {
    now: Instant,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl LoopWaker {
    /// Wakes the loop if it is parked in its idle wait. A no-op for loops driven by a virtual clock.
    pub fn wake(&self) {
        if let Some(signal) = &self.signal {
            let _ = signal.try_send(());
        }
    }
}

impl MonotonicClock {
    pub fn new() -> Self {
        let (wake_tx, wake_rx): (Sender<()>, Receiver<()>) = unbounded();
        Self { wake_tx, wake_rx }
    }
}

impl VirtualClock {
    pub fn new() -> Self {
        Self { now: Instant::now() }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Clock for MonotonicClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wait_until(&mut self, deadline: Instant) {
        let timeout: Duration = deadline.saturating_duration_since(Instant::now());
        match self.wake_rx.recv_timeout(timeout) {
            Ok(()) => trace!("wait_until(): woken by external signal"),
            Err(RecvTimeoutError::Timeout) => (),
            // We hold a sender ourselves, so the channel can never disconnect.
            Err(RecvTimeoutError::Disconnected) => (),
        }
    }

    fn waker(&self) -> LoopWaker {
        LoopWaker {
            signal: Some(self.wake_tx.clone()),
        }
    }
}

impl Clock for VirtualClock {
    fn now(&self) -> Instant {
        self.now
    }

    fn wait_until(&mut self, deadline: Instant) {
        if deadline > self.now {
            self.now = deadline;
        }
    }

    fn waker(&self) -> LoopWaker {
        LoopWaker { signal: None }
    }

    fn advance(&mut self, now: Instant) {
        assert!(self.now <= now);
        self.now = now;
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
