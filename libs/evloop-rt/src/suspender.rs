// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! [`ThreadSuspender`]: the pause-loop-from-another-thread rendezvous (spec
//! §4.2's `ThreadSuspenderContext`).
//!
//! `suspend` schedules a handle on the loop that parks until released,
//! blocking the calling thread until that handle has actually started
//! running (so the loop thread is guaranteed to be idle, not mid-tick) —
//! then returns a guard. Dropping the guard (or calling `release`
//! explicitly) lets the parked handle return, resuming the loop.

use std::sync::{Arc, Condvar, Mutex};

use crate::event_loop::EventThread;

struct Gate {
    entered: Mutex<bool>,
    entered_cvar: Condvar,
    exit: Mutex<bool>,
    exit_cvar: Condvar,
}

impl Gate {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            entered: Mutex::new(false),
            entered_cvar: Condvar::new(),
            exit: Mutex::new(false),
            exit_cvar: Condvar::new(),
        })
    }

    fn signal_entered(&self) {
        let mut entered = self.entered.lock().unwrap();
        *entered = true;
        self.entered_cvar.notify_all();
    }

    fn wait_entered(&self) {
        let mut entered = self.entered.lock().unwrap();
        while !*entered {
            entered = self.entered_cvar.wait(entered).unwrap();
        }
    }

    fn wait_exit(&self) {
        let mut exit = self.exit.lock().unwrap();
        while !*exit {
            exit = self.exit_cvar.wait(exit).unwrap();
        }
    }

    fn signal_exit(&self) {
        let mut exit = self.exit.lock().unwrap();
        *exit = true;
        self.exit_cvar.notify_all();
    }
}

/// A guard held by a non-loop thread that keeps the loop thread parked
/// inside a single `call_soon` handle until the guard is dropped.
#[must_use]
pub struct ThreadSuspender {
    event_loop: Arc<EventThread>,
    gate: Arc<Gate>,
    released: bool,
}

impl ThreadSuspender {
    /// Schedules the give-control callback and blocks the calling thread
    /// until the loop thread has entered it. Calling this from the loop's
    /// own thread would deadlock (the handle can never run while the
    /// calling thread — itself the loop thread — is blocked waiting for
    /// it), matching the source's "outside-thread" framing.
    pub fn suspend(event_loop: &Arc<EventThread>) -> Self {
        let gate = Gate::new();
        let handle_gate = gate.clone();
        event_loop.call_soon_thread_safe(Box::new(move || {
            handle_gate.signal_entered();
            handle_gate.wait_exit();
            Ok(())
        }));
        gate.wait_entered();
        Self {
            event_loop: event_loop.clone(),
            gate,
            released: false,
        }
    }

    /// The loop this suspender is pausing, for callers that want to touch
    /// its thread-safe API while it's parked.
    #[must_use]
    pub fn event_loop(&self) -> &Arc<EventThread> {
        &self.event_loop
    }

    /// Releases the loop thread. Idempotent; also run on drop.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            self.gate.signal_exit();
        }
    }
}

impl Drop for ThreadSuspender {
    fn drop(&mut self) {
        self.release_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn suspend_blocks_other_ready_work_until_released() {
        let loop_ = EventThread::new().unwrap();
        loop_.ensure_started();

        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();

        let suspender = ThreadSuspender::suspend(&loop_);
        loop_.call_soon_thread_safe(Box::new(move || {
            ran2.store(true, Ordering::SeqCst);
            Ok(())
        }));
        std::thread::sleep(Duration::from_millis(50));
        assert!(!ran.load(Ordering::SeqCst), "loop kept running work while suspended");

        suspender.release();
        std::thread::sleep(Duration::from_millis(50));
        assert!(ran.load(Ordering::SeqCst));

        loop_.stop();
        loop_.join();
    }
}
