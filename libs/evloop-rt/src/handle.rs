// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Scheduled-callback records: [`Handle`], [`TimerHandle`], and the
//! weakly-referencing [`WeakTimerHandle`].
//!
//! A `Handle` runs at most once. Cancelling one only flips a flag and drops
//! the stored callback; it is never removed from whatever container (ready
//! deque or timer heap) it was scheduled into. That container is
//! responsible for skipping cancelled entries when it gets around to them.

use std::cmp::Ordering;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, Weak};

use crate::error::EvLoopError;

/// Callbacks may fail; a failure is routed to the loop's exception reporter
/// rather than aborting the tick, exactly like an exception raised inside a
/// scheduled callback in the source.
pub type Callback = Box<dyn FnOnce() -> Result<(), EvLoopError> + Send + 'static>;

/// Receives errors raised by handles, future callbacks, and other
/// loop-scheduled work that has nowhere else to report to.
pub trait ExceptionReporter: Send + Sync {
    fn report(&self, context: &str, error: &dyn fmt::Display);
}

/// Default reporter: logs via `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingExceptionReporter;

impl ExceptionReporter for TracingExceptionReporter {
    fn report(&self, context: &str, error: &dyn fmt::Display) {
        tracing::error!(context, %error, "unhandled exception in scheduled callback");
    }
}

struct Inner {
    cancelled: AtomicBool,
    callback: Mutex<Option<Callback>>,
}

impl fmt::Debug for Inner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inner")
            .field("cancelled", &self.cancelled.load(AtomicOrdering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// A scheduled callback. Cheaply cloneable; clones share cancellation state.
#[derive(Clone, Debug)]
pub struct Handle(Arc<Inner>);

impl Handle {
    #[must_use]
    pub fn new(callback: Callback) -> Self {
        Self(Arc::new(Inner {
            cancelled: AtomicBool::new(false),
            callback: Mutex::new(Some(callback)),
        }))
    }

    /// Flips the cancelled flag and drops the stored callback, if any.
    /// Idempotent: cancelling an already-cancelled or already-run handle is
    /// a no-op.
    pub fn cancel(&self) {
        self.0.cancelled.store(true, AtomicOrdering::Release);
        // Dropping the callback here breaks any reference cycles held by
        // its captures, the same reason the source's `Handle._run` has a
        // `finally: self._callback = None`.
        if let Ok(mut slot) = self.0.callback.lock() {
            slot.take();
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(AtomicOrdering::Acquire)
    }

    /// Runs the callback if it has not been cancelled. Executed at most
    /// once: the callback is taken out of its slot before being invoked, so
    /// a concurrent second `run` observes an empty slot and does nothing.
    /// Both a returned error and a panic are routed to `reporter` instead of
    /// propagating, so one bad callback never aborts the tick.
    pub fn run(&self, reporter: &dyn ExceptionReporter) {
        if self.is_cancelled() {
            return;
        }
        let callback = match self.0.callback.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        let Some(callback) = callback else {
            return;
        };
        match panic::catch_unwind(AssertUnwindSafe(callback)) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => reporter.report("handle callback", &err),
            Err(payload) => {
                let msg = panic_message(&payload);
                reporter.report("handle callback panicked", &msg);
            }
        }
    }
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// A [`Handle`] additionally ordered by `when`, the loop-time deadline at
/// which it becomes eligible to move from the timer heap into the ready
/// deque.
///
/// Ordering is strictly by `when` ascending (see `spec` §8 testable
/// properties: `a < b <=> a.when < b.when`). Equality, for the purposes of
/// the heap, is identity: two `TimerHandle`s are equal only if they are
/// clones of the same handle.
#[derive(Clone)]
pub struct TimerHandle {
    handle: Handle,
    when: f64,
}

impl TimerHandle {
    #[must_use]
    pub fn new(when: f64, callback: Callback) -> Self {
        Self {
            handle: Handle::new(callback),
            when,
        }
    }

    #[must_use]
    pub fn when(&self) -> f64 {
        self.when
    }

    pub fn cancel(&self) {
        self.handle.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.handle.is_cancelled()
    }

    pub fn run(&self, reporter: &dyn ExceptionReporter) {
        self.handle.run(reporter);
    }

    #[must_use]
    pub fn as_handle(&self) -> &Handle {
        &self.handle
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle")
            .field("when", &self.when)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl PartialEq for TimerHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.handle.0, &other.handle.0)
    }
}

impl Eq for TimerHandle {}

impl PartialOrd for TimerHandle {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerHandle {
    fn cmp(&self, other: &Self) -> Ordering {
        self.when
            .partial_cmp(&other.when)
            .unwrap_or(Ordering::Equal)
    }
}

/// A [`TimerHandle`] whose callable is held weakly: if the callable is
/// dropped elsewhere, the handle auto-cancels the next time it is touched
/// (checked lazily on `run`/`is_cancelled`, consistent with the lazy-heap
/// design — there is no separate finalizer thread).
#[derive(Clone)]
pub struct WeakTimerHandle {
    when: f64,
    callback: Weak<Mutex<Option<Callback>>>,
    cancelled: Arc<AtomicBool>,
}

impl WeakTimerHandle {
    #[must_use]
    pub fn new(when: f64, callback: &Arc<Mutex<Option<Callback>>>) -> Self {
        Self {
            when,
            callback: Arc::downgrade(callback),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub fn when(&self) -> f64 {
        self.when
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, AtomicOrdering::Release);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(AtomicOrdering::Acquire) || self.callback.strong_count() == 0
    }

    pub fn run(&self, reporter: &dyn ExceptionReporter) {
        if self.is_cancelled() {
            return;
        }
        let Some(cell) = self.callback.upgrade() else {
            self.cancel();
            return;
        };
        let callback = match cell.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        let Some(callback) = callback else {
            return;
        };
        match panic::catch_unwind(AssertUnwindSafe(callback)) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => reporter.report("weak handle callback", &err),
            Err(payload) => reporter.report("weak handle callback panicked", &panic_message(&payload)),
        }
    }
}

impl fmt::Debug for WeakTimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakTimerHandle")
            .field("when", &self.when)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl PartialEq for WeakTimerHandle {
    fn eq(&self, other: &Self) -> bool {
        Weak::ptr_eq(&self.callback, &other.callback)
    }
}

impl Eq for WeakTimerHandle {}

impl PartialOrd for WeakTimerHandle {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for WeakTimerHandle {
    fn cmp(&self, other: &Self) -> Ordering {
        self.when.partial_cmp(&other.when).unwrap_or(Ordering::Equal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn handle_runs_at_most_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let h = Handle::new(Box::new(move || {
            c.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(())
        }));
        h.run(&TracingExceptionReporter);
        h.run(&TracingExceptionReporter);
        assert_eq!(count.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn cancel_is_idempotent_and_prevents_run() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let h = Handle::new(Box::new(move || {
            c.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(())
        }));
        h.cancel();
        h.cancel();
        h.run(&TracingExceptionReporter);
        assert_eq!(count.load(AtomicOrdering::SeqCst), 0);
        assert!(h.is_cancelled());
    }

    #[test]
    fn timer_handles_order_by_when() {
        let a = TimerHandle::new(0.01, Box::new(|| Ok(())));
        let b = TimerHandle::new(0.02, Box::new(|| Ok(())));
        assert!(a < b);
    }

    #[test]
    fn panicking_callback_is_reported_not_propagated() {
        let h = Handle::new(Box::new(|| panic!("boom")));
        h.run(&TracingExceptionReporter);
        // Reaching here means the panic was caught, not propagated.
    }

    #[test]
    fn weak_timer_handle_runs_while_its_callback_is_alive() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let cell: Arc<Mutex<Option<Callback>>> = Arc::new(Mutex::new(Some(Box::new(move || {
            c.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(())
        }))));
        let weak = WeakTimerHandle::new(1.0, &cell);
        assert!(!weak.is_cancelled());
        weak.run(&TracingExceptionReporter);
        assert_eq!(count.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn weak_timer_handle_auto_cancels_once_its_callback_is_dropped() {
        let cell: Arc<Mutex<Option<Callback>>> = Arc::new(Mutex::new(Some(Box::new(|| Ok(())))));
        let weak = WeakTimerHandle::new(1.0, &cell);
        assert!(!weak.is_cancelled());
        drop(cell);
        assert!(weak.is_cancelled());
    }
}
