// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! [`Cycler`]: periodic fan-out of priority-ordered callables.

use std::fmt;
use std::future::Future as StdFuture;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{EvLoopError, Result};
use crate::handle::{Callback, TimerHandle};
use crate::runtime_handle::LoopHandle;
use crate::task::Task;

/// A boxed, pinned `async` return value, the shape every [`CyclerCallable::Async`]
/// callable must produce.
pub type CyclerFuture = Pin<Box<dyn StdFuture<Output = Result<()>> + Send>>;

/// A callable registered with a [`Cycler`]: takes the cycler itself as its
/// single argument, same as the source's `CyclerCallable` contract. `Async`
/// callables return a future instead of running to completion inline; `run`
/// spawns that future as a [`Task`] on the cycler's loop rather than polling
/// it itself (spec §4.8's `run` contract).
pub enum CyclerCallable {
    Sync(Box<dyn Fn(&Cycler) + Send + Sync>),
    Async(Box<dyn Fn(&Cycler) -> CyclerFuture + Send + Sync>),
}

/// Reference-counted so [`Cycler::remove`] can match a registered callable
/// by identity.
pub type CyclerCallback = Arc<CyclerCallable>;

static NEXT_ENTRY_ID: AtomicU64 = AtomicU64::new(1);

struct CyclerEntry {
    priority: i64,
    id: u64,
    callback: CyclerCallback,
}

impl CyclerEntry {
    /// Ordering key: priority ascending, then insertion identity — this is
    /// the "appears to be a typo" `__ge__` the spec's Open Questions flag;
    /// we define ordering the straightforward way (priority, then identity)
    /// rather than reproduce the source's self-comparison bug.
    fn sort_key(&self) -> (i64, u64) {
        (self.priority, self.id)
    }
}

struct CyclerState {
    entries: Vec<CyclerEntry>,
    armed: Option<TimerHandle>,
    cancelled: bool,
}

/// Periodically invokes a priority-ordered set of callables every
/// `interval` seconds. Each call receives `&Cycler` so a callable can
/// reschedule or inspect timing without capturing the cycler itself.
pub struct Cycler {
    loop_handle: Arc<dyn LoopHandle>,
    interval: Mutex<f64>,
    state: Mutex<CyclerState>,
    next_call_at: AtomicI64,
}

impl fmt::Debug for Cycler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cycler")
            .field("interval", &*self.interval.lock())
            .field("entries", &self.state.lock().entries.len())
            .finish()
    }
}

impl Cycler {
    /// Validates `interval` is positive, sorts `callbacks` by
    /// `(priority, insertion order)`, and immediately arms the first tick.
    ///
    /// # Errors
    ///
    /// Returns [`EvLoopError::ValueError`] if `interval` is not positive.
    pub fn new(
        loop_handle: Arc<dyn LoopHandle>,
        interval: f64,
        callbacks: Vec<(i64, CyclerCallback)>,
    ) -> Result<Arc<Self>> {
        if interval <= 0.0 {
            return Err(EvLoopError::ValueError("cycle time must be positive"));
        }
        let mut entries: Vec<CyclerEntry> = callbacks
            .into_iter()
            .map(|(priority, callback)| CyclerEntry {
                priority,
                id: NEXT_ENTRY_ID.fetch_add(1, AtomicOrdering::Relaxed),
                callback,
            })
            .collect();
        entries.sort_by_key(CyclerEntry::sort_key);

        let cycler = Arc::new(Self {
            loop_handle,
            interval: Mutex::new(interval),
            state: Mutex::new(CyclerState { entries, armed: None, cancelled: false }),
            next_call_at: AtomicI64::new(0),
        });
        cycler.arm(interval);
        Ok(cycler)
    }

    fn arm(self: &Arc<Self>, interval: f64) {
        let this = self.clone();
        let when = self.loop_handle.time() + interval;
        self.set_next_call_at(when);
        let handle = self.loop_handle.call_after(
            interval,
            Box::new(move || {
                this.run();
                Ok(())
            }),
        );
        self.state.lock().armed = Some(handle);
    }

    fn set_next_call_at(&self, when: f64) {
        self.next_call_at.store((when * 1_000_000.0) as i64, AtomicOrdering::Relaxed);
    }

    /// Runs every registered callable in priority order, reporting
    /// exceptions via the loop's exception reporter instead of aborting the
    /// rest of the sweep, then re-arms for the next interval.
    pub fn run(self: &Arc<Self>) {
        let cancelled = self.state.lock().cancelled;
        if cancelled {
            return;
        }
        let snapshot: Vec<CyclerCallback> = {
            let state = self.state.lock();
            state.entries.iter().map(|e| e.callback.clone()).collect()
        };
        for callback in snapshot {
            match &*callback {
                CyclerCallable::Sync(f) => {
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f(self)));
                    if let Err(payload) = result {
                        self.loop_handle
                            .exception_reporter()
                            .report("cycler callback", &panic_message(&payload));
                    }
                }
                CyclerCallable::Async(f) => {
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f(self)));
                    match result {
                        Ok(future) => {
                            let reporter_loop = self.loop_handle.clone();
                            let task = Task::spawn(self.loop_handle.clone(), async move {
                                if let Err(err) = future.await {
                                    reporter_loop.exception_reporter().report("cycler async callback", &err);
                                }
                                Ok(())
                            });
                            // Fire-and-forget: the task keeps itself alive via
                            // its own scheduled step until it completes.
                            drop(task);
                        }
                        Err(payload) => {
                            self.loop_handle
                                .exception_reporter()
                                .report("cycler callback", &panic_message(&payload));
                        }
                    }
                }
            }
        }
        let still_cancelled = self.state.lock().cancelled;
        if !still_cancelled {
            let interval = *self.interval.lock();
            self.arm(interval);
        }
    }

    pub fn cancel(&self) {
        let handle = {
            let mut state = self.state.lock();
            state.cancelled = true;
            state.armed.take()
        };
        if let Some(handle) = handle {
            handle.cancel();
        }
        self.next_call_at.store(-1, AtomicOrdering::Relaxed);
    }

    /// Runs the callables immediately, independent of the normal schedule,
    /// without disturbing the already-armed timer. Like [`Cycler::run`], an
    /// `Async` callable's returned future is spawned as a [`Task`] rather
    /// than awaited here.
    pub fn call_now(self: &Arc<Self>) {
        let snapshot: Vec<CyclerCallback> = {
            let state = self.state.lock();
            state.entries.iter().map(|e| e.callback.clone()).collect()
        };
        for callback in snapshot {
            match &*callback {
                CyclerCallable::Sync(f) => f(self),
                CyclerCallable::Async(f) => {
                    let future = f(self);
                    let reporter_loop = self.loop_handle.clone();
                    let task = Task::spawn(self.loop_handle.clone(), async move {
                        if let Err(err) = future.await {
                            reporter_loop.exception_reporter().report("cycler async callback", &err);
                        }
                        Ok(())
                    });
                    drop(task);
                }
            }
        }
    }

    /// Cancels the currently-armed timer and arms a fresh one a full
    /// interval from now.
    pub fn reschedule(self: &Arc<Self>) {
        let handle = self.state.lock().armed.take();
        if let Some(handle) = handle {
            handle.cancel();
        }
        let interval = *self.interval.lock();
        self.arm(interval);
    }

    pub fn append(&self, priority: i64, callback: CyclerCallback) {
        let entry = CyclerEntry { priority, id: NEXT_ENTRY_ID.fetch_add(1, AtomicOrdering::Relaxed), callback };
        let mut state = self.state.lock();
        state.entries.push(entry);
        state.entries.sort_by_key(CyclerEntry::sort_key);
    }

    /// Removes every entry whose callback pointer matches `callback`.
    pub fn remove(&self, callback: &CyclerCallback) {
        let mut state = self.state.lock();
        state.entries.retain(|e| !Arc::ptr_eq(&e.callback, callback));
    }

    /// # Errors
    ///
    /// Returns [`EvLoopError::ValueError`] if `new_interval` is not
    /// positive.
    pub fn set_cycle_time(&self, new_interval: f64) -> Result<()> {
        if new_interval <= 0.0 {
            return Err(EvLoopError::ValueError("cycle time must be positive"));
        }
        *self.interval.lock() = new_interval;
        Ok(())
    }

    /// Seconds until the next scheduled call, in `[0, interval]` while
    /// armed, or `-1` after [`Cycler::cancel`].
    #[must_use]
    pub fn get_time_till_next_call(&self) -> f64 {
        let raw = self.next_call_at.load(AtomicOrdering::Relaxed);
        if raw < 0 {
            return -1.0;
        }
        let when = raw as f64 / 1_000_000.0;
        (when - self.loop_handle.time()).max(0.0)
    }

    #[must_use]
    pub fn get_time_of_next_call(&self) -> f64 {
        let raw = self.next_call_at.load(AtomicOrdering::Relaxed);
        if raw < 0 {
            -1.0
        } else {
            raw as f64 / 1_000_000.0
        }
    }

    #[must_use]
    pub fn callback_count(&self) -> usize {
        self.state.lock().entries.len()
    }
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "cycler callback panicked".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{ExceptionReporter, Handle, TracingExceptionReporter};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    #[derive(Debug)]
    struct InlineLoop {
        time: StdMutex<f64>,
        scheduled: StdMutex<Vec<(f64, Callback)>>,
    }

    impl InlineLoop {
        fn new() -> Arc<Self> {
            Arc::new(Self { time: StdMutex::new(0.0), scheduled: StdMutex::new(Vec::new()) })
        }

        fn advance_and_run_due(&self, delta: f64) {
            let mut time = self.time.lock().unwrap();
            *time += delta;
            let now = *time;
            drop(time);
            let due: Vec<Callback> = {
                let mut scheduled = self.scheduled.lock().unwrap();
                let (due, remaining): (Vec<_>, Vec<_>) =
                    scheduled.drain(..).partition(|(when, _)| *when <= now);
                *scheduled = remaining;
                due.into_iter().map(|(_, cb)| cb).collect()
            };
            for cb in due {
                let _ = cb();
            }
        }
    }

    impl LoopHandle for InlineLoop {
        fn id(&self) -> u64 {
            1
        }
        fn call_soon(&self, callback: Callback) -> Handle {
            let _ = callback();
            Handle::new(Box::new(|| Ok(())))
        }
        fn call_soon_thread_safe(&self, callback: Callback) -> Handle {
            self.call_soon(callback)
        }
        fn call_after(&self, delay_seconds: f64, callback: Callback) -> TimerHandle {
            let when = *self.time.lock().unwrap() + delay_seconds;
            self.scheduled.lock().unwrap().push((when, callback));
            TimerHandle::new(when, Box::new(|| Ok(())))
        }
        fn call_at(&self, when: f64, callback: Callback) -> TimerHandle {
            self.scheduled.lock().unwrap().push((when, callback));
            TimerHandle::new(when, Box::new(|| Ok(())))
        }
        fn time(&self) -> f64 {
            *self.time.lock().unwrap()
        }
        fn exception_reporter(&self) -> &dyn ExceptionReporter {
            &TracingExceptionReporter
        }
        fn is_loop_thread(&self) -> bool {
            true
        }
    }

    fn sync_callback<F: Fn(&Cycler) + Send + Sync + 'static>(f: F) -> CyclerCallback {
        Arc::new(CyclerCallable::Sync(Box::new(f)))
    }

    fn async_callback<F>(f: F) -> CyclerCallback
    where
        F: Fn(&Cycler) -> CyclerFuture + Send + Sync + 'static,
    {
        Arc::new(CyclerCallable::Async(Box::new(f)))
    }

    #[test]
    fn calls_in_priority_order_every_tick() {
        let l = InlineLoop::new();
        let order = Arc::new(StdMutex::new(Vec::new()));
        let o1 = order.clone();
        let o2 = order.clone();
        let cycler = Cycler::new(
            l.clone(),
            1.0,
            vec![
                (5, sync_callback(move |_: &Cycler| o1.lock().unwrap().push("low"))),
                (1, sync_callback(move |_: &Cycler| o2.lock().unwrap().push("high"))),
            ],
        )
        .unwrap();
        l.advance_and_run_due(1.0);
        assert_eq!(&*order.lock().unwrap(), &["high", "low"]);
        cycler.cancel();
    }

    #[test]
    fn time_till_next_call_is_negative_one_after_cancel() {
        let l = InlineLoop::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let cycler = Cycler::new(
            l.clone(),
            1.0,
            vec![(0, sync_callback(move |_: &Cycler| {
                c.fetch_add(1, AtomicOrdering::SeqCst);
            }))],
        )
        .unwrap();
        assert!(cycler.get_time_till_next_call() >= 0.0);
        cycler.cancel();
        assert_eq!(cycler.get_time_till_next_call(), -1.0);
    }

    #[test]
    fn async_callback_return_runs_as_a_task_rather_than_inline() {
        let l = InlineLoop::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        let cycler = Cycler::new(
            l.clone(),
            1.0,
            vec![(0, async_callback(move |_: &Cycler| {
                let r = r.clone();
                Box::pin(async move {
                    r.fetch_add(1, AtomicOrdering::SeqCst);
                    Ok(())
                })
            }))],
        )
        .unwrap();
        cycler.call_now();
        l.advance_and_run_due(0.0);
        assert_eq!(ran.load(AtomicOrdering::SeqCst), 1);
        cycler.cancel();
    }

    #[test]
    fn rejects_non_positive_interval() {
        let l = InlineLoop::new();
        let result = Cycler::new(l, 0.0, vec![]);
        assert!(matches!(result, Err(EvLoopError::ValueError(_))));
    }
}
