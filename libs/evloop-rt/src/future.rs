// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! [`Future`]: a single-assignment result cell bound to a loop.
//!
//! Unlike `std::future::Future`'s built-in combinators, this type *is* the
//! state machine the source describes: `pending -> finished`,
//! `pending -> cancelled`, with an optional debug-only `finished ->
//! retrieved` drain. It also implements `std::future::Future` itself so it
//! composes with `.await` the ordinary way; [`crate::task::Task`] polls one
//! of these (or an arbitrary foreign future) to drive a coroutine.

use std::cell::Cell;
use std::fmt;
use std::future::Future as StdFuture;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex;

use crate::error::{EvLoopError, Result};
use crate::handle::{Callback, TimerHandle};
use crate::runtime_handle::LoopHandle;

/// See spec §3: `pending`, `finished`, `cancelled`, and the debug-only
/// `retrieved` drain of `finished`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Pending,
    Finished,
    Cancelled,
    Retrieved,
}

/// Outcome of a `_if_pending` call: matches the source's tri-state return
/// value so cross-loop wrappers can tell an already-resolved future from one
/// they just resolved from one they resolved *and* someone already observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    AlreadyDone = 0,
    Accepted = 1,
    AcceptedAndPropagated = 2,
}

type DoneCallback<T> = Box<dyn FnOnce(Future<T>) + Send + 'static>;

struct Inner<T> {
    state: State,
    result: Option<Result<T>>,
    callbacks: Vec<(u64, DoneCallback<T>)>,
    waker: Option<Waker>,
    cancel_handles: Vec<TimerHandle>,
    blocking: bool,
    next_callback_id: u64,
}

struct Shared<T> {
    inner: Mutex<Inner<T>>,
    loop_handle: Arc<dyn LoopHandle>,
}

impl<T> Drop for Shared<T> {
    /// A still-pending future whose last handle is dropped is treated as
    /// cancelled. This is how cancelling a [`crate::task::Task`] propagates
    /// into whatever future it is currently awaiting (spec §4.4): the
    /// coroutine is dropped, which drops its locals, which drops the
    /// uniquely-held awaited future, which lands here.
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        if inner.state == State::Pending {
            inner.state = State::Cancelled;
            for handle in inner.cancel_handles.drain(..) {
                handle.cancel();
            }
        }
    }
}

thread_local! {
    static CURRENT_LOOP_ID: Cell<Option<u64>> = const { Cell::new(None) };
}

/// RAII guard installed by [`crate::event_loop::EventThread`] while stepping
/// a task, so [`Future::poll`] can enforce "a yielded value must be a future
/// bound to the same loop" (spec §4.4) without every awaiter having to pass
/// the loop down explicitly.
#[must_use]
pub struct LoopIdGuard(Option<u64>);

pub fn enter_loop(id: u64) -> LoopIdGuard {
    let previous = CURRENT_LOOP_ID.with(|cell| cell.replace(Some(id)));
    LoopIdGuard(previous)
}

impl Drop for LoopIdGuard {
    fn drop(&mut self) {
        CURRENT_LOOP_ID.with(|cell| cell.set(self.0));
    }
}

/// A single-assignment result cell. Cheaply `Clone`-able; every clone shares
/// the same underlying state (an `Arc`).
pub struct Future<T: Send + 'static> {
    shared: Arc<Shared<T>>,
}

impl<T: Send + 'static> Clone for Future<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Send + 'static> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("Future").field("state", &inner.state).finish()
    }
}

impl<T: Clone + Send + 'static> Future<T> {
    #[must_use]
    pub fn new(loop_handle: Arc<dyn LoopHandle>) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: State::Pending,
                    result: None,
                    callbacks: Vec::new(),
                    waker: None,
                    cancel_handles: Vec::new(),
                    blocking: false,
                    next_callback_id: 0,
                }),
                loop_handle,
            }),
        }
    }

    #[must_use]
    pub fn loop_id(&self) -> u64 {
        self.shared.loop_handle.id()
    }

    /// Stable identity for this future's shared cell, used by [`crate::task::TaskGroup`]
    /// to dedupe a future across snapshots of its completed-queue without
    /// requiring `T: Eq`.
    #[must_use]
    pub fn identity(&self) -> usize {
        Arc::as_ptr(&self.shared).cast::<()>() as usize
    }

    #[must_use]
    pub fn state(&self) -> State {
        self.shared.inner.lock().state
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        matches!(
            self.shared.inner.lock().state,
            State::Finished | State::Cancelled | State::Retrieved
        )
    }

    /// # Errors
    ///
    /// Returns [`EvLoopError::InvalidState`] if the future has already left
    /// `pending`.
    pub fn set_result(&self, value: T) -> Result<()> {
        match self.set_result_if_pending(value) {
            SetOutcome::Accepted | SetOutcome::AcceptedAndPropagated => Ok(()),
            SetOutcome::AlreadyDone => Err(EvLoopError::InvalidState),
        }
    }

    /// # Errors
    ///
    /// Returns [`EvLoopError::InvalidState`] if the future has already left
    /// `pending`.
    pub fn set_exception(&self, error: EvLoopError) -> Result<()> {
        match self.set_exception_if_pending(error) {
            SetOutcome::Accepted | SetOutcome::AcceptedAndPropagated => Ok(()),
            SetOutcome::AlreadyDone => Err(EvLoopError::InvalidState),
        }
    }

    pub fn set_result_if_pending(&self, value: T) -> SetOutcome {
        self.finish(Ok(value))
    }

    pub fn set_exception_if_pending(&self, error: EvLoopError) -> SetOutcome {
        self.finish(Err(error))
    }

    fn finish(&self, result: Result<T>) -> SetOutcome {
        let waker = {
            let mut inner = self.shared.inner.lock();
            if inner.state != State::Pending {
                return SetOutcome::AlreadyDone;
            }
            inner.state = State::Finished;
            inner.result = Some(result);
            for handle in inner.cancel_handles.drain(..) {
                handle.cancel();
            }
            inner.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
        self.schedule_callbacks();
        SetOutcome::Accepted
    }

    /// Flips `pending -> cancelled`. Returns `true` iff this call performed
    /// the transition (matching the source's `1`/`0` convention, spelled as
    /// a bool because Rust callers check truthiness anyway).
    pub fn cancel(&self) -> bool {
        let waker = {
            let mut inner = self.shared.inner.lock();
            if inner.state != State::Pending {
                return false;
            }
            inner.state = State::Cancelled;
            for handle in inner.cancel_handles.drain(..) {
                handle.cancel();
            }
            inner.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
        self.schedule_callbacks();
        true
    }

    /// # Errors
    ///
    /// Returns [`EvLoopError::InvalidState`] while pending, or the latched
    /// exception/cancellation once the future is done.
    pub fn get_result(&self) -> Result<T> {
        let mut inner = self.shared.inner.lock();
        match inner.state {
            State::Pending => Err(EvLoopError::InvalidState),
            State::Cancelled => Err(EvLoopError::Cancelled),
            State::Finished | State::Retrieved => {
                inner.state = State::Retrieved;
                match inner.result.as_ref().expect("finished future has a result") {
                    Ok(value) => Ok(value.clone()),
                    Err(EvLoopError::Os(err)) => {
                        Err(EvLoopError::Os(std::io::Error::new(err.kind(), err.to_string())))
                    }
                    Err(other) => Err(clone_error(other)),
                }
            }
        }
    }

    /// Marks the result retrieved without returning it, silencing the debug
    /// "unretrieved exception" diagnostic the source emits for futures whose
    /// exception was never observed.
    pub fn silence(&self) {
        let mut inner = self.shared.inner.lock();
        if inner.state == State::Finished {
            inner.state = State::Retrieved;
        }
    }

    /// Registers `callback` to run once this future is done. If it is
    /// already done, the callback is scheduled on the loop immediately
    /// instead of running inline, matching `_schedule_callbacks`.
    pub fn add_done_callback(&self, callback: impl FnOnce(Future<T>) + Send + 'static) -> u64 {
        let mut inner = self.shared.inner.lock();
        let id = inner.next_callback_id;
        inner.next_callback_id += 1;
        if matches!(inner.state, State::Pending) {
            inner.callbacks.push((id, Box::new(callback)));
        } else {
            drop(inner);
            let this = self.clone();
            let cb: Callback = Box::new(move || {
                callback(this);
                Ok(())
            });
            self.shared.loop_handle.call_soon(cb);
        }
        id
    }

    pub fn remove_done_callback(&self, id: u64) {
        let mut inner = self.shared.inner.lock();
        inner.callbacks.retain(|(cb_id, _)| *cb_id != id);
    }

    #[must_use]
    pub fn callback_count(&self) -> usize {
        self.shared.inner.lock().callbacks.len()
    }

    pub fn apply_timeout(&self, seconds: f64) {
        let this = self.clone();
        let handle = self
            .shared
            .loop_handle
            .call_after(seconds, Box::new(move || {
                this.cancel();
                Ok(())
            }));
        self.shared.inner.lock().cancel_handles.push(handle);
    }

    fn schedule_callbacks(&self) {
        let callbacks = {
            let mut inner = self.shared.inner.lock();
            std::mem::take(&mut inner.callbacks)
        };
        for (_, callback) in callbacks {
            let this = self.clone();
            let cb: Callback = Box::new(move || {
                callback(this);
                Ok(())
            });
            self.shared.loop_handle.call_soon(cb);
        }
    }
}

fn clone_error(err: &EvLoopError) -> EvLoopError {
    match err {
        EvLoopError::InvalidState => EvLoopError::InvalidState,
        EvLoopError::Cancelled => EvLoopError::Cancelled,
        EvLoopError::Timeout => EvLoopError::Timeout,
        EvLoopError::Os(io_err) => EvLoopError::Os(std::io::Error::new(io_err.kind(), io_err.to_string())),
        EvLoopError::RuntimeError(m) => EvLoopError::RuntimeError(m),
        EvLoopError::TypeError(m) => EvLoopError::TypeError(m),
        EvLoopError::ValueError(m) => EvLoopError::ValueError(m),
        EvLoopError::NotImplemented(m) => EvLoopError::NotImplemented(m),
    }
}

impl<T: Clone + Send + 'static> StdFuture for Future<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(current) = CURRENT_LOOP_ID.with(Cell::get) {
            if current != self.loop_id() {
                return Poll::Ready(Err(EvLoopError::RuntimeError(
                    "future polled while bound to a different loop than the current task",
                )));
            }
        }
        let mut inner = self.shared.inner.lock();
        match inner.state {
            State::Pending => {
                inner.blocking = true;
                inner.waker = Some(cx.waker().clone());
                Poll::Pending
            }
            State::Finished | State::Retrieved => {
                inner.state = State::Retrieved;
                let result = match inner.result.as_ref().expect("finished") {
                    Ok(v) => Ok(v.clone()),
                    Err(e) => Err(clone_error(e)),
                };
                Poll::Ready(result)
            }
            State::Cancelled => Poll::Ready(Err(EvLoopError::Cancelled)),
        }
    }
}

static NEXT_LOOP_LOCAL_ID: AtomicU64 = AtomicU64::new(1);

/// Allocates a fresh identity, used by [`crate::event_loop::EventThread`] to
/// implement [`LoopHandle::id`].
pub fn next_loop_id() -> u64 {
    NEXT_LOOP_LOCAL_ID.fetch_add(1, AtomicOrdering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{ExceptionReporter, Handle, TracingExceptionReporter};
    use std::sync::Mutex as StdMutex;

    #[derive(Debug)]
    struct InlineLoop {
        ready: StdMutex<Vec<Callback>>,
    }

    impl InlineLoop {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                ready: StdMutex::new(Vec::new()),
            })
        }

        fn drain(&self) {
            let cbs = std::mem::take(&mut *self.ready.lock().unwrap());
            for cb in cbs {
                let _ = cb();
            }
        }
    }

    impl LoopHandle for InlineLoop {
        fn id(&self) -> u64 {
            1
        }
        fn call_soon(&self, callback: Callback) -> Handle {
            self.ready.lock().unwrap().push(callback);
            Handle::new(Box::new(|| Ok(())))
        }
        fn call_soon_thread_safe(&self, callback: Callback) -> Handle {
            self.call_soon(callback)
        }
        fn call_after(&self, _delay_seconds: f64, callback: Callback) -> TimerHandle {
            TimerHandle::new(0.0, callback)
        }
        fn call_at(&self, _when: f64, callback: Callback) -> TimerHandle {
            TimerHandle::new(0.0, callback)
        }
        fn time(&self) -> f64 {
            0.0
        }
        fn exception_reporter(&self) -> &dyn ExceptionReporter {
            &TracingExceptionReporter
        }
        fn is_loop_thread(&self) -> bool {
            true
        }
    }

    #[test]
    fn set_result_then_get_result() {
        let l = InlineLoop::new();
        let f: Future<i32> = Future::new(l);
        f.set_result(42).unwrap();
        assert_eq!(f.get_result().unwrap(), 42);
    }

    #[test]
    fn double_set_result_is_invalid_state() {
        let l = InlineLoop::new();
        let f: Future<i32> = Future::new(l);
        f.set_result(1).unwrap();
        assert!(matches!(f.set_result(2), Err(EvLoopError::InvalidState)));
        assert_eq!(f.set_result_if_pending(3), SetOutcome::AlreadyDone);
    }

    #[test]
    fn cancel_then_get_result_is_cancelled() {
        let l = InlineLoop::new();
        let f: Future<i32> = Future::new(l);
        assert!(f.cancel());
        assert!(!f.cancel());
        assert!(matches!(f.get_result(), Err(EvLoopError::Cancelled)));
    }

    #[test]
    fn done_callback_runs_once_scheduled() {
        let l = InlineLoop::new();
        let f: Future<i32> = Future::new(l.clone());
        let seen = Arc::new(StdMutex::new(None));
        let seen2 = seen.clone();
        f.add_done_callback(move |fut| {
            *seen2.lock().unwrap() = Some(fut.get_result().unwrap());
        });
        f.set_result(7).unwrap();
        l.drain();
        assert_eq!(*seen.lock().unwrap(), Some(7));
    }

    #[test]
    fn late_done_callback_is_scheduled_not_inline() {
        let l = InlineLoop::new();
        let f: Future<i32> = Future::new(l.clone());
        f.set_result(7).unwrap();
        let seen = Arc::new(StdMutex::new(false));
        let seen2 = seen.clone();
        f.add_done_callback(move |_| {
            *seen2.lock().unwrap() = true;
        });
        assert!(!*seen.lock().unwrap());
        l.drain();
        assert!(*seen.lock().unwrap());
    }
}
