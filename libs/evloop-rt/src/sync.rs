// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Synchronization primitives built atop [`crate::future::Future`]:
//! [`Event`], [`Lock`], [`AsyncQueue`] (FIFO), [`AsyncLifoQueue`], and
//! [`ScarletExecutor`] (bounded-parallelism fan-out).

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex;

use crate::error::{EvLoopError, Result};
use crate::future::Future as EvFuture;
use crate::runtime_handle::LoopHandle;

/// A boolean flag with a waiter list. `set()` wakes every current waiter;
/// `clear()` just resets the flag — it does not retroactively un-wake
/// anyone already past their `wait()`.
pub struct Event {
    state: Mutex<EventState>,
}

struct EventState {
    is_set: bool,
    waiters: Vec<Waker>,
}

impl Event {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self { state: Mutex::new(EventState { is_set: false, waiters: Vec::new() }) })
    }

    pub fn set(&self) {
        let mut state = self.state.lock();
        state.is_set = true;
        for waker in state.waiters.drain(..) {
            waker.wake();
        }
    }

    pub fn clear(&self) {
        self.state.lock().is_set = false;
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        self.state.lock().is_set
    }

    pub async fn wait(&self) {
        std::future::poll_fn(|cx| {
            let mut state = self.state.lock();
            if state.is_set {
                Poll::Ready(())
            } else {
                state.waiters.push(cx.waker().clone());
                Poll::Pending
            }
        })
        .await;
    }
}

/// A FIFO mutual-exclusion lock for cooperative tasks on one loop. `acquire`
/// suspends the caller if the lock is held; `release` hands it directly to
/// the next waiter in line rather than letting any ready task race for it.
pub struct Lock {
    state: Mutex<LockState>,
}

struct LockState {
    held: bool,
    waiters: VecDeque<Waker>,
}

impl Lock {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self { state: Mutex::new(LockState { held: false, waiters: VecDeque::new() }) })
    }

    #[must_use]
    pub fn locked(&self) -> bool {
        self.state.lock().held
    }

    pub async fn acquire(self: &Arc<Self>) -> LockGuard {
        std::future::poll_fn(|cx| {
            let mut state = self.state.lock();
            if !state.held && state.waiters.is_empty() {
                state.held = true;
                Poll::Ready(())
            } else {
                state.waiters.push_back(cx.waker().clone());
                Poll::Pending
            }
        })
        .await;
        LockGuard { lock: self.clone() }
    }

    fn release(&self) {
        let mut state = self.state.lock();
        if let Some(waker) = state.waiters.pop_front() {
            // Ownership passes straight to the next waiter: `held` stays
            // `true` and that waiter's re-poll of `acquire` observes an
            // already-held lock it was specifically granted, not a race.
            waker.wake();
        } else {
            state.held = false;
        }
    }
}

/// RAII guard returned by [`Lock::acquire`]; dropping it releases the lock.
#[must_use]
pub struct LockGuard {
    lock: Arc<Lock>,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.lock.release();
    }
}

/// Overflow policy for a bounded [`AsyncQueue`]/[`AsyncLifoQueue`]: what
/// `set_result` (the non-blocking push) does when the queue is already at
/// its bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Reject the push; the caller should use `set_result_wait` instead.
    Reject,
    /// Drop the oldest (FIFO) / newest (LIFO) queued item to make room.
    DropOldest,
}

enum Discipline {
    Fifo,
    Lifo,
}

struct QueueState<T> {
    items: VecDeque<T>,
    max_length: Option<usize>,
    consumers: VecDeque<Waker>,
    producers: VecDeque<Waker>,
    exception: Option<EvLoopError>,
    cancelled: bool,
}

/// Shared implementation behind [`AsyncQueue`] and [`AsyncLifoQueue`]; the
/// only difference between the two is which end `pop_ready` drains from.
struct QueueImpl<T> {
    state: Mutex<QueueState<T>>,
    discipline: Discipline,
    overflow: OverflowPolicy,
}

impl<T> QueueImpl<T> {
    fn new(max_length: Option<usize>, discipline: Discipline, overflow: OverflowPolicy) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                max_length,
                consumers: VecDeque::new(),
                producers: VecDeque::new(),
                exception: None,
                cancelled: false,
            }),
            discipline,
            overflow,
        }
    }

    fn push_ready(&self, state: &mut QueueState<T>, item: T) {
        match self.discipline {
            Discipline::Fifo => state.items.push_back(item),
            Discipline::Lifo => state.items.push_front(item),
        }
    }

    /// Both disciplines pop from the front: [`Discipline::Fifo`] pushes at
    /// the back (front = oldest), [`Discipline::Lifo`] pushes at the front
    /// (front = newest) — the discipline lives entirely in `push_ready`.
    fn pop_ready(&self, state: &mut QueueState<T>) -> Option<T> {
        state.items.pop_front()
    }

    /// Non-blocking push. Delivers straight to a waiting consumer if one
    /// exists; otherwise enqueues, applying `overflow` if the queue is at
    /// its bound. Returns `false` if the item was dropped under
    /// [`OverflowPolicy::Reject`].
    fn set_result(&self, item: T) -> bool {
        let waker = {
            let mut state = self.state.lock();
            if let Some(max) = state.max_length {
                if state.items.len() >= max {
                    match self.overflow {
                        OverflowPolicy::Reject => return false,
                        OverflowPolicy::DropOldest => {
                            match self.discipline {
                                Discipline::Fifo => state.items.pop_front(),
                                Discipline::Lifo => state.items.pop_back(),
                            };
                        }
                    }
                }
            }
            self.push_ready(&mut state, item);
            state.consumers.pop_front()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
        true
    }

    fn set_exception(&self, error: EvLoopError) {
        let wakers = {
            let mut state = self.state.lock();
            state.exception = Some(error);
            std::mem::take(&mut state.consumers)
        };
        for waker in wakers {
            waker.wake();
        }
    }

    fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn set_result_wait(&self, item: T) {
        let mut slot = Some(item);
        std::future::poll_fn(|cx| {
            let mut state = self.state.lock();
            let full = state.max_length.is_some_and(|max| state.items.len() >= max);
            if !full {
                let item = slot.take().expect("polled again after completing");
                let waker = state.consumers.pop_front();
                self.push_ready(&mut state, item);
                drop(state);
                if let Some(waker) = waker {
                    waker.wake();
                }
                Poll::Ready(())
            } else {
                state.producers.push_back(cx.waker().clone());
                Poll::Pending
            }
        })
        .await;
    }

    async fn get_result(&self) -> Result<T> {
        std::future::poll_fn(|cx| {
            let mut state = self.state.lock();
            if let Some(item) = self.pop_ready(&mut state) {
                if let Some(waker) = state.producers.pop_front() {
                    waker.wake();
                }
                return Poll::Ready(Ok(item));
            }
            if state.items.is_empty() {
                if let Some(err) = state.exception.take() {
                    return Poll::Ready(Err(err));
                }
                if state.cancelled {
                    return Poll::Ready(Err(EvLoopError::Cancelled));
                }
            }
            state.consumers.push_back(cx.waker().clone());
            Poll::Pending
        })
        .await
    }

    fn cancel(&self) {
        let wakers = {
            let mut state = self.state.lock();
            state.cancelled = true;
            state.consumers.drain(..).chain(state.producers.drain(..)).collect::<Vec<_>>()
        };
        for waker in wakers {
            waker.wake();
        }
    }
}

/// A bounded (or unbounded) FIFO async queue. `set_result` never blocks the
/// producer; `set_result_wait` suspends it while the queue is full.
pub struct AsyncQueue<T>(QueueImpl<T>);

impl<T> AsyncQueue<T> {
    #[must_use]
    pub fn new(max_length: Option<usize>) -> Self {
        Self(QueueImpl::new(max_length, Discipline::Fifo, OverflowPolicy::Reject))
    }

    #[must_use]
    pub fn with_overflow(max_length: Option<usize>, overflow: OverflowPolicy) -> Self {
        Self(QueueImpl::new(max_length, Discipline::Fifo, overflow))
    }

    pub fn set_result(&self, item: T) -> bool {
        self.0.set_result(item)
    }

    pub async fn set_result_wait(&self, item: T) {
        self.0.set_result_wait(item).await;
    }

    pub fn set_exception(&self, error: EvLoopError) {
        self.0.set_exception(error);
    }

    /// # Errors
    ///
    /// Returns whatever error was latched via `set_exception`, or
    /// [`EvLoopError::Cancelled`] once the queue is cancelled and drained.
    pub async fn get_result(&self) -> Result<T> {
        self.0.get_result().await
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn cancel(&self) {
        self.0.cancel();
    }
}

/// A last-in-first-out variant of [`AsyncQueue`]: `get_result` returns the
/// most recently pushed item rather than the oldest.
pub struct AsyncLifoQueue<T>(QueueImpl<T>);

impl<T> AsyncLifoQueue<T> {
    #[must_use]
    pub fn new(max_length: Option<usize>) -> Self {
        Self(QueueImpl::new(max_length, Discipline::Lifo, OverflowPolicy::Reject))
    }

    pub fn set_result(&self, item: T) -> bool {
        self.0.set_result(item)
    }

    pub async fn set_result_wait(&self, item: T) {
        self.0.set_result_wait(item).await;
    }

    pub fn set_exception(&self, error: EvLoopError) {
        self.0.set_exception(error);
    }

    /// # Errors
    ///
    /// Returns whatever error was latched via `set_exception`, or
    /// [`EvLoopError::Cancelled`] once the queue is cancelled and drained.
    pub async fn get_result(&self) -> Result<T> {
        self.0.get_result().await
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn cancel(&self) {
        self.0.cancel();
    }
}

/// Limits concurrently-running sub-futures to `N`. `add` suspends the
/// caller once the cap is reached; on scope exit, any exception (other than
/// cancellation) raised by a tracked future is re-raised after cancelling
/// every sibling still running.
pub struct ScarletExecutor<T: Clone + Send + 'static> {
    loop_handle: Arc<dyn LoopHandle>,
    limit: usize,
    state: Arc<Mutex<ScarletState<T>>>,
}

struct ScarletState<T> {
    running: Vec<EvFuture<T>>,
    waiters: Vec<Waker>,
    first_error: Option<EvLoopError>,
}

impl<T: Clone + Send + 'static> ScarletExecutor<T> {
    /// # Panics
    ///
    /// Panics if `limit` is zero.
    #[must_use]
    pub fn new(loop_handle: Arc<dyn LoopHandle>, limit: usize) -> Self {
        assert!(limit > 0, "ScarletExecutor limit must be positive");
        Self {
            loop_handle,
            limit,
            state: Arc::new(Mutex::new(ScarletState { running: Vec::new(), waiters: Vec::new(), first_error: None })),
        }
    }

    /// Adds `future` to the bounded set, awaiting room if the cap is
    /// already reached.
    pub async fn add(&self, future: EvFuture<T>) {
        std::future::poll_fn(|cx| {
            let mut state = self.state.lock();
            if state.running.len() < self.limit {
                state.running.push(future.clone());
                Poll::Ready(())
            } else {
                state.waiters.push(cx.waker().clone());
                Poll::Pending
            }
        })
        .await;

        let state_for_cb = self.state.clone();
        let completed = future.clone();
        future.add_done_callback(move |_| {
            let mut state = state_for_cb.lock();
            state.running.retain(|f| f.identity() != completed.identity());
            if let Err(err) = completed.get_result() {
                if !matches!(err, EvLoopError::Cancelled) && state.first_error.is_none() {
                    state.first_error = Some(err);
                }
            }
            for waker in state.waiters.drain(..) {
                waker.wake();
            }
        });
    }

    #[must_use]
    pub fn running_count(&self) -> usize {
        self.state.lock().running.len()
    }

    /// Cancels every future still running. Called on scope exit when an
    /// error has been latched.
    pub fn cancel_siblings(&self) {
        let running = self.state.lock().running.clone();
        for future in running {
            future.cancel();
        }
    }

    /// Awaits every tracked future; returns the first non-cancellation
    /// error observed, if any, cancelling the rest first.
    ///
    /// # Errors
    ///
    /// Returns the first non-cancellation error latched by any tracked
    /// future.
    pub async fn join(&self) -> Result<()> {
        loop {
            let pending = {
                let state = self.state.lock();
                state.running.first().cloned()
            };
            let Some(next) = pending else { break };
            let _ = next.await;
        }
        let err = self.state.lock().first_error.take();
        if let Some(err) = err {
            self.cancel_siblings();
            return Err(err);
        }
        Ok(())
    }

    #[must_use]
    pub fn loop_handle(&self) -> Arc<dyn LoopHandle> {
        self.loop_handle.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{Callback, ExceptionReporter, Handle, TracingExceptionReporter};
    use std::sync::Mutex as StdMutex;

    #[derive(Debug)]
    struct InlineLoop {
        ready: StdMutex<VecDeque<Callback>>,
    }

    impl InlineLoop {
        fn new() -> Arc<Self> {
            Arc::new(Self { ready: StdMutex::new(VecDeque::new()) })
        }
        fn run_until_empty(&self) {
            loop {
                let next = self.ready.lock().unwrap().pop_front();
                match next {
                    Some(cb) => {
                        let _ = cb();
                    }
                    None => break,
                }
            }
        }
    }

    impl LoopHandle for InlineLoop {
        fn id(&self) -> u64 {
            5
        }
        fn call_soon(&self, callback: Callback) -> Handle {
            self.ready.lock().unwrap().push_back(callback);
            Handle::new(Box::new(|| Ok(())))
        }
        fn call_soon_thread_safe(&self, callback: Callback) -> Handle {
            self.call_soon(callback)
        }
        fn call_after(&self, _delay_seconds: f64, callback: Callback) -> crate::handle::TimerHandle {
            crate::handle::TimerHandle::new(0.0, callback)
        }
        fn call_at(&self, _when: f64, callback: Callback) -> crate::handle::TimerHandle {
            crate::handle::TimerHandle::new(0.0, callback)
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

    fn block_on<F: std::future::Future>(loop_: &InlineLoop, mut fut: F) -> F::Output
    where
        F: Unpin,
    {
        use std::task::{RawWaker, RawWakerVTable};
        fn noop(_: *const ()) {}
        fn clone(_: *const ()) -> RawWaker {
            RawWaker::new(std::ptr::null(), &VTABLE)
        }
        static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, noop, noop, noop);
        let raw = RawWaker::new(std::ptr::null(), &VTABLE);
        let waker = unsafe { Waker::from_raw(raw) };
        let mut cx = Context::from_waker(&waker);
        loop {
            match Pin::new(&mut fut).poll(&mut cx) {
                Poll::Ready(v) => return v,
                Poll::Pending => loop_.run_until_empty(),
            }
        }
    }

    #[test]
    fn event_wakes_all_waiters_on_set() {
        let event = Event::new();
        event.set();
        assert!(event.is_set());
        event.clear();
        assert!(!event.is_set());
    }

    #[test]
    fn queue_full_blocks_producer_scenario() {
        let l = InlineLoop::new();
        let q: AsyncQueue<i32> = AsyncQueue::new(Some(1));
        block_on(&l, Box::pin(q.set_result_wait(1)));
        assert_eq!(q.len(), 1);

        let consumer = Box::pin(q.get_result());
        let first = block_on(&l, consumer);
        assert_eq!(first.unwrap(), 1);

        block_on(&l, Box::pin(q.set_result_wait(2)));
        let second = block_on(&l, Box::pin(q.get_result()));
        assert_eq!(second.unwrap(), 2);
    }

    #[test]
    fn lifo_queue_pops_most_recent() {
        let l = InlineLoop::new();
        let q: AsyncLifoQueue<i32> = AsyncLifoQueue::new(None);
        q.set_result(1);
        q.set_result(2);
        q.set_result(3);
        let got = block_on(&l, Box::pin(q.get_result())).unwrap();
        assert_eq!(got, 3);
    }

    #[test]
    fn queue_cancel_unblocks_consumer_with_cancelled() {
        let q: AsyncQueue<i32> = AsyncQueue::new(None);
        q.cancel();
        let l = InlineLoop::new();
        let result = block_on(&l, Box::pin(q.get_result()));
        assert!(matches!(result, Err(EvLoopError::Cancelled)));
    }
}
