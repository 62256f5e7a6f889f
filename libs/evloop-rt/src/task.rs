// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! [`Task`]: a [`Future`] that drives a coroutine (here, an ordinary Rust
//! `async` block/fn), plus [`TaskGroup`], the gather/any/exhaust collection
//! over a set of same-typed futures.
//!
//! The source throws a `CancelledError` into the coroutine at its next
//! resume point. Rust has no equivalent of `generator.throw`, so cancelling
//! a `Task` here drops its driving future synchronously instead; dropping is
//! the idiomatic Rust analogue and, via [`Future`]'s own `Drop` impl,
//! transitively cancels whatever the task was `.await`ing.

use std::cell::Cell;
use std::future::Future as StdFuture;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};

use parking_lot::Mutex;
use std::collections::VecDeque;

use crate::error::{EvLoopError, Result};
use crate::future::{enter_loop, Future};
use crate::runtime_handle::LoopHandle;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct TaskId(u64);

thread_local! {
    static CURRENT_TASK: Cell<Option<TaskId>> = const { Cell::new(None) };
}

/// The `TaskId` of the task currently stepping on this thread, if any.
/// Mirrors the source's `current_task` loop attribute.
#[must_use]
pub fn current_task() -> Option<TaskId> {
    CURRENT_TASK.with(Cell::get)
}

struct CurrentTaskGuard(Option<TaskId>);

fn enter_task(id: TaskId) -> CurrentTaskGuard {
    let previous = CURRENT_TASK.with(|cell| cell.replace(Some(id)));
    CurrentTaskGuard(previous)
}

impl Drop for CurrentTaskGuard {
    fn drop(&mut self) {
        CURRENT_TASK.with(|cell| cell.set(self.0));
    }
}

type BoxedCoroutine<T> = Pin<Box<dyn StdFuture<Output = Result<T>> + Send>>;

struct TaskInner<T: Clone + Send + 'static> {
    id: TaskId,
    coroutine: Mutex<Option<BoxedCoroutine<T>>>,
    future: Future<T>,
    loop_handle: Arc<dyn LoopHandle>,
}

impl<T: Clone + Send + 'static> Wake for TaskInner<T> {
    fn wake(self: Arc<Self>) {
        self.schedule_step();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.schedule_step();
    }
}

impl<T: Clone + Send + 'static> TaskInner<T> {
    fn schedule_step(self: &Arc<Self>) {
        let this = self.clone();
        self.loop_handle
            .call_soon_thread_safe(Box::new(move || {
                this.step();
                Ok(())
            }));
    }

    fn step(self: &Arc<Self>) {
        let mut guard = self.coroutine.lock();
        let Some(coroutine) = guard.as_mut() else {
            return;
        };
        let waker = Waker::from(self.clone());
        let mut cx = Context::from_waker(&waker);
        let _loop_guard = enter_loop(self.loop_handle.id());
        let _task_guard = enter_task(self.id);
        match coroutine.as_mut().poll(&mut cx) {
            Poll::Pending => {}
            Poll::Ready(Ok(value)) => {
                *guard = None;
                drop(guard);
                let _ = self.future.set_result(value);
            }
            Poll::Ready(Err(EvLoopError::Cancelled)) => {
                *guard = None;
                drop(guard);
                self.future.cancel();
            }
            Poll::Ready(Err(other)) => {
                *guard = None;
                drop(guard);
                let _ = self.future.set_exception(other);
            }
        }
    }
}

/// A future that drives an `async` computation to completion on a specific
/// loop.
pub struct Task<T: Clone + Send + 'static> {
    future: Future<T>,
    inner: Arc<TaskInner<T>>,
}

impl<T: Clone + Send + 'static> Clone for Task<T> {
    fn clone(&self) -> Self {
        Self {
            future: self.future.clone(),
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Task<T> {
    /// Spawns `coroutine` on `loop_handle`, scheduling its first step via
    /// `call_soon` (spec §4.4: "A freshly constructed Task schedules its
    /// first step").
    pub fn spawn<F>(loop_handle: Arc<dyn LoopHandle>, coroutine: F) -> Self
    where
        F: StdFuture<Output = Result<T>> + Send + 'static,
    {
        let future = Future::new(loop_handle.clone());
        let id = TaskId(NEXT_TASK_ID.fetch_add(1, AtomicOrdering::Relaxed));
        let inner = Arc::new(TaskInner {
            id,
            coroutine: Mutex::new(Some(Box::pin(coroutine))),
            future: future.clone(),
            loop_handle: loop_handle.clone(),
        });
        let step_inner = inner.clone();
        loop_handle.call_soon(Box::new(move || {
            step_inner.step();
            Ok(())
        }));
        Self { future, inner }
    }

    #[must_use]
    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    /// The outward, awaitable handle for this task's result. Clone it
    /// freely; every clone observes the same terminal state.
    #[must_use]
    pub fn future(&self) -> Future<T> {
        self.future.clone()
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.future.is_done()
    }

    /// Cancels the task: transitions the outward future to cancelled, and
    /// synchronously drops the driving coroutine so anything it was
    /// `.await`ing is released (and, for our own [`Future`]s, cancelled —
    /// see `Future`'s `Drop` impl).
    pub fn cancel(&self) -> bool {
        let did = self.future.cancel();
        if did {
            self.inner.coroutine.lock().take();
        }
        did
    }

    pub fn apply_timeout(&self, seconds: f64) {
        self.future.apply_timeout(seconds);
    }
}

/// Gather/any/exhaust semantics over a set of same-typed futures (spec
/// §4.4). Unlike the source, which allows a heterogeneous group (any
/// awaitable), this groups futures of one result type `T` — the idiomatic
/// Rust shape, since a mixed-type group wouldn't typecheck without boxing
/// every element as `dyn Any` for no real benefit here.
pub struct TaskGroup<T: Clone + Send + 'static> {
    loop_handle: Arc<dyn LoopHandle>,
    state: Arc<Mutex<GroupState<T>>>,
}

struct GroupState<T> {
    all: Vec<Entry<T>>,
    completed: VecDeque<Future<T>>,
    pending: usize,
    waiters: Vec<Waker>,
}

struct Entry<T> {
    future: Future<T>,
    canceller: Box<dyn Fn() + Send + Sync>,
}

impl<T: Clone + Send + 'static> TaskGroup<T> {
    #[must_use]
    pub fn new(loop_handle: Arc<dyn LoopHandle>) -> Self {
        Self {
            loop_handle,
            state: Arc::new(Mutex::new(GroupState {
                all: Vec::new(),
                completed: VecDeque::new(),
                pending: 0,
                waiters: Vec::new(),
            })),
        }
    }

    fn track(&self, future: Future<T>, canceller: Box<dyn Fn() + Send + Sync>) {
        {
            let mut state = self.state.lock();
            state.pending += 1;
            state.all.push(Entry {
                future: future.clone(),
                canceller,
            });
        }

        let state = self.state.clone();
        future.add_done_callback(move |fut| {
            let mut state = state.lock();
            state.completed.push_back(fut);
            state.pending = state.pending.saturating_sub(1);
            for waker in state.waiters.drain(..) {
                waker.wake();
            }
        });
    }

    /// Spawns `coroutine` as a `Task` and adds it to the group.
    pub fn spawn<F>(&self, coroutine: F) -> Task<T>
    where
        F: StdFuture<Output = Result<T>> + Send + 'static,
    {
        let task = Task::spawn(self.loop_handle.clone(), coroutine);
        let cancel_task = task.clone();
        self.track(task.future(), Box::new(move || {
            cancel_task.cancel();
        }));
        task
    }

    /// Adds an externally-constructed future to the group.
    pub fn add(&self, future: Future<T>) {
        let cancel_future = future.clone();
        self.track(future, Box::new(move || {
            cancel_future.cancel();
        }));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().all.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending
    }

    pub fn cancel_all(&self) {
        let state = self.state.lock();
        for entry in &state.all {
            (entry.canceller)();
        }
    }

    pub fn cancel_pending(&self) {
        let state = self.state.lock();
        for entry in &state.all {
            if !entry.future.is_done() {
                (entry.canceller)();
            }
        }
    }

    /// Silences every already-done future (preventing a debug
    /// "unretrieved exception" diagnostic). This operation is meant for
    /// cleanup after the group has fully drained.
    ///
    /// # Errors
    ///
    /// Returns [`EvLoopError::InvalidState`] if any future in the group is
    /// still pending.
    pub fn cancel_done(&self) -> Result<()> {
        let state = self.state.lock();
        if state.pending > 0 {
            return Err(EvLoopError::InvalidState);
        }
        for entry in &state.all {
            entry.future.silence();
        }
        Ok(())
    }

    pub async fn wait_all(&self) {
        std::future::poll_fn(|cx| {
            let mut state = self.state.lock();
            if state.pending == 0 {
                Poll::Ready(())
            } else {
                state.waiters.push(cx.waker().clone());
                Poll::Pending
            }
        })
        .await;
    }

    pub async fn wait_first(&self) -> Option<Future<T>> {
        std::future::poll_fn(|cx| {
            let mut state = self.state.lock();
            if let Some(front) = state.completed.front() {
                Poll::Ready(Some(front.clone()))
            } else if state.pending == 0 {
                Poll::Ready(None)
            } else {
                state.waiters.push(cx.waker().clone());
                Poll::Pending
            }
        })
        .await
    }

    pub async fn wait_first_and_pop(&self) -> Option<Future<T>> {
        std::future::poll_fn(|cx| {
            let mut state = self.state.lock();
            if let Some(front) = state.completed.pop_front() {
                Poll::Ready(Some(front))
            } else if state.pending == 0 {
                Poll::Ready(None)
            } else {
                state.waiters.push(cx.waker().clone());
                Poll::Pending
            }
        })
        .await
    }

    /// Finds the first completed future carrying an exception (or, if
    /// `include_cancelled`, a cancellation). Peeking a future's result here
    /// never consumes it: `get_result` clones out of the cell, so a later
    /// caller still observes the same outcome.
    fn find_exception(state: &GroupState<T>, include_cancelled: bool) -> Option<Future<T>> {
        state.completed.iter().find_map(|fut| {
            let is_match = match fut.state() {
                crate::future::State::Cancelled => include_cancelled,
                crate::future::State::Finished | crate::future::State::Retrieved => {
                    fut.get_result().is_err()
                }
                crate::future::State::Pending => false,
            };
            if is_match {
                Some(fut.clone())
            } else {
                None
            }
        })
    }

    pub async fn wait_first_exception(&self) -> Option<Future<T>> {
        std::future::poll_fn(|cx| {
            let mut state = self.state.lock();
            if let Some(found) = Self::find_exception(&state, false) {
                Poll::Ready(Some(found))
            } else if state.pending == 0 {
                Poll::Ready(None)
            } else {
                state.waiters.push(cx.waker().clone());
                Poll::Pending
            }
        })
        .await
    }

    pub async fn wait_first_exception_and_pop(&self) -> Option<Future<T>> {
        let found = self.wait_first_exception().await;
        if let Some(ref found) = found {
            let mut state = self.state.lock();
            let identity = found.identity();
            state.completed.retain(|fut| fut.identity() != identity);
        }
        found
    }

    pub async fn wait_exception_or_cancellation(&self) -> Option<Future<T>> {
        std::future::poll_fn(|cx| {
            let mut state = self.state.lock();
            if let Some(found) = Self::find_exception(&state, true) {
                Poll::Ready(Some(found))
            } else if state.pending == 0 {
                Poll::Ready(None)
            } else {
                state.waiters.push(cx.waker().clone());
                Poll::Pending
            }
        })
        .await
    }

    /// Pulls the next future to complete, in completion order. Returns
    /// `None` once every future in the group has completed and been
    /// consumed — the polling-method analogue of the source's async
    /// generator `exhaust()`.
    pub async fn exhaust_next(&self) -> Option<Future<T>> {
        self.wait_first_and_pop().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{Callback, ExceptionReporter, Handle, TracingExceptionReporter};
    use crate::handle::ExceptionReporter as _;
    use std::sync::Mutex as StdMutex;

    #[derive(Debug)]
    struct InlineLoop {
        ready: StdMutex<VecDeque<Callback>>,
    }

    impl InlineLoop {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                ready: StdMutex::new(VecDeque::new()),
            })
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
            99
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

    #[test]
    fn task_runs_to_completion() {
        let l = InlineLoop::new();
        let task: Task<i32> = Task::spawn(l.clone(), async { Ok(5) });
        l.run_until_empty();
        assert_eq!(task.future().get_result().unwrap(), 5);
    }

    #[test]
    fn task_cancel_marks_future_cancelled() {
        let l = InlineLoop::new();
        let task: Task<i32> = Task::spawn(l.clone(), std::future::pending());
        l.run_until_empty();
        assert!(task.cancel());
        assert!(matches!(task.future().get_result(), Err(EvLoopError::Cancelled)));
    }
}
