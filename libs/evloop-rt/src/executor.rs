// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Blocking-work offload pool: [`SyncQueue`]/[`SyncWait`] (the single
//! thread-safe boundary between worker threads and the loop), [`ExecutorThread`],
//! [`Executor`], and [`ClaimedExecutor`].
//!
//! A loop never touches worker state directly; every handoff back onto the
//! loop goes through `LoopHandle::call_soon_thread_safe`.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::{EvLoopError, Result};
use crate::future::Future as EvFuture;
use crate::runtime_handle::LoopHandle;

/// A callable offloaded to an executor thread. Boxed because the pool is
/// generic over no particular return type at the channel level; the result
/// is delivered through the paired [`EvFuture<T>`] instead.
pub type BlockingCallable = Box<dyn FnOnce() -> Result<Box<dyn std::any::Any + Send>> + Send + 'static>;

/// Thread-safe FIFO with an optional bound and a single waiter, used as the
/// one synchronization point between the loop thread (or any caller thread)
/// and an [`ExecutorThread`]'s worker loop.
pub struct SyncQueue<T> {
    state: Mutex<SyncQueueState<T>>,
    condvar: Condvar,
    max_length: Option<usize>,
}

struct SyncQueueState<T> {
    items: VecDeque<T>,
    cancelled: bool,
}

impl<T> SyncQueue<T> {
    #[must_use]
    pub fn new(max_length: Option<usize>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SyncQueueState { items: VecDeque::new(), cancelled: false }),
            condvar: Condvar::new(),
            max_length,
        })
    }

    /// Pushes an item, blocking the caller if the queue has a bound and is
    /// full. Returns `Cancelled` without pushing if the queue was cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`EvLoopError::Cancelled`] if the queue has been cancelled.
    pub fn put(&self, item: T) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.cancelled {
                return Err(EvLoopError::Cancelled);
            }
            match self.max_length {
                Some(max) if state.items.len() >= max => {
                    state = self.condvar.wait(state).unwrap();
                }
                _ => break,
            }
        }
        state.items.push_back(item);
        self.condvar.notify_all();
        Ok(())
    }

    /// Pushes unconditionally even past the bound; used for shutdown
    /// signals that must not be dropped on the floor.
    pub fn force_put(&self, item: T) {
        let mut state = self.state.lock().unwrap();
        state.items.push_back(item);
        self.condvar.notify_all();
    }

    /// Blocks until an item is available or the queue is cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`EvLoopError::Cancelled`] if the queue was cancelled while
    /// the caller was waiting, with nothing left to pop.
    pub fn get(&self) -> Result<T> {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(item) = state.items.pop_front() {
                self.condvar.notify_all();
                return Ok(item);
            }
            if state.cancelled {
                return Err(EvLoopError::Cancelled);
            }
            state = self.condvar.wait(state).unwrap();
        }
    }

    /// Non-blocking variant for pollers (e.g. test harnesses and
    /// `ClaimedExecutor::release` draining checks).
    #[must_use]
    pub fn try_get(&self) -> Option<T> {
        let mut state = self.state.lock().unwrap();
        let item = state.items.pop_front();
        if item.is_some() {
            self.condvar.notify_all();
        }
        item
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves any in-flight waiter with a cancellation signal; further
    /// `get`/`put` calls raise `Cancelled` immediately.
    pub fn cancel(&self) {
        let mut state = self.state.lock().unwrap();
        state.cancelled = true;
        self.condvar.notify_all();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state.lock().unwrap().cancelled
    }
}

impl<T> fmt::Debug for SyncQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("SyncQueue")
            .field("len", &state.items.len())
            .field("cancelled", &state.cancelled)
            .field("max_length", &self.max_length)
            .finish()
    }
}

/// A `(callable, future)` pair queued on an [`ExecutorThread`].
struct ExecutionPair {
    callable: BlockingCallable,
    future: Box<dyn FnOnce(Result<Box<dyn std::any::Any + Send>>) + Send>,
    is_done: Box<dyn Fn() -> bool + Send>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorThreadState {
    Created,
    Running,
    Stopped,
}

/// A single OS worker thread that pops `(callable, future)` pairs off its
/// queue and runs them, reporting results back to the owning loop via
/// `call_soon_thread_safe`.
pub struct ExecutorThread {
    queue: Arc<SyncQueue<ExecutionPair>>,
    state: Arc<Mutex<ExecutorThreadState>>,
    join: Mutex<Option<JoinHandle<()>>>,
    id: u64,
}

impl fmt::Debug for ExecutorThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorThread")
            .field("id", &self.id)
            .field("state", &*self.state.lock().unwrap())
            .finish()
    }
}

static NEXT_EXECUTOR_ID: AtomicUsize = AtomicUsize::new(1);

impl ExecutorThread {
    fn spawn() -> Arc<Self> {
        let queue = SyncQueue::new(None);
        let state = Arc::new(Mutex::new(ExecutorThreadState::Created));
        let id = NEXT_EXECUTOR_ID.fetch_add(1, AtomicOrdering::Relaxed) as u64;

        let worker_queue = queue.clone();
        let worker_state = state.clone();
        *worker_state.lock().unwrap() = ExecutorThreadState::Running;
        let join = std::thread::Builder::new()
            .name(format!("evloop-executor-{id}"))
            .spawn(move || {
                Self::worker_loop(&worker_queue);
                *worker_state.lock().unwrap() = ExecutorThreadState::Stopped;
            })
            .expect("spawning an executor worker thread");

        Arc::new(Self { queue, state, join: Mutex::new(Some(join)), id })
    }

    fn worker_loop(queue: &SyncQueue<ExecutionPair>) {
        loop {
            let pair = match queue.get() {
                Ok(pair) => pair,
                Err(EvLoopError::Cancelled) => break,
                Err(_) => break,
            };
            if (pair.is_done)() {
                continue;
            }
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(pair.callable))
                .unwrap_or_else(|payload| {
                    let msg = payload
                        .downcast_ref::<&str>()
                        .map(|s| (*s).to_string())
                        .or_else(|| payload.downcast_ref::<String>().cloned());
                    tracing::error!(panic = msg.as_deref().unwrap_or("<no message>"), "executor callable panicked");
                    Err(EvLoopError::RuntimeError("executor callable panicked"))
                });
            (pair.future)(outcome);
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn state(&self) -> ExecutorThreadState {
        *self.state.lock().unwrap()
    }

    fn push(&self, pair: ExecutionPair) {
        let _ = self.queue.put(pair);
    }

    fn shutdown(&self) {
        self.queue.cancel();
        if let Some(handle) = self.join.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }
}

/// Disjoint free/running/claimed sets of [`ExecutorThread`]s, with a
/// retention policy that keeps up to `kept_executor_count` idle threads
/// alive and releases the rest gradually (see spec §4.5).
pub struct Executor {
    loop_handle: Arc<dyn LoopHandle>,
    free: Mutex<Vec<Arc<ExecutorThread>>>,
    running: Mutex<Vec<Arc<ExecutorThread>>>,
    claimed: Mutex<Vec<Arc<ExecutorThread>>>,
    kept_executor_count: AtomicUsize,
    previously_used: AtomicUsize,
    release_armed: AtomicBool,
}

/// Seconds an idle executor thread above `kept_executor_count` waits before
/// its first release attempt.
pub const EXECUTOR_RELEASE_INTERVAL: f64 = 0.6;
/// Backoff multiplier applied to the release interval after each release
/// step that still finds threads over the kept count.
pub const EXECUTOR_RELEASE_MULTIPLIER: f64 = 2.5;

impl Executor {
    #[must_use]
    pub fn new(loop_handle: Arc<dyn LoopHandle>) -> Arc<Self> {
        Arc::new(Self {
            loop_handle,
            free: Mutex::new(Vec::new()),
            running: Mutex::new(Vec::new()),
            claimed: Mutex::new(Vec::new()),
            kept_executor_count: AtomicUsize::new(0),
            previously_used: AtomicUsize::new(0),
            release_armed: AtomicBool::new(false),
        })
    }

    fn take_free_or_spawn(&self) -> Arc<ExecutorThread> {
        if let Some(thread) = self.free.lock().unwrap().pop() {
            return thread;
        }
        ExecutorThread::spawn()
    }

    /// Runs `callable` on a free (or freshly spawned) executor thread,
    /// returning a future that resolves with its boxed result.
    pub fn run_in_executor<F, T>(self: &Arc<Self>, callable: F) -> EvFuture<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Clone + Send + 'static,
    {
        let thread = self.take_free_or_spawn();
        self.running.lock().unwrap().push(thread.clone());
        self.previously_used.fetch_add(1, AtomicOrdering::Relaxed);

        let future = EvFuture::new(self.loop_handle.clone());
        let done_future = future.clone();
        let is_done_future = future.clone();

        let this = self.clone();
        let thread_id = thread.id();
        let callback: BlockingCallable = Box::new(move || {
            callable().map(|value| Box::new(value) as Box<dyn std::any::Any + Send>)
        });

        let loop_handle_for_result = self.loop_handle.clone();
        let future_setter: Box<dyn FnOnce(Result<Box<dyn std::any::Any + Send>>) + Send> =
            Box::new(move |result| {
                let done_future = done_future.clone();
                loop_handle_for_result.call_soon_thread_safe(Box::new(move || {
                    match result {
                        Ok(boxed) => {
                            if let Ok(value) = boxed.downcast::<T>() {
                                let _ = done_future.set_result_if_pending(*value);
                            }
                        }
                        Err(err) => {
                            let _ = done_future.set_exception_if_pending(err);
                        }
                    }
                    Ok(())
                }));
            });

        thread.push(ExecutionPair {
            callable: callback,
            future: future_setter,
            is_done: Box::new(move || is_done_future.is_done()),
        });

        future.add_done_callback(move |_| this.return_thread(thread_id));
        future
    }

    fn return_thread(self: &Arc<Self>, thread_id: u64) {
        let mut running = self.running.lock().unwrap();
        if let Some(pos) = running.iter().position(|t| t.id() == thread_id) {
            let thread = running.remove(pos);
            drop(running);
            self.free.lock().unwrap().push(thread);
            self.arm_release_if_needed();
        }
    }

    fn arm_release_if_needed(self: &Arc<Self>) {
        let free_count = self.free.lock().unwrap().len();
        let kept = self.kept_executor_count.load(AtomicOrdering::Relaxed);
        if free_count > kept && !self.release_armed.swap(true, AtomicOrdering::AcqRel) {
            self.schedule_release_step(EXECUTOR_RELEASE_INTERVAL);
        }
    }

    fn schedule_release_step(self: &Arc<Self>, interval: f64) {
        let this = self.clone();
        self.loop_handle.call_after(
            interval,
            Box::new(move || {
                this.release_executor_step(interval);
                Ok(())
            }),
        );
    }

    fn release_executor_step(self: &Arc<Self>, interval: f64) {
        let kept = self.kept_executor_count.load(AtomicOrdering::Relaxed);
        let released = {
            let mut free = self.free.lock().unwrap();
            if free.len() > kept {
                free.pop()
            } else {
                None
            }
        };
        if let Some(thread) = released {
            thread.shutdown();
        }
        let still_over = self.free.lock().unwrap().len() > kept;
        if still_over {
            self.schedule_release_step(interval * EXECUTOR_RELEASE_MULTIPLIER);
        } else {
            self.release_armed.store(false, AtomicOrdering::Release);
        }
    }

    pub fn set_kept_executor_count(&self, count: usize) {
        self.kept_executor_count.store(count, AtomicOrdering::Relaxed);
    }

    /// Reserves one executor thread exclusively. Further work pushed via
    /// [`ClaimedExecutor::execute`] is guaranteed to run in order on that one
    /// thread, and the thread only rejoins `free` once its queue drains.
    pub fn claim_executor(self: &Arc<Self>) -> ClaimedExecutor {
        let thread = self.take_free_or_spawn();
        self.claimed.lock().unwrap().push(thread.clone());
        ClaimedExecutor {
            executor: self.clone(),
            thread: Some(thread),
            loop_handle: self.loop_handle.clone(),
        }
    }

    /// Cancels every pending (not yet started) queued future across all
    /// free/running/claimed threads and signals workers to exit without
    /// draining their queues.
    pub fn cancel_executors(&self) {
        for thread in self
            .free
            .lock()
            .unwrap()
            .drain(..)
            .chain(self.running.lock().unwrap().drain(..))
            .chain(self.claimed.lock().unwrap().drain(..))
            .collect::<Vec<_>>()
        {
            thread.shutdown();
        }
    }

    /// Lets in-flight and already-queued work finish, then joins every
    /// worker thread.
    pub fn release_executors(&self) {
        let threads: Vec<_> = self
            .free
            .lock()
            .unwrap()
            .drain(..)
            .chain(self.running.lock().unwrap().drain(..))
            .chain(self.claimed.lock().unwrap().drain(..))
            .collect();
        for thread in threads {
            while !thread.queue.is_empty() {
                std::thread::sleep(Duration::from_millis(1));
            }
            thread.shutdown();
        }
    }
}

/// An [`ExecutorThread`] reserved exclusively by one caller until
/// [`ClaimedExecutor::release`] is called.
pub struct ClaimedExecutor {
    executor: Arc<Executor>,
    thread: Option<Arc<ExecutorThread>>,
    loop_handle: Arc<dyn LoopHandle>,
}

impl ClaimedExecutor {
    /// Pushes more work onto the claimed thread.
    ///
    /// # Errors
    ///
    /// Returns [`EvLoopError::RuntimeError`] if this handle has already been
    /// released.
    pub fn execute<F, T>(&self, callable: F) -> Result<EvFuture<T>>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Clone + Send + 'static,
    {
        let Some(thread) = &self.thread else {
            return Err(EvLoopError::RuntimeError("claim_executor: already released"));
        };
        let future = EvFuture::new(self.loop_handle.clone());
        let done_future = future.clone();
        let is_done_future = future.clone();
        let loop_handle = self.loop_handle.clone();

        let callback: BlockingCallable =
            Box::new(move || callable().map(|v| Box::new(v) as Box<dyn std::any::Any + Send>));
        let future_setter: Box<dyn FnOnce(Result<Box<dyn std::any::Any + Send>>) + Send> =
            Box::new(move |result| {
                let done_future = done_future.clone();
                loop_handle.call_soon_thread_safe(Box::new(move || {
                    match result {
                        Ok(boxed) => {
                            if let Ok(value) = boxed.downcast::<T>() {
                                let _ = done_future.set_result_if_pending(*value);
                            }
                        }
                        Err(err) => {
                            let _ = done_future.set_exception_if_pending(err);
                        }
                    }
                    Ok(())
                }));
            });

        thread.push(ExecutionPair {
            callable: callback,
            future: future_setter,
            is_done: Box::new(move || is_done_future.is_done()),
        });
        Ok(future)
    }

    /// Releases the thread back to the pool's `free` set once its queue has
    /// fully drained.
    pub fn release(mut self) {
        if let Some(thread) = self.thread.take() {
            let mut claimed = self.executor.claimed.lock().unwrap();
            claimed.retain(|t| t.id() != thread.id());
            drop(claimed);

            while !thread.queue.is_empty() {
                std::thread::sleep(Duration::from_millis(1));
            }
            self.executor.free.lock().unwrap().push(thread);
            self.executor.arm_release_if_needed();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;

    #[derive(Debug)]
    struct InlineLoop {
        ready: Mutex<VecDeque<Box<dyn FnOnce() + Send>>>,
    }

    impl InlineLoop {
        fn new() -> Arc<Self> {
            Arc::new(Self { ready: Mutex::new(VecDeque::new()) })
        }
        fn run_until_empty(&self) {
            loop {
                let next = self.ready.lock().unwrap().pop_front();
                match next {
                    Some(cb) => cb(),
                    None => break,
                }
            }
        }
    }

    impl LoopHandle for InlineLoop {
        fn id(&self) -> u64 {
            1
        }
        fn call_soon(&self, callback: crate::handle::Callback) -> crate::handle::Handle {
            self.call_soon_thread_safe(callback)
        }
        fn call_soon_thread_safe(&self, callback: crate::handle::Callback) -> crate::handle::Handle {
            self.ready.lock().unwrap().push_back(Box::new(move || {
                let _ = callback();
            }));
            crate::handle::Handle::new(Box::new(|| Ok(())))
        }
        fn call_after(&self, _delay_seconds: f64, callback: crate::handle::Callback) -> crate::handle::TimerHandle {
            crate::handle::TimerHandle::new(0.0, callback)
        }
        fn call_at(&self, _when: f64, callback: crate::handle::Callback) -> crate::handle::TimerHandle {
            crate::handle::TimerHandle::new(0.0, callback)
        }
        fn time(&self) -> f64 {
            0.0
        }
        fn exception_reporter(&self) -> &dyn crate::handle::ExceptionReporter {
            &crate::handle::TracingExceptionReporter
        }
        fn is_loop_thread(&self) -> bool {
            true
        }
    }

    #[test]
    fn sync_queue_blocks_until_item_available() {
        let q: Arc<SyncQueue<i32>> = SyncQueue::new(None);
        let q2 = q.clone();
        let handle = std::thread::spawn(move || q2.get().unwrap());
        std::thread::sleep(Duration::from_millis(20));
        q.put(7).unwrap();
        assert_eq!(handle.join().unwrap(), 7);
    }

    #[test]
    fn sync_queue_cancel_unblocks_waiter() {
        let q: Arc<SyncQueue<i32>> = SyncQueue::new(None);
        let q2 = q.clone();
        let handle = std::thread::spawn(move || q2.get());
        std::thread::sleep(Duration::from_millis(20));
        q.cancel();
        assert!(matches!(handle.join().unwrap(), Err(EvLoopError::Cancelled)));
    }

    #[test]
    fn sync_queue_respects_bound() {
        let q: Arc<SyncQueue<i32>> = SyncQueue::new(Some(1));
        q.put(1).unwrap();
        assert_eq!(q.try_get(), Some(1));
    }

    #[test]
    fn executor_thread_runs_blocking_work() {
        let thread = ExecutorThread::spawn();
        let result = Arc::new(AtomicI32::new(0));
        let r = result.clone();
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        thread.push(ExecutionPair {
            callable: Box::new(move || Ok(Box::new(6 * 7) as Box<dyn std::any::Any + Send>)),
            future: Box::new(move |res| {
                if let Ok(boxed) = res {
                    if let Ok(v) = boxed.downcast::<i32>() {
                        r.store(*v, AtomicOrdering::SeqCst);
                    }
                }
                let _ = done_tx.send(());
            }),
            is_done: Box::new(|| false),
        });
        done_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(result.load(AtomicOrdering::SeqCst), 42);
        thread.shutdown();
    }
}
