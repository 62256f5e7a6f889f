// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! [`EventThread`]: the selector-driven scheduling core. Owns the `mio`
//! selector, the lazy timer heap, the ready deque, and the wake-up source
//! that lets other threads unblock a sleeping `poll()`.
//!
//! Exactly one `EventThread` runs per OS thread (spec §5): `ensure_started`
//! spawns a dedicated thread that owns the `mio::Poll` for its lifetime;
//! every other operation reaches the loop through `Arc<EventThread>` and
//! the thread-safe subset of its API.

use std::cell::Cell;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use mio::{Events, Interest, Poll, Registry, Token};

use crate::clock::{clock_resolution, loop_time};
use crate::error::{EvLoopError, Result};
use crate::executor::{ClaimedExecutor, Executor};
use crate::future::{next_loop_id, Future as EvFuture};
use crate::handle::{Callback, ExceptionReporter, Handle, TracingExceptionReporter, WeakTimerHandle};
use crate::runtime_handle::LoopHandle;
use crate::task::{Task, TaskGroup};

const WAKE_TOKEN: Token = Token(usize::MAX);

thread_local! {
    static RUNNING_LOOP_ID: Cell<Option<u64>> = const { Cell::new(None) };
    static CURRENT_EVENT_LOOP: std::cell::RefCell<Option<Arc<EventThread>>> =
        const { std::cell::RefCell::new(None) };
}

/// The loop running on the calling thread, if any — the analogue of
/// `asyncio.get_event_loop()` for code that doesn't carry its own
/// `Arc<dyn LoopHandle>` around.
#[must_use]
pub fn current() -> Option<Arc<EventThread>> {
    CURRENT_EVENT_LOOP.with(|cell| cell.borrow().clone())
}

/// An async generator as spec §4.2 uses the term: anything that needs an
/// asynchronous close pass before the loop can be considered fully drained.
/// The source installs this via process-wide first-iteration/finalizer
/// hooks; Rust has no generator-level hook point, so registration here is
/// explicit — a generator registers itself (typically on first poll) and
/// its [`AsyncGeneratorHandle`] deregisters it on drop (the finalizer).
pub trait AsyncGenerator: Send + Sync {
    fn aclose(&self) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + '_>>;
}

/// Deregisters its generator from the owning loop's tracking set on drop —
/// the Rust analogue of the source's finalizer hook.
#[must_use]
pub struct AsyncGeneratorHandle {
    event_loop: Weak<EventThread>,
    id: u64,
}

impl Drop for AsyncGeneratorHandle {
    fn drop(&mut self) {
        if let Some(event_loop) = self.event_loop.upgrade() {
            event_loop.async_generators.lock().unwrap().remove(&self.id);
        }
    }
}

/// A reusable fd-readiness callback (spec §4.2's `add_reader`/`add_writer`):
/// unlike a [`Handle`], which runs its stored closure at most once, an I/O
/// registration must keep firing for as long as it stays registered — a
/// socket does not stop becoming readable after its first byte. Each
/// readiness event wraps this `Arc<dyn Fn>` in a fresh one-shot [`Handle`]
/// for the ready deque instead of consuming a handle stored long-term.
pub type IoCallback = Arc<dyn Fn() -> Result<()> + Send + Sync>;

#[derive(Default)]
struct FdRegistration {
    reader: Option<IoCallback>,
    writer: Option<IoCallback>,
}

impl FdRegistration {
    fn interest(&self) -> Option<Interest> {
        match (self.reader.is_some(), self.writer.is_some()) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

struct IoTable {
    fds: HashMap<RawFd, FdRegistration>,
}

fn token_for_fd(fd: RawFd) -> Token {
    // `fd` is always non-negative for a valid descriptor; offsetting by one
    // keeps Token(0) distinguishable from a registered fd 0 (stdin), and
    // `WAKE_TOKEN` is reserved at `usize::MAX` so it can never collide.
    let fd = usize::try_from(fd).expect("registered fd is non-negative");
    Token(fd + 1)
}

fn fd_from_token(token: Token) -> RawFd {
    RawFd::try_from(token.0 - 1).expect("token derived from a valid fd")
}

/// Single-threaded-per-OS-thread selector-driven scheduler: the ready
/// deque, the lazy timer heap, fd readiness registration, and the thread-safe
/// wake-up path that lets other threads enqueue work.
pub struct EventThread {
    id: u64,
    self_weak: Weak<EventThread>,
    registry: Registry,
    waker: mio::Waker,
    io: Mutex<IoTable>,
    ready: Mutex<VecDeque<Handle>>,
    scheduled: Mutex<BinaryHeap<std::cmp::Reverse<crate::handle::TimerHandle>>>,
    weak_scheduled: Mutex<BinaryHeap<std::cmp::Reverse<WeakTimerHandle>>>,
    should_run: AtomicBool,
    running: AtomicBool,
    started: AtomicBool,
    owner_thread: Mutex<Option<std::thread::ThreadId>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    startup_gate: (Mutex<bool>, Condvar),
    reporter: Arc<dyn ExceptionReporter>,
    executor: OnceLock<Arc<Executor>>,
    async_generators: Mutex<HashMap<u64, Weak<dyn AsyncGenerator>>>,
    next_async_generator_id: AtomicU64,
}

impl fmt::Debug for EventThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventThread")
            .field("id", &self.id)
            .field("started", &self.started.load(AtomicOrdering::Relaxed))
            .field("running", &self.running.load(AtomicOrdering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl EventThread {
    /// Creates a loop without starting its thread. The selector, the
    /// wake-up source, and the ready/timer containers all exist immediately
    /// so `call_soon`/`add_reader`/etc. are usable before the loop thread is
    /// ever spawned; only `run`/`ensure_started` actually dispatches them.
    ///
    /// # Errors
    ///
    /// Returns an [`io::Error`] if the selector or its wake-up source fail
    /// to initialize.
    pub fn new() -> io::Result<Arc<Self>> {
        Self::with_reporter(Arc::new(TracingExceptionReporter))
    }

    /// # Errors
    ///
    /// Returns an [`io::Error`] if the selector or its wake-up source fail
    /// to initialize.
    pub fn with_reporter(reporter: Arc<dyn ExceptionReporter>) -> io::Result<Arc<Self>> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = mio::Waker::new(&registry, WAKE_TOKEN)?;
        let id = next_loop_id();

        Ok(Arc::new_cyclic(move |weak| {
            let this = EventThread {
                id,
                self_weak: weak.clone(),
                registry,
                waker,
                io: Mutex::new(IoTable { fds: HashMap::new() }),
                ready: Mutex::new(VecDeque::new()),
                scheduled: Mutex::new(BinaryHeap::new()),
                weak_scheduled: Mutex::new(BinaryHeap::new()),
                should_run: AtomicBool::new(false),
                running: AtomicBool::new(false),
                started: AtomicBool::new(false),
                owner_thread: Mutex::new(None),
                thread: Mutex::new(None),
                startup_gate: (Mutex::new(false), Condvar::new()),
                reporter,
                executor: OnceLock::new(),
                async_generators: Mutex::new(HashMap::new()),
                next_async_generator_id: AtomicU64::new(0),
            };
            // `poll` itself (not just its registry) is parked here until a
            // thread actually calls `ensure_started`; see that method. Keyed
            // process-wide rather than per-thread: nothing stops the `Arc`
            // returned here from being handed to a different thread before
            // `ensure_started` runs, and a thread-local parking spot would
            // make that thread's `ensure_started` silently fall back to an
            // unregistered `Poll` while `add_reader`/`add_writer` kept
            // targeting the original selector.
            PARKED_POLL.lock().unwrap().insert(id, poll);
            this
        }))
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn as_loop_handle(&self) -> Arc<dyn LoopHandle> {
        self.self_weak.upgrade().expect("EventThread outlives its own handles") as Arc<dyn LoopHandle>
    }

    fn executor(&self) -> &Arc<Executor> {
        self.executor.get_or_init(|| Executor::new(self.as_loop_handle()))
    }

    /// Spawns the loop's dedicated OS thread if it has not started yet.
    /// Blocks the calling thread until the new thread has entered its run
    /// loop (the "startup barrier" of spec §4.2).
    pub fn ensure_started(self: &Arc<Self>) {
        if self.started.swap(true, AtomicOrdering::AcqRel) {
            return;
        }
        self.should_run.store(true, AtomicOrdering::Release);
        let this = self.clone();
        let poll = PARKED_POLL
            .lock()
            .unwrap()
            .remove(&self.id)
            .unwrap_or_else(|| Poll::new().expect("fallback selector"));
        let handle = std::thread::Builder::new()
            .name(format!("evloop-{}", self.id))
            .spawn(move || this.thread_main(poll))
            .expect("spawning the event loop thread");
        *self.thread.lock().unwrap() = Some(handle);

        let (lock, cvar) = &self.startup_gate;
        let mut started = lock.lock().unwrap();
        while !*started {
            started = cvar.wait(started).unwrap();
        }
    }

    fn thread_main(self: Arc<Self>, mut poll: Poll) {
        *self.owner_thread.lock().unwrap() = Some(std::thread::current().id());
        RUNNING_LOOP_ID.with(|cell| cell.set(Some(self.id)));
        CURRENT_EVENT_LOOP.with(|cell| *cell.borrow_mut() = Some(self.clone()));
        self.running.store(true, AtomicOrdering::Release);
        {
            let (lock, cvar) = &self.startup_gate;
            *lock.lock().unwrap() = true;
            cvar.notify_all();
        }

        let mut events = Events::with_capacity(256);
        while self.should_run.load(AtomicOrdering::Acquire) {
            self.tick(&mut poll, &mut events);
        }

        self.running.store(false, AtomicOrdering::Release);
        if let Some(executor) = self.executor.get() {
            executor.cancel_executors();
        }
        CURRENT_EVENT_LOOP.with(|cell| *cell.borrow_mut() = None);
    }

    /// Runs exactly one iteration of spec §4.2's runner algorithm: drain due
    /// timers into `ready`, compute a `poll` timeout from whatever remains,
    /// dispatch readiness events, then drain `ready`.
    fn tick(&self, poll: &mut Poll, events: &mut Events) {
        let timeout_horizon = loop_time() + clock_resolution();
        {
            let mut scheduled = self.scheduled.lock().unwrap();
            let mut ready = self.ready.lock().unwrap();
            while let Some(std::cmp::Reverse(top)) = scheduled.peek() {
                if top.when() >= timeout_horizon {
                    break;
                }
                let std::cmp::Reverse(handle) = scheduled.pop().unwrap();
                if !handle.is_cancelled() {
                    ready.push_back(handle.as_handle().clone());
                }
            }
        }
        {
            let mut weak_scheduled = self.weak_scheduled.lock().unwrap();
            let mut ready = self.ready.lock().unwrap();
            let reporter = self.reporter.clone();
            while let Some(std::cmp::Reverse(top)) = weak_scheduled.peek() {
                if top.when() >= timeout_horizon {
                    break;
                }
                let std::cmp::Reverse(weak) = weak_scheduled.pop().unwrap();
                if !weak.is_cancelled() {
                    let reporter = reporter.clone();
                    ready.push_back(Handle::new(Box::new(move || {
                        weak.run(reporter.as_ref());
                        Ok(())
                    })));
                }
            }
        }

        let select_timeout = {
            let ready_empty = self.ready.lock().unwrap().is_empty();
            if !ready_empty {
                Some(Duration::ZERO)
            } else {
                let scheduled = self.scheduled.lock().unwrap();
                let weak_scheduled = self.weak_scheduled.lock().unwrap();
                let next_when = [
                    scheduled.peek().map(|std::cmp::Reverse(top)| top.when()),
                    weak_scheduled.peek().map(|std::cmp::Reverse(top)| top.when()),
                ]
                .into_iter()
                .flatten()
                .fold(None, |acc: Option<f64>, when| Some(acc.map_or(when, |acc| acc.min(when))));
                next_when.map(|when| Duration::from_secs_f64((when - loop_time()).max(0.0)))
            }
        };

        match poll.poll(events, select_timeout) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return,
            Err(err) => {
                self.reporter.report("selector poll", &err);
                return;
            }
        }

        for event in events.iter() {
            let token = event.token();
            if token == WAKE_TOKEN {
                continue;
            }
            let fd = fd_from_token(token);
            let mut io = self.io.lock().unwrap();
            let Some(registration) = io.fds.get_mut(&fd) else { continue };

            if event.is_readable() {
                if let Some(cb) = registration.reader.clone() {
                    self.ready.lock().unwrap().push_back(Handle::new(Box::new(move || cb())));
                }
            }
            if event.is_writable() {
                if let Some(cb) = registration.writer.clone() {
                    self.ready.lock().unwrap().push_back(Handle::new(Box::new(move || cb())));
                }
            }
            self.sync_registration(fd, &mut io);
        }

        let due: Vec<Handle> = {
            let mut ready = self.ready.lock().unwrap();
            std::mem::take(&mut *ready).into_iter().collect()
        };
        for handle in due {
            handle.run(self.reporter.as_ref());
        }
    }

    fn sync_registration(&self, fd: RawFd, io: &mut IoTable) {
        use mio::unix::SourceFd;
        let Some(registration) = io.fds.get(&fd) else { return };
        match registration.interest() {
            Some(interest) => {
                let mut source = SourceFd(&fd);
                if self.registry.reregister(&mut source, token_for_fd(fd), interest).is_err() {
                    let _ = self.registry.register(&mut source, token_for_fd(fd), interest);
                }
            }
            None => {
                let mut source = SourceFd(&fd);
                let _ = self.registry.deregister(&mut source);
                io.fds.remove(&fd);
            }
        }
    }

    /// Registers (replacing any existing reader) `callback` to run every
    /// time `fd` becomes readable.
    pub fn add_reader(&self, fd: RawFd, callback: IoCallback) {
        let mut io = self.io.lock().unwrap();
        let entry = io.fds.entry(fd).or_default();
        entry.reader = Some(callback);
        self.sync_registration(fd, &mut io);
    }

    /// Registers (replacing any existing writer) `callback` to run every
    /// time `fd` becomes writable.
    pub fn add_writer(&self, fd: RawFd, callback: IoCallback) {
        let mut io = self.io.lock().unwrap();
        let entry = io.fds.entry(fd).or_default();
        entry.writer = Some(callback);
        self.sync_registration(fd, &mut io);
    }

    pub fn remove_reader(&self, fd: RawFd) -> bool {
        let mut io = self.io.lock().unwrap();
        let Some(entry) = io.fds.get_mut(&fd) else { return false };
        let had = entry.reader.take().is_some();
        if had {
            self.sync_registration(fd, &mut io);
        }
        had
    }

    pub fn remove_writer(&self, fd: RawFd) -> bool {
        let mut io = self.io.lock().unwrap();
        let Some(entry) = io.fds.get_mut(&fd) else { return false };
        let had = entry.writer.take().is_some();
        if had {
            self.sync_registration(fd, &mut io);
        }
        had
    }

    /// Writes a wake-up to the selector's wake source; a no-op (from
    /// `mio::Waker`'s own coalescing) if a wake-up is already pending.
    pub fn wake_up(&self) {
        let _ = self.waker.wake();
    }

    pub fn call_soon(&self, callback: Callback) -> Handle {
        let handle = Handle::new(callback);
        self.ready.lock().unwrap().push_back(handle.clone());
        handle
    }

    pub fn call_soon_thread_safe(&self, callback: Callback) -> Handle {
        let handle = self.call_soon(callback);
        self.wake_up();
        handle
    }

    /// Like `call_soon_thread_safe`, but only wakes the selector if the
    /// loop thread has already started; otherwise the callback simply waits
    /// in `ready` for whenever the loop starts.
    pub fn call_soon_thread_safe_lazy(&self, callback: Callback) -> Handle {
        let handle = self.call_soon(callback);
        if self.started.load(AtomicOrdering::Acquire) {
            self.wake_up();
        }
        handle
    }

    pub fn call_after(&self, delay_seconds: f64, callback: Callback) -> crate::handle::TimerHandle {
        self.call_at(loop_time() + delay_seconds, callback)
    }

    pub fn call_at(&self, when: f64, callback: Callback) -> crate::handle::TimerHandle {
        let timer = crate::handle::TimerHandle::new(when, callback);
        self.scheduled.lock().unwrap().push(std::cmp::Reverse(timer.clone()));
        self.wake_up();
        timer
    }

    /// Like [`EventThread::call_after`], but `callback` is held weakly:
    /// the caller owns `callback` (or a clone of it) and the loop only sees
    /// a [`Weak`] reference. If every strong reference is dropped before the
    /// deadline, the returned handle auto-cancels instead of running.
    #[must_use]
    pub fn call_after_weak(
        &self,
        delay_seconds: f64,
        callback: &Arc<Mutex<Option<Callback>>>,
    ) -> WeakTimerHandle {
        self.call_at_weak(loop_time() + delay_seconds, callback)
    }

    #[must_use]
    pub fn call_at_weak(&self, when: f64, callback: &Arc<Mutex<Option<Callback>>>) -> WeakTimerHandle {
        let weak = WeakTimerHandle::new(when, callback);
        self.weak_scheduled.lock().unwrap().push(std::cmp::Reverse(weak.clone()));
        self.wake_up();
        weak
    }

    #[must_use]
    pub fn time(&self) -> f64 {
        loop_time()
    }

    #[must_use]
    pub fn is_loop_thread(&self) -> bool {
        RUNNING_LOOP_ID.with(Cell::get) == Some(self.id)
    }

    /// Idempotent. From the loop thread, clears `should_run` directly; from
    /// any other thread, schedules the clear and wakes the selector so the
    /// in-flight `poll()` returns promptly.
    pub fn stop(self: &Arc<Self>) {
        if self.is_loop_thread() {
            self.should_run.store(false, AtomicOrdering::Release);
        } else {
            let this = self.clone();
            self.call_soon_thread_safe(Box::new(move || {
                this.should_run.store(false, AtomicOrdering::Release);
                Ok(())
            }));
        }
    }

    /// Blocks the calling thread until the loop stops. Only meaningful when
    /// called from outside the loop thread.
    pub fn join(&self) {
        let handle = self.thread.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    #[must_use]
    pub fn run_in_executor<F, T>(self: &Arc<Self>, callable: F) -> EvFuture<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Clone + Send + 'static,
    {
        self.executor().run_in_executor(callable)
    }

    #[must_use]
    pub fn claim_executor(self: &Arc<Self>) -> ClaimedExecutor {
        self.executor().claim_executor()
    }

    pub fn set_kept_executor_count(self: &Arc<Self>, count: usize) {
        self.executor().set_kept_executor_count(count);
    }

    /// Spawns `coroutine` as a [`Task`] bound to this loop.
    pub fn create_task<F, T>(self: &Arc<Self>, coroutine: F) -> Task<T>
    where
        F: std::future::Future<Output = Result<T>> + Send + 'static,
        T: Clone + Send + 'static,
    {
        Task::spawn(self.as_loop_handle(), coroutine)
    }

    /// Like `create_task`, but callable from any thread: wakes the selector
    /// after scheduling the task's first step.
    pub fn create_task_thread_safe<F, T>(self: &Arc<Self>, coroutine: F) -> Task<T>
    where
        F: std::future::Future<Output = Result<T>> + Send + 'static,
        T: Clone + Send + 'static,
    {
        let task = self.create_task(coroutine);
        self.wake_up();
        task
    }

    #[must_use]
    pub fn new_task_group<T: Clone + Send + 'static>(self: &Arc<Self>) -> TaskGroup<T> {
        TaskGroup::new(self.as_loop_handle())
    }

    /// Bridges a future bound to a different loop onto this one: spawns a
    /// done-callback on the source loop (which always runs through that
    /// loop's own `call_soon`) that forwards the result here via
    /// `call_soon_thread_safe`. Cancelling the returned future cancels the
    /// source.
    #[must_use]
    pub fn wrap_foreign_future<T: Clone + Send + 'static>(self: &Arc<Self>, source: EvFuture<T>) -> EvFuture<T> {
        if source.loop_id() == self.id {
            return source;
        }
        let bridged = EvFuture::new(self.as_loop_handle());
        let forward_target = bridged.clone();
        let destination = self.as_loop_handle();
        source.add_done_callback(move |done| {
            let forward_target = forward_target.clone();
            destination.call_soon_thread_safe(Box::new(move || {
                match done.get_result() {
                    Ok(value) => {
                        let _ = forward_target.set_result_if_pending(value);
                    }
                    Err(EvLoopError::Cancelled) => {
                        forward_target.cancel();
                    }
                    Err(err) => {
                        let _ = forward_target.set_exception_if_pending(err);
                    }
                }
                Ok(())
            }));
        });
        bridged
    }

    pub fn exception_reporter(&self) -> &dyn ExceptionReporter {
        self.reporter.as_ref()
    }

    /// Tracks `generator` on this loop until its returned handle is dropped.
    /// Spec §4.2's "first-iteration hook": generator implementations call
    /// this the first time they're polled.
    pub fn register_async_generator(&self, generator: Arc<dyn AsyncGenerator>) -> AsyncGeneratorHandle {
        let id = self.next_async_generator_id.fetch_add(1, AtomicOrdering::Relaxed);
        self.async_generators.lock().unwrap().insert(id, Arc::downgrade(&generator));
        AsyncGeneratorHandle {
            event_loop: self.self_weak.clone(),
            id,
        }
    }

    /// Runs `aclose` on every still-registered async generator in parallel
    /// via a `TaskGroup`, logging any exception other than cancellation
    /// through this loop's exception reporter (spec §4.2).
    #[must_use]
    pub fn shutdown_async_generators(self: &Arc<Self>) -> Task<()> {
        let generators: Vec<Arc<dyn AsyncGenerator>> = {
            let mut table = self.async_generators.lock().unwrap();
            table.retain(|_, weak| weak.strong_count() > 0);
            table.values().filter_map(Weak::upgrade).collect()
        };
        let loop_handle = self.as_loop_handle();
        let reporter_loop = self.clone();
        self.create_task(async move {
            let group: TaskGroup<()> = TaskGroup::new(loop_handle);
            for generator in generators {
                group.spawn(async move { generator.aclose().await });
            }
            group.wait_all().await;
            while let Some(done) = group.exhaust_next().await {
                match done.get_result() {
                    Ok(()) | Err(EvLoopError::Cancelled) => {}
                    Err(err) => reporter_loop.reporter.report("async generator aclose", &err),
                }
            }
            Ok(())
        })
    }
}

impl LoopHandle for EventThread {
    fn id(&self) -> u64 {
        self.id
    }
    fn call_soon(&self, callback: Callback) -> Handle {
        EventThread::call_soon(self, callback)
    }
    fn call_soon_thread_safe(&self, callback: Callback) -> Handle {
        EventThread::call_soon_thread_safe(self, callback)
    }
    fn call_after(&self, delay_seconds: f64, callback: Callback) -> crate::handle::TimerHandle {
        EventThread::call_after(self, delay_seconds, callback)
    }
    fn call_at(&self, when: f64, callback: Callback) -> crate::handle::TimerHandle {
        EventThread::call_at(self, when, callback)
    }
    fn time(&self) -> f64 {
        EventThread::time(self)
    }
    fn exception_reporter(&self) -> &dyn ExceptionReporter {
        EventThread::exception_reporter(self)
    }
    fn is_loop_thread(&self) -> bool {
        EventThread::is_loop_thread(self)
    }
}

// `Poll` cannot be stored in `EventThread` before the loop thread exists
// (it is not `Sync`, and we want the same selector instance used for every
// `add_reader`/`add_writer` registered before `ensure_started`); parking it
// here by loop id lets construction finish without a thread, and
// `ensure_started` reclaims it for the thread that ends up owning it. A
// process-wide table, not a thread-local one: the constructing thread and
// the thread that eventually calls `ensure_started` are not required to be
// the same thread (an `Arc<EventThread>` is freely shareable), and a
// thread-local table would only ever be visible to the thread that inserted
// into it.
static PARKED_POLL: Mutex<HashMap<u64, Poll>> = Mutex::new(HashMap::new());

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    #[test]
    fn call_soon_runs_in_fifo_order_within_a_tick() {
        let loop_ = EventThread::new().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        loop_.ensure_started();
        for i in 0..5 {
            let order = order.clone();
            loop_.call_soon_thread_safe(Box::new(move || {
                order.lock().unwrap().push(i);
                Ok(())
            }));
        }
        std::thread::sleep(Duration::from_millis(50));
        loop_.stop();
        loop_.join();
        assert_eq!(&*order.lock().unwrap(), &[0, 1, 2, 3, 4]);
    }

    #[test]
    fn timers_fire_in_order_scenario() {
        let loop_ = EventThread::new().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        loop_.ensure_started();
        let o1 = order.clone();
        let o2 = order.clone();
        loop_.call_after(0.02, Box::new(move || {
            o1.lock().unwrap().push("b");
            Ok(())
        }));
        loop_.call_after(0.01, Box::new(move || {
            o2.lock().unwrap().push("a");
            Ok(())
        }));
        std::thread::sleep(Duration::from_millis(80));
        loop_.stop();
        loop_.join();
        assert_eq!(&*order.lock().unwrap(), &["a", "b"]);
    }

    #[test]
    fn thread_safe_wake_observed_quickly_scenario() {
        let loop_ = EventThread::new().unwrap();
        loop_.ensure_started();
        let seen = Arc::new(AtomicBool::new(false));
        let seen2 = seen.clone();
        let start = Instant::now();
        loop_.call_soon_thread_safe(Box::new(move || {
            seen2.store(true, AtomicOrdering::SeqCst);
            Ok(())
        }));
        while !seen.load(AtomicOrdering::SeqCst) && start.elapsed() < Duration::from_millis(200) {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(seen.load(AtomicOrdering::SeqCst));
        loop_.stop();
        loop_.join();
    }

    #[test]
    fn executor_offload_keeps_loop_responsive_scenario() {
        let loop_ = EventThread::new().unwrap();
        loop_.ensure_started();
        let tick_count = Arc::new(AtomicUsize::new(0));
        let tc = tick_count.clone();
        loop_.call_after(0.005, Box::new(move || {
            tc.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(())
        }));
        let future = loop_.run_in_executor(|| {
            std::thread::sleep(Duration::from_millis(30));
            Ok(5040)
        });
        let start = Instant::now();
        while !future.is_done() && start.elapsed() < Duration::from_secs(1) {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(future.get_result().unwrap(), 5040);
        assert_eq!(tick_count.load(AtomicOrdering::SeqCst), 1);
        loop_.stop();
        loop_.join();
    }

    struct CountingGenerator {
        closed: Arc<AtomicUsize>,
    }

    impl AsyncGenerator for CountingGenerator {
        fn aclose(&self) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move {
                self.closed.fetch_add(1, AtomicOrdering::SeqCst);
                Ok(())
            })
        }
    }

    #[test]
    fn shutdown_async_generators_closes_every_live_registration() {
        let loop_ = EventThread::new().unwrap();
        loop_.ensure_started();

        let closed = Arc::new(AtomicUsize::new(0));
        let first: Arc<dyn AsyncGenerator> = Arc::new(CountingGenerator { closed: closed.clone() });
        let second: Arc<dyn AsyncGenerator> = Arc::new(CountingGenerator { closed: closed.clone() });
        let handle_a = loop_.register_async_generator(first);
        let handle_b = loop_.register_async_generator(second.clone());
        drop(handle_a);
        // `second` stays alive via `second` itself, so its registration
        // survives dropping its guard's sibling.
        let _ = &handle_b;

        let shutdown = loop_.shutdown_async_generators();
        let start = Instant::now();
        while !shutdown.is_done() && start.elapsed() < Duration::from_secs(1) {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(shutdown.future().get_result().is_ok());
        assert_eq!(closed.load(AtomicOrdering::SeqCst), 1);

        drop(second);
        loop_.stop();
        loop_.join();
    }

    #[test]
    fn weak_timer_fires_while_its_callback_handle_is_kept_alive() {
        let loop_ = EventThread::new().unwrap();
        loop_.ensure_started();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let cell: Arc<Mutex<Option<Callback>>> = Arc::new(Mutex::new(Some(Box::new(move || {
            c.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(())
        }))));
        let weak = loop_.call_after_weak(0.01, &cell);
        let start = Instant::now();
        while count.load(AtomicOrdering::SeqCst) == 0 && start.elapsed() < Duration::from_secs(1) {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(count.load(AtomicOrdering::SeqCst), 1);
        assert!(!weak.is_cancelled());
        loop_.stop();
        loop_.join();
    }

    #[test]
    fn weak_timer_never_fires_once_its_callback_handle_is_dropped() {
        let loop_ = EventThread::new().unwrap();
        loop_.ensure_started();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let cell: Arc<Mutex<Option<Callback>>> = Arc::new(Mutex::new(Some(Box::new(move || {
            c.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(())
        }))));
        let weak = loop_.call_after_weak(0.01, &cell);
        drop(cell);
        assert!(weak.is_cancelled());
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(AtomicOrdering::SeqCst), 0);
        loop_.stop();
        loop_.join();
    }

    #[test]
    fn stop_is_idempotent() {
        let loop_ = EventThread::new().unwrap();
        loop_.ensure_started();
        loop_.stop();
        loop_.stop();
        loop_.join();
    }
}
