// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Compatibility facade: re-exports `evloop-rt`'s runtime under the names a
//! caller coming from a `asyncio`-shaped async library would expect —
//! `get_event_loop`, `sleep`, `gather`, `wait_for`, `Event`, `Lock`, `Queue`
//! — so a port of code written against that shape needs minimal renaming.
//!
//! This crate adds no behavior of its own beyond the free functions that
//! asyncio models as "ambient current loop" operations; everything else is
//! a direct re-export.

use std::sync::Arc;
use std::time::Duration;

use evloop_rt::error::Result;
use evloop_rt::event_loop::EventThread;
use evloop_rt::future::Future as EvFuture;
use evloop_rt::runtime_handle::LoopHandle;
use evloop_rt::task::{Task, TaskGroup};

pub use evloop_rt::builder::{EventLoopBuilder, ExecutorBuilder};
pub use evloop_rt::sync::{AsyncLifoQueue, Event, Lock, LockGuard, OverflowPolicy, ScarletExecutor};
pub use evloop_rt::sync::AsyncQueue as Queue;

/// `asyncio.get_event_loop()`: the loop running on the calling thread, if
/// any.
#[must_use]
pub fn get_event_loop() -> Option<Arc<EventThread>> {
    evloop_rt::event_loop::current()
}

/// `asyncio.new_event_loop()`.
///
/// # Errors
///
/// Returns the underlying OS error if the selector cannot be created.
pub fn new_event_loop() -> std::io::Result<Arc<EventThread>> {
    EventThread::new()
}

/// `asyncio.sleep(seconds)`: suspends the calling task for `seconds` without
/// blocking the loop thread.
///
/// # Errors
///
/// Returns [`evloop_rt::error::EvLoopError::Cancelled`] if the awaiting task is cancelled
/// before the delay elapses.
pub async fn sleep(loop_handle: Arc<dyn LoopHandle>, seconds: f64) -> Result<()> {
    let future: EvFuture<()> = EvFuture::new(loop_handle.clone());
    let done = future.clone();
    loop_handle.call_after(
        seconds,
        Box::new(move || {
            let _ = done.set_result_if_pending(());
            Ok(())
        }),
    );
    future.await
}

/// `asyncio.wait_for(future, timeout)`: awaits `future`, cancelling and
/// returning [`evloop_rt::error::EvLoopError::Timeout`] if it has not resolved within
/// `timeout`.
///
/// # Errors
///
/// Returns [`evloop_rt::error::EvLoopError::Timeout`] if `future` is still pending once
/// `timeout` elapses, or whatever error `future` itself resolved with.
pub async fn wait_for<T: Clone + Send + 'static>(future: EvFuture<T>, timeout: Duration) -> Result<T> {
    future.apply_timeout(timeout.as_secs_f64());
    future.await
}

/// `asyncio.gather(*futures)`: waits for every future to resolve and returns
/// their results in the original order. The first error encountered (by
/// position) is returned instead, after all futures have settled.
///
/// # Errors
///
/// Returns the first (by position) error among the resolved futures, if
/// any.
pub async fn gather<T: Clone + Send + 'static>(
    loop_handle: Arc<dyn LoopHandle>,
    futures: Vec<EvFuture<T>>,
) -> Result<Vec<T>> {
    let group: TaskGroup<T> = TaskGroup::new(loop_handle);
    for future in &futures {
        group.add(future.clone());
    }
    group.wait_all().await;
    let mut results = Vec::with_capacity(futures.len());
    for future in futures {
        results.push(future.get_result()?);
    }
    Ok(results)
}

/// `asyncio.ensure_future(coroutine)`: spawns `coroutine` as a [`Task`] on
/// `loop_handle`.
pub fn ensure_future<F, T>(loop_handle: Arc<dyn LoopHandle>, coroutine: F) -> Task<T>
where
    F: std::future::Future<Output = Result<T>> + Send + 'static,
    T: Clone + Send + 'static,
{
    Task::spawn(loop_handle, coroutine)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sleep_resolves_after_the_loop_runs_its_timer() {
        let event_loop = new_event_loop().unwrap();
        event_loop.ensure_started();
        let loop_handle = event_loop.as_loop_handle();
        let task = ensure_future(loop_handle.clone(), async move {
            sleep(loop_handle, 0.01).await?;
            Ok(7)
        });
        let start = std::time::Instant::now();
        while !task.is_done() && start.elapsed() < Duration::from_secs(1) {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(task.future().get_result().unwrap(), 7);
        event_loop.stop();
        event_loop.join();
    }

    #[test]
    fn gather_collects_results_in_order() {
        let event_loop = new_event_loop().unwrap();
        event_loop.ensure_started();
        let loop_handle = event_loop.as_loop_handle();

        let a: EvFuture<i32> = EvFuture::new(loop_handle.clone());
        let b: EvFuture<i32> = EvFuture::new(loop_handle.clone());
        a.set_result(1).unwrap();
        b.set_result(2).unwrap();

        let loop_handle_for_gather = loop_handle.clone();
        let task = ensure_future(loop_handle.clone(), async move {
            gather(loop_handle_for_gather, vec![a, b]).await
        });
        let start = std::time::Instant::now();
        while !task.is_done() && start.elapsed() < Duration::from_secs(1) {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(task.future().get_result().unwrap(), vec![1, 2]);
        event_loop.stop();
        event_loop.join();
    }
}
