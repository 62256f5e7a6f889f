// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Cross-loop bridges: [`FutureAsyncWrapper`] (future bound to loop A,
//! observed as a future bound to loop B) and [`FutureSyncWrapper`] (future
//! bound to some loop, observed by a plain OS thread blocking on it).
//!
//! A [`crate::future::Future`] only ever schedules its callbacks through the
//! loop it was constructed on (spec §3), so code on a different loop or on no
//! loop at all needs an explicit forwarding hop. Both wrappers here install a
//! single `add_done_callback` on the source and fan its outcome out through
//! the target's own scheduling primitive (`call_soon_thread_safe` for a
//! loop, a `Condvar` for a blocking thread).

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::error::{EvLoopError, Result};
use crate::future::Future as EvFuture;
use crate::runtime_handle::LoopHandle;

/// Bridges a future bound to one loop onto another loop. Cancelling the
/// wrapper cancels the source; the source completing forwards its outcome
/// onto the target loop.
pub struct FutureAsyncWrapper<T: Clone + Send + 'static> {
    target: EvFuture<T>,
}

impl<T: Clone + Send + 'static> FutureAsyncWrapper<T> {
    #[must_use]
    pub fn new(target_loop: Arc<dyn LoopHandle>, source: EvFuture<T>) -> Self {
        let target = EvFuture::new(target_loop.clone());
        let forward = target.clone();
        source.add_done_callback(move |done| {
            let forward = forward.clone();
            target_loop.call_soon_thread_safe(Box::new(move || {
                match done.get_result() {
                    Ok(value) => {
                        let _ = forward.set_result_if_pending(value);
                    }
                    Err(EvLoopError::Cancelled) => {
                        forward.cancel();
                    }
                    Err(err) => {
                        let _ = forward.set_exception_if_pending(err);
                    }
                }
                Ok(())
            }));
        });
        Self { target }
    }

    /// The future to `.await` on the target loop.
    #[must_use]
    pub fn future(&self) -> EvFuture<T> {
        self.target.clone()
    }
}

/// Bridges a future bound to some loop onto a plain OS thread that has no
/// loop of its own: blocks the calling thread until the source resolves.
pub struct FutureSyncWrapper<T: Clone + Send + 'static> {
    state: Arc<(Mutex<Option<Result<T>>>, Condvar)>,
}

impl<T: Clone + Send + 'static> FutureSyncWrapper<T> {
    #[must_use]
    pub fn new(source: EvFuture<T>) -> Self {
        let state = Arc::new((Mutex::new(None), Condvar::new()));
        let wait_state = state.clone();
        source.add_done_callback(move |done| {
            let (lock, cvar) = &*wait_state;
            *lock.lock().unwrap() = Some(done.get_result());
            cvar.notify_all();
        });
        Self { state }
    }

    /// Blocks until the source resolves, returning its outcome.
    ///
    /// # Errors
    ///
    /// Returns whatever error or cancellation the source future resolved
    /// with.
    pub fn wait_for_completion(&self) -> Result<T> {
        let (lock, cvar) = &*self.state;
        let mut guard = lock.lock().unwrap();
        while guard.is_none() {
            guard = cvar.wait(guard).unwrap();
        }
        guard.clone().expect("checked above")
    }

    /// Blocks for at most `timeout`, returning `Err(EvLoopError::Timeout)` if
    /// the source has not resolved by then.
    ///
    /// # Errors
    ///
    /// Returns [`EvLoopError::Timeout`] if `timeout` elapses first, or
    /// whatever error/cancellation the source future resolved with.
    pub fn wait(&self, timeout: Duration) -> Result<T> {
        let (lock, cvar) = &*self.state;
        let guard = lock.lock().unwrap();
        let (guard, result) = cvar
            .wait_timeout_while(guard, timeout, |value| value.is_none())
            .unwrap();
        if result.timed_out() {
            Err(EvLoopError::Timeout)
        } else {
            guard.clone().expect("checked by wait_timeout_while")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{Callback, ExceptionReporter, Handle, TracingExceptionReporter};
    use std::sync::Mutex as StdMutex;

    #[derive(Debug)]
    struct InlineLoop {
        ready: StdMutex<Vec<Callback>>,
        id: u64,
    }

    impl InlineLoop {
        fn new(id: u64) -> Arc<Self> {
            Arc::new(Self { ready: StdMutex::new(Vec::new()), id })
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
            self.id
        }
        fn call_soon(&self, callback: Callback) -> Handle {
            self.ready.lock().unwrap().push(callback);
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
    fn async_wrapper_forwards_result_to_target_loop() {
        let source_loop = InlineLoop::new(1);
        let target_loop = InlineLoop::new(2);
        let source: EvFuture<i32> = EvFuture::new(source_loop.clone());
        let wrapper = FutureAsyncWrapper::new(target_loop.clone(), source.clone());
        source.set_result(9).unwrap();
        source_loop.drain();
        target_loop.drain();
        assert_eq!(wrapper.future().get_result().unwrap(), 9);
    }

    #[test]
    fn sync_wrapper_blocks_until_resolved() {
        let source_loop = InlineLoop::new(1);
        let source: EvFuture<i32> = EvFuture::new(source_loop.clone());
        let wrapper = Arc::new(FutureSyncWrapper::new(source.clone()));
        let waiter = wrapper.clone();
        let handle = std::thread::spawn(move || waiter.wait_for_completion());
        std::thread::sleep(Duration::from_millis(20));
        source.set_result(4).unwrap();
        source_loop.drain();
        assert_eq!(handle.join().unwrap().unwrap(), 4);
    }

    #[test]
    fn sync_wrapper_times_out() {
        let source_loop = InlineLoop::new(1);
        let source: EvFuture<i32> = EvFuture::new(source_loop);
        let wrapper = FutureSyncWrapper::new(source);
        assert!(matches!(wrapper.wait(Duration::from_millis(10)), Err(EvLoopError::Timeout)));
    }
}
