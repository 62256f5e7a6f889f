use criterion::{black_box, criterion_group, criterion_main, Criterion};
use evloop_rt::handle::{Callback, ExceptionReporter, Handle, TimerHandle, TracingExceptionReporter};
use evloop_rt::runtime_handle::LoopHandle;
use evloop_rt::Future;
use std::sync::{Arc, Mutex};

#[derive(Debug)]
struct InlineLoop {
    ready: Mutex<Vec<Callback>>,
}

impl InlineLoop {
    fn new() -> Arc<Self> {
        Arc::new(Self { ready: Mutex::new(Vec::new()) })
    }

    fn drain(&self) {
        let callbacks = std::mem::take(&mut *self.ready.lock().unwrap());
        for callback in callbacks {
            let _ = callback();
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

fn set_result_and_drain_callbacks(count: usize) {
    let loop_ = InlineLoop::new();
    let futures: Vec<Future<i32>> = (0..count).map(|_| Future::new(loop_.clone())).collect();
    for future in &futures {
        future.add_done_callback(|_| {});
    }
    for future in &futures {
        let _ = future.set_result(1);
    }
    loop_.drain();
}

pub fn criterion_benchmark(c: &mut Criterion) {
    c.bench_function("future_done_callback_roundtrip_1000", |b| {
        b.iter(|| black_box(set_result_and_drain_callbacks(1000)));
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
