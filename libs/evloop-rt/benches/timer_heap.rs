use criterion::{black_box, criterion_group, criterion_main, Criterion};
use evloop_rt::handle::TimerHandle;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

fn push_pop(count: usize) -> f64 {
    let mut heap: BinaryHeap<Reverse<TimerHandle>> = BinaryHeap::new();
    for i in 0..count {
        heap.push(Reverse(TimerHandle::new(i as f64 * 0.001, Box::new(|| Ok(())))));
    }
    let mut last = 0.0;
    while let Some(Reverse(top)) = heap.pop() {
        last = top.when();
    }
    last
}

pub fn criterion_benchmark(c: &mut Criterion) {
    c.bench_function("timer_heap_push_pop_1000", |b| {
        b.iter(|| black_box(push_pop(1000)));
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
