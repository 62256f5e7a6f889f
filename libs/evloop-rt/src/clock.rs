// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Process-wide monotonic clock that every [`crate::event_loop::EventThread`]
//! reads `loop_time()` from.

use std::time::Instant;

/// Nominal resolution of [`loop_time`], matching the `clock_resolution` used
/// by the runner to decide how far to drain the timer heap on a tick.
pub const CLOCK_RESOLUTION: f64 = 1e-3;

lazy_static::lazy_static! {
    static ref EPOCH: Instant = Instant::now();
}

/// Monotonic loop-time clock, in fractional seconds since an arbitrary but
/// fixed epoch chosen at first use. Never goes backwards.
#[must_use]
pub fn loop_time() -> f64 {
    EPOCH.elapsed().as_secs_f64()
}

/// The nominal resolution of [`loop_time`].
#[must_use]
pub fn clock_resolution() -> f64 {
    CLOCK_RESOLUTION
}
