// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Single-threaded-per-OS-thread asynchronous runtime: a selector-driven
//! event loop, a future/task model, a blocking-work executor pool,
//! loop-bound synchronization primitives, a periodic cycler, an RFC 9110
//! media-type parser, and a multipart/urlencoded form-data encoder.
//!
//! Exactly one [`event_loop::EventThread`] runs per OS thread. Everything
//! else in this crate — [`future::Future`], [`task::Task`], the `sync`
//! primitives, [`cycler::Cycler`] — is written against the narrow
//! [`runtime_handle::LoopHandle`] seam rather than the concrete loop, so it
//! can be built and unit-tested without a selector or any I/O.

pub mod bridge;
pub mod builder;
pub mod clock;
pub mod content_type;
pub mod cycler;
pub mod error;
pub mod event_loop;
pub mod executor;
pub mod future;
pub mod handle;
pub mod multipart;
pub mod net;
pub mod runtime_handle;
pub mod subprocess;
pub mod suspender;
pub mod sync;
pub mod task;
pub mod transport;

pub use builder::{EventLoopBuilder, ExecutorBuilder};
pub use error::{EvLoopError, Result};
pub use event_loop::{current, AsyncGenerator, AsyncGeneratorHandle, EventThread};
pub use future::Future;
pub use handle::{Callback, Handle, TimerHandle, WeakTimerHandle};
pub use runtime_handle::LoopHandle;
pub use task::{Task, TaskGroup};
