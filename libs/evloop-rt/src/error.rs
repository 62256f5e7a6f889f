// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::fmt;
use std::io;

/// The error type shared by every fallible operation in this crate.
///
/// Mirrors the error kinds a caller needs to distinguish: state violations on
/// a [`crate::future::Future`], cooperative cancellation, deadline overruns,
/// OS-level failures, misuse from the wrong thread, mistyped callbacks, and
/// unsupported-on-this-platform operations.
#[derive(Debug)]
pub enum EvLoopError {
    /// `set_result`/`set_exception`/`get_result`/`get_exception` called on a
    /// future that is not in the state the operation requires.
    InvalidState,
    /// Cooperative cancellation signal. Not really an "error" but propagates
    /// like one through `Result`.
    Cancelled,
    /// A deadline passed before the awaited operation completed.
    Timeout,
    /// An OS-level failure (socket syscalls, resolver, bind, connect).
    Os(io::Error),
    /// Use-before-start, re-entering `run`, wrong-thread access, cross-loop
    /// misuse, or operating on a closed/claimed executor.
    RuntimeError(&'static str),
    /// A mistyped callback: non-callable, wrong arity, non-weak-referenceable
    /// callable passed to a weak handle constructor, or a would-be
    /// `StopIteration` set as a future's exception.
    TypeError(&'static str),
    /// A structurally invalid argument: non-positive cycle time, bad
    /// backlog, unsupported socket type.
    ValueError(&'static str),
    /// The requested operation is UNIX-only and the platform is not UNIX.
    NotImplemented(&'static str),
}

impl fmt::Display for EvLoopError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvLoopError::InvalidState => f.write_str("invalid state"),
            EvLoopError::Cancelled => f.write_str("cancelled"),
            EvLoopError::Timeout => f.write_str("timeout"),
            EvLoopError::Os(err) => write!(f, "os error: {err}"),
            EvLoopError::RuntimeError(msg) => write!(f, "runtime error: {msg}"),
            EvLoopError::TypeError(msg) => write!(f, "type error: {msg}"),
            EvLoopError::ValueError(msg) => write!(f, "value error: {msg}"),
            EvLoopError::NotImplemented(msg) => write!(f, "not implemented: {msg}"),
        }
    }
}

impl std::error::Error for EvLoopError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EvLoopError::Os(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for EvLoopError {
    fn from(err: io::Error) -> Self {
        EvLoopError::Os(err)
    }
}

impl EvLoopError {
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, EvLoopError::Cancelled)
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EvLoopError>;

/// Returned by [`crate::future::Future::cancel`] and friends, matching the
/// source's pattern of a zero-sized "this operation was declined" marker
/// distinct from a full [`EvLoopError`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Closed(pub(crate) ());

impl fmt::Display for Closed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("closed")
    }
}

impl std::error::Error for Closed {}
