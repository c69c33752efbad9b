#![deny(clippy::all, clippy::pedantic)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::must_use_candidate,
    clippy::cast_precision_loss
)]

//! A trivial job system built on a fixed-size thread pool.
//!
//! Callers submit [`Invokable`]s to a [`ThreadPool`] and wait on the returned
//! job handle. Completion is signalled through per-job [`Event`]s; waiting
//! from one of the pool's own worker threads is rejected with
//! [`PoolError::DeadlockGuard`] instead of starving the pool.

use thiserror::Error;

mod event;
mod pool;
mod queue;

pub use event::Event;
pub use pool::{GroupId, Invokable, JobId, SubmitMode, ThreadPool};
pub use queue::BoundedQueue;

/// Timeout value meaning "wait forever".
pub const INFINITE_TIMEOUT: u32 = u32::MAX;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    #[error("timed out")]
    Timeout,
    #[error("job queue is full")]
    Busy,
    #[error("handle is not owned by this pool")]
    NotOwned,
    #[error("waiting from a pool worker thread would deadlock")]
    DeadlockGuard,
    #[error("interrupted by shutdown")]
    Interrupted,
    #[error("pool is shutting down")]
    Shutdown,
}
