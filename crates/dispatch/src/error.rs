use std::io;
use std::path::PathBuf;

use taskpool::PoolError;
use thiserror::Error;

/// Errors surfaced by a [`crate::backend::GpuBackend`] implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("operation timed out")]
    Timeout,
    #[error("device lost")]
    DeviceLost,
    #[error("out of memory")]
    OutOfMemory,
    #[error("descriptor or command pool exhausted")]
    PoolExhausted,
    #[error("stale or unknown backend handle")]
    InvalidHandle,
    #[error("operation not supported by this backend")]
    Unsupported,
    #[error("failed to load shader [{path}]: {kind}")]
    ShaderLoad { path: PathBuf, kind: io::ErrorKind },
    #[error("{0}")]
    Failed(&'static str),
}

/// Error kinds of the core dispatcher API.
///
/// Richer information about a failing backend call travels through the
/// [`BackendError`] carried by the `Backend` variant and through the job's
/// `last_error` field; the remaining variants mirror the core result codes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("operation failed")]
    Fail,
    #[error("invalid argument")]
    InvalidArg,
    #[error("timed out")]
    Timeout,
    #[error("not implemented")]
    NotImplemented,
    #[error("handle is not owned by this instance")]
    NotOwned,
    #[error("waiting from a worker thread would deadlock")]
    DeadlockGuard,
    #[error("all compute instance slots are in use")]
    NoCapacity,
    #[error("job queue is full")]
    Busy,
    #[error("compute instance was released")]
    InstanceReleased,
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl From<PoolError> for DispatchError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Timeout => DispatchError::Timeout,
            PoolError::Busy => DispatchError::Busy,
            PoolError::NotOwned => DispatchError::NotOwned,
            PoolError::DeadlockGuard => DispatchError::DeadlockGuard,
            PoolError::Interrupted | PoolError::Shutdown => DispatchError::Fail,
        }
    }
}
