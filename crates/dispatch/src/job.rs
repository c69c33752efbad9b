//! The job value and its four-stage contract.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::DispatchError;
use crate::instance::InstanceContext;

/// Raw job handle value; `u32::MAX` is the invalid sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobHandle(pub(crate) u32);

impl JobHandle {
    /// The invalid sentinel handle.
    pub const INVALID: JobHandle = JobHandle(u32::MAX);

    #[must_use]
    pub fn raw(self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStage {
    Init,
    Presubmit,
    Submit,
    Postsubmit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Created,
    Bound,
    Queued,
    Running(JobStage),
    Completed,
}

/// The four capabilities the dispatcher drives on a worker thread, in order:
/// `init → presubmit → submit → postsubmit`.
///
/// `init` runs on every submission and is expected to be idempotent (allocate
/// on first call, no-op afterwards). `submit` is invoked with the instance
/// submit lock held and must enqueue without blocking; `postsubmit` may block
/// on the completion fence up to `timeout_ms`.
pub trait JobStages: Send {
    fn init(&mut self, ctx: &InstanceContext) -> Result<(), DispatchError>;
    fn presubmit(&mut self, ctx: &InstanceContext) -> Result<(), DispatchError>;
    fn submit(&mut self, ctx: &InstanceContext) -> Result<(), DispatchError>;
    fn postsubmit(&mut self, ctx: &InstanceContext, timeout_ms: u32) -> Result<(), DispatchError>;
}

pub(crate) struct JobMeta {
    pub(crate) handle: Option<JobHandle>,
    pub(crate) ctx: Option<InstanceContext>,
    pub(crate) state: JobState,
    pub(crate) last_error: Option<DispatchError>,
    pub(crate) pool_job: Option<taskpool::JobId>,
}

/// An application-owned compute job: opaque stage state plus the dispatcher's
/// bookkeeping. The dispatcher borrows the job for the duration of its
/// pipeline stages; the application keeps the `Arc` and reads results back
/// through the buffers it retained.
pub struct Job {
    pub(crate) stages: Mutex<Box<dyn JobStages>>,
    pub(crate) meta: Mutex<JobMeta>,
}

impl Job {
    #[must_use]
    pub fn new(stages: impl JobStages + 'static) -> Arc<Self> {
        Arc::new(Self {
            stages: Mutex::new(Box::new(stages)),
            meta: Mutex::new(JobMeta {
                handle: None,
                ctx: None,
                state: JobState::Created,
                last_error: None,
                pool_job: None,
            }),
        })
    }

    /// The handle assigned at first submission; `None` before that.
    #[must_use]
    pub fn handle(&self) -> Option<JobHandle> {
        self.meta.lock().handle
    }

    #[must_use]
    pub fn state(&self) -> JobState {
        self.meta.lock().state
    }

    /// The error recorded by the most recent run's failing stage, if any.
    /// The completion event fires even for failed runs; waiters inspect this
    /// to tell the two apart.
    #[must_use]
    pub fn last_error(&self) -> Option<DispatchError> {
        self.meta.lock().last_error.clone()
    }
}
