#![deny(clippy::all, clippy::pedantic)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate,
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]

//! A concurrent GPU compute job dispatcher.
//!
//! Applications assemble compute-shader workloads as [`Job`]s, submit them
//! from any number of threads, and wait on the returned handles. The library
//! owns all device state: shader pipelines are shared across every job of the
//! same shader, per-job buffers/descriptors/command buffers are allocated on
//! demand, and queue submission is serialized per device.
//!
//! The GPU itself sits behind the [`backend::GpuBackend`] seam. Without the
//! `gpu` cargo feature the host simulation backend is used, which executes
//! registered host kernels on the CPU; with it, a wgpu-based backend drives a
//! real device.

pub mod backend;
pub mod buffer;
mod error;
mod instance;
mod job;
pub mod jobs;
pub mod loader;
mod program;

pub use backend::{
    BufferKind, BufferVisibility, DescriptorBinding, DeviceInfo, GpuBackend,
};
pub use buffer::{BufferDims, ComputeBuffer, MappedBuffer};
pub use error::{BackendError, DispatchError};
pub use instance::{
    acquire, bind_job, init, max_jobs, release, shader_program_is_built, shader_program_refs,
    submit_job, try_submit_job, wait_for_job, InitOptions, InstanceContext, InstanceHandle,
};
pub use job::{Job, JobHandle, JobStage, JobStages, JobState};
pub use program::ShaderInstance;
pub use taskpool::INFINITE_TIMEOUT;

/// Compile-time capacity limits, sized as in the reference design.
pub mod limits {
    /// Max concurrently acquired compute instances (one per GPU).
    pub const MAX_COMPUTE_INSTANCES: usize = 2;
    /// Max active jobs per instance; sizes the descriptor pool.
    pub const MAX_JOBS: u32 = 1024;
    /// Uniform descriptors reserved per job.
    pub const MAX_UNIFORM_BUFFERS_PER_JOB: u32 = 1;
    /// Storage descriptors reserved per job.
    pub const MAX_STORAGE_BUFFERS_PER_JOB: u32 = 2;
    /// Upper bound on a single job's GPU execution.
    pub const MAX_COMPUTE_JOB_TIMEOUT_MS: u32 = 60_000;
    /// Workgroup-size hint used when a shader does not dictate one.
    pub const DEFAULT_WORKGROUP_SIZE: u32 = 32;
}

/// Dispatch grid for a `width x height` output at the given workgroup size.
#[must_use]
pub fn workgroup_counts(width: u32, height: u32, workgroup_size: u32) -> [u32; 3] {
    let size = workgroup_size.max(1);
    [width.div_ceil(size), height.div_ceil(size), 1]
}
