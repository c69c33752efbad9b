//! The seam between the dispatcher and a concrete GPU API.
//!
//! Everything the core needs from a device is expressed through
//! [`GpuBackend`] and a handful of opaque handles. The host simulation
//! backend is always available; the wgpu backend sits behind the `gpu` cargo
//! feature.

use std::path::Path;
use std::sync::Arc;

use crate::error::BackendError;

pub mod host;
#[cfg(feature = "gpu")]
pub mod wgpu_backend;

pub use host::HostBackend;
#[cfg(feature = "gpu")]
pub use wgpu_backend::WgpuBackend;

macro_rules! backend_handle {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(pub(crate) u64);
    };
}

backend_handle!(BufferId);
backend_handle!(ShaderModuleId);
backend_handle!(DescriptorLayoutId);
backend_handle!(PipelineId);
backend_handle!(PipelineLayoutId);
backend_handle!(DescriptorSetId);
backend_handle!(CommandBufferId);
backend_handle!(FenceId);

/// Compute pipeline plus the pipeline layout it was created with; the pair
/// is created and destroyed together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineHandles {
    pub pipeline: PipelineId,
    pub layout: PipelineLayoutId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    Uniform,
    Storage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferVisibility {
    /// Host-visible and host-coherent; mappable.
    Shared,
    /// Device-local; never mapped by the host.
    DeviceLocal,
}

/// One slot of a descriptor-set layout. Stage is implicitly compute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorBinding {
    pub binding: u32,
    pub kind: BufferKind,
}

#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub name: String,
    pub index: u32,
    pub max_workgroup_invocations: u32,
    pub max_storage_buffer_range: u64,
}

/// Primitive device operations the dispatcher is built on.
///
/// Implementations are shared across worker threads; every method must be
/// callable concurrently except [`GpuBackend::queue_submit`], which the
/// dispatcher serializes through the per-instance submit lock.
pub trait GpuBackend: Send + Sync {
    fn device_info(&self) -> DeviceInfo;

    fn create_buffer(
        &self,
        size: usize,
        kind: BufferKind,
        visibility: BufferVisibility,
    ) -> Result<BufferId, BackendError>;
    fn destroy_buffer(&self, buffer: BufferId);

    /// Maps a shared buffer into host memory. The pointer stays valid until
    /// [`GpuBackend::unmap_buffer`]; the caller guarantees the buffer is not
    /// destroyed or resized while mapped.
    fn map_buffer(&self, buffer: BufferId) -> Result<*mut u8, BackendError>;
    fn unmap_buffer(&self, buffer: BufferId);

    fn create_shader_module(&self, path: &Path) -> Result<ShaderModuleId, BackendError>;
    fn destroy_shader_module(&self, module: ShaderModuleId);

    fn create_descriptor_layout(
        &self,
        bindings: &[DescriptorBinding],
    ) -> Result<DescriptorLayoutId, BackendError>;
    fn destroy_descriptor_layout(&self, layout: DescriptorLayoutId);

    fn create_pipeline(
        &self,
        module: ShaderModuleId,
        layout: DescriptorLayoutId,
    ) -> Result<PipelineHandles, BackendError>;
    fn destroy_pipeline(&self, pipeline: PipelineHandles);

    fn allocate_descriptor_set(
        &self,
        layout: DescriptorLayoutId,
    ) -> Result<DescriptorSetId, BackendError>;
    /// Points `binding` of `set` at `buffer` over `range` bytes.
    fn update_descriptor_set(
        &self,
        set: DescriptorSetId,
        binding: u32,
        kind: BufferKind,
        buffer: BufferId,
        range: usize,
    ) -> Result<(), BackendError>;
    fn free_descriptor_set(&self, set: DescriptorSetId);

    fn allocate_command_buffer(&self) -> Result<CommandBufferId, BackendError>;
    /// Records `begin → bind pipeline → bind set → dispatch(workgroups) → end`,
    /// replacing any previous recording.
    fn record_command_buffer(
        &self,
        cmd: CommandBufferId,
        pipeline: PipelineHandles,
        set: DescriptorSetId,
        workgroups: [u32; 3],
    ) -> Result<(), BackendError>;
    fn free_command_buffer(&self, cmd: CommandBufferId);

    /// Creates an unsignalled fence.
    fn create_fence(&self) -> Result<FenceId, BackendError>;
    fn reset_fence(&self, fence: FenceId) -> Result<(), BackendError>;
    /// `Ok` once signalled; [`BackendError::Timeout`] leaves the fence state
    /// untouched so a longer wait may still succeed.
    fn wait_for_fence(&self, fence: FenceId, timeout_ms: u32) -> Result<(), BackendError>;
    fn destroy_fence(&self, fence: FenceId);

    /// Enqueues a recorded command buffer, signalling `fence` on completion.
    /// Callers must serialize submissions per device queue.
    fn queue_submit(&self, cmd: CommandBufferId, fence: FenceId) -> Result<(), BackendError>;
}

/// The backend for the current configuration: wgpu when the `gpu` feature is
/// enabled, the host simulation otherwise.
pub fn default_backend(
    device_index: u32,
    enable_validation: bool,
) -> Result<Arc<dyn GpuBackend>, BackendError> {
    #[cfg(feature = "gpu")]
    {
        Ok(Arc::new(WgpuBackend::new(device_index, enable_validation)?))
    }
    #[cfg(not(feature = "gpu"))]
    {
        Ok(Arc::new(HostBackend::new(device_index, enable_validation)))
    }
}
