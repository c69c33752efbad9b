//! CPU simulation of the backend surface.
//!
//! Every handle type behaves like its device counterpart: buffers are host
//! byte vectors, the descriptor pool counts allocations against
//! [`crate::limits::MAX_JOBS`], and submissions are executed in order by an
//! internal queue thread that signals the submission's fence when the work
//! retires. Shader modules record their path; a dispatch runs the **host
//! kernel** registered process-wide under that path, or is a no-op when none
//! is registered.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;

use parking_lot::{Mutex, MutexGuard};
use taskpool::{BoundedQueue, Event, INFINITE_TIMEOUT};

use crate::backend::{
    BufferId, BufferKind, BufferVisibility, CommandBufferId, DescriptorBinding,
    DescriptorLayoutId, DescriptorSetId, DeviceInfo, FenceId, GpuBackend, PipelineHandles,
    PipelineId, PipelineLayoutId, ShaderModuleId,
};
use crate::error::BackendError;
use crate::limits;

/// Executes one simulated dispatch. Buffers arrive locked, in binding order.
pub type HostKernelFn = Arc<dyn Fn(&mut HostKernelCtx<'_, '_>) + Send + Sync>;

static KERNELS: OnceLock<Mutex<HashMap<String, HostKernelFn>>> = OnceLock::new();

fn kernels() -> &'static Mutex<HashMap<String, HostKernelFn>> {
    KERNELS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Registers (or replaces) the host kernel executed for shader `path`.
pub fn register_kernel(
    path: impl Into<String>,
    kernel: impl Fn(&mut HostKernelCtx<'_, '_>) + Send + Sync + 'static,
) {
    kernels().lock().insert(path.into(), Arc::new(kernel));
}

/// Buffer access handed to a host kernel for one dispatch.
pub struct HostKernelCtx<'a, 'b> {
    workgroups: [u32; 3],
    buffers: &'a mut [(u32, MutexGuard<'b, Vec<u8>>)],
}

impl HostKernelCtx<'_, '_> {
    #[must_use]
    pub fn workgroups(&self) -> [u32; 3] {
        self.workgroups
    }

    /// Copies the contents of the buffer at `binding` out.
    #[must_use]
    pub fn read(&self, binding: u32) -> Option<Vec<u8>> {
        self.buffers
            .iter()
            .find(|(slot, _)| *slot == binding)
            .map(|(_, data)| data.to_vec())
    }

    /// Mutable view of the buffer at `binding`.
    pub fn data_mut(&mut self, binding: u32) -> Option<&mut [u8]> {
        self.buffers
            .iter_mut()
            .find(|(slot, _)| *slot == binding)
            .map(|(_, data)| data.as_mut_slice())
    }
}

struct HostBuffer {
    data: Arc<Mutex<Vec<u8>>>,
    visibility: BufferVisibility,
}

#[derive(Clone, Copy)]
struct Recording {
    pipeline: u64,
    set: u64,
    workgroups: [u32; 3],
}

#[derive(Default)]
struct HostState {
    buffers: HashMap<u64, HostBuffer>,
    modules: HashMap<u64, String>,
    layouts: HashMap<u64, Vec<DescriptorBinding>>,
    pipelines: HashMap<u64, u64>,
    sets: HashMap<u64, HashMap<u32, (u64, usize)>>,
    commands: HashMap<u64, Option<Recording>>,
    fences: HashMap<u64, Arc<Event>>,
    sets_in_use: u32,
}

struct Submission {
    kernel: Option<HostKernelFn>,
    buffers: Vec<(u32, Arc<Mutex<Vec<u8>>>)>,
    workgroups: [u32; 3],
    fence: Arc<Event>,
}

struct QueueShared {
    pending: BoundedQueue<Submission>,
    exit: AtomicBool,
}

/// The CPU backend; the default when the `gpu` feature is disabled.
pub struct HostBackend {
    info: DeviceInfo,
    state: Mutex<HostState>,
    next_id: AtomicU64,
    queue: Arc<QueueShared>,
    executor: Mutex<Option<JoinHandle<()>>>,
    device_lost: AtomicBool,
}

impl HostBackend {
    #[must_use]
    pub fn new(device_index: u32, enable_validation: bool) -> Self {
        let queue = Arc::new(QueueShared {
            pending: BoundedQueue::new(usize::try_from(limits::MAX_JOBS).unwrap()),
            exit: AtomicBool::new(false),
        });
        let executor = {
            let queue = Arc::clone(&queue);
            std::thread::Builder::new()
                .name(format!("host-queue-{device_index}"))
                .spawn(move || execute_queue(&queue))
                .expect("failed to spawn host queue thread")
        };

        if enable_validation {
            tracing::debug!(device_index, "host backend validation is always on");
        }

        Self {
            info: DeviceInfo {
                name: format!("host-sim-{device_index}"),
                index: device_index,
                max_workgroup_invocations: 1024,
                max_storage_buffer_range: u64::MAX,
            },
            state: Mutex::new(HostState::default()),
            next_id: AtomicU64::new(1),
            queue,
            executor: Mutex::new(Some(executor)),
            device_lost: AtomicBool::new(false),
        }
    }

    /// Simulates `DEVICE_LOST`: every subsequent allocation or submission
    /// fails until the backend is dropped.
    pub fn fail_device(&self) {
        self.device_lost.store(true, Ordering::SeqCst);
    }

    fn id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn check_alive(&self) -> Result<(), BackendError> {
        if self.device_lost.load(Ordering::SeqCst) {
            Err(BackendError::DeviceLost)
        } else {
            Ok(())
        }
    }
}

impl Drop for HostBackend {
    fn drop(&mut self) {
        self.queue.exit.store(true, Ordering::SeqCst);
        self.queue.pending.notify_all();
        if let Some(executor) = self.executor.lock().take() {
            let _ = executor.join();
        }
    }
}

fn execute_queue(shared: &QueueShared) {
    loop {
        if shared.exit.load(Ordering::SeqCst) {
            break;
        }
        let Ok(submission) = shared.pending.recv(INFINITE_TIMEOUT) else {
            continue;
        };

        if let Some(kernel) = &submission.kernel {
            let mut locked: Vec<(u32, MutexGuard<Vec<u8>>)> = submission
                .buffers
                .iter()
                .map(|(binding, data)| (*binding, data.lock()))
                .collect();
            let mut ctx = HostKernelCtx {
                workgroups: submission.workgroups,
                buffers: &mut locked,
            };
            kernel(&mut ctx);
        }

        submission.fence.set_all();
    }
}

impl GpuBackend for HostBackend {
    fn device_info(&self) -> DeviceInfo {
        self.info.clone()
    }

    fn create_buffer(
        &self,
        size: usize,
        _kind: BufferKind,
        visibility: BufferVisibility,
    ) -> Result<BufferId, BackendError> {
        self.check_alive()?;
        if size == 0 {
            return Err(BackendError::Failed("zero-sized buffer"));
        }
        let id = self.id();
        self.state.lock().buffers.insert(
            id,
            HostBuffer {
                data: Arc::new(Mutex::new(vec![0u8; size])),
                visibility,
            },
        );
        Ok(BufferId(id))
    }

    fn destroy_buffer(&self, buffer: BufferId) {
        self.state.lock().buffers.remove(&buffer.0);
    }

    fn map_buffer(&self, buffer: BufferId) -> Result<*mut u8, BackendError> {
        let state = self.state.lock();
        let entry = state
            .buffers
            .get(&buffer.0)
            .ok_or(BackendError::InvalidHandle)?;
        if entry.visibility != BufferVisibility::Shared {
            return Err(BackendError::Unsupported);
        }
        // The allocation is stable until destroy; the caller guarantees the
        // buffer outlives the mapping.
        let ptr = entry.data.lock().as_mut_ptr();
        Ok(ptr)
    }

    fn unmap_buffer(&self, _buffer: BufferId) {}

    fn create_shader_module(&self, path: &Path) -> Result<ShaderModuleId, BackendError> {
        self.check_alive()?;
        let id = self.id();
        self.state
            .lock()
            .modules
            .insert(id, path.display().to_string());
        Ok(ShaderModuleId(id))
    }

    fn destroy_shader_module(&self, module: ShaderModuleId) {
        self.state.lock().modules.remove(&module.0);
    }

    fn create_descriptor_layout(
        &self,
        bindings: &[DescriptorBinding],
    ) -> Result<DescriptorLayoutId, BackendError> {
        self.check_alive()?;
        let id = self.id();
        self.state.lock().layouts.insert(id, bindings.to_vec());
        Ok(DescriptorLayoutId(id))
    }

    fn destroy_descriptor_layout(&self, layout: DescriptorLayoutId) {
        self.state.lock().layouts.remove(&layout.0);
    }

    fn create_pipeline(
        &self,
        module: ShaderModuleId,
        layout: DescriptorLayoutId,
    ) -> Result<PipelineHandles, BackendError> {
        self.check_alive()?;
        let mut state = self.state.lock();
        if !state.modules.contains_key(&module.0) || !state.layouts.contains_key(&layout.0) {
            return Err(BackendError::InvalidHandle);
        }
        let pipeline = self.id();
        let pipeline_layout = self.id();
        state.pipelines.insert(pipeline, module.0);
        Ok(PipelineHandles {
            pipeline: PipelineId(pipeline),
            layout: PipelineLayoutId(pipeline_layout),
        })
    }

    fn destroy_pipeline(&self, pipeline: PipelineHandles) {
        self.state.lock().pipelines.remove(&pipeline.pipeline.0);
    }

    fn allocate_descriptor_set(
        &self,
        layout: DescriptorLayoutId,
    ) -> Result<DescriptorSetId, BackendError> {
        self.check_alive()?;
        let mut state = self.state.lock();
        if !state.layouts.contains_key(&layout.0) {
            return Err(BackendError::InvalidHandle);
        }
        if state.sets_in_use >= limits::MAX_JOBS {
            return Err(BackendError::PoolExhausted);
        }
        state.sets_in_use += 1;
        let id = self.id();
        state.sets.insert(id, HashMap::new());
        Ok(DescriptorSetId(id))
    }

    fn update_descriptor_set(
        &self,
        set: DescriptorSetId,
        binding: u32,
        _kind: BufferKind,
        buffer: BufferId,
        range: usize,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        if !state.buffers.contains_key(&buffer.0) {
            return Err(BackendError::InvalidHandle);
        }
        let entries = state
            .sets
            .get_mut(&set.0)
            .ok_or(BackendError::InvalidHandle)?;
        entries.insert(binding, (buffer.0, range));
        Ok(())
    }

    fn free_descriptor_set(&self, set: DescriptorSetId) {
        let mut state = self.state.lock();
        if state.sets.remove(&set.0).is_some() {
            state.sets_in_use = state.sets_in_use.saturating_sub(1);
        }
    }

    fn allocate_command_buffer(&self) -> Result<CommandBufferId, BackendError> {
        self.check_alive()?;
        let id = self.id();
        self.state.lock().commands.insert(id, None);
        Ok(CommandBufferId(id))
    }

    fn record_command_buffer(
        &self,
        cmd: CommandBufferId,
        pipeline: PipelineHandles,
        set: DescriptorSetId,
        workgroups: [u32; 3],
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        if !state.pipelines.contains_key(&pipeline.pipeline.0) || !state.sets.contains_key(&set.0)
        {
            return Err(BackendError::InvalidHandle);
        }
        let slot = state
            .commands
            .get_mut(&cmd.0)
            .ok_or(BackendError::InvalidHandle)?;
        *slot = Some(Recording {
            pipeline: pipeline.pipeline.0,
            set: set.0,
            workgroups,
        });
        Ok(())
    }

    fn free_command_buffer(&self, cmd: CommandBufferId) {
        self.state.lock().commands.remove(&cmd.0);
    }

    fn create_fence(&self) -> Result<FenceId, BackendError> {
        self.check_alive()?;
        let id = self.id();
        self.state.lock().fences.insert(id, Arc::new(Event::new()));
        Ok(FenceId(id))
    }

    fn reset_fence(&self, fence: FenceId) -> Result<(), BackendError> {
        self.state
            .lock()
            .fences
            .get(&fence.0)
            .ok_or(BackendError::InvalidHandle)?
            .reset();
        Ok(())
    }

    fn wait_for_fence(&self, fence: FenceId, timeout_ms: u32) -> Result<(), BackendError> {
        let event = self
            .state
            .lock()
            .fences
            .get(&fence.0)
            .cloned()
            .ok_or(BackendError::InvalidHandle)?;
        event.wait(timeout_ms).map_err(|_| BackendError::Timeout)
    }

    fn destroy_fence(&self, fence: FenceId) {
        self.state.lock().fences.remove(&fence.0);
    }

    fn queue_submit(&self, cmd: CommandBufferId, fence: FenceId) -> Result<(), BackendError> {
        self.check_alive()?;

        let submission = {
            let state = self.state.lock();
            let recording = state
                .commands
                .get(&cmd.0)
                .copied()
                .ok_or(BackendError::InvalidHandle)?
                .ok_or(BackendError::Failed("command buffer not recorded"))?;
            let module = state
                .pipelines
                .get(&recording.pipeline)
                .ok_or(BackendError::InvalidHandle)?;
            let kernel = state
                .modules
                .get(module)
                .and_then(|path| kernels().lock().get(path).cloned());
            if kernel.is_none() {
                tracing::debug!(cmd = cmd.0, "no host kernel registered, dispatch is a no-op");
            }

            let set = state
                .sets
                .get(&recording.set)
                .ok_or(BackendError::InvalidHandle)?;
            let mut buffers: Vec<(u32, Arc<Mutex<Vec<u8>>>)> = set
                .iter()
                .map(|(binding, entry)| {
                    let (buffer, _range) = *entry;
                    state
                        .buffers
                        .get(&buffer)
                        .map(|entry| (*binding, Arc::clone(&entry.data)))
                        .ok_or(BackendError::InvalidHandle)
                })
                .collect::<Result<_, _>>()?;
            buffers.sort_by_key(|(binding, _)| *binding);

            Submission {
                kernel,
                buffers,
                workgroups: recording.workgroups,
                fence: state
                    .fences
                    .get(&fence.0)
                    .cloned()
                    .ok_or(BackendError::InvalidHandle)?,
            }
        };

        self.queue
            .pending
            .send_blocking(submission)
            .map_err(|_| BackendError::Failed("queue thread is gone"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared_buffer(backend: &HostBackend, size: usize) -> BufferId {
        backend
            .create_buffer(size, BufferKind::Storage, BufferVisibility::Shared)
            .unwrap()
    }

    #[test]
    fn descriptor_pool_exhausts_at_max_jobs() {
        let backend = HostBackend::new(0, false);
        let layout = backend
            .create_descriptor_layout(&[DescriptorBinding {
                binding: 0,
                kind: BufferKind::Storage,
            }])
            .unwrap();

        let sets: Vec<_> = (0..limits::MAX_JOBS)
            .map(|_| backend.allocate_descriptor_set(layout).unwrap())
            .collect();
        assert_eq!(
            backend.allocate_descriptor_set(layout),
            Err(BackendError::PoolExhausted)
        );

        backend.free_descriptor_set(sets[0]);
        assert!(backend.allocate_descriptor_set(layout).is_ok());
    }

    #[test]
    fn unsignalled_fence_wait_times_out() {
        let backend = HostBackend::new(0, false);
        let fence = backend.create_fence().unwrap();
        assert_eq!(
            backend.wait_for_fence(fence, 10),
            Err(BackendError::Timeout)
        );
    }

    #[test]
    fn map_of_device_local_buffer_is_unsupported() {
        let backend = HostBackend::new(0, false);
        let buffer = backend
            .create_buffer(16, BufferKind::Storage, BufferVisibility::DeviceLocal)
            .unwrap();
        assert_eq!(backend.map_buffer(buffer), Err(BackendError::Unsupported));
    }

    #[test]
    fn submit_runs_registered_kernel_and_signals_fence() {
        register_kernel("host-test-fill", |ctx| {
            if let Some(data) = ctx.data_mut(0) {
                data.fill(0xAB);
            }
        });

        let backend = HostBackend::new(0, false);
        let buffer = shared_buffer(&backend, 8);
        let module = backend
            .create_shader_module(Path::new("host-test-fill"))
            .unwrap();
        let layout = backend
            .create_descriptor_layout(&[DescriptorBinding {
                binding: 0,
                kind: BufferKind::Storage,
            }])
            .unwrap();
        let pipeline = backend.create_pipeline(module, layout).unwrap();
        let set = backend.allocate_descriptor_set(layout).unwrap();
        backend
            .update_descriptor_set(set, 0, BufferKind::Storage, buffer, 8)
            .unwrap();
        let cmd = backend.allocate_command_buffer().unwrap();
        backend
            .record_command_buffer(cmd, pipeline, set, [1, 1, 1])
            .unwrap();
        let fence = backend.create_fence().unwrap();

        backend.queue_submit(cmd, fence).unwrap();
        backend.wait_for_fence(fence, 10_000).unwrap();

        let mapped = backend.map_buffer(buffer).unwrap();
        let contents = unsafe { std::slice::from_raw_parts(mapped, 8) };
        assert_eq!(contents, &[0xAB; 8]);
        backend.unmap_buffer(buffer);
    }

    #[test]
    fn failed_device_rejects_submission() {
        let backend = HostBackend::new(0, false);
        backend.fail_device();
        assert_eq!(
            backend.create_buffer(4, BufferKind::Storage, BufferVisibility::Shared),
            Err(BackendError::DeviceLost)
        );
    }
}
