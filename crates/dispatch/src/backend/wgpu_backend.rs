//! wgpu implementation of the backend seam.
//!
//! Shared-visibility buffers carry a host shadow: `map` refreshes the shadow
//! through a staging readback, `unmap` uploads it with `write_buffer`. Fences
//! are completion flags raised by `on_submitted_work_done` and polled in
//! `wait_for_fence`. Descriptor sets are bind groups materialized lazily at
//! submit, since wgpu bind groups are immutable once created.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::backend::{
    BufferId, BufferKind, BufferVisibility, CommandBufferId, DescriptorBinding,
    DescriptorLayoutId, DescriptorSetId, DeviceInfo, FenceId, GpuBackend, PipelineHandles,
    PipelineId, PipelineLayoutId, ShaderModuleId,
};
use crate::error::BackendError;
use crate::loader;

struct GpuBuffer {
    buffer: wgpu::Buffer,
    size: usize,
    kind: BufferKind,
    visibility: BufferVisibility,
    /// Host copy of a shared buffer; uploaded on unmap.
    shadow: Option<Box<[u8]>>,
}

struct DescriptorSet {
    layout: u64,
    entries: HashMap<u32, (u64, usize)>,
    /// Rebuilt whenever an entry changes.
    built: Option<wgpu::BindGroup>,
}

#[derive(Clone, Copy)]
struct Recording {
    pipeline: u64,
    set: u64,
    workgroups: [u32; 3],
}

#[derive(Default)]
struct GpuState {
    buffers: HashMap<u64, GpuBuffer>,
    modules: HashMap<u64, wgpu::ShaderModule>,
    layouts: HashMap<u64, wgpu::BindGroupLayout>,
    pipelines: HashMap<u64, wgpu::ComputePipeline>,
    pipeline_layouts: HashMap<u64, wgpu::PipelineLayout>,
    sets: HashMap<u64, DescriptorSet>,
    commands: HashMap<u64, Option<Recording>>,
    fences: HashMap<u64, Arc<AtomicBool>>,
    sets_in_use: u32,
}

/// The wgpu backend, enabled with the `gpu` cargo feature.
pub struct WgpuBackend {
    #[allow(dead_code)] // keeps the adapter's instance alive
    instance: wgpu::Instance,
    adapter: wgpu::Adapter,
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    device_index: u32,
    state: Mutex<GpuState>,
    next_id: AtomicU64,
}

impl WgpuBackend {
    pub fn new(device_index: u32, enable_validation: bool) -> Result<Self, BackendError> {
        let flags = if enable_validation {
            wgpu::InstanceFlags::VALIDATION | wgpu::InstanceFlags::DEBUG
        } else {
            wgpu::InstanceFlags::default()
        };
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            flags,
            ..Default::default()
        });

        let mut adapters = instance.enumerate_adapters(wgpu::Backends::all());
        let adapter = if (device_index as usize) < adapters.len() {
            adapters.swap_remove(device_index as usize)
        } else {
            pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                force_fallback_adapter: false,
                compatible_surface: None,
            }))
            .ok_or(BackendError::Failed("no suitable adapter"))?
        };

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("dispatch-device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
            },
            None,
        ))
        .map_err(|_| BackendError::Failed("device request failed"))?;

        Ok(Self {
            instance,
            adapter,
            device: Arc::new(device),
            queue: Arc::new(queue),
            device_index,
            state: Mutex::new(GpuState::default()),
            next_id: AtomicU64::new(1),
        })
    }

    fn id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Blocking GPU→host copy of `buffer` into `out`.
    fn read_back(&self, buffer: &wgpu::Buffer, out: &mut [u8]) -> Result<(), BackendError> {
        let size = out.len() as u64;
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("dispatch-readback"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("dispatch-readback"),
            });
        encoder.copy_buffer_to_buffer(buffer, 0, &staging, 0, size);
        self.queue.submit(Some(encoder.finish()));

        let (tx, rx) = std::sync::mpsc::channel();
        staging
            .slice(..)
            .map_async(wgpu::MapMode::Read, move |result| {
                let _ = tx.send(result);
            });
        self.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|_| BackendError::Failed("readback callback dropped"))?
            .map_err(|_| BackendError::Failed("readback map failed"))?;

        out.copy_from_slice(&staging.slice(..).get_mapped_range());
        staging.unmap();
        Ok(())
    }

    fn build_bind_group(
        device: &wgpu::Device,
        state: &GpuState,
        set: &DescriptorSet,
    ) -> Result<wgpu::BindGroup, BackendError> {
        let layout = state
            .layouts
            .get(&set.layout)
            .ok_or(BackendError::InvalidHandle)?;

        let mut slots: Vec<(&u32, &(u64, usize))> = set.entries.iter().collect();
        slots.sort_by_key(|(binding, _)| **binding);

        let entries = slots
            .into_iter()
            .map(|(binding, entry)| {
                let (buffer, range) = *entry;
                let buffer = state
                    .buffers
                    .get(&buffer)
                    .ok_or(BackendError::InvalidHandle)?;
                Ok(wgpu::BindGroupEntry {
                    binding: *binding,
                    resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                        buffer: &buffer.buffer,
                        offset: 0,
                        size: wgpu::BufferSize::new(range as u64),
                    }),
                })
            })
            .collect::<Result<Vec<_>, BackendError>>()?;

        Ok(device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("dispatch-set"),
            layout,
            entries: &entries,
        }))
    }
}

impl GpuBackend for WgpuBackend {
    fn device_info(&self) -> DeviceInfo {
        let info = self.adapter.get_info();
        let limits = self.adapter.limits();
        DeviceInfo {
            name: info.name,
            index: self.device_index,
            max_workgroup_invocations: limits.max_compute_invocations_per_workgroup,
            max_storage_buffer_range: u64::from(limits.max_storage_buffer_binding_size),
        }
    }

    fn create_buffer(
        &self,
        size: usize,
        kind: BufferKind,
        visibility: BufferVisibility,
    ) -> Result<BufferId, BackendError> {
        if size == 0 {
            return Err(BackendError::Failed("zero-sized buffer"));
        }

        let mut usage = wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST;
        usage |= match kind {
            BufferKind::Uniform => wgpu::BufferUsages::UNIFORM,
            BufferKind::Storage => wgpu::BufferUsages::STORAGE,
        };

        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("dispatch-buffer"),
            size: size as u64,
            usage,
            mapped_at_creation: false,
        });

        let shadow = match visibility {
            BufferVisibility::Shared => Some(vec![0u8; size].into_boxed_slice()),
            BufferVisibility::DeviceLocal => None,
        };

        let id = self.id();
        self.state.lock().buffers.insert(
            id,
            GpuBuffer {
                buffer,
                size,
                kind,
                visibility,
                shadow,
            },
        );
        Ok(BufferId(id))
    }

    fn destroy_buffer(&self, buffer: BufferId) {
        if let Some(entry) = self.state.lock().buffers.remove(&buffer.0) {
            entry.buffer.destroy();
        }
    }

    fn map_buffer(&self, buffer: BufferId) -> Result<*mut u8, BackendError> {
        let mut state = self.state.lock();
        let entry = state
            .buffers
            .get_mut(&buffer.0)
            .ok_or(BackendError::InvalidHandle)?;
        if entry.visibility != BufferVisibility::Shared {
            return Err(BackendError::Unsupported);
        }

        // Refresh the shadow so reads observe the latest device contents.
        let mut shadow = entry.shadow.take().ok_or(BackendError::InvalidHandle)?;
        let result = self.read_back(&entry.buffer, &mut shadow);
        let entry = state
            .buffers
            .get_mut(&buffer.0)
            .ok_or(BackendError::InvalidHandle)?;
        let ptr = shadow.as_mut_ptr();
        entry.shadow = Some(shadow);
        result?;
        Ok(ptr)
    }

    fn unmap_buffer(&self, buffer: BufferId) {
        let state = self.state.lock();
        if let Some(entry) = state.buffers.get(&buffer.0) {
            if let Some(shadow) = &entry.shadow {
                self.queue.write_buffer(&entry.buffer, 0, shadow);
            }
        }
    }

    fn create_shader_module(&self, path: &Path) -> Result<ShaderModuleId, BackendError> {
        let source = if path.extension().is_some_and(|ext| ext == "wgsl") {
            let text = fs::read_to_string(path).map_err(|err| BackendError::ShaderLoad {
                path: path.to_path_buf(),
                kind: err.kind(),
            })?;
            wgpu::ShaderSource::Wgsl(Cow::Owned(text))
        } else {
            let words = loader::load_shader_words(path)?;
            wgpu::ShaderSource::SpirV(Cow::Owned(words))
        };

        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("dispatch-shader"),
                source,
            });

        let id = self.id();
        self.state.lock().modules.insert(id, module);
        Ok(ShaderModuleId(id))
    }

    fn destroy_shader_module(&self, module: ShaderModuleId) {
        self.state.lock().modules.remove(&module.0);
    }

    fn create_descriptor_layout(
        &self,
        bindings: &[DescriptorBinding],
    ) -> Result<DescriptorLayoutId, BackendError> {
        let entries: Vec<wgpu::BindGroupLayoutEntry> = bindings
            .iter()
            .map(|binding| wgpu::BindGroupLayoutEntry {
                binding: binding.binding,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: match binding.kind {
                        BufferKind::Uniform => wgpu::BufferBindingType::Uniform,
                        BufferKind::Storage => {
                            wgpu::BufferBindingType::Storage { read_only: false }
                        }
                    },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            })
            .collect();

        let layout = self
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("dispatch-layout"),
                entries: &entries,
            });

        let id = self.id();
        self.state.lock().layouts.insert(id, layout);
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
        let mut state = self.state.lock();
        let shader = state
            .modules
            .get(&module.0)
            .ok_or(BackendError::InvalidHandle)?;
        let bind_layout = state
            .layouts
            .get(&layout.0)
            .ok_or(BackendError::InvalidHandle)?;

        let pipeline_layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("dispatch-pipeline-layout"),
                bind_group_layouts: &[bind_layout],
                push_constant_ranges: &[],
            });
        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("dispatch-pipeline"),
                layout: Some(&pipeline_layout),
                module: shader,
                entry_point: "main",
            });

        let pipeline_id = self.id();
        let layout_id = self.id();
        state.pipelines.insert(pipeline_id, pipeline);
        state.pipeline_layouts.insert(layout_id, pipeline_layout);
        Ok(PipelineHandles {
            pipeline: PipelineId(pipeline_id),
            layout: PipelineLayoutId(layout_id),
        })
    }

    fn destroy_pipeline(&self, pipeline: PipelineHandles) {
        let mut state = self.state.lock();
        state.pipelines.remove(&pipeline.pipeline.0);
        state.pipeline_layouts.remove(&pipeline.layout.0);
    }

    fn allocate_descriptor_set(
        &self,
        layout: DescriptorLayoutId,
    ) -> Result<DescriptorSetId, BackendError> {
        let mut state = self.state.lock();
        if !state.layouts.contains_key(&layout.0) {
            return Err(BackendError::InvalidHandle);
        }
        if state.sets_in_use >= crate::limits::MAX_JOBS {
            return Err(BackendError::PoolExhausted);
        }
        state.sets_in_use += 1;
        let id = self.id();
        state.sets.insert(
            id,
            DescriptorSet {
                layout: layout.0,
                entries: HashMap::new(),
                built: None,
            },
        );
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
        let entry = state
            .sets
            .get_mut(&set.0)
            .ok_or(BackendError::InvalidHandle)?;
        entry.entries.insert(binding, (buffer.0, range));
        entry.built = None;
        Ok(())
    }

    fn free_descriptor_set(&self, set: DescriptorSetId) {
        let mut state = self.state.lock();
        if state.sets.remove(&set.0).is_some() {
            state.sets_in_use = state.sets_in_use.saturating_sub(1);
        }
    }

    fn allocate_command_buffer(&self) -> Result<CommandBufferId, BackendError> {
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
        let id = self.id();
        self.state
            .lock()
            .fences
            .insert(id, Arc::new(AtomicBool::new(false)));
        Ok(FenceId(id))
    }

    fn reset_fence(&self, fence: FenceId) -> Result<(), BackendError> {
        self.state
            .lock()
            .fences
            .get(&fence.0)
            .ok_or(BackendError::InvalidHandle)?
            .store(false, Ordering::SeqCst);
        Ok(())
    }

    fn wait_for_fence(&self, fence: FenceId, timeout_ms: u32) -> Result<(), BackendError> {
        let flag = self
            .state
            .lock()
            .fences
            .get(&fence.0)
            .cloned()
            .ok_or(BackendError::InvalidHandle)?;

        let deadline = (timeout_ms != taskpool::INFINITE_TIMEOUT)
            .then(|| Instant::now() + Duration::from_millis(u64::from(timeout_ms)));
        loop {
            self.device.poll(wgpu::Maintain::Poll);
            if flag.load(Ordering::SeqCst) {
                return Ok(());
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Err(BackendError::Timeout);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn destroy_fence(&self, fence: FenceId) {
        self.state.lock().fences.remove(&fence.0);
    }

    fn queue_submit(&self, cmd: CommandBufferId, fence: FenceId) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        let recording = state
            .commands
            .get(&cmd.0)
            .copied()
            .ok_or(BackendError::InvalidHandle)?
            .ok_or(BackendError::Failed("command buffer not recorded"))?;

        // Materialize the bind group outside the borrow of `sets`.
        let needs_build = state
            .sets
            .get(&recording.set)
            .ok_or(BackendError::InvalidHandle)?
            .built
            .is_none();
        if needs_build {
            let built = {
                let set = &state.sets[&recording.set];
                Self::build_bind_group(&self.device, &state, set)?
            };
            if let Some(set) = state.sets.get_mut(&recording.set) {
                set.built = Some(built);
            }
        }

        let pipeline = state
            .pipelines
            .get(&recording.pipeline)
            .ok_or(BackendError::InvalidHandle)?;
        let bind_group = state
            .sets
            .get(&recording.set)
            .and_then(|set| set.built.as_ref())
            .ok_or(BackendError::InvalidHandle)?;
        let flag = state
            .fences
            .get(&fence.0)
            .cloned()
            .ok_or(BackendError::InvalidHandle)?;

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("dispatch-submit"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("dispatch-pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, bind_group, &[]);
            pass.dispatch_workgroups(
                recording.workgroups[0],
                recording.workgroups[1],
                recording.workgroups[2],
            );
        }
        self.queue.submit(Some(encoder.finish()));
        self.queue.on_submitted_work_done(move || {
            flag.store(true, Ordering::SeqCst);
        });
        Ok(())
    }
}
