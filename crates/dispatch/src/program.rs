//! Shared shader programs and per-job shader instances.
//!
//! All jobs running the same shader on the same instance share one
//! [`ShaderProgram`] (module, descriptor-set layout, pipeline). Programs live
//! in a process-wide registry keyed by `(instance slot, generation, shader
//! path)` and are reference-counted by the shader instances wired to them:
//! the first instance builds the program, late arrivals block on the program
//! mutex until construction finishes, and releasing the last reference tears
//! the program down under the same mutex.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::backend::{
    CommandBufferId, DescriptorBinding, DescriptorLayoutId, DescriptorSetId, FenceId,
    PipelineHandles, ShaderModuleId,
};
use crate::buffer::ComputeBuffer;
use crate::error::{BackendError, DispatchError};
use crate::instance::InstanceContext;
use crate::limits;

#[derive(Clone, PartialEq, Eq, Hash)]
struct ProgramKey {
    slot: u32,
    generation: u64,
    path: PathBuf,
}

impl ProgramKey {
    fn for_ctx(ctx: &InstanceContext, path: &Path) -> Self {
        Self {
            slot: ctx.instance().raw(),
            generation: ctx.generation(),
            path: path.to_path_buf(),
        }
    }
}

#[derive(Default)]
struct ProgramState {
    built: bool,
    module: Option<ShaderModuleId>,
    layout: Option<DescriptorLayoutId>,
    pipeline: Option<PipelineHandles>,
}

/// Per-shader shared GPU state. Either fully constructed or entirely empty;
/// never published partially built.
pub(crate) struct ShaderProgram {
    path: PathBuf,
    workgroup_size: u32,
    state: Mutex<ProgramState>,
}

impl ShaderProgram {
    pub(crate) fn workgroup_size(&self) -> u32 {
        self.workgroup_size
    }

    pub(crate) fn is_built(&self) -> bool {
        self.state.lock().built
    }

    /// Builds `(module, layout, pipeline)` on first call; later callers block
    /// on the mutex until the first constructor finishes, then observe the
    /// fully built program.
    fn ensure_built(
        &self,
        ctx: &InstanceContext,
        bindings: &[DescriptorBinding],
    ) -> Result<(), DispatchError> {
        let mut state = self.state.lock();
        if state.built {
            return Ok(());
        }

        let backend = ctx.backend();
        let module = backend.create_shader_module(&self.path)?;
        let layout = match backend.create_descriptor_layout(bindings) {
            Ok(layout) => layout,
            Err(err) => {
                backend.destroy_shader_module(module);
                return Err(err.into());
            }
        };
        let pipeline = match backend.create_pipeline(module, layout) {
            Ok(pipeline) => pipeline,
            Err(err) => {
                backend.destroy_descriptor_layout(layout);
                backend.destroy_shader_module(module);
                return Err(err.into());
            }
        };

        state.module = Some(module);
        state.layout = Some(layout);
        state.pipeline = Some(pipeline);
        state.built = true;
        tracing::info!(path = %self.path.display(), "created compute pipeline");
        Ok(())
    }

    fn handles(&self) -> Option<(DescriptorLayoutId, PipelineHandles)> {
        let state = self.state.lock();
        match (state.layout, state.pipeline) {
            (Some(layout), Some(pipeline)) if state.built => Some((layout, pipeline)),
            _ => None,
        }
    }
}

struct RegistryEntry {
    program: Arc<ShaderProgram>,
    refs: u32,
}

static REGISTRY: OnceLock<Mutex<HashMap<ProgramKey, RegistryEntry>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<ProgramKey, RegistryEntry>> {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

fn acquire_program(ctx: &InstanceContext, path: &Path, workgroup_size: u32) -> Arc<ShaderProgram> {
    let mut registry = registry().lock();
    let entry = registry
        .entry(ProgramKey::for_ctx(ctx, path))
        .or_insert_with(|| RegistryEntry {
            program: Arc::new(ShaderProgram {
                path: path.to_path_buf(),
                workgroup_size,
                state: Mutex::new(ProgramState::default()),
            }),
            refs: 0,
        });
    entry.refs += 1;
    Arc::clone(&entry.program)
}

fn release_program(ctx: &InstanceContext, path: &Path) {
    let key = ProgramKey::for_ctx(ctx, path);
    let mut registry = registry().lock();
    let Some(entry) = registry.get_mut(&key) else {
        return;
    };
    entry.refs -= 1;
    if entry.refs > 0 {
        return;
    }

    // Last reference: tear down under the registry and program mutexes so a
    // concurrent acquire either sees the live entry or a fresh one, never a
    // half-destroyed program.
    let entry = registry.remove(&key).expect("entry exists");
    let mut state = entry.program.state.lock();
    let backend = ctx.backend();
    if let Some(pipeline) = state.pipeline.take() {
        backend.destroy_pipeline(pipeline);
    }
    if let Some(layout) = state.layout.take() {
        backend.destroy_descriptor_layout(layout);
    }
    if let Some(module) = state.module.take() {
        backend.destroy_shader_module(module);
    }
    state.built = false;
    tracing::info!(path = %path.display(), "destroyed compute pipeline");
}

pub(crate) fn refs_for(slot: u32, generation: u64, path: &Path) -> Option<u32> {
    let key = ProgramKey {
        slot,
        generation,
        path: path.to_path_buf(),
    };
    registry().lock().get(&key).map(|entry| entry.refs)
}

pub(crate) fn built_for(slot: u32, generation: u64, path: &Path) -> bool {
    let key = ProgramKey {
        slot,
        generation,
        path: path.to_path_buf(),
    };
    registry()
        .lock()
        .get(&key)
        .is_some_and(|entry| entry.program.is_built())
}

struct InstanceState {
    descriptor_set: Option<DescriptorSetId>,
    command_buffer: Option<CommandBufferId>,
    fence: Option<FenceId>,
    workgroups: [u32; 3],
}

/// Per-job wiring of a shader program: the job's buffers, a descriptor set
/// referencing them in binding order, the recorded command buffer, and the
/// completion fence.
pub struct ShaderInstance {
    ctx: InstanceContext,
    path: PathBuf,
    program: Arc<ShaderProgram>,
    buffers: Vec<Arc<ComputeBuffer>>,
    state: Mutex<InstanceState>,
}

impl ShaderInstance {
    /// Wires `buffers` to the shared program for `path`, allocating any
    /// still-unallocated buffer at its placeholder dims, and records the
    /// initial command buffer dispatching `workgroups`. The first instance
    /// of a shader fixes the program's workgroup-size hint; use
    /// [`limits::DEFAULT_WORKGROUP_SIZE`] when the shader has no opinion.
    pub fn new(
        ctx: &InstanceContext,
        path: impl AsRef<Path>,
        buffers: Vec<Arc<ComputeBuffer>>,
        workgroup_size: u32,
        workgroups: [u32; 3],
    ) -> Result<Self, DispatchError> {
        let path = path.as_ref();

        let uniforms = buffers
            .iter()
            .filter(|b| b.kind() == crate::backend::BufferKind::Uniform)
            .count() as u32;
        let storages = buffers.len() as u32 - uniforms;
        if uniforms > limits::MAX_UNIFORM_BUFFERS_PER_JOB
            || storages > limits::MAX_STORAGE_BUFFERS_PER_JOB
        {
            tracing::error!(
                path = %path.display(),
                uniforms,
                storages,
                "buffer count exceeds the per-job descriptor pool sizing"
            );
            return Err(DispatchError::InvalidArg);
        }

        let mut bindings: Vec<DescriptorBinding> = buffers
            .iter()
            .map(|b| DescriptorBinding {
                binding: b.binding(),
                kind: b.kind(),
            })
            .collect();
        bindings.sort_by_key(|b| b.binding);

        let program = acquire_program(ctx, path, workgroup_size.max(1));
        let built = program
            .ensure_built(ctx, &bindings)
            .and_then(|()| {
                for buffer in &buffers {
                    buffer.ensure_allocated(ctx)?;
                }
                Ok(())
            });
        if let Err(err) = built {
            release_program(ctx, path);
            return Err(err);
        }

        let instance = Self {
            ctx: ctx.clone(),
            path: path.to_path_buf(),
            program,
            buffers,
            state: Mutex::new(InstanceState {
                descriptor_set: None,
                command_buffer: None,
                fence: None,
                workgroups,
            }),
        };
        // From here on, Drop rolls back whatever was created.
        instance.wire()?;
        Ok(instance)
    }

    fn wire(&self) -> Result<(), DispatchError> {
        let backend = self.ctx.backend();
        let (layout, pipeline) = self.program.handles().ok_or(DispatchError::Fail)?;

        let mut state = self.state.lock();
        let set = backend.allocate_descriptor_set(layout)?;
        state.descriptor_set = Some(set);
        for buffer in &self.buffers {
            buffer.bind(set)?;
        }

        let cmd = backend.allocate_command_buffer()?;
        state.command_buffer = Some(cmd);
        backend.record_command_buffer(cmd, pipeline, set, state.workgroups)?;

        state.fence = Some(backend.create_fence()?);
        Ok(())
    }

    #[must_use]
    pub fn buffers(&self) -> &[Arc<ComputeBuffer>] {
        &self.buffers
    }

    #[must_use]
    pub fn workgroup_size(&self) -> u32 {
        self.program.workgroup_size()
    }

    /// Consumes the size-changed flag of every buffer; when any was set,
    /// re-records the command buffer at `workgroups` and reports `true`.
    pub fn refresh(&self, workgroups: [u32; 3]) -> Result<bool, DispatchError> {
        let mut changed = false;
        for buffer in &self.buffers {
            changed |= buffer.take_size_changed();
        }
        if !changed {
            return Ok(false);
        }
        let mut state = self.state.lock();
        state.workgroups = workgroups;
        self.record_locked(&mut state)?;
        Ok(true)
    }

    /// Re-records the command buffer with the current workgroup counts.
    pub fn record(&self) -> Result<(), DispatchError> {
        let mut state = self.state.lock();
        self.record_locked(&mut state)
    }

    fn record_locked(&self, state: &mut InstanceState) -> Result<(), DispatchError> {
        let backend = self.ctx.backend();
        let (_, pipeline) = self.program.handles().ok_or(DispatchError::Fail)?;
        let set = state.descriptor_set.ok_or(DispatchError::Fail)?;

        if let Some(cmd) = state.command_buffer.take() {
            backend.free_command_buffer(cmd);
        }
        let cmd = backend.allocate_command_buffer()?;
        backend.record_command_buffer(cmd, pipeline, set, state.workgroups)?;
        state.command_buffer = Some(cmd);
        Ok(())
    }

    /// Resets the fence and enqueues the recorded command buffer. The caller
    /// must hold the instance submit lock; a shader instance without a
    /// recording is silently skipped.
    pub fn submit_recorded(&self) -> Result<(), DispatchError> {
        let state = self.state.lock();
        let Some(cmd) = state.command_buffer else {
            return Ok(());
        };
        let fence = state.fence.ok_or(DispatchError::Fail)?;
        let backend = self.ctx.backend();
        backend.reset_fence(fence)?;
        backend.queue_submit(cmd, fence)?;
        Ok(())
    }

    /// Blocks on the completion fence. A timeout leaves the fence untouched
    /// so a longer wait may still succeed.
    pub fn wait_fence(&self, timeout_ms: u32) -> Result<(), DispatchError> {
        let fence = self.state.lock().fence.ok_or(DispatchError::Fail)?;
        match self.ctx.backend().wait_for_fence(fence, timeout_ms) {
            Ok(()) => Ok(()),
            Err(BackendError::Timeout) => Err(DispatchError::Timeout),
            Err(err) => Err(err.into()),
        }
    }
}

impl Drop for ShaderInstance {
    fn drop(&mut self) {
        let backend = self.ctx.backend();
        let mut state = self.state.lock();
        if let Some(cmd) = state.command_buffer.take() {
            backend.free_command_buffer(cmd);
        }
        if let Some(set) = state.descriptor_set.take() {
            backend.free_descriptor_set(set);
        }
        if let Some(fence) = state.fence.take() {
            backend.destroy_fence(fence);
        }
        drop(state);
        release_program(&self.ctx, &self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BufferKind, BufferVisibility, HostBackend};
    use crate::buffer::BufferDims;

    fn ctx(generation: u64) -> InstanceContext {
        InstanceContext::for_tests(Arc::new(HostBackend::new(0, false)), generation)
    }

    fn storage_buffer(ctx: &InstanceContext, binding: u32) -> Arc<ComputeBuffer> {
        let buffer = ComputeBuffer::new(binding, BufferKind::Storage, BufferVisibility::Shared);
        buffer.allocate(ctx, BufferDims::new(4, 1, 4)).unwrap();
        buffer
    }

    #[test]
    fn program_is_shared_and_refcounted() {
        let ctx = ctx(2000);
        let path = Path::new("program-refcount-test");

        let first = ShaderInstance::new(
            &ctx,
            path,
            vec![storage_buffer(&ctx, 0)],
            limits::DEFAULT_WORKGROUP_SIZE,
            [1, 1, 1],
        )
        .unwrap();
        let second = ShaderInstance::new(
            &ctx,
            path,
            vec![storage_buffer(&ctx, 0)],
            limits::DEFAULT_WORKGROUP_SIZE,
            [1, 1, 1],
        )
        .unwrap();

        assert_eq!(refs_for(0, 2000, path), Some(2));
        assert!(built_for(0, 2000, path));

        drop(first);
        assert_eq!(refs_for(0, 2000, path), Some(1));
        assert!(built_for(0, 2000, path));

        drop(second);
        assert_eq!(refs_for(0, 2000, path), None);
        assert!(!built_for(0, 2000, path));
    }

    #[test]
    fn distinct_shaders_get_distinct_programs() {
        let ctx = ctx(2001);
        let a = ShaderInstance::new(
            &ctx,
            "program-distinct-a",
            vec![storage_buffer(&ctx, 0)],
            limits::DEFAULT_WORKGROUP_SIZE,
            [1, 1, 1],
        )
        .unwrap();
        let b = ShaderInstance::new(
            &ctx,
            "program-distinct-b",
            vec![storage_buffer(&ctx, 0)],
            limits::DEFAULT_WORKGROUP_SIZE,
            [1, 1, 1],
        )
        .unwrap();

        assert_eq!(refs_for(0, 2001, Path::new("program-distinct-a")), Some(1));
        assert_eq!(refs_for(0, 2001, Path::new("program-distinct-b")), Some(1));

        drop(a);
        assert_eq!(refs_for(0, 2001, Path::new("program-distinct-a")), None);
        assert_eq!(refs_for(0, 2001, Path::new("program-distinct-b")), Some(1));
        drop(b);
    }

    #[test]
    fn per_job_buffer_limits_are_enforced() {
        let ctx = ctx(2002);
        let buffers = (0..3).map(|i| storage_buffer(&ctx, i)).collect();
        let result = ShaderInstance::new(
            &ctx,
            "program-limits-test",
            buffers,
            limits::DEFAULT_WORKGROUP_SIZE,
            [1, 1, 1],
        );
        assert!(matches!(result, Err(DispatchError::InvalidArg)));
        assert_eq!(refs_for(0, 2002, Path::new("program-limits-test")), None);
    }
}
