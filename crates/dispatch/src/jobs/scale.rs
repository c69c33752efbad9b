//! Multiply an f32 array by a scalar. The minimal uniform + input + output
//! job shape; also serves as the second shader class in lifecycle tests.

use std::mem::size_of;
use std::sync::{Arc, Once};

use bytemuck::{Pod, Zeroable};
use parking_lot::Mutex;

use crate::backend::{host, BufferKind, BufferVisibility};
use crate::buffer::{BufferDims, ComputeBuffer};
use crate::error::DispatchError;
use crate::instance::InstanceContext;
use crate::job::JobStages;
use crate::program::ShaderInstance;
use crate::workgroup_counts;

pub const SCALE_SHADER: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/../../shaders/scale.wgsl");

/// Must match the `@workgroup_size` of the shader.
const WORK_GROUP_SIZE: u32 = 64;

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct ScaleUbo {
    element_count: u32,
    factor: f32,
}

pub struct ScaleJob {
    factor: Arc<Mutex<f32>>,
    uniform: Arc<ComputeBuffer>,
    input: Arc<ComputeBuffer>,
    output: Arc<ComputeBuffer>,
    shader: Option<ShaderInstance>,
    element_count: usize,
    initialized: bool,
}

impl ScaleJob {
    #[must_use]
    pub fn new(element_count: usize) -> Self {
        register_host_kernel();
        Self {
            factor: Arc::new(Mutex::new(1.0)),
            uniform: ComputeBuffer::new(0, BufferKind::Uniform, BufferVisibility::Shared),
            input: ComputeBuffer::new(1, BufferKind::Storage, BufferVisibility::Shared),
            output: ComputeBuffer::new(2, BufferKind::Storage, BufferVisibility::Shared),
            shader: None,
            element_count,
            initialized: false,
        }
    }

    #[must_use]
    pub fn factor(&self) -> Arc<Mutex<f32>> {
        Arc::clone(&self.factor)
    }

    /// Map and fill with input f32s before submitting.
    #[must_use]
    pub fn input(&self) -> Arc<ComputeBuffer> {
        Arc::clone(&self.input)
    }

    #[must_use]
    pub fn output(&self) -> Arc<ComputeBuffer> {
        Arc::clone(&self.output)
    }
}

impl JobStages for ScaleJob {
    fn init(&mut self, ctx: &InstanceContext) -> Result<(), DispatchError> {
        if self.initialized {
            return Ok(());
        }

        self.uniform
            .allocate(ctx, BufferDims::new(1, 1, size_of::<ScaleUbo>()))?;
        self.input
            .allocate(ctx, BufferDims::new(self.element_count, 1, size_of::<f32>()))?;
        self.output
            .allocate(ctx, BufferDims::new(self.element_count, 1, size_of::<f32>()))?;

        let shader = ShaderInstance::new(
            ctx,
            SCALE_SHADER,
            vec![
                Arc::clone(&self.uniform),
                Arc::clone(&self.input),
                Arc::clone(&self.output),
            ],
            WORK_GROUP_SIZE,
            workgroup_counts(self.element_count as u32, 1, WORK_GROUP_SIZE),
        )?;
        self.shader = Some(shader);
        self.initialized = true;
        Ok(())
    }

    fn presubmit(&mut self, _ctx: &InstanceContext) -> Result<(), DispatchError> {
        let shader = self.shader.as_ref().ok_or(DispatchError::Fail)?;

        let elements = self.output.dims().width as u32;
        shader.refresh(workgroup_counts(elements, 1, shader.workgroup_size()))?;

        let ubo = ScaleUbo {
            element_count: elements,
            factor: *self.factor.lock(),
        };
        let mut mapped = self.uniform.map()?;
        mapped[..size_of::<ScaleUbo>()].copy_from_slice(bytemuck::bytes_of(&ubo));
        Ok(())
    }

    fn submit(&mut self, _ctx: &InstanceContext) -> Result<(), DispatchError> {
        self.shader
            .as_ref()
            .ok_or(DispatchError::Fail)?
            .submit_recorded()
    }

    fn postsubmit(&mut self, _ctx: &InstanceContext, timeout_ms: u32) -> Result<(), DispatchError> {
        self.shader
            .as_ref()
            .ok_or(DispatchError::Fail)?
            .wait_fence(timeout_ms)
    }
}

fn register_host_kernel() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        host::register_kernel(SCALE_SHADER, |ctx| {
            let Some(ubo_bytes) = ctx.read(0) else {
                return;
            };
            if ubo_bytes.len() < size_of::<ScaleUbo>() {
                return;
            }
            let ubo: ScaleUbo = bytemuck::pod_read_unaligned(&ubo_bytes[..size_of::<ScaleUbo>()]);
            let Some(input) = ctx.read(1) else {
                return;
            };
            let Some(output) = ctx.data_mut(2) else {
                return;
            };

            let count = (ubo.element_count as usize)
                .min(input.len() / 4)
                .min(output.len() / 4);
            for i in 0..count {
                let offset = i * 4;
                let value = f32::from_le_bytes(input[offset..offset + 4].try_into().unwrap());
                output[offset..offset + 4].copy_from_slice(&(value * ubo.factor).to_le_bytes());
            }
        });
    });
}
