//! Render the Mandelbrot set into a storage buffer.
//!
//! One uniform buffer of render parameters, one (currently unused) input
//! storage buffer, one RGBA-f32 output storage buffer. The interior of the
//! set is black; the exterior is shaded by a smooth polynomial palette with
//! optional gamma correction.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::mem::size_of;
use std::path::Path;
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

/// Shader compiled by real backends; the host backend runs the registered
/// kernel of the same name instead.
pub const MANDELBROT_SHADER: &str =
    concat!(env!("CARGO_MANIFEST_DIR"), "/../../shaders/mandelbrot.wgsl");

/// Must match the `@workgroup_size` of the shader.
const WORK_GROUP_SIZE: u32 = 16;

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct MandelbrotUbo {
    width: u32,
    height: u32,
    max_iterations: u32,
    apply_gamma: u32,
}

/// One output texel.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Pixel {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

#[derive(Debug, Clone, Copy)]
pub struct MandelbrotParams {
    pub max_iterations: u32,
    pub enable_gamma_correction: bool,
}

impl Default for MandelbrotParams {
    fn default() -> Self {
        Self {
            max_iterations: 128,
            enable_gamma_correction: false,
        }
    }
}

pub struct MandelbrotJob {
    params: Arc<Mutex<MandelbrotParams>>,
    uniform: Arc<ComputeBuffer>,
    input: Arc<ComputeBuffer>,
    output: Arc<ComputeBuffer>,
    shader: Option<ShaderInstance>,
    width: u32,
    height: u32,
    initialized: bool,
}

impl MandelbrotJob {
    #[must_use]
    pub fn new(output_width: u32, output_height: u32) -> Self {
        register_host_kernel();
        Self {
            params: Arc::new(Mutex::new(MandelbrotParams::default())),
            uniform: ComputeBuffer::new(0, BufferKind::Uniform, BufferVisibility::Shared),
            input: ComputeBuffer::new(1, BufferKind::Storage, BufferVisibility::Shared),
            output: ComputeBuffer::new(2, BufferKind::Storage, BufferVisibility::Shared),
            shader: None,
            width: output_width,
            height: output_height,
            initialized: false,
        }
    }

    /// Shared parameter block; mutate between submissions to vary the render.
    #[must_use]
    pub fn params(&self) -> Arc<Mutex<MandelbrotParams>> {
        Arc::clone(&self.params)
    }

    /// The RGBA-f32 output; map after a completed wait to read pixels back.
    #[must_use]
    pub fn output(&self) -> Arc<ComputeBuffer> {
        Arc::clone(&self.output)
    }

    #[must_use]
    pub fn input(&self) -> Arc<ComputeBuffer> {
        Arc::clone(&self.input)
    }
}

impl JobStages for MandelbrotJob {
    fn init(&mut self, ctx: &InstanceContext) -> Result<(), DispatchError> {
        if self.initialized {
            return Ok(());
        }

        let width = self.width as usize;
        let height = self.height as usize;
        self.uniform
            .allocate(ctx, BufferDims::new(1, 1, size_of::<MandelbrotUbo>()))?;
        self.input.allocate(ctx, BufferDims::new(width, height, 1))?;
        self.output
            .allocate(ctx, BufferDims::new(width, height, size_of::<Pixel>()))?;

        let shader = ShaderInstance::new(
            ctx,
            MANDELBROT_SHADER,
            vec![
                Arc::clone(&self.uniform),
                Arc::clone(&self.input),
                Arc::clone(&self.output),
            ],
            WORK_GROUP_SIZE,
            workgroup_counts(self.width, self.height, WORK_GROUP_SIZE),
        )?;
        self.shader = Some(shader);
        self.initialized = true;
        Ok(())
    }

    fn presubmit(&mut self, _ctx: &InstanceContext) -> Result<(), DispatchError> {
        let shader = self.shader.as_ref().ok_or(DispatchError::Fail)?;

        // The output dims are authoritative: a resize re-records the command
        // buffer at the new grid and the uniforms follow.
        let dims = self.output.dims();
        let width = dims.width as u32;
        let height = dims.height as u32;
        shader.refresh(workgroup_counts(width, height, shader.workgroup_size()))?;

        let params = *self.params.lock();
        let ubo = MandelbrotUbo {
            width,
            height,
            max_iterations: params.max_iterations,
            apply_gamma: u32::from(params.enable_gamma_correction),
        };
        let mut mapped = self.uniform.map()?;
        mapped[..size_of::<MandelbrotUbo>()].copy_from_slice(bytemuck::bytes_of(&ubo));
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

/// Writes the output buffer as a plain P3 PPM.
pub fn save_ppm(output: &ComputeBuffer, path: &Path) -> Result<(), DispatchError> {
    let dims = output.dims();
    if dims.element_size != size_of::<Pixel>() {
        return Err(DispatchError::InvalidArg);
    }

    tracing::info!(path = %path.display(), "saving image");
    let mapped = output.map()?;
    let file = File::create(path).map_err(|err| {
        tracing::error!(path = %path.display(), ?err, "failed to open output file");
        DispatchError::Fail
    })?;
    let mut file = BufWriter::new(file);

    let write = |file: &mut BufWriter<File>| -> std::io::Result<()> {
        writeln!(file, "P3")?;
        writeln!(file, "{} {}", dims.width, dims.height)?;
        writeln!(file, "255")?;
        for y in 0..dims.height {
            for x in 0..dims.width {
                let offset = (y * dims.width + x) * size_of::<Pixel>();
                let pixel: Pixel =
                    bytemuck::pod_read_unaligned(&mapped[offset..offset + size_of::<Pixel>()]);
                let r = (pixel.r.clamp(0.0, 1.0) * 255.0) as u8;
                let g = (pixel.g.clamp(0.0, 1.0) * 255.0) as u8;
                let b = (pixel.b.clamp(0.0, 1.0) * 255.0) as u8;
                writeln!(file, "{r} {g} {b}")?;
            }
        }
        file.flush()
    };

    write(&mut file).map_err(|err| {
        tracing::error!(path = %path.display(), ?err, "failed to write image");
        DispatchError::Fail
    })
}

fn register_host_kernel() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        host::register_kernel(MANDELBROT_SHADER, |ctx| {
            let Some(ubo_bytes) = ctx.read(0) else {
                return;
            };
            if ubo_bytes.len() < size_of::<MandelbrotUbo>() {
                return;
            }
            let ubo: MandelbrotUbo =
                bytemuck::pod_read_unaligned(&ubo_bytes[..size_of::<MandelbrotUbo>()]);
            let Some(out) = ctx.data_mut(2) else {
                return;
            };
            render(&ubo, out);
        });
    });
}

fn render(ubo: &MandelbrotUbo, out: &mut [u8]) {
    let width = ubo.width as usize;
    let height = ubo.height as usize;
    let stride = size_of::<Pixel>();

    for y in 0..height {
        for x in 0..width {
            let offset = (y * width + x) * stride;
            let Some(slot) = out.get_mut(offset..offset + stride) else {
                return;
            };
            let pixel = shade(x, y, ubo);
            slot.copy_from_slice(bytemuck::bytes_of(&pixel));
        }
    }
}

fn shade(x: usize, y: usize, ubo: &MandelbrotUbo) -> Pixel {
    let u = (x as f32 + 0.5) / ubo.width.max(1) as f32;
    let v = (y as f32 + 0.5) / ubo.height.max(1) as f32;
    let cr = -2.0 + 2.5 * u;
    let ci = -1.25 + 2.5 * v;

    let mut zr = 0.0f32;
    let mut zi = 0.0f32;
    let mut i = 0u32;
    while i < ubo.max_iterations && zr * zr + zi * zi <= 4.0 {
        let next_zr = zr * zr - zi * zi + cr;
        zi = 2.0 * zr * zi + ci;
        zr = next_zr;
        i += 1;
    }

    // Interior stays black; the exterior gets the smooth polynomial palette.
    if i >= ubo.max_iterations {
        return Pixel {
            r: 0.0,
            g: 0.0,
            b: 0.0,
            a: 1.0,
        };
    }

    let t = i as f32 / ubo.max_iterations as f32;
    let u = 1.0 - t;
    let mut rgb = [
        (9.0 * u * t * t * t).clamp(0.0, 1.0),
        (15.0 * u * u * t * t).clamp(0.0, 1.0),
        (8.5 * u * u * u * t).clamp(0.0, 1.0),
    ];
    if ubo.apply_gamma != 0 {
        for channel in &mut rgb {
            *channel = channel.powf(1.0 / 2.2);
        }
    }
    Pixel {
        r: rgb[0],
        g: rgb[1],
        b: rgb[2],
        a: 1.0,
    }
}
