#![deny(clippy::all, clippy::pedantic)]

//! Renders a Mandelbrot set through the compute dispatcher and saves it as a
//! PPM. Runs on the host simulation backend by default; build with
//! `--features gpu` to drive a real device.
//!
//! ```text
//! kiln [--width N] [--height N] [--iterations N] [--gamma]
//!      [--device N] [--validation] [--out PATH]
//! ```

use std::env;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use dispatch::jobs::mandelbrot::{self, MandelbrotJob};
use dispatch::{InitOptions, Job, INFINITE_TIMEOUT};

struct Options {
    width: u32,
    height: u32,
    iterations: u32,
    gamma: bool,
    device: u32,
    validation: bool,
    out: PathBuf,
}

fn parse_options() -> Result<Options> {
    let args: Vec<String> = env::args().collect();
    let value = |name: &str| -> Option<&str> {
        args.iter()
            .position(|arg| arg == name)
            .and_then(|index| args.get(index + 1))
            .map(String::as_str)
    };
    let number = |name: &str, default: u32| -> Result<u32> {
        value(name)
            .map_or(Ok(default), str::parse)
            .with_context(|| format!("invalid value for {name}"))
    };

    Ok(Options {
        width: number("--width", 1000)?,
        height: number("--height", 1000)?,
        iterations: number("--iterations", 128)?,
        gamma: args.iter().any(|arg| arg == "--gamma"),
        device: number("--device", 0)?,
        validation: args.iter().any(|arg| arg == "--validation"),
        out: value("--out").map_or_else(|| PathBuf::from("mandelbrot.ppm"), PathBuf::from),
    })
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let options = parse_options()?;

    dispatch::init(InitOptions {
        enable_validation: options.validation,
        preferred_device: options.device,
        worker_threads: None,
    });

    let instance = dispatch::acquire(options.device)?;

    let mandelbrot_job = MandelbrotJob::new(options.width, options.height);
    let output = mandelbrot_job.output();
    {
        let params = mandelbrot_job.params();
        let mut params = params.lock();
        params.max_iterations = options.iterations;
        params.enable_gamma_correction = options.gamma;
    }

    let job = Job::new(mandelbrot_job);
    dispatch::bind_job(&job, instance)?;
    let handle = dispatch::submit_job(&job, instance)?;
    tracing::info!(
        job = handle.raw(),
        width = options.width,
        height = options.height,
        "submitted render"
    );

    dispatch::wait_for_job(handle, INFINITE_TIMEOUT, instance)?;
    if let Some(err) = job.last_error() {
        dispatch::release(instance)?;
        bail!("render failed: {err}");
    }

    mandelbrot::save_ppm(&output, &options.out)?;
    tracing::info!(path = %options.out.display(), "render complete");

    dispatch::release(instance)?;
    Ok(())
}
