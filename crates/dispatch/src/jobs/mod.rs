//! Built-in compute jobs.

pub mod mandelbrot;
pub mod scale;

pub use mandelbrot::{MandelbrotJob, MandelbrotParams, Pixel};
pub use scale::ScaleJob;
