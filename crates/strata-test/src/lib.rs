//! Test harness for Strata acceleration structures.
//!
//! Provides multi-device scenes on the host backend with geometry buffers
//! uploaded to every device, plus consistency and leak checks.

pub mod harness;

pub use harness::{init_tracing, TestScene};

use strata_accel::AccelError;
use strata_gpu::GpuError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TestError {
    #[error("Acceleration structure error: {0}")]
    Accel(#[from] AccelError),
    #[error("GPU error: {0}")]
    Gpu(#[from] GpuError),
    #[error("Inconsistent state: {0}")]
    Inconsistent(String),
    #[error("Leaked device memory: {0}")]
    Leak(String),
}

pub type Result<T> = std::result::Result<T, TestError>;
