//! Acceleration structure error types.

use strata_gpu::GpuError;
use thiserror::Error;

/// Errors of the build lifecycle.
#[derive(Error, Debug)]
pub enum AccelError {
    /// Invalid handle or slot, missing child, or inconsistent motion transforms.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// More children than the backend allows in one top-level structure.
    #[error("Instance group has {count} children, the device allows at most {max} instances")]
    Capacity { count: usize, max: u32 },

    /// The backend failed to size, allocate, build or synchronize.
    #[error("Backend error: {0}")]
    Backend(#[from] GpuError),

    /// Build/refit called in the wrong state, or a child was not built first.
    #[error("Precondition violated: {0}")]
    Precondition(String),
}

impl From<strata_core::Error> for AccelError {
    fn from(e: strata_core::Error) -> Self {
        Self::Configuration(e.to_string())
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, AccelError>;
