//! Backend error types.

use strata_core::DeviceId;
use thiserror::Error;

/// Backend-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[cfg(feature = "vulkan")]
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] ash::vk::Result),

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Host to device copy failed.
    #[error("Upload failed: {0}")]
    UploadFailed(String),

    /// The backend rejected or failed an acceleration structure build.
    #[error("Acceleration structure build failed: {0}")]
    BuildFailed(String),

    /// Operation issued while the device was not the active context.
    #[error("{0} is not the active device context")]
    DeviceNotActive(DeviceId),

    /// Feature not supported by this backend.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;
