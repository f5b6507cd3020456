//! Ray tracing backend abstraction layer for Strata.
//!
//! This crate provides:
//! - The [`Accelerator`] backend trait and scoped device activation
//! - Device memory blocks on top of a [`DeviceAllocator`]
//! - Build options, build inputs and backend record layouts
//! - Multi-device replication via [`DeviceSet`]
//! - A software [`HostAccelerator`] backend
//! - A Vulkan backend (feature `vulkan`)

pub mod accelerator;
pub mod build;
pub mod capabilities;
pub mod context;
pub mod error;
pub mod host;
pub mod memory;
#[cfg(feature = "vulkan")]
pub mod vulkan;

pub use accelerator::{Accelerator, ActiveDevice, ContextToken};
pub use build::{
    AabbInput, AccelBufferSizes, AccelBuildOptions, BuildFlags, BuildInput, BuildOperation,
    GeometryInput, InstanceDesc, MatrixMotionTransform, MotionOptions,
    TraversableType, TriangleInput,
};
pub use capabilities::RayTracingCapabilities;
pub use context::{DeviceSet, DeviceSetBuilder};
pub use error::{GpuError, Result};
pub use host::{BuildRecord, HostAccelerator, HostDeviceConfig, HostStats};
pub use memory::{DeviceAllocator, DeviceMemory, ScopedMemory};
#[cfg(feature = "vulkan")]
pub use vulkan::VulkanAccelerator;
