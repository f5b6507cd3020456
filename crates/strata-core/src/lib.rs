//! Core types, math, and handles for the Strata acceleration structure manager.
//!
//! This crate provides the foundational types used throughout the workspace:
//! - Stable generational handles for groups and geometries
//! - A slot table owning registered objects by handle
//! - Device identifiers, device addresses and traversable handles
//! - Row-major 3x4 transform encoding

pub mod error;
pub mod math;
pub mod slots;
pub mod types;

pub use error::{Error, Result};
pub use math::RowMajor3x4;
pub use slots::{check_slot, SlotKey, SlotTable};
pub use types::{DeviceAddress, DeviceId, GeomId, GroupId, TraversableHandle};

/// Workspace-wide constants
pub mod constants {
    /// Visibility mask that makes an instance visible to every ray.
    pub const VISIBLE_TO_ALL_RAYS: u8 = 0xFF;
    /// Number of transform time steps an instance group can carry.
    pub const MAX_TIME_STEPS: usize = 2;
    /// Keys in a matrix motion transform (one per time step).
    pub const MOTION_KEY_COUNT: u16 = 2;
}
