//! Handles and identifiers shared across crates.

use crate::slots::SlotKey;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Index of a physical device within a device set.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct DeviceId(pub u32);

impl DeviceId {
    /// Index into per-device slot arrays.
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device#{}", self.0)
    }
}

/// Opaque handle to a built acceleration structure or transform node.
///
/// Zero is never a valid handle.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, bytemuck::Pod, bytemuck::Zeroable)]
pub struct TraversableHandle(pub u64);

impl TraversableHandle {
    /// The invalid handle.
    pub const NULL: Self = Self(0);

    /// Whether this handle refers to nothing.
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for TraversableHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Address of a byte in device memory.
#[repr(transparent)]
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, bytemuck::Pod, bytemuck::Zeroable,
)]
pub struct DeviceAddress(pub u64);

impl DeviceAddress {
    /// The null address (no allocation).
    pub const NULL: Self = Self(0);

    /// Whether this is the null address.
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Address `bytes` past this one.
    #[inline]
    pub const fn offset(self, bytes: u64) -> Self {
        Self(self.0 + bytes)
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Stable handle of a registered group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GroupId(pub SlotKey);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "group#{}", self.0)
    }
}

/// Stable handle of a registered geometry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GeomId(pub SlotKey);

impl fmt::Display for GeomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "geom#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_handle() {
        assert!(TraversableHandle::NULL.is_null());
        assert!(TraversableHandle::default().is_null());
        assert!(!TraversableHandle(0x40).is_null());
    }

    #[test]
    fn address_offset() {
        let base = DeviceAddress(0x1000);
        assert_eq!(base.offset(128), DeviceAddress(0x1080));
        assert!(DeviceAddress::NULL.is_null());
    }
}
