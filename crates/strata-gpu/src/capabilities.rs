//! Backend capability reporting.

/// Ray tracing limits reported by a backend device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RayTracingCapabilities {
    /// Device name
    pub device_name: String,
    /// Maximum number of instances in one top-level structure.
    pub max_instances_per_ias: u32,
    /// Largest instance ID an instance record can carry.
    pub max_instance_id: u32,
    /// Largest shader binding table offset an instance record can carry.
    pub max_sbt_offset: u32,
    /// Whether matrix motion transforms can be converted to traversables.
    pub supports_motion_blur: bool,
    /// Required alignment of motion transform records in bytes.
    pub transform_alignment: u64,
}

impl RayTracingCapabilities {
    /// Whether a top-level structure with `count` instances fits on this device.
    pub const fn fits_instances(&self, count: usize) -> bool {
        count <= self.max_instances_per_ias as usize
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} - {} instances/IAS - motion blur {}",
            self.device_name,
            self.max_instances_per_ias,
            if self.supports_motion_blur { "on" } else { "off" },
        )
    }
}
