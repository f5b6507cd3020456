//! Build options, build inputs and the device-side record layouts shared by
//! every backend.

use strata_core::{DeviceAddress, RowMajor3x4, TraversableHandle};

bitflags::bitflags! {
    /// Acceleration structure build flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BuildFlags: u32 {
        const NONE = 0;
        const ALLOW_UPDATE = 1 << 0;
        const ALLOW_COMPACTION = 1 << 1;
        const PREFER_FAST_TRACE = 1 << 2;
        const PREFER_FAST_BUILD = 1 << 3;
    }
}

/// Whether a build reconstructs the structure or refits it in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuildOperation {
    Build,
    Update,
}

impl BuildOperation {
    /// Whether this is a full rebuild.
    #[inline]
    pub const fn is_full_rebuild(self) -> bool {
        matches!(self, Self::Build)
    }
}

/// Motion key layout over a normalized time range (12 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct MotionOptions {
    pub num_keys: u16,
    /// Vanish flags; always zero, instances stay visible outside the range.
    pub flags: u16,
    pub time_begin: f32,
    pub time_end: f32,
}

impl MotionOptions {
    /// Options for `num_keys` keys spread over `[time_begin, time_end]`.
    pub const fn new(num_keys: u16, time_begin: f32, time_end: f32) -> Self {
        Self {
            num_keys,
            flags: 0,
            time_begin,
            time_end,
        }
    }
}

impl Default for MotionOptions {
    fn default() -> Self {
        Self::new(1, 0.0, 1.0)
    }
}

/// Options passed to the memory usage query and to the build call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AccelBuildOptions {
    pub build_flags: BuildFlags,
    pub operation: BuildOperation,
    pub motion_options: MotionOptions,
}

impl AccelBuildOptions {
    pub fn new(build_flags: BuildFlags, operation: BuildOperation) -> Self {
        Self {
            build_flags,
            operation,
            motion_options: MotionOptions::default(),
        }
    }

    pub const fn num_keys(mut self, num_keys: u16) -> Self {
        self.motion_options.num_keys = num_keys;
        self
    }

    pub const fn time_interval(mut self, time_begin: f32, time_end: f32) -> Self {
        self.motion_options.time_begin = time_begin;
        self.motion_options.time_end = time_end;
        self
    }
}

/// Memory the backend needs for one build.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AccelBufferSizes {
    pub output_size_in_bytes: u64,
    pub temp_size_in_bytes: u64,
    pub temp_update_size_in_bytes: u64,
}

impl AccelBufferSizes {
    /// Temp memory needed by `operation`; updates usually need less.
    #[inline]
    pub const fn temp_size_for(&self, operation: BuildOperation) -> u64 {
        match operation {
            BuildOperation::Build => self.temp_size_in_bytes,
            BuildOperation::Update => self.temp_update_size_in_bytes,
        }
    }
}

/// Indexed triangle mesh with `f32x3` vertices and `u32x3` indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriangleInput {
    pub vertices: DeviceAddress,
    pub vertex_count: u32,
    pub vertex_stride: u32,
    pub indices: DeviceAddress,
    pub triangle_count: u32,
}

/// User primitives described by their bounding boxes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AabbInput {
    pub aabbs: DeviceAddress,
    pub primitive_count: u32,
    pub stride: u32,
}

/// One geometry of a bottom-level build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeometryInput {
    Triangles(TriangleInput),
    CustomPrimitives(AabbInput),
}

impl GeometryInput {
    /// Number of primitives this geometry contributes.
    pub const fn primitive_count(&self) -> u32 {
        match self {
            Self::Triangles(t) => t.triangle_count,
            Self::CustomPrimitives(a) => a.primitive_count,
        }
    }
}

/// Input of one acceleration structure build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildInput {
    /// Top-level build over an uploaded instance array.
    Instances {
        instances: DeviceAddress,
        count: u32,
    },
    /// Bottom-level build over geometries of a single kind.
    Geometries(Vec<GeometryInput>),
}

impl BuildInput {
    /// Instances or primitives covered by this input.
    pub fn primitive_count(&self) -> u64 {
        match self {
            Self::Instances { count, .. } => u64::from(*count),
            Self::Geometries(geoms) => geoms.iter().map(|g| u64::from(g.primitive_count())).sum(),
        }
    }
}

/// Kind of traversable a raw device pointer is converted into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum TraversableType {
    MatrixMotionTransform,
}

/// No instance flags.
pub const INSTANCE_FLAG_NONE: u32 = 0;

/// One entry of a top-level instance array (80 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct InstanceDesc {
    pub transform: RowMajor3x4,
    pub instance_id: u32,
    pub sbt_offset: u32,
    pub visibility_mask: u32,
    pub flags: u32,
    pub traversable_handle: TraversableHandle,
    pad: [u32; 2],
}

impl InstanceDesc {
    pub const fn new(
        transform: RowMajor3x4,
        instance_id: u32,
        sbt_offset: u32,
        visibility_mask: u8,
        traversable_handle: TraversableHandle,
    ) -> Self {
        Self {
            transform,
            instance_id,
            sbt_offset,
            visibility_mask: visibility_mask as u32,
            flags: INSTANCE_FLAG_NONE,
            traversable_handle,
            pad: [0; 2],
        }
    }
}

/// Two-or-more key matrix motion transform over a child traversable (128 bytes
/// for two keys).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct MatrixMotionTransform {
    pub child: TraversableHandle,
    pub motion_options: MotionOptions,
    pad: [u32; 3],
    pub transform: [RowMajor3x4; 2],
}

impl MatrixMotionTransform {
    pub const fn new(
        child: TraversableHandle,
        motion_options: MotionOptions,
        transform: [RowMajor3x4; 2],
    ) -> Self {
        Self {
            child,
            motion_options,
            pad: [0; 3],
            transform,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_sizes() {
        assert_eq!(std::mem::size_of::<MotionOptions>(), 12);
        assert_eq!(std::mem::size_of::<InstanceDesc>(), 80);
        assert_eq!(std::mem::size_of::<MatrixMotionTransform>(), 128);
    }

    #[test]
    fn temp_size_per_operation() {
        let sizes = AccelBufferSizes {
            output_size_in_bytes: 1024,
            temp_size_in_bytes: 512,
            temp_update_size_in_bytes: 64,
        };
        assert_eq!(sizes.temp_size_for(BuildOperation::Build), 512);
        assert_eq!(sizes.temp_size_for(BuildOperation::Update), 64);
    }

    #[test]
    fn primitive_counts() {
        let input = BuildInput::Geometries(vec![
            GeometryInput::Triangles(TriangleInput {
                vertices: DeviceAddress(0x100),
                vertex_count: 3,
                vertex_stride: 12,
                indices: DeviceAddress(0x200),
                triangle_count: 1,
            }),
            GeometryInput::CustomPrimitives(AabbInput {
                aabbs: DeviceAddress(0x300),
                primitive_count: 5,
                stride: 24,
            }),
        ]);
        assert_eq!(input.primitive_count(), 6);
    }
}
