//! Matrix motion transforms for motion-blurred instances.
//!
//! Each instance of a motion-blurred group is wrapped in a two-key transform
//! record. The records of one group are uploaded as a single array and each
//! record's address is turned into a traversable handle by the backend; the
//! instance then references that handle with an identity transform.

use crate::config::AccelConfig;
use glam::Affine3A;
use strata_core::constants::MOTION_KEY_COUNT;
use strata_core::{DeviceAddress, RowMajor3x4, TraversableHandle};
use strata_gpu::{MatrixMotionTransform, MotionOptions};

/// Size of one record in the uploaded array.
pub const RECORD_SIZE: u64 = std::mem::size_of::<MatrixMotionTransform>() as u64;

/// Key layout shared by every record of a scene.
pub const fn motion_options(config: &AccelConfig) -> MotionOptions {
    MotionOptions::new(
        MOTION_KEY_COUNT,
        config.motion_time_begin,
        config.motion_time_end,
    )
}

/// Record moving `child` from `begin` to `end` over the configured time range.
pub fn motion_transform(
    child: TraversableHandle,
    begin: &Affine3A,
    end: &Affine3A,
    config: &AccelConfig,
) -> MatrixMotionTransform {
    MatrixMotionTransform::new(
        child,
        motion_options(config),
        [RowMajor3x4::from_affine(begin), RowMajor3x4::from_affine(end)],
    )
}

/// Address of record `index` in an array starting at `base`.
pub const fn record_address(base: DeviceAddress, index: usize) -> DeviceAddress {
    base.offset(index as u64 * RECORD_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use glam::Vec3;

    #[test]
    fn record_spans_configured_range() {
        let config = AccelConfig::builder()
            .motion_time_range(0.25, 0.75)
            .build()
            .unwrap();
        let begin = Affine3A::IDENTITY;
        let end = Affine3A::from_translation(Vec3::new(2.0, 0.0, -1.0));
        let record = motion_transform(TraversableHandle(0x80), &begin, &end, &config);

        assert_eq!(record.child, TraversableHandle(0x80));
        assert_eq!(record.motion_options.num_keys, 2);
        assert_relative_eq!(record.motion_options.time_begin, 0.25);
        assert_relative_eq!(record.motion_options.time_end, 0.75);
        assert_eq!(record.transform[0], RowMajor3x4::IDENTITY);
        let end_row_major = record.transform[1].as_array();
        assert_relative_eq!(end_row_major[3], 2.0);
        assert_relative_eq!(end_row_major[11], -1.0);
    }

    #[test]
    fn records_are_packed() {
        assert_eq!(RECORD_SIZE, 128);
        let base = DeviceAddress(0x1_0000);
        assert_eq!(record_address(base, 0), base);
        assert_eq!(record_address(base, 3), DeviceAddress(0x1_0180));
    }
}
