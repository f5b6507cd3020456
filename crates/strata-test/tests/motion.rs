//! Motion-blurred instance groups.

use approx::assert_relative_eq;
use glam::{Affine3A, Quat, Vec3};
use strata_accel::{AccelConfig, AccelError, BuildState};
use strata_core::{DeviceId, RowMajor3x4};
use strata_gpu::{BuildFlags, GpuError, HostDeviceConfig};
use strata_test::TestScene;

const DEVICE: DeviceId = DeviceId(0);

#[test]
fn two_child_motion_scene() {
    let mut ts = TestScene::new(2).unwrap();
    let a = ts.built_leaf().unwrap();
    let b = ts.built_leaf().unwrap();
    let scene = ts.scene();
    let top = scene.create_instance_group_with_children(&[a, b]).unwrap();

    let begin = [
        Affine3A::IDENTITY,
        Affine3A::from_translation(Vec3::new(0.0, 0.0, 5.0)),
    ];
    let end = [
        Affine3A::from_translation(Vec3::new(1.0, 0.0, 0.0)),
        Affine3A::from_rotation_translation(Quat::from_rotation_y(0.5), Vec3::new(0.0, 0.0, 6.0)),
    ];
    for slot in 0..2 {
        scene.instance_group_set_transform(top, 0, slot, begin[slot]).unwrap();
        scene.instance_group_set_transform(top, 1, slot, end[slot]).unwrap();
    }
    assert!(scene.motion_blur_enabled(top).unwrap());
    scene.build_accel(top).unwrap();

    for device in ts.device_ids() {
        let record = ts.host(device).last_build().unwrap();
        assert!(record.flags.contains(BuildFlags::ALLOW_UPDATE | BuildFlags::PREFER_FAST_TRACE));
        assert_eq!(record.motion_transforms.len(), 2);

        let children = [a, b];
        for (slot, (inst, motion)) in record
            .instances
            .iter()
            .zip(&record.motion_transforms)
            .enumerate()
        {
            assert_eq!(inst.transform, RowMajor3x4::IDENTITY);
            assert_eq!(motion.child, scene.traversable(children[slot], device).unwrap());
            assert_eq!(motion.motion_options.num_keys, 2);
            assert_relative_eq!(motion.motion_options.time_begin, 0.0);
            assert_relative_eq!(motion.motion_options.time_end, 1.0);

            let key0 = motion.transform[0].to_affine();
            let key1 = motion.transform[1].to_affine();
            assert!(key0.abs_diff_eq(begin[slot], 1e-6));
            assert!(key1.abs_diff_eq(end[slot], 1e-6));
        }
    }
    ts.check_consistent().unwrap();
}

#[test]
fn partial_motion_is_rejected_before_any_allocation() {
    let mut ts = TestScene::new(1).unwrap();
    let leaf = ts.built_leaf().unwrap();
    let scene = ts.scene();
    let top = scene
        .create_instance_group_with_children(&[leaf, leaf, leaf])
        .unwrap();
    scene
        .instance_group_set_transform(top, 1, 2, Affine3A::from_translation(Vec3::Z))
        .unwrap();

    let before = ts.scene_allocations(DEVICE);
    assert!(matches!(
        scene.build_accel(top),
        Err(AccelError::Configuration(_))
    ));
    assert_eq!(ts.scene_allocations(DEVICE), before);
    assert_eq!(scene.build_state(top, DEVICE).unwrap(), BuildState::Empty);
}

#[test]
fn motion_refit_reuses_records() {
    let mut ts = TestScene::new(1).unwrap();
    let leaf = ts.built_leaf().unwrap();
    let scene = ts.scene();
    let top = scene.create_instance_group_with_children(&[leaf]).unwrap();
    scene
        .instance_group_set_transform(top, 1, 0, Affine3A::from_translation(Vec3::X))
        .unwrap();
    scene.build_accel(top).unwrap();
    let blocks = ts.scene_allocations(DEVICE);

    scene
        .instance_group_set_transform(top, 1, 0, Affine3A::from_translation(Vec3::Y))
        .unwrap();
    scene.refit_accel(top).unwrap();

    assert_eq!(ts.scene_allocations(DEVICE), blocks);
    let record = ts.host(DEVICE).last_build().unwrap();
    assert_relative_eq!(record.motion_transforms[0].transform[1].as_array()[7], 1.0);

    // Destroying frees the motion records with the structure.
    scene.destroy_accel(top).unwrap();
    assert_eq!(ts.scene_allocations(DEVICE), 1);
}

#[test]
fn custom_time_range() {
    let config = AccelConfig::builder()
        .motion_time_range(-1.0, 2.0)
        .build()
        .unwrap();
    let mut ts = TestScene::with_config(1, &HostDeviceConfig::default(), config).unwrap();
    let leaf = ts.built_leaf().unwrap();
    let scene = ts.scene();
    let top = scene.create_instance_group_with_children(&[leaf]).unwrap();
    scene
        .instance_group_set_transform(top, 1, 0, Affine3A::IDENTITY)
        .unwrap();
    scene.build_accel(top).unwrap();

    let record = ts.host(DEVICE).last_build().unwrap();
    assert_relative_eq!(record.motion_transforms[0].motion_options.time_begin, -1.0);
    assert_relative_eq!(record.motion_transforms[0].motion_options.time_end, 2.0);
}

#[test]
fn devices_without_motion_support_refuse() {
    let host = HostDeviceConfig {
        supports_motion_blur: false,
        ..HostDeviceConfig::default()
    };
    let mut ts = TestScene::with_config(1, &host, AccelConfig::default()).unwrap();
    let leaf = ts.built_leaf().unwrap();
    let scene = ts.scene();
    let top = scene.create_instance_group_with_children(&[leaf]).unwrap();
    scene
        .instance_group_set_transform(top, 1, 0, Affine3A::IDENTITY)
        .unwrap();
    assert!(matches!(
        scene.build_accel(top),
        Err(AccelError::Backend(GpuError::Unsupported(_)))
    ));
    ts.check_consistent().unwrap();
}
