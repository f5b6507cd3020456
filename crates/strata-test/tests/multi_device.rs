//! Replication across devices and concurrent population.

use rayon::prelude::*;
use strata_accel::{AccelConfig, AccelError, BuildState};
use strata_core::DeviceId;
use strata_gpu::{GpuError, HostDeviceConfig};
use strata_test::TestScene;

#[test]
fn every_device_gets_its_own_structure() {
    let mut ts = TestScene::new(3).unwrap();
    let leaf = ts.built_leaf().unwrap();
    let scene = ts.scene();
    let top = scene.create_instance_group_with_children(&[leaf]).unwrap();
    scene.build_accel(top).unwrap();

    for device in ts.device_ids() {
        let host = ts.host(device);
        assert_eq!(scene.build_state(top, device).unwrap(), BuildState::Built);
        let record = host.last_build().unwrap();
        assert_eq!(record.handle, scene.traversable(top, device).unwrap());
        assert_eq!(
            record.instances[0].traversable_handle,
            scene.traversable(leaf, device).unwrap()
        );
        // Two builds per device, each bracketed by one push and one pop.
        let stats = host.stats();
        assert_eq!(stats.builds, 2);
        assert_eq!(stats.pushes, stats.pops);
        assert!(!host.is_active());
    }
}

#[test]
fn device_failure_is_isolated() {
    let mut ts = TestScene::new(3).unwrap();
    let leaf = ts.built_leaf().unwrap();
    let scene = ts.scene();
    let top = scene.create_instance_group_with_children(&[leaf, leaf]).unwrap();

    ts.host(DeviceId(1)).fail_next_build();
    let err = scene.build_accel(top).unwrap_err();
    assert!(matches!(err, AccelError::Backend(GpuError::BuildFailed(_))));

    assert_eq!(scene.build_state(top, DeviceId(0)).unwrap(), BuildState::Built);
    assert_eq!(scene.build_state(top, DeviceId(1)).unwrap(), BuildState::Empty);
    assert_eq!(scene.build_state(top, DeviceId(2)).unwrap(), BuildState::Built);
    assert_eq!(scene.accel_memory_size(top, DeviceId(1)).unwrap(), 0);
    ts.check_consistent().unwrap();

    // The failed device released its temp and output memory.
    assert_eq!(ts.scene_allocations(DeviceId(1)), 1);
    for device in ts.device_ids() {
        assert!(!ts.host(device).is_active());
    }

    scene.destroy_accel(top).unwrap();
    scene.build_accel(top).unwrap();
    for device in ts.device_ids() {
        assert_eq!(scene.build_state(top, device).unwrap(), BuildState::Built);
    }
}

#[test]
fn parallel_population_counts_every_slot() {
    let config = AccelConfig::builder().parallel_threshold(4).build().unwrap();
    let mut ts = TestScene::with_config(2, &HostDeviceConfig::default(), config).unwrap();
    let leaf = ts.built_leaf().unwrap();
    let scene = ts.scene();

    let wide = scene
        .create_instance_group_with_children(&vec![leaf; 256])
        .unwrap();
    assert_eq!(scene.group_reference_count(leaf).unwrap(), 256);
    assert_eq!(scene.child_count(wide).unwrap(), 256);

    let other = scene.create_instance_group(256).unwrap();
    (0..256usize).into_par_iter().for_each(|slot| {
        scene.instance_group_set_child(other, slot, Some(leaf)).unwrap();
    });
    assert_eq!(scene.group_reference_count(leaf).unwrap(), 512);

    (0..256usize).into_par_iter().for_each(|slot| {
        scene.instance_group_set_child(wide, slot, None).unwrap();
    });
    assert_eq!(scene.group_reference_count(leaf).unwrap(), 256);

    // Encoded in parallel above the threshold, identical to the serial order.
    scene.build_accel(other).unwrap();
    let record = ts.host(DeviceId(1)).last_build().unwrap();
    assert_eq!(record.instances.len(), 256);
    for (slot, inst) in record.instances.iter().enumerate() {
        assert_eq!(inst.instance_id, slot as u32);
    }
}

#[test]
fn stale_handles_do_not_resolve() {
    let ts = TestScene::new(1).unwrap();
    let scene = ts.scene();
    let old = scene.create_instance_group(1).unwrap();
    scene.release_group(old).unwrap();
    let new = scene.create_instance_group(1).unwrap();

    assert_eq!(old.0.index(), new.0.index());
    assert!(matches!(
        scene.build_accel(old),
        Err(AccelError::Configuration(_))
    ));
    assert!(scene.group(new).is_ok());
}
