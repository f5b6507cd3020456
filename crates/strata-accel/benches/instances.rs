//! Instance array encoding and top-level refit benchmarks on the host backend.
//!
//!   cargo bench -p strata-accel

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use glam::{Affine3A, Vec3};
use std::hint::black_box;
use std::sync::Arc;
use strata_accel::{motion, AccelConfig, GeomKind, Scene, StaticGeometry};
use strata_core::{DeviceId, TraversableHandle};
use strata_gpu::{
    AabbInput, ActiveDevice, DeviceMemory, DeviceSetBuilder, GeometryInput, HostAccelerator,
    HostDeviceConfig,
};

fn bench_motion_records(c: &mut Criterion) {
    let config = AccelConfig::default();
    let begin = Affine3A::IDENTITY;
    let end = Affine3A::from_translation(Vec3::new(0.0, 1.0, 0.0));

    c.bench_function("motion_transform_x1024", |b| {
        b.iter(|| {
            (0..1024u64)
                .map(|i| motion::motion_transform(TraversableHandle(i << 6), &begin, &end, &config))
                .collect::<Vec<_>>()
        });
    });
}

fn bench_refit(c: &mut Criterion) {
    let host = Arc::new(HostAccelerator::new(DeviceId(0), HostDeviceConfig::default()));
    let devices = DeviceSetBuilder::new()
        .device(host.clone())
        .build()
        .expect("device set");

    let mut aabbs = DeviceMemory::new();
    {
        let _active = ActiveDevice::push(host.as_ref()).expect("activate");
        aabbs
            .alloc_and_upload(host.as_ref(), &[0.0f32, 0.0, 0.0, 1.0, 1.0, 1.0], "aabb")
            .expect("upload");
    }
    let input = GeometryInput::CustomPrimitives(AabbInput {
        aabbs: aabbs.address(),
        primitive_count: 1,
        stride: 24,
    });

    let scene = Scene::new(devices, AccelConfig::default()).expect("scene");
    let geom = scene
        .create_geom(GeomKind::User, StaticGeometry::uniform(input, 1))
        .expect("geom");
    let leaf = scene.create_user_geom_group(1).expect("leaf");
    scene.geom_group_set_child(leaf, 0, Some(geom)).expect("set geom");
    scene.build_accel(leaf).expect("build leaf");

    let mut group = c.benchmark_group("refit");
    for count in [1_024usize, 16_384] {
        let top = scene
            .create_instance_group_with_children(&vec![leaf; count])
            .expect("top");
        for slot in 0..count {
            let t = Affine3A::from_translation(Vec3::new(slot as f32, 0.0, 0.0));
            scene
                .instance_group_set_transform(top, 0, slot, t)
                .expect("transform");
        }
        scene.build_accel(top).expect("build top");

        group.bench_with_input(BenchmarkId::from_parameter(count), &top, |b, top| {
            b.iter(|| scene.refit_accel(black_box(*top)).expect("refit"));
        });
    }
    group.finish();

    drop(scene);
    let _active = ActiveDevice::push(host.as_ref()).expect("activate");
    aabbs.free(host.as_ref()).expect("free");
}

criterion_group!(benches, bench_motion_records, bench_refit);
criterion_main!(benches);
