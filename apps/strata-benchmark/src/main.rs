//! Strata build and refit timings on host devices.
//!
//! Usage: `strata-benchmark [instances] [devices] [frames]`

use anyhow::{Context, Result};
use glam::{Affine3A, Vec3};
use std::sync::Arc;
use std::time::{Duration, Instant};
use strata_accel::{AccelConfig, GeomKind, Scene, StaticGeometry};
use strata_core::DeviceId;
use strata_gpu::{
    AabbInput, Accelerator, ActiveDevice, DeviceMemory, DeviceSetBuilder, GeometryInput,
    HostAccelerator, HostDeviceConfig,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

struct Args {
    instances: usize,
    devices: u32,
    frames: usize,
}

fn parse_args() -> Result<Args> {
    let mut args = std::env::args().skip(1);
    let mut next = |name: &str, default: usize| -> Result<usize> {
        args.next()
            .map_or(Ok(default), |v| v.parse().with_context(|| format!("invalid {name}: {v}")))
    };
    Ok(Args {
        instances: next("instance count", 16 * 1024)?,
        devices: u32::try_from(next("device count", 2)?).context("too many devices")?,
        frames: next("frame count", 30)?,
    })
}

fn report(label: &str, frames: usize, elapsed: Duration) {
    let per_frame = elapsed / u32::try_from(frames.max(1)).unwrap_or(u32::MAX);
    info!("{label}: {frames} frames in {elapsed:?} ({per_frame:?} per frame)");
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = parse_args()?;
    info!(
        "Strata benchmark: {} instances on {} host devices, {} frames",
        args.instances, args.devices, args.frames
    );

    let hosts: Vec<_> = (0..args.devices)
        .map(|i| Arc::new(HostAccelerator::new(DeviceId(i), HostDeviceConfig::default())))
        .collect();
    let mut builder = DeviceSetBuilder::new();
    for host in &hosts {
        builder = builder.device(host.clone());
    }

    let mut boxes = Vec::with_capacity(hosts.len());
    let mut inputs = Vec::with_capacity(hosts.len());
    for host in &hosts {
        let _active = ActiveDevice::push(host.as_ref())?;
        let mut block = DeviceMemory::new();
        block.alloc_and_upload(host.as_ref(), &[-0.5f32, -0.5, -0.5, 0.5, 0.5, 0.5], "unit box")?;
        inputs.push(GeometryInput::CustomPrimitives(AabbInput {
            aabbs: block.address(),
            primitive_count: 1,
            stride: 24,
        }));
        boxes.push(block);
    }

    let scene = Scene::new(builder.build()?, AccelConfig::default())?;
    let geom = scene.create_geom(GeomKind::User, StaticGeometry::new(inputs))?;
    let leaf = scene.create_user_geom_group(1)?;
    scene.geom_group_set_child(leaf, 0, Some(geom))?;
    scene.build_accel(leaf)?;

    let start = Instant::now();
    let top = scene.create_instance_group_with_children(&vec![leaf; args.instances])?;
    info!("Populated {} slots in {:?}", args.instances, start.elapsed());

    let side = (args.instances as f64).cbrt().ceil() as usize;
    let place = |slot: usize, t: f32| {
        let (x, y, z) = (slot % side, (slot / side) % side, slot / (side * side));
        Affine3A::from_translation(Vec3::new(x as f32 + t, y as f32, z as f32) * 2.0)
    };
    for slot in 0..args.instances {
        scene.instance_group_set_transform(top, 0, slot, place(slot, 0.0))?;
    }

    let start = Instant::now();
    scene.build_accel(top)?;
    info!(
        "Full build: {:?} ({} bytes per device)",
        start.elapsed(),
        scene.accel_memory_size(top, DeviceId(0))?
    );

    let start = Instant::now();
    for frame in 0..args.frames {
        let t = frame as f32 / args.frames.max(1) as f32;
        for slot in (0..args.instances).step_by(7) {
            scene.instance_group_set_transform(top, 0, slot, place(slot, t))?;
        }
        scene.refit_accel(top)?;
    }
    report("Static refit", args.frames, start.elapsed());

    // Second keys switch the group to motion blur, which needs a full rebuild.
    scene.destroy_accel(top)?;
    for slot in 0..args.instances {
        scene.instance_group_set_transform(top, 1, slot, place(slot, 0.5))?;
    }
    let start = Instant::now();
    scene.build_accel(top)?;
    info!("Motion build: {:?}", start.elapsed());

    let start = Instant::now();
    for frame in 0..args.frames {
        let t = frame as f32 / args.frames.max(1) as f32;
        for slot in (0..args.instances).step_by(7) {
            scene.instance_group_set_transform(top, 1, slot, place(slot, 0.5 + t))?;
        }
        scene.refit_accel(top)?;
    }
    report("Motion refit", args.frames, start.elapsed());

    for host in &hosts {
        let stats = host.stats();
        info!(
            "{}: {} builds, {} updates, {} bytes live",
            host.capabilities().summary(),
            stats.builds,
            stats.updates,
            host.allocated_bytes()
        );
    }

    drop(scene);
    for (host, mut block) in hosts.iter().zip(boxes) {
        let _active = ActiveDevice::push(host.as_ref())?;
        block.free(host.as_ref())?;
    }
    Ok(())
}
