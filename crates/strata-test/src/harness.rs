//! Host-backed scenes for integration tests.

use glam::Vec3;
use std::sync::Arc;
use strata_accel::{AccelConfig, GeomKind, Scene, StaticGeometry};
use strata_core::{DeviceAddress, DeviceId, GeomId, GroupId};
use strata_gpu::{
    AabbInput, ActiveDevice, DeviceMemory, DeviceSetBuilder, GeometryInput, HostAccelerator,
    HostDeviceConfig, TriangleInput,
};
use tracing_subscriber::EnvFilter;

use crate::{Result, TestError};

/// Install a test-friendly subscriber once; `RUST_LOG` selects the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// A scene on several host devices.
///
/// Geometry buffers uploaded through the harness are owned by it and freed
/// when it is dropped.
pub struct TestScene {
    hosts: Vec<Arc<HostAccelerator>>,
    buffers: Vec<(DeviceId, DeviceMemory)>,
    scene: Scene,
}

impl TestScene {
    /// A scene on `device_count` default host devices.
    pub fn new(device_count: u32) -> Result<Self> {
        Self::with_config(device_count, &HostDeviceConfig::default(), AccelConfig::default())
    }

    /// A scene on `device_count` host devices with the given limits.
    pub fn with_config(
        device_count: u32,
        host: &HostDeviceConfig,
        config: AccelConfig,
    ) -> Result<Self> {
        init_tracing();
        let hosts: Vec<_> = (0..device_count)
            .map(|i| Arc::new(HostAccelerator::new(DeviceId(i), host.clone())))
            .collect();
        let mut builder = DeviceSetBuilder::new();
        for host in &hosts {
            builder = builder.device(host.clone());
        }
        let scene = Scene::new(builder.build()?, config)?;
        Ok(Self {
            hosts,
            buffers: Vec::new(),
            scene,
        })
    }

    pub const fn scene(&self) -> &Scene {
        &self.scene
    }

    pub fn hosts(&self) -> &[Arc<HostAccelerator>] {
        &self.hosts
    }

    pub fn host(&self, device: DeviceId) -> &HostAccelerator {
        &self.hosts[device.index()]
    }

    pub fn device_ids(&self) -> impl Iterator<Item = DeviceId> {
        (0..self.hosts.len() as u32).map(DeviceId)
    }

    /// Upload `data` to one device.
    pub fn upload<T: bytemuck::Pod>(
        &mut self,
        device: DeviceId,
        data: &[T],
        name: &str,
    ) -> Result<DeviceAddress> {
        let host = self.hosts[device.index()].clone();
        let _active = ActiveDevice::push(host.as_ref())?;
        let mut block = DeviceMemory::new();
        block.alloc_and_upload(host.as_ref(), data, name)?;
        let address = block.address();
        self.buffers.push((device, block));
        Ok(address)
    }

    /// Register a user geometry made of axis-aligned boxes.
    pub fn user_geom(&mut self, boxes: &[[f32; 6]]) -> Result<GeomId> {
        let mut inputs = Vec::with_capacity(self.hosts.len());
        for device in self.device_ids().collect::<Vec<_>>() {
            let aabbs = self.upload(device, boxes, "test aabbs")?;
            inputs.push(GeometryInput::CustomPrimitives(AabbInput {
                aabbs,
                primitive_count: boxes.len() as u32,
                stride: 24,
            }));
        }
        Ok(self
            .scene
            .create_geom(GeomKind::User, StaticGeometry::new(inputs))?)
    }

    /// Register an indexed triangle mesh.
    pub fn triangle_geom(&mut self, vertices: &[Vec3], indices: &[[u32; 3]]) -> Result<GeomId> {
        let packed: Vec<[f32; 3]> = vertices.iter().map(|v| v.to_array()).collect();
        let mut inputs = Vec::with_capacity(self.hosts.len());
        for device in self.device_ids().collect::<Vec<_>>() {
            let vertex_data = self.upload(device, &packed, "test vertices")?;
            let index_data = self.upload(device, indices, "test indices")?;
            inputs.push(GeometryInput::Triangles(TriangleInput {
                vertices: vertex_data,
                vertex_count: packed.len() as u32,
                vertex_stride: 12,
                indices: index_data,
                triangle_count: indices.len() as u32,
            }));
        }
        Ok(self
            .scene
            .create_geom(GeomKind::Triangles, StaticGeometry::new(inputs))?)
    }

    /// A unit-box user geometry group, built on every device.
    pub fn built_leaf(&mut self) -> Result<GroupId> {
        let geom = self.user_geom(&[[0.0, 0.0, 0.0, 1.0, 1.0, 1.0]])?;
        let leaf = self.scene.create_user_geom_group(1)?;
        self.scene.geom_group_set_child(leaf, 0, Some(geom))?;
        self.scene.build_accel(leaf)?;
        Ok(leaf)
    }

    /// Every group agrees on handle, memory and state on every device.
    pub fn check_consistent(&self) -> Result<()> {
        for id in self.scene.group_ids() {
            let group = self.scene.group(id)?;
            if !group.is_consistent() {
                return Err(TestError::Inconsistent(format!("{id}")));
            }
        }
        Ok(())
    }

    /// Allocations on `device` other than the harness's own buffers.
    pub fn scene_allocations(&self, device: DeviceId) -> usize {
        let own = self.buffers.iter().filter(|(d, _)| *d == device).count();
        self.host(device).live_allocations().saturating_sub(own)
    }

    /// Fail if any device holds memory beyond the harness's buffers.
    pub fn check_no_scene_memory(&self) -> Result<()> {
        for device in self.device_ids() {
            let extra = self.scene_allocations(device);
            if extra != 0 {
                return Err(TestError::Leak(format!(
                    "{extra} blocks on {device}: {:?}",
                    self.host(device).allocation_names()
                )));
            }
        }
        Ok(())
    }
}

impl Drop for TestScene {
    fn drop(&mut self) {
        for (device, block) in &mut self.buffers {
            let host = &self.hosts[device.index()];
            let freed = ActiveDevice::push(host.as_ref())
                .and_then(|_active| block.free(host.as_ref()));
            if let Err(e) = freed {
                tracing::warn!("failed to free test buffer on {device}: {e}");
            }
        }
    }
}
