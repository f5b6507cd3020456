//! Software backend that executes builds on the host.
//!
//! The host backend keeps device memory in host allocations, validates every
//! build the way a driver would (buffer sizes, live handles, update
//! compatibility) and records what it built so callers can inspect the
//! encoded instance arrays. It is used for headless runs and tests.

use crate::accelerator::{Accelerator, ContextToken};
use crate::build::{
    AccelBufferSizes, AccelBuildOptions, BuildFlags, BuildInput, BuildOperation, GeometryInput,
    InstanceDesc, MatrixMotionTransform, TraversableType,
};
use crate::capabilities::RayTracingCapabilities;
use crate::error::{GpuError, Result};
use crate::memory::{DeviceAllocator, DeviceMemory};
use hashbrown::HashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use strata_core::{DeviceAddress, DeviceId, TraversableHandle};

const NO_DEVICE: u64 = u64::MAX;
const MOTION_HANDLE_TAG: u64 = 0x1;
const STRUCTURE_HANDLE_TAG: u64 = 0x2;
const HANDLE_TAG_MASK: u64 = 0x3;
const FIRST_ADDRESS: u64 = 0x1_0000;

thread_local! {
    static ACTIVE_DEVICE: Cell<u64> = const { Cell::new(NO_DEVICE) };
}

/// Limits of a host device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostDeviceConfig {
    /// Device name reported in capabilities.
    pub name: String,
    /// Maximum instances in one top-level structure.
    pub max_instances_per_ias: u32,
    /// Largest instance ID accepted in an instance record.
    pub max_instance_id: u32,
    /// Largest SBT offset accepted in an instance record.
    pub max_sbt_offset: u32,
    /// Whether motion transforms are supported.
    pub supports_motion_blur: bool,
    /// Allocation granularity and alignment in bytes.
    pub alignment: u64,
}

impl Default for HostDeviceConfig {
    fn default() -> Self {
        Self {
            name: "host".to_string(),
            max_instances_per_ias: 1 << 24,
            max_instance_id: u32::MAX,
            max_sbt_offset: u32::MAX,
            supports_motion_blur: true,
            alignment: 256,
        }
    }
}

/// Counters of backend calls.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HostStats {
    pub pushes: u64,
    pub pops: u64,
    pub builds: u64,
    pub updates: u64,
    pub synchronizations: u64,
}

/// Snapshot of the most recent successful build.
#[derive(Debug, Clone)]
pub struct BuildRecord {
    pub operation: BuildOperation,
    pub flags: BuildFlags,
    pub handle: TraversableHandle,
    /// Decoded instance array for top-level builds.
    pub instances: Vec<InstanceDesc>,
    /// Motion transforms referenced by the instances, in instance order.
    pub motion_transforms: Vec<MatrixMotionTransform>,
    /// Geometries of bottom-level builds.
    pub geometries: Vec<GeometryInput>,
    pub temp_size: u64,
    pub output_size: u64,
}

struct Allocation {
    bytes: Vec<u8>,
    name: String,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum StructureKind {
    Instances,
    Geometries,
}

struct Structure {
    handle: TraversableHandle,
    kind: StructureKind,
    primitive_count: u64,
    allow_update: bool,
}

#[derive(Default)]
struct HostState {
    allocations: BTreeMap<u64, Allocation>,
    next_address: u64,
    /// Built structures keyed by the address of their output block.
    structures: HashMap<u64, Structure>,
    /// Live structure handles and the output block holding them.
    handles: HashMap<TraversableHandle, u64>,
    next_handle: u64,
}

impl HostState {
    /// Bytes `[address, address + len)` if they lie inside one allocation.
    /// An empty range resolves at any address.
    fn bytes(&self, address: u64, len: u64) -> Option<&[u8]> {
        if len == 0 {
            return Some(&[]);
        }
        let (base, alloc) = self.allocations.range(..=address).next_back()?;
        let start = (address - base) as usize;
        let end = start.checked_add(len as usize)?;
        alloc.bytes.get(start..end)
    }

    fn bytes_mut(&mut self, address: u64, len: u64) -> Option<&mut [u8]> {
        let (base, alloc) = self.allocations.range_mut(..=address).next_back()?;
        let start = (address - *base) as usize;
        let end = start.checked_add(len as usize)?;
        alloc.bytes.get_mut(start..end)
    }

    fn read_motion_transform(&self, handle: TraversableHandle) -> Option<MatrixMotionTransform> {
        let address = handle.0 & !HANDLE_TAG_MASK;
        let size = std::mem::size_of::<MatrixMotionTransform>() as u64;
        self.bytes(address, size)
            .map(bytemuck::pod_read_unaligned::<MatrixMotionTransform>)
    }

    /// Resolve an instance's traversable, following motion transforms to the
    /// structure they wrap.
    fn check_traversable(
        &self,
        handle: TraversableHandle,
        motion: &mut Vec<MatrixMotionTransform>,
    ) -> std::result::Result<(), String> {
        match handle.0 & HANDLE_TAG_MASK {
            STRUCTURE_HANDLE_TAG if self.handles.contains_key(&handle) => Ok(()),
            MOTION_HANDLE_TAG => {
                let record = self
                    .read_motion_transform(handle)
                    .ok_or_else(|| format!("motion transform {handle} is not in live memory"))?;
                if !self.handles.contains_key(&record.child) {
                    return Err(format!(
                        "motion transform {handle} wraps unknown traversable {}",
                        record.child
                    ));
                }
                motion.push(record);
                Ok(())
            }
            _ => Err(format!("unknown traversable {handle}")),
        }
    }
}

/// A device backed by host memory.
pub struct HostAccelerator {
    id: DeviceId,
    config: HostDeviceConfig,
    capabilities: RayTracingCapabilities,
    state: Mutex<HostState>,
    last_build: Mutex<Option<BuildRecord>>,
    fail_next_build: AtomicBool,
    pushes: AtomicU64,
    pops: AtomicU64,
    builds: AtomicU64,
    updates: AtomicU64,
    synchronizations: AtomicU64,
}

impl HostAccelerator {
    /// Create a host device.
    pub fn new(id: DeviceId, config: HostDeviceConfig) -> Self {
        let capabilities = RayTracingCapabilities {
            device_name: format!("{} ({id})", config.name),
            max_instances_per_ias: config.max_instances_per_ias,
            max_instance_id: config.max_instance_id,
            max_sbt_offset: config.max_sbt_offset,
            supports_motion_blur: config.supports_motion_blur,
            transform_alignment: 64,
        };
        Self {
            id,
            capabilities,
            state: Mutex::new(HostState {
                next_address: FIRST_ADDRESS,
                next_handle: 1,
                ..HostState::default()
            }),
            config,
            last_build: Mutex::new(None),
            fail_next_build: AtomicBool::new(false),
            pushes: AtomicU64::new(0),
            pops: AtomicU64::new(0),
            builds: AtomicU64::new(0),
            updates: AtomicU64::new(0),
            synchronizations: AtomicU64::new(0),
        }
    }

    /// Whether this device is the active context on the calling thread.
    pub fn is_active(&self) -> bool {
        ACTIVE_DEVICE.with(Cell::get) == u64::from(self.id.0)
    }

    /// Make the next build call fail, as a driver error would.
    pub fn fail_next_build(&self) {
        self.fail_next_build.store(true, Ordering::SeqCst);
    }

    /// Call counters.
    pub fn stats(&self) -> HostStats {
        HostStats {
            pushes: self.pushes.load(Ordering::SeqCst),
            pops: self.pops.load(Ordering::SeqCst),
            builds: self.builds.load(Ordering::SeqCst),
            updates: self.updates.load(Ordering::SeqCst),
            synchronizations: self.synchronizations.load(Ordering::SeqCst),
        }
    }

    /// The most recent successful build.
    pub fn last_build(&self) -> Option<BuildRecord> {
        self.last_build.lock().clone()
    }

    /// Number of live allocations.
    pub fn live_allocations(&self) -> usize {
        self.state.lock().allocations.len()
    }

    /// Total bytes currently allocated.
    pub fn allocated_bytes(&self) -> u64 {
        self.state
            .lock()
            .allocations
            .values()
            .map(|a| a.bytes.len() as u64)
            .sum()
    }

    /// Names of live allocations, for leak reports.
    pub fn allocation_names(&self) -> Vec<String> {
        self.state
            .lock()
            .allocations
            .values()
            .map(|a| a.name.clone())
            .collect()
    }

    /// Copy device bytes back to the host.
    pub fn read_bytes(&self, address: DeviceAddress, len: u64) -> Result<Vec<u8>> {
        self.state
            .lock()
            .bytes(address.0, len)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| {
                GpuError::InvalidState(format!("{len} bytes at {address} are not allocated"))
            })
    }

    fn require_active(&self) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(GpuError::DeviceNotActive(self.id))
        }
    }

    fn align(&self, size: u64) -> u64 {
        let alignment = self.config.alignment.max(1);
        size.div_ceil(alignment) * alignment
    }

    fn sizes_for(&self, input: &BuildInput) -> AccelBufferSizes {
        let prims = input.primitive_count();
        let (output, temp, update) = match input {
            BuildInput::Instances { .. } => (256 + 128 * prims, 512 + 64 * prims, 128 + 16 * prims),
            BuildInput::Geometries(_) => (256 + 64 * prims, 256 + 32 * prims, 64 + 8 * prims),
        };
        AccelBufferSizes {
            output_size_in_bytes: self.align(output),
            temp_size_in_bytes: self.align(temp),
            temp_update_size_in_bytes: self.align(update),
        }
    }

    fn check_geometry(state: &HostState, geom: &GeometryInput) -> std::result::Result<(), String> {
        match geom {
            GeometryInput::Triangles(t) => {
                let vertex_bytes = u64::from(t.vertex_count) * u64::from(t.vertex_stride);
                let index_bytes = u64::from(t.triangle_count) * 12;
                if state.bytes(t.vertices.0, vertex_bytes).is_none() {
                    return Err(format!("vertex buffer at {} is not allocated", t.vertices));
                }
                if t.triangle_count > 0 && state.bytes(t.indices.0, index_bytes).is_none() {
                    return Err(format!("index buffer at {} is not allocated", t.indices));
                }
            }
            GeometryInput::CustomPrimitives(a) => {
                let bytes = u64::from(a.primitive_count) * u64::from(a.stride);
                if state.bytes(a.aabbs.0, bytes).is_none() {
                    return Err(format!("aabb buffer at {} is not allocated", a.aabbs));
                }
            }
        }
        Ok(())
    }
}

impl DeviceAllocator for HostAccelerator {
    fn allocate(&self, size: u64, name: &str) -> Result<DeviceAddress> {
        self.require_active()?;
        let len = usize::try_from(size)
            .map_err(|_| GpuError::AllocationFailed(format!("{size} bytes for {name}")))?;
        let mut state = self.state.lock();
        let address = state.next_address;
        state.next_address += self.align(size.max(1));
        state.allocations.insert(
            address,
            Allocation {
                bytes: vec![0; len],
                name: name.to_string(),
            },
        );
        Ok(DeviceAddress(address))
    }

    fn write(&self, address: DeviceAddress, bytes: &[u8]) -> Result<()> {
        self.require_active()?;
        let mut state = self.state.lock();
        let dst = state.bytes_mut(address.0, bytes.len() as u64).ok_or_else(|| {
            GpuError::UploadFailed(format!(
                "{} bytes at {address} exceed the allocation",
                bytes.len()
            ))
        })?;
        dst.copy_from_slice(bytes);
        Ok(())
    }

    fn release(&self, address: DeviceAddress) -> Result<()> {
        self.require_active()?;
        let mut state = self.state.lock();
        if state.allocations.remove(&address.0).is_none() {
            return Err(GpuError::InvalidState(format!(
                "free of unknown allocation {address}"
            )));
        }
        if let Some(structure) = state.structures.remove(&address.0) {
            state.handles.remove(&structure.handle);
        }
        Ok(())
    }
}

impl Accelerator for HostAccelerator {
    fn device_id(&self) -> DeviceId {
        self.id
    }

    fn capabilities(&self) -> &RayTracingCapabilities {
        &self.capabilities
    }

    fn compute_memory_usage(
        &self,
        _options: &AccelBuildOptions,
        input: &BuildInput,
    ) -> Result<AccelBufferSizes> {
        self.require_active()?;
        Ok(self.sizes_for(input))
    }

    fn build(
        &self,
        options: &AccelBuildOptions,
        input: &BuildInput,
        temp: &DeviceMemory,
        output: &DeviceMemory,
    ) -> Result<TraversableHandle> {
        self.require_active()?;
        if self.fail_next_build.swap(false, Ordering::SeqCst) {
            return Err(GpuError::BuildFailed("injected device failure".to_string()));
        }

        let sizes = self.sizes_for(input);
        let temp_needed = sizes.temp_size_for(options.operation);
        if temp.size() < temp_needed {
            return Err(GpuError::BuildFailed(format!(
                "temp buffer holds {} bytes, {temp_needed} needed",
                temp.size()
            )));
        }
        if output.size() < sizes.output_size_in_bytes {
            return Err(GpuError::BuildFailed(format!(
                "output buffer holds {} bytes, {} needed",
                output.size(),
                sizes.output_size_in_bytes
            )));
        }

        let mut state = self.state.lock();
        if !state.allocations.contains_key(&output.address().0) {
            return Err(GpuError::BuildFailed(format!(
                "output block {} is not allocated",
                output.address()
            )));
        }

        let mut instances = Vec::new();
        let mut motion_transforms = Vec::new();
        let mut geometries = Vec::new();
        let kind = match input {
            BuildInput::Instances {
                instances: address,
                count,
            } => {
                let len = u64::from(*count) * std::mem::size_of::<InstanceDesc>() as u64;
                let bytes = state.bytes(address.0, len).ok_or_else(|| {
                    GpuError::BuildFailed(format!("instance array at {address} is not allocated"))
                })?;
                instances = bytes
                    .chunks_exact(std::mem::size_of::<InstanceDesc>())
                    .map(bytemuck::pod_read_unaligned::<InstanceDesc>)
                    .collect();
                for (i, inst) in instances.iter().enumerate() {
                    state
                        .check_traversable(inst.traversable_handle, &mut motion_transforms)
                        .map_err(|e| GpuError::BuildFailed(format!("instance {i}: {e}")))?;
                }
                StructureKind::Instances
            }
            BuildInput::Geometries(geoms) => {
                for geom in geoms {
                    Self::check_geometry(&state, geom).map_err(GpuError::BuildFailed)?;
                }
                geometries.clone_from(geoms);
                StructureKind::Geometries
            }
        };

        let primitive_count = input.primitive_count();
        let allow_update = options.build_flags.contains(BuildFlags::ALLOW_UPDATE);
        let handle = match options.operation {
            BuildOperation::Build => {
                let handle = TraversableHandle((state.next_handle << 6) | STRUCTURE_HANDLE_TAG);
                state.next_handle += 1;
                if let Some(old) = state.structures.insert(
                    output.address().0,
                    Structure {
                        handle,
                        kind,
                        primitive_count,
                        allow_update,
                    },
                ) {
                    state.handles.remove(&old.handle);
                }
                state.handles.insert(handle, output.address().0);
                self.builds.fetch_add(1, Ordering::SeqCst);
                handle
            }
            BuildOperation::Update => {
                let existing = state.structures.get(&output.address().0).ok_or_else(|| {
                    GpuError::BuildFailed("update of a block that holds no structure".to_string())
                })?;
                if !existing.allow_update {
                    return Err(GpuError::BuildFailed(
                        "structure was not built with ALLOW_UPDATE".to_string(),
                    ));
                }
                if existing.kind != kind || existing.primitive_count != primitive_count {
                    return Err(GpuError::BuildFailed(
                        "update input does not match the built topology".to_string(),
                    ));
                }
                self.updates.fetch_add(1, Ordering::SeqCst);
                existing.handle
            }
        };
        drop(state);

        *self.last_build.lock() = Some(BuildRecord {
            operation: options.operation,
            flags: options.build_flags,
            handle,
            instances,
            motion_transforms,
            geometries,
            temp_size: temp.size(),
            output_size: output.size(),
        });
        Ok(handle)
    }

    fn convert_pointer_to_handle(
        &self,
        address: DeviceAddress,
        ty: TraversableType,
    ) -> Result<TraversableHandle> {
        self.require_active()?;
        match ty {
            TraversableType::MatrixMotionTransform => {
                if !self.config.supports_motion_blur {
                    return Err(GpuError::Unsupported(
                        "matrix motion transforms".to_string(),
                    ));
                }
                if address.0 % self.capabilities.transform_alignment != 0 {
                    return Err(GpuError::InvalidState(format!(
                        "motion transform at {address} is not {}-byte aligned",
                        self.capabilities.transform_alignment
                    )));
                }
                let size = std::mem::size_of::<MatrixMotionTransform>() as u64;
                if self.state.lock().bytes(address.0, size).is_none() {
                    return Err(GpuError::InvalidState(format!(
                        "motion transform at {address} is not allocated"
                    )));
                }
                Ok(TraversableHandle(address.0 | MOTION_HANDLE_TAG))
            }
        }
    }

    fn synchronize(&self) -> Result<()> {
        self.require_active()?;
        self.synchronizations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn push_active(&self) -> Result<ContextToken> {
        self.pushes.fetch_add(1, Ordering::SeqCst);
        let previous = ACTIVE_DEVICE.with(|active| active.replace(u64::from(self.id.0)));
        Ok(ContextToken(previous))
    }

    fn pop_active(&self, previous: ContextToken) {
        self.pops.fetch_add(1, Ordering::SeqCst);
        ACTIVE_DEVICE.with(|active| active.set(previous.0));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accelerator::ActiveDevice;
    use crate::memory::ScopedMemory;
    use strata_core::RowMajor3x4;

    fn device() -> HostAccelerator {
        HostAccelerator::new(DeviceId(0), HostDeviceConfig::default())
    }

    #[test]
    fn calls_outside_active_context_fail() {
        let dev = device();
        assert!(matches!(
            dev.allocate(64, "x"),
            Err(GpuError::DeviceNotActive(DeviceId(0)))
        ));
        let _active = ActiveDevice::push(&dev).unwrap();
        assert!(dev.allocate(64, "x").is_ok());
    }

    #[test]
    fn nested_push_restores_outer_device() {
        let a = HostAccelerator::new(DeviceId(0), HostDeviceConfig::default());
        let b = HostAccelerator::new(DeviceId(1), HostDeviceConfig::default());
        let _outer = ActiveDevice::push(&a).unwrap();
        {
            let _inner = ActiveDevice::push(&b).unwrap();
            assert!(b.is_active());
            assert!(!a.is_active());
        }
        assert!(a.is_active());
    }

    #[test]
    fn memory_upload_and_free() {
        let dev = device();
        let _active = ActiveDevice::push(&dev).unwrap();

        let mut block = DeviceMemory::new();
        block.alloc_and_upload(&dev, &[1u32, 2, 3], "numbers").unwrap();
        assert_eq!(block.size(), 12);
        let bytes = dev.read_bytes(block.address(), 12).unwrap();
        assert_eq!(bytemuck::cast_slice::<u8, u32>(&bytes), &[1, 2, 3]);

        assert!(block.upload(&dev, &[0u32; 4]).is_err());

        block.free(&dev).unwrap();
        assert!(block.is_empty());
        assert_eq!(block.size(), 0);
        assert_eq!(dev.live_allocations(), 0);
    }

    #[test]
    fn scoped_memory_is_freed_on_drop() {
        let dev = device();
        let _active = ActiveDevice::push(&dev).unwrap();
        {
            let temp = ScopedMemory::alloc(&dev, 1024, "temp").unwrap();
            assert_eq!(temp.size(), 1024);
            assert_eq!(dev.live_allocations(), 1);
        }
        assert_eq!(dev.live_allocations(), 0);
    }

    fn build_leaf(dev: &HostAccelerator, output: &mut DeviceMemory) -> TraversableHandle {
        let mut aabbs = DeviceMemory::new();
        aabbs.alloc_and_upload(dev, &[0.0f32; 6], "aabbs").unwrap();
        let input = BuildInput::Geometries(vec![GeometryInput::CustomPrimitives(
            crate::build::AabbInput {
                aabbs: aabbs.address(),
                primitive_count: 1,
                stride: 24,
            },
        )]);
        let options = AccelBuildOptions::new(
            BuildFlags::PREFER_FAST_TRACE | BuildFlags::ALLOW_UPDATE,
            BuildOperation::Build,
        );
        let sizes = dev.compute_memory_usage(&options, &input).unwrap();
        let temp = ScopedMemory::alloc(dev, sizes.temp_size_in_bytes, "temp").unwrap();
        output.alloc(dev, sizes.output_size_in_bytes, "leaf").unwrap();
        let handle = dev.build(&options, &input, &temp, output).unwrap();
        aabbs.free(dev).unwrap();
        handle
    }

    #[test]
    fn instance_build_rejects_unknown_handles() {
        let dev = device();
        let _active = ActiveDevice::push(&dev).unwrap();

        let mut leaf = DeviceMemory::new();
        let leaf_handle = build_leaf(&dev, &mut leaf);
        assert!(!leaf_handle.is_null());

        let mut instances = DeviceMemory::new();
        let good = InstanceDesc::new(RowMajor3x4::IDENTITY, 0, 0, 0xFF, leaf_handle);
        let bad = InstanceDesc::new(RowMajor3x4::IDENTITY, 1, 0, 0xFF, TraversableHandle(0x42));
        instances
            .alloc_and_upload(&dev, &[good, bad], "instances")
            .unwrap();

        let input = BuildInput::Instances {
            instances: instances.address(),
            count: 2,
        };
        let options = AccelBuildOptions::new(BuildFlags::ALLOW_UPDATE, BuildOperation::Build);
        let sizes = dev.compute_memory_usage(&options, &input).unwrap();
        let temp = ScopedMemory::alloc(&dev, sizes.temp_size_in_bytes, "temp").unwrap();
        let mut output = DeviceMemory::new();
        output.alloc(&dev, sizes.output_size_in_bytes, "top").unwrap();

        let err = dev.build(&options, &input, &temp, &output).unwrap_err();
        assert!(matches!(err, GpuError::BuildFailed(_)));

        drop(temp);
        output.free(&dev).unwrap();
        instances.free(&dev).unwrap();
        leaf.free(&dev).unwrap();
        assert_eq!(dev.live_allocations(), 0);
    }

    #[test]
    fn update_keeps_handle_and_needs_allow_update() {
        let dev = device();
        let _active = ActiveDevice::push(&dev).unwrap();
        let mut leaf = DeviceMemory::new();
        let handle = build_leaf(&dev, &mut leaf);

        let mut aabbs = DeviceMemory::new();
        aabbs.alloc_and_upload(&dev, &[1.0f32; 6], "aabbs").unwrap();
        let input = BuildInput::Geometries(vec![GeometryInput::CustomPrimitives(
            crate::build::AabbInput {
                aabbs: aabbs.address(),
                primitive_count: 1,
                stride: 24,
            },
        )]);
        let options = AccelBuildOptions::new(BuildFlags::ALLOW_UPDATE, BuildOperation::Update);
        let sizes = dev.compute_memory_usage(&options, &input).unwrap();
        let temp = ScopedMemory::alloc(&dev, sizes.temp_update_size_in_bytes, "temp").unwrap();
        let updated = dev.build(&options, &input, &temp, &leaf).unwrap();
        assert_eq!(updated, handle);
        assert_eq!(dev.stats().updates, 1);

        drop(temp);
        aabbs.free(&dev).unwrap();
        leaf.free(&dev).unwrap();
    }

    #[test]
    fn injected_failure_is_reported_once() {
        let dev = device();
        let _active = ActiveDevice::push(&dev).unwrap();
        dev.fail_next_build();
        let mut output = DeviceMemory::new();
        output.alloc(&dev, 4096, "out").unwrap();
        let temp = ScopedMemory::alloc(&dev, 4096, "temp").unwrap();
        let options = AccelBuildOptions::new(BuildFlags::NONE, BuildOperation::Build);
        let input = BuildInput::Geometries(Vec::new());
        assert!(dev.build(&options, &input, &temp, &output).is_err());
        assert!(dev.build(&options, &input, &temp, &output).is_ok());
        drop(temp);
        output.free(&dev).unwrap();
    }

    #[test]
    fn empty_instance_array_builds() {
        let dev = device();
        let _active = ActiveDevice::push(&dev).unwrap();
        let input = BuildInput::Instances {
            instances: DeviceAddress::NULL,
            count: 0,
        };
        let options = AccelBuildOptions::new(BuildFlags::ALLOW_UPDATE, BuildOperation::Build);
        let sizes = dev.compute_memory_usage(&options, &input).unwrap();
        let temp = ScopedMemory::alloc(&dev, sizes.temp_size_in_bytes, "temp").unwrap();
        let mut output = DeviceMemory::new();
        output.alloc(&dev, sizes.output_size_in_bytes, "top").unwrap();

        let handle = dev.build(&options, &input, &temp, &output).unwrap();
        assert!(!handle.is_null());
        assert!(dev.last_build().unwrap().instances.is_empty());

        drop(temp);
        output.free(&dev).unwrap();
    }

    #[test]
    fn motion_handles_need_alignment() {
        let dev = device();
        let _active = ActiveDevice::push(&dev).unwrap();
        let mut block = DeviceMemory::new();
        block.alloc(&dev, 256, "motion").unwrap();
        let ok = dev
            .convert_pointer_to_handle(block.address(), TraversableType::MatrixMotionTransform)
            .unwrap();
        assert_eq!(ok.0 & HANDLE_TAG_MASK, MOTION_HANDLE_TAG);
        assert!(dev
            .convert_pointer_to_handle(
                block.address().offset(8),
                TraversableType::MatrixMotionTransform
            )
            .is_err());
        block.free(&dev).unwrap();
    }
}
