//! Per-device build state and reference counts.

use crate::error::{AccelError, Result};
use std::sync::atomic::{AtomicU32, Ordering};
use strata_core::{DeviceId, GroupId, TraversableHandle};
use strata_gpu::{
    AccelBufferSizes, AccelBuildOptions, Accelerator, BuildInput, DeviceAllocator, DeviceMemory,
    ScopedMemory,
};
use tracing::warn;

/// Whether a group's structure exists on a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    Empty,
    Built,
}

/// Number of parent slots pointing at an object.
#[derive(Debug, Default)]
pub(crate) struct RefCount(AtomicU32);

impl RefCount {
    pub(crate) fn get(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn increment(&self) {
        self.0.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrement; never goes below zero.
    pub(crate) fn decrement(&self) -> Result<()> {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .map(|_| ())
            .map_err(|_| {
                AccelError::Precondition("reference count would drop below zero".to_string())
            })
    }
}

/// One group's structure on one device.
///
/// `handle` and `memory` are only ever set or cleared together.
#[derive(Debug, Default)]
pub(crate) struct DeviceAccel {
    pub handle: TraversableHandle,
    pub memory: DeviceMemory,
    /// Uploaded instance array (instance groups only).
    pub instances: DeviceMemory,
    /// Uploaded motion transforms (instance groups with motion blur only).
    pub motion_transforms: DeviceMemory,
    /// Whether the last full build used motion transforms.
    pub motion_blur: bool,
}

impl DeviceAccel {
    pub fn state(&self) -> BuildState {
        debug_assert!(self.is_consistent());
        if self.handle.is_null() {
            BuildState::Empty
        } else {
            BuildState::Built
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.handle.is_null() == self.memory.is_empty()
    }

    /// Reject a full build of a built structure or a refit of an empty one.
    pub fn check_operation(
        &self,
        full_rebuild: bool,
        group: GroupId,
        device: DeviceId,
    ) -> Result<()> {
        match (full_rebuild, self.state()) {
            (true, BuildState::Built) => Err(AccelError::Precondition(format!(
                "{group} is already built on {device}; destroy it before building again"
            ))),
            (false, BuildState::Empty) => Err(AccelError::Precondition(format!(
                "{group} has never been built on {device}; it cannot be refit"
            ))),
            _ => Ok(()),
        }
    }

    /// Run the backend build into `memory` and commit the new handle.
    ///
    /// The temp buffer lives only for this call and is released after the
    /// device has synchronized and the handle is committed. A failed full build leaves the state empty; a
    /// failed refit invalidates the structure since the backend may have
    /// partially overwritten it.
    pub fn execute(
        &mut self,
        device: &dyn Accelerator,
        options: &AccelBuildOptions,
        input: &BuildInput,
        sizes: &AccelBufferSizes,
        label: &str,
    ) -> Result<()> {
        let operation = options.operation;
        let full_rebuild = operation.is_full_rebuild();
        let temp = ScopedMemory::alloc(device, sizes.temp_size_for(operation), "accel temp")?;

        if full_rebuild {
            self.memory
                .alloc(device, sizes.output_size_in_bytes, label)?;
        }

        let result = device
            .build(options, input, &temp, &self.memory)
            .and_then(|handle| {
                device.synchronize()?;
                Ok(handle)
            })
            .and_then(|handle| {
                if handle.is_null() {
                    Err(strata_gpu::GpuError::BuildFailed(
                        "backend returned a null handle".to_string(),
                    ))
                } else {
                    Ok(handle)
                }
            });

        match result {
            Ok(handle) => {
                self.handle = handle;
                // The structure is complete; a temp block the backend refuses
                // to free is its leak, not a failed build.
                if let Err(e) = temp.free() {
                    warn!(device = %device.device_id(), "failed to free accel temp memory: {e}");
                }
                Ok(())
            }
            Err(e) => {
                // Work may still be queued against the temp buffer.
                let _ = device.synchronize();
                drop(temp);
                if !full_rebuild {
                    warn!(device = %device.device_id(), "refit failed, structure invalidated: {e}");
                }
                if let Err(free_err) = self.release(device) {
                    warn!("failed to release memory of a failed build: {free_err}");
                }
                Err(e.into())
            }
        }
    }

    /// Free everything and return to [`BuildState::Empty`].
    ///
    /// Every block is released even if an earlier one fails; the first error
    /// is returned.
    pub fn release<A: DeviceAllocator + ?Sized>(&mut self, allocator: &A) -> Result<()> {
        self.handle = TraversableHandle::NULL;
        self.motion_blur = false;
        let results = [
            self.memory.free(allocator),
            self.instances.free(allocator),
            self.motion_transforms.free(allocator),
        ];
        results.into_iter().collect::<strata_gpu::Result<()>>()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use strata_core::{DeviceAddress, SlotTable};
    use strata_gpu::{
        AabbInput, ActiveDevice, BuildFlags, BuildOperation, ContextToken, GeometryInput,
        GpuError, HostAccelerator, HostDeviceConfig, RayTracingCapabilities, TraversableType,
    };

    /// A host device whose driver refuses to free build temp memory.
    struct StickyTempDevice {
        host: HostAccelerator,
        temp: Mutex<Option<DeviceAddress>>,
    }

    impl DeviceAllocator for StickyTempDevice {
        fn allocate(&self, size: u64, name: &str) -> strata_gpu::Result<DeviceAddress> {
            let address = self.host.allocate(size, name)?;
            if name == "accel temp" {
                *self.temp.lock() = Some(address);
            }
            Ok(address)
        }

        fn write(&self, address: DeviceAddress, bytes: &[u8]) -> strata_gpu::Result<()> {
            self.host.write(address, bytes)
        }

        fn release(&self, address: DeviceAddress) -> strata_gpu::Result<()> {
            if *self.temp.lock() == Some(address) {
                return Err(GpuError::InvalidState("driver refused free".to_string()));
            }
            self.host.release(address)
        }
    }

    impl Accelerator for StickyTempDevice {
        fn device_id(&self) -> DeviceId {
            self.host.device_id()
        }

        fn capabilities(&self) -> &RayTracingCapabilities {
            self.host.capabilities()
        }

        fn compute_memory_usage(
            &self,
            options: &AccelBuildOptions,
            input: &BuildInput,
        ) -> strata_gpu::Result<AccelBufferSizes> {
            self.host.compute_memory_usage(options, input)
        }

        fn build(
            &self,
            options: &AccelBuildOptions,
            input: &BuildInput,
            temp: &DeviceMemory,
            output: &DeviceMemory,
        ) -> strata_gpu::Result<TraversableHandle> {
            self.host.build(options, input, temp, output)
        }

        fn convert_pointer_to_handle(
            &self,
            address: DeviceAddress,
            ty: TraversableType,
        ) -> strata_gpu::Result<TraversableHandle> {
            self.host.convert_pointer_to_handle(address, ty)
        }

        fn synchronize(&self) -> strata_gpu::Result<()> {
            self.host.synchronize()
        }

        fn push_active(&self) -> strata_gpu::Result<ContextToken> {
            self.host.push_active()
        }

        fn pop_active(&self, previous: ContextToken) {
            self.host.pop_active(previous);
        }
    }

    #[test]
    fn temp_free_failure_keeps_built_structure() {
        let dev = StickyTempDevice {
            host: HostAccelerator::new(DeviceId(0), HostDeviceConfig::default()),
            temp: Mutex::new(None),
        };
        let _active = ActiveDevice::push(&dev).unwrap();
        let mut aabbs = DeviceMemory::new();
        aabbs.alloc_and_upload(&dev, &[0.0f32, 0.0, 0.0, 1.0, 1.0, 1.0], "aabbs").unwrap();
        let input = BuildInput::Geometries(vec![GeometryInput::CustomPrimitives(AabbInput {
            aabbs: aabbs.address(),
            primitive_count: 1,
            stride: 24,
        })]);
        let options = AccelBuildOptions::new(BuildFlags::ALLOW_UPDATE, BuildOperation::Build);
        let sizes = dev.compute_memory_usage(&options, &input).unwrap();

        let mut accel = DeviceAccel::default();
        accel.execute(&dev, &options, &input, &sizes, "leaf").unwrap();
        assert!(dev.temp.lock().is_some());
        assert!(accel.is_consistent());
        assert_eq!(accel.state(), BuildState::Built);
        assert!(!accel.memory.is_empty());

        accel.release(&dev).unwrap();
        assert_eq!(accel.state(), BuildState::Empty);
        aabbs.free(&dev).unwrap();
    }

    #[test]
    fn refcount_never_negative() {
        let count = RefCount::default();
        assert!(count.decrement().is_err());
        count.increment();
        count.increment();
        assert_eq!(count.get(), 2);
        count.decrement().unwrap();
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn empty_state_rejects_refit() {
        let accel = DeviceAccel::default();
        let group = GroupId(SlotTable::new().insert(()).unwrap());
        assert_eq!(accel.state(), BuildState::Empty);
        assert!(accel.check_operation(true, group, DeviceId(0)).is_ok());
        assert!(matches!(
            accel.check_operation(false, group, DeviceId(0)),
            Err(AccelError::Precondition(_))
        ));
    }
}
