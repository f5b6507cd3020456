//! The ray tracing backend interface and scoped device activation.

use crate::build::{
    AccelBufferSizes, AccelBuildOptions, BuildInput, InstanceDesc, TraversableType,
};
use crate::capabilities::RayTracingCapabilities;
use crate::error::Result;
use crate::memory::{DeviceAllocator, DeviceMemory};
use std::ops::Deref;
use strata_core::{DeviceAddress, DeviceId, TraversableHandle};

/// Opaque record of the context that was active before a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextToken(pub u64);

/// Backend entry points for one physical device.
///
/// Every call except [`Accelerator::push_active`] / [`Accelerator::pop_active`]
/// expects the device to be the active context; use [`ActiveDevice`] to
/// bracket work.
pub trait Accelerator: DeviceAllocator {
    /// Index of this device within its device set.
    fn device_id(&self) -> DeviceId;

    /// Device limits.
    fn capabilities(&self) -> &RayTracingCapabilities;

    /// Output and temp memory needed to run `options` over `input`.
    fn compute_memory_usage(
        &self,
        options: &AccelBuildOptions,
        input: &BuildInput,
    ) -> Result<AccelBufferSizes>;

    /// Build or update the structure stored in `output`.
    fn build(
        &self,
        options: &AccelBuildOptions,
        input: &BuildInput,
        temp: &DeviceMemory,
        output: &DeviceMemory,
    ) -> Result<TraversableHandle>;

    /// Turn a device pointer to a transform record into a traversable handle.
    fn convert_pointer_to_handle(
        &self,
        address: DeviceAddress,
        ty: TraversableType,
    ) -> Result<TraversableHandle>;

    /// Block until all work issued to the device has completed.
    fn synchronize(&self) -> Result<()>;

    /// Make this device the active context, returning the previous one.
    fn push_active(&self) -> Result<ContextToken>;

    /// Restore the context captured by [`Accelerator::push_active`].
    fn pop_active(&self, previous: ContextToken);

    /// Encode instances in the layout this backend reads.
    fn encode_instances(&self, instances: &[InstanceDesc]) -> Vec<u8> {
        bytemuck::cast_slice(instances).to_vec()
    }
}

/// A device made active for the lifetime of the guard.
///
/// The previous context is restored on drop, including on early returns and
/// unwinding.
pub struct ActiveDevice<'a> {
    device: &'a dyn Accelerator,
    previous: ContextToken,
}

impl<'a> ActiveDevice<'a> {
    /// Activate `device`.
    pub fn push(device: &'a dyn Accelerator) -> Result<Self> {
        let previous = device.push_active()?;
        Ok(Self { device, previous })
    }

    /// The active device.
    pub fn device(&self) -> &'a dyn Accelerator {
        self.device
    }
}

impl<'a> Deref for ActiveDevice<'a> {
    type Target = dyn Accelerator + 'a;

    fn deref(&self) -> &Self::Target {
        self.device
    }
}

impl Drop for ActiveDevice<'_> {
    fn drop(&mut self) {
        self.device.pop_active(self.previous);
    }
}
