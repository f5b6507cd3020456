//! Multi-device replication.

use crate::accelerator::{Accelerator, ActiveDevice};
use crate::error::{GpuError, Result};
use rayon::prelude::*;
use std::sync::Arc;
use strata_core::DeviceId;

/// The set of physical devices every structure is replicated on.
///
/// Device `i` in the set must report `DeviceId(i)`, so per-device state can
/// live in plain arrays indexed by device ID.
#[derive(Clone)]
pub struct DeviceSet {
    devices: Vec<Arc<dyn Accelerator>>,
}

impl DeviceSet {
    /// Number of devices.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether the set holds no devices.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Run `f` once per device with that device active.
    ///
    /// Devices run concurrently on the rayon pool. Every device runs to
    /// completion even when another fails; the error of the lowest failing
    /// device ID is returned.
    pub fn for_each<E, F>(&self, f: F) -> std::result::Result<(), E>
    where
        F: Fn(&dyn Accelerator) -> std::result::Result<(), E> + Sync,
        E: From<GpuError> + Send,
    {
        let run = |device: &Arc<dyn Accelerator>| -> std::result::Result<(), E> {
            let active = ActiveDevice::push(device.as_ref())?;
            f(&*active)
        };

        if self.devices.len() == 1 {
            return run(&self.devices[0]);
        }

        let results: Vec<std::result::Result<(), E>> = self.devices.par_iter().map(run).collect();
        results.into_iter().collect()
    }
}

/// Builder for creating a device set.
#[derive(Default)]
pub struct DeviceSetBuilder {
    devices: Vec<Arc<dyn Accelerator>>,
}

impl DeviceSetBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a device; it must report the next device ID.
    pub fn device(mut self, device: Arc<dyn Accelerator>) -> Self {
        self.devices.push(device);
        self
    }

    /// Build the device set.
    pub fn build(self) -> Result<DeviceSet> {
        if self.devices.is_empty() {
            return Err(GpuError::InvalidState(
                "a device set needs at least one device".to_string(),
            ));
        }

        for (index, device) in self.devices.iter().enumerate() {
            let expected = DeviceId(index as u32);
            if device.device_id() != expected {
                return Err(GpuError::InvalidState(format!(
                    "device at position {index} reports {} instead of {expected}",
                    device.device_id()
                )));
            }
            tracing::info!("Registered {expected}: {}", device.capabilities().summary());
        }

        Ok(DeviceSet {
            devices: self.devices,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{HostAccelerator, HostDeviceConfig};

    fn host(id: u32) -> Arc<dyn Accelerator> {
        Arc::new(HostAccelerator::new(DeviceId(id), HostDeviceConfig::default()))
    }

    #[test]
    fn rejects_out_of_order_ids() {
        assert!(DeviceSetBuilder::new().device(host(1)).build().is_err());
        assert!(DeviceSetBuilder::new().build().is_err());
    }

    #[test]
    fn for_each_activates_every_device() {
        let devices: Vec<Arc<HostAccelerator>> = (0..3)
            .map(|i| Arc::new(HostAccelerator::new(DeviceId(i), HostDeviceConfig::default())))
            .collect();
        let mut builder = DeviceSetBuilder::new();
        for d in &devices {
            builder = builder.device(d.clone());
        }
        let set = builder.build().unwrap();

        set.for_each(|device| -> Result<()> {
            device.synchronize()?;
            Ok(())
        })
        .unwrap();

        for d in &devices {
            let stats = d.stats();
            assert_eq!(stats.pushes, 1);
            assert_eq!(stats.pops, 1);
            assert_eq!(stats.synchronizations, 1);
            assert!(!d.is_active());
        }
    }

    #[test]
    fn context_restored_after_failure() {
        let device = Arc::new(HostAccelerator::new(DeviceId(0), HostDeviceConfig::default()));
        let set = DeviceSetBuilder::new().device(device.clone()).build().unwrap();

        let result = set.for_each(|_| -> Result<()> {
            Err(GpuError::InvalidState("boom".to_string()))
        });
        assert!(result.is_err());
        assert!(!device.is_active());
        assert_eq!(device.stats().pops, 1);
    }
}
