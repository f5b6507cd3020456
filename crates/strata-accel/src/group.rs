//! Groups: the nodes of the acceleration structure DAG.

use crate::config::AccelConfig;
use crate::error::{AccelError, Result};
use crate::geom::Geom;
use crate::geom_group::GeomGroup;
use crate::instance_group::InstanceGroup;
use crate::state::{BuildState, DeviceAccel, RefCount};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use strata_core::{check_slot, DeviceId, GroupId, TraversableHandle};
use strata_gpu::{Accelerator, BuildOperation};
use tracing::{debug, info};

/// Objects whose parents are counted.
pub(crate) trait Referenced {
    fn ref_count(&self) -> &RefCount;
}

impl Referenced for Group {
    fn ref_count(&self) -> &RefCount {
        &self.ref_count
    }
}

impl Referenced for Geom {
    fn ref_count(&self) -> &RefCount {
        &self.ref_count
    }
}

/// Fixed-size child list.
///
/// Each slot is swapped under its own lock, so distinct slots can be
/// populated concurrently.
pub(crate) struct ChildSlots<T> {
    slots: Box<[Mutex<Option<Arc<T>>>]>,
}

impl<T: Referenced> ChildSlots<T> {
    pub fn new(count: usize) -> Self {
        Self {
            slots: (0..count).map(|_| Mutex::new(None)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn get(&self, slot: usize) -> Result<Option<Arc<T>>> {
        check_slot(slot, self.slots.len())?;
        Ok(self.slots[slot].lock().clone())
    }

    /// Install `child` in `slot`: the new occupant gains a reference and the
    /// old one loses one.
    pub fn set(&self, slot: usize, child: Option<Arc<T>>) -> Result<()> {
        check_slot(slot, self.slots.len())?;
        if let Some(new) = &child {
            new.ref_count().increment();
        }
        let old = std::mem::replace(&mut *self.slots[slot].lock(), child);
        if let Some(old) = old {
            old.ref_count().decrement()?;
        }
        Ok(())
    }

    /// Empty every slot, dropping the references held.
    pub fn clear(&self) -> Result<()> {
        for slot in 0..self.slots.len() {
            self.set(slot, None)?;
        }
        Ok(())
    }

    /// Current occupants in slot order.
    pub fn snapshot(&self) -> Vec<Option<Arc<T>>> {
        self.slots.iter().map(|s| s.lock().clone()).collect()
    }
}

/// The two group variants.
pub enum GroupKind {
    /// Bottom-level structure over geometries.
    Geom(GeomGroup),
    /// Top-level structure over instances of other groups.
    Instance(InstanceGroup),
}

/// A node with one acceleration structure per device.
pub struct Group {
    id: GroupId,
    kind: GroupKind,
    ref_count: RefCount,
    sbt_offset: AtomicU32,
    devices: Box<[Mutex<DeviceAccel>]>,
}

impl Group {
    pub(crate) fn new(id: GroupId, kind: GroupKind, device_count: usize) -> Self {
        Self {
            id,
            kind,
            ref_count: RefCount::default(),
            sbt_offset: AtomicU32::new(0),
            devices: (0..device_count)
                .map(|_| Mutex::new(DeviceAccel::default()))
                .collect(),
        }
    }

    pub const fn id(&self) -> GroupId {
        self.id
    }

    pub const fn kind(&self) -> &GroupKind {
        &self.kind
    }

    pub const fn as_geom_group(&self) -> Option<&GeomGroup> {
        match &self.kind {
            GroupKind::Geom(g) => Some(g),
            GroupKind::Instance(_) => None,
        }
    }

    pub const fn as_instance_group(&self) -> Option<&InstanceGroup> {
        match &self.kind {
            GroupKind::Instance(g) => Some(g),
            GroupKind::Geom(_) => None,
        }
    }

    /// Number of child slots.
    pub fn child_count(&self) -> usize {
        match &self.kind {
            GroupKind::Geom(g) => g.child_count(),
            GroupKind::Instance(g) => g.child_count(),
        }
    }

    /// Number of instance group slots currently holding this group.
    pub fn reference_count(&self) -> u32 {
        self.ref_count.get()
    }

    /// Base offset of this group's records in the shader binding table.
    pub fn sbt_offset(&self) -> u32 {
        self.sbt_offset.load(Ordering::Acquire)
    }

    pub(crate) fn set_sbt_offset(&self, offset: u32) {
        self.sbt_offset.store(offset, Ordering::Release);
    }

    fn device_state(&self, device: DeviceId) -> Result<&Mutex<DeviceAccel>> {
        self.devices.get(device.index()).ok_or_else(|| {
            AccelError::Configuration(format!("{} has no state for {device}", self.id))
        })
    }

    /// Handle of the structure on `device`; null unless built.
    pub fn traversable(&self, device: DeviceId) -> Result<TraversableHandle> {
        Ok(self.device_state(device)?.lock().handle)
    }

    pub fn build_state(&self, device: DeviceId) -> Result<BuildState> {
        Ok(self.device_state(device)?.lock().state())
    }

    /// Bytes held by the structure on `device`; zero unless built.
    pub fn accel_memory_size(&self, device: DeviceId) -> Result<u64> {
        Ok(self.device_state(device)?.lock().memory.size())
    }

    /// Whether handle, memory and state agree on every device.
    pub fn is_consistent(&self) -> bool {
        self.devices.iter().all(|d| d.lock().is_consistent())
    }

    /// Build or refit on the active `device`.
    pub(crate) fn build_on(
        &self,
        device: &dyn Accelerator,
        operation: BuildOperation,
        config: &AccelConfig,
    ) -> Result<()> {
        let device_id = device.device_id();
        let mut accel = self.device_state(device_id)?.lock();
        accel.check_operation(operation.is_full_rebuild(), self.id, device_id)?;

        debug!(device = %device_id, group = %self.id, ?operation, "building acceleration structure");
        match &self.kind {
            GroupKind::Geom(g) => g.build_or_refit(self.id, device, operation, &mut accel)?,
            GroupKind::Instance(g) => {
                g.build_or_refit(self.id, device, operation, &mut accel, config)?;
            }
        }

        info!(
            device = %device_id,
            group = %self.id,
            handle = %accel.handle,
            output_bytes = accel.memory.size(),
            "{}",
            if operation.is_full_rebuild() { "built" } else { "refit" }
        );
        Ok(())
    }

    /// Free the structure on the active `device`. Destroying an empty
    /// structure is a no-op.
    pub(crate) fn destroy_on(&self, device: &dyn Accelerator) -> Result<()> {
        let device_id = device.device_id();
        let mut accel = self.device_state(device_id)?.lock();
        if accel.state() == BuildState::Built {
            debug!(device = %device_id, group = %self.id, "destroying acceleration structure");
        }
        accel.release(device)
    }
}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.kind {
            GroupKind::Geom(g) => format!("{:?} geometry", g.kind()),
            GroupKind::Instance(_) => "instance".to_string(),
        };
        f.debug_struct("Group")
            .field("id", &self.id)
            .field("kind", &kind)
            .field("children", &self.child_count())
            .field("ref_count", &self.ref_count.get())
            .finish_non_exhaustive()
    }
}
