//! The registry owning groups and geometries by handle.

use crate::config::AccelConfig;
use crate::error::{AccelError, Result};
use crate::geom::{Geom, GeomKind, GeometrySource};
use crate::geom_group::GeomGroup;
use crate::group::{Group, GroupKind};
use crate::instance_group::InstanceGroup;
use crate::state::BuildState;
use glam::Affine3A;
use hashbrown::HashSet;
use parking_lot::RwLock;
use rayon::prelude::*;
use std::sync::Arc;
use strata_core::{DeviceId, GeomId, GroupId, SlotTable, TraversableHandle};
use strata_gpu::{BuildOperation, DeviceSet};
use tracing::{debug, info, warn};

/// Groups and geometries replicated across a device set.
///
/// Objects are addressed by generational handles: a handle stops resolving
/// once its object is released, even if the slot is reused. Handles are only
/// meaningful to the scene that issued them.
///
/// Lock order is groups before geometries.
pub struct Scene {
    devices: DeviceSet,
    config: AccelConfig,
    groups: RwLock<SlotTable<Arc<Group>>>,
    geoms: RwLock<SlotTable<Arc<Geom>>>,
}

impl Scene {
    /// Create an empty scene on `devices`.
    pub fn new(devices: DeviceSet, config: AccelConfig) -> Result<Self> {
        config.validate()?;
        info!(
            devices = devices.len(),
            ray_types = config.ray_type_count,
            "Created acceleration structure scene"
        );
        Ok(Self {
            devices,
            config,
            groups: RwLock::new(SlotTable::new()),
            geoms: RwLock::new(SlotTable::new()),
        })
    }

    pub const fn devices(&self) -> &DeviceSet {
        &self.devices
    }

    pub const fn config(&self) -> &AccelConfig {
        &self.config
    }

    /// Number of live groups.
    pub fn group_count(&self) -> usize {
        self.groups.read().len()
    }

    /// Number of live geometries.
    pub fn geom_count(&self) -> usize {
        self.geoms.read().len()
    }

    /// Handles of every live group.
    pub fn group_ids(&self) -> Vec<GroupId> {
        self.groups.read().iter().map(|(_, g)| g.id()).collect()
    }

    /// Resolve a group handle.
    pub fn group(&self, id: GroupId) -> Result<Arc<Group>> {
        self.groups
            .read()
            .get(id.0)
            .cloned()
            .ok_or_else(|| AccelError::Configuration(format!("{id} does not exist")))
    }

    /// Resolve a geometry handle.
    pub fn geom(&self, id: GeomId) -> Result<Arc<Geom>> {
        self.geoms
            .read()
            .get(id.0)
            .cloned()
            .ok_or_else(|| AccelError::Configuration(format!("{id} does not exist")))
    }

    fn geom_group(&self, id: GroupId) -> Result<Arc<Group>> {
        let group = self.group(id)?;
        if group.as_geom_group().is_none() {
            return Err(AccelError::Configuration(format!(
                "{id} is not a geometry group"
            )));
        }
        Ok(group)
    }

    fn instance_group(&self, id: GroupId) -> Result<Arc<Group>> {
        let group = self.group(id)?;
        if group.as_instance_group().is_none() {
            return Err(AccelError::Configuration(format!(
                "{id} is not an instance group"
            )));
        }
        Ok(group)
    }

    // ------------------------------------------------------------------
    // Geometries
    // ------------------------------------------------------------------

    /// Register a geometry.
    pub fn create_geom<S: GeometrySource + 'static>(
        &self,
        kind: GeomKind,
        source: S,
    ) -> Result<GeomId> {
        let key = self
            .geoms
            .write()
            .insert_with(|key| Arc::new(Geom::new(GeomId(key), kind, Box::new(source))))?;
        Ok(GeomId(key))
    }

    /// Unregister a geometry no group slot refers to.
    pub fn release_geom(&self, id: GeomId) -> Result<()> {
        let mut geoms = self.geoms.write();
        let geom = geoms
            .get(id.0)
            .ok_or_else(|| AccelError::Configuration(format!("{id} does not exist")))?;
        let refs = geom.reference_count();
        if refs != 0 {
            return Err(AccelError::Precondition(format!(
                "{id} is still referenced by {refs} group slots"
            )));
        }
        geoms.remove(id.0);
        debug!(geom = %id, "released geometry");
        Ok(())
    }

    pub fn geom_reference_count(&self, id: GeomId) -> Result<u32> {
        Ok(self.geom(id)?.reference_count())
    }

    // ------------------------------------------------------------------
    // Group creation and release
    // ------------------------------------------------------------------

    fn insert_group(&self, kind: GroupKind) -> Result<GroupId> {
        let device_count = self.devices.len();
        let key = self
            .groups
            .write()
            .insert_with(|key| Arc::new(Group::new(GroupId(key), kind, device_count)))?;
        Ok(GroupId(key))
    }

    /// Create a bottom-level group with `count` empty triangle slots.
    pub fn create_triangles_geom_group(&self, count: usize) -> Result<GroupId> {
        self.insert_group(GroupKind::Geom(GeomGroup::new(GeomKind::Triangles, count)))
    }

    /// Create a bottom-level group with `count` empty user geometry slots.
    pub fn create_user_geom_group(&self, count: usize) -> Result<GroupId> {
        self.insert_group(GroupKind::Geom(GeomGroup::new(GeomKind::User, count)))
    }

    /// Create a top-level group with `count` empty child slots.
    pub fn create_instance_group(&self, count: usize) -> Result<GroupId> {
        self.insert_group(GroupKind::Instance(InstanceGroup::new(count)))
    }

    /// Create a top-level group with one slot per entry of `children`.
    ///
    /// Large child lists are installed in parallel.
    pub fn create_instance_group_with_children(&self, children: &[GroupId]) -> Result<GroupId> {
        let resolved = children
            .iter()
            .map(|id| self.group(*id))
            .collect::<Result<Vec<_>>>()?;

        let id = self.create_instance_group(children.len())?;
        let group = self.group(id)?;
        let Some(instances) = group.as_instance_group() else {
            return Err(AccelError::Configuration(format!(
                "{id} is not an instance group"
            )));
        };
        let install = |(slot, child): (usize, &Arc<Group>)| {
            instances.set_child(slot, Some(Arc::clone(child)))
        };
        if resolved.len() >= self.config.parallel_threshold {
            resolved.par_iter().enumerate().try_for_each(install)?;
        } else {
            resolved.iter().enumerate().try_for_each(install)?;
        }
        Ok(id)
    }

    /// Unregister a group no instance group slot refers to.
    ///
    /// Its structures are destroyed on every device and the references it
    /// holds to its own children are dropped.
    pub fn release_group(&self, id: GroupId) -> Result<()> {
        let mut groups = self.groups.write();
        let group = groups
            .get(id.0)
            .cloned()
            .ok_or_else(|| AccelError::Configuration(format!("{id} does not exist")))?;
        let refs = group.reference_count();
        if refs != 0 {
            return Err(AccelError::Precondition(format!(
                "{id} is still referenced by {refs} instance group slots"
            )));
        }

        self.devices
            .for_each(|device| group.destroy_on(device))?;
        groups.remove(id.0);
        drop(groups);

        match group.kind() {
            GroupKind::Geom(g) => g.clear()?,
            GroupKind::Instance(g) => g.clear()?,
        }
        debug!(group = %id, "released group");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Population
    // ------------------------------------------------------------------

    /// Put a geometry into `slot` of a geometry group, or clear the slot.
    pub fn geom_group_set_child(
        &self,
        group: GroupId,
        slot: usize,
        geom: Option<GeomId>,
    ) -> Result<()> {
        let target = self.geom_group(group)?;
        let geom = geom.map(|id| self.geom(id)).transpose()?;
        target
            .as_geom_group()
            .map_or(Ok(()), |g| g.set_child(slot, geom))
    }

    /// Geometry in `slot` of a geometry group.
    pub fn geom_group_child(&self, group: GroupId, slot: usize) -> Result<Option<GeomId>> {
        let target = self.geom_group(group)?;
        let child = target
            .as_geom_group()
            .map(|g| g.child(slot))
            .transpose()?
            .flatten();
        Ok(child.map(|g| g.id()))
    }

    /// Put a child group into `slot` of an instance group, or clear the slot.
    ///
    /// Installing a group that already (transitively) contains `group` is
    /// rejected.
    pub fn instance_group_set_child(
        &self,
        group: GroupId,
        slot: usize,
        child: Option<GroupId>,
    ) -> Result<()> {
        let target = self.instance_group(group)?;
        let child = child.map(|id| self.group(id)).transpose()?;
        if let Some(child) = &child {
            if reaches(child, group) {
                return Err(AccelError::Configuration(format!(
                    "putting {} into {group} would create a cycle",
                    child.id()
                )));
            }
        }
        target
            .as_instance_group()
            .map_or(Ok(()), |g| g.set_child(slot, child))
    }

    /// Child group in `slot` of an instance group.
    pub fn instance_group_child(&self, group: GroupId, slot: usize) -> Result<Option<GroupId>> {
        let target = self.instance_group(group)?;
        let child = target
            .as_instance_group()
            .map(|g| g.child(slot))
            .transpose()?
            .flatten();
        Ok(child.map(|g| g.id()))
    }

    /// Set the transform of an instance at time step 0 or 1.
    pub fn instance_group_set_transform(
        &self,
        group: GroupId,
        step: usize,
        slot: usize,
        transform: Affine3A,
    ) -> Result<()> {
        self.with_instances(group, |g| g.set_transform(step, slot, transform))
    }

    /// Override the default slot-index instance IDs.
    pub fn instance_group_set_instance_ids(&self, group: GroupId, ids: &[u32]) -> Result<()> {
        self.with_instances(group, |g| g.set_instance_ids(ids))
    }

    /// Override the default visibility masks.
    pub fn instance_group_set_visibility_masks(&self, group: GroupId, masks: &[u8]) -> Result<()> {
        self.with_instances(group, |g| g.set_visibility_masks(masks))
    }

    /// Whether an instance group is motion blurred.
    pub fn motion_blur_enabled(&self, group: GroupId) -> Result<bool> {
        self.with_instances(group, |g| Ok(g.motion_blur_enabled()))
    }

    fn with_instances<T>(
        &self,
        group: GroupId,
        f: impl FnOnce(&InstanceGroup) -> Result<T>,
    ) -> Result<T> {
        let target = self.instance_group(group)?;
        let instances = target.as_instance_group().ok_or_else(|| {
            AccelError::Configuration(format!("{group} is not an instance group"))
        })?;
        f(instances)
    }

    /// Set the shader binding table base offset of a group.
    ///
    /// Instances of the group get `ray_type_count * offset` at their parent's
    /// next build or refit.
    pub fn set_sbt_offset(&self, group: GroupId, offset: u32) -> Result<()> {
        self.group(group)?.set_sbt_offset(offset);
        Ok(())
    }

    pub fn child_count(&self, group: GroupId) -> Result<usize> {
        Ok(self.group(group)?.child_count())
    }

    pub fn group_reference_count(&self, group: GroupId) -> Result<u32> {
        Ok(self.group(group)?.reference_count())
    }

    // ------------------------------------------------------------------
    // Build lifecycle
    // ------------------------------------------------------------------

    fn run(&self, id: GroupId, operation: BuildOperation) -> Result<()> {
        let group = self.group(id)?;
        self.devices
            .for_each(|device| group.build_on(device, operation, &self.config))
    }

    /// Build a group's structure on every device.
    ///
    /// Every child must already be built on every device.
    pub fn build_accel(&self, group: GroupId) -> Result<()> {
        self.run(group, BuildOperation::Build)
    }

    /// Refit a built structure in place on every device.
    pub fn refit_accel(&self, group: GroupId) -> Result<()> {
        self.run(group, BuildOperation::Update)
    }

    /// Free a group's structure on every device.
    pub fn destroy_accel(&self, group: GroupId) -> Result<()> {
        let group = self.group(group)?;
        self.devices.for_each(|device| group.destroy_on(device))
    }

    /// Handle of a built structure on `device`.
    pub fn traversable(&self, group: GroupId, device: DeviceId) -> Result<TraversableHandle> {
        let handle = self.group(group)?.traversable(device)?;
        if handle.is_null() {
            return Err(AccelError::Precondition(format!(
                "{group} is not built on {device}"
            )));
        }
        Ok(handle)
    }

    pub fn build_state(&self, group: GroupId, device: DeviceId) -> Result<BuildState> {
        self.group(group)?.build_state(device)
    }

    /// Bytes held by a group's structure on `device`.
    pub fn accel_memory_size(&self, group: GroupId, device: DeviceId) -> Result<u64> {
        self.group(group)?.accel_memory_size(device)
    }
}

/// Whether `target` is `from` or one of its descendants.
fn reaches(from: &Arc<Group>, target: GroupId) -> bool {
    let mut visited = HashSet::new();
    let mut stack = vec![Arc::clone(from)];
    while let Some(group) = stack.pop() {
        if group.id() == target {
            return true;
        }
        if !visited.insert(group.id()) {
            continue;
        }
        if let Some(instances) = group.as_instance_group() {
            stack.extend(instances.children().into_iter().flatten());
        }
    }
    false
}

impl Drop for Scene {
    fn drop(&mut self) {
        let groups = self.groups.get_mut().drain();
        for group in &groups {
            if let Err(e) = self.devices.for_each(|device| group.destroy_on(device)) {
                warn!(group = %group.id(), "failed to destroy acceleration structure: {e}");
            }
        }
        // Children are held by their parents' slots; break the links so every
        // group is dropped with the scene.
        for group in &groups {
            let cleared = match group.kind() {
                GroupKind::Geom(g) => g.clear(),
                GroupKind::Instance(g) => g.clear(),
            };
            if let Err(e) = cleared {
                warn!(group = %group.id(), "failed to clear child slots: {e}");
            }
        }
        self.geoms.get_mut().drain();
    }
}
