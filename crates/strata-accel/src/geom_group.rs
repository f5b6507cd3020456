//! Bottom-level groups over geometries.

use crate::error::{AccelError, Result};
use crate::geom::{Geom, GeomKind};
use crate::group::ChildSlots;
use crate::state::DeviceAccel;
use std::sync::Arc;
use strata_core::GroupId;
use strata_gpu::{
    AccelBuildOptions, Accelerator, BuildFlags, BuildInput, BuildOperation, GeometryInput,
};
use tracing::debug;

/// A fixed-size list of geometries of one kind.
pub struct GeomGroup {
    kind: GeomKind,
    geometries: ChildSlots<Geom>,
}

impl GeomGroup {
    pub(crate) fn new(kind: GeomKind, count: usize) -> Self {
        Self {
            kind,
            geometries: ChildSlots::new(count),
        }
    }

    pub const fn kind(&self) -> GeomKind {
        self.kind
    }

    pub fn child_count(&self) -> usize {
        self.geometries.len()
    }

    /// Geometry in `slot`, if set.
    pub fn child(&self, slot: usize) -> Result<Option<Arc<Geom>>> {
        self.geometries.get(slot)
    }

    pub(crate) fn set_child(&self, slot: usize, geom: Option<Arc<Geom>>) -> Result<()> {
        if let Some(g) = &geom {
            if g.kind() != self.kind {
                return Err(AccelError::Configuration(format!(
                    "{} is a {:?} geometry, the group holds {:?} geometries",
                    g.id(),
                    g.kind(),
                    self.kind
                )));
            }
        }
        self.geometries.set(slot, geom)
    }

    pub(crate) fn clear(&self) -> Result<()> {
        self.geometries.clear()
    }

    fn gather_inputs(&self, id: GroupId, device: &dyn Accelerator) -> Result<Vec<GeometryInput>> {
        self.geometries
            .snapshot()
            .into_iter()
            .enumerate()
            .map(|(slot, geom)| {
                geom.ok_or_else(|| {
                    AccelError::Configuration(format!("{id} slot {slot} has no geometry"))
                })?
                .build_input(device.device_id())
            })
            .collect()
    }

    /// Build or refit the bottom-level structure on `device`.
    pub(crate) fn build_or_refit(
        &self,
        id: GroupId,
        device: &dyn Accelerator,
        operation: BuildOperation,
        accel: &mut DeviceAccel,
    ) -> Result<()> {
        let input = BuildInput::Geometries(self.gather_inputs(id, device)?);
        let options = AccelBuildOptions::new(
            BuildFlags::PREFER_FAST_TRACE | BuildFlags::ALLOW_UPDATE,
            operation,
        );
        let sizes = device.compute_memory_usage(&options, &input)?;
        debug!(
            device = %device.device_id(),
            group = %id,
            primitives = input.primitive_count(),
            output_bytes = sizes.output_size_in_bytes,
            temp_bytes = sizes.temp_size_for(operation),
            "bottom-level build input ready"
        );

        accel.execute(device, &options, &input, &sizes, "geom group accel")
    }
}
