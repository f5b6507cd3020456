//! Top-level groups over instances of other groups.

use crate::config::AccelConfig;
use crate::error::{AccelError, Result};
use crate::group::{ChildSlots, Group};
use crate::motion;
use crate::state::DeviceAccel;
use glam::Affine3A;
use parking_lot::RwLock;
use rayon::prelude::*;
use std::sync::Arc;
use strata_core::{check_slot, DeviceId, GroupId, RowMajor3x4, TraversableHandle};
use strata_gpu::{
    AccelBuildOptions, Accelerator, BuildFlags, BuildInput, BuildOperation, GpuError,
    InstanceDesc, TraversableType,
};
use tracing::debug;

/// Per-slot instance parameters.
struct InstanceParams {
    /// Transforms at time step 0; identity until set.
    transforms: Vec<Affine3A>,
    /// Transforms at time step 1. Present once any slot received one.
    motion_transforms: Option<Vec<Option<Affine3A>>>,
    /// Explicit instance IDs; slot indices otherwise.
    instance_ids: Option<Vec<u32>>,
    /// Explicit visibility masks; the configured default otherwise.
    visibility_masks: Option<Vec<u8>>,
}

/// A fixed-size list of child groups, each instanced with its own transform.
pub struct InstanceGroup {
    children: ChildSlots<Group>,
    params: RwLock<InstanceParams>,
}

impl InstanceGroup {
    pub(crate) fn new(count: usize) -> Self {
        Self {
            children: ChildSlots::new(count),
            params: RwLock::new(InstanceParams {
                transforms: vec![Affine3A::IDENTITY; count],
                motion_transforms: None,
                instance_ids: None,
                visibility_masks: None,
            }),
        }
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    /// Group in `slot`, if set.
    pub fn child(&self, slot: usize) -> Result<Option<Arc<Group>>> {
        self.children.get(slot)
    }

    pub(crate) fn set_child(&self, slot: usize, child: Option<Arc<Group>>) -> Result<()> {
        self.children.set(slot, child)
    }

    pub(crate) fn children(&self) -> Vec<Option<Arc<Group>>> {
        self.children.snapshot()
    }

    pub(crate) fn clear(&self) -> Result<()> {
        self.children.clear()
    }

    /// Whether any slot carries a time step 1 transform.
    pub fn motion_blur_enabled(&self) -> bool {
        self.params.read().motion_transforms.is_some()
    }

    /// Set the transform of `slot` at time step 0 or 1.
    ///
    /// A step 1 transform on any slot turns on motion blur for the whole
    /// group; every slot then needs one before the group can be built.
    pub fn set_transform(&self, step: usize, slot: usize, transform: Affine3A) -> Result<()> {
        let count = self.child_count();
        check_slot(slot, count)?;
        let mut params = self.params.write();
        match step {
            0 => params.transforms[slot] = transform,
            1 => {
                params
                    .motion_transforms
                    .get_or_insert_with(|| vec![None; count])[slot] = Some(transform);
            }
            _ => return Err(invalid_step(step)),
        }
        Ok(())
    }

    /// Replace the default slot-index instance IDs.
    pub fn set_instance_ids(&self, ids: &[u32]) -> Result<()> {
        self.check_len("instance IDs", ids.len())?;
        self.params.write().instance_ids = Some(ids.to_vec());
        Ok(())
    }

    /// Replace the default visibility masks.
    pub fn set_visibility_masks(&self, masks: &[u8]) -> Result<()> {
        self.check_len("visibility masks", masks.len())?;
        self.params.write().visibility_masks = Some(masks.to_vec());
        Ok(())
    }

    fn check_len(&self, what: &str, len: usize) -> Result<()> {
        if len == self.child_count() {
            Ok(())
        } else {
            Err(AccelError::Configuration(format!(
                "{len} {what} given for {} instances",
                self.child_count()
            )))
        }
    }

    /// Build or refit the top-level structure on `device`.
    pub(crate) fn build_or_refit(
        &self,
        id: GroupId,
        device: &dyn Accelerator,
        operation: BuildOperation,
        accel: &mut DeviceAccel,
        config: &AccelConfig,
    ) -> Result<()> {
        let device_id = device.device_id();
        let count = self.child_count();
        let max = device.capabilities().max_instances_per_ias;
        if !device.capabilities().fits_instances(count) {
            return Err(AccelError::Capacity { count, max });
        }

        let params = self.params.read();
        let motion_blur = params.motion_transforms.is_some();
        if !operation.is_full_rebuild() && motion_blur != accel.motion_blur {
            return Err(AccelError::Precondition(format!(
                "{id} changed motion blur since its last full build on {device_id}; rebuild it"
            )));
        }
        let end_transforms = match &params.motion_transforms {
            Some(steps) => Some(
                steps
                    .iter()
                    .enumerate()
                    .map(|(slot, t)| {
                        t.ok_or_else(|| {
                            AccelError::Configuration(format!(
                                "{id} uses motion blur but slot {slot} has no time step 1 transform"
                            ))
                        })
                    })
                    .collect::<Result<Vec<_>>>()?,
            ),
            None => None,
        };
        if motion_blur && !device.capabilities().supports_motion_blur {
            return Err(GpuError::Unsupported(format!(
                "motion blur on {}",
                device.capabilities().device_name
            ))
            .into());
        }

        let children = self.children.snapshot();
        let handles = child_handles(id, device_id, &children)?;

        let traversables = match &end_transforms {
            Some(end) => {
                let records: Vec<_> = handles
                    .iter()
                    .zip(params.transforms.iter().zip(end))
                    .map(|(child, (begin, end))| {
                        motion::motion_transform(*child, begin, end, config)
                    })
                    .collect();
                accel
                    .motion_transforms
                    .alloc_and_upload(device, &records, "motion transforms")?;
                let base = accel.motion_transforms.address();
                (0..count)
                    .map(|i| {
                        device.convert_pointer_to_handle(
                            motion::record_address(base, i),
                            TraversableType::MatrixMotionTransform,
                        )
                    })
                    .collect::<strata_gpu::Result<Vec<_>>>()?
            }
            None => handles,
        };

        let caps = device.capabilities();
        let encode = |slot: usize| -> Result<InstanceDesc> {
            let transform = if motion_blur {
                RowMajor3x4::IDENTITY
            } else {
                RowMajor3x4::from_affine(&params.transforms[slot])
            };
            let child_offset = children[slot].as_ref().map_or(0, |c| c.sbt_offset());
            let sbt_offset = config.ray_type_count.checked_mul(child_offset).ok_or_else(|| {
                AccelError::Configuration(format!(
                    "{id} slot {slot}: SBT offset {child_offset} overflows with {} ray types",
                    config.ray_type_count
                ))
            })?;
            let instance_id = params
                .instance_ids
                .as_ref()
                .map_or(slot as u32, |ids| ids[slot]);
            if instance_id > caps.max_instance_id || sbt_offset > caps.max_sbt_offset {
                return Err(AccelError::Configuration(format!(
                    "{id} slot {slot}: instance ID {instance_id} or SBT offset {sbt_offset} \
                     exceeds the limits of {} ({}, {})",
                    caps.device_name, caps.max_instance_id, caps.max_sbt_offset
                )));
            }
            let mask = params
                .visibility_masks
                .as_ref()
                .map_or(config.default_visibility_mask, |m| m[slot]);
            Ok(InstanceDesc::new(
                transform,
                instance_id,
                sbt_offset,
                mask,
                traversables[slot],
            ))
        };
        let instances: Vec<InstanceDesc> = if count >= config.parallel_threshold {
            (0..count).into_par_iter().map(encode).collect::<Result<_>>()?
        } else {
            (0..count).map(encode).collect::<Result<_>>()?
        };
        drop(params);

        let encoded = device.encode_instances(&instances);
        accel
            .instances
            .alloc_and_upload(device, &encoded, "instance array")?;

        let input = BuildInput::Instances {
            instances: accel.instances.address(),
            count: count as u32,
        };
        let mut options = AccelBuildOptions::new(
            BuildFlags::PREFER_FAST_TRACE | BuildFlags::ALLOW_UPDATE,
            operation,
        );
        if motion_blur {
            options = options
                .num_keys(strata_core::constants::MOTION_KEY_COUNT)
                .time_interval(config.motion_time_begin, config.motion_time_end);
        }
        let sizes = device.compute_memory_usage(&options, &input)?;
        debug!(
            device = %device_id,
            group = %id,
            instances = count,
            motion_blur,
            output_bytes = sizes.output_size_in_bytes,
            temp_bytes = sizes.temp_size_for(operation),
            "instance array uploaded"
        );

        accel.execute(device, &options, &input, &sizes, "instance group accel")?;
        accel.motion_blur = motion_blur;
        if !motion_blur {
            accel.motion_transforms.free(device)?;
        }
        Ok(())
    }
}

fn invalid_step(step: usize) -> AccelError {
    AccelError::Configuration(format!(
        "time step {step} is out of range, instance groups carry {} steps",
        strata_core::constants::MAX_TIME_STEPS
    ))
}

/// Handles of every child on `device`; each must be set and built.
fn child_handles(
    id: GroupId,
    device: DeviceId,
    children: &[Option<Arc<Group>>],
) -> Result<Vec<TraversableHandle>> {
    children
        .iter()
        .enumerate()
        .map(|(slot, child)| {
            let child = child.as_ref().ok_or_else(|| {
                AccelError::Configuration(format!("{id} slot {slot} has no child"))
            })?;
            let handle = child.traversable(device)?;
            if handle.is_null() {
                return Err(AccelError::Precondition(format!(
                    "{id} slot {slot}: child {} is not built on {device}",
                    child.id()
                )));
            }
            Ok(handle)
        })
        .collect()
}
