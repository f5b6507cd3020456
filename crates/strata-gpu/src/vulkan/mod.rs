//! Vulkan backend on `VK_KHR_acceleration_structure`.
//!
//! Device memory is host-visible buffers addressed by their buffer device
//! address. A built structure lives in the output block it was built into and
//! its traversable handle is the structure's device address. Builds are
//! recorded into a one-shot command buffer and waited on with a fence.
//!
//! The KHR extension has no matrix motion transforms, so motion blur is
//! reported as unsupported.

mod memory;

use crate::accelerator::{Accelerator, ContextToken};
use crate::build::{
    AccelBufferSizes, AccelBuildOptions, BuildFlags, BuildInput, BuildOperation, GeometryInput,
    InstanceDesc, TraversableType,
};
use crate::capabilities::RayTracingCapabilities;
use crate::error::{GpuError, Result};
use crate::memory::{DeviceAllocator, DeviceMemory};
use ash::vk;
use hashbrown::HashMap;
use memory::BufferAllocator;
use parking_lot::Mutex;
use std::sync::Arc;
use strata_core::{DeviceAddress, DeviceId, TraversableHandle};
use tracing::{debug, info};

/// Custom index and SBT offset share their word with 8 bits of mask or flags.
const PACKED_24_MAX: u32 = 0x00FF_FFFF;

struct Commands {
    pool: vk::CommandPool,
    fence: vk::Fence,
}

/// One Vulkan device able to build acceleration structures.
pub struct VulkanAccelerator {
    id: DeviceId,
    capabilities: RayTracingCapabilities,
    device: Arc<ash::Device>,
    as_loader: ash::khr::acceleration_structure::Device,
    queue: vk::Queue,
    scratch_alignment: u64,
    buffers: Mutex<BufferAllocator>,
    commands: Mutex<Commands>,
    /// Structures keyed by the address of the block they were built into.
    structures: Mutex<HashMap<u64, vk::AccelerationStructureKHR>>,
}

impl VulkanAccelerator {
    /// Wrap a logical device created with `VK_KHR_acceleration_structure`
    /// and the `bufferDeviceAddress` feature enabled.
    ///
    /// # Safety
    /// The instance, device, physical device and queue must be valid and
    /// outlive the accelerator; `queue` must belong to `queue_family`.
    pub unsafe fn new(
        id: DeviceId,
        instance: &ash::Instance,
        device: Arc<ash::Device>,
        physical_device: vk::PhysicalDevice,
        queue: vk::Queue,
        queue_family: u32,
    ) -> Result<Self> {
        let mut as_properties = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
        let mut properties2 =
            vk::PhysicalDeviceProperties2::default().push_next(&mut as_properties);
        instance.get_physical_device_properties2(physical_device, &mut properties2);
        let device_name = properties2
            .properties
            .device_name_as_c_str()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());

        let capabilities = RayTracingCapabilities {
            device_name,
            max_instances_per_ias: u32::try_from(as_properties.max_instance_count)
                .unwrap_or(u32::MAX),
            max_instance_id: PACKED_24_MAX,
            max_sbt_offset: PACKED_24_MAX,
            supports_motion_blur: false,
            transform_alignment: 64,
        };
        info!("{id}: {}", capabilities.summary());

        let as_loader = ash::khr::acceleration_structure::Device::new(instance, &device);
        let pool = device.create_command_pool(
            &vk::CommandPoolCreateInfo::default()
                .queue_family_index(queue_family)
                .flags(vk::CommandPoolCreateFlags::TRANSIENT),
            None,
        )?;
        let fence = device.create_fence(&vk::FenceCreateInfo::default(), None)?;
        let buffers = BufferAllocator::new(instance, device.clone(), physical_device)?;

        Ok(Self {
            id,
            capabilities,
            as_loader,
            queue,
            scratch_alignment: u64::from(
                as_properties
                    .min_acceleration_structure_scratch_offset_alignment
                    .max(1),
            ),
            buffers: Mutex::new(buffers),
            commands: Mutex::new(Commands { pool, fence }),
            structures: Mutex::new(HashMap::new()),
            device,
        })
    }

    /// Raw structure built into the block at `address`.
    pub fn acceleration_structure(&self, address: DeviceAddress) -> Option<vk::AccelerationStructureKHR> {
        self.structures.lock().get(&address.0).copied()
    }

    /// Record `f` into a one-shot command buffer and wait for it.
    unsafe fn execute_single_time_commands<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(vk::CommandBuffer),
    {
        let commands = self.commands.lock();
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(commands.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cmd = self.device.allocate_command_buffers(&alloc_info)?[0];

        let result = (|| -> Result<()> {
            self.device.begin_command_buffer(
                cmd,
                &vk::CommandBufferBeginInfo::default()
                    .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
            )?;
            f(cmd);
            self.device.end_command_buffer(cmd)?;

            let cmd_buffers = [cmd];
            let submit_info = vk::SubmitInfo::default().command_buffers(&cmd_buffers);
            self.device
                .queue_submit(self.queue, &[submit_info], commands.fence)?;
            self.device
                .wait_for_fences(&[commands.fence], true, u64::MAX)?;
            self.device.reset_fences(&[commands.fence])?;
            Ok(())
        })();

        self.device.free_command_buffers(commands.pool, &[cmd]);
        result
    }
}

fn vk_build_flags(flags: BuildFlags) -> vk::BuildAccelerationStructureFlagsKHR {
    let mut out = vk::BuildAccelerationStructureFlagsKHR::empty();
    if flags.contains(BuildFlags::ALLOW_UPDATE) {
        out |= vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE;
    }
    if flags.contains(BuildFlags::ALLOW_COMPACTION) {
        out |= vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION;
    }
    if flags.contains(BuildFlags::PREFER_FAST_TRACE) {
        out |= vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE;
    }
    if flags.contains(BuildFlags::PREFER_FAST_BUILD) {
        out |= vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_BUILD;
    }
    out
}

/// Geometries, per-geometry primitive counts and the structure type of an input.
fn vk_geometries(
    input: &BuildInput,
) -> (
    Vec<vk::AccelerationStructureGeometryKHR<'static>>,
    Vec<u32>,
    vk::AccelerationStructureTypeKHR,
) {
    match input {
        BuildInput::Instances { instances, count } => {
            let geometry = vk::AccelerationStructureGeometryKHR::default()
                .geometry_type(vk::GeometryTypeKHR::INSTANCES)
                .flags(vk::GeometryFlagsKHR::OPAQUE)
                .geometry(vk::AccelerationStructureGeometryDataKHR {
                    instances: vk::AccelerationStructureGeometryInstancesDataKHR::default()
                        .array_of_pointers(false)
                        .data(vk::DeviceOrHostAddressConstKHR {
                            device_address: instances.0,
                        }),
                });
            (
                vec![geometry],
                vec![*count],
                vk::AccelerationStructureTypeKHR::TOP_LEVEL,
            )
        }
        BuildInput::Geometries(geoms) => {
            let geometries = geoms
                .iter()
                .map(|geom| match geom {
                    GeometryInput::Triangles(t) => vk::AccelerationStructureGeometryKHR::default()
                        .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
                        .flags(vk::GeometryFlagsKHR::OPAQUE)
                        .geometry(vk::AccelerationStructureGeometryDataKHR {
                            triangles: vk::AccelerationStructureGeometryTrianglesDataKHR::default()
                                .vertex_format(vk::Format::R32G32B32_SFLOAT)
                                .vertex_data(vk::DeviceOrHostAddressConstKHR {
                                    device_address: t.vertices.0,
                                })
                                .vertex_stride(u64::from(t.vertex_stride))
                                .max_vertex(t.vertex_count.saturating_sub(1))
                                .index_type(vk::IndexType::UINT32)
                                .index_data(vk::DeviceOrHostAddressConstKHR {
                                    device_address: t.indices.0,
                                }),
                        }),
                    GeometryInput::CustomPrimitives(a) => {
                        vk::AccelerationStructureGeometryKHR::default()
                            .geometry_type(vk::GeometryTypeKHR::AABBS)
                            .flags(vk::GeometryFlagsKHR::OPAQUE)
                            .geometry(vk::AccelerationStructureGeometryDataKHR {
                                aabbs: vk::AccelerationStructureGeometryAabbsDataKHR::default()
                                    .data(vk::DeviceOrHostAddressConstKHR {
                                        device_address: a.aabbs.0,
                                    })
                                    .stride(u64::from(a.stride)),
                            })
                    }
                })
                .collect();
            let counts = geoms.iter().map(GeometryInput::primitive_count).collect();
            (
                geometries,
                counts,
                vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            )
        }
    }
}

impl DeviceAllocator for VulkanAccelerator {
    fn allocate(&self, size: u64, name: &str) -> Result<DeviceAddress> {
        self.buffers.lock().allocate(size, name).map(DeviceAddress)
    }

    fn write(&self, address: DeviceAddress, bytes: &[u8]) -> Result<()> {
        self.buffers.lock().write(address.0, bytes)
    }

    fn release(&self, address: DeviceAddress) -> Result<()> {
        if let Some(structure) = self.structures.lock().remove(&address.0) {
            // SAFETY: builds are waited on before returning, so the structure
            // is not in use by the device.
            unsafe {
                self.as_loader
                    .destroy_acceleration_structure(structure, None);
            }
        }
        self.buffers.lock().free(address.0)
    }
}

impl Accelerator for VulkanAccelerator {
    fn device_id(&self) -> DeviceId {
        self.id
    }

    fn capabilities(&self) -> &RayTracingCapabilities {
        &self.capabilities
    }

    fn compute_memory_usage(
        &self,
        options: &AccelBuildOptions,
        input: &BuildInput,
    ) -> Result<AccelBufferSizes> {
        let (geometries, counts, ty) = vk_geometries(input);
        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(ty)
            .flags(vk_build_flags(options.build_flags))
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(&geometries);

        let mut build_sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
        unsafe {
            self.as_loader.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_info,
                &counts,
                &mut build_sizes,
            );
        }

        // Scratch addresses are aligned up inside the block at build time.
        Ok(AccelBufferSizes {
            output_size_in_bytes: build_sizes.acceleration_structure_size,
            temp_size_in_bytes: build_sizes.build_scratch_size + self.scratch_alignment,
            temp_update_size_in_bytes: build_sizes.update_scratch_size + self.scratch_alignment,
        })
    }

    fn build(
        &self,
        options: &AccelBuildOptions,
        input: &BuildInput,
        temp: &DeviceMemory,
        output: &DeviceMemory,
    ) -> Result<TraversableHandle> {
        if options.motion_options.num_keys > 1 {
            return Err(GpuError::Unsupported("motion blur build options".to_string()));
        }
        let (geometries, counts, ty) = vk_geometries(input);
        let output_buffer = self
            .buffers
            .lock()
            .buffer(output.address().0)
            .map(|b| b.buffer)
            .ok_or_else(|| {
                GpuError::BuildFailed(format!("output block {} is not allocated", output.address()))
            })?;

        let mut structures = self.structures.lock();
        let existing = structures.get(&output.address().0).copied();
        let structure = match (options.operation, existing) {
            (BuildOperation::Update, Some(structure)) => structure,
            (BuildOperation::Update, None) => {
                return Err(GpuError::BuildFailed(
                    "update of a block that holds no structure".to_string(),
                ));
            }
            (BuildOperation::Build, existing) => unsafe {
                if let Some(old) = existing {
                    self.as_loader.destroy_acceleration_structure(old, None);
                    structures.remove(&output.address().0);
                }
                let create_info = vk::AccelerationStructureCreateInfoKHR::default()
                    .buffer(output_buffer)
                    .offset(0)
                    .size(output.size())
                    .ty(ty);
                let structure = self
                    .as_loader
                    .create_acceleration_structure(&create_info, None)?;
                structures.insert(output.address().0, structure);
                structure
            },
        };
        drop(structures);

        let mode = if options.operation.is_full_rebuild() {
            vk::BuildAccelerationStructureModeKHR::BUILD
        } else {
            vk::BuildAccelerationStructureModeKHR::UPDATE
        };
        let scratch = temp.address().0.next_multiple_of(self.scratch_alignment);
        let mut build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(ty)
            .flags(vk_build_flags(options.build_flags))
            .mode(mode)
            .dst_acceleration_structure(structure)
            .geometries(&geometries)
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: scratch,
            });
        if !options.operation.is_full_rebuild() {
            build_info = build_info.src_acceleration_structure(structure);
        }
        let ranges: Vec<vk::AccelerationStructureBuildRangeInfoKHR> = counts
            .iter()
            .map(|count| {
                vk::AccelerationStructureBuildRangeInfoKHR::default()
                    .primitive_count(*count)
                    .primitive_offset(0)
                    .first_vertex(0)
                    .transform_offset(0)
            })
            .collect();

        debug!(
            device = %self.id,
            ?ty,
            ?mode,
            primitives = input.primitive_count(),
            "recording acceleration structure build"
        );
        unsafe {
            self.execute_single_time_commands(|cmd| {
                self.as_loader.cmd_build_acceleration_structures(
                    cmd,
                    std::slice::from_ref(&build_info),
                    &[ranges.as_slice()],
                );
            })?;

            let address_info = vk::AccelerationStructureDeviceAddressInfoKHR::default()
                .acceleration_structure(structure);
            Ok(TraversableHandle(
                self.as_loader
                    .get_acceleration_structure_device_address(&address_info),
            ))
        }
    }

    fn convert_pointer_to_handle(
        &self,
        address: DeviceAddress,
        ty: TraversableType,
    ) -> Result<TraversableHandle> {
        match ty {
            TraversableType::MatrixMotionTransform => Err(GpuError::Unsupported(format!(
                "matrix motion transform at {address} on {}",
                self.capabilities.device_name
            ))),
        }
    }

    fn synchronize(&self) -> Result<()> {
        unsafe { self.device.queue_wait_idle(self.queue)? };
        Ok(())
    }

    // Vulkan has no per-thread current device; every call names its device.
    fn push_active(&self) -> Result<ContextToken> {
        Ok(ContextToken(0))
    }

    fn pop_active(&self, _previous: ContextToken) {}

    fn encode_instances(&self, instances: &[InstanceDesc]) -> Vec<u8> {
        let records: Vec<vk::AccelerationStructureInstanceKHR> = instances
            .iter()
            .map(|inst| vk::AccelerationStructureInstanceKHR {
                transform: vk::TransformMatrixKHR {
                    matrix: inst.transform.0,
                },
                instance_custom_index_and_mask: vk::Packed24_8::new(
                    inst.instance_id,
                    inst.visibility_mask as u8,
                ),
                instance_shader_binding_table_record_offset_and_flags: vk::Packed24_8::new(
                    inst.sbt_offset,
                    inst.flags as u8,
                ),
                acceleration_structure_reference: vk::AccelerationStructureReferenceKHR {
                    device_handle: inst.traversable_handle.0,
                },
            })
            .collect();

        let byte_len = std::mem::size_of_val(records.as_slice());
        let mut bytes = vec![0u8; byte_len];
        // SAFETY: the instance record is plain old data laid out as the
        // device reads it.
        unsafe {
            std::ptr::copy_nonoverlapping(
                records.as_ptr().cast::<u8>(),
                bytes.as_mut_ptr(),
                byte_len,
            );
        }
        bytes
    }
}

impl Drop for VulkanAccelerator {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            for (_, structure) in self.structures.get_mut().drain() {
                self.as_loader
                    .destroy_acceleration_structure(structure, None);
            }
            self.buffers.get_mut().shutdown();
            let commands = self.commands.get_mut();
            self.device.destroy_fence(commands.fence, None);
            self.device.destroy_command_pool(commands.pool, None);
        }
    }
}
