//! Buffer allocation for the Vulkan backend.

use crate::error::{GpuError, Result};
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Usage of every buffer handed out as device memory: any block may hold
/// build inputs, scratch space or a structure.
const BUFFER_USAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::from_raw(
    vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR.as_raw()
        | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR.as_raw()
        | vk::BufferUsageFlags::STORAGE_BUFFER.as_raw()
        | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS.as_raw(),
);

/// A buffer with its allocation.
pub(crate) struct GpuBuffer {
    pub buffer: vk::Buffer,
    pub allocation: Option<Allocation>,
    pub size: u64,
}

impl GpuBuffer {
    fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<()> {
        let ptr = self
            .allocation
            .as_ref()
            .and_then(Allocation::mapped_ptr)
            .ok_or_else(|| GpuError::InvalidState("Buffer not mapped".to_string()))?;

        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| GpuError::UploadFailed("Offset overflow".to_string()))?;
        if end > self.size {
            return Err(GpuError::UploadFailed(format!(
                "{} bytes at offset {offset} exceed a {} byte buffer",
                data.len(),
                self.size
            )));
        }

        // SAFETY: the range was checked against the buffer size and the
        // allocation stays mapped while it is alive.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                ptr.as_ptr().cast::<u8>().add(offset as usize),
                data.len(),
            );
        }
        Ok(())
    }
}

/// Host-visible buffers addressed by their device address.
pub(crate) struct BufferAllocator {
    allocator: Option<Allocator>,
    device: Arc<ash::Device>,
    buffers: BTreeMap<u64, GpuBuffer>,
}

impl BufferAllocator {
    /// Create a new allocator.
    ///
    /// # Safety
    /// The instance, device, and physical device must be valid.
    pub unsafe fn new(
        instance: &ash::Instance,
        device: Arc<ash::Device>,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: (*device).clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: cfg!(debug_assertions),
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: true,
            allocation_sizes: gpu_allocator::AllocationSizes::default(),
        })
        .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        Ok(Self {
            allocator: Some(allocator),
            device,
            buffers: BTreeMap::new(),
        })
    }

    /// Allocate a buffer and return its device address.
    pub fn allocate(&mut self, size: u64, name: &str) -> Result<u64> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(BUFFER_USAGE)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        // SAFETY: the device outlives the allocator.
        let buffer = unsafe { self.device.create_buffer(&buffer_info, None)? };
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let allocator = self
            .allocator
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("Allocator not initialized".to_string()))?;
        let allocation = match allocator.allocate(&AllocationCreateDesc {
            name,
            requirements,
            location: MemoryLocation::CpuToGpu,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(GpuError::AllocationFailed(format!("{name}: {e}")));
            }
        };

        unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())?;
        }

        let info = vk::BufferDeviceAddressInfo::default().buffer(buffer);
        let address = unsafe { self.device.get_buffer_device_address(&info) };
        self.buffers.insert(
            address,
            GpuBuffer {
                buffer,
                allocation: Some(allocation),
                size,
            },
        );
        Ok(address)
    }

    /// The buffer starting at `address`.
    pub fn buffer(&self, address: u64) -> Option<&GpuBuffer> {
        self.buffers.get(&address)
    }

    /// Copy bytes to `address`, which may point inside a buffer.
    pub fn write(&self, address: u64, bytes: &[u8]) -> Result<()> {
        let (base, buffer) = self
            .buffers
            .range(..=address)
            .next_back()
            .ok_or_else(|| GpuError::UploadFailed(format!("{address:#x} is not allocated")))?;
        buffer.write_bytes(address - base, bytes)
    }

    /// Free the buffer starting at `address`.
    pub fn free(&mut self, address: u64) -> Result<()> {
        let mut buffer = self.buffers.remove(&address).ok_or_else(|| {
            GpuError::InvalidState(format!("free of unknown allocation {address:#x}"))
        })?;
        if let Some(allocation) = buffer.allocation.take() {
            self.allocator
                .as_mut()
                .ok_or_else(|| GpuError::InvalidState("Allocator not initialized".to_string()))?
                .free(allocation)
                .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;
        }
        unsafe {
            self.device.destroy_buffer(buffer.buffer, None);
        }
        Ok(())
    }

    /// Free every buffer and the allocator itself.
    ///
    /// This must be called before the Vulkan device is destroyed.
    pub fn shutdown(&mut self) {
        let addresses: Vec<u64> = self.buffers.keys().copied().collect();
        if !addresses.is_empty() {
            tracing::warn!("{} device buffers still allocated at shutdown", addresses.len());
        }
        for address in addresses {
            if let Err(e) = self.free(address) {
                tracing::warn!("failed to free buffer {address:#x}: {e}");
            }
        }
        if let Some(allocator) = self.allocator.take() {
            drop(allocator);
        }
    }
}

impl Drop for BufferAllocator {
    fn drop(&mut self) {
        self.shutdown();
    }
}
