//! Device memory management.

use crate::error::{GpuError, Result};
use std::ops::Deref;
use strata_core::DeviceAddress;

/// Raw device memory primitives provided by a backend.
pub trait DeviceAllocator: Send + Sync {
    /// Allocate `size` bytes of device memory.
    fn allocate(&self, size: u64, name: &str) -> Result<DeviceAddress>;

    /// Copy host bytes to `address`.
    fn write(&self, address: DeviceAddress, bytes: &[u8]) -> Result<()>;

    /// Free an allocation previously returned by [`DeviceAllocator::allocate`].
    fn release(&self, address: DeviceAddress) -> Result<()>;
}

/// A block of device memory owned by exactly one object on one device.
///
/// The block does not remember its allocator; like the buffers it replaces it
/// must be freed explicitly through the allocator that created it.
#[derive(Debug, Default)]
pub struct DeviceMemory {
    address: DeviceAddress,
    size: u64,
}

impl DeviceMemory {
    /// An empty block.
    pub const fn new() -> Self {
        Self {
            address: DeviceAddress::NULL,
            size: 0,
        }
    }

    /// Device address of the first byte.
    #[inline]
    pub const fn address(&self) -> DeviceAddress {
        self.address
    }

    /// Size in bytes; zero when empty.
    #[inline]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Whether no memory is held.
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.address.is_null()
    }

    /// (Re)allocate to exactly `size` bytes, freeing any previous block.
    ///
    /// A zero size leaves the block empty.
    pub fn alloc<A: DeviceAllocator + ?Sized>(
        &mut self,
        allocator: &A,
        size: u64,
        name: &str,
    ) -> Result<()> {
        self.free(allocator)?;
        if size == 0 {
            return Ok(());
        }
        self.address = allocator.allocate(size, name)?;
        self.size = size;
        Ok(())
    }

    /// Keep the current block if it already has `size` bytes, otherwise
    /// reallocate.
    pub fn ensure<A: DeviceAllocator + ?Sized>(
        &mut self,
        allocator: &A,
        size: u64,
        name: &str,
    ) -> Result<()> {
        if self.size == size && (size == 0 || !self.is_empty()) {
            return Ok(());
        }
        self.alloc(allocator, size, name)
    }

    /// Copy `data` to the start of the block.
    pub fn upload<A: DeviceAllocator + ?Sized, T: bytemuck::Pod>(
        &self,
        allocator: &A,
        data: &[T],
    ) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        if bytes.len() as u64 > self.size {
            return Err(GpuError::UploadFailed(format!(
                "{} bytes do not fit into a {} byte block",
                bytes.len(),
                self.size
            )));
        }
        if bytes.is_empty() {
            return Ok(());
        }
        allocator.write(self.address, bytes)
    }

    /// Allocate exactly enough for `data` and upload it.
    pub fn alloc_and_upload<A: DeviceAllocator + ?Sized, T: bytemuck::Pod>(
        &mut self,
        allocator: &A,
        data: &[T],
        name: &str,
    ) -> Result<()> {
        self.ensure(allocator, std::mem::size_of_val(data) as u64, name)?;
        self.upload(allocator, data)
    }

    /// Release the block. Freeing an empty block is a no-op.
    pub fn free<A: DeviceAllocator + ?Sized>(&mut self, allocator: &A) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        let address = std::mem::take(&mut self.address);
        self.size = 0;
        allocator.release(address)
    }
}

impl Drop for DeviceMemory {
    fn drop(&mut self) {
        if !self.is_empty() {
            tracing::warn!(
                address = %self.address,
                bytes = self.size,
                "device memory block dropped without being freed"
            );
        }
    }
}

/// Device memory freed automatically when it goes out of scope.
///
/// Used for temp buffers that must be released on every exit path of a build.
pub struct ScopedMemory<'a, A: DeviceAllocator + ?Sized> {
    allocator: &'a A,
    memory: DeviceMemory,
}

impl<'a, A: DeviceAllocator + ?Sized> ScopedMemory<'a, A> {
    /// Allocate `size` bytes.
    pub fn alloc(allocator: &'a A, size: u64, name: &str) -> Result<Self> {
        let mut memory = DeviceMemory::new();
        memory.alloc(allocator, size, name)?;
        Ok(Self { allocator, memory })
    }

    /// Free now, reporting any error.
    pub fn free(mut self) -> Result<()> {
        self.memory.free(self.allocator)
    }
}

impl<A: DeviceAllocator + ?Sized> Deref for ScopedMemory<'_, A> {
    type Target = DeviceMemory;

    fn deref(&self) -> &Self::Target {
        &self.memory
    }
}

impl<A: DeviceAllocator + ?Sized> Drop for ScopedMemory<'_, A> {
    fn drop(&mut self) {
        if let Err(e) = self.memory.free(self.allocator) {
            tracing::warn!("failed to free scoped device memory: {e}");
        }
    }
}
