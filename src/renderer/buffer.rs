use crate::renderer::device::RenderDevice;
use ash::prelude::VkResult;
use ash::vk;
use color_eyre::Result;
use color_eyre::eyre::{OptionExt, eyre};
use gpu_allocator::{
    MemoryLocation,
    vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator},
};
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

/// Lowest memory type index allowed by `type_filter` whose flags contain all of `required`.
pub fn find_memory_type(
    type_filter: u32,
    required: vk::MemoryPropertyFlags,
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
) -> Result<u32> {
    let count = memory_properties.memory_type_count.min(vk::MAX_MEMORY_TYPES as u32);
    (0..count)
        .find(|&i| {
            let allowed = type_filter & (1 << i) != 0;
            let flags = memory_properties.memory_types[i as usize].property_flags;
            allowed && flags.contains(required)
        })
        .ok_or_eyre(format!(
            "No memory type matches filter {:#b} with properties {:?}",
            type_filter, required
        ))
}

/// Property flags a [`MemoryLocation`] must provide at the very least.
pub fn required_memory_flags(location: MemoryLocation) -> vk::MemoryPropertyFlags {
    match location {
        MemoryLocation::GpuOnly => vk::MemoryPropertyFlags::DEVICE_LOCAL,
        MemoryLocation::CpuToGpu | MemoryLocation::GpuToCpu => {
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
        }
        MemoryLocation::Unknown => vk::MemoryPropertyFlags::empty(),
    }
}

/// Byte range of host-visible memory that is currently mapped.
pub struct MappedRegion<'a> {
    ptr: NonNull<u8>,
    len: usize,
    _marker: PhantomData<&'a mut [u8]>,
}

impl<'a> MappedRegion<'a> {
    pub fn new(bytes: &'a mut [u8]) -> Self {
        Self {
            ptr: NonNull::from(&mut *bytes).cast(),
            len: bytes.len(),
            _marker: PhantomData,
        }
    }

    /// # Safety
    /// `ptr` must be valid for reads and writes of `len` bytes for `'a`.
    pub unsafe fn from_raw(ptr: NonNull<u8>, len: usize) -> Self {
        Self {
            ptr,
            len,
            _marker: PhantomData,
        }
    }
}

unsafe impl presser::Slab for MappedRegion<'_> {
    fn base_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    fn base_ptr_mut(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn size(&self) -> usize {
        self.len
    }
}

/// Host-visible memory that can be mapped for CPU writes.
///
/// # Safety
/// The region returned by `map` must stay valid, at the same address, until `unmap` is called,
/// even if the implementor is moved in between.
pub unsafe trait HostMemory {
    fn map(&mut self) -> Result<MappedRegion<'_>>;
    fn unmap(&mut self);
}

unsafe impl HostMemory for Allocation {
    fn map(&mut self) -> Result<MappedRegion<'_>> {
        // gpu-allocator keeps host-visible blocks mapped for their whole lifetime
        let ptr = self
            .mapped_ptr()
            .ok_or_eyre("Allocation is not host visible")?
            .cast::<u8>();
        let len = self.size() as usize;
        Ok(unsafe { MappedRegion::from_raw(ptr, len) })
    }

    fn unmap(&mut self) {}
}

/// Copies `data` into `memory` at `offset` through a mapping that only lives for this call.
pub fn write_host_memory<M, T>(
    memory: &mut M,
    data: &[T],
    offset: usize,
) -> Result<presser::CopyRecord>
where
    M: HostMemory + ?Sized,
    T: Copy,
{
    let record = {
        let mut region = memory.map()?;
        presser::copy_from_slice_to_offset(data, &mut region, offset)
    };
    memory.unmap();
    Ok(record?)
}

/// Host memory plus the mapping kept from `map` until `into_inner`.
pub struct MappableMemory<M: HostMemory> {
    memory: M,
    mapped: Option<(NonNull<u8>, usize)>,
}

impl<M: HostMemory> MappableMemory<M> {
    pub fn new(memory: M) -> Self {
        Self { memory, mapped: None }
    }

    /// Maps once; every later write copies straight into the kept pointer.
    pub fn map(&mut self) -> Result<()> {
        if self.mapped.is_none() {
            let region = self.memory.map()?;
            self.mapped = Some((region.ptr, region.len));
        }
        Ok(())
    }

    pub fn write<T: Copy>(&mut self, data: &[T], offset: usize) -> Result<presser::CopyRecord> {
        match self.mapped {
            Some((ptr, len)) => {
                // Stays valid until `into_inner` unmaps it
                let mut region = unsafe { MappedRegion::from_raw(ptr, len) };
                Ok(presser::copy_from_slice_to_offset(data, &mut region, offset)?)
            }
            None => write_host_memory(&mut self.memory, data, offset),
        }
    }

    /// Drops the kept mapping and hands the memory back
    pub fn into_inner(self) -> M {
        let Self { mut memory, mapped } = self;
        if mapped.is_some() {
            memory.unmap();
        }
        memory
    }
}

/// Runs `bind` on `resource`. If it fails, `release` gets the resource before the error is returned.
fn bind_or_release<R>(
    resource: R,
    bind: impl FnOnce(&R) -> VkResult<()>,
    release: impl FnOnce(R),
) -> Result<R> {
    match bind(&resource) {
        Ok(()) => Ok(resource),
        Err(e) => {
            release(resource);
            Err(e.into())
        }
    }
}

fn free_allocation(allocator: &Mutex<Allocator>, allocation: Allocation) {
    match allocator.lock() {
        Ok(mut allocator) => {
            if let Err(e) = allocator.free(allocation) {
                log::error!("Failed to free buffer memory: {e}");
            }
        }
        Err(e) => log::error!("Memory allocator poisoned: {e}"),
    }
}

pub struct Buffer {
    pub buffer: vk::Buffer,
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    pub location: MemoryLocation,

    memory: Option<MappableMemory<Allocation>>,
    memory_allocator: Arc<Mutex<Allocator>>,
    device: Arc<ash::Device>,
}

impl Buffer {
    pub fn new(
        dev: &RenderDevice,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<Self> {
        if size == 0 {
            return Err(eyre!("Buffer '{}' must not be empty", name));
        }

        let device = dev.logical.clone();
        let memory_allocator = dev.memory_allocator();
        let buffer = {
            let buffer_info = vk::BufferCreateInfo::default()
                .size(size)
                .usage(usage)
                .sharing_mode(vk::SharingMode::EXCLUSIVE);
            unsafe { device.create_buffer(&buffer_info, None)? }
        };

        let requirements = unsafe {
            device.get_buffer_memory_requirements(buffer)
        };

        let allocation = Self::allocate(dev, buffer, requirements, location, name);
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        let allocation = bind_or_release(
            allocation,
            |allocation| unsafe {
                device.bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
            },
            |allocation| {
                free_allocation(&memory_allocator, allocation);
                unsafe { device.destroy_buffer(buffer, None) };
            },
        )?;

        Ok(Self {
            buffer,
            size,
            usage,
            location,

            memory: Some(MappableMemory::new(allocation)),
            memory_allocator,
            device,
        })
    }

    fn allocate(
        dev: &RenderDevice,
        buffer: vk::Buffer,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
        name: &str,
    ) -> Result<Allocation> {
        let memory_type = dev.find_memory_type(
            requirements.memory_type_bits,
            required_memory_flags(location),
        )?;
        log::trace!("Buffer '{}' is compatible with memory type {}", name, memory_type);

        let allocation = dev
            .memory_allocator()
            .lock()
            .map_err(|e| eyre!(e.to_string()))?
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear: true,
                allocation_scheme: AllocationScheme::DedicatedBuffer(buffer),
            })?;
        Ok(allocation)
    }

    /// Creates a device-local buffer and fills it through a transient staging buffer.
    pub fn new_device_local<T: Copy>(
        dev: &RenderDevice,
        data: &[T],
        usage: vk::BufferUsageFlags,
        name: &str,
    ) -> Result<Self> {
        let size = std::mem::size_of_val(data) as u64;

        let mut staging = Self::new(
            dev,
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
            &format!("{} staging", name),
        )?;
        staging.upload(data)?;

        let buffer = Self::new(
            dev,
            size,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuOnly,
            name,
        )?;
        Self::copy(dev, &staging, &buffer, size)?;

        // The copy has completed by now, so the staging buffer can go
        Ok(buffer)
    }

    /// Keeps the mapping alive so later uploads copy straight into it.
    pub fn map(&mut self) -> Result<()> {
        self.memory_mut()?.map()
    }

    pub fn upload<T: Copy>(&mut self, data: &[T]) -> Result<()> {
        self.write(data, 0).map(|_| ())
    }

    pub fn write<T: Copy>(
        &mut self,
        data: &[T],
        start_offset: usize,
    ) -> Result<presser::CopyRecord> {
        self.memory_mut()?.write(data, start_offset)
    }

    /// One-shot `vkCmdCopyBuffer`, blocking until the queue is idle.
    pub fn copy(
        dev: &RenderDevice,
        src: &Buffer,
        dst: &Buffer,
        size: u64,
    ) -> Result<()> {
        if size > src.size || size > dst.size {
            return Err(eyre!(
                "Copy of {} bytes exceeds source ({}) or destination ({})",
                size,
                src.size,
                dst.size
            ));
        }

        dev.immediate_submit(|cmd, device| {
            let region = vk::BufferCopy::default().size(size);
            unsafe {
                device.cmd_copy_buffer(cmd, src.buffer, dst.buffer, &[region]);
            }
            Ok(())
        })
    }

    fn memory_mut(&mut self) -> Result<&mut MappableMemory<Allocation>> {
        self.memory
            .as_mut()
            .ok_or_eyre("Buffer allocation already released")
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(memory) = self.memory.take() {
            free_allocation(&self.memory_allocator, memory.into_inner());
        }
        unsafe {
            self.device.destroy_buffer(self.buffer, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_properties(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties::default();
        props.memory_type_count = types.len() as u32;
        for (i, flags) in types.iter().enumerate() {
            props.memory_types[i].property_flags = *flags;
        }
        props
    }

    fn typical_props() -> vk::PhysicalDeviceMemoryProperties {
        let local = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        memory_properties(&[local, host, local | host, host | vk::MemoryPropertyFlags::HOST_CACHED])
    }

    #[test]
    fn picks_lowest_matching_index() {
        let props = typical_props();
        let host = required_memory_flags(MemoryLocation::CpuToGpu);

        assert_eq!(find_memory_type(0b1111, host, &props).unwrap(), 1);
        assert_eq!(find_memory_type(0b1100, host, &props).unwrap(), 2);
        assert_eq!(find_memory_type(0b1111, vk::MemoryPropertyFlags::DEVICE_LOCAL, &props).unwrap(), 0);
        assert_eq!(find_memory_type(0b1000, host, &props).unwrap(), 3);
    }

    #[test]
    fn selection_is_deterministic() {
        let props = typical_props();
        let flags = vk::MemoryPropertyFlags::DEVICE_LOCAL | vk::MemoryPropertyFlags::HOST_VISIBLE;
        let first = find_memory_type(0b0110, flags, &props).unwrap();
        for _ in 0..100 {
            assert_eq!(find_memory_type(0b0110, flags, &props).unwrap(), first);
        }
    }

    #[test]
    fn empty_filter_fails_instead_of_returning_zero() {
        let props = typical_props();
        for flags in [
            vk::MemoryPropertyFlags::empty(),
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
        ] {
            assert!(find_memory_type(0b0000, flags, &props).is_err());
        }
    }

    #[test]
    fn unsatisfiable_flags_fail() {
        let props = typical_props();
        assert!(find_memory_type(0b1111, vk::MemoryPropertyFlags::LAZILY_ALLOCATED, &props).is_err());
        // Filter bits beyond the reported type count are ignored
        assert!(find_memory_type(1 << 7, vk::MemoryPropertyFlags::empty(), &props).is_err());
    }

    #[derive(Default)]
    struct FakeMemory {
        bytes: Vec<u8>,
        maps: usize,
        unmaps: usize,
    }

    impl FakeMemory {
        fn with_size(size: usize) -> Self {
            Self {
                bytes: vec![0; size],
                ..Default::default()
            }
        }
    }

    unsafe impl HostMemory for FakeMemory {
        fn map(&mut self) -> Result<MappedRegion<'_>> {
            if self.maps > self.unmaps {
                return Err(eyre!("Memory is already mapped"));
            }
            self.maps += 1;
            Ok(MappedRegion::new(&mut self.bytes))
        }

        fn unmap(&mut self) {
            self.unmaps += 1;
        }
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i.wrapping_mul(31) ^ (i >> 8)) as u8).collect()
    }

    #[test]
    fn upload_round_trips_for_small_and_large_payloads() {
        for size in [1usize, 3, 64, 4097, 1 << 20, 3 * (1 << 20) + 5] {
            let data = pattern(size);

            let mut staging = FakeMemory::with_size(size);
            write_host_memory(&mut staging, &data, 0).unwrap();

            // Second hop mimics copying the staging contents into a read-back buffer
            let mut readback = FakeMemory::with_size(size);
            write_host_memory(&mut readback, &staging.bytes, 0).unwrap();

            assert_eq!(readback.bytes, data, "mismatch for {} bytes", size);
        }
    }

    #[test]
    fn transient_upload_maps_and_unmaps_every_time() {
        let mut memory = MappableMemory::new(FakeMemory::with_size(16));
        for _ in 0..3 {
            memory.write(&[7u8; 16], 0).unwrap();
        }
        let memory = memory.into_inner();
        assert_eq!(memory.maps, 3);
        assert_eq!(memory.unmaps, 3);
    }

    #[test]
    fn mapped_memory_is_written_through_the_kept_pointer() {
        let mut memory = MappableMemory::new(FakeMemory::with_size(16));
        memory.map().unwrap();
        // Mapping twice is a no-op, the fake would refuse a second map
        memory.map().unwrap();
        for i in 0..5u8 {
            memory.write(&[i, i + 1, i + 2, i + 3], 4).unwrap();
        }

        let memory = memory.into_inner();
        assert_eq!(memory.maps, 1);
        assert_eq!(memory.unmaps, 1);
        assert_eq!(&memory.bytes[4..8], &[4, 5, 6, 7]);
    }

    #[test]
    fn mapped_write_is_bounded() {
        let mut memory = MappableMemory::new(FakeMemory::with_size(8));
        memory.map().unwrap();
        assert!(memory.write(&[0u8; 8], 1).is_err());
        assert!(memory.write(&[0u8; 8], 0).is_ok());
    }

    #[test]
    fn failed_bind_releases_the_resource() {
        let released = std::cell::Cell::new(0);

        let result = bind_or_release(
            42u32,
            |_| Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY),
            |_| released.set(released.get() + 1),
        );
        assert!(result.is_err());
        assert_eq!(released.get(), 1);

        let result = bind_or_release(42u32, |_| Ok(()), |_| released.set(released.get() + 1));
        assert_eq!(result.unwrap(), 42);
        assert_eq!(released.get(), 1);
    }

    #[test]
    fn write_at_offset_and_overflow() {
        let mut memory = FakeMemory::with_size(8);
        write_host_memory(&mut memory, &[0xAAu8; 4], 4).unwrap();
        assert_eq!(memory.bytes, vec![0, 0, 0, 0, 0xAA, 0xAA, 0xAA, 0xAA]);

        assert!(write_host_memory(&mut memory, &[0u8; 8], 4).is_err());
        // A failed copy still unmaps
        assert_eq!(memory.maps, memory.unmaps);
    }
}
