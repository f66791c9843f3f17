use ash::vk;
use color_eyre::Result;
use color_eyre::eyre::{OptionExt, eyre};
use gpu_descriptor::{
    CreatePoolError, DescriptorDevice, DescriptorPoolCreateFlags, DescriptorTotalCount,
    DeviceAllocationError,
};
use std::sync::Arc;

pub struct DescriptorSetLayoutBuilder<'a> {
    bindings: Vec<vk::DescriptorSetLayoutBinding<'a>>,
}

impl Default for DescriptorSetLayoutBuilder<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl DescriptorSetLayoutBuilder<'_> {
    pub fn new() -> Self {
        Self {
            bindings: Vec::new(),
        }
    }

    pub fn add_binding(
        mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        descriptor_count: u32,
        stages: vk::ShaderStageFlags,
    ) -> Self {
        let binding = vk::DescriptorSetLayoutBinding::default()
            .binding(binding)
            .descriptor_type(descriptor_type)
            .descriptor_count(descriptor_count)
            .stage_flags(stages);

        self.bindings.push(binding);
        self
    }

    pub fn bindings(&self) -> &[vk::DescriptorSetLayoutBinding<'_>] {
        &self.bindings
    }

    /// Totals per descriptor type, in the shape gpu-descriptor expects.
    pub fn total_count(&self) -> DescriptorTotalCount {
        let mut total = DescriptorTotalCount::default();
        for binding in &self.bindings {
            let count = binding.descriptor_count;
            match binding.descriptor_type {
                vk::DescriptorType::SAMPLER => total.sampler += count,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER => total.combined_image_sampler += count,
                vk::DescriptorType::SAMPLED_IMAGE => total.sampled_image += count,
                vk::DescriptorType::STORAGE_IMAGE => total.storage_image += count,
                vk::DescriptorType::UNIFORM_TEXEL_BUFFER => total.uniform_texel_buffer += count,
                vk::DescriptorType::STORAGE_TEXEL_BUFFER => total.storage_texel_buffer += count,
                vk::DescriptorType::UNIFORM_BUFFER => total.uniform_buffer += count,
                vk::DescriptorType::STORAGE_BUFFER => total.storage_buffer += count,
                vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC => total.uniform_buffer_dynamic += count,
                vk::DescriptorType::STORAGE_BUFFER_DYNAMIC => total.storage_buffer_dynamic += count,
                vk::DescriptorType::INPUT_ATTACHMENT => total.input_attachment += count,
                _ => {}
            }
        }
        total
    }

    /// Pool sizes needed to allocate `sets` copies of this layout.
    pub fn pool_sizes(&self, sets: u32) -> Vec<vk::DescriptorPoolSize> {
        let mut sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
        for binding in &self.bindings {
            let count = binding.descriptor_count * sets;
            match sizes.iter_mut().find(|size| size.ty == binding.descriptor_type) {
                Some(size) => size.descriptor_count += count,
                None => sizes.push(vk::DescriptorPoolSize {
                    ty: binding.descriptor_type,
                    descriptor_count: count,
                }),
            }
        }
        sizes
    }

    pub fn build(
        &self,
        flags: vk::DescriptorSetLayoutCreateFlags,
        device: &ash::Device,
    ) -> Result<vk::DescriptorSetLayout> {
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default()
            .bindings(&self.bindings)
            .flags(flags);

        Ok(unsafe {
            device.create_descriptor_set_layout(&layout_info, None)?
        })
    }
}

/// Tracks how many sets a fixed-size pool has handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolBudget {
    capacity: u32,
    used: u32,
}

impl PoolBudget {
    pub fn new(capacity: u32) -> Self {
        Self { capacity, used: 0 }
    }

    pub fn reserve(&mut self) -> Result<u32> {
        if self.used >= self.capacity {
            return Err(eyre!(
                "Descriptor pool exhausted: all {} sets are in use",
                self.capacity
            ));
        }
        let index = self.used;
        self.used += 1;
        Ok(index)
    }

    pub fn used(&self) -> u32 {
        self.used
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}

/// A raw `vk::DescriptorPool` with a hard set limit. Sets are never freed individually,
/// the whole pool goes away on drop.
pub struct DescriptorPool {
    pool: vk::DescriptorPool,
    budget: PoolBudget,
    device: Arc<ash::Device>,
}

impl DescriptorPool {
    pub fn new(
        device: Arc<ash::Device>,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<Self> {
        if max_sets == 0 {
            return Err(eyre!("Descriptor pool needs room for at least one set"));
        }

        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(pool_sizes);
        let pool = unsafe { device.create_descriptor_pool(&pool_info, None)? };

        Ok(Self {
            pool,
            budget: PoolBudget::new(max_sets),
            device,
        })
    }

    pub fn allocate(&mut self, layout: vk::DescriptorSetLayout) -> Result<vk::DescriptorSet> {
        self.budget.reserve()?;

        let layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.pool)
            .set_layouts(&layouts);
        let sets = unsafe {
            self.device
                .allocate_descriptor_sets(&alloc_info)
                .map_err(|e| match e {
                    vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL => {
                        eyre!("Descriptor pool exhausted: {e}")
                    }
                    e => eyre!("Failed to allocate descriptor set: {e}"),
                })?
        };
        sets.into_iter().next().ok_or_eyre("Driver returned no descriptor set")
    }

    pub fn budget(&self) -> PoolBudget {
        self.budget
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_descriptor_pool(self.pool, None);
        }
    }
}

/// Lets gpu-descriptor drive an ash device
pub struct DescriptorAshDevice(pub Arc<ash::Device>);

impl From<Arc<ash::Device>> for DescriptorAshDevice {
    fn from(device: Arc<ash::Device>) -> Self {
        Self(device)
    }
}

impl DescriptorDevice<vk::DescriptorSetLayout, vk::DescriptorPool, vk::DescriptorSet>
for DescriptorAshDevice
{
    unsafe fn create_descriptor_pool(
        &self,
        descriptor_count: &DescriptorTotalCount,
        max_sets: u32,
        flags: DescriptorPoolCreateFlags,
    ) -> Result<vk::DescriptorPool, CreatePoolError> {
        let counts = [
            (vk::DescriptorType::SAMPLER, descriptor_count.sampler),
            (vk::DescriptorType::COMBINED_IMAGE_SAMPLER, descriptor_count.combined_image_sampler),
            (vk::DescriptorType::SAMPLED_IMAGE, descriptor_count.sampled_image),
            (vk::DescriptorType::STORAGE_IMAGE, descriptor_count.storage_image),
            (vk::DescriptorType::UNIFORM_TEXEL_BUFFER, descriptor_count.uniform_texel_buffer),
            (vk::DescriptorType::STORAGE_TEXEL_BUFFER, descriptor_count.storage_texel_buffer),
            (vk::DescriptorType::UNIFORM_BUFFER, descriptor_count.uniform_buffer),
            (vk::DescriptorType::STORAGE_BUFFER, descriptor_count.storage_buffer),
            (vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC, descriptor_count.uniform_buffer_dynamic),
            (vk::DescriptorType::STORAGE_BUFFER_DYNAMIC, descriptor_count.storage_buffer_dynamic),
            (vk::DescriptorType::INPUT_ATTACHMENT, descriptor_count.input_attachment),
        ];
        let pool_sizes: smallvec::SmallVec<[vk::DescriptorPoolSize; 11]> = counts
            .iter()
            .filter(|(_, count)| *count != 0)
            .map(|&(ty, descriptor_count)| vk::DescriptorPoolSize { ty, descriptor_count })
            .collect();

        let mut ash_flags = vk::DescriptorPoolCreateFlags::empty();

        if flags.contains(DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET) {
            ash_flags |= vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET;
        }

        if flags.contains(DescriptorPoolCreateFlags::UPDATE_AFTER_BIND) {
            ash_flags |= vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND;
        }

        let result = unsafe {
            self.0.create_descriptor_pool(
                &vk::DescriptorPoolCreateInfo::default()
                    .max_sets(max_sets)
                    .pool_sizes(&pool_sizes)
                    .flags(ash_flags),
                None,
            )
        };

        match result {
            Ok(pool) => Ok(pool),
            Err(vk::Result::ERROR_FRAGMENTATION) => Err(CreatePoolError::Fragmentation),
            Err(vk::Result::ERROR_OUT_OF_HOST_MEMORY) => Err(CreatePoolError::OutOfHostMemory),
            Err(err) => {
                log::error!("Unexpected descriptor pool creation result: {err}");
                Err(CreatePoolError::OutOfDeviceMemory)
            }
        }
    }

    unsafe fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe {
            self.0.destroy_descriptor_pool(pool, None)
        }
    }

    unsafe fn alloc_descriptor_sets<'a>(
        &self,
        pool: &mut vk::DescriptorPool,
        layouts: impl ExactSizeIterator<Item = &'a vk::DescriptorSetLayout>,
        sets: &mut impl Extend<vk::DescriptorSet>,
    ) -> Result<(), DeviceAllocationError> {
        let set_layouts: smallvec::SmallVec<[_; 16]> = layouts.copied().collect();

        let result = unsafe {
            self.0.allocate_descriptor_sets(
                &vk::DescriptorSetAllocateInfo::default()
                    .set_layouts(&set_layouts)
                    .descriptor_pool(*pool),
            )
        };

        match result {
            Ok(allocated) => {
                sets.extend(allocated);
                Ok(())
            }
            Err(vk::Result::ERROR_OUT_OF_HOST_MEMORY) => Err(DeviceAllocationError::OutOfHostMemory),
            Err(vk::Result::ERROR_FRAGMENTED_POOL) => Err(DeviceAllocationError::FragmentedPool),
            Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY) => Err(DeviceAllocationError::OutOfPoolMemory),
            Err(err) => {
                log::error!("Unexpected descriptor set allocation result: {err}");
                Err(DeviceAllocationError::OutOfDeviceMemory)
            }
        }
    }

    unsafe fn dealloc_descriptor_sets<'a>(
        &self,
        pool: &mut vk::DescriptorPool,
        sets: impl Iterator<Item = vk::DescriptorSet>,
    ) {
        let sets: smallvec::SmallVec<[_; 16]> = sets.collect();
        if let Err(err) = unsafe { self.0.free_descriptor_sets(*pool, &sets) } {
            log::error!("Failed to free descriptor sets: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_rejects_allocation_past_capacity() {
        let mut budget = PoolBudget::new(3);
        assert_eq!(budget.reserve().unwrap(), 0);
        assert_eq!(budget.reserve().unwrap(), 1);
        assert_eq!(budget.reserve().unwrap(), 2);
        assert!(budget.reserve().is_err());
        // Failure does not consume anything
        assert_eq!(budget.used(), 3);
        assert!(budget.reserve().is_err());
    }

    #[test]
    fn empty_budget_never_allocates() {
        let mut budget = PoolBudget::new(0);
        assert!(budget.reserve().is_err());
    }

    #[test]
    fn layout_totals_and_pool_sizes() {
        let builder = DescriptorSetLayoutBuilder::new()
            .add_binding(0, vk::DescriptorType::UNIFORM_BUFFER, 1, vk::ShaderStageFlags::VERTEX)
            .add_binding(1, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 1, vk::ShaderStageFlags::FRAGMENT)
            .add_binding(2, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 2, vk::ShaderStageFlags::FRAGMENT);

        let total = builder.total_count();
        assert_eq!(total.uniform_buffer, 1);
        assert_eq!(total.combined_image_sampler, 3);
        assert_eq!(total.storage_buffer, 0);

        let sizes = builder.pool_sizes(4);
        assert_eq!(sizes.len(), 2);
        assert_eq!(sizes[0].ty, vk::DescriptorType::UNIFORM_BUFFER);
        assert_eq!(sizes[0].descriptor_count, 4);
        assert_eq!(sizes[1].ty, vk::DescriptorType::COMBINED_IMAGE_SAMPLER);
        assert_eq!(sizes[1].descriptor_count, 12);
    }
}
