use crate::renderer::descriptor::{DescriptorPool, DescriptorSetLayoutBuilder, PoolBudget};
use crate::renderer::registry::{Handle, Registry};
use crate::renderer::texture::Texture;
use ash::vk;
use color_eyre::Result;
use color_eyre::eyre::{OptionExt, eyre};
use std::sync::Arc;

/// Texture slots in binding order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MaterialSlot {
    Albedo,
    Normal,
    Metallic,
    Roughness,
    AmbientOcclusion,
}

impl MaterialSlot {
    pub const COUNT: usize = 5;
    pub const ALL: [MaterialSlot; Self::COUNT] = [
        MaterialSlot::Albedo,
        MaterialSlot::Normal,
        MaterialSlot::Metallic,
        MaterialSlot::Roughness,
        MaterialSlot::AmbientOcclusion,
    ];

    pub fn binding(self) -> u32 {
        self as u32
    }
}

/// One write per slot, bindings 0..5 in slot order, all in a single batch.
pub fn material_writes<'a>(
    set: vk::DescriptorSet,
    image_infos: &'a [[vk::DescriptorImageInfo; 1]; MaterialSlot::COUNT],
) -> [vk::WriteDescriptorSet<'a>; MaterialSlot::COUNT] {
    MaterialSlot::ALL.map(|slot| {
        vk::WriteDescriptorSet::default()
            .dst_set(set)
            .dst_binding(slot.binding())
            .dst_array_element(0)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .image_info(&image_infos[slot as usize])
    })
}

/// Requires exactly one texture per slot; anything else is rejected instead of padded.
pub fn slot_textures<T: Copy>(textures: &[T]) -> Result<[T; MaterialSlot::COUNT]> {
    <[T; MaterialSlot::COUNT]>::try_from(textures).map_err(|_| {
        eyre!(
            "A material takes exactly {} textures (albedo, normal, metallic, roughness, ao), got {}",
            MaterialSlot::COUNT,
            textures.len()
        )
    })
}

fn layout_builder() -> DescriptorSetLayoutBuilder<'static> {
    MaterialSlot::ALL
        .iter()
        .fold(DescriptorSetLayoutBuilder::new(), |builder, slot| {
            builder.add_binding(
                slot.binding(),
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                1,
                vk::ShaderStageFlags::FRAGMENT,
            )
        })
}

/// Textures bound together as one descriptor set. The textures stay owned by their registry.
pub struct Material {
    pub textures: [Handle<Texture>; MaterialSlot::COUNT],
    pub set: vk::DescriptorSet,
}

/// Shared layout plus the single fixed-size pool every material set comes from.
/// Sets are released all at once when the pool is dropped.
pub struct MaterialPool {
    layout: vk::DescriptorSetLayout,
    pool: DescriptorPool,
    device: Arc<ash::Device>,
}

impl MaterialPool {
    pub fn new(device: Arc<ash::Device>, max_materials: u32) -> Result<Self> {
        let builder = layout_builder();
        let layout = builder.build(vk::DescriptorSetLayoutCreateFlags::empty(), &device)?;
        let pool = match DescriptorPool::new(device.clone(), max_materials, &builder.pool_sizes(max_materials)) {
            Ok(pool) => pool,
            Err(e) => {
                unsafe { device.destroy_descriptor_set_layout(layout, None) };
                return Err(e);
            }
        };

        log::debug!("Material pool ready for {} materials", max_materials);
        Ok(Self { layout, pool, device })
    }

    pub fn layout(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    pub fn budget(&self) -> PoolBudget {
        self.pool.budget()
    }

    /// Allocates the set and writes all five slots. Running out of sets is an error.
    pub fn create_material(
        &mut self,
        textures: &Registry<Texture>,
        slots: &[Handle<Texture>],
    ) -> Result<Material> {
        let handles = slot_textures(slots)?;

        let mut image_infos = [[vk::DescriptorImageInfo::default()]; MaterialSlot::COUNT];
        for (info, (slot, handle)) in image_infos.iter_mut().zip(MaterialSlot::ALL.iter().zip(handles)) {
            let texture = textures
                .get(handle)
                .ok_or_eyre(format!("{:?} texture {:?} is not loaded", slot, handle))?;
            info[0] = texture.descriptor_image_info();
        }

        let set = self.pool.allocate(self.layout)?;
        let writes = material_writes(set, &image_infos);
        unsafe { self.device.update_descriptor_sets(&writes, &[]) };

        Ok(Material { textures: handles, set })
    }
}

impl Drop for MaterialPool {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_descriptor_set_layout(self.layout, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle as _;

    fn infos() -> [[vk::DescriptorImageInfo; 1]; MaterialSlot::COUNT] {
        std::array::from_fn(|i| {
            [vk::DescriptorImageInfo {
                sampler: vk::Sampler::from_raw(100 + i as u64),
                image_view: vk::ImageView::from_raw(200 + i as u64),
                image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            }]
        })
    }

    #[test]
    fn writes_cover_bindings_in_slot_order() {
        let set = vk::DescriptorSet::from_raw(7);
        let infos = infos();
        let writes = material_writes(set, &infos);

        for (i, write) in writes.iter().enumerate() {
            assert_eq!(write.dst_set, set);
            assert_eq!(write.dst_binding, i as u32);
            assert_eq!(write.descriptor_count, 1);
            assert_eq!(write.descriptor_type, vk::DescriptorType::COMBINED_IMAGE_SAMPLER);
            let info = unsafe { &*write.p_image_info };
            assert_eq!(info.image_view, vk::ImageView::from_raw(200 + i as u64));
            assert_eq!(info.sampler, vk::Sampler::from_raw(100 + i as u64));
        }
        assert_eq!(MaterialSlot::AmbientOcclusion.binding(), 4);
    }

    #[test]
    fn fewer_than_five_textures_is_an_error() {
        for n in 0..MaterialSlot::COUNT {
            let handles = vec![0u32; n];
            assert!(slot_textures(&handles).is_err(), "{} textures accepted", n);
        }
        assert!(slot_textures(&[0u32; 6]).is_err());
        assert_eq!(slot_textures(&[1u32, 2, 3, 4, 5]).unwrap(), [1, 2, 3, 4, 5]);
    }

    #[test]
    fn layout_declares_five_fragment_samplers() {
        let builder = layout_builder();
        assert_eq!(builder.bindings().len(), 5);
        for (i, binding) in builder.bindings().iter().enumerate() {
            assert_eq!(binding.binding, i as u32);
            assert_eq!(binding.descriptor_type, vk::DescriptorType::COMBINED_IMAGE_SAMPLER);
            assert_eq!(binding.stage_flags, vk::ShaderStageFlags::FRAGMENT);
        }
        let sizes = builder.pool_sizes(7);
        assert_eq!(sizes.len(), 1);
        assert_eq!(sizes[0].descriptor_count, 35);
    }
}
