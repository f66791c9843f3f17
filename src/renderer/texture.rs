use crate::renderer::device::RenderDevice;
use crate::renderer::image::Image;
use ash::vk;
use color_eyre::Result;
use color_eyre::eyre::eyre;
use image::{Rgba, RgbaImage};
use std::path::Path;
use std::sync::Arc;

/// Sampled image with its own sampler, ready to be bound as a combined image sampler
pub struct Texture {
    pub image: Image,
    pub sampler: vk::Sampler,
    device: Arc<ash::Device>,
}

impl Texture {
    pub fn from_file(dev: &RenderDevice, path: &Path, format: vk::Format) -> Result<Self> {
        let decoded = image::open(path)
            .map_err(|e| eyre!("Failed to load texture {}: {}", path.display(), e))?;
        log::debug!("Loaded texture {} ({}x{})", path.display(), decoded.width(), decoded.height());
        Self::from_rgba8(dev, &decoded.to_rgba8(), format, &path.to_string_lossy())
    }

    pub fn from_rgba8(
        dev: &RenderDevice,
        pixels: &RgbaImage,
        format: vk::Format,
        name: &str,
    ) -> Result<Self> {
        let extent = vk::Extent2D {
            width: pixels.width(),
            height: pixels.height(),
        };
        let image = Image::new_rgba8(dev, pixels.as_raw(), extent, format, name)?;
        let sampler = create_sampler(&dev.logical, dev.max_sampler_anisotropy())?;

        Ok(Self {
            image,
            sampler,
            device: dev.logical.clone(),
        })
    }

    /// Sampler, view and the layout the image is left in after upload
    pub fn descriptor_image_info(&self) -> vk::DescriptorImageInfo {
        vk::DescriptorImageInfo {
            sampler: self.sampler,
            image_view: self.image.view,
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_sampler(self.sampler, None);
        }
    }
}

fn create_sampler(device: &ash::Device, max_anisotropy: f32) -> Result<vk::Sampler> {
    let sampler_info = vk::SamplerCreateInfo::default()
        .mag_filter(vk::Filter::LINEAR)
        .min_filter(vk::Filter::LINEAR)
        .address_mode_u(vk::SamplerAddressMode::REPEAT)
        .address_mode_v(vk::SamplerAddressMode::REPEAT)
        .address_mode_w(vk::SamplerAddressMode::REPEAT)
        .anisotropy_enable(true)
        .max_anisotropy(max_anisotropy)
        .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
        .unnormalized_coordinates(false)
        .compare_enable(false)
        .compare_op(vk::CompareOp::ALWAYS)
        .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
        .mip_lod_bias(0.0)
        .min_lod(0.0)
        .max_lod(0.0);

    Ok(unsafe { device.create_sampler(&sampler_info, None)? })
}

// Stand-ins for missing texture files

pub fn checker(size: u32, cells: u32, a: [u8; 3], b: [u8; 3]) -> RgbaImage {
    let cell = (size / cells.max(1)).max(1);
    RgbaImage::from_fn(size, size, |x, y| {
        let [r, g, bl] = if ((x / cell) + (y / cell)) % 2 == 0 { a } else { b };
        Rgba([r, g, bl, 255])
    })
}

/// Tangent-space normal pointing straight out of the surface
pub fn flat_normal(size: u32) -> RgbaImage {
    RgbaImage::from_pixel(size, size, Rgba([128, 128, 255, 255]))
}

pub fn constant(size: u32, value: u8) -> RgbaImage {
    RgbaImage::from_pixel(size, size, Rgba([value, value, value, 255]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checker_alternates_cells() {
        let img = checker(8, 2, [255, 0, 0], [0, 0, 255]);
        assert_eq!(img.dimensions(), (8, 8));
        assert_eq!(img.get_pixel(0, 0).0, [255, 0, 0, 255]);
        assert_eq!(img.get_pixel(4, 0).0, [0, 0, 255, 255]);
        assert_eq!(img.get_pixel(4, 4).0, [255, 0, 0, 255]);
        assert_eq!(img.as_raw().len(), 8 * 8 * 4);
    }

    #[test]
    fn flat_normal_decodes_to_plus_z() {
        let img = flat_normal(4);
        for px in img.pixels() {
            let n = px.0.map(|c| c as f32 / 255.0 * 2.0 - 1.0);
            assert!(n[0].abs() < 0.01 && n[1].abs() < 0.01);
            assert!((n[2] - 1.0).abs() < 0.01);
        }
    }

    #[test]
    fn checker_with_more_cells_than_pixels() {
        let img = checker(2, 16, [1, 1, 1], [2, 2, 2]);
        assert_eq!(img.get_pixel(0, 0).0, [1, 1, 1, 255]);
        assert_eq!(img.get_pixel(1, 0).0, [2, 2, 2, 255]);
    }
}
