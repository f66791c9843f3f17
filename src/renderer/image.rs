use crate::renderer::buffer::Buffer;
use crate::renderer::device::RenderDevice;
use crate::renderer::render_pass::has_stencil_component;
use ash::vk;
use color_eyre::Result;
use color_eyre::eyre::eyre;
use gpu_allocator::{
    MemoryLocation,
    vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator},
};
use std::sync::{Arc, Mutex};

/// Access masks and stages of one supported layout transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutTransition {
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

impl LayoutTransition {
    /// Only the two transitions a texture upload needs are supported.
    pub fn between(old: vk::ImageLayout, new: vk::ImageLayout) -> Result<Self> {
        match (old, new) {
            (vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL) => Ok(Self {
                src_access: vk::AccessFlags::empty(),
                dst_access: vk::AccessFlags::TRANSFER_WRITE,
                src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
                dst_stage: vk::PipelineStageFlags::TRANSFER,
            }),
            (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL) => Ok(Self {
                src_access: vk::AccessFlags::TRANSFER_WRITE,
                dst_access: vk::AccessFlags::SHADER_READ,
                src_stage: vk::PipelineStageFlags::TRANSFER,
                dst_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
            }),
            _ => Err(eyre!("Unsupported layout transition {:?} -> {:?}", old, new)),
        }
    }
}

pub struct ImageCreateInfo<'a> {
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub usage: vk::ImageUsageFlags,
    pub aspect: vk::ImageAspectFlags,
    pub name: &'a str,
}

pub struct Image {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub aspect: vk::ImageAspectFlags,

    allocation: Option<Allocation>, // GPU-only memory block
    memory_allocator: Arc<Mutex<Allocator>>,
    device: Arc<ash::Device>,
}

impl Image {
    // NOTE: The memory of the returned image is uninitialized. Unless it is a depth
    // attachment, fill it with `Image::upload()`
    pub fn new(dev: &RenderDevice, create_info: &ImageCreateInfo) -> Result<Self> {
        let device = dev.logical.clone();
        let image = {
            let info = vk::ImageCreateInfo::default()
                .format(create_info.format)
                .usage(create_info.usage)
                .extent(vk::Extent3D {
                    width: create_info.extent.width,
                    height: create_info.extent.height,
                    depth: 1,
                })
                .image_type(vk::ImageType::TYPE_2D)
                .mip_levels(1)
                .array_layers(1)
                .samples(vk::SampleCountFlags::TYPE_1)
                .tiling(vk::ImageTiling::OPTIMAL)
                .sharing_mode(vk::SharingMode::EXCLUSIVE)
                .initial_layout(vk::ImageLayout::UNDEFINED);
            unsafe { device.create_image(&info, None)? }
        };

        let reqs = unsafe { device.get_image_memory_requirements(image) };
        let allocation = dev
            .find_memory_type(reqs.memory_type_bits, vk::MemoryPropertyFlags::DEVICE_LOCAL)
            .and_then(|_| {
                dev.memory_allocator()
                    .lock()
                    .map_err(|e| eyre!(e.to_string()))?
                    .allocate(&AllocationCreateDesc {
                        name: create_info.name,
                        requirements: reqs,
                        location: MemoryLocation::GpuOnly,
                        linear: false,
                        allocation_scheme: AllocationScheme::DedicatedImage(image),
                    })
                    .map_err(Into::into)
            });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.destroy_image(image, None) };
                return Err(e);
            }
        };

        let mut this = Self {
            image,
            view: vk::ImageView::null(),
            format: create_info.format,
            extent: create_info.extent,
            aspect: create_info.aspect,

            allocation: Some(allocation),
            memory_allocator: dev.memory_allocator(),
            device,
        };

        // From here on Drop cleans up, even if the view fails
        unsafe {
            this.device.bind_image_memory(
                image,
                this.allocation.as_ref().map_or(vk::DeviceMemory::null(), |a| a.memory()),
                this.allocation.as_ref().map_or(0, |a| a.offset()),
            )?;
        }

        this.view = {
            let info = vk::ImageViewCreateInfo::default()
                .view_type(vk::ImageViewType::TYPE_2D)
                .image(image)
                .format(create_info.format)
                .subresource_range(vk::ImageSubresourceRange {
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                    aspect_mask: create_info.aspect,
                });
            unsafe { this.device.create_image_view(&info, None)? }
        };

        Ok(this)
    }

    /// Create a special type of image used for depth buffer
    pub fn new_depth(
        dev: &RenderDevice,
        extent: vk::Extent2D,
        format: vk::Format,
    ) -> Result<Self> {
        let mut aspect = vk::ImageAspectFlags::DEPTH;
        if has_stencil_component(format) {
            aspect |= vk::ImageAspectFlags::STENCIL;
        }
        Self::new(
            dev,
            &ImageCreateInfo {
                format,
                extent,
                usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
                aspect,
                name: "Depth image",
            },
        )
    }

    /// Create a shader-readable image from tightly packed RGBA8 pixels
    pub fn new_rgba8(
        dev: &RenderDevice,
        pixels: &[u8],
        extent: vk::Extent2D,
        format: vk::Format,
        name: &str,
    ) -> Result<Self> {
        let expected = extent.width as usize * extent.height as usize * 4;
        if pixels.len() != expected {
            return Err(eyre!(
                "Image '{}' expects {} bytes for {}x{} RGBA8, got {}",
                name,
                expected,
                extent.width,
                extent.height,
                pixels.len()
            ));
        }

        let image = Self::new(
            dev,
            &ImageCreateInfo {
                format,
                extent,
                usage: vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
                aspect: vk::ImageAspectFlags::COLOR,
                name,
            },
        )?;
        image.upload(dev, pixels)?;
        Ok(image)
    }

    /// Stage, transition to transfer destination, copy, then transition to shader-readable.
    /// Every step is its own blocking submission.
    pub fn upload(&self, dev: &RenderDevice, pixels: &[u8]) -> Result<()> {
        let mut staging = Buffer::new(
            dev,
            pixels.len() as u64,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
            "Image staging buffer",
        )?;
        staging.upload(pixels)?;

        self.transition_layout(
            dev,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )?;
        self.copy_from_buffer(dev, &staging)?;
        self.transition_layout(
            dev,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )?;

        Ok(())
    }

    pub fn transition_layout(
        &self,
        dev: &RenderDevice,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) -> Result<()> {
        let transition = LayoutTransition::between(old_layout, new_layout)?;

        let barrier = vk::ImageMemoryBarrier::default()
            .old_layout(old_layout)
            .new_layout(new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(self.image)
            .subresource_range(self.subresource_range())
            .src_access_mask(transition.src_access)
            .dst_access_mask(transition.dst_access);

        dev.immediate_submit(|cmd, device| {
            unsafe {
                device.cmd_pipeline_barrier(
                    cmd,
                    transition.src_stage,
                    transition.dst_stage,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[barrier],
                );
            }
            Ok(())
        })
    }

    fn copy_from_buffer(&self, dev: &RenderDevice, staging: &Buffer) -> Result<()> {
        let copy_region = vk::BufferImageCopy::default()
            .buffer_offset(0)
            .buffer_row_length(0)
            .buffer_image_height(0)
            .image_subresource(vk::ImageSubresourceLayers {
                aspect_mask: self.aspect,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            })
            .image_extent(vk::Extent3D {
                width: self.extent.width,
                height: self.extent.height,
                depth: 1,
            });

        dev.immediate_submit(|cmd, device| {
            unsafe {
                device.cmd_copy_buffer_to_image(
                    cmd,
                    staging.buffer,
                    self.image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[copy_region],
                );
            }
            Ok(())
        })
    }

    fn subresource_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: self.aspect,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        }
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        unsafe {
            if self.view != vk::ImageView::null() {
                self.device.destroy_image_view(self.view, None);
            }
            self.device.destroy_image(self.image, None);
        }
        if let Some(allocation) = self.allocation.take() {
            match self.memory_allocator.lock() {
                Ok(mut allocator) => {
                    if let Err(e) = allocator.free(allocation) {
                        log::error!("Failed to free image memory: {e}");
                    }
                }
                Err(e) => log::error!("Memory allocator poisoned: {e}"),
            }
        }
    }
}
