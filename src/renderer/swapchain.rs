use ash::prelude::VkResult;
use ash::vk;
use color_eyre::Result;
use color_eyre::eyre::OptionExt;
use std::sync::Arc;

/// Prefers BGRA8 sRGB, otherwise takes whatever the surface lists first.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Result<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|format| {
            format.format == vk::Format::B8G8R8A8_SRGB
                && format.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first())
        .copied()
        .ok_or_eyre("Surface reports no formats")
}

/// Mailbox when available (and vsync is not forced), FIFO otherwise. FIFO is always supported.
pub fn choose_present_mode(modes: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if !vsync && modes.contains(&vk::PresentModeKHR::MAILBOX) {
        vk::PresentModeKHR::MAILBOX
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// The surface dictates the extent unless it reports `u32::MAX`, then the window size is clamped.
pub fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    window_extent: vk::Extent2D,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }

    let min = capabilities.min_image_extent;
    let max = capabilities.max_image_extent;
    vk::Extent2D {
        width: window_extent.width.max(min.width).min(max.width.max(min.width)),
        height: window_extent.height.max(min.height).min(max.height.max(min.height)),
    }
}

/// One more than the minimum to avoid waiting on the driver, capped when the surface has a maximum.
pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let min = capabilities.min_image_count;
    let max = capabilities.max_image_count;
    let desired = min.saturating_add(1);
    if max > 0 && desired > max {
        max
    } else {
        desired
    }
}

/// Surface queries bundled together, so a swapchain can be planned without touching the GPU
#[derive(Debug, Clone)]
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SurfaceSupport {
    pub fn query(
        physical: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
        surface_loader: &ash::khr::surface::Instance,
    ) -> Result<Self> {
        unsafe {
            Ok(Self {
                capabilities: surface_loader.get_physical_device_surface_capabilities(physical, surface)?,
                formats: surface_loader.get_physical_device_surface_formats(physical, surface)?,
                present_modes: surface_loader.get_physical_device_surface_present_modes(physical, surface)?,
            })
        }
    }

    pub fn plan(&self, window_extent: vk::Extent2D, vsync: bool) -> Result<SwapchainPlan> {
        Ok(SwapchainPlan {
            surface_format: choose_surface_format(&self.formats)?,
            present_mode: choose_present_mode(&self.present_modes, vsync),
            extent: choose_extent(&self.capabilities, window_extent),
            image_count: choose_image_count(&self.capabilities),
            pre_transform: self.capabilities.current_transform,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainPlan {
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub image_count: u32,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
}

pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub present_mode: vk::PresentModeKHR,

    loader: ash::khr::swapchain::Device,
    device: Arc<ash::Device>,
}

impl Swapchain {
    pub fn new(
        plan: &SwapchainPlan,
        surface: vk::SurfaceKHR,
        old_swapchain: vk::SwapchainKHR,
        queue_family_indices: &[u32],
        loader: ash::khr::swapchain::Device,
        device: Arc<ash::Device>,
    ) -> Result<Self> {
        // Images shared between a separate graphics and present family need concurrent access
        let sharing_mode = if queue_family_indices.len() > 1 {
            vk::SharingMode::CONCURRENT
        } else {
            vk::SharingMode::EXCLUSIVE
        };

        let swapchain_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface)
            .min_image_count(plan.image_count)
            .image_format(plan.surface_format.format)
            .image_color_space(plan.surface_format.color_space)
            .image_extent(plan.extent)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(sharing_mode)
            .queue_family_indices(if sharing_mode == vk::SharingMode::CONCURRENT {
                queue_family_indices
            } else {
                &[]
            })
            .pre_transform(plan.pre_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(plan.present_mode)
            .clipped(true)
            // Retired here, destroyed by its owner once the new one exists
            .old_swapchain(old_swapchain)
            .image_array_layers(1);

        let swapchain = unsafe {
            loader.create_swapchain(&swapchain_info, None)?
        };

        let images = unsafe { loader.get_swapchain_images(swapchain)? };
        let image_views = match Self::create_image_views(&images, plan.surface_format.format, &device) {
            Ok(views) => views,
            Err(e) => {
                unsafe { loader.destroy_swapchain(swapchain, None) };
                return Err(e);
            }
        };

        log::info!(
            "Swapchain created: {}x{}, {} images, {:?}, {:?}",
            plan.extent.width,
            plan.extent.height,
            images.len(),
            plan.surface_format.format,
            plan.present_mode,
        );

        Ok(Self {
            swapchain,
            images,
            image_views,
            format: plan.surface_format.format,
            extent: plan.extent,
            present_mode: plan.present_mode,
            loader,
            device,
        })
    }

    pub fn image_count(&self) -> u32 {
        self.images.len() as u32
    }

    /// `Ok(None)` means the swapchain is out of date and has to be rebuilt.
    pub fn acquire_next_image(&self, signal: vk::Semaphore) -> Result<Option<u32>> {
        let result = unsafe {
            self.loader.acquire_next_image(self.swapchain, u64::MAX, signal, vk::Fence::null())
        };
        match result {
            // A suboptimal image is still presentable, the present call reports it again
            Ok((index, _suboptimal)) => Ok(Some(index)),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Returns `true` when the swapchain should be rebuilt after this present.
    pub fn present(&self, queue: vk::Queue, image_index: u32, wait: vk::Semaphore) -> Result<bool> {
        let wait_semaphores = [wait];
        let swapchains = [self.swapchain];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match unsafe { self.loader.queue_present(queue, &present_info) } {
            Ok(suboptimal) => Ok(suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    fn create_image_views(
        images: &[vk::Image],
        format: vk::Format,
        device: &ash::Device,
    ) -> Result<Vec<vk::ImageView>> {
        let views = images
            .iter()
            .map(|image| {
                let view_info = vk::ImageViewCreateInfo::default()
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(format)
                    .components(vk::ComponentMapping {
                        r: vk::ComponentSwizzle::IDENTITY,
                        g: vk::ComponentSwizzle::IDENTITY,
                        b: vk::ComponentSwizzle::IDENTITY,
                        a: vk::ComponentSwizzle::IDENTITY,
                    })
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        base_mip_level: 0,
                        level_count: 1,
                        base_array_layer: 0,
                        layer_count: 1,
                    })
                    .image(*image);
                unsafe {
                    device.create_image_view(&view_info, None)
                }
            })
            .collect::<VkResult<Vec<vk::ImageView>>>()?;
        Ok(views)
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        unsafe {
            for view in self.image_views.drain(..) {
                self.device.destroy_image_view(view, None);
            }
            self.loader.destroy_swapchain(self.swapchain, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// xorshift, enough to spread test inputs
    struct Rng(u64);

    impl Rng {
        fn next(&mut self) -> u64 {
            self.0 ^= self.0 << 13;
            self.0 ^= self.0 >> 7;
            self.0 ^= self.0 << 17;
            self.0
        }

        fn range(&mut self, lo: u32, hi: u32) -> u32 {
            lo + (self.next() % (hi - lo + 1) as u64) as u32
        }
    }

    fn caps(min: (u32, u32), max: (u32, u32), current: (u32, u32)) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_extent: vk::Extent2D { width: min.0, height: min.1 },
            max_image_extent: vk::Extent2D { width: max.0, height: max.1 },
            current_extent: vk::Extent2D { width: current.0, height: current.1 },
            ..Default::default()
        }
    }

    #[test]
    fn current_extent_wins_when_defined() {
        let c = caps((1, 1), (4096, 4096), (800, 600));
        let extent = choose_extent(&c, vk::Extent2D { width: 1280, height: 720 });
        assert_eq!((extent.width, extent.height), (800, 600));
    }

    #[test]
    fn window_extent_is_clamped_when_surface_is_flexible() {
        let c = caps((100, 100), (1920, 1080), (u32::MAX, u32::MAX));
        let extent = choose_extent(&c, vk::Extent2D { width: 4000, height: 10 });
        assert_eq!((extent.width, extent.height), (1920, 100));
    }

    #[test]
    fn clamped_extent_stays_within_random_bounds() {
        let mut rng = Rng(0x9E37_79B9_7F4A_7C15);
        for _ in 0..10_000 {
            let min_w = rng.range(0, 2000);
            let min_h = rng.range(0, 2000);
            let max_w = rng.range(min_w, 8192);
            let max_h = rng.range(min_h, 8192);
            let c = caps((min_w, min_h), (max_w, max_h), (u32::MAX, u32::MAX));
            let window = vk::Extent2D {
                width: rng.range(0, 10_000),
                height: rng.range(0, 10_000),
            };

            let extent = choose_extent(&c, window);
            assert!((min_w..=max_w).contains(&extent.width), "{:?} vs {:?}", extent, c);
            assert!((min_h..=max_h).contains(&extent.height), "{:?} vs {:?}", extent, c);
        }
    }

    #[test]
    fn image_count_respects_bounds() {
        let mut rng = Rng(42);
        for _ in 0..10_000 {
            let min = rng.range(1, 8);
            let max = if rng.next() % 3 == 0 { 0 } else { rng.range(min, 16) };
            let c = vk::SurfaceCapabilitiesKHR {
                min_image_count: min,
                max_image_count: max,
                ..Default::default()
            };

            let count = choose_image_count(&c);
            assert!(count >= min);
            if max > 0 {
                assert!(count <= max, "min {} max {} got {}", min, max, count);
            } else {
                assert_eq!(count, min + 1);
            }
        }
    }

    #[test]
    fn image_count_examples() {
        let c = |min, max| vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            ..Default::default()
        };
        assert_eq!(choose_image_count(&c(2, 0)), 3);
        assert_eq!(choose_image_count(&c(2, 8)), 3);
        assert_eq!(choose_image_count(&c(3, 3)), 3);
    }

    #[test]
    fn format_prefers_bgra_srgb() {
        let unorm = vk::SurfaceFormatKHR {
            format: vk::Format::R8G8B8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let srgb = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_SRGB,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        assert_eq!(choose_surface_format(&[unorm, srgb]).unwrap(), srgb);
        assert_eq!(choose_surface_format(&[unorm]).unwrap(), unorm);
        assert!(choose_surface_format(&[]).is_err());
    }

    #[test]
    fn present_mode_prefers_mailbox_unless_vsync() {
        let modes = [vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::FIFO];
        assert_eq!(choose_present_mode(&modes, false), vk::PresentModeKHR::MAILBOX);
        assert_eq!(choose_present_mode(&modes, true), vk::PresentModeKHR::FIFO);
        assert_eq!(choose_present_mode(&[vk::PresentModeKHR::FIFO], false), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn plan_combines_choices() {
        let support = SurfaceSupport {
            capabilities: vk::SurfaceCapabilitiesKHR {
                min_image_count: 2,
                max_image_count: 3,
                current_extent: vk::Extent2D { width: u32::MAX, height: u32::MAX },
                min_image_extent: vk::Extent2D { width: 1, height: 1 },
                max_image_extent: vk::Extent2D { width: 1024, height: 1024 },
                current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
                ..Default::default()
            },
            formats: vec![vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            }],
            present_modes: vec![vk::PresentModeKHR::FIFO],
        };

        let plan = support.plan(vk::Extent2D { width: 1280, height: 720 }, false).unwrap();
        assert_eq!(plan.extent, vk::Extent2D { width: 1024, height: 720 });
        assert_eq!(plan.image_count, 3);
        assert_eq!(plan.present_mode, vk::PresentModeKHR::FIFO);
    }
}
