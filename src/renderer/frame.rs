use ash::vk;
use color_eyre::Result;
use std::sync::Arc;

/// What the scene needs to know after the swapchain changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceInfo {
    pub extent: vk::Extent2D,
    pub image_count: u32,
}

impl SurfaceInfo {
    pub fn aspect_ratio(&self) -> f32 {
        self.extent.width as f32 / self.extent.height.max(1) as f32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Image(u32),
    OutOfDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Presented,
    /// The swapchain was rebuilt. The image was presented first unless acquire failed.
    Rebuilt { presented: bool },
    /// Nothing to render into, e.g. the window is minimised
    Skipped,
}

/// The caller of the frame loop; everything it records lands inside the render pass
pub trait Scene {
    /// CPU-side simulation, runs before the GPU work of the frame
    fn update(&mut self, dt: f32) -> Result<()>;

    /// Record draw commands. The uniform buffers of `image_index` are free to write.
    fn draw(&mut self, cmd: vk::CommandBuffer, image_index: u32) -> Result<()>;

    /// Called after every swapchain rebuild, with the GPU idle
    fn on_resize(&mut self, surface: &SurfaceInfo) -> Result<()>;
}

/// The GPU-facing half of a frame. The real implementation talks to Vulkan;
/// tests substitute a simulated device.
pub trait FrameBackend {
    /// Blocks until the single in-flight fence is signalled
    fn wait_for_in_flight(&mut self) -> Result<()>;

    fn acquire_next_image(&mut self) -> Result<AcquireOutcome>;

    fn reset_in_flight(&mut self) -> Result<()>;

    /// Resets the frame command buffer and records one render pass into it, with `draw` inside
    fn record(
        &mut self,
        image_index: u32,
        draw: &mut dyn FnMut(vk::CommandBuffer, u32) -> Result<()>,
    ) -> Result<()>;

    /// Submits the recorded buffer; signals the in-flight fence on completion
    fn submit(&mut self) -> Result<()>;

    /// Returns `true` when the swapchain has to be rebuilt
    fn present(&mut self, image_index: u32) -> Result<bool>;

    /// Current size of the window's drawable area
    fn framebuffer_extent(&self) -> vk::Extent2D;

    /// Waits for the device to go idle, then replaces the swapchain and everything sized after it.
    /// `None` means the surface currently has no area and nothing was rebuilt.
    fn rebuild_swapchain(&mut self) -> Result<Option<SurfaceInfo>>;
}

/// Runs the per-frame state machine over a backend.
/// Only one frame is ever in flight.
#[derive(Debug, Default)]
pub struct FrameDriver {
    resize_requested: bool,
    frame_number: u64,
}

impl FrameDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Repeated requests before the next frame collapse into one rebuild
    pub fn request_resize(&mut self) {
        self.resize_requested = true;
    }

    pub fn resize_requested(&self) -> bool {
        self.resize_requested
    }

    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    pub fn draw_frame(
        &mut self,
        backend: &mut dyn FrameBackend,
        scene: &mut dyn Scene,
        dt: f32,
    ) -> Result<FrameOutcome> {
        let extent = backend.framebuffer_extent();
        if extent.width == 0 || extent.height == 0 {
            // Keep any pending resize until there is something to resize to
            return Ok(FrameOutcome::Skipped);
        }

        scene.update(dt)?;

        backend.wait_for_in_flight()?;

        let image_index = match backend.acquire_next_image()? {
            AcquireOutcome::Image(index) => index,
            AcquireOutcome::OutOfDate => {
                // The fence stays signalled, so the next wait does not block forever
                return Ok(if self.rebuild(backend, scene)? {
                    FrameOutcome::Rebuilt { presented: false }
                } else {
                    FrameOutcome::Skipped
                });
            }
        };

        backend.reset_in_flight()?;
        backend.record(image_index, &mut |cmd: vk::CommandBuffer, index: u32| scene.draw(cmd, index))?;
        backend.submit()?;
        let needs_rebuild = backend.present(image_index)?;
        self.frame_number += 1;

        if (needs_rebuild || self.resize_requested) && self.rebuild(backend, scene)? {
            return Ok(FrameOutcome::Rebuilt { presented: true });
        }
        Ok(FrameOutcome::Presented)
    }

    fn rebuild(&mut self, backend: &mut dyn FrameBackend, scene: &mut dyn Scene) -> Result<bool> {
        match backend.rebuild_swapchain()? {
            Some(surface) => {
                self.resize_requested = false;
                log::debug!(
                    "Swapchain rebuilt at frame {}: {}x{}, {} images",
                    self.frame_number,
                    surface.extent.width,
                    surface.extent.height,
                    surface.image_count
                );
                scene.on_resize(&surface)?;
                Ok(true)
            }
            None => {
                // Try again once the window has an area
                self.resize_requested = true;
                Ok(false)
            }
        }
    }
}

/// The semaphores and fence guarding the one frame in flight
pub struct FrameSync {
    /// Signalled by acquire, waited on before colour output
    pub image_available: vk::Semaphore,
    /// Signalled by the submit, waited on by present
    pub render_finished: vk::Semaphore,
    /// Signalled when the GPU is done with the frame's command buffer and uniforms
    pub in_flight: vk::Fence,
    device: Arc<ash::Device>,
}

impl FrameSync {
    pub fn new(device: Arc<ash::Device>) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::default();
        // Created signalled so the very first wait returns immediately
        let fence_info = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);

        unsafe {
            let image_available = device.create_semaphore(&semaphore_info, None)?;
            let render_finished = match device.create_semaphore(&semaphore_info, None) {
                Ok(semaphore) => semaphore,
                Err(e) => {
                    device.destroy_semaphore(image_available, None);
                    return Err(e.into());
                }
            };
            let in_flight = match device.create_fence(&fence_info, None) {
                Ok(fence) => fence,
                Err(e) => {
                    device.destroy_semaphore(image_available, None);
                    device.destroy_semaphore(render_finished, None);
                    return Err(e.into());
                }
            };

            Ok(Self {
                image_available,
                render_finished,
                in_flight,
                device,
            })
        }
    }

    pub fn wait(&self) -> Result<()> {
        unsafe { self.device.wait_for_fences(&[self.in_flight], true, u64::MAX)? };
        Ok(())
    }

    pub fn reset(&self) -> Result<()> {
        unsafe { self.device.reset_fences(&[self.in_flight])? };
        Ok(())
    }
}

impl Drop for FrameSync {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_fence(self.in_flight, None);
            self.device.destroy_semaphore(self.render_finished, None);
            self.device.destroy_semaphore(self.image_available, None);
        }
    }
}
