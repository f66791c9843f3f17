use crate::renderer::command::{CommandBufferId, CommandPool};
use crate::renderer::device::RenderDevice;
use crate::renderer::frame::{AcquireOutcome, FrameBackend, FrameSync, SurfaceInfo};
use crate::renderer::image::Image;
use crate::renderer::instance::RenderInstance;
use crate::renderer::render_pass::{DEPTH_FORMAT_CANDIDATES, Framebuffers, RenderPass};
use crate::renderer::swapchain::{SurfaceSupport, Swapchain, SwapchainPlan};
use ash::vk;
use color_eyre::Result;
use color_eyre::eyre::{OptionExt, eyre};
use std::sync::Arc;
use winit::window::Window;

/// The window surface. Has to outlive every swapchain created on it.
pub struct Surface {
    pub handle: vk::SurfaceKHR,
    pub loader: ash::khr::surface::Instance,
}

impl Surface {
    pub fn new(instance: &RenderInstance, window: &Window) -> Result<Self> {
        let (handle, loader) = instance.create_surface(window)?;
        Ok(Self { handle, loader })
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        unsafe {
            self.loader.destroy_surface(self.handle, None);
        }
    }
}

pub fn window_extent(window: &Window) -> vk::Extent2D {
    let size = window.inner_size();
    vk::Extent2D {
        width: size.width,
        height: size.height,
    }
}

/// Creates the resources sized after the swapchain, in the order a rebuild needs them
pub trait TargetFactory {
    type Swapchain;
    type Depth;
    type Framebuffers;

    /// `old` is retired by the new swapchain and destroyed once it is replaced
    fn create_swapchain(
        &mut self,
        plan: &SwapchainPlan,
        old: Option<&Self::Swapchain>,
    ) -> Result<Self::Swapchain>;

    fn create_depth(&mut self, swapchain: &Self::Swapchain) -> Result<Self::Depth>;

    fn create_framebuffers(
        &mut self,
        swapchain: &Self::Swapchain,
        depth: &Self::Depth,
    ) -> Result<Self::Framebuffers>;
}

/// Swapchain, depth buffer and framebuffers, always replaced together.
/// Fields drop in declaration order, so the framebuffers go before the views they point at.
pub struct SizedTargets<S, D, B> {
    pub framebuffers: B,
    pub depth: D,
    pub swapchain: S,
}

impl<S, D, B> SizedTargets<S, D, B> {
    pub fn build<F>(factory: &mut F, plan: &SwapchainPlan, old: Option<&S>) -> Result<Self>
    where
        F: TargetFactory<Swapchain = S, Depth = D, Framebuffers = B>,
    {
        let swapchain = factory.create_swapchain(plan, old)?;
        let depth = factory.create_depth(&swapchain)?;
        let framebuffers = factory.create_framebuffers(&swapchain, &depth)?;
        Ok(Self {
            framebuffers,
            depth,
            swapchain,
        })
    }

    /// The replacement is complete before anything current is released.
    /// On error the current targets are left in place.
    pub fn rebuild<F>(&mut self, factory: &mut F, plan: &SwapchainPlan) -> Result<()>
    where
        F: TargetFactory<Swapchain = S, Depth = D, Framebuffers = B>,
    {
        let fresh = Self::build(factory, plan, Some(&self.swapchain))?;
        *self = fresh;
        Ok(())
    }
}

/// Creates real targets on the device
struct GpuTargets<'a> {
    dev: &'a RenderDevice,
    surface: vk::SurfaceKHR,
    loader: &'a ash::khr::swapchain::Device,
    render_pass: &'a RenderPass,
}

impl TargetFactory for GpuTargets<'_> {
    type Swapchain = Swapchain;
    type Depth = Image;
    type Framebuffers = Framebuffers;

    fn create_swapchain(&mut self, plan: &SwapchainPlan, old: Option<&Swapchain>) -> Result<Swapchain> {
        let mut families = vec![self.dev.graphics_queue.family_index];
        if self.dev.present_queue.family_index != self.dev.graphics_queue.family_index {
            families.push(self.dev.present_queue.family_index);
        }
        Swapchain::new(
            plan,
            self.surface,
            old.map_or(vk::SwapchainKHR::null(), |old| old.swapchain),
            &families,
            self.loader.clone(),
            self.dev.logical.clone(),
        )
    }

    fn create_depth(&mut self, swapchain: &Swapchain) -> Result<Image> {
        Image::new_depth(self.dev, swapchain.extent, self.render_pass.depth_format)
    }

    fn create_framebuffers(&mut self, swapchain: &Swapchain, depth: &Image) -> Result<Framebuffers> {
        self.render_pass
            .create_framebuffers(&swapchain.image_views, depth.view, swapchain.extent)
    }
}

/// Presentation target of the renderer: swapchain, depth buffer, render pass, framebuffers
/// and the single set of per-frame command buffer and sync objects.
pub struct Presenter {
    window: Arc<Window>,
    vsync: bool,

    sync: FrameSync,
    commands: CommandPool,
    frame_cmd: CommandBufferId,

    targets: SizedTargets<Swapchain, Image, Framebuffers>,
    render_pass: RenderPass,
    swapchain_loader: ash::khr::swapchain::Device,
}

impl Presenter {
    pub fn new(
        window: Arc<Window>,
        vsync: bool,
        instance: &RenderInstance,
        dev: &RenderDevice,
        surface: &Surface,
    ) -> Result<Self> {
        let swapchain_loader = ash::khr::swapchain::Device::new(&instance.instance, &dev.logical);

        let plan = SurfaceSupport::query(dev.physical, surface.handle, &surface.loader)?
            .plan(window_extent(&window), vsync)?;

        let depth_format = dev.find_supported_format(
            &instance.instance,
            &DEPTH_FORMAT_CANDIDATES,
            vk::ImageTiling::OPTIMAL,
            vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
        )?;
        log::debug!("Depth format: {:?}", depth_format);

        let render_pass = RenderPass::new(dev.logical.clone(), plan.surface_format.format, depth_format)?;
        let targets = SizedTargets::build(
            &mut GpuTargets {
                dev,
                surface: surface.handle,
                loader: &swapchain_loader,
                render_pass: &render_pass,
            },
            &plan,
            None,
        )?;

        let mut commands = CommandPool::new(
            dev.logical.clone(),
            dev.graphics_queue.family_index,
            vk::CommandPoolCreateFlags::empty(),
        )?;
        let frame_cmd = commands.allocate()?;
        let sync = FrameSync::new(dev.logical.clone())?;

        Ok(Self {
            window,
            vsync,
            sync,
            commands,
            frame_cmd,
            targets,
            render_pass,
            swapchain_loader,
        })
    }

    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass.render_pass
    }

    pub fn surface_info(&self) -> SurfaceInfo {
        SurfaceInfo {
            extent: self.targets.swapchain.extent,
            image_count: self.targets.swapchain.image_count(),
        }
    }

    /// Must only run with the device idle
    fn rebuild(
        &mut self,
        dev: &RenderDevice,
        surface: &Surface,
    ) -> Result<Option<SurfaceInfo>> {
        let plan = SurfaceSupport::query(dev.physical, surface.handle, &surface.loader)?
            .plan(window_extent(&self.window), self.vsync)?;
        if plan.extent.width == 0 || plan.extent.height == 0 {
            log::debug!("Surface has no area, postponing swapchain rebuild");
            return Ok(None);
        }
        if plan.surface_format.format != self.render_pass.color_format {
            return Err(eyre!(
                "Surface format changed from {:?} to {:?}",
                self.render_pass.color_format,
                plan.surface_format.format
            ));
        }

        let mut factory = GpuTargets {
            dev,
            surface: surface.handle,
            loader: &self.swapchain_loader,
            render_pass: &self.render_pass,
        };
        self.targets.rebuild(&mut factory, &plan)?;

        Ok(Some(self.surface_info()))
    }
}

/// One frame's view of the presenter plus the device it submits to
pub struct GpuFrame<'a> {
    pub presenter: &'a mut Presenter,
    pub dev: &'a RenderDevice,
    pub surface: &'a Surface,
}

impl FrameBackend for GpuFrame<'_> {
    fn wait_for_in_flight(&mut self) -> Result<()> {
        self.presenter.sync.wait()
    }

    fn acquire_next_image(&mut self) -> Result<AcquireOutcome> {
        let p = &self.presenter;
        Ok(match p.targets.swapchain.acquire_next_image(p.sync.image_available)? {
            Some(index) => AcquireOutcome::Image(index),
            None => AcquireOutcome::OutOfDate,
        })
    }

    fn reset_in_flight(&mut self) -> Result<()> {
        self.presenter.sync.reset()
    }

    fn record(
        &mut self,
        image_index: u32,
        draw: &mut dyn FnMut(vk::CommandBuffer, u32) -> Result<()>,
    ) -> Result<()> {
        let p = &mut *self.presenter;
        let framebuffer = p
            .targets
            .framebuffers
            .get(image_index)
            .ok_or_eyre(format!("No framebuffer for swapchain image {}", image_index))?;

        p.commands.reset(p.frame_cmd)?;
        let cmd = p.commands.begin(p.frame_cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;

        p.render_pass.begin(cmd, framebuffer, p.targets.swapchain.extent);
        draw(cmd, image_index)?;
        p.render_pass.end(cmd);

        p.commands.end(p.frame_cmd)
    }

    fn submit(&mut self) -> Result<()> {
        let p = &mut *self.presenter;
        let command_buffers = [p.commands.prepare_submit(p.frame_cmd)?];
        let wait_semaphores = [p.sync.image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal_semaphores = [p.sync.render_finished];

        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.dev.logical.queue_submit(
                self.dev.graphics_queue.handle,
                &[submit_info],
                p.sync.in_flight,
            )?;
        }
        Ok(())
    }

    fn present(&mut self, image_index: u32) -> Result<bool> {
        let p = &self.presenter;
        p.targets.swapchain.present(self.dev.present_queue.handle, image_index, p.sync.render_finished)
    }

    fn framebuffer_extent(&self) -> vk::Extent2D {
        window_extent(&self.presenter.window)
    }

    fn rebuild_swapchain(&mut self) -> Result<Option<SurfaceInfo>> {
        self.dev.wait_idle()?;
        self.presenter.rebuild(self.dev, self.surface)
    }
}


#[cfg(test)]
mod tests {
    use super::counting::*;
    use super::*;

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    #[test]
    fn rebuild_replaces_every_target_once() {
        let mut factory = CountingFactory::default();
        let mut targets = CountedTargets::build(&mut factory, &plan(extent(800, 600), 3), None).unwrap();

        for i in 0..20u32 {
            let size = extent(640 + i * 16, 480 + i * 8);
            targets.rebuild(&mut factory, &plan(size, 3)).unwrap();

            let live = factory.live.borrow();
            assert_eq!(live.swapchains, 1);
            assert_eq!(live.depth_images, 1);
            assert_eq!(live.framebuffers, 3);
            assert_eq!(targets.depth.extent, size);
        }

        // Each swapchain retired the one before it
        let live = factory.live.borrow();
        let retired = &live.retired;
        assert_eq!(retired[0], None);
        for (i, old) in retired.iter().enumerate().skip(1) {
            assert_eq!(*old, Some(i as u64));
        }
    }

    #[test]
    fn image_count_change_resizes_framebuffers() {
        let mut factory = CountingFactory::default();
        let mut targets = CountedTargets::build(&mut factory, &plan(extent(800, 600), 2), None).unwrap();
        targets.rebuild(&mut factory, &plan(extent(800, 600), 4)).unwrap();

        assert_eq!(factory.live.borrow().framebuffers, 4);
        assert_eq!(targets.framebuffers.count, 4);
    }

    #[test]
    fn failed_rebuild_keeps_current_targets() {
        let mut factory = CountingFactory::default();
        let mut targets = CountedTargets::build(&mut factory, &plan(extent(800, 600), 3), None).unwrap();
        let before = targets.swapchain.id;

        factory.fail_depth = true;
        assert!(targets.rebuild(&mut factory, &plan(extent(1024, 768), 3)).is_err());
        factory.fail_depth = false;
        factory.fail_framebuffers = true;
        assert!(targets.rebuild(&mut factory, &plan(extent(1024, 768), 3)).is_err());

        assert_eq!(targets.swapchain.id, before);
        assert_eq!(targets.depth.extent, extent(800, 600));
        let live = factory.live.borrow();
        assert_eq!(live.swapchains, 1);
        assert_eq!(live.depth_images, 1);
        assert_eq!(live.framebuffers, 3);
    }

    #[test]
    fn dropping_targets_releases_everything() {
        let mut factory = CountingFactory::default();
        let targets = CountedTargets::build(&mut factory, &plan(extent(800, 600), 3), None).unwrap();
        drop(targets);

        let live = factory.live.borrow();
        assert_eq!((live.swapchains, live.depth_images, live.framebuffers), (0, 0, 0));
    }
}
