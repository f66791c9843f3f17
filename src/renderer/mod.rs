pub mod buffer;
pub mod camera;
pub mod command;
pub mod config;
pub mod descriptor;
pub mod device;
pub mod frame;
pub mod image;
pub mod instance;
pub mod material;
pub mod mesh;
pub mod pipeline;
pub mod queue;
pub mod registry;
pub mod render_pass;
pub mod shader;
pub mod shader_data;
pub mod swapchain;
pub mod target;
pub mod texture;
pub mod vertex;

use crate::renderer::config::RenderConfig;
use crate::renderer::device::RenderDevice;
use crate::renderer::frame::{FrameDriver, FrameOutcome, Scene, SurfaceInfo};
use crate::renderer::instance::RenderInstance;
use crate::renderer::target::{GpuFrame, Presenter, Surface};
use ash::vk;
use color_eyre::Result;
use std::sync::Arc;
use winit::window::Window;

/// Owns the Vulkan objects of one window. Fields drop top to bottom, so the
/// presentation objects go before the device, and the device before surface and instance.
pub struct Renderer {
    driver: FrameDriver,
    presenter: Presenter,
    device: Arc<RenderDevice>,
    surface: Surface,
    /// Only held so it outlives the surface and device
    _instance: RenderInstance,
}

impl Renderer {
    pub fn new(window: Arc<Window>, config: &RenderConfig) -> Result<Self> {
        let instance = RenderInstance::new(&window, config.enable_validation)?;
        let surface = Surface::new(&instance, &window)?;
        let device = Arc::new(RenderDevice::new(&instance, surface.handle, &surface.loader)?);
        let presenter = Presenter::new(window, config.vsync, &instance, &device, &surface)?;

        let info = presenter.surface_info();
        log::info!(
            "Renderer ready: {}x{}, {} swapchain images",
            info.extent.width,
            info.extent.height,
            info.image_count
        );

        Ok(Self {
            driver: FrameDriver::new(),
            presenter,
            device,
            surface,
            _instance: instance,
        })
    }

    pub fn device(&self) -> Arc<RenderDevice> {
        Arc::clone(&self.device)
    }

    pub fn render_pass(&self) -> vk::RenderPass {
        self.presenter.render_pass()
    }

    pub fn surface_info(&self) -> SurfaceInfo {
        self.presenter.surface_info()
    }

    pub fn request_resize(&mut self) {
        self.driver.request_resize();
    }

    pub fn frame_number(&self) -> u64 {
        self.driver.frame_number()
    }

    pub fn draw_frame(&mut self, scene: &mut dyn Scene, dt: f32) -> Result<FrameOutcome> {
        let mut frame = GpuFrame {
            presenter: &mut self.presenter,
            dev: &self.device,
            surface: &self.surface,
        };
        self.driver.draw_frame(&mut frame, scene, dt)
    }

    pub fn wait_idle(&self) -> Result<()> {
        self.device.wait_idle()
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        if let Err(e) = self.device.wait_idle() {
            log::error!("Failed to wait for the device before teardown: {:?}", e);
        }
        if Arc::strong_count(&self.device) > 1 {
            log::warn!("Device still referenced elsewhere while the renderer shuts down");
        }
    }
}
