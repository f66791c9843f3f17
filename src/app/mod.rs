mod camera_controller;
mod game;
mod input_state;

use crate::app::game::Game;
use crate::renderer::Renderer;
use crate::renderer::config::RenderConfig;
use crate::renderer::frame::FrameOutcome;
use color_eyre::Result;
use color_eyre::eyre::eyre;
use std::sync::Arc;
use std::time::Instant;
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::{DeviceEvent, DeviceId, ElementState, KeyEvent, StartCause, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::keyboard::{Key, NamedKey};
use winit::window::{Window, WindowId};

/// Longest step fed to the simulation, so a stall does not teleport the camera
const MAX_DELTA_TIME_SECS: f32 = 0.1;

pub struct App {
    config: RenderConfig,
    // Dropped in this order: the scene's GPU resources go before the renderer
    game: Option<Game>,
    renderer: Option<Renderer>,
    window: Option<Arc<Window>>,

    // State
    prev_frame_time: Instant,
    delta_time_secs: f32,
    /// Set while frames are skipped, e.g. minimised; redraws resume on the next resize
    paused: bool,
    error: Option<color_eyre::Report>,
}

impl App {
    pub fn new(config: RenderConfig) -> Self {
        Self {
            config,
            game: None,
            renderer: None,
            window: None,

            prev_frame_time: Instant::now(),
            delta_time_secs: 0.0,
            paused: false,
            error: None,
        }
    }

    pub fn run(mut self) -> Result<()> {
        let event_loop = EventLoop::new()?;
        event_loop.set_control_flow(ControlFlow::Wait);
        event_loop.run_app(&mut self)?;

        self.shutdown();
        match self.error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn init(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let attributes = Window::default_attributes()
            .with_title(self.config.window_title.clone())
            .with_inner_size(PhysicalSize::new(self.config.window_width, self.config.window_height));
        let window = Arc::new(event_loop.create_window(attributes)?);

        let renderer = Renderer::new(window.clone(), &self.config)?;
        let game = Game::new(
            renderer.device(),
            &self.config,
            renderer.render_pass(),
            renderer.surface_info(),
        )?;

        window.request_redraw();
        self.window = Some(window);
        self.renderer = Some(renderer);
        self.game = Some(game);
        Ok(())
    }

    fn redraw(&mut self) -> Result<()> {
        let (Some(renderer), Some(game), Some(window)) =
            (self.renderer.as_mut(), self.game.as_mut(), self.window.as_ref())
        else {
            return Err(eyre!("Redraw requested before the renderer exists"));
        };

        game.sync_cursor(window);
        let outcome = renderer.draw_frame(game, self.delta_time_secs.min(MAX_DELTA_TIME_SECS))?;
        if let FrameOutcome::Rebuilt { .. } = outcome {
            log::debug!("Frame {} rebuilt the swapchain", renderer.frame_number());
        }
        self.paused = outcome == FrameOutcome::Skipped;
        Ok(())
    }

    fn shutdown(&mut self) {
        if let Some(renderer) = self.renderer.as_ref() {
            if let Err(e) = renderer.wait_idle() {
                log::error!("Failed to wait for the device on shutdown: {:?}", e);
            }
        }
        self.game = None;
        self.renderer = None;
        self.window = None;
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, error: color_eyre::Report) {
        log::error!("{:?}", error);
        self.error.get_or_insert(error);
        event_loop.exit();
    }
}

impl ApplicationHandler for App {
    fn new_events(&mut self, _event_loop: &ActiveEventLoop, _cause: StartCause) {
        let curr_frame_time = Instant::now();
        self.delta_time_secs = curr_frame_time.duration_since(self.prev_frame_time).as_secs_f32();
        self.prev_frame_time = curr_frame_time;
    }

    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.renderer.is_some() {
            return;
        }
        if let Err(e) = self.init(event_loop) {
            self.fail(event_loop, e.wrap_err("Failed to initialize the renderer"));
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _window_id: WindowId, event: WindowEvent) {
        if let Some(game) = self.game.as_mut() {
            game.input_mut().process_window_events(&event);
        }

        match event {
            WindowEvent::CloseRequested => {
                event_loop.exit();
            }
            WindowEvent::Resized(_) | WindowEvent::ScaleFactorChanged { .. } => {
                if let Some(renderer) = self.renderer.as_mut() {
                    renderer.request_resize();
                }
                self.paused = false;
                if let Some(window) = self.window.as_ref() {
                    window.request_redraw();
                }
            }
            WindowEvent::RedrawRequested => {
                if let Err(e) = self.redraw() {
                    self.fail(event_loop, e);
                }
            }
            WindowEvent::KeyboardInput {
                event:
                KeyEvent {
                    logical_key: Key::Named(NamedKey::Escape),
                    state: ElementState::Pressed,
                    ..
                },
                ..
            } => {
                event_loop.exit();
            }
            _ => {}
        }
    }

    fn device_event(&mut self, _event_loop: &ActiveEventLoop, _device_id: DeviceId, event: DeviceEvent) {
        if let Some(game) = self.game.as_mut() {
            game.input_mut().process_device_events(&event);
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if self.paused {
            return;
        }
        if let Some(window) = self.window.as_ref() {
            window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        self.shutdown();
    }
}
