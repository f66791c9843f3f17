use crate::app::input_state::InputState;
use crate::renderer::camera::Camera;
use glam::Vec3;
use winit::keyboard::KeyCode;
use winit::window::{CursorGrabMode, Window};

/// Fraction of the remaining distance covered in `delta_time` when easing with rate `speed`.
/// Independent of frame rate: two steps of `dt` equal one step of `2 * dt`.
pub fn smoothing_factor(speed: f32, delta_time: f32) -> f32 {
    1.0 - (-speed * delta_time.max(0.0)).exp()
}

/// Free-fly controls: WASD to move, Q/E down and up, Shift to go faster,
/// right mouse drag to look around and the wheel to zoom the field of view.
pub struct CameraController {
    move_speed: f32,
    boost_multiplier: f32,
    move_smoothing_speed: f32,
    velocity: Vec3,

    /// Radians per pixel of mouse motion
    look_sensitivity: f32,

    zoom_step_deg: f32,
    zoom_smoothing_speed: f32,
    zoom_desired_fov_deg: f32,
}

impl CameraController {
    pub fn new(camera: &Camera) -> Self {
        Self {
            move_speed: 3.0,
            boost_multiplier: 4.0,
            move_smoothing_speed: 12.0,
            velocity: Vec3::ZERO,

            look_sensitivity: 0.0025,

            zoom_step_deg: 5.0,
            zoom_smoothing_speed: 10.0,
            zoom_desired_fov_deg: camera.get_fov_y_deg(),
        }
    }

    pub fn velocity(&self) -> Vec3 {
        self.velocity
    }

    pub fn process_input(&mut self, camera: &mut Camera, input: &InputState, delta_time: f32) {
        self.update_look(camera, input);
        self.update_movement(camera, input, delta_time);
        self.update_zoom(camera, input, delta_time);
    }

    /// Hides and locks the cursor while looking around
    pub fn sync_cursor(&self, input: &InputState, window: &Window) {
        if input.mouse_right_just_pressed {
            window.set_cursor_visible(false);
            let grabbed = window
                .set_cursor_grab(CursorGrabMode::Locked)
                .or_else(|_| window.set_cursor_grab(CursorGrabMode::Confined));
            if let Err(e) = grabbed {
                log::warn!("Failed to grab cursor: {e}");
            }
        } else if input.mouse_right_just_released {
            window.set_cursor_visible(true);
            if let Err(e) = window.set_cursor_grab(CursorGrabMode::None) {
                log::warn!("Failed to release cursor: {e}");
            }
        }
    }

    fn update_look(&mut self, camera: &mut Camera, input: &InputState) {
        if !input.mouse_right_down {
            return;
        }
        let delta = input.mouse_delta * self.look_sensitivity;
        // Screen y grows downwards
        camera.rotate(delta.x, -delta.y);
    }

    fn update_movement(&mut self, camera: &mut Camera, input: &InputState, delta_time: f32) {
        let axes = movement_axes(input);
        let mut desired = camera.get_right() * axes.x
            + camera.get_world_up() * axes.y
            + camera.get_forward() * axes.z;
        if desired != Vec3::ZERO {
            desired = desired.normalize() * self.move_speed;
            if input.key_held(KeyCode::ShiftLeft) || input.key_held(KeyCode::ShiftRight) {
                desired *= self.boost_multiplier;
            }
        }

        let t = smoothing_factor(self.move_smoothing_speed, delta_time);
        self.velocity = self.velocity.lerp(desired, t);
        if self.velocity.length_squared() < 1e-8 {
            self.velocity = Vec3::ZERO;
        }
        camera.translate(self.velocity * delta_time);
    }

    fn update_zoom(&mut self, camera: &mut Camera, input: &InputState, delta_time: f32) {
        if input.scroll_delta != 0.0 {
            self.zoom_desired_fov_deg = (self.zoom_desired_fov_deg - input.scroll_delta * self.zoom_step_deg)
                .clamp(Camera::MIN_FOV_Y_DEG, Camera::MAX_FOV_Y_DEG);
        }
        let t = smoothing_factor(self.zoom_smoothing_speed, delta_time);
        let fov = camera.get_fov_y_deg();
        camera.set_fov_y_deg(fov + (self.zoom_desired_fov_deg - fov) * t);
    }
}

/// x right, y up, z forward, each in [-1, 1]
fn movement_axes(input: &InputState) -> Vec3 {
    let axis = |positive: KeyCode, negative: KeyCode| {
        input.key_held(positive) as i32 as f32 - input.key_held(negative) as i32 as f32
    };
    Vec3::new(
        axis(KeyCode::KeyD, KeyCode::KeyA),
        axis(KeyCode::KeyE, KeyCode::KeyQ),
        axis(KeyCode::KeyW, KeyCode::KeyS),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec2;

    const DT: f32 = 1.0 / 60.0;

    fn run(controller: &mut CameraController, camera: &mut Camera, input: &mut InputState, frames: usize) {
        for _ in 0..frames {
            controller.process_input(camera, input, DT);
            input.reset_frame();
        }
    }

    #[test]
    fn smoothing_is_frame_rate_independent() {
        assert_eq!(smoothing_factor(10.0, 0.0), 0.0);
        assert!(smoothing_factor(10.0, 100.0) > 0.999);

        let one_step = smoothing_factor(8.0, 0.1);
        let half = smoothing_factor(8.0, 0.05);
        let two_steps = 1.0 - (1.0 - half) * (1.0 - half);
        assert!((one_step - two_steps).abs() < 1e-6);
    }

    #[test]
    fn forward_key_moves_along_view_direction() {
        let mut camera = Camera::new();
        let mut controller = CameraController::new(&camera);
        let mut input = InputState::default();
        let start = camera.get_position();

        input.press(KeyCode::KeyW);
        run(&mut controller, &mut camera, &mut input, 60);

        let moved = camera.get_position() - start;
        assert!(moved.dot(camera.get_forward()) > 0.5);
        assert!(moved.x.abs() < 1e-4 && moved.y.abs() < 1e-4);
    }

    #[test]
    fn shift_boosts_and_release_glides_to_a_stop() {
        let mut camera = Camera::new();
        let mut controller = CameraController::new(&camera);
        let mut input = InputState::default();

        input.press(KeyCode::KeyE);
        run(&mut controller, &mut camera, &mut input, 120);
        let walk = controller.velocity().length();

        input.press(KeyCode::ShiftLeft);
        run(&mut controller, &mut camera, &mut input, 120);
        assert!(controller.velocity().length() > walk * 3.5);
        assert!(controller.velocity().y > 0.0);

        input.release(KeyCode::KeyE);
        input.release(KeyCode::ShiftLeft);
        run(&mut controller, &mut camera, &mut input, 600);
        assert_eq!(controller.velocity(), Vec3::ZERO);
    }

    #[test]
    fn mouse_only_looks_while_right_button_held() {
        let mut camera = Camera::new();
        let mut controller = CameraController::new(&camera);
        let mut input = InputState::default();

        input.mouse_delta = Vec2::new(200.0, 0.0);
        run(&mut controller, &mut camera, &mut input, 1);
        assert_eq!(camera.get_yaw(), 0.0);

        input.mouse_right_down = true;
        input.mouse_delta = Vec2::new(200.0, 100.0);
        run(&mut controller, &mut camera, &mut input, 1);
        assert!(camera.get_yaw() > 0.0);
        assert!(camera.get_pitch() < 0.0);
    }

    #[test]
    fn scrolling_narrows_fov_within_bounds() {
        let mut camera = Camera::new();
        let mut controller = CameraController::new(&camera);
        let mut input = InputState::default();

        input.scroll_delta = 1.0;
        run(&mut controller, &mut camera, &mut input, 120);
        assert!((camera.get_fov_y_deg() - (Camera::DEFAULT_FOV_Y_DEG - 5.0)).abs() < 0.01);

        input.scroll_delta = 100.0;
        run(&mut controller, &mut camera, &mut input, 240);
        assert!((camera.get_fov_y_deg() - Camera::MIN_FOV_Y_DEG).abs() < 0.01);
    }
}
