use glam::Vec2;
use std::collections::HashSet;
use winit::event::{DeviceEvent, ElementState, KeyEvent, MouseButton, MouseScrollDelta, WindowEvent};
use winit::keyboard::{KeyCode, PhysicalKey};

/// Pixels of a pixel-precise scroll that count as one wheel line
const PIXELS_PER_LINE: f32 = 40.0;

/// Keyboard and mouse state collected between two frames
#[derive(Debug, Default)]
pub struct InputState {
    keys_held: HashSet<KeyCode>,
    pub mouse_right_down: bool,
    pub mouse_right_just_pressed: bool,
    pub mouse_right_just_released: bool,
    /// Raw pointer motion since the last frame
    pub mouse_delta: Vec2,
    /// Wheel lines since the last frame, positive away from the user
    pub scroll_delta: f32,
}

impl InputState {
    pub fn process_window_events(&mut self, event: &WindowEvent) {
        match event {
            WindowEvent::KeyboardInput {
                event:
                KeyEvent {
                    physical_key: PhysicalKey::Code(code),
                    state,
                    repeat: false,
                    ..
                },
                ..
            } => match state {
                ElementState::Pressed => {
                    self.keys_held.insert(*code);
                }
                ElementState::Released => {
                    self.keys_held.remove(code);
                }
            },
            WindowEvent::MouseInput {
                state,
                button: MouseButton::Right,
                ..
            } => match state {
                ElementState::Pressed => {
                    self.mouse_right_just_pressed = !self.mouse_right_down;
                    self.mouse_right_down = true;
                }
                ElementState::Released => {
                    self.mouse_right_just_released = self.mouse_right_down;
                    self.mouse_right_down = false;
                }
            },
            WindowEvent::MouseWheel { delta, .. } => {
                self.scroll_delta += match delta {
                    MouseScrollDelta::LineDelta(_x, y) => *y,
                    MouseScrollDelta::PixelDelta(pos) => pos.y as f32 / PIXELS_PER_LINE,
                };
            }
            WindowEvent::Focused(false) => {
                // Releases are not delivered to an unfocused window
                self.keys_held.clear();
                if self.mouse_right_down {
                    self.mouse_right_down = false;
                    self.mouse_right_just_released = true;
                }
            }
            _ => {}
        }
    }

    pub fn process_device_events(&mut self, event: &DeviceEvent) {
        if let DeviceEvent::MouseMotion { delta: (dx, dy) } = event {
            self.mouse_delta += Vec2::new(*dx as f32, *dy as f32);
        }
    }

    pub fn key_held(&self, key: KeyCode) -> bool {
        self.keys_held.contains(&key)
    }

    pub fn press(&mut self, key: KeyCode) {
        self.keys_held.insert(key);
    }

    pub fn release(&mut self, key: KeyCode) {
        self.keys_held.remove(&key);
    }

    /// Reset the per-frame deltas, held keys and buttons stay
    pub fn reset_frame(&mut self) {
        self.mouse_delta = Vec2::ZERO;
        self.scroll_delta = 0.0;
        self.mouse_right_just_pressed = false;
        self.mouse_right_just_released = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mouse_motion_accumulates_until_reset() {
        let mut input = InputState::default();
        input.process_device_events(&DeviceEvent::MouseMotion { delta: (3.0, -1.0) });
        input.process_device_events(&DeviceEvent::MouseMotion { delta: (2.0, 4.0) });
        assert_eq!(input.mouse_delta, Vec2::new(5.0, 3.0));

        input.reset_frame();
        assert_eq!(input.mouse_delta, Vec2::ZERO);
    }

    #[test]
    fn held_keys_survive_frame_reset() {
        let mut input = InputState::default();
        input.press(KeyCode::KeyW);
        input.reset_frame();
        assert!(input.key_held(KeyCode::KeyW));
        input.release(KeyCode::KeyW);
        assert!(!input.key_held(KeyCode::KeyW));
    }

    #[test]
    fn focus_loss_releases_everything() {
        let mut input = InputState::default();
        input.press(KeyCode::ShiftLeft);
        input.mouse_right_down = true;
        input.process_window_events(&WindowEvent::Focused(false));
        assert!(!input.key_held(KeyCode::ShiftLeft));
        assert!(!input.mouse_right_down);
        assert!(input.mouse_right_just_released);
    }
}
