use glam::{Mat4, Vec3};

/// Free-flying perspective camera. Yaw 0 looks down -Z, positive yaw turns towards +X.
#[derive(Debug, Clone)]
pub struct Camera {
    position: Vec3,
    yaw: f32,
    pitch: f32,
    world_up: Vec3,
    fov_y_deg: f32,
    near: f32,
    far: f32,
    aspect_ratio: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self::new()
    }
}

impl Camera {
    pub const DEFAULT_FOV_Y_DEG: f32 = 45.0;
    pub const MIN_FOV_Y_DEG: f32 = 15.0;
    pub const MAX_FOV_Y_DEG: f32 = 100.0;
    /// Stops short of straight up or down where the view basis degenerates
    pub const MAX_PITCH: f32 = 89.0 * std::f32::consts::PI / 180.0;

    pub fn new() -> Self {
        Self {
            position: Vec3::new(0.0, 1.0, 5.0),
            yaw: 0.0,
            pitch: 0.0,
            world_up: Vec3::Y,
            fov_y_deg: Self::DEFAULT_FOV_Y_DEG,
            near: 0.1,
            far: 100.0,
            aspect_ratio: 16.0 / 9.0,
        }
    }

    pub fn set_position(&mut self, position: Vec3) {
        self.position = position;
    }

    pub fn translate(&mut self, offset: Vec3) {
        self.position += offset;
    }

    /// Adds to yaw and pitch, pitch is clamped
    pub fn rotate(&mut self, delta_yaw: f32, delta_pitch: f32) {
        self.yaw = (self.yaw + delta_yaw).rem_euclid(std::f32::consts::TAU);
        self.pitch = (self.pitch + delta_pitch).clamp(-Self::MAX_PITCH, Self::MAX_PITCH);
    }

    pub fn look_at(&mut self, target: Vec3) {
        let dir = target - self.position;
        if dir.length_squared() <= f32::EPSILON {
            return;
        }
        let dir = dir.normalize();
        self.pitch = dir.y.clamp(-1.0, 1.0).asin().clamp(-Self::MAX_PITCH, Self::MAX_PITCH);
        self.yaw = dir.x.atan2(-dir.z).rem_euclid(std::f32::consts::TAU);
    }

    pub fn set_fov_y_deg(&mut self, fov_y_deg: f32) {
        self.fov_y_deg = fov_y_deg.clamp(Self::MIN_FOV_Y_DEG, Self::MAX_FOV_Y_DEG);
    }

    pub fn set_aspect_ratio(&mut self, aspect_ratio: f32) {
        if aspect_ratio.is_finite() && aspect_ratio > 0.0 {
            self.aspect_ratio = aspect_ratio;
        }
    }

    pub fn get_view_mat(&self) -> Mat4 {
        Mat4::look_to_rh(self.position, self.get_forward(), self.get_up())
    }

    /// Right-handed perspective with Y flipped for Vulkan's downward clip space
    pub fn get_proj_mat(&self) -> Mat4 {
        let mut proj = Mat4::perspective_rh(
            self.fov_y_deg.to_radians(),
            self.aspect_ratio,
            self.near,
            self.far,
        );
        proj.y_axis.y *= -1.0;
        proj
    }

    pub fn get_viewproj_mat(&self) -> Mat4 {
        self.get_proj_mat() * self.get_view_mat()
    }

    pub fn get_position(&self) -> Vec3 {
        self.position
    }

    pub fn get_forward(&self) -> Vec3 {
        Vec3::new(
            self.yaw.sin() * self.pitch.cos(),
            self.pitch.sin(),
            -self.yaw.cos() * self.pitch.cos(),
        )
    }

    pub fn get_right(&self) -> Vec3 {
        self.get_forward().cross(self.world_up).normalize()
    }

    pub fn get_up(&self) -> Vec3 {
        self.get_right().cross(self.get_forward()).normalize()
    }

    pub fn get_world_up(&self) -> Vec3 {
        self.world_up
    }

    pub fn get_yaw(&self) -> f32 {
        self.yaw
    }

    pub fn get_pitch(&self) -> f32 {
        self.pitch
    }

    pub fn get_fov_y_deg(&self) -> f32 {
        self.fov_y_deg
    }

    pub fn get_near(&self) -> f32 {
        self.near
    }

    pub fn get_far(&self) -> f32 {
        self.far
    }

    pub fn get_aspect_ratio(&self) -> f32 {
        self.aspect_ratio
    }
}

/// Orthographic projection for flat content: y spans [-1, 1], x is widened by the aspect ratio.
/// Y is flipped like the perspective projection so +y points up on screen.
pub fn ortho_2d(aspect_ratio: f32) -> Mat4 {
    let mut proj = Mat4::orthographic_rh(-aspect_ratio, aspect_ratio, -1.0, 1.0, -1.0, 1.0);
    proj.y_axis.y *= -1.0;
    proj
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec4Swizzles;

    fn assert_close(a: Vec3, b: Vec3) {
        assert!(a.abs_diff_eq(b, 1e-5), "{:?} != {:?}", a, b);
    }

    #[test]
    fn default_basis_looks_down_negative_z() {
        let cam = Camera::new();
        assert_close(cam.get_forward(), Vec3::NEG_Z);
        assert_close(cam.get_right(), Vec3::X);
        assert_close(cam.get_up(), Vec3::Y);
    }

    #[test]
    fn positive_yaw_turns_right() {
        let mut cam = Camera::new();
        cam.rotate(std::f32::consts::FRAC_PI_2, 0.0);
        assert_close(cam.get_forward(), Vec3::X);
        assert_close(cam.get_right(), Vec3::Z);
    }

    #[test]
    fn pitch_is_clamped() {
        let mut cam = Camera::new();
        cam.rotate(0.0, 10.0);
        assert_eq!(cam.get_pitch(), Camera::MAX_PITCH);
        cam.rotate(0.0, -20.0);
        assert_eq!(cam.get_pitch(), -Camera::MAX_PITCH);
        assert!(cam.get_up().is_finite());
    }

    #[test]
    fn look_at_points_forward_at_target() {
        let mut cam = Camera::new();
        cam.set_position(Vec3::new(3.0, 2.0, -1.0));
        let target = Vec3::new(-2.0, 0.5, 4.0);
        cam.look_at(target);
        assert_close(cam.get_forward(), (target - cam.get_position()).normalize());
    }

    #[test]
    fn projection_maps_up_to_negative_clip_y() {
        let mut cam = Camera::new();
        cam.set_position(Vec3::ZERO);
        let clip = cam.get_viewproj_mat() * Vec3::new(0.0, 1.0, -5.0).extend(1.0);
        let ndc = clip.xyz() / clip.w;
        assert!(ndc.y < 0.0);
        assert!((0.0..=1.0).contains(&ndc.z));
    }

    #[test]
    fn invalid_aspect_ratio_is_ignored() {
        let mut cam = Camera::new();
        cam.set_aspect_ratio(2.0);
        cam.set_aspect_ratio(0.0);
        cam.set_aspect_ratio(f32::NAN);
        assert_eq!(cam.get_aspect_ratio(), 2.0);
    }

    #[test]
    fn ortho_keeps_unit_height_and_flips_y() {
        let proj = ortho_2d(2.0);
        let top_right = proj * Vec3::new(2.0, 1.0, 0.0).extend(1.0);
        assert!((top_right.x - 1.0).abs() < 1e-6);
        assert!((top_right.y + 1.0).abs() < 1e-6);
    }
}
