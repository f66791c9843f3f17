use bytemuck::{Pod, Zeroable};
use glam::Mat4;

/// Largest push constant block every Vulkan implementation has to accept
pub const MAX_PUSH_CONSTANT_SIZE: usize = 128;

/// Per-frame uniform of the 2D pipeline
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, Pod, Zeroable)]
pub struct FrameUniforms2D {
    pub proj: Mat4,
}

/// Per-frame uniform of the 3D pipeline
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, Pod, Zeroable)]
pub struct FrameUniforms3D {
    pub view: Mat4,
    pub proj: Mat4,
}

/// Data unique to each draw call passed as a push constant
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, Pod, Zeroable)]
pub struct MeshPushConstants {
    pub model: Mat4,
}

const _: () = assert!(size_of::<MeshPushConstants>() <= MAX_PUSH_CONSTANT_SIZE);
