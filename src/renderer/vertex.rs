use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3};
use std::mem::offset_of;

pub struct VertexInputDescription {
    pub bindings: Vec<vk::VertexInputBindingDescription>,
    pub attributes: Vec<vk::VertexInputAttributeDescription>,
}

/// A vertex type that can describe its own memory layout to a pipeline
pub trait VertexLayout: Pod {
    fn description() -> VertexInputDescription;
}

fn per_vertex_binding<V>() -> vk::VertexInputBindingDescription {
    vk::VertexInputBindingDescription {
        binding: 0,
        stride: size_of::<V>() as u32,
        input_rate: vk::VertexInputRate::VERTEX,
    }
}

fn attribute(location: u32, format: vk::Format, offset: usize) -> vk::VertexInputAttributeDescription {
    vk::VertexInputAttributeDescription {
        location,
        binding: 0,
        format,
        offset: offset as u32,
    }
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Pod, Zeroable)]
pub struct Vertex2D {
    pub pos: Vec2,
    pub color: Vec3,
}

impl VertexLayout for Vertex2D {
    fn description() -> VertexInputDescription {
        VertexInputDescription {
            bindings: vec![per_vertex_binding::<Self>()],
            attributes: vec![
                attribute(0, vk::Format::R32G32_SFLOAT, offset_of!(Self, pos)),
                attribute(1, vk::Format::R32G32B32_SFLOAT, offset_of!(Self, color)),
            ],
        }
    }
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Pod, Zeroable)]
pub struct Vertex3D {
    pub pos: Vec3,
    pub normal: Vec3,
    pub color: Vec3,
    pub uv: Vec2,
    /// xyz is the tangent, w the bitangent handedness (+1 or -1).
    /// A plain array keeps the struct free of SIMD alignment padding.
    pub tangent: [f32; 4],
}

impl VertexLayout for Vertex3D {
    fn description() -> VertexInputDescription {
        VertexInputDescription {
            bindings: vec![per_vertex_binding::<Self>()],
            attributes: vec![
                attribute(0, vk::Format::R32G32B32_SFLOAT, offset_of!(Self, pos)),
                attribute(1, vk::Format::R32G32B32_SFLOAT, offset_of!(Self, normal)),
                attribute(2, vk::Format::R32G32B32_SFLOAT, offset_of!(Self, color)),
                attribute(3, vk::Format::R32G32_SFLOAT, offset_of!(Self, uv)),
                attribute(4, vk::Format::R32G32B32A32_SFLOAT, offset_of!(Self, tangent)),
            ],
        }
    }
}

impl Vertex3D {
    pub fn new(pos: Vec3, normal: Vec3, color: Vec3, uv: Vec2) -> Self {
        Self {
            pos,
            normal,
            color,
            uv,
            tangent: [1.0, 0.0, 0.0, 1.0],
        }
    }
}

/// Fills in `tangent` for indexed triangles.
///
/// Tangents and bitangents are accumulated per triangle, then each vertex tangent is
/// orthogonalised against its normal (Gram-Schmidt). The w component is -1 when
/// `cross(normal, tangent)` points away from the accumulated bitangent, i.e. the UVs are mirrored.
pub fn compute_tangents(vertices: &mut [Vertex3D], indices: &[u32]) {
    let mut tangents = vec![Vec3::ZERO; vertices.len()];
    let mut bitangents = vec![Vec3::ZERO; vertices.len()];

    for tri in indices.chunks_exact(3) {
        let [i0, i1, i2] = [tri[0] as usize, tri[1] as usize, tri[2] as usize];
        if i0 >= vertices.len() || i1 >= vertices.len() || i2 >= vertices.len() {
            log::warn!("Skipping triangle with out-of-range index {:?}", tri);
            continue;
        }
        let (v0, v1, v2) = (&vertices[i0], &vertices[i1], &vertices[i2]);

        let edge1 = v1.pos - v0.pos;
        let edge2 = v2.pos - v0.pos;
        let duv1 = v1.uv - v0.uv;
        let duv2 = v2.uv - v0.uv;

        let det = duv1.x * duv2.y - duv2.x * duv1.y;
        if det.abs() < f32::EPSILON {
            // Degenerate UV mapping carries no tangent information
            continue;
        }
        let r = 1.0 / det;
        let tangent = (edge1 * duv2.y - edge2 * duv1.y) * r;
        let bitangent = (edge2 * duv1.x - edge1 * duv2.x) * r;

        for i in [i0, i1, i2] {
            tangents[i] += tangent;
            bitangents[i] += bitangent;
        }
    }

    for (i, vertex) in vertices.iter_mut().enumerate() {
        let n = vertex.normal.normalize_or_zero();
        let t = tangents[i];

        let mut ortho = (t - n * n.dot(t)).normalize_or_zero();
        if ortho == Vec3::ZERO {
            ortho = if n == Vec3::ZERO { Vec3::X } else { n.any_orthonormal_vector() };
        }

        let handedness = if n.cross(ortho).dot(bitangents[i]) < 0.0 { -1.0 } else { 1.0 };
        vertex.tangent = [ortho.x, ortho.y, ortho.z, handedness];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tangent_of(v: &Vertex3D) -> Vec3 {
        Vec3::new(v.tangent[0], v.tangent[1], v.tangent[2])
    }

    // v grows along +y so the bitangent is +y for unmirrored UVs
    fn quad(uv_flip: bool) -> (Vec<Vertex3D>, Vec<u32>) {
        let u = |x: f32| if uv_flip { 1.0 - x } else { x };
        let n = Vec3::Z;
        let c = Vec3::ONE;
        let vertices = vec![
            Vertex3D::new(Vec3::new(-1.0, -1.0, 0.0), n, c, Vec2::new(u(0.0), 0.0)),
            Vertex3D::new(Vec3::new(1.0, -1.0, 0.0), n, c, Vec2::new(u(1.0), 0.0)),
            Vertex3D::new(Vec3::new(1.0, 1.0, 0.0), n, c, Vec2::new(u(1.0), 1.0)),
            Vertex3D::new(Vec3::new(-1.0, 1.0, 0.0), n, c, Vec2::new(u(0.0), 1.0)),
        ];
        (vertices, vec![0, 1, 2, 2, 3, 0])
    }

    #[test]
    fn layouts_match_shader_locations() {
        let desc = Vertex3D::description();
        assert_eq!(desc.bindings.len(), 1);
        assert_eq!(desc.bindings[0].stride as usize, size_of::<Vertex3D>());
        let locations = desc.attributes.iter().map(|a| a.location).collect::<Vec<_>>();
        assert_eq!(locations, vec![0, 1, 2, 3, 4]);
        assert_eq!(desc.attributes[4].format, vk::Format::R32G32B32A32_SFLOAT);
        assert_eq!(desc.attributes[4].offset as usize, size_of::<Vertex3D>() - 16);

        let desc = Vertex2D::description();
        assert_eq!(desc.bindings[0].stride, 20);
        assert_eq!(desc.attributes[1].offset, 8);
    }

    #[test]
    fn tangent_follows_u_direction() {
        let (mut vertices, indices) = quad(false);
        compute_tangents(&mut vertices, &indices);
        for v in &vertices {
            assert!((tangent_of(v) - Vec3::X).length() < 1e-5, "{:?}", v.tangent);
            assert_eq!(v.tangent[3], 1.0);
        }
    }

    #[test]
    fn mirrored_uvs_flip_handedness() {
        let (mut vertices, indices) = quad(true);
        compute_tangents(&mut vertices, &indices);
        for v in &vertices {
            assert!((tangent_of(v) + Vec3::X).length() < 1e-5, "{:?}", v.tangent);
            assert_eq!(v.tangent[3], -1.0);
        }
    }

    #[test]
    fn tangents_are_orthogonal_to_normals() {
        let (mut vertices, indices) = quad(false);
        // Tilt the normals so Gram-Schmidt has work to do
        for v in &mut vertices {
            v.normal = Vec3::new(0.3, 0.0, 1.0).normalize();
        }
        compute_tangents(&mut vertices, &indices);
        for v in &vertices {
            let t = tangent_of(v);
            assert!(t.dot(v.normal).abs() < 1e-5);
            assert!((t.length() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn degenerate_uvs_still_yield_unit_tangent() {
        let (mut vertices, indices) = quad(false);
        for v in &mut vertices {
            v.uv = Vec2::ZERO;
        }
        compute_tangents(&mut vertices, &indices);
        for v in &vertices {
            let t = tangent_of(v);
            assert!((t.length() - 1.0).abs() < 1e-5);
            assert!(t.dot(v.normal).abs() < 1e-5);
        }
    }
}
