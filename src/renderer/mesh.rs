use crate::renderer::buffer::Buffer;
use crate::renderer::device::RenderDevice;
use crate::renderer::vertex::{Vertex2D, Vertex3D, VertexLayout, compute_tangents};
use ash::vk;
use color_eyre::Result;
use color_eyre::eyre::eyre;
use glam::{Vec2, Vec3};
use std::f32::consts::PI;
use std::marker::PhantomData;
use std::sync::Arc;

/// CPU-side geometry, counter-clockwise winding seen from the front
#[derive(Debug, Clone, PartialEq)]
pub struct MeshData<V> {
    pub vertices: Vec<V>,
    pub indices: Vec<u32>,
}

impl MeshData<Vertex2D> {
    pub fn triangle() -> Self {
        let vertices = vec![
            Vertex2D { pos: Vec2::new(-0.5, -0.5), color: Vec3::new(1.0, 0.0, 0.0) }, // Bottom left
            Vertex2D { pos: Vec2::new(0.5, -0.5), color: Vec3::new(0.0, 1.0, 0.0) },  // Bottom right
            Vertex2D { pos: Vec2::new(0.0, 0.5), color: Vec3::new(0.0, 0.0, 1.0) },   // Top
        ];
        Self { vertices, indices: vec![0, 1, 2] }
    }

    pub fn quad() -> Self {
        let vertices = vec![
            Vertex2D { pos: Vec2::new(-0.5, 0.5), color: Vec3::new(1.0, 0.0, 0.0) },  // Top left
            Vertex2D { pos: Vec2::new(-0.5, -0.5), color: Vec3::new(0.0, 1.0, 0.0) }, // Bottom left
            Vertex2D { pos: Vec2::new(0.5, 0.5), color: Vec3::new(0.0, 0.0, 1.0) },   // Top right
            Vertex2D { pos: Vec2::new(0.5, -0.5), color: Vec3::new(1.0, 1.0, 0.0) },  // Bottom right
        ];
        let indices = vec![
            0, 1, 2, // Top left triangle
            2, 1, 3, // Bottom right triangle
        ];
        Self { vertices, indices }
    }
}

impl MeshData<Vertex3D> {
    /// Eight shared corners, so normals are the smoothed corner directions
    pub fn cube() -> Self {
        let mut vertices = Vec::with_capacity(8);
        for i in 0..8u32 {
            let x = if i & 1 == 0 { -0.5 } else { 0.5 };
            let y = if i & 2 == 0 { -0.5 } else { 0.5 };
            let z = if i & 4 == 0 { -0.5 } else { 0.5 };
            let pos = Vec3::new(x, y, z);
            let color = pos + Vec3::splat(0.5);
            let uv = Vec2::new(x + 0.5, y + 0.5);
            vertices.push(Vertex3D::new(pos, pos.normalize(), color, uv));
        }

        #[rustfmt::skip]
        let indices = vec![
            4, 5, 7,  7, 6, 4, // +z
            1, 0, 2,  2, 3, 1, // -z
            5, 1, 3,  3, 7, 5, // +x
            0, 4, 6,  6, 2, 0, // -x
            6, 7, 3,  3, 2, 6, // +y
            0, 1, 5,  5, 4, 0, // -y
        ];
        compute_tangents(&mut vertices, &indices);
        Self { vertices, indices }
    }

    pub fn sphere(radius: f32, rings: u32, segments: u32) -> Self {
        let rings = rings.max(2);
        let segments = segments.max(3);

        let mut vertices = Vec::with_capacity(((rings + 1) * (segments + 1)) as usize);
        for ring in 0..=rings {
            let v = ring as f32 / rings as f32;
            let theta = v * PI;
            for segment in 0..=segments {
                let u = segment as f32 / segments as f32;
                let phi = u * 2.0 * PI;
                let normal = Vec3::new(theta.sin() * phi.cos(), theta.cos(), -theta.sin() * phi.sin());
                vertices.push(Vertex3D::new(
                    normal * radius,
                    normal,
                    Vec3::ONE,
                    Vec2::new(u, v),
                ));
            }
        }

        let stride = segments + 1;
        let mut indices = Vec::with_capacity((rings * segments * 6) as usize);
        for ring in 0..rings {
            for segment in 0..segments {
                let top_left = ring * stride + segment;
                let bottom_left = top_left + stride;
                indices.extend_from_slice(&[
                    top_left, bottom_left, top_left + 1,
                    top_left + 1, bottom_left, bottom_left + 1,
                ]);
            }
        }

        compute_tangents(&mut vertices, &indices);
        Self { vertices, indices }
    }

    /// Ground plane in XZ facing +y, UVs tiled once per world unit
    pub fn plane(size: f32) -> Self {
        let h = size * 0.5;
        let corners = [
            (Vec3::new(-h, 0.0, -h), Vec2::new(0.0, 0.0)),
            (Vec3::new(-h, 0.0, h), Vec2::new(0.0, size)),
            (Vec3::new(h, 0.0, h), Vec2::new(size, size)),
            (Vec3::new(h, 0.0, -h), Vec2::new(size, 0.0)),
        ];
        let mut vertices = corners
            .iter()
            .map(|&(pos, uv)| Vertex3D::new(pos, Vec3::Y, Vec3::ONE, uv))
            .collect::<Vec<_>>();
        let indices = vec![0, 1, 2, 2, 3, 0];
        compute_tangents(&mut vertices, &indices);
        Self { vertices, indices }
    }
}

/// Device-local vertex and index buffers of one piece of geometry
pub struct Mesh<V> {
    vertex_buffer: Buffer,
    index_buffer: Buffer,
    index_count: u32,
    device: Arc<ash::Device>,
    _vertex: PhantomData<V>,
}

impl<V: VertexLayout> Mesh<V> {
    pub fn new(dev: &RenderDevice, data: &MeshData<V>, name: &str) -> Result<Self> {
        if data.vertices.is_empty() || data.indices.is_empty() {
            return Err(eyre!("Mesh '{}' has no geometry", name));
        }
        if let Some(&bad) = data.indices.iter().find(|&&i| i as usize >= data.vertices.len()) {
            return Err(eyre!(
                "Mesh '{}' index {} is out of range for {} vertices",
                name,
                bad,
                data.vertices.len()
            ));
        }

        let vertex_buffer = Buffer::new_device_local(
            dev,
            &data.vertices,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            &format!("{} vertices", name),
        )?;
        let index_buffer = Buffer::new_device_local(
            dev,
            &data.indices,
            vk::BufferUsageFlags::INDEX_BUFFER,
            &format!("{} indices", name),
        )?;

        log::debug!(
            "Uploaded mesh '{}': {} vertices, {} indices",
            name,
            data.vertices.len(),
            data.indices.len()
        );

        Ok(Self {
            vertex_buffer,
            index_buffer,
            index_count: data.indices.len() as u32,
            device: dev.logical.clone(),
            _vertex: PhantomData,
        })
    }

    /// Expects a pipeline for `V` to be bound already
    pub fn draw(&self, cmd: vk::CommandBuffer) {
        unsafe {
            self.device.cmd_bind_vertex_buffers(cmd, 0, &[self.vertex_buffer.buffer], &[0]);
            self.device.cmd_bind_index_buffer(cmd, self.index_buffer.buffer, 0, vk::IndexType::UINT32);
            self.device.cmd_draw_indexed(cmd, self.index_count, 1, 0, 0, 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_indices_in_range<V>(data: &MeshData<V>) {
        assert_eq!(data.indices.len() % 3, 0);
        assert!(data.indices.iter().all(|&i| (i as usize) < data.vertices.len()));
    }

    /// Every triangle faces away from the mesh centre
    fn assert_outward_winding(data: &MeshData<Vertex3D>) {
        for tri in data.indices.chunks_exact(3) {
            let [a, b, c] = [0, 1, 2].map(|k| data.vertices[tri[k] as usize].pos);
            let face_normal = (b - a).cross(c - a);
            let centroid = (a + b + c) / 3.0;
            assert!(face_normal.dot(centroid) > 0.0, "inward triangle {:?}", tri);
        }
    }

    #[test]
    fn cube_shares_eight_corners() {
        let cube = MeshData::cube();
        assert_eq!(cube.vertices.len(), 8);
        assert_eq!(cube.indices.len(), 36);
        assert_indices_in_range(&cube);
        assert_outward_winding(&cube);
    }

    #[test]
    fn sphere_is_closed_and_outward() {
        let sphere = MeshData::sphere(1.0, 8, 12);
        assert_eq!(sphere.vertices.len(), 9 * 13);
        assert_eq!(sphere.indices.len(), 8 * 12 * 6);
        assert_indices_in_range(&sphere);
        for v in &sphere.vertices {
            assert!((v.pos.length() - 1.0).abs() < 1e-5);
        }
        // Pole rows produce zero-area triangles, skip those
        let non_degenerate = MeshData {
            vertices: sphere.vertices.clone(),
            indices: sphere
                .indices
                .chunks_exact(3)
                .filter(|tri| {
                    let [a, b, c] = [0, 1, 2].map(|k| sphere.vertices[tri[k] as usize].pos);
                    (b - a).cross(c - a).length() > 1e-6
                })
                .flatten()
                .copied()
                .collect(),
        };
        assert_outward_winding(&non_degenerate);
    }

    #[test]
    fn plane_faces_up() {
        let plane = MeshData::plane(10.0);
        assert_indices_in_range(&plane);
        for tri in plane.indices.chunks_exact(3) {
            let [a, b, c] = [0, 1, 2].map(|k| plane.vertices[tri[k] as usize].pos);
            assert!((b - a).cross(c - a).y > 0.0);
        }
        for v in &plane.vertices {
            assert_eq!(v.tangent[3].abs(), 1.0);
        }
    }

    #[test]
    fn flat_shapes_wind_counter_clockwise() {
        for shape in [MeshData::triangle(), MeshData::quad()] {
            assert_indices_in_range(&shape);
            for tri in shape.indices.chunks_exact(3) {
                let [a, b, c] = [0, 1, 2].map(|k| shape.vertices[tri[k] as usize].pos);
                assert!((b - a).perp_dot(c - a) > 0.0);
            }
        }
    }
}
