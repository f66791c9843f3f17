use crate::app::camera_controller::CameraController;
use crate::app::input_state::InputState;
use crate::renderer::camera::{Camera, ortho_2d};
use crate::renderer::config::RenderConfig;
use crate::renderer::device::RenderDevice;
use crate::renderer::frame::{Scene, SurfaceInfo};
use crate::renderer::material::{Material, MaterialPool, MaterialSlot};
use crate::renderer::mesh::{Mesh, MeshData};
use crate::renderer::pipeline::{BlendMode, EXTERNAL_SET, GraphicsPipelineBuilder, Pipeline};
use crate::renderer::registry::{Handle, Registry};
use crate::renderer::shader::GraphicsShader;
use crate::renderer::shader_data::{FrameUniforms2D, FrameUniforms3D, MeshPushConstants};
use crate::renderer::texture::{self, Texture};
use crate::renderer::vertex::{Vertex2D, Vertex3D};
use ash::vk;
use color_eyre::Result;
use color_eyre::eyre::OptionExt;
use glam::{Mat4, Quat, Vec3};
use std::path::Path;
use std::sync::Arc;
use winit::window::Window;

const FALLBACK_TEXTURE_SIZE: u32 = 256;

/// How a material looks when its texture files are missing
struct MaterialRecipe {
    name: &'static str,
    tint: [u8; 3],
    metallic: u8,
    roughness: u8,
}

const MATERIALS: [MaterialRecipe; 3] = [
    MaterialRecipe { name: "rusted_iron", tint: [150, 80, 50], metallic: 200, roughness: 180 },
    MaterialRecipe { name: "gold", tint: [230, 180, 60], metallic: 255, roughness: 60 },
    MaterialRecipe { name: "plastic", tint: [40, 110, 200], metallic: 0, roughness: 120 },
];

fn slot_file_stem(slot: MaterialSlot) -> &'static str {
    match slot {
        MaterialSlot::Albedo => "albedo",
        MaterialSlot::Normal => "normal",
        MaterialSlot::Metallic => "metallic",
        MaterialSlot::Roughness => "roughness",
        MaterialSlot::AmbientOcclusion => "ao",
    }
}

/// Colour data is stored in sRGB, everything else is linear
fn slot_format(slot: MaterialSlot) -> vk::Format {
    match slot {
        MaterialSlot::Albedo => vk::Format::R8G8B8A8_SRGB,
        _ => vk::Format::R8G8B8A8_UNORM,
    }
}

/// World-space transform plus a constant spin
#[derive(Debug, Clone, Copy)]
struct Spin {
    position: Vec3,
    scale: Vec3,
    axis: Vec3,
    /// Radians per second
    speed: f32,
}

impl Spin {
    fn model(&self, time: f32) -> Mat4 {
        Mat4::from_scale_rotation_translation(
            self.scale,
            Quat::from_axis_angle(self.axis.normalize(), self.speed * time),
            self.position,
        )
    }
}

struct Object3D {
    mesh: Handle<Mesh<Vertex3D>>,
    material: Handle<Material>,
    spin: Spin,
}

struct Object2D {
    mesh: Handle<Mesh<Vertex2D>>,
    spin: Spin,
}

/// The demo: a few lit meshes with materials and some flat shapes drawn over them
pub struct Game {
    camera: Camera,
    camera_controller: CameraController,
    input: InputState,
    time: f32,
    surface: SurfaceInfo,

    objects_3d: Vec<Object3D>,
    objects_2d: Vec<Object2D>,

    pipeline_3d: Pipeline,
    pipeline_2d: Pipeline,
    materials: Registry<Material>,
    material_pool: MaterialPool,
    meshes_3d: Registry<Mesh<Vertex3D>>,
    meshes_2d: Registry<Mesh<Vertex2D>>,
    textures: Registry<Texture>,

    dev: Arc<RenderDevice>,
}

impl Game {
    pub fn new(
        dev: Arc<RenderDevice>,
        config: &RenderConfig,
        render_pass: vk::RenderPass,
        surface: SurfaceInfo,
    ) -> Result<Self> {
        let mut textures = Registry::new();
        let mut material_pool = MaterialPool::new(dev.logical.clone(), config.max_materials)?;
        let mut materials = Registry::new();

        let shared = SharedFallbacks::new(&dev, &mut textures)?;
        let mut material_handles = Vec::with_capacity(MATERIALS.len());
        for recipe in &MATERIALS {
            let slots = load_material_textures(&dev, &mut textures, &config.asset_dir, recipe, &shared)?;
            let material = material_pool.create_material(&textures, &slots)?;
            material_handles.push(materials.insert(material));
        }
        log::info!(
            "Created {} materials from {} textures ({} of {} pool sets used)",
            materials.len(),
            textures.len(),
            material_pool.budget().used(),
            material_pool.budget().capacity()
        );

        let mut meshes_3d = Registry::new();
        let cube = meshes_3d.insert(Mesh::new(&dev, &MeshData::cube(), "cube")?);
        let sphere = meshes_3d.insert(Mesh::new(&dev, &MeshData::sphere(0.6, 24, 48), "sphere")?);
        let plane = meshes_3d.insert(Mesh::new(&dev, &MeshData::plane(12.0), "plane")?);

        let mut meshes_2d = Registry::new();
        let triangle = meshes_2d.insert(Mesh::new(&dev, &MeshData::triangle(), "triangle")?);
        let quad = meshes_2d.insert(Mesh::new(&dev, &MeshData::quad(), "quad")?);

        let material = |i: usize| {
            material_handles
                .get(i % material_handles.len())
                .copied()
                .ok_or_eyre("No materials created")
        };
        let objects_3d = vec![
            Object3D {
                mesh: plane,
                material: material(2)?,
                spin: Spin { position: Vec3::new(0.0, -1.0, 0.0), scale: Vec3::ONE, axis: Vec3::Y, speed: 0.0 },
            },
            Object3D {
                mesh: cube,
                material: material(0)?,
                spin: Spin { position: Vec3::new(-1.5, 0.0, 0.0), scale: Vec3::ONE, axis: Vec3::new(1.0, 1.0, 0.0), speed: 0.8 },
            },
            Object3D {
                mesh: sphere,
                material: material(1)?,
                spin: Spin { position: Vec3::new(1.5, 0.0, 0.0), scale: Vec3::ONE, axis: Vec3::Y, speed: 0.5 },
            },
        ];
        let objects_2d = vec![
            Object2D {
                mesh: triangle,
                spin: Spin { position: Vec3::new(-1.4, 0.75, 0.0), scale: Vec3::splat(0.3), axis: Vec3::Z, speed: 1.0 },
            },
            Object2D {
                mesh: quad,
                spin: Spin { position: Vec3::new(1.4, 0.75, 0.0), scale: Vec3::splat(0.25), axis: Vec3::Z, speed: -0.6 },
            },
        ];

        let pipeline_3d = GraphicsPipelineBuilder::new("pbr3d", render_pass)
            .with_shader(GraphicsShader::new(&config.shader_dir, "pbr3d", dev.logical.clone())?)
            .with_vertex::<Vertex3D>()
            .with_depth(true, true)
            .with_uniform::<FrameUniforms3D>()
            .with_push_constant::<MeshPushConstants>()
            .with_external_layout(material_pool.layout())
            .build(&dev, surface.image_count)?;

        // Overlay: drawn last and blended over the scene, no culling and no depth
        let pipeline_2d = GraphicsPipelineBuilder::new("flat2d", render_pass)
            .with_shader(GraphicsShader::new(&config.shader_dir, "flat2d", dev.logical.clone())?)
            .with_vertex::<Vertex2D>()
            .with_cull_mode(vk::CullModeFlags::NONE, vk::FrontFace::COUNTER_CLOCKWISE)
            .with_depth(false, false)
            .with_blending(BlendMode::Alpha)
            .with_uniform::<FrameUniforms2D>()
            .with_push_constant::<MeshPushConstants>()
            .build(&dev, surface.image_count)?;

        let mut camera = Camera::new();
        camera.set_position(Vec3::new(0.0, 1.5, 6.0));
        camera.look_at(Vec3::ZERO);
        camera.set_aspect_ratio(surface.aspect_ratio());
        let camera_controller = CameraController::new(&camera);

        Ok(Self {
            camera,
            camera_controller,
            input: InputState::default(),
            time: 0.0,
            surface,

            objects_3d,
            objects_2d,

            pipeline_3d,
            pipeline_2d,
            materials,
            material_pool,
            meshes_3d,
            meshes_2d,
            textures,

            dev,
        })
    }

    pub fn input_mut(&mut self) -> &mut InputState {
        &mut self.input
    }

    pub fn sync_cursor(&self, window: &Window) {
        self.camera_controller.sync_cursor(&self.input, window);
    }

    fn draw_3d(&mut self, cmd: vk::CommandBuffer, image_index: u32) -> Result<()> {
        self.pipeline_3d.update_ubo(
            image_index,
            &FrameUniforms3D {
                view: self.camera.get_view_mat(),
                proj: self.camera.get_proj_mat(),
            },
        )?;
        self.pipeline_3d.bind(cmd, image_index, self.surface.extent)?;

        let mut bound_material = None;
        for object in &self.objects_3d {
            let mesh = self
                .meshes_3d
                .get(object.mesh)
                .ok_or_eyre(format!("Mesh {:?} was removed", object.mesh))?;
            if bound_material != Some(object.material) {
                let material = self
                    .materials
                    .get(object.material)
                    .ok_or_eyre(format!("Material {:?} was removed", object.material))?;
                self.pipeline_3d.bind_set(cmd, EXTERNAL_SET, material.set);
                bound_material = Some(object.material);
            }
            self.pipeline_3d.update_push_constant(
                cmd,
                &MeshPushConstants { model: object.spin.model(self.time) },
            )?;
            mesh.draw(cmd);
        }
        Ok(())
    }

    fn draw_2d(&mut self, cmd: vk::CommandBuffer, image_index: u32) -> Result<()> {
        self.pipeline_2d.update_ubo(
            image_index,
            &FrameUniforms2D { proj: ortho_2d(self.surface.aspect_ratio()) },
        )?;
        self.pipeline_2d.bind(cmd, image_index, self.surface.extent)?;

        for object in &self.objects_2d {
            let mesh = self
                .meshes_2d
                .get(object.mesh)
                .ok_or_eyre(format!("Mesh {:?} was removed", object.mesh))?;
            self.pipeline_2d.update_push_constant(
                cmd,
                &MeshPushConstants { model: object.spin.model(self.time) },
            )?;
            mesh.draw(cmd);
        }
        Ok(())
    }
}

impl Scene for Game {
    fn update(&mut self, dt: f32) -> Result<()> {
        self.time += dt;
        self.camera_controller.process_input(&mut self.camera, &self.input, dt);
        self.input.reset_frame();
        Ok(())
    }

    fn draw(&mut self, cmd: vk::CommandBuffer, image_index: u32) -> Result<()> {
        self.draw_3d(cmd, image_index)?;
        self.draw_2d(cmd, image_index)
    }

    fn on_resize(&mut self, surface: &SurfaceInfo) -> Result<()> {
        self.surface = *surface;
        self.camera.set_aspect_ratio(surface.aspect_ratio());
        self.pipeline_3d.resize_uniforms(&self.dev, surface.image_count)?;
        self.pipeline_2d.resize_uniforms(&self.dev, surface.image_count)
    }
}

impl Drop for Game {
    fn drop(&mut self) {
        if let Err(e) = self.dev.wait_idle() {
            log::error!("Failed to wait for the device before dropping the scene: {:?}", e);
        }
    }
}

/// Textures shared by every material that lacks its own file for a slot
struct SharedFallbacks {
    normal: Handle<Texture>,
    ambient_occlusion: Handle<Texture>,
}

impl SharedFallbacks {
    fn new(dev: &RenderDevice, textures: &mut Registry<Texture>) -> Result<Self> {
        let normal = Texture::from_rgba8(
            dev,
            &texture::flat_normal(FALLBACK_TEXTURE_SIZE),
            slot_format(MaterialSlot::Normal),
            "fallback normal",
        )?;
        let ambient_occlusion = Texture::from_rgba8(
            dev,
            &texture::constant(FALLBACK_TEXTURE_SIZE, 255),
            slot_format(MaterialSlot::AmbientOcclusion),
            "fallback ao",
        )?;
        Ok(Self {
            normal: textures.insert(normal),
            ambient_occlusion: textures.insert(ambient_occlusion),
        })
    }
}

/// One texture per slot: `<asset_dir>/<material>/<slot>.png` when present, generated otherwise
fn load_material_textures(
    dev: &RenderDevice,
    textures: &mut Registry<Texture>,
    asset_dir: &Path,
    recipe: &MaterialRecipe,
    shared: &SharedFallbacks,
) -> Result<Vec<Handle<Texture>>> {
    let mut handles = Vec::with_capacity(MaterialSlot::COUNT);
    for slot in MaterialSlot::ALL {
        let path = asset_dir.join(recipe.name).join(format!("{}.png", slot_file_stem(slot)));
        let handle = if path.is_file() {
            textures.insert(Texture::from_file(dev, &path, slot_format(slot))?)
        } else {
            log::info!("{} not found, generating {:?} texture for '{}'", path.display(), slot, recipe.name);
            let name = format!("{} {}", recipe.name, slot_file_stem(slot));
            let generated = match slot {
                MaterialSlot::Normal => {
                    handles.push(shared.normal);
                    continue;
                }
                MaterialSlot::AmbientOcclusion => {
                    handles.push(shared.ambient_occlusion);
                    continue;
                }
                MaterialSlot::Albedo => {
                    let dark = recipe.tint.map(|c| c / 2);
                    texture::checker(FALLBACK_TEXTURE_SIZE, 8, recipe.tint, dark)
                }
                MaterialSlot::Metallic => texture::constant(FALLBACK_TEXTURE_SIZE, recipe.metallic),
                MaterialSlot::Roughness => texture::constant(FALLBACK_TEXTURE_SIZE, recipe.roughness),
            };
            textures.insert(Texture::from_rgba8(dev, &generated, slot_format(slot), &name)?)
        };
        handles.push(handle);
    }
    Ok(handles)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spin_rotates_about_its_axis_and_keeps_position() {
        let spin = Spin {
            position: Vec3::new(1.0, 2.0, 3.0),
            scale: Vec3::splat(2.0),
            axis: Vec3::Z,
            speed: std::f32::consts::FRAC_PI_2,
        };
        let model = spin.model(1.0);
        assert!(model.transform_point3(Vec3::ZERO).abs_diff_eq(spin.position, 1e-6));
        let x = model.transform_vector3(Vec3::X);
        assert!(x.abs_diff_eq(Vec3::new(0.0, 2.0, 0.0), 1e-5), "{:?}", x);
    }

    #[test]
    fn slot_files_and_formats() {
        let stems = MaterialSlot::ALL.map(slot_file_stem);
        assert_eq!(stems, ["albedo", "normal", "metallic", "roughness", "ao"]);
        assert_eq!(slot_format(MaterialSlot::Albedo), vk::Format::R8G8B8A8_SRGB);
        assert_eq!(slot_format(MaterialSlot::Roughness), vk::Format::R8G8B8A8_UNORM);
    }

    #[test]
    fn demo_fits_default_material_pool() {
        assert!(MATERIALS.len() as u32 <= RenderConfig::default().max_materials);
    }
}
