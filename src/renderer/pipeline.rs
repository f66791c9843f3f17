use crate::renderer::buffer::Buffer;
use crate::renderer::descriptor::{DescriptorAshDevice, DescriptorSetLayoutBuilder};
use crate::renderer::device::{RenderDevice, SharedDescriptorAllocator};
use crate::renderer::shader::GraphicsShader;
use crate::renderer::shader_data::MAX_PUSH_CONSTANT_SIZE;
use crate::renderer::vertex::{VertexInputDescription, VertexLayout};
use ash::vk;
use bytemuck::Pod;
use color_eyre::Result;
use color_eyre::eyre::{OptionExt, eyre};
use gpu_allocator::MemoryLocation;
use gpu_descriptor::{DescriptorSet, DescriptorSetLayoutCreateFlags, DescriptorTotalCount};
use std::sync::Arc;

/// Set index of the per-frame uniform buffer
pub const FRAME_SET: u32 = 0;
/// Set index of an optional externally owned layout, e.g. material textures
pub const EXTERNAL_SET: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendMode {
    Disabled,
    Alpha,
}

/// Fixed-function state that differs between pipeline kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSettings {
    pub topology: vk::PrimitiveTopology,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_compare: vk::CompareOp,
    pub blend: BlendMode,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            // Meshes wind counter-clockwise; the Y flip in the projection keeps that on screen
            cull_mode: vk::CullModeFlags::BACK,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            depth_test: true,
            depth_write: true,
            depth_compare: vk::CompareOp::LESS_OR_EQUAL,
            blend: BlendMode::Disabled,
        }
    }
}

pub fn push_constant_range(size: u32) -> Result<Option<vk::PushConstantRange>> {
    if size as usize > MAX_PUSH_CONSTANT_SIZE {
        return Err(eyre!(
            "Push constant block of {} bytes exceeds the portable limit of {} bytes",
            size,
            MAX_PUSH_CONSTANT_SIZE
        ));
    }
    Ok((size > 0).then(|| vk::PushConstantRange {
        stage_flags: vk::ShaderStageFlags::VERTEX,
        offset: 0,
        size,
    }))
}

pub fn rasterization_state(settings: &PipelineSettings) -> vk::PipelineRasterizationStateCreateInfo<'static> {
    vk::PipelineRasterizationStateCreateInfo::default()
        .depth_clamp_enable(false)
        // Discards all primitives before rasterization stage if true
        .rasterizer_discard_enable(false)
        .polygon_mode(settings.polygon_mode)
        .line_width(1.0)
        .cull_mode(settings.cull_mode)
        .front_face(settings.front_face)
        .depth_bias_enable(false)
}

pub fn depth_stencil_state(settings: &PipelineSettings) -> vk::PipelineDepthStencilStateCreateInfo<'static> {
    vk::PipelineDepthStencilStateCreateInfo::default()
        .depth_test_enable(settings.depth_test)
        .depth_write_enable(settings.depth_test && settings.depth_write)
        .depth_compare_op(if settings.depth_test {
            settings.depth_compare
        } else {
            vk::CompareOp::ALWAYS
        })
        .depth_bounds_test_enable(false)
        .min_depth_bounds(0.0)
        .max_depth_bounds(1.0)
        .stencil_test_enable(false)
}

pub fn color_blend_attachment(blend: BlendMode) -> vk::PipelineColorBlendAttachmentState {
    let state = vk::PipelineColorBlendAttachmentState::default()
        .color_write_mask(vk::ColorComponentFlags::RGBA);
    match blend {
        BlendMode::Disabled => state.blend_enable(false),
        // Make sure the transparent object is rendered AFTER the opaque ones
        BlendMode::Alpha => state
            .blend_enable(true)
            .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
            .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
            .alpha_blend_op(vk::BlendOp::ADD),
    }
}

/// Viewport covering `extent` with the full depth range, and the matching scissor
pub fn full_viewport(extent: vk::Extent2D) -> (vk::Viewport, vk::Rect2D) {
    (
        vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        },
        vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        },
    )
}

pub struct GraphicsPipelineBuilder {
    name: String,
    render_pass: vk::RenderPass,
    shader: Option<GraphicsShader>,
    vertex_input: Option<VertexInputDescription>,
    settings: PipelineSettings,
    ubo_size: u64,
    push_constant_size: u32,
    external_layout: Option<vk::DescriptorSetLayout>,
}

impl GraphicsPipelineBuilder {
    pub fn new(name: &str, render_pass: vk::RenderPass) -> Self {
        Self {
            name: name.to_string(),
            render_pass,
            shader: None,
            vertex_input: None,
            settings: PipelineSettings::default(),
            ubo_size: 0,
            push_constant_size: 0,
            external_layout: None,
        }
    }

    pub fn with_shader(mut self, shader: GraphicsShader) -> Self {
        let _ = self.shader.replace(shader);
        self
    }

    pub fn with_vertex<V: VertexLayout>(mut self) -> Self {
        self.vertex_input = Some(V::description());
        self
    }

    pub fn with_cull_mode(mut self, cull_mode: vk::CullModeFlags, front_face: vk::FrontFace) -> Self {
        self.settings.cull_mode = cull_mode;
        self.settings.front_face = front_face;
        self
    }

    pub fn with_depth(mut self, test: bool, write: bool) -> Self {
        self.settings.depth_test = test;
        self.settings.depth_write = write;
        self
    }

    pub fn with_blending(mut self, blend: BlendMode) -> Self {
        self.settings.blend = blend;
        self
    }

    pub fn with_uniform<U: Pod>(mut self) -> Self {
        self.ubo_size = size_of::<U>() as u64;
        self
    }

    pub fn with_push_constant<P: Pod>(mut self) -> Self {
        self.push_constant_size = size_of::<P>() as u32;
        self
    }

    /// Layout bound at set 1; the caller keeps it alive for as long as the pipeline
    pub fn with_external_layout(mut self, layout: vk::DescriptorSetLayout) -> Self {
        self.external_layout = Some(layout);
        self
    }

    pub fn build(mut self, dev: &RenderDevice, image_count: u32) -> Result<Pipeline> {
        let device = dev.logical.clone();

        let shader = self
            .shader
            .take()
            .ok_or_eyre(format!("No shader provided for pipeline '{}'", self.name))?;
        let vertex_input = self
            .vertex_input
            .take()
            .ok_or_eyre(format!("No vertex layout provided for pipeline '{}'", self.name))?;
        if self.ubo_size == 0 {
            return Err(eyre!("Pipeline '{}' needs a per-frame uniform type", self.name));
        }
        let push_constant = push_constant_range(self.push_constant_size)?;

        let ubo_layout_builder = DescriptorSetLayoutBuilder::new().add_binding(
            0,
            vk::DescriptorType::UNIFORM_BUFFER,
            1,
            vk::ShaderStageFlags::VERTEX,
        );
        let ubo_layout = ubo_layout_builder.build(vk::DescriptorSetLayoutCreateFlags::empty(), &device)?;

        // From here on, `Pipeline` owns the handles and cleans up on any later error
        let mut pipeline = Pipeline {
            name: self.name.clone(),
            pipeline: vk::Pipeline::null(),
            layout: vk::PipelineLayout::null(),
            ubo_layout,
            ubo_total_count: ubo_layout_builder.total_count(),
            ubo_size: self.ubo_size,
            push_constant_size: self.push_constant_size,
            uniforms: Vec::new(),
            descriptor_allocator: dev.descriptor_allocator(),
            device,
        };

        let mut set_layouts = vec![ubo_layout];
        if let Some(external) = self.external_layout {
            set_layouts.push(external);
        }
        let push_constant_ranges = push_constant.into_iter().collect::<Vec<_>>();
        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&push_constant_ranges);
        pipeline.layout = unsafe { pipeline.device.create_pipeline_layout(&layout_info, None)? };

        pipeline.pipeline = self.create_pipeline(&pipeline.device, &shader, &vertex_input, pipeline.layout)?;
        pipeline.resize_uniforms(dev, image_count)?;

        log::debug!(
            "Created pipeline '{}' ({} uniform sets, {} push constant bytes)",
            pipeline.name,
            image_count,
            pipeline.push_constant_size
        );
        Ok(pipeline)
    }

    fn create_pipeline(
        &self,
        device: &ash::Device,
        shader: &GraphicsShader,
        vertex_input: &VertexInputDescription,
        layout: vk::PipelineLayout,
    ) -> Result<vk::Pipeline> {
        let entry_point = c"main";
        let shader_stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(shader.vert_mod)
                .name(entry_point),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(shader.frag_mod)
                .name(entry_point),
        ];

        let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&vertex_input.bindings)
            .vertex_attribute_descriptions(&vertex_input.attributes);
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(self.settings.topology)
            .primitive_restart_enable(false);
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);
        let rasterization = rasterization_state(&self.settings);
        let multisample = vk::PipelineMultisampleStateCreateInfo::default()
            .sample_shading_enable(false)
            // 1 sample per pixel means no multisampling
            .rasterization_samples(vk::SampleCountFlags::TYPE_1)
            .min_sample_shading(1.0);
        let depth_stencil = depth_stencil_state(&self.settings);
        let blend_attachments = [color_blend_attachment(self.settings.blend)];
        let color_blend = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .logic_op(vk::LogicOp::COPY)
            .attachments(&blend_attachments);

        // Use dynamic state for viewport and scissor configuration
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_info = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input_info)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic_info)
            .layout(layout)
            .render_pass(self.render_pass)
            .subpass(0);

        let pipelines = unsafe {
            device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
                .map_err(|(_, e)| eyre!("Failed to create graphics pipeline '{}': {}", self.name, e))?
        };
        pipelines.into_iter().next().ok_or_eyre("Driver returned no pipeline")
    }
}

/// Persistently mapped uniform buffer of one swapchain image and the set pointing at it
struct FrameUniform {
    buffer: Buffer,
    set: DescriptorSet<vk::DescriptorSet>,
}

pub struct Pipeline {
    name: String,
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
    ubo_layout: vk::DescriptorSetLayout,
    ubo_total_count: DescriptorTotalCount,
    ubo_size: u64,
    push_constant_size: u32,
    uniforms: Vec<FrameUniform>,
    descriptor_allocator: SharedDescriptorAllocator,
    device: Arc<ash::Device>,
}

impl Pipeline {
    /// Binds the pipeline, sets viewport and scissor to `extent` and binds the uniform set of `image_index`
    pub fn bind(&self, cmd: vk::CommandBuffer, image_index: u32, extent: vk::Extent2D) -> Result<()> {
        let uniform = self.uniform(image_index)?;
        let (viewport, scissor) = full_viewport(extent);
        unsafe {
            self.device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.pipeline);
            self.device.cmd_set_viewport(cmd, 0, &[viewport]);
            self.device.cmd_set_scissor(cmd, 0, &[scissor]);
            self.device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.layout,
                FRAME_SET,
                &[*uniform.set.raw()],
                &[],
            );
        }
        Ok(())
    }

    /// Binds an externally allocated set, e.g. a material, at `set_index`
    pub fn bind_set(&self, cmd: vk::CommandBuffer, set_index: u32, set: vk::DescriptorSet) {
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.layout,
                set_index,
                &[set],
                &[],
            );
        }
    }

    /// Copies `data` into the mapped uniform buffer of `image_index`.
    /// Only safe once the fence of the frame that last read it has been waited on.
    pub fn update_ubo<T: Pod>(&mut self, image_index: u32, data: &T) -> Result<()> {
        check_fits("Uniform", size_of::<T>() as u64, self.ubo_size)?;
        let uniform = self.uniform_mut(image_index)?;
        uniform.buffer.upload(std::slice::from_ref(data))
    }

    pub fn update_push_constant<T: Pod>(&self, cmd: vk::CommandBuffer, data: &T) -> Result<()> {
        check_fits("Push constant", size_of::<T>() as u64, self.push_constant_size as u64)?;
        unsafe {
            self.device.cmd_push_constants(
                cmd,
                self.layout,
                vk::ShaderStageFlags::VERTEX,
                0,
                bytemuck::bytes_of(data),
            );
        }
        Ok(())
    }

    /// Recreates one uniform buffer and set per swapchain image.
    /// The device has to be idle, no set may still be in use.
    pub fn resize_uniforms(&mut self, dev: &RenderDevice, image_count: u32) -> Result<()> {
        if image_count as usize == self.uniforms.len() {
            return Ok(());
        }
        self.free_uniforms();

        let sets = {
            let mut allocator = self
                .descriptor_allocator
                .lock()
                .map_err(|e| eyre!(e.to_string()))?;
            unsafe {
                allocator.allocate(
                    &DescriptorAshDevice::from(self.device.clone()),
                    &self.ubo_layout,
                    DescriptorSetLayoutCreateFlags::empty(),
                    &self.ubo_total_count,
                    image_count,
                )?
            }
        };

        let device = &self.device;
        let ubo_size = self.ubo_size;
        let name = &self.name;
        let uniforms = build_per_set(
            sets,
            |i, set| {
                let mut buffer = Buffer::new(
                    dev,
                    ubo_size,
                    vk::BufferUsageFlags::UNIFORM_BUFFER,
                    MemoryLocation::CpuToGpu,
                    &format!("{} uniforms #{}", name, i),
                )?;
                buffer.map()?;

                let buffer_info = [vk::DescriptorBufferInfo {
                    buffer: buffer.buffer,
                    offset: 0,
                    range: ubo_size,
                }];
                let write = vk::WriteDescriptorSet::default()
                    .dst_set(*set.raw())
                    .dst_binding(0)
                    .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                    .buffer_info(&buffer_info);
                unsafe { device.update_descriptor_sets(&[write], &[]) };
                Ok(buffer)
            },
            |sets| self.free_sets(sets),
        )?;

        self.uniforms = uniforms
            .into_iter()
            .map(|(buffer, set)| FrameUniform { buffer, set })
            .collect();
        Ok(())
    }

    fn uniform(&self, image_index: u32) -> Result<&FrameUniform> {
        let count = self.uniforms.len();
        self.uniforms
            .get(image_index as usize)
            .ok_or_eyre(format!("Image index {} out of range for {} uniform sets", image_index, count))
    }

    fn uniform_mut(&mut self, image_index: u32) -> Result<&mut FrameUniform> {
        let count = self.uniforms.len();
        self.uniforms
            .get_mut(image_index as usize)
            .ok_or_eyre(format!("Image index {} out of range for {} uniform sets", image_index, count))
    }

    fn free_uniforms(&mut self) {
        let sets = self.uniforms.drain(..).map(|uniform| uniform.set).collect::<Vec<_>>();
        self.free_sets(sets);
    }

    fn free_sets(&self, sets: impl IntoIterator<Item = DescriptorSet<vk::DescriptorSet>>) {
        match self.descriptor_allocator.lock() {
            Ok(mut allocator) => unsafe {
                allocator.free(&DescriptorAshDevice::from(self.device.clone()), sets);
            },
            Err(e) => log::error!("Descriptor allocator poisoned: {e}"),
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.free_uniforms();
        unsafe {
            if self.pipeline != vk::Pipeline::null() {
                self.device.destroy_pipeline(self.pipeline, None);
            }
            if self.layout != vk::PipelineLayout::null() {
                self.device.destroy_pipeline_layout(self.layout, None);
            }
            self.device.destroy_descriptor_set_layout(self.ubo_layout, None);
        }
    }
}

/// Builds one resource per set. If any build fails, the finished resources are dropped
/// and every set is handed to `release`.
fn build_per_set<S, B>(
    sets: Vec<S>,
    mut build: impl FnMut(usize, &S) -> Result<B>,
    release: impl FnOnce(Vec<S>),
) -> Result<Vec<(B, S)>> {
    let built = sets
        .iter()
        .enumerate()
        .map(|(i, set)| build(i, set))
        .collect::<Result<Vec<_>>>();
    match built {
        Ok(built) => Ok(built.into_iter().zip(sets).collect()),
        Err(e) => {
            release(sets);
            Err(e)
        }
    }
}

fn check_fits(what: &str, size: u64, capacity: u64) -> Result<()> {
    if size > capacity {
        return Err(eyre!("{} data of {} bytes does not fit into {} bytes", what, size, capacity));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::shader_data::MeshPushConstants;

    #[test]
    fn push_constants_are_capped_at_128_bytes() {
        let range = push_constant_range(size_of::<MeshPushConstants>() as u32).unwrap().unwrap();
        assert_eq!(range.size, 64);
        assert_eq!(range.offset, 0);
        assert_eq!(range.stage_flags, vk::ShaderStageFlags::VERTEX);

        assert!(push_constant_range(128).unwrap().is_some());
        assert!(push_constant_range(129).is_err());
        assert!(push_constant_range(0).unwrap().is_none());
    }

    #[test]
    fn default_settings_cull_back_faces_with_depth_and_no_blend() {
        let settings = PipelineSettings::default();

        let raster = rasterization_state(&settings);
        assert_eq!(raster.cull_mode, vk::CullModeFlags::BACK);
        assert_eq!(raster.front_face, vk::FrontFace::COUNTER_CLOCKWISE);
        assert_eq!(raster.polygon_mode, vk::PolygonMode::FILL);

        let depth = depth_stencil_state(&settings);
        assert_eq!(depth.depth_test_enable, vk::TRUE);
        assert_eq!(depth.depth_write_enable, vk::TRUE);
        assert_eq!(depth.depth_compare_op, vk::CompareOp::LESS_OR_EQUAL);

        let blend = color_blend_attachment(settings.blend);
        assert_eq!(blend.blend_enable, vk::FALSE);
        assert_eq!(blend.color_write_mask, vk::ColorComponentFlags::RGBA);
    }

    #[test]
    fn disabling_depth_test_also_disables_writes() {
        let settings = PipelineSettings {
            depth_test: false,
            depth_write: true,
            ..Default::default()
        };
        let depth = depth_stencil_state(&settings);
        assert_eq!(depth.depth_test_enable, vk::FALSE);
        assert_eq!(depth.depth_write_enable, vk::FALSE);
        assert_eq!(depth.depth_compare_op, vk::CompareOp::ALWAYS);
    }

    #[test]
    fn alpha_blending_uses_source_alpha() {
        let blend = color_blend_attachment(BlendMode::Alpha);
        assert_eq!(blend.blend_enable, vk::TRUE);
        assert_eq!(blend.src_color_blend_factor, vk::BlendFactor::SRC_ALPHA);
        assert_eq!(blend.dst_color_blend_factor, vk::BlendFactor::ONE_MINUS_SRC_ALPHA);
    }

    #[test]
    fn viewport_covers_extent() {
        let (viewport, scissor) = full_viewport(vk::Extent2D { width: 800, height: 600 });
        assert_eq!((viewport.width, viewport.height), (800.0, 600.0));
        assert_eq!((viewport.min_depth, viewport.max_depth), (0.0, 1.0));
        assert_eq!(scissor.extent.width, 800);
        assert_eq!(scissor.offset.x, 0);
    }

    /// Counts drops, standing in for a uniform buffer
    struct Tracked<'a>(&'a std::cell::Cell<usize>);

    impl Drop for Tracked<'_> {
        fn drop(&mut self) {
            self.0.set(self.0.get() + 1);
        }
    }

    #[test]
    fn failed_uniform_build_releases_every_set() {
        let dropped = std::cell::Cell::new(0);
        let mut released = Vec::new();

        let result = build_per_set(
            vec![10, 11, 12, 13],
            |i, _| {
                if i == 2 {
                    Err(eyre!("Out of device memory"))
                } else {
                    Ok(Tracked(&dropped))
                }
            },
            |sets| released = sets,
        );

        assert!(result.is_err());
        assert_eq!(released, vec![10, 11, 12, 13]);
        assert_eq!(dropped.get(), 2);
    }

    #[test]
    fn uniform_build_pairs_resources_with_sets() {
        let mut released = false;
        let pairs = build_per_set(vec!['a', 'b', 'c'], |i, set| Ok((i, *set)), |_| released = true).unwrap();

        assert!(!released);
        assert_eq!(pairs, vec![((0, 'a'), 'a'), ((1, 'b'), 'b'), ((2, 'c'), 'c')]);
    }

    #[test]
    fn oversized_writes_are_rejected() {
        assert!(check_fits("Uniform", 128, 128).is_ok());
        assert!(check_fits("Uniform", 129, 128).is_err());
    }
}
