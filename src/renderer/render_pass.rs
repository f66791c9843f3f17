use ash::vk;
use color_eyre::Result;
use std::sync::Arc;

pub const DEPTH_FORMAT_CANDIDATES: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
];

pub fn has_stencil_component(format: vk::Format) -> bool {
    matches!(format, vk::Format::D32_SFLOAT_S8_UINT | vk::Format::D24_UNORM_S8_UINT)
}

/// Black color and a depth of 1.0, in attachment order.
pub fn clear_values() -> [vk::ClearValue; 2] {
    [
        vk::ClearValue {
            color: vk::ClearColorValue {
                float32: [0.0, 0.0, 0.0, 1.0],
            },
        },
        vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue {
                depth: 1.0,
                stencil: 0,
            },
        },
    ]
}

/// Color is cleared, kept and handed to the presentation engine. Depth is cleared and discarded.
pub fn attachment_descriptions(
    color_format: vk::Format,
    depth_format: vk::Format,
) -> [vk::AttachmentDescription; 2] {
    [
        vk::AttachmentDescription::default()
            .format(color_format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::PRESENT_SRC_KHR),
        vk::AttachmentDescription::default()
            .format(depth_format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::DONT_CARE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL),
    ]
}

/// Waits for the acquired image and the previous depth writes before touching either attachment.
pub fn external_dependency() -> vk::SubpassDependency {
    let stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
        | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS;
    vk::SubpassDependency::default()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(stages)
        .src_access_mask(vk::AccessFlags::empty())
        .dst_stage_mask(stages)
        .dst_access_mask(
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        )
}

pub struct RenderPass {
    pub render_pass: vk::RenderPass,
    pub color_format: vk::Format,
    pub depth_format: vk::Format,
    device: Arc<ash::Device>,
}

impl RenderPass {
    pub fn new(
        device: Arc<ash::Device>,
        color_format: vk::Format,
        depth_format: vk::Format,
    ) -> Result<Self> {
        let attachments = attachment_descriptions(color_format, depth_format);

        let color_refs = [vk::AttachmentReference {
            attachment: 0,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        }];
        let depth_ref = vk::AttachmentReference {
            attachment: 1,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        };
        let subpasses = [vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs)
            .depth_stencil_attachment(&depth_ref)];
        let dependencies = [external_dependency()];

        let render_pass_info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);

        let render_pass = unsafe {
            device.create_render_pass(&render_pass_info, None)?
        };

        Ok(Self {
            render_pass,
            color_format,
            depth_format,
            device,
        })
    }

    pub fn begin(
        &self,
        cmd: vk::CommandBuffer,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
    ) {
        let clear_values = clear_values();
        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(self.render_pass)
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            })
            .clear_values(&clear_values);

        unsafe {
            self.device.cmd_begin_render_pass(cmd, &begin_info, vk::SubpassContents::INLINE);
        }
    }

    pub fn end(&self, cmd: vk::CommandBuffer) {
        unsafe {
            self.device.cmd_end_render_pass(cmd);
        }
    }

    /// One framebuffer per swapchain view, all sharing the single depth view.
    pub fn create_framebuffers(
        &self,
        color_views: &[vk::ImageView],
        depth_view: vk::ImageView,
        extent: vk::Extent2D,
    ) -> Result<Framebuffers> {
        // Partially built sets are destroyed by `Framebuffers::drop` on the early return
        let mut framebuffers = Framebuffers {
            handles: Vec::with_capacity(color_views.len()),
            device: self.device.clone(),
        };
        for &view in color_views {
            let attachments = [view, depth_view];
            let framebuffer_info = vk::FramebufferCreateInfo::default()
                .render_pass(self.render_pass)
                .attachments(&attachments)
                .width(extent.width)
                .height(extent.height)
                .layers(1);

            let framebuffer = unsafe { self.device.create_framebuffer(&framebuffer_info, None)? };
            framebuffers.handles.push(framebuffer);
        }
        Ok(framebuffers)
    }
}

/// The framebuffers of one swapchain, indexed by image
pub struct Framebuffers {
    handles: Vec<vk::Framebuffer>,
    device: Arc<ash::Device>,
}

impl Framebuffers {
    pub fn get(&self, image_index: u32) -> Option<vk::Framebuffer> {
        self.handles.get(image_index as usize).copied()
    }
}

impl Drop for Framebuffers {
    fn drop(&mut self) {
        for framebuffer in self.handles.drain(..) {
            unsafe {
                self.device.destroy_framebuffer(framebuffer, None);
            }
        }
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_render_pass(self.render_pass, None);
        }
    }
}
