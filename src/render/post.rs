// Post pass - tonemap the converged HDR image onto the swapchain
//
// Full-screen draw of three vertices with no vertex or index buffers bound;
// the vertex shader synthesizes positions from gl_VertexIndex. This is also
// where the frame leaves the engine: the render pass ends in PRESENT_SRC.

use anyhow::{Context, Result};
use ash::vk;
use crate::backend::descriptor::{BindingDesc, DescriptorBundle};
use crate::backend::resource::ImageResource;
use crate::backend::{shader, VulkanDevice};
use super::raster::full_viewport;

pub struct PostPass {
    pub render_pass: vk::RenderPass,
    pub framebuffers: Vec<vk::Framebuffer>,
    pub descriptors: DescriptorBundle,
    pipeline_layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,
}

impl PostPass {
    pub fn new(
        device: &VulkanDevice,
        swapchain_format: vk::Format,
        depth_format: vk::Format,
        swapchain_views: &[vk::ImageView],
        depth_view: vk::ImageView,
        extent: vk::Extent2D,
    ) -> Result<Self> {
        let render_pass = Self::create_render_pass(device, swapchain_format, depth_format)?;
        let framebuffers =
            create_framebuffers(device, render_pass, swapchain_views, depth_view, extent)?;

        let descriptors = DescriptorBundle::new(
            device,
            &[BindingDesc::new(
                0,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                vk::ShaderStageFlags::FRAGMENT,
            )],
            1,
        )?;

        let set_layouts = [descriptors.layout];
        let layout_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(&set_layouts);
        let pipeline_layout = unsafe { device.device.create_pipeline_layout(&layout_info, None) }
            .context("Failed to create post pipeline layout")?;

        let vert = shader::load_module(device, "spv/post.vert.spv")?;
        let frag = shader::load_module(device, "spv/post.frag.spv")?;

        let pipeline = Self::create_pipeline(device, render_pass, pipeline_layout, vert, frag);

        unsafe {
            device.device.destroy_shader_module(vert, None);
            device.device.destroy_shader_module(frag, None);
        }

        Ok(Self {
            render_pass,
            framebuffers,
            descriptors,
            pipeline_layout,
            pipeline: pipeline?,
        })
    }

    fn create_render_pass(
        device: &VulkanDevice,
        color_format: vk::Format,
        depth_format: vk::Format,
    ) -> Result<vk::RenderPass> {
        let color_attachment = vk::AttachmentDescription::builder()
            .format(color_format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
            .build();

        let depth_attachment = vk::AttachmentDescription::builder()
            .format(depth_format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::DONT_CARE)
            .stencil_load_op(vk::AttachmentLoadOp::CLEAR)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
            .build();

        let color_reference = vk::AttachmentReference::builder()
            .attachment(0)
            .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .build();
        let depth_reference = vk::AttachmentReference::builder()
            .attachment(1)
            .layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
            .build();

        // External dependency: the HDR image must be fully written (raster
        // store or transfer copy) before the fragment shader samples it
        let dependency = vk::SubpassDependency::builder()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(vk::PipelineStageFlags::BOTTOM_OF_PIPE)
            .src_access_mask(vk::AccessFlags::MEMORY_READ)
            .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .dst_access_mask(
                vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            )
            .dependency_flags(vk::DependencyFlags::BY_REGION)
            .build();

        let color_attachments = &[color_reference];
        let subpass = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(color_attachments)
            .depth_stencil_attachment(&depth_reference)
            .build();

        let attachments = &[color_attachment, depth_attachment];
        let subpasses = &[subpass];
        let dependencies = &[dependency];

        let render_pass_info = vk::RenderPassCreateInfo::builder()
            .attachments(attachments)
            .subpasses(subpasses)
            .dependencies(dependencies);

        unsafe {
            device
                .device
                .create_render_pass(&render_pass_info, None)
                .context("Failed to create post render pass")
        }
    }

    fn create_pipeline(
        device: &VulkanDevice,
        render_pass: vk::RenderPass,
        pipeline_layout: vk::PipelineLayout,
        vert_shader: vk::ShaderModule,
        frag_shader: vk::ShaderModule,
    ) -> Result<vk::Pipeline> {
        let shader_stages = [
            shader::stage_info(vert_shader, vk::ShaderStageFlags::VERTEX),
            shader::stage_info(frag_shader, vk::ShaderStageFlags::FRAGMENT),
        ];

        // No geometry in this pipeline's draw
        let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::builder();

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .primitive_restart_enable(false);

        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0)
            .cull_mode(vk::CullModeFlags::NONE)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .depth_bias_enable(false);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
            .sample_shading_enable(false)
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(true)
            .depth_write_enable(true)
            .depth_compare_op(vk::CompareOp::LESS_OR_EQUAL)
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false);

        let color_blend_attachment = vk::PipelineColorBlendAttachmentState::builder()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(false)
            .build();
        let color_blend_attachments = &[color_blend_attachment];
        let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
            .logic_op_enable(false)
            .attachments(color_blend_attachments);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input_info)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(pipeline_layout)
            .render_pass(render_pass)
            .subpass(0)
            .build();

        let pipelines = unsafe {
            device
                .device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
                .map_err(|(_, e)| e)
                .context("Failed to create post pipeline")?
        };

        Ok(pipelines[0])
    }

    /// Bind the HDR image the pass samples. Rewritten after resize.
    pub fn update_input_image(&self, device: &VulkanDevice, image: &ImageResource) {
        self.descriptors.write_image(
            device,
            0,
            0,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            image.descriptor_info(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL),
        );
    }

    pub fn record(
        &self,
        device: &VulkanDevice,
        cmd: vk::CommandBuffer,
        image_index: u32,
        extent: vk::Extent2D,
    ) {
        let clear_values = [
            vk::ClearValue { color: vk::ClearColorValue { float32: [1.0, 1.0, 1.0, 1.0] } },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue { depth: 1.0, stencil: 0 },
            },
        ];

        let begin_info = vk::RenderPassBeginInfo::builder()
            .render_pass(self.render_pass)
            .framebuffer(self.framebuffers[image_index as usize])
            .render_area(vk::Rect2D { offset: vk::Offset2D { x: 0, y: 0 }, extent })
            .clear_values(&clear_values);

        unsafe {
            let d = &device.device;
            d.cmd_begin_render_pass(cmd, &begin_info, vk::SubpassContents::INLINE);
            d.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.pipeline);
            d.cmd_set_viewport(cmd, 0, &[full_viewport(extent)]);
            d.cmd_set_scissor(
                cmd,
                0,
                &[vk::Rect2D { offset: vk::Offset2D { x: 0, y: 0 }, extent }],
            );
            d.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipeline_layout,
                0,
                &[self.descriptors.sets[0]],
                &[],
            );
            // Three vertices, no buffers: positions come from gl_VertexIndex
            d.cmd_draw(cmd, 3, 1, 0, 0);
            d.cmd_end_render_pass(cmd);
        }
    }

    /// Swapchain images changed; the framebuffers follow them.
    pub fn rebuild_framebuffers(
        &mut self,
        device: &VulkanDevice,
        swapchain_views: &[vk::ImageView],
        depth_view: vk::ImageView,
        extent: vk::Extent2D,
    ) -> Result<()> {
        for framebuffer in self.framebuffers.drain(..) {
            unsafe { device.device.destroy_framebuffer(framebuffer, None) };
        }
        self.framebuffers =
            create_framebuffers(device, self.render_pass, swapchain_views, depth_view, extent)?;
        Ok(())
    }

    pub fn destroy(&mut self, device: &VulkanDevice) {
        unsafe {
            device.device.destroy_pipeline(self.pipeline, None);
            device.device.destroy_pipeline_layout(self.pipeline_layout, None);
            for framebuffer in self.framebuffers.drain(..) {
                device.device.destroy_framebuffer(framebuffer, None);
            }
            device.device.destroy_render_pass(self.render_pass, None);
        }
        self.descriptors.destroy(device);
    }
}

/// One framebuffer per swapchain image, all sharing the depth attachment.
fn create_framebuffers(
    device: &VulkanDevice,
    render_pass: vk::RenderPass,
    swapchain_views: &[vk::ImageView],
    depth_view: vk::ImageView,
    extent: vk::Extent2D,
) -> Result<Vec<vk::Framebuffer>> {
    swapchain_views
        .iter()
        .map(|&view| {
            let attachments = [view, depth_view];
            let framebuffer_info = vk::FramebufferCreateInfo::builder()
                .render_pass(render_pass)
                .attachments(&attachments)
                .width(extent.width)
                .height(extent.height)
                .layers(1);

            unsafe {
                device
                    .device
                    .create_framebuffer(&framebuffer_info, None)
                    .context("Failed to create post framebuffer")
            }
        })
        .collect()
}
