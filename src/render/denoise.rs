// Denoise pass - edge-aware a-trous filter over the ray-traced color
//
// One compute pipeline, dispatched several times with doubling step width.
// Each dispatch is stateless; the color ping-pongs between two storage
// images through a pair of prebuilt descriptor sets.

use anyhow::{Context, Result};
use ash::vk;
use crate::backend::descriptor::{BindingDesc, DescriptorBundle};
use crate::backend::resource::ImageResource;
use crate::backend::{shader, VulkanDevice};
use super::uniforms::PushConstantDenoise;

/// Workgroup edge length; must match the shader's local_size.
pub const GROUP_SIZE: u32 = 16;

/// Where the filtered result lives after `passes` dispatches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DenoiseOutput {
    /// Odd pass count: the dedicated denoise image holds the result
    Filtered,
    /// Even pass count: the result bounced back into the ray color image
    RayColor,
}

pub fn output_after(passes: u32) -> DenoiseOutput {
    if passes % 2 == 1 {
        DenoiseOutput::Filtered
    } else {
        DenoiseOutput::RayColor
    }
}

pub fn dispatch_counts(extent: vk::Extent2D) -> (u32, u32) {
    (
        (extent.width + GROUP_SIZE - 1) / GROUP_SIZE,
        (extent.height + GROUP_SIZE - 1) / GROUP_SIZE,
    )
}

pub struct DenoisePass {
    descriptors: DescriptorBundle, // set 0: color -> filtered, set 1: filtered -> color
    pipeline_layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,
    pub norm_factor: f32,
    pub depth_factor: f32,
}

impl DenoisePass {
    pub fn new(device: &VulkanDevice) -> Result<Self> {
        let compute = vk::ShaderStageFlags::COMPUTE;
        let descriptors = DescriptorBundle::new(
            device,
            &[
                BindingDesc::new(0, vk::DescriptorType::STORAGE_IMAGE, compute), // source color
                BindingDesc::new(1, vk::DescriptorType::STORAGE_IMAGE, compute), // normal-depth
                BindingDesc::new(2, vk::DescriptorType::STORAGE_IMAGE, compute), // destination
            ],
            2,
        )?;

        let set_layouts = [descriptors.layout];
        let push_constant_range = vk::PushConstantRange::builder()
            .stage_flags(compute)
            .offset(0)
            .size(std::mem::size_of::<PushConstantDenoise>() as u32)
            .build();
        let push_constant_ranges = [push_constant_range];

        let layout_info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&push_constant_ranges);
        let pipeline_layout = unsafe { device.device.create_pipeline_layout(&layout_info, None) }
            .context("Failed to create denoise pipeline layout")?;

        let module = shader::load_module(device, "spv/denoise.comp.spv")?;
        let stage = shader::stage_info(module, compute);

        let pipeline_info = vk::ComputePipelineCreateInfo::builder()
            .stage(stage)
            .layout(pipeline_layout)
            .build();

        let pipeline = unsafe {
            device
                .device
                .create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
                .map_err(|(_, e)| e)
        };

        unsafe { device.device.destroy_shader_module(module, None) };

        let pipeline = pipeline.context("Failed to create denoise pipeline")?[0];

        Ok(Self {
            descriptors,
            pipeline_layout,
            pipeline,
            norm_factor: 0.02,
            depth_factor: 0.01,
        })
    }

    /// Rewire both ping-pong sets. Called at startup and after resize.
    pub fn update_descriptors(
        &self,
        device: &VulkanDevice,
        ray_color: &ImageResource,
        normal_depth: &ImageResource,
        filtered: &ImageResource,
    ) {
        let general = vk::ImageLayout::GENERAL;
        let writes: [(usize, &ImageResource, &ImageResource); 2] = [
            (0, ray_color, filtered), // set 0 reads color, writes filtered
            (1, filtered, ray_color), // set 1 reads filtered, writes color
        ];
        for (set, src, dst) in writes {
            self.descriptors.write_image(
                device,
                set,
                0,
                vk::DescriptorType::STORAGE_IMAGE,
                src.descriptor_info(general),
            );
            self.descriptors.write_image(
                device,
                set,
                1,
                vk::DescriptorType::STORAGE_IMAGE,
                normal_depth.descriptor_info(general),
            );
            self.descriptors.write_image(
                device,
                set,
                2,
                vk::DescriptorType::STORAGE_IMAGE,
                dst.descriptor_info(general),
            );
        }
    }

    /// Record `passes` dispatches with step widths 1, 2, 4, ... Compute-to-
    /// compute barriers order each iteration's writes before the next reads.
    pub fn record(
        &self,
        device: &VulkanDevice,
        cmd: vk::CommandBuffer,
        extent: vk::Extent2D,
        passes: u32,
    ) {
        let (groups_x, groups_y) = dispatch_counts(extent);

        unsafe {
            let d = &device.device;
            d.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, self.pipeline);

            for i in 0..passes {
                let push = PushConstantDenoise {
                    norm_factor: self.norm_factor,
                    depth_factor: self.depth_factor,
                    stepwidth: 1 << i,
                };
                d.cmd_bind_descriptor_sets(
                    cmd,
                    vk::PipelineBindPoint::COMPUTE,
                    self.pipeline_layout,
                    0,
                    &[self.descriptors.sets[(i % 2) as usize]],
                    &[],
                );
                d.cmd_push_constants(
                    cmd,
                    self.pipeline_layout,
                    vk::ShaderStageFlags::COMPUTE,
                    0,
                    bytemuck::bytes_of(&push),
                );
                d.cmd_dispatch(cmd, groups_x, groups_y, 1);

                let barrier = vk::MemoryBarrier::builder()
                    .src_access_mask(vk::AccessFlags::SHADER_WRITE)
                    .dst_access_mask(vk::AccessFlags::SHADER_READ)
                    .build();
                d.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::COMPUTE_SHADER,
                    vk::PipelineStageFlags::COMPUTE_SHADER,
                    vk::DependencyFlags::empty(),
                    &[barrier],
                    &[],
                    &[],
                );
            }
        }
    }

    pub fn destroy(&self, device: &VulkanDevice) {
        unsafe {
            device.device.destroy_pipeline(self.pipeline, None);
            device.device.destroy_pipeline_layout(self.pipeline_layout, None);
        }
        self.descriptors.destroy(device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_alternates_with_pass_count() {
        assert_eq!(output_after(1), DenoiseOutput::Filtered);
        assert_eq!(output_after(2), DenoiseOutput::RayColor);
        assert_eq!(output_after(5), DenoiseOutput::Filtered);
    }

    #[test]
    fn dispatch_counts_cover_the_extent() {
        let (x, y) = dispatch_counts(vk::Extent2D { width: 1280, height: 720 });
        assert_eq!(x, 80);
        assert_eq!(y, 45);
        let (x, y) = dispatch_counts(vk::Extent2D { width: 1281, height: 721 });
        assert!(x * GROUP_SIZE >= 1281 && y * GROUP_SIZE >= 721);
    }
}
