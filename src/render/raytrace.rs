// Ray-trace pass - pipeline, shader-binding table, trace dispatch
//
// The SBT is an ordered, tightly packed buffer of shader-group records.
// Record strides come from the device's reported handle size and alignments;
// nothing here is hard-coded to a vendor's numbers.

use anyhow::{Context, Result};
use ash::vk;
use crate::backend::descriptor::{BindingDesc, DescriptorBundle};
use crate::backend::device::RayTracingProperties;
use crate::backend::resource::{BufferResource, ImageResource};
use crate::backend::{shader, VulkanDevice};
use super::uniforms::PushConstantRay;

/// Bindings of the ray-trace descriptor set.
pub mod bindings {
    pub const TLAS: u32 = 0;
    pub const OUT_IMAGE: u32 = 1;
    pub const COLOR_HISTORY: u32 = 2;
    pub const NORMAL_DEPTH: u32 = 3;
    pub const NORMAL_DEPTH_HISTORY: u32 = 4;
}

/// Round `x` up to a multiple of `align` (power of two).
pub fn align_up(x: u32, align: u32) -> u32 {
    (x + align - 1) & !(align - 1)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SbtRegion {
    pub offset: u32,
    pub stride: u32,
    pub size: u32,
}

/// Byte layout of the shader-binding table: raygen, then miss, then hit,
/// each region starting on the device's base alignment.
#[derive(Clone, Copy, Debug)]
pub struct SbtLayout {
    pub handle_size: u32,
    pub raygen: SbtRegion,
    pub miss: SbtRegion,
    pub hit: SbtRegion,
}

impl SbtLayout {
    pub fn compute(props: &RayTracingProperties, miss_count: u32, hit_count: u32) -> Self {
        let handle_size = props.shader_group_handle_size;
        let handle_aligned = align_up(handle_size, props.shader_group_handle_alignment);
        let base = props.shader_group_base_alignment;

        // The raygen region is special: its size must equal its stride
        let raygen_size = align_up(handle_aligned, base);
        let miss_size = align_up(miss_count * handle_aligned, base);
        let hit_size = align_up(hit_count * handle_aligned, base);

        Self {
            handle_size,
            raygen: SbtRegion { offset: 0, stride: raygen_size, size: raygen_size },
            miss: SbtRegion { offset: raygen_size, stride: handle_aligned, size: miss_size },
            hit: SbtRegion {
                offset: raygen_size + miss_size,
                stride: handle_aligned,
                size: hit_size,
            },
        }
    }

    pub fn total_size(&self) -> u32 {
        self.hit.offset + self.hit.size
    }
}

pub struct RayTracePass {
    pub descriptors: DescriptorBundle,
    pipeline_layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,
    sbt_buffer: BufferResource,
    regions: [vk::StridedDeviceAddressRegionKHR; 4],
}

impl RayTracePass {
    pub fn new(device: &VulkanDevice, scene_set_layout: vk::DescriptorSetLayout) -> Result<Self> {
        let descriptors = DescriptorBundle::new(
            device,
            &[
                BindingDesc::new(
                    bindings::TLAS,
                    vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
                    vk::ShaderStageFlags::RAYGEN_KHR | vk::ShaderStageFlags::CLOSEST_HIT_KHR,
                ),
                BindingDesc::new(
                    bindings::OUT_IMAGE,
                    vk::DescriptorType::STORAGE_IMAGE,
                    vk::ShaderStageFlags::RAYGEN_KHR,
                ),
                BindingDesc::new(
                    bindings::COLOR_HISTORY,
                    vk::DescriptorType::STORAGE_IMAGE,
                    vk::ShaderStageFlags::RAYGEN_KHR,
                ),
                BindingDesc::new(
                    bindings::NORMAL_DEPTH,
                    vk::DescriptorType::STORAGE_IMAGE,
                    vk::ShaderStageFlags::RAYGEN_KHR,
                ),
                BindingDesc::new(
                    bindings::NORMAL_DEPTH_HISTORY,
                    vk::DescriptorType::STORAGE_IMAGE,
                    vk::ShaderStageFlags::RAYGEN_KHR,
                ),
            ],
            1,
        )?;

        let set_layouts = [descriptors.layout, scene_set_layout];
        let push_stages = vk::ShaderStageFlags::RAYGEN_KHR
            | vk::ShaderStageFlags::MISS_KHR
            | vk::ShaderStageFlags::CLOSEST_HIT_KHR;
        let push_constant_range = vk::PushConstantRange::builder()
            .stage_flags(push_stages)
            .offset(0)
            .size(std::mem::size_of::<PushConstantRay>() as u32)
            .build();
        let push_constant_ranges = [push_constant_range];

        let layout_info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&push_constant_ranges);
        let pipeline_layout = unsafe { device.device.create_pipeline_layout(&layout_info, None) }
            .context("Failed to create ray-trace pipeline layout")?;

        let rgen = shader::load_module(device, "spv/raytrace.rgen.spv")?;
        let rmiss = shader::load_module(device, "spv/raytrace.rmiss.spv")?;
        let rchit = shader::load_module(device, "spv/raytrace.rchit.spv")?;

        let stages = [
            shader::stage_info(rgen, vk::ShaderStageFlags::RAYGEN_KHR),
            shader::stage_info(rmiss, vk::ShaderStageFlags::MISS_KHR),
            shader::stage_info(rchit, vk::ShaderStageFlags::CLOSEST_HIT_KHR),
        ];

        // Group order defines the SBT order: raygen, miss, hit
        let groups = [
            vk::RayTracingShaderGroupCreateInfoKHR::builder()
                .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
                .general_shader(0)
                .closest_hit_shader(vk::SHADER_UNUSED_KHR)
                .any_hit_shader(vk::SHADER_UNUSED_KHR)
                .intersection_shader(vk::SHADER_UNUSED_KHR)
                .build(),
            vk::RayTracingShaderGroupCreateInfoKHR::builder()
                .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
                .general_shader(1)
                .closest_hit_shader(vk::SHADER_UNUSED_KHR)
                .any_hit_shader(vk::SHADER_UNUSED_KHR)
                .intersection_shader(vk::SHADER_UNUSED_KHR)
                .build(),
            vk::RayTracingShaderGroupCreateInfoKHR::builder()
                .ty(vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP)
                .general_shader(vk::SHADER_UNUSED_KHR)
                .closest_hit_shader(2)
                .any_hit_shader(vk::SHADER_UNUSED_KHR)
                .intersection_shader(vk::SHADER_UNUSED_KHR)
                .build(),
        ];

        let recursion_depth = 2.min(device.rt_properties.max_ray_recursion_depth);
        let pipeline_info = vk::RayTracingPipelineCreateInfoKHR::builder()
            .stages(&stages)
            .groups(&groups)
            .max_pipeline_ray_recursion_depth(recursion_depth)
            .layout(pipeline_layout)
            .build();

        let pipeline = unsafe {
            device.ext.rt_pipeline.create_ray_tracing_pipelines(
                vk::DeferredOperationKHR::null(),
                vk::PipelineCache::null(),
                &[pipeline_info],
                None,
            )
        };

        unsafe {
            device.device.destroy_shader_module(rgen, None);
            device.device.destroy_shader_module(rmiss, None);
            device.device.destroy_shader_module(rchit, None);
        }

        let pipeline = pipeline
            .map(|p| p[0])
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to create ray-trace pipeline")?;

        let (sbt_buffer, regions) =
            Self::create_shader_binding_table(device, pipeline, groups.len() as u32)?;

        Ok(Self { descriptors, pipeline_layout, pipeline, sbt_buffer, regions })
    }

    fn create_shader_binding_table(
        device: &VulkanDevice,
        pipeline: vk::Pipeline,
        group_count: u32,
    ) -> Result<(BufferResource, [vk::StridedDeviceAddressRegionKHR; 4])> {
        let layout = SbtLayout::compute(&device.rt_properties, 1, 1);
        let handle_size = layout.handle_size as usize;

        let handles = unsafe {
            device.ext.rt_pipeline.get_ray_tracing_shader_group_handles(
                pipeline,
                0,
                group_count,
                group_count as usize * handle_size,
            )
        }
        .context("Failed to read shader group handles")?;

        // Scatter the packed handles to their aligned record slots
        let mut table = vec![0u8; layout.total_size() as usize];
        let copy = |table: &mut [u8], group: usize, offset: u32| {
            let src = &handles[group * handle_size..(group + 1) * handle_size];
            table[offset as usize..offset as usize + handle_size].copy_from_slice(src);
        };
        copy(&mut table, 0, layout.raygen.offset);
        copy(&mut table, 1, layout.miss.offset);
        copy(&mut table, 2, layout.hit.offset);

        let sbt_buffer = BufferResource::with_data(
            device,
            "sbt",
            vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            &table,
        )?;

        let base_address = sbt_buffer.device_address(device);
        let region = |r: SbtRegion| vk::StridedDeviceAddressRegionKHR {
            device_address: base_address + r.offset as u64,
            stride: r.stride as u64,
            size: r.size as u64,
        };
        let regions = [
            region(layout.raygen),
            region(layout.miss),
            region(layout.hit),
            vk::StridedDeviceAddressRegionKHR::default(), // no callable shaders
        ];

        Ok((sbt_buffer, regions))
    }

    /// Point the descriptor set at the current TLAS and frame images.
    /// Called at startup and again after any resize or TLAS rebuild.
    pub fn update_descriptors(
        &self,
        device: &VulkanDevice,
        tlas: vk::AccelerationStructureKHR,
        color: &ImageResource,
        color_history: &ImageResource,
        normal_depth: &ImageResource,
        normal_depth_history: &ImageResource,
    ) {
        self.descriptors.write_acceleration_structure(device, 0, bindings::TLAS, tlas);
        for (binding, image) in [
            (bindings::OUT_IMAGE, color),
            (bindings::COLOR_HISTORY, color_history),
            (bindings::NORMAL_DEPTH, normal_depth),
            (bindings::NORMAL_DEPTH_HISTORY, normal_depth_history),
        ] {
            self.descriptors.write_image(
                device,
                0,
                binding,
                vk::DescriptorType::STORAGE_IMAGE,
                image.descriptor_info(vk::ImageLayout::GENERAL),
            );
        }
    }

    pub fn trace(
        &self,
        device: &VulkanDevice,
        cmd: vk::CommandBuffer,
        extent: vk::Extent2D,
        scene_set: vk::DescriptorSet,
        push: &PushConstantRay,
    ) {
        unsafe {
            let d = &device.device;
            d.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::RAY_TRACING_KHR, self.pipeline);
            d.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::RAY_TRACING_KHR,
                self.pipeline_layout,
                0,
                &[self.descriptors.sets[0], scene_set],
                &[],
            );
            d.cmd_push_constants(
                cmd,
                self.pipeline_layout,
                vk::ShaderStageFlags::RAYGEN_KHR
                    | vk::ShaderStageFlags::MISS_KHR
                    | vk::ShaderStageFlags::CLOSEST_HIT_KHR,
                0,
                bytemuck::bytes_of(push),
            );
            device.ext.rt_pipeline.cmd_trace_rays(
                cmd,
                &self.regions[0],
                &self.regions[1],
                &self.regions[2],
                &self.regions[3],
                extent.width,
                extent.height,
                1,
            );
        }
    }

    pub fn destroy(self, device: &VulkanDevice) {
        unsafe {
            device.device.destroy_pipeline(self.pipeline, None);
            device.device.destroy_pipeline_layout(self.pipeline_layout, None);
        }
        self.descriptors.destroy(device);
        self.sbt_buffer.destroy(device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(handle: u32, handle_align: u32, base_align: u32) -> RayTracingProperties {
        RayTracingProperties {
            shader_group_handle_size: handle,
            shader_group_handle_alignment: handle_align,
            shader_group_base_alignment: base_align,
            max_ray_recursion_depth: 31,
        }
    }

    #[test]
    fn align_up_is_identity_on_aligned_values() {
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(0, 64), 0);
        assert_eq!(align_up(33, 32), 64);
    }

    #[test]
    fn sbt_layout_on_common_hardware() {
        // 32-byte handles, 32-byte handle alignment, 64-byte base alignment
        let layout = SbtLayout::compute(&props(32, 32, 64), 1, 1);
        assert_eq!(layout.raygen, SbtRegion { offset: 0, stride: 64, size: 64 });
        assert_eq!(layout.miss, SbtRegion { offset: 64, stride: 32, size: 64 });
        assert_eq!(layout.hit, SbtRegion { offset: 128, stride: 32, size: 64 });
        assert_eq!(layout.total_size(), 192);
    }

    #[test]
    fn sbt_raygen_stride_equals_size() {
        for (h, ha, ba) in [(32, 32, 64), (32, 64, 64), (64, 64, 128)] {
            let layout = SbtLayout::compute(&props(h, ha, ba), 2, 3);
            assert_eq!(layout.raygen.stride, layout.raygen.size);
        }
    }

    #[test]
    fn sbt_regions_start_on_base_alignment() {
        let layout = SbtLayout::compute(&props(32, 64, 256), 3, 2);
        assert_eq!(layout.miss.offset % 256, 0);
        assert_eq!(layout.hit.offset % 256, 0);
        // Handles never overlap the next record
        assert!(layout.miss.stride >= layout.handle_size);
    }
}
