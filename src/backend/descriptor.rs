// Descriptor set bundle - layout + pool + sets in one owner
//
// Each pass owns one bundle; bindings are declared up front and the pool is
// sized from them so allocation can never fail mid-flight.

use anyhow::{Context, Result};
use ash::vk;
use super::VulkanDevice;

#[derive(Clone, Copy)]
pub struct BindingDesc {
    pub binding: u32,
    pub ty: vk::DescriptorType,
    pub stages: vk::ShaderStageFlags,
}

impl BindingDesc {
    pub fn new(binding: u32, ty: vk::DescriptorType, stages: vk::ShaderStageFlags) -> Self {
        Self { binding, ty, stages }
    }
}

pub struct DescriptorBundle {
    pub layout: vk::DescriptorSetLayout,
    pub pool: vk::DescriptorPool,
    pub sets: Vec<vk::DescriptorSet>,
}

impl DescriptorBundle {
    pub fn new(device: &VulkanDevice, bindings: &[BindingDesc], set_count: u32) -> Result<Self> {
        let layout_bindings: Vec<vk::DescriptorSetLayoutBinding> = bindings
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(b.binding)
                    .descriptor_type(b.ty)
                    .descriptor_count(1)
                    .stage_flags(b.stages)
                    .build()
            })
            .collect();

        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&layout_bindings);
        let layout = unsafe { device.device.create_descriptor_set_layout(&layout_info, None) }
            .context("Failed to create descriptor set layout")?;

        let pool_sizes: Vec<vk::DescriptorPoolSize> = bindings
            .iter()
            .map(|b| vk::DescriptorPoolSize { ty: b.ty, descriptor_count: set_count })
            .collect();

        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(set_count)
            .pool_sizes(&pool_sizes);
        let pool = unsafe { device.device.create_descriptor_pool(&pool_info, None) }
            .context("Failed to create descriptor pool")?;

        let set_layouts = vec![layout; set_count as usize];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&set_layouts);
        let sets = unsafe { device.device.allocate_descriptor_sets(&alloc_info) }
            .context("Failed to allocate descriptor sets")?;

        Ok(Self { layout, pool, sets })
    }

    pub fn write_buffer(
        &self,
        device: &VulkanDevice,
        set: usize,
        binding: u32,
        ty: vk::DescriptorType,
        info: vk::DescriptorBufferInfo,
    ) {
        let buffer_infos = [info];
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(self.sets[set])
            .dst_binding(binding)
            .descriptor_type(ty)
            .buffer_info(&buffer_infos)
            .build();
        unsafe { device.device.update_descriptor_sets(&[write], &[]) };
    }

    pub fn write_image(
        &self,
        device: &VulkanDevice,
        set: usize,
        binding: u32,
        ty: vk::DescriptorType,
        info: vk::DescriptorImageInfo,
    ) {
        let image_infos = [info];
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(self.sets[set])
            .dst_binding(binding)
            .descriptor_type(ty)
            .image_info(&image_infos)
            .build();
        unsafe { device.device.update_descriptor_sets(&[write], &[]) };
    }

    pub fn write_acceleration_structure(
        &self,
        device: &VulkanDevice,
        set: usize,
        binding: u32,
        tlas: vk::AccelerationStructureKHR,
    ) {
        let structures = [tlas];
        let mut accel_write = vk::WriteDescriptorSetAccelerationStructureKHR::builder()
            .acceleration_structures(&structures);

        // descriptor_count comes from the pNext struct for AS writes
        let mut write = vk::WriteDescriptorSet::builder()
            .dst_set(self.sets[set])
            .dst_binding(binding)
            .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
            .push_next(&mut accel_write)
            .build();
        write.descriptor_count = 1;

        unsafe { device.device.update_descriptor_sets(&[write], &[]) };
    }

    pub fn destroy(&self, device: &VulkanDevice) {
        unsafe {
            device.device.destroy_descriptor_pool(self.pool, None);
            device.device.destroy_descriptor_set_layout(self.layout, None);
        }
    }
}
