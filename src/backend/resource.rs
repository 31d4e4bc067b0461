// GPU resource wrappers - buffers and images over gpu-allocator
//
// Single owner, explicit destroy. Views and samplers are only created after
// the backing allocation exists and are released before it. Image layouts are
// tracked host-side, never queried back from the device.

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use super::VulkanDevice;

// ─────────────────────────────────────────────────────────────────────────────
// Buffers
// ─────────────────────────────────────────────────────────────────────────────

pub struct BufferResource {
    pub buffer: vk::Buffer,
    pub size: vk::DeviceSize,
    allocation: Option<Allocation>,
}

impl BufferResource {
    pub fn new(
        device: &VulkanDevice,
        name: &str,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> Result<Self> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.device.create_buffer(&buffer_info, None) }
            .with_context(|| format!("Failed to create buffer '{}' ({} bytes)", name, size))?;

        let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };

        let allocation = device
            .allocator()
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .with_context(|| {
                format!("Failed to allocate {} bytes ({:?}) for buffer '{}'", requirements.size, location, name)
            })?;

        unsafe {
            device
                .device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
                .with_context(|| format!("Failed to bind memory for buffer '{}'", name))?;
        }

        Ok(Self { buffer, size, allocation: Some(allocation) })
    }

    /// Host-visible buffer pre-filled with `data`.
    pub fn with_data<T: bytemuck::Pod>(
        device: &VulkanDevice,
        name: &str,
        usage: vk::BufferUsageFlags,
        data: &[T],
    ) -> Result<Self> {
        let size = std::mem::size_of_val(data) as vk::DeviceSize;
        let mut buffer = Self::new(device, name, size, usage, MemoryLocation::CpuToGpu)?;
        buffer.write(data)?;
        Ok(buffer)
    }

    /// Overwrite the buffer contents through the persistent mapping.
    pub fn write<T: bytemuck::Pod>(&mut self, data: &[T]) -> Result<()> {
        self.write_bytes(bytemuck::cast_slice(data))
    }

    /// Raw-byte variant for structs containing Vulkan unions (e.g.
    /// acceleration-structure instances) that bytemuck cannot cast.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        anyhow::ensure!(
            bytes.len() as vk::DeviceSize <= self.size,
            "Write of {} bytes overflows {}-byte buffer",
            bytes.len(),
            self.size
        );
        let mapped = self
            .allocation
            .as_mut()
            .and_then(|a| a.mapped_slice_mut())
            .context("Buffer is not host-visible")?;
        mapped[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn device_address(&self, device: &VulkanDevice) -> vk::DeviceAddress {
        let info = vk::BufferDeviceAddressInfo::builder().buffer(self.buffer);
        unsafe { device.device.get_buffer_device_address(&info) }
    }

    pub fn descriptor_info(&self) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo {
            buffer: self.buffer,
            offset: 0,
            range: vk::WHOLE_SIZE,
        }
    }

    pub fn destroy(mut self, device: &VulkanDevice) {
        unsafe { device.device.destroy_buffer(self.buffer, None) };
        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = device.allocator().free(allocation) {
                log::warn!("Failed to free buffer allocation: {}", e);
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Images
// ─────────────────────────────────────────────────────────────────────────────

pub struct ImageResource {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub sampler: vk::Sampler,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    /// Tracked layout; every transition records a barrier from this value
    layout: vk::ImageLayout,
    aspect: vk::ImageAspectFlags,
    allocation: Option<Allocation>,
}

impl ImageResource {
    pub fn new(
        device: &VulkanDevice,
        name: &str,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
    ) -> Result<Self> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D { width: extent.width, height: extent.height, depth: 1 })
            .mip_levels(1)
            .array_layers(1)
            .format(format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(usage)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let image = unsafe { device.device.create_image(&image_info, None) }
            .with_context(|| format!("Failed to create image '{}' ({:?})", name, format))?;

        let requirements = unsafe { device.device.get_image_memory_requirements(image) };

        let allocation = device
            .allocator()
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location: MemoryLocation::GpuOnly,
                linear: false,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .with_context(|| {
                format!("Failed to allocate {} bytes for image '{}'", requirements.size, name)
            })?;

        unsafe {
            device
                .device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
                .with_context(|| format!("Failed to bind memory for image '{}'", name))?;
        }

        Ok(Self {
            image,
            view: vk::ImageView::null(),
            sampler: vk::Sampler::null(),
            format,
            extent,
            layout: vk::ImageLayout::UNDEFINED,
            aspect: vk::ImageAspectFlags::COLOR,
            allocation: Some(allocation),
        })
    }

    pub fn create_view(&mut self, device: &VulkanDevice, aspect: vk::ImageAspectFlags) -> Result<()> {
        let view_info = vk::ImageViewCreateInfo::builder()
            .image(self.image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(self.format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        self.view = unsafe { device.device.create_image_view(&view_info, None) }
            .context("Failed to create image view")?;
        self.aspect = aspect;
        Ok(())
    }

    pub fn create_sampler(&mut self, device: &VulkanDevice) -> Result<()> {
        let sampler_info = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE);

        self.sampler = unsafe { device.device.create_sampler(&sampler_info, None) }
            .context("Failed to create sampler")?;
        Ok(())
    }

    /// Record a layout transition from the tracked layout. Also usable as a
    /// same-layout memory barrier (e.g. GENERAL -> GENERAL between dispatches).
    pub fn transition(&mut self, device: &ash::Device, cmd: vk::CommandBuffer, new_layout: vk::ImageLayout) {
        let (src_access, src_stage) = src_masks(self.layout);
        let (dst_access, dst_stage) = dst_masks(new_layout);

        let barrier = vk::ImageMemoryBarrier::builder()
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .old_layout(self.layout)
            .new_layout(new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(self.image)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: self.aspect,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            })
            .build();

        unsafe {
            device.cmd_pipeline_barrier(
                cmd,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }

        self.layout = new_layout;
    }

    /// Render passes transition attachments implicitly; keep the tracked
    /// state in step with the pass's finalLayout.
    pub fn set_layout(&mut self, layout: vk::ImageLayout) {
        self.layout = layout;
    }

    pub fn descriptor_info(&self, layout: vk::ImageLayout) -> vk::DescriptorImageInfo {
        vk::DescriptorImageInfo {
            sampler: self.sampler,
            image_view: self.view,
            image_layout: layout,
        }
    }

    pub fn destroy(mut self, device: &VulkanDevice) {
        unsafe {
            if self.sampler != vk::Sampler::null() {
                device.device.destroy_sampler(self.sampler, None);
            }
            if self.view != vk::ImageView::null() {
                device.device.destroy_image_view(self.view, None);
            }
            device.device.destroy_image(self.image, None);
        }
        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = device.allocator().free(allocation) {
                log::warn!("Failed to free image allocation: {}", e);
            }
        }
    }
}

/// Access/stage to wait on when leaving a layout.
fn src_masks(layout: vk::ImageLayout) -> (vk::AccessFlags, vk::PipelineStageFlags) {
    match layout {
        vk::ImageLayout::UNDEFINED | vk::ImageLayout::PRESENT_SRC_KHR => {
            (vk::AccessFlags::empty(), vk::PipelineStageFlags::TOP_OF_PIPE)
        }
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => (
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ),
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => (
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
        ),
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => (
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::FRAGMENT_SHADER
                | vk::PipelineStageFlags::COMPUTE_SHADER
                | vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
        ),
        vk::ImageLayout::GENERAL => (
            vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
            vk::PipelineStageFlags::COMPUTE_SHADER
                | vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
        ),
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => {
            (vk::AccessFlags::TRANSFER_READ, vk::PipelineStageFlags::TRANSFER)
        }
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => {
            (vk::AccessFlags::TRANSFER_WRITE, vk::PipelineStageFlags::TRANSFER)
        }
        _ => (
            vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
            vk::PipelineStageFlags::ALL_COMMANDS,
        ),
    }
}

/// Access/stage to block when entering a layout.
fn dst_masks(layout: vk::ImageLayout) -> (vk::AccessFlags, vk::PipelineStageFlags) {
    match layout {
        vk::ImageLayout::PRESENT_SRC_KHR => {
            (vk::AccessFlags::empty(), vk::PipelineStageFlags::BOTTOM_OF_PIPE)
        }
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => (
            vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ),
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => (
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        ),
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => (
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::FRAGMENT_SHADER
                | vk::PipelineStageFlags::COMPUTE_SHADER
                | vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
        ),
        vk::ImageLayout::GENERAL => (
            vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
            vk::PipelineStageFlags::COMPUTE_SHADER
                | vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
        ),
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => {
            (vk::AccessFlags::TRANSFER_READ, vk::PipelineStageFlags::TRANSFER)
        }
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => {
            (vk::AccessFlags::TRANSFER_WRITE, vk::PipelineStageFlags::TRANSFER)
        }
        _ => (
            vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
            vk::PipelineStageFlags::ALL_COMMANDS,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undefined_source_flushes_nothing() {
        let (access, stage) = src_masks(vk::ImageLayout::UNDEFINED);
        assert_eq!(access, vk::AccessFlags::empty());
        assert_eq!(stage, vk::PipelineStageFlags::TOP_OF_PIPE);
    }

    #[test]
    fn present_destination_blocks_nothing() {
        let (access, stage) = dst_masks(vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(access, vk::AccessFlags::empty());
        assert_eq!(stage, vk::PipelineStageFlags::BOTTOM_OF_PIPE);
    }

    #[test]
    fn transfer_pairs_are_symmetric() {
        assert_eq!(
            src_masks(vk::ImageLayout::TRANSFER_DST_OPTIMAL),
            (vk::AccessFlags::TRANSFER_WRITE, vk::PipelineStageFlags::TRANSFER)
        );
        assert_eq!(
            dst_masks(vk::ImageLayout::TRANSFER_SRC_OPTIMAL),
            (vk::AccessFlags::TRANSFER_READ, vk::PipelineStageFlags::TRANSFER)
        );
    }

    #[test]
    fn storage_layout_covers_trace_and_compute_stages() {
        let (_, stage) = dst_masks(vk::ImageLayout::GENERAL);
        assert!(stage.contains(vk::PipelineStageFlags::COMPUTE_SHADER));
        assert!(stage.contains(vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR));
    }
}
