// Swapchain - Window presentation
//
// Manages the chain of images we render to and present to the screen.
// Selection policies are pure functions so they stay testable without a GPU.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;
use super::VulkanDevice;

/// Outcome of an image acquire. OutOfDate means every extent-derived
/// resource must be rebuilt before frame submission resumes.
pub enum AcquireResult {
    Acquired { index: u32, suboptimal: bool },
    OutOfDate,
}

pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    device: Arc<VulkanDevice>,
}

/// FIFO is the one mode Vulkan requires every surface to support; take the
/// low-latency mailbox mode when the surface offers it.
pub fn choose_present_mode(available: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    available
        .iter()
        .copied()
        .find(|&mode| mode == vk::PresentModeKHR::MAILBOX)
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// First enumerated format/color-space pair, upgraded to 8-bit BGRA UNORM
/// when the surface lists it.
pub fn choose_surface_format(available: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    available
        .iter()
        .copied()
        .find(|f| f.format == vk::Format::B8G8R8A8_UNORM)
        .or_else(|| available.first().copied())
}

/// minImageCount + 1, clamped to maxImageCount when the surface bounds it
/// (maxImageCount == 0 means unbounded).
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let mut count = caps.min_image_count + 1;
    if caps.max_image_count > 0 && count > caps.max_image_count {
        count = caps.max_image_count;
    }
    count
}

pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, width: u32, height: u32) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: width.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: height.clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

impl Swapchain {
    pub fn new(
        device: Arc<VulkanDevice>,
        surface: vk::SurfaceKHR,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        log::info!("Creating swapchain: {}x{}", width, height);

        let surface_caps = unsafe {
            device
                .ext
                .surface
                .get_physical_device_surface_capabilities(device.physical_device, surface)
        }?;

        let formats = unsafe {
            device
                .ext
                .surface
                .get_physical_device_surface_formats(device.physical_device, surface)
        }?;

        let present_modes = unsafe {
            device
                .ext
                .surface
                .get_physical_device_surface_present_modes(device.physical_device, surface)
        }?;

        let surface_format =
            choose_surface_format(&formats).context("Surface enumerates no formats")?;
        let present_mode = choose_present_mode(&present_modes);
        let extent = choose_extent(&surface_caps, width, height);
        let image_count = choose_image_count(&surface_caps);

        log::info!("Present mode: {:?}, format: {:?}", present_mode, surface_format.format);

        // STORAGE lets the ray tracer write swapchain-sized intermediates with
        // the same format; TRANSFER_DST covers the history copies.
        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(
                vk::ImageUsageFlags::COLOR_ATTACHMENT
                    | vk::ImageUsageFlags::STORAGE
                    | vk::ImageUsageFlags::TRANSFER_DST,
            )
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(surface_caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true);

        let swapchain = unsafe { device.ext.swapchain.create_swapchain(&create_info, None) }
            .context("Failed to create swapchain")?;

        let images = unsafe { device.ext.swapchain.get_swapchain_images(swapchain) }?;

        log::info!("Created swapchain with {} images", images.len());

        let image_views: Result<Vec<_>> = images
            .iter()
            .map(|&image| {
                let create_info = vk::ImageViewCreateInfo::builder()
                    .image(image)
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(surface_format.format)
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        base_mip_level: 0,
                        level_count: 1,
                        base_array_layer: 0,
                        layer_count: 1,
                    });

                unsafe {
                    device
                        .device
                        .create_image_view(&create_info, None)
                        .context("Failed to create swapchain image view")
                }
            })
            .collect();
        let image_views = image_views?;

        // Batch-transition every image to present-ready so the first frame's
        // tracked layouts start from PRESENT_SRC, not UNDEFINED.
        let barriers: Vec<vk::ImageMemoryBarrier> = images
            .iter()
            .map(|&image| {
                vk::ImageMemoryBarrier::builder()
                    .old_layout(vk::ImageLayout::UNDEFINED)
                    .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(image)
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        base_mip_level: 0,
                        level_count: vk::REMAINING_MIP_LEVELS,
                        base_array_layer: 0,
                        layer_count: vk::REMAINING_ARRAY_LAYERS,
                    })
                    .build()
            })
            .collect();

        device.execute_one_shot(|cmd| unsafe {
            device.device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &barriers,
            );
        })?;

        Ok(Self {
            swapchain,
            images,
            image_views,
            format: surface_format.format,
            extent,
            device,
        })
    }

    /// Acquire next image for rendering
    pub fn acquire_next_image(
        &self,
        timeout: u64,
        semaphore: vk::Semaphore,
    ) -> Result<AcquireResult> {
        let result = unsafe {
            self.device.ext.swapchain.acquire_next_image(
                self.swapchain,
                timeout,
                semaphore,
                vk::Fence::null(),
            )
        };

        match result {
            Ok((index, suboptimal)) => {
                debug_assert!((index as usize) < self.images.len());
                Ok(AcquireResult::Acquired { index, suboptimal })
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireResult::OutOfDate),
            Err(e) => Err(e).context("Failed to acquire swapchain image"),
        }
    }

    /// Present a rendered image. Returns true when the swapchain should be
    /// rebuilt (suboptimal or out of date).
    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<bool> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe {
            self.device
                .ext
                .swapchain
                .queue_present(queue, &present_info)
        };

        match result {
            Ok(suboptimal) => Ok(suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(true),
            Err(e) => Err(e).context("Failed to present swapchain image"),
        }
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        unsafe {
            for &view in &self.image_views {
                self.device.device.destroy_image_view(view, None);
            }
            self.device
                .ext
                .swapchain
                .destroy_swapchain(self.swapchain, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(min: u32, max: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            ..Default::default()
        }
    }

    #[test]
    fn present_mode_falls_back_to_fifo() {
        // An unsupported preference never fails swapchain creation
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::FIFO_RELAXED];
        assert_eq!(choose_present_mode(&modes), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn present_mode_prefers_mailbox() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(choose_present_mode(&modes), vk::PresentModeKHR::MAILBOX);
    }

    #[test]
    fn image_count_is_min_plus_one_clamped() {
        assert_eq!(choose_image_count(&caps(2, 0)), 3);
        assert_eq!(choose_image_count(&caps(2, 8)), 3);
        assert_eq!(choose_image_count(&caps(3, 3)), 3);
    }

    #[test]
    fn surface_format_prefers_bgra_unorm() {
        let formats = [
            vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];
        assert_eq!(
            choose_surface_format(&formats).unwrap().format,
            vk::Format::B8G8R8A8_UNORM
        );
    }

    #[test]
    fn surface_format_defaults_to_first_enumerated() {
        let formats = [vk::SurfaceFormatKHR {
            format: vk::Format::R16G16B16A16_SFLOAT,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }];
        assert_eq!(
            choose_surface_format(&formats).unwrap().format,
            vk::Format::R16G16B16A16_SFLOAT
        );
    }

    #[test]
    fn extent_honors_surface_bounds() {
        let mut c = caps(2, 0);
        c.current_extent = vk::Extent2D { width: u32::MAX, height: u32::MAX };
        c.min_image_extent = vk::Extent2D { width: 64, height: 64 };
        c.max_image_extent = vk::Extent2D { width: 2048, height: 2048 };
        let extent = choose_extent(&c, 4096, 16);
        assert_eq!((extent.width, extent.height), (2048, 64));
    }
}
