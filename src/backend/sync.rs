// Synchronization primitives
//
// One fence + one semaphore pair guards the single in-flight frame:
// frame N+1 cannot start recording until frame N's fence signals.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;
use super::VulkanDevice;

/// Fence poll granularity. The wait loops on TIMEOUT so a wedged GPU never
/// turns into an unbounded block inside the driver.
const FENCE_POLL_NANOS: u64 = 1_000_000;

/// Per-frame synchronization set. The engine owns exactly one.
pub struct FrameSync {
    /// Signaled by the presentation engine when the acquired image is ours
    pub image_available: vk::Semaphore,
    /// Signaled by the GPU when the frame's commands finish
    pub render_finished: vk::Semaphore,
    /// CPU-visible completion signal for the frame's command buffer
    pub in_flight_fence: vk::Fence,
}

impl FrameSync {
    pub fn new(device: &Arc<VulkanDevice>) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        let fence_info = vk::FenceCreateInfo::builder()
            .flags(vk::FenceCreateFlags::SIGNALED); // First frame has nothing to wait on

        unsafe {
            Ok(Self {
                image_available: device.device.create_semaphore(&semaphore_info, None)?,
                render_finished: device.device.create_semaphore(&semaphore_info, None)?,
                in_flight_fence: device.device.create_fence(&fence_info, None)?,
            })
        }
    }

    /// Block until the previous frame's commands are done. Bounded re-poll,
    /// never an open-ended wait. The fence stays signaled so a skipped frame
    /// (e.g. out-of-date swapchain) can wait again without deadlocking.
    pub fn wait(&self, device: &VulkanDevice) -> Result<()> {
        loop {
            match unsafe {
                device
                    .device
                    .wait_for_fences(&[self.in_flight_fence], true, FENCE_POLL_NANOS)
            } {
                Ok(()) => break,
                Err(vk::Result::TIMEOUT) => continue,
                Err(e) => return Err(e).context("Failed waiting on frame fence"),
            }
        }
        Ok(())
    }

    /// Arm the fence for this frame's submit. Only called once the frame is
    /// definitely going to be submitted.
    pub fn reset(&self, device: &VulkanDevice) -> Result<()> {
        unsafe { device.device.reset_fences(&[self.in_flight_fence]) }
            .context("Failed to reset frame fence")
    }

    /// Submit the frame's command buffer: wait for the acquired image at
    /// color-attachment output, signal render_finished and the fence.
    pub fn submit(&self, device: &VulkanDevice, command_buffer: vk::CommandBuffer) -> Result<()> {
        let wait_semaphores = [self.image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal_semaphores = [self.render_finished];
        let command_buffers = [command_buffer];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            device
                .device
                .queue_submit(device.graphics_queue, &[submit_info.build()], self.in_flight_fence)
                .context("Failed to submit frame command buffer")
        }
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_semaphore(self.image_available, None);
            device.destroy_semaphore(self.render_finished, None);
            device.destroy_fence(self.in_flight_fence, None);
        }
    }
}
