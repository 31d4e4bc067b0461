// Frame orchestrator - owns every GPU resource and drives one frame at a time
//
// Per frame: wait on the fence, acquire, record (update uniforms, then
// raster OR raytrace+denoise, then post), submit, present. Both render paths
// converge on the HDR color image the post pass tonemaps to the swapchain.
//
// Resources are mutated only between frames while the device is confirmed
// idle; the single command buffer / fence / semaphore pair never serves two
// frames at once.

use anyhow::{Context, Result};
use ash::vk;
use glam::Mat4;
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

use crate::backend::descriptor::{BindingDesc, DescriptorBundle};
use crate::backend::resource::{BufferResource, ImageResource};
use crate::backend::swapchain::AcquireResult;
use crate::backend::sync::FrameSync;
use crate::backend::{Swapchain, VulkanDevice};
use crate::camera::Camera;
use crate::scene::{Scene, SceneInstance};

use super::acceleration::{AccelerationStructures, TlasInstance};
use super::denoise::{output_after, DenoiseOutput, DenoisePass};
use super::post::PostPass;
use super::raster::ScanlinePass;
use super::raytrace::RayTracePass;
use super::scene_buffers::SceneBuffers;
use super::uniforms::{MatrixUniforms, PushConstantRay};

/// Offscreen working format for everything between the geometry and the
/// tonemapper.
const HDR_FORMAT: vk::Format = vk::Format::R32G32B32A32_SFLOAT;
const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

/// Runtime knobs handed in from the configuration layer.
pub struct RendererOptions {
    pub ray_depth: i32,
    pub denoise_passes: u32,
    pub start_with_raytracer: bool,
}

/// Every extent-sized image the frame works with; rebuilt as a unit when the
/// swapchain goes out of date.
struct FrameImages {
    depth: ImageResource,
    /// The convergence image both paths write and the post pass samples
    hdr_color: ImageResource,
    rt_color: ImageResource,
    rt_color_history: ImageResource,
    rt_normal_depth: ImageResource,
    rt_normal_depth_history: ImageResource,
    rt_filtered: ImageResource,
}

impl FrameImages {
    fn create(device: &Arc<VulkanDevice>, extent: vk::Extent2D) -> Result<Self> {
        let mut depth = ImageResource::new(
            device,
            "depth",
            extent,
            DEPTH_FORMAT,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
        )?;
        depth.create_view(device, vk::ImageAspectFlags::DEPTH)?;

        let mut hdr_color = ImageResource::new(
            device,
            "hdr_color",
            extent,
            HDR_FORMAT,
            vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::SAMPLED
                | vk::ImageUsageFlags::TRANSFER_DST,
        )?;
        hdr_color.create_view(device, vk::ImageAspectFlags::COLOR)?;
        hdr_color.create_sampler(device)?;

        let storage_image = |name: &str, extra: vk::ImageUsageFlags| -> Result<ImageResource> {
            let mut image = ImageResource::new(
                device,
                name,
                extent,
                HDR_FORMAT,
                vk::ImageUsageFlags::STORAGE | extra,
            )?;
            image.create_view(device, vk::ImageAspectFlags::COLOR)?;
            Ok(image)
        };

        let transfer_both =
            vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST;
        let mut rt_color = storage_image("rt_color", transfer_both)?;
        let mut rt_color_history = storage_image("rt_color_history", transfer_both)?;
        let mut rt_normal_depth = storage_image("rt_normal_depth", transfer_both)?;
        let mut rt_normal_depth_history = storage_image("rt_normal_depth_history", transfer_both)?;
        let mut rt_filtered = storage_image("rt_filtered", transfer_both)?;

        // Storage images live in GENERAL; give each a defined starting layout
        // before any descriptor points at them.
        device.execute_one_shot(|cmd| {
            let d = &device.device;
            for image in [
                &mut rt_color,
                &mut rt_color_history,
                &mut rt_normal_depth,
                &mut rt_normal_depth_history,
                &mut rt_filtered,
            ] {
                image.transition(d, cmd, vk::ImageLayout::GENERAL);
            }
            hdr_color.transition(d, cmd, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        })?;

        Ok(Self {
            depth,
            hdr_color,
            rt_color,
            rt_color_history,
            rt_normal_depth,
            rt_normal_depth_history,
            rt_filtered,
        })
    }

    fn destroy(self, device: &VulkanDevice) {
        self.depth.destroy(device);
        self.hdr_color.destroy(device);
        self.rt_color.destroy(device);
        self.rt_color_history.destroy(device);
        self.rt_normal_depth.destroy(device);
        self.rt_normal_depth_history.destroy(device);
        self.rt_filtered.destroy(device);
    }
}

pub struct Renderer {
    device: Arc<VulkanDevice>,
    surface: vk::SurfaceKHR,

    swapchain: Option<Swapchain>,
    images: FrameImages,

    matrix_buffer: BufferResource,
    scene_buffers: SceneBuffers,
    scene_descriptors: DescriptorBundle,
    instances: Vec<SceneInstance>,
    accel: AccelerationStructures,

    scanline: ScanlinePass,
    raytrace: RayTracePass,
    denoise: DenoisePass,
    post: PostPass,

    frame_sync: FrameSync,
    command_buffer: vk::CommandBuffer,

    /// Runtime raster <-> raytrace toggle
    pub use_raytracer: bool,
    ray_push: PushConstantRay,
    denoise_passes: u32,
    frame_seed: u32,
    prior_view_proj: Mat4,
    /// History images carry valid data from a previous ray-traced frame
    history_valid: bool,
    needs_resize: bool,
    tlas_dirty: bool,
}

impl Renderer {
    pub fn new(
        device: Arc<VulkanDevice>,
        surface: vk::SurfaceKHR,
        window_size: (u32, u32),
        scene: &Scene,
        options: &RendererOptions,
    ) -> Result<Self> {
        let swapchain = Swapchain::new(device.clone(), surface, window_size.0, window_size.1)?;
        let extent = swapchain.extent;

        let images = FrameImages::create(&device, extent)?;

        let matrix_buffer = BufferResource::new(
            &device,
            "matrices",
            std::mem::size_of::<MatrixUniforms>() as vk::DeviceSize,
            vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuOnly,
        )?;

        let scene_buffers = SceneBuffers::upload(&device, scene)?;

        // Scene set shared by the scanline and ray-trace pipelines
        let scene_descriptors = DescriptorBundle::new(
            &device,
            &[
                BindingDesc::new(
                    0,
                    vk::DescriptorType::UNIFORM_BUFFER,
                    vk::ShaderStageFlags::VERTEX
                        | vk::ShaderStageFlags::FRAGMENT
                        | vk::ShaderStageFlags::RAYGEN_KHR
                        | vk::ShaderStageFlags::CLOSEST_HIT_KHR,
                ),
                BindingDesc::new(
                    1,
                    vk::DescriptorType::STORAGE_BUFFER,
                    vk::ShaderStageFlags::VERTEX
                        | vk::ShaderStageFlags::FRAGMENT
                        | vk::ShaderStageFlags::RAYGEN_KHR
                        | vk::ShaderStageFlags::CLOSEST_HIT_KHR,
                ),
            ],
            1,
        )?;
        scene_descriptors.write_buffer(
            &device,
            0,
            0,
            vk::DescriptorType::UNIFORM_BUFFER,
            matrix_buffer.descriptor_info(),
        );
        scene_descriptors.write_buffer(
            &device,
            0,
            1,
            vk::DescriptorType::STORAGE_BUFFER,
            scene_buffers.object_descriptions.descriptor_info(),
        );

        let instances: Vec<SceneInstance> = scene
            .instances
            .iter()
            .map(|i| SceneInstance { mesh_index: i.mesh_index, transform: i.transform })
            .collect();

        let accel =
            AccelerationStructures::build(&device, &scene_buffers, &tlas_instances(&instances))?;

        let scanline = ScanlinePass::new(
            &device,
            HDR_FORMAT,
            DEPTH_FORMAT,
            images.hdr_color.view,
            images.depth.view,
            extent,
            scene_descriptors.layout,
        )?;

        let raytrace = RayTracePass::new(&device, scene_descriptors.layout)?;
        raytrace.update_descriptors(
            &device,
            accel.tlas.accel,
            &images.rt_color,
            &images.rt_color_history,
            &images.rt_normal_depth,
            &images.rt_normal_depth_history,
        );

        let denoise = DenoisePass::new(&device)?;
        denoise.update_descriptors(
            &device,
            &images.rt_color,
            &images.rt_normal_depth,
            &images.rt_filtered,
        );

        let post = PostPass::new(
            &device,
            swapchain.format,
            DEPTH_FORMAT,
            &swapchain.image_views,
            images.depth.view,
            extent,
        )?;
        post.update_input_image(&device, &images.hdr_color);

        let frame_sync = FrameSync::new(&device)?;
        let command_buffer = device.allocate_command_buffer()?;

        let ray_push = PushConstantRay { depth: options.ray_depth, ..Default::default() };

        log::info!("Renderer initialized ({}x{})", extent.width, extent.height);

        Ok(Self {
            device,
            surface,
            swapchain: Some(swapchain),
            images,
            matrix_buffer,
            scene_buffers,
            scene_descriptors,
            instances,
            accel,
            scanline,
            raytrace,
            denoise,
            post,
            frame_sync,
            command_buffer,
            use_raytracer: options.start_with_raytracer,
            ray_push,
            denoise_passes: options.denoise_passes,
            frame_seed: 0,
            prior_view_proj: Mat4::IDENTITY,
            history_valid: false,
            needs_resize: false,
            tlas_dirty: false,
        })
    }

    // =========================================================================
    // PER-FRAME DRIVE
    // =========================================================================

    /// Render one frame. Returns false when the frame was skipped (resize in
    /// progress or swapchain out of date).
    pub fn draw_frame(&mut self, camera: &Camera, window_size: (u32, u32)) -> Result<bool> {
        if window_size.0 == 0 || window_size.1 == 0 {
            return Ok(false);
        }

        if self.needs_resize {
            self.rebuild_sized_resources(window_size)?;
        }
        if self.tlas_dirty {
            self.refresh_tlas()?;
        }

        // Begin frame: the previous frame must release the command buffer
        // before we record over it, then the presentation engine hands us an
        // image index.
        self.frame_sync.wait(&self.device)?;

        let image_index = {
            let swapchain = self.swapchain.as_ref().context("Swapchain not initialized")?;
            match swapchain.acquire_next_image(u64::MAX, self.frame_sync.image_available)? {
                AcquireResult::OutOfDate => {
                    self.needs_resize = true;
                    return Ok(false);
                }
                AcquireResult::Acquired { index, suboptimal } => {
                    if suboptimal {
                        self.needs_resize = true;
                    }
                    index
                }
            }
        };

        let extent = self.extent();
        let cmd = self.command_buffer;

        unsafe {
            let begin_info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            self.device.device.begin_command_buffer(cmd, &begin_info)?;
        }

        self.update_matrix_uniform(cmd, camera, extent);

        if self.use_raytracer {
            self.record_raytrace(cmd, extent);
            self.record_denoise_and_converge(cmd, extent);
            self.history_valid = true;
        } else {
            self.record_rasterize(cmd, extent);
        }

        self.post.record(&self.device, cmd, image_index, extent);

        unsafe { self.device.device.end_command_buffer(cmd)? };

        // End frame: arm the fence, submit, present. A failure past this
        // point is frame-fatal and propagates - never a torn frame.
        self.frame_sync.reset(&self.device)?;
        self.frame_sync.submit(&self.device, cmd)?;

        let swapchain = self.swapchain.as_ref().context("Swapchain not initialized")?;
        let needs_rebuild = swapchain.present(
            self.device.graphics_queue,
            image_index,
            &[self.frame_sync.render_finished],
        )?;
        if needs_rebuild {
            self.needs_resize = true;
        }

        self.frame_seed = self.frame_seed.wrapping_add(1);
        Ok(true)
    }

    fn update_matrix_uniform(&mut self, cmd: vk::CommandBuffer, camera: &Camera, extent: vk::Extent2D) {
        let aspect = extent.width as f32 / extent.height as f32;
        let view = camera.view_matrix();
        let proj = camera.perspective(aspect);
        let view_proj = proj * view;

        let uniforms = MatrixUniforms {
            view_proj,
            prior_view_proj: self.prior_view_proj,
            view_inverse: view.inverse(),
            proj_inverse: proj.inverse(),
        };
        self.prior_view_proj = view_proj;

        unsafe {
            let d = &self.device.device;
            d.cmd_update_buffer(cmd, self.matrix_buffer.buffer, 0, bytemuck::bytes_of(&uniforms));

            // The upload must land before any stage reads camera matrices
            let barrier = vk::BufferMemoryBarrier::builder()
                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(vk::AccessFlags::UNIFORM_READ)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .buffer(self.matrix_buffer.buffer)
                .offset(0)
                .size(vk::WHOLE_SIZE)
                .build();
            d.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::VERTEX_SHADER
                    | vk::PipelineStageFlags::FRAGMENT_SHADER
                    | vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
                vk::DependencyFlags::empty(),
                &[],
                &[barrier],
                &[],
            );
        }
    }

    fn record_rasterize(&mut self, cmd: vk::CommandBuffer, extent: vk::Extent2D) {
        self.scanline.record(
            &self.device,
            cmd,
            extent,
            &self.scene_buffers,
            &self.instances,
            self.scene_descriptors.sets[0],
            self.ray_push.light_position.truncate(),
            self.ray_push.light_intensity.x,
        );
        // The render pass leaves the attachments in their finalLayouts
        self.images.hdr_color.set_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        self.images.depth.set_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);
    }

    fn record_raytrace(&mut self, cmd: vk::CommandBuffer, extent: vk::Extent2D) {
        debug_assert_eq!(
            (self.images.rt_color.extent.width, self.images.rt_color.extent.height),
            (extent.width, extent.height)
        );
        let mut push = self.ray_push;
        push.frame_seed = self.frame_seed;
        push.use_history = self.history_valid as u32;
        push.clear = (!self.history_valid) as u32;

        self.raytrace.trace(
            &self.device,
            cmd,
            extent,
            self.scene_descriptors.sets[0],
            &push,
        );

        // Carry this frame's results into the history images for temporal
        // reuse next frame.
        let d = &self.device.device;
        record_image_copy(d, cmd, &mut self.images.rt_color, &mut self.images.rt_color_history);
        record_image_copy(
            d,
            cmd,
            &mut self.images.rt_normal_depth,
            &mut self.images.rt_normal_depth_history,
        );
    }

    fn record_denoise_and_converge(&mut self, cmd: vk::CommandBuffer, extent: vk::Extent2D) {
        self.denoise.record(&self.device, cmd, extent, self.denoise_passes);

        // Whichever ping-pong image holds the filtered result feeds the
        // shared HDR image the post pass samples.
        let source = match output_after(self.denoise_passes) {
            DenoiseOutput::Filtered => &mut self.images.rt_filtered,
            DenoiseOutput::RayColor => &mut self.images.rt_color,
        };

        let d = &self.device.device;
        source.transition(d, cmd, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
        self.images.hdr_color.transition(d, cmd, vk::ImageLayout::TRANSFER_DST_OPTIMAL);

        unsafe {
            d.cmd_copy_image(
                cmd,
                source.image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                self.images.hdr_color.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[full_copy_region(extent)],
            );
        }

        self.images.hdr_color.transition(d, cmd, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        source.transition(d, cmd, vk::ImageLayout::GENERAL);
    }

    // =========================================================================
    // REBUILD PATHS
    // =========================================================================

    /// Tear down and recreate everything derived from the window extent.
    fn rebuild_sized_resources(&mut self, window_size: (u32, u32)) -> Result<()> {
        log::info!("Rebuilding sized resources: {}x{}", window_size.0, window_size.1);
        self.device.wait_idle()?;

        // The surface can only carry one swapchain; drop before recreate
        self.swapchain = None;
        let swapchain =
            Swapchain::new(self.device.clone(), self.surface, window_size.0, window_size.1)?;
        let extent = swapchain.extent;

        let old = std::mem::replace(&mut self.images, FrameImages::create(&self.device, extent)?);
        old.destroy(&self.device);

        self.scanline.rebuild_framebuffer(
            &self.device,
            self.images.hdr_color.view,
            self.images.depth.view,
            extent,
        )?;
        self.post.rebuild_framebuffers(
            &self.device,
            &swapchain.image_views,
            self.images.depth.view,
            extent,
        )?;

        // Every descriptor that referenced the old images gets rewritten
        self.raytrace.update_descriptors(
            &self.device,
            self.accel.tlas.accel,
            &self.images.rt_color,
            &self.images.rt_color_history,
            &self.images.rt_normal_depth,
            &self.images.rt_normal_depth_history,
        );
        self.denoise.update_descriptors(
            &self.device,
            &self.images.rt_color,
            &self.images.rt_normal_depth,
            &self.images.rt_filtered,
        );
        self.post.update_input_image(&self.device, &self.images.hdr_color);

        self.swapchain = Some(swapchain);
        self.history_valid = false;
        self.needs_resize = false;
        Ok(())
    }

    /// Rebuild only the TLAS after an instance transform change. BLAS
    /// geometry is untouched and keeps its device addresses.
    fn refresh_tlas(&mut self) -> Result<()> {
        self.device.wait_idle()?;
        self.accel.rebuild_tlas(&self.device, &tlas_instances(&self.instances))?;
        debug_assert_eq!(self.accel.tlas.instance_count as usize, self.instances.len());
        self.raytrace.update_descriptors(
            &self.device,
            self.accel.tlas.accel,
            &self.images.rt_color,
            &self.images.rt_color_history,
            &self.images.rt_normal_depth,
            &self.images.rt_normal_depth_history,
        );
        self.history_valid = false;
        self.tlas_dirty = false;
        Ok(())
    }

    // =========================================================================
    // EXTERNAL CONTROLS
    // =========================================================================

    pub fn toggle_render_mode(&mut self) {
        self.use_raytracer = !self.use_raytracer;
        self.history_valid = false;
        log::info!(
            "Render mode: {}",
            if self.use_raytracer { "ray trace + denoise" } else { "raster" }
        );
    }

    /// Move a scene instance; the TLAS rebuilds before the next frame.
    pub fn set_instance_transform(&mut self, index: usize, transform: Mat4) {
        if let Some(instance) = self.instances.get_mut(index) {
            instance.transform = transform;
            self.tlas_dirty = true;
        }
    }

    pub fn instance_transform(&self, index: usize) -> Option<Mat4> {
        self.instances.get(index).map(|i| i.transform)
    }

    pub fn request_resize(&mut self) {
        self.needs_resize = true;
    }

    /// The camera moved; temporal accumulation restarts next ray-traced frame.
    pub fn invalidate_history(&mut self) {
        self.history_valid = false;
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain
            .as_ref()
            .map(|s| s.extent)
            .unwrap_or(vk::Extent2D { width: 0, height: 0 })
    }

    // =========================================================================
    // TEARDOWN
    // =========================================================================

    /// Ordered teardown, reverse of construction. The device outlives the
    /// renderer and is destroyed by its own Drop.
    pub fn shutdown(mut self) {
        log::info!("Shutting down renderer...");
        let _ = self.device.wait_idle();

        self.frame_sync.destroy(&self.device.device);
        self.post.destroy(&self.device);
        self.denoise.destroy(&self.device);
        self.raytrace.destroy(&self.device);
        self.scanline.destroy(&self.device);
        self.accel.destroy(&self.device);
        self.scene_descriptors.destroy(&self.device);
        self.scene_buffers.destroy(&self.device);
        self.matrix_buffer.destroy(&self.device);
        self.images.destroy(&self.device);
        self.swapchain = None;

        unsafe { self.device.ext.surface.destroy_surface(self.surface, None) };
    }
}

fn tlas_instances(instances: &[SceneInstance]) -> Vec<TlasInstance> {
    instances
        .iter()
        .enumerate()
        .map(|(i, instance)| TlasInstance {
            blas_index: instance.mesh_index,
            transform: instance.transform,
            custom_index: i as u32,
        })
        .collect()
}

fn full_copy_region(extent: vk::Extent2D) -> vk::ImageCopy {
    let layers = vk::ImageSubresourceLayers {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        mip_level: 0,
        base_array_layer: 0,
        layer_count: 1,
    };
    vk::ImageCopy {
        src_subresource: layers,
        src_offset: vk::Offset3D::default(),
        dst_subresource: layers,
        dst_offset: vk::Offset3D::default(),
        extent: vk::Extent3D { width: extent.width, height: extent.height, depth: 1 },
    }
}

/// Copy src into dst with the matching transitions, returning both images to
/// GENERAL for the shaders. The copy covers the source's full extent.
fn record_image_copy(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    src: &mut ImageResource,
    dst: &mut ImageResource,
) {
    let region = full_copy_region(src.extent);
    src.transition(device, cmd, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
    dst.transition(device, cmd, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
    unsafe {
        device.cmd_copy_image(
            cmd,
            src.image,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            dst.image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &[region],
        );
    }
    src.transition(device, cmd, vk::ImageLayout::GENERAL);
    dst.transition(device, cmd, vk::ImageLayout::GENERAL);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::demo_scene;

    #[test]
    fn tlas_instances_mirror_scene_instances() {
        let scene = demo_scene();
        let mapped = tlas_instances(&scene.instances);
        // Instance count parity is the invariant the TLAS build relies on
        assert_eq!(mapped.len(), scene.instances.len());
        for (i, instance) in mapped.iter().enumerate() {
            assert_eq!(instance.custom_index, i as u32);
            assert_eq!(instance.blas_index, scene.instances[i].mesh_index);
        }
    }

    #[test]
    fn empty_scene_maps_to_zero_tlas_instances() {
        let mapped = tlas_instances(&[]);
        assert!(mapped.is_empty());
    }

    #[test]
    fn full_copy_region_covers_extent() {
        let region = full_copy_region(vk::Extent2D { width: 1280, height: 768 });
        assert_eq!(region.extent.width, 1280);
        assert_eq!(region.extent.height, 768);
        assert_eq!(region.extent.depth, 1);
    }
}
