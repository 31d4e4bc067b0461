// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation with validation / api-dump layers
// - Physical device selection (discrete GPU with ray-tracing support)
// - Queue family search (graphics + compute + transfer)
// - Logical device + extension capability table
// - Memory allocator setup
// - One-shot command buffer execution for setup work

use anyhow::{Context, Result};
use ash::{vk, Entry};
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use parking_lot::{Mutex, MutexGuard};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::ffi::{CStr, CString};
use std::mem::ManuallyDrop;
use std::sync::Arc;

/// Device extensions the renderer cannot run without.
const REQUIRED_DEVICE_EXTENSIONS: [&CStr; 4] = [
    ash::extensions::khr::Swapchain::name(),
    ash::extensions::khr::AccelerationStructure::name(),
    ash::extensions::khr::RayTracingPipeline::name(),
    ash::extensions::khr::DeferredHostOperations::name(),
];

/// Extension function tables, resolved once at startup and injected into
/// whatever needs them (never looked up per call site).
pub struct ExtensionTable {
    pub surface: ash::extensions::khr::Surface,
    pub swapchain: ash::extensions::khr::Swapchain,
    pub accel: ash::extensions::khr::AccelerationStructure,
    pub rt_pipeline: ash::extensions::khr::RayTracingPipeline,
}

/// Ray-tracing limits read back from the device. Shader-binding-table
/// strides are derived from these, never assumed.
#[derive(Clone, Copy, Debug)]
pub struct RayTracingProperties {
    pub shader_group_handle_size: u32,
    pub shader_group_handle_alignment: u32,
    pub shader_group_base_alignment: u32,
    pub max_ray_recursion_depth: u32,
}

/// Vulkan device wrapper with ordered cleanup
pub struct VulkanDevice {
    // Allocator borrows the device, so it must be released first in Drop
    allocator: ManuallyDrop<Mutex<Allocator>>,
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: ash::Instance,
    entry: Entry,

    pub graphics_queue: vk::Queue,
    pub graphics_queue_family: u32,

    pub ext: ExtensionTable,
    command_pool: vk::CommandPool,

    debug_utils: Option<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,

    pub rt_properties: RayTracingProperties,
}

impl VulkanDevice {
    /// Create the Vulkan device stack.
    ///
    /// # Arguments
    /// * `app_name` - Application name for debugging
    /// * `enable_validation` - Enable Vulkan validation layers
    /// * `api_dump` - Prepend the verbose VK_LAYER_LUNARG_api_dump layer
    /// * `display_handle` - Used to pick the platform surface extensions
    pub fn new(
        app_name: &str,
        enable_validation: bool,
        api_dump: bool,
        display_handle: RawDisplayHandle,
    ) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan device: {}", app_name);

        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        let instance =
            Self::create_instance(&entry, app_name, enable_validation, api_dump, display_handle)?;

        let debug_utils = if enable_validation {
            Some(Self::setup_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        let (physical_device, graphics_queue_family) = Self::pick_physical_device(&instance)?;

        let (device, graphics_queue) =
            Self::create_logical_device(&instance, physical_device, graphics_queue_family)?;

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let rt_properties = Self::query_ray_tracing_properties(&instance, physical_device);

        log::info!(
            "Selected GPU: {}",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy()
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );
        log::info!(
            "SBT group handle size {} (alignment {}, base {})",
            rt_properties.shader_group_handle_size,
            rt_properties.shader_group_handle_alignment,
            rt_properties.shader_group_base_alignment
        );

        let ext = ExtensionTable {
            surface: ash::extensions::khr::Surface::new(&entry, &instance),
            swapchain: ash::extensions::khr::Swapchain::new(&instance, &device),
            accel: ash::extensions::khr::AccelerationStructure::new(&instance, &device),
            rt_pipeline: ash::extensions::khr::RayTracingPipeline::new(&instance, &device),
        };

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(graphics_queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = unsafe { device.create_command_pool(&pool_info, None) }
            .context("Failed to create command pool")?;

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: true, // Acceleration structures reference buffers by address
            allocation_sizes: Default::default(),
        })
        .context("Failed to create GPU memory allocator")?;

        Ok(Arc::new(Self {
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            device,
            physical_device,
            instance,
            entry,
            graphics_queue,
            graphics_queue_family,
            ext,
            command_pool,
            debug_utils,
            rt_properties,
        }))
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        enable_validation: bool,
        api_dump: bool,
        display_handle: RawDisplayHandle,
    ) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name)?;
        let engine_name = CString::new("no-engine")?;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_3);

        // Platform surface extensions come from the window handle
        let mut extensions = ash_window::enumerate_required_extensions(display_handle)
            .context("No Vulkan surface support for this display")?
            .to_vec();
        if enable_validation {
            extensions.push(ash::extensions::ext::DebugUtils::name().as_ptr());
        }

        let mut layer_names = Vec::new();
        if api_dump {
            // The dump layer must come first so it sees every call
            layer_names.push(c"VK_LAYER_LUNARG_api_dump".as_ptr());
        }
        if enable_validation {
            layer_names.push(c"VK_LAYER_KHRONOS_validation".as_ptr());
        }

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")?;

        Ok(instance)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ash::extensions::ext::DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger =
            unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }?;

        Ok((debug_utils, messenger))
    }

    fn pick_physical_device(instance: &ash::Instance) -> Result<(vk::PhysicalDevice, u32)> {
        let devices = unsafe { instance.enumerate_physical_devices() }?;

        if devices.is_empty() {
            anyhow::bail!("No Vulkan-capable GPU found");
        }

        let mut best_device = None;
        let mut best_score = 0;

        for device in devices {
            let props = unsafe { instance.get_physical_device_properties(device) };
            let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) }.to_string_lossy();

            if !Self::supports_required_extensions(instance, device)? {
                log::debug!("{}: missing required ray-tracing extensions", name);
                continue;
            }
            if !Self::supports_required_features(instance, device) {
                log::debug!("{}: missing required device features", name);
                continue;
            }

            let queue_families =
                unsafe { instance.get_physical_device_queue_family_properties(device) };
            let Some(family) = find_queue_family(&queue_families) else {
                log::debug!("{}: no graphics+compute+transfer queue family", name);
                continue;
            };

            let score = match props.device_type {
                vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
                vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
                _ => 1,
            };

            if score > best_score {
                best_score = score;
                best_device = Some((device, family));
            }
        }

        best_device.ok_or_else(|| {
            anyhow::anyhow!(
                "No suitable GPU found (need {:?} and a graphics+compute+transfer queue)",
                REQUIRED_DEVICE_EXTENSIONS
            )
        })
    }

    fn supports_required_extensions(
        instance: &ash::Instance,
        device: vk::PhysicalDevice,
    ) -> Result<bool> {
        let available = unsafe { instance.enumerate_device_extension_properties(device) }?;
        let supported = REQUIRED_DEVICE_EXTENSIONS.iter().all(|required| {
            available
                .iter()
                .any(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) } == *required)
        });
        Ok(supported)
    }

    fn supports_required_features(instance: &ash::Instance, device: vk::PhysicalDevice) -> bool {
        let mut accel = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::builder();
        let mut rt_pipeline = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::builder();
        let mut vulkan12 = vk::PhysicalDeviceVulkan12Features::builder();
        let mut features2 = vk::PhysicalDeviceFeatures2::builder()
            .push_next(&mut accel)
            .push_next(&mut rt_pipeline)
            .push_next(&mut vulkan12);

        unsafe { instance.get_physical_device_features2(device, &mut features2) };

        // shader_int64 covers the 64-bit buffer addresses the shaders carry
        features2.features.shader_int64 == vk::TRUE
            && accel.acceleration_structure == vk::TRUE
            && rt_pipeline.ray_tracing_pipeline == vk::TRUE
            && vulkan12.buffer_device_address == vk::TRUE
            && vulkan12.scalar_block_layout == vk::TRUE
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        graphics_queue_family: u32,
    ) -> Result<(ash::Device, vk::Queue)> {
        let queue_priorities = [1.0];
        let queue_create_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(graphics_queue_family)
            .queue_priorities(&queue_priorities)
            .build();

        let extensions: Vec<*const std::ffi::c_char> = REQUIRED_DEVICE_EXTENSIONS
            .iter()
            .map(|ext| ext.as_ptr())
            .collect();

        // Feature chain: features2 -> vulkan12 -> accel -> rt pipeline
        let mut accel =
            vk::PhysicalDeviceAccelerationStructureFeaturesKHR::builder().acceleration_structure(true);
        let mut rt_pipeline =
            vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::builder().ray_tracing_pipeline(true);
        let mut vulkan12 = vk::PhysicalDeviceVulkan12Features::builder()
            .buffer_device_address(true)
            .scalar_block_layout(true);
        let base_features = vk::PhysicalDeviceFeatures::builder().shader_int64(true).build();
        let mut features2 = vk::PhysicalDeviceFeatures2::builder()
            .features(base_features)
            .push_next(&mut accel)
            .push_next(&mut rt_pipeline)
            .push_next(&mut vulkan12);

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(std::slice::from_ref(&queue_create_info))
            .enabled_extension_names(&extensions)
            .push_next(&mut features2);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .context("Failed to create logical device")?;

        let graphics_queue = unsafe { device.get_device_queue(graphics_queue_family, 0) };

        Ok((device, graphics_queue))
    }

    fn query_ray_tracing_properties(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
    ) -> RayTracingProperties {
        let mut rt_props = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::builder();
        let mut props2 = vk::PhysicalDeviceProperties2::builder().push_next(&mut rt_props);
        unsafe { instance.get_physical_device_properties2(physical_device, &mut props2) };

        RayTracingProperties {
            shader_group_handle_size: rt_props.shader_group_handle_size,
            shader_group_handle_alignment: rt_props.shader_group_handle_alignment,
            shader_group_base_alignment: rt_props.shader_group_base_alignment,
            max_ray_recursion_depth: rt_props.max_ray_recursion_depth,
        }
    }

    /// Create the window surface (the platform connection lives here so the
    /// loaded entry points stay private to the device).
    pub fn create_surface(
        &self,
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
    ) -> Result<vk::SurfaceKHR> {
        let surface = unsafe {
            ash_window::create_surface(&self.entry, &self.instance, display_handle, window_handle, None)
        }
        .context("Failed to create window surface")?;

        let supported = unsafe {
            self.ext.surface.get_physical_device_surface_support(
                self.physical_device,
                self.graphics_queue_family,
                surface,
            )?
        };
        if !supported {
            anyhow::bail!("GPU queue family {} cannot present to this surface", self.graphics_queue_family);
        }

        Ok(surface)
    }

    pub fn allocator(&self) -> MutexGuard<'_, Allocator> {
        self.allocator.lock()
    }

    /// Allocate a primary command buffer from the shared pool.
    pub fn allocate_command_buffer(&self) -> Result<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { self.device.allocate_command_buffers(&alloc_info) }
            .context("Failed to allocate command buffer")?;
        Ok(buffers[0])
    }

    /// Record and run a one-shot command buffer, blocking until the GPU is
    /// done with it. Setup/rebuild work only - never on the per-frame path.
    pub fn execute_one_shot<F>(&self, record: F) -> Result<()>
    where
        F: FnOnce(vk::CommandBuffer),
    {
        let cmd = self.allocate_command_buffer()?;

        unsafe {
            let begin_info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            self.device.begin_command_buffer(cmd, &begin_info)?;

            record(cmd);

            self.device.end_command_buffer(cmd)?;

            let command_buffers = [cmd];
            let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);
            self.device
                .queue_submit(self.graphics_queue, &[submit_info.build()], vk::Fence::null())
                .context("Failed to submit one-shot command buffer")?;
            self.device.queue_wait_idle(self.graphics_queue)?;

            self.device.free_command_buffers(self.command_pool, &command_buffers);
        }

        Ok(())
    }

    /// Wait for the device to be idle (before rebuild or cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }?;
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        let _ = self.wait_idle();

        unsafe {
            // The allocator frees its memory blocks against the live device
            ManuallyDrop::drop(&mut self.allocator);

            self.device.destroy_command_pool(self.command_pool, None);

            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// First queue family offering graphics, compute and transfer together.
/// The single queue drives raster draws, ray dispatch, denoise compute and
/// all upload/layout-transition work.
pub fn find_queue_family(families: &[vk::QueueFamilyProperties]) -> Option<u32> {
    let required =
        vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER;
    families
        .iter()
        .position(|props| props.queue_flags.contains(required))
        .map(|i| i as u32)
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn queue_family_search_skips_partial_families() {
        // Transfer-only and compute-only families come first on many GPUs;
        // the search must not blindly take index 0.
        let families = [
            family(vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
        ];
        assert_eq!(find_queue_family(&families), Some(2));
    }

    #[test]
    fn queue_family_search_reports_absence() {
        let families = [family(vk::QueueFlags::TRANSFER), family(vk::QueueFlags::COMPUTE)];
        assert_eq!(find_queue_family(&families), None);
    }

    #[test]
    fn queue_family_search_prefers_first_full_match() {
        let all = vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER;
        let families = [family(all), family(all)];
        assert_eq!(find_queue_family(&families), Some(0));
    }
}
