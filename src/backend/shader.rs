// Shader module loading
//
// Precompiled SPIR-V is loaded by path from the spv/ tree. A missing or
// truncated file fails pipeline construction loudly - no stage is skipped.

use anyhow::{Context, Result};
use ash::vk;
use std::io::Cursor;
use std::path::Path;
use super::VulkanDevice;

/// Load a SPIR-V file and create a shader module from it. The module is
/// only needed while the pipeline is built; destroy it right afterwards.
pub fn load_module<P: AsRef<Path>>(device: &VulkanDevice, path: P) -> Result<vk::ShaderModule> {
    let path = path.as_ref();
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read shader binary {:?}", path))?;

    let code = ash::util::read_spv(&mut Cursor::new(&bytes))
        .with_context(|| format!("Shader binary {:?} is not valid SPIR-V", path))?;

    let create_info = vk::ShaderModuleCreateInfo::builder().code(&code);

    unsafe {
        device
            .device
            .create_shader_module(&create_info, None)
            .with_context(|| format!("Failed to create shader module from {:?}", path))
    }
}

/// Shader stage info for pipeline creation. The entry point is always "main".
pub fn stage_info(
    module: vk::ShaderModule,
    stage: vk::ShaderStageFlags,
) -> vk::PipelineShaderStageCreateInfo {
    vk::PipelineShaderStageCreateInfo::builder()
        .stage(stage)
        .module(module)
        .name(c"main")
        .build()
}
