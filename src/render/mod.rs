// Render module - the frame engine built on top of the backend
//
// One orchestrator drives four passes (scanline, ray trace, denoise, post)
// over shared scene buffers and acceleration structures.

pub mod acceleration;
pub mod denoise;
pub mod orchestrator;
pub mod post;
pub mod raster;
pub mod raytrace;
pub mod scene_buffers;
pub mod uniforms;

pub use orchestrator::{Renderer, RendererOptions};
