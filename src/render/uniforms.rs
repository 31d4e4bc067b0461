// Host-side mirrors of the GPU shader structs
//
// Byte layout here must match the shader side exactly; every field that GLSL
// aligns differently from Rust carries explicit padding. The ray push
// constants end in a sentinel value the raygen shader checks - a mismatch
// paints the output red instead of silently shading garbage.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3, Vec4};

/// Known value written into the last ray push-constant field and verified
/// shader-side as a layout self-check.
pub const ALIGNMENT_SENTINEL: i32 = 1234;

/// Camera uniform, updated once per frame. Prior matrices are retained for
/// temporal reprojection in the ray-traced path.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct MatrixUniforms {
    pub view_proj: Mat4,
    pub prior_view_proj: Mat4,
    pub view_inverse: Mat4,
    pub proj_inverse: Mat4,
}

/// Push constants for the scanline pipeline (vertex + fragment stages).
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct PushConstantRaster {
    pub model_matrix: Mat4,    // offset 0
    pub light_position: Vec3,  // offset 64
    pub obj_index: u32,        // offset 76, packed into the vec3's tail
    pub light_intensity: f32,  // offset 80
    pub light_type: i32,       // offset 84
    pub _pad: [u32; 2],        // struct is 16-aligned through the mat4
}

/// Push constants for the ray-tracing pipeline. GLSL bools are 4 bytes,
/// mirrored here as u32.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct PushConstantRay {
    pub frame_seed: u32,       // offset 0
    pub depth: i32,            // offset 4
    pub rr: f32,               // offset 8
    pub _pad0: u32,            // vec4 below aligns to 16
    pub light_position: Vec4,  // offset 16
    pub light_intensity: Vec4, // offset 32
    pub ambient: Vec4,         // offset 48
    pub full_brdf: u32,        // offset 64
    pub bilinear: u32,         // offset 68
    pub n_threshold: f32,      // offset 72
    pub d_threshold: f32,      // offset 76
    pub accumulate: u32,       // offset 80
    pub use_history: u32,      // offset 84
    pub do_explicit: u32,      // offset 88
    pub clear: u32,            // offset 92
    pub alignment_test: i32,   // offset 96 - the sentinel, last meaningful field
    pub _pad1: [u32; 3],       // round size up to the 16-byte stride
}

impl Default for PushConstantRay {
    fn default() -> Self {
        Self {
            frame_seed: 0,
            depth: 3,
            rr: 0.7,
            _pad0: 0,
            light_position: Vec4::new(0.5, 2.5, 3.0, 1.0),
            light_intensity: Vec4::new(2.8, 2.8, 2.8, 1.0),
            ambient: Vec4::new(0.2, 0.2, 0.2, 1.0),
            full_brdf: 1,
            bilinear: 0,
            n_threshold: 0.95,
            d_threshold: 0.15,
            accumulate: 1,
            use_history: 1,
            do_explicit: 1,
            clear: 0,
            alignment_test: ALIGNMENT_SENTINEL,
            _pad1: [0; 3],
        }
    }
}

/// Push constants for one denoise dispatch. Each dispatch is stateless; the
/// orchestrator varies `stepwidth` across the a-trous iterations.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct PushConstantDenoise {
    pub norm_factor: f32,
    pub depth_factor: f32,
    pub stepwidth: i32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{offset_of, size_of};

    #[test]
    fn matrix_uniforms_are_four_packed_mat4s() {
        assert_eq!(size_of::<MatrixUniforms>(), 256);
        assert_eq!(offset_of!(MatrixUniforms, prior_view_proj), 64);
        assert_eq!(offset_of!(MatrixUniforms, proj_inverse), 192);
    }

    #[test]
    fn raster_push_constants_match_shader_layout() {
        assert_eq!(offset_of!(PushConstantRaster, model_matrix), 0);
        assert_eq!(offset_of!(PushConstantRaster, light_position), 64);
        assert_eq!(offset_of!(PushConstantRaster, obj_index), 76);
        assert_eq!(offset_of!(PushConstantRaster, light_intensity), 80);
        assert_eq!(offset_of!(PushConstantRaster, light_type), 84);
        assert_eq!(size_of::<PushConstantRaster>() % 16, 0);
    }

    #[test]
    fn ray_push_constants_match_shader_layout() {
        assert_eq!(offset_of!(PushConstantRay, frame_seed), 0);
        assert_eq!(offset_of!(PushConstantRay, rr), 8);
        assert_eq!(offset_of!(PushConstantRay, light_position), 16);
        assert_eq!(offset_of!(PushConstantRay, ambient), 48);
        assert_eq!(offset_of!(PushConstantRay, full_brdf), 64);
        assert_eq!(offset_of!(PushConstantRay, n_threshold), 72);
        assert_eq!(offset_of!(PushConstantRay, clear), 92);
        assert_eq!(offset_of!(PushConstantRay, alignment_test), 96);
        assert_eq!(size_of::<PushConstantRay>(), 112);
    }

    #[test]
    fn ray_push_constants_carry_the_sentinel() {
        let pc = PushConstantRay::default();
        assert_eq!(pc.alignment_test, 1234);
        // The sentinel must round-trip through the raw bytes handed to Vulkan
        let bytes: &[u8] = bytemuck::bytes_of(&pc);
        let tail = &bytes[96..100];
        assert_eq!(i32::from_ne_bytes(tail.try_into().unwrap()), 1234);
    }

    #[test]
    fn denoise_push_constants_are_tightly_packed() {
        assert_eq!(size_of::<PushConstantDenoise>(), 12);
        assert_eq!(offset_of!(PushConstantDenoise, stepwidth), 8);
    }
}
