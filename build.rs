// Build script to compile GLSL shaders to SPIR-V under spv/
//
// The renderer loads the binaries by path at pipeline build time, so a
// missing glslc only warns here and fails loudly there.

use std::path::Path;
use std::process::Command;

const SHADERS: &[&str] = &[
    "scanline.vert",
    "scanline.frag",
    "post.vert",
    "post.frag",
    "raytrace.rgen",
    "raytrace.rmiss",
    "raytrace.rchit",
    "denoise.comp",
];

fn main() {
    println!("cargo:rerun-if-changed=shaders/");

    std::fs::create_dir_all("spv").expect("Failed to create spv/ directory");

    for shader in SHADERS {
        compile_shader(
            &format!("shaders/{}", shader),
            &format!("spv/{}.spv", shader),
        );
    }
}

fn compile_shader(input: &str, output: &str) {
    let input_path = Path::new(input);
    let output_path = Path::new(output);

    // Ray-tracing stages need the vulkan1.3 target environment
    let result = Command::new("glslc")
        .arg("--target-env=vulkan1.3")
        .arg(input_path)
        .arg("-o")
        .arg(output_path)
        .status();

    match result {
        Ok(status) if status.success() => {
            println!("Compiled {} -> {}", input, output);
        }
        Ok(status) => {
            panic!("Failed to compile {}: exit code {:?}", input, status.code());
        }
        Err(e) => {
            eprintln!("Warning: glslc not found ({})", e);
            eprintln!("Shaders will not be compiled. Install Vulkan SDK or compile manually:");
            eprintln!("  glslc --target-env=vulkan1.3 {} -o {}", input, output);
        }
    }
}
