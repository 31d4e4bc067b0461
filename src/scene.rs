// Scene description - the input contract with the asset-loading side
//
// Meshes (position + normal + texcoord, index triples), materials, and
// instances (mesh reference + transform). The renderer consumes this once at
// load time; a procedural box room stands in for a model loader here.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec2, Vec3};

/// Vertex layout shared with the shaders (scalar layout, 32 bytes).
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct Vertex {
    pub pos: Vec3,
    pub nrm: Vec3,
    pub tex_coord: Vec2,
}

/// Material record shared with the shaders (scalar layout, 44 bytes).
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct Material {
    pub diffuse: Vec3,
    pub specular: Vec3,
    pub emission: Vec3,
    pub shininess: f32,
    pub texture_id: i32,
}

impl Material {
    pub fn diffuse(color: Vec3) -> Self {
        Self {
            diffuse: color,
            specular: Vec3::splat(0.04),
            emission: Vec3::ZERO,
            shininess: 24.0,
            texture_id: -1,
        }
    }

    pub fn emissive(emission: Vec3) -> Self {
        Self {
            diffuse: Vec3::ZERO,
            specular: Vec3::ZERO,
            emission,
            shininess: 1.0,
            texture_id: -1,
        }
    }
}

/// One mesh: triangle list plus a per-triangle material index into the
/// scene's material table.
pub struct MeshData {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
    pub material_indices: Vec<i32>,
}

pub struct SceneInstance {
    pub mesh_index: usize,
    pub transform: Mat4,
}

pub struct Scene {
    pub meshes: Vec<MeshData>,
    pub materials: Vec<Material>,
    pub instances: Vec<SceneInstance>,
}

impl MeshData {
    pub fn triangle_count(&self) -> u32 {
        (self.indices.len() / 3) as u32
    }
}

/// Append a quad (two triangles) to a mesh under construction.
fn push_quad(mesh: &mut MeshData, corners: [Vec3; 4], normal: Vec3, material: i32) {
    let base = mesh.vertices.len() as u32;
    let uvs = [
        Vec2::new(0.0, 0.0),
        Vec2::new(1.0, 0.0),
        Vec2::new(1.0, 1.0),
        Vec2::new(0.0, 1.0),
    ];
    for (corner, uv) in corners.iter().zip(uvs) {
        mesh.vertices.push(Vertex { pos: *corner, nrm: normal, tex_coord: uv });
    }
    mesh.indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
    mesh.material_indices.extend_from_slice(&[material, material]);
}

/// Axis-aligned box mesh with outward normals, one material for all faces.
fn make_box(min: Vec3, max: Vec3, material: i32) -> MeshData {
    let mut mesh = MeshData { vertices: Vec::new(), indices: Vec::new(), material_indices: Vec::new() };

    let corners = |pts: [(f32, f32, f32); 4]| pts.map(|(x, y, z)| Vec3::new(x, y, z));

    // -Z / +Z
    push_quad(&mut mesh, corners([(max.x, min.y, min.z), (min.x, min.y, min.z), (min.x, max.y, min.z), (max.x, max.y, min.z)]), Vec3::NEG_Z, material);
    push_quad(&mut mesh, corners([(min.x, min.y, max.z), (max.x, min.y, max.z), (max.x, max.y, max.z), (min.x, max.y, max.z)]), Vec3::Z, material);
    // -X / +X
    push_quad(&mut mesh, corners([(min.x, min.y, min.z), (min.x, min.y, max.z), (min.x, max.y, max.z), (min.x, max.y, min.z)]), Vec3::NEG_X, material);
    push_quad(&mut mesh, corners([(max.x, min.y, max.z), (max.x, min.y, min.z), (max.x, max.y, min.z), (max.x, max.y, max.z)]), Vec3::X, material);
    // -Y / +Y
    push_quad(&mut mesh, corners([(min.x, min.y, min.z), (max.x, min.y, min.z), (max.x, min.y, max.z), (min.x, min.y, max.z)]), Vec3::NEG_Y, material);
    push_quad(&mut mesh, corners([(min.x, max.y, max.z), (max.x, max.y, max.z), (max.x, max.y, min.z), (min.x, max.y, min.z)]), Vec3::Y, material);

    mesh
}

/// The demo room: a box interior with two blocks and an area light, the
/// stand-in for the living-room model the full asset pipeline would supply.
pub fn demo_scene() -> Scene {
    let materials = vec![
        Material::diffuse(Vec3::new(0.73, 0.73, 0.73)), // 0: walls/floor/ceiling
        Material::diffuse(Vec3::new(0.65, 0.05, 0.05)), // 1: left wall
        Material::diffuse(Vec3::new(0.12, 0.45, 0.15)), // 2: right wall
        Material {
            diffuse: Vec3::new(0.6, 0.6, 0.7),
            specular: Vec3::splat(0.4),
            emission: Vec3::ZERO,
            shininess: 96.0,
            texture_id: -1,
        }, // 3: glossy block
        Material::diffuse(Vec3::new(0.85, 0.75, 0.45)), // 4: matte block
        Material::emissive(Vec3::new(6.0, 6.0, 5.2)),   // 5: area light
    ];

    // Room shell, normals facing inward (built as quads directly)
    let mut room = MeshData { vertices: Vec::new(), indices: Vec::new(), material_indices: Vec::new() };
    let (w, h, d) = (3.0, 2.5, 3.0);
    // floor, ceiling
    push_quad(&mut room, [Vec3::new(-w, 0.0, -d), Vec3::new(w, 0.0, -d), Vec3::new(w, 0.0, d), Vec3::new(-w, 0.0, d)], Vec3::Y, 0);
    push_quad(&mut room, [Vec3::new(-w, h, d), Vec3::new(w, h, d), Vec3::new(w, h, -d), Vec3::new(-w, h, -d)], Vec3::NEG_Y, 0);
    // back wall
    push_quad(&mut room, [Vec3::new(-w, 0.0, -d), Vec3::new(-w, h, -d), Vec3::new(w, h, -d), Vec3::new(w, 0.0, -d)], Vec3::Z, 0);
    // left (red), right (green)
    push_quad(&mut room, [Vec3::new(-w, 0.0, d), Vec3::new(-w, h, d), Vec3::new(-w, h, -d), Vec3::new(-w, 0.0, -d)], Vec3::X, 1);
    push_quad(&mut room, [Vec3::new(w, 0.0, -d), Vec3::new(w, h, -d), Vec3::new(w, h, d), Vec3::new(w, 0.0, d)], Vec3::NEG_X, 2);

    // Area light panel just under the ceiling
    let mut light = MeshData { vertices: Vec::new(), indices: Vec::new(), material_indices: Vec::new() };
    push_quad(
        &mut light,
        [Vec3::new(-0.7, h - 0.01, 0.7), Vec3::new(0.7, h - 0.01, 0.7), Vec3::new(0.7, h - 0.01, -0.7), Vec3::new(-0.7, h - 0.01, -0.7)],
        Vec3::NEG_Y,
        5,
    );

    let tall_block = make_box(Vec3::new(-0.45, 0.0, -0.45), Vec3::new(0.45, 1.4, 0.45), 3);
    let short_block = make_box(Vec3::new(-0.4, 0.0, -0.4), Vec3::new(0.4, 0.6, 0.4), 4);

    let instances = vec![
        SceneInstance { mesh_index: 0, transform: Mat4::IDENTITY },
        SceneInstance { mesh_index: 1, transform: Mat4::IDENTITY },
        SceneInstance {
            mesh_index: 2,
            transform: Mat4::from_translation(Vec3::new(-0.9, 0.0, -0.8))
                * Mat4::from_rotation_y(0.3),
        },
        SceneInstance {
            mesh_index: 3,
            transform: Mat4::from_translation(Vec3::new(1.0, 0.0, 0.6))
                * Mat4::from_rotation_y(-0.25),
        },
    ];

    Scene {
        meshes: vec![room, light, tall_block, short_block],
        materials,
        instances,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{offset_of, size_of};

    #[test]
    fn vertex_matches_shader_scalar_layout() {
        assert_eq!(size_of::<Vertex>(), 32);
        assert_eq!(offset_of!(Vertex, nrm), 12);
        assert_eq!(offset_of!(Vertex, tex_coord), 24);
    }

    #[test]
    fn material_matches_shader_scalar_layout() {
        assert_eq!(size_of::<Material>(), 44);
        assert_eq!(offset_of!(Material, specular), 12);
        assert_eq!(offset_of!(Material, emission), 24);
        assert_eq!(offset_of!(Material, shininess), 36);
        assert_eq!(offset_of!(Material, texture_id), 40);
    }

    #[test]
    fn demo_scene_is_consistent() {
        let scene = demo_scene();
        assert_eq!(scene.meshes.len(), 4);
        for mesh in &scene.meshes {
            assert_eq!(mesh.indices.len() % 3, 0);
            assert_eq!(mesh.material_indices.len() as u32, mesh.triangle_count());
            for &m in &mesh.material_indices {
                assert!((m as usize) < scene.materials.len());
            }
            for &i in &mesh.indices {
                assert!((i as usize) < mesh.vertices.len());
            }
        }
        for instance in &scene.instances {
            assert!(instance.mesh_index < scene.meshes.len());
        }
    }
}
