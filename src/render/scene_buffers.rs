// GPU-resident scene - per-mesh buffers and the object description table
//
// Both raster and ray-trace shaders reach the geometry through the buffer
// device addresses recorded here. Immutable once the scene is uploaded.

use anyhow::Result;
use ash::vk;
use bytemuck::{Pod, Zeroable};
use crate::backend::resource::BufferResource;
use crate::backend::VulkanDevice;
use crate::scene::Scene;

/// Per-instance record consumed by the shaders (scalar layout, 40 bytes).
/// Field order mirrors the shader-side struct; the explicit pad keeps the
/// 64-bit addresses 8-aligned on both sides.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct ObjDesc {
    pub txt_offset: i32,
    pub _pad: u32,
    pub vertex_address: u64,
    pub index_address: u64,
    pub material_address: u64,
    pub material_index_address: u64,
}

pub struct MeshBuffers {
    pub vertex: BufferResource,
    pub index: BufferResource,
    pub material_index: BufferResource,
    pub vertex_count: u32,
    pub index_count: u32,
}

pub struct SceneBuffers {
    pub meshes: Vec<MeshBuffers>,
    pub materials: BufferResource,
    pub object_descriptions: BufferResource,
    /// Host copy of the table, one entry per instance
    pub descriptions: Vec<ObjDesc>,
}

impl SceneBuffers {
    pub fn upload(device: &VulkanDevice, scene: &Scene) -> Result<Self> {
        // Vertex/index buffers double as acceleration-structure build input
        let geometry_usage = vk::BufferUsageFlags::STORAGE_BUFFER
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
            | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR;
        let table_usage =
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;

        let mut meshes = Vec::with_capacity(scene.meshes.len());
        for (i, mesh) in scene.meshes.iter().enumerate() {
            let vertex = BufferResource::with_data(
                device,
                &format!("mesh{}.vertices", i),
                geometry_usage,
                &mesh.vertices,
            )?;
            let index = BufferResource::with_data(
                device,
                &format!("mesh{}.indices", i),
                geometry_usage,
                &mesh.indices,
            )?;
            let material_index = BufferResource::with_data(
                device,
                &format!("mesh{}.matindices", i),
                table_usage,
                &mesh.material_indices,
            )?;
            meshes.push(MeshBuffers {
                vertex,
                index,
                material_index,
                vertex_count: mesh.vertices.len() as u32,
                index_count: mesh.indices.len() as u32,
            });
        }

        let materials =
            BufferResource::with_data(device, "scene.materials", table_usage, &scene.materials)?;
        let material_address = materials.device_address(device);

        let descriptions: Vec<ObjDesc> = scene
            .instances
            .iter()
            .map(|instance| {
                let mesh = &meshes[instance.mesh_index];
                ObjDesc {
                    txt_offset: 0,
                    _pad: 0,
                    vertex_address: mesh.vertex.device_address(device),
                    index_address: mesh.index.device_address(device),
                    material_address,
                    material_index_address: mesh.material_index.device_address(device),
                }
            })
            .collect();

        let object_descriptions = BufferResource::with_data(
            device,
            "scene.objdesc",
            vk::BufferUsageFlags::STORAGE_BUFFER,
            &descriptions,
        )?;

        let triangles: u32 = scene.meshes.iter().map(|m| m.triangle_count()).sum();
        log::info!(
            "Uploaded scene: {} meshes ({} triangles), {} materials, {} instances",
            meshes.len(),
            triangles,
            scene.materials.len(),
            descriptions.len()
        );

        Ok(Self { meshes, materials, object_descriptions, descriptions })
    }

    pub fn destroy(self, device: &VulkanDevice) {
        for mesh in self.meshes {
            mesh.vertex.destroy(device);
            mesh.index.destroy(device);
            mesh.material_index.destroy(device);
        }
        self.materials.destroy(device);
        self.object_descriptions.destroy(device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{offset_of, size_of};

    #[test]
    fn object_description_matches_shader_layout() {
        assert_eq!(size_of::<ObjDesc>(), 40);
        assert_eq!(offset_of!(ObjDesc, vertex_address), 8);
        assert_eq!(offset_of!(ObjDesc, index_address), 16);
        assert_eq!(offset_of!(ObjDesc, material_address), 24);
        assert_eq!(offset_of!(ObjDesc, material_index_address), 32);
    }
}
