// Acceleration structures - one BLAS per mesh, one TLAS over the instances
//
// BLAS and TLAS have independent lifetimes: rebuilding the TLAS after a
// transform change leaves every BLAS untouched, and a BLAS always outlives
// any TLAS that references it. Builds run on one-shot command buffers with
// scratch buffers freed once the GPU wait returns.

use anyhow::{Context, Result};
use ash::vk;
use glam::Mat4;
use gpu_allocator::MemoryLocation;
use crate::backend::resource::BufferResource;
use crate::backend::VulkanDevice;
use super::scene_buffers::{MeshBuffers, SceneBuffers};

pub struct Blas {
    pub accel: vk::AccelerationStructureKHR,
    buffer: BufferResource,
    pub device_address: vk::DeviceAddress,
}

pub struct Tlas {
    pub accel: vk::AccelerationStructureKHR,
    buffer: BufferResource,
    pub instance_count: u32,
}

/// One entry in the top-level structure.
pub struct TlasInstance {
    pub blas_index: usize,
    pub transform: Mat4,
    pub custom_index: u32,
}

pub struct AccelerationStructures {
    pub blases: Vec<Blas>,
    pub tlas: Tlas,
}

/// Vulkan wants a row-major 3x4; glam stores column-major 4x4.
pub fn vk_transform(m: &Mat4) -> vk::TransformMatrixKHR {
    let c = m.to_cols_array_2d();
    vk::TransformMatrixKHR {
        matrix: [
            c[0][0], c[1][0], c[2][0], c[3][0],
            c[0][1], c[1][1], c[2][1], c[3][1],
            c[0][2], c[1][2], c[2][2], c[3][2],
        ],
    }
}

impl AccelerationStructures {
    pub fn build(
        device: &VulkanDevice,
        scene: &SceneBuffers,
        instances: &[TlasInstance],
    ) -> Result<Self> {
        let blases = scene
            .meshes
            .iter()
            .enumerate()
            .map(|(i, mesh)| {
                build_blas(device, mesh, i).with_context(|| format!("Building BLAS for mesh {}", i))
            })
            .collect::<Result<Vec<_>>>()?;

        log::info!("Built {} bottom-level acceleration structures", blases.len());

        let tlas = build_tlas(device, &blases, instances)?;

        Ok(Self { blases, tlas })
    }

    /// Rebuild only the top-level structure (instance transforms changed).
    /// Caller must have confirmed the device is idle for the old TLAS.
    pub fn rebuild_tlas(&mut self, device: &VulkanDevice, instances: &[TlasInstance]) -> Result<()> {
        let new_tlas = build_tlas(device, &self.blases, instances)?;
        let old = std::mem::replace(&mut self.tlas, new_tlas);
        destroy_tlas(device, old);
        Ok(())
    }

    pub fn destroy(self, device: &VulkanDevice) {
        // TLAS references the BLASes; release it first
        destroy_tlas(device, self.tlas);
        for blas in self.blases {
            unsafe { device.ext.accel.destroy_acceleration_structure(blas.accel, None) };
            blas.buffer.destroy(device);
        }
    }
}

fn destroy_tlas(device: &VulkanDevice, tlas: Tlas) {
    unsafe { device.ext.accel.destroy_acceleration_structure(tlas.accel, None) };
    tlas.buffer.destroy(device);
}

fn build_blas(device: &VulkanDevice, mesh: &MeshBuffers, index: usize) -> Result<Blas> {
    let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::builder()
        .vertex_format(vk::Format::R32G32B32_SFLOAT)
        .vertex_data(vk::DeviceOrHostAddressConstKHR {
            device_address: mesh.vertex.device_address(device),
        })
        .vertex_stride(std::mem::size_of::<crate::scene::Vertex>() as u64)
        .max_vertex(mesh.vertex_count.saturating_sub(1))
        .index_type(vk::IndexType::UINT32)
        .index_data(vk::DeviceOrHostAddressConstKHR {
            device_address: mesh.index.device_address(device),
        })
        .build();

    let geometry = vk::AccelerationStructureGeometryKHR::builder()
        .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
        .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
        .flags(vk::GeometryFlagsKHR::OPAQUE)
        .build();

    let primitive_count = mesh.index_count / 3;
    build_structure(
        device,
        vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
        geometry,
        primitive_count,
        &format!("blas{}", index),
    )
    .map(|(accel, buffer, device_address)| Blas { accel, buffer, device_address })
}

fn build_tlas(
    device: &VulkanDevice,
    blases: &[Blas],
    instances: &[TlasInstance],
) -> Result<Tlas> {
    let vk_instances: Vec<vk::AccelerationStructureInstanceKHR> = instances
        .iter()
        .map(|instance| vk::AccelerationStructureInstanceKHR {
            transform: vk_transform(&instance.transform),
            instance_custom_index_and_mask: vk::Packed24_8::new(instance.custom_index, 0xff),
            instance_shader_binding_table_record_offset_and_flags: vk::Packed24_8::new(
                0,
                vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw() as u8,
            ),
            acceleration_structure_reference: vk::AccelerationStructureReferenceKHR {
                device_handle: blases[instance.blas_index].device_address,
            },
        })
        .collect();

    // A zero-instance scene still gets a valid (empty) TLAS: allocate one
    // zeroed slot so the build input address is real, and build with
    // primitive_count = 0. Ray queries then miss everywhere.
    let instance_count = vk_instances.len() as u32;
    let slot_count = vk_instances.len().max(1);
    let instance_stride = std::mem::size_of::<vk::AccelerationStructureInstanceKHR>();

    let mut instance_buffer = BufferResource::new(
        device,
        "tlas.instances",
        (slot_count * instance_stride) as vk::DeviceSize,
        vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        MemoryLocation::CpuToGpu,
    )?;
    if vk_instances.is_empty() {
        instance_buffer.write_bytes(&vec![0u8; instance_stride])?;
    } else {
        // AccelerationStructureInstanceKHR contains unions, so cast manually
        let bytes = unsafe {
            std::slice::from_raw_parts(
                vk_instances.as_ptr() as *const u8,
                vk_instances.len() * instance_stride,
            )
        };
        instance_buffer.write_bytes(bytes)?;
    }

    let instances_data = vk::AccelerationStructureGeometryInstancesDataKHR::builder()
        .array_of_pointers(false)
        .data(vk::DeviceOrHostAddressConstKHR {
            device_address: instance_buffer.device_address(device),
        })
        .build();

    let geometry = vk::AccelerationStructureGeometryKHR::builder()
        .geometry_type(vk::GeometryTypeKHR::INSTANCES)
        .geometry(vk::AccelerationStructureGeometryDataKHR { instances: instances_data })
        .build();

    let result = build_structure(
        device,
        vk::AccelerationStructureTypeKHR::TOP_LEVEL,
        geometry,
        instance_count,
        "tlas",
    );

    instance_buffer.destroy(device);

    let (accel, buffer, _) = result?;
    log::info!("Built TLAS over {} instances", instance_count);
    Ok(Tlas { accel, buffer, instance_count })
}

/// Shared size-query / create / build / wait sequence for both levels.
fn build_structure(
    device: &VulkanDevice,
    ty: vk::AccelerationStructureTypeKHR,
    geometry: vk::AccelerationStructureGeometryKHR,
    primitive_count: u32,
    name: &str,
) -> Result<(vk::AccelerationStructureKHR, BufferResource, vk::DeviceAddress)> {
    let geometries = [geometry];
    let mut build_info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
        .ty(ty)
        .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
        .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
        .geometries(&geometries)
        .build();

    let sizes = unsafe {
        device.ext.accel.get_acceleration_structure_build_sizes(
            vk::AccelerationStructureBuildTypeKHR::DEVICE,
            &build_info,
            &[primitive_count],
        )
    };

    let buffer = BufferResource::new(
        device,
        name,
        sizes.acceleration_structure_size,
        vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        MemoryLocation::GpuOnly,
    )?;

    let create_info = vk::AccelerationStructureCreateInfoKHR::builder()
        .buffer(buffer.buffer)
        .size(sizes.acceleration_structure_size)
        .ty(ty);
    let accel = unsafe { device.ext.accel.create_acceleration_structure(&create_info, None) }
        .with_context(|| format!("Failed to create acceleration structure '{}'", name))?;

    let scratch = BufferResource::new(
        device,
        &format!("{}.scratch", name),
        sizes.build_scratch_size,
        vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        MemoryLocation::GpuOnly,
    )?;

    build_info.dst_acceleration_structure = accel;
    build_info.scratch_data = vk::DeviceOrHostAddressKHR {
        device_address: scratch.device_address(device),
    };

    let range = vk::AccelerationStructureBuildRangeInfoKHR {
        primitive_count,
        primitive_offset: 0,
        first_vertex: 0,
        transform_offset: 0,
    };

    device
        .execute_one_shot(|cmd| unsafe {
            device
                .ext
                .accel
                .cmd_build_acceleration_structures(cmd, &[build_info], &[&[range]]);
        })
        .with_context(|| format!("Failed to build acceleration structure '{}'", name))?;

    // The one-shot waited for the GPU, so scratch is safe to release
    scratch.destroy(device);

    let address_info = vk::AccelerationStructureDeviceAddressInfoKHR::builder()
        .acceleration_structure(accel);
    let device_address =
        unsafe { device.ext.accel.get_acceleration_structure_device_address(&address_info) };

    Ok((accel, buffer, device_address))
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    #[test]
    fn transform_conversion_is_row_major_3x4() {
        let m = Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0));
        let t = vk_transform(&m);
        // Rotation part stays identity, translation lands in each row's tail
        assert_eq!(t.matrix[0], 1.0);
        assert_eq!(t.matrix[3], 1.0);
        assert_eq!(t.matrix[7], 2.0);
        assert_eq!(t.matrix[11], 3.0);
    }

    #[test]
    fn transform_conversion_transposes_rotation() {
        let m = Mat4::from_rotation_y(std::f32::consts::FRAC_PI_2);
        let t = vk_transform(&m);
        // Column-major sin in m becomes row-major sin in t
        assert!((t.matrix[2] - 1.0).abs() < 1e-6); // row 0, col 2
        assert!((t.matrix[8] + 1.0).abs() < 1e-6); // row 2, col 0
    }
}
