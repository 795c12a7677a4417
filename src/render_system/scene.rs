//! The static scene: a box room lit by an emissive panel, with a few textured blocks.
//!
//! Everything is generated on the host, uploaded once and never modified; the acceleration
//! structures are built in the same submission as the texture uploads.

use std::sync::Arc;

use image::{Rgba, RgbaImage};
use nalgebra::{Isometry3, Matrix4, Point3, Translation3, UnitQuaternion, Vector3};
use vulkano::{
    DeviceSize, Packed24_8,
    acceleration_structure::{
        AccelerationStructure, AccelerationStructureBuildGeometryInfo,
        AccelerationStructureBuildRangeInfo, AccelerationStructureBuildSizesInfo,
        AccelerationStructureBuildType, AccelerationStructureCreateInfo,
        AccelerationStructureGeometries, AccelerationStructureGeometryInstancesData,
        AccelerationStructureGeometryInstancesDataType, AccelerationStructureGeometryTrianglesData,
        AccelerationStructureInstance, AccelerationStructureType, BuildAccelerationStructureFlags,
        BuildAccelerationStructureMode, GeometryFlags,
    },
    buffer::{Buffer, BufferContents, BufferCreateInfo, BufferUsage, IndexBuffer, Subbuffer},
    command_buffer::{
        AutoCommandBufferBuilder, CommandBufferUsage, CopyBufferToImageInfo,
        PrimaryAutoCommandBuffer, PrimaryCommandBufferAbstract,
    },
    device::{DeviceOwned, Queue},
    format::Format,
    image::{
        Image, ImageCreateInfo, ImageType, ImageUsage,
        sampler::{Sampler, SamplerCreateInfo},
        view::ImageView,
    },
    memory::allocator::{AllocationCreateInfo, MemoryAllocator, MemoryTypeFilter},
    pipeline::graphics::vertex_input::Vertex,
    sync::GpuFuture,
};

use crate::{
    error::RenderError,
    utils::{self, Mesh},
};

use super::{
    vertex::{InstanceData, LightQuad, MaterialData, Vertex3D},
    vulkan::Allocators,
};

pub struct SceneObject {
    pub mesh: Mesh,
    pub isometry: Isometry3<f32>,
}

/// Host-side scene content, before upload.
pub struct SceneDescription {
    pub objects: Vec<SceneObject>,
    pub materials: Vec<MaterialData>,
    pub textures: Vec<RgbaImage>,
    /// world space, must coincide with the emissive geometry
    pub lights: Vec<LightQuad>,
}

const WHITE: u32 = 0;
const RED: u32 = 1;
const GREEN: u32 = 2;
const FLOOR: u32 = 3;
const BRICK: u32 = 4;
const LATTICE: u32 = 5;
const PANEL: u32 = 6;

fn checker_texture() -> RgbaImage {
    RgbaImage::from_fn(64, 64, |x, y| {
        if (x / 8 + y / 8) % 2 == 0 {
            Rgba([220, 220, 220, 255])
        } else {
            Rgba([90, 90, 100, 255])
        }
    })
}

fn brick_texture() -> RgbaImage {
    RgbaImage::from_fn(64, 64, |x, y| {
        let row = y / 8;
        let shifted = x + if row % 2 == 0 { 0 } else { 8 };
        if y % 8 == 0 || shifted % 16 == 0 {
            Rgba([200, 195, 185, 255])
        } else {
            Rgba([170, 70 + ((x * 7 + y * 13) % 20) as u8, 50, 255])
        }
    })
}

/// Bars with transparent gaps, rendered through the any-hit alpha test.
fn lattice_texture() -> RgbaImage {
    RgbaImage::from_fn(64, 64, |x, y| {
        if x % 16 < 4 || y % 16 < 4 {
            Rgba([230, 200, 90, 255])
        } else {
            Rgba([0, 0, 0, 0])
        }
    })
}

/// An emissive quad and the light sampling it.
fn emissive_panel(
    corner: Point3<f32>,
    edge_a: Vector3<f32>,
    edge_b: Vector3<f32>,
    emission: [f32; 3],
) -> (Mesh, LightQuad) {
    let light = LightQuad {
        corner: corner.into(),
        area: edge_a.cross(&edge_b).norm(),
        edge_a: edge_a.into(),
        _pad0: 0.0,
        edge_b: edge_b.into(),
        _pad1: 0.0,
        emission,
        _pad2: 0.0,
    };
    (utils::quad(corner, edge_a, edge_b, PANEL), light)
}

impl SceneDescription {
    pub fn box_room() -> SceneDescription {
        let emission = [14.0, 12.5, 10.0];

        let mut room = Mesh::default();
        // floor, back, left and right walls facing inwards; the ceiling is open to the sky
        room.extend(utils::quad(
            Point3::new(-3.0, 0.0, -3.0),
            Vector3::new(0.0, 0.0, 6.0),
            Vector3::new(6.0, 0.0, 0.0),
            FLOOR,
        ));
        room.extend(utils::quad(
            Point3::new(-3.0, 0.0, -3.0),
            Vector3::new(6.0, 0.0, 0.0),
            Vector3::new(0.0, 3.0, 0.0),
            WHITE,
        ));
        room.extend(utils::quad(
            Point3::new(-3.0, 0.0, -3.0),
            Vector3::new(0.0, 3.0, 0.0),
            Vector3::new(0.0, 0.0, 6.0),
            RED,
        ));
        room.extend(utils::quad(
            Point3::new(3.0, 0.0, -3.0),
            Vector3::new(0.0, 0.0, 6.0),
            Vector3::new(0.0, 3.0, 0.0),
            GREEN,
        ));

        // facing down
        let (panel, light) = emissive_panel(
            Point3::new(-0.75, 2.9, -0.75),
            Vector3::new(1.5, 0.0, 0.0),
            Vector3::new(0.0, 0.0, 1.5),
            emission,
        );

        let objects = vec![
            SceneObject {
                mesh: room,
                isometry: Isometry3::identity(),
            },
            SceneObject {
                mesh: panel,
                isometry: Isometry3::identity(),
            },
            SceneObject {
                mesh: utils::cuboid(Point3::origin(), Vector3::new(1.0, 1.0, 1.0), BRICK),
                isometry: Isometry3::from_parts(
                    Translation3::new(-1.2, 0.5, -1.0),
                    UnitQuaternion::from_axis_angle(&Vector3::y_axis(), 0.4),
                ),
            },
            SceneObject {
                mesh: utils::cuboid(Point3::origin(), Vector3::new(1.0, 1.6, 1.0), LATTICE),
                isometry: Isometry3::from_parts(
                    Translation3::new(1.1, 0.8, 0.3),
                    UnitQuaternion::from_axis_angle(&Vector3::y_axis(), -0.3),
                ),
            },
        ];

        SceneDescription {
            objects,
            materials: vec![
                MaterialData::diffuse([0.8, 0.8, 0.8], None),
                MaterialData::diffuse([0.75, 0.15, 0.12], None),
                MaterialData::diffuse([0.15, 0.6, 0.15], None),
                MaterialData::diffuse([1.0, 1.0, 1.0], Some(0)),
                MaterialData::diffuse([1.0, 1.0, 1.0], Some(1)),
                MaterialData::diffuse([1.0, 1.0, 1.0], Some(2)),
                MaterialData::emissive(emission),
            ],
            textures: vec![checker_texture(), brick_texture(), lattice_texture()],
            lights: vec![light],
        }
    }

    /// Instance table entries, objects laid out back to back in the shared buffers.
    pub fn instance_data(&self) -> Vec<InstanceData> {
        let mut vertex_offset = 0;
        let mut index_offset = 0;
        self.objects
            .iter()
            .map(|o| {
                let instance = InstanceData {
                    vertex_offset,
                    index_offset,
                };
                vertex_offset += o.mesh.vertices.len() as u32;
                index_offset += o.mesh.indices.len() as u32;
                instance
            })
            .collect()
    }
}

/// The uploaded scene, referenced by the geometry, material and light resource sets.
pub struct Scene {
    pub tlas: Arc<AccelerationStructure>,
    pub vertices: Subbuffer<[Vertex3D]>,
    pub indices: Subbuffer<[u32]>,
    pub instances: Subbuffer<[InstanceData]>,
    pub materials: Subbuffer<[MaterialData]>,
    pub lights: Subbuffer<[LightQuad]>,
    pub textures: Vec<Arc<ImageView>>,
    pub sampler: Arc<Sampler>,
    // referenced by the top level structure through device addresses
    _blas: Vec<Arc<AccelerationStructure>>,
}

impl Scene {
    pub fn texture_count(&self) -> u32 {
        self.textures.len() as u32
    }

    /// Uploads `description` and builds its acceleration structures, waiting for completion.
    pub fn upload(
        description: SceneDescription,
        queue: Arc<Queue>,
        allocators: &Allocators,
    ) -> Result<Scene, RenderError> {
        let memory_allocator: Arc<dyn MemoryAllocator> = allocators.memory.clone();
        let instance_data = description.instance_data();

        let geometry_usage = BufferUsage::STORAGE_BUFFER
            | BufferUsage::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY
            | BufferUsage::SHADER_DEVICE_ADDRESS;
        let vertices = upload_slice(
            memory_allocator.clone(),
            geometry_usage,
            description
                .objects
                .iter()
                .flat_map(|o| o.mesh.vertices.iter().copied()),
        )?;
        let indices = upload_slice(
            memory_allocator.clone(),
            geometry_usage,
            description
                .objects
                .iter()
                .flat_map(|o| o.mesh.indices.iter().copied()),
        )?;
        let instances = upload_slice(
            memory_allocator.clone(),
            BufferUsage::STORAGE_BUFFER,
            instance_data.iter().copied(),
        )?;
        let materials = upload_slice(
            memory_allocator.clone(),
            BufferUsage::STORAGE_BUFFER,
            description.materials.iter().copied(),
        )?;
        let lights = upload_slice(
            memory_allocator.clone(),
            BufferUsage::STORAGE_BUFFER,
            description.lights.iter().copied(),
        )?;

        let mut builder = AutoCommandBufferBuilder::primary(
            allocators.command_buffer.clone(),
            queue.queue_family_index(),
            CommandBufferUsage::OneTimeSubmit,
        )?;

        let textures = load_textures(&mut builder, memory_allocator.clone(), description.textures)?;

        let mut blas = vec![];
        for (object, instance) in description.objects.iter().zip(&instance_data) {
            let vertex_range = instance.vertex_offset as DeviceSize
                ..(instance.vertex_offset as usize + object.mesh.vertices.len()) as DeviceSize;
            let index_range = instance.index_offset as DeviceSize
                ..(instance.index_offset as usize + object.mesh.indices.len()) as DeviceSize;
            blas.push(create_bottom_level_acceleration_structure(
                &mut builder,
                memory_allocator.clone(),
                vertices.clone().slice(vertex_range),
                indices.clone().slice(index_range),
            )?);
        }

        let placed: Vec<_> = blas
            .iter()
            .zip(&description.objects)
            .map(|(blas, object)| (blas.as_ref(), &object.isometry))
            .collect();
        let tlas = create_top_level_acceleration_structure(
            &mut builder,
            memory_allocator.clone(),
            &placed,
        )?;

        builder
            .build()?
            .execute(queue.clone())?
            .then_signal_fence_and_flush()?
            .wait(None)?;

        let sampler = Sampler::new(
            queue.device().clone(),
            SamplerCreateInfo::simple_repeat_linear(),
        )?;

        log::info!(
            "uploaded scene: {} objects, {} triangles, {} textures, {} lights",
            description.objects.len(),
            indices.len() / 3,
            textures.len(),
            lights.len()
        );

        Ok(Scene {
            tlas,
            vertices,
            indices,
            instances,
            materials,
            lights,
            textures,
            sampler,
            _blas: blas,
        })
    }
}

fn upload_slice<T: BufferContents>(
    memory_allocator: Arc<dyn MemoryAllocator>,
    usage: BufferUsage,
    data: impl ExactSizeIterator<Item = T>,
) -> Result<Subbuffer<[T]>, RenderError> {
    Ok(Buffer::from_iter(
        memory_allocator,
        BufferCreateInfo {
            usage,
            ..Default::default()
        },
        AllocationCreateInfo {
            memory_type_filter: MemoryTypeFilter::PREFER_DEVICE
                | MemoryTypeFilter::HOST_SEQUENTIAL_WRITE,
            ..Default::default()
        },
        data,
    )?)
}

fn load_textures(
    builder: &mut AutoCommandBufferBuilder<PrimaryAutoCommandBuffer>,
    memory_allocator: Arc<dyn MemoryAllocator>,
    textures: Vec<RgbaImage>,
) -> Result<Vec<Arc<ImageView>>, RenderError> {
    let mut image_views = vec![];

    for texture in textures {
        let extent = [texture.width(), texture.height(), 1];

        let upload_buffer = Buffer::from_iter(
            memory_allocator.clone(),
            BufferCreateInfo {
                usage: BufferUsage::TRANSFER_SRC,
                ..Default::default()
            },
            AllocationCreateInfo {
                memory_type_filter: MemoryTypeFilter::PREFER_HOST
                    | MemoryTypeFilter::HOST_SEQUENTIAL_WRITE,
                ..Default::default()
            },
            texture.into_raw(),
        )?;

        let image = Image::new(
            memory_allocator.clone(),
            ImageCreateInfo {
                image_type: ImageType::Dim2d,
                format: Format::R8G8B8A8_SRGB,
                extent,
                usage: ImageUsage::TRANSFER_DST | ImageUsage::SAMPLED,
                ..Default::default()
            },
            AllocationCreateInfo::default(),
        )
        .map_err(|e| RenderError::Allocation(e.to_string()))?;

        builder.copy_buffer_to_image(CopyBufferToImageInfo::buffer_image(
            upload_buffer,
            image.clone(),
        ))?;

        image_views.push(ImageView::new_default(image)?);
    }

    Ok(image_views)
}

fn create_top_level_acceleration_structure(
    builder: &mut AutoCommandBufferBuilder<PrimaryAutoCommandBuffer>,
    memory_allocator: Arc<dyn MemoryAllocator>,
    bottom_level_acceleration_structures: &[(&AccelerationStructure, &Isometry3<f32>)],
) -> Result<Arc<AccelerationStructure>, RenderError> {
    let instances = bottom_level_acceleration_structures
        .iter()
        .enumerate()
        .map(|(i, (blas, isometry))| AccelerationStructureInstance {
            // read back as gl_InstanceCustomIndexEXT to find the instance's geometry
            instance_custom_index_and_mask: Packed24_8::new(i as u32, 0xff),
            instance_shader_binding_table_record_offset_and_flags: Packed24_8::new(0, 0),
            acceleration_structure_reference: blas.device_address().get(),
            transform: {
                let isometry_matrix: [[f32; 4]; 4] = Matrix4::from(**isometry).transpose().into();
                [isometry_matrix[0], isometry_matrix[1], isometry_matrix[2]]
            },
        })
        .collect::<Vec<_>>();

    let values = Buffer::from_iter(
        memory_allocator.clone(),
        BufferCreateInfo {
            usage: BufferUsage::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY
                | BufferUsage::SHADER_DEVICE_ADDRESS,
            ..Default::default()
        },
        AllocationCreateInfo {
            memory_type_filter: MemoryTypeFilter::PREFER_DEVICE
                | MemoryTypeFilter::HOST_SEQUENTIAL_WRITE,
            ..Default::default()
        },
        instances,
    )?;

    let geometries =
        AccelerationStructureGeometries::Instances(AccelerationStructureGeometryInstancesData::new(
            AccelerationStructureGeometryInstancesDataType::Values(Some(values)),
        ));

    let build_info = AccelerationStructureBuildGeometryInfo {
        flags: BuildAccelerationStructureFlags::PREFER_FAST_TRACE,
        mode: BuildAccelerationStructureMode::Build,
        ..AccelerationStructureBuildGeometryInfo::new(geometries)
    };

    let build_range_infos = [AccelerationStructureBuildRangeInfo {
        primitive_count: bottom_level_acceleration_structures.len() as _,
        primitive_offset: 0,
        first_vertex: 0,
        transform_offset: 0,
    }];

    build_acceleration_structure(
        builder,
        memory_allocator,
        AccelerationStructureType::TopLevel,
        build_info,
        &[bottom_level_acceleration_structures.len() as u32],
        build_range_infos,
    )
}

fn create_bottom_level_acceleration_structure(
    builder: &mut AutoCommandBufferBuilder<PrimaryAutoCommandBuffer>,
    memory_allocator: Arc<dyn MemoryAllocator>,
    vertex_buffer: Subbuffer<[Vertex3D]>,
    index_buffer: Subbuffer<[u32]>,
) -> Result<Arc<AccelerationStructure>, RenderError> {
    let description = Vertex3D::per_vertex();
    let position_format = description
        .members
        .get("position")
        .map(|m| m.format)
        .ok_or_else(|| RenderError::Allocation("vertex type has no position".to_string()))?;

    let primitive_count = index_buffer.len() as u32 / 3;
    let triangles = AccelerationStructureGeometryTrianglesData {
        // not opaque: the any-hit shaders alpha test textured surfaces
        flags: GeometryFlags::NO_DUPLICATE_ANY_HIT_INVOCATION,
        vertex_data: Some(vertex_buffer.clone().into_bytes()),
        vertex_stride: description.stride,
        max_vertex: vertex_buffer.len() as _,
        index_data: Some(IndexBuffer::U32(index_buffer)),
        transform_data: None,
        ..AccelerationStructureGeometryTrianglesData::new(position_format)
    };

    let geometries = AccelerationStructureGeometries::Triangles(vec![triangles]);
    let build_info = AccelerationStructureBuildGeometryInfo {
        flags: BuildAccelerationStructureFlags::PREFER_FAST_TRACE,
        mode: BuildAccelerationStructureMode::Build,
        ..AccelerationStructureBuildGeometryInfo::new(geometries)
    };

    build_acceleration_structure(
        builder,
        memory_allocator,
        AccelerationStructureType::BottomLevel,
        build_info,
        &[primitive_count],
        [AccelerationStructureBuildRangeInfo {
            primitive_count,
            primitive_offset: 0,
            first_vertex: 0,
            transform_offset: 0,
        }],
    )
}

fn create_acceleration_structure(
    memory_allocator: Arc<dyn MemoryAllocator>,
    ty: AccelerationStructureType,
    size: DeviceSize,
) -> Result<Arc<AccelerationStructure>, RenderError> {
    let buffer = Buffer::new_slice::<u8>(
        memory_allocator.clone(),
        BufferCreateInfo {
            usage: BufferUsage::ACCELERATION_STRUCTURE_STORAGE | BufferUsage::SHADER_DEVICE_ADDRESS,
            ..Default::default()
        },
        AllocationCreateInfo {
            memory_type_filter: MemoryTypeFilter::PREFER_DEVICE,
            ..Default::default()
        },
        size,
    )?;

    let acceleration_structure = unsafe {
        AccelerationStructure::new(
            memory_allocator.device().clone(),
            AccelerationStructureCreateInfo {
                ty,
                ..AccelerationStructureCreateInfo::new(buffer)
            },
        )?
    };
    Ok(acceleration_structure)
}

/// A device buffer whose address is aligned to `alignment`.
pub(crate) fn create_aligned_buffer(
    memory_allocator: Arc<dyn MemoryAllocator>,
    usage: BufferUsage,
    memory_type_filter: MemoryTypeFilter,
    size: DeviceSize,
    alignment: DeviceSize,
) -> Result<Subbuffer<[u8]>, RenderError> {
    let subbuffer = Buffer::new_slice::<u8>(
        memory_allocator,
        BufferCreateInfo {
            usage: usage | BufferUsage::SHADER_DEVICE_ADDRESS,
            ..Default::default()
        },
        AllocationCreateInfo {
            memory_type_filter,
            ..Default::default()
        },
        size + alignment,
    )?;

    // get the next aligned offset
    let subbuffer_address: DeviceSize = subbuffer.device_address()?.into();
    let aligned_offset = (alignment - subbuffer_address % alignment) % alignment;

    Ok(subbuffer.slice(aligned_offset..(aligned_offset + size)))
}

fn create_scratch_buffer(
    memory_allocator: Arc<dyn MemoryAllocator>,
    size: DeviceSize,
) -> Result<Subbuffer<[u8]>, RenderError> {
    let alignment = memory_allocator
        .device()
        .physical_device()
        .properties()
        .min_acceleration_structure_scratch_offset_alignment
        .unwrap_or(256) as DeviceSize;

    create_aligned_buffer(
        memory_allocator,
        BufferUsage::STORAGE_BUFFER,
        MemoryTypeFilter::PREFER_DEVICE,
        size,
        alignment,
    )
}

// SAFETY: the geometry referenced by `build_info` must outlive the returned structure.
fn build_acceleration_structure(
    builder: &mut AutoCommandBufferBuilder<PrimaryAutoCommandBuffer>,
    memory_allocator: Arc<dyn MemoryAllocator>,
    ty: AccelerationStructureType,
    mut build_info: AccelerationStructureBuildGeometryInfo,
    max_primitive_counts: &[u32],
    build_range_infos: impl IntoIterator<Item = AccelerationStructureBuildRangeInfo>,
) -> Result<Arc<AccelerationStructure>, RenderError> {
    let device = memory_allocator.device();

    let AccelerationStructureBuildSizesInfo {
        acceleration_structure_size,
        build_scratch_size,
        ..
    } = device.acceleration_structure_build_sizes(
        AccelerationStructureBuildType::Device,
        &build_info,
        max_primitive_counts,
    )?;

    let acceleration_structure =
        create_acceleration_structure(memory_allocator.clone(), ty, acceleration_structure_size)?;
    let scratch_buffer = create_scratch_buffer(memory_allocator.clone(), build_scratch_size)?;

    build_info.dst_acceleration_structure = Some(acceleration_structure.clone());
    build_info.scratch_data = Some(scratch_buffer);

    unsafe {
        builder.build_acceleration_structure(build_info, build_range_infos.into_iter().collect())?;
    }

    Ok(acceleration_structure)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instances_are_laid_out_back_to_back() {
        let scene = SceneDescription::box_room();
        let instances = scene.instance_data();
        assert_eq!(instances.len(), scene.objects.len());
        assert_eq!(instances[0], InstanceData { vertex_offset: 0, index_offset: 0 });
        for (pair, object) in instances.windows(2).zip(&scene.objects) {
            assert_eq!(
                pair[1].vertex_offset - pair[0].vertex_offset,
                object.mesh.vertices.len() as u32
            );
            assert_eq!(
                pair[1].index_offset - pair[0].index_offset,
                object.mesh.indices.len() as u32
            );
        }
    }

    #[test]
    fn materials_and_textures_are_consistent() {
        let scene = SceneDescription::box_room();
        let texture_count = scene.textures.len() as i32;
        assert!(scene.materials.iter().all(|m| m.texture < texture_count));
        for object in &scene.objects {
            assert!(object
                .mesh
                .vertices
                .iter()
                .all(|v| (v.material as usize) < scene.materials.len()));
        }
    }

    #[test]
    fn every_light_has_emissive_geometry() {
        let scene = SceneDescription::box_room();
        assert_eq!(scene.lights.len(), 1);
        let light = scene.lights[0];
        assert!((light.area - 2.25).abs() < 1e-6);

        let panel = &scene.objects[1].mesh;
        assert_eq!(panel.vertices[0].position, light.corner);
        let material = scene.materials[panel.vertices[0].material as usize];
        assert_eq!(material.emission, light.emission);

        // the panel faces the floor
        let normal = Vector3::from(light.edge_a).cross(&Vector3::from(light.edge_b));
        assert!(normal.y < 0.0);
    }

    #[test]
    fn lattice_texture_has_holes() {
        let texture = lattice_texture();
        assert_eq!(texture.get_pixel(0, 0)[3], 255);
        assert_eq!(texture.get_pixel(8, 8)[3], 0);
    }
}
