//! The ray tracing pipeline, its shader binding table and the compute pipelines of the
//! composite pass.

use std::sync::Arc;

use ash::vk::StridedDeviceAddressRegionKHR;
use vulkano::{
    DeviceSize,
    buffer::{BufferUsage, Subbuffer},
    descriptor_set::layout::DescriptorBindingFlags,
    device::{Device, DeviceOwned},
    memory::allocator::{MemoryAllocator, MemoryTypeFilter},
    pipeline::{
        ComputePipeline, PipelineLayout, PipelineShaderStageCreateInfo,
        compute::ComputePipelineCreateInfo,
        layout::PipelineDescriptorSetLayoutCreateInfo,
        ray_tracing::{
            RayTracingPipeline, RayTracingPipelineCreateInfo, RayTracingShaderGroupCreateInfo,
            ShaderBindingTableAddresses,
        },
    },
    shader::{EntryPoint, ShaderModule},
};

use crate::{
    error::RenderError,
    render_system::{
        any_hit_shader, closest_hit_shader, exposure_shader, miss_shader, postprocess_shader,
        raygen_shader, scene::create_aligned_buffer,
        shader_binding_table::{
            GroupHandleSource, HandleProperties, RegionPlacement, ShaderBindingTable,
        },
        shadow_any_hit_shader, shadow_miss_shader,
    },
};

// set and binding of the texture array in the ray tracing layout
const TEXTURE_SET: usize = 3;
const TEXTURE_BINDING: u32 = 2;

fn entry_point(
    module: Result<Arc<ShaderModule>, vulkano::Validated<vulkano::VulkanError>>,
    name: &str,
) -> Result<EntryPoint, RenderError> {
    module?.entry_point("main").ok_or_else(|| {
        RenderError::Pipeline(format!("{name} shader has no main entry point"))
    })
}

/// Builds the ray tracing pipeline. Group `i` matches `ShaderGroup::ALL[i]`.
pub fn create_ray_trace_pipeline(
    device: Arc<Device>,
    texture_count: u32,
) -> Result<Arc<RayTracingPipeline>, RenderError> {
    let stages = [
        entry_point(raygen_shader::load(device.clone()), "raygen")?,
        entry_point(miss_shader::load(device.clone()), "miss")?,
        entry_point(shadow_miss_shader::load(device.clone()), "shadow miss")?,
        entry_point(closest_hit_shader::load(device.clone()), "closest hit")?,
        entry_point(any_hit_shader::load(device.clone()), "any hit")?,
        entry_point(shadow_any_hit_shader::load(device.clone()), "shadow any hit")?,
    ]
    .map(PipelineShaderStageCreateInfo::new);

    let groups = [
        RayTracingShaderGroupCreateInfo::General { general_shader: 0 },
        RayTracingShaderGroupCreateInfo::General { general_shader: 1 },
        RayTracingShaderGroupCreateInfo::General { general_shader: 2 },
        RayTracingShaderGroupCreateInfo::TrianglesHit {
            closest_hit_shader: Some(3),
            any_hit_shader: Some(4),
        },
        RayTracingShaderGroupCreateInfo::TrianglesHit {
            closest_hit_shader: None,
            any_hit_shader: Some(5),
        },
    ];

    let layout = {
        let mut layout_create_info = PipelineDescriptorSetLayoutCreateInfo::from_stages(&stages);

        // the texture array holds exactly as many descriptors as the scene has textures
        let binding = layout_create_info
            .set_layouts
            .get_mut(TEXTURE_SET)
            .and_then(|set| set.bindings.get_mut(&TEXTURE_BINDING))
            .ok_or_else(|| {
                RenderError::Pipeline("ray tracing shaders declare no texture array".into())
            })?;
        binding.binding_flags |= DescriptorBindingFlags::VARIABLE_DESCRIPTOR_COUNT;
        binding.descriptor_count = texture_count;

        PipelineLayout::new(
            device.clone(),
            layout_create_info
                .into_pipeline_layout_create_info(device.clone())
                .map_err(|e| RenderError::Pipeline(format!("{e:?}")))?,
        )?
    };

    let pipeline = RayTracingPipeline::new(
        device,
        None,
        RayTracingPipelineCreateInfo {
            stages: stages.into_iter().collect(),
            groups: groups.into_iter().collect(),
            max_pipeline_ray_recursion_depth: 1,
            ..RayTracingPipelineCreateInfo::layout(layout)
        },
    )?;
    Ok(pipeline)
}

pub fn create_compute_pipeline(
    device: Arc<Device>,
    module: Result<Arc<ShaderModule>, vulkano::Validated<vulkano::VulkanError>>,
    name: &str,
) -> Result<Arc<ComputePipeline>, RenderError> {
    let stage = PipelineShaderStageCreateInfo::new(entry_point(module, name)?);

    let layout = PipelineLayout::new(
        device.clone(),
        PipelineDescriptorSetLayoutCreateInfo::from_stages(&[stage.clone()])
            .into_pipeline_layout_create_info(device.clone())
            .map_err(|e| RenderError::Pipeline(format!("{e:?}")))?,
    )?;

    Ok(ComputePipeline::new(
        device,
        None,
        ComputePipelineCreateInfo::stage_layout(stage, layout),
    )?)
}

pub struct Pipelines {
    pub ray_trace: Arc<RayTracingPipeline>,
    pub exposure: Arc<ComputePipeline>,
    pub postprocess: Arc<ComputePipeline>,
}

impl Pipelines {
    pub fn new(device: Arc<Device>, texture_count: u32) -> Result<Pipelines, RenderError> {
        Ok(Pipelines {
            ray_trace: create_ray_trace_pipeline(device.clone(), texture_count)?,
            exposure: create_compute_pipeline(
                device.clone(),
                exposure_shader::load(device.clone()),
                "exposure",
            )?,
            postprocess: create_compute_pipeline(
                device.clone(),
                postprocess_shader::load(device.clone()),
                "post-process",
            )?,
        })
    }
}

/// Reads the group handles of a compiled ray tracing pipeline.
pub struct VulkanGroupHandles<'a> {
    pipeline: &'a RayTracingPipeline,
}

impl<'a> VulkanGroupHandles<'a> {
    pub fn new(pipeline: &'a RayTracingPipeline) -> VulkanGroupHandles<'a> {
        VulkanGroupHandles { pipeline }
    }
}

impl GroupHandleSource for VulkanGroupHandles<'_> {
    fn handle_properties(&self) -> HandleProperties {
        let properties = self.pipeline.device().physical_device().properties();
        // missing limits come back as zero and are rejected by the builder
        HandleProperties {
            handle_size: properties.shader_group_handle_size.unwrap_or(0),
            handle_alignment: properties.shader_group_handle_alignment.unwrap_or(0),
            base_alignment: properties.shader_group_base_alignment.unwrap_or(0),
        }
    }

    fn group_handles(&self, count: u32) -> Result<Vec<u8>, RenderError> {
        let data = self
            .pipeline
            .device()
            .ray_tracing_shader_group_handles(self.pipeline, 0, count)?;
        Ok(data.iter().flatten().copied().collect())
    }
}

/// A binding table in device memory.
pub struct UploadedBindingTable {
    _buffer: Subbuffer<[u8]>,
    addresses: ShaderBindingTableAddresses,
}

impl UploadedBindingTable {
    pub fn new(
        memory_allocator: Arc<dyn MemoryAllocator>,
        table: &ShaderBindingTable,
    ) -> Result<UploadedBindingTable, RenderError> {
        let layout = table.device_layout();
        let buffer = create_aligned_buffer(
            memory_allocator,
            BufferUsage::SHADER_BINDING_TABLE | BufferUsage::TRANSFER_SRC,
            MemoryTypeFilter::HOST_SEQUENTIAL_WRITE | MemoryTypeFilter::PREFER_DEVICE,
            layout.bytes.len() as DeviceSize,
            table.properties().base_alignment as DeviceSize,
        )?;
        buffer.write()?.copy_from_slice(&layout.bytes);

        let base: DeviceSize = buffer.device_address()?.into();
        let region = |p: RegionPlacement| StridedDeviceAddressRegionKHR {
            device_address: base + p.offset,
            stride: p.stride,
            size: p.size,
        };

        Ok(UploadedBindingTable {
            addresses: ShaderBindingTableAddresses {
                raygen: region(layout.raygen),
                miss: region(layout.miss),
                hit: region(layout.hit),
                callable: StridedDeviceAddressRegionKHR::default(),
            },
            _buffer: buffer,
        })
    }

    pub fn addresses(&self) -> &ShaderBindingTableAddresses {
        &self.addresses
    }
}
