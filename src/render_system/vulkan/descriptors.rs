//! Descriptor sets behind the [`ResourceBinder`](crate::render_system::resource_binder).

use std::{
    collections::HashMap,
    hash::{DefaultHasher, Hash, Hasher},
    sync::Arc,
};

use vulkano::{
    VulkanObject,
    acceleration_structure::AccelerationStructure,
    buffer::Subbuffer,
    descriptor_set::{
        DescriptorSet, WriteDescriptorSet, allocator::StandardDescriptorSetAllocator,
        layout::DescriptorBindingFlags,
    },
    image::{sampler::Sampler, view::ImageView},
    pipeline::PipelineLayout,
};

use crate::{
    error::RenderError,
    render_system::resource_binder::{
        BoundResource, PipelineStage, ResourceBinding, ResourceId, ResourceSetKind,
        SetDeclaration, SetWriter, StageLayout,
    },
};

#[derive(Clone)]
pub enum VulkanResource {
    Buffer(Subbuffer<[u8]>),
    AccelerationStructure(Arc<AccelerationStructure>),
    Sampler(Arc<Sampler>),
    Image(Arc<ImageView>),
}

impl VulkanResource {
    pub fn buffer<T: ?Sized>(buffer: &Subbuffer<T>) -> VulkanResource {
        VulkanResource::Buffer(buffer.as_bytes().clone())
    }
}

impl BoundResource for VulkanResource {
    fn identity(&self) -> ResourceId {
        let mut hasher = DefaultHasher::new();
        match self {
            VulkanResource::Buffer(b) => {
                (0u8, b.buffer().handle(), b.offset(), b.size()).hash(&mut hasher)
            }
            VulkanResource::AccelerationStructure(a) => (1u8, a.handle()).hash(&mut hasher),
            VulkanResource::Sampler(s) => (2u8, s.handle()).hash(&mut hasher),
            VulkanResource::Image(i) => (3u8, i.handle()).hash(&mut hasher),
        }
        ResourceId(hasher.finish())
    }
}

/// The sets every stage declares. Set numbers match the shader interfaces.
pub fn stage_layouts(texture_count: u32) -> Vec<StageLayout> {
    vec![
        StageLayout {
            stage: PipelineStage::RayTrace,
            sets: vec![
                SetDeclaration::single(0, ResourceSetKind::AccelerationStructure, 1),
                SetDeclaration::single(1, ResourceSetKind::SceneUniforms, 1),
                // vertices, indices, instances
                SetDeclaration::single(2, ResourceSetKind::Geometry, 3),
                // materials, sampler, textures
                SetDeclaration::single(3, ResourceSetKind::Materials, 2).with_array(2, texture_count),
                SetDeclaration::single(4, ResourceSetKind::Lights, 1),
                // accumulation, radiance, albedo, normal, flow
                SetDeclaration::single(5, ResourceSetKind::RenderTargets, 5),
            ],
        },
        StageLayout {
            stage: PipelineStage::Exposure,
            // accumulation, exposure
            sets: vec![SetDeclaration::single(0, ResourceSetKind::PostProcessTargets, 2)],
        },
        StageLayout {
            stage: PipelineStage::PostProcess,
            // accumulation, denoised, exposure, output
            sets: vec![SetDeclaration::single(0, ResourceSetKind::PostProcessTargets, 4)],
        },
    ]
}

/// Writes sets against the layouts of the pipeline behind each stage.
pub struct VulkanSetWriter {
    allocator: Arc<StandardDescriptorSetAllocator>,
    layouts: HashMap<PipelineStage, Arc<PipelineLayout>>,
}

impl VulkanSetWriter {
    pub fn new(
        allocator: Arc<StandardDescriptorSetAllocator>,
        layouts: impl IntoIterator<Item = (PipelineStage, Arc<PipelineLayout>)>,
    ) -> VulkanSetWriter {
        VulkanSetWriter {
            allocator,
            layouts: layouts.into_iter().collect(),
        }
    }

    pub fn pipeline_layout(&self, stage: PipelineStage) -> Option<&Arc<PipelineLayout>> {
        self.layouts.get(&stage)
    }
}

fn write(
    stage: PipelineStage,
    set: u32,
    binding: &ResourceBinding<VulkanResource>,
) -> Result<WriteDescriptorSet, RenderError> {
    let mixed = || RenderError::MixedBinding {
        stage,
        set,
        binding: binding.binding,
    };
    let index = binding.binding;

    macro_rules! collect {
        ($variant:ident) => {
            binding
                .resources
                .iter()
                .map(|r| match r {
                    VulkanResource::$variant(x) => Ok(x.clone()),
                    _ => Err(mixed()),
                })
                .collect::<Result<Vec<_>, _>>()?
        };
    }

    Ok(match binding.resources.first() {
        Some(VulkanResource::Buffer(_)) => {
            WriteDescriptorSet::buffer_array(index, 0, collect!(Buffer))
        }
        Some(VulkanResource::AccelerationStructure(_)) => {
            WriteDescriptorSet::acceleration_structure_array(
                index,
                0,
                collect!(AccelerationStructure),
            )
        }
        Some(VulkanResource::Sampler(_)) => {
            WriteDescriptorSet::sampler_array(index, 0, collect!(Sampler))
        }
        Some(VulkanResource::Image(_)) => {
            WriteDescriptorSet::image_view_array(index, 0, collect!(Image))
        }
        None => WriteDescriptorSet::none(index),
    })
}

impl SetWriter for VulkanSetWriter {
    type Resource = VulkanResource;
    type Set = Arc<DescriptorSet>;

    fn write_set(
        &mut self,
        stage: PipelineStage,
        declaration: &SetDeclaration,
        bindings: &[ResourceBinding<VulkanResource>],
    ) -> Result<Arc<DescriptorSet>, RenderError> {
        let unknown = RenderError::UnknownResourceSet {
            stage,
            set: declaration.set,
        };
        let layout = self
            .layouts
            .get(&stage)
            .and_then(|l| l.set_layouts().get(declaration.set as usize))
            .ok_or(unknown)?
            .clone();

        let writes = bindings
            .iter()
            .map(|b| write(stage, declaration.set, b))
            .collect::<Result<Vec<_>, _>>()?;

        let variable_count = layout
            .bindings()
            .iter()
            .find(|(_, b)| {
                b.binding_flags
                    .intersects(DescriptorBindingFlags::VARIABLE_DESCRIPTOR_COUNT)
            })
            .and_then(|(binding, _)| {
                declaration
                    .bindings
                    .iter()
                    .find(|d| d.binding == *binding)
                    .map(|d| d.count)
            });

        let set = match variable_count {
            Some(count) => DescriptorSet::new_variable(
                self.allocator.clone(),
                layout,
                count,
                writes,
                [],
            )?,
            None => DescriptorSet::new(self.allocator.clone(), layout, writes, [])?,
        };
        log::debug!("wrote {stage:?} set {} ({:?})", declaration.set, declaration.kind);
        Ok(set)
    }
}
