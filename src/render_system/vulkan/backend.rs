use std::{sync::Arc, time::Duration};

use ash::vk;
use vulkano::{
    VulkanObject,
    buffer::{Buffer, BufferCreateInfo, BufferUsage, Subbuffer},
    command_buffer::{AutoCommandBufferBuilder, CommandBufferUsage, PrimaryAutoCommandBuffer},
    descriptor_set::DescriptorSet,
    device::{Device, Queue},
    memory::allocator::{AllocationCreateInfo, MemoryAllocator, MemoryTypeFilter},
    pipeline::{Pipeline, PipelineBindPoint},
    swapchain::Surface,
};

use crate::{
    config::RenderConfig,
    error::RenderError,
    render_system::{
        accumulation::SizedResource,
        cross_device::DenoiserBindings,
        exposure_shader,
        frame::SceneUniformData,
        orchestrator::{Acquire, FrameBackend, PostProcessSettings, PresentOutcome},
        postprocess_shader,
        resource_binder::{PipelineStage, ResourceBinder, ResourceBinding},
        scene::Scene,
        shader_binding_table::ShaderBindingTableBuilder,
        timeline::{TimelineSignal, TimelineWait},
    },
};

use super::{
    context::{Allocators, RenderingDevice},
    descriptors::{VulkanResource, VulkanSetWriter, stage_layouts},
    interop::{ExportableBuffer, SharedBufferHandoff},
    pipelines::{Pipelines, UploadedBindingTable, VulkanGroupHandles},
    swapchain::{AcquiredImage, SwapchainTarget, get_surface_extent},
    sync::{self, RawFence, RawSemaphore, SemaphoreSignal, SemaphoreWait},
};

// log-average luminance is mapped to middle grey
const EXPOSURE_KEY: f32 = 0.18;
// pixels sampled by the exposure reduction
const EXPOSURE_SAMPLES: u64 = 1 << 16;

/// Running average of the radiance samples, four floats per pixel.
#[derive(Clone)]
pub struct AccumulationBuffer {
    buffer: Subbuffer<[f32]>,
    extent: [u32; 2],
}

impl AccumulationBuffer {
    pub fn buffer(&self) -> &Subbuffer<[f32]> {
        &self.buffer
    }
}

impl SizedResource for AccumulationBuffer {
    fn extent(&self) -> [u32; 2] {
        self.extent
    }
}

pub struct VulkanFrameBackend {
    device: Arc<Device>,
    graphics_queue: Arc<Queue>,
    compute_queue: Arc<Queue>,
    allocators: Allocators,
    target: SwapchainTarget,
    _scene: Scene,
    pipelines: Pipelines,
    binding_table: UploadedBindingTable,
    binder: ResourceBinder<VulkanSetWriter>,
    uniforms: Subbuffer<SceneUniformData>,
    exposure: Subbuffer<[f32]>,
    // stands in for the denoiser buffers when there is no denoiser
    placeholder: Subbuffer<[f32]>,
    accumulation_extent: [u32; 2],
    // ownership transfers of the denoiser buffers, absent without a denoiser
    handoff: Option<SharedBufferHandoff>,
    frame_fence: RawFence,
    // command buffers of the frame guarded by `frame_fence`
    in_flight: Vec<Arc<PrimaryAutoCommandBuffer>>,
}

impl VulkanFrameBackend {
    /// Builds the pipelines and the binding table and binds the scene. The size-dependent sets
    /// are bound later through [`FrameBackend::bind_size_dependent`].
    pub fn new(
        rendering: &RenderingDevice,
        surface: Arc<Surface>,
        allocators: Allocators,
        scene: Scene,
        config: &RenderConfig,
    ) -> Result<VulkanFrameBackend, RenderError> {
        let device = rendering.device.clone();
        let memory_allocator: Arc<dyn MemoryAllocator> = allocators.memory.clone();

        let target = SwapchainTarget::new(
            surface,
            rendering.graphics_queue.clone(),
            memory_allocator.clone(),
            config.fence_timeout(),
        )?;

        let pipelines = Pipelines::new(device.clone(), scene.texture_count())?;
        let table = ShaderBindingTableBuilder::new(&config.capabilities.group_layout)?
            .build(&VulkanGroupHandles::new(&pipelines.ray_trace))?;
        let binding_table = UploadedBindingTable::new(memory_allocator.clone(), &table)?;

        let writer = VulkanSetWriter::new(
            allocators.descriptor_set.clone(),
            [
                (PipelineStage::RayTrace, pipelines.ray_trace.layout().clone()),
                (PipelineStage::Exposure, pipelines.exposure.layout().clone()),
                (PipelineStage::PostProcess, pipelines.postprocess.layout().clone()),
            ],
        );
        let mut binder = ResourceBinder::new(writer, stage_layouts(scene.texture_count()));

        let host_visible = AllocationCreateInfo {
            memory_type_filter: MemoryTypeFilter::PREFER_DEVICE
                | MemoryTypeFilter::HOST_SEQUENTIAL_WRITE,
            ..Default::default()
        };
        let uniforms = Buffer::from_data(
            memory_allocator.clone(),
            BufferCreateInfo {
                usage: BufferUsage::UNIFORM_BUFFER,
                ..Default::default()
            },
            host_visible.clone(),
            SceneUniformData::default(),
        )?;
        let exposure = Buffer::from_iter(
            memory_allocator.clone(),
            BufferCreateInfo {
                usage: BufferUsage::STORAGE_BUFFER,
                ..Default::default()
            },
            host_visible.clone(),
            [0.0f32, 1.0],
        )?;
        let placeholder = Buffer::from_iter(
            memory_allocator,
            BufferCreateInfo {
                usage: BufferUsage::STORAGE_BUFFER,
                ..Default::default()
            },
            host_visible,
            [0.0f32; 4],
        )?;

        bind_scene(&mut binder, &scene, &uniforms)?;

        Ok(VulkanFrameBackend {
            frame_fence: RawFence::new_signaled(device.clone())?,
            device,
            graphics_queue: rendering.graphics_queue.clone(),
            compute_queue: rendering.compute_queue.clone(),
            allocators,
            target,
            _scene: scene,
            pipelines,
            binding_table,
            binder,
            uniforms,
            exposure,
            placeholder,
            accumulation_extent: [0, 0],
            handoff: None,
            in_flight: vec![],
        })
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    fn command_buffer(
        &self,
        queue: &Queue,
    ) -> Result<AutoCommandBufferBuilder<PrimaryAutoCommandBuffer>, RenderError> {
        Ok(AutoCommandBufferBuilder::primary(
            self.allocators.command_buffer.clone(),
            queue.queue_family_index(),
            CommandBufferUsage::OneTimeSubmit,
        )?)
    }

    fn sets(&self, stage: PipelineStage) -> Vec<Arc<DescriptorSet>> {
        self.binder.sets(stage).into_iter().cloned().collect()
    }
}

fn bind_scene(
    binder: &mut ResourceBinder<VulkanSetWriter>,
    scene: &Scene,
    uniforms: &Subbuffer<SceneUniformData>,
) -> Result<(), RenderError> {
    let stage = PipelineStage::RayTrace;
    binder.bind_set(
        stage,
        0,
        vec![ResourceBinding::one(
            0,
            VulkanResource::AccelerationStructure(scene.tlas.clone()),
        )],
    )?;
    binder.bind_set(
        stage,
        1,
        vec![ResourceBinding::one(0, VulkanResource::buffer(uniforms))],
    )?;
    binder.bind_set(
        stage,
        2,
        vec![
            ResourceBinding::one(0, VulkanResource::buffer(&scene.vertices)),
            ResourceBinding::one(1, VulkanResource::buffer(&scene.indices)),
            ResourceBinding::one(2, VulkanResource::buffer(&scene.instances)),
        ],
    )?;
    binder.bind_set(
        stage,
        3,
        vec![
            ResourceBinding::one(0, VulkanResource::buffer(&scene.materials)),
            ResourceBinding::one(1, VulkanResource::Sampler(scene.sampler.clone())),
            ResourceBinding::array(
                2,
                scene
                    .textures
                    .iter()
                    .cloned()
                    .map(VulkanResource::Image)
                    .collect(),
            ),
        ],
    )?;
    binder.bind_set(
        stage,
        4,
        vec![ResourceBinding::one(0, VulkanResource::buffer(&scene.lights))],
    )?;
    Ok(())
}

impl FrameBackend for VulkanFrameBackend {
    type Semaphore = RawSemaphore;
    type AccumulationBuffer = AccumulationBuffer;
    type SharedBuffer = ExportableBuffer;
    type Target = AcquiredImage;

    fn surface_extent(&self) -> [u32; 2] {
        get_surface_extent(self.target.surface())
    }

    fn create_timeline_semaphore(&self) -> Result<RawSemaphore, RenderError> {
        RawSemaphore::timeline(self.device.clone(), None)
    }

    fn allocate_accumulation(&self, extent: [u32; 2]) -> Result<AccumulationBuffer, RenderError> {
        let buffer = Buffer::new_slice::<f32>(
            self.allocators.memory.clone(),
            BufferCreateInfo {
                usage: BufferUsage::STORAGE_BUFFER,
                ..Default::default()
            },
            AllocationCreateInfo {
                memory_type_filter: MemoryTypeFilter::PREFER_DEVICE,
                ..Default::default()
            },
            // a minimized window still gets a valid buffer
            (extent[0].max(1) as u64) * (extent[1].max(1) as u64) * 4,
        )?;
        Ok(AccumulationBuffer { buffer, extent })
    }

    fn bind_size_dependent(
        &mut self,
        accumulation: &AccumulationBuffer,
        denoiser: Option<DenoiserBindings<ExportableBuffer>>,
    ) -> Result<(), RenderError> {
        let acc = VulkanResource::buffer(accumulation.buffer());
        let exposure = VulkanResource::buffer(&self.exposure);
        let output = VulkanResource::buffer(self.target.output());
        let placeholder = VulkanResource::buffer(&self.placeholder);
        // the previous set of transfers is no longer in flight, resizes drain first
        self.handoff = denoiser
            .as_ref()
            .map(|d| {
                SharedBufferHandoff::rendering(
                    self.device.clone(),
                    d,
                    self.graphics_queue.queue_family_index(),
                    self.compute_queue.queue_family_index(),
                )
            })
            .transpose()?;
        let shared = denoiser.map(|d| DenoiserBindings {
            radiance: VulkanResource::buffer(d.radiance.buffer()),
            albedo: VulkanResource::buffer(d.albedo.buffer()),
            normal: VulkanResource::buffer(d.normal.buffer()),
            flow: VulkanResource::buffer(d.flow.buffer()),
            output: VulkanResource::buffer(d.output.buffer()),
        });

        let rewritten = self.binder.rebind_size_dependent(|stage, _| {
            Ok(match stage {
                PipelineStage::RayTrace => {
                    let [radiance, albedo, normal, flow] = match &shared {
                        Some(s) => [
                            s.radiance.clone(),
                            s.albedo.clone(),
                            s.normal.clone(),
                            s.flow.clone(),
                        ],
                        None => std::array::from_fn(|_| placeholder.clone()),
                    };
                    vec![
                        ResourceBinding::one(0, acc.clone()),
                        ResourceBinding::one(1, radiance),
                        ResourceBinding::one(2, albedo),
                        ResourceBinding::one(3, normal),
                        ResourceBinding::one(4, flow),
                    ]
                }
                PipelineStage::Exposure => vec![
                    ResourceBinding::one(0, acc.clone()),
                    ResourceBinding::one(1, exposure.clone()),
                ],
                PipelineStage::PostProcess => vec![
                    ResourceBinding::one(0, acc.clone()),
                    // never read while denoising is off
                    ResourceBinding::one(
                        1,
                        shared.as_ref().map_or_else(|| acc.clone(), |s| s.output.clone()),
                    ),
                    ResourceBinding::one(2, exposure.clone()),
                    ResourceBinding::one(3, output.clone()),
                ],
            })
        })?;
        self.accumulation_extent = accumulation.extent();
        log::debug!("rebound {rewritten} size-dependent sets");
        Ok(())
    }

    fn acquire(&mut self) -> Result<Acquire<AcquiredImage>, RenderError> {
        self.target.acquire()
    }

    fn wait_for_previous_frame(&mut self, timeout: Duration) -> Result<(), RenderError> {
        self.frame_fence.wait("previous frame", timeout)?;
        self.frame_fence.reset()?;
        self.in_flight.clear();
        Ok(())
    }

    fn write_uniforms(&mut self, uniforms: &SceneUniformData) -> Result<(), RenderError> {
        *self.uniforms.write()? = *uniforms;
        Ok(())
    }

    fn submit_ray_trace(
        &mut self,
        extent: [u32; 2],
        signal: TimelineSignal<'_, RawSemaphore>,
    ) -> Result<(), RenderError> {
        let pipeline = self.pipelines.ray_trace.clone();
        let mut builder = self.command_buffer(&self.graphics_queue)?;
        builder
            .bind_pipeline_ray_tracing(pipeline.clone())?
            .bind_descriptor_sets(
                PipelineBindPoint::RayTracing,
                pipeline.layout().clone(),
                0,
                self.sets(PipelineStage::RayTrace),
            )?;
        unsafe {
            builder.trace_rays(
                self.binding_table.addresses().clone(),
                [extent[0].max(1), extent[1].max(1), 1],
            )?;
        }
        let command_buffer = builder.build()?;

        let mut command_buffers = vec![command_buffer.handle()];
        if let Some(handoff) = &self.handoff {
            command_buffers.push(handoff.release.command_buffer());
        }
        unsafe {
            sync::submit(
                &self.graphics_queue,
                &command_buffers,
                &[],
                &[SemaphoreSignal {
                    semaphore: signal.semaphore.handle(),
                    value: signal.value,
                }],
                vk::Fence::null(),
            )?;
        }
        self.in_flight.push(command_buffer);
        Ok(())
    }

    fn submit_composite(
        &mut self,
        target: &AcquiredImage,
        wait: TimelineWait<'_, RawSemaphore>,
        settings: &PostProcessSettings,
    ) -> Result<(), RenderError> {
        let [xsize, ysize] = self.target.extent();
        let mut builder = self.command_buffer(&self.compute_queue)?;

        // until the pending resize happens the image keeps its previous contents
        if self.accumulation_extent == [xsize, ysize] {
            if settings.auto_exposure {
                let pixel_count = xsize as u64 * ysize as u64;
                let exposure = self.pipelines.exposure.clone();
                builder
                    .bind_pipeline_compute(exposure.clone())?
                    .bind_descriptor_sets(
                        PipelineBindPoint::Compute,
                        exposure.layout().clone(),
                        0,
                        self.sets(PipelineStage::Exposure),
                    )?
                    .push_constants(
                        exposure.layout().clone(),
                        0,
                        exposure_shader::PushConstants {
                            pixel_count: pixel_count as u32,
                            stride: pixel_count.div_ceil(EXPOSURE_SAMPLES).max(1) as u32,
                            key: EXPOSURE_KEY,
                        },
                    )?;
                unsafe {
                    builder.dispatch([1, 1, 1])?;
                }
            }

            let postprocess = self.pipelines.postprocess.clone();
            builder
                .bind_pipeline_compute(postprocess.clone())?
                .bind_descriptor_sets(
                    PipelineBindPoint::Compute,
                    postprocess.layout().clone(),
                    0,
                    self.sets(PipelineStage::PostProcess),
                )?
                .push_constants(
                    postprocess.layout().clone(),
                    0,
                    postprocess_shader::PushConstants {
                        xsize,
                        ysize,
                        use_denoised: settings.denoised as u32,
                        exposure_adjustment: settings.exposure_adjustment,
                        auto_exposure: settings.auto_exposure as u32,
                    },
                )?;
            unsafe {
                builder.dispatch([xsize.div_ceil(16), ysize.div_ceil(16), 1])?;
            }
        } else {
            log::debug!(
                "skipping post-process, accumulation is {:?} and the target {:?}",
                self.accumulation_extent,
                [xsize, ysize]
            );
        }
        let command_buffer = builder.build()?;

        let mut command_buffers = vec![];
        if let Some(handoff) = &self.handoff {
            command_buffers.push(handoff.acquire.command_buffer());
        }
        command_buffers.extend([command_buffer.handle(), target.blit]);
        unsafe {
            sync::submit(
                &self.compute_queue,
                &command_buffers,
                &[
                    SemaphoreWait {
                        semaphore: target.acquire_semaphore,
                        value: 0,
                        stage: vk::PipelineStageFlags::TRANSFER,
                    },
                    SemaphoreWait {
                        semaphore: wait.semaphore.handle(),
                        value: wait.value,
                        stage: vk::PipelineStageFlags::COMPUTE_SHADER,
                    },
                ],
                &[SemaphoreSignal {
                    semaphore: target.present_semaphore,
                    value: 0,
                }],
                self.frame_fence.handle(),
            )?;
        }
        self.in_flight.push(command_buffer);
        Ok(())
    }

    fn present(&mut self, target: AcquiredImage) -> Result<PresentOutcome, RenderError> {
        self.target.present(target)
    }

    fn drain(&mut self, timeout: Duration) -> Result<(), RenderError> {
        // the composite is the last submission of a frame and waits on everything before it
        self.frame_fence.wait("in-flight frame", timeout)?;
        self.in_flight.clear();
        Ok(())
    }

    fn recreate_target(&mut self, extent: [u32; 2]) -> Result<[u32; 2], RenderError> {
        self.target.recreate(extent)
    }
}
