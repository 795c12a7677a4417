//! Vulkan side of the cross-device bridge: exportable allocations and timeline semaphores on the
//! rendering device, their imports on the denoising device and the filter run there.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use ash::vk;
use vulkano::{
    DeviceSize, VulkanObject,
    buffer::{BufferCreateInfo, BufferUsage, Subbuffer, sys::RawBuffer},
    command_buffer::{
        AutoCommandBufferBuilder, CommandBufferUsage, PrimaryAutoCommandBuffer,
    },
    descriptor_set::{DescriptorSet, WriteDescriptorSet},
    device::{Device, DeviceOwned, Queue},
    memory::{
        DedicatedAllocation, DeviceMemory, ExternalMemoryHandleType, ExternalMemoryHandleTypes,
        MemoryAllocateInfo, MemoryImportInfo, MemoryPropertyFlags, ResourceMemory,
    },
    pipeline::{ComputePipeline, Pipeline, PipelineBindPoint},
};

use crate::{
    config::DenoiseSettings,
    error::{RenderError, check},
    render_system::{
        accumulation::SizedResource,
        cross_device::{
            DenoiseKernel, DenoiserBindings, ExportSource, HandleKind, Import, NativeHandle,
            PrimaryExporter, SecondaryDevice, SharedAllocation,
        },
        denoise_shader,
        frame::Frame,
        timeline::{TimelineSignal, TimelineWait},
    },
};

use super::{
    context::Allocators,
    pipelines::create_compute_pipeline,
    sync::{
        self, Handoff, OwnershipTransfer, RawSemaphore, SemaphoreSignal, SemaphoreWait,
        memory_handle_type, semaphore_handle_type,
    },
};

fn external_memory_types(kind: HandleKind) -> ExternalMemoryHandleTypes {
    match kind {
        HandleKind::OpaqueFd => ExternalMemoryHandleTypes::OPAQUE_FD,
        HandleKind::OpaqueWin32 => ExternalMemoryHandleTypes::OPAQUE_WIN32,
    }
}

fn device_local_memory_type(device: &Device, memory_type_bits: u32) -> Result<u32, RenderError> {
    device
        .physical_device()
        .memory_properties()
        .memory_types
        .iter()
        .enumerate()
        .position(|(i, t)| {
            memory_type_bits & (1 << i) != 0
                && t.property_flags.contains(MemoryPropertyFlags::DEVICE_LOCAL)
        })
        .map(|i| i as u32)
        .ok_or_else(|| RenderError::Allocation("no device local memory type for a shared buffer".into()))
}

/// A storage buffer backed by a dedicated, exportable allocation.
#[derive(Clone)]
pub struct ExportableBuffer {
    buffer: Subbuffer<[u8]>,
    // owned by `buffer`
    memory: vk::DeviceMemory,
    extent: [u32; 2],
    allocation_size: DeviceSize,
}

impl ExportableBuffer {
    pub fn new(
        device: Arc<Device>,
        extent: [u32; 2],
        texel_size: u32,
        kind: HandleKind,
    ) -> Result<ExportableBuffer, RenderError> {
        let handle_types = external_memory_types(kind);
        let size = extent[0] as DeviceSize * extent[1] as DeviceSize * texel_size as DeviceSize;
        let raw = RawBuffer::new(
            device.clone(),
            BufferCreateInfo {
                size,
                usage: BufferUsage::STORAGE_BUFFER
                    | BufferUsage::TRANSFER_SRC
                    | BufferUsage::TRANSFER_DST,
                external_memory_handle_types: handle_types,
                ..Default::default()
            },
        )?;

        let requirements = raw.memory_requirements();
        let allocation_size = requirements.layout.size();
        let memory = DeviceMemory::allocate(
            device.clone(),
            MemoryAllocateInfo {
                allocation_size,
                memory_type_index: device_local_memory_type(&device, requirements.memory_type_bits)?,
                dedicated_allocation: Some(DedicatedAllocation::Buffer(&raw)),
                export_handle_types: handle_types,
                ..Default::default()
            },
        )?;
        let memory_handle = memory.handle();

        let buffer = raw
            .bind_memory(ResourceMemory::new_dedicated(memory))
            .map_err(|(e, _, _)| e)?;

        Ok(ExportableBuffer {
            buffer: Subbuffer::new(Arc::new(buffer)),
            memory: memory_handle,
            extent,
            allocation_size,
        })
    }

    pub fn buffer(&self) -> &Subbuffer<[u8]> {
        &self.buffer
    }
}

impl SizedResource for ExportableBuffer {
    fn extent(&self) -> [u32; 2] {
        self.extent
    }
}

impl SharedAllocation for ExportableBuffer {
    fn allocation_size(&self) -> u64 {
        self.allocation_size
    }
}

impl ExportSource for ExportableBuffer {
    fn export(&self, kind: HandleKind) -> Result<NativeHandle, RenderError> {
        let device = self.buffer.device();
        match kind {
            #[cfg(unix)]
            HandleKind::OpaqueFd => {
                let info = vk::MemoryGetFdInfoKHR::default()
                    .memory(self.memory)
                    .handle_type(memory_handle_type(kind));
                let mut fd = -1;
                unsafe {
                    check(
                        "vkGetMemoryFdKHR",
                        (device.fns().khr_external_memory_fd.get_memory_fd_khr)(
                            device.handle(),
                            &info,
                            &mut fd,
                        ),
                    )?;
                    Ok(native_fd(fd))
                }
            }
            #[cfg(windows)]
            HandleKind::OpaqueWin32 => {
                let info = vk::MemoryGetWin32HandleInfoKHR::default()
                    .memory(self.memory)
                    .handle_type(memory_handle_type(kind));
                let mut handle = 0;
                unsafe {
                    check(
                        "vkGetMemoryWin32HandleKHR",
                        (device.fns().khr_external_memory_win32.get_memory_win32_handle_khr)(
                            device.handle(),
                            &info,
                            &mut handle,
                        ),
                    )?;
                    Ok(native_win32(handle))
                }
            }
            kind => Err(RenderError::export(
                "buffer",
                format!("{kind:?} handles are not available on this platform"),
            )),
        }
    }
}

impl ExportSource for RawSemaphore {
    fn export(&self, kind: HandleKind) -> Result<NativeHandle, RenderError> {
        let device = self.device();
        match kind {
            #[cfg(unix)]
            HandleKind::OpaqueFd => {
                let info = vk::SemaphoreGetFdInfoKHR::default()
                    .semaphore(self.handle())
                    .handle_type(semaphore_handle_type(kind));
                let mut fd = -1;
                unsafe {
                    check(
                        "vkGetSemaphoreFdKHR",
                        (device.fns().khr_external_semaphore_fd.get_semaphore_fd_khr)(
                            device.handle(),
                            &info,
                            &mut fd,
                        ),
                    )?;
                    Ok(native_fd(fd))
                }
            }
            #[cfg(windows)]
            HandleKind::OpaqueWin32 => {
                let info = vk::SemaphoreGetWin32HandleInfoKHR::default()
                    .semaphore(self.handle())
                    .handle_type(semaphore_handle_type(kind));
                let mut handle = 0;
                unsafe {
                    check(
                        "vkGetSemaphoreWin32HandleKHR",
                        (device.fns().khr_external_semaphore_win32.get_semaphore_win32_handle_khr)(
                            device.handle(),
                            &info,
                            &mut handle,
                        ),
                    )?;
                    Ok(native_win32(handle))
                }
            }
            kind => Err(RenderError::export(
                "semaphore",
                format!("{kind:?} handles are not available on this platform"),
            )),
        }
    }
}

// SAFETY: `fd` must be a descriptor the caller owns.
#[cfg(unix)]
unsafe fn native_fd(fd: std::os::fd::RawFd) -> NativeHandle {
    use std::os::fd::FromRawFd;
    NativeHandle::Fd(unsafe { std::fs::File::from_raw_fd(fd) })
}

// SAFETY: `handle` must be a handle the caller owns.
#[cfg(windows)]
unsafe fn native_win32(handle: vk::HANDLE) -> NativeHandle {
    use std::os::windows::io::{FromRawHandle, OwnedHandle, RawHandle};
    NativeHandle::Win32(unsafe { OwnedHandle::from_raw_handle(handle as RawHandle) })
}

/// The rendering device as the exporting side of the bridge.
pub struct VulkanExporter {
    device: Arc<Device>,
}

impl VulkanExporter {
    pub fn new(device: Arc<Device>) -> VulkanExporter {
        VulkanExporter { device }
    }
}

impl PrimaryExporter for VulkanExporter {
    type Buffer = ExportableBuffer;
    type Semaphore = RawSemaphore;

    fn create_exportable_timeline(&self, kind: HandleKind) -> Result<RawSemaphore, RenderError> {
        RawSemaphore::timeline(self.device.clone(), Some(kind))
    }

    fn allocate_exportable_buffer(
        &self,
        extent: [u32; 2],
        texel_size: u32,
        kind: HandleKind,
    ) -> Result<ExportableBuffer, RenderError> {
        ExportableBuffer::new(self.device.clone(), extent, texel_size, kind)
    }
}

fn traced_buffers<T>(
    bindings: &DenoiserBindings<T>,
    handle: impl Fn(&T) -> vk::Buffer,
) -> [vk::Buffer; 4] {
    [
        handle(&bindings.radiance),
        handle(&bindings.albedo),
        handle(&bindings.normal),
        handle(&bindings.flow),
    ]
}

/// Ownership transfers of one shared buffer set on one device. The ray traced buffers travel
/// from the rendering device to the denoising device, the output travels back.
pub struct SharedBufferHandoff {
    /// submitted after the work writing the buffers this device hands over
    pub release: OwnershipTransfer,
    /// submitted before the work reading the buffers this device takes over
    pub acquire: OwnershipTransfer,
}

impl SharedBufferHandoff {
    /// Rendering device side: the ray trace releases its outputs, the composite acquires the
    /// denoised image.
    pub fn rendering(
        device: Arc<Device>,
        buffers: &DenoiserBindings<ExportableBuffer>,
        ray_trace_family: u32,
        composite_family: u32,
    ) -> Result<SharedBufferHandoff, RenderError> {
        let handle = |b: &ExportableBuffer| b.buffer().buffer().handle();
        Ok(SharedBufferHandoff {
            release: OwnershipTransfer::record(
                device.clone(),
                ray_trace_family,
                Handoff::Release,
                vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
                &traced_buffers(buffers, handle),
            )?,
            acquire: OwnershipTransfer::record(
                device,
                composite_family,
                Handoff::Acquire,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                &[handle(&buffers.output)],
            )?,
        })
    }

    /// Denoising device side: the filter acquires the ray traced buffers and releases its
    /// output.
    pub fn denoising(
        device: Arc<Device>,
        buffers: &DenoiserBindings<Subbuffer<[u8]>>,
        family: u32,
    ) -> Result<SharedBufferHandoff, RenderError> {
        let handle = |b: &Subbuffer<[u8]>| b.buffer().handle();
        Ok(SharedBufferHandoff {
            release: OwnershipTransfer::record(
                device.clone(),
                family,
                Handoff::Release,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                &[handle(&buffers.output)],
            )?,
            acquire: OwnershipTransfer::record(
                device,
                family,
                Handoff::Acquire,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                &traced_buffers(buffers, handle),
            )?,
        })
    }
}

/// The denoising device.
pub struct VulkanSecondary {
    queue: Arc<Queue>,
    allocators: Allocators,
    timeout: Duration,
    handoff: Mutex<Option<SharedBufferHandoff>>,
    // command buffers kept until the value they signal was reached
    in_flight: Mutex<VecDeque<(u64, Arc<PrimaryAutoCommandBuffer>)>>,
}

fn poisoned(what: &str) -> RenderError {
    RenderError::Pipeline(format!("denoiser {what} poisoned"))
}

impl VulkanSecondary {
    /// Waits on the device give up after `timeout`.
    pub fn new(queue: Arc<Queue>, timeout: Duration) -> VulkanSecondary {
        VulkanSecondary {
            allocators: Allocators::new(queue.device()),
            queue,
            timeout,
            handoff: Mutex::new(None),
            in_flight: Mutex::new(VecDeque::new()),
        }
    }

    fn in_flight(
        &self,
    ) -> Result<MutexGuard<'_, VecDeque<(u64, Arc<PrimaryAutoCommandBuffer>)>>, RenderError> {
        self.in_flight.lock().map_err(|_| poisoned("submission list"))
    }

    pub fn device(&self) -> &Arc<Device> {
        self.queue.device()
    }

    pub fn allocators(&self) -> &Allocators {
        &self.allocators
    }

    fn import_buffer(
        &self,
        size: u64,
        kind: HandleKind,
        import_info: MemoryImportInfo,
    ) -> Result<Subbuffer<[u8]>, RenderError> {
        let device = self.device().clone();
        let handle_types = external_memory_types(kind);
        let raw = RawBuffer::new(
            device.clone(),
            BufferCreateInfo {
                size,
                usage: BufferUsage::STORAGE_BUFFER
                    | BufferUsage::TRANSFER_SRC
                    | BufferUsage::TRANSFER_DST,
                external_memory_handle_types: handle_types,
                ..Default::default()
            },
        )?;
        let requirements = raw.memory_requirements();
        let memory = unsafe {
            DeviceMemory::import(
                device.clone(),
                MemoryAllocateInfo {
                    allocation_size: size,
                    memory_type_index: device_local_memory_type(
                        &device,
                        requirements.memory_type_bits,
                    )?,
                    dedicated_allocation: Some(DedicatedAllocation::Buffer(&raw)),
                    ..Default::default()
                },
                import_info,
            )?
        };
        let buffer = raw
            .bind_memory(ResourceMemory::new_dedicated(memory))
            .map_err(|(e, _, _)| e)?;
        Ok(Subbuffer::new(Arc::new(buffer)))
    }
}

impl SecondaryDevice for VulkanSecondary {
    type Memory = Subbuffer<[u8]>;
    type Semaphore = RawSemaphore;
    type Commands = AutoCommandBufferBuilder<PrimaryAutoCommandBuffer>;

    fn import_memory(&self, handle: NativeHandle, size: u64) -> Import<Subbuffer<[u8]>> {
        match handle {
            #[cfg(unix)]
            NativeHandle::Fd(file) => {
                // the driver consumes the duplicate, the original goes back to the caller
                let duplicate = match file.try_clone() {
                    Ok(duplicate) => duplicate,
                    Err(e) => {
                        return Import {
                            result: Err(e.into()),
                            leftover: Some(NativeHandle::Fd(file)),
                        };
                    }
                };
                let result = self.import_buffer(
                    size,
                    HandleKind::OpaqueFd,
                    MemoryImportInfo::Fd {
                        handle_type: ExternalMemoryHandleType::OpaqueFd,
                        file: duplicate,
                    },
                );
                Import {
                    result,
                    leftover: Some(NativeHandle::Fd(file)),
                }
            }
            #[cfg(windows)]
            NativeHandle::Win32(owned) => {
                use std::os::windows::io::AsRawHandle;
                // importing never takes ownership of an NT handle
                let result = self.import_buffer(
                    size,
                    HandleKind::OpaqueWin32,
                    MemoryImportInfo::Win32 {
                        handle_type: ExternalMemoryHandleType::OpaqueWin32,
                        handle: owned.as_raw_handle() as vk::HANDLE,
                    },
                );
                Import {
                    result,
                    leftover: Some(NativeHandle::Win32(owned)),
                }
            }
        }
    }

    fn import_semaphore(&self, handle: NativeHandle) -> Import<RawSemaphore> {
        let semaphore = match RawSemaphore::timeline(self.device().clone(), None) {
            Ok(semaphore) => semaphore,
            Err(e) => {
                return Import {
                    result: Err(e),
                    leftover: Some(handle),
                };
            }
        };
        let device = self.device();

        match handle {
            #[cfg(unix)]
            NativeHandle::Fd(file) => {
                use std::os::fd::IntoRawFd;
                let fd = file.into_raw_fd();
                let info = vk::ImportSemaphoreFdInfoKHR::default()
                    .semaphore(semaphore.handle())
                    .handle_type(vk::ExternalSemaphoreHandleTypeFlags::OPAQUE_FD)
                    .fd(fd);
                let result = unsafe {
                    (device.fns().khr_external_semaphore_fd.import_semaphore_fd_khr)(
                        device.handle(),
                        &info,
                    )
                };
                match check("vkImportSemaphoreFdKHR", result) {
                    Ok(()) => Import {
                        result: Ok(semaphore),
                        leftover: None,
                    },
                    // ownership only moves on success
                    Err(e) => Import {
                        result: Err(e),
                        leftover: Some(unsafe { native_fd(fd) }),
                    },
                }
            }
            #[cfg(windows)]
            NativeHandle::Win32(owned) => {
                use std::os::windows::io::AsRawHandle;
                let info = vk::ImportSemaphoreWin32HandleInfoKHR::default()
                    .semaphore(semaphore.handle())
                    .handle_type(vk::ExternalSemaphoreHandleTypeFlags::OPAQUE_WIN32)
                    .handle(owned.as_raw_handle() as vk::HANDLE);
                let result = unsafe {
                    (device.fns().khr_external_semaphore_win32.import_semaphore_win32_handle_khr)(
                        device.handle(),
                        &info,
                    )
                };
                Import {
                    result: check("vkImportSemaphoreWin32HandleKHR", result).map(|()| semaphore),
                    leftover: Some(NativeHandle::Win32(owned)),
                }
            }
        }
    }

    fn submit(
        &self,
        wait: TimelineWait<'_, RawSemaphore>,
        signal: TimelineSignal<'_, RawSemaphore>,
        record: &mut dyn FnMut(&mut Self::Commands) -> Result<(), RenderError>,
    ) -> Result<(), RenderError> {
        let mut builder = AutoCommandBufferBuilder::primary(
            self.allocators.command_buffer.clone(),
            self.queue.queue_family_index(),
            CommandBufferUsage::OneTimeSubmit,
        )?;
        record(&mut builder)?;
        let command_buffer = builder.build()?;

        let handoff = self.handoff.lock().map_err(|_| poisoned("buffer handoff"))?;
        let handoff = handoff
            .as_ref()
            .ok_or_else(|| RenderError::Pipeline("denoiser buffers were never shared".into()))?;
        unsafe {
            sync::submit(
                &self.queue,
                &[
                    handoff.acquire.command_buffer(),
                    command_buffer.handle(),
                    handoff.release.command_buffer(),
                ],
                &[SemaphoreWait {
                    semaphore: wait.semaphore.handle(),
                    value: wait.value,
                    stage: vk::PipelineStageFlags::COMPUTE_SHADER,
                }],
                &[SemaphoreSignal {
                    semaphore: signal.semaphore.handle(),
                    value: signal.value,
                }],
                vk::Fence::null(),
            )?;
        }

        let reached = signal.semaphore.counter_value()?;
        let mut in_flight = self.in_flight()?;
        in_flight.retain(|(value, _)| *value > reached);
        in_flight.push_back((signal.value, command_buffer));
        Ok(())
    }

    fn share_buffers(
        &self,
        buffers: &DenoiserBindings<Subbuffer<[u8]>>,
    ) -> Result<(), RenderError> {
        let handoff = SharedBufferHandoff::denoising(
            self.device().clone(),
            buffers,
            self.queue.queue_family_index(),
        )?;
        *self.handoff.lock().map_err(|_| poisoned("buffer handoff"))? = Some(handoff);
        Ok(())
    }

    fn wait_until(&self, wait: TimelineWait<'_, RawSemaphore>) -> Result<(), RenderError> {
        wait.semaphore
            .wait("denoiser device", wait.value, self.timeout)?;
        self.in_flight()?.retain(|(value, _)| *value > wait.value);
        Ok(())
    }
}

/// Edge-avoiding blur over the noisy radiance, guided by albedo and normals.
pub struct BilateralFilterKernel {
    pipeline: Arc<ComputePipeline>,
    set: Option<Arc<DescriptorSet>>,
    extent: [u32; 2],
}

impl BilateralFilterKernel {
    pub fn new(secondary: &VulkanSecondary) -> Result<BilateralFilterKernel, RenderError> {
        let device = secondary.device().clone();
        Ok(BilateralFilterKernel {
            pipeline: create_compute_pipeline(
                device.clone(),
                denoise_shader::load(device),
                "denoise",
            )?,
            set: None,
            extent: [0, 0],
        })
    }
}

impl DenoiseKernel<VulkanSecondary> for BilateralFilterKernel {
    fn prepare(
        &mut self,
        secondary: &VulkanSecondary,
        buffers: DenoiserBindings<Subbuffer<[u8]>>,
        extent: [u32; 2],
    ) -> Result<(), RenderError> {
        let layout = self
            .pipeline
            .layout()
            .set_layouts()
            .first()
            .ok_or_else(|| RenderError::Pipeline("denoise shader declares no set".into()))?
            .clone();

        self.set = Some(DescriptorSet::new(
            secondary.allocators().descriptor_set.clone(),
            layout,
            [
                WriteDescriptorSet::buffer(0, buffers.radiance),
                WriteDescriptorSet::buffer(1, buffers.albedo),
                WriteDescriptorSet::buffer(2, buffers.normal),
                WriteDescriptorSet::buffer(3, buffers.flow),
                WriteDescriptorSet::buffer(4, buffers.output),
            ],
            [],
        )?);
        self.extent = extent;
        Ok(())
    }

    fn record(
        &self,
        commands: &mut AutoCommandBufferBuilder<PrimaryAutoCommandBuffer>,
        settings: &DenoiseSettings,
        frame: &Frame,
    ) -> Result<(), RenderError> {
        let set = self
            .set
            .clone()
            .ok_or_else(|| RenderError::Pipeline("denoiser buffers were never bound".into()))?;
        let [xsize, ysize] = self.extent;

        commands
            .bind_pipeline_compute(self.pipeline.clone())?
            .bind_descriptor_sets(
                PipelineBindPoint::Compute,
                self.pipeline.layout().clone(),
                0,
                set,
            )?
            .push_constants(
                self.pipeline.layout().clone(),
                0,
                denoise_shader::PushConstants {
                    xsize,
                    ysize,
                    radius: settings.filter_radius,
                    sigma_color: settings.sigma_color,
                    sigma_normal: settings.sigma_normal,
                    blend_factor: settings.blend_factor,
                    iteration: frame.iteration_count,
                },
            )?;
        unsafe {
            commands.dispatch([xsize.div_ceil(16), ysize.div_ceil(16), 1])?;
        }
        Ok(())
    }
}
