//! Instance, device and queue setup.

use std::sync::Arc;

use vulkano::{
    Version, VulkanLibrary,
    command_buffer::allocator::StandardCommandBufferAllocator,
    descriptor_set::allocator::StandardDescriptorSetAllocator,
    device::{
        Device, DeviceCreateInfo, DeviceExtensions, DeviceFeatures, Queue, QueueCreateInfo,
        QueueFlags,
        physical::{PhysicalDevice, PhysicalDeviceType},
    },
    instance::{Instance, InstanceCreateFlags, InstanceCreateInfo},
    memory::allocator::StandardMemoryAllocator,
    swapchain::Surface,
};
use winit::{event_loop::ActiveEventLoop, window::Window};

use crate::error::RenderError;

fn external_sharing_extensions() -> DeviceExtensions {
    DeviceExtensions {
        khr_external_memory_fd: cfg!(unix),
        khr_external_semaphore_fd: cfg!(unix),
        khr_external_memory_win32: cfg!(windows),
        khr_external_semaphore_win32: cfg!(windows),
        ..DeviceExtensions::empty()
    }
}

fn rendering_extensions() -> DeviceExtensions {
    DeviceExtensions {
        khr_acceleration_structure: true,
        khr_ray_tracing_pipeline: true,
        khr_deferred_host_operations: true,
        khr_swapchain: true,
        ..external_sharing_extensions()
    }
}

fn rendering_features() -> DeviceFeatures {
    DeviceFeatures {
        acceleration_structure: true,
        ray_tracing_pipeline: true,
        buffer_device_address: true,
        timeline_semaphore: true,
        scalar_block_layout: true,
        runtime_descriptor_array: true,
        descriptor_binding_variable_descriptor_count: true,
        shader_sampled_image_array_non_uniform_indexing: true,
        ..DeviceFeatures::empty()
    }
}

fn denoising_features() -> DeviceFeatures {
    DeviceFeatures {
        timeline_semaphore: true,
        scalar_block_layout: true,
        ..DeviceFeatures::empty()
    }
}

fn device_type_rank(p: &PhysicalDevice) -> u32 {
    match p.properties().device_type {
        PhysicalDeviceType::DiscreteGpu => 0,
        PhysicalDeviceType::IntegratedGpu => 1,
        PhysicalDeviceType::VirtualGpu => 2,
        PhysicalDeviceType::Cpu => 3,
        PhysicalDeviceType::Other => 4,
        _ => 5,
    }
}

pub fn create_instance(event_loop: &ActiveEventLoop) -> Result<Arc<Instance>, RenderError> {
    let library = VulkanLibrary::new()
        .map_err(|e| RenderError::NoDevice(format!("cannot load the vulkan library: {e}")))?;
    let required_extensions = Surface::required_extensions(event_loop)
        .map_err(|e| RenderError::Window(e.to_string()))?;

    let instance = Instance::new(
        library,
        InstanceCreateInfo {
            flags: InstanceCreateFlags::ENUMERATE_PORTABILITY,
            enabled_extensions: required_extensions,
            ..Default::default()
        },
    )?;
    Ok(instance)
}

pub fn create_surface(instance: Arc<Instance>, window: Arc<Window>) -> Result<Arc<Surface>, RenderError> {
    Surface::from_window(instance, window).map_err(|e| RenderError::Window(format!("{e:?}")))
}

/// The rendering device and its queues.
pub struct RenderingDevice {
    pub device: Arc<Device>,
    /// ray tracing and present
    pub graphics_queue: Arc<Queue>,
    /// exposure and post-process; the graphics queue again when the family has a single queue
    pub compute_queue: Arc<Queue>,
}

pub fn get_device_for_rendering_on(
    instance: Arc<Instance>,
    surface: Arc<Surface>,
) -> Result<RenderingDevice, RenderError> {
    let device_extensions = rendering_extensions();
    let (physical_device, queue_family_index) = instance
        .enumerate_physical_devices()?
        .filter(|p| p.api_version() >= Version::V1_2)
        .filter(|p| p.supported_extensions().contains(&device_extensions))
        .filter(|p| p.supported_features().contains(&rendering_features()))
        .filter_map(|p| {
            // find a general purpose queue that can present
            let general_queue_family_index = p
                .queue_family_properties()
                .iter()
                .enumerate()
                .position(|(i, q)| {
                    q.queue_flags
                        .contains(QueueFlags::GRAPHICS | QueueFlags::COMPUTE)
                        && p.surface_support(i as u32, &surface).unwrap_or(false)
                })?;
            Some((p, general_queue_family_index as u32))
        })
        .min_by_key(|(p, _)| device_type_rank(p))
        .ok_or_else(|| {
            RenderError::NoDevice(
                "no device supports ray tracing pipelines, timeline semaphores and external \
                 memory sharing"
                    .to_string(),
            )
        })?;

    let queue_count = physical_device.queue_family_properties()[queue_family_index as usize]
        .queue_count
        .min(2);

    let (device, mut queues) = Device::new(
        physical_device,
        DeviceCreateInfo {
            enabled_extensions: device_extensions,
            enabled_features: rendering_features(),
            queue_create_infos: vec![QueueCreateInfo {
                queue_family_index,
                queues: vec![0.5; queue_count as usize],
                ..Default::default()
            }],
            ..Default::default()
        },
    )?;

    let graphics_queue = queues
        .next()
        .ok_or_else(|| RenderError::NoDevice("device created without queues".to_string()))?;
    let compute_queue = queues.next().unwrap_or_else(|| graphics_queue.clone());

    log::info!(
        "using device: {} (type: {:?}), {} queue(s) in family {}",
        device.physical_device().properties().device_name,
        device.physical_device().properties().device_type,
        queue_count,
        queue_family_index,
    );

    Ok(RenderingDevice {
        device,
        graphics_queue,
        compute_queue,
    })
}

/// Creates the logical device that runs the denoiser. Opaque handles can only be shared between
/// devices reporting the same device and driver UUIDs, so only such physical devices qualify.
pub fn get_device_for_denoising(
    instance: Arc<Instance>,
    primary: &PhysicalDevice,
) -> Result<(Arc<Device>, Arc<Queue>), RenderError> {
    let properties = primary.properties();
    let identity = (properties.device_uuid, properties.driver_uuid);
    if identity.0.is_none() || identity.1.is_none() {
        return Err(RenderError::NoDevice(
            "rendering device reports no device UUID".to_string(),
        ));
    }

    let device_extensions = external_sharing_extensions();
    let (physical_device, queue_family_index) = instance
        .enumerate_physical_devices()?
        .filter(|p| {
            let props = p.properties();
            (props.device_uuid, props.driver_uuid) == identity
        })
        .filter(|p| p.supported_extensions().contains(&device_extensions))
        .filter_map(|p| {
            let index = p
                .queue_family_properties()
                .iter()
                .position(|q| q.queue_flags.contains(QueueFlags::COMPUTE))?;
            Some((p, index as u32))
        })
        .next()
        .ok_or_else(|| {
            RenderError::NoDevice("no device shares memory with the rendering device".to_string())
        })?;

    let (device, mut queues) = Device::new(
        physical_device,
        DeviceCreateInfo {
            enabled_extensions: device_extensions,
            enabled_features: denoising_features(),
            queue_create_infos: vec![QueueCreateInfo {
                queue_family_index,
                ..Default::default()
            }],
            ..Default::default()
        },
    )?;
    let queue = queues
        .next()
        .ok_or_else(|| RenderError::NoDevice("device created without queues".to_string()))?;

    log::info!(
        "denoising on {} (queue family {})",
        device.physical_device().properties().device_name,
        queue_family_index
    );
    Ok((device, queue))
}

/// Allocators shared by everything created on one device.
#[derive(Clone)]
pub struct Allocators {
    pub memory: Arc<StandardMemoryAllocator>,
    pub command_buffer: Arc<StandardCommandBufferAllocator>,
    pub descriptor_set: Arc<StandardDescriptorSetAllocator>,
}

impl Allocators {
    pub fn new(device: &Arc<Device>) -> Allocators {
        Allocators {
            memory: Arc::new(StandardMemoryAllocator::new_default(device.clone())),
            command_buffer: Arc::new(StandardCommandBufferAllocator::new(
                device.clone(),
                Default::default(),
            )),
            descriptor_set: Arc::new(StandardDescriptorSetAllocator::new(
                device.clone(),
                Default::default(),
            )),
        }
    }
}
