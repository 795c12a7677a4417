//! The presentation target.
//!
//! The post-process pass writes packed B8G8R8A8 texels into a storage buffer; a hand-recorded
//! command buffer per swapchain image copies that buffer into the image and transitions it for
//! presentation. Acquire and present go through the raw entry points so that they can be chained
//! with the timeline semaphore submissions of the frame loop.

use std::{sync::Arc, time::Duration};

use ash::vk;
use vulkano::{
    VulkanObject,
    buffer::{Buffer, BufferCreateInfo, BufferUsage, Subbuffer},
    device::{Device, DeviceOwned, Queue},
    format::Format,
    image::{Image, ImageUsage},
    memory::allocator::{AllocationCreateInfo, MemoryAllocator, MemoryTypeFilter},
    swapchain::{Surface, Swapchain, SwapchainCreateInfo},
};
use winit::window::Window;

use crate::{
    error::{RenderError, check},
    render_system::orchestrator::{Acquire, PresentOutcome},
};

use super::sync::{RawCommandPool, RawSemaphore};

pub fn get_surface_extent(surface: &Surface) -> [u32; 2] {
    surface
        .object()
        .and_then(|o| o.downcast_ref::<Window>())
        .map(|window| window.inner_size().into())
        .unwrap_or([0, 0])
}

fn create_swapchain(
    device: Arc<Device>,
    surface: Arc<Surface>,
    extent: [u32; 2],
) -> Result<(Arc<Swapchain>, Vec<Arc<Image>>), RenderError> {
    // Querying the capabilities of the surface. When we create the swapchain we can only
    // pass values that are allowed by the capabilities.
    let surface_capabilities = device
        .physical_device()
        .surface_capabilities(&surface, Default::default())?;

    let composite_alpha = surface_capabilities
        .supported_composite_alpha
        .into_iter()
        .next()
        .ok_or_else(|| RenderError::Window("surface supports no composite alpha mode".into()))?;

    // a minimized window has no area, it keeps the smallest swapchain until it is restored
    let [min, max] = [
        surface_capabilities.min_image_extent,
        surface_capabilities.max_image_extent,
    ];
    let extent = [0, 1].map(|i| extent[i].max(min[i]).min(max[i]).max(1));

    let (swapchain, images) = Swapchain::new(
        device,
        surface,
        SwapchainCreateInfo {
            min_image_count: 3.max(surface_capabilities.min_image_count),
            image_format: Format::B8G8R8A8_SRGB,
            image_extent: extent,
            image_usage: ImageUsage::TRANSFER_DST,
            composite_alpha,
            ..Default::default()
        },
    )?;
    Ok((swapchain, images))
}

/// Buffer holding one packed texel per pixel of the target.
fn create_output_buffer(
    memory_allocator: Arc<dyn MemoryAllocator>,
    extent: [u32; 2],
) -> Result<Subbuffer<[u32]>, RenderError> {
    Ok(Buffer::new_slice::<u32>(
        memory_allocator,
        BufferCreateInfo {
            usage: BufferUsage::STORAGE_BUFFER | BufferUsage::TRANSFER_SRC,
            ..Default::default()
        },
        AllocationCreateInfo {
            memory_type_filter: MemoryTypeFilter::PREFER_DEVICE,
            ..Default::default()
        },
        extent[0].max(1) as u64 * extent[1].max(1) as u64,
    )?)
}

/// A swapchain image acquired for the current frame.
pub struct AcquiredImage {
    pub index: u32,
    /// signalled by the presentation engine, waited on before the copy
    pub acquire_semaphore: vk::Semaphore,
    /// signalled after the copy, waited on by present
    pub present_semaphore: vk::Semaphore,
    pub blit: vk::CommandBuffer,
}

pub struct SwapchainTarget {
    surface: Arc<Surface>,
    queue: Arc<Queue>,
    memory_allocator: Arc<dyn MemoryAllocator>,
    swapchain: Arc<Swapchain>,
    images: Vec<Arc<Image>>,
    output: Subbuffer<[u32]>,
    pool: RawCommandPool,
    blits: Vec<vk::CommandBuffer>,
    // one more than images, so a semaphore is never reused before its frame completed
    acquire_semaphores: Vec<RawSemaphore>,
    next_acquire: usize,
    present_semaphores: Vec<RawSemaphore>,
    acquire_timeout: Duration,
}

impl SwapchainTarget {
    pub fn new(
        surface: Arc<Surface>,
        queue: Arc<Queue>,
        memory_allocator: Arc<dyn MemoryAllocator>,
        acquire_timeout: Duration,
    ) -> Result<SwapchainTarget, RenderError> {
        let device = queue.device().clone();
        let extent = get_surface_extent(&surface);
        let (swapchain, images) = create_swapchain(device.clone(), surface.clone(), extent)?;
        let output = create_output_buffer(memory_allocator.clone(), swapchain.image_extent())?;
        let pool = RawCommandPool::new(device, queue.queue_family_index())?;

        let mut target = SwapchainTarget {
            surface,
            queue,
            memory_allocator,
            swapchain,
            images,
            output,
            pool,
            blits: vec![],
            acquire_semaphores: vec![],
            next_acquire: 0,
            present_semaphores: vec![],
            acquire_timeout,
        };
        target.rebuild_per_image_state()?;
        log::info!(
            "created swapchain with {} images at {:?}",
            target.images.len(),
            target.extent()
        );
        Ok(target)
    }

    pub fn surface(&self) -> &Arc<Surface> {
        &self.surface
    }

    pub fn extent(&self) -> [u32; 2] {
        self.swapchain.image_extent()
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// The buffer the post-process pass writes into.
    pub fn output(&self) -> &Subbuffer<[u32]> {
        &self.output
    }

    /// Rebuilds the swapchain and the output buffer. The device must be idle.
    pub fn recreate(&mut self, extent: [u32; 2]) -> Result<[u32; 2], RenderError> {
        let (swapchain, images) = self.swapchain.recreate(SwapchainCreateInfo {
            image_extent: extent,
            ..self.swapchain.create_info()
        })?;
        self.swapchain = swapchain;
        self.images = images;
        self.output = create_output_buffer(self.memory_allocator.clone(), self.extent())?;
        self.rebuild_per_image_state()?;
        Ok(self.extent())
    }

    fn rebuild_per_image_state(&mut self) -> Result<(), RenderError> {
        let device = self.pool.device().clone();
        self.pool.free(&self.blits);
        self.blits = self.pool.allocate(self.images.len() as u32)?;
        for (blit, image) in self.blits.iter().zip(&self.images) {
            unsafe { record_blit(&device, *blit, &self.output, image)? };
        }

        self.present_semaphores = (0..self.images.len())
            .map(|_| RawSemaphore::binary(device.clone()))
            .collect::<Result<_, _>>()?;
        self.acquire_semaphores = (0..=self.images.len())
            .map(|_| RawSemaphore::binary(device.clone()))
            .collect::<Result<_, _>>()?;
        self.next_acquire = 0;
        Ok(())
    }

    pub fn acquire(&mut self) -> Result<Acquire<AcquiredImage>, RenderError> {
        let device = self.swapchain.device();
        let semaphore = self.acquire_semaphores[self.next_acquire].handle();

        let mut index = 0;
        let result = unsafe {
            (device.fns().khr_swapchain.acquire_next_image_khr)(
                device.handle(),
                self.swapchain.handle(),
                self.acquire_timeout.as_nanos().min(u64::MAX as u128) as u64,
                semaphore,
                vk::Fence::null(),
                &mut index,
            )
        };
        let suboptimal = match result {
            vk::Result::SUCCESS => false,
            vk::Result::SUBOPTIMAL_KHR => true,
            vk::Result::ERROR_OUT_OF_DATE_KHR => return Ok(Acquire::OutOfDate),
            vk::Result::TIMEOUT | vk::Result::NOT_READY => {
                return Err(RenderError::DeviceLost {
                    what: "swapchain image acquisition",
                    timeout: self.acquire_timeout,
                });
            }
            result => return Err(RenderError::Raw {
                call: "vkAcquireNextImageKHR",
                result,
            }),
        };
        self.next_acquire = (self.next_acquire + 1) % self.acquire_semaphores.len();

        Ok(Acquire::Ready {
            target: AcquiredImage {
                index,
                acquire_semaphore: semaphore,
                present_semaphore: self.present_semaphores[index as usize].handle(),
                blit: self.blits[index as usize],
            },
            suboptimal,
        })
    }

    pub fn present(&self, image: AcquiredImage) -> Result<PresentOutcome, RenderError> {
        let device = self.swapchain.device();
        let wait_semaphores = [image.present_semaphore];
        let swapchains = [self.swapchain.handle()];
        let image_indices = [image.index];
        let info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = self.queue.with(|_guard| unsafe {
            (device.fns().khr_swapchain.queue_present_khr)(self.queue.handle(), &info)
        });
        match result {
            vk::Result::SUCCESS => Ok(PresentOutcome::Presented),
            vk::Result::SUBOPTIMAL_KHR => Ok(PresentOutcome::Suboptimal),
            vk::Result::ERROR_OUT_OF_DATE_KHR => Ok(PresentOutcome::OutOfDate),
            result => Err(RenderError::Raw {
                call: "vkQueuePresentKHR",
                result,
            }),
        }
    }
}

impl Drop for SwapchainTarget {
    fn drop(&mut self) {
        self.pool.free(&self.blits);
    }
}

/// Copies `output` into `image` and leaves the image ready for presentation.
unsafe fn record_blit(
    device: &Device,
    command_buffer: vk::CommandBuffer,
    output: &Subbuffer<[u32]>,
    image: &Image,
) -> Result<(), RenderError> {
    let fns = device.fns();
    let [width, height, _] = image.extent();
    let range = vk::ImageSubresourceRange::default()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .level_count(1)
        .layer_count(1);

    // the post-process writes must land before the copy reads them
    let shader_writes = vk::MemoryBarrier::default()
        .src_access_mask(vk::AccessFlags::SHADER_WRITE)
        .dst_access_mask(vk::AccessFlags::TRANSFER_READ);
    let to_transfer = vk::ImageMemoryBarrier::default()
        .old_layout(vk::ImageLayout::UNDEFINED)
        .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
        .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image.handle())
        .subresource_range(range);
    let to_present = vk::ImageMemoryBarrier::default()
        .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
        .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
        .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image.handle())
        .subresource_range(range);
    let region = vk::BufferImageCopy::default()
        .buffer_offset(output.offset())
        .image_subresource(
            vk::ImageSubresourceLayers::default()
                .aspect_mask(vk::ImageAspectFlags::COLOR)
                .layer_count(1),
        )
        .image_extent(vk::Extent3D {
            width,
            height,
            depth: 1,
        });

    let begin = vk::CommandBufferBeginInfo::default();
    unsafe {
        check(
            "vkBeginCommandBuffer",
            (fns.v1_0.begin_command_buffer)(command_buffer, &begin),
        )?;
        (fns.v1_0.cmd_pipeline_barrier)(
            command_buffer,
            vk::PipelineStageFlags::COMPUTE_SHADER | vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::TRANSFER,
            vk::DependencyFlags::empty(),
            1,
            &shader_writes,
            0,
            std::ptr::null(),
            1,
            &to_transfer,
        );
        (fns.v1_0.cmd_copy_buffer_to_image)(
            command_buffer,
            output.buffer().handle(),
            image.handle(),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            1,
            &region,
        );
        (fns.v1_0.cmd_pipeline_barrier)(
            command_buffer,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            vk::DependencyFlags::empty(),
            0,
            std::ptr::null(),
            0,
            std::ptr::null(),
            1,
            &to_present,
        );
        check(
            "vkEndCommandBuffer",
            (fns.v1_0.end_command_buffer)(command_buffer),
        )
    }
}
