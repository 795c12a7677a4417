//! Fences, semaphores and queue submission.
//!
//! The frame loop submits with timeline semaphore values, which vulkano's `GpuFuture` chain
//! cannot express, so submission goes through the raw entry points. Every object here destroys
//! its handle when dropped.

use std::{mem::MaybeUninit, ptr, sync::Arc, time::Duration};

use ash::vk;
use vulkano::{
    VulkanObject,
    device::{Device, DeviceOwned, Queue},
};

use crate::{
    error::{RenderError, check},
    render_system::cross_device::HandleKind,
};

fn timeout_ns(timeout: Duration) -> u64 {
    timeout.as_nanos().min(u64::MAX as u128) as u64
}

pub struct RawFence {
    device: Arc<Device>,
    handle: vk::Fence,
}

impl RawFence {
    /// Creates a fence, signaled so that the first wait returns at once.
    pub fn new_signaled(device: Arc<Device>) -> Result<RawFence, RenderError> {
        let info = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);
        let mut handle = MaybeUninit::uninit();
        unsafe {
            check(
                "vkCreateFence",
                (device.fns().v1_0.create_fence)(
                    device.handle(),
                    &info,
                    ptr::null(),
                    handle.as_mut_ptr(),
                ),
            )?;
            Ok(RawFence {
                handle: handle.assume_init(),
                device,
            })
        }
    }

    pub fn handle(&self) -> vk::Fence {
        self.handle
    }

    /// Waits for the fence, a timeout means the device is lost.
    pub fn wait(&self, what: &'static str, timeout: Duration) -> Result<(), RenderError> {
        let result = unsafe {
            (self.device.fns().v1_0.wait_for_fences)(
                self.device.handle(),
                1,
                &self.handle,
                vk::TRUE,
                timeout_ns(timeout),
            )
        };
        match result {
            vk::Result::TIMEOUT => Err(RenderError::DeviceLost { what, timeout }),
            result => check("vkWaitForFences", result),
        }
    }

    pub fn reset(&self) -> Result<(), RenderError> {
        unsafe {
            check(
                "vkResetFences",
                (self.device.fns().v1_0.reset_fences)(self.device.handle(), 1, &self.handle),
            )
        }
    }
}

impl Drop for RawFence {
    fn drop(&mut self) {
        unsafe {
            (self.device.fns().v1_0.destroy_fence)(self.device.handle(), self.handle, ptr::null());
        }
    }
}

/// A binary or timeline semaphore.
pub struct RawSemaphore {
    device: Arc<Device>,
    handle: vk::Semaphore,
    timeline: bool,
}

impl RawSemaphore {
    pub fn binary(device: Arc<Device>) -> Result<RawSemaphore, RenderError> {
        Self::create(device, vk::SemaphoreCreateInfo::default(), false)
    }

    /// A timeline semaphore at 0, optionally exportable as `export`.
    pub fn timeline(device: Arc<Device>, export: Option<HandleKind>) -> Result<RawSemaphore, RenderError> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let mut export_info = vk::ExportSemaphoreCreateInfo::default()
            .handle_types(export.map(semaphore_handle_type).unwrap_or_default());
        let mut info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);
        if export.is_some() {
            info = info.push_next(&mut export_info);
        }
        Self::create(device, info, true)
    }

    fn create(
        device: Arc<Device>,
        info: vk::SemaphoreCreateInfo<'_>,
        timeline: bool,
    ) -> Result<RawSemaphore, RenderError> {
        let mut handle = MaybeUninit::uninit();
        unsafe {
            check(
                "vkCreateSemaphore",
                (device.fns().v1_0.create_semaphore)(
                    device.handle(),
                    &info,
                    ptr::null(),
                    handle.as_mut_ptr(),
                ),
            )?;
            Ok(RawSemaphore {
                handle: handle.assume_init(),
                device,
                timeline,
            })
        }
    }

    pub fn handle(&self) -> vk::Semaphore {
        self.handle
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn is_timeline(&self) -> bool {
        self.timeline
    }

    /// Current counter value of a timeline semaphore.
    pub fn counter_value(&self) -> Result<u64, RenderError> {
        let mut value = 0;
        unsafe {
            check(
                "vkGetSemaphoreCounterValue",
                (self.device.fns().v1_2.get_semaphore_counter_value)(
                    self.device.handle(),
                    self.handle,
                    &mut value,
                ),
            )?;
        }
        Ok(value)
    }

    /// Blocks until a timeline semaphore reaches `value`.
    pub fn wait(&self, what: &'static str, value: u64, timeout: Duration) -> Result<(), RenderError> {
        let semaphores = [self.handle];
        let values = [value];
        let info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);
        let result = unsafe {
            (self.device.fns().v1_2.wait_semaphores)(self.device.handle(), &info, timeout_ns(timeout))
        };
        match result {
            vk::Result::TIMEOUT => Err(RenderError::DeviceLost { what, timeout }),
            result => check("vkWaitSemaphores", result),
        }
    }
}

impl Drop for RawSemaphore {
    fn drop(&mut self) {
        unsafe {
            (self.device.fns().v1_0.destroy_semaphore)(
                self.device.handle(),
                self.handle,
                ptr::null(),
            );
        }
    }
}

pub fn semaphore_handle_type(kind: HandleKind) -> vk::ExternalSemaphoreHandleTypeFlags {
    match kind {
        HandleKind::OpaqueFd => vk::ExternalSemaphoreHandleTypeFlags::OPAQUE_FD,
        HandleKind::OpaqueWin32 => vk::ExternalSemaphoreHandleTypeFlags::OPAQUE_WIN32,
    }
}

pub fn memory_handle_type(kind: HandleKind) -> vk::ExternalMemoryHandleTypeFlags {
    match kind {
        HandleKind::OpaqueFd => vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD,
        HandleKind::OpaqueWin32 => vk::ExternalMemoryHandleTypeFlags::OPAQUE_WIN32,
    }
}

pub struct SemaphoreWait {
    pub semaphore: vk::Semaphore,
    /// ignored for binary semaphores
    pub value: u64,
    pub stage: vk::PipelineStageFlags,
}

pub struct SemaphoreSignal {
    pub semaphore: vk::Semaphore,
    pub value: u64,
}

/// Submits one batch to `queue`.
///
/// # Safety
///
/// The command buffers must stay alive and unmodified until `fence` (or a later signal) shows
/// the batch completed.
pub unsafe fn submit(
    queue: &Arc<Queue>,
    command_buffers: &[vk::CommandBuffer],
    waits: &[SemaphoreWait],
    signals: &[SemaphoreSignal],
    fence: vk::Fence,
) -> Result<(), RenderError> {
    let wait_semaphores: Vec<_> = waits.iter().map(|w| w.semaphore).collect();
    let wait_values: Vec<_> = waits.iter().map(|w| w.value).collect();
    let wait_stages: Vec<_> = waits.iter().map(|w| w.stage).collect();
    let signal_semaphores: Vec<_> = signals.iter().map(|s| s.semaphore).collect();
    let signal_values: Vec<_> = signals.iter().map(|s| s.value).collect();

    let mut timeline_info = vk::TimelineSemaphoreSubmitInfo::default()
        .wait_semaphore_values(&wait_values)
        .signal_semaphore_values(&signal_values);
    let submit_info = vk::SubmitInfo::default()
        .wait_semaphores(&wait_semaphores)
        .wait_dst_stage_mask(&wait_stages)
        .command_buffers(command_buffers)
        .signal_semaphores(&signal_semaphores)
        .push_next(&mut timeline_info);

    let device = queue.device().clone();
    queue.with(|_guard| unsafe {
        check(
            "vkQueueSubmit",
            (device.fns().v1_0.queue_submit)(queue.handle(), 1, &submit_info, fence),
        )
    })
}

/// Direction of a queue family ownership transfer with another device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Handoff {
    /// hands the buffers to the other device once `stage` wrote them
    Release,
    /// takes the buffers from the other device before `stage` reads them
    Acquire,
}

/// A command buffer holding nothing but the ownership transfer of buffers shared with another
/// device, submitted in the same batch as the work producing or consuming them.
pub struct OwnershipTransfer {
    pool: RawCommandPool,
    command_buffer: vk::CommandBuffer,
}

impl OwnershipTransfer {
    pub fn record(
        device: Arc<Device>,
        queue_family_index: u32,
        handoff: Handoff,
        stage: vk::PipelineStageFlags,
        buffers: &[vk::Buffer],
    ) -> Result<OwnershipTransfer, RenderError> {
        let pool = RawCommandPool::new(device.clone(), queue_family_index)?;
        let command_buffer = pool.allocate(1)?[0];

        let (src_family, dst_family) = match handoff {
            Handoff::Release => (queue_family_index, vk::QUEUE_FAMILY_EXTERNAL),
            Handoff::Acquire => (vk::QUEUE_FAMILY_EXTERNAL, queue_family_index),
        };
        // the half of the barrier on the other device carries the other access mask
        let (src_access, dst_access, src_stage, dst_stage) = match handoff {
            Handoff::Release => (
                vk::AccessFlags::SHADER_WRITE,
                vk::AccessFlags::empty(),
                stage,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            ),
            Handoff::Acquire => (
                vk::AccessFlags::empty(),
                vk::AccessFlags::SHADER_READ,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                stage,
            ),
        };
        let barriers: Vec<_> = buffers
            .iter()
            .map(|&buffer| {
                vk::BufferMemoryBarrier::default()
                    .src_access_mask(src_access)
                    .dst_access_mask(dst_access)
                    .src_queue_family_index(src_family)
                    .dst_queue_family_index(dst_family)
                    .buffer(buffer)
                    .offset(0)
                    .size(vk::WHOLE_SIZE)
            })
            .collect();

        let fns = device.fns();
        let begin = vk::CommandBufferBeginInfo::default();
        unsafe {
            check(
                "vkBeginCommandBuffer",
                (fns.v1_0.begin_command_buffer)(command_buffer, &begin),
            )?;
            (fns.v1_0.cmd_pipeline_barrier)(
                command_buffer,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                0,
                ptr::null(),
                barriers.len() as u32,
                barriers.as_ptr(),
                0,
                ptr::null(),
            );
            check(
                "vkEndCommandBuffer",
                (fns.v1_0.end_command_buffer)(command_buffer),
            )?;
        }
        Ok(OwnershipTransfer {
            pool,
            command_buffer,
        })
    }

    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffer
    }
}

impl Drop for OwnershipTransfer {
    fn drop(&mut self) {
        self.pool.free(&[self.command_buffer]);
    }
}

/// A command pool for hand-recorded command buffers.
pub struct RawCommandPool {
    device: Arc<Device>,
    handle: vk::CommandPool,
}

impl RawCommandPool {
    pub fn new(device: Arc<Device>, queue_family_index: u32) -> Result<RawCommandPool, RenderError> {
        let info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family_index);
        let mut handle = MaybeUninit::uninit();
        unsafe {
            check(
                "vkCreateCommandPool",
                (device.fns().v1_0.create_command_pool)(
                    device.handle(),
                    &info,
                    ptr::null(),
                    handle.as_mut_ptr(),
                ),
            )?;
            Ok(RawCommandPool {
                handle: handle.assume_init(),
                device,
            })
        }
    }

    pub fn allocate(&self, count: u32) -> Result<Vec<vk::CommandBuffer>, RenderError> {
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.handle)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);
        let mut buffers = Vec::with_capacity(count as usize);
        unsafe {
            check(
                "vkAllocateCommandBuffers",
                (self.device.fns().v1_0.allocate_command_buffers)(
                    self.device.handle(),
                    &info,
                    buffers.as_mut_ptr(),
                ),
            )?;
            buffers.set_len(count as usize);
        }
        Ok(buffers)
    }

    pub fn free(&self, buffers: &[vk::CommandBuffer]) {
        if buffers.is_empty() {
            return;
        }
        unsafe {
            (self.device.fns().v1_0.free_command_buffers)(
                self.device.handle(),
                self.handle,
                buffers.len() as u32,
                buffers.as_ptr(),
            );
        }
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

impl Drop for RawCommandPool {
    fn drop(&mut self) {
        unsafe {
            (self.device.fns().v1_0.destroy_command_pool)(
                self.device.handle(),
                self.handle,
                ptr::null(),
            );
        }
    }
}
