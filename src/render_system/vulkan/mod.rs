//! Vulkan implementations of the frame backend, the resource binder and the cross-device
//! bridge.

mod backend;
mod context;
mod descriptors;
mod interop;
mod pipelines;
mod swapchain;
mod sync;

pub use backend::{AccumulationBuffer, VulkanFrameBackend};
pub use context::{
    Allocators, RenderingDevice, create_instance, create_surface, get_device_for_denoising,
    get_device_for_rendering_on,
};
pub use descriptors::{VulkanResource, VulkanSetWriter, stage_layouts};
pub use interop::{BilateralFilterKernel, ExportableBuffer, VulkanExporter, VulkanSecondary};
pub use pipelines::{Pipelines, UploadedBindingTable, VulkanGroupHandles};
pub use swapchain::{AcquiredImage, SwapchainTarget};
pub use sync::{RawFence, RawSemaphore};
