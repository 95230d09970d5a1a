// Backend module - Vulkan abstraction layer
//
// Thin wrappers around ash. Each wrapper owns its handles and releases
// them in reverse creation order.

pub mod buffer;
pub mod commands;
pub mod device;
pub mod pipeline;
pub mod shader;
pub mod swapchain;
pub mod sync;

pub use buffer::GpuBuffer;
pub use device::VulkanDevice;
pub use pipeline::TrianglePipeline;
pub use swapchain::{Acquired, Swapchain, SwapchainState};
pub use sync::{FrameSlots, FrameSync};
