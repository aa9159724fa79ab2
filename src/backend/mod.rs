// Backend module - Vulkan abstraction layer
//
// Design: Thin wrapper around ash, one owner per Vulkan object
// Lifetimes: Arc'd device and instance, everything else dropped in reverse
// creation order

pub mod buffer;
pub mod device;
pub mod error;
pub mod frame;
pub mod instance;
pub mod pipeline;
pub mod renderer;
pub mod shader;
pub mod swapchain;
pub mod sync;

pub use buffer::{GpuBuffer, MemoryUsage};
pub use device::DeviceContext;
pub use error::{ErrorKind, RenderError, Result};
pub use frame::{FrameBackend, FrameState, FrameStatus, FrameSyncController};
pub use instance::{Surface, VulkanInstance, WindowHost};
pub use pipeline::PipelineResources;
pub use renderer::{Renderer, RendererConfig};
pub use shader::{ShaderLoader, ShaderStages};
pub use swapchain::Swapchain;
