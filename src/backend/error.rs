//! Renderer error types.

use ash::vk;
use thiserror::Error;

/// Everything the rendering core can fail with.
///
/// None of these are retried inside the core: initialization errors abort
/// startup and `PresentationFailed` aborts the frame loop. The two expected
/// transient swapchain outcomes (out-of-date, suboptimal) are not errors and
/// never show up here.
#[derive(Error, Debug)]
pub enum RenderError {
    /// The Vulkan loader library could not be found or opened.
    #[error("Failed to load Vulkan library: {0}")]
    Loading(#[from] ash::LoadingError),

    /// Instance creation or a required layer/extension check failed.
    #[error("Vulkan instance creation failed: {0}")]
    InstanceCreation(String),

    /// `vkEnumeratePhysicalDevices` returned nothing.
    #[error("No Vulkan-capable GPU found. Is the GPU enabled?")]
    NoAdapterFound,

    /// Adapters exist but none of them scored above zero.
    #[error("No suitable GPU found")]
    NoSuitableAdapter,

    /// No queue family (or pair of families) covers graphics and present.
    #[error("No queue family supports both graphics submission and presentation")]
    NoSuitableQueueFamily,

    /// The driver rejected the requested feature/extension set.
    #[error("Logical device creation failed: {0}")]
    DeviceCreationFailed(vk::Result),

    #[error("Surface creation failed: {0}")]
    SurfaceCreationFailed(String),

    #[error("Swapchain creation failed: {0}")]
    SwapchainCreationFailed(String),

    /// Shader loading, shader module or pipeline object creation failed.
    #[error("Pipeline creation failed: {0}")]
    PipelineCreationFailed(String),

    #[error("No memory type matches filter {type_filter:#034b} with properties {properties:?}")]
    NoSuitableMemoryType {
        type_filter: u32,
        properties: vk::MemoryPropertyFlags,
    },

    /// Acquire or present returned something other than success,
    /// suboptimal or out-of-date.
    #[error("Presentation failed: {0}")]
    PresentationFailed(vk::Result),

    #[error("Allocation failed: {0}")]
    AllocationFailed(String),

    /// The frame loop was driven after `shutdown`.
    #[error("Frame loop has been shut down")]
    ShutDown,

    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),
}

/// Coarse classification of [`RenderError`] used for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    AdapterSelection,
    QueueResolution,
    DeviceCreation,
    SurfaceCreation,
    SwapchainCreation,
    PipelineCreation,
    MemoryType,
    Presentation,
    Allocation,
    Other,
}

impl RenderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoAdapterFound | Self::NoSuitableAdapter => ErrorKind::AdapterSelection,
            Self::NoSuitableQueueFamily => ErrorKind::QueueResolution,
            Self::DeviceCreationFailed(_) => ErrorKind::DeviceCreation,
            Self::SurfaceCreationFailed(_) => ErrorKind::SurfaceCreation,
            Self::SwapchainCreationFailed(_) => ErrorKind::SwapchainCreation,
            Self::PipelineCreationFailed(_) => ErrorKind::PipelineCreation,
            Self::NoSuitableMemoryType { .. } => ErrorKind::MemoryType,
            Self::PresentationFailed(_) | Self::ShutDown => ErrorKind::Presentation,
            Self::AllocationFailed(_) => ErrorKind::Allocation,
            Self::Loading(_) | Self::InstanceCreation(_) | Self::Vulkan(_) => ErrorKind::Other,
        }
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, RenderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adapter_errors_share_a_kind() {
        assert_eq!(RenderError::NoAdapterFound.kind(), ErrorKind::AdapterSelection);
        assert_eq!(RenderError::NoSuitableAdapter.kind(), ErrorKind::AdapterSelection);
    }

    #[test]
    fn fatal_present_is_presentation_kind() {
        let err = RenderError::PresentationFailed(vk::Result::ERROR_DEVICE_LOST);
        assert_eq!(err.kind(), ErrorKind::Presentation);
        assert!(err.to_string().contains("Presentation failed"));
    }

    #[test]
    fn memory_type_error_reports_filter() {
        let err = RenderError::NoSuitableMemoryType {
            type_filter: 0b101,
            properties: vk::MemoryPropertyFlags::HOST_VISIBLE,
        };
        assert_eq!(err.kind(), ErrorKind::MemoryType);
        assert!(err.to_string().contains("101"));
    }

    #[test]
    fn raw_vulkan_results_convert() {
        let err: RenderError = vk::Result::ERROR_OUT_OF_HOST_MEMORY.into();
        assert_eq!(err.kind(), ErrorKind::Other);
    }
}
