// Swapchain - Window presentation
//
// Manages the chain of images we render to and present to the screen.
// The whole image chain is rebuilt wholesale (destroy-then-create) whenever
// the surface goes out of date or the window is resized.

use ash::vk;
use std::sync::Arc;

use super::device::{DeviceContext, QueueFamilyIndices};
use super::error::{RenderError, Result};
use super::instance::Surface;
use super::sync::{AcquireOutcome, PresentOutcome};

/// Triple buffering unless the surface demands more.
const PREFERRED_IMAGE_COUNT: u32 = 3;

/// Prefer 8-bit BGRA sRGB; otherwise take whatever the surface lists first.
pub fn choose_surface_format(available: &[vk::SurfaceFormatKHR]) -> Result<vk::SurfaceFormatKHR> {
    available
        .iter()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| available.first())
        .copied()
        .ok_or_else(|| RenderError::SwapchainCreationFailed("surface reports no formats".into()))
}

/// MAILBOX: No vsync, no tearing, triple buffered
/// FIFO: Vsync enabled, guaranteed available
pub fn choose_present_mode(available: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    available
        .iter()
        .copied()
        .find(|&mode| mode == vk::PresentModeKHR::MAILBOX)
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// Use the surface's extent unless it reports the "any size" sentinel, in
/// which case the window framebuffer size is clamped into the allowed range.
pub fn choose_extent(capabilities: &vk::SurfaceCapabilitiesKHR, window_size: (u32, u32)) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }

    vk::Extent2D {
        width: window_size.0.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: window_size.1.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}

/// `max(3, minImageCount)`, capped by `maxImageCount` when that is nonzero.
pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = PREFERRED_IMAGE_COUNT.max(capabilities.min_image_count);
    if capabilities.max_image_count > 0 {
        count.min(capabilities.max_image_count)
    } else {
        count
    }
}

/// Exclusive when one family does both jobs, concurrent across both otherwise.
pub fn choose_sharing_mode(families: QueueFamilyIndices) -> (vk::SharingMode, Vec<u32>) {
    if families.is_shared() {
        (vk::SharingMode::EXCLUSIVE, Vec::new())
    } else {
        (vk::SharingMode::CONCURRENT, families.unique())
    }
}

/// Everything that is torn down and rebuilt together.
#[derive(Debug, Default)]
pub struct SwapchainState {
    pub handle: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
}

pub struct Swapchain {
    state: SwapchainState,
    loader: ash::khr::swapchain::Device,
    device: Arc<DeviceContext>,
}

impl Swapchain {
    pub fn new(device: Arc<DeviceContext>, surface: &Surface, window_size: (u32, u32)) -> Result<Self> {
        let loader = ash::khr::swapchain::Device::new(&device.instance.instance, &device.device);
        let mut swapchain = Self {
            state: SwapchainState::default(),
            loader,
            device,
        };
        swapchain.state = swapchain.create_state(surface, window_size)?;
        Ok(swapchain)
    }

    /// Destroy the current chain and build a fresh one.
    ///
    /// The caller must make sure no submitted work still references the old
    /// images (device idle) and that the window has nonzero area.
    pub fn recreate(&mut self, surface: &Surface, window_size: (u32, u32)) -> Result<()> {
        self.destroy_state();
        self.state = self.create_state(surface, window_size)?;
        Ok(())
    }

    fn create_state(&self, surface: &Surface, window_size: (u32, u32)) -> Result<SwapchainState> {
        let physical_device = self.device.physical_device;
        let capabilities = surface.capabilities(physical_device)?;
        let surface_format = choose_surface_format(&surface.formats(physical_device)?)?;
        let present_mode = choose_present_mode(&surface.present_modes(physical_device)?);
        let extent = choose_extent(&capabilities, window_size);
        let image_count = choose_image_count(&capabilities);
        let (sharing_mode, queue_family_indices) = choose_sharing_mode(self.device.queue_families);

        log::info!(
            "Creating swapchain: {}x{}, {} images, {:?}, {:?}",
            extent.width,
            extent.height,
            image_count,
            surface_format.format,
            present_mode
        );

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface.handle)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(sharing_mode)
            .queue_family_indices(&queue_family_indices)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true);

        let handle = unsafe { self.loader.create_swapchain(&create_info, None) }
            .map_err(|e| RenderError::SwapchainCreationFailed(e.to_string()))?;

        let mut state = SwapchainState {
            handle,
            surface_format,
            present_mode,
            extent,
            ..Default::default()
        };

        // From here on a failure must release what was already built
        if let Err(e) = self.populate_images(&mut state) {
            self.destroy_resources(&mut state);
            return Err(e);
        }

        log::debug!("Swapchain holds {} images", state.images.len());
        Ok(state)
    }

    fn populate_images(&self, state: &mut SwapchainState) -> Result<()> {
        state.images = unsafe { self.loader.get_swapchain_images(state.handle) }
            .map_err(|e| RenderError::SwapchainCreationFailed(e.to_string()))?;

        for &image in &state.images {
            let create_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(state.surface_format.format)
                .components(vk::ComponentMapping::default())
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });

            let view = unsafe { self.device.device.create_image_view(&create_info, None) }
                .map_err(|e| RenderError::SwapchainCreationFailed(format!("image view: {e}")))?;
            state.image_views.push(view);
        }

        Ok(())
    }

    fn destroy_resources(&self, state: &mut SwapchainState) {
        unsafe {
            for view in state.image_views.drain(..) {
                self.device.device.destroy_image_view(view, None);
            }
            if state.handle != vk::SwapchainKHR::null() {
                self.loader.destroy_swapchain(state.handle, None);
            }
        }
        state.images.clear();
        state.handle = vk::SwapchainKHR::null();
    }

    fn destroy_state(&mut self) {
        let mut state = std::mem::take(&mut self.state);
        self.destroy_resources(&mut state);
    }

    /// Acquire the next presentable image, signalling `semaphore` when it is ready.
    pub fn acquire_next_image(&self, semaphore: vk::Semaphore, timeout: u64) -> Result<AcquireOutcome> {
        let result = unsafe {
            self.loader
                .acquire_next_image(self.state.handle, timeout, semaphore, vk::Fence::null())
        };

        match result {
            Ok((image_index, suboptimal)) => Ok(AcquireOutcome::Acquired {
                image_index,
                suboptimal,
            }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(e) => Err(RenderError::PresentationFailed(e)),
        }
    }

    /// Present rendered image to screen
    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> Result<PresentOutcome> {
        let wait_semaphores = [wait_semaphore];
        let swapchains = [self.state.handle];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match unsafe { self.loader.queue_present(queue, &present_info) } {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) => Ok(PresentOutcome::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
            Err(e) => Err(RenderError::PresentationFailed(e)),
        }
    }

    pub fn image_count(&self) -> usize {
        self.state.images.len()
    }

    pub fn images(&self) -> &[vk::Image] {
        &self.state.images
    }

    pub fn image_views(&self) -> &[vk::ImageView] {
        &self.state.image_views
    }

    pub fn format(&self) -> vk::Format {
        self.state.surface_format.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.state.extent
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        self.destroy_state();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR { format, color_space }
    }

    #[test]
    fn surface_format_prefers_bgra_srgb() {
        let preferred = format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR);
        let chosen = choose_surface_format(&[
            format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            preferred,
        ])
        .unwrap();
        assert_eq!(chosen, preferred);
    }

    #[test]
    fn surface_format_falls_back_to_first() {
        let first = format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR);
        let chosen = choose_surface_format(&[
            first,
            format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::DISPLAY_P3_NONLINEAR_EXT),
        ])
        .unwrap();
        assert_eq!(chosen, first);
    }

    #[test]
    fn surface_format_requires_at_least_one() {
        assert!(matches!(
            choose_surface_format(&[]),
            Err(RenderError::SwapchainCreationFailed(_))
        ));
    }

    #[test]
    fn present_mode_prefers_mailbox() {
        let chosen = choose_present_mode(&[vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX]);
        assert_eq!(chosen, vk::PresentModeKHR::MAILBOX);
    }

    #[test]
    fn present_mode_falls_back_to_fifo() {
        let chosen = choose_present_mode(&[vk::PresentModeKHR::IMMEDIATE]);
        assert_eq!(chosen, vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn extent_uses_surface_value_when_fixed() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D { width: 1280, height: 720 },
            ..Default::default()
        };
        let chosen = choose_extent(&capabilities, (1920, 1080));
        assert_eq!(chosen, vk::Extent2D { width: 1280, height: 720 });
    }

    #[test]
    fn extent_clamps_small_window_up_to_minimum() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: 0xFFFF_FFFF,
                height: 0xFFFF_FFFF,
            },
            min_image_extent: vk::Extent2D { width: 100, height: 100 },
            max_image_extent: vk::Extent2D { width: 4096, height: 4096 },
            ..Default::default()
        };
        let chosen = choose_extent(&capabilities, (50, 50));
        assert_eq!(chosen, vk::Extent2D { width: 100, height: 100 });
    }

    #[test]
    fn extent_clamps_large_window_down_to_maximum() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D { width: 1, height: 1 },
            max_image_extent: vk::Extent2D { width: 1920, height: 1080 },
            ..Default::default()
        };
        let chosen = choose_extent(&capabilities, (4000, 800));
        assert_eq!(chosen, vk::Extent2D { width: 1920, height: 800 });
    }

    #[test]
    fn image_count_unbounded_cap_gives_three() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 0,
            ..Default::default()
        };
        assert_eq!(choose_image_count(&capabilities), 3);
    }

    #[test]
    fn image_count_respects_larger_minimum() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            min_image_count: 4,
            max_image_count: 8,
            ..Default::default()
        };
        assert_eq!(choose_image_count(&capabilities), 4);
    }

    #[test]
    fn image_count_clamped_by_cap() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            min_image_count: 1,
            max_image_count: 2,
            ..Default::default()
        };
        assert_eq!(choose_image_count(&capabilities), 2);
    }

    #[test]
    fn shared_family_is_exclusive() {
        let (mode, indices) = choose_sharing_mode(QueueFamilyIndices { graphics: 0, present: 0 });
        assert_eq!(mode, vk::SharingMode::EXCLUSIVE);
        assert!(indices.is_empty());
    }

    #[test]
    fn split_families_are_concurrent() {
        let (mode, indices) = choose_sharing_mode(QueueFamilyIndices { graphics: 0, present: 2 });
        assert_eq!(mode, vk::SharingMode::CONCURRENT);
        assert_eq!(indices, vec![0, 2]);
    }
}
