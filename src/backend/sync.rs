// Synchronization primitives
//
// Fences, semaphores for GPU-CPU and GPU-GPU sync.
// Frame slots are recycled forever; image slots follow the swapchain.

use ash::vk;

use super::error::Result;

/// One per frame in flight.
///
/// The fence is signaled by the submission that used `command_buffer`, so the
/// buffer may only be reset once a wait on the fence has succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSlot<C, F> {
    pub command_buffer: C,
    pub in_flight_fence: F,
}

/// One per swapchain image.
///
/// `image_acquired` is picked by the rotating acquire index, `render_complete`
/// by the image index the acquire returned. The two rarely line up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageSlot<S> {
    pub image_acquired: S,
    pub render_complete: S,
}

/// Result of a bounded fence wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceWait {
    Signaled,
    TimedOut,
}

/// Result of asking the swapchain for its next image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired { image_index: u32, suboptimal: bool },
    /// The swapchain no longer matches the surface and must be rebuilt.
    OutOfDate,
}

/// Result of queueing an image for presentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    Suboptimal,
    OutOfDate,
}

pub fn create_fence(device: &ash::Device, signaled: bool) -> Result<vk::Fence> {
    let flags = if signaled {
        vk::FenceCreateFlags::SIGNALED
    } else {
        vk::FenceCreateFlags::empty()
    };
    let fence_info = vk::FenceCreateInfo::default().flags(flags);
    Ok(unsafe { device.create_fence(&fence_info, None) }?)
}

pub fn create_semaphore(device: &ash::Device) -> Result<vk::Semaphore> {
    let semaphore_info = vk::SemaphoreCreateInfo::default();
    Ok(unsafe { device.create_semaphore(&semaphore_info, None) }?)
}

/// Wait on a single fence. `VK_TIMEOUT` is reported, not treated as an error.
pub fn wait_for_fence(device: &ash::Device, fence: vk::Fence, timeout: u64) -> Result<FenceWait> {
    match unsafe { device.wait_for_fences(&[fence], true, timeout) } {
        Ok(()) => Ok(FenceWait::Signaled),
        Err(vk::Result::TIMEOUT) => Ok(FenceWait::TimedOut),
        Err(e) => Err(e.into()),
    }
}
