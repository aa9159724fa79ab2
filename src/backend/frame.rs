// Frame Sync Controller - The steady-state render loop
//
// Responsibilities:
// - Throttling the CPU to N frames in flight with per-frame fences
// - Acquire -> record -> submit -> present, with the right semaphores
// - Swapchain invalidation recovery (out-of-date, suboptimal, resize)
// - Orderly teardown of every primitive it created
//
// All GPU work goes through `FrameBackend` so the sequencing can be driven
// against a fake device in tests.

use ash::vk;
use std::fmt;

use super::error::{RenderError, Result};
use super::sync::{AcquireOutcome, FenceWait, FrameSlot, ImageSlot, PresentOutcome};

/// Effectively unbounded; the wait loops on timeout anyway.
const FRAME_TIMEOUT_NS: u64 = u64::MAX;

/// Everything the frame loop needs from the device, swapchain and window.
pub trait FrameBackend {
    type Fence: Copy + PartialEq + fmt::Debug;
    type Semaphore: Copy + PartialEq + fmt::Debug;
    type CommandBuffer: Copy + PartialEq + fmt::Debug;

    /// Number of images in the current swapchain.
    fn image_count(&self) -> usize;

    fn create_fence(&mut self, signaled: bool) -> Result<Self::Fence>;
    fn create_semaphore(&mut self) -> Result<Self::Semaphore>;
    fn allocate_command_buffer(&mut self) -> Result<Self::CommandBuffer>;
    fn destroy_fence(&mut self, fence: Self::Fence);
    fn destroy_semaphore(&mut self, semaphore: Self::Semaphore);
    fn free_command_buffer(&mut self, command_buffer: Self::CommandBuffer);

    fn wait_for_fence(&mut self, fence: Self::Fence, timeout: u64) -> Result<FenceWait>;
    fn reset_fence(&mut self, fence: Self::Fence) -> Result<()>;

    /// Request the next image, signalling `signal` once it is usable.
    fn acquire_next_image(&mut self, signal: Self::Semaphore, timeout: u64) -> Result<AcquireOutcome>;

    /// Reset and re-record `command_buffer` to draw into `image_index`.
    fn record_frame(
        &mut self,
        command_buffer: Self::CommandBuffer,
        frame_index: usize,
        image_index: u32,
    ) -> Result<()>;

    /// Submit on the graphics queue: wait `wait` at colour output, then
    /// signal `signal` and `fence`.
    fn submit(
        &mut self,
        command_buffer: Self::CommandBuffer,
        wait: Self::Semaphore,
        signal: Self::Semaphore,
        fence: Self::Fence,
    ) -> Result<()>;

    fn present(&mut self, image_index: u32, wait: Self::Semaphore) -> Result<PresentOutcome>;

    fn framebuffer_size(&self) -> (u32, u32);

    /// Block until the window has something new to report. Returns `false`
    /// when the host cannot block from inside a frame.
    fn wait_events(&mut self) -> bool;
    fn wait_idle(&mut self) -> Result<()>;

    /// Destroy and rebuild the swapchain. Called with the device idle and a
    /// nonzero framebuffer.
    fn rebuild_swapchain(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    AcquireImage,
    RecordAndSubmit,
    Present,
    SwapchainRebuild,
    /// A rebuild failed part way; no image slots are left to draw with.
    Faulted,
    ShuttingDown,
}

/// What a call to [`FrameSyncController::draw_frame`] ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// A frame was submitted and queued for presentation.
    Presented,
    /// Acquire reported out-of-date; the swapchain was rebuilt and nothing
    /// was submitted.
    Rebuilt,
    /// The window has zero area and the host could not wait for it to come
    /// back. Nothing was submitted; the rebuild runs on a later call.
    Deferred,
}

pub struct FrameSyncController<B: FrameBackend> {
    frames: Vec<FrameSlot<B::CommandBuffer, B::Fence>>,
    images: Vec<ImageSlot<B::Semaphore>>,
    current_frame: usize,
    semaphore_index: usize,
    state: FrameState,
    rebuild_requested: bool,
    rebuild_deferred: bool,
}

impl<B: FrameBackend> FrameSyncController<B> {
    /// Create `frames_in_flight` frame slots and one image slot per swapchain
    /// image. Fences start signaled so the first wait passes.
    pub fn new(backend: &mut B, frames_in_flight: usize) -> Result<Self> {
        let mut controller = Self {
            frames: Vec::with_capacity(frames_in_flight),
            images: Vec::new(),
            current_frame: 0,
            semaphore_index: 0,
            state: FrameState::Idle,
            rebuild_requested: false,
            rebuild_deferred: false,
        };

        if let Err(e) = controller.create_frame_slots(backend, frames_in_flight.max(1)) {
            controller.destroy_all(backend);
            return Err(e);
        }
        if let Err(e) = controller.create_image_slots(backend) {
            controller.destroy_all(backend);
            return Err(e);
        }

        log::info!(
            "Frame sync: {} frames in flight, {} swapchain images",
            controller.frames.len(),
            controller.images.len()
        );
        Ok(controller)
    }

    fn create_frame_slots(&mut self, backend: &mut B, count: usize) -> Result<()> {
        for _ in 0..count {
            let command_buffer = backend.allocate_command_buffer()?;
            let in_flight_fence = match backend.create_fence(true) {
                Ok(fence) => fence,
                Err(e) => {
                    backend.free_command_buffer(command_buffer);
                    return Err(e);
                }
            };
            self.frames.push(FrameSlot {
                command_buffer,
                in_flight_fence,
            });
        }
        Ok(())
    }

    fn create_image_slots(&mut self, backend: &mut B) -> Result<()> {
        let count = backend.image_count();
        if count == 0 {
            return Err(RenderError::SwapchainCreationFailed("swapchain has no images".into()));
        }

        for _ in 0..count {
            let image_acquired = backend.create_semaphore()?;
            let render_complete = match backend.create_semaphore() {
                Ok(semaphore) => semaphore,
                Err(e) => {
                    backend.destroy_semaphore(image_acquired);
                    return Err(e);
                }
            };
            self.images.push(ImageSlot {
                image_acquired,
                render_complete,
            });
        }
        Ok(())
    }

    fn destroy_image_slots(&mut self, backend: &mut B) {
        for slot in self.images.drain(..) {
            backend.destroy_semaphore(slot.image_acquired);
            backend.destroy_semaphore(slot.render_complete);
        }
    }

    fn destroy_all(&mut self, backend: &mut B) {
        self.destroy_image_slots(backend);
        for slot in self.frames.drain(..) {
            backend.destroy_fence(slot.in_flight_fence);
            backend.free_command_buffer(slot.command_buffer);
        }
    }

    /// Run one acquire -> record -> submit -> present cycle.
    ///
    /// Returns [`FrameStatus::Rebuilt`] when acquire found the swapchain out
    /// of date. Any error is fatal for the loop; the controller is left idle
    /// (or faulted, if a rebuild broke) so it can still be shut down.
    pub fn draw_frame(&mut self, backend: &mut B) -> Result<FrameStatus> {
        match self.state {
            FrameState::ShuttingDown => return Err(RenderError::ShutDown),
            FrameState::Faulted => {
                return Err(RenderError::SwapchainCreationFailed(
                    "swapchain was lost in a failed rebuild".into(),
                ))
            }
            _ => {}
        }

        let result = self.run_frame(backend);
        if self.state != FrameState::Faulted {
            self.state = FrameState::Idle;
        }
        result
    }

    fn run_frame(&mut self, backend: &mut B) -> Result<FrameStatus> {
        if self.rebuild_deferred && !self.rebuild(backend)? {
            return Ok(FrameStatus::Deferred);
        }

        let frame = self.frames[self.current_frame];

        // Throttle: the previous submission from this slot must be done
        while backend.wait_for_fence(frame.in_flight_fence, FRAME_TIMEOUT_NS)? == FenceWait::TimedOut {}

        self.state = FrameState::AcquireImage;
        let image_acquired = self.images[self.semaphore_index].image_acquired;
        let image_index = match backend.acquire_next_image(image_acquired, FRAME_TIMEOUT_NS)? {
            AcquireOutcome::OutOfDate => {
                // Fence untouched: the next wait must still see it signaled
                return Ok(if self.rebuild(backend)? {
                    FrameStatus::Rebuilt
                } else {
                    FrameStatus::Deferred
                });
            }
            AcquireOutcome::Acquired {
                image_index,
                suboptimal,
            } => {
                if suboptimal {
                    log::debug!("Acquired suboptimal image {}, rebuilding after present", image_index);
                    self.rebuild_requested = true;
                }
                image_index
            }
        };
        let render_complete = self
            .images
            .get(image_index as usize)
            .map(|slot| slot.render_complete)
            .ok_or(RenderError::PresentationFailed(vk::Result::ERROR_UNKNOWN))?;

        // Only now is it safe to unsignal the fence
        backend.reset_fence(frame.in_flight_fence)?;

        self.state = FrameState::RecordAndSubmit;
        backend.record_frame(frame.command_buffer, self.current_frame, image_index)?;
        backend.submit(
            frame.command_buffer,
            image_acquired,
            render_complete,
            frame.in_flight_fence,
        )?;

        self.state = FrameState::Present;
        match backend.present(image_index, render_complete)? {
            PresentOutcome::Presented => {}
            PresentOutcome::Suboptimal => self.rebuild_requested = true,
            // The next acquire reports it again and drives the rebuild
            PresentOutcome::OutOfDate => log::warn!("Present reported out-of-date swapchain"),
        }

        self.advance();

        if self.rebuild_requested {
            self.rebuild(backend)?;
        }

        Ok(FrameStatus::Presented)
    }

    fn advance(&mut self) {
        self.semaphore_index = (self.semaphore_index + 1) % self.images.len();
        self.current_frame = (self.current_frame + 1) % self.frames.len();
    }

    /// Returns `false` if the rebuild was put off because the window has
    /// zero area and the host cannot block.
    fn rebuild(&mut self, backend: &mut B) -> Result<bool> {
        self.state = FrameState::SwapchainRebuild;

        // Minimized: nothing to build against until the window comes back
        loop {
            let (width, height) = backend.framebuffer_size();
            if width > 0 && height > 0 {
                break;
            }
            if !backend.wait_events() {
                log::debug!("Framebuffer has zero area, deferring swapchain rebuild");
                self.rebuild_deferred = true;
                return Ok(false);
            }
        }

        backend.wait_idle()?;
        self.destroy_image_slots(backend);
        let rebuilt = backend
            .rebuild_swapchain()
            .and_then(|()| self.create_image_slots(backend));
        if let Err(e) = rebuilt {
            self.state = FrameState::Faulted;
            return Err(e);
        }

        // The image count may have shrunk
        self.semaphore_index %= self.images.len();
        self.rebuild_requested = false;
        self.rebuild_deferred = false;

        log::info!("Swapchain rebuilt with {} images", self.images.len());
        Ok(true)
    }

    /// Window resized: rebuild once the current frame has been presented.
    pub fn notify_resized(&mut self) {
        self.rebuild_requested = true;
    }

    /// Wait for the device and destroy every primitive. Later draws fail
    /// with [`RenderError::ShutDown`]. Calling it again is a no-op.
    pub fn shutdown(&mut self, backend: &mut B) -> Result<()> {
        if self.state == FrameState::ShuttingDown {
            return Ok(());
        }
        debug_assert!(matches!(self.state, FrameState::Idle | FrameState::Faulted));

        let idle = backend.wait_idle();
        self.destroy_all(backend);
        self.state = FrameState::ShuttingDown;
        idle
    }

    pub fn current_frame(&self) -> usize {
        self.current_frame
    }

    pub fn semaphore_index(&self) -> usize {
        self.semaphore_index
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames.len()
    }

    pub fn image_slot_count(&self) -> usize {
        self.images.len()
    }
}
