// Renderer - Ties the Vulkan objects to the frame loop
//
// Responsibilities:
// - Building instance -> surface -> device -> swapchain -> pipeline in order
// - Uploading the demo quad and per-frame uniforms
// - Recording the per-frame command buffer (dynamic rendering)
// - Implementing `FrameBackend` on top of the real device
//
// Teardown runs in reverse: the fields below are declared in drop order.

use ash::vk;
use std::sync::Arc;
use std::time::Instant;

use super::buffer::GpuBuffer;
use super::device::DeviceContext;
use super::error::{RenderError, Result};
use super::frame::{FrameBackend, FrameStatus, FrameSyncController};
use super::instance::{Surface, VulkanInstance, WindowHost};
use super::pipeline::{FrameUniforms, PipelineResources, Vertex};
use super::shader::{ShaderLoader, ShaderStages};
use super::swapchain::Swapchain;
use super::sync::{self, AcquireOutcome, FenceWait, PresentOutcome};

const QUAD_VERTICES: [Vertex; 4] = [
    Vertex::new([-0.9, -0.9], [1.0, 0.0, 0.0]),
    Vertex::new([0.9, -0.9], [0.0, 1.0, 0.0]),
    Vertex::new([0.9, 0.9], [0.0, 0.0, 1.0]),
    Vertex::new([-0.9, 0.9], [1.0, 1.0, 1.0]),
];

const QUAD_INDICES: [u16; 6] = [0, 1, 2, 2, 3, 0];

/// Startup options threaded into every constructor.
#[derive(Debug, Clone)]
pub struct RendererConfig {
    pub app_name: String,
    pub enable_validation: bool,
    pub frames_in_flight: usize,
    pub clear_color: [f32; 4],
    pub shader: ShaderStages,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            app_name: "Endura".into(),
            enable_validation: cfg!(debug_assertions),
            frames_in_flight: 2,
            clear_color: [0.0, 0.0, 0.0, 1.0],
            shader: ShaderStages::new("triangle"),
        }
    }
}

/// Every Vulkan object the frame loop touches.
pub struct VulkanBackend {
    window: Arc<dyn WindowHost>,
    command_pool: vk::CommandPool,
    uniform_buffers: Vec<GpuBuffer>,
    index_buffer: GpuBuffer,
    vertex_buffer: GpuBuffer,
    pipeline: PipelineResources,
    swapchain: Swapchain,
    surface: Surface,
    device: Arc<DeviceContext>,
    _instance: Arc<VulkanInstance>,
    clear_color: [f32; 4],
    start_time: Instant,
}

impl VulkanBackend {
    pub fn new(window: Arc<dyn WindowHost>, loader: &dyn ShaderLoader, config: &RendererConfig) -> Result<Self> {
        let instance = VulkanInstance::new(&config.app_name, config.enable_validation, window.as_ref())?;
        let surface = Surface::new(&instance, window.as_ref())?;
        let device = DeviceContext::new(&instance, &surface)?;
        let swapchain = Swapchain::new(Arc::clone(&device), &surface, window.framebuffer_size())?;

        let frames_in_flight = config.frames_in_flight.max(1);
        let pipeline = PipelineResources::new(
            &device,
            loader,
            config.shader.clone(),
            swapchain.format(),
            frames_in_flight as u32,
        )?;

        let vertex_buffer = GpuBuffer::device_local_with_data(
            &device,
            "quad vertices",
            vk::BufferUsageFlags::VERTEX_BUFFER,
            &QUAD_VERTICES,
        )?;
        let index_buffer = GpuBuffer::device_local_with_data(
            &device,
            "quad indices",
            vk::BufferUsageFlags::INDEX_BUFFER,
            &QUAD_INDICES,
        )?;

        // One uniform buffer per frame in flight so a write never races a read
        let mut uniform_buffers = Vec::with_capacity(frames_in_flight);
        for index in 0..frames_in_flight {
            let buffer = GpuBuffer::with_data(
                &device,
                &format!("frame uniforms {index}"),
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                &[FrameUniforms::default()],
            )?;
            pipeline.write_uniform_buffer(index, &buffer)?;
            uniform_buffers.push(buffer);
        }

        // RESET_COMMAND_BUFFER: each frame re-records its own buffer
        let pool_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(device.queue_families.graphics);
        let command_pool = unsafe { device.device.create_command_pool(&pool_info, None) }?;

        log::info!("Renderer initialized successfully");

        Ok(Self {
            window,
            command_pool,
            uniform_buffers,
            index_buffer,
            vertex_buffer,
            pipeline,
            swapchain,
            surface,
            device,
            _instance: instance,
            clear_color: config.clear_color,
            start_time: Instant::now(),
        })
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent()
    }

    fn record_commands(&self, cmd: vk::CommandBuffer, frame_index: usize, image_index: u32) -> Result<()> {
        let device = &self.device.device;
        let image = *self
            .swapchain
            .images()
            .get(image_index as usize)
            .ok_or(RenderError::PresentationFailed(vk::Result::ERROR_UNKNOWN))?;
        let image_view = self.swapchain.image_views()[image_index as usize];
        let extent = self.swapchain.extent();
        let descriptor_set = self.pipeline.descriptor_set(frame_index)?;

        let begin_info =
            vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe {
            device.reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())?;
            device.begin_command_buffer(cmd, &begin_info)?;

            // Transition swapchain image to color attachment layout
            transition_image_layout(
                device,
                cmd,
                image,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                (vk::PipelineStageFlags2::TOP_OF_PIPE, vk::AccessFlags2::empty()),
                (
                    vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                    vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
                ),
            );

            let color_attachments = [vk::RenderingAttachmentInfo::default()
                .image_view(image_view)
                .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::STORE)
                .clear_value(vk::ClearValue {
                    color: vk::ClearColorValue {
                        float32: self.clear_color,
                    },
                })];
            let rendering_info = vk::RenderingInfo::default()
                .render_area(vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent,
                })
                .layer_count(1)
                .color_attachments(&color_attachments);

            device.cmd_begin_rendering(cmd, &rendering_info);

            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.pipeline.pipeline());
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipeline.layout(),
                0,
                &[descriptor_set],
                &[],
            );
            device.cmd_bind_vertex_buffers(cmd, 0, &[self.vertex_buffer.buffer], &[0]);
            device.cmd_bind_index_buffer(cmd, self.index_buffer.buffer, 0, vk::IndexType::UINT16);

            let viewport = vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: extent.width as f32,
                height: extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            };
            let scissor = vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            };
            device.cmd_set_viewport(cmd, 0, &[viewport]);
            device.cmd_set_scissor(cmd, 0, &[scissor]);

            device.cmd_draw_indexed(cmd, QUAD_INDICES.len() as u32, 1, 0, 0, 0);

            device.cmd_end_rendering(cmd);

            // Transition to present layout
            transition_image_layout(
                device,
                cmd,
                image,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                vk::ImageLayout::PRESENT_SRC_KHR,
                (
                    vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                    vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
                ),
                (vk::PipelineStageFlags2::BOTTOM_OF_PIPE, vk::AccessFlags2::empty()),
            );

            device.end_command_buffer(cmd)?;
        }

        Ok(())
    }
}

/// Record a single-image layout transition with explicit stage/access masks.
fn transition_image_layout(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    (src_stage, src_access): (vk::PipelineStageFlags2, vk::AccessFlags2),
    (dst_stage, dst_access): (vk::PipelineStageFlags2, vk::AccessFlags2),
) {
    let barriers = [vk::ImageMemoryBarrier2::default()
        .src_stage_mask(src_stage)
        .src_access_mask(src_access)
        .dst_stage_mask(dst_stage)
        .dst_access_mask(dst_access)
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        })];
    let dependency_info = vk::DependencyInfo::default().image_memory_barriers(&barriers);

    unsafe { device.cmd_pipeline_barrier2(cmd, &dependency_info) };
}

impl FrameBackend for VulkanBackend {
    type Fence = vk::Fence;
    type Semaphore = vk::Semaphore;
    type CommandBuffer = vk::CommandBuffer;

    fn image_count(&self) -> usize {
        self.swapchain.image_count()
    }

    fn create_fence(&mut self, signaled: bool) -> Result<vk::Fence> {
        sync::create_fence(&self.device.device, signaled)
    }

    fn create_semaphore(&mut self) -> Result<vk::Semaphore> {
        sync::create_semaphore(&self.device.device)
    }

    fn allocate_command_buffer(&mut self) -> Result<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { self.device.device.allocate_command_buffers(&alloc_info) }?;
        Ok(buffers[0])
    }

    fn destroy_fence(&mut self, fence: vk::Fence) {
        unsafe { self.device.device.destroy_fence(fence, None) };
    }

    fn destroy_semaphore(&mut self, semaphore: vk::Semaphore) {
        unsafe { self.device.device.destroy_semaphore(semaphore, None) };
    }

    fn free_command_buffer(&mut self, command_buffer: vk::CommandBuffer) {
        unsafe {
            self.device
                .device
                .free_command_buffers(self.command_pool, &[command_buffer])
        };
    }

    fn wait_for_fence(&mut self, fence: vk::Fence, timeout: u64) -> Result<FenceWait> {
        sync::wait_for_fence(&self.device.device, fence, timeout)
    }

    fn reset_fence(&mut self, fence: vk::Fence) -> Result<()> {
        unsafe { self.device.device.reset_fences(&[fence]) }?;
        Ok(())
    }

    fn acquire_next_image(&mut self, signal: vk::Semaphore, timeout: u64) -> Result<AcquireOutcome> {
        self.swapchain.acquire_next_image(signal, timeout)
    }

    fn record_frame(&mut self, command_buffer: vk::CommandBuffer, frame_index: usize, image_index: u32) -> Result<()> {
        // This frame's fence has been waited on, so its uniform buffer is free
        let uniforms = FrameUniforms::new(self.start_time.elapsed().as_secs_f32());
        if let Some(buffer) = self.uniform_buffers.get(frame_index) {
            buffer.upload_slice(&[uniforms])?;
        }

        self.record_commands(command_buffer, frame_index, image_index)
    }

    fn submit(
        &mut self,
        command_buffer: vk::CommandBuffer,
        wait: vk::Semaphore,
        signal: vk::Semaphore,
        fence: vk::Fence,
    ) -> Result<()> {
        let wait_semaphores = [wait];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [command_buffer];
        let signal_semaphores = [signal];

        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.device
                .device
                .queue_submit(self.device.graphics_queue, &[submit_info], fence)
        }?;
        Ok(())
    }

    fn present(&mut self, image_index: u32, wait: vk::Semaphore) -> Result<PresentOutcome> {
        self.swapchain
            .present(self.device.present_queue, image_index, wait)
    }

    fn framebuffer_size(&self) -> (u32, u32) {
        self.window.framebuffer_size()
    }

    fn wait_events(&mut self) -> bool {
        self.window.wait_events()
    }

    fn wait_idle(&mut self) -> Result<()> {
        self.device.wait_idle()
    }

    fn rebuild_swapchain(&mut self) -> Result<()> {
        self.swapchain
            .recreate(&self.surface, self.window.framebuffer_size())?;
        self.pipeline.ensure_color_format(self.swapchain.format())?;
        Ok(())
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        log::info!("Shutting down renderer...");
        let _ = self.device.wait_idle();
        unsafe { self.device.device.destroy_command_pool(self.command_pool, None) };
    }
}

/// The Vulkan backend together with the frame loop driving it.
pub struct Renderer {
    frames: FrameSyncController<VulkanBackend>,
    backend: VulkanBackend,
}

impl Renderer {
    pub fn new(window: Arc<dyn WindowHost>, loader: &dyn ShaderLoader, config: RendererConfig) -> Result<Self> {
        let mut backend = VulkanBackend::new(window, loader, &config)?;
        let frames = FrameSyncController::new(&mut backend, config.frames_in_flight)?;
        Ok(Self { frames, backend })
    }

    pub fn draw_frame(&mut self) -> Result<FrameStatus> {
        self.frames.draw_frame(&mut self.backend)
    }

    /// Hint that the window size changed; the swapchain is rebuilt after the
    /// next present.
    pub fn notify_resized(&mut self) {
        self.frames.notify_resized();
    }

    /// Wait for the GPU and release the frame primitives. Dropping the
    /// renderer afterwards releases everything else.
    pub fn shutdown(&mut self) -> Result<()> {
        self.frames.shutdown(&mut self.backend)
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.backend.extent()
    }

    pub fn frame_index(&self) -> usize {
        self.frames.current_frame()
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        if let Err(e) = self.frames.shutdown(&mut self.backend) {
            log::error!("Renderer shutdown failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quad_indices_stay_in_range() {
        assert!(QUAD_INDICES
            .iter()
            .all(|&i| (i as usize) < QUAD_VERTICES.len()));
    }

    #[test]
    fn quad_triangles_face_clockwise() {
        // Signed area in framebuffer space (y down) is positive for clockwise
        for triangle in QUAD_INDICES.chunks(3) {
            let [a, b, c] = [0, 1, 2].map(|i| QUAD_VERTICES[triangle[i] as usize].position);
            let area = (b - a).perp_dot(c - a);
            assert!(area > 0.0, "triangle {triangle:?} is wound the wrong way");
        }
    }

    #[test]
    fn default_config_double_buffers() {
        let config = RendererConfig::default();
        assert_eq!(config.frames_in_flight, 2);
        assert_eq!(config.shader.vertex_entry, "vertMain");
    }
}
