// Graphics pipeline creation and management
//
// The graphics pipeline defines how vertices are processed and rasterized.
// Built for dynamic rendering against the swapchain colour format, so there
// is no render pass or framebuffer. Viewport and scissor are dynamic.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3};
use std::mem::{offset_of, size_of};
use std::sync::Arc;

use super::buffer::GpuBuffer;
use super::device::DeviceContext;
use super::error::{RenderError, Result};
use super::shader::{ShaderLoader, ShaderModule, ShaderStages};

/// Interleaved per-vertex data: 2-D position + RGB colour
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: Vec2,
    pub color: Vec3,
}

impl Vertex {
    pub const fn new(position: [f32; 2], color: [f32; 3]) -> Self {
        Self {
            position: Vec2::from_array(position),
            color: Vec3::from_array(color),
        }
    }

    pub fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription {
            binding: 0,
            stride: size_of::<Self>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }
    }

    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 2] {
        [
            vk::VertexInputAttributeDescription {
                location: 0,
                binding: 0,
                format: vk::Format::R32G32_SFLOAT,
                offset: offset_of!(Self, position) as u32,
            },
            vk::VertexInputAttributeDescription {
                location: 1,
                binding: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: offset_of!(Self, color) as u32,
            },
        ]
    }
}

/// Contents of the per-frame uniform buffer (binding 0, fragment stage).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct FrameUniforms {
    /// Seconds since startup
    pub time: f32,
    pub _pad: [f32; 3],
}

impl FrameUniforms {
    pub fn new(time: f32) -> Self {
        Self { time, _pad: [0.0; 3] }
    }
}

/// Standard "over" blending: colour by source alpha, alpha passed through.
pub fn alpha_blend_attachment() -> vk::PipelineColorBlendAttachmentState {
    vk::PipelineColorBlendAttachmentState {
        blend_enable: vk::TRUE,
        src_color_blend_factor: vk::BlendFactor::SRC_ALPHA,
        dst_color_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
        color_blend_op: vk::BlendOp::ADD,
        src_alpha_blend_factor: vk::BlendFactor::ONE,
        dst_alpha_blend_factor: vk::BlendFactor::ZERO,
        alpha_blend_op: vk::BlendOp::ADD,
        color_write_mask: vk::ColorComponentFlags::RGBA,
    }
}

/// Pipeline plus the descriptor objects feeding it.
pub struct PipelineResources {
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
    descriptor_pool: vk::DescriptorPool,
    descriptor_set_layout: vk::DescriptorSetLayout,
    descriptor_sets: Vec<vk::DescriptorSet>,
    color_format: vk::Format,
    stages: ShaderStages,
    shader: ShaderModule,
    device: Arc<DeviceContext>,
}

impl PipelineResources {
    /// Build everything against `color_format`, with `set_count` uniform
    /// descriptor sets (one per frame in flight).
    pub fn new(
        device: &Arc<DeviceContext>,
        loader: &dyn ShaderLoader,
        stages: ShaderStages,
        color_format: vk::Format,
        set_count: u32,
    ) -> Result<Self> {
        let shader = ShaderModule::load(device, loader, &stages)?;

        // Null handles are skipped by Drop, so `?` below cleans up partial state
        let mut resources = Self {
            pipeline: vk::Pipeline::null(),
            layout: vk::PipelineLayout::null(),
            descriptor_pool: vk::DescriptorPool::null(),
            descriptor_set_layout: vk::DescriptorSetLayout::null(),
            descriptor_sets: Vec::new(),
            color_format,
            stages,
            shader,
            device: Arc::clone(device),
        };

        resources.create_descriptors(set_count.max(1))?;
        resources.create_layout()?;
        resources.pipeline = resources.create_pipeline(color_format)?;

        log::info!(
            "Graphics pipeline created for {:?} ({} descriptor sets)",
            color_format,
            resources.descriptor_sets.len()
        );
        Ok(resources)
    }

    fn create_descriptors(&mut self, set_count: u32) -> Result<()> {
        let device = &self.device.device;

        let bindings = [vk::DescriptorSetLayoutBinding::default()
            .binding(0)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::FRAGMENT)];
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        self.descriptor_set_layout = unsafe { device.create_descriptor_set_layout(&layout_info, None) }
            .map_err(|e| RenderError::PipelineCreationFailed(format!("descriptor set layout: {e}")))?;

        let pool_sizes = [vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: set_count,
        }];
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(set_count)
            .pool_sizes(&pool_sizes);
        self.descriptor_pool = unsafe { device.create_descriptor_pool(&pool_info, None) }
            .map_err(|e| RenderError::PipelineCreationFailed(format!("descriptor pool: {e}")))?;

        let set_layouts = vec![self.descriptor_set_layout; set_count as usize];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.descriptor_pool)
            .set_layouts(&set_layouts);
        self.descriptor_sets = unsafe { device.allocate_descriptor_sets(&alloc_info) }
            .map_err(|e| RenderError::PipelineCreationFailed(format!("descriptor sets: {e}")))?;

        Ok(())
    }

    fn create_layout(&mut self) -> Result<()> {
        let set_layouts = [self.descriptor_set_layout];
        let layout_info = vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts);

        self.layout = unsafe { self.device.device.create_pipeline_layout(&layout_info, None) }
            .map_err(|e| RenderError::PipelineCreationFailed(format!("pipeline layout: {e}")))?;
        Ok(())
    }

    fn create_pipeline(&self, color_format: vk::Format) -> Result<vk::Pipeline> {
        let (vertex_entry, fragment_entry) = self.stages.entry_points()?;

        // Shader stages
        let shader_stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(self.shader.handle)
                .name(&vertex_entry),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(self.shader.handle)
                .name(&fragment_entry),
        ];

        // Vertex input
        let bindings = [Vertex::binding_description()];
        let attributes = Vertex::attribute_descriptions();
        let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);

        // Input assembly
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .primitive_restart_enable(false);

        // Viewport and scissor are set per frame
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        // Rasterization
        let rasterizer = vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0)
            .cull_mode(vk::CullModeFlags::BACK)
            .front_face(vk::FrontFace::CLOCKWISE)
            .depth_bias_enable(false);

        // Multisampling (disabled)
        let multisampling = vk::PipelineMultisampleStateCreateInfo::default()
            .sample_shading_enable(false)
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let color_blend_attachments = [alpha_blend_attachment()];
        let color_blending = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .logic_op(vk::LogicOp::COPY)
            .attachments(&color_blend_attachments);

        // Dynamic rendering: declare the attachment format instead of a render pass
        let color_formats = [color_format];
        let mut rendering_info =
            vk::PipelineRenderingCreateInfo::default().color_attachment_formats(&color_formats);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input_info)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisampling)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(self.layout)
            .push_next(&mut rendering_info);

        let pipelines = unsafe {
            self.device
                .device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        }
        .map_err(|(_, e)| RenderError::PipelineCreationFailed(format!("graphics pipeline: {e}")))?;

        pipelines
            .into_iter()
            .next()
            .ok_or_else(|| RenderError::PipelineCreationFailed("driver returned no pipeline".into()))
    }

    /// Rebuild the pipeline if the swapchain changed colour format.
    /// Returns whether a rebuild happened. The device must be idle.
    pub fn ensure_color_format(&mut self, format: vk::Format) -> Result<bool> {
        if format == self.color_format {
            return Ok(false);
        }

        log::info!("Swapchain format changed {:?} -> {:?}, rebuilding pipeline", self.color_format, format);
        // On failure the old pipeline and its format stay paired
        let pipeline = self.create_pipeline(format)?;
        let old = std::mem::replace(&mut self.pipeline, pipeline);
        self.color_format = format;
        unsafe { self.device.device.destroy_pipeline(old, None) };
        Ok(true)
    }

    /// Point descriptor set `index` at `buffer`.
    ///
    /// The set must not be in use by a submission that has not completed.
    pub fn write_uniform_buffer(&self, index: usize, buffer: &GpuBuffer) -> Result<()> {
        let set = self.descriptor_set(index)?;
        let buffer_info = [vk::DescriptorBufferInfo {
            buffer: buffer.buffer,
            offset: 0,
            range: buffer.size(),
        }];
        let write = vk::WriteDescriptorSet::default()
            .dst_set(set)
            .dst_binding(0)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .buffer_info(&buffer_info);

        unsafe { self.device.device.update_descriptor_sets(&[write], &[]) };
        Ok(())
    }

    pub fn descriptor_set(&self, index: usize) -> Result<vk::DescriptorSet> {
        self.descriptor_sets.get(index).copied().ok_or_else(|| {
            RenderError::PipelineCreationFailed(format!(
                "descriptor set {index} out of {}",
                self.descriptor_sets.len()
            ))
        })
    }

    pub fn pipeline(&self) -> vk::Pipeline {
        self.pipeline
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    pub fn color_format(&self) -> vk::Format {
        self.color_format
    }
}

impl Drop for PipelineResources {
    fn drop(&mut self) {
        let device = &self.device.device;
        unsafe {
            device.destroy_pipeline(self.pipeline, None);
            device.destroy_pipeline_layout(self.layout, None);
            // Sets are freed with their pool
            device.destroy_descriptor_pool(self.descriptor_pool, None);
            device.destroy_descriptor_set_layout(self.descriptor_set_layout, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_layout_is_tightly_packed() {
        assert_eq!(size_of::<Vertex>(), 20);

        let binding = Vertex::binding_description();
        assert_eq!(binding.stride, 20);

        let [position, color] = Vertex::attribute_descriptions();
        assert_eq!((position.location, position.offset), (0, 0));
        assert_eq!(position.format, vk::Format::R32G32_SFLOAT);
        assert_eq!((color.location, color.offset), (1, 8));
        assert_eq!(color.format, vk::Format::R32G32B32_SFLOAT);
    }

    #[test]
    fn vertex_bytes_match_field_order() {
        let vertex = Vertex::new([1.0, 2.0], [3.0, 4.0, 5.0]);
        let floats: &[f32] = bytemuck::cast_slice(std::slice::from_ref(&vertex));
        assert_eq!(floats, &[1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn uniforms_fill_a_std140_vec4() {
        assert_eq!(size_of::<FrameUniforms>(), 16);
        assert_eq!(bytemuck::bytes_of(&FrameUniforms::new(1.5))[..4], 1.5f32.to_ne_bytes());
    }

    #[test]
    fn blending_is_source_over() {
        let blend = alpha_blend_attachment();
        assert_eq!(blend.blend_enable, vk::TRUE);
        assert_eq!(blend.src_color_blend_factor, vk::BlendFactor::SRC_ALPHA);
        assert_eq!(blend.dst_color_blend_factor, vk::BlendFactor::ONE_MINUS_SRC_ALPHA);
        assert_eq!(blend.src_alpha_blend_factor, vk::BlendFactor::ONE);
        assert_eq!(blend.dst_alpha_blend_factor, vk::BlendFactor::ZERO);
    }
}
