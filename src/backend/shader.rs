// Shader module loading and management
//
// Vulkan uses SPIR-V bytecode for shaders. Both stages come from one
// compiled module with separate entry points.

use ash::vk;
use std::ffi::CString;
use std::io;
use std::sync::Arc;

use super::device::DeviceContext;
use super::error::{RenderError, Result};

/// Source of compiled shader binaries, keyed by logical name.
pub trait ShaderLoader {
    /// SPIR-V words for `name`.
    fn load_shader(&self, name: &str) -> io::Result<Vec<u32>>;
}

/// Which module to load and where each stage starts.
#[derive(Debug, Clone)]
pub struct ShaderStages {
    pub name: String,
    pub vertex_entry: String,
    pub fragment_entry: String,
}

impl ShaderStages {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vertex_entry: "vertMain".into(),
            fragment_entry: "fragMain".into(),
        }
    }

    pub fn entry_points(&self) -> Result<(CString, CString)> {
        let vertex = CString::new(self.vertex_entry.as_str())
            .map_err(|e| RenderError::PipelineCreationFailed(format!("vertex entry point: {e}")))?;
        let fragment = CString::new(self.fragment_entry.as_str())
            .map_err(|e| RenderError::PipelineCreationFailed(format!("fragment entry point: {e}")))?;
        Ok((vertex, fragment))
    }
}

/// Owned `vk::ShaderModule`, destroyed on drop.
pub struct ShaderModule {
    pub handle: vk::ShaderModule,
    device: Arc<DeviceContext>,
}

impl ShaderModule {
    pub fn new(device: &Arc<DeviceContext>, code: &[u32]) -> Result<Self> {
        let create_info = vk::ShaderModuleCreateInfo::default().code(code);

        let handle = unsafe { device.device.create_shader_module(&create_info, None) }
            .map_err(|e| RenderError::PipelineCreationFailed(format!("shader module: {e}")))?;

        Ok(Self {
            handle,
            device: Arc::clone(device),
        })
    }

    /// Load `stages.name` through `loader` and build the module.
    pub fn load(device: &Arc<DeviceContext>, loader: &dyn ShaderLoader, stages: &ShaderStages) -> Result<Self> {
        let code = loader
            .load_shader(&stages.name)
            .map_err(|e| RenderError::PipelineCreationFailed(format!("shader '{}': {e}", stages.name)))?;
        log::debug!("Loaded shader '{}' ({} words)", stages.name, code.len());
        Self::new(device, &code)
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_shader_module(self.handle, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_entry_points() {
        let stages = ShaderStages::new("triangle");
        let (vertex, fragment) = stages.entry_points().unwrap();
        assert_eq!(vertex.to_str().unwrap(), "vertMain");
        assert_eq!(fragment.to_str().unwrap(), "fragMain");
    }

    #[test]
    fn interior_nul_in_entry_point_is_pipeline_error() {
        let mut stages = ShaderStages::new("triangle");
        stages.fragment_entry = "frag\0Main".into();
        assert!(matches!(
            stages.entry_points(),
            Err(RenderError::PipelineCreationFailed(_))
        ));
    }
}
