// Vulkan Instance + Surface - Connection to the driver and the window
//
// Responsibilities:
// - Loading the Vulkan library
// - Instance creation with optional validation layers
// - Debug messenger routing validation output into `log`
// - Presentation surface creation from a window's raw handles

use ash::{vk, Entry};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::ffi::{c_char, CStr, CString};
use std::sync::Arc;

use super::error::{RenderError, Result};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// What the core needs from the platform window.
///
/// Besides the raw handles used for surface creation, the frame loop needs the
/// current framebuffer size in pixels and, where the platform allows it, a way
/// to block on events while the window is minimized.
pub trait WindowHost: HasWindowHandle + HasDisplayHandle {
    /// Framebuffer size in physical pixels.
    fn framebuffer_size(&self) -> (u32, u32);

    /// Block until the windowing system has something new to report.
    ///
    /// Hosts whose event loop cannot be pumped from inside a frame return
    /// `false` straight away; the frame loop then defers the rebuild.
    fn wait_events(&self) -> bool;
}

/// Names from `required` that `available` does not list, in request order.
pub fn missing_extensions(available: &[vk::ExtensionProperties], required: &[&CStr]) -> Vec<String> {
    required
        .iter()
        .filter(|&&name| {
            !available
                .iter()
                .any(|props| props.extension_name_as_c_str().is_ok_and(|found| found == name))
        })
        .map(|name| name.to_string_lossy().into_owned())
        .collect()
}

/// Vulkan instance wrapper with automatic cleanup
pub struct VulkanInstance {
    debug_utils: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
    pub instance: ash::Instance,
    pub entry: Entry,
}

impl VulkanInstance {
    /// Create the instance.
    ///
    /// # Arguments
    /// * `app_name` - Application name reported to the driver
    /// * `enable_validation` - Enable Khronos validation + debug messenger
    /// * `window` - Used only to discover the platform surface extensions
    pub fn new(
        app_name: &str,
        enable_validation: bool,
        window: &dyn WindowHost,
    ) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan instance: {} (validation: {})", app_name, enable_validation);

        let entry = unsafe { Entry::load() }?;

        let app_name_cstr = CString::new(app_name)
            .map_err(|e| RenderError::InstanceCreation(e.to_string()))?;
        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 0, 1))
            .engine_name(c"Endura")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_3);

        let layer_names: Vec<*const c_char> = if enable_validation {
            Self::check_layers(&entry, &[VALIDATION_LAYER])?;
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            vec![]
        };

        let display_handle = window
            .display_handle()
            .map_err(|e| RenderError::SurfaceCreationFailed(e.to_string()))?;
        let surface_extensions = ash_window::enumerate_required_extensions(display_handle.as_raw())
            .map_err(|e| RenderError::InstanceCreation(format!("surface extensions: {e}")))?;
        // ash-window hands out pointers to static, nul-terminated names
        let mut required: Vec<&CStr> = surface_extensions
            .iter()
            .map(|&name| unsafe { CStr::from_ptr(name) })
            .collect();
        if enable_validation {
            required.push(ash::ext::debug_utils::NAME);
        }

        let available = unsafe { entry.enumerate_instance_extension_properties(None) }?;
        let missing = missing_extensions(&available, &required);
        if !missing.is_empty() {
            return Err(RenderError::InstanceCreation(format!(
                "required extensions not supported: {}",
                missing.join(", ")
            )));
        }
        let extensions: Vec<*const c_char> = required.iter().map(|name| name.as_ptr()).collect();

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_layer_names(&layer_names)
            .enabled_extension_names(&extensions);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .map_err(|e| RenderError::InstanceCreation(e.to_string()))?;

        let debug_utils = if enable_validation {
            match Self::setup_debug_messenger(&entry, &instance) {
                Ok(messenger) => Some(messenger),
                Err(e) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(e);
                }
            }
        } else {
            None
        };

        Ok(Arc::new(Self {
            debug_utils,
            instance,
            entry,
        }))
    }

    /// Fail if any requested layer is missing from the loader.
    fn check_layers(entry: &Entry, required: &[&CStr]) -> Result<()> {
        let available = unsafe { entry.enumerate_instance_layer_properties() }?;

        for layer in required {
            let supported = available
                .iter()
                .any(|props| props.layer_name_as_c_str().is_ok_and(|name| name == *layer));
            if !supported {
                return Err(RenderError::InstanceCreation(format!(
                    "required layer {} is not supported",
                    layer.to_string_lossy()
                )));
            }
        }

        Ok(())
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ash::ext::debug_utils::Instance::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }?;

        Ok((debug_utils, messenger))
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan instance...");

        unsafe {
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Presentation surface tied to one window.
pub struct Surface {
    pub loader: ash::khr::surface::Instance,
    pub handle: vk::SurfaceKHR,
    _instance: Arc<VulkanInstance>,
}

impl Surface {
    pub fn new(instance: &Arc<VulkanInstance>, window: &dyn WindowHost) -> Result<Self> {
        let display_handle = window
            .display_handle()
            .map_err(|e| RenderError::SurfaceCreationFailed(e.to_string()))?;
        let window_handle = window
            .window_handle()
            .map_err(|e| RenderError::SurfaceCreationFailed(e.to_string()))?;

        let handle = unsafe {
            ash_window::create_surface(
                &instance.entry,
                &instance.instance,
                display_handle.as_raw(),
                window_handle.as_raw(),
                None,
            )
        }
        .map_err(|e| RenderError::SurfaceCreationFailed(e.to_string()))?;

        let loader = ash::khr::surface::Instance::new(&instance.entry, &instance.instance);

        Ok(Self {
            loader,
            handle,
            _instance: Arc::clone(instance),
        })
    }

    pub fn supports_present(&self, physical_device: vk::PhysicalDevice, family: u32) -> Result<bool> {
        let supported = unsafe {
            self.loader
                .get_physical_device_surface_support(physical_device, family, self.handle)
        }?;
        Ok(supported)
    }

    pub fn capabilities(&self, physical_device: vk::PhysicalDevice) -> Result<vk::SurfaceCapabilitiesKHR> {
        let caps = unsafe {
            self.loader
                .get_physical_device_surface_capabilities(physical_device, self.handle)
        }?;
        Ok(caps)
    }

    pub fn formats(&self, physical_device: vk::PhysicalDevice) -> Result<Vec<vk::SurfaceFormatKHR>> {
        let formats = unsafe {
            self.loader
                .get_physical_device_surface_formats(physical_device, self.handle)
        }?;
        Ok(formats)
    }

    pub fn present_modes(&self, physical_device: vk::PhysicalDevice) -> Result<Vec<vk::PresentModeKHR>> {
        let modes = unsafe {
            self.loader
                .get_physical_device_surface_present_modes(physical_device, self.handle)
        }?;
        Ok(modes)
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        unsafe { self.loader.destroy_surface(self.handle, None) };
    }
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() {
        return vk::FALSE;
    }
    let message = unsafe { (*p_callback_data).message_as_c_str() }
        .map(CStr::to_string_lossy)
        .unwrap_or_default();

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => log::error!("[Vulkan] {}", message),
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => log::warn!("[Vulkan] {}", message),
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => log::info!("[Vulkan] {}", message),
        _ => log::debug!("[Vulkan] {}", message),
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extension(name: &CStr) -> vk::ExtensionProperties {
        let mut props = vk::ExtensionProperties::default();
        for (slot, &byte) in props.extension_name.iter_mut().zip(name.to_bytes()) {
            *slot = byte as c_char;
        }
        props
    }

    #[test]
    fn all_extensions_present() {
        let available = [extension(c"VK_KHR_surface"), extension(c"VK_KHR_xcb_surface")];
        assert!(missing_extensions(&available, &[c"VK_KHR_surface"]).is_empty());
    }

    #[test]
    fn reports_each_missing_extension() {
        let available = [extension(c"VK_KHR_surface")];
        let missing = missing_extensions(
            &available,
            &[c"VK_KHR_wayland_surface", c"VK_KHR_surface", ash::ext::debug_utils::NAME],
        );
        assert_eq!(missing, vec!["VK_KHR_wayland_surface", "VK_EXT_debug_utils"]);
    }

    #[test]
    fn prefix_is_not_a_match() {
        let available = [extension(c"VK_KHR_surface_protected_capabilities")];
        assert_eq!(missing_extensions(&available, &[c"VK_KHR_surface"]), vec!["VK_KHR_surface"]);
    }
}
