// Device Context - Core GPU interface
//
// Responsibilities:
// - Physical device selection (prefer discrete GPU, then larger images)
// - Graphics/present queue family resolution against a surface
// - Logical device + queue creation
// - Memory allocator setup
// - One-shot command execution for init-time uploads

use ash::vk;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use parking_lot::{Mutex, MutexGuard};
use std::ffi::{c_char, CStr};
use std::mem::ManuallyDrop;
use std::sync::Arc;

use super::error::{RenderError, Result};
use super::instance::{Surface, VulkanInstance};

/// Bonus for discrete GPUs. Above any `u32` image limit, so the device class
/// always decides first.
const DISCRETE_GPU_BONUS: u64 = 1 << 32;

/// Required device extensions
const DEVICE_EXTENSIONS: [&CStr; 7] = [
    ash::khr::swapchain::NAME,
    c"VK_KHR_spirv_1_4",
    ash::khr::synchronization2::NAME,
    ash::khr::create_renderpass2::NAME,
    c"VK_KHR_shader_draw_parameters",
    ash::khr::dynamic_rendering::NAME,
    ash::ext::extended_dynamic_state::NAME,
];

/// One adapter as seen during selection. Discarded once a winner is picked.
#[derive(Debug, Clone, Copy)]
pub struct PhysicalDeviceCandidate {
    pub device_type: vk::PhysicalDeviceType,
    pub limits: vk::PhysicalDeviceLimits,
    pub features: vk::PhysicalDeviceFeatures,
}

impl PhysicalDeviceCandidate {
    pub fn score(&self) -> u64 {
        let mut score = 0;
        if self.device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
            score += DISCRETE_GPU_BONUS;
        }
        score + u64::from(self.limits.max_image_dimension2_d)
    }
}

/// Pick the highest scoring candidate. Ties keep the first one seen.
pub fn select_best_candidate(candidates: &[PhysicalDeviceCandidate]) -> Result<usize> {
    if candidates.is_empty() {
        return Err(RenderError::NoAdapterFound);
    }

    let mut best = None;
    let mut best_score = 0;
    for (index, candidate) in candidates.iter().enumerate() {
        let score = candidate.score();
        if score > best_score {
            best_score = score;
            best = Some(index);
        }
    }

    best.ok_or(RenderError::NoSuitableAdapter)
}

/// Core features turned on at device creation, limited to what the adapter
/// reports. Sample-rate shading is the only one requested.
pub fn enabled_core_features(supported: &vk::PhysicalDeviceFeatures) -> vk::PhysicalDeviceFeatures {
    vk::PhysicalDeviceFeatures::default().sample_rate_shading(supported.sample_rate_shading == vk::TRUE)
}

/// Resolved queue family indices. Graphics and present may coincide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilyIndices {
    pub fn is_shared(&self) -> bool {
        self.graphics == self.present
    }

    /// Distinct family indices, graphics first.
    pub fn unique(&self) -> Vec<u32> {
        if self.is_shared() {
            vec![self.graphics]
        } else {
            vec![self.graphics, self.present]
        }
    }
}

/// Find one family doing both graphics and present, or fall back to separate
/// families for each role.
pub fn resolve_queue_families<F>(
    families: &[vk::QueueFamilyProperties],
    mut supports_present: F,
) -> Result<QueueFamilyIndices>
where
    F: FnMut(u32) -> Result<bool>,
{
    let mut graphics = None;
    let mut present = None;

    for (index, family) in families.iter().enumerate() {
        let index = index as u32;
        let has_graphics = family.queue_flags.contains(vk::QueueFlags::GRAPHICS);
        let has_present = supports_present(index)?;

        if has_graphics && has_present {
            return Ok(QueueFamilyIndices {
                graphics: index,
                present: index,
            });
        }
        if has_graphics && graphics.is_none() {
            graphics = Some(index);
        }
        if has_present && present.is_none() {
            present = Some(index);
        }
    }

    match (graphics, present) {
        (Some(graphics), Some(present)) => Ok(QueueFamilyIndices { graphics, present }),
        _ => Err(RenderError::NoSuitableQueueFamily),
    }
}

/// Logical device, queues and allocator shared by every GPU resource.
pub struct DeviceContext {
    allocator: ManuallyDrop<Mutex<Allocator>>,
    upload_pool: vk::CommandPool,
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: Arc<VulkanInstance>,

    // Queue handles
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,
    pub queue_families: QueueFamilyIndices,

    // Device properties (cached for performance)
    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
}

impl DeviceContext {
    /// Select an adapter, create the logical device against `surface`, then
    /// the allocator and the transient upload pool.
    pub fn new(instance: &Arc<VulkanInstance>, surface: &Surface) -> Result<Arc<Self>> {
        let physical_device = Self::select_physical_device(&instance.instance)?;
        let queue_families = Self::select_queue_family(&instance.instance, physical_device, surface)?;

        let properties = unsafe { instance.instance.get_physical_device_properties(physical_device) };
        let memory_properties = unsafe {
            instance
                .instance
                .get_physical_device_memory_properties(physical_device)
        };

        log::info!(
            "Selected GPU: {}",
            properties
                .device_name_as_c_str()
                .map(CStr::to_string_lossy)
                .unwrap_or_default()
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );
        log::info!(
            "Queue families: graphics={} present={}",
            queue_families.graphics,
            queue_families.present
        );

        let device = Self::create_logical_device(&instance.instance, physical_device, queue_families)?;
        let graphics_queue = unsafe { device.get_device_queue(queue_families.graphics, 0) };
        let present_queue = unsafe { device.get_device_queue(queue_families.present, 0) };

        let allocator = match Self::create_allocator(&instance.instance, physical_device, &device) {
            Ok(allocator) => allocator,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                return Err(e);
            }
        };

        // TRANSIENT: upload command buffers live for a single submission
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_families.graphics)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        let upload_pool = match unsafe { device.create_command_pool(&pool_info, None) } {
            Ok(pool) => pool,
            Err(e) => {
                drop(allocator);
                unsafe { device.destroy_device(None) };
                return Err(e.into());
            }
        };

        Ok(Arc::new(Self {
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            upload_pool,
            device,
            physical_device,
            instance: Arc::clone(instance),
            graphics_queue,
            present_queue,
            queue_families,
            properties,
            memory_properties,
        }))
    }

    fn select_physical_device(instance: &ash::Instance) -> Result<vk::PhysicalDevice> {
        let devices = unsafe { instance.enumerate_physical_devices() }?;

        let candidates: Vec<PhysicalDeviceCandidate> = devices
            .iter()
            .map(|&device| {
                let props = unsafe { instance.get_physical_device_properties(device) };
                let features = unsafe { instance.get_physical_device_features(device) };
                PhysicalDeviceCandidate {
                    device_type: props.device_type,
                    limits: props.limits,
                    features,
                }
            })
            .collect();

        let best = select_best_candidate(&candidates)?;
        log::debug!(
            "Adapter {} of {} won with score {}",
            best,
            candidates.len(),
            candidates[best].score()
        );
        Ok(devices[best])
    }

    fn select_queue_family(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        surface: &Surface,
    ) -> Result<QueueFamilyIndices> {
        let families = unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
        resolve_queue_families(&families, |index| surface.supports_present(physical_device, index))
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        queue_families: QueueFamilyIndices,
    ) -> Result<ash::Device> {
        let queue_priorities = [1.0];
        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = queue_families
            .unique()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
            })
            .collect();

        let extensions: Vec<*const c_char> = DEVICE_EXTENSIONS.iter().map(|ext| ext.as_ptr()).collect();

        let mut extended_dynamic_state =
            vk::PhysicalDeviceExtendedDynamicStateFeaturesEXT::default().extended_dynamic_state(true);
        let mut vulkan11 = vk::PhysicalDeviceVulkan11Features::default().shader_draw_parameters(true);
        let mut vulkan13 = vk::PhysicalDeviceVulkan13Features::default()
            .dynamic_rendering(true)
            .synchronization2(true);
        let supported = unsafe { instance.get_physical_device_features(physical_device) };
        let base_features = enabled_core_features(&supported);
        if base_features.sample_rate_shading == vk::FALSE {
            log::warn!("Adapter lacks sampleRateShading, leaving it disabled");
        }

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&base_features)
            .push_next(&mut vulkan13)
            .push_next(&mut vulkan11)
            .push_next(&mut extended_dynamic_state);

        unsafe { instance.create_device(physical_device, &create_info, None) }
            .map_err(RenderError::DeviceCreationFailed)
    }

    fn create_allocator(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: &ash::Device,
    ) -> Result<Allocator> {
        Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_leaks_on_shutdown: true,
                ..Default::default()
            },
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| RenderError::AllocationFailed(e.to_string()))
    }

    /// Exclusive access to the general-purpose allocator.
    pub fn allocator(&self) -> MutexGuard<'_, Allocator> {
        self.allocator.lock()
    }

    /// Allocate a primary command buffer from the transient pool and begin it.
    /// The caller records into it and hands it to [`end_one_shot`](Self::end_one_shot).
    pub fn begin_one_shot(&self) -> Result<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.upload_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cmd = unsafe { self.device.allocate_command_buffers(&alloc_info) }?[0];

        let begin_info =
            vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        if let Err(e) = unsafe { self.device.begin_command_buffer(cmd, &begin_info) } {
            unsafe { self.device.free_command_buffers(self.upload_pool, &[cmd]) };
            return Err(e.into());
        }

        Ok(cmd)
    }

    /// Submit a one-shot buffer and block until the graphics queue is idle.
    ///
    /// Init-time only: this stalls the calling thread on the GPU.
    pub fn end_one_shot(&self, cmd: vk::CommandBuffer) -> Result<()> {
        let result = unsafe {
            self.device.end_command_buffer(cmd).and_then(|()| {
                let command_buffers = [cmd];
                let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);
                self.device
                    .queue_submit(self.graphics_queue, &[submit_info], vk::Fence::null())?;
                self.device.queue_wait_idle(self.graphics_queue)
            })
        };

        unsafe { self.device.free_command_buffers(self.upload_pool, &[cmd]) };
        result.map_err(Into::into)
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }?;
        Ok(())
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        let _ = self.wait_idle();

        unsafe {
            self.device.destroy_command_pool(self.upload_pool, None);
            // Allocator must release its memory blocks before the device goes away
            ManuallyDrop::drop(&mut self.allocator);
            self.device.destroy_device(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(device_type: vk::PhysicalDeviceType, max_dim: u32) -> PhysicalDeviceCandidate {
        PhysicalDeviceCandidate {
            device_type,
            limits: vk::PhysicalDeviceLimits {
                max_image_dimension2_d: max_dim,
                ..Default::default()
            },
            features: vk::PhysicalDeviceFeatures::default(),
        }
    }

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn empty_adapter_list_is_no_adapter_found() {
        assert!(matches!(select_best_candidate(&[]), Err(RenderError::NoAdapterFound)));
    }

    #[test]
    fn discrete_gpu_beats_larger_integrated_limits() {
        let candidates = [
            candidate(vk::PhysicalDeviceType::INTEGRATED_GPU, 16384),
            candidate(vk::PhysicalDeviceType::DISCRETE_GPU, 8192),
        ];
        assert_eq!(select_best_candidate(&candidates).unwrap(), 1);
    }

    #[test]
    fn discrete_gpu_wins_even_against_the_largest_limit() {
        let candidates = [
            candidate(vk::PhysicalDeviceType::INTEGRATED_GPU, u32::MAX),
            candidate(vk::PhysicalDeviceType::DISCRETE_GPU, 1),
        ];
        assert_eq!(select_best_candidate(&candidates).unwrap(), 1);
        assert!(candidates[1].score() > candidates[0].score());
    }

    #[test]
    fn sample_rate_shading_follows_adapter_support() {
        let supported = vk::PhysicalDeviceFeatures {
            sample_rate_shading: vk::TRUE,
            geometry_shader: vk::TRUE,
            ..Default::default()
        };
        let enabled = enabled_core_features(&supported);
        assert_eq!(enabled.sample_rate_shading, vk::TRUE);
        assert_eq!(enabled.geometry_shader, vk::FALSE);

        let enabled = enabled_core_features(&vk::PhysicalDeviceFeatures::default());
        assert_eq!(enabled.sample_rate_shading, vk::FALSE);
    }

    #[test]
    fn image_dimension_breaks_ties_between_classes() {
        let candidates = [
            candidate(vk::PhysicalDeviceType::INTEGRATED_GPU, 4096),
            candidate(vk::PhysicalDeviceType::VIRTUAL_GPU, 8192),
        ];
        assert_eq!(select_best_candidate(&candidates).unwrap(), 1);
    }

    #[test]
    fn equal_scores_keep_first_seen() {
        let candidates = [
            candidate(vk::PhysicalDeviceType::DISCRETE_GPU, 16384),
            candidate(vk::PhysicalDeviceType::DISCRETE_GPU, 16384),
        ];
        assert_eq!(select_best_candidate(&candidates).unwrap(), 0);
    }

    #[test]
    fn zero_scoring_adapters_are_unsuitable() {
        let candidates = [candidate(vk::PhysicalDeviceType::CPU, 0)];
        assert!(matches!(
            select_best_candidate(&candidates),
            Err(RenderError::NoSuitableAdapter)
        ));
    }

    #[test]
    fn prefers_family_with_both_roles() {
        let families = [
            family(vk::QueueFlags::GRAPHICS),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
        ];
        let indices = resolve_queue_families(&families, |i| Ok(i == 1)).unwrap();
        assert_eq!(indices, QueueFamilyIndices { graphics: 1, present: 1 });
        assert!(indices.is_shared());
        assert_eq!(indices.unique(), vec![1]);
    }

    #[test]
    fn falls_back_to_separate_families() {
        let families = [family(vk::QueueFlags::GRAPHICS), family(vk::QueueFlags::TRANSFER)];
        let indices = resolve_queue_families(&families, |i| Ok(i == 1)).unwrap();
        assert_eq!(indices, QueueFamilyIndices { graphics: 0, present: 1 });
        assert_eq!(indices.unique(), vec![0, 1]);
    }

    #[test]
    fn unresolved_present_is_fatal() {
        let families = [family(vk::QueueFlags::GRAPHICS)];
        let result = resolve_queue_families(&families, |_| Ok(false));
        assert!(matches!(result, Err(RenderError::NoSuitableQueueFamily)));
    }

    #[test]
    fn unresolved_graphics_is_fatal() {
        let families = [family(vk::QueueFlags::COMPUTE)];
        let result = resolve_queue_families(&families, |_| Ok(true));
        assert!(matches!(result, Err(RenderError::NoSuitableQueueFamily)));
    }

    #[test]
    fn present_query_errors_propagate() {
        let families = [family(vk::QueueFlags::GRAPHICS)];
        let result = resolve_queue_families(&families, |_| Err(vk::Result::ERROR_SURFACE_LOST_KHR.into()));
        assert!(matches!(
            result,
            Err(RenderError::Vulkan(vk::Result::ERROR_SURFACE_LOST_KHR))
        ));
    }
}
