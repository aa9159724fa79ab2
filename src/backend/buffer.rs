// Buffer utilities for vertex, index, and uniform buffers
//
// One buffer handle paired with one allocation from the device's allocator.
// Host-visible buffers are filled directly; device-local ones go through a
// staging buffer and a one-shot copy.

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

use super::device::DeviceContext;
use super::error::{RenderError, Result};

/// Lowest memory type index allowed by `type_filter` whose property flags
/// contain all of `properties`.
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
) -> Result<u32> {
    let count = memory_properties.memory_type_count as usize;
    memory_properties.memory_types[..count]
        .iter()
        .enumerate()
        .find(|(index, memory_type)| {
            type_filter & (1 << index) != 0 && memory_type.property_flags.contains(properties)
        })
        .map(|(index, _)| index as u32)
        .ok_or(RenderError::NoSuitableMemoryType {
            type_filter,
            properties,
        })
}

/// Where a buffer's bytes live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryUsage {
    /// Mapped and coherent; written by the CPU with [`GpuBuffer::upload`].
    HostVisible,
    /// Fastest for the GPU, unreachable from the CPU.
    DeviceLocal,
}

impl MemoryUsage {
    pub fn required_properties(self) -> vk::MemoryPropertyFlags {
        match self {
            Self::HostVisible => vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            Self::DeviceLocal => vk::MemoryPropertyFlags::DEVICE_LOCAL,
        }
    }

    /// Whether memory with `flags` can back a buffer of this kind.
    pub fn is_satisfied_by(self, flags: vk::MemoryPropertyFlags) -> bool {
        flags.contains(self.required_properties())
    }

    fn location(self) -> MemoryLocation {
        match self {
            Self::HostVisible => MemoryLocation::CpuToGpu,
            Self::DeviceLocal => MemoryLocation::GpuOnly,
        }
    }
}

pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    allocation: Option<Allocation>,
    size: vk::DeviceSize,
    memory_properties: vk::MemoryPropertyFlags,
    device: Arc<DeviceContext>,
}

impl GpuBuffer {
    pub fn new(
        device: &Arc<DeviceContext>,
        name: &str,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        memory: MemoryUsage,
    ) -> Result<Self> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.device.create_buffer(&buffer_info, None) }
            .map_err(|e| RenderError::AllocationFailed(format!("{name}: {e}")))?;

        match Self::allocate_and_bind(device, name, buffer, memory) {
            Ok(allocation) => {
                let memory_properties = allocation.memory_properties();
                log::debug!(
                    "Buffer '{}': {} bytes, {:?}, bound to {:?}",
                    name,
                    size,
                    memory,
                    memory_properties
                );
                Ok(Self {
                    buffer,
                    allocation: Some(allocation),
                    size,
                    memory_properties,
                    device: Arc::clone(device),
                })
            }
            Err(e) => {
                unsafe { device.device.destroy_buffer(buffer, None) };
                Err(e)
            }
        }
    }

    fn allocate_and_bind(
        device: &DeviceContext,
        name: &str,
        buffer: vk::Buffer,
        memory: MemoryUsage,
    ) -> Result<Allocation> {
        let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };

        // Fail with a precise error before the allocator gives a vague one.
        // The allocator still picks its own type, possibly a different one.
        find_memory_type(
            &device.memory_properties,
            requirements.memory_type_bits,
            memory.required_properties(),
        )?;

        let mut allocator = device.allocator();
        let allocation = allocator
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location: memory.location(),
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| RenderError::AllocationFailed(format!("{name}: {e}")))?;

        let bound = if memory.is_satisfied_by(allocation.memory_properties()) {
            unsafe {
                device
                    .device
                    .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
            }
            .map_err(|e| format!("{name}: bind failed: {e}"))
        } else {
            Err(format!(
                "{name}: allocator returned {:?} memory for {:?}",
                allocation.memory_properties(),
                memory
            ))
        };
        if let Err(message) = bound {
            if let Err(e) = allocator.free(allocation) {
                log::error!("Failed to free buffer allocation: {}", e);
            }
            return Err(RenderError::AllocationFailed(message));
        }

        Ok(allocation)
    }

    /// Host-visible buffer already holding `data`.
    pub fn with_data<T: bytemuck::Pod>(
        device: &Arc<DeviceContext>,
        name: &str,
        usage: vk::BufferUsageFlags,
        data: &[T],
    ) -> Result<Self> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let buffer = Self::new(device, name, bytes.len() as vk::DeviceSize, usage, MemoryUsage::HostVisible)?;
        buffer.upload(bytes)?;
        Ok(buffer)
    }

    /// Device-local buffer filled through a temporary staging buffer.
    ///
    /// Blocks until the copy has finished; init-time only.
    pub fn device_local_with_data<T: bytemuck::Pod>(
        device: &Arc<DeviceContext>,
        name: &str,
        usage: vk::BufferUsageFlags,
        data: &[T],
    ) -> Result<Self> {
        let staging = Self::with_data(
            device,
            &format!("{name} (staging)"),
            vk::BufferUsageFlags::TRANSFER_SRC,
            data,
        )?;

        let buffer = Self::new(
            device,
            name,
            staging.size,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryUsage::DeviceLocal,
        )?;
        Self::copy(device, &staging, &buffer, staging.size)?;

        Ok(buffer)
    }

    /// Copy `data` into the start of a host-visible buffer.
    pub fn upload(&self, data: &[u8]) -> Result<()> {
        if data.len() as vk::DeviceSize > self.size {
            return Err(RenderError::AllocationFailed(format!(
                "upload of {} bytes into a {} byte buffer",
                data.len(),
                self.size
            )));
        }

        let mapped = self
            .allocation
            .as_ref()
            .and_then(Allocation::mapped_ptr)
            .ok_or_else(|| RenderError::AllocationFailed("upload into unmapped buffer".into()))?;

        // Allocation is persistently mapped and coherent: no flush needed
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), mapped.as_ptr().cast::<u8>(), data.len());
        }
        Ok(())
    }

    pub fn upload_slice<T: bytemuck::Pod>(&self, data: &[T]) -> Result<()> {
        self.upload(bytemuck::cast_slice(data))
    }

    /// Copy `size` bytes from the start of `src` to the start of `dst` and
    /// wait for it to complete.
    pub fn copy(device: &DeviceContext, src: &GpuBuffer, dst: &GpuBuffer, size: vk::DeviceSize) -> Result<()> {
        let cmd = device.begin_one_shot()?;

        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size,
        };
        unsafe { device.device.cmd_copy_buffer(cmd, src.buffer, dst.buffer, &[region]) };

        device.end_one_shot(cmd)
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Property flags of the memory the allocator actually bound.
    pub fn memory_properties(&self) -> vk::MemoryPropertyFlags {
        self.memory_properties
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = self.device.allocator().free(allocation) {
                log::error!("Failed to free buffer allocation: {}", e);
            }
        }
        unsafe { self.device.device.destroy_buffer(self.buffer, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::error::ErrorKind;

    fn memory_table(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut properties = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (slot, &flags) in properties.memory_types.iter_mut().zip(types) {
            slot.property_flags = flags;
        }
        properties
    }

    const DEVICE_LOCAL: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::DEVICE_LOCAL;

    fn host() -> vk::MemoryPropertyFlags {
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
    }

    #[test]
    fn picks_lowest_matching_index() {
        let table = memory_table(&[DEVICE_LOCAL, host(), host() | vk::MemoryPropertyFlags::HOST_CACHED]);
        assert_eq!(find_memory_type(&table, 0b111, host()).unwrap(), 1);
    }

    #[test]
    fn respects_type_filter() {
        let table = memory_table(&[host(), DEVICE_LOCAL, host()]);
        assert_eq!(find_memory_type(&table, 0b110, host()).unwrap(), 2);
    }

    #[test]
    fn properties_must_be_a_superset() {
        let table = memory_table(&[vk::MemoryPropertyFlags::HOST_VISIBLE, host() | DEVICE_LOCAL]);
        assert_eq!(find_memory_type(&table, 0b11, host()).unwrap(), 1);
    }

    #[test]
    fn ignores_types_past_the_reported_count() {
        let mut table = memory_table(&[DEVICE_LOCAL]);
        table.memory_types[1].property_flags = host();
        assert!(matches!(
            find_memory_type(&table, 0b11, host()),
            Err(RenderError::NoSuitableMemoryType { type_filter: 0b11, .. })
        ));
    }

    #[test]
    fn no_match_is_memory_type_error() {
        let table = memory_table(&[DEVICE_LOCAL, DEVICE_LOCAL]);
        let err = find_memory_type(&table, 0b11, host()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MemoryType);
    }

    #[test]
    fn device_local_host_memory_satisfies_host_visible() {
        // What the allocator prefers for CpuToGpu on most discrete cards
        assert!(MemoryUsage::HostVisible.is_satisfied_by(host() | DEVICE_LOCAL));
        assert!(!MemoryUsage::HostVisible.is_satisfied_by(vk::MemoryPropertyFlags::HOST_VISIBLE));
        assert!(!MemoryUsage::DeviceLocal.is_satisfied_by(host()));
    }

    #[test]
    fn usage_maps_to_property_flags() {
        assert!(MemoryUsage::HostVisible
            .required_properties()
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT));
        assert_eq!(MemoryUsage::DeviceLocal.required_properties(), DEVICE_LOCAL);
    }
}
