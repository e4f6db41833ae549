//! GPU memory management using gpu-allocator.

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::error::{RtError, RtResult};

use super::VulkanContext;

/// Buffer with its memory and device address.
pub struct Buffer {
    pub handle: vk::Buffer,
    pub allocation: Option<Allocation>,
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub device_address: vk::DeviceAddress,
}

impl Buffer {
    /// Copy `data` into host-visible memory at `offset`.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> RtResult<()> {
        let size = self.size;
        let mapped = self
            .allocation
            .as_mut()
            .and_then(Allocation::mapped_slice_mut)
            .ok_or_else(|| RtError::invariant("write to a buffer that is not host visible"))?;
        let start = offset as usize;
        let end = start + data.len();
        if end as u64 > size || end > mapped.len() {
            return Err(RtError::invariant(format!(
                "write of {} bytes at {offset} overflows a {size} byte buffer",
                data.len()
            )));
        }
        mapped[start..end].copy_from_slice(data);
        Ok(())
    }
}

/// Memory manager wrapping gpu-allocator.
pub struct MemoryManager {
    allocator: Arc<Mutex<Allocator>>,
    device: ash::Device,
}

impl MemoryManager {
    pub fn new(ctx: &VulkanContext) -> RtResult<Self> {
        let mut debug_settings = gpu_allocator::AllocatorDebugSettings::default();
        debug_settings.log_memory_information = cfg!(debug_assertions);
        debug_settings.log_leaks_on_shutdown = true;

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: ctx.instance.clone(),
            device: ctx.device.clone(),
            physical_device: ctx.physical_device,
            debug_settings,
            buffer_device_address: true,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| RtError::Allocation { what: "allocator".into(), reason: e.to_string() })?;

        Ok(Self { allocator: Arc::new(Mutex::new(allocator)), device: ctx.device.clone() })
    }

    /// Create a buffer with a device address, aligned to at least `alignment`.
    ///
    /// # Safety
    /// The device must outlive the buffer.
    pub unsafe fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        alignment: u64,
        name: &str,
    ) -> RtResult<Buffer> {
        let usage = usage | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let handle = self
            .device
            .create_buffer(&buffer_info, None)
            .map_err(|e| RtError::vulkan("create buffer", e))?;

        let mut requirements = self.device.get_buffer_memory_requirements(handle);
        requirements.alignment = requirements.alignment.max(alignment);

        let allocation = match self.allocator.lock().allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                self.device.destroy_buffer(handle, None);
                return Err(RtError::Allocation { what: name.to_string(), reason: e.to_string() });
            }
        };

        if let Err(e) = self.device.bind_buffer_memory(handle, allocation.memory(), allocation.offset()) {
            self.device.destroy_buffer(handle, None);
            let _ = self.allocator.lock().free(allocation);
            return Err(RtError::vulkan("bind buffer memory", e));
        }

        let addr_info = vk::BufferDeviceAddressInfo::default().buffer(handle);
        let device_address = self.device.get_buffer_device_address(&addr_info);

        Ok(Buffer { handle, allocation: Some(allocation), size, usage, device_address })
    }

    /// # Safety
    /// The GPU must no longer use the buffer.
    pub unsafe fn destroy_buffer(&self, buffer: Buffer) {
        self.device.destroy_buffer(buffer.handle, None);
        if let Some(allocation) = buffer.allocation {
            if let Err(e) = self.allocator.lock().free(allocation) {
                log::warn!("Failed to free buffer memory: {e}");
            }
        }
    }
}
