// Buffer utilities for vertex and index data
//
// Memory comes from the device's gpu-allocator instance.

use anyhow::{Context, Result};
use ash::vk;
use bytemuck::Pod;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use super::{commands, VulkanDevice};

/// A buffer and the allocation backing it. Call `destroy` before the device goes away.
pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    pub size: vk::DeviceSize,
    allocation: Option<Allocation>,
}

impl GpuBuffer {
    pub fn new(
        device: &VulkanDevice,
        name: &str,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> Result<Self> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.device.create_buffer(&buffer_info, None) }
            .with_context(|| format!("Failed to create buffer '{}'", name))?;

        let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };

        let allocation = device.allocator().lock().allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });

        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.device.destroy_buffer(buffer, None) };
                return Err(e).with_context(|| format!("Failed to allocate memory for '{}'", name));
            }
        };

        let mut gpu_buffer = Self {
            buffer,
            size,
            allocation: Some(allocation),
        };

        let bind = unsafe {
            device.device.bind_buffer_memory(
                buffer,
                gpu_buffer.memory(),
                gpu_buffer.memory_offset(),
            )
        };

        if let Err(e) = bind {
            gpu_buffer.destroy(device);
            return Err(e).with_context(|| format!("Failed to bind memory for '{}'", name));
        }

        Ok(gpu_buffer)
    }

    /// Create a host-visible buffer holding `data`
    pub fn with_data<T: Pod>(
        device: &VulkanDevice,
        name: &str,
        usage: vk::BufferUsageFlags,
        data: &[T],
    ) -> Result<Self> {
        let bytes: &[u8] = bytemuck::cast_slice(data);

        let mut buffer = Self::new(
            device,
            name,
            bytes.len() as vk::DeviceSize,
            usage,
            MemoryLocation::CpuToGpu,
        )?;

        if let Err(e) = buffer.write(bytes) {
            buffer.destroy(device);
            return Err(e);
        }

        Ok(buffer)
    }

    /// Create a GPU-only buffer holding `data`, uploaded through a staging buffer
    pub fn device_local_with_data<T: Pod>(
        device: &VulkanDevice,
        pool: vk::CommandPool,
        name: &str,
        usage: vk::BufferUsageFlags,
        data: &[T],
    ) -> Result<Self> {
        let mut staging = Self::with_data(
            device,
            &format!("{} (staging)", name),
            vk::BufferUsageFlags::TRANSFER_SRC,
            data,
        )?;

        let result = Self::new(
            device,
            name,
            staging.size,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuOnly,
        )
        .and_then(|mut buffer| match buffer.copy_from(device, pool, &staging) {
            Ok(()) => Ok(buffer),
            Err(e) => {
                buffer.destroy(device);
                Err(e)
            }
        });

        staging.destroy(device);
        result
    }

    fn copy_from(&self, device: &VulkanDevice, pool: vk::CommandPool, src: &GpuBuffer) -> Result<()> {
        let cmd = commands::begin_one_time(device, pool)?;

        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size: src.size.min(self.size),
        };

        unsafe {
            device
                .device
                .cmd_copy_buffer(cmd, src.buffer, self.buffer, &[region]);
        }

        commands::flush_one_time(device, pool, cmd)
    }

    /// Copy bytes into a host-visible buffer
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let mapped = self
            .allocation
            .as_mut()
            .and_then(|allocation| allocation.mapped_slice_mut())
            .context("Buffer memory is not host visible")?;

        anyhow::ensure!(
            bytes.len() <= mapped.len(),
            "Write of {} bytes exceeds buffer size {}",
            bytes.len(),
            mapped.len()
        );

        mapped[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn memory(&self) -> vk::DeviceMemory {
        self.allocation
            .as_ref()
            .map_or(vk::DeviceMemory::null(), |allocation| unsafe { allocation.memory() })
    }

    fn memory_offset(&self) -> vk::DeviceSize {
        self.allocation.as_ref().map_or(0, |allocation| allocation.offset())
    }

    pub fn destroy(&mut self, device: &VulkanDevice) {
        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = device.allocator().lock().free(allocation) {
                log::error!("Failed to free buffer memory: {}", e);
            }
        }

        if self.buffer != vk::Buffer::null() {
            unsafe { device.device.destroy_buffer(self.buffer, None) };
            self.buffer = vk::Buffer::null();
        }
    }
}
