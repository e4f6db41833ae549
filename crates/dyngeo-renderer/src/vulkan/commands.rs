//! Per-frame command buffers and fences.
//!
//! Each frame in flight owns a pool, one primary command buffer and a fence.
//! Beginning a frame waits for the fence of the previous use of that slot,
//! so the CPU runs at most `frames` submissions ahead of the GPU.

use ash::vk;

use crate::error::{RtError, RtResult};

use super::VulkanContext;

struct FrameCommands {
    pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    fence: vk::Fence,
}

pub struct CommandRing {
    frames: Vec<FrameCommands>,
    current: usize,
    device: ash::Device,
}

impl CommandRing {
    pub fn new(ctx: &VulkanContext, frames: usize) -> RtResult<Self> {
        let mut ring = Self { frames: Vec::with_capacity(frames), current: 0, device: ctx.device.clone() };
        for _ in 0..frames {
            let frame = unsafe { ring.create_frame(ctx.queue_family) };
            match frame {
                Ok(frame) => ring.frames.push(frame),
                Err(e) => {
                    unsafe { ring.destroy() };
                    return Err(e);
                }
            }
        }
        Ok(ring)
    }

    unsafe fn create_frame(&self, queue_family: u32) -> RtResult<FrameCommands> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let pool = self
            .device
            .create_command_pool(&pool_info, None)
            .map_err(|e| RtError::vulkan("create command pool", e))?;

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffer = match self.device.allocate_command_buffers(&alloc_info) {
            Ok(buffers) => buffers[0],
            Err(e) => {
                self.device.destroy_command_pool(pool, None);
                return Err(RtError::vulkan("allocate command buffer", e));
            }
        };

        // Signalled so the first wait on this slot returns immediately.
        let fence_info = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);
        let fence = match self.device.create_fence(&fence_info, None) {
            Ok(fence) => fence,
            Err(e) => {
                self.device.destroy_command_pool(pool, None);
                return Err(RtError::vulkan("create fence", e));
            }
        };

        Ok(FrameCommands { pool, command_buffer, fence })
    }

    /// Wait for the current slot to retire and start recording into it.
    /// Returns the slot index with its command buffer.
    pub fn begin(&self) -> RtResult<(usize, vk::CommandBuffer)> {
        let frame = &self.frames[self.current];
        unsafe {
            self.device
                .wait_for_fences(&[frame.fence], true, u64::MAX)
                .map_err(|e| RtError::vulkan("wait for frame fence", e))?;
            self.device
                .reset_command_buffer(frame.command_buffer, vk::CommandBufferResetFlags::empty())
                .map_err(|e| RtError::vulkan("reset command buffer", e))?;

            let begin_info =
                vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            self.device
                .begin_command_buffer(frame.command_buffer, &begin_info)
                .map_err(|e| RtError::vulkan("begin command buffer", e))?;
        }
        Ok((self.current, frame.command_buffer))
    }

    /// End `command_buffer`, submit it on `queue` and advance to the next slot.
    pub fn submit(&mut self, queue: vk::Queue, command_buffer: vk::CommandBuffer) -> RtResult<()> {
        let frame = &self.frames[self.current];
        if frame.command_buffer != command_buffer {
            return Err(RtError::invariant("submitted command buffer is not the one being recorded"));
        }
        unsafe {
            self.device
                .end_command_buffer(command_buffer)
                .map_err(|e| RtError::vulkan("end command buffer", e))?;
            self.device
                .reset_fences(&[frame.fence])
                .map_err(|e| RtError::vulkan("reset frame fence", e))?;

            let command_buffers = [command_buffer];
            let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);
            self.device
                .queue_submit(queue, &[submit_info], frame.fence)
                .map_err(|e| RtError::vulkan("queue submit", e))?;
        }
        self.current = (self.current + 1) % self.frames.len();
        Ok(())
    }

    /// # Safety
    /// The GPU must be idle.
    pub unsafe fn destroy(&mut self) {
        for frame in self.frames.drain(..) {
            self.device.destroy_fence(frame.fence, None);
            self.device.destroy_command_pool(frame.pool, None);
        }
    }
}

/// Make acceleration structure writes visible to the next build.
///
/// # Safety
/// `command_buffer` must be recording.
pub unsafe fn acceleration_structure_barrier(device: &ash::Device, command_buffer: vk::CommandBuffer) {
    let barrier = vk::MemoryBarrier2::default()
        .src_stage_mask(vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR)
        .src_access_mask(vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR)
        .dst_stage_mask(vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR)
        .dst_access_mask(
            vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR | vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR,
        );
    let barriers = [barrier];
    let dependency = vk::DependencyInfo::default().memory_barriers(&barriers);
    device.cmd_pipeline_barrier2(command_buffer, &dependency);
}
