// Command pool and command buffer helpers
//
// One-time buffers are used for setup work like buffer uploads.
// Draw buffers are pre-recorded once per swapchain image.

use anyhow::{Context, Result};
use ash::vk;
use super::VulkanDevice;

pub fn create_command_pool(device: &VulkanDevice) -> Result<vk::CommandPool> {
    let pool_info = vk::CommandPoolCreateInfo::builder()
        .queue_family_index(device.queue_family)
        .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

    unsafe { device.device.create_command_pool(&pool_info, None) }
        .context("Failed to create command pool")
}

pub fn allocate_command_buffers(
    device: &VulkanDevice,
    pool: vk::CommandPool,
    count: u32,
) -> Result<Vec<vk::CommandBuffer>> {
    let alloc_info = vk::CommandBufferAllocateInfo::builder()
        .command_pool(pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(count);

    unsafe { device.device.allocate_command_buffers(&alloc_info) }
        .context("Failed to allocate command buffers")
}

/// Allocate a command buffer and start recording a one-shot submission
pub fn begin_one_time(device: &VulkanDevice, pool: vk::CommandPool) -> Result<vk::CommandBuffer> {
    let cmd = allocate_command_buffers(device, pool, 1)?[0];

    let begin_info = vk::CommandBufferBeginInfo::builder()
        .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

    if let Err(e) = unsafe { device.device.begin_command_buffer(cmd, &begin_info) } {
        unsafe { device.device.free_command_buffers(pool, &[cmd]) };
        return Err(e).context("Failed to begin one-time command buffer");
    }

    Ok(cmd)
}

/// End, submit and wait for a buffer from `begin_one_time`, then free it
pub fn flush_one_time(
    device: &VulkanDevice,
    pool: vk::CommandPool,
    cmd: vk::CommandBuffer,
) -> Result<()> {
    let result = submit_and_wait(device, cmd);
    unsafe { device.device.free_command_buffers(pool, &[cmd]) };
    result
}

fn submit_and_wait(device: &VulkanDevice, cmd: vk::CommandBuffer) -> Result<()> {
    let command_buffers = [cmd];
    let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);

    unsafe {
        device
            .device
            .end_command_buffer(cmd)
            .context("Failed to end one-time command buffer")?;
        device
            .device
            .queue_submit(device.queue, &[submit_info.build()], vk::Fence::null())
            .context("Failed to submit one-time command buffer")?;
        device
            .device
            .queue_wait_idle(device.queue)
            .context("Failed to wait for queue idle")?;
    }

    Ok(())
}

/// Everything a pre-recorded triangle draw needs
pub struct DrawTriangle {
    pub render_pass: vk::RenderPass,
    pub pipeline: vk::Pipeline,
    pub vertex_buffer: vk::Buffer,
    pub index_buffer: vk::Buffer,
    pub index_count: u32,
    pub clear_color: [f32; 4],
}

/// Record the triangle draw into one command buffer per framebuffer
pub fn record_triangle(
    device: &ash::Device,
    command_buffers: &[vk::CommandBuffer],
    framebuffers: &[vk::Framebuffer],
    extent: vk::Extent2D,
    draw: &DrawTriangle,
) -> Result<()> {
    let clear_values = [vk::ClearValue {
        color: vk::ClearColorValue {
            float32: draw.clear_color,
        },
    }];

    let render_area = vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent,
    };

    let viewport = vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: extent.width as f32,
        height: extent.height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    };

    for (&cmd, &framebuffer) in command_buffers.iter().zip(framebuffers) {
        let begin_info = vk::CommandBufferBeginInfo::builder();

        let render_pass_info = vk::RenderPassBeginInfo::builder()
            .render_pass(draw.render_pass)
            .framebuffer(framebuffer)
            .render_area(render_area)
            .clear_values(&clear_values);

        unsafe {
            device
                .begin_command_buffer(cmd, &begin_info)
                .context("Failed to begin draw command buffer")?;

            device.cmd_begin_render_pass(cmd, &render_pass_info, vk::SubpassContents::INLINE);
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, draw.pipeline);
            device.cmd_set_viewport(cmd, 0, &[viewport]);
            device.cmd_set_scissor(cmd, 0, &[render_area]);
            device.cmd_bind_vertex_buffers(cmd, 0, &[draw.vertex_buffer], &[0]);
            device.cmd_bind_index_buffer(cmd, draw.index_buffer, 0, vk::IndexType::UINT16);
            device.cmd_draw_indexed(cmd, draw.index_count, 1, 0, 0, 0);
            device.cmd_end_render_pass(cmd);

            device
                .end_command_buffer(cmd)
                .context("Failed to end draw command buffer")?;
        }
    }

    Ok(())
}
