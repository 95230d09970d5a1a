// =============================================================================
// RENDERER - Vulkan state and the per-frame acquire/draw/present loop
// =============================================================================
//
// FRAME FLOW:
// 1. Wait for this frame slot's fence
// 2. Acquire swapchain image (out of date -> recreate, skip frame)
// 3. Wait for any other slot still rendering to that image
// 4. Submit the image's pre-recorded command buffer
// 5. Present, then advance to the next slot
//
// Swapchain-dependent objects (framebuffers, command buffers, render
// finished semaphores) are rebuilt whenever the window size changes.

use anyhow::{Context, Result};
use ash::vk;
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use std::sync::Arc;
use crate::backend::{
    commands, pipeline, shader, swapchain, sync, Acquired, FrameSlots, FrameSync, GpuBuffer,
    Swapchain, SwapchainState, TrianglePipeline, VulkanDevice,
};
use crate::config::Config;
use crate::geometry::{TRIANGLE_INDICES, TRIANGLE_VERTICES};

/// Objects tied to one swapchain, one entry per swapchain image
struct RenderTargets {
    framebuffers: Vec<vk::Framebuffer>,
    command_buffers: Vec<vk::CommandBuffer>,
    render_finished: Vec<vk::Semaphore>,
}

impl RenderTargets {
    fn destroy(&self, device: &VulkanDevice, pool: vk::CommandPool) {
        unsafe {
            if !self.command_buffers.is_empty() {
                device.device.free_command_buffers(pool, &self.command_buffers);
            }
            for &semaphore in &self.render_finished {
                device.device.destroy_semaphore(semaphore, None);
            }
        }
        pipeline::destroy_framebuffers(device, &self.framebuffers);
    }
}

/// All Vulkan resources needed to draw the triangle.
///
/// Dropping it waits for the GPU and releases everything in reverse order.
pub struct Renderer {
    device: Arc<VulkanDevice>,
    pipeline: TrianglePipeline,
    surface_format: vk::Format,
    command_pool: vk::CommandPool,
    vertex_buffer: Option<GpuBuffer>,
    index_buffer: Option<GpuBuffer>,

    swapchain: Option<Swapchain>,
    targets: Option<RenderTargets>,

    frame_sync: Vec<FrameSync>,
    slots: FrameSlots,
    wait_stages: [vk::PipelineStageFlags; 1],

    present_mode: vk::PresentModeKHR,
    clear_color: [f32; 4],

    /// Pending rebuilds and the minimized pause
    state: SwapchainState,
}

impl Renderer {
    /// Initialize Vulkan for a window of the given size.
    ///
    /// 1. Device, surface and queue
    /// 2. Render pass + pipeline from the configured SPIR-V files
    /// 3. Vertex and index buffers
    /// 4. Frame sync objects
    /// 5. Swapchain and its render targets
    pub fn new<W>(config: &Config, window: &W, width: u32, height: u32) -> Result<Self>
    where
        W: HasRawWindowHandle + HasRawDisplayHandle,
    {
        log::info!("Initializing Vulkan...");

        let enable_validation = cfg!(debug_assertions) && config.debug.validation_layers;
        let device = VulkanDevice::new(&config.window.title, window, enable_validation)?;

        let surface_format = swapchain::query_surface_format(&device)?.format;
        let pipeline = Self::create_pipeline(&device, config, surface_format)?;
        let command_pool = commands::create_command_pool(&device)?;

        // Everything created from here on is released by Drop on error
        let mut renderer = Self {
            device,
            pipeline,
            surface_format,
            command_pool,
            vertex_buffer: None,
            index_buffer: None,
            swapchain: None,
            targets: None,
            frame_sync: Vec::new(),
            slots: FrameSlots::new(config.frames_in_flight()),
            wait_stages: [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT],
            present_mode: config.present_mode(),
            clear_color: config.graphics.clear_color,
            state: SwapchainState::default(),
        };

        renderer.vertex_buffer = Some(GpuBuffer::device_local_with_data(
            &renderer.device,
            renderer.command_pool,
            "triangle vertices",
            vk::BufferUsageFlags::VERTEX_BUFFER,
            &TRIANGLE_VERTICES,
        )?);
        renderer.index_buffer = Some(GpuBuffer::device_local_with_data(
            &renderer.device,
            renderer.command_pool,
            "triangle indices",
            vk::BufferUsageFlags::INDEX_BUFFER,
            &TRIANGLE_INDICES,
        )?);

        for _ in 0..config.frames_in_flight() {
            let sync = FrameSync::new(&renderer.device)?;
            renderer.frame_sync.push(sync);
        }

        renderer.create_swapchain_resources(width, height)?;

        log::info!("Vulkan initialized successfully!");
        Ok(renderer)
    }

    fn create_pipeline(
        device: &Arc<VulkanDevice>,
        config: &Config,
        format: vk::Format,
    ) -> Result<TrianglePipeline> {
        let vert = shader::load_shader_module(device, &config.shaders.vertex)?;
        let frag = match shader::load_shader_module(device, &config.shaders.fragment) {
            Ok(frag) => frag,
            Err(e) => {
                unsafe { device.device.destroy_shader_module(vert, None) };
                return Err(e);
            }
        };

        let pipeline = TrianglePipeline::new(device.clone(), format, vert, frag);

        // Modules are only needed while the pipeline is built
        unsafe {
            device.device.destroy_shader_module(vert, None);
            device.device.destroy_shader_module(frag, None);
        }

        pipeline
    }

    /// Create swapchain, framebuffers and pre-recorded command buffers.
    ///
    /// Called at startup and again whenever the window is resized. The old
    /// swapchain is handed to the new one before being destroyed.
    fn create_swapchain_resources(&mut self, width: u32, height: u32) -> Result<()> {
        let extent = swapchain::query_extent(&self.device, width, height)?;
        if !self.state.begin_recreate(extent) {
            return Ok(());
        }

        // Nothing may still be using the objects we are about to destroy
        self.device.wait_idle()?;

        if let Some(targets) = self.targets.take() {
            targets.destroy(&self.device, self.command_pool);
        }

        let old = self.swapchain.take();
        let swapchain = Swapchain::new(
            self.device.clone(),
            self.present_mode,
            width,
            height,
            old.as_ref(),
        )?;
        drop(old);

        anyhow::ensure!(
            swapchain.format == self.surface_format,
            "Surface format changed from {:?} to {:?}",
            self.surface_format,
            swapchain.format
        );

        let targets = self.create_render_targets(&swapchain)?;
        log::info!(
            "Created {} pre-recorded command buffers",
            targets.command_buffers.len()
        );

        self.slots.reset_images(swapchain.image_count());
        self.swapchain = Some(swapchain);
        self.targets = Some(targets);
        self.state.finish_recreate();

        Ok(())
    }

    fn create_render_targets(&self, swapchain: &Swapchain) -> Result<RenderTargets> {
        let mut targets = RenderTargets {
            framebuffers: Vec::new(),
            command_buffers: Vec::new(),
            render_finished: Vec::new(),
        };

        let result = self.fill_render_targets(swapchain, &mut targets);
        if let Err(e) = result {
            targets.destroy(&self.device, self.command_pool);
            return Err(e);
        }

        Ok(targets)
    }

    fn fill_render_targets(&self, swapchain: &Swapchain, targets: &mut RenderTargets) -> Result<()> {
        let vertex_buffer = self.vertex_buffer.as_ref().context("Vertex buffer not initialized")?;
        let index_buffer = self.index_buffer.as_ref().context("Index buffer not initialized")?;

        targets.framebuffers = pipeline::create_framebuffers(
            &self.device,
            &swapchain.image_views,
            self.pipeline.render_pass,
            swapchain.extent,
        )?;

        targets.command_buffers = commands::allocate_command_buffers(
            &self.device,
            self.command_pool,
            swapchain.image_count() as u32,
        )?;

        for _ in 0..swapchain.image_count() {
            targets.render_finished.push(sync::create_semaphore(&self.device)?);
        }

        commands::record_triangle(
            &self.device.device,
            &targets.command_buffers,
            &targets.framebuffers,
            swapchain.extent,
            &commands::DrawTriangle {
                render_pass: self.pipeline.render_pass,
                pipeline: self.pipeline.pipeline,
                vertex_buffer: vertex_buffer.buffer,
                index_buffer: index_buffer.buffer,
                index_count: TRIANGLE_INDICES.len() as u32,
                clear_color: self.clear_color,
            },
        )
    }

    /// Window size changed; zero area pauses rendering
    pub fn handle_resize(&mut self, width: u32, height: u32) {
        self.state.resize(width, height);
    }

    pub fn request_recreate(&mut self) {
        self.state.request_recreate();
    }

    /// Render a single frame.
    ///
    /// Returns Ok(false) when no image was presented (minimized or stale
    /// swapchain). `width`/`height` are the current window size.
    pub fn render_frame(&mut self, width: u32, height: u32) -> Result<bool> {
        if !self.state.should_render() {
            return Ok(false);
        }

        if self.state.wants_recreate() {
            self.create_swapchain_resources(width, height)?;
            if !self.state.should_render() {
                return Ok(false);
            }
        }

        let (Some(swapchain), Some(targets)) = (self.swapchain.as_ref(), self.targets.as_ref())
        else {
            self.state.request_recreate();
            return Ok(false);
        };

        let device = &self.device.device;
        let sync = &self.frame_sync[self.slots.current()];

        // STEP 1: Wait until the GPU is done with the last frame using this slot
        unsafe { device.wait_for_fences(&[sync.in_flight_fence], true, u64::MAX) }
            .context("Failed to wait for frame fence")?;

        // STEP 2: Acquire next swapchain image
        let image_index = match swapchain.acquire_next_image(u64::MAX, sync.image_available)? {
            Acquired::Image { index, suboptimal } => {
                // Still usable this frame, rebuild before the next one
                if suboptimal {
                    self.state.request_recreate();
                }
                index
            }
            Acquired::OutOfDate => {
                self.state.request_recreate();
                return Ok(false);
            }
        };

        // STEP 3: The image's command buffer may still run for another slot
        if let Some(other) = self.slots.claim_image(image_index as usize) {
            let fence = self.frame_sync[other].in_flight_fence;
            unsafe { device.wait_for_fences(&[fence], true, u64::MAX) }
                .context("Failed to wait for image fence")?;
        }

        // STEP 4: Submit the pre-recorded commands
        let render_finished = targets.render_finished[image_index as usize];
        let wait_semaphores = [sync.image_available];
        let signal_semaphores = [render_finished];
        let command_buffers = [targets.command_buffers[image_index as usize]];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&self.wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            device
                .reset_fences(&[sync.in_flight_fence])
                .context("Failed to reset frame fence")?;
            device
                .queue_submit(self.device.queue, &[submit_info.build()], sync.in_flight_fence)
                .context("Failed to submit draw command buffer")?;
        }

        // STEP 5: Present once rendering finished
        if swapchain.present(self.device.queue, image_index, &signal_semaphores)? {
            self.state.request_recreate();
        }

        self.slots.advance();
        Ok(true)
    }

    pub fn wait_idle(&self) -> Result<()> {
        self.device.wait_idle()
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        log::info!("Cleaning up Vulkan resources...");

        if let Err(e) = self.device.wait_idle() {
            log::error!("{:#}", e);
        }

        if let Some(targets) = self.targets.take() {
            targets.destroy(&self.device, self.command_pool);
        }
        self.swapchain = None;

        for sync in &self.frame_sync {
            sync.destroy(&self.device);
        }

        for buffer in [self.vertex_buffer.take(), self.index_buffer.take()].iter_mut().flatten() {
            buffer.destroy(&self.device);
        }

        unsafe { self.device.device.destroy_command_pool(self.command_pool, None) };

        // Pipeline and device are released when the fields drop
    }
}
