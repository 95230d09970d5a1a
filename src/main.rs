// =============================================================================
// VULKAN TRIANGLE
// =============================================================================
//
// Opens a window, sets up a Vulkan swapchain and draws one colored
// triangle every frame.
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  winit event loop (App)                                         │
// │    └── Renderer                                                 │
// │          ├── VulkanDevice (instance, surface, device, queue)    │
// │          ├── TrianglePipeline (render pass + pipeline)          │
// │          ├── Swapchain + framebuffers + command buffers         │
// │          └── Frame sync (fences, semaphores)                    │
// └─────────────────────────────────────────────────────────────────┘
//
// =============================================================================

mod backend;
mod config;
mod fps;
mod geometry;
mod renderer;

use anyhow::Result;
use config::Config;
use fps::FpsCounter;
use renderer::Renderer;
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    window::{Fullscreen, Window, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    let (config, outcome) = Config::load();

    init_logging(&config);
    outcome.log(&config);
    log::info!("Starting Vulkan triangle");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    // Any fatal error ends the event loop and the process exits non-zero
    match app.fatal.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Configured level, overridable with RUST_LOG
fn init_logging(config: &Config) {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(config.log_level());
    builder.parse_default_env();
    builder.init();
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Window plus renderer.
///
/// Field order matters for Drop: the renderer (and its surface) must go
/// before the window it was created for.
struct App {
    config: Config,
    renderer: Option<Renderer>,
    window: Option<Arc<Window>>,
    is_fullscreen: bool,

    quit_key: Option<KeyCode>,
    fullscreen_key: Option<KeyCode>,

    fps: FpsCounter,
    /// First fatal error, returned from main
    fatal: Option<anyhow::Error>,
}

impl App {
    fn new(config: Config) -> Self {
        let quit_key = config.quit_key();
        if quit_key.is_none() {
            log::warn!(
                "Unknown quit key '{}', quitting only by closing the window",
                config.controls.quit_key
            );
        }
        let fullscreen_key = config.fullscreen_key();
        if fullscreen_key.is_none() {
            log::warn!("Unknown fullscreen key '{}'", config.controls.fullscreen_key);
        }

        Self {
            is_fullscreen: config.window.fullscreen,
            config,
            renderer: None,
            window: None,
            quit_key,
            fullscreen_key,
            fps: FpsCounter::new(Instant::now()),
            fatal: None,
        }
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        log::error!("Fatal error, shutting down");
        if self.fatal.is_none() {
            self.fatal = Some(error);
        }
        event_loop.exit();
    }

    fn create_window(&self, event_loop: &ActiveEventLoop) -> Result<Arc<Window>> {
        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        if self.config.window.fullscreen {
            window_attributes =
                window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        Ok(Arc::new(event_loop.create_window(window_attributes)?))
    }

    fn toggle_fullscreen(&mut self) {
        let Some(ref window) = self.window else {
            return;
        };

        self.is_fullscreen = !self.is_fullscreen;
        if self.is_fullscreen {
            window.set_fullscreen(Some(Fullscreen::Borderless(None)));
            log::info!("Entered fullscreen mode");
        } else {
            window.set_fullscreen(None);
            log::info!("Exited fullscreen mode");
        }

        if let Some(ref mut renderer) = self.renderer {
            renderer.request_recreate();
        }
    }

    fn redraw(&mut self, event_loop: &ActiveEventLoop) {
        let (Some(window), Some(renderer)) = (self.window.as_ref(), self.renderer.as_mut()) else {
            return;
        };

        let size = window.inner_size();
        match renderer.render_frame(size.width, size.height) {
            Ok(true) => self.update_fps(),
            Ok(false) => {}
            Err(e) => self.fail(event_loop, e.context("Render error")),
        }
    }

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        let Some(sample) = self.fps.tick(Instant::now()) else {
            return;
        };

        if let Some(ref window) = self.window {
            let mode = if self.is_fullscreen { "fullscreen" } else { "windowed" };
            window.set_title(&format!(
                "{} - {:.0} FPS ({:.2}ms) [{}]",
                self.config.window.title, sample.fps, sample.frame_ms, mode
            ));
        }
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let window = match self.create_window(event_loop) {
            Ok(window) => window,
            Err(e) => {
                self.fail(event_loop, e.context("Failed to create window"));
                return;
            }
        };

        let size = window.inner_size();
        match Renderer::new(&self.config, window.as_ref(), size.width, size.height) {
            Ok(renderer) => self.renderer = Some(renderer),
            Err(e) => {
                self.fail(event_loop, e.context("Failed to initialize Vulkan"));
                return;
            }
        }

        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                if let Some(ref renderer) = self.renderer {
                    if let Err(e) = renderer.wait_idle() {
                        log::error!("{:#}", e);
                    }
                }
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                if let Some(ref mut renderer) = self.renderer {
                    renderer.handle_resize(size.width, size.height);
                }
            }

            WindowEvent::RedrawRequested => self.redraw(event_loop),

            WindowEvent::KeyboardInput { event, .. } => {
                if !event.state.is_pressed() || event.repeat {
                    return;
                }
                let PhysicalKey::Code(key) = event.physical_key else {
                    return;
                };

                if Some(key) == self.quit_key {
                    log::info!("{:?} pressed, exiting...", key);
                    event_loop.exit();
                } else if Some(key) == self.fullscreen_key {
                    self.toggle_fullscreen();
                }
            }

            _ => {}
        }
    }

    /// Request continuous redraws; the present mode paces the loop
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}

impl Drop for App {
    fn drop(&mut self) {
        // Surface before window
        self.renderer = None;
        self.window = None;
        log::info!("Cleanup complete");
    }
}
