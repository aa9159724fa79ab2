// =============================================================================
// ENDURA - Vulkan frame-loop demo
// =============================================================================
//
// Opens a window, builds the renderer and draws a colour quad every frame.
//
// FRAME FLOW (see backend::frame):
// 1. Wait for this frame slot's previous submission
// 2. Acquire swapchain image (rebuild if out of date)
// 3. Record + submit the frame's command buffer
// 4. Present, then rotate frame and semaphore indices
//
// =============================================================================

use anyhow::{Context, Result};
use endura::assets::AssetManager;
use endura::backend::{FrameStatus, Renderer, WindowHost};
use endura::config::Config;
use endura::window::WinitWindow;
use log::LevelFilter;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Fullscreen, Window, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    // Load configuration from config.toml
    let config = Config::load();

    init_logging(&config);
    log::info!("Starting Endura");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );

    let event_loop = EventLoop::new().context("Failed to create event loop")?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    match app.exit_error.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// `debug.log_level` sets the default; RUST_LOG still wins.
fn init_logging(config: &Config) {
    let level = LevelFilter::from_str(&config.debug.log_level).unwrap_or(LevelFilter::Info);

    env_logger::Builder::new()
        .filter_level(level)
        .parse_env(env_logger::Env::default())
        .init();
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

struct App {
    config: Config,
    assets: AssetManager,

    // Dropped before the window it renders into
    renderer: Option<Renderer>,
    window: Option<WinitWindow>,

    // Window state
    is_minimized: bool,
    is_fullscreen: bool,

    // FPS tracking
    frame_count: u32,
    last_frame_time: Instant,
    last_fps_update: Instant,

    /// Fatal error that ended the event loop
    exit_error: Option<anyhow::Error>,
}

impl App {
    fn new(config: Config) -> Self {
        let assets = AssetManager::new(&config.assets.shader_dir);
        let is_fullscreen = config.window.fullscreen;
        Self {
            config,
            assets,
            renderer: None,
            window: None,
            is_minimized: false,
            is_fullscreen,
            frame_count: 0,
            last_frame_time: Instant::now(),
            last_fps_update: Instant::now(),
            exit_error: None,
        }
    }

    fn init_renderer(&mut self, window: Arc<Window>) -> Result<()> {
        let host = WinitWindow::new(window);
        let renderer = Renderer::new(
            Arc::new(host.clone()) as Arc<dyn WindowHost>,
            &self.assets,
            self.config.renderer_config(),
        )
        .context("Failed to initialize renderer")?;

        self.renderer = Some(renderer);
        self.window = Some(host);
        Ok(())
    }

    fn shutdown(&mut self, event_loop: &ActiveEventLoop) {
        if let Some(renderer) = self.renderer.as_mut() {
            if let Err(e) = renderer.shutdown() {
                log::error!("Shutdown failed: {}", e);
            }
        }
        self.renderer = None;
        event_loop.exit();
    }

    // =========================================================================
    // FULLSCREEN TOGGLE
    // =========================================================================

    fn toggle_fullscreen(&mut self) {
        if let Some(window) = &self.window {
            self.is_fullscreen = !self.is_fullscreen;

            if self.is_fullscreen {
                window.window().set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.window().set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }
        }
    }

    // =========================================================================
    // FPS TRACKING
    // =========================================================================

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

        // Update title every second
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;

            if let Some(window) = &self.window {
                window.window().set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms)",
                    self.config.window.title,
                    fps,
                    frame_time * 1000.0,
                ));
            }

            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    /// Called when the application is ready to create windows.
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        if self.config.window.fullscreen {
            window_attributes = window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                self.exit_error = Some(anyhow::Error::new(e).context("Failed to create window"));
                event_loop.exit();
                return;
            }
        };

        if let Err(e) = self.init_renderer(window) {
            log::error!("{:#}", e);
            self.exit_error = Some(e);
            event_loop.exit();
        }
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
                self.shutdown(event_loop);
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);

                self.is_minimized = size.width == 0 || size.height == 0;
                if let Some(renderer) = self.renderer.as_mut() {
                    renderer.notify_resized();
                }
            }

            WindowEvent::RedrawRequested => {
                if self.is_minimized {
                    return;
                }
                let Some(renderer) = self.renderer.as_mut() else {
                    return;
                };

                match renderer.draw_frame() {
                    Ok(FrameStatus::Presented) => self.update_fps(),
                    // Minimized before Resized(0, 0) reached us; retried on a later redraw
                    Ok(FrameStatus::Deferred) => log::debug!("Frame deferred until the window has area"),
                    Ok(FrameStatus::Rebuilt) => {}
                    Err(e) => {
                        // Fatal: no partial-frame recovery
                        log::error!("Render error: {}", e);
                        self.exit_error = Some(anyhow::Error::new(e).context("Frame loop aborted"));
                        self.shutdown(event_loop);
                    }
                }
            }

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() {
                    if let PhysicalKey::Code(key) = event.physical_key {
                        match key {
                            KeyCode::Escape => {
                                log::info!("ESC pressed, exiting...");
                                self.shutdown(event_loop);
                            }
                            KeyCode::F11 => self.toggle_fullscreen(),
                            _ => {}
                        }
                    }
                }
            }

            _ => {}
        }
    }

    /// Request continuous redraws.
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(window) = &self.window {
            window.window().request_redraw();
        }
    }
}
