// =============================================================================
// RTRT - Real-time ray-traced renderer
// =============================================================================
//
// FRAME FLOW:
// 1. Poll window events, update the camera
// 2. Wait for the previous frame's fence
// 3. Acquire a swapchain image
// 4. Record: camera uniform -> raster OR raytrace+denoise -> post/tonemap
// 5. Submit and present
//
// The engine core lives in render::Renderer; this file owns the window, the
// input handling, and process startup.
//
// =============================================================================

mod backend;
mod camera;
mod config;
mod render;
mod scene;

use anyhow::Result;
use backend::VulkanDevice;
use camera::Camera;
use config::Config;
use glam::Mat4;
use render::{Renderer, RendererOptions};
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::{ElementState, MouseButton, WindowEvent},
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Fullscreen, Window, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

#[derive(Debug, Default, PartialEq, Eq)]
struct CliOptions {
    /// Enable the VK_LAYER_LUNARG_api_dump trace layer
    api_dump: bool,
}

/// Parse the command line. Any unrecognized argument is a usage error.
fn parse_args<I: IntoIterator<Item = String>>(args: I) -> Result<CliOptions, String> {
    let mut options = CliOptions::default();
    for arg in args {
        match arg.as_str() {
            "-d" | "--api-dump" => options.api_dump = true,
            other => return Err(format!("Unknown argument: {}", other)),
        }
    }
    Ok(options)
}

fn main() -> Result<()> {
    let cli = match parse_args(std::env::args().skip(1)) {
        Ok(cli) => cli,
        Err(message) => {
            eprintln!("{}", message);
            eprintln!("usage: rtrt [-d | --api-dump]");
            std::process::exit(1);
        }
    };

    init_logging();

    let config = Config::load();
    log::info!("Starting renderer");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config, cli);
    event_loop.run_app(&mut app)?;
    Ok(())
}

fn init_logging() {
    use env_logger::Builder;
    use log::LevelFilter;

    let mut builder = Builder::from_default_env();
    builder.filter_level(LevelFilter::Info);
    builder.init();
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Index of the demo scene's tall block, the instance the N key spins to
/// exercise TLAS rebuilds.
const SPIN_INSTANCE: usize = 2;

struct App {
    config: Config,
    cli: CliOptions,

    window: Option<Arc<Window>>,
    device: Option<Arc<VulkanDevice>>,
    renderer: Option<Renderer>,

    camera: Camera,
    is_fullscreen: bool,
    is_minimized: bool,

    // FPS tracking
    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl App {
    fn new(config: Config, cli: CliOptions) -> Self {
        let is_fullscreen = config.window.fullscreen;
        let now = Instant::now();
        Self {
            config,
            cli,
            window: None,
            device: None,
            renderer: None,
            camera: Camera::default(),
            is_fullscreen,
            is_minimized: false,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    // =========================================================================
    // INITIALIZATION
    // =========================================================================

    fn init_vulkan(&mut self, window: Arc<Window>) -> Result<()> {
        use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};

        log::info!("Initializing Vulkan...");

        let display_handle = window.raw_display_handle();
        let window_handle = window.raw_window_handle();

        let enable_validation = cfg!(debug_assertions) && self.config.debug.validation_layers;
        let device = VulkanDevice::new(
            &self.config.window.title,
            enable_validation,
            self.cli.api_dump,
            display_handle,
        )?;

        let surface = device.create_surface(display_handle, window_handle)?;

        let size = window.inner_size();
        let options = RendererOptions {
            ray_depth: self.config.graphics.ray_depth,
            denoise_passes: self.config.graphics.denoise_passes,
            start_with_raytracer: self.config.graphics.raytrace,
        };
        let renderer = Renderer::new(
            device.clone(),
            surface,
            (size.width, size.height),
            &scene::demo_scene(),
            &options,
        )?;

        self.device = Some(device);
        self.renderer = Some(renderer);

        log::info!("Vulkan initialized successfully!");
        Ok(())
    }

    // =========================================================================
    // RENDER LOOP
    // =========================================================================

    fn render_frame(&mut self) -> Result<bool> {
        if self.is_minimized {
            return Ok(false);
        }
        let (Some(window), Some(renderer)) = (self.window.as_ref(), self.renderer.as_mut())
        else {
            return Ok(false);
        };

        if self.camera.take_modified() {
            renderer.invalidate_history();
        }

        let size = window.inner_size();
        renderer.draw_frame(&self.camera, (size.width, size.height))
    }

    // =========================================================================
    // INPUT
    // =========================================================================

    fn handle_key(&mut self, key: winit::keyboard::KeyCode, event_loop: &ActiveEventLoop) {
        use winit::keyboard::KeyCode;

        const STEP: f32 = 0.15;
        match key {
            KeyCode::Escape => {
                log::info!("ESC pressed, exiting...");
                event_loop.exit();
            }
            KeyCode::F11 => self.toggle_fullscreen(),
            // Camera translation, WASD + E/C for lift
            KeyCode::KeyW => self.camera.move_relative(STEP, 0.0, 0.0),
            KeyCode::KeyS => self.camera.move_relative(-STEP, 0.0, 0.0),
            KeyCode::KeyA => self.camera.move_relative(0.0, -STEP, 0.0),
            KeyCode::KeyD => self.camera.move_relative(0.0, STEP, 0.0),
            KeyCode::KeyE => self.camera.move_relative(0.0, 0.0, STEP),
            KeyCode::KeyC => self.camera.move_relative(0.0, 0.0, -STEP),
            // Raster <-> raytrace toggle
            KeyCode::KeyR => {
                if let Some(renderer) = self.renderer.as_mut() {
                    renderer.toggle_render_mode();
                }
            }
            // Spin the tall block; forces a TLAS rebuild before the next frame
            KeyCode::KeyN => {
                if let Some(renderer) = self.renderer.as_mut() {
                    if let Some(transform) = renderer.instance_transform(SPIN_INSTANCE) {
                        renderer.set_instance_transform(
                            SPIN_INSTANCE,
                            transform * Mat4::from_rotation_y(0.15),
                        );
                    }
                }
            }
            _ => {}
        }
    }

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;

            if self.is_fullscreen {
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }

            if let Some(renderer) = self.renderer.as_mut() {
                renderer.request_resize();
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
        if now.duration_since(self.last_fps_update).as_secs_f32() >= 1.0 {
            let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
            let fps = self.frame_count as f32 / elapsed;

            if let Some(ref window) = self.window {
                let mode = self
                    .renderer
                    .as_ref()
                    .map(|r| if r.use_raytracer { "rt" } else { "raster" })
                    .unwrap_or("-");
                window.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms) [{}]",
                    self.config.window.title,
                    fps,
                    frame_time * 1000.0,
                    mode
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
            window_attributes =
                window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };

        // Fatal initialization errors abort startup with a diagnostic
        if let Err(e) = self.init_vulkan(window.clone()) {
            log::error!("Failed to initialize Vulkan: {:?}", e);
            event_loop.exit();
            return;
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
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);

                if size.width == 0 || size.height == 0 {
                    self.is_minimized = true;
                } else {
                    self.is_minimized = false;
                    if let Some(renderer) = self.renderer.as_mut() {
                        renderer.request_resize();
                    }
                }
            }

            WindowEvent::RedrawRequested => match self.render_frame() {
                Ok(rendered) => {
                    if rendered {
                        self.update_fps();
                    }
                }
                Err(e) => {
                    // A frame-level failure leaves torn state; stop cleanly
                    log::error!("Render error: {:?}", e);
                    event_loop.exit();
                }
            },

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::PhysicalKey;
                if event.state.is_pressed() {
                    if let PhysicalKey::Code(key) = event.physical_key {
                        self.handle_key(key, event_loop);
                    }
                }
            }

            WindowEvent::MouseInput { state, button: MouseButton::Left, .. } => {
                self.camera.dragging = state == ElementState::Pressed;
            }

            WindowEvent::CursorMoved { position, .. } => {
                let (x, y) = (position.x as f32, position.y as f32);
                if self.camera.dragging {
                    self.camera.mouse_move(x, y);
                } else {
                    self.camera.set_mouse_position(x, y);
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        // Ordered teardown: renderer first, then the device via its Drop
        if let Some(renderer) = self.renderer.take() {
            renderer.shutdown();
        }
        self.device = None;
        log::info!("Cleanup complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn api_dump_flag_is_recognized() {
        assert_eq!(parse_args(args(&["-d"])), Ok(CliOptions { api_dump: true }));
        assert_eq!(parse_args(args(&["--api-dump"])), Ok(CliOptions { api_dump: true }));
        assert_eq!(parse_args(args(&[])), Ok(CliOptions { api_dump: false }));
    }

    #[test]
    fn unknown_arguments_are_usage_errors() {
        assert!(parse_args(args(&["--frobnicate"])).is_err());
        assert!(parse_args(args(&["-d", "extra"])).is_err());
    }
}
