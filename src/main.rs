use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use nalgebra::Point3;
use winit::{
    application::ApplicationHandler,
    dpi::LogicalSize,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    window::{Window, WindowId},
};

use progressive_pathtracer::{
    camera::{Camera, InteractiveCamera, SphericalCamera},
    config::RenderConfig,
    error::RenderError,
    handle_user_input,
    render_system::{
        cross_device::{CrossDeviceBridge, CrossDeviceDenoiser, select_platform},
        orchestrator::{BoxedDenoiser, FrameOrchestrator, FrameOutcome},
        scene::{Scene, SceneDescription},
        vulkan::{
            Allocators, BilateralFilterKernel, RenderingDevice, VulkanExporter,
            VulkanFrameBackend, VulkanSecondary, create_instance, create_surface,
            get_device_for_denoising, get_device_for_rendering_on,
        },
    },
};

fn window_extent(window: &Window) -> [u32; 2] {
    let size = window.inner_size();
    [size.width, size.height]
}

fn create_denoiser(
    instance: Arc<vulkano::instance::Instance>,
    rendering: &RenderingDevice,
    config: &RenderConfig,
) -> Result<BoxedDenoiser<VulkanFrameBackend>, RenderError> {
    let (_, queue) = get_device_for_denoising(instance, rendering.device.physical_device())?;
    let secondary = VulkanSecondary::new(queue, config.fence_timeout());
    let kernel = BilateralFilterKernel::new(&secondary)?;
    let bridge = CrossDeviceBridge::new(
        VulkanExporter::new(rendering.device.clone()),
        secondary,
        select_platform(),
    );
    Ok(Box::new(CrossDeviceDenoiser::new(bridge, kernel)?))
}

struct Renderer {
    window: Arc<Window>,
    orchestrator: FrameOrchestrator<VulkanFrameBackend>,
}

impl Renderer {
    fn new(event_loop: &ActiveEventLoop, config: &RenderConfig) -> Result<Renderer, RenderError> {
        let window = event_loop
            .create_window(
                Window::default_attributes()
                    .with_title(config.window.title.clone())
                    .with_inner_size(LogicalSize::new(config.window.width, config.window.height)),
            )
            .map_err(|e| RenderError::Window(e.to_string()))?;
        let window = Arc::new(window);

        let instance = create_instance(event_loop)?;
        let surface = create_surface(instance.clone(), window.clone())?;
        let rendering = get_device_for_rendering_on(instance.clone(), surface.clone())?;
        let allocators = Allocators::new(&rendering.device);

        let scene = Scene::upload(
            SceneDescription::box_room(),
            rendering.graphics_queue.clone(),
            &allocators,
        )?;
        let backend = VulkanFrameBackend::new(&rendering, surface, allocators, scene, config)?;

        let denoiser = if config.denoise.enabled {
            match create_denoiser(instance, &rendering, config) {
                Ok(denoiser) => Some(denoiser),
                Err(e) => {
                    log::warn!("denoiser unavailable, continuing without it: {e}");
                    None
                }
            }
        } else {
            None
        };

        let orchestrator = FrameOrchestrator::setup(backend, config.clone(), denoiser)?;
        Ok(Renderer {
            window,
            orchestrator,
        })
    }
}

struct FrameStats {
    interval: Duration,
    start: Instant,
    frames: u32,
}

impl FrameStats {
    fn new(interval: Duration) -> FrameStats {
        FrameStats {
            interval,
            start: Instant::now(),
            frames: 0,
        }
    }

    fn record(&mut self, iteration_count: u32) {
        if self.interval.is_zero() {
            return;
        }
        self.frames += 1;
        let elapsed = self.start.elapsed();
        if elapsed >= self.interval {
            log::info!(
                "fps: {:.1}, {} samples accumulated",
                self.frames as f64 / elapsed.as_secs_f64(),
                iteration_count + 1
            );
            self.frames = 0;
            self.start = Instant::now();
        }
    }
}

struct App {
    config: RenderConfig,
    camera: SphericalCamera,
    renderer: Option<Renderer>,
    stats: FrameStats,
    failed: bool,
}

impl App {
    fn new(config: RenderConfig) -> App {
        App {
            stats: FrameStats::new(Duration::from_secs(config.stats_interval_secs)),
            config,
            camera: SphericalCamera::new(Point3::new(0.0, 1.5, 0.0), 4.0),
            renderer: None,
            failed: false,
        }
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, e: RenderError) {
        log::error!("{e}");
        self.failed = true;
        // drains the device before the window goes away
        self.renderer = None;
        event_loop.exit();
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.renderer.is_some() {
            return;
        }
        match Renderer::new(event_loop, &self.config) {
            Ok(renderer) => self.renderer = Some(renderer),
            Err(e) => self.fail(event_loop, e),
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        let Some(renderer) = self.renderer.as_mut() else {
            return;
        };
        let extent = window_extent(&renderer.window);

        match event {
            WindowEvent::CloseRequested => {
                self.renderer = None;
                event_loop.exit();
            }
            WindowEvent::Resized(_) | WindowEvent::ScaleFactorChanged { .. } => {
                renderer.orchestrator.request_resize();
            }
            WindowEvent::RedrawRequested => {
                let camera = self.camera.matrices(extent);
                match renderer.orchestrator.render_frame(&camera) {
                    Ok(FrameOutcome::Presented { iteration_count }) => {
                        self.stats.record(iteration_count)
                    }
                    Ok(FrameOutcome::OutOfDate | FrameOutcome::Skipped) => {}
                    Err(e) => self.fail(event_loop, e),
                }
            }
            event => {
                if let Some(input) = handle_user_input::input_event(&event) {
                    if renderer.orchestrator.on_input_event(input) {
                        log::debug!("applied {input:?}");
                    }
                }
                // camera movement is picked up by the next frame
                self.camera.handle_event(extent, &event);
            }
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(renderer) = &self.renderer {
            renderer.window.request_redraw();
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match RenderConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            log::error!("invalid render config: {e}");
            std::process::exit(1);
        }
    };

    let event_loop = match EventLoop::new() {
        Ok(event_loop) => event_loop,
        Err(e) => {
            log::error!("cannot create the event loop: {e}");
            std::process::exit(1);
        }
    };
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = App::new(config);
    if let Err(e) = event_loop.run_app(&mut app) {
        log::error!("event loop failed: {e}");
        app.failed = true;
    }
    let failed = app.failed;
    drop(app);
    if failed {
        std::process::exit(1);
    }
}
