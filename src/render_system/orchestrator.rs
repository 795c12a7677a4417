//! Per-frame sequencing of the ray trace, denoise, composite and present stages.
//!
//! A frame walks through [`FrameState`] in order. The host only blocks in
//! [`FrameBackend::wait_for_previous_frame`], which waits for the fence of the previous frame's
//! composite submission: the accumulation buffer is written in place, so the next ray trace
//! must not start before everything reading the buffer has finished. Every other dependency is
//! a timeline semaphore value drawn from one [`TimelineCounter`].

use std::time::Duration;

use nalgebra::Vector3;

use crate::{config::RenderConfig, error::RenderError};

use super::{
    accumulation::{AccumulationState, SizedResource},
    cross_device::DenoiserBindings,
    frame::{CameraMatrices, Frame, SceneUniformData, UniformInputs},
    timeline::{TimelineCounter, TimelineSignal, TimelineWait},
};

pub enum Acquire<T> {
    Ready { target: T, suboptimal: bool },
    /// The surface changed under the swapchain; nothing was acquired.
    OutOfDate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    /// Presented, but the swapchain should be rebuilt.
    Suboptimal,
    /// Not presented, the swapchain must be rebuilt.
    OutOfDate,
}

/// What the composite pass needs beyond its bound resources.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PostProcessSettings {
    /// read the denoiser output instead of the raw accumulation
    pub denoised: bool,
    pub auto_exposure: bool,
    /// in stops
    pub exposure_adjustment: f32,
}

/// The device work behind every frame stage.
pub trait FrameBackend {
    type Semaphore;
    type AccumulationBuffer: SizedResource;
    type SharedBuffer: Clone;
    type Target;

    /// Current size of the presentation surface, `[0, 0]` while minimized.
    fn surface_extent(&self) -> [u32; 2];

    fn create_timeline_semaphore(&self) -> Result<Self::Semaphore, RenderError>;

    fn allocate_accumulation(&self, extent: [u32; 2]) -> Result<Self::AccumulationBuffer, RenderError>;

    /// Writes the size-dependent resource sets of every stage.
    fn bind_size_dependent(
        &mut self,
        accumulation: &Self::AccumulationBuffer,
        denoiser: Option<DenoiserBindings<Self::SharedBuffer>>,
    ) -> Result<(), RenderError>;

    fn acquire(&mut self) -> Result<Acquire<Self::Target>, RenderError>;

    /// Blocks until the previous frame's composite submission completed.
    fn wait_for_previous_frame(&mut self, timeout: Duration) -> Result<(), RenderError>;

    fn write_uniforms(&mut self, uniforms: &SceneUniformData) -> Result<(), RenderError>;

    fn submit_ray_trace(
        &mut self,
        extent: [u32; 2],
        signal: TimelineSignal<'_, Self::Semaphore>,
    ) -> Result<(), RenderError>;

    /// Submits the post-process work writing `target`. Signals the fence
    /// [`FrameBackend::wait_for_previous_frame`] waits for.
    fn submit_composite(
        &mut self,
        target: &Self::Target,
        wait: TimelineWait<'_, Self::Semaphore>,
        settings: &PostProcessSettings,
    ) -> Result<(), RenderError>;

    fn present(&mut self, target: Self::Target) -> Result<PresentOutcome, RenderError>;

    /// Waits for all submitted work on the rendering device.
    fn drain(&mut self, timeout: Duration) -> Result<(), RenderError>;

    /// Rebuilds the presentation target, returns the extent it was created with.
    fn recreate_target(&mut self, extent: [u32; 2]) -> Result<[u32; 2], RenderError>;
}

/// The optional stage between ray trace and composite.
pub trait DenoiseStage {
    type Semaphore;
    type Buffer;

    /// Signalled by the ray trace submission, waited on by the denoiser.
    fn ray_trace_semaphore(&self) -> &Self::Semaphore;

    /// Signalled by the denoiser, waited on by the composite submission.
    fn denoised_semaphore(&self) -> &Self::Semaphore;

    fn bindings(&self) -> Option<DenoiserBindings<Self::Buffer>>;

    /// Enqueues the denoise pass after `wait_value` and signals `signal_value` when done.
    fn denoise(
        &mut self,
        wait_value: u64,
        signal_value: u64,
        settings: &crate::config::DenoiseSettings,
        frame: &Frame,
    ) -> Result<(), RenderError>;

    /// Drains the stage and recreates its buffers at `extent`.
    fn resize(&mut self, extent: [u32; 2]) -> Result<(), RenderError>;
}

pub type BoxedDenoiser<B> = Box<
    dyn DenoiseStage<
            Semaphore = <B as FrameBackend>::Semaphore,
            Buffer = <B as FrameBackend>::SharedBuffer,
        >,
>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    Acquired,
    RayTraced,
    Denoised,
    Composited,
    Presented,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    Presented { iteration_count: u32 },
    /// Acquire or present reported a stale surface; the next frame rebuilds it.
    OutOfDate,
    /// Nothing to render into, e.g. a minimized window.
    Skipped,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum InputEvent {
    /// rotate the sun override around the vertical axis, in steps
    SunAzimuth(f32),
    /// raise or lower the sun override, in steps
    SunElevation(f32),
    ClearSunOverride,
    /// change the manual exposure, in steps
    Exposure(f32),
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct SunOverride {
    azimuth: f32,
    elevation: f32,
}

impl SunOverride {
    fn direction(&self) -> Vector3<f32> {
        Vector3::new(
            self.elevation.cos() * self.azimuth.sin(),
            self.elevation.sin(),
            self.elevation.cos() * self.azimuth.cos(),
        )
    }
}

pub struct FrameOrchestrator<B: FrameBackend> {
    backend: B,
    config: RenderConfig,
    denoiser: Option<BoxedDenoiser<B>>,
    accumulation: AccumulationState<B::AccumulationBuffer>,
    timeline: TimelineCounter,
    // signalled by the ray trace when there is no denoiser
    ray_trace_done: B::Semaphore,
    camera: CameraMatrices,
    previous_camera: CameraMatrices,
    sun: Option<SunOverride>,
    exposure_adjustment: f32,
    state: FrameState,
    pending_resize: bool,
}

impl<B: FrameBackend> FrameOrchestrator<B> {
    /// Allocates the size-dependent resources and binds them. The backend's static resource
    /// sets (scene, uniforms) are expected to be bound already.
    ///
    /// A surface without area (a window created minimized) only gets a placeholder
    /// accumulation buffer; everything else is built by the first frame once it has area.
    pub fn setup(
        mut backend: B,
        config: RenderConfig,
        denoiser: Option<BoxedDenoiser<B>>,
    ) -> Result<FrameOrchestrator<B>, RenderError> {
        let mut denoiser = denoiser.filter(|_| config.denoise.enabled);
        let extent = backend.surface_extent();
        let minimized = extent[0] == 0 || extent[1] == 0;

        let accumulation = AccumulationState::new(backend.allocate_accumulation(extent)?);
        if let Some(denoiser) = denoiser.as_mut().filter(|_| !minimized) {
            denoiser.resize(extent)?;
        }
        backend.bind_size_dependent(
            accumulation.buffer(),
            denoiser.as_ref().and_then(|d| d.bindings()),
        )?;
        let ray_trace_done = backend.create_timeline_semaphore()?;

        if minimized {
            log::info!("surface has no area, deferring size-dependent setup");
        }
        log::info!(
            "frame orchestrator ready at {}x{}, denoising {}",
            extent[0],
            extent[1],
            if denoiser.is_some() { "on" } else { "off" }
        );

        Ok(FrameOrchestrator {
            exposure_adjustment: config.exposure.manual_adjustment,
            backend,
            config,
            denoiser,
            accumulation,
            timeline: TimelineCounter::new(),
            ray_trace_done,
            camera: CameraMatrices::default(),
            previous_camera: CameraMatrices::default(),
            sun: None,
            state: FrameState::Idle,
            pending_resize: minimized,
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn frame(&self) -> &Frame {
        self.accumulation.frame()
    }

    pub fn accumulation(&self) -> &AccumulationState<B::AccumulationBuffer> {
        &self.accumulation
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn timeline_value(&self) -> u64 {
        self.timeline.current()
    }

    pub fn exposure_adjustment(&self) -> f32 {
        self.exposure_adjustment
    }

    pub fn sun_direction(&self) -> Option<Vector3<f32>> {
        self.sun.map(|s| s.direction())
    }

    pub fn denoising(&self) -> bool {
        self.denoiser.is_some()
    }

    /// Schedules a rebuild of the size-dependent resources before the next frame.
    pub fn request_resize(&mut self) {
        self.pending_resize = true;
    }

    pub fn on_view_changed(&mut self) {
        log::debug!(
            "view changed after {} samples",
            self.accumulation.frame().iteration_count
        );
        self.accumulation.on_view_changed();
    }

    /// Drains in-flight work and recreates the target, the accumulation buffer and the
    /// denoiser buffers at `extent`, then rebinds the sets referencing them.
    pub fn on_resize(&mut self, extent: [u32; 2]) -> Result<(), RenderError> {
        if extent[0] == 0 || extent[1] == 0 {
            self.pending_resize = true;
            return Ok(());
        }
        let timeout = self.config.fence_timeout();
        self.backend.drain(timeout)?;

        let extent = self.backend.recreate_target(extent)?;
        let backend = &self.backend;
        self.accumulation
            .on_resize(extent, |e| backend.allocate_accumulation(e))?;
        if let Some(denoiser) = self.denoiser.as_mut() {
            denoiser.resize(extent)?;
        }
        self.backend.bind_size_dependent(
            self.accumulation.buffer(),
            self.denoiser.as_ref().and_then(|d| d.bindings()),
        )?;

        self.pending_resize = false;
        self.state = FrameState::Idle;
        log::info!("resized render target to {}x{}", extent[0], extent[1]);
        Ok(())
    }

    /// Applies a user input. Returns whether anything changed.
    pub fn on_input_event(&mut self, event: InputEvent) -> bool {
        let step = self.config.sun_step;
        match event {
            InputEvent::SunAzimuth(steps) => {
                let sun = self.sun.get_or_insert(SunOverride {
                    azimuth: 0.0,
                    elevation: std::f32::consts::FRAC_PI_4,
                });
                sun.azimuth = (sun.azimuth + steps * step).rem_euclid(std::f32::consts::TAU);
            }
            InputEvent::SunElevation(steps) => {
                let sun = self.sun.get_or_insert(SunOverride {
                    azimuth: 0.0,
                    elevation: std::f32::consts::FRAC_PI_4,
                });
                sun.elevation = (sun.elevation + steps * step)
                    .clamp(0.0, std::f32::consts::FRAC_PI_2);
            }
            InputEvent::ClearSunOverride => {
                if self.sun.take().is_none() {
                    return false;
                }
            }
            InputEvent::Exposure(steps) => {
                // exposure is applied after accumulation, samples stay valid
                self.exposure_adjustment += steps * self.config.exposure.adjustment_step;
                log::debug!("exposure adjustment {:+.2} stops", self.exposure_adjustment);
                return true;
            }
        }
        // lighting changed, everything accumulated so far is wrong
        self.on_view_changed();
        true
    }

    /// Renders and presents one frame seen through `camera`.
    pub fn render_frame(&mut self, camera: &CameraMatrices) -> Result<FrameOutcome, RenderError> {
        if self.pending_resize {
            let extent = self.backend.surface_extent();
            self.on_resize(extent)?;
            if self.pending_resize {
                return Ok(FrameOutcome::Skipped);
            }
        }

        if *camera != self.camera {
            self.camera = *camera;
            self.on_view_changed();
        }

        self.state = FrameState::Idle;
        let target = match self.backend.acquire()? {
            Acquire::Ready { target, suboptimal } => {
                if suboptimal {
                    self.pending_resize = true;
                }
                target
            }
            Acquire::OutOfDate => {
                log::debug!("swapchain out of date (at acquire)");
                self.pending_resize = true;
                return Ok(FrameOutcome::OutOfDate);
            }
        };
        self.state = FrameState::Acquired;

        // the accumulation buffer is still read by the previous frame until this returns
        self.backend
            .wait_for_previous_frame(self.config.fence_timeout())?;

        let frame = *self.accumulation.frame();
        let uniforms = SceneUniformData::compose(UniformInputs {
            frame: &frame,
            camera: &self.camera,
            previous: &self.previous_camera,
            sun_override: self.sun.map(|s| s.direction()),
            exposure_adjustment: self.exposure_adjustment,
            max_depth: self.config.capabilities.max_depth,
            samples_per_frame: self.config.capabilities.sample_count,
            denoise: self.denoiser.is_some(),
        });
        self.backend.write_uniforms(&uniforms)?;

        let extent = self.accumulation.extent();
        let ray_traced = self.timeline.advance();
        {
            let semaphore = match &self.denoiser {
                Some(denoiser) => denoiser.ray_trace_semaphore(),
                None => &self.ray_trace_done,
            };
            self.backend.submit_ray_trace(
                extent,
                TimelineSignal {
                    semaphore,
                    value: ray_traced,
                },
            )?;
        }
        self.state = FrameState::RayTraced;

        let mut composite_after = ray_traced;
        if let Some(denoiser) = self.denoiser.as_mut() {
            let denoised = self.timeline.advance();
            denoiser.denoise(ray_traced, denoised, &self.config.denoise, &frame)?;
            composite_after = denoised;
            self.state = FrameState::Denoised;
        }

        let settings = PostProcessSettings {
            denoised: self.denoiser.is_some(),
            auto_exposure: self.config.exposure.auto_exposure,
            exposure_adjustment: self.exposure_adjustment,
        };
        {
            let semaphore = match &self.denoiser {
                Some(denoiser) => denoiser.denoised_semaphore(),
                None => &self.ray_trace_done,
            };
            self.backend.submit_composite(
                &target,
                TimelineWait {
                    semaphore,
                    value: composite_after,
                },
                &settings,
            )?;
        }
        self.state = FrameState::Composited;

        match self.backend.present(target)? {
            PresentOutcome::Presented => {}
            PresentOutcome::Suboptimal => self.pending_resize = true,
            PresentOutcome::OutOfDate => {
                log::debug!("swapchain out of date (at present)");
                self.pending_resize = true;
                self.state = FrameState::Idle;
                return Ok(FrameOutcome::OutOfDate);
            }
        }

        self.accumulation.on_frame_presented();
        self.previous_camera = self.camera;
        self.state = FrameState::Presented;
        Ok(FrameOutcome::Presented {
            iteration_count: self.accumulation.frame().iteration_count,
        })
    }
}

impl<B: FrameBackend> Drop for FrameOrchestrator<B> {
    fn drop(&mut self) {
        // device objects owned by the backend must not be destroyed while in use
        if let Err(e) = self.backend.drain(self.config.fence_timeout()) {
            log::warn!("failed to drain the device on shutdown: {e}");
        }
    }
}
