//! In-memory stand-ins for the rendering device, the exporter and the secondary device.
//!
//! Every mock appends to one shared [`EventLog`], so tests can check the order in which the
//! orchestrator and the bridge touch the devices.

#![allow(dead_code)]

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    io,
    rc::Rc,
    time::Duration,
};

use nalgebra::{Matrix4, Point3, Vector3};

use progressive_pathtracer::{
    config::{DenoiseSettings, RenderConfig},
    error::RenderError,
    render_system::{
        accumulation::SizedResource,
        cross_device::{
            CrossDeviceBridge, CrossDeviceDenoiser, DenoiseKernel, DenoiserBindings, ExportSource,
            HandleKind, Import, NativeHandle, PlatformHandle, PrimaryExporter, SecondaryDevice,
            SharedAllocation,
        },
        frame::{CameraMatrices, Frame, SceneUniformData},
        orchestrator::{
            Acquire, BoxedDenoiser, FrameBackend, FrameOrchestrator, PostProcessSettings,
            PresentOutcome,
        },
        timeline::{TimelineSignal, TimelineWait},
    },
};

#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    AllocateAccumulation([u32; 2]),
    BindSizeDependent {
        accumulation: [u32; 2],
        denoiser: Option<[u32; 2]>,
    },
    Acquire,
    WaitForPreviousFrame,
    WriteUniforms {
        frame: u32,
        iteration: u32,
        changed: bool,
    },
    RayTrace {
        semaphore: u32,
        value: u64,
    },
    Composite {
        semaphore: u32,
        wait: u64,
        denoised: bool,
    },
    Present,
    Drain,
    RecreateTarget([u32; 2]),
    ImportMemory(u64),
    ImportSemaphore,
    ShareBuffers([u64; 5]),
    SecondaryDrain(u64),
    PrepareKernel([u32; 2]),
    Denoise {
        wait: u64,
        signal: u64,
        commands: Vec<String>,
    },
}

pub type EventLog = Rc<RefCell<Vec<Event>>>;

pub fn event_log() -> EventLog {
    Rc::new(RefCell::new(vec![]))
}

fn temp_handle() -> Result<NativeHandle, RenderError> {
    Ok(NativeHandle::Fd(tempfile::tempfile()?))
}

/// Deterministic radiance of `pixel` in the frame with index `frame`.
pub fn sample_value(pixel: usize, frame: u32) -> [f32; 4] {
    let x = ((pixel as u32 * 31 + frame * 17) % 11) as f32 / 10.0;
    [x, 0.5 * x, 1.0 - x, 1.0]
}

/// Mean of [`sample_value`] over the frames in `frames`.
pub fn expected_average(pixel: usize, frames: std::ops::Range<u32>) -> [f32; 4] {
    let n = frames.len() as f64;
    let mut sum = [0.0f64; 4];
    for f in frames {
        for (s, v) in sum.iter_mut().zip(sample_value(pixel, f)) {
            *s += v as f64;
        }
    }
    sum.map(|s| (s / n) as f32)
}

pub fn camera_at(x: f32) -> CameraMatrices {
    CameraMatrices {
        view: Matrix4::look_at_rh(
            &Point3::new(x, 1.5, 4.0),
            &Point3::new(0.0, 1.5, 0.0),
            &Vector3::y(),
        ),
        projection: Matrix4::new_perspective(4.0 / 3.0, 1.0, 0.05, 1000.0),
    }
}

pub fn config(denoise: bool) -> RenderConfig {
    let mut config = RenderConfig::default();
    config.denoise.enabled = denoise;
    config.fence_timeout_ms = 100;
    config
}

#[derive(Debug)]
pub struct MockSemaphore {
    pub id: u32,
}

impl ExportSource for MockSemaphore {
    fn export(&self, kind: HandleKind) -> Result<NativeHandle, RenderError> {
        assert_eq!(kind, HandleKind::OpaqueFd);
        temp_handle()
    }
}

#[derive(Clone, Debug)]
pub struct MockAccumulation {
    pub extent: [u32; 2],
    pub texels: Rc<RefCell<Vec<[f32; 4]>>>,
}

impl SizedResource for MockAccumulation {
    fn extent(&self) -> [u32; 2] {
        self.extent
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct MockShared {
    pub extent: [u32; 2],
    pub texel_size: u32,
}

impl SizedResource for MockShared {
    fn extent(&self) -> [u32; 2] {
        self.extent
    }
}

impl ExportSource for MockShared {
    fn export(&self, _kind: HandleKind) -> Result<NativeHandle, RenderError> {
        temp_handle()
    }
}

impl SharedAllocation for MockShared {
    fn allocation_size(&self) -> u64 {
        self.extent[0] as u64 * self.extent[1] as u64 * self.texel_size as u64
    }
}

pub enum ScriptedAcquire {
    OutOfDate,
    Suboptimal,
}

/// Rendering device that runs the ray trace stage on the host.
pub struct MockBackend {
    pub log: EventLog,
    pub surface: [u32; 2],
    pub acquire_script: VecDeque<ScriptedAcquire>,
    pub present_script: VecDeque<PresentOutcome>,
    next_semaphore: Cell<u32>,
    accumulation: Option<MockAccumulation>,
    uniforms: SceneUniformData,
    // the last composite submission has not been waited for
    composite_pending: bool,
}

impl MockBackend {
    pub fn new(log: &EventLog, surface: [u32; 2]) -> MockBackend {
        MockBackend {
            log: log.clone(),
            surface,
            acquire_script: VecDeque::new(),
            present_script: VecDeque::new(),
            next_semaphore: Cell::new(1),
            accumulation: None,
            uniforms: SceneUniformData::default(),
            composite_pending: false,
        }
    }

    fn push(&self, event: Event) {
        self.log.borrow_mut().push(event);
    }
}

impl FrameBackend for MockBackend {
    type Semaphore = MockSemaphore;
    type AccumulationBuffer = MockAccumulation;
    type SharedBuffer = MockShared;
    type Target = ();

    fn surface_extent(&self) -> [u32; 2] {
        self.surface
    }

    fn create_timeline_semaphore(&self) -> Result<MockSemaphore, RenderError> {
        let id = self.next_semaphore.get();
        self.next_semaphore.set(id + 1);
        Ok(MockSemaphore { id })
    }

    fn allocate_accumulation(&self, extent: [u32; 2]) -> Result<MockAccumulation, RenderError> {
        self.push(Event::AllocateAccumulation(extent));
        // garbage, the first frame after a reset must overwrite it
        let texels = vec![[1000.0; 4]; extent[0] as usize * extent[1] as usize];
        Ok(MockAccumulation {
            extent,
            texels: Rc::new(RefCell::new(texels)),
        })
    }

    fn bind_size_dependent(
        &mut self,
        accumulation: &MockAccumulation,
        denoiser: Option<DenoiserBindings<MockShared>>,
    ) -> Result<(), RenderError> {
        let denoiser = denoiser.map(|d| {
            assert!(d.iter().all(|b| b.extent == d.radiance.extent));
            d.radiance.extent
        });
        self.accumulation = Some(accumulation.clone());
        self.push(Event::BindSizeDependent {
            accumulation: accumulation.extent,
            denoiser,
        });
        Ok(())
    }

    fn acquire(&mut self) -> Result<Acquire<()>, RenderError> {
        self.push(Event::Acquire);
        Ok(match self.acquire_script.pop_front() {
            Some(ScriptedAcquire::OutOfDate) => Acquire::OutOfDate,
            Some(ScriptedAcquire::Suboptimal) => Acquire::Ready {
                target: (),
                suboptimal: true,
            },
            None => Acquire::Ready {
                target: (),
                suboptimal: false,
            },
        })
    }

    fn wait_for_previous_frame(&mut self, _timeout: Duration) -> Result<(), RenderError> {
        self.composite_pending = false;
        self.push(Event::WaitForPreviousFrame);
        Ok(())
    }

    fn write_uniforms(&mut self, uniforms: &SceneUniformData) -> Result<(), RenderError> {
        self.uniforms = *uniforms;
        self.push(Event::WriteUniforms {
            frame: uniforms.frame,
            iteration: uniforms.iteration(),
            changed: uniforms.changed(),
        });
        Ok(())
    }

    fn submit_ray_trace(
        &mut self,
        extent: [u32; 2],
        signal: TimelineSignal<'_, MockSemaphore>,
    ) -> Result<(), RenderError> {
        assert!(
            !self.composite_pending,
            "ray trace submitted while the previous frame is in flight"
        );
        let accumulation = self
            .accumulation
            .as_ref()
            .ok_or_else(|| RenderError::Allocation("nothing bound".into()))?;
        assert_eq!(accumulation.extent, extent);

        let u = &self.uniforms;
        let weight = if u.changed() {
            1.0
        } else {
            1.0 / (u.iteration() as f32 + 1.0)
        };
        for (pixel, texel) in accumulation.texels.borrow_mut().iter_mut().enumerate() {
            let sample = sample_value(pixel, u.frame);
            for i in 0..4 {
                texel[i] += (sample[i] - texel[i]) * weight;
            }
        }

        self.push(Event::RayTrace {
            semaphore: signal.semaphore.id,
            value: signal.value,
        });
        Ok(())
    }

    fn submit_composite(
        &mut self,
        _target: &(),
        wait: TimelineWait<'_, MockSemaphore>,
        settings: &PostProcessSettings,
    ) -> Result<(), RenderError> {
        self.composite_pending = true;
        self.push(Event::Composite {
            semaphore: wait.semaphore.id,
            wait: wait.value,
            denoised: settings.denoised,
        });
        Ok(())
    }

    fn present(&mut self, _target: ()) -> Result<PresentOutcome, RenderError> {
        self.push(Event::Present);
        Ok(self
            .present_script
            .pop_front()
            .unwrap_or(PresentOutcome::Presented))
    }

    fn drain(&mut self, _timeout: Duration) -> Result<(), RenderError> {
        self.composite_pending = false;
        self.push(Event::Drain);
        Ok(())
    }

    fn recreate_target(&mut self, extent: [u32; 2]) -> Result<[u32; 2], RenderError> {
        self.surface = extent;
        self.push(Event::RecreateTarget(extent));
        Ok(extent)
    }
}

/// Primary side of the bridge. Semaphore ids start at 100 to tell them from the backend's.
pub struct MockExporter {
    next_semaphore: Cell<u32>,
}

impl MockExporter {
    pub fn new() -> MockExporter {
        MockExporter {
            next_semaphore: Cell::new(100),
        }
    }
}

impl PrimaryExporter for MockExporter {
    type Buffer = MockShared;
    type Semaphore = MockSemaphore;

    fn create_exportable_timeline(&self, _kind: HandleKind) -> Result<MockSemaphore, RenderError> {
        let id = self.next_semaphore.get();
        self.next_semaphore.set(id + 1);
        Ok(MockSemaphore { id })
    }

    fn allocate_exportable_buffer(
        &self,
        extent: [u32; 2],
        texel_size: u32,
        _kind: HandleKind,
    ) -> Result<MockShared, RenderError> {
        Ok(MockShared { extent, texel_size })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct MockMemory {
    pub size: u64,
}

/// How long the mock secondary device pretends to wait before giving up.
pub const SECONDARY_TIMEOUT: Duration = Duration::from_millis(100);

pub struct MockSecondary {
    pub log: EventLog,
    pub reject_memory: bool,
    /// submitted work never completes
    pub stalled: bool,
    // highest value signalled by completed work
    reached: Cell<u64>,
}

impl MockSecondary {
    pub fn new(log: &EventLog) -> MockSecondary {
        MockSecondary {
            log: log.clone(),
            reject_memory: false,
            stalled: false,
            reached: Cell::new(0),
        }
    }
}

impl SecondaryDevice for MockSecondary {
    type Memory = MockMemory;
    type Semaphore = ();
    type Commands = Vec<String>;

    fn import_memory(&self, handle: NativeHandle, size: u64) -> Import<MockMemory> {
        if self.reject_memory {
            return Import {
                result: Err(RenderError::import("memory", "rejected by the driver")),
                leftover: Some(handle),
            };
        }
        self.log.borrow_mut().push(Event::ImportMemory(size));
        Import {
            result: Ok(MockMemory { size }),
            leftover: None,
        }
    }

    fn import_semaphore(&self, _handle: NativeHandle) -> Import<()> {
        self.log.borrow_mut().push(Event::ImportSemaphore);
        Import {
            result: Ok(()),
            leftover: None,
        }
    }

    fn submit(
        &self,
        wait: TimelineWait<'_, ()>,
        signal: TimelineSignal<'_, ()>,
        record: &mut dyn FnMut(&mut Vec<String>) -> Result<(), RenderError>,
    ) -> Result<(), RenderError> {
        let mut commands = vec![];
        record(&mut commands)?;
        self.log.borrow_mut().push(Event::Denoise {
            wait: wait.value,
            signal: signal.value,
            commands,
        });
        if !self.stalled {
            self.reached.set(signal.value);
        }
        Ok(())
    }

    fn share_buffers(&self, buffers: &DenoiserBindings<MockMemory>) -> Result<(), RenderError> {
        let sizes = [
            buffers.radiance.size,
            buffers.albedo.size,
            buffers.normal.size,
            buffers.flow.size,
            buffers.output.size,
        ];
        self.log.borrow_mut().push(Event::ShareBuffers(sizes));
        Ok(())
    }

    fn wait_until(&self, wait: TimelineWait<'_, ()>) -> Result<(), RenderError> {
        self.log.borrow_mut().push(Event::SecondaryDrain(wait.value));
        if wait.value > self.reached.get() {
            return Err(RenderError::DeviceLost {
                what: "denoiser device",
                timeout: SECONDARY_TIMEOUT,
            });
        }
        Ok(())
    }
}

pub struct MockKernel {
    pub log: EventLog,
}

impl DenoiseKernel<MockSecondary> for MockKernel {
    fn prepare(
        &mut self,
        _secondary: &MockSecondary,
        buffers: DenoiserBindings<MockMemory>,
        extent: [u32; 2],
    ) -> Result<(), RenderError> {
        let texels = extent[0] as u64 * extent[1] as u64;
        assert_eq!(buffers.flow.size, texels * 8);
        assert_eq!(buffers.output.size, texels * 16);
        self.log.borrow_mut().push(Event::PrepareKernel(extent));
        Ok(())
    }

    fn record(
        &self,
        commands: &mut Vec<String>,
        settings: &DenoiseSettings,
        frame: &Frame,
    ) -> Result<(), RenderError> {
        commands.push(format!(
            "filter radius {} iteration {}",
            settings.filter_radius, frame.iteration_count
        ));
        Ok(())
    }
}

/// Closes leftover descriptors and counts them.
pub struct CountingPlatform {
    pub closed: Rc<Cell<u32>>,
}

impl PlatformHandle for CountingPlatform {
    fn kind(&self) -> HandleKind {
        HandleKind::OpaqueFd
    }

    fn close(&self, handle: NativeHandle) -> io::Result<()> {
        self.closed.set(self.closed.get() + 1);
        drop(handle);
        Ok(())
    }
}

pub fn mock_bridge(
    log: &EventLog,
    closed: &Rc<Cell<u32>>,
) -> CrossDeviceBridge<MockExporter, MockSecondary> {
    CrossDeviceBridge::new(
        MockExporter::new(),
        MockSecondary::new(log),
        Box::new(CountingPlatform {
            closed: closed.clone(),
        }),
    )
}

pub type MockDenoiser = CrossDeviceDenoiser<MockExporter, MockSecondary, MockKernel>;

pub fn mock_denoiser(log: &EventLog) -> MockDenoiser {
    denoiser_on(MockSecondary::new(log))
}

/// A denoiser whose secondary device never finishes anything.
pub fn stalled_denoiser(log: &EventLog) -> MockDenoiser {
    let mut secondary = MockSecondary::new(log);
    secondary.stalled = true;
    denoiser_on(secondary)
}

fn denoiser_on(secondary: MockSecondary) -> MockDenoiser {
    let log = secondary.log.clone();
    let bridge = CrossDeviceBridge::new(
        MockExporter::new(),
        secondary,
        Box::new(CountingPlatform {
            closed: Rc::new(Cell::new(0)),
        }),
    );
    CrossDeviceDenoiser::new(bridge, MockKernel { log }).expect("linking the mock semaphores")
}

/// An orchestrator over a [`MockBackend`] with a surface of `surface`.
pub fn orchestrator(
    surface: [u32; 2],
    denoise: bool,
) -> (FrameOrchestrator<MockBackend>, EventLog) {
    let log = event_log();
    let denoiser: Option<BoxedDenoiser<MockBackend>> = if denoise {
        Some(Box::new(mock_denoiser(&log)))
    } else {
        None
    };
    let orchestrator =
        FrameOrchestrator::setup(MockBackend::new(&log, surface), config(denoise), denoiser)
            .expect("setting up the orchestrator");
    (orchestrator, log)
}

pub fn take_events(log: &EventLog) -> Vec<Event> {
    std::mem::take(&mut *log.borrow_mut())
}
