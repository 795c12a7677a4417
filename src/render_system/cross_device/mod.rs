//! Sharing of buffers and timeline semaphores between the rendering device and the secondary
//! device that runs the denoiser.
//!
//! Everything shared is allocated on the primary device with export support, exported as a
//! platform handle and imported on the secondary device. The two devices synchronize through the
//! values of the linked timeline semaphores, and hand the buffers to each other through
//! ownership transfers the secondary device records once per buffer set
//! ([`SecondaryDevice::share_buffers`]).

mod denoiser;
mod platform;

pub use denoiser::{CrossDeviceDenoiser, DenoiseKernel};
pub use platform::{ExportSource, HandleKind, NativeHandle, PlatformHandle, select_platform};

use crate::error::RenderError;

use super::{
    accumulation::SizedResource,
    timeline::{TimelineSignal, TimelineWait},
};

/// A primary device allocation that can be shared with the secondary device.
pub trait SharedAllocation: ExportSource + SizedResource + Clone {
    fn allocation_size(&self) -> u64;
}

/// The rendering device side of the bridge.
pub trait PrimaryExporter {
    type Buffer: SharedAllocation;
    type Semaphore: ExportSource;

    /// A timeline semaphore starting at 0, exportable as `kind`.
    fn create_exportable_timeline(&self, kind: HandleKind)
    -> Result<Self::Semaphore, RenderError>;

    fn allocate_exportable_buffer(
        &self,
        extent: [u32; 2],
        texel_size: u32,
        kind: HandleKind,
    ) -> Result<Self::Buffer, RenderError>;
}

/// Result of handing a native handle to the secondary device. Drivers keep some handles open
/// after importing them (and every handle when the import fails); those come back in
/// `leftover` and must be closed by the caller.
pub struct Import<T> {
    pub result: Result<T, RenderError>,
    pub leftover: Option<NativeHandle>,
}

/// The secondary device context. Owned by the bridge and passed explicitly to every
/// operation that touches it.
pub trait SecondaryDevice {
    type Memory: Clone;
    type Semaphore;
    type Commands;

    fn import_memory(&self, handle: NativeHandle, size: u64) -> Import<Self::Memory>;

    fn import_semaphore(&self, handle: NativeHandle) -> Import<Self::Semaphore>;

    /// Records commands with `record` and submits them so that they start after `wait` and
    /// `signal` fires once they are done. Returns after enqueueing.
    fn submit(
        &self,
        wait: TimelineWait<'_, Self::Semaphore>,
        signal: TimelineSignal<'_, Self::Semaphore>,
        record: &mut dyn FnMut(&mut Self::Commands) -> Result<(), RenderError>,
    ) -> Result<(), RenderError>;

    /// Called once per buffer set after every role was imported.
    fn share_buffers(&self, buffers: &DenoiserBindings<Self::Memory>) -> Result<(), RenderError>;

    /// Blocks until `wait.semaphore` reaches `wait.value`. The wait is bounded by the device's
    /// timeout, running past it is [`RenderError::DeviceLost`].
    fn wait_until(&self, wait: TimelineWait<'_, Self::Semaphore>) -> Result<(), RenderError>;
}

/// A timeline semaphore living on both devices.
pub struct ExternalSemaphore<L, R> {
    name: &'static str,
    local: L,
    imported: R,
    kind: HandleKind,
    counter: u64,
}

impl<L, R> ExternalSemaphore<L, R> {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The primary device side.
    pub fn local(&self) -> &L {
        &self.local
    }

    pub fn imported(&self) -> &R {
        &self.imported
    }

    pub fn kind(&self) -> HandleKind {
        self.kind
    }

    /// Highest value any submitted work will signal.
    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// Records that submitted work will set the semaphore to `value`.
    pub fn schedule_signal(&mut self, value: u64) -> Result<(), RenderError> {
        if value <= self.counter {
            return Err(RenderError::TimelineRegression {
                semaphore: self.name,
                value,
                last: self.counter,
            });
        }
        self.counter = value;
        Ok(())
    }
}

/// Resources shared between the devices, one per role.
#[derive(Clone, Debug, PartialEq)]
pub struct DenoiserBindings<T> {
    pub radiance: T,
    pub albedo: T,
    pub normal: T,
    pub flow: T,
    pub output: T,
}

impl<T> DenoiserBindings<T> {
    pub fn try_map<U>(
        self,
        mut f: impl FnMut(&'static str, T) -> Result<U, RenderError>,
    ) -> Result<DenoiserBindings<U>, RenderError> {
        Ok(DenoiserBindings {
            radiance: f("radiance", self.radiance)?,
            albedo: f("albedo", self.albedo)?,
            normal: f("normal", self.normal)?,
            flow: f("flow", self.flow)?,
            output: f("output", self.output)?,
        })
    }

    pub fn as_ref(&self) -> DenoiserBindings<&T> {
        DenoiserBindings {
            radiance: &self.radiance,
            albedo: &self.albedo,
            normal: &self.normal,
            flow: &self.flow,
            output: &self.output,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        [
            &self.radiance,
            &self.albedo,
            &self.normal,
            &self.flow,
            &self.output,
        ]
        .into_iter()
    }
}

/// Bytes per texel of every shared buffer.
pub const DENOISER_TEXEL_SIZES: DenoiserBindings<u32> = DenoiserBindings {
    radiance: 16,
    albedo: 16,
    normal: 16,
    flow: 8,
    output: 16,
};

pub struct SharedBuffer<B, M> {
    pub primary: B,
    pub secondary: M,
}

/// The shared buffers of the denoiser at one render size.
pub struct DenoiserBufferSet<B, M> {
    extent: [u32; 2],
    buffers: DenoiserBindings<SharedBuffer<B, M>>,
}

impl<B: SizedResource + Clone, M: Clone> DenoiserBufferSet<B, M> {
    pub fn extent(&self) -> [u32; 2] {
        self.extent
    }

    /// The primary device buffers, bound by the ray trace and post-process stages.
    pub fn primary(&self) -> DenoiserBindings<B> {
        let b = self.buffers.as_ref();
        DenoiserBindings {
            radiance: b.radiance.primary.clone(),
            albedo: b.albedo.primary.clone(),
            normal: b.normal.primary.clone(),
            flow: b.flow.primary.clone(),
            output: b.output.primary.clone(),
        }
    }

    /// The same buffers as seen by the secondary device.
    pub fn secondary(&self) -> DenoiserBindings<M> {
        let b = self.buffers.as_ref();
        DenoiserBindings {
            radiance: b.radiance.secondary.clone(),
            albedo: b.albedo.secondary.clone(),
            normal: b.normal.secondary.clone(),
            flow: b.flow.secondary.clone(),
            output: b.output.secondary.clone(),
        }
    }

    pub fn extents(&self) -> impl Iterator<Item = [u32; 2]> + '_ {
        self.buffers.iter().map(|b| b.primary.extent())
    }
}

pub struct CrossDeviceBridge<P: PrimaryExporter, S: SecondaryDevice> {
    primary: P,
    secondary: S,
    platform: Box<dyn PlatformHandle>,
    buffers: Option<DenoiserBufferSet<P::Buffer, S::Memory>>,
}

impl<P: PrimaryExporter, S: SecondaryDevice> CrossDeviceBridge<P, S> {
    pub fn new(
        primary: P,
        secondary: S,
        platform: Box<dyn PlatformHandle>,
    ) -> CrossDeviceBridge<P, S> {
        CrossDeviceBridge {
            primary,
            secondary,
            platform,
            buffers: None,
        }
    }

    pub fn primary(&self) -> &P {
        &self.primary
    }

    pub fn secondary(&self) -> &S {
        &self.secondary
    }

    pub fn buffers(&self) -> Option<&DenoiserBufferSet<P::Buffer, S::Memory>> {
        self.buffers.as_ref()
    }

    /// Makes `buffer` visible to the secondary device.
    pub fn export_buffer(&self, what: &str, buffer: &P::Buffer) -> Result<S::Memory, RenderError> {
        let handle = self
            .platform
            .export_memory(buffer)
            .map_err(|e| match e {
                e @ RenderError::Export { .. } => e,
                e => RenderError::export(what, e),
            })?;
        let import = self
            .secondary
            .import_memory(handle, buffer.allocation_size());
        self.finish_import(what, import)
    }

    /// Creates a timeline semaphore on the primary device and links it to the secondary one.
    pub fn create_linked_semaphore(
        &self,
        name: &'static str,
    ) -> Result<ExternalSemaphore<P::Semaphore, S::Semaphore>, RenderError> {
        let kind = self.platform.kind();
        let local = self.primary.create_exportable_timeline(kind)?;
        let handle = self
            .platform
            .export_semaphore(&local)
            .map_err(|e| match e {
                e @ RenderError::Export { .. } => e,
                e => RenderError::export(name, e),
            })?;
        let imported = self.finish_import(name, self.secondary.import_semaphore(handle))?;
        log::debug!("linked timeline semaphore {name} through {kind:?}");
        Ok(ExternalSemaphore {
            name,
            local,
            imported,
            kind,
            counter: 0,
        })
    }

    /// Enqueues `work` on the secondary device between a wait for `wait` to reach `wait_value`
    /// and a signal of `signal` to `signal_value`.
    pub fn wait_then_signal(
        &self,
        wait: &ExternalSemaphore<P::Semaphore, S::Semaphore>,
        wait_value: u64,
        signal: &mut ExternalSemaphore<P::Semaphore, S::Semaphore>,
        signal_value: u64,
        mut work: impl FnMut(&mut S::Commands) -> Result<(), RenderError>,
    ) -> Result<(), RenderError> {
        if signal_value != wait_value + 1 {
            return Err(RenderError::TimelineHandoff {
                expected: wait_value + 1,
                actual: signal_value,
            });
        }
        if wait_value > wait.counter() {
            return Err(RenderError::UnsignaledWait {
                semaphore: wait.name(),
                value: wait_value,
                last: wait.counter(),
            });
        }
        signal.schedule_signal(signal_value)?;

        self.secondary.submit(
            TimelineWait {
                semaphore: wait.imported(),
                value: wait_value,
            },
            TimelineSignal {
                semaphore: signal.imported(),
                value: signal_value,
            },
            &mut work,
        )
    }

    /// Waits until the secondary device finished all work signalling `last`.
    pub fn drain(
        &self,
        last: &ExternalSemaphore<P::Semaphore, S::Semaphore>,
    ) -> Result<(), RenderError> {
        self.secondary.wait_until(TimelineWait {
            semaphore: last.imported(),
            value: last.counter(),
        })
    }

    /// Drains the secondary device up to `last` and replaces the shared buffers with ones of
    /// size `extent`.
    pub fn recreate_buffers(
        &mut self,
        extent: [u32; 2],
        last: &ExternalSemaphore<P::Semaphore, S::Semaphore>,
    ) -> Result<&DenoiserBufferSet<P::Buffer, S::Memory>, RenderError> {
        if extent[0] == 0 || extent[1] == 0 {
            return Err(RenderError::Allocation(format!(
                "cannot share {}x{} buffers with the secondary device",
                extent[0], extent[1]
            )));
        }
        self.drain(last)?;
        // release the old imports before allocating the new ones
        self.buffers = None;

        let kind = self.platform.kind();
        let buffers = DENOISER_TEXEL_SIZES.try_map(|what, texel_size| {
            let primary = self
                .primary
                .allocate_exportable_buffer(extent, texel_size, kind)?;
            let secondary = self.export_buffer(what, &primary)?;
            Ok(SharedBuffer { primary, secondary })
        })?;
        let set = DenoiserBufferSet { extent, buffers };
        self.secondary.share_buffers(&set.secondary())?;
        log::info!(
            "recreated denoiser buffers at {}x{}",
            extent[0],
            extent[1]
        );

        Ok(&*self.buffers.insert(set))
    }

    fn finish_import<T>(&self, what: &str, import: Import<T>) -> Result<T, RenderError> {
        if let Some(handle) = import.leftover {
            if let Err(e) = self.platform.close(handle) {
                log::warn!("failed to close the {what} handle: {e}");
            }
        }
        import.result.map_err(|e| match e {
            e @ RenderError::Import { .. } => e,
            e => RenderError::import(what, e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn semaphore(counter: u64) -> ExternalSemaphore<(), ()> {
        ExternalSemaphore {
            name: "test",
            local: (),
            imported: (),
            kind: HandleKind::OpaqueFd,
            counter,
        }
    }

    #[test]
    fn counter_only_moves_forward() {
        let mut s = semaphore(0);
        s.schedule_signal(1).unwrap();
        s.schedule_signal(3).unwrap();
        assert_eq!(s.counter(), 3);
        assert!(matches!(
            s.schedule_signal(3),
            Err(RenderError::TimelineRegression { value: 3, last: 3, .. })
        ));
        assert!(s.schedule_signal(2).is_err());
        assert_eq!(s.counter(), 3);
    }

    #[test]
    fn bindings_map_in_role_order() {
        let mut seen = vec![];
        let sizes = DENOISER_TEXEL_SIZES
            .try_map(|what, size| {
                seen.push(what);
                Ok(size * 2)
            })
            .unwrap();
        assert_eq!(seen, ["radiance", "albedo", "normal", "flow", "output"]);
        assert_eq!(sizes.flow, 16);
        assert_eq!(sizes.iter().count(), 5);
    }
}
