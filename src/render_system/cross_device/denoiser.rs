use crate::{config::DenoiseSettings, error::RenderError};

use super::{
    CrossDeviceBridge, DenoiserBindings, ExternalSemaphore, PrimaryExporter, SecondaryDevice,
};
use crate::render_system::{frame::Frame, orchestrator::DenoiseStage};

/// The filter run on the secondary device.
pub trait DenoiseKernel<S: SecondaryDevice> {
    /// Called whenever the shared buffers were recreated.
    fn prepare(
        &mut self,
        secondary: &S,
        buffers: DenoiserBindings<S::Memory>,
        extent: [u32; 2],
    ) -> Result<(), RenderError>;

    fn record(
        &self,
        commands: &mut S::Commands,
        settings: &DenoiseSettings,
        frame: &Frame,
    ) -> Result<(), RenderError>;
}

/// Denoise stage running `K` on the secondary device of a [`CrossDeviceBridge`].
pub struct CrossDeviceDenoiser<P: PrimaryExporter, S: SecondaryDevice, K> {
    bridge: CrossDeviceBridge<P, S>,
    kernel: K,
    ray_traced: ExternalSemaphore<P::Semaphore, S::Semaphore>,
    denoised: ExternalSemaphore<P::Semaphore, S::Semaphore>,
}

impl<P, S, K> CrossDeviceDenoiser<P, S, K>
where
    P: PrimaryExporter,
    S: SecondaryDevice,
    K: DenoiseKernel<S>,
{
    pub fn new(
        bridge: CrossDeviceBridge<P, S>,
        kernel: K,
    ) -> Result<CrossDeviceDenoiser<P, S, K>, RenderError> {
        let ray_traced = bridge.create_linked_semaphore("ray_traced")?;
        let denoised = bridge.create_linked_semaphore("denoised")?;
        Ok(CrossDeviceDenoiser {
            bridge,
            kernel,
            ray_traced,
            denoised,
        })
    }

    pub fn bridge(&self) -> &CrossDeviceBridge<P, S> {
        &self.bridge
    }

    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    pub fn ray_traced(&self) -> &ExternalSemaphore<P::Semaphore, S::Semaphore> {
        &self.ray_traced
    }

    pub fn denoised(&self) -> &ExternalSemaphore<P::Semaphore, S::Semaphore> {
        &self.denoised
    }
}

impl<P, S, K> DenoiseStage for CrossDeviceDenoiser<P, S, K>
where
    P: PrimaryExporter,
    S: SecondaryDevice,
    K: DenoiseKernel<S>,
{
    type Semaphore = P::Semaphore;
    type Buffer = P::Buffer;

    fn ray_trace_semaphore(&self) -> &P::Semaphore {
        self.ray_traced.local()
    }

    fn denoised_semaphore(&self) -> &P::Semaphore {
        self.denoised.local()
    }

    fn bindings(&self) -> Option<DenoiserBindings<P::Buffer>> {
        self.bridge.buffers().map(|b| b.primary())
    }

    fn denoise(
        &mut self,
        wait_value: u64,
        signal_value: u64,
        settings: &DenoiseSettings,
        frame: &Frame,
    ) -> Result<(), RenderError> {
        // the primary device signals this value at the end of the ray trace just submitted
        self.ray_traced.schedule_signal(wait_value)?;

        let kernel = &self.kernel;
        self.bridge.wait_then_signal(
            &self.ray_traced,
            wait_value,
            &mut self.denoised,
            signal_value,
            |commands| kernel.record(commands, settings, frame),
        )
    }

    fn resize(&mut self, extent: [u32; 2]) -> Result<(), RenderError> {
        let buffers = self
            .bridge
            .recreate_buffers(extent, &self.denoised)?
            .secondary();
        self.kernel
            .prepare(self.bridge.secondary(), buffers, extent)
    }
}

impl<P: PrimaryExporter, S: SecondaryDevice, K> Drop for CrossDeviceDenoiser<P, S, K> {
    fn drop(&mut self) {
        if let Err(e) = self.bridge.drain(&self.denoised) {
            log::warn!("failed to drain the denoiser device: {e}");
        }
    }
}
