//! Progressive accumulation bookkeeping.
//!
//! The accumulation buffer holds the running average of every radiance sample traced since the
//! last reset. It is mutated in place by the ray trace stage, which is why only one frame is
//! ever in flight. Whether a frame blends into the buffer or overwrites it is decided here and
//! handed to the shader through [`Frame`].

use crate::error::RenderError;

use super::frame::Frame;

/// Anything that covers the render target and must be recreated when it changes size.
pub trait SizedResource {
    fn extent(&self) -> [u32; 2];
}

pub struct AccumulationState<B> {
    frame: Frame,
    buffer: B,
}

impl<B: SizedResource> AccumulationState<B> {
    /// Takes ownership of a freshly allocated buffer; the first frame always discards it.
    pub fn new(buffer: B) -> AccumulationState<B> {
        AccumulationState {
            frame: Frame::default(),
            buffer,
        }
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    pub fn buffer(&self) -> &B {
        &self.buffer
    }

    pub fn extent(&self) -> [u32; 2] {
        self.buffer.extent()
    }

    /// The camera moved or a view parameter was overridden: samples gathered so far are
    /// no longer valid.
    pub fn on_view_changed(&mut self) {
        self.frame.changed = true;
        self.frame.iteration_count = 0;
    }

    /// Replaces the buffer with one allocated at the new size.
    ///
    /// The old buffer is dropped only after the new one was allocated, so a failed allocation
    /// leaves the state untouched.
    pub fn on_resize(
        &mut self,
        extent: [u32; 2],
        allocate: impl FnOnce([u32; 2]) -> Result<B, RenderError>,
    ) -> Result<(), RenderError> {
        let buffer = allocate(extent)?;
        debug_assert_eq!(buffer.extent(), extent);
        self.buffer = buffer;
        self.on_view_changed();
        Ok(())
    }

    pub fn on_frame_presented(&mut self) {
        self.frame.index += 1;
        self.frame.iteration_count += 1;
        self.frame.changed = false;
    }
}

/// Weight of the newest sample in the running average.
pub fn sample_weight(frame: &Frame) -> f32 {
    if frame.changed {
        1.0
    } else {
        1.0 / (frame.iteration_count as f32 + 1.0)
    }
}

/// Host-side twin of the blend in the ray generation shader.
pub fn blend(previous: [f32; 4], sample: [f32; 4], frame: &Frame) -> [f32; 4] {
    let w = sample_weight(frame);
    let mut out = [0.0; 4];
    for i in 0..4 {
        out[i] = previous[i] + (sample[i] - previous[i]) * w;
    }
    out
}
