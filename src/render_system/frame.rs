use nalgebra::{Matrix4, Vector3};
use vulkano::buffer::BufferContents;

/// Progress of the current accumulation run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Frame {
    /// number of frames presented since startup
    pub index: u64,
    /// samples accumulated since the last reset
    pub iteration_count: u32,
    /// the ray trace stage must discard the accumulation buffer
    pub changed: bool,
}

impl Default for Frame {
    fn default() -> Self {
        Frame {
            index: 0,
            iteration_count: 0,
            changed: true,
        }
    }
}

/// View and projection of the camera for one frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CameraMatrices {
    pub view: Matrix4<f32>,
    pub projection: Matrix4<f32>,
}

impl Default for CameraMatrices {
    fn default() -> Self {
        CameraMatrices {
            view: Matrix4::identity(),
            projection: Matrix4::identity(),
        }
    }
}

/// Per-frame uniform block, laid out for std140 (`set = 1, binding = 0` of the ray trace stage).
#[derive(Clone, Copy, Debug, BufferContents)]
#[repr(C)]
pub struct SceneUniformData {
    pub view_inverse: [[f32; 4]; 4],
    pub projection_inverse: [[f32; 4]; 4],
    pub previous_view: [[f32; 4]; 4],
    pub previous_projection: [[f32; 4]; 4],
    // xyz: direction towards the sun, w: 1 when overridden
    pub sun_direction: [f32; 4],
    pub exposure_adjustment: f32,
    pub frame: u32,
    pub iteration: u32,
    pub changed: u32,
    pub max_depth: u32,
    pub samples_per_frame: u32,
    pub denoise: u32,
    pub _pad: u32,
}

impl Default for SceneUniformData {
    fn default() -> Self {
        let identity: [[f32; 4]; 4] = Matrix4::<f32>::identity().into();
        SceneUniformData {
            view_inverse: identity,
            projection_inverse: identity,
            previous_view: identity,
            previous_projection: identity,
            sun_direction: [0.0, 1.0, 0.0, 0.0],
            exposure_adjustment: 0.0,
            frame: 0,
            iteration: 0,
            changed: 1,
            max_depth: 1,
            samples_per_frame: 1,
            denoise: 0,
            _pad: 0,
        }
    }
}

impl SceneUniformData {
    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn changed(&self) -> bool {
        self.changed != 0
    }
}

/// Inputs of [`SceneUniformData::compose`].
pub struct UniformInputs<'a> {
    pub frame: &'a Frame,
    pub camera: &'a CameraMatrices,
    pub previous: &'a CameraMatrices,
    pub sun_override: Option<Vector3<f32>>,
    pub exposure_adjustment: f32,
    pub max_depth: u32,
    pub samples_per_frame: u32,
    pub denoise: bool,
}

impl SceneUniformData {
    pub fn compose(inputs: UniformInputs<'_>) -> SceneUniformData {
        // a singular camera matrix means a broken camera, render from the origin instead
        let invert = |m: &Matrix4<f32>| m.try_inverse().unwrap_or_else(Matrix4::identity);

        let sun_direction = match inputs.sun_override {
            Some(dir) => {
                let dir = dir.normalize();
                [dir.x, dir.y, dir.z, 1.0]
            }
            None => [0.0, 1.0, 0.0, 0.0],
        };

        SceneUniformData {
            view_inverse: invert(&inputs.camera.view).into(),
            projection_inverse: invert(&inputs.camera.projection).into(),
            previous_view: inputs.previous.view.into(),
            previous_projection: inputs.previous.projection.into(),
            sun_direction,
            exposure_adjustment: inputs.exposure_adjustment,
            // the shader only uses the frame index as a seed
            frame: inputs.frame.index as u32,
            iteration: inputs.frame.iteration_count,
            changed: inputs.frame.changed as u32,
            max_depth: inputs.max_depth,
            samples_per_frame: inputs.samples_per_frame,
            denoise: inputs.denoise as u32,
            _pad: 0,
        }
    }
}
