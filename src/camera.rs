use nalgebra::{Matrix4, Point2, Point3, Vector3};
use winit::event::{ElementState, MouseButton, MouseScrollDelta, WindowEvent};

use crate::{render_system::frame::CameraMatrices, utils};

#[inline]
fn deg2rad(deg: f32) -> f32 {
    deg * std::f32::consts::PI / 180.0
}

pub trait Camera {
    fn eye_front_right_up(&self) -> (Point3<f32>, Vector3<f32>, Vector3<f32>, Vector3<f32>);

    /// View and projection for a target of size `extent`.
    fn matrices(&self, extent: [u32; 2]) -> CameraMatrices;
}

pub trait InteractiveCamera: Camera {
    fn handle_event(&mut self, extent: [u32; 2], event: &WindowEvent);
}

// lets you orbit around the central point by clicking and dragging
pub struct SphericalCamera {
    // point the camera orbits around
    root_pos: Point3<f32>,
    worldup: Vector3<f32>,
    // distance from the root position
    offset: f32,
    pitch: f32,
    yaw: f32,
    // vertical field of view in radians
    fovy: f32,

    mouse_down: bool,
    mouse_prev: Point2<f32>,
    mouse_curr: Point2<f32>,
}

impl SphericalCamera {
    pub fn new(root_pos: Point3<f32>, offset: f32) -> SphericalCamera {
        SphericalCamera {
            root_pos,
            worldup: Vector3::y(),
            offset,
            pitch: deg2rad(-15.0),
            yaw: deg2rad(-90.0),
            fovy: deg2rad(60.0),
            mouse_down: false,
            mouse_prev: Point2::origin(),
            mouse_curr: Point2::origin(),
        }
    }

    fn front(&self) -> Vector3<f32> {
        Vector3::new(
            self.yaw.cos() * self.pitch.cos(),
            self.pitch.sin(),
            self.yaw.sin() * self.pitch.cos(),
        )
        .normalize()
    }

    /// Rotates by a cursor movement in normalized coordinates.
    pub fn drag(&mut self, from: Point2<f32>, to: Point2<f32>) {
        self.yaw += (to.x - from.x) * 2.0;
        self.pitch = (self.pitch + (to.y - from.y) * 2.0).clamp(-deg2rad(89.0), deg2rad(89.0));
    }

    pub fn zoom(&mut self, lines: f32) {
        self.offset = (self.offset - lines).max(0.5);
    }
}

impl Camera for SphericalCamera {
    // returns eye, front, right, up
    fn eye_front_right_up(&self) -> (Point3<f32>, Vector3<f32>, Vector3<f32>, Vector3<f32>) {
        let front = self.front();
        let right = front.cross(&self.worldup).normalize();
        let up = right.cross(&front).normalize();
        let eye = self.root_pos - self.offset * front;
        (eye, front, right, up)
    }

    fn matrices(&self, extent: [u32; 2]) -> CameraMatrices {
        let (eye, _, _, up) = self.eye_front_right_up();
        let aspect = extent[0].max(1) as f32 / extent[1].max(1) as f32;
        CameraMatrices {
            view: Matrix4::look_at_rh(&eye, &self.root_pos, &up),
            projection: Matrix4::new_perspective(aspect, self.fovy, 0.05, 1000.0),
        }
    }
}

impl InteractiveCamera for SphericalCamera {
    fn handle_event(&mut self, extent: [u32; 2], event: &WindowEvent) {
        match event {
            WindowEvent::MouseInput {
                state,
                button: MouseButton::Left,
                ..
            } => {
                self.mouse_down = *state == ElementState::Pressed;
            }
            WindowEvent::CursorMoved { position, .. } => {
                self.mouse_prev = self.mouse_curr;
                self.mouse_curr = utils::get_normalized_mouse_coords(
                    Point2::new(position.x as f32, position.y as f32),
                    extent,
                );
                if self.mouse_down {
                    self.drag(self.mouse_prev, self.mouse_curr);
                }
            }
            WindowEvent::MouseWheel {
                delta: MouseScrollDelta::LineDelta(_, y),
                ..
            } => self.zoom(*y),
            WindowEvent::MouseWheel {
                delta: MouseScrollDelta::PixelDelta(p),
                ..
            } => self.zoom(p.y as f32 / 40.0),
            _ => {}
        }
    }
}
