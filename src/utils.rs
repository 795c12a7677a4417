use nalgebra::{Point2, Point3, Vector3};

use crate::render_system::vertex::Vertex3D;

/// Indexed triangle list, indices relative to the first vertex.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Mesh {
    pub vertices: Vec<Vertex3D>,
    pub indices: Vec<u32>,
}

impl Mesh {
    pub fn triangle_count(&self) -> u32 {
        self.indices.len() as u32 / 3
    }

    /// Appends `other`, rebasing its indices.
    pub fn extend(&mut self, other: Mesh) {
        let base = self.vertices.len() as u32;
        self.vertices.extend(other.vertices);
        self.indices.extend(other.indices.into_iter().map(|i| i + base));
    }
}

/// A parallelogram spanned by `edge_a` and `edge_b` from `corner`, facing
/// `edge_a x edge_b`.
pub fn quad(corner: Point3<f32>, edge_a: Vector3<f32>, edge_b: Vector3<f32>, material: u32) -> Mesh {
    let v = |p: Point3<f32>, uv: [f32; 2]| Vertex3D::new(p.into(), material, uv);
    Mesh {
        vertices: vec![
            v(corner, [0.0, 0.0]),
            v(corner + edge_a, [1.0, 0.0]),
            v(corner + edge_a + edge_b, [1.0, 1.0]),
            v(corner + edge_b, [0.0, 1.0]),
        ],
        indices: vec![0, 1, 2, 0, 2, 3],
    }
}

/// An axis aligned box centered on `loc`, faces pointing outwards.
pub fn cuboid(loc: Point3<f32>, dims: Vector3<f32>, material: u32) -> Mesh {
    let min = loc - 0.5 * dims;
    let x = Vector3::new(dims.x, 0.0, 0.0);
    let y = Vector3::new(0.0, dims.y, 0.0);
    let z = Vector3::new(0.0, 0.0, dims.z);

    let mut mesh = Mesh::default();
    // left, right
    mesh.extend(quad(min, z, y, material));
    mesh.extend(quad(min + x, y, z, material));
    // lower, upper
    mesh.extend(quad(min, x, z, material));
    mesh.extend(quad(min + y, z, x, material));
    // back, front
    mesh.extend(quad(min, y, x, material));
    mesh.extend(quad(min + z, x, y, material));
    mesh
}

/// Maps a cursor position in pixels to [-1, 1] on both axes.
pub fn get_normalized_mouse_coords(e: Point2<f32>, extent: [u32; 2]) -> Point2<f32> {
    let trackball_radius = extent[0].min(extent[1]).max(1) as f32;
    let center = Point2::new(extent[0] as f32 / 2.0, extent[1] as f32 / 2.0);
    Point2::new(
        (e.x - center.x) / trackball_radius * 2.0,
        (center.y - e.y) / trackball_radius * 2.0,
    )
}
