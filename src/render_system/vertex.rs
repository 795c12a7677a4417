use vulkano::{buffer::BufferContents, pipeline::graphics::vertex_input::Vertex};

#[derive(Clone, Copy, Debug, BufferContents, Vertex, Default, PartialEq)]
#[repr(C)]
pub struct Vertex3D {
    #[format(R32G32B32_SFLOAT)]
    pub position: [f32; 3],
    #[format(R32_UINT)]
    pub material: u32,
    #[format(R32G32_SFLOAT)]
    pub uv: [f32; 2],
}

impl Vertex3D {
    pub fn new(position: [f32; 3], material: u32, uv: [f32; 2]) -> Vertex3D {
        Vertex3D {
            position,
            material,
            uv,
        }
    }
}

/// Where an instance's triangles live in the shared vertex and index buffers.
#[derive(Clone, Copy, Debug, BufferContents, PartialEq, Eq)]
#[repr(C)]
pub struct InstanceData {
    pub vertex_offset: u32,
    pub index_offset: u32,
}

#[derive(Clone, Copy, Debug, BufferContents, PartialEq)]
#[repr(C)]
pub struct MaterialData {
    pub albedo: [f32; 3],
    /// index into the texture array, -1 when untextured
    pub texture: i32,
    pub emission: [f32; 3],
    pub _pad: f32,
}

impl MaterialData {
    pub fn diffuse(albedo: [f32; 3], texture: Option<u32>) -> MaterialData {
        MaterialData {
            albedo,
            texture: texture.map_or(-1, |t| t as i32),
            emission: [0.0; 3],
            _pad: 0.0,
        }
    }

    pub fn emissive(emission: [f32; 3]) -> MaterialData {
        MaterialData {
            albedo: [0.0; 3],
            texture: -1,
            emission,
            _pad: 0.0,
        }
    }
}

/// A rectangular area light sampled for next event estimation.
#[derive(Clone, Copy, Debug, BufferContents, PartialEq)]
#[repr(C)]
pub struct LightQuad {
    pub corner: [f32; 3],
    pub area: f32,
    pub edge_a: [f32; 3],
    pub _pad0: f32,
    pub edge_b: [f32; 3],
    pub _pad1: f32,
    pub emission: [f32; 3],
    pub _pad2: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layouts_match_the_shader_blocks() {
        assert_eq!(std::mem::size_of::<Vertex3D>(), 24);
        assert_eq!(std::mem::size_of::<InstanceData>(), 8);
        assert_eq!(std::mem::size_of::<MaterialData>(), 32);
        assert_eq!(std::mem::size_of::<LightQuad>(), 64);
    }

    #[test]
    fn untextured_materials_use_a_negative_index() {
        assert_eq!(MaterialData::diffuse([1.0; 3], None).texture, -1);
        assert_eq!(MaterialData::diffuse([1.0; 3], Some(2)).texture, 2);
    }
}
