// alpha tested geometry: texels with alpha below one half are holes
vulkano_shaders::shader! {
    ty: "anyhit",
    vulkan_version: "1.2",
    spirv_version: "1.4",
    src: r"
#version 460
#extension GL_EXT_ray_tracing: require
#extension GL_EXT_scalar_block_layout: require
#extension GL_EXT_nonuniform_qualifier: require

struct Vertex {
    vec3 position;
    uint material;
    vec2 uv;
};

struct InstanceData {
    uint vertex_offset;
    uint index_offset;
};

struct Material {
    vec3 albedo;
    int texture;
    vec3 emission;
    float pad;
};

hitAttributeEXT vec2 bary;

layout(set = 2, binding = 0, scalar) readonly restrict buffer Vertices {
    Vertex vertices[];
};

layout(set = 2, binding = 1, scalar) readonly restrict buffer Indices {
    uint indices[];
};

layout(set = 2, binding = 2, scalar) readonly restrict buffer Instances {
    InstanceData instances[];
};

layout(set = 3, binding = 0, scalar) readonly restrict buffer Materials {
    Material materials[];
};

layout(set = 3, binding = 1) uniform sampler texture_sampler;
layout(set = 3, binding = 2) uniform texture2D textures[];

void main() {
    InstanceData instance = instances[gl_InstanceCustomIndexEXT];
    uint base = instance.index_offset + 3 * gl_PrimitiveID;
    Vertex v0 = vertices[instance.vertex_offset + indices[base]];
    Vertex v1 = vertices[instance.vertex_offset + indices[base + 1]];
    Vertex v2 = vertices[instance.vertex_offset + indices[base + 2]];

    Material material = materials[v0.material];
    if (material.texture < 0) {
        return;
    }

    vec3 w = vec3(1.0 - bary.x - bary.y, bary.x, bary.y);
    vec2 uv = v0.uv * w.x + v1.uv * w.y + v2.uv * w.z;
    float alpha = textureLod(
        sampler2D(textures[nonuniformEXT(material.texture)], texture_sampler),
        uv,
        0.0
    ).a;
    if (alpha < 0.5) {
        ignoreIntersectionEXT;
    }
}
",
}
