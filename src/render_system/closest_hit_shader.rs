vulkano_shaders::shader! {
    ty: "closesthit",
    vulkan_version: "1.2",
    spirv_version: "1.4",
    src: r"
#version 460
#extension GL_EXT_ray_tracing: require
#extension GL_EXT_scalar_block_layout: require
#extension GL_EXT_nonuniform_qualifier: require

struct HitPayload {
    vec3 position;
    float t;
    vec3 normal;
    uint material;
    vec3 albedo;
    float pad0;
    vec3 emission;
    float pad1;
};

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
    // -1 when untextured
    int texture;
    vec3 emission;
    float pad;
};

layout(location = 0) rayPayloadInEXT HitPayload payload;
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

    vec3 w = vec3(1.0 - bary.x - bary.y, bary.x, bary.y);
    vec2 uv = v0.uv * w.x + v1.uv * w.y + v2.uv * w.z;

    vec3 object_normal = normalize(cross(v1.position - v0.position, v2.position - v0.position));
    vec3 normal = normalize((object_normal * gl_WorldToObjectEXT).xyz);

    Material material = materials[v0.material];
    vec3 albedo = material.albedo;
    if (material.texture >= 0) {
        albedo *= textureLod(
            sampler2D(textures[nonuniformEXT(material.texture)], texture_sampler),
            uv,
            0.0
        ).rgb;
    }

    payload.position = gl_WorldRayOriginEXT + gl_WorldRayDirectionEXT * gl_HitTEXT;
    payload.t = gl_HitTEXT;
    payload.normal = normal;
    payload.material = v0.material;
    payload.albedo = albedo;
    payload.emission = material.emission;
}
",
}
