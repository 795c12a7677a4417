vulkano_shaders::shader! {
    ty: "miss",
    vulkan_version: "1.2",
    spirv_version: "1.4",
    src: r"
#version 460
#extension GL_EXT_ray_tracing: require

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

layout(location = 0) rayPayloadInEXT HitPayload payload;

void main() {
    vec3 d = normalize(gl_WorldRayDirectionEXT);
    float up = 0.5 * (d.y + 1.0);

    payload.t = -1.0;
    payload.position = vec3(0.0);
    payload.normal = -d;
    payload.albedo = vec3(1.0);
    payload.emission = mix(vec3(0.9, 0.9, 0.85), vec3(0.45, 0.65, 1.0), up) * 0.7;
}
",
}
