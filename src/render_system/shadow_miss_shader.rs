vulkano_shaders::shader! {
    ty: "miss",
    vulkan_version: "1.2",
    spirv_version: "1.4",
    src: r"
#version 460
#extension GL_EXT_ray_tracing: require

layout(location = 1) rayPayloadInEXT uint shadow_visible;

void main() {
    shadow_visible = 1u;
}
",
}
