vulkano_shaders::shader! {
    ty: "compute",
    linalg_type: "nalgebra",
    vulkan_version: "1.2",
    spirv_version: "1.3",
    src: r"
#version 460
#extension GL_EXT_scalar_block_layout: require

layout(local_size_x = 16, local_size_y = 16, local_size_z = 1) in;

layout(set = 0, binding = 0, scalar) readonly restrict buffer Accumulation {
    vec4 accumulation[];
};

layout(set = 0, binding = 1, scalar) readonly restrict buffer Denoised {
    vec4 denoised[];
};

layout(set = 0, binding = 2, scalar) readonly restrict buffer Exposure {
    float average_log_luminance;
    float exposure;
};

// one B8G8R8A8 texel per element, copied to the swapchain image afterwards
layout(set = 0, binding = 3, scalar) writeonly restrict buffer Output {
    uint output_texels[];
};

layout(push_constant, scalar) uniform PushConstants {
    uint xsize;
    uint ysize;
    uint use_denoised;
    // in stops
    float exposure_adjustment;
    uint auto_exposure;
};

vec3 aces(vec3 x) {
    const float a = 2.51;
    const float b = 0.03;
    const float c = 2.43;
    const float d = 0.59;
    const float e = 0.14;
    return clamp((x * (a * x + b)) / (x * (c * x + d) + e), 0.0, 1.0);
}

vec3 srgb_encode(vec3 linear) {
    vec3 low = linear * 12.92;
    vec3 high = 1.055 * pow(linear, vec3(1.0 / 2.4)) - 0.055;
    return mix(high, low, lessThanEqual(linear, vec3(0.0031308)));
}

void main() {
    if (gl_GlobalInvocationID.x >= xsize || gl_GlobalInvocationID.y >= ysize) {
        return;
    }
    const uint id = gl_GlobalInvocationID.y * xsize + gl_GlobalInvocationID.x;

    vec3 color = use_denoised != 0 ? denoised[id].rgb : accumulation[id].rgb;

    float scale = exp2(exposure_adjustment);
    if (auto_exposure != 0) {
        scale *= exposure;
    }

    vec3 mapped = srgb_encode(aces(max(color * scale, vec3(0.0))));
    uvec3 bytes = uvec3(clamp(mapped, 0.0, 1.0) * 255.0 + 0.5);
    output_texels[id] = bytes.b | (bytes.g << 8) | (bytes.r << 16) | (255u << 24);
}
",
}
