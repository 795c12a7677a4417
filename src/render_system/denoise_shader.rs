vulkano_shaders::shader! {
    ty: "compute",
    linalg_type: "nalgebra",
    vulkan_version: "1.2",
    spirv_version: "1.3",
    src: r"
#version 460
#extension GL_EXT_scalar_block_layout: require

layout(local_size_x = 16, local_size_y = 16, local_size_z = 1) in;

layout(set = 0, binding = 0, scalar) readonly restrict buffer Radiance {
    vec4 radiance[];
};

layout(set = 0, binding = 1, scalar) readonly restrict buffer Albedo {
    vec4 albedo[];
};

layout(set = 0, binding = 2, scalar) readonly restrict buffer Normal {
    vec4 normal[];
};

layout(set = 0, binding = 3, scalar) readonly restrict buffer Flow {
    vec2 flow[];
};

layout(set = 0, binding = 4, scalar) writeonly restrict buffer Output {
    vec4 denoised[];
};

layout(push_constant, scalar) uniform PushConstants {
    uint xsize;
    uint ysize;
    uint radius;
    float sigma_color;
    float sigma_normal;
    // 0: raw radiance, 1: fully filtered
    float blend_factor;
    // samples accumulated so far
    uint iteration;
};

float luminance(vec3 c) {
    return dot(c, vec3(0.2126, 0.7152, 0.0722));
}

void main() {
    const ivec2 p = ivec2(gl_GlobalInvocationID.xy);
    if (p.x >= int(xsize) || p.y >= int(ysize)) {
        return;
    }
    const uint id = uint(p.y) * xsize + uint(p.x);

    vec3 raw = radiance[id].rgb;
    vec3 center_albedo = max(albedo[id].rgb, vec3(1e-3));
    // filter irradiance, texture detail is put back afterwards
    vec3 center = raw / center_albedo;
    vec3 center_normal = normal[id].xyz;

    // moving content is undersampled, widen the footprint
    float motion = length(flow[id] * vec2(xsize, ysize));
    int r = int(radius) + int(min(motion, 4.0));

    // early frames are noisy, tolerate larger color differences
    float sc = sigma_color * (1.0 + 4.0 / float(iteration + 1));
    float spatial = 2.0 * float(r * r) + 1.0;

    vec3 sum = vec3(0.0);
    float weight_sum = 0.0;
    for (int dy = -r; dy <= r; dy++) {
        for (int dx = -r; dx <= r; dx++) {
            ivec2 q = clamp(p + ivec2(dx, dy), ivec2(0), ivec2(xsize - 1, ysize - 1));
            uint qid = uint(q.y) * xsize + uint(q.x);

            vec3 c = radiance[qid].rgb / max(albedo[qid].rgb, vec3(1e-3));
            float dc = luminance(c) - luminance(center);
            float w = exp(-float(dx * dx + dy * dy) / spatial)
                * exp(-(dc * dc) / (2.0 * sc * sc))
                * pow(max(dot(center_normal, normal[qid].xyz), 0.0), sigma_normal);
            sum += c * w;
            weight_sum += w;
        }
    }

    vec3 filtered = weight_sum > 1e-6 ? sum / weight_sum * center_albedo : raw;
    denoised[id] = vec4(mix(raw, filtered, clamp(blend_factor, 0.0, 1.0)), 1.0);
}
",
}
