vulkano_shaders::shader! {
    ty: "compute",
    linalg_type: "nalgebra",
    vulkan_version: "1.2",
    spirv_version: "1.3",
    src: r"
#version 460
#extension GL_EXT_scalar_block_layout: require

// a single workgroup reduces the whole image
layout(local_size_x = 256, local_size_y = 1, local_size_z = 1) in;

layout(set = 0, binding = 0, scalar) readonly restrict buffer Accumulation {
    vec4 accumulation[];
};

layout(set = 0, binding = 1, scalar) restrict buffer Exposure {
    float average_log_luminance;
    // linear scale applied before tonemapping
    float exposure;
};

layout(push_constant, scalar) uniform PushConstants {
    uint pixel_count;
    // only every nth pixel is sampled on large targets
    uint stride;
    float key;
};

shared float partial_sums[256];
shared uint partial_counts[256];

void main() {
    const uint lane = gl_LocalInvocationID.x;

    float sum = 0.0;
    uint count = 0;
    for (uint i = lane * stride; i < pixel_count; i += 256 * stride) {
        vec3 c = accumulation[i].rgb;
        float luminance = dot(c, vec3(0.2126, 0.7152, 0.0722));
        sum += log(max(luminance, 1e-4));
        count += 1;
    }
    partial_sums[lane] = sum;
    partial_counts[lane] = count;
    barrier();

    for (uint offset = 128; offset > 0; offset >>= 1) {
        if (lane < offset) {
            partial_sums[lane] += partial_sums[lane + offset];
            partial_counts[lane] += partial_counts[lane + offset];
        }
        barrier();
    }

    if (lane == 0) {
        float average = partial_sums[0] / float(max(partial_counts[0], 1u));
        average_log_luminance = average;
        exposure = clamp(key / exp(average), 1e-3, 1e3);
    }
}
",
}
