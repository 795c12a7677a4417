vulkano_shaders::shader! {
    ty: "raygen",
    linalg_type: "nalgebra",
    vulkan_version: "1.2",
    spirv_version: "1.4",
    src: r"
#version 460
#extension GL_EXT_ray_tracing: require
#extension GL_EXT_scalar_block_layout: require

struct HitPayload {
    vec3 position;
    // negative on a miss
    float t;
    vec3 normal;
    uint material;
    vec3 albedo;
    float pad0;
    vec3 emission;
    float pad1;
};

struct LightQuad {
    vec3 corner;
    float area;
    vec3 edge_a;
    float pad0;
    vec3 edge_b;
    float pad1;
    vec3 emission;
    float pad2;
};

layout(location = 0) rayPayloadEXT HitPayload payload;
layout(location = 1) rayPayloadEXT uint shadow_visible;

layout(set = 0, binding = 0) uniform accelerationStructureEXT tlas;

layout(set = 1, binding = 0, std140) uniform SceneUniforms {
    mat4 view_inverse;
    mat4 projection_inverse;
    mat4 previous_view;
    mat4 previous_projection;
    // xyz: towards the sun, w: 1 when the sun is overridden
    vec4 sun_direction;
    float exposure_adjustment;
    uint frame;
    uint iteration;
    uint changed;
    uint max_depth;
    uint samples_per_frame;
    uint denoise;
    uint pad;
} scene;

layout(set = 4, binding = 0, scalar) readonly restrict buffer Lights {
    LightQuad lights[];
};

layout(set = 5, binding = 0, scalar) restrict buffer Accumulation {
    vec4 accumulation[];
};

layout(set = 5, binding = 1, scalar) writeonly restrict buffer Radiance {
    vec4 radiance_out[];
};

layout(set = 5, binding = 2, scalar) writeonly restrict buffer Albedo {
    vec4 albedo_out[];
};

layout(set = 5, binding = 3, scalar) writeonly restrict buffer Normal {
    vec4 normal_out[];
};

layout(set = 5, binding = 4, scalar) writeonly restrict buffer Flow {
    vec2 flow_out[];
};

const float PI = 3.14159265359;
const vec3 SUN_RADIANCE = vec3(6.0, 5.6, 5.0);

uint rng_state;

uint pcg() {
    uint state = rng_state;
    rng_state = rng_state * 747796405u + 2891336453u;
    uint word = ((state >> ((state >> 28u) + 4u)) ^ state) * 277803737u;
    return (word >> 22u) ^ word;
}

float rand() {
    return float(pcg()) / 4294967296.0;
}

vec3 cosine_hemisphere(vec3 n) {
    float r1 = rand();
    float r2 = rand();
    float phi = 2.0 * PI * r1;
    float r = sqrt(r2);
    vec3 t = normalize(abs(n.x) > 0.9 ? cross(n, vec3(0.0, 1.0, 0.0)) : cross(n, vec3(1.0, 0.0, 0.0)));
    vec3 b = cross(n, t);
    return normalize(t * (r * cos(phi)) + b * (r * sin(phi)) + n * sqrt(1.0 - r2));
}

float visibility(vec3 origin, vec3 direction, float dist) {
    shadow_visible = 0u;
    traceRayEXT(
        tlas,
        gl_RayFlagsTerminateOnFirstHitEXT | gl_RayFlagsSkipClosestHitShaderEXT,
        0xFF,
        1, // shadow hit group
        0,
        1, // shadow miss
        origin,
        1e-3,
        direction,
        dist,
        1
    );
    return float(shadow_visible);
}

void main() {
    const uvec2 pixel = gl_LaunchIDEXT.xy;
    const uvec2 size = gl_LaunchSizeEXT.xy;
    const uint id = pixel.y * size.x + pixel.x;

    rng_state = id * 1973u + scene.frame * 9277u + 26699u;

    vec3 total = vec3(0.0);
    vec3 first_albedo = vec3(1.0);
    vec3 first_normal = vec3(0.0);
    vec2 flow = vec2(0.0);

    for (uint s = 0; s < scene.samples_per_frame; s++) {
        vec2 ndc = (vec2(pixel) + vec2(rand(), rand())) / vec2(size) * 2.0 - 1.0;
        // pixel rows grow downwards
        ndc.y = -ndc.y;

        vec3 ro = (scene.view_inverse * vec4(0.0, 0.0, 0.0, 1.0)).xyz;
        vec4 target = scene.projection_inverse * vec4(ndc, 1.0, 1.0);
        vec3 rd = normalize((scene.view_inverse * vec4(normalize(target.xyz / target.w), 0.0)).xyz);

        vec3 throughput = vec3(1.0);
        vec3 radiance = vec3(0.0);

        for (uint depth = 0; depth < scene.max_depth; depth++) {
            traceRayEXT(tlas, gl_RayFlagsNoneEXT, 0xFF, 0, 0, 0, ro, 1e-3, rd, 1e4, 0);

            if (payload.t < 0.0) {
                radiance += throughput * payload.emission;
                break;
            }

            // emitters reached by a bounce are already counted by next event estimation
            if (depth == 0) {
                radiance += throughput * payload.emission;
            }

            vec3 p = payload.position;
            vec3 n = payload.normal;
            if (dot(n, rd) > 0.0) {
                n = -n;
            }

            if (s == 0 && depth == 0) {
                first_albedo = payload.albedo;
                first_normal = n;
                vec4 previous = scene.previous_projection * scene.previous_view * vec4(p, 1.0);
                vec2 previous_uv = vec2(previous.x, -previous.y) / previous.w * 0.5 + 0.5;
                flow = previous_uv - (vec2(pixel) + 0.5) / vec2(size);
            }

            vec3 brdf = payload.albedo / PI;
            vec3 origin = p + n * 1e-3;

            uint light_count = lights.length();
            if (light_count > 0) {
                LightQuad light = lights[min(uint(rand() * float(light_count)), light_count - 1)];
                vec3 lp = light.corner + rand() * light.edge_a + rand() * light.edge_b;
                vec3 to_light = lp - p;
                float dist2 = dot(to_light, to_light);
                float dist = sqrt(dist2);
                vec3 l = to_light / dist;
                float cos_surface = dot(n, l);
                float cos_light = abs(dot(normalize(cross(light.edge_a, light.edge_b)), l));
                if (cos_surface > 0.0 && cos_light > 0.0) {
                    float v = visibility(origin, l, dist - 2e-3);
                    radiance += throughput * brdf * light.emission * v * cos_surface * cos_light
                        * light.area * float(light_count) / dist2;
                }
            }

            if (scene.sun_direction.w > 0.5) {
                vec3 l = normalize(scene.sun_direction.xyz);
                float cos_surface = dot(n, l);
                if (cos_surface > 0.0) {
                    radiance += throughput * brdf * SUN_RADIANCE * cos_surface * visibility(origin, l, 1e4);
                }
            }

            // cosine sampling cancels the cosine term and the pdf
            throughput *= payload.albedo;
            ro = origin;
            rd = cosine_hemisphere(n);

            if (depth >= 2) {
                float q = max(throughput.r, max(throughput.g, throughput.b));
                if (rand() > q) {
                    break;
                }
                throughput /= q;
            }
        }

        total += radiance;
    }

    vec4 sample_value = vec4(total / float(max(scene.samples_per_frame, 1u)), 1.0);

    vec4 accumulated;
    if (scene.changed != 0u) {
        accumulated = sample_value;
    } else {
        vec4 previous = accumulation[id];
        accumulated = previous + (sample_value - previous) / float(scene.iteration + 1u);
    }
    accumulation[id] = accumulated;

    if (scene.denoise != 0u) {
        radiance_out[id] = accumulated;
        albedo_out[id] = vec4(first_albedo, 1.0);
        normal_out[id] = vec4(first_normal, 0.0);
        flow_out[id] = flow;
    }
}
",
}
