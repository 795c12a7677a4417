pub mod accumulation;
pub mod cross_device;
pub mod frame;
pub mod orchestrator;
pub mod resource_binder;
pub mod scene;
pub mod shader_binding_table;
pub mod timeline;
pub mod vertex;
pub mod vulkan;

mod any_hit_shader;
mod closest_hit_shader;
mod denoise_shader;
mod exposure_shader;
mod miss_shader;
mod postprocess_shader;
mod raygen_shader;
mod shadow_any_hit_shader;
mod shadow_miss_shader;
