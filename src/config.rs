use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{error::RenderError, render_system::shader_binding_table::ShaderGroup};

/// Environment variable naming a JSON file with a (partial) [`RenderConfig`].
pub const CONFIG_ENV_VAR: &str = "PATHTRACER_CONFIG";

/// What the single ray tracing pipeline is built for.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineCapabilities {
    /// maximum number of bounces per path
    pub max_depth: u32,
    /// paths traced per pixel per frame
    pub sample_count: u32,
    /// shader group order, must match the binding table enumeration
    pub group_layout: Vec<ShaderGroup>,
}

impl Default for PipelineCapabilities {
    fn default() -> Self {
        PipelineCapabilities {
            max_depth: 4,
            sample_count: 1,
            group_layout: ShaderGroup::ALL.to_vec(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DenoiseSettings {
    pub enabled: bool,
    /// weight of the filtered result against the raw accumulation, in [0, 1]
    pub blend_factor: f32,
    pub sigma_color: f32,
    pub sigma_normal: f32,
    pub filter_radius: u32,
}

impl Default for DenoiseSettings {
    fn default() -> Self {
        DenoiseSettings {
            enabled: true,
            blend_factor: 1.0,
            sigma_color: 0.6,
            sigma_normal: 64.0,
            filter_radius: 2,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExposureSettings {
    pub auto_exposure: bool,
    /// in stops, added on top of the auto exposure
    pub manual_adjustment: f32,
    pub adjustment_step: f32,
}

impl Default for ExposureSettings {
    fn default() -> Self {
        ExposureSettings {
            auto_exposure: true,
            manual_adjustment: 0.0,
            adjustment_step: 0.25,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowSettings {
    pub title: String,
    pub width: u32,
    pub height: u32,
}

impl Default for WindowSettings {
    fn default() -> Self {
        WindowSettings {
            title: "progressive path tracer".to_string(),
            width: 1280,
            height: 720,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    pub window: WindowSettings,
    pub capabilities: PipelineCapabilities,
    pub denoise: DenoiseSettings,
    pub exposure: ExposureSettings,
    /// radians the sun override moves per key press
    pub sun_step: f32,
    pub fence_timeout_ms: u64,
    /// 0 disables the periodic frame statistics
    pub stats_interval_secs: u64,
}

impl Default for RenderConfig {
    fn default() -> Self {
        RenderConfig {
            window: WindowSettings::default(),
            capabilities: PipelineCapabilities::default(),
            denoise: DenoiseSettings::default(),
            exposure: ExposureSettings::default(),
            sun_step: 0.05,
            fence_timeout_ms: 5000,
            stats_interval_secs: 1,
        }
    }
}

impl RenderConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<RenderConfig, RenderError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<RenderConfig, RenderError> {
        let config: RenderConfig = serde_json::from_str(text)?;
        Ok(config.sanitized())
    }

    /// Reads the file named by [`CONFIG_ENV_VAR`], or falls back to the defaults.
    pub fn from_env() -> Result<RenderConfig, RenderError> {
        match std::env::var_os(CONFIG_ENV_VAR) {
            Some(path) => {
                log::info!("loading render config from {}", Path::new(&path).display());
                Self::load(path)
            }
            None => Ok(RenderConfig::default()),
        }
    }

    pub fn fence_timeout(&self) -> Duration {
        Duration::from_millis(self.fence_timeout_ms)
    }

    fn sanitized(mut self) -> RenderConfig {
        self.capabilities.max_depth = self.capabilities.max_depth.max(1);
        self.capabilities.sample_count = self.capabilities.sample_count.max(1);
        self.denoise.blend_factor = self.denoise.blend_factor.clamp(0.0, 1.0);
        self.fence_timeout_ms = self.fence_timeout_ms.max(1);
        self
    }
}
