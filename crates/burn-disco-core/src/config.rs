//! Run configuration
//!
//! [`RunConfig`] is fully typed. Unknown keys are rejected when it is parsed,
//! and cross-field checks run in [`RunConfig::validate`] before any sampling.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::schedule::{ScheduleError, ScheduleInput};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("embedding model `{0}` is not listed in clip_models")]
    UnknownModel(String),

    #[error("schedule `{field}`: {source}")]
    Schedule {
        field: String,
        #[source]
        source: ScheduleError,
    },
}

/// Denoiser sampling mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplingMode {
    /// DDIM with stochasticity controlled by `eta`
    #[default]
    Ddim,
    /// Pseudo linear multistep
    Plms,
}

/// Prompt declarations
///
/// Accepts a single string, a list of `"text:weight"` strings, or the
/// versioned structured form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TextPrompts {
    Single(String),
    Legacy(Vec<String>),
    Structured(StructuredPrompts),
}

impl Default for TextPrompts {
    fn default() -> Self {
        Self::Legacy(vec![
            "A beautiful painting of a singular lighthouse, shining its light across a \
             tumultuous sea of blood by greg rutkowski and thomas kinkade, \
             Trending on artstation."
                .to_string(),
            "yellow color scheme".to_string(),
        ])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StructuredPrompts {
    pub version: String,
    pub prompts: Vec<PromptSpec>,
}

/// One structured prompt record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PromptSpec {
    pub text: String,
    /// Scalar weight or weight schedule
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<ScheduleInput>,
    /// Activation schedule
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<ScheduleInput>,
    /// Eligible embedding models, all run models when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clip_guidance: Option<Vec<String>>,
}

/// Full configuration of one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    /// Run name, generated from `batch_name` when absent
    pub name: Option<String>,
    pub batch_name: String,
    pub text_prompts: TextPrompts,

    // Embedding models
    pub clip_models: Vec<String>,
    /// Per-model on/off schedules
    pub clip_models_schedules: BTreeMap<String, ScheduleInput>,
    /// Per-model guidance scale overrides
    pub clip_guidance_scales: BTreeMap<String, ScheduleInput>,

    // Guidance
    pub clip_guidance_scale: ScheduleInput,
    pub clamp_grad: ScheduleInput,
    pub clamp_max: ScheduleInput,
    pub tv_scale: ScheduleInput,
    pub range_scale: ScheduleInput,
    pub sat_scale: ScheduleInput,
    pub init_scale: ScheduleInput,
    pub use_secondary_model: ScheduleInput,

    // Cutouts
    pub cut_overview: ScheduleInput,
    pub cut_innercut: ScheduleInput,
    pub cut_icgray_p: ScheduleInput,
    pub cut_ic_pow: ScheduleInput,
    pub cutn_batches: ScheduleInput,
    pub skip_augs: ScheduleInput,

    // Sampling
    pub diffusion_sampling_mode: SamplingMode,
    pub eta: f64,
    pub clip_denoised: bool,
    pub steps: usize,
    pub skip_steps: usize,
    pub n_batches: usize,
    pub batch_size: usize,
    pub seed: Option<u64>,
    pub width_height: [usize; 2],
    pub init_image: Option<PathBuf>,

    // Symmetry
    pub use_horizontal_symmetry: bool,
    pub use_vertical_symmetry: bool,
    pub transformation_percent: Vec<f64>,

    // Output
    /// Save every `save_rate` steps; zero or less saves only the final step
    pub save_rate: i64,
    pub image_output: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            name: None,
            batch_name: String::new(),
            text_prompts: TextPrompts::default(),
            clip_models: vec![
                "ViT-B-32::openai".to_string(),
                "ViT-B-16::openai".to_string(),
                "RN50::openai".to_string(),
            ],
            clip_models_schedules: BTreeMap::new(),
            clip_guidance_scales: BTreeMap::new(),
            clip_guidance_scale: ScheduleInput::Int(5000),
            clamp_grad: ScheduleInput::Bool(true),
            clamp_max: ScheduleInput::Float(0.05),
            tv_scale: ScheduleInput::Int(0),
            range_scale: ScheduleInput::Int(150),
            sat_scale: ScheduleInput::Int(0),
            init_scale: ScheduleInput::Int(1000),
            use_secondary_model: ScheduleInput::Bool(true),
            cut_overview: "[12]*400+[4]*600".into(),
            cut_innercut: "[4]*400+[12]*600".into(),
            cut_icgray_p: "[0.2]*400+[0]*600".into(),
            cut_ic_pow: ScheduleInput::Float(1.0),
            cutn_batches: ScheduleInput::Int(4),
            skip_augs: ScheduleInput::Bool(false),
            diffusion_sampling_mode: SamplingMode::Ddim,
            eta: 0.8,
            clip_denoised: false,
            steps: 250,
            skip_steps: 0,
            n_batches: 4,
            batch_size: 1,
            seed: None,
            width_height: [1280, 768],
            init_image: None,
            use_horizontal_symmetry: false,
            use_vertical_symmetry: false,
            transformation_percent: vec![0.09],
            save_rate: 20,
            image_output: true,
        }
    }
}

impl RunConfig {
    /// Parse a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Load a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Canvas size `(width, height)`, each floored to a multiple of 64
    pub fn canvas_size(&self) -> (usize, usize) {
        let [w, h] = self.width_height;
        ((w / 64) * 64, (h / 64) * 64)
    }

    /// Name of the run, generating one on first use
    pub fn ensure_name(&mut self) -> &str {
        let batch_name = &self.batch_name;
        self.name.get_or_insert_with(|| {
            format!("burn-disco-{}-{}", batch_name, Uuid::new_v4().simple())
        })
    }

    /// Cross-field validation
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
            ConfigError::Invalid {
                field,
                reason: reason.into(),
            }
        }

        if self.n_batches == 0 {
            return Err(invalid("n_batches", "must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(invalid("batch_size", "must be at least 1"));
        }
        if self.steps == 0 || self.steps > crate::MAX_DIFFUSION_STEPS {
            return Err(invalid(
                "steps",
                format!("must be in 1..={}", crate::MAX_DIFFUSION_STEPS),
            ));
        }
        if self.skip_steps >= self.steps {
            return Err(invalid("skip_steps", "must be smaller than steps"));
        }
        if !(self.eta.is_finite() && self.eta >= 0.0) {
            return Err(invalid("eta", "must be a non-negative number"));
        }
        let (w, h) = self.canvas_size();
        if w == 0 || h == 0 {
            return Err(invalid("width_height", "each side must be at least 64"));
        }
        if self.clip_models.is_empty() {
            return Err(invalid("clip_models", "at least one model is required"));
        }
        if let Some(p) = self
            .transformation_percent
            .iter()
            .find(|p| !(0.0..=1.0).contains(*p))
        {
            return Err(invalid(
                "transformation_percent",
                format!("{} is outside [0, 1]", p),
            ));
        }
        for id in self
            .clip_models_schedules
            .keys()
            .chain(self.clip_guidance_scales.keys())
        {
            if !self.clip_models.contains(id) {
                return Err(ConfigError::UnknownModel(id.clone()));
            }
        }
        Ok(())
    }
}
