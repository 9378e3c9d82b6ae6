//! Small deterministic stand-ins for the diffusion and embedding models

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use burn::backend::Autodiff;
use burn::prelude::*;
use burn_disco::base::{EnvSettings, RunConfig, ScheduleInput, TextPrompts};
use burn_disco::{
    EmbeddingModel, GuidedDiffusion, ModelCache, NoisePredictor, NoiseSchedule, SharedModel,
};
use burn_ndarray::NdArray;

pub type TestBackend = Autodiff<NdArray<f32>>;

/// Predicts a fixed fraction of the input as noise
pub struct ToyNoise;

impl NoisePredictor<TestBackend> for ToyNoise {
    fn predict_noise(&self, x: Tensor<TestBackend, 4>, _timestep: usize) -> Tensor<TestBackend, 4> {
        x * 0.05
    }
}

/// Embeds images as their mean colour and every prompt as pure red
pub struct ColourProbe;

impl EmbeddingModel<TestBackend> for ColourProbe {
    fn input_resolution(&self) -> usize {
        8
    }

    fn encode_text(&self, _tokens: &[String]) -> Tensor<TestBackend, 2> {
        Tensor::from_floats([[1.0, 0.0, 0.0]], &Default::default())
    }

    fn encode_image(&self, images: Tensor<TestBackend, 4>) -> Tensor<TestBackend, 2> {
        let [n, c, _, _] = images.dims();
        images.mean_dim(3).mean_dim(2).reshape([n, c])
    }
}

pub fn config(steps: usize, n_batches: usize) -> RunConfig {
    RunConfig {
        text_prompts: TextPrompts::Single("a red lighthouse".into()),
        clip_models: vec!["probe".into()],
        steps,
        n_batches,
        seed: Some(11),
        width_height: [64, 64],
        cut_overview: ScheduleInput::Int(1),
        cut_innercut: ScheduleInput::Int(1),
        cutn_batches: ScheduleInput::Int(1),
        use_secondary_model: ScheduleInput::Bool(false),
        image_output: false,
        save_rate: 2,
        ..Default::default()
    }
}

pub fn env(output_dir: &Path) -> EnvSettings {
    EnvSettings {
        output_dir: output_dir.to_path_buf(),
        disable_progress: true,
        ..Default::default()
    }
}

pub fn denoiser(steps: usize) -> GuidedDiffusion<TestBackend, ToyNoise> {
    GuidedDiffusion::new(ToyNoise, NoiseSchedule::default_linear(), steps)
}

pub fn cache() -> ModelCache<TestBackend> {
    let mut cache = ModelCache::new();
    let probe: SharedModel<TestBackend> = Arc::new(ColourProbe);
    cache.insert("probe", probe);
    cache
}
