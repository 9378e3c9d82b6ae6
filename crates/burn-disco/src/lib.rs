//! burn-disco: gradient-guided diffusion sampling in pure Rust
//!
//! Text prompts steer a diffusion trajectory through the gradients of
//! image-text losses computed by one or more embedding models. Hyperparameters
//! can change per step through schedules, and partial results are persisted in
//! the background without stalling sampling.
//!
//! # Backend Selection
//!
//! Choose a backend via feature flags:
//! - `ndarray`: CPU backend (no GPU required)
//! - `tch`: libtorch backend
//! - `wgpu`: WebGPU backend
//! - `cuda`: native CUDA backend
//!
//! # Example
//!
//! ```ignore
//! use burn_disco::{backends, ModelCache, RunConfig, Runner};
//!
//! let config = RunConfig::from_file("run.toml")?;
//! let env = burn_disco::EnvSettings::from_env();
//! burn_disco::logging::init_logging(&env.log_level);
//!
//! let mut cache = ModelCache::new();
//! cache.get_or_load("ViT-B-32::openai", load_clip)?;
//! let denoiser = GuidedDiffusion::new(unet, NoiseSchedule::default_linear(), config.steps);
//!
//! let mut runner = Runner::<backends::DefaultBackend>::new(config, env, backends::default_device())?;
//! let output = runner.run(&cache, &denoiser)?;
//! ```

pub use burn_disco_clip as clip;
pub use burn_disco_core as base;
pub use burn_disco_guidance as guidance;

pub mod artifacts;
pub mod backends;
pub mod logging;
pub mod persist;
pub mod results;
pub mod runner;
pub mod snapshot;

pub use burn_disco_clip::{EmbeddingModel, ModelCache, PromptPlan, SharedModel};
pub use burn_disco_core::{EnvSettings, RunConfig, ScheduleResolver, ScheduleTable};
pub use burn_disco_guidance::{
    Denoiser, GuidanceContext, GuidanceEngine, GuidedDiffusion, NoisePredictor, NoiseSchedule,
};
pub use persist::{LocalStore, MemoryStore, PersistError, PersistenceManager, SnapshotStore};
pub use results::{ImageChunk, RecordStatus, ResultCollection, ResultRecord};
pub use runner::{BatchPhase, CancelSignals, RunError, RunOutput, RunState, Runner, StepInfo};
pub use snapshot::SnapshotError;
