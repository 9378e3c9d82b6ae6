//! Sampling loop
//!
//! Batches run one after another. Each batch walks the denoiser trajectory
//! with a [`GuidanceEngine`] as conditioning callback, polls the cancel
//! signals once per step, and hands saved steps to the artifact writer and
//! the [`PersistenceManager`] without waiting for them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::Distribution;
use burn_disco_clip::{ModelCache, PromptError, PromptPlan};
use burn_disco_core::{ConfigError, EnvSettings, RunConfig, ScheduleResolver, ScheduleTable};
use burn_disco_guidance::{
    symmetrize, transformation_steps, Denoiser, GuidanceContext, GuidanceEngine,
    PerceptualModel, SamplingOptions, SecondaryModel,
};
use indicatif::{ProgressBar, ProgressStyle};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::artifacts::{image_chunks, load_image, ArtifactWriter};
use crate::persist::{PersistenceManager, SnapshotStore};
use crate::results::{RecordStatus, ResultCollection, ResultRecord};

#[derive(Error, Debug)]
pub enum RunError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Prompt error: {0}")]
    Prompt(#[from] PromptError),

    #[error("Embedding model {0} is not loaded")]
    MissingModel(String),

    #[error("Init image error: {0}")]
    InitImage(#[from] image::ImageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Cooperative cancellation flags, polled once per step
#[derive(Debug, Clone, Default)]
pub struct CancelSignals {
    skip: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
}

impl CancelSignals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Abandon the current batch, then continue with the next
    pub fn request_skip(&self) {
        self.skip.store(true, Ordering::SeqCst);
    }

    /// Abandon the current batch and every remaining one
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Read and clear the skip flag
    pub fn take_skip(&self) -> bool {
        self.skip.swap(false, Ordering::SeqCst)
    }

    /// Read and clear the stop flag
    pub fn take_stop(&self) -> bool {
        self.stop.swap(false, Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchPhase {
    Seeding,
    Sampling,
    Skipped,
    Stopped,
    Completed,
}

/// State of one batch
#[derive(Debug, Clone)]
pub struct RunState<B: Backend> {
    pub batch_index: usize,
    pub seed: u64,
    /// Remaining trajectory index, `-1` once the trajectory is done
    pub cur_t: i64,
    /// Steps taken
    pub step: usize,
    pub phase: BatchPhase,
    pub loss_history: Vec<f64>,
    /// Latest clean-image estimate
    pub image: Option<Tensor<B, 4>>,
    pub completed: bool,
    pub record_id: Uuid,
}

impl<B: Backend> RunState<B> {
    fn new(batch_index: usize, seed: u64, record_id: Uuid) -> Self {
        Self {
            batch_index,
            seed,
            cur_t: 0,
            step: 0,
            phase: BatchPhase::Seeding,
            loss_history: Vec::new(),
            image: None,
            completed: false,
            record_id,
        }
    }

    fn status(&self, loss: &[f64]) -> RecordStatus {
        RecordStatus {
            completed: self.completed,
            cur_t: self.cur_t,
            step: self.step,
            loss: loss.to_vec(),
        }
    }
}

/// Passed to the step callback after every step
pub struct StepInfo<'a, B: Backend> {
    pub batch_index: usize,
    /// Steps taken in this batch
    pub step: usize,
    pub total_steps: usize,
    pub cur_t: i64,
    pub loss: Option<f64>,
    pub pred_xstart: &'a Tensor<B, 4>,
}

/// Outcome of a run
pub struct RunOutput<B: Backend> {
    pub name: String,
    pub states: Vec<RunState<B>>,
    pub results: ResultCollection,
}

/// Whether forward step `j` is a save step
pub fn is_save_step(j: usize, save_rate: i64) -> bool {
    save_rate > 0 && j % save_rate as usize == 0
}

fn lock(results: &Mutex<ResultCollection>) -> MutexGuard<'_, ResultCollection> {
    results.lock().unwrap_or_else(PoisonError::into_inner)
}

fn progress_bar(total: usize, hidden: bool) -> ProgressBar {
    if hidden {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(total as u64);
    if let Ok(style) =
        ProgressStyle::default_bar().template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
    {
        pb.set_style(style.progress_chars("#>-"));
    }
    pb
}

/// Drives a full run over `n_batches` batches
pub struct Runner<'a, B: AutodiffBackend> {
    config: RunConfig,
    env: EnvSettings,
    device: B::Device,
    secondary: Option<&'a dyn SecondaryModel<B>>,
    perceptual: Option<&'a dyn PerceptualModel<B>>,
    remote: Option<Box<dyn SnapshotStore>>,
    signals: CancelSignals,
}

impl<'a, B: AutodiffBackend> Runner<'a, B> {
    /// Validate `config` and name the run
    pub fn new(mut config: RunConfig, env: EnvSettings, device: B::Device) -> Result<Self, RunError> {
        config.validate()?;
        config.ensure_name();
        Ok(Self {
            config,
            env,
            device,
            secondary: None,
            perceptual: None,
            remote: None,
            signals: CancelSignals::new(),
        })
    }

    pub fn with_secondary(mut self, secondary: &'a dyn SecondaryModel<B>) -> Self {
        self.secondary = Some(secondary);
        self
    }

    pub fn with_perceptual(mut self, perceptual: &'a dyn PerceptualModel<B>) -> Self {
        self.perceptual = Some(perceptual);
        self
    }

    pub fn with_remote(mut self, store: Box<dyn SnapshotStore>) -> Self {
        self.remote = Some(store);
        self
    }

    pub fn with_signals(mut self, signals: CancelSignals) -> Self {
        self.signals = signals;
        self
    }

    pub fn signals(&self) -> CancelSignals {
        self.signals.clone()
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        self.config.name.as_deref().unwrap_or_default()
    }

    pub fn run(
        &mut self,
        cache: &ModelCache<B>,
        denoiser: &dyn Denoiser<B>,
    ) -> Result<RunOutput<B>, RunError> {
        self.run_with_callback(cache, denoiser, |_| {})
    }

    /// Run every batch, reporting each step to `callback`
    ///
    /// Every model in `clip_models` must already be in `cache`.
    pub fn run_with_callback<F>(
        &mut self,
        cache: &ModelCache<B>,
        denoiser: &dyn Denoiser<B>,
        mut callback: F,
    ) -> Result<RunOutput<B>, RunError>
    where
        F: FnMut(StepInfo<'_, B>),
    {
        let config = &self.config;
        let name = config.name.clone().unwrap_or_default();
        let run_dir = self.env.output_dir.join(&name);

        // Everything that can fail is checked before sampling
        let num_timesteps = denoiser.num_timesteps();
        if config.skip_steps >= num_timesteps {
            return Err(ConfigError::Invalid {
                field: "skip_steps",
                reason: format!("must be smaller than the {} denoiser steps", num_timesteps),
            }
            .into());
        }
        let mut resolver = ScheduleResolver::new();
        let table = ScheduleTable::from_config(config, &mut resolver)?;
        let plan = PromptPlan::build(&config.text_prompts, &config.clip_models, &mut resolver)?;
        let models = config
            .clip_models
            .iter()
            .map(|id| {
                cache
                    .get(id)
                    .map(|model| (id.clone(), model))
                    .ok_or_else(|| RunError::MissingModel(id.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let config_json = config.to_json()?;

        let (width, height) = config.canvas_size();
        let shape = [config.batch_size, 3, height, width];
        let init = match &config.init_image {
            Some(path) => {
                let image = load_image::<B>(path, width, height, &self.device)?;
                Some(Tensor::cat(vec![image; config.batch_size], 0))
            }
            None => None,
        };

        let mut ctx = GuidanceContext::new(denoiser, &plan, &table, models);
        if let Some(secondary) = self.secondary {
            ctx = ctx.with_secondary(secondary);
        }
        if let Some(perceptual) = self.perceptual {
            ctx = ctx.with_perceptual(perceptual);
        }
        if let Some(init) = &init {
            ctx = ctx.with_init(init.clone());
        }

        let persistence = PersistenceManager::from_env(&self.env, &run_dir, self.remote.take());
        let gate = persistence.gate();
        let results = Arc::new(Mutex::new(ResultCollection::new()));

        let options = SamplingOptions {
            mode: config.diffusion_sampling_mode,
            eta: config.eta,
            clip_denoised: config.clip_denoised,
        };
        let start_t = num_timesteps - config.skip_steps - 1;
        let total_steps = start_t + 1;
        let symmetry = config.use_horizontal_symmetry || config.use_vertical_symmetry;
        let symmetry_steps = transformation_steps(total_steps, &config.transformation_percent);
        let base_seed = config.seed.unwrap_or_else(|| rand::random::<u32>() as u64);

        info!(
            "run {}: {} batches x {} steps, seed {}",
            name, config.n_batches, total_steps, base_seed
        );

        let mut states = Vec::with_capacity(config.n_batches);
        for batch_index in 0..config.n_batches {
            // Seeding
            let seed = base_seed.wrapping_add(batch_index as u64);
            let record = ResultRecord::new(batch_index, seed, config_json.clone());
            let mut state = RunState::<B>::new(batch_index, seed, record.id);
            lock(&results).upsert(record);
            B::seed(seed);
            denoiser.begin_trajectory();

            let mut engine = GuidanceEngine::new(&ctx, seed);
            let noise = Tensor::<B, 4>::random(shape, Distribution::Normal(0.0, 1.0), &self.device);
            let mut x = match &init {
                Some(init) => denoiser.q_sample(init.clone(), start_t, noise),
                None => noise,
            };
            let mut artifacts = if config.image_output {
                Some(ArtifactWriter::new(&run_dir, batch_index.to_string())?)
            } else {
                None
            };
            let pb = progress_bar(total_steps, self.env.disable_progress);
            pb.set_message(format!("batch {}/{}", batch_index + 1, config.n_batches));

            // Sampling
            state.phase = BatchPhase::Sampling;
            state.cur_t = start_t as i64;
            debug!("batch {} seeded with {}", batch_index, seed);

            for (j, t) in (0..=start_t).rev().enumerate() {
                // Stop wins over a pending skip
                if self.signals.take_stop() {
                    info!("run stopped at batch {} step {}", batch_index, j);
                    state.phase = BatchPhase::Stopped;
                    break;
                }
                if self.signals.take_skip() {
                    info!("batch {} skipped at step {}", batch_index, j);
                    state.phase = BatchPhase::Skipped;
                    break;
                }

                gate.begin();
                let out = denoiser.step(x, t, &mut engine, &options);
                gate.finish();

                x = out.sample;
                if symmetry && symmetry_steps.contains(&j) {
                    debug!("symmetry at step {}", j);
                    x = symmetrize(
                        x,
                        config.use_horizontal_symmetry,
                        config.use_vertical_symmetry,
                    );
                }

                state.cur_t = t as i64 - 1;
                state.step = j + 1;
                let is_final = t == 0;
                if is_final {
                    state.completed = true;
                }
                let loss = engine.last_loss();
                pb.inc(1);

                callback(StepInfo {
                    batch_index,
                    step: j,
                    total_steps,
                    cur_t: state.cur_t,
                    loss,
                    pred_xstart: &out.pred_xstart,
                });

                if is_save_step(j, config.save_rate) || is_final {
                    let chunks = image_chunks(out.pred_xstart.clone(), j, state.cur_t, loss);
                    if let Some(writer) = artifacts.as_mut() {
                        writer.save(&chunks, is_final);
                    }
                    {
                        let mut results = lock(&results);
                        if let Some(record) = results.get_mut(&state.record_id) {
                            record.status = state.status(engine.loss_history());
                            record.chunks.extend(chunks);
                        }
                    }
                    persistence.dispatch(&results, is_final);
                }
                state.image = Some(out.pred_xstart);
            }
            pb.finish_and_clear();

            if state.completed {
                state.phase = BatchPhase::Completed;
            } else {
                // Skipped or stopped batches keep their record
                if let Some(record) = lock(&results).get_mut(&state.record_id) {
                    record.status = state.status(engine.loss_history());
                }
                persistence.dispatch(&results, true);
            }
            if let Some(writer) = artifacts.as_mut() {
                writer.join();
            }
            persistence.flush();

            state.loss_history = engine.into_loss_history();
            info!(
                "batch {} finished: {:?} at t = {}",
                batch_index, state.phase, state.cur_t
            );
            // A stop raised during the last step still ends the run here
            let stopped = state.phase == BatchPhase::Stopped || self.signals.take_stop();
            states.push(state);
            if stopped {
                warn!("run stopped, {} batches not started", config.n_batches - batch_index - 1);
                break;
            }
        }

        let results = lock(&results).clone();
        Ok(RunOutput {
            name,
            states,
            results,
        })
    }
}
