//! Conditioning gradient
//!
//! [`GuidanceContext`] holds everything that stays constant over a run. A
//! [`GuidanceEngine`] borrows it for one batch, owns the batch RNG and loss
//! history, and is handed to the denoiser as its [`CondFn`].
//!
//! The gradient is taken in two stages. Losses are differentiated with
//! respect to the blended image `x_in`, one backward pass per loss group,
//! and the summed gradient is then pulled back through the blend to `x`.

use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn_disco_clip::{normalize_image, PromptPlan, SharedModel};
use burn_disco_core::{ScheduleTable, StepParams, MAX_DIFFUSION_STEPS};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, warn};

use crate::cutouts::{CutoutSampler, CutoutSpec};
use crate::losses::{range_loss, sat_loss, spherical_dist_loss, tv_loss};
use crate::model::{
    alpha_sigma_to_t, CondFn, Denoiser, MseDistance, PerceptualModel, SecondaryModel,
};

/// An embedding model with its precomputed prompt embeddings
struct GuidanceModel<B: Backend> {
    id: String,
    model: SharedModel<B>,
    /// `[1, dim]` per prompt, `None` where the prompt is not eligible
    prompt_embeds: Vec<Option<Tensor<B, 2>>>,
}

/// Run-constant inputs of the guidance function
pub struct GuidanceContext<'a, B: AutodiffBackend> {
    denoiser: &'a dyn Denoiser<B>,
    plan: &'a PromptPlan,
    table: &'a ScheduleTable,
    models: Vec<GuidanceModel<B>>,
    secondary: Option<&'a dyn SecondaryModel<B>>,
    perceptual: Option<&'a dyn PerceptualModel<B>>,
    init: Option<Tensor<B, 4>>,
}

impl<'a, B: AutodiffBackend> GuidanceContext<'a, B> {
    /// Embed every eligible prompt once per model
    pub fn new(
        denoiser: &'a dyn Denoiser<B>,
        plan: &'a PromptPlan,
        table: &'a ScheduleTable,
        models: Vec<(String, SharedModel<B>)>,
    ) -> Self {
        let models = models
            .into_iter()
            .map(|(id, model)| {
                let prompt_embeds = plan
                    .prompts()
                    .iter()
                    .enumerate()
                    .map(|(i, prompt)| {
                        plan.is_eligible(i, &id)
                            .then(|| model.encode_text(&prompt.tokens).detach())
                    })
                    .collect();
                debug!("embedded prompts for {}", id);
                GuidanceModel {
                    id,
                    model,
                    prompt_embeds,
                }
            })
            .collect();

        Self {
            denoiser,
            plan,
            table,
            models,
            secondary: None,
            perceptual: None,
            init: None,
        }
    }

    pub fn with_secondary(mut self, secondary: &'a dyn SecondaryModel<B>) -> Self {
        self.secondary = Some(secondary);
        self
    }

    pub fn with_perceptual(mut self, perceptual: &'a dyn PerceptualModel<B>) -> Self {
        self.perceptual = Some(perceptual);
        self
    }

    /// Target of the init-image loss, `[n, 3, h, w]` in `[-1, 1]`
    pub fn with_init(mut self, init: Tensor<B, 4>) -> Self {
        self.init = Some(init.detach());
        self
    }

    pub fn denoiser(&self) -> &'a dyn Denoiser<B> {
        self.denoiser
    }

    pub fn table(&self) -> &'a ScheduleTable {
        self.table
    }

    pub fn model_ids(&self) -> impl Iterator<Item = &str> {
        self.models.iter().map(|m| m.id.as_str())
    }

    /// Forward step index (0 = noisiest) of trajectory index `t`
    pub fn num_step(&self, t: usize) -> usize {
        MAX_DIFFUSION_STEPS.saturating_sub(self.denoiser.global_timestep(t) + 1)
    }
}

/// Per-batch guidance function
pub struct GuidanceEngine<'a, B: AutodiffBackend> {
    ctx: &'a GuidanceContext<'a, B>,
    rng: StdRng,
    loss_history: Vec<f64>,
    fallback_logged: bool,
}

impl<'a, B: AutodiffBackend> GuidanceEngine<'a, B> {
    pub fn new(ctx: &'a GuidanceContext<'a, B>, seed: u64) -> Self {
        Self {
            ctx,
            rng: StdRng::seed_from_u64(seed),
            loss_history: Vec::new(),
            fallback_logged: false,
        }
    }

    /// Total loss of every call so far
    pub fn loss_history(&self) -> &[f64] {
        &self.loss_history
    }

    pub fn last_loss(&self) -> Option<f64> {
        self.loss_history.last().copied()
    }

    pub fn into_loss_history(self) -> Vec<f64> {
        self.loss_history
    }

    fn regularization_loss(&self, x_in: Tensor<B, 4>, params: &StepParams) -> Option<Tensor<B, 1>> {
        let mut terms = Vec::new();
        if params.tv_scale != 0.0 {
            terms.push(tv_loss(x_in.clone()).sum() * params.tv_scale);
        }
        if params.range_scale != 0.0 {
            terms.push(range_loss(x_in.clone()).sum() * params.range_scale);
        }
        if params.sat_scale != 0.0 {
            terms.push(sat_loss(x_in.clone()) * params.sat_scale);
        }
        if let Some(init) = &self.ctx.init {
            if params.init_scale != 0.0 {
                let distance = match self.ctx.perceptual {
                    Some(perceptual) => perceptual.distance(x_in, init.clone()),
                    None => MseDistance.distance(x_in, init.clone()),
                };
                terms.push(distance.sum() * params.init_scale);
            }
        }
        terms.into_iter().reduce(|a, b| a + b)
    }
}

/// Differentiate `loss` with respect to `leaf`, returning the gradient and loss value
fn backprop<B: AutodiffBackend>(
    leaf: &Tensor<B, 4>,
    loss: Tensor<B, 1>,
) -> (Option<Tensor<B::InnerBackend, 4>>, f64) {
    let value: f64 = loss.clone().into_scalar().elem();
    let grads = loss.backward();
    (leaf.grad(&grads), value)
}

/// Number of NaN values in `grad`
fn count_nan<B: Backend>(grad: Tensor<B, 4>) -> i64 {
    grad.is_nan().int().sum().into_scalar().elem()
}

/// Rescale `grad` so its RMS magnitude is at most `max`
pub fn clamp_magnitude<B: Backend>(grad: Tensor<B, 4>, max: f64) -> Tensor<B, 4> {
    let magnitude: f64 = grad.clone().powf_scalar(2.0).mean().sqrt().into_scalar().elem();
    if magnitude.is_finite() && magnitude > max && magnitude > 0.0 {
        grad * (max / magnitude)
    } else {
        grad
    }
}

impl<'a, B: AutodiffBackend> CondFn<B> for GuidanceEngine<'a, B> {
    fn gradient(&mut self, x: Tensor<B, 4>, t: usize) -> Tensor<B, 4> {
        let ctx = self.ctx;
        let num_step = ctx.num_step(t);
        let params = ctx.table.at(num_step);
        let alpha = ctx.denoiser.alpha_cumprod(t);
        let fac = (1.0 - alpha).sqrt();
        let [n, _, _, _] = x.dims();

        // Clean estimate blended with the current sample
        let x_leaf = x.detach().require_grad();
        let out = match ctx.secondary {
            Some(secondary) if params.use_secondary_model => {
                secondary.predict(x_leaf.clone(), alpha_sigma_to_t(alpha.sqrt(), fac))
            }
            _ => {
                if ctx.secondary.is_none() && params.use_secondary_model && !self.fallback_logged {
                    warn!("no secondary model attached, guiding with the denoiser estimate");
                    self.fallback_logged = true;
                }
                ctx.denoiser.predict_start(x_leaf.clone(), t)
            }
        };
        let x_in = out * fac + x_leaf.clone() * (1.0 - fac);
        let x_in_value = x_in.clone().detach();
        let zeros = x_in_value.clone().zeros_like();

        let mut grad_in = x_in_value.clone().inner().zeros_like();
        let mut total = 0.0;

        let leaf = x_in_value.clone().require_grad();
        if let Some(loss) = self.regularization_loss(leaf.clone(), &params) {
            let (grad, value) = backprop(&leaf, loss);
            if let Some(grad) = grad {
                grad_in = grad_in + grad;
            }
            total += value;
        }

        let spec = CutoutSpec::from(&params);
        for model in &ctx.models {
            if !ctx.table.model_enabled(&model.id, num_step) {
                continue;
            }
            let active = ctx.plan.active(&model.id, num_step);
            if active.is_empty() {
                continue;
            }
            let Some(weights) = active.normalized_weights() else {
                continue;
            };
            let embeds: Vec<Tensor<B, 2>> = active
                .indices
                .iter()
                .filter_map(|&i| model.prompt_embeds.get(i).cloned().flatten())
                .collect();
            let p = embeds.len();
            if p != active.len() {
                warn!("missing prompt embeddings for {}, skipping", model.id);
                continue;
            }

            let text = Tensor::cat(embeds, 0);
            let weights: Vec<f32> = weights.iter().map(|w| *w as f32).collect();
            let weights = Tensor::<B, 1>::from_data(TensorData::new(weights, [p]), &x_in_value.device())
                .reshape([1, 1, p]);
            let sampler = CutoutSampler::new(model.model.input_resolution());
            let scale =
                ctx.table.model_guidance_scale(&model.id, num_step) / params.cutn_batches as f64;

            for _ in 0..params.cutn_batches {
                let leaf = x_in_value.clone().require_grad();
                let Some(cuts) = sampler.sample((leaf.clone() + 1.0) / 2.0, &spec, &mut self.rng)
                else {
                    break;
                };
                let image_embeds = model.model.encode_image(normalize_image(cuts));
                let dists = spherical_dist_loss(image_embeds, text.clone()).reshape([
                    spec.total(),
                    n,
                    p,
                ]);
                let loss = (dists * weights.clone()).sum_dim(2).mean_dim(0).sum() * scale;
                let (grad, value) = backprop(&leaf, loss);
                if let Some(grad) = grad {
                    grad_in = grad_in + grad;
                }
                total += value;
            }
        }

        self.loss_history.push(total);

        let nan_count = count_nan(grad_in.clone());
        if nan_count > 0 {
            warn!(
                "NaN in guidance gradient at step {} ({} values), using zero gradient",
                num_step, nan_count
            );
            return zeros;
        }

        // Pull the x_in gradient back through the blend
        let grads = (x_in * Tensor::<B, 4>::from_inner(grad_in)).sum().backward();
        let grad = match x_leaf.grad(&grads) {
            Some(grad) => Tensor::<B, 4>::from_inner(grad).neg(),
            None => zeros.clone(),
        };
        // The pullback can introduce NaN of its own
        let nan_count = count_nan(grad.clone());
        if nan_count > 0 {
            warn!(
                "NaN in latent gradient at step {} ({} values), using zero gradient",
                num_step, nan_count
            );
            return zeros;
        }

        debug!("step {} loss {:.4}", num_step, total);
        if params.clamp_grad {
            clamp_magnitude(grad, params.clamp_max)
        } else {
            grad
        }
    }
}
