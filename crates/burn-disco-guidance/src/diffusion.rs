//! Guided DDIM / PLMS denoiser over a noise-prediction model
//!
//! Classifier guidance enters through the noise estimate:
//! `eps' = eps - sqrt(1 - ᾱ_t) * grad`, where `grad` is the conditioning
//! gradient returned by the [`CondFn`].

use std::cell::RefCell;

use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn_disco_core::SamplingMode;

use crate::model::{CondFn, DenoiseStep, Denoiser, SamplingOptions};

/// Training timesteps of the underlying model
pub const NUM_TRAIN_TIMESTEPS: usize = 1000;

/// Noise-prediction network at a global training timestep
pub trait NoisePredictor<B: Backend> {
    fn predict_noise(&self, x: Tensor<B, 4>, timestep: usize) -> Tensor<B, 4>;
}

// ============================================================================
// Noise schedule
// ============================================================================

/// Cumulative signal rates over the training timesteps
#[derive(Debug, Clone)]
pub struct NoiseSchedule {
    alphas_cumprod: Vec<f64>,
}

impl NoiseSchedule {
    /// Linear beta schedule
    pub fn linear(num_steps: usize, beta_start: f64, beta_end: f64) -> Self {
        let mut cumprod = 1.0;
        let alphas_cumprod = (0..num_steps)
            .map(|i| {
                let t = i as f64 / (num_steps.max(2) - 1) as f64;
                cumprod *= 1.0 - (beta_start + t * (beta_end - beta_start));
                cumprod
            })
            .collect();
        Self { alphas_cumprod }
    }

    /// Cosine schedule with offset `s = 0.008`
    pub fn cosine(num_steps: usize) -> Self {
        let f = |t: f64| {
            let s = 0.008;
            (((t / num_steps as f64) + s) / (1.0 + s) * std::f64::consts::FRAC_PI_2)
                .cos()
                .powi(2)
        };
        let mut cumprod = 1.0;
        let alphas_cumprod = (0..num_steps)
            .map(|i| {
                let beta = (1.0 - f((i + 1) as f64) / f(i as f64)).clamp(0.0, 0.999);
                cumprod *= 1.0 - beta;
                cumprod
            })
            .collect();
        Self { alphas_cumprod }
    }

    /// The 256x256 unconditional model schedule
    pub fn default_linear() -> Self {
        Self::linear(NUM_TRAIN_TIMESTEPS, 1e-4, 0.02)
    }

    pub fn alpha_cumprod(&self, timestep: usize) -> f64 {
        self.alphas_cumprod[timestep.min(self.alphas_cumprod.len() - 1)]
    }

    pub fn len(&self) -> usize {
        self.alphas_cumprod.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alphas_cumprod.is_empty()
    }
}

// ============================================================================
// Guided sampler
// ============================================================================

/// Denoiser wrapping a [`NoisePredictor`] with evenly respaced timesteps
pub struct GuidedDiffusion<B: AutodiffBackend, M> {
    model: M,
    schedule: NoiseSchedule,
    /// Global timestep per trajectory index, ascending
    timesteps: Vec<usize>,
    /// Previous noise estimates for PLMS
    history: RefCell<Vec<Tensor<B, 4>>>,
}

impl<B: AutodiffBackend, M: NoisePredictor<B>> GuidedDiffusion<B, M> {
    pub fn new(model: M, schedule: NoiseSchedule, steps: usize) -> Self {
        let steps = steps.clamp(1, schedule.len());
        let step_ratio = schedule.len() / steps;
        let timesteps = (0..steps).map(|i| i * step_ratio).collect();
        Self {
            model,
            schedule,
            timesteps,
            history: RefCell::new(Vec::new()),
        }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    fn alpha_prev(&self, t: usize) -> f64 {
        if t == 0 {
            1.0
        } else {
            self.alpha_cumprod(t - 1)
        }
    }

    fn start_from_eps(x: Tensor<B, 4>, eps: Tensor<B, 4>, alpha: f64) -> Tensor<B, 4> {
        (x - eps * (1.0 - alpha).sqrt()) / alpha.sqrt()
    }

    /// Adams-Bashforth combination of the current and previous estimates
    fn plms_eps(&self, eps: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut history = self.history.borrow_mut();
        let combined = match history.as_slice() {
            [] => eps.clone(),
            [e1] => (eps.clone() * 3.0 - e1.clone()) / 2.0,
            [e2, e1] => {
                (eps.clone() * 23.0 - e1.clone() * 16.0 + e2.clone() * 5.0) / 12.0
            }
            [.., e3, e2, e1] => {
                (eps.clone() * 55.0 - e1.clone() * 59.0 + e2.clone() * 37.0 - e3.clone() * 9.0)
                    / 24.0
            }
        };
        history.push(eps);
        if history.len() > 3 {
            history.remove(0);
        }
        combined
    }
}

impl<B: AutodiffBackend, M: NoisePredictor<B>> Denoiser<B> for GuidedDiffusion<B, M> {
    fn num_timesteps(&self) -> usize {
        self.timesteps.len()
    }

    fn global_timestep(&self, t: usize) -> usize {
        self.timesteps[t.min(self.timesteps.len() - 1)]
    }

    fn alpha_cumprod(&self, t: usize) -> f64 {
        self.schedule.alpha_cumprod(self.global_timestep(t))
    }

    fn predict_start(&self, x: Tensor<B, 4>, t: usize) -> Tensor<B, 4> {
        let eps = self.model.predict_noise(x.clone(), self.global_timestep(t));
        Self::start_from_eps(x, eps, self.alpha_cumprod(t))
    }

    fn begin_trajectory(&self) {
        self.history.borrow_mut().clear();
    }

    fn step(
        &self,
        x: Tensor<B, 4>,
        t: usize,
        cond: &mut dyn CondFn<B>,
        options: &SamplingOptions,
    ) -> DenoiseStep<B> {
        let x = x.detach();
        let alpha = self.alpha_cumprod(t);
        let alpha_prev = self.alpha_prev(t);
        let sqrt_one_minus = (1.0 - alpha).sqrt();

        let eps = self
            .model
            .predict_noise(x.clone(), self.global_timestep(t))
            .detach();
        let grad = cond.gradient(x.clone(), t).detach();
        let mut eps = eps - grad * sqrt_one_minus;

        let mut pred_xstart = Self::start_from_eps(x.clone(), eps.clone(), alpha);
        if options.clip_denoised {
            pred_xstart = pred_xstart.clamp(-1.0, 1.0);
            eps = (x.clone() - pred_xstart.clone() * alpha.sqrt()) / sqrt_one_minus.max(1e-8);
        }

        let sample = match options.mode {
            SamplingMode::Ddim => {
                let sigma = options.eta
                    * ((1.0 - alpha_prev) / (1.0 - alpha).max(1e-12)).sqrt()
                    * (1.0 - alpha / alpha_prev).max(0.0).sqrt();
                let dir = (1.0 - alpha_prev - sigma * sigma).max(0.0).sqrt();
                let mean = pred_xstart.clone() * alpha_prev.sqrt() + eps * dir;
                if t > 0 && sigma > 0.0 {
                    let noise = Tensor::random(
                        x.shape(),
                        burn::tensor::Distribution::Normal(0.0, 1.0),
                        &x.device(),
                    );
                    mean + noise * sigma
                } else {
                    mean
                }
            }
            SamplingMode::Plms => {
                let eps = self.plms_eps(eps);
                pred_xstart = Self::start_from_eps(x, eps.clone(), alpha);
                if options.clip_denoised {
                    pred_xstart = pred_xstart.clamp(-1.0, 1.0);
                }
                pred_xstart.clone() * alpha_prev.sqrt() + eps * (1.0 - alpha_prev).sqrt()
            }
        };

        DenoiseStep {
            sample,
            pred_xstart,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::Autodiff;
    use burn_ndarray::NdArray;

    type TestBackend = Autodiff<NdArray<f32>>;

    struct ZeroNoise;

    impl NoisePredictor<TestBackend> for ZeroNoise {
        fn predict_noise(&self, x: Tensor<TestBackend, 4>, _timestep: usize) -> Tensor<TestBackend, 4> {
            x.zeros_like()
        }
    }

    struct NoGuidance;

    impl CondFn<TestBackend> for NoGuidance {
        fn gradient(&mut self, x: Tensor<TestBackend, 4>, _t: usize) -> Tensor<TestBackend, 4> {
            x.zeros_like()
        }
    }

    struct ConstantGuidance(f32);

    impl CondFn<TestBackend> for ConstantGuidance {
        fn gradient(&mut self, x: Tensor<TestBackend, 4>, _t: usize) -> Tensor<TestBackend, 4> {
            x.ones_like() * self.0
        }
    }

    #[test]
    fn test_linear_schedule() {
        let s = NoiseSchedule::default_linear();
        assert_eq!(s.len(), 1000);
        assert!((s.alpha_cumprod(0) - 0.9999).abs() < 1e-9);
        assert!(s.alpha_cumprod(999) < 1e-4);
        assert!(s.alpha_cumprod(500) < s.alpha_cumprod(499));
    }

    #[test]
    fn test_cosine_schedule_monotone() {
        let s = NoiseSchedule::cosine(1000);
        assert!(s.alpha_cumprod(0) > 0.99);
        assert!(s.alpha_cumprod(999) < 0.01);
        assert!((1..1000).all(|i| s.alpha_cumprod(i) <= s.alpha_cumprod(i - 1)));
    }

    #[test]
    fn test_respacing() {
        let d = GuidedDiffusion::<TestBackend, _>::new(ZeroNoise, NoiseSchedule::default_linear(), 250);
        assert_eq!(d.num_timesteps(), 250);
        assert_eq!(d.global_timestep(0), 0);
        assert_eq!(d.global_timestep(249), 996);
    }

    #[test]
    fn test_deterministic_ddim_step() {
        let device = Default::default();
        let d = GuidedDiffusion::<TestBackend, _>::new(ZeroNoise, NoiseSchedule::default_linear(), 10);
        let x = Tensor::<TestBackend, 4>::ones([1, 3, 4, 4], &device);
        let options = SamplingOptions {
            eta: 0.0,
            ..Default::default()
        };
        let t = 5;
        let out = d.step(x, t, &mut NoGuidance, &options);

        // With zero noise the clean estimate is x / sqrt(ᾱ_t)
        let expected_start = 1.0 / d.alpha_cumprod(t).sqrt();
        let start: Vec<f32> = out.pred_xstart.to_data().to_vec().unwrap();
        assert!(start.iter().all(|v| (*v as f64 - expected_start).abs() < 1e-4));

        let expected_sample = expected_start * d.alpha_cumprod(t - 1).sqrt();
        let sample: Vec<f32> = out.sample.to_data().to_vec().unwrap();
        assert!(sample.iter().all(|v| (*v as f64 - expected_sample).abs() < 1e-4));
    }

    #[test]
    fn test_guidance_moves_estimate() {
        let device = Default::default();
        let d = GuidedDiffusion::<TestBackend, _>::new(ZeroNoise, NoiseSchedule::default_linear(), 10);
        let x = Tensor::<TestBackend, 4>::zeros([1, 3, 4, 4], &device);
        let options = SamplingOptions {
            eta: 0.0,
            ..Default::default()
        };
        let out = d.step(x, 9, &mut ConstantGuidance(1.0), &options);
        let start: Vec<f32> = out.pred_xstart.to_data().to_vec().unwrap();
        assert!(start.iter().all(|v| *v > 0.0));
    }

    #[test]
    fn test_plms_history_reset() {
        let device = Default::default();
        let d = GuidedDiffusion::<TestBackend, _>::new(ZeroNoise, NoiseSchedule::default_linear(), 10);
        let options = SamplingOptions {
            mode: SamplingMode::Plms,
            ..Default::default()
        };
        let mut x = Tensor::<TestBackend, 4>::ones([1, 3, 2, 2], &device);
        for t in (0..10).rev() {
            x = d.step(x, t, &mut NoGuidance, &options).sample;
        }
        assert_eq!(d.history.borrow().len(), 3);
        d.begin_trajectory();
        assert!(d.history.borrow().is_empty());
    }
}
