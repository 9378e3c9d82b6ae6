//! Denoiser and estimator contracts
//!
//! The diffusion model is consumed through [`Denoiser`]: it exposes its noise
//! levels, a differentiable clean-image estimate, and one guided sampling step.
//! Trajectory indices `t` run from `num_timesteps() - 1` (noisiest) down to 0.

use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn_disco_core::SamplingMode;

/// Conditioning callback invoked once per denoiser step
pub trait CondFn<B: Backend> {
    /// Steering gradient for `x` at trajectory index `t`, same shape as `x`
    fn gradient(&mut self, x: Tensor<B, 4>, t: usize) -> Tensor<B, 4>;
}

/// Options forwarded to every denoiser step
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingOptions {
    pub mode: SamplingMode,
    /// DDIM stochasticity (0.0 = deterministic)
    pub eta: f64,
    /// Clamp the clean-image estimate to [-1, 1]
    pub clip_denoised: bool,
}

impl Default for SamplingOptions {
    fn default() -> Self {
        Self {
            mode: SamplingMode::Ddim,
            eta: 0.8,
            clip_denoised: false,
        }
    }
}

/// Result of one denoiser step
#[derive(Debug, Clone)]
pub struct DenoiseStep<B: Backend> {
    /// Next, less noisy sample
    pub sample: Tensor<B, 4>,
    /// Predicted clean image at this step
    pub pred_xstart: Tensor<B, 4>,
}

/// Opaque diffusion model driving the trajectory
pub trait Denoiser<B: AutodiffBackend> {
    /// Number of steps of the (respaced) trajectory
    fn num_timesteps(&self) -> usize;

    /// Training timestep in `0..1000` for trajectory index `t`
    fn global_timestep(&self, t: usize) -> usize;

    /// Cumulative signal rate ᾱ at trajectory index `t`
    fn alpha_cumprod(&self, t: usize) -> f64;

    /// Differentiable clean-image estimate of `x` at trajectory index `t`
    fn predict_start(&self, x: Tensor<B, 4>, t: usize) -> Tensor<B, 4>;

    /// One guided step from index `t` to `t - 1`
    fn step(
        &self,
        x: Tensor<B, 4>,
        t: usize,
        cond: &mut dyn CondFn<B>,
        options: &SamplingOptions,
    ) -> DenoiseStep<B>;

    /// Reset any per-trajectory state before a new batch
    fn begin_trajectory(&self) {}

    /// Noise `x_start` forward to trajectory index `t`
    fn q_sample(&self, x_start: Tensor<B, 4>, t: usize, noise: Tensor<B, 4>) -> Tensor<B, 4> {
        let alpha = self.alpha_cumprod(t);
        x_start * alpha.sqrt() + noise * (1.0 - alpha).sqrt()
    }
}

/// Lightweight clean-image estimator used in place of the denoiser
pub trait SecondaryModel<B: Backend> {
    /// Predict the clean image of `x` at cosine time `cosine_t` in `[0, 1]`
    fn predict(&self, x: Tensor<B, 4>, cosine_t: f64) -> Tensor<B, 4>;
}

/// Perceptual distance between images, used for the init-image loss
pub trait PerceptualModel<B: Backend> {
    /// Per-sample distance `[n]` between two `[n, 3, h, w]` batches
    fn distance(&self, a: Tensor<B, 4>, b: Tensor<B, 4>) -> Tensor<B, 1>;
}

/// Mean squared pixel distance
#[derive(Debug, Clone, Copy, Default)]
pub struct MseDistance;

impl<B: Backend> PerceptualModel<B> for MseDistance {
    fn distance(&self, a: Tensor<B, 4>, b: Tensor<B, 4>) -> Tensor<B, 1> {
        (a - b)
            .powf_scalar(2.0)
            .flatten::<2>(1, 3)
            .mean_dim(1)
            .squeeze::<1>(1)
    }
}

/// Cosine time of a noise level, `atan2(sigma, alpha) * 2 / pi`
pub fn alpha_sigma_to_t(alpha: f64, sigma: f64) -> f64 {
    sigma.atan2(alpha) * 2.0 / std::f64::consts::PI
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    #[test]
    fn test_alpha_sigma_to_t() {
        assert!((alpha_sigma_to_t(1.0, 0.0)).abs() < 1e-12);
        assert!((alpha_sigma_to_t(0.0, 1.0) - 1.0).abs() < 1e-12);
        let half = std::f64::consts::FRAC_1_SQRT_2;
        assert!((alpha_sigma_to_t(half, half) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_mse_distance() {
        let device = Default::default();
        let a = Tensor::<NdArray<f32>, 4>::zeros([2, 3, 2, 2], &device);
        let b = Tensor::<NdArray<f32>, 4>::ones([2, 3, 2, 2], &device) * 2.0;
        let d: Vec<f32> = MseDistance.distance(a, b).to_data().to_vec().unwrap();
        assert_eq!(d, vec![4.0, 4.0]);
    }
}
