//! burn-disco-guidance: steering a diffusion trajectory with image-text losses
//!
//! - [`Denoiser`] is the diffusion model contract, [`GuidedDiffusion`] a
//!   DDIM/PLMS implementation over any [`NoisePredictor`]
//! - [`CutoutSampler`] produces the views scored by embedding models
//! - [`GuidanceEngine`] computes the conditioning gradient per step

pub mod cutouts;
pub mod diffusion;
pub mod engine;
pub mod losses;
pub mod model;
pub mod transform;

pub use cutouts::{grayscale, CutoutSampler, CutoutSpec};
pub use diffusion::{GuidedDiffusion, NoisePredictor, NoiseSchedule, NUM_TRAIN_TIMESTEPS};
pub use engine::{clamp_magnitude, GuidanceContext, GuidanceEngine};
pub use losses::{l2_normalize, range_loss, sat_loss, spherical_dist_loss, tv_loss};
pub use model::{
    alpha_sigma_to_t, CondFn, DenoiseStep, Denoiser, MseDistance, PerceptualModel,
    SamplingOptions, SecondaryModel,
};
pub use transform::{symmetrize, transformation_steps};
