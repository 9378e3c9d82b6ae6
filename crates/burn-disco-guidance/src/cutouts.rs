//! Cutout sampling
//!
//! Probes the embedding model with several views of the working image:
//! deterministic overviews of the whole frame followed by randomly placed
//! inner crops. All views are differentiable with respect to the input.

use burn::prelude::*;
use burn::tensor::module::{adaptive_avg_pool2d, interpolate};
use burn::tensor::ops::{InterpolateMode, InterpolateOptions};
use burn_disco_core::StepParams;
use rand::Rng;

/// Per-step cutout counts and shape parameters
#[derive(Debug, Clone, PartialEq)]
pub struct CutoutSpec {
    /// Whole-frame views
    pub overview: usize,
    /// Random inner crops
    pub inner_crop: usize,
    /// Inner crop size power (lower means larger crops on average)
    pub ic_size_pow: f64,
    /// Fraction of inner crops converted to grayscale
    pub grey_fraction: f64,
    /// Disable random flips and grayscale on inner crops
    pub skip_augs: bool,
}

impl CutoutSpec {
    pub fn total(&self) -> usize {
        self.overview + self.inner_crop
    }
}

impl From<&StepParams> for CutoutSpec {
    fn from(params: &StepParams) -> Self {
        Self {
            overview: params.cut_overview,
            inner_crop: params.cut_innercut,
            ic_size_pow: params.cut_ic_pow,
            grey_fraction: params.cut_icgray_p,
            skip_augs: params.skip_augs,
        }
    }
}

/// Probability of a random horizontal flip on an inner crop
const AUG_FLIP_P: f64 = 0.5;
/// Probability of a random grayscale conversion on an inner crop
const AUG_GREY_P: f64 = 0.1;

#[derive(Debug, Clone, Copy)]
pub struct CutoutSampler {
    cut_size: usize,
}

impl CutoutSampler {
    pub fn new(cut_size: usize) -> Self {
        Self {
            cut_size: cut_size.max(1),
        }
    }

    pub fn cut_size(&self) -> usize {
        self.cut_size
    }

    /// Sample views of `image` (`[n, 3, h, w]`, values in `[0, 1]`)
    ///
    /// Returns `[views * n, 3, cut, cut]` ordered view-major: rows
    /// `v * n .. (v + 1) * n` hold view `v` of every image. Returns `None`
    /// when `spec` asks for no views.
    pub fn sample<B: Backend, R: Rng>(
        &self,
        image: Tensor<B, 4>,
        spec: &CutoutSpec,
        rng: &mut R,
    ) -> Option<Tensor<B, 4>> {
        if spec.total() == 0 {
            return None;
        }
        let [n, c, h, w] = image.dims();
        let cut = self.cut_size;
        let mut views = Vec::with_capacity(spec.total());

        if spec.overview > 0 {
            let side = h.max(w);
            let (pad_w, pad_h) = (side - w, side - h);
            let padded = if pad_w > 0 || pad_h > 0 {
                image
                    .clone()
                    .pad((pad_w / 2, pad_w - pad_w / 2, pad_h / 2, pad_h - pad_h / 2), 0.0)
            } else {
                image.clone()
            };
            let overview = resize_view(padded, cut);

            for i in 0..spec.overview {
                let view = match i % 4 {
                    0 => overview.clone(),
                    1 => grayscale(overview.clone()),
                    2 => overview.clone().flip([3]),
                    _ => grayscale(overview.clone().flip([3])),
                };
                views.push(view);
            }
        }

        let max_size = h.min(w);
        let min_size = h.min(w).min(cut);
        let grey_limit = (spec.grey_fraction * spec.inner_crop as f64) as usize;
        for i in 0..spec.inner_crop {
            let u: f64 = rng.gen();
            let size = (u.powf(spec.ic_size_pow) * (max_size - min_size) as f64 + min_size as f64)
                as usize;
            let size = size.clamp(1, max_size);
            let offset_x = rng.gen_range(0..=w - size);
            let offset_y = rng.gen_range(0..=h - size);

            let mut crop = image.clone().slice([
                0..n,
                0..c,
                offset_y..offset_y + size,
                offset_x..offset_x + size,
            ]);
            if i <= grey_limit {
                crop = grayscale(crop);
            }
            let mut crop = resize_view(crop, cut);

            if !spec.skip_augs {
                let flip = rng.gen_bool(AUG_FLIP_P);
                let grey = rng.gen_bool(AUG_GREY_P);
                if flip {
                    crop = crop.flip([3]);
                }
                if grey {
                    crop = grayscale(crop);
                }
            }
            views.push(crop);
        }

        Some(Tensor::cat(views, 0))
    }
}

/// Resample a view to `cut x cut`: area averaging when shrinking, bilinear when enlarging
fn resize_view<B: Backend>(view: Tensor<B, 4>, cut: usize) -> Tensor<B, 4> {
    let [_, _, h, w] = view.dims();
    if h >= cut && w >= cut {
        adaptive_avg_pool2d(view, [cut, cut])
    } else {
        interpolate(
            view,
            [cut, cut],
            InterpolateOptions::new(InterpolateMode::Bilinear),
        )
    }
}

/// ITU-R 601 luma replicated over three channels
pub fn grayscale<B: Backend>(image: Tensor<B, 4>) -> Tensor<B, 4> {
    let [n, _, h, w] = image.dims();
    let channel = |i: usize| image.clone().slice([0..n, i..i + 1, 0..h, 0..w]);
    let luma = channel(0) * 0.2989 + channel(1) * 0.587 + channel(2) * 0.114;
    Tensor::cat(vec![luma.clone(), luma.clone(), luma], 1)
}
