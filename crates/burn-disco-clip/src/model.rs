//! Embedding model contract
//!
//! Image and text encoders are consumed as black boxes mapping into a shared
//! embedding space.

use burn::prelude::*;

/// Per-channel mean of CLIP image preprocessing
pub const CLIP_MEAN: [f32; 3] = [0.48145466, 0.4578275, 0.40821073];
/// Per-channel standard deviation of CLIP image preprocessing
pub const CLIP_STD: [f32; 3] = [0.26862954, 0.26130258, 0.27577711];

/// Default square input side of CLIP vision towers
pub const DEFAULT_INPUT_RESOLUTION: usize = 224;

/// A pretrained vision-language embedding model
pub trait EmbeddingModel<B: Backend> {
    /// Square side length expected by [`encode_image`](Self::encode_image)
    fn input_resolution(&self) -> usize {
        DEFAULT_INPUT_RESOLUTION
    }

    /// Embed one tokenized prompt, returning `[1, dim]`
    fn encode_text(&self, tokens: &[String]) -> Tensor<B, 2>;

    /// Embed normalized views `[n, 3, res, res]`, returning `[n, dim]`
    ///
    /// Must stay differentiable with respect to `images`.
    fn encode_image(&self, images: Tensor<B, 4>) -> Tensor<B, 2>;
}

/// Apply CLIP mean/std normalization to images in `[0, 1]`
pub fn normalize_image<B: Backend>(images: Tensor<B, 4>) -> Tensor<B, 4> {
    let device = images.device();
    let mean = Tensor::<B, 1>::from_floats(CLIP_MEAN, &device).reshape([1, 3, 1, 1]);
    let std = Tensor::<B, 1>::from_floats(CLIP_STD, &device).reshape([1, 3, 1, 1]);
    (images - mean) / std
}
