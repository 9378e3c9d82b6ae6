//! burn-disco-clip: prompts and embedding models
//!
//! - [`PromptPlan`] turns prompt declarations into scheduled, weighted prompts
//! - [`EmbeddingModel`] is the contract for vision-language encoders
//! - [`ModelCache`] holds loaded encoders for the lifetime of the caller

pub mod cache;
pub mod model;
pub mod prompt;
pub mod tokenizer;

pub use cache::{ModelCache, SharedModel};
pub use model::{normalize_image, EmbeddingModel, CLIP_MEAN, CLIP_STD, DEFAULT_INPUT_RESOLUTION};
pub use prompt::{ActivePrompts, Prompt, PromptError, PromptPlan, PROMPT_SCHEMA_VERSION};
pub use tokenizer::{PromptTokenizer, TokenizerError};
