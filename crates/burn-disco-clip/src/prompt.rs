//! Prompt plan
//!
//! Normalizes prompt declarations into [`Prompt`]s and answers which prompts
//! guide a given embedding model at a given step.

use std::collections::BTreeSet;

use burn_disco_core::{
    PromptSpec, Schedule, ScheduleError, ScheduleInput, ScheduleResolver, TextPrompts,
};
use thiserror::Error;
use tracing::{debug, warn};

use crate::tokenizer::{PromptTokenizer, TokenizerError};

/// Only supported version of the structured prompt schema
pub const PROMPT_SCHEMA_VERSION: &str = "1";

/// Absolute weight sums at or below this are treated as zero
const MIN_WEIGHT_SUM: f64 = 1e-5;

#[derive(Error, Debug)]
pub enum PromptError {
    #[error("no prompts given")]
    Empty,

    #[error("prompt {index} references embedding model `{model}` which is not configured")]
    UnknownModel { index: usize, model: String },

    #[error("unsupported prompt schema version `{0}`, expected `{PROMPT_SCHEMA_VERSION}`")]
    UnsupportedSchema(String),

    #[error("prompt {index} weight is given both inline ({inline}) and as `{explicit}`")]
    WeightConflict {
        index: usize,
        inline: f64,
        explicit: String,
    },

    #[error("prompt {index}: {source}")]
    Schedule {
        index: usize,
        #[source]
        source: ScheduleError,
    },

    #[error(transparent)]
    Tokenizer(#[from] TokenizerError),
}

/// One normalized prompt
#[derive(Debug, Clone)]
pub struct Prompt {
    pub text: String,
    pub tokens: Vec<String>,
    /// Embedding-space weight per step
    pub weight: Schedule,
    /// Activation per step
    pub schedule: Schedule,
    /// Embedding models this prompt guides
    pub clip_guidance: BTreeSet<String>,
}

/// Prompts active for one model at one step
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActivePrompts {
    /// Prompt indices, ascending
    pub indices: Vec<usize>,
    /// Raw weights, parallel to `indices`
    pub weights: Vec<f64>,
}

impl ActivePrompts {
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    /// Weights divided by the absolute value of their sum
    ///
    /// A zero or negative sum is reported as a warning. Returns `None` when
    /// the sum is too close to zero to normalize by.
    pub fn normalized_weights(&self) -> Option<Vec<f64>> {
        let sum: f64 = self.weights.iter().sum();
        if sum <= 0.0 {
            warn!(
                "prompt weights {:?} sum to {}, guidance may push away from the prompts",
                self.weights, sum
            );
        }
        if sum.abs() <= MIN_WEIGHT_SUM {
            warn!("prompt weights sum to zero, skipping");
            return None;
        }
        Some(self.weights.iter().map(|w| w / sum.abs()).collect())
    }
}

/// All prompts of a run
#[derive(Debug, Clone)]
pub struct PromptPlan {
    prompts: Vec<Prompt>,
    models: Vec<String>,
}

impl PromptPlan {
    /// Build a plan with a merge-less tokenizer
    pub fn build(
        input: &TextPrompts,
        models: &[String],
        resolver: &mut ScheduleResolver,
    ) -> Result<Self, PromptError> {
        let tokenizer = PromptTokenizer::new()?;
        Self::build_with_tokenizer(input, models, resolver, &tokenizer)
    }

    pub fn build_with_tokenizer(
        input: &TextPrompts,
        models: &[String],
        resolver: &mut ScheduleResolver,
        tokenizer: &PromptTokenizer,
    ) -> Result<Self, PromptError> {
        let all_models: BTreeSet<String> = models.iter().cloned().collect();
        let always = Schedule::constant(1.0);

        let legacy = |texts: &[String]| -> Vec<Prompt> {
            texts
                .iter()
                .filter(|t| !t.trim().is_empty())
                .map(|t| {
                    let (text, weight) = split_weight(t);
                    Prompt {
                        tokens: tokenizer.tokenize(text),
                        text: text.to_string(),
                        weight: Schedule::constant(weight.unwrap_or(1.0)),
                        schedule: always.clone(),
                        clip_guidance: all_models.clone(),
                    }
                })
                .collect()
        };

        let prompts = match input {
            TextPrompts::Single(text) => legacy(std::slice::from_ref(text)),
            TextPrompts::Legacy(texts) => legacy(texts),
            TextPrompts::Structured(structured) => {
                if structured.version != PROMPT_SCHEMA_VERSION {
                    return Err(PromptError::UnsupportedSchema(structured.version.clone()));
                }
                structured
                    .prompts
                    .iter()
                    .enumerate()
                    .map(|(index, spec)| {
                        structured_prompt(index, spec, &all_models, resolver, tokenizer)
                    })
                    .collect::<Result<Vec<_>, _>>()?
            }
        };

        if prompts.is_empty() {
            return Err(PromptError::Empty);
        }
        debug!("prompt plan with {} prompts over {} models", prompts.len(), models.len());

        Ok(Self {
            prompts,
            models: models.to_vec(),
        })
    }

    /// Prompts guiding `model` at `step`, in declaration order
    ///
    /// Prompts that are inactive, not eligible for `model`, or weighted
    /// exactly zero at `step` are left out.
    pub fn active(&self, model: &str, step: usize) -> ActivePrompts {
        let mut active = ActivePrompts::default();
        for (index, prompt) in self.prompts.iter().enumerate() {
            if !prompt.schedule.flag(step) || !prompt.clip_guidance.contains(model) {
                continue;
            }
            let weight = prompt.weight.value(step);
            if weight == 0.0 {
                continue;
            }
            active.indices.push(index);
            active.weights.push(weight);
        }
        active
    }

    /// Whether prompt `index` can ever guide `model`
    pub fn is_eligible(&self, index: usize, model: &str) -> bool {
        self.prompts
            .get(index)
            .is_some_and(|p| p.clip_guidance.contains(model))
    }

    pub fn prompts(&self) -> &[Prompt] {
        &self.prompts
    }

    pub fn get(&self, index: usize) -> Option<&Prompt> {
        self.prompts.get(index)
    }

    pub fn models(&self) -> &[String] {
        &self.models
    }

    pub fn len(&self) -> usize {
        self.prompts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prompts.is_empty()
    }
}

fn structured_prompt(
    index: usize,
    spec: &PromptSpec,
    all_models: &BTreeSet<String>,
    resolver: &mut ScheduleResolver,
    tokenizer: &PromptTokenizer,
) -> Result<Prompt, PromptError> {
    let schedule_err = |source| PromptError::Schedule { index, source };
    let (text, inline) = split_weight(&spec.text);

    let weight = match (&spec.weight, inline) {
        (None, inline) => Schedule::constant(inline.unwrap_or(1.0)),
        (Some(explicit), None) => resolver.resolve(explicit).map_err(schedule_err)?,
        (Some(explicit), Some(inline)) => {
            let same = match explicit {
                ScheduleInput::Int(i) => *i as f64 == inline,
                ScheduleInput::Float(f) => *f == inline,
                _ => false,
            };
            if !same {
                return Err(PromptError::WeightConflict {
                    index,
                    inline,
                    explicit: describe(explicit),
                });
            }
            Schedule::constant(inline)
        }
    };

    let schedule = match &spec.schedule {
        Some(input) => resolver.resolve(input).map_err(schedule_err)?,
        None => Schedule::constant(1.0),
    };

    let clip_guidance = match &spec.clip_guidance {
        Some(ids) => {
            if let Some(unknown) = ids.iter().find(|id| !all_models.contains(*id)) {
                return Err(PromptError::UnknownModel {
                    index,
                    model: unknown.clone(),
                });
            }
            ids.iter().cloned().collect()
        }
        None => all_models.clone(),
    };

    Ok(Prompt {
        tokens: tokenizer.tokenize(text),
        text: text.to_string(),
        weight,
        schedule,
        clip_guidance,
    })
}

/// Split a trailing `:weight` off prompt text
///
/// Only a suffix that parses as a number is treated as a weight, so colons
/// inside the text are kept.
fn split_weight(raw: &str) -> (&str, Option<f64>) {
    if let Some((text, suffix)) = raw.rsplit_once(':') {
        if let Ok(weight) = suffix.trim().parse::<f64>() {
            return (text.trim(), Some(weight));
        }
    }
    (raw.trim(), None)
}

fn describe(input: &ScheduleInput) -> String {
    match input {
        ScheduleInput::Bool(b) => b.to_string(),
        ScheduleInput::Int(i) => i.to_string(),
        ScheduleInput::Float(f) => f.to_string(),
        ScheduleInput::Expr(s) => s.clone(),
        ScheduleInput::List(v) => format!("list of {}", v.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_disco_core::StructuredPrompts;

    fn models() -> Vec<String> {
        vec!["ViT-B-32::openai".to_string(), "RN50::openai".to_string()]
    }

    fn spec(text: &str) -> PromptSpec {
        PromptSpec {
            text: text.to_string(),
            weight: None,
            schedule: None,
            clip_guidance: None,
        }
    }

    fn structured(prompts: Vec<PromptSpec>) -> TextPrompts {
        TextPrompts::Structured(StructuredPrompts {
            version: "1".to_string(),
            prompts,
        })
    }

    #[test]
    fn test_split_weight() {
        assert_eq!(split_weight("a cat:2"), ("a cat", Some(2.0)));
        assert_eq!(split_weight("a cat:-0.5"), ("a cat", Some(-0.5)));
        assert_eq!(split_weight("a cat"), ("a cat", None));
        assert_eq!(split_weight("ratio 16:9 frame"), ("ratio 16:9 frame", None));
        assert_eq!(split_weight("see http://x.y"), ("see http://x.y", None));
    }

    #[test]
    fn test_legacy_prompts() {
        let input = TextPrompts::Legacy(vec!["sunset:3".into(), "  ".into(), "ocean".into()]);
        let plan = PromptPlan::build(&input, &models(), &mut ScheduleResolver::new()).unwrap();
        assert_eq!(plan.len(), 2);
        assert_eq!(plan.prompts()[0].text, "sunset");
        assert_eq!(plan.prompts()[0].weight.value(0), 3.0);
        assert_eq!(plan.prompts()[1].weight.value(0), 1.0);
        assert!(!plan.prompts()[1].tokens.is_empty());

        let active = plan.active("RN50::openai", 10);
        assert_eq!(active.indices, vec![0, 1]);
        assert_eq!(active.weights, vec![3.0, 1.0]);
        assert_eq!(active.normalized_weights(), Some(vec![0.75, 0.25]));
    }

    #[test]
    fn test_single_prompt() {
        let input = TextPrompts::Single("a quiet harbour".into());
        let plan = PromptPlan::build(&input, &models(), &mut ScheduleResolver::new()).unwrap();
        assert_eq!(plan.len(), 1);
    }

    #[test]
    fn test_empty() {
        let mut resolver = ScheduleResolver::new();
        for input in [
            TextPrompts::Legacy(vec![]),
            TextPrompts::Single(" ".into()),
            structured(vec![]),
        ] {
            assert!(matches!(
                PromptPlan::build(&input, &models(), &mut resolver),
                Err(PromptError::Empty)
            ));
        }
    }

    #[test]
    fn test_unknown_model() {
        let mut p = spec("castle");
        p.clip_guidance = Some(vec!["ViT-L-14::openai".into()]);
        let err = PromptPlan::build(&structured(vec![p]), &models(), &mut ScheduleResolver::new())
            .unwrap_err();
        assert!(matches!(err, PromptError::UnknownModel { index: 0, ref model } if model == "ViT-L-14::openai"));
    }

    #[test]
    fn test_schema_version() {
        let input = TextPrompts::Structured(StructuredPrompts {
            version: "2".into(),
            prompts: vec![spec("castle")],
        });
        assert!(matches!(
            PromptPlan::build(&input, &models(), &mut ScheduleResolver::new()),
            Err(PromptError::UnsupportedSchema(_))
        ));
    }

    #[test]
    fn test_weight_conflict() {
        let mut agree = spec("castle:2");
        agree.weight = Some(ScheduleInput::Int(2));
        let mut disagree = spec("tower:2");
        disagree.weight = Some(ScheduleInput::Float(3.0));

        let mut resolver = ScheduleResolver::new();
        let plan = PromptPlan::build(&structured(vec![agree.clone()]), &models(), &mut resolver)
            .unwrap();
        assert_eq!(plan.prompts()[0].weight.value(0), 2.0);

        assert!(matches!(
            PromptPlan::build(&structured(vec![agree, disagree]), &models(), &mut resolver),
            Err(PromptError::WeightConflict { index: 1, .. })
        ));
    }

    #[test]
    fn test_bad_schedule() {
        let mut p = spec("castle");
        p.schedule = Some("[True]*10".into());
        assert!(matches!(
            PromptPlan::build(&structured(vec![p]), &models(), &mut ScheduleResolver::new()),
            Err(PromptError::Schedule { index: 0, .. })
        ));
    }

    #[test]
    fn test_active_filters_and_orders() {
        let mut first = spec("first");
        first.schedule = Some("[False]*500+[True]*500".into());
        let mut second = spec("second");
        second.clip_guidance = Some(vec!["RN50::openai".into()]);
        let mut third = spec("third");
        third.weight = Some("[0]*100+[2]*900".into());
        let plan = PromptPlan::build(
            &structured(vec![first, second, third]),
            &models(),
            &mut ScheduleResolver::new(),
        )
        .unwrap();

        let vit = "ViT-B-32::openai";
        assert!(plan.active(vit, 0).is_empty());
        assert_eq!(plan.active(vit, 100).indices, vec![2]);
        assert_eq!(plan.active(vit, 600).indices, vec![0, 2]);
        assert_eq!(plan.active(vit, 600).weights, vec![1.0, 2.0]);
        assert_eq!(plan.active("RN50::openai", 600).indices, vec![0, 1, 2]);
        assert_eq!(plan.active("RN50::openai", 0).indices, vec![1]);
        assert!(!plan.is_eligible(1, vit));

        for step in [0, 250, 499, 500, 999] {
            for model in plan.models() {
                let active = plan.active(model, step);
                assert!(active.indices.windows(2).all(|w| w[0] < w[1]));
                for &i in &active.indices {
                    assert!(plan.is_eligible(i, model));
                    assert!(plan.get(i).unwrap().schedule.flag(step));
                }
            }
        }
    }

    #[test]
    fn test_degenerate_weights() {
        let zero = ActivePrompts {
            indices: vec![0, 1],
            weights: vec![1.0, -1.0],
        };
        assert_eq!(zero.normalized_weights(), None);

        let negative = ActivePrompts {
            indices: vec![0],
            weights: vec![-2.0],
        };
        assert_eq!(negative.normalized_weights(), Some(vec![-1.0]));
    }
}
