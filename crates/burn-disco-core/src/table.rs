//! Resolved schedule table for one run

use std::collections::BTreeMap;

use crate::config::{ConfigError, RunConfig};
use crate::schedule::{Schedule, ScheduleInput, ScheduleResolver};

/// Hyperparameters in effect at one step
#[derive(Debug, Clone, PartialEq)]
pub struct StepParams {
    pub cut_overview: usize,
    pub cut_innercut: usize,
    pub cut_icgray_p: f64,
    pub cut_ic_pow: f64,
    pub cutn_batches: usize,
    pub skip_augs: bool,
    pub use_secondary_model: bool,
    pub clip_guidance_scale: f64,
    pub tv_scale: f64,
    pub range_scale: f64,
    pub sat_scale: f64,
    pub init_scale: f64,
    pub clamp_grad: bool,
    pub clamp_max: f64,
}

/// On/off and guidance-scale schedules of one embedding model
#[derive(Debug, Clone)]
pub struct ModelSchedule {
    pub enabled: Schedule,
    pub guidance_scale: Schedule,
}

/// Every scheduled hyperparameter of a run, resolved once
#[derive(Debug, Clone)]
pub struct ScheduleTable {
    pub cut_overview: Schedule,
    pub cut_innercut: Schedule,
    pub cut_icgray_p: Schedule,
    pub cut_ic_pow: Schedule,
    pub cutn_batches: Schedule,
    pub skip_augs: Schedule,
    pub use_secondary_model: Schedule,
    pub clip_guidance_scale: Schedule,
    pub tv_scale: Schedule,
    pub range_scale: Schedule,
    pub sat_scale: Schedule,
    pub init_scale: Schedule,
    pub clamp_grad: Schedule,
    pub clamp_max: Schedule,
    models: BTreeMap<String, ModelSchedule>,
}

impl ScheduleTable {
    pub fn from_config(
        config: &RunConfig,
        resolver: &mut ScheduleResolver,
    ) -> Result<Self, ConfigError> {
        let mut field = |name: &str, input: &ScheduleInput| {
            resolver
                .resolve(input)
                .map_err(|source| ConfigError::Schedule {
                    field: name.to_string(),
                    source,
                })
        };

        let clip_guidance_scale = field("clip_guidance_scale", &config.clip_guidance_scale)?;
        let mut models = BTreeMap::new();
        for id in &config.clip_models {
            let enabled = match config.clip_models_schedules.get(id) {
                Some(input) => field(&format!("clip_models_schedules.{}", id), input)?,
                None => Schedule::constant(1.0),
            };
            let guidance_scale = match config.clip_guidance_scales.get(id) {
                Some(input) => field(&format!("clip_guidance_scales.{}", id), input)?,
                None => clip_guidance_scale.clone(),
            };
            models.insert(
                id.clone(),
                ModelSchedule {
                    enabled,
                    guidance_scale,
                },
            );
        }

        Ok(Self {
            cut_overview: field("cut_overview", &config.cut_overview)?,
            cut_innercut: field("cut_innercut", &config.cut_innercut)?,
            cut_icgray_p: field("cut_icgray_p", &config.cut_icgray_p)?,
            cut_ic_pow: field("cut_ic_pow", &config.cut_ic_pow)?,
            cutn_batches: field("cutn_batches", &config.cutn_batches)?,
            skip_augs: field("skip_augs", &config.skip_augs)?,
            use_secondary_model: field("use_secondary_model", &config.use_secondary_model)?,
            tv_scale: field("tv_scale", &config.tv_scale)?,
            range_scale: field("range_scale", &config.range_scale)?,
            sat_scale: field("sat_scale", &config.sat_scale)?,
            init_scale: field("init_scale", &config.init_scale)?,
            clamp_grad: field("clamp_grad", &config.clamp_grad)?,
            clamp_max: field("clamp_max", &config.clamp_max)?,
            clip_guidance_scale,
            models,
        })
    }

    /// Parameters at forward step index `step`
    pub fn at(&self, step: usize) -> StepParams {
        StepParams {
            cut_overview: self.cut_overview.count(step),
            cut_innercut: self.cut_innercut.count(step),
            cut_icgray_p: self.cut_icgray_p.value(step),
            cut_ic_pow: self.cut_ic_pow.value(step),
            cutn_batches: self.cutn_batches.count(step).max(1),
            skip_augs: self.skip_augs.flag(step),
            use_secondary_model: self.use_secondary_model.flag(step),
            clip_guidance_scale: self.clip_guidance_scale.value(step),
            tv_scale: self.tv_scale.value(step),
            range_scale: self.range_scale.value(step),
            sat_scale: self.sat_scale.value(step),
            init_scale: self.init_scale.value(step),
            clamp_grad: self.clamp_grad.flag(step),
            clamp_max: self.clamp_max.value(step),
        }
    }

    pub fn model(&self, id: &str) -> Option<&ModelSchedule> {
        self.models.get(id)
    }

    /// Whether model `id` guides at `step`; unknown models never do
    pub fn model_enabled(&self, id: &str, step: usize) -> bool {
        self.models.get(id).is_some_and(|m| m.enabled.flag(step))
    }

    /// Guidance scale of model `id` at `step`
    pub fn model_guidance_scale(&self, id: &str, step: usize) -> f64 {
        self.models
            .get(id)
            .map(|m| m.guidance_scale.value(step))
            .unwrap_or_else(|| self.clip_guidance_scale.value(step))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_resolve() {
        let config = RunConfig::default();
        let table = ScheduleTable::from_config(&config, &mut ScheduleResolver::new()).unwrap();

        let early = table.at(0);
        assert_eq!(early.cut_overview, 12);
        assert_eq!(early.cut_innercut, 4);
        assert_eq!(early.cut_icgray_p, 0.2);
        assert_eq!(early.cutn_batches, 4);
        assert!(early.clamp_grad);
        assert_eq!(early.clamp_max, 0.05);
        assert_eq!(early.range_scale, 150.0);

        let late = table.at(999);
        assert_eq!(late.cut_overview, 4);
        assert_eq!(late.cut_innercut, 12);
        assert_eq!(late.cut_icgray_p, 0.0);
    }

    #[test]
    fn test_model_schedules() {
        let mut config = RunConfig {
            clip_models: vec!["a".into(), "b".into()],
            ..Default::default()
        };
        config
            .clip_models_schedules
            .insert("b".into(), "[False]*500+[True]*500".into());
        config
            .clip_guidance_scales
            .insert("a".into(), ScheduleInput::Int(100));
        let table = ScheduleTable::from_config(&config, &mut ScheduleResolver::new()).unwrap();

        assert!(table.model_enabled("a", 0));
        assert!(!table.model_enabled("b", 0));
        assert!(table.model_enabled("b", 500));
        assert!(!table.model_enabled("c", 500));
        assert_eq!(table.model_guidance_scale("a", 10), 100.0);
        assert_eq!(table.model_guidance_scale("b", 10), 5000.0);
    }

    #[test]
    fn test_bad_schedule_names_field() {
        let config = RunConfig {
            cut_overview: "[4]*10".into(),
            ..Default::default()
        };
        let err = ScheduleTable::from_config(&config, &mut ScheduleResolver::new()).unwrap_err();
        assert!(matches!(err, ConfigError::Schedule { ref field, .. } if field == "cut_overview"));
    }
}
