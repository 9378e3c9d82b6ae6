//! burn-disco-core: schedules and configuration
//!
//! Everything here is backend independent. Schedules are resolved once per
//! run into a [`ScheduleTable`] and read per step as [`StepParams`].

pub mod config;
pub mod env;
pub mod schedule;
pub mod table;

pub use config::{
    ConfigError, PromptSpec, RunConfig, SamplingMode, StructuredPrompts, TextPrompts,
};
pub use env::EnvSettings;
pub use schedule::{
    resolve, resolve_str, Schedule, ScheduleError, ScheduleInput, ScheduleResolver,
    MAX_DIFFUSION_STEPS,
};
pub use table::{ModelSchedule, ScheduleTable, StepParams};
