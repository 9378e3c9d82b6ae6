//! Environment-level toggles
//!
//! Read once at startup. Every variable is optional.
//!
//! | variable | effect |
//! |---|---|
//! | `BURN_DISCO_OUTPUT_DIR` | root directory for run outputs |
//! | `BURN_DISCO_OPTOUT_LOCAL_BACKUP` | disable the local snapshot store |
//! | `BURN_DISCO_OPTOUT_CLOUD_BACKUP` | disable the remote snapshot store |
//! | `BURN_DISCO_DISABLE_PROGRESS` | hide progress bars |
//! | `BURN_DISCO_LOG_LEVEL` | `trace`, `debug`, `info`, `warn` or `error` |

use std::path::PathBuf;

pub const ENV_OUTPUT_DIR: &str = "BURN_DISCO_OUTPUT_DIR";
pub const ENV_OPTOUT_LOCAL_BACKUP: &str = "BURN_DISCO_OPTOUT_LOCAL_BACKUP";
pub const ENV_OPTOUT_CLOUD_BACKUP: &str = "BURN_DISCO_OPTOUT_CLOUD_BACKUP";
pub const ENV_DISABLE_PROGRESS: &str = "BURN_DISCO_DISABLE_PROGRESS";
pub const ENV_LOG_LEVEL: &str = "BURN_DISCO_LOG_LEVEL";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvSettings {
    pub output_dir: PathBuf,
    pub optout_local_backup: bool,
    pub optout_cloud_backup: bool,
    pub disable_progress: bool,
    pub log_level: String,
}

impl Default for EnvSettings {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl EnvSettings {
    /// Read the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through an arbitrary lookup function
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let flag = |key: &str| lookup(key).is_some_and(|v| is_truthy(&v));

        let output_dir = lookup(ENV_OUTPUT_DIR)
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .or_else(|| lookup("HOME").map(|home| PathBuf::from(home).join(".cache").join("burn-disco")))
            .unwrap_or_else(|| std::env::temp_dir().join("burn-disco"));

        Self {
            output_dir,
            optout_local_backup: flag(ENV_OPTOUT_LOCAL_BACKUP),
            optout_cloud_backup: flag(ENV_OPTOUT_CLOUD_BACKUP),
            disable_progress: flag(ENV_DISABLE_PROGRESS),
            log_level: lookup(ENV_LOG_LEVEL)
                .map(|v| v.trim().to_lowercase())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| "info".to_string()),
        }
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let env = EnvSettings::from_lookup(lookup_from(&[("HOME", "/home/u")]));
        assert_eq!(env.output_dir, PathBuf::from("/home/u/.cache/burn-disco"));
        assert!(!env.optout_local_backup);
        assert!(!env.optout_cloud_backup);
        assert!(!env.disable_progress);
        assert_eq!(env.log_level, "info");
    }

    #[test]
    fn test_overrides() {
        let env = EnvSettings::from_lookup(lookup_from(&[
            (ENV_OUTPUT_DIR, "/data/out"),
            (ENV_OPTOUT_CLOUD_BACKUP, "1"),
            (ENV_OPTOUT_LOCAL_BACKUP, "no"),
            (ENV_DISABLE_PROGRESS, "True"),
            (ENV_LOG_LEVEL, "DEBUG"),
        ]));
        assert_eq!(env.output_dir, PathBuf::from("/data/out"));
        assert!(env.optout_cloud_backup);
        assert!(!env.optout_local_backup);
        assert!(env.disable_progress);
        assert_eq!(env.log_level, "debug");
    }
}
