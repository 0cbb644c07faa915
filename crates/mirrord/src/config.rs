use mirror_core::tracker::TrackerConfigError;
use mirror_core::TrackerConfig;
use mirror_models::{ModelFamily, UnknownFamily};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("MIRROR_MODEL_FAMILY: {0}")]
    Family(#[from] UnknownFamily),
    #[error("tracker: {0}")]
    Tracker(#[from] TrackerConfigError),
}

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing ONNX model files. Also the gallery store key.
    pub model_dir: PathBuf,
    pub model_family: ModelFamily,
    /// Cosine similarity at or above which a query result counts as a match.
    pub similarity_threshold: f32,
    pub tracker: TrackerConfig,
    /// Restore the stored gallery at startup.
    pub load_gallery: bool,
    /// Save the gallery when the engine shuts down.
    pub flush_on_exit: bool,
}

impl Config {
    /// Load configuration from `MIRROR_*` environment variables with defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let model_dir = var("MIRROR_MODEL_DIR")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(mirror_models::default_model_dir);

        let model_family = match var("MIRROR_MODEL_FAMILY") {
            Some(name) => name.parse()?,
            None => ModelFamily::default(),
        };

        let defaults = TrackerConfig::default();
        let tracker = TrackerConfig {
            iou_threshold: env_f32(&var, "MIRROR_TRACK_IOU", defaults.iou_threshold),
            max_missed: env_u32(&var, "MIRROR_TRACK_MAX_MISSED", defaults.max_missed),
        };
        tracker.validate()?;

        Ok(Self {
            model_dir,
            model_family,
            similarity_threshold: env_threshold(&var, "MIRROR_SIMILARITY_THRESHOLD", 0.40),
            tracker,
            load_gallery: env_bool(&var, "MIRROR_LOAD_GALLERY", true),
            flush_on_exit: env_bool(&var, "MIRROR_FLUSH_ON_EXIT", true),
        })
    }
}

fn env_f32(var: &impl Fn(&str) -> Option<String>, key: &str, default: f32) -> f32 {
    var(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Cosine threshold; anything outside `[-1, 1]` (including NaN) uses `default`.
fn env_threshold(var: &impl Fn(&str) -> Option<String>, key: &str, default: f32) -> f32 {
    let value = env_f32(var, key, default);
    if (-1.0..=1.0).contains(&value) {
        value
    } else {
        tracing::warn!(key, value, default, "threshold out of range, using default");
        default
    }
}

fn env_u32(var: &impl Fn(&str) -> Option<String>, key: &str, default: u32) -> u32 {
    var(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_bool(var: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    var(key).map(|v| v != "0").unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> =
            vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]).unwrap();
        assert_eq!(config.model_family, ModelFamily::BuffaloL);
        assert!((config.similarity_threshold - 0.40).abs() < 1e-6);
        assert_eq!(config.tracker, TrackerConfig::default());
        assert!(config.load_gallery);
        assert!(config.flush_on_exit);
        assert_eq!(config.model_dir, mirror_models::default_model_dir());
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            ("MIRROR_MODEL_DIR", "/opt/models"),
            ("MIRROR_MODEL_FAMILY", "buffalo_s"),
            ("MIRROR_SIMILARITY_THRESHOLD", "0.55"),
            ("MIRROR_TRACK_IOU", "0.5"),
            ("MIRROR_TRACK_MAX_MISSED", "10"),
            ("MIRROR_LOAD_GALLERY", "0"),
            ("MIRROR_FLUSH_ON_EXIT", "0"),
        ])
        .unwrap();
        assert_eq!(config.model_dir, PathBuf::from("/opt/models"));
        assert_eq!(config.model_family, ModelFamily::BuffaloS);
        assert!((config.similarity_threshold - 0.55).abs() < 1e-6);
        assert_eq!(config.tracker, TrackerConfig { iou_threshold: 0.5, max_missed: 10 });
        assert!(!config.load_gallery);
        assert!(!config.flush_on_exit);
    }

    #[test]
    fn test_unparseable_numbers_fall_back_to_defaults() {
        let config = config(&[("MIRROR_SIMILARITY_THRESHOLD", "high")]).unwrap();
        assert!((config.similarity_threshold - 0.40).abs() < 1e-6);
    }

    #[test]
    fn test_out_of_range_threshold_falls_back_to_default() {
        for raw in ["NaN", "1.5", "-1.01", "inf"] {
            let config = config(&[("MIRROR_SIMILARITY_THRESHOLD", raw)]).unwrap();
            assert!((config.similarity_threshold - 0.40).abs() < 1e-6, "{raw}");
        }
        let config = config(&[("MIRROR_SIMILARITY_THRESHOLD", "-1")]).unwrap();
        assert_eq!(config.similarity_threshold, -1.0);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(matches!(
            config(&[("MIRROR_MODEL_FAMILY", "antelope")]),
            Err(ConfigError::Family(_))
        ));
        assert!(matches!(
            config(&[("MIRROR_TRACK_MAX_MISSED", "0")]),
            Err(ConfigError::Tracker(TrackerConfigError::MaxMissed))
        ));
    }
}
