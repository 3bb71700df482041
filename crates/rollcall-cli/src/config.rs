use anyhow::{Context, Result};
use rollcall_core::{ExtractorConfig, ResolverConfig, RuntimeConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// CLI configuration: defaults, then an optional TOML file, then `ROLLCALL_*` variables.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Directory containing det_10g.onnx and w600k_r50.onnx.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Minimum cosine similarity for a match.
    pub match_threshold: f32,
    /// Required lead of the best owner over the runner-up.
    pub margin: f32,
    pub min_detection_score: f32,
    /// Independent ONNX session pairs.
    pub session_pool_size: usize,
    pub intra_threads: usize,
    /// Per-operation timeout in seconds.
    pub timeout_secs: u64,
    pub max_image_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        let resolver = ResolverConfig::default();
        let extractor = ExtractorConfig::default();
        Self {
            model_dir: rollcall_core::default_model_dir(),
            db_path: rollcall_core::data_dir().join("faces.db"),
            match_threshold: resolver.match_threshold,
            margin: resolver.margin,
            min_detection_score: extractor.min_detection_score,
            session_pool_size: 1,
            intra_threads: 2,
            timeout_secs: 30,
            max_image_bytes: extractor.max_bytes,
        }
    }
}

impl Config {
    /// Load from `ROLLCALL_CONFIG` (if set) and the environment.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var("ROLLCALL_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that cannot drive a sane match decision.
    pub fn validate(&self) -> Result<()> {
        self.resolver_config().validate().context("invalid match thresholds")?;
        Ok(())
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Overlay `ROLLCALL_*` values. Unparseable values are ignored with a warning.
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("ROLLCALL_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = var("ROLLCALL_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        overlay(&var, "ROLLCALL_MATCH_THRESHOLD", &mut self.match_threshold);
        overlay(&var, "ROLLCALL_MARGIN", &mut self.margin);
        overlay(&var, "ROLLCALL_MIN_DETECTION_SCORE", &mut self.min_detection_score);
        overlay(&var, "ROLLCALL_SESSION_POOL_SIZE", &mut self.session_pool_size);
        overlay(&var, "ROLLCALL_INTRA_THREADS", &mut self.intra_threads);
        overlay(&var, "ROLLCALL_TIMEOUT_SECS", &mut self.timeout_secs);
        overlay(&var, "ROLLCALL_MAX_IMAGE_BYTES", &mut self.max_image_bytes);
    }

    pub fn runtime_config(&self) -> RuntimeConfig {
        let mut rc = RuntimeConfig::from_model_dir(&self.model_dir);
        rc.pool_size = self.session_pool_size;
        rc.intra_threads = self.intra_threads;
        rc
    }

    pub fn extractor_config(&self) -> ExtractorConfig {
        ExtractorConfig {
            max_bytes: self.max_image_bytes,
            min_detection_score: self.min_detection_score,
            ..ExtractorConfig::default()
        }
    }

    pub fn resolver_config(&self) -> ResolverConfig {
        ResolverConfig {
            match_threshold: self.match_threshold,
            margin: self.margin,
        }
    }
}

fn overlay<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = var(key) else { return };
    match raw.parse() {
        Ok(v) => *slot = v,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable config value"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_match_library_defaults() {
        let config = Config::default();
        assert_eq!(config.match_threshold, 0.55);
        assert_eq!(config.margin, 0.15);
        assert!(config.model_dir.ends_with("rollcall/models"));
        assert_eq!(config.resolver_config(), ResolverConfig::default());
    }

    #[test]
    fn test_toml_overlays_defaults() {
        let config = Config::from_toml(
            r#"
            match_threshold = 0.6
            model_dir = "/opt/models"
            "#,
        )
        .unwrap();
        assert_eq!(config.match_threshold, 0.6);
        assert_eq!(config.model_dir, PathBuf::from("/opt/models"));
        assert_eq!(config.margin, 0.15);
        assert_eq!(
            config.runtime_config().detector_path,
            PathBuf::from("/opt/models/det_10g.onnx")
        );
    }

    #[test]
    fn test_unknown_toml_key_rejected() {
        assert!(Config::from_toml("treshold = 0.6").is_err());
    }

    #[test]
    fn test_env_overrides_and_bad_values_ignored() {
        let env: HashMap<&str, &str> = [
            ("ROLLCALL_MARGIN", "0.2"),
            ("ROLLCALL_SESSION_POOL_SIZE", "4"),
            ("ROLLCALL_TIMEOUT_SECS", "soon"),
            ("ROLLCALL_DB_PATH", "/var/lib/rollcall/faces.db"),
        ]
        .into_iter()
        .collect();
        let mut config = Config::default();
        config.apply_env(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.margin, 0.2);
        assert_eq!(config.session_pool_size, 4);
        assert_eq!(config.timeout_secs, 30);
        assert_eq!(config.db_path, PathBuf::from("/var/lib/rollcall/faces.db"));
        assert_eq!(config.runtime_config().pool_size, 4);
    }

    #[test]
    fn test_nan_threshold_fails_validation() {
        let env: HashMap<&str, &str> = [("ROLLCALL_MATCH_THRESHOLD", "NaN")].into_iter().collect();
        let mut config = Config::default();
        config.apply_env(|k| env.get(k).map(|v| v.to_string()));

        assert!(config.match_threshold.is_nan());
        let err = config.validate().unwrap_err();
        assert!(format!("{err:#}").contains("match_threshold"));
    }

    #[test]
    fn test_negative_margin_from_toml_fails_validation() {
        let config = Config::from_toml("margin = -0.2").unwrap();
        assert!(config.validate().is_err());
        assert!(Config::default().validate().is_ok());
    }
}
