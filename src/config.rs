//! Configuration for motorsense.

use crate::core::features::GenderEncoding;
use crate::explain::mosaic::MosaicConfig;
use crate::explain::image_io::INPUT_SIZE;
use crate::pipeline::DrawingKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// How the gender column is encoded in typing feature vectors
    pub gender_encoding: GenderEncoding,

    /// Activation mosaic layout
    pub mosaic: MosaicConfig,

    /// Side length images are resized to before inference
    pub image_size: u32,

    /// Model files
    pub models: ModelPaths,

    /// Networks tried, in order, when building the activation tap
    pub explain_candidates: Vec<String>,

    /// When set, every extracted feature vector is written here as CSV
    pub debug_dump: Option<PathBuf>,

    /// Path for storing the usage log
    pub data_path: PathBuf,

    /// Default tracing filter when RUST_LOG is unset
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("motorsense");

        Self {
            gender_encoding: GenderEncoding::default(),
            mosaic: MosaicConfig::default(),
            image_size: INPUT_SIZE,
            models: ModelPaths::in_dir(&data_dir.join("models")),
            explain_candidates: vec!["wave".to_string(), "spiral".to_string()],
            debug_dump: None,
            data_path: data_dir,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from `path`; a missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        let config: Config =
            serde_json::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::IoError(e.to_string()))?;
        }

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("motorsense")
            .join("config.json")
    }

    /// Path of the persisted usage counters.
    pub fn usage_log_path(&self) -> PathBuf {
        self.data_path.join("usage.json")
    }

    /// Reject values that would fail every request later.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.image_size == 0 {
            return Err(ConfigError::Invalid("image_size must be positive".to_string()));
        }
        if self.mosaic.max_channels == 0 || self.mosaic.tile_cols == 0 {
            return Err(ConfigError::Invalid(
                "mosaic.max_channels and mosaic.tile_cols must be positive".to_string(),
            ));
        }
        for name in &self.explain_candidates {
            name.parse::<DrawingKind>()
                .map_err(|e| ConfigError::Invalid(format!("explain candidate: {e}")))?;
        }
        Ok(())
    }

    /// Ensure all required directories exist.
    pub fn ensure_directories(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.data_path).map_err(|e| ConfigError::IoError(e.to_string()))
    }
}

/// Locations of the model files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelPaths {
    /// Linear typing classifier (JSON)
    pub typing: PathBuf,
    /// Linear voice classifier (JSON)
    pub voice: PathBuf,
    /// Spiral drawing network (ONNX)
    pub spiral: PathBuf,
    /// Wave drawing network (ONNX)
    pub wave: PathBuf,
}

impl Default for ModelPaths {
    fn default() -> Self {
        Self::in_dir(Path::new("models"))
    }
}

impl ModelPaths {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            typing: dir.join("typing.json"),
            voice: dir.join("voice.json"),
            spiral: dir.join("spiral.onnx"),
            wave: dir.join("wave.onnx"),
        }
    }

    /// Path of a drawing network.
    pub fn network(&self, kind: DrawingKind) -> &Path {
        match kind {
            DrawingKind::Spiral => &self.spiral,
            DrawingKind::Wave => &self.wave,
        }
    }
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    IoError(String),
    ParseError(String),
    SerializeError(String),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "IO error: {e}"),
            ConfigError::ParseError(e) => write!(f, "Parse error: {e}"),
            ConfigError::SerializeError(e) => write!(f, "Serialize error: {e}"),
            ConfigError::Invalid(e) => write!(f, "Invalid configuration: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.gender_encoding, GenderEncoding::Label);
        assert_eq!(config.image_size, 128);
        assert_eq!(config.mosaic.max_channels, 16);
        assert_eq!(config.mosaic.tile_cols, 4);
        assert_eq!(config.explain_candidates, vec!["wave", "spiral"]);
        assert!(config.debug_dump.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config.image_size, 128);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"gender_encoding": "indicator", "image_size": 64}"#).unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.gender_encoding, GenderEncoding::Indicator);
        assert_eq!(config.image_size, 64);
        assert_eq!(config.mosaic, MosaicConfig::default());
    }

    #[test]
    fn test_malformed_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            Config::load_from(&path),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_unknown_candidate_rejected() {
        let config = Config {
            explain_candidates: vec!["typing".to_string()],
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_candidates_parse_like_drawing_kinds() {
        let config = Config {
            explain_candidates: vec!["Wave".to_string(), " spiral ".to_string()],
            ..Config::default()
        };
        assert!(config.validate().is_ok());
        assert_eq!(
            config.models.network(DrawingKind::Wave),
            config.models.wave.as_path()
        );
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let config = Config {
            debug_dump: Some(dir.path().join("features.csv")),
            ..Config::default()
        };
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.debug_dump, config.debug_dump);
        assert_eq!(loaded.models, config.models);
    }
}
