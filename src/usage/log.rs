//! Usage counters with optional JSON persistence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Counters for the current process, optionally seeded from disk.
#[derive(Debug)]
pub struct UsageLog {
    typing_predictions: AtomicU64,
    image_predictions: AtomicU64,
    voice_predictions: AtomicU64,
    combined_predictions: AtomicU64,
    explanations: AtomicU64,
    layers_rendered: AtomicU64,
    layer_failures: AtomicU64,
    started: DateTime<Utc>,
    persist_path: Option<PathBuf>,
}

impl UsageLog {
    pub fn new() -> Self {
        Self {
            typing_predictions: AtomicU64::new(0),
            image_predictions: AtomicU64::new(0),
            voice_predictions: AtomicU64::new(0),
            combined_predictions: AtomicU64::new(0),
            explanations: AtomicU64::new(0),
            layers_rendered: AtomicU64::new(0),
            layer_failures: AtomicU64::new(0),
            started: Utc::now(),
            persist_path: None,
        }
    }

    /// Create a log backed by `path`, loading any previous counts.
    pub fn with_persistence(path: PathBuf) -> Self {
        let mut log = Self::new();
        log.persist_path = Some(path);

        if let Err(e) = log.load() {
            tracing::warn!(error = %e, "could not load previous usage stats");
        }

        log
    }

    pub fn record_typing_prediction(&self) {
        self.typing_predictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_image_prediction(&self) {
        self.image_predictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_voice_prediction(&self) {
        self.voice_predictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_combined_prediction(&self) {
        self.combined_predictions.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one explanation and how its layers fared.
    pub fn record_explanation(&self, rendered: u64, failed: u64) {
        self.explanations.fetch_add(1, Ordering::Relaxed);
        self.layers_rendered.fetch_add(rendered, Ordering::Relaxed);
        self.layer_failures.fetch_add(failed, Ordering::Relaxed);
    }

    pub fn stats(&self) -> UsageStats {
        UsageStats {
            typing_predictions: self.typing_predictions.load(Ordering::Relaxed),
            image_predictions: self.image_predictions.load(Ordering::Relaxed),
            voice_predictions: self.voice_predictions.load(Ordering::Relaxed),
            combined_predictions: self.combined_predictions.load(Ordering::Relaxed),
            explanations: self.explanations.load(Ordering::Relaxed),
            layers_rendered: self.layers_rendered.load(Ordering::Relaxed),
            layer_failures: self.layer_failures.load(Ordering::Relaxed),
            started: self.started,
            uptime_secs: (Utc::now() - self.started).num_seconds().max(0) as u64,
        }
    }

    /// Human-readable summary for the CLI.
    pub fn summary(&self) -> String {
        let stats = self.stats();
        format!(
            "Usage:\n\
             - Typing predictions: {}\n\
             - Image predictions: {}\n\
             - Voice predictions: {}\n\
             - Combined predictions: {}\n\
             - Explanations: {}\n\
             - Layers rendered: {}\n\
             - Layer failures: {}",
            stats.typing_predictions,
            stats.image_predictions,
            stats.voice_predictions,
            stats.combined_predictions,
            stats.explanations,
            stats.layers_rendered,
            stats.layer_failures,
        )
    }

    /// Write counters to the persistence path, if any.
    pub fn save(&self) -> Result<(), std::io::Error> {
        let Some(path) = &self.persist_path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let stats = self.stats();
        let persisted = PersistedStats {
            typing_predictions: stats.typing_predictions,
            image_predictions: stats.image_predictions,
            voice_predictions: stats.voice_predictions,
            combined_predictions: stats.combined_predictions,
            explanations: stats.explanations,
            layers_rendered: stats.layers_rendered,
            layer_failures: stats.layer_failures,
            last_updated: Utc::now(),
        };
        let json = serde_json::to_string_pretty(&persisted).map_err(std::io::Error::other)?;
        std::fs::write(path, json)
    }

    fn load(&mut self) -> Result<(), std::io::Error> {
        let Some(path) = &self.persist_path else {
            return Ok(());
        };
        if !path.exists() {
            return Ok(());
        }

        let content = std::fs::read_to_string(path)?;
        let persisted: PersistedStats =
            serde_json::from_str(&content).map_err(std::io::Error::other)?;

        self.typing_predictions
            .store(persisted.typing_predictions, Ordering::Relaxed);
        self.image_predictions
            .store(persisted.image_predictions, Ordering::Relaxed);
        self.voice_predictions
            .store(persisted.voice_predictions, Ordering::Relaxed);
        self.combined_predictions
            .store(persisted.combined_predictions, Ordering::Relaxed);
        self.explanations
            .store(persisted.explanations, Ordering::Relaxed);
        self.layers_rendered
            .store(persisted.layers_rendered, Ordering::Relaxed);
        self.layer_failures
            .store(persisted.layer_failures, Ordering::Relaxed);
        Ok(())
    }
}

impl Default for UsageLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of the usage counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageStats {
    pub typing_predictions: u64,
    pub image_predictions: u64,
    pub voice_predictions: u64,
    pub combined_predictions: u64,
    pub explanations: u64,
    pub layers_rendered: u64,
    pub layer_failures: u64,
    pub started: DateTime<Utc>,
    pub uptime_secs: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedStats {
    typing_predictions: u64,
    image_predictions: u64,
    // absent in logs written before voice and combined predictions existed
    #[serde(default)]
    voice_predictions: u64,
    #[serde(default)]
    combined_predictions: u64,
    explanations: u64,
    layers_rendered: u64,
    layer_failures: u64,
    last_updated: DateTime<Utc>,
}

pub type SharedUsageLog = Arc<UsageLog>;

pub fn create_shared_log() -> SharedUsageLog {
    Arc::new(UsageLog::new())
}

pub fn create_shared_log_with_persistence(path: PathBuf) -> SharedUsageLog {
    Arc::new(UsageLog::with_persistence(path))
}
