//! `perfrelay.toml` config loading.

use serde::{Deserialize, Serialize};

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{RelayError, RelayResult};

pub const DEFAULT_CONFIG_FILE: &str = "perfrelay.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Profiler executable invoked as `<profiler> record` / `<profiler> report`.
    #[serde(default = "default_profiler")]
    pub profiler: PathBuf,

    /// Shared temp directory the profiling artifact is written into.
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: PathBuf,

    #[serde(default = "default_app_name")]
    pub app_name: String,

    #[serde(default = "default_transaction_name")]
    pub transaction_name: String,

    #[serde(default = "default_transaction_category")]
    pub transaction_category: String,

    /// Namespace prepended to every per-symbol attribute key.
    #[serde(default = "default_attribute_prefix")]
    pub attribute_prefix: String,

    /// Artifacts modified longer ago than this are left alone at cleanup.
    #[serde(default = "default_freshness_window_secs")]
    pub freshness_window_secs: u64,

    #[serde(default)]
    pub collector: CollectorConfig,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CollectorKind {
    #[default]
    Log,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CollectorConfig {
    #[serde(default)]
    pub kind: CollectorKind,

    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_profiler() -> PathBuf {
    PathBuf::from("perf")
}

fn default_artifact_dir() -> PathBuf {
    PathBuf::from("/tmp")
}

fn default_app_name() -> String {
    "Linux Performance Counters".to_string()
}

fn default_transaction_name() -> String {
    "Linux Perf Counters".to_string()
}

fn default_transaction_category() -> String {
    "BackendTrans/Perf/counters".to_string()
}

fn default_attribute_prefix() -> String {
    "Custom/ct".to_string()
}

fn default_freshness_window_secs() -> u64 {
    30
}

fn default_timeout_secs() -> u64 {
    10
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            kind: CollectorKind::default(),
            endpoint: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            profiler: default_profiler(),
            artifact_dir: default_artifact_dir(),
            app_name: default_app_name(),
            transaction_name: default_transaction_name(),
            transaction_category: default_transaction_category(),
            attribute_prefix: default_attribute_prefix(),
            freshness_window_secs: default_freshness_window_secs(),
            collector: CollectorConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> RelayResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    /// Like [`Config::load`], but any failure falls back to defaults. Only a
    /// missing file is silent.
    pub fn load_optional(path: &Path) -> Self {
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(RelayError::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
                Self::default()
            }
            Err(err) => {
                tracing::warn!("ignoring config {}: {err}", path.display());
                Self::default()
            }
        }
    }

    pub fn freshness_window(&self) -> Duration {
        Duration::from_secs(self.freshness_window_secs)
    }
}
