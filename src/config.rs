//! Engine configuration.
//!
//! [`ConversionConfig`] is deserialized from JSON and every field defaults
//! sensibly, so a completely empty `{}` file is valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Configuration for a [`JobManager`](crate::JobManager).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionConfig {
    /// Maximum number of jobs allowed to hold a subprocess slot at once.
    /// `None` means unbounded.
    pub simultaneous: Option<usize>,
    /// Whether newly started jobs generate an output thumbnail.
    pub create_thumbnails: bool,
    /// Directory where finished conversions are placed.
    pub output_dir: PathBuf,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            simultaneous: None,
            create_thumbnails: false,
            output_dir: std::env::temp_dir().join("mediamill"),
        }
    }
}

impl ConversionConfig {
    /// Deserialize a `ConversionConfig` from a JSON string.
    ///
    /// This is intentionally string-based so the caller can read the file
    /// however it sees fit (async, embedded, etc.).
    pub fn from_json(json_str: &str) -> Result<Self> {
        serde_json::from_str(json_str)
            .map_err(|e| Error::Validation(format!("config parse error: {e}")))
    }

    /// Load configuration from a file path, falling back to defaults if the
    /// path is `None` or the file does not exist.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };

        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_json(&contents).unwrap_or_else(|e| {
                tracing::warn!("Failed to parse config file {}: {e}", path.display());
                Self::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No config file at {}; using defaults", path.display());
                Self::default()
            }
            Err(e) => {
                tracing::warn!("Failed to read config file {}: {e}", path.display());
                Self::default()
            }
        }
    }

    /// Return a list of validation warnings (non-fatal issues).
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.simultaneous == Some(0) {
            warnings.push("simultaneous is 0; no job will ever be started".into());
        }

        if self.output_dir.as_os_str().is_empty() {
            warnings.push("output_dir is empty; conversions will land in the cwd".into());
        }

        warnings
    }
}
