//! The converter capability boundary.
//!
//! A [`Converter`] describes everything the engine needs to run one kind of
//! conversion: output naming, the command line(s) to execute, how to read the
//! encoder's progress chatter, and how to move the finished file into place.
//! Concrete encoder definitions live outside this crate.

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Descriptor for one input media file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceMedia {
    /// Path to the input file.
    pub path: PathBuf,
    /// Total duration in seconds, when known up front.
    pub duration: Option<f64>,
    /// Video width in pixels, if the input has a video stream.
    pub width: Option<u32>,
    /// Video height in pixels, if the input has a video stream.
    pub height: Option<u32>,
    /// True for inputs with no video stream; thumbnails are skipped.
    pub audio_only: bool,
}

impl SourceMedia {
    /// Create a descriptor for `path` with no stream metadata.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            duration: None,
            width: None,
            height: None,
            audio_only: false,
        }
    }

    /// The input's file name, lossily converted for display.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Fields recognized in one line of encoder output.
///
/// A parser returns only the fields the line actually carried; everything
/// else stays `None` (zero is a legitimate value, e.g. for `eta`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusFields {
    /// The encoder reported completion; the read loop stops.
    pub finished: bool,
    /// Error text accompanying `finished`, when the encoder failed.
    pub error: Option<String>,
    /// Total expected output duration in seconds.
    pub duration: Option<f64>,
    /// First-pass position of a two-pass encode, in seconds.
    pub pass1: Option<f64>,
    /// Second-pass position of a two-pass encode, in seconds.
    pub pass2: Option<f64>,
    /// Direct elapsed-seconds progress report.
    pub progress: Option<f64>,
    /// Remaining-seconds estimate reported by the encoder itself.
    pub eta: Option<f64>,
}

/// Capability object describing one converter configuration.
///
/// Implementations must be cheap to share across threads; the engine calls
/// [`parse_status_line`](Converter::parse_status_line) from the job's worker
/// thread for every line the subprocess emits.
pub trait Converter: Send + Sync {
    /// Short human-readable name, used in logs.
    fn name(&self) -> &str;

    /// Derive the output file name for `source`.
    fn output_filename(&self, source: &SourceMedia) -> String;

    /// Path to the encoder executable, used for error reporting when a
    /// launch fails with "not found".
    fn executable(&self) -> PathBuf;

    /// Build the command lines to run, one per processing stage (a two-pass
    /// encode returns two). Each command line is `[program, args...]` and
    /// must write its output to `temp_output`.
    fn build_stages(&self, source: &SourceMedia, temp_output: &Path) -> Vec<Vec<String>>;

    /// Interpret one line of the subprocess's standard output.
    ///
    /// Returns `Ok(None)` for lines carrying no recognized fields. An `Err`
    /// is logged by the engine and the line skipped; it never fails the job.
    fn parse_status_line(&self, source: &SourceMedia, line: &str) -> Result<Option<StatusFields>>;

    /// Move the finished temp output into its final place.
    ///
    /// The engine allocates `temp_output` in the same directory as `output`,
    /// so the default same-filesystem rename is atomic.
    fn finalize(&self, temp_output: &Path, output: &Path) -> io::Result<()> {
        std::fs::rename(temp_output, output)
    }

    /// Target dimensions for thumbnail generation.
    fn target_size(&self, source: &SourceMedia) -> (u32, u32) {
        match (source.width, source.height) {
            (Some(w), Some(h)) => (w, h),
            _ => (1920, 1080),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_media_file_name() {
        let source = SourceMedia::new("/media/input.mkv");
        assert_eq!(source.file_name(), "input.mkv");
        assert!(!source.audio_only);
        assert!(source.duration.is_none());
    }

    #[test]
    fn status_fields_default_is_empty() {
        let fields = StatusFields::default();
        assert!(!fields.finished);
        assert!(fields.duration.is_none());
        assert!(fields.eta.is_none());
    }
}
