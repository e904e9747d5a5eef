//! Thumbnail generation boundary.

use std::path::Path;

use crate::error::Result;

/// Generates still-frame thumbnails from media files.
///
/// The engine calls this from job worker threads, best-effort: a failed
/// thumbnail is logged and never changes the job's outcome.
pub trait Thumbnailer: Send + Sync {
    /// Extract a representative frame of `source` as a `width` x `height`
    /// PNG at `output_png`. The parent directory is guaranteed to exist.
    fn generate(&self, source: &Path, width: u32, height: u32, output_png: &Path) -> Result<()>;
}
