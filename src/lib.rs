//! mediamill - concurrency-limited media conversion engine.
//!
//! The crate runs external encoders as subprocesses, parses their streaming
//! progress output in real time, and coordinates a bounded pool of
//! simultaneous conversions with a FIFO overflow queue.
//!
//! The two central types:
//! - [`Job`]: one conversion of one source file, with live progress,
//!   cancellation, and an atomically staged output file.
//! - [`JobManager`]: admission control, queueing, and a deduplicated
//!   completion mailbox drained by the embedding application.
//!
//! What runs and how it reports progress is abstracted behind the
//! [`Converter`] trait; this crate contains no encoder definitions.

pub mod config;
pub mod converter;
pub mod error;
pub mod ids;
pub mod job;
pub mod manager;
pub mod thumbnail;

pub use config::ConversionConfig;
pub use converter::{Converter, SourceMedia, StatusFields};
pub use error::{Error, Result};
pub use ids::JobId;
pub use job::{Job, JobListener, JobStatus};
pub use manager::JobManager;
pub use thumbnail::Thumbnailer;
