//! A single conversion job.
//!
//! Each [`Job`] owns one worker thread that runs the converter's stages as
//! subprocesses, reads their standard output line by line, and folds the
//! parsed status fields into the job's shared state. Observers (the manager,
//! listeners) only ever see the state through the job's accessors; the worker
//! is the sole writer once the job has started.

use std::fs;
use std::io::{BufRead, BufReader, ErrorKind};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::converter::{Converter, SourceMedia, StatusFields};
use crate::ids::JobId;
use crate::manager::JobManager;
use crate::thumbnail::Thumbnailer;

/// Seconds of extra work budgeted for thumbnail generation when computing
/// the completion fraction.
const THUMBNAIL_OVERHEAD_SECS: f64 = 2.0;

/// Flat bonus applied to second-pass positions so the reported progress
/// visibly moves past the halfway mark as soon as pass two begins.
const PASS2_OFFSET_SECS: f64 = 5.0;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle state of a conversion job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Created but not yet started.
    #[default]
    Initialized,
    /// The subprocess has produced output; conversion is underway.
    Converting,
    /// All stages done; the temp output is being moved into place.
    Staging,
    /// Completed successfully; the output file exists.
    Finished,
    /// Ended with an error.
    Failed,
    /// Stopped on request.
    Canceled,
}

impl JobStatus {
    /// True for states a job never leaves.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Canceled)
    }
}

// ---------------------------------------------------------------------------
// Mutable state
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct JobState {
    status: JobStatus,
    error: Option<String>,
    temp_output: Option<PathBuf>,
    duration: Option<f64>,
    progress: Option<f64>,
    progress_percent: Option<f64>,
    eta: Option<f64>,
    started_at: Option<DateTime<Utc>>,
    started_instant: Option<Instant>,
    lines: Vec<String>,
}

/// Listener invoked during the driver's drain for every observed change.
pub type JobListener = Arc<dyn Fn(&Job) + Send + Sync>;

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// One conversion of one source file by one converter.
pub struct Job {
    id: JobId,
    source: SourceMedia,
    converter: Arc<dyn Converter>,
    manager: Weak<JobManager>,
    output_dir: PathBuf,
    output: PathBuf,
    thumbnailer: Option<Arc<dyn Thumbnailer>>,
    create_thumbnail: AtomicBool,
    state: Mutex<JobState>,
    /// Handle to the currently running subprocess. `take()` is the only way
    /// in or out, so exactly one of the worker and `stop` reaps any child.
    process: Mutex<Option<Child>>,
    listeners: Mutex<Vec<JobListener>>,
    finalize_calls: AtomicUsize,
}

impl Job {
    pub(crate) fn new(
        source: SourceMedia,
        converter: Arc<dyn Converter>,
        manager: Weak<JobManager>,
        output_dir: PathBuf,
        thumbnailer: Option<Arc<dyn Thumbnailer>>,
    ) -> Arc<Self> {
        let output = output_dir.join(converter.output_filename(&source));
        Arc::new(Self {
            id: JobId::new(),
            source,
            converter,
            manager,
            output_dir,
            output,
            thumbnailer,
            create_thumbnail: AtomicBool::new(false),
            state: Mutex::new(JobState::default()),
            process: Mutex::new(None),
            listeners: Mutex::new(Vec::new()),
            finalize_calls: AtomicUsize::new(0),
        })
    }

    // -- accessors ----------------------------------------------------------

    /// The job's unique identifier.
    pub fn id(&self) -> JobId {
        self.id
    }

    /// The input being converted.
    pub fn source(&self) -> &SourceMedia {
        &self.source
    }

    /// Final output path.
    pub fn output(&self) -> &Path {
        &self.output
    }

    /// Current lifecycle state.
    pub fn status(&self) -> JobStatus {
        self.state.lock().status
    }

    /// Error text, set once the job has failed or been stopped.
    pub fn error(&self) -> Option<String> {
        self.state.lock().error.clone()
    }

    /// Expected output duration in seconds, once reported by the encoder.
    pub fn duration(&self) -> Option<f64> {
        self.state.lock().duration
    }

    /// Seconds of output produced so far.
    pub fn progress(&self) -> Option<f64> {
        self.state.lock().progress
    }

    /// Completion fraction in `[0, 1]`.
    pub fn progress_percent(&self) -> Option<f64> {
        self.state.lock().progress_percent
    }

    /// Estimated seconds remaining.
    pub fn eta(&self) -> Option<f64> {
        self.state.lock().eta
    }

    /// Wall-clock start time, stamped on the first line of encoder output.
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().started_at
    }

    /// Every line the subprocesses wrote, for postmortem inspection.
    pub fn captured_output(&self) -> Vec<String> {
        self.state.lock().lines.clone()
    }

    pub(crate) fn set_create_thumbnail(&self, enabled: bool) {
        self.create_thumbnail.store(enabled, Ordering::Relaxed);
    }

    #[cfg(test)]
    pub(crate) fn finalize_count(&self) -> usize {
        self.finalize_calls.load(Ordering::SeqCst)
    }

    /// Register a listener called on every observable change of this job.
    pub fn listen(&self, listener: JobListener) {
        self.listeners.lock().push(listener);
    }

    /// Called by the manager's drain; listeners run in registration order.
    pub(crate) fn invoke_listeners(&self) {
        let listeners: Vec<JobListener> = self.listeners.lock().clone();
        for listener in listeners {
            listener(self);
        }
    }

    /// Post this job to the manager's notification mailbox. Listeners are
    /// only ever invoked from the driver's drain, never from the worker.
    fn notify_manager(self: &Arc<Self>) {
        if let Some(manager) = self.manager.upgrade() {
            manager.notify(self);
        }
    }

    // -- lifecycle ----------------------------------------------------------

    /// Allocate the temp output and spawn the worker thread.
    ///
    /// Any failure here is recorded on the job and finalized immediately;
    /// the error never propagates to the caller.
    pub(crate) fn start(self: &Arc<Self>) {
        let temp_output = match self.allocate_temp_output() {
            Ok(path) => path,
            Err(e) => {
                {
                    let mut state = self.state.lock();
                    state.error = Some(format!("could not create temp output: {e}"));
                }
                self.finalize();
                return;
            }
        };
        self.state.lock().temp_output = Some(temp_output);

        let job = Arc::clone(self);
        let spawned = std::thread::Builder::new()
            .name(format!("job-{}", self.id))
            .spawn(move || job.worker());
        if let Err(e) = spawned {
            {
                let mut state = self.state.lock();
                state.error = Some(format!("could not spawn worker thread: {e}"));
            }
            self.finalize();
        }
    }

    /// Reserve a uniquely named file next to the final output, preserving
    /// its extension so encoders that sniff the suffix behave.
    fn allocate_temp_output(&self) -> std::io::Result<PathBuf> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(".mediamill-");
        let suffix = self
            .output
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy()));
        if let Some(suffix) = &suffix {
            builder.suffix(suffix.as_str());
        }
        let file = builder.tempfile_in(&self.output_dir)?;
        let (_, path) = file.keep().map_err(|e| e.error)?;
        Ok(path)
    }

    /// Stop the job. Safe to call at any point in the lifecycle.
    ///
    /// Sets the error text first so a concurrently finalizing worker sees
    /// the job as stopped, then kills and reaps any running subprocess.
    pub fn stop(self: &Arc<Self>) {
        info!(job = %self, "stopping job");
        self.state.lock().error = Some("manually stopped".to_string());

        let child = self.process.lock().take();
        match child {
            None => {
                // Never launched (or already reaped): either still waiting
                // in the manager's queue, or racing the worker's own reap.
                let removed = self
                    .manager
                    .upgrade()
                    .map(|m| m.remove(self))
                    .unwrap_or(Ok(()));
                match removed {
                    Ok(()) => self.state.lock().status = JobStatus::Canceled,
                    Err(e) => {
                        error!(job = %self, "stop raced job completion: {e}");
                        self.state.lock().status = JobStatus::Failed;
                    }
                }
            }
            Some(mut child) => {
                let reaped = child.kill().and_then(|_| child.wait());
                match reaped {
                    Ok(_) => self.state.lock().status = JobStatus::Canceled,
                    Err(e) => {
                        self.state.lock().error = Some(format!("could not kill process: {e}"));
                    }
                }
            }
        }

        if let Some(manager) = self.manager.upgrade() {
            manager.job_finished(self);
        }
    }

    // -- worker -------------------------------------------------------------

    fn worker(self: Arc<Self>) {
        let temp_output = self
            .state
            .lock()
            .temp_output
            .clone()
            .unwrap_or_else(|| self.output.clone());
        let stages = self.converter.build_stages(&self.source, &temp_output);

        for (index, stage) in stages.iter().enumerate() {
            if self.status().is_terminal() {
                break;
            }
            debug!(job = %self, stage = index, "launching {:?}", stage);
            if !self.run_stage(stage) {
                break;
            }
        }

        if !self.status().is_terminal() && self.error().is_none() {
            self.write_thumbnail();
        }
        self.finalize();
    }

    /// Run one subprocess stage to completion. Returns false when the job
    /// should not proceed to further stages.
    fn run_stage(self: &Arc<Self>, command_line: &[String]) -> bool {
        let Some((program, args)) = command_line.split_first() else {
            return true;
        };
        let spawned = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                let exe = self.converter.executable();
                self.state.lock().error = Some(format!("{} does not exist", exe.display()));
                return false;
            }
            Err(e) => {
                self.state.lock().error = Some(format!("could not launch {program}: {e}"));
                return false;
            }
        };

        // Take the pipe before publishing the child so stop() never races
        // us for the stdout handle.
        let stdout = child.stdout.take();
        *self.process.lock() = Some(child);

        if let Some(stdout) = stdout {
            self.pump_output(BufReader::new(stdout));
        }

        // Whoever takes the handle reaps it; stop() may have beaten us.
        if let Some(mut child) = self.process.lock().take() {
            if let Err(e) = child.wait() {
                warn!(job = %self, "wait on subprocess failed: {e}");
            }
        }
        true
    }

    /// Read the subprocess's stdout line by line, folding parsed status
    /// fields into the job state as they arrive.
    fn pump_output(self: &Arc<Self>, reader: impl BufRead) {
        {
            let mut state = self.state.lock();
            if !state.status.is_terminal() {
                state.status = JobStatus::Converting;
                if state.started_at.is_none() {
                    state.started_at = Some(Utc::now());
                    state.started_instant = Some(Instant::now());
                }
            }
        }

        for line in reader.lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    debug!(job = %self, "output pipe closed: {e}");
                    break;
                }
            };
            self.state.lock().lines.push(line.clone());

            let fields = match self.converter.parse_status_line(&self.source, &line) {
                Ok(Some(fields)) => fields,
                Ok(None) => continue,
                Err(e) => {
                    warn!(job = %self, "unparseable status line {line:?}: {e}");
                    continue;
                }
            };

            if fields.finished {
                if let Some(message) = fields.error {
                    self.state.lock().error = Some(message);
                }
                break;
            }

            let updated = {
                let mut state = self.state.lock();
                let elapsed = state.started_instant.map(|t| t.elapsed().as_secs_f64());
                let thumbnails = self.create_thumbnail.load(Ordering::Relaxed);
                apply_status_fields(&mut state, &fields, thumbnails, elapsed)
            };
            if updated {
                self.notify_manager();
            }
        }
    }

    // -- completion ---------------------------------------------------------

    /// Settle the job into its terminal state and move the output into
    /// place. Called exactly once per job, from the worker or from the
    /// failure paths of `start`.
    fn finalize(self: &Arc<Self>) {
        self.finalize_calls.fetch_add(1, Ordering::SeqCst);

        let (error, temp_output) = {
            let mut state = self.state.lock();
            state.progress = state.duration;
            state.progress_percent = Some(1.0);
            state.eta = Some(0.0);
            if state.error.is_none() {
                state.status = JobStatus::Staging;
            }
            (state.error.clone(), state.temp_output.clone())
        };

        if error.is_none() {
            self.notify_manager();
            let temp = temp_output.clone().unwrap_or_else(|| self.output.clone());
            match self.converter.finalize(&temp, &self.output) {
                Ok(()) => self.state.lock().status = JobStatus::Finished,
                Err(e) => {
                    let mut state = self.state.lock();
                    state.error = Some(format!("could not move output into place: {e}"));
                    state.status = JobStatus::Failed;
                }
            }
        } else {
            if let Some(temp) = &temp_output {
                // Best effort; the temp file may never have been written.
                let _ = fs::remove_file(temp);
            }
            let mut state = self.state.lock();
            if state.status != JobStatus::Canceled {
                state.status = JobStatus::Failed;
            }
        }

        self.snapshot_input_thumbnail();

        let (status, error) = {
            let state = self.state.lock();
            (state.status, state.error.clone())
        };
        match &error {
            Some(message) => info!(job = %self, status = ?status, "job ended: {message}"),
            None => info!(job = %self, status = ?status, "job ended"),
        }

        // Cancellation already reflects the caller's own action; do not
        // re-deliver it through the mailbox.
        if status != JobStatus::Canceled {
            self.notify_manager();
        }
    }

    // -- thumbnails ---------------------------------------------------------

    /// Generate the output thumbnail, when enabled. Failures are logged and
    /// never affect the job's outcome.
    fn write_thumbnail(self: &Arc<Self>) {
        if !self.create_thumbnail.load(Ordering::Relaxed) {
            return;
        }
        if let Err(e) = self.try_write_thumbnail() {
            warn!(job = %self, "thumbnail generation failed: {e}");
        }
    }

    fn try_write_thumbnail(&self) -> crate::error::Result<()> {
        let Some(thumbnailer) = &self.thumbnailer else {
            return Ok(());
        };
        if self.source.audio_only {
            warn!(job = %self, "audio-only input; skipping thumbnail");
            return Ok(());
        }
        let dir = self.output_dir.join("thumbnails");
        fs::create_dir_all(&dir)?;
        let stem = self
            .output
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.id.to_string());
        let path = dir.join(format!("{stem}.png"));
        let (width, height) = self.converter.target_size(&self.source);
        thumbnailer.generate(&self.source.path, width, height, &path)?;
        if !path.exists() {
            warn!(job = %self, "thumbnailer reported success but {} is missing", path.display());
        }
        Ok(())
    }

    /// Drop a still of the input next to the output, regardless of outcome.
    /// Front-ends use it to illustrate history entries.
    fn snapshot_input_thumbnail(&self) {
        let Some(thumbnailer) = &self.thumbnailer else {
            return;
        };
        if self.source.audio_only {
            return;
        }
        let stem = Path::new(&self.source.file_name())
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.id.to_string());
        let path = self.output_dir.join(format!("{stem}.png"));
        let (width, height) = match (self.source.width, self.source.height) {
            (Some(w), Some(h)) => (w, h),
            _ => self.converter.target_size(&self.source),
        };
        if let Err(e) = thumbnailer.generate(&self.source.path, width, height, &path) {
            debug!(job = %self, "input snapshot failed: {e}");
        }
    }
}

impl std::fmt::Display for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({}) {} -> {}",
            self.id,
            self.converter.name(),
            self.source.path.display(),
            self.output.display()
        )
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("source", &self.source.path)
            .field("output", &self.output)
            .field("status", &self.status())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Progress math
// ---------------------------------------------------------------------------

/// Fold one set of parsed fields into the job state. Returns true when
/// anything observable changed.
fn apply_status_fields(
    state: &mut JobState,
    fields: &StatusFields,
    thumbnail_enabled: bool,
    elapsed_secs: Option<f64>,
) -> bool {
    let mut updated = false;
    let mut eta_updated = false;

    if let Some(duration) = fields.duration {
        state.duration = Some(duration);
        if state.progress.is_none() {
            state.progress = Some(0.0);
        }
        updated = true;
    }

    // Position reports never exceed the known duration.
    let clamp = |value: f64, duration: Option<f64>| match duration {
        Some(d) => value.min(d),
        None => value,
    };

    if let Some(pass1) = fields.pass1 {
        state.progress = Some(clamp(pass1 / 2.0, state.duration));
        updated = true;
    }
    if let Some(pass2) = fields.pass2 {
        state.progress = Some(clamp(pass2 / 2.0 + PASS2_OFFSET_SECS, state.duration));
        updated = true;
    }
    if let Some(progress) = fields.progress {
        state.progress = Some(clamp(progress, state.duration));
        updated = true;
    }
    if let Some(eta) = fields.eta {
        state.eta = Some(eta);
        updated = true;
        eta_updated = true;
    }

    if updated {
        let percent = calc_progress_percent(state.progress, state.duration, thumbnail_enabled);
        state.progress_percent = Some(percent);
        if !eta_updated {
            state.eta = Some(derive_eta(percent, elapsed_secs));
        }
    }
    updated
}

/// Completion fraction in `[0, 1]`; zero until the duration is known.
fn calc_progress_percent(
    progress: Option<f64>,
    duration: Option<f64>,
    thumbnail_enabled: bool,
) -> f64 {
    let (Some(progress), Some(duration)) = (progress, duration) else {
        return 0.0;
    };
    if duration <= 0.0 {
        return 0.0;
    }
    let effective = if thumbnail_enabled {
        duration + THUMBNAIL_OVERHEAD_SECS
    } else {
        duration
    };
    (progress / effective).min(1.0)
}

/// Extrapolate remaining seconds from elapsed wall time and the completion
/// fraction. Zero outside `(0, 1)` or before any wall time has elapsed.
fn derive_eta(percent: f64, elapsed_secs: Option<f64>) -> f64 {
    let Some(elapsed) = elapsed_secs else {
        return 0.0;
    };
    let pct = percent * 100.0;
    if pct <= 0.0 || pct >= 100.0 {
        return 0.0;
    }
    (elapsed / pct) * (100.0 - pct)
}
