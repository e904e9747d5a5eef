//! Job admission, queueing, and notification delivery.
//!
//! The [`JobManager`] owns every in-flight job. A fixed number of slots
//! (`simultaneous`) bounds how many jobs hold a subprocess at once; the rest
//! wait in FIFO order. Workers deposit completed jobs into a deduplicated
//! mailbox that an external driver drains on its own cadence via
//! [`drain_notifications`](JobManager::drain_notifications).

use std::collections::{HashMap, VecDeque};
use std::mem;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::ConversionConfig;
use crate::converter::{Converter, SourceMedia};
use crate::error::{Error, Result};
use crate::ids::JobId;
use crate::job::Job;
use crate::thumbnail::Thumbnailer;

#[derive(Default)]
struct ManagerState {
    in_progress: HashMap<JobId, Arc<Job>>,
    waiting: VecDeque<Arc<Job>>,
    /// Completed jobs awaiting pickup by the driver. Keyed by id so a job
    /// that settles twice before a drain is delivered once.
    notify: HashMap<JobId, Arc<Job>>,
    running: bool,
}

/// Coordinates a bounded set of concurrently running conversion jobs.
pub struct JobManager {
    simultaneous: Option<usize>,
    output_dir: PathBuf,
    create_thumbnails: AtomicBool,
    thumbnailer: Option<Arc<dyn Thumbnailer>>,
    state: Mutex<ManagerState>,
}

impl JobManager {
    /// Create a manager from configuration, without thumbnail support.
    pub fn new(config: &ConversionConfig) -> Arc<Self> {
        Self::with_thumbnailer(config, None)
    }

    /// Create a manager that passes `thumbnailer` to every job it creates.
    pub fn with_thumbnailer(
        config: &ConversionConfig,
        thumbnailer: Option<Arc<dyn Thumbnailer>>,
    ) -> Arc<Self> {
        for warning in config.validate() {
            tracing::warn!("config: {warning}");
        }
        Arc::new(Self {
            simultaneous: config.simultaneous,
            output_dir: config.output_dir.clone(),
            create_thumbnails: AtomicBool::new(config.create_thumbnails),
            thumbnailer,
            state: Mutex::new(ManagerState::default()),
        })
    }

    // -- job creation -------------------------------------------------------

    /// Create a job targeting the configured output directory. The job is
    /// not submitted; pair with [`submit`](Self::submit) or use
    /// [`start_conversion`](Self::start_conversion).
    pub fn create_job(
        self: &Arc<Self>,
        source: SourceMedia,
        converter: Arc<dyn Converter>,
    ) -> Arc<Job> {
        self.create_job_in(source, converter, self.output_dir.clone())
    }

    /// Create a job with an explicit output directory.
    pub fn create_job_in(
        self: &Arc<Self>,
        source: SourceMedia,
        converter: Arc<dyn Converter>,
        output_dir: PathBuf,
    ) -> Arc<Job> {
        Job::new(
            source,
            converter,
            Arc::downgrade(self),
            output_dir,
            self.thumbnailer.clone(),
        )
    }

    /// Create and submit a job in one call.
    pub fn start_conversion(
        self: &Arc<Self>,
        source: SourceMedia,
        converter: Arc<dyn Converter>,
    ) -> Arc<Job> {
        let job = self.create_job(source, converter);
        self.submit(Arc::clone(&job));
        job
    }

    // -- admission ----------------------------------------------------------

    /// Admit a job: start it if a slot is free, queue it otherwise.
    pub fn submit(self: &Arc<Self>, job: Arc<Job>) {
        let admitted = {
            let mut state = self.state.lock();
            let full = self
                .simultaneous
                .is_some_and(|limit| state.in_progress.len() >= limit);
            if full {
                debug!(job = %job, "all slots busy; queueing");
                state.waiting.push_back(Arc::clone(&job));
                false
            } else {
                state.running = true;
                state.in_progress.insert(job.id(), Arc::clone(&job));
                true
            }
        };
        // Starting can settle the job synchronously, which re-enters the
        // manager; never hold the lock across it.
        if admitted {
            self.launch_job(&job);
        }
    }

    fn launch_job(self: &Arc<Self>, job: &Arc<Job>) {
        job.set_create_thumbnail(self.create_thumbnails.load(Ordering::Relaxed));
        info!(job = %job, "starting conversion");
        job.start();
    }

    /// Remove a job from the waiting queue.
    ///
    /// Errors if the job is not waiting; the manager's collections are left
    /// untouched in that case.
    pub fn remove(&self, job: &Job) -> Result<()> {
        let mut state = self.state.lock();
        let position = state.waiting.iter().position(|j| j.id() == job.id());
        match position {
            Some(index) => {
                state.waiting.remove(index);
                Ok(())
            }
            None => Err(Error::not_found("waiting job", job.id())),
        }
    }

    /// Stop every job, queued and running.
    pub fn stop_all(self: &Arc<Self>) {
        let jobs: Vec<Arc<Job>> = {
            let state = self.state.lock();
            state
                .waiting
                .iter()
                .chain(state.in_progress.values())
                .cloned()
                .collect()
        };
        for job in jobs {
            job.stop();
        }
    }

    // -- completion ---------------------------------------------------------

    /// Deposit a settled job into the notification mailbox.
    pub(crate) fn notify(&self, job: &Arc<Job>) {
        self.state.lock().notify.insert(job.id(), Arc::clone(job));
    }

    /// Deliver pending notifications to each job's listeners, vacating the
    /// slots of settled jobs and starting queued ones. Intended to be called
    /// periodically by the embedding application's event loop.
    pub fn drain_notifications(self: &Arc<Self>) {
        let pending: Vec<Arc<Job>> = {
            let mut state = self.state.lock();
            if !state.running {
                return;
            }
            mem::take(&mut state.notify).into_values().collect()
        };
        for job in pending {
            if job.status().is_terminal() {
                self.job_finished(&job);
            }
            job.invoke_listeners();
        }
    }

    /// Release a settled job's slot and refill from the waiting queue.
    /// Idempotent: a job may be released by both `stop` and the drain.
    pub(crate) fn job_finished(self: &Arc<Self>, job: &Arc<Job>) {
        let started: Vec<Arc<Job>> = {
            let mut state = self.state.lock();
            state.in_progress.remove(&job.id());

            let mut started = Vec::new();
            if let Some(limit) = self.simultaneous {
                while state.in_progress.len() < limit {
                    let Some(next) = state.waiting.pop_front() else {
                        break;
                    };
                    state.in_progress.insert(next.id(), Arc::clone(&next));
                    started.push(next);
                }
            }
            if state.in_progress.is_empty() && state.waiting.is_empty() {
                state.running = false;
            }
            started
        };
        for next in started {
            self.launch_job(&next);
        }
    }

    // -- introspection ------------------------------------------------------

    /// Number of jobs currently holding a slot.
    pub fn in_progress_len(&self) -> usize {
        self.state.lock().in_progress.len()
    }

    /// Number of jobs waiting for a slot.
    pub fn waiting_len(&self) -> usize {
        self.state.lock().waiting.len()
    }

    /// True while any job is admitted or queued.
    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// The configured slot limit, `None` when unbounded.
    pub fn simultaneous(&self) -> Option<usize> {
        self.simultaneous
    }

    /// Snapshot of the jobs currently holding slots.
    pub fn in_progress_jobs(&self) -> Vec<Arc<Job>> {
        self.state.lock().in_progress.values().cloned().collect()
    }

    /// Snapshot of the waiting queue, in admission order.
    pub fn waiting_jobs(&self) -> Vec<Arc<Job>> {
        self.state.lock().waiting.iter().cloned().collect()
    }

    /// Toggle thumbnail generation for jobs started from now on.
    pub fn set_create_thumbnails(&self, enabled: bool) {
        self.create_thumbnails.store(enabled, Ordering::Relaxed);
    }

    /// Whether newly started jobs will generate thumbnails.
    pub fn create_thumbnails(&self) -> bool {
        self.create_thumbnails.load(Ordering::Relaxed)
    }
}
