//! Shared fixtures for the integration tests: a scripted converter that
//! runs `/bin/sh` and speaks a tiny token protocol on stdout, plus polling
//! helpers for waiting on job and manager state.

#![allow(dead_code)]

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mediamill::{
    ConversionConfig, Converter, Error, Job, JobManager, JobStatus, Result, SourceMedia,
    StatusFields, Thumbnailer,
};

/// Converter driven by an inline shell script.
///
/// The script's stdout is parsed one token line at a time: `duration N`,
/// `pass1 N`, `pass2 N`, `progress N`, `eta N`, `finished [error text]`, and
/// `badline` (which the parser rejects). Anything else is ignored.
pub struct ScriptedConverter {
    name: String,
    /// Shell script to run; `{out}` is replaced with the temp output path.
    /// `None` means build_stages points at a nonexistent executable.
    script: Option<String>,
    fail_finalize: bool,
}

impl ScriptedConverter {
    /// Echo each line, then write the output file.
    pub fn emitting(lines: &[&str]) -> Arc<Self> {
        let mut statements: Vec<String> =
            lines.iter().map(|line| format!("echo '{line}'")).collect();
        statements.push("printf converted > '{out}'".to_string());
        Arc::new(Self {
            name: "scripted".to_string(),
            script: Some(statements.join("; ")),
            fail_finalize: false,
        })
    }

    /// Sleep without producing any output; for cancellation and admission
    /// tests.
    pub fn sleeping(secs: u32) -> Arc<Self> {
        Arc::new(Self {
            name: "sleeper".to_string(),
            script: Some(format!("sleep {secs}")),
            fail_finalize: false,
        })
    }

    /// Echo each line, then sleep; for observing a job mid-run.
    pub fn emitting_then_sleeping(lines: &[&str], secs: u32) -> Arc<Self> {
        let mut statements: Vec<String> =
            lines.iter().map(|line| format!("echo '{line}'")).collect();
        statements.push(format!("sleep {secs}"));
        Arc::new(Self {
            name: "scripted".to_string(),
            script: Some(statements.join("; ")),
            fail_finalize: false,
        })
    }

    /// Points at an executable that does not exist.
    pub fn missing() -> Arc<Self> {
        Arc::new(Self {
            name: "missing".to_string(),
            script: None,
            fail_finalize: false,
        })
    }

    /// Same as [`emitting`](Self::emitting) but the final move fails.
    pub fn emitting_with_broken_finalize(lines: &[&str]) -> Arc<Self> {
        let base = Self::emitting(lines);
        Arc::new(Self {
            name: "scripted".to_string(),
            script: base.script.clone(),
            fail_finalize: true,
        })
    }
}

impl Converter for ScriptedConverter {
    fn name(&self) -> &str {
        &self.name
    }

    fn output_filename(&self, source: &SourceMedia) -> String {
        let stem = Path::new(&source.file_name())
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "output".to_string());
        format!("{stem}.out")
    }

    fn executable(&self) -> PathBuf {
        match &self.script {
            Some(_) => PathBuf::from("/bin/sh"),
            None => PathBuf::from("/nonexistent/mediamill-encoder"),
        }
    }

    fn build_stages(&self, _source: &SourceMedia, temp_output: &Path) -> Vec<Vec<String>> {
        match &self.script {
            Some(script) => {
                let script = script.replace("{out}", &temp_output.to_string_lossy());
                vec![vec!["/bin/sh".to_string(), "-c".to_string(), script]]
            }
            None => vec![vec!["/nonexistent/mediamill-encoder".to_string()]],
        }
    }

    fn parse_status_line(&self, _source: &SourceMedia, line: &str) -> Result<Option<StatusFields>> {
        let line = line.trim();
        if line == "badline" {
            return Err(Error::Parse(format!("unrecognized line: {line}")));
        }
        let mut parts = line.splitn(2, ' ');
        let token = parts.next().unwrap_or_default();
        let rest = parts.next().unwrap_or_default();

        let number = || -> Result<f64> {
            rest.parse()
                .map_err(|e| Error::Parse(format!("bad number in {line:?}: {e}")))
        };

        let mut fields = StatusFields::default();
        match token {
            "duration" => fields.duration = Some(number()?),
            "pass1" => fields.pass1 = Some(number()?),
            "pass2" => fields.pass2 = Some(number()?),
            "progress" => fields.progress = Some(number()?),
            "eta" => fields.eta = Some(number()?),
            "finished" => {
                fields.finished = true;
                if !rest.is_empty() {
                    fields.error = Some(rest.to_string());
                }
            }
            _ => return Ok(None),
        }
        Ok(Some(fields))
    }

    fn finalize(&self, temp_output: &Path, output: &Path) -> io::Result<()> {
        if self.fail_finalize {
            return Err(io::Error::other("simulated move failure"));
        }
        std::fs::rename(temp_output, output)
    }
}

/// Thumbnailer stub that writes a placeholder file.
pub struct StubThumbnailer;

impl Thumbnailer for StubThumbnailer {
    fn generate(&self, _source: &Path, _width: u32, _height: u32, output_png: &Path) -> Result<()> {
        std::fs::write(output_png, b"png")?;
        Ok(())
    }
}

/// Write a small fake input file and describe it.
pub fn media_file(dir: &Path, name: &str) -> SourceMedia {
    let path = dir.join(name);
    std::fs::write(&path, b"fake media bytes").unwrap();
    SourceMedia::new(path)
}

pub fn test_config(output_dir: &Path, simultaneous: Option<usize>) -> ConversionConfig {
    ConversionConfig {
        simultaneous,
        create_thumbnails: false,
        output_dir: output_dir.to_path_buf(),
    }
}

/// Poll `pred` every 10ms until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut pred: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    pred()
}

/// Wait for the job to settle and return its terminal status.
pub fn wait_terminal(job: &Arc<Job>) -> JobStatus {
    assert!(
        wait_until(Duration::from_secs(10), || job.status().is_terminal()),
        "job never reached a terminal state (status {:?}, error {:?})",
        job.status(),
        job.error()
    );
    job.status()
}

/// Repeatedly drain manager notifications until `pred` holds.
pub fn drive_until(manager: &Arc<JobManager>, timeout: Duration, mut pred: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    loop {
        manager.drain_notifications();
        if pred() {
            return;
        }
        assert!(Instant::now() < deadline, "manager never reached expected state");
        std::thread::sleep(Duration::from_millis(10));
    }
}
