//! Run and command progress reporting.
//!
//! Reports observable progress during `dgx run` and the review/export
//! commands so users see which chunks are in flight, how many files are done,
//! and how a bulk command ended. Progress is emitted on **stderr** so stdout
//! remains parseable for scripts. Diagnostics go through `tracing`, not here.

use std::io::Write;

use crate::models::{JobPhase, StatusCount};
use crate::status::AggregateStatus;

/// A single progress event.
#[derive(Clone, Debug)]
pub enum ProgressEvent {
    /// A detection job was created for a chunk.
    ChunkSubmitted { chunk: usize, job_id: u64, files: usize },
    /// A chunk matched a job that was still running, so polling resumed.
    ChunkResumed { chunk: usize, job_id: u64 },
    /// A non-terminal poll result.
    JobProgress { job_id: u64, count: StatusCount },
    /// The job reached a terminal state (or stalled).
    JobFinished {
        job_id: u64,
        phase: JobPhase,
        failed_files: usize,
        stalled: bool,
    },
    /// Aggregate snapshot over every job of the workflow.
    Status {
        status: AggregateStatus,
        percent: u8,
        count: StatusCount,
    },
    /// Export job state change for one file.
    Export { file_id: u64, status: String },
    /// Single outcome notification of a bulk command.
    Notification { success: bool, message: String },
}

/// Reports progress. Implementations write to stderr (human or JSON).
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Human-friendly progress on stderr: "job 1042  running  12 / 50 files".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = match &event {
            ProgressEvent::ChunkSubmitted {
                chunk,
                job_id,
                files,
            } => format!(
                "chunk {}  submitted  job {} ({} files)\n",
                chunk + 1,
                job_id,
                format_number(*files as u64)
            ),
            ProgressEvent::ChunkResumed { chunk, job_id } => {
                format!("chunk {}  resumed  job {}\n", chunk + 1, job_id)
            }
            ProgressEvent::JobProgress { job_id, count } => format!(
                "job {}  running  {} / {} files\n",
                job_id,
                format_number((count.completed + count.failed) as u64),
                format_number(count.total() as u64)
            ),
            ProgressEvent::JobFinished {
                job_id,
                phase,
                failed_files,
                stalled,
            } => {
                if *stalled {
                    format!("job {}  still running, check back later\n", job_id)
                } else {
                    format!(
                        "job {}  {:?}  {} file(s) failed\n",
                        job_id, phase, failed_files
                    )
                    .to_lowercase()
                }
            }
            ProgressEvent::Status {
                status,
                percent,
                count,
            } => format!(
                "workflow  {}  {}%  ({} done, {} failed)\n",
                status.as_str(),
                percent,
                format_number(count.completed as u64),
                format_number(count.failed as u64)
            ),
            ProgressEvent::Export { file_id, status } => {
                format!("export {}  {}\n", file_id, status.to_lowercase())
            }
            ProgressEvent::Notification { success, message } => {
                let tag = if *success { "ok" } else { "error" };
                format!("{}: {}\n", tag, message)
            }
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl JsonProgress {
    fn to_json(event: &ProgressEvent) -> serde_json::Value {
        match event {
            ProgressEvent::ChunkSubmitted {
                chunk,
                job_id,
                files,
            } => serde_json::json!({
                "event": "chunk_submitted",
                "chunk": chunk,
                "jobId": job_id,
                "files": files
            }),
            ProgressEvent::ChunkResumed { chunk, job_id } => serde_json::json!({
                "event": "chunk_resumed",
                "chunk": chunk,
                "jobId": job_id
            }),
            ProgressEvent::JobProgress { job_id, count } => serde_json::json!({
                "event": "job_progress",
                "jobId": job_id,
                "statusCount": count
            }),
            ProgressEvent::JobFinished {
                job_id,
                phase,
                failed_files,
                stalled,
            } => serde_json::json!({
                "event": "job_finished",
                "jobId": job_id,
                "phase": phase,
                "failedFiles": failed_files,
                "stalled": stalled
            }),
            ProgressEvent::Status {
                status,
                percent,
                count,
            } => serde_json::json!({
                "event": "status",
                "status": status,
                "percent": percent,
                "statusCount": count
            }),
            ProgressEvent::Export { file_id, status } => serde_json::json!({
                "event": "export",
                "fileId": file_id,
                "status": status
            }),
            ProgressEvent::Notification { success, message } => serde_json::json!({
                "event": "notification",
                "success": success,
                "message": message
            }),
        }
    }
}

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        if let Ok(line) = serde_json::to_string(&Self::to_json(&event)) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Auto,
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// `Auto` resolves to human progress when stderr is a TTY, otherwise off.
    pub fn resolve(self) -> Self {
        match self {
            ProgressMode::Auto if atty::is(atty::Stream::Stderr) => ProgressMode::Human,
            ProgressMode::Auto => ProgressMode::Off,
            other => other,
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self.resolve() {
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
            ProgressMode::Off | ProgressMode::Auto => Box::new(NoProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn json_events_are_tagged() {
        let v = JsonProgress::to_json(&ProgressEvent::Status {
            status: AggregateStatus::Running,
            percent: 40,
            count: StatusCount {
                completed: 48,
                failed: 2,
                ..StatusCount::default()
            },
        });
        assert_eq!(v["event"], "status");
        assert_eq!(v["status"], "running");
        assert_eq!(v["statusCount"]["failed"], 2);
    }

    #[test]
    fn explicit_modes_do_not_consult_tty() {
        assert_eq!(ProgressMode::Json.resolve(), ProgressMode::Json);
        assert_eq!(ProgressMode::Off.resolve(), ProgressMode::Off);
    }
}
