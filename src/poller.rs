//! Poll loop for one detection job.
//!
//! `Submitted → Polling → {Completed | Failed}`. Non-terminal ticks are spaced
//! by the configured interval. Transport errors back off exponentially (capped)
//! and never surface on their own; once the wall-clock timeout is exceeded the
//! job is marked stalled, stays in `Polling`, and a recoverable error is
//! returned: [`PipelineError::PollTransport`] when the last poll itself failed,
//! [`PipelineError::PollTimeout`] otherwise. A `Failed` job status is
//! authoritative, is never retried, and comes back as
//! [`PipelineError::JobFailed`].

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::api::DiagramApi;
use crate::config::PollingConfig;
use crate::error::PipelineError;
use crate::models::{DetectResultItem, FailedFile, JobPhase, JobStatus, ParsingJob};

pub struct JobPoller {
    api: Arc<dyn DiagramApi>,
    config: PollingConfig,
}

impl JobPoller {
    pub fn new(api: Arc<dyn DiagramApi>, config: PollingConfig) -> Self {
        Self { api, config }
    }

    /// Drive `job` until it is terminal, the timeout elapses, or `cancel`
    /// fires. `on_progress` sees every non-terminal update.
    ///
    /// A completed job yields its per-file items; some may carry an error
    /// instead of annotations.
    pub async fn run<F>(
        &self,
        job: &mut ParsingJob,
        cancel: &CancellationToken,
        mut on_progress: F,
    ) -> Result<Vec<DetectResultItem>, PipelineError>
    where
        F: FnMut(&ParsingJob),
    {
        let started = Instant::now();
        let deadline = started + self.config.timeout();
        let mut failures: u32 = 0;
        let mut last_error = None;
        job.phase = JobPhase::Polling;
        job.stalled = false;

        loop {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }

            let wait = match self.api.detection_status(job.job_id).await {
                Ok(response) => {
                    failures = 0;
                    last_error = None;
                    job.status = response.status;
                    if let Some(count) = response.status_count {
                        job.status_count = count;
                    }
                    match response.status {
                        JobStatus::Completed => {
                            job.failed_files = collect_failed_files(&response.items);
                            job.phase = JobPhase::Completed;
                            tracing::info!(
                                job_id = job.job_id,
                                failed = job.failed_files.len(),
                                "detection job completed"
                            );
                            return Ok(response.items);
                        }
                        JobStatus::Failed => {
                            let message = response
                                .error_message
                                .unwrap_or_else(|| "detection job failed".to_string());
                            job.phase = JobPhase::Failed;
                            job.error_message = Some(message.clone());
                            return Err(PipelineError::JobFailed {
                                job_id: job.job_id,
                                message,
                            });
                        }
                        JobStatus::Queued | JobStatus::Running => {
                            on_progress(job);
                            self.config.interval()
                        }
                    }
                }
                Err(e) => {
                    failures += 1;
                    let delay = backoff(self.config.interval(), self.config.max_backoff(), failures);
                    tracing::warn!(
                        job_id = job.job_id,
                        attempt = failures,
                        error = %e,
                        "poll failed, retrying in {}ms",
                        delay.as_millis()
                    );
                    last_error = Some(e);
                    delay
                }
            };

            let now = Instant::now();
            if now + wait > deadline {
                job.stalled = true;
                let waited_secs = now.duration_since(started).as_secs();
                tracing::warn!(job_id = job.job_id, waited_secs, "giving up polling for now");
                return Err(match last_error {
                    Some(source) => PipelineError::PollTransport {
                        job_id: job.job_id,
                        source,
                    },
                    None => PipelineError::PollTimeout {
                        job_id: job.job_id,
                        waited_secs,
                    },
                });
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}

/// `interval * 2^(failures-1)`, capped at `max`.
pub(crate) fn backoff(interval: Duration, max: Duration, failures: u32) -> Duration {
    let factor = 1u32 << failures.saturating_sub(1).min(16);
    interval.saturating_mul(factor).min(max)
}

/// Files of a completed job that came back with an error instead of results.
pub fn collect_failed_files(items: &[DetectResultItem]) -> Vec<FailedFile> {
    items
        .iter()
        .filter(|i| i.annotations.is_none())
        .filter_map(|i| {
            i.error_message.as_deref().map(|msg| FailedFile {
                file_id: i.file_id,
                error_message: translate_error(msg),
            })
        })
        .collect()
}

/// User-facing text for a per-file detection error. Blank messages map to
/// `None`; unknown messages pass through trimmed.
pub fn translate_error(message: &str) -> Option<String> {
    let trimmed = message.trim();
    if trimmed.is_empty() {
        return None;
    }
    let lower = trimmed.to_lowercase();
    let translated = if lower.contains("not supported") || lower.contains("unsupported") {
        "This file type is not supported for detection."
    } else if lower.contains("too large") || lower.contains("too big") {
        "The file is too large to be processed."
    } else if lower.contains("not found") || lower.contains("does not exist") {
        "The file could not be found."
    } else {
        return Some(trimmed.to_string());
    };
    Some(translated.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ApiError;
    use crate::memory::InMemoryApi;

    fn fast() -> PollingConfig {
        PollingConfig {
            interval_ms: 5,
            max_backoff_ms: 20,
            timeout_secs: 5,
        }
    }

    async fn submitted(api: &InMemoryApi, files: &[u64]) -> ParsingJob {
        let req = crate::models::DetectRequest {
            items: files
                .iter()
                .map(|&file_id| crate::models::JobItem { file_id })
                .collect(),
            entities: Vec::new(),
            search_field: "name".into(),
            min_tokens: 2,
            partial_match: false,
        };
        let created = api.submit_detection(&req).await.unwrap();
        ParsingJob::new(created.job_id, created.status, files, "k".into())
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let i = Duration::from_millis(100);
        let max = Duration::from_millis(500);
        assert_eq!(backoff(i, max, 1), Duration::from_millis(100));
        assert_eq!(backoff(i, max, 2), Duration::from_millis(200));
        assert_eq!(backoff(i, max, 3), Duration::from_millis(400));
        assert_eq!(backoff(i, max, 4), max);
        assert_eq!(backoff(i, max, 40), max);
    }

    #[test]
    fn translation_trims_and_drops_blank() {
        assert_eq!(translate_error("   "), None);
        assert_eq!(translate_error("  odd failure \n").as_deref(), Some("odd failure"));
        assert_eq!(
            translate_error("File type application/zip is not supported").as_deref(),
            Some("This file type is not supported for detection.")
        );
    }

    #[tokio::test]
    async fn completes_with_partial_file_failures() {
        let api = Arc::new(InMemoryApi::new().with_completion_polls(3));
        api.script_detection_error(2, "File too large");
        let mut job = submitted(&api, &[1, 2, 3]).await;
        let poller = JobPoller::new(api.clone(), fast());

        let mut ticks = 0;
        let items = poller
            .run(&mut job, &CancellationToken::new(), |_| ticks += 1)
            .await
            .unwrap();

        assert_eq!(items.len(), 3);
        assert_eq!(ticks, 2);
        assert_eq!(job.phase, JobPhase::Completed);
        assert_eq!(job.status_count.completed, 2);
        assert_eq!(job.status_count.failed, 1);
        assert_eq!(job.failed_files.len(), 1);
        assert_eq!(job.failed_files[0].file_id, 2);
    }

    #[tokio::test]
    async fn failed_job_is_terminal() {
        let api = Arc::new(InMemoryApi::new());
        api.fail_jobs_containing(7);
        let mut job = submitted(&api, &[7, 8]).await;
        let err = JobPoller::new(api.clone(), fast())
            .run(&mut job, &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::JobFailed { ref message, .. } if message == "detection service failure"
        ));
        assert!(!err.is_recoverable());
        assert_eq!(job.phase, JobPhase::Failed);
        assert!(job.error_message.is_some());
    }

    #[tokio::test]
    async fn transport_errors_are_retried() {
        let api = Arc::new(InMemoryApi::new());
        let mut job = submitted(&api, &[1]).await;
        api.inject_poll_errors(3);
        let items = JobPoller::new(api.clone(), fast())
            .run(&mut job, &CancellationToken::new(), |_| {})
            .await
            .unwrap();
        assert_eq!(items.len(), 1);
    }

    #[tokio::test]
    async fn unreachable_service_surfaces_transport_error_at_timeout() {
        let api = Arc::new(InMemoryApi::new());
        let mut job = submitted(&api, &[1]).await;
        api.inject_poll_errors(u32::MAX);
        let config = PollingConfig {
            interval_ms: 10,
            max_backoff_ms: 10,
            timeout_secs: 0,
        };
        let err = JobPoller::new(api.clone(), config)
            .run(&mut job, &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::PollTransport { source: ApiError::Transport(_), .. }
        ));
        assert!(err.is_recoverable());
        assert_eq!(job.phase, JobPhase::Polling);
        assert!(job.stalled);
    }

    #[tokio::test]
    async fn timeout_leaves_job_polling_and_stalled() {
        let api = Arc::new(InMemoryApi::new());
        api.slow_down(1, u32::MAX);
        let mut job = submitted(&api, &[1]).await;
        let config = PollingConfig {
            interval_ms: 10,
            max_backoff_ms: 10,
            timeout_secs: 0,
        };
        let err = JobPoller::new(api.clone(), config)
            .run(&mut job, &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::PollTimeout { .. }));
        assert!(err.is_recoverable());
        assert_eq!(job.phase, JobPhase::Polling);
        assert!(job.stalled);
    }

    #[tokio::test]
    async fn cancellation_stops_the_loop() {
        let api = Arc::new(InMemoryApi::new());
        api.slow_down(1, u32::MAX);
        let mut job = submitted(&api, &[1]).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = JobPoller::new(api.clone(), fast())
            .run(&mut job, &cancel, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
    }
}
