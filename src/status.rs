//! Overall workflow status, folded from the individual chunk jobs.
//!
//! The fold is commutative and idempotent: it only reads the current phase
//! and counters of each job, so chunks finishing in any order (or being
//! re-folded after a resume) give the same answer.

use serde::Serialize;

use crate::models::{JobPhase, ParsingJob, StatusCount};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateStatus {
    Incomplete,
    Ready,
    Loading,
    Running,
    Done,
    Rejected,
    Error,
}

impl AggregateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateStatus::Incomplete => "incomplete",
            AggregateStatus::Ready => "ready",
            AggregateStatus::Loading => "loading",
            AggregateStatus::Running => "running",
            AggregateStatus::Done => "done",
            AggregateStatus::Rejected => "rejected",
            AggregateStatus::Error => "error",
        }
    }
}

/// Everything the fold looks at besides the jobs themselves.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunFlags {
    /// Both diagrams and resources are selected.
    pub has_selection: bool,
    pub started: bool,
    /// Prerequisite resources are still being fetched.
    pub resources_loading: bool,
    /// Chunks whose detection job could not be created.
    pub submission_failures: usize,
}

/// Precedence: loading > running > done > rejected > ready > incomplete.
/// `error` is reported when a started run has no job at all because every
/// submission failed.
pub fn aggregate_status(jobs: &[ParsingJob], flags: RunFlags) -> AggregateStatus {
    if flags.resources_loading {
        return AggregateStatus::Loading;
    }
    if flags.started {
        if jobs.is_empty() {
            return if flags.submission_failures > 0 {
                AggregateStatus::Error
            } else {
                AggregateStatus::Running
            };
        }
        if jobs.iter().any(|j| !j.is_terminal()) {
            return AggregateStatus::Running;
        }
        if jobs.iter().any(|j| j.phase == JobPhase::Completed) {
            return AggregateStatus::Done;
        }
        return AggregateStatus::Rejected;
    }
    if flags.has_selection {
        AggregateStatus::Ready
    } else {
        AggregateStatus::Incomplete
    }
}

/// Per-file counters summed over every job.
pub fn total_status_count(jobs: &[ParsingJob]) -> StatusCount {
    jobs.iter().fold(StatusCount::default(), |mut acc, j| {
        acc.merge(&j.status_count);
        acc
    })
}

/// Share of files that reached a per-file terminal state, 0..=100.
pub fn percent_done(count: &StatusCount) -> u8 {
    let total = count.total();
    if total == 0 {
        return 0;
    }
    let done = (count.completed + count.failed) as u64;
    ((done * 100) / total as u64).min(100) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::JobStatus;

    fn job(phase: JobPhase, count: StatusCount) -> ParsingJob {
        let mut j = ParsingJob::new(1, JobStatus::Queued, &[1], String::new());
        j.phase = phase;
        j.status_count = count;
        j
    }

    fn started() -> RunFlags {
        RunFlags {
            has_selection: true,
            started: true,
            ..RunFlags::default()
        }
    }

    #[test]
    fn nothing_selected_is_incomplete() {
        assert_eq!(aggregate_status(&[], RunFlags::default()), AggregateStatus::Incomplete);
        let ready = RunFlags {
            has_selection: true,
            ..RunFlags::default()
        };
        assert_eq!(aggregate_status(&[], ready), AggregateStatus::Ready);
    }

    #[test]
    fn loading_beats_running() {
        let jobs = vec![job(JobPhase::Polling, StatusCount::default())];
        let flags = RunFlags {
            resources_loading: true,
            ..started()
        };
        assert_eq!(aggregate_status(&jobs, flags), AggregateStatus::Loading);
    }

    #[test]
    fn any_live_job_means_running() {
        let jobs = vec![
            job(JobPhase::Completed, StatusCount::default()),
            job(JobPhase::Polling, StatusCount::default()),
        ];
        assert_eq!(aggregate_status(&jobs, started()), AggregateStatus::Running);
    }

    #[test]
    fn done_needs_one_completed_job() {
        let done = vec![
            job(JobPhase::Failed, StatusCount::default()),
            job(JobPhase::Completed, StatusCount::default()),
        ];
        assert_eq!(aggregate_status(&done, started()), AggregateStatus::Done);
        let rejected = vec![job(JobPhase::Failed, StatusCount::default())];
        assert_eq!(aggregate_status(&rejected, started()), AggregateStatus::Rejected);
    }

    #[test]
    fn all_submissions_failing_is_error() {
        let flags = RunFlags {
            submission_failures: 3,
            ..started()
        };
        assert_eq!(aggregate_status(&[], flags), AggregateStatus::Error);
    }

    #[test]
    fn fold_is_order_independent() {
        let a = job(
            JobPhase::Completed,
            StatusCount {
                completed: 48,
                failed: 2,
                ..StatusCount::default()
            },
        );
        let b = job(
            JobPhase::Polling,
            StatusCount {
                running: 50,
                ..StatusCount::default()
            },
        );
        let forward = total_status_count(&[a.clone(), b.clone()]);
        let backward = total_status_count(&[b, a]);
        assert_eq!(forward, backward);
        assert_eq!(forward.completed, 48);
        assert_eq!(forward.failed, 2);
        assert_eq!(percent_done(&forward), 50);
    }

    #[test]
    fn empty_count_is_zero_percent() {
        assert_eq!(percent_done(&StatusCount::default()), 0);
    }
}
