//! Exit code logic for the grabia process.

use std::process::ExitCode;

use grabia_core::{JobSummary, ReconciliationReport};

/// Process outcome, mapped onto the exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProcessExit {
    Success,
    /// Some files failed, some items were unavailable, or the run was stopped.
    Partial,
    Failure,
}

impl ProcessExit {
    pub fn code(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::Failure => 1,
            Self::Partial => 2,
        }
    }
}

impl From<ProcessExit> for ExitCode {
    fn from(exit: ProcessExit) -> Self {
        ExitCode::from(exit.code())
    }
}

/// Outcome of `start` / `resume`.
pub(crate) fn job_outcome(summary: &JobSummary) -> ProcessExit {
    if summary.is_complete() {
        ProcessExit::Success
    } else {
        ProcessExit::Partial
    }
}

/// Outcome of `clean`: unavailable items and failed deletions are partial.
pub(crate) fn clean_outcome(report: &ReconciliationReport) -> ProcessExit {
    if report.unavailable_items.is_empty() && report.delete_failures.is_empty() {
        ProcessExit::Success
    } else {
        ProcessExit::Partial
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grabia_core::reconcile::{DeleteFailure, UnavailableItem};

    #[test]
    fn test_exit_codes() {
        assert_eq!(ProcessExit::Success.code(), 0);
        assert_eq!(ProcessExit::Failure.code(), 1);
        assert_eq!(ProcessExit::Partial.code(), 2);
    }

    #[test]
    fn test_job_outcome_success_when_nothing_left() {
        assert_eq!(job_outcome(&JobSummary::default()), ProcessExit::Success);
    }

    #[test]
    fn test_job_outcome_partial_on_failures_or_cancel() {
        let mut summary = JobSummary::default();
        summary.counts.failed = 1;
        assert_eq!(job_outcome(&summary), ProcessExit::Partial);

        let summary = JobSummary {
            cancelled: true,
            ..JobSummary::default()
        };
        assert_eq!(job_outcome(&summary), ProcessExit::Partial);

        let summary = JobSummary {
            unavailable_items: vec![UnavailableItem {
                item_id: "gone".into(),
                cause: "not found".into(),
            }],
            ..JobSummary::default()
        };
        assert_eq!(job_outcome(&summary), ProcessExit::Partial);
    }

    #[test]
    fn test_clean_outcome() {
        let mut report = ReconciliationReport::default();
        assert_eq!(clean_outcome(&report), ProcessExit::Success);

        report.orphans.push("x/a.mp3".into());
        assert_eq!(clean_outcome(&report), ProcessExit::Success);

        report.delete_failures.push(DeleteFailure {
            path: "x/a.mp3".into(),
            error: "permission denied".into(),
        });
        assert_eq!(clean_outcome(&report), ProcessExit::Partial);
    }
}
