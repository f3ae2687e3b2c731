//! CLI output formatting for job, status and clean reports.

use grabia_core::{JobSummary, ReconciliationReport, StatusReport};
use indicatif::HumanBytes;

/// Caps how many paths a report prints per list.
const MAX_LISTED: usize = 50;

pub(crate) fn job_summary_lines(summary: &JobSummary) -> Vec<String> {
    let counts = &summary.counts;
    let mut lines = vec![format!(
        "{} completed, {} failed, {} skipped, {} pending ({} transferred this run)",
        counts.completed,
        counts.failed,
        counts.skipped,
        counts.pending + counts.in_progress,
        HumanBytes(summary.run.bytes),
    )];
    if summary.prepared.synced > 0 {
        lines.push(format!(
            "{} files already present were skipped",
            summary.prepared.synced
        ));
    }
    if summary.prepared.collisions > 0 {
        lines.push(format!(
            "{} files skipped: their names map to an already used local path",
            summary.prepared.collisions
        ));
    }
    if summary.run.disk_full {
        lines.push("Stopped dispatching: disk full".to_string());
    }
    if summary.cancelled {
        lines.push("Interrupted; run `grabia resume` to continue".to_string());
    }
    for item in &summary.unavailable_items {
        lines.push(format!("Unavailable: {} ({})", item.item_id, item.cause));
    }
    lines
}

pub(crate) fn status_lines(report: &StatusReport) -> Vec<String> {
    let counts = &report.counts;
    let mut lines = vec![
        format!("Job: {}", report.output_dir.display()),
        format!("Items: {}", report.items.join(", ")),
        format!(
            "Files: {} total, {} completed, {} skipped, {} failed, {} pending, {} in progress",
            counts.total(),
            counts.completed,
            counts.skipped,
            counts.failed,
            counts.pending,
            counts.in_progress
        ),
        format!("Downloaded: {}", HumanBytes(report.bytes_done)),
    ];
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let rate = report.throughput_bytes_per_sec.max(0.0) as u64;
    if rate > 0 {
        lines.push(format!("Throughput: {}/s", HumanBytes(rate)));
    }
    lines
}

pub(crate) fn clean_report_lines(report: &ReconciliationReport) -> Vec<String> {
    let mut lines = Vec::new();
    let verb = if report.dry_run { "Would delete" } else { "Deleted" };

    let removed = if report.dry_run {
        &report.orphans
    } else {
        &report.deleted
    };
    for path in removed.iter().take(MAX_LISTED) {
        lines.push(format!("{verb}: {}", path.display()));
    }
    push_overflow(&mut lines, removed.len());

    for missing in report.missing.iter().take(MAX_LISTED) {
        lines.push(format!("Missing: {}/{}", missing.item_id, missing.file_name));
    }
    push_overflow(&mut lines, report.missing.len());

    for failure in &report.delete_failures {
        lines.push(format!(
            "Could not delete {}: {}",
            failure.path.display(),
            failure.error
        ));
    }
    for item in &report.unavailable_items {
        lines.push(format!("Skipped {} (manifest unavailable: {})", item.item_id, item.cause));
    }

    lines.push(format!(
        "{} orphans, {} missing, {} kept{}",
        report.orphans.len(),
        report.missing.len(),
        report.kept,
        if report.dry_run {
            " (dry run, pass --execute to delete)"
        } else {
            ""
        }
    ));
    lines
}

fn push_overflow(lines: &mut Vec<String>, total: usize) {
    if total > MAX_LISTED {
        lines.push(format!("... and {} more", total - MAX_LISTED));
    }
}
