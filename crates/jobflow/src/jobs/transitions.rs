//! Record mutations for each lifecycle step.
//!
//! A store loads the rows under its lock (write guard or `FOR UPDATE`), calls one of these,
//! and writes the rows back in the same transaction. Item status, job counters, heartbeat
//! and cursor therefore always move together.

use chrono::{DateTime, Duration, Utc};

use crate::error::{FlowError, FlowResult};
use crate::jobs::error_codes::ErrorCode;
use crate::jobs::heartbeat;
use crate::jobs::model::{
    Directive, ItemCompletion, ItemFailure, ItemStatus, Job, JobErrorKind, JobOutcome, JobStatus,
    ReportedOutcome, ReprocessOutcome, ResumeOutcome, WorkItem,
};
use crate::jobs::state::{self, CancelDecision, ReprocessDecision, ResumeDecision};

#[derive(Debug, Clone, Copy)]
enum Progress {
    Completed,
    Skipped,
    Errored,
    Retrying,
}

fn record_progress(job: &mut Job, item: &WorkItem, progress: Progress, now: DateTime<Utc>) {
    match progress {
        Progress::Completed => job.completed_count += 1,
        Progress::Skipped => job.skipped_count += 1,
        Progress::Errored => job.error_count += 1,
        Progress::Retrying => {}
    }
    touch(job, now);
    job.last_item_processed = Some(item.id.to_string());
}

fn touch(job: &mut Job, now: DateTime<Utc>) {
    job.last_heartbeat = heartbeat::advance(job.last_heartbeat, now);
    job.updated_at = now;
}

fn release_claim(job: &mut Job) {
    job.claimed_by = None;
    job.claim_expires_at = None;
}

pub fn start(job: &mut Job, now: DateTime<Utc>) -> FlowResult<()> {
    if job.status != JobStatus::Pending {
        return Err(FlowError::invalid_transition(
            job.status,
            JobStatus::InProgress,
        ));
    }
    job.status = JobStatus::InProgress;
    touch(job, now);
    Ok(())
}

/// Caller guarantees the item is PENDING with attempts left and its job IN_PROGRESS.
pub fn claim_item(item: &mut WorkItem, now: DateTime<Utc>) {
    item.status = ItemStatus::InProgress;
    item.attempts += 1;
    item.started_at = Some(now);
}

pub fn complete_item(
    job: &mut Job,
    item: &mut WorkItem,
    completion: &ItemCompletion,
    now: DateTime<Utc>,
) {
    item.status = ItemStatus::Done;
    item.finished_at = Some(now);
    let progress = match completion {
        ItemCompletion::Done { output } => {
            item.output = output.clone();
            Progress::Completed
        }
        ItemCompletion::Skipped { reason } => {
            item.skip_reason = Some(reason.clone());
            Progress::Skipped
        }
    };
    record_progress(job, item, progress, now);
}

pub fn fail_item(job: &mut Job, item: &mut WorkItem, failure: &ItemFailure, now: DateTime<Utc>) {
    let next = state::status_after_failure(item, failure);
    item.status = next;
    item.error_code = Some(failure.code.clone());
    item.error_detail = Some(failure.message.clone());
    item.last_error_at = Some(now);
    let progress = if next == ItemStatus::Error {
        item.finished_at = Some(now);
        Progress::Errored
    } else {
        Progress::Retrying
    };
    record_progress(job, item, progress, now);
}

/// Applies one remote worker report. Returns false for items that are already terminal.
pub fn report_item(
    job: &mut Job,
    item: &mut WorkItem,
    outcome: &ReportedOutcome,
    now: DateTime<Utc>,
) -> bool {
    if item.job_id != job.id || item.status.is_terminal() {
        return false;
    }

    item.attempts = (item.attempts + 1).min(item.max_attempts);
    item.finished_at = Some(now);
    let progress = match outcome {
        ReportedOutcome::Done { output } => {
            item.status = ItemStatus::Done;
            item.output = output.clone();
            Progress::Completed
        }
        ReportedOutcome::Skipped { reason } => {
            item.status = ItemStatus::Done;
            item.skip_reason = Some(reason.clone());
            Progress::Skipped
        }
        ReportedOutcome::Failed { code, detail } => {
            item.status = ItemStatus::Error;
            item.error_code = Some(
                code.clone()
                    .unwrap_or_else(|| ErrorCode::WorkerReported.as_str().to_string()),
            );
            item.error_detail = Some(detail.clone());
            item.last_error_at = Some(now);
            Progress::Errored
        }
    };
    record_progress(job, item, progress, now);
    true
}

/// Returns true when the job changed.
pub fn finalize(job: &mut Job, in_flight: bool, now: DateTime<Utc>) -> FlowResult<bool> {
    match job.status {
        JobStatus::InProgress => {
            let Some((status, kind)) = state::aggregate_outcome(job) else {
                return Ok(false);
            };
            state::ensure_transition(job.status, status)?;
            job.status = status;
            job.error_kind = kind;
            job.finished_at = Some(now);
            job.updated_at = now;
            release_claim(job);
            Ok(true)
        }
        JobStatus::Cancelled if job.finished_at.is_none() && !in_flight => {
            job.finished_at = Some(now);
            job.updated_at = now;
            Ok(true)
        }
        _ => Ok(false),
    }
}

pub fn fail_job(job: &mut Job, kind: JobErrorKind, now: DateTime<Utc>) -> FlowResult<()> {
    state::ensure_transition(job.status, JobStatus::Error)?;
    job.status = JobStatus::Error;
    job.error_kind = Some(kind);
    job.finished_at = Some(now);
    job.updated_at = now;
    release_claim(job);
    Ok(())
}

/// IN_PROGRESS -> STUCK. `in_flight` are the job's IN_PROGRESS items; each is released.
pub fn mark_stuck<'a>(
    job: &mut Job,
    in_flight: impl IntoIterator<Item = &'a mut WorkItem>,
    now: DateTime<Utc>,
) -> FlowResult<()> {
    state::ensure_transition(job.status, JobStatus::Stuck)?;
    for item in in_flight {
        let (status, failure) = state::release_orphaned(item);
        item.status = status;
        if let Some(failure) = failure {
            item.error_code = Some(failure.code);
            item.error_detail = Some(failure.message);
            item.last_error_at = Some(now);
            item.finished_at = Some(now);
            job.error_count += 1;
        }
    }
    job.status = JobStatus::Stuck;
    job.updated_at = now;
    release_claim(job);
    Ok(())
}

pub fn resume(job: &mut Job, now: DateTime<Utc>) -> FlowResult<ResumeOutcome> {
    match state::resume_decision(job)? {
        ResumeDecision::Continue => Ok(ResumeOutcome::Continued { job: job.clone() }),
        ResumeDecision::Resume => {
            job.status = JobStatus::InProgress;
            job.retry_count += 1;
            job.finished_at = None;
            release_claim(job);
            touch(job, now);
            Ok(ResumeOutcome::Resumed { job: job.clone() })
        }
        ResumeDecision::Exhaust => {
            job.status = JobStatus::Error;
            job.error_kind = Some(JobErrorKind::RetriesExhausted);
            job.finished_at = Some(now);
            job.updated_at = now;
            Ok(ResumeOutcome::Exhausted { job: job.clone() })
        }
    }
}

/// Resets the job's ERROR items to fresh PENDING items. `errored` must be exactly the
/// job's ERROR items.
pub fn reset_errored(
    job: &mut Job,
    errored: Vec<&mut WorkItem>,
    now: DateTime<Utc>,
) -> FlowResult<ReprocessOutcome> {
    let decision = state::reprocess_decision(job, errored.len())?;
    if decision == ReprocessDecision::Nothing {
        return Ok(ReprocessOutcome {
            job: job.clone(),
            reset: 0,
        });
    }

    let reset = errored.len();
    for item in errored {
        item.status = ItemStatus::Pending;
        item.attempts = 0;
        item.error_code = None;
        item.error_detail = None;
        item.started_at = None;
        item.finished_at = None;
    }

    job.error_count -= reset as i32;
    job.reprocess_count += 1;
    job.status = JobStatus::InProgress;
    if decision == ReprocessDecision::Reopen {
        job.finished_at = None;
        job.error_kind = None;
        release_claim(job);
    }
    touch(job, now);
    Ok(ReprocessOutcome {
        job: job.clone(),
        reset,
    })
}

/// Returns false when the job was already cancelled.
pub fn cancel(job: &mut Job, in_flight: bool, now: DateTime<Utc>) -> FlowResult<bool> {
    if state::cancel_decision(job)? == CancelDecision::AlreadyCancelled {
        return Ok(false);
    }
    job.status = JobStatus::Cancelled;
    job.updated_at = now;
    if !in_flight {
        job.finished_at = Some(now);
    }
    Ok(true)
}

pub fn archive(job: &mut Job, now: DateTime<Utc>) -> FlowResult<()> {
    if !job.status.is_terminal() {
        return Err(FlowError::Validation(format!(
            "job {} is {}; only finished jobs can be archived",
            job.id, job.status
        )));
    }
    if job.archived_at.is_none() {
        job.archived_at = Some(now);
        job.updated_at = now;
    }
    Ok(())
}

/// Leases `job` to `worker_id`. Caller selected it as claimable.
pub fn claim_job(job: &mut Job, worker_id: &str, lease: Duration, now: DateTime<Utc>) {
    job.status = JobStatus::InProgress;
    job.claimed_by = Some(worker_id.to_string());
    job.claim_expires_at = Some(now + lease);
    touch(job, now);
}

/// Whether a heartbeat from `worker_id` may touch the job at all.
pub fn accepts_heartbeat(job: &Job, worker_id: &str) -> bool {
    job.is_claimed_by(worker_id)
        && matches!(job.status, JobStatus::InProgress | JobStatus::Cancelled)
}

/// Refreshes liveness after the reports were applied; extends the lease while running.
pub fn heartbeat(job: &mut Job, lease: Duration, now: DateTime<Utc>) -> Directive {
    touch(job, now);
    if job.status == JobStatus::InProgress {
        job.claim_expires_at = Some(now + lease);
        Directive::Continue
    } else {
        Directive::Stop
    }
}

/// Records a claimant's final outcome. `remaining` are the job's non-terminal items.
pub fn complete_claimed<'a>(
    job: &mut Job,
    remaining: impl IntoIterator<Item = &'a mut WorkItem>,
    outcome: &JobOutcome,
    now: DateTime<Utc>,
) -> FlowResult<()> {
    let reported = match outcome {
        JobOutcome::Succeeded => ReportedOutcome::Done { output: None },
        JobOutcome::Failed { detail } => ReportedOutcome::Failed {
            code: Some(ErrorCode::WorkerReported.as_str().to_string()),
            detail: detail.clone(),
        },
    };
    for item in remaining {
        report_item(job, item, &reported, now);
    }

    let (status, kind) = match outcome {
        JobOutcome::Succeeded => {
            state::aggregate_outcome(job).unwrap_or((JobStatus::Completed, None))
        }
        JobOutcome::Failed { .. } => (JobStatus::Error, Some(JobErrorKind::WorkerFailed)),
    };
    state::ensure_transition(job.status, status)?;
    job.status = status;
    job.error_kind = kind;
    job.finished_at = Some(now);
    release_claim(job);
    touch(job, now);
    Ok(())
}

/// A claimant finishing a job that was cancelled under it: drop the claim, keep the result.
pub fn release_cancelled(job: &mut Job, now: DateTime<Utc>) {
    release_claim(job);
    if job.finished_at.is_none() {
        job.finished_at = Some(now);
    }
    job.updated_at = now;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::memory::tests_support::{sample_item, sample_job};

    #[test]
    fn progress_moves_counter_heartbeat_and_cursor_together() {
        let mut job = sample_job(JobStatus::InProgress);
        let mut item = sample_item();
        item.job_id = job.id;
        let later = job.last_heartbeat + Duration::seconds(30);

        complete_item(
            &mut job,
            &mut item,
            &ItemCompletion::Skipped {
                reason: "empty page".into(),
            },
            later,
        );

        assert_eq!(item.status, ItemStatus::Done);
        assert_eq!(job.skipped_count, 1);
        assert_eq!(job.completed_count, 0);
        assert_eq!(job.last_heartbeat, later);
        assert_eq!(job.last_item_processed, Some(item.id.to_string()));
    }

    #[test]
    fn retryable_failure_still_counts_as_liveness() {
        let mut job = sample_job(JobStatus::InProgress);
        let mut item = sample_item();
        let later = job.last_heartbeat + Duration::seconds(5);

        fail_item(
            &mut job,
            &mut item,
            &ItemFailure::transient("RATE_LIMIT", "429"),
            later,
        );

        assert_eq!(item.status, ItemStatus::Pending);
        assert_eq!(job.error_count, 0);
        assert_eq!(job.last_heartbeat, later);
    }

    #[test]
    fn heartbeat_never_moves_backwards() {
        let mut job = sample_job(JobStatus::InProgress);
        let before = job.last_heartbeat;
        let mut item = sample_item();

        complete_item(
            &mut job,
            &mut item,
            &ItemCompletion::Done { output: None },
            before - Duration::seconds(10),
        );
        assert_eq!(job.last_heartbeat, before);
    }

    #[test]
    fn duplicate_reports_are_ignored() {
        let mut job = sample_job(JobStatus::InProgress);
        let mut item = sample_item();
        item.job_id = job.id;
        item.status = ItemStatus::Pending;
        let now = job.last_heartbeat;
        let done = ReportedOutcome::Done { output: None };

        assert!(report_item(&mut job, &mut item, &done, now));
        assert!(!report_item(&mut job, &mut item, &done, now));
        assert_eq!(job.completed_count, 1);
    }

    #[test]
    fn stuck_releases_in_flight_items() {
        let mut job = sample_job(JobStatus::InProgress);
        job.claimed_by = Some("gpu-1".into());
        let mut retryable = sample_item();
        let mut last_try = sample_item();
        last_try.attempts = 3;
        let now = job.last_heartbeat;

        mark_stuck(&mut job, [&mut retryable, &mut last_try], now).unwrap();

        assert_eq!(job.status, JobStatus::Stuck);
        assert_eq!(job.claimed_by, None);
        assert_eq!(retryable.status, ItemStatus::Pending);
        assert_eq!(last_try.status, ItemStatus::Error);
        assert_eq!(job.error_count, 1);
    }
}
