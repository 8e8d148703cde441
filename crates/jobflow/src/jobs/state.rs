//! Job state machine.
//!
//! Both stores consult these functions before writing, so the transition rules live in
//! exactly one place. Every function is pure: it looks at a snapshot and says what the
//! next write must be, or rejects the request with `InvalidTransition`.

use crate::error::{FlowError, FlowResult};
use crate::jobs::error_codes::ErrorCode;
use crate::jobs::model::{FailureKind, ItemFailure, ItemStatus, Job, JobErrorKind, JobStatus, WorkItem};

/// Legal `from -> to` pairs.
pub fn can_transition(from: JobStatus, to: JobStatus) -> bool {
    use JobStatus::*;
    matches!(
        (from, to),
        (Pending, InProgress)
            | (InProgress, Completed)
            | (InProgress, Error)
            | (InProgress, Stuck)
            | (Stuck, InProgress)
            | (Stuck, Error)
            | (Pending, Cancelled)
            | (InProgress, Cancelled)
            | (Stuck, Cancelled)
            // reprocess-errors reopens a finished job
            | (Completed, InProgress)
            | (Error, InProgress)
    )
}

pub fn ensure_transition(from: JobStatus, to: JobStatus) -> FlowResult<()> {
    if can_transition(from, to) {
        Ok(())
    } else {
        Err(FlowError::invalid_transition(from, to))
    }
}

/// Final status once every item is terminal. `None` while work remains.
pub fn aggregate_outcome(job: &Job) -> Option<(JobStatus, Option<JobErrorKind>)> {
    if !job.all_items_terminal() {
        return None;
    }
    if job.error_count > 0 && job.partial_failure_is_error {
        Some((JobStatus::Error, Some(JobErrorKind::ItemFailures)))
    } else {
        Some((JobStatus::Completed, None))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeDecision {
    Resume,
    Continue,
    Exhaust,
}

pub fn resume_decision(job: &Job) -> FlowResult<ResumeDecision> {
    match job.status {
        JobStatus::Stuck if job.retry_count < job.max_retries => {
            ensure_transition(JobStatus::Stuck, JobStatus::InProgress)?;
            Ok(ResumeDecision::Resume)
        }
        JobStatus::Stuck => {
            ensure_transition(JobStatus::Stuck, JobStatus::Error)?;
            Ok(ResumeDecision::Exhaust)
        }
        JobStatus::InProgress => Ok(ResumeDecision::Continue),
        other => Err(FlowError::invalid_transition(other, JobStatus::InProgress)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReprocessDecision {
    /// No ERROR items; nothing to do.
    Nothing,
    /// Job is still running; reset items in place.
    InPlace,
    /// Job had finished; reset items and move it back to IN_PROGRESS.
    Reopen,
}

pub fn reprocess_decision(job: &Job, errored_items: usize) -> FlowResult<ReprocessDecision> {
    match job.status {
        JobStatus::InProgress | JobStatus::Completed | JobStatus::Error => {}
        other => return Err(FlowError::invalid_transition(other, JobStatus::InProgress)),
    }
    if errored_items == 0 {
        return Ok(ReprocessDecision::Nothing);
    }
    if job.reprocess_count >= job.max_reprocess_cycles {
        return Err(FlowError::ReprocessLimit(job.reprocess_count));
    }
    if job.status == JobStatus::InProgress {
        Ok(ReprocessDecision::InPlace)
    } else {
        ensure_transition(job.status, JobStatus::InProgress)?;
        Ok(ReprocessDecision::Reopen)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelDecision {
    Cancel,
    AlreadyCancelled,
}

pub fn cancel_decision(job: &Job) -> FlowResult<CancelDecision> {
    if job.status == JobStatus::Cancelled {
        return Ok(CancelDecision::AlreadyCancelled);
    }
    ensure_transition(job.status, JobStatus::Cancelled)?;
    Ok(CancelDecision::Cancel)
}

/// Item status after a failed attempt. `item.attempts` already counts that attempt.
pub fn status_after_failure(item: &WorkItem, failure: &ItemFailure) -> ItemStatus {
    match failure.kind {
        FailureKind::Permanent => ItemStatus::Error,
        FailureKind::Transient if item.attempts < item.max_attempts => ItemStatus::Pending,
        FailureKind::Transient => ItemStatus::Error,
    }
}

/// What happens to an IN_PROGRESS item whose job was flagged STUCK.
pub fn release_orphaned(item: &WorkItem) -> (ItemStatus, Option<ItemFailure>) {
    if item.attempts >= item.max_attempts {
        (
            ItemStatus::Error,
            Some(ItemFailure::permanent(
                ErrorCode::Abandoned.as_str(),
                "final attempt abandoned when the job went stale",
            )),
        )
    } else {
        (ItemStatus::Pending, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn job(status: JobStatus) -> Job {
        let now = Utc::now();
        Job {
            id: Uuid::new_v4(),
            job_type: "classify_document".into(),
            topology: Default::default(),
            status,
            config: json!({}),
            priority: 0,
            total_items: 4,
            completed_count: 0,
            error_count: 0,
            skipped_count: 0,
            last_heartbeat: now,
            last_item_processed: None,
            retry_count: 0,
            max_retries: 2,
            reprocess_count: 0,
            max_reprocess_cycles: 1,
            partial_failure_is_error: true,
            error_kind: None,
            claimed_by: None,
            claim_expires_at: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
            archived_at: None,
        }
    }

    fn item(attempts: i32, max_attempts: i32) -> WorkItem {
        WorkItem {
            id: Uuid::new_v4(),
            job_id: Uuid::new_v4(),
            seq: 0,
            input: json!({}),
            status: ItemStatus::InProgress,
            attempts,
            max_attempts,
            output: None,
            skip_reason: None,
            error_code: None,
            error_detail: None,
            last_error_at: None,
            started_at: None,
            finished_at: None,
        }
    }

    #[test]
    fn table_rejects_transitions_out_of_terminal_states() {
        use JobStatus::*;
        assert!(can_transition(Pending, InProgress));
        assert!(can_transition(InProgress, Stuck));
        assert!(can_transition(Stuck, Cancelled));
        assert!(!can_transition(Pending, Stuck));
        assert!(!can_transition(Pending, Completed));
        assert!(!can_transition(Cancelled, InProgress));
        assert!(!can_transition(Completed, Cancelled));
        assert!(!can_transition(Error, Stuck));

        let err = ensure_transition(Completed, Stuck).unwrap_err();
        assert!(matches!(
            err,
            FlowError::InvalidTransition {
                from: Completed,
                to: Stuck
            }
        ));
    }

    #[test]
    fn resume_respects_retry_budget() {
        let mut j = job(JobStatus::Stuck);
        assert_eq!(resume_decision(&j).unwrap(), ResumeDecision::Resume);

        j.retry_count = 2;
        assert_eq!(resume_decision(&j).unwrap(), ResumeDecision::Exhaust);

        j.status = JobStatus::InProgress;
        assert_eq!(resume_decision(&j).unwrap(), ResumeDecision::Continue);

        j.status = JobStatus::Pending;
        assert!(resume_decision(&j).is_err());

        j.status = JobStatus::Completed;
        assert!(resume_decision(&j).is_err());
    }

    #[test]
    fn aggregate_depends_on_partial_failure_policy() {
        let mut j = job(JobStatus::InProgress);
        j.completed_count = 3;
        assert_eq!(aggregate_outcome(&j), None);

        j.error_count = 1;
        assert_eq!(
            aggregate_outcome(&j),
            Some((JobStatus::Error, Some(JobErrorKind::ItemFailures)))
        );

        j.partial_failure_is_error = false;
        assert_eq!(aggregate_outcome(&j), Some((JobStatus::Completed, None)));
    }

    #[test]
    fn reprocess_is_bounded_and_only_from_running_or_finished_jobs() {
        let mut j = job(JobStatus::Error);
        assert_eq!(reprocess_decision(&j, 0).unwrap(), ReprocessDecision::Nothing);
        assert_eq!(reprocess_decision(&j, 2).unwrap(), ReprocessDecision::Reopen);

        j.status = JobStatus::InProgress;
        assert_eq!(reprocess_decision(&j, 2).unwrap(), ReprocessDecision::InPlace);

        j.reprocess_count = 1;
        assert!(matches!(
            reprocess_decision(&j, 2),
            Err(FlowError::ReprocessLimit(1))
        ));

        j.status = JobStatus::Stuck;
        assert!(matches!(
            reprocess_decision(&j, 2),
            Err(FlowError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn cancel_is_idempotent_but_not_from_finished_jobs() {
        assert_eq!(
            cancel_decision(&job(JobStatus::Stuck)).unwrap(),
            CancelDecision::Cancel
        );
        assert_eq!(
            cancel_decision(&job(JobStatus::Cancelled)).unwrap(),
            CancelDecision::AlreadyCancelled
        );
        assert!(cancel_decision(&job(JobStatus::Completed)).is_err());
    }

    #[test]
    fn transient_failures_retry_until_attempts_run_out() {
        let transient = ItemFailure::transient("RATE_LIMIT", "429");
        let permanent = ItemFailure::permanent("BAD_INPUT", "not a document");

        assert_eq!(status_after_failure(&item(1, 3), &transient), ItemStatus::Pending);
        assert_eq!(status_after_failure(&item(3, 3), &transient), ItemStatus::Error);
        assert_eq!(status_after_failure(&item(1, 3), &permanent), ItemStatus::Error);
    }

    #[test]
    fn orphaned_final_attempt_becomes_error() {
        assert_eq!(release_orphaned(&item(1, 3)).0, ItemStatus::Pending);
        let (status, failure) = release_orphaned(&item(3, 3));
        assert_eq!(status, ItemStatus::Error);
        assert_eq!(failure.unwrap().code, "ABANDONED");
    }
}
