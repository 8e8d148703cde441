use chrono::{DateTime, Duration, Utc};

use crate::jobs::model::{Job, JobStatus};

/// Heartbeats older than this instant are stale.
pub fn stale_cutoff(now: DateTime<Utc>, threshold: Duration) -> DateTime<Utc> {
    now - threshold
}

/// Only IN_PROGRESS jobs can be stale; age must strictly exceed the threshold.
pub fn is_stale(job: &Job, now: DateTime<Utc>, threshold: Duration) -> bool {
    job.status == JobStatus::InProgress && job.last_heartbeat < stale_cutoff(now, threshold)
}

/// Heartbeats never move backwards.
pub fn advance(current: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    current.max(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::memory::tests_support::sample_job;

    #[test]
    fn staleness_is_strictly_greater_than_threshold() {
        let now = Utc::now();
        let threshold = Duration::minutes(5);
        let mut job = sample_job(JobStatus::InProgress);

        job.last_heartbeat = now - Duration::minutes(5);
        assert!(!is_stale(&job, now, threshold));

        job.last_heartbeat = now - Duration::minutes(5) - Duration::seconds(1);
        assert!(is_stale(&job, now, threshold));
    }

    #[test]
    fn finished_jobs_are_never_stale() {
        let now = Utc::now();
        for status in [
            JobStatus::Completed,
            JobStatus::Error,
            JobStatus::Cancelled,
            JobStatus::Stuck,
            JobStatus::Pending,
        ] {
            let mut job = sample_job(status);
            job.last_heartbeat = now - Duration::hours(3);
            assert!(!is_stale(&job, now, Duration::minutes(5)), "{status}");
        }
    }

    #[test]
    fn advance_is_monotonic() {
        let now = Utc::now();
        let earlier = now - Duration::seconds(30);
        assert_eq!(advance(now, earlier), now);
        assert_eq!(advance(earlier, now), now);
    }
}
