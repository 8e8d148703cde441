use std::time::Duration;

use rand::Rng;

use crate::jobs::model::FailureKind;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub base_ms: u64,
    pub max_ms: u64,
    pub jitter_pct: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_ms: 500,
            max_ms: 30_000,
            jitter_pct: 0.20,
        }
    }
}

impl RetryConfig {
    /// No waiting between attempts.
    pub fn immediate() -> Self {
        Self {
            base_ms: 0,
            max_ms: 0,
            jitter_pct: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    NonRetryable,
}

impl From<ErrorClass> for FailureKind {
    fn from(class: ErrorClass) -> Self {
        match class {
            ErrorClass::Retryable => FailureKind::Transient,
            ErrorClass::NonRetryable => FailureKind::Permanent,
        }
    }
}

pub fn classify_error(code: &str) -> ErrorClass {
    match code.trim().to_uppercase().as_str() {
        "TIMEOUT" | "RATE_LIMIT" | "DEPENDENCY_DOWN" => ErrorClass::Retryable,
        "BAD_INPUT" | "UNPROCESSABLE" | "UNKNOWN_JOB_TYPE" | "WORKER_REPORTED" => {
            ErrorClass::NonRetryable
        }
        _ => ErrorClass::Retryable,
    }
}

pub fn next_delay(attempt_no: i32, cfg: &RetryConfig, rng: &mut impl Rng) -> Duration {
    if cfg.max_ms == 0 {
        return Duration::ZERO;
    }

    let attempt_no = attempt_no.max(1) as u32;
    let exp = attempt_no.saturating_sub(1);

    // If exp is too large, treat multiplier as huge and let the cap handle it.
    let pow2 = 1_u64.checked_shl(exp).unwrap_or(u64::MAX);
    let delay = cfg.base_ms.saturating_mul(pow2).min(cfg.max_ms);

    let jitter_range = (delay as f64) * cfg.jitter_pct;
    let jitter = if jitter_range > 0.0 {
        rng.gen_range(-jitter_range..=jitter_range)
    } else {
        0.0
    };

    let jittered = (delay as f64 + jitter).round().max(0.0) as u64;
    Duration::from_millis(jittered.min(cfg.max_ms))
}
