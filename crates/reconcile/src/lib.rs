//! Gantry reconcile: one [`Reconciler`] pass turns a deployment's freshest
//! desired state into platform mutations; the [`Scheduler`] decides when
//! passes run, keeps them single-flight per deployment and backs off on
//! failure.

#![forbid(unsafe_code)]

use std::fmt;
use std::time::Duration;

use gantry_apply::ApplyError;
use gantry_kubehub::PlatformError;
use gantry_persist::StoreError;
use serde::{Deserialize, Serialize};

mod reconciler;
mod scheduler;

pub use reconciler::{ReconcileOutcome, Reconciler, SkipReason, MAX_REPLANS};
pub use scheduler::{Scheduler, Settled, StoreTriggers};

/// How a failed pass is handled by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureClass {
    /// Retried with backoff.
    Transient,
    /// A name is held by an object we do not own; parked until an operator acts.
    Conflict,
    /// Retrying the same input cannot succeed.
    Fatal,
}

impl FailureClass {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureClass::Transient => "transient",
            FailureClass::Conflict => "conflict",
            FailureClass::Fatal => "fatal",
        }
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{class}: {message}")]
pub struct ReconcileError {
    pub class: FailureClass,
    pub message: String,
    /// The plan action that failed, if the failure came from the applier.
    pub action: Option<serde_json::Value>,
}

impl ReconcileError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self { class: FailureClass::Transient, message: message.into(), action: None }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self { class: FailureClass::Fatal, message: message.into(), action: None }
    }

    pub fn is_transient(&self) -> bool { self.class == FailureClass::Transient }

    pub fn with_action(mut self, action: Option<serde_json::Value>) -> Self {
        self.action = action;
        self
    }
}

impl From<StoreError> for ReconcileError {
    fn from(e: StoreError) -> Self {
        match e {
            // a generation race resolves itself on the next pass
            StoreError::Unavailable(_) | StoreError::Conflict { .. } => ReconcileError::transient(e.to_string()),
            _ => ReconcileError::fatal(e.to_string()),
        }
    }
}

impl From<PlatformError> for ReconcileError {
    fn from(e: PlatformError) -> Self {
        if e.is_transient() || matches!(e, PlatformError::NotFound(_)) {
            ReconcileError::transient(e.to_string())
        } else {
            ReconcileError::fatal(e.to_string())
        }
    }
}

impl From<ApplyError> for ReconcileError {
    fn from(e: ApplyError) -> Self {
        match e {
            ApplyError::Store(se) => se.into(),
            ApplyError::Conflict { .. } => Self { class: FailureClass::Conflict, message: e.to_string(), action: None },
            e if e.is_transient() => ReconcileError::transient(e.to_string()),
            e => ReconcileError::fatal(e.to_string()),
        }
    }
}

/// Scheduler knobs, read from `GANTRY_*` variables by [`SchedulerConfig::from_env`].
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub workers: usize,
    pub lease: Duration,
    pub max_concurrent: usize,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Delay before a pass that ended Progressing runs again.
    pub progress_recheck: Duration,
    /// Period of the tick that enqueues every live deployment.
    pub requeue_every: Duration,
    /// Idle workers look for due jobs at least this often.
    pub poll_every: Duration,
    pub holder: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            lease: Duration::from_secs(300),
            max_concurrent: 8,
            backoff_base: Duration::from_secs(2),
            backoff_max: Duration::from_secs(300),
            progress_recheck: Duration::from_secs(15),
            requeue_every: Duration::from_secs(600),
            poll_every: Duration::from_millis(500),
            holder: format!("gantry-{}", uuid::Uuid::new_v4().simple()),
        }
    }
}

fn env_u64(key: &str, default: u64) -> u64 { std::env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default) }

impl SchedulerConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            workers: env_u64("GANTRY_WORKERS", d.workers as u64).max(1) as usize,
            lease: Duration::from_secs(env_u64("GANTRY_LEASE_SECS", d.lease.as_secs()).max(1)),
            max_concurrent: env_u64("GANTRY_MAX_CONCURRENT", d.max_concurrent as u64).max(1) as usize,
            backoff_max: Duration::from_secs(env_u64("GANTRY_BACKOFF_MAX_SECS", d.backoff_max.as_secs())),
            progress_recheck: Duration::from_secs(env_u64("GANTRY_PROGRESS_RECHECK_SECS", d.progress_recheck.as_secs())),
            requeue_every: Duration::from_secs(env_u64("GANTRY_REQUEUE_SECS", d.requeue_every.as_secs()).max(1)),
            poll_every: Duration::from_millis(env_u64("GANTRY_POLL_MS", d.poll_every.as_millis() as u64).max(10)),
            holder: std::env::var("GANTRY_HOLDER_ID").unwrap_or(d.holder),
            ..d
        }
    }
}

/// `base * 2^attempts`, capped at `max`. `attempts` counts earlier failures.
pub fn backoff_delay(attempts: u32, base: Duration, max: Duration) -> Duration {
    let factor = 1u32.checked_shl(attempts).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(max).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_caps() {
        let base = Duration::from_secs(2);
        let max = Duration::from_secs(300);
        let delays: Vec<u64> = (0..10).map(|a| backoff_delay(a, base, max).as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 32, 64, 128, 256, 300, 300]);
        assert_eq!(backoff_delay(64, base, max), max);
    }

    #[test]
    fn failure_classes_follow_error_kind() {
        assert!(ReconcileError::from(PlatformError::Timeout(Duration::from_secs(10))).is_transient());
        assert_eq!(ReconcileError::from(PlatformError::Forbidden("rbac".into())).class, FailureClass::Fatal);
        assert!(ReconcileError::from(StoreError::Unavailable("locked".into())).is_transient());
        assert_eq!(ReconcileError::from(StoreError::Corrupt("spec".into())).class, FailureClass::Fatal);

        let object = gantry_core::ObjectRef::new(gantry_core::ObjectKind::Service, "games", "gs");
        let conflict = ApplyError::Conflict { object: object.clone(), uid: "u1".into() };
        assert_eq!(ReconcileError::from(conflict).class, FailureClass::Conflict);
        let store = ApplyError::Store(StoreError::Unavailable("busy".into()));
        assert!(ReconcileError::from(store).is_transient());
        let fatal = ApplyError::Fatal { verb: "create", object, message: "bad port".into() };
        assert_eq!(ReconcileError::from(fatal).class, FailureClass::Fatal);
    }
}
