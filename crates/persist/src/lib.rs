//! Gantry persistence: the single source of truth for desired state, managed
//! resources, observed snapshots, the event log and reconcile jobs.
//!
//! Every multi-row change (desired write + revision + event + job) is one
//! SQLite transaction, so readers never see a generation without its history.

#![forbid(unsafe_code)]

use std::time::Duration;

use chrono::{DateTime, Utc};
use gantry_core::prelude::*;
use serde::{Deserialize, Serialize};

mod schema;
mod sqlite;

pub use sqlite::SqliteStore;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("generation conflict: expected {expected}, current {actual}")]
    Conflict { expected: Generation, actual: Generation },
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self { StoreError::Unavailable(e.to_string()) }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self { StoreError::Corrupt(e.to_string()) }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Input for [`Store::create_deployment`].
#[derive(Debug, Clone)]
pub struct NewDeployment {
    pub template: TemplateRef,
    pub namespace: String,
    pub desired_spec: DesiredSpec,
    pub policy: DriftPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Queued,
    Running,
    Dead,
}

impl JobState {
    fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Dead => "dead",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(JobState::Queued),
            "running" => Ok(JobState::Running),
            "dead" => Ok(JobState::Dead),
            other => Err(StoreError::Corrupt(format!("job state {other:?}"))),
        }
    }
}

/// One row per deployment; triggers arriving while a row exists coalesce into it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileJob {
    pub id: i64,
    pub deployment_id: DeploymentId,
    pub reason: TriggerReason,
    pub state: JobState,
    pub attempts: u32,
    pub next_run_at: DateTime<Utc>,
    pub lock_holder: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    /// Trigger that arrived while the job was running; the job runs again when released.
    pub rerun: Option<TriggerReason>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new job row was written.
    Queued,
    /// Folded into an existing queued job.
    Coalesced,
    /// Job is running; it runs once more after release.
    RerunScheduled,
    /// A dead job was brought back.
    Revived,
    /// Nothing to do (dead job and a non-urgent trigger, or archived deployment).
    Ignored,
}

/// Access layer over the persistent store. Synchronous; callers on async
/// paths keep transactions short and never hold them across platform calls.
pub trait Store: Send + Sync {
    // deployments
    fn create_deployment(&self, new: NewDeployment) -> Result<Deployment>;
    /// Replace the desired spec, bumping generation by one. `expected` guards
    /// against lost updates when the caller read an older generation.
    fn write_desired(&self, id: DeploymentId, expected: Option<Generation>, spec: DesiredSpec) -> Result<Deployment>;
    fn set_lifecycle(&self, id: DeploymentId, state: LifecycleState) -> Result<Deployment>;
    /// Record a successful apply; false when `generation` is no longer current.
    fn mark_applied(&self, id: DeploymentId, generation: Generation, status: StatusSummary) -> Result<bool>;
    fn set_status(&self, id: DeploymentId, status: StatusSummary) -> Result<()>;
    /// Final step of teardown: drop managed rows and snapshot, keep the row and its events.
    fn archive_deployment(&self, id: DeploymentId) -> Result<()>;
    fn get_deployment(&self, id: DeploymentId) -> Result<Option<Deployment>>;
    fn list_deployments(&self, include_archived: bool) -> Result<Vec<Deployment>>;
    fn revision(&self, id: DeploymentId, generation: Generation) -> Result<Option<DesiredSpec>>;
    /// Fold observed drift into the desired spec; same optimistic check as `write_desired`.
    /// Every approval in `approvals` is consumed in the same transaction.
    fn adopt_drift(
        &self,
        id: DeploymentId,
        expected: Generation,
        spec: DesiredSpec,
        approvals: &[i64],
        payload: serde_json::Value,
    ) -> Result<Deployment>;

    // managed resources
    /// Insert or refresh a row. False when the identity belongs to another deployment.
    fn upsert_managed(&self, row: &ManagedResource) -> Result<bool>;
    fn managed_by_identity(&self, object: &ObjectRef) -> Result<Option<ManagedResource>>;
    fn list_managed(&self, id: DeploymentId) -> Result<Vec<ManagedResource>>;
    fn list_managed_kind(&self, kind: ObjectKind) -> Result<Vec<ManagedResource>>;
    /// Delete only when the row still carries `uid`.
    fn delete_managed(&self, object: &ObjectRef, uid: &str) -> Result<bool>;

    // observed status
    fn put_snapshot(&self, snapshot: &ObservedSnapshot) -> Result<()>;
    fn get_snapshot(&self, id: DeploymentId) -> Result<Option<ObservedSnapshot>>;

    // events
    fn append_event(&self, event: &NewEvent) -> Result<i64>;
    fn list_events(&self, id: DeploymentId, after_seq: i64, limit: usize) -> Result<Vec<Event>>;

    // jobs
    fn enqueue(&self, id: DeploymentId, reason: TriggerReason, run_at: DateTime<Utc>) -> Result<EnqueueOutcome>;
    /// Take the next due job (or one whose lease expired), skipping `skip`.
    fn claim(&self, holder: &str, now: DateTime<Utc>, lease: Duration, skip: &[DeploymentId]) -> Result<Option<ReconcileJob>>;
    fn renew_lease(&self, id: DeploymentId, holder: &str, now: DateTime<Utc>) -> Result<bool>;
    /// Release after success. The job is removed unless a rerun is pending or `recheck_at` asks for one.
    fn complete(&self, id: DeploymentId, holder: &str, now: DateTime<Utc>, recheck_at: Option<DateTime<Utc>>) -> Result<bool>;
    /// Release after a transient failure; bumps attempts.
    fn defer(&self, id: DeploymentId, holder: &str, now: DateTime<Utc>, next_run_at: DateTime<Utc>, error: &str) -> Result<bool>;
    fn mark_dead(&self, id: DeploymentId, holder: &str, now: DateTime<Utc>, error: &str) -> Result<bool>;
    fn get_job(&self, id: DeploymentId) -> Result<Option<ReconcileJob>>;
    fn list_jobs(&self) -> Result<Vec<ReconcileJob>>;

    // adoption approvals
    fn approve_adoption(&self, id: DeploymentId, object: &ObjectRef, path: &str) -> Result<i64>;
    /// An unconsumed approval covering `path` (equal to or beneath the approved prefix).
    fn pending_approval(&self, id: DeploymentId, object: &ObjectRef, path: &str) -> Result<Option<i64>>;
}

/// Path from `GANTRY_DB_PATH`, else `~/.gantry/gantry.db`. The directory is created by [`SqliteStore::open`].
pub fn default_db_path() -> String {
    if let Ok(p) = std::env::var("GANTRY_DB_PATH") {
        return p;
    }
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".gantry");
        p.push("gantry.db");
        return p.to_string_lossy().to_string();
    }
    "gantry.db".to_string()
}
