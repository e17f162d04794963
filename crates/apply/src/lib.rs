//! Gantry apply: executes a [`Plan`] action by action against the platform,
//! recording Managed Resource rows and audit events as each step lands.
//!
//! Execution stops at the first failure. Everything before it stays applied
//! and recorded, so the next pass replans from the real state.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use gantry_core::prelude::*;
use gantry_kubehub::{DeleteOutcome, Platform, PlatformError};
use gantry_persist::{Store, StoreError};
use gantry_plan::{Action, Plan};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ApplyError {
    /// Worth retrying with backoff.
    #[error("{verb} {object}: {message}")]
    Transient { verb: &'static str, object: ObjectRef, message: String },
    /// The name is held by an object we do not own.
    #[error("{object} is held by an unmanaged object")]
    Conflict { object: ObjectRef, uid: String },
    /// Rejected by the platform; retrying the same input cannot succeed.
    #[error("{verb} {object} rejected: {message}")]
    Fatal { verb: &'static str, object: ObjectRef, message: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ApplyError {
    pub fn is_transient(&self) -> bool {
        match self {
            ApplyError::Transient { .. } => true,
            ApplyError::Store(e) => matches!(e, StoreError::Unavailable(_)),
            _ => false,
        }
    }

    fn from_platform(verb: &'static str, object: &ObjectRef, e: PlatformError) -> Self {
        let message = e.to_string();
        let object = object.clone();
        match e {
            e if e.is_transient() => ApplyError::Transient { verb, object, message },
            // apply raced a delete; the next plan creates it
            PlatformError::NotFound(_) => ApplyError::Transient { verb, object, message },
            _ => ApplyError::Fatal { verb, object, message },
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplyReport {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Objects as the platform returned them after create/update.
    #[serde(skip)]
    pub live: Vec<LiveObject>,
}

impl ApplyReport {
    pub fn mutations(&self) -> usize { self.created + self.updated + self.deleted }
}

/// A plan that stopped part-way; `done` actions completed before `error`.
#[derive(Debug, Clone)]
pub struct ApplyFailure {
    pub report: ApplyReport,
    pub done: usize,
    pub error: ApplyError,
}

fn preflight_enabled() -> bool { std::env::var("GANTRY_DISABLE_APPLY_PREFLIGHT").is_err() }

pub struct Applier {
    platform: Arc<dyn Platform>,
    store: Arc<dyn Store>,
    preflight: bool,
}

impl Applier {
    pub fn new(platform: Arc<dyn Platform>, store: Arc<dyn Store>) -> Self {
        Self { platform, store, preflight: preflight_enabled() }
    }

    pub fn with_preflight(mut self, on: bool) -> Self {
        self.preflight = on;
        self
    }

    pub async fn execute(&self, plan: &Plan) -> Result<ApplyReport, ApplyFailure> {
        let mut report = ApplyReport::default();
        for (i, action) in plan.actions.iter().enumerate() {
            let t0 = Instant::now();
            counter!("apply_attempts", 1u64, "op" => action.verb());
            let res = match action {
                Action::Create { manifest } => self.create(plan.deployment, manifest, &mut report).await,
                Action::Update { manifest, uid, fields } => self.update(plan.deployment, manifest, uid, fields, &mut report).await,
                Action::Delete { object, uid } => self.delete(plan.deployment, object, uid, &mut report).await,
            };
            histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0, "op" => action.verb());
            if let Err(error) = res {
                counter!("apply_err", 1u64, "op" => action.verb());
                warn!(deployment = %plan.deployment, object = %action.object(), op = action.verb(), error = %error, "apply stopped");
                return Err(ApplyFailure { report, done: i, error });
            }
            counter!("apply_ok", 1u64, "op" => action.verb());
        }
        if !plan.is_empty() {
            info!(deployment = %plan.deployment, generation = %plan.generation, created = report.created, updated = report.updated, deleted = report.deleted, "plan applied");
        }
        Ok(report)
    }

    async fn create(&self, id: DeploymentId, manifest: &Manifest, report: &mut ApplyReport) -> Result<(), ApplyError> {
        let object = &manifest.object;
        match self.platform.create(manifest).await {
            Ok(live) => {
                self.record(id, &live)?;
                self.event(id, EventType::ResourceCreated, json!({"object": object.key(), "uid": live.uid}))?;
                report.created += 1;
                report.live.push(live);
                Ok(())
            }
            Err(PlatformError::AlreadyExists(_)) => {
                let existing = self.platform.get(object).await.map_err(|e| ApplyError::from_platform("create", object, e))?;
                match existing {
                    // ours from an earlier pass that never got recorded
                    Some(l) if l.is_owned_by(id) => {
                        debug!(object = %object, uid = %l.uid, "create found our own object; applying instead");
                        let live = self.platform.apply(manifest).await.map_err(|e| ApplyError::from_platform("apply", object, e))?;
                        self.record(id, &live)?;
                        self.event(id, EventType::ResourceUpdated, json!({"object": object.key(), "uid": live.uid, "existing": true}))?;
                        report.updated += 1;
                        report.live.push(live);
                        Ok(())
                    }
                    Some(l) => {
                        counter!("apply_conflict_total", 1u64);
                        let payload = json!({"object": object.key(), "uid": l.uid, "owner": l.ownership().map(|o| o.deployment_id)});
                        self.event(id, EventType::ResourceConflict, payload.clone())?;
                        self.event(id, EventType::UnmanagedObjectDetected, payload)?;
                        Err(ApplyError::Conflict { object: object.clone(), uid: l.uid })
                    }
                    None => Err(ApplyError::Transient { verb: "create", object: object.clone(), message: "name taken, then freed".into() }),
                }
            }
            Err(e) => Err(ApplyError::from_platform("create", object, e)),
        }
    }

    async fn update(
        &self,
        id: DeploymentId,
        manifest: &Manifest,
        uid: &str,
        fields: &[String],
        report: &mut ApplyReport,
    ) -> Result<(), ApplyError> {
        let object = &manifest.object;
        // freshness guard: the object planned against must still be the one there
        if self.preflight {
            let current = self.platform.get(object).await.map_err(|e| ApplyError::from_platform("update", object, e))?;
            match current {
                None => {
                    counter!("apply_stale_blocked_total", 1u64);
                    return Err(ApplyError::Transient { verb: "update", object: object.clone(), message: "object vanished since planning".into() });
                }
                Some(l) if l.uid != uid && !l.is_owned_by(id) => {
                    counter!("apply_stale_blocked_total", 1u64);
                    let payload = json!({"object": object.key(), "uid": l.uid});
                    self.event(id, EventType::ResourceConflict, payload)?;
                    return Err(ApplyError::Conflict { object: object.clone(), uid: l.uid });
                }
                Some(_) => {}
            }
        }
        let live = self.platform.apply(manifest).await.map_err(|e| ApplyError::from_platform("update", object, e))?;
        self.record(id, &live)?;
        self.event(id, EventType::ResourceUpdated, json!({"object": object.key(), "uid": live.uid, "fields": fields}))?;
        report.updated += 1;
        report.live.push(live);
        Ok(())
    }

    async fn delete(&self, id: DeploymentId, object: &ObjectRef, uid: &str, report: &mut ApplyReport) -> Result<(), ApplyError> {
        let outcome = self.platform.delete(object, uid).await.map_err(|e| ApplyError::from_platform("delete", object, e))?;
        self.store.delete_managed(object, uid)?;
        let outcome = match outcome {
            DeleteOutcome::Deleted => "deleted",
            DeleteOutcome::AlreadyGone => "already-gone",
            DeleteOutcome::Replaced => "replaced",
        };
        self.event(id, EventType::ResourceDeleted, json!({"object": object.key(), "uid": uid, "outcome": outcome}))?;
        report.deleted += 1;
        Ok(())
    }

    fn record(&self, id: DeploymentId, live: &LiveObject) -> Result<(), ApplyError> {
        let row = ManagedResource { deployment_id: id, object: live.object.clone(), uid: live.uid.clone(), last_seen_at: Utc::now(), managed: true };
        if self.store.upsert_managed(&row)? {
            Ok(())
        } else {
            Err(ApplyError::Conflict { object: live.object.clone(), uid: live.uid.clone() })
        }
    }

    fn event(&self, id: DeploymentId, t: EventType, payload: serde_json::Value) -> Result<(), ApplyError> {
        self.store.append_event(&NewEvent::reconciler(id, t, payload))?;
        Ok(())
    }
}
