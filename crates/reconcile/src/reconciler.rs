use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use chrono::Utc;
use gantry_apply::{Applier, ApplyReport};
use gantry_core::prelude::*;
use gantry_kubehub::Platform;
use gantry_persist::Store;
use gantry_plan::{plan, Plan, PlanInput, PlanMode};
use metrics::{counter, histogram};
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::ReconcileError;

/// Times a pass replans because desired state moved underneath it before giving up for this attempt.
pub const MAX_REPLANS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    Missing,
    Archived,
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconcileOutcome {
    Converged { generation: Generation, status: StatusSummary },
    /// Applied, but resources are still rolling out.
    Progressing { generation: Generation },
    /// A newer generation was written after apply; the pass recorded nothing.
    Superseded,
    Skipped(SkipReason),
    TornDown,
    /// Deletes were issued but owned objects are still terminating.
    TeardownPending,
}

impl ReconcileOutcome {
    /// Whether the deployment should be looked at again soon without a new trigger.
    pub fn needs_recheck(&self) -> bool { matches!(self, ReconcileOutcome::Progressing { .. } | ReconcileOutcome::TeardownPending) }

    fn label(&self) -> &'static str {
        match self {
            ReconcileOutcome::Converged { .. } => "converged",
            ReconcileOutcome::Progressing { .. } => "progressing",
            ReconcileOutcome::Superseded => "superseded",
            ReconcileOutcome::Skipped(_) => "skipped",
            ReconcileOutcome::TornDown => "torn-down",
            ReconcileOutcome::TeardownPending => "teardown-pending",
        }
    }
}

/// One reconcile pass for one deployment. Callers guarantee single-flight.
///
/// A pass that changes nothing (empty plan, generation already applied, status
/// unchanged) records no events, so rechecks of a slow rollout stay out of the log.
pub struct Reconciler {
    store: Arc<dyn Store>,
    platform: Arc<dyn Platform>,
    applier: Applier,
    /// Paused deployments whose skip was already recorded.
    paused: Mutex<FxHashSet<DeploymentId>>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn Store>, platform: Arc<dyn Platform>) -> Self {
        let applier = Applier::new(Arc::clone(&platform), Arc::clone(&store));
        Self { store, platform, applier, paused: Mutex::new(FxHashSet::default()) }
    }

    pub async fn reconcile(&self, id: DeploymentId) -> Result<ReconcileOutcome, ReconcileError> {
        let t0 = Instant::now();
        let Some(d) = self.store.get_deployment(id)? else {
            debug!(deployment = %id, "reconcile: deployment missing");
            return Ok(ReconcileOutcome::Skipped(SkipReason::Missing));
        };
        if d.archived_at.is_some() {
            return Ok(ReconcileOutcome::Skipped(SkipReason::Archived));
        }
        if d.lifecycle == LifecycleState::Paused {
            if self.paused.lock().unwrap_or_else(PoisonError::into_inner).insert(id) {
                self.event(id, EventType::ReconcileSkipped, json!({"generation": d.generation, "reason": "paused"}))?;
            } else {
                debug!(deployment = %id, "still paused");
            }
            return Ok(ReconcileOutcome::Skipped(SkipReason::Paused));
        }
        self.paused.lock().unwrap_or_else(PoisonError::into_inner).remove(&id);
        debug!(deployment = %id, generation = %d.generation, lifecycle = %d.lifecycle, "reconcile start");

        let res = self.pass(d, t0).await;
        let took_ms = t0.elapsed().as_millis() as u64;
        histogram!("reconcile_ms", took_ms as f64);
        match &res {
            Ok(outcome) => {
                counter!("reconcile_total", 1u64, "outcome" => outcome.label());
                info!(deployment = %id, outcome = outcome.label(), took_ms, "reconcile done");
            }
            Err(e) => {
                counter!("reconcile_total", 1u64, "outcome" => e.class.as_str());
                warn!(deployment = %id, class = %e.class, error = %e.message, took_ms, "reconcile failed");
                let payload = json!({"class": e.class, "error": e.message, "action": e.action, "took_ms": took_ms});
                if let Err(se) = self.event(id, EventType::ReconcileFailed, payload) {
                    warn!(deployment = %id, error = %se, "could not record reconcile failure");
                }
            }
        }
        res
    }

    async fn pass(&self, mut d: Deployment, t0: Instant) -> Result<ReconcileOutcome, ReconcileError> {
        for _ in 0..=MAX_REPLANS {
            let managed = self.store.list_managed(d.id)?;
            let live = self.list_owned(d.id).await?;
            let plan = plan(&PlanInput { deployment: &d, managed: &managed, live: &live });

            // never act on a generation that was superseded while we listed
            let Some(fresh) = self.store.get_deployment(d.id)? else {
                return Ok(ReconcileOutcome::Skipped(SkipReason::Missing));
            };
            if fresh.generation != d.generation || fresh.lifecycle != d.lifecycle {
                counter!("reconcile_replans_total", 1u64);
                debug!(deployment = %d.id, from = %d.generation, to = %fresh.generation, "desired state moved; replanning");
                d = fresh;
                if d.lifecycle == LifecycleState::Paused {
                    return Ok(ReconcileOutcome::Skipped(SkipReason::Paused));
                }
                continue;
            }
            return self.apply(&d, &plan, &live, t0).await;
        }
        Err(ReconcileError::transient(format!("desired state changed {} times during planning", MAX_REPLANS + 1)))
    }

    async fn apply(&self, d: &Deployment, plan: &Plan, live: &[LiveObject], t0: Instant) -> Result<ReconcileOutcome, ReconcileError> {
        let quiet = plan.actions.is_empty() && plan.mode == PlanMode::Converge && d.last_applied_generation == d.generation;
        if !quiet {
            self.started(d)?;
        }
        let report = match self.applier.execute(plan).await {
            Ok(r) => r,
            Err(failure) => {
                let action = plan.actions.get(failure.done).map(|a| a.summary());
                return Err(ReconcileError::from(failure.error).with_action(action));
            }
        };

        if plan.mode == PlanMode::Teardown {
            let remaining = self.list_owned(d.id).await?;
            if remaining.is_empty() {
                self.store.archive_deployment(d.id)?;
                return Ok(ReconcileOutcome::TornDown);
            }
            debug!(deployment = %d.id, remaining = remaining.len(), "teardown waiting on terminating objects");
            return Ok(ReconcileOutcome::TeardownPending);
        }

        self.repair_ledger(d, live, &report)?;
        let status = self.observe(d, live, &report).await?;
        if !self.store.mark_applied(d.id, d.generation, status)? {
            debug!(deployment = %d.id, generation = %d.generation, "generation superseded after apply");
            return Ok(ReconcileOutcome::Superseded);
        }
        let outcome = match status {
            StatusSummary::Progressing => ReconcileOutcome::Progressing { generation: d.generation },
            status => ReconcileOutcome::Converged { generation: d.generation, status },
        };
        if quiet {
            if status == d.status {
                counter!("reconcile_quiet_total", 1u64);
                debug!(deployment = %d.id, status = %status, "nothing changed");
                return Ok(outcome);
            }
            self.started(d)?;
        }
        info!(deployment = %d.id, generation = %d.generation, from = %d.status, to = %status, "reconcile applied");
        let (c, u, x) = plan.counts();
        self.event(
            d.id,
            EventType::ReconcileSucceeded,
            json!({
                "generation": d.generation,
                "created": c,
                "updated": u,
                "deleted": x,
                "status": status.as_str(),
                "took_ms": t0.elapsed().as_millis() as u64,
            }),
        )?;
        Ok(outcome)
    }

    fn started(&self, d: &Deployment) -> Result<(), ReconcileError> {
        self.event(d.id, EventType::ReconcileStarted, json!({"generation": d.generation, "lifecycle": d.lifecycle.as_str()}))?;
        Ok(())
    }

    /// Owned live objects of every planned kind.
    async fn list_owned(&self, id: DeploymentId) -> Result<Vec<LiveObject>, ReconcileError> {
        let mut out = Vec::new();
        for kind in ObjectKind::ALL.iter().copied().filter(|k| k.is_planned()) {
            out.extend(self.platform.list_for(kind, id).await?.into_iter().filter(|o| o.is_owned_by(id)));
        }
        Ok(out)
    }

    /// Rows for desired objects that already carried our markers but were never recorded
    /// (an earlier pass crashed between the platform call and the row write).
    fn repair_ledger(&self, d: &Deployment, live: &[LiveObject], report: &ApplyReport) -> Result<(), ReconcileError> {
        let rows: BTreeMap<ObjectRef, ManagedResource> = self.store.list_managed(d.id)?.into_iter().map(|r| (r.object.clone(), r)).collect();
        for obj in live {
            if report.live.iter().any(|l| l.object == obj.object) || d.desired_spec.find(&obj.object, &d.namespace).is_none() {
                continue;
            }
            let recorded = rows.get(&obj.object).map(|r| r.uid == obj.uid && r.managed).unwrap_or(false);
            if recorded {
                continue;
            }
            let row = ManagedResource {
                deployment_id: d.id,
                object: obj.object.clone(),
                uid: obj.uid.clone(),
                last_seen_at: Utc::now(),
                managed: true,
            };
            if self.store.upsert_managed(&row)? {
                debug!(deployment = %d.id, object = %obj.object, "ledger repaired");
            }
        }
        Ok(())
    }

    /// Post-apply status of every desired object plus the deployment's pods.
    async fn observe(&self, d: &Deployment, live: &[LiveObject], report: &ApplyReport) -> Result<StatusSummary, ReconcileError> {
        let mut snapshot = ObservedSnapshot::empty(d.id);
        for tpl in &d.desired_spec.objects {
            let object = tpl.object_ref(&d.namespace);
            let current = report.live.iter().rev().find(|l| l.object == object).or_else(|| live.iter().find(|l| l.object == object));
            let status = match current {
                Some(l) => l.status(),
                None => ResourceStatus::new(ResourceHealth::Progressing),
            };
            snapshot.resources.insert(object.key(), status);
        }
        match self.platform.list_for(ObjectKind::Pod, d.id).await {
            Ok(pods) => {
                for p in pods {
                    snapshot.resources.insert(p.object.key(), p.status());
                }
            }
            // pod health is advisory; ingest keeps it current anyway
            Err(e) => warn!(deployment = %d.id, error = %e, "pod list failed"),
        }
        self.store.put_snapshot(&snapshot)?;
        Ok(snapshot.summary())
    }

    fn event(&self, id: DeploymentId, event_type: EventType, payload: serde_json::Value) -> Result<i64, ReconcileError> {
        Ok(self.store.append_event(&NewEvent::reconciler(id, event_type, payload))?)
    }
}
