//! Gantry ingest: turns platform watch notifications into drift verdicts,
//! health snapshots, audit events and reconcile triggers.
//!
//! Notifications are deduplicated on (uid, resourceVersion), coalesced per UID
//! and classified against the desired revision the live object was applied
//! from. A periodic resync relists every kind and catches what watches missed.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use gantry_core::markers;
use gantry_core::prelude::*;
use gantry_drift::{adopt_into, classify, resolve, ClassifyInput, DriftResponse, DriftVerdict};
use gantry_persist::{Store, StoreError};
use metrics::counter;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::json;
use tracing::{debug, info, warn};

mod index;
mod pipeline;

pub use index::{Coalescer, IndexBuilder, LiveIndex};
pub use pipeline::{spawn_ingest, IngestConfig, IngestHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Skip {
    /// Same (uid, resourceVersion) as the last processed notification.
    Duplicate,
    /// No managed row and no ownership markers.
    Unowned,
    /// Owning deployment is gone or archived.
    Inactive,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Skipped(Skip),
    Classified { deployment: DeploymentId, verdict: DriftVerdict, response: DriftResponse, health_changed: bool },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResyncReport {
    pub seen: usize,
    pub drifted: usize,
    pub missing: usize,
    pub errors: usize,
}

pub struct Ingestor {
    store: Arc<dyn Store>,
    triggers: Arc<dyn TriggerSink>,
    seen: Mutex<FxHashMap<String, String>>,
}

impl Ingestor {
    pub fn new(store: Arc<dyn Store>, triggers: Arc<dyn TriggerSink>) -> Self {
        Self { store, triggers, seen: Mutex::new(FxHashMap::default()) }
    }

    pub fn handle(&self, n: &Notification) -> Result<Outcome, StoreError> { self.process(n, false) }

    /// Re-evaluate a full list of owned objects of `kind`. Rows whose object is
    /// absent from the list are treated as deleted.
    pub fn resync(&self, kind: ObjectKind, objects: &[LiveObject]) -> Result<ResyncReport, StoreError> {
        let started = std::time::Instant::now();
        let mut report = ResyncReport::default();
        for obj in objects {
            let n = Notification { event: NotificationKind::Update, object: obj.clone() };
            self.tally(&mut report, self.process(&n, true), &obj.object);
        }
        let present: FxHashSet<&ObjectRef> = objects.iter().map(|o| &o.object).collect();
        if kind.is_planned() {
            for row in self.store.list_managed_kind(kind)? {
                if !row.managed || present.contains(&row.object) {
                    continue;
                }
                report.missing += 1;
                let gone = LiveObject { object: row.object.clone(), uid: row.uid.clone(), resource_version: String::new(), raw: json!({}) };
                let n = Notification { event: NotificationKind::Delete, object: gone };
                self.tally(&mut report, self.process(&n, true), &row.object);
            }
        } else {
            report.missing += self.prune_snapshots(kind, &present)?;
        }
        metrics::histogram!("ingest_resync_ms", started.elapsed().as_secs_f64() * 1000.0, "kind" => kind.as_str());
        debug!(kind = %kind, seen = report.seen, drifted = report.drifted, missing = report.missing, "resync done");
        Ok(report)
    }

    fn tally(&self, report: &mut ResyncReport, res: Result<Outcome, StoreError>, object: &ObjectRef) {
        match res {
            Ok(Outcome::Classified { verdict, .. }) => {
                report.seen += 1;
                if verdict.is_drift() {
                    report.drifted += 1;
                }
            }
            Ok(Outcome::Skipped(_)) => report.seen += 1,
            Err(e) => {
                warn!(object = %object, error = %e, "resync item failed");
                report.errors += 1;
            }
        }
    }

    /// True when this (uid, resourceVersion) has not been processed yet; records it.
    fn first_sighting(&self, obj: &LiveObject) -> bool {
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        match seen.get(&obj.uid) {
            Some(rv) if rv == &obj.resource_version => false,
            _ => {
                seen.insert(obj.uid.clone(), obj.resource_version.clone());
                true
            }
        }
    }

    fn forget(&self, uid: &str) { self.seen.lock().unwrap_or_else(PoisonError::into_inner).remove(uid); }

    fn process(&self, n: &Notification, force: bool) -> Result<Outcome, StoreError> {
        let obj = &n.object;
        let deleted = n.event == NotificationKind::Delete;
        if deleted {
            self.forget(&obj.uid);
        } else if !self.first_sighting(obj) && !force {
            return Ok(Outcome::Skipped(Skip::Duplicate));
        }
        counter!("ingest_notifications_total", 1u64, "kind" => obj.object.kind.as_str());

        let kind = obj.object.kind;
        let row = if kind.is_planned() { self.store.managed_by_identity(&obj.object)? } else { None };
        let owner = row.as_ref().map(|r| r.deployment_id).or_else(|| obj.ownership().map(|o| o.deployment_id));
        let Some(id) = owner else { return Ok(Outcome::Skipped(Skip::Unowned)) };
        let Some(d) = self.store.get_deployment(id)? else { return Ok(Outcome::Skipped(Skip::Inactive)) };
        if d.archived_at.is_some() {
            return Ok(Outcome::Skipped(Skip::Inactive));
        }
        let live = (!deleted).then_some(obj);

        if !kind.is_planned() {
            let health_changed = if live.map(|l| l.is_owned_by(id)).unwrap_or(true) { self.observe_health(&d, &obj.object, live)? } else { false };
            return Ok(Outcome::Classified { deployment: id, verdict: DriftVerdict::NoDrift, response: DriftResponse::None, health_changed });
        }

        if deleted {
            // a delete for a uid the row no longer carries belongs to a predecessor
            let ours = row.as_ref().map(|r| r.uid == obj.uid).unwrap_or(false);
            let planned_away = d.lifecycle == LifecycleState::Deleted || d.desired_spec.find(&obj.object, &d.namespace).is_none();
            if !ours || planned_away {
                if ours {
                    self.store.delete_managed(&obj.object, &obj.uid)?;
                }
                let health_changed = if ours || row.is_none() { self.observe_health(&d, &obj.object, None)? } else { false };
                return Ok(Outcome::Classified { deployment: id, verdict: DriftVerdict::NoDrift, response: DriftResponse::None, health_changed });
            }
        }

        // compare against what was applied to this object, not what is desired now
        let basis_gen = live.and_then(|l| markers::read_generation(&l.raw)).unwrap_or(d.last_applied_generation);
        let basis = if basis_gen == d.generation { None } else { self.store.revision(id, basis_gen)? };
        let basis = basis.as_ref().unwrap_or(&d.desired_spec);
        let verdict = classify(&ClassifyInput {
            deployment: id,
            lifecycle: d.lifecycle,
            default_ns: &d.namespace,
            template: basis.find(&obj.object, &d.namespace),
            managed: row.as_ref(),
            live,
            policy: &d.policy,
        });

        let mut lookup_err = None;
        let response = resolve(&verdict, kind, &d.policy, |path| match self.store.pending_approval(id, &obj.object, path) {
            Ok(a) => a,
            Err(e) => {
                lookup_err.get_or_insert(e);
                None
            }
        });
        if let Some(e) = lookup_err {
            return Err(e);
        }

        self.act(&d, obj, live.is_some(), row.as_ref(), &verdict, &response)?;
        let health_changed = match &verdict {
            DriftVerdict::Unmanaged { .. } => false,
            _ => self.observe_health(&d, &obj.object, live)?,
        };
        Ok(Outcome::Classified { deployment: id, verdict, response, health_changed })
    }

    fn act(
        &self,
        d: &Deployment,
        obj: &LiveObject,
        present: bool,
        row: Option<&ManagedResource>,
        verdict: &DriftVerdict,
        response: &DriftResponse,
    ) -> Result<(), StoreError> {
        let id = d.id;
        let key = obj.object.key();
        match verdict {
            DriftVerdict::NoDrift => {
                let owned = present && obj.is_owned_by(id);
                let refresh = match row {
                    Some(r) => r.uid == obj.uid || !r.managed,
                    None => d.desired_spec.find(&obj.object, &d.namespace).is_some(),
                };
                if owned && refresh {
                    let fresh = ManagedResource { deployment_id: id, object: obj.object.clone(), uid: obj.uid.clone(), last_seen_at: Utc::now(), managed: true };
                    if !self.store.upsert_managed(&fresh)? {
                        warn!(object = %key, "identity is tracked by another deployment");
                    }
                }
            }
            DriftVerdict::ModifiedExternally { .. } => match response {
                DriftResponse::Enforce { fields } => {
                    counter!("ingest_drift_total", 1u64, "response" => "enforce");
                    let payload = json!({"object": key, "uid": obj.uid, "fields": fields, "response": "enforce"});
                    self.store.append_event(&NewEvent::watch(id, EventType::DriftDetected, payload))?;
                    self.triggers.trigger(id, TriggerReason::Drift);
                }
                DriftResponse::Adopt { fields, approvals } => {
                    counter!("ingest_drift_total", 1u64, "response" => "adopt");
                    let adopted = adopt_into(&d.desired_spec, &obj.object, &d.namespace, fields);
                    let result = match adopted {
                        Some(spec) => {
                            let payload = json!({"object": key, "uid": obj.uid, "fields": fields});
                            self.store.adopt_drift(id, d.generation, spec, approvals, payload).map(|_| ())
                        }
                        None => Err(StoreError::Rejected(format!("cannot fold drift into {key}"))),
                    };
                    match result {
                        Ok(()) => info!(deployment = %id, object = %key, "drift adopted"),
                        Err(e @ (StoreError::Conflict { .. } | StoreError::Rejected(_))) => {
                            // fall back to enforcement; the next pass sees the fresh generation
                            warn!(deployment = %id, object = %key, error = %e, "adoption failed; enforcing");
                            let payload = json!({"object": key, "uid": obj.uid, "fields": fields, "response": "enforce", "adoption_error": e.to_string()});
                            self.store.append_event(&NewEvent::watch(id, EventType::DriftDetected, payload))?;
                            self.triggers.trigger(id, TriggerReason::Drift);
                        }
                        Err(e) => return Err(e),
                    }
                }
                DriftResponse::Ignore | DriftResponse::None => {}
            },
            DriftVerdict::DeletedExternally => {
                if let Some(r) = row {
                    self.store.upsert_managed(&ManagedResource { managed: false, last_seen_at: Utc::now(), ..r.clone() })?;
                }
                if matches!(response, DriftResponse::Enforce { .. }) {
                    counter!("ingest_drift_total", 1u64, "response" => "recreate");
                    let payload = json!({"object": key, "uid": row.map(|r| r.uid.as_str()).unwrap_or(obj.uid.as_str())});
                    self.store.append_event(&NewEvent::watch(id, EventType::ResourceDeletedExternally, payload))?;
                    self.triggers.trigger(id, TriggerReason::Drift);
                }
            }
            DriftVerdict::Unmanaged { displaced } => {
                let payload = json!({"object": key, "uid": obj.uid});
                self.store.append_event(&NewEvent::watch(id, EventType::UnmanagedObjectDetected, payload))?;
                if *displaced {
                    if let Some(r) = row {
                        self.store.upsert_managed(&ManagedResource { managed: false, last_seen_at: Utc::now(), ..r.clone() })?;
                        let payload = json!({"object": key, "uid": r.uid, "replaced_by": obj.uid});
                        self.store.append_event(&NewEvent::watch(id, EventType::ResourceDeletedExternally, payload))?;
                    }
                }
                self.triggers.trigger(id, TriggerReason::Drift);
            }
        }
        Ok(())
    }

    /// Update the deployment's observed snapshot; true when the object's health changed.
    fn observe_health(&self, d: &Deployment, object: &ObjectRef, live: Option<&LiveObject>) -> Result<bool, StoreError> {
        let mut snap = self.store.get_snapshot(d.id)?.unwrap_or_else(|| ObservedSnapshot::empty(d.id));
        let key = object.key();
        let before = snap.resources.get(&key).map(|s| s.health);
        let touched = match live {
            Some(l) => {
                let status = l.status();
                let same = snap.resources.get(&key) == Some(&status);
                if !same {
                    snap.resources.insert(key.clone(), status);
                }
                !same
            }
            None => snap.resources.remove(&key).is_some(),
        };
        if !touched {
            return Ok(false);
        }
        snap.observed_at = Utc::now();
        self.store.put_snapshot(&snap)?;
        let after = snap.resources.get(&key).map(|s| s.health);
        // first sightings only matter when they arrive broken
        let changed = match (before, after) {
            (None, Some(h)) => h == ResourceHealth::Unhealthy,
            (b, a) => b != a,
        };
        if changed {
            let payload = json!({"object": key, "from": before, "to": after});
            self.store.append_event(&NewEvent::watch(d.id, EventType::ResourceHealthChanged, payload))?;
            self.triggers.trigger(d.id, TriggerReason::HealthChanged);
        }
        Ok(changed)
    }

    /// Drop snapshot entries of an observe-only kind that a relist no longer shows.
    fn prune_snapshots(&self, kind: ObjectKind, present: &FxHashSet<&ObjectRef>) -> Result<usize, StoreError> {
        let prefix = format!("{kind}/");
        let keys: FxHashSet<String> = present.iter().map(|o| o.key()).collect();
        let mut pruned = 0;
        for d in self.store.list_deployments(false)? {
            let Some(mut snap) = self.store.get_snapshot(d.id)? else { continue };
            let before = snap.resources.len();
            snap.resources.retain(|k, _| !k.starts_with(&prefix) || keys.contains(k));
            let gone = before - snap.resources.len();
            if gone > 0 {
                snap.observed_at = Utc::now();
                self.store.put_snapshot(&snap)?;
                self.triggers.trigger(d.id, TriggerReason::HealthChanged);
                pruned += gone;
            }
        }
        Ok(pruned)
    }
}
