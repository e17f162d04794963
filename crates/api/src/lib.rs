//! Gantry public API façade (in-process).
//!
//! Frontends (the CLI today) depend on [`GantryApi`] only. Every desired-state
//! write goes through the store's optimistic generation check; reconciles are
//! requested through a [`TriggerSink`] and never run inline.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use gantry_core::prelude::*;
use gantry_persist::{NewDeployment, ReconcileJob, Store, StoreError};
use metrics::histogram;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{info, warn};

/// API errors suitable for transport over RPC later.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum ApiError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("internal: {0}")]
    Internal(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(m) => ApiError::NotFound(m),
            e @ StoreError::Conflict { .. } => ApiError::Conflict(e.to_string()),
            StoreError::Rejected(m) => ApiError::Rejected(m),
            // no write is attempted without the store; callers retry later
            StoreError::Unavailable(m) => ApiError::Unavailable(m),
            StoreError::Corrupt(m) => ApiError::Internal(m),
        }
    }
}

/// Body of a create request, as written in a deployment file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateRequest {
    pub template: TemplateRef,
    pub namespace: String,
    pub spec: DesiredSpec,
    #[serde(default)]
    pub policy: DriftPolicy,
}

/// One row of `list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentSummary {
    pub id: DeploymentId,
    pub template: TemplateRef,
    pub namespace: String,
    pub generation: Generation,
    pub last_applied_generation: Generation,
    pub lifecycle: LifecycleState,
    pub status: StatusSummary,
    pub archived: bool,
}

impl From<&Deployment> for DeploymentSummary {
    fn from(d: &Deployment) -> Self {
        Self {
            id: d.id,
            template: d.template.clone(),
            namespace: d.namespace.clone(),
            generation: d.generation,
            last_applied_generation: d.last_applied_generation,
            lifecycle: d.lifecycle,
            status: d.status,
            archived: d.archived_at.is_some(),
        }
    }
}

/// Deployment status plus the state of its reconcile job, if one exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusView {
    #[serde(flatten)]
    pub summary: DeploymentSummary,
    pub converged: bool,
    pub job: Option<ReconcileJob>,
}

pub struct CancelHandle {
    task: Option<tokio::task::JoinHandle<()>>,
}

impl CancelHandle {
    pub fn cancel(mut self) {
        if let Some(h) = self.task.take() {
            h.abort();
        }
    }
}

/// Generic stream handle used by API streaming endpoints.
pub struct StreamHandle<T> {
    pub rx: tokio::sync::mpsc::Receiver<T>,
    pub cancel: CancelHandle,
}

#[async_trait::async_trait]
pub trait GantryApi: Send + Sync {
    async fn create_deployment(&self, req: CreateRequest) -> ApiResult<Deployment>;

    /// Replace the desired spec. With `expected`, fails with `Conflict` if the
    /// deployment moved past that generation.
    async fn update_spec(&self, id: DeploymentId, expected: Option<Generation>, spec: DesiredSpec) -> ApiResult<Deployment>;

    /// Pause or resume. Deletion goes through [`GantryApi::delete_deployment`].
    async fn set_lifecycle(&self, id: DeploymentId, state: LifecycleState) -> ApiResult<Deployment>;

    /// Start teardown; the reconciler removes owned objects and archives the row.
    async fn delete_deployment(&self, id: DeploymentId) -> ApiResult<Deployment>;

    /// Request a reconcile now, bypassing backoff.
    async fn trigger(&self, id: DeploymentId) -> ApiResult<()>;

    /// Pre-approve adopting out-of-band changes at or beneath `path` of `object`.
    async fn approve_adoption(&self, id: DeploymentId, object: ObjectRef, path: &str) -> ApiResult<i64>;

    async fn status(&self, id: DeploymentId) -> ApiResult<StatusView>;

    async fn events(&self, id: DeploymentId, after_seq: i64, limit: usize) -> ApiResult<Vec<Event>>;

    async fn snapshot(&self, id: DeploymentId) -> ApiResult<ObservedSnapshot>;

    async fn list(&self, include_archived: bool) -> ApiResult<Vec<DeploymentSummary>>;

    /// Stream events after `after_seq` as they are appended.
    async fn follow_events(&self, id: DeploymentId, after_seq: i64) -> ApiResult<StreamHandle<Event>>;
}

fn max_spec_bytes() -> usize {
    std::env::var("GANTRY_MAX_SPEC_BYTES").ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(1_000_000)
}

fn max_spec_nodes() -> usize {
    std::env::var("GANTRY_MAX_SPEC_NODES").ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(100_000)
}

fn node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max {
            return;
        }
        *cur += 1;
        match v {
            Json::Object(map) => map.values().for_each(|vv| walk(vv, cur, max)),
            Json::Array(arr) => arr.iter().for_each(|vv| walk(vv, cur, max)),
            _ => {}
        }
    }
    let mut n = 0usize;
    walk(v, &mut n, max);
    n >= max
}

/// Parse a YAML (or JSON) document with size and complexity guards.
pub fn parse_yaml<T: DeserializeOwned>(text: &str) -> ApiResult<T> {
    if text.len() > max_spec_bytes() {
        return Err(ApiError::Validation(format!("document too large (>{} bytes)", max_spec_bytes())));
    }
    let val: serde_yaml::Value = serde_yaml::from_str(text).map_err(|e| ApiError::Validation(format!("parsing YAML: {e}")))?;
    let json = serde_json::to_value(val).map_err(|e| ApiError::Validation(format!("converting YAML to JSON: {e}")))?;
    if node_budget_exceeded(&json, max_spec_nodes()) {
        return Err(ApiError::Validation(format!("document too complex (>{} nodes)", max_spec_nodes())));
    }
    serde_json::from_value(json).map_err(|e| ApiError::Validation(e.to_string()))
}

fn validate_policy(policy: &DriftPolicy) -> ApiResult<()> {
    for r in policy.allowed_mutations.iter().chain(policy.ignore_paths.iter()) {
        if !r.path.starts_with('/') {
            return Err(ApiError::Validation(format!("policy path {:?} is not a JSON pointer", r.path)));
        }
    }
    Ok(())
}

// ----------------- In-process implementation -----------------

/// In-process implementation over the store.
pub struct InProcApi {
    store: Arc<dyn Store>,
    triggers: Arc<dyn TriggerSink>,
    poll_every: Duration,
}

impl InProcApi {
    pub fn new(store: Arc<dyn Store>, triggers: Arc<dyn TriggerSink>) -> Self {
        let ms = std::env::var("GANTRY_EVENT_POLL_MS").ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(250);
        Self { store, triggers, poll_every: Duration::from_millis(ms.max(10)) }
    }

    fn require(&self, id: DeploymentId) -> ApiResult<Deployment> {
        self.store.get_deployment(id)?.ok_or_else(|| ApiError::NotFound(format!("deployment {id}")))
    }

    fn done(op: &'static str, t0: Instant) {
        histogram!("api_call_ms", t0.elapsed().as_secs_f64() * 1000.0, "op" => op);
        info!(took_ms = %t0.elapsed().as_millis(), "api: {} ok", op);
    }
}

#[async_trait::async_trait]
impl GantryApi for InProcApi {
    async fn create_deployment(&self, req: CreateRequest) -> ApiResult<Deployment> {
        let t0 = Instant::now();
        info!(template = %req.template.name, version = %req.template.version, ns = %req.namespace, "api: create_deployment start");
        req.spec.validate(&req.namespace).map_err(|e| ApiError::Validation(e.to_string()))?;
        validate_policy(&req.policy)?;
        let d = self.store.create_deployment(NewDeployment {
            template: req.template,
            namespace: req.namespace,
            desired_spec: req.spec,
            policy: req.policy,
        })?;
        self.triggers.trigger(d.id, TriggerReason::DesiredChanged);
        info!(deployment = %d.id, "api: deployment created");
        Self::done("create_deployment", t0);
        Ok(d)
    }

    async fn update_spec(&self, id: DeploymentId, expected: Option<Generation>, spec: DesiredSpec) -> ApiResult<Deployment> {
        let t0 = Instant::now();
        info!(deployment = %id, expected = ?expected.map(|g| g.get()), "api: update_spec start");
        let cur = self.require(id)?;
        spec.validate(&cur.namespace).map_err(|e| ApiError::Validation(e.to_string()))?;
        let d = self.store.write_desired(id, expected, spec)?;
        self.triggers.trigger(id, TriggerReason::DesiredChanged);
        info!(deployment = %id, generation = %d.generation, "api: spec written");
        Self::done("update_spec", t0);
        Ok(d)
    }

    async fn set_lifecycle(&self, id: DeploymentId, state: LifecycleState) -> ApiResult<Deployment> {
        let t0 = Instant::now();
        info!(deployment = %id, state = %state, "api: set_lifecycle start");
        if state == LifecycleState::Deleted {
            return Err(ApiError::Validation("use delete to remove a deployment".into()));
        }
        let d = self.store.set_lifecycle(id, state)?;
        self.triggers.trigger(id, TriggerReason::Lifecycle);
        Self::done("set_lifecycle", t0);
        Ok(d)
    }

    async fn delete_deployment(&self, id: DeploymentId) -> ApiResult<Deployment> {
        let t0 = Instant::now();
        info!(deployment = %id, "api: delete_deployment start");
        let cur = self.require(id)?;
        if cur.archived_at.is_some() {
            return Err(ApiError::Rejected(format!("deployment {id} is already archived")));
        }
        let d = self.store.set_lifecycle(id, LifecycleState::Deleted)?;
        self.triggers.trigger(id, TriggerReason::Lifecycle);
        Self::done("delete_deployment", t0);
        Ok(d)
    }

    async fn trigger(&self, id: DeploymentId) -> ApiResult<()> {
        let t0 = Instant::now();
        info!(deployment = %id, "api: trigger start");
        let d = self.require(id)?;
        if d.archived_at.is_some() {
            return Err(ApiError::Rejected(format!("deployment {id} is archived")));
        }
        self.triggers.trigger(id, TriggerReason::Manual);
        Self::done("trigger", t0);
        Ok(())
    }

    async fn approve_adoption(&self, id: DeploymentId, object: ObjectRef, path: &str) -> ApiResult<i64> {
        let t0 = Instant::now();
        info!(deployment = %id, object = %object, path = %path, "api: approve_adoption start");
        if !path.starts_with('/') {
            return Err(ApiError::Validation(format!("{path:?} is not a JSON pointer")));
        }
        let d = self.require(id)?;
        if d.policy.mode_for(object.kind) != PolicyMode::Adopt {
            return Err(ApiError::Rejected(format!("{} drift is not adopted under this deployment's policy", object.kind)));
        }
        if !d.policy.is_mutation_allowed(object.kind, path) {
            return Err(ApiError::Rejected(format!("{path} is not an allowed mutation for {}", object.kind)));
        }
        if d.desired_spec.find(&object, &d.namespace).is_none() {
            return Err(ApiError::NotFound(format!("{object} is not part of deployment {id}")));
        }
        let approval = self.store.approve_adoption(id, &object, path)?;
        Self::done("approve_adoption", t0);
        Ok(approval)
    }

    async fn status(&self, id: DeploymentId) -> ApiResult<StatusView> {
        let d = self.require(id)?;
        let job = self.store.get_job(id)?;
        Ok(StatusView { summary: DeploymentSummary::from(&d), converged: d.is_converged(), job })
    }

    async fn events(&self, id: DeploymentId, after_seq: i64, limit: usize) -> ApiResult<Vec<Event>> {
        self.require(id)?;
        Ok(self.store.list_events(id, after_seq, limit.clamp(1, 10_000))?)
    }

    async fn snapshot(&self, id: DeploymentId) -> ApiResult<ObservedSnapshot> {
        self.require(id)?;
        Ok(self.store.get_snapshot(id)?.unwrap_or_else(|| ObservedSnapshot::empty(id)))
    }

    async fn list(&self, include_archived: bool) -> ApiResult<Vec<DeploymentSummary>> {
        let t0 = Instant::now();
        let out: Vec<DeploymentSummary> = self.store.list_deployments(include_archived)?.iter().map(DeploymentSummary::from).collect();
        info!(count = out.len(), took_ms = %t0.elapsed().as_millis(), "api: list ok");
        Ok(out)
    }

    async fn follow_events(&self, id: DeploymentId, after_seq: i64) -> ApiResult<StreamHandle<Event>> {
        self.require(id)?;
        info!(deployment = %id, after_seq, "api: follow_events start");
        let cap = std::env::var("GANTRY_QUEUE_CAP").ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(256);
        let (tx, rx) = tokio::sync::mpsc::channel::<Event>(cap.max(1));
        let store = Arc::clone(&self.store);
        let every = self.poll_every;
        let handle = tokio::spawn(async move {
            let mut cursor = after_seq;
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let batch = match store.list_events(id, cursor, 500) {
                    Ok(b) => b,
                    Err(e) => {
                        warn!(deployment = %id, error = %e, "api: follow_events poll failed");
                        continue;
                    }
                };
                for ev in batch {
                    cursor = ev.seq;
                    if tx.send(ev).await.is_err() {
                        return;
                    }
                }
            }
        });
        Ok(StreamHandle { rx, cancel: CancelHandle { task: Some(handle) } })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::MutationRule;
    use gantry_persist::SqliteStore;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Sink(Mutex<Vec<TriggerReason>>);

    impl TriggerSink for Sink {
        fn trigger(&self, _id: DeploymentId, reason: TriggerReason) { self.0.lock().unwrap().push(reason); }
    }

    const SPEC: &str = r#"
template: { name: game-server, version: "3" }
namespace: games
spec:
  objects:
    - kind: Workload
      name: gs
      body:
        spec: { replicas: 2, serviceName: gs }
    - kind: Service
      name: gs
      body:
        spec: { ports: [{ port: 7777, protocol: UDP }] }
policy:
  per_kind: { Workload: Adopt }
  allowed_mutations:
    - { kind: Workload, path: /spec/replicas }
"#;

    fn api() -> (InProcApi, Arc<SqliteStore>, Arc<Sink>) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let sink = Arc::new(Sink::default());
        (InProcApi::new(store.clone(), sink.clone()), store, sink)
    }

    #[tokio::test]
    async fn create_from_yaml_then_update_with_generation_check() {
        let (api, _store, sink) = api();
        let req: CreateRequest = parse_yaml(SPEC).unwrap();
        let d = api.create_deployment(req.clone()).await.unwrap();
        assert_eq!(d.generation, Generation::FIRST);
        assert_eq!(d.policy.allowed_mutations, vec![MutationRule::new(Some(ObjectKind::Workload), "/spec/replicas")]);

        let d2 = api.update_spec(d.id, Some(Generation::FIRST), req.spec.clone()).await.unwrap();
        assert_eq!(d2.generation, Generation(2));
        let stale = api.update_spec(d.id, Some(Generation::FIRST), req.spec).await.unwrap_err();
        assert!(matches!(stale, ApiError::Conflict(_)), "{stale:?}");
        assert_eq!(*sink.0.lock().unwrap(), vec![TriggerReason::DesiredChanged, TriggerReason::DesiredChanged]);

        let st = api.status(d.id).await.unwrap();
        assert_eq!(st.summary.generation, Generation(2));
        assert!(!st.converged);
        assert!(st.job.is_some(), "write enqueued a reconcile");
    }

    #[tokio::test]
    async fn invalid_specs_are_rejected_before_any_write() {
        let (api, store, _) = api();
        let mut req: CreateRequest = parse_yaml(SPEC).unwrap();
        req.spec.objects[1].name = "Not_A_Name".into();
        assert!(matches!(api.create_deployment(req).await, Err(ApiError::Validation(_))));
        assert!(store.list_deployments(true).unwrap().is_empty());

        assert!(matches!(parse_yaml::<CreateRequest>("template: ["), Err(ApiError::Validation(_))));
        assert!(matches!(parse_yaml::<CreateRequest>("namespace: games"), Err(ApiError::Validation(_))));
    }

    #[test]
    fn node_budget_counts_nested_values() {
        let v = serde_json::json!({"a": [1, 2, {"b": 3}]});
        assert!(!node_budget_exceeded(&v, 10));
        assert!(node_budget_exceeded(&v, 4));
    }

    #[tokio::test]
    async fn lifecycle_and_delete() {
        let (api, _store, sink) = api();
        let d = api.create_deployment(parse_yaml(SPEC).unwrap()).await.unwrap();
        assert!(matches!(api.set_lifecycle(d.id, LifecycleState::Deleted).await, Err(ApiError::Validation(_))));
        assert_eq!(api.set_lifecycle(d.id, LifecycleState::Paused).await.unwrap().lifecycle, LifecycleState::Paused);
        assert_eq!(api.delete_deployment(d.id).await.unwrap().lifecycle, LifecycleState::Deleted);
        // teardown is one-way
        assert!(matches!(api.set_lifecycle(d.id, LifecycleState::Active).await, Err(ApiError::Rejected(_))));
        assert!(matches!(api.update_spec(d.id, None, DesiredSpec::default()).await, Err(ApiError::Rejected(_))));
        assert!(sink.0.lock().unwrap().ends_with(&[TriggerReason::Lifecycle, TriggerReason::Lifecycle]));

        let missing = DeploymentId::new();
        assert!(matches!(api.trigger(missing).await, Err(ApiError::NotFound(_))));
    }

    #[tokio::test]
    async fn adoption_approval_requires_policy_and_target() {
        let (api, store, _) = api();
        let d = api.create_deployment(parse_yaml(SPEC).unwrap()).await.unwrap();
        let wl = ObjectRef::new(ObjectKind::Workload, "games", "gs");
        let svc = ObjectRef::new(ObjectKind::Service, "games", "gs");

        let id = api.approve_adoption(d.id, wl.clone(), "/spec/replicas").await.unwrap();
        assert_eq!(store.pending_approval(d.id, &wl, "/spec/replicas").unwrap(), Some(id));
        assert!(matches!(api.approve_adoption(d.id, wl.clone(), "/spec/template").await, Err(ApiError::Rejected(_))));
        assert!(matches!(api.approve_adoption(d.id, svc, "/spec/ports").await, Err(ApiError::Rejected(_))));
        let other = ObjectRef::new(ObjectKind::Workload, "games", "other");
        assert!(matches!(api.approve_adoption(d.id, other, "/spec/replicas").await, Err(ApiError::NotFound(_))));

        let events = api.events(d.id, 0, 50).await.unwrap();
        assert!(events.iter().any(|e| e.event_type == EventType::AdoptionApproved));
    }

    #[tokio::test]
    async fn follow_events_streams_new_appends() {
        let (api, store, _) = api();
        let d = api.create_deployment(parse_yaml(SPEC).unwrap()).await.unwrap();
        let mut h = api.follow_events(d.id, 0).await.unwrap();
        let first = tokio::time::timeout(Duration::from_secs(2), h.rx.recv()).await.unwrap().unwrap();
        assert_eq!(first.event_type, EventType::DeploymentCreated);

        store.append_event(&NewEvent::reconciler(d.id, EventType::ReconcileStarted, serde_json::json!({}))).unwrap();
        let next = tokio::time::timeout(Duration::from_secs(2), h.rx.recv()).await.unwrap().unwrap();
        assert_eq!(next.event_type, EventType::ReconcileStarted);
        assert!(next.seq > first.seq);
        h.cancel.cancel();
    }
}
