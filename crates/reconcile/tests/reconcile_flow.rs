#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use gantry_core::markers;
use gantry_ingest::Ingestor;
use gantry_core::prelude::*;
use gantry_kubehub::{DeleteOutcome, MemPlatform, Op, Platform, PlatformError};
use gantry_persist::{EnqueueOutcome, JobState, NewDeployment, SqliteStore, Store};
use gantry_reconcile::{FailureClass, ReconcileOutcome, Reconciler, Scheduler, SchedulerConfig, Settled, SkipReason};
use serde_json::json;

fn template(kind: ObjectKind, name: &str, body: serde_json::Value) -> ObjectTemplate {
    ObjectTemplate {
        kind,
        name: name.into(),
        namespace: None,
        labels: Default::default(),
        annotations: Default::default(),
        body: body.as_object().cloned().unwrap(),
    }
}

fn game_server(replicas: u32) -> DesiredSpec {
    DesiredSpec {
        objects: vec![
            template(ObjectKind::ConfigMap, "gs-config", json!({"data": {"map": "dust2"}})),
            template(ObjectKind::Workload, "gs", json!({"spec": {"replicas": replicas, "serviceName": "gs"}})),
        ],
    }
}

fn workload() -> ObjectRef { ObjectRef::new(ObjectKind::Workload, "games", "gs") }
fn config() -> ObjectRef { ObjectRef::new(ObjectKind::ConfigMap, "games", "gs-config") }

struct Harness {
    store: Arc<SqliteStore>,
    platform: MemPlatform,
    reconciler: Arc<Reconciler>,
    scheduler: Scheduler,
    id: DeploymentId,
}

fn test_config() -> SchedulerConfig {
    SchedulerConfig { holder: "test-worker".into(), poll_every: Duration::from_millis(20), ..SchedulerConfig::default() }
}

fn harness_with(platform: MemPlatform, wrap: impl FnOnce(MemPlatform, Arc<SqliteStore>) -> Arc<dyn Platform>) -> Harness {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let d = store
        .create_deployment(NewDeployment {
            template: TemplateRef { name: "game-server".into(), version: "1".into() },
            namespace: "games".into(),
            desired_spec: game_server(2),
            policy: DriftPolicy::default(),
        })
        .unwrap();
    let reconciler = Arc::new(Reconciler::new(store.clone(), wrap(platform.clone(), store.clone())));
    let scheduler = Scheduler::new(store.clone(), reconciler.clone(), test_config());
    Harness { store, platform, reconciler, scheduler, id: d.id }
}

fn harness() -> Harness { harness_with(MemPlatform::new(), |p, _| Arc::new(p)) }

impl Harness {
    fn deployment(&self) -> Deployment { self.store.get_deployment(self.id).unwrap().unwrap() }

    fn events(&self) -> Vec<EventType> {
        self.store.list_events(self.id, 0, 500).unwrap().into_iter().map(|e| e.event_type).collect()
    }

    async fn converge(&self) {
        let out = self.reconciler.reconcile(self.id).await.unwrap();
        assert!(matches!(out, ReconcileOutcome::Converged { status: StatusSummary::Healthy, .. }), "{out:?}");
    }
}

#[tokio::test]
async fn first_pass_creates_everything_and_second_is_quiet() {
    let h = harness();
    let (id, settled) = h.scheduler.run_once().await.unwrap().expect("create enqueued a job");
    assert_eq!(id, h.id);
    assert_eq!(settled, Settled::Completed(ReconcileOutcome::Converged { generation: Generation::FIRST, status: StatusSummary::Healthy }));

    assert_eq!(h.platform.mutations(), vec![(Op::Create, config()), (Op::Create, workload())]);
    let d = h.deployment();
    assert_eq!(d.last_applied_generation, Generation::FIRST);
    assert!(d.is_converged());
    assert_eq!(h.store.list_managed(h.id).unwrap().len(), 2);
    assert!(h.store.get_job(h.id).unwrap().is_none(), "job released");
    let snap = h.store.get_snapshot(h.id).unwrap().unwrap();
    assert!(snap.resources.contains_key("Workload/games/gs"));

    let ev = h.events();
    assert!(ev.contains(&EventType::ReconcileStarted));
    assert_eq!(ev.iter().filter(|t| **t == EventType::ResourceCreated).count(), 2);
    assert!(ev.contains(&EventType::ReconcileSucceeded));

    h.platform.clear_log();
    h.converge().await;
    assert!(h.platform.mutations().is_empty(), "converged deployment needs no mutations");
}

#[tokio::test]
async fn modified_field_is_enforced() {
    let h = harness();
    h.converge().await;
    h.platform.external_edit(&workload(), "/spec/replicas", json!(5)).unwrap();
    h.platform.clear_log();

    h.converge().await;
    assert_eq!(h.platform.mutations(), vec![(Op::Apply, workload())]);
    let live = h.platform.object(&workload()).unwrap();
    assert_eq!(live.raw.pointer("/spec/replicas"), Some(&json!(2)));
}

#[tokio::test]
async fn externally_deleted_object_is_recreated() {
    let h = harness();
    h.converge().await;
    let old = h.platform.external_delete(&workload()).unwrap();
    h.platform.clear_log();

    h.converge().await;
    assert_eq!(h.platform.mutations(), vec![(Op::Create, workload())]);
    let row = h.store.managed_by_identity(&workload()).unwrap().unwrap();
    assert_ne!(row.uid, old.uid);
    assert!(row.managed);
}

#[tokio::test]
async fn partial_apply_defers_then_resumes_where_it_stopped() {
    let h = harness();
    h.platform.fail_next(Op::Create, Some("gs"), PlatformError::Unavailable("apiserver restarting".into()));

    let (_, settled) = h.scheduler.run_once().await.unwrap().unwrap();
    let Settled::Deferred { attempt, error, .. } = settled else { panic!("expected deferral, got {settled:?}") };
    assert_eq!(attempt, 1);
    assert_eq!(error.class, FailureClass::Transient);
    assert_eq!(error.action, Some(json!({"action": "create", "object": "Workload/games/gs"})));

    assert!(h.platform.object(&config()).is_some(), "earlier actions stay applied");
    assert_eq!(h.store.list_managed(h.id).unwrap().len(), 1);
    let d = h.deployment();
    assert_eq!(d.status, StatusSummary::Progressing);
    assert_eq!(d.last_applied_generation, Generation::ZERO);
    let job = h.store.get_job(h.id).unwrap().unwrap();
    assert_eq!((job.state, job.attempts), (JobState::Queued, 1));
    assert!(job.next_run_at > chrono::Utc::now());
    let ev = h.events();
    assert!(ev.contains(&EventType::ReconcileFailed));
    assert!(ev.contains(&EventType::ReconcileDeferred));

    // backing off: nothing is due yet
    assert!(h.scheduler.run_once().await.unwrap().is_none());

    h.platform.clear_log();
    h.converge().await;
    assert_eq!(h.platform.mutations(), vec![(Op::Create, workload())]);
}

#[tokio::test]
async fn rejected_object_parks_the_job_until_an_urgent_trigger() {
    let h = harness();
    h.platform.fail_next(Op::Create, Some("gs-config"), PlatformError::Invalid("data too large".into()));

    let (_, settled) = h.scheduler.run_once().await.unwrap().unwrap();
    assert!(matches!(settled, Settled::Dead(ref e) if e.class == FailureClass::Fatal));
    assert_eq!(h.deployment().status, StatusSummary::Error);
    assert_eq!(h.store.get_job(h.id).unwrap().unwrap().state, JobState::Dead);

    let triggers = h.scheduler.triggers();
    triggers.trigger(h.id, TriggerReason::Drift);
    assert_eq!(h.store.get_job(h.id).unwrap().unwrap().state, JobState::Dead, "drift does not revive");
    assert!(h.scheduler.run_once().await.unwrap().is_none());

    triggers.trigger(h.id, TriggerReason::Manual);
    let (_, settled) = h.scheduler.run_once().await.unwrap().unwrap();
    assert!(matches!(settled, Settled::Completed(ReconcileOutcome::Converged { .. })));
    assert_eq!(h.deployment().status, StatusSummary::Healthy);
}

#[tokio::test]
async fn name_held_by_foreign_object_is_a_conflict() {
    let h = harness();
    h.platform.insert_foreign(workload(), json!({"spec": {"replicas": 1}}));

    let (_, settled) = h.scheduler.run_once().await.unwrap().unwrap();
    assert!(matches!(settled, Settled::Dead(ref e) if e.class == FailureClass::Conflict));
    assert!(h.events().contains(&EventType::ResourceConflict));
    let foreign = h.platform.object(&workload()).unwrap();
    assert!(foreign.ownership().is_none(), "foreign object left untouched");
}

#[tokio::test]
async fn one_job_runs_once_even_with_two_workers() {
    let h = harness();
    let (a, b) = tokio::join!(h.scheduler.run_once(), h.scheduler.run_once());
    let ran = [a.unwrap(), b.unwrap()].into_iter().flatten().count();
    assert_eq!(ran, 1);
    assert_eq!(h.platform.mutations().len(), 2);
}

#[tokio::test]
async fn job_leased_by_another_process_is_not_claimed() {
    let h = harness();
    let job = h.store.claim("other-host", chrono::Utc::now(), Duration::from_secs(300), &[]).unwrap().unwrap();
    assert_eq!(job.deployment_id, h.id);
    assert!(h.scheduler.run_once().await.unwrap().is_none());
    assert!(h.platform.mutations().is_empty());
}

#[tokio::test]
async fn unready_workload_reports_progressing_and_rechecks() {
    let h = harness_with(MemPlatform::without_auto_ready(), |p, _| Arc::new(p));
    let (_, settled) = h.scheduler.run_once().await.unwrap().unwrap();
    let Settled::Recheck { outcome, at } = settled else { panic!("expected recheck, got {settled:?}") };
    assert_eq!(outcome, ReconcileOutcome::Progressing { generation: Generation::FIRST });
    assert!(at > chrono::Utc::now());

    let d = h.deployment();
    assert_eq!((d.last_applied_generation, d.status), (Generation::FIRST, StatusSummary::Progressing));
    let job = h.store.get_job(h.id).unwrap().unwrap();
    assert_eq!(job.state, JobState::Queued);
}

#[tokio::test]
async fn paused_deployment_is_left_alone() {
    let h = harness();
    h.converge().await;
    h.store.set_lifecycle(h.id, LifecycleState::Paused).unwrap();
    h.platform.external_edit(&workload(), "/spec/replicas", json!(7)).unwrap();
    h.platform.clear_log();

    let out = h.reconciler.reconcile(h.id).await.unwrap();
    assert_eq!(out, ReconcileOutcome::Skipped(SkipReason::Paused));
    assert!(h.platform.mutations().is_empty());
    assert!(h.events().contains(&EventType::ReconcileSkipped));
}

#[tokio::test]
async fn pause_is_recorded_once_per_pause() {
    let h = harness();
    h.converge().await;
    let skipped = |h: &Harness| h.events().iter().filter(|t| **t == EventType::ReconcileSkipped).count();

    h.store.set_lifecycle(h.id, LifecycleState::Paused).unwrap();
    for _ in 0..5 {
        assert_eq!(h.reconciler.reconcile(h.id).await.unwrap(), ReconcileOutcome::Skipped(SkipReason::Paused));
    }
    assert_eq!(skipped(&h), 1, "periodic and drift triggers while paused add nothing");

    h.store.set_lifecycle(h.id, LifecycleState::Active).unwrap();
    h.converge().await;
    h.store.set_lifecycle(h.id, LifecycleState::Paused).unwrap();
    h.reconciler.reconcile(h.id).await.unwrap();
    h.reconciler.reconcile(h.id).await.unwrap();
    assert_eq!(skipped(&h), 2);
}

fn ready_status(live: &LiveObject) -> serde_json::Value {
    let generation = live.raw.pointer("/metadata/generation").cloned().unwrap_or(json!(1));
    json!({
        "replicas": 2,
        "readyReplicas": 2,
        "updatedReplicas": 2,
        "observedGeneration": generation,
        "currentRevision": "rev-1",
        "updateRevision": "rev-1",
    })
}

#[tokio::test]
async fn idle_rechecks_of_a_slow_rollout_record_nothing() {
    let h = harness_with(MemPlatform::without_auto_ready(), |p, _| Arc::new(p));
    let scheduler = Scheduler::new(h.store.clone(), h.reconciler.clone(), SchedulerConfig { progress_recheck: Duration::ZERO, ..test_config() });

    let (_, first) = scheduler.run_once().await.unwrap().unwrap();
    assert!(matches!(first, Settled::Recheck { .. }), "{first:?}");
    let recorded = h.events().len();
    h.platform.clear_log();

    for _ in 0..20 {
        let (_, settled) = scheduler.run_once().await.unwrap().expect("recheck is due at once");
        let Settled::Recheck { outcome, .. } = settled else { panic!("expected recheck, got {settled:?}") };
        assert_eq!(outcome, ReconcileOutcome::Progressing { generation: Generation::FIRST });
    }
    assert!(h.platform.mutations().is_empty());
    assert_eq!(h.events().len(), recorded, "no-op rechecks append no events");

    // the rollout finishing is a real transition
    let live = h.platform.object(&workload()).unwrap();
    h.platform.set_status(&workload(), ready_status(&live)).unwrap();
    let (_, settled) = scheduler.run_once().await.unwrap().unwrap();
    assert_eq!(settled, Settled::Completed(ReconcileOutcome::Converged { generation: Generation::FIRST, status: StatusSummary::Healthy }));
    let tail: Vec<EventType> = h.events().into_iter().skip(recorded).collect();
    assert_eq!(tail, vec![EventType::ReconcileStarted, EventType::ReconcileSucceeded]);
    assert_eq!(h.deployment().status, StatusSummary::Healthy);
}

#[tokio::test]
async fn converged_deployment_ticks_quietly() {
    let h = harness();
    h.converge().await;
    let recorded = h.events().len();
    for _ in 0..3 {
        assert_eq!(h.scheduler.tick().unwrap(), 1);
        let (_, settled) = h.scheduler.run_once().await.unwrap().unwrap();
        assert!(matches!(settled, Settled::Completed(ReconcileOutcome::Converged { status: StatusSummary::Healthy, .. })));
    }
    assert_eq!(h.events().len(), recorded);
}

#[tokio::test]
async fn successive_rechecks_back_off() {
    let h = harness_with(MemPlatform::without_auto_ready(), |p, _| Arc::new(p));
    let scheduler = Scheduler::new(h.store.clone(), h.reconciler.clone(), SchedulerConfig { progress_recheck: Duration::from_secs(1), ..test_config() });
    let triggers = scheduler.triggers();

    let mut gaps = Vec::new();
    for _ in 0..3 {
        let before = chrono::Utc::now();
        let (_, settled) = scheduler.run_once().await.unwrap().expect("job due");
        let Settled::Recheck { at, .. } = settled else { panic!("expected recheck, got {settled:?}") };
        gaps.push((at - before).num_milliseconds());
        // an urgent trigger makes the pending recheck due now
        triggers.trigger(h.id, TriggerReason::Manual);
    }
    for (gap, want) in gaps.iter().zip([1_000i64, 2_000, 4_000]) {
        assert!(*gap >= want && *gap < want + 500, "gaps {gaps:?}");
    }
}

#[tokio::test]
async fn name_reused_by_a_foreign_object_after_external_delete_is_a_conflict() {
    let h = harness();
    h.converge().await;
    let ours = h.platform.external_delete(&workload()).unwrap();
    let foreign = h.platform.insert_foreign(workload(), json!({"spec": {"replicas": 9}}));
    assert_ne!(foreign.uid, ours.uid);

    let ingestor = Ingestor::new(h.store.clone(), h.scheduler.triggers());
    let listed = h.platform.list_owned(ObjectKind::Workload).await.unwrap();
    let report = ingestor.resync(ObjectKind::Workload, &listed).unwrap();
    assert_eq!(report.missing, 1);
    ingestor.handle(&Notification { event: NotificationKind::Add, object: foreign.clone() }).unwrap();

    let (_, settled) = h.scheduler.run_once().await.unwrap().unwrap();
    assert!(matches!(settled, Settled::Dead(ref e) if e.class == FailureClass::Conflict), "{settled:?}");

    let ev = h.events();
    let pos = |t: EventType| ev.iter().position(|e| *e == t).unwrap_or_else(|| panic!("{t:?} missing from {ev:?}"));
    assert!(pos(EventType::ResourceDeletedExternally) < pos(EventType::UnmanagedObjectDetected));
    assert!(pos(EventType::UnmanagedObjectDetected) < pos(EventType::ResourceConflict));

    let live = h.platform.object(&workload()).unwrap();
    assert_eq!(live.uid, foreign.uid);
    assert!(live.ownership().is_none(), "foreign object left untouched");
    assert_eq!(live.raw.pointer("/spec/replicas"), Some(&json!(9)));
    let row = h.store.managed_by_identity(&workload()).unwrap().unwrap();
    assert_eq!(row.uid, ours.uid);
    assert!(!row.managed);
    assert_eq!(h.deployment().status, StatusSummary::Error);
}

#[tokio::test]
async fn teardown_removes_objects_and_archives() {
    let h = harness();
    h.converge().await;
    h.store.set_lifecycle(h.id, LifecycleState::Deleted).unwrap();

    let (_, settled) = h.scheduler.run_once().await.unwrap().unwrap();
    assert_eq!(settled, Settled::Completed(ReconcileOutcome::TornDown));
    assert!(h.platform.objects().is_empty());
    assert!(h.store.list_managed(h.id).unwrap().is_empty());
    let d = h.deployment();
    assert!(d.archived_at.is_some());
    assert!(h.events().contains(&EventType::TeardownCompleted));

    // archived: later triggers are dropped and passes are no-ops
    assert_eq!(h.store.enqueue(h.id, TriggerReason::Manual, chrono::Utc::now()).unwrap(), EnqueueOutcome::Ignored);
    assert_eq!(h.reconciler.reconcile(h.id).await.unwrap(), ReconcileOutcome::Skipped(SkipReason::Archived));
}

/// Writes a new generation the first time the reconciler lists, as an API
/// write landing between "read desired" and "apply" would.
struct RacingPlatform {
    inner: MemPlatform,
    store: Arc<SqliteStore>,
    fired: AtomicBool,
}

#[async_trait]
impl Platform for RacingPlatform {
    async fn get(&self, object: &ObjectRef) -> Result<Option<LiveObject>, PlatformError> { self.inner.get(object).await }
    async fn create(&self, manifest: &Manifest) -> Result<LiveObject, PlatformError> { self.inner.create(manifest).await }
    async fn apply(&self, manifest: &Manifest) -> Result<LiveObject, PlatformError> { self.inner.apply(manifest).await }
    async fn delete(&self, object: &ObjectRef, uid: &str) -> Result<DeleteOutcome, PlatformError> { self.inner.delete(object, uid).await }

    async fn list(&self, kind: ObjectKind, selector: &str) -> Result<Vec<LiveObject>, PlatformError> {
        if !self.fired.swap(true, Ordering::SeqCst) {
            let id = self.store.list_deployments(false).unwrap()[0].id;
            self.store.write_desired(id, Some(Generation::FIRST), game_server(4)).unwrap();
        }
        self.inner.list(kind, selector).await
    }

    fn watch(&self, kind: ObjectKind) -> BoxStream<'static, Result<WatchEvent, PlatformError>> { self.inner.watch(kind) }
}

#[tokio::test]
async fn generation_written_mid_pass_is_the_one_applied() {
    let h = harness_with(MemPlatform::new(), |inner, store| Arc::new(RacingPlatform { inner, store, fired: AtomicBool::new(false) }));
    let out = h.reconciler.reconcile(h.id).await.unwrap();
    assert_eq!(out, ReconcileOutcome::Converged { generation: Generation(2), status: StatusSummary::Healthy });

    assert_eq!(h.platform.mutations(), vec![(Op::Create, config()), (Op::Create, workload())]);
    let live = h.platform.object(&workload()).unwrap();
    assert_eq!(live.raw.pointer("/spec/replicas"), Some(&json!(4)));
    assert_eq!(markers::read_generation(&live.raw), Some(Generation(2)));
    assert_eq!(h.deployment().last_applied_generation, Generation(2));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scheduler_loop_converges_and_stops() {
    let h = harness();
    let scheduler = Arc::new(h.scheduler);
    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    let task = tokio::spawn(Arc::clone(&scheduler).run(stop_rx));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let d = h.store.get_deployment(h.id).unwrap().unwrap();
        if d.last_applied_generation == Generation::FIRST {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "scheduler never reconciled");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    h.store.write_desired(h.id, None, game_server(3)).unwrap();
    scheduler.wake();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while h.store.get_deployment(h.id).unwrap().unwrap().last_applied_generation != Generation(2) {
        assert!(tokio::time::Instant::now() < deadline, "new generation never applied");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(h.platform.object(&workload()).unwrap().raw.pointer("/spec/replicas"), Some(&json!(3)));

    stop_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(3), task).await.unwrap().unwrap();
}

/// Panics on every list, taking the worker that runs the pass down with it.
struct PanickingPlatform(MemPlatform);

#[async_trait]
impl Platform for PanickingPlatform {
    async fn get(&self, object: &ObjectRef) -> Result<Option<LiveObject>, PlatformError> { self.0.get(object).await }
    async fn create(&self, manifest: &Manifest) -> Result<LiveObject, PlatformError> { self.0.create(manifest).await }
    async fn apply(&self, manifest: &Manifest) -> Result<LiveObject, PlatformError> { self.0.apply(manifest).await }
    async fn delete(&self, object: &ObjectRef, uid: &str) -> Result<DeleteOutcome, PlatformError> { self.0.delete(object, uid).await }
    async fn list(&self, _kind: ObjectKind, _selector: &str) -> Result<Vec<LiveObject>, PlatformError> { panic!("list exploded") }
    fn watch(&self, kind: ObjectKind) -> BoxStream<'static, Result<WatchEvent, PlatformError>> { self.0.watch(kind) }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scheduler_stops_cleanly_after_a_worker_panics() {
    let h = harness_with(MemPlatform::new(), |p, _| Arc::new(PanickingPlatform(p)));
    let scheduler = Arc::new(Scheduler::new(h.store.clone(), h.reconciler.clone(), SchedulerConfig { workers: 1, ..test_config() }));
    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    let task = tokio::spawn(Arc::clone(&scheduler).run(stop_rx));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(h.platform.mutations().is_empty());
    stop_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(3), task).await.unwrap().expect("run reports the panic instead of propagating it");
}
