//! Worker pool over the store's job table.
//!
//! A deployment is reconciled by at most one worker at a time: the store lease
//! keeps other processes away and the in-flight set keeps this process from
//! reclaiming its own long-running job when the lease lapses.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use gantry_core::prelude::*;
use gantry_persist::{EnqueueOutcome, ReconcileJob, Store, StoreError};
use metrics::{counter, gauge};
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::json;
use tokio::sync::{watch, Notify, Semaphore};
use tracing::{debug, info, warn};

use crate::{backoff_delay, FailureClass, ReconcileError, ReconcileOutcome, Reconciler, SchedulerConfig};

/// What happened to a claimed job.
#[derive(Debug, Clone, PartialEq)]
pub enum Settled {
    Completed(ReconcileOutcome),
    /// Succeeded but asked to be looked at again at `at`.
    Recheck { outcome: ReconcileOutcome, at: DateTime<Utc> },
    Deferred { attempt: u32, at: DateTime<Utc>, error: ReconcileError },
    Dead(ReconcileError),
}

fn after(now: DateTime<Utc>, d: Duration) -> DateTime<Utc> { now + chrono::Duration::milliseconds(d.as_millis().min(i64::MAX as u128) as i64) }

/// [`TriggerSink`] that writes jobs to the store and wakes idle workers.
pub struct StoreTriggers {
    store: Arc<dyn Store>,
    wake: Arc<Notify>,
}

impl StoreTriggers {
    pub fn new(store: Arc<dyn Store>, wake: Arc<Notify>) -> Self { Self { store, wake } }
}

impl TriggerSink for StoreTriggers {
    fn trigger(&self, id: DeploymentId, reason: TriggerReason) {
        match self.store.enqueue(id, reason, Utc::now()) {
            Ok(EnqueueOutcome::Ignored) => debug!(deployment = %id, reason = %reason, "trigger ignored"),
            Ok(outcome) => {
                counter!("reconcile_triggers_total", 1u64, "reason" => reason.as_str());
                debug!(deployment = %id, reason = %reason, ?outcome, "trigger enqueued");
                self.wake.notify_one();
            }
            // the next periodic tick enqueues it again
            Err(e) => warn!(deployment = %id, reason = %reason, error = %e, "trigger lost"),
        }
    }
}

struct Inflight<'a> {
    set: &'a Mutex<FxHashSet<DeploymentId>>,
    id: DeploymentId,
}

impl Drop for Inflight<'_> {
    fn drop(&mut self) { self.set.lock().unwrap_or_else(PoisonError::into_inner).remove(&self.id); }
}

/// Lease renewal for one pass; stops with the pass, including on unwind.
struct Renewal(tokio::task::JoinHandle<()>);

impl Drop for Renewal {
    fn drop(&mut self) { self.0.abort(); }
}

pub struct Scheduler {
    store: Arc<dyn Store>,
    reconciler: Arc<Reconciler>,
    cfg: SchedulerConfig,
    permits: Arc<Semaphore>,
    inflight: Mutex<FxHashSet<DeploymentId>>,
    /// Consecutive rechecks per deployment that ended with the same outcome.
    rechecks: Mutex<FxHashMap<DeploymentId, (ReconcileOutcome, u32)>>,
    wake: Arc<Notify>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn Store>, reconciler: Arc<Reconciler>, cfg: SchedulerConfig) -> Self {
        let permits = Arc::new(Semaphore::new(cfg.max_concurrent.max(1)));
        Self {
            store,
            reconciler,
            cfg,
            permits,
            inflight: Mutex::new(FxHashSet::default()),
            rechecks: Mutex::new(FxHashMap::default()),
            wake: Arc::new(Notify::new()),
        }
    }

    /// Trigger sink for ingest and the API, sharing this scheduler's wakeup.
    pub fn triggers(&self) -> Arc<StoreTriggers> { Arc::new(StoreTriggers::new(Arc::clone(&self.store), Arc::clone(&self.wake))) }

    /// Wake one idle worker, e.g. after a write that enqueued inside its own transaction.
    pub fn wake(&self) { self.wake.notify_one() }

    pub fn config(&self) -> &SchedulerConfig { &self.cfg }

    /// Claim and run at most one due job. `Ok(None)` when nothing is due.
    pub async fn run_once(&self) -> Result<Option<(DeploymentId, Settled)>, StoreError> {
        let Ok(_permit) = Arc::clone(&self.permits).acquire_owned().await else {
            return Ok(None);
        };
        let job = {
            let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
            let skip: Vec<DeploymentId> = inflight.iter().copied().collect();
            let Some(job) = self.store.claim(&self.cfg.holder, Utc::now(), self.cfg.lease, &skip)? else {
                return Ok(None);
            };
            inflight.insert(job.deployment_id);
            gauge!("reconcile_inflight", inflight.len() as f64);
            job
        };
        let _guard = Inflight { set: &self.inflight, id: job.deployment_id };
        let id = job.deployment_id;
        debug!(deployment = %id, reason = %job.reason, attempts = job.attempts, "job claimed");

        let renew = self.spawn_renewal(id);
        let res = self.reconciler.reconcile(id).await;
        drop(renew);

        let settled = self.settle(&job, res)?;
        Ok(Some((id, settled)))
    }

    fn spawn_renewal(&self, id: DeploymentId) -> Renewal {
        let store = Arc::clone(&self.store);
        let holder = self.cfg.holder.clone();
        let every = (self.cfg.lease / 3).max(Duration::from_millis(100));
        Renewal(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match store.renew_lease(id, &holder, Utc::now()) {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(deployment = %id, "lease lost while reconciling");
                        return;
                    }
                    Err(e) => warn!(deployment = %id, error = %e, "lease renewal failed"),
                }
            }
        }))
    }

    fn settle(&self, job: &ReconcileJob, res: Result<ReconcileOutcome, ReconcileError>) -> Result<Settled, StoreError> {
        let id = job.deployment_id;
        let holder = self.cfg.holder.as_str();
        let now = Utc::now();
        let streak = self.recheck_streak(id, res.as_ref().ok().filter(|o| o.needs_recheck()));
        match res {
            Ok(outcome) if outcome.needs_recheck() => {
                // ingest triggers a pass as soon as health flips; these are only a fallback
                let at = after(now, backoff_delay(streak, self.cfg.progress_recheck, self.cfg.backoff_max.max(self.cfg.progress_recheck)));
                self.store.complete(id, holder, now, Some(at))?;
                Ok(Settled::Recheck { outcome, at })
            }
            Ok(outcome) => {
                self.store.complete(id, holder, now, None)?;
                Ok(Settled::Completed(outcome))
            }
            Err(error) if error.class == FailureClass::Transient => {
                let delay = backoff_delay(job.attempts, self.cfg.backoff_base, self.cfg.backoff_max);
                let at = after(now, delay);
                let attempt = job.attempts.saturating_add(1);
                self.store.defer(id, holder, now, at, &error.message)?;
                self.status_or_warn(id, StatusSummary::Progressing);
                self.store.append_event(&NewEvent::reconciler(
                    id,
                    EventType::ReconcileDeferred,
                    json!({"attempt": attempt, "next_run_at": at, "delay_ms": delay.as_millis() as u64, "error": error.message}),
                ))?;
                counter!("reconcile_deferred_total", 1u64);
                info!(deployment = %id, attempt, delay_ms = delay.as_millis() as u64, "reconcile deferred");
                Ok(Settled::Deferred { attempt, at, error })
            }
            Err(error) => {
                self.store.mark_dead(id, holder, now, &error.message)?;
                self.status_or_warn(id, StatusSummary::Error);
                counter!("reconcile_dead_total", 1u64, "class" => error.class.as_str());
                warn!(deployment = %id, class = %error.class, error = %error.message, "job parked until an urgent trigger");
                Ok(Settled::Dead(error))
            }
        }
    }

    /// Earlier consecutive rechecks with this same outcome; resets on any other result.
    fn recheck_streak(&self, id: DeploymentId, recheck: Option<&ReconcileOutcome>) -> u32 {
        let mut map = self.rechecks.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(outcome) = recheck else {
            map.remove(&id);
            return 0;
        };
        let entry = map.entry(id).or_insert((*outcome, 0));
        if entry.0 != *outcome {
            *entry = (*outcome, 0);
        }
        let streak = entry.1;
        entry.1 = entry.1.saturating_add(1);
        streak
    }

    fn status_or_warn(&self, id: DeploymentId, status: StatusSummary) {
        if let Err(e) = self.store.set_status(id, status) {
            warn!(deployment = %id, status = %status, error = %e, "status update failed");
        }
    }

    /// Enqueue a periodic pass for every live deployment.
    pub fn tick(&self) -> Result<usize, StoreError> {
        let now = Utc::now();
        let mut queued = 0;
        for d in self.store.list_deployments(false)? {
            if !matches!(self.store.enqueue(d.id, TriggerReason::Periodic, now)?, EnqueueOutcome::Ignored) {
                queued += 1;
            }
        }
        if queued > 0 {
            self.wake.notify_one();
        }
        Ok(queued)
    }

    /// Run workers and the periodic tick until `shutdown` flips to true.
    /// In-progress passes finish; nothing is cancelled mid-apply.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(workers = self.cfg.workers, max_concurrent = self.cfg.max_concurrent, holder = %self.cfg.holder, "scheduler start");
        let mut tasks = Vec::with_capacity(self.cfg.workers + 1);
        for worker in 0..self.cfg.workers.max(1) {
            let me = Arc::clone(&self);
            let mut stop = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    if *stop.borrow() {
                        break;
                    }
                    match me.run_once().await {
                        Ok(Some(_)) => continue,
                        Ok(None) => {}
                        Err(e) => warn!(worker, error = %e, "claim failed"),
                    }
                    tokio::select! {
                        _ = me.wake.notified() => {}
                        _ = tokio::time::sleep(me.cfg.poll_every) => {}
                        res = stop.changed() => {
                            if res.is_err() { break; }
                        }
                    }
                }
                debug!(worker, "worker stopped");
            }));
        }
        {
            let me = Arc::clone(&self);
            let mut stop = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                // first tick fires at once: every deployment gets a pass after startup
                let mut ticker = tokio::time::interval(me.cfg.requeue_every);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            match me.tick() {
                                Ok(n) => debug!(queued = n, "periodic requeue"),
                                Err(e) => warn!(error = %e, "periodic requeue failed"),
                            }
                        }
                        res = stop.changed() => {
                            if res.is_err() || *stop.borrow() { break; }
                        }
                    }
                }
            }));
        }
        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }
        self.wake.notify_waiters();
        for t in tasks {
            match t.await {
                Ok(()) => {}
                Err(e) if e.is_panic() => {
                    counter!("reconcile_worker_panics_total", 1u64);
                    warn!(error = %e, "scheduler task panicked");
                }
                Err(e) => debug!(error = %e, "scheduler task cancelled"),
            }
        }
        info!("scheduler stopped");
    }
}
