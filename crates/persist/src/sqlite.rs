use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};
use gantry_core::fields;
use gantry_core::prelude::*;
use metrics::{counter, histogram};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::{schema, EnqueueOutcome, JobState, NewDeployment, ReconcileJob, Result, Store, StoreError};

/// SQLite-backed store. One connection behind a mutex; every call is a short transaction.
pub struct SqliteStore {
    db: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open_default() -> Result<Self> { Self::open(&crate::default_db_path()) }

    pub fn open(path: &str) -> Result<Self> {
        let started = Instant::now();
        if let Some(dir) = std::path::Path::new(path).parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|e| StoreError::Unavailable(format!("creating {}: {e}", dir.display())))?;
        }
        let db = Connection::open(path)?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.busy_timeout(Duration::from_secs(5))?;
        info!(path = %path, "opened state store");
        Self::init(db, started)
    }

    pub fn open_in_memory() -> Result<Self> { Self::init(Connection::open_in_memory()?, Instant::now()) }

    fn init(db: Connection, started: Instant) -> Result<Self> {
        db.pragma_update(None, "foreign_keys", "ON")?;
        for ddl in schema::DDL {
            db.execute(ddl, [])?;
        }
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(Self { db: Mutex::new(db) })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db.lock().map_err(|_| StoreError::Unavailable("connection mutex poisoned".into()))
    }
}

fn ms(t: DateTime<Utc>) -> i64 { t.timestamp_millis() }

fn from_ms(v: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(v).single().ok_or_else(|| StoreError::Corrupt(format!("timestamp {v}")))
}

fn parse<T>(s: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    s.parse().map_err(|e: T::Err| StoreError::Corrupt(e.to_string()))
}

fn gen_col(g: Generation) -> i64 { g.get() as i64 }

// ---- deployments ----

const DEPLOYMENT_COLS: &str = "id, template_name, template_version, namespace, desired_spec, policy, \
    generation, last_applied_generation, lifecycle, status, created_at, updated_at, archived_at";

struct RawDeployment {
    id: String,
    template_name: String,
    template_version: String,
    namespace: String,
    desired_spec: String,
    policy: String,
    generation: i64,
    last_applied_generation: i64,
    lifecycle: String,
    status: String,
    created_at: i64,
    updated_at: i64,
    archived_at: Option<i64>,
}

fn raw_deployment(row: &Row<'_>) -> rusqlite::Result<RawDeployment> {
    Ok(RawDeployment {
        id: row.get(0)?,
        template_name: row.get(1)?,
        template_version: row.get(2)?,
        namespace: row.get(3)?,
        desired_spec: row.get(4)?,
        policy: row.get(5)?,
        generation: row.get(6)?,
        last_applied_generation: row.get(7)?,
        lifecycle: row.get(8)?,
        status: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
        archived_at: row.get(12)?,
    })
}

impl RawDeployment {
    fn decode(self) -> Result<Deployment> {
        Ok(Deployment {
            id: parse(&self.id)?,
            template: TemplateRef { name: self.template_name, version: self.template_version },
            namespace: self.namespace,
            desired_spec: serde_json::from_str(&self.desired_spec)?,
            policy: serde_json::from_str(&self.policy)?,
            generation: Generation(self.generation as u64),
            last_applied_generation: Generation(self.last_applied_generation as u64),
            lifecycle: parse(&self.lifecycle)?,
            status: parse(&self.status)?,
            created_at: from_ms(self.created_at)?,
            updated_at: from_ms(self.updated_at)?,
            archived_at: self.archived_at.map(from_ms).transpose()?,
        })
    }
}

fn load_deployment(conn: &Connection, id: DeploymentId) -> Result<Option<Deployment>> {
    conn.query_row(
        &format!("SELECT {DEPLOYMENT_COLS} FROM deployments WHERE id = ?1"),
        [id.to_string()],
        raw_deployment,
    )
    .optional()?
    .map(RawDeployment::decode)
    .transpose()
}

fn require_deployment(conn: &Connection, id: DeploymentId) -> Result<Deployment> {
    load_deployment(conn, id)?.ok_or_else(|| StoreError::NotFound(format!("deployment {id}")))
}

fn require_writable(d: &Deployment) -> Result<()> {
    if d.archived_at.is_some() || d.lifecycle == LifecycleState::Deleted {
        return Err(StoreError::Rejected(format!("deployment {} is deleted", d.id)));
    }
    Ok(())
}

/// Write `spec` as generation `cur + 1` with its revision row. Caller owns the transaction.
fn bump_desired(conn: &Connection, cur: &Deployment, spec: &DesiredSpec, now: DateTime<Utc>) -> Result<Generation> {
    let next = cur.generation.next();
    let body = serde_json::to_string(spec)?;
    let n = conn.execute(
        "UPDATE deployments SET desired_spec = ?2, generation = ?3, updated_at = ?4 WHERE id = ?1 AND generation = ?5",
        params![cur.id.to_string(), body, gen_col(next), ms(now), gen_col(cur.generation)],
    )?;
    if n != 1 {
        let actual = require_deployment(conn, cur.id)?.generation;
        return Err(StoreError::Conflict { expected: cur.generation, actual });
    }
    conn.execute(
        "INSERT INTO deployment_revisions(deployment_id, generation, desired_spec, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![cur.id.to_string(), gen_col(next), body, ms(now)],
    )?;
    Ok(next)
}

// ---- events ----

fn append_event_in(conn: &Connection, ev: &NewEvent, now: DateTime<Utc>) -> Result<i64> {
    conn.execute(
        "INSERT INTO events(deployment_id, source, event_type, payload, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            ev.deployment_id.to_string(),
            ev.source.as_str(),
            ev.event_type.as_str(),
            serde_json::to_string(&ev.payload)?,
            ms(now)
        ],
    )?;
    counter!("persist_events_total", 1u64);
    Ok(conn.last_insert_rowid())
}

// ---- jobs ----

const JOB_COLS: &str = "id, deployment_id, reason, state, attempts, next_run_at, lock_holder, locked_at, rerun, last_error";

struct RawJob {
    id: i64,
    deployment_id: String,
    reason: String,
    state: String,
    attempts: i64,
    next_run_at: i64,
    lock_holder: Option<String>,
    locked_at: Option<i64>,
    rerun: Option<String>,
    last_error: Option<String>,
}

fn raw_job(row: &Row<'_>) -> rusqlite::Result<RawJob> {
    Ok(RawJob {
        id: row.get(0)?,
        deployment_id: row.get(1)?,
        reason: row.get(2)?,
        state: row.get(3)?,
        attempts: row.get(4)?,
        next_run_at: row.get(5)?,
        lock_holder: row.get(6)?,
        locked_at: row.get(7)?,
        rerun: row.get(8)?,
        last_error: row.get(9)?,
    })
}

impl RawJob {
    fn decode(self) -> Result<ReconcileJob> {
        Ok(ReconcileJob {
            id: self.id,
            deployment_id: parse(&self.deployment_id)?,
            reason: parse(&self.reason)?,
            state: JobState::parse(&self.state)?,
            attempts: self.attempts.max(0) as u32,
            next_run_at: from_ms(self.next_run_at)?,
            lock_holder: self.lock_holder,
            locked_at: self.locked_at.map(from_ms).transpose()?,
            rerun: self.rerun.as_deref().map(parse).transpose()?,
            last_error: self.last_error,
        })
    }
}

fn load_job(conn: &Connection, id: DeploymentId) -> Result<Option<ReconcileJob>> {
    conn.query_row(
        &format!("SELECT {JOB_COLS} FROM reconcile_jobs WHERE deployment_id = ?1"),
        [id.to_string()],
        raw_job,
    )
    .optional()?
    .map(RawJob::decode)
    .transpose()
}

/// The job if `holder` still holds its lease.
fn held_job(conn: &Connection, id: DeploymentId, holder: &str) -> Result<Option<ReconcileJob>> {
    Ok(load_job(conn, id)?.filter(|j| j.state == JobState::Running && j.lock_holder.as_deref() == Some(holder)))
}

fn requeue_now(conn: &Connection, id: DeploymentId, reason: TriggerReason, at: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "UPDATE reconcile_jobs SET state = 'queued', reason = ?2, attempts = 0, next_run_at = ?3,
             lock_holder = NULL, locked_at = NULL, rerun = NULL, last_error = NULL
         WHERE deployment_id = ?1",
        params![id.to_string(), reason.as_str(), ms(at)],
    )?;
    Ok(())
}

fn enqueue_in(conn: &Connection, id: DeploymentId, reason: TriggerReason, run_at: DateTime<Utc>) -> Result<EnqueueOutcome> {
    let archived: Option<Option<i64>> = conn
        .query_row("SELECT archived_at FROM deployments WHERE id = ?1", [id.to_string()], |r| r.get(0))
        .optional()?;
    match archived {
        None => return Err(StoreError::NotFound(format!("deployment {id}"))),
        Some(Some(_)) => return Ok(EnqueueOutcome::Ignored),
        Some(None) => {}
    }
    let urgent = reason.bypasses_backoff();
    let Some(job) = load_job(conn, id)? else {
        conn.execute(
            "INSERT INTO reconcile_jobs(deployment_id, reason, state, attempts, next_run_at) VALUES (?1, ?2, 'queued', 0, ?3)",
            params![id.to_string(), reason.as_str(), ms(run_at)],
        )?;
        return Ok(EnqueueOutcome::Queued);
    };
    match job.state {
        JobState::Queued => {
            // a job backing off keeps its schedule unless the trigger is urgent
            if urgent || job.attempts == 0 {
                let attempts = if urgent { 0 } else { job.attempts };
                let reason = if urgent { reason } else { job.reason };
                conn.execute(
                    "UPDATE reconcile_jobs SET next_run_at = ?2, attempts = ?3, reason = ?4 WHERE deployment_id = ?1",
                    params![id.to_string(), ms(job.next_run_at.min(run_at)), attempts as i64, reason.as_str()],
                )?;
            }
            Ok(EnqueueOutcome::Coalesced)
        }
        JobState::Running => {
            let keep = match job.rerun {
                Some(prev) if prev.bypasses_backoff() => prev,
                _ => reason,
            };
            conn.execute(
                "UPDATE reconcile_jobs SET rerun = ?2 WHERE deployment_id = ?1",
                params![id.to_string(), keep.as_str()],
            )?;
            Ok(EnqueueOutcome::RerunScheduled)
        }
        JobState::Dead if urgent => {
            requeue_now(conn, id, reason, run_at)?;
            info!(deployment = %id, reason = %reason, "revived dead reconcile job");
            Ok(EnqueueOutcome::Revived)
        }
        JobState::Dead => Ok(EnqueueOutcome::Ignored),
    }
}

// ---- managed resources ----

const MANAGED_COLS: &str = "deployment_id, kind, namespace, name, uid, last_seen_at, managed";

fn raw_managed(row: &Row<'_>) -> rusqlite::Result<(String, String, String, String, String, i64, bool)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?, row.get(6)?))
}

fn decode_managed(raw: (String, String, String, String, String, i64, bool)) -> Result<ManagedResource> {
    let (deployment_id, kind, namespace, name, uid, last_seen_at, managed) = raw;
    Ok(ManagedResource {
        deployment_id: parse(&deployment_id)?,
        object: ObjectRef::new(parse::<ObjectKind>(&kind)?, namespace, name),
        uid,
        last_seen_at: from_ms(last_seen_at)?,
        managed,
    })
}

fn query_managed(conn: &Connection, where_clause: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<ManagedResource>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {MANAGED_COLS} FROM managed_resources WHERE {where_clause} ORDER BY kind, namespace, name"
    ))?;
    let rows = stmt.query_map(args, raw_managed)?.collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(decode_managed).collect()
}

impl Store for SqliteStore {
    fn create_deployment(&self, new: NewDeployment) -> Result<Deployment> {
        let started = Instant::now();
        let id = DeploymentId::new();
        let now = Utc::now();
        let mut db = self.conn()?;
        let tx = db.transaction()?;
        let spec = serde_json::to_string(&new.desired_spec)?;
        tx.execute(
            &format!("INSERT INTO deployments({DEPLOYMENT_COLS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?9, ?10, ?10, NULL)"),
            params![
                id.to_string(),
                new.template.name,
                new.template.version,
                new.namespace,
                spec,
                serde_json::to_string(&new.policy)?,
                gen_col(Generation::FIRST),
                LifecycleState::Active.as_str(),
                StatusSummary::Progressing.as_str(),
                ms(now)
            ],
        )?;
        tx.execute(
            "INSERT INTO deployment_revisions(deployment_id, generation, desired_spec, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![id.to_string(), gen_col(Generation::FIRST), spec, ms(now)],
        )?;
        append_event_in(
            &tx,
            &NewEvent::new(
                id,
                EventSource::User,
                EventType::DeploymentCreated,
                json!({"template": new.template, "namespace": new.namespace, "generation": Generation::FIRST}),
            ),
            now,
        )?;
        enqueue_in(&tx, id, TriggerReason::DesiredChanged, now)?;
        let out = require_deployment(&tx, id)?;
        tx.commit()?;
        histogram!("persist_create_deployment_ms", started.elapsed().as_secs_f64() * 1000.0);
        info!(deployment = %id, template = %out.template.name, "deployment created");
        Ok(out)
    }

    fn write_desired(&self, id: DeploymentId, expected: Option<Generation>, spec: DesiredSpec) -> Result<Deployment> {
        let started = Instant::now();
        let now = Utc::now();
        let mut db = self.conn()?;
        let tx = db.transaction()?;
        let cur = require_deployment(&tx, id)?;
        require_writable(&cur)?;
        if let Some(expected) = expected {
            if expected != cur.generation {
                return Err(StoreError::Conflict { expected, actual: cur.generation });
            }
        }
        let next = bump_desired(&tx, &cur, &spec, now)?;
        append_event_in(
            &tx,
            &NewEvent::new(id, EventSource::User, EventType::DesiredStateChanged, json!({"from": cur.generation, "to": next})),
            now,
        )?;
        enqueue_in(&tx, id, TriggerReason::DesiredChanged, now)?;
        let out = require_deployment(&tx, id)?;
        tx.commit()?;
        histogram!("persist_write_desired_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(deployment = %id, generation = %next, "desired state written");
        Ok(out)
    }

    fn set_lifecycle(&self, id: DeploymentId, state: LifecycleState) -> Result<Deployment> {
        let now = Utc::now();
        let mut db = self.conn()?;
        let tx = db.transaction()?;
        let cur = require_deployment(&tx, id)?;
        if cur.archived_at.is_some() {
            return Err(StoreError::Rejected(format!("deployment {id} is archived")));
        }
        if cur.lifecycle == LifecycleState::Deleted && state != LifecycleState::Deleted {
            return Err(StoreError::Rejected(format!("deployment {id} is being deleted")));
        }
        if cur.lifecycle != state {
            tx.execute(
                "UPDATE deployments SET lifecycle = ?2, updated_at = ?3 WHERE id = ?1",
                params![id.to_string(), state.as_str(), ms(now)],
            )?;
            append_event_in(
                &tx,
                &NewEvent::new(id, EventSource::User, EventType::LifecycleChanged, json!({"from": cur.lifecycle, "to": state})),
                now,
            )?;
        }
        enqueue_in(&tx, id, TriggerReason::Lifecycle, now)?;
        let out = require_deployment(&tx, id)?;
        tx.commit()?;
        Ok(out)
    }

    fn mark_applied(&self, id: DeploymentId, generation: Generation, status: StatusSummary) -> Result<bool> {
        let db = self.conn()?;
        let n = db.execute(
            "UPDATE deployments SET last_applied_generation = ?2, status = ?3, updated_at = ?4
             WHERE id = ?1 AND generation = ?2 AND last_applied_generation <= ?2",
            params![id.to_string(), gen_col(generation), status.as_str(), ms(Utc::now())],
        )?;
        Ok(n == 1)
    }

    fn set_status(&self, id: DeploymentId, status: StatusSummary) -> Result<()> {
        let db = self.conn()?;
        let n = db.execute(
            "UPDATE deployments SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![id.to_string(), status.as_str(), ms(Utc::now())],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound(format!("deployment {id}")));
        }
        Ok(())
    }

    fn archive_deployment(&self, id: DeploymentId) -> Result<()> {
        let now = Utc::now();
        let mut db = self.conn()?;
        let tx = db.transaction()?;
        let cur = require_deployment(&tx, id)?;
        if cur.archived_at.is_some() {
            return Ok(());
        }
        let purged = tx.execute("DELETE FROM managed_resources WHERE deployment_id = ?1", [id.to_string()])?;
        tx.execute("DELETE FROM observed_snapshots WHERE deployment_id = ?1", [id.to_string()])?;
        tx.execute(
            "UPDATE deployments SET archived_at = ?2, updated_at = ?2 WHERE id = ?1",
            params![id.to_string(), ms(now)],
        )?;
        append_event_in(
            &tx,
            &NewEvent::reconciler(id, EventType::TeardownCompleted, json!({"generation": cur.generation})),
            now,
        )?;
        tx.commit()?;
        info!(deployment = %id, purged_rows = purged, "deployment archived");
        Ok(())
    }

    fn get_deployment(&self, id: DeploymentId) -> Result<Option<Deployment>> {
        let db = self.conn()?;
        load_deployment(&db, id)
    }

    fn list_deployments(&self, include_archived: bool) -> Result<Vec<Deployment>> {
        let db = self.conn()?;
        let filter = if include_archived { "" } else { "WHERE archived_at IS NULL" };
        let mut stmt = db.prepare(&format!("SELECT {DEPLOYMENT_COLS} FROM deployments {filter} ORDER BY created_at, id"))?;
        let rows = stmt.query_map([], raw_deployment)?.collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(RawDeployment::decode).collect()
    }

    fn revision(&self, id: DeploymentId, generation: Generation) -> Result<Option<DesiredSpec>> {
        let db = self.conn()?;
        let body: Option<String> = db
            .query_row(
                "SELECT desired_spec FROM deployment_revisions WHERE deployment_id = ?1 AND generation = ?2",
                params![id.to_string(), gen_col(generation)],
                |r| r.get(0),
            )
            .optional()?;
        Ok(body.map(|b| serde_json::from_str(&b)).transpose()?)
    }

    fn adopt_drift(
        &self,
        id: DeploymentId,
        expected: Generation,
        spec: DesiredSpec,
        approvals: &[i64],
        payload: serde_json::Value,
    ) -> Result<Deployment> {
        let now = Utc::now();
        let mut db = self.conn()?;
        let tx = db.transaction()?;
        let cur = require_deployment(&tx, id)?;
        require_writable(&cur)?;
        if expected != cur.generation {
            return Err(StoreError::Conflict { expected, actual: cur.generation });
        }
        for approval in approvals.iter().copied() {
            let n = tx.execute(
                "UPDATE adoption_approvals SET consumed_at = ?3 WHERE id = ?1 AND deployment_id = ?2 AND consumed_at IS NULL",
                params![approval, id.to_string(), ms(now)],
            )?;
            if n != 1 {
                return Err(StoreError::Rejected(format!("approval {approval} is not pending")));
            }
        }
        let next = bump_desired(&tx, &cur, &spec, now)?;
        let mut payload = payload;
        if let Some(obj) = payload.as_object_mut() {
            obj.insert("from".into(), json!(cur.generation));
            obj.insert("to".into(), json!(next));
            if !approvals.is_empty() {
                obj.insert("approvals".into(), json!(approvals));
            }
        }
        append_event_in(&tx, &NewEvent::new(id, EventSource::System, EventType::DriftAdopted, payload), now)?;
        enqueue_in(&tx, id, TriggerReason::DesiredChanged, now)?;
        let out = require_deployment(&tx, id)?;
        tx.commit()?;
        counter!("persist_drift_adopted_total", 1u64);
        Ok(out)
    }

    fn upsert_managed(&self, row: &ManagedResource) -> Result<bool> {
        let db = self.conn()?;
        let n = db.execute(
            "INSERT INTO managed_resources(deployment_id, kind, namespace, name, uid, last_seen_at, managed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(kind, namespace, name) DO UPDATE SET
                 uid = excluded.uid, last_seen_at = excluded.last_seen_at, managed = excluded.managed
             WHERE managed_resources.deployment_id = excluded.deployment_id",
            params![
                row.deployment_id.to_string(),
                row.object.kind.as_str(),
                row.object.namespace,
                row.object.name,
                row.uid,
                ms(row.last_seen_at),
                row.managed
            ],
        )?;
        if n == 0 {
            warn!(object = %row.object, deployment = %row.deployment_id, "identity already recorded for another deployment");
        }
        Ok(n == 1)
    }

    fn managed_by_identity(&self, object: &ObjectRef) -> Result<Option<ManagedResource>> {
        let db = self.conn()?;
        let kind = object.kind.as_str();
        Ok(query_managed(&db, "kind = ?1 AND namespace = ?2 AND name = ?3", &[&kind, &object.namespace, &object.name])?
            .into_iter()
            .next())
    }

    fn list_managed(&self, id: DeploymentId) -> Result<Vec<ManagedResource>> {
        let db = self.conn()?;
        query_managed(&db, "deployment_id = ?1", &[&id.to_string()])
    }

    fn list_managed_kind(&self, kind: ObjectKind) -> Result<Vec<ManagedResource>> {
        let db = self.conn()?;
        query_managed(&db, "kind = ?1", &[&kind.as_str()])
    }

    fn delete_managed(&self, object: &ObjectRef, uid: &str) -> Result<bool> {
        let db = self.conn()?;
        let n = db.execute(
            "DELETE FROM managed_resources WHERE kind = ?1 AND namespace = ?2 AND name = ?3 AND uid = ?4",
            params![object.kind.as_str(), object.namespace, object.name, uid],
        )?;
        Ok(n == 1)
    }

    fn put_snapshot(&self, snapshot: &ObservedSnapshot) -> Result<()> {
        let started = Instant::now();
        let db = self.conn()?;
        db.execute(
            "INSERT INTO observed_snapshots(deployment_id, resources, observed_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(deployment_id) DO UPDATE SET resources = excluded.resources, observed_at = excluded.observed_at",
            params![
                snapshot.deployment_id.to_string(),
                serde_json::to_string(&snapshot.resources)?,
                ms(snapshot.observed_at)
            ],
        )?;
        histogram!("persist_put_snapshot_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(())
    }

    fn get_snapshot(&self, id: DeploymentId) -> Result<Option<ObservedSnapshot>> {
        let db = self.conn()?;
        let row: Option<(String, i64)> = db
            .query_row(
                "SELECT resources, observed_at FROM observed_snapshots WHERE deployment_id = ?1",
                [id.to_string()],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        row.map(|(resources, at)| {
            Ok(ObservedSnapshot { deployment_id: id, resources: serde_json::from_str(&resources)?, observed_at: from_ms(at)? })
        })
        .transpose()
    }

    fn append_event(&self, event: &NewEvent) -> Result<i64> {
        let db = self.conn()?;
        append_event_in(&db, event, Utc::now())
    }

    fn list_events(&self, id: DeploymentId, after_seq: i64, limit: usize) -> Result<Vec<Event>> {
        let db = self.conn()?;
        let mut stmt = db.prepare(
            "SELECT seq, source, event_type, payload, created_at FROM events
             WHERE deployment_id = ?1 AND seq > ?2 ORDER BY seq LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![id.to_string(), after_seq, limit as i64], |r| {
                Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?, r.get::<_, String>(2)?, r.get::<_, String>(3)?, r.get::<_, i64>(4)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter()
            .map(|(seq, source, event_type, payload, at)| {
                Ok(Event {
                    seq,
                    deployment_id: id,
                    source: parse(&source)?,
                    event_type: parse(&event_type)?,
                    payload: serde_json::from_str(&payload)?,
                    created_at: from_ms(at)?,
                })
            })
            .collect()
    }

    fn enqueue(&self, id: DeploymentId, reason: TriggerReason, run_at: DateTime<Utc>) -> Result<EnqueueOutcome> {
        let mut db = self.conn()?;
        let tx = db.transaction()?;
        let out = enqueue_in(&tx, id, reason, run_at)?;
        tx.commit()?;
        counter!("persist_enqueue_total", 1u64);
        Ok(out)
    }

    fn claim(&self, holder: &str, now: DateTime<Utc>, lease: Duration, skip: &[DeploymentId]) -> Result<Option<ReconcileJob>> {
        let started = Instant::now();
        let now_ms = ms(now);
        let expired_before = now_ms.saturating_sub(lease.as_millis() as i64);
        let mut db = self.conn()?;
        let tx = db.transaction()?;
        let candidates: Vec<(String, String)> = {
            let mut stmt = tx.prepare(
                "SELECT deployment_id, state FROM reconcile_jobs
                 WHERE (state = 'queued' AND next_run_at <= ?1) OR (state = 'running' AND locked_at <= ?2)
                 ORDER BY next_run_at, id",
            )?;
            let rows = stmt.query_map(params![now_ms, expired_before], |r| Ok((r.get(0)?, r.get(1)?)))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        let skip: Vec<String> = skip.iter().map(|d| d.to_string()).collect();
        let Some((dep, state)) = candidates.into_iter().find(|(d, _)| !skip.contains(d)) else {
            return Ok(None);
        };
        if state == JobState::Running.as_str() {
            warn!(deployment = %dep, holder = %holder, "reclaiming job with expired lease");
            counter!("persist_lease_expired_total", 1u64);
        }
        tx.execute(
            "UPDATE reconcile_jobs SET state = 'running', lock_holder = ?2, locked_at = ?3 WHERE deployment_id = ?1",
            params![dep, holder, now_ms],
        )?;
        let job = tx
            .query_row(&format!("SELECT {JOB_COLS} FROM reconcile_jobs WHERE deployment_id = ?1"), [&dep], raw_job)?
            .decode()?;
        tx.commit()?;
        histogram!("persist_claim_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(Some(job))
    }

    fn renew_lease(&self, id: DeploymentId, holder: &str, now: DateTime<Utc>) -> Result<bool> {
        let db = self.conn()?;
        let n = db.execute(
            "UPDATE reconcile_jobs SET locked_at = ?3 WHERE deployment_id = ?1 AND lock_holder = ?2 AND state = 'running'",
            params![id.to_string(), holder, ms(now)],
        )?;
        Ok(n == 1)
    }

    fn complete(&self, id: DeploymentId, holder: &str, now: DateTime<Utc>, recheck_at: Option<DateTime<Utc>>) -> Result<bool> {
        let mut db = self.conn()?;
        let tx = db.transaction()?;
        let Some(job) = held_job(&tx, id, holder)? else { return Ok(false) };
        match (job.rerun, recheck_at) {
            (Some(reason), _) => requeue_now(&tx, id, reason, now)?,
            (None, Some(at)) => requeue_now(&tx, id, job.reason, at)?,
            (None, None) => {
                tx.execute("DELETE FROM reconcile_jobs WHERE deployment_id = ?1", [id.to_string()])?;
            }
        }
        tx.commit()?;
        Ok(true)
    }

    fn defer(&self, id: DeploymentId, holder: &str, now: DateTime<Utc>, next_run_at: DateTime<Utc>, error: &str) -> Result<bool> {
        let mut db = self.conn()?;
        let tx = db.transaction()?;
        let Some(job) = held_job(&tx, id, holder)? else { return Ok(false) };
        match job.rerun {
            Some(reason) if reason.bypasses_backoff() => requeue_now(&tx, id, reason, now)?,
            _ => {
                tx.execute(
                    "UPDATE reconcile_jobs SET state = 'queued', attempts = ?2, next_run_at = ?3,
                         lock_holder = NULL, locked_at = NULL, rerun = NULL, last_error = ?4
                     WHERE deployment_id = ?1",
                    params![id.to_string(), job.attempts as i64 + 1, ms(next_run_at), error],
                )?;
            }
        }
        tx.commit()?;
        Ok(true)
    }

    fn mark_dead(&self, id: DeploymentId, holder: &str, now: DateTime<Utc>, error: &str) -> Result<bool> {
        let mut db = self.conn()?;
        let tx = db.transaction()?;
        let Some(job) = held_job(&tx, id, holder)? else { return Ok(false) };
        match job.rerun {
            Some(reason) if reason.bypasses_backoff() => requeue_now(&tx, id, reason, now)?,
            _ => {
                tx.execute(
                    "UPDATE reconcile_jobs SET state = 'dead', attempts = ?2,
                         lock_holder = NULL, locked_at = NULL, rerun = NULL, last_error = ?3
                     WHERE deployment_id = ?1",
                    params![id.to_string(), job.attempts as i64 + 1, error],
                )?;
                counter!("persist_jobs_dead_total", 1u64);
            }
        }
        tx.commit()?;
        Ok(true)
    }

    fn get_job(&self, id: DeploymentId) -> Result<Option<ReconcileJob>> {
        let db = self.conn()?;
        load_job(&db, id)
    }

    fn list_jobs(&self) -> Result<Vec<ReconcileJob>> {
        let db = self.conn()?;
        let mut stmt = db.prepare(&format!("SELECT {JOB_COLS} FROM reconcile_jobs ORDER BY next_run_at, id"))?;
        let rows = stmt.query_map([], raw_job)?.collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(RawJob::decode).collect()
    }

    fn approve_adoption(&self, id: DeploymentId, object: &ObjectRef, path: &str) -> Result<i64> {
        let now = Utc::now();
        let mut db = self.conn()?;
        let tx = db.transaction()?;
        require_writable(&require_deployment(&tx, id)?)?;
        tx.execute(
            "INSERT INTO adoption_approvals(deployment_id, kind, namespace, name, path, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![id.to_string(), object.kind.as_str(), object.namespace, object.name, path, ms(now)],
        )?;
        let approval = tx.last_insert_rowid();
        append_event_in(
            &tx,
            &NewEvent::new(
                id,
                EventSource::User,
                EventType::AdoptionApproved,
                json!({"object": object.key(), "path": path, "approval_id": approval}),
            ),
            now,
        )?;
        tx.commit()?;
        Ok(approval)
    }

    fn pending_approval(&self, id: DeploymentId, object: &ObjectRef, path: &str) -> Result<Option<i64>> {
        let db = self.conn()?;
        let mut stmt = db.prepare(
            "SELECT id, path FROM adoption_approvals
             WHERE deployment_id = ?1 AND kind = ?2 AND namespace = ?3 AND name = ?4 AND consumed_at IS NULL
             ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![id.to_string(), object.kind.as_str(), object.namespace, object.name], |r| {
                Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows.into_iter().find(|(_, approved)| fields::path_within(path, approved)).map(|(a, _)| a))
    }
}
