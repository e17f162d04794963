//! Table layout. Timestamps are unix milliseconds; JSON columns hold serde_json text.

pub(crate) const DDL: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS deployments (
        id                      TEXT PRIMARY KEY,
        template_name           TEXT NOT NULL,
        template_version        TEXT NOT NULL,
        namespace               TEXT NOT NULL,
        desired_spec            TEXT NOT NULL,
        policy                  TEXT NOT NULL,
        generation              INTEGER NOT NULL,
        last_applied_generation INTEGER NOT NULL DEFAULT 0,
        lifecycle               TEXT NOT NULL,
        status                  TEXT NOT NULL,
        created_at              INTEGER NOT NULL,
        updated_at              INTEGER NOT NULL,
        archived_at             INTEGER,
        CHECK (last_applied_generation <= generation)
    )",
    "CREATE TABLE IF NOT EXISTS deployment_revisions (
        deployment_id TEXT NOT NULL REFERENCES deployments(id),
        generation    INTEGER NOT NULL,
        desired_spec  TEXT NOT NULL,
        created_at    INTEGER NOT NULL,
        PRIMARY KEY (deployment_id, generation)
    )",
    "CREATE TABLE IF NOT EXISTS managed_resources (
        deployment_id TEXT NOT NULL REFERENCES deployments(id),
        kind          TEXT NOT NULL,
        namespace     TEXT NOT NULL,
        name          TEXT NOT NULL,
        uid           TEXT NOT NULL,
        last_seen_at  INTEGER NOT NULL,
        managed       INTEGER NOT NULL DEFAULT 1,
        UNIQUE (kind, namespace, name)
    )",
    "CREATE INDEX IF NOT EXISTS idx_managed_deployment ON managed_resources(deployment_id)",
    "CREATE TABLE IF NOT EXISTS observed_snapshots (
        deployment_id TEXT PRIMARY KEY REFERENCES deployments(id),
        resources     TEXT NOT NULL,
        observed_at   INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS events (
        seq           INTEGER PRIMARY KEY AUTOINCREMENT,
        deployment_id TEXT NOT NULL,
        source        TEXT NOT NULL,
        event_type    TEXT NOT NULL,
        payload       TEXT NOT NULL,
        created_at    INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_events_deployment_seq ON events(deployment_id, seq)",
    "CREATE TABLE IF NOT EXISTS reconcile_jobs (
        id            INTEGER PRIMARY KEY AUTOINCREMENT,
        deployment_id TEXT NOT NULL UNIQUE REFERENCES deployments(id),
        job_type      TEXT NOT NULL DEFAULT 'reconcile',
        reason        TEXT NOT NULL,
        state         TEXT NOT NULL,
        attempts      INTEGER NOT NULL DEFAULT 0,
        next_run_at   INTEGER NOT NULL,
        lock_holder   TEXT,
        locked_at     INTEGER,
        rerun         TEXT,
        last_error    TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_jobs_due ON reconcile_jobs(state, next_run_at)",
    "CREATE TABLE IF NOT EXISTS adoption_approvals (
        id            INTEGER PRIMARY KEY AUTOINCREMENT,
        deployment_id TEXT NOT NULL REFERENCES deployments(id),
        kind          TEXT NOT NULL,
        namespace     TEXT NOT NULL,
        name          TEXT NOT NULL,
        path          TEXT NOT NULL,
        created_at    INTEGER NOT NULL,
        consumed_at   INTEGER
    )",
    "CREATE INDEX IF NOT EXISTS idx_approvals_deployment ON adoption_approvals(deployment_id)",
];
