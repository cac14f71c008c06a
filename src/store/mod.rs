//! SQLite persistence shared by every component.
//!
//! `PccDb` owns the connection; each table family implements its queries in
//! its own submodule as an `impl PccDb` block. Components receive a
//! [`DbHandle`] and only touch the tables they own.

mod budgets;
mod escalations;
mod merge_locks;
mod projects;
mod runs;
mod sessions;
mod shifts;
mod vms;
mod work_items;

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::types::Type;
use rusqlite::{Connection, Row};
use serde::de::DeserializeOwned;

pub use merge_locks::LockInsert;
pub use projects::{CollapseSummary, NewProject};
pub use runs::RunUpdate;

/// Async-safe handle to the database.
///
/// Wraps `PccDb` behind `Arc<Mutex>` and runs all access on tokio's blocking
/// thread pool via `spawn_blocking`, so synchronous SQLite I/O never ties up
/// async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<PccDb>>,
}

impl DbHandle {
    pub fn new(db: PccDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Open a fresh in-memory database behind a handle.
    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(PccDb::new_in_memory()?))
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&PccDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Only for startup, the CLI
    /// and tests; never from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, PccDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

pub struct PccDb {
    conn: Connection,
}

impl PccDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS projects (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    path TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'active',
                    priority INTEGER NOT NULL DEFAULT 3,
                    trunk_branch TEXT NOT NULL DEFAULT 'main',
                    test_command TEXT,
                    requires_vm INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS project_aliases (
                    alias_id TEXT PRIMARY KEY,
                    canonical_id TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS work_items (
                    id TEXT PRIMARY KEY,
                    project_id TEXT NOT NULL REFERENCES projects(id),
                    title TEXT NOT NULL,
                    goal TEXT NOT NULL DEFAULT '',
                    acceptance_criteria TEXT NOT NULL DEFAULT '[]',
                    non_goals TEXT NOT NULL DEFAULT '[]',
                    stop_conditions TEXT NOT NULL DEFAULT '[]',
                    priority INTEGER NOT NULL DEFAULT 3,
                    tags TEXT NOT NULL DEFAULT '[]',
                    status TEXT NOT NULL DEFAULT 'backlog',
                    estimate_usd REAL,
                    spec_path TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS work_item_deps (
                    work_item_id TEXT NOT NULL REFERENCES work_items(id),
                    depends_on TEXT NOT NULL REFERENCES work_items(id),
                    PRIMARY KEY (work_item_id, depends_on)
                );

                CREATE TABLE IF NOT EXISTS work_item_events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    work_item_id TEXT NOT NULL REFERENCES work_items(id),
                    from_status TEXT NOT NULL,
                    to_status TEXT NOT NULL,
                    cause TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS runs (
                    id TEXT PRIMARY KEY,
                    work_item_id TEXT NOT NULL REFERENCES work_items(id),
                    project_id TEXT NOT NULL REFERENCES projects(id),
                    status TEXT NOT NULL DEFAULT 'queued',
                    phase TEXT NOT NULL DEFAULT 'queued',
                    builder_iteration INTEGER NOT NULL DEFAULT 0,
                    log_path TEXT,
                    branch_name TEXT,
                    cost_usd REAL NOT NULL DEFAULT 0,
                    error TEXT,
                    failure_reason TEXT,
                    created_at TEXT NOT NULL,
                    started_at TEXT,
                    completed_at TEXT
                );

                CREATE UNIQUE INDEX IF NOT EXISTS idx_runs_one_active
                    ON runs(work_item_id) WHERE status IN ('queued', 'running');

                CREATE TABLE IF NOT EXISTS run_commands (
                    run_id TEXT NOT NULL REFERENCES runs(id),
                    seq INTEGER NOT NULL,
                    cwd TEXT NOT NULL,
                    command TEXT NOT NULL,
                    exit_code INTEGER,
                    created_at TEXT NOT NULL,
                    PRIMARY KEY (run_id, seq)
                );

                CREATE TABLE IF NOT EXISTS merge_locks (
                    id TEXT PRIMARY KEY,
                    project_id TEXT NOT NULL UNIQUE REFERENCES projects(id),
                    run_id TEXT NOT NULL REFERENCES runs(id),
                    acquired_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS merge_lock_history (
                    lock_id TEXT PRIMARY KEY,
                    project_id TEXT NOT NULL,
                    run_id TEXT NOT NULL,
                    acquired_at TEXT NOT NULL,
                    released_at TEXT
                );

                CREATE TABLE IF NOT EXISTS vm_records (
                    project_id TEXT PRIMARY KEY REFERENCES projects(id),
                    status TEXT NOT NULL DEFAULT 'not_provisioned',
                    instance_name TEXT,
                    external_ip TEXT,
                    internal_ip TEXT,
                    size TEXT NOT NULL DEFAULT 'medium',
                    last_started_at TEXT,
                    last_activity_at TEXT,
                    last_error TEXT,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS budgets (
                    project_id TEXT PRIMARY KEY REFERENCES projects(id),
                    monthly_allocation_usd REAL NOT NULL,
                    spent_usd REAL NOT NULL DEFAULT 0,
                    daily_drip_usd REAL NOT NULL DEFAULT 0,
                    drip_available_usd REAL NOT NULL DEFAULT 0,
                    drip_spent_usd REAL NOT NULL DEFAULT 0,
                    drip_credited_on TEXT,
                    reserved_usd REAL NOT NULL DEFAULT 0,
                    drip_reserved_usd REAL NOT NULL DEFAULT 0,
                    status TEXT NOT NULL DEFAULT 'healthy',
                    period_start TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS cost_events (
                    id TEXT PRIMARY KEY,
                    project_id TEXT NOT NULL,
                    run_id TEXT,
                    amount_usd REAL NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS escalations (
                    id TEXT PRIMARY KEY,
                    project_id TEXT NOT NULL REFERENCES projects(id),
                    run_id TEXT,
                    shift_id TEXT,
                    reason TEXT NOT NULL,
                    detail TEXT NOT NULL DEFAULT '',
                    payload TEXT NOT NULL DEFAULT '{}',
                    dedup_key TEXT NOT NULL UNIQUE,
                    created_at TEXT NOT NULL,
                    resolved_at TEXT
                );

                CREATE TABLE IF NOT EXISTS communications (
                    id TEXT PRIMARY KEY,
                    project_id TEXT REFERENCES projects(id),
                    intent TEXT NOT NULL,
                    kind TEXT NOT NULL,
                    scope TEXT NOT NULL,
                    summary TEXT NOT NULL,
                    body TEXT,
                    run_id TEXT,
                    shift_id TEXT,
                    payload TEXT,
                    created_at TEXT NOT NULL,
                    acknowledged_at TEXT
                );

                CREATE TABLE IF NOT EXISTS shifts (
                    id TEXT PRIMARY KEY,
                    project_id TEXT NOT NULL REFERENCES projects(id),
                    phase TEXT NOT NULL DEFAULT 'context',
                    started_at TEXT NOT NULL,
                    timeout_minutes INTEGER NOT NULL,
                    ended_at TEXT,
                    handoff TEXT
                );

                CREATE UNIQUE INDEX IF NOT EXISTS idx_shifts_one_active
                    ON shifts(project_id) WHERE ended_at IS NULL;

                CREATE TABLE IF NOT EXISTS global_sessions (
                    id TEXT PRIMARY KEY,
                    state TEXT NOT NULL,
                    goals TEXT NOT NULL DEFAULT '[]',
                    constraints TEXT NOT NULL DEFAULT '[]',
                    iteration INTEGER NOT NULL DEFAULT 0,
                    max_iterations INTEGER NOT NULL,
                    paused_at TEXT,
                    pause_reason TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_work_items_project ON work_items(project_id, status);
                CREATE INDEX IF NOT EXISTS idx_work_item_deps_dep ON work_item_deps(depends_on);
                CREATE INDEX IF NOT EXISTS idx_runs_work_item ON runs(work_item_id);
                CREATE INDEX IF NOT EXISTS idx_runs_project ON runs(project_id);
                CREATE INDEX IF NOT EXISTS idx_cost_events_project ON cost_events(project_id, created_at);
                CREATE INDEX IF NOT EXISTS idx_shifts_project ON shifts(project_id, started_at);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }
}

/// Read a TEXT column holding one of our snake_case enum names.
pub(crate) fn enum_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = String>,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

pub(crate) fn opt_enum_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: FromStr<Err = String>,
{
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        s.parse::<T>()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
    })
    .transpose()
}

/// Read a TEXT column holding JSON.
pub(crate) fn json_col<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn opt_json_col<T: DeserializeOwned>(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<T>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        serde_json::from_str(&s)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

pub(crate) fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).context("Failed to serialize column value")
}

/// True when `err` is a constraint violation with the given extended code.
pub(crate) fn is_constraint(err: &rusqlite::Error, extended: std::os::raw::c_int) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.extended_code == extended
    )
}

pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    is_constraint(err, rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE)
        || is_constraint(err, rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY)
}

pub(crate) fn is_foreign_key_violation(err: &rusqlite::Error) -> bool {
    is_constraint(err, rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY)
}
