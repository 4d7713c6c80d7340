// src/service/store.rs

//! Durable status store for preservation requests
//!
//! One row per request in `preservation_requests`. A partial unique index
//! allows at most one `queued` or `running` row per identifier, so the store
//! itself refuses a second active request even if the in-memory lock table
//! is bypassed. State changes are compare-and-swap on the current state.

use super::{PreservationState, PreservationStatus, RequestId, SipLocation};
use crate::validate::Issue;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

const COLUMNS: &str = "request_id, identifier, state, attempt, sip_json, issues_json, cause,
     retry_eligible, created_at, last_updated";

/// What a transition writes besides the new state
#[derive(Debug, Clone, Default)]
pub struct Transition {
    pub attempt: Option<u32>,
    pub issues: Vec<Issue>,
    pub cause: Option<String>,
    pub retry_eligible: bool,
}

impl Transition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn issues(mut self, issues: Vec<Issue>) -> Self {
        self.issues = issues;
        self
    }

    pub fn cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn retry_eligible(mut self) -> Self {
        self.retry_eligible = true;
        self
    }
}

pub struct StatusStore {
    conn: Mutex<Connection>,
}

impl StatusStore {
    /// Open (or create) the store at `path` and bring its schema up to date
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A poisoned lock only means another thread panicked mid-call; SQLite
        // itself is still consistent.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert a new request; fails with `AlreadyInProgress` if its identifier
    /// already has an active row
    pub fn insert(&self, status: &PreservationStatus) -> Result<()> {
        let conn = self.conn();
        let result = conn.execute(
            "INSERT INTO preservation_requests (request_id, identifier, state, attempt, sip_json,
             issues_json, cause, retry_eligible, created_at, last_updated)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                &status.request_id,
                &status.identifier,
                status.state.as_str(),
                status.attempt,
                serde_json::to_string(&status.sip)?,
                issues_json(&status.issues)?,
                &status.cause,
                status.retry_eligible,
                status.created_at.to_rfc3339(),
                status.last_updated.to_rfc3339(),
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                let holder = active_request(&conn, &status.identifier)?.unwrap_or_default();
                Err(Error::AlreadyInProgress {
                    identifier: status.identifier.clone(),
                    request_id: holder,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn get(&self, request_id: &str) -> Result<Option<PreservationStatus>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM preservation_requests WHERE request_id = ?1",
            COLUMNS
        ))?;
        Ok(stmt.query_row([request_id], from_row).optional()?)
    }

    /// Most recently created request for an identifier
    pub fn latest_for_identifier(&self, identifier: &str) -> Result<Option<PreservationStatus>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM preservation_requests WHERE identifier = ?1
             ORDER BY created_at DESC, rowid DESC LIMIT 1",
            COLUMNS
        ))?;
        Ok(stmt.query_row([identifier], from_row).optional()?)
    }

    /// The queued or running request for an identifier, if any
    pub fn active_for_identifier(&self, identifier: &str) -> Result<Option<RequestId>> {
        active_request(&self.conn(), identifier)
    }

    /// Requests in a given state, oldest first
    pub fn list_by_state(&self, state: PreservationState) -> Result<Vec<PreservationStatus>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM preservation_requests WHERE state = ?1
             ORDER BY created_at ASC, rowid ASC",
            COLUMNS
        ))?;
        let rows = stmt
            .query_map([state.as_str()], from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Move a request from `expected` to `next`
    ///
    /// Returns false, changing nothing, if the request is not in `expected`.
    pub fn transition(
        &self,
        request_id: &str,
        expected: PreservationState,
        next: PreservationState,
        update: Transition,
    ) -> Result<bool> {
        let conn = self.conn();
        let rows = conn.execute(
            "UPDATE preservation_requests
             SET state = ?1, attempt = COALESCE(?2, attempt), issues_json = ?3, cause = ?4,
                 retry_eligible = ?5, last_updated = ?6
             WHERE request_id = ?7 AND state = ?8",
            params![
                next.as_str(),
                update.attempt,
                issues_json(&update.issues)?,
                update.cause,
                update.retry_eligible,
                Utc::now().to_rfc3339(),
                request_id,
                expected.as_str(),
            ],
        )?;

        if rows > 0 {
            debug!("Request {}: {} -> {}", request_id, expected, next);
        }
        Ok(rows > 0)
    }
}

fn active_request(conn: &Connection, identifier: &str) -> Result<Option<RequestId>> {
    let mut stmt = conn.prepare(
        "SELECT request_id FROM preservation_requests
         WHERE identifier = ?1 AND state IN ('queued', 'running')",
    )?;
    Ok(stmt.query_row([identifier], |row| row.get(0)).optional()?)
}

fn issues_json(issues: &[Issue]) -> Result<Option<String>> {
    if issues.is_empty() {
        Ok(None)
    } else {
        Ok(Some(serde_json::to_string(issues)?))
    }
}

fn parse_time(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_default()
}

fn from_row(row: &Row) -> rusqlite::Result<PreservationStatus> {
    let state_str: String = row.get(2)?;
    let sip_json: String = row.get(4)?;
    let issues_json: Option<String> = row.get(5)?;
    let created_at: String = row.get(8)?;
    let last_updated: String = row.get(9)?;

    let state = state_str.parse().map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("unknown state '{}'", state_str).into(),
        )
    })?;
    let sip: SipLocation = serde_json::from_str(&sip_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let issues = issues_json
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default();

    Ok(PreservationStatus {
        request_id: row.get(0)?,
        identifier: row.get(1)?,
        state,
        attempt: row.get(3)?,
        sip,
        issues,
        cause: row.get(6)?,
        retry_eligible: row.get(7)?,
        created_at: parse_time(&created_at),
        last_updated: parse_time(&last_updated),
    })
}

fn init_schema_version(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;
    Ok(())
}

pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    init_schema_version(conn)?;
    let version = conn
        .query_row(
            "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()?
        .unwrap_or(0);
    Ok(version)
}

/// Apply all pending migrations
pub fn migrate(conn: &Connection) -> Result<()> {
    let current = get_schema_version(conn)?;
    if current >= SCHEMA_VERSION {
        return Ok(());
    }

    for version in (current + 1)..=SCHEMA_VERSION {
        info!("Applying status store migration {}", version);
        apply_migration(conn, version)?;
        conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
    }
    Ok(())
}

fn apply_migration(conn: &Connection, version: i32) -> Result<()> {
    match version {
        1 => migrate_v1(conn),
        v => Err(Error::Config(format!("unknown status store migration {}", v))),
    }
}

fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE preservation_requests (
            request_id TEXT PRIMARY KEY,
            identifier TEXT NOT NULL,
            state TEXT NOT NULL
                CHECK(state IN ('queued', 'running', 'succeeded', 'failed', 'cancelled')),
            attempt INTEGER NOT NULL DEFAULT 0,
            sip_json TEXT NOT NULL,
            issues_json TEXT,
            cause TEXT,
            retry_eligible INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            last_updated TEXT NOT NULL
        );

        CREATE INDEX idx_requests_identifier ON preservation_requests(identifier, created_at);
        CREATE INDEX idx_requests_state ON preservation_requests(state);

        -- At most one active request per identifier
        CREATE UNIQUE INDEX idx_requests_active ON preservation_requests(identifier)
            WHERE state IN ('queued', 'running');
        ",
    )?;
    Ok(())
}
