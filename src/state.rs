//! Mirror state - SQLite persistence for per-mirror status and sync events
//!
//! Two tables:
//! - `mirrors`: last sync time, status and error for every destination repository
//! - `events`: append-only log of what each sync did (created, pushed, failed...)
//!
//! The database lives in `$XDG_DATA_HOME/github-sync/state.db` unless
//! `state.database` says otherwise.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::PathBuf;
use tracing::{debug, info};

use crate::config::Config;

/// Event types that can occur during sync operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// GitHub repository was created
    Created,
    /// Source repository was cloned into the cache for the first time
    Cloned,
    /// Refs were pushed to GitHub
    Pushed,
    /// Nothing changed upstream
    UpToDate,
    /// Mirror was skipped
    Skipped,
    /// Sync operation failed with an error
    SyncError,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Created => "created",
            EventType::Cloned => "cloned",
            EventType::Pushed => "pushed",
            EventType::UpToDate => "up_to_date",
            EventType::Skipped => "skipped",
            EventType::SyncError => "sync_error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(EventType::Created),
            "cloned" => Some(EventType::Cloned),
            "pushed" => Some(EventType::Pushed),
            "up_to_date" => Some(EventType::UpToDate),
            "skipped" => Some(EventType::Skipped),
            "sync_error" => Some(EventType::SyncError),
            _ => None,
        }
    }

    /// Get the severity level for this event type
    pub fn severity(&self) -> Severity {
        match self {
            EventType::Created | EventType::Cloned | EventType::Pushed | EventType::UpToDate => {
                Severity::Info
            }
            EventType::Skipped => Severity::Warning,
            EventType::SyncError => Severity::Error,
        }
    }
}

/// Severity levels for events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "info" => Some(Severity::Info),
            "warning" => Some(Severity::Warning),
            "error" => Some(Severity::Error),
            _ => None,
        }
    }
}

/// Outcome of the most recent sync of a mirror
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorStatus {
    Ok,
    Skipped,
    Error,
    /// Never synced
    Unknown,
}

impl MirrorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MirrorStatus::Ok => "ok",
            MirrorStatus::Skipped => "skipped",
            MirrorStatus::Error => "error",
            MirrorStatus::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "ok" => MirrorStatus::Ok,
            "skipped" => MirrorStatus::Skipped,
            "error" => MirrorStatus::Error,
            _ => MirrorStatus::Unknown,
        }
    }
}

/// Mirror state record
#[derive(Debug, Clone)]
pub struct MirrorState {
    pub id: i64,
    pub full_name: String,
    pub source_url: Option<String>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_sync_status: MirrorStatus,
    pub last_error: Option<String>,
    pub refs_changed: u32,
    pub updated_at: DateTime<Utc>,
}

/// A sync event record
#[derive(Debug, Clone)]
pub struct SyncEvent {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub mirror: Option<String>,
    pub event_type: EventType,
    pub severity: Severity,
    pub summary: String,
    pub details: Option<String>,
}

/// Builder for creating new sync events
#[derive(Debug)]
pub struct SyncEventBuilder {
    mirror: Option<String>,
    event_type: EventType,
    summary: String,
    details: Option<String>,
}

impl SyncEventBuilder {
    pub fn new(event_type: EventType, summary: impl Into<String>) -> Self {
        Self {
            mirror: None,
            event_type,
            summary: summary.into(),
            details: None,
        }
    }

    pub fn mirror(mut self, full_name: impl Into<String>) -> Self {
        self.mirror = Some(full_name.into());
        self
    }

    pub fn details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn details_json<T: serde::Serialize>(mut self, details: &T) -> Self {
        if let Ok(json) = serde_json::to_string(details) {
            self.details = Some(json);
        }
        self
    }
}

fn parse_timestamp(value: Option<String>) -> Option<DateTime<Utc>> {
    value
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn mirror_from_row(row: &Row<'_>) -> rusqlite::Result<MirrorState> {
    Ok(MirrorState {
        id: row.get(0)?,
        full_name: row.get(1)?,
        source_url: row.get(2)?,
        last_sync_at: parse_timestamp(row.get(3)?),
        last_sync_status: MirrorStatus::parse(&row.get::<_, String>(4).unwrap_or_default()),
        last_error: row.get(5)?,
        refs_changed: row.get::<_, Option<u32>>(6)?.unwrap_or(0),
        updated_at: parse_timestamp(row.get(7).ok()).unwrap_or_else(Utc::now),
    })
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<SyncEvent> {
    Ok(SyncEvent {
        id: row.get(0)?,
        timestamp: parse_timestamp(row.get(1).ok()).unwrap_or_else(Utc::now),
        mirror: row.get(2)?,
        event_type: EventType::parse(&row.get::<_, String>(3)?).unwrap_or(EventType::SyncError),
        severity: Severity::parse(&row.get::<_, String>(4)?).unwrap_or(Severity::Info),
        summary: row.get(5)?,
        details: row.get(6)?,
    })
}

const MIRROR_COLUMNS: &str =
    "id, full_name, source_url, last_sync_at, last_sync_status, last_error, refs_changed, updated_at";

const EVENT_COLUMNS: &str = "id, timestamp, mirror, event_type, severity, summary, details";

/// State database manager
pub struct StateDb {
    conn: Connection,
}

impl StateDb {
    /// Open or create the database configured in `state.database`
    pub fn open(config: &Config) -> Result<Self> {
        Self::open_at(PathBuf::from(&config.state.database))
    }

    /// Open or create the state database at a specific path
    pub fn open_at(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }

        let conn = Connection::open(&path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;

        let db = Self { conn };
        db.initialize()?;

        info!("State database opened at {}", path.display());
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        let db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    fn initialize(&self) -> Result<()> {
        self.conn
            .execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS mirrors (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    full_name TEXT UNIQUE NOT NULL,
                    source_url TEXT,
                    last_sync_at TEXT,
                    last_sync_status TEXT DEFAULT 'unknown',
                    last_error TEXT,
                    refs_changed INTEGER DEFAULT 0,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    timestamp TEXT NOT NULL,
                    mirror TEXT,
                    event_type TEXT NOT NULL,
                    severity TEXT NOT NULL,
                    summary TEXT NOT NULL,
                    details TEXT
                );

                CREATE INDEX IF NOT EXISTS idx_mirrors_status ON mirrors(last_sync_status);
                CREATE INDEX IF NOT EXISTS idx_events_mirror ON events(mirror, timestamp);
                CREATE INDEX IF NOT EXISTS idx_events_type ON events(event_type, timestamp);
                "#,
            )
            .context("Failed to initialize database schema")?;

        debug!("Database schema initialized");
        Ok(())
    }

    // =========================================================================
    // Mirror State Operations
    // =========================================================================

    /// Update or insert a mirror's state
    ///
    /// `last_sync_at` only moves forward on `Ok`, so a failing or skipped
    /// mirror keeps the time of its last good sync.
    pub fn upsert_mirror(
        &self,
        full_name: &str,
        source_url: Option<&str>,
        status: MirrorStatus,
        last_error: Option<&str>,
        refs_changed: u32,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let last_sync_at = (status == MirrorStatus::Ok).then(|| now.clone());

        self.conn
            .execute(
                r#"
                INSERT INTO mirrors (full_name, source_url, last_sync_at, last_sync_status, last_error, refs_changed, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT(full_name) DO UPDATE SET
                    source_url = COALESCE(?2, source_url),
                    last_sync_at = COALESCE(?3, last_sync_at),
                    last_sync_status = ?4,
                    last_error = ?5,
                    refs_changed = ?6,
                    updated_at = ?7
                "#,
                params![
                    full_name,
                    source_url,
                    last_sync_at,
                    status.as_str(),
                    last_error,
                    refs_changed,
                    now,
                ],
            )
            .context("Failed to upsert mirror")?;

        debug!("Updated mirror state: {} -> {:?}", full_name, status);
        Ok(())
    }

    /// Get a mirror's current state
    pub fn get_mirror(&self, full_name: &str) -> Result<Option<MirrorState>> {
        let sql = format!("SELECT {} FROM mirrors WHERE full_name = ?1", MIRROR_COLUMNS);

        self.conn
            .query_row(&sql, params![full_name], mirror_from_row)
            .optional()
            .context("Failed to query mirror")
    }

    /// All known mirrors, optionally restricted to one status
    pub fn list_mirrors(&self, status: Option<MirrorStatus>) -> Result<Vec<MirrorState>> {
        let mirrors = match status {
            Some(status) => {
                let sql = format!(
                    "SELECT {} FROM mirrors WHERE last_sync_status = ?1 ORDER BY full_name",
                    MIRROR_COLUMNS
                );
                let mut stmt = self.conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![status.as_str()], mirror_from_row)
                    .context("Failed to query mirrors")?;
                rows.collect::<Result<Vec<_>, _>>()
            }
            None => {
                let sql = format!("SELECT {} FROM mirrors ORDER BY full_name", MIRROR_COLUMNS);
                let mut stmt = self.conn.prepare(&sql)?;
                let rows = stmt
                    .query_map([], mirror_from_row)
                    .context("Failed to query mirrors")?;
                rows.collect::<Result<Vec<_>, _>>()
            }
        };

        mirrors.context("Failed to collect mirrors")
    }

    // =========================================================================
    // Event Operations
    // =========================================================================

    /// Record a new sync event
    pub fn record_event(&self, builder: SyncEventBuilder) -> Result<i64> {
        let now = Utc::now().to_rfc3339();
        let severity = builder.event_type.severity();

        self.conn
            .execute(
                r#"
                INSERT INTO events (timestamp, mirror, event_type, severity, summary, details)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    now,
                    builder.mirror,
                    builder.event_type.as_str(),
                    severity.as_str(),
                    builder.summary,
                    builder.details,
                ],
            )
            .context("Failed to record event")?;

        let id = self.conn.last_insert_rowid();
        debug!(
            "Recorded event: {} - {}",
            builder.event_type.as_str(),
            builder.summary
        );
        Ok(id)
    }

    /// Most recent events first, optionally for a single mirror
    pub fn recent_events(&self, limit: u32, mirror: Option<&str>) -> Result<Vec<SyncEvent>> {
        let events = match mirror {
            Some(mirror) => {
                let sql = format!(
                    "SELECT {} FROM events WHERE mirror = ?1 ORDER BY timestamp DESC, id DESC LIMIT ?2",
                    EVENT_COLUMNS
                );
                let mut stmt = self.conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![mirror, limit], event_from_row)
                    .context("Failed to query events")?;
                rows.collect::<Result<Vec<_>, _>>()
            }
            None => {
                let sql = format!(
                    "SELECT {} FROM events ORDER BY timestamp DESC, id DESC LIMIT ?1",
                    EVENT_COLUMNS
                );
                let mut stmt = self.conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![limit], event_from_row)
                    .context("Failed to query events")?;
                rows.collect::<Result<Vec<_>, _>>()
            }
        };

        events.context("Failed to collect events")
    }

    /// Count events by severity: (info, warning, error)
    pub fn event_counts(&self) -> Result<(u32, u32, u32)> {
        let mut stmt = self
            .conn
            .prepare("SELECT severity, COUNT(*) FROM events GROUP BY severity")?;

        let mut info_count = 0u32;
        let mut warning_count = 0u32;
        let mut error_count = 0u32;

        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?))
        })?;

        for row in rows {
            let (severity, count) = row?;
            match Severity::parse(&severity) {
                Some(Severity::Info) => info_count = count,
                Some(Severity::Warning) => warning_count = count,
                Some(Severity::Error) => error_count = count,
                None => {}
            }
        }

        Ok((info_count, warning_count, error_count))
    }

    /// Delete events older than `older_than`
    pub fn prune_events(&self, older_than: chrono::Duration) -> Result<u64> {
        let cutoff = Utc::now() - older_than;
        let count = self
            .conn
            .execute(
                "DELETE FROM events WHERE timestamp < ?1",
                params![cutoff.to_rfc3339()],
            )
            .context("Failed to prune old events")?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_initialization() {
        let db = StateDb::open_in_memory().unwrap();
        let count: i32 = db
            .conn
            .query_row("SELECT COUNT(*) FROM mirrors", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_open_at_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.db");

        let db = StateDb::open_at(path.clone()).unwrap();
        db.upsert_mirror("octocat/tool", None, MirrorStatus::Ok, None, 1)
            .unwrap();
        drop(db);

        let db = StateDb::open_at(path).unwrap();
        assert!(db.get_mirror("octocat/tool").unwrap().is_some());
    }

    #[test]
    fn test_mirror_upsert_and_get() {
        let db = StateDb::open_in_memory().unwrap();

        db.upsert_mirror(
            "octocat/tool",
            Some("https://git.example.org/tool.git"),
            MirrorStatus::Ok,
            None,
            3,
        )
        .unwrap();

        let mirror = db.get_mirror("octocat/tool").unwrap().unwrap();
        assert_eq!(mirror.full_name, "octocat/tool");
        assert_eq!(
            mirror.source_url.as_deref(),
            Some("https://git.example.org/tool.git")
        );
        assert_eq!(mirror.last_sync_status, MirrorStatus::Ok);
        assert_eq!(mirror.refs_changed, 3);
        assert!(mirror.last_sync_at.is_some());

        assert!(db.get_mirror("octocat/missing").unwrap().is_none());
    }

    #[test]
    fn test_error_keeps_last_good_sync() {
        let db = StateDb::open_in_memory().unwrap();

        db.upsert_mirror("octocat/tool", Some("https://a"), MirrorStatus::Ok, None, 1)
            .unwrap();
        let first = db.get_mirror("octocat/tool").unwrap().unwrap();

        db.upsert_mirror(
            "octocat/tool",
            None,
            MirrorStatus::Error,
            Some("fetch failed"),
            0,
        )
        .unwrap();

        let mirror = db.get_mirror("octocat/tool").unwrap().unwrap();
        assert_eq!(mirror.source_url.as_deref(), Some("https://a"));
        assert_eq!(mirror.last_sync_status, MirrorStatus::Error);
        assert_eq!(mirror.last_error.as_deref(), Some("fetch failed"));
        assert_eq!(mirror.last_sync_at, first.last_sync_at);
    }

    #[test]
    fn test_skipped_keeps_last_good_sync() {
        let db = StateDb::open_in_memory().unwrap();

        db.upsert_mirror("octocat/new", None, MirrorStatus::Skipped, Some("shutdown requested"), 0)
            .unwrap();
        let mirror = db.get_mirror("octocat/new").unwrap().unwrap();
        assert_eq!(mirror.last_sync_status, MirrorStatus::Skipped);
        assert!(mirror.last_sync_at.is_none());

        db.upsert_mirror("octocat/tool", None, MirrorStatus::Ok, None, 1)
            .unwrap();
        let first = db.get_mirror("octocat/tool").unwrap().unwrap();
        db.upsert_mirror("octocat/tool", None, MirrorStatus::Skipped, Some("shutdown requested"), 0)
            .unwrap();

        let mirror = db.get_mirror("octocat/tool").unwrap().unwrap();
        assert_eq!(mirror.last_sync_status, MirrorStatus::Skipped);
        assert_eq!(mirror.last_sync_at, first.last_sync_at);
    }

    #[test]
    fn test_list_mirrors_by_status() {
        let db = StateDb::open_in_memory().unwrap();

        db.upsert_mirror("octocat/b", None, MirrorStatus::Ok, None, 0)
            .unwrap();
        db.upsert_mirror("octocat/a", None, MirrorStatus::Ok, None, 0)
            .unwrap();
        db.upsert_mirror("octocat/c", None, MirrorStatus::Error, Some("boom"), 0)
            .unwrap();

        let all = db.list_mirrors(None).unwrap();
        let names: Vec<_> = all.iter().map(|m| m.full_name.as_str()).collect();
        assert_eq!(names, vec!["octocat/a", "octocat/b", "octocat/c"]);

        let failed = db.list_mirrors(Some(MirrorStatus::Error)).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].full_name, "octocat/c");
    }

    #[test]
    fn test_record_and_read_events() {
        let db = StateDb::open_in_memory().unwrap();

        let id = db
            .record_event(
                SyncEventBuilder::new(EventType::Pushed, "Pushed 2 refs")
                    .mirror("octocat/tool")
                    .details_json(&serde_json::json!({ "new": 2 })),
            )
            .unwrap();
        assert!(id > 0);

        db.record_event(SyncEventBuilder::new(EventType::SyncError, "clone failed").mirror("octocat/other"))
            .unwrap();

        let events = db.recent_events(10, None).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, EventType::SyncError);
        assert_eq!(events[0].severity, Severity::Error);
        assert_eq!(events[1].details.as_deref(), Some(r#"{"new":2}"#));

        let tool_events = db.recent_events(10, Some("octocat/tool")).unwrap();
        assert_eq!(tool_events.len(), 1);
        assert_eq!(tool_events[0].summary, "Pushed 2 refs");

        assert_eq!(db.recent_events(1, None).unwrap().len(), 1);
    }

    #[test]
    fn test_event_counts() {
        let db = StateDb::open_in_memory().unwrap();

        db.record_event(SyncEventBuilder::new(EventType::Cloned, "Cloned"))
            .unwrap();
        db.record_event(SyncEventBuilder::new(EventType::Pushed, "Pushed"))
            .unwrap();
        db.record_event(SyncEventBuilder::new(EventType::Skipped, "Skipped"))
            .unwrap();
        db.record_event(SyncEventBuilder::new(EventType::SyncError, "Error"))
            .unwrap();

        assert_eq!(db.event_counts().unwrap(), (2, 1, 1));
    }

    #[test]
    fn test_prune_events() {
        let db = StateDb::open_in_memory().unwrap();

        db.conn
            .execute(
                "INSERT INTO events (timestamp, event_type, severity, summary) VALUES (?1, 'pushed', 'info', 'old')",
                params![(Utc::now() - chrono::Duration::days(40)).to_rfc3339()],
            )
            .unwrap();
        db.record_event(SyncEventBuilder::new(EventType::Pushed, "new"))
            .unwrap();

        let removed = db.prune_events(chrono::Duration::days(30)).unwrap();
        assert_eq!(removed, 1);

        let events = db.recent_events(10, None).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].summary, "new");
    }

    #[test]
    fn test_event_type_round_trip_and_severity() {
        for event_type in [
            EventType::Created,
            EventType::Cloned,
            EventType::Pushed,
            EventType::UpToDate,
            EventType::Skipped,
            EventType::SyncError,
        ] {
            assert_eq!(EventType::parse(event_type.as_str()), Some(event_type));
        }

        assert_eq!(EventType::Created.severity(), Severity::Info);
        assert_eq!(EventType::Skipped.severity(), Severity::Warning);
        assert_eq!(EventType::SyncError.severity(), Severity::Error);
        assert_eq!(MirrorStatus::parse("bogus"), MirrorStatus::Unknown);
    }
}
