use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{Connection, Row};
use tracing::debug;

use pulse_core::events::EventKind;
use pulse_core::models::{DeliveryState, Event, Session};
use pulse_core::time_utils::from_storage;
use pulse_core::{PulseError, Result};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sessions (
    session_id         TEXT PRIMARY KEY,
    file_name          TEXT NOT NULL,
    created_at         TEXT NOT NULL,
    updated_at         TEXT NOT NULL,
    monitoring_started TEXT,
    monitoring_ended   TEXT,
    is_active          INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_sessions_is_active ON sessions(is_active);

CREATE TABLE IF NOT EXISTS events (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id       TEXT,
    event_type       TEXT NOT NULL,
    timestamp        TEXT NOT NULL,
    source           TEXT NOT NULL,
    data             TEXT NOT NULL,
    delivery_state   TEXT NOT NULL DEFAULT 'pending',
    lease_expires_at TEXT,
    created_at       TEXT NOT NULL,
    updated_at       TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_session_id ON events(session_id);
CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp);
CREATE INDEX IF NOT EXISTS idx_events_delivery_state ON events(delivery_state);
";

/// Shared handle to the single SQLite connection.
///
/// Every store component clones this; each operation holds the lock for
/// the duration of one statement or one transaction.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the database file at `path`, creating parent
    /// directories and the schema as needed.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path).storage()?;
        conn.pragma_update(None, "journal_mode", "WAL").storage()?;
        conn.pragma_update(None, "synchronous", "NORMAL").storage()?;
        debug!(path = %path.display(), "opened event store");
        Self::init(conn)
    }

    /// A private in-memory database, used by tests and `--database :memory:`.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().storage()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA).storage()?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` with exclusive access to the connection.
    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| PulseError::storage_msg("database lock poisoned"))?;
        f(&mut conn)
    }
}

// ── Error mapping ─────────────────────────────────────────────────────────────

/// Map rusqlite results into the pipeline's error type.
pub(crate) trait StorageExt<T> {
    fn storage(self) -> Result<T>;
}

impl<T> StorageExt<T> for rusqlite::Result<T> {
    fn storage(self) -> Result<T> {
        self.map_err(PulseError::storage)
    }
}

// ── Row mapping ───────────────────────────────────────────────────────────────

pub(crate) const SESSION_COLUMNS: &str = "session_id, file_name, created_at, updated_at, \
     monitoring_started, monitoring_ended, is_active";

pub(crate) const EVENT_COLUMNS: &str = "id, session_id, event_type, timestamp, source, data, \
     delivery_state, created_at, updated_at";

/// Column values as stored, before timestamp and JSON decoding.
pub(crate) struct SessionRow {
    id: String,
    file_name: String,
    created_at: String,
    updated_at: String,
    monitoring_started: Option<String>,
    monitoring_ended: Option<String>,
    is_active: bool,
}

impl SessionRow {
    pub(crate) fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            file_name: row.get(1)?,
            created_at: row.get(2)?,
            updated_at: row.get(3)?,
            monitoring_started: row.get(4)?,
            monitoring_ended: row.get(5)?,
            is_active: row.get(6)?,
        })
    }

    /// Decode the row. A value that does not decode is store corruption,
    /// never a caller error.
    pub(crate) fn into_session(self) -> Result<Session> {
        let id = self.id.clone();
        self.decode().map_err(|e| corrupt_row("session", &id, e))
    }

    fn decode(self) -> Result<Session> {
        Ok(Session {
            id: self.id,
            file_name: self.file_name,
            created_at: from_storage(&self.created_at)?,
            updated_at: from_storage(&self.updated_at)?,
            monitoring_started: self.monitoring_started.as_deref().map(from_storage).transpose()?,
            monitoring_ended: self.monitoring_ended.as_deref().map(from_storage).transpose()?,
            is_active: self.is_active,
        })
    }
}

pub(crate) struct EventRow {
    id: i64,
    session_id: Option<String>,
    event_type: String,
    timestamp: String,
    source: String,
    data: String,
    delivery_state: String,
    created_at: String,
    updated_at: String,
}

impl EventRow {
    pub(crate) fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            session_id: row.get(1)?,
            event_type: row.get(2)?,
            timestamp: row.get(3)?,
            source: row.get(4)?,
            data: row.get(5)?,
            delivery_state: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }

    pub(crate) fn into_event(self) -> Result<Event> {
        let id = self.id;
        self.decode().map_err(|e| corrupt_row("event", &id.to_string(), e))
    }

    fn decode(self) -> Result<Event> {
        Ok(Event {
            id: self.id,
            session_id: self.session_id,
            kind: EventKind::parse(&self.event_type),
            timestamp: from_storage(&self.timestamp)?,
            source: self.source,
            data: serde_json::from_str(&self.data)?,
            delivery_state: self.delivery_state.parse::<DeliveryState>()?,
            created_at: from_storage(&self.created_at)?,
            updated_at: from_storage(&self.updated_at)?,
        })
    }
}

fn corrupt_row(table: &str, id: &str, err: PulseError) -> PulseError {
    PulseError::storage_msg(format!("unreadable {table} row {id}: {err}"))
}

/// Collect and decode every row of an event query.
pub(crate) fn collect_events(
    stmt: &mut rusqlite::Statement<'_>,
    params: impl rusqlite::Params,
) -> Result<Vec<Event>> {
    let rows = stmt
        .query_map(params, EventRow::read)
        .storage()?
        .collect::<rusqlite::Result<Vec<_>>>()
        .storage()?;
    rows.into_iter().map(EventRow::into_event).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_in_memory_creates_schema() {
        let db = Database::open_in_memory().unwrap();
        let tables: Vec<String> = db
            .with_conn(|conn| {
                let mut stmt = conn
                    .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
                    .storage()?;
                let names = stmt
                    .query_map([], |r| r.get(0))
                    .storage()?
                    .collect::<rusqlite::Result<Vec<String>>>()
                    .storage()?;
                Ok(names)
            })
            .unwrap();
        assert!(tables.contains(&"sessions".to_string()));
        assert!(tables.contains(&"events".to_string()));
    }

    #[test]
    fn test_open_file_creates_parent_and_is_reopenable() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("pulse.db");
        {
            let db = Database::open(&path).unwrap();
            db.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO sessions (session_id, file_name, created_at, updated_at) \
                     VALUES ('s', 'a.exe', 'x', 'x')",
                    [],
                )
                .storage()
            })
            .unwrap();
        }
        assert!(path.exists());

        // Schema creation is idempotent and data survives.
        let db = Database::open(&path).unwrap();
        let count: i64 = db
            .with_conn(|conn| {
                conn.query_row("SELECT COUNT(*) FROM sessions", [], |r| r.get(0))
                    .storage()
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_unreadable_event_row_is_internal() {
        use pulse_core::ErrorClass;

        let db = Database::open_in_memory().unwrap();
        let ts = "2024-01-01T00:00:00.000000Z";
        let err = db
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO events
                         (session_id, event_type, timestamp, source, data, delivery_state,
                          created_at, updated_at)
                     VALUES (NULL, 'file_operation', ?1, 'agent', '{not json', 'pending', ?1, ?1)",
                    [ts],
                )
                .storage()?;
                let mut stmt = conn
                    .prepare(&format!("SELECT {EVENT_COLUMNS} FROM events"))
                    .storage()?;
                collect_events(&mut stmt, [])
            })
            .unwrap_err();

        assert_eq!(err.class(), ErrorClass::Internal);
        assert!(err.to_string().contains("unreadable event row 1"), "{err}");
    }

    #[test]
    fn test_event_indexes_exist() {
        let db = Database::open_in_memory().unwrap();
        let indexes: Vec<String> = db
            .with_conn(|conn| {
                let mut stmt = conn
                    .prepare("SELECT name FROM sqlite_master WHERE type = 'index' AND tbl_name = 'events'")
                    .storage()?;
                let names = stmt
                    .query_map([], |r| r.get(0))
                    .storage()?
                    .collect::<rusqlite::Result<Vec<String>>>()
                    .storage()?;
                Ok(names)
            })
            .unwrap();
        for name in [
            "idx_events_session_id",
            "idx_events_timestamp",
            "idx_events_delivery_state",
        ] {
            assert!(indexes.contains(&name.to_string()), "missing {name}");
        }
    }
}
