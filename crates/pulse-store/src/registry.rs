use chrono::{DateTime, Utc};
use rusqlite::{params, ErrorCode, OptionalExtension};
use tracing::{debug, info, warn};
use uuid::Uuid;

use pulse_core::models::Session;
use pulse_core::time_utils::to_storage;
use pulse_core::{PulseError, Result};

use crate::db::{Database, SessionRow, StorageExt, SESSION_COLUMNS};

/// Fresh identifiers tried before a collision is reported.
const MAX_ID_ATTEMPTS: usize = 5;

/// Owns session records and their lifecycle transitions.
///
/// Every mutation is one `UPDATE` keyed by session id, so independent
/// sessions never contend beyond the shared connection lock.
#[derive(Clone)]
pub struct SessionRegistry {
    db: Database,
}

impl SessionRegistry {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Register a new session for the uploaded artifact `file_name` and
    /// return its identifier.
    ///
    /// Identifier collisions are retried with a fresh id; only after
    /// repeated collisions does this fail with [`PulseError::DuplicateId`].
    pub fn create_session(&self, file_name: &str) -> Result<String> {
        self.create_session_with(file_name, || Uuid::new_v4().to_string())
    }

    fn create_session_with(
        &self,
        file_name: &str,
        mut next_id: impl FnMut() -> String,
    ) -> Result<String> {
        let now = to_storage(&Utc::now());
        let mut last = String::new();

        for _ in 0..MAX_ID_ATTEMPTS {
            let id = next_id();
            let inserted = self.db.with_conn(|conn| {
                let res = conn.execute(
                    "INSERT INTO sessions (session_id, file_name, created_at, updated_at, is_active)
                     VALUES (?1, ?2, ?3, ?3, 0)",
                    params![id, file_name, now],
                );
                match res {
                    Ok(_) => Ok(true),
                    Err(rusqlite::Error::SqliteFailure(e, _))
                        if e.code == ErrorCode::ConstraintViolation =>
                    {
                        Ok(false)
                    }
                    Err(e) => Err(PulseError::storage(e)),
                }
            })?;

            if inserted {
                info!(session_id = %id, file_name, "session created");
                return Ok(id);
            }
            warn!(session_id = %id, "session id collision, retrying");
            last = id;
        }

        Err(PulseError::DuplicateId(last))
    }

    /// Look up one session.
    pub fn get_session(&self, id: &str) -> Result<Session> {
        let row = self.db.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE session_id = ?1"),
                params![id],
                SessionRow::read,
            )
            .optional()
            .storage()
        })?;
        row.ok_or_else(|| PulseError::SessionNotFound(id.to_string()))?
            .into_session()
    }

    /// Set the start time and mark the session active.
    ///
    /// Re-starting an already active session overwrites the start time.
    /// Any previous end time is cleared so the window is open again.
    pub fn mark_monitoring_started(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        let changed = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE sessions
                 SET monitoring_started = ?2, monitoring_ended = NULL, is_active = 1, updated_at = ?3
                 WHERE session_id = ?1",
                params![id, to_storage(&at), to_storage(&Utc::now())],
            )
            .storage()
        })?;
        if changed == 0 {
            return Err(PulseError::SessionNotFound(id.to_string()));
        }
        debug!(session_id = %id, started = %at, "monitoring started");
        Ok(())
    }

    /// Set the end time and mark the session inactive.
    ///
    /// The stored end is clamped so it is never earlier than the start.
    pub fn mark_monitoring_ended(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        let changed = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE sessions
                 SET monitoring_ended = CASE
                         WHEN monitoring_started IS NOT NULL AND monitoring_started > ?2
                         THEN monitoring_started
                         ELSE ?2
                     END,
                     is_active = 0,
                     updated_at = ?3
                 WHERE session_id = ?1",
                params![id, to_storage(&at), to_storage(&Utc::now())],
            )
            .storage()
        })?;
        if changed == 0 {
            return Err(PulseError::SessionNotFound(id.to_string()));
        }
        debug!(session_id = %id, ended = %at, "monitoring ended");
        Ok(())
    }

    /// All active sessions, oldest start first.
    pub fn list_active_sessions(&self) -> Result<Vec<Session>> {
        let rows = self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {SESSION_COLUMNS} FROM sessions
                     WHERE is_active = 1
                     ORDER BY monitoring_started ASC, session_id ASC"
                ))
                .storage()?;
            let rows = stmt
                .query_map([], SessionRow::read)
                .storage()?
                .collect::<rusqlite::Result<Vec<_>>>()
                .storage()?;
            Ok(rows)
        })?;
        rows.into_iter().map(SessionRow::into_session).collect()
    }

    pub fn count_active_sessions(&self) -> Result<u64> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM sessions WHERE is_active = 1",
                [],
                |r| r.get::<_, i64>(0),
            )
            .map(|n| n as u64)
            .storage()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(Database::open_in_memory().unwrap())
    }

    #[test]
    fn test_create_and_get_session() {
        let reg = registry();
        let id = reg.create_session("a.exe").unwrap();
        let s = reg.get_session(&id).unwrap();
        assert_eq!(s.id, id);
        assert_eq!(s.file_name, "a.exe");
        assert!(!s.is_active);
        assert!(s.monitoring_started.is_none());
        assert!(s.monitoring_ended.is_none());
    }

    #[test]
    fn test_get_missing_session() {
        let reg = registry();
        assert!(matches!(
            reg.get_session("nope"),
            Err(PulseError::SessionNotFound(id)) if id == "nope"
        ));
    }

    #[test]
    fn test_create_session_retries_on_collision() {
        let reg = registry();
        reg.create_session_with("a.exe", || "fixed".to_string())
            .unwrap();

        let mut ids = vec!["fixed".to_string(), "fresh".to_string()].into_iter();
        let id = reg
            .create_session_with("b.exe", || ids.next().unwrap())
            .unwrap();
        assert_eq!(id, "fresh");
        assert_eq!(reg.get_session("fresh").unwrap().file_name, "b.exe");
    }

    #[test]
    fn test_create_session_gives_up_after_repeated_collisions() {
        let reg = registry();
        reg.create_session_with("a.exe", || "fixed".to_string())
            .unwrap();
        let result = reg.create_session_with("b.exe", || "fixed".to_string());
        assert!(matches!(result, Err(PulseError::DuplicateId(id)) if id == "fixed"));
    }

    #[test]
    fn test_start_then_end_lifecycle() {
        let reg = registry();
        let id = reg.create_session("a.exe").unwrap();
        let start = Utc::now();

        reg.mark_monitoring_started(&id, start).unwrap();
        let s = reg.get_session(&id).unwrap();
        assert!(s.is_active);
        assert!(s.monitoring_ended.is_none());

        let end = start + Duration::seconds(5);
        reg.mark_monitoring_ended(&id, end).unwrap();
        let s = reg.get_session(&id).unwrap();
        assert!(!s.is_active);
        assert!(s.monitoring_ended.unwrap() >= s.monitoring_started.unwrap());
    }

    #[test]
    fn test_end_before_start_is_clamped() {
        let reg = registry();
        let id = reg.create_session("a.exe").unwrap();
        let start = Utc::now();
        reg.mark_monitoring_started(&id, start).unwrap();
        reg.mark_monitoring_ended(&id, start - Duration::seconds(30))
            .unwrap();

        let s = reg.get_session(&id).unwrap();
        assert_eq!(s.monitoring_ended, s.monitoring_started);
    }

    #[test]
    fn test_restart_overwrites_start_and_reopens_window() {
        let reg = registry();
        let id = reg.create_session("a.exe").unwrap();
        let first = Utc::now();
        reg.mark_monitoring_started(&id, first).unwrap();
        reg.mark_monitoring_ended(&id, first + Duration::seconds(1))
            .unwrap();

        let second = first + Duration::seconds(10);
        reg.mark_monitoring_started(&id, second).unwrap();
        let s = reg.get_session(&id).unwrap();
        assert!(s.is_active);
        assert!(s.monitoring_ended.is_none());
        assert_eq!(
            to_storage(&s.monitoring_started.unwrap()),
            to_storage(&second)
        );
    }

    #[test]
    fn test_transitions_on_missing_session() {
        let reg = registry();
        assert!(matches!(
            reg.mark_monitoring_started("ghost", Utc::now()),
            Err(PulseError::SessionNotFound(_))
        ));
        assert!(matches!(
            reg.mark_monitoring_ended("ghost", Utc::now()),
            Err(PulseError::SessionNotFound(_))
        ));
    }

    #[test]
    fn test_list_active_sessions() {
        let reg = registry();
        let a = reg.create_session("a.exe").unwrap();
        let b = reg.create_session("b.exe").unwrap();
        let _idle = reg.create_session("c.exe").unwrap();
        let now = Utc::now();

        reg.mark_monitoring_started(&b, now).unwrap();
        reg.mark_monitoring_started(&a, now + Duration::seconds(1))
            .unwrap();

        let active: Vec<String> = reg
            .list_active_sessions()
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(active, vec![b.clone(), a.clone()]);
        assert_eq!(reg.count_active_sessions().unwrap(), 2);

        reg.mark_monitoring_ended(&b, now + Duration::seconds(2))
            .unwrap();
        assert_eq!(reg.count_active_sessions().unwrap(), 1);
    }
}
