use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::params;
use tracing::debug;

use pulse_core::models::{DeliveryState, Event, EventStats, Session};
use pulse_core::time_utils::to_storage;
use pulse_core::{PulseError, Result};

use crate::db::{collect_events, Database, StorageExt, EVENT_COLUMNS};

/// Poll-based batch retrieval of not-yet-delivered events.
///
/// The queue only reads events and moves their delivery state forward; it
/// never creates or deletes rows.
#[derive(Clone)]
pub struct EventDeliveryQueue {
    db: Database,
}

/// Events eligible for hand-out: pending, or leased with an expired lease.
const ELIGIBLE: &str = "(delivery_state = 'pending' \
     OR (delivery_state = 'leased' AND lease_expires_at <= ?1))";

impl EventDeliveryQueue {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Up to `limit` oldest undelivered events, flipped to delivered in the
    /// same transaction that selects them.
    ///
    /// Delivery is committed before the caller sees the batch, so an event
    /// is never returned twice.
    pub fn fetch_undelivered(&self, limit: usize) -> Result<Vec<Event>> {
        self.fetch_undelivered_at(limit, Utc::now())
    }

    pub fn fetch_undelivered_at(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<Event>> {
        let events = self.claim(limit, now, DeliveryState::Delivered, None)?;
        if !events.is_empty() {
            debug!(count = events.len(), "delivered event batch");
        }
        Ok(events)
    }

    /// Lease up to `limit` oldest undelivered events for `visibility`.
    ///
    /// Leased events are invisible to other fetches until the lease expires;
    /// [`acknowledge`](Self::acknowledge) makes delivery permanent.
    pub fn lease_undelivered(&self, limit: usize, visibility: Duration) -> Result<Vec<Event>> {
        self.lease_undelivered_at(limit, visibility, Utc::now())
    }

    pub fn lease_undelivered_at(
        &self,
        limit: usize,
        visibility: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<Event>> {
        let visibility = chrono::Duration::from_std(visibility)
            .map_err(|_| PulseError::InvalidRequest("visibility timeout too large".to_string()))?;
        let expires = now + visibility;
        let events = self.claim(limit, now, DeliveryState::Leased, Some(expires))?;
        if !events.is_empty() {
            debug!(count = events.len(), expires = %expires, "leased event batch");
        }
        Ok(events)
    }

    /// Mark the given leased events delivered. Returns how many changed
    /// state; unknown, pending or already delivered ids are ignored.
    pub fn acknowledge(&self, ids: &[i64]) -> Result<usize> {
        self.acknowledge_at(ids, Utc::now())
    }

    pub fn acknowledge_at(&self, ids: &[i64], now: DateTime<Utc>) -> Result<usize> {
        let now = to_storage(&now);
        let changed = self.db.with_conn(|conn| {
            let tx = conn.transaction().storage()?;
            let mut changed = 0;
            {
                let mut stmt = tx
                    .prepare(
                        "UPDATE events
                         SET delivery_state = 'delivered', lease_expires_at = NULL, updated_at = ?2
                         WHERE id = ?1 AND delivery_state = 'leased'",
                    )
                    .storage()?;
                for id in ids {
                    changed += stmt.execute(params![id, now]).storage()?;
                }
            }
            tx.commit().storage()?;
            Ok(changed)
        })?;
        debug!(requested = ids.len(), changed, "acknowledged events");
        Ok(changed)
    }

    /// Select-and-transition in one transaction.
    fn claim(
        &self,
        limit: usize,
        now: DateTime<Utc>,
        to: DeliveryState,
        lease_expires: Option<DateTime<Utc>>,
    ) -> Result<Vec<Event>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let now_s = to_storage(&now);
        let expires_s = lease_expires.as_ref().map(to_storage);

        let mut events = self.db.with_conn(|conn| {
            let tx = conn.transaction().storage()?;
            let events = {
                let mut select = tx
                    .prepare(&format!(
                        "SELECT {EVENT_COLUMNS} FROM events
                         WHERE {ELIGIBLE}
                         ORDER BY timestamp ASC, id ASC
                         LIMIT ?2"
                    ))
                    .storage()?;
                let events = collect_events(&mut select, params![now_s, limit as i64])?;

                let mut update = tx
                    .prepare(
                        "UPDATE events
                         SET delivery_state = ?2, lease_expires_at = ?3, updated_at = ?4
                         WHERE id = ?1",
                    )
                    .storage()?;
                for event in &events {
                    update
                        .execute(params![event.id, to.as_str(), expires_s, now_s])
                        .storage()?;
                }
                events
            };
            tx.commit().storage()?;
            Ok(events)
        })?;

        for event in &mut events {
            event.delivery_state = to;
            event.updated_at = now;
        }
        Ok(events)
    }

    /// Page through the full history, newest first, regardless of delivery
    /// state. No side effects.
    pub fn export_all(&self, offset: usize, limit: usize) -> Result<Vec<Event>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {EVENT_COLUMNS} FROM events
                     ORDER BY timestamp DESC, id DESC
                     LIMIT ?1 OFFSET ?2"
                ))
                .storage()?;
            collect_events(&mut stmt, params![limit as i64, offset as i64])
        })
    }

    /// Events with `start <= timestamp <= end`, oldest first.
    pub fn events_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Event>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {EVENT_COLUMNS} FROM events
                     WHERE timestamp >= ?1 AND timestamp <= ?2
                     ORDER BY timestamp ASC, id ASC
                     LIMIT ?3"
                ))
                .storage()?;
            collect_events(
                &mut stmt,
                params![to_storage(&start), to_storage(&end), limit as i64],
            )
        })
    }

    /// Events inside the session's monitoring window, boundaries included.
    ///
    /// Covers events attributed to the session and unattributed ones; an
    /// active session's window is open-ended. A session that never started
    /// has an empty window.
    pub fn events_in_window(&self, session: &Session) -> Result<Vec<Event>> {
        let Some((start, end)) = session.window() else {
            return Ok(Vec::new());
        };
        let end = end.as_ref().map(to_storage);

        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {EVENT_COLUMNS} FROM events
                     WHERE (session_id = ?1 OR session_id IS NULL)
                       AND timestamp >= ?2
                       AND (?3 IS NULL OR timestamp <= ?3)
                     ORDER BY timestamp ASC, id ASC"
                ))
                .storage()?;
            collect_events(&mut stmt, params![session.id, to_storage(&start), end])
        })
    }

    pub fn stats(&self) -> Result<EventStats> {
        self.db.with_conn(|conn| {
            let (total, sent): (i64, i64) = conn
                .query_row(
                    "SELECT COUNT(*),
                            COALESCE(SUM(CASE WHEN delivery_state = 'delivered' THEN 1 ELSE 0 END), 0)
                     FROM events",
                    [],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .storage()?;
            Ok(EventStats {
                total_events: total as u64,
                unsent_events: (total - sent) as u64,
                sent_events: sent as u64,
            })
        })
    }
}
