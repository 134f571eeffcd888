use std::sync::Arc;

use chrono::Utc;
use rusqlite::params;
use serde_json::Value;
use tracing::{debug, warn};

use pulse_core::events::EventKind;
use pulse_core::models::{
    DeliveryState, Event, HttpTransaction, IngestEnvelope, NetworkBatch, NetworkFrame, NewEvent,
    HTTP_INTERCEPTOR_SOURCE, NETWORK_INTERCEPTOR_SOURCE,
};
use pulse_core::time_utils::{
    ensure_storable, from_epoch_millis, from_epoch_secs_f64, to_storage, TimestampParser,
};
use pulse_core::{PulseError, Result};

use crate::db::{Database, StorageExt};

/// Accepts normalized events from producers and persists them.
///
/// Session association is best-effort: an event whose session cannot be
/// recovered is stored with an empty session reference, never rejected.
#[derive(Clone)]
pub struct EventIngestionService {
    db: Database,
    timestamps: Arc<TimestampParser>,
}

impl EventIngestionService {
    pub fn new(db: Database, timestamps: TimestampParser) -> Self {
        Self {
            db,
            timestamps: Arc::new(timestamps),
        }
    }

    /// Persist one event in the `pending` state.
    ///
    /// Every ingestion path funnels through here.
    pub fn create_event(&self, event: NewEvent) -> Result<Event> {
        ensure_storable(event.timestamp)?;
        let now = Utc::now();
        let data = serde_json::to_string(&event.data)?;

        let id = self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO events
                     (session_id, event_type, timestamp, source, data, delivery_state,
                      created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                params![
                    event.session_id,
                    event.kind.as_str(),
                    to_storage(&event.timestamp),
                    event.source,
                    data,
                    DeliveryState::Pending.as_str(),
                    to_storage(&now),
                ],
            )
            .storage()?;
            Ok(conn.last_insert_rowid())
        })?;

        debug!(
            id,
            kind = %event.kind,
            session_id = event.session_id.as_deref().unwrap_or(""),
            "event stored"
        );

        Ok(Event {
            id,
            session_id: event.session_id,
            kind: event.kind,
            timestamp: event.timestamp,
            source: event.source,
            data: event.data,
            delivery_state: DeliveryState::Pending,
            created_at: now,
            updated_at: now,
        })
    }

    /// Ingest a generic envelope. The session is read from
    /// `data.metadata.sessionId` when present.
    pub fn ingest_generic(&self, envelope: IngestEnvelope) -> Result<Event> {
        if envelope.event_type.trim().is_empty() {
            return Err(PulseError::InvalidRequest("event_type is required".to_string()));
        }
        if envelope.source.trim().is_empty() {
            return Err(PulseError::InvalidRequest("source is required".to_string()));
        }

        let timestamp = self.timestamps.parse(&envelope.timestamp)?;
        let session_id = session_from_payload(&envelope.data);

        self.create_event(NewEvent {
            session_id,
            kind: EventKind::parse(&envelope.event_type),
            timestamp,
            source: envelope.source,
            data: envelope.data,
        })
    }

    /// Ingest one captured HTTP request/response pair. The stored timestamp
    /// is the transaction's own millisecond timestamp.
    pub fn ingest_http_transaction(
        &self,
        transaction: HttpTransaction,
        session_id: Option<&str>,
    ) -> Result<Event> {
        let timestamp = from_epoch_millis(transaction.timestamp_ms)?;
        let data = serde_json::to_value(&transaction)?;

        self.create_event(NewEvent {
            session_id: non_empty(session_id),
            kind: EventKind::HttpNetworkOperation,
            timestamp,
            source: HTTP_INTERCEPTOR_SOURCE.to_string(),
            data,
        })
    }

    /// Fan a batch of captured frames out into one stored event per frame.
    ///
    /// Stops at the first failure. Frames already persisted stay committed
    /// and the failure is reported as [`PulseError::PartialFailure`] with the
    /// count of persisted frames; a failure on the first frame is returned
    /// as is.
    pub fn ingest_network_batch(
        &self,
        batch: NetworkBatch,
        session_id: Option<&str>,
    ) -> Result<Vec<Event>> {
        let session_id = non_empty(session_id);
        let mut stored = Vec::with_capacity(batch.events.len());

        for frame in batch.events {
            match self.ingest_frame(frame, session_id.clone()) {
                Ok(event) => stored.push(event),
                Err(e) if stored.is_empty() => return Err(e),
                Err(e) => {
                    warn!(persisted = stored.len(), error = %e, "network batch stopped part way");
                    return Err(PulseError::PartialFailure {
                        persisted: stored.len(),
                        source: Box::new(e),
                    });
                }
            }
        }

        Ok(stored)
    }

    fn ingest_frame(&self, frame: NetworkFrame, session_id: Option<String>) -> Result<Event> {
        let timestamp = from_epoch_secs_f64(frame.timestamp)?;
        let data = serde_json::to_value(&frame)?;
        self.create_event(NewEvent {
            session_id,
            kind: EventKind::RawNetworkOperation,
            timestamp,
            source: NETWORK_INTERCEPTOR_SOURCE.to_string(),
            data,
        })
    }
}

/// `data.metadata.sessionId`, if present and non-empty.
fn session_from_payload(data: &Value) -> Option<String> {
    data.get("metadata")
        .and_then(|m| m.get("sessionId"))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn non_empty(session_id: Option<&str>) -> Option<String> {
    session_id
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    use crate::delivery::EventDeliveryQueue;

    fn service() -> (EventIngestionService, EventDeliveryQueue) {
        let db = Database::open_in_memory().unwrap();
        (
            EventIngestionService::new(db.clone(), TimestampParser::default()),
            EventDeliveryQueue::new(db),
        )
    }

    fn frame(ts: f64) -> NetworkFrame {
        NetworkFrame {
            timestamp: ts,
            frame_number: 1,
            protocol: "TCP".to_string(),
            src: "10.0.0.1".to_string(),
            dst: "10.0.0.2".to_string(),
            src_port: Some(50000),
            dst_port: Some(443),
            length: 60,
            info: String::new(),
            info_raw: String::new(),
        }
    }

    #[test]
    fn test_ingest_generic_file_operation() {
        let (svc, queue) = service();
        let event = svc
            .ingest_generic(IngestEnvelope {
                event_type: "file_operation".to_string(),
                timestamp: "2024-01-01T00:00:00Z".to_string(),
                source: "test".to_string(),
                data: json!({"filePath": "C:\\f.txt", "bytesTransferred": 10}),
            })
            .unwrap();

        assert_eq!(event.kind, EventKind::FileOperation);
        assert!(!event.is_delivered());
        assert!(event.session_id.is_none());

        let all = queue.export_all(0, 100).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].kind, EventKind::FileOperation);
        assert_eq!(all[0].delivery_state, DeliveryState::Pending);
        assert_eq!(
            all[0].timestamp,
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(all[0].data["bytesTransferred"], 10);
    }

    #[test]
    fn test_ingest_generic_recovers_session_from_metadata() {
        let (svc, _) = service();
        let event = svc
            .ingest_generic(IngestEnvelope {
                event_type: "process_creation".to_string(),
                timestamp: "2024-01-01T00:00:00Z".to_string(),
                source: "relay".to_string(),
                data: json!({"metadata": {"sessionId": "sess-9"}}),
            })
            .unwrap();
        assert_eq!(event.session_id.as_deref(), Some("sess-9"));
    }

    #[test]
    fn test_ingest_generic_unknown_kind_is_stored() {
        let (svc, _) = service();
        let event = svc
            .ingest_generic(IngestEnvelope {
                event_type: "beacon".to_string(),
                timestamp: "2024-01-01T00:00:00Z".to_string(),
                source: "relay".to_string(),
                data: json!({}),
            })
            .unwrap();
        assert_eq!(event.kind, EventKind::Unknown("beacon".to_string()));
    }

    #[test]
    fn test_ingest_generic_rejects_bad_timestamp_and_missing_fields() {
        let (svc, queue) = service();
        let bad_ts = svc.ingest_generic(IngestEnvelope {
            event_type: "pong".to_string(),
            timestamp: "whenever".to_string(),
            source: "relay".to_string(),
            data: json!({}),
        });
        assert!(matches!(bad_ts, Err(PulseError::TimestampParse(_))));

        let no_type = svc.ingest_generic(IngestEnvelope {
            event_type: " ".to_string(),
            timestamp: "2024-01-01T00:00:00Z".to_string(),
            source: "relay".to_string(),
            data: json!({}),
        });
        assert!(matches!(no_type, Err(PulseError::InvalidRequest(_))));
        assert_eq!(queue.stats().unwrap().total_events, 0);
    }

    #[test]
    fn test_ingest_http_transaction_uses_millisecond_timestamp() {
        let (svc, _) = service();
        let tx: HttpTransaction = serde_json::from_value(json!({
            "timestamp_ms": 1_700_000_000_123_i64,
            "kind": "http",
            "request": {"method": "GET", "url": "http://example.test/"},
            "response": {"status_code": 200, "reason": "OK"}
        }))
        .unwrap();

        let event = svc.ingest_http_transaction(tx, Some("sess-1")).unwrap();
        assert_eq!(event.kind, EventKind::HttpNetworkOperation);
        assert_eq!(event.source, HTTP_INTERCEPTOR_SOURCE);
        assert_eq!(event.timestamp.timestamp_millis(), 1_700_000_000_123);
        assert_eq!(event.session_id.as_deref(), Some("sess-1"));
        assert_eq!(event.data["request"]["method"], "GET");
    }

    #[test]
    fn test_ingest_http_transaction_far_future_rejected_and_queue_keeps_draining() {
        let (svc, queue) = service();
        let ok: HttpTransaction =
            serde_json::from_value(json!({"timestamp_ms": 1_700_000_000_000_i64})).unwrap();
        svc.ingest_http_transaction(ok, None).unwrap();

        let far: HttpTransaction =
            serde_json::from_value(json!({"timestamp_ms": 400_000_000_000_000_i64})).unwrap();
        let err = svc.ingest_http_transaction(far, None).unwrap_err();
        assert!(matches!(err, PulseError::TimestampParse(_)));
        assert_eq!(err.class(), pulse_core::ErrorClass::InvalidRequest);

        let batch = queue.fetch_undelivered(10).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].timestamp.timestamp_millis(), 1_700_000_000_000);
        assert!(queue.fetch_undelivered(10).unwrap().is_empty());
    }

    #[test]
    fn test_create_event_rejects_unstorable_timestamp() {
        let (svc, queue) = service();
        let far = Utc.with_ymd_and_hms(9999, 12, 31, 23, 59, 59).unwrap()
            + chrono::Duration::days(1);
        let result = svc.create_event(NewEvent {
            session_id: None,
            kind: EventKind::Pong,
            timestamp: far,
            source: "test".to_string(),
            data: json!({}),
        });
        assert!(matches!(result, Err(PulseError::TimestampParse(_))));
        assert_eq!(queue.stats().unwrap().total_events, 0);
    }

    #[test]
    fn test_ingest_http_transaction_blank_session_is_empty() {
        let (svc, _) = service();
        let tx: HttpTransaction =
            serde_json::from_value(json!({"timestamp_ms": 1_700_000_000_000_i64})).unwrap();
        let event = svc.ingest_http_transaction(tx, Some("  ")).unwrap();
        assert!(event.session_id.is_none());
    }

    #[test]
    fn test_ingest_network_batch_one_event_per_frame() {
        let (svc, queue) = service();
        let batch = NetworkBatch {
            events: vec![frame(1_700_000_000.5), frame(1_700_000_001.0), frame(1_700_000_002.25)],
        };

        let stored = svc.ingest_network_batch(batch, None).unwrap();
        assert_eq!(stored.len(), 3);
        assert!(stored
            .iter()
            .all(|e| e.kind == EventKind::RawNetworkOperation));
        assert_eq!(stored[0].timestamp.timestamp_millis(), 1_700_000_000_500);
        assert_eq!(stored[2].timestamp.timestamp_millis(), 1_700_000_002_250);
        assert_eq!(queue.stats().unwrap().total_events, 3);
    }

    #[test]
    fn test_ingest_network_batch_partial_failure_keeps_prefix() {
        let (svc, queue) = service();
        let batch = NetworkBatch {
            events: vec![frame(1_700_000_000.0), frame(1_700_000_001.0), frame(f64::NAN), frame(1_700_000_003.0)],
        };

        let err = svc.ingest_network_batch(batch, None).unwrap_err();
        match err {
            PulseError::PartialFailure { persisted, source } => {
                assert_eq!(persisted, 2);
                assert!(matches!(*source, PulseError::TimestampParse(_)));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        // No rollback of the committed prefix.
        assert_eq!(queue.stats().unwrap().total_events, 2);
    }

    #[test]
    fn test_ingest_network_batch_first_frame_failure_is_plain_error() {
        let (svc, _) = service();
        let batch = NetworkBatch {
            events: vec![frame(f64::INFINITY)],
        };
        assert!(matches!(
            svc.ingest_network_batch(batch, None),
            Err(PulseError::TimestampParse(_))
        ));
    }

    #[test]
    fn test_ingest_network_batch_empty() {
        let (svc, _) = service();
        let stored = svc
            .ingest_network_batch(NetworkBatch { events: vec![] }, None)
            .unwrap();
        assert!(stored.is_empty());
    }
}
