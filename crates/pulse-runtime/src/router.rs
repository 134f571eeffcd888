//! Instrumentation Event Router.
//!
//! One subscription per attached target. Messages are handled in arrival
//! order on the subscription's task; each forward to ingestion runs on its
//! own task so a slow endpoint never holds up the stream.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use pulse_core::events::{
    unwrap_engine_envelope, DecoderRegistry, Inbound, InstrumentationMessage,
};
use pulse_core::formatting::describe;
use pulse_core::models::IngestEnvelope;

use crate::forwarder::{Forwarder, Outbound};

/// Counters reported when a subscription ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub received: u64,
    pub forwarded: u64,
    pub dropped: u64,
}

/// Classifies observer messages, renders them and forwards a normalized copy.
#[derive(Clone)]
pub struct EventRouter {
    decoders: Arc<DecoderRegistry>,
    forwarder: Forwarder,
    source_tag: String,
}

impl EventRouter {
    pub fn new(decoders: DecoderRegistry, forwarder: Forwarder, source_tag: impl Into<String>) -> Self {
        Self {
            decoders: Arc::new(decoders),
            forwarder,
            source_tag: source_tag.into(),
        }
    }

    pub fn source_tag(&self) -> &str {
        &self.source_tag
    }

    /// Consume `messages` until the channel closes.
    pub fn subscribe(
        &self,
        session_id: String,
        pid: u32,
        mut messages: mpsc::Receiver<Value>,
    ) -> JoinHandle<RouterStats> {
        let router = self.clone();
        tokio::spawn(async move {
            let mut stats = RouterStats::default();
            while let Some(value) = messages.recv().await {
                stats.received += 1;
                match router.handle_message(&session_id, pid, value) {
                    Routed::Forwarded(_) => stats.forwarded += 1,
                    Routed::Rendered => {}
                    Routed::Dropped => stats.dropped += 1,
                }
            }
            debug!(
                session_id,
                pid,
                received = stats.received,
                forwarded = stats.forwarded,
                dropped = stats.dropped,
                "subscription closed"
            );
            stats
        })
    }

    /// Handle one inbound message.
    pub(crate) fn handle_message(&self, session_id: &str, pid: u32, value: Value) -> Routed {
        let payload = match unwrap_engine_envelope(value) {
            Inbound::Payload(payload) => payload,
            Inbound::ScriptError { description, stack } => {
                warn!(
                    session_id,
                    pid,
                    stack = stack.as_deref().unwrap_or(""),
                    "observer script error: {description}"
                );
                return Routed::Dropped;
            }
        };

        let decoded = match self.decoders.decode(payload) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(session_id, pid, error = %e, "malformed observer message dropped");
                return Routed::Dropped;
            }
        };

        info!(
            session_id,
            pid,
            kind = decoded.raw.kind.label(),
            "{}",
            describe(&decoded.message)
        );

        if !self.forwarder.is_enabled() {
            return Routed::Rendered;
        }

        let session_id = decoded
            .raw
            .session_id()
            .unwrap_or(session_id)
            .to_string();
        let outbound = match decoded.message {
            InstrumentationMessage::HttpTransaction(transaction) => Outbound::Http {
                transaction,
                session_id: Some(session_id),
            },
            InstrumentationMessage::NetworkBatch(batch) => Outbound::Network {
                batch,
                session_id: Some(session_id),
            },
            _ => Outbound::Generic(IngestEnvelope {
                event_type: decoded.raw.kind.as_str().to_string(),
                timestamp: Utc::now().to_rfc3339(),
                source: self.source_tag.clone(),
                data: decoded.raw.forward_payload(Some(&session_id)),
            }),
        };
        let forwarder = self.forwarder.clone();
        Routed::Forwarded(tokio::spawn(async move {
            let event_type = outbound.event_type().to_string();
            if let Err(e) = forwarder.forward(outbound).await {
                warn!(event_type, error = %e, "event forward failed, dropped");
            }
        }))
    }
}

/// What [`EventRouter::handle_message`] did with a message.
#[derive(Debug)]
pub(crate) enum Routed {
    /// Rendered and handed to a forward task.
    Forwarded(JoinHandle<()>),
    /// Rendered only; forwarding is off.
    Rendered,
    Dropped,
}
