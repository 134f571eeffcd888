use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use pulse_core::models::{HttpTransaction, IngestEnvelope, NetworkBatch};
use pulse_core::{PulseError, Result};
use pulse_store::EventIngestionService;

/// One routed event in the shape its ingestion entry point takes.
///
/// Captured HTTP transactions and frame batches keep their own timestamps
/// and go through the dedicated entry points, so a batch still fans out
/// into one stored event per frame.
#[derive(Debug, Clone)]
pub enum Outbound {
    Generic(IngestEnvelope),
    Http {
        transaction: Box<HttpTransaction>,
        session_id: Option<String>,
    },
    Network {
        batch: NetworkBatch,
        session_id: Option<String>,
    },
}

impl Outbound {
    pub fn event_type(&self) -> &str {
        match self {
            Outbound::Generic(envelope) => &envelope.event_type,
            Outbound::Http { .. } => "http_network_operation",
            Outbound::Network { .. } => "raw_network_operation",
        }
    }
}

impl From<IngestEnvelope> for Outbound {
    fn from(envelope: IngestEnvelope) -> Self {
        Outbound::Generic(envelope)
    }
}

/// Where routed events go.
#[derive(Clone)]
pub enum Forwarder {
    /// Routed events are rendered but not persisted.
    Disabled,
    /// Persist through an in-process ingestion service.
    Local(EventIngestionService),
    /// POST to a remote ingestion service.
    Http(HttpForwarder),
}

impl Forwarder {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Forwarder::Disabled)
    }

    /// Hand one event to ingestion.
    pub async fn forward(&self, outbound: impl Into<Outbound>) -> Result<()> {
        let outbound = outbound.into();
        match self {
            Forwarder::Disabled => Ok(()),
            Forwarder::Local(service) => {
                let service = service.clone();
                let stored = tokio::task::spawn_blocking(move || ingest_locally(&service, outbound))
                    .await
                    .map_err(|e| PulseError::Other(anyhow::anyhow!("ingestion task failed: {e}")))??;
                debug!(stored, "forwarded locally");
                Ok(())
            }
            Forwarder::Http(http) => http.post(&outbound).await,
        }
    }
}

/// Returns how many events were stored.
fn ingest_locally(service: &EventIngestionService, outbound: Outbound) -> Result<usize> {
    match outbound {
        Outbound::Generic(envelope) => service.ingest_generic(envelope).map(|_| 1),
        Outbound::Http {
            transaction,
            session_id,
        } => service
            .ingest_http_transaction(*transaction, session_id.as_deref())
            .map(|_| 1),
        Outbound::Network { batch, session_id } => service
            .ingest_network_batch(batch, session_id.as_deref())
            .map(|events| events.len()),
    }
}

/// Client for a remote ingestion service: `POST /events`, `/http/events`
/// and `/net/events` under one base URL.
#[derive(Clone)]
pub struct HttpForwarder {
    client: reqwest::Client,
    base: String,
    url: String,
}

impl HttpForwarder {
    /// `endpoint` is the ingestion base URL; `/events` is appended.
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PulseError::Config(format!("failed to build HTTP client: {e}")))?;
        let base = endpoint.trim_end_matches('/').to_string();
        Ok(Self {
            client,
            url: format!("{base}/events"),
            base,
        })
    }

    /// Target for generic events.
    pub fn url(&self) -> &str {
        &self.url
    }

    async fn post(&self, outbound: &Outbound) -> Result<()> {
        match outbound {
            Outbound::Generic(envelope) => self.send(&self.url, None, envelope).await,
            Outbound::Http {
                transaction,
                session_id,
            } => {
                let url = format!("{}/http/events", self.base);
                self.send(&url, session_id.as_deref(), transaction).await
            }
            Outbound::Network { batch, session_id } => {
                let url = format!("{}/net/events", self.base);
                self.send(&url, session_id.as_deref(), batch).await
            }
        }?;
        debug!(event_type = outbound.event_type(), "forwarded over HTTP");
        Ok(())
    }

    async fn send<T: Serialize + ?Sized>(
        &self,
        url: &str,
        session_id: Option<&str>,
        body: &T,
    ) -> Result<()> {
        let mut request = self.client.post(url).json(body);
        if let Some(id) = session_id {
            request = request.query(&[("sessionId", id)]);
        }
        let response = request
            .send()
            .await
            .map_err(|e| PulseError::UpstreamUnavailable(format!("POST {url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PulseError::UpstreamUnavailable(format!(
                "POST {url} returned {status}: {body}"
            )));
        }
        Ok(())
    }
}
