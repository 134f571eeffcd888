use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PulseError;
use crate::events::EventKind;

/// Source tag stored on events produced by the HTTP interceptor.
pub const HTTP_INTERCEPTOR_SOURCE: &str = "http-interceptor";

/// Source tag stored on events produced by the raw network interceptor.
pub const NETWORK_INTERCEPTOR_SOURCE: &str = "network-interceptor";

// ── Session ───────────────────────────────────────────────────────────────────

/// One monitoring engagement scoped to one uploaded artifact.
///
/// `is_active` is true exactly when `monitoring_started` is set and
/// `monitoring_ended` is not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Opaque unique token.
    #[serde(rename = "sessionId")]
    pub id: String,
    /// Name of the target artifact uploaded with the session.
    pub file_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitoring_started: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitoring_ended: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_active: bool,
}

impl Session {
    /// The monitoring window as `(start, end)`; `end` is `None` while the
    /// session is still active. Returns `None` if monitoring never started.
    pub fn window(&self) -> Option<(DateTime<Utc>, Option<DateTime<Utc>>)> {
        self.monitoring_started
            .map(|start| (start, self.monitoring_ended))
    }

    /// `true` when `ts` falls inside the monitoring window, boundaries
    /// included.
    pub fn window_contains(&self, ts: DateTime<Utc>) -> bool {
        match self.window() {
            None => false,
            Some((start, None)) => ts >= start,
            Some((start, Some(end))) => ts >= start && ts <= end,
        }
    }
}

// ── Event ─────────────────────────────────────────────────────────────────────

/// Delivery state of a stored event.
///
/// Transitions only move forward: `Pending → Leased → Delivered` or
/// `Pending → Delivered`. An expired lease makes a `Leased` event eligible
/// again, but a `Delivered` event is never handed out twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    Pending,
    Leased,
    Delivered,
}

impl DeliveryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryState::Pending => "pending",
            DeliveryState::Leased => "leased",
            DeliveryState::Delivered => "delivered",
        }
    }
}

impl FromStr for DeliveryState {
    type Err = PulseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeliveryState::Pending),
            "leased" => Ok(DeliveryState::Leased),
            "delivered" => Ok(DeliveryState::Delivered),
            other => Err(PulseError::storage_msg(format!(
                "unknown delivery state: {other}"
            ))),
        }
    }
}

/// A stored, normalized observation.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Auto-incrementing row identifier.
    pub id: i64,
    /// Owning session, when it could be recovered from the payload.
    pub session_id: Option<String>,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    /// Which producer emitted the event.
    pub source: String,
    /// Opaque structured payload.
    pub data: Value,
    pub delivery_state: DeliveryState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Event {
    /// Projection of [`DeliveryState`] onto the boolean delivered flag.
    pub fn is_delivered(&self) -> bool {
        self.delivery_state == DeliveryState::Delivered
    }
}

impl Serialize for Event {
    /// Frontend shape: `event_type` discriminant plus both the boolean
    /// `isSent` flag and the full `deliveryState`.
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;

        let mut st = serializer.serialize_struct("Event", 10)?;
        st.serialize_field("id", &self.id)?;
        st.serialize_field("sessionId", &self.session_id)?;
        st.serialize_field("event_type", &self.kind)?;
        st.serialize_field("timestamp", &self.timestamp)?;
        st.serialize_field("source", &self.source)?;
        st.serialize_field("data", &self.data)?;
        st.serialize_field("isSent", &self.is_delivered())?;
        st.serialize_field("deliveryState", &self.delivery_state)?;
        st.serialize_field("createdAt", &self.created_at)?;
        st.serialize_field("updatedAt", &self.updated_at)?;
        st.end()
    }
}

/// Insert form of an [`Event`]; the store assigns id, state and bookkeeping
/// times.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub session_id: Option<String>,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub data: Value,
}

/// Aggregate counters over the event table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventStats {
    pub total_events: u64,
    pub unsent_events: u64,
    pub sent_events: u64,
}

// ── Monitor modes ─────────────────────────────────────────────────────────────

/// Strategy used to select which process(es) to instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MonitorMode {
    /// Enumerate and attach to every process, optionally filtered by name.
    AttachAll,
    /// Attach to an explicit PID set.
    AttachSpecific,
    /// Spawn the session's artifact suspended, attach, then resume.
    SpawnUploaded,
}

impl MonitorMode {
    pub const ALL: [MonitorMode; 3] = [
        MonitorMode::AttachAll,
        MonitorMode::AttachSpecific,
        MonitorMode::SpawnUploaded,
    ];

    /// Numeric identifier used on the wire by the frontend.
    pub fn id(&self) -> u8 {
        match self {
            MonitorMode::AttachAll => 1,
            MonitorMode::AttachSpecific => 2,
            MonitorMode::SpawnUploaded => 3,
        }
    }

    pub fn from_id(id: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|m| i64::from(m.id()) == id)
    }

    /// Human-readable label shown in the frontend's mode picker.
    pub fn label(&self) -> &'static str {
        match self {
            MonitorMode::AttachAll => "All Processes",
            MonitorMode::AttachSpecific => "Specific Processes",
            MonitorMode::SpawnUploaded => "Spawn Uploaded",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MonitorMode::AttachAll => "attach-all",
            MonitorMode::AttachSpecific => "attach-specific",
            MonitorMode::SpawnUploaded => "spawn-uploaded",
        }
    }
}

impl fmt::Display for MonitorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MonitorMode {
    type Err = PulseError;

    /// Accepts the kebab-case name, a short alias, or the numeric id.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "attach-all" | "all" | "1" => Ok(MonitorMode::AttachAll),
            "attach-specific" | "specific" | "2" => Ok(MonitorMode::AttachSpecific),
            "spawn-uploaded" | "spawn" | "3" => Ok(MonitorMode::SpawnUploaded),
            other => Err(PulseError::InvalidMode(other.to_string())),
        }
    }
}

/// One entry of the `monitor-modes` listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorModeEntry {
    pub id: u8,
    pub mode: String,
}

/// The set of monitor modes a deployment allows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnabledModes {
    modes: Vec<MonitorMode>,
}

impl EnabledModes {
    pub fn new(modes: impl IntoIterator<Item = MonitorMode>) -> Self {
        let mut modes: Vec<MonitorMode> = modes.into_iter().collect();
        modes.sort();
        modes.dedup();
        Self { modes }
    }

    pub fn all() -> Self {
        Self::new(MonitorMode::ALL)
    }

    pub fn contains(&self, mode: MonitorMode) -> bool {
        self.modes.contains(&mode)
    }

    pub fn modes(&self) -> &[MonitorMode] {
        &self.modes
    }

    /// Listing shown to the frontend; only enabled modes appear.
    pub fn entries(&self) -> Vec<MonitorModeEntry> {
        self.modes
            .iter()
            .map(|m| MonitorModeEntry {
                id: m.id(),
                mode: m.label().to_string(),
            })
            .collect()
    }
}

impl Default for EnabledModes {
    /// Only the explicit-PID mode is on unless configured otherwise.
    fn default() -> Self {
        Self::new([MonitorMode::AttachSpecific])
    }
}

// ── Processes ─────────────────────────────────────────────────────────────────

/// A running process as shown in the frontend's process picker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessDescriptor {
    pub pid: u32,
    pub name: String,
}

// ── Ingestion wire types ──────────────────────────────────────────────────────

/// Generic ingestion envelope posted to `POST events`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestEnvelope {
    pub event_type: String,
    /// RFC 3339 timestamp string.
    pub timestamp: String,
    pub source: String,
    #[serde(default)]
    pub data: Value,
}

/// Captured HTTP request/response pair posted to `POST http/events`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpTransaction {
    /// Capture time in milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub client: Value,
    #[serde(default)]
    pub server: Option<HttpPeer>,
    #[serde(default)]
    pub request: Option<HttpRequest>,
    #[serde(default)]
    pub response: Option<HttpResponse>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpPeer {
    #[serde(default)]
    pub ip: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpRequest {
    pub method: String,
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub url: String,
    pub http_version: String,
    pub headers: std::collections::BTreeMap<String, String>,
    pub body: Option<HttpBody>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpResponse {
    pub status_code: u16,
    pub reason: String,
    pub http_version: String,
    pub headers: std::collections::BTreeMap<String, String>,
    pub body: Option<HttpBody>,
}

/// A possibly-truncated message body, either as text or base64.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpBody {
    #[serde(rename = "type")]
    pub body_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_b64: Option<String>,
    pub size: u64,
    pub truncated: bool,
}

/// Batch of captured frames posted to `POST net/events`; fans out into one
/// stored event per frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkBatch {
    #[serde(default)]
    pub events: Vec<NetworkFrame>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkFrame {
    /// Capture time in (fractional) seconds since the Unix epoch.
    pub timestamp: f64,
    #[serde(default)]
    pub frame_number: u64,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub src: String,
    #[serde(default)]
    pub dst: String,
    #[serde(default)]
    pub src_port: Option<u16>,
    #[serde(default)]
    pub dst_port: Option<u16>,
    #[serde(default)]
    pub length: u64,
    #[serde(default)]
    pub info: String,
    #[serde(default)]
    pub info_raw: String,
}
