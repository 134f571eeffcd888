//! Event taxonomy and instrumentation message decoding.
//!
//! Inbound instrumentation messages are free-form JSON objects carrying a
//! string discriminant. They are decoded into the closed
//! [`InstrumentationMessage`] union through a [`DecoderRegistry`] that holds
//! one decoder per known [`EventKind`]. Anything the registry cannot classify
//! becomes [`InstrumentationMessage::Unknown`] so that its data is still
//! forwarded.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{PulseError, Result};
use crate::models::{HttpTransaction, NetworkBatch};

// ── EventKind ─────────────────────────────────────────────────────────────────

/// Discriminant of a stored or in-flight event.
///
/// Unrecognised discriminants keep their original text in
/// [`EventKind::Unknown`] so they survive a store round trip.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventKind {
    SessionStart,
    FileOperation,
    ProcessCreation,
    Pong,
    StatusResponse,
    HttpNetworkOperation,
    RawNetworkOperation,
    Unknown(String),
}

impl EventKind {
    /// Wire/storage representation.
    ///
    /// ```
    /// use pulse_core::events::EventKind;
    ///
    /// assert_eq!(EventKind::FileOperation.as_str(), "file_operation");
    /// assert_eq!(EventKind::parse("beacon").as_str(), "beacon");
    /// ```
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::SessionStart => "session_start",
            EventKind::FileOperation => "file_operation",
            EventKind::ProcessCreation => "process_creation",
            EventKind::Pong => "pong",
            EventKind::StatusResponse => "status_response",
            EventKind::HttpNetworkOperation => "http_network_operation",
            EventKind::RawNetworkOperation => "raw_network_operation",
            EventKind::Unknown(raw) => raw,
        }
    }

    /// Classify a discriminant string. Never fails; an empty string maps to
    /// `Unknown("unknown")`.
    pub fn parse(s: &str) -> Self {
        match s {
            "session_start" => EventKind::SessionStart,
            "file_operation" => EventKind::FileOperation,
            "process_creation" => EventKind::ProcessCreation,
            "pong" => EventKind::Pong,
            "status_response" => EventKind::StatusResponse,
            "http_network_operation" => EventKind::HttpNetworkOperation,
            "raw_network_operation" => EventKind::RawNetworkOperation,
            "" => EventKind::Unknown("unknown".to_string()),
            other => EventKind::Unknown(other.to_string()),
        }
    }

    /// Label used when rendering for the operator; every unrecognised kind
    /// renders as `unknown`.
    pub fn label(&self) -> &str {
        match self {
            EventKind::Unknown(_) => "unknown",
            known => known.as_str(),
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, EventKind::Unknown(_))
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for EventKind {
    fn from(s: String) -> Self {
        EventKind::parse(&s)
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> Self {
        match kind {
            EventKind::Unknown(raw) => raw,
            known => known.as_str().to_string(),
        }
    }
}

// ── Typed payloads ────────────────────────────────────────────────────────────

/// Process metadata the observer script attaches to file/process messages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MessageMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_id: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionStart {
    pub session_id: Option<String>,
    pub process_name: Option<String>,
    pub process_id: Option<u32>,
    pub platform: Option<String>,
    pub arch: Option<String>,
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileOperation {
    pub file_path: Option<String>,
    pub bytes_transferred: u64,
    /// Captured content excerpt, if the observer recorded one.
    pub content: Option<String>,
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProcessCreation {
    pub image_path: Option<String>,
    pub command_line: Option<String>,
    pub current_directory: Option<String>,
    /// Native handles arrive as pointer strings or integers depending on the
    /// observer build.
    pub process_handle: Option<Value>,
    pub thread_handle: Option<Value>,
    /// NTSTATUS-style result; negative means failure.
    pub status: i64,
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StatusReport {
    pub session_id: Option<String>,
    pub process_name: Option<String>,
    pub process_id: Option<u32>,
    pub status: Option<String>,
    pub timestamp: Option<String>,
}

/// Closed union over every message kind the router understands.
#[derive(Debug, Clone, PartialEq)]
pub enum InstrumentationMessage {
    SessionStart(SessionStart),
    FileOperation {
        operation: String,
        data: FileOperation,
        metadata: MessageMetadata,
    },
    ProcessCreation {
        operation: String,
        data: ProcessCreation,
        metadata: MessageMetadata,
    },
    Pong {
        timestamp: Option<String>,
    },
    StatusResponse(StatusReport),
    HttpTransaction(Box<HttpTransaction>),
    NetworkBatch(NetworkBatch),
    /// Unrecognised discriminant, or a known one whose payload did not fit
    /// its decoder.
    Unknown {
        kind: String,
        raw: Value,
    },
}

impl InstrumentationMessage {
    pub fn kind(&self) -> EventKind {
        match self {
            InstrumentationMessage::SessionStart(_) => EventKind::SessionStart,
            InstrumentationMessage::FileOperation { .. } => EventKind::FileOperation,
            InstrumentationMessage::ProcessCreation { .. } => EventKind::ProcessCreation,
            InstrumentationMessage::Pong { .. } => EventKind::Pong,
            InstrumentationMessage::StatusResponse(_) => EventKind::StatusResponse,
            InstrumentationMessage::HttpTransaction(_) => EventKind::HttpNetworkOperation,
            InstrumentationMessage::NetworkBatch(_) => EventKind::RawNetworkOperation,
            InstrumentationMessage::Unknown { kind, .. } => EventKind::parse(kind),
        }
    }
}

// ── Raw message envelope ──────────────────────────────────────────────────────

/// What the engine delivered on an attachment channel, after stripping the
/// engine's own `{type:"send"|"error"}` wrapper.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// An observer-script message to classify.
    Payload(Value),
    /// The observer script raised; logged and dropped by the router.
    ScriptError { description: String, stack: Option<String> },
}

/// Strip the engine's delivery wrapper.
///
/// `{type:"send", payload:{…}}` yields the payload, `{type:"error", …}`
/// yields a [`Inbound::ScriptError`], anything else passes through untouched.
pub fn unwrap_engine_envelope(value: Value) -> Inbound {
    let wrapper = value.get("type").and_then(Value::as_str);
    match wrapper {
        Some("send") if value.get("payload").is_some() => {
            let payload = match value {
                Value::Object(mut map) => map.remove("payload").unwrap_or(Value::Null),
                other => other,
            };
            Inbound::Payload(payload)
        }
        Some("error") => Inbound::ScriptError {
            description: value
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or("script error")
                .to_string(),
            stack: value.get("stack").and_then(Value::as_str).map(str::to_string),
        },
        _ => Inbound::Payload(value),
    }
}

/// `{kind, operation?, data, metadata?}` as extracted from an observer
/// message before kind-specific decoding.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    pub kind: EventKind,
    pub operation: Option<String>,
    pub data: Value,
    pub metadata: Option<Value>,
    /// Top-level timestamp some kinds (`pong`) carry outside `data`.
    pub timestamp: Option<String>,
}

impl RawMessage {
    /// Extract the envelope. The discriminant is read from `type`, or from
    /// `kind` when `type` is absent.
    ///
    /// # Errors
    ///
    /// [`PulseError::InvalidRequest`] when the value is not an object or the
    /// discriminant is present but not a string.
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(mut map) = value else {
            return Err(PulseError::InvalidRequest(
                "instrumentation message is not a JSON object".to_string(),
            ));
        };

        let discriminant = match map.remove("type").or_else(|| map.remove("kind")) {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => s,
            Some(other) => {
                return Err(PulseError::InvalidRequest(format!(
                    "message discriminant is not a string: {other}"
                )))
            }
        };

        let operation = map
            .remove("operation")
            .and_then(|v| v.as_str().map(str::to_string));
        let metadata = map.remove("metadata").filter(|v| !v.is_null());
        let timestamp = map
            .get("timestamp")
            .and_then(Value::as_str)
            .map(str::to_string);
        let data = match map.remove("data") {
            Some(Value::Null) | None => Value::Object(Map::new()),
            Some(v) => v,
        };

        Ok(Self {
            kind: EventKind::parse(&discriminant),
            operation,
            data,
            metadata,
            timestamp,
        })
    }

    /// The session id carried in `metadata.sessionId`, if any.
    pub fn session_id(&self) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("sessionId"))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    /// Build the payload forwarded to ingestion: `data` with `operation` and
    /// `metadata` folded in, and `metadata.sessionId` stamped with
    /// `session_id` when the message did not carry one.
    pub fn forward_payload(&self, session_id: Option<&str>) -> Value {
        let mut data = match &self.data {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other.clone());
                map
            }
        };

        if let Some(op) = &self.operation {
            data.insert("operation".to_string(), Value::String(op.clone()));
        }

        let mut metadata = match &self.metadata {
            Some(Value::Object(m)) => m.clone(),
            _ => Map::new(),
        };
        if self.session_id().is_none() {
            if let Some(id) = session_id {
                metadata.insert("sessionId".to_string(), Value::String(id.to_string()));
            }
        }
        if !metadata.is_empty() {
            data.insert("metadata".to_string(), Value::Object(metadata));
        }

        Value::Object(data)
    }
}

// ── DecoderRegistry ───────────────────────────────────────────────────────────

/// Decodes one kind's envelope into its typed message.
pub type DecodeFn = fn(&RawMessage) -> Result<InstrumentationMessage>;

/// A decoded message together with the envelope it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub raw: RawMessage,
    pub message: InstrumentationMessage,
}

/// Kind → decoder table.
pub struct DecoderRegistry {
    decoders: HashMap<EventKind, DecodeFn>,
}

impl DecoderRegistry {
    /// A registry with no decoders; every message decodes as `Unknown`.
    pub fn empty() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Install (or replace) the decoder for `kind`.
    pub fn register(&mut self, kind: EventKind, decoder: DecodeFn) {
        self.decoders.insert(kind, decoder);
    }

    pub fn is_registered(&self, kind: &EventKind) -> bool {
        self.decoders.contains_key(kind)
    }

    /// Decode one observer message.
    ///
    /// Only a malformed envelope is an error. A kind without a decoder, or a
    /// payload its decoder rejects, yields [`InstrumentationMessage::Unknown`].
    pub fn decode(&self, value: Value) -> Result<Decoded> {
        let raw = RawMessage::from_value(value)?;
        let message = match self.decoders.get(&raw.kind) {
            Some(decoder) => match decoder(&raw) {
                Ok(message) => message,
                Err(e) => {
                    debug!(kind = %raw.kind, error = %e, "payload did not match its kind");
                    unknown(&raw)
                }
            },
            None => unknown(&raw),
        };
        Ok(Decoded { raw, message })
    }
}

impl Default for DecoderRegistry {
    /// Registry with a decoder for every known kind.
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(EventKind::SessionStart, decode_session_start);
        registry.register(EventKind::FileOperation, decode_file_operation);
        registry.register(EventKind::ProcessCreation, decode_process_creation);
        registry.register(EventKind::Pong, decode_pong);
        registry.register(EventKind::StatusResponse, decode_status_response);
        registry.register(EventKind::HttpNetworkOperation, decode_http_transaction);
        registry.register(EventKind::RawNetworkOperation, decode_network_batch);
        registry
    }
}

fn unknown(raw: &RawMessage) -> InstrumentationMessage {
    InstrumentationMessage::Unknown {
        kind: raw.kind.as_str().to_string(),
        raw: raw.data.clone(),
    }
}

fn metadata_of(raw: &RawMessage) -> Result<MessageMetadata> {
    match &raw.metadata {
        Some(v) => Ok(MessageMetadata::deserialize(v)?),
        None => Ok(MessageMetadata::default()),
    }
}

fn operation_of(raw: &RawMessage) -> String {
    raw.operation.clone().unwrap_or_else(|| "Unknown".to_string())
}

fn decode_session_start(raw: &RawMessage) -> Result<InstrumentationMessage> {
    Ok(InstrumentationMessage::SessionStart(SessionStart::deserialize(
        &raw.data,
    )?))
}

fn decode_file_operation(raw: &RawMessage) -> Result<InstrumentationMessage> {
    Ok(InstrumentationMessage::FileOperation {
        operation: operation_of(raw),
        data: FileOperation::deserialize(&raw.data)?,
        metadata: metadata_of(raw)?,
    })
}

fn decode_process_creation(raw: &RawMessage) -> Result<InstrumentationMessage> {
    Ok(InstrumentationMessage::ProcessCreation {
        operation: operation_of(raw),
        data: ProcessCreation::deserialize(&raw.data)?,
        metadata: metadata_of(raw)?,
    })
}

fn decode_pong(raw: &RawMessage) -> Result<InstrumentationMessage> {
    let timestamp = raw.timestamp.clone().or_else(|| {
        raw.data
            .get("timestamp")
            .and_then(Value::as_str)
            .map(str::to_string)
    });
    Ok(InstrumentationMessage::Pong { timestamp })
}

fn decode_status_response(raw: &RawMessage) -> Result<InstrumentationMessage> {
    Ok(InstrumentationMessage::StatusResponse(StatusReport::deserialize(
        &raw.data,
    )?))
}

fn decode_http_transaction(raw: &RawMessage) -> Result<InstrumentationMessage> {
    Ok(InstrumentationMessage::HttpTransaction(Box::new(
        HttpTransaction::deserialize(&raw.data)?,
    )))
}

fn decode_network_batch(raw: &RawMessage) -> Result<InstrumentationMessage> {
    Ok(InstrumentationMessage::NetworkBatch(NetworkBatch::deserialize(
        &raw.data,
    )?))
}
