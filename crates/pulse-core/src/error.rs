use thiserror::Error;

/// All errors produced by the OS-Pulse pipeline.
#[derive(Error, Debug)]
pub enum PulseError {
    /// No session exists with the given identifier.
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// A record other than a session could not be located.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// A freshly generated identifier collided with an existing row.
    #[error("Duplicate identifier: {0}")]
    DuplicateId(String),

    /// The request body was malformed or semantically invalid.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The requested monitor mode is unknown or not enabled in this deployment.
    #[error("Invalid monitor mode: {0}")]
    InvalidMode(String),

    /// A parameter required by the selected monitor mode was not supplied.
    #[error("Missing parameter: {0}")]
    MissingParameter(String),

    /// The session already has a tracked instrumentation handle.
    #[error("Session is already being monitored: {0}")]
    AlreadyMonitoring(String),

    /// A stop for the session arrived while its start was still running;
    /// the start was undone.
    #[error("Monitoring start was cancelled by a stop: {0}")]
    StartCancelled(String),

    /// The instrumentation engine or the downstream ingestion endpoint
    /// could not be reached or refused the directive.
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// A fan-out batch stopped part way; `persisted` items remain committed.
    #[error("Partial failure after {persisted} persisted item(s): {source}")]
    PartialFailure {
        persisted: usize,
        #[source]
        source: Box<PulseError>,
    },

    /// A timestamp string did not match any recognised format.
    #[error("Invalid timestamp format: {0}")]
    TimestampParse(String),

    /// The persistent store rejected an operation.
    #[error("Storage error: {0}")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// A JSON document could not be parsed or produced.
    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// A configuration value is missing or invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Pass-through for any raw I/O error that does not carry more context.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Catch-all for errors from third-party crates via `anyhow`.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Coarse classification used by callers that need to decide how an error
/// is surfaced (HTTP status, log level, drop vs. propagate).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    NotFound,
    InvalidRequest,
    Conflict,
    UpstreamUnavailable,
    PartialFailure,
    Internal,
}

impl PulseError {
    /// Wrap any store-level error.
    pub fn storage<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        PulseError::Storage(Box::new(err))
    }

    /// Build a storage error from a plain message (e.g. a poisoned lock).
    pub fn storage_msg(msg: impl Into<String>) -> Self {
        let msg: String = msg.into();
        PulseError::Storage(msg.into())
    }

    /// Map this error onto the pipeline's error taxonomy.
    pub fn class(&self) -> ErrorClass {
        match self {
            PulseError::SessionNotFound(_) | PulseError::NotFound { .. } => ErrorClass::NotFound,
            PulseError::InvalidRequest(_)
            | PulseError::InvalidMode(_)
            | PulseError::MissingParameter(_)
            | PulseError::TimestampParse(_) => ErrorClass::InvalidRequest,
            PulseError::AlreadyMonitoring(_)
            | PulseError::StartCancelled(_)
            | PulseError::DuplicateId(_) => ErrorClass::Conflict,
            PulseError::UpstreamUnavailable(_) => ErrorClass::UpstreamUnavailable,
            PulseError::PartialFailure { .. } => ErrorClass::PartialFailure,
            PulseError::Storage(_)
            | PulseError::JsonParse(_)
            | PulseError::Config(_)
            | PulseError::Io(_)
            | PulseError::Other(_) => ErrorClass::Internal,
        }
    }
}

/// Convenience alias used throughout the pulse crates.
pub type Result<T> = std::result::Result<T, PulseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_session_not_found() {
        let err = PulseError::SessionNotFound("abc-123".to_string());
        assert_eq!(err.to_string(), "Session not found: abc-123");
    }

    #[test]
    fn test_error_display_not_found() {
        let err = PulseError::NotFound {
            entity: "Artifact",
            id: "a.exe".to_string(),
        };
        assert_eq!(err.to_string(), "Artifact not found: a.exe");
    }

    #[test]
    fn test_error_display_missing_parameter() {
        let err = PulseError::MissingParameter("processes".to_string());
        assert_eq!(err.to_string(), "Missing parameter: processes");
    }

    #[test]
    fn test_error_display_partial_failure() {
        let err = PulseError::PartialFailure {
            persisted: 3,
            source: Box::new(PulseError::storage_msg("disk full")),
        };
        let msg = err.to_string();
        assert!(msg.contains("3 persisted"));
        assert!(msg.contains("disk full"));
    }

    #[test]
    fn test_error_class_mapping() {
        assert_eq!(
            PulseError::SessionNotFound("x".into()).class(),
            ErrorClass::NotFound
        );
        assert_eq!(
            PulseError::InvalidMode("9".into()).class(),
            ErrorClass::InvalidRequest
        );
        assert_eq!(
            PulseError::MissingParameter("pid".into()).class(),
            ErrorClass::InvalidRequest
        );
        assert_eq!(
            PulseError::AlreadyMonitoring("x".into()).class(),
            ErrorClass::Conflict
        );
        assert_eq!(
            PulseError::StartCancelled("x".into()).class(),
            ErrorClass::Conflict
        );
        assert_eq!(
            PulseError::UpstreamUnavailable("bridge".into()).class(),
            ErrorClass::UpstreamUnavailable
        );
        assert_eq!(
            PulseError::storage_msg("locked").class(),
            ErrorClass::Internal
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: PulseError = io_err.into();
        assert!(err.to_string().contains("denied"));
        assert_eq!(err.class(), ErrorClass::Internal);
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("{invalid}").unwrap_err();
        let err: PulseError = json_err.into();
        assert!(err.to_string().contains("Failed to parse JSON"));
        // Request bodies are rejected before reaching the pipeline; a JSON
        // failure here means stored or engine data is unreadable.
        assert_eq!(err.class(), ErrorClass::Internal);
    }
}
