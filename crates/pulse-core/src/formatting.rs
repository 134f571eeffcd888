//! Operator-facing rendering of instrumentation messages.

use crate::events::InstrumentationMessage;

/// Longest content excerpt shown for a file operation, in characters.
pub const EXCERPT_CHARS: usize = 100;

/// Truncate `content` to `max_chars` characters, appending `...` when cut.
///
/// Cuts on a character boundary, never inside a multi-byte sequence.
///
/// # Examples
///
/// ```
/// use pulse_core::formatting::excerpt;
///
/// assert_eq!(excerpt("hello", 10), "hello");
/// assert_eq!(excerpt("hello world", 5), "hello...");
/// assert_eq!(excerpt("héllo", 2), "hé...");
/// ```
pub fn excerpt(content: &str, max_chars: usize) -> String {
    match content.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &content[..cut]),
        None => content.to_string(),
    }
}

/// Format an NTSTATUS-style code as 8 hex digits of its 32-bit pattern.
///
/// # Examples
///
/// ```
/// use pulse_core::formatting::status_hex;
///
/// assert_eq!(status_hex(0), "0x00000000");
/// assert_eq!(status_hex(-1073741823), "0xc0000001");
/// ```
pub fn status_hex(status: i64) -> String {
    format!("0x{:08x}", status as u32)
}

/// `SUCCESS` for non-negative status codes, `FAILED` otherwise.
pub fn status_text(status: i64) -> &'static str {
    if status >= 0 {
        "SUCCESS"
    } else {
        "FAILED"
    }
}

/// Format an integer with thousands separators.
///
/// # Examples
///
/// ```
/// use pulse_core::formatting::format_count;
///
/// assert_eq!(format_count(0), "0");
/// assert_eq!(format_count(1234567), "1,234,567");
/// ```
pub fn format_count(value: u64) -> String {
    group_thousands(&value.to_string())
}

/// One-line summary of a message for the operator log.
pub fn describe(message: &InstrumentationMessage) -> String {
    match message {
        InstrumentationMessage::SessionStart(s) => format!(
            "agent connected: {} (pid {}) on {}/{}",
            or_unknown(s.process_name.as_deref()),
            s.process_id.map_or_else(|| "?".to_string(), |p| p.to_string()),
            or_unknown(s.platform.as_deref()),
            or_unknown(s.arch.as_deref()),
        ),
        InstrumentationMessage::FileOperation {
            operation, data, ..
        } => {
            let mut line = format!(
                "{operation} {} ({} bytes)",
                or_unknown(data.file_path.as_deref()),
                format_count(data.bytes_transferred),
            );
            if let Some(content) = data.content.as_deref().filter(|c| !c.is_empty()) {
                line.push_str(&format!(" content={:?}", excerpt(content, EXCERPT_CHARS)));
            }
            line
        }
        InstrumentationMessage::ProcessCreation {
            operation, data, ..
        } => {
            let target = data
                .command_line
                .as_deref()
                .or(data.image_path.as_deref());
            format!(
                "{operation} {} {} ({})",
                or_unknown(target),
                status_text(data.status),
                status_hex(data.status),
            )
        }
        InstrumentationMessage::Pong { timestamp } => {
            format!("agent is alive ({})", or_unknown(timestamp.as_deref()))
        }
        InstrumentationMessage::StatusResponse(s) => format!(
            "status {} for {} (pid {})",
            or_unknown(s.status.as_deref()),
            or_unknown(s.process_name.as_deref()),
            s.process_id.map_or_else(|| "?".to_string(), |p| p.to_string()),
        ),
        InstrumentationMessage::HttpTransaction(tx) => match (&tx.request, &tx.response) {
            (Some(req), Some(resp)) => {
                format!("{} {} -> {} {}", req.method, req.url, resp.status_code, resp.reason)
            }
            (Some(req), None) => format!("{} {} -> (no response)", req.method, req.url),
            _ => "http transaction without request".to_string(),
        },
        InstrumentationMessage::NetworkBatch(batch) => {
            format!("{} captured frame(s)", format_count(batch.events.len() as u64))
        }
        InstrumentationMessage::Unknown { kind, .. } => format!("unrecognised message type {kind:?}"),
    }
}

// ── Internal helpers ──────────────────────────────────────────────────────────

fn or_unknown(value: Option<&str>) -> &str {
    value.unwrap_or("Unknown")
}

/// Insert commas every three digits from the right of an integer string.
fn group_thousands(s: &str) -> String {
    if s.len() <= 3 {
        return s.to_string();
    }
    let chars: Vec<char> = s.chars().collect();
    let mut result = String::with_capacity(s.len() + s.len() / 3);
    let remainder = chars.len() % 3;
    for (i, &c) in chars.iter().enumerate() {
        if i != 0 && (i % 3 == remainder) {
            result.push(',');
        }
        result.push(c);
    }
    result
}

// ── Tests ──────────────────────────────────────────────────────────────────────
