use chrono::{DateTime, Datelike as _, NaiveDateTime, SecondsFormat, TimeZone as _, Utc};
use chrono_tz::Tz;
use tracing::warn;

use crate::error::{PulseError, Result};

// ── Storage format ────────────────────────────────────────────────────────────

/// Render a timestamp in the store's fixed-width form
/// (`YYYY-MM-DDTHH:MM:SS.ffffffZ`), so text order equals time order.
///
/// ```
/// use chrono::{TimeZone, Utc};
/// use pulse_core::time_utils::to_storage;
///
/// let dt = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
/// assert_eq!(to_storage(&dt), "2024-01-01T00:00:00.000000Z");
/// ```
pub fn to_storage(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Inverse of [`to_storage`]; also accepts any RFC 3339 string.
pub fn from_storage(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| PulseError::TimestampParse(s.to_string()))
}

/// Reject instants [`to_storage`] cannot render as a four-digit year.
///
/// Anything outside years 0000..=9999 would be written with a sign prefix
/// that neither sorts nor parses back.
pub fn ensure_storable(dt: DateTime<Utc>) -> Result<DateTime<Utc>> {
    if (0..=9999).contains(&dt.year()) {
        Ok(dt)
    } else {
        Err(PulseError::TimestampParse(format!(
            "{} is outside years 0000-9999",
            dt.to_rfc3339_opts(SecondsFormat::Secs, true)
        )))
    }
}

/// Convert milliseconds since the Unix epoch.
pub fn from_epoch_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| PulseError::TimestampParse(format!("{ms} ms")))
        .and_then(ensure_storable)
}

/// Convert fractional seconds since the Unix epoch, keeping microseconds.
pub fn from_epoch_secs_f64(secs: f64) -> Result<DateTime<Utc>> {
    if !secs.is_finite() {
        return Err(PulseError::TimestampParse(secs.to_string()));
    }
    let micros = (secs * 1_000_000.0).round() as i64;
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| PulseError::TimestampParse(secs.to_string()))
        .and_then(ensure_storable)
}

// ── System timezone detection ─────────────────────────────────────────────────

/// IANA name of the running system's timezone, `"UTC"` when undetectable.
pub fn get_system_timezone() -> String {
    iana_time_zone::get_timezone().unwrap_or_else(|_| "UTC".to_string())
}

// ── TimestampParser ───────────────────────────────────────────────────────────

/// Parses ingestion timestamps.
///
/// Accepts RFC 3339 with `Z` or an offset, naive date-times (interpreted in
/// the configured default timezone), and bare numeric epochs (seconds, or
/// milliseconds when the value is too large to be seconds).
pub struct TimestampParser {
    default_tz: Tz,
}

/// Epoch values above this are treated as milliseconds (year ~5138 in seconds).
const EPOCH_MILLIS_THRESHOLD: f64 = 100_000_000_000.0;

impl TimestampParser {
    /// Create a parser whose naive timestamps are read in `tz_name`.
    ///
    /// An unrecognised timezone falls back to UTC with a warning.
    pub fn new(tz_name: &str) -> Self {
        let tz = tz_name.parse::<Tz>().unwrap_or_else(|_| {
            warn!(timezone = %tz_name, "unrecognised timezone, falling back to UTC");
            Tz::UTC
        });
        Self { default_tz: tz }
    }

    pub fn validate_timezone(tz_name: &str) -> bool {
        tz_name.parse::<Tz>().is_ok()
    }

    pub fn default_tz(&self) -> Tz {
        self.default_tz
    }

    /// Parse `s` into a UTC instant.
    ///
    /// # Errors
    ///
    /// [`PulseError::TimestampParse`] for empty input, an unrecognised format
    /// or an instant outside years 0000..=9999.
    pub fn parse(&self, s: &str) -> Result<DateTime<Utc>> {
        self.parse_any(s).and_then(ensure_storable)
    }

    fn parse_any(&self, s: &str) -> Result<DateTime<Utc>> {
        let s = s.trim();
        if s.is_empty() {
            return Err(PulseError::TimestampParse("empty timestamp".to_string()));
        }

        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Ok(dt.with_timezone(&Utc));
        }

        const FMTS: &[&str] = &[
            "%Y-%m-%dT%H:%M:%S%.f",
            "%Y-%m-%dT%H:%M:%S",
            "%Y-%m-%d %H:%M:%S%.f",
            "%Y-%m-%d %H:%M:%S",
        ];
        for fmt in FMTS {
            if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
                // Ambiguous local times (DST fold) resolve to the earlier one.
                if let Some(dt) = self.default_tz.from_local_datetime(&naive).earliest() {
                    return Ok(dt.with_timezone(&Utc));
                }
            }
        }

        if let Ok(n) = s.parse::<f64>() {
            return if n.abs() >= EPOCH_MILLIS_THRESHOLD {
                from_epoch_millis(n.round() as i64)
            } else {
                from_epoch_secs_f64(n)
            };
        }

        Err(PulseError::TimestampParse(s.to_string()))
    }
}

impl Default for TimestampParser {
    fn default() -> Self {
        Self { default_tz: Tz::UTC }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────
