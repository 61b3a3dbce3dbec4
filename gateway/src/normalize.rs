use crate::model::{NewTelemetry, RawTelemetry, RawTimestamp};
use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::{debug, warn};

/// ISO-8601 layouts without an offset; these are read as UTC.
const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Resolves whatever the device sent into a UTC instant.
///
/// Strings are tried as RFC 3339 / ISO-8601 first and then as epoch
/// milliseconds; numbers are epoch milliseconds. Anything else, or any parse
/// failure, yields `now` so the reading itself is never lost.
pub fn normalize_timestamp(raw: &RawTimestamp, now: DateTime<Utc>) -> DateTime<Utc> {
    let parsed = match raw {
        RawTimestamp::Text(text) => parse_text(text.trim()),
        RawTimestamp::Number(millis) => from_millis_f64(*millis),
        RawTimestamp::Other(value) => {
            debug!(timestamp = %value, "unrecognised timestamp type");
            None
        }
    };

    parsed.unwrap_or_else(|| {
        warn!(timestamp = ?raw, "could not interpret timestamp, using current UTC time");
        now
    })
}

fn parse_text(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }

    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(naive.and_utc());
        }
    }

    text.parse::<i64>()
        .ok()
        .and_then(DateTime::from_timestamp_millis)
}

fn from_millis_f64(millis: f64) -> Option<DateTime<Utc>> {
    if !millis.is_finite() {
        return None;
    }
    // Fractional milliseconds are dropped.
    DateTime::from_timestamp_millis(millis.trunc() as i64)
}

/// Builds the record to persist. `received_at` is always the ingest time.
pub fn normalize(raw: RawTelemetry, now: DateTime<Utc>) -> NewTelemetry {
    NewTelemetry {
        timestamp: normalize_timestamp(&raw.timestamp, now),
        device_id: raw.device_id,
        temperature: raw.temperature,
        humidity: raw.humidity,
        co_ppm: raw.co_ppm,
        dust_density: raw.dust_density,
        alarm_status: raw.alarm_status,
        received_at: now,
    }
}
