//! Radio sensor bursts decoded by rtl_433.
//!
//! The decoder stamps each burst in UTC but does not always say so
//! (`"2024-03-01 18:22:07"`). Timestamps are therefore always stored as UTC:
//! naive values are tagged UTC, zoned values are converted to the same
//! instant in UTC, numbers are Unix epoch seconds.

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};

use tsbridge_api::{Acceptance, BindValue, RecordSchema, Statement, ValidationError};

const CREATE_TABLE: &str = "\
CREATE TABLE IF NOT EXISTS sensor_burst (
    time TIMESTAMPTZ NOT NULL,
    model TEXT NOT NULL,
    count INTEGER NOT NULL,
    num_rows INTEGER NOT NULL,
    len INTEGER NOT NULL,
    data TEXT NOT NULL,
    rssi REAL NOT NULL,
    snr REAL NOT NULL,
    noise REAL NOT NULL
)";

const CREATE_HYPERTABLE: &str =
    "SELECT create_hypertable('sensor_burst', 'time', if_not_exists => TRUE)";

const INSERT: &str = "\
INSERT INTO sensor_burst (time, model, count, num_rows, len, data, rssi, snr, noise) \
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)";

const NAIVE_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorBurstReading {
    #[serde(deserialize_with = "utc_time")]
    pub time: DateTime<Utc>,
    pub model: String,
    #[serde(deserialize_with = "tsbridge_api::de::integer")]
    pub count: i32,
    #[serde(deserialize_with = "tsbridge_api::de::integer")]
    pub num_rows: i32,
    #[serde(deserialize_with = "tsbridge_api::de::integer")]
    pub len: i32,
    pub data: String,
    #[serde(deserialize_with = "tsbridge_api::de::real")]
    pub rssi: f64,
    #[serde(deserialize_with = "tsbridge_api::de::real")]
    pub snr: f64,
    #[serde(deserialize_with = "tsbridge_api::de::real")]
    pub noise: f64,
}

/// Schema for sensor bursts, with an optional allow-list of `data` signatures.
#[derive(Debug, Default, Clone)]
pub struct SensorBurstSchema {
    allowed: Option<HashSet<String>>,
}

impl SensorBurstSchema {
    /// Schema that persists every valid burst.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schema that persists only bursts whose `data` is in `signatures`.
    pub fn with_allow_list<I, S>(signatures: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: Some(signatures.into_iter().map(Into::into).collect()),
        }
    }
}

impl RecordSchema for SensorBurstSchema {
    type Record = SensorBurstReading;

    fn name(&self) -> &str {
        "sensor_burst"
    }

    fn decode(&self, payload: &[u8]) -> Result<SensorBurstReading, ValidationError> {
        Ok(serde_json::from_slice(payload)?)
    }

    fn accept(&self, record: &SensorBurstReading) -> Acceptance {
        match &self.allowed {
            Some(allowed) if !allowed.contains(&record.data) => {
                Acceptance::Reject(format!("data '{}' not on allow-list", record.data))
            }
            _ => Acceptance::Accept,
        }
    }

    fn ddl(&self) -> Vec<Statement> {
        vec![Statement::new(CREATE_TABLE), Statement::new(CREATE_HYPERTABLE)]
    }

    fn insert_sql(&self) -> &'static str {
        INSERT
    }

    fn insert_params(&self, record: &SensorBurstReading) -> Vec<BindValue> {
        vec![
            BindValue::from(record.time),
            BindValue::from(record.model.as_str()),
            BindValue::from(record.count),
            BindValue::from(record.num_rows),
            BindValue::from(record.len),
            BindValue::from(record.data.as_str()),
            BindValue::from(record.rssi),
            BindValue::from(record.snr),
            BindValue::from(record.noise),
        ]
    }
}

/// Parse a device timestamp, forcing the result into UTC.
///
/// Accepts RFC 3339, a `Z` suffix, and `±HH`, `±HHMM` or `±HH:MM` offsets
/// after either date/time separator. Without any marker the value is UTC.
pub fn parse_utc(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    let (local, offset) = match s.strip_suffix(['Z', 'z']) {
        Some(rest) => (rest, None),
        None => match split_offset(s) {
            Some((rest, offset)) => (rest.trim_end(), Some(offset)),
            None => (s, None),
        },
    };
    let naive = NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(local, fmt).ok())?;
    match offset {
        Some(offset) => offset
            .from_local_datetime(&naive)
            .single()
            .map(|dt| dt.with_timezone(&Utc)),
        None => Some(naive.and_utc()),
    }
}

/// Split a trailing `±HH`, `±HHMM` or `±HH:MM` offset off a timestamp.
fn split_offset(s: &str) -> Option<(&str, FixedOffset)> {
    // Hyphens inside the date part sit before index 10.
    let at = s.rfind(['+', '-']).filter(|&i| i > 10)?;
    let (head, tail) = s.split_at(at);
    let digits = &tail[1..];
    if !digits.is_ascii() {
        return None;
    }
    let (hh, mm) = match digits.len() {
        2 => (digits, "00"),
        4 => (&digits[..2], &digits[2..]),
        5 if digits.as_bytes()[2] == b':' => (&digits[..2], &digits[3..]),
        _ => return None,
    };
    if !hh.bytes().chain(mm.bytes()).all(|b| b.is_ascii_digit()) {
        return None;
    }
    let hours: i32 = hh.parse().ok()?;
    let minutes: i32 = mm.parse().ok()?;
    if hours > 23 || minutes > 59 {
        return None;
    }
    let seconds = hours * 3600 + minutes * 60;
    let offset = if tail.starts_with('-') {
        FixedOffset::west_opt(seconds)
    } else {
        FixedOffset::east_opt(seconds)
    }?;
    Some((head, offset))
}

fn utc_time<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
    deserializer.deserialize_any(UtcTimeVisitor)
}

struct UtcTimeVisitor;

impl<'de> Visitor<'de> for UtcTimeVisitor {
    type Value = DateTime<Utc>;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a date-time string or Unix timestamp")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
        if let Some(dt) = parse_utc(v) {
            return Ok(dt);
        }
        // Epoch seconds sent as a string.
        let trimmed = v.trim();
        if let Ok(secs) = trimmed.parse::<i64>() {
            return self.visit_i64(secs);
        }
        match trimmed.parse::<f64>() {
            Ok(secs) if secs.is_finite() => self.visit_f64(secs),
            _ => Err(E::invalid_value(de::Unexpected::Str(v), &self)),
        }
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
        DateTime::from_timestamp(v, 0).ok_or_else(|| E::invalid_value(de::Unexpected::Signed(v), &self))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
        i64::try_from(v)
            .ok()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .ok_or_else(|| E::invalid_value(de::Unexpected::Unsigned(v), &self))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Self::Value, E> {
        if !v.is_finite() {
            return Err(E::invalid_value(de::Unexpected::Float(v), &self));
        }
        let secs = v.floor();
        let nanos = ((v - secs) * 1e9).round() as u32;
        DateTime::from_timestamp(secs as i64, nanos.min(999_999_999))
            .ok_or_else(|| E::invalid_value(de::Unexpected::Float(v), &self))
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Timelike};

    use super::*;

    fn payload(time: &str, data: &str) -> Vec<u8> {
        format!(
            r#"{{"time":{time},"model":"Acurite-Tower","count":1,"num_rows":1,"len":56,"data":"{data}","rssi":-0.1,"snr":12.3,"noise":-12.4}}"#
        )
        .into_bytes()
    }

    #[test]
    fn decodes_complete_payload() {
        let r = SensorBurstSchema::new()
            .decode(&payload(r#""2024-03-01 18:22:07""#, "2e4f8d8"))
            .unwrap();
        assert_eq!(r.time, Utc.with_ymd_and_hms(2024, 3, 1, 18, 22, 7).unwrap());
        assert_eq!(r.model, "Acurite-Tower");
        assert_eq!((r.count, r.num_rows, r.len), (1, 1, 56));
        assert_eq!(r.data, "2e4f8d8");
        assert_eq!((r.rssi, r.snr, r.noise), (-0.1, 12.3, -12.4));
    }

    #[test]
    fn naive_timestamps_are_tagged_utc() {
        let expected = Utc.with_ymd_and_hms(2024, 3, 1, 18, 22, 7).unwrap();
        for raw in ["2024-03-01 18:22:07", "2024-03-01T18:22:07", "2024-03-01 18:22:07Z"] {
            assert_eq!(parse_utc(raw), Some(expected), "{raw}");
        }
        let fractional = parse_utc("2024-03-01 18:22:07.250").unwrap();
        assert_eq!(fractional.nanosecond(), 250_000_000);
    }

    #[test]
    fn zoned_timestamps_are_converted_to_utc() {
        let expected = Utc.with_ymd_and_hms(2024, 3, 1, 18, 22, 7).unwrap();
        assert_eq!(parse_utc("2024-03-01T20:22:07+02:00"), Some(expected));
        assert_eq!(parse_utc("2024-03-01 13:22:07-05:00"), Some(expected));
        assert_eq!(parse_utc("2024-03-01 18:22:07+0000"), Some(expected));
        assert_eq!(parse_utc("2024-03-01T20:22:07+0200"), Some(expected));
        assert_eq!(parse_utc("2024-03-01T18:22:07+00"), Some(expected));
        assert_eq!(parse_utc("2024-03-01 18:22:07+00"), Some(expected));
        assert_eq!(parse_utc("2024-03-01 15:52:07.000-0230"), Some(expected));
        assert_eq!(parse_utc("2024-03-01 20:22:07 +02:00"), Some(expected));
    }

    #[test]
    fn malformed_offsets_are_rejected() {
        assert_eq!(parse_utc("2024-03-01 18:22:07+2"), None);
        assert_eq!(parse_utc("2024-03-01 18:22:07+25:00"), None);
        assert_eq!(parse_utc("2024-03-01 18:22:07+0a00"), None);
    }

    #[test]
    fn epoch_timestamps_are_accepted() {
        let r = SensorBurstSchema::new()
            .decode(&payload("1709317327", "2e4f8d8"))
            .unwrap();
        assert_eq!(r.time, Utc.with_ymd_and_hms(2024, 3, 1, 18, 22, 7).unwrap());
    }

    #[test]
    fn epoch_timestamps_as_strings_are_accepted() {
        let expected = Utc.with_ymd_and_hms(2024, 3, 1, 18, 22, 7).unwrap();
        let schema = SensorBurstSchema::new();
        let r = schema.decode(&payload(r#""1709317327""#, "2e4f8d8")).unwrap();
        assert_eq!(r.time, expected);
        let r = schema.decode(&payload(r#""1709317327.5""#, "2e4f8d8")).unwrap();
        assert_eq!(r.time, expected + chrono::Duration::milliseconds(500));
    }

    #[test]
    fn invalid_timestamps_are_validation_failures() {
        let schema = SensorBurstSchema::new();
        assert!(schema.decode(&payload(r#""yesterday""#, "x")).is_err());
        assert!(schema.decode(&payload(r#""2024-13-01 00:00:00""#, "x")).is_err());
        assert!(schema.decode(&payload("null", "x")).is_err());
    }

    #[test]
    fn missing_or_mistyped_fields_are_rejected() {
        let schema = SensorBurstSchema::new();
        assert!(schema
            .decode(br#"{"time":"2024-03-01 18:22:07","model":"m","count":1,"num_rows":1,"len":56,"data":"d","rssi":-0.1,"snr":12.3}"#)
            .is_err());
        assert!(schema
            .decode(br#"{"time":"2024-03-01 18:22:07","model":"m","count":1.5,"num_rows":1,"len":56,"data":"d","rssi":-0.1,"snr":12.3,"noise":-12.4}"#)
            .is_err());
    }

    #[test]
    fn allow_list_filters_on_data() {
        let schema = SensorBurstSchema::with_allow_list(["2e4f8d8"]);
        let good = schema.decode(&payload(r#""2024-03-01 18:22:07""#, "2e4f8d8")).unwrap();
        let bad = schema.decode(&payload(r#""2024-03-01 18:22:07""#, "deadbeef")).unwrap();
        assert_eq!(schema.accept(&good), Acceptance::Accept);
        assert!(matches!(schema.accept(&bad), Acceptance::Reject(reason) if reason.contains("deadbeef")));
    }

    #[test]
    fn without_allow_list_everything_is_accepted() {
        let schema = SensorBurstSchema::new();
        let r = schema.decode(&payload(r#""2024-03-01 18:22:07""#, "deadbeef")).unwrap();
        assert_eq!(schema.accept(&r), Acceptance::Accept);
    }

    #[test]
    fn insert_binds_nine_values_in_order() {
        let schema = SensorBurstSchema::new();
        let r = schema.decode(&payload(r#""2024-03-01 18:22:07""#, "2e4f8d8")).unwrap();
        let stmt = schema.insert(&r);
        assert!(stmt.sql.contains("$9"));
        assert_eq!(stmt.params.len(), 9);
        assert_eq!(stmt.params[0], BindValue::Timestamptz(r.time));
        assert_eq!(stmt.params[5], BindValue::Text("2e4f8d8".into()));
        assert_eq!(stmt.params[2], BindValue::Int4(1));
    }
}
