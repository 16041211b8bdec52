//! Weather station readings.
//!
//! Payload: `{"location": "porch", "temperature": 21.5, "pressure": 1013.2, "humidity": 55.0}`.
//! The row time is assigned by the server at insert.

use serde::{Deserialize, Serialize};

use tsbridge_api::{BindValue, RecordSchema, Statement, ValidationError};

const CREATE_TABLE: &str = "\
CREATE TABLE IF NOT EXISTS weather (
    time TIMESTAMPTZ NOT NULL,
    location TEXT NOT NULL,
    temperature REAL NULL,
    pressure REAL NULL,
    humidity REAL NULL
)";

const CREATE_HYPERTABLE: &str = "SELECT create_hypertable('weather', 'time', if_not_exists => TRUE)";

const INSERT: &str = "\
INSERT INTO weather (time, location, temperature, pressure, humidity) VALUES (NOW(), $1, $2, $3, $4)";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherReading {
    pub location: String,
    #[serde(deserialize_with = "tsbridge_api::de::real")]
    pub temperature: f64,
    #[serde(deserialize_with = "tsbridge_api::de::real")]
    pub pressure: f64,
    #[serde(deserialize_with = "tsbridge_api::de::real")]
    pub humidity: f64,
}

#[derive(Debug, Default, Clone)]
pub struct WeatherSchema;

impl WeatherSchema {
    pub fn new() -> Self {
        Self
    }
}

impl RecordSchema for WeatherSchema {
    type Record = WeatherReading;

    fn name(&self) -> &str {
        "weather"
    }

    fn decode(&self, payload: &[u8]) -> Result<WeatherReading, ValidationError> {
        Ok(serde_json::from_slice(payload)?)
    }

    fn ddl(&self) -> Vec<Statement> {
        vec![Statement::new(CREATE_TABLE), Statement::new(CREATE_HYPERTABLE)]
    }

    fn insert_sql(&self) -> &'static str {
        INSERT
    }

    fn insert_params(&self, record: &WeatherReading) -> Vec<BindValue> {
        vec![
            BindValue::from(record.location.as_str()),
            BindValue::from(record.temperature),
            BindValue::from(record.pressure),
            BindValue::from(record.humidity),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tsbridge_api::Acceptance;

    const PORCH: &[u8] = br#"{"location":"porch","temperature":21.5,"pressure":1013.2,"humidity":55.0}"#;

    #[test]
    fn decodes_complete_payload() {
        let reading = WeatherSchema::new().decode(PORCH).unwrap();
        assert_eq!(
            reading,
            WeatherReading {
                location: "porch".into(),
                temperature: 21.5,
                pressure: 1013.2,
                humidity: 55.0,
            }
        );
    }

    #[test]
    fn missing_humidity_is_a_validation_failure() {
        let err = WeatherSchema::new()
            .decode(br#"{"location":"porch","temperature":21.5,"pressure":1013.2}"#)
            .unwrap_err();
        assert!(err.message().contains("humidity"), "{err}");
    }

    #[test]
    fn mistyped_fields_are_rejected() {
        let schema = WeatherSchema::new();
        assert!(schema
            .decode(br#"{"location":"porch","temperature":"warm","pressure":1013.2,"humidity":55}"#)
            .is_err());
        assert!(schema
            .decode(br#"{"location":12,"temperature":21.5,"pressure":1013.2,"humidity":55}"#)
            .is_err());
        assert!(schema.decode(b"not json").is_err());
        assert!(schema.decode(b"").is_err());
    }

    #[test]
    fn readings_beyond_real_range_are_rejected() {
        let err = WeatherSchema::new()
            .decode(br#"{"location":"p","temperature":1e39,"pressure":1.0,"humidity":1.0}"#)
            .unwrap_err();
        assert!(err.message().contains("single-precision"), "{err}");
    }

    #[test]
    fn extra_fields_are_ignored() {
        let reading = WeatherSchema::new()
            .decode(br#"{"location":"shed","temperature":"3","pressure":990,"humidity":80.5,"battery":"ok"}"#)
            .unwrap();
        assert_eq!(reading.location, "shed");
        assert_eq!(reading.temperature, 3.0);
    }

    #[test]
    fn everything_is_accepted() {
        let schema = WeatherSchema::new();
        let reading = schema.decode(PORCH).unwrap();
        assert_eq!(schema.accept(&reading), Acceptance::Accept);
    }

    #[test]
    fn insert_binds_fields_in_placeholder_order() {
        let schema = WeatherSchema::new();
        let stmt = schema.insert(&schema.decode(PORCH).unwrap());
        assert!(stmt.sql.contains("VALUES (NOW(), $1, $2, $3, $4)"));
        assert_eq!(
            stmt.params,
            vec![
                BindValue::Text("porch".into()),
                BindValue::Float4(21.5),
                BindValue::Float4(1013.2),
                BindValue::Float4(55.0),
            ]
        );
    }

    #[test]
    fn ddl_is_idempotent() {
        let ddl = WeatherSchema::new().ddl();
        assert_eq!(ddl.len(), 2);
        assert!(ddl[0].sql.contains("CREATE TABLE IF NOT EXISTS weather"));
        assert!(ddl[1].sql.contains("if_not_exists => TRUE"));
    }
}
