use chrono::{DateTime, Utc};

/// Positional bind value for a parameterized statement.
///
/// Variants map one-to-one onto the column types the schemas use.
#[derive(Debug, Clone, PartialEq)]
pub enum BindValue {
    /// `TEXT`
    Text(String),
    /// `INTEGER`
    Int4(i32),
    /// `REAL`
    Float4(f32),
    /// `TIMESTAMPTZ`
    Timestamptz(DateTime<Utc>),
}

impl From<&str> for BindValue {
    fn from(v: &str) -> Self {
        BindValue::Text(v.to_string())
    }
}

impl From<String> for BindValue {
    fn from(v: String) -> Self {
        BindValue::Text(v)
    }
}

impl From<i32> for BindValue {
    fn from(v: i32) -> Self {
        BindValue::Int4(v)
    }
}

impl From<f32> for BindValue {
    fn from(v: f32) -> Self {
        BindValue::Float4(v)
    }
}

/// `REAL` columns are single precision.
impl From<f64> for BindValue {
    fn from(v: f64) -> Self {
        BindValue::Float4(v as f32)
    }
}

impl From<DateTime<Utc>> for BindValue {
    fn from(v: DateTime<Utc>) -> Self {
        BindValue::Timestamptz(v)
    }
}
