//! Forgiving deserializers for persisted records.
//!
//! Stored state may have been written by older releases or edited by hand.
//! Fields that cannot be understood resolve to `None` (or the default)
//! instead of failing the whole record.

use crate::entity::CalculationMode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serializer};
use serde_json::Value;
use tracing::warn;

/// Epoch-millisecond timestamps, tolerant of strings and RFC 3339 on input.
pub mod timestamp {
    use super::*;

    pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(ts) => serializer.serialize_some(&ts.timestamp_millis()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Option::<Value>::deserialize(deserializer)?;
        Ok(match value {
            None | Some(Value::Null) => None,
            Some(value) => {
                let parsed = parse_timestamp(&value);
                if parsed.is_none() {
                    warn!("Discarding unparseable timestamp {}", value);
                }
                parsed
            }
        })
    }
}

pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))
            .and_then(DateTime::from_timestamp_millis),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .and_then(DateTime::from_timestamp_millis)
                .or_else(|| {
                    DateTime::parse_from_rfc3339(s)
                        .ok()
                        .map(|ts| ts.with_timezone(&Utc))
                })
        }
        _ => None,
    }
}

/// Non-negative integers, also accepted as whole floats or numeric strings.
pub fn number<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: TryFrom<u64>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value
        .as_ref()
        .and_then(as_u64)
        .and_then(|n| T::try_from(n).ok()))
}

fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite() && *f >= 0.0 && f.fract() == 0.0)
                .map(|f| f as u64)
        }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Unknown or missing modes fall back to [`CalculationMode::Bidirectional`].
pub fn calculation_mode<'de, D>(deserializer: D) -> Result<CalculationMode, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(Value::Null) => CalculationMode::default(),
        Some(value) => serde_json::from_value(value.clone()).unwrap_or_else(|_| {
            warn!("Unknown traffic calculation mode {}, using bidirectional", value);
            CalculationMode::default()
        }),
    })
}
