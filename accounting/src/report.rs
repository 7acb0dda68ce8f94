use crate::counter::NetCounters;
use crate::entity::CalculationMode;
use crate::error::{AccountingError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Raw counters as sent by an agent; both directions are required.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawReading {
    pub up: Option<u64>,
    pub down: Option<u64>,
}

/// A periodic report as received from an agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficReport {
    pub id: Option<String>,
    pub raw_total_net: Option<RawReading>,

    /// Only honoured when the id has not been seen before.
    pub reset_day: Option<u32>,
    pub reset_hour: Option<u32>,
    pub reset_minute: Option<u32>,

    /// Everything else the agent sent (host name, load, uptime, ...).
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

/// A report that carries an id and a complete raw reading.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedReport {
    pub id: String,
    pub raw: NetCounters,
    pub reset_day: Option<u32>,
    pub reset_hour: Option<u32>,
    pub reset_minute: Option<u32>,
    pub details: Map<String, Value>,
}

impl TrafficReport {
    pub fn new(id: impl Into<String>, up: u64, down: u64) -> Self {
        Self {
            id: Some(id.into()),
            raw_total_net: Some(RawReading {
                up: Some(up),
                down: Some(down),
            }),
            ..Default::default()
        }
    }

    pub fn with_reset_policy(mut self, day: u32, hour: u32, minute: u32) -> Self {
        self.reset_day = Some(day);
        self.reset_hour = Some(hour);
        self.reset_minute = Some(minute);
        self
    }

    pub fn validate(self) -> Result<ValidatedReport> {
        let id = self
            .id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty());
        let raw = match self.raw_total_net {
            Some(RawReading {
                up: Some(up),
                down: Some(down),
            }) => Some(NetCounters::new(up, down)),
            _ => None,
        };

        let (Some(id), Some(raw)) = (id, raw) else {
            return Err(AccountingError::InvalidReport(
                "missing id/counters".to_string(),
            ));
        };

        Ok(ValidatedReport {
            id,
            raw,
            reset_day: self.reset_day,
            reset_hour: self.reset_hour,
            reset_minute: self.reset_minute,
            details: self.details,
        })
    }
}

/// Administrative changes to an existing record. Absent fields are left as
/// they are.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsUpdate {
    pub reset_day: Option<u32>,
    pub reset_hour: Option<u32>,
    pub reset_minute: Option<u32>,
    pub total_traffic_limit: Option<u64>,
    pub traffic_calculation_mode: Option<CalculationMode>,
    /// Manual override of the running total.
    pub total_net: Option<NetCounters>,
}

impl SettingsUpdate {
    pub fn touches_policy(&self) -> bool {
        self.reset_day.is_some() || self.reset_hour.is_some() || self.reset_minute.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: Value) -> TrafficReport {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn agent_payload_splits_known_fields_from_details() {
        let report = parse(json!({
            "id": "srv1",
            "name": "Tokyo edge",
            "cpu": 3.5,
            "rawTotalNet": {"up": 500, "down": 100},
            "resetDay": 15,
        }));

        assert_eq!(report.id.as_deref(), Some("srv1"));
        assert_eq!(report.reset_day, Some(15));
        assert_eq!(report.reset_hour, None);
        assert_eq!(report.details.get("name"), Some(&json!("Tokyo edge")));
        assert!(!report.details.contains_key("rawTotalNet"));

        let valid = report.validate().unwrap();
        assert_eq!(valid.raw, NetCounters::new(500, 100));
    }

    #[test]
    fn missing_id_is_rejected() {
        let err = parse(json!({"rawTotalNet": {"up": 1, "down": 1}}))
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("missing id/counters"));

        assert!(
            parse(json!({"id": "  ", "rawTotalNet": {"up": 1, "down": 1}}))
                .validate()
                .is_err()
        );
    }

    #[test]
    fn missing_or_partial_counters_are_rejected() {
        assert!(parse(json!({"id": "srv1"})).validate().is_err());
        assert!(
            parse(json!({"id": "srv1", "rawTotalNet": {"up": 1}}))
                .validate()
                .is_err()
        );
    }

    #[test]
    fn negative_counters_do_not_parse() {
        let result = serde_json::from_value::<TrafficReport>(
            json!({"id": "srv1", "rawTotalNet": {"up": -1, "down": 0}}),
        );
        assert!(result.is_err());
    }

    #[test]
    fn settings_update_reads_dashboard_fields() {
        let update: SettingsUpdate = serde_json::from_value(json!({
            "resetDay": 10,
            "totalTrafficLimit": 1_000_000_000u64,
            "trafficCalculationMode": "upload-only",
        }))
        .unwrap();

        assert!(update.touches_policy());
        assert_eq!(update.total_traffic_limit, Some(1_000_000_000));
        assert_eq!(update.traffic_calculation_mode, Some(CalculationMode::UploadOnly));
        assert_eq!(update.total_net, None);
        assert!(!SettingsUpdate::default().touches_policy());
    }
}
