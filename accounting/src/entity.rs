use crate::counter::NetCounters;
use crate::lenient;
use crate::policy::{ResetDecision, ResetPolicy};
use chrono::{DateTime, FixedOffset, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Keys owned by the accounting record. Agents cannot overwrite them through
/// the free-form part of a report.
pub const RESERVED_DETAIL_KEYS: &[&str] = &[
    "id",
    "password",
    "rawTotalNet",
    "totalNet",
    "resetDay",
    "resetHour",
    "resetMinute",
    "resetPolicy",
    "lastReset",
    "lastUpdated",
    "nextReset",
    "online",
    "totalTrafficLimit",
    "trafficCalculationMode",
    "details",
];

/// Which direction of the accumulated total counts against the traffic limit.
///
/// Stored and presented only; enforcing the limit is left to consumers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CalculationMode {
    #[default]
    Bidirectional,
    #[serde(alias = "upload", alias = "up")]
    UploadOnly,
    #[serde(alias = "download", alias = "down")]
    DownloadOnly,
}

/// Accounting state for one reporting agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedEntity {
    #[serde(default)]
    pub id: String,

    /// Last raw counters seen from the agent, the baseline for the next delta.
    #[serde(rename = "rawTotalNet", default)]
    pub raw_counters: NetCounters,

    /// Running total for the current billing cycle.
    #[serde(rename = "totalNet", default)]
    pub accumulated: NetCounters,

    #[serde(default)]
    pub reset_policy: ResetPolicy,

    #[serde(rename = "lastReset", default, with = "lenient::timestamp")]
    pub last_reset: Option<DateTime<Utc>>,

    #[serde(default, with = "lenient::timestamp")]
    pub last_updated: Option<DateTime<Utc>>,

    /// Byte ceiling for the cycle, 0 meaning unlimited.
    #[serde(rename = "totalTrafficLimit", default)]
    pub traffic_limit: u64,

    #[serde(
        rename = "trafficCalculationMode",
        default,
        deserialize_with = "lenient::calculation_mode"
    )]
    pub calculation_mode: CalculationMode,

    /// Latest free-form fields reported by the agent.
    #[serde(default)]
    pub details: Map<String, Value>,
}

impl TrackedEntity {
    /// Record for an agent seen for the first time.
    ///
    /// The first reading only seeds the raw baseline. The last reset is
    /// seeded to the start of the running cycle so that the next anchor,
    /// not the first sweep, closes it.
    pub fn first_seen(
        id: String,
        raw: NetCounters,
        policy: ResetPolicy,
        now: DateTime<Utc>,
        offset: &FixedOffset,
    ) -> Self {
        Self {
            id,
            raw_counters: raw,
            accumulated: NetCounters::ZERO,
            reset_policy: policy,
            last_reset: Some(policy.current_cycle_start(now, offset)),
            last_updated: Some(now),
            traffic_limit: 0,
            calculation_mode: CalculationMode::default(),
            details: Map::new(),
        }
    }

    pub fn apply_delta(&mut self, delta: NetCounters) {
        self.accumulated = self.accumulated.saturating_add(delta);
    }

    /// Zero the running totals and mark `boundary` as the start of the new
    /// cycle. The marker never moves backwards.
    pub fn reset_totals(&mut self, boundary: DateTime<Utc>) {
        self.accumulated = NetCounters::ZERO;
        self.last_reset = Some(match self.last_reset {
            Some(last) if last > boundary => last,
            _ => boundary,
        });
    }

    pub fn evaluate_reset(&self, now: DateTime<Utc>, offset: &FixedOffset) -> ResetDecision {
        self.reset_policy.evaluate(now, self.last_reset, offset)
    }

    /// Shallow-merge report fields, skipping keys the record owns.
    pub fn merge_details(&mut self, details: Map<String, Value>) {
        for (key, value) in details {
            if !RESERVED_DETAIL_KEYS.contains(&key.as_str()) {
                self.details.insert(key, value);
            }
        }
    }

    pub fn is_online(&self, now: DateTime<Utc>, window: TimeDelta) -> bool {
        self.last_updated
            .is_some_and(|updated| now.signed_duration_since(updated) < window)
    }
}
