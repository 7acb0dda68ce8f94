//! Snapshot format and the one-time migration applied at load.
//!
//! Version 0 is the unversioned layout: a bare object mapping ids to flat
//! records, with reset settings and arbitrary agent fields mixed in at the
//! top level and any field possibly missing. Version 1 wraps the records in
//! `{"version": 1, "entities": {...}}` and keeps agent fields under
//! `details`. Every record that leaves [`migrate`] is fully populated and
//! has an in-range reset policy. A record that never had a `lastReset`
//! starts in the cycle containing the load instant with its totals kept; one
//! whose `lastReset` is present but unreadable is left for the next sweep.

use crate::counter::NetCounters;
use crate::entity::{CalculationMode, RESERVED_DETAIL_KEYS, TrackedEntity};
use crate::error::{AccountingError, Result};
use crate::lenient;
use crate::policy::{DEFAULT_RESET_DAY, DEFAULT_RESET_HOUR, DEFAULT_RESET_MINUTE, ResetPolicy};
use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::{info, warn};

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub version: u32,
    pub entities: BTreeMap<String, TrackedEntity>,
}

impl Default for StoreSnapshot {
    fn default() -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            entities: BTreeMap::new(),
        }
    }
}

impl StoreSnapshot {
    pub fn new(entities: BTreeMap<String, TrackedEntity>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            entities,
        }
    }

    pub fn from_json_str(
        content: &str,
        now: DateTime<Utc>,
        offset: &FixedOffset,
    ) -> Result<(Self, MigrationReport)> {
        let value: Value = serde_json::from_str(content)?;
        migrate(value, now, offset)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// What the migration had to do to produce a clean snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub from_version: u32,
    pub loaded: usize,
    /// Records that could not be read at all.
    pub skipped: Vec<String>,
    /// Records whose fields had to be corrected.
    pub repaired: Vec<String>,
}

impl MigrationReport {
    pub fn is_clean(&self) -> bool {
        self.from_version == SNAPSHOT_VERSION && self.skipped.is_empty() && self.repaired.is_empty()
    }
}

/// Bring a stored value of any known version to the current layout.
///
/// `now` and `offset` place records without a `lastReset` in their current
/// billing cycle.
pub fn migrate(
    value: Value,
    now: DateTime<Utc>,
    offset: &FixedOffset,
) -> Result<(StoreSnapshot, MigrationReport)> {
    let Value::Object(mut root) = value else {
        return Err(AccountingError::InvalidSnapshot(
            "top-level value is not an object".to_string(),
        ));
    };

    let version = match (root.get("version"), root.get("entities")) {
        (Some(Value::Number(version)), Some(Value::Object(_))) => version
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(SNAPSHOT_VERSION),
        _ => 0,
    };

    let mut report = MigrationReport {
        from_version: version,
        ..Default::default()
    };
    let mut entities = BTreeMap::new();

    if version == 0 {
        for (id, record) in root {
            let seed = !has_last_reset(&record);
            match legacy_record(&id, record) {
                Some(entity) => {
                    let entity = finish(entity, seed, now, offset, &mut report);
                    entities.insert(id, entity);
                }
                None => report.skipped.push(id),
            }
        }
    } else {
        if version > SNAPSHOT_VERSION {
            warn!(
                "Snapshot version {} is newer than supported version {}, reading it as {}",
                version, SNAPSHOT_VERSION, SNAPSHOT_VERSION
            );
        }
        let Some(Value::Object(records)) = root.remove("entities") else {
            return Err(AccountingError::InvalidSnapshot(
                "entities is not an object".to_string(),
            ));
        };
        for (id, record) in records {
            let seed = !has_last_reset(&record);
            match serde_json::from_value::<TrackedEntity>(record) {
                Ok(mut entity) => {
                    if entity.id != id {
                        if !entity.id.is_empty() {
                            warn!("Record stored under {} claims id {}, keeping {}", id, entity.id, id);
                        }
                        entity.id = id.clone();
                        report.repaired.push(id.clone());
                    }
                    let entity = finish(entity, seed, now, offset, &mut report);
                    entities.insert(id, entity);
                }
                Err(e) => {
                    warn!("Skipping unreadable record {}: {}", id, e);
                    report.skipped.push(id);
                }
            }
        }
    }

    report.loaded = entities.len();
    Ok((StoreSnapshot::new(entities), report))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyRecord {
    #[serde(default)]
    raw_total_net: Option<NetCounters>,
    #[serde(default)]
    total_net: Option<NetCounters>,
    #[serde(default, deserialize_with = "lenient::number")]
    reset_day: Option<u32>,
    #[serde(default, deserialize_with = "lenient::number")]
    reset_hour: Option<u32>,
    #[serde(default, deserialize_with = "lenient::number")]
    reset_minute: Option<u32>,
    #[serde(default, deserialize_with = "lenient::timestamp::deserialize")]
    last_reset: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient::timestamp::deserialize")]
    last_updated: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient::number")]
    total_traffic_limit: Option<u64>,
    #[serde(default, deserialize_with = "lenient::calculation_mode")]
    traffic_calculation_mode: CalculationMode,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

fn legacy_record(id: &str, record: Value) -> Option<TrackedEntity> {
    let legacy: LegacyRecord = match serde_json::from_value(record) {
        Ok(legacy) => legacy,
        Err(e) => {
            warn!("Skipping unreadable legacy record {}: {}", id, e);
            return None;
        }
    };

    // Out-of-range parts are clamped later in `finish`.
    let reset_policy: ResetPolicy = serde_json::from_value(serde_json::json!({
        "day": legacy.reset_day.unwrap_or(DEFAULT_RESET_DAY),
        "hour": legacy.reset_hour.unwrap_or(DEFAULT_RESET_HOUR),
        "minute": legacy.reset_minute.unwrap_or(DEFAULT_RESET_MINUTE),
    }))
    .ok()?;

    let details = legacy
        .rest
        .into_iter()
        .filter(|(key, _)| !RESERVED_DETAIL_KEYS.contains(&key.as_str()))
        .collect();

    Some(TrackedEntity {
        id: id.to_string(),
        raw_counters: legacy.raw_total_net.unwrap_or_default(),
        accumulated: legacy.total_net.unwrap_or_default(),
        reset_policy,
        last_reset: legacy.last_reset,
        last_updated: legacy.last_updated,
        traffic_limit: legacy.total_traffic_limit.unwrap_or(0),
        calculation_mode: legacy.traffic_calculation_mode,
        details,
    })
}

/// Whether the record carries a `lastReset` field at all, readable or not.
fn has_last_reset(record: &Value) -> bool {
    record
        .as_object()
        .is_some_and(|fields| fields.contains_key("lastReset"))
}

fn finish(
    mut entity: TrackedEntity,
    seed_last_reset: bool,
    now: DateTime<Utc>,
    offset: &FixedOffset,
    report: &mut MigrationReport,
) -> TrackedEntity {
    if !entity.reset_policy.is_valid() {
        let fixed = entity.reset_policy.normalized();
        warn!(
            "Record {} has out-of-range reset policy {:?}, clamped to {:?}",
            entity.id, entity.reset_policy, fixed
        );
        entity.reset_policy = fixed;
        mark_repaired(report, &entity.id);
    }
    if entity.last_reset.is_none() {
        if seed_last_reset {
            let cycle_start = entity.reset_policy.current_cycle_start(now, offset);
            info!(
                "Record {} has no last reset instant, starting its cycle at {}",
                entity.id, cycle_start
            );
            entity.last_reset = Some(cycle_start);
            mark_repaired(report, &entity.id);
        } else {
            warn!(
                "Record {} has an unreadable last reset instant, it will be reset at the next sweep",
                entity.id
            );
        }
    }
    entity
}

fn mark_repaired(report: &mut MigrationReport, id: &str) {
    if !report.repaired.iter().any(|repaired| repaired == id) {
        report.repaired.push(id.to_string());
    }
}
