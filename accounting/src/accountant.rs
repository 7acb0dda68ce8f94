use crate::counter::{CounterDelta, NetCounters};
use crate::entity::TrackedEntity;
use crate::error::{AccountingError, Result};
use crate::migration::StoreSnapshot;
use crate::policy::{ResetDecision, ResetPolicy};
use crate::report::{SettingsUpdate, TrafficReport};
use chrono::{DateTime, FixedOffset, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// A state change that may need persisting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateChange {
    Registered(String),
    Accumulated(String),
    CyclesReset(Vec<String>),
    SettingsUpdated(String),
    Removed(String),
}

/// Fired after every state-changing operation, once the entity lock has
/// been released. Implementations decide whether and when to flush.
pub trait ChangeHook: Send + Sync {
    fn state_changed(&self, change: &StateChange);
}

pub struct NoopHook;

impl ChangeHook for NoopHook {
    fn state_changed(&self, _change: &StateChange) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    /// First report for this id; the reading only seeded the baseline.
    Registered,
    Accumulated(CounterDelta),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReset {
    pub id: String,
    pub boundary: DateTime<Utc>,
    /// Totals that were cleared by the reset.
    pub cleared: NetCounters,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub checked: usize,
    pub resets: Vec<CycleReset>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SettingsOutcome {
    pub entity: TrackedEntity,
    /// Boundary of the reset triggered by a policy change, if any.
    pub reset: Option<DateTime<Utc>>,
}

/// Owner of all per-entity accounting state.
///
/// Each record lives in its own map entry; every read-modify-write happens
/// while holding that entry's exclusive guard, so a report and a sweep for
/// the same entity never interleave.
pub struct Accountant {
    entities: DashMap<String, TrackedEntity>,
    offset: FixedOffset,
    hook: Arc<dyn ChangeHook>,
}

impl Accountant {
    pub fn new(offset: FixedOffset, hook: Arc<dyn ChangeHook>) -> Self {
        Self::from_snapshot(StoreSnapshot::default(), offset, hook)
    }

    pub fn from_snapshot(
        snapshot: StoreSnapshot,
        offset: FixedOffset,
        hook: Arc<dyn ChangeHook>,
    ) -> Self {
        Self {
            entities: snapshot.entities.into_iter().collect(),
            offset,
            hook,
        }
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<TrackedEntity> {
        self.entities.get(id).map(|entry| entry.value().clone())
    }

    /// All records, ordered by id.
    pub fn list(&self) -> Vec<TrackedEntity> {
        let mut entities: Vec<_> = self
            .entities
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        entities.sort_by(|a, b| a.id.cmp(&b.id));
        entities
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot::new(
            self.entities
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().clone()))
                .collect(),
        )
    }

    /// Apply one agent report: register the agent on first sight, otherwise
    /// add the traffic since its previous report to the running total.
    #[instrument(skip(self, report), fields(id = ?report.id))]
    pub fn ingest(&self, report: TrafficReport, now: DateTime<Utc>) -> Result<ReportOutcome> {
        let report = report.validate()?;

        let (change, outcome) = match self.entities.entry(report.id.clone()) {
            Entry::Occupied(mut occupied) => {
                let entity = occupied.get_mut();
                let delta = report.raw.delta_since(&entity.raw_counters);
                if delta.restarted() {
                    info!(
                        "Raw counters of {} went backwards ({:?} -> {:?}), treating as agent restart",
                        entity.id, entity.raw_counters, report.raw
                    );
                }

                entity.apply_delta(delta.bytes);
                entity.raw_counters = report.raw;
                entity.last_updated = Some(now);
                entity.merge_details(report.details);

                debug!(
                    "Accumulated +{}/+{} bytes for {}, cycle total {}/{}",
                    delta.bytes.up,
                    delta.bytes.down,
                    entity.id,
                    entity.accumulated.up,
                    entity.accumulated.down
                );
                (
                    StateChange::Accumulated(report.id),
                    ReportOutcome::Accumulated(delta),
                )
            }
            Entry::Vacant(vacant) => {
                let policy =
                    ResetPolicy::from_parts(report.reset_day, report.reset_hour, report.reset_minute)?;
                let mut entity = TrackedEntity::first_seen(
                    report.id.clone(),
                    report.raw,
                    policy,
                    now,
                    &self.offset,
                );
                entity.merge_details(report.details);

                info!(
                    "Registered new entity {} with reset policy {:?}, current cycle started at {:?}",
                    entity.id, policy, entity.last_reset
                );
                vacant.insert(entity);
                (StateChange::Registered(report.id), ReportOutcome::Registered)
            }
        };

        self.hook.state_changed(&change);
        Ok(outcome)
    }

    /// Evaluate the reset policy of a single entity without changing it.
    pub fn evaluate(&self, id: &str, now: DateTime<Utc>) -> Result<ResetDecision> {
        self.entities
            .get(id)
            .map(|entry| entry.evaluate_reset(now, &self.offset))
            .ok_or_else(|| AccountingError::EntityNotFound(id.to_string()))
    }

    /// Close every billing cycle whose boundary has passed.
    ///
    /// Safe to call at any frequency: each crossed boundary produces exactly
    /// one reset, and an interrupted sweep is completed by the next one.
    #[instrument(skip(self))]
    pub fn sweep_resets(&self, now: DateTime<Utc>) -> SweepSummary {
        let mut summary = SweepSummary::default();

        for mut entry in self.entities.iter_mut() {
            summary.checked += 1;
            let entity = entry.value_mut();
            let decision = entity.evaluate_reset(now, &self.offset);
            if !decision.due {
                debug!(
                    "{}: last reset {:?}, next reset {}",
                    entity.id,
                    entity.last_reset,
                    entity.reset_policy.next_cycle_start(now, &self.offset)
                );
                continue;
            }

            let cleared = entity.accumulated;
            entity.reset_totals(decision.boundary);
            info!(
                "Billing cycle of {} rolled over at {}, cleared {}/{} bytes",
                entity.id, decision.boundary, cleared.up, cleared.down
            );
            summary.resets.push(CycleReset {
                id: entity.id.clone(),
                boundary: decision.boundary,
                cleared,
            });
        }

        if !summary.resets.is_empty() {
            let ids = summary.resets.iter().map(|reset| reset.id.clone()).collect();
            self.hook.state_changed(&StateChange::CyclesReset(ids));
        }
        summary
    }

    /// Apply administrative settings to an existing record.
    ///
    /// A changed reset policy is evaluated at once, so an anchor that has
    /// already passed in the current month closes the cycle immediately. A
    /// manual total override is applied after that evaluation.
    #[instrument(skip(self, update))]
    pub fn update_settings(
        &self,
        id: &str,
        update: SettingsUpdate,
        now: DateTime<Utc>,
    ) -> Result<SettingsOutcome> {
        let outcome = {
            let mut entity = self
                .entities
                .get_mut(id)
                .ok_or_else(|| AccountingError::EntityNotFound(id.to_string()))?;

            let policy = entity.reset_policy.with_overrides(
                update.reset_day,
                update.reset_hour,
                update.reset_minute,
            )?;

            if let Some(limit) = update.total_traffic_limit {
                entity.traffic_limit = limit;
            }
            if let Some(mode) = update.traffic_calculation_mode {
                entity.calculation_mode = mode;
            }

            let mut reset = None;
            if update.touches_policy() && policy != entity.reset_policy {
                info!(
                    "Reset policy of {} changed from {:?} to {:?}",
                    id, entity.reset_policy, policy
                );
                entity.reset_policy = policy;

                let decision = entity.evaluate_reset(now, &self.offset);
                if decision.due {
                    entity.reset_totals(decision.boundary);
                    info!(
                        "New anchor for {} has already passed, cycle reset at {}",
                        id, decision.boundary
                    );
                    reset = Some(decision.boundary);
                }
            }

            if let Some(totals) = update.total_net {
                info!(
                    "Cycle total of {} manually set to {}/{}",
                    id, totals.up, totals.down
                );
                entity.accumulated = totals;
            }

            SettingsOutcome {
                entity: entity.clone(),
                reset,
            }
        };

        self.hook
            .state_changed(&StateChange::SettingsUpdated(id.to_string()));
        Ok(outcome)
    }

    #[instrument(skip(self))]
    pub fn remove(&self, id: &str) -> Result<TrackedEntity> {
        let (_, entity) = self
            .entities
            .remove(id)
            .ok_or_else(|| AccountingError::EntityNotFound(id.to_string()))?;
        info!("Removed entity {}", id);
        self.hook.state_changed(&StateChange::Removed(id.to_string()));
        Ok(entity)
    }
}
