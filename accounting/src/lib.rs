//! Traffic accounting and billing-cycle reset engine.
//!
//! Agents report cumulative raw byte counters. [`Accountant`] turns those
//! readings into a running per-cycle total that survives counter restarts,
//! and closes each entity's billing cycle at its configured monthly anchor.

pub mod accountant;
pub mod counter;
pub mod entity;
pub mod error;
pub mod lenient;
pub mod migration;
pub mod policy;
pub mod report;

pub use accountant::{
    Accountant, ChangeHook, CycleReset, NoopHook, ReportOutcome, SettingsOutcome, StateChange,
    SweepSummary,
};
pub use counter::{CounterDelta, NetCounters, resolve_delta};
pub use entity::{CalculationMode, TrackedEntity};
pub use error::{AccountingError, Result};
pub use migration::{MigrationReport, SNAPSHOT_VERSION, StoreSnapshot, migrate};
pub use policy::{ResetDecision, ResetPolicy, parse_utc_offset};
pub use report::{RawReading, SettingsUpdate, TrafficReport, ValidatedReport};
