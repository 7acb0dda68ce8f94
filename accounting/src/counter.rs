use serde::{Deserialize, Serialize};

/// Byte counters for both directions of a network interface.
///
/// Used both for the raw cumulative values an agent reports and for the
/// service-side running total of the current billing cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetCounters {
    #[serde(default)]
    pub up: u64,
    #[serde(default)]
    pub down: u64,
}

impl NetCounters {
    pub const ZERO: Self = Self { up: 0, down: 0 };

    pub fn new(up: u64, down: u64) -> Self {
        Self { up, down }
    }

    /// Resolve the traffic accrued between `previous` and `self`, both raw
    /// readings from the same agent.
    pub fn delta_since(&self, previous: &NetCounters) -> CounterDelta {
        CounterDelta {
            bytes: NetCounters {
                up: resolve_delta(previous.up, self.up),
                down: resolve_delta(previous.down, self.down),
            },
            up_restarted: self.up < previous.up,
            down_restarted: self.down < previous.down,
        }
    }

    pub fn saturating_add(self, other: NetCounters) -> Self {
        Self {
            up: self.up.saturating_add(other.up),
            down: self.down.saturating_add(other.down),
        }
    }
}

/// Result of comparing two consecutive raw readings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterDelta {
    pub bytes: NetCounters,
    pub up_restarted: bool,
    pub down_restarted: bool,
}

impl CounterDelta {
    pub fn restarted(&self) -> bool {
        self.up_restarted || self.down_restarted
    }
}

/// Bytes accrued since the previous raw reading.
///
/// A reading lower than its predecessor means the agent's counter source
/// restarted, so the new reading is itself the traffic since the restart.
pub fn resolve_delta(previous: u64, current: u64) -> u64 {
    if current >= previous {
        current - previous
    } else {
        current
    }
}
