use accounting::{Accountant, SweepSummary};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Periodically closes billing cycles whose anchor has passed.
///
/// The first sweep runs immediately so that boundaries crossed while the
/// process was down are handled at start-up.
pub struct ResetScheduler {
    accountant: Arc<Accountant>,
    interval: Duration,
}

impl ResetScheduler {
    pub fn new(accountant: Arc<Accountant>, interval: Duration) -> Self {
        Self {
            accountant,
            interval,
        }
    }

    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("Traffic reset check every {:?}", self.interval);

        loop {
            ticker.tick().await;
            self.run_once(Utc::now());
        }
    }

    pub fn run_once(&self, now: DateTime<Utc>) -> SweepSummary {
        let summary = self.accountant.sweep_resets(now);
        if summary.resets.is_empty() {
            debug!("Checked {} entities, no reset needed", summary.checked);
        } else {
            info!(
                "Checked {} entities, reset {}",
                summary.checked,
                summary.resets.len()
            );
        }
        summary
    }
}
