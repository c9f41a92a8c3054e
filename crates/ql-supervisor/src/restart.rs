//! Bounded auto-restart tracking.
//!
//! Per-app tracker of restart attempts. Once the attempt budget is spent
//! the tracker freezes for five minutes measured from the blocking
//! attempt; a stability reset (60 s of uninterrupted life after a
//! restart) clears it entirely so the full budget reaccumulates.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Cooldown applied when the attempt budget is exhausted.
fn cooldown() -> Duration {
    Duration::minutes(5)
}

/// Restart bookkeeping for one app.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartTracker {
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_attempt: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_until: Option<DateTime<Utc>>,
}

/// Guarded map of restart trackers.
#[derive(Default)]
pub struct RestartPolicy {
    trackers: Mutex<HashMap<String, RestartTracker>>,
}

impl RestartPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a restart may fire now: `attempts < max ∧ now ≥ cooldown`.
    ///
    /// An expired cooldown thaws the tracker (attempts reset), restoring
    /// the full budget.
    pub fn should_restart(&self, app_id: &str, max_attempts: u32) -> bool {
        let now = Utc::now();
        let mut trackers = self.trackers.lock();
        let tracker = trackers.entry(app_id.to_string()).or_default();

        if let Some(until) = tracker.cooldown_until {
            if now < until {
                debug!(
                    "Restart blocked for {}: cooldown until {}",
                    app_id, until
                );
                return false;
            }
            info!("Restart cooldown expired for {}, budget restored", app_id);
            tracker.attempts = 0;
            tracker.cooldown_until = None;
        }

        tracker.attempts < max_attempts
    }

    /// Record one attempt; freezes the tracker when the budget is spent.
    pub fn note_attempt(&self, app_id: &str, max_attempts: u32) -> RestartTracker {
        let now = Utc::now();
        let mut trackers = self.trackers.lock();
        let tracker = trackers.entry(app_id.to_string()).or_default();

        tracker.attempts += 1;
        tracker.last_attempt = Some(now);
        if tracker.attempts >= max_attempts {
            tracker.cooldown_until = Some(now + cooldown());
            warn!(
                "Restart budget exhausted for {} ({} attempts), cooling down 5 minutes",
                app_id, tracker.attempts
            );
        }
        tracker.clone()
    }

    /// Stability reset: the replacement ran long enough.
    pub fn clear(&self, app_id: &str) {
        if self.trackers.lock().remove(app_id).is_some() {
            info!("Restart tracker cleared for {} (stable)", app_id);
        }
    }

    pub fn get(&self, app_id: &str) -> Option<RestartTracker> {
        self.trackers.lock().get(app_id).cloned()
    }
}
