use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct GuestTaskMetrics {
    pub guest: String,
    pub succeeded: bool,
    pub duration_ms: u128,
}

/// Outcome counts of one fan-out call.
///
/// `missing` counts guests that neither succeeded nor failed before the
/// join deadline.
#[derive(Debug, Clone, Serialize)]
pub struct FleetMetrics {
    pub operation: String,
    pub started_at: DateTime<Utc>,
    pub dispatched: usize,
    pub completed: usize,
    pub failed: usize,
    pub missing: usize,
    pub total_duration_ms: u128,
    pub guests: Vec<GuestTaskMetrics>,
}

impl FleetMetrics {
    pub fn timed_out(&self) -> bool {
        self.missing > 0
    }

    pub fn guest_duration_ms(&self, guest: &str) -> Option<u128> {
        self.guests
            .iter()
            .find(|m| m.guest == guest)
            .map(|m| m.duration_ms)
    }
}
