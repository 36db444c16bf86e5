/// Bus Statistics
///
/// Running totals kept by the arbiter, suitable for end-of-run reports.
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusStats {
    /// Ticks stepped so far
    pub ticks: u64,
    /// Ticks on which some node drove a bit
    pub busy_ticks: u64,
    /// Contention rounds opened
    pub rounds: u64,
    pub frames_committed: u64,
    pub frames_aborted: u64,
    pub arbitration_losses: u64,
    /// Rounds in which several nodes left arbitration with the same identifier
    pub collisions: u64,
    pub active_flags: u64,
    pub passive_flags: u64,
    pub bus_off_events: u64,
    /// Intents dropped because the submitting node was bus-off
    pub ignored_intents: u64,
}

impl BusStats {
    /// Fraction of ticks on which the bus carried traffic
    pub fn bus_load(&self) -> f64 {
        if self.ticks == 0 {
            0.0
        } else {
            self.busy_ticks as f64 / self.ticks as f64
        }
    }

    pub fn error_rate(&self) -> f64 {
        let total = self.frames_committed + self.frames_aborted;
        if total == 0 {
            0.0
        } else {
            self.frames_aborted as f64 / total as f64
        }
    }
}

impl fmt::Display for BusStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Ticks: {} | Load: {:.1}% | Rounds: {} | Committed: {} | Aborted: {} | Arb lost: {} | Collisions: {} | Flags A/P: {}/{} | Bus-off: {}",
            self.ticks,
            self.bus_load() * 100.0,
            self.rounds,
            self.frames_committed,
            self.frames_aborted,
            self.arbitration_losses,
            self.collisions,
            self.active_flags,
            self.passive_flags,
            self.bus_off_events
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rates_on_empty_stats() {
        let stats = BusStats::default();
        assert_eq!(stats.bus_load(), 0.0);
        assert_eq!(stats.error_rate(), 0.0);
    }

    #[test]
    fn test_error_rate() {
        let stats = BusStats {
            frames_committed: 3,
            frames_aborted: 1,
            ..Default::default()
        };
        assert_eq!(stats.error_rate(), 0.25);
    }
}
