/// Fault Confinement Module
///
/// Per-node transmit/receive error counters and the confinement state they
/// drive. Every update is a pure state transition; the state is recomputed
/// from TEC after each call and BUS_OFF is terminal.
use crate::config::FaultPolicy;
use crate::types::{ErrorFlagKind, FaultState};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Transmit/receive error counters of one node
#[derive(Debug, Clone)]
pub struct FaultCounter {
    tec: u16,
    rec: u16,
    state: FaultState,
    policy: FaultPolicy,
    /// Lifetime totals
    tx_successes: u64,
    tx_errors: u64,
    rx_successes: u64,
    rx_error_flags: u64,
}

impl FaultCounter {
    /// Fresh counter: TEC = REC = 0, ERROR_ACTIVE
    pub fn new(policy: FaultPolicy) -> Self {
        Self::with_counts(policy, 0, 0)
    }

    /// Counter starting from given TEC/REC values
    pub fn with_counts(policy: FaultPolicy, tec: u16, rec: u16) -> Self {
        Self {
            tec,
            rec,
            state: FaultState::from_tec(tec),
            policy,
            tx_successes: 0,
            tx_errors: 0,
            rx_successes: 0,
            rx_error_flags: 0,
        }
    }

    pub fn tec(&self) -> u16 {
        self.tec
    }

    pub fn rec(&self) -> u16 {
        self.rec
    }

    pub fn state(&self) -> FaultState {
        self.state
    }

    pub fn is_bus_off(&self) -> bool {
        self.state == FaultState::BusOff
    }

    fn recompute(&mut self) {
        // BUS_OFF is never left through counter updates
        if self.state != FaultState::BusOff {
            self.state = FaultState::from_tec(self.tec);
        }
    }

    /// Frame transmitted without error
    pub fn on_tx_success(&mut self) {
        if self.is_bus_off() {
            return;
        }
        self.tec = self.tec.saturating_sub(1);
        self.tx_successes += 1;
        self.recompute();
    }

    /// Bit error detected while transmitting
    ///
    /// Returns the kind of error flag the node raises, decided by its state
    /// at the moment of detection, or `None` when the node is already bus-off.
    pub fn on_tx_error(&mut self) -> Option<ErrorFlagKind> {
        let flag = match self.state {
            FaultState::ErrorActive => ErrorFlagKind::Active,
            FaultState::ErrorPassive => ErrorFlagKind::Passive,
            FaultState::BusOff => return None,
        };
        self.tec = self.tec.saturating_add(self.policy.tx_error_penalty);
        self.tx_errors += 1;
        self.recompute();
        Some(flag)
    }

    /// Passive error flag went unnoticed under a frame that still completed
    pub fn on_passive_flag_absorbed(&mut self) {
        if self.is_bus_off() {
            return;
        }
        self.tec = self.tec.saturating_sub(self.policy.passive_flag_credit);
        self.recompute();
    }

    /// Frame received without error
    pub fn on_rx_success(&mut self) {
        if self.is_bus_off() {
            return;
        }
        self.rec = self.rec.saturating_sub(1);
        self.rx_successes += 1;
    }

    /// Active error flag observed while listening
    pub fn on_rx_error_flag(&mut self) {
        if self.is_bus_off() {
            return;
        }
        self.rec = self.rec.saturating_add(1);
        self.rx_error_flags += 1;
    }

    pub fn stats(&self) -> FaultCounterStats {
        FaultCounterStats {
            tec: self.tec,
            rec: self.rec,
            state: self.state,
            tx_successes: self.tx_successes,
            tx_errors: self.tx_errors,
            rx_successes: self.rx_successes,
            rx_error_flags: self.rx_error_flags,
        }
    }
}

impl Default for FaultCounter {
    fn default() -> Self {
        Self::new(FaultPolicy::default())
    }
}

/// Snapshot of a node's fault counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultCounterStats {
    pub tec: u16,
    pub rec: u16,
    pub state: FaultState,
    pub tx_successes: u64,
    pub tx_errors: u64,
    pub rx_successes: u64,
    pub rx_error_flags: u64,
}

impl fmt::Display for FaultCounterStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "State: {} | TEC: {} | REC: {} | TX ok/err: {}/{} | RX ok/flags: {}/{}",
            self.state,
            self.tec,
            self.rec,
            self.tx_successes,
            self.tx_errors,
            self.rx_successes,
            self.rx_error_flags
        )
    }
}
