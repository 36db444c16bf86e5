/// Simulation Configuration
///
/// Bus timing, error-flag shape and fault-confinement constants, plus the
/// scenario description used by the demo binaries. Everything is plain serde
/// data persisted as JSON.
use colored::*;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Counter deltas applied on transmit errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultPolicy {
    /// TEC increment per transmit bit error
    pub tx_error_penalty: u16,
    /// TEC credit when a passive flag is absorbed by a completed frame
    pub passive_flag_credit: u16,
}

impl Default for FaultPolicy {
    fn default() -> Self {
        Self {
            tx_error_penalty: 8,
            passive_flag_credit: 1, // net +7 for a passive offender
        }
    }
}

/// Bus arbiter configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Wall-clock length of one tick for the async runtime
    pub tick_micros: u64,
    /// Ticks during which intents are batched into one contention round
    pub gather_window_ticks: u32,
    /// Idle ticks between the end of a frame and the next round
    pub interframe_ticks: u32,
    /// Dominant bits in an active error flag
    pub active_flag_len: usize,
    /// Recessive bits in a passive error flag
    pub passive_flag_len: usize,
    /// Recessive bits of the error delimiter
    pub error_delimiter_len: u32,
    /// Bus trace ring size (0 disables tracing)
    pub trace_capacity: usize,
    /// Capacity of the broadcast channel carrying bus events
    pub event_buffer: usize,
    pub fault_policy: FaultPolicy,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            tick_micros: 100,
            gather_window_ticks: 4,
            interframe_ticks: 3,
            active_flag_len: 6,
            passive_flag_len: 8,
            error_delimiter_len: 8,
            trace_capacity: 0,
            event_buffer: 1024,
            fault_policy: FaultPolicy::default(),
        }
    }
}

impl BusConfig {
    pub fn tick_duration(&self) -> Duration {
        Duration::from_micros(self.tick_micros)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.tick_micros == 0 {
            return Err("tick_micros must be greater than zero".to_string());
        }
        if self.active_flag_len == 0 || self.passive_flag_len == 0 {
            return Err("error flags must be at least one bit long".to_string());
        }
        if self.event_buffer == 0 {
            return Err("event_buffer must be greater than zero".to_string());
        }
        Ok(())
    }
}

/// How a periodic sender fills its payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayloadMode {
    /// Same payload every period
    Fixed,
    /// Last byte carries a rolling counter
    Counter,
    /// Fresh random bytes every period
    Random,
}

/// A scheduled sender (victim or bystander)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SenderConfig {
    pub name: String,
    pub node_id: u32,
    pub can_id: u16,
    pub payload: Vec<u8>,
    pub payload_mode: PayloadMode,
    pub period_ticks: u64,
    pub offset_ticks: u64,
    /// TEC the node starts with (0 for a healthy node)
    pub initial_tec: u16,
}

/// The timing-synchronised attacker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttackerConfig {
    pub name: String,
    pub node_id: u32,
    /// Submit this many ticks before the victim is due
    pub lead_ticks: u64,
    /// Stop attacking once the victim is observed bus-off
    pub stop_on_bus_off: bool,
}

/// Complete experiment description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioConfig {
    pub bus: BusConfig,
    pub victim: SenderConfig,
    pub attacker: Option<AttackerConfig>,
    pub bystanders: Vec<SenderConfig>,
    /// Wall-clock run length for the async runtime
    pub duration_secs: u64,
    /// Optional JSON-lines event log
    pub event_log_path: Option<String>,
    /// Seed for random payloads
    pub seed: Option<u64>,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        use crate::types::can_ids;

        Self {
            bus: BusConfig::default(),
            victim: SenderConfig {
                name: "VICTIM_ECU".to_string(),
                node_id: 1,
                can_id: can_ids::VICTIM_STATUS,
                payload: vec![0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC, 0xDE, 0xF0],
                payload_mode: PayloadMode::Fixed,
                period_ticks: 2_000,
                offset_ticks: 100,
                initial_tec: 0,
            },
            attacker: Some(AttackerConfig {
                name: "ATTACKER".to_string(),
                node_id: 99,
                lead_ticks: 1,
                stop_on_bus_off: true,
            }),
            bystanders: vec![SenderConfig {
                name: "BYSTANDER_ECU".to_string(),
                node_id: 2,
                can_id: can_ids::BYSTANDER_TELEMETRY,
                payload: vec![0x00, 0x10],
                payload_mode: PayloadMode::Counter,
                period_ticks: 1_500,
                offset_ticks: 700,
                initial_tec: 0,
            }],
            duration_secs: 20,
            event_log_path: None,
            seed: None,
        }
    }
}

impl ScenarioConfig {
    pub fn validate(&self) -> Result<(), String> {
        self.bus.validate()?;

        let mut ids = vec![self.victim.node_id];
        ids.extend(self.bystanders.iter().map(|b| b.node_id));
        if let Some(attacker) = &self.attacker {
            ids.push(attacker.node_id);
        }
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        sorted.dedup();
        if sorted.len() != ids.len() {
            return Err("node ids must be unique".to_string());
        }

        for sender in std::iter::once(&self.victim).chain(self.bystanders.iter()) {
            if sender.period_ticks == 0 {
                return Err(format!("{}: period_ticks must be greater than zero", sender.name));
            }
            if sender.payload.len() > 8 {
                return Err(format!("{}: payload longer than 8 bytes", sender.name));
            }
        }
        Ok(())
    }

    /// Load and validate a scenario from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, String> {
        let json = fs::read_to_string(path.as_ref()).map_err(|e| {
            format!(
                "Failed to read scenario from {}: {}",
                path.as_ref().display(),
                e
            )
        })?;
        let config: ScenarioConfig = serde_json::from_str(&json)
            .map_err(|e| format!("Failed to parse scenario JSON: {}", e))?;
        config.validate()?;

        println!(
            "{} Scenario loaded from {}",
            "✓".green(),
            path.as_ref().display().to_string().bright_white()
        );
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), String> {
        let json = serde_json::to_string_pretty(self).map_err(|e| e.to_string())?;
        fs::write(path.as_ref(), json).map_err(|e| {
            format!(
                "Failed to write scenario to {}: {}",
                path.as_ref().display(),
                e
            )
        })?;
        Ok(())
    }
}
