use crate::arbiter::NodeSnapshot;
use crate::observer::{BusObserver, CommittedFrame};
use crate::stats::BusStats;
use crate::types::{ErrorFlagKind, FaultState, NodeId};
use colored::*;

/// Prints bus outcomes to the console as they happen
#[derive(Debug, Clone)]
pub struct ConsoleReporter {
    /// Also print every committed frame and arbitration loss
    verbose: bool,
    committed: u64,
}

impl ConsoleReporter {
    pub fn new(verbose: bool) -> Self {
        Self {
            verbose,
            committed: 0,
        }
    }

    pub fn committed(&self) -> u64 {
        self.committed
    }
}

impl Default for ConsoleReporter {
    fn default() -> Self {
        Self::new(false)
    }
}

pub fn colored_state(state: FaultState) -> ColoredString {
    match state {
        FaultState::ErrorActive => state.as_str().green(),
        FaultState::ErrorPassive => state.as_str().yellow(),
        FaultState::BusOff => state.as_str().red().bold(),
    }
}

impl BusObserver for ConsoleReporter {
    fn on_frame_committed(&mut self, committed: &CommittedFrame) {
        self.committed += 1;
        if !self.verbose {
            return;
        }
        let senders = committed
            .senders
            .iter()
            .map(|n| n.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        println!(
            "{} [{}] {} │ {}",
            "→".green(),
            format!("t={:>8}", committed.tick).bright_black(),
            committed.frame.to_string().bright_white(),
            senders.cyan()
        );
    }

    fn on_frame_aborted(&mut self, offender: &NodeId, state_at_detection: FaultState) {
        println!(
            "{} Frame destroyed by bit error of {} (was {})",
            "✗".red(),
            offender.to_string().bright_white(),
            colored_state(state_at_detection)
        );
    }

    fn on_error_flag(&mut self, node: &NodeId, kind: ErrorFlagKind, tec: u16) {
        let kind = match kind {
            ErrorFlagKind::Active => "ACTIVE".red(),
            ErrorFlagKind::Passive => "PASSIVE".yellow(),
        };
        println!(
            "{} {} raised {} error flag │ TEC: {}",
            "⚠".yellow(),
            node.to_string().bright_white(),
            kind,
            tec.to_string().bright_yellow()
        );
    }

    fn on_fault_state_changed(&mut self, node: &NodeId, from: FaultState, to: FaultState) {
        let marker = if to == FaultState::BusOff {
            "☠".red().bold()
        } else {
            "ℹ".bright_blue()
        };
        println!(
            "{} {} {} → {}",
            marker,
            node.to_string().bright_white().bold(),
            colored_state(from),
            colored_state(to)
        );
    }

    fn on_arbitration_lost(&mut self, node: &NodeId, bit_index: usize) {
        if self.verbose {
            println!(
                "{} {} backed off at bit {}",
                "·".bright_black(),
                node,
                bit_index
            );
        }
    }
}

/// End-of-run table of node counters plus bus totals
pub fn print_summary(nodes: &[NodeSnapshot], stats: &BusStats) {
    println!();
    println!(
        "{}",
        "═══════════════════════════════════════════════════════════════"
            .cyan()
            .bold()
    );
    println!("{}", "                     BUS SUMMARY".cyan().bold());
    println!(
        "{}",
        "═══════════════════════════════════════════════════════════════"
            .cyan()
            .bold()
    );
    for node in nodes {
        println!(
            "  {:<24} TEC: {:>3}  REC: {:>3}  {}",
            node.node.to_string().bright_white(),
            node.tec,
            node.rec,
            colored_state(node.state)
        );
    }
    println!();
    println!("  {}", stats);
    println!();
}
