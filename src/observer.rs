/// Outbound bus notifications
///
/// The arbiter reports every frame outcome as a one-way notification. It does
/// not depend on what a collaborator does with them (console output, audit
/// logging, forwarding).
use crate::types::{CanFrame, ErrorFlagKind, FaultState, NodeId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A frame that completed without a destroying error flag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommittedFrame {
    pub frame: CanFrame,
    /// Nodes that completed the frame (more than one after an identical collision)
    pub senders: Vec<NodeId>,
    pub tick: u64,
    pub timestamp: DateTime<Utc>,
}

/// Everything the arbiter reports outward
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "details")]
pub enum BusEvent {
    FrameCommitted(CommittedFrame),
    FrameAborted {
        offender: NodeId,
        state_at_detection: FaultState,
        tick: u64,
    },
    ErrorFlag {
        node: NodeId,
        kind: ErrorFlagKind,
        tec: u16,
        tick: u64,
    },
    FaultStateChanged {
        node: NodeId,
        from: FaultState,
        to: FaultState,
        tec: u16,
        rec: u16,
        tick: u64,
    },
    ArbitrationLost {
        node: NodeId,
        /// Bit position (stuff bits included) at which the node backed off
        bit_index: usize,
        tick: u64,
    },
}

impl BusEvent {
    pub fn tick(&self) -> u64 {
        match self {
            BusEvent::FrameCommitted(c) => c.tick,
            BusEvent::FrameAborted { tick, .. }
            | BusEvent::ErrorFlag { tick, .. }
            | BusEvent::FaultStateChanged { tick, .. }
            | BusEvent::ArbitrationLost { tick, .. } => *tick,
        }
    }

    /// Forward this event to the matching observer hook
    pub fn dispatch(&self, observer: &mut dyn BusObserver) {
        observer.on_event(self);
        match self {
            BusEvent::FrameCommitted(committed) => observer.on_frame_committed(committed),
            BusEvent::FrameAborted {
                offender,
                state_at_detection,
                ..
            } => observer.on_frame_aborted(offender, *state_at_detection),
            BusEvent::ErrorFlag {
                node, kind, tec, ..
            } => observer.on_error_flag(node, *kind, *tec),
            BusEvent::FaultStateChanged { node, from, to, .. } => {
                observer.on_fault_state_changed(node, *from, *to)
            }
            BusEvent::ArbitrationLost {
                node, bit_index, ..
            } => observer.on_arbitration_lost(node, *bit_index),
        }
    }
}

/// Receiver of bus outcomes
pub trait BusObserver: Send {
    /// Raw event, seen before the matching typed hook
    fn on_event(&mut self, _event: &BusEvent) {}

    fn on_frame_committed(&mut self, committed: &CommittedFrame);

    fn on_frame_aborted(&mut self, offender: &NodeId, state_at_detection: FaultState);

    fn on_error_flag(&mut self, _node: &NodeId, _kind: ErrorFlagKind, _tec: u16) {}

    fn on_fault_state_changed(&mut self, _node: &NodeId, _from: FaultState, _to: FaultState) {}

    fn on_arbitration_lost(&mut self, _node: &NodeId, _bit_index: usize) {}
}
