/// Bus Arbiter
///
/// Single owner of the shared medium. Each `step()` resolves exactly one bit
/// time: it collects what every participating node offers, computes the
/// wired-AND level, applies arbitration and bit monitoring, and advances the
/// bus state machine. Fault counters and transmit cursors of all nodes live
/// here so that every counter mutation happens in one place.
use crate::config::BusConfig;
use crate::cursor::TransmitCursor;
use crate::error::SimError;
use crate::fault::FaultCounter;
use crate::observer::{BusEvent, BusObserver, CommittedFrame};
use crate::stats::BusStats;
use crate::trace::{BusTrace, TraceEntry};
use crate::types::{BitPolarity, CanFrame, ErrorFlagKind, FaultState, FrameField, NodeId};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;

/// Bus-level protocol state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BusState {
    Idle,
    /// Intents are being collected into the next contention round
    Gathering { remaining: u32 },
    Arbitration,
    Transmission,
    ErrorFlag,
    ErrorDelimiter { remaining: u32 },
    EndOfFrame,
    Interframe { remaining: u32 },
}

impl BusState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BusState::Idle => "IDLE",
            BusState::Gathering { .. } => "GATHERING",
            BusState::Arbitration => "ARBITRATION",
            BusState::Transmission => "TRANSMISSION",
            BusState::ErrorFlag => "ERROR_FLAG",
            BusState::ErrorDelimiter { .. } => "ERROR_DELIMITER",
            BusState::EndOfFrame => "END_OF_FRAME",
            BusState::Interframe { .. } => "INTERFRAME",
        }
    }
}

impl fmt::Display for BusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Point-in-time view of one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub node: NodeId,
    pub tec: u16,
    pub rec: u16,
    pub state: FaultState,
    pub pending: usize,
}

struct NodeSlot {
    identity: NodeId,
    counter: FaultCounter,
    cursor: TransmitCursor,
    queue: VecDeque<CanFrame>,
}

impl NodeSlot {
    fn is_eligible(&self) -> bool {
        !self.counter.is_bus_off() && !self.queue.is_empty()
    }
}

/// Nodes taking part in the frame currently on the bus
#[derive(Debug, Default)]
struct ContentionRound {
    /// Everyone who entered the round
    participants: Vec<usize>,
    /// Still in arbitration
    contenders: Vec<usize>,
    /// Won arbitration and still transmitting
    senders: Vec<usize>,
    /// Emitting (or done emitting) an error flag
    flaggers: Vec<usize>,
    passive_flaggers: Vec<usize>,
    /// Raised a transmit error this round
    offenders: Vec<usize>,
    primary_offender: Option<(NodeId, FaultState)>,
    frame_ok: bool,
    rec_applied: bool,
}

impl ContentionRound {
    fn open(participants: Vec<usize>) -> Self {
        Self {
            contenders: participants.clone(),
            participants,
            frame_ok: true,
            ..Default::default()
        }
    }

    fn is_flagging(&self, idx: usize) -> bool {
        self.flaggers.contains(&idx)
    }

    /// Drop a node from every active set; it stays a participant for cleanup
    fn withdraw(&mut self, idx: usize) {
        self.contenders.retain(|&i| i != idx);
        self.senders.retain(|&i| i != idx);
        self.flaggers.retain(|&i| i != idx);
        self.passive_flaggers.retain(|&i| i != idx);
    }
}

/// The bus state machine
pub struct BusArbiter {
    config: BusConfig,
    slots: Vec<NodeSlot>,
    index: HashMap<u32, usize>,
    state: BusState,
    round: Option<ContentionRound>,
    tick: u64,
    stats: BusStats,
    trace: BusTrace,
    observers: Vec<Box<dyn BusObserver>>,
}

impl BusArbiter {
    pub fn new(config: BusConfig) -> Self {
        let trace = BusTrace::new(config.trace_capacity);
        Self {
            config,
            slots: Vec::new(),
            index: HashMap::new(),
            state: BusState::Idle,
            round: None,
            tick: 0,
            stats: BusStats::default(),
            trace,
            observers: Vec::new(),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Attach a node to the bus with fresh counters
    pub fn register_node(&mut self, node: NodeId) -> Result<(), SimError> {
        if let Some(&idx) = self.index.get(&node.id) {
            return Err(SimError::DuplicateNode {
                existing: self.slots[idx].identity.clone(),
                rejected: node,
            });
        }
        self.index.insert(node.id, self.slots.len());
        self.slots.push(NodeSlot {
            identity: node,
            counter: FaultCounter::new(self.config.fault_policy),
            cursor: TransmitCursor::new(),
            queue: VecDeque::new(),
        });
        Ok(())
    }

    fn slot_index(&self, node: &NodeId) -> Result<usize, SimError> {
        match self.index.get(&node.id) {
            Some(&idx) if self.slots[idx].identity == *node => Ok(idx),
            _ => Err(SimError::UnknownNode(node.clone())),
        }
    }

    /// Queue a frame the node wants to transmit
    ///
    /// Intents from a bus-off node are accepted and dropped.
    pub fn submit_intent(&mut self, node: &NodeId, frame: CanFrame) -> Result<(), SimError> {
        let idx = self.slot_index(node)?;
        if !frame.is_valid() {
            return Err(SimError::PayloadTooLong {
                node: node.clone(),
                len: frame.data.len(),
            });
        }
        let slot = &mut self.slots[idx];
        if slot.counter.is_bus_off() {
            self.stats.ignored_intents += 1;
            return Ok(());
        }
        slot.queue.push_back(frame);
        Ok(())
    }

    /// Overwrite a node's counters, e.g. to start an experiment mid-attack
    ///
    /// A node pushed to bus-off leaves the bus at once, even mid-frame.
    pub fn set_counters(&mut self, node: &NodeId, tec: u16, rec: u16) -> Result<(), SimError> {
        let idx = self.slot_index(node)?;
        let slot = &mut self.slots[idx];
        slot.counter = FaultCounter::with_counts(self.config.fault_policy, tec, rec);
        if slot.counter.is_bus_off() {
            slot.queue.clear();
            slot.cursor.reset();
            if let Some(round) = self.round.as_mut() {
                round.withdraw(idx);
            }
        }
        Ok(())
    }

    pub fn add_observer(&mut self, observer: Box<dyn BusObserver>) {
        self.observers.push(observer);
    }

    pub fn state(&self) -> BusState {
        self.state
    }

    /// Number of steps taken so far
    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn stats(&self) -> &BusStats {
        &self.stats
    }

    pub fn trace(&self) -> &BusTrace {
        &self.trace
    }

    pub fn fault_state(&self, node: &NodeId) -> Result<FaultState, SimError> {
        let idx = self.slot_index(node)?;
        Ok(self.slots[idx].counter.state())
    }

    /// (TEC, REC) of a node
    pub fn counters(&self, node: &NodeId) -> Result<(u16, u16), SimError> {
        let idx = self.slot_index(node)?;
        let counter = &self.slots[idx].counter;
        Ok((counter.tec(), counter.rec()))
    }

    pub fn fault_counter(&self, node: &NodeId) -> Result<&FaultCounter, SimError> {
        let idx = self.slot_index(node)?;
        Ok(&self.slots[idx].counter)
    }

    pub fn pending_intents(&self, node: &NodeId) -> Result<usize, SimError> {
        let idx = self.slot_index(node)?;
        Ok(self.slots[idx].queue.len())
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeId> {
        self.slots.iter().map(|s| &s.identity)
    }

    pub fn node_snapshots(&self) -> Vec<NodeSnapshot> {
        self.slots
            .iter()
            .map(|s| NodeSnapshot {
                node: s.identity.clone(),
                tec: s.counter.tec(),
                rec: s.counter.rec(),
                state: s.counter.state(),
                pending: s.queue.len(),
            })
            .collect()
    }

    /// Idle bus and nothing waiting to go out
    pub fn is_quiescent(&self) -> bool {
        self.state == BusState::Idle && !self.slots.iter().any(NodeSlot::is_eligible)
    }

    /// Step until the bus is quiescent or `max_ticks` steps were taken
    pub fn run_until_idle(&mut self, max_ticks: u64) -> Vec<BusEvent> {
        let mut events = Vec::new();
        for _ in 0..max_ticks {
            if self.is_quiescent() {
                break;
            }
            events.extend(self.step());
        }
        events
    }

    /// Resolve one bit time
    pub fn step(&mut self) -> Vec<BusEvent> {
        let mut events = Vec::new();
        let executed = self.state;

        let (bit, field) = match executed {
            BusState::Idle => {
                self.step_idle();
                (None, None)
            }
            BusState::Gathering { remaining } => {
                if remaining <= 1 {
                    self.open_round();
                } else {
                    self.state = BusState::Gathering {
                        remaining: remaining - 1,
                    };
                }
                (None, None)
            }
            BusState::Arbitration => self.step_arbitration(&mut events),
            BusState::Transmission => self.step_transmission(&mut events),
            BusState::ErrorFlag => self.step_error_flag(),
            BusState::ErrorDelimiter { remaining } => {
                self.state = if remaining <= 1 {
                    BusState::EndOfFrame
                } else {
                    BusState::ErrorDelimiter {
                        remaining: remaining - 1,
                    }
                };
                (Some(BitPolarity::Recessive), Some(FrameField::ErrorDelimiter))
            }
            BusState::EndOfFrame => {
                self.finish_round(&mut events);
                (None, None)
            }
            BusState::Interframe { remaining } => {
                self.state = if remaining <= 1 {
                    BusState::Idle
                } else {
                    BusState::Interframe {
                        remaining: remaining - 1,
                    }
                };
                (None, None)
            }
        };

        self.stats.ticks += 1;
        if bit.is_some() {
            self.stats.busy_ticks += 1;
        }
        self.trace.record(TraceEntry {
            tick: self.tick,
            state: executed,
            bit,
            field,
        });

        for event in &events {
            for observer in self.observers.iter_mut() {
                event.dispatch(observer.as_mut());
            }
        }

        self.tick += 1;
        events
    }

    fn step_idle(&mut self) {
        if !self.slots.iter().any(NodeSlot::is_eligible) {
            return;
        }
        if self.config.gather_window_ticks == 0 {
            self.open_round();
        } else {
            self.state = BusState::Gathering {
                remaining: self.config.gather_window_ticks,
            };
        }
    }

    /// Load the head intent of every eligible node and start arbitration
    fn open_round(&mut self) {
        let mut participants = Vec::new();
        for (idx, slot) in self.slots.iter_mut().enumerate() {
            if !slot.is_eligible() {
                continue;
            }
            if let Some(frame) = slot.queue.pop_front() {
                slot.cursor.load_frame(frame);
                participants.push(idx);
            }
        }

        if participants.is_empty() {
            self.state = BusState::Idle;
            return;
        }
        self.stats.rounds += 1;
        self.round = Some(ContentionRound::open(participants));
        self.state = BusState::Arbitration;
    }

    fn step_arbitration(
        &mut self,
        events: &mut Vec<BusEvent>,
    ) -> (Option<BitPolarity>, Option<FrameField>) {
        let Some(mut round) = self.round.take() else {
            self.state = BusState::Idle;
            return (None, None);
        };

        let offers: Vec<(usize, BitPolarity, FrameField)> = round
            .contenders
            .iter()
            .filter_map(|&idx| self.slots[idx].cursor.peek().map(|(b, f)| (idx, b, f)))
            .collect();
        let bus = BitPolarity::wired_and(offers.iter().map(|(_, b, _)| *b));
        let field = offers.first().map(|(_, _, f)| *f);

        let mut arbitration_done = false;
        for &(idx, offered, offered_field) in &offers {
            if offered_field == FrameField::Rtr {
                arbitration_done = true;
            }
            if offered == BitPolarity::Recessive && bus == BitPolarity::Dominant {
                let slot = &mut self.slots[idx];
                let bit_index = slot.cursor.position();
                if let Some(frame) = slot.cursor.frame().cloned() {
                    slot.queue.push_front(frame);
                }
                slot.cursor.reset();
                round.contenders.retain(|&c| c != idx);
                self.stats.arbitration_losses += 1;
                events.push(BusEvent::ArbitrationLost {
                    node: slot.identity.clone(),
                    bit_index,
                    tick: self.tick,
                });
            }
        }

        for &idx in &round.contenders {
            self.slots[idx].cursor.advance();
        }

        if arbitration_done || round.contenders.is_empty() {
            if round.contenders.len() > 1 {
                self.stats.collisions += 1;
            }
            round.senders = std::mem::take(&mut round.contenders);
            self.state = BusState::Transmission;
        }

        self.round = Some(round);
        (Some(bus), field)
    }

    fn step_transmission(
        &mut self,
        events: &mut Vec<BusEvent>,
    ) -> (Option<BitPolarity>, Option<FrameField>) {
        let Some(mut round) = self.round.take() else {
            self.state = BusState::Idle;
            return (None, None);
        };

        let sender_offers: Vec<(usize, BitPolarity, FrameField)> = round
            .senders
            .iter()
            .filter_map(|&idx| self.slots[idx].cursor.peek().map(|(b, f)| (idx, b, f)))
            .collect();
        let flag_offers: Vec<(usize, BitPolarity)> = round
            .flaggers
            .iter()
            .filter_map(|&idx| self.slots[idx].cursor.peek().map(|(b, _)| (idx, b)))
            .collect();

        let mut bus = BitPolarity::wired_and(
            sender_offers
                .iter()
                .map(|(_, b, _)| *b)
                .chain(flag_offers.iter().map(|(_, b)| *b)),
        );
        let mut field = sender_offers.first().map(|(_, _, f)| *f);
        if flag_offers.iter().any(|(_, b)| b.is_dominant()) {
            field = Some(FrameField::ErrorFlag);
        }

        let in_ack_slot = sender_offers
            .iter()
            .any(|(_, _, f)| *f == FrameField::AckSlot);
        if in_ack_slot && self.has_listener(&round) {
            bus = BitPolarity::Dominant;
        }

        // Arbitration is over, so any recessive bit overwritten here is a bit error
        let offenders: Vec<usize> = sender_offers
            .iter()
            .filter(|(_, offered, f)| {
                *f != FrameField::AckSlot
                    && !f.is_arbitration()
                    && *offered == BitPolarity::Recessive
                    && bus == BitPolarity::Dominant
            })
            .map(|(idx, _, _)| *idx)
            .collect();

        for (idx, _, _) in &sender_offers {
            if !offenders.contains(idx) {
                self.slots[*idx].cursor.advance();
            }
        }
        for (idx, _) in &flag_offers {
            self.slots[*idx].cursor.advance();
        }

        let mut active_flag_raised = false;
        for idx in offenders {
            round.senders.retain(|&s| s != idx);
            round.offenders.push(idx);
            if self.raise_tx_error(idx, &mut round, events) == Some(ErrorFlagKind::Active) {
                active_flag_raised = true;
            }
        }

        if active_flag_raised {
            self.apply_error_flag_rec(&mut round);
            // An active flag destroys the frame for everyone still sending
            for idx in std::mem::take(&mut round.senders) {
                self.slots[idx].cursor.reset();
            }
            self.state = BusState::ErrorFlag;
        } else {
            let senders_done = round
                .senders
                .iter()
                .all(|&idx| self.slots[idx].cursor.is_exhausted());
            let flags_done = round
                .flaggers
                .iter()
                .all(|&idx| self.slots[idx].cursor.is_exhausted());
            if senders_done && flags_done {
                if round.senders.is_empty() && !round.flaggers.is_empty() {
                    self.state = self.after_flags();
                } else {
                    self.state = BusState::EndOfFrame;
                }
            }
        }

        self.round = Some(round);
        (Some(bus), field)
    }

    /// A non-bus-off node outside the sending/flagging set drives the ACK slot
    fn has_listener(&self, round: &ContentionRound) -> bool {
        self.slots.iter().enumerate().any(|(idx, slot)| {
            !slot.counter.is_bus_off() && !round.senders.contains(&idx) && !round.is_flagging(idx)
        })
    }

    /// Charge a transmit error and start the node's flag
    fn raise_tx_error(
        &mut self,
        idx: usize,
        round: &mut ContentionRound,
        events: &mut Vec<BusEvent>,
    ) -> Option<ErrorFlagKind> {
        let state_at_detection = self.slots[idx].counter.state();
        let mut flag = None;
        self.update_counter(idx, events, |c| flag = c.on_tx_error());

        if round.primary_offender.is_none()
            || (flag == Some(ErrorFlagKind::Active)
                && !matches!(
                    round.primary_offender,
                    Some((_, FaultState::ErrorActive))
                ))
        {
            round.primary_offender = Some((self.slots[idx].identity.clone(), state_at_detection));
        }

        let kind = flag?;
        let slot = &mut self.slots[idx];
        if slot.counter.is_bus_off() {
            // the node leaves the bus instead of flagging
            slot.cursor.reset();
            return None;
        }

        let length = match kind {
            ErrorFlagKind::Active => {
                self.stats.active_flags += 1;
                round.frame_ok = false;
                self.config.active_flag_len
            }
            ErrorFlagKind::Passive => {
                self.stats.passive_flags += 1;
                round.passive_flaggers.push(idx);
                self.config.passive_flag_len
            }
        };
        slot.cursor.begin_error_flag(kind, length);
        round.flaggers.push(idx);
        events.push(BusEvent::ErrorFlag {
            node: slot.identity.clone(),
            kind,
            tec: slot.counter.tec(),
            tick: self.tick,
        });
        Some(kind)
    }

    /// REC += 1 for every other live node, once per frame
    fn apply_error_flag_rec(&mut self, round: &mut ContentionRound) {
        if round.rec_applied {
            return;
        }
        round.rec_applied = true;
        for (idx, slot) in self.slots.iter_mut().enumerate() {
            if !round.offenders.contains(&idx) {
                slot.counter.on_rx_error_flag();
            }
        }
    }

    fn after_flags(&self) -> BusState {
        if self.config.error_delimiter_len == 0 {
            BusState::EndOfFrame
        } else {
            BusState::ErrorDelimiter {
                remaining: self.config.error_delimiter_len,
            }
        }
    }

    fn step_error_flag(&mut self) -> (Option<BitPolarity>, Option<FrameField>) {
        let Some(round) = self.round.take() else {
            self.state = BusState::Idle;
            return (None, None);
        };

        let offers: Vec<(usize, BitPolarity)> = round
            .flaggers
            .iter()
            .filter_map(|&idx| self.slots[idx].cursor.peek().map(|(b, _)| (idx, b)))
            .collect();
        for (idx, _) in &offers {
            self.slots[*idx].cursor.advance();
        }

        let all_done = round
            .flaggers
            .iter()
            .all(|&idx| self.slots[idx].cursor.is_exhausted());
        if all_done {
            self.state = self.after_flags();
        }
        self.round = Some(round);

        if offers.is_empty() {
            (None, None)
        } else {
            let bus = BitPolarity::wired_and(offers.iter().map(|(_, b)| *b));
            (Some(bus), Some(FrameField::ErrorFlag))
        }
    }

    fn finish_round(&mut self, events: &mut Vec<BusEvent>) {
        let round = self.round.take().unwrap_or_default();
        let committed = round.frame_ok && !round.senders.is_empty();

        if committed {
            let frame = round
                .senders
                .first()
                .and_then(|&idx| self.slots[idx].cursor.frame().cloned());
            for &idx in &round.senders {
                self.update_counter(idx, events, FaultCounter::on_tx_success);
            }
            for &idx in &round.passive_flaggers {
                self.update_counter(idx, events, FaultCounter::on_passive_flag_absorbed);
            }
            // passive offenders received the frame too
            for idx in 0..self.slots.len() {
                if !round.senders.contains(&idx) {
                    self.slots[idx].counter.on_rx_success();
                }
            }
            if let Some(frame) = frame {
                self.stats.frames_committed += 1;
                events.push(BusEvent::FrameCommitted(CommittedFrame {
                    frame,
                    senders: round
                        .senders
                        .iter()
                        .map(|&idx| self.slots[idx].identity.clone())
                        .collect(),
                    tick: self.tick,
                    timestamp: Utc::now(),
                }));
            }
        } else if let Some((offender, state_at_detection)) = round.primary_offender.clone() {
            self.stats.frames_aborted += 1;
            events.push(BusEvent::FrameAborted {
                offender,
                state_at_detection,
                tick: self.tick,
            });
        }

        for &idx in &round.participants {
            self.slots[idx].cursor.reset();
        }

        self.state = if self.config.interframe_ticks == 0 {
            BusState::Idle
        } else {
            BusState::Interframe {
                remaining: self.config.interframe_ticks,
            }
        };
    }

    /// Apply a counter update and report any confinement transition
    fn update_counter<F>(&mut self, idx: usize, events: &mut Vec<BusEvent>, update: F)
    where
        F: FnOnce(&mut FaultCounter),
    {
        let slot = &mut self.slots[idx];
        let before = slot.counter.state();
        update(&mut slot.counter);
        let after = slot.counter.state();
        if before == after {
            return;
        }

        if after == FaultState::BusOff {
            slot.queue.clear();
            self.stats.bus_off_events += 1;
        }
        events.push(BusEvent::FaultStateChanged {
            node: slot.identity.clone(),
            from: before,
            to: after,
            tec: slot.counter.tec(),
            rec: slot.counter.rec(),
            tick: self.tick,
        });
    }
}

impl Default for BusArbiter {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}
