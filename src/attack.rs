/// Attack Strategies and Node Schedules
///
/// Scheduled benign senders and the timing-synchronised bus-off attacker.
/// The attacker is a pluggable strategy: it gets a chance to submit an intent
/// on every tick and sees every bus event afterwards.
use crate::config::{PayloadMode, SenderConfig};
use crate::observer::BusEvent;
use crate::types::{CanFrame, FaultState, NodeId};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Periodic transmission timing of a node, in ticks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSchedule {
    pub period_ticks: u64,
    pub offset_ticks: u64,
}

impl NodeSchedule {
    pub fn new(period_ticks: u64, offset_ticks: u64) -> Self {
        Self {
            period_ticks,
            offset_ticks,
        }
    }

    pub fn is_due(&self, tick: u64) -> bool {
        if self.period_ticks == 0 || tick < self.offset_ticks {
            return false;
        }
        (tick - self.offset_ticks) % self.period_ticks == 0
    }

    /// First due tick at or after `after`
    pub fn next_due(&self, after: u64) -> Option<u64> {
        if self.period_ticks == 0 {
            return None;
        }
        if after <= self.offset_ticks {
            return Some(self.offset_ticks);
        }
        let elapsed = after - self.offset_ticks;
        let periods = elapsed.div_ceil(self.period_ticks);
        Some(self.offset_ticks + periods * self.period_ticks)
    }
}

/// Pluggable attacker behaviour
pub trait AttackStrategy: Send {
    fn name(&self) -> &str;

    /// Frame to submit on this tick, given the victim's schedule
    fn on_tick(&mut self, tick: u64, victim: &NodeSchedule) -> Option<CanFrame>;

    fn on_event(&mut self, _event: &BusEvent) {}
}

/// Build a frame that collides with `victim` through arbitration and then
/// overwrites one of its recessive bits with a dominant one.
///
/// The first recessive data bit is cleared. An all-zero payload falls back to
/// clearing the highest set DLC bit. Returns `None` when the victim frame has
/// no recessive bit left to overwrite after the identifier.
pub fn forge_corrupting_frame(victim: &CanFrame) -> Option<CanFrame> {
    let mut data = victim.data.clone();
    for byte in data.iter_mut() {
        if *byte != 0 {
            let top = 7 - byte.leading_zeros();
            *byte &= !(1u8 << top);
            return Some(CanFrame::new(victim.id, data));
        }
    }

    let dlc = victim.dlc();
    if dlc == 0 {
        return None;
    }
    let top = 7 - dlc.leading_zeros();
    let shorter = usize::from(dlc & !(1u8 << top));
    data.truncate(shorter);
    Some(CanFrame::new(victim.id, data))
}

/// Timing-synchronised bus-off attacker
///
/// Transmits a forged copy of the victim's frame exactly when the victim is
/// due, so both enter the same contention round, tie on the identifier, and
/// the victim suffers a bit error in the data field.
pub struct BusOffAttack {
    name: String,
    victim: NodeId,
    template: CanFrame,
    forged: Option<CanFrame>,
    lead_ticks: u64,
    stop_on_bus_off: bool,
    victim_bus_off: bool,
    injections: u64,
}

impl BusOffAttack {
    pub fn new(
        name: impl Into<String>,
        victim: NodeId,
        template: CanFrame,
        lead_ticks: u64,
    ) -> Self {
        let forged = forge_corrupting_frame(&template);
        Self {
            name: name.into(),
            victim,
            template,
            forged,
            lead_ticks,
            stop_on_bus_off: true,
            victim_bus_off: false,
            injections: 0,
        }
    }

    pub fn with_stop_on_bus_off(mut self, stop: bool) -> Self {
        self.stop_on_bus_off = stop;
        self
    }

    /// Update the attacker's knowledge of the victim's payload
    pub fn set_victim_template(&mut self, template: CanFrame) {
        self.forged = forge_corrupting_frame(&template);
        self.template = template;
    }

    pub fn victim(&self) -> &NodeId {
        &self.victim
    }

    pub fn template(&self) -> &CanFrame {
        &self.template
    }

    pub fn forged_frame(&self) -> Option<&CanFrame> {
        self.forged.as_ref()
    }

    pub fn injections(&self) -> u64 {
        self.injections
    }

    pub fn victim_bus_off(&self) -> bool {
        self.victim_bus_off
    }

    pub fn is_finished(&self) -> bool {
        self.stop_on_bus_off && self.victim_bus_off
    }
}

impl AttackStrategy for BusOffAttack {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_tick(&mut self, tick: u64, victim: &NodeSchedule) -> Option<CanFrame> {
        if self.is_finished() || !victim.is_due(tick + self.lead_ticks) {
            return None;
        }
        let frame = self.forged.clone()?;
        self.injections += 1;
        Some(frame)
    }

    fn on_event(&mut self, event: &BusEvent) {
        match event {
            BusEvent::FaultStateChanged {
                node,
                to: FaultState::BusOff,
                ..
            } if *node == self.victim => {
                self.victim_bus_off = true;
            }
            BusEvent::FrameCommitted(committed)
                if committed.senders.contains(&self.victim)
                    && committed.frame.id == self.template.id
                    && committed.frame != self.template =>
            {
                self.set_victim_template(committed.frame.clone());
            }
            _ => {}
        }
    }
}

/// Benign node transmitting on a fixed schedule
pub struct PeriodicSender {
    node: NodeId,
    can_id: u16,
    payload: Vec<u8>,
    mode: PayloadMode,
    schedule: NodeSchedule,
    counter: u8,
    rng: StdRng,
}

impl PeriodicSender {
    pub fn new(node: NodeId, can_id: u16, payload: Vec<u8>, schedule: NodeSchedule) -> Self {
        Self {
            node,
            can_id,
            payload,
            mode: PayloadMode::Fixed,
            schedule,
            counter: 0,
            rng: StdRng::from_entropy(),
        }
    }

    pub fn from_config(config: &SenderConfig, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s ^ u64::from(config.node_id)),
            None => StdRng::from_entropy(),
        };
        Self {
            node: NodeId::new(config.name.clone(), config.node_id),
            can_id: config.can_id,
            payload: config.payload.clone(),
            mode: config.payload_mode,
            schedule: NodeSchedule::new(config.period_ticks, config.offset_ticks),
            counter: 0,
            rng,
        }
    }

    pub fn node(&self) -> &NodeId {
        &self.node
    }

    pub fn schedule(&self) -> NodeSchedule {
        self.schedule
    }

    /// The frame as the node would send it next, without consuming a period
    pub fn template(&self) -> CanFrame {
        CanFrame::new(self.can_id, self.payload.clone())
    }

    /// Frame to submit on `tick`, if the node is due
    pub fn frame_for(&mut self, tick: u64) -> Option<CanFrame> {
        if !self.schedule.is_due(tick) {
            return None;
        }
        Some(self.next_frame())
    }

    pub fn next_frame(&mut self) -> CanFrame {
        match self.mode {
            PayloadMode::Fixed => {}
            PayloadMode::Counter => {
                match self.payload.last_mut() {
                    Some(last) => *last = self.counter,
                    None => self.payload.push(self.counter),
                }
                self.counter = self.counter.wrapping_add(1);
            }
            PayloadMode::Random => self.rng.fill(self.payload.as_mut_slice()),
        }
        CanFrame::new(self.can_id, self.payload.clone())
    }
}
