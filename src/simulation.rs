/// Deterministic Simulation Driver
///
/// Runs scheduled senders, attack strategies and the arbiter in lockstep on
/// the logical tick clock. Every intent due on a tick is submitted before the
/// arbiter resolves that tick, so runs are fully reproducible.
use crate::arbiter::BusArbiter;
use crate::attack::{AttackStrategy, BusOffAttack, NodeSchedule, PeriodicSender};
use crate::config::{BusConfig, ScenarioConfig};
use crate::error::SimError;
use crate::observer::{BusEvent, BusObserver};
use crate::types::{FaultState, NodeId};

struct StrategySlot {
    node: NodeId,
    strategy: Box<dyn AttackStrategy>,
}

pub struct Simulation {
    arbiter: BusArbiter,
    senders: Vec<PeriodicSender>,
    strategies: Vec<StrategySlot>,
    victim_schedule: Option<NodeSchedule>,
}

impl Simulation {
    pub fn new(config: BusConfig) -> Self {
        Self::with_arbiter(BusArbiter::new(config))
    }

    pub fn with_arbiter(arbiter: BusArbiter) -> Self {
        Self {
            arbiter,
            senders: Vec::new(),
            strategies: Vec::new(),
            victim_schedule: None,
        }
    }

    /// Build the victim, bystanders and attacker described by a scenario
    pub fn from_scenario(scenario: &ScenarioConfig) -> Result<Self, SimError> {
        scenario.validate().map_err(SimError::Config)?;
        let mut sim = Self::new(scenario.bus.clone());

        let victim = PeriodicSender::from_config(&scenario.victim, scenario.seed);
        let victim_id = victim.node().clone();
        let template = victim.template();
        sim.add_sender(victim)?;
        sim.set_victim(&victim_id)?;
        if scenario.victim.initial_tec > 0 {
            sim.arbiter
                .set_counters(&victim_id, scenario.victim.initial_tec, 0)?;
        }

        for bystander in &scenario.bystanders {
            let sender = PeriodicSender::from_config(bystander, scenario.seed);
            let node = sender.node().clone();
            sim.add_sender(sender)?;
            if bystander.initial_tec > 0 {
                sim.arbiter.set_counters(&node, bystander.initial_tec, 0)?;
            }
        }

        if let Some(attacker) = &scenario.attacker {
            let node = NodeId::new(attacker.name.clone(), attacker.node_id);
            let strategy = BusOffAttack::new(
                attacker.name.clone(),
                victim_id,
                template,
                attacker.lead_ticks,
            )
            .with_stop_on_bus_off(attacker.stop_on_bus_off);
            sim.add_strategy(node, Box::new(strategy))?;
        }

        Ok(sim)
    }

    pub fn add_sender(&mut self, sender: PeriodicSender) -> Result<(), SimError> {
        self.arbiter.register_node(sender.node().clone())?;
        self.senders.push(sender);
        Ok(())
    }

    /// Mark a registered sender as the node whose schedule strategies follow
    pub fn set_victim(&mut self, node: &NodeId) -> Result<(), SimError> {
        let schedule = self
            .senders
            .iter()
            .find(|s| s.node() == node)
            .map(PeriodicSender::schedule)
            .ok_or_else(|| SimError::UnknownNode(node.clone()))?;
        self.victim_schedule = Some(schedule);
        Ok(())
    }

    pub fn add_strategy(
        &mut self,
        node: NodeId,
        strategy: Box<dyn AttackStrategy>,
    ) -> Result<(), SimError> {
        self.arbiter.register_node(node.clone())?;
        self.strategies.push(StrategySlot { node, strategy });
        Ok(())
    }

    pub fn add_observer(&mut self, observer: Box<dyn BusObserver>) {
        self.arbiter.add_observer(observer);
    }

    pub fn arbiter(&self) -> &BusArbiter {
        &self.arbiter
    }

    pub fn arbiter_mut(&mut self) -> &mut BusArbiter {
        &mut self.arbiter
    }

    pub fn tick(&self) -> u64 {
        self.arbiter.tick()
    }

    /// Submit everything due on the current tick, then resolve it
    pub fn step(&mut self) -> Result<Vec<BusEvent>, SimError> {
        let tick = self.arbiter.tick();

        for sender in self.senders.iter_mut() {
            if let Some(frame) = sender.frame_for(tick) {
                self.arbiter.submit_intent(sender.node(), frame)?;
            }
        }
        if let Some(schedule) = self.victim_schedule {
            for slot in self.strategies.iter_mut() {
                if let Some(frame) = slot.strategy.on_tick(tick, &schedule) {
                    self.arbiter.submit_intent(&slot.node, frame)?;
                }
            }
        }

        let events = self.arbiter.step();
        for event in &events {
            for slot in self.strategies.iter_mut() {
                slot.strategy.on_event(event);
            }
        }
        Ok(events)
    }

    pub fn run(&mut self, ticks: u64) -> Result<Vec<BusEvent>, SimError> {
        let mut events = Vec::new();
        for _ in 0..ticks {
            events.extend(self.step()?);
        }
        Ok(events)
    }

    /// Run until `node` is bus-off; returns the tick it happened on
    pub fn run_until_bus_off(
        &mut self,
        node: &NodeId,
        max_ticks: u64,
    ) -> Result<Option<u64>, SimError> {
        for _ in 0..max_ticks {
            let events = self.step()?;
            let hit = events.iter().find_map(|e| match e {
                BusEvent::FaultStateChanged {
                    node: n,
                    to: FaultState::BusOff,
                    tick,
                    ..
                } if n == node => Some(*tick),
                _ => None,
            });
            if hit.is_some() {
                return Ok(hit);
            }
        }
        Ok(None)
    }
}
