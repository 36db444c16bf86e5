/// Async Bus Runtime
///
/// One tokio task owns the `BusArbiter` and is the only writer of bus and
/// counter state. Nodes talk to it through a `BusHandle`: intents go in over
/// an mpsc channel, bus events come back over a broadcast channel, and the
/// logical tick clock is published through a watch channel.
use crate::arbiter::{BusArbiter, BusState, NodeSnapshot};
use crate::attack::{AttackStrategy, BusOffAttack, NodeSchedule, PeriodicSender};
use crate::config::ScenarioConfig;
use crate::error::SimError;
use crate::observer::{BusEvent, BusObserver};
use crate::stats::BusStats;
use crate::types::{CanFrame, NodeId};
use colored::*;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

const COMMAND_BUFFER: usize = 256;

/// Requests handled by the arbiter task
enum BusCommand {
    Register {
        node: NodeId,
        reply: oneshot::Sender<Result<(), SimError>>,
    },
    Submit {
        node: NodeId,
        frame: CanFrame,
        reply: oneshot::Sender<Result<(), SimError>>,
    },
    SetCounters {
        node: NodeId,
        tec: u16,
        rec: u16,
        reply: oneshot::Sender<Result<(), SimError>>,
    },
    Snapshot {
        reply: oneshot::Sender<RuntimeSnapshot>,
    },
}

/// Bus state as seen by the arbiter task at one instant
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeSnapshot {
    pub tick: u64,
    pub state: BusState,
    pub nodes: Vec<NodeSnapshot>,
    pub stats: BusStats,
}

impl RuntimeSnapshot {
    pub fn node(&self, node: &NodeId) -> Option<&NodeSnapshot> {
        self.nodes.iter().find(|n| n.node == *node)
    }
}

/// Cloneable access point to a running bus
#[derive(Clone)]
pub struct BusHandle {
    commands: mpsc::Sender<BusCommand>,
    events: broadcast::Sender<BusEvent>,
    ticks: watch::Receiver<u64>,
    shutdown: watch::Receiver<bool>,
}

impl BusHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> BusCommand,
    ) -> Result<T, SimError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| SimError::ChannelClosed)?;
        response.await.map_err(|_| SimError::ChannelClosed)
    }

    pub async fn register_node(&self, node: NodeId) -> Result<(), SimError> {
        self.request(|reply| BusCommand::Register { node, reply })
            .await?
    }

    pub async fn submit_intent(&self, node: &NodeId, frame: CanFrame) -> Result<(), SimError> {
        let node = node.clone();
        self.request(|reply| BusCommand::Submit { node, frame, reply })
            .await?
    }

    pub async fn set_counters(&self, node: &NodeId, tec: u16, rec: u16) -> Result<(), SimError> {
        let node = node.clone();
        self.request(|reply| BusCommand::SetCounters {
            node,
            tec,
            rec,
            reply,
        })
        .await?
    }

    pub async fn snapshot(&self) -> Result<RuntimeSnapshot, SimError> {
        self.request(|reply| BusCommand::Snapshot { reply }).await
    }

    /// Receive every bus event from now on
    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.events.subscribe()
    }

    /// Next tick the arbiter will resolve
    pub fn tick_watch(&self) -> watch::Receiver<u64> {
        self.ticks.clone()
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}

/// Running arbiter task
pub struct BusRuntime {
    handle: BusHandle,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<BusArbiter>,
}

impl BusRuntime {
    /// Move the arbiter into its own task and start the tick clock
    pub fn spawn(arbiter: BusArbiter) -> Result<Self, SimError> {
        arbiter.config().validate().map_err(SimError::Config)?;
        let tick_period = arbiter.config().tick_duration();
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (event_tx, _) = broadcast::channel(arbiter.config().event_buffer);
        let (tick_tx, tick_rx) = watch::channel(arbiter.tick());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = BusHandle {
            commands: command_tx,
            events: event_tx.clone(),
            ticks: tick_rx,
            shutdown: shutdown_rx.clone(),
        };

        let task = tokio::spawn(run_arbiter(
            arbiter,
            tick_period,
            command_rx,
            event_tx,
            tick_tx,
            shutdown_rx,
        ));

        Ok(Self {
            handle,
            shutdown: shutdown_tx,
            task,
        })
    }

    pub fn handle(&self) -> BusHandle {
        self.handle.clone()
    }

    /// Stop all tasks watching the shutdown flag and hand the arbiter back
    pub async fn shutdown(self) -> Result<BusArbiter, SimError> {
        self.shutdown.send_replace(true);
        self.task.await.map_err(|_| SimError::ChannelClosed)
    }
}

async fn run_arbiter(
    mut arbiter: BusArbiter,
    tick_period: std::time::Duration,
    mut commands: mpsc::Receiver<BusCommand>,
    events: broadcast::Sender<BusEvent>,
    ticks: watch::Sender<u64>,
    mut shutdown: watch::Receiver<bool>,
) -> BusArbiter {
    let mut clock = interval(tick_period);
    clock.set_missed_tick_behavior(MissedTickBehavior::Burst);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            command = commands.recv() => match command {
                Some(command) => handle_command(&mut arbiter, command),
                None => break,
            },
            _ = clock.tick() => {
                // intents already queued belong to this tick
                while let Ok(command) = commands.try_recv() {
                    handle_command(&mut arbiter, command);
                }
                for event in arbiter.step() {
                    // no subscribers is fine
                    let _ = events.send(event);
                }
                ticks.send_replace(arbiter.tick());
            }
        }
    }

    arbiter
}

fn handle_command(arbiter: &mut BusArbiter, command: BusCommand) {
    match command {
        BusCommand::Register { node, reply } => {
            let _ = reply.send(arbiter.register_node(node));
        }
        BusCommand::Submit { node, frame, reply } => {
            let _ = reply.send(arbiter.submit_intent(&node, frame));
        }
        BusCommand::SetCounters {
            node,
            tec,
            rec,
            reply,
        } => {
            let _ = reply.send(arbiter.set_counters(&node, tec, rec));
        }
        BusCommand::Snapshot { reply } => {
            let _ = reply.send(RuntimeSnapshot {
                tick: arbiter.tick(),
                state: arbiter.state(),
                nodes: arbiter.node_snapshots(),
                stats: arbiter.stats().clone(),
            });
        }
    }
}

/// Run a scheduled sender until shutdown; returns the number of intents sent
///
/// When `publish` is given the node advertises its schedule on it, which is
/// how a synchronised attacker learns the victim's timing.
pub fn spawn_sender(
    handle: BusHandle,
    mut sender: PeriodicSender,
    publish: Option<watch::Sender<Option<NodeSchedule>>>,
) -> JoinHandle<Result<u64, SimError>> {
    tokio::spawn(async move {
        if let Some(publish) = &publish {
            publish.send_replace(Some(sender.schedule()));
        }

        let node = sender.node().clone();
        let mut ticks = handle.tick_watch();
        let mut shutdown = handle.shutdown_signal();
        let mut next_tick = *ticks.borrow();
        let mut sent = 0u64;

        loop {
            let now = *ticks.borrow_and_update();
            for tick in next_tick..=now {
                if let Some(frame) = sender.frame_for(tick) {
                    handle.submit_intent(&node, frame).await?;
                    sent += 1;
                }
            }
            next_tick = now + 1;

            tokio::select! {
                changed = ticks.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        Ok(sent)
    })
}

/// Run an attack strategy as its own node until shutdown
///
/// The strategy sees the victim schedule published by the victim task and
/// every bus event broadcast by the arbiter.
pub fn spawn_attacker(
    handle: BusHandle,
    node: NodeId,
    mut strategy: Box<dyn AttackStrategy>,
    mut victim_schedule: watch::Receiver<Option<NodeSchedule>>,
) -> JoinHandle<Result<u64, SimError>> {
    tokio::spawn(async move {
        let mut ticks = handle.tick_watch();
        let mut events = handle.subscribe();
        let mut shutdown = handle.shutdown_signal();
        let mut next_tick = *ticks.borrow();
        let mut sent = 0u64;

        loop {
            let now = *ticks.borrow_and_update();
            let schedule = *victim_schedule.borrow_and_update();
            if let Some(schedule) = schedule {
                for tick in next_tick..=now {
                    if let Some(frame) = strategy.on_tick(tick, &schedule) {
                        handle.submit_intent(&node, frame).await?;
                        sent += 1;
                    }
                }
            }
            next_tick = now + 1;

            tokio::select! {
                changed = ticks.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                event = events.recv() => match event {
                    Ok(event) => strategy.on_event(&event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        println!(
                            "{} {} lagged behind the bus by {} events",
                            "⚠".yellow(),
                            strategy.name(),
                            skipped
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                changed = victim_schedule.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        Ok(sent)
    })
}

/// A scenario running on the async runtime
pub struct ScenarioRun {
    runtime: BusRuntime,
    victim: NodeId,
    attacker: Option<NodeId>,
    tasks: Vec<JoinHandle<Result<u64, SimError>>>,
}

impl ScenarioRun {
    pub fn handle(&self) -> BusHandle {
        self.runtime.handle()
    }

    pub fn victim(&self) -> &NodeId {
        &self.victim
    }

    pub fn attacker(&self) -> Option<&NodeId> {
        self.attacker.as_ref()
    }

    /// Shut everything down and return the arbiter with its final state
    pub async fn finish(self) -> Result<BusArbiter, SimError> {
        let arbiter = self.runtime.shutdown().await?;
        for task in self.tasks {
            match task.await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => println!("{} Node task stopped with error: {}", "⚠".yellow(), e),
                Err(e) => println!("{} Node task panicked: {}", "✗".red(), e),
            }
        }
        Ok(arbiter)
    }
}

/// Register the scenario's nodes, start the arbiter and one task per node
pub fn launch_scenario(
    scenario: &ScenarioConfig,
    observers: Vec<Box<dyn BusObserver>>,
) -> Result<ScenarioRun, SimError> {
    scenario.validate().map_err(SimError::Config)?;
    let mut arbiter = BusArbiter::new(scenario.bus.clone());
    for observer in observers {
        arbiter.add_observer(observer);
    }

    let victim = PeriodicSender::from_config(&scenario.victim, scenario.seed);
    let victim_id = victim.node().clone();
    arbiter.register_node(victim_id.clone())?;
    if scenario.victim.initial_tec > 0 {
        arbiter.set_counters(&victim_id, scenario.victim.initial_tec, 0)?;
    }

    let mut bystanders = Vec::with_capacity(scenario.bystanders.len());
    for config in &scenario.bystanders {
        let sender = PeriodicSender::from_config(config, scenario.seed);
        arbiter.register_node(sender.node().clone())?;
        if config.initial_tec > 0 {
            arbiter.set_counters(sender.node(), config.initial_tec, 0)?;
        }
        bystanders.push(sender);
    }

    let attacker_id = scenario
        .attacker
        .as_ref()
        .map(|a| NodeId::new(a.name.clone(), a.node_id));
    if let Some(node) = &attacker_id {
        arbiter.register_node(node.clone())?;
    }

    let runtime = BusRuntime::spawn(arbiter)?;
    let handle = runtime.handle();

    let (schedule_tx, schedule_rx) = watch::channel(None);
    let template = victim.template();
    let mut tasks = vec![spawn_sender(handle.clone(), victim, Some(schedule_tx))];
    for sender in bystanders {
        tasks.push(spawn_sender(handle.clone(), sender, None));
    }
    if let (Some(config), Some(node)) = (&scenario.attacker, &attacker_id) {
        let strategy = BusOffAttack::new(
            config.name.clone(),
            victim_id.clone(),
            template,
            config.lead_ticks,
        )
        .with_stop_on_bus_off(config.stop_on_bus_off);
        tasks.push(spawn_attacker(
            handle,
            node.clone(),
            Box::new(strategy),
            schedule_rx,
        ));
    }

    Ok(ScenarioRun {
        runtime,
        victim: victim_id,
        attacker: attacker_id,
        tasks,
    })
}
