/// Bus-off attack regression tests
///
/// Full victim/attacker/bystander scenarios on the deterministic driver:
/// - 16 active rounds take the victim to ERROR_PASSIVE
/// - passive rounds cost the victim a net +7 each
/// - the victim is bus-off after round 35 and stays silent afterwards
use can_busoff_sim::config::{AttackerConfig, PayloadMode, SenderConfig};
use can_busoff_sim::event_log::{verify_log_file, BusEventLogger};
use can_busoff_sim::*;
use tempfile::TempDir;

fn attack_scenario() -> ScenarioConfig {
    ScenarioConfig {
        bus: BusConfig::default(),
        victim: SenderConfig {
            name: "VICTIM_ECU".to_string(),
            node_id: 1,
            can_id: 0x173,
            payload: vec![0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC, 0xDE, 0xF0],
            payload_mode: PayloadMode::Fixed,
            period_ticks: 400,
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
            can_id: 0x2A0,
            payload: vec![0x00, 0x10],
            payload_mode: PayloadMode::Counter,
            period_ticks: 1_000,
            offset_ticks: 650,
            initial_tec: 0,
        }],
        duration_secs: 5,
        event_log_path: None,
        seed: Some(2024),
    }
}

fn victim() -> NodeId {
    NodeId::new("VICTIM_ECU", 1)
}

fn attacker() -> NodeId {
    NodeId::new("ATTACKER", 99)
}

fn victim_tec_history(events: &[BusEvent]) -> Vec<u16> {
    events
        .iter()
        .filter_map(|e| match e {
            BusEvent::ErrorFlag { node, tec, .. } if *node == victim() => Some(*tec),
            BusEvent::FaultStateChanged {
                node,
                to: FaultState::BusOff,
                tec,
                ..
            } if *node == victim() => Some(*tec),
            _ => None,
        })
        .collect()
}

#[test]
fn test_victim_driven_bus_off_in_35_rounds() {
    println!("\n=== Bus-off attack, deterministic ===\n");
    let mut sim = Simulation::from_scenario(&attack_scenario()).unwrap();

    let mut events = Vec::new();
    let mut bus_off_tick = None;
    for _ in 0..40_000 {
        let step = sim.step().unwrap();
        let victim_off = step.iter().any(|e| match e {
            BusEvent::FaultStateChanged { node, to, .. } => {
                *node == victim() && *to == FaultState::BusOff
            }
            _ => false,
        });
        if victim_off {
            bus_off_tick = Some(sim.tick());
        }
        events.extend(step);
        if bus_off_tick.is_some() {
            break;
        }
    }
    let bus_off_tick = bus_off_tick.expect("victim never reached bus-off");
    println!("✓ Victim bus-off at tick {}", bus_off_tick);

    let history = victim_tec_history(&events);
    assert_eq!(history.len(), 35);
    // active phase: +8 per destroyed frame
    for (round, tec) in history.iter().take(16).enumerate() {
        assert_eq!(*tec, 8 * (round as u16 + 1));
    }
    // passive phase: flag raised at +8, one credit back once the attacker's frame completes
    for (k, tec) in history.iter().skip(16).take(18).enumerate() {
        assert_eq!(*tec, 128 + 7 * k as u16 + 8);
    }
    assert_eq!(history[34], 262);

    let aborted_by_victim = events
        .iter()
        .filter(|e| matches!(e, BusEvent::FrameAborted { offender, .. } if *offender == victim()))
        .count();
    assert_eq!(aborted_by_victim, 16);

    let transitions: Vec<(FaultState, FaultState)> = events
        .iter()
        .filter_map(|e| match e {
            BusEvent::FaultStateChanged { node, from, to, .. } if *node == victim() => {
                Some((*from, *to))
            }
            _ => None,
        })
        .collect();
    assert_eq!(
        transitions,
        vec![
            (FaultState::ErrorActive, FaultState::ErrorPassive),
            (FaultState::ErrorPassive, FaultState::BusOff),
        ]
    );

    let arbiter = sim.arbiter();
    assert_eq!(arbiter.fault_state(&victim()).unwrap(), FaultState::BusOff);
    // never sent a destroyed frame; its REC rose with each active flag and fell on bystander frames
    let (tec, rec) = arbiter.counters(&attacker()).unwrap();
    assert_eq!(tec, 0);
    assert!(rec <= 16);
    assert_eq!(
        arbiter.fault_state(&attacker()).unwrap(),
        FaultState::ErrorActive
    );
}

#[test]
fn test_bus_off_victim_stays_silent() {
    let mut sim = Simulation::from_scenario(&attack_scenario()).unwrap();
    let tick = sim
        .run_until_bus_off(&victim(), 40_000)
        .unwrap()
        .expect("victim never reached bus-off");
    let committed_before = sim.arbiter().stats().frames_committed;

    let events = sim.run(4_000).unwrap();
    println!("bus-off at {}, then {} more events", tick, events.len());

    assert!(sim.arbiter().stats().ignored_intents >= 9);
    assert_eq!(sim.arbiter().counters(&victim()).unwrap().0, 262);
    assert!(!events.iter().any(|e| match e {
        BusEvent::FrameCommitted(c) => c.senders.contains(&victim()),
        BusEvent::ErrorFlag { .. } | BusEvent::FrameAborted { .. } => true,
        _ => false,
    }));
    // the bystander keeps talking
    assert!(sim.arbiter().stats().frames_committed > committed_before);
}

#[test]
fn test_passive_victim_start() {
    let mut scenario = attack_scenario();
    scenario.victim.initial_tec = 130;
    let mut sim = Simulation::from_scenario(&scenario).unwrap();

    // first victim round: attacker's frame survives, victim +7
    sim.run(400).unwrap();
    assert_eq!(sim.arbiter().counters(&victim()).unwrap().0, 137);
    assert_eq!(sim.arbiter().stats().passive_flags, 1);
    assert_eq!(sim.arbiter().stats().frames_aborted, 0);

    let tick = sim.run_until_bus_off(&victim(), 40_000).unwrap();
    assert!(tick.is_some());
}

#[test]
fn test_no_attacker_keeps_victim_healthy() {
    let mut scenario = attack_scenario();
    scenario.attacker = None;
    let mut sim = Simulation::from_scenario(&scenario).unwrap();
    assert_eq!(sim.run_until_bus_off(&victim(), 20_000).unwrap(), None);

    for node in sim.arbiter().node_snapshots() {
        assert_eq!(node.tec, 0, "{} picked up errors", node.node);
        assert_eq!(node.state, FaultState::ErrorActive);
    }
    assert_eq!(sim.arbiter().stats().frames_aborted, 0);
}

#[test]
fn test_zero_lead_still_synchronises() {
    let mut scenario = attack_scenario();
    if let Some(attacker) = scenario.attacker.as_mut() {
        attacker.lead_ticks = 0;
    }
    let mut sim = Simulation::from_scenario(&scenario).unwrap();
    assert!(sim.run_until_bus_off(&victim(), 40_000).unwrap().is_some());
}

#[test]
fn test_attack_run_leaves_verifiable_log() {
    let dir = TempDir::new().unwrap();
    let logger = BusEventLogger::new("regression", dir.path().join("attack.jsonl")).unwrap();

    let mut sim = Simulation::from_scenario(&attack_scenario()).unwrap();
    sim.add_observer(Box::new(logger.clone()));
    sim.run_until_bus_off(&victim(), 40_000).unwrap();

    assert!(logger.sequence() > 35);
    let result = verify_log_file(logger.log_path()).unwrap();
    assert!(result.verified, "{:?}", result.issues);
}
