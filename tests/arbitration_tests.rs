/// Bus arbitration and fault confinement tests
///
/// Drive the arbiter tick by tick and check:
/// - wired-AND arbitration and retry of losers
/// - identical-identifier collisions
/// - independent evaluation of simultaneous offenders
/// - REC bookkeeping and bus-off exclusion
use can_busoff_sim::codec::encode_frame;
use can_busoff_sim::*;
use std::sync::{Arc, Mutex};

fn arbiter(nodes: &[&NodeId]) -> BusArbiter {
    let mut arbiter = BusArbiter::new(BusConfig {
        gather_window_ticks: 2,
        trace_capacity: 4096,
        ..Default::default()
    });
    for node in nodes {
        arbiter.register_node((*node).clone()).unwrap();
    }
    arbiter
}

fn committed_ids(events: &[BusEvent]) -> Vec<u16> {
    events
        .iter()
        .filter_map(|e| match e {
            BusEvent::FrameCommitted(c) => Some(c.frame.id),
            _ => None,
        })
        .collect()
}

// ============================================================================
// Arbitration
// ============================================================================

#[test]
fn test_lowest_identifier_wins_regardless_of_submission_order() {
    println!("\n=== Arbitration order ===\n");
    let a = NodeId::new("ENGINE", 1);
    let b = NodeId::new("BRAKE", 2);
    let c = NodeId::new("STEERING", 3);

    for order in [[0usize, 1, 2], [2, 1, 0], [1, 2, 0]] {
        let mut bus = arbiter(&[&a, &b, &c]);
        let intents = [
            (&a, CanFrame::new(0x300, vec![1])),
            (&b, CanFrame::new(0x0C4, vec![2])),
            (&c, CanFrame::new(0x2A0, vec![3])),
        ];
        for &i in &order {
            let (node, frame) = &intents[i];
            bus.submit_intent(node, frame.clone()).unwrap();
        }

        let events = bus.run_until_idle(5_000);
        println!("order {:?} → {:03X?}", order, committed_ids(&events));
        assert_eq!(committed_ids(&events), vec![0x0C4, 0x2A0, 0x300]);
        assert_eq!(bus.stats().arbitration_losses, 3);
        for node in [&a, &b, &c] {
            assert_eq!(bus.counters(node).unwrap(), (0, 0));
        }
    }
}

#[test]
fn test_bus_carries_encoded_stream_with_ack() {
    let sender = NodeId::new("SENDER", 1);
    let listener = NodeId::new("LISTENER", 2);
    let mut bus = arbiter(&[&sender, &listener]);

    let frame = CanFrame::new(0x173, vec![0x12, 0x34]);
    let stream = encode_frame(&frame);
    bus.submit_intent(&sender, frame).unwrap();
    bus.run_until_idle(1_000);

    let on_bus: Vec<(BitPolarity, FrameField)> = bus
        .trace()
        .entries()
        .filter(|e| matches!(e.state, BusState::Arbitration | BusState::Transmission))
        .filter_map(|e| e.bit.zip(e.field))
        .collect();
    assert_eq!(on_bus.len(), stream.len());

    for (i, ((bus_bit, field), (sent_bit, sent_field))) in
        on_bus.iter().zip(stream.iter()).enumerate()
    {
        assert_eq!(field, sent_field, "field mismatch at bit {}", i);
        if *sent_field == FrameField::AckSlot {
            assert_eq!(*bus_bit, BitPolarity::Dominant);
        } else {
            assert_eq!(bus_bit, sent_bit, "bit mismatch at {}", i);
        }
    }
}

#[test]
fn test_identical_frames_collide_without_error() {
    let a = NodeId::new("A", 1);
    let b = NodeId::new("B", 2);
    let listener = NodeId::new("LISTENER", 3);
    let mut bus = arbiter(&[&a, &b, &listener]);
    bus.set_counters(&a, 10, 0).unwrap();
    bus.set_counters(&b, 20, 0).unwrap();

    let frame = CanFrame::new(0x173, vec![0xAA, 0x55]);
    bus.submit_intent(&a, frame.clone()).unwrap();
    bus.submit_intent(&b, frame.clone()).unwrap();
    let events = bus.run_until_idle(1_000);

    let committed: Vec<&CommittedFrame> = events
        .iter()
        .filter_map(|e| match e {
            BusEvent::FrameCommitted(c) => Some(c),
            _ => None,
        })
        .collect();
    assert_eq!(committed.len(), 1);
    assert_eq!(committed[0].frame, frame);
    assert_eq!(committed[0].senders, vec![a.clone(), b.clone()]);
    assert_eq!(bus.counters(&a).unwrap(), (9, 0));
    assert_eq!(bus.counters(&b).unwrap(), (19, 0));
    assert_eq!(bus.stats().collisions, 1);
    assert_eq!(bus.stats().frames_aborted, 0);
}

#[test]
fn test_gather_window_closes_round() {
    let late = NodeId::new("LATE", 1);
    let early = NodeId::new("EARLY", 2);
    let mut bus = arbiter(&[&late, &early]);

    bus.submit_intent(&early, CanFrame::new(0x400, vec![])).unwrap();
    while bus.state() != BusState::Arbitration {
        bus.step();
    }
    // arrives after the round opened, so it waits despite the lower id
    bus.submit_intent(&late, CanFrame::new(0x001, vec![])).unwrap();
    let events = bus.run_until_idle(2_000);

    assert_eq!(committed_ids(&events), vec![0x400, 0x001]);
    assert_eq!(bus.stats().arbitration_losses, 0);
}

// ============================================================================
// Bit errors and fault confinement
// ============================================================================

#[test]
fn test_simultaneous_offenders_penalised_independently() {
    println!("\n=== Two victims, one attacker ===\n");
    let v1 = NodeId::new("VICTIM_1", 1);
    let v2 = NodeId::new("VICTIM_2", 2);
    let attacker = NodeId::new("ATTACKER", 3);
    let listener = NodeId::new("LISTENER", 4);
    let mut bus = arbiter(&[&v1, &v2, &attacker, &listener]);

    bus.submit_intent(&v1, CanFrame::new(0x173, vec![0x10])).unwrap();
    bus.submit_intent(&v2, CanFrame::new(0x173, vec![0x10])).unwrap();
    bus.submit_intent(&attacker, CanFrame::new(0x173, vec![0x00]))
        .unwrap();
    let events = bus.run_until_idle(1_000);

    let flags = events
        .iter()
        .filter(|e| matches!(e, BusEvent::ErrorFlag { kind: ErrorFlagKind::Active, .. }))
        .count();
    assert_eq!(flags, 2);
    assert_eq!(bus.counters(&v1).unwrap(), (8, 0));
    assert_eq!(bus.counters(&v2).unwrap(), (8, 0));
    // one destroyed frame means one REC increment, not one per flag
    assert_eq!(bus.counters(&attacker).unwrap(), (0, 1));
    assert_eq!(bus.counters(&listener).unwrap(), (0, 1));
    assert_eq!(bus.stats().frames_aborted, 1);
}

#[test]
fn test_active_flag_aborts_even_with_passive_offender() {
    let passive = NodeId::new("PASSIVE", 1);
    let active = NodeId::new("ACTIVE", 2);
    let attacker = NodeId::new("ATTACKER", 3);
    let mut bus = arbiter(&[&passive, &active, &attacker]);
    bus.set_counters(&passive, 200, 0).unwrap();

    bus.submit_intent(&passive, CanFrame::new(0x173, vec![0x10]))
        .unwrap();
    bus.submit_intent(&active, CanFrame::new(0x173, vec![0x10]))
        .unwrap();
    bus.submit_intent(&attacker, CanFrame::new(0x173, vec![0x00]))
        .unwrap();
    let events = bus.run_until_idle(1_000);

    assert!(committed_ids(&events).is_empty());
    let aborted: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            BusEvent::FrameAborted {
                offender,
                state_at_detection,
                ..
            } => Some((offender.clone(), *state_at_detection)),
            _ => None,
        })
        .collect();
    assert_eq!(aborted, vec![(active.clone(), FaultState::ErrorActive)]);
    // no credit: the passive flag was not absorbed by a completed frame
    assert_eq!(bus.counters(&passive).unwrap(), (208, 0));
    assert_eq!(bus.counters(&active).unwrap(), (8, 0));
    assert_eq!(bus.counters(&attacker).unwrap(), (0, 1));
}

#[test]
fn test_escalation_boundary_inside_a_round() {
    let victim = NodeId::new("VICTIM", 1);
    let attacker = NodeId::new("ATTACKER", 2);
    let mut bus = arbiter(&[&victim, &attacker]);
    bus.set_counters(&victim, 120, 0).unwrap();

    bus.submit_intent(&victim, CanFrame::new(0x173, vec![0x10]))
        .unwrap();
    bus.submit_intent(&attacker, CanFrame::new(0x173, vec![0x00]))
        .unwrap();
    let events = bus.run_until_idle(1_000);

    // flag kind follows the state at detection
    assert!(events.iter().any(|e| matches!(
        e,
        BusEvent::ErrorFlag { kind: ErrorFlagKind::Active, tec: 128, .. }
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        BusEvent::FaultStateChanged {
            from: FaultState::ErrorActive,
            to: FaultState::ErrorPassive,
            ..
        }
    )));
    assert_eq!(bus.fault_state(&victim).unwrap(), FaultState::ErrorPassive);
}

#[test]
fn test_bus_off_drops_queue_and_ignores_new_intents() {
    let victim = NodeId::new("VICTIM", 1);
    let attacker = NodeId::new("ATTACKER", 2);
    let listener = NodeId::new("LISTENER", 3);
    let mut bus = arbiter(&[&victim, &attacker, &listener]);
    bus.set_counters(&victim, 250, 0).unwrap();

    let frame = CanFrame::new(0x173, vec![0x10]);
    bus.submit_intent(&victim, frame.clone()).unwrap();
    bus.submit_intent(&victim, frame.clone()).unwrap();
    bus.submit_intent(&attacker, forge_corrupting_frame(&frame).unwrap())
        .unwrap();
    let events = bus.run_until_idle(2_000);

    assert_eq!(bus.fault_state(&victim).unwrap(), FaultState::BusOff);
    assert_eq!(bus.counters(&victim).unwrap().0, 258);
    assert_eq!(bus.pending_intents(&victim).unwrap(), 0);
    assert_eq!(bus.stats().bus_off_events, 1);
    // the victim leaves without a flag and the attacker's frame survives
    assert!(!events
        .iter()
        .any(|e| matches!(e, BusEvent::ErrorFlag { node, .. } if *node == victim)));
    assert_eq!(committed_ids(&events), vec![0x173]);

    bus.submit_intent(&victim, frame).unwrap();
    assert_eq!(bus.pending_intents(&victim).unwrap(), 0);
    assert!(bus.run_until_idle(500).is_empty());
    assert_eq!(bus.counters(&victim).unwrap(), (258, 0));
}

// ============================================================================
// Observers
// ============================================================================

#[derive(Clone, Default)]
struct Recorder {
    seen: Arc<Mutex<Vec<String>>>,
}

impl BusObserver for Recorder {
    fn on_frame_committed(&mut self, committed: &CommittedFrame) {
        self.seen
            .lock()
            .unwrap()
            .push(format!("commit {:03X}", committed.frame.id));
    }

    fn on_frame_aborted(&mut self, offender: &NodeId, state: FaultState) {
        self.seen
            .lock()
            .unwrap()
            .push(format!("abort {} {}", offender.name, state));
    }
}

#[test]
fn test_observers_notified_in_order() {
    let victim = NodeId::new("VICTIM", 1);
    let attacker = NodeId::new("ATTACKER", 2);
    let mut bus = arbiter(&[&victim, &attacker]);
    let recorder = Recorder::default();
    bus.add_observer(Box::new(recorder.clone()));

    bus.submit_intent(&victim, CanFrame::new(0x173, vec![0x10]))
        .unwrap();
    bus.submit_intent(&attacker, CanFrame::new(0x173, vec![0x00]))
        .unwrap();
    bus.run_until_idle(1_000);
    bus.submit_intent(&victim, CanFrame::new(0x100, vec![])).unwrap();
    bus.run_until_idle(1_000);

    let seen = recorder.seen.lock().unwrap().clone();
    assert_eq!(seen, vec!["abort VICTIM ERROR_ACTIVE", "commit 100"]);
}
