//! Integration tests for the polling scheduler against the simulated box bus.

use probe_daq::acquisition::{Scheduler, SchedulerSettings, SessionState};
use probe_daq::error::ProbeError;
use probe_daq::protocol::{BoxId, Dialect};
use probe_daq::registry::{ParameterBinding, ParameterRegistry};
use probe_daq::store::{Fault, LiveCell, ProbeStatus, SampleStore};
use probe_daq::transport::claims;
use probe_daq::transport::mock::MockBus;
use probe_daq::transport::Transport;
use serial_test::serial;
use std::time::{Duration, Instant};

fn fast_settings(dialect: Dialect) -> SchedulerSettings {
    SchedulerSettings::new(dialect)
        .with_box_timeout(Duration::from_millis(20))
        .with_inter_tick_delay(Duration::from_millis(1))
}

fn registry(bindings: &[(&str, u16, u8)]) -> ParameterRegistry {
    ParameterRegistry::new(
        bindings
            .iter()
            .map(|&(name, box_id, channel)| {
                ParameterBinding::new(name, BoxId::new(box_id).unwrap(), channel)
            })
            .collect(),
    )
    .unwrap()
}

async fn wait_for_reading(store: &SampleStore, parameter: &str) -> LiveCell {
    let mut rx = store.subscribe_live(parameter).unwrap();
    let cell = tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|c| c.has_reading()))
        .await
        .expect("no reading within 2s")
        .expect("store dropped")
        .clone();
    cell
}

async fn wait_for_writes(bus: &MockBus, count: usize) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while bus.write_count() < count {
        assert!(Instant::now() < deadline, "expected {} writes", count);
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

#[tokio::test]
async fn test_bounded_collection_skips_repeats() {
    let bus = MockBus::new(Dialect::fixed_offset());
    for v in [1.0, 1.0, 2.0, 2.0, 3.0, 4.0, 5.0, 5.0, 6.0] {
        bus.push_values(1, [v, 0.0, 0.0, 0.0]);
    }
    let scheduler = Scheduler::new(
        registry(&[("gap", 1, 1)]),
        fast_settings(Dialect::fixed_offset()),
    );

    let mut session = scheduler
        .start_bounded(bus.transport("acq-bounded"), 5)
        .await
        .unwrap();
    let progress = session
        .wait_complete_timeout(Duration::from_secs(2))
        .await
        .expect("bounded session should complete");

    assert!(progress.is_complete());
    assert_eq!(
        scheduler.store().samples("gap").unwrap(),
        vec![1.0, 2.0, 3.0, 4.0, 5.0]
    );
    assert_eq!(session.state(), SessionState::Completed);
    assert_eq!(session.ticks(), 7);
    assert_eq!(bus.queued(1), 2);

    // Completed sessions stop cleanly and release the port
    assert_eq!(session.stop().await, SessionState::Completed);
    assert!(!claims::is_claimed("acq-bounded"));
}

#[tokio::test]
async fn test_write_failure_is_contained_to_its_box() {
    let bus = MockBus::new(Dialect::Tagged);
    bus.set_values(1, [0.010, 0.0, 0.0, 0.0]);
    bus.set_values(2, [0.020, 0.0, 0.0, 0.0]);
    bus.set_values(3, [0.030, 0.0, 0.0, 0.0]);
    bus.fail_writes(2, true);

    let scheduler = Scheduler::new(
        registry(&[("a", 1, 1), ("b", 2, 1), ("c", 3, 1)]),
        fast_settings(Dialect::Tagged),
    );
    let mut session = scheduler
        .start_continuous(bus.transport("acq-partial"))
        .await
        .unwrap();
    let store = scheduler.store();

    let c = wait_for_reading(&store, "c").await;
    assert_eq!(c.status, ProbeStatus::InRange);
    assert_eq!(c.value, 0.030);

    let a = store.live_value("a").unwrap();
    assert_eq!(a.value, 0.010);
    assert_eq!(a.text, "0.010");

    let b = store.live_value("b").unwrap();
    assert_eq!(b.status, ProbeStatus::Error);
    assert_eq!(b.fault, Some(Fault::Transport));
    assert!(b.has_reading());

    // Box 3 was still polled after the failed write to box 2
    let writes = bus.writes();
    assert_eq!(&writes[..3], ["*001VALL#\r", "*002VALL#\r", "*003VALL#\r"]);

    session.stop().await;
}

#[tokio::test]
async fn test_undecodable_reply_marks_parameter_error() {
    let bus = MockBus::new(Dialect::Tagged);
    bus.push_raw(1, "*001 garbage#");
    bus.set_values(1, [0.5, 0.0, 0.0, 0.0]);

    let scheduler = Scheduler::new(registry(&[("a", 1, 1)]), fast_settings(Dialect::Tagged));
    let mut session = scheduler
        .start_continuous(bus.transport("acq-garbage"))
        .await
        .unwrap();

    let first = wait_for_reading(&scheduler.store(), "a").await;
    assert_eq!(first.status, ProbeStatus::Error);
    assert_eq!(first.fault, Some(Fault::Decode));
    assert_eq!(first.tick, 1);
    assert!(first.text.starts_with("ERROR"));

    // The next tick recovers
    let mut rx = scheduler.store().subscribe_live("a").unwrap();
    tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|c| c.tick >= 2))
        .await
        .unwrap()
        .unwrap();
    let recovered = scheduler.store().live_value("a").unwrap();
    assert_eq!(recovered.status, ProbeStatus::InRange);
    assert_eq!(recovered.value, 0.5);

    session.stop().await;
}

#[tokio::test]
async fn test_out_of_range_channel_is_config_fault() {
    let bus = MockBus::new(Dialect::fixed_offset());
    bus.set_values(1, [1.0, 2.0, 3.0, 4.0]);

    let scheduler = Scheduler::new(
        registry(&[("zero", 1, 0), ("five", 1, 5), ("four", 1, 4)]),
        fast_settings(Dialect::fixed_offset()),
    );
    let mut session = scheduler
        .start_continuous(bus.transport("acq-channels"))
        .await
        .unwrap();
    let store = scheduler.store();

    let four = wait_for_reading(&store, "four").await;
    assert_eq!(four.value, 4.0);

    let zero = store.live_value("zero").unwrap();
    assert_eq!(zero.status, ProbeStatus::Error);
    assert_eq!(zero.fault, Some(Fault::ChannelConfig { channel: 0 }));

    let five = store.live_value("five").unwrap();
    assert_eq!(five.fault, Some(Fault::ChannelConfig { channel: 5 }));

    session.stop().await;
}

#[tokio::test]
async fn test_classification_and_multi_channel_values() {
    let bus = MockBus::new(Dialect::fixed_offset());
    bus.set_values(2, [0.004, -0.030, 0.001, 0.0]);

    let scheduler = Scheduler::new(
        ParameterRegistry::new(vec![
            ParameterBinding::new("flat", BoxId::new(2).unwrap(), 1)
                .with_channels(vec![1, 3])
                .with_limits(-0.010, 0.010),
            ParameterBinding::new("taper", BoxId::new(2).unwrap(), 2).with_limits(-0.010, 0.010),
        ])
        .unwrap(),
        fast_settings(Dialect::fixed_offset()),
    );
    let mut session = scheduler
        .start_continuous(bus.transport("acq-classify"))
        .await
        .unwrap();
    let store = scheduler.store();

    let taper = wait_for_reading(&store, "taper").await;
    assert_eq!(taper.status, ProbeStatus::Under);
    assert!(!taper.in_range);
    assert!(taper.text.starts_with("UNDER"));

    let flat = store.live_value("flat").unwrap();
    assert_eq!(flat.status, ProbeStatus::InRange);
    assert_eq!(flat.values, vec![0.004, 0.001]);
    assert_eq!(flat.text, "0.004 / 0.001");

    session.stop().await;
}

#[tokio::test]
async fn test_stop_twice_is_safe() {
    let bus = MockBus::new(Dialect::Tagged);
    bus.set_values(1, [1.0, 0.0, 0.0, 0.0]);
    let scheduler = Scheduler::new(registry(&[("a", 1, 1)]), fast_settings(Dialect::Tagged));

    let mut session = scheduler
        .start_continuous(bus.transport("acq-stop-twice"))
        .await
        .unwrap();
    wait_for_reading(&scheduler.store(), "a").await;

    assert_eq!(session.stop().await, SessionState::Stopped);
    assert_eq!(session.stop().await, SessionState::Stopped);
    assert_eq!(scheduler.state(), SessionState::Stopped);
    assert!(!claims::is_claimed("acq-stop-twice"));
}

#[tokio::test]
async fn test_stop_during_long_delay_is_prompt() {
    let bus = MockBus::new(Dialect::Tagged);
    for id in 1..=3 {
        bus.set_values(id, [1.0, 0.0, 0.0, 0.0]);
    }
    let settings = SchedulerSettings::new(Dialect::Tagged)
        .with_box_timeout(Duration::from_millis(20))
        .with_inter_tick_delay(Duration::from_secs(10));
    let scheduler = Scheduler::new(registry(&[("a", 1, 1), ("b", 2, 1), ("c", 3, 1)]), settings);

    let mut session = scheduler
        .start_continuous(bus.transport("acq-liveness"))
        .await
        .unwrap();
    wait_for_writes(&bus, 3).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let started = Instant::now();
    let state = tokio::time::timeout(Duration::from_secs(1), session.stop())
        .await
        .expect("stop should not wait out the inter-tick delay");
    assert_eq!(state, SessionState::Stopped);
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(bus.write_count(), 3);
    assert_eq!(session.ticks(), 1);
}

#[tokio::test]
async fn test_stop_abandons_pending_read() {
    // Box 1 never answers and the read timeout is long
    let bus = MockBus::new(Dialect::Tagged);
    let settings = SchedulerSettings::new(Dialect::Tagged)
        .with_box_timeout(Duration::from_secs(10))
        .with_inter_tick_delay(Duration::from_millis(1));
    let scheduler = Scheduler::new(registry(&[("a", 1, 1), ("b", 2, 1)]), settings);

    let mut session = scheduler
        .start_continuous(bus.transport("acq-silent"))
        .await
        .unwrap();
    wait_for_writes(&bus, 1).await;

    let state = tokio::time::timeout(Duration::from_secs(1), session.stop())
        .await
        .expect("stop should abandon the pending read");
    assert_eq!(state, SessionState::Stopped);
    // Box 2 was never addressed and the abandoned box published nothing
    assert_eq!(bus.writes(), vec!["*001VALL#\r".to_string()]);
    assert!(!scheduler.store().live_value("a").unwrap().has_reading());
}

#[tokio::test]
#[serial]
async fn test_port_owned_by_other_session() {
    let bus = MockBus::new(Dialect::Tagged);
    bus.set_values(1, [1.0, 0.0, 0.0, 0.0]);
    let first = Scheduler::new(registry(&[("a", 1, 1)]), fast_settings(Dialect::Tagged));
    let second = Scheduler::new(registry(&[("a", 1, 1)]), fast_settings(Dialect::Tagged));

    let mut session = first
        .start_continuous(bus.transport("acq-shared"))
        .await
        .unwrap();
    let conflict = second.start_continuous(bus.transport("acq-shared")).await;
    assert!(matches!(conflict, Err(ProbeError::Ownership(port)) if port == "acq-shared"));
    assert_eq!(second.state(), SessionState::Idle);

    session.stop().await;
    let mut again = second
        .start_continuous(bus.transport("acq-shared"))
        .await
        .expect("port is free after the first session stops");
    again.stop().await;
}

#[tokio::test]
#[serial]
async fn test_already_open_transport_is_ownership_error() {
    let bus = MockBus::new(Dialect::Tagged);
    let mut transport = bus.transport("acq-preopened");
    transport.open().await.unwrap();

    let scheduler = Scheduler::new(registry(&[("a", 1, 1)]), fast_settings(Dialect::Tagged));
    let result = scheduler.start_continuous(transport).await;
    assert!(matches!(result, Err(ProbeError::Ownership(_))));
    assert_eq!(scheduler.state(), SessionState::Idle);
    assert!(!claims::is_claimed("acq-preopened"));
}

#[tokio::test]
async fn test_start_while_running() {
    let bus = MockBus::new(Dialect::Tagged);
    bus.set_values(1, [1.0, 0.0, 0.0, 0.0]);
    let scheduler = Scheduler::new(registry(&[("a", 1, 1)]), fast_settings(Dialect::Tagged));

    let mut session = scheduler
        .start_continuous(bus.transport("acq-running"))
        .await
        .unwrap();
    let second = scheduler.start_bounded(bus.transport("acq-running-2"), 3).await;
    assert!(matches!(second, Err(ProbeError::AlreadyRunning)));
    session.stop().await;

    // A stopped scheduler can start again
    let mut bounded = scheduler
        .start_bounded(bus.transport("acq-running-2"), 1)
        .await
        .unwrap();
    assert_eq!(bounded.wait_finished().await, SessionState::Completed);
    bounded.stop().await;
}

#[tokio::test]
async fn test_open_failure_prevents_start() {
    let bus = MockBus::new(Dialect::Tagged);
    bus.fail_open(true);
    let scheduler = Scheduler::new(registry(&[("a", 1, 1)]), fast_settings(Dialect::Tagged));

    let result = scheduler.start_continuous(bus.transport("acq-offline")).await;
    assert!(matches!(result, Err(ProbeError::Transport(_))));
    assert_eq!(scheduler.state(), SessionState::Idle);
    assert_eq!(bus.write_count(), 0);
}

#[tokio::test]
async fn test_bounded_incomplete_is_observable() {
    let bus = MockBus::new(Dialect::Tagged);
    bus.push_values(1, [1.0, 0.0, 0.0, 0.0]);
    bus.set_values(1, [2.0, 0.0, 0.0, 0.0]);
    // Box 2 is silent; "b" never fills
    let scheduler = Scheduler::new(
        registry(&[("a", 1, 1), ("b", 2, 1)]),
        fast_settings(Dialect::Tagged),
    );

    let mut session = scheduler
        .start_bounded(bus.transport("acq-incomplete"), 2)
        .await
        .unwrap();
    let progress = session
        .wait_complete_timeout(Duration::from_millis(200))
        .await
        .expect_err("silent box keeps the session incomplete");

    assert_eq!(progress.target, 2);
    assert_eq!(progress.counts, vec![("a".to_string(), 2), ("b".to_string(), 0)]);
    assert_eq!(progress.pending().collect::<Vec<_>>(), vec!["b"]);
    assert_eq!(session.state(), SessionState::Running);
    assert!(!session.is_complete());

    assert_eq!(session.stop().await, SessionState::Stopped);
    assert_eq!(scheduler.store().samples("a").unwrap(), vec![1.0, 2.0]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn test_finished_session_releases_port_before_reporting() {
    let bus = MockBus::new(Dialect::Tagged);
    bus.set_values(1, [1.0, 0.0, 0.0, 0.0]);
    let scheduler = Scheduler::new(registry(&[("a", 1, 1)]), fast_settings(Dialect::Tagged));

    for round in 0..200 {
        let mut session = scheduler
            .start_bounded(bus.transport("acq-restart"), 1)
            .await
            .unwrap_or_else(|e| panic!("restart {} failed: {}", round, e));
        assert_eq!(session.wait_finished().await, SessionState::Completed);
        assert!(!claims::is_claimed("acq-restart"));
        assert_eq!(scheduler.state(), SessionState::Completed);
        session.stop().await;
    }
}

#[tokio::test]
async fn test_bounded_write_failure_skips_only_its_box() {
    let bus = MockBus::new(Dialect::Tagged);
    for (a, c) in [(0.010, 0.030), (0.011, 0.031), (0.012, 0.032)] {
        bus.push_values(1, [a, 0.0, 0.0, 0.0]);
        bus.push_values(3, [c, 0.0, 0.0, 0.0]);
    }
    bus.set_values(2, [0.050, 0.0, 0.0, 0.0]);
    bus.fail_writes(2, true);

    let scheduler = Scheduler::new(
        registry(&[("a", 1, 1), ("b", 2, 1), ("c", 3, 1)]),
        fast_settings(Dialect::Tagged),
    );
    let mut session = scheduler
        .start_bounded(bus.transport("acq-bounded-partial"), 3)
        .await
        .unwrap();
    let progress = session
        .wait_complete_timeout(Duration::from_millis(300))
        .await
        .expect_err("box 2 never accepts a write");

    let store = scheduler.store();
    assert_eq!(store.samples("a").unwrap(), vec![0.010, 0.011, 0.012]);
    assert_eq!(store.samples("c").unwrap(), vec![0.030, 0.031, 0.032]);
    assert!(store.samples("b").unwrap().is_empty());
    assert_eq!(progress.pending().collect::<Vec<_>>(), vec!["b"]);
    assert_eq!(session.state(), SessionState::Running);

    // Boxes 1 and 3 kept being polled around the failing box
    let writes = bus.writes();
    assert_eq!(&writes[..3], ["*001VALL#\r", "*002VALL#\r", "*003VALL#\r"]);
    assert!(session.ticks() > 3);

    assert_eq!(session.stop().await, SessionState::Stopped);
}
