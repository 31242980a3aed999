use std::time::Duration;

use netshaper_qdisc::{QueueDiscipline, TrafficClass};
use netshaper_sim::{
    DelayProfile, DriverCall, ImpairmentSimulator, LossModel, Preset, ProfileStore,
    RecordingDriver, Scenario, ScenarioEvent, SimulationConfig, TrafficSource,
};

fn store() -> ProfileStore {
    let store = ProfileStore::new();
    store.add_delay_profile("lan", DelayProfile::new(10.0, 0.0)).unwrap();
    store.add_loss_profile("outage", LossModel::random(100.0)).unwrap();
    store
        .add_scenario(
            Scenario::new("flaky", "eth0")
                .profile("lan")
                .event(ScenarioEvent::new(100, 200, "outage")),
        )
        .unwrap();
    store
}

fn simulator(
    store: &ProfileStore,
    scenario: &str,
    driver: RecordingDriver,
) -> ImpairmentSimulator {
    let qdisc = QueueDiscipline::wfq(Default::default());
    qdisc.initialize([TrafficClass::new(1)]).unwrap();

    ImpairmentSimulator::new(
        qdisc,
        SimulationConfig::default()
            .step(Duration::from_millis(10))
            .source(TrafficSource::new(1, 1, 100)),
    )
    .with_driver(driver)
    .with_scenario(store.resolve_scenario(scenario).unwrap())
    .unwrap()
}

fn applied(calls: &[DriverCall]) -> Vec<(f64, f64)> {
    calls
        .iter()
        .filter_map(|call| match call {
            DriverCall::Apply { description, .. } => {
                Some((description.delay_ms, description.loss_pct))
            }
            DriverCall::Clear { .. } => None,
        })
        .collect()
}

#[test]
fn events_start_and_end_on_the_clock() {
    let _ = tracing_subscriber::fmt::try_init();

    let driver = RecordingDriver::new();
    let sim = simulator(&store(), "flaky", driver.clone());

    sim.run_for(15).unwrap();
    assert_eq!(sim.statistics().active_events, vec![0]);
    assert_eq!(applied(&driver.calls()), vec![(10.0, 0.0), (10.0, 100.0)]);

    sim.run_for(15).unwrap();
    let stats = sim.statistics();
    assert!(stats.active_events.is_empty());
    assert_eq!(applied(&driver.calls()), vec![(10.0, 0.0), (10.0, 100.0), (10.0, 0.0)]);

    // Everything dequeued in [100, 200) is lost. The packet of the last step is still held.
    assert_eq!(stats.drops.lost, 10);
    assert_eq!(stats.global.delivered, 19);
    assert_eq!(sim.in_flight(), 1);
    assert_eq!(stats.global.mean_delay(), Some(Duration::from_millis(10)));

    let current = driver.current("eth0").unwrap();
    assert_eq!(current.loss_model, None);
    assert_eq!(current.netem_args(), ["delay", "10ms"]);
}

#[test]
fn unchanged_events_are_not_reapplied() {
    let driver = RecordingDriver::new();
    let sim = simulator(&store(), "flaky", driver.clone());

    sim.run_for(10).unwrap();
    assert_eq!(driver.calls().len(), 1);
}

#[test]
fn presets_drive_the_engine() {
    let store = ProfileStore::new();
    store.add_preset("sat", "wlan0", Preset::SatelliteLink).unwrap();

    let driver = RecordingDriver::new();
    let sim = simulator(&store, "sat", driver.clone());
    sim.run_for(200).unwrap();

    let current = driver.current("wlan0").unwrap();
    assert_eq!((current.delay_ms, current.jitter_ms), (500.0, 10.0));
    assert_eq!(current.loss_pct, 1.0);

    // Every delivered packet was held between 490 and 510 ms.
    let emissions = sim.drain_emissions();
    assert!(!emissions.is_empty());
    assert!(emissions
        .iter()
        .all(|e| (Duration::from_millis(490)..=Duration::from_millis(510)).contains(&e.delay)));
}

#[test]
fn overlapping_events_last_listed_wins() {
    let store = store();
    store.add_loss_profile("light", LossModel::random(10.0)).unwrap();
    store.add_event("flaky", ScenarioEvent::new(150, 300, "light")).unwrap();

    let driver = RecordingDriver::new();
    let sim = simulator(&store, "flaky", driver.clone());
    sim.run_for(20).unwrap();

    assert_eq!(sim.statistics().active_events, vec![0, 1]);
    assert_eq!(applied(&driver.calls()), vec![(10.0, 0.0), (10.0, 100.0), (10.0, 10.0)]);
}
