use std::time::Duration;

use netshaper_common::Packet;
use netshaper_qdisc::{QueueDiscipline, TrafficClass};
use netshaper_sim::{
    DelayProfile, DriverCall, DriverError, ImpairmentDescription, ImpairmentDriver,
    ImpairmentSimulator, LossModel, ProfileStore, RecordingDriver, Scenario, ScenarioEvent,
    SimulationConfig, SimulationError, TrafficSource,
};

fn simulator(config: SimulationConfig) -> ImpairmentSimulator {
    let qdisc = QueueDiscipline::drr(Default::default());
    qdisc.initialize([TrafficClass::new(1)]).unwrap();
    ImpairmentSimulator::new(qdisc, config.source(TrafficSource::new(1, 1, 100)))
}

async fn wait_until_stopped(sim: &ImpairmentSimulator) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while sim.is_running() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("simulation did not stop");
}

#[tokio::test]
async fn start_and_stop() {
    let _ = tracing_subscriber::fmt::try_init();

    let sim = simulator(SimulationConfig::default().step(Duration::from_millis(1)));
    assert!(matches!(sim.stop().await, Err(SimulationError::NotRunning)));

    sim.start().unwrap();
    assert!(sim.is_running());
    assert!(matches!(sim.start(), Err(SimulationError::AlreadyRunning)));
    assert!(matches!(sim.step(), Err(SimulationError::AlreadyRunning)));

    tokio::time::sleep(Duration::from_millis(30)).await;
    let stats = sim.stop().await.unwrap();
    assert!(!sim.is_running());
    assert!(stats.steps > 0);
    assert_eq!(stats.global.packets_queued, stats.steps);
    assert_eq!(stats.elapsed, Duration::from_millis(stats.steps));

    // Stopped: steps can be driven by hand again, and the run can be restarted.
    sim.step().unwrap();
    assert_eq!(sim.statistics().steps, stats.steps + 1);
    assert!(matches!(sim.stop().await, Err(SimulationError::NotRunning)));

    sim.start().unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    let restarted = sim.stop().await.unwrap();
    assert!(restarted.steps > stats.steps + 1);
}

#[tokio::test]
async fn duration_limits_the_run() {
    let sim = simulator(
        SimulationConfig::default()
            .step(Duration::from_millis(1))
            .duration(Duration::from_millis(20)),
    );

    sim.start().unwrap();
    wait_until_stopped(&sim).await;

    let stats = sim.stop().await.unwrap();
    assert_eq!(stats.steps, 20);
    assert_eq!(stats.elapsed, Duration::from_millis(20));

    // A finished run does not step again when restarted.
    sim.start().unwrap();
    wait_until_stopped(&sim).await;
    let restarted = sim.stop().await.unwrap();
    assert_eq!(restarted.steps, 20);
    assert_eq!(restarted.global.packets_queued, 20);
}

#[tokio::test]
async fn stop_clears_the_driver() {
    let store = ProfileStore::new();
    store.add_delay_profile("lan", DelayProfile::new(2.0, 0.0)).unwrap();
    store.add_scenario(Scenario::new("lan", "eth2").profile("lan")).unwrap();

    let driver = RecordingDriver::new();
    let sim = simulator(SimulationConfig::default().step(Duration::from_millis(1)))
        .with_driver(driver.clone())
        .with_scenario(store.resolve_scenario("lan").unwrap())
        .unwrap();

    sim.start().unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    sim.stop().await.unwrap();

    let calls = driver.calls();
    assert!(matches!(calls.first(), Some(DriverCall::Apply { .. })));
    assert_eq!(calls.last(), Some(&DriverCall::Clear { interface: "eth2".to_string() }));
    assert_eq!(driver.current("eth2"), None);
}

/// Refuses any loss.
struct NoLossDriver;

impl ImpairmentDriver for NoLossDriver {
    fn apply(
        &mut self,
        interface: &str,
        description: &ImpairmentDescription,
    ) -> Result<(), DriverError> {
        if description.loss_pct > 0.0 {
            return Err(DriverError {
                interface: interface.to_string(),
                reason: "loss is not supported".to_string(),
            });
        }
        Ok(())
    }

    fn clear(&mut self, _interface: &str) -> Result<(), DriverError> {
        Ok(())
    }
}

/// Panics on any loss.
struct PanickingDriver;

impl ImpairmentDriver for PanickingDriver {
    fn apply(&mut self, _: &str, description: &ImpairmentDescription) -> Result<(), DriverError> {
        assert!(description.loss_pct == 0.0, "loss is not supported");
        Ok(())
    }

    fn clear(&mut self, _interface: &str) -> Result<(), DriverError> {
        Ok(())
    }
}

fn lossy_scenario() -> netshaper_sim::ResolvedScenario {
    let store = ProfileStore::new();
    store.add_delay_profile("base", DelayProfile::new(5.0, 0.0)).unwrap();
    store.add_loss_profile("loss", LossModel::random(10.0)).unwrap();
    store
        .add_scenario(
            Scenario::new("lossy", "eth0")
                .profile("base")
                .event(ScenarioEvent::new(50, 100, "loss")),
        )
        .unwrap();
    store.resolve_scenario("lossy").unwrap()
}

#[test]
fn failing_step_leaves_statistics_untouched() {
    let sim = simulator(SimulationConfig::default().step(Duration::from_millis(10)))
        .with_driver(NoLossDriver)
        .with_scenario(lossy_scenario())
        .unwrap();

    sim.run_for(5).unwrap();
    let err = sim.run_for(1).unwrap_err();
    assert!(matches!(err, SimulationError::Driver(_)));

    let stats = sim.statistics();
    assert_eq!(stats.steps, 5);
    assert_eq!(stats.elapsed, Duration::from_millis(50));
}

#[tokio::test]
async fn panicking_step_stops_the_task() {
    let sim = simulator(SimulationConfig::default().step(Duration::from_millis(10)))
        .with_driver(PanickingDriver)
        .with_scenario(lossy_scenario())
        .unwrap();

    sim.start().unwrap();
    wait_until_stopped(&sim).await;

    let stats = sim.stop().await.unwrap();
    assert_eq!(stats.steps, 5);
    assert_eq!(stats.elapsed, Duration::from_millis(50));
    assert_eq!(stats.global.packets_queued, 5);
}

#[test]
fn panicking_step_keeps_counters_consistent() {
    let qdisc = QueueDiscipline::drr(Default::default());
    qdisc.initialize([TrafficClass::new(1)]).unwrap();
    qdisc.set_classifier(|packet: &Packet| {
        assert!(packet.arrival_sequence() != 10, "unclassifiable packet");
        1
    });
    let sim = ImpairmentSimulator::new(
        qdisc,
        SimulationConfig::default().source(TrafficSource::new(1, 4, 100)),
    );

    sim.run_for(2).unwrap();
    assert!(matches!(sim.step(), Err(SimulationError::Panicked)));

    // Packets 8 and 9 made it into the discipline before the panic, 10 and 11 did not.
    let stats = sim.statistics();
    let qdisc = sim.qdisc().get_statistics();
    assert_eq!(stats.steps, 2);
    assert_eq!(stats.elapsed, Duration::from_millis(20));
    assert_eq!(stats.global.packets_queued, 10);
    assert_eq!(stats.global.packets_queued, qdisc.packets_queued);
    assert_eq!(stats.global.packets_dequeued, qdisc.packets_dequeued);
    assert_eq!(stats.drops.aborted, 2);
    assert_eq!(sim.qdisc().queue_size(), 2);
}
