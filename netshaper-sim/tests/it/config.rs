use std::time::Duration;

use netshaper_sim::{DriverCall, RecordingDriver, SimulationFile};

const LINK: &str = r#"
[discipline]
kind = "wfq"

[[discipline.classes]]
id = 1
weight = 3.0

[[discipline.classes]]
id = 2
weight = 1.0

[[profiles]]
name = "wan"
kind = "delay"
base_ms = 20

[[profiles]]
name = "cut"
kind = "loss"
model = "gemodel"
p = 100
r = 0

[[scenarios]]
name = "wan"
interface = "veth0"
profiles = ["wan"]
events = [{ start_ms = 500, end_ms = 600, profile = "cut" }]

[simulation]
seed = 3
step_ms = 5

[[simulation.sources]]
class_id = 1
packets_per_step = 3
packet_size = 1000

[[simulation.sources]]
class_id = 2
packets_per_step = 3
packet_size = 1000
"#;

#[test]
fn file_runs_its_scenario() {
    let _ = tracing_subscriber::fmt::try_init();

    let file = SimulationFile::from_toml_str(LINK).unwrap();
    let driver = RecordingDriver::new();
    let sim = file.build(driver.clone()).unwrap();

    sim.run_for(200).unwrap();

    let stats = sim.statistics();
    assert_eq!(stats.elapsed, Duration::from_secs(1));
    // The gemodel event moves each flow to the bad state after its first packet, for good.
    assert_eq!(stats.drops.lost, 20 * 6 - 2);
    assert!(sim.drain_emissions().iter().all(|e| e.delay == Duration::from_millis(20)));

    let applies = driver
        .calls()
        .into_iter()
        .filter(|call| matches!(call, DriverCall::Apply { interface, .. } if interface == "veth0"))
        .count();
    assert_eq!(applies, 3);
}
