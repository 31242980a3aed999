use std::{
    cmp::Ordering as CmpOrdering,
    collections::BinaryHeap,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use bytes::Bytes;
use futures::Stream;
use netshaper_common::{ClassId, FlowId, Packet};
use netshaper_qdisc::{QdiscStats, QueueDiscipline, TokenBucket, TokenBucketConfig};
use parking_lot::{Mutex, RwLock};
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

use crate::{
    driver::{ImpairmentDriver, NoopDriver},
    engine::{Delivery, ImpairmentEngine, ImpairmentOutcome, ImpairmentStats},
    scenario::ResolvedScenario,
    stats::{DropReason, RunStatistics, StepReport},
    SimulationError,
};

/// Default logical step.
pub const DEFAULT_STEP: Duration = Duration::from_millis(10);
/// Default number of packets pulled from the discipline per step.
pub const DEFAULT_DEQUEUE_BUDGET: usize = 64;
/// Default capacity of the injection and emission channels.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Generates packets for one class on every step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrafficSource {
    pub class_id: ClassId,
    pub flow_id: FlowId,
    pub packets_per_step: u32,
    pub packet_size: usize,
    /// Attach a payload of `packet_size` bytes, making corruption observable.
    pub payload: bool,
}

impl TrafficSource {
    pub const fn new(class_id: ClassId, packets_per_step: u32, packet_size: usize) -> Self {
        Self {
            class_id,
            flow_id: class_id as FlowId,
            packets_per_step,
            packet_size,
            payload: false,
        }
    }

    pub const fn flow(mut self, flow_id: FlowId) -> Self {
        self.flow_id = flow_id;
        self
    }

    pub const fn with_payload(mut self) -> Self {
        self.payload = true;
        self
    }
}

#[derive(Debug, Clone)]
pub struct SimulationConfig {
    /// Logical time advanced by each step, and the wall-clock tick of the background task.
    step: Duration,
    /// Seed of the impairment engine.
    seed: u64,
    /// Packets dequeued per step at most.
    dequeue_budget: usize,
    /// Capacity of the emission stream.
    sink_capacity: usize,
    /// Capacity of the injection channel.
    inject_capacity: usize,
    /// Logical run time after which the background task stops on its own.
    duration: Option<Duration>,
    sources: Vec<TrafficSource>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            step: DEFAULT_STEP,
            seed: 0,
            dequeue_budget: DEFAULT_DEQUEUE_BUDGET,
            sink_capacity: DEFAULT_CHANNEL_CAPACITY,
            inject_capacity: DEFAULT_CHANNEL_CAPACITY,
            duration: None,
            sources: Vec::new(),
        }
    }
}

impl SimulationConfig {
    /// Sets the step. A zero step is raised to one millisecond.
    pub fn step(mut self, step: Duration) -> Self {
        self.step = step.max(Duration::from_millis(1));
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn dequeue_budget(mut self, budget: usize) -> Self {
        self.dequeue_budget = budget;
        self
    }

    pub fn sink_capacity(mut self, capacity: usize) -> Self {
        self.sink_capacity = capacity.max(1);
        self
    }

    pub fn inject_capacity(mut self, capacity: usize) -> Self {
        self.inject_capacity = capacity.max(1);
        self
    }

    pub fn duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn source(mut self, source: TrafficSource) -> Self {
        self.sources.push(source);
        self
    }

    pub fn step_duration(&self) -> Duration {
        self.step
    }

    pub fn seed_value(&self) -> u64 {
        self.seed
    }

    pub fn sources(&self) -> &[TrafficSource] {
        &self.sources
    }

    pub fn run_duration(&self) -> Option<Duration> {
        self.duration
    }
}

/// A packet leaving the simulated path.
#[derive(Debug, Clone, PartialEq)]
pub struct Emission {
    pub packet: Packet,
    /// Logical time of release.
    pub released_at: Duration,
    /// Hold time added by the engine.
    pub delay: Duration,
    pub corrupted: bool,
    pub reordered: bool,
}

/// A delivery waiting for its release time. Ordered so the [`BinaryHeap`] pops the earliest
/// release first, then the earliest scheduled.
#[derive(Debug)]
struct Pending {
    release_at: Duration,
    order: u64,
    delivery: Delivery,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (other.release_at, other.order).cmp(&(self.release_at, self.order))
    }
}

/// Handle for feeding packets into a simulator from elsewhere.
#[derive(Debug, Clone)]
pub struct SimulatorHandle {
    tx: mpsc::Sender<Packet>,
}

impl SimulatorHandle {
    /// Queues `packet` for the next step. Never waits.
    pub fn inject(&self, packet: Packet) -> Result<(), SimulationError> {
        self.tx.try_send(packet).map_err(|e| match e {
            TrySendError::Full(_) => SimulationError::InjectQueueFull,
            TrySendError::Closed(_) => SimulationError::NotRunning,
        })
    }
}

/// Mutable run state. Only ever touched under the core lock, one step at a time.
struct SimCore {
    clock: Duration,
    epoch: Instant,
    next_seq: u64,
    next_order: u64,
    policer: Option<TokenBucket>,
    driver: Box<dyn ImpairmentDriver>,
    scenario: Option<ResolvedScenario>,
    /// Events in force, and whether the driver has seen the current state.
    active: Vec<usize>,
    installed: bool,
    pending: BinaryHeap<Pending>,
    highest_released: Option<u64>,
    inject_rx: mpsc::Receiver<Packet>,
    emit_tx: mpsc::Sender<Emission>,
}

impl SimCore {
    /// Applies the events active at the current clock to the engine, and pushes any change to
    /// the driver.
    fn sync_events(
        &mut self,
        engine: &ImpairmentEngine,
        report: &mut StepReport,
    ) -> Result<(), SimulationError> {
        let Some(scenario) = &self.scenario else {
            return Ok(());
        };

        let now_ms = self.clock.as_millis() as u64;
        let active = scenario.active_events(now_ms);
        if self.installed && active == self.active {
            report.active_events.clone_from(&self.active);
            return Ok(());
        }

        for idx in active.iter().filter(|idx| !self.active.contains(idx)) {
            let profile = &scenario.events[*idx].profile_name;
            info!(scenario = %scenario.name, %profile, at_ms = now_ms, "Event started");
        }
        for idx in self.active.iter().filter(|idx| !active.contains(idx)) {
            let profile = &scenario.events[*idx].profile_name;
            info!(scenario = %scenario.name, %profile, at_ms = now_ms, "Event ended");
        }

        engine.set_overlay(scenario.overlay_at(now_ms))?;
        self.driver.apply(&scenario.interface, &engine.describe())?;

        self.active = active;
        self.installed = true;
        report.active_events.clone_from(&self.active);
        Ok(())
    }

    /// Admits injected and generated packets into the discipline.
    fn ingest(
        &mut self,
        sources: &[TrafficSource],
        qdisc: &QueueDiscipline,
        report: &mut StepReport,
    ) {
        let mut arrivals = Vec::new();
        while let Ok(packet) = self.inject_rx.try_recv() {
            arrivals.push(packet);
        }

        for source in sources {
            for _ in 0..source.packets_per_step {
                let mut packet =
                    Packet::new(source.packet_size, source.class_id).with_flow(source.flow_id);
                if source.payload {
                    let fill = self.next_seq.to_le_bytes()[0];
                    packet = packet.with_payload(Bytes::from(vec![fill; source.packet_size]));
                }
                arrivals.push(packet);
            }
        }

        report.in_hand += arrivals.len() as u64;
        let enqueue_time = self.clock.as_micros() as u64;
        for mut packet in arrivals {
            packet.set_sequence(self.next_seq);
            packet.set_enqueue_time(enqueue_time);
            self.next_seq += 1;

            let class_id = qdisc.classify(&packet);
            let size = packet.size();

            let policed = self
                .policer
                .as_ref()
                .is_some_and(|p| p.consume_at(size as u64, self.epoch + self.clock).is_err());
            if policed {
                trace!(class_id, size, "Packet policed");
                report.dropped(class_id, size, DropReason::Policed);
            } else {
                match qdisc.enqueue(packet, class_id) {
                    Ok(()) => report.queued(class_id, size),
                    Err(e) => {
                        trace!(class_id, size, %e, "Packet rejected by discipline");
                        report.dropped(class_id, size, DropReason::Rejected);
                    }
                }
            }
            report.in_hand -= 1;
        }
    }

    /// Pulls up to `budget` packets through the engine and schedules their release.
    fn service(
        &mut self,
        budget: usize,
        qdisc: &QueueDiscipline,
        engine: &ImpairmentEngine,
        report: &mut StepReport,
    ) -> Result<(), SimulationError> {
        for _ in 0..budget {
            let Some(packet) = qdisc.dequeue()? else {
                break;
            };

            let (class_id, size) = (packet.class_id(), packet.size());
            report.dequeued(class_id, size);
            report.in_hand += 1;

            let outcome = engine.apply_at(packet, self.clock);
            match &outcome {
                ImpairmentOutcome::Drop => report.dropped(class_id, size, DropReason::Lost),
                ImpairmentOutcome::Duplicate(..) => report.duplicated(class_id),
                _ => {}
            }

            for delivery in outcome.into_deliveries() {
                self.pending.push(Pending {
                    release_at: self.clock + delivery.delay,
                    order: self.next_order,
                    delivery,
                });
                self.next_order += 1;
            }
            report.in_hand -= 1;
        }

        Ok(())
    }

    /// Emits every delivery due by the current clock.
    fn release(&mut self, report: &mut StepReport) {
        while self.pending.peek().is_some_and(|p| p.release_at <= self.clock) {
            let Some(Pending { release_at, delivery, .. }) = self.pending.pop() else {
                break;
            };

            let seq = delivery.packet.arrival_sequence();
            match self.highest_released {
                Some(highest) if seq < highest => report.out_of_order += 1,
                _ => self.highest_released = Some(seq),
            }
            report.delivered(&delivery);

            let emission = Emission {
                packet: delivery.packet,
                released_at: release_at,
                delay: delivery.delay,
                corrupted: delivery.corrupted,
                reordered: delivery.reordered,
            };
            if self.emit_tx.try_send(emission).is_err() {
                report.sink_overflow += 1;
            }
        }
    }

    fn clear_driver(&mut self) -> Result<(), SimulationError> {
        if let Some(scenario) = &self.scenario {
            if self.installed {
                self.driver.clear(&scenario.interface)?;
                self.installed = false;
                self.active.clear();
            }
        }
        Ok(())
    }
}

struct Shared {
    config: SimulationConfig,
    running: AtomicBool,
    qdisc: QueueDiscipline,
    engine: ImpairmentEngine,
    core: Mutex<SimCore>,
    stats: RwLock<RunStatistics>,
}

impl Shared {
    /// Runs one step. The shared statistics are updated once the step has completed. A step
    /// that fails or panics still reports the packets it moved, without advancing the clock.
    fn step(&self) -> Result<(), SimulationError> {
        let mut report = StepReport::default();
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.advance(&mut report)))
            .unwrap_or(Err(SimulationError::Panicked));

        let mut stats = self.stats.write();
        match result {
            Ok(()) => stats.merge(&report),
            Err(_) => stats.merge_aborted(&report),
        }
        result
    }

    fn advance(&self, report: &mut StepReport) -> Result<(), SimulationError> {
        let mut core = self.core.lock();

        core.sync_events(&self.engine, report)?;
        core.ingest(&self.config.sources, &self.qdisc, report);
        core.service(self.config.dequeue_budget, &self.qdisc, &self.engine, report)?;
        core.release(report);

        core.clock += self.config.step;
        report.elapsed = core.clock;
        Ok(())
    }

    fn finished(&self) -> bool {
        self.config.duration.is_some_and(|d| self.core.lock().clock >= d)
    }
}

async fn run(shared: Arc<Shared>) {
    let mut interval = tokio::time::interval(shared.config.step);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!("Simulation started");

    while shared.running.load(Ordering::Acquire) {
        if shared.finished() {
            info!("Simulation reached its duration");
            break;
        }

        interval.tick().await;
        if !shared.running.load(Ordering::Acquire) {
            break;
        }

        match shared.step() {
            Ok(()) => {}
            Err(SimulationError::Panicked) => {
                error!("Simulation step panicked, stopping");
                break;
            }
            Err(e) => {
                error!(%e, "Simulation step failed, stopping");
                break;
            }
        }
    }

    shared.running.store(false, Ordering::Release);
    let stats = shared.stats.read();
    info!(steps = stats.steps, delivered = stats.global.delivered, "Simulation stopped");
}

/// A time-stepped traffic simulation.
///
/// Every step advances a logical clock by the configured step and:
/// 1. applies the scenario events active at the new clock,
/// 2. admits injected and generated packets (through the optional policer) into the discipline,
/// 3. dequeues up to the budget and passes each packet through the impairment engine,
/// 4. releases every delivery whose hold time has expired to the emission stream.
///
/// Steps can be driven synchronously with [`step`](Self::step) and [`run_for`](Self::run_for),
/// or by a background task with [`start`](Self::start) and [`stop`](Self::stop). The task runs
/// the same step on every tick and checks its running flag between steps, never mid-step.
pub struct ImpairmentSimulator {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
    inject_tx: mpsc::Sender<Packet>,
    emissions: Mutex<Option<mpsc::Receiver<Emission>>>,
}

impl ImpairmentSimulator {
    /// Creates a simulator over an initialized discipline, with no impairments and a
    /// [`NoopDriver`].
    pub fn new(qdisc: QueueDiscipline, config: SimulationConfig) -> Self {
        let (inject_tx, inject_rx) = mpsc::channel(config.inject_capacity);
        let (emit_tx, emit_rx) = mpsc::channel(config.sink_capacity);
        let engine = ImpairmentEngine::new(config.seed);

        let core = SimCore {
            clock: Duration::ZERO,
            epoch: Instant::now(),
            next_seq: 0,
            next_order: 0,
            policer: None,
            driver: Box::new(NoopDriver),
            scenario: None,
            active: Vec::new(),
            installed: false,
            pending: BinaryHeap::new(),
            highest_released: None,
            inject_rx,
            emit_tx,
        };

        Self {
            shared: Arc::new(Shared {
                config,
                running: AtomicBool::new(false),
                qdisc,
                engine,
                core: Mutex::new(core),
                stats: RwLock::new(RunStatistics::default()),
            }),
            task: Mutex::new(None),
            inject_tx,
            emissions: Mutex::new(Some(emit_rx)),
        }
    }

    /// Pushes impairment changes to `driver`.
    pub fn with_driver(self, driver: impl ImpairmentDriver) -> Self {
        self.shared.core.lock().driver = Box::new(driver);
        self
    }

    /// Runs `scenario`: its profiles become the engine's base and its events are applied as
    /// the clock reaches them.
    pub fn with_scenario(self, scenario: ResolvedScenario) -> Result<Self, SimulationError> {
        self.shared.engine.set_base(scenario.base)?;
        {
            let mut core = self.shared.core.lock();
            core.scenario = Some(scenario);
            core.installed = false;
        }
        Ok(self)
    }

    /// Polices arrivals with a token bucket before they reach the discipline. The bucket runs
    /// on the simulation clock.
    pub fn with_policer(self, config: TokenBucketConfig) -> Result<Self, SimulationError> {
        {
            let mut core = self.shared.core.lock();
            let start = core.epoch + core.clock;
            core.policer = Some(TokenBucket::with_start(config, start)?);
        }
        Ok(self)
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.shared.config
    }

    pub fn qdisc(&self) -> &QueueDiscipline {
        &self.shared.qdisc
    }

    pub fn engine(&self) -> &ImpairmentEngine {
        &self.shared.engine
    }

    /// A handle for injecting packets, usable from other tasks.
    pub fn handle(&self) -> SimulatorHandle {
        SimulatorHandle { tx: self.inject_tx.clone() }
    }

    /// Queues `packet` for the next step.
    pub fn inject(&self, packet: Packet) -> Result<(), SimulationError> {
        self.handle().inject(packet)
    }

    /// Takes the stream of released packets. Returns `None` after the first call.
    ///
    /// Releases that find the stream full are counted in
    /// [`RunStatistics::sink_overflow`] and discarded.
    pub fn emissions(&self) -> Option<impl Stream<Item = Emission> + Send + Unpin> {
        self.emissions.lock().take().map(ReceiverStream::new)
    }

    /// Drains the released packets waiting in the stream, unless it was taken.
    pub fn drain_emissions(&self) -> Vec<Emission> {
        let mut out = Vec::new();
        if let Some(rx) = self.emissions.lock().as_mut() {
            while let Ok(emission) = rx.try_recv() {
                out.push(emission);
            }
        }
        out
    }

    /// Runs one step on the caller's thread. Fails while the background task runs.
    pub fn step(&self) -> Result<(), SimulationError> {
        if self.is_running() {
            return Err(SimulationError::AlreadyRunning);
        }
        self.shared.step()
    }

    /// Runs `steps` steps on the caller's thread.
    pub fn run_for(&self, steps: u64) -> Result<(), SimulationError> {
        let _span = info_span!("simulation", seed = self.shared.config.seed, steps).entered();
        for _ in 0..steps {
            self.step()?;
        }
        debug!(elapsed = ?self.elapsed(), "Synchronous run complete");
        Ok(())
    }

    /// Logical time of the run.
    pub fn elapsed(&self) -> Duration {
        self.shared.core.lock().clock
    }

    /// Packets held by the engine and not yet released.
    pub fn in_flight(&self) -> usize {
        self.shared.core.lock().pending.len()
    }

    /// Spawns the background task. Must be called within a tokio runtime.
    pub fn start(&self) -> Result<(), SimulationError> {
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return Err(SimulationError::AlreadyRunning);
        }

        let mut task = self.task.lock();
        if let Some(previous) = task.take() {
            if !previous.is_finished() {
                warn!("Replacing a simulation task that has not finished");
            }
        }

        let span = info_span!("simulation", seed = self.shared.config.seed);
        *task = Some(tokio::spawn(run(Arc::clone(&self.shared)).instrument(span)));
        Ok(())
    }

    /// Stops the background task, waits for it to exit, clears the driver and returns the
    /// final statistics. Returns within one step.
    pub async fn stop(&self) -> Result<RunStatistics, SimulationError> {
        let task = self.task.lock().take().ok_or(SimulationError::NotRunning)?;
        self.shared.running.store(false, Ordering::Release);
        task.await?;

        self.shared.core.lock().clear_driver()?;
        Ok(self.statistics())
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// A snapshot of the run statistics.
    pub fn statistics(&self) -> RunStatistics {
        self.shared.stats.read().clone()
    }

    pub fn qdisc_statistics(&self) -> QdiscStats {
        self.shared.qdisc.get_statistics()
    }

    pub fn engine_statistics(&self) -> ImpairmentStats {
        self.shared.engine.statistics()
    }

    /// Zeroes the run, discipline and engine counters.
    pub fn reset_statistics(&self) {
        self.shared.stats.write().reset();
        self.shared.qdisc.reset_statistics();
        self.shared.engine.reset_statistics();
    }
}

impl std::fmt::Debug for ImpairmentSimulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImpairmentSimulator")
            .field("config", &self.shared.config)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}
