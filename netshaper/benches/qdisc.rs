use std::time::Duration;

use bytes::Bytes;
use criterion::{
    criterion_group, criterion_main, measurement::WallTime, BenchmarkGroup, BenchmarkId, Criterion,
    Throughput,
};
use pprof::criterion::Output;
use rand::{rngs::StdRng, Rng, SeedableRng};

use netshaper::{
    DelayProfile, DisciplineKind, EffectiveImpairment, ImpairmentEngine, ImpairmentSimulator,
    LossModel, Packet, QdiscOptions, QueueDiscipline, ReorderProfile, SimulationConfig,
    TrafficClass, TrafficSource,
};

const N_PACKETS: usize = 10_000;
const N_CLASSES: u32 = 8;
const PACKET_SIZE: usize = 512;

struct QdiscBenchmark {
    packets: Vec<Packet>,
}

impl QdiscBenchmark {
    fn new(n_packets: usize) -> Self {
        let mut rng = StdRng::seed_from_u64(0);
        let packets = (0..n_packets)
            .map(|seq| {
                let class_id = rng.gen_range(0..N_CLASSES);
                let size = rng.gen_range(64..=1500);
                Packet::new(size, class_id).with_sequence(seq as u64)
            })
            .collect();

        Self { packets }
    }

    fn discipline(kind: DisciplineKind) -> QueueDiscipline {
        let qdisc = QueueDiscipline::new(
            kind,
            QdiscOptions::default().limit(usize::MAX).per_class_limit(usize::MAX),
        );
        qdisc
            .initialize((0..N_CLASSES).map(|id| TrafficClass::new(id).weight(f64::from(id + 1))))
            .unwrap();
        qdisc
    }

    fn bench_enqueue_dequeue(&self, mut group: BenchmarkGroup<'_, WallTime>) {
        for kind in [DisciplineKind::Wfq, DisciplineKind::Drr] {
            group.throughput(Throughput::Elements(self.packets.len() as u64));
            group.bench_function(BenchmarkId::from_parameter(kind), |b| {
                let qdisc = Self::discipline(kind);
                b.iter(|| {
                    for packet in &self.packets {
                        qdisc.enqueue(packet.clone(), packet.class_id()).unwrap();
                    }
                    while qdisc.dequeue().unwrap().is_some() {}
                });
            });
        }

        group.finish();
    }

    fn bench_engine(&self, mut group: BenchmarkGroup<'_, WallTime>) {
        let effects = [
            ("none", EffectiveImpairment::default()),
            (
                "delay_loss",
                EffectiveImpairment {
                    delay: Some(DelayProfile::new(50.0, 10.0)),
                    loss: Some(LossModel::gilbert(1.0, 20.0)),
                    ..Default::default()
                },
            ),
            (
                "all",
                EffectiveImpairment {
                    delay: Some(DelayProfile::new(50.0, 10.0)),
                    loss: Some(LossModel::random(2.0)),
                    reorder: Some(ReorderProfile::new(5.0, 3)),
                    corrupt: Some(netshaper::CorruptProfile::new(1.0)),
                    duplicate: Some(netshaper::DuplicateProfile {
                        percentage: 1.0,
                        correlation: 0.0,
                    }),
                    ..Default::default()
                },
            ),
        ];

        let payload = Bytes::from(vec![0xAB; PACKET_SIZE]);
        for (name, effect) in effects {
            group.throughput(Throughput::Elements(self.packets.len() as u64));
            group.bench_function(BenchmarkId::from_parameter(name), |b| {
                let engine = ImpairmentEngine::with_impairment(7, effect).unwrap();
                b.iter(|| {
                    for (i, packet) in self.packets.iter().enumerate() {
                        let packet = packet.clone().with_payload(payload.clone());
                        let now = Duration::from_micros(i as u64 * 10);
                        criterion::black_box(engine.apply_at(packet, now));
                    }
                });
            });
        }

        group.finish();
    }
}

fn qdisc_throughput(c: &mut Criterion) {
    let _ = tracing_subscriber::fmt::try_init();

    let bench = QdiscBenchmark::new(N_PACKETS);

    let mut group = c.benchmark_group("qdisc_enqueue_dequeue");
    group.sample_size(10);
    bench.bench_enqueue_dequeue(group);

    let mut group = c.benchmark_group("engine_apply");
    group.sample_size(10);
    bench.bench_engine(group);
}

fn simulator_steps(c: &mut Criterion) {
    let _ = tracing_subscriber::fmt::try_init();

    let mut group = c.benchmark_group("simulator_steps");
    group.sample_size(10);
    group.throughput(Throughput::Elements(1000));
    group.bench_function("1000_steps", |b| {
        b.iter(|| {
            let qdisc = QdiscBenchmark::discipline(DisciplineKind::Drr);
            let config = (0..N_CLASSES).fold(SimulationConfig::default().seed(1), |config, id| {
                config.source(TrafficSource::new(id, 4, PACKET_SIZE))
            });
            let sim = ImpairmentSimulator::new(qdisc, config);
            sim.engine()
                .set_base(EffectiveImpairment {
                    delay: Some(DelayProfile::new(20.0, 5.0)),
                    ..Default::default()
                })
                .unwrap();
            sim.run_for(1000).unwrap();
            criterion::black_box(sim.statistics())
        });
    });
    group.finish();
}

criterion_group! {
    name = benches;
    config = Criterion::default().warm_up_time(Duration::from_secs(1)).with_profiler(pprof::criterion::PProfProfiler::new(100, Output::Flamegraph(None)));
    targets = qdisc_throughput, simulator_steps
}

// Runs the queueing discipline, impairment engine and simulator benchmarks.
criterion_main!(benches);
