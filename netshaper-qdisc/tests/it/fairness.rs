use netshaper_common::{ClassId, Packet};
use netshaper_qdisc::{DisciplineKind, QdiscOptions, QueueDiscipline, TrafficClass};
use rand::{rngs::StdRng, Rng, SeedableRng};

fn discipline(kind: DisciplineKind, classes: Vec<TrafficClass>) -> QueueDiscipline {
    let qdisc = QueueDiscipline::new(
        kind,
        QdiscOptions::default().limit(100_000).per_class_limit(10_000),
    );
    qdisc.initialize(classes).unwrap();
    qdisc
}

/// Enqueues `count` packets of `size` bytes per class, class after class, with increasing
/// arrival sequence numbers.
fn fill(qdisc: &QueueDiscipline, plan: &[(ClassId, usize, usize)]) {
    let mut seq = 0;
    for (class_id, count, size) in plan {
        for _ in 0..*count {
            qdisc.enqueue(Packet::new(*size, *class_id).with_sequence(seq), *class_id).unwrap();
            seq += 1;
        }
    }
}

#[test]
fn wfq_share_follows_weights() {
    let _ = tracing_subscriber::fmt::try_init();

    let qdisc = discipline(
        DisciplineKind::Wfq,
        vec![TrafficClass::new(1).weight(1.0), TrafficClass::new(2).weight(2.0)],
    );
    fill(&qdisc, &[(1, 3000, 1), (2, 3000, 1)]);

    let mut served = [0i64; 3];
    for _ in 0..1500 {
        let pkt = qdisc.dequeue().unwrap().unwrap();
        served[pkt.class_id() as usize] += 1;
        assert!((served[2] - 2 * served[1]).abs() <= 2, "share drifted: {served:?}");
    }

    assert_eq!(served[1], 500);
    assert_eq!(served[2], 1000);
}

#[test]
fn three_classes_end_to_end() {
    let _ = tracing_subscriber::fmt::try_init();

    let cases = [
        (
            DisciplineKind::Wfq,
            vec![
                TrafficClass::new(1).weight(1.0),
                TrafficClass::new(2).weight(1.0),
                TrafficClass::new(3).weight(2.0),
            ],
            1,
        ),
        (
            DisciplineKind::Drr,
            vec![
                TrafficClass::new(1).quantum(1500),
                TrafficClass::new(2).quantum(1500),
                TrafficClass::new(3).quantum(3000),
            ],
            1500,
        ),
    ];

    for (kind, classes, size) in cases {
        let qdisc = discipline(kind, classes);
        fill(&qdisc, &[(1, 10, size), (2, 10, size), (3, 20, size)]);
        assert_eq!(qdisc.queue_size(), 40);

        let mut served = [0usize; 4];
        for n in 1..=40 {
            let pkt = qdisc.dequeue().unwrap().unwrap();
            served[pkt.class_id() as usize] += 1;

            if n % 4 == 0 {
                let k = n / 4;
                assert_eq!(served[1..], [k, k, 2 * k], "{kind}: after {n} dequeues");
            }
        }

        assert!(qdisc.is_empty());
        assert_eq!(qdisc.dequeue(), Ok(None));

        let stats = qdisc.get_statistics();
        assert_eq!(stats.packets_dequeued, 40);
        assert_eq!(stats.classes[&3].packets_dequeued, 20);
    }
}

#[test]
fn drr_unfairness_is_bounded() {
    const QUANTUM_A: u32 = 500;
    const QUANTUM_B: u32 = 1000;
    const MAX_PACKET: usize = 1500;

    let _ = tracing_subscriber::fmt::try_init();

    let qdisc = discipline(
        DisciplineKind::Drr,
        vec![TrafficClass::new(1).quantum(QUANTUM_A), TrafficClass::new(2).quantum(QUANTUM_B)],
    );

    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..2000 {
        for class_id in [1, 2] {
            let size = rng.gen_range(64..=MAX_PACKET);
            qdisc.enqueue(Packet::new(size, class_id), class_id).unwrap();
        }
    }

    let ratio = f64::from(QUANTUM_A) / f64::from(QUANTUM_B);
    let bound = (MAX_PACKET + QUANTUM_A as usize) as f64;
    let mut bytes = [0usize; 3];

    while qdisc.class_queue_size(1).unwrap() > 0 && qdisc.class_queue_size(2).unwrap() > 0 {
        let pkt = qdisc.dequeue().unwrap().unwrap();
        bytes[pkt.class_id() as usize] += pkt.size();

        let diff = bytes[1] as f64 - ratio * bytes[2] as f64;
        assert!(diff.abs() <= bound, "unfairness {diff} exceeds {bound}: {bytes:?}");
    }
}

#[test]
fn drr_serves_packets_larger_than_every_quantum() {
    let qdisc = discipline(
        DisciplineKind::Drr,
        vec![TrafficClass::new(1).quantum(100), TrafficClass::new(2).quantum(100)],
    );

    qdisc.enqueue(Packet::new(9000, 1), 1).unwrap();
    qdisc.enqueue(Packet::new(50, 2), 2).unwrap();

    let sizes: Vec<_> =
        std::iter::from_fn(|| qdisc.dequeue().unwrap()).map(|pkt| pkt.size()).collect();
    assert_eq!(sizes, vec![50, 9000]);
}

#[test]
fn scheduling_is_deterministic_and_work_conserving() {
    for kind in [DisciplineKind::Wfq, DisciplineKind::Drr] {
        let run = || {
            let qdisc = discipline(
                kind,
                vec![
                    TrafficClass::new(1).weight(1.0).quantum(500),
                    TrafficClass::new(2).weight(3.0).quantum(1500),
                    TrafficClass::new(3).weight(0.5).quantum(250),
                ],
            );

            let mut rng = StdRng::seed_from_u64(42);
            let mut order = Vec::new();
            for seq in 0..5000u64 {
                if rng.gen_bool(0.6) {
                    let class_id = rng.gen_range(1..=3);
                    let pkt = Packet::new(rng.gen_range(40..=1500), class_id).with_sequence(seq);
                    qdisc.enqueue(pkt, class_id).unwrap();
                } else {
                    let had_packets = !qdisc.is_empty();
                    let pkt = qdisc.dequeue().unwrap();
                    assert_eq!(pkt.is_some(), had_packets, "{kind} is not work-conserving");
                    order.extend(pkt.map(|p| p.arrival_sequence()));
                }
            }
            order
        };

        assert_eq!(run(), run());
    }
}
