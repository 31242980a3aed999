use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};

use netshaper_common::Packet;
use netshaper_qdisc::{QdiscOptions, QueueDiscipline, TokenBucket, TokenBucketConfig, TrafficClass};

const PRODUCERS: u32 = 4;
const PER_PRODUCER: usize = 2_000;

#[test]
fn concurrent_producers_and_consumer() {
    let _ = tracing_subscriber::fmt::try_init();

    let qdisc = Arc::new(QueueDiscipline::drr(
        QdiscOptions::default().limit(usize::MAX).per_class_limit(usize::MAX),
    ));
    qdisc.initialize((0..PRODUCERS).map(TrafficClass::new)).unwrap();

    let done = AtomicBool::new(false);
    let total = PRODUCERS as usize * PER_PRODUCER;

    thread::scope(|s| {
        for class_id in 0..PRODUCERS {
            let qdisc = Arc::clone(&qdisc);
            s.spawn(move || {
                for _ in 0..PER_PRODUCER {
                    qdisc.enqueue(Packet::new(100, class_id), class_id).unwrap();
                }
            });
        }

        // Snapshots taken mid-flight must always balance.
        s.spawn(|| {
            while !done.load(Ordering::Relaxed) {
                let stats = qdisc.get_statistics();
                assert_eq!(
                    stats.packets_queued - stats.packets_dequeued,
                    stats.queue_len as u64,
                    "torn statistics snapshot"
                );
            }
        });

        let mut received = 0;
        while received < total {
            if qdisc.dequeue().unwrap().is_some() {
                received += 1;
            } else {
                thread::yield_now();
            }
        }
        done.store(true, Ordering::Relaxed);
    });

    let stats = qdisc.get_statistics();
    assert_eq!(stats.packets_queued, total as u64);
    assert_eq!(stats.packets_dequeued, total as u64);
    assert!(qdisc.is_empty());
}

#[test]
fn token_bucket_never_overspends() {
    let bucket = Arc::new(
        TokenBucket::new(TokenBucketConfig::default().capacity(10_000).rate(1)).unwrap(),
    );

    let admitted: usize = thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let bucket = Arc::clone(&bucket);
                s.spawn(move || (0..100).filter(|_| bucket.consume(100).is_ok()).count())
            })
            .collect();

        handles.into_iter().map(|h| h.join().unwrap()).sum()
    });

    // At a rate of one token per second, the test cannot earn another 100-token packet.
    assert_eq!(admitted, 100);
    assert_eq!(bucket.stats().tokens_consumed(), 10_000);
    assert_eq!(bucket.stats().rejected(), 700);
}
