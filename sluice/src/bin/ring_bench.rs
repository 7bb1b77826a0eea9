//! Ring buffer benchmarks over the shared-memory SPSC queue.
//!
//! Two measurements:
//!
//! - sustained throughput of a producer/consumer pair on separate cores,
//!   verified by a running checksum on the consumer side
//! - round-trip latency percentiles over a ping-pong pair of queues, one
//!   message outstanding at a time
//!
//! Usage:
//!     cargo run --release --bin ring_bench [iterations]
//!
//! Environment variables:
//!     PRODUCER_CPU=0  Pin the producing thread (default: 0)
//!     CONSUMER_CPU=2  Pin the consuming/responding thread (default: 2)

use std::sync::Barrier;
use std::time::Instant;

use sluice::ipc::spsc::{Consumer, Producer};

const CAPACITY: usize = 1 << 16;
const DEFAULT_ITERS: usize = 1 << 22;

type Payload = u64;

struct Config {
    iters: usize,
    producer_cpu: Option<usize>,
    consumer_cpu: Option<usize>,
}

impl Config {
    fn from_env() -> Self {
        fn cpu(var: &str, default: usize) -> Option<usize> {
            std::env::var(var)
                .ok()
                .and_then(|s| s.parse().ok())
                .or(Some(default))
        }

        Self {
            iters: std::env::args()
                .nth(1)
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_ITERS),
            producer_cpu: cpu("PRODUCER_CPU", 0),
            consumer_cpu: cpu("CONSUMER_CPU", 2),
        }
    }
}

fn pin(cpu: Option<usize>) {
    if let Some(id) = cpu {
        core_affinity::set_for_current(core_affinity::CoreId { id });
    }
}

fn throughput(cfg: &Config) {
    let name = format!("/sluice-bench-{}-tp", std::process::id());
    let producer = Producer::<Payload, CAPACITY, _>::create(&name).unwrap();
    let start_line = Barrier::new(2);

    let elapsed = std::thread::scope(|scope| {
        let drained = scope.spawn(|| {
            let consumer = Consumer::<Payload, CAPACITY, _>::open(&name).unwrap();
            pin(cfg.consumer_cpu);
            start_line.wait();

            let mut checksum = 0u64;
            let mut received = 0usize;
            while received < cfg.iters {
                if let Some(v) = consumer.pop() {
                    checksum = checksum.wrapping_add(v);
                    received += 1;
                } else {
                    std::hint::spin_loop();
                }
            }
            checksum
        });

        pin(cfg.producer_cpu);
        start_line.wait();
        let start = Instant::now();

        for i in 0..cfg.iters as Payload {
            while producer.push(i).is_err() {
                std::hint::spin_loop();
            }
        }

        let checksum = drained.join().unwrap();
        let elapsed = start.elapsed();

        let n = cfg.iters as u64;
        assert_eq!(checksum, n * (n - 1) / 2, "consumer checksum mismatch");
        elapsed
    });

    let rate = cfg.iters as f64 / elapsed.as_secs_f64();
    println!(
        "throughput: {:.1} Mops/s ({} items in {:.3?})",
        rate / 1e6,
        cfg.iters,
        elapsed
    );
}

fn latency(cfg: &Config) {
    let ping_name = format!("/sluice-bench-{}-ping", std::process::id());
    let pong_name = format!("/sluice-bench-{}-pong", std::process::id());

    // The measuring thread owns both segments; the responder attaches.
    let ping_tx = Producer::<Payload, CAPACITY, _>::create(&ping_name).unwrap();
    let pong_rx = Consumer::<Payload, CAPACITY, _>::create(&pong_name).unwrap();

    let samples = cfg.iters.min(1 << 20);
    let start_line = Barrier::new(2);

    let mut round_trips = std::thread::scope(|scope| {
        scope.spawn(|| {
            let ping_rx = Consumer::<Payload, CAPACITY, _>::open(&ping_name).unwrap();
            let pong_tx = Producer::<Payload, CAPACITY, _>::open(&pong_name).unwrap();
            pin(cfg.consumer_cpu);
            start_line.wait();

            for _ in 0..samples {
                loop {
                    if let Some(v) = ping_rx.pop() {
                        pong_tx.push(v).unwrap();
                        break;
                    }
                    std::hint::spin_loop();
                }
            }
        });

        pin(cfg.producer_cpu);
        start_line.wait();

        let mut round_trips = Vec::with_capacity(samples);
        for i in 0..samples as Payload {
            let sent = Instant::now();
            ping_tx.push(i).unwrap();
            loop {
                if let Some(v) = pong_rx.pop() {
                    assert_eq!(v, i, "ping-pong echoed the wrong value");
                    break;
                }
                std::hint::spin_loop();
            }
            round_trips.push(sent.elapsed());
        }
        round_trips
    });

    round_trips.sort_unstable();
    let quantile = |q: f64| round_trips[((round_trips.len() - 1) as f64 * q) as usize];
    println!(
        "round trip ({samples} samples): p50 {:?}  p99 {:?}  p99.9 {:?}  max {:?}",
        quantile(0.50),
        quantile(0.99),
        quantile(0.999),
        round_trips[round_trips.len() - 1],
    );
}

fn main() {
    sluice::init_tracing();

    let cfg = Config::from_env();
    println!(
        "sluice SPSC over shared memory (capacity {}, {} iterations)",
        CAPACITY, cfg.iters
    );
    throughput(&cfg);
    latency(&cfg);
}
