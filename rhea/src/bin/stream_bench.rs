//! Byte stream throughput and latency benchmark.
//!
//! Usage:
//!     cargo run --release --bin stream_bench
//!
//! Environment variables:
//!     WRITER_CPU=0  Pin writer to CPU 0 (default: 0)
//!     READER_CPU=2  Pin reader to CPU 2 (default: 2)

use std::env;
use std::hint;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use minstant::Instant;

use rhea::ipc::stream::{Reader, Writer};

const REGION_SIZE: usize = 1 << 24;
const ITERATIONS: usize = 1 << 24;

type Payload = u32;

fn get_cpu_affinity() -> (Option<usize>, Option<usize>) {
    let writer_cpu = env::var("WRITER_CPU")
        .ok()
        .and_then(|s| s.parse().ok())
        .or(Some(0));
    let reader_cpu = env::var("READER_CPU")
        .ok()
        .and_then(|s| s.parse().ok())
        .or(Some(2));
    (writer_cpu, reader_cpu)
}

fn pin_to_cpu(cpu: Option<usize>) {
    if let Some(id) = cpu {
        core_affinity::set_for_current(core_affinity::CoreId { id });
    }
}

fn unique_path(tag: &str) -> String {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    format!(
        "/{}-{}-{}",
        tag,
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

fn bench_throughput(writer_cpu: Option<usize>, reader_cpu: Option<usize>) {
    let path = unique_path("rhea-throughput");
    let mut tx = Writer::<REGION_SIZE, _>::create(&path).unwrap();

    let ready = Arc::new(AtomicBool::new(false));
    let ready_clone = ready.clone();
    let path_clone = path.clone();

    // Reader thread
    let reader_thread = std::thread::spawn(move || {
        let mut rx = Reader::<REGION_SIZE, _>::open(&path_clone).unwrap();
        pin_to_cpu(reader_cpu);

        // Signal ready
        ready_clone.store(true, Ordering::Release);

        for expected in 0..ITERATIONS as Payload {
            let value: Payload = rx.read();
            rx.commit();
            if value != expected {
                panic!("Data corruption: expected {expected}, got {value}");
            }
        }
    });

    // Wait for the reader to be ready
    while !ready.load(Ordering::Acquire) {
        hint::spin_loop();
    }

    pin_to_cpu(writer_cpu);

    let start = Instant::now();

    for i in 0..ITERATIONS as Payload {
        tx.write(i);
        tx.commit();
    }

    reader_thread.join().unwrap();
    let elapsed = start.elapsed();

    let records_per_ms = ITERATIONS as u128 * 1_000_000 / elapsed.as_nanos();
    println!("{records_per_ms} records/ms");
}

fn bench_rtt(writer_cpu: Option<usize>, reader_cpu: Option<usize>) {
    let q1_path = unique_path("rhea-q1");
    let q2_path = unique_path("rhea-q2");

    let mut q1_tx = Writer::<REGION_SIZE, _>::create(&q1_path).unwrap();

    let ready = Arc::new(AtomicBool::new(false));
    let ready_clone = ready.clone();
    let q1_path_clone = q1_path.clone();
    let q2_path_clone = q2_path.clone();

    // Responder thread
    let responder = std::thread::spawn(move || {
        let mut q1_rx = Reader::<REGION_SIZE, _>::open(&q1_path_clone).unwrap();
        let mut q2_tx = Writer::<REGION_SIZE, _>::create(&q2_path_clone).unwrap();
        pin_to_cpu(reader_cpu);

        // Signal ready
        ready_clone.store(true, Ordering::Release);

        for _ in 0..ITERATIONS {
            let value: Payload = q1_rx.read();
            q1_rx.commit();
            q2_tx.write(value);
            q2_tx.commit();
        }
    });

    // Wait for the responder to be ready
    while !ready.load(Ordering::Acquire) {
        hint::spin_loop();
    }

    // Open q2 after the responder created it
    let mut q2_rx = Reader::<REGION_SIZE, _>::open(&q2_path).unwrap();

    pin_to_cpu(writer_cpu);

    let start = Instant::now();

    for i in 0..ITERATIONS as Payload {
        q1_tx.write(i);
        q1_tx.commit();
        let _: Payload = q2_rx.read();
        q2_rx.commit();
    }

    let elapsed = start.elapsed();
    responder.join().unwrap();

    let rtt_ns = elapsed.as_nanos() / ITERATIONS as u128;
    println!("{rtt_ns} ns RTT");
}

fn main() {
    rhea::init_tracing();
    let (writer_cpu, reader_cpu) = get_cpu_affinity();

    println!("rhea byte stream (region={REGION_SIZE}, iters={ITERATIONS}):");
    bench_throughput(writer_cpu, reader_cpu);
    bench_rtt(writer_cpu, reader_cpu);
}
