//! Cross-thread stress tests for the byte stream protocol.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use rhea::sync::stream::channel;

#[test]
fn writer_blocks_until_reader_releases() {
    let (mut tx, mut rx) = channel(16).unwrap();

    // Fill the whole region.
    tx.prepare(16, 1).fill(0xAB);
    tx.commit();

    let started = Arc::new(AtomicBool::new(false));
    let reserved = Arc::new(AtomicBool::new(false));
    let started_clone = Arc::clone(&started);
    let reserved_clone = Arc::clone(&reserved);

    let writer = std::thread::spawn(move || {
        started_clone.store(true, Ordering::Release);
        // Spins: the region is full until the reader releases it.
        tx.prepare(16, 1).fill(0xCD);
        reserved_clone.store(true, Ordering::Release);
        tx.commit();
    });

    while !started.load(Ordering::Acquire) {
        std::hint::spin_loop();
    }
    std::thread::sleep(Duration::from_millis(100));
    assert!(
        !reserved.load(Ordering::Acquire),
        "writer advanced past a full region"
    );

    assert_eq!(rx.prepare(16, 1), &[0xAB; 16]);
    rx.commit();

    writer.join().unwrap();
    assert!(reserved.load(Ordering::Acquire));

    assert_eq!(rx.prepare(16, 1), &[0xCD; 16]);
    rx.commit();
}

#[test]
fn full_region_roundtrip() {
    let (mut tx, mut rx) = channel(256).unwrap();

    let payload: Vec<u8> = (0..=255).collect();
    tx.prepare(256, 1).copy_from_slice(&payload);
    tx.commit();

    assert_eq!(rx.prepare(256, 1), &payload[..]);
    rx.commit();
}

#[test]
fn interleaved_random_records() {
    const SIZE: usize = 1 << 16;
    const RECORDS: usize = 100_000;
    const SEED: u64 = 0x5EED_CAFE;
    const ALIGNS: [usize; 7] = [1, 2, 4, 8, 16, 32, 64];

    let (mut tx, mut rx) = channel(SIZE).unwrap();

    // Writer and reader draw record shapes from identically seeded RNGs, so
    // the reader knows each record's length and alignment without any
    // framing in the stream itself.
    let writer = std::thread::spawn(move || {
        let mut rng = StdRng::seed_from_u64(SEED);
        for i in 0..RECORDS {
            let len = rng.random_range(1..=1000);
            let align = ALIGNS[rng.random_range(0..ALIGNS.len())];

            let buf = tx.prepare(len, align);
            for (j, b) in buf.iter_mut().enumerate() {
                *b = (i + j) as u8;
            }
            tx.commit();
        }
    });

    let mut rng = StdRng::seed_from_u64(SEED);
    let mut max_in_flight = 0;
    for i in 0..RECORDS {
        let len = rng.random_range(1..=1000);
        let align = ALIGNS[rng.random_range(0..ALIGNS.len())];

        let got = rx.prepare(len, align);
        assert_eq!(got.len(), len);
        for (j, &b) in got.iter().enumerate() {
            assert_eq!(b, (i + j) as u8, "record {i} corrupted at byte {j}");
        }
        rx.commit();
        max_in_flight = max_in_flight.max(rx.in_flight());
    }

    writer.join().unwrap();
    assert!(
        max_in_flight <= SIZE,
        "in-flight bytes {max_in_flight} exceeded the region size"
    );
}

#[test]
fn alternating_records_of_every_alignment() {
    let (mut tx, mut rx) = channel(1 << 10).unwrap();

    let writer = std::thread::spawn(move || {
        for i in 0u64..10_000 {
            tx.write(i as u8);
            tx.write(i as u16);
            tx.write(i as u32);
            tx.write(i);
            tx.commit();
        }
    });

    for i in 0u64..10_000 {
        assert_eq!(rx.read::<u8>(), i as u8);
        assert_eq!(rx.read::<u16>(), i as u16);
        assert_eq!(rx.read::<u32>(), i as u32);
        assert_eq!(rx.read::<u64>(), i);
        rx.commit();
    }

    writer.join().unwrap();
}
