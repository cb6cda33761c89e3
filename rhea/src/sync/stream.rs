//! Lock-free SPSC byte stream for in-process (inter-thread) use.
//!
//! The region lives on the heap; writer and reader handles share it through
//! an `Arc`. See [`crate::ipc::stream`] for the cross-process variant over
//! shared memory.
//!
//! # Overview
//!
//! - [`Writer`] - reserve/commit end (single writer per stream)
//! - [`Reader`] - consume/release end (single reader per stream)
//! - Lock-free: the only waiting is a spin when the peer is behind
//!
//! # Example
//!
//! ```
//! let (mut tx, mut rx) = rhea::sync::stream::channel(1024).unwrap();
//!
//! // Writer thread
//! tx.write(42u64);
//! tx.write_slice(&[1u16, 2, 3]);
//! tx.commit();
//!
//! // Reader thread
//! assert_eq!(rx.read::<u64>(), 42);
//! assert_eq!(rx.read_slice::<u16>(3), &[1, 2, 3]);
//! rx.commit();
//! ```
//!
//! # Batching
//!
//! Reservations accumulate: several `write`/`prepare` calls may share one
//! [`Writer::commit`], which publishes them all at once. The reader mirrors
//! this with [`Reader::commit`], which hands all consumed space back to the
//! writer in one release.

use std::alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error};
use std::cell::Cell;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::SharedMemorySafe;
use crate::cacheline::CACHE_LINE_SIZE;
use crate::ring::{RingBuffer, RingError};

/// Heap-allocated byte region plus the stream state.
struct HeapStream {
    ring: RingBuffer,
    region: NonNull<u8>,
    layout: Layout,
}

impl HeapStream {
    fn new(size: usize) -> Result<Arc<Self>, RingError> {
        if !size.is_power_of_two() {
            return Err(RingError::SizeNotPowerOfTwo);
        }
        // Power-of-two size and power-of-two alignment cannot overflow the
        // layout computation.
        let layout = Layout::from_size_align(size, CACHE_LINE_SIZE)
            .expect("power-of-two region layout");
        // SAFETY: layout has nonzero size (size is a power of two).
        let ptr = unsafe { alloc_zeroed(layout) };
        let Some(region) = NonNull::new(ptr) else {
            handle_alloc_error(layout);
        };

        let stream = Arc::new(Self {
            ring: RingBuffer::new(),
            region,
            layout,
        });
        // SAFETY: the stream was just created; no handle exists yet, so both
        // sides are quiescent. The region outlives the ring (same Arc).
        unsafe { stream.ring.initialize(region.as_ptr(), size)? };
        Ok(stream)
    }
}

// SAFETY: all access to the region and the cursor blocks is mediated by the
// SPSC protocol in `RingBuffer`; the raw pointer only aliases memory owned by
// this allocation.
unsafe impl Send for HeapStream {}
unsafe impl Sync for HeapStream {}

impl Drop for HeapStream {
    fn drop(&mut self) {
        // SAFETY: allocated in new() with the stored layout.
        unsafe { dealloc(self.region.as_ptr(), self.layout) };
    }
}

/// Marker type to opt-out of `Sync` while remaining `Send`.
type PhantomUnsync = PhantomData<Cell<&'static ()>>;

/// Write end of the stream.
///
/// # Thread Safety
///
/// `Writer` is [`Send`] but **not** [`Sync`] and not `Clone`: it can move to
/// another thread, but `&Writer` cannot be shared, which enforces the
/// single-writer contract at compile time.
pub struct Writer {
    stream: Arc<HeapStream>,
    _unsync: PhantomUnsync,
}

/// Read end of the stream.
///
/// Single-reader contract enforced the same way as [`Writer`]'s.
pub struct Reader {
    stream: Arc<HeapStream>,
    _unsync: PhantomUnsync,
}

/// Creates an in-process byte stream over a fresh `size`-byte region.
///
/// # Errors
///
/// Returns an error if `size` is not a power of two, or if the platform
/// reports a cache line size different from the one this crate was compiled
/// for.
pub fn channel(size: usize) -> Result<(Writer, Reader), RingError> {
    let stream = HeapStream::new(size)?;
    let writer = Writer {
        stream: Arc::clone(&stream),
        _unsync: PhantomData,
    };
    let reader = Reader {
        stream,
        _unsync: PhantomData,
    };
    Ok((writer, reader))
}

impl Writer {
    /// Reserves `len` bytes aligned to `align`, spinning while the stream is
    /// full. The slice stays writable until the next reservation; nothing is
    /// visible to the reader before [`commit`](Self::commit).
    ///
    /// # Panics
    ///
    /// Debug builds panic if `len` exceeds the region size or `align` is not
    /// a power of two.
    #[inline]
    pub fn prepare(&mut self, len: usize, align: usize) -> &mut [u8] {
        // SAFETY: this handle is the unique writer (not Clone, not Sync).
        unsafe {
            let ptr = self.stream.ring.prepare_write(len, align);
            std::slice::from_raw_parts_mut(ptr, len)
        }
    }

    /// Publishes everything reserved since the previous commit.
    #[inline]
    pub fn commit(&mut self) {
        // SAFETY: unique writer.
        unsafe { self.stream.ring.finish_write() };
    }

    /// Reserves space for one value and moves it into the stream.
    #[inline]
    pub fn write<T: SharedMemorySafe + Copy>(&mut self, value: T) {
        // SAFETY: unique writer; T is plain old data no larger than any
        // region this constructor accepts a write of (checked in debug).
        unsafe { self.stream.ring.write(value) };
    }

    /// Reserves space for a slice of values and copies them in.
    #[inline]
    pub fn write_slice<T: SharedMemorySafe + Copy>(&mut self, values: &[T]) {
        // SAFETY: unique writer.
        unsafe { self.stream.ring.write_slice(values) };
    }
}

impl Reader {
    /// Reserves the next `len` published bytes, spinning while the writer is
    /// behind. `len` and `align` should match the writer's reservation.
    #[inline]
    pub fn prepare(&mut self, len: usize, align: usize) -> &[u8] {
        // SAFETY: this handle is the unique reader (not Clone, not Sync).
        unsafe {
            let ptr = self.stream.ring.prepare_read(len, align);
            std::slice::from_raw_parts(ptr, len)
        }
    }

    /// Hands everything consumed since the previous commit back to the
    /// writer.
    #[inline]
    pub fn commit(&mut self) {
        // SAFETY: unique reader.
        unsafe { self.stream.ring.finish_read() };
    }

    /// Reads the next value, by copy. Must pair with a
    /// [`Writer::write`] of the same type.
    #[inline]
    #[must_use]
    pub fn read<T: SharedMemorySafe + Copy>(&mut self) -> T {
        // SAFETY: unique reader; the pairing contract puts a T here.
        unsafe { self.stream.ring.read() }
    }

    /// Bytes currently published but not yet released, any skipped epoch
    /// tails included. Never exceeds the region size.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.stream.ring.in_flight()
    }

    /// Reads the next `count` values in place. Must pair with a
    /// [`Writer::write_slice`] of the same type and length. The slice is
    /// invalidated by the next read or reservation.
    #[inline]
    #[must_use]
    pub fn read_slice<T: SharedMemorySafe + Copy>(&mut self, count: usize) -> &[T] {
        // SAFETY: unique reader; the pairing contract puts `count` T's here,
        // naturally aligned because the writer reserved with align_of::<T>().
        unsafe {
            let ptr = self.stream.ring.read_ptr::<T>(count);
            std::slice::from_raw_parts(ptr, count)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_power_of_two_size() {
        assert!(matches!(channel(1000), Err(RingError::SizeNotPowerOfTwo)));
        assert!(matches!(channel(0), Err(RingError::SizeNotPowerOfTwo)));
    }

    #[test]
    fn byte_roundtrip() {
        let (mut tx, mut rx) = channel(64).unwrap();

        tx.prepare(5, 1).copy_from_slice(b"hello");
        tx.commit();

        assert_eq!(rx.prepare(5, 1), b"hello");
        rx.commit();
    }

    #[test]
    fn typed_roundtrip_mixed_alignments() {
        let (mut tx, mut rx) = channel(256).unwrap();

        tx.write(1u8);
        tx.write(0xABCDu16);
        tx.write(0x1234_5678u32);
        tx.write(std::f64::consts::PI);
        tx.commit();

        assert_eq!(rx.read::<u8>(), 1);
        assert_eq!(rx.read::<u16>(), 0xABCD);
        assert_eq!(rx.read::<u32>(), 0x1234_5678);
        assert_eq!(rx.read::<f64>(), std::f64::consts::PI);
        rx.commit();
    }

    #[test]
    fn slice_roundtrip() {
        let (mut tx, mut rx) = channel(128).unwrap();

        let values: Vec<u32> = (0..16).collect();
        tx.write_slice(&values);
        tx.commit();

        assert_eq!(rx.read_slice::<u32>(16), &values[..]);
        rx.commit();
    }

    #[test]
    fn several_commits_wrap_the_region() {
        let (mut tx, mut rx) = channel(16).unwrap();

        for round in 0u8..20 {
            let payload = [round; 10];
            tx.prepare(10, 1).copy_from_slice(&payload);
            tx.commit();

            assert_eq!(rx.prepare(10, 1), &payload[..]);
            rx.commit();
        }
    }

    #[test]
    fn batched_records_publish_together() {
        let (mut tx, mut rx) = channel(64).unwrap();

        tx.write(10u32);
        tx.write(20u32);
        tx.write(30u32);
        tx.commit();

        assert_eq!(rx.read::<u32>(), 10);
        assert_eq!(rx.read::<u32>(), 20);
        assert_eq!(rx.read::<u32>(), 30);
        rx.commit();
    }

    #[test]
    fn fifo_across_threads() {
        let (mut tx, mut rx) = channel(1 << 12).unwrap();
        let count = 100_000u64;

        let producer = std::thread::spawn(move || {
            for i in 0..count {
                tx.write(i);
                tx.commit();
            }
        });

        let consumer = std::thread::spawn(move || {
            for expected in 0..count {
                let got: u64 = rx.read();
                assert_eq!(got, expected);
                rx.commit();
            }
        });

        producer.join().unwrap();
        consumer.join().unwrap();
    }

    #[test]
    fn large_records_across_threads() {
        let (mut tx, mut rx) = channel(1 << 10).unwrap();
        let count = 10_000u32;

        let producer = std::thread::spawn(move || {
            for i in 0..count {
                let payload = [i; 64];
                tx.write_slice(&payload);
                tx.commit();
            }
        });

        let consumer = std::thread::spawn(move || {
            for i in 0..count {
                assert_eq!(rx.read_slice::<u32>(64), &[i; 64]);
                rx.commit();
            }
        });

        producer.join().unwrap();
        consumer.join().unwrap();
    }
}
