//! Cross-process SPSC byte stream over POSIX shared memory.
//!
//! One process writes records into the stream, another reads them, with no
//! lock and no syscall in the hot path. The region size `N` is a compile-time
//! constant and, together with the cache-line constant, part of the ABI: both
//! processes must be built with the same values.
//!
//! # Creator vs Opener
//!
//! Either end can create the stream; the peer opens it. The creator unlinks
//! the shared memory name on drop, the opener does not (see
//! [`crate::ipc::shmem`]).
//!
//! ```no_run
//! use rhea::ipc::stream::{Reader, Writer};
//!
//! // Process A
//! let mut tx = Writer::<4096, _>::create("/my-stream")?;
//! tx.write(42u64);
//! tx.commit();
//!
//! // Process B
//! let mut rx = Reader::<4096, _>::open("/my-stream")?;
//! assert_eq!(rx.read::<u64>(), 42);
//! rx.commit();
//! # Ok::<(), rhea::ipc::stream::StreamError>(())
//! ```
//!
//! # Memory layout
//!
//! ```text
//! Stream in shared memory (/dev/shm):
//! ┌────────────────────────────────────────┐
//! │ Init marker (1 cache line)             │
//! │  - magic: AtomicU64                    │
//! ├────────────────────────────────────────┤
//! │ Writer view (1 cache line)             │
//! │  - pos, end, base, size + mapped addr  │
//! ├────────────────────────────────────────┤
//! │ Reader view (1 cache line)             │
//! ├────────────────────────────────────────┤
//! │ Writer counter (1 cache line)          │
//! ├────────────────────────────────────────┤
//! │ Reader counter (1 cache line)          │
//! ├────────────────────────────────────────┤
//! │ Byte region: [u8; N]                   │
//! │  - starts cache-line aligned           │
//! └────────────────────────────────────────┘
//! ```
//!
//! The two processes map the same physical pages at different virtual
//! addresses, so each handle reinstalls its own side's view of the region
//! after mapping (the view stores the address, not a pointer).

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;

use super::shmem::{Creator, Opener, Shm, ShmError, ShmMode};
use crate::SharedMemorySafe;
use crate::cacheline::CacheAligned;
use crate::ring::{RegionCell, RingBuffer, RingError};
use crate::trace;

const INIT_MAGIC: u64 = 0x5248_4541_4259_5445; // "RHEABYTE" in ASCII
const INIT_TIMEOUT: Duration = Duration::from_secs(1);

/// Errors creating or opening a shared stream.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Shared memory creation, opening, or mapping failed.
    #[error("shared memory error: {0}")]
    Shm(#[from] ShmError),
    /// The environment checks at stream initialization failed.
    #[error("stream initialization error: {0}")]
    Ring(#[from] RingError),
    /// The creator did not finish initializing within the timeout.
    #[error("timed out waiting for `{path}` to finish initialization")]
    InitTimeout { path: String },
}

/// Shared memory image of a byte stream.
#[derive(SharedMemorySafe)]
#[repr(C)]
struct SharedStream<const N: usize> {
    /// Magic word, published with Release once the creator finished
    /// initializing everything below.
    init: CacheAligned<AtomicU64>,
    /// The four protocol blocks.
    ring: RingBuffer,
    /// The byte region. Starts cache-line aligned because every preceding
    /// block occupies whole lines.
    region: RegionCell<[u8; N]>,
}

struct SizeCheck<const N: usize>;

impl<const N: usize> SizeCheck<N> {
    /// Compile-time assertion that the region size is a power of two.
    const OK: () = assert!(N.is_power_of_two(), "region size must be a power of two");
}

impl<const N: usize> SharedStream<N> {
    fn region_ptr(&self) -> *mut u8 {
        self.region.get().get().cast::<u8>()
    }

    /// Initializes the stream state inside freshly created shared memory.
    ///
    /// The byte region is left as mapped; the kernel zero-fills new pages.
    ///
    /// # Safety
    ///
    /// `ptr` must be non-null, aligned for `Self`, writable for
    /// `size_of::<Self>()` bytes, and exclusively owned for the duration of
    /// the call.
    unsafe fn init_shared(ptr: *mut Self) {
        // SAFETY: caller guarantees validity and exclusivity; addr_of_mut!
        // writes the fields without materializing references to
        // uninitialized memory.
        unsafe {
            std::ptr::addr_of_mut!((*ptr).init).write(CacheAligned::new(AtomicU64::new(0)));
            std::ptr::addr_of_mut!((*ptr).ring).write(RingBuffer::new());
        }
    }

    /// Spins until the creator publishes the init marker or `timeout`
    /// expires.
    ///
    /// The Acquire load synchronizes with the creator's Release store, so a
    /// `true` return means every initialization write is visible.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a live mapping of `Self` for the duration of the
    /// call.
    unsafe fn wait_for_init(ptr: *const Self, timeout: Duration) -> bool {
        let start = std::time::Instant::now();
        loop {
            // SAFETY: reading an AtomicU64 in mapped memory is sound for any
            // bit pattern, initialized or not.
            if unsafe { (*ptr).init.load(Ordering::Acquire) } == INIT_MAGIC {
                return true;
            }
            if start.elapsed() >= timeout {
                return false;
            }
            std::hint::spin_loop();
        }
    }
}

/// Marker type to opt-out of `Sync` while remaining `Send`.
type PhantomUnsync = PhantomData<Cell<&'static ()>>;

/// Write end of a shared stream.
///
/// # Thread Safety
///
/// `Writer` is [`Send`] but **not** [`Sync`] and not `Clone`, enforcing the
/// single-writer contract in-process. The type system cannot stop another
/// *process* from opening a second writer on the same path; users must
/// ensure one writer exists across all processes.
pub struct Writer<const N: usize, Mode: ShmMode> {
    shm: Shm<SharedStream<N>, Mode>,
    _unsync: PhantomUnsync,
}

/// Read end of a shared stream. Same single-reader contract as [`Writer`]'s.
pub struct Reader<const N: usize, Mode: ShmMode> {
    shm: Shm<SharedStream<N>, Mode>,
    _unsync: PhantomUnsync,
}

fn create_stream<const N: usize>(path: &str) -> Result<Shm<SharedStream<N>, Creator>, StreamError> {
    let () = SizeCheck::<N>::OK;
    let shm = Shm::<SharedStream<N>, Creator>::create(path, |ptr| {
        // SAFETY: create() hands exclusive access to the fresh mapping.
        unsafe { SharedStream::<N>::init_shared(ptr) };
    })?;
    // SAFETY: the init marker is still unset, so no peer touches the state
    // yet; this process owns both sides until the magic is published.
    unsafe { shm.ring.initialize(shm.region_ptr(), N)? };
    shm.init.store(INIT_MAGIC, Ordering::Release);
    trace::debug!("created shared stream at {path}");
    Ok(shm)
}

fn open_stream<const N: usize>(path: &str) -> Result<Shm<SharedStream<N>, Opener>, StreamError> {
    let () = SizeCheck::<N>::OK;
    let shm = Shm::<SharedStream<N>, Opener>::open(path)?;
    // SAFETY: Shm::open guarantees a live mapping of exactly this type.
    if !unsafe { SharedStream::wait_for_init(&raw const *shm, INIT_TIMEOUT) } {
        return Err(StreamError::InitTimeout {
            path: path.to_string(),
        });
    }
    trace::debug!("opened shared stream at {path}");
    Ok(shm)
}

impl<const N: usize> Writer<N, Creator> {
    /// Creates a new stream and returns its write end.
    ///
    /// # Errors
    ///
    /// Fails if the shared memory cannot be created or the environment
    /// checks (cache line size) fail.
    pub fn create(path: &str) -> Result<Self, StreamError> {
        let shm = create_stream(path)?;
        Ok(Self {
            shm,
            _unsync: PhantomData,
        })
    }
}

impl<const N: usize> Writer<N, Opener> {
    /// Opens an existing stream and returns its write end.
    ///
    /// Waits up to one second for the creator to finish initializing, then
    /// installs this process's mapping as the writer's view of the region.
    ///
    /// # Errors
    ///
    /// Fails if the object does not exist, its size does not match, or the
    /// creator does not publish the init marker in time.
    pub fn open(path: &str) -> Result<Self, StreamError> {
        let shm = open_stream(path)?;
        // The region landed at a process-specific address here; install this
        // side's view before first use.
        // SAFETY: the writer side has no handle yet, so it is quiescent.
        unsafe { shm.ring.reattach_writer(shm.region_ptr()) };
        Ok(Self {
            shm,
            _unsync: PhantomData,
        })
    }
}

impl<const N: usize, Mode: ShmMode> Writer<N, Mode> {
    /// Reserves `len` bytes aligned to `align`, spinning while the stream is
    /// full. Nothing is visible to the reader before
    /// [`commit`](Self::commit).
    #[inline]
    pub fn prepare(&mut self, len: usize, align: usize) -> &mut [u8] {
        // SAFETY: this handle is the unique writer (not Clone, not Sync).
        unsafe {
            let ptr = self.shm.ring.prepare_write(len, align);
            std::slice::from_raw_parts_mut(ptr, len)
        }
    }

    /// Publishes everything reserved since the previous commit.
    #[inline]
    pub fn commit(&mut self) {
        // SAFETY: unique writer.
        unsafe { self.shm.ring.finish_write() };
    }

    /// Reserves space for one value and moves it into the stream.
    #[inline]
    pub fn write<T: SharedMemorySafe + Copy>(&mut self, value: T) {
        // SAFETY: unique writer.
        unsafe { self.shm.ring.write(value) };
    }

    /// Reserves space for a slice of values and copies them in.
    #[inline]
    pub fn write_slice<T: SharedMemorySafe + Copy>(&mut self, values: &[T]) {
        // SAFETY: unique writer.
        unsafe { self.shm.ring.write_slice(values) };
    }
}

impl<const N: usize> Reader<N, Creator> {
    /// Creates a new stream and returns its read end.
    ///
    /// Useful for daemons that own an inbox which peers open for writing.
    ///
    /// # Errors
    ///
    /// Same conditions as [`Writer::create`].
    pub fn create(path: &str) -> Result<Self, StreamError> {
        let shm = create_stream(path)?;
        Ok(Self {
            shm,
            _unsync: PhantomData,
        })
    }
}

impl<const N: usize> Reader<N, Opener> {
    /// Opens an existing stream and returns its read end.
    ///
    /// Waits for the creator's init marker, then installs this process's
    /// mapping as the reader's view of the region.
    ///
    /// # Errors
    ///
    /// Same conditions as [`Writer::open`].
    pub fn open(path: &str) -> Result<Self, StreamError> {
        let shm = open_stream(path)?;
        // SAFETY: the reader side has no handle yet, so it is quiescent.
        unsafe { shm.ring.reattach_reader(shm.region_ptr()) };
        Ok(Self {
            shm,
            _unsync: PhantomData,
        })
    }
}

impl<const N: usize, Mode: ShmMode> Reader<N, Mode> {
    /// Reserves the next `len` published bytes, spinning while the writer is
    /// behind. `len` and `align` should match the writer's reservation.
    #[inline]
    pub fn prepare(&mut self, len: usize, align: usize) -> &[u8] {
        // SAFETY: this handle is the unique reader (not Clone, not Sync).
        unsafe {
            let ptr = self.shm.ring.prepare_read(len, align);
            std::slice::from_raw_parts(ptr, len)
        }
    }

    /// Hands everything consumed since the previous commit back to the
    /// writer.
    #[inline]
    pub fn commit(&mut self) {
        // SAFETY: unique reader.
        unsafe { self.shm.ring.finish_read() };
    }

    /// Reads the next value, by copy. Must pair with a [`Writer::write`] of
    /// the same type.
    #[inline]
    #[must_use]
    pub fn read<T: SharedMemorySafe + Copy>(&mut self) -> T {
        // SAFETY: unique reader; the pairing contract puts a T here.
        unsafe { self.shm.ring.read() }
    }

    /// Reads the next `count` values in place. The slice is invalidated by
    /// the next read or reservation.
    #[inline]
    #[must_use]
    pub fn read_slice<T: SharedMemorySafe + Copy>(&mut self, count: usize) -> &[T] {
        // SAFETY: unique reader; the pairing contract puts `count` T's here.
        unsafe {
            let ptr = self.shm.ring.read_ptr::<T>(count);
            std::slice::from_raw_parts(ptr, count)
        }
    }
}
