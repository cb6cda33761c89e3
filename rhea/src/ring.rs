//! Core byte-stream SPSC ring buffer protocol.
//!
//! This module contains the reservation/publication algorithm shared by both:
//! - [`crate::ipc::stream`] - cross-process streams over shared memory
//! - [`crate::sync::stream`] - in-process streams over heap memory
//!
//! # Protocol
//!
//! The writer and the reader each own a private cursor block and publish
//! progress through one shared atomic counter per side. The counters are
//! **running totals** across wrap-epochs, never reduced modulo the region
//! size: `writer - reader` is then exactly the number of bytes in flight and
//! `size - (writer - reader)` the free capacity, with no full-vs-empty
//! ambiguity and no extra flag. The counters may overflow; every comparison
//! of a difference is therefore done on the two's-complement reinterpretation
//! of that difference.
//!
//! A reservation that would run past the physical end of the region teleports
//! to offset zero and abandons the tail of the current epoch. Both sides
//! apply the same rule in their slow paths, so they agree on epoch boundaries
//! without any marker in the byte region itself.
//!
//! # Memory ordering
//!
//! Publishing a counter uses a Release store; observing the peer's counter
//! uses an Acquire load. That single synchronizes-with edge makes every store
//! into the byte region issued before a publish visible to the peer after its
//! next acquire. No other fences are involved.
//!
//! # Safety
//!
//! The hot-path operations are `unsafe` because they require the caller to
//! uphold the SPSC invariant: exactly one writer and one reader, with no
//! concurrent access to either role. The backends in [`crate::sync`] and
//! [`crate::ipc`] enforce this with `Send + !Sync` handles.

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::mem::{align_of, size_of, size_of_val};
use std::sync::atomic::{AtomicUsize, Ordering};

use thiserror::Error;

use crate::SharedMemorySafe;
use crate::cacheline::{CACHE_LINE_SIZE, CacheAligned, runtime_cache_line_size};

/// Role marker: fields with this role are owned exclusively by the writer.
pub struct WriterRole;

/// Role marker: fields with this role are owned exclusively by the reader.
pub struct ReaderRole;

/// Role marker: the byte region, partitioned dynamically by the two counters.
pub struct RegionRole;

/// Interior-mutable cell with a role marker for nominal type safety.
///
/// The `Role` parameter does not affect runtime behavior; it exists to make
/// the writer's block, the reader's block, and the byte region distinct types
/// so a mix-up is a compile error rather than a data race.
#[repr(transparent)]
pub struct RoleCell<T, Role>(UnsafeCell<T>, PhantomData<Role>);

impl<T, Role> RoleCell<T, Role> {
    pub const fn new(value: T) -> Self {
        Self(UnsafeCell::new(value), PhantomData)
    }

    pub const fn get(&self) -> &UnsafeCell<T> {
        &self.0
    }
}

// SAFETY: RoleCell is shared between the two sides, but the protocol
// guarantees each cell has a single accessor for any given role: the writer
// block is touched only by the writer, the reader block only by the reader,
// and bytes of the region are handed from writer to reader through the
// Release/Acquire counter publication.
unsafe impl<T: Send, Role> Sync for RoleCell<T, Role> {}
unsafe impl<T: Send, Role> Send for RoleCell<T, Role> {}

// SAFETY: repr(transparent) over UnsafeCell<T>; the phantom role does not
// change the layout, and access discipline comes from the protocol, not the
// type contents.
unsafe impl<T: SharedMemorySafe, Role> SharedMemorySafe for RoleCell<T, Role> {}

/// Cell owned exclusively by the writer.
pub type WriterCell<T> = RoleCell<T, WriterRole>;

/// Cell owned exclusively by the reader.
pub type ReaderCell<T> = RoleCell<T, ReaderRole>;

/// Cell holding the byte region.
pub type RegionCell<T> = RoleCell<T, RegionRole>;

/// One side's private cursor block.
///
/// `buf` holds the region's mapped address *in the owning side's address
/// space*, stored as an integer so the block can live in shared memory (a
/// pointer type would be meaningless in the peer process). Each side installs
/// its own mapping through the reattach calls.
#[derive(SharedMemorySafe)]
#[repr(C)]
struct View {
    /// Mapped address of the byte region for this side.
    buf: usize,
    /// End of the pending reservation, as an offset within the current epoch.
    pos: usize,
    /// Cached upper bound of this side's usable window, in offset space.
    end: usize,
    /// Wrap-epoch accumulator; always a multiple of `size`.
    base: usize,
    /// Region length in bytes. Power of two, fixed at initialization.
    size: usize,
}

impl View {
    const fn empty() -> Self {
        Self {
            buf: 0,
            pos: 0,
            end: 0,
            base: 0,
            size: 0,
        }
    }
}

/// Errors surfaced by [`RingBuffer::initialize`].
///
/// All three are fatal to the instance: the stream is unusable until
/// initialization succeeds.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RingError {
    /// The cache line size this crate was compiled for does not match the one
    /// the platform reports. The compiled value partitions the shared-state
    /// layout, so a mismatch can reintroduce false sharing between the sides.
    #[error("wrong cache line size: compiled for {compiled}, platform reports {probed}")]
    WrongCacheLineSize { compiled: usize, probed: usize },

    /// The byte region does not start on a cache line boundary.
    #[error("buffer is not aligned on cache line")]
    UnalignedBuffer,

    /// The byte region length is not a power of two.
    #[error("size must be a power of two")]
    SizeNotPowerOfTwo,
}

#[cfg(not(feature = "unaligned"))]
#[inline]
const fn align_up(pos: usize, align: usize) -> usize {
    (pos + align - 1) & !(align - 1)
}

// With the upshift disabled, records pack back to back. Reading them as typed
// values is then off the table; callers get raw bytes only.
#[cfg(feature = "unaligned")]
#[inline]
const fn align_up(pos: usize, _align: usize) -> usize {
    pos
}

/// Shared state of a byte stream: four cache-line-isolated blocks.
///
/// ```text
/// ┌─────────────────────────────────────────┐
/// │ writer view   (pos, end, base, size)    │  1 cache line, writer-owned
/// ├─────────────────────────────────────────┤
/// │ reader view   (pos, end, base, size)    │  1 cache line, reader-owned
/// ├─────────────────────────────────────────┤
/// │ writer counter (AtomicUsize)            │  1 cache line, writer publishes
/// ├─────────────────────────────────────────┤
/// │ reader counter (AtomicUsize)            │  1 cache line, reader publishes
/// └─────────────────────────────────────────┘
/// ```
///
/// The byte region itself is owned externally and handed in through
/// [`initialize`](Self::initialize); the stream never allocates or frees it.
#[derive(SharedMemorySafe)]
#[repr(C)]
pub struct RingBuffer {
    /// Writer's private cursors.
    writer: CacheAligned<WriterCell<View>>,
    /// Reader's private cursors.
    reader: CacheAligned<ReaderCell<View>>,
    /// Running total of bytes the writer has published, across all epochs.
    writer_pos: CacheAligned<AtomicUsize>,
    /// Running total of bytes the reader has released, across all epochs.
    reader_pos: CacheAligned<AtomicUsize>,
}

impl RingBuffer {
    /// Creates a zeroed, uninitialized stream. Call
    /// [`initialize`](Self::initialize) before use.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            writer: CacheAligned::new(WriterCell::new(View::empty())),
            reader: CacheAligned::new(ReaderCell::new(View::empty())),
            writer_pos: CacheAligned::new(AtomicUsize::new(0)),
            reader_pos: CacheAligned::new(AtomicUsize::new(0)),
        }
    }

    /// Prepares the stream over an externally owned byte region.
    ///
    /// Verifies the environment, zeroes all four blocks, installs `buffer` as
    /// both sides' view of the region, and records `size`. The writer starts
    /// with the whole region as its window; the reader's window stays empty
    /// until the writer publishes.
    ///
    /// # Errors
    ///
    /// - [`RingError::WrongCacheLineSize`] if the platform reports a cache
    ///   line size different from [`CACHE_LINE_SIZE`]. Platforms with no
    ///   query skip the check.
    /// - [`RingError::UnalignedBuffer`] if `buffer` is not cache-line
    ///   aligned.
    /// - [`RingError::SizeNotPowerOfTwo`] if `size` is not a power of two.
    ///
    /// # Safety
    ///
    /// Both sides must be quiescent for the duration of the call, and
    /// `buffer` must point to at least `size` writable bytes that outlive
    /// every later operation on this stream.
    pub unsafe fn initialize(&self, buffer: *mut u8, size: usize) -> Result<(), RingError> {
        if let Some(probed) = runtime_cache_line_size()
            && probed != CACHE_LINE_SIZE
        {
            return Err(RingError::WrongCacheLineSize {
                compiled: CACHE_LINE_SIZE,
                probed,
            });
        }
        if buffer.addr() % CACHE_LINE_SIZE != 0 {
            return Err(RingError::UnalignedBuffer);
        }
        if !size.is_power_of_two() {
            return Err(RingError::SizeNotPowerOfTwo);
        }

        // SAFETY: caller guarantees both sides are quiescent.
        unsafe {
            self.reset();
            self.reattach_writer(buffer);
            self.reattach_reader(buffer);

            let writer = &mut *self.writer.get().get();
            writer.size = size;
            writer.end = size;
            let reader = &mut *self.reader.get().get();
            reader.size = size;
        }
        Ok(())
    }

    /// Zeroes both cursor blocks and both shared counters.
    ///
    /// The stream must be re-initialized before it is used again; like the
    /// attach state, the recorded size is cleared too.
    ///
    /// # Safety
    ///
    /// Both sides must be quiescent. The stores here are not synchronized
    /// against concurrent prepare/finish calls.
    pub unsafe fn reset(&self) {
        // SAFETY: no concurrent accessors per the contract above.
        unsafe {
            *self.writer.get().get() = View::empty();
            *self.reader.get().get() = View::empty();
        }
        self.writer_pos.store(0, Ordering::SeqCst);
        self.reader_pos.store(0, Ordering::SeqCst);
    }

    /// Reinstalls the writer's view of the byte region.
    ///
    /// For cross-process use: the same physical bytes may be mapped at a
    /// different virtual address in the writer's process. Counters and
    /// cursors are untouched.
    ///
    /// # Safety
    ///
    /// The writer side must be quiescent, and `buffer` must address the same
    /// physical bytes the stream was initialized over.
    pub unsafe fn reattach_writer(&self, buffer: *mut u8) {
        // SAFETY: writer side is quiescent per the contract.
        unsafe {
            (*self.writer.get().get()).buf = buffer.expose_provenance();
        }
    }

    /// Reinstalls the reader's view of the byte region.
    ///
    /// # Safety
    ///
    /// The reader side must be quiescent, and `buffer` must address the same
    /// physical bytes the stream was initialized over.
    pub unsafe fn reattach_reader(&self, buffer: *mut u8) {
        // SAFETY: reader side is quiescent per the contract.
        unsafe {
            (*self.reader.get().get()).buf = buffer.expose_provenance();
        }
    }

    /// Reserves `len` bytes for writing, aligned to `align`.
    ///
    /// Spins while the reader is behind. The returned pointer is valid for
    /// exactly `len` bytes and stays valid until the next `prepare_write`;
    /// nothing becomes visible to the reader until [`finish_write`]
    /// publishes everything reserved since the previous publish.
    ///
    /// [`finish_write`]: Self::finish_write
    ///
    /// # Safety
    ///
    /// - Only the single writer may call this.
    /// - `len <= size` and `align` is a nonzero power of two. Checked in
    ///   debug builds; violating either in release is undefined behavior.
    #[inline]
    #[must_use]
    pub unsafe fn prepare_write(&self, len: usize, align: usize) -> *mut u8 {
        // SAFETY: the writer has exclusive access to its view (WriterRole).
        let view = unsafe { &mut *self.writer.get().get() };
        debug_assert!(len <= view.size, "reservation larger than the region");
        debug_assert!(
            align != 0 && align.is_power_of_two(),
            "alignment must be a power of two"
        );

        let mut pos = align_up(view.pos, align);
        let mut end = pos + len;
        if end > view.end {
            self.acquire_write_window(view, &mut pos, &mut end);
        }
        view.pos = end;
        std::ptr::with_exposed_provenance_mut(view.buf + pos)
    }

    /// Publishes every byte reserved since the previous publish.
    ///
    /// This Release store is the sole synchronization point between the
    /// sides: the reader's next Acquire load of the counter observes all
    /// stores into the region issued before this call.
    ///
    /// # Safety
    ///
    /// Only the single writer may call this.
    #[inline]
    pub unsafe fn finish_write(&self) {
        // SAFETY: the writer has exclusive access to its view.
        let view = unsafe { &*self.writer.get().get() };
        self.writer_pos
            .store(view.base.wrapping_add(view.pos), Ordering::Release);
    }

    /// Reserves the next `len` published bytes for reading, aligned to
    /// `align`.
    ///
    /// `len` and `align` should match what the writer reserved. Spins while
    /// the writer has not yet published that far. The returned pointer stays
    /// valid until the next `prepare_read`; the space is handed back to the
    /// writer only when [`finish_read`] publishes.
    ///
    /// [`finish_read`]: Self::finish_read
    ///
    /// # Safety
    ///
    /// - Only the single reader may call this.
    /// - `len <= size` and `align` is a nonzero power of two. Checked in
    ///   debug builds; violating either in release is undefined behavior.
    #[inline]
    #[must_use]
    pub unsafe fn prepare_read(&self, len: usize, align: usize) -> *const u8 {
        // SAFETY: the reader has exclusive access to its view (ReaderRole).
        let view = unsafe { &mut *self.reader.get().get() };
        debug_assert!(len <= view.size, "reservation larger than the region");
        debug_assert!(
            align != 0 && align.is_power_of_two(),
            "alignment must be a power of two"
        );

        let mut pos = align_up(view.pos, align);
        let mut end = pos + len;
        if end > view.end {
            self.acquire_read_window(view, &mut pos, &mut end);
        }
        view.pos = end;
        std::ptr::with_exposed_provenance(view.buf + pos)
    }

    /// Releases every byte consumed since the previous release back to the
    /// writer, with a Release store of the reader counter.
    ///
    /// # Safety
    ///
    /// Only the single reader may call this.
    #[inline]
    pub unsafe fn finish_read(&self) {
        // SAFETY: the reader has exclusive access to its view.
        let view = unsafe { &*self.reader.get().get() };
        self.reader_pos
            .store(view.base.wrapping_add(view.pos), Ordering::Release);
    }

    /// Write-side slow path: wrap past the physical end if the reservation
    /// straddles it, then spin until the reader has released enough space.
    fn acquire_write_window(&self, view: &mut View, pos: &mut usize, end: &mut usize) {
        // A straddling reservation teleports to offset zero and abandons the
        // tail of this epoch. The reader's slow path mirrors the rule, which
        // is what keeps the two sides agreed on epoch boundaries without a
        // marker in the byte region.
        if *end > view.size {
            *end -= *pos;
            *pos = 0;
            view.base = view.base.wrapping_add(view.size);
        }
        loop {
            let reader_pos = self.reader_pos.load(Ordering::Acquire);
            // Furthest offset the writer may advance to within this epoch.
            // The counters wrap, so the comparison must be signed.
            let available = reader_pos.wrapping_sub(view.base).wrapping_add(view.size);
            if available.wrapping_sub(*end) as isize >= 0 {
                // Clamp to the physical end; a later reservation past it
                // re-enters the wrap branch above.
                view.end = available.min(view.size);
                break;
            }
            std::hint::spin_loop();
        }
    }

    /// Read-side slow path: same wrap rule, then spin until the writer has
    /// published far enough. Unlike the write side there is no `+ size`
    /// term: the reader may advance only to what has been published.
    fn acquire_read_window(&self, view: &mut View, pos: &mut usize, end: &mut usize) {
        if *end > view.size {
            *end -= *pos;
            *pos = 0;
            view.base = view.base.wrapping_add(view.size);
        }
        loop {
            let writer_pos = self.writer_pos.load(Ordering::Acquire);
            let available = writer_pos.wrapping_sub(view.base);
            if available.wrapping_sub(*end) as isize >= 0 {
                view.end = available.min(view.size);
                break;
            }
            std::hint::spin_loop();
        }
    }

    /// Reserves space for one `T` and moves `value` into it.
    ///
    /// Does not publish; batch several writes under one
    /// [`finish_write`](Self::finish_write).
    ///
    /// # Safety
    ///
    /// Only the single writer may call this, and `size_of::<T>()` must not
    /// exceed the region size.
    #[inline]
    pub unsafe fn write<T: SharedMemorySafe + Copy>(&self, value: T) {
        // SAFETY: forwarded from the caller.
        let dst = unsafe { self.prepare_write(size_of::<T>(), align_of::<T>()) };
        // SAFETY: prepare_write returned size_of::<T>() bytes aligned to
        // align_of::<T>().
        unsafe { dst.cast::<T>().write(value) };
    }

    /// Reserves space for `values.len()` elements and copies them in.
    ///
    /// # Safety
    ///
    /// Only the single writer may call this, and the slice's byte size must
    /// not exceed the region size.
    #[inline]
    pub unsafe fn write_slice<T: SharedMemorySafe + Copy>(&self, values: &[T]) {
        // SAFETY: forwarded from the caller.
        let dst = unsafe { self.prepare_write(size_of_val(values), align_of::<T>()) };
        // SAFETY: the reservation covers the whole slice and is aligned for T;
        // source and destination cannot overlap (the region is not borrowed).
        unsafe {
            std::ptr::copy_nonoverlapping(values.as_ptr(), dst.cast::<T>(), values.len());
        }
    }

    /// Reads the next value of type `T`, by copy.
    ///
    /// Must pair with a `write::<T>` on the writer side. Does not release;
    /// batch several reads under one [`finish_read`](Self::finish_read).
    ///
    /// # Safety
    ///
    /// Only the single reader may call this, and the next record must have
    /// been written as a `T`.
    #[inline]
    #[must_use]
    pub unsafe fn read<T: SharedMemorySafe + Copy>(&self) -> T {
        // SAFETY: forwarded from the caller.
        let src = unsafe { self.prepare_read(size_of::<T>(), align_of::<T>()) };
        // SAFETY: the record was constructed in place as a T by the writer,
        // at an address aligned for T.
        unsafe { src.cast::<T>().read() }
    }

    /// Reserves the next `count` elements of type `T` and returns their
    /// address.
    ///
    /// # Safety
    ///
    /// Only the single reader may call this, and the next record must have
    /// been written as `count` values of `T`. The pointer is invalidated by
    /// the next `prepare_read`.
    #[inline]
    #[must_use]
    pub unsafe fn read_ptr<T: SharedMemorySafe + Copy>(&self, count: usize) -> *const T {
        // SAFETY: forwarded from the caller.
        let src = unsafe { self.prepare_read(size_of::<T>() * count, align_of::<T>()) };
        src.cast::<T>()
    }

    /// Running total of bytes the writer has published.
    #[must_use]
    pub fn published(&self) -> usize {
        self.writer_pos.load(Ordering::Acquire)
    }

    /// Running total of bytes the reader has released.
    #[must_use]
    pub fn released(&self) -> usize {
        self.reader_pos.load(Ordering::Acquire)
    }

    /// Bytes currently in flight (published but not yet released), counting
    /// any epoch tails skipped by the wrap rule. Never exceeds the region
    /// size.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.published().wrapping_sub(self.released())
    }
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::{Layout, alloc_zeroed, dealloc};
    use std::mem::offset_of;

    /// Cache-line-aligned heap region for driving the core directly.
    struct Region {
        ptr: *mut u8,
        layout: Layout,
    }

    impl Region {
        fn new(size: usize) -> Self {
            let layout = Layout::from_size_align(size, CACHE_LINE_SIZE).unwrap();
            // SAFETY: layout has nonzero size in every test below.
            let ptr = unsafe { alloc_zeroed(layout) };
            assert!(!ptr.is_null());
            Self { ptr, layout }
        }
    }

    impl Drop for Region {
        fn drop(&mut self) {
            // SAFETY: allocated in new() with the stored layout.
            unsafe { dealloc(self.ptr, self.layout) };
        }
    }

    fn initialized(region: &Region, size: usize) -> RingBuffer {
        let ring = RingBuffer::new();
        // SAFETY: nothing else touches the fresh ring.
        unsafe { ring.initialize(region.ptr, size).unwrap() };
        ring
    }

    #[test]
    fn blocks_occupy_distinct_cache_lines() {
        assert_eq!(offset_of!(RingBuffer, writer), 0);
        assert_eq!(offset_of!(RingBuffer, reader), CACHE_LINE_SIZE);
        assert_eq!(offset_of!(RingBuffer, writer_pos), 2 * CACHE_LINE_SIZE);
        assert_eq!(offset_of!(RingBuffer, reader_pos), 3 * CACHE_LINE_SIZE);
        assert_eq!(size_of::<RingBuffer>(), 4 * CACHE_LINE_SIZE);
    }

    #[test]
    fn initialize_rejects_bad_input() {
        let region = Region::new(64);
        let ring = RingBuffer::new();

        // SAFETY: single-threaded test, no concurrent access anywhere below.
        unsafe {
            assert_eq!(
                ring.initialize(region.ptr, 48),
                Err(RingError::SizeNotPowerOfTwo)
            );
            assert_eq!(
                ring.initialize(region.ptr.add(1), 32),
                Err(RingError::UnalignedBuffer)
            );
            assert_eq!(ring.initialize(region.ptr, 64), Ok(()));
        }
    }

    #[test]
    fn fill_and_drain() {
        let region = Region::new(64);
        let ring = initialized(&region, 64);
        let payload: Vec<u8> = (1..=60).collect();

        // SAFETY: single-threaded; one logical writer, one logical reader.
        unsafe {
            let dst = ring.prepare_write(60, 1);
            std::ptr::copy_nonoverlapping(payload.as_ptr(), dst, 60);
            ring.finish_write();

            let src = ring.prepare_read(60, 1);
            let got = std::slice::from_raw_parts(src, 60);
            assert_eq!(got, &payload[..]);
            ring.finish_read();
        }

        assert_eq!(ring.published(), 60);
        assert_eq!(ring.released(), 60);
        assert_eq!(ring.in_flight(), 0);
    }

    #[test]
    fn wrap_skips_epoch_tail() {
        let region = Region::new(64);
        let ring = initialized(&region, 16);
        let first: Vec<u8> = (0xA0..=0xA9).collect();
        let second: Vec<u8> = (0xB0..=0xB9).collect();

        // SAFETY: single-threaded roles as above.
        unsafe {
            let dst = ring.prepare_write(10, 1);
            std::ptr::copy_nonoverlapping(first.as_ptr(), dst, 10);
            ring.finish_write();
            let src = ring.prepare_read(10, 1);
            assert_eq!(std::slice::from_raw_parts(src, 10), &first[..]);
            ring.finish_read();

            // The second 10-byte record straddles offset 16; both sides
            // abandon bytes 10..16 of the first epoch and restart at zero.
            let dst = ring.prepare_write(10, 1);
            assert_eq!(dst, region.ptr);
            std::ptr::copy_nonoverlapping(second.as_ptr(), dst, 10);
            ring.finish_write();
            let src = ring.prepare_read(10, 1);
            assert_eq!(src, region.ptr as *const u8);
            assert_eq!(std::slice::from_raw_parts(src, 10), &second[..]);
            ring.finish_read();
        }

        // Epoch accounting: the wrap advanced both bases by 16, so the
        // running totals read 16 + 10, the skipped tail included.
        assert_eq!(ring.published(), 26);
        assert_eq!(ring.released(), 26);
    }

    #[test]
    fn reservations_honor_alignment() {
        let region = Region::new(128);
        let ring = initialized(&region, 128);

        // SAFETY: single-threaded roles.
        unsafe {
            let a = ring.prepare_write(1, 1);
            assert_eq!(a, region.ptr);
            let b = ring.prepare_write(8, 64);
            assert_eq!(b.addr() % 64, 0);
            assert_eq!(b, region.ptr.add(64));
            ring.finish_write();

            let _ = ring.prepare_read(1, 1);
            let r = ring.prepare_read(8, 64);
            assert_eq!(r.addr() % 64, 0);
            ring.finish_read();
        }
    }

    #[test]
    fn reattach_reader_to_relocated_region() {
        let r1 = Region::new(64);
        let r2 = Region::new(64);
        let ring = initialized(&r1, 64);
        let payload = [0xDEu8, 0xAD, 0xBE, 0xEF];

        // SAFETY: single-threaded roles; both sides quiescent at reattach.
        unsafe {
            let dst = ring.prepare_write(4, 1);
            std::ptr::copy_nonoverlapping(payload.as_ptr(), dst, 4);
            ring.finish_write();

            // Same bytes, different address: what a second process would see.
            std::ptr::copy_nonoverlapping(r1.ptr, r2.ptr, 64);
            ring.reattach_reader(r2.ptr);

            let src = ring.prepare_read(4, 1);
            assert_eq!(src, r2.ptr as *const u8);
            assert_eq!(std::slice::from_raw_parts(src, 4), &payload[..]);
            ring.finish_read();
        }
    }

    #[test]
    fn straddling_records_recovered_intact() {
        let region = Region::new(64);
        let ring = initialized(&region, 32);

        // Record lengths chosen to land straddles at varying offsets.
        for i in 0u8..50 {
            let len = (i as usize % 13) + 1;
            let payload: Vec<u8> = (0..len as u8).map(|b| b.wrapping_add(i)).collect();
            // SAFETY: single-threaded roles; the read never spins because
            // each record is published before it is consumed.
            unsafe {
                let dst = ring.prepare_write(len, 1);
                std::ptr::copy_nonoverlapping(payload.as_ptr(), dst, len);
                ring.finish_write();

                let src = ring.prepare_read(len, 1);
                assert_eq!(std::slice::from_raw_parts(src, len), &payload[..], "record {i}");
                ring.finish_read();
            }
            assert!(ring.in_flight() <= 32);
        }
    }

    #[test]
    fn typed_roundtrip_batched_under_one_publish() {
        let region = Region::new(256);
        let ring = initialized(&region, 256);

        // SAFETY: single-threaded roles.
        unsafe {
            ring.write(0x1122_3344_5566_7788u64);
            ring.write(7u8);
            ring.write_slice(&[1u32, 2, 3, 4]);
            ring.finish_write();

            assert_eq!(ring.read::<u64>(), 0x1122_3344_5566_7788);
            assert_eq!(ring.read::<u8>(), 7);
            let arr = ring.read_ptr::<u32>(4);
            assert_eq!(std::slice::from_raw_parts(arr, 4), &[1, 2, 3, 4]);
            ring.finish_read();
        }

        assert_eq!(ring.published(), ring.released());
    }

    #[test]
    fn reset_clears_counters_and_cursors() {
        let region = Region::new(64);
        let ring = initialized(&region, 64);

        // SAFETY: single-threaded roles; quiescent at reset.
        unsafe {
            ring.write(42u64);
            ring.finish_write();
            assert_eq!(ring.published(), 8);

            ring.reset();
            assert_eq!(ring.published(), 0);
            assert_eq!(ring.released(), 0);

            // A reset stream must be re-initialized before reuse.
            ring.initialize(region.ptr, 64).unwrap();
            ring.write(43u64);
            ring.finish_write();
            assert_eq!(ring.read::<u64>(), 43);
            ring.finish_read();
        }
    }
}
