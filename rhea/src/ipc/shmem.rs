//! POSIX shared memory wrapper with type safety and automatic cleanup.
//!
//! This module provides a safe, zero-cost abstraction over POSIX shared
//! memory (`shm_open`, `mmap`) with compile-time guarantees about memory
//! layout and cleanup behavior.
//!
//! # Overview
//!
//! - [`Shm<T, Mode>`] - smart pointer to shared memory with typestate-based
//!   cleanup
//! - [`SharedMemorySafe`] - trait marking types safe for cross-process
//!   sharing
//! - [`Creator`] - typestate marker: creates new shared memory, unlinks on
//!   drop
//! - [`Opener`] - typestate marker: opens existing shared memory, no unlink
//!   on drop
//!
//! # Typestate pattern
//!
//! `Shm<T, Creator>` and `Shm<T, Opener>` are different types with different
//! `Drop` behavior, enforced at compile time:
//!
//! ```text
//! Creator          Opener
//!    ↓                ↓
//!   Drop            Drop
//!    ↓                ↓
//! munmap()        munmap()
//! unlink()        (no unlink)
//! ```
//!
//! This prevents accidentally leaking a shared memory name or prematurely
//! unlinking memory still in use. On daemon startup, clean up any name a
//! crashed previous run may have leaked with `rustix::shm::unlink` before
//! creating.
//!
//! # Implementing SharedMemorySafe
//!
//! The trait is implemented for primitives, atomics, and arrays. For custom
//! types, use the derive macro, which verifies `#[repr(C)]` (or
//! `transparent`), rejects pointer-carrying field types, and bounds every
//! field recursively:
//!
//! ```
//! use rhea::SharedMemorySafe;
//! use std::sync::atomic::AtomicUsize;
//!
//! #[derive(SharedMemorySafe)]
//! #[repr(C)]
//! struct Counters {
//!     published: AtomicUsize,
//!     released: AtomicUsize,
//! }
//! ```

use std::marker::PhantomData;
use std::mem::size_of;
use std::ops::Deref;
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::ptr::{NonNull, null_mut};
use std::sync::atomic::*;

use rustix::fs::{Mode, fstat, ftruncate};
use rustix::mm::{MapFlags, ProtFlags, mmap, munmap};
use rustix::{io, shm};
use thiserror::Error;

/// Result alias for shared memory operations.
pub type Result<T> = std::result::Result<T, ShmError>;

/// Contextual errors produced by [`Shm`].
#[derive(Debug, Error)]
pub enum ShmError {
    /// The provided POSIX shared memory name is invalid.
    #[error("invalid shared memory path `{path}`: {reason}")]
    InvalidPath { path: String, reason: &'static str },

    /// `shm_open`, `mmap`, `ftruncate`, etc. failed with an errno.
    #[error("{op} failed for `{path}`: {source}")]
    PosixError {
        op: &'static str,
        path: String,
        #[source]
        source: io::Errno,
    },

    /// The existing shared memory object has a different size than `T`.
    #[error("shared memory `{path}` size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        path: String,
        expected: usize,
        actual: i64,
    },
}

impl ShmError {
    fn posix(op: &'static str, path: &str, err: io::Errno) -> Self {
        Self::PosixError {
            op,
            path: path.to_string(),
            source: err,
        }
    }
}

/// Trait defining cleanup behavior for shared memory modes.
///
/// This is an internal trait used to implement the typestate pattern. Use the
/// [`Creator`] or [`Opener`] markers instead of implementing it.
pub trait ShmMode {
    /// Whether to unlink the shared memory name on drop.
    const SHOULD_UNLINK: bool;
}

/// Typestate marker for the process that creates the shared memory.
///
/// On drop the memory is unmapped **and the name is unlinked**.
pub struct Creator;
impl ShmMode for Creator {
    const SHOULD_UNLINK: bool = true;
}

/// Typestate marker for processes that open existing shared memory.
///
/// On drop the memory is only unmapped; the name persists for the creator to
/// clean up.
pub struct Opener;
impl ShmMode for Opener {
    const SHOULD_UNLINK: bool = false;
}

/// Types safe to place in POSIX shared memory and access from multiple
/// processes simultaneously.
///
/// # Safety
///
/// Implementers must guarantee all of the following:
///
/// - **Layout**: `#[repr(C)]` or `#[repr(transparent)]` — the two processes
///   may be compiled separately, and `#[repr(Rust)]` is unstable.
/// - **No pointers**: no heap or stack pointers, references, `Rc`/`Arc`.
///   Virtual addresses do not transfer across process boundaries. Inline
///   data (`[u8; N]`, primitives, atomics) only.
/// - **Fields**: every field is itself `SharedMemorySafe`.
/// - **Drop**: the type stays sound if `Drop` never runs — a SIGKILL'd peer
///   bypasses destructors.
/// - **Concurrency**: `Send + Sync`, with atomics for any shared mutable
///   state. `std::sync::Mutex` is process-local and will not work here.
///
/// Use `#[derive(SharedMemorySafe)]` for custom types; the macro checks the
/// layout attribute and rejects pointer-carrying fields at compile time.
pub unsafe trait SharedMemorySafe: Send + Sync {}

// Manual implementations for primitives and atomics
macro_rules! impl_shared_memory_safe {
    ($($t:ty),* $(,)?) => {
        $(
            unsafe impl SharedMemorySafe for $t {}
        )*
    };
}

impl_shared_memory_safe! {
    // Signed integers
    i8, i16, i32, i64, i128, isize,
    // Unsigned integers
    u8, u16, u32, u64, u128, usize,
    // Floats
    f32, f64,
    // Bool
    bool,
    // Atomics
    AtomicBool,
    AtomicI8, AtomicI16, AtomicI32, AtomicI64, AtomicIsize,
    AtomicU8, AtomicU16, AtomicU32, AtomicU64, AtomicUsize,
}

// Arrays are SharedMemorySafe if their elements are
unsafe impl<T: SharedMemorySafe, const N: usize> SharedMemorySafe for [T; N] {}

/// Smart pointer to POSIX shared memory with typestate-based cleanup.
///
/// Wraps a mapping of exactly one `T`, providing access via [`Deref`] and
/// cleanup via [`Drop`]. Both processes address the same physical pages
/// through their own virtual addresses.
///
/// # Safety invariants
///
/// - `ptr` points to `size_of::<T>()` bytes mapped via `mmap()`
/// - the mapping lives as long as the `Shm<T>`
/// - `mmap` page alignment satisfies any `T`'s alignment
/// - `T: SharedMemorySafe` keeps cross-process access sound
pub struct Shm<T: SharedMemorySafe, Mode: ShmMode> {
    ptr: NonNull<T>,
    size: usize,
    path: String,
    _mode: PhantomData<Mode>,
}

// SAFETY: the pointer targets shared memory, not thread-local data, and
// T: SharedMemorySafe already requires Send + Sync.
unsafe impl<T: SharedMemorySafe, Mode: ShmMode> Send for Shm<T, Mode> {}
unsafe impl<T: SharedMemorySafe, Mode: ShmMode> Sync for Shm<T, Mode> {}

const POSIX_NAME_MAX: usize = 255;

/// Validates that a path meets POSIX shm_open requirements.
///
/// For portable use, POSIX requires:
/// - Must start with '/'
/// - Must not contain additional slashes after the first
/// - Must not exceed NAME_MAX (255 characters)
fn validate_shm_path(path: &str) -> Result<()> {
    if !path.starts_with('/') {
        return Err(ShmError::InvalidPath {
            path: path.to_string(),
            reason: "path must start with '/'",
        });
    }

    if path[1..].contains('/') {
        return Err(ShmError::InvalidPath {
            path: path.to_string(),
            reason: "path must not contain additional '/' characters",
        });
    }

    if path.len() > POSIX_NAME_MAX {
        return Err(ShmError::InvalidPath {
            path: path.to_string(),
            reason: "path length must be <= 255 bytes",
        });
    }

    Ok(())
}

// Constructor for Creator mode
impl<T: SharedMemorySafe> Shm<T, Creator> {
    /// Creates new shared memory, maps it, and initializes it in place.
    ///
    /// The object is created with `O_EXCL`, sized to `size_of::<T>()`, mapped
    /// read-write, and then `init` runs once with the raw pointer before any
    /// other process can see consistent contents. `init` must leave a fully
    /// initialized `T` behind; typically it writes each field with
    /// `addr_of_mut!` and publishes a magic word last.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the path is invalid, the object already exists,
    /// permissions are insufficient, or mapping fails. On any error the name
    /// is unlinked again.
    ///
    /// # Panics
    ///
    /// Propagates a panic from `init` after unmapping and unlinking.
    pub fn create(path: &str, init: impl FnOnce(*mut T)) -> Result<Self> {
        validate_shm_path(path)?;

        let fd = shm::open(
            path,
            shm::OFlags::CREATE | shm::OFlags::EXCL | shm::OFlags::RDWR,
            Mode::RUSR | Mode::WUSR,
        )
        .map_err(|err| ShmError::posix("shm_open", path, err))?;

        if let Err(e) = ftruncate(&fd, size_of::<T>() as u64) {
            drop(fd);
            let _ = shm::unlink(path);
            return Err(ShmError::posix("ftruncate", path, e));
        }

        // Map into our address space
        //
        // SAFETY: fresh mapping of a newly created object; it aliases no
        // existing Rust object. ftruncate succeeded, so the object spans
        // size_of::<T>() bytes, and mmap returns page-aligned addresses,
        // satisfying any T's alignment.
        let ptr_result = unsafe {
            mmap(
                null_mut(),
                size_of::<T>(),
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
        };
        let ptr = match ptr_result {
            Ok(p) => p,
            Err(err) => {
                drop(fd);
                let _ = shm::unlink(path);
                return Err(ShmError::posix("mmap", path, err));
            }
        };

        // SAFETY: mmap never returns null on success.
        let ptr = unsafe { NonNull::new_unchecked(ptr.cast::<T>()) };

        let shm = Self {
            ptr,
            size: size_of::<T>(),
            path: path.to_string(),
            _mode: PhantomData,
        };

        let init_result = catch_unwind(AssertUnwindSafe(|| init(shm.ptr.as_ptr())));
        match init_result {
            Ok(()) => Ok(shm),
            Err(payload) => {
                drop(shm);
                resume_unwind(payload);
            }
        }
    }
}

// Constructor for Opener mode
impl<T: SharedMemorySafe> Shm<T, Opener> {
    /// Opens shared memory created by another process and maps it.
    ///
    /// The object's size must match `size_of::<T>()` exactly; a mismatch
    /// means the creator was built with a different layout and dereferencing
    /// would be unsound.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the object does not exist, permissions are
    /// insufficient, the size does not match, or mapping fails.
    pub fn open(path: &str) -> Result<Self> {
        validate_shm_path(path)?;

        let fd = shm::open(path, shm::OFlags::RDWR, Mode::empty())
            .map_err(|err| ShmError::posix("shm_open", path, err))?;

        let stat = match fstat(&fd) {
            Ok(stat) => stat,
            Err(err) => {
                drop(fd);
                return Err(ShmError::posix("fstat", path, err));
            }
        };
        let expected_size = size_of::<T>() as i64;
        if stat.st_size != expected_size {
            drop(fd);
            return Err(ShmError::SizeMismatch {
                path: path.to_string(),
                expected: size_of::<T>(),
                actual: stat.st_size,
            });
        }

        // Map into our address space
        //
        // SAFETY: the object exists and fstat confirmed its size; the fresh
        // mapping aliases no local object, and page alignment satisfies T.
        // Cross-process access is sound per T: SharedMemorySafe, provided the
        // creator finished its in-place initialization (callers gate on an
        // init marker before touching the contents).
        let ptr_result = unsafe {
            mmap(
                null_mut(),
                size_of::<T>(),
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
        };
        let ptr = match ptr_result {
            Ok(p) => p,
            Err(err) => {
                drop(fd);
                return Err(ShmError::posix("mmap", path, err));
            }
        };

        // SAFETY: mmap never returns null on success.
        let ptr = unsafe { NonNull::new_unchecked(ptr.cast::<T>()) };

        Ok(Self {
            ptr,
            size: size_of::<T>(),
            path: path.to_string(),
            _mode: PhantomData,
        })
    }
}

impl<T: SharedMemorySafe, Mode: ShmMode> Drop for Shm<T, Mode> {
    fn drop(&mut self) {
        // SAFETY: the pointer and size come from the successful mmap in the
        // constructor; the mapping is still live.
        unsafe {
            let _ = munmap(self.ptr.as_ptr().cast(), self.size);
        }

        if Mode::SHOULD_UNLINK {
            let _ = shm::unlink(&self.path);
        }
    }
}

impl<T: SharedMemorySafe, Mode: ShmMode> Deref for Shm<T, Mode> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: the mapping is valid until Drop, and T: SharedMemorySafe
        // keeps concurrent cross-process access sound.
        unsafe { self.ptr.as_ref() }
    }
}
