//! SPSC byte-stream ring buffers for in-process and cross-process use.
//!
//! One writer and one reader exchange arbitrarily-sized, variably-aligned
//! records through a fixed power-of-two byte region, coordinated only by two
//! shared atomic counters. [`sync::stream`] runs the protocol over heap
//! memory between threads; [`ipc::stream`] runs it over POSIX shared memory
//! between processes.

// Allow the crate to reference itself as ::rhea for derive macro usage
extern crate self as rhea;

pub mod cacheline;
pub mod ipc;
pub mod ring;
pub mod sync;

mod trace;
pub use trace::init_tracing;

#[doc(inline)]
pub use rhea_derive::SharedMemorySafe;

#[doc(inline)]
pub use ipc::shmem::SharedMemorySafe;

// Hidden re-export for the derive macro
#[doc(hidden)]
pub use ipc::shmem::SharedMemorySafe as __SharedMemorySafePrivate;

pub use cacheline::{CACHE_LINE_SIZE, CacheAligned};
pub use ring::{RingBuffer, RingError};
