//! # thalloc - A Hoard-style Superblock Allocator
//!
//! This crate provides a **segregated-fit** memory allocator for objects of
//! 32 to 2048 bytes. Memory comes from the OS in fixed 4096-byte
//! **superblocks**, each one cut into slots of a single power of two size.
//!
//! ## Overview
//!
//! ```text
//!   Size classes and their pools:
//!
//!   ┌───────────┐    ┌──────────────┐    ┌──────────────┐
//!   │   32 B    │──▶ │  superblock  │──▶ │  superblock  │──▶ None
//!   ├───────────┤    └──────────────┘    └──────────────┘
//!   │   64 B    │──▶ None
//!   ├───────────┤    ┌──────────────┐
//!   │  128 B    │──▶ │  superblock  │──▶ None
//!   ├───────────┤    └──────────────┘
//!   │    ...    │
//!   ├───────────┤
//!   │ 2048 B    │──▶ None
//!   └───────────┘
//!
//!   Every request is rounded up to the next class. The class pool keeps a
//!   list of superblocks plus two counters: free slots across the list and
//!   superblocks with every slot free ("whole").
//! ```
//!
//! ## Crate Structure
//!
//! ```text
//!   thalloc
//!   ├── config      - Layout constants and runtime Config
//!   ├── error       - AllocError, Corruption, ConfigError
//!   ├── size_class  - Request size -> power of two class
//!   ├── superblock  - Header, slot free lists, acquire/release (internal)
//!   ├── pool        - Per class superblock list and counters (internal)
//!   ├── hoard       - Hoard: allocate, release, reclaim, verify
//!   ├── global      - HoardAlloc: static, single-thread checked wrapper
//!   ├── platform    - mmap/munmap, errno, thread identity (internal)
//!   └── interpose   - C symbols for LD_PRELOAD (feature "interpose")
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use thalloc::Hoard;
//!
//! let mut hoard = Hoard::new();
//!
//! let object = hoard.allocate(100).unwrap();
//! assert_eq!(object.as_ptr().addr() % 128, 0);
//!
//! unsafe { hoard.release(object).unwrap() };
//! assert!(hoard.verify().is_ok());
//! ```
//!
//! ## How It Works
//!
//! Superblocks are naturally aligned, so the owner of any object is found by
//! clearing the low 12 bits of its address:
//!
//! ```text
//!   object  0x7f3a_1c40_2980
//!   mask    0xffff_ffff_f000
//!           ────────────────
//!   header  0x7f3a_1c40_2000
//! ```
//!
//! Allocation pops the head of the first superblock with a free slot,
//! mapping a new superblock first when the whole class is full. Release
//! pushes the object back on its superblock and then returns whole
//! superblocks to the OS while the class holds more than the retention
//! threshold (2 by default) of them.
//!
//! Objects are poisoned on both paths: `0xcd` after allocation, `0xab` after
//! release (the first word of a free object is its free list link).
//!
//! ## Limitations
//!
//! - **Single-threaded only**: a second thread entering [`HoardAlloc`] ends
//!   the process, and with `interpose` so does `pthread_create`
//! - **Small objects only**: requests above 2048 bytes fail
//! - **No validation**: releasing a foreign or already released pointer is
//!   undefined behaviour
//! - **Unix-only**: requires `libc` and `mmap`
//!
//! ## Safety
//!
//! Releasing memory is `unsafe`: the allocator trusts that the pointer is one
//! it handed out.

#[macro_use]
mod trace;

pub mod config;
pub mod error;
mod global;
mod hoard;
#[cfg(feature = "interpose")]
mod interpose;
mod platform;
mod pool;
pub mod size_class;
mod superblock;

use std::ptr::NonNull;

pub use config::{Config, MAX_OBJECT_SIZE, MIN_OBJECT_SIZE, Poison, RETENTION_THRESHOLD, SUPERBLOCK_SIZE};
pub use error::{AllocError, ConfigError, Corruption};
pub use global::HoardAlloc;
pub use hoard::{Hoard, Stats};
pub use platform::{THREAD_REFUSED_STATUS, page_size};
pub use pool::ClassStats;
pub use size_class::SizeClass;

/// Nullable link between raw memory structures.
pub(crate) type Pointer<T> = Option<NonNull<T>>;
