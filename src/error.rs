//! Error types.
//!
//! Nothing here allocates until it is formatted, so the engine can return
//! these freely even when it is the process allocator.

use libc::c_int;
use thiserror::Error;

use crate::config::MAX_OBJECT_SIZE;

/// Failure of an allocator operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
  /// Request above the largest size class. No state was touched.
  #[error("requested {size} bytes, the largest object is {MAX_OBJECT_SIZE} bytes")]
  TooLarge { size: usize },

  /// Alignment no size class can honour.
  #[error("alignment of {align} bytes exceeds the largest object size")]
  Misaligned { align: usize },

  /// The OS refused to map a new superblock. No superblock was linked.
  #[error("operating system refused to map a superblock (errno {errno})")]
  OutOfMemory { errno: c_int },

  /// The OS refused to unmap a reclaimed superblock. Its bookkeeping is
  /// already gone, so the region stays mapped but untracked.
  #[error("failed to unmap superblock at {addr:#x} (errno {errno})")]
  Unmap { addr: usize, errno: c_int },
}

impl AllocError {
  /// Value stored in `errno` when this error crosses the C boundary.
  pub fn errno(&self) -> c_int {
    match self {
      Self::Misaligned { .. } => libc::EINVAL,
      Self::TooLarge { .. } | Self::OutOfMemory { .. } | Self::Unmap { .. } => libc::ENOMEM,
    }
  }
}

/// Broken bookkeeping found by [`crate::Hoard::verify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Corruption {
  #[error("class {object_size}: pool counts {recorded} free objects, superblocks hold {actual}")]
  FreeObjects {
    object_size: usize,
    recorded: usize,
    actual: usize,
  },

  #[error("class {object_size}: pool counts {recorded} whole superblocks, found {actual}")]
  WholeSuperblocks {
    object_size: usize,
    recorded: usize,
    actual: usize,
  },

  #[error("class {object_size}: {whole} whole superblocks retained, threshold is {threshold}")]
  RetentionExceeded {
    object_size: usize,
    whole: usize,
    threshold: usize,
  },

  #[error("class {object_size}: pool counts {recorded} superblocks, list holds {actual}")]
  SuperblockCount {
    object_size: usize,
    recorded: usize,
    actual: usize,
  },

  #[error("superblock {addr:#x} is on the {object_size}-byte list but belongs to another class")]
  ForeignClass { addr: usize, object_size: usize },

  #[error("superblock {addr:#x} counts {recorded} free slots, its free list holds {actual}")]
  FreeList {
    addr: usize,
    recorded: usize,
    actual: usize,
  },

  #[error("free slot {slot:#x} does not lie on a slot boundary of superblock {addr:#x}")]
  StraySlot { addr: usize, slot: usize },
}

/// Invalid [`crate::Config`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
  #[error("allocation and free poison must differ, both are {0:#04x}")]
  PoisonCollision(u8),
}
