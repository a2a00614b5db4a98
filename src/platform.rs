//! Everything that talks to the operating system.
//!
//! The allocator only needs naturally aligned superblocks, `errno`, and a way
//! to tell threads apart. How those are obtained is hidden behind
//! [`PlatformSpecificMemory`] so the engine never calls `libc` directly.

use std::ptr::NonNull;

use libc::c_int;

use crate::config::SUPERBLOCK_SIZE;

#[cfg(not(unix))]
compile_error!("thalloc maps superblocks with mmap and only supports Unix targets");

/// Exit status of a process that tried to start a second thread.
pub const THREAD_REFUSED_STATUS: c_int = libc::ENOSYS;

trait PlatformSpecificMemory {
  /// Maps `length` bytes of zeroed read/write memory. Returns the OS errno on
  /// failure.
  unsafe fn request_memory(length: usize) -> Result<NonNull<u8>, c_int>;

  /// Gives `length` bytes starting at `address` back to the OS.
  unsafe fn return_memory(
    address: NonNull<u8>,
    length: usize,
  ) -> Result<(), c_int>;

  /// Granularity of `request_memory`.
  fn page_size() -> usize;
}

struct Platform;

/// Virtual memory page size in bytes.
pub fn page_size() -> usize {
  Platform::page_size()
}

/// Maps one superblock whose base is a multiple of [`SUPERBLOCK_SIZE`].
///
/// `mmap` only promises page alignment. When the page size is at least a
/// superblock that is already enough, otherwise the first attempt may come
/// back misaligned: in that case twice the size is mapped and trimmed down to
/// the aligned superblock inside it.
///
/// ```text
///   raw                 aligned                         raw + 2 * SIZE
///   |------ head ------|========= superblock =========|---- tail ----|
///        unmapped                  kept                  unmapped
/// ```
pub unsafe fn map_superblock() -> Result<NonNull<u8>, c_int> {
  #[cfg(test)]
  fault::check_map()?;

  unsafe {
    let address = Platform::request_memory(SUPERBLOCK_SIZE)?;

    if address.as_ptr().addr() % SUPERBLOCK_SIZE == 0 {
      return Ok(address);
    }

    Platform::return_memory(address, SUPERBLOCK_SIZE)?;

    let span = 2 * SUPERBLOCK_SIZE;
    let raw = Platform::request_memory(span)?;
    let head = raw.as_ptr().align_offset(SUPERBLOCK_SIZE);
    let aligned = raw.add(head);
    let tail = span - head - SUPERBLOCK_SIZE;

    if head > 0 {
      Platform::return_memory(raw, head)?;
    }

    if tail > 0 {
      Platform::return_memory(aligned.add(SUPERBLOCK_SIZE), tail)?;
    }

    Ok(aligned)
  }
}

/// Returns a superblock obtained from [`map_superblock`].
pub unsafe fn unmap_superblock(base: NonNull<u8>) -> Result<(), c_int> {
  #[cfg(test)]
  fault::check_unmap()?;

  unsafe { Platform::return_memory(base, SUPERBLOCK_SIZE) }
}

/// Current value of the calling thread's `errno`.
pub fn errno() -> c_int {
  unsafe { *errno_location() }
}

pub fn set_errno(value: c_int) {
  unsafe { *errno_location() = value };
}

#[cfg(any(target_os = "linux", target_os = "emscripten"))]
unsafe fn errno_location() -> *mut c_int {
  unsafe { libc::__errno_location() }
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
unsafe fn errno_location() -> *mut c_int {
  unsafe { libc::__error() }
}

#[cfg(any(target_os = "android", target_os = "openbsd", target_os = "netbsd"))]
unsafe fn errno_location() -> *mut c_int {
  unsafe { libc::__errno() }
}

/// Identifies the calling thread without allocating.
pub fn thread_id() -> usize {
  (unsafe { libc::pthread_self() }) as usize
}

/// Ends the process right away. Used when a second thread shows up: there is
/// no locking anywhere in the allocator, so carrying on would corrupt it.
pub fn refuse_thread() -> ! {
  unsafe { libc::_exit(THREAD_REFUSED_STATUS) }
}

#[cfg(not(miri))]
mod unix {
  use std::ptr::{self, NonNull};

  use libc::c_int;

  use super::{Platform, PlatformSpecificMemory, errno};

  impl PlatformSpecificMemory for Platform {
    unsafe fn request_memory(length: usize) -> Result<NonNull<u8>, c_int> {
      // Memory protection. Read-Write only.
      let protection = libc::PROT_READ | libc::PROT_WRITE;

      // Private to our process and not backed by any file.
      let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

      match unsafe { libc::mmap(ptr::null_mut(), length, protection, flags, -1, 0) } {
        libc::MAP_FAILED => Err(errno()),
        address => Ok(unsafe { NonNull::new_unchecked(address.cast()) }),
      }
    }

    unsafe fn return_memory(
      address: NonNull<u8>,
      length: usize,
    ) -> Result<(), c_int> {
      match unsafe { libc::munmap(address.as_ptr().cast(), length) } {
        0 => Ok(()),
        _ => Err(errno()),
      }
    }

    fn page_size() -> usize {
      unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
    }
  }
}

#[cfg(miri)]
mod miri {
  //! Miri has no `mmap`, so superblocks come from the system allocator with
  //! the right alignment. Leaked superblocks then show up as Miri leaks.

  use std::{
    alloc::{GlobalAlloc, Layout, System},
    ptr::NonNull,
  };

  use libc::c_int;

  use super::{Platform, PlatformSpecificMemory};
  use crate::config::SUPERBLOCK_SIZE;

  fn layout(length: usize) -> Result<Layout, c_int> {
    Layout::from_size_align(length, SUPERBLOCK_SIZE).map_err(|_| libc::EINVAL)
  }

  impl PlatformSpecificMemory for Platform {
    unsafe fn request_memory(length: usize) -> Result<NonNull<u8>, c_int> {
      NonNull::new(unsafe { System.alloc_zeroed(layout(length)?) }).ok_or(libc::ENOMEM)
    }

    unsafe fn return_memory(
      address: NonNull<u8>,
      length: usize,
    ) -> Result<(), c_int> {
      unsafe { System.dealloc(address.as_ptr(), layout(length)?) };
      Ok(())
    }

    fn page_size() -> usize {
      SUPERBLOCK_SIZE
    }
  }
}
