//! C allocation symbols for `LD_PRELOAD`.
//!
//! ```text
//!   $ cargo build --release --features interpose
//!   $ LD_PRELOAD=target/release/libthalloc.so ./program
//! ```
//!
//! Every allocation entry point the C library offers has to come from here:
//! a pointer from a libc `memalign` reaching our `free` would be masked to a
//! superblock that does not exist. `valloc` and `pvalloc` are exported for
//! that reason even though they can never succeed: a page is larger than the
//! biggest class, so both return null with `errno` set to `ENOMEM`.
//! `pthread_create` is replaced as well, since nothing in this allocator is
//! safe to share between threads.

use std::ffi::{c_int, c_void};

use crate::{global::HoardAlloc, platform};

static HEAP: HoardAlloc = HoardAlloc::new();

#[unsafe(no_mangle)]
pub extern "C" fn malloc(size: usize) -> *mut c_void {
  HEAP.malloc(size).cast()
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
  unsafe { HEAP.free(ptr.cast()) }
}

#[unsafe(no_mangle)]
pub extern "C" fn calloc(
  count: usize,
  size: usize,
) -> *mut c_void {
  HEAP.calloc(count, size).cast()
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn realloc(
  ptr: *mut c_void,
  size: usize,
) -> *mut c_void {
  unsafe { HEAP.realloc(ptr.cast(), size).cast() }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut c_void) -> usize {
  unsafe { HEAP.usable_size(ptr.cast()) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn posix_memalign(
  out: *mut *mut c_void,
  align: usize,
  size: usize,
) -> c_int {
  unsafe { HEAP.posix_memalign(out.cast(), align, size) }
}

#[unsafe(no_mangle)]
pub extern "C" fn aligned_alloc(
  align: usize,
  size: usize,
) -> *mut c_void {
  match HEAP.aligned(align, size) {
    Ok(object) => object.as_ptr().cast(),
    Err(err) => {
      platform::set_errno(err.errno());
      std::ptr::null_mut()
    }
  }
}

#[unsafe(no_mangle)]
pub extern "C" fn memalign(
  align: usize,
  size: usize,
) -> *mut c_void {
  aligned_alloc(align, size)
}

#[unsafe(no_mangle)]
pub extern "C" fn valloc(size: usize) -> *mut c_void {
  HEAP.page_aligned(size).cast()
}

/// Like `valloc` with `size` rounded up to whole pages.
#[unsafe(no_mangle)]
pub extern "C" fn pvalloc(size: usize) -> *mut c_void {
  let size = size.checked_next_multiple_of(platform::page_size()).unwrap_or(usize::MAX);

  HEAP.page_aligned(size).cast()
}

/// Any attempt to start a thread ends the process with status `ENOSYS`.
#[unsafe(no_mangle)]
pub extern "C" fn pthread_create(
  _thread: *mut c_void,
  _attr: *const c_void,
  _start: *mut c_void,
  _arg: *mut c_void,
) -> c_int {
  platform::refuse_thread()
}
