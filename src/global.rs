//! Process wide allocator.
//!
//! [`HoardAlloc`] wraps a [`Hoard`] so it can sit in a `static`, either as the
//! `#[global_allocator]` or behind the C symbols of the `interpose` feature.
//! There is no lock anywhere. Instead the first thread that enters becomes
//! the owner and any other thread that enters ends the process before it can
//! touch the pools.

use std::{
  alloc::{GlobalAlloc, Layout},
  cell::UnsafeCell,
  ptr::{self, NonNull},
  sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use crate::{
  config::{Config, MAX_OBJECT_SIZE},
  error::AllocError,
  hoard::{Hoard, Stats},
  platform,
  size_class::SizeClass,
};

const NO_OWNER: usize = 0;

pub struct HoardAlloc {
  hoard: UnsafeCell<Hoard>,
  owner: AtomicUsize,
  busy: AtomicBool,
}

// SAFETY: `enter` lets exactly one thread reach the `Hoard` and terminates the
// process on any other, so the cell is never shared across threads.
unsafe impl Sync for HoardAlloc {}

impl HoardAlloc {
  pub const fn new() -> Self {
    Self::with_config(Config::new())
  }

  pub const fn with_config(config: Config) -> Self {
    Self {
      hoard: UnsafeCell::new(Hoard::with_config(config)),
      owner: AtomicUsize::new(NO_OWNER),
      busy: AtomicBool::new(false),
    }
  }

  /// Runs `f` on the pools after checking the single thread contract.
  ///
  /// A call from a thread other than the owner, or a call made while another
  /// call is still running (an allocation from inside the allocator), ends
  /// the process.
  fn enter<R>(
    &self,
    f: impl FnOnce(&mut Hoard) -> R,
  ) -> R {
    let me = platform::thread_id();

    match self.owner.compare_exchange(NO_OWNER, me, Ordering::Relaxed, Ordering::Relaxed) {
      Ok(_) => {}
      Err(owner) if owner == me => {}
      Err(_) => platform::refuse_thread(),
    }

    if self.busy.swap(true, Ordering::Relaxed) {
      platform::refuse_thread();
    }

    let result = f(unsafe { &mut *self.hoard.get() });
    self.busy.store(false, Ordering::Relaxed);

    result
  }

  /// Allocates `size` bytes, C style: null and `errno` on failure.
  pub fn malloc(
    &self,
    size: usize,
  ) -> *mut u8 {
    unwrap_or_errno(self.enter(|hoard| hoard.allocate(size)))
  }

  /// # Safety
  ///
  /// `object` must be null or a live allocation of this allocator.
  pub unsafe fn free(
    &self,
    object: *mut u8,
  ) {
    let Some(object) = NonNull::new(object) else {
      return;
    };

    if let Err(err) = self.enter(|hoard| unsafe { hoard.release(object) }) {
      platform::set_errno(err.errno());
    }
  }

  /// Zeroed array of `count` elements of `size` bytes.
  pub fn calloc(
    &self,
    count: usize,
    size: usize,
  ) -> *mut u8 {
    let Some(total) = count.checked_mul(size) else {
      platform::set_errno(libc::ENOMEM);
      return ptr::null_mut();
    };

    let object = self.malloc(total);

    if !object.is_null() {
      unsafe { object.write_bytes(0, total) };
    }

    object
  }

  /// Resizes `object`, moving it only when `size` needs another class.
  ///
  /// On failure the original object is left untouched.
  ///
  /// # Safety
  ///
  /// `object` must be null or a live allocation of this allocator.
  pub unsafe fn realloc(
    &self,
    object: *mut u8,
    size: usize,
  ) -> *mut u8 {
    let Some(old) = NonNull::new(object) else {
      return self.malloc(size);
    };

    if size == 0 {
      unsafe { self.free(object) };
      return ptr::null_mut();
    }

    let old_size = unsafe { Hoard::usable_size(old) };

    if size <= MAX_OBJECT_SIZE && SizeClass::for_size(size).object_size() == old_size {
      return object;
    }

    let new = self.malloc(size);

    if !new.is_null() {
      unsafe {
        ptr::copy_nonoverlapping(object, new, old_size.min(size));
        self.free(object);
      }
    }

    new
  }

  /// # Safety
  ///
  /// `object` must be null or a live allocation of this allocator.
  pub unsafe fn usable_size(
    &self,
    object: *mut u8,
  ) -> usize {
    match NonNull::new(object) {
      Some(object) => unsafe { Hoard::usable_size(object) },
      None => 0,
    }
  }

  /// Object of `size` bytes aligned to `align`.
  ///
  /// Slots are aligned to their class size, so asking for the class of
  /// `max(size, align)` is enough for any power of two up to
  /// [`MAX_OBJECT_SIZE`].
  pub fn aligned(
    &self,
    align: usize,
    size: usize,
  ) -> Result<NonNull<u8>, AllocError> {
    if !align.is_power_of_two() || align > MAX_OBJECT_SIZE {
      return Err(AllocError::Misaligned { align });
    }

    self.enter(|hoard| hoard.allocate(size.max(align)))
  }

  /// `valloc` semantics: `size` bytes aligned to a page.
  ///
  /// A page is bigger than the largest class, so on every supported target
  /// this returns null with `errno` set to `ENOMEM` and touches no state.
  pub fn page_aligned(
    &self,
    size: usize,
  ) -> *mut u8 {
    match self.aligned(platform::page_size(), size) {
      Ok(object) => object.as_ptr(),
      Err(_) => {
        platform::set_errno(libc::ENOMEM);
        ptr::null_mut()
      }
    }
  }

  /// `posix_memalign` semantics: returns 0 or an error code, never touches
  /// `errno`.
  ///
  /// # Safety
  ///
  /// `out` must be valid for a pointer write.
  pub unsafe fn posix_memalign(
    &self,
    out: *mut *mut u8,
    align: usize,
    size: usize,
  ) -> libc::c_int {
    if align < size_of::<*mut u8>() {
      return libc::EINVAL;
    }

    match self.aligned(align, size) {
      Ok(object) => {
        unsafe { out.write(object.as_ptr()) };
        0
      }
      Err(err) => err.errno(),
    }
  }

  /// Snapshot of the pools. Counts as an entry for the thread check.
  pub fn stats(&self) -> Stats {
    self.enter(|hoard| hoard.stats())
  }

  pub fn verify(&self) -> Result<(), crate::error::Corruption> {
    self.enter(|hoard| hoard.verify())
  }
}

impl Default for HoardAlloc {
  fn default() -> Self {
    Self::new()
  }
}

fn unwrap_or_errno(result: Result<NonNull<u8>, AllocError>) -> *mut u8 {
  match result {
    Ok(object) => object.as_ptr(),
    Err(err) => {
      platform::set_errno(err.errno());
      ptr::null_mut()
    }
  }
}

unsafe impl GlobalAlloc for HoardAlloc {
  unsafe fn alloc(
    &self,
    layout: Layout,
  ) -> *mut u8 {
    self
      .aligned(layout.align(), layout.size())
      .map_or(ptr::null_mut(), NonNull::as_ptr)
  }

  #[cfg_attr(not(feature = "trace"), allow(unused_variables))]
  unsafe fn dealloc(
    &self,
    object: *mut u8,
    _layout: Layout,
  ) {
    let Some(object) = NonNull::new(object) else {
      return;
    };

    // Already counted in `Stats::unmap_failures`, there is no caller to
    // report it to.
    if let Err(err) = self.enter(|hoard| unsafe { hoard.release(object) }) {
      event!(warn, error = %err, "dealloc could not unmap a superblock");
    }
  }

  unsafe fn realloc(
    &self,
    object: *mut u8,
    layout: Layout,
    new_size: usize,
  ) -> *mut u8 {
    let align = layout.align();
    let fits = new_size <= MAX_OBJECT_SIZE
      && SizeClass::for_size(new_size.max(align)) == SizeClass::for_size(layout.size().max(align));

    if fits {
      return object;
    }

    let new = match self.aligned(layout.align(), new_size) {
      Ok(new) => new.as_ptr(),
      Err(_) => return ptr::null_mut(),
    };

    unsafe {
      ptr::copy_nonoverlapping(object, new, layout.size().min(new_size));
      self.dealloc(object, layout);
    }

    new
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    config::{ALLOC_POISON, SUPERBLOCK_MASK},
    platform::fault::InjectedFault,
  };

  #[test]
  fn test_malloc_and_free() {
    let heap = HoardAlloc::new();
    let object = heap.malloc(100);

    assert!(!object.is_null());
    assert_eq!(unsafe { heap.usable_size(object) }, 128);

    unsafe { heap.free(object) };
    unsafe { heap.free(ptr::null_mut()) };

    assert!(heap.verify().is_ok());
  }

  #[test]
  fn test_malloc_too_large_sets_errno() {
    let heap = HoardAlloc::new();

    platform::set_errno(0);
    assert!(heap.malloc(4096).is_null());
    assert_eq!(platform::errno(), libc::ENOMEM);
    assert_eq!(heap.stats().mapped, 0);
  }

  #[test]
  fn test_calloc_zeroes() {
    let heap = HoardAlloc::new();
    let object = heap.calloc(10, 30);
    let bytes = unsafe { std::slice::from_raw_parts(object, 300) };

    assert!(bytes.iter().all(|byte| *byte == 0));
    assert!(heap.calloc(usize::MAX, 2).is_null());
    assert!(heap.calloc(3, 1000).is_null());
  }

  #[test]
  fn test_realloc_same_class_stays() {
    let heap = HoardAlloc::new();
    let object = heap.malloc(70);

    assert_eq!(unsafe { heap.realloc(object, 128) }, object);
  }

  #[test]
  fn test_realloc_moves_and_copies() {
    let heap = HoardAlloc::new();
    let object = heap.malloc(16);

    unsafe {
      object.copy_from_nonoverlapping(b"sixteen bytes!!!".as_ptr(), 16);

      let grown = heap.realloc(object, 1000);
      assert_ne!(grown, object);
      assert_eq!(std::slice::from_raw_parts(grown, 16), b"sixteen bytes!!!");
      assert_eq!(heap.usable_size(grown), 1024);

      // Failure keeps the original.
      assert!(heap.realloc(grown, 5000).is_null());
      assert_eq!(std::slice::from_raw_parts(grown, 16), b"sixteen bytes!!!");

      assert!(heap.realloc(grown, 0).is_null());
    }

    assert!(heap.verify().is_ok());
  }

  #[test]
  fn test_realloc_null_is_malloc() {
    let heap = HoardAlloc::new();
    let object = unsafe { heap.realloc(ptr::null_mut(), 40) };

    assert!(!object.is_null());
    assert_eq!(unsafe { *object }, ALLOC_POISON);
  }

  #[test]
  fn test_posix_memalign() {
    let heap = HoardAlloc::new();
    let mut out = ptr::null_mut();

    unsafe {
      assert_eq!(heap.posix_memalign(&mut out, 256, 10), 0);
      assert_eq!(out.addr() % 256, 0);
      assert_eq!(heap.usable_size(out), 256);

      assert_eq!(heap.posix_memalign(&mut out, 3, 10), libc::EINVAL);
      assert_eq!(heap.posix_memalign(&mut out, 4096, 10), libc::EINVAL);
      assert_eq!(heap.posix_memalign(&mut out, 64, 3000), libc::ENOMEM);
    }
  }

  #[test]
  fn test_page_aligned_fails_cleanly() {
    let heap = HoardAlloc::new();

    platform::set_errno(0);
    assert!(heap.page_aligned(64).is_null());
    assert_eq!(platform::errno(), libc::ENOMEM);

    platform::set_errno(0);
    assert!(heap.page_aligned(0).is_null());
    assert_eq!(platform::errno(), libc::ENOMEM);

    assert_eq!(heap.stats().mapped, 0);
  }

  #[test]
  fn test_free_reports_unmap_failure() {
    let heap = HoardAlloc::with_config(Config::new().with_retention_threshold(0));
    let object = heap.malloc(2048);
    assert!(!object.is_null());

    let fault = InjectedFault::unmap(libc::EINVAL);
    platform::set_errno(0);
    unsafe { heap.free(object) };
    drop(fault);

    assert_eq!(platform::errno(), libc::ENOMEM);

    let stats = heap.stats();
    assert_eq!(stats.unmap_failures, 1);
    assert_eq!(stats.classes.iter().map(|class| class.superblocks).sum::<usize>(), 0);
    assert!(heap.verify().is_ok());

    let base = object.map_addr(|addr| addr & SUPERBLOCK_MASK);
    unsafe { platform::unmap_superblock(NonNull::new(base).unwrap()).unwrap() };
  }

  #[test]
  fn test_malloc_reports_map_failure() {
    let heap = HoardAlloc::new();

    let fault = InjectedFault::map(libc::EAGAIN);
    platform::set_errno(0);
    assert!(heap.malloc(100).is_null());
    drop(fault);

    assert_eq!(platform::errno(), libc::ENOMEM);
    assert_eq!(heap.stats().mapped, 0);
    assert!(!heap.malloc(100).is_null());
  }

  #[test]
  fn test_global_alloc_layouts() {
    let heap = HoardAlloc::new();

    unsafe {
      let layout = Layout::from_size_align(24, 512).unwrap();
      let object = heap.alloc(layout);
      assert_eq!(object.addr() % 512, 0);

      let grown = GlobalAlloc::realloc(&heap, object, layout, 300);
      assert_eq!(grown, object);

      let grown = GlobalAlloc::realloc(&heap, object, layout, 600);
      assert_ne!(grown, object);
      assert_eq!(grown.addr() % 512, 0);

      heap.dealloc(grown, Layout::from_size_align(600, 512).unwrap());

      assert!(heap.alloc(Layout::from_size_align(8, 4096).unwrap()).is_null());
      assert!(heap.alloc(Layout::from_size_align(4096, 8).unwrap()).is_null());
    }

    assert!(heap.verify().is_ok());
  }

  #[test]
  fn test_owner_is_first_thread() {
    let heap = HoardAlloc::new();

    heap.malloc(32);
    assert_eq!(heap.owner.load(Ordering::Relaxed), platform::thread_id());
  }
}
