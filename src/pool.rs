//! Per class list of superblocks and its aggregate counters.

use std::ptr::NonNull;

use crate::{Pointer, size_class::SizeClass, superblock::Header};

/// Every superblock of one size class.
///
/// ```text
///   ClassPool
///   ┌────────────────────┐    ┌────────┐    ┌────────┐    ┌────────┐
///   │ head ──────────────┼──▶ │ newest │──▶ │        │──▶ │ oldest │──▶ None
///   │ free_objects       │    └────────┘    └────────┘    └────────┘
///   │ whole_superblocks  │
///   │ superblocks        │
///   └────────────────────┘
/// ```
///
/// New superblocks are prepended, so scans visit the most recent one first.
/// The counters mirror what the headers say and are kept in step by the
/// engine on every call.
pub(crate) struct ClassPool {
  head: Pointer<Header>,
  /// Sum of `free_count` over all superblocks.
  free_objects: usize,
  /// Superblocks whose slots are all free.
  whole_superblocks: usize,
  superblocks: usize,
}

impl ClassPool {
  pub const fn new() -> Self {
    Self {
      head: None,
      free_objects: 0,
      whole_superblocks: 0,
      superblocks: 0,
    }
  }

  #[inline]
  pub fn has_free_slot(&self) -> bool {
    self.free_objects > 0
  }

  pub fn free_objects(&self) -> usize {
    self.free_objects
  }

  pub fn whole_superblocks(&self) -> usize {
    self.whole_superblocks
  }

  pub fn superblocks(&self) -> usize {
    self.superblocks
  }

  /// Prepends a freshly acquired, whole superblock.
  ///
  /// # Safety
  ///
  /// `sb` must be a live superblock that is on no list.
  pub unsafe fn link(
    &mut self,
    mut sb: NonNull<Header>,
  ) {
    let header = unsafe { sb.as_mut() };

    header.next = self.head;
    self.head = Some(sb);
    self.free_objects += header.free_count as usize;
    self.whole_superblocks += 1;
    self.superblocks += 1;
  }

  /// First superblock with at least one free slot.
  pub unsafe fn find_slot_holder(&self) -> Pointer<Header> {
    unsafe { self.iter().find(|sb| sb.as_ref().free_count > 0) }
  }

  /// First whole superblock and its predecessor on the list.
  pub unsafe fn find_whole(&self) -> Option<(Pointer<Header>, NonNull<Header>)> {
    let mut prev = None;

    for sb in unsafe { self.iter() } {
      if unsafe { sb.as_ref().is_whole() } {
        return Some((prev, sb));
      }
      prev = Some(sb);
    }

    None
  }

  /// Removes a whole superblock found by [`Self::find_whole`] together with
  /// its share of the counters.
  ///
  /// # Safety
  ///
  /// `prev` must be the predecessor of `sb` on this list, `None` when `sb` is
  /// the head.
  pub unsafe fn unlink_whole(
    &mut self,
    prev: Pointer<Header>,
    sb: NonNull<Header>,
  ) {
    let (next, capacity) = unsafe {
      let header = sb.as_ref();
      (header.next, header.capacity())
    };

    match prev {
      Some(mut prev) => unsafe { prev.as_mut().next = next },
      None => self.head = next,
    }

    self.free_objects -= capacity;
    self.whole_superblocks -= 1;
    self.superblocks -= 1;
  }

  /// Bookkeeping for a slot leaving a superblock that was `was_whole`.
  #[inline]
  pub fn take_slot(
    &mut self,
    was_whole: bool,
  ) {
    if was_whole {
      self.whole_superblocks -= 1;
    }
    self.free_objects -= 1;
  }

  /// Bookkeeping for a slot coming back, `becomes_whole` if it was the last
  /// one missing from its superblock.
  #[inline]
  pub fn return_slot(
    &mut self,
    becomes_whole: bool,
  ) {
    if becomes_whole {
      self.whole_superblocks += 1;
    }
    self.free_objects += 1;
  }

  /// Walks the list front to back.
  ///
  /// # Safety
  ///
  /// No superblock may be unlinked or unmapped while the iterator is alive.
  pub unsafe fn iter(&self) -> Superblocks {
    Superblocks { current: self.head }
  }

  /// Detaches the whole list, leaving the pool empty.
  pub fn take_all(&mut self) -> Superblocks {
    let head = self.head.take();
    *self = Self::new();
    Superblocks { current: head }
  }

  pub fn stats(
    &self,
    class: SizeClass,
  ) -> ClassStats {
    ClassStats {
      object_size: class.object_size(),
      superblocks: self.superblocks,
      free_objects: self.free_objects,
      whole_superblocks: self.whole_superblocks,
    }
  }
}

pub(crate) struct Superblocks {
  current: Pointer<Header>,
}

impl Iterator for Superblocks {
  type Item = NonNull<Header>;

  fn next(&mut self) -> Option<Self::Item> {
    let sb = self.current?;
    self.current = unsafe { sb.as_ref().next };
    Some(sb)
  }
}

/// Snapshot of one class pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClassStats {
  pub object_size: usize,
  /// Superblocks currently mapped for this class.
  pub superblocks: usize,
  pub free_objects: usize,
  pub whole_superblocks: usize,
}
