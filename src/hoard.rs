use std::ptr::NonNull;

use crate::{
  config::{Config, MAX_OBJECT_SIZE, SUPERBLOCK_SIZE},
  error::{AllocError, Corruption},
  pool::{ClassPool, ClassStats},
  size_class::SizeClass,
  superblock::{self, Header},
};

/// Allocator context: one class pool per size class.
///
/// A `Hoard` is plain single-threaded state with no locking. It holds raw
/// pointers, so it is neither `Send` nor `Sync` and stays on the thread that
/// created it. For a process wide allocator living in a `static`, see
/// [`crate::HoardAlloc`].
pub struct Hoard {
  pools: [ClassPool; SizeClass::COUNT],
  config: Config,
  mapped: usize,
  unmapped: usize,
  unmap_failures: usize,
}

/// Snapshot returned by [`Hoard::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stats {
  pub classes: [ClassStats; SizeClass::COUNT],
  /// Superblocks mapped since creation.
  pub mapped: usize,
  /// Superblocks reclaimed since creation, including failed unmaps.
  pub unmapped: usize,
  /// Reclaimed superblocks the OS refused to unmap.
  pub unmap_failures: usize,
}

impl Stats {
  pub fn class(
    &self,
    class: SizeClass,
  ) -> &ClassStats {
    &self.classes[class.index()]
  }
}

impl Hoard {
  pub const fn new() -> Self {
    Self::with_config(Config::new())
  }

  /// # Panics
  ///
  /// When both poison bytes are equal (see [`Config::validate`]). In a
  /// `static` initializer this is a compile time error.
  pub const fn with_config(config: Config) -> Self {
    assert!(
      config.poison_collision().is_none(),
      "alloc and free poison must be different bytes"
    );

    Self {
      pools: [const { ClassPool::new() }; SizeClass::COUNT],
      config,
      mapped: 0,
      unmapped: 0,
      unmap_failures: 0,
    }
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  /// Hands out an object of at least `size` bytes.
  ///
  /// The object is aligned to its class size and filled with the allocation
  /// poison. Fails without touching any state when `size` is above
  /// [`MAX_OBJECT_SIZE`], and without linking anything when the OS refuses a
  /// new superblock.
  pub fn allocate(
    &mut self,
    size: usize,
  ) -> Result<NonNull<u8>, AllocError> {
    if size > MAX_OBJECT_SIZE {
      event!(debug, size, "refused oversized request");
      return Err(AllocError::TooLarge { size });
    }

    let class = SizeClass::for_size(size);
    let pool = &mut self.pools[class.index()];

    if !pool.has_free_slot() {
      let sb = unsafe { superblock::acquire(class)? };
      unsafe { pool.link(sb) };
      self.mapped += 1;
    }

    let Some(mut holder) = (unsafe { pool.find_slot_holder() }) else {
      corrupted();
    };

    let header = unsafe { holder.as_mut() };
    let was_whole = header.is_whole();

    let Some(object) = (unsafe { header.pop() }) else {
      corrupted();
    };

    pool.take_slot(was_whole);

    if let Some(poison) = self.config.poison {
      unsafe { object.write_bytes(poison.alloc, class.object_size()) };
    }

    Ok(object)
  }

  /// Takes back an object returned by [`Self::allocate`].
  ///
  /// The object is filled with the free poison (its first word then holds the
  /// free list link) and pushed back on its superblock. Reclamation may follow;
  /// the only error this returns is an unmap failure during that step.
  ///
  /// # Safety
  ///
  /// `object` must come from `allocate` on this instance and must not have
  /// been released since. Nothing is validated.
  pub unsafe fn release(
    &mut self,
    object: NonNull<u8>,
  ) -> Result<(), AllocError> {
    let mut owner = unsafe { Header::owner_of(object) };
    let header = unsafe { owner.as_mut() };
    let class = header.class;
    let becomes_whole = header.free_count as usize + 1 == header.capacity();

    if let Some(poison) = self.config.poison {
      unsafe { object.write_bytes(poison.free, class.object_size()) };
    }

    unsafe { header.push(object) };
    self.pools[class.index()].return_slot(becomes_whole);

    self.reclaim(class)
  }

  /// Unmaps whole superblocks of `class` until at most the retention
  /// threshold of them is left.
  ///
  /// An unmap failure does not stop the loop and does not restore the
  /// bookkeeping: the superblock is already off the list and its slots are
  /// no longer counted, so the region stays mapped with nothing tracking it.
  /// The failure is counted in [`Stats::unmap_failures`] and the last one is
  /// returned.
  fn reclaim(
    &mut self,
    class: SizeClass,
  ) -> Result<(), AllocError> {
    let threshold = self.config.retention_threshold;
    let pool = &mut self.pools[class.index()];
    let mut result = Ok(());

    while pool.whole_superblocks() > threshold {
      let Some((prev, sb)) = (unsafe { pool.find_whole() }) else {
        corrupted();
      };

      unsafe { pool.unlink_whole(prev, sb) };
      self.unmapped += 1;

      if let Err(err) = unsafe { superblock::release(sb) } {
        event!(warn, class = %class, error = %err, "superblock left mapped");
        self.unmap_failures += 1;
        result = Err(err);
      }
    }

    event!(
      trace,
      class = %class,
      whole = pool.whole_superblocks(),
      free = pool.free_objects(),
      "reclaimed"
    );

    result
  }

  /// Bytes usable at `object`, which is the object size of its class.
  ///
  /// # Safety
  ///
  /// Same contract as [`Self::release`].
  pub unsafe fn usable_size(object: NonNull<u8>) -> usize {
    unsafe { Header::owner_of(object).as_ref().class.object_size() }
  }

  pub fn stats(&self) -> Stats {
    let mut stats = Stats {
      mapped: self.mapped,
      unmapped: self.unmapped,
      unmap_failures: self.unmap_failures,
      ..Stats::default()
    };

    for class in SizeClass::all() {
      stats.classes[class.index()] = self.pools[class.index()].stats(class);
    }

    stats
  }

  /// Walks every superblock and checks that counters, headers and free lists
  /// agree.
  pub fn verify(&self) -> Result<(), Corruption> {
    for class in SizeClass::all() {
      let pool = &self.pools[class.index()];
      let object_size = class.object_size();
      let mut superblocks = 0;
      let mut free_objects = 0;
      let mut whole = 0;

      for sb in unsafe { pool.iter() } {
        let header = unsafe { sb.as_ref() };
        let addr = sb.as_ptr().addr();

        if header.class != class {
          return Err(Corruption::ForeignClass { addr, object_size });
        }

        let mut listed = 0;
        let mut cursor = header.free_list;

        while let Some(slot) = cursor {
          let offset = slot.as_ptr().addr().wrapping_sub(addr);

          if offset < object_size || offset >= SUPERBLOCK_SIZE || offset % object_size != 0 {
            return Err(Corruption::StraySlot {
              addr,
              slot: slot.as_ptr().addr(),
            });
          }

          listed += 1;
          if listed > header.capacity() {
            break;
          }
          cursor = unsafe { slot.as_ref().next };
        }

        if listed != header.free_count as usize {
          return Err(Corruption::FreeList {
            addr,
            recorded: header.free_count as usize,
            actual: listed,
          });
        }

        superblocks += 1;
        free_objects += listed;
        whole += header.is_whole() as usize;
      }

      if superblocks != pool.superblocks() {
        return Err(Corruption::SuperblockCount {
          object_size,
          recorded: pool.superblocks(),
          actual: superblocks,
        });
      }

      if free_objects != pool.free_objects() {
        return Err(Corruption::FreeObjects {
          object_size,
          recorded: pool.free_objects(),
          actual: free_objects,
        });
      }

      if whole != pool.whole_superblocks() {
        return Err(Corruption::WholeSuperblocks {
          object_size,
          recorded: pool.whole_superblocks(),
          actual: whole,
        });
      }

      if whole > self.config.retention_threshold {
        return Err(Corruption::RetentionExceeded {
          object_size,
          whole,
          threshold: self.config.retention_threshold,
        });
      }
    }

    Ok(())
  }
}

impl Default for Hoard {
  fn default() -> Self {
    Self::new()
  }
}

impl Drop for Hoard {
  #[cfg_attr(not(feature = "trace"), allow(unused_variables))]
  fn drop(&mut self) {
    for pool in &mut self.pools {
      for sb in pool.take_all() {
        if let Err(err) = unsafe { superblock::release(sb) } {
          event!(warn, error = %err, "superblock left mapped on drop");
        }
      }
    }
  }
}

/// A slot was promised by the counters but the lists do not have it. Handing
/// out anything now could alias live memory.
#[cold]
fn corrupted() -> ! {
  std::process::abort()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    config::{ALLOC_POISON, FREE_POISON, Poison},
    platform::fault::InjectedFault,
    superblock::LINK_BYTES,
  };

  fn bytes<'a>(
    object: NonNull<u8>,
    len: usize,
  ) -> &'a [u8] {
    unsafe { std::slice::from_raw_parts(object.as_ptr(), len) }
  }

  #[test]
  fn test_too_large_touches_nothing() {
    let mut hoard = Hoard::new();
    let keep = hoard.allocate(100).unwrap();
    let before = hoard.stats();

    assert_eq!(hoard.allocate(2049), Err(AllocError::TooLarge { size: 2049 }));
    assert_eq!(hoard.allocate(usize::MAX), Err(AllocError::TooLarge { size: usize::MAX }));
    assert_eq!(hoard.stats(), before);

    unsafe { hoard.release(keep).unwrap() };
  }

  #[test]
  fn test_first_allocation_maps_superblock() {
    let mut hoard = Hoard::new();
    let object = hoard.allocate(1).unwrap();
    let stats = hoard.stats();
    let small = stats.class(SizeClass::SMALLEST);

    assert_eq!(stats.mapped, 1);
    assert_eq!(small.superblocks, 1);
    assert_eq!(small.free_objects, 126);
    assert_eq!(small.whole_superblocks, 0);
    assert_eq!(object.as_ptr().addr() % 32, 0);
    assert!(hoard.verify().is_ok());
  }

  #[test]
  fn test_zero_size_is_smallest_class() {
    let mut hoard = Hoard::new();
    let object = hoard.allocate(0).unwrap();

    assert_eq!(unsafe { Hoard::usable_size(object) }, 32);
  }

  #[test]
  fn test_objects_are_class_aligned() {
    let mut hoard = Hoard::new();

    for class in SizeClass::all() {
      let object = hoard.allocate(class.object_size()).unwrap();

      assert_eq!(object.as_ptr().addr() % class.object_size(), 0);
      assert_eq!(unsafe { Hoard::usable_size(object) }, class.object_size());
    }
  }

  #[test]
  fn test_release_is_lifo() {
    let mut hoard = Hoard::new();
    let a = hoard.allocate(128).unwrap();
    let b = hoard.allocate(128).unwrap();

    unsafe {
      hoard.release(a).unwrap();
      hoard.release(b).unwrap();
    }

    assert_eq!(hoard.allocate(128).unwrap(), b);
    assert_eq!(hoard.allocate(128).unwrap(), a);
  }

  #[test]
  fn test_whole_counter_follows_superblock() {
    let mut hoard = Hoard::new();
    let class = SizeClass::LARGEST;

    let object = hoard.allocate(2048).unwrap();
    assert_eq!(hoard.stats().class(class).whole_superblocks, 0);

    unsafe { hoard.release(object).unwrap() };
    assert_eq!(hoard.stats().class(class).whole_superblocks, 1);
    assert_eq!(hoard.stats().class(class).free_objects, 1);
    assert!(hoard.verify().is_ok());
  }

  #[test]
  fn test_largest_class_holds_one_object() {
    let mut hoard = Hoard::new();
    let a = hoard.allocate(2000).unwrap();
    let b = hoard.allocate(2000).unwrap();

    assert_ne!(unsafe { Header::owner_of(a) }, unsafe { Header::owner_of(b) });
    assert_eq!(hoard.stats().class(SizeClass::LARGEST).superblocks, 2);
  }

  #[test]
  fn test_reclaim_keeps_threshold() {
    let mut hoard = Hoard::new();
    let class = SizeClass::LARGEST;
    let objects: Vec<_> = (0..5).map(|_| hoard.allocate(2048).unwrap()).collect();

    assert_eq!(hoard.stats().class(class).superblocks, 5);

    for object in objects {
      unsafe { hoard.release(object).unwrap() };
      assert!(hoard.stats().class(class).whole_superblocks <= 2);
    }

    let stats = hoard.stats();
    assert_eq!(stats.class(class).whole_superblocks, 2);
    assert_eq!(stats.class(class).superblocks, 2);
    assert_eq!(stats.class(class).free_objects, 2);
    assert_eq!(stats.unmapped, 3);
    assert_eq!(stats.unmap_failures, 0);
    assert!(hoard.verify().is_ok());
  }

  #[test]
  fn test_reclaim_with_zero_threshold() {
    let mut hoard = Hoard::with_config(Config::new().with_retention_threshold(0));
    let object = hoard.allocate(500).unwrap();

    unsafe { hoard.release(object).unwrap() };

    let stats = hoard.stats();
    assert_eq!(stats.class(SizeClass::for_size(500)).superblocks, 0);
    assert_eq!(stats.mapped, 1);
    assert_eq!(stats.unmapped, 1);
    assert!(hoard.verify().is_ok());
  }

  #[test]
  fn test_allocation_poison() {
    let mut hoard = Hoard::new();
    let object = hoard.allocate(128).unwrap();

    assert!(bytes(object, 128).iter().all(|byte| *byte == ALLOC_POISON));
  }

  #[test]
  fn test_free_poison() {
    let mut hoard = Hoard::new();
    let keep = hoard.allocate(128).unwrap();
    let object = hoard.allocate(128).unwrap();

    unsafe { hoard.release(object).unwrap() };

    // The first word is the free list link.
    assert!(bytes(object, 128)[LINK_BYTES..].iter().all(|byte| *byte == FREE_POISON));

    unsafe { hoard.release(keep).unwrap() };
  }

  #[test]
  fn test_custom_and_disabled_poison() {
    let mut hoard = Hoard::with_config(Config::new().with_poison(Poison::new(0x11, 0x22)));
    let object = hoard.allocate(64).unwrap();
    assert!(bytes(object, 64).iter().all(|byte| *byte == 0x11));

    let mut hoard = Hoard::with_config(Config::new().without_poison());
    let object = hoard.allocate(64).unwrap();
    // Fresh mappings are zeroed, apart from the link word nothing was written.
    assert!(bytes(object, 64)[LINK_BYTES..].iter().all(|byte| *byte == 0));
  }

  #[test]
  fn test_drop_returns_superblocks() {
    let mut hoard = Hoard::new();

    for class in SizeClass::all() {
      hoard.allocate(class.object_size()).unwrap();
    }

    assert_eq!(hoard.stats().mapped, SizeClass::COUNT);
    drop(hoard);
  }

  #[test]
  fn test_map_failure_links_nothing() {
    let mut hoard = Hoard::new();
    let class = SizeClass::LARGEST;
    let full = hoard.allocate(2048).unwrap();
    let before = hoard.stats();

    let fault = InjectedFault::map(libc::ENOMEM);
    assert_eq!(hoard.allocate(2048), Err(AllocError::OutOfMemory { errno: libc::ENOMEM }));
    assert_eq!(hoard.allocate(32), Err(AllocError::OutOfMemory { errno: libc::ENOMEM }));
    drop(fault);

    assert_eq!(hoard.stats(), before);
    assert_eq!(hoard.stats().class(class).superblocks, 1);
    assert_eq!(hoard.stats().class(SizeClass::SMALLEST).superblocks, 0);
    assert!(hoard.verify().is_ok());

    // The pool recovers once the OS hands out memory again.
    let next = hoard.allocate(2048).unwrap();
    assert_eq!(hoard.stats().mapped, 2);

    unsafe {
      hoard.release(next).unwrap();
      hoard.release(full).unwrap();
    }
  }

  #[test]
  fn test_unmap_failure_is_counted() {
    let mut hoard = Hoard::with_config(Config::new().with_retention_threshold(0));
    let class = SizeClass::LARGEST;
    let object = hoard.allocate(2048).unwrap();
    let owner = unsafe { Header::owner_of(object) };

    let fault = InjectedFault::unmap(libc::EINVAL);
    let result = unsafe { hoard.release(object) };
    drop(fault);

    assert_eq!(
      result,
      Err(AllocError::Unmap {
        addr: owner.as_ptr().addr(),
        errno: libc::EINVAL,
      })
    );
    assert_eq!(result.unwrap_err().errno(), libc::ENOMEM);

    let stats = hoard.stats();
    assert_eq!(stats.class(class).superblocks, 0);
    assert_eq!(stats.class(class).whole_superblocks, 0);
    assert_eq!(stats.class(class).free_objects, 0);
    assert_eq!(stats.unmapped, 1);
    assert_eq!(stats.unmap_failures, 1);
    assert!(hoard.verify().is_ok());

    // Nothing tracks the region any more, a new object needs a new mapping.
    let again = hoard.allocate(2048).unwrap();
    assert_ne!(unsafe { Header::owner_of(again) }, owner);
    assert_eq!(hoard.stats().mapped, 2);

    unsafe {
      hoard.release(again).unwrap();
      superblock::release(owner).unwrap();
    }
  }

  #[test]
  fn test_drop_survives_unmap_failure() {
    let mut hoard = Hoard::new();
    let object = hoard.allocate(2048).unwrap();
    let owner = unsafe { Header::owner_of(object) };

    let fault = InjectedFault::unmap(libc::EINVAL);
    drop(hoard);
    drop(fault);

    unsafe { superblock::release(owner).unwrap() };
  }

  #[test]
  #[should_panic(expected = "poison must be different")]
  fn test_equal_poison_bytes_rejected() {
    Hoard::with_config(Config::new().with_poison(Poison::new(0x5a, 0x5a)));
  }
}
