//! Superblocks: naturally aligned 4096-byte regions cut into equal slots.
//!
//! ```text
//!   base (multiple of SUPERBLOCK_SIZE)
//!   ▼
//!   ┌──────────┬──────────┬──────────┬─────┬──────────┐
//!   │  Header  │  slot 1  │  slot 2  │ ... │  slot N  │
//!   │ (slot 0) │          │          │     │          │
//!   └──────────┴──────────┴──────────┴─────┴──────────┘
//!                ▲
//!                └── free_list head of a fresh superblock
//! ```
//!
//! A free slot stores the address of the next free slot in its first word.
//! Once handed out, the slot is plain user memory. Nothing in the slot says
//! which of the two it is: only the free list knows.

use std::{mem, ptr::NonNull};

use crate::{
  Pointer,
  config::{MIN_OBJECT_SIZE, SUPERBLOCK_MASK, SUPERBLOCK_SIZE},
  error::AllocError,
  platform,
  size_class::SizeClass,
};

/// Free list link written at the start of every free slot.
#[repr(C)]
pub(crate) struct Slot {
  pub next: Pointer<Slot>,
}

/// Bytes at the start of a free slot that hold the link.
pub(crate) const LINK_BYTES: usize = mem::size_of::<Slot>();

/// Bookkeeping stored in the first slot of every superblock.
#[repr(C)]
pub(crate) struct Header {
  /// Next superblock of the same class.
  pub next: Pointer<Header>,
  /// First free slot, `None` when every slot is handed out.
  pub free_list: Pointer<Slot>,
  /// Number of slots on `free_list`.
  pub free_count: u16,
  pub class: SizeClass,
}

const _: () = assert!(mem::size_of::<Header>() <= MIN_OBJECT_SIZE);
const _: () = assert!(LINK_BYTES <= MIN_OBJECT_SIZE);

impl Header {
  /// Returns the header of the superblock containing `address`.
  ///
  /// # Safety
  ///
  /// `address` must point into a live superblock, which is the case for any
  /// address handed out by the allocator and not yet released. Anything else
  /// gives back a pointer to memory that is not a header.
  #[inline]
  pub unsafe fn owner_of(address: NonNull<u8>) -> NonNull<Self> {
    let base = address.as_ptr().map_addr(|addr| addr & SUPERBLOCK_MASK);

    unsafe { NonNull::new_unchecked(base.cast()) }
  }

  #[inline]
  pub fn capacity(&self) -> usize {
    self.class.capacity()
  }

  /// Every slot of this superblock is free.
  #[inline]
  pub fn is_whole(&self) -> bool {
    self.free_count as usize == self.capacity()
  }

  /// Unlinks the first free slot.
  ///
  /// # Safety
  ///
  /// The free list must be intact.
  pub unsafe fn pop(&mut self) -> Option<NonNull<u8>> {
    let slot = self.free_list?;

    unsafe { self.free_list = slot.as_ref().next };
    self.free_count -= 1;

    Some(slot.cast())
  }

  /// Links `slot` in front of the free list.
  ///
  /// # Safety
  ///
  /// `slot` must be a slot of this superblock that is not already free.
  pub unsafe fn push(
    &mut self,
    slot: NonNull<u8>,
  ) {
    let slot = slot.cast::<Slot>();

    unsafe { slot.write(Slot { next: self.free_list }) };
    self.free_list = Some(slot);
    self.free_count += 1;
  }

  /// Address of slot `index`, where slot 0 is the header itself.
  ///
  /// # Safety
  ///
  /// `header` must be a live superblock and `index` below its slot count.
  #[cfg(test)]
  pub unsafe fn slot_address(
    header: NonNull<Self>,
    index: usize,
  ) -> NonNull<u8> {
    let class = unsafe { header.as_ref().class };

    unsafe { header.cast::<u8>().add(index * class.object_size()) }
  }
}

/// Maps a superblock for `class` and threads all slots but the header onto
/// its free list.
///
/// The list is built back to front so that slots are handed out in
/// ascending address order. `next` is left empty, linking the superblock
/// into its pool is up to the caller.
pub(crate) unsafe fn acquire(class: SizeClass) -> Result<NonNull<Header>, AllocError> {
  let base =
    unsafe { platform::map_superblock() }.map_err(|errno| AllocError::OutOfMemory { errno })?;
  let header = base.cast::<Header>();

  unsafe {
    header.write(Header {
      next: None,
      free_list: None,
      free_count: 0,
      class,
    });

    let mut cursor = SUPERBLOCK_SIZE;
    let sb = &mut *header.as_ptr();

    for _ in 0..class.capacity() {
      cursor -= class.object_size();
      sb.push(base.add(cursor));
    }
  }

  event!(trace, class = %class, base = ?base, "mapped superblock");

  Ok(header)
}

/// Gives a superblock back to the OS.
///
/// # Safety
///
/// `header` must be unlinked from every pool and none of its slots may be in
/// use.
pub(crate) unsafe fn release(header: NonNull<Header>) -> Result<(), AllocError> {
  let base = header.cast::<u8>();

  unsafe { platform::unmap_superblock(base) }.map_err(|errno| AllocError::Unmap {
    addr: base.as_ptr().addr(),
    errno,
  })
}
