//! Power of two size classes.

use std::fmt;

use crate::config::{MAX_OBJECT_SIZE, MIN_OBJECT_SIZE, SUPERBLOCK_SIZE};

/// One of the object sizes served by the allocator, 32 through 2048 bytes.
///
/// ```text
///   index:         0    1    2    3    4     5     6
///   object size:  32   64  128  256  512  1024  2048
///   slots / sb:  128   64   32   16    8     4     2
///   capacity:    127   63   31   15    7     3     1   (first slot is the header)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct SizeClass(u8);

impl SizeClass {
  /// Number of classes.
  pub const COUNT: usize = (MAX_OBJECT_SIZE / MIN_OBJECT_SIZE).trailing_zeros() as usize + 1;

  pub const SMALLEST: Self = Self(0);

  pub const LARGEST: Self = Self(Self::COUNT as u8 - 1);

  /// Smallest class whose objects can hold `size` bytes.
  ///
  /// Sizes above [`MAX_OBJECT_SIZE`] map to the largest class. Callers reject
  /// those before classifying.
  ///
  /// ```rust
  /// use thalloc::SizeClass;
  ///
  /// assert_eq!(SizeClass::for_size(1).object_size(), 32);
  /// assert_eq!(SizeClass::for_size(33).object_size(), 64);
  /// assert_eq!(SizeClass::for_size(2048).object_size(), 2048);
  /// ```
  pub const fn for_size(size: usize) -> Self {
    if size <= MIN_OBJECT_SIZE {
      return Self::SMALLEST;
    }

    // Bits needed to represent `size - 1` is the exponent of the next power
    // of two at or above `size`.
    let bits = (usize::BITS - (size - 1).leading_zeros()) as usize;
    let index = bits - MIN_OBJECT_SIZE.trailing_zeros() as usize;

    if index >= Self::COUNT {
      Self::LARGEST
    } else {
      Self(index as u8)
    }
  }

  pub const fn from_index(index: usize) -> Option<Self> {
    if index < Self::COUNT {
      Some(Self(index as u8))
    } else {
      None
    }
  }

  #[inline]
  pub const fn index(self) -> usize {
    self.0 as usize
  }

  #[inline]
  pub const fn object_size(self) -> usize {
    MIN_OBJECT_SIZE << self.0
  }

  /// Object slots in one superblock, header slot included.
  #[inline]
  pub const fn slots(self) -> usize {
    SUPERBLOCK_SIZE / self.object_size()
  }

  /// Objects one superblock of this class can hand out.
  #[inline]
  pub const fn capacity(self) -> usize {
    self.slots() - 1
  }

  pub fn all() -> impl Iterator<Item = Self> {
    (0..Self::COUNT as u8).map(Self)
  }
}

impl fmt::Display for SizeClass {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>,
  ) -> fmt::Result {
    write!(f, "{}B", self.object_size())
  }
}
