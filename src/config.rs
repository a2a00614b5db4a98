//! Layout constants and the runtime [`Config`].
//!
//! The superblock geometry is fixed at compile time because the owner of an
//! object is found by masking its address. Only the retention policy and the
//! poison bytes can be tuned per allocator instance.

use crate::error::ConfigError;

/// Size of one superblock in bytes. Every superblock is aligned to this value.
pub const SUPERBLOCK_SIZE: usize = 4096;

/// Clears the offset bits of an address, leaving the base of its superblock.
pub const SUPERBLOCK_MASK: usize = !(SUPERBLOCK_SIZE - 1);

/// Smallest object handed out. Smaller requests are rounded up.
pub const MIN_OBJECT_SIZE: usize = 32;

/// Largest object handed out. Bigger requests fail.
pub const MAX_OBJECT_SIZE: usize = 2048;

/// Whole superblocks kept per class before the surplus goes back to the OS.
pub const RETENTION_THRESHOLD: usize = 2;

/// Written over every object right before it is returned to the caller.
pub const ALLOC_POISON: u8 = 0xcd;

/// Written over every object when it is released.
pub const FREE_POISON: u8 = 0xab;

const _: () = assert!(SUPERBLOCK_SIZE.is_power_of_two());
const _: () = assert!(MIN_OBJECT_SIZE.is_power_of_two());
const _: () = assert!(MAX_OBJECT_SIZE < SUPERBLOCK_SIZE);

/// Byte patterns used to poison objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Poison {
  /// Pattern for freshly allocated objects (uninitialized reads).
  pub alloc: u8,
  /// Pattern for released objects (use after free).
  pub free: u8,
}

impl Poison {
  pub const fn new(
    alloc: u8,
    free: u8,
  ) -> Self {
    Self { alloc, free }
  }
}

impl Default for Poison {
  fn default() -> Self {
    Self::new(ALLOC_POISON, FREE_POISON)
  }
}

/// Tunables of a single allocator instance.
///
/// Every constructor is `const` so a configured allocator can be placed in a
/// `static`:
///
/// ```rust
/// use thalloc::{Config, HoardAlloc};
///
/// static HEAP: HoardAlloc = HoardAlloc::with_config(Config::new().with_retention_threshold(4));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
  /// Maximum whole superblocks retained per size class.
  pub retention_threshold: usize,
  /// Poison patterns, `None` disables poisoning entirely.
  pub poison: Option<Poison>,
}

impl Config {
  pub const fn new() -> Self {
    Self {
      retention_threshold: RETENTION_THRESHOLD,
      poison: Some(Poison::new(ALLOC_POISON, FREE_POISON)),
    }
  }

  pub const fn with_retention_threshold(
    mut self,
    threshold: usize,
  ) -> Self {
    self.retention_threshold = threshold;
    self
  }

  pub const fn with_poison(
    mut self,
    poison: Poison,
  ) -> Self {
    self.poison = Some(poison);
    self
  }

  pub const fn without_poison(mut self) -> Self {
    self.poison = None;
    self
  }

  /// The poison byte used for both patterns, if they are the same. A shared
  /// byte makes use after free indistinguishable from uninitialized reads.
  pub const fn poison_collision(&self) -> Option<u8> {
    match self.poison {
      Some(Poison { alloc, free }) if alloc == free => Some(alloc),
      _ => None,
    }
  }

  /// Checks that the configuration can be used.
  ///
  /// Allocator constructors panic on a configuration that fails this check,
  /// so values coming from outside the program should go through here first.
  pub fn validate(&self) -> Result<(), ConfigError> {
    match self.poison_collision() {
      Some(byte) => Err(ConfigError::PoisonCollision(byte)),
      None => Ok(()),
    }
  }
}

impl Default for Config {
  fn default() -> Self {
    Self::new()
  }
}
