use std::{io::Read, ptr::NonNull};

use thalloc::{Hoard, SizeClass, Stats};

/// Waits until the user presses ENTER.
/// Useful when you want to inspect the mappings with `pmap`, `/proc/PID/maps`
/// or `gdb` between steps.
fn block_until_enter_pressed() {
  println!("\n>>> Press ENTER to continue...");
  let _ = std::io::stdin().bytes().next();
}

fn print_alloc(
  size: usize,
  object: NonNull<u8>,
) {
  let addr = object.as_ptr().addr();

  println!(
    "Allocated {} bytes, address = {:#x}, superblock = {:#x}, slot = {}",
    size,
    addr,
    addr & !(thalloc::SUPERBLOCK_SIZE - 1),
    (addr % thalloc::SUPERBLOCK_SIZE) / SizeClass::for_size(size).object_size(),
  );
}

fn print_class(
  label: &str,
  stats: &Stats,
  class: SizeClass,
) {
  let pool = stats.class(class);

  println!(
    "[{}] PID = {}, class {}: superblocks = {}, free = {}, whole = {}, mapped = {}, unmapped = {}",
    label,
    std::process::id(),
    class,
    pool.superblocks,
    pool.free_objects,
    pool.whole_superblocks,
    stats.mapped,
    stats.unmapped,
  );
}

fn main() {
  let mut hoard = Hoard::new();
  let class = SizeClass::for_size(512);

  print_class("start", &hoard.stats(), class);
  block_until_enter_pressed();

  // --------------------------------------------------------------------
  // 1) The first 512-byte object maps a superblock. 4096 / 512 = 8 slots,
  //    the first one holds the header, 7 are left for objects.
  // --------------------------------------------------------------------
  let first = hoard.allocate(500).unwrap();
  println!("\n[1] Allocate 500 bytes");
  print_alloc(500, first);
  print_class("1", &hoard.stats(), class);

  let bytes = unsafe { std::slice::from_raw_parts(first.as_ptr(), 512) };
  println!("[1] Fresh object is poisoned with {:#04x}", bytes[0]);

  block_until_enter_pressed();

  // --------------------------------------------------------------------
  // 2) Fill the superblock and one more: the eighth object needs a second
  //    superblock.
  // --------------------------------------------------------------------
  let mut objects = vec![first];
  println!("\n[2] Allocate 7 more objects");
  for _ in 0..7 {
    let object = hoard.allocate(512).unwrap();
    print_alloc(512, object);
    objects.push(object);
  }
  print_class("2", &hoard.stats(), class);

  block_until_enter_pressed();

  // --------------------------------------------------------------------
  // 3) Release the first object and allocate again: the slot comes back.
  // --------------------------------------------------------------------
  unsafe { hoard.release(first).unwrap() };
  let again = hoard.allocate(512).unwrap();
  println!("\n[3] Release and allocate again");
  print_alloc(512, again);
  println!(
    "[3] again == first? {}",
    if again == first {
      "Yes, the released slot was reused"
    } else {
      "No, it came from somewhere else"
    }
  );
  objects[0] = again;

  block_until_enter_pressed();

  // --------------------------------------------------------------------
  // 4) Fill 4 superblocks, then release everything. Only 2 whole
  //    superblocks stay mapped, the rest go back to the OS.
  // --------------------------------------------------------------------
  for _ in objects.len()..4 * class.capacity() {
    objects.push(hoard.allocate(512).unwrap());
  }
  print_class("4 before release", &hoard.stats(), class);
  block_until_enter_pressed();

  for object in objects {
    unsafe { hoard.release(object).unwrap() };
  }
  print_class("4 after release", &hoard.stats(), class);

  block_until_enter_pressed();

  // --------------------------------------------------------------------
  // 5) Anything above 2048 bytes is refused.
  // --------------------------------------------------------------------
  println!("\n[5] Allocate 4096 bytes: {:?}", hoard.allocate(4096));

  println!("\n[6] End of example. Dropping the Hoard unmaps the remaining superblocks.");
}
