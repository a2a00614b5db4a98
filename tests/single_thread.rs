//! A second thread reaching the allocator must take the whole process down.
//!
//! The refusal exits the process, so the scenarios run in a child: the test
//! binary re-executes itself with `THALLOC_CHILD` set and only the named
//! ignored test runs there.

use std::{env, process::Command, thread};

use thalloc::{HoardAlloc, THREAD_REFUSED_STATUS};

const CHILD: &str = "THALLOC_CHILD";

fn run_child(test: &str) -> std::process::ExitStatus {
  let exe = env::current_exe().unwrap();

  Command::new(exe)
    .args([test, "--exact", "--ignored", "--nocapture", "--test-threads=1"])
    .env(CHILD, "1")
    .status()
    .unwrap()
}

#[test]
#[ignore = "runs in a child process"]
fn child_second_thread_allocates() {
  if env::var_os(CHILD).is_none() {
    return;
  }

  static HEAP: HoardAlloc = HoardAlloc::new();

  let object = HEAP.malloc(64);
  assert!(!object.is_null());

  thread::spawn(|| {
    HEAP.malloc(64);
  })
  .join()
  .unwrap();

  // Not reached: the spawned thread ended the process.
  std::process::exit(0);
}

#[test]
#[ignore = "runs in a child process"]
fn child_owner_keeps_working() {
  if env::var_os(CHILD).is_none() {
    return;
  }

  static HEAP: HoardAlloc = HoardAlloc::new();

  for size in [1, 100, 2048] {
    let object = HEAP.malloc(size);
    assert!(!object.is_null());
    unsafe { HEAP.free(object) };
  }

  assert!(HEAP.verify().is_ok());
}

#[test]
fn second_thread_terminates_process() {
  let status = run_child("child_second_thread_allocates");

  assert_eq!(status.code(), Some(THREAD_REFUSED_STATUS));
}

#[test]
fn owner_thread_is_not_refused() {
  let status = run_child("child_owner_keeps_working");

  assert!(status.success());
}
