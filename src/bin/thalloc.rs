//! Drives scripted allocation scenarios against a private [`Hoard`] and logs
//! what the allocator does.
//!
//! ```text
//!   $ RUST_LOG=thalloc=trace thalloc churn --size 256 --objects 200 --rounds 3
//! ```

use std::{process::ExitCode, ptr::NonNull};

use clap::{Parser, Subcommand, ValueEnum};
use thalloc::{Config, Hoard, Poison, SizeClass, SUPERBLOCK_SIZE};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "thalloc", version, about = "Exercise the thalloc superblock allocator")]
struct Cli {
  /// Whole superblocks kept per class before returning memory to the OS.
  #[arg(long, env = "THALLOC_RETAIN", default_value_t = thalloc::RETENTION_THRESHOLD)]
  retain: usize,

  /// Disable allocation and free poisoning.
  #[arg(long)]
  no_poison: bool,

  /// Byte written over freshly allocated objects.
  #[arg(long, value_parser = parse_byte, default_value = "0xcd")]
  alloc_poison: u8,

  /// Byte written over released objects.
  #[arg(long, value_parser = parse_byte, default_value = "0xab")]
  free_poison: u8,

  /// Check every superblock after each step.
  #[arg(long)]
  verify: bool,

  #[arg(long, value_enum, default_value_t = LogFormat::Compact)]
  log_format: LogFormat,

  #[command(subcommand)]
  scenario: Scenario,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
  Compact,
  Json,
}

#[derive(Debug, Subcommand)]
enum Scenario {
  /// Allocate and release one object of every class.
  Smoke,
  /// Allocate consecutive objects and report the distance between them.
  Stride {
    #[arg(long, default_value_t = 128)]
    size: usize,
    #[arg(long, default_value_t = 29)]
    count: usize,
  },
  /// Release a batch and allocate it again, checking the addresses match.
  Reuse,
  /// Show the poison patterns after allocation and after release.
  Poison {
    #[arg(long, default_value_t = 128)]
    size: usize,
  },
  /// Repeatedly fill and drain one class to exercise reclamation.
  Churn {
    #[arg(long, default_value_t = 256)]
    size: usize,
    #[arg(long, default_value_t = 100)]
    objects: usize,
    #[arg(long, default_value_t = 3)]
    rounds: usize,
  },
}

fn parse_byte(value: &str) -> Result<u8, String> {
  let parsed = match value.strip_prefix("0x") {
    Some(hex) => u8::from_str_radix(hex, 16),
    None => value.parse(),
  };

  parsed.map_err(|err| format!("{value:?} is not a byte: {err}"))
}

fn init_logging(format: LogFormat) {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
  let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);

  match format {
    LogFormat::Compact => builder.compact().init(),
    LogFormat::Json => builder.json().init(),
  }
}

/// Runs one scenario step by step, optionally verifying after each.
struct Driver {
  hoard: Hoard,
  verify: bool,
}

type Outcome = Result<(), String>;

impl Driver {
  fn allocate(
    &mut self,
    size: usize,
  ) -> Result<NonNull<u8>, String> {
    let object = self.hoard.allocate(size).map_err(|err| err.to_string())?;
    self.check()?;
    Ok(object)
  }

  fn release(
    &mut self,
    object: NonNull<u8>,
  ) -> Outcome {
    if let Err(err) = unsafe { self.hoard.release(object) } {
      warn!(%err, "release reported an error");
    }
    self.check()
  }

  fn check(&self) -> Outcome {
    if self.verify {
      self.hoard.verify().map_err(|err| err.to_string())?;
    }
    Ok(())
  }

  fn smoke(&mut self) -> Outcome {
    let objects = SizeClass::all()
      .map(|class| self.allocate(class.object_size()))
      .collect::<Result<Vec<_>, _>>()?;

    for object in objects {
      self.release(object)?;
    }

    info!("one object per class allocated and released");
    Ok(())
  }

  fn stride(
    &mut self,
    size: usize,
    count: usize,
  ) -> Outcome {
    let mut previous: Option<NonNull<u8>> = None;

    for n in 0..count {
      let object = self.allocate(size)?;
      let addr = object.as_ptr().addr();

      match previous {
        Some(prev) if prev.as_ptr().addr() / SUPERBLOCK_SIZE != addr / SUPERBLOCK_SIZE => {
          info!(n, addr = ?object.as_ptr(), "new superblock");
        }
        Some(prev) => {
          info!(n, addr = ?object.as_ptr(), stride = addr - prev.as_ptr().addr());
        }
        None => info!(n, addr = ?object.as_ptr(), "first object"),
      }

      previous = Some(object);
    }

    Ok(())
  }

  fn reuse(&mut self) -> Outcome {
    let sizes = [32, 64, 128, 128, 128];

    let mut first = sizes.iter().map(|size| self.allocate(*size)).collect::<Result<Vec<_>, _>>()?;
    for object in &first {
      self.release(*object)?;
    }
    let mut second = sizes.iter().map(|size| self.allocate(*size)).collect::<Result<Vec<_>, _>>()?;

    first.sort();
    second.sort();

    if first != second {
      return Err("released objects were not reused".into());
    }

    info!(objects = first.len(), "every released object was handed out again");
    Ok(())
  }

  fn poison(
    &mut self,
    size: usize,
  ) -> Outcome {
    let object = self.allocate(size)?;
    let usable = unsafe { Hoard::usable_size(object) };
    let bytes = unsafe { std::slice::from_raw_parts(object.as_ptr(), usable) };

    info!(first = bytes[0], last = bytes[usable - 1], "after allocate");

    self.release(object)?;
    let bytes = unsafe { std::slice::from_raw_parts(object.as_ptr(), usable) };

    info!(last = bytes[usable - 1], "after release");
    Ok(())
  }

  fn churn(
    &mut self,
    size: usize,
    objects: usize,
    rounds: usize,
  ) -> Outcome {
    let class = SizeClass::for_size(size);

    for round in 0..rounds {
      let batch = (0..objects).map(|_| self.allocate(size)).collect::<Result<Vec<_>, _>>()?;
      let peak = self.hoard.stats().class(class).superblocks;

      for object in batch {
        self.release(object)?;
      }

      let stats = self.hoard.stats();
      let pool = stats.class(class);
      info!(
        round,
        peak,
        kept = pool.superblocks,
        whole = pool.whole_superblocks,
        mapped = stats.mapped,
        unmapped = stats.unmapped,
        "round done"
      );
    }

    Ok(())
  }
}

fn main() -> ExitCode {
  let cli = Cli::parse();
  init_logging(cli.log_format);

  let config = Config::new().with_retention_threshold(cli.retain);
  let config = if cli.no_poison {
    config.without_poison()
  } else {
    config.with_poison(Poison::new(cli.alloc_poison, cli.free_poison))
  };

  if let Err(err) = config.validate() {
    error!(%err, "invalid configuration");
    return ExitCode::FAILURE;
  }

  let mut driver = Driver {
    hoard: Hoard::with_config(config),
    verify: cli.verify,
  };

  let outcome = match cli.scenario {
    Scenario::Smoke => driver.smoke(),
    Scenario::Stride { size, count } => driver.stride(size, count),
    Scenario::Reuse => driver.reuse(),
    Scenario::Poison { size } => driver.poison(size),
    Scenario::Churn { size, objects, rounds } => driver.churn(size, objects, rounds),
  };

  match outcome {
    Ok(()) => ExitCode::SUCCESS,
    Err(err) => {
      error!(%err, "scenario failed");
      ExitCode::FAILURE
    }
  }
}
