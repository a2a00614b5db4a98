//! Slow path logging.
//!
//! With the `trace` feature the macros below forward to [`tracing`]. Without
//! it they vanish, which is what you want when thalloc is the process
//! allocator: a subscriber formatting an event would call back into us.

/// `event!(level, fields..., "message")` forwards to `tracing::level!`.
macro_rules! event {
  ($level:ident, $($arg:tt)+) => {{
    #[cfg(feature = "trace")]
    ::tracing::$level!(target: "thalloc", $($arg)+);
  }};
}
