//! Adelantar - LD_PRELOAD shim that fast-forwards virtual time
//!
//! Some binaries gate a code path behind real elapsed time: they read the
//! monotonic clock, `select` with a long timeout, and only then prompt for
//! input. Adelantar sits between such a process and libc and makes the wait
//! free: `select` timeouts are clamped to a 1 µs poll, the requested
//! duration is banked as a virtual target, and every later clock read
//! reports that target, so the process believes the interval elapsed. When
//! the process announces arrival at the gated path by writing a `*` as the
//! first byte on stdout, the next `select` reports stdin ready immediately
//! and the next stdin `read` is answered with a synthetic newline. The
//! round can repeat indefinitely.
//!
//! # Usage
//!
//! ```text
//! LD_PRELOAD=./target/release/libadelantar.so ./time_gated_binary
//! ```
//!
//! The shim must be preloaded before the process issues its first call to
//! any of the four intercepted symbols (`select`, `clock_gettime`, `read`,
//! `write`); the loader's symbol precedence does the interposition.
//!
//! Build with `--features trace` to get per-call diagnostics on stderr.
//!
//! # Module map
//!
//! - [`state`] - the pure four-state crossing machine and raw time types
//! - [`warp`] - per-operation interception logic over capability traits
//! - [`backend`] - those capability traits plus the real-libc adapters
//! - [`resolver`] - lazy `dlsym(RTLD_NEXT)` cache of the originals
//! - [`hooks`] - the exported `extern "C"` replacement entry points

pub mod backend;
pub mod hooks;
pub mod resolver;
pub mod state;
pub mod warp;
