//! Interposed libc entry points
//!
//! The four `#[no_mangle]` functions below are what `LD_PRELOAD` binds in
//! place of libc's `select`, `clock_gettime`, `read` and `write`. Each one
//! translates its raw C arguments into the safe driver calls of
//! [`crate::warp::WarpShim`] and forwards the driver's answer back through
//! the C ABI.
//!
//! Two process-wide pieces live here:
//!
//! - the shared [`WarpShim`] instance behind a `Mutex` (the original
//!   protocol assumes a single logical thread; the lock makes concurrent
//!   callers serialize instead of race);
//! - a per-thread reentrancy guard. Anything the shim itself does that loops
//!   back into one of these symbols (the tracing subscriber writing to
//!   stderr is the usual case) must not re-enter the state machine or the
//!   lock, so nested calls delegate straight to the resolved originals.
//!
//! No panic may escape these functions: every Rust-side path is panic-free
//! by construction (no allocation/indexing on the hot path, poisoned locks
//! are ignored).

use crate::backend::{RealInput, RealOutput, RealTime, RealWait};
use crate::resolver;
use crate::state::WaitTimeout;
use crate::warp::{WaitDisposition, WarpShim};
use libc::{c_int, c_void, clockid_t, fd_set, size_t, ssize_t, timespec, timeval};
use std::cell::Cell;
use std::slice;
use std::sync::{Mutex, MutexGuard, PoisonError};

static SHIM: Mutex<WarpShim> = Mutex::new(WarpShim::new());

thread_local! {
    static IN_HOOK: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as inside an intercepted call for its lifetime.
struct HookGuard;

impl HookGuard {
    /// Claim the guard, or `None` when this thread is already inside a hook.
    fn enter() -> Option<Self> {
        IN_HOOK.with(|flag| {
            if flag.get() {
                None
            } else {
                flag.set(true);
                Some(HookGuard)
            }
        })
    }
}

impl Drop for HookGuard {
    fn drop(&mut self) {
        IN_HOOK.with(|flag| flag.set(false));
    }
}

fn shim() -> MutexGuard<'static, WarpShim> {
    SHIM.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Install the stderr trace subscriber once, on the first intercepted call.
#[cfg(feature = "trace")]
fn init_trace() {
    use tracing_subscriber::EnvFilter;

    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into()),
            )
            .with_writer(std::io::stderr)
            .try_init();
    });
}

#[cfg(not(feature = "trace"))]
fn init_trace() {}

/// Replacement `select(2)`.
///
/// # Safety
///
/// Called by the traced process in place of libc's `select`; all pointer
/// arguments must follow the `select(2)` contract (fd-set pointers NULL or
/// valid, `timeout` NULL or pointing at a valid `timeval`).
#[no_mangle]
pub unsafe extern "C" fn select(
    nfds: c_int,
    readfds: *mut fd_set,
    writefds: *mut fd_set,
    exceptfds: *mut fd_set,
    timeout: *mut timeval,
) -> c_int {
    let Some(_guard) = HookGuard::enter() else {
        // SAFETY: pure delegation, caller's contract passes through.
        return unsafe { resolver::real_select()(nfds, readfds, writefds, exceptfds, timeout) };
    };
    init_trace();

    let requested = if timeout.is_null() {
        None
    } else {
        // SAFETY: non-null timeout points at a valid timeval per the caller
        // contract; the value is only read, never written back.
        Some(WaitTimeout::from(unsafe { *timeout }))
    };
    let mut mux = RealWait {
        nfds,
        readfds,
        writefds,
        exceptfds,
        timeout,
    };

    match shim().wait(&mut mux, requested) {
        WaitDisposition::InputReady => {
            if !readfds.is_null() {
                // SAFETY: non-null readfds points at a valid fd_set.
                unsafe { libc::FD_SET(libc::STDIN_FILENO, readfds) };
            }
            1
        }
        WaitDisposition::Waited(res) => res,
    }
}

/// Replacement `clock_gettime(2)`.
///
/// # Safety
///
/// Called in place of libc's `clock_gettime`; `tp` must be NULL or point at
/// a writable `timespec`.
#[no_mangle]
pub unsafe extern "C" fn clock_gettime(clk_id: clockid_t, tp: *mut timespec) -> c_int {
    let Some(_guard) = HookGuard::enter() else {
        // SAFETY: pure delegation.
        return unsafe { resolver::real_clock_gettime()(clk_id, tp) };
    };
    init_trace();

    if tp.is_null() {
        // Nothing to virtualize without an output location.
        // SAFETY: pure delegation.
        return unsafe { resolver::real_clock_gettime()(clk_id, tp) };
    }

    match shim().clock_gettime(&mut RealTime, clk_id) {
        Ok(ts) => {
            // SAFETY: tp is non-null and writable per the caller contract.
            unsafe { *tp = ts.into() };
            0
        }
        Err(res) => res,
    }
}

/// Replacement `read(2)`.
///
/// # Safety
///
/// Called in place of libc's `read`; `buf` must be NULL (with the real call
/// left to fail) or point at `count` writable bytes.
#[no_mangle]
pub unsafe extern "C" fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    let Some(_guard) = HookGuard::enter() else {
        // SAFETY: pure delegation.
        return unsafe { resolver::real_read()(fd, buf, count) };
    };
    init_trace();

    if buf.is_null() || count == 0 {
        // SAFETY: pure delegation, including the EFAULT/zero-count cases.
        return unsafe { resolver::real_read()(fd, buf, count) };
    }
    // SAFETY: non-null buf points at count writable bytes per the caller
    // contract.
    let bytes = unsafe { slice::from_raw_parts_mut(buf.cast::<u8>(), count) };
    shim().read(&mut RealInput, fd, bytes)
}

/// Replacement `write(2)`.
///
/// # Safety
///
/// Called in place of libc's `write`; `buf` must be NULL (with the real call
/// left to fail) or point at `count` readable bytes.
#[no_mangle]
pub unsafe extern "C" fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    let Some(_guard) = HookGuard::enter() else {
        // SAFETY: pure delegation.
        return unsafe { resolver::real_write()(fd, buf, count) };
    };
    init_trace();

    if buf.is_null() || count == 0 {
        // SAFETY: pure delegation.
        return unsafe { resolver::real_write()(fd, buf, count) };
    }
    // SAFETY: non-null buf points at count readable bytes per the caller
    // contract.
    let bytes = unsafe { slice::from_raw_parts(buf.cast::<u8>(), count) };
    shim().write(&mut RealOutput, fd, bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hook_guard_is_per_thread_and_non_reentrant() {
        let guard = HookGuard::enter();
        assert!(guard.is_some());
        assert!(HookGuard::enter().is_none());

        drop(guard);
        assert!(HookGuard::enter().is_some());
    }

    #[test]
    fn test_hook_guard_does_not_leak_across_threads() {
        let _guard = HookGuard::enter().unwrap();
        let claimed = std::thread::spawn(|| HookGuard::enter().is_some())
            .join()
            .unwrap();
        assert!(claimed);
    }
}
