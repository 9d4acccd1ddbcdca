//! Lazy resolution of the original libc entry points
//!
//! Preloading this shim shadows four libc symbols; the originals are still
//! needed to do the actual work. Each one is looked up through
//! `dlsym(RTLD_NEXT, ...)` on first use and cached in an atomic for the life
//! of the process. Resolution is idempotent: concurrent first calls race
//! benignly and store the same address, so no locking is involved.
//!
//! A symbol that cannot be resolved leaves every subsequent intercepted call
//! with nowhere to delegate, so the infallible accessors abort the process
//! loudly rather than limp along with a null pointer. The abort path writes
//! its message with a raw `write` syscall: it cannot go through the
//! interposed `write` chain it may itself have failed to resolve.

use libc::{c_int, c_void, clockid_t, fd_set, size_t, ssize_t, timespec, timeval};
use std::ffi::CStr;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use thiserror::Error;

/// `select(2)` signature
pub type SelectFn =
    unsafe extern "C" fn(c_int, *mut fd_set, *mut fd_set, *mut fd_set, *mut timeval) -> c_int;

/// `clock_gettime(2)` signature
pub type ClockGettimeFn = unsafe extern "C" fn(clockid_t, *mut timespec) -> c_int;

/// `read(2)` signature
pub type ReadFn = unsafe extern "C" fn(c_int, *mut c_void, size_t) -> ssize_t;

/// `write(2)` signature
pub type WriteFn = unsafe extern "C" fn(c_int, *const c_void, size_t) -> ssize_t;

/// Errors from next-symbol resolution
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ResolveError {
    /// `dlsym(RTLD_NEXT, name)` found nothing to delegate to
    #[error("dlsym(RTLD_NEXT, \"{0}\") resolved no symbol")]
    MissingSymbol(&'static str),
}

static SELECT: AtomicPtr<c_void> = AtomicPtr::new(ptr::null_mut());
static CLOCK_GETTIME: AtomicPtr<c_void> = AtomicPtr::new(ptr::null_mut());
static READ: AtomicPtr<c_void> = AtomicPtr::new(ptr::null_mut());
static WRITE: AtomicPtr<c_void> = AtomicPtr::new(ptr::null_mut());

/// Resolve `name` through `RTLD_NEXT`, consulting and filling `cache`.
///
/// The first successful call stores the address; later calls return it
/// without touching the dynamic linker. Concurrent first calls may both
/// resolve, but they compute the same value.
pub fn try_resolve(
    cache: &AtomicPtr<c_void>,
    name: &'static CStr,
) -> Result<*mut c_void, ResolveError> {
    let cached = cache.load(Ordering::Relaxed);
    if !cached.is_null() {
        return Ok(cached);
    }
    // SAFETY: name is a valid NUL-terminated string; RTLD_NEXT is the
    // documented pseudo-handle for next-object lookup.
    let sym = unsafe { libc::dlsym(libc::RTLD_NEXT, name.as_ptr()) };
    if sym.is_null() {
        return Err(ResolveError::MissingSymbol(
            name.to_str().unwrap_or("<non-utf8>"),
        ));
    }
    cache.store(sym, Ordering::Relaxed);
    Ok(sym)
}

/// Resolve or die: every intercepted call depends on the original being
/// reachable, so a failed lookup is unrecoverable.
fn resolve(cache: &AtomicPtr<c_void>, name: &'static CStr) -> *mut c_void {
    match try_resolve(cache, name) {
        Ok(sym) => sym,
        Err(err) => die(&err),
    }
}

/// Write the failure to fd 2 via a raw syscall, then abort.
fn die(err: &ResolveError) -> ! {
    let msg = format!("adelantar: fatal: {err}\n");
    // SAFETY: msg points at msg.len() valid bytes; a failed write here is
    // unreportable anyway.
    unsafe {
        libc::syscall(
            libc::SYS_write,
            2 as c_int,
            msg.as_ptr() as *const c_void,
            msg.len(),
        );
        libc::abort()
    }
}

/// The original `select`
pub fn real_select() -> SelectFn {
    let sym = resolve(&SELECT, c"select");
    // SAFETY: sym is the non-null address of libc's select, which has
    // exactly this signature.
    unsafe { std::mem::transmute::<*mut c_void, SelectFn>(sym) }
}

/// The original `clock_gettime`
pub fn real_clock_gettime() -> ClockGettimeFn {
    let sym = resolve(&CLOCK_GETTIME, c"clock_gettime");
    // SAFETY: sym is the non-null address of libc's clock_gettime.
    unsafe { std::mem::transmute::<*mut c_void, ClockGettimeFn>(sym) }
}

/// The original `read`
pub fn real_read() -> ReadFn {
    let sym = resolve(&READ, c"read");
    // SAFETY: sym is the non-null address of libc's read.
    unsafe { std::mem::transmute::<*mut c_void, ReadFn>(sym) }
}

/// The original `write`
pub fn real_write() -> WriteFn {
    let sym = resolve(&WRITE, c"write");
    // SAFETY: sym is the non-null address of libc's write.
    unsafe { std::mem::transmute::<*mut c_void, WriteFn>(sym) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolves_real_libc_symbol() {
        let cache = AtomicPtr::new(ptr::null_mut());
        let first = try_resolve(&cache, c"getpid").expect("getpid must resolve");
        assert!(!first.is_null());

        // Second call is served from the cache and agrees
        let second = try_resolve(&cache, c"getpid").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_missing_symbol_is_an_error() {
        let cache = AtomicPtr::new(ptr::null_mut());
        let err = try_resolve(&cache, c"adelantar_no_such_symbol").unwrap_err();
        assert_eq!(
            err,
            ResolveError::MissingSymbol("adelantar_no_such_symbol")
        );
        // Failure never poisons the cache
        assert!(cache.load(Ordering::Relaxed).is_null());
    }

    #[test]
    fn test_typed_accessors_return_callable_originals() {
        // Resolving through the public accessors must not abort
        let _ = real_select();
        let _ = real_read();
        let _ = real_write();
        let clock = real_clock_gettime();

        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        let res = unsafe { clock(libc::CLOCK_MONOTONIC, &mut ts) };
        assert_eq!(res, 0);
    }
}
