//! Capability interfaces over the real operating-system entry points
//!
//! The warp driver (`crate::warp`) never touches libc directly: it speaks to
//! these four small traits, one per intercepted operation. The `Real*`
//! implementations below delegate to the originals cached by
//! `crate::resolver`; tests substitute deterministic fakes and drive the
//! whole protocol without preloading anything.

use crate::resolver;
use crate::state::{Timestamp, WaitTimeout};
use libc::{c_int, clockid_t, ssize_t};

/// Timeout the shim chose for a delegated readiness wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitBudget {
    /// Forward the caller's own timeout argument untouched (NULL, meaning
    /// block indefinitely, or an explicit zero poll).
    Passthrough,
    /// Replace the caller's timeout with this one for the real call; the
    /// caller's value stays unmodified in memory.
    Clamped(WaitTimeout),
}

/// Multiplexed readiness wait, `select(2)` shape
pub trait WaitMultiplexer {
    /// Issue the real wait under the given budget and return the raw
    /// `select` result.
    fn wait(&mut self, budget: WaitBudget) -> c_int;
}

/// Clock reads, `clock_gettime(2)` shape
pub trait TimeSource {
    /// Read `clock`. `Err` carries the raw failing return code; `errno` is
    /// left exactly as the real call set it.
    fn now(&mut self, clock: clockid_t) -> Result<Timestamp, c_int>;
}

/// Byte-stream input, `read(2)` shape
pub trait ByteSource {
    fn read(&mut self, fd: c_int, buf: &mut [u8]) -> ssize_t;
}

/// Byte-stream output, `write(2)` shape
pub trait ByteSink {
    fn write(&mut self, fd: c_int, buf: &[u8]) -> ssize_t;
}

/// Real `select` delegate, bound to one intercepted call's raw arguments.
///
/// Holds the caller's pointers for the duration of that call only.
pub(crate) struct RealWait {
    pub nfds: c_int,
    pub readfds: *mut libc::fd_set,
    pub writefds: *mut libc::fd_set,
    pub exceptfds: *mut libc::fd_set,
    /// Caller's own timeout pointer, forwarded on the passthrough path
    pub timeout: *mut libc::timeval,
}

impl WaitMultiplexer for RealWait {
    fn wait(&mut self, budget: WaitBudget) -> c_int {
        let select = resolver::real_select();
        match budget {
            WaitBudget::Clamped(t) => {
                let mut tv = libc::timeval::from(t);
                // SAFETY: pointers come from the intercepted call and follow
                // the select(2) contract; tv outlives the call.
                unsafe {
                    select(
                        self.nfds,
                        self.readfds,
                        self.writefds,
                        self.exceptfds,
                        &mut tv,
                    )
                }
            }
            // SAFETY: as above; the caller's own timeout pointer is passed
            // through untouched.
            WaitBudget::Passthrough => unsafe {
                select(
                    self.nfds,
                    self.readfds,
                    self.writefds,
                    self.exceptfds,
                    self.timeout,
                )
            },
        }
    }
}

/// Real `clock_gettime` delegate
pub(crate) struct RealTime;

impl TimeSource for RealTime {
    fn now(&mut self, clock: clockid_t) -> Result<Timestamp, c_int> {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // SAFETY: ts is a valid timespec for the duration of the call.
        let res = unsafe { resolver::real_clock_gettime()(clock, &mut ts) };
        if res == 0 {
            Ok(Timestamp::from(ts))
        } else {
            Err(res)
        }
    }
}

/// Real `read` delegate
pub(crate) struct RealInput;

impl ByteSource for RealInput {
    fn read(&mut self, fd: c_int, buf: &mut [u8]) -> ssize_t {
        // SAFETY: the slice guarantees a valid writable region of buf.len()
        // bytes.
        unsafe { resolver::real_read()(fd, buf.as_mut_ptr().cast(), buf.len()) }
    }
}

/// Real `write` delegate
pub(crate) struct RealOutput;

impl ByteSink for RealOutput {
    fn write(&mut self, fd: c_int, buf: &[u8]) -> ssize_t {
        // SAFETY: the slice guarantees a valid readable region of buf.len()
        // bytes.
        unsafe { resolver::real_write()(fd, buf.as_ptr().cast(), buf.len()) }
    }
}
