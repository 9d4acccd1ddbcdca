//! Per-operation interception logic
//!
//! `WarpShim` glues the pure state machine (`crate::state`) to the four
//! capability traits (`crate::backend`). One method per intercepted
//! operation, each generic over its backend so the whole protocol runs
//! against deterministic fakes in tests:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ TRACED PROCESS                                                │
//! │   clock_gettime() ─┐                                          │
//! │   select()        ─┼─▶ WarpShim ─▶ WarpState (4-state machine)│
//! │   write("*...")   ─┤        │                                 │
//! │   read(stdin)     ─┘        └─▶ backend traits ─▶ real libc   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The contract, per round: a wait with a nonzero timeout is clamped to a
//! 1 µs real poll while the requested duration feeds the virtual target;
//! every later clock read reports that target; the traced process announces
//! arrival at its gated path by writing [`MARKER_BYTE`] to stdout; the next
//! wait reports stdin ready without blocking and the next stdin read is
//! answered with [`REPLY_BYTE`], re-arming the machine for the next round.

use crate::backend::{ByteSink, ByteSource, TimeSource, WaitBudget, WaitMultiplexer};
use crate::state::{Timestamp, WaitTimeout, WarpState};
use libc::{c_int, clockid_t, ssize_t};
use tracing::{trace, warn};

/// Byte on the traced process's stdout that announces a crossing: `*`
pub const MARKER_BYTE: u8 = b'*';

/// Synthetic stdin reply supplied once a crossing has fired: newline
pub const REPLY_BYTE: u8 = b'\n';

/// How an intercepted wait call was disposed of
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitDisposition {
    /// Crossing has fired: report stdin ready with count 1, no real wait
    InputReady,
    /// Raw result of the delegated real wait
    Waited(c_int),
}

/// Interception driver: the state machine plus the per-operation logic.
#[derive(Debug, Default)]
pub struct WarpShim {
    state: WarpState,
}

impl WarpShim {
    /// Fresh shim with an unset baseline
    pub const fn new() -> Self {
        Self {
            state: WarpState::new(),
        }
    }

    /// Read-only view of the underlying machine
    pub fn state(&self) -> &WarpState {
        &self.state
    }

    /// Intercepted multiplexed wait.
    ///
    /// `requested` is the caller's timeout, or `None` for a NULL (block
    /// indefinitely) argument. Once a crossing has fired the real wait is
    /// never issued; otherwise any nonzero timeout is clamped to
    /// [`WaitTimeout::POLL`] for the real call while the requested duration
    /// goes into the virtual-target bookkeeping. Failed real waits and
    /// NULL-timeout calls leave the machine untouched.
    pub fn wait<M: WaitMultiplexer>(
        &mut self,
        mux: &mut M,
        requested: Option<WaitTimeout>,
    ) -> WaitDisposition {
        if self.state.input_pending() {
            trace!("select: crossing fired, reporting stdin ready");
            return WaitDisposition::InputReady;
        }

        let budget = match requested {
            Some(t) if !t.is_zero() => WaitBudget::Clamped(WaitTimeout::POLL),
            _ => WaitBudget::Passthrough,
        };
        let res = mux.wait(budget);

        if res >= 0 {
            if let Some(t) = requested {
                trace!(
                    res,
                    sec = t.sec,
                    usec = t.usec,
                    "select: advancing virtual target"
                );
                self.state.note_wait(t);
            } else {
                trace!(res, "select: no timeout supplied");
            }
        }
        WaitDisposition::Waited(res)
    }

    /// Intercepted clock read.
    ///
    /// Delegates to the real time source first; on success the machine
    /// decides what the caller sees (the real reading, or the virtual target
    /// while a crossing is pending or fired). `Err` forwards the real call's
    /// failing return code verbatim.
    pub fn clock_gettime<T: TimeSource>(
        &mut self,
        source: &mut T,
        clock: clockid_t,
    ) -> Result<Timestamp, c_int> {
        let real = source.now(clock)?;
        let seen = self
            .state
            .observe_clock(clock == libc::CLOCK_MONOTONIC, real);
        trace!(
            clock,
            sec = seen.sec,
            nsec = seen.nsec,
            "clock_gettime: reporting"
        );
        Ok(seen)
    }

    /// Intercepted byte read.
    ///
    /// While a crossing has fired, a stdin read of at least one byte is
    /// answered with a single [`REPLY_BYTE`] without touching the real
    /// input, and the machine re-arms for the next round. Everything else
    /// delegates.
    pub fn read<R: ByteSource>(&mut self, source: &mut R, fd: c_int, buf: &mut [u8]) -> ssize_t {
        if fd == libc::STDIN_FILENO && !buf.is_empty() && self.state.claim_reply() {
            trace!("read: supplying synthetic reply");
            buf[0] = REPLY_BYTE;
            return 1;
        }
        source.read(fd, buf)
    }

    /// Intercepted byte write.
    ///
    /// A stdout write whose first byte is [`MARKER_BYTE`] fires the
    /// crossing; the bytes are always delivered to the real output
    /// regardless, and the real result comes back verbatim.
    pub fn write<W: ByteSink>(&mut self, sink: &mut W, fd: c_int, buf: &[u8]) -> ssize_t {
        if fd == libc::STDOUT_FILENO && buf.first() == Some(&MARKER_BYTE) {
            trace!("write: marker byte observed on stdout");
            if self.state.observe_marker() {
                warn!("marker byte arrived while no crossing was pending");
            }
        }
        sink.write(fd, buf)
    }
}
