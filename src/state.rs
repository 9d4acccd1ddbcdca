//! Crossing state machine for virtual-time fast-forwarding
//!
//! This module is the pure core shared by all four intercepted entry points:
//! a four-state machine plus the two timestamps it governs. It performs no
//! I/O, reads no real clock, and calls no libc function; every operating
//! system interaction is folded in by the caller as a plain value. That keeps
//! the whole protocol unit-testable without preloading anything.
//!
//! # Design
//!
//! ```text
//! BaselineUnset ──monotonic read──▶ BaselineSet ──wait w/ timeout──▶ CrossingPending
//!                                                                        │      ▲
//!                                                               '*' on stdout   │
//!                                                                        ▼      │
//!                                                                  CrossingFired┘
//!                                                                   ('\n' reply)
//! ```
//!
//! The `CrossingPending` ↔ `CrossingFired` pair cycles once per prompt round
//! for the lifetime of the process.
//!
//! # Timestamp arithmetic
//!
//! Virtual targets are computed over raw `(sec, nsec)` pairs and are never
//! normalized: a 500000 µs timeout lands a nanosecond component of
//! 500,000,500 ns (microseconds scaled by 1000, plus a fixed 500 ns rounding
//! bias), and the traced process receives that sum as-is. Callers must not
//! assume `nsec < 1_000_000_000`.

/// Raw timestamp, mirror of `struct timespec`.
///
/// The nanosecond component is allowed to exceed one second; see the module
/// docs on arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timestamp {
    /// Whole seconds
    pub sec: i64,
    /// Nanoseconds, raw (not reduced modulo 10^9)
    pub nsec: i64,
}

impl Timestamp {
    /// Create a timestamp from raw components
    pub const fn new(sec: i64, nsec: i64) -> Self {
        Self { sec, nsec }
    }
}

impl From<libc::timespec> for Timestamp {
    fn from(ts: libc::timespec) -> Self {
        Self {
            sec: ts.tv_sec,
            nsec: ts.tv_nsec,
        }
    }
}

impl From<Timestamp> for libc::timespec {
    fn from(ts: Timestamp) -> Self {
        libc::timespec {
            tv_sec: ts.sec,
            tv_nsec: ts.nsec,
        }
    }
}

/// Wait duration requested by the traced process, mirror of `struct timeval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitTimeout {
    /// Whole seconds
    pub sec: i64,
    /// Microseconds
    pub usec: i64,
}

impl WaitTimeout {
    /// Minimal real timeout substituted for any nonzero request: 0 s, 1 µs.
    pub const POLL: WaitTimeout = WaitTimeout { sec: 0, usec: 1 };

    /// Create a timeout from raw components
    pub const fn new(sec: i64, usec: i64) -> Self {
        Self { sec, usec }
    }

    /// True when both components are zero (an immediate poll request)
    pub const fn is_zero(&self) -> bool {
        self.sec == 0 && self.usec == 0
    }
}

impl From<libc::timeval> for WaitTimeout {
    fn from(tv: libc::timeval) -> Self {
        Self {
            sec: tv.tv_sec,
            usec: tv.tv_usec,
        }
    }
}

impl From<WaitTimeout> for libc::timeval {
    fn from(t: WaitTimeout) -> Self {
        libc::timeval {
            tv_sec: t.sec,
            tv_usec: t.usec,
        }
    }
}

/// Where the shim stands in the fast-forward protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrossingState {
    /// No monotonic clock reading observed yet (initial state)
    BaselineUnset,
    /// A baseline timestamp exists; no crossing scheduled
    BaselineSet,
    /// A virtual target has been computed; waiting for the marker byte
    CrossingPending,
    /// Marker observed on stdout; one synthetic stdin reply is owed
    CrossingFired,
}

/// The process-wide warp context: state tag plus the two timestamps.
///
/// `next_virtual` is meaningful only in `CrossingPending`/`CrossingFired`;
/// `last_observed` is meaningful once the machine has left `BaselineUnset`.
/// One transition method exists per intercepted operation.
#[derive(Debug)]
pub struct WarpState {
    state: CrossingState,
    last_observed: Timestamp,
    next_virtual: Timestamp,
}

impl WarpState {
    /// Fresh machine in `BaselineUnset`
    pub const fn new() -> Self {
        Self {
            state: CrossingState::BaselineUnset,
            last_observed: Timestamp::new(0, 0),
            next_virtual: Timestamp::new(0, 0),
        }
    }

    /// Current state tag
    pub fn state(&self) -> CrossingState {
        self.state
    }

    /// Most recently observed (real or synthesized) monotonic timestamp
    pub fn last_observed(&self) -> Timestamp {
        self.last_observed
    }

    /// The virtual target the traced process is being steered toward
    pub fn next_virtual(&self) -> Timestamp {
        self.next_virtual
    }

    /// True when a multiplexed wait should short-circuit with stdin ready
    /// instead of delegating to the real call.
    pub fn input_pending(&self) -> bool {
        self.state == CrossingState::CrossingFired
    }

    /// Record a successful multiplexed wait issued with a caller-supplied
    /// timeout.
    ///
    /// Recomputes the virtual target from the current baseline whenever a
    /// baseline exists: seconds add directly, microseconds scale by 1000 with
    /// a 500 ns rounding bias, and the nanosecond sum stays raw. From
    /// `BaselineSet` this schedules the crossing; from `CrossingPending` or
    /// `CrossingFired` only the target moves. Without a baseline nothing
    /// happens.
    pub fn note_wait(&mut self, requested: WaitTimeout) {
        if self.state == CrossingState::BaselineUnset {
            return;
        }
        self.next_virtual = Timestamp {
            sec: self.last_observed.sec + requested.sec,
            nsec: self.last_observed.nsec + requested.usec * 1000 + 500,
        };
        if self.state == CrossingState::BaselineSet {
            self.state = CrossingState::CrossingPending;
        }
    }

    /// Fold a successful clock reading into the machine and return the value
    /// the traced process should see.
    ///
    /// While a crossing is pending or fired the real reading is discarded and
    /// the virtual target returned instead, whatever the clock id. Monotonic
    /// reads additionally re-anchor the baseline to the returned value (the
    /// synthesized one once the override is active, so successive wait/read
    /// rounds compound on already-virtualized time), and the first one moves
    /// `BaselineUnset` to `BaselineSet`.
    pub fn observe_clock(&mut self, monotonic: bool, real: Timestamp) -> Timestamp {
        let seen = match self.state {
            CrossingState::CrossingPending | CrossingState::CrossingFired => self.next_virtual,
            _ => real,
        };
        if monotonic {
            self.last_observed = seen;
            if self.state == CrossingState::BaselineUnset {
                self.state = CrossingState::BaselineSet;
            }
        }
        seen
    }

    /// A marker byte reached stdout: fire the crossing.
    ///
    /// Returns `true` when the marker arrived out of protocol order (state
    /// was not `CrossingPending`); the transition happens regardless.
    pub fn observe_marker(&mut self) -> bool {
        let out_of_order = self.state != CrossingState::CrossingPending;
        self.state = CrossingState::CrossingFired;
        out_of_order
    }

    /// Claim the synthetic stdin reply, if one is owed.
    ///
    /// Returns `true` and re-arms the machine (`CrossingFired` back to
    /// `CrossingPending`) exactly when the crossing has fired; otherwise a
    /// no-op returning `false`.
    pub fn claim_reply(&mut self) -> bool {
        if self.state == CrossingState::CrossingFired {
            self.state = CrossingState::CrossingPending;
            true
        } else {
            false
        }
    }
}

impl Default for WarpState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let warp = WarpState::new();
        assert_eq!(warp.state(), CrossingState::BaselineUnset);
        assert!(!warp.input_pending());
    }

    #[test]
    fn test_first_monotonic_read_sets_baseline() {
        let mut warp = WarpState::new();
        let real = Timestamp::new(100, 250);

        let seen = warp.observe_clock(true, real);

        // The real value passes through and becomes the baseline
        assert_eq!(seen, real);
        assert_eq!(warp.state(), CrossingState::BaselineSet);
        assert_eq!(warp.last_observed(), real);
    }

    #[test]
    fn test_non_monotonic_read_never_sets_baseline() {
        let mut warp = WarpState::new();
        let seen = warp.observe_clock(false, Timestamp::new(42, 0));

        assert_eq!(seen, Timestamp::new(42, 0));
        assert_eq!(warp.state(), CrossingState::BaselineUnset);
    }

    #[test]
    fn test_wait_without_baseline_is_ignored() {
        let mut warp = WarpState::new();
        warp.note_wait(WaitTimeout::new(5, 0));

        assert_eq!(warp.state(), CrossingState::BaselineUnset);
    }

    #[test]
    fn test_wait_schedules_crossing() {
        let mut warp = WarpState::new();
        warp.observe_clock(true, Timestamp::new(100, 0));

        warp.note_wait(WaitTimeout::new(5, 0));

        assert_eq!(warp.state(), CrossingState::CrossingPending);
        // 100 s baseline + 5 s request, bias lands in the nanoseconds
        assert_eq!(warp.next_virtual(), Timestamp::new(105, 500));
    }

    #[test]
    fn test_virtual_target_keeps_raw_nanoseconds() {
        let mut warp = WarpState::new();
        warp.observe_clock(true, Timestamp::new(100, 0));

        warp.note_wait(WaitTimeout::new(2, 500_000));

        // 500000 µs * 1000 + 500 = 500,000,500 ns, not carried into seconds
        assert_eq!(warp.next_virtual(), Timestamp::new(102, 500_000_500));
    }

    #[test]
    fn test_clock_override_while_pending() {
        let mut warp = WarpState::new();
        warp.observe_clock(true, Timestamp::new(100, 0));
        warp.note_wait(WaitTimeout::new(5, 0));

        // Real reading is discarded; the virtual target comes back verbatim
        let seen = warp.observe_clock(true, Timestamp::new(100, 999));
        assert_eq!(seen, warp.next_virtual());

        // And the baseline re-anchors to the synthesized value
        assert_eq!(warp.last_observed(), warp.next_virtual());
    }

    #[test]
    fn test_clock_override_applies_to_any_clock() {
        let mut warp = WarpState::new();
        warp.observe_clock(true, Timestamp::new(100, 0));
        warp.note_wait(WaitTimeout::new(5, 0));
        let target = warp.next_virtual();

        // Non-monotonic clocks get the override too, but leave the baseline
        let before = warp.last_observed();
        let seen = warp.observe_clock(false, Timestamp::new(7, 7));
        assert_eq!(seen, target);
        assert_eq!(warp.last_observed(), before);
    }

    #[test]
    fn test_repeat_waits_recompute_target_without_state_change() {
        let mut warp = WarpState::new();
        warp.observe_clock(true, Timestamp::new(100, 0));
        warp.note_wait(WaitTimeout::new(5, 0));
        assert_eq!(warp.state(), CrossingState::CrossingPending);

        warp.note_wait(WaitTimeout::new(7, 0));

        assert_eq!(warp.state(), CrossingState::CrossingPending);
        assert_eq!(warp.next_virtual(), Timestamp::new(107, 500));
    }

    #[test]
    fn test_marker_fires_crossing() {
        let mut warp = WarpState::new();
        warp.observe_clock(true, Timestamp::new(100, 0));
        warp.note_wait(WaitTimeout::new(5, 0));

        let out_of_order = warp.observe_marker();

        assert!(!out_of_order);
        assert_eq!(warp.state(), CrossingState::CrossingFired);
        assert!(warp.input_pending());
    }

    #[test]
    fn test_marker_out_of_order_still_fires() {
        let mut warp = WarpState::new();

        let out_of_order = warp.observe_marker();

        assert!(out_of_order);
        assert_eq!(warp.state(), CrossingState::CrossingFired);
    }

    #[test]
    fn test_reply_rearms_machine() {
        let mut warp = WarpState::new();
        warp.observe_clock(true, Timestamp::new(100, 0));
        warp.note_wait(WaitTimeout::new(5, 0));
        warp.observe_marker();

        assert!(warp.claim_reply());
        assert_eq!(warp.state(), CrossingState::CrossingPending);

        // Only one reply is owed per marker
        assert!(!warp.claim_reply());
        assert_eq!(warp.state(), CrossingState::CrossingPending);
    }

    #[test]
    fn test_pending_fired_pair_cycles() {
        let mut warp = WarpState::new();
        warp.observe_clock(true, Timestamp::new(100, 0));
        warp.note_wait(WaitTimeout::new(1, 0));

        for _ in 0..50 {
            assert_eq!(warp.state(), CrossingState::CrossingPending);
            assert!(!warp.observe_marker());
            assert!(warp.claim_reply());
        }
    }

    #[test]
    fn test_timespec_round_trip() {
        let ts = libc::timespec {
            tv_sec: 102,
            tv_nsec: 500_000_500,
        };
        let stamp = Timestamp::from(ts);
        let back = libc::timespec::from(stamp);
        assert_eq!(back.tv_sec, 102);
        assert_eq!(back.tv_nsec, 500_000_500);
    }
}
