//! Environment seams injected into the broker.
//!
//! The core never touches system resources directly. Time, allocation
//! headroom, security policy, and service activation all arrive through
//! these traits so the whole broker can run under a deterministic
//! harness with virtual time and scripted failures, or in production
//! with real implementations, without any change to the routing logic.

use std::rc::Rc;

use hermod_proto::Message;

use crate::connection::Connection;

/// Milliseconds the loop backs off before retrying work that failed to
/// allocate.
pub const DEFAULT_OOM_WAIT_MS: u64 = 500;

/// A wall-clock instant with microsecond resolution.
///
/// Unlike a monotonic instant this may go backward; the event loop's
/// timeout bookkeeping is written to survive that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct WallTime {
    /// Whole seconds
    pub sec: u64,
    /// Microseconds within the second, always below 1_000_000
    pub usec: u32,
}

impl WallTime {
    /// Build from a millisecond count.
    pub fn from_millis(ms: u64) -> WallTime {
        WallTime { sec: ms / 1000, usec: ((ms % 1000) * 1000) as u32 }
    }

    /// Milliseconds since the epoch of the clock, as a signed value so
    /// differences are safe to compute.
    pub fn as_millis(&self) -> i128 {
        i128::from(self.sec) * 1000 + i128::from(self.usec / 1000)
    }
}

/// Source of wall time and bounded sleeps.
///
/// Implemented twice: the harness's simulated clock (settable, advances
/// instantly on sleep) and whatever real-clock wrapper a production
/// build supplies.
///
/// # Invariants
///
/// Implementations MUST guarantee:
///
/// 1. Honest steps: `wall_now()` is explicitly allowed to go backward
///    (a stepped system clock does), but it must report the step rather
///    than paper over it. The event loop's timeout bookkeeping depends
///    on seeing the jump to re-arm timers; a clock that clamps itself
///    monotonic would silently stretch every interval instead.
/// 2. Bounded sleeps: `sleep_ms(ms)` returns after at most roughly `ms`
///    milliseconds of (real or virtual) time. The loop calls it for the
///    OOM back-off, so an unbounded sleep stalls the whole bus.
/// 3. Consistency: time observed after `sleep_ms(ms)` is never earlier
///    than time observed before it, absent an external clock step.
///
/// # Panics
///
/// Implementations must not panic. Both methods run on every loop
/// iteration and on every allocation-failure retry; there is no caller
/// prepared to recover from a failing clock.
pub trait Clock {
    /// The current wall time. May go backward if the system clock is
    /// stepped.
    fn wall_now(&self) -> WallTime;

    /// Sleep for at most `ms` milliseconds. The simulation clock
    /// advances virtual time instead of blocking.
    fn sleep_ms(&self, ms: u64);
}

/// Allocation headroom accounting.
///
/// Rust's global allocator aborts instead of reporting failure, so the
/// broker routes every queue reservation through this trait and treats a
/// refused reservation exactly as the original treats a failed
/// allocation: the operation unwinds, the transaction rolls back, and
/// the loop backs off for the OOM interval.
///
/// # Invariants
///
/// Implementations MUST guarantee:
///
/// 1. Refusal is the only failure: `try_reserve` reports exhaustion by
///    returning `false` and by no other means. A refused reservation
///    must not change the accounted balance.
/// 2. Balanced accounting: every successful `try_reserve(n)` is paired
///    by the broker with exactly one `release(n)` (on flush, rollback,
///    or connection teardown). `release` must accept that `n` even if
///    the quota has meanwhile been switched into a failing state, or
///    the balance drifts and the bus wedges under back-pressure.
/// 3. No side effects on callers: `try_reserve` may be called at any
///    point in a dispatch; it must not re-enter the broker or block.
///    A scripted quota that flips its own state while answering is
///    fine, calling back into bus code is not.
///
/// `try_reserve` makes no fairness or ordering promise across
/// connections; the loop's retry/back-off machinery copes with
/// arbitrary interleavings of refusals.
///
/// # Panics
///
/// Implementations must not panic, `release` in particular: it runs on
/// teardown paths where the broker is already unwinding a failure.
pub trait MemoryQuota {
    /// Try to reserve `bytes`; `false` means out of memory.
    fn try_reserve(&self, bytes: usize) -> bool;

    /// Return a previous reservation.
    fn release(&self, bytes: usize);
}

/// Quota that never refuses.
#[derive(Debug, Default)]
pub struct UnlimitedQuota;

impl MemoryQuota for UnlimitedQuota {
    fn try_reserve(&self, _bytes: usize) -> bool {
        true
    }

    fn release(&self, _bytes: usize) {}
}

/// Outcome of the security callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Deliver the message
    Allow,
    /// Drop or refuse the message
    Deny,
}

/// The per-message security callback.
///
/// `sender` is absent for broker-originated messages. `addressed` is the
/// primary recipient a destination name resolved to, if any;
/// `recipient` is the connection this particular delivery would go to
/// (absent when checking a message aimed at the driver itself).
pub trait Policy {
    /// Decide whether one delivery may happen.
    fn check(
        &self,
        sender: Option<&Rc<Connection>>,
        addressed: Option<&Rc<Connection>>,
        recipient: Option<&Rc<Connection>>,
        message: &Message,
    ) -> Verdict;
}

impl<P: Policy + ?Sized> Policy for Box<P> {
    fn check(
        &self,
        sender: Option<&Rc<Connection>>,
        addressed: Option<&Rc<Connection>>,
        recipient: Option<&Rc<Connection>>,
        message: &Message,
    ) -> Verdict {
        (**self).check(sender, addressed, recipient, message)
    }
}

/// Policy that allows everything.
#[derive(Debug, Default)]
pub struct AllowAll;

impl Policy for AllowAll {
    fn check(
        &self,
        _sender: Option<&Rc<Connection>>,
        _addressed: Option<&Rc<Connection>>,
        _recipient: Option<&Rc<Connection>>,
        _message: &Message,
    ) -> Verdict {
        Verdict::Allow
    }
}

/// Result of asking the activation collaborator to start a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationResult {
    /// The service was launched
    Started,
    /// The service was already running
    AlreadyRunning,
    /// No such activatable service
    Unknown,
}

/// Service activation, handled outside the core.
pub trait Activator {
    /// Start the service that should own `name`.
    fn activate(&self, name: &str) -> ActivationResult;
}

impl<A: Activator + ?Sized> Activator for Box<A> {
    fn activate(&self, name: &str) -> ActivationResult {
        (**self).activate(name)
    }
}

/// Activator that knows no services.
#[derive(Debug, Default)]
pub struct NoActivation;

impl Activator for NoActivation {
    fn activate(&self, _name: &str) -> ActivationResult {
        ActivationResult::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wall_time_millis() {
        let t = WallTime { sec: 2, usec: 345_000 };
        assert_eq!(t.as_millis(), 2345);
        assert_eq!(WallTime::from_millis(2345), t);
    }

    #[test]
    fn wall_time_orders_by_components() {
        let earlier = WallTime { sec: 5, usec: 1 };
        let later = WallTime { sec: 5, usec: 2 };
        assert!(earlier < later);
        assert!(WallTime { sec: 4, usec: 999_999 } < earlier);
    }
}
