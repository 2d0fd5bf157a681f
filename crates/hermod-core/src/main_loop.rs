//! Single-threaded cooperative event loop.
//!
//! The loop owns a flat list of callbacks (fd watches and interval
//! timeouts) plus a FIFO of connections with parsed messages waiting to
//! be routed. One iteration builds a poll set from the enabled watches,
//! sleeps at most until the nearest timeout, fires what became ready,
//! and drains one pass of the dispatch queue.
//!
//! Two safety rules shape the iteration:
//!
//! - Any structural change to the callback list (or a `quit`) invalidates
//!   the snapshot being fired. What happens next is the
//!   [`RestartPolicy`]: the original behavior restarts the iteration,
//!   which can starve watches late in the list if earlier handlers keep
//!   mutating; the alternative keeps firing the poll snapshot, skipping
//!   entries that are gone.
//! - A watch whose handler reports an allocation failure is skipped on
//!   the very next iteration only, and the loop sleeps at most the OOM
//!   interval before retrying, still reporting that work was done so
//!   callers do not idle.

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    rc::Rc,
};

use crate::{
    env::{Clock, DEFAULT_OOM_WAIT_MS, WallTime},
    transport::{FdToken, PollEntry, Poller, WatchFlags},
};

/// Progress state of one dispatchable after a dispatch step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStatus {
    /// Nothing left to do
    Complete,
    /// More parsed messages are waiting
    DataRemains,
    /// A reservation failed; retry after the OOM interval
    NeedMemory,
}

/// Something the loop can drain from its dispatch FIFO.
pub trait Dispatchable {
    /// Route one pending message.
    fn dispatch(&self) -> DispatchStatus;
}

/// What to do when a callback mutates the list mid-iteration.
///
/// The trade-off is deliberate and exposed rather than picked silently:
/// restarting is simple but can starve late watches; firing the
/// snapshot guarantees every ready watch runs once per poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestartPolicy {
    /// Abandon the rest of the snapshot and start a fresh iteration
    #[default]
    RestartFromTop,
    /// Keep firing the snapshot, skipping entries that were removed
    FireSnapshot,
}

/// Identifier of a registered watch.
pub type WatchId = u64;

/// Identifier of a registered timeout.
pub type TimeoutId = u64;

struct WatchEntry {
    id: WatchId,
    token: FdToken,
    flags: Cell<WatchFlags>,
    enabled: Cell<bool>,
    /// Set when the handler reported OOM; cleared when the skip happens
    last_iteration_oom: Cell<bool>,
    handler: Box<dyn Fn(WatchFlags) -> bool>,
}

struct TimeoutEntry {
    id: TimeoutId,
    interval_ms: Cell<u64>,
    enabled: Cell<bool>,
    last_fired: Cell<WallTime>,
    handler: Box<dyn Fn()>,
}

enum CallbackSlot {
    Watch(Rc<WatchEntry>),
    Timeout(Rc<TimeoutEntry>),
}

struct TimeoutCheck {
    expired: bool,
    remaining_ms: u64,
}

/// The event loop.
pub struct MainLoop {
    clock: Rc<dyn Clock>,
    poller: RefCell<Box<dyn Poller>>,
    callbacks: RefCell<Vec<CallbackSlot>>,
    /// Bumped on every add/remove; fired snapshots compare against it
    list_serial: Cell<u64>,
    next_id: Cell<u64>,
    /// Nesting depth of `run` calls
    depth: Cell<usize>,
    need_dispatch: RefCell<VecDeque<Rc<dyn Dispatchable>>>,
    restart_policy: RestartPolicy,
    oom_wait_ms: u64,
}

impl MainLoop {
    /// Build a loop over the given clock and poller.
    pub fn new(
        clock: Rc<dyn Clock>,
        poller: Box<dyn Poller>,
        restart_policy: RestartPolicy,
    ) -> Rc<MainLoop> {
        Self::with_oom_wait(clock, poller, restart_policy, DEFAULT_OOM_WAIT_MS)
    }

    /// Build a loop with a custom OOM back-off interval.
    pub fn with_oom_wait(
        clock: Rc<dyn Clock>,
        poller: Box<dyn Poller>,
        restart_policy: RestartPolicy,
        oom_wait_ms: u64,
    ) -> Rc<MainLoop> {
        Rc::new(MainLoop {
            clock,
            poller: RefCell::new(poller),
            callbacks: RefCell::new(Vec::new()),
            list_serial: Cell::new(0),
            next_id: Cell::new(1),
            depth: Cell::new(0),
            need_dispatch: RefCell::new(VecDeque::new()),
            restart_policy,
            oom_wait_ms,
        })
    }

    /// The configured OOM back-off interval.
    pub fn oom_wait_ms(&self) -> u64 {
        self.oom_wait_ms
    }

    /// The clock the loop schedules against.
    pub fn clock(&self) -> &Rc<dyn Clock> {
        &self.clock
    }

    fn bump_serial(&self) {
        self.list_serial.set(self.list_serial.get() + 1);
    }

    fn next_id(&self) -> u64 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        id
    }

    /// Register a watch. The handler returns `false` to report an
    /// allocation failure, which makes the loop skip the watch once and
    /// back off.
    pub fn add_watch(
        &self,
        token: FdToken,
        flags: WatchFlags,
        handler: impl Fn(WatchFlags) -> bool + 'static,
    ) -> WatchId {
        let id = self.next_id();
        self.callbacks.borrow_mut().push(CallbackSlot::Watch(Rc::new(WatchEntry {
            id,
            token,
            flags: Cell::new(flags),
            enabled: Cell::new(true),
            last_iteration_oom: Cell::new(false),
            handler: Box::new(handler),
        })));
        self.bump_serial();
        id
    }

    /// Remove a watch.
    pub fn remove_watch(&self, id: WatchId) {
        let mut callbacks = self.callbacks.borrow_mut();
        let before = callbacks.len();
        callbacks.retain(|slot| !matches!(slot, CallbackSlot::Watch(w) if w.id == id));
        if callbacks.len() == before {
            tracing::warn!(id, "could not find watch to remove");
            return;
        }
        drop(callbacks);
        self.bump_serial();
    }

    /// Enable or disable a watch without removing it.
    pub fn set_watch_enabled(&self, id: WatchId, enabled: bool) {
        for slot in self.callbacks.borrow().iter() {
            if let CallbackSlot::Watch(w) = slot {
                if w.id == id {
                    w.enabled.set(enabled);
                    return;
                }
            }
        }
        tracing::warn!(id, "could not find watch to toggle");
    }

    /// Change the conditions a watch polls for.
    pub fn set_watch_flags(&self, id: WatchId, flags: WatchFlags) {
        for slot in self.callbacks.borrow().iter() {
            if let CallbackSlot::Watch(w) = slot {
                if w.id == id {
                    w.flags.set(flags);
                    return;
                }
            }
        }
        tracing::warn!(id, "could not find watch to re-flag");
    }

    /// Register an interval timeout; the first firing is one interval
    /// from now.
    pub fn add_timeout(&self, interval_ms: u64, handler: impl Fn() + 'static) -> TimeoutId {
        let id = self.next_id();
        self.callbacks.borrow_mut().push(CallbackSlot::Timeout(Rc::new(TimeoutEntry {
            id,
            interval_ms: Cell::new(interval_ms),
            enabled: Cell::new(true),
            last_fired: Cell::new(self.clock.wall_now()),
            handler: Box::new(handler),
        })));
        self.bump_serial();
        id
    }

    /// Remove a timeout.
    pub fn remove_timeout(&self, id: TimeoutId) {
        let mut callbacks = self.callbacks.borrow_mut();
        let before = callbacks.len();
        callbacks.retain(|slot| !matches!(slot, CallbackSlot::Timeout(t) if t.id == id));
        if callbacks.len() == before {
            tracing::warn!(id, "could not find timeout to remove");
            return;
        }
        drop(callbacks);
        self.bump_serial();
    }

    fn watch_registered(&self, id: WatchId) -> bool {
        self.callbacks
            .borrow()
            .iter()
            .any(|slot| matches!(slot, CallbackSlot::Watch(w) if w.id == id))
    }

    fn timeout_registered(&self, id: TimeoutId) -> bool {
        self.callbacks
            .borrow()
            .iter()
            .any(|slot| matches!(slot, CallbackSlot::Timeout(t) if t.id == id))
    }

    /// Append to the dispatch FIFO; duplicates are allowed.
    pub fn queue_dispatch(&self, target: Rc<dyn Dispatchable>) {
        self.need_dispatch.borrow_mut().push_back(target);
    }

    /// Drain the dispatch FIFO, dispatching each queued target to
    /// completion. Returns whether anything was dispatched.
    pub fn dispatch(&self) -> bool {
        if self.need_dispatch.borrow().is_empty() {
            return false;
        }
        loop {
            let target = self.need_dispatch.borrow_mut().pop_front();
            let Some(target) = target else { break };
            loop {
                match target.dispatch() {
                    DispatchStatus::Complete => break,
                    DispatchStatus::DataRemains => {}
                    DispatchStatus::NeedMemory => self.wait_for_memory(),
                }
            }
        }
        true
    }

    /// Sleep the bounded OOM interval before retrying an allocation.
    pub fn wait_for_memory(&self) {
        tracing::debug!("waiting for memory");
        self.clock.sleep_ms(self.oom_wait_ms);
    }

    /// Run one iteration: poll, fire timeouts, fire watches, drain the
    /// dispatch queue once. Returns whether any work was done.
    pub fn iterate(&self, block: bool) -> bool {
        let mut did_work = false;
        let orig_depth = self.depth.get();
        let mut oom_watch_pending = false;

        let mut entries: Vec<PollEntry> = Vec::new();
        let mut watches: Vec<Rc<WatchEntry>> = Vec::new();
        let mut timeouts: Vec<Rc<TimeoutEntry>> = Vec::new();

        let have_callbacks = !self.callbacks.borrow().is_empty();
        if have_callbacks {
            for slot in self.callbacks.borrow().iter() {
                match slot {
                    CallbackSlot::Watch(watch) => {
                        if watch.last_iteration_oom.get() {
                            // skip this one this time, re-enable for the
                            // next iteration, and cap the poll timeout;
                            // report work so outer run loops don't idle
                            watch.last_iteration_oom.set(false);
                            oom_watch_pending = true;
                            did_work = true;
                            tracing::trace!(token = watch.token, "skipping watch that was out of memory");
                        } else if watch.enabled.get() {
                            entries.push(PollEntry {
                                token: watch.token,
                                events: watch.flags.get(),
                                revents: WatchFlags::empty(),
                            });
                            watches.push(watch.clone());
                        }
                    }
                    CallbackSlot::Timeout(timeout) => {
                        if timeout.enabled.get() {
                            timeouts.push(timeout.clone());
                        }
                    }
                }
            }

            let mut timeout_ms: Option<u64> = None;
            if !timeouts.is_empty() {
                let now = self.clock.wall_now();
                for timeout in &timeouts {
                    let check = check_timeout(now, timeout);
                    timeout_ms = Some(match timeout_ms {
                        None => check.remaining_ms,
                        Some(current) => current.min(check.remaining_ms),
                    });
                    if check.remaining_ms == 0 {
                        break; // not going to get shorter
                    }
                }
            }

            // never block with dispatches pending
            if !block || !self.need_dispatch.borrow().is_empty() {
                timeout_ms = Some(0);
            }
            // don't wait longer than the OOM interval to re-enable a
            // skipped watch
            if oom_watch_pending {
                timeout_ms =
                    Some(timeout_ms.map_or(self.oom_wait_ms, |t| t.min(self.oom_wait_ms)));
            }

            let n_ready = self.poller.borrow_mut().poll(&mut entries, timeout_ms);
            let initial_serial = self.list_serial.get();
            let mut abandoned = false;

            if !timeouts.is_empty() {
                let now = self.clock.wall_now();
                for timeout in &timeouts {
                    if self.list_serial.get() != initial_serial
                        || self.depth.get() != orig_depth
                    {
                        match self.restart_policy {
                            RestartPolicy::RestartFromTop => {
                                abandoned = true;
                                break;
                            }
                            RestartPolicy::FireSnapshot => {
                                if !self.timeout_registered(timeout.id) {
                                    continue;
                                }
                            }
                        }
                    }
                    if !timeout.enabled.get() {
                        continue;
                    }
                    let check = check_timeout(now, timeout);
                    if check.expired {
                        timeout.last_fired.set(now);
                        (timeout.handler)();
                        did_work = true;
                    }
                }
            }

            if !abandoned && n_ready > 0 {
                for (entry, watch) in entries.iter().zip(&watches) {
                    if self.list_serial.get() != initial_serial
                        || self.depth.get() != orig_depth
                    {
                        match self.restart_policy {
                            RestartPolicy::RestartFromTop => break,
                            RestartPolicy::FireSnapshot => {
                                if !self.watch_registered(watch.id) {
                                    continue;
                                }
                            }
                        }
                    }
                    let condition = entry.revents;
                    if !condition.is_empty() && watch.enabled.get() {
                        if !(watch.handler)(condition) {
                            watch.last_iteration_oom.set(true);
                            tracing::debug!(token = watch.token, "watch handler out of memory");
                        }
                        did_work = true;
                    }
                }
            }
        }

        if self.dispatch() {
            did_work = true;
        }
        did_work
    }

    /// Loop `iterate(true)` until a matching [`MainLoop::quit`] unwinds
    /// this call. Nested runs are allowed.
    pub fn run(&self) {
        let exit_depth = self.depth.get();
        self.depth.set(exit_depth + 1);
        tracing::trace!(depth = exit_depth + 1, "running main loop");
        while self.depth.get() != exit_depth {
            self.iterate(true);
        }
    }

    /// Unwind the innermost [`MainLoop::run`].
    pub fn quit(&self) {
        let depth = self.depth.get();
        debug_assert!(depth > 0, "quit without matching run");
        self.depth.set(depth.saturating_sub(1));
    }
}

/// Milliseconds until `timeout` fires, handling stepped clocks: a jump
/// bigger than one interval in either direction re-arms from now, so a
/// rewind can never stall a timer for more than its own interval.
fn check_timeout(now: WallTime, timeout: &TimeoutEntry) -> TimeoutCheck {
    let interval = i128::from(timeout.interval_ms.get());
    let expiration = timeout.last_fired.get().as_millis() + interval;
    let remaining = expiration - now.as_millis();

    if remaining > interval || remaining < -interval {
        tracing::debug!(remaining_ms = remaining as i64, "wall clock jumped; re-arming timeout");
        timeout.last_fired.set(now);
        return TimeoutCheck { expired: false, remaining_ms: interval as u64 };
    }
    if remaining <= 0 {
        return TimeoutCheck { expired: true, remaining_ms: 0 };
    }
    TimeoutCheck { expired: false, remaining_ms: remaining as u64 }
}
