//! Scripted memory quota for fault injection.

use std::cell::Cell;
use std::rc::Rc;

use hermod_core::MemoryQuota;

/// A quota that can be switched into a failing state at any point, with
/// a running balance of outstanding reservations for leak checks.
#[derive(Debug, Default)]
pub struct ScriptedQuota {
    failing: Cell<bool>,
    outstanding: Cell<usize>,
    refusals: Cell<usize>,
}

impl ScriptedQuota {
    /// A working quota.
    pub fn new() -> Rc<ScriptedQuota> {
        Rc::new(ScriptedQuota::default())
    }

    /// Switch every subsequent reservation to fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.set(failing);
    }

    /// Bytes currently reserved and not yet released.
    pub fn outstanding(&self) -> usize {
        self.outstanding.get()
    }

    /// How many reservations have been refused so far.
    pub fn refusals(&self) -> usize {
        self.refusals.get()
    }
}

impl MemoryQuota for ScriptedQuota {
    fn try_reserve(&self, bytes: usize) -> bool {
        if self.failing.get() {
            self.refusals.set(self.refusals.get() + 1);
            return false;
        }
        self.outstanding.set(self.outstanding.get() + bytes);
        true
    }

    fn release(&self, bytes: usize) {
        self.outstanding.set(self.outstanding.get().saturating_sub(bytes));
    }
}
