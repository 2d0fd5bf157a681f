//! Transactional multi-recipient delivery.
//!
//! A transaction accumulates planned sends, each backed by a reserved
//! slice of outgoing queue space, plus hooks to run on the two
//! outcomes. Committing flushes the plan into the recipients' queues in
//! the order it was added; cancelling returns the reservations and runs
//! the cancel hooks without ever touching a queue. A dispatch that
//! fails therefore leaves every recipient exactly as it found them.

use std::rc::Rc;

use hermod_proto::Message;

use crate::{connection::Connection, context::Context, driver, error::BusError};

struct PlannedSend {
    conn: Rc<Connection>,
    frame: Vec<u8>,
}

/// One all-or-nothing delivery plan.
pub struct Transaction {
    ctx: Rc<Context>,
    plan: Vec<PlannedSend>,
    commit_hooks: Vec<Box<dyn FnOnce()>>,
    cancel_hooks: Vec<Box<dyn FnOnce()>>,
}

impl Transaction {
    /// Open an empty transaction. Cheap; nothing is reserved yet.
    pub fn new(ctx: Rc<Context>) -> Transaction {
        Transaction { ctx, plan: Vec::new(), commit_hooks: Vec::new(), cancel_hooks: Vec::new() }
    }

    /// The context this transaction routes within.
    pub fn context(&self) -> &Rc<Context> {
        &self.ctx
    }

    /// Number of planned sends so far.
    pub fn send_count(&self) -> usize {
        self.plan.len()
    }

    /// Plan delivery of `message` to `conn`, reserving queue space now.
    ///
    /// Fails atomically with [`BusError::NoMemory`] when the
    /// reservation is refused; earlier planned sends stay planned.
    /// Sends to connections that already disconnected are silently
    /// dropped, matching delivery semantics at commit time.
    pub fn add_send(&mut self, conn: &Rc<Connection>, message: &Message) -> Result<(), BusError> {
        if !conn.is_connected() {
            return Ok(());
        }
        let frame = message.encode().map_err(BusError::from)?;
        if !conn.reserve_outgoing(frame.len()) {
            return Err(BusError::NoMemory);
        }
        self.plan.push(PlannedSend { conn: conn.clone(), frame });
        Ok(())
    }

    /// Run `hook` if the transaction commits.
    pub fn add_commit_hook(&mut self, hook: impl FnOnce() + 'static) {
        self.commit_hooks.push(Box::new(hook));
    }

    /// Run `hook` if the transaction is cancelled.
    pub fn add_cancel_hook(&mut self, hook: impl FnOnce() + 'static) {
        self.cancel_hooks.push(Box::new(hook));
    }

    /// Plan an error reply to `in_reply_to` describing `err`.
    pub fn send_error_reply(
        &mut self,
        conn: &Rc<Connection>,
        err: &BusError,
        in_reply_to: &Message,
    ) -> Result<(), BusError> {
        let mut reply = Message::error_reply(in_reply_to, &err.name(), &err.to_string())
            .map_err(BusError::from)?;
        reply.set_sender(Some(driver::DRIVER_NAME)).map_err(BusError::from)?;
        reply.set_serial(self.ctx.next_serial());
        self.add_send(conn, &reply)
    }

    /// Flush every planned send in order, then run the commit hooks.
    pub fn commit_and_free(self) {
        for send in self.plan {
            send.conn.queue_reserved_frame(send.frame);
        }
        for hook in self.commit_hooks {
            hook();
        }
    }

    /// Discard the plan, return the reservations, run the cancel hooks.
    /// No recipient queue is mutated.
    pub fn cancel_and_free(self) {
        for send in self.plan {
            send.conn.release_reservation(send.frame.len());
        }
        for hook in self.cancel_hooks {
            hook();
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("planned_sends", &self.plan.len())
            .field("commit_hooks", &self.commit_hooks.len())
            .field("cancel_hooks", &self.cancel_hooks.len())
            .finish()
    }
}
