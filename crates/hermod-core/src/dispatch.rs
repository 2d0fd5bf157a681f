//! The routing pipeline for one inbound message.
//!
//! Order of operations, for every message popped off a connection:
//! make sure the emergency reply exists, handle the synthetic
//! `Disconnected` signal, stamp the sender, route (driver / named
//! destination / nothing), fan out through the match rules, then commit
//! the transaction. Failures either roll the transaction back (out of
//! memory), reply with an error, or disconnect the peer (protocol
//! violations), never anything in between.

use std::rc::Rc;

use hermod_proto::{Message, MessageType};

use crate::{
    connection::Connection,
    context::Context,
    driver,
    env::Verdict,
    error::BusError,
    transaction::Transaction,
};

/// Whether the broker consumed the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerResult {
    /// Routed (or deliberately dropped) by the broker
    Handled,
    /// Not bus traffic; the connection's own handlers may process it
    NotYetHandled,
}

/// Route one message from `conn` through the bus.
pub fn dispatch_message(
    ctx: &Rc<Context>,
    conn: &Rc<Connection>,
    mut message: Message,
) -> HandlerResult {
    // if we cannot even afford the emergency reply, sleep until we can
    while !conn.preallocate_oom_reply() {
        ctx.wait_for_memory();
    }

    if message.destination().is_none()
        && message.is_signal(driver::LOCAL_INTERFACE, "Disconnected")
    {
        connection_disconnected(ctx, conn);
        return HandlerResult::Handled;
    }
    if message.destination().is_none() && message.message_type() != MessageType::Signal {
        // peer-to-peer traffic that never goes "on the bus"
        return HandlerResult::NotYetHandled;
    }

    let mut transaction = Transaction::new(ctx.clone());
    let mut error: Option<BusError> = None;
    let mut addressed_recipient: Option<Rc<Connection>> = None;
    let mut disconnected_by_us = false;

    'routing: {
        // stamp the sender so recipients and match rules see the
        // broker-assigned identity
        if conn.is_active() {
            let sender = conn.unique_name().expect("active connections are named");
            if let Err(err) = message.set_sender(Some(&sender)) {
                error = Some(err.into());
                break 'routing;
            }
        }
        // the destination is re-read after stamping; header mutation
        // must not leave us routing on stale data
        let destination = message.destination().map(str::to_owned);

        if destination.as_deref() == Some(driver::DRIVER_NAME) {
            if ctx.policy().check(Some(conn), None, None, &message) == Verdict::Deny {
                tracing::warn!(id = conn.id(), "policy denied message to the driver");
                error = Some(BusError::AccessDenied);
                break 'routing;
            }
            match driver::handle_message(ctx, conn, &mut transaction, &message) {
                Ok(()) => {}
                Err(err) if err.disconnects() => {
                    tracing::warn!(id = conn.id(), %err, "disconnecting client");
                    conn.shutdown("protocol violation");
                    disconnected_by_us = true;
                    break 'routing;
                }
                Err(err) => {
                    error = Some(err);
                    break 'routing;
                }
            }
        } else if !conn.is_active() {
            // clients must talk to the driver before anything else
            tracing::warn!(id = conn.id(), "message from unregistered client");
            conn.shutdown("client sent traffic before Hello");
            disconnected_by_us = true;
            break 'routing;
        } else if let Some(name) = destination.as_deref() {
            match ctx.lookup_owner(name) {
                None => {
                    error = Some(BusError::ServiceDoesNotExist(name.to_owned()));
                    break 'routing;
                }
                Some(recipient) => {
                    let verdict = ctx.policy().check(
                        Some(conn),
                        Some(&recipient),
                        Some(&recipient),
                        &message,
                    );
                    if verdict == Verdict::Deny {
                        tracing::warn!(
                            id = conn.id(),
                            destination = name,
                            "policy denied addressed message"
                        );
                        error = Some(BusError::AccessDenied);
                        break 'routing;
                    }
                    if let Err(err) = transaction.add_send(&recipient, &message) {
                        error = Some(err);
                        break 'routing;
                    }
                    addressed_recipient = Some(recipient);
                }
            }
        }

        // signals (and anything else a rule asks for) fan out to
        // subscribers beyond the addressed recipient
        if let Err(err) = dispatch_matches(
            ctx,
            &mut transaction,
            Some(conn),
            addressed_recipient.as_ref(),
            &message,
        ) {
            error = Some(err);
        }
    }

    if let Some(err) = error {
        if !conn.is_connected() || disconnected_by_us {
            tracing::debug!(id = conn.id(), %err, "not replying to a disconnected sender");
        } else if matches!(err, BusError::NoMemory) {
            transaction.cancel_and_free();
            conn.send_oom_reply(ctx, &message);
            return HandlerResult::Handled;
        } else if transaction.send_error_reply(conn, &err, &message).is_err() {
            // could not even build the error reply; fall back to the
            // preallocated one
            transaction.cancel_and_free();
            conn.send_oom_reply(ctx, &message);
            return HandlerResult::Handled;
        }
    }
    transaction.commit_and_free();
    HandlerResult::Handled
}

/// Plan delivery to every connection whose match rules accept
/// `message`, excluding the sender and the addressed recipient.
/// Policy denials here are silent: one audit line, no reply.
pub(crate) fn dispatch_matches(
    ctx: &Rc<Context>,
    transaction: &mut Transaction,
    sender: Option<&Rc<Connection>>,
    addressed_recipient: Option<&Rc<Connection>>,
    message: &Message,
) -> Result<(), BusError> {
    let recipients = ctx.matchmaker_mut().recipients(
        message,
        sender.map(|conn| conn.id()),
        addressed_recipient.map(|conn| conn.id()),
    );
    for id in recipients {
        let Some(recipient) = ctx.connection(id) else { continue };
        let verdict =
            ctx.policy().check(sender, addressed_recipient, Some(&recipient), message);
        if verdict == Verdict::Deny {
            tracing::warn!(recipient = id, "policy denied matched delivery");
            continue;
        }
        transaction.add_send(&recipient, message)?;
    }
    Ok(())
}

/// Release everything a disconnected connection held: names (promoting
/// queued waiters and signalling the changes), match rules, queued
/// output, and finally the connection record itself.
pub(crate) fn connection_disconnected(ctx: &Rc<Context>, conn: &Rc<Connection>) {
    tracing::debug!(id = conn.id(), name = ?conn.unique_name(), "connection disconnected");

    let changes = ctx.registry_mut().drop_connection(conn.id());
    ctx.matchmaker_mut().remove_connection(conn.id());
    let unique = conn.unique_name();

    if !changes.is_empty() || unique.is_some() {
        // teardown must complete; retry the signals until memory allows
        loop {
            let mut transaction = Transaction::new(ctx.clone());
            let result =
                driver::send_ownership_signals(ctx, &mut transaction, &changes).and_then(|()| {
                    match unique.as_deref() {
                        // the unique name disappears from the bus too
                        Some(unique) => driver::send_name_owner_changed(
                            ctx,
                            &mut transaction,
                            unique,
                            Some(unique),
                            None,
                        ),
                        None => Ok(()),
                    }
                });
            match result {
                Ok(()) => {
                    transaction.commit_and_free();
                    break;
                }
                Err(BusError::NoMemory) => {
                    transaction.cancel_and_free();
                    ctx.wait_for_memory();
                }
                Err(err) => {
                    tracing::warn!(%err, "dropping disconnect signals");
                    transaction.cancel_and_free();
                    break;
                }
            }
        }
    }

    conn.finalize_disconnect();
    ctx.remove_connection(conn.id());
}
