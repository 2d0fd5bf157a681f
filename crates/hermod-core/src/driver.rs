//! The bus driver: the broker's own service.
//!
//! Messages addressed to `org.freedesktop.DBus` land here. The driver
//! issues unique names, manages well-known name ownership, maintains
//! match rules, and answers introspection-free queries like `ListNames`.
//! Its replies and signals are ordinary messages sent through the same
//! transaction as everything else.
//!
//! A connection that has not completed `Hello` may call nothing but
//! `Hello`; anything else is a protocol violation and disconnects it.

use std::rc::Rc;

use hermod_proto::{Message, MessageType, Value, names};

use crate::{
    connection::Connection,
    context::Context,
    dispatch,
    env::ActivationResult,
    error::BusError,
    registry::OwnershipChange,
    rules::MatchRule,
    transaction::Transaction,
};

/// The reserved name the driver owns.
pub const DRIVER_NAME: &str = "org.freedesktop.DBus";

/// Object path the driver's methods live at.
pub const DRIVER_PATH: &str = "/org/freedesktop/DBus";

/// Interface of the driver's methods and name signals.
pub const DRIVER_INTERFACE: &str = "org.freedesktop.DBus";

/// Interface of broker-local synthetic signals.
pub const LOCAL_INTERFACE: &str = "org.freedesktop.DBus.Local";

/// Path of broker-local synthetic signals.
pub const LOCAL_PATH: &str = "/org/freedesktop/DBus/Local";

/// `StartServiceByName`: the service was started.
pub const START_REPLY_SUCCESS: u32 = 1;

/// `StartServiceByName`: the service already had an owner.
pub const START_REPLY_ALREADY_RUNNING: u32 = 2;

/// Handle a message addressed to the driver.
///
/// Replies are planned on `transaction`; a returned error becomes an
/// error reply (or a disconnect, for protocol violations).
pub(crate) fn handle_message(
    ctx: &Rc<Context>,
    conn: &Rc<Connection>,
    transaction: &mut Transaction,
    message: &Message,
) -> Result<(), BusError> {
    if message.message_type() != MessageType::MethodCall {
        // returns and errors addressed to the driver are dropped
        return Ok(());
    }
    if let Some(interface) = message.interface() {
        if interface != DRIVER_INTERFACE {
            return Err(BusError::UnknownMethod(format!(
                "{interface} is not supported by the message bus"
            )));
        }
    }
    let member = message
        .member()
        .ok_or_else(|| BusError::InvalidArgs("method call without member".into()))?;

    if !conn.is_active() && member != "Hello" {
        return Err(BusError::ProtocolViolation(format!(
            "client called {member} before Hello"
        )));
    }

    tracing::debug!(id = conn.id(), member, "driver handling method");
    match member {
        "Hello" => hello(ctx, conn, transaction, message),
        "RequestName" => request_name(ctx, conn, transaction, message),
        "ReleaseName" => release_name(ctx, conn, transaction, message),
        "ListNames" => list_names(ctx, conn, transaction, message),
        "NameHasOwner" => name_has_owner(ctx, conn, transaction, message),
        "GetNameOwner" => get_name_owner(ctx, conn, transaction, message),
        "AddMatch" => add_match(ctx, conn, transaction, message),
        "RemoveMatch" => remove_match(ctx, conn, transaction, message),
        "StartServiceByName" => start_service_by_name(ctx, conn, transaction, message),
        other => Err(BusError::UnknownMethod(other.to_owned())),
    }
}

/// Check the body signature and decode the arguments.
fn args(message: &Message, expected: &str) -> Result<Vec<Value>, BusError> {
    if message.signature().as_str() != expected {
        return Err(BusError::InvalidArgs(format!(
            "expected signature \"{expected}\", got \"{}\"",
            message.signature()
        )));
    }
    message.body_values().map_err(|err| BusError::InvalidArgs(err.to_string()))
}

fn string_arg(values: &[Value], index: usize) -> Result<&str, BusError> {
    values
        .get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| BusError::InvalidArgs(format!("argument {index} must be a string")))
}

fn u32_arg(values: &[Value], index: usize) -> Result<u32, BusError> {
    values
        .get(index)
        .and_then(Value::as_u32)
        .ok_or_else(|| BusError::InvalidArgs(format!("argument {index} must be a uint32")))
}

/// Give a broker-originated message its sender and serial.
fn stamp(ctx: &Context, message: &mut Message) {
    message.set_sender(Some(DRIVER_NAME)).expect("driver name is valid");
    message.set_serial(ctx.next_serial());
}

/// Plan the method return for `call`, honoring the no-reply flag.
fn send_reply(
    ctx: &Rc<Context>,
    conn: &Rc<Connection>,
    transaction: &mut Transaction,
    call: &Message,
    body: &[Value],
) -> Result<(), BusError> {
    if !call.expects_reply() {
        return Ok(());
    }
    let mut reply = Message::method_return(call);
    reply.set_body(body).map_err(BusError::from)?;
    stamp(ctx, &mut reply);
    transaction.add_send(conn, &reply)
}

fn hello(
    ctx: &Rc<Context>,
    conn: &Rc<Connection>,
    transaction: &mut Transaction,
    call: &Message,
) -> Result<(), BusError> {
    if conn.is_active() {
        return Err(BusError::Failed("already handled a Hello message".into()));
    }
    let name = ctx.registry_mut().issue_unique_name(conn.id());
    conn.set_registered(&name);
    tracing::debug!(id = conn.id(), name, "issued unique name");

    // the call predates the sender stamp, so address the reply by hand
    if call.expects_reply() {
        let mut reply = Message::method_return(call);
        reply.set_destination(Some(&name)).map_err(BusError::from)?;
        reply.set_body(&[Value::Str(name.clone())]).map_err(BusError::from)?;
        stamp(ctx, &mut reply);
        transaction.add_send(conn, &reply)?;
    }
    send_name_acquired(ctx, conn, transaction, &name)?;
    send_name_owner_changed(ctx, transaction, &name, None, Some(&name))?;
    Ok(())
}

fn request_name(
    ctx: &Rc<Context>,
    conn: &Rc<Connection>,
    transaction: &mut Transaction,
    call: &Message,
) -> Result<(), BusError> {
    let values = args(call, "su")?;
    let name = string_arg(&values, 0)?;
    let flags = u32_arg(&values, 1)?;

    if !names::is_valid_well_known_name(name) {
        return Err(BusError::InvalidArgs(format!(
            "\"{name}\" is not a valid well-known name"
        )));
    }
    if name == DRIVER_NAME {
        return Err(BusError::InvalidArgs(format!("cannot acquire the {DRIVER_NAME} name")));
    }

    let (reply, change) = ctx.registry_mut().request_name(conn.id(), name, flags);
    if let Some(change) = change {
        send_change_signals(ctx, transaction, &change)?;
    }
    send_reply(ctx, conn, transaction, call, &[Value::Uint32(reply as u32)])
}

fn release_name(
    ctx: &Rc<Context>,
    conn: &Rc<Connection>,
    transaction: &mut Transaction,
    call: &Message,
) -> Result<(), BusError> {
    let values = args(call, "s")?;
    let name = string_arg(&values, 0)?;

    let (reply, change) = ctx.registry_mut().release_name(conn.id(), name);
    if let Some(change) = change {
        send_change_signals(ctx, transaction, &change)?;
    }
    send_reply(ctx, conn, transaction, call, &[Value::Uint32(reply as u32)])
}

fn list_names(
    ctx: &Rc<Context>,
    conn: &Rc<Connection>,
    transaction: &mut Transaction,
    call: &Message,
) -> Result<(), BusError> {
    args(call, "")?;
    let mut names = vec![DRIVER_NAME.to_owned()];
    names.extend(ctx.registry_mut().list_names());
    let items = names.into_iter().map(Value::Str).collect();
    let body = Value::Array {
        element: hermod_proto::Signature::new("s").expect("static signature"),
        items,
    };
    send_reply(ctx, conn, transaction, call, &[body])
}

fn name_has_owner(
    ctx: &Rc<Context>,
    conn: &Rc<Connection>,
    transaction: &mut Transaction,
    call: &Message,
) -> Result<(), BusError> {
    let values = args(call, "s")?;
    let name = string_arg(&values, 0)?;
    let owned = name == DRIVER_NAME || ctx.registry_mut().has_owner(name);
    send_reply(ctx, conn, transaction, call, &[Value::Bool(owned)])
}

fn get_name_owner(
    ctx: &Rc<Context>,
    conn: &Rc<Connection>,
    transaction: &mut Transaction,
    call: &Message,
) -> Result<(), BusError> {
    let values = args(call, "s")?;
    let name = string_arg(&values, 0)?;

    let owner = if name == DRIVER_NAME {
        Some(DRIVER_NAME.to_owned())
    } else {
        ctx.registry_mut()
            .lookup(name)
            .and_then(|id| ctx.connection(id))
            .and_then(|owner| owner.unique_name())
    };
    match owner {
        Some(owner) => send_reply(ctx, conn, transaction, call, &[Value::Str(owner)]),
        None => Err(BusError::NameHasNoOwner(name.to_owned())),
    }
}

fn add_match(
    ctx: &Rc<Context>,
    conn: &Rc<Connection>,
    transaction: &mut Transaction,
    call: &Message,
) -> Result<(), BusError> {
    let values = args(call, "s")?;
    let text = string_arg(&values, 0)?;
    let rule =
        MatchRule::parse(text).map_err(|err| BusError::MatchRuleInvalid(err.to_string()))?;
    ctx.matchmaker_mut().add(conn.id(), rule);
    tracing::debug!(id = conn.id(), rule = text, "added match rule");
    send_reply(ctx, conn, transaction, call, &[])
}

fn remove_match(
    ctx: &Rc<Context>,
    conn: &Rc<Connection>,
    transaction: &mut Transaction,
    call: &Message,
) -> Result<(), BusError> {
    let values = args(call, "s")?;
    let text = string_arg(&values, 0)?;
    let rule =
        MatchRule::parse(text).map_err(|err| BusError::MatchRuleInvalid(err.to_string()))?;
    if !ctx.matchmaker_mut().remove(conn.id(), &rule) {
        return Err(BusError::MatchRuleNotFound);
    }
    send_reply(ctx, conn, transaction, call, &[])
}

fn start_service_by_name(
    ctx: &Rc<Context>,
    conn: &Rc<Connection>,
    transaction: &mut Transaction,
    call: &Message,
) -> Result<(), BusError> {
    let values = args(call, "su")?;
    let name = string_arg(&values, 0)?;
    let _flags = u32_arg(&values, 1)?;

    if !names::is_valid_well_known_name(name) {
        return Err(BusError::InvalidArgs(format!(
            "\"{name}\" is not a valid service name"
        )));
    }
    if name == DRIVER_NAME || ctx.registry_mut().has_owner(name) {
        return send_reply(
            ctx,
            conn,
            transaction,
            call,
            &[Value::Uint32(START_REPLY_ALREADY_RUNNING)],
        );
    }
    let code = match ctx.activator().activate(name) {
        ActivationResult::Started => START_REPLY_SUCCESS,
        ActivationResult::AlreadyRunning => START_REPLY_ALREADY_RUNNING,
        ActivationResult::Unknown => return Err(BusError::ServiceUnknown(name.to_owned())),
    };
    send_reply(ctx, conn, transaction, call, &[Value::Uint32(code)])
}

// Name signals

/// Emit the signals for one ownership transition: `NameLost` to the old
/// owner, `NameAcquired` to the new one, `NameOwnerChanged` broadcast.
pub(crate) fn send_change_signals(
    ctx: &Rc<Context>,
    transaction: &mut Transaction,
    change: &OwnershipChange,
) -> Result<(), BusError> {
    let old_conn = change.old_owner.and_then(|id| ctx.connection(id));
    let new_conn = change.new_owner.and_then(|id| ctx.connection(id));
    let old_name = old_conn.as_ref().and_then(|conn| conn.unique_name());
    let new_name = new_conn.as_ref().and_then(|conn| conn.unique_name());

    if let Some(old_conn) = &old_conn {
        send_name_lost(ctx, old_conn, transaction, &change.name)?;
    }
    if let Some(new_conn) = &new_conn {
        send_name_acquired(ctx, new_conn, transaction, &change.name)?;
    }
    send_name_owner_changed(
        ctx,
        transaction,
        &change.name,
        old_name.as_deref(),
        new_name.as_deref(),
    )
}

/// Emit signals for a batch of transitions (connection teardown).
pub(crate) fn send_ownership_signals(
    ctx: &Rc<Context>,
    transaction: &mut Transaction,
    changes: &[OwnershipChange],
) -> Result<(), BusError> {
    for change in changes {
        send_change_signals(ctx, transaction, change)?;
    }
    Ok(())
}

fn send_name_acquired(
    ctx: &Rc<Context>,
    conn: &Rc<Connection>,
    transaction: &mut Transaction,
    name: &str,
) -> Result<(), BusError> {
    let Some(unique) = conn.unique_name() else { return Ok(()) };
    let mut signal =
        Message::signal(DRIVER_PATH, DRIVER_INTERFACE, "NameAcquired").map_err(BusError::from)?;
    signal.set_destination(Some(&unique)).map_err(BusError::from)?;
    signal.set_body(&[Value::Str(name.to_owned())]).map_err(BusError::from)?;
    stamp(ctx, &mut signal);
    transaction.add_send(conn, &signal)
}

fn send_name_lost(
    ctx: &Rc<Context>,
    conn: &Rc<Connection>,
    transaction: &mut Transaction,
    name: &str,
) -> Result<(), BusError> {
    let Some(unique) = conn.unique_name() else { return Ok(()) };
    let mut signal =
        Message::signal(DRIVER_PATH, DRIVER_INTERFACE, "NameLost").map_err(BusError::from)?;
    signal.set_destination(Some(&unique)).map_err(BusError::from)?;
    signal.set_body(&[Value::Str(name.to_owned())]).map_err(BusError::from)?;
    stamp(ctx, &mut signal);
    transaction.add_send(conn, &signal)
}

/// Broadcast `NameOwnerChanged(name, old, new)` through the match
/// rules; absent owners are encoded as empty strings.
pub(crate) fn send_name_owner_changed(
    ctx: &Rc<Context>,
    transaction: &mut Transaction,
    name: &str,
    old_owner: Option<&str>,
    new_owner: Option<&str>,
) -> Result<(), BusError> {
    let mut signal = Message::signal(DRIVER_PATH, DRIVER_INTERFACE, "NameOwnerChanged")
        .map_err(BusError::from)?;
    signal
        .set_body(&[
            Value::Str(name.to_owned()),
            Value::Str(old_owner.unwrap_or_default().to_owned()),
            Value::Str(new_owner.unwrap_or_default().to_owned()),
        ])
        .map_err(BusError::from)?;
    stamp(ctx, &mut signal);
    dispatch::dispatch_matches(ctx, transaction, None, None, &signal)
}
