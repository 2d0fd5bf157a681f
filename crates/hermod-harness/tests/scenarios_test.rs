//! End-to-end scenarios over the real wire format: registration,
//! routing errors, signal fan-out, and protocol violations.

use hermod_core::driver;
use hermod_harness::BusHarness;
use hermod_proto::{Message, MessageType, Value};

fn is_unique_name_shape(name: &str) -> bool {
    let Some(rest) = name.strip_prefix(':') else { return false };
    let mut parts = rest.split('.');
    let (Some(major), Some(minor), None) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    !major.is_empty()
        && !minor.is_empty()
        && major.chars().all(|c| c.is_ascii_digit())
        && minor.chars().all(|c| c.is_ascii_digit())
}

#[test]
fn hello_handshake_issues_unique_name() {
    let harness = BusHarness::new();
    let mut client = harness.connect();

    let call = Message::method_call(
        Some(driver::DRIVER_NAME),
        driver::DRIVER_PATH,
        Some(driver::DRIVER_INTERFACE),
        "Hello",
    )
    .unwrap();
    let serial = client.send(&harness, call);

    // one method return carrying the new unique name
    let reply = client.recv(&harness);
    assert_eq!(reply.message_type(), MessageType::MethodReturn);
    assert_eq!(reply.reply_serial(), Some(serial));
    assert_eq!(reply.sender(), Some(driver::DRIVER_NAME));
    let body = reply.body_values().unwrap();
    assert_eq!(body.len(), 1);
    let name = body[0].as_str().unwrap();
    assert!(is_unique_name_shape(name), "unexpected unique name {name:?}");

    // then the NameAcquired signal for the same name
    let acquired = client.recv(&harness);
    assert!(acquired.is_signal(driver::DRIVER_INTERFACE, "NameAcquired"));
    assert_eq!(acquired.body_values().unwrap(), vec![Value::Str(name.to_owned())]);

    // and nothing else
    harness.pump();
    assert!(client.try_recv().is_none());
}

#[test]
fn unique_names_differ_between_clients() {
    let harness = BusHarness::new();
    let mut first = harness.connect();
    let mut second = harness.connect();
    let first_name = first.hello(&harness);
    let second_name = second.hello(&harness);
    assert_ne!(first_name, second_name);
}

#[test]
fn call_to_nonexistent_service_yields_error_reply() {
    let harness = BusHarness::new();
    let mut client = harness.connect();
    client.hello(&harness);

    let call = Message::method_call(
        Some("test.nonexistent.xyz"),
        "/test",
        Some("test.Iface"),
        "Poke",
    )
    .unwrap();
    let serial = client.send(&harness, call);

    let reply = client.recv(&harness);
    assert_eq!(reply.message_type(), MessageType::Error);
    assert_eq!(
        reply.error_name(),
        Some("org.freedesktop.DBus.Error.ServiceDoesNotExist")
    );
    assert_eq!(reply.reply_serial(), Some(serial));
    assert_eq!(reply.sender(), Some(driver::DRIVER_NAME));

    harness.pump();
    assert!(client.try_recv().is_none(), "exactly one reply expected");
}

#[test]
fn signal_fans_out_to_subscribers_but_not_the_emitter() {
    let harness = BusHarness::new();
    let mut a = harness.connect();
    let mut b = harness.connect();
    let mut c = harness.connect();
    a.hello(&harness);
    b.hello(&harness);
    c.hello(&harness);

    a.add_match(&harness, "type='signal'");
    b.add_match(&harness, "type='signal'");
    c.add_match(&harness, "type='signal'");
    // a second matching rule must not cause duplicate delivery
    b.add_match(&harness, "interface='test.Events'");

    a.emit_signal(&harness, "/test", "test.Events", "Pulse", &[Value::Uint32(99)]);
    harness.pump();

    for client in [&mut b, &mut c] {
        let signal = client.recv(&harness);
        assert!(signal.is_signal("test.Events", "Pulse"));
        assert_eq!(signal.sender(), a.unique_name.as_deref());
        assert_eq!(signal.body_values().unwrap(), vec![Value::Uint32(99)]);
        assert!(client.try_recv().is_none(), "exactly one copy per subscriber");
    }
    assert!(a.try_recv().is_none(), "the emitter receives nothing");
}

#[test]
fn signals_respect_rule_filters() {
    let harness = BusHarness::new();
    let mut emitter = harness.connect();
    let mut interested = harness.connect();
    let mut uninterested = harness.connect();
    emitter.hello(&harness);
    interested.hello(&harness);
    uninterested.hello(&harness);

    interested.add_match(&harness, "type='signal',member='Wanted'");
    uninterested.add_match(&harness, "type='signal',member='Other'");

    emitter.emit_signal(&harness, "/", "test.Events", "Wanted", &[]);
    harness.pump();

    assert!(interested.recv(&harness).is_signal("test.Events", "Wanted"));
    assert!(uninterested.try_recv().is_none());
}

#[test]
fn non_hello_before_registration_disconnects_silently() {
    let harness = BusHarness::new();
    let mut client = harness.connect();

    let call = Message::method_call(
        Some(driver::DRIVER_NAME),
        driver::DRIVER_PATH,
        Some(driver::DRIVER_INTERFACE),
        "ListNames",
    )
    .unwrap();
    client.send(&harness, call);
    harness.pump();

    assert!(client.pipe.is_closed(), "connection must be dropped");
    assert!(client.try_recv().is_none(), "no reply is sent");
    assert_eq!(harness.ctx.connection_count(), 0, "bus state fully released");
}

#[test]
fn traffic_to_peers_before_registration_disconnects() {
    let harness = BusHarness::new();
    let mut owner = harness.connect();
    owner.hello(&harness);
    let reply = owner.call_driver(
        &harness,
        "RequestName",
        &[Value::Str("com.example.Owner".into()), Value::Uint32(0)],
    );
    assert_eq!(reply.message_type(), MessageType::MethodReturn);

    let mut rogue = harness.connect();
    let call = Message::method_call(
        Some("com.example.Owner"),
        "/anything",
        Some("com.example.Iface"),
        "Poke",
    )
    .unwrap();
    rogue.send(&harness, call);
    harness.pump();

    assert!(rogue.pipe.is_closed());
    assert!(owner.try_recv().is_none(), "the call must not be delivered");
}

#[test]
fn method_calls_route_to_the_name_owner() {
    let harness = BusHarness::new();
    let mut server = harness.connect();
    let mut client = harness.connect();
    let server_name = server.hello(&harness);
    client.hello(&harness);

    let reply = server.call_driver(
        &harness,
        "RequestName",
        &[Value::Str("com.example.Calc".into()), Value::Uint32(0)],
    );
    assert_eq!(reply.body_values().unwrap(), vec![Value::Uint32(1)], "primary owner");

    let mut call =
        Message::method_call(Some("com.example.Calc"), "/calc", Some("com.example.Calc"), "Add")
            .unwrap();
    call.set_body(&[Value::Int32(2), Value::Int32(3)]).unwrap();
    let serial = client.send(&harness, call);

    let delivered = server.recv(&harness);
    assert_eq!(delivered.message_type(), MessageType::MethodCall);
    assert_eq!(delivered.member(), Some("Add"));
    assert_eq!(delivered.serial(), serial, "relayed with the sender's serial");
    assert_eq!(delivered.sender(), client.unique_name.as_deref());
    assert_eq!(delivered.destination(), Some("com.example.Calc"));
    assert_eq!(
        delivered.body_values().unwrap(),
        vec![Value::Int32(2), Value::Int32(3)]
    );

    // the server answers through the bus, addressed to the unique name
    let mut answer = Message::method_return(&delivered);
    answer.set_body(&[Value::Int32(5)]).unwrap();
    server.send(&harness, answer);

    let result = client.recv(&harness);
    assert_eq!(result.message_type(), MessageType::MethodReturn);
    assert_eq!(result.reply_serial(), Some(serial));
    assert_eq!(result.sender(), Some(server_name.as_str()));
    assert_eq!(result.body_values().unwrap(), vec![Value::Int32(5)]);
}

#[test]
fn disconnect_drops_pending_state() {
    let harness = BusHarness::new();
    let mut watcher = harness.connect();
    let mut leaver = harness.connect();
    watcher.hello(&harness);
    let leaver_name = leaver.hello(&harness);

    watcher.add_match(
        &harness,
        "type='signal',interface='org.freedesktop.DBus',member='NameOwnerChanged'",
    );
    leaver.call_driver(
        &harness,
        "RequestName",
        &[Value::Str("com.example.Gone".into()), Value::Uint32(0)],
    );
    // consume the ownership signal for the request itself
    let changed = watcher.recv(&harness);
    assert!(changed.is_signal(driver::DRIVER_INTERFACE, "NameOwnerChanged"));

    leaver.pipe.close();
    harness.pump();

    let changed = watcher.recv(&harness);
    assert!(changed.is_signal(driver::DRIVER_INTERFACE, "NameOwnerChanged"));
    assert_eq!(
        changed.body_values().unwrap(),
        vec![
            Value::Str("com.example.Gone".into()),
            Value::Str(leaver_name),
            Value::Str(String::new()),
        ]
    );
    assert_eq!(harness.ctx.connection_count(), 1, "the leaver is forgotten");
}
