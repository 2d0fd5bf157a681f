//! Driver coverage: name ownership, queueing, queries, match-rule
//! management, and activation.

use hermod_core::{ActivationResult, Activator, driver};
use hermod_harness::BusHarness;
use hermod_proto::{MessageType, Value};

const NAME: &str = "com.example.Queue";

#[test]
fn ownership_queue_promotes_in_order() {
    let harness = BusHarness::new();
    let mut a = harness.connect();
    let mut b = harness.connect();
    let a_name = a.hello(&harness);
    let b_name = b.hello(&harness);

    let reply =
        a.call_driver(&harness, "RequestName", &[Value::Str(NAME.into()), Value::Uint32(0)]);
    assert_eq!(reply.body_values().unwrap(), vec![Value::Uint32(1)], "PRIMARY_OWNER");

    let reply =
        b.call_driver(&harness, "RequestName", &[Value::Str(NAME.into()), Value::Uint32(0)]);
    assert_eq!(reply.body_values().unwrap(), vec![Value::Uint32(2)], "IN_QUEUE");

    let reply =
        a.call_driver(&harness, "RequestName", &[Value::Str(NAME.into()), Value::Uint32(0)]);
    assert_eq!(reply.body_values().unwrap(), vec![Value::Uint32(4)], "ALREADY_OWNER");

    let reply = a.call_driver(&harness, "GetNameOwner", &[Value::Str(NAME.into())]);
    assert_eq!(reply.body_values().unwrap(), vec![Value::Str(a_name.clone())]);

    // releasing hands the name to the queued waiter
    let reply = a.call_driver(&harness, "ReleaseName", &[Value::Str(NAME.into())]);
    assert_eq!(reply.body_values().unwrap(), vec![Value::Uint32(1)], "RELEASED");

    let acquired = b.recv(&harness);
    assert!(acquired.is_signal(driver::DRIVER_INTERFACE, "NameAcquired"));
    assert_eq!(acquired.body_values().unwrap(), vec![Value::Str(NAME.into())]);
    assert_eq!(acquired.destination(), Some(b_name.as_str()));

    let reply = b.call_driver(&harness, "GetNameOwner", &[Value::Str(NAME.into())]);
    assert_eq!(reply.body_values().unwrap(), vec![Value::Str(b_name)]);
}

#[test]
fn do_not_queue_gets_exists() {
    let harness = BusHarness::new();
    let mut a = harness.connect();
    let mut b = harness.connect();
    a.hello(&harness);
    b.hello(&harness);

    a.call_driver(&harness, "RequestName", &[Value::Str(NAME.into()), Value::Uint32(0)]);
    let reply = b.call_driver(
        &harness,
        "RequestName",
        &[Value::Str(NAME.into()), Value::Uint32(4)], // DO_NOT_QUEUE
    );
    assert_eq!(reply.body_values().unwrap(), vec![Value::Uint32(3)], "EXISTS");
}

#[test]
fn name_queries() {
    let harness = BusHarness::new();
    let mut client = harness.connect();
    let unique = client.hello(&harness);

    let reply = client.call_driver(&harness, "NameHasOwner", &[Value::Str(NAME.into())]);
    assert_eq!(reply.body_values().unwrap(), vec![Value::Bool(false)]);

    client.call_driver(&harness, "RequestName", &[Value::Str(NAME.into()), Value::Uint32(0)]);
    let reply = client.call_driver(&harness, "NameHasOwner", &[Value::Str(NAME.into())]);
    assert_eq!(reply.body_values().unwrap(), vec![Value::Bool(true)]);

    let reply = client.call_driver(
        &harness,
        "NameHasOwner",
        &[Value::Str(driver::DRIVER_NAME.into())],
    );
    assert_eq!(reply.body_values().unwrap(), vec![Value::Bool(true)]);

    let reply =
        client.call_driver(&harness, "GetNameOwner", &[Value::Str("com.example.Nope".into())]);
    assert_eq!(reply.message_type(), MessageType::Error);
    assert_eq!(reply.error_name(), Some("org.freedesktop.DBus.Error.NameHasNoOwner"));

    let reply = client.call_driver(&harness, "ListNames", &[]);
    let body = reply.body_values().unwrap();
    let Value::Array { items, .. } = &body[0] else { panic!("ListNames returns as") };
    let names: Vec<&str> = items.iter().filter_map(Value::as_str).collect();
    assert!(names.contains(&driver::DRIVER_NAME));
    assert!(names.contains(&NAME));
    assert!(names.contains(&unique.as_str()));
}

#[test]
fn request_name_validates_arguments() {
    let harness = BusHarness::new();
    let mut client = harness.connect();
    client.hello(&harness);

    // unique-style names cannot be requested
    let reply = client.call_driver(
        &harness,
        "RequestName",
        &[Value::Str(":1.99".into()), Value::Uint32(0)],
    );
    assert_eq!(reply.error_name(), Some("org.freedesktop.DBus.Error.InvalidArgs"));

    // neither can the driver's own name
    let reply = client.call_driver(
        &harness,
        "RequestName",
        &[Value::Str(driver::DRIVER_NAME.into()), Value::Uint32(0)],
    );
    assert_eq!(reply.error_name(), Some("org.freedesktop.DBus.Error.InvalidArgs"));

    // wrong signature
    let reply = client.call_driver(&harness, "RequestName", &[Value::Str(NAME.into())]);
    assert_eq!(reply.error_name(), Some("org.freedesktop.DBus.Error.InvalidArgs"));

    // unknown driver method
    let reply = client.call_driver(&harness, "FrobulateName", &[]);
    assert_eq!(reply.error_name(), Some("org.freedesktop.DBus.Error.UnknownMethod"));
}

#[test]
fn release_name_reply_codes() {
    let harness = BusHarness::new();
    let mut a = harness.connect();
    let mut b = harness.connect();
    a.hello(&harness);
    b.hello(&harness);

    let reply = a.call_driver(&harness, "ReleaseName", &[Value::Str(NAME.into())]);
    assert_eq!(reply.body_values().unwrap(), vec![Value::Uint32(2)], "NON_EXISTENT");

    a.call_driver(&harness, "RequestName", &[Value::Str(NAME.into()), Value::Uint32(0)]);
    let reply = b.call_driver(&harness, "ReleaseName", &[Value::Str(NAME.into())]);
    assert_eq!(reply.body_values().unwrap(), vec![Value::Uint32(3)], "NOT_OWNER");
}

#[test]
fn match_rule_management_errors() {
    let harness = BusHarness::new();
    let mut client = harness.connect();
    client.hello(&harness);

    let reply = client.call_driver(&harness, "AddMatch", &[Value::Str("gibberish='".into())]);
    assert_eq!(reply.error_name(), Some("org.freedesktop.DBus.Error.MatchRuleInvalid"));

    let reply =
        client.call_driver(&harness, "RemoveMatch", &[Value::Str("type='signal'".into())]);
    assert_eq!(reply.error_name(), Some("org.freedesktop.DBus.Error.MatchRuleNotFound"));

    client.add_match(&harness, "type='signal'");
    let reply =
        client.call_driver(&harness, "RemoveMatch", &[Value::Str("type='signal'".into())]);
    assert_eq!(reply.message_type(), MessageType::MethodReturn);
}

struct OneService;

impl Activator for OneService {
    fn activate(&self, name: &str) -> ActivationResult {
        if name == "com.example.Activatable" {
            ActivationResult::Started
        } else {
            ActivationResult::Unknown
        }
    }
}

#[test]
fn start_service_by_name() {
    let harness = BusHarness::builder().activator(OneService).build();
    let mut client = harness.connect();
    client.hello(&harness);

    let reply = client.call_driver(
        &harness,
        "StartServiceByName",
        &[Value::Str("com.example.Activatable".into()), Value::Uint32(0)],
    );
    assert_eq!(reply.body_values().unwrap(), vec![Value::Uint32(1)], "SUCCESS");

    let reply = client.call_driver(
        &harness,
        "StartServiceByName",
        &[Value::Str("com.example.Missing".into()), Value::Uint32(0)],
    );
    assert_eq!(reply.error_name(), Some("org.freedesktop.DBus.Error.ServiceUnknown"));

    // a name that already has an owner reports ALREADY_RUNNING
    client.call_driver(&harness, "RequestName", &[Value::Str(NAME.into()), Value::Uint32(0)]);
    let reply = client.call_driver(
        &harness,
        "StartServiceByName",
        &[Value::Str(NAME.into()), Value::Uint32(0)],
    );
    assert_eq!(reply.body_values().unwrap(), vec![Value::Uint32(2)], "ALREADY_RUNNING");
}
