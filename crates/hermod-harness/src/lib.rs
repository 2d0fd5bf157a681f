//! Deterministic test harness for the hermod message bus.
//!
//! [`BusHarness`] wires a broker (context, event loop, simulated clock,
//! poller) entirely in memory. [`TestClient`] speaks the real wire
//! format over a simulated pipe, so end-to-end tests exercise the exact
//! bytes a production peer would send, while time, readiness, and
//! allocation failures stay fully scripted.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod quota;
pub mod sim_clock;
pub mod sim_transport;

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    rc::Rc,
};

use bytes::BytesMut;
use hermod_core::{
    Activator, Connection, Context, MainLoop, MemoryQuota, Policy, RestartPolicy, driver,
};
use hermod_proto::{Message, MessageType, Value};

pub use quota::ScriptedQuota;
pub use sim_clock::SimClock;
pub use sim_transport::{ClientPipe, SimPoller};

/// Milliseconds of simulated OOM back-off; kept tiny so tests run in
/// virtual fast-forward.
const TEST_OOM_WAIT_MS: u64 = 10;

/// Iteration cap for one pump; a quiesced bus stops far earlier.
const PUMP_LIMIT: usize = 128;

/// A complete in-memory bus.
pub struct BusHarness {
    /// The virtual wall clock.
    pub clock: Rc<SimClock>,
    /// The broker's shared state.
    pub ctx: Rc<Context>,
    /// The event loop under test.
    pub main_loop: Rc<MainLoop>,
    endpoints: sim_transport::Endpoints,
    next_token: Cell<u64>,
}

impl BusHarness {
    /// A harness with default collaborators.
    pub fn new() -> BusHarness {
        BusHarness::builder().build()
    }

    /// Start customizing a harness.
    pub fn builder() -> BusHarnessBuilder {
        BusHarnessBuilder {
            quota: None,
            policy: None,
            activator: None,
            restart_policy: RestartPolicy::default(),
        }
    }

    /// Accept a new client and return its test-side handle.
    pub fn connect(&self) -> TestClient {
        let token = self.next_token.get();
        self.next_token.set(token + 1);
        let (broker_pipe, client_pipe) = sim_transport::pipe_pair(token, &self.endpoints);
        let conn = self.ctx.accept_connection(&self.main_loop, Box::new(broker_pipe));
        TestClient {
            pipe: client_pipe,
            bus_conn: conn,
            next_serial: 1,
            in_buf: BytesMut::new(),
            unique_name: None,
        }
    }

    /// Iterate the loop until it reports no more work (bounded).
    pub fn pump(&self) {
        for _ in 0..PUMP_LIMIT {
            if !self.main_loop.iterate(false) {
                break;
            }
        }
    }
}

impl Default for BusHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for [`BusHarness`].
pub struct BusHarnessBuilder {
    quota: Option<Rc<dyn MemoryQuota>>,
    policy: Option<Box<dyn Policy>>,
    activator: Option<Box<dyn Activator>>,
    restart_policy: RestartPolicy,
}

impl BusHarnessBuilder {
    /// Use a scripted (or otherwise custom) memory quota.
    pub fn quota(mut self, quota: Rc<dyn MemoryQuota>) -> BusHarnessBuilder {
        self.quota = Some(quota);
        self
    }

    /// Install a security policy.
    pub fn policy(mut self, policy: impl Policy + 'static) -> BusHarnessBuilder {
        self.policy = Some(Box::new(policy));
        self
    }

    /// Install an activation collaborator.
    pub fn activator(mut self, activator: impl Activator + 'static) -> BusHarnessBuilder {
        self.activator = Some(Box::new(activator));
        self
    }

    /// Choose how the loop reacts to mid-iteration list mutation.
    pub fn restart_policy(mut self, restart_policy: RestartPolicy) -> BusHarnessBuilder {
        self.restart_policy = restart_policy;
        self
    }

    /// Wire everything together.
    pub fn build(self) -> BusHarness {
        let clock = Rc::new(SimClock::new());
        let endpoints: sim_transport::Endpoints = Rc::new(RefCell::new(HashMap::new()));
        let poller = Box::new(SimPoller::new(clock.clone(), endpoints.clone()));

        let mut ctx_builder =
            Context::builder(clock.clone()).oom_wait_ms(TEST_OOM_WAIT_MS);
        if let Some(quota) = self.quota {
            ctx_builder = ctx_builder.quota(quota);
        }
        if let Some(policy) = self.policy {
            ctx_builder = ctx_builder.policy(policy);
        }
        if let Some(activator) = self.activator {
            ctx_builder = ctx_builder.activator(activator);
        }
        let ctx = ctx_builder.build();

        let main_loop = MainLoop::with_oom_wait(
            clock.clone(),
            poller,
            self.restart_policy,
            TEST_OOM_WAIT_MS,
        );
        BusHarness { clock, ctx, main_loop, endpoints, next_token: Cell::new(1) }
    }
}

/// One simulated peer, speaking real frames over its pipe.
pub struct TestClient {
    /// The client end of the byte pipe.
    pub pipe: ClientPipe,
    /// The broker-side connection object, for white-box assertions.
    pub bus_conn: Rc<Connection>,
    next_serial: u32,
    in_buf: BytesMut,
    /// The unique name issued by `Hello`, once obtained.
    pub unique_name: Option<String>,
}

impl TestClient {
    /// Assign a serial, frame, and send `message`; pumps the bus.
    ///
    /// Returns the serial used.
    pub fn send(&mut self, harness: &BusHarness, mut message: Message) -> u32 {
        let serial = self.next_serial;
        self.next_serial += 1;
        message.set_serial(serial);
        let frame = message.encode().expect("test messages encode");
        self.pipe.send_bytes(&frame).expect("broker end open");
        harness.pump();
        serial
    }

    /// Pull one already-delivered message, if any.
    pub fn try_recv(&mut self) -> Option<Message> {
        let bytes = self.pipe.drain();
        self.in_buf.extend_from_slice(&bytes);
        let total = Message::required_len(&self.in_buf).expect("broker frames are valid")?;
        if self.in_buf.len() < total {
            return None;
        }
        let frame = self.in_buf.split_to(total);
        Some(Message::decode(&frame).expect("broker frames decode"))
    }

    /// Receive the next message, pumping as needed.
    pub fn recv(&mut self, harness: &BusHarness) -> Message {
        for _ in 0..PUMP_LIMIT {
            if let Some(message) = self.try_recv() {
                return message;
            }
            harness.pump();
        }
        panic!("no message arrived");
    }

    /// Register with the bus: sends `Hello`, consumes the reply and the
    /// `NameAcquired` signal, returns the unique name.
    pub fn hello(&mut self, harness: &BusHarness) -> String {
        let call = Message::method_call(
            Some(driver::DRIVER_NAME),
            driver::DRIVER_PATH,
            Some(driver::DRIVER_INTERFACE),
            "Hello",
        )
        .expect("static names");
        let serial = self.send(harness, call);

        let reply = self.recv(harness);
        assert_eq!(reply.message_type(), MessageType::MethodReturn);
        assert_eq!(reply.reply_serial(), Some(serial));
        let name = reply.body_values().expect("hello reply decodes")[0]
            .as_str()
            .expect("hello returns a string")
            .to_owned();

        let acquired = self.recv(harness);
        assert!(acquired.is_signal(driver::DRIVER_INTERFACE, "NameAcquired"));

        self.unique_name = Some(name.clone());
        name
    }

    /// Call a driver method and return the matching reply (skipping any
    /// interleaved signals).
    pub fn call_driver(
        &mut self,
        harness: &BusHarness,
        member: &str,
        body: &[Value],
    ) -> Message {
        self.call(
            harness,
            driver::DRIVER_NAME,
            driver::DRIVER_PATH,
            driver::DRIVER_INTERFACE,
            member,
            body,
        )
    }

    /// Call `member` on `destination` and wait for the reply.
    pub fn call(
        &mut self,
        harness: &BusHarness,
        destination: &str,
        path: &str,
        interface: &str,
        member: &str,
        body: &[Value],
    ) -> Message {
        let mut call = Message::method_call(Some(destination), path, Some(interface), member)
            .expect("valid call");
        call.set_body(body).expect("valid body");
        let serial = self.send(harness, call);

        for _ in 0..PUMP_LIMIT {
            let message = self.recv(harness);
            if message.reply_serial() == Some(serial) {
                return message;
            }
        }
        panic!("no reply to {member}");
    }

    /// Subscribe with a match rule, asserting success.
    pub fn add_match(&mut self, harness: &BusHarness, rule: &str) {
        let reply = self.call_driver(harness, "AddMatch", &[Value::Str(rule.to_owned())]);
        assert_eq!(
            reply.message_type(),
            MessageType::MethodReturn,
            "AddMatch failed: {:?}",
            reply.error_name()
        );
    }

    /// Emit a destination-less signal.
    pub fn emit_signal(
        &mut self,
        harness: &BusHarness,
        path: &str,
        interface: &str,
        member: &str,
        body: &[Value],
    ) -> u32 {
        let mut signal = Message::signal(path, interface, member).expect("valid signal");
        signal.set_body(body).expect("valid body");
        self.send(harness, signal)
    }
}
