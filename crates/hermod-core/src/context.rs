//! The broker's shared state and injected collaborators.
//!
//! There are no process-wide globals: everything the routing code
//! needs (policy, activation, quota, clock, the name registry, the
//! rule table, the connection set) hangs off one [`Context`]
//! handed around explicitly.

use std::{
    cell::{Cell, RefCell, RefMut},
    collections::HashMap,
    rc::Rc,
};

use crate::{
    connection::{Connection, ConnectionId},
    env::{
        Activator, AllowAll, Clock, DEFAULT_OOM_WAIT_MS, MemoryQuota, NoActivation, Policy,
        UnlimitedQuota,
    },
    main_loop::MainLoop,
    matchmaker::Matchmaker,
    registry::NameRegistry,
    transport::Transport,
};

/// Shared broker state.
pub struct Context {
    policy: Box<dyn Policy>,
    activator: Box<dyn Activator>,
    quota: Rc<dyn MemoryQuota>,
    clock: Rc<dyn Clock>,
    oom_wait_ms: u64,
    registry: RefCell<NameRegistry>,
    matchmaker: RefCell<Matchmaker>,
    connections: RefCell<HashMap<ConnectionId, Rc<Connection>>>,
    next_connection_id: Cell<ConnectionId>,
    next_serial: Cell<u32>,
}

impl Context {
    /// Start building a context around a clock.
    pub fn builder(clock: Rc<dyn Clock>) -> ContextBuilder {
        ContextBuilder {
            clock,
            policy: Box::new(AllowAll),
            activator: Box::new(NoActivation),
            quota: Rc::new(UnlimitedQuota),
            oom_wait_ms: DEFAULT_OOM_WAIT_MS,
        }
    }

    /// The security policy callback.
    pub(crate) fn policy(&self) -> &dyn Policy {
        self.policy.as_ref()
    }

    /// The activation collaborator.
    pub(crate) fn activator(&self) -> &dyn Activator {
        self.activator.as_ref()
    }

    /// The allocation headroom account.
    pub fn quota(&self) -> &Rc<dyn MemoryQuota> {
        &self.quota
    }

    /// The clock used for OOM back-off sleeps.
    pub fn clock(&self) -> &Rc<dyn Clock> {
        &self.clock
    }

    /// Sleep one OOM interval before retrying an allocation.
    pub(crate) fn wait_for_memory(&self) {
        tracing::debug!("waiting for memory");
        self.clock.sleep_ms(self.oom_wait_ms);
    }

    /// Mutable access to the name tables.
    pub(crate) fn registry_mut(&self) -> RefMut<'_, NameRegistry> {
        self.registry.borrow_mut()
    }

    /// Mutable access to the rule table.
    pub(crate) fn matchmaker_mut(&self) -> RefMut<'_, Matchmaker> {
        self.matchmaker.borrow_mut()
    }

    /// Serial for the next broker-originated message; never zero.
    pub(crate) fn next_serial(&self) -> u32 {
        let serial = self.next_serial.get();
        self.next_serial.set(serial.checked_add(1).unwrap_or(1));
        serial
    }

    /// Adopt a freshly accepted transport as a connection, registering
    /// its watch with the loop.
    pub fn accept_connection(
        self: &Rc<Context>,
        main_loop: &Rc<MainLoop>,
        transport: Box<dyn Transport>,
    ) -> Rc<Connection> {
        let id = self.next_connection_id.get();
        self.next_connection_id.set(id + 1);
        let conn = Connection::new(id, self, main_loop, transport);
        self.connections.borrow_mut().insert(id, conn.clone());
        tracing::debug!(id, "accepted connection");
        conn
    }

    /// Look up a live connection by id.
    pub fn connection(&self, id: ConnectionId) -> Option<Rc<Connection>> {
        self.connections.borrow().get(&id).cloned()
    }

    /// Resolve a destination name to its owning connection.
    pub fn lookup_owner(&self, name: &str) -> Option<Rc<Connection>> {
        let id = self.registry.borrow().lookup(name)?;
        self.connection(id)
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.borrow().len()
    }

    /// Forget a connection after its disconnect has been dispatched.
    pub(crate) fn remove_connection(&self, id: ConnectionId) {
        self.connections.borrow_mut().remove(&id);
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("connections", &self.connections.borrow().len())
            .field("rules", &self.matchmaker.borrow().len())
            .finish()
    }
}

/// Builder for [`Context`].
pub struct ContextBuilder {
    clock: Rc<dyn Clock>,
    policy: Box<dyn Policy>,
    activator: Box<dyn Activator>,
    quota: Rc<dyn MemoryQuota>,
    oom_wait_ms: u64,
}

impl ContextBuilder {
    /// Install a security policy.
    pub fn policy(mut self, policy: impl Policy + 'static) -> ContextBuilder {
        self.policy = Box::new(policy);
        self
    }

    /// Install an activation collaborator.
    pub fn activator(mut self, activator: impl Activator + 'static) -> ContextBuilder {
        self.activator = Box::new(activator);
        self
    }

    /// Install a memory quota.
    pub fn quota(mut self, quota: Rc<dyn MemoryQuota>) -> ContextBuilder {
        self.quota = quota;
        self
    }

    /// Override the OOM back-off interval.
    pub fn oom_wait_ms(mut self, ms: u64) -> ContextBuilder {
        self.oom_wait_ms = ms;
        self
    }

    /// Finish the context.
    pub fn build(self) -> Rc<Context> {
        Rc::new(Context {
            policy: self.policy,
            activator: self.activator,
            quota: self.quota,
            clock: self.clock,
            oom_wait_ms: self.oom_wait_ms,
            registry: RefCell::new(NameRegistry::new()),
            matchmaker: RefCell::new(Matchmaker::new()),
            connections: RefCell::new(HashMap::new()),
            next_connection_id: Cell::new(1),
            next_serial: Cell::new(1),
        })
    }
}
