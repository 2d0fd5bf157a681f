//! Broker core for the hermod message bus.
//!
//! This crate contains the pure broker logic: the single-threaded event
//! loop, per-connection state, transactional delivery, name ownership,
//! match-rule fan-out, and the bus driver. It performs no real I/O and
//! reads no real clock: transports, pollers, time, allocation
//! headroom, security policy, and service activation are all injected
//! through traits in [`env`] and [`transport`], so the whole bus runs
//! identically under a deterministic test harness and in production.
//!
//! # Modules
//!
//! - [`main_loop`]: fd readiness, timeouts, and the dispatch FIFO
//! - [`connection`]: per-peer buffers, framing, and the outgoing queue
//! - [`transaction`]: all-or-nothing multi-recipient delivery
//! - [`registry`]: unique and well-known name ownership
//! - [`rules`] / [`matchmaker`]: signal subscription and fan-out
//! - [`driver`]: the broker's own `org.freedesktop.DBus` service
//! - [`dispatch`]: the per-message routing pipeline
//! - [`context`]: shared state and injected collaborators
//! - [`error`]: bus error kinds with their dotted names

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod connection;
pub mod context;
pub mod dispatch;
pub mod driver;
pub mod env;
pub mod error;
pub mod main_loop;
pub mod matchmaker;
pub mod registry;
pub mod rules;
pub mod transaction;
pub mod transport;

pub use connection::{Connection, ConnectionId};
pub use context::{Context, ContextBuilder};
pub use dispatch::{HandlerResult, dispatch_message};
pub use env::{
    ActivationResult, Activator, AllowAll, Clock, MemoryQuota, NoActivation, Policy,
    UnlimitedQuota, Verdict, WallTime,
};
pub use error::BusError;
pub use main_loop::{DispatchStatus, Dispatchable, MainLoop, RestartPolicy, TimeoutId, WatchId};
pub use matchmaker::Matchmaker;
pub use registry::{NameRegistry, OwnershipChange, ReleaseNameReply, RequestNameReply};
pub use rules::{MatchRule, MatchRuleError};
pub use transaction::Transaction;
pub use transport::{FdToken, PollEntry, Poller, Transport, WatchFlags};
