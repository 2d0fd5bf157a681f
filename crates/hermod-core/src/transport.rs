//! Transport and readiness interfaces.
//!
//! Concrete transports (stream sockets, pipes) and the authentication
//! handshake live outside the core. The broker only needs a nonblocking
//! byte stream with a pollable token, and a way to wait for readiness
//! across many of them. The harness supplies in-memory implementations;
//! a production build would wrap real sockets and `poll(2)`.

use std::io;

/// Opaque token identifying a pollable endpoint, the moral equivalent
/// of a file descriptor.
pub type FdToken = u64;

bitflags::bitflags! {
    /// Readiness conditions, both requested and reported.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WatchFlags: u8 {
        /// Data can be read
        const READABLE = 0x1;
        /// Data can be written
        const WRITABLE = 0x2;
        /// Peer hung up (reported only)
        const HANGUP = 0x4;
        /// Error condition (reported only)
        const ERROR = 0x8;
    }
}

/// One entry in a poll set.
#[derive(Debug, Clone, Copy)]
pub struct PollEntry {
    /// Endpoint being watched
    pub token: FdToken,
    /// Conditions of interest
    pub events: WatchFlags,
    /// Conditions observed, filled by the poller
    pub revents: WatchFlags,
}

/// Waits for readiness on a set of endpoints.
pub trait Poller {
    /// Fill in `revents` across `entries` and return how many entries
    /// are ready. `timeout_ms` of `None` blocks until something is
    /// ready; `Some(0)` only gathers current readiness.
    fn poll(&mut self, entries: &mut [PollEntry], timeout_ms: Option<u64>) -> usize;
}

/// A nonblocking byte stream between the broker and one peer.
pub trait Transport {
    /// Token the event loop polls for this stream.
    fn token(&self) -> FdToken;

    /// Read into `buf`. `Ok(0)` means the peer closed the stream;
    /// [`io::ErrorKind::WouldBlock`] means no data right now.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write from `buf`, returning how many bytes were accepted.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Drop the stream; queued peer-side bytes may be lost.
    fn close(&mut self);
}
