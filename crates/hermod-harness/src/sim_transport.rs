//! In-memory transports and the simulated poller.
//!
//! Each accepted client is one bidirectional byte pipe: the broker
//! holds a [`BrokerPipe`] implementing the core's `Transport`, the test
//! holds the [`ClientPipe`]. Readiness is derived from buffer contents,
//! so the poller never blocks; when nothing is ready it advances the
//! virtual clock by the poll timeout, exactly as real time would pass
//! in a blocking poll.

use std::{
    cell::RefCell,
    collections::{HashMap, VecDeque},
    io,
    rc::Rc,
};

use hermod_core::{FdToken, PollEntry, Poller, Transport, WatchFlags};

use crate::sim_clock::SimClock;

/// Buffered state of one pipe; shared by both ends and the poller.
#[derive(Debug, Default)]
pub struct PipeState {
    to_broker: VecDeque<u8>,
    to_client: VecDeque<u8>,
    broker_closed: bool,
    client_closed: bool,
}

/// Registry of pipes the poller derives readiness from.
pub type Endpoints = Rc<RefCell<HashMap<FdToken, Rc<RefCell<PipeState>>>>>;

/// Create a connected pipe pair and register it with `endpoints`.
pub fn pipe_pair(token: FdToken, endpoints: &Endpoints) -> (BrokerPipe, ClientPipe) {
    let state = Rc::new(RefCell::new(PipeState::default()));
    endpoints.borrow_mut().insert(token, state.clone());
    (BrokerPipe { token, state: state.clone() }, ClientPipe { state })
}

/// The broker's end of a simulated connection.
pub struct BrokerPipe {
    token: FdToken,
    state: Rc<RefCell<PipeState>>,
}

impl Transport for BrokerPipe {
    fn token(&self) -> FdToken {
        self.token
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.borrow_mut();
        if state.to_broker.is_empty() {
            if state.client_closed {
                return Ok(0);
            }
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let mut n = 0;
        while n < buf.len() {
            match state.to_broker.pop_front() {
                Some(byte) => {
                    buf[n] = byte;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.borrow_mut();
        if state.client_closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        state.to_client.extend(buf.iter().copied());
        Ok(buf.len())
    }

    fn close(&mut self) {
        self.state.borrow_mut().broker_closed = true;
    }
}

/// The test's end of a simulated connection.
pub struct ClientPipe {
    state: Rc<RefCell<PipeState>>,
}

impl ClientPipe {
    /// Queue bytes for the broker to read on its next iteration.
    pub fn send_bytes(&self, bytes: &[u8]) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        if state.broker_closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        state.to_broker.extend(bytes.iter().copied());
        Ok(())
    }

    /// Take every byte the broker has written so far.
    pub fn drain(&self) -> Vec<u8> {
        self.state.borrow_mut().to_client.drain(..).collect()
    }

    /// Whether the broker closed its end.
    pub fn is_closed(&self) -> bool {
        self.state.borrow().broker_closed
    }

    /// Hang up the client side; the broker observes EOF.
    pub fn close(&self) {
        self.state.borrow_mut().client_closed = true;
    }
}

/// Poller over the registered pipes.
pub struct SimPoller {
    clock: Rc<SimClock>,
    endpoints: Endpoints,
}

impl SimPoller {
    /// Build a poller over a shared endpoint registry.
    pub fn new(clock: Rc<SimClock>, endpoints: Endpoints) -> SimPoller {
        SimPoller { clock, endpoints }
    }
}

impl Poller for SimPoller {
    fn poll(&mut self, entries: &mut [PollEntry], timeout_ms: Option<u64>) -> usize {
        let endpoints = self.endpoints.borrow();
        let mut ready = 0;
        for entry in entries.iter_mut() {
            entry.revents = WatchFlags::empty();
            let Some(state) = endpoints.get(&entry.token) else { continue };
            let state = state.borrow();
            if entry.events.contains(WatchFlags::READABLE) && !state.to_broker.is_empty() {
                entry.revents |= WatchFlags::READABLE;
            }
            if state.client_closed && state.to_broker.is_empty() {
                entry.revents |= WatchFlags::HANGUP;
            }
            if entry.events.contains(WatchFlags::WRITABLE) && !state.broker_closed {
                entry.revents |= WatchFlags::WRITABLE;
            }
            if !entry.revents.is_empty() {
                ready += 1;
            }
        }
        if ready == 0 {
            // nothing to deliver; let the poll timeout elapse virtually
            if let Some(ms) = timeout_ms {
                self.clock.advance_ms(ms);
            }
        }
        ready
    }
}
