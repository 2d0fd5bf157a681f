//! Per-peer connection state.
//!
//! A connection owns its transport, an incoming byte buffer that frames
//! are parsed out of, a queue of parsed messages awaiting dispatch, and
//! an outgoing queue of encoded frames. Outgoing space is reserved
//! through the memory quota before a transaction may plan a send, so
//! rollback never has to touch the queue itself.
//!
//! Every connection also preallocates one `NoMemory` error reply worth
//! of quota at accept time. When dispatch fails out of memory, that
//! reservation lets the broker still tell the sender, even though no
//! further reservation can succeed.
//!
//! Lifecycle: accepted (transport attached, watch registered) →
//! active (unique name issued by `Hello`) → disconnected (transport
//! closed, queues dropped, names released).

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    io,
    rc::{Rc, Weak},
};

use bytes::BytesMut;
use hermod_proto::Message;

use crate::{
    context::Context,
    dispatch,
    driver,
    error::BusError,
    main_loop::{DispatchStatus, Dispatchable, MainLoop, WatchId},
    transport::{Transport, WatchFlags},
};

/// Broker-internal identifier of a connection.
pub type ConnectionId = u64;

/// Bytes read from the transport per attempt.
const READ_CHUNK: usize = 4096;

/// Quota set aside at accept time for the emergency error reply.
const OOM_REPLY_RESERVE: usize = 512;

/// Upper bound on bytes queued toward one peer.
const MAX_OUTGOING_BYTES: usize = 1 << 27;

struct QueuedFrame {
    bytes: Vec<u8>,
    written: usize,
    /// Quota released once the frame is fully flushed
    reserved: usize,
}

#[derive(Default)]
struct OutgoingQueue {
    frames: VecDeque<QueuedFrame>,
    /// Bytes reserved by in-flight transactions, not yet queued
    reserved: usize,
    queued_bytes: usize,
}

/// One peer of the broker.
pub struct Connection {
    id: ConnectionId,
    ctx: Weak<Context>,
    weak_self: Weak<Connection>,
    main_loop: Weak<MainLoop>,
    transport: RefCell<Box<dyn Transport>>,
    watch_id: Cell<Option<WatchId>>,
    in_buf: RefCell<BytesMut>,
    inbound: RefCell<VecDeque<Message>>,
    outgoing: RefCell<OutgoingQueue>,
    unique_name: RefCell<Option<String>>,
    connected: Cell<bool>,
    active: Cell<bool>,
    disconnect_queued: Cell<bool>,
    /// Quota held for the emergency reply; zero when unavailable
    oom_reserved: Cell<usize>,
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        ctx: &Rc<Context>,
        main_loop: &Rc<MainLoop>,
        transport: Box<dyn Transport>,
    ) -> Rc<Connection> {
        let token = transport.token();
        let conn = Rc::new_cyclic(|weak_self| Connection {
            id,
            ctx: Rc::downgrade(ctx),
            weak_self: weak_self.clone(),
            main_loop: Rc::downgrade(main_loop),
            transport: RefCell::new(transport),
            watch_id: Cell::new(None),
            in_buf: RefCell::new(BytesMut::new()),
            inbound: RefCell::new(VecDeque::new()),
            outgoing: RefCell::new(OutgoingQueue::default()),
            unique_name: RefCell::new(None),
            connected: Cell::new(true),
            active: Cell::new(false),
            disconnect_queued: Cell::new(false),
            oom_reserved: Cell::new(0),
        });

        let handler_conn = Rc::downgrade(&conn);
        let watch_id = main_loop.add_watch(token, WatchFlags::READABLE, move |condition| {
            match handler_conn.upgrade() {
                Some(conn) => conn.handle_watch(condition),
                None => true,
            }
        });
        conn.watch_id.set(Some(watch_id));

        // best effort; dispatch re-tries before touching any message
        conn.preallocate_oom_reply();
        conn
    }

    /// Broker-internal id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The unique name, once `Hello` has been answered.
    pub fn unique_name(&self) -> Option<String> {
        self.unique_name.borrow().clone()
    }

    /// Whether identity issuance has completed.
    pub fn is_active(&self) -> bool {
        self.active.get()
    }

    /// Whether the peer is still attached.
    pub fn is_connected(&self) -> bool {
        self.connected.get()
    }

    /// Number of frames waiting in the outgoing queue.
    pub fn outgoing_frames(&self) -> usize {
        self.outgoing.borrow().frames.len()
    }

    /// Mark the connection active under its freshly issued name.
    pub(crate) fn set_registered(&self, name: &str) {
        *self.unique_name.borrow_mut() = Some(name.to_owned());
        self.active.set(true);
    }

    // Outgoing reservations

    /// Reserve queue space for `bytes`; the transaction calls this
    /// before planning a send. Fails like an allocation failure.
    pub(crate) fn reserve_outgoing(&self, bytes: usize) -> bool {
        let Some(ctx) = self.ctx.upgrade() else { return false };
        {
            let q = self.outgoing.borrow();
            if q.queued_bytes + q.reserved + bytes > MAX_OUTGOING_BYTES {
                return false;
            }
        }
        if !ctx.quota().try_reserve(bytes) {
            return false;
        }
        self.outgoing.borrow_mut().reserved += bytes;
        true
    }

    /// Return a reservation that will not be used.
    pub(crate) fn release_reservation(&self, bytes: usize) {
        let mut q = self.outgoing.borrow_mut();
        q.reserved = q.reserved.saturating_sub(bytes);
        drop(q);
        if let Some(ctx) = self.ctx.upgrade() {
            ctx.quota().release(bytes);
        }
    }

    /// Move a reserved frame into the outgoing queue (transaction
    /// commit). The reservation becomes the frame's quota hold.
    pub(crate) fn queue_reserved_frame(&self, bytes: Vec<u8>) {
        let len = bytes.len();
        {
            let mut q = self.outgoing.borrow_mut();
            q.reserved = q.reserved.saturating_sub(len);
            q.queued_bytes += len;
            q.frames.push_back(QueuedFrame { bytes, written: 0, reserved: len });
        }
        self.update_write_interest();
    }

    // Emergency reply

    /// Ensure the emergency `NoMemory` reply can be sent later without
    /// any allocation succeeding.
    pub(crate) fn preallocate_oom_reply(&self) -> bool {
        if self.oom_reserved.get() > 0 {
            return true;
        }
        let Some(ctx) = self.ctx.upgrade() else { return true };
        if ctx.quota().try_reserve(OOM_REPLY_RESERVE) {
            self.oom_reserved.set(OOM_REPLY_RESERVE);
            true
        } else {
            false
        }
    }

    /// Send the preallocated `NoMemory` error in reply to `failed`,
    /// consuming the reservation made at accept time.
    pub(crate) fn send_oom_reply(&self, ctx: &Context, failed: &Message) {
        let reserved = self.oom_reserved.replace(0);
        if reserved == 0 {
            tracing::error!(id = self.id, "no preallocated reply to send");
            return;
        }
        if !self.connected.get() {
            if let Some(ctx) = self.ctx.upgrade() {
                ctx.quota().release(reserved);
            }
            return;
        }
        let reply = Message::error_reply(failed, &BusError::NoMemory.name(), "out of memory")
            .and_then(|mut reply| {
                reply.set_sender(Some(driver::DRIVER_NAME))?;
                reply.set_serial(ctx.next_serial());
                reply.encode()
            });
        match reply {
            Ok(frame) => {
                let len = frame.len();
                {
                    let mut q = self.outgoing.borrow_mut();
                    q.queued_bytes += len;
                    q.frames.push_back(QueuedFrame { bytes: frame, written: 0, reserved });
                }
                self.update_write_interest();
            }
            Err(err) => {
                tracing::error!(id = self.id, %err, "could not build emergency reply");
                if let Some(ctx) = self.ctx.upgrade() {
                    ctx.quota().release(reserved);
                }
            }
        }
    }

    // I/O driven by the event loop

    fn handle_watch(&self, condition: WatchFlags) -> bool {
        if condition.intersects(WatchFlags::HANGUP | WatchFlags::ERROR) {
            self.shutdown("transport reported hangup");
            return true;
        }
        if condition.contains(WatchFlags::WRITABLE) {
            self.flush_outgoing();
        }
        if condition.contains(WatchFlags::READABLE) {
            return self.read_and_parse();
        }
        true
    }

    /// Pull bytes off the transport and frame them. Returns `false`
    /// when the read buffer could not be reserved, which makes the loop
    /// skip this watch once and back off.
    fn read_and_parse(&self) -> bool {
        let Some(ctx) = self.ctx.upgrade() else { return true };
        loop {
            if !ctx.quota().try_reserve(READ_CHUNK) {
                return false;
            }
            let mut chunk = [0u8; READ_CHUNK];
            let result = self.transport.borrow_mut().read(&mut chunk);
            ctx.quota().release(READ_CHUNK);

            match result {
                Ok(0) => {
                    self.shutdown("peer closed the stream");
                    break;
                }
                Ok(n) => {
                    self.in_buf.borrow_mut().extend_from_slice(&chunk[..n]);
                    if !self.parse_frames() {
                        break;
                    }
                    if n < READ_CHUNK {
                        break;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    tracing::debug!(id = self.id, %err, "read failed");
                    self.shutdown("read failure");
                    break;
                }
            }
        }
        true
    }

    /// Split complete frames out of the incoming buffer. Returns
    /// `false` if the stream turned out to be malformed and the
    /// connection is going away.
    fn parse_frames(&self) -> bool {
        loop {
            let total = {
                let buf = self.in_buf.borrow();
                match Message::required_len(&buf) {
                    Ok(Some(total)) => total,
                    Ok(None) => return true,
                    Err(err) => {
                        drop(buf);
                        tracing::warn!(id = self.id, %err, "malformed frame header");
                        self.shutdown("malformed frame");
                        return false;
                    }
                }
            };
            if self.in_buf.borrow().len() < total {
                return true;
            }
            let frame = self.in_buf.borrow_mut().split_to(total);
            match Message::decode(&frame) {
                Ok(message) => {
                    self.inbound.borrow_mut().push_back(message);
                    self.queue_self_for_dispatch();
                }
                Err(err) => {
                    tracing::warn!(id = self.id, %err, "undecodable frame");
                    self.shutdown("undecodable frame");
                    return false;
                }
            }
        }
    }

    fn queue_self_for_dispatch(&self) {
        if let (Some(main_loop), Some(conn)) =
            (self.main_loop.upgrade(), self.weak_self.upgrade())
        {
            main_loop.queue_dispatch(conn);
        }
    }

    fn flush_outgoing(&self) {
        let Some(ctx) = self.ctx.upgrade() else { return };
        loop {
            let mut q = self.outgoing.borrow_mut();
            let Some(front) = q.frames.front_mut() else { break };
            let result = self.transport.borrow_mut().write(&front.bytes[front.written..]);
            match result {
                Ok(0) => break,
                Ok(n) => {
                    front.written += n;
                    if front.written == front.bytes.len() {
                        let frame = q.frames.pop_front().expect("front exists");
                        q.queued_bytes -= frame.bytes.len();
                        ctx.quota().release(frame.reserved);
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    drop(q);
                    tracing::debug!(id = self.id, %err, "write failed");
                    self.shutdown("write failure");
                    return;
                }
            }
        }
        self.update_write_interest();
    }

    fn update_write_interest(&self) {
        let Some(main_loop) = self.main_loop.upgrade() else { return };
        let Some(watch_id) = self.watch_id.get() else { return };
        let mut flags = WatchFlags::READABLE;
        if !self.outgoing.borrow().frames.is_empty() {
            flags |= WatchFlags::WRITABLE;
        }
        main_loop.set_watch_flags(watch_id, flags);
    }

    // Teardown

    /// Stop I/O and queue the synthetic `Disconnected` signal so the
    /// dispatcher releases this connection's bus state in order.
    pub(crate) fn shutdown(&self, reason: &str) {
        if self.disconnect_queued.replace(true) {
            return;
        }
        tracing::debug!(id = self.id, reason, "shutting down connection");
        self.transport.borrow_mut().close();
        if let Some(main_loop) = self.main_loop.upgrade() {
            if let Some(watch_id) = self.watch_id.take() {
                main_loop.remove_watch(watch_id);
            }
        }
        let disconnected =
            Message::signal(driver::LOCAL_PATH, driver::LOCAL_INTERFACE, "Disconnected")
                .expect("static names are valid");
        self.inbound.borrow_mut().push_back(disconnected);
        self.queue_self_for_dispatch();
    }

    /// Final teardown, run when the `Disconnected` signal dispatches:
    /// queued outgoing bytes are dropped and the emergency reservation
    /// is returned. Reservations held by in-flight transactions are
    /// released by their owners.
    pub(crate) fn finalize_disconnect(&self) {
        self.connected.set(false);
        self.active.set(false);
        self.inbound.borrow_mut().clear();
        let mut q = self.outgoing.borrow_mut();
        if let Some(ctx) = self.ctx.upgrade() {
            for frame in q.frames.drain(..) {
                ctx.quota().release(frame.reserved);
            }
            let oom = self.oom_reserved.replace(0);
            if oom > 0 {
                ctx.quota().release(oom);
            }
        } else {
            q.frames.clear();
        }
        q.queued_bytes = 0;
    }
}

impl Dispatchable for Connection {
    fn dispatch(&self) -> DispatchStatus {
        let Some(ctx) = self.ctx.upgrade() else { return DispatchStatus::Complete };
        let Some(conn) = self.weak_self.upgrade() else { return DispatchStatus::Complete };
        if !self.connected.get() {
            self.inbound.borrow_mut().clear();
            return DispatchStatus::Complete;
        }
        let message = self.inbound.borrow_mut().pop_front();
        let Some(message) = message else { return DispatchStatus::Complete };

        dispatch::dispatch_message(&ctx, &conn, message);

        if self.inbound.borrow().is_empty() {
            DispatchStatus::Complete
        } else {
            DispatchStatus::DataRemains
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("unique_name", &self.unique_name.borrow())
            .field("active", &self.active.get())
            .field("connected", &self.connected.get())
            .field("outgoing_frames", &self.outgoing.borrow().frames.len())
            .finish()
    }
}
