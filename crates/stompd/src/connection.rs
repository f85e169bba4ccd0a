use std::{
    fmt::Write as _,
    io,
    net::SocketAddr,
    time::{Duration, Instant},
};

use mio::{Interest, Registry, Token, net::TcpStream};
use stompd_util::{ByteMap, ByteString, soft_panic};
use stompd_wire::{Command, Frame, FrameParser, FrameSerializer, IoBuf, ParseOutcome};
use tracing::{debug, error, trace, warn};

use crate::{queue::StoredFrame, subscription::Subscription};

/// Socket read chunk per pump iteration.
pub const NETWORK_READ_SIZE: usize = 4096;

const INITIAL_BUFFER_SIZE: usize = 4096;

/// Idle multiple of the negotiated heartbeat interval tolerated before a
/// connection is considered dead.
const HEARTBEAT_GRACE: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    /// Waiting for the CONNECT/STOMP handshake frame.
    Login,
    /// Handshake done; broker commands are accepted.
    Connected,
    /// A protocol error was reported; draining the ERROR frame, then closing.
    StompError,
    /// Finished. The reaper collects connections in this state.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    V1_2,
}

/// One client connection: socket, buffered I/O windows, frame codec state,
/// and this client's subscriptions.
pub struct Connection {
    stream: TcpStream,
    peer_addr: SocketAddr,
    status: ConnStatus,
    version: ProtocolVersion,
    last_error: Option<io::Error>,
    /// Once set, no more input is processed and the connection closes as soon
    /// as the outbound side has fully drained.
    close_after_flush: bool,
    parse_error_reported: bool,

    inbuf: IoBuf,
    outbuf: IoBuf,
    parser: FrameParser,
    serializer: FrameSerializer,

    last_read: Instant,
    last_write: Instant,
    /// Negotiated heartbeat intervals in milliseconds; zero means disabled.
    heartbeat_in_ms: u32,
    heartbeat_out_ms: u32,

    /// Subscriptions owned by this connection, keyed by the client-chosen id.
    subs_by_client_id: ByteMap<Subscription>,
    /// Broker-assigned server id back to the owning client id.
    subs_by_server_id: ByteMap<ByteString>,
    next_sub_server_id: u32,

    /// Interest currently registered with the poll, if any.
    registered: Option<Interest>,
}

impl Connection {
    pub fn new(stream: TcpStream, peer_addr: SocketAddr) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        let now = Instant::now();
        Ok(Self {
            stream,
            peer_addr,
            status: ConnStatus::Login,
            version: ProtocolVersion::V1_2,
            last_error: None,
            close_after_flush: false,
            parse_error_reported: false,
            inbuf: IoBuf::with_capacity(INITIAL_BUFFER_SIZE),
            outbuf: IoBuf::with_capacity(INITIAL_BUFFER_SIZE),
            parser: FrameParser::new(),
            serializer: FrameSerializer::new(),
            last_read: now,
            last_write: now,
            heartbeat_in_ms: 0,
            heartbeat_out_ms: 0,
            subs_by_client_id: ByteMap::new(),
            subs_by_server_id: ByteMap::new(),
            next_sub_server_id: 0,
            registered: None,
        })
    }

    #[inline]
    pub const fn status(&self) -> ConnStatus {
        self.status
    }

    #[inline]
    pub const fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    #[inline]
    pub const fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn take_error(&mut self) -> Option<io::Error> {
        self.last_error.take()
    }

    /// Marks the connection closed. Idempotent; the socket itself is released
    /// when the reaper drops the connection.
    pub fn close(&mut self) {
        self.status = ConnStatus::Closed;
    }

    /// Closes due to a socket error, keeping the first error for the reap log.
    pub fn abort(&mut self, error: io::Error) {
        if self.last_error.is_none() {
            self.last_error = Some(error);
        }
        self.status = ConnStatus::Closed;
    }

    /// DISCONNECT path: stop reading, drain what is queued, then close.
    pub fn begin_disconnect(&mut self) {
        self.close_after_flush = true;
    }

    pub fn complete_login(&mut self, heartbeat_in_ms: u32, heartbeat_out_ms: u32) {
        self.status = ConnStatus::Connected;
        self.heartbeat_in_ms = heartbeat_in_ms;
        self.heartbeat_out_ms = heartbeat_out_ms;
        debug!(
            peer = %self.peer_addr,
            version = ?self.version,
            heartbeat_in_ms,
            heartbeat_out_ms,
            "handshake complete"
        );
    }

    /// True while client input should still be read and parsed.
    pub fn wants_input(&self) -> bool {
        matches!(self.status, ConnStatus::Login | ConnStatus::Connected)
            && !self.close_after_flush
    }

    /// Pulls waiting socket input into the inbound buffer, draining the
    /// socket until it would block. EOF and unexpected errors close the
    /// connection; would-block is a no-op.
    pub fn pump_input(&mut self, read_size: usize) {
        loop {
            match self.inbuf.read_from(&mut self.stream, read_size) {
                Ok(0) => {
                    self.close();
                    return;
                }
                Ok(_) => self.last_read = Instant::now(),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    debug!(peer = %self.peer_addr, error = %e, "read failed");
                    self.abort(e);
                    return;
                }
            }
        }
    }

    /// Pushes buffered output to the socket until it would block or the
    /// buffer empties. A broken pipe closes quietly; other errors are
    /// recorded.
    pub fn pump_output(&mut self) {
        while !self.outbuf.is_empty() {
            match self.outbuf.write_to(&mut self.stream, self.outbuf.len()) {
                Ok(0) => {
                    self.close();
                    return;
                }
                Ok(_) => self.last_write = Instant::now(),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                    self.close();
                    return;
                }
                Err(e) => {
                    debug!(peer = %self.peer_addr, error = %e, "write failed");
                    self.abort(e);
                    return;
                }
            }
        }
    }

    /// Advances the parser over buffered input. Returns the next finished
    /// frame, a protocol error message (reported once), or nothing.
    pub fn poll_frame(&mut self) -> Option<Result<Frame, ByteString>> {
        let outcome = self.parser.parse(&mut self.inbuf);
        if let Some(frame) = self.parser.take_frame() {
            return Some(Ok(frame));
        }
        if outcome == ParseOutcome::Error && !self.parse_error_reported {
            self.parse_error_reported = true;
            let msg = self
                .parser
                .error()
                .cloned()
                .unwrap_or_else(|| ByteString::from("Malformed frame"));
            return Some(Err(msg));
        }
        None
    }

    /// Queues a frame for output; on serializer overflow the connection is
    /// force-closed, since dropping broker frames silently would corrupt the
    /// session.
    pub fn enqueue_or_close(&mut self, frame: Frame) {
        if self.serializer.enqueue(frame).is_none() {
            error!(peer = %self.peer_addr, "outgoing queue is full, closing connection");
            self.close();
        }
    }

    /// Moves to STOMP_ERROR and queues an ERROR frame carrying `message`,
    /// copying a causal frame's `receipt` into `receipt-id` when present.
    pub fn send_error_message(&mut self, causal: Option<&Frame>, message: impl Into<ByteString>) {
        self.status = ConnStatus::StompError;
        self.close_after_flush = true;

        let mut frame = Frame::new(Command::Error);
        frame.push_header("message", message.into());
        if let Some(receipt) = causal.and_then(|f| f.header(b"receipt")) {
            frame.push_header("receipt-id", receipt.clone());
        }

        if self.serializer.enqueue(frame).is_none() {
            error!(peer = %self.peer_addr, "outgoing queue is full, dropping error frame");
            self.close();
        }
    }

    /// Drives the serializer into the outbound buffer, writes what the socket
    /// will take, and completes a pending drain-then-close.
    pub fn flush(&mut self) {
        self.serializer.serialize(&mut self.outbuf);
        // The broker does not track per-frame write acknowledgements; drain
        // the completed queue so the serializer never stalls on it.
        while let Some(done) = self.serializer.pop_completed() {
            trace!(qid = done.qid, command = ?done.frame.command(), "frame written");
        }
        self.pump_output();

        if self.close_after_flush
            && self.status != ConnStatus::Closed
            && self.outbuf.is_empty()
            && self.serializer.is_idle()
        {
            debug!(peer = %self.peer_addr, "output drained, closing");
            self.close();
        }
    }

    /// True when a routed frame can be handed to this connection right now.
    pub fn can_deliver(&self) -> bool {
        self.status == ConnStatus::Connected
            && !self.close_after_flush
            && self.serializer.has_room()
    }

    /// Delivers a stored frame to the subscription identified by `server_id`,
    /// constructing the MESSAGE frame and recording the delivery for ack
    /// tracking. Gives the frame back if it cannot be delivered right now.
    pub fn deliver(&mut self, server_id: &[u8], stored: StoredFrame) -> Result<(), StoredFrame> {
        if !self.can_deliver() {
            return Err(stored);
        }
        let Some(client_id) = self.subs_by_server_id.get(server_id).cloned() else {
            return Err(stored);
        };
        let Some(sub) = self.subs_by_client_id.get_mut(&client_id) else {
            soft_panic!("subscription maps out of sync");
            return Err(stored);
        };

        let message = sub.prepare_delivery(stored.frame, stored.reject_count);
        trace!(peer = %self.peer_addr, qlid = stored.qlid, "delivering message");
        if self.serializer.enqueue(message).is_none() {
            soft_panic!("serializer rejected a frame after reporting room");
        }
        Ok(())
    }

    // --- subscriptions ---

    pub fn generate_subscription_server_id(&mut self) -> ByteString {
        let mut id = ByteString::with_capacity(12);
        let _ = write!(id, "sub-{:x}", self.next_sub_server_id);
        self.next_sub_server_id += 1;
        id
    }

    pub fn has_subscription(&self, client_id: &[u8]) -> bool {
        self.subs_by_client_id.contains(client_id)
    }

    /// Client-chosen ids of this connection's subscriptions, for the
    /// teardown log.
    pub fn subscription_client_ids(&self) -> Vec<&ByteString> {
        self.subs_by_client_id.keys()
    }

    pub fn add_subscription(&mut self, sub: Subscription) -> bool {
        if self.subs_by_client_id.contains(&sub.client_id) {
            return false;
        }
        self.subs_by_server_id
            .insert(sub.server_id.clone(), sub.client_id.clone());
        self.subs_by_client_id.insert(sub.client_id.clone(), sub)
    }

    pub fn remove_subscription(&mut self, client_id: &[u8]) -> Option<Subscription> {
        let sub = self.subs_by_client_id.remove(client_id)?;
        self.subs_by_server_id.remove(&sub.server_id);
        Some(sub)
    }

    /// Drains one subscription; the teardown path calls this until empty so
    /// every queue router is unregistered before the connection is freed.
    pub fn remove_any_subscription(&mut self) -> Option<Subscription> {
        let (_, sub) = self.subs_by_client_id.remove_any()?;
        self.subs_by_server_id.remove(&sub.server_id);
        Some(sub)
    }

    pub fn subscription_mut_by_server_id(
        &mut self,
        server_id: &[u8],
    ) -> Option<&mut Subscription> {
        let client_id = self.subs_by_server_id.get(server_id)?.clone();
        self.subs_by_client_id.get_mut(&client_id)
    }

    // --- heartbeats ---

    /// Optional heartbeat enforcement: time out a silent peer past the grace
    /// window, and emit a keep-alive line feed when our own side is due.
    pub fn heartbeat_tick(&mut self) {
        if self.status != ConnStatus::Connected {
            return;
        }
        if self.heartbeat_in_ms > 0 {
            let deadline = Duration::from_millis(
                u64::from(self.heartbeat_in_ms) * u64::from(HEARTBEAT_GRACE),
            );
            if self.last_read.elapsed() > deadline {
                warn!(peer = %self.peer_addr, "heartbeat timeout, closing connection");
                self.close();
                return;
            }
        }
        if self.heartbeat_out_ms > 0
            && self.last_write.elapsed() >= Duration::from_millis(u64::from(self.heartbeat_out_ms))
        {
            self.outbuf.push_byte(b'\n');
        }
    }

    // --- poll registration ---

    /// Readiness interest this connection currently wants: readable while it
    /// accepts input, writable while output is pending or it is draining to
    /// close.
    pub fn desired_interest(&self) -> Option<Interest> {
        match self.status {
            ConnStatus::Closed => None,
            ConnStatus::StompError => Some(Interest::WRITABLE),
            ConnStatus::Login | ConnStatus::Connected => {
                if self.close_after_flush {
                    return Some(Interest::WRITABLE);
                }
                let mut interest = Interest::READABLE;
                if !self.outbuf.is_empty() || !self.serializer.is_idle() {
                    interest |= Interest::WRITABLE;
                }
                Some(interest)
            }
        }
    }

    /// Syncs the poll registration with the desired interest.
    pub(crate) fn update_registration(
        &mut self,
        registry: &Registry,
        token: Token,
    ) -> io::Result<()> {
        let desired = self.desired_interest();
        match (self.registered, desired) {
            (None, Some(interest)) => {
                registry.register(&mut self.stream, token, interest)?;
                self.registered = Some(interest);
            }
            (Some(current), Some(interest)) if current != interest => {
                registry.reregister(&mut self.stream, token, interest)?;
                self.registered = Some(interest);
            }
            (Some(_), None) => {
                registry.deregister(&mut self.stream)?;
                self.registered = None;
            }
            _ => {}
        }
        Ok(())
    }

    pub(crate) fn source_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }
}
