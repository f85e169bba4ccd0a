use std::{
    io,
    net::SocketAddr,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use mio::{Events, Interest, Poll, Token};
use stompd_util::{ByteString, soft_panic};
use stompd_wire::{Command, Frame};
use tracing::{debug, info, warn};

use crate::{
    bundle::ConnectionBundle,
    config::{BrokerConfig, RejectAction},
    connection::{ConnStatus, Connection},
    listener::{BindError, Listener},
    queue::{FrameRouter, PublishOutcome, QueueBundle, RouteTarget},
    subscription::{AckMode, Subscription},
};

const TOKEN_LISTENER: Token = Token(0);
const POLL_TIMEOUT: Duration = Duration::from_secs(30);
const EVENTS_CAPACITY: usize = 128;

/// The broker: one poll, one listener, the connection set, and the queues.
///
/// Everything runs on the thread that calls [`run`](Self::run). Each loop
/// tick handles readiness events, drives parsing and broker commands, routes
/// published frames, flushes output, and reaps closed connections.
pub struct Broker {
    config: BrokerConfig,
    poll: Poll,
    events: Events,
    listener: Listener,
    connections: ConnectionBundle,
    queues: QueueBundle,
}

impl Broker {
    /// Binds the listener and sets up the poll. Fatal errors here mean the
    /// process cannot start.
    pub fn bind(config: BrokerConfig) -> Result<Self, BindError> {
        let poll = Poll::new().map_err(BindError::Poll)?;
        let mut listener = Listener::bind(config.listen_addr, config.port)?;
        poll.registry()
            .register(listener.source_mut(), TOKEN_LISTENER, Interest::READABLE)
            .map_err(BindError::Register)?;

        Ok(Self {
            queues: QueueBundle::new(config.queue.clone()),
            config,
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            listener,
            connections: ConnectionBundle::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    /// Runs until `shutdown` is set. Errors out of here are fatal to the
    /// process (poll or accept failures).
    pub fn run(&mut self, shutdown: &AtomicBool) -> io::Result<()> {
        info!(addr = %self.local_addr(), "broker running");
        while !shutdown.load(Ordering::Relaxed) {
            self.poll_once(Some(POLL_TIMEOUT))?;
        }
        info!("broker shutting down");
        Ok(())
    }

    /// One loop tick: wait for readiness, service what woke up, flush,
    /// re-register, reap.
    pub fn poll_once(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        let ready: Vec<(Token, bool, bool)> = self
            .events
            .iter()
            .map(|e| (e.token(), e.is_readable(), e.is_writable()))
            .collect();

        for (token, readable, writable) in ready {
            if token == TOKEN_LISTENER {
                self.accept_pending()?;
            } else {
                self.service_connection(token.0 - 1, readable, writable);
            }
        }

        if self.config.enforce_heartbeats {
            for (_, conn) in self.connections.iter_mut() {
                conn.heartbeat_tick();
            }
        }

        let retired = self.queues.retire_expired();
        if retired > 0 {
            debug!(retired, "frames retired past their age limit");
        }

        // Routed frames may have landed in connections that saw no event this
        // tick, and a backlogged queue can only make progress once its
        // target's serializer has been drained; alternate flushing and
        // re-dispatching until deliveries stop.
        loop {
            for (_, conn) in self.connections.iter_mut() {
                conn.flush();
            }
            if self.dispatch_backlog() == 0 {
                break;
            }
        }

        self.update_registrations();
        self.reap_closed();
        Ok(())
    }

    /// Accepts every pending connection. Unexpected accept errors escalate
    /// and take the broker down.
    fn accept_pending(&mut self) -> io::Result<()> {
        while let Some((stream, peer)) = self.listener.accept()? {
            match Connection::new(stream, peer) {
                Ok(conn) => {
                    let id = self.connections.add(conn);
                    info!(conn = id, %peer, "connection accepted");
                }
                Err(e) => warn!(%peer, error = %e, "failed to set up accepted connection"),
            }
        }
        Ok(())
    }

    fn service_connection(&mut self, id: usize, readable: bool, writable: bool) {
        let read_size = self.config.read_size;
        let Some(conn) = self.connections.get_mut(id) else {
            soft_panic!("readiness event for unknown connection {id}");
            return;
        };

        if writable {
            conn.pump_output();
        }
        if readable && conn.wants_input() {
            conn.pump_input(read_size);
        }

        self.process_frames(id);
    }

    /// Parses and handles every frame buffered on the connection, stopping
    /// when it leaves an input-accepting state.
    fn process_frames(&mut self, id: usize) {
        loop {
            let Some(conn) = self.connections.get_mut(id) else { return };
            if !conn.wants_input() {
                return;
            }
            match conn.poll_frame() {
                None => return,
                Some(Ok(frame)) => self.handle_frame(id, frame),
                Some(Err(message)) => {
                    warn!(conn = id, error = ?message, "protocol error");
                    conn.send_error_message(None, message);
                    return;
                }
            }
        }
    }

    fn handle_frame(&mut self, id: usize, frame: Frame) {
        let Some(status) = self.connections.get(id).map(Connection::status) else {
            return;
        };
        debug!(conn = id, command = frame.command().as_str(), "frame received");
        match status {
            ConnStatus::Login => self.handle_login(id, frame),
            ConnStatus::Connected => self.handle_command(id, frame),
            ConnStatus::StompError | ConnStatus::Closed => {}
        }
    }

    // --- handshake ---

    fn handle_login(&mut self, id: usize, frame: Frame) {
        if !matches!(frame.command(), Command::Connect | Command::Stomp) {
            self.error_to(id, Some(&frame), "Expected CONNECT or STOMP frame");
            return;
        }

        let version_ok = frame
            .header(b"accept-version")
            .is_some_and(|v| v.as_bytes().split(|&b| b == b',').any(|p| p == b"1.2"));
        if !version_ok {
            self.error_to(id, Some(&frame), "Unsupported protocol version");
            return;
        }

        let offered_heartbeat = frame.header(b"heart-beat").is_some();
        let (client_send_ms, client_recv_ms) = match frame.header(b"heart-beat") {
            None => (0, 0),
            Some(value) => match parse_heartbeat(value) {
                Some(pair) => pair,
                None => {
                    self.error_to(id, Some(&frame), "Malformed 'heart-beat' header");
                    return;
                }
            },
        };

        let mut reply = Frame::new(Command::Connected);
        reply.push_header("version", "1.2");
        if offered_heartbeat {
            // Reply is "what we send, what we want": we agree to emit at the
            // client's desired cadence and to expect its declared one.
            reply.push_header("heart-beat", format!("{client_recv_ms},{client_send_ms}"));
        }

        let Some(conn) = self.connections.get_mut(id) else { return };
        conn.complete_login(client_send_ms, client_recv_ms);
        conn.enqueue_or_close(reply);
        info!(conn = id, "client logged in");
    }

    // --- connected-state commands ---

    fn handle_command(&mut self, id: usize, frame: Frame) {
        match frame.command() {
            Command::Send => self.handle_send(id, frame),
            Command::Subscribe => self.handle_subscribe(id, frame),
            Command::Unsubscribe => self.handle_unsubscribe(id, frame),
            Command::Ack => self.handle_ack(id, frame, true),
            Command::Nack => self.handle_ack(id, frame, false),
            Command::Disconnect => self.handle_disconnect(id, frame),
            Command::Begin | Command::Commit | Command::Abort => {
                self.handle_transaction(id, frame);
            }
            Command::Connect | Command::Stomp => {
                self.error_to(id, Some(&frame), "Already connected");
            }
            Command::Connected | Command::Message | Command::Receipt | Command::Error => {
                self.error_to(id, Some(&frame), "Command not permitted from a client");
            }
        }
    }

    fn handle_send(&mut self, id: usize, frame: Frame) {
        let Some(destination) = frame.header(b"destination").cloned() else {
            self.error_to(id, Some(&frame), "SEND requires 'destination' header");
            return;
        };
        let receipt = frame.header(b"receipt").cloned();

        let queue = self.queues.ensure_queue(&destination);
        match queue.publish(frame) {
            PublishOutcome::Stored(qlid) => {
                debug!(conn = id, queue = ?destination, qlid, "frame published");
            }
            PublishOutcome::DroppedNewest => {}
            PublishOutcome::Rejected(frame) => {
                self.error_to(id, Some(&frame), "Queue is full");
                return;
            }
        }

        if let Some(receipt) = receipt {
            self.send_receipt(id, receipt);
        }
        self.dispatch_queue(&destination);
    }

    fn handle_subscribe(&mut self, id: usize, frame: Frame) {
        let Some(destination) = frame.header(b"destination").cloned() else {
            self.error_to(id, Some(&frame), "SUBSCRIBE requires 'destination' header");
            return;
        };
        let Some(client_id) = frame.header(b"id").cloned() else {
            self.error_to(id, Some(&frame), "SUBSCRIBE requires 'id' header");
            return;
        };
        let ack_mode = match frame.header(b"ack") {
            None => AckMode::Auto,
            Some(value) => match AckMode::from_bytes(value) {
                Some(mode) => mode,
                None => {
                    self.error_to(id, Some(&frame), "Invalid 'ack' header value");
                    return;
                }
            },
        };
        let receipt = frame.header(b"receipt").cloned();

        let Some(conn) = self.connections.get_mut(id) else { return };
        if conn.has_subscription(&client_id) {
            conn.send_error_message(Some(&frame), "Subscription id already in use");
            return;
        }
        let server_id = conn.generate_subscription_server_id();
        conn.add_subscription(Subscription::new(
            destination.clone(),
            client_id.clone(),
            server_id.clone(),
            ack_mode,
        ));
        debug!(
            conn = id,
            queue = ?destination,
            client_id = ?client_id,
            server_id = ?server_id,
            ?ack_mode,
            "subscribed"
        );

        let queue = self.queues.ensure_queue(&destination);
        queue.router_add(RouteTarget { conn: id, server_id });

        if let Some(receipt) = receipt {
            self.send_receipt(id, receipt);
        }
        // A new subscriber picks up any backlog waiting in storage.
        self.dispatch_queue(&destination);
    }

    fn handle_unsubscribe(&mut self, id: usize, frame: Frame) {
        let Some(sub_id) = frame.header(b"id").cloned() else {
            self.error_to(id, Some(&frame), "UNSUBSCRIBE requires 'id' header");
            return;
        };
        let receipt = frame.header(b"receipt").cloned();

        let Some(conn) = self.connections.get_mut(id) else { return };
        match conn.remove_subscription(&sub_id) {
            Some(sub) => {
                if let Some(queue) = self.queues.get_mut(&sub.queue_name) {
                    queue.router_remove(id, &sub.server_id);
                }
                debug!(conn = id, client_id = ?sub_id, "unsubscribed");
                if let Some(receipt) = receipt {
                    self.send_receipt(id, receipt);
                }
            }
            None => {
                conn.send_error_message(Some(&frame), "No subscription with that id");
            }
        }
    }

    fn handle_ack(&mut self, id: usize, frame: Frame, is_ack: bool) {
        let name = if is_ack { "ACK" } else { "NACK" };
        let Some(token) = frame.header(b"id").cloned() else {
            self.error_to(id, Some(&frame), format!("{name} requires 'id' header"));
            return;
        };
        let receipt = frame.header(b"receipt").cloned();

        // Token format is server_id/message-id; an unknown or stale token is
        // not worth killing the session over.
        let settled = self.settle_ack(id, &token, is_ack);
        if settled.is_none() {
            debug!(conn = id, token = ?token, "{} for unknown delivery", name);
        }

        if let Some(receipt) = receipt {
            self.send_receipt(id, receipt);
        }
    }

    /// Applies an ACK or NACK to the delivery table behind `token`. Returns
    /// `None` when the token resolves to nothing.
    fn settle_ack(&mut self, id: usize, token: &ByteString, is_ack: bool) -> Option<()> {
        let slash = token.find_byte(b'/', 0)?;
        let server_id = token[..slash].to_vec();

        let conn = self.connections.get_mut(id)?;
        let sub = conn.subscription_mut_by_server_id(&server_id)?;

        if is_ack {
            let settled = sub.acknowledge(token);
            if settled.is_empty() {
                return None;
            }
            debug!(conn = id, count = settled.len(), "deliveries acknowledged");
            return Some(());
        }

        let delivery = sub.reject(token)?;
        let queue_name = sub.queue_name.clone();
        let queue = self.queues.get_mut(&queue_name)?;
        let mut redispatch = false;
        match queue.config().nack_action {
            RejectAction::Drop => {
                debug!(conn = id, queue = ?queue_name, "nacked frame dropped");
            }
            RejectAction::Requeue => {
                let rejects = delivery.rejects + 1;
                if rejects > queue.config().nack_max {
                    warn!(
                        conn = id,
                        queue = ?queue_name,
                        rejects,
                        "frame exceeded nack limit, dropping"
                    );
                } else {
                    queue.requeue_rejected(delivery.source, rejects);
                    redispatch = true;
                }
            }
        }
        if redispatch {
            self.dispatch_queue(&queue_name);
        }
        Some(())
    }

    fn handle_disconnect(&mut self, id: usize, frame: Frame) {
        let receipt = frame.header(b"receipt").cloned();
        let Some(conn) = self.connections.get_mut(id) else { return };
        if let Some(receipt) = receipt {
            let mut reply = Frame::new(Command::Receipt);
            reply.push_header("receipt-id", receipt);
            conn.enqueue_or_close(reply);
        }
        conn.begin_disconnect();
        info!(conn = id, "client disconnecting");
    }

    /// BEGIN/COMMIT/ABORT are protocol surface only: validated and receipted,
    /// with no transactional grouping behind them.
    fn handle_transaction(&mut self, id: usize, frame: Frame) {
        if frame.header(b"transaction").is_none() {
            let name = frame.command().as_str();
            self.error_to(id, Some(&frame), format!("{name} requires 'transaction' header"));
            return;
        }
        debug!(conn = id, command = frame.command().as_str(), "transaction frame accepted");
        if let Some(receipt) = frame.header(b"receipt").cloned() {
            self.send_receipt(id, receipt);
        }
    }

    // --- routing ---

    /// Moves frames from a queue's storage to ready subscribers, one frame
    /// per router pick, until storage empties or nobody can take more.
    /// Returns the number of frames delivered.
    fn dispatch_queue(&mut self, name: &[u8]) -> usize {
        let Some(queue) = self.queues.get_mut(name) else { return 0 };
        let conns = &mut self.connections;
        let mut delivered = 0;

        while !queue.storage_is_empty() {
            let Some(target) = next_ready_target(queue.router_mut(), conns) else {
                break;
            };
            let Some(stored) = queue.storage_dequeue() else { break };
            match conns.get_mut(target.conn) {
                Some(conn) => {
                    if let Err(stored) = conn.deliver(&target.server_id, stored) {
                        queue.storage_requeue_front(stored);
                        break;
                    }
                    delivered += 1;
                }
                None => {
                    queue.storage_requeue_front(stored);
                    queue.router_remove(target.conn, &target.server_id);
                }
            }
        }
        delivered
    }

    /// Re-dispatches every queue still holding frames with at least one
    /// subscriber registered. Returns total frames delivered.
    fn dispatch_backlog(&mut self) -> usize {
        let pending = self.queues.backlog_names();
        let mut delivered = 0;
        for name in pending {
            delivered += self.dispatch_queue(&name);
        }
        delivered
    }

    // --- plumbing ---

    fn send_receipt(&mut self, id: usize, receipt: ByteString) {
        let Some(conn) = self.connections.get_mut(id) else { return };
        let mut reply = Frame::new(Command::Receipt);
        reply.push_header("receipt-id", receipt);
        conn.enqueue_or_close(reply);
    }

    fn error_to(&mut self, id: usize, causal: Option<&Frame>, message: impl Into<ByteString>) {
        if let Some(conn) = self.connections.get_mut(id) {
            conn.send_error_message(causal, message);
        }
    }

    fn update_registrations(&mut self) {
        let registry = self.poll.registry();
        for (id, conn) in self.connections.iter_mut() {
            if let Err(e) = conn.update_registration(registry, Token(id + 1)) {
                warn!(conn = id, error = %e, "poll registration failed");
                conn.abort(e);
            }
        }
    }

    /// Collects closed connections, force-unregistering their subscriptions
    /// from every queue router before the connection is dropped.
    fn reap_closed(&mut self) {
        let closed: Vec<usize> = self
            .connections
            .iter()
            .filter(|(_, c)| c.status() == ConnStatus::Closed)
            .map(|(id, _)| id)
            .collect();

        for id in closed {
            let Some(mut conn) = self.connections.remove(id) else { continue };
            let subs = conn.subscription_client_ids();
            if !subs.is_empty() {
                debug!(conn = id, subscriptions = ?subs, "unregistering subscriptions");
            }
            while let Some(sub) = conn.remove_any_subscription() {
                if let Some(queue) = self.queues.get_mut(&sub.queue_name) {
                    queue.router_remove(id, &sub.server_id);
                }
            }
            // The registration may already be gone; either way the socket
            // closes when the connection drops here.
            let _ = self.poll.registry().deregister(conn.source_mut());
            match conn.take_error() {
                Some(e) => info!(conn = id, error = %e, "connection closed due to error"),
                None => info!(conn = id, "connection closed"),
            }
        }
    }
}

/// Picks the next subscription in rotation whose connection can take a frame
/// right now; drops stale targets on the way.
fn next_ready_target(router: &mut FrameRouter, conns: &ConnectionBundle) -> Option<RouteTarget> {
    let mut scanned = 0;
    while scanned < router.len() {
        let target = router.advance()?;
        match conns.get(target.conn) {
            Some(conn) if conn.can_deliver() => return Some(target),
            Some(_) => scanned += 1,
            None => {
                // Reaping should have removed this; recover anyway.
                router.remove(target.conn, &target.server_id);
            }
        }
    }
    None
}

/// Parses a `heart-beat: cx,cy` header into its two millisecond values.
fn parse_heartbeat(value: &ByteString) -> Option<(u32, u32)> {
    let text = std::str::from_utf8(value).ok()?;
    let (cx, cy) = text.split_once(',')?;
    Some((cx.parse().ok()?, cy.parse().ok()?))
}
