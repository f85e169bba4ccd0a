use std::fmt::Write as _;

use stompd_util::{ByteMap, ByteString};
use stompd_wire::{Command, Frame};

/// STOMP acknowledgement modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    Auto,
    Client,
    ClientIndividual,
}

impl AckMode {
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        match bytes {
            b"auto" => Some(Self::Auto),
            b"client" => Some(Self::Client),
            b"client-individual" => Some(Self::ClientIndividual),
            _ => None,
        }
    }

    /// Whether deliveries under this mode carry an ack token and are tracked
    /// until acknowledged.
    pub const fn requires_ack(self) -> bool {
        !matches!(self, Self::Auto)
    }
}

/// An unacknowledged delivery, kept for ACK/NACK correlation.
pub struct Delivery {
    /// Per-subscription delivery sequence number.
    pub seq: u64,
    /// The frame as published, retained so a NACK can requeue it.
    pub source: Frame,
    /// Times this frame has already been rejected by a consumer.
    pub rejects: u32,
}

/// A client's standing interest in one queue: the client-chosen id, the
/// broker-assigned server id, and the ack bookkeeping between them.
pub struct Subscription {
    pub queue_name: ByteString,
    pub client_id: ByteString,
    pub server_id: ByteString,
    pub ack_mode: AckMode,
    pub next_delivery_seq: u64,
    /// Outstanding deliveries keyed by ack token (`server_id/message-id`).
    pub deliveries: ByteMap<Delivery>,
}

impl Subscription {
    pub fn new(
        queue_name: ByteString,
        client_id: ByteString,
        server_id: ByteString,
        ack_mode: AckMode,
    ) -> Self {
        Self {
            queue_name,
            client_id,
            server_id,
            ack_mode,
            next_delivery_seq: 0,
            deliveries: ByteMap::new(),
        }
    }

    /// Builds the MESSAGE frame for one delivery of `source`.
    ///
    /// The source frame's headers and body carry over as published; the
    /// broker's `message-id`, `subscription` and (under non-auto ack modes)
    /// `ack` headers are prepended so they win first-occurrence lookup over
    /// anything the producer set. Non-auto modes record the delivery for
    /// later ACK/NACK correlation.
    pub fn prepare_delivery(&mut self, source: Frame, reject_count: u32) -> Frame {
        let seq = self.next_delivery_seq;
        self.next_delivery_seq += 1;

        let mut message_id = ByteString::with_capacity(12);
        let _ = write!(message_id, "m-{seq:x}");

        let retained = if self.ack_mode.requires_ack() {
            Some(source.clone())
        } else {
            None
        };

        let (_, headers, body) = source.into_parts();
        let mut message = Frame::new(Command::Message);
        message.headers = headers;
        if let Some(body) = body {
            message.set_body(body);
        }

        if self.ack_mode.requires_ack() {
            let mut token =
                ByteString::with_capacity(self.server_id.len() + 1 + message_id.len());
            token.extend_from_slice(&self.server_id);
            token.push_byte(b'/');
            token.extend_from_slice(&message_id);
            message.prepend_header("ack", token.clone());
            if let Some(source) = retained {
                self.deliveries
                    .insert(token, Delivery { seq, source, rejects: reject_count });
            }
        }
        message.prepend_header("subscription", self.server_id.clone());
        message.prepend_header("message-id", message_id);
        message
    }

    /// Settles deliveries for an ACK of `token`. `client` mode is
    /// cumulative (everything up to and including the token's delivery);
    /// `client-individual` settles exactly one. Returns the settled
    /// deliveries, empty when the token is unknown.
    pub fn acknowledge(&mut self, token: &[u8]) -> Vec<Delivery> {
        match self.ack_mode {
            AckMode::Auto => Vec::new(),
            AckMode::ClientIndividual => {
                self.deliveries.remove(token).into_iter().collect()
            }
            AckMode::Client => {
                let Some(upto) = self.deliveries.get(token).map(|d| d.seq) else {
                    return Vec::new();
                };
                let tokens: Vec<ByteString> = self
                    .deliveries
                    .iter()
                    .filter(|(_, d)| d.seq <= upto)
                    .map(|(k, _)| k.clone())
                    .collect();
                tokens
                    .iter()
                    .filter_map(|k| self.deliveries.remove(k))
                    .collect()
            }
        }
    }

    /// Takes the delivery a NACK of `token` refers to, if known. The caller
    /// applies the queue's reject policy to it.
    pub fn reject(&mut self, token: &[u8]) -> Option<Delivery> {
        self.deliveries.remove(token)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn send_frame(body: &str) -> Frame {
        let mut frame = Frame::new(Command::Send);
        frame.push_header("destination", "/queue/a");
        frame.set_body(ByteString::from(body));
        frame
    }

    fn sub(ack_mode: AckMode) -> Subscription {
        Subscription::new(
            ByteString::from("/queue/a"),
            ByteString::from("client-7"),
            ByteString::from("sub-0"),
            ack_mode,
        )
    }

    #[test]
    fn auto_mode_message_has_no_ack_header() {
        let mut sub = sub(AckMode::Auto);
        let message = sub.prepare_delivery(send_frame("hi"), 0);
        assert_eq!(message.command(), Command::Message);
        assert_eq!(message.header(b"message-id").unwrap(), b"m-0".as_slice());
        assert_eq!(message.header(b"subscription").unwrap(), b"sub-0".as_slice());
        assert_eq!(message.header(b"destination").unwrap(), b"/queue/a".as_slice());
        assert!(message.header(b"ack").is_none());
        assert_eq!(message.body_bytes(), b"hi");
        assert!(sub.deliveries.is_empty());
    }

    #[test]
    fn client_mode_tracks_and_acks_cumulatively() {
        let mut sub = sub(AckMode::Client);
        let m0 = sub.prepare_delivery(send_frame("a"), 0);
        let _m1 = sub.prepare_delivery(send_frame("b"), 0);
        let m2 = sub.prepare_delivery(send_frame("c"), 0);
        assert_eq!(m0.header(b"ack").unwrap(), b"sub-0/m-0".as_slice());
        assert_eq!(sub.deliveries.len(), 3);

        // Acking the second settles the first two, leaves the third.
        let settled = sub.acknowledge(b"sub-0/m-1");
        assert_eq!(settled.len(), 2);
        assert_eq!(sub.deliveries.len(), 1);
        assert_eq!(m2.header(b"ack").unwrap(), b"sub-0/m-2".as_slice());
        assert!(sub.deliveries.get(b"sub-0/m-2").is_some());
    }

    #[test]
    fn client_individual_mode_acks_one() {
        let mut sub = sub(AckMode::ClientIndividual);
        sub.prepare_delivery(send_frame("a"), 0);
        sub.prepare_delivery(send_frame("b"), 0);

        let settled = sub.acknowledge(b"sub-0/m-1");
        assert_eq!(settled.len(), 1);
        assert_eq!(sub.deliveries.len(), 1);
        assert!(sub.deliveries.get(b"sub-0/m-0").is_some());

        assert!(sub.acknowledge(b"sub-0/m-99").is_empty());
        assert_eq!(sub.deliveries.len(), 1);
    }

    #[test]
    fn reject_hands_back_the_source_frame() {
        let mut sub = sub(AckMode::Client);
        sub.prepare_delivery(send_frame("payload"), 2);
        let delivery = sub.reject(b"sub-0/m-0").unwrap();
        assert_eq!(delivery.rejects, 2);
        assert_eq!(delivery.source.body_bytes(), b"payload");
        assert!(sub.reject(b"sub-0/m-0").is_none());
    }

    #[test]
    fn broker_headers_win_over_forged_client_headers() {
        let mut sub = sub(AckMode::Auto);
        let mut forged = send_frame("x");
        forged.push_header("message-id", "forged");
        let message = sub.prepare_delivery(forged, 0);
        assert_eq!(message.header(b"message-id").unwrap(), b"m-0".as_slice());
    }
}
