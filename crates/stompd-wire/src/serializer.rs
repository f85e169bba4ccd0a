use std::collections::VecDeque;

use crate::{
    frame::Frame,
    iobuf::IoBuf,
};
#[cfg(test)]
use crate::frame::Command;

/// Capacity of both the work queue and the completed queue.
pub const SERIALIZER_QUEUE_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkState {
    Command,
    Headers,
    Body,
}

struct WorkItem {
    frame: Frame,
    qid: u64,
    state: WorkState,
    header_index: usize,
    body_index: usize,
}

/// A frame whose bytes have been fully written out, held for the producer to
/// collect.
pub struct CompletedFrame {
    pub qid: u64,
    pub frame: Frame,
}

/// Streaming STOMP frame serializer.
///
/// Frames pass through a bounded work queue; the head item advances through
/// COMMAND, HEADERS and BODY as output space allows, then moves to a bounded
/// completed queue. A full completed queue stalls serialization until the
/// producer drains it, which is the back-pressure against oversupply.
pub struct FrameSerializer {
    work: VecDeque<WorkItem>,
    completed: VecDeque<CompletedFrame>,
    next_qid: u64,
}

impl FrameSerializer {
    pub fn new() -> Self {
        Self {
            work: VecDeque::with_capacity(SERIALIZER_QUEUE_SIZE),
            completed: VecDeque::with_capacity(SERIALIZER_QUEUE_SIZE),
            next_qid: 1,
        }
    }

    /// Queues `frame` for serialization. Returns its queue id, or `None`
    /// (giving no room) when the work queue is full.
    pub fn enqueue(&mut self, frame: Frame) -> Option<u64> {
        if self.work.len() >= SERIALIZER_QUEUE_SIZE {
            return None;
        }
        let qid = self.next_qid;
        self.next_qid += 1;
        self.work.push_back(WorkItem {
            frame,
            qid,
            state: WorkState::Command,
            header_index: 0,
            body_index: 0,
        });
        Some(qid)
    }

    #[inline]
    pub fn has_room(&self) -> bool {
        self.work.len() < SERIALIZER_QUEUE_SIZE
    }

    /// True when no frame is queued or in progress.
    #[inline]
    pub fn is_idle(&self) -> bool {
        self.work.is_empty()
    }

    #[inline]
    pub fn completed_len(&self) -> usize {
        self.completed.len()
    }

    /// Collects the oldest fully-written frame, if any.
    pub fn pop_completed(&mut self) -> Option<CompletedFrame> {
        self.completed.pop_front()
    }

    /// Serializes as much as possible into `out`.
    pub fn serialize(&mut self, out: &mut IoBuf) {
        while !self.work.is_empty() {
            if !self.step(out) {
                break;
            }
        }
    }

    /// Advances the head work item by one step. Returns true iff progress was
    /// made.
    fn step(&mut self, out: &mut IoBuf) -> bool {
        let completed_has_room = self.completed.len() < SERIALIZER_QUEUE_SIZE;
        let Some(item) = self.work.front_mut() else {
            return false;
        };

        match item.state {
            WorkState::Command => {
                out.extend_from_slice(item.frame.command().as_str().as_bytes());
                out.push_byte(b'\n');
                item.state = WorkState::Headers;
                true
            }
            WorkState::Headers => {
                let Some((key, value)) = item.frame.headers.entry(item.header_index) else {
                    // Blank line terminates the header block.
                    out.push_byte(b'\n');
                    item.state = WorkState::Body;
                    return true;
                };
                if item.frame.command().escapes_headers_on_serialize() {
                    push_escaped(out, key);
                    out.push_byte(b':');
                    push_escaped(out, value);
                } else {
                    out.extend_from_slice(key);
                    out.push_byte(b':');
                    out.extend_from_slice(value);
                }
                out.push_byte(b'\n');
                item.header_index += 1;
                true
            }
            WorkState::Body => {
                let body = item.frame.body_bytes();
                let mut wrote = 0;
                if item.body_index < body.len() {
                    out.extend_from_slice(&body[item.body_index..]);
                    wrote = body.len() - item.body_index;
                    item.body_index = body.len();
                }

                // The trailing NUL goes out only when the completed queue can
                // take the frame; otherwise the serializer stalls here.
                if completed_has_room {
                    out.push_byte(0);
                    let done = self.work.pop_front();
                    if let Some(done) = done {
                        self.completed
                            .push_back(CompletedFrame { qid: done.qid, frame: done.frame });
                    }
                    true
                } else {
                    wrote > 0
                }
            }
        }
    }
}

impl Default for FrameSerializer {
    fn default() -> Self {
        Self::new()
    }
}

/// Header octet escaping, the inverse of the parser's unescaping:
/// LF, CR, colon and backslash become `\n`, `\r`, `\c`, `\\`.
fn push_escaped(out: &mut IoBuf, bytes: &[u8]) {
    for &b in bytes {
        match b {
            b'\n' => out.extend_from_slice(b"\\n"),
            b'\r' => out.extend_from_slice(b"\\r"),
            b':' => out.extend_from_slice(b"\\c"),
            b'\\' => out.extend_from_slice(b"\\\\"),
            _ => out.push_byte(b),
        }
    }
}

#[cfg(test)]
mod test {
    use stompd_util::ByteString;

    use super::*;

    fn drain(out: &mut IoBuf) -> Vec<u8> {
        let bytes = out.as_slice().to_vec();
        out.consume(bytes.len());
        bytes
    }

    #[test]
    fn serializes_command_headers_body() {
        let mut frame = Frame::new(Command::Message);
        frame.push_header("destination", "/queue/a");
        frame.push_header("content-length", "5");
        frame.set_body(ByteString::from("hello"));

        let mut fs = FrameSerializer::new();
        let qid = fs.enqueue(frame).unwrap();
        assert_eq!(qid, 1);

        let mut out = IoBuf::with_capacity(64);
        fs.serialize(&mut out);
        assert_eq!(
            drain(&mut out),
            b"MESSAGE\ndestination:/queue/a\ncontent-length:5\n\nhello\0"
        );

        let done = fs.pop_completed().unwrap();
        assert_eq!(done.qid, 1);
        assert!(fs.is_idle());
        assert!(fs.pop_completed().is_none());
    }

    #[test]
    fn escapes_header_octets() {
        let mut frame = Frame::new(Command::Send);
        frame.push_header("k", ByteString::from_slice(b"a\nb:c\\d"));

        let mut fs = FrameSerializer::new();
        fs.enqueue(frame).unwrap();
        let mut out = IoBuf::with_capacity(64);
        fs.serialize(&mut out);
        assert_eq!(drain(&mut out), b"SEND\nk:a\\nb\\cc\\\\d\n\n\0");
    }

    #[test]
    fn connected_headers_are_not_escaped() {
        let mut frame = Frame::new(Command::Connected);
        frame.push_header("session", ByteString::from_slice(b"a:b"));

        let mut fs = FrameSerializer::new();
        fs.enqueue(frame).unwrap();
        let mut out = IoBuf::with_capacity(64);
        fs.serialize(&mut out);
        assert_eq!(drain(&mut out), b"CONNECTED\nsession:a:b\n\n\0");
    }

    #[test]
    fn connect_headers_are_escaped() {
        // The output-side exemption is CONNECTED only; CONNECT escapes like
        // any other command.
        let mut frame = Frame::new(Command::Connect);
        frame.push_header("host", ByteString::from_slice(b"a:b"));

        let mut fs = FrameSerializer::new();
        fs.enqueue(frame).unwrap();
        let mut out = IoBuf::with_capacity(64);
        fs.serialize(&mut out);
        assert_eq!(drain(&mut out), b"CONNECT\nhost:a\\cb\n\n\0");
    }

    #[test]
    fn work_queue_is_bounded() {
        let mut fs = FrameSerializer::new();
        for _ in 0..SERIALIZER_QUEUE_SIZE {
            assert!(fs.enqueue(Frame::new(Command::Receipt)).is_some());
        }
        assert!(!fs.has_room());
        assert!(fs.enqueue(Frame::new(Command::Receipt)).is_none());
    }

    #[test]
    fn full_completed_queue_stalls_the_serializer() {
        let mut fs = FrameSerializer::new();
        let mut out = IoBuf::with_capacity(1024);

        for _ in 0..SERIALIZER_QUEUE_SIZE {
            fs.enqueue(Frame::new(Command::Receipt)).unwrap();
        }
        fs.serialize(&mut out);
        assert_eq!(fs.completed_len(), SERIALIZER_QUEUE_SIZE);
        assert!(fs.is_idle());
        drain(&mut out);

        // With the completed queue still full, a further frame gets stuck
        // before its trailing NUL.
        fs.enqueue(Frame::new(Command::Receipt)).unwrap();
        fs.serialize(&mut out);
        assert!(!fs.is_idle());
        assert_eq!(drain(&mut out), b"RECEIPT\n\n");

        // Draining one completed slot lets it finish.
        fs.pop_completed().unwrap();
        fs.serialize(&mut out);
        assert!(fs.is_idle());
        assert_eq!(drain(&mut out), b"\0");
    }

    #[test]
    fn qids_are_monotonic_across_frames() {
        let mut fs = FrameSerializer::new();
        let a = fs.enqueue(Frame::new(Command::Receipt)).unwrap();
        let b = fs.enqueue(Frame::new(Command::Receipt)).unwrap();
        let mut out = IoBuf::with_capacity(64);
        fs.serialize(&mut out);
        assert_eq!(fs.pop_completed().unwrap().qid, a);
        assert_eq!(fs.pop_completed().unwrap().qid, b);
        assert!(b > a);
    }
}
