use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use stompd_wire::Frame;
use tracing::warn;

use crate::config::StorageBackend;

/// A frame held by a queue, with its queue-local id and rejection count.
pub struct StoredFrame {
    /// Monotonically increasing within one queue.
    pub qlid: u64,
    /// Times a consumer has already rejected this frame.
    pub reject_count: u32,
    /// When the frame entered this storage; drives age retirement.
    pub enqueued_at: Instant,
    pub frame: Frame,
}

/// Closed set of storage backends sharing the enqueue/dequeue capability.
pub enum Storage {
    Memory(MemoryStorage),
    ServerInfo(ServerInfoStorage),
}

impl Storage {
    pub fn new(backend: StorageBackend, size_max: usize) -> Self {
        match backend {
            StorageBackend::Memory => Self::Memory(MemoryStorage::new(size_max)),
            StorageBackend::ServerInfo => Self::ServerInfo(ServerInfoStorage),
        }
    }

    /// Appends a frame, returning its queue-local id, or the frame itself
    /// when the backend has no room for it.
    pub fn enqueue(&mut self, frame: Frame, reject_count: u32) -> Result<u64, Frame> {
        match self {
            Self::Memory(mem) => mem.enqueue(frame, reject_count),
            Self::ServerInfo(si) => si.enqueue(frame),
        }
    }

    pub fn dequeue(&mut self) -> Option<StoredFrame> {
        match self {
            Self::Memory(mem) => mem.slots.pop_front(),
            Self::ServerInfo(_) => None,
        }
    }

    /// Puts a frame back at the head after a delivery attempt fell through;
    /// its slot was only just vacated, so this cannot overflow.
    pub fn requeue_front(&mut self, stored: StoredFrame) {
        match self {
            Self::Memory(mem) => mem.slots.push_front(stored),
            Self::ServerInfo(_) => {}
        }
    }

    /// Takes the head frame if it has been stored longer than `max_age`.
    /// Heads are oldest, so retirement sweeps call this until it yields
    /// nothing.
    pub fn take_expired_head(&mut self, max_age: Duration) -> Option<StoredFrame> {
        match self {
            Self::Memory(mem) => {
                if mem.slots.front()?.enqueued_at.elapsed() > max_age {
                    mem.slots.pop_front()
                } else {
                    None
                }
            }
            Self::ServerInfo(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Memory(mem) => mem.slots.len(),
            Self::ServerInfo(_) => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// FIFO of pending frames in process memory.
pub struct MemoryStorage {
    next_qlid: u64,
    size_max: usize,
    slots: VecDeque<StoredFrame>,
}

impl MemoryStorage {
    fn new(size_max: usize) -> Self {
        Self { next_qlid: 0, size_max, slots: VecDeque::new() }
    }

    fn enqueue(&mut self, frame: Frame, reject_count: u32) -> Result<u64, Frame> {
        if self.slots.len() >= self.size_max {
            return Err(frame);
        }
        let qlid = self.next_qlid;
        self.next_qlid += 1;
        self.slots
            .push_back(StoredFrame { qlid, reject_count, enqueued_at: Instant::now(), frame });
        Ok(qlid)
    }
}

/// Stub backend kept for configuration compatibility; accepts nothing.
pub struct ServerInfoStorage;

impl ServerInfoStorage {
    fn enqueue(&mut self, frame: Frame) -> Result<u64, Frame> {
        warn!("server-info storage backend is not implemented, rejecting frame");
        Err(frame)
    }
}

#[cfg(test)]
mod test {
    use stompd_wire::Command;

    use super::*;

    fn frame() -> Frame {
        Frame::new(Command::Send)
    }

    #[test]
    fn qlids_are_monotonic_and_fifo_order_holds() {
        let mut storage = Storage::new(StorageBackend::Memory, 8);
        let a = storage.enqueue(frame(), 0).unwrap();
        let b = storage.enqueue(frame(), 0).unwrap();
        assert!(b > a);

        assert_eq!(storage.dequeue().unwrap().qlid, a);
        assert_eq!(storage.dequeue().unwrap().qlid, b);
        assert!(storage.dequeue().is_none());

        // Ids keep climbing after a drain.
        let c = storage.enqueue(frame(), 0).unwrap();
        assert!(c > b);
    }

    #[test]
    fn enqueue_rejects_past_size_max() {
        let mut storage = Storage::new(StorageBackend::Memory, 2);
        storage.enqueue(frame(), 0).unwrap();
        storage.enqueue(frame(), 0).unwrap();
        assert!(storage.enqueue(frame(), 0).is_err());
        assert_eq!(storage.len(), 2);

        storage.dequeue().unwrap();
        assert!(storage.enqueue(frame(), 0).is_ok());
    }

    #[test]
    fn expired_heads_are_taken_oldest_first() {
        let mut storage = Storage::new(StorageBackend::Memory, 4);
        storage.enqueue(frame(), 0).unwrap();
        storage.enqueue(frame(), 0).unwrap();

        // Nothing is older than an hour yet.
        assert!(storage.take_expired_head(Duration::from_secs(3600)).is_none());
        assert_eq!(storage.len(), 2);

        std::thread::sleep(Duration::from_millis(5));
        assert!(storage.take_expired_head(Duration::from_millis(1)).is_some());
        assert!(storage.take_expired_head(Duration::from_millis(1)).is_some());
        assert!(storage.take_expired_head(Duration::from_millis(1)).is_none());
    }

    #[test]
    fn requeue_front_preserves_head_position() {
        let mut storage = Storage::new(StorageBackend::Memory, 4);
        storage.enqueue(frame(), 0).unwrap();
        storage.enqueue(frame(), 0).unwrap();

        let head = storage.dequeue().unwrap();
        let head_qlid = head.qlid;
        storage.requeue_front(head);
        assert_eq!(storage.dequeue().unwrap().qlid, head_qlid);
    }
}
