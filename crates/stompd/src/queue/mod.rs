//! Named destinations: per-queue storage, routing, and policy.

mod router;
mod storage;

pub use router::{FrameRouter, RouteTarget};
pub use storage::{Storage, StoredFrame};

use std::time::Duration;

use stompd_util::{ByteMap, ByteString};
use stompd_wire::Frame;
use tracing::{debug, warn};

use crate::config::{FullAction, QueueConfig, RejectAction};

/// What happened to a published frame.
pub enum PublishOutcome {
    /// Stored under the given queue-local id.
    Stored(u64),
    /// The queue was full and policy dropped the incoming frame.
    DroppedNewest,
    /// The queue was full and policy reports the failure to the producer;
    /// the frame comes back for error context.
    Rejected(Frame),
}

/// A named destination composing storage with a round-robin router.
pub struct Queue {
    name: ByteString,
    storage: Storage,
    router: FrameRouter,
    config: QueueConfig,
}

impl Queue {
    fn new(name: ByteString, config: QueueConfig) -> Self {
        let storage = Storage::new(config.storage, config.size_max);
        Self { name, storage, router: FrameRouter::new(), config }
    }

    pub fn name(&self) -> &ByteString {
        &self.name
    }

    pub const fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Stores a published frame, applying the queue-full policy when needed.
    pub fn publish(&mut self, frame: Frame) -> PublishOutcome {
        match self.storage.enqueue(frame, 0) {
            Ok(qlid) => PublishOutcome::Stored(qlid),
            Err(frame) => match self.config.full_action {
                FullAction::Error => PublishOutcome::Rejected(frame),
                FullAction::DropNewest => {
                    warn!(queue = ?self.name, "queue full, dropping incoming frame");
                    PublishOutcome::DroppedNewest
                }
                FullAction::DropOldest => {
                    if let Some(evicted) = self.storage.dequeue() {
                        warn!(
                            queue = ?self.name,
                            qlid = evicted.qlid,
                            "queue full, evicted oldest frame"
                        );
                    }
                    match self.storage.enqueue(frame, 0) {
                        Ok(qlid) => PublishOutcome::Stored(qlid),
                        Err(frame) => PublishOutcome::Rejected(frame),
                    }
                }
            },
        }
    }

    /// Puts a rejected frame back at the tail for another delivery round.
    pub fn requeue_rejected(&mut self, frame: Frame, reject_count: u32) {
        if self.storage.enqueue(frame, reject_count).is_err() {
            warn!(queue = ?self.name, "queue full, dropping requeued frame");
        }
    }

    /// Applies the retirement policy to frames stored past the configured
    /// age. Returns how many frames were retired.
    pub fn retire_expired(&mut self) -> usize {
        if self.config.age_max_ms == 0 {
            return 0;
        }
        let max_age = Duration::from_millis(self.config.age_max_ms);
        let mut retired = 0;
        while let Some(stored) = self.storage.take_expired_head(max_age) {
            retired += 1;
            match self.config.retire_action {
                RejectAction::Drop => {
                    debug!(queue = ?self.name, qlid = stored.qlid, "retired frame dropped");
                }
                RejectAction::Requeue => {
                    // Re-enter at the tail with a fresh age.
                    debug!(queue = ?self.name, qlid = stored.qlid, "retired frame requeued");
                    self.requeue_rejected(stored.frame, stored.reject_count);
                }
            }
        }
        retired
    }

    // Storage and router pass-throughs used by the dispatch loop.

    pub fn storage_is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    pub fn storage_len(&self) -> usize {
        self.storage.len()
    }

    pub fn storage_dequeue(&mut self) -> Option<StoredFrame> {
        self.storage.dequeue()
    }

    pub fn storage_requeue_front(&mut self, stored: StoredFrame) {
        self.storage.requeue_front(stored);
    }

    pub fn router_add(&mut self, target: RouteTarget) {
        self.router.add(target);
    }

    pub fn router_remove(&mut self, conn: usize, server_id: &[u8]) -> bool {
        self.router.remove(conn, server_id)
    }

    pub fn router_is_empty(&self) -> bool {
        self.router.is_empty()
    }

    pub fn router_mut(&mut self) -> &mut FrameRouter {
        &mut self.router
    }
}

/// All named queues, auto-created on first reference with the broker's
/// default queue config.
pub struct QueueBundle {
    queues: ByteMap<Queue>,
    template: QueueConfig,
}

impl QueueBundle {
    pub fn new(template: QueueConfig) -> Self {
        Self { queues: ByteMap::new(), template }
    }

    pub fn ensure_queue(&mut self, name: &[u8]) -> &mut Queue {
        if !self.queues.contains(name) {
            let key = ByteString::from_slice(name);
            debug!(queue = ?key, "queue created");
            self.queues
                .insert(key.clone(), Queue::new(key, self.template.clone()));
        }
        self.queues
            .get_mut(name)
            .expect("queue exists after ensure")
    }

    pub fn get_mut(&mut self, name: &[u8]) -> Option<&mut Queue> {
        self.queues.get_mut(name)
    }

    /// Sweeps every queue's age-retirement policy. Returns total frames
    /// retired.
    pub fn retire_expired(&mut self) -> usize {
        self.queues.iter_mut().map(|(_, q)| q.retire_expired()).sum()
    }

    /// Names of queues holding frames that have somewhere to go.
    pub fn backlog_names(&self) -> Vec<ByteString> {
        self.queues
            .iter()
            .filter(|(_, q)| !q.storage_is_empty() && !q.router_is_empty())
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}

#[cfg(test)]
mod test {
    use stompd_wire::Command;

    use super::*;

    fn config(size_max: usize, full_action: FullAction) -> QueueConfig {
        QueueConfig {
            size_max,
            full_action,
            nack_action: RejectAction::Drop,
            ..QueueConfig::default()
        }
    }

    fn frame(tag: &str) -> Frame {
        let mut f = Frame::new(Command::Send);
        f.push_header("destination", "/q");
        f.set_body(tag.into());
        f
    }

    #[test]
    fn ensure_queue_creates_once() {
        let mut bundle = QueueBundle::new(QueueConfig::default());
        bundle.ensure_queue(b"/queue/a");
        bundle.ensure_queue(b"/queue/a");
        bundle.ensure_queue(b"/queue/b");
        assert_eq!(bundle.len(), 2);
        assert!(bundle.get_mut(b"/queue/a").is_some());
        assert!(bundle.get_mut(b"/queue/c").is_none());
    }

    #[test]
    fn full_error_policy_hands_the_frame_back() {
        let mut queue = Queue::new("/q".into(), config(1, FullAction::Error));
        assert!(matches!(queue.publish(frame("a")), PublishOutcome::Stored(_)));
        match queue.publish(frame("b")) {
            PublishOutcome::Rejected(f) => assert_eq!(f.body_bytes(), b"b"),
            _ => panic!("expected rejection"),
        }
        assert_eq!(queue.storage_len(), 1);
    }

    #[test]
    fn full_drop_oldest_policy_evicts_the_head() {
        let mut queue = Queue::new("/q".into(), config(2, FullAction::DropOldest));
        queue.publish(frame("a"));
        queue.publish(frame("b"));
        assert!(matches!(queue.publish(frame("c")), PublishOutcome::Stored(_)));

        assert_eq!(queue.storage_dequeue().unwrap().frame.body_bytes(), b"b");
        assert_eq!(queue.storage_dequeue().unwrap().frame.body_bytes(), b"c");
        assert!(queue.storage_dequeue().is_none());
    }

    #[test]
    fn full_drop_newest_policy_keeps_the_backlog() {
        let mut queue = Queue::new("/q".into(), config(2, FullAction::DropNewest));
        queue.publish(frame("a"));
        queue.publish(frame("b"));
        assert!(matches!(queue.publish(frame("c")), PublishOutcome::DroppedNewest));

        assert_eq!(queue.storage_dequeue().unwrap().frame.body_bytes(), b"a");
        assert_eq!(queue.storage_dequeue().unwrap().frame.body_bytes(), b"b");
    }

    #[test]
    fn retirement_is_disabled_by_default() {
        let mut queue = Queue::new("/q".into(), QueueConfig::default());
        queue.publish(frame("a"));
        assert_eq!(queue.retire_expired(), 0);
        assert_eq!(queue.storage_len(), 1);
    }

    #[test]
    fn expired_frames_are_dropped_or_requeued_per_policy() {
        let mut dropping = Queue::new(
            "/q".into(),
            QueueConfig { age_max_ms: 1, ..QueueConfig::default() },
        );
        dropping.publish(frame("old"));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(dropping.retire_expired(), 1);
        assert_eq!(dropping.storage_len(), 0);

        let mut requeuing = Queue::new(
            "/q".into(),
            QueueConfig {
                age_max_ms: 1,
                retire_action: RejectAction::Requeue,
                ..QueueConfig::default()
            },
        );
        requeuing.publish(frame("old"));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(requeuing.retire_expired(), 1);
        // Requeued with a fresh age, so it is still stored.
        assert_eq!(requeuing.storage_len(), 1);
    }

    #[test]
    fn requeued_frames_carry_their_reject_count() {
        let mut queue = Queue::new("/q".into(), config(4, FullAction::Error));
        queue.requeue_rejected(frame("x"), 3);
        let stored = queue.storage_dequeue().unwrap();
        assert_eq!(stored.reject_count, 3);
    }
}
