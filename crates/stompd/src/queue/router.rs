use stompd_util::ByteString;

/// Back-reference from a queue to one subscription: the owning connection's
/// slot id plus the broker-assigned subscription id within it. The
/// subscription itself stays owned by its connection; targets here are
/// cleared before that connection is freed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTarget {
    pub conn: usize,
    pub server_id: ByteString,
}

/// Round-robin dispatcher over a queue's subscriptions.
pub struct FrameRouter {
    targets: Vec<RouteTarget>,
    position: usize,
}

impl FrameRouter {
    pub const fn new() -> Self {
        Self { targets: Vec::new(), position: 0 }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn add(&mut self, target: RouteTarget) {
        self.targets.push(target);
    }

    pub fn remove(&mut self, conn: usize, server_id: &[u8]) -> bool {
        let Some(index) = self
            .targets
            .iter()
            .position(|t| t.conn == conn && t.server_id.as_bytes() == server_id)
        else {
            return false;
        };
        self.targets.remove(index);
        true
    }

    /// The next target in rotation. The position is reduced modulo the
    /// current length on every pick, so removals never strand it.
    pub fn advance(&mut self) -> Option<RouteTarget> {
        if self.targets.is_empty() {
            return None;
        }
        self.position %= self.targets.len();
        let target = self.targets[self.position].clone();
        self.position += 1;
        Some(target)
    }
}

impl Default for FrameRouter {
    fn default() -> Self {
        Self::new()
    }
}
