//! Leader-side replication progress for each peer.

/// How the leader is currently feeding a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressState {
    /// Looking for the point where logs agree; one append in flight at a time.
    Probe,
    /// Logs agree; entries are streamed optimistically.
    Replicate,
    /// A snapshot covering `pending` was sent; waiting for it to be installed.
    Snapshot { pending: u64 },
}

#[derive(Debug, Clone)]
pub struct Progress {
    pub match_index: u64,
    pub next_index: u64,
    pub state: ProgressState,
    /// Set in probe state after an append is sent, cleared by a response or
    /// heartbeat.
    pub paused: bool,
    /// Whether the peer responded during the current check-quorum window.
    pub recent_active: bool,
}

impl Progress {
    pub fn new(next_index: u64) -> Self {
        Self {
            match_index: 0,
            next_index,
            state: ProgressState::Probe,
            paused: false,
            recent_active: false,
        }
    }

    pub fn become_probe(&mut self) {
        if let ProgressState::Snapshot { pending } = self.state {
            self.next_index = (self.match_index + 1).max(pending + 1);
        } else {
            self.next_index = self.match_index + 1;
        }
        self.state = ProgressState::Probe;
        self.paused = false;
    }

    pub fn become_replicate(&mut self) {
        self.state = ProgressState::Replicate;
        self.next_index = self.match_index + 1;
        self.paused = false;
    }

    pub fn become_snapshot(&mut self, pending: u64) {
        self.state = ProgressState::Snapshot { pending };
        self.paused = false;
    }

    /// Record a successful append up to `index`. Returns whether the match
    /// index advanced.
    pub fn maybe_update(&mut self, index: u64) -> bool {
        let advanced = index > self.match_index;
        if advanced {
            self.match_index = index;
        }
        self.next_index = self.next_index.max(index + 1);
        self.paused = false;
        advanced
    }

    /// Optimistically advance `next_index` after streaming entries.
    pub fn optimistic_update(&mut self, last_sent: u64) {
        self.next_index = last_sent + 1;
    }

    /// Handle a rejection of the append whose `prev_log_index` was
    /// `rejected`. Returns false when the rejection is stale.
    pub fn maybe_decrease(&mut self, rejected: u64, hint: u64) -> bool {
        if self.state == ProgressState::Replicate {
            if rejected <= self.match_index {
                return false;
            }
            self.next_index = self.match_index + 1;
            return true;
        }
        if self.next_index == 0 || self.next_index - 1 != rejected {
            return false;
        }
        self.next_index = rejected.min(hint + 1).max(1);
        self.paused = false;
        true
    }

    pub fn is_paused(&self) -> bool {
        match self.state {
            ProgressState::Probe => self.paused,
            ProgressState::Replicate => false,
            ProgressState::Snapshot { .. } => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_backs_off_to_hint() {
        let mut pr = Progress::new(11);
        assert!(pr.maybe_decrease(10, 4));
        assert_eq!(pr.next_index, 5);
        // a rejection for an older probe is ignored
        assert!(!pr.maybe_decrease(10, 2));
        assert_eq!(pr.next_index, 5);
    }

    #[test]
    fn replicate_ignores_stale_rejections() {
        let mut pr = Progress::new(1);
        pr.maybe_update(8);
        pr.become_replicate();
        pr.optimistic_update(12);
        assert!(!pr.maybe_decrease(7, 0));
        assert_eq!(pr.next_index, 13);
        assert!(pr.maybe_decrease(12, 9));
        assert_eq!(pr.next_index, 9);
    }

    #[test]
    fn snapshot_state_pauses_until_probe() {
        let mut pr = Progress::new(3);
        pr.become_snapshot(50);
        assert!(pr.is_paused());
        pr.maybe_update(50);
        pr.become_probe();
        assert_eq!(pr.next_index, 51);
        assert!(!pr.is_paused());
    }
}
