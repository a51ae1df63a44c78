//! Sequence number freshness tracking

/// Sequence numbers this far behind the last seen one are treated as stale.
/// Larger gaps are taken as a sender restart or wraparound.
pub const STALE_WINDOW: u16 = 5;

/// True if `received` is a duplicate or a reorder of a recently seen packet.
pub fn is_stale(received: u16, last_seen: u16) -> bool {
    received <= last_seen && last_seen - received < STALE_WINDOW
}

/// Last seen sequence number of one peer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SequenceTracker {
    last_seen: Option<u16>,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` until the first packet was accepted
    pub fn last_seen(&self) -> Option<u16> {
        self.last_seen
    }

    /// Record `seq_num` unless it is stale. Returns whether it was accepted.
    pub fn accept(&mut self, seq_num: u16) -> bool {
        if let Some(last_seen) = self.last_seen {
            if is_stale(seq_num, last_seen) {
                return false;
            }
        }
        self.last_seen = Some(seq_num);
        true
    }
}
