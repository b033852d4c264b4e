//! Checkpoint votes and the stable low-water mark that bounds the
//! replica's memory.

use std::collections::HashMap;

use crate::bft::communication::message::CheckPointMessage;
use crate::bft::communication::{NodeId, SystemParams};
use crate::bft::ordering::SeqNo;

/// Checkpoint period.
///
/// Every `PERIOD` executed requests the replica emits a checkpoint vote;
/// once a checkpoint stabilizes, state and logs below it are discarded.
pub const PERIOD: u64 = 5;

/// Saved checkpoint votes, keyed by sequence number and then by origin.
pub struct CheckpointLog {
    votes: HashMap<SeqNo, HashMap<NodeId, CheckPointMessage>>,
    stable: SeqNo,
}

impl CheckpointLog {
    pub fn new() -> Self {
        CheckpointLog {
            votes: HashMap::new(),
            stable: SeqNo::ZERO,
        }
    }

    /// The stable checkpoint that `2f + 1` nodes agreed on.
    pub fn stable_checkpoint(&self) -> SeqNo {
        self.stable
    }

    /// Records one checkpoint vote.
    ///
    /// Returns the new stable checkpoint when this vote stabilizes it:
    /// `2f + 1` distinct origins, ours among them, for a sequence above
    /// the current mark. The caller is responsible for purging its own
    /// per-sequence state below the returned mark.
    pub fn insert(
        &mut self,
        message: CheckPointMessage,
        params: SystemParams,
        own_id: &NodeId,
    ) -> Option<SeqNo> {
        let seq = message.sequence_id;
        if seq <= self.stable {
            return None;
        }

        let votes = self.votes.entry(seq).or_default();
        votes.insert(message.origin_node_id.clone(), message);

        if votes.len() >= params.commit_quorum() && votes.contains_key(own_id) {
            self.stable = seq;
            self.gc();
            return Some(seq);
        }
        None
    }

    /// Drops checkpoint votes below the stable mark. The stabilized
    /// certificate itself is retained.
    fn gc(&mut self) {
        let stable = self.stable;
        self.votes.retain(|seq, _| *seq >= stable);
    }

    /// Number of sequences with recorded votes, the stable one included.
    pub fn len(&self) -> usize {
        self.votes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.votes.is_empty()
    }
}

impl Default for CheckpointLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bft::crypto::hash::Digest;

    fn params() -> SystemParams {
        SystemParams::new(4).unwrap()
    }

    fn vote(seq: u64, origin: &str) -> CheckPointMessage {
        CheckPointMessage {
            sequence_id: SeqNo::from(seq),
            digest: Digest::compute(format!("state@{}", seq).as_bytes()),
            origin_node_id: NodeId::from(origin),
        }
    }

    #[test]
    fn stabilizes_at_quorum_including_self() {
        let mut log = CheckpointLog::new();
        let me = NodeId::from("Node1");

        assert!(log.insert(vote(5, "Node2"), params(), &me).is_none());
        assert!(log.insert(vote(5, "Node3"), params(), &me).is_none());
        // a third distinct origin, but ours is missing
        assert!(log.insert(vote(5, "Node4"), params(), &me).is_none());
        // our own vote completes the certificate
        assert_eq!(
            log.insert(vote(5, "Node1"), params(), &me),
            Some(SeqNo::from(5))
        );
        assert_eq!(log.stable_checkpoint(), SeqNo::from(5));
    }

    #[test]
    fn duplicate_origins_do_not_count_twice() {
        let mut log = CheckpointLog::new();
        let me = NodeId::from("Node1");

        log.insert(vote(5, "Node1"), params(), &me);
        log.insert(vote(5, "Node2"), params(), &me);
        assert!(log.insert(vote(5, "Node2"), params(), &me).is_none());
        assert_eq!(log.stable_checkpoint(), SeqNo::ZERO);
    }

    #[test]
    fn stable_mark_is_non_decreasing_and_gc_runs() {
        let mut log = CheckpointLog::new();
        let me = NodeId::from("Node1");

        for origin in ["Node1", "Node2", "Node3"] {
            log.insert(vote(10, origin), params(), &me);
        }
        assert_eq!(log.stable_checkpoint(), SeqNo::from(10));

        // votes below the mark are dropped on arrival
        assert!(log.insert(vote(5, "Node2"), params(), &me).is_none());
        assert!(log.insert(vote(5, "Node3"), params(), &me).is_none());
        assert!(log.insert(vote(5, "Node1"), params(), &me).is_none());
        assert_eq!(log.stable_checkpoint(), SeqNo::from(10));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn earlier_votes_are_purged_on_stabilization() {
        let mut log = CheckpointLog::new();
        let me = NodeId::from("Node1");

        log.insert(vote(5, "Node2"), params(), &me);
        for origin in ["Node1", "Node2", "Node3"] {
            log.insert(vote(10, origin), params(), &me);
        }
        assert_eq!(log.len(), 1);
        assert_eq!(log.stable_checkpoint(), SeqNo::from(10));
    }
}
