//! User application execution business logic.
//!
//! Committed requests may surface out of sequence order; the
//! [`ExecutionQueue`] buffers them until the gap to the last executed
//! sequence closes, so the [`Service`] only ever observes requests in
//! strict order.

use crate::bft::communication::message::{ReplyMessage, RequestMessage};
use crate::bft::ordering::SeqNo;

use std::collections::HashMap;

/// A user defined service, executed once per committed request, in
/// sequence number order.
pub trait Service: Send + 'static {
    /// Process one request, producing the reply payload.
    fn execute(&mut self, request: &RequestMessage) -> String;
}

/// The reference service: acknowledges every operation.
pub struct AckService;

impl Service for AckService {
    fn execute(&mut self, _request: &RequestMessage) -> String {
        "Executed".into()
    }
}

/// Buffers committed `(reply, request)` pairs by sequence number until
/// they become contiguous with the executed prefix.
pub struct ExecutionQueue {
    pairs: HashMap<SeqNo, (ReplyMessage, RequestMessage)>,
}

impl ExecutionQueue {
    pub fn new() -> Self {
        ExecutionQueue {
            pairs: HashMap::new(),
        }
    }

    /// Queues a committed pair. A pair already buffered for the same
    /// sequence is kept; commit produces one pair per sequence, so a
    /// second insert can only be a replay.
    pub fn insert(&mut self, reply: ReplyMessage, request: RequestMessage) {
        self.pairs.entry(request.sequence_id).or_insert((reply, request));
    }

    /// Removes and returns the pairs forming a contiguous run starting
    /// right after `last_executed`, in sequence order.
    pub fn drain_contiguous(
        &mut self,
        last_executed: SeqNo,
    ) -> Vec<(ReplyMessage, RequestMessage)> {
        let mut run = Vec::new();
        let mut next = last_executed.next();
        while let Some(pair) = self.pairs.remove(&next) {
            run.push(pair);
            next = next.next();
        }
        run
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

impl Default for ExecutionQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bft::communication::NodeId;
    use crate::bft::ordering::ViewId;

    fn pair(seq: u64) -> (ReplyMessage, RequestMessage) {
        let mut request = RequestMessage::new(seq as i64, "Client1", "Op1", "A");
        request.sequence_id = SeqNo::from(seq);
        let reply = ReplyMessage {
            view_id: ViewId::from(0),
            timestamp: request.timestamp,
            client_id: request.client_id.clone(),
            executor_node_id: NodeId::from("Node1"),
            result: String::new(),
        };
        (reply, request)
    }

    #[test]
    fn holds_gapped_pairs_until_contiguous() {
        let mut queue = ExecutionQueue::new();

        let (r3, c3) = pair(3);
        queue.insert(r3, c3);
        assert!(queue.drain_contiguous(SeqNo::from(1)).is_empty());
        assert_eq!(queue.len(), 1);

        let (r2, c2) = pair(2);
        queue.insert(r2, c2);
        let run = queue.drain_contiguous(SeqNo::from(1));
        let seqs: Vec<u64> = run.iter().map(|(_, c)| c.sequence_id.into()).collect();
        assert_eq!(seqs, vec![2, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn replayed_commit_does_not_duplicate() {
        let mut queue = ExecutionQueue::new();
        let (r1, c1) = pair(1);
        queue.insert(r1, c1);
        let (r1, c1) = pair(1);
        queue.insert(r1, c1);

        assert_eq!(queue.drain_contiguous(SeqNo::ZERO).len(), 1);
        assert!(queue.drain_contiguous(SeqNo::from(1)).is_empty());
    }

    #[test]
    fn ack_service_acknowledges() {
        let mut service = AckService;
        let (_, request) = pair(1);
        assert_eq!(service.execute(&request), "Executed");
    }
}
