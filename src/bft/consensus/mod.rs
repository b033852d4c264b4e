//! The per-sequence consensus state machine: pre-prepare, prepare and
//! commit with vote tallies and quorum checks.
//!
//! One [`State`] tracks one sequence number. The replica drives it
//! through the [`ConsensusEngine`] interface from the state's own task,
//! so stage transitions are serialized; view-change replay reuses the
//! same entry points.

use std::collections::HashMap;

use crate::bft::communication::message::{
    PrePrepareMessage,
    PreparedProof,
    ReplyMessage,
    RequestMessage,
    VoteKind,
    VoteMessage,
};
use crate::bft::communication::{NodeId, ViewInfo};
use crate::bft::crypto::hash::Digest;
use crate::bft::error::*;
use crate::bft::ordering::{SeqNo, WINDOW};

/// The stage a consensus instance is in. Transitions are monotonic.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum Stage {
    /// No proposal accepted yet.
    Idle,
    /// A pre-prepare was accepted or issued.
    PrePrepared,
    /// `2f` matching prepares collected on top of the pre-prepare.
    Prepared,
    /// `2f + 1` matching commits collected, self inclusive.
    Committed,
    /// The operation was executed and its reply broadcast.
    Replied,
}

/// Operations every per-sequence consensus engine exposes.
///
/// Normal operation and new-view seeding drive instances through this
/// same interface.
pub trait ConsensusEngine {
    /// Primary only: bind `request` to `seq` and produce the
    /// pre-prepare to broadcast.
    fn start_consensus(&mut self, request: RequestMessage, seq: SeqNo) -> Result<PrePrepareMessage>;

    /// Backup: accept the primary's proposal, producing our prepare
    /// vote for broadcast.
    fn pre_prepare(&mut self, message: PrePrepareMessage) -> Result<VoteMessage>;

    /// Record a prepare vote. Produces our commit vote once the prepare
    /// quorum is reached.
    fn prepare(&mut self, vote: VoteMessage) -> Result<Option<VoteMessage>>;

    /// Record a commit vote. Produces the pending reply and the
    /// committed request once the commit quorum is reached.
    fn commit(&mut self, vote: VoteMessage) -> Result<Option<(ReplyMessage, RequestMessage)>>;

    /// Install a pre-prepare without emitting a vote. Used by the
    /// primary for its own proposals, including re-issued ones.
    fn install_pre_prepare(&mut self, message: PrePrepareMessage);

    fn sequence_number(&self) -> SeqNo;
    fn stage(&self) -> Stage;
    fn digest(&self) -> Option<Digest>;

    /// Evidence that this instance reached `PREPARED`, for view-change
    /// messages.
    fn prepared_proof(&self) -> Option<PreparedProof>;

    /// Marks the reply for this sequence as broadcast.
    fn mark_replied(&mut self);
}

/// Consensus state for a single sequence number.
pub struct State {
    view: ViewInfo,
    node_id: NodeId,
    primary_id: NodeId,
    low_water_mark: SeqNo,
    seq: SeqNo,
    stage: Stage,
    digest: Option<Digest>,
    request: Option<RequestMessage>,
    pre_prepare: Option<PrePrepareMessage>,
    prepare_votes: HashMap<NodeId, VoteMessage>,
    commit_votes: HashMap<NodeId, VoteMessage>,
}

impl State {
    /// Creates the state for one sequence within `view`.
    ///
    /// `low_water_mark` is the stable checkpoint at creation time; the
    /// accepted sequence window is `(h, h + WINDOW]` above it.
    pub fn new(view: ViewInfo, node_id: NodeId, primary_id: NodeId, low_water_mark: SeqNo) -> Self {
        State {
            view,
            node_id,
            primary_id,
            low_water_mark,
            seq: SeqNo::ZERO,
            stage: Stage::Idle,
            digest: None,
            request: None,
            pre_prepare: None,
            prepare_votes: HashMap::new(),
            commit_votes: HashMap::new(),
        }
    }

    fn vote(&self, kind: VoteKind, digest: Digest) -> VoteMessage {
        VoteMessage {
            view_id: self.view.id(),
            sequence_id: self.seq,
            digest,
            voter_node_id: self.node_id.clone(),
            kind,
        }
    }

    /// Shared vote bookkeeping. Divergent digests and divergent
    /// duplicates are rejected as equivocation; identical duplicates
    /// are absorbed.
    fn record_vote(&mut self, vote: VoteMessage) -> Result<()> {
        if vote.view_id != self.view.id() {
            return Err(Error::WrongView {
                got: vote.view_id,
                expected: self.view.id(),
            });
        }
        match self.digest {
            Some(digest) if vote.digest == digest && vote.sequence_id == self.seq => (),
            _ => {
                return Err(Error::Equivocation {
                    voter: vote.voter_node_id,
                    seq: vote.sequence_id,
                })
            }
        }

        let votes = match vote.kind {
            VoteKind::Prepare => &mut self.prepare_votes,
            VoteKind::Commit => &mut self.commit_votes,
        };
        match votes.get(&vote.voter_node_id) {
            Some(existing) if *existing == vote => Ok(()),
            Some(_) => Err(Error::Equivocation {
                voter: vote.voter_node_id,
                seq: vote.sequence_id,
            }),
            None => {
                votes.insert(vote.voter_node_id.clone(), vote);
                Ok(())
            }
        }
    }
}

impl ConsensusEngine for State {
    fn start_consensus(&mut self, mut request: RequestMessage, seq: SeqNo) -> Result<PrePrepareMessage> {
        if self.stage != Stage::Idle {
            return Err(Error::WrongStage {
                seq: self.seq,
                current: self.stage,
            });
        }

        request.sequence_id = seq;
        let digest = request.digest()?;
        let message = PrePrepareMessage {
            view_id: self.view.id(),
            sequence_id: seq,
            request_msg: request,
            digest,
            epoch_id: 0,
            origin_node_id: self.node_id.clone(),
        };
        self.install_pre_prepare(message.clone());
        Ok(message)
    }

    fn pre_prepare(&mut self, message: PrePrepareMessage) -> Result<VoteMessage> {
        if self.stage != Stage::Idle {
            return Err(Error::WrongStage {
                seq: self.seq,
                current: self.stage,
            });
        }
        if message.view_id != self.view.id() {
            return Err(Error::WrongView {
                got: message.view_id,
                expected: self.view.id(),
            });
        }
        if message.origin_node_id != self.primary_id {
            return Err(Error::WrongOrigin {
                view: message.view_id,
                expected: self.primary_id.clone(),
                got: message.origin_node_id,
            });
        }
        if message.request_msg.digest()? != message.digest
            || message.request_msg.sequence_id != message.sequence_id
        {
            return Err(Error::WrongDigest {
                seq: message.sequence_id,
            });
        }
        if message.sequence_id.index(self.low_water_mark).is_left() {
            return Err(Error::BadSequenceNumber {
                seq: message.sequence_id,
                low: self.low_water_mark,
                high: SeqNo::from(u64::from(self.low_water_mark) + WINDOW),
            });
        }

        let digest = message.digest;
        self.install_pre_prepare(message);
        Ok(self.vote(VoteKind::Prepare, digest))
    }

    fn prepare(&mut self, vote: VoteMessage) -> Result<Option<VoteMessage>> {
        if self.stage == Stage::Idle {
            return Err(Error::WrongStage {
                seq: vote.sequence_id,
                current: self.stage,
            });
        }
        self.record_vote(vote)?;

        // late prepares are absorbed without re-emitting our commit
        if self.stage != Stage::PrePrepared {
            return Ok(None);
        }
        if self.prepare_votes.len() >= self.view.params().prepare_quorum() {
            // the pre-prepare is present whenever the digest is fixed
            if let Some(digest) = self.digest {
                self.stage = Stage::Prepared;
                return Ok(Some(self.vote(VoteKind::Commit, digest)));
            }
        }
        Ok(None)
    }

    fn commit(&mut self, vote: VoteMessage) -> Result<Option<(ReplyMessage, RequestMessage)>> {
        if self.stage == Stage::Idle {
            return Err(Error::WrongStage {
                seq: vote.sequence_id,
                current: self.stage,
            });
        }
        self.record_vote(vote)?;

        if self.stage != Stage::Prepared {
            return Ok(None);
        }
        if self.commit_votes.len() >= self.view.params().commit_quorum() {
            self.stage = Stage::Committed;
            // the request was set together with the pre-prepare
            let request = self.request.clone().ok_or(Error::WrongStage {
                seq: self.seq,
                current: self.stage,
            })?;
            let reply = ReplyMessage {
                view_id: self.view.id(),
                timestamp: request.timestamp,
                client_id: request.client_id.clone(),
                executor_node_id: self.node_id.clone(),
                // filled by the execution layer
                result: String::new(),
            };
            return Ok(Some((reply, request)));
        }
        Ok(None)
    }

    fn install_pre_prepare(&mut self, message: PrePrepareMessage) {
        // stage transitions are monotonic; an instance that advanced
        // past IDLE keeps its accepted proposal
        if self.stage != Stage::Idle {
            return;
        }
        self.seq = message.sequence_id;
        self.digest = Some(message.digest);
        self.request = Some(message.request_msg.clone());
        self.pre_prepare = Some(message);
        self.stage = Stage::PrePrepared;
    }

    fn sequence_number(&self) -> SeqNo {
        self.seq
    }

    fn stage(&self) -> Stage {
        self.stage
    }

    fn digest(&self) -> Option<Digest> {
        self.digest
    }

    fn prepared_proof(&self) -> Option<PreparedProof> {
        if self.stage < Stage::Prepared {
            return None;
        }
        let pre_prepare = self.pre_prepare.clone()?;
        Some(PreparedProof {
            pre_prepare,
            prepares: self.prepare_votes.clone(),
        })
    }

    fn mark_replied(&mut self) {
        if self.stage == Stage::Committed {
            self.stage = Stage::Replied;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bft::communication::SystemParams;
    use crate::bft::ordering::ViewId;

    fn view() -> ViewInfo {
        ViewInfo::new(ViewId::from(0), SystemParams::new(4).unwrap())
    }

    fn node(i: usize) -> NodeId {
        NodeId::from(format!("Node{}", i))
    }

    fn request() -> RequestMessage {
        RequestMessage::new(42, "Client1", "Op1", "A")
    }

    fn primary_state() -> State {
        State::new(view(), node(1), node(1), SeqNo::ZERO)
    }

    fn backup_state(i: usize) -> State {
        State::new(view(), node(i), node(1), SeqNo::ZERO)
    }

    fn vote_from(i: usize, template: &VoteMessage) -> VoteMessage {
        let mut vote = template.clone();
        vote.voter_node_id = node(i);
        vote
    }

    #[test]
    fn start_consensus_assigns_sequence_and_pre_prepares() {
        let mut state = primary_state();
        let ppm = state.start_consensus(request(), SeqNo::from(1)).unwrap();

        assert_eq!(ppm.sequence_id, SeqNo::from(1));
        assert_eq!(ppm.request_msg.sequence_id, SeqNo::from(1));
        assert_eq!(ppm.digest, ppm.request_msg.digest().unwrap());
        assert_eq!(state.stage(), Stage::PrePrepared);

        // a second proposal on the same state is a stage violation
        assert!(matches!(
            state.start_consensus(request(), SeqNo::from(2)),
            Err(Error::WrongStage { .. })
        ));
    }

    #[test]
    fn backup_accepts_pre_prepare_and_votes() {
        let mut primary = primary_state();
        let ppm = primary.start_consensus(request(), SeqNo::from(1)).unwrap();

        let mut backup = backup_state(2);
        let prepare = backup.pre_prepare(ppm).unwrap();

        assert_eq!(prepare.kind, VoteKind::Prepare);
        assert_eq!(prepare.voter_node_id, node(2));
        assert_eq!(backup.stage(), Stage::PrePrepared);
    }

    #[test]
    fn pre_prepare_rejections() {
        let mut primary = primary_state();
        let ppm = primary.start_consensus(request(), SeqNo::from(1)).unwrap();

        // wrong view
        let mut backup = State::new(
            ViewInfo::new(ViewId::from(1), SystemParams::new(4).unwrap()),
            node(2),
            node(2),
            SeqNo::ZERO,
        );
        assert!(matches!(
            backup.pre_prepare(ppm.clone()),
            Err(Error::WrongView { .. })
        ));

        // not from the primary of the view
        let mut backup = State::new(view(), node(2), node(3), SeqNo::ZERO);
        assert!(matches!(
            backup.pre_prepare(ppm.clone()),
            Err(Error::WrongOrigin { .. })
        ));

        // tampered digest
        let mut tampered = ppm.clone();
        tampered.request_msg.data = "B".into();
        let mut backup = backup_state(2);
        assert!(matches!(
            backup.pre_prepare(tampered),
            Err(Error::WrongDigest { .. })
        ));

        // outside the watermark window
        let mut primary = primary_state();
        let far = primary
            .start_consensus(request(), SeqNo::from(WINDOW + 1))
            .unwrap();
        let mut backup = backup_state(2);
        assert!(matches!(
            backup.pre_prepare(far),
            Err(Error::BadSequenceNumber { .. })
        ));

        // wrong stage: a second pre-prepare on an advanced state
        let mut primary = primary_state();
        let ppm = primary.start_consensus(request(), SeqNo::from(1)).unwrap();
        let mut backup = backup_state(2);
        backup.pre_prepare(ppm.clone()).unwrap();
        assert!(matches!(
            backup.pre_prepare(ppm),
            Err(Error::WrongStage { .. })
        ));
    }

    #[test]
    fn prepare_quorum_emits_commit_once() {
        let mut primary = primary_state();
        let ppm = primary.start_consensus(request(), SeqNo::from(1)).unwrap();

        let mut backup = backup_state(2);
        let own_prepare = backup.pre_prepare(ppm).unwrap();

        // first prepare (own vote): no quorum yet with 2f = 2
        assert!(backup.prepare(own_prepare.clone()).unwrap().is_none());
        assert_eq!(backup.stage(), Stage::PrePrepared);

        // second distinct prepare completes the quorum
        let commit = backup
            .prepare(vote_from(3, &own_prepare))
            .unwrap()
            .expect("commit vote");
        assert_eq!(commit.kind, VoteKind::Commit);
        assert_eq!(backup.stage(), Stage::Prepared);

        // further prepares are recorded but do not re-emit
        assert!(backup.prepare(vote_from(4, &own_prepare)).unwrap().is_none());
        assert_eq!(backup.stage(), Stage::Prepared);
    }

    #[test]
    fn commit_quorum_produces_reply() {
        let mut primary = primary_state();
        let ppm = primary.start_consensus(request(), SeqNo::from(1)).unwrap();

        let mut backup = backup_state(2);
        let own_prepare = backup.pre_prepare(ppm).unwrap();
        backup.prepare(own_prepare.clone()).unwrap();
        let own_commit = backup
            .prepare(vote_from(3, &own_prepare))
            .unwrap()
            .unwrap();

        assert!(backup.commit(own_commit.clone()).unwrap().is_none());
        assert!(backup.commit(vote_from(3, &own_commit)).unwrap().is_none());

        let (reply, committed) = backup
            .commit(vote_from(4, &own_commit))
            .unwrap()
            .expect("reply pair");
        assert_eq!(backup.stage(), Stage::Committed);
        assert_eq!(reply.client_id, "Client1");
        assert_eq!(reply.timestamp, 42);
        assert_eq!(reply.result, "");
        assert_eq!(committed.sequence_id, SeqNo::from(1));

        // late commits are absorbed
        assert!(backup.commit(vote_from(1, &own_commit)).unwrap().is_none());
        assert_eq!(backup.stage(), Stage::Committed);
    }

    #[test]
    fn early_commits_count_once_prepared() {
        let mut primary = primary_state();
        let ppm = primary.start_consensus(request(), SeqNo::from(1)).unwrap();

        let mut backup = backup_state(2);
        let own_prepare = backup.pre_prepare(ppm).unwrap();

        // commits from faster peers arrive before our prepare quorum
        let template = VoteMessage {
            kind: VoteKind::Commit,
            ..own_prepare.clone()
        };
        assert!(backup.commit(vote_from(3, &template)).unwrap().is_none());
        assert!(backup.commit(vote_from(4, &template)).unwrap().is_none());

        backup.prepare(own_prepare.clone()).unwrap();
        let own_commit = backup
            .prepare(vote_from(3, &own_prepare))
            .unwrap()
            .unwrap();

        // our own commit completes the tally of three
        let pair = backup.commit(own_commit).unwrap();
        assert!(pair.is_some());
        assert_eq!(backup.stage(), Stage::Committed);
    }

    #[test]
    fn duplicate_votes_are_idempotent() {
        let mut primary = primary_state();
        let ppm = primary.start_consensus(request(), SeqNo::from(1)).unwrap();

        let mut backup = backup_state(2);
        let own_prepare = backup.pre_prepare(ppm).unwrap();
        backup.prepare(vote_from(3, &own_prepare)).unwrap();

        // the same vote again leaves the tally and stage unchanged
        backup.prepare(vote_from(3, &own_prepare)).unwrap();
        assert_eq!(backup.stage(), Stage::PrePrepared);
    }

    #[test]
    fn equivocation_never_advances_either_digest() {
        let mut primary = primary_state();
        let ppm = primary.start_consensus(request(), SeqNo::from(7)).unwrap();

        let mut backup = State::new(view(), node(2), node(1), SeqNo::ZERO);
        let own_prepare = backup.pre_prepare(ppm).unwrap();
        backup.prepare(own_prepare.clone()).unwrap();

        // same voter, same (view, seq), divergent digest
        let mut divergent = vote_from(3, &own_prepare);
        divergent.digest = Digest::compute(b"other proposal");
        assert!(matches!(
            backup.prepare(divergent),
            Err(Error::Equivocation { .. })
        ));
        assert_eq!(backup.stage(), Stage::PrePrepared);

        // divergent duplicate from a voter we already counted
        backup.prepare(vote_from(3, &own_prepare)).unwrap();
        let mut flipped = vote_from(3, &own_prepare);
        flipped.view_id = ViewId::from(0);
        flipped.digest = Digest::compute(b"third proposal");
        assert!(matches!(
            backup.prepare(flipped),
            Err(Error::Equivocation { .. })
        ));
    }

    #[test]
    fn prepared_proof_carries_quorum() {
        let mut primary = primary_state();
        let ppm = primary.start_consensus(request(), SeqNo::from(1)).unwrap();

        let mut backup = backup_state(2);
        let own_prepare = backup.pre_prepare(ppm).unwrap();
        assert!(backup.prepared_proof().is_none());

        backup.prepare(own_prepare.clone()).unwrap();
        backup.prepare(vote_from(3, &own_prepare)).unwrap();

        let proof = backup.prepared_proof().expect("prepared");
        assert_eq!(proof.prepares.len(), 2);
        assert_eq!(proof.pre_prepare.sequence_id, SeqNo::from(1));
    }
}
