//! The view-change and new-view sub-protocol.
//!
//! When the primary is suspected faulty, replicas broadcast view-change
//! messages carrying proofs of every sequence they prepared. The
//! primary of the next view collects a `2f + 1` certificate, re-issues
//! pre-prepares for the unfinished window and announces the new view;
//! backups verify the announcement against the certificate before
//! installing it.

use std::collections::{HashMap, HashSet};

use crate::bft::communication::message::{
    NewViewMessage,
    PrePrepareMessage,
    PreparedProof,
    RequestMessage,
    ViewChangeMessage,
    VoteKind,
};
use crate::bft::communication::{NodeId, SystemParams};
use crate::bft::error::*;
use crate::bft::ordering::{SeqNo, ViewId};

/// Tracks view-change certificates per prospective view.
pub struct Synchronizer {
    node_id: NodeId,
    params: SystemParams,
    // key: next view, value: view-change messages by origin
    vc_states: HashMap<ViewId, HashMap<NodeId, ViewChangeMessage>>,
    // views whose certificate was already handed out
    taken: HashSet<ViewId>,
}

impl Synchronizer {
    pub fn new(node_id: NodeId, params: SystemParams) -> Self {
        Synchronizer {
            node_id,
            params,
            vc_states: HashMap::new(),
            taken: HashSet::new(),
        }
    }

    /// Builds this node's view-change vote for `next_view`, with one
    /// prepared proof per sequence above the stable checkpoint.
    pub fn build_view_change(
        &self,
        next_view: ViewId,
        stable_checkpoint: SeqNo,
        set_p: HashMap<SeqNo, PreparedProof>,
    ) -> ViewChangeMessage {
        ViewChangeMessage {
            origin_node_id: self.node_id.clone(),
            next_view_id: next_view,
            stable_checkpoint,
            set_p,
        }
    }

    /// Structural validation of a view-change message: every proof must
    /// tie a pre-prepare to `2f` matching prepares from distinct voters.
    pub fn validate_view_change(&self, message: &ViewChangeMessage) -> Result<()> {
        for (seq, proof) in &message.set_p {
            let pre_prepare = &proof.pre_prepare;
            if *seq != pre_prepare.sequence_id {
                return Err(Error::InvalidViewChange("proof filed under wrong sequence"));
            }
            if *seq <= message.stable_checkpoint {
                return Err(Error::InvalidViewChange("proof at or below stable checkpoint"));
            }
            if pre_prepare.request_msg.digest()? != pre_prepare.digest
                || pre_prepare.request_msg.sequence_id != pre_prepare.sequence_id
            {
                return Err(Error::InvalidViewChange("proof pre-prepare digest mismatch"));
            }
            if proof.prepares.len() < self.params.prepare_quorum() {
                return Err(Error::InvalidViewChange("not enough prepares in proof"));
            }
            for (voter, prepare) in &proof.prepares {
                if *voter != prepare.voter_node_id {
                    return Err(Error::InvalidViewChange("prepare filed under wrong voter"));
                }
                if prepare.kind != VoteKind::Prepare
                    || prepare.view_id != pre_prepare.view_id
                    || prepare.sequence_id != pre_prepare.sequence_id
                    || prepare.digest != pre_prepare.digest
                {
                    return Err(Error::InvalidViewChange("prepare does not match pre-prepare"));
                }
            }
        }
        Ok(())
    }

    /// Records a validated view-change message, returning the number of
    /// distinct origins collected for its view so far.
    pub fn receive(&mut self, message: ViewChangeMessage) -> Result<usize> {
        self.validate_view_change(&message)?;
        let votes = self.vc_states.entry(message.next_view_id).or_default();
        votes.insert(message.origin_node_id.clone(), message);
        Ok(votes.len())
    }

    /// Hands out the `2f + 1` certificate for `next_view`, at most once.
    pub fn certificate(&mut self, next_view: ViewId) -> Option<HashMap<NodeId, ViewChangeMessage>> {
        if self.taken.contains(&next_view) {
            return None;
        }
        let votes = self.vc_states.get(&next_view)?;
        if votes.len() < self.params.commit_quorum() {
            return None;
        }
        self.taken.insert(next_view);
        Some(votes.clone())
    }

    /// Synthesizes the new-view announcement from a certificate `V`.
    ///
    /// `min_s` is the highest stable checkpoint claimed in `V`; for each
    /// sequence up to the highest prepared one, the pre-prepare is
    /// re-issued under `next_view` with the original request digest, or
    /// as a null operation where no proof exists.
    pub fn synthesize_new_view(
        origin: &NodeId,
        next_view: ViewId,
        view_changes: &HashMap<NodeId, ViewChangeMessage>,
    ) -> Result<NewViewMessage> {
        let min_s = view_changes
            .values()
            .map(|vc| vc.stable_checkpoint)
            .max()
            .unwrap_or(SeqNo::ZERO);
        let max_s = view_changes
            .values()
            .flat_map(|vc| vc.set_p.keys().copied())
            .max()
            .unwrap_or(min_s)
            .max(min_s);

        let mut pre_prepares = Vec::new();
        let mut seq = min_s;
        while seq < max_s {
            seq = seq.next();
            let pre_prepare = match Self::select_proof(view_changes, seq) {
                Some(proof) => PrePrepareMessage {
                    view_id: next_view,
                    sequence_id: seq,
                    request_msg: proof.pre_prepare.request_msg.clone(),
                    digest: proof.pre_prepare.digest,
                    epoch_id: 0,
                    origin_node_id: origin.clone(),
                },
                None => {
                    let request = RequestMessage::null(seq);
                    let digest = request.digest()?;
                    PrePrepareMessage {
                        view_id: next_view,
                        sequence_id: seq,
                        request_msg: request,
                        digest,
                        epoch_id: 0,
                        origin_node_id: origin.clone(),
                    }
                }
            };
            pre_prepares.push(pre_prepare);
        }

        Ok(NewViewMessage {
            origin_node_id: origin.clone(),
            next_view_id: next_view,
            view_changes: view_changes.clone(),
            pre_prepares,
            min_s,
        })
    }

    /// Picks the proof for `seq` deterministically across replicas: the
    /// one prepared in the highest view, ties broken by origin id.
    fn select_proof(
        view_changes: &HashMap<NodeId, ViewChangeMessage>,
        seq: SeqNo,
    ) -> Option<&PreparedProof> {
        let mut best: Option<(&NodeId, &PreparedProof)> = None;
        for (origin, vc) in view_changes {
            let Some(proof) = vc.set_p.get(&seq) else {
                continue;
            };
            best = match best {
                None => Some((origin, proof)),
                Some((best_origin, best_proof)) => {
                    let candidate = (proof.pre_prepare.view_id, std::cmp::Reverse(origin));
                    let current = (
                        best_proof.pre_prepare.view_id,
                        std::cmp::Reverse(best_origin),
                    );
                    if candidate > current {
                        Some((origin, proof))
                    } else {
                        Some((best_origin, best_proof))
                    }
                }
            };
        }
        best.map(|(_, proof)| proof)
    }

    /// Verifies a new-view announcement against its own certificate.
    pub fn validate_new_view(
        &self,
        message: &NewViewMessage,
        expected_primary: &NodeId,
    ) -> Result<()> {
        if message.origin_node_id != *expected_primary {
            return Err(Error::InvalidNewView("not from the primary of the next view"));
        }
        if message.view_changes.len() < self.params.commit_quorum() {
            return Err(Error::InvalidNewView("certificate smaller than 2f + 1"));
        }
        for (origin, vc) in &message.view_changes {
            if *origin != vc.origin_node_id {
                return Err(Error::InvalidNewView("certificate entry filed under wrong origin"));
            }
            if vc.next_view_id != message.next_view_id {
                return Err(Error::InvalidNewView("certificate entry for another view"));
            }
            self.validate_view_change(vc)?;
        }

        let expected = Self::synthesize_new_view(
            &message.origin_node_id,
            message.next_view_id,
            &message.view_changes,
        )?;
        if expected.min_s != message.min_s || expected.pre_prepares != message.pre_prepares {
            return Err(Error::InvalidNewView("re-issued pre-prepares inconsistent with certificate"));
        }
        Ok(())
    }

    /// Drops certificates for views at or below the installed one.
    pub fn gc(&mut self, installed: ViewId) {
        self.vc_states.retain(|view, _| *view > installed);
        self.taken.retain(|view| *view > installed);
    }
}
