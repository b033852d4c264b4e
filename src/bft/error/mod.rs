//! Error related business logic of `tessera`.
//!
//! Protocol violations carry enough context to be logged usefully, but a
//! violating message is only ever discarded; the sender is not penalized
//! beyond the error channel.

use thiserror::Error;

use crate::bft::communication::NodeId;
use crate::bft::consensus::Stage;
use crate::bft::ordering::{SeqNo, ViewId};

/// Wrapper result type for `std::result::Result`.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type used throughout this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// A consensus message arrived in a stage where it cannot be applied.
    #[error("message for sequence {seq} arrived in stage {current:?}")]
    WrongStage { seq: SeqNo, current: Stage },

    /// A consensus message pertains to a view other than the current one.
    #[error("wrong view: message for view {got}, replica in view {expected}")]
    WrongView { got: ViewId, expected: ViewId },

    /// The digest inside a message does not match the request it names.
    #[error("digest mismatch for sequence {seq}")]
    WrongDigest { seq: SeqNo },

    /// The sequence number falls outside the watermark window.
    #[error("sequence {seq} outside watermark window ({low}, {high}]")]
    BadSequenceNumber { seq: SeqNo, low: SeqNo, high: SeqNo },

    /// Two divergent votes, or a divergent pre-prepare, from one origin.
    #[error("equivocation by {voter} on sequence {seq}")]
    Equivocation { voter: NodeId, seq: SeqNo },

    /// A pre-prepare whose origin is not the primary of its view.
    #[error("pre-prepare from {got}, but the primary of view {view} is {expected}")]
    WrongOrigin { view: ViewId, expected: NodeId, got: NodeId },

    /// No consensus state exists yet for the sequence number.
    #[error("state for sequence number {seq} has not been created yet")]
    UnknownState { seq: SeqNo },

    /// A view-change message failed structural validation.
    #[error("invalid view change message: {0}")]
    InvalidViewChange(&'static str),

    /// A new-view message failed validation against its proofs.
    #[error("invalid new view message: {0}")]
    InvalidNewView(&'static str),

    /// Signature verification or key handling failed.
    #[error("cryptographic failure: {0}")]
    Crypto(&'static str),

    /// A wire payload could not be encoded or decoded.
    #[error("codec failure: {0}")]
    Codec(#[from] serde_json::Error),

    /// Outbound delivery failed. Not retried by the core.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The consensus deadline elapsed before the sequence committed.
    #[error("consensus deadline elapsed for sequence {seq}")]
    Timeout { seq: SeqNo },

    /// A request a backup observed was not executed before the
    /// deadline. No sequence number exists on the backup side, so the
    /// request is identified by its client and timestamp.
    #[error("request from {client_id} at {timestamp} missed the consensus deadline")]
    RequestTimeout { client_id: String, timestamp: i64 },

    /// Unrecoverable startup failure.
    #[error("replica bootstrap failed: {0}")]
    Bootstrap(String),
}

impl Error {
    /// Whether this error records a peer violating the protocol, as
    /// opposed to a local or environmental failure.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Error::WrongStage { .. }
                | Error::WrongView { .. }
                | Error::WrongDigest { .. }
                | Error::BadSequenceNumber { .. }
                | Error::Equivocation { .. }
                | Error::WrongOrigin { .. }
                | Error::InvalidViewChange(_)
                | Error::InvalidNewView(_)
        )
    }
}
