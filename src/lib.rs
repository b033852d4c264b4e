//! `tessera` is the core of a Practical Byzantine Fault Tolerant (PBFT)
//! replica: a single node of a fixed-membership replicated state machine
//! tolerating up to `f` Byzantine failures among `n = 3f + 1` replicas.
//!
//! The crate covers the per-sequence consensus state machine, the replica
//! orchestrator that drives it concurrently, checkpoint based garbage
//! collection, and the view-change/new-view protocols. Transports, key
//! file formats and process bootstrap are left to the embedding
//! application, which talks to the replica through the
//! [`bft::communication::Transport`] trait and the replica's inbound
//! endpoint.

pub mod bft;
