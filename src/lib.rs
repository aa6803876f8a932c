//! KernelChain - consensus and chain synchronization core of a blockchain node
//!
//! # Architecture
//!
//! The crate is organized into logical modules:
//!
//! ## Chain Data
//! - [`block`] - Block structure, hashing and the wire codec
//! - [`persistence`] - Storage contract with SQLite and in-memory backends
//! - [`state`] - Guarded chain access and the global chain lock
//!
//! ## Consensus
//! - [`role`] - Honor-node vs candidate-node mode resolution
//! - [`cadence`] - Honor-node slot arithmetic
//! - [`leader`] - Deterministic candidate leader selection
//! - [`voting`] - Candidate liveness voting
//! - [`generator`] - Block production
//!
//! ## Synchronization
//! - [`sync`] - Block download and apply
//! - [`fork`] - Fork detection and repair
//! - [`confirmation`] - Peer agreement on recent block hashes
//! - [`ban`] - Host ban list
//!
//! ## Collaborators
//! - [`transport`] - Peer transport contract and voting messages
//! - [`pipeline`] - Transaction execution contract
//! - [`crypto`] - Signatures and verification (secp256k1)
//!
//! ## Runtime & Utilities
//! - [`daemon`] - Periodic job scheduler
//! - [`node`] - Node assembly
//! - [`config`] - Configuration management
//! - [`error`] - Error types

#![forbid(unsafe_code)]

// ============================================================================
// Chain Data
// ============================================================================
pub mod block;
pub mod persistence;
pub mod state;

// ============================================================================
// Consensus
// ============================================================================
pub mod cadence;
pub mod generator;
pub mod leader;
pub mod role;
pub mod voting;

// ============================================================================
// Synchronization
// ============================================================================
pub mod ban;
pub mod confirmation;
pub mod fork;
pub mod sync;

// ============================================================================
// Collaborators
// ============================================================================
pub mod crypto;
pub mod pipeline;
pub mod transport;

// ============================================================================
// Runtime & Utilities
// ============================================================================
pub mod config;
pub mod daemon;
pub mod error;
pub mod node;

pub use error::{ChainError, Result};
pub use node::{Collaborators, Node};
