//! Peer transport contract and the transient voting messages.
//!
//! Wire framing lives outside this crate. Callers bound every call with
//! `tokio::time::timeout`; implementations are free to block on slow peers.

use crate::crypto::{Hash, KeyPair};
use crate::error::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// Answer to a candidate status query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteMsg {
    pub tcp_address: String,
    pub agree: bool,
    pub update_time: i64,
    pub sign: Vec<u8>,
}

impl VoteMsg {
    pub fn signing_payload(&self) -> Vec<u8> {
        format!("{},{},{}", self.tcp_address, self.agree, self.update_time).into_bytes()
    }

    pub fn sign_with(&mut self, keypair: &KeyPair) -> Result<()> {
        self.sign = keypair.sign(&self.signing_payload())?.to_vec();
        Ok(())
    }
}

/// One peer's entry in a consolidated voting round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerVote {
    pub candidate_id: u64,
    pub tcp_address: String,
    pub agree: bool,
}

/// Consolidated result of a voting round, signed by the broadcaster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VotingTotal {
    pub votes: Vec<PeerVote>,
    pub agree_quantity: u64,
    pub local_address: String,
    /// Hex-encoded public key of the broadcaster.
    pub local_pub_key: String,
    pub update_time: i64,
    pub sign: Vec<u8>,
}

impl VotingTotal {
    pub fn signing_payload(&self) -> Vec<u8> {
        let mut payload = String::new();
        for vote in &self.votes {
            payload.push_str(&format!(
                "{}:{}:{};",
                vote.candidate_id, vote.tcp_address, vote.agree
            ));
        }
        payload.push_str(&format!(
            "{},{},{},{}",
            self.agree_quantity, self.local_address, self.local_pub_key, self.update_time
        ));
        payload.into_bytes()
    }

    pub fn sign_with(&mut self, keypair: &KeyPair) -> Result<()> {
        self.sign = keypair.sign(&self.signing_payload())?.to_vec();
        Ok(())
    }
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Highest block id the peer holds.
    async fn query_max_block_id(&self, addr: &str) -> Result<u64>;

    /// Raw block bodies starting at `from_id`, ascending or, with `reverse`,
    /// descending. At most `count` items.
    async fn stream_block_bodies(
        &self,
        addr: &str,
        from_id: u64,
        count: u32,
        reverse: bool,
    ) -> Result<BoxStream<'static, Result<Vec<u8>>>>;

    async fn broadcast_block_and_tx_hashes(
        &self,
        addrs: &[String],
        block: &[u8],
        tx_hashes: &[Hash],
    ) -> Result<()>;

    async fn send_status_query(&self, addr: &str) -> Result<VoteMsg>;

    async fn send_voting_total(&self, addr: &str, total: &VotingTotal) -> Result<()>;

    /// The peer's hash for `block_id`, `None` if it does not have the block.
    async fn query_block_hash(&self, addr: &str, block_id: u64) -> Result<Option<Hash>>;
}
