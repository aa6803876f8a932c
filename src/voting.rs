//! Candidate liveness voting.
//!
//! Each round asks every registered candidate whether it is alive and
//! agreeing, verifies the signed answers, and broadcasts a signed tally. The
//! agreeing candidates' `reply_count` feeds leader selection.
//!
//! Votes and totals must carry an `update_time` inside the freshness window
//! and newer than the last one accepted from the same sender, so a signed
//! message cannot be credited twice.

use crate::crypto::{KeyPair, SignatureService};
use crate::daemon::{Job, JobContext};
use crate::error::{ChainError, Result};
use crate::persistence::CandidateNode;
use crate::role::{NodeMode, NodeRoleResolver};
use crate::state::ChainState;
use crate::transport::{PeerTransport, PeerVote, VoteMsg, VotingTotal};
use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, warn};

pub struct CandidateVotingCoordinator {
    state: Arc<ChainState>,
    roles: Arc<NodeRoleResolver>,
    transport: Arc<dyn PeerTransport>,
    signer: Arc<dyn SignatureService>,
    keypair: KeyPair,
    peer_timeout: Duration,
    max_age: Duration,
    /// Latest accepted vote time per candidate id.
    last_votes: Mutex<HashMap<u64, i64>>,
    /// Latest accepted total time per broadcaster key (lowercase hex).
    last_totals: Mutex<HashMap<String, i64>>,
}

impl CandidateVotingCoordinator {
    pub fn new(
        state: Arc<ChainState>,
        roles: Arc<NodeRoleResolver>,
        transport: Arc<dyn PeerTransport>,
        signer: Arc<dyn SignatureService>,
        keypair: KeyPair,
        peer_timeout: Duration,
        max_age: Duration,
    ) -> Self {
        Self {
            state,
            roles,
            transport,
            signer,
            keypair,
            peer_timeout,
            max_age,
            last_votes: Mutex::new(HashMap::new()),
            last_totals: Mutex::new(HashMap::new()),
        }
    }

    fn is_fresh(&self, update_time: i64, now: i64) -> bool {
        let max_age = self.max_age.as_secs() as i64;
        update_time >= now - max_age && update_time <= now + max_age
    }

    /// This node's signed answer to a status query.
    pub fn answer_status_query(&self) -> Result<VoteMsg> {
        let mut vote = VoteMsg {
            tcp_address: self.roles.tcp_address().to_string(),
            agree: self.state.head()?.is_some(),
            update_time: chrono::Utc::now().timestamp(),
            sign: Vec::new(),
        };
        vote.sign_with(&self.keypair)?;
        Ok(vote)
    }

    async fn collect_vote(&self, candidate: &CandidateNode, now: i64) -> PeerVote {
        let disagree = PeerVote {
            candidate_id: candidate.id,
            tcp_address: candidate.tcp_address.clone(),
            agree: false,
        };
        let vote = match timeout(
            self.peer_timeout,
            self.transport.send_status_query(&candidate.tcp_address),
        )
        .await
        {
            Ok(Ok(vote)) => vote,
            Ok(Err(e)) => {
                debug!(host = %candidate.tcp_address, error = %e, "status query failed");
                return disagree;
            }
            Err(_) => {
                debug!(host = %candidate.tcp_address, "status query timed out");
                return disagree;
            }
        };

        let key = match hex::decode(&candidate.node_pub_key) {
            Ok(key) => key,
            Err(e) => {
                warn!(candidate = candidate.id, error = %e, "registered key is not hex");
                return disagree;
            }
        };
        if !self.signer.verify(&key, &vote.signing_payload(), &vote.sign) {
            warn!(candidate = candidate.id, host = %candidate.tcp_address, "vote signature invalid");
            return disagree;
        }
        if vote.tcp_address != candidate.tcp_address {
            warn!(candidate = candidate.id, claimed = %vote.tcp_address, "vote names another address");
            return disagree;
        }
        if !self.is_fresh(vote.update_time, now) {
            warn!(candidate = candidate.id, update_time = vote.update_time, "stale vote");
            return disagree;
        }
        {
            let mut last = self.last_votes.lock();
            if matches!(last.get(&candidate.id), Some(seen) if *seen >= vote.update_time) {
                warn!(candidate = candidate.id, update_time = vote.update_time, "replayed vote");
                return disagree;
            }
            last.insert(candidate.id, vote.update_time);
        }
        PeerVote {
            agree: vote.agree,
            ..disagree
        }
    }

    /// One full voting round. Returns the broadcast tally.
    pub async fn run_round(&self) -> Result<VotingTotal> {
        let mode = match self.roles.resolve(self.state.store())? {
            NodeMode::Candidate(mode) => mode,
            NodeMode::Honor(_) => return Err(ChainError::NoCandidates),
        };
        let me = mode.me().cloned().ok_or_else(|| {
            ChainError::NotANode(format!("{} is not a registered candidate", self.roles.public_key()))
        })?;

        let now = chrono::Utc::now().timestamp();
        let me = &me;
        let votes = join_all(mode.candidates().iter().map(|candidate| async move {
            if candidate.id == me.id {
                PeerVote {
                    candidate_id: me.id,
                    tcp_address: me.tcp_address.clone(),
                    agree: true,
                }
            } else {
                self.collect_vote(candidate, now).await
            }
        }))
        .await;

        let agree_quantity = votes.iter().filter(|v| v.agree).count() as u64;
        // Two rounds inside one second still get distinct times.
        let update_time = self
            .last_totals
            .lock()
            .get(&self.roles.public_key().to_ascii_lowercase())
            .map_or(now, |seen| now.max(seen + 1));
        let mut total = VotingTotal {
            votes,
            agree_quantity,
            local_address: me.tcp_address.clone(),
            local_pub_key: self.roles.public_key().to_string(),
            update_time,
            sign: Vec::new(),
        };
        total.sign_with(&self.keypair)?;
        info!(
            agree = agree_quantity,
            candidates = total.votes.len(),
            "voting round tallied"
        );

        let peers: Vec<CandidateNode> = mode
            .candidates()
            .iter()
            .filter(|c| c.id != me.id)
            .cloned()
            .collect();
        self.broadcast(&total, &peers).await;
        self.ingest_voting_total(&total).await?;
        Ok(total)
    }

    async fn broadcast(&self, total: &VotingTotal, peers: &[CandidateNode]) {
        let total = Arc::new(total.clone());
        let mut sends = JoinSet::new();
        for peer in peers {
            let transport = self.transport.clone();
            let total = total.clone();
            let addr = peer.tcp_address.clone();
            let limit = self.peer_timeout;
            sends.spawn(async move {
                let result = timeout(limit, transport.send_voting_total(&addr, &total)).await;
                (addr, result)
            });
        }
        while let Some(joined) = sends.join_next().await {
            match joined {
                Ok((_, Ok(Ok(())))) => {}
                Ok((addr, Ok(Err(e)))) => debug!(host = %addr, error = %e, "voting total not delivered"),
                Ok((addr, Err(_))) => debug!(host = %addr, "voting total send timed out"),
                Err(e) => warn!(error = %e, "voting total send task failed"),
            }
        }
    }

    /// Verifies a received tally and credits the candidates it reports as
    /// agreeing. Returns how many were credited. A tally outside the
    /// freshness window, or not newer than the sender's last one, is
    /// rejected with [`ChainError::StaleMessage`].
    pub async fn ingest_voting_total(&self, total: &VotingTotal) -> Result<usize> {
        let key = hex::decode(&total.local_pub_key)?;
        if !self.signer.verify(&key, &total.signing_payload(), &total.sign) {
            return Err(ChainError::CryptoError(format!(
                "voting total from {} has an invalid signature",
                total.local_address
            )));
        }

        let candidates = self.state.store().candidate_nodes()?;
        if !candidates
            .iter()
            .any(|c| c.node_pub_key.eq_ignore_ascii_case(&total.local_pub_key))
        {
            return Err(ChainError::NotANode(format!(
                "voting total from unregistered key {}",
                total.local_pub_key
            )));
        }

        let now = chrono::Utc::now().timestamp();
        if !self.is_fresh(total.update_time, now) {
            return Err(ChainError::StaleMessage(format!(
                "voting total from {} dated {}",
                total.local_address, total.update_time
            )));
        }

        let guard = self.state.lock().await;
        {
            let mut last = self.last_totals.lock();
            let sender = total.local_pub_key.to_ascii_lowercase();
            if matches!(last.get(&sender), Some(seen) if *seen >= total.update_time) {
                return Err(ChainError::StaleMessage(format!(
                    "voting total from {} already seen",
                    total.local_address
                )));
            }
            last.insert(sender, total.update_time);
        }
        let mut credited = 0;
        for vote in total.votes.iter().filter(|v| v.agree) {
            if candidates.iter().any(|c| c.id == vote.candidate_id) {
                self.state.increment_reply_count(&guard, vote.candidate_id)?;
                credited += 1;
            }
        }
        debug!(from = %total.local_address, credited, "voting total ingested");
        Ok(credited)
    }
}

#[async_trait]
impl Job for CandidateVotingCoordinator {
    fn name(&self) -> &'static str {
        "candidate_voting"
    }

    async fn run(&self, _ctx: &JobContext) -> Result<()> {
        self.run_round().await.map(|_| ())
    }
}
