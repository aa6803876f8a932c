//! Shared in-memory collaborators for the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use kernelchain::block::{BincodeCodec, Block, BlockCodec, BlockHeader, ConsensusMode};
use kernelchain::config::{Config, HonorNode};
use kernelchain::crypto::{sha256, Hash, KeyPair, Secp256k1Verifier};
use kernelchain::error::{ChainError, Result};
use kernelchain::persistence::{ChainStore, MemoryStore, StoredBlock};
use kernelchain::pipeline::{TransactionPipeline, VmSnapshot};
use kernelchain::transport::{PeerTransport, VoteMsg, VotingTotal};
use kernelchain::{Collaborators, Node};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const T0: i64 = 1_700_000_000;

/// Digest the mock VM produces for a block.
pub fn rollbacks_hash_for(block: &Block) -> Hash {
    let mut data = block.header.block_id.to_be_bytes().to_vec();
    data.extend_from_slice(&block.header.mrkl_root);
    sha256(&data)
}

pub fn tx(tag: &str, id: u64) -> Vec<u8> {
    format!("{}-{}", tag, id).into_bytes()
}

// ----------------------------------------------------------------------------
// Pipeline
// ----------------------------------------------------------------------------

#[derive(Default)]
pub struct MockPipeline {
    pub pending: Mutex<Vec<Vec<u8>>>,
    /// Ids of applied blocks, oldest first.
    pub vm: Mutex<Vec<u64>>,
    pub rolled_back: Mutex<Vec<u64>>,
    pub applied: Mutex<Vec<u64>>,
    /// Next apply of these ids returns a wrong rollbacks hash.
    pub poison: Mutex<HashSet<u64>>,
    pub fail_apply: Mutex<HashSet<u64>>,
    pub cleans: AtomicUsize,
    pub scheduled: Mutex<Vec<i64>>,
}

impl MockPipeline {
    pub fn queue(&self, txs: Vec<Vec<u8>>) {
        self.pending.lock().extend(txs);
    }

    pub fn cleans(&self) -> usize {
        self.cleans.load(Ordering::SeqCst)
    }
}

impl TransactionPipeline for MockPipeline {
    fn submit_pending_batch(&self, limit: usize) -> Result<Vec<Vec<u8>>> {
        let mut pending = self.pending.lock();
        let take = limit.min(pending.len());
        Ok(pending.drain(..take).collect())
    }

    fn submit_scheduled(&self, now: i64) -> Result<()> {
        self.scheduled.lock().push(now);
        Ok(())
    }

    fn apply(&self, block: &Block) -> Result<Hash> {
        let id = block.header.block_id;
        if self.fail_apply.lock().contains(&id) {
            return Err(ChainError::ExecutionError(format!("block {} rejected", id)));
        }
        self.vm.lock().push(id);
        self.applied.lock().push(id);
        if self.poison.lock().remove(&id) {
            return Ok(sha256(b"diverged"));
        }
        Ok(rollbacks_hash_for(block))
    }

    fn rollback(&self, block: &Block) -> Result<()> {
        let id = block.header.block_id;
        let mut vm = self.vm.lock();
        if let Some(pos) = vm.iter().rposition(|applied| *applied == id) {
            vm.remove(pos);
        }
        self.rolled_back.lock().push(id);
        Ok(())
    }

    fn clean_cache(&self) {
        self.cleans.fetch_add(1, Ordering::SeqCst);
    }

    fn snapshot_vm(&self) -> Result<VmSnapshot> {
        Ok(VmSnapshot(serde_json::to_vec(&*self.vm.lock())?))
    }

    fn restore_vm(&self, snapshot: VmSnapshot) -> Result<()> {
        *self.vm.lock() = serde_json::from_slice(&snapshot.0)?;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Transport
// ----------------------------------------------------------------------------

#[derive(Default)]
pub struct MockTransport {
    /// Raw blocks each host serves, index `id - 1`.
    chains: Mutex<HashMap<String, Vec<Vec<u8>>>>,
    unreachable: Mutex<HashSet<String>>,
    votes: Mutex<HashMap<String, VoteMsg>>,
    pub totals: Mutex<Vec<(String, VotingTotal)>>,
    pub broadcasts: Mutex<Vec<(Vec<String>, Vec<u8>, Vec<Hash>)>>,
    pub stream_requests: Mutex<Vec<(String, u64, u32, bool)>>,
}

impl MockTransport {
    pub fn set_chain(&self, host: &str, blocks: &[Block]) {
        let raws = blocks
            .iter()
            .map(|b| BincodeCodec.serialize(b).unwrap())
            .collect();
        self.chains.lock().insert(host.to_string(), raws);
    }

    /// Serves everything `store` holds as `host`'s chain.
    pub fn publish_store(&self, host: &str, store: &dyn ChainStore) {
        let head = store.info_block().unwrap().map(|i| i.block_id).unwrap_or(0);
        let raws = (1..=head)
            .map(|id| store.block(id).unwrap().unwrap().data)
            .collect();
        self.chains.lock().insert(host.to_string(), raws);
    }

    pub fn set_unreachable(&self, host: &str) {
        self.unreachable.lock().insert(host.to_string());
    }

    pub fn set_vote(&self, host: &str, vote: VoteMsg) {
        self.votes.lock().insert(host.to_string(), vote);
    }

    fn check(&self, addr: &str) -> Result<()> {
        if self.unreachable.lock().contains(addr) {
            return Err(ChainError::NetworkError(format!("{} unreachable", addr)));
        }
        Ok(())
    }

    fn chain(&self, addr: &str) -> Result<Vec<Vec<u8>>> {
        self.check(addr)?;
        self.chains
            .lock()
            .get(addr)
            .cloned()
            .ok_or_else(|| ChainError::NetworkError(format!("{} has no chain", addr)))
    }
}

#[async_trait]
impl PeerTransport for MockTransport {
    async fn query_max_block_id(&self, addr: &str) -> Result<u64> {
        Ok(self.chain(addr)?.len() as u64)
    }

    async fn stream_block_bodies(
        &self,
        addr: &str,
        from_id: u64,
        count: u32,
        reverse: bool,
    ) -> Result<BoxStream<'static, Result<Vec<u8>>>> {
        self.stream_requests
            .lock()
            .push((addr.to_string(), from_id, count, reverse));
        let chain = self.chain(addr)?;
        let ids: Vec<u64> = if reverse {
            let low = from_id.saturating_sub(count as u64 - 1).max(1);
            (low..=from_id).rev().collect()
        } else {
            (from_id..from_id + count as u64).collect()
        };
        let items: Vec<Result<Vec<u8>>> = ids
            .into_iter()
            .filter_map(|id| chain.get(id as usize - 1).cloned())
            .map(Ok)
            .collect();
        Ok(stream::iter(items).boxed())
    }

    async fn broadcast_block_and_tx_hashes(
        &self,
        addrs: &[String],
        block: &[u8],
        tx_hashes: &[Hash],
    ) -> Result<()> {
        self.broadcasts
            .lock()
            .push((addrs.to_vec(), block.to_vec(), tx_hashes.to_vec()));
        Ok(())
    }

    async fn send_status_query(&self, addr: &str) -> Result<VoteMsg> {
        self.check(addr)?;
        self.votes
            .lock()
            .get(addr)
            .cloned()
            .ok_or_else(|| ChainError::NetworkError(format!("{} did not answer", addr)))
    }

    async fn send_voting_total(&self, addr: &str, total: &VotingTotal) -> Result<()> {
        self.check(addr)?;
        self.totals.lock().push((addr.to_string(), total.clone()));
        Ok(())
    }

    async fn query_block_hash(&self, addr: &str, block_id: u64) -> Result<Option<Hash>> {
        let chain = self.chain(addr)?;
        match chain.get(block_id as usize - 1) {
            Some(raw) => Ok(Some(BincodeCodec.parse(raw)?.hash())),
            None => Ok(None),
        }
    }
}

// ----------------------------------------------------------------------------
// Chains
// ----------------------------------------------------------------------------

/// Builds signed honor-mode chains the way a producer would.
#[derive(Clone)]
pub struct ChainBuilder {
    pub blocks: Vec<Block>,
}

impl ChainBuilder {
    pub fn new(first: &KeyPair) -> Self {
        let mut block = Block {
            header: BlockHeader {
                block_id: 1,
                time: T0,
                ecosystem_id: 1,
                version: 1,
                mrkl_root: Block::calculate_merkle_root(&[]),
                ..Default::default()
            },
            prev_header: None,
            transactions: vec![],
        };
        block.header.rollbacks_hash = rollbacks_hash_for(&block);
        block.header.sign_with(first).unwrap();
        Self { blocks: vec![block] }
    }

    pub fn head(&self) -> &Block {
        self.blocks.last().unwrap()
    }

    pub fn push(&mut self, producer: &KeyPair, position: u64, transactions: Vec<Vec<u8>>) -> &mut Self {
        let prev = self.head().header.clone();
        let mut block = Block {
            header: BlockHeader {
                block_id: prev.block_id + 1,
                time: T0 + prev.block_id as i64 + 1,
                ecosystem_id: 1,
                node_position: position,
                version: 1,
                consensus_mode: ConsensusMode::Honor,
                prev_hash: prev.hash(),
                prev_rollbacks_hash: prev.rollbacks_hash,
                mrkl_root: Block::calculate_merkle_root(&transactions),
                ..Default::default()
            },
            prev_header: None,
            transactions,
        };
        block.header.rollbacks_hash = rollbacks_hash_for(&block);
        block.header.sign_with(producer).unwrap();
        self.blocks.push(block);
        self
    }

    /// Extends to `len` blocks, each carrying one `tag` transaction.
    pub fn extend_to(&mut self, len: u64, producer: &KeyPair, tag: &str) -> &mut Self {
        while (self.blocks.len() as u64) < len {
            let id = self.blocks.len() as u64 + 1;
            self.push(producer, 0, vec![tx(tag, id)]);
        }
        self
    }

    /// Copy of the first `len` blocks.
    pub fn prefix(&self, len: u64) -> Self {
        Self {
            blocks: self.blocks[..len as usize].to_vec(),
        }
    }
}

/// Writes `blocks` into a node's store as if they had been applied.
pub fn seed(store: &MemoryStore, pipeline: &MockPipeline, blocks: &[Block]) {
    for block in blocks {
        let stored = StoredBlock {
            id: block.header.block_id,
            hash: block.hash(),
            rollbacks_hash: block.header.rollbacks_hash,
            node_position: block.header.node_position,
            time: block.header.time,
            tx_count: block.transactions.len() as u32,
            data: BincodeCodec.serialize(block).unwrap(),
        };
        store.insert_block(&stored).unwrap();
        store.set_info_block(&stored.to_info()).unwrap();
        store.mark_transactions_sent(&block.tx_hashes()).unwrap();
        store
            .mark_transactions_used(stored.id, &block.tx_hashes())
            .unwrap();
        pipeline.vm.lock().push(stored.id);
    }
}

// ----------------------------------------------------------------------------
// Nodes
// ----------------------------------------------------------------------------

pub fn honor(addr: &str, key: &KeyPair) -> HonorNode {
    HonorNode {
        tcp_address: addr.to_string(),
        public_key: key.public_key_hex(),
    }
}

pub fn config(me: &KeyPair, addr: &str, first: &KeyPair, honor_nodes: Vec<HonorNode>) -> Config {
    let mut config = Config::default();
    config.node.private_key = hex::encode(me.secret_key.secret_bytes());
    config.node.tcp_address = addr.to_string();
    config.network.honor_nodes = honor_nodes;
    config.network.peer_timeout = Duration::from_millis(200);
    config.network.blocks_per_request = 10;
    config.consensus.first_block_public_key = first.public_key_hex();
    config.consensus.first_block_time = T0;
    config.consensus.block_generation_time = Duration::from_secs(1);
    config.consensus.blocks_gap = Duration::from_secs(1);
    config.consensus.candidate_backoff = Duration::from_millis(10);
    config.consensus.min_confirmed_nodes = 3;
    config
}

pub struct TestNode {
    pub node: Node,
    pub store: Arc<MemoryStore>,
    pub pipeline: Arc<MockPipeline>,
    pub transport: Arc<MockTransport>,
}

pub fn test_node(config: Config, transport: Arc<MockTransport>) -> TestNode {
    test_node_with(
        config,
        Arc::new(MemoryStore::installed()),
        Arc::new(MockPipeline::default()),
        transport,
    )
}

pub fn test_node_with(
    config: Config,
    store: Arc<MemoryStore>,
    pipeline: Arc<MockPipeline>,
    transport: Arc<MockTransport>,
) -> TestNode {
    let node = Node::new(
        config,
        Collaborators {
            store: store.clone(),
            pipeline: pipeline.clone(),
            transport: transport.clone(),
            codec: Arc::new(BincodeCodec),
            signer: Arc::new(Secp256k1Verifier),
        },
    )
    .unwrap();
    TestNode {
        node,
        store,
        pipeline,
        transport,
    }
}
