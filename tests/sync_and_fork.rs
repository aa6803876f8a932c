mod common;

use common::*;
use kernelchain::ban::BanService;
use kernelchain::crypto::{sha256, KeyPair};
use kernelchain::persistence::{ChainStore, TransactionStatus};
use kernelchain::sync::SyncOutcome;
use kernelchain::ChainError;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct Net {
    a: KeyPair,
    b: KeyPair,
    transport: Arc<MockTransport>,
}

impl Net {
    fn new() -> Self {
        Self {
            a: KeyPair::generate().unwrap(),
            b: KeyPair::generate().unwrap(),
            transport: Arc::new(MockTransport::default()),
        }
    }

    /// Node B of an honor network {A at "a", B at "b"}; A holds the first key.
    fn node_b(&self, seeded: &ChainBuilder) -> TestNode {
        let honor_nodes = vec![honor("a", &self.a), honor("b", &self.b)];
        let t = test_node(config(&self.b, "b", &self.a, honor_nodes), self.transport.clone());
        seed(&t.store, &t.pipeline, &seeded.blocks);
        t
    }
}

async fn sync(t: &TestNode) -> kernelchain::Result<SyncOutcome> {
    tokio::time::timeout(
        Duration::from_secs(5),
        t.node.synchronizer.sync(&CancellationToken::new()),
    )
    .await
    .expect("sync timed out")
}

#[tokio::test]
async fn test_sync_when_up_to_date_changes_nothing() {
    let net = Net::new();
    let mut chain = ChainBuilder::new(&net.a);
    chain.extend_to(5, &net.a, "main");
    let t = net.node_b(&chain);
    net.transport.set_chain("a", &chain.blocks);

    let outcome = sync(&t).await.unwrap();
    assert_eq!(outcome, SyncOutcome::UpToDate { local: 5, remote: 5 });
    assert_eq!(t.pipeline.cleans(), 0);
    assert!(t.transport.stream_requests.lock().is_empty());
    assert_eq!(t.store.info_block().unwrap().unwrap().hash, chain.head().hash());
}

#[tokio::test]
async fn test_sync_applies_missing_blocks_in_batches() {
    let net = Net::new();
    let mut chain = ChainBuilder::new(&net.a);
    chain.extend_to(25, &net.a, "main");
    let t = net.node_b(&chain.prefix(3));
    net.transport.set_chain("a", &chain.blocks);

    let outcome = sync(&t).await.unwrap();
    assert_eq!(
        outcome,
        SyncOutcome::Applied {
            host: "a".to_string(),
            from: 4,
            to: 25
        }
    );

    let requests = t.transport.stream_requests.lock().clone();
    assert_eq!(
        requests,
        vec![
            ("a".to_string(), 4, 10, false),
            ("a".to_string(), 14, 10, false),
            ("a".to_string(), 24, 2, false),
        ]
    );
    let head = t.store.info_block().unwrap().unwrap();
    assert_eq!(head.block_id, 25);
    assert_eq!(head.hash, chain.head().hash());

    let status = t
        .store
        .transaction_status(&sha256(&tx("main", 17)))
        .unwrap()
        .unwrap();
    assert!(status.used);
    assert_eq!(status.block_id, Some(17));
    assert_eq!(t.pipeline.cleans(), 1);
}

#[tokio::test]
async fn test_sync_falls_back_to_bootstrap_nodes() {
    let net = Net::new();
    let mut chain = ChainBuilder::new(&net.a);
    chain.extend_to(6, &net.a, "main");

    let honor_nodes = vec![honor("a", &net.a), honor("b", &net.b)];
    let mut config = config(&net.b, "b", &net.a, honor_nodes);
    config.network.bootstrap_nodes = vec!["seed".to_string()];
    let t = test_node(config, net.transport.clone());
    seed(&t.store, &t.pipeline, &chain.prefix(2).blocks);

    net.transport.set_unreachable("a");
    net.transport.set_chain("seed", &chain.blocks);

    let outcome = sync(&t).await.unwrap();
    assert_eq!(
        outcome,
        SyncOutcome::Applied {
            host: "seed".to_string(),
            from: 3,
            to: 6
        }
    );
}

#[tokio::test]
async fn test_banned_bootstrap_node_is_skipped() {
    let net = Net::new();
    let mut chain = ChainBuilder::new(&net.a);
    chain.extend_to(6, &net.a, "main");

    let honor_nodes = vec![honor("a", &net.a), honor("b", &net.b)];
    let mut config = config(&net.b, "b", &net.a, honor_nodes);
    config.network.bootstrap_nodes = vec!["seed".to_string()];
    let t = test_node(config, net.transport.clone());
    seed(&t.store, &t.pipeline, &chain.prefix(2).blocks);

    net.transport.set_unreachable("a");
    net.transport.set_chain("seed", &chain.blocks);
    t.node.bans.register_bad_block("seed", 5, T0 + 5, "bad producer signature");

    assert_eq!(sync(&t).await.unwrap(), SyncOutcome::NoPeers);
    assert!(t.transport.stream_requests.lock().is_empty());
    assert_eq!(t.store.info_block().unwrap().unwrap().block_id, 2);
}

#[tokio::test]
async fn test_sync_without_reachable_peers() {
    let net = Net::new();
    let chain = ChainBuilder::new(&net.a);
    let t = net.node_b(&chain);
    net.transport.set_unreachable("a");

    assert_eq!(sync(&t).await.unwrap(), SyncOutcome::NoPeers);
}

#[tokio::test]
async fn test_hash_mismatch_replaces_diverged_suffix() {
    let net = Net::new();
    let mut base = ChainBuilder::new(&net.a);
    base.extend_to(97, &net.a, "main");
    let mut local = base.clone();
    local.extend_to(99, &net.a, "local");
    let mut remote = base.clone();
    remote.extend_to(100, &net.a, "remote");

    let t = net.node_b(&local);
    net.transport.set_chain("a", &remote.blocks);

    let outcome = sync(&t).await.unwrap();
    assert_eq!(
        outcome,
        SyncOutcome::ForkRepaired {
            host: "a".to_string(),
            head: 99
        }
    );
    assert_eq!(*t.pipeline.rolled_back.lock(), vec![99, 98]);
    assert_eq!(
        t.transport.stream_requests.lock().last().cloned(),
        Some(("a".to_string(), 99, 60, true))
    );
    for id in [98, 99] {
        let stored = t.store.block(id).unwrap().unwrap();
        assert_eq!(stored.hash, remote.blocks[id as usize - 1].hash());
    }
    assert_eq!(
        t.store.block(97).unwrap().unwrap().hash,
        base.head().hash()
    );

    for id in [98, 99] {
        let dropped = t
            .store
            .transaction_status(&sha256(&tx("local", id)))
            .unwrap()
            .unwrap();
        assert!(dropped.sent);
        assert!(!dropped.verified);
        assert!(!dropped.used);
        assert_eq!(dropped.block_id, None);

        let adopted = t
            .store
            .transaction_status(&sha256(&tx("remote", id)))
            .unwrap()
            .unwrap();
        assert!(adopted.used);
        assert_eq!(adopted.block_id, Some(id));
    }

    // The next tick continues on the adopted branch.
    let outcome = sync(&t).await.unwrap();
    assert_eq!(
        outcome,
        SyncOutcome::Applied {
            host: "a".to_string(),
            from: 100,
            to: 100
        }
    );
    assert_eq!(
        t.store.info_block().unwrap().unwrap().hash,
        remote.head().hash()
    );
}

#[tokio::test]
async fn test_rollbacks_hash_mismatch_replaces_two_blocks() {
    let net = Net::new();
    let mut chain = ChainBuilder::new(&net.a);
    chain.extend_to(12, &net.a, "main");
    let t = net.node_b(&chain.prefix(7));
    net.transport.set_chain("a", &chain.blocks);
    t.pipeline.poison.lock().insert(10);

    let outcome = sync(&t).await.unwrap();
    assert_eq!(
        outcome,
        SyncOutcome::ForkRepaired {
            host: "a".to_string(),
            head: 9
        }
    );
    assert_eq!(*t.pipeline.rolled_back.lock(), vec![10, 9, 8]);
    assert!(t.store.block(10).unwrap().is_none());

    let outcome = sync(&t).await.unwrap();
    assert_eq!(
        outcome,
        SyncOutcome::Applied {
            host: "a".to_string(),
            from: 10,
            to: 12
        }
    );
    assert_eq!(*t.pipeline.vm.lock(), (1..=12).collect::<Vec<u64>>());
}

#[tokio::test]
async fn test_diverged_head_digest_replaces_two_blocks() {
    let net = Net::new();
    let mut chain = ChainBuilder::new(&net.a);
    chain.extend_to(12, &net.a, "main");

    // Our block 10 executed to a different digest; its hash is unchanged.
    let mut local = chain.prefix(10);
    let head = &mut local.blocks[9].header;
    head.rollbacks_hash = sha256(b"diverged");
    head.sign_with(&net.a).unwrap();
    assert_eq!(local.head().hash(), chain.blocks[9].hash());

    let t = net.node_b(&local);
    net.transport.set_chain("a", &chain.blocks);

    let outcome = sync(&t).await.unwrap();
    assert_eq!(
        outcome,
        SyncOutcome::ForkRepaired {
            host: "a".to_string(),
            head: 10
        }
    );
    assert_eq!(*t.pipeline.rolled_back.lock(), vec![10, 9]);
    assert_eq!(
        t.transport.stream_requests.lock().last().cloned(),
        Some(("a".to_string(), 10, 60, true))
    );
    assert_eq!(
        t.store.block(10).unwrap().unwrap().rollbacks_hash,
        chain.blocks[9].header.rollbacks_hash
    );
    assert!(!t.node.bans.is_banned("a"));

    let outcome = sync(&t).await.unwrap();
    assert_eq!(
        outcome,
        SyncOutcome::Applied {
            host: "a".to_string(),
            from: 11,
            to: 12
        }
    );
    assert_eq!(*t.pipeline.vm.lock(), (1..=12).collect::<Vec<u64>>());
}

#[tokio::test]
async fn test_failed_replay_restores_previous_chain() {
    let net = Net::new();
    let mut base = ChainBuilder::new(&net.a);
    base.extend_to(97, &net.a, "main");
    let mut local = base.clone();
    local.extend_to(99, &net.a, "local");
    let mut remote = base.clone();
    remote.extend_to(100, &net.a, "remote");

    let t = net.node_b(&local);
    net.transport.set_chain("a", &remote.blocks);
    t.pipeline.fail_apply.lock().insert(99);
    let pending = TransactionStatus {
        hash: sha256(b"pending"),
        sent: true,
        verified: true,
        used: false,
        block_id: None,
    };
    t.store.save_transaction_status(&pending).unwrap();

    let err = sync(&t).await.unwrap_err();
    assert!(matches!(err, ChainError::BadBlock { ref host, .. } if host == "a"));

    let head = t.store.info_block().unwrap().unwrap();
    assert_eq!(head.block_id, 99);
    assert_eq!(head.hash, local.head().hash());
    for id in [98, 99] {
        let stored = t.store.block(id).unwrap().unwrap();
        assert_eq!(stored.hash, local.blocks[id as usize - 1].hash());
        let status = t
            .store
            .transaction_status(&sha256(&tx("local", id)))
            .unwrap()
            .unwrap();
        assert!(status.used);
        assert_eq!(status.block_id, Some(id));
    }
    assert_eq!(*t.pipeline.vm.lock(), (1..=99).collect::<Vec<u64>>());

    // Block 98 from the peer was adopted before 99 failed; its mark is gone.
    for id in [98, 99] {
        assert_eq!(
            t.store.transaction_status(&sha256(&tx("remote", id))).unwrap(),
            None
        );
    }
    assert_eq!(
        t.store.transaction_status(&pending.hash).unwrap(),
        Some(pending)
    );

    assert!(t.node.bans.is_banned("a"));
    let mode = t.node.roles.resolve(t.store.as_ref()).unwrap();
    assert!(mode.hosts_for_sync().is_empty());
}

#[tokio::test]
async fn test_badly_signed_replacement_is_rejected() {
    let net = Net::new();
    let intruder = KeyPair::generate().unwrap();
    let mut base = ChainBuilder::new(&net.a);
    base.extend_to(97, &net.a, "main");
    let mut local = base.clone();
    local.extend_to(99, &net.a, "local");
    let mut remote = base.clone();
    remote
        .push(&net.a, 0, vec![tx("remote", 98)])
        .push(&intruder, 0, vec![tx("remote", 99)])
        .push(&net.a, 0, vec![tx("remote", 100)]);

    let t = net.node_b(&local);
    net.transport.set_chain("a", &remote.blocks);

    let err = sync(&t).await.unwrap_err();
    assert!(matches!(err, ChainError::BadBlock { .. }));
    assert!(t.pipeline.rolled_back.lock().is_empty());
    assert_eq!(
        t.store.info_block().unwrap().unwrap().hash,
        local.head().hash()
    );
    assert!(t.node.bans.is_banned("a"));
    assert_eq!(t.node.bans.offenses("a"), 1);
}
