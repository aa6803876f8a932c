//! Slot arithmetic for honor-node block production.
//!
//! Time since the first block is cut into slots of
//! `block_generation_time + blocks_gap`. Slot `q` belongs to honor position
//! `q % node_count`.

use crate::config::ConsensusConfig;
use crate::error::Result;
use crate::persistence::ChainStore;

#[derive(Debug, Clone, Copy)]
pub struct BlockTimeCounter {
    first_block_time: i64,
    /// Slot length in seconds, never zero.
    duration: i64,
    node_count: u64,
}

impl BlockTimeCounter {
    pub fn new(config: &ConsensusConfig, node_count: usize) -> Self {
        let duration = (config.block_generation_time + config.blocks_gap).as_secs() as i64;
        Self {
            first_block_time: config.first_block_time,
            duration: duration.max(1),
            node_count: node_count as u64,
        }
    }

    pub fn queue(&self, at: i64) -> u64 {
        if at <= self.first_block_time {
            return 0;
        }
        ((at - self.first_block_time) / self.duration) as u64
    }

    /// Position whose turn it is at `at`; `None` with no producers.
    pub fn node_position(&self, at: i64) -> Option<u64> {
        (self.node_count > 0).then(|| self.queue(at) % self.node_count)
    }

    /// Bounds `[start, end)` of the slot containing `at`.
    pub fn range_by_time(&self, at: i64) -> (i64, i64) {
        let start = self.first_block_time + self.queue(at) as i64 * self.duration;
        (start, start + self.duration)
    }

    pub fn time_to_generate(&self, at: i64, position: u64) -> bool {
        position < self.node_count && self.node_position(at) == Some(position)
    }

    /// Whether `position` already produced a block in the slot containing `at`.
    pub fn block_for_time_exists(
        &self,
        store: &dyn ChainStore,
        at: i64,
        position: u64,
    ) -> Result<bool> {
        let (start, end) = self.range_by_time(at);
        Ok(store.count_node_blocks_between(start, end, position)? > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{MemoryStore, StoredBlock};
    use std::time::Duration;

    fn counter(nodes: usize) -> BlockTimeCounter {
        let config = ConsensusConfig {
            first_block_time: 1_000,
            block_generation_time: Duration::from_secs(2),
            blocks_gap: Duration::from_secs(3),
            ..Default::default()
        };
        BlockTimeCounter::new(&config, nodes)
    }

    #[test]
    fn test_positions_rotate_per_slot() {
        let counter = counter(3);
        assert_eq!(counter.node_position(1_000), Some(0));
        assert_eq!(counter.node_position(1_004), Some(0));
        assert_eq!(counter.node_position(1_005), Some(1));
        assert_eq!(counter.node_position(1_012), Some(2));
        assert_eq!(counter.node_position(1_015), Some(0));
        assert!(counter.time_to_generate(1_006, 1));
        assert!(!counter.time_to_generate(1_006, 0));
        assert!(!counter.time_to_generate(1_006, 7));
    }

    #[test]
    fn test_no_producers_means_no_turn() {
        let counter = counter(0);
        assert_eq!(counter.node_position(5_000), None);
        assert!(!counter.time_to_generate(5_000, 0));
    }

    #[test]
    fn test_block_for_time_exists() {
        let counter = counter(2);
        let store = MemoryStore::new();
        store
            .insert_block(&StoredBlock {
                id: 2,
                hash: [2; 32],
                rollbacks_hash: [0; 32],
                node_position: 1,
                time: 1_007,
                tx_count: 1,
                data: vec![],
            })
            .unwrap();

        assert_eq!(counter.range_by_time(1_008), (1_005, 1_010));
        assert!(counter.block_for_time_exists(&store, 1_008, 1).unwrap());
        assert!(!counter.block_for_time_exists(&store, 1_008, 0).unwrap());
        assert!(!counter.block_for_time_exists(&store, 1_016, 1).unwrap());
    }
}
