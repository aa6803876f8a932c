//! Transaction pipeline and contract VM contract.
//!
//! Execution, fee metering and the VM object table are owned by the
//! implementor. The core only drives them in the order block production,
//! sync and fork repair require.

use crate::block::Block;
use crate::crypto::Hash;
use crate::error::Result;

/// Opaque copy of the contract VM object table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VmSnapshot(pub Vec<u8>);

pub trait TransactionPipeline: Send + Sync {
    /// Up to `limit` verified, unused transactions for the next block.
    fn submit_pending_batch(&self, limit: usize) -> Result<Vec<Vec<u8>>>;

    /// Moves scheduled transactions due at `now` into the pending pool.
    fn submit_scheduled(&self, now: i64) -> Result<()>;

    /// Executes the block and returns the digest of its undo records.
    fn apply(&self, block: &Block) -> Result<Hash>;

    /// Reverts the effects of a previously applied block.
    fn rollback(&self, block: &Block) -> Result<()>;

    /// Drops the shared transaction cache. Runs on every global lock release.
    fn clean_cache(&self);

    fn snapshot_vm(&self) -> Result<VmSnapshot>;

    fn restore_vm(&self, snapshot: VmSnapshot) -> Result<()>;
}
