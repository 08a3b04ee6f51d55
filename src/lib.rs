//! Big Map Index - change tracking and materialized state for contract big maps
//!
//! The index keeps two views over every big map observed on-chain:
//! a complete, order-preserving diff log of each mutation, and a compact
//! materialized state row per key for fast current-value lookup. Told
//! that the chain reorganized, it restores the materialized view to an
//! earlier level using only history it already holds.
//!
//! # Architecture
//!
//! ```text
//! Chain sync (external)
//!     ↓ allocations / diffs
//! IngestionPipeline
//!     ├─ resolve big map, assign log id
//!     └─ Reconciler: diff append + state upsert, one atomic commit
//!         ↓
//! IndexStorage (ParityDB)
//!     ├─ diff log + key/level indexes
//!     └─ state rows + level index
//!         ↑
//! RollbackCoordinator: dirty-set rewrite + suffix truncation,
//!                      one atomic commit, exclusive per network
//! ```
//!
//! Key and value payloads are opaque bytes; the engine hashes keys into a
//! fixed-width identity and never interprets the contents.

pub mod error;
pub mod ingest;
pub mod keyhash;
pub mod query;
pub mod reconciler;
pub mod rollback;
pub mod schema;
pub mod storage;
pub mod types;

pub use error::{BigMapIndexError, Result};
pub use ingest::{IngestionPipeline, NetworkLocks};
pub use keyhash::KeyHash;
pub use reconciler::{fold_diff, Reconciler};
pub use rollback::RollbackCoordinator;
pub use types::{
    AllocationInput, BigMap, BigMapDiff, BigMapState, BigMapStats, DiffInput, HistoryPage,
    IndexConfig, Page, RollbackOutcome, StateLookup,
};

use std::sync::Arc;
use tracing::{debug, info};

/// Big map index engine
pub struct BigMapIndex {
    storage: Arc<storage::IndexStorage>,
    pipeline: ingest::IngestionPipeline,
    rollback: rollback::RollbackCoordinator,
    network_locks: Arc<ingest::NetworkLocks>,
    config: IndexConfig,
}

impl BigMapIndex {
    /// Open or create a big map index with the given configuration
    pub async fn new(config: IndexConfig) -> Result<Self> {
        info!("Initializing big map index at {}", config.db_path);

        let storage = Arc::new(storage::IndexStorage::new(&config.db_path).await?);
        let network_locks = Arc::new(ingest::NetworkLocks::new());
        let pipeline = ingest::IngestionPipeline::new(
            storage.clone(),
            network_locks.clone(),
            config.lock_stripes,
        );
        let rollback = rollback::RollbackCoordinator::new(storage.clone());

        Ok(Self {
            storage,
            pipeline,
            rollback,
            network_locks,
            config,
        })
    }

    /// Record a big map allocation
    pub async fn allocate(&self, input: AllocationInput) -> Result<BigMap> {
        self.pipeline.allocate(input).await
    }

    /// Ingest one observed mutation
    pub async fn apply_diff(&self, input: DiffInput) -> Result<BigMapState> {
        self.pipeline.apply_diff(input).await
    }

    /// Ingest one block's diffs for a network, in order
    pub async fn apply_block(
        &self,
        network: &str,
        inputs: Vec<DiffInput>,
    ) -> Result<Vec<BigMapState>> {
        self.pipeline.apply_block(network, inputs).await
    }

    /// Roll a network back to `target_level` after a reorganization
    ///
    /// Takes the network's exclusive lock first: no diff for the network
    /// reconciles while the rollback transaction runs.
    pub async fn rollback_to(&self, network: &str, target_level: u64) -> Result<RollbackOutcome> {
        let lock = self.network_locks.for_network(network);
        let _exclusive = lock.write().await;
        debug!("Acquired exclusive {} lock for rollback", network);
        self.rollback.rollback_to(network, target_level).await
    }

    /// Look up the current state of one key
    pub async fn get_state(
        &self,
        network: &str,
        pointer: i64,
        key_hash: &KeyHash,
    ) -> Result<StateLookup> {
        query::get_state(&self.storage, network, pointer, key_hash).await
    }

    /// Page through one key's history in descending chain order
    pub async fn get_history(
        &self,
        network: &str,
        pointer: i64,
        key_hash: &KeyHash,
        page: Page,
    ) -> Result<HistoryPage> {
        query::get_history(
            &self.storage,
            network,
            pointer,
            key_hash,
            page,
            self.config.max_page_size,
        )
        .await
    }

    /// Aggregate key statistics for one big map
    pub async fn get_stats(&self, network: &str, pointer: i64) -> Result<BigMapStats> {
        query::get_stats(&self.storage, network, pointer).await
    }

    /// All states of a network updated strictly after the given level
    pub async fn changed_since(&self, network: &str, level: u64) -> Result<Vec<BigMapState>> {
        query::changed_since(&self.storage, network, level).await
    }

    /// Look up a big map by its on-chain identity
    pub async fn get_big_map(&self, network: &str, pointer: i64) -> Result<Option<BigMap>> {
        self.storage.get_big_map_by_pointer(network, pointer).await
    }
}
