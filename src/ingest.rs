//! Big map ingestion pipeline
//!
//! Accepts allocation and diff inputs from the chain-sync collaborator
//! and drives the reconciler. Diffs must arrive in non-decreasing
//! (level, operation id) order per key; this is the documented interface
//! contract with the upstream pipeline, and regressions are rejected.
//!
//! Locking: one `RwLock` per network. Reconciliation runs under the
//! read guard so distinct big maps proceed concurrently; rollback takes
//! the write guard and is exclusive with all ingestion for the network.
//! Same-key upserts are serialized by a striped mutex set, the engine's
//! stand-in for the storage layer's row lock on the unique
//! (big map, key hash) constraint.

use crate::error::{BigMapIndexError, Result};
use crate::keyhash::KeyHash;
use crate::reconciler::Reconciler;
use crate::storage::{Batch, IndexStorage};
use crate::types::{AllocationInput, BigMap, BigMapDiff, BigMapState, DiffInput};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

/// Per-network ingestion/rollback locks
///
/// Shared between the pipeline (read side) and the rollback coordinator
/// (write side) so the two are mutually exclusive per network and two
/// networks never contend.
pub struct NetworkLocks {
    locks: parking_lot::RwLock<HashMap<String, Arc<RwLock<()>>>>,
}

impl NetworkLocks {
    /// Create an empty lock registry
    pub fn new() -> Self {
        Self {
            locks: parking_lot::RwLock::new(HashMap::new()),
        }
    }

    /// Get or create the lock of one network
    pub fn for_network(&self, network: &str) -> Arc<RwLock<()>> {
        if let Some(lock) = self.locks.read().get(network) {
            return lock.clone();
        }
        let mut locks = self.locks.write();
        locks
            .entry(network.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }
}

impl Default for NetworkLocks {
    fn default() -> Self {
        Self::new()
    }
}

/// Big map ingestion pipeline
pub struct IngestionPipeline {
    storage: Arc<IndexStorage>,
    reconciler: Reconciler,
    network_locks: Arc<NetworkLocks>,
    stripes: Vec<Mutex<()>>,
}

impl IngestionPipeline {
    /// Create a new pipeline over the shared storage
    pub fn new(
        storage: Arc<IndexStorage>,
        network_locks: Arc<NetworkLocks>,
        lock_stripes: usize,
    ) -> Self {
        let stripes = (0..lock_stripes.max(1)).map(|_| Mutex::new(())).collect();
        Self {
            reconciler: Reconciler::new(storage.clone()),
            storage,
            network_locks,
            stripes,
        }
    }

    fn stripe_for(&self, big_map_id: u64, key_hash: &KeyHash) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        big_map_id.hash(&mut hasher);
        key_hash.0.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.stripes.len();
        &self.stripes[index]
    }

    /// Record a big map allocation
    ///
    /// Idempotent per on-chain identity: re-allocating the same
    /// (network, pointer, contract) returns the existing row. The same
    /// pointer under a different contract is an invalid reference.
    pub async fn allocate(&self, input: AllocationInput) -> Result<BigMap> {
        if let Some(existing) = self
            .storage
            .get_big_map_by_pointer(&input.network, input.pointer)
            .await?
        {
            if existing.contract != input.contract {
                return Err(BigMapIndexError::InvalidReference(format!(
                    "big map {}/{} is owned by {}, allocation names {}",
                    input.network, input.pointer, existing.contract, input.contract
                )));
            }
            debug!(
                "Allocation of big map {}/{} already recorded as id {}",
                input.network, input.pointer, existing.id
            );
            return Ok(existing);
        }

        let big_map = BigMap {
            id: self.storage.next_big_map_id(),
            network: input.network,
            contract: input.contract,
            pointer: input.pointer,
            key_type: input.key_type,
            value_type: input.value_type,
            created_level: input.level,
            created_at: input.timestamp,
        };

        let mut batch = Batch::new();
        batch.put_big_map(&big_map)?;
        batch.set_next_big_map_id(big_map.id + 1);
        self.storage.commit(batch).await?;

        info!(
            "Allocated big map {}/{} for contract {} as id {}",
            big_map.network, big_map.pointer, big_map.contract, big_map.id
        );
        Ok(big_map)
    }

    /// Ingest one observed mutation
    ///
    /// Resolves the big map, assigns the next log id, and reconciles the
    /// resulting diff into the key's state. Blocks while a rollback holds
    /// the network; contention on the same key's row lock surfaces as
    /// [`BigMapIndexError::StorageConflict`] for the caller to retry with
    /// backoff.
    pub async fn apply_diff(&self, input: DiffInput) -> Result<BigMapState> {
        let network_lock = self.network_locks.for_network(&input.network);
        let _network = network_lock.read().await;

        let big_map = self
            .storage
            .get_big_map_by_pointer(&input.network, input.pointer)
            .await?
            .ok_or_else(|| {
                BigMapIndexError::InvalidReference(format!(
                    "diff references unknown big map {}/{}",
                    input.network, input.pointer
                ))
            })?;
        if big_map.contract != input.contract {
            return Err(BigMapIndexError::InvalidReference(format!(
                "big map {}/{} is owned by {}, diff names {}",
                input.network, input.pointer, big_map.contract, input.contract
            )));
        }

        let key_hash = match input.key_hash {
            Some(hash) => hash,
            None => KeyHash::digest(&input.key),
        };

        let stripe = self.stripe_for(big_map.id, &key_hash);
        let _row = stripe.try_lock().map_err(|_| {
            BigMapIndexError::StorageConflict(format!(
                "concurrent upsert on big map {} key {}",
                big_map.id, key_hash
            ))
        })?;

        let diff = BigMapDiff {
            id: self.storage.next_diff_id(),
            big_map_id: big_map.id,
            key_hash,
            key: input.key,
            value: input.value,
            level: input.level,
            timestamp: input.timestamp,
            operation_id: input.operation_id,
            protocol_id: input.protocol_id,
        };

        self.reconciler.apply(diff).await
    }

    /// Ingest one block's diffs for a network, in order
    pub async fn apply_block(
        &self,
        network: &str,
        inputs: Vec<DiffInput>,
    ) -> Result<Vec<BigMapState>> {
        let mut states = Vec::with_capacity(inputs.len());
        for input in inputs {
            if input.network != network {
                return Err(BigMapIndexError::InvalidReference(format!(
                    "block batch for {} carries a diff for {}",
                    network, input.network
                )));
            }
            states.push(self.apply_diff(input).await?);
        }
        Ok(states)
    }
}
