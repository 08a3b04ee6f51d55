//! Big map index types

use crate::keyhash::KeyHash;
use serde::{Deserialize, Serialize};

/// A big map allocated in contract storage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BigMap {
    /// Internal id, assigned at allocation from a persisted counter
    pub id: u64,
    /// Network the contract lives on
    pub network: String,
    /// Contract address owning the big map
    pub contract: String,
    /// On-chain big map pointer
    pub pointer: i64,
    /// Micheline key type, kept as opaque bytes
    pub key_type: Vec<u8>,
    /// Micheline value type, kept as opaque bytes
    pub value_type: Vec<u8>,
    /// Level the allocation was observed at
    pub created_level: u64,
    /// Timestamp of the allocating block
    pub created_at: u64,
}

/// One observed mutation of a single big map key
///
/// Append-only: a diff row is never mutated after insertion, only deleted
/// as part of a rollback's trailing suffix. An absent value encodes a
/// removal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BigMapDiff {
    /// Log-order id, assigned from a persisted counter
    pub id: u64,
    /// Owning big map
    pub big_map_id: u64,
    /// Canonical key identity
    pub key_hash: KeyHash,
    /// Raw key bytes, never interpreted
    pub key: Vec<u8>,
    /// Raw value bytes; `None` encodes removal
    pub value: Option<Vec<u8>>,
    /// Level of the block carrying the mutation
    pub level: u64,
    /// Timestamp of the block carrying the mutation
    pub timestamp: u64,
    /// Operation id within the block, the tie-break inside a level
    pub operation_id: u64,
    /// Protocol the operation was injected under
    pub protocol_id: u32,
}

/// Materialized current state of one big map key
///
/// Exactly one row exists per (big map, key hash) with at least one diff.
/// Created on the first diff, rewritten per later diff, deleted only by
/// rollback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BigMapState {
    /// Owning big map
    pub big_map_id: u64,
    /// Canonical key identity
    pub key_hash: KeyHash,
    /// Raw key bytes, retained for display
    pub key: Vec<u8>,
    /// Last known value; retained through a removal for display
    pub value: Option<Vec<u8>>,
    /// Whether the most recently folded diff removed the key
    pub removed: bool,
    /// Level of the most recently folded diff
    pub last_update_level: u64,
    /// Timestamp of the most recently folded diff
    pub last_update_time: u64,
    /// Operation id of the most recently folded diff
    pub last_operation_id: u64,
    /// Number of diffs folded into this row
    pub count: u64,
}

/// Ingestion input for one observed mutation
///
/// Produced by the chain-sync collaborator. The big map is identified by
/// its on-chain coordinates; `key_hash` may be omitted, in which case the
/// engine digests the raw key bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffInput {
    /// Network the mutation was observed on
    pub network: String,
    /// Contract address owning the big map
    pub contract: String,
    /// On-chain big map pointer
    pub pointer: i64,
    /// On-chain key hash, if the collaborator already has it
    pub key_hash: Option<KeyHash>,
    /// Raw key bytes
    pub key: Vec<u8>,
    /// Raw value bytes; `None` encodes removal
    pub value: Option<Vec<u8>>,
    /// Level of the block carrying the mutation
    pub level: u64,
    /// Operation id within the block
    pub operation_id: u64,
    /// Timestamp of the block carrying the mutation
    pub timestamp: u64,
    /// Protocol the operation was injected under
    pub protocol_id: u32,
}

/// Ingestion input for a big map allocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationInput {
    /// Network the allocation was observed on
    pub network: String,
    /// Contract address owning the big map
    pub contract: String,
    /// On-chain big map pointer
    pub pointer: i64,
    /// Micheline key type, kept as opaque bytes
    pub key_type: Vec<u8>,
    /// Micheline value type, kept as opaque bytes
    pub value_type: Vec<u8>,
    /// Level the allocation was observed at
    pub level: u64,
    /// Timestamp of the allocating block
    pub timestamp: u64,
}

/// Result of a completed rollback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackOutcome {
    /// State rows rewritten from a surviving diff
    pub states_restored: u64,
    /// State rows deleted because their whole history was discarded
    pub states_deleted: u64,
    /// Diff rows hard-deleted above the target level
    pub diffs_discarded: u64,
}

/// Current-state lookup result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateLookup {
    /// Key is present; current value bytes
    Active(Vec<u8>),
    /// Key was removed; last known value bytes, if any
    Removed(Option<Vec<u8>>),
    /// No state row exists for the key
    NotFound,
}

/// Aggregate key statistics for one big map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BigMapStats {
    /// Keys that have ever been seen (state rows, removed or not)
    pub total_keys: u64,
    /// Keys whose state row is not removed
    pub active_keys: u64,
}

/// Offset/limit page for history queries
#[derive(Debug, Clone, Copy)]
pub struct Page {
    /// Rows to skip
    pub offset: usize,
    /// Rows to return; clamped to the configured maximum
    pub limit: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 100,
        }
    }
}

/// One page of key history
#[derive(Debug, Clone)]
pub struct HistoryPage {
    /// Diffs in descending (level, operation id, id) order
    pub diffs: Vec<BigMapDiff>,
    /// Total diffs recorded for the key
    pub total: u64,
    /// Whether rows remain past this page
    pub has_more: bool,
}

/// Big map index configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Database path
    pub db_path: String,
    /// Maximum rows a history page may return
    pub max_page_size: usize,
    /// Number of stripes for per-key upsert locking
    pub lock_stripes: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            db_path: "data/bigmap-index".to_string(),
            max_page_size: 1000,
            lock_stripes: 64,
        }
    }
}
