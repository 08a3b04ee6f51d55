//! Big map index storage layer using ParityDB
//!
//! All mutations go through [`Batch`], an accumulated set of writes
//! committed atomically in one ParityDB commit. Each reconciliation and
//! each rollback is exactly one commit, which gives the engine its
//! transactional boundaries.

use crate::error::{BigMapIndexError, Result};
use crate::keyhash::KeyHash;
use crate::schema;
use crate::types::{BigMap, BigMapDiff, BigMapState};
use parity_db::{Db, Options};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

/// Column family indices for the big map index
const CF_BIGMAPS: u8 = 0;
const CF_DIFFS: u8 = 1;
const CF_DIFF_INDEX: u8 = 2;
const CF_STATES: u8 = 3;
const CF_STATE_INDEX: u8 = 4;
const CF_METADATA: u8 = 5;

const NUM_COLUMNS: u8 = 6;

/// One write destined for an atomic commit
type BatchOp = (u8, Vec<u8>, Option<Vec<u8>>);

/// Accumulated writes committed as one atomic unit
///
/// Typed methods keep index maintenance next to the row they index: a
/// state write always carries its level-index maintenance, a diff write
/// always carries both of its index entries.
#[derive(Default)]
pub struct Batch {
    ops: Vec<BatchOp>,
}

impl Batch {
    /// Create an empty batch
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of writes queued
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether the batch holds no writes
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Queue a big map row and its on-chain identity index entry
    pub fn put_big_map(&mut self, big_map: &BigMap) -> Result<()> {
        let value = serde_json::to_vec(big_map)?;
        self.ops.push((
            CF_BIGMAPS,
            schema::big_map_key(big_map.id).into_bytes(),
            Some(value),
        ));
        self.ops.push((
            CF_BIGMAPS,
            schema::big_map_pointer_key(&big_map.network, big_map.pointer).into_bytes(),
            Some(big_map.id.to_le_bytes().to_vec()),
        ));
        Ok(())
    }

    /// Queue a diff row and both of its index entries
    pub fn put_diff(&mut self, network: &str, diff: &BigMapDiff) -> Result<()> {
        let value = serde_json::to_vec(diff)?;
        self.ops
            .push((CF_DIFFS, schema::diff_key(diff.id).into_bytes(), Some(value)));
        self.ops.push((
            CF_DIFF_INDEX,
            schema::diff_key_index_key(
                diff.big_map_id,
                &diff.key_hash,
                diff.level,
                diff.operation_id,
                diff.id,
            )
            .into_bytes(),
            Some(diff.id.to_le_bytes().to_vec()),
        ));
        self.ops.push((
            CF_DIFF_INDEX,
            schema::diff_level_index_key(network, diff.level, diff.id).into_bytes(),
            Some(diff.id.to_le_bytes().to_vec()),
        ));
        Ok(())
    }

    /// Queue deletion of a diff row and both of its index entries
    pub fn delete_diff(&mut self, network: &str, diff: &BigMapDiff) {
        self.ops
            .push((CF_DIFFS, schema::diff_key(diff.id).into_bytes(), None));
        self.ops.push((
            CF_DIFF_INDEX,
            schema::diff_key_index_key(
                diff.big_map_id,
                &diff.key_hash,
                diff.level,
                diff.operation_id,
                diff.id,
            )
            .into_bytes(),
            None,
        ));
        self.ops.push((
            CF_DIFF_INDEX,
            schema::diff_level_index_key(network, diff.level, diff.id).into_bytes(),
            None,
        ));
    }

    /// Queue a state row upsert with level-index maintenance
    ///
    /// `previous_level` is the level currently recorded in the index for
    /// this key, if a state row already exists; its entry is deleted in
    /// the same commit that inserts the new one.
    pub fn put_state(
        &mut self,
        network: &str,
        state: &BigMapState,
        previous_level: Option<u64>,
    ) -> Result<()> {
        let value = serde_json::to_vec(state)?;
        self.ops.push((
            CF_STATES,
            schema::state_key(state.big_map_id, &state.key_hash).into_bytes(),
            Some(value),
        ));
        if let Some(level) = previous_level {
            if level != state.last_update_level {
                self.ops.push((
                    CF_STATE_INDEX,
                    schema::state_level_index_key(network, level, state.big_map_id, &state.key_hash)
                        .into_bytes(),
                    None,
                ));
            }
        }
        self.ops.push((
            CF_STATE_INDEX,
            schema::state_level_index_key(
                network,
                state.last_update_level,
                state.big_map_id,
                &state.key_hash,
            )
            .into_bytes(),
            Some(Vec::new()),
        ));
        Ok(())
    }

    /// Queue deletion of a state row and its level-index entry
    pub fn delete_state(&mut self, network: &str, state: &BigMapState) {
        self.ops.push((
            CF_STATES,
            schema::state_key(state.big_map_id, &state.key_hash).into_bytes(),
            None,
        ));
        self.ops.push((
            CF_STATE_INDEX,
            schema::state_level_index_key(
                network,
                state.last_update_level,
                state.big_map_id,
                &state.key_hash,
            )
            .into_bytes(),
            None,
        ));
    }

    /// Queue the persisted diff id counter
    pub fn set_next_diff_id(&mut self, id: u64) {
        self.ops.push((
            CF_METADATA,
            schema::keys::NEXT_DIFF_ID_KEY.to_vec(),
            Some(id.to_le_bytes().to_vec()),
        ));
    }

    /// Queue the persisted big map id counter
    pub fn set_next_big_map_id(&mut self, id: u64) {
        self.ops.push((
            CF_METADATA,
            schema::keys::NEXT_BIG_MAP_ID_KEY.to_vec(),
            Some(id.to_le_bytes().to_vec()),
        ));
    }
}

/// Big map index storage
pub struct IndexStorage {
    db: Db,
    next_diff_id: AtomicU64,
    next_big_map_id: AtomicU64,
}

impl IndexStorage {
    /// Open or create the index database
    pub async fn new(db_path: &str) -> Result<Self> {
        let path = Path::new(db_path);
        if !path.exists() {
            std::fs::create_dir_all(path)?;
        }

        let mut opts = Options::with_columns(path, NUM_COLUMNS);
        for column in opts.columns.iter_mut() {
            column.btree_index = true;
        }
        let db = Db::open_or_create(&opts)
            .map_err(|e| BigMapIndexError::ParityDBError(e.to_string()))?;

        let storage = Self {
            db,
            next_diff_id: AtomicU64::new(0),
            next_big_map_id: AtomicU64::new(0),
        };

        // The stored counters can trail the log tail if a crash landed
        // between commits; the scan heals them.
        let stored_diff_id = storage.load_counter(schema::keys::NEXT_DIFF_ID_KEY)?;
        let scanned_diff_id = storage.max_row_id(CF_DIFFS, schema::keys::DIFF_PREFIX)?;
        storage
            .next_diff_id
            .store(stored_diff_id.max(scanned_diff_id), Ordering::SeqCst);

        let stored_map_id = storage.load_counter(schema::keys::NEXT_BIG_MAP_ID_KEY)?;
        let scanned_map_id = storage.max_row_id(CF_BIGMAPS, schema::keys::BIGMAP_PREFIX)?;
        storage
            .next_big_map_id
            .store(stored_map_id.max(scanned_map_id), Ordering::SeqCst);

        info!(
            "Big map index storage initialized at {} (next diff id {}, next big map id {})",
            db_path,
            storage.next_diff_id.load(Ordering::SeqCst),
            storage.next_big_map_id.load(Ordering::SeqCst)
        );

        Ok(storage)
    }

    fn load_counter(&self, key: &[u8]) -> Result<u64> {
        match self
            .db
            .get(CF_METADATA, key)
            .map_err(|e| BigMapIndexError::ParityDBError(e.to_string()))?
        {
            Some(bytes) if bytes.len() == 8 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&bytes);
                Ok(u64::from_le_bytes(buf))
            }
            _ => Ok(0),
        }
    }

    /// Largest id in use under a `{prefix}{id:016x}` column, plus one
    fn max_row_id(&self, column: u8, prefix: &str) -> Result<u64> {
        let mut max = 0u64;
        let mut iter = self
            .db
            .iter(column)
            .map_err(|e| BigMapIndexError::ParityDBError(e.to_string()))?;
        iter.seek(prefix.as_bytes())
            .map_err(|e| BigMapIndexError::ParityDBError(e.to_string()))?;
        while let Some((key, _value)) = iter
            .next()
            .map_err(|e| BigMapIndexError::ParityDBError(e.to_string()))?
        {
            let Ok(key_str) = std::str::from_utf8(&key) else {
                break;
            };
            let Some(rest) = key_str.strip_prefix(prefix) else {
                break;
            };
            if let Ok(id) = u64::from_str_radix(rest, 16) {
                max = max.max(id + 1);
            }
        }
        Ok(max)
    }

    /// Take the next diff id
    pub fn next_diff_id(&self) -> u64 {
        self.next_diff_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Take the next big map id
    pub fn next_big_map_id(&self) -> u64 {
        self.next_big_map_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Commit an accumulated batch atomically
    pub async fn commit(&self, batch: Batch) -> Result<()> {
        debug!("Committing batch of {} writes", batch.len());
        self.db
            .commit(batch.ops)
            .map_err(|e| BigMapIndexError::ParityDBError(e.to_string()))
    }

    /// Get big map by internal id
    pub async fn get_big_map(&self, id: u64) -> Result<Option<BigMap>> {
        match self
            .db
            .get(CF_BIGMAPS, schema::big_map_key(id).as_bytes())
            .map_err(|e| BigMapIndexError::ParityDBError(e.to_string()))?
        {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    /// Get big map by on-chain identity
    pub async fn get_big_map_by_pointer(
        &self,
        network: &str,
        pointer: i64,
    ) -> Result<Option<BigMap>> {
        let key = schema::big_map_pointer_key(network, pointer);
        match self
            .db
            .get(CF_BIGMAPS, key.as_bytes())
            .map_err(|e| BigMapIndexError::ParityDBError(e.to_string()))?
        {
            Some(bytes) if bytes.len() == 8 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&bytes);
                self.get_big_map(u64::from_le_bytes(buf)).await
            }
            _ => Ok(None),
        }
    }

    /// Get diff row by id
    pub async fn get_diff(&self, id: u64) -> Result<Option<BigMapDiff>> {
        match self
            .db
            .get(CF_DIFFS, schema::diff_key(id).as_bytes())
            .map_err(|e| BigMapIndexError::ParityDBError(e.to_string()))?
        {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    /// Get state row by key identity
    pub async fn get_state(
        &self,
        big_map_id: u64,
        key_hash: &KeyHash,
    ) -> Result<Option<BigMapState>> {
        match self
            .db
            .get(CF_STATES, schema::state_key(big_map_id, key_hash).as_bytes())
            .map_err(|e| BigMapIndexError::ParityDBError(e.to_string()))?
        {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    /// All diff references for one key in ascending (level, operation id,
    /// id) order
    pub async fn key_diff_refs(
        &self,
        big_map_id: u64,
        key_hash: &KeyHash,
    ) -> Result<Vec<(u64, u64, u64)>> {
        let prefix = schema::diff_key_index_prefix(big_map_id, key_hash);
        let mut refs = Vec::new();
        let mut iter = self
            .db
            .iter(CF_DIFF_INDEX)
            .map_err(|e| BigMapIndexError::ParityDBError(e.to_string()))?;
        iter.seek(prefix.as_bytes())
            .map_err(|e| BigMapIndexError::ParityDBError(e.to_string()))?;
        while let Some((key, _value)) = iter
            .next()
            .map_err(|e| BigMapIndexError::ParityDBError(e.to_string()))?
        {
            let Ok(key_str) = std::str::from_utf8(&key) else {
                break;
            };
            if !key_str.starts_with(&prefix) {
                break;
            }
            if let Some(entry) = schema::parse_diff_key_index_key(key_str) {
                refs.push(entry);
            }
        }
        Ok(refs)
    }

    /// State index entries of a network with last update level strictly
    /// above the given level, as (level, big map id, key hash)
    pub async fn states_above_level(
        &self,
        network: &str,
        level: u64,
    ) -> Result<Vec<(u64, u64, KeyHash)>> {
        let from = schema::state_level_index_from(network, level.saturating_add(1));
        let prefix = schema::state_level_index_prefix(network);
        let mut entries = Vec::new();
        let mut iter = self
            .db
            .iter(CF_STATE_INDEX)
            .map_err(|e| BigMapIndexError::ParityDBError(e.to_string()))?;
        iter.seek(from.as_bytes())
            .map_err(|e| BigMapIndexError::ParityDBError(e.to_string()))?;
        while let Some((key, _value)) = iter
            .next()
            .map_err(|e| BigMapIndexError::ParityDBError(e.to_string()))?
        {
            let Ok(key_str) = std::str::from_utf8(&key) else {
                break;
            };
            if !key_str.starts_with(&prefix) {
                break;
            }
            if let Some(entry) = schema::parse_state_level_index_key(key_str, network) {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    /// Diff index entries of a network with level strictly above the
    /// given level, as (level, diff id)
    pub async fn diffs_above_level(&self, network: &str, level: u64) -> Result<Vec<(u64, u64)>> {
        let from = schema::diff_level_index_from(network, level.saturating_add(1));
        let prefix = schema::diff_level_index_prefix(network);
        let mut entries = Vec::new();
        let mut iter = self
            .db
            .iter(CF_DIFF_INDEX)
            .map_err(|e| BigMapIndexError::ParityDBError(e.to_string()))?;
        iter.seek(from.as_bytes())
            .map_err(|e| BigMapIndexError::ParityDBError(e.to_string()))?;
        while let Some((key, _value)) = iter
            .next()
            .map_err(|e| BigMapIndexError::ParityDBError(e.to_string()))?
        {
            let Ok(key_str) = std::str::from_utf8(&key) else {
                break;
            };
            if !key_str.starts_with(&prefix) {
                break;
            }
            if let Some(entry) = schema::parse_diff_level_index_key(key_str, network) {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    /// Count state rows of one big map: (total, active)
    pub async fn count_states(&self, big_map_id: u64) -> Result<(u64, u64)> {
        let prefix = schema::state_prefix(big_map_id);
        let mut total = 0u64;
        let mut active = 0u64;
        let mut iter = self
            .db
            .iter(CF_STATES)
            .map_err(|e| BigMapIndexError::ParityDBError(e.to_string()))?;
        iter.seek(prefix.as_bytes())
            .map_err(|e| BigMapIndexError::ParityDBError(e.to_string()))?;
        while let Some((key, value)) = iter
            .next()
            .map_err(|e| BigMapIndexError::ParityDBError(e.to_string()))?
        {
            let Ok(key_str) = std::str::from_utf8(&key) else {
                break;
            };
            if !key_str.starts_with(&prefix) {
                break;
            }
            let state: BigMapState = serde_json::from_slice(&value)?;
            total += 1;
            if !state.removed {
                active += 1;
            }
        }
        Ok((total, active))
    }
}
