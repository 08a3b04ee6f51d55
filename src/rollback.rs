//! Rollback coordinator
//!
//! Restores the materialized view to an earlier chain level after a
//! reorganization, using only history already held in the diff log. The
//! whole call is a single atomic commit: a crash never exposes a
//! half-rolled-back view.

use crate::error::{BigMapIndexError, Result};
use crate::keyhash::KeyHash;
use crate::storage::{Batch, IndexStorage};
use crate::types::{BigMapState, RollbackOutcome};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Rollback coordinator component
///
/// Callers must hold the network's exclusive ingestion lock for the
/// duration of the call; the engine façade enforces this.
pub struct RollbackCoordinator {
    storage: Arc<IndexStorage>,
}

impl RollbackCoordinator {
    /// Create a new coordinator over the shared storage
    pub fn new(storage: Arc<IndexStorage>) -> Self {
        Self { storage }
    }

    /// Roll the network's big maps back to `target_level`
    ///
    /// Phase A finds every state touched above the target, phase B
    /// rewrites each from its latest surviving diff (or deletes it when
    /// the whole history is above the target), phase C hard-deletes the
    /// diff suffix above the target. Idempotent: a second call with the
    /// same target finds an empty dirty set.
    pub async fn rollback_to(&self, network: &str, target_level: u64) -> Result<RollbackOutcome> {
        let dirty = self.storage.states_above_level(network, target_level).await?;
        info!(
            "Rolling back {} to level {}: {} dirty states",
            network,
            target_level,
            dirty.len()
        );

        let mut batch = Batch::new();
        let mut states_restored = 0u64;
        let mut states_deleted = 0u64;

        for (_state_level, big_map_id, key_hash) in dirty {
            let state = self
                .storage
                .get_state(big_map_id, &key_hash)
                .await?
                .ok_or_else(|| {
                    BigMapIndexError::RollbackInvariantViolation(format!(
                        "dirty index entry for big map {} key {} has no state row",
                        big_map_id, key_hash
                    ))
                })?;

            let refs = self.storage.key_diff_refs(big_map_id, &key_hash).await?;
            let discarded = refs
                .iter()
                .filter(|(level, _, _)| *level > target_level)
                .count() as u64;
            if discarded == 0 {
                return Err(BigMapIndexError::RollbackInvariantViolation(format!(
                    "state for big map {} key {} is dirty at level {} but no diff lies above {}",
                    big_map_id, key_hash, state.last_update_level, target_level
                )));
            }
            let new_count = state.count.checked_sub(discarded).ok_or_else(|| {
                BigMapIndexError::RollbackInvariantViolation(format!(
                    "count underflow for big map {} key {}: count {} minus {} discarded",
                    big_map_id, key_hash, state.count, discarded
                ))
            })?;

            let survivors: Vec<&(u64, u64, u64)> = refs
                .iter()
                .filter(|(level, _, _)| *level <= target_level)
                .collect();

            if survivors.is_empty() {
                if new_count != 0 {
                    return Err(BigMapIndexError::RollbackInvariantViolation(format!(
                        "big map {} key {} has no surviving diff but count would be {}",
                        big_map_id, key_hash, new_count
                    )));
                }
                debug!(
                    "Deleting state for big map {} key {}: whole history above level {}",
                    big_map_id, key_hash, target_level
                );
                batch.delete_state(network, &state);
                states_deleted += 1;
            } else {
                let restored = self
                    .restore_from_survivors(big_map_id, &key_hash, &survivors, new_count)
                    .await?;
                batch.put_state(network, &restored, Some(state.last_update_level))?;
                states_restored += 1;
            }
        }

        // Phase C: hard-delete the diff suffix. Re-ingestion of the same
        // levels appends fresh diffs with new ids.
        let tail = self.storage.diffs_above_level(network, target_level).await?;
        let mut diffs_discarded = 0u64;
        for (_level, diff_id) in tail {
            let diff = self.storage.get_diff(diff_id).await?.ok_or_else(|| {
                BigMapIndexError::RollbackInvariantViolation(format!(
                    "level index entry for missing diff {}",
                    diff_id
                ))
            })?;
            batch.delete_diff(network, &diff);
            diffs_discarded += 1;
        }

        self.storage.commit(batch).await?;

        if states_restored + states_deleted + diffs_discarded > 0 {
            info!(
                "Rolled back {} to level {}: {} states restored, {} deleted, {} diffs discarded",
                network, target_level, states_restored, states_deleted, diffs_discarded
            );
        } else {
            debug!("Rollback of {} to level {} was a no-op", network, target_level);
        }

        Ok(RollbackOutcome {
            states_restored,
            states_deleted,
            diffs_discarded,
        })
    }

    /// Rebuild a state row from the surviving chain of one key
    ///
    /// The latest survivor dictates removed/level/time; when it is a
    /// removal the last surviving value is walked up for display, which
    /// keeps rollback-then-replay byte-identical to a straight fold.
    async fn restore_from_survivors(
        &self,
        big_map_id: u64,
        key_hash: &KeyHash,
        survivors: &[&(u64, u64, u64)],
        new_count: u64,
    ) -> Result<BigMapState> {
        let &(level, operation_id, diff_id) = *survivors.last().ok_or_else(|| {
            BigMapIndexError::RollbackInvariantViolation(format!(
                "empty surviving chain for big map {} key {}",
                big_map_id, key_hash
            ))
        })?;
        if new_count == 0 {
            warn!(
                "Big map {} key {} has surviving diffs but a zero fold count",
                big_map_id, key_hash
            );
            return Err(BigMapIndexError::RollbackInvariantViolation(format!(
                "big map {} key {} has a surviving diff chain but count would reach zero",
                big_map_id, key_hash
            )));
        }

        let latest = self.storage.get_diff(diff_id).await?.ok_or_else(|| {
            BigMapIndexError::RollbackInvariantViolation(format!(
                "key index entry for missing diff {}",
                diff_id
            ))
        })?;

        let mut value = latest.value.clone();
        if value.is_none() {
            for &&(_, _, earlier_id) in survivors.iter().rev().skip(1) {
                let earlier = self.storage.get_diff(earlier_id).await?.ok_or_else(|| {
                    BigMapIndexError::RollbackInvariantViolation(format!(
                        "key index entry for missing diff {}",
                        earlier_id
                    ))
                })?;
                if earlier.value.is_some() {
                    value = earlier.value;
                    break;
                }
            }
        }

        Ok(BigMapState {
            big_map_id,
            key_hash: *key_hash,
            key: latest.key,
            value,
            removed: latest.value.is_none(),
            last_update_level: level,
            last_update_time: latest.timestamp,
            last_operation_id: operation_id,
            count: new_count,
        })
    }
}
