//! Reconciler: folds one diff into materialized state
//!
//! The fold itself is a pure function of (existing state, diff); the
//! component around it persists the diff row and the rewritten state row
//! in a single atomic commit, so the log append and the materialized
//! update land together.

use crate::error::{BigMapIndexError, Result};
use crate::storage::{Batch, IndexStorage};
use crate::types::{BigMapDiff, BigMapState};
use std::sync::Arc;
use tracing::debug;

/// Fold one diff into the state of its key
///
/// - no existing state: the diff creates the row, `count = 1`;
/// - value present: overwrite, clear the removed flag;
/// - value absent: mark removed, retain the last known value for display.
pub fn fold_diff(existing: Option<&BigMapState>, diff: &BigMapDiff) -> BigMapState {
    match existing {
        None => BigMapState {
            big_map_id: diff.big_map_id,
            key_hash: diff.key_hash,
            key: diff.key.clone(),
            value: diff.value.clone(),
            removed: diff.value.is_none(),
            last_update_level: diff.level,
            last_update_time: diff.timestamp,
            last_operation_id: diff.operation_id,
            count: 1,
        },
        Some(state) => BigMapState {
            big_map_id: state.big_map_id,
            key_hash: state.key_hash,
            key: state.key.clone(),
            value: match &diff.value {
                Some(value) => Some(value.clone()),
                None => state.value.clone(),
            },
            removed: diff.value.is_none(),
            last_update_level: diff.level,
            last_update_time: diff.timestamp,
            last_operation_id: diff.operation_id,
            count: state.count + 1,
        },
    }
}

/// Reconciler component
pub struct Reconciler {
    storage: Arc<IndexStorage>,
}

impl Reconciler {
    /// Create a new reconciler over the shared storage
    pub fn new(storage: Arc<IndexStorage>) -> Self {
        Self { storage }
    }

    /// Apply one persisted diff to its key's state
    ///
    /// Performs an unconditional upsert-with-increment; exactly-once
    /// delivery is the ingestion pipeline's guarantee, not checked here.
    /// Diffs for a key must arrive in non-decreasing (level, operation
    /// id) order; a regressing diff is rejected with
    /// [`BigMapIndexError::OutOfOrderDiff`] instead of corrupting the
    /// fold count.
    pub async fn apply(&self, diff: BigMapDiff) -> Result<BigMapState> {
        let big_map = self
            .storage
            .get_big_map(diff.big_map_id)
            .await?
            .ok_or_else(|| {
                BigMapIndexError::InvalidReference(format!(
                    "diff {} references unknown big map {}",
                    diff.id, diff.big_map_id
                ))
            })?;

        let existing = self
            .storage
            .get_state(diff.big_map_id, &diff.key_hash)
            .await?;

        if let Some(state) = &existing {
            if (diff.level, diff.operation_id)
                < (state.last_update_level, state.last_operation_id)
            {
                return Err(BigMapIndexError::OutOfOrderDiff {
                    big_map_id: diff.big_map_id,
                    key_hash: diff.key_hash.to_hex(),
                    level: diff.level,
                    operation_id: diff.operation_id,
                    last_level: state.last_update_level,
                    last_operation_id: state.last_operation_id,
                });
            }
        }

        let previous_level = existing.as_ref().map(|s| s.last_update_level);
        let state = fold_diff(existing.as_ref(), &diff);

        let mut batch = Batch::new();
        batch.put_diff(&big_map.network, &diff)?;
        batch.put_state(&big_map.network, &state, previous_level)?;
        batch.set_next_diff_id(diff.id + 1);
        self.storage.commit(batch).await?;

        debug!(
            "Reconciled diff {} for big map {} key {} at level {} (count {})",
            diff.id, diff.big_map_id, diff.key_hash, diff.level, state.count
        );

        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyhash::KeyHash;

    fn diff(level: u64, operation_id: u64, id: u64, value: Option<&[u8]>) -> BigMapDiff {
        BigMapDiff {
            id,
            big_map_id: 1,
            key_hash: KeyHash::digest(b"key"),
            key: b"key".to_vec(),
            value: value.map(|v| v.to_vec()),
            level,
            timestamp: 1_700_000_000 + level,
            operation_id,
            protocol_id: 1,
        }
    }

    #[test]
    fn first_diff_creates_state() {
        let state = fold_diff(None, &diff(10, 0, 0, Some(b"a")));
        assert_eq!(state.value.as_deref(), Some(&b"a"[..]));
        assert!(!state.removed);
        assert_eq!(state.last_update_level, 10);
        assert_eq!(state.count, 1);
    }

    #[test]
    fn first_diff_may_be_a_removal() {
        let state = fold_diff(None, &diff(10, 0, 0, None));
        assert!(state.removed);
        assert!(state.value.is_none());
        assert_eq!(state.count, 1);
    }

    #[test]
    fn update_overwrites_and_increments() {
        let first = fold_diff(None, &diff(10, 0, 0, Some(b"a")));
        let second = fold_diff(Some(&first), &diff(11, 0, 1, Some(b"b")));
        assert_eq!(second.value.as_deref(), Some(&b"b"[..]));
        assert!(!second.removed);
        assert_eq!(second.last_update_level, 11);
        assert_eq!(second.count, 2);
    }

    #[test]
    fn removal_retains_last_value() {
        let first = fold_diff(None, &diff(10, 0, 0, Some(b"a")));
        let second = fold_diff(Some(&first), &diff(15, 0, 1, None));
        assert!(second.removed);
        assert_eq!(second.value.as_deref(), Some(&b"a"[..]));
        assert_eq!(second.count, 2);
    }

    #[test]
    fn value_after_removal_clears_removed_flag() {
        let a = fold_diff(None, &diff(10, 0, 0, Some(b"a")));
        let b = fold_diff(Some(&a), &diff(11, 0, 1, None));
        let c = fold_diff(Some(&b), &diff(12, 0, 2, Some(b"c")));
        assert!(!c.removed);
        assert_eq!(c.value.as_deref(), Some(&b"c"[..]));
        assert_eq!(c.count, 3);
    }

    #[test]
    fn level_and_count_track_the_fold() {
        let mut state = None;
        for (n, level) in [10u64, 10, 12, 15].iter().enumerate() {
            let next = fold_diff(state.as_ref(), &diff(*level, n as u64, n as u64, Some(b"v")));
            assert_eq!(next.count, n as u64 + 1);
            assert_eq!(next.last_update_level, *level);
            state = Some(next);
        }
    }
}
