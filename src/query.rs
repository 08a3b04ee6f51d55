//! Big map read façade
//!
//! Current-state and historical lookups for the API/query layer. All
//! reads observe committed state only; nothing here mutates the index.

use crate::error::{BigMapIndexError, Result};
use crate::keyhash::KeyHash;
use crate::storage::IndexStorage;
use crate::types::{BigMapStats, BigMapState, HistoryPage, Page, StateLookup};
use tracing::{debug, warn};

/// Look up the current state of one key
///
/// An unknown big map or a key with no state row both answer
/// [`StateLookup::NotFound`].
pub async fn get_state(
    storage: &IndexStorage,
    network: &str,
    pointer: i64,
    key_hash: &KeyHash,
) -> Result<StateLookup> {
    let Some(big_map) = storage.get_big_map_by_pointer(network, pointer).await? else {
        return Ok(StateLookup::NotFound);
    };
    match storage.get_state(big_map.id, key_hash).await? {
        Some(state) if state.removed => Ok(StateLookup::Removed(state.value)),
        Some(state) => match state.value {
            Some(value) => Ok(StateLookup::Active(value)),
            None => Ok(StateLookup::Removed(None)),
        },
        None => Ok(StateLookup::NotFound),
    }
}

/// Page through one key's history in descending chain order
///
/// Diffs come newest-first by (level, operation id, id); the page limit
/// is clamped to `max_page_size`.
pub async fn get_history(
    storage: &IndexStorage,
    network: &str,
    pointer: i64,
    key_hash: &KeyHash,
    page: Page,
    max_page_size: usize,
) -> Result<HistoryPage> {
    let big_map = storage
        .get_big_map_by_pointer(network, pointer)
        .await?
        .ok_or_else(|| {
            BigMapIndexError::BigMapNotFound(format!("{}/{}", network, pointer))
        })?;

    let refs = storage.key_diff_refs(big_map.id, key_hash).await?;
    let total = refs.len() as u64;
    let limit = page.limit.min(max_page_size);

    let mut diffs = Vec::new();
    for &(_, _, diff_id) in refs.iter().rev().skip(page.offset).take(limit) {
        match storage.get_diff(diff_id).await? {
            Some(diff) => diffs.push(diff),
            None => {
                warn!("History index references missing diff {}", diff_id);
            }
        }
    }

    let has_more = (page.offset + diffs.len()) < total as usize;
    debug!(
        "History page for big map {} key {}: {} of {} diffs",
        big_map.id,
        key_hash,
        diffs.len(),
        total
    );

    Ok(HistoryPage {
        diffs,
        total,
        has_more,
    })
}

/// Aggregate key statistics for one big map
pub async fn get_stats(
    storage: &IndexStorage,
    network: &str,
    pointer: i64,
) -> Result<BigMapStats> {
    let big_map = storage
        .get_big_map_by_pointer(network, pointer)
        .await?
        .ok_or_else(|| {
            BigMapIndexError::BigMapNotFound(format!("{}/{}", network, pointer))
        })?;

    let (total_keys, active_keys) = storage.count_states(big_map.id).await?;
    Ok(BigMapStats {
        total_keys,
        active_keys,
    })
}

/// All states of a network updated strictly after the given level
///
/// Feeds downstream cache invalidation: every row returned here was
/// touched by a block above `level`.
pub async fn changed_since(
    storage: &IndexStorage,
    network: &str,
    level: u64,
) -> Result<Vec<BigMapState>> {
    let entries = storage.states_above_level(network, level).await?;
    let mut states = Vec::with_capacity(entries.len());
    for (_, big_map_id, key_hash) in entries {
        match storage.get_state(big_map_id, &key_hash).await? {
            Some(state) => states.push(state),
            None => {
                warn!(
                    "Change index references missing state for big map {} key {}",
                    big_map_id, key_hash
                );
            }
        }
    }
    Ok(states)
}
