//! Big map index ParityDB schema
//!
//! This module documents the ParityDB layout used by the big map index and
//! owns every key-building and key-parsing helper, so the byte layout of
//! the database lives in one place.

/// ParityDB schema for the big map index
///
/// # Column Families
///
/// A single ParityDB database with the following columns and key patterns.
/// Numeric key segments are fixed-width lowercase hex so that lexicographic
/// iteration order equals numeric order; every column is opened with a
/// btree index to make ordered prefix scans real.
///
/// ## Big Maps (`CF_BIGMAPS`)
/// - Key: `bigmap:{id}`
/// - Value: Serialized BigMap (JSON)
/// - Purpose: Big map rows by internal id
///
/// - Key: `bigmapptr:{network}:{pointer}`
/// - Value: Internal id (8 bytes, little-endian u64)
/// - Purpose: On-chain identity lookup; a pointer is unique per network
///
/// ## Diff Log (`CF_DIFFS`)
/// - Key: `diff:{id}`
/// - Value: Serialized BigMapDiff (JSON)
/// - Purpose: Append-only mutation log in id (log) order
///
/// ## Diff Indexes (`CF_DIFF_INDEX`)
///
/// ### By Key
/// - Key: `diffkey:{big_map_id}:{key_hash}:{level}:{operation_id}:{id}`
/// - Value: Diff id (8 bytes, little-endian u64)
/// - Purpose: Per-key history in composite chain order; drives history
///   pages and the rollback replacement lookup
///
/// ### By Level
/// - Key: `difflevel:{network}:{level}:{id}`
/// - Value: Diff id (8 bytes, little-endian u64)
/// - Purpose: Level-ordered scan per network; drives the rollback
///   history-truncation phase
///
/// ## States (`CF_STATES`)
/// - Key: `state:{big_map_id}:{key_hash}`
/// - Value: Serialized BigMapState (JSON)
/// - Purpose: Materialized current value per key; the unique
///   (big_map_id, key_hash) constraint of the model is this key itself
///
/// ## State Level Index (`CF_STATE_INDEX`)
/// - Key: `statelevel:{network}:{last_update_level}:{big_map_id}:{key_hash}`
/// - Value: empty
/// - Purpose: States ordered by last update level per network; drives the
///   rollback dirty-set scan and the changed-since feed. Maintained by
///   the same commit that rewrites the state row: the old entry is
///   deleted and the new one inserted atomically with the upsert.
///
/// ## Metadata (`CF_METADATA`)
/// - Key: `next_diff_id` / `next_big_map_id`
/// - Value: Next id to assign (8 bytes, little-endian u64)
/// - Purpose: Persisted monotonic counters, committed in the same batch
///   as the row that consumes the id
///
/// # Transactional Boundaries
///
/// A ParityDB commit is atomic. Each reconciliation is one commit (diff
/// row, both diff index entries, state row, state index maintenance,
/// counter). Each rollback is one commit covering all three phases, so a
/// crash never exposes a half-rolled-back view.
pub mod keys {
    pub const BIGMAP_PREFIX: &str = "bigmap:";
    pub const BIGMAP_POINTER_PREFIX: &str = "bigmapptr:";
    pub const DIFF_PREFIX: &str = "diff:";
    pub const DIFF_KEY_INDEX_PREFIX: &str = "diffkey:";
    pub const DIFF_LEVEL_INDEX_PREFIX: &str = "difflevel:";
    pub const STATE_PREFIX: &str = "state:";
    pub const STATE_LEVEL_INDEX_PREFIX: &str = "statelevel:";
    pub const NEXT_DIFF_ID_KEY: &[u8] = b"next_diff_id";
    pub const NEXT_BIG_MAP_ID_KEY: &[u8] = b"next_big_map_id";
}

use crate::keyhash::KeyHash;

/// Build big map row key
pub fn big_map_key(id: u64) -> String {
    format!("{}{:016x}", keys::BIGMAP_PREFIX, id)
}

/// Build big map on-chain identity key
pub fn big_map_pointer_key(network: &str, pointer: i64) -> String {
    format!("{}{}:{}", keys::BIGMAP_POINTER_PREFIX, network, pointer)
}

/// Build diff row key
pub fn diff_key(id: u64) -> String {
    format!("{}{:016x}", keys::DIFF_PREFIX, id)
}

/// Build per-key diff index key in composite chain order
pub fn diff_key_index_key(
    big_map_id: u64,
    key_hash: &KeyHash,
    level: u64,
    operation_id: u64,
    diff_id: u64,
) -> String {
    format!(
        "{}{:016x}:{}:{:016x}:{:016x}:{:016x}",
        keys::DIFF_KEY_INDEX_PREFIX,
        big_map_id,
        key_hash,
        level,
        operation_id,
        diff_id
    )
}

/// Build per-key diff index prefix
pub fn diff_key_index_prefix(big_map_id: u64, key_hash: &KeyHash) -> String {
    format!(
        "{}{:016x}:{}:",
        keys::DIFF_KEY_INDEX_PREFIX,
        big_map_id,
        key_hash
    )
}

/// Build per-network level index key for a diff
pub fn diff_level_index_key(network: &str, level: u64, diff_id: u64) -> String {
    format!(
        "{}{}:{:016x}:{:016x}",
        keys::DIFF_LEVEL_INDEX_PREFIX,
        network,
        level,
        diff_id
    )
}

/// Build per-network diff level index prefix
pub fn diff_level_index_prefix(network: &str) -> String {
    format!("{}{}:", keys::DIFF_LEVEL_INDEX_PREFIX, network)
}

/// Build the first diff level index key at or above a level
pub fn diff_level_index_from(network: &str, level: u64) -> String {
    format!("{}{}:{:016x}:", keys::DIFF_LEVEL_INDEX_PREFIX, network, level)
}

/// Build state row key
pub fn state_key(big_map_id: u64, key_hash: &KeyHash) -> String {
    format!("{}{:016x}:{}", keys::STATE_PREFIX, big_map_id, key_hash)
}

/// Build per-big-map state prefix
pub fn state_prefix(big_map_id: u64) -> String {
    format!("{}{:016x}:", keys::STATE_PREFIX, big_map_id)
}

/// Build per-network state level index key
pub fn state_level_index_key(
    network: &str,
    level: u64,
    big_map_id: u64,
    key_hash: &KeyHash,
) -> String {
    format!(
        "{}{}:{:016x}:{:016x}:{}",
        keys::STATE_LEVEL_INDEX_PREFIX,
        network,
        level,
        big_map_id,
        key_hash
    )
}

/// Build per-network state level index prefix
pub fn state_level_index_prefix(network: &str) -> String {
    format!("{}{}:", keys::STATE_LEVEL_INDEX_PREFIX, network)
}

/// Build the first state level index key at or above a level
pub fn state_level_index_from(network: &str, level: u64) -> String {
    format!(
        "{}{}:{:016x}:",
        keys::STATE_LEVEL_INDEX_PREFIX,
        network,
        level
    )
}

/// Parse `(level, big_map_id, key_hash)` out of a state level index key
///
/// Returns `None` for keys that do not follow the documented layout.
pub fn parse_state_level_index_key(key: &str, network: &str) -> Option<(u64, u64, KeyHash)> {
    let rest = key.strip_prefix(keys::STATE_LEVEL_INDEX_PREFIX)?;
    let rest = rest.strip_prefix(network)?.strip_prefix(':')?;
    let mut parts = rest.splitn(3, ':');
    let level = u64::from_str_radix(parts.next()?, 16).ok()?;
    let big_map_id = u64::from_str_radix(parts.next()?, 16).ok()?;
    let key_hash = KeyHash::from_hex(parts.next()?)?;
    Some((level, big_map_id, key_hash))
}

/// Parse `(level, operation_id, diff_id)` out of a per-key diff index key
pub fn parse_diff_key_index_key(key: &str) -> Option<(u64, u64, u64)> {
    let rest = key.strip_prefix(keys::DIFF_KEY_INDEX_PREFIX)?;
    let mut parts = rest.split(':');
    let _big_map_id = parts.next()?;
    let _key_hash = parts.next()?;
    let level = u64::from_str_radix(parts.next()?, 16).ok()?;
    let operation_id = u64::from_str_radix(parts.next()?, 16).ok()?;
    let diff_id = u64::from_str_radix(parts.next()?, 16).ok()?;
    Some((level, operation_id, diff_id))
}

/// Parse `(level, diff_id)` out of a per-network diff level index key
pub fn parse_diff_level_index_key(key: &str, network: &str) -> Option<(u64, u64)> {
    let rest = key.strip_prefix(keys::DIFF_LEVEL_INDEX_PREFIX)?;
    let rest = rest.strip_prefix(network)?.strip_prefix(':')?;
    let mut parts = rest.splitn(2, ':');
    let level = u64::from_str_radix(parts.next()?, 16).ok()?;
    let diff_id = u64::from_str_radix(parts.next()?, 16).ok()?;
    Some((level, diff_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_segments_sort_in_chain_order() {
        let hash = KeyHash::digest(b"k");
        let low = diff_key_index_key(1, &hash, 9, 300, 5);
        let high = diff_key_index_key(1, &hash, 10, 2, 6);
        assert!(low < high, "level 9 must sort before level 10");

        let a = diff_key_index_key(1, &hash, 10, 2, 6);
        let b = diff_key_index_key(1, &hash, 10, 30, 7);
        assert!(a < b, "operation id breaks ties within a level");
    }

    #[test]
    fn state_level_index_round_trip() {
        let hash = KeyHash::digest(b"k");
        let key = state_level_index_key("mainnet", 4095, 7, &hash);
        let (level, big_map_id, parsed) =
            parse_state_level_index_key(&key, "mainnet").unwrap();
        assert_eq!(level, 4095);
        assert_eq!(big_map_id, 7);
        assert_eq!(parsed, hash);
    }

    #[test]
    fn diff_indexes_round_trip() {
        let hash = KeyHash::digest(b"k");
        let key = diff_key_index_key(3, &hash, 15, 8, 42);
        assert_eq!(parse_diff_key_index_key(&key), Some((15, 8, 42)));

        let key = diff_level_index_key("mainnet", 15, 42);
        assert_eq!(parse_diff_level_index_key(&key, "mainnet"), Some((15, 42)));
    }

    #[test]
    fn parse_rejects_foreign_network() {
        let hash = KeyHash::digest(b"k");
        let key = state_level_index_key("mainnet", 10, 1, &hash);
        assert!(parse_state_level_index_key(&key, "ghostnet").is_none());
    }
}
