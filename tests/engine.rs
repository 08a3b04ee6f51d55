//! End-to-end engine tests: ingestion, queries, and rollback

use bigmap_index::{
    AllocationInput, BigMapIndex, BigMapIndexError, DiffInput, IndexConfig, KeyHash, Page,
    StateLookup,
};
use tempfile::{tempdir, TempDir};

const NETWORK: &str = "mainnet";
const CONTRACT: &str = "KT1TestContract";
const POINTER: i64 = 7;

async fn open_engine() -> (BigMapIndex, TempDir) {
    let dir = tempdir().unwrap();
    let config = IndexConfig {
        db_path: dir.path().to_str().unwrap().to_string(),
        ..IndexConfig::default()
    };
    let engine = BigMapIndex::new(config).await.unwrap();
    (engine, dir)
}

async fn allocate(engine: &BigMapIndex) {
    engine
        .allocate(AllocationInput {
            network: NETWORK.to_string(),
            contract: CONTRACT.to_string(),
            pointer: POINTER,
            key_type: b"string".to_vec(),
            value_type: b"bytes".to_vec(),
            level: 1,
            timestamp: 1_700_000_001,
        })
        .await
        .unwrap();
}

fn diff_input(key: &[u8], value: Option<&[u8]>, level: u64, operation_id: u64) -> DiffInput {
    DiffInput {
        network: NETWORK.to_string(),
        contract: CONTRACT.to_string(),
        pointer: POINTER,
        key_hash: None,
        key: key.to_vec(),
        value: value.map(|v| v.to_vec()),
        level,
        operation_id,
        timestamp: 1_700_000_000 + level,
        protocol_id: 1,
    }
}

#[tokio::test]
async fn unknown_big_map_is_an_invalid_reference() {
    let (engine, _dir) = open_engine().await;
    let err = engine
        .apply_diff(diff_input(b"k", Some(b"v"), 10, 0))
        .await
        .unwrap_err();
    assert!(matches!(err, BigMapIndexError::InvalidReference(_)));
}

#[tokio::test]
async fn allocation_is_idempotent() {
    let (engine, _dir) = open_engine().await;
    allocate(&engine).await;
    allocate(&engine).await;
    let big_map = engine.get_big_map(NETWORK, POINTER).await.unwrap().unwrap();
    assert_eq!(big_map.contract, CONTRACT);
    assert_eq!(big_map.created_level, 1);
}

#[tokio::test]
async fn reallocation_under_another_contract_is_rejected() {
    let (engine, _dir) = open_engine().await;
    allocate(&engine).await;
    let err = engine
        .allocate(AllocationInput {
            network: NETWORK.to_string(),
            contract: "KT1SomebodyElse".to_string(),
            pointer: POINTER,
            key_type: b"string".to_vec(),
            value_type: b"bytes".to_vec(),
            level: 2,
            timestamp: 1_700_000_002,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, BigMapIndexError::InvalidReference(_)));
}

#[tokio::test]
async fn n_diffs_track_max_level_and_count() {
    let (engine, _dir) = open_engine().await;
    allocate(&engine).await;

    let levels = [10u64, 10, 12, 15, 15, 20];
    let mut state = None;
    for (n, level) in levels.iter().enumerate() {
        state = Some(
            engine
                .apply_diff(diff_input(b"k", Some(b"v"), *level, n as u64))
                .await
                .unwrap(),
        );
    }
    let state = state.unwrap();
    assert_eq!(state.last_update_level, 20);
    assert_eq!(state.count, levels.len() as u64);
}

#[tokio::test]
async fn out_of_order_diff_is_rejected() {
    let (engine, _dir) = open_engine().await;
    allocate(&engine).await;

    engine
        .apply_diff(diff_input(b"k", Some(b"a"), 15, 3))
        .await
        .unwrap();
    let err = engine
        .apply_diff(diff_input(b"k", Some(b"b"), 10, 0))
        .await
        .unwrap_err();
    assert!(matches!(err, BigMapIndexError::OutOfOrderDiff { .. }));

    // The rejected diff must leave no trace behind.
    let key_hash = KeyHash::digest(b"k");
    let history = engine
        .get_history(NETWORK, POINTER, &key_hash, Page::default())
        .await
        .unwrap();
    assert_eq!(history.total, 1);
}

#[tokio::test]
async fn state_lookup_reports_active_removed_and_missing() {
    let (engine, _dir) = open_engine().await;
    allocate(&engine).await;

    engine
        .apply_diff(diff_input(b"present", Some(b"v1"), 10, 0))
        .await
        .unwrap();
    engine
        .apply_diff(diff_input(b"gone", Some(b"v2"), 10, 1))
        .await
        .unwrap();
    engine
        .apply_diff(diff_input(b"gone", None, 11, 0))
        .await
        .unwrap();

    let present = engine
        .get_state(NETWORK, POINTER, &KeyHash::digest(b"present"))
        .await
        .unwrap();
    assert_eq!(present, StateLookup::Active(b"v1".to_vec()));

    let gone = engine
        .get_state(NETWORK, POINTER, &KeyHash::digest(b"gone"))
        .await
        .unwrap();
    assert_eq!(gone, StateLookup::Removed(Some(b"v2".to_vec())));

    let missing = engine
        .get_state(NETWORK, POINTER, &KeyHash::digest(b"never"))
        .await
        .unwrap();
    assert_eq!(missing, StateLookup::NotFound);
}

#[tokio::test]
async fn history_pages_descend_in_chain_order() {
    let (engine, _dir) = open_engine().await;
    allocate(&engine).await;

    for (n, level) in [10u64, 11, 12, 13, 14].iter().enumerate() {
        engine
            .apply_diff(diff_input(b"k", Some(b"v"), *level, n as u64))
            .await
            .unwrap();
    }

    let key_hash = KeyHash::digest(b"k");
    let first = engine
        .get_history(
            NETWORK,
            POINTER,
            &key_hash,
            Page {
                offset: 0,
                limit: 2,
            },
        )
        .await
        .unwrap();
    assert_eq!(first.total, 5);
    assert!(first.has_more);
    let levels: Vec<u64> = first.diffs.iter().map(|d| d.level).collect();
    assert_eq!(levels, vec![14, 13]);

    let last = engine
        .get_history(
            NETWORK,
            POINTER,
            &key_hash,
            Page {
                offset: 4,
                limit: 2,
            },
        )
        .await
        .unwrap();
    assert_eq!(last.diffs.len(), 1);
    assert_eq!(last.diffs[0].level, 10);
    assert!(!last.has_more);
}

#[tokio::test]
async fn stats_count_total_and_active_keys() {
    let (engine, _dir) = open_engine().await;
    allocate(&engine).await;

    engine
        .apply_diff(diff_input(b"a", Some(b"1"), 10, 0))
        .await
        .unwrap();
    engine
        .apply_diff(diff_input(b"b", Some(b"2"), 10, 1))
        .await
        .unwrap();
    engine
        .apply_diff(diff_input(b"b", None, 11, 0))
        .await
        .unwrap();

    let stats = engine.get_stats(NETWORK, POINTER).await.unwrap();
    assert_eq!(stats.total_keys, 2);
    assert_eq!(stats.active_keys, 1);
}

#[tokio::test]
async fn changed_since_feeds_invalidation() {
    let (engine, _dir) = open_engine().await;
    allocate(&engine).await;

    engine
        .apply_diff(diff_input(b"old", Some(b"1"), 10, 0))
        .await
        .unwrap();
    engine
        .apply_diff(diff_input(b"new", Some(b"2"), 20, 0))
        .await
        .unwrap();

    let changed = engine.changed_since(NETWORK, 10).await.unwrap();
    assert_eq!(changed.len(), 1);
    assert_eq!(changed[0].key, b"new".to_vec());

    assert!(engine.changed_since(NETWORK, 20).await.unwrap().is_empty());
    assert_eq!(engine.changed_since(NETWORK, 0).await.unwrap().len(), 2);
}

/// The concrete reorg scenario: key K at [10 -> A, 10 -> B, 15 -> removed].
#[tokio::test]
async fn rollback_restores_the_level_ten_view() {
    let (engine, _dir) = open_engine().await;
    allocate(&engine).await;

    engine
        .apply_diff(diff_input(b"K", Some(b"A"), 10, 0))
        .await
        .unwrap();
    engine
        .apply_diff(diff_input(b"K", Some(b"B"), 10, 1))
        .await
        .unwrap();
    let after_ingest = engine
        .apply_diff(diff_input(b"K", None, 15, 0))
        .await
        .unwrap();
    assert_eq!(after_ingest.value.as_deref(), Some(&b"B"[..]));
    assert!(after_ingest.removed);
    assert_eq!(after_ingest.count, 3);
    assert_eq!(after_ingest.last_update_level, 15);

    let outcome = engine.rollback_to(NETWORK, 10).await.unwrap();
    assert_eq!(outcome.states_restored, 1);
    assert_eq!(outcome.states_deleted, 0);
    assert_eq!(outcome.diffs_discarded, 1);

    let key_hash = KeyHash::digest(b"K");
    let restored = engine
        .get_state(NETWORK, POINTER, &key_hash)
        .await
        .unwrap();
    assert_eq!(restored, StateLookup::Active(b"B".to_vec()));

    let history = engine
        .get_history(NETWORK, POINTER, &key_hash, Page::default())
        .await
        .unwrap();
    assert_eq!(history.total, 2, "the level 15 diff row must be deleted");
    assert_eq!(history.diffs[0].level, 10);

    let changed = engine.changed_since(NETWORK, 9).await.unwrap();
    assert_eq!(changed.len(), 1);
    assert_eq!(changed[0].count, 2);
    assert!(!changed[0].removed);
    assert_eq!(changed[0].last_update_level, 10);
}

#[tokio::test]
async fn rollback_before_creation_deletes_the_state() {
    let (engine, _dir) = open_engine().await;
    allocate(&engine).await;

    engine
        .apply_diff(diff_input(b"late", Some(b"v"), 50, 0))
        .await
        .unwrap();
    engine
        .apply_diff(diff_input(b"late", Some(b"w"), 51, 0))
        .await
        .unwrap();

    let outcome = engine.rollback_to(NETWORK, 40).await.unwrap();
    assert_eq!(outcome.states_restored, 0);
    assert_eq!(outcome.states_deleted, 1);
    assert_eq!(outcome.diffs_discarded, 2);

    let lookup = engine
        .get_state(NETWORK, POINTER, &KeyHash::digest(b"late"))
        .await
        .unwrap();
    assert_eq!(lookup, StateLookup::NotFound);

    let history = engine
        .get_history(NETWORK, POINTER, &KeyHash::digest(b"late"), Page::default())
        .await
        .unwrap();
    assert_eq!(history.total, 0);
}

#[tokio::test]
async fn rollback_decrements_count_by_discarded_rows() {
    let (engine, _dir) = open_engine().await;
    allocate(&engine).await;

    engine
        .apply_diff(diff_input(b"k", Some(b"base"), 10, 0))
        .await
        .unwrap();
    // One block at level 20 carrying three diffs for the same key.
    let block: Vec<_> = (0..3u64)
        .map(|operation_id| diff_input(b"k", Some(b"hot"), 20, operation_id))
        .collect();
    let states = engine.apply_block(NETWORK, block).await.unwrap();
    assert_eq!(states.last().unwrap().count, 4);

    let outcome = engine.rollback_to(NETWORK, 10).await.unwrap();
    assert_eq!(outcome.diffs_discarded, 3);

    let changed = engine.changed_since(NETWORK, 0).await.unwrap();
    assert_eq!(changed.len(), 1);
    assert_eq!(changed[0].count, 1, "count drops by the three discarded rows");
    assert_eq!(changed[0].value.as_deref(), Some(&b"base"[..]));
}

#[tokio::test]
async fn rollback_is_idempotent() {
    let (engine, _dir) = open_engine().await;
    allocate(&engine).await;

    engine
        .apply_diff(diff_input(b"k", Some(b"a"), 10, 0))
        .await
        .unwrap();
    engine
        .apply_diff(diff_input(b"k", Some(b"b"), 20, 0))
        .await
        .unwrap();

    let first = engine.rollback_to(NETWORK, 10).await.unwrap();
    assert_eq!(first.states_restored, 1);
    assert_eq!(first.diffs_discarded, 1);

    let second = engine.rollback_to(NETWORK, 10).await.unwrap();
    assert_eq!(second.states_restored, 0);
    assert_eq!(second.states_deleted, 0);
    assert_eq!(second.diffs_discarded, 0);
}

#[tokio::test]
async fn rollback_then_replay_matches_a_straight_fold() {
    let (engine, _dir) = open_engine().await;
    allocate(&engine).await;

    let script = [
        (10u64, Some(&b"a"[..])),
        (11, Some(b"b")),
        (12, None),
        (13, Some(b"c")),
        (14, None),
    ];
    let mut direct = None;
    for (level, value) in script {
        direct = Some(
            engine
                .apply_diff(diff_input(b"k", value, level, 0))
                .await
                .unwrap(),
        );
    }
    let direct = direct.unwrap();

    engine.rollback_to(NETWORK, 12).await.unwrap();
    let mut replayed = None;
    for (level, value) in &script[3..] {
        replayed = Some(
            engine
                .apply_diff(diff_input(b"k", *value, *level, 0))
                .await
                .unwrap(),
        );
    }
    let replayed = replayed.unwrap();

    assert_eq!(replayed.value, direct.value);
    assert_eq!(replayed.removed, direct.removed);
    assert_eq!(replayed.count, direct.count);
    assert_eq!(replayed.last_update_level, direct.last_update_level);
}

#[tokio::test]
async fn rollback_targets_one_network_only() {
    let dir = tempdir().unwrap();
    let config = IndexConfig {
        db_path: dir.path().to_str().unwrap().to_string(),
        ..IndexConfig::default()
    };
    let engine = BigMapIndex::new(config).await.unwrap();

    for network in ["mainnet", "ghostnet"] {
        engine
            .allocate(AllocationInput {
                network: network.to_string(),
                contract: CONTRACT.to_string(),
                pointer: POINTER,
                key_type: b"string".to_vec(),
                value_type: b"bytes".to_vec(),
                level: 1,
                timestamp: 1_700_000_001,
            })
            .await
            .unwrap();
        let mut input = diff_input(b"k", Some(b"v"), 50, 0);
        input.network = network.to_string();
        engine.apply_diff(input).await.unwrap();
    }

    let outcome = engine.rollback_to("mainnet", 10).await.unwrap();
    assert_eq!(outcome.states_deleted, 1);
    assert_eq!(outcome.diffs_discarded, 1);

    // The other network's view is untouched.
    let ghost = engine
        .get_state("ghostnet", POINTER, &KeyHash::digest(b"k"))
        .await
        .unwrap();
    assert_eq!(ghost, StateLookup::Active(b"v".to_vec()));
}

#[tokio::test]
async fn removal_history_survives_rollback_for_display() {
    let (engine, _dir) = open_engine().await;
    allocate(&engine).await;

    engine
        .apply_diff(diff_input(b"k", Some(b"shown"), 10, 0))
        .await
        .unwrap();
    engine
        .apply_diff(diff_input(b"k", None, 11, 0))
        .await
        .unwrap();
    engine
        .apply_diff(diff_input(b"k", Some(b"later"), 12, 0))
        .await
        .unwrap();

    // Roll back to the removal: the restored row is removed but still
    // carries the last value seen before it.
    engine.rollback_to(NETWORK, 11).await.unwrap();
    let lookup = engine
        .get_state(NETWORK, POINTER, &KeyHash::digest(b"k"))
        .await
        .unwrap();
    assert_eq!(lookup, StateLookup::Removed(Some(b"shown".to_vec())));
}
