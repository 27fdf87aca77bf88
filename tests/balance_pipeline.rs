//! End-to-end scenarios against real `BalanceStore` + `BalanceCache` +
//! `BalanceProcessor` instances, each backed by a throwaway RocksDB
//! directory. Adapted from the original's `tests/test_balance.py` and
//! `tests/test_storage.py` scenario shapes.

use std::sync::Arc;
use std::thread;

use balanced_ledger::balance_cache::BalanceCache;
use balanced_ledger::balance_processor::BalanceProcessor;
use balanced_ledger::config::AppConfig;
use balanced_ledger::errors::IndexerError;
use balanced_ledger::store::BalanceStore;
use balanced_ledger::types::{IndexedBlock, Output};
use tempfile::TempDir;

fn output(addr: &str, value: i64) -> Output {
    Output {
        txid: [0; 32],
        vout: 0,
        address: Some(addr.to_string()),
        value,
    }
}

fn block(height: u32, hash: u8, prev_hash: u8, outputs: Vec<Output>, inputs: Vec<Output>) -> IndexedBlock {
    IndexedBlock {
        hash: [hash; 32],
        prev_hash: [prev_hash; 32],
        height,
        outputs,
        inputs,
    }
}

fn processor(backtrack_limit: u32, cache_size: usize) -> (BalanceProcessor, TempDir) {
    let dir = TempDir::new().unwrap();
    let mut config = AppConfig::default();
    config.db_path = dir.path().to_string_lossy().to_string();
    let store = BalanceStore::open(&config).unwrap();
    let cache = BalanceCache::new(store, cache_size).unwrap();
    (BalanceProcessor::new(backtrack_limit, cache), dir)
}

/// S1 — single-block credit: one output, nothing confirmed to the store yet.
#[test]
fn s1_single_block_credit() {
    let (p, dir) = processor(100, 10_000);
    p.add_block(block(100, 1, 0, vec![output("A", 133)], vec![])).unwrap();

    assert_eq!(p.get_balance("A").unwrap(), 133);
    assert_eq!(p.height(), 100);

    let mut config = AppConfig::default();
    config.db_path = dir.path().to_string_lossy().to_string();
    let store = BalanceStore::open(&config).unwrap();
    assert_eq!(store.get("A").unwrap(), 0);
}

/// S2 — spend within window: block 101 spends (T1,1) and splits across
/// three outputs, one of which returns change to the original address.
#[test]
fn s2_spend_within_window() {
    let (p, _dir) = processor(100, 10_000);
    p.add_block(block(100, 1, 0, vec![output("A", 133)], vec![])).unwrap();
    p.add_block(block(
        101,
        2,
        1,
        vec![output("B", 100), output("C", 3), output("A", 30)],
        vec![output("A", 133)],
    ))
    .unwrap();

    assert_eq!(p.get_balance("A").unwrap(), 30);
    assert_eq!(p.get_balance("B").unwrap(), 100);
    assert_eq!(p.get_balance("C").unwrap(), 3);
    assert_eq!(p.height(), 101);
}

/// S3 — backtrack: undo S2 then S1, then overrun the ring.
#[test]
fn s3_backtrack_unwinds_to_empty_and_then_fails() {
    let (p, _dir) = processor(100, 10_000);
    p.add_block(block(100, 1, 0, vec![output("A", 133)], vec![])).unwrap();
    p.add_block(block(
        101,
        2,
        1,
        vec![output("B", 100), output("C", 3), output("A", 30)],
        vec![output("A", 133)],
    ))
    .unwrap();

    p.backtrack().unwrap();
    assert_eq!(p.get_balance("A").unwrap(), 133);
    assert_eq!(p.get_balance("B").unwrap(), 0);
    assert_eq!(p.get_balance("C").unwrap(), 0);
    assert_eq!(p.height(), 100);

    p.backtrack().unwrap();
    assert_eq!(p.get_balance("A").unwrap(), 0);
    assert_eq!(p.height(), 0); // cache.tip_height(): nothing ever committed

    let err = p.backtrack().unwrap_err();
    assert!(matches!(err, IndexerError::BacktrackLimitReached { .. }));
}

/// S4 — confirmation into store: a block falls out of the ring once
/// `W+1` further blocks have been applied, and its deltas become durable.
/// A freshly opened processor over the same store sees the same balance.
#[test]
fn s4_confirmation_into_store_survives_reopen() {
    let backtrack_limit = 100;
    let (p, dir) = processor(backtrack_limit, 10_000);
    p.add_block(block(100, 1, 0, vec![output("A", 133)], vec![])).unwrap();

    for i in 0..(backtrack_limit + 100) {
        let h = 101 + i;
        // `BalanceProcessor::add_block` never validates hash continuity
        // (that's `ChainFollower`'s job) so a fixed placeholder hash is fine.
        p.add_block(block(h, 9, 9, vec![], vec![])).unwrap();
    }
    p.commit().unwrap();

    let mut config = AppConfig::default();
    config.db_path = dir.path().to_string_lossy().to_string();
    let store = BalanceStore::open(&config).unwrap();
    assert_eq!(store.get("A").unwrap(), 133);

    let cache = BalanceCache::new(store, 10_000).unwrap();
    let reopened = BalanceProcessor::new(backtrack_limit, cache);
    assert_eq!(reopened.get_balance("A").unwrap(), 133);
}

/// S5 — commit classification: every pending delta resolves to the right
/// insert/update/delete bucket against its durable baseline.
#[test]
fn s5_commit_classification() {
    let dir = TempDir::new().unwrap();
    let mut config = AppConfig::default();
    config.db_path = dir.path().to_string_lossy().to_string();
    let store = BalanceStore::open(&config).unwrap();
    let cache = BalanceCache::new(store, 10_000).unwrap();

    cache.update("A", 1);
    cache.update("B", 2);
    cache.commit(33).unwrap();
    assert_eq!(cache.get("A").unwrap(), 1);
    assert_eq!(cache.get("B").unwrap(), 2);

    cache.update("B", 2);
    cache.update("C", 3);
    cache.commit(44).unwrap();
    assert_eq!(cache.get("B").unwrap(), 4);
    assert_eq!(cache.get("C").unwrap(), 3);

    cache.update("D", 4);
    cache.update("C", 1);
    cache.update("A", -1);
    cache.commit(55).unwrap();
    assert_eq!(cache.get("D").unwrap(), 4);
    assert_eq!(cache.get("C").unwrap(), 4);
    assert_eq!(cache.get("A").unwrap(), 0);
    assert_eq!(cache.tip_height(), 55);
}

/// S6 — concurrent readers during commit: readers never observe a value
/// outside {old, new}, and no panic escapes a reader.
#[test]
fn s6_concurrent_readers_during_commit() {
    const N: i64 = 500;

    let dir = TempDir::new().unwrap();
    let mut config = AppConfig::default();
    config.db_path = dir.path().to_string_lossy().to_string();
    let store = BalanceStore::open(&config).unwrap();
    let cache = Arc::new(BalanceCache::new(store, 10_000).unwrap());

    for i in 0..N {
        cache.update(&format!("addr-{}", i), i + 1);
    }
    cache.commit(1).unwrap();

    let mut readers = Vec::new();
    for t in 0..8 {
        let cache = cache.clone();
        readers.push(thread::spawn(move || {
            for _ in 0..40 {
                for i in 0..N {
                    let addr = format!("addr-{}", i);
                    let value = cache.get(&addr).unwrap();
                    assert!(
                        value == i + 1 || value == 2 * (i + 1),
                        "reader {} saw unexpected value {} for {}",
                        t,
                        value,
                        addr
                    );
                }
            }
        }));
    }

    for i in 0..N {
        cache.update(&format!("addr-{}", i), i + 1);
    }
    cache.commit(2).unwrap();

    for reader in readers {
        reader.join().expect("reader thread panicked");
    }

    for i in 0..N {
        assert_eq!(cache.get(&format!("addr-{}", i)).unwrap(), 2 * (i + 1));
    }
}
