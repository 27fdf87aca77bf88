//! BalanceProcessor: the recent-blocks ring and its pending per-address
//! deltas. Applying a block immediately makes its effect visible to
//! `get_balance`; only once a block falls off the back of the ring (past
//! `backtrack_limit`) is it folded into `BalanceCache` and forgotten here.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::balance_cache::BalanceCache;
use crate::errors::IndexerError;
use crate::metrics;
use crate::types::IndexedBlock;

/// One address's net effect within a single tracked block, kept so
/// `backtrack()` can undo exactly what `add_block()` applied.
struct Record {
    address: String,
    value: i64,
}

struct TrackedBlock {
    height: u32,
    hash: [u8; 32],
    records: Vec<Record>,
}

struct Inner {
    blocks: VecDeque<TrackedBlock>,
    pending_balance: std::collections::HashMap<String, i64>,
}

pub struct BalanceProcessor {
    backtrack_limit: u32,
    cache: BalanceCache,
    inner: Mutex<Inner>,
    commit_threshold_pending: usize,
    commit_threshold_age: Duration,
    last_commit: Mutex<Instant>,
}

/// Per-block (address, signed value) records: outputs first (so a
/// balance never briefly goes negative from reordering), then inputs,
/// skipping coinbase inputs which have no resolvable prevout.
fn block_records(block: &IndexedBlock) -> Vec<(String, i64)> {
    let mut records = Vec::new();

    for output in &block.outputs {
        if let Some(addr) = &output.address {
            records.push((addr.clone(), output.value));
        }
    }

    for input in &block.inputs {
        if let Some(addr) = &input.address {
            records.push((addr.clone(), -input.value));
        }
    }

    records
}

impl BalanceProcessor {
    pub fn new(backtrack_limit: u32, cache: BalanceCache) -> Self {
        BalanceProcessor {
            backtrack_limit,
            cache,
            inner: Mutex::new(Inner {
                blocks: VecDeque::new(),
                pending_balance: std::collections::HashMap::new(),
            }),
            commit_threshold_pending: 30_000,
            commit_threshold_age: Duration::from_secs(30),
            last_commit: Mutex::new(Instant::now()),
        }
    }

    fn mark_committed(&self) {
        *self.last_commit.lock().unwrap() = Instant::now();
    }

    fn add_record(inner: &mut Inner, tracked: &mut TrackedBlock, address: String, value: i64) {
        let entry = inner.pending_balance.entry(address.clone()).or_insert(0);
        *entry += value;
        if *entry == 0 {
            inner.pending_balance.remove(&address);
        }
        tracked.records.push(Record { address, value });
    }

    fn undo_records(inner: &mut Inner, tracked: &TrackedBlock) {
        for record in &tracked.records {
            let entry = inner
                .pending_balance
                .entry(record.address.clone())
                .or_insert(0);
            *entry -= record.value;
            if *entry == 0 {
                inner.pending_balance.remove(&record.address);
            }
        }
    }

    /// Append the next block in chain order. If the ring now exceeds
    /// `backtrack_limit`, the oldest tracked block is folded into
    /// `BalanceCache` and dropped from the ring under the same lock that
    /// undid its records, so a concurrent reader never sees a gap where
    /// the block's delta has vanished from both the ring and the cache. A
    /// store commit is then triggered opportunistically once enough
    /// deltas have piled up, or once enough time has passed since the
    /// last one.
    pub fn add_block(&self, block: IndexedBlock) -> Result<(), IndexerError> {
        let overflow = {
            let mut inner = self.inner.lock().unwrap();
            let mut tracked = TrackedBlock {
                height: block.height,
                hash: block.hash,
                records: Vec::new(),
            };
            for (address, value) in block_records(&block) {
                Self::add_record(&mut inner, &mut tracked, address, value);
            }
            inner.blocks.push_back(tracked);
            inner.blocks.len() > self.backtrack_limit as usize
        };

        if overflow {
            let mut inner = self.inner.lock().unwrap();
            if let Some(oldest) = inner.blocks.pop_front() {
                Self::undo_records(&mut inner, &oldest);
                for record in &oldest.records {
                    self.cache.update(&record.address, record.value);
                }
            }
        }

        let should_commit = self.cache.pending_len() > self.commit_threshold_pending
            || self.last_commit.lock().unwrap().elapsed() > self.commit_threshold_age;
        if should_commit {
            let tail_height = {
                let inner = self.inner.lock().unwrap();
                inner.blocks.front().map(|b| b.height.saturating_sub(1))
            };
            if let Some(height) = tail_height {
                self.cache.commit(height)?;
                self.mark_committed();
            }
        }

        metrics::increment_blocks_processed();
        metrics::set_chain_tip_height(self.height());
        metrics::set_ring_depth(self.ring_depth());

        Ok(())
    }

    /// Undo the most recently applied block. Returns `BacktrackLimitReached`
    /// if the ring is empty — a deeper reorg than the tracked window can
    /// absorb.
    pub fn backtrack(&self) -> Result<(), IndexerError> {
        let mut inner = self.inner.lock().unwrap();
        let block = inner.blocks.pop_back().ok_or(IndexerError::BacktrackLimitReached {
            limit: self.backtrack_limit,
        })?;
        Self::undo_records(&mut inner, &block);
        drop(inner);
        metrics::increment_reorg_events();
        metrics::set_ring_depth(self.ring_depth());
        Ok(())
    }

    /// Current balance: committed store balance plus every pending delta
    /// across the tracked ring. Safe to call concurrently with
    /// `add_block`/`backtrack`/`commit`.
    pub fn get_balance(&self, address: &str) -> Result<i64, IndexerError> {
        let inner = self.inner.lock().unwrap();
        Ok(self.cache.get(address)? + *inner.pending_balance.get(address).unwrap_or(&0))
    }

    /// Force a store commit up through the block just behind the ring's
    /// tail (i.e. everything the ring no longer needs to be able to
    /// backtrack).
    pub fn commit(&self) -> Result<(), IndexerError> {
        let tail_height = {
            let inner = self.inner.lock().unwrap();
            inner.blocks.front().map(|b| b.height.saturating_sub(1))
        };
        if let Some(height) = tail_height {
            self.cache.commit(height)?;
            self.mark_committed();
        }
        Ok(())
    }

    /// Tail block's height if the ring is non-empty, otherwise the
    /// durable cache tip.
    pub fn height(&self) -> u32 {
        let inner = self.inner.lock().unwrap();
        match inner.blocks.back() {
            Some(block) => block.height,
            None => self.cache.tip_height(),
        }
    }

    pub fn ring_depth(&self) -> usize {
        self.inner.lock().unwrap().blocks.len()
    }

    /// Hash of the tail block, used by `ChainFollower` to detect a reorg
    /// against the next fetched block's `prev_hash`. `None` when the ring
    /// is empty (nothing to compare against yet).
    pub fn tip_hash(&self) -> Option<[u8; 32]> {
        self.inner.lock().unwrap().blocks.back().map(|b| b.hash)
    }
}
