//! BalanceCache: write-back cache sitting in front of `BalanceStore`.
//! Reads merge a cached base balance with any pending delta; writes only
//! accumulate a delta until `commit()` flushes everything to the store in
//! one atomic transaction.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;

use crate::errors::IndexerError;
use crate::metrics;
use crate::store::BalanceStore;

struct Inner {
    // Capacity set far above `max_cache` so eviction never happens inside
    // a `put`/`get` call — trimming is always an explicit step below, so
    // it can be suspended for the duration of a commit.
    base: LruCache<String, i64>,
    pending: HashMap<String, i64>,
    tip_height: u32,
    trim_enabled: bool,
}

pub struct BalanceCache {
    store: BalanceStore,
    max_cache: usize,
    inner: Mutex<Inner>,
}

impl BalanceCache {
    pub fn new(store: BalanceStore, max_cache: usize) -> Result<Self, IndexerError> {
        let tip_height = store.height()?;
        Ok(BalanceCache {
            store,
            max_cache,
            inner: Mutex::new(Inner {
                base: LruCache::unbounded(),
                pending: HashMap::new(),
                tip_height,
                trim_enabled: true,
            }),
        })
    }

    pub fn tip_height(&self) -> u32 {
        self.inner.lock().unwrap().tip_height
    }

    /// Number of addresses with an uncommitted delta.
    pub fn pending_len(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }

    fn trim(&self, inner: &mut Inner) {
        if !inner.trim_enabled {
            return;
        }
        while inner.base.len() > self.max_cache {
            inner.base.pop_lru();
        }
    }

    fn load_one(&self, inner: &mut Inner, address: &str) -> Result<i64, IndexerError> {
        if let Some(value) = inner.base.get(address) {
            metrics::increment_balance_cache_hit();
            return Ok(*value);
        }
        metrics::increment_balance_cache_miss();
        let value = self.store.get(address)?;
        inner.base.put(address.to_string(), value);
        self.trim(inner);
        Ok(value)
    }

    fn load_bulk(&self, inner: &mut Inner, addresses: &[String]) -> Result<(), IndexerError> {
        let to_load: Vec<String> = addresses
            .iter()
            .filter(|a| inner.base.get(a.as_str()).is_none())
            .cloned()
            .collect();

        if !to_load.is_empty() {
            let stored = self.store.get_bulk(&to_load)?;
            for addr in &to_load {
                let value = stored.get(addr).copied().unwrap_or(0);
                inner.base.put(addr.clone(), value);
            }
        }

        self.trim(inner);
        Ok(())
    }

    /// Current balance: cached base plus any uncommitted delta.
    pub fn get(&self, address: &str) -> Result<i64, IndexerError> {
        let mut inner = self.inner.lock().unwrap();
        let base = self.load_one(&mut inner, address)?;
        let delta = *inner.pending.get(address).unwrap_or(&0);
        Ok(base + delta)
    }

    /// Accumulate a signed delta against an address's pending balance.
    /// Not durable until `commit()`.
    pub fn update(&self, address: &str, value: i64) {
        if value == 0 {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.pending.entry(address.to_string()).or_insert(0);
        *entry += value;
        if *entry == 0 {
            inner.pending.remove(address);
        }
    }

    /// Flush every pending delta to the durable store as a single atomic
    /// transaction at `height`. No-op if `height` matches the last commit.
    /// Cache trimming is disabled for the duration of the commit so a
    /// concurrent `get()` can't have its freshly loaded base evicted out
    /// from under it before the merge step runs.
    pub fn commit(&self, height: u32) -> Result<(), IndexerError> {
        {
            let inner = self.inner.lock().unwrap();
            if height == inner.tip_height {
                return Ok(());
            }
        }

        let (to_insert, to_update, to_delete, pending_snapshot) = {
            let mut inner = self.inner.lock().unwrap();
            inner.trim_enabled = false;
            inner.tip_height = height;

            let pending_addrs: Vec<String> = inner.pending.keys().cloned().collect();
            self.load_bulk(&mut inner, &pending_addrs)?;

            let mut to_insert = HashMap::new();
            let mut to_update = HashMap::new();
            let mut to_delete = Vec::new();

            for (addr, delta) in inner.pending.iter() {
                let stored = inner.base.peek(addr).copied().unwrap_or(0);
                let new_value = stored + delta;
                if stored == 0 {
                    to_insert.insert(addr.clone(), new_value);
                } else if new_value == 0 {
                    to_delete.push(addr.clone());
                } else {
                    to_update.insert(addr.clone(), new_value);
                }
            }

            let pending_snapshot = std::mem::take(&mut inner.pending);
            (to_insert, to_update, to_delete, pending_snapshot)
        };

        // Merge deltas into the cached base without holding the lock
        // across the store write.
        {
            let mut inner = self.inner.lock().unwrap();
            for (addr, delta) in &pending_snapshot {
                let current = inner.base.peek(addr).copied().unwrap_or(0);
                inner.base.put(addr.clone(), current + delta);
            }
        }

        self.store
            .update(&to_insert, &to_update, &to_delete, height)?;

        let mut inner = self.inner.lock().unwrap();
        inner.trim_enabled = true;
        self.trim(&mut inner);
        Ok(())
    }
}
