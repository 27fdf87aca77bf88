//! PrevoutCache: LRU cache of resolved transaction outputs, keyed by
//! (txid, vout), used to resolve the address+value of a spent output
//! without a network round trip on every input.

use lru::LruCache;
use std::num::NonZeroUsize;

use crate::errors::IndexerError;
use crate::types::Output;

/// Anything `PrevoutCache` can ask to resolve a transaction's full output
/// set on a cache miss. `UpstreamClient` implements this; tests use a
/// canned stand-in so a miss doesn't require a live node.
pub trait OutputSource {
    fn fetch_transaction_outputs(&self, txid: &[u8; 32]) -> Result<Vec<Output>, IndexerError>;
}

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub struct OutPointKey {
    pub txid: [u8; 32],
    pub vout: u32,
}

#[derive(Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

pub struct PrevoutCache {
    entries: LruCache<OutPointKey, Output>,
    stats: CacheStats,
}

impl PrevoutCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(1).unwrap());
        PrevoutCache {
            entries: LruCache::new(capacity),
            stats: CacheStats::default(),
        }
    }

    /// Insert every output of a just-assembled block, so later transactions
    /// in the same block (or later blocks) can resolve them as prevouts
    /// without re-fetching the source transaction.
    pub fn insert_block_outputs(&mut self, outputs: &[Output]) {
        for output in outputs {
            self.entries.put(
                OutPointKey {
                    txid: output.txid,
                    vout: output.vout,
                },
                output.clone(),
            );
        }
    }

    /// Look up a single prevout, bulk-fetching and caching its owning
    /// transaction's outputs from `source` on a miss.
    pub fn get<S: OutputSource>(
        &mut self,
        txid: &[u8; 32],
        vout: u32,
        source: &S,
    ) -> Result<Output, IndexerError> {
        let key = OutPointKey { txid: *txid, vout };
        if let Some(output) = self.entries.get(&key) {
            self.stats.hits += 1;
            return Ok(output.clone());
        }

        self.stats.misses += 1;
        let fetched = source.fetch_transaction_outputs(txid)?;
        self.insert_block_outputs(&fetched);

        self.entries.get(&key).cloned().ok_or_else(|| {
            IndexerError::ChainInconsistency(format!(
                "unknown prevout {}:{}",
                hex::encode(txid),
                vout
            ))
        })
    }

    pub fn stats(&self) -> (u64, u64) {
        (self.stats.hits, self.stats.misses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(txid: u8, vout: u32, value: i64) -> Output {
        Output {
            txid: [txid; 32],
            vout,
            address: Some(format!("addr-{}", txid)),
            value,
        }
    }

    /// Canned source: answers one fixed transaction's outputs, regardless
    /// of the txid asked for, or errors if told to.
    struct FakeSource {
        outputs: Vec<Output>,
        fail: bool,
    }

    impl OutputSource for FakeSource {
        fn fetch_transaction_outputs(&self, _txid: &[u8; 32]) -> Result<Vec<Output>, IndexerError> {
            if self.fail {
                return Err(IndexerError::UpstreamUnavailable("no node".into()));
            }
            Ok(self.outputs.clone())
        }
    }

    #[test]
    fn miss_then_fetch_then_hit() {
        let mut cache = PrevoutCache::new(10);
        let source = FakeSource {
            outputs: vec![output(1, 0, 500)],
            fail: false,
        };

        let out = cache.get(&[1; 32], 0, &source).unwrap();
        assert_eq!(out.value, 500);

        // Second lookup hits the cache and never calls the source again.
        let fail_source = FakeSource {
            outputs: vec![],
            fail: true,
        };
        let out = cache.get(&[1; 32], 0, &fail_source).unwrap();
        assert_eq!(out.value, 500);

        let (hits, misses) = cache.stats();
        assert_eq!(hits, 1);
        assert_eq!(misses, 1);
    }

    #[test]
    fn miss_with_unresolvable_vout_is_chain_inconsistency() {
        let mut cache = PrevoutCache::new(10);
        let source = FakeSource {
            outputs: vec![output(1, 0, 500)],
            fail: false,
        };

        let err = cache.get(&[1; 32], 7, &source).unwrap_err();
        assert!(matches!(err, IndexerError::ChainInconsistency(_)));
    }

    #[test]
    fn source_error_propagates() {
        let mut cache = PrevoutCache::new(10);
        let source = FakeSource {
            outputs: vec![],
            fail: true,
        };

        let err = cache.get(&[1; 32], 0, &source).unwrap_err();
        assert!(matches!(err, IndexerError::UpstreamUnavailable(_)));
    }

    #[test]
    fn evicts_oldest_entry_past_capacity() {
        let mut cache = PrevoutCache::new(2);
        cache.insert_block_outputs(&[output(1, 0, 1), output(2, 0, 2)]);
        // Touch entry 1 so entry 2 becomes the least-recently-used one.
        let source = FakeSource {
            outputs: vec![output(1, 0, 1)],
            fail: false,
        };
        cache.get(&[1; 32], 0, &source).unwrap();
        cache.insert_block_outputs(&[output(3, 0, 3)]);

        assert!(cache.entries.peek(&OutPointKey { txid: [2; 32], vout: 0 }).is_none());
        assert!(cache.entries.peek(&OutPointKey { txid: [1; 32], vout: 0 }).is_some());
    }
}
