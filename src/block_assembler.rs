//! BlockAssembler: turns raw consensus-encoded block bytes into an
//! `IndexedBlock` with every output produced and every output spent
//! resolved to (address, value).
//!
//! Two passes, in this order: outputs first, then inputs. Outputs are fed
//! into the `PrevoutCache` before inputs are resolved so a transaction
//! spending an output created earlier in the same block (unconfirmed but
//! legal within a block) resolves from cache rather than a second RPC call.

use bitcoin::consensus::encode::deserialize;
use bitcoin::Block as WireBlock;

use crate::address::{self, Network};
use crate::errors::IndexerError;
use crate::metrics;
use crate::prevout_cache::PrevoutCache;
use crate::rpc::UpstreamClient;
use crate::types::{IndexedBlock, Output};

pub struct BlockAssembler {
    network: Network,
    cache: PrevoutCache,
    prevout_cache_capacity: usize,
}

impl BlockAssembler {
    pub fn new(network: Network, prevout_cache_capacity: usize) -> Self {
        BlockAssembler {
            network,
            cache: PrevoutCache::new(prevout_cache_capacity),
            prevout_cache_capacity,
        }
    }

    /// Drop every cached prevout. Called after a reorg rollback, since a
    /// reorganized chain can reintroduce inputs whose now-stale cached
    /// resolution points at an abandoned branch.
    pub fn purge_cache(&mut self) {
        self.cache = PrevoutCache::new(self.prevout_cache_capacity);
    }

    /// Decode raw block bytes and resolve every input's prevout, using
    /// `upstream` to bulk-fetch any transaction missing from the cache.
    pub fn assemble(
        &mut self,
        raw_block: &[u8],
        height: u32,
        upstream: &UpstreamClient,
    ) -> Result<IndexedBlock, IndexerError> {
        let block: WireBlock = deserialize(raw_block)
            .map_err(|e| IndexerError::ChainInconsistency(format!("bad block encoding: {}", e)))?;

        let hash = block.block_hash().to_vec();
        let hash: [u8; 32] = hash
            .try_into()
            .map_err(|_| IndexerError::ChainInconsistency("block hash not 32 bytes".into()))?;
        let prev_hash_vec = block.header.prev_blockhash.to_vec();
        let prev_hash: [u8; 32] = prev_hash_vec
            .try_into()
            .map_err(|_| IndexerError::ChainInconsistency("prev hash not 32 bytes".into()))?;

        let outputs = self.collect_outputs(&block);
        self.cache.insert_block_outputs(&outputs);

        let inputs = self.collect_inputs(&block, upstream)?;

        metrics::increment_transactions_processed(block.txdata.len() as u64);
        let (hits, misses) = self.cache.stats();
        metrics::record_prevout_cache_stats(hits, misses);

        Ok(IndexedBlock {
            hash,
            prev_hash,
            height,
            outputs,
            inputs,
        })
    }

    fn collect_outputs(&self, block: &WireBlock) -> Vec<Output> {
        let mut outputs = Vec::new();
        for tx in &block.txdata {
            let txid_vec = tx.txid().to_vec();
            let txid: [u8; 32] = match txid_vec.try_into() {
                Ok(t) => t,
                Err(_) => continue,
            };
            for (vout, txout) in tx.output.iter().enumerate() {
                let addr = address::address_from_script(self.network, &txout.script_pubkey.as_bytes());
                outputs.push(Output {
                    txid,
                    vout: vout as u32,
                    address: addr,
                    value: txout.value as i64,
                });
            }
        }
        outputs
    }

    fn collect_inputs(
        &mut self,
        block: &WireBlock,
        upstream: &UpstreamClient,
    ) -> Result<Vec<Output>, IndexerError> {
        let mut inputs = Vec::new();

        for tx in &block.txdata {
            for txin in &tx.input {
                if txin.previous_output.is_null() {
                    // Coinbase input: no real prevout to resolve.
                    continue;
                }

                let prev_txid_vec = txin.previous_output.txid.to_vec();
                let prev_txid: [u8; 32] = prev_txid_vec
                    .try_into()
                    .map_err(|_| IndexerError::ChainInconsistency("prevout txid not 32 bytes".into()))?;
                let vout = txin.previous_output.vout;

                let resolved = self.cache.get(&prev_txid, vout, upstream)?;
                inputs.push(resolved);
            }
        }

        Ok(inputs)
    }
}
