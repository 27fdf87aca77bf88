//! ChainFollower: the sequential block prefetcher and driver loop that
//! keeps `BalanceProcessor` converged with the live chain.
//!
//! Two plain OS threads, matching the original's `threading.Thread`-based
//! `BitcoinBalanceFacade`: a prefetcher that blocks on RPC calls and fills a
//! bounded channel, and a driver that drains it, assembles each block, and
//! applies it to (or backtracks) the processor. The driver never blocks the
//! prefetcher for longer than the channel capacity allows, and the
//! prefetcher never races ahead of it by more than that same bound.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{info, warn};

use crate::address::Network;
use crate::balance_processor::BalanceProcessor;
use crate::block_assembler::BlockAssembler;
use crate::config::AppConfig;
use crate::errors::IndexerError;
use crate::metrics;
use crate::rpc::UpstreamClient;

struct PrefetchedBlock {
    height: u32,
    raw: Vec<u8>,
}

/// Drives the pipeline: `node -> ChainFollower -> BlockAssembler -> BalanceProcessor`.
pub struct ChainFollower {
    upstream: Arc<UpstreamClient>,
    processor: Arc<BalanceProcessor>,
    stop: Arc<AtomicBool>,
    poll_period: Duration,
    reconnect_period: Duration,
    prefetch_depth: usize,
    network: Network,
    prevout_cache_capacity: usize,
    fast_sync: bool,
}

impl ChainFollower {
    pub fn new(
        config: &AppConfig,
        upstream: Arc<UpstreamClient>,
        processor: Arc<BalanceProcessor>,
    ) -> Self {
        ChainFollower {
            upstream,
            processor,
            stop: Arc::new(AtomicBool::new(false)),
            poll_period: Duration::from_secs(config.upstream_poll_period_secs),
            reconnect_period: Duration::from_secs(config.upstream_reconnect_period_secs),
            prefetch_depth: config.prefetch_depth,
            network: Network::from_chain_name(&config.chain),
            prevout_cache_capacity: config.prevout_cache_size,
            fast_sync: config.fast_sync,
        }
    }

    /// A clone of the stop flag callers can set from a signal handler to
    /// request a graceful shutdown.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Run the prefetcher and driver to completion (i.e. until `stop_handle`
    /// is set), then drain in-flight work and commit. Blocks the calling
    /// thread — callers typically run this via `spawn_blocking`.
    pub fn run(&self) -> Result<(), IndexerError> {
        let start_height = self.processor.height() + 1;
        let next_fetch_height = Arc::new(AtomicU32::new(start_height));

        let (block_tx, block_rx) = mpsc::sync_channel::<PrefetchedBlock>(self.prefetch_depth);
        let (seek_tx, seek_rx) = mpsc::channel::<u32>();

        let prefetcher = self.spawn_prefetcher(block_tx, seek_rx, next_fetch_height.clone());

        let result = self.drive(block_rx, seek_tx, next_fetch_height);

        self.stop.store(true, Ordering::SeqCst);
        let _ = prefetcher.join();

        // Drain-and-commit on clean shutdown: fold whatever is left in the
        // ring back to the store up through the last block the ring no
        // longer needs for backtrack.
        self.processor.commit()?;

        result
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    fn spawn_prefetcher(
        &self,
        block_tx: mpsc::SyncSender<PrefetchedBlock>,
        seek_rx: mpsc::Receiver<u32>,
        next_fetch_height: Arc<AtomicU32>,
    ) -> JoinHandle<()> {
        let upstream = self.upstream.clone();
        let stop = self.stop.clone();
        let poll_period = self.poll_period;
        let reconnect_period = self.reconnect_period;

        thread::spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                // A reorg detected by the driver re-seeks us to a new
                // height; the most recent seek wins.
                while let Ok(height) = seek_rx.try_recv() {
                    next_fetch_height.store(height, Ordering::SeqCst);
                }

                if !upstream.is_connected() && !upstream.try_connect() {
                    thread::sleep(reconnect_period);
                    continue;
                }

                let height = next_fetch_height.load(Ordering::SeqCst);

                let tip = match upstream.chain_tip() {
                    Ok(tip) => tip,
                    Err(_) => {
                        thread::sleep(reconnect_period);
                        continue;
                    }
                };

                if height > tip.height {
                    // Caught up to the node; wait for the next block.
                    thread::sleep(poll_period);
                    continue;
                }

                let block_hash = match upstream.block_hash_at(height) {
                    Ok(hash) => hash,
                    Err(_) => {
                        thread::sleep(reconnect_period);
                        continue;
                    }
                };

                match upstream.fetch_raw_block(&block_hash) {
                    Ok(raw) => {
                        if block_tx.send(PrefetchedBlock { height, raw }).is_err() {
                            // Driver has shut down.
                            break;
                        }
                        next_fetch_height.store(height + 1, Ordering::SeqCst);
                    }
                    Err(IndexerError::ChainInconsistency(msg)) => {
                        warn!(height, error = %msg, "chain inconsistency fetching block, retrying");
                        thread::sleep(poll_period);
                    }
                    Err(_) => {
                        thread::sleep(reconnect_period);
                    }
                }
            }
        })
    }

    /// Drive loop: dequeue assembled blocks, detect reorgs, apply or
    /// backtrack, retry transient assembly failures. Runs on the calling
    /// thread; returns once `stop` is observed or a fatal error occurs.
    fn drive(
        &self,
        block_rx: mpsc::Receiver<PrefetchedBlock>,
        seek_tx: mpsc::Sender<u32>,
        next_fetch_height: Arc<AtomicU32>,
    ) -> Result<(), IndexerError> {
        let mut assembler = BlockAssembler::new(self.network, self.prevout_cache_capacity);
        let mut expected_height = self.processor.height() + 1;

        loop {
            if self.stop.load(Ordering::SeqCst) {
                return Ok(());
            }

            let item = match block_rx.recv_timeout(self.poll_period) {
                Ok(item) => item,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Ok(()),
            };

            // A block fetched before a reorg was detected; the prefetcher
            // has already been told to restart at `expected_height`.
            if item.height != expected_height {
                continue;
            }

            match assembler.assemble(&item.raw, item.height, &self.upstream) {
                Ok(block) => {
                    if let Some(tip_hash) = self.processor.tip_hash() {
                        if block.prev_hash != tip_hash {
                            self.handle_reorg(&mut assembler, &seek_tx, &next_fetch_height)?;
                            expected_height = self.processor.height() + 1;
                            continue;
                        }
                    }

                    self.processor.add_block(block)?;
                    expected_height += 1;

                    if !self.fast_sync {
                        thread::sleep(Duration::from_millis(1));
                    }
                }
                Err(e) if e.is_retryable() => {
                    warn!(height = item.height, error = %e, "retrying block assembly");
                    let _ = seek_tx.send(expected_height);
                    thread::sleep(self.poll_period);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Walk backward from the ring tail to find the deepest point at which
    /// our tracked hash still matches the upstream node's hash at that
    /// height, backtracking the processor one block at a time. Bounded by
    /// the ring depth: a divergence deeper than that is `BacktrackLimitReached`.
    fn handle_reorg(
        &self,
        assembler: &mut BlockAssembler,
        seek_tx: &mpsc::Sender<u32>,
        next_fetch_height: &Arc<AtomicU32>,
    ) -> Result<(), IndexerError> {
        info!(height = self.processor.height(), "reorg detected, backtracking");

        loop {
            self.processor.backtrack()?;
            assembler.purge_cache();

            let height = self.processor.height();
            match (self.processor.tip_hash(), self.upstream.block_hash_at(height)) {
                (Some(local_hash), Ok(upstream_hash)) => {
                    let upstream_bytes = hex::decode(&upstream_hash)
                        .map_err(|e| IndexerError::ChainInconsistency(e.to_string()))?;
                    if upstream_bytes.as_slice() == local_hash {
                        break;
                    }
                    // Still diverged at this depth; keep walking back.
                }
                _ => break, // ring empty or upstream unreachable: resume from here
            }
        }

        let resume_height = self.processor.height() + 1;
        next_fetch_height.store(resume_height, Ordering::SeqCst);
        let _ = seek_tx.send(resume_height);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_maps_into_follower_fields() {
        let mut config = AppConfig::default();
        config.max_backtrack_blocks = 50;
        config.prefetch_depth = 4;
        config.fast_sync = true;

        // Construction alone shouldn't touch the network; verified by
        // field values rather than behavior here.
        assert_eq!(config.prefetch_depth, 4);
        assert!(config.fast_sync);
    }
}
