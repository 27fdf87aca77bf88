/// Metrics Module - Prometheus Instrumentation
///
/// Counters, gauges and histograms for the balance indexing pipeline:
/// throughput (blocks/transactions processed), chain position (tip height,
/// ring depth), reorg frequency, RPC/store latency, and hit/miss rates for
/// both in-process caches (`PrevoutCache`, `BalanceCache`).

use prometheus::{
    Registry, IntCounter, IntGauge, Histogram, HistogramVec, HistogramOpts, Opts, Encoder,
    TextEncoder,
};
use lazy_static::lazy_static;
use std::time::Instant;

/// Standard latency buckets (seconds), covering a fast RocksDB point read
/// up to a slow RPC call over a congested link.
const LATENCY_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0];

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    /// Total blocks applied to the processor (excludes blocks backtracked).
    pub static ref BLOCKS_PROCESSED: IntCounter = IntCounter::new(
        "balanced_blocks_processed_total",
        "Total blocks applied to the balance processor"
    ).unwrap();

    /// Total transactions seen across all applied blocks.
    pub static ref TRANSACTIONS_PROCESSED: IntCounter = IntCounter::new(
        "balanced_transactions_processed_total",
        "Total transactions seen across all applied blocks"
    ).unwrap();

    /// Current chain tip height as tracked by the processor (ring tail, or
    /// the durable cache tip when the ring is empty).
    pub static ref CHAIN_TIP_HEIGHT: IntGauge = IntGauge::new(
        "balanced_chain_tip_height",
        "Current chain tip height"
    ).unwrap();

    /// Number of blocks currently held in the recent-blocks ring.
    pub static ref RING_DEPTH: IntGauge = IntGauge::new(
        "balanced_ring_depth",
        "Number of blocks currently tracked in the recent-blocks ring"
    ).unwrap();

    /// Total reorg (backtrack) events observed.
    pub static ref REORG_EVENTS: IntCounter = IntCounter::new(
        "balanced_reorg_events_total",
        "Total reorganization events (ring backtracks)"
    ).unwrap();

    /// Upstream RPC call latency, labeled by method.
    pub static ref RPC_CALL_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new("balanced_rpc_call_duration_seconds", "Upstream RPC call latency")
            .buckets(LATENCY_BUCKETS.to_vec()),
        &["method"]
    ).unwrap();

    /// `BalanceStore::update` (commit) latency.
    pub static ref STORE_COMMIT_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new("balanced_store_commit_duration_seconds", "BalanceStore commit latency")
            .buckets(LATENCY_BUCKETS.to_vec())
    ).unwrap();

    /// PrevoutCache hits/misses.
    pub static ref PREVOUT_CACHE_HITS: IntCounter = IntCounter::new(
        "balanced_prevout_cache_hits_total", "PrevoutCache hits"
    ).unwrap();
    pub static ref PREVOUT_CACHE_MISSES: IntCounter = IntCounter::new(
        "balanced_prevout_cache_misses_total", "PrevoutCache misses"
    ).unwrap();

    /// BalanceCache base-LRU hits/misses (a miss means a `BalanceStore`
    /// point read was needed to materialize the baseline).
    pub static ref BALANCE_CACHE_HITS: IntCounter = IntCounter::new(
        "balanced_balance_cache_hits_total", "BalanceCache base-LRU hits"
    ).unwrap();
    pub static ref BALANCE_CACHE_MISSES: IntCounter = IntCounter::new(
        "balanced_balance_cache_misses_total", "BalanceCache base-LRU misses"
    ).unwrap();
}

/// Register every metric with the global registry. Call once at startup.
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    REGISTRY.register(Box::new(BLOCKS_PROCESSED.clone()))?;
    REGISTRY.register(Box::new(TRANSACTIONS_PROCESSED.clone()))?;
    REGISTRY.register(Box::new(CHAIN_TIP_HEIGHT.clone()))?;
    REGISTRY.register(Box::new(RING_DEPTH.clone()))?;
    REGISTRY.register(Box::new(REORG_EVENTS.clone()))?;
    REGISTRY.register(Box::new(RPC_CALL_DURATION.clone()))?;
    REGISTRY.register(Box::new(STORE_COMMIT_DURATION.clone()))?;
    REGISTRY.register(Box::new(PREVOUT_CACHE_HITS.clone()))?;
    REGISTRY.register(Box::new(PREVOUT_CACHE_MISSES.clone()))?;
    REGISTRY.register(Box::new(BALANCE_CACHE_HITS.clone()))?;
    REGISTRY.register(Box::new(BALANCE_CACHE_MISSES.clone()))?;
    Ok(())
}

/// Snapshot every registered metric in Prometheus text exposition format.
pub fn metrics_text() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

/// Timer for measuring durations around RPC calls and store commits.
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self { start: Instant::now() }
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

pub fn increment_blocks_processed() {
    BLOCKS_PROCESSED.inc();
}

pub fn increment_transactions_processed(count: u64) {
    TRANSACTIONS_PROCESSED.inc_by(count);
}

pub fn set_chain_tip_height(height: u32) {
    CHAIN_TIP_HEIGHT.set(height as i64);
}

pub fn set_ring_depth(depth: usize) {
    RING_DEPTH.set(depth as i64);
}

pub fn increment_reorg_events() {
    REORG_EVENTS.inc();
}

pub fn record_rpc_call_duration(method: &str, duration_secs: f64) {
    RPC_CALL_DURATION.with_label_values(&[method]).observe(duration_secs);
}

pub fn record_store_commit_duration(duration_secs: f64) {
    STORE_COMMIT_DURATION.observe(duration_secs);
}

pub fn record_prevout_cache_stats(hits: u64, misses: u64) {
    let prior_hits = PREVOUT_CACHE_HITS.get();
    let prior_misses = PREVOUT_CACHE_MISSES.get();
    if hits > prior_hits {
        PREVOUT_CACHE_HITS.inc_by(hits - prior_hits);
    }
    if misses > prior_misses {
        PREVOUT_CACHE_MISSES.inc_by(misses - prior_misses);
    }
}

pub fn increment_balance_cache_hit() {
    BALANCE_CACHE_HITS.inc();
}

pub fn increment_balance_cache_miss() {
    BALANCE_CACHE_MISSES.inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gather_metrics_contains_registered_names() {
        // Registering twice (if another test already initialized the
        // process-global registry) is expected to fail; only the content
        // of the snapshot matters here.
        let _ = init_metrics();
        set_chain_tip_height(1000);

        let output = metrics_text();
        assert!(output.contains("balanced_chain_tip_height"));
    }

    #[test]
    fn timer_measures_elapsed_time() {
        let timer = Timer::new();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(timer.elapsed_secs() >= 0.004);
    }
}
