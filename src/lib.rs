//! Balance indexing pipeline: a continuously updated mapping from
//! payment-network addresses to confirmed aggregate balances, derived by
//! replaying blocks of a UTXO-based chain in order.
//!
//! Data flows linearly: `rpc (node) -> chain_follower -> block_assembler
//! (prevout_cache) -> balance_processor -> balance_cache -> store`. Balance
//! reads flow in reverse and short-circuit at the first component holding
//! a value.

pub mod address;
pub mod balance_cache;
pub mod balance_processor;
pub mod block_assembler;
pub mod chain_follower;
pub mod config;
pub mod errors;
pub mod metrics;
pub mod prevout_cache;
pub mod rpc;
pub mod store;
pub mod telemetry;
pub mod types;
