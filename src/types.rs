use std::fmt;

/// Simple error carrying just a message, used on paths that never branch on
/// error kind (CLI argument parsing, config loading). Richer pipeline errors
/// use [`crate::errors::IndexerError`] instead.
#[derive(Debug, Clone)]
pub struct MyError {
    pub message: String,
}

impl MyError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for MyError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for MyError {}

/// A resolved transaction output: which address it pays, and how much.
/// `address` is `None` for non-standard scripts, which carry no balance
/// attribution but still occupy a slot in the block's output list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Output {
    pub txid: [u8; 32],
    pub vout: u32,
    pub address: Option<String>,
    pub value: i64,
}

/// A fully assembled block: every output it creates, and every output it
/// spends (already resolved to address + value via the prevout cache).
/// Coinbase inputs are never present here — they have no resolvable
/// prevout and contribute no spend record.
#[derive(Debug, Clone)]
pub struct IndexedBlock {
    pub hash: [u8; 32],
    pub prev_hash: [u8; 32],
    pub height: u32,
    pub outputs: Vec<Output>,
    pub inputs: Vec<Output>,
}

impl IndexedBlock {
    /// Sum of input value minus sum of output value; zero for a balanced
    /// block (coinbase issuance aside, since coinbase has no input side).
    pub fn check_balance(&self) -> bool {
        let input_value: i64 = self.inputs.iter().map(|o| o.value).sum();
        let output_value: i64 = self.outputs.iter().map(|o| o.value).sum();
        input_value == output_value
    }
}

/// Durable chain tip as persisted by `BalanceStore`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TipHeight(pub u32);
