//! Chain-facing side of the node: raw log types, typed event decoding,
//! RPC retry policy and the log reader

use ethers::types::{Address, Bytes, H256};
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod events;
pub mod memory;
pub mod reader;
pub mod retry;

pub use events::{DecodedEvent, DomainEvent, RawPayload};
pub use memory::MemoryChainSource;
pub use reader::{ChainSource, EthersChainSource, EventLogReader, ReadBatch};
pub use retry::RetryPolicy;

/// Lowercase `0x`-prefixed hex form used for every address in the store
pub fn address_key(address: &Address) -> String {
    format!("{:#x}", address)
}

/// Inclusive block range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRange {
    pub from: u64,
    pub to: u64,
}

impl BlockRange {
    pub fn new(from: u64, to: u64) -> Self {
        Self { from, to }
    }

    pub fn contains(&self, block: u64) -> bool {
        block >= self.from && block <= self.to
    }
}

impl fmt::Display for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.from, self.to)
    }
}

/// Position of a log in the chain. Derived `Ord` gives the projection
/// order: block ascending, then log index ascending.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventCursor {
    pub block_number: u64,
    pub log_index: u64,
}

impl fmt::Display for EventCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.block_number, self.log_index)
    }
}

/// A contract log as observed on chain. Immutable; identified by
/// (transaction_hash, log_index).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainEvent {
    pub contract_address: Address,
    /// Resolved from topic0 against the known event set; `"Unknown"` otherwise
    pub event_name: String,
    pub block_number: u64,
    pub block_timestamp: u64,
    pub transaction_hash: H256,
    pub log_index: u64,
    pub topics: Vec<H256>,
    pub data: Bytes,
}

impl ChainEvent {
    pub fn meta(&self) -> EventMeta {
        EventMeta {
            contract: address_key(&self.contract_address),
            block_number: self.block_number,
            block_timestamp: self.block_timestamp,
            tx_hash: format!("{:#x}", self.transaction_hash),
            log_index: self.log_index,
        }
    }
}

/// Provenance carried from a log into every record it produces
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMeta {
    pub contract: String,
    pub block_number: u64,
    pub block_timestamp: u64,
    pub tx_hash: String,
    pub log_index: u64,
}

impl EventMeta {
    pub fn cursor(&self) -> EventCursor {
        EventCursor {
            block_number: self.block_number,
            log_index: self.log_index,
        }
    }

    /// Key identifying the source log: `tx_hash:log_index`
    pub fn event_key(&self) -> String {
        format!("{}:{}", self.tx_hash.to_ascii_lowercase(), self.log_index)
    }
}

/// Next contiguous range for a listener sitting at `checkpoint`.
///
/// The checkpoint block itself is read again (its events are already
/// marked applied and are skipped), so a restart resumes exactly at the
/// checkpoint. The returned range always ends above the checkpoint.
pub fn next_range(checkpoint: u64, start_block: u64, safe_head: u64, max_range: u64) -> Option<BlockRange> {
    if safe_head <= checkpoint {
        return None;
    }
    let from = checkpoint.max(start_block);
    if from > safe_head {
        return None;
    }
    let to = (from + max_range.max(1) - 1)
        .max(checkpoint + 1)
        .min(safe_head);
    Some(BlockRange { from, to })
}
