//! In-memory chain used by tests and local runs without a node

use async_trait::async_trait;
use ethers::types::{Address, Log, H256, U256, U64};
use parking_lot::RwLock;

use super::events::DomainEvent;
use super::reader::ChainSource;
use super::BlockRange;
use crate::error::{Result, SyncError};

/// Timestamp of block 0; later blocks are 12 seconds apart
pub const GENESIS_TIMESTAMP: u64 = 1_700_000_000;

#[derive(Default)]
struct ChainState {
    head: u64,
    logs: Vec<Log>,
    pending_failures: u32,
}

/// A scripted [`ChainSource`]. Logs are stored as the node would return
/// them; `fail_next` makes the following calls fail as transient RPC
/// errors.
#[derive(Default)]
pub struct MemoryChainSource {
    state: RwLock<ChainState>,
}

impl MemoryChainSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_head(&self, head: u64) {
        self.state.write().head = head;
    }

    pub fn head(&self) -> u64 {
        self.state.read().head
    }

    pub fn timestamp_of(&self, block: u64) -> u64 {
        GENESIS_TIMESTAMP + block * 12
    }

    /// Fail the next `count` RPC calls
    pub fn fail_next(&self, count: u32) {
        self.state.write().pending_failures = count;
    }

    /// Append a raw log. The head is raised to cover its block.
    pub fn push_raw(&self, log: Log) {
        let mut state = self.state.write();
        if let Some(block) = log.block_number {
            state.head = state.head.max(block.as_u64());
        }
        state.logs.push(log);
    }

    /// Emit `event` from `contract` at the given position
    pub fn push_event(
        &self,
        contract: Address,
        block: u64,
        tx_hash: H256,
        log_index: u64,
        event: &DomainEvent,
    ) -> Result<()> {
        let (topics, data) = event.encode_log()?;
        self.push_raw(Log {
            address: contract,
            topics,
            data,
            block_number: Some(U64::from(block)),
            transaction_hash: Some(tx_hash),
            log_index: Some(U256::from(log_index)),
            removed: Some(false),
            ..Default::default()
        });
        Ok(())
    }

    fn begin_call(&self, method: &str) -> Result<()> {
        let mut state = self.state.write();
        if state.pending_failures > 0 {
            state.pending_failures -= 1;
            return Err(SyncError::TransientRpc(format!("{method}: connection refused")));
        }
        Ok(())
    }
}

#[async_trait]
impl ChainSource for MemoryChainSource {
    async fn block_number(&self) -> Result<u64> {
        self.begin_call("eth_blockNumber")?;
        Ok(self.head())
    }

    async fn logs(&self, addresses: &[Address], range: BlockRange) -> Result<Vec<Log>> {
        self.begin_call("eth_getLogs")?;
        let state = self.state.read();
        Ok(state
            .logs
            .iter()
            .filter(|log| addresses.is_empty() || addresses.contains(&log.address))
            .filter(|log| {
                log.block_number
                    .map(|b| range.contains(b.as_u64()) && b.as_u64() <= state.head)
                    .unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn block_timestamp(&self, block: u64) -> Result<u64> {
        self.begin_call("eth_getBlockByNumber")?;
        Ok(self.timestamp_of(block))
    }
}
