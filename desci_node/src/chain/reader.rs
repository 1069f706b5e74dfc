//! Event log reader
//!
//! Fetches contract logs for a contiguous, confirmed block range and turns
//! them into ordered [`ChainEvent`]s and [`DecodedEvent`]s. A range is
//! either returned whole or the fetch fails; nothing is handed to the
//! projector for a partially fetched range.

use async_trait::async_trait;
use ethers::providers::{Http, Middleware, Provider};
use ethers::types::{Address, BlockNumber, Filter, Log};
use futures::{stream, StreamExt, TryStreamExt};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use super::events::{self, DecodedEvent, DomainEvent};
use super::retry::RetryPolicy;
use super::{BlockRange, ChainEvent};
use crate::error::{Result, SyncError};
use crate::metrics;

/// Block header requests in flight per range
pub const TIMESTAMP_CONCURRENCY: usize = 8;

/// Minimal JSON-RPC surface the reader needs from a chain endpoint
#[async_trait]
pub trait ChainSource: Send + Sync {
    async fn block_number(&self) -> Result<u64>;
    async fn logs(&self, addresses: &[Address], range: BlockRange) -> Result<Vec<Log>>;
    async fn block_timestamp(&self, block: u64) -> Result<u64>;
}

/// `ChainSource` backed by an ethers HTTP provider
pub struct EthersChainSource {
    provider: Provider<Http>,
}

impl EthersChainSource {
    pub fn new(rpc_url: &str, poll_interval: Duration) -> Result<Self> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .map_err(|e| SyncError::Config(format!("Failed to create HTTP provider: {}", e)))?
            .interval(poll_interval);
        Ok(Self { provider })
    }
}

#[async_trait]
impl ChainSource for EthersChainSource {
    async fn block_number(&self) -> Result<u64> {
        let number = self
            .provider
            .get_block_number()
            .await
            .map_err(|e| SyncError::TransientRpc(format!("eth_blockNumber: {}", e)))?;
        Ok(number.as_u64())
    }

    async fn logs(&self, addresses: &[Address], range: BlockRange) -> Result<Vec<Log>> {
        let filter = Filter::new()
            .address(addresses.to_vec())
            .from_block(BlockNumber::Number(range.from.into()))
            .to_block(BlockNumber::Number(range.to.into()));
        self.provider
            .get_logs(&filter)
            .await
            .map_err(|e| SyncError::TransientRpc(format!("eth_getLogs {}: {}", range, e)))
    }

    async fn block_timestamp(&self, block: u64) -> Result<u64> {
        let header = self
            .provider
            .get_block(block)
            .await
            .map_err(|e| SyncError::TransientRpc(format!("eth_getBlockByNumber {}: {}", block, e)))?
            .ok_or_else(|| SyncError::TransientRpc(format!("block {} not available yet", block)))?;
        Ok(header.timestamp.as_u64())
    }
}

/// Events read for one range
#[derive(Debug, Default)]
pub struct ReadBatch {
    pub events: Vec<DecodedEvent>,
    pub decode_errors: usize,
    pub unknown: usize,
}

pub struct EventLogReader {
    source: Arc<dyn ChainSource>,
    addresses: Vec<Address>,
    confirmations: u64,
    retry: RetryPolicy,
}

impl EventLogReader {
    pub fn new(
        source: Arc<dyn ChainSource>,
        contracts: &[String],
        confirmations: u64,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let addresses = contracts
            .iter()
            .map(|c| {
                Address::from_str(c)
                    .map_err(|e| SyncError::Config(format!("invalid contract address {}: {}", c, e)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            source,
            addresses,
            confirmations,
            retry,
        })
    }

    pub fn addresses(&self) -> &[Address] {
        &self.addresses
    }

    /// Highest block with at least `confirmations` blocks on top of it
    pub async fn safe_head(&self) -> Result<u64> {
        let head = self
            .retry
            .run("eth_blockNumber", || self.source.block_number())
            .await?;
        Ok(head.saturating_sub(self.confirmations))
    }

    /// All watched logs in `range`, ordered by (block, log index) and
    /// de-duplicated on (tx hash, log index)
    pub async fn fetch_range(&self, range: BlockRange) -> Result<Vec<ChainEvent>> {
        let logs = self
            .retry
            .run("eth_getLogs", || self.source.logs(&self.addresses, range))
            .await?;

        let mut by_cursor = BTreeMap::new();
        let mut seen = HashSet::new();
        for log in logs {
            if log.removed == Some(true) {
                log::debug!("Dropping removed log in {}", range);
                continue;
            }
            let (Some(block), Some(tx_hash), Some(log_index)) =
                (log.block_number, log.transaction_hash, log.log_index)
            else {
                log::debug!("Dropping pending log without position in {}", range);
                continue;
            };
            let block = block.as_u64();
            if !range.contains(block) {
                return Err(SyncError::TransientRpc(format!(
                    "eth_getLogs returned block {} outside {}",
                    block, range
                )));
            }
            let log_index = log_index.as_u64();
            if !seen.insert((tx_hash, log_index)) {
                continue;
            }
            by_cursor.insert(
                (block, log_index),
                ChainEvent {
                    contract_address: log.address,
                    event_name: events::event_name(log.topics.first()).to_string(),
                    block_number: block,
                    block_timestamp: 0,
                    transaction_hash: tx_hash,
                    log_index,
                    topics: log.topics,
                    data: log.data,
                },
            );
        }

        let blocks: Vec<u64> = by_cursor
            .keys()
            .map(|(block, _)| *block)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let timestamps: Vec<u64> = stream::iter(blocks.iter().copied())
            .map(|block| {
                self.retry
                    .run("eth_getBlockByNumber", move || self.source.block_timestamp(block))
            })
            .buffered(TIMESTAMP_CONCURRENCY)
            .try_collect()
            .await?;
        let timestamps: BTreeMap<u64, u64> = blocks.into_iter().zip(timestamps).collect();

        let mut events: Vec<ChainEvent> = by_cursor.into_values().collect();
        for event in &mut events {
            event.block_timestamp = timestamps.get(&event.block_number).copied().unwrap_or_default();
        }
        Ok(events)
    }

    /// Fetch and decode a range. Malformed logs are logged and counted,
    /// never fatal.
    pub async fn read_range(&self, range: BlockRange) -> Result<ReadBatch> {
        let raw = self.fetch_range(range).await?;
        let mut batch = ReadBatch::default();

        for event in &raw {
            match events::decode(event) {
                Ok(decoded) => {
                    if matches!(decoded.event, DomainEvent::Unknown { .. }) {
                        batch.unknown += 1;
                    }
                    batch.events.push(decoded);
                }
                Err(err) => {
                    log::warn!("Skipping malformed log: {}", err);
                    metrics::DECODE_ERRORS.inc();
                    batch.decode_errors += 1;
                }
            }
        }

        log::debug!(
            "Read {} events in {} ({} unknown, {} malformed)",
            batch.events.len(),
            range,
            batch.unknown,
            batch.decode_errors
        );
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MemoryChainSource;
    use ethers::types::{H256, U256};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves one log per block and tracks concurrent header requests
    struct SlowHeaders {
        logs: Vec<Log>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl ChainSource for SlowHeaders {
        async fn block_number(&self) -> Result<u64> {
            Ok(self.logs.len() as u64)
        }

        async fn logs(&self, _addresses: &[Address], _range: BlockRange) -> Result<Vec<Log>> {
            Ok(self.logs.clone())
        }

        async fn block_timestamp(&self, block: u64) -> Result<u64> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(1_000 + block)
        }
    }

    const NFT: &str = "0x5fbdb2315678afecb367f032d93f642f64180aa3";
    const ALICE: &str = "0x70997970c51812dc3a010c7d01b50e0d17dc79c8";

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            attempt_timeout: Duration::from_secs(1),
        }
    }

    fn minted(token: u64) -> DomainEvent {
        DomainEvent::ResearchMinted {
            token_id: token.to_string(),
            authors: vec![ALICE.into()],
            title: format!("Paper {}", token),
            content_hash: format!("0x{:064x}", token),
            metadata_hash: "QmMeta".into(),
        }
    }

    #[tokio::test]
    async fn test_safe_head_respects_confirmations() {
        let chain = Arc::new(MemoryChainSource::new());
        chain.set_head(100);
        let reader = EventLogReader::new(chain.clone(), &[NFT.into()], 6, fast_retry()).unwrap();
        assert_eq!(reader.safe_head().await.unwrap(), 94);

        chain.set_head(3);
        assert_eq!(reader.safe_head().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_fetch_orders_and_dedups() {
        let chain = Arc::new(MemoryChainSource::new());
        let nft = Address::from_str(NFT).unwrap();
        chain.push_event(nft, 12, H256::repeat_byte(2), 1, &minted(3)).unwrap();
        chain.push_event(nft, 10, H256::repeat_byte(1), 4, &minted(2)).unwrap();
        chain.push_event(nft, 10, H256::repeat_byte(1), 0, &minted(1)).unwrap();
        // same (tx, log index) delivered twice by the node
        chain.push_event(nft, 10, H256::repeat_byte(1), 0, &minted(1)).unwrap();
        chain.set_head(20);

        let reader = EventLogReader::new(chain.clone(), &[NFT.into()], 0, fast_retry()).unwrap();
        let events = reader.fetch_range(BlockRange::new(0, 20)).await.unwrap();
        let cursors: Vec<(u64, u64)> = events.iter().map(|e| (e.block_number, e.log_index)).collect();
        assert_eq!(cursors, vec![(10, 0), (10, 4), (12, 1)]);
        assert!(events.iter().all(|e| e.event_name == "ResearchMinted"));
        assert_eq!(events[0].block_timestamp, chain.timestamp_of(10));
    }

    #[tokio::test]
    async fn test_fetch_filters_by_range_and_address() {
        let chain = Arc::new(MemoryChainSource::new());
        let nft = Address::from_str(NFT).unwrap();
        chain.push_event(nft, 5, H256::repeat_byte(1), 0, &minted(1)).unwrap();
        chain.push_event(nft, 15, H256::repeat_byte(2), 0, &minted(2)).unwrap();
        chain
            .push_event(Address::repeat_byte(0x99), 6, H256::repeat_byte(3), 0, &minted(3))
            .unwrap();

        let reader = EventLogReader::new(chain, &[NFT.into()], 0, fast_retry()).unwrap();
        let events = reader.fetch_range(BlockRange::new(0, 10)).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].block_number, 5);
    }

    #[tokio::test]
    async fn test_header_requests_are_bounded() {
        let nft = Address::from_str(NFT).unwrap();
        let blocks = TIMESTAMP_CONCURRENCY as u64 * 4;
        let logs = (1..=blocks)
            .map(|block| Log {
                address: nft,
                topics: vec![H256::repeat_byte(0x42)],
                block_number: Some(block.into()),
                transaction_hash: Some(H256::from_low_u64_be(block)),
                log_index: Some(U256::zero()),
                ..Default::default()
            })
            .collect();
        let source = Arc::new(SlowHeaders {
            logs,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });

        let reader = EventLogReader::new(source.clone(), &[NFT.into()], 0, fast_retry()).unwrap();
        let events = reader.fetch_range(BlockRange::new(1, blocks)).await.unwrap();
        assert_eq!(events.len(), blocks as usize);
        assert!(events.iter().all(|e| e.block_timestamp == 1_000 + e.block_number));

        let peak = source.peak.load(Ordering::SeqCst);
        assert!(peak <= TIMESTAMP_CONCURRENCY, "{} header requests in flight", peak);
        assert!(peak > 1);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let chain = Arc::new(MemoryChainSource::new());
        let nft = Address::from_str(NFT).unwrap();
        chain.push_event(nft, 5, H256::repeat_byte(1), 0, &minted(1)).unwrap();
        chain.fail_next(2);

        let reader = EventLogReader::new(chain.clone(), &[NFT.into()], 0, fast_retry()).unwrap();
        let batch = reader.read_range(BlockRange::new(0, 10)).await.unwrap();
        assert_eq!(batch.events.len(), 1);

        chain.fail_next(10);
        assert!(matches!(
            reader.read_range(BlockRange::new(0, 10)).await,
            Err(SyncError::RetryExhausted { .. })
        ));
    }

    #[tokio::test]
    async fn test_read_range_skips_malformed_logs() {
        let chain = Arc::new(MemoryChainSource::new());
        let nft = Address::from_str(NFT).unwrap();
        chain.push_event(nft, 5, H256::repeat_byte(1), 0, &minted(1)).unwrap();
        chain.push_raw(Log {
            address: nft,
            topics: vec![events::event_abi("DatasetPurchased").unwrap().signature()],
            data: vec![1, 2, 3].into(),
            block_number: Some(6u64.into()),
            transaction_hash: Some(H256::repeat_byte(2)),
            log_index: Some(U256::zero()),
            ..Default::default()
        });
        chain.push_raw(Log {
            address: nft,
            topics: vec![H256::repeat_byte(0x42)],
            block_number: Some(7u64.into()),
            transaction_hash: Some(H256::repeat_byte(3)),
            log_index: Some(U256::zero()),
            ..Default::default()
        });

        let reader = EventLogReader::new(chain, &[NFT.into()], 0, fast_retry()).unwrap();
        let batch = reader.read_range(BlockRange::new(0, 10)).await.unwrap();
        assert_eq!(batch.events.len(), 2);
        assert_eq!(batch.decode_errors, 1);
        assert_eq!(batch.unknown, 1);
    }
}
