//! Listener supervision
//!
//! Each configured listener runs as one tokio task looping
//! fetch → decode → project → checkpoint → wait. Shutdown is observed only
//! between batches, so an in-flight batch always completes.

use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info_span, Instrument};

use crate::chain::{self, BlockRange, ChainSource, EventLogReader, RetryPolicy};
use crate::config::{ListenerConfig, NodeConfig};
use crate::error::{Result, SyncError};
use crate::metrics;
use crate::projector::{BatchOutcome, EventProjector};
use crate::storage::{CheckpointTracker, SyncStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ListenerState {
    Stopped,
    Starting,
    Running,
    Backoff,
    Stopping,
    /// Terminal; needs an operator restart
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListenerStatus {
    pub name: String,
    pub state: ListenerState,
    pub checkpoint: u64,
    pub safe_head: Option<u64>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub events_applied: u64,
}

impl ListenerStatus {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: ListenerState::Stopped,
            checkpoint: 0,
            safe_head: None,
            consecutive_failures: 0,
            last_error: None,
            events_applied: 0,
        }
    }
}

pub type SharedStatus = Arc<RwLock<ListenerStatus>>;

/// Result of one sync iteration that moved the checkpoint
#[derive(Debug, Clone, Copy)]
pub struct SyncProgress {
    pub range: BlockRange,
    pub safe_head: u64,
    pub outcome: BatchOutcome,
    pub decode_errors: usize,
}

impl SyncProgress {
    pub fn caught_up(&self) -> bool {
        self.range.to >= self.safe_head
    }
}

pub struct SyncListener {
    name: String,
    reader: EventLogReader,
    projector: Arc<EventProjector>,
    checkpoints: CheckpointTracker,
    start_block: u64,
    max_block_range: u64,
    poll_interval: Duration,
    backoff: RetryPolicy,
    max_consecutive_failures: u32,
    status: SharedStatus,
}

impl SyncListener {
    pub fn new(
        listener: &ListenerConfig,
        config: &NodeConfig,
        source: Arc<dyn ChainSource>,
        projector: Arc<EventProjector>,
    ) -> Result<Self> {
        let retry = RetryPolicy::from_config(&config.retry, &config.chain);
        let reader = EventLogReader::new(source, &listener.contracts, config.chain.confirmations, retry.clone())?;
        let checkpoints = CheckpointTracker::new(projector.store().clone(), listener.name.clone());

        let mut status = ListenerStatus::new(&listener.name);
        status.checkpoint = checkpoints.get()?;

        Ok(Self {
            name: listener.name.clone(),
            reader,
            projector,
            checkpoints,
            start_block: config.chain.start_block,
            max_block_range: config.chain.max_block_range,
            poll_interval: config.chain.poll_interval(),
            backoff: retry,
            max_consecutive_failures: config.retry.max_consecutive_failures.max(1),
            status: Arc::new(RwLock::new(status)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> SharedStatus {
        self.status.clone()
    }

    fn set_state(&self, state: ListenerState) {
        let mut status = self.status.write();
        if status.state != state {
            log::debug!("Listener {} {:?} -> {:?}", self.name, status.state, state);
            status.state = state;
        }
    }

    /// Process the next confirmed range, if any. Returns `None` when the
    /// listener is caught up with the safe head.
    pub async fn sync_once(&self) -> Result<Option<SyncProgress>> {
        let checkpoint = self.checkpoints.get()?;
        let safe_head = self.reader.safe_head().await?;
        self.status.write().safe_head = Some(safe_head);

        let Some(range) = chain::next_range(checkpoint, self.start_block, safe_head, self.max_block_range) else {
            return Ok(None);
        };

        let batch = self.reader.read_range(range).await?;
        let outcome = self
            .projector
            .project_batch(&batch.events, Some((&self.checkpoints, range.to)))?;

        {
            let mut status = self.status.write();
            status.checkpoint = range.to;
            status.events_applied += outcome.applied as u64;
        }

        if outcome.total() > 0 || batch.decode_errors > 0 {
            log::info!(
                "Listener {} projected {}: {} applied, {} duplicate, {} skipped, {} malformed",
                self.name,
                range,
                outcome.applied,
                outcome.duplicates,
                outcome.skipped,
                batch.decode_errors
            );
        } else {
            log::debug!("Listener {} advanced to {} (no events)", self.name, range.to);
        }

        Ok(Some(SyncProgress {
            range,
            safe_head,
            outcome,
            decode_errors: batch.decode_errors,
        }))
    }

    /// Run until cancelled or failed; returns the final state
    pub async fn run(self, shutdown: CancellationToken) -> ListenerState {
        self.set_state(ListenerState::Starting);
        log::info!(
            "Starting listener {} at checkpoint {} over {} contract(s)",
            self.name,
            self.status.read().checkpoint,
            self.reader.addresses().len()
        );
        self.set_state(ListenerState::Running);

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let span = info_span!("sync_cycle", listener = %self.name);
            let wait = match self.sync_once().instrument(span).await {
                Ok(progress) => {
                    {
                        let mut status = self.status.write();
                        status.consecutive_failures = 0;
                        status.last_error = None;
                    }
                    self.set_state(ListenerState::Running);
                    match progress {
                        Some(p) if !p.caught_up() => Duration::ZERO,
                        _ => self.poll_interval,
                    }
                }
                Err(err) => match self.on_failure(&err) {
                    Some(delay) => delay,
                    None => return ListenerState::Failed,
                },
            };

            if wait.is_zero() {
                continue;
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
            if self.status.read().state == ListenerState::Backoff {
                self.set_state(ListenerState::Running);
            }
        }

        self.set_state(ListenerState::Stopping);
        log::info!("Listener {} stopping at checkpoint {}", self.name, self.status.read().checkpoint);
        self.set_state(ListenerState::Stopped);
        ListenerState::Stopped
    }

    /// Record a failed cycle. Returns the backoff delay, or `None` when the
    /// listener has moved to FAILED.
    fn on_failure(&self, err: &SyncError) -> Option<Duration> {
        metrics::LISTENER_FAILURES.with_label_values(&[&self.name]).inc();
        let failures = {
            let mut status = self.status.write();
            status.consecutive_failures += 1;
            status.last_error = Some(err.to_string());
            status.consecutive_failures
        };

        if err.is_fatal() || failures >= self.max_consecutive_failures {
            log::error!(
                "Listener {} failed after {} consecutive error(s): {}",
                self.name,
                failures,
                err
            );
            self.set_state(ListenerState::Failed);
            return None;
        }

        let delay = self.backoff.backoff_for(failures);
        log::warn!("Listener {} cycle failed: {}; backing off {:?}", self.name, err, delay);
        self.set_state(ListenerState::Backoff);
        Some(delay)
    }
}

/// Owns the listener tasks and their shared shutdown token
pub struct ListenerSupervisor {
    shutdown: CancellationToken,
    statuses: Vec<SharedStatus>,
    tasks: Vec<JoinHandle<ListenerState>>,
}

impl ListenerSupervisor {
    /// Spawn one task per configured listener
    pub fn spawn(config: &NodeConfig, source: Arc<dyn ChainSource>, store: Arc<SyncStore>) -> Result<Self> {
        let projector = Arc::new(EventProjector::new(store));
        let shutdown = CancellationToken::new();
        let mut statuses = Vec::new();
        let mut tasks = Vec::new();

        for listener_cfg in config.effective_listeners() {
            let listener = SyncListener::new(&listener_cfg, config, source.clone(), projector.clone())?;
            statuses.push(listener.status());
            tasks.push(tokio::spawn(listener.run(shutdown.child_token())));
        }

        if tasks.is_empty() {
            log::warn!("No contract addresses configured; no listener started");
        }

        Ok(Self {
            shutdown,
            statuses,
            tasks,
        })
    }

    pub fn statuses(&self) -> Vec<SharedStatus> {
        self.statuses.clone()
    }

    /// Cancel every listener and wait for in-flight batches to finish
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            match task.await {
                Ok(state) => log::debug!("Listener task ended in {:?}", state),
                Err(e) => log::error!("Listener task panicked: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{DomainEvent, MemoryChainSource};
    use crate::config::{ListenerConfig, NodeConfig};
    use ethers::types::{Address, H256};
    use std::str::FromStr;
    use tempfile::TempDir;

    const NFT: &str = "0x5fbdb2315678afecb367f032d93f642f64180aa3";

    fn test_config() -> NodeConfig {
        let mut cfg = NodeConfig::default();
        cfg.chain.confirmations = 0;
        cfg.chain.poll_interval_ms = 10;
        cfg.chain.max_block_range = 50;
        cfg.retry.max_attempts = 2;
        cfg.retry.initial_backoff_ms = 1;
        cfg.retry.max_backoff_ms = 5;
        cfg.retry.max_consecutive_failures = 3;
        cfg.listeners = vec![ListenerConfig {
            name: "desci".into(),
            contracts: vec![NFT.into()],
        }];
        cfg
    }

    fn setup(cfg: &NodeConfig) -> (TempDir, Arc<MemoryChainSource>, SyncListener) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SyncStore::open(dir.path()).unwrap());
        let chain = Arc::new(MemoryChainSource::new());
        let listener = SyncListener::new(
            &cfg.listeners[0],
            cfg,
            chain.clone(),
            Arc::new(EventProjector::new(store)),
        )
        .unwrap();
        (dir, chain, listener)
    }

    fn mint(chain: &MemoryChainSource, block: u64, token: u64) {
        chain
            .push_event(
                Address::from_str(NFT).unwrap(),
                block,
                H256::from_low_u64_be(token),
                0,
                &DomainEvent::ResearchMinted {
                    token_id: token.to_string(),
                    authors: vec![],
                    title: format!("Paper {token}"),
                    content_hash: "0x00".into(),
                    metadata_hash: "QmMeta".into(),
                },
            )
            .unwrap();
    }

    #[tokio::test]
    async fn test_sync_once_walks_ranges() {
        let cfg = test_config();
        let (_dir, chain, listener) = setup(&cfg);
        mint(&chain, 10, 1);
        mint(&chain, 80, 2);
        chain.set_head(120);

        let first = listener.sync_once().await.unwrap().unwrap();
        assert_eq!(first.range, BlockRange::new(0, 49));
        assert_eq!(first.outcome.applied, 1);
        assert!(!first.caught_up());

        let second = listener.sync_once().await.unwrap().unwrap();
        assert_eq!(second.range, BlockRange::new(49, 98));
        assert_eq!(second.outcome.applied, 1);

        let third = listener.sync_once().await.unwrap().unwrap();
        assert_eq!(third.range, BlockRange::new(98, 120));
        assert!(third.caught_up());

        assert!(listener.sync_once().await.unwrap().is_none());
        assert_eq!(listener.status().read().checkpoint, 120);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let cfg = test_config();
        let (_dir, chain, listener) = setup(&cfg);
        mint(&chain, 5, 1);
        chain.set_head(30);

        let status = listener.status();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(listener.run(shutdown.clone()));

        for _ in 0..200 {
            if status.read().checkpoint == 30 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(status.read().checkpoint, 30);

        shutdown.cancel();
        assert_eq!(task.await.unwrap(), ListenerState::Stopped);
        assert_eq!(status.read().state, ListenerState::Stopped);
    }

    #[tokio::test]
    async fn test_persistent_failures_end_in_failed() {
        let cfg = test_config();
        let (_dir, chain, listener) = setup(&cfg);
        chain.set_head(10);
        chain.fail_next(u32::MAX);

        let status = listener.status();
        let state = listener.run(CancellationToken::new()).await;
        assert_eq!(state, ListenerState::Failed);

        let status = status.read();
        assert_eq!(status.state, ListenerState::Failed);
        assert_eq!(status.consecutive_failures, 3);
        assert!(status.last_error.is_some());
    }

    #[tokio::test]
    async fn test_transient_failure_recovers() {
        let cfg = test_config();
        let (_dir, chain, listener) = setup(&cfg);
        mint(&chain, 5, 1);
        chain.set_head(10);
        // exhausts the first cycle's retry budget, the next cycle succeeds
        chain.fail_next(2);

        assert!(listener.sync_once().await.is_err());
        let progress = listener.sync_once().await.unwrap().unwrap();
        assert_eq!(progress.outcome.applied, 1);
    }
}
