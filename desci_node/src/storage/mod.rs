//! Projected read model
//!
//! RocksDB with one column family per entity plus secondary indexes, the
//! applied-event set, a journal of every applied log and listener
//! checkpoints. Values are bincode encoded.
//! All writes go through a [`StoreBatch`], which holds the store-wide writer
//! lock and lands as a single atomic `WriteBatch`.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use rocksdb::{BoundColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::error::{Result, SyncError};

pub mod checkpoint;

pub use checkpoint::{CheckpointTracker, SyncCheckpoint};

pub const CF_USERS: &str = "users";
pub const CF_DATASETS: &str = "datasets";
pub const CF_RESEARCH: &str = "research";
pub const CF_RESEARCH_BY_AUTHOR: &str = "research_by_author";
pub const CF_RESEARCH_BY_TIME: &str = "research_by_time";
pub const CF_CITATIONS: &str = "citations";
pub const CF_REVIEWS: &str = "reviews";
pub const CF_APPLIED_EVENTS: &str = "applied_events";
pub const CF_EVENT_LOGS: &str = "event_logs";
pub const CF_CHECKPOINTS: &str = "checkpoints";

const COLUMN_FAMILIES: &[&str] = &[
    CF_USERS,
    CF_DATASETS,
    CF_RESEARCH,
    CF_RESEARCH_BY_AUTHOR,
    CF_RESEARCH_BY_TIME,
    CF_CITATIONS,
    CF_REVIEWS,
    CF_APPLIED_EVENTS,
    CF_EVENT_LOGS,
    CF_CHECKPOINTS,
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResearchRecord {
    pub token_id: String,
    pub title: String,
    pub authors: Vec<String>,
    pub content_hash: String,
    pub ipfs_metadata_hash: String,
    pub created_at: DateTime<Utc>,
    pub tx_hash: String,
    pub block_number: u64,
    pub log_index: u64,
    pub citation_count: u64,
    pub review_count: u64,
}

impl ResearchRecord {
    /// Same mint, ignoring counters
    pub fn same_mint(&self, other: &ResearchRecord) -> bool {
        self.token_id == other.token_id
            && self.title == other.title
            && self.authors == other.authors
            && self.content_hash == other.content_hash
            && self.ipfs_metadata_hash == other.ipfs_metadata_hash
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetRecord {
    pub dataset_id: String,
    pub uploader: String,
    pub title: String,
    pub ipfs_hash: String,
    /// uint256 values are kept as decimal strings
    pub access_price: String,
    pub download_count: u64,
    pub citation_count: u64,
    pub revenue: String,
    pub created_at: DateTime<Utc>,
    pub tx_hash: String,
    pub block_number: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub address: String,
    pub name: String,
    pub organization: String,
    pub research_fields: String,
    pub credential_hash: String,
    pub role: u8,
    pub reputation: String,
    pub registered_at: DateTime<Utc>,
    pub tx_hash: String,
    pub block_number: u64,
}

impl UserRecord {
    /// Same registration, ignoring reputation and provenance
    pub fn same_registration(&self, other: &UserRecord) -> bool {
        self.address == other.address
            && self.name == other.name
            && self.organization == other.organization
            && self.research_fields == other.research_fields
            && self.credential_hash == other.credential_hash
            && self.role == other.role
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CitationTarget {
    Research,
    Dataset,
}

impl CitationTarget {
    fn as_str(&self) -> &'static str {
        match self {
            CitationTarget::Research => "research",
            CitationTarget::Dataset => "dataset",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CitationRecord {
    pub target: CitationTarget,
    pub target_id: String,
    pub citer: String,
    pub reference: String,
    pub created_at: DateTime<Utc>,
    pub tx_hash: String,
    pub log_index: u64,
    pub block_number: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewRecord {
    pub token_id: String,
    pub reviewer: String,
    pub score: u8,
    pub review_hash: String,
    pub created_at: DateTime<Utc>,
    pub tx_hash: String,
    pub log_index: u64,
    pub block_number: u64,
}

/// A projected log as it appeared on chain. Topics and data are
/// `0x`-prefixed hex; synthetic events carry none.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub contract: String,
    pub block_number: u64,
    pub block_timestamp: u64,
    pub log_index: u64,
    pub tx_hash: String,
    pub event_name: String,
    pub topics: Vec<String>,
    pub data: String,
}

fn encode<T: Serialize>(column: &'static str, value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| SyncError::Storage(format!("failed to encode {} value: {}", column, e)))
}

fn decode<T: DeserializeOwned>(column: &'static str, bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| SyncError::StateCorruption {
        column,
        reason: e.to_string(),
    })
}

/// Sort suffix that iterates newest first: inverted big-endian
/// (created_at, block, log index)
fn recency_suffix(created_at: &DateTime<Utc>, block_number: u64, log_index: u64) -> [u8; 24] {
    let mut out = [0u8; 24];
    let secs = created_at.timestamp().max(0) as u64;
    out[..8].copy_from_slice(&(u64::MAX - secs).to_be_bytes());
    out[8..16].copy_from_slice(&(u64::MAX - block_number).to_be_bytes());
    out[16..].copy_from_slice(&(u64::MAX - log_index).to_be_bytes());
    out
}

/// Chronological suffix for child rows
fn position_suffix(block_number: u64, log_index: u64) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[..8].copy_from_slice(&block_number.to_be_bytes());
    out[8..].copy_from_slice(&log_index.to_be_bytes());
    out
}

/// Journal key: chain position, then the tx hash to keep synthetic
/// positions apart
fn journal_key(entry: &EventLogEntry) -> Vec<u8> {
    let mut key = position_suffix(entry.block_number, entry.log_index).to_vec();
    key.extend_from_slice(entry.tx_hash.to_ascii_lowercase().as_bytes());
    key
}

fn author_prefix(author: &str) -> Vec<u8> {
    let mut key = author.to_ascii_lowercase().into_bytes();
    key.push(b'/');
    key
}

fn citation_prefix(target: CitationTarget, target_id: &str) -> Vec<u8> {
    format!("{}/{}/", target.as_str(), target_id).into_bytes()
}

fn review_prefix(token_id: &str) -> Vec<u8> {
    format!("{}/", token_id).into_bytes()
}

pub struct SyncStore {
    db: DB,
    writer: Mutex<()>,
}

impl SyncStore {
    /// Open (or create) the store at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()));

        let db = DB::open_cf_descriptors(&opts, path.as_ref(), cf_descriptors)
            .map_err(|e| SyncError::Storage(format!("Failed to open RocksDB at {}: {}", path.as_ref().display(), e)))?;

        log::info!("Opened sync store at {}", path.as_ref().display());
        Ok(Self {
            db,
            writer: Mutex::new(()),
        })
    }

    fn cf(&self, name: &'static str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| SyncError::Storage(format!("{} column family not found", name)))
    }

    fn get_raw(&self, column: &'static str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let cf = self.cf(column)?;
        Ok(self.db.get_cf(&cf, key)?)
    }

    fn get_typed<T: DeserializeOwned>(&self, column: &'static str, key: &[u8]) -> Result<Option<T>> {
        self.get_raw(column, key)?
            .map(|bytes| decode(column, &bytes))
            .transpose()
    }

    /// Values of every key starting with `prefix`, in key order
    fn scan_prefix(&self, column: &'static str, prefix: &[u8]) -> Result<Vec<Vec<u8>>> {
        let cf = self.cf(column)?;
        let mut values = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward)) {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            values.push(value.into_vec());
        }
        Ok(values)
    }

    /// Store connectivity check
    pub fn ping(&self) -> Result<()> {
        self.get_raw(CF_CHECKPOINTS, b"")?;
        Ok(())
    }

    pub fn get_research(&self, token_id: &str) -> Result<ResearchRecord> {
        self.get_typed(CF_RESEARCH, token_id.as_bytes())?
            .ok_or_else(|| SyncError::not_found("research", token_id))
    }

    pub fn get_dataset(&self, dataset_id: &str) -> Result<DatasetRecord> {
        self.get_typed(CF_DATASETS, dataset_id.as_bytes())?
            .ok_or_else(|| SyncError::not_found("dataset", dataset_id))
    }

    pub fn get_user(&self, address: &str) -> Result<UserRecord> {
        let key = address.to_ascii_lowercase();
        self.get_typed(CF_USERS, key.as_bytes())?
            .ok_or_else(|| SyncError::not_found("user", address))
    }

    fn resolve_research(&self, token_ids: Vec<Vec<u8>>) -> Result<Vec<ResearchRecord>> {
        token_ids
            .into_iter()
            .map(|id| {
                let token_id = String::from_utf8(id).map_err(|e| SyncError::StateCorruption {
                    column: CF_RESEARCH_BY_TIME,
                    reason: e.to_string(),
                })?;
                self.get_typed(CF_RESEARCH, token_id.as_bytes())?
                    .ok_or_else(|| SyncError::StateCorruption {
                        column: CF_RESEARCH,
                        reason: format!("index points at missing research {}", token_id),
                    })
            })
            .collect()
    }

    /// Research co-authored by `author`, newest first
    pub fn research_by_author(&self, author: &str, offset: usize, limit: usize) -> Result<Vec<ResearchRecord>> {
        let ids = self
            .scan_prefix(CF_RESEARCH_BY_AUTHOR, &author_prefix(author))?
            .into_iter()
            .skip(offset)
            .take(limit)
            .collect();
        self.resolve_research(ids)
    }

    /// Most recently created research, newest first
    pub fn latest_research(&self, offset: usize, limit: usize) -> Result<Vec<ResearchRecord>> {
        let ids = self
            .scan_prefix(CF_RESEARCH_BY_TIME, b"")?
            .into_iter()
            .skip(offset)
            .take(limit)
            .collect();
        self.resolve_research(ids)
    }

    /// Citations of a research record or dataset, in chain order
    pub fn citations_for(&self, target: CitationTarget, target_id: &str) -> Result<Vec<CitationRecord>> {
        self.scan_prefix(CF_CITATIONS, &citation_prefix(target, target_id))?
            .iter()
            .map(|bytes| decode(CF_CITATIONS, bytes))
            .collect()
    }

    /// Reviews of a research record, in chain order
    pub fn reviews_for(&self, token_id: &str) -> Result<Vec<ReviewRecord>> {
        self.scan_prefix(CF_REVIEWS, &review_prefix(token_id))?
            .iter()
            .map(|bytes| decode(CF_REVIEWS, bytes))
            .collect()
    }

    pub fn is_applied(&self, event_key: &str) -> Result<bool> {
        Ok(self.get_raw(CF_APPLIED_EVENTS, event_key.as_bytes())?.is_some())
    }

    /// Journaled logs with `from <= block <= to`, in chain order
    pub fn events_in_range(&self, from: u64, to: u64) -> Result<Vec<EventLogEntry>> {
        if to < from {
            return Ok(Vec::new());
        }
        let cf = self.cf(CF_EVENT_LOGS)?;
        let start = from.to_be_bytes();
        let mut entries = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::From(&start, Direction::Forward)) {
            let (key, value) = item?;
            let block = key
                .get(..8)
                .and_then(|b| <[u8; 8]>::try_from(b).ok())
                .map(u64::from_be_bytes)
                .ok_or_else(|| SyncError::StateCorruption {
                    column: CF_EVENT_LOGS,
                    reason: format!("short journal key of {} bytes", key.len()),
                })?;
            if block > to {
                break;
            }
            entries.push(decode(CF_EVENT_LOGS, &value)?);
        }
        Ok(entries)
    }

    pub fn checkpoint(&self, listener: &str) -> Result<Option<SyncCheckpoint>> {
        self.get_typed(CF_CHECKPOINTS, listener.as_bytes())
    }

    pub fn checkpoints(&self) -> Result<Vec<SyncCheckpoint>> {
        self.scan_prefix(CF_CHECKPOINTS, b"")?
            .iter()
            .map(|bytes| decode(CF_CHECKPOINTS, bytes))
            .collect()
    }

    /// Start a write. Holds the writer lock until committed or dropped.
    pub fn begin_write(&self) -> StoreBatch<'_> {
        StoreBatch {
            store: self,
            _writer: self.writer.lock(),
            batch: WriteBatch::default(),
            overlay: HashMap::new(),
        }
    }
}

/// Pending atomic write with read-your-writes semantics
pub struct StoreBatch<'a> {
    store: &'a SyncStore,
    _writer: MutexGuard<'a, ()>,
    batch: WriteBatch,
    overlay: HashMap<(&'static str, Vec<u8>), Vec<u8>>,
}

impl<'a> StoreBatch<'a> {
    fn get_typed<T: DeserializeOwned>(&self, column: &'static str, key: &[u8]) -> Result<Option<T>> {
        if let Some(bytes) = self.overlay.get(&(column, key.to_vec())) {
            return decode(column, bytes).map(Some);
        }
        self.store.get_typed(column, key)
    }

    fn put_raw(&mut self, column: &'static str, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        let cf = self.store.cf(column)?;
        self.batch.put_cf(&cf, &key, &value);
        self.overlay.insert((column, key), value);
        Ok(())
    }

    fn put_typed<T: Serialize>(&mut self, column: &'static str, key: Vec<u8>, value: &T) -> Result<()> {
        let bytes = encode(column, value)?;
        self.put_raw(column, key, bytes)
    }

    pub fn get_research(&self, token_id: &str) -> Result<Option<ResearchRecord>> {
        self.get_typed(CF_RESEARCH, token_id.as_bytes())
    }

    /// New research row plus its author and recency index entries
    pub fn insert_research(&mut self, record: &ResearchRecord) -> Result<()> {
        let suffix = recency_suffix(&record.created_at, record.block_number, record.log_index);
        let id = record.token_id.as_bytes();

        let mut time_key = suffix.to_vec();
        time_key.extend_from_slice(id);
        self.put_raw(CF_RESEARCH_BY_TIME, time_key, id.to_vec())?;

        for author in &record.authors {
            let mut author_key = author_prefix(author);
            author_key.extend_from_slice(&suffix);
            author_key.extend_from_slice(id);
            self.put_raw(CF_RESEARCH_BY_AUTHOR, author_key, id.to_vec())?;
        }

        self.put_typed(CF_RESEARCH, id.to_vec(), record)
    }

    /// Rewrite an existing research row; indexes are untouched
    pub fn update_research(&mut self, record: &ResearchRecord) -> Result<()> {
        self.put_typed(CF_RESEARCH, record.token_id.as_bytes().to_vec(), record)
    }

    pub fn get_dataset(&self, dataset_id: &str) -> Result<Option<DatasetRecord>> {
        self.get_typed(CF_DATASETS, dataset_id.as_bytes())
    }

    pub fn put_dataset(&mut self, record: &DatasetRecord) -> Result<()> {
        self.put_typed(CF_DATASETS, record.dataset_id.as_bytes().to_vec(), record)
    }

    pub fn get_user(&self, address: &str) -> Result<Option<UserRecord>> {
        self.get_typed(CF_USERS, address.to_ascii_lowercase().as_bytes())
    }

    pub fn put_user(&mut self, record: &UserRecord) -> Result<()> {
        self.put_typed(CF_USERS, record.address.to_ascii_lowercase().into_bytes(), record)
    }

    pub fn put_citation(&mut self, record: &CitationRecord) -> Result<()> {
        let mut key = citation_prefix(record.target, &record.target_id);
        key.extend_from_slice(&position_suffix(record.block_number, record.log_index));
        self.put_typed(CF_CITATIONS, key, record)
    }

    pub fn put_review(&mut self, record: &ReviewRecord) -> Result<()> {
        let mut key = review_prefix(&record.token_id);
        key.extend_from_slice(&position_suffix(record.block_number, record.log_index));
        self.put_typed(CF_REVIEWS, key, record)
    }

    pub fn is_applied(&self, event_key: &str) -> Result<bool> {
        if self.overlay.contains_key(&(CF_APPLIED_EVENTS, event_key.as_bytes().to_vec())) {
            return Ok(true);
        }
        self.store.is_applied(event_key)
    }

    /// Record that the log identified by `event_key` has been projected
    pub fn mark_applied(&mut self, event_key: &str, event_name: &str) -> Result<()> {
        self.put_raw(
            CF_APPLIED_EVENTS,
            event_key.as_bytes().to_vec(),
            event_name.as_bytes().to_vec(),
        )
    }

    pub fn append_event_log(&mut self, entry: &EventLogEntry) -> Result<()> {
        self.put_typed(CF_EVENT_LOGS, journal_key(entry), entry)
    }

    pub fn get_checkpoint(&self, listener: &str) -> Result<Option<SyncCheckpoint>> {
        self.get_typed(CF_CHECKPOINTS, listener.as_bytes())
    }

    pub fn put_checkpoint(&mut self, checkpoint: &SyncCheckpoint) -> Result<()> {
        self.put_typed(CF_CHECKPOINTS, checkpoint.listener.as_bytes().to_vec(), checkpoint)
    }

    /// Apply every staged write atomically
    pub fn commit(self) -> Result<()> {
        if self.overlay.is_empty() {
            return Ok(());
        }
        let writes = self.overlay.len();
        self.store.db.write(self.batch)?;
        log::trace!("Committed batch of {} writes", writes);
        Ok(())
    }
}
