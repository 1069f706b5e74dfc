//! Event projector
//!
//! Applies decoded events to the read model in (block, log index) order.
//! Every event is keyed by its source log; a log that was already applied
//! is a no-op, so replaying any range leaves the store unchanged. Applied
//! logs are also appended to the event journal. A batch, including its
//! checkpoint advance, is committed as one atomic write; a natural key that
//! reappears with different content rejects the whole batch.

use chrono::{DateTime, Utc};
use ethers::types::U256;
use std::collections::HashMap;
use std::sync::Arc;

use crate::chain::{DecodedEvent, DomainEvent, EventMeta};
use crate::error::{Result, SyncError};
use crate::metrics;
use crate::storage::{
    CheckpointTracker, CitationRecord, CitationTarget, DatasetRecord, EventLogEntry, ResearchRecord, ReviewRecord,
    StoreBatch, SyncStore, UserRecord, CF_DATASETS, CF_RESEARCH, CF_USERS,
};

/// Per-batch projection counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub applied: usize,
    pub duplicates: usize,
    pub skipped: usize,
}

impl BatchOutcome {
    pub fn total(&self) -> usize {
        self.applied + self.duplicates + self.skipped
    }
}

enum Effect {
    Applied,
    Skipped,
}

pub struct EventProjector {
    store: Arc<SyncStore>,
}

impl EventProjector {
    pub fn new(store: Arc<SyncStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<SyncStore> {
        &self.store
    }

    /// Project events without moving any checkpoint
    pub fn project(&self, events: &[DecodedEvent]) -> Result<BatchOutcome> {
        self.project_batch(events, None)
    }

    /// Project `events` and, when given, advance the checkpoint in the same
    /// atomic write. On error nothing is written.
    pub fn project_batch(
        &self,
        events: &[DecodedEvent],
        checkpoint: Option<(&CheckpointTracker, u64)>,
    ) -> Result<BatchOutcome> {
        let mut ordered: Vec<&DecodedEvent> = events.iter().collect();
        ordered.sort_by_key(|e| e.meta.cursor());

        let mut outcome = BatchOutcome::default();
        let mut applied_by_name: HashMap<&'static str, u64> = HashMap::new();
        let mut batch = self.store.begin_write();

        for decoded in ordered {
            let key = decoded.meta.event_key();
            if batch.is_applied(&key)? {
                log::debug!("Skipping already applied {} {}", decoded.event.name(), key);
                outcome.duplicates += 1;
                continue;
            }

            match apply(&mut batch, &decoded.meta, &decoded.event)? {
                Effect::Applied => {
                    outcome.applied += 1;
                    *applied_by_name.entry(decoded.event.name()).or_default() += 1;
                }
                Effect::Skipped => outcome.skipped += 1,
            }
            batch.append_event_log(&journal_entry(decoded))?;
            batch.mark_applied(&key, decoded.event.name())?;
        }

        if let Some((tracker, block)) = checkpoint {
            tracker.stage(&mut batch, block)?;
        }
        batch.commit()?;

        for (name, count) in applied_by_name {
            metrics::EVENTS_PROJECTED.with_label_values(&[name]).inc_by(count);
        }
        metrics::EVENTS_DUPLICATE.inc_by(outcome.duplicates as u64);
        if let Some((tracker, block)) = checkpoint {
            metrics::LISTENER_CHECKPOINT
                .with_label_values(&[tracker.listener()])
                .set(block as i64);
        }

        Ok(outcome)
    }
}

fn created_at(meta: &EventMeta) -> DateTime<Utc> {
    DateTime::from_timestamp(meta.block_timestamp as i64, 0).unwrap_or_default()
}

fn parse_amount(column: &'static str, value: &str) -> Result<U256> {
    U256::from_dec_str(value).map_err(|e| SyncError::StateCorruption {
        column,
        reason: format!("invalid amount {value}: {e}"),
    })
}

/// A natural key seen again with different content. The store and the
/// chain disagree, so the batch is rejected and the listener stops.
fn conflict(column: &'static str, key: &str, meta: &EventMeta) -> SyncError {
    metrics::PROJECTION_CONFLICTS.with_label_values(&[column]).inc();
    log::error!(
        "Projection conflict on {} {} from {}: stored content differs",
        column,
        key,
        meta.event_key()
    );
    SyncError::StateCorruption {
        column,
        reason: format!("{} re-emitted by {} with different content", key, meta.event_key()),
    }
}

fn hex_prefixed(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

fn journal_entry(decoded: &DecodedEvent) -> EventLogEntry {
    let meta = &decoded.meta;
    let (topics, data) = match &decoded.raw {
        Some(raw) => (
            raw.topics.iter().map(|t| hex_prefixed(t.as_bytes())).collect(),
            hex_prefixed(&raw.data),
        ),
        None => (Vec::new(), "0x".to_string()),
    };
    EventLogEntry {
        contract: meta.contract.clone(),
        block_number: meta.block_number,
        block_timestamp: meta.block_timestamp,
        log_index: meta.log_index,
        tx_hash: meta.tx_hash.clone(),
        event_name: decoded.event.name().to_string(),
        topics,
        data,
    }
}

fn missing_parent(event: &DomainEvent, entity: &str, key: &str, meta: &EventMeta) -> Effect {
    log::warn!(
        "Skipping {} at {}: {} {} does not exist",
        event.name(),
        meta.event_key(),
        entity,
        key
    );
    Effect::Skipped
}

fn apply(batch: &mut StoreBatch<'_>, meta: &EventMeta, event: &DomainEvent) -> Result<Effect> {
    match event {
        DomainEvent::UserRegistered {
            user,
            name,
            organization,
            research_fields,
            credential_hash,
            role,
        } => {
            let record = UserRecord {
                address: user.to_ascii_lowercase(),
                name: name.clone(),
                organization: organization.clone(),
                research_fields: research_fields.clone(),
                credential_hash: credential_hash.clone(),
                role: *role,
                reputation: "0".to_string(),
                registered_at: created_at(meta),
                tx_hash: meta.tx_hash.clone(),
                block_number: meta.block_number,
            };
            match batch.get_user(user)? {
                Some(existing) if existing.same_registration(&record) => Ok(Effect::Skipped),
                Some(_) => Err(conflict(CF_USERS, user, meta)),
                None => {
                    batch.put_user(&record)?;
                    Ok(Effect::Applied)
                }
            }
        }

        DomainEvent::ReputationUpdated {
            user, new_reputation, ..
        } => {
            let Some(mut record) = batch.get_user(user)? else {
                return Ok(missing_parent(event, "user", user, meta));
            };
            record.reputation = new_reputation.to_string();
            batch.put_user(&record)?;
            Ok(Effect::Applied)
        }

        DomainEvent::DatasetUploaded {
            dataset_id,
            uploader,
            title,
            ipfs_hash,
            access_price,
        } => {
            let record = DatasetRecord {
                dataset_id: dataset_id.clone(),
                uploader: uploader.to_ascii_lowercase(),
                title: title.clone(),
                ipfs_hash: ipfs_hash.clone(),
                access_price: access_price.to_string(),
                download_count: 0,
                citation_count: 0,
                revenue: "0".to_string(),
                created_at: created_at(meta),
                tx_hash: meta.tx_hash.clone(),
                block_number: meta.block_number,
            };
            match batch.get_dataset(dataset_id)? {
                Some(existing)
                    if existing.uploader == record.uploader
                        && existing.title == record.title
                        && existing.ipfs_hash == record.ipfs_hash =>
                {
                    Ok(Effect::Skipped)
                }
                Some(_) => Err(conflict(CF_DATASETS, dataset_id, meta)),
                None => {
                    batch.put_dataset(&record)?;
                    Ok(Effect::Applied)
                }
            }
        }

        DomainEvent::DatasetPurchased { dataset_id, price, .. } => {
            let Some(mut record) = batch.get_dataset(dataset_id)? else {
                return Ok(missing_parent(event, "dataset", dataset_id, meta));
            };
            let revenue = parse_amount(CF_DATASETS, &record.revenue)?;
            record.download_count += 1;
            record.revenue = revenue.saturating_add(*price).to_string();
            batch.put_dataset(&record)?;
            Ok(Effect::Applied)
        }

        DomainEvent::DatasetCited {
            dataset_id,
            citer,
            research_ref,
        } => {
            let Some(mut record) = batch.get_dataset(dataset_id)? else {
                return Ok(missing_parent(event, "dataset", dataset_id, meta));
            };
            batch.put_citation(&CitationRecord {
                target: CitationTarget::Dataset,
                target_id: dataset_id.clone(),
                citer: citer.to_ascii_lowercase(),
                reference: research_ref.clone(),
                created_at: created_at(meta),
                tx_hash: meta.tx_hash.clone(),
                log_index: meta.log_index,
                block_number: meta.block_number,
            })?;
            record.citation_count += 1;
            batch.put_dataset(&record)?;
            Ok(Effect::Applied)
        }

        DomainEvent::ResearchMinted {
            token_id,
            authors,
            title,
            content_hash,
            metadata_hash,
        } => {
            let record = ResearchRecord {
                token_id: token_id.clone(),
                title: title.clone(),
                authors: authors.iter().map(|a| a.to_ascii_lowercase()).collect(),
                content_hash: content_hash.clone(),
                ipfs_metadata_hash: metadata_hash.clone(),
                created_at: created_at(meta),
                tx_hash: meta.tx_hash.clone(),
                block_number: meta.block_number,
                log_index: meta.log_index,
                citation_count: 0,
                review_count: 0,
            };
            match batch.get_research(token_id)? {
                Some(existing) if existing.same_mint(&record) => Ok(Effect::Skipped),
                Some(_) => Err(conflict(CF_RESEARCH, token_id, meta)),
                None => {
                    batch.insert_research(&record)?;
                    Ok(Effect::Applied)
                }
            }
        }

        DomainEvent::ResearchCited {
            token_id,
            citer,
            citing_ref,
        } => {
            let Some(mut record) = batch.get_research(token_id)? else {
                return Ok(missing_parent(event, "research", token_id, meta));
            };
            batch.put_citation(&CitationRecord {
                target: CitationTarget::Research,
                target_id: token_id.clone(),
                citer: citer.to_ascii_lowercase(),
                reference: citing_ref.clone(),
                created_at: created_at(meta),
                tx_hash: meta.tx_hash.clone(),
                log_index: meta.log_index,
                block_number: meta.block_number,
            })?;
            record.citation_count += 1;
            batch.update_research(&record)?;
            Ok(Effect::Applied)
        }

        DomainEvent::PeerReviewSubmitted {
            token_id,
            reviewer,
            score,
            review_hash,
        } => {
            let Some(mut record) = batch.get_research(token_id)? else {
                return Ok(missing_parent(event, "research", token_id, meta));
            };
            batch.put_review(&ReviewRecord {
                token_id: token_id.clone(),
                reviewer: reviewer.to_ascii_lowercase(),
                score: *score,
                review_hash: review_hash.clone(),
                created_at: created_at(meta),
                tx_hash: meta.tx_hash.clone(),
                log_index: meta.log_index,
                block_number: meta.block_number,
            })?;
            record.review_count += 1;
            batch.update_research(&record)?;
            Ok(Effect::Applied)
        }

        DomainEvent::Unknown { topic0 } => {
            log::debug!("Ignoring unknown event {:?} at {}", topic0, meta.event_key());
            Ok(Effect::Skipped)
        }
    }
}
