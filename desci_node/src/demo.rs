//! Demo data for local runs without a deployed chain
//!
//! Records are pushed through the projector like real events, keyed by
//! fixed synthetic log positions, so seeding twice is a no-op and no
//! checkpoint moves.

use chrono::Utc;
use ethers::types::U256;
use ethers::utils::keccak256;

use crate::chain::{DecodedEvent, DomainEvent, EventMeta};
use crate::error::Result;
use crate::projector::{BatchOutcome, EventProjector};
use crate::verify::{content_hash, HashAlgorithm};

pub const DEMO_TOKEN_ID: &str = "demo-token-123";
pub const DEMO_DATASET_ID: &str = "dataset-456";
pub const DEMO_AUTHOR: &str = "0x742d35cc6731c0532925a3b8d4ca78fc6fd7f4dc";
pub const DEMO_CONTENT: &str =
    "Blockchain-based management of scientific data: provenance, integrity and open access for research outputs.";

const DEMO_CONTRACT: &str = "0x0000000000000000000000000000000000000000";

fn synthetic_meta(label: &str, log_index: u64, timestamp: u64) -> EventMeta {
    EventMeta {
        contract: DEMO_CONTRACT.to_string(),
        block_number: 0,
        block_timestamp: timestamp,
        tx_hash: format!("0x{}", hex::encode(keccak256(format!("desci-demo:{label}")))),
        log_index,
    }
}

/// Demo researcher, research record and dataset
pub fn demo_events(algorithm: HashAlgorithm) -> Vec<DecodedEvent> {
    let now = Utc::now().timestamp().max(0) as u64;
    vec![
        DecodedEvent {
            meta: synthetic_meta("user", 0, now),
            event: DomainEvent::UserRegistered {
                user: DEMO_AUTHOR.to_string(),
                name: "Demo Researcher".to_string(),
                organization: "DeSci Lab".to_string(),
                research_fields: "Blockchain, Data Management".to_string(),
                credential_hash: "QmDemoCredentials".to_string(),
                role: 1,
            },
            raw: None,
        },
        DecodedEvent {
            meta: synthetic_meta("research", 1, now),
            event: DomainEvent::ResearchMinted {
                token_id: DEMO_TOKEN_ID.to_string(),
                authors: vec![DEMO_AUTHOR.to_string()],
                title: "Blockchain applications in scientific data management".to_string(),
                content_hash: content_hash(algorithm, DEMO_CONTENT),
                metadata_hash: "QmDemoResearchMetadata".to_string(),
            },
            raw: None,
        },
        DecodedEvent {
            meta: synthetic_meta("dataset", 2, now),
            event: DomainEvent::DatasetUploaded {
                dataset_id: DEMO_DATASET_ID.to_string(),
                uploader: DEMO_AUTHOR.to_string(),
                title: "Ethereum mainnet transactions 2023".to_string(),
                ipfs_hash: "QmX7VmP8K9Z1N2M3B4A5C6D7E8F9G0H1I2J3K4L5M6N7O8P9Q".to_string(),
                access_price: U256::from(10u64).pow(U256::from(16u64)),
            },
            raw: None,
        },
    ]
}

pub fn seed_demo_data(projector: &EventProjector, algorithm: HashAlgorithm) -> Result<BatchOutcome> {
    let outcome = projector.project(&demo_events(algorithm))?;
    log::info!(
        "Seeded demo data: {} applied, {} already present (token {}, dataset {})",
        outcome.applied,
        outcome.duplicates,
        DEMO_TOKEN_ID,
        DEMO_DATASET_ID
    );
    Ok(outcome)
}
