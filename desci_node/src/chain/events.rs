//! Typed decoding of platform contract logs
//!
//! Every log is matched on topic0 against the closed set of events the
//! platform contracts emit and decoded into a [`DomainEvent`]. Logs with an
//! unrecognised topic0 become [`DomainEvent::Unknown`]; logs that match a
//! known signature but carry a malformed payload fail with
//! [`SyncError::Decode`].

use ethers::abi::{Abi, Event, RawLog, Token};
use ethers::types::{Address, Bytes, H256, U256};
use lazy_static::lazy_static;
use std::collections::HashMap;
use std::str::FromStr;

use super::{address_key, ChainEvent, EventMeta};
use crate::error::{Result, SyncError};

const EVENT_SIGNATURES: &[&str] = &[
    "event UserRegistered(address indexed user, string name, string organization, string researchFields, string credentialHash, uint8 role)",
    "event ReputationUpdated(address indexed user, uint256 oldReputation, uint256 newReputation)",
    "event DatasetUploaded(uint256 indexed datasetId, address indexed uploader, string title, string ipfsHash, uint256 accessPrice)",
    "event DatasetPurchased(uint256 indexed datasetId, address indexed buyer, uint256 price)",
    "event DatasetCited(uint256 indexed datasetId, address indexed citer, string researchRef)",
    "event ResearchMinted(uint256 indexed tokenId, address[] authors, string title, string contentHash, string metadataHash)",
    "event ResearchCited(uint256 indexed tokenId, address indexed citer, string citingRef)",
    "event PeerReviewSubmitted(uint256 indexed tokenId, address indexed reviewer, uint8 score, string reviewHash)",
];

pub const UNKNOWN_EVENT: &str = "Unknown";

lazy_static! {
    static ref EVENT_ABI: Abi =
        ethers::abi::parse_abi(EVENT_SIGNATURES).expect("platform event signatures are valid");
    static ref EVENTS_BY_TOPIC: HashMap<H256, Event> = EVENT_ABI
        .events()
        .map(|event| (event.signature(), event.clone()))
        .collect();
}

/// Event ABI for a known event name
pub fn event_abi(name: &str) -> Option<&'static Event> {
    EVENTS_BY_TOPIC.values().find(|event| event.name == name)
}

/// Event name for a topic0, or `"Unknown"`
pub fn event_name(topic0: Option<&H256>) -> &'static str {
    topic0
        .and_then(|t| EVENTS_BY_TOPIC.get(t))
        .map(|event| event.name.as_str())
        .unwrap_or(UNKNOWN_EVENT)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainEvent {
    UserRegistered {
        user: String,
        name: String,
        organization: String,
        research_fields: String,
        credential_hash: String,
        role: u8,
    },
    ReputationUpdated {
        user: String,
        old_reputation: U256,
        new_reputation: U256,
    },
    DatasetUploaded {
        dataset_id: String,
        uploader: String,
        title: String,
        ipfs_hash: String,
        access_price: U256,
    },
    DatasetPurchased {
        dataset_id: String,
        buyer: String,
        price: U256,
    },
    DatasetCited {
        dataset_id: String,
        citer: String,
        research_ref: String,
    },
    ResearchMinted {
        token_id: String,
        authors: Vec<String>,
        title: String,
        content_hash: String,
        metadata_hash: String,
    },
    ResearchCited {
        token_id: String,
        citer: String,
        citing_ref: String,
    },
    PeerReviewSubmitted {
        token_id: String,
        reviewer: String,
        score: u8,
        review_hash: String,
    },
    Unknown {
        topic0: Option<H256>,
    },
}

impl DomainEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DomainEvent::UserRegistered { .. } => "UserRegistered",
            DomainEvent::ReputationUpdated { .. } => "ReputationUpdated",
            DomainEvent::DatasetUploaded { .. } => "DatasetUploaded",
            DomainEvent::DatasetPurchased { .. } => "DatasetPurchased",
            DomainEvent::DatasetCited { .. } => "DatasetCited",
            DomainEvent::ResearchMinted { .. } => "ResearchMinted",
            DomainEvent::ResearchCited { .. } => "ResearchCited",
            DomainEvent::PeerReviewSubmitted { .. } => "PeerReviewSubmitted",
            DomainEvent::Unknown { .. } => UNKNOWN_EVENT,
        }
    }

    /// ABI tokens in declaration order. Ids are chain `uint256` values, so
    /// non-numeric ids (as used by demo seeding) cannot be encoded.
    fn tokens(&self) -> Result<Vec<Token>> {
        let tokens = match self {
            DomainEvent::UserRegistered {
                user,
                name,
                organization,
                research_fields,
                credential_hash,
                role,
            } => vec![
                Token::Address(parse_address(user)?),
                Token::String(name.clone()),
                Token::String(organization.clone()),
                Token::String(research_fields.clone()),
                Token::String(credential_hash.clone()),
                Token::Uint(U256::from(*role)),
            ],
            DomainEvent::ReputationUpdated {
                user,
                old_reputation,
                new_reputation,
            } => vec![
                Token::Address(parse_address(user)?),
                Token::Uint(*old_reputation),
                Token::Uint(*new_reputation),
            ],
            DomainEvent::DatasetUploaded {
                dataset_id,
                uploader,
                title,
                ipfs_hash,
                access_price,
            } => vec![
                Token::Uint(parse_id(dataset_id)?),
                Token::Address(parse_address(uploader)?),
                Token::String(title.clone()),
                Token::String(ipfs_hash.clone()),
                Token::Uint(*access_price),
            ],
            DomainEvent::DatasetPurchased {
                dataset_id,
                buyer,
                price,
            } => vec![
                Token::Uint(parse_id(dataset_id)?),
                Token::Address(parse_address(buyer)?),
                Token::Uint(*price),
            ],
            DomainEvent::DatasetCited {
                dataset_id,
                citer,
                research_ref,
            } => vec![
                Token::Uint(parse_id(dataset_id)?),
                Token::Address(parse_address(citer)?),
                Token::String(research_ref.clone()),
            ],
            DomainEvent::ResearchMinted {
                token_id,
                authors,
                title,
                content_hash,
                metadata_hash,
            } => vec![
                Token::Uint(parse_id(token_id)?),
                Token::Array(
                    authors
                        .iter()
                        .map(|a| parse_address(a).map(Token::Address))
                        .collect::<Result<Vec<_>>>()?,
                ),
                Token::String(title.clone()),
                Token::String(content_hash.clone()),
                Token::String(metadata_hash.clone()),
            ],
            DomainEvent::ResearchCited {
                token_id,
                citer,
                citing_ref,
            } => vec![
                Token::Uint(parse_id(token_id)?),
                Token::Address(parse_address(citer)?),
                Token::String(citing_ref.clone()),
            ],
            DomainEvent::PeerReviewSubmitted {
                token_id,
                reviewer,
                score,
                review_hash,
            } => vec![
                Token::Uint(parse_id(token_id)?),
                Token::Address(parse_address(reviewer)?),
                Token::Uint(U256::from(*score)),
                Token::String(review_hash.clone()),
            ],
            DomainEvent::Unknown { .. } => {
                return Err(SyncError::Config("cannot encode an unknown event".into()))
            }
        };
        Ok(tokens)
    }

    /// Encode as the (topics, data) pair the contract would emit
    pub fn encode_log(&self) -> Result<(Vec<H256>, Bytes)> {
        let event = event_abi(self.name())
            .ok_or_else(|| SyncError::Config(format!("no ABI for {}", self.name())))?;
        let tokens = self.tokens()?;

        let mut topics = vec![event.signature()];
        let mut data_tokens = Vec::new();
        for (param, token) in event.inputs.iter().zip(tokens) {
            if param.indexed {
                topics.push(indexed_topic(&token));
            } else {
                data_tokens.push(token);
            }
        }
        Ok((topics, Bytes::from(ethers::abi::encode(&data_tokens))))
    }
}

fn indexed_topic(token: &Token) -> H256 {
    match token {
        Token::Address(addr) => H256::from(*addr),
        Token::Uint(value) => {
            let mut buf = [0u8; 32];
            value.to_big_endian(&mut buf);
            H256::from(buf)
        }
        other => H256::from_slice(&ethers::utils::keccak256(ethers::abi::encode(&[other.clone()]))),
    }
}

fn parse_address(value: &str) -> Result<Address> {
    Address::from_str(value).map_err(|e| SyncError::Config(format!("invalid address {value}: {e}")))
}

fn parse_id(value: &str) -> Result<U256> {
    U256::from_dec_str(value).map_err(|e| SyncError::Config(format!("invalid uint256 id {value}: {e}")))
}

/// Topics and data exactly as the log carried them
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPayload {
    pub topics: Vec<H256>,
    pub data: Bytes,
}

/// A log decoded into its domain meaning, with provenance. `raw` is
/// `None` for events that never came from a log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedEvent {
    pub meta: EventMeta,
    pub event: DomainEvent,
    pub raw: Option<RawPayload>,
}

/// Decode a chain log into a domain event
pub fn decode(log: &ChainEvent) -> Result<DecodedEvent> {
    let meta = log.meta();
    let raw = Some(RawPayload {
        topics: log.topics.clone(),
        data: log.data.clone(),
    });
    let topic0 = log.topics.first();
    let Some(event) = topic0.and_then(|t| EVENTS_BY_TOPIC.get(t)) else {
        return Ok(DecodedEvent {
            meta,
            event: DomainEvent::Unknown { topic0: topic0.copied() },
            raw,
        });
    };

    let decode_err = |reason: String| SyncError::Decode {
        event: event.name.clone(),
        tx_hash: meta.tx_hash.clone(),
        log_index: meta.log_index,
        reason,
    };

    let parsed = event
        .parse_log(RawLog {
            topics: log.topics.clone(),
            data: log.data.to_vec(),
        })
        .map_err(|e| decode_err(e.to_string()))?;
    let mut args = Args {
        params: parsed
            .params
            .into_iter()
            .map(|p| (p.name, p.value))
            .collect(),
    };

    let domain = match event.name.as_str() {
        "UserRegistered" => DomainEvent::UserRegistered {
            user: args.address("user").map_err(decode_err)?,
            name: args.string("name").map_err(decode_err)?,
            organization: args.string("organization").map_err(decode_err)?,
            research_fields: args.string("researchFields").map_err(decode_err)?,
            credential_hash: args.string("credentialHash").map_err(decode_err)?,
            role: args.small_uint("role").map_err(decode_err)?,
        },
        "ReputationUpdated" => DomainEvent::ReputationUpdated {
            user: args.address("user").map_err(decode_err)?,
            old_reputation: args.uint("oldReputation").map_err(decode_err)?,
            new_reputation: args.uint("newReputation").map_err(decode_err)?,
        },
        "DatasetUploaded" => DomainEvent::DatasetUploaded {
            dataset_id: args.uint("datasetId").map_err(decode_err)?.to_string(),
            uploader: args.address("uploader").map_err(decode_err)?,
            title: args.string("title").map_err(decode_err)?,
            ipfs_hash: args.string("ipfsHash").map_err(decode_err)?,
            access_price: args.uint("accessPrice").map_err(decode_err)?,
        },
        "DatasetPurchased" => DomainEvent::DatasetPurchased {
            dataset_id: args.uint("datasetId").map_err(decode_err)?.to_string(),
            buyer: args.address("buyer").map_err(decode_err)?,
            price: args.uint("price").map_err(decode_err)?,
        },
        "DatasetCited" => DomainEvent::DatasetCited {
            dataset_id: args.uint("datasetId").map_err(decode_err)?.to_string(),
            citer: args.address("citer").map_err(decode_err)?,
            research_ref: args.string("researchRef").map_err(decode_err)?,
        },
        "ResearchMinted" => DomainEvent::ResearchMinted {
            token_id: args.uint("tokenId").map_err(decode_err)?.to_string(),
            authors: args.address_array("authors").map_err(decode_err)?,
            title: args.string("title").map_err(decode_err)?,
            content_hash: args.string("contentHash").map_err(decode_err)?,
            metadata_hash: args.string("metadataHash").map_err(decode_err)?,
        },
        "ResearchCited" => DomainEvent::ResearchCited {
            token_id: args.uint("tokenId").map_err(decode_err)?.to_string(),
            citer: args.address("citer").map_err(decode_err)?,
            citing_ref: args.string("citingRef").map_err(decode_err)?,
        },
        "PeerReviewSubmitted" => DomainEvent::PeerReviewSubmitted {
            token_id: args.uint("tokenId").map_err(decode_err)?.to_string(),
            reviewer: args.address("reviewer").map_err(decode_err)?,
            score: args.small_uint("score").map_err(decode_err)?,
            review_hash: args.string("reviewHash").map_err(decode_err)?,
        },
        _ => DomainEvent::Unknown { topic0: topic0.copied() },
    };

    Ok(DecodedEvent {
        meta,
        event: domain,
        raw,
    })
}

/// Named log parameters, consumed field by field
struct Args {
    params: HashMap<String, Token>,
}

impl Args {
    fn take(&mut self, name: &str) -> std::result::Result<Token, String> {
        self.params
            .remove(name)
            .ok_or_else(|| format!("missing parameter {name}"))
    }

    fn address(&mut self, name: &str) -> std::result::Result<String, String> {
        match self.take(name)? {
            Token::Address(addr) => Ok(address_key(&addr)),
            other => Err(format!("{name}: expected address, got {other:?}")),
        }
    }

    fn address_array(&mut self, name: &str) -> std::result::Result<Vec<String>, String> {
        match self.take(name)? {
            Token::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    Token::Address(addr) => Ok(address_key(&addr)),
                    other => Err(format!("{name}: expected address element, got {other:?}")),
                })
                .collect(),
            other => Err(format!("{name}: expected address[], got {other:?}")),
        }
    }

    fn string(&mut self, name: &str) -> std::result::Result<String, String> {
        match self.take(name)? {
            Token::String(s) => Ok(s),
            other => Err(format!("{name}: expected string, got {other:?}")),
        }
    }

    fn uint(&mut self, name: &str) -> std::result::Result<U256, String> {
        match self.take(name)? {
            Token::Uint(v) => Ok(v),
            other => Err(format!("{name}: expected uint, got {other:?}")),
        }
    }

    fn small_uint(&mut self, name: &str) -> std::result::Result<u8, String> {
        let value = self.uint(name)?;
        if value > U256::from(u8::MAX) {
            return Err(format!("{name}: {value} does not fit in uint8"));
        }
        Ok(value.low_u32() as u8)
    }
}
