//! Content integrity verification
//!
//! Research content is hashed at mint time as Keccak-256 over the UTF-8
//! bytes of the raw text, rendered as `0x`-prefixed lowercase hex. The
//! verifier recomputes that digest and compares it with the hash recorded
//! on chain. Nothing is written.

use serde::{Deserialize, Serialize};
use sha2::Sha256;
use sha3::{Digest, Keccak256};

use crate::error::Result;
use crate::storage::SyncStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Keccak256,
    Sha256,
}

impl HashAlgorithm {
    pub fn digest_hex(&self, data: &[u8]) -> String {
        let digest = match self {
            HashAlgorithm::Keccak256 => Keccak256::digest(data).to_vec(),
            HashAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
        };
        format!("0x{}", hex::encode(digest))
    }
}

/// Outcome of a verification; never persisted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationResult {
    pub requested_hash: String,
    pub computed_hash: String,
    pub matched: bool,
}

/// Hash of `raw` as recorded at mint time
pub fn content_hash(algorithm: HashAlgorithm, raw: &str) -> String {
    algorithm.digest_hex(raw.as_bytes())
}

/// Compare a locally computed digest against an on-chain hash. Hex case is
/// not significant; any content difference is.
pub fn hash_matches(algorithm: HashAlgorithm, raw: &str, chain_hash: &str) -> VerificationResult {
    let computed_hash = content_hash(algorithm, raw);
    let matched = normalize(&computed_hash) == normalize(chain_hash);
    VerificationResult {
        requested_hash: chain_hash.to_string(),
        computed_hash,
        matched,
    }
}

fn normalize(hash: &str) -> String {
    let trimmed = hash.trim();
    let body = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    body.to_ascii_lowercase()
}

pub struct ContentVerifier {
    algorithm: HashAlgorithm,
}

impl ContentVerifier {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        Self { algorithm }
    }

    /// Verify `raw_content` against the stored hash of `token_id`.
    /// Fails with `NotFound` when the token was never projected.
    pub fn verify(&self, store: &SyncStore, token_id: &str, raw_content: &str) -> Result<VerificationResult> {
        let record = store.get_research(token_id)?;
        let result = hash_matches(self.algorithm, raw_content, &record.content_hash);
        log::debug!(
            "Verified token {}: match={} (computed {})",
            token_id,
            result.matched,
            result.computed_hash
        );
        Ok(result)
    }
}
