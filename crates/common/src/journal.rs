//! Hash-chained evidence journal
//!
//! Each entry binds to its predecessor: `hash = sha256(prev_hash || canonical_data)`
//! where `prev_hash` is the lowercase hex of the previous entry's hash (or the
//! declared seed for the first entry) and `canonical_data` is the canonical
//! JSON of the recorded value. Replaying the chain from the seed detects
//! truncation, reordering and altered entries.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::canonical::canonical_bytes;
use crate::{Error, Result};

/// Seed used when a run does not declare one
pub const DEFAULT_CHAIN_SEED: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// A single link in the journal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainedJournalEntry {
    pub prev_hash: String,
    pub canonical_data: String,
    pub hash: String,
}

/// Append-only hash chain rooted at a seed
#[derive(Debug, Clone)]
pub struct HashChain {
    seed: String,
    head: String,
    entries: Vec<ChainedJournalEntry>,
}

impl HashChain {
    /// Start a chain at `seed`, which must be 64 lowercase hex characters
    pub fn new(seed: &str) -> Result<Self> {
        validate_hash("seed", seed)?;
        Ok(Self {
            seed: seed.to_string(),
            head: seed.to_string(),
            entries: Vec::new(),
        })
    }

    pub fn seed(&self) -> &str {
        &self.seed
    }

    /// Current chain head (the seed while empty)
    pub fn head(&self) -> &str {
        &self.head
    }

    pub fn entries(&self) -> &[ChainedJournalEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Canonicalize `data` and append it, returning the new entry
    pub fn append<T: Serialize + ?Sized>(&mut self, data: &T) -> Result<&ChainedJournalEntry> {
        let canonical = String::from_utf8(canonical_bytes(data)?)
            .map_err(|e| Error::Journal(e.to_string()))?;
        let hash = link_hash(&self.head, &canonical);
        let entry = ChainedJournalEntry {
            prev_hash: std::mem::replace(&mut self.head, hash.clone()),
            canonical_data: canonical,
            hash,
        };
        debug!(seq = self.entries.len(), head = %entry.hash, "journal append");
        self.entries.push(entry);
        Ok(&self.entries[self.entries.len() - 1])
    }

    /// One canonical JSON object per line, newline terminated
    pub fn to_jsonl(&self) -> Result<String> {
        let mut out = String::new();
        for entry in &self.entries {
            let line = canonical_bytes(entry)?;
            out.push_str(&String::from_utf8_lossy(&line));
            out.push('\n');
        }
        Ok(out)
    }
}

/// Parse a JSONL journal as written by [`HashChain::to_jsonl`]
pub fn parse_jsonl(content: &str) -> Result<Vec<ChainedJournalEntry>> {
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).map_err(Error::from))
        .collect()
}

/// Replay `entries` from `seed` and return the resulting head.
///
/// Fails on the first entry whose predecessor link or hash does not match.
/// When `expected_head` is given the final head must equal it, which is what
/// catches truncation of a trailing suffix.
pub fn verify_chain(
    seed: &str,
    entries: &[ChainedJournalEntry],
    expected_head: Option<&str>,
) -> Result<String> {
    validate_hash("seed", seed)?;
    let mut head = seed.to_string();

    for (i, entry) in entries.iter().enumerate() {
        if entry.prev_hash != head {
            return Err(Error::Journal(format!(
                "entry {} links to {} but chain head is {}",
                i, entry.prev_hash, head
            )));
        }
        let recomputed = link_hash(&head, &entry.canonical_data);
        if recomputed != entry.hash {
            return Err(Error::Journal(format!(
                "entry {} hash mismatch: recorded {}, recomputed {}",
                i, entry.hash, recomputed
            )));
        }
        head = recomputed;
    }

    if let Some(expected) = expected_head {
        if expected != head {
            return Err(Error::Journal(format!(
                "chain head {} does not match expected {}",
                head, expected
            )));
        }
    }

    Ok(head)
}

fn link_hash(prev_hash: &str, canonical_data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(canonical_data.as_bytes());
    hex::encode(hasher.finalize())
}

fn validate_hash(label: &str, value: &str) -> Result<()> {
    let ok = value.len() == 64
        && value
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    if !ok {
        return Err(Error::Journal(format!(
            "{} must be 64 lowercase hex characters",
            label
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_chain() -> HashChain {
        let mut chain = HashChain::new(DEFAULT_CHAIN_SEED).unwrap();
        chain.append(&json!({"step": 0, "action": "navigate"})).unwrap();
        chain.append(&json!({"step": 1, "action": "click"})).unwrap();
        chain.append(&json!({"step": 2, "action": "fill"})).unwrap();
        chain
    }

    #[test]
    fn test_first_entry_links_to_seed() {
        let chain = sample_chain();
        assert_eq!(chain.entries()[0].prev_hash, DEFAULT_CHAIN_SEED);
        assert_eq!(chain.entries()[1].prev_hash, chain.entries()[0].hash);
        assert_eq!(chain.head(), chain.entries()[2].hash);
    }

    #[test]
    fn test_replay_reaches_same_head() {
        let chain = sample_chain();
        let head = verify_chain(DEFAULT_CHAIN_SEED, chain.entries(), Some(chain.head())).unwrap();
        assert_eq!(head, chain.head());
    }

    #[test]
    fn test_reordering_is_detected() {
        let chain = sample_chain();
        let mut entries = chain.entries().to_vec();
        entries.swap(1, 2);
        assert!(verify_chain(DEFAULT_CHAIN_SEED, &entries, None).is_err());
    }

    #[test]
    fn test_truncation_is_detected_against_head() {
        let chain = sample_chain();
        let entries = &chain.entries()[..2];
        assert!(verify_chain(DEFAULT_CHAIN_SEED, entries, None).is_ok());
        assert!(verify_chain(DEFAULT_CHAIN_SEED, entries, Some(chain.head())).is_err());
    }

    #[test]
    fn test_altered_data_is_detected() {
        let chain = sample_chain();
        let mut entries = chain.entries().to_vec();
        entries[1].canonical_data = r#"{"action":"click","step":9}"#.to_string();
        assert!(verify_chain(DEFAULT_CHAIN_SEED, &entries, None).is_err());
    }

    #[test]
    fn test_jsonl_round_trip_verifies() {
        let chain = sample_chain();
        let parsed = parse_jsonl(&chain.to_jsonl().unwrap()).unwrap();
        assert_eq!(parsed, chain.entries());
    }

    #[test]
    fn test_bad_seed_rejected() {
        assert!(HashChain::new("not-a-hash").is_err());
        assert!(HashChain::new(&"A".repeat(64)).is_err());
    }
}
