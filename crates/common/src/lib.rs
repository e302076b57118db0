//! FlowSeal Common Library
//!
//! Integrity primitives shared by the runner and the verifier:
//! canonical serialization, SHA-256 helpers, the hash-chained journal,
//! integrity strategies and the packet sealer.

pub mod canonical;
pub mod digest;
pub mod error;
pub mod integrity;
pub mod journal;
pub mod seal;

// Re-export commonly used types
pub use canonical::{canonical_bytes, canonical_string, SharedNode};
pub use digest::{hash_file, sha256_canonical, sha256_hex};
pub use error::{Error, Result};
pub use integrity::{IntegrityMode, IntegrityStrategy, IntegritySummary};
pub use journal::{ChainedJournalEntry, HashChain, DEFAULT_CHAIN_SEED};
pub use seal::{verify_packet, Manifest, ManifestEntry, PacketSeal, PacketVerification, Sealer};

/// FlowSeal version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
