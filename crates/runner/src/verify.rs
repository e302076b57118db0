//! Independent re-verification of a sealed deliverable
//!
//! Packet checks come from `flowseal_common::verify_packet`. On top of that
//! a chained journal, when present, is replayed from its seed and must end
//! at the head recorded in run metadata and agree entry by entry with the
//! evidence index. Raw artifacts outside the sealed tree are re-hashed
//! against the index when the raw archive sits next to the deliverable.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use flowseal_common::canonical_string;
use flowseal_common::integrity::JOURNAL_FILE;
use flowseal_common::journal::{parse_jsonl, verify_chain};
use flowseal_common::seal::VERIFICATION_DIR;
use flowseal_common::{hash_file, verify_packet, PacketVerification};

use crate::error::RunnerResult;
use crate::evidence::EvidenceIndex;
use crate::report::RunMetadata;
use crate::runner::{EVIDENCE_INDEX_FILE, RUN_METADATA_FILE};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChainCheck {
    pub entries: usize,
    pub head: Option<String>,
    pub matches_metadata: bool,
    pub matches_evidence_index: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliverableVerification {
    pub packet: PacketVerification,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain: Option<ChainCheck>,
    pub raw_checked: usize,
    pub raw_mismatches: Vec<String>,
    pub errors: Vec<String>,
    pub passed: bool,
}

pub fn verify_deliverable(deliverable: &Path) -> RunnerResult<DeliverableVerification> {
    let packet = verify_packet(deliverable)?;
    let mut errors = packet.errors.clone();

    let verification = deliverable.join(VERIFICATION_DIR);
    let metadata: Option<RunMetadata> = std::fs::read(verification.join(RUN_METADATA_FILE))
        .ok()
        .and_then(|bytes| serde_json::from_slice(&bytes).ok());
    let index: Option<EvidenceIndex> =
        std::fs::read(deliverable.join("logs").join(EVIDENCE_INDEX_FILE))
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok());

    if metadata.is_none() {
        errors.push(format!("{}/{} missing or unreadable", VERIFICATION_DIR, RUN_METADATA_FILE));
    }

    let journal_path = verification.join(JOURNAL_FILE);
    let chain = if journal_path.exists() {
        Some(check_chain(&journal_path, metadata.as_ref(), index.as_ref(), &mut errors)?)
    } else {
        None
    };

    let (raw_checked, raw_mismatches) = match (&index, deliverable.parent()) {
        (Some(index), Some(run_dir)) if run_dir.join("raw").is_dir() => check_raw(run_dir, index),
        _ => (0, Vec::new()),
    };
    for path in &raw_mismatches {
        errors.push(format!("raw artifact does not match evidence index: {}", path));
    }

    let passed = errors.is_empty();
    if passed {
        info!(deliverable = %deliverable.display(), "deliverable verified");
    } else {
        warn!(
            deliverable = %deliverable.display(),
            errors = errors.len(),
            "deliverable verification failed"
        );
    }

    Ok(DeliverableVerification {
        packet,
        chain,
        raw_checked,
        raw_mismatches,
        errors,
        passed,
    })
}

fn check_chain(
    journal_path: &Path,
    metadata: Option<&RunMetadata>,
    index: Option<&EvidenceIndex>,
    errors: &mut Vec<String>,
) -> RunnerResult<ChainCheck> {
    let entries = match parse_jsonl(&std::fs::read_to_string(journal_path)?) {
        Ok(entries) => entries,
        Err(e) => {
            errors.push(format!("evidence chain unreadable: {}", e));
            return Ok(ChainCheck::default());
        }
    };
    let mut check = ChainCheck {
        entries: entries.len(),
        ..Default::default()
    };

    let integrity = metadata.map(|m| &m.integrity);
    let seed = integrity.and_then(|i| i.chain_seed.as_deref());
    let expected_head = integrity.and_then(|i| i.chain_head.as_deref());
    let Some(seed) = seed else {
        errors.push("evidence chain present but run metadata records no seed".to_string());
        return Ok(check);
    };

    match verify_chain(seed, &entries, expected_head) {
        Ok(head) => {
            check.matches_metadata = expected_head.is_some();
            check.head = Some(head);
        }
        Err(e) => errors.push(format!("evidence chain: {}", e)),
    }

    if let Some(index) = index {
        let mut recorded = Vec::with_capacity(index.records.len());
        for record in &index.records {
            recorded.push(canonical_string(&serde_json::to_value(record)?)?);
        }
        check.matches_evidence_index = recorded.len() == entries.len()
            && recorded
                .iter()
                .zip(&entries)
                .all(|(data, entry)| *data == entry.canonical_data);
        if !check.matches_evidence_index {
            errors.push("evidence chain does not match evidence index".to_string());
        }
    }

    Ok(check)
}

fn check_raw(run_dir: &Path, index: &EvidenceIndex) -> (usize, Vec<String>) {
    let mut checked = 0;
    let mut mismatches = Vec::new();
    let artifacts = index
        .records
        .iter()
        .flat_map(|r| r.artifacts.iter())
        .chain(index.recordings.iter());
    for artifact in artifacts {
        let (Some(path), Some(expected)) = (&artifact.path, &artifact.sha256) else {
            continue;
        };
        if !path.starts_with("raw/") {
            continue;
        }
        checked += 1;
        match hash_file(&run_dir.join(path)) {
            Ok((actual, _)) if actual == *expected => {}
            _ => mismatches.push(path.clone()),
        }
    }
    (checked, mismatches)
}
