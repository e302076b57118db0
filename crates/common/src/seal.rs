//! Packet sealing and verification
//!
//! A sealed packet is a deliverable directory plus `manifest.json` and
//! `packet_hash.txt` in its verification subtree. The manifest lists every
//! other file as `(path, sha256, size_bytes)`, sorted byte-lexicographically
//! by `/`-separated relative path, and is written in canonical JSON followed
//! by a single newline. The packet hash is the SHA-256 of those exact bytes.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::canonical::canonical_bytes;
use crate::digest::{hash_file, sha256_hex};
use crate::{Error, Result};

/// Verification subtree, relative to the deliverable root
pub const VERIFICATION_DIR: &str = "verification";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const PACKET_HASH_FILE: &str = "packet_hash.txt";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub path: String,
    pub sha256: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub run_id: String,
    pub created_at: String,
    pub files: Vec<ManifestEntry>,
}

impl Manifest {
    /// The exact bytes written to `manifest.json`
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = canonical_bytes(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    pub fn is_sorted(&self) -> bool {
        self.files
            .windows(2)
            .all(|pair| pair[0].path.as_bytes() < pair[1].path.as_bytes())
    }
}

/// Result of sealing a deliverable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketSeal {
    pub packet_hash: String,
    pub file_count: usize,
    pub manifest_path: PathBuf,
    pub packet_hash_path: PathBuf,
}

/// Seals one deliverable directory
#[derive(Debug, Clone)]
pub struct Sealer {
    root: PathBuf,
}

impl Sealer {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(VERIFICATION_DIR).join(MANIFEST_FILE)
    }

    pub fn packet_hash_path(&self) -> PathBuf {
        self.root.join(VERIFICATION_DIR).join(PACKET_HASH_FILE)
    }

    /// Build the manifest for the current state of the tree
    pub fn build_manifest(&self, run_id: &str, created_at: &str) -> Result<Manifest> {
        Ok(Manifest {
            run_id: run_id.to_string(),
            created_at: created_at.to_string(),
            files: collect_entries(&self.root)?,
        })
    }

    /// Write the manifest and packet hash.
    ///
    /// A deliverable is sealed once; an existing manifest or packet hash is
    /// an error rather than something to overwrite.
    pub fn seal(&self, run_id: &str, created_at: &str) -> Result<PacketSeal> {
        let manifest_path = self.manifest_path();
        let packet_hash_path = self.packet_hash_path();
        if manifest_path.exists() || packet_hash_path.exists() {
            return Err(Error::Sealing(format!(
                "{} is already sealed",
                self.root.display()
            )));
        }

        let manifest = self.build_manifest(run_id, created_at)?;
        let bytes = manifest.to_bytes()?;
        let packet_hash = sha256_hex(&bytes);

        if let Some(parent) = manifest_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&manifest_path, &bytes)?;
        std::fs::write(&packet_hash_path, format!("{}\n", packet_hash))?;

        info!(
            run_id,
            files = manifest.files.len(),
            packet_hash = %packet_hash,
            "sealed packet at {}",
            self.root.display()
        );

        Ok(PacketSeal {
            packet_hash,
            file_count: manifest.files.len(),
            manifest_path,
            packet_hash_path,
        })
    }
}

/// Enumerate every regular file under `root` except the manifest and packet
/// hash, hashed and sorted by relative path
pub fn collect_entries(root: &Path) -> Result<Vec<ManifestEntry>> {
    let excluded = [
        format!("{}/{}", VERIFICATION_DIR, MANIFEST_FILE),
        format!("{}/{}", VERIFICATION_DIR, PACKET_HASH_FILE),
    ];
    let mut entries = Vec::new();

    for entry in walkdir::WalkDir::new(root).min_depth(1) {
        let entry = entry?;
        let file_type = entry.file_type();
        if file_type.is_dir() {
            continue;
        }
        if file_type.is_symlink() {
            return Err(Error::Sealing(format!(
                "symlinks cannot be sealed: {}",
                entry.path().display()
            )));
        }

        let relative = relative_path(root, entry.path())?;
        if excluded.iter().any(|e| *e == relative) {
            continue;
        }

        let (sha256, size_bytes) = hash_file(entry.path())?;
        debug!(path = %relative, size_bytes, "hashed sealed file");
        entries.push(ManifestEntry {
            path: relative,
            sha256,
            size_bytes,
        });
    }

    entries.sort_by(|a, b| a.path.as_bytes().cmp(b.path.as_bytes()));
    Ok(entries)
}

fn relative_path(root: &Path, path: &Path) -> Result<String> {
    let relative = path
        .strip_prefix(root)
        .map_err(|e| Error::Sealing(format!("{}: {}", path.display(), e)))?;

    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str().ok_or_else(|| {
                Error::Sealing(format!("non UTF-8 file name: {}", path.display()))
            })?),
            other => {
                return Err(Error::Sealing(format!(
                    "unexpected path component {:?} in {}",
                    other,
                    path.display()
                )))
            }
        }
    }
    Ok(parts.join("/"))
}

/// Outcome of independently re-verifying a sealed deliverable
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PacketVerification {
    pub root: String,
    pub manifest_found: bool,
    pub manifest_canonical: bool,
    pub manifest_sorted: bool,
    pub recorded_packet_hash: Option<String>,
    pub computed_packet_hash: Option<String>,
    pub seal_matches: bool,
    pub total_entries: usize,
    pub verified_entries: usize,
    pub missing_files: Vec<String>,
    pub extra_files: Vec<String>,
    pub altered_files: Vec<String>,
    pub errors: Vec<String>,
    pub passed: bool,
}

/// Repeat the sealing walk and compare it with the persisted manifest and seal
pub fn verify_packet(root: impl AsRef<Path>) -> Result<PacketVerification> {
    let root = root.as_ref();
    let sealer = Sealer::new(root);
    let mut report = PacketVerification {
        root: root.display().to_string(),
        ..Default::default()
    };

    let manifest_path = sealer.manifest_path();
    if !manifest_path.exists() {
        report
            .errors
            .push(format!("{}/{} not found", VERIFICATION_DIR, MANIFEST_FILE));
        return Ok(report);
    }
    report.manifest_found = true;

    let manifest_bytes = std::fs::read(&manifest_path)?;
    let computed = sha256_hex(&manifest_bytes);
    report.computed_packet_hash = Some(computed.clone());

    match std::fs::read_to_string(sealer.packet_hash_path()) {
        Ok(content) => {
            let recorded = content.strip_suffix('\n').unwrap_or(&content).to_string();
            report.seal_matches = content == format!("{}\n", computed);
            if !report.seal_matches {
                report.errors.push(format!(
                    "packet hash mismatch: recorded {}, computed {}",
                    recorded, computed
                ));
            }
            report.recorded_packet_hash = Some(recorded);
        }
        Err(e) => {
            report
                .errors
                .push(format!("{}/{}: {}", VERIFICATION_DIR, PACKET_HASH_FILE, e));
        }
    }

    let manifest: Manifest = match serde_json::from_slice(&manifest_bytes) {
        Ok(m) => m,
        Err(e) => {
            report.errors.push(format!("manifest parse error: {}", e));
            return Ok(report);
        }
    };

    report.manifest_canonical = manifest.to_bytes()? == manifest_bytes;
    if !report.manifest_canonical {
        report
            .errors
            .push("manifest is not in canonical form".to_string());
    }
    report.manifest_sorted = manifest.is_sorted();
    if !report.manifest_sorted {
        report
            .errors
            .push("manifest entries are not sorted by path".to_string());
    }
    report.total_entries = manifest.files.len();

    let actual: BTreeMap<String, ManifestEntry> = collect_entries(root)?
        .into_iter()
        .map(|e| (e.path.clone(), e))
        .collect();
    let recorded: BTreeMap<&str, &ManifestEntry> = manifest
        .files
        .iter()
        .map(|e| (e.path.as_str(), e))
        .collect();

    for (path, expected) in &recorded {
        match actual.get(*path) {
            None => report.missing_files.push(path.to_string()),
            Some(found)
                if found.sha256 != expected.sha256 || found.size_bytes != expected.size_bytes =>
            {
                report.altered_files.push(path.to_string())
            }
            Some(_) => report.verified_entries += 1,
        }
    }
    for path in actual.keys() {
        if !recorded.contains_key(path.as_str()) {
            report.extra_files.push(path.clone());
        }
    }

    for path in &report.missing_files {
        report.errors.push(format!("missing file: {}", path));
    }
    for path in &report.extra_files {
        report.errors.push(format!("unsealed file: {}", path));
    }
    for path in &report.altered_files {
        report.errors.push(format!("altered file: {}", path));
    }

    report.passed = report.errors.is_empty();
    if !report.passed {
        warn!(errors = report.errors.len(), "packet verification failed for {}", root.display());
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn sample_tree(root: &Path) {
        write(root, "report.txt", "run ok\n");
        write(root, "logs/interaction_log.json", "[]");
        write(root, "exhibits/step_001/screenshot.png", "png");
        write(root, "verification/run_metadata.json", "{}");
        write(root, "verification/STATUS.txt", "SUCCESS\n");
    }

    #[test]
    fn test_manifest_sorted_and_excludes_seal_files() {
        let tmp = TempDir::new().unwrap();
        sample_tree(tmp.path());
        let sealer = Sealer::new(tmp.path());
        sealer.seal("run-1", "2024-01-01T00:00:00Z").unwrap();

        let manifest: Manifest =
            serde_json::from_slice(&std::fs::read(sealer.manifest_path()).unwrap()).unwrap();
        let paths: Vec<&str> = manifest.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                "exhibits/step_001/screenshot.png",
                "logs/interaction_log.json",
                "report.txt",
                "verification/STATUS.txt",
                "verification/run_metadata.json",
            ]
        );
        assert!(manifest.is_sorted());
    }

    #[test]
    fn test_packet_hash_is_sha256_of_manifest_bytes() {
        let tmp = TempDir::new().unwrap();
        sample_tree(tmp.path());
        let sealer = Sealer::new(tmp.path());
        let seal = sealer.seal("run-1", "2024-01-01T00:00:00Z").unwrap();

        let manifest_bytes = std::fs::read(&seal.manifest_path).unwrap();
        let recorded = std::fs::read_to_string(&seal.packet_hash_path).unwrap();
        assert_eq!(recorded, format!("{}\n", sha256_hex(&manifest_bytes)));
        assert_eq!(seal.packet_hash, sha256_hex(&manifest_bytes));
        assert_eq!(seal.file_count, 5);
    }

    #[test]
    fn test_identical_trees_produce_identical_seals() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        sample_tree(a.path());
        sample_tree(b.path());

        let seal_a = Sealer::new(a.path()).seal("run-1", "2024-01-01T00:00:00Z").unwrap();
        let seal_b = Sealer::new(b.path()).seal("run-1", "2024-01-01T00:00:00Z").unwrap();
        assert_eq!(seal_a.packet_hash, seal_b.packet_hash);
    }

    #[test]
    fn test_sealing_twice_is_refused() {
        let tmp = TempDir::new().unwrap();
        sample_tree(tmp.path());
        let sealer = Sealer::new(tmp.path());
        sealer.seal("run-1", "t").unwrap();
        assert!(sealer.seal("run-1", "t").is_err());
    }

    #[test]
    fn test_verify_clean_packet() {
        let tmp = TempDir::new().unwrap();
        sample_tree(tmp.path());
        Sealer::new(tmp.path()).seal("run-1", "t").unwrap();

        let report = verify_packet(tmp.path()).unwrap();
        assert!(report.passed, "{:?}", report.errors);
        assert_eq!(report.verified_entries, 5);
    }

    #[test]
    fn test_verify_detects_tampering() {
        let tmp = TempDir::new().unwrap();
        sample_tree(tmp.path());
        Sealer::new(tmp.path()).seal("run-1", "t").unwrap();

        write(tmp.path(), "report.txt", "run ok, edited\n");
        write(tmp.path(), "exhibits/extra.txt", "late");
        std::fs::remove_file(tmp.path().join("logs/interaction_log.json")).unwrap();

        let report = verify_packet(tmp.path()).unwrap();
        assert!(!report.passed);
        assert!(report.seal_matches);
        assert_eq!(report.altered_files, vec!["report.txt"]);
        assert_eq!(report.extra_files, vec!["exhibits/extra.txt"]);
        assert_eq!(report.missing_files, vec!["logs/interaction_log.json"]);
    }

    #[test]
    fn test_verify_detects_rewritten_manifest() {
        let tmp = TempDir::new().unwrap();
        sample_tree(tmp.path());
        let sealer = Sealer::new(tmp.path());
        sealer.seal("run-1", "t").unwrap();

        let mut manifest: Manifest =
            serde_json::from_slice(&std::fs::read(sealer.manifest_path()).unwrap()).unwrap();
        manifest.files.reverse();
        std::fs::write(
            sealer.manifest_path(),
            serde_json::to_vec_pretty(&manifest).unwrap(),
        )
        .unwrap();

        let report = verify_packet(tmp.path()).unwrap();
        assert!(!report.passed);
        assert!(!report.seal_matches);
        assert!(!report.manifest_canonical);
        assert!(!report.manifest_sorted);
    }

    #[test]
    fn test_verify_rejects_padded_packet_hash() {
        let tmp = TempDir::new().unwrap();
        sample_tree(tmp.path());
        let sealer = Sealer::new(tmp.path());
        let seal = sealer.seal("run-1", "t").unwrap();

        std::fs::write(
            sealer.packet_hash_path(),
            format!("{}\n\n\n", seal.packet_hash),
        )
        .unwrap();

        let report = verify_packet(tmp.path()).unwrap();
        assert!(!report.passed);
        assert!(!report.seal_matches);
        assert_eq!(report.missing_files, Vec::<String>::new());
        assert_eq!(report.altered_files, Vec::<String>::new());
    }
}
