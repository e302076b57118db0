//! Evidence capture and indexing
//!
//! Every step, failing ones included, gets an [`EvidenceRecord`]. A failed
//! snapshot is recorded as a missing artifact plus an audit event and never
//! fails the step on its own.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use flowseal_common::seal::VERIFICATION_DIR;
use flowseal_common::sha256_hex;

use crate::context::{AuditEvent, RunContext, StepRef};
use crate::driver::{PageDriver, RecordingKind, SnapshotKind};
use crate::error::FlowError;

/// Paths of one run's output tree
#[derive(Debug, Clone)]
pub struct OutputLayout {
    run_dir: PathBuf,
}

impl OutputLayout {
    pub fn new(output_root: &Path, run_id: &str) -> Self {
        Self {
            run_dir: output_root.join(run_id),
        }
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Sealed subtree
    pub fn deliverable(&self) -> PathBuf {
        self.run_dir.join("deliverable")
    }

    /// Raw archive, bound to the packet through hashes in the evidence index
    pub fn raw(&self) -> PathBuf {
        self.run_dir.join("raw")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.deliverable().join("logs")
    }

    pub fn verification_dir(&self) -> PathBuf {
        self.deliverable().join(VERIFICATION_DIR)
    }

    pub fn recordings_dir(&self) -> PathBuf {
        self.raw().join("recordings")
    }

    pub fn snapshot_path(&self, kind: SnapshotKind, sequence: u32) -> PathBuf {
        match kind {
            SnapshotKind::Screenshot => self
                .deliverable()
                .join("exhibits")
                .join(format!("step_{:03}", sequence))
                .join("screenshot.png"),
            SnapshotKind::Html => self
                .raw()
                .join("html")
                .join(format!("step_{:03}.html", sequence)),
            SnapshotKind::AccessibilityTree => self
                .raw()
                .join("accessibility")
                .join(format!("step_{:03}.json", sequence)),
        }
    }

    pub fn recording_path(&self, kind: RecordingKind) -> PathBuf {
        self.recordings_dir().join(kind.file_name())
    }

    pub fn create(&self) -> std::io::Result<()> {
        if self.run_dir.exists() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("run directory {} already exists", self.run_dir.display()),
            ));
        }
        for dir in [
            self.logs_dir(),
            self.verification_dir(),
            self.deliverable().join("exhibits"),
            self.raw(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// `/`-separated path relative to the run directory
    pub fn relative(&self, path: &Path) -> String {
        let rel = path.strip_prefix(&self.run_dir).unwrap_or(path);
        rel.components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }
}

/// One stored (or missing) artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ArtifactRef {
    pub fn stored(kind: &str, path: String, bytes: &[u8]) -> Self {
        Self {
            kind: kind.to_string(),
            path: Some(path),
            sha256: Some(sha256_hex(bytes)),
            size_bytes: Some(bytes.len() as u64),
            error: None,
        }
    }

    pub fn missing(kind: &str, error: String) -> Self {
        Self {
            kind: kind.to_string(),
            path: None,
            sha256: None,
            size_bytes: None,
            error: Some(error),
        }
    }

    pub fn is_captured(&self) -> bool {
        self.sha256.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceRecord {
    pub step_index: StepRef,
    /// Numeric index used for exhibit file names
    pub sequence: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub artifacts: Vec<ArtifactRef>,
}

impl EvidenceRecord {
    pub fn has_artifact(&self, kind: SnapshotKind) -> bool {
        self.artifacts
            .iter()
            .any(|a| a.kind == kind.as_str() && a.is_captured())
    }
}

/// Content of `logs/evidence_index.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceIndex {
    pub records: Vec<EvidenceRecord>,
    pub recordings: Vec<ArtifactRef>,
}

pub struct EvidenceCollector {
    layout: OutputLayout,
    snapshots: Vec<SnapshotKind>,
}

impl EvidenceCollector {
    pub fn new(layout: OutputLayout, snapshots: Vec<SnapshotKind>) -> Self {
        Self { layout, snapshots }
    }

    pub fn layout(&self) -> &OutputLayout {
        &self.layout
    }

    /// Capture the configured snapshots for a step and append the record
    pub async fn capture(
        &self,
        driver: &mut dyn PageDriver,
        ctx: &mut RunContext,
        step: StepRef,
        sequence: u32,
    ) -> Result<(), FlowError> {
        let mut artifacts = Vec::with_capacity(self.snapshots.len());
        for kind in &self.snapshots {
            let path = self.layout.snapshot_path(*kind, sequence);
            let artifact = match driver.snapshot(*kind).await {
                Ok(bytes) => self.store(kind.as_str(), &path, &bytes),
                Err(e) => ArtifactRef::missing(kind.as_str(), e.to_string()),
            };
            if let Some(reason) = &artifact.error {
                warn!(step = %step, artifact = kind.as_str(), %reason, "evidence capture failed");
                ctx.audit(AuditEvent::CaptureFailed {
                    artifact: kind.as_str().to_string(),
                    reason: reason.clone(),
                });
            }
            artifacts.push(artifact);
        }

        let url = match driver.current_url().await {
            Ok(url) => Some(url),
            Err(e) => {
                debug!(step = %step, error = %e, "current url unavailable");
                None
            }
        };

        match driver.drain_console().await {
            Ok(messages) => ctx.console(messages),
            Err(e) => debug!(step = %step, error = %e, "console drain failed"),
        }

        ctx.add_evidence(EvidenceRecord {
            step_index: step,
            sequence,
            url,
            artifacts,
        })
    }

    /// Stop every recording, storing whatever the driver hands back
    pub async fn stop_recordings(
        &self,
        driver: &mut dyn PageDriver,
        ctx: &mut RunContext,
        kinds: &[RecordingKind],
    ) {
        for kind in kinds {
            let artifact = match driver.stop_recording(*kind).await {
                Ok(Some(bytes)) => {
                    self.store(kind.as_str(), &self.layout.recording_path(*kind), &bytes)
                }
                Ok(None) => ArtifactRef::missing(kind.as_str(), "no data produced".to_string()),
                Err(e) => ArtifactRef::missing(kind.as_str(), e.to_string()),
            };
            if let Some(reason) = &artifact.error {
                warn!(recording = kind.as_str(), %reason, "recording unavailable");
                ctx.audit(AuditEvent::RecordingFailed {
                    recording: kind.as_str().to_string(),
                    reason: reason.clone(),
                });
            }
            ctx.add_recording(artifact);
        }
    }

    fn store(&self, kind: &str, path: &Path, bytes: &[u8]) -> ArtifactRef {
        let written = path
            .parent()
            .map_or(Ok(()), std::fs::create_dir_all)
            .and_then(|()| std::fs::write(path, bytes));
        match written {
            Ok(()) => ArtifactRef::stored(kind, self.layout.relative(path), bytes),
            Err(e) => ArtifactRef::missing(kind, format!("write {}: {}", path.display(), e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_paths() {
        let layout = OutputLayout::new(Path::new("/out"), "run-7");
        assert_eq!(
            layout.relative(&layout.snapshot_path(SnapshotKind::Screenshot, 3)),
            "deliverable/exhibits/step_003/screenshot.png"
        );
        assert_eq!(
            layout.relative(&layout.snapshot_path(SnapshotKind::Html, 12)),
            "raw/html/step_012.html"
        );
        assert_eq!(
            layout.relative(&layout.recording_path(RecordingKind::Network)),
            "raw/recordings/network.json"
        );
    }

    #[test]
    fn test_create_refuses_existing_run_dir() {
        let dir = tempfile::tempdir().unwrap();
        let layout = OutputLayout::new(dir.path(), "r");
        layout.create().unwrap();
        assert!(layout.verification_dir().is_dir());
        assert!(layout.create().is_err());
    }

    #[test]
    fn test_has_artifact_requires_hash() {
        let record = EvidenceRecord {
            step_index: StepRef::Index(0),
            sequence: 0,
            url: None,
            artifacts: vec![
                ArtifactRef::stored("screenshot", "a.png".to_string(), b"png"),
                ArtifactRef::missing("html", "boom".to_string()),
            ],
        };
        assert!(record.has_artifact(SnapshotKind::Screenshot));
        assert!(!record.has_artifact(SnapshotKind::Html));
        assert!(!record.has_artifact(SnapshotKind::AccessibilityTree));
    }
}
