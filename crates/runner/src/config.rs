//! Runner configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use flowseal_common::{HashChain, IntegrityMode, DEFAULT_CHAIN_SEED};

use crate::driver::{RecordingKind, SnapshotKind};
use crate::error::{RunnerError, RunnerResult};
use crate::selector::StabilizationPolicy;

/// Runner configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Directory that receives one subdirectory per run
    pub output_root: PathBuf,

    pub timeouts: TimeoutConfig,

    pub stabilization: StabilizationConfig,

    pub capture: CaptureConfig,

    pub sealing: SealingConfig,

    pub browser: BrowserConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Used by steps without their own `timeout_ms`
    pub default_step_ms: u64,

    /// Initial navigation and `navigate` steps
    pub navigation_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            default_step_ms: 5000,
            navigation_ms: 30000,
        }
    }
}

impl TimeoutConfig {
    pub fn step(&self, override_ms: Option<u64>) -> Duration {
        Duration::from_millis(override_ms.unwrap_or(self.default_step_ms))
    }

    pub fn navigation(&self, override_ms: Option<u64>) -> Duration {
        Duration::from_millis(override_ms.unwrap_or(self.navigation_ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilizationConfig {
    pub window_ms: u64,
    pub visibility_check_ms: u64,
    pub max_visibility_probes: usize,
}

impl Default for StabilizationConfig {
    fn default() -> Self {
        let policy = StabilizationPolicy::default();
        Self {
            window_ms: policy.window.as_millis() as u64,
            visibility_check_ms: policy.visibility_check.as_millis() as u64,
            max_visibility_probes: policy.max_visibility_probes,
        }
    }
}

impl StabilizationConfig {
    pub fn policy(&self) -> StabilizationPolicy {
        StabilizationPolicy {
            window: Duration::from_millis(self.window_ms),
            visibility_check: Duration::from_millis(self.visibility_check_ms),
            max_visibility_probes: self.max_visibility_probes,
        }
    }
}

/// Which artifacts are taken per step and which recordings run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub screenshot: bool,
    pub html: bool,
    pub accessibility_tree: bool,
    pub trace: bool,
    pub network: bool,
    pub video: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            screenshot: true,
            html: true,
            accessibility_tree: true,
            trace: true,
            network: true,
            video: false,
        }
    }
}

impl CaptureConfig {
    pub fn snapshots(&self) -> Vec<SnapshotKind> {
        SnapshotKind::ALL
            .into_iter()
            .filter(|kind| match kind {
                SnapshotKind::Screenshot => self.screenshot,
                SnapshotKind::Html => self.html,
                SnapshotKind::AccessibilityTree => self.accessibility_tree,
            })
            .collect()
    }

    pub fn recordings(&self) -> Vec<RecordingKind> {
        let mut kinds = Vec::new();
        if self.trace {
            kinds.push(RecordingKind::Trace);
        }
        if self.network {
            kinds.push(RecordingKind::Network);
        }
        if self.video {
            kinds.push(RecordingKind::Video);
        }
        kinds
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SealingConfig {
    pub integrity: IntegrityMode,

    /// Root of the evidence chain, 64 lowercase hex characters
    pub chain_seed: String,

    /// Snapshot kinds every evidence record must carry
    pub required_artifacts: Vec<SnapshotKind>,
}

impl Default for SealingConfig {
    fn default() -> Self {
        Self {
            integrity: IntegrityMode::default(),
            chain_seed: DEFAULT_CHAIN_SEED.to_string(),
            required_artifacts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    /// Path to the node binary
    pub node_binary: String,

    /// chromium, firefox or webkit
    pub engine: String,

    pub headless: bool,

    pub viewport_width: u32,

    pub viewport_height: u32,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            node_binary: "node".to_string(),
            engine: "chromium".to_string(),
            headless: true,
            viewport_width: 1280,
            viewport_height: 720,
        }
    }
}

impl RunnerConfig {
    /// Load configuration from file; a missing file yields defaults
    pub fn load(path: &Path) -> RunnerResult<Self> {
        let config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> RunnerResult<()> {
        if self.stabilization.window_ms == 0 {
            return Err(RunnerError::Config(
                "stabilization.window_ms must be positive".to_string(),
            ));
        }
        if self.stabilization.max_visibility_probes == 0 {
            return Err(RunnerError::Config(
                "stabilization.max_visibility_probes must be at least 1".to_string(),
            ));
        }
        if self.timeouts.default_step_ms == 0 || self.timeouts.navigation_ms == 0 {
            return Err(RunnerError::Config("timeouts must be positive".to_string()));
        }
        HashChain::new(&self.sealing.chain_seed)
            .map_err(|e| RunnerError::Config(format!("sealing.chain_seed: {}", e)))?;
        let enabled = self.capture.snapshots();
        if let Some(kind) = self
            .sealing
            .required_artifacts
            .iter()
            .find(|k| !enabled.contains(k))
        {
            return Err(RunnerError::Config(format!(
                "required artifact '{}' is not captured",
                kind.as_str()
            )));
        }
        if !matches!(self.browser.engine.as_str(), "chromium" | "firefox" | "webkit") {
            return Err(RunnerError::Config(format!(
                "unknown browser engine '{}'",
                self.browser.engine
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = RunnerConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.stabilization.window_ms, 500);
        assert_eq!(config.sealing.integrity, IntegrityMode::Flat);
        assert_eq!(
            config.capture.recordings(),
            vec![RecordingKind::Trace, RecordingKind::Network]
        );
    }

    #[test]
    fn test_partial_file_overrides_sections() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("flowseal.toml");
        std::fs::write(
            &path,
            r#"
output_root = "/var/evidence"

[stabilization]
window_ms = 250

[sealing]
integrity = "chained"
required_artifacts = ["screenshot"]
"#,
        )
        .unwrap();
        let config = RunnerConfig::load(&path).unwrap();
        assert_eq!(config.output_root, PathBuf::from("/var/evidence"));
        assert_eq!(config.stabilization.policy().window, Duration::from_millis(250));
        assert_eq!(config.stabilization.max_visibility_probes, 10);
        assert_eq!(config.sealing.integrity, IntegrityMode::Chained);
        assert_eq!(config.sealing.required_artifacts, vec![SnapshotKind::Screenshot]);
        assert_eq!(config.timeouts.default_step_ms, 5000);
    }

    #[test]
    fn test_required_artifact_must_be_captured() {
        let mut config = RunnerConfig::default();
        config.capture.html = false;
        config.sealing.required_artifacts = vec![SnapshotKind::Html];
        assert!(matches!(config.validate(), Err(RunnerError::Config(_))));
    }

    #[test]
    fn test_bad_chain_seed_rejected() {
        let mut config = RunnerConfig::default();
        config.sealing.chain_seed = "abc".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_visibility_probes_rejected() {
        let mut config = RunnerConfig::default();
        config.stabilization.max_visibility_probes = 0;
        assert!(matches!(config.validate(), Err(RunnerError::Config(_))));
    }
}
