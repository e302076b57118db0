//! Page automation capability contract
//!
//! The engine never talks to a browser directly. Everything it needs from
//! the page goes through [`PageDriver`]; [`DriverLauncher`] opens a session.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::DriverResult;

/// State-changing or positional primitives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    Click,
    Fill { text: String },
    Press { key: String },
    Scroll,
    Keypress { key: String },
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Click => "click",
            Action::Fill { .. } => "fill",
            Action::Press { .. } => "press",
            Action::Scroll => "scroll",
            Action::Keypress { .. } => "keypress",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotKind {
    Screenshot,
    Html,
    AccessibilityTree,
}

impl SnapshotKind {
    pub const ALL: [SnapshotKind; 3] = [
        SnapshotKind::Screenshot,
        SnapshotKind::Html,
        SnapshotKind::AccessibilityTree,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotKind::Screenshot => "screenshot",
            SnapshotKind::Html => "html",
            SnapshotKind::AccessibilityTree => "accessibility_tree",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingKind {
    Trace,
    Video,
    Network,
}

impl RecordingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordingKind::Trace => "trace",
            RecordingKind::Video => "video",
            RecordingKind::Network => "network",
        }
    }

    pub fn file_name(&self) -> &'static str {
        match self {
            RecordingKind::Trace => "trace.zip",
            RecordingKind::Video => "video.webm",
            RecordingKind::Network => "network.json",
        }
    }
}

/// A browser console message observed during the run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleMessage {
    pub level: String,
    pub text: String,
}

/// One open page session
#[async_trait]
pub trait PageDriver: Send {
    /// Navigate and return the final URL after redirects
    async fn navigate(&mut self, url: &str, timeout: Duration) -> DriverResult<String>;

    /// Wait until at least one element matching `selector` is attached
    async fn wait_for_attached(&mut self, selector: &str, timeout: Duration) -> DriverResult<()>;

    /// Number of elements currently matching `selector`
    async fn count(&mut self, selector: &str) -> DriverResult<usize>;

    /// Whether the `index`-th match is visible
    async fn is_visible(&mut self, selector: &str, index: usize) -> DriverResult<bool>;

    /// Perform an action, on the single match of `selector` or page-wide
    async fn act(
        &mut self,
        selector: Option<&str>,
        action: &Action,
        timeout: Duration,
    ) -> DriverResult<()>;

    /// Text content of the first match of `selector`
    async fn text_content(&mut self, selector: &str, timeout: Duration) -> DriverResult<String>;

    async fn current_url(&mut self) -> DriverResult<String>;

    async fn snapshot(&mut self, kind: SnapshotKind) -> DriverResult<Vec<u8>>;

    async fn start_recording(&mut self, kind: RecordingKind) -> DriverResult<()>;

    /// Stop a recording and return its bytes, if the driver produced any
    async fn stop_recording(&mut self, kind: RecordingKind) -> DriverResult<Option<Vec<u8>>>;

    /// Console messages received since the last drain
    async fn drain_console(&mut self) -> DriverResult<Vec<ConsoleMessage>>;

    async fn close(&mut self) -> DriverResult<()>;
}

/// Opens page sessions
#[async_trait]
pub trait DriverLauncher: Send + Sync {
    async fn launch(&self) -> DriverResult<Box<dyn PageDriver>>;
}
