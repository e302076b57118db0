//! Scripted in-process page driver for orchestrator tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use flowseal_common::IntegrityMode;
use flowseal_runner::driver::ConsoleMessage;
use flowseal_runner::{
    Action, DriverError, DriverLauncher, FixedClock, FlowRunner, PageDriver, RecordingKind,
    RunnerConfig, SnapshotKind,
};

/// What the fake page reports, per selector
#[derive(Clone, Default)]
pub struct PageScript {
    counts: HashMap<String, Vec<usize>>,
    visible: HashMap<String, Vec<usize>>,
    texts: HashMap<String, String>,
    failing_snapshots: Vec<SnapshotKind>,
    panic_on: Option<String>,
    console: Vec<ConsoleMessage>,
}

impl PageScript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Successive count samples; the last one repeats
    pub fn count(mut self, selector: &str, counts: &[usize]) -> Self {
        self.counts.insert(selector.to_string(), counts.to_vec());
        self
    }

    pub fn visible(mut self, selector: &str, indices: &[usize]) -> Self {
        self.visible.insert(selector.to_string(), indices.to_vec());
        self
    }

    pub fn text(mut self, selector: &str, text: &str) -> Self {
        self.texts.insert(selector.to_string(), text.to_string());
        self
    }

    pub fn failing_snapshot(mut self, kind: SnapshotKind) -> Self {
        self.failing_snapshots.push(kind);
        self
    }

    /// Panic when any action targets `selector`
    pub fn panic_on(mut self, selector: &str) -> Self {
        self.panic_on = Some(selector.to_string());
        self
    }

    pub fn console(mut self, level: &str, text: &str) -> Self {
        self.console.push(ConsoleMessage {
            level: level.to_string(),
            text: text.to_string(),
        });
        self
    }
}

/// Launches [`FakePage`]s and remembers every driver call
#[derive(Clone)]
pub struct FakeLauncher {
    script: PageScript,
    pub launches: Arc<AtomicUsize>,
    pub calls: Arc<Mutex<Vec<String>>>,
}

impl FakeLauncher {
    pub fn new(script: PageScript) -> Self {
        Self {
            script,
            launches: Arc::new(AtomicUsize::new(0)),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn launch_count(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl DriverLauncher for FakeLauncher {
    async fn launch(&self) -> Result<Box<dyn PageDriver>, DriverError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakePage {
            script: self.script.clone(),
            url: String::new(),
            calls: self.calls.clone(),
            snapshots: 0,
        }))
    }
}

pub struct FakePage {
    script: PageScript,
    url: String,
    calls: Arc<Mutex<Vec<String>>>,
    snapshots: usize,
}

impl FakePage {
    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn next_count(&mut self, selector: &str) -> usize {
        match self.script.counts.get_mut(selector) {
            Some(counts) if counts.len() > 1 => counts.remove(0),
            Some(counts) => counts.first().copied().unwrap_or(0),
            None => 0,
        }
    }
}

#[async_trait]
impl PageDriver for FakePage {
    async fn navigate(&mut self, url: &str, _timeout: Duration) -> Result<String, DriverError> {
        self.record(format!("navigate {}", url));
        self.url = url.to_string();
        Ok(self.url.clone())
    }

    async fn wait_for_attached(
        &mut self,
        selector: &str,
        timeout: Duration,
    ) -> Result<(), DriverError> {
        let present = self
            .script
            .counts
            .get(selector)
            .and_then(|c| c.first())
            .is_some_and(|n| *n > 0);
        if present {
            Ok(())
        } else {
            Err(DriverError::Timeout {
                operation: "wait_for_attached".to_string(),
                timeout_ms: timeout.as_millis() as u64,
            })
        }
    }

    async fn count(&mut self, selector: &str) -> Result<usize, DriverError> {
        Ok(self.next_count(selector))
    }

    async fn is_visible(&mut self, selector: &str, index: usize) -> Result<bool, DriverError> {
        Ok(self
            .script
            .visible
            .get(selector)
            .is_some_and(|v| v.contains(&index)))
    }

    async fn act(
        &mut self,
        selector: Option<&str>,
        action: &Action,
        _timeout: Duration,
    ) -> Result<(), DriverError> {
        let target = selector.unwrap_or("page");
        self.record(format!("act {} {}", action.name(), target));
        if selector.is_some() && self.script.panic_on.as_deref() == selector {
            panic!("scripted panic on {}", target);
        }
        Ok(())
    }

    async fn text_content(
        &mut self,
        selector: &str,
        _timeout: Duration,
    ) -> Result<String, DriverError> {
        Ok(self.script.texts.get(selector).cloned().unwrap_or_default())
    }

    async fn current_url(&mut self) -> Result<String, DriverError> {
        Ok(self.url.clone())
    }

    async fn snapshot(&mut self, kind: SnapshotKind) -> Result<Vec<u8>, DriverError> {
        if self.script.failing_snapshots.contains(&kind) {
            return Err(DriverError::Protocol(format!("{} unavailable", kind.as_str())));
        }
        self.snapshots += 1;
        Ok(format!("{}|{}|{}", kind.as_str(), self.url, self.snapshots).into_bytes())
    }

    async fn start_recording(&mut self, kind: RecordingKind) -> Result<(), DriverError> {
        match kind {
            RecordingKind::Video => Err(DriverError::Unsupported("video".to_string())),
            _ => Ok(()),
        }
    }

    async fn stop_recording(
        &mut self,
        kind: RecordingKind,
    ) -> Result<Option<Vec<u8>>, DriverError> {
        Ok(match kind {
            RecordingKind::Trace => Some(b"PK-trace".to_vec()),
            RecordingKind::Network => Some(b"[]".to_vec()),
            RecordingKind::Video => None,
        })
    }

    async fn drain_console(&mut self) -> Result<Vec<ConsoleMessage>, DriverError> {
        Ok(std::mem::take(&mut self.script.console))
    }

    async fn close(&mut self) -> Result<(), DriverError> {
        self.record("close".to_string());
        Ok(())
    }
}

pub fn config(output_root: &Path, integrity: IntegrityMode) -> RunnerConfig {
    let mut config = RunnerConfig::default();
    config.output_root = output_root.to_path_buf();
    config.sealing.integrity = integrity;
    config
}

pub fn fixed_runner(config: RunnerConfig, launcher: &FakeLauncher) -> FlowRunner {
    let clock = FixedClock(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
    FlowRunner::new(config, Arc::new(launcher.clone())).with_clock(Arc::new(clock))
}

pub fn write_plan(dir: &Path, yaml: &str) -> PathBuf {
    let path = dir.join("plan.yaml");
    std::fs::write(&path, yaml).unwrap();
    path
}

pub fn read_json(path: &Path) -> serde_json::Value {
    serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap()
}
