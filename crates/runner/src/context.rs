//! Per-run state
//!
//! A [`RunContext`] is created when a run starts and is threaded by `&mut`
//! through the engine, the stabilization policy and the evidence collector.
//! Logs are append-only. Once sealing starts the context is consumed by
//! [`RunContext::freeze`] and nothing can be appended anymore.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::{debug, warn};

use flowseal_common::{IntegrityStrategy, IntegritySummary};

use crate::driver::ConsoleMessage;
use crate::error::{ErrorKind, FlowError};
use crate::evidence::{ArtifactRef, EvidenceRecord};
use crate::plan::CaptureMode;

/// Source of timestamps for everything written into a packet
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn timestamp(&self) -> String {
        self.now().to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Always reports the same instant, for reproducible packets
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl FixedClock {
    pub fn epoch() -> Self {
        Self(Utc.timestamp_opt(0, 0).single().unwrap_or_default())
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Identifies a step in logs: a plan position, or the terminal goal check.
///
/// Index 0 is the initial navigation to `start_url`; plan steps are 1..=n.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StepRef {
    Index(u32),
    Goal,
}

impl fmt::Display for StepRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepRef::Index(i) => write!(f, "{}", i),
            StepRef::Goal => f.write_str("goal"),
        }
    }
}

impl Serialize for StepRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            StepRef::Index(i) => serializer.serialize_u32(*i),
            StepRef::Goal => serializer.serialize_str("goal"),
        }
    }
}

impl<'de> Deserialize<'de> for StepRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Index(u32),
            Label(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Index(i) => Ok(StepRef::Index(i)),
            Raw::Label(s) if s == "goal" => Ok(StepRef::Goal),
            Raw::Label(s) => Err(serde::de::Error::custom(format!(
                "invalid step index '{}'",
                s
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepResult {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepStatus {
    pub step_index: StepRef,
    pub action: String,
    pub state: StepState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractionLogEntry {
    pub step_index: StepRef,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    pub result: StepResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub timestamp: String,
}

/// Terminal error of a run, as recorded in metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_index: Option<StepRef>,
}

/// Integrity-relevant events persisted in the sealed packet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    SelectorInstability {
        selector: String,
        first_count: usize,
        final_count: usize,
        window_ms: u64,
    },
    PolicyOverride {
        selector: String,
        observed_count: usize,
        stable: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        visible_index: Option<usize>,
        accepted: bool,
    },
    NoteRedacted {
        redactions: usize,
        original_length: usize,
    },
    CaptureFailed {
        artifact: String,
        reason: String,
    },
    RecordingFailed {
        recording: String,
        reason: String,
    },
    TeardownFailed {
        reason: String,
    },
    EnginePanicked {
        message: String,
    },
}

/// One line of `console_log.jsonl`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_index: Option<StepRef>,
    pub timestamp: String,
    #[serde(flatten)]
    pub body: EventBody,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "channel", rename_all = "snake_case")]
pub enum EventBody {
    Console { level: String, text: String },
    Audit(AuditEvent),
}

impl RunEvent {
    pub fn audit_event(&self) -> Option<&AuditEvent> {
        match &self.body {
            EventBody::Audit(event) => Some(event),
            EventBody::Console { .. } => None,
        }
    }
}

/// Mutable state of a run in progress
pub struct RunContext {
    run_id: String,
    plan_id: String,
    capture_mode: Option<CaptureMode>,
    clock: Arc<dyn Clock>,
    started_at: String,
    current: Option<StepRef>,
    status: RunStatus,
    error: Option<RunFailure>,
    steps: Vec<StepStatus>,
    interactions: Vec<InteractionLogEntry>,
    evidence: Vec<EvidenceRecord>,
    recordings: Vec<ArtifactRef>,
    events: Vec<RunEvent>,
    integrity: Box<dyn IntegrityStrategy>,
}

impl RunContext {
    pub fn new(
        run_id: impl Into<String>,
        plan_id: impl Into<String>,
        capture_mode: Option<CaptureMode>,
        clock: Arc<dyn Clock>,
        integrity: Box<dyn IntegrityStrategy>,
    ) -> Self {
        let started_at = clock.timestamp();
        Self {
            run_id: run_id.into(),
            plan_id: plan_id.into(),
            capture_mode,
            clock,
            started_at,
            current: None,
            status: RunStatus::Running,
            error: None,
            steps: Vec::new(),
            interactions: Vec::new(),
            evidence: Vec::new(),
            recordings: Vec::new(),
            events: Vec::new(),
            integrity,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn plan_id(&self) -> &str {
        &self.plan_id
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn error(&self) -> Option<&RunFailure> {
        self.error.as_ref()
    }

    pub fn current_step(&self) -> Option<StepRef> {
        self.current
    }

    pub fn timestamp(&self) -> String {
        self.clock.timestamp()
    }

    pub fn steps(&self) -> &[StepStatus] {
        &self.steps
    }

    pub fn interactions(&self) -> &[InteractionLogEntry] {
        &self.interactions
    }

    pub fn evidence(&self) -> &[EvidenceRecord] {
        &self.evidence
    }

    pub fn events(&self) -> &[RunEvent] {
        &self.events
    }

    pub fn audit_events(&self) -> impl Iterator<Item = &AuditEvent> {
        self.events.iter().filter_map(RunEvent::audit_event)
    }

    /// Register the plan's steps as pending
    pub fn plan_steps(&mut self, steps: impl IntoIterator<Item = (StepRef, String)>) {
        self.steps.extend(steps.into_iter().map(|(step_index, action)| StepStatus {
            step_index,
            action,
            state: StepState::Pending,
        }));
    }

    pub fn begin_step(&mut self, step: StepRef) {
        self.current = Some(step);
        self.set_state(step, StepState::Running);
    }

    pub fn end_step(&mut self, step: StepRef, result: StepResult) {
        let state = match result {
            StepResult::Success => StepState::Completed,
            StepResult::Error => StepState::Failed,
        };
        self.set_state(step, state);
    }

    fn set_state(&mut self, step: StepRef, state: StepState) {
        if let Some(status) = self.steps.iter_mut().find(|s| s.step_index == step) {
            status.state = state;
        }
    }

    pub fn log_interaction(&mut self, entry: InteractionLogEntry) {
        debug_assert!(self
            .interactions
            .last()
            .map_or(true, |last| last.step_index < entry.step_index));
        self.interactions.push(entry);
    }

    pub fn audit(&mut self, event: AuditEvent) {
        debug!(run_id = %self.run_id, ?event, "audit event");
        self.events.push(RunEvent {
            step_index: self.current,
            timestamp: self.clock.timestamp(),
            body: EventBody::Audit(event),
        });
    }

    pub fn console(&mut self, messages: Vec<ConsoleMessage>) {
        for message in messages {
            self.events.push(RunEvent {
                step_index: self.current,
                timestamp: self.clock.timestamp(),
                body: EventBody::Console {
                    level: message.level,
                    text: message.text,
                },
            });
        }
    }

    /// Append an evidence record and feed it to the integrity strategy
    pub fn add_evidence(&mut self, record: EvidenceRecord) -> Result<(), FlowError> {
        let value = serde_json::to_value(&record)
            .map_err(|e| FlowError::Sealing(format!("evidence record: {}", e)))?;
        self.integrity.observe(&value)?;
        self.evidence.push(record);
        Ok(())
    }

    pub fn add_recording(&mut self, artifact: ArtifactRef) {
        self.recordings.push(artifact);
    }

    /// Record the run's terminal error against the current step.
    /// The first failure wins.
    pub fn fail(&mut self, err: &FlowError) {
        self.fail_at(err, self.current);
    }

    pub fn fail_at(&mut self, err: &FlowError, step_index: Option<StepRef>) {
        if self.error.is_some() {
            warn!(
                run_id = %self.run_id,
                error = %err,
                "additional failure after run already failed"
            );
            return;
        }
        self.status = RunStatus::Error;
        self.error = Some(RunFailure {
            kind: err.kind(),
            message: err.to_string(),
            step_index,
        });
    }

    /// Consume the context at the start of sealing
    pub fn freeze(mut self) -> FrozenRun {
        if self.status == RunStatus::Running {
            self.status = RunStatus::Success;
        }
        let finished_at = self.clock.timestamp();
        let integrity_summary = self.integrity.summary();
        FrozenRun {
            run_id: self.run_id,
            plan_id: self.plan_id,
            capture_mode: self.capture_mode,
            started_at: self.started_at,
            finished_at,
            status: self.status,
            error: self.error,
            steps: self.steps,
            interactions: self.interactions,
            evidence: self.evidence,
            recordings: self.recordings,
            events: self.events,
            integrity: self.integrity,
            integrity_summary,
        }
    }
}

/// Read-only view of a finished run, handed to the sealing phase
pub struct FrozenRun {
    pub run_id: String,
    pub plan_id: String,
    pub capture_mode: Option<CaptureMode>,
    pub started_at: String,
    pub finished_at: String,
    pub status: RunStatus,
    pub error: Option<RunFailure>,
    pub steps: Vec<StepStatus>,
    pub interactions: Vec<InteractionLogEntry>,
    pub evidence: Vec<EvidenceRecord>,
    pub recordings: Vec<ArtifactRef>,
    pub events: Vec<RunEvent>,
    integrity: Box<dyn IntegrityStrategy>,
    integrity_summary: IntegritySummary,
}

impl FrozenRun {
    pub fn integrity_summary(&self) -> &IntegritySummary {
        &self.integrity_summary
    }

    /// Let the integrity strategy write its own artifacts
    pub fn finalize_integrity(
        &mut self,
        verification_dir: &std::path::Path,
    ) -> flowseal_common::Result<&IntegritySummary> {
        self.integrity_summary = self.integrity.finalize(verification_dir)?;
        Ok(&self.integrity_summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowseal_common::{IntegrityMode, DEFAULT_CHAIN_SEED};

    fn context() -> RunContext {
        RunContext::new(
            "run-1",
            "plan-1",
            Some(CaptureMode::Interactive),
            Arc::new(FixedClock::epoch()),
            IntegrityMode::Flat.build(DEFAULT_CHAIN_SEED).unwrap(),
        )
    }

    #[test]
    fn test_step_ref_serialization() {
        assert_eq!(serde_json::to_string(&StepRef::Index(3)).unwrap(), "3");
        assert_eq!(serde_json::to_string(&StepRef::Goal).unwrap(), "\"goal\"");
        let back: StepRef = serde_json::from_str("\"goal\"").unwrap();
        assert_eq!(back, StepRef::Goal);
        assert!(serde_json::from_str::<StepRef>("\"final\"").is_err());
    }

    #[test]
    fn test_goal_orders_after_indices() {
        assert!(StepRef::Index(u32::MAX) < StepRef::Goal);
    }

    #[test]
    fn test_first_failure_wins() {
        let mut ctx = context();
        ctx.begin_step(StepRef::Index(2));
        ctx.fail(&FlowError::NotFound {
            selector: "#a".to_string(),
        });
        ctx.fail(&FlowError::Sealing("late".to_string()));
        let err = ctx.error().unwrap();
        assert_eq!(err.kind, ErrorKind::NotFoundError);
        assert_eq!(err.step_index, Some(StepRef::Index(2)));
        assert_eq!(ctx.status(), RunStatus::Error);
    }

    #[test]
    fn test_freeze_marks_clean_run_successful() {
        let frozen = context().freeze();
        assert_eq!(frozen.status, RunStatus::Success);
        assert_eq!(frozen.started_at, "1970-01-01T00:00:00.000Z");
    }

    #[test]
    fn test_audit_event_is_tagged_with_current_step() {
        let mut ctx = context();
        ctx.begin_step(StepRef::Goal);
        ctx.audit(AuditEvent::TeardownFailed {
            reason: "x".to_string(),
        });
        let json = serde_json::to_value(&ctx.events()[0]).unwrap();
        assert_eq!(json["channel"], "audit");
        assert_eq!(json["event"], "teardown_failed");
        assert_eq!(json["step_index"], "goal");
    }
}
