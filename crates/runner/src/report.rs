//! Run metadata, status banner and the plain-text report

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use flowseal_common::IntegritySummary;

use crate::context::{FrozenRun, RunFailure, RunStatus, StepResult, StepStatus};
use crate::plan::CaptureMode;

/// Content of `verification/run_metadata.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_id: String,
    pub plan_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_sha256: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capture_mode: Option<CaptureMode>,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RunFailure>,
    pub started_at: String,
    pub finished_at: String,
    pub steps: Vec<StepStatus>,
    pub evidence_records: usize,
    pub audit_events: usize,
    pub integrity: IntegritySummary,
    pub tool_version: String,
}

impl RunMetadata {
    pub fn from_run(run: &FrozenRun, plan_sha256: Option<String>) -> Self {
        Self {
            run_id: run.run_id.clone(),
            plan_id: run.plan_id.clone(),
            plan_sha256,
            capture_mode: run.capture_mode,
            status: run.status,
            error: run.error.clone(),
            started_at: run.started_at.clone(),
            finished_at: run.finished_at.clone(),
            steps: run.steps.clone(),
            evidence_records: run.evidence.len(),
            audit_events: run.events.iter().filter(|e| e.audit_event().is_some()).count(),
            integrity: run.integrity_summary().clone(),
            tool_version: crate::VERSION.to_string(),
        }
    }
}

/// One-glance banner written to `verification/STATUS.txt`
pub fn status_banner(metadata: &RunMetadata) -> String {
    match &metadata.error {
        None => format!("STATUS: {}\n", metadata.status.as_str().to_uppercase()),
        Some(failure) => {
            let at = failure
                .step_index
                .map(|s| format!(" at step {}", s))
                .unwrap_or_default();
            format!(
                "STATUS: {}\nERROR: {}{}\n",
                metadata.status.as_str().to_uppercase(),
                failure.kind,
                at
            )
        }
    }
}

/// Human-readable summary written to `report.txt`
pub fn render_report(run: &FrozenRun, metadata: &RunMetadata) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "FlowSeal run report");
    let _ = writeln!(out, "===================");
    let _ = writeln!(out, "Run:       {}", metadata.run_id);
    let _ = writeln!(out, "Plan:      {}", metadata.plan_id);
    if let Some(mode) = metadata.capture_mode {
        let _ = writeln!(out, "Mode:      {}", mode.as_str());
    }
    let _ = writeln!(out, "Started:   {}", metadata.started_at);
    let _ = writeln!(out, "Finished:  {}", metadata.finished_at);
    let _ = writeln!(out, "Status:    {}", metadata.status.as_str());
    let _ = writeln!(out, "Integrity: {}", metadata.integrity.strategy);
    if let Some(failure) = &metadata.error {
        let _ = writeln!(out, "Error:     {} - {}", failure.kind, failure.message);
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "Interactions");
    let _ = writeln!(out, "------------");
    if run.interactions.is_empty() {
        let _ = writeln!(out, "(none)");
    }
    for entry in &run.interactions {
        let marker = match entry.result {
            StepResult::Success => "ok",
            StepResult::Error => "FAILED",
        };
        let target = entry.selector.as_deref().unwrap_or("-");
        let _ = writeln!(
            out,
            "[{:>4}] {:<12} {:<40} {}",
            entry.step_index.to_string(),
            entry.action,
            target,
            marker
        );
        if let Some(message) = &entry.error_message {
            let _ = writeln!(out, "       {}", message);
        }
        if let Some(note) = &entry.note {
            let _ = writeln!(out, "       note: {}", note);
        }
    }

    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "Evidence records: {}, audit events: {}",
        metadata.evidence_records, metadata.audit_events
    );
    let _ = writeln!(
        out,
        "Verify with: flowseal verify <this directory>"
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::StepRef;
    use crate::error::ErrorKind;

    fn metadata(error: Option<RunFailure>) -> RunMetadata {
        RunMetadata {
            run_id: "r".to_string(),
            plan_id: "p".to_string(),
            plan_sha256: None,
            capture_mode: Some(CaptureMode::Interactive),
            status: if error.is_some() {
                RunStatus::Error
            } else {
                RunStatus::Success
            },
            error,
            started_at: "t0".to_string(),
            finished_at: "t1".to_string(),
            steps: Vec::new(),
            evidence_records: 0,
            audit_events: 0,
            integrity: IntegritySummary::default(),
            tool_version: "0".to_string(),
        }
    }

    #[test]
    fn test_success_banner() {
        assert_eq!(status_banner(&metadata(None)), "STATUS: SUCCESS\n");
    }

    #[test]
    fn test_error_banner_names_kind_and_step() {
        let banner = status_banner(&metadata(Some(RunFailure {
            kind: ErrorKind::AmbiguityError,
            message: "two matches".to_string(),
            step_index: Some(StepRef::Index(2)),
        })));
        assert_eq!(banner, "STATUS: ERROR\nERROR: AmbiguityError at step 2\n");
    }
}
