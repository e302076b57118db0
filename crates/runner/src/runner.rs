//! Run orchestration: gate, execute, tear down, seal
//!
//! Every run that gets as far as creating its output directory ends with a
//! sealed packet. Load-time rejections are sealed without a browser ever
//! being launched; engine failures and panics are classified, recorded and
//! sealed after the driver is torn down.

use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::FutureExt;
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use flowseal_common::{
    canonical_bytes, sha256_canonical, sha256_hex, IntegritySummary, PacketSeal, Sealer,
};

use crate::capture_mode;
use crate::config::RunnerConfig;
use crate::context::{
    AuditEvent, Clock, InteractionLogEntry, RunContext, RunFailure, RunStatus, StepRef,
    StepResult, SystemClock,
};
use crate::driver::{DriverLauncher, PageDriver};
use crate::engine::StepEngine;
use crate::error::{FlowError, RunnerResult};
use crate::evidence::{ArtifactRef, EvidenceCollector, EvidenceIndex, OutputLayout};
use crate::plan::FlowPlan;
use crate::redaction::Redactor;
use crate::report::{render_report, status_banner, RunMetadata};

pub const INTERACTION_LOG_FILE: &str = "interaction_log.json";
pub const EVIDENCE_INDEX_FILE: &str = "evidence_index.json";
pub const RUN_METADATA_FILE: &str = "run_metadata.json";
pub const CONSOLE_LOG_FILE: &str = "console_log.jsonl";
pub const STATUS_FILE: &str = "STATUS.txt";
pub const REPORT_FILE: &str = "report.txt";

/// What a finished run produced
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub status: RunStatus,
    pub error: Option<RunFailure>,
    pub run_dir: PathBuf,
    pub deliverable: PathBuf,
    pub seal: PacketSeal,
    pub integrity: IntegritySummary,
}

impl RunOutcome {
    pub fn success(&self) -> bool {
        self.status == RunStatus::Success
    }

    /// 0 for a successful sealed run, 1 for any sealed failure
    pub fn exit_code(&self) -> i32 {
        if self.success() {
            0
        } else {
            1
        }
    }
}

pub struct FlowRunner {
    config: RunnerConfig,
    launcher: Arc<dyn DriverLauncher>,
    clock: Arc<dyn Clock>,
}

impl FlowRunner {
    pub fn new(config: RunnerConfig, launcher: Arc<dyn DriverLauncher>) -> Self {
        Self {
            config,
            launcher,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Load a plan file and run it.
    ///
    /// An unreadable or invalid plan is still sealed as a failed run.
    pub async fn run_file(
        &self,
        plan_path: &Path,
        run_id: Option<String>,
    ) -> RunnerResult<RunOutcome> {
        let (loaded, plan_sha256) = match std::fs::read(plan_path) {
            Ok(bytes) => {
                let digest = sha256_hex(&bytes);
                let loaded = String::from_utf8(bytes)
                    .map_err(|e| FlowError::Schema(format!("plan is not UTF-8: {}", e)))
                    .and_then(|text| FlowPlan::from_yaml(&text));
                (loaded, Some(digest))
            }
            Err(e) => (
                Err(FlowError::Schema(format!(
                    "cannot read {}: {}",
                    plan_path.display(),
                    e
                ))),
                None,
            ),
        };
        self.run_loaded(loaded, plan_sha256, run_id).await
    }

    /// Run an already decoded plan; the capture mode gate still applies
    pub async fn run_plan(
        &self,
        plan: FlowPlan,
        run_id: Option<String>,
    ) -> RunnerResult<RunOutcome> {
        let plan_sha256 = sha256_canonical(&plan).ok();
        self.run_loaded(Ok(plan), plan_sha256, run_id).await
    }

    async fn run_loaded(
        &self,
        loaded: Result<FlowPlan, FlowError>,
        plan_sha256: Option<String>,
        run_id: Option<String>,
    ) -> RunnerResult<RunOutcome> {
        let run_id = run_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let layout = OutputLayout::new(&self.config.output_root, &run_id);
        layout.create()?;

        let integrity = self
            .config
            .sealing
            .integrity
            .build(&self.config.sealing.chain_seed)?;

        let gated = loaded.and_then(|plan| {
            capture_mode::enforce(&plan)?;
            Ok(plan)
        });
        let (plan_id, mode) = match &gated {
            Ok(plan) => (plan.id.clone(), Some(plan.capture_mode)),
            Err(_) => ("unloaded".to_string(), None),
        };

        let mut ctx = RunContext::new(&run_id, plan_id, mode, self.clock.clone(), integrity);
        info!(run_id = %run_id, dir = %layout.run_dir().display(), "run started");

        match &gated {
            Ok(plan) => self.execute(plan, &layout, &mut ctx).await,
            Err(e) => {
                error!(
                    run_id = %run_id,
                    kind = %e.kind(),
                    error = %e,
                    "plan rejected before launch"
                );
                ctx.fail(e);
            }
        }

        self.check_required_artifacts(&mut ctx);
        self.seal(ctx, &layout, plan_sha256)
    }

    /// Launch, run the engine and always tear the driver down
    async fn execute(&self, plan: &FlowPlan, layout: &OutputLayout, ctx: &mut RunContext) {
        let redactor = match Redactor::standard() {
            Ok(redactor) => redactor,
            Err(e) => {
                ctx.fail(&e);
                return;
            }
        };

        let mut driver = match self.launcher.launch().await {
            Ok(driver) => driver,
            Err(e) => {
                let err = FlowError::action("launch", e);
                error!(error = %err, "driver launch failed");
                ctx.fail(&err);
                return;
            }
        };

        let mut recording = Vec::new();
        for kind in self.config.capture.recordings() {
            match driver.start_recording(kind).await {
                Ok(()) => recording.push(kind),
                Err(e) => {
                    warn!(recording = kind.as_str(), error = %e, "recording not started");
                    ctx.audit(AuditEvent::RecordingFailed {
                        recording: kind.as_str().to_string(),
                        reason: e.to_string(),
                    });
                    ctx.add_recording(ArtifactRef::missing(kind.as_str(), e.to_string()));
                }
            }
        }

        let collector = EvidenceCollector::new(layout.clone(), self.config.capture.snapshots());
        let policy = self.config.stabilization.policy();

        let result = {
            let mut engine = StepEngine::new(
                driver.as_mut(),
                &policy,
                &collector,
                &redactor,
                &self.config.timeouts,
            );
            AssertUnwindSafe(engine.run(plan, ctx)).catch_unwind().await
        };
        if let Err(panic) = result {
            let message = panic_message(panic.as_ref());
            error!(%message, "step engine panicked");
            ctx.audit(AuditEvent::EnginePanicked {
                message: message.clone(),
            });
            let err = FlowError::Action {
                action: "engine".to_string(),
                reason: format!("panicked: {}", message),
            };
            settle_interrupted(plan, driver.as_mut(), &collector, ctx, &err).await;
            ctx.fail(&err);
        }

        collector
            .stop_recordings(driver.as_mut(), ctx, &recording)
            .await;
        match driver.drain_console().await {
            Ok(messages) => ctx.console(messages),
            Err(e) => warn!(error = %e, "final console drain failed"),
        }
        if let Err(e) = driver.close().await {
            warn!(error = %e, "driver teardown failed");
            ctx.audit(AuditEvent::TeardownFailed {
                reason: e.to_string(),
            });
        }
    }

    /// Fail the run if any evidence record lacks a required artifact
    fn check_required_artifacts(&self, ctx: &mut RunContext) {
        let required = &self.config.sealing.required_artifacts;
        if required.is_empty() || ctx.evidence().is_empty() {
            return;
        }
        let missing: Vec<String> = ctx
            .evidence()
            .iter()
            .flat_map(|record| {
                required
                    .iter()
                    .filter(|kind| !record.has_artifact(**kind))
                    .map(move |kind| format!("step {} {}", record.step_index, kind.as_str()))
            })
            .collect();
        if !missing.is_empty() {
            let err = FlowError::Sealing(format!(
                "required artifacts missing: {}",
                missing.join(", ")
            ));
            error!(error = %err, "sealing gate failed");
            ctx.fail_at(&err, None);
        }
    }

    /// Freeze the context, write the deliverable files and seal
    fn seal(
        &self,
        ctx: RunContext,
        layout: &OutputLayout,
        plan_sha256: Option<String>,
    ) -> RunnerResult<RunOutcome> {
        let mut run = ctx.freeze();
        let deliverable = layout.deliverable();
        let logs = layout.logs_dir();
        let verification = layout.verification_dir();

        write_canonical(&logs.join(INTERACTION_LOG_FILE), &run.interactions)?;
        write_canonical(
            &logs.join(EVIDENCE_INDEX_FILE),
            &EvidenceIndex {
                records: run.evidence.clone(),
                recordings: run.recordings.clone(),
            },
        )?;

        let mut console = Vec::new();
        for event in &run.events {
            console.extend(canonical_bytes(event)?);
            console.push(b'\n');
        }
        std::fs::write(verification.join(CONSOLE_LOG_FILE), console)?;

        let integrity = run.finalize_integrity(&verification)?.clone();
        let metadata = RunMetadata::from_run(&run, plan_sha256);
        write_canonical(&verification.join(RUN_METADATA_FILE), &metadata)?;
        std::fs::write(verification.join(STATUS_FILE), status_banner(&metadata))?;
        std::fs::write(deliverable.join(REPORT_FILE), render_report(&run, &metadata))?;

        let seal = Sealer::new(&deliverable).seal(&run.run_id, &run.finished_at)?;

        info!(
            run_id = %run.run_id,
            status = run.status.as_str(),
            packet_hash = %seal.packet_hash,
            "run sealed"
        );

        Ok(RunOutcome {
            run_id: run.run_id,
            status: run.status,
            error: run.error,
            run_dir: layout.run_dir().to_path_buf(),
            deliverable,
            seal,
            integrity,
        })
    }
}

/// Close out the step a panic interrupted: evidence, an error log entry and
/// a failed state, so the sealed record agrees with the run error.
async fn settle_interrupted(
    plan: &FlowPlan,
    driver: &mut dyn PageDriver,
    collector: &EvidenceCollector,
    ctx: &mut RunContext,
    err: &FlowError,
) {
    let Some(step) = ctx.current_step() else {
        return;
    };
    if ctx.interactions().iter().any(|entry| entry.step_index == step) {
        return;
    }
    let (sequence, action, selector) = match step {
        StepRef::Index(0) => (0, "navigate".to_string(), None),
        StepRef::Index(n) => match plan.steps.get(n as usize - 1) {
            Some(planned) => (
                n,
                planned.kind.type_name().to_string(),
                planned.kind.selector().map(str::to_string),
            ),
            None => return,
        },
        StepRef::Goal => (
            plan.steps.len() as u32 + 1,
            "goal".to_string(),
            plan.goal.as_ref().map(|goal| goal.selector.clone()),
        ),
    };

    if let Err(e) = collector.capture(driver, ctx, step, sequence).await {
        warn!(step = %step, error = %e, "evidence for interrupted step not recorded");
    }
    let timestamp = ctx.timestamp();
    ctx.log_interaction(InteractionLogEntry {
        step_index: step,
        action,
        selector,
        result: StepResult::Error,
        error_kind: Some(err.kind()),
        error_message: Some(err.to_string()),
        note: None,
        timestamp,
    });
    ctx.end_step(step, StepResult::Error);
}

fn write_canonical<T: Serialize + ?Sized>(path: &Path, value: &T) -> RunnerResult<()> {
    let mut bytes = canonical_bytes(value)?;
    bytes.push(b'\n');
    std::fs::write(path, bytes)?;
    Ok(())
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
