//! Sequential step execution
//!
//! Step 0 is the navigation to `start_url`, plan steps follow as 1..=n and
//! the optional goal check comes last. Each step is settled (evidence, log
//! entry, state) before the next begins. The first failure ends the run.

use tracing::{error, info};

use crate::config::TimeoutConfig;
use crate::context::{AuditEvent, InteractionLogEntry, RunContext, StepRef, StepResult};
use crate::driver::{Action, PageDriver};
use crate::error::FlowError;
use crate::evidence::EvidenceCollector;
use crate::plan::{FlowPlan, Goal, GoalExpectation, Step, StepKind};
use crate::redaction::Redactor;
use crate::selector::{ResolutionMode, StabilizationPolicy};

pub struct StepEngine<'a> {
    driver: &'a mut dyn PageDriver,
    policy: &'a StabilizationPolicy,
    collector: &'a EvidenceCollector,
    redactor: &'a Redactor,
    timeouts: &'a TimeoutConfig,
}

impl<'a> StepEngine<'a> {
    pub fn new(
        driver: &'a mut dyn PageDriver,
        policy: &'a StabilizationPolicy,
        collector: &'a EvidenceCollector,
        redactor: &'a Redactor,
        timeouts: &'a TimeoutConfig,
    ) -> Self {
        Self {
            driver,
            policy,
            collector,
            redactor,
            timeouts,
        }
    }

    /// Run the plan to completion or to its first failure.
    ///
    /// A failure is already recorded in `ctx` when this returns `Err`.
    pub async fn run(&mut self, plan: &FlowPlan, ctx: &mut RunContext) -> Result<(), FlowError> {
        let goal_sequence = plan.steps.len() as u32 + 1;
        ctx.plan_steps(
            std::iter::once((StepRef::Index(0), "navigate".to_string()))
                .chain(plan.steps.iter().enumerate().map(|(i, step)| {
                    (StepRef::Index(i as u32 + 1), step.kind.type_name().to_string())
                }))
                .chain(plan.goal.iter().map(|_| (StepRef::Goal, "goal".to_string()))),
        );

        info!(plan = %plan.id, url = %plan.start_url, steps = plan.steps.len(), "starting flow");

        let step = StepRef::Index(0);
        ctx.begin_step(step);
        let outcome = self
            .driver
            .navigate(&plan.start_url, self.timeouts.navigation(None))
            .await
            .map(|final_url| info!(%final_url, "initial navigation complete"))
            .map_err(|e| FlowError::action("navigate", e));
        self.settle(ctx, step, 0, "navigate", None, None, outcome)
            .await?;

        for (i, planned) in plan.steps.iter().enumerate() {
            let number = i as u32 + 1;
            let step = StepRef::Index(number);
            ctx.begin_step(step);
            let note = self.redact_note(ctx, planned.note.as_deref());
            let outcome = self.perform(ctx, planned).await;
            self.settle(
                ctx,
                step,
                number,
                planned.kind.type_name(),
                planned.kind.selector(),
                note,
                outcome,
            )
            .await?;
        }

        if let Some(goal) = &plan.goal {
            ctx.begin_step(StepRef::Goal);
            let outcome = self.check_goal(ctx, goal).await;
            self.settle(
                ctx,
                StepRef::Goal,
                goal_sequence,
                "goal",
                Some(&goal.selector),
                None,
                outcome,
            )
            .await?;
        }

        info!(plan = %plan.id, "flow completed");
        Ok(())
    }

    /// Capture evidence, log the interaction and record the step state
    #[allow(clippy::too_many_arguments)]
    async fn settle(
        &mut self,
        ctx: &mut RunContext,
        step: StepRef,
        sequence: u32,
        action: &str,
        selector: Option<&str>,
        note: Option<String>,
        outcome: Result<(), FlowError>,
    ) -> Result<(), FlowError> {
        let captured = self
            .collector
            .capture(&mut *self.driver, ctx, step, sequence)
            .await;
        let outcome = outcome.and(captured);

        let (result, error_kind, error_message) = match &outcome {
            Ok(()) => (StepResult::Success, None, None),
            Err(e) => (StepResult::Error, Some(e.kind()), Some(e.to_string())),
        };
        let timestamp = ctx.timestamp();
        ctx.log_interaction(InteractionLogEntry {
            step_index: step,
            action: action.to_string(),
            selector: selector.map(str::to_string),
            result,
            error_kind,
            error_message,
            note,
            timestamp,
        });
        ctx.end_step(step, result);

        if let Err(e) = &outcome {
            error!(step = %step, action, kind = %e.kind(), error = %e, "step failed, halting run");
            ctx.fail(e);
        }
        outcome
    }

    fn redact_note(&self, ctx: &mut RunContext, note: Option<&str>) -> Option<String> {
        let redacted = self.redactor.redact(note?);
        if redacted.changed() {
            ctx.audit(AuditEvent::NoteRedacted {
                redactions: redacted.redactions,
                original_length: redacted.original_length,
            });
        }
        Some(redacted.text)
    }

    async fn perform(&mut self, ctx: &mut RunContext, step: &Step) -> Result<(), FlowError> {
        let timeout = self.timeouts.step(step.timeout_ms);
        match &step.kind {
            StepKind::WaitFor {
                selector,
                allow_multiple,
            } => {
                let mode = if *allow_multiple {
                    ResolutionMode::Relaxed
                } else {
                    ResolutionMode::Strict
                };
                self.policy
                    .resolve(&mut *self.driver, ctx, selector, mode, timeout)
                    .await?;
                Ok(())
            }
            StepKind::Scroll { selector } => {
                if let Some(selector) = selector {
                    self.strict(ctx, selector, timeout).await?;
                }
                self.act(selector.as_deref(), Action::Scroll, timeout).await
            }
            StepKind::AssertText { selector, text } => {
                self.strict(ctx, selector, timeout).await?;
                let content = self
                    .driver
                    .text_content(selector, timeout)
                    .await
                    .map_err(|e| FlowError::action("assert_text", e))?;
                if content.contains(text.as_str()) {
                    Ok(())
                } else {
                    Err(FlowError::Action {
                        action: "assert_text".to_string(),
                        reason: format!("text of '{}' does not contain {:?}", selector, text),
                    })
                }
            }
            StepKind::AssertUrl { contains } => {
                let url = self
                    .driver
                    .current_url()
                    .await
                    .map_err(|e| FlowError::action("assert_url", e))?;
                if url.contains(contains.as_str()) {
                    Ok(())
                } else {
                    Err(FlowError::Action {
                        action: "assert_url".to_string(),
                        reason: format!("url {} does not contain {:?}", url, contains),
                    })
                }
            }
            StepKind::Click { selector } => {
                self.strict(ctx, selector, timeout).await?;
                self.act(Some(selector), Action::Click, timeout).await
            }
            StepKind::Fill { selector, text } => {
                self.strict(ctx, selector, timeout).await?;
                let action = Action::Fill { text: text.clone() };
                self.act(Some(selector), action, timeout).await
            }
            StepKind::Press { selector, key } => {
                self.strict(ctx, selector, timeout).await?;
                let action = Action::Press { key: key.clone() };
                self.act(Some(selector), action, timeout).await
            }
            StepKind::Keypress { key } => {
                let action = Action::Keypress { key: key.clone() };
                self.act(None, action, timeout).await
            }
            StepKind::Navigate { url } => {
                let final_url = self
                    .driver
                    .navigate(url, self.timeouts.navigation(step.timeout_ms))
                    .await
                    .map_err(|e| FlowError::action("navigate", e))?;
                info!(%final_url, "navigated");
                Ok(())
            }
        }
    }

    async fn strict(
        &mut self,
        ctx: &mut RunContext,
        selector: &str,
        timeout: std::time::Duration,
    ) -> Result<(), FlowError> {
        self.policy
            .resolve(&mut *self.driver, ctx, selector, ResolutionMode::Strict, timeout)
            .await
            .map(|_| ())
    }

    async fn act(
        &mut self,
        selector: Option<&str>,
        action: Action,
        timeout: std::time::Duration,
    ) -> Result<(), FlowError> {
        self.driver
            .act(selector, &action, timeout)
            .await
            .map_err(|e| FlowError::action(action.name(), e))
    }

    /// Presence or absence of the goal selector under strict sampling
    async fn check_goal(&mut self, ctx: &mut RunContext, goal: &Goal) -> Result<(), FlowError> {
        let timeout = self.timeouts.step(goal.timeout_ms);
        let sample = self
            .policy
            .sample(&mut *self.driver, ctx, &goal.selector, timeout)
            .await?;
        let count = sample.last;

        if count > 1 {
            return Err(FlowError::Goal(format!(
                "'{}' is ambiguous: {} elements matched",
                goal.selector, count
            )));
        }
        match (goal.expect, count) {
            (GoalExpectation::Present, 0) => Err(FlowError::Goal(format!(
                "expected '{}' to be present, found no match",
                goal.selector
            ))),
            (GoalExpectation::Absent, 1) => Err(FlowError::Goal(format!(
                "expected '{}' to be absent, found 1 match",
                goal.selector
            ))),
            _ => Ok(()),
        }
    }
}
