//! Selector stabilization and resolution
//!
//! A selector is sampled twice, a fixed window apart, before any decision
//! is made. A count that changes between samples is logged as instability
//! but the verdict always uses the final sample.
//!
//! Strict resolution needs exactly one match and never picks among several.
//! Relaxed resolution, reachable only through a `wait_for` override, accepts
//! several matches when the count is stable and one of them is visible. Every
//! relaxed resolution is written to the audit log.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::context::{AuditEvent, RunContext};
use crate::driver::PageDriver;
use crate::error::{DriverError, FlowError};

const VISIBILITY_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionMode {
    Strict,
    Relaxed,
}

/// Two count samples taken a stabilization window apart
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub first: usize,
    pub last: usize,
}

impl Sample {
    pub fn is_stable(&self) -> bool {
        self.first == self.last
    }
}

/// A selector accepted for action
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub selector: String,
    pub count: usize,
    pub stable: bool,
    /// First visible match, relaxed mode only
    pub visible_index: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct StabilizationPolicy {
    pub window: Duration,
    pub visibility_check: Duration,
    pub max_visibility_probes: usize,
}

impl Default for StabilizationPolicy {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(500),
            visibility_check: Duration::from_millis(2000),
            max_visibility_probes: 10,
        }
    }
}

impl StabilizationPolicy {
    /// Wait for a match (best effort) and take both count samples
    pub async fn sample(
        &self,
        driver: &mut dyn PageDriver,
        ctx: &mut RunContext,
        selector: &str,
        timeout: Duration,
    ) -> Result<Sample, FlowError> {
        match driver.wait_for_attached(selector, timeout).await {
            Ok(()) => {}
            Err(DriverError::Timeout { .. }) => {
                debug!(selector, "no attached match before timeout");
            }
            Err(e) => return Err(FlowError::action("locate", e)),
        }

        let first = count(driver, selector).await?;
        tokio::time::sleep(self.window).await;
        let last = count(driver, selector).await?;

        let sample = Sample { first, last };
        if !sample.is_stable() {
            warn!(selector, first, last, "selector count changed during stabilization window");
            ctx.audit(AuditEvent::SelectorInstability {
                selector: selector.to_string(),
                first_count: first,
                final_count: last,
                window_ms: self.window.as_millis() as u64,
            });
        }
        Ok(sample)
    }

    pub async fn resolve(
        &self,
        driver: &mut dyn PageDriver,
        ctx: &mut RunContext,
        selector: &str,
        mode: ResolutionMode,
        timeout: Duration,
    ) -> Result<Resolved, FlowError> {
        let sample = self.sample(driver, ctx, selector, timeout).await?;
        let count = sample.last;

        if count == 0 {
            if mode == ResolutionMode::Relaxed {
                record_override(ctx, selector, sample, None, false);
            }
            return Err(FlowError::NotFound {
                selector: selector.to_string(),
            });
        }

        match mode {
            ResolutionMode::Strict => {
                if count > 1 {
                    return Err(FlowError::Ambiguity {
                        selector: selector.to_string(),
                        count,
                    });
                }
                Ok(Resolved {
                    selector: selector.to_string(),
                    count,
                    stable: sample.is_stable(),
                    visible_index: None,
                })
            }
            ResolutionMode::Relaxed => {
                if !sample.is_stable() {
                    record_override(ctx, selector, sample, None, false);
                    return Err(FlowError::Stability {
                        selector: selector.to_string(),
                        reason: format!(
                            "count changed from {} to {} within {}ms",
                            sample.first,
                            sample.last,
                            self.window.as_millis()
                        ),
                    });
                }

                let visible_index = self.first_visible(driver, selector, count).await?;
                record_override(ctx, selector, sample, visible_index, visible_index.is_some());
                match visible_index {
                    Some(index) => Ok(Resolved {
                        selector: selector.to_string(),
                        count,
                        stable: true,
                        visible_index: Some(index),
                    }),
                    None => Err(FlowError::Stability {
                        selector: selector.to_string(),
                        reason: format!("none of {} matches became visible", count),
                    }),
                }
            }
        }
    }

    /// Poll matches for visibility until the check window runs out
    async fn first_visible(
        &self,
        driver: &mut dyn PageDriver,
        selector: &str,
        count: usize,
    ) -> Result<Option<usize>, FlowError> {
        let probes = count.min(self.max_visibility_probes);
        let deadline = Instant::now() + self.visibility_check;
        loop {
            for index in 0..probes {
                let visible = driver
                    .is_visible(selector, index)
                    .await
                    .map_err(|e| FlowError::action("visibility check", e))?;
                if visible {
                    return Ok(Some(index));
                }
            }
            if Instant::now() + VISIBILITY_POLL > deadline {
                return Ok(None);
            }
            tokio::time::sleep(VISIBILITY_POLL).await;
        }
    }
}

async fn count(driver: &mut dyn PageDriver, selector: &str) -> Result<usize, FlowError> {
    driver
        .count(selector)
        .await
        .map_err(|e| FlowError::action("locate", e))
}

fn record_override(
    ctx: &mut RunContext,
    selector: &str,
    sample: Sample,
    visible_index: Option<usize>,
    accepted: bool,
) {
    ctx.audit(AuditEvent::PolicyOverride {
        selector: selector.to_string(),
        observed_count: sample.last,
        stable: sample.is_stable(),
        visible_index,
        accepted,
    });
}
