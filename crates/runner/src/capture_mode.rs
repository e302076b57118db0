//! Capture mode gate
//!
//! Runs once at load time, before a browser is launched. Passive plans may
//! only observe; interactive plans must actually interact.

use tracing::debug;

use crate::error::FlowError;
use crate::plan::{CaptureMode, FlowPlan};

/// Step types permitted in passive mode
pub const PASSIVE_STEP_TYPES: &[&str] = &["wait_for", "scroll", "assert_text", "assert_url"];

/// Reject plans whose steps are incompatible with their declared capture mode
pub fn enforce(plan: &FlowPlan) -> Result<(), FlowError> {
    match plan.capture_mode {
        CaptureMode::Passive => {
            if let Some((i, step)) = plan
                .steps
                .iter()
                .enumerate()
                .find(|(_, s)| !PASSIVE_STEP_TYPES.contains(&s.kind.type_name()))
            {
                return Err(FlowError::PolicyViolation(format!(
                    "passive capture mode forbids '{}' (step {})",
                    step.kind.type_name(),
                    i + 1
                )));
            }
        }
        CaptureMode::Interactive => {
            if !plan.steps.iter().any(|s| s.kind.is_state_changing()) {
                return Err(FlowError::PolicyViolation(
                    "interactive capture mode declared but no step changes page state".to_string(),
                ));
            }
        }
    }

    debug!(
        plan = %plan.id,
        mode = plan.capture_mode.as_str(),
        steps = plan.steps.len(),
        "capture mode gate passed"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use test_case::test_case;

    fn plan(mode: &str, step_types: &[&str]) -> FlowPlan {
        let steps: Vec<String> = step_types
            .iter()
            .map(|t| match *t {
                "assert_url" => "  - type: assert_url\n    contains: /x\n".to_string(),
                "keypress" => "  - type: keypress\n    key: Enter\n".to_string(),
                "fill" => "  - type: fill\n    selector: '#q'\n    text: hi\n".to_string(),
                "assert_text" => {
                    "  - type: assert_text\n    selector: h1\n    text: Hi\n".to_string()
                }
                other => format!("  - type: {}\n    selector: '#q'\n", other),
            })
            .collect();
        let yaml = format!(
            "id: p\nstart_url: https://a.example\ncapture_mode: {}\nsteps:\n{}",
            mode,
            steps.concat()
        );
        FlowPlan::from_yaml(&yaml).unwrap()
    }

    #[test_case(&["wait_for", "scroll", "assert_text", "assert_url"] ; "all observation steps")]
    #[test_case(&["wait_for"] ; "single wait")]
    fn test_passive_accepts_observation(types: &[&str]) {
        assert!(enforce(&plan("passive", types)).is_ok());
    }

    #[test_case(&["wait_for", "click"] ; "click")]
    #[test_case(&["fill"] ; "fill")]
    #[test_case(&["assert_url", "keypress"] ; "keypress")]
    fn test_passive_rejects_state_changes(types: &[&str]) {
        let err = enforce(&plan("passive", types)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PolicyViolation);
    }

    #[test]
    fn test_interactive_requires_interaction() {
        let err = enforce(&plan("interactive", &["wait_for", "assert_url"])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PolicyViolation);
        assert!(enforce(&plan("interactive", &["wait_for", "click"])).is_ok());
    }
}
