//! Declarative flow plans
//!
//! A plan is loaded in two passes. The raw document is first scanned for
//! policy-relevant shape problems (forbidden free-text goal fields, the
//! ambiguity override outside `wait_for`, unknown keys), then decoded into
//! typed values. Downstream code only ever sees a validated [`FlowPlan`].

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::FlowError;

/// Free-text goal field that may not appear anywhere in a plan
pub const FORBIDDEN_GOAL_FIELD: &str = "goal_text";

/// Step key that relaxes strict selector resolution
pub const OVERRIDE_FLAG: &str = "allow_multiple";

const COMMON_STEP_KEYS: &[&str] = &["type", "timeout_ms", "note"];

/// Execution policy declared by the plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMode {
    Passive,
    Interactive,
}

impl CaptureMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureMode::Passive => "passive",
            CaptureMode::Interactive => "interactive",
        }
    }
}

/// A complete, validated flow plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FlowPlan {
    pub id: String,
    pub start_url: String,
    pub capture_mode: CaptureMode,
    pub steps: Vec<Step>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal: Option<Goal>,
}

/// A single plan step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    #[serde(flatten)]
    pub kind: StepKind,

    /// Per-step timeout; the runner default applies when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    /// Free-text operator note, redacted before persistence
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// What a step does. Only `WaitFor` can relax strict resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    WaitFor {
        selector: String,
        #[serde(default)]
        allow_multiple: bool,
    },
    Scroll {
        #[serde(default)]
        selector: Option<String>,
    },
    AssertText {
        selector: String,
        text: String,
    },
    AssertUrl {
        contains: String,
    },
    Click {
        selector: String,
    },
    Fill {
        selector: String,
        text: String,
    },
    Press {
        selector: String,
        key: String,
    },
    Keypress {
        key: String,
    },
    Navigate {
        url: String,
    },
}

impl StepKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            StepKind::WaitFor { .. } => "wait_for",
            StepKind::Scroll { .. } => "scroll",
            StepKind::AssertText { .. } => "assert_text",
            StepKind::AssertUrl { .. } => "assert_url",
            StepKind::Click { .. } => "click",
            StepKind::Fill { .. } => "fill",
            StepKind::Press { .. } => "press",
            StepKind::Keypress { .. } => "keypress",
            StepKind::Navigate { .. } => "navigate",
        }
    }

    pub fn selector(&self) -> Option<&str> {
        match self {
            StepKind::WaitFor { selector, .. }
            | StepKind::AssertText { selector, .. }
            | StepKind::Click { selector }
            | StepKind::Fill { selector, .. }
            | StepKind::Press { selector, .. } => Some(selector),
            StepKind::Scroll { selector } => selector.as_deref(),
            StepKind::AssertUrl { .. } | StepKind::Keypress { .. } | StepKind::Navigate { .. } => {
                None
            }
        }
    }

    /// Whether the step can change page state
    pub fn is_state_changing(&self) -> bool {
        !matches!(
            self,
            StepKind::WaitFor { .. }
                | StepKind::Scroll { .. }
                | StepKind::AssertText { .. }
                | StepKind::AssertUrl { .. }
        )
    }

    fn allowed_keys(type_name: &str) -> Option<&'static [&'static str]> {
        let keys: &'static [&'static str] = match type_name {
            "wait_for" => &["selector", OVERRIDE_FLAG],
            "scroll" => &["selector"],
            "assert_text" => &["selector", "text"],
            "assert_url" => &["contains"],
            "click" => &["selector"],
            "fill" => &["selector", "text"],
            "press" => &["selector", "key"],
            "keypress" => &["key"],
            "navigate" => &["url"],
            _ => return None,
        };
        Some(keys)
    }
}

/// Terminal presence/absence check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Goal {
    pub selector: String,
    pub expect: GoalExpectation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalExpectation {
    Present,
    Absent,
}

impl FlowPlan {
    /// Parse a plan from YAML text (JSON is accepted as a YAML subset)
    pub fn from_yaml(content: &str) -> Result<Self, FlowError> {
        let raw: Value = serde_yaml::from_str(content)
            .map_err(|e| FlowError::Schema(format!("unparseable plan: {}", e)))?;
        Self::from_value(raw)
    }

    /// Parse a plan from a file
    pub fn from_file(path: &Path) -> Result<Self, FlowError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| FlowError::Schema(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_yaml(&content)
    }

    /// Validate a raw document and decode it
    pub fn from_value(raw: Value) -> Result<Self, FlowError> {
        validate_raw(&raw)?;
        let plan: FlowPlan =
            serde_json::from_value(raw).map_err(|e| FlowError::Schema(e.to_string()))?;
        plan.validate_semantics()?;
        Ok(plan)
    }

    fn validate_semantics(&self) -> Result<(), FlowError> {
        if self.id.trim().is_empty() {
            return Err(FlowError::Schema("plan id is empty".to_string()));
        }
        if self.start_url.trim().is_empty() {
            return Err(FlowError::Schema("start_url is empty".to_string()));
        }
        for (i, step) in self.steps.iter().enumerate() {
            if let Some(selector) = step.kind.selector() {
                if selector.trim().is_empty() {
                    return Err(FlowError::Schema(format!(
                        "step {} ({}) has an empty selector",
                        i + 1,
                        step.kind.type_name()
                    )));
                }
            }
            if step.timeout_ms == Some(0) {
                return Err(FlowError::Schema(format!("step {} has a zero timeout", i + 1)));
            }
        }
        if let Some(goal) = &self.goal {
            if goal.selector.trim().is_empty() {
                return Err(FlowError::Schema("goal selector is empty".to_string()));
            }
        }
        Ok(())
    }
}

fn validate_raw(raw: &Value) -> Result<(), FlowError> {
    if let Some(path) = find_key(raw, FORBIDDEN_GOAL_FIELD, "$") {
        return Err(FlowError::PolicyViolation(format!(
            "forbidden field '{}' present at {}",
            FORBIDDEN_GOAL_FIELD, path
        )));
    }

    let root = raw
        .as_object()
        .ok_or_else(|| FlowError::Schema("plan must be a mapping".to_string()))?;

    if let Some(Value::String(_)) = root.get("goal") {
        return Err(FlowError::PolicyViolation(
            "goal must be a structured selector check, not free text".to_string(),
        ));
    }

    let steps = match root.get("steps") {
        Some(Value::Array(steps)) => steps,
        Some(_) => return Err(FlowError::Schema("steps must be a list".to_string())),
        None => return Err(FlowError::Schema("missing field `steps`".to_string())),
    };

    for (i, step) in steps.iter().enumerate() {
        let number = i + 1;
        let fields = step
            .as_object()
            .ok_or_else(|| FlowError::Schema(format!("step {} must be a mapping", number)))?;
        let type_name = fields
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| FlowError::Schema(format!("step {} has no type", number)))?;

        if fields.contains_key(OVERRIDE_FLAG) && type_name != "wait_for" {
            return Err(FlowError::PolicyViolation(format!(
                "step {}: '{}' is only permitted on wait_for steps, found on '{}'",
                number, OVERRIDE_FLAG, type_name
            )));
        }

        let allowed = StepKind::allowed_keys(type_name).ok_or_else(|| {
            FlowError::Schema(format!("step {} has unknown type '{}'", number, type_name))
        })?;
        if let Some(unknown) = fields
            .keys()
            .find(|k| !COMMON_STEP_KEYS.contains(&k.as_str()) && !allowed.contains(&k.as_str()))
        {
            return Err(FlowError::Schema(format!(
                "step {} ({}) has unknown field '{}'",
                number, type_name, unknown
            )));
        }
    }

    Ok(())
}

fn find_key(value: &Value, key: &str, path: &str) -> Option<String> {
    match value {
        Value::Object(map) => {
            if map.contains_key(key) {
                return Some(format!("{}.{}", path, key));
            }
            map.iter()
                .find_map(|(k, v)| find_key(v, key, &format!("{}.{}", path, k)))
        }
        Value::Array(items) => items
            .iter()
            .enumerate()
            .find_map(|(i, v)| find_key(v, key, &format!("{}[{}]", path, i))),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    const CHECKOUT: &str = r#"
id: checkout-flow
start_url: https://shop.example/cart
capture_mode: interactive
steps:
  - type: wait_for
    selector: '[data-testid="cart"]'
  - type: fill
    selector: '#email'
    text: buyer@example.com
    note: customer email
  - type: click
    selector: 'button#checkout'
    timeout_ms: 3000
goal:
  selector: '.order-confirmed'
  expect: present
"#;

    #[test]
    fn test_parse_plan() {
        let plan = FlowPlan::from_yaml(CHECKOUT).unwrap();
        assert_eq!(plan.id, "checkout-flow");
        assert_eq!(plan.capture_mode, CaptureMode::Interactive);
        assert_eq!(plan.steps.len(), 3);
        assert_eq!(plan.steps[2].timeout_ms, Some(3000));
        assert_eq!(plan.steps[1].note.as_deref(), Some("customer email"));
        assert_eq!(plan.goal.unwrap().expect, GoalExpectation::Present);
    }

    #[test]
    fn test_parse_json_plan() {
        let json = r##"{"id":"p","start_url":"https://a.example","capture_mode":"passive",
            "steps":[{"type":"wait_for","selector":".row","allow_multiple":true},
                     {"type":"assert_url","contains":"/a"}]}"##;
        let plan = FlowPlan::from_yaml(json).unwrap();
        assert_eq!(
            plan.steps[0].kind,
            StepKind::WaitFor {
                selector: ".row".to_string(),
                allow_multiple: true
            }
        );
    }

    #[test]
    fn test_override_outside_wait_for_is_policy_violation() {
        let yaml = r#"
id: p
start_url: https://a.example
capture_mode: interactive
steps:
  - type: click
    selector: '.item'
    allow_multiple: true
"#;
        let err = FlowPlan::from_yaml(yaml).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PolicyViolation);
        assert!(err.to_string().contains("click"));
    }

    #[test]
    fn test_forbidden_goal_field_anywhere() {
        let yaml = r#"
id: p
start_url: https://a.example
capture_mode: passive
steps:
  - type: wait_for
    selector: main
    note: ok
meta:
  nested:
    goal_text: find the cheapest item
"#;
        let err = FlowPlan::from_yaml(yaml).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PolicyViolation);
        assert!(err.to_string().contains("$.meta.nested.goal_text"));
    }

    #[test]
    fn test_free_text_goal_rejected() {
        let yaml = r#"
id: p
start_url: https://a.example
capture_mode: passive
steps: []
goal: buy the thing
"#;
        let err = FlowPlan::from_yaml(yaml).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PolicyViolation);
    }

    #[test]
    fn test_unknown_step_field_is_schema_error() {
        let yaml = r#"
id: p
start_url: https://a.example
capture_mode: interactive
steps:
  - type: click
    selectr: '.typo'
"#;
        let err = FlowPlan::from_yaml(yaml).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaError);
    }

    #[test]
    fn test_missing_required_field_is_schema_error() {
        let yaml = r#"
id: p
start_url: https://a.example
capture_mode: interactive
steps:
  - type: fill
    selector: '#q'
"#;
        assert_eq!(
            FlowPlan::from_yaml(yaml).unwrap_err().kind(),
            ErrorKind::SchemaError
        );
    }

    #[test]
    fn test_state_changing_classification() {
        let plan = FlowPlan::from_yaml(CHECKOUT).unwrap();
        let flags: Vec<bool> = plan.steps.iter().map(|s| s.kind.is_state_changing()).collect();
        assert_eq!(flags, vec![false, true, true]);
    }
}
