use serde::{Deserialize, Serialize};

/// Outcome of a single validation rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleResult {
    pub rule_id: String,
    pub passed: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
}

impl RuleResult {
    pub fn pass(rule_id: &str, message: impl Into<String>) -> Self {
        RuleResult {
            rule_id: rule_id.to_string(),
            passed: true,
            message: message.into(),
            expected: None,
            actual: None,
        }
    }

    pub fn fail(rule_id: &str, message: impl Into<String>) -> Self {
        RuleResult {
            rule_id: rule_id.to_string(),
            passed: false,
            message: message.into(),
            expected: None,
            actual: None,
        }
    }

    pub fn with_comparison(mut self, expected: impl Into<String>, actual: impl Into<String>) -> Self {
        self.expected = Some(expected.into());
        self.actual = Some(actual.into());
        self
    }
}

/// Aggregate outcome of validating one task: success iff every rule passed,
/// details in rule declaration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskValidationResult {
    pub success: bool,
    pub message: String,
    pub details: Vec<RuleResult>,
}

impl TaskValidationResult {
    /// result for a task that declares no rules
    pub fn trivial() -> Self {
        TaskValidationResult {
            success: true,
            message: "task has no validation rules".to_string(),
            details: Vec::new(),
        }
    }
}
