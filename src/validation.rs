//! Declarative validation engine
//!
//! Dispatches typed validation rules across the VMs and the Kubernetes API
//! and aggregates per-rule pass/fail into a task result. A rule that errors
//! out (VM unreachable, lookup failure) is reported as a failed detail with
//! the transport error in its message; it never aborts sibling rules.

use std::sync::Arc;
use std::time::Duration;

use cks_model::{
    CommandCondition, Condition, RuleResult, ScenarioTask, TaskValidationResult, ValidationRule,
    VmTarget,
};
use serde_json::Value;
use shell_escape::escape;
use tokio::time::timeout;
use tracing::debug;

use crate::vm::{CommandOutput, VmDriver, wrap_script};

const RULE_DEADLINE: Duration = Duration::from_secs(30);

/// The cluster a task is validated against, resolved from the session.
#[derive(Debug, Clone, Copy)]
pub struct ValidationTargets<'a> {
    pub namespace: &'a str,
    pub control_plane_vm: &'a str,
    pub worker_vm: &'a str,
}

impl ValidationTargets<'_> {
    fn vm_for(&self, target: VmTarget) -> &str {
        match target {
            VmTarget::ControlPlane => self.control_plane_vm,
            VmTarget::WorkerNode => self.worker_vm,
        }
    }
}

#[derive(Clone)]
pub struct ValidationEngine {
    driver: Arc<dyn VmDriver>,
}

impl ValidationEngine {
    pub fn new(driver: Arc<dyn VmDriver>) -> Self {
        ValidationEngine { driver }
    }

    /// Evaluate every rule of the task with a per-rule deadline; details come
    /// back in declaration order.
    pub async fn validate_task(
        &self,
        targets: ValidationTargets<'_>,
        task: &ScenarioTask,
    ) -> TaskValidationResult {
        if task.rules.is_empty() {
            return TaskValidationResult::trivial();
        }

        let mut details = Vec::with_capacity(task.rules.len());
        for rule in &task.rules {
            let detail = match timeout(RULE_DEADLINE, self.eval_rule(targets, rule)).await {
                Ok(detail) => detail,
                Err(_) => RuleResult::fail(
                    rule.id(),
                    format!(
                        "validation timed out after {}",
                        humantime::Duration::from(RULE_DEADLINE)
                    ),
                ),
            };
            debug!(rule = %rule.id(), passed = detail.passed, "rule evaluated");
            details.push(detail);
        }

        let passed = details.iter().filter(|d| d.passed).count();
        let success = passed == details.len();
        let message = if success {
            format!("all {} checks passed", details.len())
        } else {
            format!("{}/{} checks passed", passed, details.len())
        };
        TaskValidationResult {
            success,
            message,
            details,
        }
    }

    async fn eval_rule(&self, t: ValidationTargets<'_>, rule: &ValidationRule) -> RuleResult {
        match rule {
            ValidationRule::ResourceExists {
                id,
                kind,
                name,
                namespace,
                error_message,
            } => {
                let ns = namespace.as_deref().unwrap_or("default");
                match self.driver.get_resource(ns, kind, name).await {
                    Ok(Some(_)) => {
                        RuleResult::pass(id, format!("{kind} '{name}' exists in '{ns}'"))
                    }
                    Ok(None) => RuleResult::fail(
                        id,
                        override_or(error_message, || {
                            format!("{kind} '{name}' not found in '{ns}'")
                        }),
                    ),
                    Err(e) => RuleResult::fail(id, format!("lookup failed: {e}")),
                }
            }

            ValidationRule::ResourceProperty {
                id,
                kind,
                name,
                namespace,
                property,
                condition,
                value,
                error_message,
            } => {
                let ns = namespace.as_deref().unwrap_or("default");
                let obj = match self.driver.get_resource(ns, kind, name).await {
                    Ok(Some(obj)) => obj,
                    Ok(None) => {
                        return RuleResult::fail(
                            id,
                            format!("{kind} '{name}' not found in '{ns}'"),
                        );
                    }
                    Err(e) => return RuleResult::fail(id, format!("lookup failed: {e}")),
                };
                let observed = lookup_path(&obj, property).map(render_value);
                if compare(*condition, observed.as_deref(), value.as_deref()) {
                    RuleResult::pass(id, format!("property '{property}' satisfied"))
                } else {
                    RuleResult::fail(
                        id,
                        override_or(error_message, || {
                            format!("property '{property}' check failed on {kind} '{name}'")
                        }),
                    )
                    .with_comparison(
                        value.clone().unwrap_or_default(),
                        observed.unwrap_or_else(|| "<absent>".to_string()),
                    )
                }
            }

            ValidationRule::Command {
                id,
                target,
                command,
                condition,
                value,
                error_message,
            } => match self.driver.run_ssh(t.namespace, t.vm_for(*target), command).await {
                Ok(out) => judge_command(id, &out, *condition, value.as_deref(), error_message),
                Err(e) => RuleResult::fail(id, format!("command failed: {e}")),
            },

            ValidationRule::Script {
                id,
                target,
                script,
                success_code,
                error_message,
            } => {
                let wrapped = wrap_script(script);
                match self.driver.run_ssh(t.namespace, t.vm_for(*target), &wrapped).await {
                    Ok(out) if out.exit_code == *success_code => {
                        RuleResult::pass(id, format!("script exited with code {}", out.exit_code))
                    }
                    Ok(out) => RuleResult::fail(
                        id,
                        override_or(error_message, || {
                            format!(
                                "script exited with code {} (expected {})",
                                out.exit_code, success_code
                            )
                        }),
                    ),
                    Err(e) => RuleResult::fail(id, format!("script failed: {e}")),
                }
            }

            ValidationRule::FileExists {
                id,
                target,
                path,
                error_message,
            } => {
                let cmd = format!("test -f {}", escape(path.as_str().into()));
                match self.driver.run_ssh(t.namespace, t.vm_for(*target), &cmd).await {
                    Ok(out) if out.success() => {
                        RuleResult::pass(id, format!("file exists: {path}"))
                    }
                    Ok(_) => RuleResult::fail(
                        id,
                        override_or(error_message, || format!("file not found: {path}")),
                    ),
                    Err(e) => RuleResult::fail(id, format!("file check failed: {e}")),
                }
            }

            ValidationRule::FileContent {
                id,
                target,
                path,
                condition,
                value,
                error_message,
            } => {
                let cmd = format!("cat {}", escape(path.as_str().into()));
                match self.driver.run_ssh(t.namespace, t.vm_for(*target), &cmd).await {
                    Ok(out) if !out.success() => RuleResult::fail(
                        id,
                        override_or(error_message, || format!("file not found: {path}")),
                    ),
                    Ok(out) => {
                        if compare(*condition, Some(&out.stdout), value.as_deref()) {
                            RuleResult::pass(id, format!("content check passed: {path}"))
                        } else {
                            RuleResult::fail(
                                id,
                                override_or(error_message, || {
                                    format!("content check failed: {path}")
                                }),
                            )
                            .with_comparison(
                                value.clone().unwrap_or_default(),
                                out.stdout.trim().to_string(),
                            )
                        }
                    }
                    Err(e) => RuleResult::fail(id, format!("file read failed: {e}")),
                }
            }
        }
    }
}

fn override_or(custom: &Option<String>, default: impl FnOnce() -> String) -> String {
    custom.clone().unwrap_or_else(default)
}

fn judge_command(
    id: &str,
    out: &CommandOutput,
    condition: CommandCondition,
    value: Option<&str>,
    error_message: &Option<String>,
) -> RuleResult {
    match condition {
        CommandCondition::Success => {
            if out.success() {
                RuleResult::pass(id, "command succeeded")
            } else {
                RuleResult::fail(
                    id,
                    override_or(error_message, || {
                        format!("command exited with code {}", out.exit_code)
                    }),
                )
            }
        }
        CommandCondition::OutputEquals => {
            let expected = value.unwrap_or_default();
            if out.stdout.trim() == expected {
                RuleResult::pass(id, "output matched")
            } else {
                RuleResult::fail(id, override_or(error_message, || "output mismatch".to_string()))
                    .with_comparison(expected, out.stdout.trim().to_string())
            }
        }
        CommandCondition::OutputContains => {
            let expected = value.unwrap_or_default();
            if !expected.is_empty() && out.stdout.contains(expected) {
                RuleResult::pass(id, "output contained expected value")
            } else {
                RuleResult::fail(
                    id,
                    override_or(error_message, || "expected value missing from output".to_string()),
                )
                .with_comparison(expected, out.stdout.trim().to_string())
            }
        }
    }
}

/// Descend a dot-path (`spec.containers.0.image`) through the object.
/// Numeric segments index into arrays.
fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Render an observed value the way an author would write it: bare strings,
/// JSON for everything else.
fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn compare(condition: Condition, observed: Option<&str>, expected: Option<&str>) -> bool {
    match condition {
        Condition::Exists => observed.is_some(),
        Condition::Equals => match (observed, expected) {
            (Some(obs), Some(exp)) => obs.trim() == exp,
            _ => false,
        },
        Condition::Contains => match (observed, expected) {
            (Some(obs), Some(exp)) => obs.contains(exp),
            _ => false,
        },
    }
}
