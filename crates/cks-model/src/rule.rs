use serde::{Deserialize, Serialize};

/// Which VM of the two-node cluster a rule (or setup step) runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VmTarget {
    ControlPlane,
    WorkerNode,
}

impl VmTarget {
    /// parse the wire form used by the REST layer ("control-plane" / "worker-node")
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "control-plane" => Some(VmTarget::ControlPlane),
            "worker-node" => Some(VmTarget::WorkerNode),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VmTarget::ControlPlane => "control-plane",
            VmTarget::WorkerNode => "worker-node",
        }
    }
}

/// Comparison applied to an observed value (resource property or file content).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Condition {
    #[serde(rename = "eq", alias = "equals")]
    Equals,
    #[serde(rename = "contains")]
    Contains,
    #[default]
    #[serde(rename = "exists")]
    Exists,
}

/// How a command rule judges its outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandCondition {
    /// exit code 0
    #[default]
    Success,
    /// trimmed stdout equals `value`
    OutputEquals,
    /// stdout contains `value`
    OutputContains,
}

fn default_success_code() -> i32 {
    0
}

/// A single typed assertion about the cluster or a VM filesystem.
///
/// Each variant carries only the fields meaningful to its type. The `id` is
/// opaque to the engine and is echoed back in the per-rule result so the UI
/// can correlate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ValidationRule {
    /// GET (kind, name, namespace); passes when the object exists.
    ResourceExists {
        id: String,
        kind: String,
        name: String,
        #[serde(default)]
        namespace: Option<String>,
        #[serde(default)]
        error_message: Option<String>,
    },
    /// GET the object, extract a dot-path property, compare by `condition`.
    ResourceProperty {
        id: String,
        kind: String,
        name: String,
        #[serde(default)]
        namespace: Option<String>,
        property: String,
        #[serde(default)]
        condition: Condition,
        #[serde(default)]
        value: Option<String>,
        #[serde(default)]
        error_message: Option<String>,
    },
    /// Run a shell command on the target VM and judge exit code or stdout.
    Command {
        id: String,
        target: VmTarget,
        command: String,
        #[serde(default)]
        condition: CommandCondition,
        #[serde(default)]
        value: Option<String>,
        #[serde(default)]
        error_message: Option<String>,
    },
    /// Run a multi-line script body on the target VM; passes when the exit
    /// code equals `success_code`.
    Script {
        id: String,
        target: VmTarget,
        script: String,
        #[serde(default = "default_success_code")]
        success_code: i32,
        #[serde(default)]
        error_message: Option<String>,
    },
    /// `test -f <path>` on the target VM.
    FileExists {
        id: String,
        target: VmTarget,
        path: String,
        #[serde(default)]
        error_message: Option<String>,
    },
    /// `cat <path>` on the target VM, compared by `condition` against `value`.
    FileContent {
        id: String,
        target: VmTarget,
        path: String,
        #[serde(default)]
        condition: Condition,
        #[serde(default)]
        value: Option<String>,
        #[serde(default)]
        error_message: Option<String>,
    },
}

impl ValidationRule {
    pub fn id(&self) -> &str {
        match self {
            ValidationRule::ResourceExists { id, .. }
            | ValidationRule::ResourceProperty { id, .. }
            | ValidationRule::Command { id, .. }
            | ValidationRule::Script { id, .. }
            | ValidationRule::FileExists { id, .. }
            | ValidationRule::FileContent { id, .. } => id,
        }
    }

    /// the author-provided failure message, if any
    pub fn error_message(&self) -> Option<&str> {
        match self {
            ValidationRule::ResourceExists { error_message, .. }
            | ValidationRule::ResourceProperty { error_message, .. }
            | ValidationRule::Command { error_message, .. }
            | ValidationRule::Script { error_message, .. }
            | ValidationRule::FileExists { error_message, .. }
            | ValidationRule::FileContent { error_message, .. } => error_message.as_deref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_round_trip() {
        assert_eq!(VmTarget::parse("control-plane"), Some(VmTarget::ControlPlane));
        assert_eq!(VmTarget::parse("worker-node"), Some(VmTarget::WorkerNode));
        assert_eq!(VmTarget::parse("controlplane"), None);
        assert_eq!(VmTarget::ControlPlane.as_str(), "control-plane");
    }

    #[test]
    fn test_rule_tag_dispatch() {
        let yaml = r#"
type: file_content
id: r2
target: control-plane
path: /home/suporte/1/contexts
condition: contains
value: infra-prod
"#;
        let rule: ValidationRule = serde_yaml::from_str(yaml).unwrap();
        match rule {
            ValidationRule::FileContent {
                ref id,
                target,
                ref path,
                condition,
                ref value,
                ..
            } => {
                assert_eq!(id, "r2");
                assert_eq!(target, VmTarget::ControlPlane);
                assert_eq!(path, "/home/suporte/1/contexts");
                assert_eq!(condition, Condition::Contains);
                assert_eq!(value.as_deref(), Some("infra-prod"));
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_script_default_success_code() {
        let yaml = r#"
type: script
id: r3
target: worker-node
script: |
  systemctl is-active kubelet
"#;
        let rule: ValidationRule = serde_yaml::from_str(yaml).unwrap();
        match rule {
            ValidationRule::Script { success_code, .. } => assert_eq!(success_code, 0),
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_condition_aliases() {
        let c: Condition = serde_yaml::from_str("eq").unwrap();
        assert_eq!(c, Condition::Equals);
        let c: Condition = serde_yaml::from_str("equals").unwrap();
        assert_eq!(c, Condition::Equals);
    }
}
