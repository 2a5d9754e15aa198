use serde::{Deserialize, Serialize};

use crate::rule::{ValidationRule, VmTarget};

/// A practice scenario: ordered tasks plus the declarative steps that prepare
/// the cluster before the user gets access.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub tasks: Vec<ScenarioTask>,
    #[serde(default)]
    pub setup: Vec<SetupStep>,
}

/// One task of a scenario. Rules are evaluated in declaration order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioTask {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub rules: Vec<ValidationRule>,
}

/// A declarative scenario-init step, run sequentially during provisioning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SetupStep {
    /// apply a raw manifest to the session namespace
    Resource { manifest: String },
    /// run a shell command on the target VM; non-zero exit fails the stage
    Command { target: VmTarget, command: String },
    /// run a script body on the target VM
    Script { target: VmTarget, script: String },
    /// absorb eventual consistency before the next step
    Wait { seconds: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scenario_round_trip() {
        let yaml = r#"
id: audit-logging
name: Enable audit logging
category: cluster-hardening
setup:
  - type: command
    target: control-plane
    command: mkdir -p /var/log/kubernetes
  - type: wait
    seconds: 2
tasks:
  - id: t1
    name: Configure the audit policy
    rules:
      - type: file_exists
        id: r1
        target: control-plane
        path: /etc/kubernetes/audit-policy.yaml
      - type: resource_property
        id: r2
        kind: Pod
        name: kube-apiserver
        namespace: kube-system
        property: status.phase
        condition: eq
        value: Running
"#;
        let scenario: Scenario = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(scenario.id, "audit-logging");
        assert_eq!(scenario.setup.len(), 2);
        assert_eq!(scenario.tasks.len(), 1);
        let task = &scenario.tasks[0];
        assert_eq!(task.rules.len(), 2);
        assert_eq!(task.rules[0].id(), "r1");
        assert_eq!(task.rules[1].id(), "r2");
    }

    #[test]
    fn test_empty_task_list_is_valid() {
        let scenario: Scenario = serde_yaml::from_str("id: blank\nname: Blank").unwrap();
        assert!(scenario.tasks.is_empty());
        assert!(scenario.setup.is_empty());
    }
}
