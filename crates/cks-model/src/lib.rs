//! Declarative types for scenarios and their validation rules.
//!
//! A scenario is the unit a user requests: an ordered list of tasks, each
//! carrying an ordered list of typed validation rules that are evaluated
//! against the live practice cluster. Scenarios are authored as YAML and
//! deserialized into these types; the orchestrator treats them as read-only
//! input.
//!
//! # Example
//!
//! ```
//! use cks_model::{Scenario, ValidationRule};
//!
//! let yaml = r#"
//! id: network-policy-basics
//! name: Network policy basics
//! tasks:
//!   - id: t1
//!     name: Deny all ingress
//!     rules:
//!       - type: resource_exists
//!         id: r1
//!         kind: NetworkPolicy
//!         name: default-deny
//!         namespace: default
//! "#;
//!
//! let scenario: Scenario = serde_yaml::from_str(yaml).unwrap();
//! assert_eq!(scenario.tasks[0].rules[0].id(), "r1");
//! ```

pub mod result;
pub mod rule;
pub mod scenario;

pub use result::{RuleResult, TaskValidationResult};
pub use rule::{CommandCondition, Condition, ValidationRule, VmTarget};
pub use scenario::{Scenario, ScenarioTask, SetupStep};
