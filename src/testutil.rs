//! In-memory VM driver used by unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::Value;

use crate::config::Config;
use crate::vm::{CommandOutput, VmDriver, VmError, VmPhase};

/// Config with defaults suitable for tests (no env reads).
pub fn test_config() -> Config {
    Config {
        listen_addr: "127.0.0.1:0".to_string(),
        max_concurrent_sessions: 10,
        session_timeout: std::time::Duration::from_secs(3600),
        cleanup_interval: std::time::Duration::from_secs(60),
        template_path: "templates".into(),
        scenarios_path: "scenarios".into(),
        kubernetes_version: "1.33".to_string(),
        pod_cidr: "10.244.0.0/16".to_string(),
        vm_cpu_cores: 2,
        vm_memory: "4Gi".to_string(),
        vm_storage_size: "20Gi".to_string(),
        vm_storage_class: "local-path".to_string(),
        vm_image_url: "http://images.invalid/base.img".to_string(),
        ssh_user: "suporte".to_string(),
    }
}

/// Records every call and lets tests inject failures, canned command output,
/// and cluster resources.
pub struct FakeDriver {
    calls: Mutex<Vec<String>>,
    fail: Mutex<HashSet<String>>,
    exec_responses: Mutex<HashMap<String, CommandOutput>>,
    resources: Mutex<HashMap<(String, String, String), Value>>,
    pub snapshots_ready: AtomicBool,
}

impl Default for FakeDriver {
    fn default() -> Self {
        FakeDriver {
            calls: Mutex::new(Vec::new()),
            fail: Mutex::new(HashSet::new()),
            exec_responses: Mutex::new(HashMap::new()),
            resources: Mutex::new(HashMap::new()),
            // baseline snapshots exist unless a test says otherwise
            snapshots_ready: AtomicBool::new(true),
        }
    }
}

impl FakeDriver {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn fail_on(&self, method: &str) {
        self.fail.lock().unwrap().insert(method.to_string());
    }

    pub fn set_exec(&self, cmd: &str, stdout: &str, exit_code: i32) {
        self.exec_responses.lock().unwrap().insert(
            cmd.to_string(),
            CommandOutput {
                stdout: stdout.to_string(),
                exit_code,
            },
        );
    }

    pub fn put_resource(&self, ns: &str, kind: &str, name: &str, value: Value) {
        self.resources
            .lock()
            .unwrap()
            .insert((ns.to_string(), kind.to_string(), name.to_string()), value);
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn gate(&self, method: &str) -> Result<(), VmError> {
        if self.fail.lock().unwrap().contains(method) {
            Err(VmError::Command(format!("injected {method} failure")))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl VmDriver for FakeDriver {
    async fn verify_available(&self) -> Result<(), VmError> {
        self.record("verify_available".to_string());
        self.gate("verify_available")
    }

    async fn create_namespace(&self, ns: &str) -> Result<(), VmError> {
        self.record(format!("create_namespace {ns}"));
        self.gate("create_namespace")
    }

    async fn apply_resource_quota(&self, ns: &str) -> Result<(), VmError> {
        self.record(format!("apply_resource_quota {ns}"));
        self.gate("apply_resource_quota")
    }

    async fn delete_namespace(&self, ns: &str) -> Result<(), VmError> {
        self.record(format!("delete_namespace {ns}"));
        self.gate("delete_namespace")
    }

    async fn create_cluster(&self, ns: &str, cp: &str, wk: &str) -> Result<(), VmError> {
        self.record(format!("create_cluster {ns} {cp} {wk}"));
        self.gate("create_cluster")
    }

    async fn wait_for_vm_ready(&self, ns: &str, name: &str) -> Result<(), VmError> {
        self.record(format!("wait_for_vm_ready {ns} {name}"));
        self.gate("wait_for_vm_ready")
    }

    async fn vm_status(&self, ns: &str, name: &str) -> Result<VmPhase, VmError> {
        self.record(format!("vm_status {ns} {name}"));
        self.gate("vm_status")?;
        Ok(VmPhase::Running)
    }

    async fn start_vm(&self, ns: &str, name: &str) -> Result<(), VmError> {
        self.record(format!("start_vm {ns} {name}"));
        self.gate("start_vm")
    }

    async fn stop_vm(&self, ns: &str, name: &str) -> Result<(), VmError> {
        self.record(format!("stop_vm {ns} {name}"));
        self.gate("stop_vm")
    }

    async fn exec_in_vm(&self, ns: &str, name: &str, cmd: &str) -> Result<String, VmError> {
        self.record(format!("exec_in_vm {ns} {name} {cmd}"));
        self.gate("exec_in_vm")?;
        Ok(String::new())
    }

    async fn run_ssh(&self, ns: &str, vm: &str, cmd: &str) -> Result<CommandOutput, VmError> {
        self.record(format!("run_ssh {ns} {vm} {cmd}"));
        self.gate("run_ssh")?;
        let canned = self.exec_responses.lock().unwrap().get(cmd).cloned();
        Ok(canned.unwrap_or(CommandOutput {
            stdout: String::new(),
            exit_code: 0,
        }))
    }

    async fn vm_pod_name(&self, ns: &str, name: &str) -> Result<String, VmError> {
        self.record(format!("vm_pod_name {ns} {name}"));
        self.gate("vm_pod_name")?;
        Ok(format!("virt-launcher-{name}-abcde"))
    }

    async fn snapshot(&self, ns: &str, vm: &str, snap: &str) -> Result<(), VmError> {
        self.record(format!("snapshot {ns} {vm} {snap}"));
        self.gate("snapshot")
    }

    async fn restore(&self, ns: &str, vm: &str, snap: &str) -> Result<(), VmError> {
        self.record(format!("restore {ns} {vm} {snap}"));
        self.gate("restore")
    }

    async fn snapshots_ready(&self, ns: &str, _snaps: &[String]) -> Result<bool, VmError> {
        self.record(format!("snapshots_ready {ns}"));
        self.gate("snapshots_ready")?;
        Ok(self.snapshots_ready.load(Ordering::SeqCst))
    }

    async fn delete_vms(&self, ns: &str, names: &[String]) -> Result<(), VmError> {
        self.record(format!("delete_vms {ns} {}", names.join(",")));
        self.gate("delete_vms")
    }

    async fn apply_manifest(&self, ns: &str, _yaml: &str) -> Result<(), VmError> {
        self.record(format!("apply_manifest {ns}"));
        self.gate("apply_manifest")
    }

    async fn get_resource(
        &self,
        ns: &str,
        kind: &str,
        name: &str,
    ) -> Result<Option<Value>, VmError> {
        self.record(format!("get_resource {ns} {kind} {name}"));
        self.gate("get_resource")?;
        Ok(self
            .resources
            .lock()
            .unwrap()
            .get(&(ns.to_string(), kind.to_string(), name.to_string()))
            .cloned())
    }
}
