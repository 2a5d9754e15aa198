//! KubeVirt VM driver
//!
//! Create / delete / snapshot / restore the practice VMs, poll their
//! readiness, and reach into them:
//! - typed core resources (Namespace, ResourceQuota, Secret, Pod) via kube
//! - KubeVirt CRDs via the dynamic API
//! - rendered manifests applied through `kubectl apply -f -` reading stdin
//! - in-VM shell access through the external `virtctl ssh` helper

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Pod, ResourceQuota, ResourceQuotaSpec, Secret};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{
    Api, ApiResource, AttachParams, DeleteParams, DynamicObject, GroupVersionKind, ListParams,
    PostParams,
};
use kube::{Client, Config as KubeConfig};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::time::sleep;
use tracing::{debug, info};

use crate::config::Config;
use crate::templates::TemplateStore;

const READY_POLL: Duration = Duration::from_secs(10);
/// the VM ready flag is known to lag the instance; tolerate it after this long
const READY_FLAG_LAG: Duration = Duration::from_secs(60);
const READY_CEILING: Duration = Duration::from_secs(30 * 60);

const JOIN_POLL: Duration = Duration::from_secs(15);
const JOIN_CEILING: Duration = Duration::from_secs(15 * 60);

const SNAPSHOT_POLL: Duration = Duration::from_secs(5);
const SNAPSHOT_CEILING: Duration = Duration::from_secs(10 * 60);

const TPL_CONTROL_PLANE_VM: &str = "control-plane-vm.yaml";
const TPL_WORKER_VM: &str = "worker-node-vm.yaml";
const TPL_CLOUD_INIT_CONTROL_PLANE: &str = "cloud-init-control-plane.yaml";
const TPL_CLOUD_INIT_WORKER: &str = "cloud-init-worker.yaml";

#[derive(Error, Debug)]
pub enum VmError {
    #[error("kube error: {0}")]
    Kube(#[from] kube::Error),
    #[error("infer config error: {0}")]
    InferConfig(#[from] kube::config::InferConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("template error: {0}")]
    Template(#[from] crate::templates::TemplateError),
    #[error("vm '{0}' not ready after {1}")]
    ReadyTimeout(String, humantime::Duration),
    #[error("pod not found for vm '{0}'")]
    PodNotFound(String),
    #[error("command failed: {0}")]
    Command(String),
    #[error("apply failed: {0}")]
    Apply(String),
    #[error("join command unavailable: {0}")]
    JoinCommand(String),
    #[error("snapshot '{0}' not ready after {1}")]
    SnapshotTimeout(String, humantime::Duration),
    #[error("baseline snapshots for '{0}' are not ready")]
    SnapshotNotReady(String),
    #[error("malformed resource: {0}")]
    Malformed(String),
}

/// true when the error is a 404 from the API server
pub fn is_not_found(err: &VmError) -> bool {
    matches!(err, VmError::Kube(kube::Error::Api(ae)) if ae.code == 404)
}

/// Result of a command run through the SSH helper.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Coarse VM state as surfaced to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmPhase {
    Running,
    Starting,
    Pending,
}

impl VmPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            VmPhase::Running => "Running",
            VmPhase::Starting => "Starting",
            VmPhase::Pending => "Pending",
        }
    }
}

/// The driver contract shared by the pool, the session manager, and the
/// validation engine. Production uses [`KubeVirtDriver`]; tests substitute an
/// in-memory fake.
#[async_trait]
pub trait VmDriver: Send + Sync {
    /// no-op list against the VM API as a liveness probe
    async fn verify_available(&self) -> Result<(), VmError>;

    async fn create_namespace(&self, ns: &str) -> Result<(), VmError>;
    async fn apply_resource_quota(&self, ns: &str) -> Result<(), VmError>;
    async fn delete_namespace(&self, ns: &str) -> Result<(), VmError>;

    /// control-plane secret + VM, wait ready, join command, worker secret + VM
    async fn create_cluster(&self, ns: &str, cp: &str, wk: &str) -> Result<(), VmError>;
    async fn wait_for_vm_ready(&self, ns: &str, name: &str) -> Result<(), VmError>;
    async fn vm_status(&self, ns: &str, name: &str) -> Result<VmPhase, VmError>;
    async fn start_vm(&self, ns: &str, name: &str) -> Result<(), VmError>;
    async fn stop_vm(&self, ns: &str, name: &str) -> Result<(), VmError>;

    /// synchronous command via the backing pod's exec subresource
    async fn exec_in_vm(&self, ns: &str, name: &str, cmd: &str) -> Result<String, VmError>;
    /// shell command inside the VM via the SSH helper
    async fn run_ssh(&self, ns: &str, vm: &str, cmd: &str) -> Result<CommandOutput, VmError>;
    async fn vm_pod_name(&self, ns: &str, name: &str) -> Result<String, VmError>;

    async fn snapshot(&self, ns: &str, vm: &str, snap: &str) -> Result<(), VmError>;
    async fn restore(&self, ns: &str, vm: &str, snap: &str) -> Result<(), VmError>;
    async fn snapshots_ready(&self, ns: &str, snaps: &[String]) -> Result<bool, VmError>;

    /// delete VMs, their disk volumes, and cloud-init secrets; not-found at
    /// any step is success
    async fn delete_vms(&self, ns: &str, names: &[String]) -> Result<(), VmError>;

    /// rendered YAML through the out-of-process apply helper
    async fn apply_manifest(&self, ns: &str, yaml: &str) -> Result<(), VmError>;
    /// dynamic GET used by the validation engine
    async fn get_resource(
        &self,
        ns: &str,
        kind: &str,
        name: &str,
    ) -> Result<Option<Value>, VmError>;
}

pub struct KubeVirtDriver {
    client: Client,
    config: Arc<Config>,
    templates: Arc<TemplateStore>,
}

impl KubeVirtDriver {
    pub async fn connect(
        config: Arc<Config>,
        templates: Arc<TemplateStore>,
    ) -> Result<Self, VmError> {
        let kube_config = KubeConfig::infer().await?;
        let client = Client::try_from(kube_config)?;
        Ok(KubeVirtDriver {
            client,
            config,
            templates,
        })
    }

    fn vm_api(&self, ns: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), ns, &vm_resource())
    }

    fn vmi_api(&self, ns: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), ns, &vmi_resource())
    }

    fn snapshot_api(&self, ns: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), ns, &snapshot_resource())
    }

    fn restore_api(&self, ns: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), ns, &restore_resource())
    }

    fn datavolume_api(&self, ns: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), ns, &datavolume_resource())
    }

    fn base_vars(&self, ns: &str) -> BTreeMap<String, String> {
        let c = &self.config;
        let mut vars = BTreeMap::new();
        vars.insert("NAMESPACE".to_string(), ns.to_string());
        vars.insert("KUBERNETES_VERSION".to_string(), c.kubernetes_version.clone());
        vars.insert("POD_CIDR".to_string(), c.pod_cidr.clone());
        vars.insert("VM_CPU_CORES".to_string(), c.vm_cpu_cores.to_string());
        vars.insert("VM_MEMORY".to_string(), c.vm_memory.clone());
        vars.insert("VM_STORAGE_SIZE".to_string(), c.vm_storage_size.clone());
        vars.insert("VM_STORAGE_CLASS".to_string(), c.vm_storage_class.clone());
        vars.insert("VM_IMAGE_URL".to_string(), c.vm_image_url.clone());
        vars.insert("SSH_USER".to_string(), c.ssh_user.clone());
        vars
    }

    async fn render_and_apply(
        &self,
        ns: &str,
        template: &str,
        vars: &BTreeMap<String, String>,
    ) -> Result<(), VmError> {
        let vars: std::collections::HashMap<String, String> =
            vars.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        let yaml = self.templates.render(template, &vars)?;
        self.apply_manifest(ns, &yaml).await
    }

    /// Poll the control plane for `/etc/kubeadm-join-command` until it holds a
    /// token-bearing line, then rewrite any literal IP to the VM name so the
    /// worker can reach it by hostname within the namespace.
    async fn fetch_join_command(&self, ns: &str, cp: &str) -> Result<String, VmError> {
        let deadline = Instant::now() + JOIN_CEILING;
        loop {
            match self.run_ssh(ns, cp, "cat /etc/kubeadm-join-command").await {
                Ok(out) if out.success() => {
                    if let Some(join) = parse_join_command(&out.stdout, cp) {
                        info!(namespace = %ns, control_plane = %cp, "join command retrieved");
                        return Ok(join);
                    }
                    debug!(namespace = %ns, "join command file present but no token yet");
                }
                Ok(out) => {
                    debug!(namespace = %ns, exit = out.exit_code, "join command not written yet");
                }
                Err(e) => {
                    debug!(namespace = %ns, error = %e, "ssh helper not reachable yet");
                }
            }
            if Instant::now() + JOIN_POLL > deadline {
                return Err(VmError::JoinCommand(format!(
                    "control plane '{}' produced no join token within {}",
                    cp,
                    humantime::Duration::from(JOIN_CEILING)
                )));
            }
            sleep(JOIN_POLL).await;
        }
    }

    async fn wait_snapshot_field(
        &self,
        api: &Api<DynamicObject>,
        name: &str,
        pointer: &str,
    ) -> Result<(), VmError> {
        let deadline = Instant::now() + SNAPSHOT_CEILING;
        loop {
            if let Some(obj) = api.get_opt(name).await? {
                let done = obj
                    .data
                    .pointer(pointer)
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if done {
                    return Ok(());
                }
            }
            if Instant::now() + SNAPSHOT_POLL > deadline {
                return Err(VmError::SnapshotTimeout(
                    name.to_string(),
                    humantime::Duration::from(SNAPSHOT_CEILING),
                ));
            }
            sleep(SNAPSHOT_POLL).await;
        }
    }

    async fn virtctl(&self, args: &[String]) -> Result<std::process::Output, VmError> {
        let out = tokio::process::Command::new("virtctl")
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await?;
        Ok(out)
    }
}

#[async_trait]
impl VmDriver for KubeVirtDriver {
    async fn verify_available(&self) -> Result<(), VmError> {
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &vm_resource());
        api.list(&ListParams::default().limit(1)).await?;
        Ok(())
    }

    async fn create_namespace(&self, ns: &str) -> Result<(), VmError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let mut labels = BTreeMap::new();
        labels.insert("cks.io/session".to_string(), "true".to_string());
        let obj = Namespace {
            metadata: ObjectMeta {
                name: Some(ns.to_string()),
                labels: Some(labels),
                ..Default::default()
            },
            ..Default::default()
        };
        ignore_conflict(api.create(&PostParams::default(), &obj).await)
    }

    async fn apply_resource_quota(&self, ns: &str) -> Result<(), VmError> {
        let api: Api<ResourceQuota> = Api::namespaced(self.client.clone(), ns);
        let mut hard = BTreeMap::new();
        hard.insert("cpu".to_string(), Quantity("4".to_string()));
        hard.insert("memory".to_string(), Quantity("8Gi".to_string()));
        hard.insert("pods".to_string(), Quantity("10".to_string()));
        let quota = ResourceQuota {
            metadata: ObjectMeta {
                name: Some("session-quota".to_string()),
                namespace: Some(ns.to_string()),
                ..Default::default()
            },
            spec: Some(ResourceQuotaSpec {
                hard: Some(hard),
                ..Default::default()
            }),
            ..Default::default()
        };
        ignore_conflict(api.create(&PostParams::default(), &quota).await)
    }

    async fn delete_namespace(&self, ns: &str) -> Result<(), VmError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        ignore_not_found(api.delete(ns, &DeleteParams::default()).await)
    }

    async fn create_cluster(&self, ns: &str, cp: &str, wk: &str) -> Result<(), VmError> {
        info!(namespace = %ns, control_plane = %cp, worker = %wk, "creating cluster");

        let mut vars = self.base_vars(ns);
        vars.insert("VM_NAME".to_string(), cp.to_string());
        vars.insert("CLOUD_INIT_SECRET".to_string(), cloud_init_secret_name(cp));
        self.render_and_apply(ns, TPL_CLOUD_INIT_CONTROL_PLANE, &vars).await?;
        self.render_and_apply(ns, TPL_CONTROL_PLANE_VM, &vars).await?;

        self.wait_for_vm_ready(ns, cp).await?;

        // the worker's cloud-init depends on the token, so stages stay sequential
        let join = self.fetch_join_command(ns, cp).await?;

        let mut vars = self.base_vars(ns);
        vars.insert("VM_NAME".to_string(), wk.to_string());
        vars.insert("CLOUD_INIT_SECRET".to_string(), cloud_init_secret_name(wk));
        vars.insert("CONTROL_PLANE_NAME".to_string(), cp.to_string());
        vars.insert("JOIN_COMMAND".to_string(), join);
        self.render_and_apply(ns, TPL_CLOUD_INIT_WORKER, &vars).await?;
        self.render_and_apply(ns, TPL_WORKER_VM, &vars).await?;

        Ok(())
    }

    async fn wait_for_vm_ready(&self, ns: &str, name: &str) -> Result<(), VmError> {
        let vm_api = self.vm_api(ns);
        let vmi_api = self.vmi_api(ns);
        let deadline = Instant::now() + READY_CEILING;
        let mut running_since: Option<Instant> = None;

        loop {
            let phase = vmi_api
                .get_opt(name)
                .await?
                .and_then(|vmi| {
                    vmi.data
                        .pointer("/status/phase")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                });

            if phase.as_deref() == Some("Running") {
                let since = *running_since.get_or_insert_with(Instant::now);
                let ready_flag = vm_api
                    .get_opt(name)
                    .await?
                    .and_then(|vm| vm.data.pointer("/status/ready").and_then(Value::as_bool))
                    .unwrap_or(false);
                if ready_flag || since.elapsed() >= READY_FLAG_LAG {
                    info!(namespace = %ns, vm = %name, ready_flag, "vm ready");
                    return Ok(());
                }
            } else {
                running_since = None;
            }

            if Instant::now() + READY_POLL > deadline {
                return Err(VmError::ReadyTimeout(
                    name.to_string(),
                    humantime::Duration::from(READY_CEILING),
                ));
            }
            sleep(READY_POLL).await;
        }
    }

    async fn vm_status(&self, ns: &str, name: &str) -> Result<VmPhase, VmError> {
        let vm = self.vm_api(ns).get_opt(name).await?;
        let Some(vm) = vm else {
            return Ok(VmPhase::Pending);
        };
        let flag = |p: &str| vm.data.pointer(p).and_then(Value::as_bool).unwrap_or(false);
        if flag("/status/ready") {
            Ok(VmPhase::Running)
        } else if flag("/status/created") {
            Ok(VmPhase::Starting)
        } else {
            Ok(VmPhase::Pending)
        }
    }

    async fn start_vm(&self, ns: &str, name: &str) -> Result<(), VmError> {
        let args: Vec<String> = ["start", name, "-n", ns].iter().map(|s| s.to_string()).collect();
        let out = self.virtctl(&args).await?;
        if !out.status.success() {
            return Err(VmError::Command(format!(
                "virtctl start {}: {}",
                name,
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        Ok(())
    }

    async fn stop_vm(&self, ns: &str, name: &str) -> Result<(), VmError> {
        let args: Vec<String> = ["stop", name, "-n", ns].iter().map(|s| s.to_string()).collect();
        let out = self.virtctl(&args).await?;
        if !out.status.success() {
            return Err(VmError::Command(format!(
                "virtctl stop {}: {}",
                name,
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        Ok(())
    }

    async fn exec_in_vm(&self, ns: &str, name: &str, cmd: &str) -> Result<String, VmError> {
        let pod = self.vm_pod_name(ns, name).await?;
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), ns);

        debug!(namespace = %ns, vm = %name, pod = %pod, "executing in backing pod");

        let params = AttachParams::default()
            .container("compute")
            .stdout(true)
            .stderr(true);
        let mut attached = pods.exec(&pod, vec!["sh", "-c", cmd], &params).await?;

        let stdout_reader = attached.stdout();
        let stderr_reader = attached.stderr();
        let (stdout, stderr) =
            tokio::join!(read_channel(stdout_reader), read_channel(stderr_reader));
        let stdout = stdout?;
        let stderr = stderr?;

        let status = match attached.take_status() {
            Some(fut) => fut.await,
            None => None,
        };
        attached
            .join()
            .await
            .map_err(|e| VmError::Command(format!("exec did not complete: {e}")))?;

        if let Some(status) = status
            && status.status.as_deref() == Some("Failure")
        {
            return Err(VmError::Command(
                status.message.unwrap_or_else(|| "exec failed".to_string()),
            ));
        }
        if !stderr.is_empty() {
            return Err(VmError::Command(
                String::from_utf8_lossy(&stderr).trim().to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&stdout).to_string())
    }

    async fn run_ssh(&self, ns: &str, vm: &str, cmd: &str) -> Result<CommandOutput, VmError> {
        let args = ssh_command_args(vm, ns, &self.config.ssh_user, cmd);
        let out = self.virtctl(&args).await?;
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&out.stdout).to_string(),
            exit_code: out.status.code().unwrap_or(-1),
        })
    }

    async fn vm_pod_name(&self, ns: &str, name: &str) -> Result<String, VmError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), ns);

        let selector = format!("vm.kubevirt.io/name={name}");
        let list = pods.list(&ListParams::default().labels(&selector)).await?;
        if let Some(pod) = list.items.first()
            && let Some(pod_name) = pod.metadata.name.clone()
        {
            return Ok(pod_name);
        }

        // the selector can miss on older launcher pods; fall back to the name
        let prefix = format!("virt-launcher-{name}");
        let all = pods.list(&ListParams::default()).await?;
        all.items
            .iter()
            .filter_map(|p| p.metadata.name.clone())
            .find(|n| n.contains(&prefix))
            .ok_or_else(|| VmError::PodNotFound(name.to_string()))
    }

    async fn snapshot(&self, ns: &str, vm: &str, snap: &str) -> Result<(), VmError> {
        let api = self.snapshot_api(ns);
        let obj: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "snapshot.kubevirt.io/v1beta1",
            "kind": "VirtualMachineSnapshot",
            "metadata": {"name": snap, "namespace": ns},
            "spec": {
                "source": {"apiGroup": "kubevirt.io", "kind": "VirtualMachine", "name": vm}
            }
        }))
        .map_err(|e| VmError::Malformed(e.to_string()))?;

        info!(namespace = %ns, vm = %vm, snapshot = %snap, "creating snapshot");
        ignore_conflict(api.create(&PostParams::default(), &obj).await)?;
        self.wait_snapshot_field(&api, snap, "/status/readyToUse").await
    }

    async fn restore(&self, ns: &str, vm: &str, snap: &str) -> Result<(), VmError> {
        let api = self.restore_api(ns);
        let restore_name = format!("{vm}-restore-{:08x}", fastrand::u32(..));
        let obj: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "snapshot.kubevirt.io/v1beta1",
            "kind": "VirtualMachineRestore",
            "metadata": {"name": restore_name, "namespace": ns},
            "spec": {
                "target": {"apiGroup": "kubevirt.io", "kind": "VirtualMachine", "name": vm},
                "virtualMachineSnapshotName": snap
            }
        }))
        .map_err(|e| VmError::Malformed(e.to_string()))?;

        info!(namespace = %ns, vm = %vm, snapshot = %snap, "restoring from snapshot");
        api.create(&PostParams::default(), &obj).await?;
        self.wait_snapshot_field(&api, &restore_name, "/status/complete").await?;

        // the restore object is one-shot; drop it once applied
        let _ = api.delete(&restore_name, &DeleteParams::default()).await;
        Ok(())
    }

    async fn snapshots_ready(&self, ns: &str, snaps: &[String]) -> Result<bool, VmError> {
        let api = self.snapshot_api(ns);
        for snap in snaps {
            let ready = api
                .get_opt(snap)
                .await?
                .and_then(|o| o.data.pointer("/status/readyToUse").and_then(Value::as_bool))
                .unwrap_or(false);
            if !ready {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn delete_vms(&self, ns: &str, names: &[String]) -> Result<(), VmError> {
        let vm_api = self.vm_api(ns);
        let dv_api = self.datavolume_api(ns);
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), ns);

        for name in names {
            info!(namespace = %ns, vm = %name, "deleting vm");
            ignore_not_found(vm_api.delete(name, &DeleteParams::default()).await)?;

            for dv in [name.clone(), format!("{name}-dv")] {
                ignore_not_found(dv_api.delete(&dv, &DeleteParams::default()).await)?;
            }

            let secret = cloud_init_secret_name(name);
            ignore_not_found(secrets.delete(&secret, &DeleteParams::default()).await)?;
        }
        Ok(())
    }

    async fn apply_manifest(&self, ns: &str, yaml: &str) -> Result<(), VmError> {
        let mut cmd = tokio::process::Command::new("kubectl");
        cmd.args(["apply", "-n", ns, "-f", "-"]);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(yaml.as_bytes()).await?;
        }
        let output = child.wait_with_output().await?;

        if !output.status.success() {
            return Err(VmError::Apply(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            debug!(namespace = %ns, "{}", line);
        }
        Ok(())
    }

    async fn get_resource(
        &self,
        ns: &str,
        kind: &str,
        name: &str,
    ) -> Result<Option<Value>, VmError> {
        let ar = kind_to_api_resource(kind)
            .ok_or_else(|| VmError::Malformed(format!("unsupported kind '{kind}'")))?;
        let obj = if cluster_scoped(kind) {
            Api::<DynamicObject>::all_with(self.client.clone(), &ar).get_opt(name).await?
        } else {
            Api::<DynamicObject>::namespaced_with(self.client.clone(), ns, &ar)
                .get_opt(name)
                .await?
        };
        match obj {
            Some(o) => Ok(Some(
                serde_json::to_value(&o).map_err(|e| VmError::Malformed(e.to_string()))?,
            )),
            None => Ok(None),
        }
    }
}

async fn read_channel<R: AsyncRead + Unpin>(reader: Option<R>) -> Result<Vec<u8>, VmError> {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        reader.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

fn ignore_not_found<T>(res: Result<T, kube::Error>) -> Result<(), VmError> {
    match res {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn ignore_conflict<T>(res: Result<T, kube::Error>) -> Result<(), VmError> {
    match res {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn vm_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk("kubevirt.io", "v1", "VirtualMachine"),
        "virtualmachines",
    )
}

fn vmi_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk("kubevirt.io", "v1", "VirtualMachineInstance"),
        "virtualmachineinstances",
    )
}

fn snapshot_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk("snapshot.kubevirt.io", "v1beta1", "VirtualMachineSnapshot"),
        "virtualmachinesnapshots",
    )
}

fn restore_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk("snapshot.kubevirt.io", "v1beta1", "VirtualMachineRestore"),
        "virtualmachinerestores",
    )
}

fn datavolume_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk("cdi.kubevirt.io", "v1beta1", "DataVolume"),
        "datavolumes",
    )
}

/// Map a validation-rule kind to its API coordinates. Plurals are explicit
/// because naive pluralization breaks on kinds like NetworkPolicy.
pub fn kind_to_api_resource(kind: &str) -> Option<ApiResource> {
    let (group, version, plural) = match kind {
        "Pod" => ("", "v1", "pods"),
        "Service" => ("", "v1", "services"),
        "ConfigMap" => ("", "v1", "configmaps"),
        "Secret" => ("", "v1", "secrets"),
        "ServiceAccount" => ("", "v1", "serviceaccounts"),
        "Namespace" => ("", "v1", "namespaces"),
        "PersistentVolumeClaim" => ("", "v1", "persistentvolumeclaims"),
        "Deployment" => ("apps", "v1", "deployments"),
        "DaemonSet" => ("apps", "v1", "daemonsets"),
        "StatefulSet" => ("apps", "v1", "statefulsets"),
        "ReplicaSet" => ("apps", "v1", "replicasets"),
        "Job" => ("batch", "v1", "jobs"),
        "CronJob" => ("batch", "v1", "cronjobs"),
        "NetworkPolicy" => ("networking.k8s.io", "v1", "networkpolicies"),
        "Ingress" => ("networking.k8s.io", "v1", "ingresses"),
        "Role" => ("rbac.authorization.k8s.io", "v1", "roles"),
        "RoleBinding" => ("rbac.authorization.k8s.io", "v1", "rolebindings"),
        "ClusterRole" => ("rbac.authorization.k8s.io", "v1", "clusterroles"),
        "ClusterRoleBinding" => ("rbac.authorization.k8s.io", "v1", "clusterrolebindings"),
        _ => return None,
    };
    Some(ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk(group, version, kind),
        plural,
    ))
}

fn cluster_scoped(kind: &str) -> bool {
    matches!(kind, "Namespace" | "ClusterRole" | "ClusterRoleBinding")
}

pub fn cloud_init_secret_name(vm: &str) -> String {
    format!("{vm}-cloud-init")
}

/// `virtctl ssh` argument list for a one-shot command.
pub fn ssh_command_args(vm: &str, ns: &str, user: &str, cmd: &str) -> Vec<String> {
    vec![
        "ssh".to_string(),
        format!("vmi/{vm}"),
        "-n".to_string(),
        ns.to_string(),
        "--username".to_string(),
        user.to_string(),
        "--local-ssh-opts".to_string(),
        "-o StrictHostKeyChecking=no".to_string(),
        "--command".to_string(),
        cmd.to_string(),
    ]
}

/// `virtctl ssh` argument list for an interactive terminal (forced tty).
pub fn ssh_terminal_args(vm: &str, ns: &str, user: &str) -> Vec<String> {
    vec![
        "ssh".to_string(),
        format!("vmi/{vm}"),
        "-n".to_string(),
        ns.to_string(),
        "--username".to_string(),
        user.to_string(),
        "--local-ssh-opts".to_string(),
        "-o StrictHostKeyChecking=no -tt".to_string(),
    ]
}

/// Extract the join command from the helper output: first non-empty line
/// carrying a token, with any literal `ip:port` endpoint rewritten to the
/// control-plane VM name.
pub fn parse_join_command(output: &str, control_plane: &str) -> Option<String> {
    let line = output
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && l.contains("--token"))?;
    Some(rewrite_join_endpoint(line, control_plane))
}

fn rewrite_join_endpoint(line: &str, control_plane: &str) -> String {
    line.split_whitespace()
        .map(|tok| {
            if let Some((host, port)) = tok.split_once(':')
                && host.parse::<std::net::Ipv4Addr>().is_ok()
                && port.parse::<u16>().is_ok()
            {
                format!("{control_plane}:{port}")
            } else {
                tok.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Wrap a script body so it runs as a file on the VM and reports its own exit
/// code, regardless of length or quoting.
pub fn wrap_script(script: &str) -> String {
    format!(
        r#"_cks_script="/tmp/cks_script_$$.sh"
cat > "$_cks_script" << 'CKS_SCRIPT_EOF'
{script}
CKS_SCRIPT_EOF
chmod +x "$_cks_script"
sh "$_cks_script"
_cks_exit=$?
rm -f "$_cks_script"
exit $_cks_exit"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_join_command_rewrites_ip() {
        let raw = "kubeadm join 10.244.1.7:6443 --token abc.def --discovery-token-ca-cert-hash sha256:123\n";
        let join = parse_join_command(raw, "cp-cluster1").unwrap();
        assert_eq!(
            join,
            "kubeadm join cp-cluster1:6443 --token abc.def --discovery-token-ca-cert-hash sha256:123"
        );
    }

    #[test]
    fn test_parse_join_command_hostname_untouched() {
        let raw = "kubeadm join control-plane:6443 --token abc.def";
        let join = parse_join_command(raw, "cp-cluster1").unwrap();
        assert_eq!(join, "kubeadm join control-plane:6443 --token abc.def");
    }

    #[test]
    fn test_parse_join_command_requires_token() {
        assert!(parse_join_command("", "cp").is_none());
        assert!(parse_join_command("\n\n", "cp").is_none());
        assert!(parse_join_command("file not ready", "cp").is_none());
    }

    #[test]
    fn test_parse_join_command_skips_leading_noise() {
        let raw = "\nWarning: permanently added host\nkubeadm join 192.168.0.2:6443 --token t.t\n";
        let join = parse_join_command(raw, "cp-x").unwrap();
        assert_eq!(join, "kubeadm join cp-x:6443 --token t.t");
    }

    #[test]
    fn test_ssh_command_args_shape() {
        let args = ssh_command_args("cp-cluster2", "cluster2", "suporte", "hostname");
        assert_eq!(args[0], "ssh");
        assert_eq!(args[1], "vmi/cp-cluster2");
        assert!(args.contains(&"cluster2".to_string()));
        assert!(args.contains(&"--command".to_string()));
        assert_eq!(args.last().unwrap(), "hostname");
    }

    #[test]
    fn test_kind_mapping_plurals() {
        assert!(kind_to_api_resource("NetworkPolicy").is_some());
        assert!(kind_to_api_resource("Ingress").is_some());
        assert!(kind_to_api_resource("GitRepository").is_none());
        assert!(cluster_scoped("Namespace"));
        assert!(!cluster_scoped("Pod"));
    }

    #[test]
    fn test_wrap_script_preserves_body() {
        let wrapped = wrap_script("echo 'hello'\nexit 3");
        assert!(wrapped.contains("echo 'hello'\nexit 3"));
        assert!(wrapped.contains("CKS_SCRIPT_EOF"));
        assert!(wrapped.ends_with("exit $_cks_exit"));
    }

    #[test]
    fn test_cloud_init_secret_name() {
        assert_eq!(cloud_init_secret_name("wk-cluster3"), "wk-cluster3-cloud-init");
    }

    #[test]
    fn test_command_output_success() {
        let ok = CommandOutput { stdout: String::new(), exit_code: 0 };
        let bad = CommandOutput { stdout: String::new(), exit_code: 1 };
        assert!(ok.success());
        assert!(!bad.success());
    }
}
