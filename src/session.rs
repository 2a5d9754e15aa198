//! Session lifecycle and provisioning
//!
//! Owns the in-memory session map and the state machine:
//!
//! ```text
//! pending -> provisioning -> running -> completed
//!                 |    \------------------ \
//!                 v                         v
//!               failed  <------------- (expiry)
//! ```
//!
//! `failed` is terminal. Session creation returns immediately; provisioning
//! runs on a detached task with its own bounded deadline and never on the
//! request context. Every failure branch reclaims the session's resources.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cks_model::{SetupStep, TaskValidationResult, VmTarget};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{RwLock, broadcast};
use tokio::time::{interval, sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::pool::{ClusterEntry, ClusterPool, PoolError};
use crate::scenario::ScenarioCatalog;
use crate::terminal::TerminalMux;
use crate::validation::{ValidationEngine, ValidationTargets};
use crate::vm::{VmDriver, VmError, VmPhase, is_not_found, wrap_script};

/// overall budget for one provisioning run
const PROVISION_CEILING: Duration = Duration::from_secs(15 * 60);
/// short pause between stages to absorb platform eventual-consistency
const STAGE_PAUSE: Duration = Duration::from_secs(2);
const NAMESPACE_STAGE: Duration = Duration::from_secs(2 * 60);
const QUOTA_STAGE: Duration = Duration::from_secs(2 * 60);
const CLUSTER_STAGE: Duration = Duration::from_secs(10 * 60);
const VM_READY_STAGE: Duration = Duration::from_secs(15 * 60);
const SCENARIO_INIT_STAGE: Duration = Duration::from_secs(5 * 60);
const CLEANUP_BUDGET: Duration = Duration::from_secs(5 * 60);
const QUOTA_ATTEMPTS: u32 = 5;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("session limit reached ({0} active)")]
    Capacity(usize),
    #[error("session '{0}' not found")]
    NotFound(String),
    #[error("session '{0}' is not running")]
    NotRunning(String),
    #[error("scenario '{0}' not found")]
    UnknownScenario(String),
    #[error("task '{0}' not found in scenario '{1}'")]
    UnknownTask(String, String),
    #[error("stage '{stage}' failed: {message}")]
    StageFailed { stage: String, message: String },
    #[error(transparent)]
    Vm(#[from] VmError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Provisioning,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    pub id: String,
    pub status: TaskState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_validation_result: Option<TaskValidationResult>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub namespace: String,
    pub scenario_id: String,
    pub control_plane_vm: String,
    pub worker_node_vm: String,
    pub start_time: DateTime<Utc>,
    pub expiration_time: DateTime<Utc>,
    pub status: SessionStatus,
    pub status_message: String,
    pub tasks: Vec<TaskStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool_cluster: Option<String>,
    /// terminal registry: terminalId -> target
    #[serde(skip)]
    pub terminals: HashMap<String, VmTarget>,
}

/// Names derived from a session id: namespace, control-plane VM, worker VM.
pub fn derive_names(id: &str) -> (String, String, String) {
    let namespace = format!("user-session-{id}");
    let cp = format!("cks-control-plane-{namespace}");
    let wk = format!("cks-worker-node-{namespace}");
    (namespace, cp, wk)
}

pub fn generate_session_id() -> String {
    format!("{:08x}", fastrand::u32(..))
}

fn transition_allowed(from: SessionStatus, to: SessionStatus) -> bool {
    use SessionStatus::*;
    matches!(
        (from, to),
        (Pending, Provisioning)
            | (Pending, Failed)
            | (Provisioning, Running)
            | (Provisioning, Failed)
            | (Running, Completed)
            | (Running, Failed)
            | (Completed, Failed)
    )
}

/// backoff with +-10% jitter so concurrent retries do not align
fn jittered(base: Duration) -> Duration {
    base.mul_f64(0.9 + fastrand::f64() * 0.2)
}

#[derive(Clone)]
pub struct SessionManager {
    config: Arc<Config>,
    sessions: Arc<RwLock<HashMap<String, Session>>>,
    driver: Arc<dyn VmDriver>,
    pool: ClusterPool,
    catalog: Arc<ScenarioCatalog>,
    engine: ValidationEngine,
    terminals: TerminalMux,
}

impl SessionManager {
    pub fn new(
        config: Arc<Config>,
        driver: Arc<dyn VmDriver>,
        pool: ClusterPool,
        catalog: Arc<ScenarioCatalog>,
        engine: ValidationEngine,
        terminals: TerminalMux,
    ) -> Self {
        SessionManager {
            config,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            driver,
            pool,
            catalog,
            engine,
            terminals,
        }
    }

    /// Insert the session and return immediately; provisioning is
    /// fire-and-forget on a fresh bounded context.
    pub async fn create_session(&self, scenario_id: &str) -> Result<Session, SessionError> {
        if !scenario_id.is_empty() && self.catalog.get(scenario_id).is_none() {
            return Err(SessionError::UnknownScenario(scenario_id.to_string()));
        }

        let session = {
            let mut sessions = self.sessions.write().await;
            if sessions.len() >= self.config.max_concurrent_sessions {
                return Err(SessionError::Capacity(sessions.len()));
            }

            let mut id = generate_session_id();
            while sessions.contains_key(&id) {
                id = generate_session_id();
            }
            let (namespace, cp, wk) = derive_names(&id);

            let tasks = match self.catalog.get(scenario_id) {
                Some(scenario) => scenario
                    .tasks
                    .iter()
                    .map(|t| TaskStatus {
                        id: t.id.clone(),
                        status: TaskState::Pending,
                        validation_time: None,
                        last_validation_result: None,
                    })
                    .collect(),
                None => Vec::new(),
            };

            let now = Utc::now();
            let session = Session {
                id: id.clone(),
                namespace,
                scenario_id: scenario_id.to_string(),
                control_plane_vm: cp,
                worker_node_vm: wk,
                start_time: now,
                expiration_time: now + to_chrono(self.config.session_timeout),
                status: SessionStatus::Pending,
                status_message: "session accepted".to_string(),
                tasks,
                pool_cluster: None,
                terminals: HashMap::new(),
            };
            sessions.insert(id, session.clone());
            session
        };

        info!(session = %session.id, scenario = %session.scenario_id, "session created");

        let mgr = self.clone();
        let id = session.id.clone();
        tokio::spawn(async move {
            match timeout(PROVISION_CEILING, mgr.provision(&id)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => mgr.fail_and_reclaim(&id, &e.to_string()).await,
                Err(_) => {
                    mgr.fail_and_reclaim(
                        &id,
                        &format!(
                            "provisioning timed out after {}",
                            humantime::Duration::from(PROVISION_CEILING)
                        ),
                    )
                    .await
                }
            }
        });

        Ok(session)
    }

    async fn provision(&self, id: &str) -> Result<(), SessionError> {
        self.transition(id, SessionStatus::Provisioning, "allocating environment").await;

        // warm pool first; cold bootstrap is the default
        match self.pool.assign(id).await {
            Ok(entry) => return self.provision_from_pool(id, entry).await,
            Err(PoolError::NoCapacity) => {
                debug!(session = %id, "pool has no capacity, bootstrapping");
            }
            Err(e) => {
                warn!(session = %id, error = %e, "pool assignment failed, bootstrapping");
            }
        }
        self.provision_bootstrap(id).await
    }

    async fn provision_from_pool(
        &self,
        id: &str,
        entry: ClusterEntry,
    ) -> Result<(), SessionError> {
        {
            let mut sessions = self.sessions.write().await;
            if let Some(s) = sessions.get_mut(id) {
                s.namespace = entry.namespace.clone();
                s.control_plane_vm = entry.control_plane_vm.clone();
                s.worker_node_vm = entry.worker_vm.clone();
                s.pool_cluster = Some(entry.cluster_id.clone());
            }
        }

        let driver = Arc::clone(&self.driver);
        let (ns, cp, wk) = (
            entry.namespace.clone(),
            entry.control_plane_vm.clone(),
            entry.worker_vm.clone(),
        );
        self.stage(id, "wait for vms", Some(VM_READY_STAGE), async move {
            driver.wait_for_vm_ready(&ns, &cp).await?;
            driver.wait_for_vm_ready(&ns, &wk).await
        })
        .await?;

        sleep(STAGE_PAUSE).await;
        self.init_scenario(id).await?;
        self.transition(id, SessionStatus::Running, "environment ready").await;
        Ok(())
    }

    async fn provision_bootstrap(&self, id: &str) -> Result<(), SessionError> {
        let (ns, cp, wk) = self.placement(id).await?;

        self.stage(id, "verify platform", None, self.driver.verify_available()).await?;
        sleep(STAGE_PAUSE).await;

        self.stage(id, "create namespace", Some(NAMESPACE_STAGE), self.driver.create_namespace(&ns))
            .await?;
        sleep(STAGE_PAUSE).await;

        self.stage(id, "apply resource quota", Some(QUOTA_STAGE), self.apply_quota_with_retry(&ns))
            .await?;
        sleep(STAGE_PAUSE).await;

        self.stage(id, "create cluster", Some(CLUSTER_STAGE), self.driver.create_cluster(&ns, &cp, &wk))
            .await?;
        sleep(STAGE_PAUSE).await;

        {
            let driver = Arc::clone(&self.driver);
            let (ns, cp, wk) = (ns.clone(), cp.clone(), wk.clone());
            self.stage(id, "wait for vms", Some(VM_READY_STAGE), async move {
                driver.wait_for_vm_ready(&ns, &cp).await?;
                driver.wait_for_vm_ready(&ns, &wk).await
            })
            .await?;
        }
        sleep(STAGE_PAUSE).await;

        self.init_scenario(id).await?;
        self.transition(id, SessionStatus::Running, "environment ready").await;
        Ok(())
    }

    /// Run one provisioning stage under its deadline, folding failures into
    /// a recorded stage error.
    async fn stage<T>(
        &self,
        id: &str,
        name: &str,
        limit: Option<Duration>,
        work: impl Future<Output = Result<T, VmError>>,
    ) -> Result<T, SessionError> {
        info!(session = %id, stage = %name, "stage starting");
        let result = match limit {
            Some(deadline) => match timeout(deadline, work).await {
                Ok(r) => r,
                Err(_) => {
                    return Err(SessionError::StageFailed {
                        stage: name.to_string(),
                        message: format!(
                            "deadline of {} exceeded",
                            humantime::Duration::from(deadline)
                        ),
                    });
                }
            },
            None => work.await,
        };
        match result {
            Ok(value) => {
                info!(session = %id, stage = %name, "stage complete");
                Ok(value)
            }
            Err(e) => Err(SessionError::StageFailed {
                stage: name.to_string(),
                message: e.to_string(),
            }),
        }
    }

    async fn apply_quota_with_retry(&self, ns: &str) -> Result<(), VmError> {
        let mut delay = Duration::from_secs(2);
        let mut attempt = 1;
        loop {
            match self.driver.apply_resource_quota(ns).await {
                Ok(()) => return Ok(()),
                // the namespace is gone, retrying cannot help
                Err(e) if is_not_found(&e) => return Err(e),
                Err(e) if attempt >= QUOTA_ATTEMPTS => return Err(e),
                Err(e) => {
                    warn!(namespace = %ns, attempt, error = %e, "quota apply failed, retrying");
                    sleep(jittered(delay)).await;
                    delay *= 2;
                    attempt += 1;
                }
            }
        }
    }

    async fn init_scenario(&self, id: &str) -> Result<(), SessionError> {
        let sess = self.placement_session(id).await?;
        if sess.scenario_id.is_empty() {
            return Ok(());
        }
        let scenario = self
            .catalog
            .get(&sess.scenario_id)
            .ok_or_else(|| SessionError::UnknownScenario(sess.scenario_id.clone()))?;
        if scenario.setup.is_empty() {
            return Ok(());
        }

        let driver = Arc::clone(&self.driver);
        let steps = scenario.setup.clone();
        let (ns, cp, wk) = (
            sess.namespace.clone(),
            sess.control_plane_vm.clone(),
            sess.worker_node_vm.clone(),
        );
        self.stage(id, "scenario init", Some(SCENARIO_INIT_STAGE), async move {
            run_setup(driver.as_ref(), &ns, &cp, &wk, &steps).await
        })
        .await
    }

    async fn placement(&self, id: &str) -> Result<(String, String, String), SessionError> {
        let sess = self.placement_session(id).await?;
        Ok((sess.namespace, sess.control_plane_vm, sess.worker_node_vm))
    }

    async fn placement_session(&self, id: &str) -> Result<Session, SessionError> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    async fn transition(&self, id: &str, to: SessionStatus, message: &str) {
        let mut sessions = self.sessions.write().await;
        let Some(s) = sessions.get_mut(id) else {
            return;
        };
        if s.status == to {
            s.status_message = message.to_string();
        } else if transition_allowed(s.status, to) {
            debug!(session = %id, from = ?s.status, to = ?to, "transition");
            s.status = to;
            s.status_message = message.to_string();
        } else {
            warn!(session = %id, from = ?s.status, to = ?to, "transition rejected");
        }
    }

    async fn fail_and_reclaim(&self, id: &str, message: &str) {
        warn!(session = %id, message = %message, "session failed");
        self.transition(id, SessionStatus::Failed, message).await;
        if let Ok(sess) = self.placement_session(id).await
            && timeout(CLEANUP_BUDGET, self.cleanup_resources(&sess)).await.is_err()
        {
            warn!(session = %id, "cleanup exceeded its budget");
        }
    }

    /// Idempotent resource teardown: pool-backed sessions release their
    /// cluster, bootstrap sessions drop VMs and namespace. Not-found along
    /// the way is success.
    async fn cleanup_resources(&self, sess: &Session) {
        self.terminals.close_for_session(&sess.id).await;

        if sess.pool_cluster.is_some() {
            if let Err(e) = self.pool.release(&sess.id).await {
                debug!(session = %sess.id, error = %e, "pool release skipped");
            }
        } else {
            let vms = [sess.control_plane_vm.clone(), sess.worker_node_vm.clone()];
            if let Err(e) = self.driver.delete_vms(&sess.namespace, &vms).await {
                warn!(session = %sess.id, error = %e, "vm deletion failed");
            }
            if let Err(e) = self.driver.delete_namespace(&sess.namespace).await {
                warn!(session = %sess.id, error = %e, "namespace deletion failed");
            }
        }
    }

    /// Lookup is synchronous; resource cleanup continues on a detached task
    /// and the record leaves the map once it finishes.
    pub async fn delete_session(&self, id: &str) -> Result<(), SessionError> {
        let sess = self.placement_session(id).await?;
        info!(session = %id, "deleting session");

        let mgr = self.clone();
        tokio::spawn(async move {
            if timeout(CLEANUP_BUDGET, mgr.cleanup_resources(&sess)).await.is_err() {
                warn!(session = %sess.id, "cleanup exceeded its budget");
            }
            mgr.sessions.write().await.remove(&sess.id);
        });
        Ok(())
    }

    /// Push expiry out; does not revive a terminal state.
    pub async fn extend_session(&self, id: &str, extra: Duration) -> Result<Session, SessionError> {
        let mut sessions = self.sessions.write().await;
        let s = sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        s.expiration_time = Utc::now() + to_chrono(extra);
        Ok(s.clone())
    }

    /// Read path for GET detail; promotes provisioning to running once both
    /// VMs report Running.
    pub async fn observe(&self, id: &str) -> Result<Session, SessionError> {
        let sess = self.placement_session(id).await?;
        if sess.status != SessionStatus::Provisioning {
            return Ok(sess);
        }

        let cp = self.driver.vm_status(&sess.namespace, &sess.control_plane_vm).await;
        let wk = self.driver.vm_status(&sess.namespace, &sess.worker_node_vm).await;
        let both_running = matches!(cp, Ok(VmPhase::Running)) && matches!(wk, Ok(VmPhase::Running));
        if both_running {
            let mut sessions = self.sessions.write().await;
            if let Some(s) = sessions.get_mut(id) {
                if s.status == SessionStatus::Provisioning {
                    s.status = SessionStatus::Running;
                    s.status_message = "environment ready".to_string();
                }
                return Ok(s.clone());
            }
        }
        self.placement_session(id).await
    }

    pub async fn get_session(&self, id: &str) -> Result<Session, SessionError> {
        self.placement_session(id).await
    }

    pub async fn list_sessions(&self) -> Vec<Session> {
        let sessions = self.sessions.read().await;
        let mut list: Vec<Session> = sessions.values().cloned().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    pub async fn session_tasks(&self, id: &str) -> Result<Vec<TaskStatus>, SessionError> {
        Ok(self.placement_session(id).await?.tasks)
    }

    /// Terminal gating: the session must exist and be running.
    pub async fn authorize_terminal(
        &self,
        id: &str,
        target: VmTarget,
    ) -> Result<(String, String), SessionError> {
        let sess = self.placement_session(id).await?;
        if sess.status != SessionStatus::Running {
            return Err(SessionError::NotRunning(id.to_string()));
        }
        let vm = match target {
            VmTarget::ControlPlane => sess.control_plane_vm,
            VmTarget::WorkerNode => sess.worker_node_vm,
        };
        Ok((sess.namespace, vm))
    }

    pub async fn record_terminal(&self, id: &str, terminal_id: &str, target: VmTarget) {
        let mut sessions = self.sessions.write().await;
        if let Some(s) = sessions.get_mut(id) {
            s.terminals.insert(terminal_id.to_string(), target);
        }
    }

    pub async fn forget_terminal(&self, id: &str, terminal_id: &str) {
        let mut sessions = self.sessions.write().await;
        if let Some(s) = sessions.get_mut(id) {
            s.terminals.remove(terminal_id);
        }
    }

    /// Run the task's rules and commit the outcome, unless the session
    /// reached `failed` while validation was in flight.
    pub async fn validate_task(
        &self,
        id: &str,
        task_id: &str,
    ) -> Result<TaskValidationResult, SessionError> {
        let sess = self.placement_session(id).await?;
        let scenario = self
            .catalog
            .get(&sess.scenario_id)
            .ok_or_else(|| SessionError::UnknownScenario(sess.scenario_id.clone()))?;
        let task = scenario
            .tasks
            .iter()
            .find(|t| t.id == task_id)
            .ok_or_else(|| {
                SessionError::UnknownTask(task_id.to_string(), scenario.id.clone())
            })?;

        let result = if task.rules.is_empty() {
            TaskValidationResult::trivial()
        } else {
            let targets = ValidationTargets {
                namespace: &sess.namespace,
                control_plane_vm: &sess.control_plane_vm,
                worker_vm: &sess.worker_node_vm,
            };
            self.engine.validate_task(targets, task).await
        };

        let mut sessions = self.sessions.write().await;
        if let Some(s) = sessions.get_mut(id) {
            if s.status == SessionStatus::Failed {
                warn!(session = %id, task = %task_id, "dropping validation result for failed session");
            } else {
                if let Some(ts) = s.tasks.iter_mut().find(|t| t.id == task_id) {
                    ts.status = if result.success {
                        TaskState::Completed
                    } else {
                        TaskState::Failed
                    };
                    ts.validation_time = Some(Utc::now());
                    ts.last_validation_result = Some(result.clone());
                }
                if s.status == SessionStatus::Running
                    && !s.tasks.is_empty()
                    && s.tasks.iter().all(|t| t.status == TaskState::Completed)
                {
                    s.status = SessionStatus::Completed;
                    s.status_message = "all tasks completed".to_string();
                }
            }
        }
        Ok(result)
    }

    /// Periodic expiry: pre-mark expired sessions as failed under the lock,
    /// then clean up and remove them outside it.
    pub fn start_sweeper(&self, mut shutdown: broadcast::Receiver<()>) {
        let mgr = self.clone();
        tokio::spawn(async move {
            let mut tick = interval(mgr.config.cleanup_interval);
            tick.tick().await; // first tick fires immediately, skip it
            loop {
                tokio::select! {
                    _ = tick.tick() => mgr.sweep_expired().await,
                    _ = shutdown.recv() => break,
                }
            }
        });
    }

    pub async fn sweep_expired(&self) {
        let now = Utc::now();
        let expired: Vec<Session> = {
            let mut sessions = self.sessions.write().await;
            sessions
                .values_mut()
                .filter(|s| s.expiration_time < now)
                .map(|s| {
                    if s.status != SessionStatus::Failed {
                        s.status = SessionStatus::Failed;
                        s.status_message = "Session expired".to_string();
                    }
                    s.clone()
                })
                .collect()
        };

        for sess in expired {
            info!(session = %sess.id, "expiring session");
            if timeout(CLEANUP_BUDGET, self.cleanup_resources(&sess)).await.is_err() {
                warn!(session = %sess.id, "expiry cleanup exceeded its budget");
            }
            self.sessions.write().await.remove(&sess.id);
        }
    }
}

async fn run_setup(
    driver: &dyn VmDriver,
    ns: &str,
    cp: &str,
    wk: &str,
    steps: &[SetupStep],
) -> Result<(), VmError> {
    for step in steps {
        match step {
            SetupStep::Resource { manifest } => driver.apply_manifest(ns, manifest).await?,
            SetupStep::Command { target, command } => {
                let vm = if *target == VmTarget::ControlPlane { cp } else { wk };
                let out = driver.run_ssh(ns, vm, command).await?;
                if !out.success() {
                    return Err(VmError::Command(format!(
                        "setup command exited with code {}: {}",
                        out.exit_code, command
                    )));
                }
            }
            SetupStep::Script { target, script } => {
                let vm = if *target == VmTarget::ControlPlane { cp } else { wk };
                let out = driver.run_ssh(ns, vm, &wrap_script(script)).await?;
                if !out.success() {
                    return Err(VmError::Command(format!(
                        "setup script exited with code {}",
                        out.exit_code
                    )));
                }
            }
            SetupStep::Wait { seconds } => sleep(Duration::from_secs(*seconds)).await,
        }
    }
    Ok(())
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::seconds(3600))
}
