//! Warm cluster pool
//!
//! A fixed set of pre-built two-node clusters that sessions can adopt instead
//! of cold-bootstrapping. Released clusters are reset asynchronously from
//! their per-cluster baseline snapshots before re-entering rotation.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{RwLock, broadcast};
use tokio::time::{interval, timeout};
use tracing::{error, info, warn};

use crate::vm::{VmDriver, VmError};

pub const POOL_SIZE: usize = 3;

const RESET_CEILING: Duration = Duration::from_secs(15 * 60);
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("no cluster capacity available")]
    NoCapacity,
    #[error("cluster '{0}' not found")]
    UnknownCluster(String),
    #[error("no cluster assigned to session '{0}'")]
    NotAssigned(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStatus {
    Creating,
    Available,
    Locked,
    Resetting,
    Error,
}

/// One pool entry. `assign` hands out defensive copies; all mutation goes
/// through the pool by cluster id.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterEntry {
    pub cluster_id: String,
    pub namespace: String,
    pub control_plane_vm: String,
    pub worker_vm: String,
    pub status: PoolStatus,
    pub assigned_session: String,
    pub lock_time: Option<DateTime<Utc>>,
    pub last_reset: Option<DateTime<Utc>>,
    pub last_health_check: Option<DateTime<Utc>>,
}

impl ClusterEntry {
    fn new(cluster_id: &str) -> Self {
        ClusterEntry {
            cluster_id: cluster_id.to_string(),
            namespace: cluster_id.to_string(),
            control_plane_vm: format!("cp-{cluster_id}"),
            worker_vm: format!("wk-{cluster_id}"),
            status: PoolStatus::Creating,
            assigned_session: String::new(),
            lock_time: None,
            last_reset: None,
            last_health_check: None,
        }
    }

    pub fn control_plane_snapshot(&self) -> String {
        format!("{}-snapshot", self.control_plane_vm)
    }

    pub fn worker_snapshot(&self) -> String {
        format!("{}-snapshot", self.worker_vm)
    }
}

/// Counts by state plus the per-cluster status map.
#[derive(Debug, Clone, Serialize)]
pub struct PoolReport {
    pub available: usize,
    pub locked: usize,
    pub resetting: usize,
    pub creating: usize,
    pub error: usize,
    pub clusters: BTreeMap<String, PoolStatus>,
}

#[derive(Clone)]
pub struct ClusterPool {
    // BTreeMap so assignment scans entries in clusterId lexical order
    entries: Arc<RwLock<BTreeMap<String, ClusterEntry>>>,
    driver: Arc<dyn VmDriver>,
}

impl ClusterPool {
    pub fn new(driver: Arc<dyn VmDriver>) -> Self {
        let mut entries = BTreeMap::new();
        for i in 1..=POOL_SIZE {
            let id = format!("cluster{i}");
            entries.insert(id.clone(), ClusterEntry::new(&id));
        }
        ClusterPool {
            entries: Arc::new(RwLock::new(entries)),
            driver,
        }
    }

    /// Lock the first available entry (lexical order) for the session and
    /// return a copy of it.
    pub async fn assign(&self, session_id: &str) -> Result<ClusterEntry, PoolError> {
        let mut entries = self.entries.write().await;
        for entry in entries.values_mut() {
            if entry.status == PoolStatus::Available {
                entry.status = PoolStatus::Locked;
                entry.assigned_session = session_id.to_string();
                entry.lock_time = Some(Utc::now());
                info!(cluster = %entry.cluster_id, session = %session_id, "cluster assigned");
                return Ok(entry.clone());
            }
        }
        Err(PoolError::NoCapacity)
    }

    pub async fn has_capacity(&self) -> bool {
        self.entries
            .read()
            .await
            .values()
            .any(|e| e.status == PoolStatus::Available)
    }

    /// Release the cluster held by the session and reset it in the background
    /// from its baseline snapshots.
    pub async fn release(&self, session_id: &str) -> Result<(), PoolError> {
        let entry = {
            let mut entries = self.entries.write().await;
            let entry = entries
                .values_mut()
                .find(|e| e.status == PoolStatus::Locked && e.assigned_session == session_id)
                .ok_or_else(|| PoolError::NotAssigned(session_id.to_string()))?;
            entry.status = PoolStatus::Resetting;
            entry.assigned_session.clear();
            entry.lock_time = None;
            entry.clone()
        };

        info!(cluster = %entry.cluster_id, session = %session_id, "cluster released, resetting");
        self.spawn_reset(entry);
        Ok(())
    }

    fn spawn_reset(&self, entry: ClusterEntry) {
        let driver = Arc::clone(&self.driver);
        let entries = Arc::clone(&self.entries);

        tokio::spawn(async move {
            let outcome = timeout(RESET_CEILING, reset_cluster(driver.as_ref(), &entry)).await;

            let mut entries = entries.write().await;
            let Some(e) = entries.get_mut(&entry.cluster_id) else {
                return;
            };
            match outcome {
                Ok(Ok(())) => {
                    e.status = PoolStatus::Available;
                    e.last_reset = Some(Utc::now());
                    info!(cluster = %e.cluster_id, "cluster reset complete");
                }
                Ok(Err(err)) => {
                    e.status = PoolStatus::Error;
                    error!(cluster = %e.cluster_id, error = %err, "cluster reset failed");
                }
                Err(_) => {
                    e.status = PoolStatus::Error;
                    error!(
                        cluster = %e.cluster_id,
                        ceiling = %humantime::Duration::from(RESET_CEILING),
                        "cluster reset timed out"
                    );
                }
            }
        });
    }

    /// Admin override: force an entry back into rotation.
    pub async fn mark_available(&self, cluster_id: &str) -> Result<(), PoolError> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(cluster_id)
            .ok_or_else(|| PoolError::UnknownCluster(cluster_id.to_string()))?;
        entry.status = PoolStatus::Available;
        entry.assigned_session.clear();
        entry.lock_time = None;
        Ok(())
    }

    pub async fn set_status(&self, cluster_id: &str, status: PoolStatus) -> Result<(), PoolError> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(cluster_id)
            .ok_or_else(|| PoolError::UnknownCluster(cluster_id.to_string()))?;
        entry.status = status;
        Ok(())
    }

    pub async fn entries_snapshot(&self) -> Vec<ClusterEntry> {
        self.entries.read().await.values().cloned().collect()
    }

    pub async fn status(&self) -> PoolReport {
        let entries = self.entries.read().await;
        let mut report = PoolReport {
            available: 0,
            locked: 0,
            resetting: 0,
            creating: 0,
            error: 0,
            clusters: BTreeMap::new(),
        };
        for entry in entries.values() {
            match entry.status {
                PoolStatus::Available => report.available += 1,
                PoolStatus::Locked => report.locked += 1,
                PoolStatus::Resetting => report.resetting += 1,
                PoolStatus::Creating => report.creating += 1,
                PoolStatus::Error => report.error += 1,
            }
            report
                .clusters
                .insert(entry.cluster_id.clone(), entry.status);
        }
        report
    }

    /// Periodic health maintenance: stamp `lastHealthCheck` and demote entries
    /// whose control plane no longer responds.
    pub fn start_maintenance(&self, mut shutdown: broadcast::Receiver<()>) {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut tick = interval(MAINTENANCE_INTERVAL);
            tick.tick().await; // first tick fires immediately, skip it
            loop {
                tokio::select! {
                    _ = tick.tick() => pool.run_health_checks().await,
                    _ = shutdown.recv() => break,
                }
            }
        });
    }

    async fn run_health_checks(&self) {
        let candidates: Vec<ClusterEntry> = {
            let entries = self.entries.read().await;
            entries
                .values()
                .filter(|e| e.status == PoolStatus::Available)
                .cloned()
                .collect()
        };

        // the probe reaches through the backing pod's exec subresource, which
        // proves both the pod and the exec path
        let mut failed = Vec::new();
        for entry in &candidates {
            if let Err(err) = self
                .driver
                .exec_in_vm(&entry.namespace, &entry.control_plane_vm, "true")
                .await
            {
                warn!(cluster = %entry.cluster_id, error = %err, "health probe failed");
                failed.push(entry.cluster_id.clone());
            }
        }

        let now = Utc::now();
        let mut entries = self.entries.write().await;
        for entry in entries.values_mut() {
            entry.last_health_check = Some(now);
            if failed.contains(&entry.cluster_id) {
                entry.status = PoolStatus::Error;
            }
        }
    }
}

async fn reset_cluster(driver: &dyn VmDriver, entry: &ClusterEntry) -> Result<(), VmError> {
    let ns = &entry.namespace;
    let vms = [
        (&entry.control_plane_vm, entry.control_plane_snapshot()),
        (&entry.worker_vm, entry.worker_snapshot()),
    ];

    // snapshot presence is a capability probe, never an assumption
    let snaps = [entry.control_plane_snapshot(), entry.worker_snapshot()];
    if !driver.snapshots_ready(ns, &snaps).await? {
        return Err(VmError::SnapshotNotReady(entry.cluster_id.clone()));
    }

    // restore requires a halted target; stop failures are tolerable when the
    // VM is already down
    for (vm, _) in &vms {
        if let Err(err) = driver.stop_vm(ns, vm).await {
            warn!(namespace = %ns, vm = %vm, error = %err, "stop before restore failed");
        }
    }
    for (vm, snap) in &vms {
        driver.restore(ns, vm, snap).await?;
    }
    for (vm, _) in &vms {
        driver.start_vm(ns, vm).await?;
        driver.wait_for_vm_ready(ns, vm).await?;
    }
    Ok(())
}
