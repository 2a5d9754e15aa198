//! Pool bootstrap
//!
//! One-shot admin operation that provisions every pool cluster and bakes its
//! baseline snapshots. Not re-entrant: a second invocation while one is in
//! flight is rejected.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::time::timeout;
use tracing::{error, info};

use crate::pool::{ClusterEntry, ClusterPool, PoolStatus};
use crate::vm::{VmDriver, VmError};

const BOOTSTRAP_CEILING: Duration = Duration::from_secs(45 * 60);

#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error("pool bootstrap already in progress")]
    AlreadyRunning,
}

#[derive(Clone)]
pub struct PoolBootstrapper {
    pool: ClusterPool,
    driver: Arc<dyn VmDriver>,
    running: Arc<AtomicBool>,
}

impl PoolBootstrapper {
    pub fn new(pool: ClusterPool, driver: Arc<dyn VmDriver>) -> Self {
        PoolBootstrapper {
            pool,
            driver,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Kick off the bootstrap in the background and return immediately.
    pub fn start(&self) -> Result<(), BootstrapError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(BootstrapError::AlreadyRunning);
        }

        let this = self.clone();
        tokio::spawn(async move {
            info!("pool bootstrap starting");
            match timeout(BOOTSTRAP_CEILING, this.run()).await {
                Ok(()) => info!("pool bootstrap finished"),
                Err(_) => error!(
                    ceiling = %humantime::Duration::from(BOOTSTRAP_CEILING),
                    "pool bootstrap timed out"
                ),
            }
            this.running.store(false, Ordering::SeqCst);
        });
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn run(&self) {
        for entry in self.pool.entries_snapshot().await {
            // entries already in rotation or handed out are left alone
            if matches!(entry.status, PoolStatus::Available | PoolStatus::Locked) {
                continue;
            }
            match self.bootstrap_entry(&entry).await {
                Ok(()) => {
                    let _ = self.pool.mark_available(&entry.cluster_id).await;
                    info!(cluster = %entry.cluster_id, "pool cluster ready");
                }
                Err(e) => {
                    let _ = self.pool.set_status(&entry.cluster_id, PoolStatus::Error).await;
                    error!(cluster = %entry.cluster_id, error = %e, "pool cluster bootstrap failed");
                }
            }
        }
    }

    async fn bootstrap_entry(&self, entry: &ClusterEntry) -> Result<(), VmError> {
        let ns = &entry.namespace;
        let (cp, wk) = (&entry.control_plane_vm, &entry.worker_vm);

        self.driver.create_namespace(ns).await?;
        self.driver.create_cluster(ns, cp, wk).await?;
        self.driver.wait_for_vm_ready(ns, cp).await?;
        self.driver.wait_for_vm_ready(ns, wk).await?;

        // baseline snapshots used by the reset path
        self.driver.snapshot(ns, cp, &entry.control_plane_snapshot()).await?;
        self.driver.snapshot(ns, wk, &entry.worker_snapshot()).await?;
        Ok(())
    }
}
