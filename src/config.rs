use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

/// Orchestrator configuration, sourced from the environment with defaults.
///
/// Loaded once at startup; everything downstream borrows an `Arc<Config>`.
#[derive(Debug, Clone)]
pub struct Config {
    /// address the REST/WebSocket listener binds to
    pub listen_addr: String,
    pub max_concurrent_sessions: usize,
    pub session_timeout: Duration,
    pub cleanup_interval: Duration,
    /// directory holding the VM / cloud-init manifest templates
    pub template_path: PathBuf,
    /// directory holding the scenario catalog (YAML files)
    pub scenarios_path: PathBuf,
    pub kubernetes_version: String,
    pub pod_cidr: String,
    pub vm_cpu_cores: u32,
    pub vm_memory: String,
    pub vm_storage_size: String,
    pub vm_storage_class: String,
    pub vm_image_url: String,
    /// operator account used by the SSH helper inside the VMs
    pub ssh_user: String,
}

impl Config {
    pub fn from_env() -> Self {
        Config {
            listen_addr: env_or("LISTEN_ADDR", "0.0.0.0:8080"),
            max_concurrent_sessions: env_parse("MAX_CONCURRENT_SESSIONS", 10),
            session_timeout: Duration::from_secs(60 * env_parse("SESSION_TIMEOUT_MINUTES", 60u64)),
            cleanup_interval: Duration::from_secs(60 * env_parse("CLEANUP_INTERVAL_MINUTES", 5u64)),
            template_path: PathBuf::from(env_or("TEMPLATE_PATH", "templates")),
            scenarios_path: PathBuf::from(env_or("SCENARIOS_PATH", "scenarios")),
            kubernetes_version: env_or("KUBERNETES_VERSION", "1.33"),
            pod_cidr: env_or("POD_CIDR", "10.244.0.0/16"),
            vm_cpu_cores: env_parse("VM_CPU_CORES", 2),
            vm_memory: env_or("VM_MEMORY", "4Gi"),
            vm_storage_size: env_or("VM_STORAGE_SIZE", "20Gi"),
            vm_storage_class: env_or("VM_STORAGE_CLASS", "local-path"),
            vm_image_url: env_or(
                "VM_IMAGE_URL",
                "https://cloud-images.ubuntu.com/noble/current/noble-server-cloudimg-amd64.img",
            ),
            ssh_user: env_or("SSH_USER", "suporte"),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T>(key: &str, default: T) -> T
where
    T: FromStr + Copy,
{
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(key = %key, value = %raw, "unparseable value, using default");
            default
        }),
        Err(_) => default,
    }
}
