//! Router-level integration tests driving the REST surface end to end
//! against an in-memory VM driver.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use serde_json::{Value, json};
use tower::ServiceExt;

use cks::admin::PoolBootstrapper;
use cks::api::{AppState, router};
use cks::config::Config;
use cks::pool::{ClusterPool, POOL_SIZE};
use cks::scenario::ScenarioCatalog;
use cks::session::SessionManager;
use cks::terminal::TerminalMux;
use cks::validation::ValidationEngine;
use cks::vm::{CommandOutput, VmDriver, VmError, VmPhase};
use cks_model::Scenario;

/// Answers every platform call successfully; command output and cluster
/// resources are canned per test.
#[derive(Default)]
struct FakeDriver {
    exec: Mutex<HashMap<String, CommandOutput>>,
    resources: Mutex<HashMap<(String, String, String), Value>>,
}

impl FakeDriver {
    fn set_exec(&self, cmd: &str, stdout: &str, exit_code: i32) {
        self.exec.lock().unwrap().insert(
            cmd.to_string(),
            CommandOutput {
                stdout: stdout.to_string(),
                exit_code,
            },
        );
    }

    fn put_resource(&self, ns: &str, kind: &str, name: &str, value: Value) {
        self.resources
            .lock()
            .unwrap()
            .insert((ns.to_string(), kind.to_string(), name.to_string()), value);
    }
}

#[async_trait]
impl VmDriver for FakeDriver {
    async fn verify_available(&self) -> Result<(), VmError> {
        Ok(())
    }
    async fn create_namespace(&self, _ns: &str) -> Result<(), VmError> {
        Ok(())
    }
    async fn apply_resource_quota(&self, _ns: &str) -> Result<(), VmError> {
        Ok(())
    }
    async fn delete_namespace(&self, _ns: &str) -> Result<(), VmError> {
        Ok(())
    }
    async fn create_cluster(&self, _ns: &str, _cp: &str, _wk: &str) -> Result<(), VmError> {
        Ok(())
    }
    async fn wait_for_vm_ready(&self, _ns: &str, _name: &str) -> Result<(), VmError> {
        Ok(())
    }
    async fn vm_status(&self, _ns: &str, _name: &str) -> Result<VmPhase, VmError> {
        Ok(VmPhase::Running)
    }
    async fn start_vm(&self, _ns: &str, _name: &str) -> Result<(), VmError> {
        Ok(())
    }
    async fn stop_vm(&self, _ns: &str, _name: &str) -> Result<(), VmError> {
        Ok(())
    }
    async fn exec_in_vm(&self, _ns: &str, _name: &str, _cmd: &str) -> Result<String, VmError> {
        Ok(String::new())
    }
    async fn run_ssh(&self, _ns: &str, _vm: &str, cmd: &str) -> Result<CommandOutput, VmError> {
        let canned = self.exec.lock().unwrap().get(cmd).cloned();
        Ok(canned.unwrap_or(CommandOutput {
            stdout: String::new(),
            exit_code: 0,
        }))
    }
    async fn vm_pod_name(&self, _ns: &str, name: &str) -> Result<String, VmError> {
        Ok(format!("virt-launcher-{name}-abcde"))
    }
    async fn snapshot(&self, _ns: &str, _vm: &str, _snap: &str) -> Result<(), VmError> {
        Ok(())
    }
    async fn restore(&self, _ns: &str, _vm: &str, _snap: &str) -> Result<(), VmError> {
        Ok(())
    }
    async fn snapshots_ready(&self, _ns: &str, _snaps: &[String]) -> Result<bool, VmError> {
        Ok(true)
    }
    async fn delete_vms(&self, _ns: &str, _names: &[String]) -> Result<(), VmError> {
        Ok(())
    }
    async fn apply_manifest(&self, _ns: &str, _yaml: &str) -> Result<(), VmError> {
        Ok(())
    }
    async fn get_resource(
        &self,
        ns: &str,
        kind: &str,
        name: &str,
    ) -> Result<Option<Value>, VmError> {
        Ok(self
            .resources
            .lock()
            .unwrap()
            .get(&(ns.to_string(), kind.to_string(), name.to_string()))
            .cloned())
    }
}

fn make_app(scenarios: Vec<Scenario>, driver: Arc<FakeDriver>) -> (Router, ClusterPool) {
    let driver_dyn: Arc<dyn VmDriver> = driver;
    let pool = ClusterPool::new(Arc::clone(&driver_dyn));
    let catalog = Arc::new(ScenarioCatalog::from_scenarios(scenarios));
    let engine = ValidationEngine::new(Arc::clone(&driver_dyn));
    let terminals = TerminalMux::new("suporte");
    let sessions = SessionManager::new(
        Arc::new(Config::from_env()),
        Arc::clone(&driver_dyn),
        pool.clone(),
        Arc::clone(&catalog),
        engine,
        terminals.clone(),
    );
    let bootstrap = PoolBootstrapper::new(pool.clone(), driver_dyn);
    let state = AppState {
        sessions,
        terminals,
        pool: pool.clone(),
        catalog,
        bootstrap,
    };
    (router(state), pool)
}

async fn request(
    app: &Router,
    method: &str,
    path: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(path);
    let body = match body {
        Some(v) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(v.to_string())
        }
        None => Body::empty(),
    };
    let response = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

async fn wait_for_session_status(app: &Router, id: &str, expected: &str) -> Value {
    for _ in 0..600 {
        let (status, body) = request(app, "GET", &format!("/api/v1/sessions/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        if body["status"] == expected {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("session {id} never reached {expected}");
}

fn validation_scenario() -> Scenario {
    serde_yaml::from_str(
        r#"
id: context-check
name: Inspect kubeconfig contexts
category: cluster-setup
tasks:
  - id: t1
    name: Record the production context
    rules:
      - type: resource_exists
        id: r1
        kind: ConfigMap
        name: scenario-config
        namespace: default
      - type: file_content
        id: r2
        target: control-plane
        path: /home/suporte/1/contexts
        condition: contains
        value: infra-prod
"#,
    )
    .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_happy_path_bootstrap_lifecycle() {
    let (app, _) = make_app(vec![], Arc::new(FakeDriver::default()));

    let (status, body) =
        request(&app, "POST", "/api/v1/sessions", Some(json!({"scenarioId": ""}))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["status"], "pending");
    let id = body["sessionId"].as_str().unwrap().to_string();
    assert_eq!(id.len(), 8);

    let body = wait_for_session_status(&app, &id, "running").await;
    assert_eq!(body["namespace"], format!("user-session-{id}"));

    let (status, _) =
        request(&app, "DELETE", &format!("/api/v1/sessions/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);

    // cleanup is asynchronous; the record disappears within one tick
    let mut gone = false;
    for _ in 0..600 {
        let (status, _) = request(&app, "GET", &format!("/api/v1/sessions/{id}"), None).await;
        if status == StatusCode::NOT_FOUND {
            gone = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(gone, "deleted session still listed");
}

#[tokio::test(start_paused = true)]
async fn test_over_capacity_returns_429() {
    let (app, _) = make_app(vec![], Arc::new(FakeDriver::default()));

    for _ in 0..10 {
        let (status, _) =
            request(&app, "POST", "/api/v1/sessions", Some(json!({"scenarioId": ""}))).await;
        assert_eq!(status, StatusCode::CREATED);
    }
    let (status, body) =
        request(&app, "POST", "/api/v1/sessions", Some(json!({"scenarioId": ""}))).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert!(body["error"].as_str().unwrap().contains("limit"));
}

#[tokio::test(start_paused = true)]
async fn test_unknown_scenario_rejected_with_400() {
    let (app, _) = make_app(vec![], Arc::new(FakeDriver::default()));
    let (status, _) = request(
        &app,
        "POST",
        "/api/v1/sessions",
        Some(json!({"scenarioId": "does-not-exist"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test(start_paused = true)]
async fn test_pool_assignment_locks_one_entry() {
    let (app, pool) = make_app(vec![], Arc::new(FakeDriver::default()));
    for i in 1..=POOL_SIZE {
        pool.mark_available(&format!("cluster{i}")).await.unwrap();
    }

    let (status, body) =
        request(&app, "POST", "/api/v1/sessions", Some(json!({"scenarioId": ""}))).await;
    assert_eq!(status, StatusCode::CREATED);
    let id = body["sessionId"].as_str().unwrap().to_string();

    let body = wait_for_session_status(&app, &id, "running").await;
    assert_eq!(body["poolCluster"], "cluster1");
    assert_eq!(body["namespace"], "cluster1");
    assert_eq!(body["controlPlaneVm"], "cp-cluster1");

    let report = pool.status().await;
    assert_eq!(report.locked, 1);
    assert_eq!(report.clusters["cluster1"], cks::pool::PoolStatus::Locked);
}

#[tokio::test(start_paused = true)]
async fn test_terminal_endpoints() {
    let (app, _) = make_app(vec![], Arc::new(FakeDriver::default()));

    let (_, body) =
        request(&app, "POST", "/api/v1/sessions", Some(json!({"scenarioId": ""}))).await;
    let id = body["sessionId"].as_str().unwrap().to_string();

    // terminals are gated on a running session
    let (status, _) = request(
        &app,
        "POST",
        &format!("/api/v1/sessions/{id}/terminals"),
        Some(json!({"target": "control-plane"})),
    )
    .await;
    assert_eq!(status, StatusCode::PRECONDITION_FAILED);

    wait_for_session_status(&app, &id, "running").await;

    let (status, _) = request(
        &app,
        "POST",
        &format!("/api/v1/sessions/{id}/terminals"),
        Some(json!({"target": "both-of-them"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = request(
        &app,
        "POST",
        &format!("/api/v1/sessions/{id}/terminals"),
        Some(json!({"target": "control-plane"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let terminal_id = body["terminalId"].as_str().unwrap().to_string();
    assert!(terminal_id.starts_with(&format!("{id}-control-plane-")));

    // resize validation
    let (status, _) = request(
        &app,
        "POST",
        &format!("/api/v1/terminals/{terminal_id}/resize"),
        Some(json!({"rows": 0, "cols": 80})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = request(
        &app,
        "POST",
        &format!("/api/v1/terminals/{terminal_id}/resize"),
        Some(json!({"rows": 24, "cols": 80})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = request(
        &app,
        "POST",
        "/api/v1/terminals/missing/resize",
        Some(json!({"rows": 24, "cols": 80})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // close is idempotent at the HTTP level: second delete is a 404
    let (status, _) = request(
        &app,
        "DELETE",
        &format!("/api/v1/terminals/{terminal_id}"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = request(
        &app,
        "DELETE",
        &format!("/api/v1/terminals/{terminal_id}"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test(start_paused = true)]
async fn test_validation_mix_reports_per_rule_details() {
    let driver = Arc::new(FakeDriver::default());
    driver.put_resource("default", "ConfigMap", "scenario-config", json!({"data": {}}));
    driver.set_exec("cat /home/suporte/1/contexts", "", 1);
    let (app, _) = make_app(vec![validation_scenario()], driver);

    let (status, body) = request(
        &app,
        "POST",
        "/api/v1/sessions",
        Some(json!({"scenarioId": "context-check"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = body["sessionId"].as_str().unwrap().to_string();
    wait_for_session_status(&app, &id, "running").await;

    let (status, tasks) =
        request(&app, "GET", &format!("/api/v1/sessions/{id}/tasks"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(tasks[0]["id"], "t1");
    assert_eq!(tasks[0]["status"], "pending");

    let (status, result) = request(
        &app,
        "POST",
        &format!("/api/v1/sessions/{id}/tasks/t1/validate"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["success"], false);
    let details = result["details"].as_array().unwrap();
    assert_eq!(details.len(), 2);
    assert_eq!(details[0]["ruleId"], "r1");
    assert_eq!(details[0]["passed"], true);
    assert_eq!(details[1]["ruleId"], "r2");
    assert_eq!(details[1]["passed"], false);
    assert_eq!(details[1]["message"], "file not found: /home/suporte/1/contexts");

    // the failed validation is written back to the task list
    let (_, tasks) =
        request(&app, "GET", &format!("/api/v1/sessions/{id}/tasks"), None).await;
    assert_eq!(tasks[0]["status"], "failed");
    assert!(tasks[0]["lastValidationResult"]["details"].is_array());

    // unknown task id
    let (status, _) = request(
        &app,
        "POST",
        &format!("/api/v1/sessions/{id}/tasks/t99/validate"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test(start_paused = true)]
async fn test_extend_session_moves_expiry() {
    let (app, _) = make_app(vec![], Arc::new(FakeDriver::default()));
    let (_, body) =
        request(&app, "POST", "/api/v1/sessions", Some(json!({"scenarioId": ""}))).await;
    let id = body["sessionId"].as_str().unwrap().to_string();

    let (_, before) = request(&app, "GET", &format!("/api/v1/sessions/{id}"), None).await;
    let (status, after) = request(
        &app,
        "PUT",
        &format!("/api/v1/sessions/{id}/extend"),
        Some(json!({"minutes": 120})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(
        after["expirationTime"].as_str().unwrap() > before["expirationTime"].as_str().unwrap()
    );

    let (status, _) = request(
        &app,
        "PUT",
        "/api/v1/sessions/ffffffff/extend",
        Some(json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test(start_paused = true)]
async fn test_scenario_catalog_endpoints() {
    let (app, _) = make_app(vec![validation_scenario()], Arc::new(FakeDriver::default()));

    let (status, body) = request(&app, "GET", "/api/v1/scenarios", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["id"], "context-check");
    assert_eq!(body[0]["taskCount"], 1);

    let (status, body) = request(&app, "GET", "/api/v1/scenarios/context-check", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tasks"][0]["id"], "t1");

    let (status, _) = request(&app, "GET", "/api/v1/scenarios/ghost", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = request(&app, "GET", "/api/v1/scenarios/categories", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!(["cluster-setup"]));
}

#[tokio::test(start_paused = true)]
async fn test_admin_bootstrap_fills_pool() {
    let (app, pool) = make_app(vec![], Arc::new(FakeDriver::default()));

    let (status, _) = request(&app, "POST", "/api/v1/admin/bootstrap-pool", None).await;
    assert_eq!(status, StatusCode::OK);

    let mut filled = false;
    for _ in 0..600 {
        if pool.status().await.available == POOL_SIZE {
            filled = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(filled, "pool never became available");

    let (status, body) = request(&app, "GET", "/api/v1/admin/pool-status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["available"], POOL_SIZE);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_route_is_404() {
    let (app, _) = make_app(vec![], Arc::new(FakeDriver::default()));
    let (status, _) = request(&app, "GET", "/api/v1/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
