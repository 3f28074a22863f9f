use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{Value, json};

use fieldsync::config::Config;
use fieldsync::procedures::{Procedure, ProcedureError, ProcedureRegistry};
use fieldsync::retry::RetryPolicy;
use fieldsync::state::{AppState, SharedState};
use fieldsync::store::{MemoryStore, OperationStore};

/// Succeeds with the payload it was given. Rejects payloads without an `id`.
pub struct EchoProcedure;

#[async_trait]
impl Procedure for EchoProcedure {
    fn name(&self) -> &str {
        "records.echo"
    }

    fn validate(&self, payload: &Value) -> Result<(), ProcedureError> {
        if payload.get("id").is_none() {
            return Err(ProcedureError::from("id is required"));
        }
        Ok(())
    }

    async fn execute(&self, payload: &Value) -> Result<Value, ProcedureError> {
        Ok(json!({ "echo": payload }))
    }
}

/// Fails the first `failures` calls, then succeeds.
pub struct FlakyProcedure {
    pub failures: AtomicU32,
    pub calls: AtomicU32,
}

impl FlakyProcedure {
    pub fn new(failures: u32) -> Self {
        Self {
            failures: AtomicU32::new(failures),
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl Procedure for FlakyProcedure {
    fn name(&self) -> &str {
        "records.flaky"
    }

    async fn execute(&self, _payload: &Value) -> Result<Value, ProcedureError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let left = self.failures.load(Ordering::SeqCst);
        if left > 0 {
            self.failures.store(left - 1, Ordering::SeqCst);
            return Err(ProcedureError::from("storage unavailable"));
        }
        Ok(json!({ "stored": true }))
    }
}

pub struct BrokenProcedure;

#[async_trait]
impl Procedure for BrokenProcedure {
    fn name(&self) -> &str {
        "records.broken"
    }

    async fn execute(&self, _payload: &Value) -> Result<Value, ProcedureError> {
        Err(ProcedureError::from("constraint violation"))
    }
}

/// A running test server backed by the in-memory store.
pub struct TestApp {
    pub addr: SocketAddr,
    pub client: Client,
    pub state: SharedState,
    pub flaky: Arc<FlakyProcedure>,
}

impl TestApp {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub async fn get(&self, path: &str) -> (Value, StatusCode) {
        let resp = self
            .client
            .get(self.url(path))
            .send()
            .await
            .expect("get request failed");
        let status = resp.status();
        let body: Value = resp.json().await.unwrap_or(json!(null));
        (body, status)
    }

    pub async fn post(&self, path: &str, body: &Value) -> (Value, StatusCode) {
        let resp = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .expect("post request failed");
        let status = resp.status();
        let body: Value = resp.json().await.unwrap_or(json!(null));
        (body, status)
    }

    /// Submit a bulk operation, return its JSON.
    pub async fn submit_operation(&self, procedure: &str, items: Value) -> Value {
        let (body, status) = self
            .post("/api/v1/operations", &json!({ "procedure": procedure, "items": items }))
            .await;
        assert_eq!(status, StatusCode::OK, "submit operation failed: {body}");
        body
    }

    /// Run worker iterations until nothing is left to claim.
    pub async fn run_worker(&self) -> usize {
        let mut processed = 0;
        while fieldsync::worker::process_next(&self.state)
            .await
            .expect("worker iteration failed")
        {
            processed += 1;
        }
        processed
    }
}

pub fn test_config(retry: RetryPolicy) -> Config {
    Config {
        database_url: String::new(),
        host: "127.0.0.1".parse().unwrap(),
        port: 0, // unused, we bind to random port
        log_level: "warn".to_string(),
        max_body_size: 1_048_576,
        worker_count: 1,
        poll_interval: Duration::from_millis(50),
        procedure_timeout: Duration::from_secs(5),
        retry,
        procedure_routes: vec![],
    }
}

/// Retries become due immediately so a test can drive them with `run_worker`.
pub fn instant_retries() -> RetryPolicy {
    RetryPolicy::new(3, 0, 2.0, 300_000)
}

pub async fn spawn_app() -> TestApp {
    spawn_app_with(instant_retries(), 1).await
}

pub async fn spawn_app_with(retry: RetryPolicy, flaky_failures: u32) -> TestApp {
    spawn_app_on(Arc::new(MemoryStore::new()), retry, flaky_failures).await
}

pub async fn spawn_app_on(
    store: Arc<dyn OperationStore>,
    retry: RetryPolicy,
    flaky_failures: u32,
) -> TestApp {
    let flaky = Arc::new(FlakyProcedure::new(flaky_failures));

    let mut procedures = ProcedureRegistry::new();
    procedures.register(Arc::new(EchoProcedure));
    procedures.register(flaky.clone());
    procedures.register(Arc::new(BrokenProcedure));

    let state = AppState::new(store, test_config(retry), procedures);
    let app = fieldsync::build_app(state.clone());

    // Bind to random port
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind to random port");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("Server failed");
    });

    TestApp {
        addr,
        client: Client::new(),
        state,
        flaky,
    }
}
