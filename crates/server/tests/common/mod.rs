//! Common test utilities for E2E testing with mocks.
//!
//! This module provides a test fixture that creates an in-process server
//! with mock stage adapters injected, enabling full job lifecycles without
//! dcm2niix, TotalSpineSeg, itkimage2segimage or a PACS.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

use worklist_core::{
    testing::{mock_adapter_set, MockAdapter},
    JobControl, JobOrchestrator, JobStore, RetryManager, Scheduler, SqliteJobStore,
    ValidationGate,
};

/// Re-export fixtures for test convenience
pub use worklist_core::testing::fixtures;

/// Test fixture for E2E testing with mock dependencies.
///
/// # Example
///
/// ```rust,ignore
/// #[tokio::test]
/// async fn test_job_submission() {
///     let fixture = TestFixture::new().await;
///
///     let response = fixture.post("/api/v1/job", json!({
///         "study_reference": "1.2.3"
///     })).await;
///
///     assert_eq!(response.status, 201);
/// }
/// ```
pub struct TestFixture {
    /// The Axum router for testing
    pub router: Router,
    /// Mock adapters in stage order: preprocess, infer, postprocess, store
    pub adapters: [Arc<MockAdapter>; 4],
    pub store: Arc<SqliteJobStore>,
    pub scheduler: Option<Arc<Scheduler>>,
    /// Temporary directory for test database and work files
    pub temp_dir: TempDir,
}

/// Options for building a fixture.
#[derive(Debug, Clone)]
pub struct TestConfig {
    /// Run jobs through a scheduler with mock adapters.
    pub enable_scheduler: bool,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            enable_scheduler: true,
        }
    }
}

/// Response from a test request
#[derive(Debug)]
pub struct TestResponse {
    pub status: StatusCode,
    pub body: Value,
}

impl TestFixture {
    /// Create a new test fixture with a running scheduler.
    pub async fn new() -> Self {
        Self::with_config(TestConfig::default()).await
    }

    /// Create a test fixture with custom configuration.
    pub async fn with_config(test_config: TestConfig) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let mut config = fixtures::harness_config(temp_dir.path());
        config.scheduler.enabled = test_config.enable_scheduler;

        let store = Arc::new(
            SqliteJobStore::new(&config.database.path).expect("Failed to create job store"),
        );
        let adapters = MockAdapter::for_all_stages();

        let mut control = JobControl::new(store.clone() as Arc<dyn JobStore>);
        let scheduler = if test_config.enable_scheduler {
            let orchestrator = JobOrchestrator::new(
                store.clone(),
                mock_adapter_set(&adapters),
                ValidationGate::new(config.validation.clone()),
                RetryManager::new(config.retry.clone()),
                config.pipeline.clone(),
            )
            .with_cancel_check_interval(config.scheduler.cancel_check_interval());

            let scheduler = Arc::new(Scheduler::new(
                config.scheduler.clone(),
                Arc::new(orchestrator),
            ));
            scheduler.start();
            control = control.with_scheduler(scheduler.clone());
            Some(scheduler)
        } else {
            None
        };

        let state = Arc::new(worklist_server::state::AppState::new(config, control));
        let router = worklist_server::api::create_router(state);

        Self {
            router,
            adapters,
            store,
            scheduler,
            temp_dir,
        }
    }

    /// Mock adapter of the inference stage.
    pub fn infer(&self) -> &Arc<MockAdapter> {
        &self.adapters[1]
    }

    /// Send a GET request to the test server.
    pub async fn get(&self, path: &str) -> TestResponse {
        self.request("GET", path, None).await
    }

    /// Send a POST request with JSON body.
    pub async fn post(&self, path: &str, body: Value) -> TestResponse {
        self.request("POST", path, Some(body)).await
    }

    /// Send a POST request without a body.
    pub async fn post_empty(&self, path: &str) -> TestResponse {
        self.request("POST", path, None).await
    }

    /// Send a GET request and return the raw text body.
    pub async fn get_text(&self, path: &str) -> (StatusCode, String) {
        let request = Request::builder()
            .method("GET")
            .uri(path)
            .body(Body::empty())
            .unwrap();

        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("Failed to send request");

        let status = response.status();
        let body_bytes = response
            .into_body()
            .collect()
            .await
            .expect("Failed to collect body")
            .to_bytes();
        (status, String::from_utf8_lossy(&body_bytes).into_owned())
    }

    /// Submit a job and return its id.
    pub async fn submit(&self, study_reference: &str) -> String {
        let response = self
            .post(
                "/api/v1/job",
                serde_json::json!({ "study_reference": study_reference }),
            )
            .await;
        assert_eq!(response.status, StatusCode::CREATED, "{:?}", response.body);
        response.body["job_id"]
            .as_str()
            .expect("job_id in response")
            .to_string()
    }

    /// Poll the API until the job reaches `status` or the timeout elapses.
    pub async fn wait_for_status(&self, job_id: &str, status: &str, timeout: Duration) -> Value {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let response = self.get(&format!("/api/v1/job/{}", job_id)).await;
            if response.body["status"] == status {
                return response.body;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!(
                    "job {} did not reach {} within {:?}, last: {}",
                    job_id, status, timeout, response.body["status"]
                );
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Stop the scheduler, if any.
    pub async fn shutdown(&self) {
        if let Some(scheduler) = &self.scheduler {
            scheduler.stop().await;
        }
    }

    /// Send a request to the test server.
    async fn request(&self, method: &str, path: &str, body: Option<Value>) -> TestResponse {
        let mut request_builder = Request::builder().method(method).uri(path);

        let body = match body {
            Some(json) => {
                request_builder = request_builder.header("Content-Type", "application/json");
                Body::from(serde_json::to_string(&json).unwrap())
            }
            None => Body::empty(),
        };

        let request = request_builder.body(body).unwrap();

        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("Failed to send request");

        let status = response.status();
        let body_bytes = response
            .into_body()
            .collect()
            .await
            .expect("Failed to collect body")
            .to_bytes();

        let body: Value = if body_bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body_bytes).unwrap_or(Value::Null)
        };

        TestResponse { status, body }
    }
}
