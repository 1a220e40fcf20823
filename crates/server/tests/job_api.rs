//! Job API tests against an in-process router with mock stage adapters.

mod common;

use std::time::Duration;

use axum::http::StatusCode;
use serde_json::json;

use common::{TestConfig, TestFixture};
use worklist_core::testing::{MockFailure, MockStep};
use worklist_core::{JobStatus, JobStore};

const PIPELINE_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn test_health() {
    let fixture = TestFixture::new().await;
    let response = fixture.get("/api/v1/health").await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["status"], "ok");
    fixture.shutdown().await;
}

#[tokio::test]
async fn test_config_shows_effective_values() {
    let fixture = TestFixture::new().await;
    let response = fixture.get("/api/v1/config").await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["scheduler"]["accelerator_slots"], 1);
    assert_eq!(response.body["scheduler"]["poll_interval_ms"], 50);
    assert!(response.body["pacs"]["called_ae"].is_string());
    fixture.shutdown().await;
}

#[tokio::test]
async fn test_submit_runs_to_completion() {
    let fixture = TestFixture::new().await;
    let job_id = fixture.submit("1.2.840.113619.2.55").await;

    let job = fixture
        .wait_for_status(&job_id, "complete", PIPELINE_TIMEOUT)
        .await;
    assert_eq!(job["study_reference"], "1.2.840.113619.2.55");
    assert_eq!(job["delivery"]["destination"], "MOCKPACS@localhost:11112");

    let artifacts = job["artifacts"].as_array().unwrap();
    let types: Vec<&str> = artifacts
        .iter()
        .map(|a| a["artifact_type"].as_str().unwrap())
        .collect();
    assert_eq!(types, vec!["nifti", "segmentation", "seg"]);

    let events: Vec<&str> = job["audit_log"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["event"].as_str().unwrap())
        .collect();
    assert_eq!(events.first(), Some(&"received"));
    assert_eq!(events.last(), Some(&"completed"));

    fixture.shutdown().await;
}

#[tokio::test]
async fn test_submit_rejects_bad_reference() {
    let fixture = TestFixture::new().await;

    let response = fixture
        .post("/api/v1/job", json!({ "study_reference": "../../etc" }))
        .await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert!(response.body["error"]
        .as_str()
        .unwrap()
        .contains("study_reference"));

    fixture.shutdown().await;
}

#[tokio::test]
async fn test_get_unknown_job() {
    let fixture = TestFixture::new().await;
    let response = fixture.get("/api/v1/job/does-not-exist").await;
    assert_eq!(response.status, StatusCode::NOT_FOUND);
    assert!(response.body["error"].is_string());
    fixture.shutdown().await;
}

#[tokio::test]
async fn test_list_filters_and_pages() {
    let fixture = TestFixture::with_config(TestConfig {
        enable_scheduler: false,
    })
    .await;

    for i in 0..3 {
        fixture.submit(&format!("study-{}", i)).await;
    }

    let response = fixture.get("/api/v1/jobs?limit=2").await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["jobs"].as_array().unwrap().len(), 2);
    assert_eq!(response.body["total"], 3);
    assert_eq!(response.body["limit"], 2);
    assert_eq!(response.body["offset"], 0);

    let response = fixture.get("/api/v1/jobs?status=received").await;
    assert_eq!(response.body["total"], 3);

    let response = fixture.get("/api/v1/jobs?status=failed").await;
    assert_eq!(response.body["total"], 0);

    let response = fixture.get("/api/v1/jobs?status=bogus").await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);

    let response = fixture.get("/api/v1/jobs?since=yesterday").await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);

    let response = fixture
        .get("/api/v1/jobs?since=2000-01-01T00:00:00Z")
        .await;
    assert_eq!(response.body["total"], 3);
}

#[tokio::test]
async fn test_cancel_running_job() {
    let fixture = TestFixture::new().await;
    fixture.infer().push_steps([MockStep::Hang]).await;

    let job_id = fixture.submit("1.2.3").await;
    fixture
        .wait_for_status(&job_id, "inferring", PIPELINE_TIMEOUT)
        .await;

    let response = fixture
        .post_empty(&format!("/api/v1/job/{}/cancel", job_id))
        .await;
    assert_eq!(response.status, StatusCode::ACCEPTED);
    assert_eq!(response.body["cancel_requested"], true);

    let job = fixture
        .wait_for_status(&job_id, "cancelled", PIPELINE_TIMEOUT)
        .await;
    let events: Vec<&str> = job["audit_log"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["event"].as_str().unwrap())
        .collect();
    assert!(events.contains(&"cancel_requested"));
    assert_eq!(events.last(), Some(&"cancelled"));

    // Terminal jobs cannot be cancelled again
    let response = fixture
        .post_empty(&format!("/api/v1/job/{}/cancel", job_id))
        .await;
    assert_eq!(response.status, StatusCode::CONFLICT);

    fixture.shutdown().await;
}

#[tokio::test]
async fn test_resubmit_failed_job() {
    let fixture = TestFixture::new().await;
    // Inference allows two attempts by default
    fixture
        .infer()
        .push_steps([
            MockStep::Fail(MockFailure::ExitCode(2)),
            MockStep::Fail(MockFailure::ExitCode(2)),
        ])
        .await;

    let job_id = fixture.submit("1.2.3").await;
    let failed = fixture
        .wait_for_status(&job_id, "failed", PIPELINE_TIMEOUT)
        .await;
    assert_eq!(failed["error_info"]["kind"], "external_tool");

    // Only failed jobs can be resubmitted
    let other = fixture.submit("1.2.4").await;
    fixture
        .wait_for_status(&other, "complete", PIPELINE_TIMEOUT)
        .await;
    let response = fixture
        .post_empty(&format!("/api/v1/job/{}/resubmit", other))
        .await;
    assert_eq!(response.status, StatusCode::CONFLICT);

    let response = fixture
        .post_empty(&format!("/api/v1/job/{}/resubmit", job_id))
        .await;
    assert_eq!(response.status, StatusCode::CREATED);
    assert_eq!(response.body["resubmitted_from"], job_id.as_str());
    let fresh = response.body["job_id"].as_str().unwrap().to_string();
    assert_ne!(fresh, job_id);

    fixture
        .wait_for_status(&fresh, "complete", PIPELINE_TIMEOUT)
        .await;

    // The failed job is left as it was
    let original = fixture.store.get(&job_id).unwrap().unwrap();
    assert_eq!(original.status, JobStatus::Failed);

    fixture.shutdown().await;
}

#[tokio::test]
async fn test_annotate_terminal_job() {
    let fixture = TestFixture::new().await;
    let job_id = fixture.submit("1.2.3").await;
    fixture
        .wait_for_status(&job_id, "complete", PIPELINE_TIMEOUT)
        .await;

    let response = fixture
        .post(
            &format!("/api/v1/job/{}/annotations", job_id),
            json!({ "note": "reviewed by on-call radiologist" }),
        )
        .await;
    assert_eq!(response.status, StatusCode::CREATED);
    assert_eq!(response.body["event"], "annotation");
    assert_eq!(response.body["detail"], "reviewed by on-call radiologist");
    assert_eq!(response.body["status"], "complete");

    let response = fixture
        .post(
            &format!("/api/v1/job/{}/annotations", job_id),
            json!({ "note": "" }),
        )
        .await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);

    fixture.shutdown().await;
}

#[tokio::test]
async fn test_artifacts_endpoint() {
    let fixture = TestFixture::new().await;
    let job_id = fixture.submit("1.2.3").await;
    fixture
        .wait_for_status(&job_id, "complete", PIPELINE_TIMEOUT)
        .await;

    let response = fixture
        .get(&format!("/api/v1/job/{}/artifacts", job_id))
        .await;
    assert_eq!(response.status, StatusCode::OK);
    let artifacts = response.body.as_array().unwrap();
    assert_eq!(artifacts.len(), 3);
    assert!(artifacts
        .iter()
        .all(|a| a["location"].as_str().unwrap().starts_with("file://")));

    fixture.shutdown().await;
}

#[tokio::test]
async fn test_scheduler_status() {
    let fixture = TestFixture::new().await;
    let response = fixture.get("/api/v1/scheduler/status").await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["available"], true);
    assert_eq!(response.body["running"], true);
    assert_eq!(response.body["workers"], 4);
    assert_eq!(response.body["pools"][0]["name"], "accelerator");
    assert_eq!(response.body["pools"][0]["capacity"], 1);
    fixture.shutdown().await;

    let fixture = TestFixture::with_config(TestConfig {
        enable_scheduler: false,
    })
    .await;
    let response = fixture.get("/api/v1/scheduler/status").await;
    assert_eq!(response.body["available"], false);
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let fixture = TestFixture::new().await;
    fixture.get("/api/v1/health").await;

    let (status, body) = fixture.get_text("/metrics").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("worklist_http_requests_total"));
    assert!(body.contains("worklist_jobs_by_status"));

    fixture.shutdown().await;
}
