//! API tests against a live Redis.

use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use tempfile::TempDir;
use tower::ServiceExt;

use i2m_api::{create_router, ApiConfig, AppState};
use i2m_models::{
    FileEntry, FileId, FileProgress, FileStatus, GenerationOptions, Job, JobStatus, SessionId,
    StreamEvent,
};
use i2m_storage::{FileStorage, StorageConfig};
use i2m_store::{JobStore, ProgressStore, QueueConfig, SessionStore};

const USER_KEY: &str = "user-test-key";
const ADMIN_KEY: &str = "admin-test-key";

fn redis_url() -> String {
    dotenvy::dotenv().ok();
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string())
}

fn create_test_router() -> (Router, TempDir) {
    let config = ApiConfig {
        redis_url: redis_url(),
        api_key: Some(USER_KEY.to_string()),
        admin_api_key: Some(ADMIN_KEY.to_string()),
        // Only pub/sub delivers events in these tests
        sse_poll_interval: Duration::from_secs(60),
        ..ApiConfig::default()
    };
    let dir = TempDir::new().unwrap();
    let storage = FileStorage::new(StorageConfig {
        upload_dir: dir.path().join("uploads"),
        output_dir: dir.path().join("results"),
    });
    let queue_config = QueueConfig {
        redis_url: config.redis_url.clone(),
        ..QueueConfig::default()
    };
    let state = AppState::from_parts(config, queue_config, storage).unwrap();
    (create_router(state, None), dir)
}

async fn create_job(session_id: &SessionId) -> Job {
    let url = redis_url();
    let file_id = FileId::new();
    let job = Job::new(
        Some(session_id.clone()),
        vec![FileEntry {
            stored_name: format!("{}.png", file_id),
            file_id,
            filename: "chair.png".to_string(),
            content_type: "image/png".to_string(),
            size_bytes: 1024,
        }],
        GenerationOptions::default(),
    );
    JobStore::new(&url).unwrap().create_job(&job).await.unwrap();
    ProgressStore::new(&url).unwrap().init(&job).await.unwrap();
    SessionStore::new(&url)
        .unwrap()
        .add_job(session_id, &job.job_id)
        .await
        .unwrap();
    job
}

/// Test a stream opens with a snapshot, forwards live events and closes after
/// the terminal one.
#[tokio::test]
#[ignore = "requires Redis"]
async fn test_stream_snapshot_then_terminal_close() {
    let (app, _dir) = create_test_router();
    let session_id = SessionId::new();
    let job = create_job(&session_id).await;
    let progress = ProgressStore::new(&redis_url()).unwrap();

    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/api/v1/status/tasks/{}/stream", job.job_id))
                .header(header::AUTHORIZATION, format!("Bearer {}", USER_KEY))
                .header("X-Session-ID", session_id.as_str())
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let mut body = response.into_body();
    let mut text = String::new();
    while !text.contains("event: snapshot") {
        let frame = tokio::time::timeout(Duration::from_secs(5), body.frame())
            .await
            .expect("Timed out waiting for the snapshot")
            .expect("Stream ended before the snapshot")
            .unwrap();
        if let Ok(data) = frame.into_data() {
            text.push_str(&String::from_utf8_lossy(&data));
        }
    }

    let file = &job.files[0];
    let update = FileProgress::pending(file.file_id.clone(), file.filename.clone())
        .with_status(FileStatus::Processing, 40);
    let seq = progress.update_file(&job.job_id, &update).await.unwrap();
    progress
        .publish(
            &job.job_id,
            &StreamEvent::FileProgress {
                seq,
                job_id: job.job_id.clone(),
                file: update,
                overall_progress: 40,
            },
        )
        .await
        .unwrap();

    let final_seq = progress
        .set_status(&job.job_id, JobStatus::Completed)
        .await
        .unwrap();
    progress
        .publish(
            &job.job_id,
            &StreamEvent::task_completed(job.job_id.clone(), 1, 1, 0).with_seq(final_seq),
        )
        .await
        .unwrap();

    // The body only completes once the stream has closed
    let rest = tokio::time::timeout(Duration::from_secs(10), body.collect())
        .await
        .expect("Stream did not close after the terminal event")
        .unwrap()
        .to_bytes();
    text.push_str(&String::from_utf8_lossy(&rest));

    let snapshot_at = text.find("event: snapshot").unwrap();
    let progress_at = text.find("event: file_progress").expect("No file_progress event");
    let completed_at = text.find("event: task_completed").expect("No task_completed event");
    assert!(snapshot_at < progress_at && progress_at < completed_at);
    assert!(text.contains(&format!("id: {}", final_seq)));

    JobStore::new(&redis_url())
        .unwrap()
        .delete_job(&job.job_id)
        .await
        .unwrap();
}

/// Test deleting a job also drops it from its owner's session.
#[tokio::test]
#[ignore = "requires Redis"]
async fn test_admin_delete_removes_job_from_session() {
    let (app, _dir) = create_test_router();
    let session_id = SessionId::new();
    let job = create_job(&session_id).await;
    let kept = create_job(&session_id).await;
    let sessions = SessionStore::new(&redis_url()).unwrap();

    let response = app
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/v1/admin/jobs/{}", job.job_id))
                .header(header::AUTHORIZATION, format!("Bearer {}", ADMIN_KEY))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let session = sessions
        .get(&session_id)
        .await
        .unwrap()
        .expect("Session missing");
    assert_eq!(session.job_ids, vec![kept.job_id.clone()]);

    JobStore::new(&redis_url())
        .unwrap()
        .delete_job(&kept.job_id)
        .await
        .unwrap();
}
