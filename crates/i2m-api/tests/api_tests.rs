//! API integration tests.
//!
//! Redis points at a closed port, so these only cover paths that are decided
//! before any store access.

use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

use i2m_api::{create_router, ApiConfig, AppState};
use i2m_storage::{FileStorage, StorageConfig};
use i2m_store::QueueConfig;

const USER_KEY: &str = "user-test-key";
const ADMIN_KEY: &str = "admin-test-key";
const BOUNDARY: &str = "i2m-test-boundary";

fn test_config() -> ApiConfig {
    ApiConfig {
        redis_url: "redis://127.0.0.1:1/".to_string(),
        api_key: Some(USER_KEY.to_string()),
        admin_api_key: Some(ADMIN_KEY.to_string()),
        ..ApiConfig::default()
    }
}

fn create_test_router(config: ApiConfig) -> (Router, TempDir) {
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

fn bearer(key: &str) -> String {
    format!("Bearer {}", key)
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

/// Multipart body with one part per `(name, filename, content_type, bytes)`.
fn multipart_body(parts: &[(&str, Option<&str>, Option<&str>, &[u8])]) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, filename, content_type, bytes) in parts {
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        match filename {
            Some(filename) => body.extend_from_slice(
                format!(
                    "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
                    name, filename
                )
                .as_bytes(),
            ),
            None => body.extend_from_slice(
                format!("Content-Disposition: form-data; name=\"{}\"\r\n", name).as_bytes(),
            ),
        }
        if let Some(content_type) = content_type {
            body.extend_from_slice(format!("Content-Type: {}\r\n", content_type).as_bytes());
        }
        body.extend_from_slice(b"\r\n");
        body.extend_from_slice(bytes);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
    body
}

fn upload_request(uri: &str, body: Vec<u8>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::AUTHORIZATION, bearer(USER_KEY))
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(Body::from(body))
        .unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let (app, _dir) = create_test_router(test_config());

    for uri in ["/health", "/api/v1/health"] {
        let response = app
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK, "{}", uri);
        let body = json_body(response).await;
        assert_eq!(body["status"], "healthy");
    }
}

#[tokio::test]
async fn test_security_headers_present() {
    let (app, _dir) = create_test_router(test_config());

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    let headers = response.headers();
    assert_eq!(headers["X-Content-Type-Options"], "nosniff");
    assert_eq!(headers["X-Frame-Options"], "DENY");
    assert!(headers.contains_key("X-Request-ID"));
}

#[tokio::test]
async fn test_missing_api_key_is_unauthorized() {
    let (app, _dir) = create_test_router(test_config());

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/session/jobs")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = json_body(response).await;
    assert_eq!(body["code"], "UNAUTHORIZED");
}

#[tokio::test]
async fn test_invalid_api_key_is_unauthorized() {
    let (app, _dir) = create_test_router(test_config());

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/status/tasks/job-12345678")
                .header(header::AUTHORIZATION, bearer("wrong-key"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_admin_routes_reject_user_key() {
    let (app, _dir) = create_test_router(test_config());

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/admin/jobs")
                .header(header::AUTHORIZATION, bearer(USER_KEY))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_admin_routes_disabled_without_admin_key() {
    let config = ApiConfig {
        admin_api_key: None,
        ..test_config()
    };
    let (app, _dir) = create_test_router(config);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/admin/system/info")
                .header(header::AUTHORIZATION, bearer(ADMIN_KEY))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_admin_cleanup_validates_and_runs() {
    let (app, _dir) = create_test_router(test_config());

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/admin/cleanup?max_age_hours=0")
                .header(header::AUTHORIZATION, bearer(ADMIN_KEY))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["code"], "VALIDATION_ERROR");

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/admin/cleanup")
                .header(header::AUTHORIZATION, bearer(ADMIN_KEY))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["removed_directories"], 0);
    assert_eq!(body["max_age_hours"], 24);
}

#[tokio::test]
async fn test_invalid_job_id_is_bad_request() {
    let (app, _dir) = create_test_router(test_config());

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/status/tasks/not_a_valid_id!")
                .header(header::AUTHORIZATION, bearer(USER_KEY))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_invalid_session_header_is_bad_request() {
    let (app, _dir) = create_test_router(test_config());

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/session/jobs")
                .header(header::AUTHORIZATION, bearer(USER_KEY))
                .header("X-Session-ID", "bad session")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_upload_rejects_non_image_bytes() {
    let (app, _dir) = create_test_router(test_config());

    let body = multipart_body(&[(
        "file",
        Some("photo.png"),
        Some("image/png"),
        b"this is plainly not a png file",
    )]);
    let response = app
        .oneshot(upload_request("/api/v1/upload/image", body))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
}

#[tokio::test]
async fn test_upload_without_file_is_bad_request() {
    let (app, _dir) = create_test_router(test_config());

    let body = multipart_body(&[("texture", None, None, b"true")]);
    let response = app
        .oneshot(upload_request("/api/v1/upload/batch", body))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_upload_rejects_invalid_option() {
    let (app, _dir) = create_test_router(test_config());

    let body = multipart_body(&[("texture_quality", None, None, b"ultra")]);
    let response = app
        .oneshot(upload_request("/api/v1/upload/image", body))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["code"], "VALIDATION_ERROR");
}

/// Upload request arriving over a connection from `peer`.
fn upload_from(peer: &str, forwarded_for: Option<&str>) -> Request<Body> {
    let body = multipart_body(&[("texture", None, None, b"true")]);
    let mut request = upload_request("/api/v1/upload/image", body);
    if let Some(forwarded_for) = forwarded_for {
        request
            .headers_mut()
            .insert("X-Forwarded-For", forwarded_for.parse().unwrap());
    }
    let addr: SocketAddr = format!("{}:51000", peer).parse().unwrap();
    request.extensions_mut().insert(ConnectInfo(addr));
    request
}

#[tokio::test]
async fn test_upload_rate_limit() {
    let config = ApiConfig {
        upload_rate_limit_per_minute: 2,
        ..test_config()
    };
    let (app, _dir) = create_test_router(config);

    let first = app.clone().oneshot(upload_from("203.0.113.7", None)).await.unwrap();
    assert_ne!(first.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(first.headers()["X-RateLimit-Limit"], "2");
    assert_eq!(first.headers()["X-RateLimit-Remaining"], "1");

    let second = app.clone().oneshot(upload_from("203.0.113.7", None)).await.unwrap();
    assert_ne!(second.status(), StatusCode::TOO_MANY_REQUESTS);

    let third = app.clone().oneshot(upload_from("203.0.113.7", None)).await.unwrap();
    assert_eq!(third.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(third.headers()["X-RateLimit-Remaining"], "0");
    assert!(third.headers().contains_key("Retry-After"));
    let body = json_body(third).await;
    assert_eq!(body["code"], "RATE_LIMITED");
}

#[tokio::test]
async fn test_forwarded_for_from_untrusted_peer_does_not_reset_limit() {
    let config = ApiConfig {
        upload_rate_limit_per_minute: 1,
        ..test_config()
    };
    let (app, _dir) = create_test_router(config);

    let mut limited = 0;
    for i in 0..20 {
        let spoofed = format!("203.0.113.{}", i + 1);
        let response = app
            .clone()
            .oneshot(upload_from("198.51.100.9", Some(&spoofed)))
            .await
            .unwrap();
        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            limited += 1;
        }
    }

    assert_eq!(limited, 19);
}

#[tokio::test]
async fn test_forwarded_for_from_trusted_proxy_keys_on_client() {
    let config = ApiConfig {
        upload_rate_limit_per_minute: 1,
        trusted_proxies: vec!["10.0.0.1".parse().unwrap()],
        ..test_config()
    };
    let (app, _dir) = create_test_router(config);

    let first = app
        .clone()
        .oneshot(upload_from("10.0.0.1", Some("203.0.113.7")))
        .await
        .unwrap();
    assert_ne!(first.status(), StatusCode::TOO_MANY_REQUESTS);

    let other_client = app
        .clone()
        .oneshot(upload_from("10.0.0.1", Some("203.0.113.8")))
        .await
        .unwrap();
    assert_ne!(other_client.status(), StatusCode::TOO_MANY_REQUESTS);

    let repeat = app
        .clone()
        .oneshot(upload_from("10.0.0.1", Some("203.0.113.7")))
        .await
        .unwrap();
    assert_eq!(repeat.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_unknown_route_is_not_found() {
    let (app, _dir) = create_test_router(test_config());

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/nope")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
