//! API integration tests.
//!
//! Tests the complete request flow: HTTP → routes → orchestrator → store,
//! with a scripted spawner standing in for the machine API.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::http::{Method, Request, StatusCode, header};
use tower::ServiceExt;

use platen_api::config::{Config, CorsConfig};
use platen_api::server::{Server, ServerBuilder};
use platen_core::BatchId;
use platen_core::id::task_id;
use platen_flow::spawner::{MachineSpawner, MockSpawner};

fn test_server() -> (Server, Arc<MockSpawner>) {
    let spawner = Arc::new(MockSpawner::new());
    let server = ServerBuilder::new()
        .debug(true)
        .spawner(Arc::clone(&spawner) as Arc<dyn MachineSpawner>)
        .build()
        .expect("build server");
    (server, spawner)
}

fn test_server_with_cors(allowed_origins: Vec<String>) -> Server {
    let config = Config {
        debug: true,
        cors: CorsConfig {
            allowed_origins,
            max_age_seconds: 3600,
        },
        ..Config::default()
    };
    ServerBuilder::new()
        .config(config)
        .spawner(Arc::new(MockSpawner::new()) as Arc<dyn MachineSpawner>)
        .build()
        .expect("build server")
}

fn batch_message(batch_id: &str, files: &[&str]) -> serde_json::Value {
    let entries: Vec<_> = files
        .iter()
        .map(|name| {
            serde_json::json!({
                "r2_key": format!("staging/{batch_id}/{name}"),
                "file_name": name,
                "file_size": 10,
                "content_type": "image/tiff",
            })
        })
        .collect();

    serde_json::json!({
        "batch_id": batch_id,
        "r2_prefix": format!("staging/{batch_id}"),
        "directories": [{ "directory_path": "box-1", "files": entries }],
    })
}

fn tiff_task_id(batch_id: &str, file: &str) -> String {
    let batch = BatchId::new(batch_id).unwrap();
    task_id(
        &batch,
        "TIFF_CONVERSION",
        &format!("staging/{batch_id}/{file}"),
    )
}

async fn wait_for_spawns(spawner: &MockSpawner, count: usize) {
    for _ in 0..500 {
        if spawner.spawn_count() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {count} spawns");
}

mod helpers {
    use super::*;
    use serde::de::DeserializeOwned;

    pub fn make_request(
        method: Method,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> Result<Request<Body>> {
        let mut builder = Request::builder().method(method).uri(uri);
        if body.is_some() {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
        }

        let body = match body {
            Some(v) => Body::from(serde_json::to_vec(&v).context("serialize request body")?),
            None => Body::empty(),
        };
        builder.body(body).context("build request")
    }

    pub async fn send<T: DeserializeOwned>(
        router: axum::Router,
        request: Request<Body>,
    ) -> Result<(StatusCode, T)> {
        let response = router.oneshot(request).await.context("send request")?;
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .context("read response body")?;
        let value = serde_json::from_slice(&bytes)
            .with_context(|| format!("parse JSON body: {}", String::from_utf8_lossy(&bytes)))?;
        Ok((status, value))
    }

    pub async fn get_json(
        router: axum::Router,
        uri: &str,
    ) -> Result<(StatusCode, serde_json::Value)> {
        send(router, make_request(Method::GET, uri, None)?).await
    }

    pub async fn post_json(
        router: axum::Router,
        uri: &str,
        body: serde_json::Value,
    ) -> Result<(StatusCode, serde_json::Value)> {
        send(router, make_request(Method::POST, uri, Some(body))?).await
    }
}

use helpers::{get_json, make_request, post_json};

#[tokio::test]
async fn health_endpoint() -> Result<()> {
    let (server, _) = test_server();
    let (status, body) = get_json(server.test_router(), "/health").await?;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "platen-orchestrator");
    assert!(body["timestamp"].is_string());
    Ok(())
}

#[tokio::test]
async fn ready_endpoint() -> Result<()> {
    let (server, _) = test_server();
    let (status, body) = get_json(server.test_router(), "/ready").await?;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ready"], true);
    Ok(())
}

#[tokio::test]
async fn queue_to_done_flow() -> Result<()> {
    let (server, spawner) = test_server();

    let (status, body) = post_json(
        server.test_router(),
        "/queue/batch",
        batch_message("B1", &["a.tiff"]),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);

    wait_for_spawns(&spawner, 1).await;

    let (status, view) = get_json(server.test_router(), "/status/B1").await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["status"], "TIFF_CONVERSION");
    assert_eq!(view["tasks_total"], 1);

    let callback_task = tiff_task_id("B1", "a.tiff");
    let (status, body) = post_json(
        server.test_router(),
        &format!("/callback/B1/{callback_task}"),
        serde_json::json!({
            "task_id": callback_task,
            "batch_id": "B1",
            "status": "success",
            "output_r2_key": "staging/B1/a.jpg",
            "output_file_name": "a.jpg",
            "output_file_size": 5,
        }),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);

    let (status, view) = get_json(server.test_router(), "/status/B1").await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["status"], "DONE");
    assert_eq!(view["tasks_completed"], 1);
    assert_eq!(view["tasks_failed"], 0);
    assert!(view["completed_at"].is_string());
    Ok(())
}

#[tokio::test]
async fn duplicate_queue_delivery_is_idempotent() -> Result<()> {
    let (server, _) = test_server();

    let (status, _) = post_json(
        server.test_router(),
        "/queue/batch",
        batch_message("B2", &["a.tiff"]),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);

    // Redelivery with a different inventory still converges on a 200 and
    // does not rediscover.
    let (status, body) = post_json(
        server.test_router(),
        "/queue/batch",
        batch_message("B2", &["a.tiff", "b.tiff"]),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);

    let (_, view) = get_json(server.test_router(), "/status/B2").await?;
    assert_eq!(view["tasks_total"], 1);
    Ok(())
}

#[tokio::test]
async fn status_of_unknown_batch_is_404() -> Result<()> {
    let (server, _) = test_server();
    let (status, body) = get_json(server.test_router(), "/status/missing").await?;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");
    Ok(())
}

#[tokio::test]
async fn status_with_invalid_batch_id_is_400() -> Result<()> {
    let (server, _) = test_server();
    let (status, body) = get_json(server.test_router(), "/status/not%20a%20batch").await?;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "BAD_REQUEST");
    Ok(())
}

#[tokio::test]
async fn malformed_queue_message_is_400() -> Result<()> {
    let (server, _) = test_server();
    let (status, body) = post_json(
        server.test_router(),
        "/queue/batch",
        serde_json::json!({ "batch_id": "", "directories": [] }),
    )
    .await?;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "BAD_REQUEST");
    Ok(())
}

#[tokio::test]
async fn malformed_callback_is_400() -> Result<()> {
    let (server, _) = test_server();
    let request = make_request(Method::POST, "/callback/B3/task-1", None)?;
    let response = server.test_router().oneshot(request).await?;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn callback_for_unknown_batch_is_acknowledged() -> Result<()> {
    let (server, _) = test_server();
    let callback_task = tiff_task_id("ghost", "a.tiff");

    let (status, body) = post_json(
        server.test_router(),
        &format!("/callback/ghost/{callback_task}"),
        serde_json::json!({
            "task_id": callback_task,
            "batch_id": "ghost",
            "status": "success",
            "output_r2_key": "staging/ghost/a.jpg",
            "output_file_name": "a.jpg",
            "output_file_size": 5,
        }),
    )
    .await?;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
    Ok(())
}

#[tokio::test]
async fn admin_reset_unknown_batch_is_404() -> Result<()> {
    let (server, _) = test_server();
    let request = make_request(Method::POST, "/admin/reset/missing", None)?;
    let response = server.test_router().oneshot(request).await?;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn admin_reset_forces_error_and_absorbs_callbacks() -> Result<()> {
    let (server, spawner) = test_server();

    post_json(
        server.test_router(),
        "/queue/batch",
        batch_message("B4", &["a.tiff", "b.tiff"]),
    )
    .await?;
    wait_for_spawns(&spawner, 2).await;

    let (status, body) = post_json(
        server.test_router(),
        "/admin/reset/B4",
        serde_json::json!({}),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Batch reset");

    let (_, view) = get_json(server.test_router(), "/status/B4").await?;
    assert_eq!(view["status"], "ERROR");
    assert_eq!(view["error"], "reset by admin");

    // A late worker report is acknowledged but changes nothing.
    let callback_task = tiff_task_id("B4", "a.tiff");
    let (status, _) = post_json(
        server.test_router(),
        &format!("/callback/B4/{callback_task}"),
        serde_json::json!({
            "task_id": callback_task,
            "batch_id": "B4",
            "status": "success",
            "output_r2_key": "staging/B4/a.jpg",
            "output_file_name": "a.jpg",
            "output_file_size": 5,
        }),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);

    let (_, view) = get_json(server.test_router(), "/status/B4").await?;
    assert_eq!(view["status"], "ERROR");
    assert_eq!(view["tasks_completed"], 0);
    assert_eq!(view["tasks_failed"], 0);
    Ok(())
}

#[tokio::test]
async fn worker_error_surfaces_in_status_counts() -> Result<()> {
    let config = Config {
        debug: true,
        ..Config::default()
    };
    let spawner = Arc::new(MockSpawner::new());
    let server = ServerBuilder::new()
        .config(Config {
            orchestrator: platen_flow::config::OrchestratorConfig::default()
                .with_max_retry_attempts(1),
            ..config
        })
        .spawner(Arc::clone(&spawner) as Arc<dyn MachineSpawner>)
        .build()
        .expect("build server");

    post_json(
        server.test_router(),
        "/queue/batch",
        batch_message("B5", &["a.tiff"]),
    )
    .await?;
    wait_for_spawns(&spawner, 1).await;

    // With a budget of one, the first worker error fails the task and the
    // batch completes with a failure count.
    let callback_task = tiff_task_id("B5", "a.tiff");
    post_json(
        server.test_router(),
        &format!("/callback/B5/{callback_task}"),
        serde_json::json!({
            "task_id": callback_task,
            "batch_id": "B5",
            "status": "error",
            "error": "sharp failure",
        }),
    )
    .await?;

    let (_, view) = get_json(server.test_router(), "/status/B5").await?;
    assert_eq!(view["status"], "DONE");
    assert_eq!(view["tasks_failed"], 1);
    assert_eq!(view["tasks_completed"], 0);
    Ok(())
}

#[tokio::test]
async fn cors_preflight_permits_get_and_post() -> Result<()> {
    let server = test_server_with_cors(vec!["*".to_string()]);

    let request = Request::builder()
        .method(Method::OPTIONS)
        .uri("/status/B1")
        .header(header::ORIGIN, "https://app.example.com")
        .header(header::ACCESS_CONTROL_REQUEST_METHOD, "GET")
        .body(Body::empty())?;

    let response = server.test_router().oneshot(request).await?;
    assert_eq!(response.status(), StatusCode::OK);

    let allow_methods = response
        .headers()
        .get(header::ACCESS_CONTROL_ALLOW_METHODS)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(allow_methods.contains("GET"));
    assert!(allow_methods.contains("POST"));
    Ok(())
}
