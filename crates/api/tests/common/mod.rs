#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, Response, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use tempfile::TempDir;
use tower::ServiceExt;

use murmur_api::config::ServerConfig;
use murmur_api::router::build_app_router;
use murmur_api::state::AppState;
use murmur_engine::config::ProcessCommand;
use murmur_engine::{EngineConfig, Orchestrator};

pub const BOUNDARY: &str = "murmur-test-boundary";

/// Script that reports one stage and writes a one-segment transcript.
pub const SUCCESS_SCRIPT: &str = "echo 'Transcribing audio'\n\
cat > \"$MURMUR_OUTPUT\" <<'JSON'\n\
{\"segments\":[{\"start\":0.0,\"end\":1.0,\"speaker\":\"SPEAKER_00\",\"text\":\"hi\"}]}\n\
JSON\n";

/// Script that blocks until killed.
pub const BLOCKING_SCRIPT: &str = "echo '::stage::transcribing'\nsleep 30\n";

/// Script that fails with a diagnostic on stderr.
pub const FAILING_SCRIPT: &str = "echo 'CUDA error: out of memory' >&2\nexit 1\n";

/// A running app backed by a real orchestrator in a temp directory.
pub struct TestApp {
    pub router: Router,
    pub orchestrator: Arc<Orchestrator>,
    pub dir: TempDir,
}

/// Build a test `ServerConfig` whose engine runs `script` with `sh`.
pub fn test_config(dir: &TempDir, script: &str) -> ServerConfig {
    let script_path = dir.path().join("diarize.sh");
    std::fs::write(&script_path, script).expect("write script");

    let mut engine = EngineConfig::new(
        ProcessCommand::new("sh", [script_path.display().to_string()]),
        dir.path().join("uploads"),
        dir.path().join("results"),
    );
    engine.cancel_grace = Duration::from_millis(500);
    engine.poll_interval = Duration::from_millis(250);

    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:5173".to_string()],
        request_timeout_secs: 30,
        shutdown_timeout_secs: 5,
        engine,
    }
}

/// Build the full application router, mirroring `main.rs`.
pub async fn build_test_app(script: &str) -> TestApp {
    build_test_app_with(script, |_| {}).await
}

pub async fn build_test_app_with(script: &str, tweak: impl FnOnce(&mut ServerConfig)) -> TestApp {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(&dir, script);
    tweak(&mut config);

    let orchestrator = Orchestrator::start(config.engine.clone())
        .await
        .expect("start orchestrator");
    let state = AppState {
        config: Arc::new(config.clone()),
        orchestrator: Arc::clone(&orchestrator),
    };

    TestApp {
        router: build_app_router(state, &config),
        orchestrator,
        dir,
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

pub async fn get(app: &TestApp, uri: &str) -> Response<Body> {
    let request = Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    app.router.clone().oneshot(request).await.unwrap()
}

pub async fn post(app: &TestApp, uri: &str) -> Response<Body> {
    let request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    app.router.clone().oneshot(request).await.unwrap()
}

/// A multipart part: `(name, filename, content)`.
pub type Part<'a> = (&'a str, Option<&'a str>, &'a [u8]);

pub fn multipart_body(parts: &[Part<'_>]) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, filename, content) in parts {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        match filename {
            Some(filename) => body.extend_from_slice(
                format!(
                    "Content-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\n\
                     Content-Type: application/octet-stream\r\n\r\n"
                )
                .as_bytes(),
            ),
            None => body.extend_from_slice(
                format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
            ),
        }
        body.extend_from_slice(content);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

pub async fn post_multipart(app: &TestApp, uri: &str, parts: &[Part<'_>]) -> Response<Body> {
    let request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(
            "content-type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(multipart_body(parts)))
        .unwrap();
    app.router.clone().oneshot(request).await.unwrap()
}

/// Submit a small audio file and return the new job id.
pub async fn submit(app: &TestApp, filename: &str) -> String {
    let response = post_multipart(
        app,
        "/api/v1/jobs",
        &[("file", Some(filename), &b"RIFF....WAVEfmt "[..])],
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let json = body_json(response).await;
    json["data"]["job_id"].as_str().unwrap().to_string()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

/// Poll `GET /api/v1/jobs/{id}` until `done` holds for the job payload.
pub async fn wait_for(
    app: &TestApp,
    id: &str,
    done: impl Fn(&serde_json::Value) -> bool,
) -> serde_json::Value {
    let poll = async {
        loop {
            let json = body_json(get(app, &format!("/api/v1/jobs/{id}")).await).await;
            if done(&json["data"]) {
                return json["data"].clone();
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(10), poll)
        .await
        .expect("job did not reach the expected state in time")
}

pub async fn wait_terminal(app: &TestApp, id: &str) -> serde_json::Value {
    wait_for(app, id, |job| job["terminal"] == true).await
}
