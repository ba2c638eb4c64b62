//! Integration tests for the HTTP endpoints.
//!
//! Tests use Axum's `Router` directly via `tower::ServiceExt` without
//! starting a TCP server. Simulation streams run real `/bin/sh` programs
//! against temporary directories and are read to completion.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use demps_core::config::ServiceConfig;
use demps_core::pool::PROCESS_KEY;
use demps_observer::router::build_router;
use demps_observer::state::AppState;
use futures::StreamExt as _;
use serde_json::{Value, json};
use tower::ServiceExt;

const STREAM_TIMEOUT: Duration = Duration::from_secs(30);

struct Fixture {
    dir: tempfile::TempDir,
    state: Arc<AppState>,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();

        let mut config = ServiceConfig::default();
        config.simulator.directives = root.join("sim.ini");
        config.simulator.kill_timeout_ms = 500;
        config.watcher.poll_interval_ms = 50;
        config.stream.drain_grace_ms = 2000;
        config.files.root = Some(root);

        Self {
            dir,
            state: Arc::new(AppState::new(config)),
        }
    }

    fn root(&self) -> PathBuf {
        self.dir.path().canonicalize().unwrap()
    }

    fn router(&self) -> Router {
        build_router(Arc::clone(&self.state))
    }

    fn write_directives(&self, body: &str) {
        std::fs::write(self.root().join("sim.ini"), body).unwrap();
    }
}

async fn body_to_json(body: Body) -> Value {
    let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn json_request(method: &str, uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

/// Open the simulation stream and read it until the run ends.
async fn collect_stream(router: Router) -> Vec<(String, String)> {
    let response = router
        .oneshot(Request::get("/api/simulation").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers().get("content-type").unwrap().to_str().unwrap();
    assert!(content_type.contains("text/event-stream"));

    let bytes = tokio::time::timeout(
        STREAM_TIMEOUT,
        axum::body::to_bytes(response.into_body(), usize::MAX),
    )
    .await
    .expect("stream did not end")
    .unwrap();
    parse_sse(&String::from_utf8(bytes.to_vec()).unwrap())
}

/// Split an SSE body into `(event, data)` pairs, skipping comments.
fn parse_sse(text: &str) -> Vec<(String, String)> {
    text.split("\n\n")
        .filter_map(|frame| {
            let mut name = None;
            let mut data = None;
            for line in frame.lines() {
                if let Some(value) = line.strip_prefix("event:") {
                    name = Some(value.trim().to_owned());
                } else if let Some(value) = line.strip_prefix("data:") {
                    data = Some(value.trim_start().to_owned());
                }
            }
            Some((name?, data.unwrap_or_default()))
        })
        .collect()
}

/// Open the simulation stream and read it until `ready` arrives, returning
/// the still-open body.
async fn open_until_ready(router: Router) -> axum::body::BodyDataStream {
    let response = router
        .oneshot(Request::get("/api/simulation").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let mut body = response.into_body().into_data_stream();
    let mut text = String::new();
    tokio::time::timeout(STREAM_TIMEOUT, async {
        while !statuses(&parse_sse(&text)).contains(&"ready") {
            let chunk = body.next().await.expect("stream ended before ready").unwrap();
            text.push_str(&String::from_utf8_lossy(&chunk));
        }
    })
    .await
    .expect("simulator never became ready");
    body
}

/// Poll `condition` until it holds.
async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let reached = tokio::time::timeout(STREAM_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting for {what}");
}

async fn simulator_pid(router: Router) -> Option<u64> {
    let response = router
        .oneshot(Request::get("/api/simulation/status").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let json = body_to_json(response.into_body()).await;
    json["process"]["pid"].as_u64()
}

fn statuses(events: &[(String, String)]) -> Vec<&str> {
    events
        .iter()
        .filter(|(name, _)| name == "status")
        .map(|(_, data)| data.as_str())
        .collect()
}

fn dataset_payloads<'a>(events: &'a [(String, String)], dataset: &str) -> Vec<&'a str> {
    events
        .iter()
        .filter(|(name, _)| name == dataset)
        .map(|(_, data)| data.as_str())
        .collect()
}

// =========================================================================
// Control endpoints
// =========================================================================

#[tokio::test]
async fn test_index_returns_banner() {
    let fixture = Fixture::new();
    let response = fixture
        .router()
        .oneshot(Request::get("/").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers().get("content-type").unwrap().to_str().unwrap();
    assert!(content_type.contains("text/plain"));
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert!(String::from_utf8_lossy(&bytes).starts_with("DEMPS live server"));
}

#[tokio::test]
async fn test_status_when_idle() {
    let fixture = Fixture::new();
    let response = fixture
        .router()
        .oneshot(Request::get("/api/simulation/status").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_to_json(response.into_body()).await;
    assert_eq!(json["resources"], json!([]));
    assert_eq!(json["process"], Value::Null);
}

#[tokio::test]
async fn test_stop_without_simulator() {
    let fixture = Fixture::new();
    let response = fixture
        .router()
        .oneshot(
            Request::delete("/api/simulation")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_to_json(response.into_body()).await;
    assert_eq!(json["stopped"], false);
}

// =========================================================================
// Directory endpoints
// =========================================================================

#[tokio::test]
async fn test_list_directory_filters_extensions() {
    let fixture = Fixture::new();
    let runs = fixture.root().join("runs");
    std::fs::create_dir_all(runs.join("old")).unwrap();
    std::fs::write(runs.join("b.config"), "").unwrap();
    std::fs::write(runs.join("a.config"), "").unwrap();
    std::fs::write(runs.join("notes.txt"), "").unwrap();

    let response = fixture
        .router()
        .oneshot(json_request(
            "POST",
            "/api/directory/get",
            &json!({ "path": "runs", "options": { "extensions": [".config"] } }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_to_json(response.into_body()).await;
    assert_eq!(json["contents"]["files"], json!(["a.config", "b.config"]));
    assert_eq!(json["contents"]["folders"], json!(["old"]));
}

#[tokio::test]
async fn test_list_directory_folders_only() {
    let fixture = Fixture::new();
    let runs = fixture.root().join("runs");
    std::fs::create_dir_all(runs.join("scenario")).unwrap();
    std::fs::write(runs.join("a.config"), "").unwrap();

    let response = fixture
        .router()
        .oneshot(json_request(
            "POST",
            "/api/directory/get",
            &json!({ "path": runs.display().to_string(), "options": { "includeFiles": false } }),
        ))
        .await
        .unwrap();

    let json = body_to_json(response.into_body()).await;
    assert_eq!(json["contents"]["files"], json!([]));
    assert_eq!(json["contents"]["folders"], json!(["scenario"]));
}

#[tokio::test]
async fn test_list_directory_requires_path() {
    let fixture = Fixture::new();
    let response = fixture
        .router()
        .oneshot(json_request("POST", "/api/directory/get", &json!({})))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_to_json(response.into_body()).await;
    assert_eq!(json["error"]["code"], 400);
}

#[tokio::test]
async fn test_list_directory_missing_is_not_found() {
    let fixture = Fixture::new();
    let response = fixture
        .router()
        .oneshot(json_request(
            "POST",
            "/api/directory/get",
            &json!({ "path": "nowhere" }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_list_directory_outside_root_is_forbidden() {
    let fixture = Fixture::new();
    let response = fixture
        .router()
        .oneshot(json_request(
            "POST",
            "/api/directory/get",
            &json!({ "path": "/" }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let json = body_to_json(response.into_body()).await;
    assert_eq!(json["error"]["code"], 403);
}

#[tokio::test]
async fn test_delete_file_and_directory() {
    let fixture = Fixture::new();
    let root = fixture.root();
    std::fs::create_dir_all(root.join("out/agents")).unwrap();
    std::fs::write(root.join("out/agents/0.txt"), "x").unwrap();
    std::fs::write(root.join("stale.ini"), "x").unwrap();

    let response = fixture
        .router()
        .oneshot(json_request(
            "DELETE",
            "/api/directory/delete",
            &json!({ "path": "stale.ini" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_to_json(response.into_body()).await;
    assert_eq!(json["deleted"], "stale.ini");
    assert!(!root.join("stale.ini").exists());

    let response = fixture
        .router()
        .oneshot(json_request(
            "DELETE",
            "/api/directory/delete",
            &json!({ "path": "out" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(!root.join("out").exists());
}

#[tokio::test]
async fn test_delete_rejects_root_and_outside() {
    let fixture = Fixture::new();
    for path in [".", "../elsewhere"] {
        let response = fixture
            .router()
            .oneshot(json_request(
                "DELETE",
                "/api/directory/delete",
                &json!({ "path": path }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN, "path {path}");
    }
    assert!(fixture.root().exists());
}

// =========================================================================
// Simulation stream
// =========================================================================

#[tokio::test]
async fn test_stream_without_directives_reports_error() {
    let fixture = Fixture::new();
    let events = collect_stream(fixture.router()).await;

    assert_eq!(statuses(&events), vec!["error"]);
    assert_eq!(events.len(), 1);
    assert!(fixture.state.pool.is_empty());
}

#[tokio::test]
async fn test_stream_missing_working_dir_reports_error_without_spawning() {
    let fixture = Fixture::new();
    let base = fixture.root().join("not-installed");
    fixture.write_directives(&format!(
        "baseDirSim={}\nconfigFile=scenario.config\nagentsDir=out/agents\nexecCmd=true\n",
        base.display()
    ));

    let events = collect_stream(fixture.router()).await;

    assert_eq!(statuses(&events), vec!["init", "error"]);
    assert!(dataset_payloads(&events, "agents").is_empty());
    assert!(fixture.state.pool.is_empty());
}

#[tokio::test]
async fn test_stream_clean_exit_without_output() {
    let fixture = Fixture::new();
    let base = fixture.root().join("sim");
    std::fs::create_dir(&base).unwrap();
    fixture.write_directives(&format!(
        "baseDirSim={}\nconfigFile=scenario.config\nagentsDir=out/agents\nexecCmd=true\n",
        base.display()
    ));

    let events = collect_stream(fixture.router()).await;

    assert_eq!(statuses(&events), vec!["init", "ready", "finished"]);
    assert!(dataset_payloads(&events, "agents").is_empty());
    assert!(fixture.state.pool.is_empty());
}

#[tokio::test]
async fn test_stream_failed_exit_reports_error() {
    let fixture = Fixture::new();
    let base = fixture.root().join("sim");
    std::fs::create_dir(&base).unwrap();
    fixture.write_directives(&format!(
        "baseDirSim={}\nconfigFile=scenario.config\nagentsDir=out/agents\nexecCmd=false\n",
        base.display()
    ));

    let events = collect_stream(fixture.router()).await;

    assert_eq!(statuses(&events), vec!["init", "ready", "error"]);
}

#[cfg(unix)]
fn write_script(path: &Path, body: &str) {
    use std::os::unix::fs::PermissionsExt as _;

    std::fs::write(path, body).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn test_stream_forwards_one_event_per_agent_file() {
    let fixture = Fixture::new();
    let base = fixture.root().join("sim");
    std::fs::create_dir(&base).unwrap();
    write_script(
        &base.join("fake-demps.sh"),
        "#!/bin/sh\n\
         [ \"$1\" = \"--config\" ] || exit 2\n\
         mkdir -p out/agents staging\n\
         printf 'id lat lng vx vy alive\\n1 1.5 2.5 0 0 1\\n2 3.5 4.5 0 0 0\\n' > staging/0.txt\n\
         mv staging/0.txt out/agents/0.txt\n\
         sleep 0.3\n\
         printf 'id lat lng vx vy alive\\n1 1.6 2.6 0 0 1\\n' > staging/1.txt\n\
         mv staging/1.txt out/agents/1.txt\n\
         sleep 0.3\n",
    );
    fixture.write_directives(&format!(
        "baseDirSim={}\nconfigFile=scenario.config\nagentsDir=out/agents\noutputDirectory=out\nexecCmd=./fake-demps.sh\n",
        base.display()
    ));

    let events = collect_stream(fixture.router()).await;

    assert_eq!(statuses(&events), vec!["init", "ready", "finished"]);
    assert_eq!(
        dataset_payloads(&events, "agents"),
        vec!["1.5,2.5,1$3.5,4.5,0$", "1.6,2.6,1$"]
    );
    assert!(fixture.state.pool.is_empty());
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_stream_waits_for_agent_file_to_be_closed() {
    let fixture = Fixture::new();
    let base = fixture.root().join("sim");
    std::fs::create_dir(&base).unwrap();
    write_script(
        &base.join("fake-demps.sh"),
        "#!/bin/sh\n\
         mkdir -p out/agents\n\
         { echo 'id lat lng vx vy alive'; sleep 0.3; echo '1 1.5 2.5 0 0 1'; } > out/agents/0.txt\n\
         sleep 0.3\n",
    );
    fixture.write_directives(&format!(
        "baseDirSim={}\nconfigFile=scenario.config\nagentsDir=out/agents\noutputDirectory=out\nexecCmd=./fake-demps.sh\n",
        base.display()
    ));

    let events = collect_stream(fixture.router()).await;

    assert_eq!(statuses(&events), vec!["init", "ready", "finished"]);
    assert_eq!(dataset_payloads(&events, "agents"), vec!["1.5,2.5,1$"]);
}

#[cfg(unix)]
#[tokio::test]
async fn test_stream_forwards_flood_files_independently() {
    let fixture = Fixture::new();
    let base = fixture.root().join("sim");
    std::fs::create_dir(&base).unwrap();
    write_script(
        &base.join("fake-demps.sh"),
        "#!/bin/sh\n\
         mkdir -p out/agents out/flood staging\n\
         printf 'id lat lng vx vy alive\\n1 1.5 2.5 0 0 1\\n' > staging/a0.txt\n\
         mv staging/a0.txt out/agents/0.txt\n\
         printf 'id lng lat v depth\\n0 -71.5 -33.25 0 0.75\\n1 -71.6 -33.35 0 1.5\\n' > staging/f0.txt\n\
         mv staging/f0.txt out/flood/0.txt\n\
         sleep 0.3\n\
         printf 'id lng lat v depth\\n0 -71.5 -33.25 0 0.5\\n' > staging/f1.txt\n\
         mv staging/f1.txt out/flood/1.txt\n\
         sleep 0.3\n",
    );
    fixture.write_directives(&format!(
        "baseDirSim={}\nconfigFile=scenario.config\nagentsDir=out/agents\noutputDirectory=out\n\
         floodEnabled=true\nfloodDir=out/flood\nexecCmd=./fake-demps.sh\n",
        base.display()
    ));

    let events = collect_stream(fixture.router()).await;

    assert_eq!(statuses(&events), vec!["init", "ready", "finished"]);
    assert_eq!(dataset_payloads(&events, "agents"), vec!["1.5,2.5,1$"]);
    assert_eq!(
        dataset_payloads(&events, "flood"),
        vec!["-71.5,-33.25,0.75$-71.6,-33.35,1.5$", "-71.5,-33.25,0.5$"]
    );
    eventually("pool teardown", || fixture.state.pool.is_empty()).await;
}

#[cfg(unix)]
fn write_long_running_simulator(base: &Path) {
    write_script(
        &base.join("fake-demps.sh"),
        "#!/bin/sh\n\
         trap 'touch terminated; exit 0' TERM\n\
         mkdir -p out/agents\n\
         sleep 30 &\n\
         wait\n",
    );
}

#[cfg(unix)]
#[tokio::test]
async fn test_disconnect_terminates_simulator() {
    let fixture = Fixture::new();
    let base = fixture.root().join("sim");
    std::fs::create_dir(&base).unwrap();
    write_long_running_simulator(&base);
    fixture.write_directives(&format!(
        "baseDirSim={}\nconfigFile=scenario.config\nagentsDir=out/agents\noutputDirectory=out\nexecCmd=./fake-demps.sh\n",
        base.display()
    ));

    let body = open_until_ready(fixture.router()).await;
    assert!(fixture.state.pool.has(PROCESS_KEY));
    drop(body);

    let terminated = base.join("terminated");
    eventually("simulator termination", || terminated.exists()).await;
    eventually("pool teardown", || fixture.state.pool.is_empty()).await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_stop_terminates_running_simulator() {
    let fixture = Fixture::new();
    let base = fixture.root().join("sim");
    std::fs::create_dir(&base).unwrap();
    write_long_running_simulator(&base);
    fixture.write_directives(&format!(
        "baseDirSim={}\nconfigFile=scenario.config\nagentsDir=out/agents\noutputDirectory=out\nexecCmd=./fake-demps.sh\n",
        base.display()
    ));

    let stream = tokio::spawn(collect_stream(fixture.router()));
    eventually("simulator start", || fixture.state.pool.has(PROCESS_KEY)).await;

    let response = fixture
        .router()
        .oneshot(Request::delete("/api/simulation").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_to_json(response.into_body()).await;
    assert_eq!(json["stopped"], true);
    assert!(base.join("terminated").exists());

    let events = stream.await.unwrap();
    assert_eq!(statuses(&events), vec!["init", "ready", "error"]);
    eventually("pool teardown", || fixture.state.pool.is_empty()).await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_new_stream_supersedes_running_one() {
    let fixture = Fixture::new();
    let base = fixture.root().join("sim");
    std::fs::create_dir(&base).unwrap();
    write_long_running_simulator(&base);
    fixture.write_directives(&format!(
        "baseDirSim={}\nconfigFile=scenario.config\nagentsDir=out/agents\noutputDirectory=out\nexecCmd=./fake-demps.sh\n",
        base.display()
    ));

    let first = tokio::spawn(collect_stream(fixture.router()));
    eventually("first simulator start", || fixture.state.pool.has(PROCESS_KEY)).await;
    let first_pid = simulator_pid(fixture.router()).await.unwrap();

    let second = open_until_ready(fixture.router()).await;

    let first_events = first.await.unwrap();
    assert_eq!(statuses(&first_events), vec!["init", "ready", "error"]);
    assert!(base.join("terminated").exists());

    let second_pid = simulator_pid(fixture.router()).await.unwrap();
    assert_ne!(first_pid, second_pid);
    assert_eq!(
        fixture
            .state
            .pool
            .keys()
            .iter()
            .filter(|key| key.as_str() == PROCESS_KEY)
            .count(),
        1
    );

    drop(second);
    eventually("pool teardown", || fixture.state.pool.is_empty()).await;
}
