use super::*;
use std::{collections::HashMap, sync::Arc, time::Duration};

use axum::{
    body::{Body, Bytes},
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use shared::protocol::{EventTag, StreamEvent};
use tokio::{
    net::TcpListener,
    sync::{oneshot, Mutex},
};

#[derive(Clone)]
struct ServerState {
    chunks: Arc<Vec<String>>,
    submitted: Arc<Mutex<Option<oneshot::Sender<Value>>>>,
    cancels: Arc<Mutex<Vec<String>>>,
}

async fn handle_dream(State(state): State<ServerState>, Json(body): Json<Value>) -> axum::response::Response {
    let explode = body.get("prompt").and_then(Value::as_str) == Some("explode");
    if let Some(tx) = state.submitted.lock().await.take() {
        let _ = tx.send(body);
    }
    if explode {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "detail": "queue unavailable" })),
        )
            .into_response();
    }

    let chunks: Vec<Result<Bytes, std::io::Error>> = state
        .chunks
        .iter()
        .map(|chunk| Ok(Bytes::from(chunk.clone())))
        .collect();
    Body::from_stream(futures::stream::iter(chunks)).into_response()
}

async fn handle_cancel(
    State(state): State<ServerState>,
    Query(query): Query<HashMap<String, String>>,
) -> axum::response::Response {
    let uuid = query.get("uuid").cloned().unwrap_or_default();
    if uuid == "missing" {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "detail": "UUID not found" })),
        )
            .into_response();
    }
    state.cancels.lock().await.push(uuid);
    Json(json!({ "status": "OK" })).into_response()
}

async fn handle_status() -> Json<Value> {
    Json(json!({
        "status": { "status": "Awaiting prompts." },
        "working": null,
        "nvidia": {
            "nvidia_smi_log": {
                "gpu": {
                    "utilization": { "gpu_util": "0 %" },
                    "temperature": { "gpu_temp": "35 C" },
                    "power_readings": { "power_draw": "20.00 W" }
                }
            }
        },
        "queuesize": 1
    }))
}

async fn spawn_dream_server(chunks: &[&str]) -> (String, ServerState, oneshot::Receiver<Value>) {
    let (tx, rx) = oneshot::channel();
    let state = ServerState {
        chunks: Arc::new(chunks.iter().map(|c| c.to_string()).collect()),
        submitted: Arc::new(Mutex::new(Some(tx))),
        cancels: Arc::new(Mutex::new(Vec::new())),
    };
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = Router::new()
        .route("/", post(handle_dream))
        .route("/job/cancel", get(handle_cancel))
        .route("/status", get(handle_status))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), state, rx)
}

#[derive(Default)]
struct TagObserver {
    tags: Vec<EventTag>,
    finished: bool,
}

impl JobObserver for TagObserver {
    fn on_event(&mut self, _view: &JobView, event: &StreamEvent) {
        self.tags.push(event.tag());
    }

    fn on_finished(&mut self, _view: &JobView, _alert: Option<&FailureAlert>) {
        self.finished = true;
    }
}

#[tokio::test]
async fn run_job_streams_events_and_restores_form() {
    let (server_url, _state, submitted) = spawn_dream_server(&[
        "{\"event\":\"queued\",\"uuid\":\"j-1\",\"jobpos\":{\"pos\":1,\"total\":2,\"working\":true}}\n",
        "{\"event\":\"step\",\"uuid\":\"j-1\",\"step\":1}\n{\"event\":\"st",
        "ep\",\"uuid\":\"j-1\",\"step\":2}\n",
        "{\"event\":\"result\",\"uuid\":\"j-1\",\"seed\":777,\"url\":\"out/1.png\",\"config\":{\"prompt\":\"a fox\",\"steps\":\"20\"}}\n",
    ])
    .await;
    let client = DreamClient::new(&server_url).expect("client");
    let mut form = Form::generate();
    form.set("prompt", "a fox").expect("prompt");
    form.set("steps", "20").expect("steps");
    let tracker = JobTracker::new();
    let mut observer = TagObserver::default();

    let outcome = run_job(&client, &mut form, &tracker, &mut observer)
        .await
        .expect("job");

    assert_eq!(
        observer.tags,
        vec![
            EventTag::Queued,
            EventTag::Step,
            EventTag::Step,
            EventTag::Result
        ]
    );
    assert!(observer.finished);
    assert_eq!(outcome.alert, None);
    assert_eq!(outcome.view.results[0].caption, "777 | a fox");
    assert_eq!(outcome.view.results[0].image_path, "job/image?uuid=j-1");
    assert_eq!(tracker.current(), Some(JobId::new("j-1")));
    assert!(!form.is_disabled());
    assert_eq!(form.prompt(), "a fox");

    let body = submitted.await.expect("submitted body");
    assert_eq!(body["prompt"], json!("a fox"));
    assert_eq!(body["steps"], json!(20));
    assert_eq!(body["initimg"], Value::Null);
}

#[tokio::test]
async fn run_job_alerts_when_stream_ends_without_output() {
    let (server_url, _state, _submitted) = spawn_dream_server(&[
        "{\"event\":\"queued\",\"uuid\":\"j-2\"}\n",
        "{\"event\":\"step\",\"uuid\":\"j-2\",\"step\":1}\n",
    ])
    .await;
    let client = DreamClient::new(&server_url).expect("client");
    let mut form = Form::generate();
    form.set("prompt", "a storm").expect("prompt");
    let mut observer = TagObserver::default();

    let outcome = run_job(&client, &mut form, &JobTracker::new(), &mut observer)
        .await
        .expect("job");

    assert_eq!(
        outcome.alert.as_ref().map(|a| a.message),
        Some(reducer::FAILURE_ALERT)
    );
    assert!(!form.is_disabled());
    assert_eq!(form.prompt(), "a storm");
}

#[tokio::test]
async fn submit_rejection_reenables_form_and_surfaces_detail() {
    let (server_url, _state, _submitted) = spawn_dream_server(&[]).await;
    let client = DreamClient::new(&server_url).expect("client");
    let mut form = Form::generate();
    form.set("prompt", "explode").expect("prompt");
    let mut observer = TagObserver::default();

    let err = run_job(&client, &mut form, &JobTracker::new(), &mut observer)
        .await
        .expect_err("server error");

    assert!(err.to_string().contains("queue unavailable"), "{err}");
    assert!(!form.is_disabled());
    assert_eq!(form.prompt(), "explode");
    assert!(!observer.finished);
}

#[tokio::test]
async fn cancel_targets_the_tracked_job() {
    let (server_url, state, _submitted) = spawn_dream_server(&[]).await;
    let client = DreamClient::new(&server_url).expect("client");

    client
        .cancel(Some(JobId::new("j-9")))
        .await
        .expect("cancel task");

    assert_eq!(*state.cancels.lock().await, vec!["j-9".to_string()]);
}

#[tokio::test]
async fn cancel_failures_are_not_surfaced() {
    let (server_url, state, _submitted) = spawn_dream_server(&[]).await;
    let client = DreamClient::new(&server_url).expect("client");

    client
        .cancel(Some(JobId::new("missing")))
        .await
        .expect("cancel task completes");
    client.cancel(None).await.expect("cancel task completes");
    assert!(state.cancels.lock().await.is_empty());

    let err = client
        .request_cancel(Some(&JobId::new("missing")))
        .await
        .expect_err("404");
    assert!(err.to_string().contains("UUID not found"), "{err}");
}

#[tokio::test]
async fn status_is_fetched_and_polled() {
    let (server_url, _state, _submitted) = spawn_dream_server(&[]).await;
    let client = DreamClient::new(&server_url).expect("client");

    let report = client.status().await.expect("status");
    assert_eq!(report.queuesize, 1);

    let lines: Vec<String> = status::status_updates(client, Duration::from_millis(10))
        .take(2)
        .collect()
        .await;
    assert_eq!(
        lines,
        vec![
            "GPU: 0 % (35 C / 20.00 W) | queue: 1 | Awaiting prompts.".to_string();
            2
        ]
    );
}

#[test]
fn endpoints_resolve_under_server_prefix() {
    let client = DreamClient::new("http://gpu-box:8000/sd").expect("client");
    assert_eq!(
        client.endpoint("job/image?uuid=x").expect("url").as_str(),
        "http://gpu-box:8000/sd/job/image?uuid=x"
    );
    assert_eq!(client.endpoint("").expect("url").as_str(), "http://gpu-box:8000/sd/");
    assert!(DreamClient::new("ftp://gpu-box").is_err());
}
