//! HTTP surface of a worker process.
//!
//! `POST /run` and `POST /runsync` take one event as the body (bare or
//! wrapped as `{"input": {...}}`) and answer with the handler's response.
//! Events run one at a time on the blocking pool.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response as HttpResponse};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::error::HandlerError;
use crate::handler::{Handler, Response};
use crate::model::ModelLoader;

pub struct WorkerState<L: ModelLoader> {
    handler: Arc<Handler<L>>,
    gate: Arc<Mutex<()>>,
}

impl<L: ModelLoader> Clone for WorkerState<L> {
    fn clone(&self) -> Self {
        Self {
            handler: Arc::clone(&self.handler),
            gate: Arc::clone(&self.gate),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: String,
}

#[derive(Debug)]
pub enum WorkerError {
    BadRequest { kind: &'static str, message: String },
    Internal { kind: &'static str, message: String },
}

impl From<HandlerError> for WorkerError {
    fn from(error: HandlerError) -> Self {
        let kind = error.kind();
        let message = error.to_string();
        if error.is_caller_fault() {
            Self::BadRequest { kind, message }
        } else {
            Self::Internal { kind, message }
        }
    }
}

impl IntoResponse for WorkerError {
    fn into_response(self) -> HttpResponse {
        let (status, kind, message) = match self {
            Self::BadRequest { kind, message } => (StatusCode::BAD_REQUEST, kind, message),
            Self::Internal { kind, message } => (StatusCode::INTERNAL_SERVER_ERROR, kind, message),
        };
        let body = Json(ErrorResponse {
            error: message,
            kind: kind.to_string(),
        });
        (status, body).into_response()
    }
}

pub fn worker_router<L>(handler: Arc<Handler<L>>, max_body_bytes: usize) -> Router
where
    L: ModelLoader + 'static,
{
    let state = WorkerState {
        handler,
        gate: Arc::new(Mutex::new(())),
    };

    Router::new()
        .route("/health", get(health::<L>))
        .route("/run", post(run::<L>))
        .route("/runsync", post(run::<L>))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Healthchecks never touch the model, so they skip the gate and answer even
/// while a clip is being generated.
async fn health<L>(State(state): State<WorkerState<L>>) -> Result<Json<Response>, WorkerError>
where
    L: ModelLoader + 'static,
{
    Ok(Json(state.handler.handle(&Value::Null)?))
}

async fn run<L>(
    State(state): State<WorkerState<L>>,
    body: Bytes,
) -> Result<Json<Response>, WorkerError>
where
    L: ModelLoader + 'static,
{
    let event = if body.iter().all(u8::is_ascii_whitespace) {
        Value::Null
    } else {
        match serde_json::from_slice::<Value>(&body) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Rejected request body");
                return Ok(Json(Response::error(format!(
                    "request body is not valid JSON: {e}"
                ))));
            }
        }
    };

    // Held by the blocking task, so a dropped connection does not open the gate
    // while its generation is still running.
    let turn = Arc::clone(&state.gate).lock_owned().await;
    let handler = Arc::clone(&state.handler);
    let response = tokio::task::spawn_blocking(move || {
        let _turn = turn;
        handler.handle(&event)
    })
    .await
    .map_err(|e| WorkerError::Internal {
        kind: "internal",
        message: format!("task join error: {e}"),
    })??;

    Ok(Json(response))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use anyhow::Result;
    use axum::body::Body;
    use axum::http::Request;
    use image::RgbImage;
    use serde_json::json;
    use tower::{Service, ServiceExt};

    use super::*;
    use crate::config::{EncoderSettings, GenerationConfig};
    use crate::model::{FrameRequest, VideoModel};
    use crate::synthesis::Conditioning;

    struct IdleModel;

    impl VideoModel for IdleModel {
        fn synthesize(&self, _: &Conditioning, _: &FrameRequest) -> Result<Vec<RgbImage>> {
            anyhow::bail!("idle model generates nothing")
        }
    }

    struct UnavailableLoader {
        attempts: Arc<AtomicUsize>,
    }

    impl ModelLoader for UnavailableLoader {
        type Model = IdleModel;

        fn describe(&self) -> String {
            "unavailable".to_string()
        }

        fn load(&self) -> Result<IdleModel> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("weights not downloaded")
        }
    }

    /// Records how many generations overlap, then fails.
    #[derive(Clone, Default)]
    struct SlowModel {
        calls: Arc<AtomicUsize>,
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl VideoModel for SlowModel {
        fn synthesize(&self, _: &Conditioning, _: &FrameRequest) -> Result<Vec<RgbImage>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(400));
            self.active.fetch_sub(1, Ordering::SeqCst);
            anyhow::bail!("slow model gives up")
        }
    }

    struct SlowLoader(SlowModel);

    impl ModelLoader for SlowLoader {
        type Model = SlowModel;

        fn describe(&self) -> String {
            "slow".to_string()
        }

        fn load(&self) -> Result<SlowModel> {
            Ok(self.0.clone())
        }
    }

    fn router_for<L: ModelLoader + 'static>(loader: L, max_body_bytes: usize) -> Router {
        let handler = Handler::new(
            GenerationConfig::new(2, 1, 8, 8).expect("valid config"),
            EncoderSettings::default(),
            None,
            loader,
        );
        worker_router(Arc::new(handler), max_body_bytes)
    }

    fn test_router(max_body_bytes: usize) -> (Router, Arc<AtomicUsize>) {
        let attempts = Arc::new(AtomicUsize::new(0));
        let loader = UnavailableLoader {
            attempts: Arc::clone(&attempts),
        };
        (router_for(loader, max_body_bytes), attempts)
    }

    async fn send_request(router: &mut Router, request: Request<Body>) -> HttpResponse {
        router
            .as_service()
            .ready()
            .await
            .unwrap()
            .call(request)
            .await
            .unwrap()
    }

    async fn post_json(router: &mut Router, uri: &str, body: impl Into<Body>) -> HttpResponse {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(body.into())
            .unwrap();
        send_request(router, request).await
    }

    async fn body_json(response: HttpResponse) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_endpoint_answers_ok_without_loading() {
        let (mut app, attempts) = test_router(1024);
        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();

        let response = send_request(&mut app, request).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({"ok": true}));
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn run_accepts_enveloped_healthcheck_and_empty_body() {
        let (mut app, _) = test_router(1024);

        let response = post_json(&mut app, "/run", json!({"input": {}}).to_string()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({"ok": true}));

        let response = post_json(&mut app, "/runsync", Body::empty()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({"ok": true}));
    }

    #[tokio::test]
    async fn validation_failures_answer_200_with_error() {
        let (mut app, attempts) = test_router(1024);

        let response = post_json(&mut app, "/run", json!({"input": {"seed": 3}}).to_string()).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert!(body["error"].as_str().is_some_and(|e| e.contains("missing input")));

        let response = post_json(&mut app, "/run", "{not json").await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert!(body["error"].as_str().is_some_and(|e| e.contains("not valid JSON")));

        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn system_failures_answer_500_with_kind_and_retry_acquisition() {
        let (mut app, attempts) = test_router(1024);

        for expected_attempts in 1..=2 {
            let response =
                post_json(&mut app, "/runsync", json!({"prompt": "sunrise"}).to_string()).await;
            assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
            let body = body_json(response).await;
            assert_eq!(body["kind"], "acquisition");
            assert!(body["error"]
                .as_str()
                .is_some_and(|e| e.contains("weights not downloaded")));
            assert_eq!(attempts.load(Ordering::SeqCst), expected_attempts);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn abandoned_request_holds_the_gate_until_generation_ends() {
        let model = SlowModel::default();
        let app = router_for(SlowLoader(model.clone()), 1024);
        let prompt = || {
            Request::builder()
                .method("POST")
                .uri("/run")
                .header("content-type", "application/json")
                .body(Body::from(json!({"prompt": "sunrise"}).to_string()))
                .unwrap()
        };

        let abandoned =
            tokio::time::timeout(Duration::from_millis(100), app.clone().oneshot(prompt())).await;
        assert!(abandoned.is_err(), "first request should still be generating");

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while model.calls.load(Ordering::SeqCst) == 0 {
            assert!(tokio::time::Instant::now() < deadline, "first generation never started");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let response = app.clone().oneshot(prompt()).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_json(response).await["kind"], "generation");

        assert_eq!(model.calls.load(Ordering::SeqCst), 2);
        assert_eq!(model.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let (mut app, attempts) = test_router(64);
        let prompt = "x".repeat(256);

        let response = post_json(&mut app, "/run", json!({"prompt": prompt}).to_string()).await;
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn handler_errors_map_to_status_by_fault() {
        let caller = WorkerError::from(HandlerError::validation("bad"));
        assert!(matches!(caller, WorkerError::BadRequest { kind: "validation", .. }));

        let system = WorkerError::from(HandlerError::Encoding {
            status: "exit status: 1".to_string(),
            stderr: String::new(),
        });
        assert_eq!(
            system.into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
