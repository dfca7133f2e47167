//! HTTP control API for the co-host pipeline.
//!
//! Runs on port 2004 by default. CORS-permissive so a browser dashboard or
//! overlay on another local port can call it.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use tower_http::cors::CorsLayer;

use cohost_core::types::{ChatEvent, ContextView, PipelineStatus};

use crate::orchestrator::Orchestrator;

/// Default listen port.
pub const DEFAULT_PORT: u16 = 2004;

/// Build the axum router over a shared [`Orchestrator`].
pub fn router(orchestrator: Orchestrator) -> Router {
    Router::new()
        .route("/chat", post(chat))
        .route("/mute", post(mute))
        .route("/status", get(status))
        .route("/health", get(health))
        .route("/context", get(context).delete(clear_context))
        .route("/cache", delete(clear_caches))
        .route("/devices", get(devices))
        .layer(CorsLayer::permissive())
        .with_state(orchestrator)
}

#[derive(serde::Serialize)]
struct OkResponse {
    ok: bool,
}

#[derive(serde::Serialize)]
struct ErrorResponse {
    ok: bool,
    error: String,
}

fn ok() -> Json<OkResponse> {
    Json(OkResponse { ok: true })
}

async fn chat(State(orch): State<Orchestrator>, Json(event): Json<ChatEvent>) -> Response {
    orch.submit(event);
    (StatusCode::ACCEPTED, ok()).into_response()
}

async fn mute(State(orch): State<Orchestrator>) -> Json<OkResponse> {
    orch.mute();
    ok()
}

async fn status(State(orch): State<Orchestrator>) -> Json<PipelineStatus> {
    Json(orch.status())
}

async fn health(State(orch): State<Orchestrator>) -> Response {
    let report = orch.health().await;
    let code = if report.healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(report)).into_response()
}

async fn context(State(orch): State<Orchestrator>) -> Json<ContextView> {
    Json(orch.context())
}

async fn clear_context(State(orch): State<Orchestrator>) -> Json<OkResponse> {
    orch.clear_context();
    ok()
}

async fn clear_caches(State(orch): State<Orchestrator>) -> Json<OkResponse> {
    orch.clear_caches();
    ok()
}

async fn devices(State(orch): State<Orchestrator>) -> Response {
    match orch.devices().await {
        Ok(devices) => Json(devices).into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse {
                ok: false,
                error: e.to_string(),
            }),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use cohost_core::audio::AudioBuffer;
    use cohost_core::types::{AudioFormat, DeviceInfo, OutputCaps, PipelineConfig, VoiceParams};
    use tower::ServiceExt;

    use crate::cancel::CancelToken;
    use crate::device::OutputHost;
    use crate::error::Result;
    use crate::generator::{ReasoningBackend, ReasoningRequest};
    use crate::synth::VoiceBackend;

    struct Echo;

    #[async_trait]
    impl ReasoningBackend for Echo {
        async fn complete(&self, request: &ReasoningRequest) -> Result<String> {
            Ok(format!("You said {}.", request.message))
        }

        async fn health(&self) -> bool {
            true
        }
    }

    struct Beep;

    #[async_trait]
    impl VoiceBackend for Beep {
        async fn synthesize(&self, text: &str, _: &VoiceParams, rate: u32) -> Result<AudioBuffer> {
            Ok(AudioBuffer::new(vec![0.1; text.len()], AudioFormat {
                sample_rate: rate,
                channels: 1,
            }))
        }

        async fn health(&self) -> bool {
            false
        }
    }

    struct Silent;

    impl OutputHost for Silent {
        fn devices(&self) -> Result<Vec<DeviceInfo>> {
            Ok(vec![DeviceInfo {
                index: 0,
                name: "null".into(),
                is_default: true,
                caps: vec![OutputCaps {
                    channels: 2,
                    min_sample_rate: 8_000,
                    max_sample_rate: 192_000,
                }],
            }])
        }

        fn play_blocking(&self, _: &DeviceInfo, _: &AudioBuffer, _: &CancelToken) -> Result<()> {
            Ok(())
        }
    }

    fn app() -> (Orchestrator, Router) {
        let orch = Orchestrator::new(
            PipelineConfig::default(),
            Arc::new(Echo),
            Arc::new(Beep),
            Arc::new(Silent),
        )
        .unwrap();
        (orch.clone(), router(orch))
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn chat_is_accepted_and_runs() {
        let (orch, app) = app();
        let mut rx = orch.subscribe_status();
        let resp = app
            .oneshot(
                Request::post("/chat")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"username":"ana","text":"hello"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        rx.wait_for(|s| s.utterances_completed == 1).await.unwrap();
        assert_eq!(orch.context().turns.len(), 2);
    }

    #[tokio::test]
    async fn malformed_chat_rejected() {
        let (_, app) = app();
        let resp = app
            .oneshot(
                Request::post("/chat")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"text":"no user"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(resp.status().is_client_error());
    }

    #[tokio::test]
    async fn status_reports_idle() {
        let (_, app) = app();
        let resp = app
            .oneshot(Request::get("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["state"], "idle");
        assert_eq!(json["requestsDropped"], 0);
    }

    #[tokio::test]
    async fn health_is_unavailable_when_voice_down() {
        let (_, app) = app();
        let resp = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = body_json(resp).await;
        assert_eq!(json["reasoning"], true);
        assert_eq!(json["voice"], false);
        assert_eq!(json["outputDevice"], "null");
    }

    #[tokio::test]
    async fn context_can_be_cleared() {
        let (orch, app) = app();
        let mut rx = orch.subscribe_status();
        orch.submit(ChatEvent::new("ana", "hi"));
        rx.wait_for(|s| s.utterances_completed == 1).await.unwrap();

        let resp = app
            .clone()
            .oneshot(Request::delete("/context").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .oneshot(Request::get("/context").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = body_json(resp).await;
        assert_eq!(json["turns"].as_array().unwrap().len(), 0);
        assert_eq!(json["window"], 5);
    }

    #[tokio::test]
    async fn lists_devices() {
        let (_, app) = app();
        let resp = app
            .oneshot(Request::get("/devices").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = body_json(resp).await;
        assert_eq!(json[0]["name"], "null");
        assert_eq!(json[0]["isDefault"], true);
    }
}
