use axum::{
    extract::{State, WebSocketUpgrade},
    http::{header::ORIGIN, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tracing::{info, warn};

use crate::{app_state::AppState, models::SessionSnapshot, ws};

// --- Router ---

pub fn create_router(app_state: AppState) -> Router {
    Router::new()
        // Canal del protocolo con el frame anfitrión.
        .route("/ws", get(host_socket_handler))
        // Superficie local del widget (no forma parte del protocolo).
        .route("/api/status", get(status_handler))
        .route("/api/acknowledge-error", post(acknowledge_error_handler))
        .route("/api/shutdown", post(shutdown_handler))
        .with_state(app_state)
}

// --- Handlers ---

async fn host_socket_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    upgrade: WebSocketUpgrade,
) -> Response {
    let origin = headers
        .get(ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let Some(slot) = state.claim_host_slot() else {
        warn!("Conexión rechazada: ya hay un anfitrión conectado.");
        return (
            StatusCode::CONFLICT,
            Json(json!({"error": "Another host is already attached to this widget."})),
        )
            .into_response();
    };

    upgrade.on_upgrade(move |socket| ws::run_host_channel(socket, origin, state, slot))
}

#[axum::debug_handler]
async fn status_handler(State(state): State<AppState>) -> Json<SessionSnapshot> {
    Json(state.session.snapshot())
}

#[axum::debug_handler]
async fn acknowledge_error_handler(State(state): State<AppState>) -> impl IntoResponse {
    if state.session.acknowledge_error() {
        (StatusCode::OK, Json(json!({ "status": "initializing" })))
    } else {
        (
            StatusCode::CONFLICT,
            Json(json!({ "error": "The session is not in an error state." })),
        )
    }
}

// --- Handler de Apagado ---

#[axum::debug_handler]
async fn shutdown_handler(State(state): State<AppState>) -> impl IntoResponse {
    info!("Petición de apagado recibida.");
    let sender = state
        .shutdown_sender
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .take();
    if let Some(sender) = sender {
        let _ = sender.send(());
    }
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{AppConfig, OriginPolicy},
        llm::testing::ScriptedBackend,
        protocol::ProtocolHandler,
        resolver::FileResolver,
        session::SessionMachine,
    };
    use reqwest::Client;
    use std::sync::{atomic::AtomicBool, Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn test_state() -> (AppState, oneshot::Receiver<()>) {
        let config = AppConfig {
            server_addr: "127.0.0.1:0".into(),
            host_origin: OriginPolicy::Any,
            gemini_api_key: None,
            gemini_model: "gemini-test".into(),
            gemini_base_url: "http://127.0.0.1:9".into(),
            ready_delay: Duration::ZERO,
            upload_poll_interval: Duration::from_millis(1),
            upload_poll_max_attempts: 1,
            fetch_timeout: Duration::from_secs(1),
        };
        let session = SessionMachine::new(
            Arc::new(ScriptedBackend {
                fail_create: Some("boom".into()),
                ..ScriptedBackend::new()
            }),
            FileResolver::new(Client::new()),
            Duration::ZERO,
        );
        let protocol = ProtocolHandler::new(config.host_origin.clone(), session.clone());
        let (tx, rx) = oneshot::channel();
        let state = AppState {
            config,
            session,
            protocol,
            host_connected: Arc::new(AtomicBool::new(false)),
            shutdown_sender: Arc::new(Mutex::new(Some(tx))),
        };
        (state, rx)
    }

    async fn serve(state: AppState) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, create_router(state)).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn status_reports_the_session_snapshot() {
        let (state, _rx) = test_state();
        let base = serve(state).await;

        let body: serde_json::Value = reqwest::get(format!("{base}/api/status"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "initializing");
        assert!(body["activeStoreId"].is_null());
        assert_eq!(body["chatHistory"], json!([]));
    }

    #[tokio::test]
    async fn acknowledge_error_only_from_error_state() {
        let (state, _rx) = test_state();
        let session = state.session.clone();
        let base = serve(state).await;
        let client = Client::new();
        let url = format!("{base}/api/acknowledge-error");

        let response = client.post(&url).send().await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::CONFLICT);

        session
            .start_session(
                vec![crate::models::FilePayload {
                    file_name: Some("A.pdf".into()),
                    url: Some("https://files.example.com/A.pdf".into()),
                    ..Default::default()
                }],
                None,
            )
            .await;
        let response = client.post(&url).send().await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(
            session.status(),
            crate::models::SessionStatus::Initializing
        );
    }

    #[tokio::test]
    async fn shutdown_signals_once() {
        let (state, rx) = test_state();
        let base = serve(state).await;

        let response = Client::new()
            .post(format!("{base}/api/shutdown"))
            .send()
            .await
            .unwrap();
        assert!(response.status().is_success());
        assert!(rx.await.is_ok());
    }

    #[tokio::test]
    async fn only_one_host_slot_at_a_time() {
        let (state, _rx) = test_state();
        let slot = state.claim_host_slot().expect("hueco libre");
        assert!(state.claim_host_slot().is_none());
        drop(slot);
        assert!(state.claim_host_slot().is_some());
    }
}
