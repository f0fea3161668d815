//! HTTP surface: `GET /` and `POST /execute`.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::envelope::Envelope;
use crate::error::{CodeletError, Result};
use crate::sandbox::{CapabilityPolicy, SandboxBackend};
use crate::validate::{validate, ExecutionRequest};

pub const BANNER: &str = "Code Executor Server is running";

/// Shared by every request. Nothing in it is mutable.
#[derive(Clone)]
pub struct AppState {
    pub backend: Arc<dyn SandboxBackend>,
    pub policy: Arc<CapabilityPolicy>,
}

impl AppState {
    pub fn new(backend: Arc<dyn SandboxBackend>, policy: Arc<CapabilityPolicy>) -> Self {
        Self { backend, policy }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(banner))
        .route("/execute", post(execute))
        .with_state(state)
}

async fn banner() -> &'static str {
    BANNER
}

async fn execute(
    State(state): State<AppState>,
    body: std::result::Result<Json<serde_json::Value>, JsonRejection>,
) -> Response {
    let envelope = match body {
        Ok(Json(body)) => run_request(&state, &body).await,
        Err(rejection) => {
            debug!(error = %rejection.body_text(), "Unreadable request body");
            Envelope::invalid_body(rejection.body_text())
        }
    };
    respond(envelope)
}

async fn run_request(state: &AppState, body: &serde_json::Value) -> Envelope {
    let request = ExecutionRequest::from_json(body);
    let code = match validate(&request, &state.policy) {
        Ok(code) => code,
        Err(rejection) => {
            info!(reason = %rejection, "Execution request rejected");
            return Envelope::rejected(rejection);
        }
    };

    info!(
        backend = state.backend.name(),
        code_chars = code.as_str().chars().count(),
        "Execution request received"
    );
    Envelope::from_outcome(state.backend.execute(code).await)
}

fn respond(envelope: Envelope) -> Response {
    let status =
        StatusCode::from_u16(envelope.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(envelope.body())).into_response()
}

pub async fn bind(host: &str, port: u16) -> Result<TcpListener> {
    let addr = format!("{}:{}", host, port);
    TcpListener::bind(&addr)
        .await
        .map_err(|source| CodeletError::Bind { addr, source })
}

/// Serve until ctrl-c or SIGTERM.
pub async fn serve(listener: TcpListener, state: AppState) -> Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, backend = state.backend.name(), "Code executor listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::CapturedOutput;
    use crate::sandbox::{BackendCapabilities, ExecutionOutcome};
    use crate::validate::ValidatedCode;
    use async_trait::async_trait;

    /// Echoes the snippet back as its result.
    struct EchoBackend;

    #[async_trait]
    impl SandboxBackend for EchoBackend {
        fn name(&self) -> &str {
            "echo"
        }

        fn capabilities(&self) -> BackendCapabilities {
            BackendCapabilities::default()
        }

        async fn execute(&self, code: ValidatedCode) -> ExecutionOutcome {
            ExecutionOutcome::Completed {
                output: CapturedOutput {
                    result: code.into_inner(),
                    error: String::new(),
                },
            }
        }
    }

    async fn spawn_echo() -> String {
        let policy = Arc::new(CapabilityPolicy::default().with_max_code_length(8));
        let state = AppState::new(Arc::new(EchoBackend), policy);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_banner() {
        let base = spawn_echo().await;
        let body = reqwest::get(&base).await.unwrap().text().await.unwrap();
        assert_eq!(body, BANNER);
    }

    #[tokio::test]
    async fn test_execute_routes_through_backend() {
        let base = spawn_echo().await;
        let response = reqwest::Client::new()
            .post(format!("{}/execute", base))
            .json(&serde_json::json!({ "code": " 42 " }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body, serde_json::json!({ "result": "42", "error": "" }));
    }

    #[tokio::test]
    async fn test_execute_rejects_before_backend() {
        let base = spawn_echo().await;
        let response = reqwest::Client::new()
            .post(format!("{}/execute", base))
            .json(&serde_json::json!({ "code": "123456789" }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(
            body,
            serde_json::json!({ "error": "Code exceeds maximum length of 8 characters" })
        );
    }

    #[tokio::test]
    async fn test_invalid_json_body() {
        let base = spawn_echo().await;
        let response = reqwest::Client::new()
            .post(format!("{}/execute", base))
            .header("content-type", "application/json")
            .body("{not json")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);
        let body: serde_json::Value = response.json().await.unwrap();
        assert!(body["error"]
            .as_str()
            .unwrap()
            .starts_with("Invalid JSON body: "));
    }
}
