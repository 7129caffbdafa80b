use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use warroom_core::identity::Identity;

use crate::handlers::{self, HandlerState};
use crate::observer;

/// Upstream-validated caller email.
pub const IDENTITY_HEADER: &str = "x-warroom-identity";

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 9191,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub handler_state: Arc<HandlerState>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Bind and serve until `shutdown` is cancelled.
pub async fn start(
    config: ServerConfig,
    handler_state: Arc<HandlerState>,
    shutdown: CancellationToken,
) -> Result<ServerHandle, std::io::Error> {
    let router = build_router(AppState { handler_state });
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(addr = %local_addr, "war-room server started");

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
        {
            tracing::error!(error = %e, "server terminated");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        server,
    })
}

pub struct ServerHandle {
    pub port: u16,
    server: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// Wait for the serve loop to finish after shutdown.
    pub async fn join(self) {
        if let Err(e) = self.server.await {
            tracing::error!(error = %e, "server task failed");
        }
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let caller = resolve_caller(&state.handler_state, &headers).await;
    let handler_state = state.handler_state;
    ws.on_upgrade(move |socket| observer::run_connection(socket, handler_state, caller))
}

/// A missing or unresolvable header leaves the connection anonymous.
async fn resolve_caller(state: &Arc<HandlerState>, headers: &HeaderMap) -> Option<Identity> {
    let email = headers
        .get(IDENTITY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|e| !e.is_empty())?
        .to_owned();
    let state = Arc::clone(state);
    match tokio::task::spawn_blocking(move || state.identify(&email)).await {
        Ok(Ok(identity)) => Some(identity),
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "failed to resolve caller identity");
            None
        }
        Err(e) => {
            tracing::error!(error = %e, "identity lookup panicked");
            None
        }
    }
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let resp = handlers::dispatch(&state.handler_state, "health", &serde_json::json!({}), None, None);
    let healthy = resp
        .result
        .as_ref()
        .and_then(|r| r.get("status"))
        .and_then(|s| s.as_str())
        == Some("healthy");
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, axum::Json(resp.result.unwrap_or_default()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::tests::setup;

    #[tokio::test]
    async fn server_starts_and_serves_health() {
        let (state, _) = setup();
        let shutdown = CancellationToken::new();
        let config = ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
        };
        let handle = start(config, state, shutdown.clone()).await.unwrap();
        assert!(handle.port > 0);

        let url = format!("http://127.0.0.1:{}/health", handle.port);
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["components"]["database"], "ok");

        shutdown.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle.join())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn caller_resolved_from_header() {
        let (state, _) = setup();
        let mut headers = HeaderMap::new();
        assert!(resolve_caller(&state, &headers).await.is_none());

        headers.insert(IDENTITY_HEADER, "  Admin@Corp.io ".parse().unwrap());
        let caller = resolve_caller(&state, &headers).await.unwrap();
        assert_eq!(caller.email, "admin@corp.io");
        assert_eq!(caller.role, warroom_core::identity::Role::Admin);

        headers.insert(IDENTITY_HEADER, "new@corp.io".parse().unwrap());
        let caller = resolve_caller(&state, &headers).await.unwrap();
        assert_eq!(caller.role, warroom_core::identity::Role::User);
    }

    #[test]
    fn router_builds() {
        let (state, _) = setup();
        let _router = build_router(AppState { handler_state: state });
    }
}
