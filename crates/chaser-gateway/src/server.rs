//! HTTP server implementation using Axum.

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{
    Json, Router,
    extract::State,
    routing::{get, post},
};
use chaser_core::config::{Environment, GatewayConfig};
use chaser_scheduler::Dispatcher;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared state for the gateway server.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub environment: Environment,
    pub start_time: std::time::Instant,
    /// SHA-256 of the configured cron secret. Requests are compared by digest.
    cron_secret_digest: Option<[u8; 32]>,
}

impl AppState {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        environment: Environment,
        cron_secret: Option<&str>,
    ) -> Self {
        let cron_secret_digest = cron_secret
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| Sha256::digest(s.as_bytes()).into());
        Self {
            dispatcher,
            environment,
            start_time: std::time::Instant::now(),
            cron_secret_digest,
        }
    }

    pub fn has_cron_secret(&self) -> bool {
        self.cron_secret_digest.is_some()
    }
}

pub(crate) fn json_error(status: StatusCode, msg: &str) -> Response {
    (status, Json(serde_json::json!({"ok": false, "error": msg}))).into_response()
}

/// Secret from `X-Cron-Secret`, falling back to `Authorization: Bearer`.
fn presented_secret(headers: &HeaderMap) -> Option<&str> {
    if let Some(v) = headers.get("X-Cron-Secret").and_then(|v| v.to_str().ok()) {
        return Some(v.trim());
    }
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}

/// Cron secret middleware for trigger and invoice routes.
async fn require_cron_secret(
    State(state): State<Arc<AppState>>,
    req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Response {
    let Some(expected) = &state.cron_secret_digest else {
        if state.environment.is_production() {
            tracing::error!(
                "🚫 No cron secret configured, refusing {} in production",
                req.uri().path()
            );
            return json_error(StatusCode::SERVICE_UNAVAILABLE, "Cron secret not configured");
        }
        tracing::warn!(
            "⚠️ No cron secret configured, allowing {} (development)",
            req.uri().path()
        );
        return next.run(req).await;
    };

    let authorized = presented_secret(req.headers())
        .is_some_and(|p| Sha256::digest(p.as_bytes()).as_slice() == expected.as_slice());
    if authorized {
        return next.run(req).await;
    }

    tracing::warn!("🔒 Rejected {}: invalid or missing cron secret", req.uri().path());
    json_error(StatusCode::UNAUTHORIZED, "Unauthorized: invalid or missing cron secret")
}

/// Build the router with all routes.
pub fn build_router(state: AppState) -> Router {
    let shared = Arc::new(state);

    // Protected routes: require the cron secret
    let protected = Router::new()
        .route("/api/v1/cron/chase", post(super::routes::trigger_chase))
        .route(
            "/api/v1/invoices/{id}/chase",
            post(super::routes::chase_invoice),
        )
        .route(
            "/api/v1/invoices/{id}/schedule",
            get(super::routes::invoice_schedule),
        )
        .route_layer(axum::middleware::from_fn_with_state(
            shared.clone(),
            require_cron_secret,
        ));

    // Public routes: no auth
    let public = Router::new().route("/health", get(super::routes::health_check));

    protected
        .merge(public)
        .layer({
            let cors = CorsLayer::new()
                .allow_methods([
                    axum::http::Method::GET,
                    axum::http::Method::POST,
                    axum::http::Method::OPTIONS,
                ])
                .allow_headers(Any)
                .max_age(std::time::Duration::from_secs(3600));

            // Example: CHASER_CORS_ORIGINS=https://app.example.com,https://admin.example.com
            if let Ok(origins_str) = std::env::var("CHASER_CORS_ORIGINS") {
                let origins: Vec<_> = origins_str
                    .split(',')
                    .filter_map(|s| s.trim().parse::<axum::http::HeaderValue>().ok())
                    .collect();
                cors.allow_origin(origins)
            } else {
                cors.allow_origin(Any)
            }
        })
        .layer(TraceLayer::new_for_http())
        .with_state(shared)
}

/// Start the HTTP server. Returns after Ctrl-C.
pub async fn start(config: &GatewayConfig, state: AppState) -> anyhow::Result<()> {
    if !state.has_cron_secret() {
        if state.environment.is_production() {
            tracing::warn!("⚠️ No cron secret set: protected routes will answer 503");
        } else {
            tracing::warn!("⚠️ No cron secret set: protected routes are open (development)");
        }
    }
    let app = build_router(state);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("🌐 Chaser gateway listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("👋 Shutting down gateway");
        })
        .await?;
    Ok(())
}
