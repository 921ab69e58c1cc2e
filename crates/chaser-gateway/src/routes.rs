//! API route handlers for the gateway.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chaser_core::ChaseError;
use chaser_scheduler::ManualOutcome;
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;

use super::server::{AppState, json_error};

/// Config problems are 503 with the message; anything else is a masked 500.
fn chase_error(context: &str, e: &ChaseError) -> Response {
    if e.is_config() {
        tracing::error!("[{context}] {e}");
        return json_error(StatusCode::SERVICE_UNAVAILABLE, &e.to_string());
    }
    tracing::error!("[{context}] {e}");
    json_error(StatusCode::INTERNAL_SERVER_ERROR, "An internal error occurred")
}

/// Health check endpoint.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "chaser-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "mailer": state.dispatcher.mailer_name(),
        "dry_run": state.dispatcher.settings().dry_run,
    }))
}

/// Run one chase batch.
pub async fn trigger_chase(State(state): State<Arc<AppState>>) -> Response {
    match state.dispatcher.run_batch(Utc::now()).await {
        Ok(report) => Json(serde_json::json!({"ok": true, "report": report})).into_response(),
        Err(e) => chase_error("cron chase", &e),
    }
}

#[derive(Debug, Deserialize)]
pub struct ChaseInvoiceBody {
    pub tenant_id: String,
}

/// Manually chase one invoice on behalf of its tenant.
pub async fn chase_invoice(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<ChaseInvoiceBody>,
) -> Response {
    let tenant_id = body.tenant_id.trim();
    if tenant_id.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "tenant_id is required");
    }

    let outcome = match state.dispatcher.chase_one(&id, tenant_id, Utc::now()).await {
        Ok(o) => o,
        Err(e) => return chase_error("manual chase", &e),
    };
    let status = match &outcome {
        ManualOutcome::Sent { .. } | ManualOutcome::DryRun { .. } => StatusCode::OK,
        ManualOutcome::InvoiceNotFound => StatusCode::NOT_FOUND,
        ManualOutcome::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        ManualOutcome::SendFailed { .. } => StatusCode::BAD_GATEWAY,
        ManualOutcome::LedgerWriteFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        ManualOutcome::InvoiceNotPending { .. }
        | ManualOutcome::MissingCustomerEmail
        | ManualOutcome::InitialEmailRequired
        | ManualOutcome::NothingDue { .. } => StatusCode::CONFLICT,
    };
    (
        status,
        Json(serde_json::json!({
            "ok": outcome.is_success(),
            "reason": outcome.code(),
            "outcome": outcome,
        })),
    )
        .into_response()
}

#[derive(Debug, Default, Deserialize)]
pub struct ScheduleQuery {
    pub tenant_id: Option<String>,
}

/// Theoretical timeline plus the ledger-aware next email.
pub async fn invoice_schedule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<ScheduleQuery>,
) -> Response {
    let tenant = query.tenant_id.as_deref().map(str::trim).filter(|t| !t.is_empty());
    match state.dispatcher.preview(&id, tenant, Utc::now()).await {
        Ok(Some(preview)) => {
            Json(serde_json::json!({"ok": true, "schedule": preview})).into_response()
        }
        Ok(None) => json_error(StatusCode::NOT_FOUND, "Invoice not found"),
        Err(e) => chase_error("schedule preview", &e),
    }
}
