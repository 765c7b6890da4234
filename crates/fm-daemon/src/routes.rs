//! HTTP surface: router construction and every handler.
//!
//! The router is built bare — no CORS or tracing layers — so scenario tests
//! can drive it in-process with `tower::ServiceExt::oneshot`; the binary
//! stacks its middleware on top in `main.rs`.

use std::{convert::Infallible, sync::Arc};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, post},
    Json, Router,
};
use futures_util::{Stream, StreamExt};
use tokio_stream::wrappers::BroadcastStream;
use tracing::info;
use uuid::Uuid;

use fm_pipeline::{CancelOutcome, PipelineError, StartOutcome, StartRequest};

use crate::{
    api_types::{
        BalanceResponse, CancelResponse, CreditBody, ErrorResponse, HealthResponse,
        OperationResponse, RegisterAssetBody, RegisterAssetResponse, StartOperationBody,
        StatusResponse,
    },
    state::{new_asset_id, AppState},
};

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Wire every route to the shared state.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/status", get(status_handler))
        .route("/v1/events", get(events_stream))
        .route("/v1/assets", post(register_asset))
        .route("/v1/operations", post(start_operation))
        .route("/v1/operations/:id", get(get_operation))
        .route("/v1/operations/:id", delete(cancel_operation))
        .route("/v1/users/:id/balance", get(get_balance))
        .route("/v1/users/:id/credits", post(add_credits))
        .with_state(state)
}

/// Map pipeline failures to HTTP. Conflict is not a failure: the existing
/// row comes back with 200.
fn error_response(err: PipelineError) -> Response {
    let (status, kind) = match &err {
        PipelineError::Validation(_) => (StatusCode::UNPROCESSABLE_ENTITY, "validation"),
        PipelineError::NotOwned => (StatusCode::FORBIDDEN, "not_owned"),
        PipelineError::NotFound => (StatusCode::NOT_FOUND, "not_found"),
        PipelineError::InsufficientFunds { .. } => {
            (StatusCode::PAYMENT_REQUIRED, "insufficient_funds")
        }
        PipelineError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
    };

    if let PipelineError::Internal(ref e) = err {
        tracing::error!(error = %format!("{e:#}"), "request failed internally");
    }

    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
            kind: kind.to_string(),
        }),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// GET /v1/health
// ---------------------------------------------------------------------------

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            service: st.build.service,
            version: st.build.version,
        }),
    )
}

// ---------------------------------------------------------------------------
// GET /v1/status
// ---------------------------------------------------------------------------

pub(crate) async fn status_handler(State(st): State<Arc<AppState>>) -> Response {
    let db_ok = fm_db::status(&st.pool)
        .await
        .map(|s| s.schema_ready())
        .unwrap_or(false);
    let ready_jobs = fm_db::queue::ready_count(&st.pool).await.unwrap_or(-1);

    (
        StatusCode::OK,
        Json(StatusResponse {
            daemon_uptime_secs: st.uptime_secs(),
            db_ok,
            ready_jobs,
        }),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// POST /v1/assets
// ---------------------------------------------------------------------------

/// Register an uploaded asset's metadata. The upload layer has already
/// probed dimensions; the core only records them.
pub(crate) async fn register_asset(
    State(st): State<Arc<AppState>>,
    Json(body): Json<RegisterAssetBody>,
) -> Response {
    let asset_id = new_asset_id();

    let res = fm_db::assets::insert_asset(
        &st.pool,
        &fm_db::assets::NewAsset {
            asset_id: asset_id.clone(),
            owner_id: body.owner_id,
            kind: body.kind,
            extension: body.extension.trim_start_matches('.').to_ascii_lowercase(),
            width: body.width,
            height: body.height,
            duration_secs: body.duration_secs,
            metadata: body.metadata,
        },
    )
    .await;

    match res {
        Ok(()) => {
            info!(asset_id = %asset_id, "asset registered");
            (StatusCode::CREATED, Json(RegisterAssetResponse { asset_id })).into_response()
        }
        Err(e) => error_response(PipelineError::Internal(e)),
    }
}

// ---------------------------------------------------------------------------
// POST /v1/operations
// ---------------------------------------------------------------------------

pub(crate) async fn start_operation(
    State(st): State<Arc<AppState>>,
    Json(body): Json<StartOperationBody>,
) -> Response {
    let req = StartRequest {
        user_id: body.user_id,
        asset_id: body.asset_id,
        params: body.params,
    };

    match st.pipeline.start_operation(&req).await {
        Ok(StartOutcome::Started(op)) => {
            (StatusCode::CREATED, Json(OperationResponse::from(op))).into_response()
        }
        Ok(StartOutcome::Existing(op)) => {
            (StatusCode::OK, Json(OperationResponse::from(op))).into_response()
        }
        Err(e) => error_response(e),
    }
}

// ---------------------------------------------------------------------------
// GET /v1/operations/:id
// ---------------------------------------------------------------------------

pub(crate) async fn get_operation(
    State(st): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Response {
    match st.pipeline.get_operation(id).await {
        Ok(op) => (StatusCode::OK, Json(OperationResponse::from(op))).into_response(),
        Err(e) => error_response(e),
    }
}

// ---------------------------------------------------------------------------
// DELETE /v1/operations/:id
// ---------------------------------------------------------------------------

pub(crate) async fn cancel_operation(
    State(st): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Response {
    match st.pipeline.cancel_operation(id).await {
        Ok(outcome) => {
            let outcome = match outcome {
                CancelOutcome::Cancelled => "cancelled",
                CancelOutcome::AlreadyTerminal => "already_terminal",
            };
            (
                StatusCode::OK,
                Json(CancelResponse {
                    operation_id: id,
                    outcome: outcome.to_string(),
                }),
            )
                .into_response()
        }
        Err(e) => error_response(e),
    }
}

// ---------------------------------------------------------------------------
// GET /v1/users/:id/balance
// ---------------------------------------------------------------------------

pub(crate) async fn get_balance(
    State(st): State<Arc<AppState>>,
    Path(user_id): Path<Uuid>,
) -> Response {
    match st.pipeline.balance(user_id).await {
        Ok(balance) => {
            (StatusCode::OK, Json(BalanceResponse { user_id, balance })).into_response()
        }
        Err(e) => error_response(e),
    }
}

// ---------------------------------------------------------------------------
// POST /v1/users/:id/credits
// ---------------------------------------------------------------------------

pub(crate) async fn add_credits(
    State(st): State<Arc<AppState>>,
    Path(user_id): Path<Uuid>,
    Json(body): Json<CreditBody>,
) -> Response {
    match st
        .pipeline
        .grant_credits(user_id, body.amount, &body.description)
        .await
    {
        Ok(balance) => {
            (StatusCode::OK, Json(BalanceResponse { user_id, balance })).into_response()
        }
        Err(e) => error_response(e),
    }
}

// ---------------------------------------------------------------------------
// GET /v1/events (SSE)
// ---------------------------------------------------------------------------

pub(crate) async fn events_stream(
    State(st): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = st.bus.subscribe();

    let stream = BroadcastStream::new(rx).filter_map(|msg| async move {
        match msg {
            Ok(bus_msg) => {
                let event = Event::default()
                    .json_data(&bus_msg)
                    .unwrap_or_else(|_| Event::default().data("serialization error"));
                Some(Ok(event))
            }
            // Slow consumers skip missed messages rather than erroring.
            Err(_) => None,
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
