use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::sse::{KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use futures_util::StreamExt;
use rasp_core::{ChatId, RaspError, UserId};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::sse::ChannelSink;
use crate::ServiceState;

const EVENT_CHANNEL_CAPACITY: usize = 32;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Deserialize)]
pub struct StreamQuery {
    q: Option<String>,
}

/// Stand-in for the surrounding auth middleware (out of scope per spec):
/// trusts an upstream-set `X-User-Id` header and rejects its absence with
/// 401, the one piece of the auth boundary RASP's own router must define
/// to have something to pass to `Extension<UserId>`.
pub async fn require_user_id(mut req: Request, next: Next) -> Response {
    let user_id = req
        .headers()
        .get("X-User-Id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<UserId>().ok());

    match user_id {
        Some(user_id) => {
            req.extensions_mut().insert(user_id);
            next.run(req).await
        }
        None => (StatusCode::UNAUTHORIZED, Json(json!({ "error": "missing identity" }))).into_response(),
    }
}

pub async fn stream_chat(
    State(state): State<ServiceState>,
    Path(chat_id): Path<ChatId>,
    Query(query): Query<StreamQuery>,
    Extension(user_id): Extension<UserId>,
) -> Response {
    let prompt = query.q.unwrap_or_default();

    let charge = match state.orchestrator.admit_and_reserve(user_id, chat_id, &prompt).await {
        Ok(charge) => charge,
        Err(err) => return ApiError(err).into_response(),
    };

    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let orchestrator = state.orchestrator.clone();

    tokio::spawn(async move {
        let mut sink = ChannelSink::new(tx);
        let cancel = CancellationToken::new();
        if let Err(err) = orchestrator
            .run_and_refund_on_error(user_id, chat_id, &prompt, charge, &mut sink, cancel)
            .await
        {
            sink.emit_error(&err).await;
        }
    });

    let stream = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(HEARTBEAT_INTERVAL).text(" ping"))
        .into_response()
}

pub async fn healthz(State(state): State<ServiceState>) -> Response {
    match state.vector_store.ping().await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "error": err.to_string() }))).into_response(),
    }
}

/// Maps the pipeline's error taxonomy onto HTTP status codes and a JSON
/// body (spec §6/§7), generalizing the teacher's
/// `Result<Response, (StatusCode, String)>` handler style into a typed
/// `IntoResponse` impl.
struct ApiError(RaspError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            RaspError::Validation(_) => StatusCode::BAD_REQUEST,
            RaspError::NotOwner { .. } => StatusCode::FORBIDDEN,
            RaspError::InsufficientBalance { .. } => StatusCode::PAYMENT_REQUIRED,
            RaspError::Network(_)
            | RaspError::ProviderNon2xx(_)
            | RaspError::RateLimit { .. }
            | RaspError::Quota(_)
            | RaspError::ModelUnavailable(_)
            | RaspError::Timeout(_) => StatusCode::SERVICE_UNAVAILABLE,
            RaspError::Config(_) | RaspError::Storage(_) | RaspError::Internal(_) | RaspError::Cancelled => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = match &self.0 {
            RaspError::InsufficientBalance { required } => json!({ "required": required }),
            other => json!({ "error": other.to_string() }),
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_balance_maps_to_payment_required() {
        let response = ApiError(RaspError::InsufficientBalance { required: 50 }).into_response();
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
    }

    #[test]
    fn not_owner_maps_to_forbidden() {
        let response = ApiError(RaspError::NotOwner { user_id: 1, chat_id: 2 }).into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn provider_outage_maps_to_service_unavailable() {
        let response = ApiError(RaspError::ModelUnavailable("down".into())).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn storage_failure_maps_to_internal_server_error() {
        let response = ApiError(RaspError::Storage("disk full".into())).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
