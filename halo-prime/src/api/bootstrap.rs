use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use halo_core::BootstrapEnvelope;
use tracing::{Instrument, info_span, warn};
use ulid::Ulid;

use super::models::{
    ApiResponse, BootstrapRequest, InvalidationResponse, TenantRegistrationResponse,
};
use crate::AppState;
use crate::cache::Cache;
use crate::error::BootstrapError;
use crate::policy::RegistryStats;

// The HTTP status always mirrors the envelope code.
fn envelope_response(envelope: BootstrapEnvelope) -> Response {
    let status = StatusCode::from_u16(envelope.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(envelope)).into_response()
}

fn success_response<T: serde::Serialize>(data: T) -> Response {
    let api_response = ApiResponse {
        success: true,
        data: Some(data),
        message: None,
    };
    (StatusCode::OK, Json(api_response)).into_response()
}

pub async fn bootstrap<C: Cache>(State(state): State<AppState<C>>, body: Bytes) -> Response {
    let request_id = Ulid::new();
    let span = info_span!("bootstrap_request", %request_id);

    async move {
        let request = match serde_json::from_slice::<BootstrapRequest>(&body) {
            Ok(request) => request,
            Err(err) => {
                warn!(error = %err, "malformed bootstrap request");
                let err = BootstrapError::validation("body", err.to_string());
                let envelope = state.guard.orchestrator().build_error_envelope(&err, None, None);
                return envelope_response(envelope);
            }
        };

        let envelope = state
            .guard
            .handle(
                &request.identity,
                request.tenant_id.as_deref(),
                request.message_id.as_deref(),
            )
            .await;

        envelope_response(envelope)
    }
    .instrument(span)
    .await
}

pub async fn subscription_patterns() -> Response {
    success_response(halo_core::topic::subscription_patterns())
}

pub async fn registry_stats<C: Cache>(State(state): State<AppState<C>>) -> Response {
    let stats: RegistryStats = state.registry.stats();
    success_response(stats)
}

pub async fn tenant_registration<C: Cache>(
    State(state): State<AppState<C>>,
    Path(tenant_id): Path<String>,
) -> Response {
    success_response(TenantRegistrationResponse {
        registered: state.registry.is_tenant_registered(&tenant_id),
        device_types: state.registry.tenant_device_types(&tenant_id),
        tenant_id,
    })
}

pub async fn invalidate_tenant<C: Cache>(
    State(state): State<AppState<C>>,
    Path(tenant_id): Path<String>,
) -> Response {
    let removed = state.registry.invalidate_tenant(&tenant_id);
    success_response(InvalidationResponse { tenant_id, removed })
}
