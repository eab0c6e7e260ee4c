pub mod bootstrap;
pub mod models;

use axum::{
    Router,
    routing::{get, post},
};

use crate::AppState;
use crate::cache::Cache;

pub fn router<C: Cache>(state: AppState<C>) -> Router {
    Router::new()
        .route("/api/v1/bootstrap", post(bootstrap::bootstrap::<C>))
        .route("/api/v1/topics/patterns", get(bootstrap::subscription_patterns))
        .route("/api/v1/registry/stats", get(bootstrap::registry_stats::<C>))
        .route(
            "/api/v1/registry/tenants/{tenant_id}",
            get(bootstrap::tenant_registration::<C>),
        )
        .route(
            "/api/v1/registry/tenants/{tenant_id}/invalidate",
            post(bootstrap::invalidate_tenant::<C>),
        )
        .with_state(state)
}
