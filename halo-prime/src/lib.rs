pub mod api;
pub mod bootstrap;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod credentials;
pub mod error;
pub mod idempotency;
pub mod ota;
pub mod policy;
pub mod template;
pub mod tenant;

use std::sync::Arc;

use jiff::SignedDuration;
use tracing::{info, warn};

use crate::bootstrap::BootstrapOrchestrator;
use crate::cache::Cache;
use crate::config::Config;
use crate::credentials::{CredentialIssuer, RandomCredentialIssuer};
use crate::idempotency::IdempotencyGuard;
use crate::policy::PolicyRegistry;

// AppState must be defined in lib.rs to be visible to all modules
pub struct AppState<C: Cache> {
    pub guard: Arc<IdempotencyGuard<C>>,
    pub registry: Arc<PolicyRegistry>,
}

impl<C: Cache> Clone for AppState<C> {
    fn clone(&self) -> Self {
        Self {
            guard: Arc::clone(&self.guard),
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<C: Cache> AppState<C> {
    pub fn new(orchestrator: BootstrapOrchestrator, cache: C) -> Self {
        let registry = Arc::clone(orchestrator.registry());
        Self {
            guard: Arc::new(IdempotencyGuard::new(Arc::new(orchestrator), cache)),
            registry,
        }
    }
}

/// Build the full engine from `config`, issuing passwords with the default
/// random issuer, and warm resolvers for every configured tenant.
pub fn app_state<C: Cache>(config: &Config, cache: C) -> AppState<C> {
    let ttl_secs = i64::try_from(config.credentials.password_ttl_secs).unwrap_or(i64::MAX);
    let credentials: Arc<dyn CredentialIssuer> = Arc::new(RandomCredentialIssuer::new(
        SignedDuration::from_secs(ttl_secs),
        config.credentials.password_length,
    ));

    let orchestrator = BootstrapOrchestrator::from_config(config, credentials);
    let device_types = orchestrator.templates().device_types();

    for tenant_id in config.tenants.keys() {
        let warmed = orchestrator
            .registry()
            .register_tenant_resolvers(tenant_id, device_types.iter().map(String::as_str));
        if let Err(e) = warmed {
            warn!(tenant_id = %tenant_id, error = %e, "failed to warm tenant resolvers");
        }
    }

    info!(
        tenants = config.tenants.len(),
        device_types = device_types.len(),
        mode = ?config.bootstrap.resolution_mode,
        "bootstrap engine ready"
    );

    AppState::new(orchestrator, cache)
}
