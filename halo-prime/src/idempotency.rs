use std::sync::Arc;
use std::time::Duration;

use halo_core::topic::KEY_DELIMITER;
use halo_core::{BootstrapEnvelope, DeviceIdentity};
use jiff::Timestamp;
use tracing::{debug, info, warn};

use crate::bootstrap::{BootstrapOrchestrator, resolve_tenant};
use crate::cache::Cache;
use crate::error::BootstrapError;

const MAX_MESSAGE_ID_LEN: usize = 128;

/// Tenant and device ids never contain [`KEY_DELIMITER`]; message ids are
/// checked by [`validate_message_id`] before a key is built.
pub fn idempotency_key(tenant_id: &str, device_id: &str, message_id: &str) -> String {
    let d = KEY_DELIMITER;
    format!("idempotency{d}{tenant_id}{d}{device_id}{d}{message_id}")
}

pub fn validate_message_id(message_id: &str) -> Result<(), BootstrapError> {
    if message_id.len() > MAX_MESSAGE_ID_LEN {
        return Err(BootstrapError::validation(
            "messageId",
            format!("must be at most {MAX_MESSAGE_ID_LEN} bytes"),
        ));
    }
    if message_id.contains(KEY_DELIMITER) || message_id.chars().any(char::is_control) {
        return Err(BootstrapError::validation(
            "messageId",
            format!("{message_id:?} contains ':' or control characters"),
        ));
    }
    Ok(())
}

/// Replays the first successful envelope for a `(tenant, device, messageId)`
/// triple until it expires.
///
/// The cache is an optimisation only. Any cache failure is logged and the
/// request is answered from a fresh orchestration.
pub struct IdempotencyGuard<C: Cache> {
    orchestrator: Arc<BootstrapOrchestrator>,
    cache: C,
}

impl<C: Cache> IdempotencyGuard<C> {
    pub fn new(orchestrator: Arc<BootstrapOrchestrator>, cache: C) -> Self {
        Self {
            orchestrator,
            cache,
        }
    }

    pub fn orchestrator(&self) -> &BootstrapOrchestrator {
        &self.orchestrator
    }

    pub fn cache(&self) -> &C {
        &self.cache
    }

    pub async fn handle(
        &self,
        identity: &DeviceIdentity,
        tenant_id: Option<&str>,
        message_id: Option<&str>,
    ) -> BootstrapEnvelope {
        let message_id = message_id.map(str::trim).filter(|id| !id.is_empty());

        if let Some(Err(err)) = message_id.map(validate_message_id) {
            warn!(device_id = %identity.device_id, error = %err, "bootstrap rejected");
            let tenant = tenant_id.or(identity.tenant_id.as_deref());
            return self
                .orchestrator
                .build_error_envelope(&err, Some(&*identity.device_id), tenant);
        }

        // Without a message id or a tenant there is nothing to correlate on;
        // the orchestrator reports the missing tenant itself.
        let correlation = message_id.zip(resolve_tenant(identity, tenant_id).ok());
        let Some((message_id, tenant)) = correlation else {
            return self
                .orchestrator
                .process_bootstrap_request(identity, tenant_id)
                .await;
        };

        let key = idempotency_key(&tenant, &identity.device_id, message_id);
        let mut stale = false;

        match self.cache.get(&key).await {
            Ok(Some(raw)) => match serde_json::from_str::<BootstrapEnvelope>(&raw) {
                Ok(cached) if self.is_replayable(&cached, &tenant, &identity.device_id) => {
                    info!(%key, "replaying cached bootstrap envelope");
                    return cached;
                }
                Ok(_) => {
                    debug!(%key, "cached envelope no longer servable");
                    stale = true;
                }
                Err(err) => {
                    warn!(%key, error = %err, "discarding unreadable cached envelope");
                    stale = true;
                }
            },
            Ok(None) => {}
            Err(err) => warn!(%key, error = %err, "idempotency cache read failed"),
        }

        let envelope = self
            .orchestrator
            .process_bootstrap_request(identity, tenant_id)
            .await;

        if !envelope.is_success() {
            return envelope;
        }

        let Some(ttl) = remaining_validity(&envelope) else {
            return envelope;
        };

        let raw = match serde_json::to_string(&envelope) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(%key, error = %err, "failed to encode envelope for caching");
                return envelope;
            }
        };

        if stale {
            if let Err(err) = self.cache.set(&key, raw, ttl).await {
                warn!(%key, error = %err, "idempotency cache write failed");
            }
            return envelope;
        }

        match self.cache.insert_if_absent(&key, raw.clone(), ttl).await {
            Ok(stored) if stored == raw => envelope,
            Ok(stored) => match serde_json::from_str::<BootstrapEnvelope>(&stored) {
                Ok(winner) if self.is_replayable(&winner, &tenant, &identity.device_id) => {
                    debug!(%key, "concurrent bootstrap won the race, using its envelope");
                    winner
                }
                _ => envelope,
            },
            Err(err) => {
                warn!(%key, error = %err, "idempotency cache write failed");
                envelope
            }
        }
    }

    /// Only an unexpired envelope we signed for this exact device is replayed.
    fn is_replayable(&self, cached: &BootstrapEnvelope, tenant_id: &str, device_id: &str) -> bool {
        let issued_to_caller = cached
            .data
            .as_ref()
            .is_some_and(|data| data.cfg.tenant_id == tenant_id && data.cfg.device_id == device_id);

        issued_to_caller
            && cached.is_servable_at(Timestamp::now())
            && self.orchestrator.verify_signature(cached)
    }
}

fn remaining_validity(envelope: &BootstrapEnvelope) -> Option<Duration> {
    let remaining = envelope.expires_at()?.duration_since(Timestamp::now());
    Duration::try_from(remaining)
        .ok()
        .filter(|ttl| !ttl.is_zero())
}
