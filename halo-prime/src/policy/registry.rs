use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::ResolutionMode;
use crate::error::BootstrapError;
use crate::policy::PolicyResolver;
use crate::template::TemplateStore;
use crate::tenant::TenantPolicyStore;

/// Name carried by resolvers built from the generic template.
pub const FALLBACK_DEVICE_TYPE: &str = "generic";

/// Device types without a template share one fallback slot per tenant, so
/// client-chosen type names never grow the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ResolverSlot {
    DeviceType(String),
    Fallback,
}

type ResolverKey = (String, ResolverSlot);
type ResolverCell = Arc<OnceLock<Arc<PolicyResolver>>>;

/// Read-only snapshot of the registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    /// Tenants with at least one built resolver.
    pub tenants: usize,
    /// Built resolvers currently held.
    pub resolvers: usize,
    /// Resolver builds since start, including invalidated ones.
    pub constructions: u64,
    /// Held resolvers built from the generic fallback.
    pub fallbacks: usize,
}

/// Memoizes one [`PolicyResolver`] per `(tenant, device type)`.
///
/// Each key owns its own once-cell, so concurrent first use of a key builds
/// exactly one resolver while other keys proceed independently. The map's
/// shard lock is only held long enough to fetch the cell.
pub struct PolicyRegistry {
    tenants: Arc<dyn TenantPolicyStore>,
    templates: Arc<TemplateStore>,
    mode: ResolutionMode,
    resolvers: DashMap<ResolverKey, ResolverCell>,
    constructions: AtomicU64,
}

impl PolicyRegistry {
    pub fn new(
        tenants: Arc<dyn TenantPolicyStore>,
        templates: Arc<TemplateStore>,
        mode: ResolutionMode,
    ) -> Self {
        Self {
            tenants,
            templates,
            mode,
            resolvers: DashMap::new(),
            constructions: AtomicU64::new(0),
        }
    }

    pub fn mode(&self) -> ResolutionMode {
        self.mode
    }

    pub fn get_or_create_resolver(
        &self,
        tenant_id: &str,
        device_type: &str,
    ) -> Result<Arc<PolicyResolver>, BootstrapError> {
        let known = self.templates.contains(device_type);
        if !known && self.mode == ResolutionMode::Strict {
            return Err(BootstrapError::UnknownDeviceType {
                device_type: device_type.to_string(),
            });
        }

        let (slot, resolver_type) = if known {
            (ResolverSlot::DeviceType(device_type.to_string()), device_type)
        } else {
            (ResolverSlot::Fallback, FALLBACK_DEVICE_TYPE)
        };

        let cell = self
            .resolvers
            .entry((tenant_id.to_string(), slot))
            .or_default()
            .clone();

        let resolver = cell.get_or_init(|| {
            self.constructions.fetch_add(1, Ordering::Relaxed);
            let policy = self.tenants.policy_or_default(tenant_id);
            debug!(
                tenant_id,
                device_type = resolver_type,
                fallback = !known,
                "building policy resolver"
            );
            Arc::new(PolicyResolver::new(tenant_id, resolver_type, &policy, !known))
        });

        Ok(Arc::clone(resolver))
    }

    /// Build resolvers for `device_types` ahead of the first bootstrap.
    pub fn register_tenant_resolvers<'a>(
        &self,
        tenant_id: &str,
        device_types: impl IntoIterator<Item = &'a str>,
    ) -> Result<usize, BootstrapError> {
        let mut registered = 0;
        for device_type in device_types {
            self.get_or_create_resolver(tenant_id, device_type)?;
            registered += 1;
        }

        info!(tenant_id, registered, "registered tenant resolvers");
        Ok(registered)
    }

    pub fn is_tenant_registered(&self, tenant_id: &str) -> bool {
        self.resolvers
            .iter()
            .any(|entry| entry.key().0 == tenant_id && entry.value().get().is_some())
    }

    /// Device types with a dedicated resolver. The shared fallback is not listed.
    pub fn tenant_device_types(&self, tenant_id: &str) -> Vec<String> {
        let mut types: Vec<String> = self
            .resolvers
            .iter()
            .filter(|entry| entry.key().0 == tenant_id && entry.value().get().is_some())
            .filter_map(|entry| match &entry.key().1 {
                ResolverSlot::DeviceType(device_type) => Some(device_type.clone()),
                ResolverSlot::Fallback => None,
            })
            .collect();
        types.sort();
        types
    }

    pub fn stats(&self) -> RegistryStats {
        let mut tenants = BTreeSet::new();
        let mut resolvers = 0;
        let mut fallbacks = 0;

        for entry in self.resolvers.iter() {
            let Some(resolver) = entry.value().get() else {
                continue;
            };
            tenants.insert(entry.key().0.clone());
            resolvers += 1;
            if resolver.is_fallback() {
                fallbacks += 1;
            }
        }

        RegistryStats {
            tenants: tenants.len(),
            resolvers,
            constructions: self.constructions.load(Ordering::Relaxed),
            fallbacks,
        }
    }

    /// Drop every resolver of one tenant so the next use picks up fresh policy.
    pub fn invalidate_tenant(&self, tenant_id: &str) -> usize {
        let before = self.resolvers.len();
        self.resolvers.retain(|(tenant, _), _| tenant != tenant_id);
        let removed = before.saturating_sub(self.resolvers.len());

        info!(tenant_id, removed, "invalidated tenant resolvers");
        removed
    }

    pub fn clear(&self) {
        self.resolvers.clear();
    }
}
