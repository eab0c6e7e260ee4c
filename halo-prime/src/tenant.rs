use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use halo_core::{FirmwareChannel, Qos};
use serde::Deserialize;
use sha2::{Digest, Sha256};

/// Per-tenant policy snapshot, validated when the config is loaded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TenantPolicy {
    /// Channels this tenant's devices may upgrade from. `None` allows all.
    #[serde(default)]
    pub allowed_channels: Option<Vec<FirmwareChannel>>,
    #[serde(default)]
    pub canary: Option<CanaryConfig>,
    /// Mark every upgrade for this tenant as forced.
    #[serde(default)]
    pub force_upgrade: bool,
    /// QoS/retain overrides keyed by topic suffix (`telemetry`, `shadow/desired`, ...).
    #[serde(default)]
    pub topic_overrides: BTreeMap<String, TopicPolicyOverride>,
}

impl TenantPolicy {
    pub fn allows_channel(&self, channel: FirmwareChannel) -> bool {
        self.allowed_channels
            .as_ref()
            .is_none_or(|allowed| allowed.contains(&channel))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct TopicPolicyOverride {
    pub qos: Qos,
    pub retain: bool,
}

/// Staged rollout: only `percentage` percent of devices on the listed
/// channels are offered an upgrade.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CanaryConfig {
    pub percentage: u8,
    pub channels: Vec<FirmwareChannel>,
}

impl CanaryConfig {
    pub fn applies_to(&self, channel: FirmwareChannel) -> bool {
        self.channels.contains(&channel)
    }

    /// Devices land in a stable bucket in `0..100` derived from tenant and
    /// device id, so the same device always gets the same answer.
    pub fn admits(&self, tenant_id: &str, device_id: &str) -> bool {
        canary_bucket(tenant_id, device_id) < self.percentage
    }
}

pub fn canary_bucket(tenant_id: &str, device_id: &str) -> u8 {
    let digest = Sha256::new()
        .chain_update(tenant_id.as_bytes())
        .chain_update(b":")
        .chain_update(device_id.as_bytes())
        .finalize();
    let value = u16::from_be_bytes([digest[0], digest[1]]);
    (value % 100) as u8
}

/// Source of tenant policy snapshots.
pub trait TenantPolicyStore: Send + Sync + 'static {
    fn get(&self, tenant_id: &str) -> Option<Arc<TenantPolicy>>;

    /// Policy applied to tenants the store does not know.
    fn default_policy(&self) -> Arc<TenantPolicy>;

    fn policy_or_default(&self, tenant_id: &str) -> Arc<TenantPolicy> {
        self.get(tenant_id)
            .unwrap_or_else(|| self.default_policy())
    }
}

/// Tenant policies loaded once from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticTenantPolicyStore {
    policies: HashMap<String, Arc<TenantPolicy>>,
    default: Arc<TenantPolicy>,
}

impl StaticTenantPolicyStore {
    pub fn new(policies: impl IntoIterator<Item = (String, TenantPolicy)>) -> Self {
        Self {
            policies: policies
                .into_iter()
                .map(|(id, policy)| (id, Arc::new(policy)))
                .collect(),
            default: Arc::new(TenantPolicy::default()),
        }
    }
}

impl TenantPolicyStore for StaticTenantPolicyStore {
    fn get(&self, tenant_id: &str) -> Option<Arc<TenantPolicy>> {
        self.policies.get(tenant_id).cloned()
    }

    fn default_policy(&self) -> Arc<TenantPolicy> {
        Arc::clone(&self.default)
    }
}
