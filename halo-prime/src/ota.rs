use std::sync::Arc;

use halo_core::{
    DeviceIdentity, FirmwareChannel, FirmwareConstraints, NetworkRequirement, OtaDecision,
    OtaPriority, TargetFirmware, TimeWindow,
};
use semver::Version;
use serde::Deserialize;
use tracing::debug;

use crate::catalog::{ArtifactCatalog, FirmwareArtifact};
use crate::config::ChannelMap;
use crate::tenant::TenantPolicyStore;

/// Install constraints attached to every image offered on one channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ConstraintTemplate {
    #[serde(default)]
    pub min_battery_pct: u8,
    #[serde(default)]
    pub network: NetworkRequirement,
    #[serde(default)]
    pub time_window: Option<TimeWindow>,
    /// When unset, the device's own hardware version is echoed back.
    #[serde(default)]
    pub hardware_version: Option<String>,
}

/// Decides whether a device should upgrade and to what.
///
/// Never fails: malformed firmware data, unknown channels and unknown tenants
/// all degrade to "no upgrade".
pub struct OtaDecisionEngine {
    catalog: Arc<dyn ArtifactCatalog>,
    tenants: Arc<dyn TenantPolicyStore>,
    repo_base: String,
    templates: ChannelMap<ConstraintTemplate>,
}

impl OtaDecisionEngine {
    pub fn new(
        catalog: Arc<dyn ArtifactCatalog>,
        tenants: Arc<dyn TenantPolicyStore>,
        repo_base: impl Into<String>,
        templates: ChannelMap<ConstraintTemplate>,
    ) -> Self {
        Self {
            catalog,
            tenants,
            repo_base: repo_base.into(),
            templates,
        }
    }

    pub fn decide(&self, identity: &DeviceIdentity, tenant_id: &str) -> OtaDecision {
        let device_id = &*identity.device_id;
        let firmware = &identity.firmware;

        let Some(channel) = firmware.channel else {
            debug!(tenant_id, device_id, "no usable firmware channel, skipping ota");
            return OtaDecision::unavailable(OtaPriority::Low);
        };

        let policy = self.tenants.policy_or_default(tenant_id);
        if !policy.allows_channel(channel) {
            debug!(tenant_id, device_id, %channel, "channel not allowed for tenant");
            return OtaDecision::unavailable(OtaPriority::Low);
        }

        let Some(artifact) = self.catalog.latest(channel) else {
            return OtaDecision::unavailable(OtaPriority::Low);
        };

        let Some(current) = firmware.current.as_deref() else {
            debug!(tenant_id, device_id, "no current firmware version, skipping ota");
            return OtaDecision::unavailable(OtaPriority::Low);
        };

        if !is_newer(&artifact.version, current) {
            return OtaDecision::unavailable(OtaPriority::Low);
        }

        if let Some(canary) = policy.canary.as_ref().filter(|c| c.applies_to(channel))
            && !canary.admits(tenant_id, device_id)
        {
            debug!(tenant_id, device_id, %channel, "device outside canary cohort");
            return OtaDecision::unavailable(OtaPriority::Low);
        }

        let below_minimum = firmware
            .min_required
            .as_deref()
            .is_some_and(|minimum| is_below(current, minimum));
        let force = policy.force_upgrade || artifact.force || below_minimum;

        let target = self.target_firmware(identity, channel, artifact);
        debug!(
            tenant_id,
            device_id,
            %channel,
            current,
            target = %target.version,
            force,
            "ota upgrade available"
        );

        OtaDecision::upgrade(target, force, OtaPriority::for_channel(channel))
    }

    fn target_firmware(
        &self,
        identity: &DeviceIdentity,
        channel: FirmwareChannel,
        artifact: FirmwareArtifact,
    ) -> TargetFirmware {
        let template = self.templates.get(channel).cloned().unwrap_or_default();
        let hardware_version = template
            .hardware_version
            .or_else(|| identity.hardware.version.as_deref().map(str::to_string));

        TargetFirmware {
            url: format!(
                "{}/{}/{}.bin",
                self.repo_base.trim_end_matches('/'),
                artifact.version,
                artifact.build
            ),
            version: artifact.version,
            build: artifact.build,
            checksum: artifact.checksum,
            size_bytes: artifact.size_bytes,
            constraints: FirmwareConstraints {
                min_battery_pct: template.min_battery_pct,
                network: template.network,
                time_window: template.time_window,
                hardware_version,
                device_type: identity.device_type.to_string(),
            },
        }
    }
}

fn parse_version(raw: &str) -> Option<Version> {
    let raw = raw.trim();
    Version::parse(raw.strip_prefix('v').unwrap_or(raw)).ok()
}

/// `latest` should be offered over `current`. Unparseable versions fall back
/// to plain inequality.
fn is_newer(latest: &str, current: &str) -> bool {
    match (parse_version(latest), parse_version(current)) {
        (Some(latest), Some(current)) => latest > current,
        _ => latest.trim() != current.trim(),
    }
}

fn is_below(current: &str, minimum: &str) -> bool {
    match (parse_version(current), parse_version(minimum)) {
        (Some(current), Some(minimum)) => current < minimum,
        _ => false,
    }
}
