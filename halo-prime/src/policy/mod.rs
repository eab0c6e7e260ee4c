pub mod registry;

use std::collections::HashMap;

use halo_core::{
    AclSet, CapabilitySet, Qos, QosRetainEntry, ResolvedPolicy, TopicChannel, TopicDirection,
    TopicRole, TopicSet,
};
use tracing::debug;

use crate::tenant::{TenantPolicy, TopicPolicyOverride};

pub use registry::{PolicyRegistry, RegistryStats};

/// Derives the QoS/retain table and the ACL for devices of one
/// `(tenant, device type)` pair.
///
/// Tenant overrides are copied in at construction, so a resolver never sees
/// later policy edits. Rebuild it through [`PolicyRegistry::invalidate_tenant`].
#[derive(Debug)]
pub struct PolicyResolver {
    tenant_id: String,
    device_type: String,
    overrides: HashMap<TopicChannel, TopicPolicyOverride>,
    fallback: bool,
}

impl PolicyResolver {
    pub fn new(
        tenant_id: impl Into<String>,
        device_type: impl Into<String>,
        policy: &TenantPolicy,
        fallback: bool,
    ) -> Self {
        // Suffixes are validated when the config is loaded.
        let overrides = policy
            .topic_overrides
            .iter()
            .filter_map(|(suffix, rule)| TopicChannel::from_suffix(suffix).map(|c| (c, *rule)))
            .collect();

        Self {
            tenant_id: tenant_id.into(),
            device_type: device_type.into(),
            overrides,
            fallback,
        }
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn device_type(&self) -> &str {
        &self.device_type
    }

    /// Built for a device type without its own template.
    pub fn is_fallback(&self) -> bool {
        self.fallback
    }

    pub fn resolve_policy(
        &self,
        capabilities: &CapabilitySet,
        topics: &TopicSet,
    ) -> ResolvedPolicy {
        let mut qos_retain = Vec::with_capacity(TopicRole::ALL.len());
        let mut acl = AclSet::default();

        for (role, topic) in topics.iter() {
            let (qos, retain) = self.rule_for(role.channel(), role.direction(), capabilities);
            qos_retain.push(QosRetainEntry {
                topic: topic.to_string(),
                qos,
                retain,
            });

            match role.direction() {
                TopicDirection::Publish => acl.publish.push(topic.to_string()),
                TopicDirection::Subscribe => acl.subscribe.push(topic.to_string()),
            }
        }

        debug!(
            tenant_id = %self.tenant_id,
            device_type = %self.device_type,
            low_power = capabilities.low_power(),
            overrides = self.overrides.len(),
            "resolved topic policy"
        );

        ResolvedPolicy { qos_retain, acl }
    }

    fn rule_for(
        &self,
        channel: TopicChannel,
        direction: TopicDirection,
        capabilities: &CapabilitySet,
    ) -> (Qos, bool) {
        if let Some(rule) = self.overrides.get(&channel) {
            return (rule.qos, rule.retain);
        }

        if capabilities.low_power()
            && direction == TopicDirection::Publish
            && is_telemetry_class(channel)
        {
            return (Qos::AtMostOnce, false);
        }

        match channel {
            TopicChannel::Status | TopicChannel::ShadowDesired | TopicChannel::Cfg => {
                (Qos::AtLeastOnce, true)
            }
            _ => (Qos::AtLeastOnce, false),
        }
    }
}

fn is_telemetry_class(channel: TopicChannel) -> bool {
    matches!(channel, TopicChannel::Telemetry | TopicChannel::Event)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use halo_core::Capability;

    use super::*;

    fn topics() -> TopicSet {
        TopicSet::build("default", "sensor", "dev-1").unwrap()
    }

    fn low_power() -> CapabilitySet {
        CapabilitySet::from_capabilities(&[Capability {
            name: CapabilitySet::LOW_POWER_MODE.into(),
            version: None,
        }])
    }

    #[test]
    fn default_rules() {
        let resolver = PolicyResolver::new("default", "sensor", &TenantPolicy::default(), false);
        let topics = topics();
        let policy = resolver.resolve_policy(&CapabilitySet::default(), &topics);

        assert_eq!(policy.qos_retain.len(), TopicRole::ALL.len());

        let status = policy.entry(&topics.status_pub).unwrap();
        assert_eq!((status.qos, status.retain), (Qos::AtLeastOnce, true));
        let desired = policy.entry(&topics.shadow_desired_sub).unwrap();
        assert_eq!((desired.qos, desired.retain), (Qos::AtLeastOnce, true));
        let cfg = policy.entry(&topics.cfg_sub).unwrap();
        assert!(cfg.retain);
        let telemetry = policy.entry(&topics.telemetry_pub).unwrap();
        assert_eq!((telemetry.qos, telemetry.retain), (Qos::AtLeastOnce, false));
        let cmd = policy.entry(&topics.cmd_sub).unwrap();
        assert_eq!((cmd.qos, cmd.retain), (Qos::AtLeastOnce, false));
    }

    #[test]
    fn low_power_downgrades_telemetry_class_only() {
        let resolver = PolicyResolver::new("default", "sensor", &TenantPolicy::default(), false);
        let topics = topics();
        let policy = resolver.resolve_policy(&low_power(), &topics);

        for topic in [&topics.telemetry_pub, &topics.event_pub] {
            let entry = policy.entry(topic).unwrap();
            assert_eq!((entry.qos, entry.retain), (Qos::AtMostOnce, false));
        }

        let status = policy.entry(&topics.status_pub).unwrap();
        assert_eq!((status.qos, status.retain), (Qos::AtLeastOnce, true));
        let progress = policy.entry(&topics.ota_progress_pub).unwrap();
        assert_eq!(progress.qos, Qos::AtLeastOnce);
    }

    #[test]
    fn tenant_override_beats_every_other_rule() {
        let policy = TenantPolicy {
            topic_overrides: BTreeMap::from([
                (
                    "telemetry".to_string(),
                    TopicPolicyOverride {
                        qos: Qos::ExactlyOnce,
                        retain: true,
                    },
                ),
                (
                    "status".to_string(),
                    TopicPolicyOverride {
                        qos: Qos::AtMostOnce,
                        retain: false,
                    },
                ),
            ]),
            ..TenantPolicy::default()
        };
        let resolver = PolicyResolver::new("acme", "sensor", &policy, false);
        let topics = TopicSet::build("acme", "sensor", "dev-1").unwrap();
        let resolved = resolver.resolve_policy(&low_power(), &topics);

        let telemetry = resolved.entry(&topics.telemetry_pub).unwrap();
        assert_eq!((telemetry.qos, telemetry.retain), (Qos::ExactlyOnce, true));
        let status = resolved.entry(&topics.status_pub).unwrap();
        assert_eq!((status.qos, status.retain), (Qos::AtMostOnce, false));
        // Event has no override, so low power still applies.
        assert_eq!(resolved.entry(&topics.event_pub).unwrap().qos, Qos::AtMostOnce);
    }

    #[test]
    fn acl_is_contained_in_topic_set() {
        let resolver = PolicyResolver::new("default", "gateway", &TenantPolicy::default(), false);
        let topics = TopicSet::build("default", "gateway", "gw-1").unwrap();
        let policy = resolver.resolve_policy(&CapabilitySet::default(), &topics);

        assert!(policy.acl.topics().all(|topic| topics.contains(topic)));
        assert_eq!(policy.acl.publish.len(), 6);
        assert_eq!(
            policy.acl.subscribe,
            vec![
                topics.cmd_sub.clone(),
                topics.shadow_desired_sub.clone(),
                topics.cfg_sub.clone()
            ]
        );
        assert!(policy.acl.publish.contains(&topics.ota_progress_pub));
        assert!(!policy.acl.publish.contains(&topics.cmd_sub));
    }
}
