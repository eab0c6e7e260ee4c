use std::sync::Arc;

use halo_core::topic::{SegmentKind, validate_segment};
use halo_core::{
    Backoff, BootstrapEnvelope, BrokerEndpoint, CfgSection, DeviceIdentity, EnvelopeData,
    ErrorDetails, IngestPolicy, LastWill, MqttCredential, OtaDecision, OtaPriority, Policies, Qos,
    RetentionPolicy, TopicSet, WebsocketInfo,
};
use jiff::{SignedDuration, Timestamp};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use tracing::{Span, field, info, instrument, warn};

use crate::catalog::StaticArtifactCatalog;
use crate::config::{BootstrapConfig, Config};
use crate::credentials::CredentialIssuer;
use crate::error::BootstrapError;
use crate::ota::OtaDecisionEngine;
use crate::policy::PolicyRegistry;
use crate::template::TemplateStore;
use crate::tenant::{StaticTenantPolicyStore, TenantPolicyStore};

/// Session parameters copied into every envelope.
#[derive(Debug, Clone)]
pub struct BootstrapSettings {
    pub envelope_ttl: SignedDuration,
    pub signing_secret: String,
    pub keepalive_secs: u16,
    pub session_expiry_secs: u32,
    pub clean_start: bool,
    /// Sorted by priority, lowest first.
    pub brokers: Vec<BrokerEndpoint>,
    pub websocket: WebsocketInfo,
    pub backoff: Backoff,
    pub retention: RetentionPolicy,
    pub ingest: IngestPolicy,
}

impl From<&BootstrapConfig> for BootstrapSettings {
    fn from(config: &BootstrapConfig) -> Self {
        let mut brokers = config.brokers.clone();
        brokers.sort_by_key(|broker| broker.priority);

        let ttl_secs = i64::try_from(config.envelope_ttl_secs).unwrap_or(i64::MAX);

        Self {
            envelope_ttl: SignedDuration::from_secs(ttl_secs),
            signing_secret: config.signing_secret.clone(),
            keepalive_secs: config.keepalive_secs,
            session_expiry_secs: config.session_expiry_secs,
            clean_start: config.clean_start,
            brokers,
            websocket: config.websocket.clone(),
            backoff: (&config.backoff).into(),
            retention: (&config.retention).into(),
            ingest: (&config.ingest).into(),
        }
    }
}

type HmacSha256 = Hmac<Sha256>;

/// Every envelope field except the signature itself.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SignedContent<'a> {
    code: u16,
    message: &'a str,
    timestamp: Timestamp,
    error_code: Option<&'a str>,
    error_details: Option<&'a ErrorDetails>,
    data: Option<&'a EnvelopeData>,
}

impl<'a> From<&'a BootstrapEnvelope> for SignedContent<'a> {
    fn from(envelope: &'a BootstrapEnvelope) -> Self {
        Self {
            code: envelope.code,
            message: &envelope.message,
            timestamp: envelope.timestamp,
            error_code: envelope.error_code.as_deref(),
            error_details: envelope.error_details.as_ref(),
            data: envelope.data.as_ref(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OfflinePayload<'a> {
    status: &'static str,
    device_id: &'a str,
    reason: &'static str,
}

/// Turns a device identity into a signed session contract.
///
/// Everything but credential issuance is synchronous; the orchestrator holds
/// no lock across requests.
pub struct BootstrapOrchestrator {
    registry: Arc<PolicyRegistry>,
    ota: OtaDecisionEngine,
    templates: Arc<TemplateStore>,
    credentials: Arc<dyn CredentialIssuer>,
    settings: BootstrapSettings,
}

impl BootstrapOrchestrator {
    pub fn new(
        registry: Arc<PolicyRegistry>,
        ota: OtaDecisionEngine,
        templates: Arc<TemplateStore>,
        credentials: Arc<dyn CredentialIssuer>,
        settings: BootstrapSettings,
    ) -> Self {
        Self {
            registry,
            ota,
            templates,
            credentials,
            settings,
        }
    }

    /// Wire the static stores described by `config` around `credentials`.
    pub fn from_config(config: &Config, credentials: Arc<dyn CredentialIssuer>) -> Self {
        let tenants: Arc<dyn TenantPolicyStore> = Arc::new(StaticTenantPolicyStore::new(
            config
                .tenants
                .iter()
                .map(|(id, policy)| (id.clone(), policy.clone())),
        ));
        let templates = Arc::new(TemplateStore::new(
            config
                .device_types
                .iter()
                .map(|(device_type, template)| (device_type.clone(), template.clone())),
            config.fallback_template.clone(),
        ));
        let registry = Arc::new(PolicyRegistry::new(
            Arc::clone(&tenants),
            Arc::clone(&templates),
            config.bootstrap.resolution_mode,
        ));
        let ota = OtaDecisionEngine::new(
            Arc::new(StaticArtifactCatalog::new(config.ota.artifacts.clone())),
            tenants,
            config.ota.repo_base.clone(),
            config.ota.templates.clone(),
        );

        Self::new(
            registry,
            ota,
            templates,
            credentials,
            BootstrapSettings::from(&config.bootstrap),
        )
    }

    pub fn registry(&self) -> &Arc<PolicyRegistry> {
        &self.registry
    }

    pub fn templates(&self) -> &TemplateStore {
        &self.templates
    }

    /// Answer a bootstrap request. Failures come back as error envelopes.
    pub async fn process_bootstrap_request(
        &self,
        identity: &DeviceIdentity,
        tenant_id: Option<&str>,
    ) -> BootstrapEnvelope {
        match self.process(identity, tenant_id).await {
            Ok(envelope) => envelope,
            Err(err) => {
                let tenant = tenant_id.or(identity.tenant_id.as_deref());
                warn!(
                    device_id = %identity.device_id,
                    tenant_id = ?tenant,
                    code = err.status_code(),
                    error = %err,
                    "bootstrap rejected"
                );
                self.build_error_envelope(&err, Some(&*identity.device_id), tenant)
            }
        }
    }

    #[instrument(
        name = "bootstrap",
        skip_all,
        fields(device_id = %identity.device_id, tenant_id = field::Empty)
    )]
    pub async fn process(
        &self,
        identity: &DeviceIdentity,
        tenant_id: Option<&str>,
    ) -> Result<BootstrapEnvelope, BootstrapError> {
        let tenant_id = resolve_tenant(identity, tenant_id)?;
        Span::current().record("tenant_id", field::display(&tenant_id));

        validate_identity(identity, &tenant_id)?;

        let device_id = &*identity.device_id;
        let device_type = &*identity.device_type;

        let resolver = self.registry.get_or_create_resolver(&tenant_id, device_type)?;
        let topics = TopicSet::build(&tenant_id, device_type, device_id)?;
        let policy = resolver.resolve_policy(&identity.capability_set(), &topics);

        let issued = self.credentials.issue(device_id, &tenant_id).await?;

        let ota = if resolver.is_fallback() {
            OtaDecision::unavailable(OtaPriority::Low)
        } else {
            self.ota.decide(identity, &tenant_id)
        };
        let shadow_desired = self.templates.template_or_fallback(device_type).shadow_desired();

        let now = Timestamp::now();
        let expires_at = now
            .checked_add(self.settings.envelope_ttl)
            .map_or(issued.expires_at, |expiry| expiry.min(issued.expires_at));

        let lwt = LastWill {
            topic: topics.status_pub.clone(),
            payload: serde_json::to_string(&OfflinePayload {
                status: "offline",
                device_id,
                reason: "unexpected_disconnect",
            })?,
            qos: Qos::AtLeastOnce,
            retain: true,
        };

        let data = EnvelopeData {
            cfg: CfgSection {
                device_id: device_id.to_string(),
                tenant_id: tenant_id.clone(),
                device_type: device_type.to_string(),
                issued_at: now,
                expires_at,
                topics,
                degraded: resolver.is_fallback(),
            },
            mqtt: MqttCredential {
                client_id: device_id.to_string(),
                username: issued.username,
                password: issued.password,
                password_expires_at: issued.expires_at,
                keepalive: self.settings.keepalive_secs,
                session_expiry: self.settings.session_expiry_secs,
                clean_start: self.settings.clean_start,
                brokers: self.settings.brokers.clone(),
                lwt,
                backoff: self.settings.backoff.clone(),
            },
            ota,
            shadow_desired,
            policies: Policies {
                qos_retain: policy.qos_retain,
                acl: policy.acl,
                retention: self.settings.retention.clone(),
                ingest: self.settings.ingest.clone(),
            },
            server_time: now,
            websocket: self.settings.websocket.clone(),
        };

        info!(
            degraded = data.cfg.degraded,
            ota_available = data.ota.available,
            expires_at = %expires_at,
            "bootstrap issued"
        );

        let mut envelope = BootstrapEnvelope {
            code: BootstrapEnvelope::OK,
            message: "Bootstrap successful".to_string(),
            timestamp: now,
            signature: String::new(),
            data: Some(data),
            error_code: None,
            error_details: None,
        };
        envelope.signature = self.sign(&envelope)?;

        Ok(envelope)
    }

    /// Error envelopes share the success shape with `data` set to null.
    pub fn build_error_envelope(
        &self,
        err: &BootstrapError,
        device_id: Option<&str>,
        tenant_id: Option<&str>,
    ) -> BootstrapEnvelope {
        let code = err.status_code();
        let message = if code >= 500 {
            "Bootstrap failed"
        } else {
            "Bootstrap request rejected"
        };

        let mut envelope = BootstrapEnvelope {
            code,
            message: message.to_string(),
            timestamp: Timestamp::now(),
            signature: String::new(),
            data: None,
            error_code: Some(err.error_code().to_string()),
            error_details: Some(ErrorDetails {
                device_id: device_id.map(str::to_string),
                tenant_id: tenant_id.map(str::to_string),
                reason: err.public_message(),
            }),
        };

        match self.sign(&envelope) {
            Ok(signature) => envelope.signature = signature,
            Err(sign_err) => warn!(error = %sign_err, "failed to sign error envelope"),
        }
        envelope
    }

    /// Hex HMAC-SHA256 over the JSON of every field but `signature`.
    pub fn sign(&self, envelope: &BootstrapEnvelope) -> Result<String, BootstrapError> {
        let mac = self.mac(envelope)?;
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    pub fn verify_signature(&self, envelope: &BootstrapEnvelope) -> bool {
        let Ok(signature) = hex::decode(&envelope.signature) else {
            return false;
        };
        self.mac(envelope)
            .is_ok_and(|mac| mac.verify_slice(&signature).is_ok())
    }

    fn mac(&self, envelope: &BootstrapEnvelope) -> Result<HmacSha256, BootstrapError> {
        let content = serde_json::to_vec(&SignedContent::from(envelope))?;
        let mut mac = HmacSha256::new_from_slice(self.settings.signing_secret.as_bytes())
            .map_err(|_| BootstrapError::SigningKey)?;
        mac.update(&content);
        Ok(mac)
    }
}

/// The explicit tenant wins over the one the device claims; a disagreement
/// between the two is rejected.
pub fn resolve_tenant(
    identity: &DeviceIdentity,
    explicit: Option<&str>,
) -> Result<String, BootstrapError> {
    let explicit = explicit.map(str::trim).filter(|t| !t.is_empty());
    let claimed = identity
        .tenant_id
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty());

    match (explicit, claimed) {
        (Some(explicit), Some(claimed)) if explicit != claimed => Err(BootstrapError::validation(
            "tenantId",
            format!("identity claims tenant {claimed:?} but request is for {explicit:?}"),
        )),
        (Some(tenant), _) | (None, Some(tenant)) => Ok(tenant.to_string()),
        (None, None) => Err(BootstrapError::TenantNotResolved),
    }
}

pub fn validate_identity(identity: &DeviceIdentity, tenant_id: &str) -> Result<(), BootstrapError> {
    validate_segment(SegmentKind::Tenant, tenant_id)?;
    validate_segment(SegmentKind::DeviceType, &identity.device_type)?;
    validate_segment(SegmentKind::DeviceId, &identity.device_id)?;

    if !is_valid_mac(&identity.mac) {
        return Err(BootstrapError::validation(
            "mac",
            format!("{:?} is not six hex octets", &*identity.mac),
        ));
    }

    if identity.capabilities.iter().any(|c| c.name.trim().is_empty()) {
        return Err(BootstrapError::validation(
            "capabilities",
            "capability names must not be empty",
        ));
    }

    Ok(())
}

fn is_valid_mac(mac: &str) -> bool {
    let separator = if mac.contains(':') { ':' } else { '-' };
    let octets: Vec<&str> = mac.split(separator).collect();

    octets.len() == 6
        && octets
            .iter()
            .all(|octet| octet.len() == 2 && octet.chars().all(|c| c.is_ascii_hexdigit()))
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use halo_core::{Capability, FirmwareChannel, FirmwareInfo, HardwareInfo};

    use super::*;
    use crate::config::ResolutionMode;
    use crate::credentials::{CredentialError, IssuedCredential, RandomCredentialIssuer};

    fn identity(device_type: &str) -> DeviceIdentity {
        DeviceIdentity {
            device_id: "dev-1".into(),
            mac: "AA:BB:CC:DD:EE:01".into(),
            device_type: device_type.into(),
            hardware: HardwareInfo::default(),
            firmware: FirmwareInfo {
                current: Some("1.0.0".into()),
                build: Some("1000".into()),
                min_required: None,
                channel: Some(FirmwareChannel::Beta),
            },
            capabilities: Box::new([Capability {
                name: "low_power_mode".into(),
                version: None,
            }]),
            tenant_id: Some("default".into()),
        }
    }

    fn orchestrator(mode: ResolutionMode) -> BootstrapOrchestrator {
        let mut config = Config::default();
        config.bootstrap.resolution_mode = mode;
        BootstrapOrchestrator::from_config(
            &config,
            Arc::new(RandomCredentialIssuer::new(SignedDuration::from_hours(1), 32)),
        )
    }

    struct BrokenIssuer;

    #[async_trait]
    impl CredentialIssuer for BrokenIssuer {
        async fn issue(&self, _: &str, _: &str) -> Result<IssuedCredential, CredentialError> {
            Err(CredentialError::Unavailable("vault sealed".into()))
        }
    }

    #[tokio::test]
    async fn successful_envelope() {
        let orchestrator = orchestrator(ResolutionMode::Strict);
        let envelope = orchestrator
            .process_bootstrap_request(&identity("sensor"), None)
            .await;

        assert_eq!(envelope.code, 200);
        assert!(orchestrator.verify_signature(&envelope));

        let data = envelope.data.unwrap();
        assert_eq!(data.cfg.tenant_id, "default");
        assert!(!data.cfg.degraded);
        assert_eq!(data.mqtt.client_id, "dev-1");
        assert_eq!(data.mqtt.username, "default:dev-1");
        assert_eq!(data.mqtt.lwt.topic, "iot/default/sensor/dev-1/status");
        assert!(data.mqtt.lwt.retain);
        assert!(data.mqtt.lwt.payload.contains("\"status\":\"offline\""));
        assert!(data.cfg.expires_at <= data.mqtt.password_expires_at);

        assert!(data.ota.available);
        let target = data.ota.target_firmware.unwrap();
        assert_eq!(target.version, "1.3.0-beta.1");
        assert_eq!(data.ota.strategy.priority, OtaPriority::Medium);

        assert_eq!(data.shadow_desired.heartbeat_interval_secs, 60);
        let telemetry = data
            .policies
            .qos_retain
            .iter()
            .find(|entry| entry.topic == data.cfg.topics.telemetry_pub)
            .unwrap();
        assert_eq!(telemetry.qos, Qos::AtMostOnce);
    }

    #[tokio::test]
    async fn strict_and_permissive_unknown_device_type() {
        let envelope = orchestrator(ResolutionMode::Strict)
            .process_bootstrap_request(&identity("toaster"), None)
            .await;
        assert_eq!(envelope.code, 422);
        assert_eq!(envelope.error_code.as_deref(), Some("UNKNOWN_DEVICE_TYPE"));
        assert!(envelope.data.is_none());

        let envelope = orchestrator(ResolutionMode::Permissive)
            .process_bootstrap_request(&identity("toaster"), None)
            .await;
        assert_eq!(envelope.code, 200);
        let data = envelope.data.unwrap();
        assert!(data.cfg.degraded);
        assert!(!data.ota.available);
        assert_eq!(data.shadow_desired.heartbeat_interval_secs, 300);
    }

    #[tokio::test]
    async fn validation_failures() {
        let orchestrator = orchestrator(ResolutionMode::Strict);

        let mut bad_mac = identity("sensor");
        bad_mac.mac = "not-a-mac".into();
        let envelope = orchestrator.process_bootstrap_request(&bad_mac, None).await;
        assert_eq!(envelope.code, 400);
        assert_eq!(envelope.error_code.as_deref(), Some("VALIDATION_ERROR"));
        assert_eq!(
            envelope.error_details.unwrap().device_id.as_deref(),
            Some("dev-1")
        );

        let mut slash_tenant = identity("sensor");
        slash_tenant.tenant_id = Some("acme/eu".into());
        let envelope = orchestrator
            .process_bootstrap_request(&slash_tenant, None)
            .await;
        assert_eq!(envelope.code, 400);

        let mut wildcard = identity("sensor");
        wildcard.device_id = "dev+1".into();
        let envelope = orchestrator.process_bootstrap_request(&wildcard, None).await;
        assert_eq!(envelope.code, 400);

        // Broker usernames join tenant and device with ':'.
        let mut colon_tenant = identity("sensor");
        colon_tenant.tenant_id = Some("a:b".into());
        colon_tenant.device_id = "c".into();
        let mut colon_device = identity("sensor");
        colon_device.tenant_id = Some("a".into());
        colon_device.device_id = "b:c".into();
        for identity in [colon_tenant, colon_device] {
            let envelope = orchestrator.process_bootstrap_request(&identity, None).await;
            assert_eq!(envelope.code, 400);
            assert!(envelope.data.is_none());
        }
    }

    #[tokio::test]
    async fn tenant_resolution() {
        let orchestrator = orchestrator(ResolutionMode::Strict);

        let mut anonymous = identity("sensor");
        anonymous.tenant_id = None;
        let envelope = orchestrator
            .process_bootstrap_request(&anonymous, None)
            .await;
        assert_eq!(envelope.code, 500);
        assert_eq!(envelope.error_code.as_deref(), Some("TENANT_NOT_RESOLVED"));

        let envelope = orchestrator
            .process_bootstrap_request(&anonymous, Some("acme"))
            .await;
        assert_eq!(envelope.code, 200);
        assert_eq!(envelope.data.unwrap().cfg.topics.cfg_sub, "iot/acme/sensor/dev-1/cfg");

        let envelope = orchestrator
            .process_bootstrap_request(&identity("sensor"), Some("acme"))
            .await;
        assert_eq!(envelope.code, 400);
    }

    #[tokio::test]
    async fn credential_failure_is_a_server_error() {
        let orchestrator =
            BootstrapOrchestrator::from_config(&Config::default(), Arc::new(BrokenIssuer));
        let envelope = orchestrator
            .process_bootstrap_request(&identity("sensor"), None)
            .await;

        assert_eq!(envelope.code, 500);
        assert_eq!(
            envelope.error_code.as_deref(),
            Some("CREDENTIAL_ISSUANCE_FAILED")
        );
        // Backend detail stays out of the envelope.
        assert!(
            !envelope
                .error_details
                .as_ref()
                .unwrap()
                .reason
                .contains("vault")
        );
        assert!(orchestrator.verify_signature(&envelope));
    }

    #[tokio::test]
    async fn tampered_envelope_fails_verification() {
        let orchestrator = orchestrator(ResolutionMode::Strict);
        let mut envelope = orchestrator
            .process_bootstrap_request(&identity("sensor"), None)
            .await;

        assert!(orchestrator.verify_signature(&envelope));

        let mut password = envelope.clone();
        if let Some(data) = password.data.as_mut() {
            data.mqtt.password.push('x');
        }
        assert!(!orchestrator.verify_signature(&password));

        let mut code = envelope.clone();
        code.code = 500;
        code.message = "Bootstrap failed".to_string();
        assert!(!orchestrator.verify_signature(&code));

        let mut error_code = envelope.clone();
        error_code.error_code = Some("VALIDATION_ERROR".to_string());
        assert!(!orchestrator.verify_signature(&error_code));

        let mut garbled = envelope;
        garbled.signature = "not hex".to_string();
        assert!(!orchestrator.verify_signature(&garbled));
    }

    #[tokio::test]
    async fn error_envelopes_are_signed_individually() {
        let orchestrator = orchestrator(ResolutionMode::Strict);

        let mut bad_mac = identity("sensor");
        bad_mac.mac = "nope".into();
        let rejected = orchestrator.process_bootstrap_request(&bad_mac, None).await;
        let unknown = orchestrator
            .process_bootstrap_request(&identity("toaster"), None)
            .await;

        assert!(orchestrator.verify_signature(&rejected));
        assert!(orchestrator.verify_signature(&unknown));
        assert_ne!(rejected.signature, unknown.signature);

        let mut swapped = rejected.clone();
        swapped.error_details = unknown.error_details.clone();
        assert!(!orchestrator.verify_signature(&swapped));
    }

    #[tokio::test]
    async fn signature_depends_on_secret() {
        let envelope = orchestrator(ResolutionMode::Strict)
            .process_bootstrap_request(&identity("sensor"), None)
            .await;

        let mut config = Config::default();
        config.bootstrap.signing_secret = "another-secret".to_string();
        let other = BootstrapOrchestrator::from_config(
            &config,
            Arc::new(RandomCredentialIssuer::new(SignedDuration::from_hours(1), 32)),
        );
        assert!(!other.verify_signature(&envelope));
    }

    #[test]
    fn mac_formats() {
        assert!(is_valid_mac("aa:bb:cc:dd:ee:ff"));
        assert!(is_valid_mac("AA-BB-CC-DD-EE-FF"));
        assert!(!is_valid_mac("AA:BB-CC:DD:EE:FF"));
        assert!(!is_valid_mac("AA:BB:CC:DD:EE"));
        assert!(!is_valid_mac("AABBCCDDEEFF"));
        assert!(!is_valid_mac("GG:BB:CC:DD:EE:FF"));
    }
}
