use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;

use halo_core::topic::{SegmentKind, TopicChannel, validate_segment};
use halo_core::{
    Backoff, BrokerEndpoint, FirmwareChannel, IngestPolicy, NetworkRequirement, RetentionPolicy,
    TimeWindow, WebsocketInfo,
};
use serde::Deserialize;

use crate::catalog::FirmwareArtifact;
use crate::ota::ConstraintTemplate;
use crate::template::DeviceTypeTemplate;
use crate::tenant::{CanaryConfig, TenantPolicy};

/// Upper bound for envelope and password lifetimes (one year).
pub const MAX_TTL_SECS: u64 = 365 * 24 * 60 * 60;
pub const MAX_BACKOFF_MULTIPLIER: f64 = 10.0;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub bootstrap: BootstrapConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    pub ota: OtaConfig,
    #[serde(default)]
    pub tenants: BTreeMap<String, TenantPolicy>,
    #[serde(default)]
    pub device_types: BTreeMap<String, DeviceTypeTemplate>,
    /// Shadow template for device types without their own entry when
    /// `resolution_mode = "permissive"`.
    #[serde(default)]
    pub fallback_template: DeviceTypeTemplate,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address for the HTTP server to listen on
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

/// What to do with a device type that has no configured template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionMode {
    /// Reject the bootstrap with `UNKNOWN_DEVICE_TYPE`.
    Strict,
    /// Serve a degraded generic policy with OTA disabled.
    Permissive,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BootstrapConfig {
    /// Deliberately has no default; every deployment must choose.
    pub resolution_mode: ResolutionMode,
    /// How long an issued envelope stays valid, and so how long it is cached.
    #[serde(default = "default_envelope_ttl_secs")]
    pub envelope_ttl_secs: u64,
    pub signing_secret: String,
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u16,
    #[serde(default = "default_session_expiry_secs")]
    pub session_expiry_secs: u32,
    #[serde(default)]
    pub clean_start: bool,
    pub brokers: Vec<BrokerEndpoint>,
    pub websocket: WebsocketInfo,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
}

fn default_envelope_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_keepalive_secs() -> u16 {
    60
}

fn default_session_expiry_secs() -> u32 {
    60 * 60
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackoffConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        let backoff = Backoff::default();
        Self {
            initial_ms: backoff.initial_ms,
            max_ms: backoff.max_ms,
            multiplier: backoff.multiplier,
            jitter: backoff.jitter,
        }
    }
}

impl From<&BackoffConfig> for Backoff {
    fn from(config: &BackoffConfig) -> Self {
        Self {
            initial_ms: config.initial_ms,
            max_ms: config.max_ms,
            multiplier: config.multiplier,
            jitter: config.jitter,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    pub telemetry_days: u32,
    pub event_days: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        let retention = RetentionPolicy::default();
        Self {
            telemetry_days: retention.telemetry_days,
            event_days: retention.event_days,
        }
    }
}

impl From<&RetentionConfig> for RetentionPolicy {
    fn from(config: &RetentionConfig) -> Self {
        Self {
            telemetry_days: config.telemetry_days,
            event_days: config.event_days,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    pub max_payload_bytes: u32,
    pub max_messages_per_second: u32,
}

impl Default for IngestConfig {
    fn default() -> Self {
        let ingest = IngestPolicy::default();
        Self {
            max_payload_bytes: ingest.max_payload_bytes,
            max_messages_per_second: ingest.max_messages_per_second,
        }
    }
}

impl From<&IngestConfig> for IngestPolicy {
    fn from(config: &IngestConfig) -> Self {
        Self {
            max_payload_bytes: config.max_payload_bytes,
            max_messages_per_second: config.max_messages_per_second,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CredentialsConfig {
    /// Lifetime of an issued broker password.
    pub password_ttl_secs: u64,
    pub password_length: usize,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            password_ttl_secs: 24 * 60 * 60,
            password_length: 32,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OtaConfig {
    /// Image URLs are `{repo_base}/{version}/{build}.bin`.
    pub repo_base: String,
    #[serde(default)]
    pub templates: ChannelMap<ConstraintTemplate>,
    #[serde(default)]
    pub artifacts: ChannelMap<FirmwareArtifact>,
}

/// One optional value per firmware channel, laid out as `[section.stable]`,
/// `[section.beta]` and `[section.dev]` in TOML. Missing channels are `None`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChannelMap<T> {
    pub stable: Option<T>,
    pub beta: Option<T>,
    pub dev: Option<T>,
}

impl<T> Default for ChannelMap<T> {
    fn default() -> Self {
        Self {
            stable: None,
            beta: None,
            dev: None,
        }
    }
}

impl<T> ChannelMap<T> {
    pub fn get(&self, channel: FirmwareChannel) -> Option<&T> {
        match channel {
            FirmwareChannel::Stable => self.stable.as_ref(),
            FirmwareChannel::Beta => self.beta.as_ref(),
            FirmwareChannel::Dev => self.dev.as_ref(),
        }
    }

    pub fn set(&mut self, channel: FirmwareChannel, value: T) {
        let slot = match channel {
            FirmwareChannel::Stable => &mut self.stable,
            FirmwareChannel::Beta => &mut self.beta,
            FirmwareChannel::Dev => &mut self.dev,
        };
        *slot = Some(value);
    }

    pub fn iter(&self) -> impl Iterator<Item = (FirmwareChannel, &T)> {
        FirmwareChannel::ALL
            .into_iter()
            .filter_map(|channel| self.get(channel).map(|value| (channel, value)))
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Everything that can be checked once at load time is checked here, so
    /// resolution never has to second-guess the policy snapshot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let bootstrap = &self.bootstrap;
        if bootstrap.signing_secret.trim().is_empty() {
            return Err(invalid("bootstrap.signing_secret must not be empty"));
        }
        if !(1..=MAX_TTL_SECS).contains(&bootstrap.envelope_ttl_secs) {
            return Err(invalid(format!(
                "bootstrap.envelope_ttl_secs must be between 1 and {MAX_TTL_SECS}"
            )));
        }
        if bootstrap.brokers.is_empty() {
            return Err(invalid("bootstrap.brokers must list at least one broker"));
        }
        if let Some(broker) = bootstrap.brokers.iter().find(|b| b.url.trim().is_empty()) {
            return Err(invalid(format!(
                "broker with priority {} has an empty url",
                broker.priority
            )));
        }
        let backoff = &bootstrap.backoff;
        // A NaN multiplier falls outside the range too.
        if !(1.0..=MAX_BACKOFF_MULTIPLIER).contains(&backoff.multiplier)
            || backoff.initial_ms > backoff.max_ms
        {
            return Err(invalid(format!(
                "bootstrap.backoff needs 1 <= multiplier <= {MAX_BACKOFF_MULTIPLIER} \
                 and initial_ms <= max_ms"
            )));
        }

        if !(1..=MAX_TTL_SECS).contains(&self.credentials.password_ttl_secs) {
            return Err(invalid(format!(
                "credentials.password_ttl_secs must be between 1 and {MAX_TTL_SECS}"
            )));
        }
        if self.credentials.password_length < 16 {
            return Err(invalid("credentials.password_length must be at least 16"));
        }

        if self.ota.repo_base.trim().is_empty() {
            return Err(invalid("ota.repo_base must not be empty"));
        }
        for (channel, artifact) in self.ota.artifacts.iter() {
            if artifact.version.trim().is_empty() || artifact.build.trim().is_empty() {
                return Err(invalid(format!(
                    "ota.artifacts.{channel} needs a version and a build"
                )));
            }
            if artifact.build.contains('/') || artifact.version.contains('/') {
                return Err(invalid(format!(
                    "ota.artifacts.{channel} version and build must not contain '/'"
                )));
            }
        }
        for (channel, template) in self.ota.templates.iter() {
            if template.min_battery_pct > 100 {
                return Err(invalid(format!(
                    "ota.templates.{channel}.min_battery_pct must be within 0..=100"
                )));
            }
        }

        for (tenant_id, policy) in &self.tenants {
            validate_segment(SegmentKind::Tenant, tenant_id)
                .map_err(|e| invalid(format!("tenants.{tenant_id}: {e}")))?;
            for suffix in policy.topic_overrides.keys() {
                if TopicChannel::from_suffix(suffix).is_none() {
                    return Err(invalid(format!(
                        "tenants.{tenant_id}.topic_overrides: unknown topic suffix {suffix:?}"
                    )));
                }
            }
            if let Some(CanaryConfig { percentage, .. }) = &policy.canary
                && *percentage > 100
            {
                return Err(invalid(format!(
                    "tenants.{tenant_id}.canary.percentage must be within 0..=100"
                )));
            }
        }

        for device_type in self.device_types.keys() {
            validate_segment(SegmentKind::DeviceType, device_type)
                .map_err(|e| invalid(format!("device_types.{device_type}: {e}")))?;
        }

        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}

impl Default for Config {
    fn default() -> Self {
        let mut templates = ChannelMap::default();
        templates.set(
            FirmwareChannel::Stable,
            ConstraintTemplate {
                min_battery_pct: 50,
                network: NetworkRequirement::Any,
                time_window: Some(TimeWindow {
                    start: jiff::civil::time(2, 0, 0, 0),
                    end: jiff::civil::time(5, 0, 0, 0),
                }),
                hardware_version: None,
            },
        );
        templates.set(
            FirmwareChannel::Beta,
            ConstraintTemplate {
                min_battery_pct: 30,
                network: NetworkRequirement::Wifi,
                time_window: None,
                hardware_version: None,
            },
        );
        templates.set(
            FirmwareChannel::Dev,
            ConstraintTemplate {
                min_battery_pct: 20,
                network: NetworkRequirement::Any,
                time_window: None,
                hardware_version: None,
            },
        );

        let mut artifacts = ChannelMap::default();
        artifacts.set(FirmwareChannel::Stable, FirmwareArtifact::new("1.2.0", "1200"));
        artifacts.set(
            FirmwareChannel::Beta,
            FirmwareArtifact::new("1.3.0-beta.1", "1301"),
        );
        artifacts.set(
            FirmwareChannel::Dev,
            FirmwareArtifact::new("1.4.0-dev.3", "1403"),
        );

        let mut device_types = BTreeMap::new();
        device_types.insert(
            "sensor".to_string(),
            DeviceTypeTemplate {
                heartbeat_interval_secs: 60,
                sampling_interval_secs: 30,
                thresholds: BTreeMap::from([
                    ("temperatureHigh".to_string(), 45.0),
                    ("batteryLow".to_string(), 15.0),
                ]),
                features: BTreeMap::from([
                    ("ota".to_string(), true),
                    ("localBuffering".to_string(), true),
                ]),
                ..DeviceTypeTemplate::default()
            },
        );
        device_types.insert(
            "gateway".to_string(),
            DeviceTypeTemplate {
                heartbeat_interval_secs: 30,
                sampling_interval_secs: 60,
                features: BTreeMap::from([
                    ("ota".to_string(), true),
                    ("subdeviceBridge".to_string(), true),
                ]),
                ..DeviceTypeTemplate::default()
            },
        );

        Self {
            server: ServerConfig::default(),
            bootstrap: BootstrapConfig {
                resolution_mode: ResolutionMode::Permissive,
                envelope_ttl_secs: default_envelope_ttl_secs(),
                signing_secret: "halo-dev-signing-secret".to_string(),
                keepalive_secs: default_keepalive_secs(),
                session_expiry_secs: default_session_expiry_secs(),
                clean_start: false,
                brokers: vec![BrokerEndpoint {
                    url: "mqtts://localhost:8883".to_string(),
                    priority: 0,
                }],
                websocket: WebsocketInfo {
                    url: "wss://localhost:8084".to_string(),
                    path: "/mqtt".to_string(),
                    protocols: vec!["mqtt".to_string()],
                },
                backoff: BackoffConfig::default(),
                retention: RetentionConfig::default(),
                ingest: IngestConfig::default(),
            },
            credentials: CredentialsConfig::default(),
            ota: OtaConfig {
                repo_base: "https://firmware.localhost/releases".to_string(),
                templates,
                artifacts,
            },
            tenants: BTreeMap::from([("default".to_string(), TenantPolicy::default())]),
            device_types,
            fallback_template: DeviceTypeTemplate::default(),
        }
    }
}
