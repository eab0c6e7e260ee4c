use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use jiff::Timestamp;
use serde::{Deserialize, Deserializer, Serialize};

pub mod topic;

pub use topic::{
    SegmentFault, SegmentKind, TopicChannel, TopicDirection, TopicError, TopicInfo, TopicRole,
    TopicSet,
};

// Identity payloads are immutable for the lifetime of a request, so we keep
// them as `Box<str>` and `Box<[T]>` like the rest of the platform's records.
type BoxStr = Box<str>;
type BoxList<T> = Box<[T]>;

/// Self-description a device sends when it asks for its session contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdentity {
    /// Stable device identifier, used as a topic segment and MQTT client id.
    pub device_id: BoxStr,
    /// Primary network interface MAC address.
    pub mac: BoxStr,
    /// Device type, selects the policy resolver and shadow template.
    pub device_type: BoxStr,
    #[serde(default)]
    pub hardware: HardwareInfo,
    #[serde(default)]
    pub firmware: FirmwareInfo,
    #[serde(default)]
    pub capabilities: BoxList<Capability>,
    /// Tenant claimed by the device. The transport may override it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<BoxStr>,
}

impl DeviceIdentity {
    /// Resolve the capability list into a typed set once per request.
    pub fn capability_set(&self) -> CapabilitySet {
        CapabilitySet::from_capabilities(&self.capabilities)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HardwareInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<BoxStr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<BoxStr>,
}

/// Firmware the device currently runs.
///
/// Every field is parsed leniently: a malformed value becomes `None` instead
/// of failing the request, and the OTA decision treats it as unknown.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirmwareInfo {
    #[serde(
        default,
        deserialize_with = "lenient_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub current: Option<BoxStr>,
    #[serde(
        default,
        deserialize_with = "lenient_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub build: Option<BoxStr>,
    #[serde(
        default,
        deserialize_with = "lenient_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub min_required: Option<BoxStr>,
    #[serde(
        default,
        deserialize_with = "lenient_channel",
        skip_serializing_if = "Option::is_none"
    )]
    pub channel: Option<FirmwareChannel>,
}

/// Release channel a device follows for firmware updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FirmwareChannel {
    Stable,
    Beta,
    Dev,
}

impl FirmwareChannel {
    pub const ALL: [FirmwareChannel; 3] = [Self::Stable, Self::Beta, Self::Dev];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stable => "stable",
            Self::Beta => "beta",
            Self::Dev => "dev",
        }
    }
}

impl fmt::Display for FirmwareChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown firmware channel {0:?}")]
pub struct UnknownChannel(pub String);

impl FromStr for FirmwareChannel {
    type Err = UnknownChannel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "stable" => Ok(Self::Stable),
            "beta" => Ok(Self::Beta),
            "dev" => Ok(Self::Dev),
            other => Err(UnknownChannel(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capability {
    pub name: BoxStr,
    #[serde(
        default,
        deserialize_with = "lenient_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub version: Option<BoxStr>,
}

/// Capabilities of one device, resolved once from the identity payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilitySet {
    low_power: bool,
    names: BTreeSet<BoxStr>,
}

impl CapabilitySet {
    pub const LOW_POWER_MODE: &'static str = "low_power_mode";

    pub fn from_capabilities(capabilities: &[Capability]) -> Self {
        let names: BTreeSet<BoxStr> = capabilities
            .iter()
            .map(|c| c.name.trim())
            .filter(|name| !name.is_empty())
            .map(Into::into)
            .collect();

        Self {
            low_power: names.contains(Self::LOW_POWER_MODE),
            names,
        }
    }

    /// Device asked for reduced delivery guarantees to save power.
    pub fn low_power(&self) -> bool {
        self.low_power
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// MQTT delivery guarantee, carried on the wire as 0, 1 or 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Qos {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid qos level {0}, expected 0, 1 or 2")]
pub struct InvalidQos(pub u8);

impl From<Qos> for u8 {
    fn from(qos: Qos) -> Self {
        qos as u8
    }
}

impl TryFrom<u8> for Qos {
    type Error = InvalidQos;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Qos::AtMostOnce),
            1 => Ok(Qos::AtLeastOnce),
            2 => Ok(Qos::ExactlyOnce),
            other => Err(InvalidQos(other)),
        }
    }
}

/// QoS and retain flag the broker must apply to one topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QosRetainEntry {
    pub topic: String,
    pub qos: Qos,
    pub retain: bool,
}

/// Topics one credential may publish to and subscribe from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AclSet {
    pub publish: Vec<String>,
    pub subscribe: Vec<String>,
}

impl AclSet {
    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.publish
            .iter()
            .chain(self.subscribe.iter())
            .map(String::as_str)
    }
}

/// Output of a policy resolver for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPolicy {
    pub qos_retain: Vec<QosRetainEntry>,
    pub acl: AclSet,
}

impl ResolvedPolicy {
    pub fn entry(&self, topic: &str) -> Option<&QosRetainEntry> {
        self.qos_retain.iter().find(|e| e.topic == topic)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionPolicy {
    pub telemetry_days: u32,
    pub event_days: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            telemetry_days: 30,
            event_days: 90,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestPolicy {
    pub max_payload_bytes: u32,
    pub max_messages_per_second: u32,
}

impl Default for IngestPolicy {
    fn default() -> Self {
        Self {
            max_payload_bytes: 256 * 1024,
            max_messages_per_second: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerEndpoint {
    pub url: String,
    /// Lower values are tried first.
    pub priority: u8,
}

/// Last-will message the broker publishes when the device drops off.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastWill {
    pub topic: String,
    pub payload: String,
    pub qos: Qos,
    pub retain: bool,
}

/// Reconnect backoff the device should follow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backoff {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_ms: 1_000,
            max_ms: 60_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Broker session contract issued to one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MqttCredential {
    pub client_id: String,
    pub username: String,
    pub password: String,
    pub password_expires_at: Timestamp,
    /// Keepalive in seconds.
    pub keepalive: u16,
    /// Session expiry interval in seconds.
    pub session_expiry: u32,
    pub clean_start: bool,
    pub brokers: Vec<BrokerEndpoint>,
    pub lwt: LastWill,
    pub backoff: Backoff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OtaPriority {
    High,
    Medium,
    Low,
}

impl OtaPriority {
    pub fn for_channel(channel: FirmwareChannel) -> Self {
        match channel {
            FirmwareChannel::Stable => Self::High,
            FirmwareChannel::Beta => Self::Medium,
            FirmwareChannel::Dev => Self::Low,
        }
    }
}

/// Network the device must be on before it downloads an image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkRequirement {
    #[default]
    Any,
    Wifi,
    Wired,
    Unmetered,
}

/// Local maintenance window for applying an upgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: jiff::civil::Time,
    pub end: jiff::civil::Time,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirmwareConstraints {
    pub min_battery_pct: u8,
    pub network: NetworkRequirement,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_window: Option<TimeWindow>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware_version: Option<String>,
    pub device_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetFirmware {
    pub version: String,
    pub build: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    pub constraints: FirmwareConstraints,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OtaStrategy {
    pub force: bool,
    pub priority: OtaPriority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_window: Option<TimeWindow>,
}

/// Whether the device should upgrade, and how.
///
/// `target_firmware` is present exactly when `available` is true; build
/// values through [`OtaDecision::unavailable`] and [`OtaDecision::upgrade`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OtaDecision {
    pub available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_firmware: Option<TargetFirmware>,
    pub strategy: OtaStrategy,
}

impl OtaDecision {
    pub fn unavailable(priority: OtaPriority) -> Self {
        Self {
            available: false,
            target_firmware: None,
            strategy: OtaStrategy {
                force: false,
                priority,
                time_window: None,
            },
        }
    }

    pub fn upgrade(target: TargetFirmware, force: bool, priority: OtaPriority) -> Self {
        let time_window = target.constraints.time_window;
        Self {
            available: true,
            target_firmware: Some(target),
            strategy: OtaStrategy {
                force,
                priority,
                time_window,
            },
        }
    }
}

/// Provisioning section of the envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CfgSection {
    pub device_id: String,
    pub tenant_id: String,
    pub device_type: String,
    pub issued_at: Timestamp,
    /// The envelope, and any cached copy of it, is void after this instant.
    pub expires_at: Timestamp,
    pub topics: TopicSet,
    /// Policy came from the generic fallback resolver.
    pub degraded: bool,
}

/// Desired state seeded into the device shadow on first connect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShadowDesired {
    pub version: u64,
    pub heartbeat_interval_secs: u32,
    pub sampling_interval_secs: u32,
    pub thresholds: BTreeMap<String, f64>,
    pub features: BTreeMap<String, bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policies {
    pub qos_retain: Vec<QosRetainEntry>,
    pub acl: AclSet,
    pub retention: RetentionPolicy,
    pub ingest: IngestPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebsocketInfo {
    pub url: String,
    pub path: String,
    pub protocols: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeData {
    pub cfg: CfgSection,
    pub mqtt: MqttCredential,
    pub ota: OtaDecision,
    pub shadow_desired: ShadowDesired,
    pub policies: Policies,
    pub server_time: Timestamp,
    pub websocket: WebsocketInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    pub reason: String,
}

/// Wire response for a bootstrap call, shared by success and failure.
///
/// `data` is `null` on failure; `error_code` and `error_details` are only
/// present on failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapEnvelope {
    pub code: u16,
    pub message: String,
    pub timestamp: Timestamp,
    pub signature: String,
    pub data: Option<EnvelopeData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_details: Option<ErrorDetails>,
}

impl BootstrapEnvelope {
    pub const OK: u16 = 200;

    pub fn is_success(&self) -> bool {
        self.code == Self::OK && self.data.is_some()
    }

    pub fn expires_at(&self) -> Option<Timestamp> {
        self.data.as_ref().map(|d| d.cfg.expires_at)
    }

    /// A successful, signed envelope that has not expired at `now`.
    pub fn is_servable_at(&self, now: Timestamp) -> bool {
        self.is_success()
            && !self.signature.is_empty()
            && self.expires_at().is_some_and(|expires| expires > now)
    }
}

fn lenient_text<'de, D>(deserializer: D) -> Result<Option<BoxStr>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) if !s.trim().is_empty() => {
            Some(s.trim().to_string().into_boxed_str())
        }
        Some(serde_json::Value::Number(n)) => Some(n.to_string().into_boxed_str()),
        _ => None,
    })
}

fn lenient_channel<'de, D>(deserializer: D) -> Result<Option<FirmwareChannel>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => s.parse().ok(),
        _ => None,
    })
}
