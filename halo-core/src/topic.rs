//! Topic string codec.
//!
//! Every device topic has the shape
//! `iot/{tenant}/{device_type}/{device_id}/{channel}[/{subchannel}]`.
//! Segments are validated so that a composed topic never contains an empty
//! level, a `//`, or an MQTT wildcard, which keeps it usable in broker ACLs.
//! Segments are also free of [`KEY_DELIMITER`], so keys and usernames joined
//! with it split back unambiguously.

use std::fmt;

use serde::{Deserialize, Serialize};

pub const TOPIC_ROOT: &str = "iot";
pub const MAX_SEGMENT_LEN: usize = 128;
/// Joins identity segments in cache keys and broker usernames.
pub const KEY_DELIMITER: char = ':';

const MIN_LEVELS: usize = 5;
const MAX_LEVELS: usize = 6;

/// Which part of a topic a segment fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    Tenant,
    DeviceType,
    DeviceId,
    Channel,
    Subchannel,
}

impl fmt::Display for SegmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tenant => "tenant",
            Self::DeviceType => "device type",
            Self::DeviceId => "device id",
            Self::Channel => "channel",
            Self::Subchannel => "subchannel",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentFault {
    Empty,
    Separator,
    Delimiter,
    Wildcard,
    Whitespace,
    TooLong,
}

impl fmt::Display for SegmentFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Empty => "segment is empty",
            Self::Separator => "segment contains '/'",
            Self::Delimiter => "segment contains ':'",
            Self::Wildcard => "segment contains an MQTT wildcard",
            Self::Whitespace => "segment contains whitespace or control characters",
            Self::TooLong => "segment is too long",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopicError {
    #[error("invalid {kind} segment {value:?}: {fault}")]
    InvalidSegment {
        kind: SegmentKind,
        value: String,
        fault: SegmentFault,
    },
}

/// Check a single topic level. Case is preserved and never normalised.
pub fn validate_segment(kind: SegmentKind, value: &str) -> Result<(), TopicError> {
    let fault = if value.is_empty() {
        Some(SegmentFault::Empty)
    } else if value.len() > MAX_SEGMENT_LEN {
        Some(SegmentFault::TooLong)
    } else if value.contains('/') {
        Some(SegmentFault::Separator)
    } else if value.contains(KEY_DELIMITER) {
        Some(SegmentFault::Delimiter)
    } else if value.contains(['+', '#']) {
        Some(SegmentFault::Wildcard)
    } else if value.chars().any(|c| c.is_whitespace() || c.is_control()) {
        Some(SegmentFault::Whitespace)
    } else {
        None
    };

    match fault {
        Some(fault) => Err(TopicError::InvalidSegment {
            kind,
            value: value.to_string(),
            fault,
        }),
        None => Ok(()),
    }
}

/// Join the identity segments and channel into a topic string.
pub fn compose(
    tenant: &str,
    device_type: &str,
    device_id: &str,
    channel: &str,
    subchannel: Option<&str>,
) -> Result<String, TopicError> {
    validate_segment(SegmentKind::Tenant, tenant)?;
    validate_segment(SegmentKind::DeviceType, device_type)?;
    validate_segment(SegmentKind::DeviceId, device_id)?;
    validate_segment(SegmentKind::Channel, channel)?;
    if let Some(sub) = subchannel {
        validate_segment(SegmentKind::Subchannel, sub)?;
    }

    let mut topic = format!("{TOPIC_ROOT}/{tenant}/{device_type}/{device_id}/{channel}");
    if let Some(sub) = subchannel {
        topic.push('/');
        topic.push_str(sub);
    }

    Ok(topic)
}

/// Segments recovered from a device topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicInfo {
    pub tenant_id: String,
    pub device_type: String,
    pub device_id: String,
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subchannel: Option<String>,
}

impl TopicInfo {
    /// Map the channel back onto the fixed catalogue, if it belongs to it.
    pub fn known_channel(&self) -> Option<TopicChannel> {
        TopicChannel::from_segments(&self.channel, self.subchannel.as_deref())
    }
}

/// Split a device topic back into its segments.
///
/// Returns `None` for anything that `compose` could not have produced.
pub fn parse(topic: &str) -> Option<TopicInfo> {
    let levels: Vec<&str> = topic.split('/').collect();
    if !(MIN_LEVELS..=MAX_LEVELS).contains(&levels.len()) || levels[0] != TOPIC_ROOT {
        return None;
    }

    let kinds = [
        SegmentKind::Tenant,
        SegmentKind::DeviceType,
        SegmentKind::DeviceId,
        SegmentKind::Channel,
        SegmentKind::Subchannel,
    ];
    for (kind, level) in kinds.iter().zip(&levels[1..]) {
        validate_segment(*kind, level).ok()?;
    }

    Some(TopicInfo {
        tenant_id: levels[1].to_string(),
        device_type: levels[2].to_string(),
        device_id: levels[3].to_string(),
        channel: levels[4].to_string(),
        subchannel: levels.get(5).map(|s| s.to_string()),
    })
}

/// Fixed channel catalogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicChannel {
    Telemetry,
    Status,
    Event,
    Cmd,
    Cfg,
    CmdRes,
    OtaProgress,
    OtaStatus,
    ShadowReported,
    ShadowDesired,
}

impl TopicChannel {
    pub const ALL: [TopicChannel; 10] = [
        Self::Telemetry,
        Self::Status,
        Self::Event,
        Self::Cmd,
        Self::Cfg,
        Self::CmdRes,
        Self::OtaProgress,
        Self::OtaStatus,
        Self::ShadowReported,
        Self::ShadowDesired,
    ];

    pub fn segments(&self) -> (&'static str, Option<&'static str>) {
        match self {
            Self::Telemetry => ("telemetry", None),
            Self::Status => ("status", None),
            Self::Event => ("event", None),
            Self::Cmd => ("cmd", None),
            Self::Cfg => ("cfg", None),
            Self::CmdRes => ("cmdres", None),
            Self::OtaProgress => ("ota", Some("progress")),
            Self::OtaStatus => ("ota", Some("status")),
            Self::ShadowReported => ("shadow", Some("reported")),
            Self::ShadowDesired => ("shadow", Some("desired")),
        }
    }

    /// Channel part of the topic, e.g. `shadow/desired`. Tenant policy
    /// overrides are keyed by this value.
    pub fn suffix(&self) -> &'static str {
        match self {
            Self::Telemetry => "telemetry",
            Self::Status => "status",
            Self::Event => "event",
            Self::Cmd => "cmd",
            Self::Cfg => "cfg",
            Self::CmdRes => "cmdres",
            Self::OtaProgress => "ota/progress",
            Self::OtaStatus => "ota/status",
            Self::ShadowReported => "shadow/reported",
            Self::ShadowDesired => "shadow/desired",
        }
    }

    pub fn from_suffix(suffix: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.suffix() == suffix)
    }

    pub fn from_segments(channel: &str, subchannel: Option<&str>) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.segments() == (channel, subchannel))
    }
}

impl fmt::Display for TopicChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

/// Compose the topic of one catalogue channel.
pub fn channel_topic(
    tenant: &str,
    device_type: &str,
    device_id: &str,
    channel: TopicChannel,
) -> Result<String, TopicError> {
    let (channel, subchannel) = channel.segments();
    compose(tenant, device_type, device_id, channel, subchannel)
}

pub fn telemetry_topic(
    tenant: &str,
    device_type: &str,
    device_id: &str,
) -> Result<String, TopicError> {
    channel_topic(tenant, device_type, device_id, TopicChannel::Telemetry)
}

pub fn status_topic(
    tenant: &str,
    device_type: &str,
    device_id: &str,
) -> Result<String, TopicError> {
    channel_topic(tenant, device_type, device_id, TopicChannel::Status)
}

pub fn event_topic(tenant: &str, device_type: &str, device_id: &str) -> Result<String, TopicError> {
    channel_topic(tenant, device_type, device_id, TopicChannel::Event)
}

pub fn cmd_topic(tenant: &str, device_type: &str, device_id: &str) -> Result<String, TopicError> {
    channel_topic(tenant, device_type, device_id, TopicChannel::Cmd)
}

pub fn cfg_topic(tenant: &str, device_type: &str, device_id: &str) -> Result<String, TopicError> {
    channel_topic(tenant, device_type, device_id, TopicChannel::Cfg)
}

pub fn cmdres_topic(
    tenant: &str,
    device_type: &str,
    device_id: &str,
) -> Result<String, TopicError> {
    channel_topic(tenant, device_type, device_id, TopicChannel::CmdRes)
}

pub fn ota_progress_topic(
    tenant: &str,
    device_type: &str,
    device_id: &str,
) -> Result<String, TopicError> {
    channel_topic(tenant, device_type, device_id, TopicChannel::OtaProgress)
}

pub fn ota_status_topic(
    tenant: &str,
    device_type: &str,
    device_id: &str,
) -> Result<String, TopicError> {
    channel_topic(tenant, device_type, device_id, TopicChannel::OtaStatus)
}

pub fn shadow_reported_topic(
    tenant: &str,
    device_type: &str,
    device_id: &str,
) -> Result<String, TopicError> {
    channel_topic(tenant, device_type, device_id, TopicChannel::ShadowReported)
}

pub fn shadow_desired_topic(
    tenant: &str,
    device_type: &str,
    device_id: &str,
) -> Result<String, TopicError> {
    channel_topic(tenant, device_type, device_id, TopicChannel::ShadowDesired)
}

/// Wildcard filters for monitoring subscribers that watch every device.
pub fn subscription_patterns() -> &'static [&'static str] {
    &[
        "iot/+/+/+/telemetry",
        "iot/+/+/+/status",
        "iot/+/+/+/event",
        "iot/+/+/+/cmdres",
        "iot/+/+/+/ota/progress",
        "iot/+/+/+/ota/status",
        "iot/+/+/+/shadow/reported",
        "iot/+/+/+/#",
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicDirection {
    /// Device publishes, platform consumes.
    Publish,
    /// Platform publishes, device consumes.
    Subscribe,
}

/// The named slots of a [`TopicSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicRole {
    TelemetryPub,
    StatusPub,
    EventPub,
    CmdSub,
    CmdresPub,
    ShadowDesiredSub,
    ShadowReportedPub,
    CfgSub,
    OtaProgressPub,
}

impl TopicRole {
    pub const ALL: [TopicRole; 9] = [
        Self::TelemetryPub,
        Self::StatusPub,
        Self::EventPub,
        Self::CmdSub,
        Self::CmdresPub,
        Self::ShadowDesiredSub,
        Self::ShadowReportedPub,
        Self::CfgSub,
        Self::OtaProgressPub,
    ];

    pub fn channel(&self) -> TopicChannel {
        match self {
            Self::TelemetryPub => TopicChannel::Telemetry,
            Self::StatusPub => TopicChannel::Status,
            Self::EventPub => TopicChannel::Event,
            Self::CmdSub => TopicChannel::Cmd,
            Self::CmdresPub => TopicChannel::CmdRes,
            Self::ShadowDesiredSub => TopicChannel::ShadowDesired,
            Self::ShadowReportedPub => TopicChannel::ShadowReported,
            Self::CfgSub => TopicChannel::Cfg,
            Self::OtaProgressPub => TopicChannel::OtaProgress,
        }
    }

    pub fn direction(&self) -> TopicDirection {
        match self {
            Self::CmdSub | Self::ShadowDesiredSub | Self::CfgSub => TopicDirection::Subscribe,
            _ => TopicDirection::Publish,
        }
    }
}

/// All topics one device uses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicSet {
    pub telemetry_pub: String,
    pub status_pub: String,
    pub event_pub: String,
    pub cmd_sub: String,
    pub cmdres_pub: String,
    pub shadow_desired_sub: String,
    pub shadow_reported_pub: String,
    pub cfg_sub: String,
    pub ota_progress_pub: String,
}

impl TopicSet {
    pub fn build(tenant: &str, device_type: &str, device_id: &str) -> Result<Self, TopicError> {
        let topic = |channel| channel_topic(tenant, device_type, device_id, channel);

        Ok(Self {
            telemetry_pub: topic(TopicChannel::Telemetry)?,
            status_pub: topic(TopicChannel::Status)?,
            event_pub: topic(TopicChannel::Event)?,
            cmd_sub: topic(TopicChannel::Cmd)?,
            cmdres_pub: topic(TopicChannel::CmdRes)?,
            shadow_desired_sub: topic(TopicChannel::ShadowDesired)?,
            shadow_reported_pub: topic(TopicChannel::ShadowReported)?,
            cfg_sub: topic(TopicChannel::Cfg)?,
            ota_progress_pub: topic(TopicChannel::OtaProgress)?,
        })
    }

    pub fn get(&self, role: TopicRole) -> &str {
        match role {
            TopicRole::TelemetryPub => &self.telemetry_pub,
            TopicRole::StatusPub => &self.status_pub,
            TopicRole::EventPub => &self.event_pub,
            TopicRole::CmdSub => &self.cmd_sub,
            TopicRole::CmdresPub => &self.cmdres_pub,
            TopicRole::ShadowDesiredSub => &self.shadow_desired_sub,
            TopicRole::ShadowReportedPub => &self.shadow_reported_pub,
            TopicRole::CfgSub => &self.cfg_sub,
            TopicRole::OtaProgressPub => &self.ota_progress_pub,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (TopicRole, &str)> {
        TopicRole::ALL.into_iter().map(|role| (role, self.get(role)))
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.iter().any(|(_, t)| t == topic)
    }
}
