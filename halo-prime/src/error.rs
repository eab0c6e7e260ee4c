use halo_core::TopicError;

use crate::credentials::CredentialError;

/// Reasons a bootstrap request cannot be answered with a session contract.
///
/// Cache failures are deliberately absent: they are logged and bypassed,
/// never reported to the device.
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },
    #[error("unknown device type {device_type:?}")]
    UnknownDeviceType { device_type: String },
    #[error("tenant could not be resolved")]
    TenantNotResolved,
    #[error("credential issuance failed: {0}")]
    CredentialIssuance(#[from] CredentialError),
    #[error("failed to encode envelope: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("signing secret rejected by the MAC")]
    SigningKey,
}

impl BootstrapError {
    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field,
            reason: reason.into(),
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation { .. } => 400,
            Self::UnknownDeviceType { .. } => 422,
            Self::TenantNotResolved
            | Self::CredentialIssuance(_)
            | Self::Encoding(_)
            | Self::SigningKey => 500,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::UnknownDeviceType { .. } => "UNKNOWN_DEVICE_TYPE",
            Self::TenantNotResolved => "TENANT_NOT_RESOLVED",
            Self::CredentialIssuance(_) => "CREDENTIAL_ISSUANCE_FAILED",
            Self::Encoding(_) | Self::SigningKey => "INTERNAL_ERROR",
        }
    }

    /// Short message for the envelope. Backend details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            Self::Validation { .. } | Self::UnknownDeviceType { .. } => self.to_string(),
            Self::TenantNotResolved => "Tenant could not be resolved".to_string(),
            Self::CredentialIssuance(_) => "Unable to issue broker credentials".to_string(),
            Self::Encoding(_) | Self::SigningKey => {
                "Unable to encode bootstrap response".to_string()
            }
        }
    }
}

impl From<TopicError> for BootstrapError {
    fn from(err: TopicError) -> Self {
        let TopicError::InvalidSegment { kind, .. } = &err;
        let field = match kind {
            halo_core::SegmentKind::Tenant => "tenantId",
            halo_core::SegmentKind::DeviceType => "deviceType",
            halo_core::SegmentKind::DeviceId => "deviceId",
            halo_core::SegmentKind::Channel | halo_core::SegmentKind::Subchannel => "topic",
        };
        Self::validation(field, err.to_string())
    }
}
