use async_trait::async_trait;
use halo_core::TopicError;
use halo_core::topic::{KEY_DELIMITER, SegmentKind, validate_segment};
use jiff::{SignedDuration, Timestamp};
use rand::{Rng, distr::Alphanumeric};

/// Broker login material for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCredential {
    pub username: String,
    pub password: String,
    pub expires_at: Timestamp,
}

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("credential backend unavailable: {0}")]
    Unavailable(String),
    #[error("credential expiry out of range: {0}")]
    Expiry(#[from] jiff::Error),
    #[error("cannot derive a broker username: {0}")]
    Identity(#[from] TopicError),
}

/// Issues a fresh broker password for every call.
#[async_trait]
pub trait CredentialIssuer: Send + Sync + 'static {
    async fn issue(&self, device_id: &str, tenant_id: &str)
    -> Result<IssuedCredential, CredentialError>;
}

/// Generates random alphanumeric passwords with a bounded lifetime.
///
/// The broker side is expected to pick the password up from its own auth
/// backend; this issuer only produces it.
#[derive(Debug, Clone)]
pub struct RandomCredentialIssuer {
    ttl: SignedDuration,
    password_length: usize,
}

impl RandomCredentialIssuer {
    pub fn new(ttl: SignedDuration, password_length: usize) -> Self {
        Self {
            ttl,
            password_length,
        }
    }
}

#[async_trait]
impl CredentialIssuer for RandomCredentialIssuer {
    async fn issue(
        &self,
        device_id: &str,
        tenant_id: &str,
    ) -> Result<IssuedCredential, CredentialError> {
        validate_segment(SegmentKind::Tenant, tenant_id)?;
        validate_segment(SegmentKind::DeviceId, device_id)?;
        let expires_at = Timestamp::now().checked_add(self.ttl)?;

        Ok(IssuedCredential {
            username: format!("{tenant_id}{KEY_DELIMITER}{device_id}"),
            password: random_password(self.password_length),
            expires_at,
        })
    }
}

fn random_password(length: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}
