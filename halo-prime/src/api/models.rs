use halo_core::DeviceIdentity;
use serde::{Deserialize, Serialize};

/// Body of `POST /api/v1/bootstrap`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapRequest {
    pub identity: DeviceIdentity,
    #[serde(default)]
    pub message_id: Option<String>,
    /// Tenant asserted by the transport. Wins over the identity's own claim.
    #[serde(default)]
    pub tenant_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantRegistrationResponse {
    pub tenant_id: String,
    pub registered: bool,
    pub device_types: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidationResponse {
    pub tenant_id: String,
    pub removed: usize,
}
