use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::tenant::TenantId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CredentialId(pub String);

impl std::fmt::Display for CredentialId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// CRM OAuth credential for one tenant portal.
///
/// At most one active credential exists per (tenant, portal); the token
/// refresher mutates the token fields in place and always writes the latest
/// grant (last write wins under concurrent refreshes).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub id: CredentialId,
    pub tenant_id: TenantId,
    pub portal_url: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scope: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Credential {
    /// Whether the access token will be expired within `skew` of `now`.
    ///
    /// A credential without a recorded expiry is treated as non-expiring;
    /// the remote API's own 401 drives the refresh cycle in that case.
    pub fn expires_within(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at - skew <= now,
            None => false,
        }
    }
}
