use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::tenant::TenantId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContactId(pub String);

impl std::fmt::Display for ContactId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Phone-number identity within a tenant, created lazily on first inbound
/// message. (tenant, phone) is unique.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub id: ContactId,
    pub tenant_id: TenantId,
    pub phone: String,
    pub display_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Normalize a WA sender identity into an E.164-shaped phone number.
///
/// Provider JIDs look like `5511999999999@s.whatsapp.net`; the domain part is
/// dropped, non-digits are stripped, and a leading `+` is restored.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let local = raw.split('@').next().unwrap_or(raw);
    let digits: String = local.chars().filter(char::is_ascii_digit).collect();
    if digits.len() < 5 || digits.len() > 15 {
        return None;
    }
    Some(format!("+{digits}"))
}
