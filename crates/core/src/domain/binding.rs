use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::instance::InstanceId;
use crate::domain::tenant::TenantId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BindingId(pub String);

/// CRM Open Line channel identifier, as assigned by the CRM.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LineId(pub String);

impl std::fmt::Display for LineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 1:1 association between a CRM line and a WA instance within a tenant.
/// Re-binding either side overwrites the prior mapping.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    pub id: BindingId,
    pub tenant_id: TenantId,
    pub line_id: LineId,
    pub instance_id: InstanceId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
