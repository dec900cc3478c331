//! Tenant identity.

use serde::{Deserialize, Serialize};

/// Opaque integer identifying an isolation boundary.
///
/// Exactly one dispatch engine exists per tenant at any instant; all
/// configuration, silences, and notification state are scoped to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub i64);

impl TenantId {
    /// Parses a tenant ID from a decimal string.
    pub fn parse(s: &str) -> Result<Self, std::num::ParseIntError> {
        Ok(Self(s.trim().parse()?))
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for TenantId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}
