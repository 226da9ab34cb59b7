use serde::{Deserialize, Serialize};

/// Tenant context policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TenancyConfig {
    /// Privileged actors entering a tenant other than their home tenant must
    /// state a reason
    pub require_cross_tenant_reason: bool,
    /// Audit every activation, not only privileged or reasoned ones
    pub audit_all_activations: bool,
}

impl Default for TenancyConfig {
    fn default() -> Self {
        Self {
            require_cross_tenant_reason: true,
            audit_all_activations: false,
        }
    }
}
