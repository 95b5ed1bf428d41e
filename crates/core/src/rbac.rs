use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{PoisonError, RwLock};

/// Decides whether a user may perform an action on a resource within a tenant
pub trait AccessChecker: Send + Sync {
    fn can_execute(&self, tenant_id: &str, user_id: &str, resource: &str, action: &str) -> bool;
}

/// Grants everything; for development and single-tenant deployments
pub struct AllowAll;

impl AccessChecker for AllowAll {
    fn can_execute(&self, _tenant_id: &str, _user_id: &str, _resource: &str, _action: &str) -> bool {
        true
    }
}

/// One permission; any field may be `*`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Grant {
    pub tenant_id: String,
    pub user_id: String,
    pub resource: String,
    pub action: String,
}

impl Grant {
    pub fn new(
        tenant_id: impl Into<String>,
        user_id: impl Into<String>,
        resource: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            user_id: user_id.into(),
            resource: resource.into(),
            action: action.into(),
        }
    }

    /// Check if this grant covers a request (considering wildcards)
    pub fn matches(&self, tenant_id: &str, user_id: &str, resource: &str, action: &str) -> bool {
        fn field(granted: &str, requested: &str) -> bool {
            granted == "*" || granted == requested
        }

        field(&self.tenant_id, tenant_id)
            && field(&self.user_id, user_id)
            && field(&self.resource, resource)
            && field(&self.action, action)
    }
}

/// Explicit allow-list of grants; anything not granted is denied
#[derive(Default)]
pub struct GrantTable {
    grants: RwLock<HashSet<Grant>>,
}

impl GrantTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&self, grant: Grant) {
        self.grants
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(grant);
    }

    pub fn revoke(&self, grant: &Grant) -> bool {
        self.grants
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(grant)
    }
}

impl AccessChecker for GrantTable {
    fn can_execute(&self, tenant_id: &str, user_id: &str, resource: &str, action: &str) -> bool {
        self.grants
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|g| g.matches(tenant_id, user_id, resource, action))
    }
}
