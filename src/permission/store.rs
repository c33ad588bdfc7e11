//! Role and assignment storage feeding the permission engine.

use std::collections::BTreeSet;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{PermissionError, mask_of};
use crate::error::StoreError;

/// A role: a bitmask of permissions on one service, optionally narrowed to
/// one resource of that service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    /// Role id.
    pub id: String,
    /// Service code (`"billing"`).
    pub service_code: String,
    /// Resource inside the service (`"invoices"`), or `None` for service-wide.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    /// Granted permission bits.
    pub bitmask: u64,
}

impl Role {
    /// Build a role from bit indexes (each `0..=63`).
    pub fn new(
        id: impl Into<String>,
        service_code: impl Into<String>,
        resource: Option<&str>,
        bits: &[u8],
    ) -> Result<Self, PermissionError> {
        Ok(Self {
            id: id.into(),
            service_code: service_code.into(),
            resource: resource.map(str::to_string),
            bitmask: mask_of(bits)?,
        })
    }

    /// `"<service>"` or `"<service>:<resource>"`.
    #[must_use]
    pub fn scope_key(&self) -> String {
        match &self.resource {
            Some(resource) => format!("{}:{resource}", self.service_code),
            None => self.service_code.clone(),
        }
    }
}

/// Role/permission persistence consumed by [`PermissionEngine`](super::PermissionEngine).
#[async_trait::async_trait]
pub trait PermissionStore: Send + Sync + 'static {
    /// Every role currently assigned to `user_id`.
    async fn roles_for_user(&self, user_id: &str) -> Result<Vec<Role>, StoreError>;

    /// Current permission version of `user_id`. Users with no history are at 1.
    async fn permission_version(&self, user_id: &str) -> Result<i64, StoreError>;
}

/// In-memory role store.
///
/// Every mutation that can change a user's effective permissions bumps that
/// user's version, including edits to a role the user holds.
#[derive(Debug, Default)]
pub struct InMemoryPermissionStore {
    roles: DashMap<String, Role>,
    assignments: DashMap<String, BTreeSet<String>>,
    versions: DashMap<String, i64>,
}

impl InMemoryPermissionStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a role.
    pub fn upsert_role(&self, role: Role) {
        let id = role.id.clone();
        self.roles.insert(id.clone(), role);
        self.bump_holders(&id);
    }

    /// Delete a role and drop it from every assignment.
    pub fn delete_role(&self, role_id: &str) -> bool {
        let removed = self.roles.remove(role_id).is_some();
        if removed {
            self.bump_holders(role_id);
            for mut entry in self.assignments.iter_mut() {
                entry.value_mut().remove(role_id);
            }
        }
        removed
    }

    /// Assign a role to a user. Unknown roles are rejected.
    pub fn assign_role(&self, user_id: &str, role_id: &str) -> Result<(), StoreError> {
        if !self.roles.contains_key(role_id) {
            return Err(StoreError::Conflict(format!("unknown role {role_id}")));
        }
        let inserted = self
            .assignments
            .entry(user_id.to_string())
            .or_default()
            .insert(role_id.to_string());
        if inserted {
            self.bump(user_id);
        }
        Ok(())
    }

    /// Remove a role from a user.
    pub fn unassign_role(&self, user_id: &str, role_id: &str) -> bool {
        let removed = self
            .assignments
            .get_mut(user_id)
            .is_some_and(|mut set| set.remove(role_id));
        if removed {
            self.bump(user_id);
        }
        removed
    }

    fn bump(&self, user_id: &str) {
        let mut version = self.versions.entry(user_id.to_string()).or_insert(1);
        *version += 1;
        debug!(user_id = %user_id, version = *version, "Permission version bumped");
    }

    fn bump_holders(&self, role_id: &str) {
        let holders: Vec<String> = self
            .assignments
            .iter()
            .filter(|entry| entry.value().contains(role_id))
            .map(|entry| entry.key().clone())
            .collect();
        for user_id in holders {
            self.bump(&user_id);
        }
    }
}

#[async_trait::async_trait]
impl PermissionStore for InMemoryPermissionStore {
    async fn roles_for_user(&self, user_id: &str) -> Result<Vec<Role>, StoreError> {
        let Some(role_ids) = self.assignments.get(user_id).map(|set| set.clone()) else {
            return Ok(Vec::new());
        };
        Ok(role_ids
            .iter()
            .filter_map(|id| self.roles.get(id).map(|role| role.clone()))
            .collect())
    }

    async fn permission_version(&self, user_id: &str) -> Result<i64, StoreError> {
        Ok(self.versions.get(user_id).map_or(1, |v| *v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_role() -> InMemoryPermissionStore {
        let store = InMemoryPermissionStore::new();
        store.upsert_role(Role::new("billing-admin", "billing", None, &[0, 1]).unwrap());
        store
    }

    #[tokio::test]
    async fn new_users_start_at_version_one() {
        let store = InMemoryPermissionStore::new();
        assert_eq!(store.permission_version("nobody").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn version_increases_on_every_relevant_change() {
        // GIVEN: a user holding one role
        let store = store_with_role();
        store.assign_role("u1", "billing-admin").unwrap();
        let v1 = store.permission_version("u1").await.unwrap();

        // WHEN: the role is edited, then removed from the user
        store.upsert_role(Role::new("billing-admin", "billing", None, &[0]).unwrap());
        let v2 = store.permission_version("u1").await.unwrap();
        store.unassign_role("u1", "billing-admin");
        let v3 = store.permission_version("u1").await.unwrap();

        // THEN: each step strictly increases the version
        assert!(v1 > 1);
        assert!(v2 > v1);
        assert!(v3 > v2);
    }

    #[tokio::test]
    async fn idempotent_assignment_does_not_bump() {
        let store = store_with_role();
        store.assign_role("u1", "billing-admin").unwrap();
        let before = store.permission_version("u1").await.unwrap();
        store.assign_role("u1", "billing-admin").unwrap();
        assert_eq!(store.permission_version("u1").await.unwrap(), before);
    }

    #[tokio::test]
    async fn unrelated_role_edit_does_not_bump() {
        let store = store_with_role();
        store.assign_role("u1", "billing-admin").unwrap();
        let before = store.permission_version("u1").await.unwrap();

        store.upsert_role(Role::new("crm-reader", "crm", None, &[0]).unwrap());

        assert_eq!(store.permission_version("u1").await.unwrap(), before);
    }

    #[tokio::test]
    async fn deleted_role_disappears_from_assignments() {
        let store = store_with_role();
        store.assign_role("u1", "billing-admin").unwrap();

        assert!(store.delete_role("billing-admin"));

        assert!(store.roles_for_user("u1").await.unwrap().is_empty());
    }

    #[test]
    fn assigning_unknown_role_is_rejected() {
        let store = InMemoryPermissionStore::new();
        assert!(matches!(
            store.assign_role("u1", "ghost"),
            Err(StoreError::Conflict(_))
        ));
    }

    #[test]
    fn scope_key_includes_resource() {
        let role = Role::new("r", "billing", Some("invoices"), &[2]).unwrap();
        assert_eq!(role.scope_key(), "billing:invoices");
        assert_eq!(role.bitmask, 0b100);
    }
}
