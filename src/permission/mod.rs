//! Bitmask permission model.
//!
//! A permission is one bit (`0..=63`) in a `u64`. Roles aggregate bits for a
//! scope key (`"<service>"` or `"<service>:<resource>"`); a user's effective
//! mask for a scope key is the OR of every role they hold for it.
//!
//! idgate's own administrative permissions live under the scope key
//! [`SYSTEM_SERVICE_CODE`] and use the bits in [`bits`].

mod store;

pub use store::{InMemoryPermissionStore, PermissionStore, Role};

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::error::{StoreError, with_deadline};
use crate::token::Scopes;

/// Service code of the identity provider itself.
pub const SYSTEM_SERVICE_CODE: &str = "idgate";

/// Named bit indexes for idgate's own management permissions.
pub mod bits {
    /// Create, update and delete users.
    pub const MANAGE_USERS: u8 = 0;
    /// Create, update and delete roles.
    pub const MANAGE_ROLES: u8 = 1;
    /// Define permissions and assign roles.
    pub const MANAGE_PERMISSIONS: u8 = 2;
    /// Register and edit services/clients.
    pub const MANAGE_SERVICES: u8 = 3;
    /// Unrestricted administrator.
    pub const SYSTEM_ADMIN: u8 = 63;
}

/// The four `MANAGE_*` bits together.
pub const MANAGEMENT_MASK: u64 = (1 << bits::MANAGE_USERS)
    | (1 << bits::MANAGE_ROLES)
    | (1 << bits::MANAGE_PERMISSIONS)
    | (1 << bits::MANAGE_SERVICES);

/// Permission engine failures.
#[derive(Debug, Error)]
pub enum PermissionError {
    /// A bit index outside `0..=63`.
    #[error("permission bit {0} out of range (0..=63)")]
    InvalidBit(u8),

    /// The role store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Mask with the given bit indexes set.
pub fn mask_of(bits: &[u8]) -> Result<u64, PermissionError> {
    bits.iter().try_fold(0u64, |mask, &bit| {
        if bit > 63 {
            Err(PermissionError::InvalidBit(bit))
        } else {
            Ok(mask | (1 << bit))
        }
    })
}

/// Whether bit `bit` is set. Out-of-range bits are never set.
#[must_use]
pub fn has_bit(mask: u64, bit: u8) -> bool {
    bit < 64 && mask & (1 << bit) != 0
}

/// Whether any bit of `required` is set in `mask`.
#[must_use]
pub fn has_any(mask: u64, required: u64) -> bool {
    mask & required != 0
}

/// Whether every bit of `required` is set in `mask`. An empty `required`
/// is never satisfied.
#[must_use]
pub fn has_all(mask: u64, required: u64) -> bool {
    required != 0 && mask & required == required
}

/// System administrator bit.
#[must_use]
pub fn has_system_admin(mask: u64) -> bool {
    has_bit(mask, bits::SYSTEM_ADMIN)
}

/// `MANAGE_USERS` bit.
#[must_use]
pub fn has_manage_users(mask: u64) -> bool {
    has_bit(mask, bits::MANAGE_USERS)
}

/// `MANAGE_ROLES` bit.
#[must_use]
pub fn has_manage_roles(mask: u64) -> bool {
    has_bit(mask, bits::MANAGE_ROLES)
}

/// `MANAGE_PERMISSIONS` bit.
#[must_use]
pub fn has_manage_permissions(mask: u64) -> bool {
    has_bit(mask, bits::MANAGE_PERMISSIONS)
}

/// `MANAGE_SERVICES` bit.
#[must_use]
pub fn has_manage_services(mask: u64) -> bool {
    has_bit(mask, bits::MANAGE_SERVICES)
}

/// Any management bit, or system admin.
#[must_use]
pub fn has_any_management_permission(mask: u64) -> bool {
    has_any(mask, MANAGEMENT_MASK | (1 << bits::SYSTEM_ADMIN))
}

/// All four management bits.
#[must_use]
pub fn has_all_management_permissions(mask: u64) -> bool {
    has_all(mask, MANAGEMENT_MASK)
}

/// Scope key for idgate's own permissions, optionally on one resource.
#[must_use]
pub fn system_scope_key(resource: Option<&str>) -> String {
    match resource {
        Some(resource) => format!("{SYSTEM_SERVICE_CODE}:{resource}"),
        None => SYSTEM_SERVICE_CODE.to_string(),
    }
}

/// Turns role assignments into the scope map embedded in access tokens.
pub struct PermissionEngine {
    store: Arc<dyn PermissionStore>,
    store_timeout: Duration,
}

impl PermissionEngine {
    /// Create an engine over a role store. Every store call is bounded by
    /// `store_timeout`.
    #[must_use]
    pub fn new(store: Arc<dyn PermissionStore>, store_timeout: Duration) -> Self {
        Self {
            store,
            store_timeout,
        }
    }

    /// Effective bitmask per scope key for `user_id`.
    ///
    /// Scope keys whose combined mask is zero are omitted.
    pub async fn build_scopes(&self, user_id: &str) -> Result<Scopes, PermissionError> {
        let roles = with_deadline(self.store_timeout, self.store.roles_for_user(user_id)).await?;

        let mut scopes = Scopes::new();
        for role in roles {
            *scopes.entry(role.scope_key()).or_default() |= role.bitmask;
        }
        scopes.retain(|_, mask| *mask != 0);

        debug!(user_id = %user_id, scope_keys = scopes.len(), "Scopes built");
        Ok(scopes)
    }

    /// Current permission version of `user_id`.
    pub async fn permission_version(&self, user_id: &str) -> Result<i64, PermissionError> {
        Ok(with_deadline(self.store_timeout, self.store.permission_version(user_id)).await?)
    }
}
