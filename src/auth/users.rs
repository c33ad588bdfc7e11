//! User accounts and Argon2id password hashing.

use std::sync::OnceLock;

use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;

/// A user account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// User id.
    pub id: Uuid,
    /// Unique login name.
    pub username: String,
    /// Optional unique email.
    #[serde(default)]
    pub email: String,
    /// Given name.
    #[serde(default)]
    pub first_name: String,
    /// Family name.
    #[serde(default)]
    pub last_name: String,
    /// PHC-formatted Argon2id hash.
    #[serde(skip_serializing, default)]
    pub password_hash: String,
    /// Inactive users cannot log in.
    pub active: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Public projection of a [`User`], without the hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    /// User id.
    pub id: Uuid,
    /// Login name.
    pub username: String,
    /// Email, possibly empty.
    pub email: String,
    /// Given name.
    pub first_name: String,
    /// Family name.
    pub last_name: String,
    /// Whether the account is active.
    pub is_active: bool,
}

impl From<&User> for UserProfile {
    fn from(u: &User) -> Self {
        Self {
            id: u.id,
            username: u.username.clone(),
            email: u.email.clone(),
            first_name: u.first_name.clone(),
            last_name: u.last_name.clone(),
            is_active: u.active,
        }
    }
}

/// Hash `password` with Argon2id and a random salt.
pub fn hash_password(password: &str) -> Result<String, argon2::password_hash::Error> {
    let salt = SaltString::encode_b64(&rand::random::<[u8; 16]>())?;
    Ok(Argon2::default()
        .hash_password(password.as_bytes(), &salt)?
        .to_string())
}

/// Check `password` against a PHC hash. Malformed hashes never verify.
#[must_use]
pub fn verify_password(password: &str, hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

/// A valid hash of no real password, verified against when the user is
/// unknown so both login failures cost one Argon2 run.
pub(crate) fn dummy_password_hash() -> &'static str {
    static DUMMY: OnceLock<String> = OnceLock::new();
    DUMMY.get_or_init(|| {
        let password = URL_SAFE_NO_PAD.encode(rand::random::<[u8; 32]>());
        hash_password(&password).unwrap_or_default()
    })
}

/// User persistence.
#[async_trait::async_trait]
pub trait UserRepository: Send + Sync + 'static {
    /// Find by login name.
    async fn find_by_username(&self, username: &str) -> Result<Option<User>, StoreError>;

    /// Find by email.
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, StoreError>;

    /// Find by id.
    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError>;

    /// Insert a new user. Duplicate username or email is a conflict.
    async fn create(&self, user: User) -> Result<(), StoreError>;

    /// Replace an existing user.
    async fn update(&self, user: User) -> Result<(), StoreError>;

    /// Delete a user. Returns whether it existed.
    async fn delete(&self, id: Uuid) -> Result<bool, StoreError>;
}

/// In-memory user repository.
#[derive(Debug, Default)]
pub struct InMemoryUserRepository {
    users: DashMap<Uuid, User>,
}

impl InMemoryUserRepository {
    /// Create an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn find(&self, pred: impl Fn(&User) -> bool) -> Option<User> {
        self.users.iter().find(|u| pred(u)).map(|u| u.clone())
    }
}

#[async_trait::async_trait]
impl UserRepository for InMemoryUserRepository {
    async fn find_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
        Ok(self.find(|u| u.username == username))
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        if email.is_empty() {
            return Ok(None);
        }
        Ok(self.find(|u| u.email.eq_ignore_ascii_case(email)))
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        Ok(self.users.get(&id).map(|u| u.clone()))
    }

    async fn create(&self, user: User) -> Result<(), StoreError> {
        if self.find(|u| u.username == user.username).is_some() {
            return Err(StoreError::Conflict("username taken".into()));
        }
        if !user.email.is_empty()
            && self
                .find(|u| u.email.eq_ignore_ascii_case(&user.email))
                .is_some()
        {
            return Err(StoreError::Conflict("email taken".into()));
        }
        self.users.insert(user.id, user);
        Ok(())
    }

    async fn update(&self, user: User) -> Result<(), StoreError> {
        match self.users.get_mut(&user.id) {
            Some(mut row) => {
                *row = user;
                Ok(())
            }
            None => Err(StoreError::Conflict(format!("user {} not found", user.id))),
        }
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        Ok(self.users.remove(&id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(name: &str, email: &str) -> User {
        User {
            id: Uuid::new_v4(),
            username: name.into(),
            email: email.into(),
            first_name: String::new(),
            last_name: String::new(),
            password_hash: String::new(),
            active: true,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn password_hash_verifies() {
        let hash = hash_password("correct horse").unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(verify_password("correct horse", &hash));
        assert!(!verify_password("wrong horse", &hash));
    }

    #[test]
    fn malformed_hash_never_verifies() {
        assert!(!verify_password("anything", "not-a-phc-string"));
        assert!(!verify_password("", ""));
    }

    #[test]
    fn dummy_hash_is_a_real_argon2_hash() {
        let dummy = dummy_password_hash();
        assert!(dummy.starts_with("$argon2id$"));
        assert!(PasswordHash::new(dummy).is_ok());
        assert!(!verify_password("", dummy));
        assert_eq!(dummy, dummy_password_hash());
    }

    #[test]
    fn profile_omits_hash() {
        let mut u = user("ada", "ada@example.com");
        u.password_hash = "$argon2id$secret".into();
        let json = serde_json::to_value(UserProfile::from(&u)).unwrap();
        assert!(json.get("password_hash").is_none());
        assert_eq!(json["username"], "ada");

        let raw = serde_json::to_value(&u).unwrap();
        assert!(raw.get("password_hash").is_none());
    }

    #[tokio::test]
    async fn duplicates_conflict() {
        let repo = InMemoryUserRepository::new();
        repo.create(user("ada", "ada@example.com")).await.unwrap();

        assert!(matches!(
            repo.create(user("ada", "")).await,
            Err(StoreError::Conflict(_))
        ));
        assert!(matches!(
            repo.create(user("grace", "ADA@example.com")).await,
            Err(StoreError::Conflict(_))
        ));
        // empty emails never collide
        repo.create(user("grace", "")).await.unwrap();
        repo.create(user("linus", "")).await.unwrap();
    }

    #[tokio::test]
    async fn crud() {
        let repo = InMemoryUserRepository::new();
        let mut u = user("ada", "ada@example.com");
        repo.create(u.clone()).await.unwrap();

        assert_eq!(repo.find_by_id(u.id).await.unwrap(), Some(u.clone()));
        assert!(repo.find_by_email("ada@example.com").await.unwrap().is_some());

        u.active = false;
        repo.update(u.clone()).await.unwrap();
        assert!(!repo.find_by_username("ada").await.unwrap().unwrap().active);

        assert!(repo.delete(u.id).await.unwrap());
        assert!(repo.find_by_username("ada").await.unwrap().is_none());
    }
}
