use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Provider name recorded on users created through OIDC.
pub const OIDC_PROVIDER: &str = "oidc";

/// Monotonically assigned user identifier. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u64);

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A logical account, either created locally or derived from an OIDC identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
    /// Empty for OIDC users whose provider did not verify the address.
    #[serde(default)]
    pub email: String,
    /// Empty for local users, `"oidc"` otherwise.
    #[serde(default)]
    pub provider: String,
    /// `issuer/subject` for OIDC users, empty for local users.
    #[serde(default)]
    pub provider_id: String,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn is_local(&self) -> bool {
        self.provider_id.is_empty()
    }
}

/// A user row that has not been assigned an id yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUser {
    pub name: String,
    pub email: String,
    pub provider: String,
    pub provider_id: String,
}

impl NewUser {
    pub fn local(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
            provider: String::new(),
            provider_id: String::new(),
        }
    }

    pub fn oidc(
        name: impl Into<String>,
        email: impl Into<String>,
        provider_id: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
            provider: OIDC_PROVIDER.to_string(),
            provider_id: provider_id.into(),
        }
    }

    pub fn into_user(self, id: UserId, created_at: DateTime<Utc>) -> User {
        User {
            id,
            name: self.name,
            email: self.email,
            provider: self.provider,
            provider_id: self.provider_id,
            created_at,
        }
    }
}
