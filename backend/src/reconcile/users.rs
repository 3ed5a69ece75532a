//! User resolution.
//!
//! Maps validated claims to a [`User`] keyed by provider identity. Local
//! accounts are never merged into OIDC accounts: when a local user looks like
//! the same person (same name, or the name the old email-derived naming would
//! have produced) the match is reported and logged, and a separate OIDC row is
//! still created.

use std::sync::Arc;

use meshgate_common::{NewUser, User, UserId};

use super::claims::NormalizedClaims;
use super::locks::KeyedLocks;
use crate::clock::Clock;
use crate::config::OidcConfig;
use crate::error::{ReconcileError, Result};
use crate::store::{Store, StoreError};

/// Settings that only influence legacy local-account matching.
#[derive(Debug, Clone, Default)]
pub struct MigrationPolicy {
    pub strip_email_domain: bool,
    pub allowed_domains: Vec<String>,
}

impl MigrationPolicy {
    pub fn from_config(oidc: &OidcConfig) -> Self {
        Self {
            strip_email_domain: oidc.strip_email_domain,
            allowed_domains: oidc
                .allowed_domains
                .iter()
                .map(|d| d.trim().to_ascii_lowercase())
                .filter(|d| !d.is_empty())
                .collect(),
        }
    }

    /// The name a CLI-era account for this identity would carry.
    ///
    /// With domain stripping that is the email local part, without it the
    /// whole address with `@` replaced by `.`. `None` without an email, or
    /// when the email's domain is outside a nonempty `allowed_domains`.
    pub fn legacy_name(&self, claims: &NormalizedClaims) -> Option<String> {
        let email = claims.email.as_deref()?;
        let (local, domain) = email.split_once('@')?;
        if local.is_empty() || domain.is_empty() {
            return None;
        }
        if !self.allowed_domains.is_empty()
            && !self
                .allowed_domains
                .iter()
                .any(|allowed| domain.eq_ignore_ascii_case(allowed))
        {
            return None;
        }
        if self.strip_email_domain {
            Some(local.to_string())
        } else {
            Some(format!("{}.{}", local, domain))
        }
    }
}

/// Outcome of resolving one authentication to a user.
#[derive(Debug, Clone)]
pub struct UserResolution {
    pub user: User,
    pub created: bool,
    /// Local account that resembles this identity. Reported, never merged.
    pub legacy_match: Option<UserId>,
}

pub struct UserResolver {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    migration: MigrationPolicy,
    locks: KeyedLocks<String>,
}

impl UserResolver {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, migration: MigrationPolicy) -> Self {
        Self {
            store,
            clock,
            migration,
            locks: KeyedLocks::new(),
        }
    }

    /// Find the user for this provider identity, creating it on first login.
    pub fn resolve(&self, claims: &NormalizedClaims) -> Result<UserResolution> {
        let provider_id = claims.provider_id();
        self.locks
            .with_lock(&provider_id, || self.find_or_create(claims, &provider_id))
    }

    fn find_or_create(&self, claims: &NormalizedClaims, provider_id: &str) -> Result<UserResolution> {
        if let Some(user) = self.store.user_by_provider_id(provider_id)? {
            tracing::debug!("Reusing user {} for {}", user.id, provider_id);
            return Ok(UserResolution {
                user,
                created: false,
                legacy_match: None,
            });
        }

        let legacy_match = self.find_legacy_match(claims)?;
        let email = claims.verified_email().unwrap_or_default();
        let new_user = NewUser::oidc(&claims.preferred_username, email, provider_id);

        match self.store.insert_user(new_user, self.clock.now()) {
            Ok(user) => {
                tracing::info!(
                    user_id = %user.id,
                    name = %user.name,
                    provider_id = %provider_id,
                    email_verified = claims.email_verified,
                    "Created OIDC user"
                );
                Ok(UserResolution {
                    user,
                    created: true,
                    legacy_match,
                })
            }
            Err(StoreError::DuplicateUser(_)) => {
                tracing::debug!("User for {} created concurrently, re-reading", provider_id);
                self.store
                    .user_by_provider_id(provider_id)?
                    .map(|user| UserResolution {
                        user,
                        created: false,
                        legacy_match: None,
                    })
                    .ok_or_else(|| ReconcileError::DuplicateUserRace(provider_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn find_legacy_match(&self, claims: &NormalizedClaims) -> Result<Option<UserId>> {
        let mut candidates = vec![claims.preferred_username.clone()];
        if let Some(legacy) = self.migration.legacy_name(claims) {
            if !candidates.contains(&legacy) {
                candidates.push(legacy);
            }
        }

        for name in candidates {
            if let Some(local) = self.store.local_users_named(&name)?.into_iter().next() {
                tracing::warn!(
                    local_user_id = %local.id,
                    local_name = %local.name,
                    provider_id = %claims.provider_id(),
                    "Local user resembles OIDC identity; keeping accounts separate"
                );
                return Ok(Some(local.id));
            }
        }
        Ok(None)
    }

    /// Administrative path: create a user that is not backed by OIDC.
    pub fn create_local(&self, name: &str, email: Option<&str>) -> Result<User> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ReconcileError::InvalidUser("name must not be empty".to_string()));
        }
        let email = email.map(str::trim).unwrap_or_default();

        let user = self
            .store
            .insert_user(NewUser::local(name, email), self.clock.now())?;
        tracing::info!(user_id = %user.id, name = %user.name, "Created local user");
        Ok(user)
    }
}
