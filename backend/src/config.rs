//! Configuration for the coordination server.

use std::path::Path;

use config::{Config as ConfigLoader, Environment, File};
use serde::Deserialize;

/// Default session lifetime when the token's own expiry is not used: 180 days.
pub const DEFAULT_EXPIRY_SECS: u64 = 180 * 24 * 60 * 60;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("Missing required setting: {0}")]
    Missing(&'static str),
    #[error("Environment variable {0} referenced in secret path is not set")]
    MissingEnvVar(String),
    #[error("Failed to read secret file {path}: {reason}")]
    SecretFile { path: String, reason: String },
}

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    pub oidc: OidcConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// `sqlite:<path>` for on-disk storage, `memory` for the in-process store.
    #[serde(default = "default_database_url")]
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
        }
    }
}

/// OIDC provider settings and the login policy derived from them.
#[derive(Debug, Clone, Deserialize)]
pub struct OidcConfig {
    pub issuer: String,
    /// Additional issuers accepted besides `issuer`.
    #[serde(default)]
    pub allowed_issuers: Vec<String>,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    /// File holding the client secret. `${VAR}` references are expanded.
    #[serde(default)]
    pub client_secret_path: Option<String>,
    /// Audience the ID token must carry, if any.
    #[serde(default)]
    pub audience: Option<String>,
    /// Use the token's `exp` as the node expiry instead of `expiry_secs`.
    #[serde(default)]
    pub use_expiry_from_token: bool,
    #[serde(default = "default_expiry_secs")]
    pub expiry_secs: u64,
    #[serde(default)]
    pub pkce_enabled: bool,
    /// Legacy naming: derive local-style names from the email local part only.
    #[serde(default)]
    pub strip_email_domain: bool,
    /// Email domains considered when matching legacy local accounts.
    #[serde(default)]
    pub allowed_domains: Vec<String>,
}

impl OidcConfig {
    /// A config for `issuer` with every other option at its default.
    pub fn for_issuer(issuer: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            allowed_issuers: vec![],
            client_id: String::new(),
            client_secret: None,
            client_secret_path: None,
            audience: None,
            use_expiry_from_token: false,
            expiry_secs: default_expiry_secs(),
            pkce_enabled: false,
            strip_email_domain: false,
            allowed_domains: vec![],
        }
    }

    /// Issuers accepted on ID tokens, without trailing slashes.
    pub fn issuer_allow_list(&self) -> Vec<String> {
        std::iter::once(&self.issuer)
            .chain(self.allowed_issuers.iter())
            .map(|iss| iss.trim_end_matches('/').to_string())
            .filter(|iss| !iss.is_empty())
            .collect()
    }

    /// Resolve the client secret, preferring the secret file when configured.
    pub fn resolve_client_secret(&self) -> Result<Option<String>, ConfigError> {
        let Some(raw_path) = &self.client_secret_path else {
            return Ok(self.client_secret.clone());
        };
        let path = expand_env(raw_path)?;
        let secret = std::fs::read_to_string(Path::new(&path)).map_err(|e| {
            ConfigError::SecretFile {
                path: path.clone(),
                reason: e.to_string(),
            }
        })?;
        Ok(Some(secret.trim().to_string()))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// How often expired sessions are swept.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// Default values
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_database_url() -> String {
    "sqlite:./data/meshgate.db".to_string()
}
fn default_expiry_secs() -> u64 {
    DEFAULT_EXPIRY_SECS
}
fn default_sweep_interval() -> u64 {
    60
}
fn default_log_level() -> String {
    "info".to_string()
}

/// Expand `${VAR}` references from the process environment.
fn expand_env(input: &str) -> Result<String, ConfigError> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            // Unterminated reference, keep it literally.
            out.push_str(&rest[start..]);
            return Ok(out);
        };
        let name = &after[..end];
        let value =
            std::env::var(name).map_err(|_| ConfigError::MissingEnvVar(name.to_string()))?;
        out.push_str(&value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

impl Config {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration sources (in order of precedence):
    /// 1. Environment variables (MESHGATE__SECTION__KEY format)
    /// 2. config.toml file (if present)
    /// 3. Built-in defaults
    pub fn load() -> Result<Self, ConfigError> {
        let config = ConfigLoader::builder()
            .set_default("server.host", default_host())?
            .set_default("server.port", default_port() as i64)?
            .set_default("oidc.expiry_secs", default_expiry_secs() as i64)?
            .set_default("session.sweep_interval_secs", default_sweep_interval() as i64)?
            .add_source(File::with_name("config").required(false))
            .add_source(
                Environment::with_prefix("MESHGATE")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("oidc.allowed_issuers")
                    .with_list_parse_key("oidc.allowed_domains"),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.oidc.issuer.trim().is_empty() {
            return Err(ConfigError::Missing("oidc.issuer"));
        }
        Ok(())
    }
}
