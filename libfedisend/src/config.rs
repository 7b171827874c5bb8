//! Configuration management for Fedisend
//!
//! Every section except `[instance]` may be omitted:
//!
//! ```toml
//! [instance]
//! base_uri = "https://mastodon.social"
//!
//! [journal]
//! path = "~/.local/share/fedisend/journal.db"
//!
//! [auth]
//! client_id = "..."
//! client_secret = "..."
//! scopes = "read write"
//!
//! [requester]
//! reuse_ttl_ms = 5000
//! max_retries = 2
//!
//! [attachments]
//! spool_dir = "~/.cache/fedisend/spool"
//!
//! [credentials]
//! storage = "keyring"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::credentials::CredentialConfig;
use crate::error::{ConfigError, Result};
use crate::request::form::{DEFAULT_INLINE_LIMIT_BYTES, DEFAULT_MAX_BYTES};
use crate::request::AttachmentPolicy;
use crate::requester::RetryPolicy;

pub const CONFIG_ENV: &str = "FEDISEND_CONFIG";
pub const JOURNAL_PATH_ENV: &str = "FEDISEND_JOURNAL_PATH";

/// Redirect URI for the out-of-band flow, where the instance shows the code to the user
pub const OUT_OF_BAND_REDIRECT_URI: &str = "urn:ietf:wg:oauth:2.0:oob";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub instance: InstanceConfig,
    #[serde(default)]
    pub journal: JournalConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub requester: RequesterConfig,
    #[serde(default)]
    pub attachments: AttachmentsConfig,
    #[serde(default)]
    pub credentials: CredentialConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceConfig {
    #[serde(default)]
    pub base_uri: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalConfig {
    #[serde(default = "default_journal_path")]
    pub path: String,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            path: default_journal_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default = "default_redirect_uri")]
    pub redirect_uri: String,
    #[serde(default = "default_scopes")]
    pub scopes: String,
    /// Bound on one authentication attempt, user interaction included
    #[serde(default = "default_auth_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            client_secret: None,
            redirect_uri: default_redirect_uri(),
            scopes: default_scopes(),
            timeout_secs: default_auth_timeout_secs(),
        }
    }
}

impl AuthConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequesterConfig {
    /// How long a successful response answers identical calls; 0 disables reuse
    #[serde(default = "default_reuse_ttl_ms")]
    pub reuse_ttl_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for RequesterConfig {
    fn default() -> Self {
        Self {
            reuse_ttl_ms: default_reuse_ttl_ms(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl RequesterConfig {
    pub fn reuse_ttl(&self) -> Duration {
        Duration::from_millis(self.reuse_ttl_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentsConfig {
    #[serde(default = "default_inline_limit_bytes")]
    pub inline_limit_bytes: u64,
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,
    #[serde(default)]
    pub spool_dir: Option<String>,
}

impl Default for AttachmentsConfig {
    fn default() -> Self {
        Self {
            inline_limit_bytes: default_inline_limit_bytes(),
            max_bytes: default_max_bytes(),
            spool_dir: None,
        }
    }
}

impl AttachmentsConfig {
    pub fn policy(&self) -> AttachmentPolicy {
        AttachmentPolicy {
            inline_limit_bytes: self.inline_limit_bytes,
            max_bytes: self.max_bytes,
            spool_dir: self
                .spool_dir
                .as_deref()
                .map(|dir| PathBuf::from(shellexpand::tilde(dir).to_string())),
        }
    }
}

fn default_journal_path() -> String {
    "~/.local/share/fedisend/journal.db".to_string()
}

fn default_redirect_uri() -> String {
    OUT_OF_BAND_REDIRECT_URI.to_string()
}

fn default_scopes() -> String {
    "read write".to_string()
}

fn default_auth_timeout_secs() -> u64 {
    300
}

fn default_reuse_ttl_ms() -> u64 {
    5_000
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_base_delay_ms() -> u64 {
    1_000
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_inline_limit_bytes() -> u64 {
    DEFAULT_INLINE_LIMIT_BYTES
}

fn default_max_bytes() -> u64 {
    DEFAULT_MAX_BYTES
}

impl Config {
    /// Load configuration from `$FEDISEND_CONFIG` or the default location
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path()?;
        Self::load_from_path(&config_path)
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).map_err(ConfigError::ParseError)?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration for `base_uri` with every other section at its default
    pub fn default_config(base_uri: impl Into<String>) -> Self {
        Self {
            instance: InstanceConfig {
                base_uri: base_uri.into(),
            },
            journal: JournalConfig::default(),
            auth: AuthConfig::default(),
            requester: RequesterConfig::default(),
            attachments: AttachmentsConfig::default(),
            credentials: CredentialConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let base_uri = self.instance.base_uri.trim();
        if base_uri.is_empty() {
            return Err(ConfigError::MissingField("instance.base_uri".to_string()).into());
        }

        let url = reqwest::Url::parse(base_uri).map_err(|e| {
            ConfigError::Invalid(format!("instance.base_uri '{}': {}", base_uri, e))
        })?;
        if url.scheme() != "https" && url.scheme() != "http" {
            return Err(ConfigError::Invalid(format!(
                "instance.base_uri must be an http(s) URL, got '{}'",
                base_uri
            ))
            .into());
        }

        if self.attachments.inline_limit_bytes > self.attachments.max_bytes {
            return Err(ConfigError::Invalid(
                "attachments.inline_limit_bytes exceeds attachments.max_bytes".to_string(),
            )
            .into());
        }

        self.credentials.validate()
    }

    /// Journal database path, with `$FEDISEND_JOURNAL_PATH` taking precedence
    pub fn journal_path(&self) -> String {
        let path = std::env::var(JOURNAL_PATH_ENV).unwrap_or_else(|_| self.journal.path.clone());
        shellexpand::tilde(&path).to_string()
    }
}

/// Resolve the configuration file path following the XDG Base Directory layout
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("fedisend").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StorageBackend;
    use crate::error::FedisendError;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = Config::parse(
            r#"
            [instance]
            base_uri = "https://mastodon.social"
            "#,
        )
        .unwrap();

        assert_eq!(config.journal.path, "~/.local/share/fedisend/journal.db");
        assert_eq!(config.auth.redirect_uri, OUT_OF_BAND_REDIRECT_URI);
        assert_eq!(config.auth.scopes, "read write");
        assert_eq!(config.auth.timeout(), Duration::from_secs(300));
        assert_eq!(config.requester.reuse_ttl(), Duration::from_secs(5));
        assert_eq!(config.requester.retry_policy(), RetryPolicy::default());
        assert_eq!(config.attachments.policy().max_bytes, DEFAULT_MAX_BYTES);
        assert!(config.attachments.policy().spool_dir.is_none());
        assert_eq!(config.credentials.storage, StorageBackend::Keyring);
    }

    #[test]
    fn test_full_config() {
        let config = Config::parse(
            r#"
            [instance]
            base_uri = "https://fosstodon.org"

            [journal]
            path = "/var/lib/fedisend/journal.db"

            [auth]
            client_id = "abc"
            client_secret = "def"
            scopes = "read write follow"
            timeout_secs = 60

            [requester]
            reuse_ttl_ms = 0
            max_retries = 5
            retry_base_delay_ms = 250

            [attachments]
            inline_limit_bytes = 1024
            max_bytes = 4096
            spool_dir = "/tmp/fedisend-spool"

            [credentials]
            storage = "memory"
            "#,
        )
        .unwrap();

        assert_eq!(config.auth.client_id.as_deref(), Some("abc"));
        assert_eq!(config.auth.timeout(), Duration::from_secs(60));
        assert!(config.requester.reuse_ttl().is_zero());
        assert_eq!(config.requester.retry_policy().max_retries, 5);
        assert_eq!(
            config.requester.retry_policy().base_delay,
            Duration::from_millis(250)
        );
        assert_eq!(
            config.attachments.policy().spool_dir,
            Some(PathBuf::from("/tmp/fedisend-spool"))
        );
        assert_eq!(config.credentials.storage, StorageBackend::Memory);
    }

    #[test]
    fn test_missing_base_uri() {
        let error = Config::parse("[journal]\npath = \"/tmp/j.db\"\n").unwrap_err();
        assert!(matches!(
            error,
            FedisendError::Config(ConfigError::MissingField(ref field)) if field == "instance.base_uri"
        ));
    }

    #[test]
    fn test_invalid_base_uri() {
        assert!(Config::parse("[instance]\nbase_uri = \"not a url\"\n").is_err());
        assert!(Config::parse("[instance]\nbase_uri = \"ftp://example.org\"\n").is_err());
    }

    #[test]
    fn test_inline_limit_above_max_is_rejected() {
        let mut config = Config::default_config("https://mastodon.social");
        config.attachments.inline_limit_bytes = 10;
        config.attachments.max_bytes = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_toml() {
        let error = Config::parse("[instance\nbase_uri = 1").unwrap_err();
        assert!(matches!(
            error,
            FedisendError::Config(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_load_from_path() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(&path, "[instance]\nbase_uri = \"https://mastodon.social/\"\n").unwrap();

        let config = Config::load_from_path(&path).unwrap();
        assert_eq!(config.instance.base_uri, "https://mastodon.social/");

        let missing = Config::load_from_path(&temp_dir.path().join("absent.toml"));
        assert!(matches!(
            missing,
            Err(FedisendError::Config(ConfigError::ReadError(_)))
        ));
    }

    #[test]
    #[serial]
    fn test_config_path_from_env() {
        std::env::set_var(CONFIG_ENV, "/etc/fedisend.toml");
        assert_eq!(
            resolve_config_path().unwrap(),
            PathBuf::from("/etc/fedisend.toml")
        );
        std::env::remove_var(CONFIG_ENV);
    }

    #[test]
    #[serial]
    fn test_journal_path_override() {
        let config = Config::default_config("https://mastodon.social");

        std::env::remove_var(JOURNAL_PATH_ENV);
        assert!(config.journal_path().ends_with(".local/share/fedisend/journal.db"));
        assert!(!config.journal_path().starts_with('~'));

        std::env::set_var(JOURNAL_PATH_ENV, "/tmp/other.db");
        assert_eq!(config.journal_path(), "/tmp/other.db");
        std::env::remove_var(JOURNAL_PATH_ENV);
    }
}
