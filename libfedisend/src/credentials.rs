//! Secure storage for the local actor's identity
//!
//! The authenticated actor (its id and OAuth access token) is kept in a
//! [`CredentialStore`]:
//! - `KeyringStore`: OS-native secure storage (default)
//! - `EncryptedFileStore`: age-encrypted files protected by a master password
//! - `MemoryStore`: process-local, for tests and throwaway sessions
//!
//! Services are named `fedisend.{host}`, keys after the stored value (`actor_id`,
//! `access_token`).

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::error::{CredentialError, Result};

/// Backend able to store, retrieve and delete secrets by service and key
pub trait CredentialStore: Send + Sync {
    fn store(&self, service: &str, key: &str, value: &str) -> Result<()>;

    /// Fails with `CredentialError::NotFound` when nothing is stored
    fn retrieve(&self, service: &str, key: &str) -> Result<String>;

    /// Deleting a missing credential is not an error
    fn delete(&self, service: &str, key: &str) -> Result<()>;

    fn exists(&self, service: &str, key: &str) -> Result<bool> {
        match self.retrieve(service, key) {
            Ok(_) => Ok(true),
            Err(crate::error::FedisendError::Credential(CredentialError::NotFound(_))) => {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn backend_name(&self) -> &str;
}

/// OS keyring backend
pub struct KeyringStore;

impl KeyringStore {
    /// Fails with `CredentialError::KeyringUnavailable` when the OS keyring cannot be
    /// reached (headless Linux without Secret Service, for instance)
    pub fn new() -> Result<Self> {
        match keyring::Entry::new("fedisend.test", "availability_check") {
            Ok(_) => Ok(Self),
            Err(e) => Err(CredentialError::KeyringUnavailable(format!(
                "OS keyring not accessible: {}",
                e
            ))
            .into()),
        }
    }

    fn entry(service: &str, key: &str) -> Result<keyring::Entry> {
        keyring::Entry::new(service, key)
            .map_err(|e| CredentialError::KeyringUnavailable(e.to_string()).into())
    }
}

impl CredentialStore for KeyringStore {
    fn store(&self, service: &str, key: &str, value: &str) -> Result<()> {
        Self::entry(service, key)?
            .set_password(value)
            .map_err(|e| CredentialError::Keyring(e.to_string()))?;

        tracing::debug!("Stored credential {}.{} in OS keyring", service, key);
        Ok(())
    }

    fn retrieve(&self, service: &str, key: &str) -> Result<String> {
        match Self::entry(service, key)?.get_password() {
            Ok(password) => Ok(password),
            Err(keyring::Error::NoEntry) => {
                Err(CredentialError::NotFound(format!("{}.{}", service, key)).into())
            }
            Err(e) => Err(CredentialError::Keyring(e.to_string()).into()),
        }
    }

    fn delete(&self, service: &str, key: &str) -> Result<()> {
        match Self::entry(service, key)?.delete_password() {
            Ok(_) => {
                tracing::debug!("Deleted credential {}.{} from OS keyring", service, key);
                Ok(())
            }
            Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(CredentialError::Keyring(e.to_string()).into()),
        }
    }

    fn backend_name(&self) -> &str {
        "keyring"
    }
}

/// Refuse to follow a symlink in place of a credential file
pub fn validate_not_symlink(path: &Path) -> Result<()> {
    let metadata = std::fs::symlink_metadata(path).map_err(|e| {
        CredentialError::Io(std::io::Error::new(
            e.kind(),
            format!("Failed to read metadata for '{}': {}", path.display(), e),
        ))
    })?;

    if metadata.is_symlink() {
        return Err(CredentialError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!(
                "Credential file '{}' is a symbolic link; credential files must be regular files",
                path.display()
            ),
        ))
        .into());
    }

    Ok(())
}

/// Encrypted file backend
///
/// Each credential lives in `{base_path}/{service}.{key}.age`, encrypted with the
/// master password and readable by the owner only.
pub struct EncryptedFileStore {
    base_path: PathBuf,
    master_password: RwLock<Option<String>>,
}

impl EncryptedFileStore {
    pub fn new(base_path: PathBuf) -> Self {
        Self {
            base_path,
            master_password: RwLock::new(None),
        }
    }

    /// Fails with `CredentialError::WeakPassword` below 8 characters
    pub fn set_master_password(&self, password: String) -> Result<()> {
        if password.len() < 8 {
            return Err(CredentialError::WeakPassword.into());
        }

        let mut slot = self
            .master_password
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(previous) = slot.as_mut() {
            previous.zeroize();
        }
        *slot = Some(password);
        Ok(())
    }

    fn password(&self) -> Result<String> {
        self.master_password
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or_else(|| CredentialError::MasterPasswordNotSet.into())
    }

    fn encrypt(&self, data: &str) -> Result<Vec<u8>> {
        let encryptor = age::Encryptor::with_user_passphrase(age::secrecy::Secret::new(self.password()?));

        let mut encrypted = vec![];
        let mut writer = encryptor
            .wrap_output(&mut encrypted)
            .map_err(|e| CredentialError::Encryption(e.to_string()))?;
        writer
            .write_all(data.as_bytes())
            .map_err(|e| CredentialError::Encryption(e.to_string()))?;
        writer
            .finish()
            .map_err(|e| CredentialError::Encryption(e.to_string()))?;

        Ok(encrypted)
    }

    fn decrypt(&self, data: &[u8]) -> Result<String> {
        let password = self.password()?;

        let decryptor = match age::Decryptor::new(data) {
            Ok(age::Decryptor::Passphrase(d)) => d,
            Ok(_) => {
                return Err(CredentialError::Encryption(
                    "Invalid encryption format (expected passphrase)".to_string(),
                )
                .into())
            }
            Err(e) => return Err(CredentialError::Encryption(e.to_string()).into()),
        };

        let mut reader = decryptor
            .decrypt(&age::secrecy::Secret::new(password), None)
            .map_err(|e| match e {
                age::DecryptError::DecryptionFailed | age::DecryptError::NoMatchingKeys => {
                    CredentialError::DecryptionFailed
                }
                other => CredentialError::Encryption(other.to_string()),
            })?;

        let mut decrypted = vec![];
        reader
            .read_to_end(&mut decrypted)
            .map_err(|e| CredentialError::Encryption(e.to_string()))?;

        String::from_utf8(decrypted)
            .map_err(|e| CredentialError::Encryption(format!("Invalid UTF-8: {}", e)).into())
    }

    fn file_path(&self, service: &str, key: &str) -> PathBuf {
        self.base_path.join(format!("{}.{}.age", service, key))
    }
}

impl CredentialStore for EncryptedFileStore {
    fn store(&self, service: &str, key: &str, value: &str) -> Result<()> {
        let encrypted = self.encrypt(value)?;
        let file_path = self.file_path(service, key);

        if let Some(parent) = file_path.parent() {
            std::fs::create_dir_all(parent).map_err(CredentialError::Io)?;
        }
        std::fs::write(&file_path, encrypted).map_err(CredentialError::Io)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&file_path, perms).map_err(CredentialError::Io)?;
        }

        tracing::debug!("Stored encrypted credential {}.{} at {:?}", service, key, file_path);
        Ok(())
    }

    fn retrieve(&self, service: &str, key: &str) -> Result<String> {
        let file_path = self.file_path(service, key);
        if !file_path.exists() {
            return Err(CredentialError::NotFound(format!("{}.{}", service, key)).into());
        }

        validate_not_symlink(&file_path)?;
        let encrypted = std::fs::read(&file_path).map_err(CredentialError::Io)?;
        self.decrypt(&encrypted)
    }

    fn delete(&self, service: &str, key: &str) -> Result<()> {
        let file_path = self.file_path(service, key);
        if file_path.exists() {
            std::fs::remove_file(&file_path).map_err(CredentialError::Io)?;
            tracing::debug!("Deleted encrypted credential {}.{}", service, key);
        }
        Ok(())
    }

    fn exists(&self, service: &str, key: &str) -> Result<bool> {
        Ok(self.file_path(service, key).exists())
    }

    fn backend_name(&self) -> &str {
        "encrypted_file"
    }
}

/// In-process backend; nothing outlives the process
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<(String, String), String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryStore {
    fn store(&self, service: &str, key: &str, value: &str) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert((service.to_string(), key.to_string()), value.to_string());
        Ok(())
    }

    fn retrieve(&self, service: &str, key: &str) -> Result<String> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&(service.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| CredentialError::NotFound(format!("{}.{}", service, key)).into())
    }

    fn delete(&self, service: &str, key: &str) -> Result<()> {
        if let Some(mut value) = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&(service.to_string(), key.to_string()))
        {
            value.zeroize();
        }
        Ok(())
    }

    fn backend_name(&self) -> &str {
        "memory"
    }
}

/// Storage backend type
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// OS-native keyring (macOS Keychain, Windows Credential Manager, Linux Secret Service)
    #[default]
    Keyring,
    /// Encrypted files with master password
    Encrypted,
    /// Process memory only
    Memory,
}

/// Credential storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialConfig {
    #[serde(default)]
    pub storage: StorageBackend,

    /// Directory for encrypted files (unused by the other backends)
    #[serde(default = "default_credential_path")]
    pub path: String,

    /// Master password for encrypted storage (never serialized)
    #[serde(skip)]
    pub master_password: Option<String>,
}

fn default_credential_path() -> String {
    "~/.config/fedisend/credentials".to_string()
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            storage: StorageBackend::Keyring,
            path: default_credential_path(),
            master_password: None,
        }
    }
}

impl CredentialConfig {
    /// Take the master password from `FEDISEND_MASTER_PASSWORD` when set
    pub fn load_master_password_from_env(&mut self) {
        if let Ok(password) = std::env::var("FEDISEND_MASTER_PASSWORD") {
            if !password.is_empty() {
                self.master_password = Some(password);
                tracing::debug!("Loaded master password from FEDISEND_MASTER_PASSWORD");
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.storage == StorageBackend::Encrypted && self.path.is_empty() {
            return Err(
                CredentialError::Encryption("Credential path cannot be empty".to_string()).into(),
            );
        }
        Ok(())
    }

    /// Credential path with `~` expanded
    pub fn expand_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.path).to_string())
    }
}

/// Open the store selected by `config`
pub fn open_store(config: &CredentialConfig) -> Result<Arc<dyn CredentialStore>> {
    config.validate()?;

    let store: Arc<dyn CredentialStore> = match config.storage {
        StorageBackend::Keyring => Arc::new(KeyringStore::new()?),
        StorageBackend::Encrypted => {
            let store = EncryptedFileStore::new(config.expand_path());
            let password = match &config.master_password {
                Some(password) => password.clone(),
                None => prompt_master_password()?,
            };
            store.set_master_password(password)?;
            Arc::new(store)
        }
        StorageBackend::Memory => Arc::new(MemoryStore::new()),
    };

    tracing::debug!("Using {} credential storage", store.backend_name());
    Ok(store)
}

/// Ask for the master password on an interactive terminal
fn prompt_master_password() -> Result<String> {
    if !atty::is(atty::Stream::Stdin) {
        return Err(CredentialError::MasterPasswordNotSet.into());
    }

    let password = rpassword::prompt_password("Enter master password for credential encryption: ")
        .map_err(CredentialError::Io)?;
    if password.is_empty() {
        return Err(CredentialError::MasterPasswordNotSet.into());
    }
    Ok(password)
}
