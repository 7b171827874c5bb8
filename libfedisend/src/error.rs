//! Error types for Fedisend

use std::fmt;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, FedisendError>;

#[derive(Error, Debug)]
pub enum FedisendError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Journal error: {0}")]
    Journal(#[from] JournalError),

    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("{0}")]
    Auth(#[from] FailedAuthentication),

    #[error("Request error: {0}")]
    Request(#[from] RequestError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl FedisendError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            FedisendError::InvalidInput(_) => 3,
            FedisendError::Auth(_) => 2,
            FedisendError::Request(RequestError::Authentication(_)) => 2,
            FedisendError::Request(_) => 1,
            FedisendError::Config(_) => 1,
            FedisendError::Journal(_) => 1,
            FedisendError::Credential(_) => 1,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value: {0}")]
    Invalid(String),
}

#[derive(Error, Debug)]
pub enum JournalError {
    #[error("Database operation failed: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Encoding error: {0}")]
    Encoding(String),

    /// A record names an HTTP method outside of DELETE, GET and POST. Never retried.
    #[error("Unknown method name '{method_name}' for request to {route}")]
    UnknownMethod { method_name: String, route: String },
}

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("Credential not found: {0}")]
    NotFound(String),

    #[error("OS keyring unavailable: {0}")]
    KeyringUnavailable(String),

    #[error("Keyring error: {0}")]
    Keyring(String),

    #[error("Master password not set")]
    MasterPasswordNotSet,

    #[error("Master password must be at least 8 characters")]
    WeakPassword,

    #[error("Decryption failed (wrong master password?)")]
    DecryptionFailed,

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure of a single HTTP exchange.
///
/// Payloads are plain strings so that one failure can be handed to every caller
/// that joined the same in-flight request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Server responded with HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid route: {0}")]
    InvalidRoute(String),

    #[error("Attachment error: {0}")]
    Attachment(String),
}

impl TransportError {
    /// HTTP status code, if the server answered at all
    pub fn status(&self) -> Option<u16> {
        match self {
            TransportError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether the server rejected the bearer token
    pub fn is_unauthorized(&self) -> bool {
        self.status() == Some(401)
    }

    /// Whether the same request may succeed if sent again later
    ///
    /// Non-retryable failures are definitive answers from the server: the request
    /// is removed from the journal instead of being replayed.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Network(_) | TransportError::Timeout(_) => true,
            TransportError::Status { status, .. } => {
                matches!(status, 401 | 408 | 429 | 500..=599)
            }
            TransportError::InvalidRoute(_) | TransportError::Attachment(_) => false,
        }
    }

    /// Whether the failure is on the server side or on the wire (eligible for immediate retry)
    pub fn is_server_failure(&self) -> bool {
        match self {
            TransportError::Network(_) | TransportError::Timeout(_) => true,
            TransportError::Status { status, .. } => (500..=599).contains(status),
            _ => false,
        }
    }
}

/// Failure of one of the identity collaborators during an authentication attempt
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Authorization failed: {0}")]
    Authorization(String),

    #[error("Token exchange failed: {0}")]
    Exchange(String),

    #[error("Actor storage failed: {0}")]
    Storage(String),

    #[error("Authentication timed out after {0:?}")]
    TimedOut(Duration),

    #[error("Authenticator did not produce an authenticated actor")]
    Rejected,
}

/// Terminal outcome of a failed authentication attempt.
///
/// Every caller waiting on the same attempt receives a clone of the same value.
/// `realm` is set by [`crate::auth::Authenticator::failed_authentication`], which lets
/// each identity backend brand its own failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedAuthentication {
    pub realm: String,
    pub cause: Option<AuthError>,
}

impl FailedAuthentication {
    pub fn new(realm: impl Into<String>, cause: Option<AuthError>) -> Self {
        Self {
            realm: realm.into(),
            cause,
        }
    }
}

impl fmt::Display for FailedAuthentication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Authentication has failed ({})", self.realm)?;
        if let Some(cause) = &self.cause {
            write!(f, ": {}", cause)?;
        }
        Ok(())
    }
}

impl std::error::Error for FailedAuthentication {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_ref()
            .map(|cause| cause as &(dyn std::error::Error + 'static))
    }
}

/// Flattened outcome of an authenticated, journaled request
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("{0}")]
    Authentication(#[from] FailedAuthentication),

    #[error("Transport failed: {0}")]
    Transport(#[from] TransportError),

    #[error("Journal unavailable: {0}")]
    Journal(String),

    #[error("Request {id} has been cancelled")]
    Cancelled { id: String },
}
