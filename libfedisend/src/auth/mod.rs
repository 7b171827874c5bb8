//! Authorization and authentication against the remote instance
//!
//! An [`Authorizer`] obtains an authorization code (typically interactively), an
//! [`Authenticator`] exchanges that code for an [`Actor`]. The [`lock`] module
//! coordinates both so that at most one attempt runs at a time.

pub mod lock;
pub mod mastodon;
pub mod mock;

use async_trait::async_trait;

use crate::actor::Actor;

pub use crate::error::{AuthError, FailedAuthentication};
pub use lock::AuthenticationLock;

/// Source of authorization codes
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self) -> Result<String, AuthError>;
}

/// Exchanges an authorization code for an actor
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn on_authenticate(&self, authorization_code: &str) -> Result<Actor, AuthError>;

    /// Build the failure handed to every caller of a failed attempt
    fn failed_authentication(&self, cause: Option<AuthError>) -> FailedAuthentication {
        FailedAuthentication::new("instance", cause)
    }
}
