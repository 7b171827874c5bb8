//! Identity of the local user towards the remote instance

use std::fmt;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use zeroize::Zeroize;

use crate::credentials::CredentialStore;
use crate::error::{AuthError, CredentialError, FedisendError};

const ACTOR_ID_KEY: &str = "actor_id";
const ACCESS_TOKEN_KEY: &str = "access_token";

/// An actor holding an access token
///
/// The token is wiped from memory when the value is dropped and never shows up in
/// `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthenticatedActor {
    id: String,
    access_token: String,
}

impl AuthenticatedActor {
    pub fn new(id: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            access_token: access_token.into(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    /// Value of the `Authorization` header
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.access_token)
    }
}

impl fmt::Debug for AuthenticatedActor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthenticatedActor")
            .field("id", &self.id)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

impl Drop for AuthenticatedActor {
    fn drop(&mut self) {
        self.access_token.zeroize();
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Actor {
    #[default]
    Unauthenticated,
    Authenticated(AuthenticatedActor),
}

impl Actor {
    pub fn authenticated(&self) -> Option<&AuthenticatedActor> {
        match self {
            Actor::Authenticated(actor) => Some(actor),
            Actor::Unauthenticated => None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated().is_some()
    }
}

impl From<AuthenticatedActor> for Actor {
    fn from(actor: AuthenticatedActor) -> Self {
        Actor::Authenticated(actor)
    }
}

/// Owner of the current actor
#[async_trait]
pub trait ActorProvider: Send + Sync {
    async fn retrieve(&self) -> Result<Actor, AuthError>;

    async fn remember(&self, actor: Actor) -> Result<(), AuthError>;
}

/// Actor kept in process memory
#[derive(Debug, Default)]
pub struct InMemoryActorProvider {
    actor: RwLock<Actor>,
}

impl InMemoryActorProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn authenticated(actor: AuthenticatedActor) -> Self {
        Self {
            actor: RwLock::new(Actor::Authenticated(actor)),
        }
    }

    pub fn current(&self) -> Actor {
        self.actor
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl ActorProvider for InMemoryActorProvider {
    async fn retrieve(&self) -> Result<Actor, AuthError> {
        Ok(self.current())
    }

    async fn remember(&self, actor: Actor) -> Result<(), AuthError> {
        *self
            .actor
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = actor;
        Ok(())
    }
}

/// Actor persisted in a [`CredentialStore`] under service `fedisend.{host}`
///
/// The store is read once; afterwards the actor is served from memory.
pub struct StoredActorProvider {
    store: Arc<dyn CredentialStore>,
    service: String,
    cached: RwLock<Option<Actor>>,
}

impl StoredActorProvider {
    pub fn new(store: Arc<dyn CredentialStore>, service: impl Into<String>) -> Self {
        Self {
            store,
            service: service.into(),
            cached: RwLock::new(None),
        }
    }

    /// Credential service name for an instance base URI
    pub fn service_for(base_uri: &str) -> String {
        let host = reqwest::Url::parse(base_uri)
            .ok()
            .and_then(|url| url.host_str().map(str::to_string))
            .unwrap_or_else(|| base_uri.trim_end_matches('/').to_string());
        format!("fedisend.{}", host)
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    fn load(&self) -> Result<Actor, AuthError> {
        let id = match self.store.retrieve(&self.service, ACTOR_ID_KEY) {
            Ok(id) => id,
            Err(FedisendError::Credential(CredentialError::NotFound(_))) => {
                return Ok(Actor::Unauthenticated)
            }
            Err(e) => return Err(AuthError::Storage(e.to_string())),
        };

        match self.store.retrieve(&self.service, ACCESS_TOKEN_KEY) {
            Ok(access_token) => Ok(Actor::Authenticated(AuthenticatedActor::new(
                id,
                access_token,
            ))),
            Err(FedisendError::Credential(CredentialError::NotFound(_))) => {
                tracing::warn!(
                    "Found an actor id for {} without an access token; treating as unauthenticated",
                    self.service
                );
                Ok(Actor::Unauthenticated)
            }
            Err(e) => Err(AuthError::Storage(e.to_string())),
        }
    }

    fn cache(&self, actor: Actor) {
        *self
            .cached
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(actor);
    }
}

#[async_trait]
impl ActorProvider for StoredActorProvider {
    async fn retrieve(&self) -> Result<Actor, AuthError> {
        if let Some(actor) = self
            .cached
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
        {
            return Ok(actor);
        }

        let actor = self.load()?;
        self.cache(actor.clone());
        Ok(actor)
    }

    async fn remember(&self, actor: Actor) -> Result<(), AuthError> {
        let storage_error = |e: FedisendError| AuthError::Storage(e.to_string());

        match &actor {
            Actor::Authenticated(authenticated) => {
                self.store
                    .store(&self.service, ACCESS_TOKEN_KEY, authenticated.access_token())
                    .map_err(storage_error)?;
                self.store
                    .store(&self.service, ACTOR_ID_KEY, authenticated.id())
                    .map_err(storage_error)?;
                tracing::info!("Remembered actor {} for {}", authenticated.id(), self.service);
            }
            Actor::Unauthenticated => {
                self.store
                    .delete(&self.service, ACTOR_ID_KEY)
                    .map_err(storage_error)?;
                self.store
                    .delete(&self.service, ACCESS_TOKEN_KEY)
                    .map_err(storage_error)?;
                tracing::info!("Forgot actor for {}", self.service);
            }
        }

        self.cache(actor);
        Ok(())
    }
}
