//! High-level entry point used by the binaries
//!
//! [`Fedisend`] wires a [`Config`] into the full pipeline: SQLite journal, reqwest
//! transport, credential-backed actor, Mastodon OAuth and the
//! [`AuthenticatedRequester`] on top.
//!
//! # Examples
//!
//! ```no_run
//! use libfedisend::{Config, Fedisend, MethodName, RequestConfig};
//!
//! # async fn example() -> libfedisend::Result<()> {
//! let fedisend = Fedisend::open(Config::load()?).await?;
//! fedisend.resume().await?;
//!
//! let response = fedisend
//!     .call(
//!         MethodName::Post,
//!         "/api/v1/statuses",
//!         RequestConfig::new().parameter("status", "Hello from fedisend"),
//!     )
//!     .await?;
//! println!("{}", response.body);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use async_trait::async_trait;

use crate::actor::{Actor, StoredActorProvider};
use crate::auth::mastodon::{MastodonAuthenticator, MastodonAuthorizer, OAuthClient};
use crate::auth::{AuthenticationLock, Authenticator, Authorizer};
use crate::config::Config;
use crate::credentials::open_store;
use crate::error::{AuthError, FailedAuthentication, RequestError, Result};
use crate::journal::{Journal, JournalRecord, SqliteJournal};
use crate::request::{MethodName, Request};
use crate::requester::{AuthenticatedRequester, ReplayReport, RequestConfig, Requester};
use crate::transport::{HttpTransport, Response, Transport};

/// Stand-in used when no OAuth application is configured; stored actors still work
struct UnconfiguredClient {
    reason: String,
}

#[async_trait]
impl Authorizer for UnconfiguredClient {
    async fn authorize(&self) -> std::result::Result<String, AuthError> {
        Err(AuthError::Authorization(self.reason.clone()))
    }
}

#[async_trait]
impl Authenticator for UnconfiguredClient {
    async fn on_authenticate(&self, _authorization_code: &str) -> std::result::Result<Actor, AuthError> {
        Err(AuthError::Exchange(self.reason.clone()))
    }

    fn failed_authentication(&self, cause: Option<AuthError>) -> FailedAuthentication {
        FailedAuthentication::new("mastodon", cause)
    }
}

/// Open the journal named by `config`
pub async fn open_journal(config: &Config) -> Result<SqliteJournal> {
    SqliteJournal::new(&config.journal_path()).await
}

#[derive(Clone)]
pub struct Fedisend {
    requester: AuthenticatedRequester,
}

impl Fedisend {
    pub async fn open(config: Config) -> Result<Self> {
        config.validate()?;

        let journal = Arc::new(open_journal(&config).await?);
        let transport: Arc<dyn Transport> = Arc::new(
            HttpTransport::new(config.requester.request_timeout()).map_err(RequestError::from)?,
        );
        let requester = Requester::new(config.instance.base_uri.clone(), transport)
            .with_retry(config.requester.retry_policy())
            .with_attachments(config.attachments.policy());

        let mut credentials = config.credentials.clone();
        credentials.load_master_password_from_env();
        let store = open_store(&credentials)?;
        let actor_provider = Arc::new(StoredActorProvider::new(
            store,
            StoredActorProvider::service_for(requester.base_uri()),
        ));

        let (authorizer, authenticator): (Arc<dyn Authorizer>, Arc<dyn Authenticator>) =
            match OAuthClient::from_config(&config.auth) {
                Ok(client) => (
                    Arc::new(MastodonAuthorizer::new(requester.base_uri(), client.clone())),
                    Arc::new(MastodonAuthenticator::new(requester.clone(), client)),
                ),
                Err(e) => {
                    tracing::debug!("Interactive sign-in unavailable: {}", e);
                    let unconfigured = Arc::new(UnconfiguredClient {
                        reason: format!("OAuth application not configured ({})", e),
                    });
                    (unconfigured.clone(), unconfigured)
                }
            };

        let lock = AuthenticationLock::new(
            actor_provider,
            authorizer,
            authenticator,
            config.auth.timeout(),
        );

        Ok(Self::from_requester(AuthenticatedRequester::new(
            requester,
            lock,
            journal,
            config.requester.reuse_ttl(),
        )))
    }

    /// Wrap an already assembled requester
    pub fn from_requester(requester: AuthenticatedRequester) -> Self {
        Self { requester }
    }

    pub fn requester(&self) -> &AuthenticatedRequester {
        &self.requester
    }

    pub fn journal(&self) -> &Arc<dyn Journal> {
        self.requester.journal()
    }

    pub async fn call(
        &self,
        method: MethodName,
        route: &str,
        config: RequestConfig,
    ) -> Result<Response> {
        let request = self.requester.prepare(method, route, config).await?;
        Ok(self.requester.submit(request).await?)
    }

    /// Journal a request without sending it; the next replay sends it in order
    pub async fn enqueue(
        &self,
        method: MethodName,
        route: &str,
        config: RequestConfig,
    ) -> Result<Request> {
        let request = self.requester.prepare(method, route, config).await?;
        self.journal().put(&request).await
    }

    /// Replay whatever a previous run left in the journal
    pub async fn resume(&self) -> Result<ReplayReport> {
        self.requester.resume().await
    }

    pub async fn pending(&self) -> Result<Vec<JournalRecord>> {
        self.journal().records().await
    }

    pub async fn cancel(&self, id: &str) -> Result<bool> {
        Ok(self.requester.cancel(id).await?)
    }
}
