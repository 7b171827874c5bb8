//! Mastodon OAuth authorization-code flow
//!
//! The authorizer sends the user to `/oauth/authorize` and reads back the code the
//! instance displays (out-of-band redirect). The authenticator trades the code for a
//! token at `/oauth/token` and asks `/api/v1/accounts/verify_credentials` who it
//! belongs to.

use std::io::{self, BufRead, Write};

use async_trait::async_trait;
use serde::Deserialize;

use super::{Authenticator, Authorizer};
use crate::actor::{Actor, AuthenticatedActor};
use crate::config::AuthConfig;
use crate::error::{AuthError, ConfigError, FailedAuthentication};
use crate::requester::{RequestConfig, Requester};

const REALM: &str = "mastodon";

/// Registered OAuth application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthClient {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub scopes: String,
}

impl OAuthClient {
    pub fn from_config(config: &AuthConfig) -> Result<Self, ConfigError> {
        let client_id = config
            .client_id
            .clone()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ConfigError::MissingField("auth.client_id".to_string()))?;
        let client_secret = config
            .client_secret
            .clone()
            .filter(|secret| !secret.is_empty())
            .ok_or_else(|| ConfigError::MissingField("auth.client_secret".to_string()))?;

        Ok(Self {
            client_id,
            client_secret,
            redirect_uri: config.redirect_uri.clone(),
            scopes: config.scopes.clone(),
        })
    }
}

/// Prompts on the terminal for the code shown by the instance
#[derive(Debug, Clone)]
pub struct MastodonAuthorizer {
    base_uri: String,
    client: OAuthClient,
}

impl MastodonAuthorizer {
    pub fn new(base_uri: impl Into<String>, client: OAuthClient) -> Self {
        Self {
            base_uri: base_uri.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Page where the user grants access
    pub fn authorize_url(&self) -> Result<String, AuthError> {
        let url = reqwest::Url::parse_with_params(
            &format!("{}/oauth/authorize", self.base_uri),
            &[
                ("client_id", self.client.client_id.as_str()),
                ("redirect_uri", self.client.redirect_uri.as_str()),
                ("response_type", "code"),
                ("scope", self.client.scopes.as_str()),
            ],
        )
        .map_err(|e| AuthError::Authorization(format!("Invalid instance URL: {}", e)))?;

        Ok(url.to_string())
    }
}

#[async_trait]
impl Authorizer for MastodonAuthorizer {
    async fn authorize(&self) -> Result<String, AuthError> {
        if !atty::is(atty::Stream::Stdin) {
            return Err(AuthError::Authorization(
                "Authorization requires an interactive terminal".to_string(),
            ));
        }

        let url = self.authorize_url()?;
        tokio::task::spawn_blocking(move || {
            let mut stderr = io::stderr();
            writeln!(stderr, "Open this page to authorize fedisend:\n\n  {}\n", url)
                .and_then(|_| write!(stderr, "Authorization code: "))
                .and_then(|_| stderr.flush())
                .map_err(|e| AuthError::Authorization(format!("Failed to prompt: {}", e)))?;

            read_code(io::stdin().lock())
        })
        .await
        .map_err(|e| AuthError::Authorization(format!("Prompt was interrupted: {}", e)))?
    }
}

/// Read one authorization code line
pub fn read_code(mut input: impl BufRead) -> Result<String, AuthError> {
    let mut line = String::new();
    input
        .read_line(&mut line)
        .map_err(|e| AuthError::Authorization(format!("Failed to read code: {}", e)))?;

    let code = line.trim();
    if code.is_empty() {
        return Err(AuthError::Authorization("No authorization code entered".to_string()));
    }
    Ok(code.to_string())
}

#[derive(Deserialize)]
struct Token {
    access_token: String,
}

#[derive(Deserialize)]
struct Account {
    id: String,
}

/// Trades authorization codes for tokens through the plain [`Requester`]
#[derive(Clone)]
pub struct MastodonAuthenticator {
    requester: Requester,
    client: OAuthClient,
}

impl MastodonAuthenticator {
    pub fn new(requester: Requester, client: OAuthClient) -> Self {
        Self { requester, client }
    }

    async fn exchange(&self, authorization_code: &str) -> Result<String, AuthError> {
        let config = RequestConfig::new()
            .parameter("grant_type", "authorization_code")
            .parameter("code", authorization_code)
            .parameter("client_id", self.client.client_id.as_str())
            .parameter("client_secret", self.client.client_secret.as_str())
            .parameter("redirect_uri", self.client.redirect_uri.as_str())
            .parameter("scope", self.client.scopes.as_str());

        let response = self
            .requester
            .post("/oauth/token", config)
            .await
            .map_err(|e| AuthError::Exchange(e.to_string()))?;
        let token: Token = response
            .json()
            .map_err(|e| AuthError::Exchange(e.to_string()))?;

        Ok(token.access_token)
    }

    async fn verify(&self, access_token: &str) -> Result<String, AuthError> {
        let config =
            RequestConfig::new().header("Authorization", format!("Bearer {}", access_token));

        let response = self
            .requester
            .get("/api/v1/accounts/verify_credentials", config)
            .await
            .map_err(|e| AuthError::Exchange(format!("Token verification failed: {}", e)))?;
        let account: Account = response
            .json()
            .map_err(|e| AuthError::Exchange(e.to_string()))?;

        Ok(account.id)
    }
}

#[async_trait]
impl Authenticator for MastodonAuthenticator {
    async fn on_authenticate(&self, authorization_code: &str) -> Result<Actor, AuthError> {
        let access_token = self.exchange(authorization_code).await?;
        let id = self.verify(&access_token).await?;

        tracing::info!("Authenticated as account {}", id);
        Ok(AuthenticatedActor::new(id, access_token).into())
    }

    fn failed_authentication(&self, cause: Option<AuthError>) -> FailedAuthentication {
        FailedAuthentication::new(REALM, cause)
    }
}
