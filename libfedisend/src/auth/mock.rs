//! Scriptable authorizer and authenticator for testing
//!
//! Both count their invocations so tests can check how many authentication round
//! trips actually happened.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;

use super::{Authenticator, Authorizer};
use crate::actor::{Actor, AuthenticatedActor};
use crate::error::{AuthError, FailedAuthentication};

/// Authorizer returning a fixed code, or failing
#[derive(Debug, Clone)]
pub struct MockAuthorizer {
    /// Code handed out; `None` makes authorization fail
    pub code: Option<String>,

    /// Delay before answering (simulates the user switching to a browser)
    pub delay: Duration,

    /// Number of times authorize has been called
    pub call_count: Arc<Mutex<usize>>,
}

impl MockAuthorizer {
    pub fn granting(code: &str) -> Self {
        Self {
            code: Some(code.to_string()),
            delay: Duration::from_millis(0),
            call_count: Arc::new(Mutex::new(0)),
        }
    }

    pub fn declining() -> Self {
        Self {
            code: None,
            ..Self::granting("")
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        *self
            .call_count
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Authorizer for MockAuthorizer {
    async fn authorize(&self) -> Result<String, AuthError> {
        *self
            .call_count
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) += 1;

        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }

        self.code
            .clone()
            .ok_or_else(|| AuthError::Authorization("User declined".to_string()))
    }
}

/// Authenticator that turns any code into a fixed actor, or fails
#[derive(Debug, Clone)]
pub struct MockAuthenticator {
    /// Actor produced; `None` makes the exchange fail
    pub actor: Option<AuthenticatedActor>,

    pub realm: String,

    /// Codes received, in order
    pub codes: Arc<Mutex<Vec<String>>>,
}

impl MockAuthenticator {
    pub fn succeeding(id: &str, access_token: &str) -> Self {
        Self {
            actor: Some(AuthenticatedActor::new(id, access_token)),
            realm: "mock".to_string(),
            codes: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn failing() -> Self {
        Self {
            actor: None,
            ..Self::succeeding("", "")
        }
    }

    pub fn calls(&self) -> usize {
        self.codes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

#[async_trait]
impl Authenticator for MockAuthenticator {
    async fn on_authenticate(&self, authorization_code: &str) -> Result<Actor, AuthError> {
        self.codes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(authorization_code.to_string());

        self.actor
            .clone()
            .map(Actor::Authenticated)
            .ok_or_else(|| AuthError::Exchange("Invalid authorization code".to_string()))
    }

    fn failed_authentication(&self, cause: Option<AuthError>) -> FailedAuthentication {
        FailedAuthentication::new(self.realm.clone(), cause)
    }
}
