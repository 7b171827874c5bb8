//! Single-flight gate for operations that need an authenticated actor
//!
//! Callers that find the actor unauthenticated share one authentication attempt:
//! the first one starts it, everyone else awaits the same shared future and gets a
//! clone of its outcome. The attempt slot is a mutex-guarded `Option`, so "is an
//! attempt running" and "start one" happen under the same lock.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};

use super::{Authenticator, Authorizer};
use crate::actor::{Actor, ActorProvider, AuthenticatedActor};
use crate::error::{AuthError, FailedAuthentication};

/// Default bound on one authentication attempt, user interaction included
pub const DEFAULT_AUTHENTICATION_TIMEOUT: Duration = Duration::from_secs(300);

type Attempt = Shared<BoxFuture<'static, Result<AuthenticatedActor, FailedAuthentication>>>;

#[derive(Clone)]
pub struct AuthenticationLock {
    inner: Arc<Inner>,
}

struct Inner {
    actor_provider: Arc<dyn ActorProvider>,
    authorizer: Arc<dyn Authorizer>,
    authenticator: Arc<dyn Authenticator>,
    timeout: Duration,
    attempt: Mutex<Option<(u64, Attempt)>>,
    generation: AtomicU64,
}

impl AuthenticationLock {
    pub fn new(
        actor_provider: Arc<dyn ActorProvider>,
        authorizer: Arc<dyn Authorizer>,
        authenticator: Arc<dyn Authenticator>,
        timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                actor_provider,
                authorizer,
                authenticator,
                timeout,
                attempt: Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn actor_provider(&self) -> &Arc<dyn ActorProvider> {
        &self.inner.actor_provider
    }

    /// Run `operation` with an authenticated actor, authenticating first if needed.
    ///
    /// `operation` is not called when authentication fails.
    pub async fn schedule_unlock<T, F, Fut>(&self, operation: F) -> Result<T, FailedAuthentication>
    where
        F: FnOnce(AuthenticatedActor) -> Fut,
        Fut: Future<Output = T>,
    {
        let actor = self.unlock().await?;
        Ok(operation(actor).await)
    }

    /// The current authenticated actor, joining or starting an attempt if there is none
    pub async fn unlock(&self) -> Result<AuthenticatedActor, FailedAuthentication> {
        if let Actor::Authenticated(actor) = self.current().await? {
            return Ok(actor);
        }

        let attempt = {
            let mut slot = self
                .inner
                .attempt
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());

            match slot.as_ref() {
                Some((generation, attempt)) => {
                    tracing::debug!("Joining authentication attempt #{}", generation);
                    attempt.clone()
                }
                None => {
                    let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
                    tracing::debug!("Starting authentication attempt #{}", generation);

                    let attempt = authenticate(
                        self.inner.actor_provider.clone(),
                        self.inner.authorizer.clone(),
                        self.inner.authenticator.clone(),
                        self.inner.timeout,
                    );
                    let attempt = release_after(attempt, Arc::downgrade(&self.inner), generation)
                        .boxed()
                        .shared();
                    *slot = Some((generation, attempt.clone()));
                    attempt
                }
            }
        };

        attempt.await
    }

    /// Forget `rejected` after the server refused its token.
    ///
    /// Nothing happens if the current actor has already been replaced.
    pub async fn invalidate(&self, rejected: &AuthenticatedActor) -> Result<(), AuthError> {
        let provider = &self.inner.actor_provider;
        match provider.retrieve().await? {
            Actor::Authenticated(current) if current.access_token() == rejected.access_token() => {
                tracing::warn!(
                    "Access token of actor {} was rejected; authentication is required again",
                    rejected.id()
                );
                provider.remember(Actor::Unauthenticated).await
            }
            _ => Ok(()),
        }
    }

    async fn current(&self) -> Result<Actor, FailedAuthentication> {
        self.inner
            .actor_provider
            .retrieve()
            .await
            .map_err(|cause| self.inner.authenticator.failed_authentication(Some(cause)))
    }
}

/// Clear the attempt slot once the attempt has an outcome, so a later caller can retry
async fn release_after(
    attempt: impl Future<Output = Result<AuthenticatedActor, FailedAuthentication>>,
    inner: Weak<Inner>,
    generation: u64,
) -> Result<AuthenticatedActor, FailedAuthentication> {
    let outcome = attempt.await;

    if let Some(inner) = inner.upgrade() {
        let mut slot = inner
            .attempt
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if matches!(slot.as_ref(), Some((current, _)) if *current == generation) {
            *slot = None;
        }
    }

    outcome
}

async fn authenticate(
    actor_provider: Arc<dyn ActorProvider>,
    authorizer: Arc<dyn Authorizer>,
    authenticator: Arc<dyn Authenticator>,
    timeout: Duration,
) -> Result<AuthenticatedActor, FailedAuthentication> {
    let exchange = async {
        // A previous attempt may have finished between our check and taking the slot
        if let Actor::Authenticated(actor) = actor_provider.retrieve().await? {
            return Ok::<_, AuthError>(actor);
        }

        let code = authorizer.authorize().await?;
        match authenticator.on_authenticate(&code).await? {
            Actor::Authenticated(actor) => {
                actor_provider
                    .remember(Actor::Authenticated(actor.clone()))
                    .await?;
                tracing::info!("Authenticated as actor {}", actor.id());
                Ok(actor)
            }
            Actor::Unauthenticated => Err(AuthError::Rejected),
        }
    };

    let outcome = tokio::time::timeout(timeout, exchange)
        .await
        .unwrap_or(Err(AuthError::TimedOut(timeout)));

    outcome.map_err(|cause| {
        tracing::warn!("Authentication failed: {}", cause);
        authenticator.failed_authentication(Some(cause))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::InMemoryActorProvider;
    use crate::auth::mock::{MockAuthenticator, MockAuthorizer};
    use std::sync::atomic::AtomicUsize;

    fn lock_with(
        provider: Arc<InMemoryActorProvider>,
        authorizer: MockAuthorizer,
        authenticator: MockAuthenticator,
    ) -> AuthenticationLock {
        AuthenticationLock::new(
            provider,
            Arc::new(authorizer),
            Arc::new(authenticator),
            DEFAULT_AUTHENTICATION_TIMEOUT,
        )
    }

    #[tokio::test]
    async fn test_authenticated_actor_skips_authentication() {
        let provider = Arc::new(InMemoryActorProvider::authenticated(AuthenticatedActor::new(
            "1", "token",
        )));
        let authorizer = MockAuthorizer::granting("code");
        let authenticator = MockAuthenticator::succeeding("2", "other");
        let lock = lock_with(provider, authorizer.clone(), authenticator.clone());

        let id = lock
            .schedule_unlock(|actor| async move { actor.id().to_string() })
            .await
            .unwrap();

        assert_eq!(id, "1");
        assert_eq!(authorizer.calls(), 0);
        assert_eq!(authenticator.calls(), 0);
    }

    #[tokio::test]
    async fn test_unauthenticated_actor_is_authenticated_and_remembered() {
        let provider = Arc::new(InMemoryActorProvider::new());
        let authorizer = MockAuthorizer::granting("code-123");
        let authenticator = MockAuthenticator::succeeding("42", "fresh-token");
        let lock = lock_with(provider.clone(), authorizer.clone(), authenticator.clone());

        let token = lock
            .schedule_unlock(|actor| async move { actor.access_token().to_string() })
            .await
            .unwrap();

        assert_eq!(token, "fresh-token");
        assert_eq!(authenticator.codes.lock().unwrap().as_slice(), ["code-123"]);
        assert_eq!(
            provider.current(),
            Actor::Authenticated(AuthenticatedActor::new("42", "fresh-token"))
        );

        // Later calls reuse the remembered actor
        lock.unlock().await.unwrap();
        assert_eq!(authorizer.calls(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_attempt() {
        let provider = Arc::new(InMemoryActorProvider::new());
        let authorizer = MockAuthorizer::granting("code").with_delay(Duration::from_millis(50));
        let authenticator = MockAuthenticator::succeeding("42", "token");
        let lock = lock_with(provider, authorizer.clone(), authenticator.clone());

        let operations = AtomicUsize::new(0);
        let outcomes = futures::future::join_all((0..8).map(|_| {
            lock.schedule_unlock(|actor| {
                operations.fetch_add(1, Ordering::SeqCst);
                async move { actor }
            })
        }))
        .await;

        assert_eq!(authorizer.calls(), 1);
        assert_eq!(authenticator.calls(), 1);
        assert_eq!(operations.load(Ordering::SeqCst), 8);
        for outcome in outcomes {
            assert_eq!(outcome.unwrap(), AuthenticatedActor::new("42", "token"));
        }
    }

    #[tokio::test]
    async fn test_failure_never_runs_operation() {
        let provider = Arc::new(InMemoryActorProvider::new());
        let authorizer = MockAuthorizer::declining().with_delay(Duration::from_millis(20));
        let authenticator = MockAuthenticator::succeeding("42", "token");
        let lock = lock_with(provider.clone(), authorizer.clone(), authenticator);

        let operations = AtomicUsize::new(0);
        let outcomes = futures::future::join_all((0..4).map(|_| {
            lock.schedule_unlock(|_| {
                operations.fetch_add(1, Ordering::SeqCst);
                async {}
            })
        }))
        .await;

        assert_eq!(operations.load(Ordering::SeqCst), 0);
        assert_eq!(authorizer.calls(), 1);

        let failures: Vec<_> = outcomes.into_iter().map(|o| o.unwrap_err()).collect();
        assert!(failures.iter().all(|f| f == &failures[0]));
        assert_eq!(failures[0].realm, "mock");
        assert!(matches!(failures[0].cause, Some(AuthError::Authorization(_))));
        assert_eq!(provider.current(), Actor::Unauthenticated);
    }

    #[tokio::test]
    async fn test_failed_attempt_can_be_retried() {
        let provider = Arc::new(InMemoryActorProvider::new());
        let authorizer = MockAuthorizer::granting("code");
        let lock = lock_with(
            provider,
            authorizer.clone(),
            MockAuthenticator::failing(),
        );

        assert!(lock.unlock().await.is_err());
        assert!(lock.unlock().await.is_err());
        assert_eq!(authorizer.calls(), 2);
    }

    #[tokio::test]
    async fn test_authenticator_rejection() {
        struct Refusing;

        #[async_trait::async_trait]
        impl Authenticator for Refusing {
            async fn on_authenticate(&self, _code: &str) -> Result<Actor, AuthError> {
                Ok(Actor::Unauthenticated)
            }
        }

        let lock = AuthenticationLock::new(
            Arc::new(InMemoryActorProvider::new()),
            Arc::new(MockAuthorizer::granting("code")),
            Arc::new(Refusing),
            DEFAULT_AUTHENTICATION_TIMEOUT,
        );

        let failure = lock.unlock().await.unwrap_err();
        assert_eq!(failure.realm, "instance");
        assert_eq!(failure.cause, Some(AuthError::Rejected));
    }

    #[tokio::test]
    async fn test_attempt_times_out() {
        let provider = Arc::new(InMemoryActorProvider::new());
        let authorizer = MockAuthorizer::granting("code").with_delay(Duration::from_secs(30));
        let lock = AuthenticationLock::new(
            provider.clone(),
            Arc::new(authorizer),
            Arc::new(MockAuthenticator::succeeding("1", "t")),
            Duration::from_millis(20),
        );

        let failure = lock.unlock().await.unwrap_err();
        assert_eq!(
            failure.cause,
            Some(AuthError::TimedOut(Duration::from_millis(20)))
        );
        assert_eq!(provider.current(), Actor::Unauthenticated);
    }

    #[tokio::test]
    async fn test_invalidate_forces_new_attempt() {
        let actor = AuthenticatedActor::new("1", "expired");
        let provider = Arc::new(InMemoryActorProvider::authenticated(actor.clone()));
        let authorizer = MockAuthorizer::granting("code");
        let lock = lock_with(
            provider.clone(),
            authorizer.clone(),
            MockAuthenticator::succeeding("1", "renewed"),
        );

        lock.invalidate(&actor).await.unwrap();
        assert_eq!(provider.current(), Actor::Unauthenticated);

        let renewed = lock.unlock().await.unwrap();
        assert_eq!(renewed.access_token(), "renewed");
        assert_eq!(authorizer.calls(), 1);

        // A stale rejection does not clobber the renewed actor
        lock.invalidate(&actor).await.unwrap();
        assert_eq!(provider.current(), Actor::Authenticated(renewed));
    }
}
