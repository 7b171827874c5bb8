//! Authenticated, journaled requests
//!
//! Every call is written to the journal, gated through the [`AuthenticationLock`],
//! sent with the actor's bearer token and removed from the journal once the server
//! has answered it for good. Identical calls (same request id) that overlap share a
//! single dispatch, and a successful read is reused for a short while. Mutations are
//! always sent.
//!
//! Each submitted request runs on its own task. Dropping the future returned by
//! [`AuthenticatedRequester::submit`] does not stop it; use
//! [`AuthenticatedRequester::cancel`] or [`AuthenticatedRequester::interrupt`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{RequestConfig, Requester};
use crate::auth::AuthenticationLock;
use crate::error::RequestError;
use crate::journal::Journal;
use crate::request::form::spooled_digests;
use crate::request::{MethodName, Request, StringValues};
use crate::transport::Response;

/// Default window during which a successful read is handed to identical calls
pub const DEFAULT_REUSE_TTL: Duration = Duration::from_secs(5);

type Outcome = Result<Response, RequestError>;

struct InFlight {
    outcome: Shared<BoxFuture<'static, Outcome>>,
    cancel: watch::Sender<bool>,
    spooled: HashSet<String>,
}

struct Reusable {
    stored_at: i64,
    response: Response,
}

#[derive(Clone)]
pub struct AuthenticatedRequester {
    state: Arc<State>,
}

struct State {
    requester: Requester,
    lock: AuthenticationLock,
    journal: Arc<dyn Journal>,
    reuse_ttl: Duration,
    progress: Mutex<HashMap<String, InFlight>>,
    reuse: Mutex<HashMap<String, Reusable>>,
}

impl AuthenticatedRequester {
    /// `reuse_ttl` of zero disables response reuse
    pub fn new(
        requester: Requester,
        lock: AuthenticationLock,
        journal: Arc<dyn Journal>,
        reuse_ttl: Duration,
    ) -> Self {
        Self {
            state: Arc::new(State {
                requester,
                lock,
                journal,
                reuse_ttl,
                progress: Mutex::new(HashMap::new()),
                reuse: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn requester(&self) -> &Requester {
        &self.state.requester
    }

    pub fn lock(&self) -> &AuthenticationLock {
        &self.state.lock
    }

    pub fn journal(&self) -> &Arc<dyn Journal> {
        &self.state.journal
    }

    pub async fn get(&self, route: &str, config: RequestConfig) -> Outcome {
        self.call(MethodName::Get, route, config).await
    }

    /// POST; multipart when `config` carries form parts
    pub async fn post(&self, route: &str, config: RequestConfig) -> Outcome {
        self.call(MethodName::Post, route, config).await
    }

    pub async fn delete(&self, route: &str, config: RequestConfig) -> Outcome {
        self.call(MethodName::Delete, route, config).await
    }

    async fn call(&self, method: MethodName, route: &str, config: RequestConfig) -> Outcome {
        let request = self.prepare(method, route, config).await?;
        self.submit(request).await
    }

    /// Build a request without sending it, so its id is known up front
    pub async fn prepare(
        &self,
        method: MethodName,
        route: &str,
        config: RequestConfig,
    ) -> Result<Request, RequestError> {
        self.state.requester.prepare(method, route, config).await
    }

    /// Journal and send `request`, or join the identical request already in flight
    pub async fn submit(&self, request: Request) -> Outcome {
        let id = request.id().to_string();
        let read_only = request.is_read_only();

        let outcome = {
            let mut progress = self.state.progress();

            if let Some(in_flight) = progress.get(&id) {
                debug!("Request {} is already in flight; awaiting its outcome", id);
                in_flight.outcome.clone()
            } else if let Some(response) = read_only.then(|| self.state.reusable(&id)).flatten() {
                debug!("Reusing recent response to request {}", id);
                return Ok(response);
            } else {
                let (cancel, cancelled) = watch::channel(false);
                let spooled = spooled_digests(request.form());
                let task_id = id.clone();
                let outcome = tokio::spawn(run(self.state.clone(), request, cancelled))
                    .map(move |joined| {
                        joined.unwrap_or_else(|e| {
                            warn!("Request {} task ended abnormally: {}", task_id, e);
                            Err(RequestError::Cancelled { id: task_id })
                        })
                    })
                    .boxed()
                    .shared();

                progress.insert(
                    id,
                    InFlight {
                        outcome: outcome.clone(),
                        cancel,
                        spooled,
                    },
                );
                outcome
            }
        };

        outcome.await
    }

    /// Cancel the request `id`.
    ///
    /// An in-flight request is signalled: it ends without an entry if it has not
    /// been dispatched yet, and runs to completion otherwise. A request that is only
    /// journaled is removed. Returns whether anything was found.
    pub async fn cancel(&self, id: &str) -> Result<bool, RequestError> {
        let signalled = match self.state.progress().get(id) {
            Some(in_flight) => {
                in_flight.cancel.send_replace(true);
                true
            }
            None => false,
        };

        if signalled {
            info!("Cancellation requested for in-flight request {}", id);
            return Ok(true);
        }

        // A malformed entry can still be removed; it just has no attachments to release
        let spooled = match self.state.journal.get(id).await {
            Ok(Some(request)) => spooled_digests(request.form()),
            _ => HashSet::new(),
        };
        let removed = self
            .state
            .journal
            .remove(id)
            .await
            .map_err(|e| RequestError::Journal(e.to_string()))?;
        if removed {
            self.state.release_attachments(id, &spooled).await;
        }
        Ok(removed)
    }

    /// Cancel every in-flight request; returns how many were signalled
    pub fn interrupt(&self) -> usize {
        let progress = self.state.progress();
        for in_flight in progress.values() {
            in_flight.cancel.send_replace(true);
        }

        if !progress.is_empty() {
            info!("Interrupted {} in-flight request(s)", progress.len());
        }
        progress.len()
    }

    /// Ids of the requests currently in flight
    pub fn in_flight(&self) -> Vec<String> {
        self.state.progress().keys().cloned().collect()
    }
}

async fn run(state: Arc<State>, request: Request, cancelled: watch::Receiver<bool>) -> Outcome {
    let id = request.id().to_string();
    let read_only = request.is_read_only();
    let outcome = state.execute(request, cancelled).await;

    // Publish the response before leaving `progress`, so identical calls see one or the other
    if let (true, Ok(response)) = (read_only, &outcome) {
        state.remember_response(&id, response);
    }
    state.progress().remove(&id);

    outcome
}

impl State {
    fn progress(&self) -> MutexGuard<'_, HashMap<String, InFlight>> {
        self.progress
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn reuse(&self) -> MutexGuard<'_, HashMap<String, Reusable>> {
        self.reuse
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn reuse_ttl_millis(&self) -> i64 {
        i64::try_from(self.reuse_ttl.as_millis()).unwrap_or(i64::MAX)
    }

    fn reusable(&self, id: &str) -> Option<Response> {
        if self.reuse_ttl.is_zero() {
            return None;
        }

        let now = self.requester.clock().now_millis();
        let mut reuse = self.reuse();
        match reuse.get(id) {
            Some(reusable) if now - reusable.stored_at < self.reuse_ttl_millis() => {
                Some(reusable.response.clone())
            }
            Some(_) => {
                reuse.remove(id);
                None
            }
            None => None,
        }
    }

    fn remember_response(&self, id: &str, response: &Response) {
        if self.reuse_ttl.is_zero() {
            return;
        }

        let now = self.requester.clock().now_millis();
        let ttl = self.reuse_ttl_millis();
        let mut reuse = self.reuse();
        reuse.retain(|_, reusable| now - reusable.stored_at < ttl);
        reuse.insert(
            id.to_string(),
            Reusable {
                stored_at: now,
                response: response.clone(),
            },
        );
    }

    async fn discard(&self, request: &Request) {
        match self.journal.remove(request.id()).await {
            Ok(_) => {
                self.release_attachments(request.id(), &spooled_digests(request.form()))
                    .await
            }
            Err(e) => warn!("Failed to remove request {} from journal: {}", request.id(), e),
        }
    }

    /// Delete spool files of a removed entry that no other entry still needs
    async fn release_attachments(&self, id: &str, spooled: &HashSet<String>) {
        if spooled.is_empty() {
            return;
        }

        let mut retained = match self.journal.spooled_references().await {
            Ok(references) => references,
            Err(e) => {
                warn!("Keeping spooled attachments of request {}: {}", id, e);
                return;
            }
        };
        retained.extend(
            self.progress()
                .iter()
                .filter(|(other, _)| other.as_str() != id)
                .flat_map(|(_, in_flight)| in_flight.spooled.iter().cloned()),
        );

        let removed = self.requester.attachments().release(spooled, &retained).await;
        if removed > 0 {
            debug!("Released {} spooled attachment(s) of request {}", removed, id);
        }
    }

    async fn execute(&self, request: Request, mut cancelled: watch::Receiver<bool>) -> Outcome {
        if *cancelled.borrow() {
            debug!("Request {} cancelled before being journaled", request.id());
            return Err(RequestError::Cancelled {
                id: request.id().to_string(),
            });
        }

        let request = self
            .journal
            .put(&request)
            .await
            .map_err(|e| RequestError::Journal(e.to_string()))?;
        let id = request.id().to_string();

        if *cancelled.borrow_and_update() {
            info!("Request {} cancelled while being journaled", id);
            self.discard(&request).await;
            return Err(RequestError::Cancelled { id });
        }

        let started = AtomicBool::new(false);
        let dispatch = self.lock.schedule_unlock(|actor| {
            started.store(true, Ordering::SeqCst);
            let request = &request;
            async move {
                let headers: StringValues = [("authorization", actor.bearer())].into_iter().collect();
                let outcome = self.requester.send(request, &headers).await;
                (actor, outcome)
            }
        });
        tokio::pin!(dispatch);

        // Cancellation is polled first, so a signal never loses to a ready dispatch
        let unlocked = tokio::select! {
            biased;
            _ = cancellation(&mut cancelled) => {
                if !started.load(Ordering::SeqCst) {
                    info!("Request {} cancelled before dispatch", id);
                    self.discard(&request).await;
                    return Err(RequestError::Cancelled { id });
                }
                debug!("Request {} is already being dispatched; letting it finish", id);
                dispatch.await
            }
            unlocked = &mut dispatch => unlocked,
        };

        match unlocked {
            Err(failure) => {
                if request.is_read_only() {
                    self.discard(&request).await;
                } else {
                    info!("Request {} stays journaled until authentication succeeds", id);
                }
                Err(RequestError::Authentication(failure))
            }
            Ok((_, Ok(response))) => {
                self.discard(&request).await;
                Ok(response)
            }
            Ok((actor, Err(error))) => {
                if let RequestError::Transport(transport) = &error {
                    if transport.is_unauthorized() {
                        if let Err(e) = self.lock.invalidate(&actor).await {
                            warn!("Failed to forget rejected actor {}: {}", actor.id(), e);
                        }
                    }
                }

                let retryable =
                    matches!(&error, RequestError::Transport(transport) if transport.is_retryable());
                if request.is_read_only() || !retryable {
                    self.discard(&request).await;
                } else {
                    info!("Request {} stays journaled for replay: {}", id, error);
                }
                Err(error)
            }
        }
    }
}

/// Resolves once cancellation has been requested
async fn cancellation(cancelled: &mut watch::Receiver<bool>) {
    loop {
        if *cancelled.borrow_and_update() {
            return;
        }
        if cancelled.changed().await.is_err() {
            // Sender gone: nobody can cancel anymore
            std::future::pending::<()>().await;
        }
    }
}
