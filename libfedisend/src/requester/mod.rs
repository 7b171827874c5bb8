//! Dispatch of requests against one instance
//!
//! [`Requester`] turns a route plus a [`RequestConfig`] into a [`Request`] and sends it,
//! retrying server-side failures. It knows nothing about identity or durability; the
//! [`authenticated`] requester adds both on top of it.

pub mod authenticated;
pub mod replay;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{info, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{FedisendError, RequestError, TransportError};
use crate::request::form::{LoadedPart, PartContent};
use crate::request::{AttachmentPolicy, FormPart, MethodName, Request, StringValues};
use crate::transport::{Body, Outgoing, Response, ResponseLogger, TracingLogger, Transport};

pub use authenticated::{AuthenticatedRequester, DEFAULT_REUSE_TTL};
pub use replay::ReplayReport;

/// How often, and how patiently, server-side failures are retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,

    /// Delay before the first retry; doubled for every further one
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (1-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.base_delay
            .saturating_mul(2_u32.saturating_pow(retry.saturating_sub(1)))
    }
}

/// Headers, parameters and multipart parts of one call
#[derive(Debug, Default)]
pub struct RequestConfig {
    headers: StringValues,
    parameters: StringValues,
    parts: Vec<FormPart>,
}

impl RequestConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Header names are case-insensitive and stored lowercase
    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.append(name.to_ascii_lowercase(), value);
        self
    }

    pub fn parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.append(name, value);
        self
    }

    pub fn part(mut self, part: FormPart) -> Self {
        self.parts.push(part);
        self
    }

    pub fn headers(&self) -> &StringValues {
        &self.headers
    }

    pub fn parameters(&self) -> &StringValues {
        &self.parameters
    }

    pub fn parts(&self) -> &[FormPart] {
        &self.parts
    }
}

/// Requester for one instance
#[derive(Clone)]
pub struct Requester {
    base_uri: String,
    transport: Arc<dyn Transport>,
    logger: Arc<dyn ResponseLogger>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    attachments: AttachmentPolicy,
}

impl Requester {
    pub fn new(base_uri: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            base_uri: base_uri.into().trim_end_matches('/').to_string(),
            transport,
            logger: Arc::new(TracingLogger),
            clock: Arc::new(SystemClock),
            retry: RetryPolicy::default(),
            attachments: AttachmentPolicy::default(),
        }
    }

    pub fn with_logger(mut self, logger: Arc<dyn ResponseLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_attachments(mut self, attachments: AttachmentPolicy) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn base_uri(&self) -> &str {
        &self.base_uri
    }

    pub fn attachments(&self) -> &AttachmentPolicy {
        &self.attachments
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub async fn get(&self, route: &str, config: RequestConfig) -> Result<Response, RequestError> {
        self.call(MethodName::Get, route, config).await
    }

    pub async fn post(&self, route: &str, config: RequestConfig) -> Result<Response, RequestError> {
        self.call(MethodName::Post, route, config).await
    }

    pub async fn delete(&self, route: &str, config: RequestConfig) -> Result<Response, RequestError> {
        self.call(MethodName::Delete, route, config).await
    }

    async fn call(
        &self,
        method: MethodName,
        route: &str,
        config: RequestConfig,
    ) -> Result<Response, RequestError> {
        let request = self.prepare(method, route, config).await?;
        self.send(&request, &StringValues::new()).await
    }

    /// Build the request for a call, capturing multipart parts into storable items
    pub async fn prepare(
        &self,
        method: MethodName,
        route: &str,
        config: RequestConfig,
    ) -> Result<Request, RequestError> {
        self.url_for(route)?;

        let RequestConfig {
            headers,
            parameters,
            parts,
        } = config;
        let form = self.attachments.materialize(parts).await?;

        Request::build(
            method,
            route,
            &headers,
            &parameters,
            &form,
            self.clock.now_millis(),
        )
        .map_err(|e| RequestError::Journal(e.to_string()))
    }

    /// Send `request` with `extra_headers` added, retrying server-side failures
    pub async fn send(
        &self,
        request: &Request,
        extra_headers: &StringValues,
    ) -> Result<Response, RequestError> {
        let outgoing = self.outgoing(request, extra_headers).await?;
        let attempts = self.retry.max_retries + 1;

        for attempt in 1..=attempts {
            match self.dispatch(&outgoing).await {
                Ok(response) => {
                    if attempt > 1 {
                        info!(
                            "{} {} succeeded on attempt {}",
                            outgoing.method,
                            request.route(),
                            attempt
                        );
                    }
                    return Ok(response);
                }
                Err(e) if e.is_server_failure() && attempt < attempts => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        "{} {} failed (attempt {}/{}): {}. Retrying in {:?}...",
                        outgoing.method,
                        request.route(),
                        attempt,
                        attempts,
                        e,
                        delay
                    );
                    sleep(delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(TransportError::Network(format!(
            "{} {} failed after {} attempts",
            outgoing.method,
            request.route(),
            attempts
        ))
        .into())
    }

    async fn dispatch(&self, outgoing: &Outgoing) -> Result<Response, TransportError> {
        let response = self.transport.send(outgoing).await?;
        self.logger.log(outgoing.method, &outgoing.url, &response);

        if response.is_success() {
            Ok(response)
        } else {
            Err(TransportError::Status {
                status: response.status,
                body: response.body,
            })
        }
    }

    /// Resolve a stored request into a call for the wire.
    ///
    /// DELETE and GET carry their parameters in the query. POST sends them
    /// url-encoded, or as leading text parts when it has form items.
    async fn outgoing(
        &self,
        request: &Request,
        extra_headers: &StringValues,
    ) -> Result<Outgoing, RequestError> {
        let malformed = |e: FedisendError| RequestError::Journal(e.to_string());

        let url = self.url_for(request.route())?;
        let mut headers = request.header_values().map_err(malformed)?;
        headers.append_all(extra_headers);
        let parameters = request.parameter_values().map_err(malformed)?;
        let form = request.form_items().map_err(malformed)?;

        let (query, body) = request.fold(
            |_| (parameters.clone(), Body::Empty),
            |_| (parameters.clone(), Body::Empty),
            |_| {
                if form.is_empty() {
                    (StringValues::new(), Body::UrlEncoded(parameters.clone()))
                } else {
                    (StringValues::new(), Body::Multipart(Vec::new()))
                }
            },
        );

        let body = match body {
            Body::Multipart(_) => {
                let mut parts: Vec<LoadedPart> = parameters
                    .iter()
                    .map(|(name, value)| LoadedPart {
                        name: name.to_string(),
                        content: PartContent::Text(value.to_string()),
                    })
                    .collect();
                for item in &form {
                    parts.push(item.load(self.attachments.spool_dir.as_deref()).await?);
                }
                Body::Multipart(parts)
            }
            other => other,
        };

        Ok(Outgoing {
            method: request.method(),
            url,
            headers,
            query,
            body,
        })
    }

    fn url_for(&self, route: &str) -> Result<String, TransportError> {
        if !route.starts_with('/') {
            return Err(TransportError::InvalidRoute(format!(
                "Route '{}' must start with '/'",
                route
            )));
        }

        let url = format!("{}{}", self.base_uri, route);
        reqwest::Url::parse(&url)
            .map_err(|e| TransportError::InvalidRoute(format!("{}: {}", url, e)))?;
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    fn requester(transport: &MockTransport) -> Requester {
        Requester::new("https://mastodon.example/", Arc::new(transport.clone())).with_retry(
            RetryPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(1),
            },
        )
    }

    #[test]
    fn test_retry_delays_double() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(RetryPolicy::default().max_retries, 2);
    }

    #[tokio::test]
    async fn test_get_sends_parameters_in_query() {
        let transport = MockTransport::success();
        let response = requester(&transport)
            .get(
                "/api/v1/timelines/home",
                RequestConfig::new()
                    .parameter("limit", "20")
                    .header("Accept-Language", "it"),
            )
            .await
            .unwrap();
        assert_eq!(response.status, 200);

        let sent = &transport.sent()[0];
        assert_eq!(sent.url, "https://mastodon.example/api/v1/timelines/home");
        assert_eq!(sent.query.get("limit"), Some("20"));
        assert_eq!(sent.headers.get("accept-language"), Some("it"));
        assert_eq!(sent.body, Body::Empty);
    }

    #[tokio::test]
    async fn test_post_without_form_is_url_encoded() {
        let transport = MockTransport::success();
        requester(&transport)
            .post(
                "/api/v1/statuses",
                RequestConfig::new().parameter("status", "Ciao"),
            )
            .await
            .unwrap();

        let sent = &transport.sent()[0];
        assert!(sent.query.is_empty());
        match &sent.body {
            Body::UrlEncoded(values) => assert_eq!(values.get("status"), Some("Ciao")),
            other => panic!("Expected url-encoded body, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_post_with_form_is_multipart() {
        let transport = MockTransport::success();
        requester(&transport)
            .post(
                "/api/v2/media",
                RequestConfig::new()
                    .parameter("description", "A cat")
                    .part(FormPart::binary("file", b"png".to_vec()).with_file_name("cat.png")),
            )
            .await
            .unwrap();

        let Body::Multipart(parts) = &transport.sent()[0].body else {
            panic!("Expected a multipart body");
        };
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].name, "description");
        assert_eq!(parts[0].content, PartContent::Text("A cat".to_string()));
        assert_eq!(parts[1].name, "file");
    }

    #[tokio::test]
    async fn test_delete_uses_delete_method() {
        let transport = MockTransport::success();
        requester(&transport)
            .delete("/api/v1/statuses/1", RequestConfig::new())
            .await
            .unwrap();

        assert_eq!(transport.sent()[0].method, MethodName::Delete);
    }

    #[tokio::test]
    async fn test_server_failures_are_retried() {
        let transport = MockTransport::success();
        for _ in 0..2 {
            transport.respond(
                MethodName::Get,
                "/api/v1/instance",
                Ok(Response::new(503, "Service Unavailable")),
            );
        }

        let response = requester(&transport)
            .get("/api/v1/instance", RequestConfig::new())
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(transport.dispatch_count(), 3);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let transport = MockTransport::failing(TransportError::Network("reset".to_string()));
        let error = requester(&transport)
            .get("/api/v1/instance", RequestConfig::new())
            .await
            .unwrap_err();

        assert!(matches!(error, RequestError::Transport(TransportError::Network(_))));
        assert_eq!(transport.dispatch_count(), 3);
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let transport = MockTransport::success();
        transport.respond(
            MethodName::Post,
            "/api/v1/statuses",
            Ok(Response::new(422, r#"{"error":"Validation failed"}"#)),
        );

        let error = requester(&transport)
            .post("/api/v1/statuses", RequestConfig::new())
            .await
            .unwrap_err();

        match error {
            RequestError::Transport(TransportError::Status { status, body }) => {
                assert_eq!(status, 422);
                assert!(body.contains("Validation failed"));
            }
            other => panic!("Expected HTTP 422, got {:?}", other),
        }
        assert_eq!(transport.dispatch_count(), 1);
    }

    #[tokio::test]
    async fn test_invalid_route() {
        let transport = MockTransport::success();
        let error = requester(&transport)
            .get("api/v1/instance", RequestConfig::new())
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            RequestError::Transport(TransportError::InvalidRoute(_))
        ));
        assert_eq!(transport.dispatch_count(), 0);
    }

    #[tokio::test]
    async fn test_prepare_is_deterministic() {
        let transport = MockTransport::success();
        let requester = requester(&transport);

        let first = requester
            .prepare(
                MethodName::Post,
                "/api/v1/statuses/1/favourite",
                RequestConfig::new(),
            )
            .await
            .unwrap();
        let second = requester
            .prepare(
                MethodName::Post,
                "/api/v1/statuses/1/favourite",
                RequestConfig::new(),
            )
            .await
            .unwrap();

        assert_eq!(first.id(), second.id());
        assert_eq!(transport.dispatch_count(), 0);
    }

    #[tokio::test]
    async fn test_extra_headers_are_sent() {
        let transport = MockTransport::success();
        let requester = requester(&transport);
        let request = requester
            .prepare(MethodName::Get, "/api/v1/accounts/verify_credentials", RequestConfig::new())
            .await
            .unwrap();

        let extra: StringValues = [("authorization", "Bearer token")].into_iter().collect();
        requester.send(&request, &extra).await.unwrap();

        assert_eq!(
            transport.sent()[0].headers.get("authorization"),
            Some("Bearer token")
        );
    }
}
