//! The HTTP engine behind the requesters
//!
//! A [`Transport`] sends one fully resolved [`Outgoing`] call and reports whatever the
//! server answered, error statuses included. Deciding what counts as failure is left
//! to the requester.

pub mod http;
pub mod mock;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::error::TransportError;
use crate::request::form::LoadedPart;
use crate::request::{MethodName, StringValues};

pub use http::HttpTransport;
pub use mock::MockTransport;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Empty,
    UrlEncoded(StringValues),
    Multipart(Vec<LoadedPart>),
}

/// One call, ready for the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub method: MethodName,
    pub url: String,
    pub headers: StringValues,
    pub query: StringValues,
    pub body: Body,
}

impl Outgoing {
    /// Path component of the URL
    pub fn path(&self) -> String {
        reqwest::Url::parse(&self.url)
            .map(|url| url.path().to_string())
            .unwrap_or_else(|_| self.url.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub headers: StringValues,
    pub body: String,
}

impl Response {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: StringValues::new(),
            body: body.into(),
        }
    }

    pub fn ok(body: impl Into<String>) -> Self {
        Self::new(200, body)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, TransportError> {
        serde_json::from_str(&self.body).map_err(|e| TransportError::Status {
            status: self.status,
            body: format!("Unexpected response body: {}", e),
        })
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, outgoing: &Outgoing) -> Result<Response, TransportError>;
}

/// Sink for every response received, successful or not
pub trait ResponseLogger: Send + Sync {
    fn log(&self, method: MethodName, url: &str, response: &Response);
}

/// Logs responses as tracing events
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl ResponseLogger for TracingLogger {
    fn log(&self, method: MethodName, url: &str, response: &Response) {
        if response.is_success() {
            tracing::info!("{} {} -> {}", method, url, response.status);
        } else {
            tracing::warn!("{} {} -> {}", method, url, response.status);
        }
        tracing::trace!("Response body: {}", response.body);
    }
}
