//! Scriptable transport for testing
//!
//! Answers are queued per method and path; once a queue is empty the default answer
//! is used. Every call is recorded so tests can verify what went over the "wire".

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;

use super::{Outgoing, Response, Transport};
use crate::error::TransportError;
use crate::request::MethodName;

type Answer = Result<Response, TransportError>;

#[derive(Debug, Clone)]
pub struct MockTransport {
    default: Answer,
    scripted: Arc<Mutex<HashMap<(MethodName, String), VecDeque<Answer>>>>,

    /// Delay before answering (simulates network latency)
    pub delay: Duration,

    /// Calls received, in order
    pub sent: Arc<Mutex<Vec<Outgoing>>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self {
            default: Ok(Response::ok("{}")),
            scripted: Arc::new(Mutex::new(HashMap::new())),
            delay: Duration::from_millis(0),
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl MockTransport {
    /// Transport answering `200 {}` to everything
    pub fn success() -> Self {
        Self::default()
    }

    /// Transport answering every unscripted call with `error`
    pub fn failing(error: TransportError) -> Self {
        Self {
            default: Err(error),
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Queue an answer for the next call to `method path`
    pub fn respond(&self, method: MethodName, path: &str, answer: Answer) {
        self.scripted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry((method, path.to_string()))
            .or_default()
            .push_back(answer);
    }

    pub fn sent(&self) -> Vec<Outgoing> {
        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn dispatch_count(&self) -> usize {
        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, outgoing: &Outgoing) -> Result<Response, TransportError> {
        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(outgoing.clone());

        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }

        let scripted = self
            .scripted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get_mut(&(outgoing.method, outgoing.path()))
            .and_then(VecDeque::pop_front);

        scripted.unwrap_or_else(|| self.default.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::StringValues;
    use crate::transport::Body;

    fn outgoing(method: MethodName, path: &str) -> Outgoing {
        Outgoing {
            method,
            url: format!("https://example.org{}", path),
            headers: StringValues::new(),
            query: StringValues::new(),
            body: Body::Empty,
        }
    }

    #[tokio::test]
    async fn test_scripted_answers_then_default() {
        let transport = MockTransport::success();
        transport.respond(
            MethodName::Get,
            "/api/v1/instance",
            Err(TransportError::Timeout("slow".to_string())),
        );

        let call = outgoing(MethodName::Get, "/api/v1/instance");
        assert!(transport.send(&call).await.is_err());
        assert_eq!(transport.send(&call).await.unwrap().status, 200);

        // Scripts are per method
        transport.respond(MethodName::Post, "/api/v1/instance", Ok(Response::new(201, "")));
        assert_eq!(transport.send(&call).await.unwrap().status, 200);

        assert_eq!(transport.dispatch_count(), 3);
    }

    #[tokio::test]
    async fn test_failing_transport() {
        let transport = MockTransport::failing(TransportError::Network("down".to_string()));
        let error = transport
            .send(&outgoing(MethodName::Delete, "/api/v1/statuses/1"))
            .await
            .unwrap_err();

        assert_eq!(error, TransportError::Network("down".to_string()));
        assert_eq!(transport.sent()[0].method, MethodName::Delete);
    }
}
