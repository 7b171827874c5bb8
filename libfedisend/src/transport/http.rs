//! reqwest-backed transport

use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart;

use super::{Body, Outgoing, Response, Transport};
use crate::error::TransportError;
use crate::request::form::{LoadedPart, PartContent};
use crate::request::{MethodName, StringValues};

/// Default bound on a single HTTP exchange
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("fedisend/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TransportError::Network(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, outgoing: &Outgoing) -> Result<Response, TransportError> {
        let method = match outgoing.method {
            MethodName::Delete => reqwest::Method::DELETE,
            MethodName::Get => reqwest::Method::GET,
            MethodName::Post => reqwest::Method::POST,
        };

        let mut builder = self.client.request(method, &outgoing.url);
        for (name, value) in outgoing.headers.iter() {
            builder = builder.header(name, value);
        }
        if !outgoing.query.is_empty() {
            builder = builder.query(&outgoing.query.iter().collect::<Vec<_>>());
        }

        builder = match &outgoing.body {
            Body::Empty => builder,
            Body::UrlEncoded(values) => builder.form(&values.iter().collect::<Vec<_>>()),
            Body::Multipart(parts) => builder.multipart(multipart_form(parts)?),
        };

        let response = builder.send().await.map_err(map_reqwest_error)?;

        let status = response.status().as_u16();
        let headers: StringValues = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();
        let body = response.text().await.map_err(map_reqwest_error)?;

        Ok(Response {
            status,
            headers,
            body,
        })
    }
}

fn multipart_form(parts: &[LoadedPart]) -> Result<multipart::Form, TransportError> {
    let mut form = multipart::Form::new();

    for part in parts {
        form = match &part.content {
            PartContent::Text(value) => form.text(part.name.clone(), value.clone()),
            PartContent::Bytes {
                bytes,
                file_name,
                content_type,
            } => {
                let mut body = multipart::Part::bytes(bytes.clone());
                if let Some(file_name) = file_name {
                    body = body.file_name(file_name.clone());
                }
                if let Some(content_type) = content_type {
                    body = body.mime_str(content_type).map_err(|e| {
                        TransportError::Attachment(format!(
                            "Invalid content type '{}': {}",
                            content_type, e
                        ))
                    })?;
                }
                form.part(part.name.clone(), body)
            }
        };
    }

    Ok(form)
}

fn map_reqwest_error(error: reqwest::Error) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout(error.to_string())
    } else if error.is_builder() {
        TransportError::InvalidRoute(error.to_string())
    } else {
        TransportError::Network(error.to_string())
    }
}
