//! Journaled description of one HTTP call
//!
//! A [`Request`] stores its headers, parameters and form data as canonical JSON
//! strings, exactly as they are written to the journal. Its `id` is the SHA-256 of
//! those strings plus the method and route, so logically identical calls share an id
//! and are treated as the same request. The id is 256 bits wide; two different calls
//! sharing one is assumed never to happen.

pub mod form;
pub mod values;

use std::fmt;
use std::str::FromStr;

use sha2::{Digest, Sha256};

use crate::error::{JournalError, Result};

pub use form::{AttachmentPolicy, FormItem, FormPart};
pub use values::StringValues;

/// The HTTP methods a request may use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodName {
    Delete,
    Get,
    Post,
}

impl MethodName {
    pub fn as_str(&self) -> &'static str {
        match self {
            MethodName::Delete => "DELETE",
            MethodName::Get => "GET",
            MethodName::Post => "POST",
        }
    }

    /// Read-only requests are dropped instead of retained when they fail
    pub fn is_read_only(&self) -> bool {
        matches!(self, MethodName::Get)
    }
}

impl FromStr for MethodName {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "DELETE" => Ok(MethodName::Delete),
            "GET" => Ok(MethodName::Get),
            "POST" => Ok(MethodName::Post),
            _ => Err(format!(
                "Unknown method name '{}'. Valid names: DELETE, GET, POST",
                s
            )),
        }
    }
}

impl fmt::Display for MethodName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One HTTP call as recorded in the journal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    id: String,
    method: MethodName,
    route: String,
    headers: String,
    parameters: String,
    form: String,
    timestamp: i64,
}

impl Request {
    /// Restore a request from its stored fields.
    ///
    /// Fails with [`JournalError::UnknownMethod`] if `method_name` is not DELETE, GET or
    /// POST. The id is always recomputed from the fields.
    pub fn new(
        method_name: &str,
        route: impl Into<String>,
        headers: impl Into<String>,
        parameters: impl Into<String>,
        form: impl Into<String>,
        timestamp: i64,
    ) -> Result<Self> {
        let route = route.into();
        let method = method_name
            .parse::<MethodName>()
            .map_err(|_| JournalError::UnknownMethod {
                method_name: method_name.to_string(),
                route: route.clone(),
            })?;

        Ok(Self::assemble(
            method,
            route,
            headers.into(),
            parameters.into(),
            form.into(),
            timestamp,
        ))
    }

    /// Build a request from decoded values
    pub fn build(
        method: MethodName,
        route: impl Into<String>,
        headers: &StringValues,
        parameters: &StringValues,
        form: &[FormItem],
        timestamp: i64,
    ) -> Result<Self> {
        Ok(Self::assemble(
            method,
            route.into(),
            headers.encode()?,
            parameters.encode()?,
            form::encode_items(form)?,
            timestamp,
        ))
    }

    fn assemble(
        method: MethodName,
        route: String,
        headers: String,
        parameters: String,
        form: String,
        timestamp: i64,
    ) -> Self {
        let id = generate_id(method.as_str(), &route, &headers, &parameters, &form);
        Self {
            id,
            method,
            route,
            headers,
            parameters,
            form,
            timestamp,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn method(&self) -> MethodName {
        self.method
    }

    pub fn route(&self) -> &str {
        &self.route
    }

    /// Encoded headers
    pub fn headers(&self) -> &str {
        &self.headers
    }

    /// Encoded parameters
    pub fn parameters(&self) -> &str {
        &self.parameters
    }

    /// Encoded form items
    pub fn form(&self) -> &str {
        &self.form
    }

    /// Unix milliseconds at which the request was first journaled
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn header_values(&self) -> Result<StringValues> {
        StringValues::decode(&self.headers)
    }

    pub fn parameter_values(&self) -> Result<StringValues> {
        StringValues::decode(&self.parameters)
    }

    pub fn form_items(&self) -> Result<Vec<FormItem>> {
        form::decode_items(&self.form)
    }

    pub fn is_read_only(&self) -> bool {
        self.method.is_read_only()
    }

    /// Same request, journaled at a different instant. The id does not change.
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Call exactly one of the callbacks, chosen by the method
    pub fn fold<T>(
        &self,
        on_delete: impl FnOnce(&Request) -> T,
        on_get: impl FnOnce(&Request) -> T,
        on_post: impl FnOnce(&Request) -> T,
    ) -> T {
        match self.method {
            MethodName::Delete => on_delete(self),
            MethodName::Get => on_get(self),
            MethodName::Post => on_post(self),
        }
    }
}

/// Hex SHA-256 of the JSON array `[method_name, route, headers, parameters, form]`
pub fn generate_id(
    method_name: &str,
    route: &str,
    headers: &str,
    parameters: &str,
    form: &str,
) -> String {
    let canonical = serde_json::json!([method_name, route, headers, parameters, form]).to_string();
    format!("{:x}", Sha256::digest(canonical.as_bytes()))
}
