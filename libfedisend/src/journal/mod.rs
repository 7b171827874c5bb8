//! Durable record of requests that have not been confirmed by the server
//!
//! Every request is written here before it is dispatched and removed once the
//! server has answered it for good. Whatever is left when the process dies is
//! replayed on the next start, oldest first.

pub mod memory;
pub mod sqlite;

use std::collections::HashSet;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::{JournalError, Result};
use crate::request::form::spooled_digests;
use crate::request::Request;

pub use memory::InMemoryJournal;
pub use sqlite::SqliteJournal;

/// A journal entry as stored, before its method has been validated
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JournalRecord {
    pub id: String,
    pub method_name: String,
    pub route: String,
    pub headers: String,
    pub parameters: String,
    pub form: String,
    pub timestamp: i64,
}

impl JournalRecord {
    pub fn from_request(request: &Request) -> Self {
        Self {
            id: request.id().to_string(),
            method_name: request.method().as_str().to_string(),
            route: request.route().to_string(),
            headers: request.headers().to_string(),
            parameters: request.parameters().to_string(),
            form: request.form().to_string(),
            timestamp: request.timestamp(),
        }
    }

    /// Rebuild the request. Fails on an unknown method, or when the content no
    /// longer hashes to the stored id.
    pub fn into_request(self) -> Result<Request> {
        let request = Request::new(
            &self.method_name,
            self.route,
            self.headers,
            self.parameters,
            self.form,
            self.timestamp,
        )?;

        if request.id() != self.id {
            return Err(JournalError::Encoding(format!(
                "Record {} does not match its content (hashes to {})",
                self.id,
                request.id()
            ))
            .into());
        }

        Ok(request)
    }
}

#[async_trait]
pub trait Journal: Send + Sync {
    /// Store `request` unless an entry with its id exists, and return the stored entry.
    ///
    /// An existing entry keeps its original timestamp.
    async fn put(&self, request: &Request) -> Result<Request>;

    async fn get(&self, id: &str) -> Result<Option<Request>>;

    /// Returns whether an entry was removed
    async fn remove(&self, id: &str) -> Result<bool>;

    /// Raw entries by timestamp, then insertion order
    async fn records(&self) -> Result<Vec<JournalRecord>>;

    /// Entries by timestamp, then insertion order. Fails on the first malformed record.
    async fn list(&self) -> Result<Vec<Request>> {
        self.records()
            .await?
            .into_iter()
            .map(JournalRecord::into_request)
            .collect()
    }

    /// Digests of the spooled attachments that journaled entries refer to
    async fn spooled_references(&self) -> Result<HashSet<String>> {
        Ok(self
            .records()
            .await?
            .iter()
            .flat_map(|record| spooled_digests(&record.form))
            .collect())
    }

    async fn clear(&self) -> Result<usize> {
        let mut removed = 0;
        for record in self.records().await? {
            if self.remove(&record.id).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FedisendError;

    #[test]
    fn test_record_round_trip() {
        let request = Request::new("POST", "/api/v1/statuses", "{}", r#"{"status":["hi"]}"#, "[]", 5)
            .unwrap();
        let record = JournalRecord::from_request(&request);

        assert_eq!(record.method_name, "POST");
        assert_eq!(record.into_request().unwrap(), request);
    }

    #[test]
    fn test_record_with_unknown_method() {
        let record = JournalRecord {
            id: "whatever".to_string(),
            method_name: "🇮🇹".to_string(),
            route: "/api/v1/resource".to_string(),
            headers: "{}".to_string(),
            parameters: "{}".to_string(),
            form: "[]".to_string(),
            timestamp: 0,
        };

        assert!(matches!(
            record.into_request(),
            Err(FedisendError::Journal(JournalError::UnknownMethod { .. }))
        ));
    }

    #[tokio::test]
    async fn test_spooled_references() {
        let journal = InMemoryJournal::new();
        let spooled = r#"[{"kind":"binary","name":"file","bytes":{"storage":"spooled","len":3,"sha256":"abc"}}]"#;
        let inline = r#"[{"kind":"binary","name":"file","bytes":{"storage":"inline","len":1,"data":"YQ=="}}]"#;
        for (route, form) in [("/api/v2/media", spooled), ("/api/v2/media", inline)] {
            let request = Request::new("POST", route, "{}", "{}", form, 0).unwrap();
            journal.put(&request).await.unwrap();
        }

        let references = journal.spooled_references().await.unwrap();
        assert_eq!(references, HashSet::from(["abc".to_string()]));
    }

    #[test]
    fn test_record_with_tampered_content() {
        let request = Request::new("DELETE", "/api/v1/statuses/1", "{}", "{}", "[]", 0).unwrap();
        let mut record = JournalRecord::from_request(&request);
        record.route = "/api/v1/statuses/2".to_string();

        assert!(matches!(
            record.into_request(),
            Err(FedisendError::Journal(JournalError::Encoding(_)))
        ));
    }
}
