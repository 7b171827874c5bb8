//! Fedisend - authenticated, resumable requests to Fediverse instances
//!
//! Every outbound call is journaled before it is sent and removed once the server
//! has answered it, so a crash or a lost token never silently drops a mutation.
//! Authentication is single-flight: however many callers find themselves signed
//! out, the user is asked to authorize once.

pub mod actor;
pub mod auth;
pub mod client;
pub mod clock;
pub mod config;
pub mod credentials;
pub mod error;
pub mod journal;
pub mod logging;
pub mod request;
pub mod requester;
pub mod transport;

// Re-export commonly used types
pub use actor::{Actor, ActorProvider, AuthenticatedActor};
pub use auth::AuthenticationLock;
pub use client::Fedisend;
pub use config::Config;
pub use credentials::{CredentialConfig, StorageBackend};
pub use error::{FedisendError, RequestError, Result};
pub use journal::{Journal, JournalRecord, SqliteJournal};
pub use request::{FormPart, MethodName, Request, StringValues};
pub use requester::{AuthenticatedRequester, ReplayReport, RequestConfig, Requester};
pub use transport::Response;
