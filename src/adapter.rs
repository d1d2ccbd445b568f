//! The MailAdapter contract
//!
//! Defines the operations the core needs from whatever drives Outlook. The
//! concrete driver (object-model automation, a mail protocol, or a fake in
//! tests) lives behind [`MailAdapter`]; the pool constructs live handles
//! through [`MailConnector`]. Every call the core issues is wrapped with a
//! deadline via [`with_deadline`] so a stuck store can never block a request
//! past its budget.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::{timeout, Instant};

use crate::models::{EmailFull, EmailSummary, Folder, OutgoingEmail};

/// Adapter failure taxonomy
///
/// The closed set of failures an adapter operation may report. The core uses
/// this to drive retries (`Transient` only) and handle retirement
/// (`Unavailable`/`Transient` retire the pooled handle).
#[derive(Debug, Clone, Error)]
pub enum AdapterError {
    /// The store is unreachable or the handle is dead
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The id does not resolve to a resource
    #[error("not found: {0}")]
    NotFound(String),
    /// The store refused access
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// The operation was called with arguments the store rejects
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The operation exceeded its deadline
    #[error("timed out: {0}")]
    Timeout(String),
    /// Retryable failure (momentary store contention, busy automation server)
    #[error("transient failure: {0}")]
    Transient(String),
    /// Non-retryable failure
    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl AdapterError {
    /// Whether the handler retry policy applies to this failure
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Whether the pooled handle that produced this failure should be retired
    pub fn breaks_handle(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Transient(_))
    }
}

/// Type alias for adapter operation results
pub type AdapterResult<T> = Result<T, AdapterError>;

/// The capability surface the core demands from the mail store
///
/// Operations are modeled as async so the concrete driver decides how to
/// offload its blocking segments; callers always bound them with
/// [`with_deadline`]. Handles are exclusive to their borrower for the
/// duration of one operation, so implementations may hold per-handle state
/// without further locking.
#[async_trait]
pub trait MailAdapter: Send + Sync {
    /// Cheap liveness check; must not touch user data
    async fn probe(&self) -> AdapterResult<()>;

    /// Walk the store's folder tree
    ///
    /// Returns every reachable folder with `accessible` reflecting
    /// permission. Inaccessible folders are listed, not hidden.
    async fn list_folders(&self) -> AdapterResult<Vec<Folder>>;

    /// Resolve the default inbox for the active mail identity
    async fn resolve_inbox(&self) -> AdapterResult<String>;

    /// List emails in a folder, newest first
    ///
    /// `limit` is in `[1, 1000]`; the caller validates before invoking.
    async fn list_emails(
        &self,
        folder_id: &str,
        unread_only: bool,
        limit: usize,
    ) -> AdapterResult<Vec<EmailSummary>>;

    /// Fetch one email in full
    ///
    /// # Errors
    ///
    /// `NotFound` if the id does not resolve, `PermissionDenied` if the
    /// store refuses access.
    async fn get_email(&self, email_id: &str) -> AdapterResult<EmailFull>;

    /// Search the store; the query syntax is opaque to the core
    ///
    /// An empty result is not an error.
    async fn search(
        &self,
        query: &str,
        folder_id: Option<&str>,
        limit: usize,
    ) -> AdapterResult<Vec<EmailSummary>>;

    /// Deliver a message through the local identity's outgoing pipeline
    ///
    /// Returns the store-assigned id once the message is queued for send.
    async fn send(&self, outgoing: &OutgoingEmail) -> AdapterResult<String>;
}

/// Constructor for live adapter handles
///
/// The pool calls this on demand, up to its size bound. The connector is
/// where the concrete Outlook driver performs its session setup.
#[async_trait]
pub trait MailConnector: Send + Sync {
    async fn connect(&self) -> AdapterResult<Box<dyn MailAdapter>>;
}

/// Run an adapter operation under a deadline
///
/// Maps deadline expiry to [`AdapterError::Timeout`] tagged with the
/// operation name. The underlying future is dropped on expiry, which is the
/// best-effort interruption the contract promises.
pub async fn with_deadline<T, F>(
    operation: &str,
    deadline: Instant,
    fut: F,
) -> AdapterResult<T>
where
    F: Future<Output = AdapterResult<T>>,
{
    let now = Instant::now();
    if deadline <= now {
        return Err(AdapterError::Timeout(operation.to_owned()));
    }
    match timeout(deadline - now, fut).await {
        Ok(result) => result,
        Err(_) => Err(AdapterError::Timeout(operation.to_owned())),
    }
}

/// Run an adapter operation under a fixed duration budget
pub async fn with_timeout<T, F>(
    operation: &str,
    budget: Duration,
    fut: F,
) -> AdapterResult<T>
where
    F: Future<Output = AdapterResult<T>>,
{
    with_deadline(operation, Instant::now() + budget, fut).await
}
