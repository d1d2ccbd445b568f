//! Wire DTOs and schema-bearing types
//!
//! Declares the read-only views of the mail store (folders, summaries, full
//! emails), the outgoing message record, and each method's parameter and
//! result records. Parameter types are annotated with `JsonSchema`; the
//! handshake response embeds their schemas so clients can discover the
//! method surface. Unknown fields on input are tolerated (and logged at the
//! router); output records never carry unknown fields.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Folder classification in the underlying store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum FolderType {
    Mail,
    Calendar,
    Contacts,
    Notes,
    Tasks,
    Other,
}

/// Message importance marker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
pub enum Importance {
    Low,
    #[default]
    Normal,
    High,
}

/// Body format for outgoing messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum BodyFormat {
    #[default]
    Text,
    Html,
    Rtf,
}

/// Folder metadata
///
/// `id` is an opaque string assigned by the store and stable for the
/// lifetime of a server run. `accessible=false` folders must fail with a
/// permission error when operated on, never silently return empty.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Folder {
    /// Opaque stable folder identifier
    pub id: String,
    /// Display name (any Unicode)
    pub name: String,
    /// Logical path separated by `/`
    pub full_path: String,
    /// Parent folder id, absent for roots
    pub parent_id: Option<String>,
    /// Total items in the folder
    pub item_count: u32,
    /// Unread items (never exceeds `item_count`)
    pub unread_count: u32,
    /// Folder classification
    pub folder_type: FolderType,
    /// Whether the active identity may read the folder
    pub accessible: bool,
    /// Whether the folder has child folders
    pub has_subfolders: bool,
}

/// Lightweight email representation for listings and search results
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct EmailSummary {
    /// Opaque stable email identifier
    pub id: String,
    /// Subject line
    pub subject: String,
    /// Sender display name
    pub sender_name: String,
    /// Sender address
    pub sender_email: String,
    /// To recipients
    pub recipients: Vec<String>,
    /// Delivery timestamp
    pub received_time: DateTime<Utc>,
    /// Submission timestamp if known
    pub sent_time: Option<DateTime<Utc>>,
    /// Read flag
    pub is_read: bool,
    /// Whether attachments are present
    pub has_attachments: bool,
    /// Importance marker
    pub importance: Importance,
    /// Containing folder id
    pub folder_id: String,
    /// Size in bytes; `0` means the store did not report a size
    pub size_bytes: u64,
    /// Best-effort body preview, at most 255 characters
    pub body_preview: String,
}

/// Attachment metadata; content retrieval is out of scope
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Attachment {
    /// Filename as reported by the store
    pub name: String,
    /// Attachment size in bytes
    pub size_bytes: u64,
    /// MIME content type (e.g. `application/pdf`)
    pub mime_type: String,
}

/// Full email detail
///
/// `body_html` is returned exactly as the store provides it; sanitization is
/// an external collaborator's job.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct EmailFull {
    #[serde(flatten)]
    pub summary: EmailSummary,
    /// Plain-text body, may be empty
    pub body_text: String,
    /// Raw HTML body, may be empty
    pub body_html: String,
    /// Cc recipients
    pub cc: Vec<String>,
    /// Bcc recipients (visible only on items the identity sent)
    pub bcc: Vec<String>,
    /// Attachment metadata
    pub attachments: Vec<Attachment>,
}

/// Outgoing message record for `send_email`
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct OutgoingEmail {
    /// Primary recipients; at least one address overall is required
    pub to: Vec<String>,
    /// Cc recipients
    #[serde(default)]
    pub cc: Vec<String>,
    /// Bcc recipients
    #[serde(default)]
    pub bcc: Vec<String>,
    /// Subject line
    #[serde(default)]
    pub subject: String,
    /// Message body in `body_format`
    #[serde(default)]
    pub body: String,
    /// Body format (`text`, `html`, `rtf`)
    #[serde(default)]
    pub body_format: BodyFormat,
    /// Importance marker
    #[serde(default)]
    pub importance: Importance,
    /// Local file paths to attach; must exist and be readable
    #[serde(default)]
    pub attachments: Vec<String>,
    /// Whether to file a copy under Sent Items
    #[serde(default = "default_true")]
    pub save_to_sent: bool,
}

/// Input: session handshake
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct InitializeParams {
    /// Client display name
    pub client_name: String,
    /// Client version string
    pub client_version: String,
    /// Client capability hints, echoed into the session
    #[serde(default)]
    pub capabilities: Option<Value>,
    #[serde(flatten)]
    #[schemars(skip)]
    pub unknown: BTreeMap<String, Value>,
}

/// Input: list emails from the default inbox
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ListInboxEmailsParams {
    /// Filter to unread messages only
    #[serde(default)]
    pub unread_only: bool,
    /// Maximum messages to return (1..1000, default 50)
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(flatten)]
    #[schemars(skip)]
    pub unknown: BTreeMap<String, Value>,
}

/// Input: list emails from a named folder
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ListEmailsParams {
    /// Folder id from `get_folders`
    pub folder_id: String,
    /// Filter to unread messages only
    #[serde(default)]
    pub unread_only: bool,
    /// Maximum messages to return (1..1000, default 50)
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(flatten)]
    #[schemars(skip)]
    pub unknown: BTreeMap<String, Value>,
}

/// Input: fetch one email in full
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct GetEmailParams {
    /// Email id from a listing or search
    pub email_id: String,
    /// Include body fields in the response
    #[serde(default = "default_true")]
    pub include_body: bool,
    /// Include attachment metadata in the response
    #[serde(default = "default_true")]
    pub include_attachments: bool,
    /// Preferred body representation (`text` keeps only the plain body)
    #[serde(default = "default_body_format")]
    pub body_format: BodyFormat,
    #[serde(flatten)]
    #[schemars(skip)]
    pub unknown: BTreeMap<String, Value>,
}

/// Input: search emails
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct SearchEmailsParams {
    /// Store-specific query string, passed through untouched
    pub query: String,
    /// Restrict the search to one folder
    #[serde(default)]
    pub folder_id: Option<String>,
    /// Maximum results to return (1..1000, default 50)
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(flatten)]
    #[schemars(skip)]
    pub unknown: BTreeMap<String, Value>,
}

/// Input: send a message
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct SendEmailParams {
    #[serde(flatten)]
    pub outgoing: OutgoingEmail,
    #[serde(flatten)]
    #[schemars(skip)]
    pub unknown: BTreeMap<String, Value>,
}

/// Result: handshake response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeResult {
    pub server_name: String,
    pub server_version: String,
    pub capabilities: ServerCapabilities,
}

/// Capability metadata advertised at handshake
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerCapabilities {
    /// The callable method surface with input schemas
    pub methods: Vec<MethodCapability>,
}

/// One advertised method
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodCapability {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Result: `get_folders`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderListResult {
    pub folders: Vec<Folder>,
}

/// Result: `list_inbox_emails` / `list_emails`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailListResult {
    pub emails: Vec<EmailSummary>,
    pub total_count: usize,
    /// The folder id the listing was served from
    pub folder: String,
}

/// Result: `get_email`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailResult {
    pub email: EmailFull,
}

/// Result: `search_emails`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchEmailsResult {
    pub emails: Vec<EmailSummary>,
    pub total_count: usize,
    /// The query as received
    pub query: String,
}

/// Result: `send_email`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendEmailResult {
    /// Store-assigned id of the queued message
    pub email_id: String,
    /// Always `"sent"` on success
    pub status: String,
    /// Total addresses across to/cc/bcc
    pub recipient_count: usize,
    /// Whether a copy was filed under Sent Items
    pub saved_to_sent: bool,
}

/// Default value for `limit` fields
///
/// Deserialized as `i64` so out-of-range values reach range validation
/// instead of failing opaquely inside serde.
fn default_limit() -> i64 {
    50
}

/// Default value for `bool` fields that default on
fn default_true() -> bool {
    true
}

/// Default body representation for `get_email`
fn default_body_format() -> BodyFormat {
    BodyFormat::Html
}
