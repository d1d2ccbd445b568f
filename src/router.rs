//! Request routing and parameter validation
//!
//! Maps method names to handlers, decodes parameter records, and enforces
//! the per-method constraints (ranges, non-empty ids, recipient address
//! syntax) before any resource is touched. Unknown parameter fields are
//! ignored but logged; validation failures map to `invalid_params`.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use schemars::schema_for;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;

use crate::errors::{invalid_field, invalid_params, ServerResult};
use crate::models::{
    GetEmailParams, InitializeParams, ListEmailsParams, ListInboxEmailsParams, MethodCapability,
    OutgoingEmail, SearchEmailsParams, SendEmailParams,
};
use crate::protocol::RequestId;

/// Upper bound on `limit` parameters
pub const MAX_LIMIT: i64 = 1000;

/// Longest accepted email id; ids are opaque store strings but unbounded
/// input is still rejected
const MAX_EMAIL_ID_LEN: usize = 512;

/// Request-scoped context injected into every handler
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// The wire id, absent for notifications
    pub request_id: Option<RequestId>,
    /// Hard deadline for the whole request
    pub deadline: Instant,
    /// Caller identity when the transport provides one
    pub caller: Option<String>,
}

/// The callable method surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Initialize,
    Shutdown,
    GetFolders,
    ListInboxEmails,
    ListEmails,
    GetEmail,
    SearchEmails,
    SendEmail,
}

impl Method {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "initialize" => Some(Self::Initialize),
            "shutdown" => Some(Self::Shutdown),
            "get_folders" => Some(Self::GetFolders),
            "list_inbox_emails" => Some(Self::ListInboxEmails),
            "list_emails" => Some(Self::ListEmails),
            "get_email" => Some(Self::GetEmail),
            "search_emails" => Some(Self::SearchEmails),
            "send_email" => Some(Self::SendEmail),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Initialize => "initialize",
            Self::Shutdown => "shutdown",
            Self::GetFolders => "get_folders",
            Self::ListInboxEmails => "list_inbox_emails",
            Self::ListEmails => "list_emails",
            Self::GetEmail => "get_email",
            Self::SearchEmails => "search_emails",
            Self::SendEmail => "send_email",
        }
    }

    /// The six mailbox operations, as opposed to session control
    pub fn is_mail_operation(&self) -> bool {
        !matches!(self, Self::Initialize | Self::Shutdown)
    }

    /// Side-effectful methods still run when sent as notifications
    pub fn has_side_effects(&self) -> bool {
        matches!(self, Self::SendEmail)
    }
}

/// Capability metadata advertised at handshake: every mailbox method with
/// its input schema
pub fn method_capabilities() -> Vec<MethodCapability> {
    fn capability<T: schemars::JsonSchema>(name: &str, description: &str) -> MethodCapability {
        let schema = serde_json::to_value(schema_for!(T)).unwrap_or(Value::Null);
        MethodCapability {
            name: name.to_owned(),
            description: description.to_owned(),
            input_schema: schema,
        }
    }

    vec![
        capability::<InitializeParams>("initialize", "Session handshake and capability exchange"),
        capability::<GetFoldersParamsSchema>("get_folders", "List all available email folders"),
        capability::<ListInboxEmailsParams>(
            "list_inbox_emails",
            "List emails from the default inbox",
        ),
        capability::<ListEmailsParams>("list_emails", "List emails from a folder"),
        capability::<GetEmailParams>("get_email", "Retrieve one email in full"),
        capability::<SearchEmailsParams>("search_emails", "Search emails with a store query"),
        capability::<SendEmailParams>("send_email", "Send a new email"),
    ]
}

/// `get_folders` takes no parameters; this empty record exists so the
/// advertised schema says so explicitly.
#[derive(schemars::JsonSchema)]
struct GetFoldersParamsSchema {}

/// Decode a parameter record, mapping serde failures to `invalid_params`
pub fn decode_params<T: DeserializeOwned>(method: &str, params: Value) -> ServerResult<T> {
    serde_json::from_value(params)
        .map_err(|e| invalid_params(format!("invalid parameters for '{method}': {e}")))
}

/// Log (and otherwise ignore) unknown input fields
pub fn note_unknown_fields(method: &str, unknown: &BTreeMap<String, Value>) {
    if !unknown.is_empty() {
        let fields: Vec<&str> = unknown.keys().map(String::as_str).collect();
        debug!(method, ?fields, "ignoring unknown parameter fields");
    }
}

/// Validate a `limit` parameter into its usable range
pub fn validate_limit(limit: i64) -> ServerResult<usize> {
    if !(1..=MAX_LIMIT).contains(&limit) {
        return Err(invalid_field(
            "limit",
            format!("limit must be in range 1..{MAX_LIMIT}"),
        ));
    }
    Ok(limit as usize)
}

/// Validate an email id parameter
pub fn validate_email_id(email_id: &str) -> ServerResult<()> {
    if email_id.trim().is_empty() {
        return Err(invalid_field("email_id", "email_id must not be empty"));
    }
    if email_id.len() > MAX_EMAIL_ID_LEN {
        return Err(invalid_field(
            "email_id",
            format!("email_id must be at most {MAX_EMAIL_ID_LEN} characters"),
        ));
    }
    validate_no_controls(email_id, "email_id")
}

/// Validate a folder id parameter
pub fn validate_folder_id(folder_id: &str) -> ServerResult<()> {
    if folder_id.trim().is_empty() {
        return Err(invalid_field("folder_id", "folder_id must not be empty"));
    }
    validate_no_controls(folder_id, "folder_id")
}

/// Reject control characters in user-provided identifiers
///
/// Ids are opaque store strings, but they are echoed into logs and error
/// payloads and must never smuggle line breaks or escapes.
fn validate_no_controls(value: &str, field: &str) -> ServerResult<()> {
    if value.chars().any(|ch| ch.is_ascii_control()) {
        return Err(invalid_field(
            field,
            format!("{field} must not contain control characters"),
        ));
    }
    Ok(())
}

/// Validate a search query parameter
///
/// The syntax itself is opaque to the core and passed through to the store.
pub fn validate_query(query: &str) -> ServerResult<()> {
    if query.trim().is_empty() {
        return Err(invalid_field("query", "query must not be empty"));
    }
    Ok(())
}

/// Syntactic address check for outgoing recipients
pub fn is_valid_address(address: &str) -> bool {
    static ADDRESS_RE: OnceLock<Regex> = OnceLock::new();
    let re = ADDRESS_RE.get_or_init(|| {
        Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$")
            .expect("address regex compiles")
    });
    re.is_match(address)
}

/// Validate the outgoing message record before any resource is touched
pub fn validate_outgoing(outgoing: &OutgoingEmail) -> ServerResult<()> {
    if outgoing.to.is_empty() {
        return Err(invalid_field("to", "at least one primary recipient is required"));
    }
    let total = outgoing.to.len() + outgoing.cc.len() + outgoing.bcc.len();
    if total == 0 {
        return Err(invalid_field("to", "at least one recipient is required"));
    }
    for (field, addresses) in [
        ("to", &outgoing.to),
        ("cc", &outgoing.cc),
        ("bcc", &outgoing.bcc),
    ] {
        for address in addresses {
            if !is_valid_address(address) {
                return Err(invalid_field(
                    field,
                    format!("'{address}' is not a valid email address"),
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        decode_params, is_valid_address, validate_email_id, validate_limit, validate_outgoing,
        Method,
    };
    use crate::models::{ListEmailsParams, OutgoingEmail};

    fn outgoing(to: Vec<&str>) -> OutgoingEmail {
        OutgoingEmail {
            to: to.into_iter().map(str::to_owned).collect(),
            cc: Vec::new(),
            bcc: Vec::new(),
            subject: "s".to_owned(),
            body: "b".to_owned(),
            body_format: Default::default(),
            importance: Default::default(),
            attachments: Vec::new(),
            save_to_sent: true,
        }
    }

    #[test]
    fn method_names_round_trip() {
        for name in [
            "initialize",
            "shutdown",
            "get_folders",
            "list_inbox_emails",
            "list_emails",
            "get_email",
            "search_emails",
            "send_email",
        ] {
            let method = Method::from_name(name).expect("known method");
            assert_eq!(method.name(), name);
        }
        assert!(Method::from_name("delete_email").is_none());
    }

    #[test]
    fn limit_bounds_are_inclusive() {
        assert!(validate_limit(0).is_err());
        assert_eq!(validate_limit(1).expect("1 is valid"), 1);
        assert_eq!(validate_limit(1000).expect("1000 is valid"), 1000);
        assert!(validate_limit(1001).is_err());
        assert!(validate_limit(-5).is_err());
    }

    #[test]
    fn empty_email_id_is_rejected() {
        assert!(validate_email_id("").is_err());
        assert!(validate_email_id("  ").is_err());
        assert!(validate_email_id("AAMkAD...").is_ok());
    }

    #[test]
    fn control_characters_are_rejected_in_identifiers() {
        assert!(validate_email_id("msg\n1").is_err());
        assert!(validate_email_id("msg\r\n1").is_err());
        assert!(validate_email_id("msg\t1").is_err());
        assert!(super::validate_folder_id("inbox\u{1b}[2J").is_err());
        assert!(super::validate_folder_id("folder-inbox").is_ok());
    }

    #[test]
    fn address_syntax_check_matches_common_forms() {
        assert!(is_valid_address("user@example.com"));
        assert!(is_valid_address("first.last+tag@sub.example.co"));
        assert!(!is_valid_address("not-an-email"));
        assert!(!is_valid_address("user@"));
        assert!(!is_valid_address("@example.com"));
        assert!(!is_valid_address("user@example"));
    }

    #[test]
    fn outgoing_requires_a_primary_recipient() {
        assert!(validate_outgoing(&outgoing(vec![])).is_err());
        assert!(validate_outgoing(&outgoing(vec!["a@example.com"])).is_ok());
        assert!(validate_outgoing(&outgoing(vec!["not-an-email"])).is_err());
    }

    #[test]
    fn decode_surfaces_type_mismatches_as_invalid_params() {
        let err = decode_params::<ListEmailsParams>(
            "list_emails",
            json!({ "folder_id": 42 }),
        )
        .expect_err("folder_id must be a string");
        assert_eq!(err.code(), -32602);
    }
}
