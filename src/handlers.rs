//! Mailbox operation handlers
//!
//! Each operation is expressed over the cache, rate limiter, and pool:
//! consult the cache, on a miss borrow a pooled handle, invoke the adapter
//! contract under the request deadline, populate the cache, and map adapter
//! failures into the server taxonomy. Transient failures are retried at
//! most twice with exponential backoff; handlers never call other handlers.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::adapter::{with_deadline, AdapterError, AdapterResult, MailAdapter};
use crate::cache::{CacheKey, CachedValue};
use crate::errors::{
    adapter_error_for_email, adapter_error_for_folder, adapter_error_for_search,
    adapter_error_for_store, invalid_field, ServerError, ServerResult,
};
use crate::models::{
    BodyFormat, EmailFull, EmailListResult, EmailResult, EmailSummary, Folder, FolderListResult,
    GetEmailParams, ListEmailsParams, ListInboxEmailsParams, OutgoingEmail, SearchEmailsParams,
    SearchEmailsResult, SendEmailParams, SendEmailResult,
};
use crate::pool::ReleaseOutcome;
use crate::router::{
    decode_params, note_unknown_fields, validate_email_id, validate_folder_id, validate_limit,
    validate_outgoing, validate_query, Method, RequestContext,
};
use crate::server::ServerContext;

/// Initial backoff for transient-failure retries; doubles per attempt
const RETRY_BACKOFF: Duration = Duration::from_millis(100);
/// Initial attempt plus at most two retries
const MAX_ATTEMPTS: u32 = 3;
/// Display name of the folder invalidated after a send
const SENT_ITEMS: &str = "Sent Items";
/// Default inbox display name used for cached resolution
const INBOX: &str = "Inbox";

/// One adapter invocation, described as data so the retry loop can reissue
/// it against a freshly borrowed handle.
enum StoreOp<'p> {
    ListFolders,
    ResolveInbox,
    ListEmails {
        folder_id: &'p str,
        unread_only: bool,
        limit: usize,
    },
    GetEmail {
        email_id: &'p str,
    },
    Search {
        query: &'p str,
        folder_id: Option<&'p str>,
        limit: usize,
    },
    Send {
        outgoing: &'p OutgoingEmail,
    },
}

enum StoreOutput {
    Folders(Vec<Folder>),
    InboxId(String),
    Summaries(Vec<EmailSummary>),
    Email(Box<EmailFull>),
    EmailId(String),
}

async fn run_op(adapter: &dyn MailAdapter, op: &StoreOp<'_>) -> AdapterResult<StoreOutput> {
    match op {
        StoreOp::ListFolders => adapter.list_folders().await.map(StoreOutput::Folders),
        StoreOp::ResolveInbox => adapter.resolve_inbox().await.map(StoreOutput::InboxId),
        StoreOp::ListEmails {
            folder_id,
            unread_only,
            limit,
        } => adapter
            .list_emails(folder_id, *unread_only, *limit)
            .await
            .map(StoreOutput::Summaries),
        StoreOp::GetEmail { email_id } => adapter
            .get_email(email_id)
            .await
            .map(|email| StoreOutput::Email(Box::new(email))),
        StoreOp::Search {
            query,
            folder_id,
            limit,
        } => adapter
            .search(query, *folder_id, *limit)
            .await
            .map(StoreOutput::Summaries),
        StoreOp::Send { outgoing } => adapter.send(outgoing).await.map(StoreOutput::EmailId),
    }
}

/// Borrow a handle and run one operation with retry and release bookkeeping
///
/// The handle is released with an outcome matching the failure: transport
/// failures retire it, a deadline hit retires it (the adapter may still be
/// mid-call), everything else returns it healthy.
async fn call_store<M>(
    ctx: &ServerContext,
    rc: &RequestContext,
    operation: &'static str,
    op: StoreOp<'_>,
    map_err: M,
) -> ServerResult<StoreOutput>
where
    M: Fn(AdapterError) -> ServerError,
{
    let mut attempt = 0u32;
    let mut backoff = RETRY_BACKOFF;
    loop {
        attempt += 1;
        let mut pooled = ctx
            .pool
            .acquire(rc.deadline)
            .await
            .map_err(|e| finish_error(ctx, e))?;
        let result = with_deadline(operation, rc.deadline, run_op(pooled.adapter(), &op)).await;
        match &result {
            Ok(_) => {}
            Err(AdapterError::Timeout(_)) => pooled.mark(ReleaseOutcome::TimedOut),
            Err(error) if error.breaks_handle() => pooled.mark(ReleaseOutcome::Broken),
            Err(_) => {}
        }
        drop(pooled);

        match result {
            Ok(output) => return Ok(output),
            Err(error) if error.is_retryable() && attempt < MAX_ATTEMPTS => {
                if Instant::now() + backoff >= rc.deadline {
                    return Err(finish_error(ctx, map_err(error)));
                }
                debug!(operation, attempt, "transient store failure; backing off");
                sleep(backoff).await;
                backoff *= 2;
            }
            Err(error) => return Err(finish_error(ctx, map_err(error))),
        }
    }
}

/// Fill in the timeout budget on deadline errors for client diagnostics
fn finish_error(ctx: &ServerContext, mut error: ServerError) -> ServerError {
    if let ServerError::Timeout { timeout_ms, .. } = &mut error {
        if *timeout_ms == 0 {
            *timeout_ms = ctx.config.request_timeout.as_millis() as u64;
        }
    }
    error
}

fn unexpected_output() -> ServerError {
    ServerError::Internal("store returned an unexpected result shape".to_owned())
}

/// Dispatch one validated mailbox method
///
/// Admission (concurrency gate and rate limiter) has already happened in
/// the server core; this layer decodes parameters and runs the operation.
pub async fn handle_method(
    ctx: &Arc<ServerContext>,
    rc: &RequestContext,
    method: Method,
    params: Value,
) -> ServerResult<Value> {
    match method {
        Method::GetFolders => get_folders(ctx, rc).await,
        Method::ListInboxEmails => list_inbox_emails(ctx, rc, params).await,
        Method::ListEmails => list_emails(ctx, rc, params).await,
        Method::GetEmail => get_email(ctx, rc, params).await,
        Method::SearchEmails => search_emails(ctx, rc, params).await,
        Method::SendEmail => send_email(ctx, rc, params).await,
        Method::Initialize | Method::Shutdown => Err(ServerError::Internal(
            "session control is handled by the server core".to_owned(),
        )),
    }
}

async fn get_folders(ctx: &Arc<ServerContext>, rc: &RequestContext) -> ServerResult<Value> {
    let folders = load_folders(ctx, rc).await?;
    let result = FolderListResult {
        folders: (*folders).clone(),
    };
    Ok(serde_json::to_value(result)?)
}

/// Folder-list lookup through the cache
async fn load_folders(
    ctx: &Arc<ServerContext>,
    rc: &RequestContext,
) -> ServerResult<Arc<Vec<Folder>>> {
    let loader_ctx = ctx.clone();
    let loader_rc = rc.clone();
    let value = ctx
        .cache
        .get_or_load(CacheKey::FolderList, ctx.config.cache.folder_ttl, move || {
            let ctx = loader_ctx.clone();
            let rc = loader_rc.clone();
            async move {
                let output = call_store(
                    &ctx,
                    &rc,
                    "list_folders",
                    StoreOp::ListFolders,
                    adapter_error_for_store,
                )
                .await?;
                match output {
                    StoreOutput::Folders(folders) => Ok(CachedValue::Folders(Arc::new(folders))),
                    _ => Err(unexpected_output()),
                }
            }
        })
        .await?;
    match value {
        CachedValue::Folders(folders) => Ok(folders),
        _ => Err(unexpected_output()),
    }
}

async fn list_inbox_emails(
    ctx: &Arc<ServerContext>,
    rc: &RequestContext,
    params: Value,
) -> ServerResult<Value> {
    let params: ListInboxEmailsParams = decode_params("list_inbox_emails", params)?;
    note_unknown_fields("list_inbox_emails", &params.unknown);
    let limit = validate_limit(params.limit)?;

    let inbox_id = resolve_inbox(ctx, rc).await?;
    let emails = load_listing(ctx, rc, &inbox_id, params.unread_only, limit).await?;
    maybe_prefetch(ctx, &emails);
    let result = EmailListResult {
        total_count: emails.len(),
        emails: (*emails).clone(),
        folder: inbox_id,
    };
    Ok(serde_json::to_value(result)?)
}

/// Inbox resolution: cached folder list first, the store second
async fn resolve_inbox(ctx: &Arc<ServerContext>, rc: &RequestContext) -> ServerResult<String> {
    if let Some(id) = ctx.cache.cached_folder_id_by_name(INBOX) {
        return Ok(id);
    }
    let output = call_store(
        ctx,
        rc,
        "resolve_inbox",
        StoreOp::ResolveInbox,
        adapter_error_for_store,
    )
    .await?;
    match output {
        StoreOutput::InboxId(id) => Ok(id),
        _ => Err(unexpected_output()),
    }
}

async fn list_emails(
    ctx: &Arc<ServerContext>,
    rc: &RequestContext,
    params: Value,
) -> ServerResult<Value> {
    let params: ListEmailsParams = decode_params("list_emails", params)?;
    note_unknown_fields("list_emails", &params.unknown);
    validate_folder_id(&params.folder_id)?;
    let limit = validate_limit(params.limit)?;

    let emails = load_listing(ctx, rc, &params.folder_id, params.unread_only, limit).await?;
    maybe_prefetch(ctx, &emails);
    let result = EmailListResult {
        total_count: emails.len(),
        emails: (*emails).clone(),
        folder: params.folder_id,
    };
    Ok(serde_json::to_value(result)?)
}

/// Listing lookup through the summary cache
async fn load_listing(
    ctx: &Arc<ServerContext>,
    rc: &RequestContext,
    folder_id: &str,
    unread_only: bool,
    limit: usize,
) -> ServerResult<Arc<Vec<EmailSummary>>> {
    ensure_folder_allowed(ctx, folder_id)?;
    let key = CacheKey::Listing {
        folder_id: folder_id.to_owned(),
        unread_only,
        limit,
    };
    let loader_ctx = ctx.clone();
    let loader_rc = rc.clone();
    let loader_folder = folder_id.to_owned();
    let value = ctx
        .cache
        .get_or_load(key, ctx.config.cache.email_ttl, move || {
            let ctx = loader_ctx.clone();
            let rc = loader_rc.clone();
            let folder_id = loader_folder.clone();
            async move {
                let output = call_store(
                    &ctx,
                    &rc,
                    "list_emails",
                    StoreOp::ListEmails {
                        folder_id: &folder_id,
                        unread_only,
                        limit,
                    },
                    |e| adapter_error_for_folder(e, &folder_id),
                )
                .await?;
                match output {
                    StoreOutput::Summaries(emails) => {
                        Ok(CachedValue::Summaries(Arc::new(emails)))
                    }
                    _ => Err(unexpected_output()),
                }
            }
        })
        .await?;
    match value {
        CachedValue::Summaries(emails) => Ok(emails),
        _ => Err(unexpected_output()),
    }
}

async fn get_email(
    ctx: &Arc<ServerContext>,
    rc: &RequestContext,
    params: Value,
) -> ServerResult<Value> {
    let params: GetEmailParams = decode_params("get_email", params)?;
    note_unknown_fields("get_email", &params.unknown);
    validate_email_id(&params.email_id)?;

    let email = load_email(ctx, rc, &params.email_id).await?;
    let result = EmailResult {
        email: shape_email(&email, &params),
    };
    Ok(serde_json::to_value(result)?)
}

/// Full-email lookup through the cache
async fn load_email(
    ctx: &Arc<ServerContext>,
    rc: &RequestContext,
    email_id: &str,
) -> ServerResult<Arc<EmailFull>> {
    let key = CacheKey::Email {
        email_id: email_id.to_owned(),
    };
    let loader_ctx = ctx.clone();
    let loader_rc = rc.clone();
    let loader_id = email_id.to_owned();
    let value = ctx
        .cache
        .get_or_load(key, ctx.config.cache.email_ttl, move || {
            let ctx = loader_ctx.clone();
            let rc = loader_rc.clone();
            let email_id = loader_id.clone();
            async move {
                let output = call_store(
                    &ctx,
                    &rc,
                    "get_email",
                    StoreOp::GetEmail {
                        email_id: &email_id,
                    },
                    |e| adapter_error_for_email(e, &email_id),
                )
                .await?;
                match output {
                    StoreOutput::Email(mut email) => {
                        truncate_bodies(&mut email, ctx.config.security.max_email_size_bytes);
                        Ok(CachedValue::Email(Arc::new(*email)))
                    }
                    _ => Err(unexpected_output()),
                }
            }
        })
        .await?;
    match value {
        CachedValue::Email(email) => Ok(email),
        _ => Err(unexpected_output()),
    }
}

async fn search_emails(
    ctx: &Arc<ServerContext>,
    rc: &RequestContext,
    params: Value,
) -> ServerResult<Value> {
    let params: SearchEmailsParams = decode_params("search_emails", params)?;
    note_unknown_fields("search_emails", &params.unknown);
    validate_query(&params.query)?;
    let limit = validate_limit(params.limit)?;
    if let Some(folder_id) = &params.folder_id {
        validate_folder_id(folder_id)?;
        ensure_folder_allowed(ctx, folder_id)?;
    }

    let key = CacheKey::Search {
        query: params.query.clone(),
        folder_id: params.folder_id.clone(),
        limit,
    };
    let loader_ctx = ctx.clone();
    let loader_rc = rc.clone();
    let loader_query = params.query.clone();
    let loader_folder = params.folder_id.clone();
    let value = ctx
        .cache
        .get_or_load(key, ctx.config.cache.email_ttl, move || {
            let ctx = loader_ctx.clone();
            let rc = loader_rc.clone();
            let query = loader_query.clone();
            let folder_id = loader_folder.clone();
            async move {
                let output = call_store(
                    &ctx,
                    &rc,
                    "search",
                    StoreOp::Search {
                        query: &query,
                        folder_id: folder_id.as_deref(),
                        limit,
                    },
                    |e| adapter_error_for_search(e, &query),
                )
                .await?;
                match output {
                    StoreOutput::Summaries(emails) => {
                        Ok(CachedValue::Summaries(Arc::new(emails)))
                    }
                    _ => Err(unexpected_output()),
                }
            }
        })
        .await?;
    let emails = match value {
        CachedValue::Summaries(emails) => emails,
        _ => return Err(unexpected_output()),
    };
    let result = SearchEmailsResult {
        total_count: emails.len(),
        emails: (*emails).clone(),
        query: params.query,
    };
    Ok(serde_json::to_value(result)?)
}

async fn send_email(
    ctx: &Arc<ServerContext>,
    rc: &RequestContext,
    params: Value,
) -> ServerResult<Value> {
    let params: SendEmailParams = decode_params("send_email", params)?;
    note_unknown_fields("send_email", &params.unknown);
    let outgoing = params.outgoing;
    validate_outgoing(&outgoing)?;
    validate_attachments(&outgoing.attachments).await?;

    let output = call_store(
        ctx,
        rc,
        "send",
        StoreOp::Send {
            outgoing: &outgoing,
        },
        adapter_error_for_store,
    )
    .await?;
    let email_id = match output {
        StoreOutput::EmailId(id) => id,
        _ => return Err(unexpected_output()),
    };

    // Sent Items listings and folder counts are stale now.
    let sent_id = ctx.cache.cached_folder_id_by_name(SENT_ITEMS);
    ctx.cache.invalidate_folder(sent_id.as_deref());

    let result = SendEmailResult {
        email_id,
        status: "sent".to_owned(),
        recipient_count: outgoing.to.len() + outgoing.cc.len() + outgoing.bcc.len(),
        saved_to_sent: outgoing.save_to_sent,
    };
    Ok(serde_json::to_value(result)?)
}

/// Pre-admission validation for `send_email`
///
/// Called by the server core before the concurrency gate and rate limiter,
/// so an invalid send consumes neither a slot nor a token.
pub async fn validate_send(params: &Value) -> ServerResult<()> {
    let params: SendEmailParams = decode_params("send_email", params.clone())?;
    validate_outgoing(&params.outgoing)?;
    validate_attachments(&params.outgoing.attachments).await
}

/// Check that every attachment path exists and is a readable file
pub async fn validate_attachments(paths: &[String]) -> ServerResult<()> {
    for path in paths {
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => {
                return Err(invalid_field(
                    "attachments",
                    format!("attachment '{path}' is not a regular file"),
                ));
            }
            Err(_) => {
                return Err(invalid_field(
                    "attachments",
                    format!("attachment '{path}' does not exist or is not readable"),
                ));
            }
        }
    }
    Ok(())
}

/// Folder access policy
///
/// Blocked folders (by id or display name) fail with a permission error;
/// when an allow-list is configured, anything off it fails the same way. A
/// folder the store marked inaccessible fails rather than returning empty.
fn ensure_folder_allowed(ctx: &ServerContext, folder_id: &str) -> ServerResult<()> {
    let security = &ctx.config.security;
    let mut identities = vec![folder_id.to_lowercase()];
    if let Some(folder) = ctx.cache.cached_folder_by_id(folder_id) {
        if !folder.accessible {
            return Err(ServerError::PermissionDenied(folder_id.to_owned()));
        }
        identities.push(folder.name.to_lowercase());
    }

    if security
        .blocked_folders
        .iter()
        .any(|blocked| identities.contains(&blocked.to_lowercase()))
    {
        return Err(ServerError::PermissionDenied(folder_id.to_owned()));
    }
    if !security.allowed_folders.is_empty()
        && !security
            .allowed_folders
            .iter()
            .any(|allowed| identities.contains(&allowed.to_lowercase()))
    {
        return Err(ServerError::PermissionDenied(folder_id.to_owned()));
    }
    Ok(())
}

/// Apply the response shaping flags of `get_email`
fn shape_email(full: &EmailFull, params: &GetEmailParams) -> EmailFull {
    let mut email = full.clone();
    if !params.include_body {
        email.body_text.clear();
        email.body_html.clear();
    } else if params.body_format == BodyFormat::Text {
        email.body_html.clear();
    }
    if !params.include_attachments {
        email.attachments.clear();
    }
    email
}

/// Truncate bodies to the configured size cap, on a char boundary
fn truncate_bodies(email: &mut EmailFull, max_bytes: usize) {
    truncate_on_boundary(&mut email.body_text, max_bytes);
    truncate_on_boundary(&mut email.body_html, max_bytes);
}

fn truncate_on_boundary(text: &mut String, max_bytes: usize) {
    if text.len() <= max_bytes {
        return;
    }
    let mut cut = max_bytes;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
}

/// Schedule background full-email loads for the head of a listing
///
/// Policy hook recovered from the lazy loader: when enabled, the top N
/// listing entries are fetched into the full-email cache through a small
/// worker budget. Overflow is dropped, never queued; prefetch must not
/// compete with live requests.
fn maybe_prefetch(ctx: &Arc<ServerContext>, emails: &Arc<Vec<EmailSummary>>) {
    let count = ctx.config.cache.prefetch_count;
    if count == 0 {
        return;
    }
    for summary in emails.iter().take(count) {
        let key = CacheKey::Email {
            email_id: summary.id.clone(),
        };
        if ctx.cache.contains_fresh(&key) {
            continue;
        }
        let ctx = ctx.clone();
        let email_id = summary.id.clone();
        tokio::spawn(async move {
            let Ok(_permit) = ctx.prefetch_permits.clone().try_acquire_owned() else {
                return;
            };
            if ctx.is_draining() {
                return;
            }
            let deadline = Instant::now() + ctx.config.outlook_connection_timeout;
            let Ok(mut pooled) = ctx.pool.acquire(deadline).await else {
                return;
            };
            match with_deadline("prefetch", deadline, pooled.adapter().get_email(&email_id)).await
            {
                Ok(mut email) => {
                    truncate_bodies(&mut email, ctx.config.security.max_email_size_bytes);
                    ctx.cache.insert(
                        CacheKey::Email { email_id },
                        CachedValue::Email(Arc::new(email)),
                        ctx.config.cache.email_ttl,
                    );
                }
                Err(AdapterError::Timeout(_)) => {
                    pooled.mark(ReleaseOutcome::TimedOut);
                }
                Err(error) => {
                    if error.breaks_handle() {
                        pooled.mark(ReleaseOutcome::Broken);
                    }
                    debug!(%error, "prefetch load failed");
                }
            }
        });
    }
}

/// Log a handler failure that is about to become a wire error
pub fn log_handler_failure(method: &str, error: &ServerError) {
    match error {
        ServerError::Internal(_) | ServerError::Unavailable(_) => {
            warn!(method, code = error.code(), %error, "request failed");
        }
        _ => debug!(method, code = error.code(), %error, "request failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::{truncate_on_boundary, validate_attachments};

    #[tokio::test]
    async fn missing_attachment_paths_are_rejected() {
        let err = validate_attachments(&["/definitely/not/here.pdf".to_owned()])
            .await
            .expect_err("missing file must be rejected");
        assert_eq!(err.code(), -32602);
    }

    #[tokio::test]
    async fn empty_attachment_list_is_fine() {
        validate_attachments(&[]).await.expect("no attachments");
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let mut text = "héllo wörld".to_owned();
        truncate_on_boundary(&mut text, 2);
        assert_eq!(text, "h");

        let mut short = "abc".to_owned();
        truncate_on_boundary(&mut short, 10);
        assert_eq!(short, "abc");
    }
}
