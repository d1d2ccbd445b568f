//! In-memory mail store
//!
//! A self-contained [`MailAdapter`] backend used for development, protocol
//! testing, and the integration suite. It honors the full contract —
//! folder permissions, newest-first ordering, unread filtering, opaque
//! substring search — without any external mail client. Call counters are
//! exposed so tests can assert how often the core actually reached the
//! store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};

use crate::adapter::{AdapterError, AdapterResult, MailAdapter, MailConnector};
use crate::models::{
    Attachment, EmailFull, EmailSummary, Folder, FolderType, Importance, OutgoingEmail,
};

const INBOX_ID: &str = "folder-inbox";
const SENT_ID: &str = "folder-sent";
const DRAFTS_ID: &str = "folder-drafts";

/// Per-operation invocation counters
#[derive(Debug, Default)]
pub struct CallCounters {
    pub probe: AtomicUsize,
    pub list_folders: AtomicUsize,
    pub resolve_inbox: AtomicUsize,
    pub list_emails: AtomicUsize,
    pub get_email: AtomicUsize,
    pub search: AtomicUsize,
    pub send: AtomicUsize,
}

#[derive(Debug)]
struct StoreInner {
    folders: Vec<Folder>,
    emails: HashMap<String, EmailFull>,
    /// Marks the store unreachable; operations fail with `Unavailable`
    offline: bool,
}

/// Shared in-memory mailbox
///
/// Cloned handles (one per pool slot) all see the same mailbox, the same
/// way every Outlook handle sees the same profile.
pub struct InMemoryMailStore {
    inner: Arc<Mutex<StoreInner>>,
    counters: Arc<CallCounters>,
    send_seq: Arc<AtomicU64>,
    /// Artificial per-call latency for timeout and pool-contention tests
    latency: std::time::Duration,
}

impl InMemoryMailStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(StoreInner {
                folders: default_folders(),
                emails: HashMap::new(),
                offline: false,
            })),
            counters: Arc::new(CallCounters::default()),
            send_seq: Arc::new(AtomicU64::new(1)),
            latency: std::time::Duration::ZERO,
        }
    }

    /// A mailbox pre-populated with a few inbox messages
    pub fn with_sample_data() -> Self {
        let store = Self::new();
        let now = Utc::now();
        for n in 0..3 {
            let id = format!("msg-{}", n + 1);
            let summary = EmailSummary {
                id: id.clone(),
                subject: format!("Sample message {}", n + 1),
                sender_name: "Demo Sender".to_owned(),
                sender_email: "sender@example.com".to_owned(),
                recipients: vec!["you@example.com".to_owned()],
                received_time: now - ChronoDuration::minutes(i64::from(n) * 30),
                sent_time: Some(now - ChronoDuration::minutes(i64::from(n) * 30 + 1)),
                is_read: n > 0,
                has_attachments: false,
                importance: Importance::Normal,
                folder_id: INBOX_ID.to_owned(),
                size_bytes: 2048,
                body_preview: "This is a sample message body".to_owned(),
            };
            store.insert_email(EmailFull {
                summary,
                body_text: "This is a sample message body.".to_owned(),
                body_html: "<p>This is a sample message body.</p>".to_owned(),
                cc: Vec::new(),
                bcc: Vec::new(),
                attachments: Vec::new(),
            });
        }
        store
    }

    /// Add artificial latency to every operation
    pub fn with_latency(mut self, latency: std::time::Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Insert an email, updating the owning folder's counts
    pub fn insert_email(&self, email: EmailFull) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let folder_id = email.summary.folder_id.clone();
        let unread = !email.summary.is_read;
        inner.emails.insert(email.summary.id.clone(), email);
        if let Some(folder) = inner.folders.iter_mut().find(|f| f.id == folder_id) {
            folder.item_count += 1;
            if unread {
                folder.unread_count += 1;
            }
        }
    }

    /// Flip the store offline (operations fail) or back online
    pub fn set_offline(&self, offline: bool) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.offline = offline;
    }

    pub fn counters(&self) -> Arc<CallCounters> {
        self.counters.clone()
    }

    async fn simulate_work(&self) -> AdapterResult<()> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.offline {
            return Err(AdapterError::Unavailable("store is offline".to_owned()));
        }
        Ok(())
    }
}

impl Default for InMemoryMailStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Clones share the same mailbox, the way every Outlook handle sees the
/// same profile
impl Clone for InMemoryMailStore {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            counters: self.counters.clone(),
            send_seq: self.send_seq.clone(),
            latency: self.latency,
        }
    }
}

fn default_folders() -> Vec<Folder> {
    vec![
        Folder {
            id: INBOX_ID.to_owned(),
            name: "Inbox".to_owned(),
            full_path: "/Inbox".to_owned(),
            parent_id: None,
            item_count: 0,
            unread_count: 0,
            folder_type: FolderType::Mail,
            accessible: true,
            has_subfolders: false,
        },
        Folder {
            id: SENT_ID.to_owned(),
            name: "Sent Items".to_owned(),
            full_path: "/Sent Items".to_owned(),
            parent_id: None,
            item_count: 0,
            unread_count: 0,
            folder_type: FolderType::Mail,
            accessible: true,
            has_subfolders: false,
        },
        Folder {
            id: DRAFTS_ID.to_owned(),
            name: "Drafts".to_owned(),
            full_path: "/Drafts".to_owned(),
            parent_id: None,
            item_count: 0,
            unread_count: 0,
            folder_type: FolderType::Mail,
            accessible: true,
            has_subfolders: false,
        },
    ]
}

#[async_trait]
impl MailAdapter for InMemoryMailStore {
    async fn probe(&self) -> AdapterResult<()> {
        self.counters.probe.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.offline {
            return Err(AdapterError::Unavailable("store is offline".to_owned()));
        }
        Ok(())
    }

    async fn list_folders(&self) -> AdapterResult<Vec<Folder>> {
        self.counters.list_folders.fetch_add(1, Ordering::SeqCst);
        self.simulate_work().await?;
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(inner.folders.clone())
    }

    async fn resolve_inbox(&self) -> AdapterResult<String> {
        self.counters.resolve_inbox.fetch_add(1, Ordering::SeqCst);
        self.simulate_work().await?;
        Ok(INBOX_ID.to_owned())
    }

    async fn list_emails(
        &self,
        folder_id: &str,
        unread_only: bool,
        limit: usize,
    ) -> AdapterResult<Vec<EmailSummary>> {
        self.counters.list_emails.fetch_add(1, Ordering::SeqCst);
        self.simulate_work().await?;
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let folder = inner
            .folders
            .iter()
            .find(|f| f.id == folder_id)
            .ok_or_else(|| AdapterError::NotFound(format!("folder '{folder_id}'")))?;
        if !folder.accessible {
            return Err(AdapterError::PermissionDenied(folder_id.to_owned()));
        }
        let mut summaries: Vec<EmailSummary> = inner
            .emails
            .values()
            .filter(|e| e.summary.folder_id == folder_id)
            .filter(|e| !unread_only || !e.summary.is_read)
            .map(|e| e.summary.clone())
            .collect();
        summaries.sort_by(|a, b| b.received_time.cmp(&a.received_time));
        summaries.truncate(limit);
        Ok(summaries)
    }

    async fn get_email(&self, email_id: &str) -> AdapterResult<EmailFull> {
        self.counters.get_email.fetch_add(1, Ordering::SeqCst);
        self.simulate_work().await?;
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .emails
            .get(email_id)
            .cloned()
            .ok_or_else(|| AdapterError::NotFound(format!("email '{email_id}'")))
    }

    async fn search(
        &self,
        query: &str,
        folder_id: Option<&str>,
        limit: usize,
    ) -> AdapterResult<Vec<EmailSummary>> {
        self.counters.search.fetch_add(1, Ordering::SeqCst);
        self.simulate_work().await?;
        let needle = query.to_lowercase();
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut matches: Vec<EmailSummary> = inner
            .emails
            .values()
            .filter(|e| folder_id.is_none_or(|f| e.summary.folder_id == f))
            .filter(|e| {
                e.summary.subject.to_lowercase().contains(&needle)
                    || e.body_text.to_lowercase().contains(&needle)
                    || e.summary.sender_email.to_lowercase().contains(&needle)
            })
            .map(|e| e.summary.clone())
            .collect();
        matches.sort_by(|a, b| b.received_time.cmp(&a.received_time));
        matches.truncate(limit);
        Ok(matches)
    }

    async fn send(&self, outgoing: &OutgoingEmail) -> AdapterResult<String> {
        self.counters.send.fetch_add(1, Ordering::SeqCst);
        self.simulate_work().await?;
        if outgoing.to.is_empty() {
            return Err(AdapterError::InvalidArgument(
                "at least one recipient is required".to_owned(),
            ));
        }
        let seq = self.send_seq.fetch_add(1, Ordering::SeqCst);
        let id = format!("sent-{seq}");
        if outgoing.save_to_sent {
            let now = Utc::now();
            let email = EmailFull {
                summary: EmailSummary {
                    id: id.clone(),
                    subject: outgoing.subject.clone(),
                    sender_name: "Local Identity".to_owned(),
                    sender_email: "me@example.com".to_owned(),
                    recipients: outgoing.to.clone(),
                    received_time: now,
                    sent_time: Some(now),
                    is_read: true,
                    has_attachments: !outgoing.attachments.is_empty(),
                    importance: outgoing.importance,
                    folder_id: SENT_ID.to_owned(),
                    size_bytes: outgoing.body.len() as u64,
                    body_preview: preview_of(&outgoing.body),
                },
                body_text: outgoing.body.clone(),
                body_html: String::new(),
                cc: outgoing.cc.clone(),
                bcc: outgoing.bcc.clone(),
                attachments: outgoing
                    .attachments
                    .iter()
                    .map(|path| Attachment {
                        name: file_name_of(path),
                        size_bytes: 0,
                        mime_type: "application/octet-stream".to_owned(),
                    })
                    .collect(),
            };
            insert_sent_copy(&self.inner, email);
        }
        Ok(id)
    }
}

fn insert_sent_copy(inner: &Arc<Mutex<StoreInner>>, email: EmailFull) {
    let mut inner = inner.lock().unwrap_or_else(|e| e.into_inner());
    let folder_id = email.summary.folder_id.clone();
    inner.emails.insert(email.summary.id.clone(), email);
    if let Some(folder) = inner.folders.iter_mut().find(|f| f.id == folder_id) {
        folder.item_count += 1;
    }
}

fn preview_of(body: &str) -> String {
    body.chars().take(255).collect()
}

fn file_name_of(path: &str) -> String {
    std::path::Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_owned())
}

/// Connector handing out handles onto one shared in-memory mailbox
pub struct InMemoryConnector {
    store: InMemoryMailStore,
}

impl InMemoryConnector {
    pub fn new(store: InMemoryMailStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl MailConnector for InMemoryConnector {
    async fn connect(&self) -> AdapterResult<Box<dyn MailAdapter>> {
        Ok(Box::new(self.store.clone()))
    }
}
