//! Two-tier response cache with lazy loading
//!
//! Three logical caches (folder list, listing/search summaries, full emails)
//! share one LRU store and one soft byte budget. Entries expire on TTL,
//! lazily on access and eagerly during the scheduled sweep. Concurrent
//! misses for the same key coalesce into a single upstream call
//! (single-flight); failures propagate to every waiter but never populate
//! the cache, so errors cannot stick.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use lru::LruCache;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::errors::ServerResult;
use crate::models::{EmailFull, EmailSummary, Folder};
use std::sync::Arc;

/// Cache key space across the three logical caches
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// The single folder-tree listing
    FolderList,
    /// One folder listing page
    Listing {
        folder_id: String,
        unread_only: bool,
        limit: usize,
    },
    /// One search result page
    Search {
        query: String,
        folder_id: Option<String>,
        limit: usize,
    },
    /// One full email body
    Email { email_id: String },
}

/// Cached payload variants
///
/// Values are wrapped in `Arc` so hits hand out cheap clones and large
/// bodies are never duplicated per caller.
#[derive(Debug, Clone)]
pub enum CachedValue {
    Folders(Arc<Vec<Folder>>),
    Summaries(Arc<Vec<EmailSummary>>),
    Email(Arc<EmailFull>),
}

impl CachedValue {
    /// Rough heap footprint used for budget accounting
    pub fn size_estimate(&self) -> usize {
        match self {
            Self::Folders(folders) => folders.iter().map(folder_size).sum::<usize>() + 32,
            Self::Summaries(summaries) => summaries.iter().map(summary_size).sum::<usize>() + 32,
            Self::Email(email) => full_size(email),
        }
    }
}

fn folder_size(folder: &Folder) -> usize {
    folder.id.len()
        + folder.name.len()
        + folder.full_path.len()
        + folder.parent_id.as_ref().map_or(0, String::len)
        + 64
}

fn summary_size(summary: &EmailSummary) -> usize {
    summary.id.len()
        + summary.subject.len()
        + summary.sender_name.len()
        + summary.sender_email.len()
        + summary.folder_id.len()
        + summary.body_preview.len()
        + summary.recipients.iter().map(String::len).sum::<usize>()
        + 96
}

fn full_size(email: &EmailFull) -> usize {
    summary_size(&email.summary)
        + email.body_text.len()
        + email.body_html.len()
        + email.cc.iter().map(String::len).sum::<usize>()
        + email.bcc.iter().map(String::len).sum::<usize>()
        + email
            .attachments
            .iter()
            .map(|a| a.name.len() + a.mime_type.len() + 16)
            .sum::<usize>()
        + 64
}

#[derive(Debug)]
struct Entry {
    value: CachedValue,
    inserted_at: Instant,
    ttl: Duration,
    size: usize,
}

impl Entry {
    fn is_fresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted_at) <= self.ttl
    }
}

type LoadOutcome = Option<ServerResult<CachedValue>>;

#[derive(Debug, Default)]
struct CacheStatsInner {
    hits: u64,
    misses: u64,
    coalesced: u64,
    expired: u64,
    evictions: u64,
}

/// Cache statistics snapshot for the health report
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub coalesced: u64,
    pub expired: u64,
    pub evictions: u64,
    pub entries: usize,
    pub total_bytes: usize,
}

struct CacheState {
    entries: LruCache<CacheKey, Entry>,
    total_bytes: usize,
    inflight: HashMap<CacheKey, watch::Receiver<LoadOutcome>>,
    stats: CacheStatsInner,
}

/// Shared-budget response cache
pub struct EmailCache {
    max_bytes: usize,
    state: Mutex<CacheState>,
}

/// Removes the in-flight marker when a leading loader is dropped before
/// completion, so later callers can become leaders instead of waiting on a
/// dead channel.
struct FlightGuard<'a> {
    cache: &'a EmailCache,
    key: CacheKey,
    armed: bool,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.cache.state.lock().unwrap_or_else(|e| e.into_inner());
            state.inflight.remove(&self.key);
        }
    }
}

enum Role {
    Hit(CachedValue),
    Waiter(watch::Receiver<LoadOutcome>),
    Leader(watch::Sender<LoadOutcome>),
}

impl EmailCache {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            state: Mutex::new(CacheState {
                entries: LruCache::unbounded(),
                total_bytes: 0,
                inflight: HashMap::new(),
                stats: CacheStatsInner::default(),
            }),
        }
    }

    /// Look up `key`, loading through `load` on a miss
    ///
    /// Exactly one caller runs the loader per key at a time; concurrent
    /// callers await its outcome. Only successful loads populate the cache.
    /// The internal lock is never held across a suspension point.
    pub async fn get_or_load<F, Fut>(
        &self,
        key: CacheKey,
        ttl: Duration,
        load: F,
    ) -> ServerResult<CachedValue>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = ServerResult<CachedValue>>,
    {
        loop {
            let role = {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                let now = Instant::now();
                let hit = match state.entries.get(&key) {
                    Some(entry) if entry.is_fresh(now) => Some(entry.value.clone()),
                    _ => None,
                };
                if let Some(value) = hit {
                    state.stats.hits += 1;
                    trace!(key = ?key, "cache hit");
                    Role::Hit(value)
                } else {
                    // Lazy expiry: a stale entry is removed on access.
                    if let Some(old) = state.entries.pop(&key) {
                        state.total_bytes = state.total_bytes.saturating_sub(old.size);
                        state.stats.expired += 1;
                    }
                    if let Some(rx) = state.inflight.get(&key).cloned() {
                        state.stats.coalesced += 1;
                        Role::Waiter(rx)
                    } else {
                        let (tx, rx) = watch::channel(None);
                        state.inflight.insert(key.clone(), rx);
                        state.stats.misses += 1;
                        trace!(key = ?key, "cache miss");
                        Role::Leader(tx)
                    }
                }
            };

            match role {
                Role::Hit(value) => return Ok(value),
                Role::Waiter(mut rx) => {
                    loop {
                        let outcome = rx.borrow_and_update().clone();
                        if let Some(result) = outcome {
                            return result;
                        }
                        if rx.changed().await.is_err() {
                            // Leader was cancelled before publishing; take
                            // over by restarting the lookup.
                            break;
                        }
                    }
                }
                Role::Leader(tx) => {
                    let mut guard = FlightGuard {
                        cache: self,
                        key: key.clone(),
                        armed: true,
                    };
                    let result = load().await;
                    {
                        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                        state.inflight.remove(&key);
                        guard.armed = false;
                        if let Ok(value) = &result {
                            insert_locked(&mut state, self.max_bytes, key, value.clone(), ttl);
                        }
                    }
                    let _ = tx.send(Some(result.clone()));
                    return result;
                }
            }
        }
    }

    /// Insert a value directly (prefetch path)
    pub fn insert(&self, key: CacheKey, value: CachedValue, ttl: Duration) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        insert_locked(&mut state, self.max_bytes, key, value, ttl);
    }

    /// Whether a fresh entry exists without touching LRU order
    pub fn contains_fresh(&self, key: &CacheKey) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .entries
            .peek(key)
            .is_some_and(|entry| entry.is_fresh(Instant::now()))
    }

    /// Drop the folder listing and any summary pages for the given folder
    ///
    /// Called after a successful send so Sent Items listings and folder
    /// counts are refreshed on next access.
    pub fn invalidate_folder(&self, folder_id: Option<&str>) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut doomed = vec![CacheKey::FolderList];
        if let Some(folder_id) = folder_id {
            for (key, _) in state.entries.iter() {
                let matches = match key {
                    CacheKey::Listing { folder_id: f, .. } => f == folder_id,
                    CacheKey::Search { folder_id: f, .. } => {
                        f.as_deref() == Some(folder_id) || f.is_none()
                    }
                    _ => false,
                };
                if matches {
                    doomed.push(key.clone());
                }
            }
        }
        for key in doomed {
            if let Some(old) = state.entries.pop(&key) {
                state.total_bytes = state.total_bytes.saturating_sub(old.size);
            }
        }
    }

    /// Find the cached id of a folder by display name, if the folder list
    /// is currently cached
    pub fn cached_folder_id_by_name(&self, name: &str) -> Option<String> {
        self.with_cached_folders(|folders| {
            folders
                .iter()
                .find(|f| f.name.eq_ignore_ascii_case(name))
                .map(|f| f.id.clone())
        })
    }

    /// Look up a folder record by id in the cached folder list
    pub fn cached_folder_by_id(&self, folder_id: &str) -> Option<Folder> {
        self.with_cached_folders(|folders| folders.iter().find(|f| f.id == folder_id).cloned())
    }

    fn with_cached_folders<T>(&self, f: impl FnOnce(&[Folder]) -> Option<T>) -> Option<T> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let entry = state.entries.peek(&CacheKey::FolderList)?;
        if !entry.is_fresh(Instant::now()) {
            return None;
        }
        match &entry.value {
            CachedValue::Folders(folders) => f(folders),
            _ => None,
        }
    }

    /// Expiry and pressure sweep
    ///
    /// Removes every expired entry, then evicts coldest entries until usage
    /// is at or below 80% of the byte budget. Run on the maintenance cadence.
    pub fn sweep(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let expired: Vec<CacheKey> = state
            .entries
            .iter()
            .filter(|(_, entry)| !entry.is_fresh(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            if let Some(old) = state.entries.pop(&key) {
                state.total_bytes = state.total_bytes.saturating_sub(old.size);
                state.stats.expired += 1;
            }
        }
        let low_water = self.max_bytes / 5 * 4;
        while state.total_bytes > low_water {
            match state.entries.pop_lru() {
                Some((key, old)) => {
                    state.total_bytes = state.total_bytes.saturating_sub(old.size);
                    state.stats.evictions += 1;
                    debug!(key = ?key, size = old.size, "cache evicted under pressure");
                }
                None => break,
            }
        }
    }

    /// Drop everything (shutdown flush)
    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.entries.clear();
        state.total_bytes = 0;
    }

    /// Statistics snapshot
    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        CacheStats {
            hits: state.stats.hits,
            misses: state.stats.misses,
            coalesced: state.stats.coalesced,
            expired: state.stats.expired,
            evictions: state.stats.evictions,
            entries: state.entries.len(),
            total_bytes: state.total_bytes,
        }
    }
}

fn insert_locked(
    state: &mut CacheState,
    max_bytes: usize,
    key: CacheKey,
    value: CachedValue,
    ttl: Duration,
) {
    if let Some(old) = state.entries.pop(&key) {
        state.total_bytes = state.total_bytes.saturating_sub(old.size);
    }
    let size = value.size_estimate();
    state.entries.put(
        key,
        Entry {
            value,
            inserted_at: Instant::now(),
            ttl,
            size,
        },
    );
    state.total_bytes += size;
    // Keep at least the entry just inserted even if it alone exceeds the
    // budget; the sweep will reconsider it under pressure.
    while state.total_bytes > max_bytes && state.entries.len() > 1 {
        if let Some((_, old)) = state.entries.pop_lru() {
            state.total_bytes = state.total_bytes.saturating_sub(old.size);
            state.stats.evictions += 1;
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::{CacheKey, CachedValue, EmailCache};
    use crate::errors::ServerError;
    use crate::models::{Folder, FolderType};

    fn folder(id: &str, name: &str) -> Folder {
        Folder {
            id: id.to_owned(),
            name: name.to_owned(),
            full_path: format!("/{name}"),
            parent_id: None,
            item_count: 1,
            unread_count: 0,
            folder_type: FolderType::Mail,
            accessible: true,
            has_subfolders: false,
        }
    }

    fn folders_value(id: &str) -> CachedValue {
        CachedValue::Folders(Arc::new(vec![folder(id, "Inbox")]))
    }

    #[tokio::test]
    async fn second_lookup_is_served_from_cache() {
        let cache = EmailCache::new(1024 * 1024);
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let calls = calls.clone();
            cache
                .get_or_load(CacheKey::FolderList, Duration::from_secs(60), move || {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(folders_value("f-1"))
                    }
                })
                .await
                .expect("load must succeed");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_reloaded() {
        let cache = EmailCache::new(1024 * 1024);
        let calls = Arc::new(AtomicUsize::new(0));

        let load = |calls: Arc<AtomicUsize>| {
            move || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(folders_value("f-1"))
                }
            }
        };

        cache
            .get_or_load(CacheKey::FolderList, Duration::from_secs(1), load(calls.clone()))
            .await
            .expect("first load");
        tokio::time::sleep(Duration::from_millis(1500)).await;
        cache
            .get_or_load(CacheKey::FolderList, Duration::from_secs(1), load(calls.clone()))
            .await
            .expect("reload after expiry");

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.stats().expired, 1);
    }

    #[tokio::test]
    async fn concurrent_misses_coalesce_into_one_load() {
        let cache = Arc::new(EmailCache::new(1024 * 1024));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            tasks.push(tokio::spawn(async move {
                cache
                    .get_or_load(CacheKey::FolderList, Duration::from_secs(60), move || {
                        let calls = calls.clone();
                        async move {
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            calls.fetch_add(1, Ordering::SeqCst);
                            Ok(folders_value("f-1"))
                        }
                    })
                    .await
            }));
        }
        for task in tasks {
            task.await.expect("task must join").expect("load must succeed");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_loads_do_not_populate() {
        let cache = EmailCache::new(1024 * 1024);

        let err = cache
            .get_or_load(CacheKey::FolderList, Duration::from_secs(60), || async {
                Err(ServerError::Unavailable("store down".to_owned()))
            })
            .await
            .expect_err("load must fail");
        assert!(matches!(err, ServerError::Unavailable(_)));

        // Next lookup runs the loader again instead of serving a negative
        // cache entry.
        let value = cache
            .get_or_load(CacheKey::FolderList, Duration::from_secs(60), || async {
                Ok(folders_value("f-2"))
            })
            .await
            .expect("second load must succeed");
        match value {
            CachedValue::Folders(folders) => assert_eq!(folders[0].id, "f-2"),
            other => panic!("expected folders, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn byte_budget_evicts_coldest_entries() {
        let cache = EmailCache::new(600);
        for i in 0..8 {
            cache.insert(
                CacheKey::Listing {
                    folder_id: format!("f-{i}"),
                    unread_only: false,
                    limit: 10,
                },
                folders_value(&format!("f-{i}")),
                Duration::from_secs(60),
            );
        }
        let stats = cache.stats();
        assert!(stats.total_bytes <= 600, "budget exceeded: {}", stats.total_bytes);
        assert!(stats.evictions > 0);
    }

    #[tokio::test]
    async fn invalidate_folder_drops_folder_list_and_listings() {
        let cache = EmailCache::new(1024 * 1024);
        cache.insert(
            CacheKey::FolderList,
            folders_value("sent"),
            Duration::from_secs(60),
        );
        cache.insert(
            CacheKey::Listing {
                folder_id: "sent".to_owned(),
                unread_only: false,
                limit: 10,
            },
            folders_value("sent"),
            Duration::from_secs(60),
        );
        cache.insert(
            CacheKey::Listing {
                folder_id: "other".to_owned(),
                unread_only: false,
                limit: 10,
            },
            folders_value("other"),
            Duration::from_secs(60),
        );

        cache.invalidate_folder(Some("sent"));

        assert!(!cache.contains_fresh(&CacheKey::FolderList));
        assert!(!cache.contains_fresh(&CacheKey::Listing {
            folder_id: "sent".to_owned(),
            unread_only: false,
            limit: 10,
        }));
        assert!(cache.contains_fresh(&CacheKey::Listing {
            folder_id: "other".to_owned(),
            unread_only: false,
            limit: 10,
        }));
    }
}
