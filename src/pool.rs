//! Connection pool for mail store handles
//!
//! Owns a bounded set of live adapter handles. Callers borrow a handle for
//! the duration of one operation and return it through the guard's drop;
//! transport-level failures retire the handle and a replacement is rebuilt
//! up to the configured minimum. A background maintenance pass probes idle
//! handles, retires the stale and the old, and tops the pool back up.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adapter::{with_timeout, AdapterError, MailAdapter, MailConnector};
use crate::config::{PoolSettings, ServerConfig};
use crate::errors::{ServerError, ServerResult};

/// How the borrower's operation ended, reported at release
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Operation completed (successfully or with a resource-level error)
    Healthy,
    /// Transport-level failure; the handle must be retired
    Broken,
    /// The operation hit its deadline; the handle may be mid-call and is
    /// retired rather than reused
    TimedOut,
}

/// One live, exclusively-owned connection into the mail store
struct Handle {
    id: Uuid,
    adapter: Box<dyn MailAdapter>,
    created_at: Instant,
    last_used: Instant,
    use_count: u64,
}

#[derive(Debug, Default)]
struct PoolStatsInner {
    created: u64,
    retired: u64,
    borrowed: u64,
    returned: u64,
    probe_failures: u64,
    pool_hits: u64,
    pool_misses: u64,
}

/// Pool statistics snapshot for the health report
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub size: usize,
    pub idle: usize,
    pub in_use: usize,
    pub created: u64,
    pub retired: u64,
    pub borrowed: u64,
    pub returned: u64,
    pub probe_failures: u64,
    pub pool_hits: u64,
    pub pool_misses: u64,
}

struct PoolState {
    idle: VecDeque<Handle>,
    total: usize,
    stats: PoolStatsInner,
}

struct PoolShared {
    settings: PoolSettings,
    connect_timeout: std::time::Duration,
    connector: Arc<dyn MailConnector>,
    state: Mutex<PoolState>,
    permits: Arc<Semaphore>,
    closed: AtomicBool,
    connected: AtomicBool,
    fatal: watch::Sender<Option<String>>,
}

/// Bounded pool of adapter handles
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

/// Borrowed handle guard
///
/// Exposes the adapter for exactly one caller; returning happens on drop
/// with the recorded [`ReleaseOutcome`] (healthy unless marked otherwise).
pub struct PooledAdapter {
    shared: Arc<PoolShared>,
    handle: Option<Handle>,
    permit: Option<OwnedSemaphorePermit>,
    outcome: ReleaseOutcome,
}

impl std::fmt::Debug for PooledAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledAdapter")
            .field("outcome", &self.outcome)
            .finish()
    }
}

impl PooledAdapter {
    /// The adapter behind this handle
    pub fn adapter(&self) -> &dyn MailAdapter {
        self.handle
            .as_ref()
            .expect("handle is present until drop")
            .adapter
            .as_ref()
    }

    /// Record the outcome the drop-time release should act on
    pub fn mark(&mut self, outcome: ReleaseOutcome) {
        self.outcome = outcome;
    }
}

impl Drop for PooledAdapter {
    fn drop(&mut self) {
        let Some(mut handle) = self.handle.take() else {
            return;
        };
        let shared = self.shared.clone();
        let closed = shared.closed.load(Ordering::SeqCst);
        {
            let mut state = shared.state.lock().unwrap_or_else(|e| e.into_inner());
            state.stats.returned += 1;
            if closed || self.outcome != ReleaseOutcome::Healthy {
                state.total = state.total.saturating_sub(1);
                state.stats.retired += 1;
                debug!(handle = %handle.id, outcome = ?self.outcome, "pool handle retired");
            } else {
                handle.last_used = Instant::now();
                state.idle.push_back(handle);
            }
        }
        // Rebuild toward the minimum off the caller's path.
        if !closed && self.outcome != ReleaseOutcome::Healthy {
            if let Ok(rt) = tokio::runtime::Handle::try_current() {
                rt.spawn(async move { replenish(&shared).await });
            }
        }
        // Permit drops last, waking the next FIFO waiter.
        drop(self.permit.take());
    }
}

impl ConnectionPool {
    pub fn new(config: &ServerConfig, connector: Arc<dyn MailConnector>) -> Self {
        let settings = config.pool.clone();
        let (fatal, _) = watch::channel(None);
        Self {
            shared: Arc::new(PoolShared {
                permits: Arc::new(Semaphore::new(settings.max_connections)),
                settings,
                connect_timeout: config.outlook_connection_timeout,
                connector,
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    total: 0,
                    stats: PoolStatsInner::default(),
                }),
                closed: AtomicBool::new(false),
                connected: AtomicBool::new(false),
                fatal,
            }),
        }
    }

    /// Open the minimum number of handles at startup
    ///
    /// # Errors
    ///
    /// With `strict`, the first connect/probe failure aborts startup.
    /// Otherwise failures are logged and the maintenance pass keeps trying.
    pub async fn initialize(&self, strict: bool) -> ServerResult<()> {
        for n in 0..self.shared.settings.min_connections {
            match connect_new(&self.shared).await {
                Ok(handle) => {
                    let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
                    state.idle.push_back(handle);
                    state.total += 1;
                }
                Err(error) if strict => {
                    return Err(ServerError::Unavailable(format!(
                        "startup probe failed: {error}"
                    )));
                }
                Err(error) => {
                    warn!(%error, opened = n, "startup connection failed; continuing");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Borrow a handle, waiting FIFO up to `deadline`
    ///
    /// Returns an idle healthy handle when one exists, constructs a new one
    /// while under the size bound, and otherwise waits for a return.
    pub async fn acquire(&self, deadline: Instant) -> ServerResult<PooledAdapter> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(ServerError::Unavailable("connection pool is closed".to_owned()));
        }
        let permit = match timeout_at(deadline, self.shared.permits.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(ServerError::Unavailable(
                    "connection pool is closed".to_owned(),
                ));
            }
            Err(_) => {
                return Err(ServerError::Timeout {
                    operation: "pool.acquire".to_owned(),
                    timeout_ms: 0,
                });
            }
        };

        // Reuse the most recently returned handle; recycle anything past its
        // age bound on the way.
        loop {
            let popped = {
                let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
                state.idle.pop_back()
            };
            let Some(mut handle) = popped else { break };
            if handle.created_at.elapsed() > self.shared.settings.max_age {
                let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
                state.total = state.total.saturating_sub(1);
                state.stats.retired += 1;
                debug!(handle = %handle.id, "aged handle retired at acquire");
                continue;
            }
            handle.use_count += 1;
            handle.last_used = Instant::now();
            let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
            state.stats.borrowed += 1;
            state.stats.pool_hits += 1;
            return Ok(self.guard(handle, permit));
        }

        // No idle handle; the held permit guarantees room under the bound.
        {
            let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
            state.stats.pool_misses += 1;
        }
        match timeout_at(deadline, connect_new(&self.shared)).await {
            Ok(Ok(mut handle)) => {
                handle.use_count += 1;
                let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
                state.total += 1;
                state.stats.borrowed += 1;
                Ok(self.guard(handle, permit))
            }
            Ok(Err(error)) => Err(ServerError::Unavailable(format!(
                "cannot open outlook connection: {error}"
            ))),
            Err(_) => Err(ServerError::Timeout {
                operation: "pool.connect".to_owned(),
                timeout_ms: 0,
            }),
        }
    }

    fn guard(&self, handle: Handle, permit: OwnedSemaphorePermit) -> PooledAdapter {
        PooledAdapter {
            shared: self.shared.clone(),
            handle: Some(handle),
            permit: Some(permit),
            outcome: ReleaseOutcome::Healthy,
        }
    }

    /// One maintenance pass: retire idle/aged handles, probe survivors,
    /// top back up to the minimum
    pub async fn maintain(&self) {
        let shared = &self.shared;
        if shared.closed.load(Ordering::SeqCst) {
            return;
        }

        let candidates: Vec<Handle> = {
            let mut state = shared.state.lock().unwrap_or_else(|e| e.into_inner());
            state.idle.drain(..).collect()
        };
        let probed_any = !candidates.is_empty();

        let mut any_probe_ok = false;
        for handle in candidates {
            let (total, _) = self.sizes();
            let over_min = total > shared.settings.min_connections;
            let idle_for = handle.last_used.elapsed();
            let age = handle.created_at.elapsed();
            if age > shared.settings.max_age
                || (idle_for > shared.settings.max_idle && over_min)
            {
                self.retire(handle, "idle/age maintenance");
                continue;
            }
            match with_timeout("probe", shared.connect_timeout, handle.adapter.probe()).await {
                Ok(()) => {
                    any_probe_ok = true;
                    let mut state = shared.state.lock().unwrap_or_else(|e| e.into_inner());
                    state.idle.push_back(handle);
                }
                Err(error) => {
                    warn!(%error, "handle probe failed");
                    {
                        let mut state = shared.state.lock().unwrap_or_else(|e| e.into_inner());
                        state.stats.probe_failures += 1;
                    }
                    self.retire(handle, "probe failure");
                }
            }
        }

        // Connectivity is judged only on actual store contact: probes above,
        // or the connect attempts replenish makes on its own.
        if probed_any {
            shared.connected.store(any_probe_ok, Ordering::SeqCst);
        }
        let _ = replenish(shared).await;
    }

    fn retire(&self, handle: Handle, reason: &str) {
        let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
        state.total = state.total.saturating_sub(1);
        state.stats.retired += 1;
        debug!(handle = %handle.id, reason, "pool handle retired");
        // Handle drops here; the underlying resource closes before the slot
        // can be reused.
        drop(handle);
    }

    fn sizes(&self) -> (usize, usize) {
        let state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
        (state.total, state.idle.len())
    }

    /// Whether the store answered the most recent probe or connect
    pub fn outlook_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Receiver resolving to a reason string when the store is lost for good
    pub fn fatal_signal(&self) -> watch::Receiver<Option<String>> {
        self.shared.fatal.subscribe()
    }

    /// Close the pool: refuse new borrows and drop every idle handle
    ///
    /// Outstanding guards retire their handles on drop once the pool is
    /// closed, so no handle outlives shutdown.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.permits.close();
        let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
        let drained = state.idle.len();
        state.idle.clear();
        state.total = state.total.saturating_sub(drained);
        info!(drained, "connection pool closed");
    }

    /// Statistics snapshot
    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
        PoolStats {
            size: state.total,
            idle: state.idle.len(),
            in_use: state.total.saturating_sub(state.idle.len()),
            created: state.stats.created,
            retired: state.stats.retired,
            borrowed: state.stats.borrowed,
            returned: state.stats.returned,
            probe_failures: state.stats.probe_failures,
            pool_hits: state.stats.pool_hits,
            pool_misses: state.stats.pool_misses,
        }
    }
}

/// Open and probe one fresh handle
async fn connect_new(shared: &PoolShared) -> Result<Handle, AdapterError> {
    let adapter = with_timeout("connect", shared.connect_timeout, shared.connector.connect()).await?;
    with_timeout("probe", shared.connect_timeout, adapter.probe()).await?;
    shared.connected.store(true, Ordering::SeqCst);
    let mut state = shared.state.lock().unwrap_or_else(|e| e.into_inner());
    state.stats.created += 1;
    drop(state);
    let now = Instant::now();
    Ok(Handle {
        id: Uuid::new_v4(),
        adapter,
        created_at: now,
        last_used: now,
        use_count: 0,
    })
}

/// Rebuild idle handles up to the configured minimum
///
/// Returns whether at least one connect succeeded. A `Permanent` connect
/// failure raises the fatal signal: the store is gone and the process should
/// exit with the runtime-fatal code.
async fn replenish(shared: &Arc<PoolShared>) -> bool {
    let mut connected = false;
    loop {
        if shared.closed.load(Ordering::SeqCst) {
            return connected;
        }
        {
            let state = shared.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.total >= shared.settings.min_connections {
                return connected;
            }
        }
        match connect_new(shared).await {
            Ok(handle) => {
                connected = true;
                let mut state = shared.state.lock().unwrap_or_else(|e| e.into_inner());
                state.idle.push_back(handle);
                state.total += 1;
            }
            Err(AdapterError::Permanent(message)) => {
                warn!(%message, "store reported a permanent failure during reconnect");
                let _ = shared.fatal.send(Some(message));
                return connected;
            }
            Err(error) => {
                debug!(%error, "reconnect attempt failed; retrying next maintenance pass");
                shared.connected.store(false, Ordering::SeqCst);
                return connected;
            }
        }
    }
}
