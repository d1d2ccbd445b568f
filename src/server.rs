//! Server core: lifecycle, admission, health, shutdown
//!
//! Owns every shared resource (pool, rate limiter, cache, concurrency gate)
//! behind one explicit context that transports and tests construct at
//! startup. Requests are admitted through the concurrency semaphore and the
//! rate limiter, dispatched through the router, and isolated in their own
//! task so an escaped panic maps to `internal_error` instead of taking the
//! transport down.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout_at, Duration, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::adapter::MailConnector;
use crate::cache::{CacheStats, EmailCache};
use crate::config::ServerConfig;
use crate::errors::{ServerError, ServerResult};
use crate::handlers::{handle_method, log_handler_failure, validate_send};
use crate::models::{InitializeParams, InitializeResult, ServerCapabilities};
use crate::pool::{ConnectionPool, PoolStats};
use crate::protocol::{error_response, parse_value, success_response, RpcRequest, Session};
use crate::rate_limit::{RateLimiter, RateLimiterStats};
use crate::router::{decode_params, method_capabilities, note_unknown_fields, Method, RequestContext};

/// Advertised server identity
pub const SERVER_NAME: &str = env!("CARGO_PKG_NAME");
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// How long an admitted request may wait for a concurrency slot before the
/// server reports overload
const QUEUE_DEADLINE: Duration = Duration::from_millis(500);

/// Cadence of the drain-completion check during shutdown
const DRAIN_POLL: Duration = Duration::from_millis(50);

/// Workers available to background prefetch
const PREFETCH_WORKERS: usize = 2;

/// Process lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Initializing,
    Running,
    Draining,
    Stopped,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }
}

/// Health probe payload
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub state: &'static str,
    pub outlook_connected: bool,
    pub pool_stats: PoolStats,
    pub cache_stats: CacheStats,
    pub rate_stats: RateLimiterStats,
    pub uptime_seconds: u64,
}

/// Explicit server context
///
/// Constructed once at startup and passed (as `Arc`) through transports and
/// handlers; tests construct one with fake connectors.
pub struct ServerContext {
    pub config: Arc<ServerConfig>,
    pub pool: Arc<ConnectionPool>,
    pub limiter: Arc<RateLimiter>,
    pub cache: Arc<EmailCache>,
    /// Bounded worker budget for background prefetch
    pub prefetch_permits: Arc<Semaphore>,
    inflight_permits: Arc<Semaphore>,
    lifecycle: watch::Sender<LifecycleState>,
    started_at: Instant,
    started_at_utc: DateTime<Utc>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ServerContext {
    /// Construct the full resource stack and move to `running`
    ///
    /// Opens the pool's minimum connections; with `strict_startup`, a failed
    /// first probe aborts startup (exit code 1 territory). Background
    /// maintenance (pool probing, cache sweeping) is spawned here and joined
    /// at shutdown.
    pub async fn build(
        config: ServerConfig,
        connector: Arc<dyn MailConnector>,
    ) -> ServerResult<Arc<Self>> {
        config.validate()?;
        let config = Arc::new(config);
        let pool = Arc::new(ConnectionPool::new(&config, connector));
        let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        let cache = Arc::new(EmailCache::new(config.cache.max_bytes));
        let (lifecycle, _) = watch::channel(LifecycleState::Initializing);

        pool.initialize(config.strict_startup).await?;

        let ctx = Arc::new(Self {
            inflight_permits: Arc::new(Semaphore::new(config.max_concurrent_requests)),
            prefetch_permits: Arc::new(Semaphore::new(PREFETCH_WORKERS)),
            pool,
            limiter,
            cache,
            lifecycle,
            started_at: Instant::now(),
            started_at_utc: Utc::now(),
            tasks: Mutex::new(Vec::new()),
            config,
        });

        ctx.spawn_maintenance();
        ctx.transition(LifecycleState::Running);
        Ok(ctx)
    }

    fn spawn_maintenance(self: &Arc<Self>) {
        let pool_ctx = self.clone();
        let pool_task = tokio::spawn(async move {
            let mut ticker = interval(pool_ctx.config.pool.probe_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if pool_ctx.is_draining() {
                    break;
                }
                pool_ctx.pool.maintain().await;
            }
        });

        let cache_ctx = self.clone();
        let cache_task = tokio::spawn(async move {
            let mut ticker = interval(cache_ctx.config.cache.cleanup_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if cache_ctx.is_draining() {
                    break;
                }
                cache_ctx.cache.sweep();
            }
        });

        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.push(pool_task);
        tasks.push(cache_task);
    }

    fn transition(&self, state: LifecycleState) {
        let previous = *self.lifecycle.borrow();
        if previous != state {
            info!(from = previous.as_str(), to = state.as_str(), "lifecycle transition");
            self.lifecycle.send_replace(state);
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.lifecycle.borrow()
    }

    pub fn is_draining(&self) -> bool {
        !matches!(self.state(), LifecycleState::Running)
    }

    /// Watch lifecycle transitions (transports stop accepting on draining)
    pub fn lifecycle_watch(&self) -> watch::Receiver<LifecycleState> {
        self.lifecycle.subscribe()
    }

    /// Handle one already-parsed JSON value (HTTP transport and tests)
    pub async fn handle_json(
        self: &Arc<Self>,
        session: &Arc<Session>,
        value: Value,
        caller: Option<String>,
    ) -> Option<Value> {
        match parse_value(value) {
            Ok(request) => self.handle_request(session, request, caller).await,
            Err(err) => Some(error_response(None, &err)),
        }
    }

    /// Full request pipeline: admission, dispatch, response assembly
    ///
    /// Exactly one response is produced per request carrying an id; requests
    /// without an id are notifications and produce none.
    pub async fn handle_request(
        self: &Arc<Self>,
        session: &Arc<Session>,
        request: RpcRequest,
        caller: Option<String>,
    ) -> Option<Value> {
        let started = Instant::now();
        let method_name = request.method.clone();
        let request_id = request.id.clone();
        debug!(method = %method_name, id = ?request_id, "request received");

        let rc = RequestContext {
            request_id: request_id.clone(),
            deadline: started + self.config.request_timeout,
            caller,
        };

        let method = Method::from_name(&request.method);
        if request.is_notification() {
            match method {
                Some(m) if m.has_side_effects() => {
                    let outcome = self.process(session, &rc, m, request.params).await;
                    if let Err(error) = outcome {
                        log_handler_failure(&method_name, &error);
                    }
                }
                _ => {
                    debug!(method = %method_name, "notification dropped");
                }
            }
            return None;
        }

        let outcome = match method {
            Some(m) => self.process(session, &rc, m, request.params).await,
            None => Err(ServerError::MethodNotFound(method_name.clone())),
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        let id = request_id.as_ref()?;
        match outcome {
            Ok(result) => {
                debug!(method = %method_name, duration_ms, outcome = "ok", "request completed");
                Some(success_response(id, result))
            }
            Err(error) => {
                log_handler_failure(&method_name, &error);
                debug!(
                    method = %method_name,
                    duration_ms,
                    outcome = "error",
                    code = error.code(),
                    "request completed"
                );
                Some(error_response(Some(id), &error))
            }
        }
    }

    async fn process(
        self: &Arc<Self>,
        session: &Arc<Session>,
        rc: &RequestContext,
        method: Method,
        params: Value,
    ) -> ServerResult<Value> {
        match method {
            Method::Initialize => return self.handle_initialize(session, params),
            Method::Shutdown => {
                session.begin_close();
                return Ok(json!({}));
            }
            _ => {}
        }

        session.require_ready()?;
        if self.is_draining() {
            return Err(ServerError::Overloaded("server is draining".to_owned()));
        }

        // send_email validates its recipients and attachment paths ahead of
        // admission; an invalid send consumes neither a concurrency slot nor
        // a rate-limit token.
        if method == Method::SendEmail {
            validate_send(&params).await?;
        }

        // Admission: concurrency gate with a short queue deadline, then the
        // rate limiter under the full request deadline.
        let queue_deadline = rc.deadline.min(Instant::now() + QUEUE_DEADLINE);
        let _permit =
            match timeout_at(queue_deadline, self.inflight_permits.clone().acquire_owned()).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => {
                    return Err(ServerError::Overloaded("server is stopping".to_owned()));
                }
                Err(_) => {
                    debug!(method = method.name(), "admission queue deadline exceeded");
                    return Err(ServerError::Overloaded(
                        "concurrent request limit reached".to_owned(),
                    ));
                }
            };
        self.limiter.admit(rc.deadline, rc.caller.as_deref()).await?;

        // Run the handler in its own task so an escaped panic becomes an
        // internal_error response instead of tearing down the transport.
        let ctx = self.clone();
        let task_rc = rc.clone();
        let handle = tokio::spawn(async move { handle_method(&ctx, &task_rc, method, params).await });
        match handle.await {
            Ok(result) => result,
            Err(join_error) => {
                error!(method = method.name(), %join_error, "request handler aborted");
                Err(ServerError::Internal(
                    "request handler failed unexpectedly".to_owned(),
                ))
            }
        }
    }

    fn handle_initialize(&self, session: &Arc<Session>, params: Value) -> ServerResult<Value> {
        let params: InitializeParams = decode_params("initialize", params)?;
        note_unknown_fields("initialize", &params.unknown);
        session.begin_initialize(&params.client_name, &params.client_version, params.capabilities)?;
        info!(peer = %params.client_name, version = %params.client_version, "session handshake");

        let result = InitializeResult {
            server_name: SERVER_NAME.to_owned(),
            server_version: SERVER_VERSION.to_owned(),
            capabilities: ServerCapabilities {
                methods: method_capabilities(),
            },
        };
        let value = serde_json::to_value(result)?;
        // The response is assembled; the session is usable from here on.
        session.mark_ready();
        Ok(value)
    }

    /// Health probe data
    pub fn health(&self) -> HealthReport {
        HealthReport {
            state: self.state().as_str(),
            outlook_connected: self.pool.outlook_connected(),
            pool_stats: self.pool.stats(),
            cache_stats: self.cache.stats(),
            rate_stats: self.limiter.stats(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }

    /// Coarse health classification for the HTTP endpoint
    pub fn health_status(&self) -> &'static str {
        match (self.state(), self.pool.outlook_connected()) {
            (LifecycleState::Running, true) => "healthy",
            (LifecycleState::Running, false) => "degraded",
            _ => "unhealthy",
        }
    }

    pub fn started_at_utc(&self) -> DateTime<Utc> {
        self.started_at_utc
    }

    /// Drain and stop
    ///
    /// Transports observe `draining` and stop accepting new sessions;
    /// outstanding requests get `shutdown_grace` to finish. Then the cache
    /// is flushed, the pool closed (every handle released), and background
    /// tasks joined.
    pub async fn shutdown(&self) {
        if matches!(self.state(), LifecycleState::Draining | LifecycleState::Stopped) {
            return;
        }
        self.transition(LifecycleState::Draining);

        let grace_deadline = Instant::now() + self.config.shutdown_grace;
        loop {
            let outstanding = self
                .config
                .max_concurrent_requests
                .saturating_sub(self.inflight_permits.available_permits());
            if outstanding == 0 {
                break;
            }
            if Instant::now() >= grace_deadline {
                warn!(outstanding, "shutdown grace elapsed with requests outstanding");
                break;
            }
            sleep(DRAIN_POLL).await;
        }

        self.cache.clear();
        self.pool.close();
        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.drain(..).collect()
        };
        for task in tasks {
            task.abort();
        }
        self.transition(LifecycleState::Stopped);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::json;

    use super::{LifecycleState, ServerContext};
    use crate::adapter::{AdapterResult, MailAdapter, MailConnector};
    use crate::config::ServerConfig;
    use crate::models::{EmailFull, EmailSummary, Folder, FolderType, OutgoingEmail};
    use crate::protocol::Session;

    struct StubAdapter;

    #[async_trait]
    impl MailAdapter for StubAdapter {
        async fn probe(&self) -> AdapterResult<()> {
            Ok(())
        }
        async fn list_folders(&self) -> AdapterResult<Vec<Folder>> {
            Ok(vec![Folder {
                id: "inbox-1".to_owned(),
                name: "Inbox".to_owned(),
                full_path: "/Inbox".to_owned(),
                parent_id: None,
                item_count: 0,
                unread_count: 0,
                folder_type: FolderType::Mail,
                accessible: true,
                has_subfolders: false,
            }])
        }
        async fn resolve_inbox(&self) -> AdapterResult<String> {
            Ok("inbox-1".to_owned())
        }
        async fn list_emails(
            &self,
            _folder_id: &str,
            _unread_only: bool,
            _limit: usize,
        ) -> AdapterResult<Vec<EmailSummary>> {
            Ok(Vec::new())
        }
        async fn get_email(&self, email_id: &str) -> AdapterResult<EmailFull> {
            Err(crate::adapter::AdapterError::NotFound(email_id.to_owned()))
        }
        async fn search(
            &self,
            _query: &str,
            _folder_id: Option<&str>,
            _limit: usize,
        ) -> AdapterResult<Vec<EmailSummary>> {
            Ok(Vec::new())
        }
        async fn send(&self, _outgoing: &OutgoingEmail) -> AdapterResult<String> {
            Ok("sent-1".to_owned())
        }
    }

    struct StubConnector;

    #[async_trait]
    impl MailConnector for StubConnector {
        async fn connect(&self) -> AdapterResult<Box<dyn MailAdapter>> {
            Ok(Box::new(StubAdapter))
        }
    }

    async fn test_context() -> Arc<ServerContext> {
        let mut config = ServerConfig::default();
        config.pool.min_connections = 0;
        ServerContext::build(config, Arc::new(StubConnector))
            .await
            .expect("context must build")
    }

    #[tokio::test]
    async fn responses_echo_the_request_id_exactly() {
        let ctx = test_context().await;
        let session = Arc::new(Session::pre_initialized("test"));
        let response = ctx
            .handle_json(
                &session,
                json!({ "jsonrpc": "2.0", "id": 42, "method": "get_folders", "params": {} }),
                None,
            )
            .await
            .expect("call with id gets a response");
        assert_eq!(response["id"], 42);
        assert!(response["result"]["folders"].is_array());
    }

    #[tokio::test]
    async fn notifications_produce_no_response() {
        let ctx = test_context().await;
        let session = Arc::new(Session::pre_initialized("test"));
        let response = ctx
            .handle_json(
                &session,
                json!({ "jsonrpc": "2.0", "method": "get_folders", "params": {} }),
                None,
            )
            .await;
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn unknown_methods_map_to_method_not_found() {
        let ctx = test_context().await;
        let session = Arc::new(Session::pre_initialized("test"));
        let response = ctx
            .handle_json(
                &session,
                json!({ "jsonrpc": "2.0", "id": 1, "method": "delete_everything", "params": {} }),
                None,
            )
            .await
            .expect("error response expected");
        assert_eq!(response["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn shutdown_reaches_stopped_state() {
        let ctx = test_context().await;
        assert_eq!(ctx.state(), LifecycleState::Running);
        ctx.shutdown().await;
        assert_eq!(ctx.state(), LifecycleState::Stopped);
        assert_eq!(ctx.health().state, "stopped");
    }

    #[tokio::test]
    async fn health_reports_running_and_connected() {
        let ctx = test_context().await;
        let session = Arc::new(Session::pre_initialized("test"));
        // Force one pool use so connectivity is observed.
        let _ = ctx
            .handle_json(
                &session,
                json!({ "jsonrpc": "2.0", "id": 1, "method": "get_folders", "params": {} }),
                None,
            )
            .await;
        let report = ctx.health();
        assert_eq!(report.state, "running");
        assert!(report.outlook_connected);
        assert_eq!(ctx.health_status(), "healthy");
    }
}
