//! End-to-end tests over the full server context
//!
//! Drives the request pipeline (protocol, admission, router, handlers,
//! pool, cache) against the in-memory mail store, with paused-clock timing
//! where deadlines matter.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use mail_outlook_mcp_rs::config::ServerConfig;
use mail_outlook_mcp_rs::memory::{CallCounters, InMemoryConnector, InMemoryMailStore};
use mail_outlook_mcp_rs::protocol::Session;
use mail_outlook_mcp_rs::server::ServerContext;

async fn build_ctx(
    config: ServerConfig,
    store: InMemoryMailStore,
) -> (Arc<ServerContext>, Arc<CallCounters>) {
    let counters = store.counters();
    let ctx = ServerContext::build(config, Arc::new(InMemoryConnector::new(store)))
        .await
        .expect("server context must build");
    (ctx, counters)
}

fn ready_session() -> Arc<Session> {
    Arc::new(Session::pre_initialized("test-client"))
}

async fn call(
    ctx: &Arc<ServerContext>,
    session: &Arc<Session>,
    id: Value,
    method: &str,
    params: Value,
) -> Option<Value> {
    ctx.handle_json(
        session,
        json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params }),
        None,
    )
    .await
}

#[tokio::test]
async fn handshake_then_folders() {
    let (ctx, _) = build_ctx(ServerConfig::default(), InMemoryMailStore::with_sample_data()).await;
    let session = Arc::new(Session::new());

    let response = call(
        &ctx,
        &session,
        json!("1"),
        "initialize",
        json!({ "client_name": "t", "client_version": "0" }),
    )
    .await
    .expect("handshake response");
    assert_eq!(response["id"], "1");
    let server_name = response["result"]["server_name"]
        .as_str()
        .expect("server_name is a string");
    assert!(!server_name.is_empty());
    assert!(response["result"]["capabilities"]["methods"].is_array());

    let response = call(&ctx, &session, json!("2"), "get_folders", json!({}))
        .await
        .expect("folders response");
    assert_eq!(response["id"], "2");
    let folders = response["result"]["folders"]
        .as_array()
        .expect("folders is an array");
    assert!(!folders.is_empty());
    assert!(folders.iter().any(|f| f["folder_type"] == "Mail"));
}

#[tokio::test]
async fn pre_handshake_calls_are_rejected() {
    let (ctx, counters) =
        build_ctx(ServerConfig::default(), InMemoryMailStore::with_sample_data()).await;
    let session = Arc::new(Session::new());

    let response = call(&ctx, &session, json!("x"), "get_folders", json!({}))
        .await
        .expect("error response");
    assert_eq!(response["id"], "x");
    assert_eq!(response["error"]["code"], -32000);
    assert_eq!(response["error"]["data"]["type"], "SessionError");
    assert_eq!(
        counters
            .list_folders
            .load(std::sync::atomic::Ordering::SeqCst),
        0
    );
}

#[tokio::test(start_paused = true)]
async fn rate_limit_denies_with_retry_after() {
    let mut config = ServerConfig::default();
    config.rate_limit.rps = 2.0;
    config.rate_limit.burst = 2;
    config.request_timeout = Duration::from_millis(100);
    let (ctx, _) = build_ctx(config, InMemoryMailStore::with_sample_data()).await;
    let session = ready_session();

    let mut successes = 0;
    let mut denials = 0;
    for n in 0..5 {
        let response = call(&ctx, &session, json!(n), "get_folders", json!({}))
            .await
            .expect("each call with an id gets exactly one response");
        assert_eq!(response["id"], n);
        if response.get("result").is_some() {
            successes += 1;
        } else {
            assert_eq!(response["error"]["code"], -32007);
            let retry_after = response["error"]["data"]["retry_after"]
                .as_u64()
                .expect("retry_after is present");
            assert!(retry_after > 0);
            denials += 1;
        }
    }
    assert_eq!(successes, 2);
    assert_eq!(denials, 3);
}

#[tokio::test]
async fn repeated_listing_hits_the_cache() {
    let (ctx, counters) =
        build_ctx(ServerConfig::default(), InMemoryMailStore::with_sample_data()).await;
    let session = ready_session();

    let params = json!({ "folder_id": "folder-inbox", "unread_only": false, "limit": 10 });
    let first = call(&ctx, &session, json!(1), "list_emails", params.clone())
        .await
        .expect("first listing");
    let second = call(&ctx, &session, json!(2), "list_emails", params)
        .await
        .expect("second listing");

    assert_eq!(
        counters
            .list_emails
            .load(std::sync::atomic::Ordering::SeqCst),
        1
    );
    // Identical params within one TTL return identical results.
    assert_eq!(first["result"], second["result"]);
    assert_eq!(first["result"]["total_count"], 3);
}

#[tokio::test(start_paused = true)]
async fn pool_exhaustion_times_out_waiters_and_recovers() {
    let mut config = ServerConfig::default();
    config.pool.min_connections = 1;
    config.pool.max_connections = 1;
    config.request_timeout = Duration::from_millis(120);
    let store = InMemoryMailStore::with_sample_data().with_latency(Duration::from_millis(80));
    let (ctx, _) = build_ctx(config, store).await;
    let session = ready_session();

    let mut tasks = Vec::new();
    for n in 0..3 {
        let ctx = ctx.clone();
        let session = session.clone();
        tasks.push(tokio::spawn(async move {
            // Distinct ids so the lookups cannot coalesce in the cache's
            // single-flight layer; contention lands on the pool.
            call(
                &ctx,
                &session,
                json!(n),
                "get_email",
                json!({ "email_id": format!("msg-{}", n + 1) }),
            )
            .await
            .expect("response")
        }));
    }

    let mut successes = 0;
    let mut timeouts = 0;
    for task in tasks {
        let response = task.await.expect("task joins");
        if response.get("result").is_some() {
            successes += 1;
        } else {
            assert_eq!(response["error"]["code"], -32006);
            assert_eq!(response["error"]["data"]["type"], "TimeoutError");
            timeouts += 1;
        }
    }
    assert_eq!(successes, 1);
    assert_eq!(timeouts, 2);

    // The retired handle is rebuilt toward the minimum; the pool ends at
    // size 1 and healthy.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let stats = ctx.pool.stats();
    assert_eq!(stats.size, 1);
    let response = call(
        &ctx,
        &session,
        json!("after"),
        "get_email",
        json!({ "email_id": "msg-2" }),
    )
    .await
    .expect("pool recovered");
    assert!(response.get("result").is_some());
}

#[tokio::test]
async fn send_validation_rejects_bad_addresses_before_the_store() {
    // A single-token budget makes any pre-admission leak visible below.
    let mut config = ServerConfig::default();
    config.rate_limit.rps = 0.001;
    config.rate_limit.burst = 1;
    config.request_timeout = Duration::from_millis(200);
    let (ctx, counters) = build_ctx(config, InMemoryMailStore::with_sample_data()).await;
    let session = ready_session();

    let response = call(
        &ctx,
        &session,
        json!(1),
        "send_email",
        json!({ "to": ["not-an-email"], "subject": "s", "body": "b" }),
    )
    .await
    .expect("validation error response");
    assert_eq!(response["error"]["code"], -32602);
    assert_eq!(response["error"]["data"]["type"], "ValidationError");
    assert_eq!(counters.send.load(std::sync::atomic::Ordering::SeqCst), 0);

    // The invalid send was refused before admission, so the one available
    // token is still there for the next request.
    let response = call(&ctx, &session, json!(2), "get_folders", json!({}))
        .await
        .expect("follow-up response");
    assert!(
        response.get("result").is_some(),
        "rate-limit token must not have been consumed: {response}"
    );
}

#[tokio::test]
async fn boundary_parameters_map_to_invalid_params() {
    let (ctx, _) = build_ctx(ServerConfig::default(), InMemoryMailStore::with_sample_data()).await;
    let session = ready_session();

    for (method, params) in [
        (
            "list_emails",
            json!({ "folder_id": "folder-inbox", "limit": 0 }),
        ),
        (
            "list_emails",
            json!({ "folder_id": "folder-inbox", "limit": 1001 }),
        ),
        ("get_email", json!({ "email_id": "" })),
        ("search_emails", json!({ "query": "" })),
        (
            "send_email",
            json!({ "to": [], "cc": [], "bcc": [], "subject": "s", "body": "b" }),
        ),
    ] {
        let response = call(&ctx, &session, json!(1), method, params)
            .await
            .expect("error response");
        assert_eq!(
            response["error"]["code"], -32602,
            "method {method} must reject with invalid_params"
        );
    }
}

#[tokio::test]
async fn unavailable_store_maps_to_connection_error_and_recovers() {
    let mut config = ServerConfig::default();
    config.pool.min_connections = 1;
    let store = InMemoryMailStore::with_sample_data();
    let offline_switch = store.clone();
    let (ctx, _) = build_ctx(config, store).await;
    let session = ready_session();

    offline_switch.set_offline(true);
    let response = call(&ctx, &session, json!(1), "get_folders", json!({}))
        .await
        .expect("error response");
    assert_eq!(response["error"]["code"], -32001);
    assert_eq!(response["error"]["data"]["type"], "OutlookConnectionError");

    offline_switch.set_offline(false);
    ctx.pool.maintain().await;
    let response = call(&ctx, &session, json!(2), "get_folders", json!({}))
        .await
        .expect("recovered response");
    assert!(
        response.get("result").is_some(),
        "store back online must serve again: {response}"
    );
}

#[tokio::test]
async fn listing_ids_resolve_to_matching_full_emails() {
    let (ctx, _) = build_ctx(ServerConfig::default(), InMemoryMailStore::with_sample_data()).await;
    let session = ready_session();

    let folders = call(&ctx, &session, json!(1), "get_folders", json!({}))
        .await
        .expect("folders");
    let inbox_id = folders["result"]["folders"]
        .as_array()
        .and_then(|fs| fs.iter().find(|f| f["name"] == "Inbox"))
        .and_then(|f| f["id"].as_str())
        .expect("inbox folder present")
        .to_owned();

    let listing = call(
        &ctx,
        &session,
        json!(2),
        "list_emails",
        json!({ "folder_id": inbox_id, "limit": 10 }),
    )
    .await
    .expect("listing");
    let first = &listing["result"]["emails"][0];
    let email_id = first["id"].as_str().expect("email id").to_owned();

    let detail = call(
        &ctx,
        &session,
        json!(3),
        "get_email",
        json!({ "email_id": email_id }),
    )
    .await
    .expect("detail");
    let email = &detail["result"]["email"];
    assert_eq!(email["subject"], first["subject"]);
    assert_eq!(email["sender_email"], first["sender_email"]);
    assert_eq!(email["received_time"], first["received_time"]);
}

#[tokio::test]
async fn inbox_listing_delegates_to_the_default_inbox() {
    let (ctx, _) = build_ctx(ServerConfig::default(), InMemoryMailStore::with_sample_data()).await;
    let session = ready_session();

    let response = call(
        &ctx,
        &session,
        json!(1),
        "list_inbox_emails",
        json!({ "unread_only": true, "limit": 5 }),
    )
    .await
    .expect("inbox listing");
    assert_eq!(response["result"]["folder"], "folder-inbox");
    let emails = response["result"]["emails"]
        .as_array()
        .expect("emails array");
    assert!(emails.iter().all(|e| e["is_read"] == false));
}

#[tokio::test]
async fn search_returns_empty_success_for_no_matches() {
    let (ctx, _) = build_ctx(ServerConfig::default(), InMemoryMailStore::with_sample_data()).await;
    let session = ready_session();

    let response = call(
        &ctx,
        &session,
        json!(1),
        "search_emails",
        json!({ "query": "nothing matches this" }),
    )
    .await
    .expect("search response");
    assert_eq!(response["result"]["total_count"], 0);
    assert_eq!(response["result"]["emails"], json!([]));
    assert_eq!(response["result"]["query"], "nothing matches this");
}

#[tokio::test]
async fn send_email_notification_still_executes() {
    let (ctx, counters) =
        build_ctx(ServerConfig::default(), InMemoryMailStore::with_sample_data()).await;
    let session = ready_session();

    let response = ctx
        .handle_json(
            &session,
            json!({
                "jsonrpc": "2.0",
                "method": "send_email",
                "params": { "to": ["a@example.com"], "subject": "s", "body": "b" }
            }),
            None,
        )
        .await;
    assert!(response.is_none(), "notifications never get a response");
    assert_eq!(counters.send.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn read_notifications_are_dropped_without_store_access() {
    let (ctx, counters) =
        build_ctx(ServerConfig::default(), InMemoryMailStore::with_sample_data()).await;
    let session = ready_session();

    let response = ctx
        .handle_json(
            &session,
            json!({ "jsonrpc": "2.0", "method": "get_folders", "params": {} }),
            None,
        )
        .await;
    assert!(response.is_none());
    assert_eq!(
        counters
            .list_folders
            .load(std::sync::atomic::Ordering::SeqCst),
        0
    );
}

#[tokio::test]
async fn send_invalidates_sent_items_listings() {
    let (ctx, counters) =
        build_ctx(ServerConfig::default(), InMemoryMailStore::with_sample_data()).await;
    let session = ready_session();

    // Prime the folder list and the Sent Items listing cache.
    call(&ctx, &session, json!(1), "get_folders", json!({}))
        .await
        .expect("folders");
    call(
        &ctx,
        &session,
        json!(2),
        "list_emails",
        json!({ "folder_id": "folder-sent", "limit": 10 }),
    )
    .await
    .expect("sent listing");
    assert_eq!(
        counters
            .list_emails
            .load(std::sync::atomic::Ordering::SeqCst),
        1
    );

    let response = call(
        &ctx,
        &session,
        json!(3),
        "send_email",
        json!({ "to": ["a@example.com"], "subject": "s", "body": "b" }),
    )
    .await
    .expect("send response");
    assert_eq!(response["result"]["status"], "sent");

    // The listing is re-fetched after the send invalidated it.
    let listing = call(
        &ctx,
        &session,
        json!(4),
        "list_emails",
        json!({ "folder_id": "folder-sent", "limit": 10 }),
    )
    .await
    .expect("sent listing after send");
    assert_eq!(
        counters
            .list_emails
            .load(std::sync::atomic::Ordering::SeqCst),
        2
    );
    assert_eq!(listing["result"]["total_count"], 1);
}

#[tokio::test]
async fn blocked_folders_fail_with_permission_error() {
    let mut config = ServerConfig::default();
    config.security.blocked_folders = vec!["Drafts".to_owned()];
    let (ctx, _) = build_ctx(config, InMemoryMailStore::with_sample_data()).await;
    let session = ready_session();

    // Prime the folder list so the policy can match by display name.
    call(&ctx, &session, json!(1), "get_folders", json!({}))
        .await
        .expect("folders");

    let response = call(
        &ctx,
        &session,
        json!(2),
        "list_emails",
        json!({ "folder_id": "folder-drafts", "limit": 10 }),
    )
    .await
    .expect("policy rejection");
    assert_eq!(response["error"]["code"], -32004);
    assert_eq!(response["error"]["data"]["type"], "PermissionError");
}

#[tokio::test]
async fn prefetch_warms_the_full_email_cache() {
    let mut config = ServerConfig::default();
    config.cache.prefetch_count = 2;
    let (ctx, counters) = build_ctx(config, InMemoryMailStore::with_sample_data()).await;
    let session = ready_session();

    call(
        &ctx,
        &session,
        json!(1),
        "list_inbox_emails",
        json!({ "limit": 10 }),
    )
    .await
    .expect("listing");

    // Prefetch runs in background workers; poll briefly for completion.
    let mut warmed = 0;
    for _ in 0..50 {
        warmed = counters.get_email.load(std::sync::atomic::Ordering::SeqCst);
        if warmed >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(warmed, 2);

    // The drilled-in email is served from cache, no further store call.
    call(
        &ctx,
        &session,
        json!(2),
        "get_email",
        json!({ "email_id": "msg-1" }),
    )
    .await
    .expect("detail");
    assert_eq!(
        counters.get_email.load(std::sync::atomic::Ordering::SeqCst),
        2
    );
}

#[tokio::test]
async fn batch_frames_are_rejected() {
    let (ctx, _) = build_ctx(ServerConfig::default(), InMemoryMailStore::with_sample_data()).await;
    let session = ready_session();

    let response = ctx
        .handle_json(
            &session,
            json!([{ "jsonrpc": "2.0", "id": 1, "method": "get_folders", "params": {} }]),
            None,
        )
        .await
        .expect("batch rejection");
    assert_eq!(response["error"]["code"], -32600);
}

#[tokio::test]
async fn shutdown_method_closes_the_session() {
    let (ctx, _) = build_ctx(ServerConfig::default(), InMemoryMailStore::with_sample_data()).await;
    let session = Arc::new(Session::new());

    call(
        &ctx,
        &session,
        json!(1),
        "initialize",
        json!({ "client_name": "t", "client_version": "0" }),
    )
    .await
    .expect("handshake");

    let response = call(&ctx, &session, json!(2), "shutdown", json!({}))
        .await
        .expect("shutdown response");
    assert!(response.get("result").is_some());
    assert!(session.is_closing());

    let after = call(&ctx, &session, json!(3), "get_folders", json!({}))
        .await
        .expect("post-shutdown call fails");
    assert!(after.get("error").is_some());
}
