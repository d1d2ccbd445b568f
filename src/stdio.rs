//! Line transport over stdin/stdout
//!
//! One JSON object per `\n`-terminated UTF-8 line in each direction.
//! Responses are written in completion order, not request order. Session
//! control (`initialize`, `shutdown`) is processed in arrival order so the
//! handshake gate is deterministic; mailbox calls overlap freely. Logging
//! goes to stderr, stdout belongs to the protocol.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::protocol::{encode_frame, error_response, parse_frame, Session};
use crate::router::Method;
use crate::server::{LifecycleState, ServerContext};

/// Buffered responses awaiting the single stdout writer
const WRITE_QUEUE: usize = 64;

/// Serve one session over stdin/stdout until EOF, `shutdown`, or drain
pub async fn serve(ctx: Arc<ServerContext>) -> std::io::Result<()> {
    let session = Arc::new(Session::new());
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    let (tx, mut rx) = mpsc::channel::<String>(WRITE_QUEUE);
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = rx.recv().await {
            if stdout.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if stdout.write_all(b"\n").await.is_err() {
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    let mut lifecycle = ctx.lifecycle_watch();
    info!("line transport ready");

    loop {
        tokio::select! {
            changed = lifecycle.changed() => {
                let draining = changed.is_err()
                    || !matches!(*lifecycle.borrow(), LifecycleState::Running);
                if draining {
                    debug!("line transport stops accepting: server draining");
                    break;
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    debug!("line transport reached EOF");
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                dispatch_line(&ctx, &session, &tx, line).await;
                if session.is_closing() {
                    break;
                }
            }
        }
    }

    drop(tx);
    let _ = writer.await;
    session.mark_closed();
    Ok(())
}

/// Parse and route one inbound line
///
/// Session-control frames and the pre-handshake gate run inline (arrival
/// order); everything else is spawned so slow operations do not serialize
/// the session.
async fn dispatch_line(
    ctx: &Arc<ServerContext>,
    session: &Arc<Session>,
    tx: &mpsc::Sender<String>,
    line: String,
) {
    let request = match parse_frame(&line) {
        Ok(request) => request,
        Err(err) => {
            let _ = tx.send(encode_frame(&error_response(None, &err))).await;
            return;
        }
    };

    let is_session_control = matches!(
        Method::from_name(&request.method),
        Some(Method::Initialize | Method::Shutdown)
    );

    if is_session_control {
        if let Some(response) = ctx.handle_request(session, request, None).await {
            let _ = tx.send(encode_frame(&response)).await;
        }
        return;
    }

    // The handshake gate is checked here, in arrival order, before the
    // request escapes into its own task.
    if let Err(err) = session.require_ready() {
        if let Some(id) = request.id.as_ref() {
            let _ = tx
                .send(encode_frame(&error_response(Some(id), &err)))
                .await;
        } else {
            debug!(method = %request.method, "pre-handshake notification dropped");
        }
        return;
    }

    let ctx = ctx.clone();
    let session = session.clone();
    let tx = tx.clone();
    tokio::spawn(async move {
        if let Some(response) = ctx.handle_request(&session, request, None).await {
            let _ = tx.send(encode_frame(&response)).await;
        }
    });
}
