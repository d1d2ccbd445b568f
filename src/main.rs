//! Process entry point
//!
//! Loads environment configuration, builds the server context, and runs
//! both transports (line protocol on stdio, JSON-RPC over HTTP) until a
//! signal, stdio EOF, or a fatal store loss. Exit codes: 0 clean, 1 startup
//! failure, 2 runtime fatal.

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use mail_outlook_mcp_rs::adapter::MailConnector;
use mail_outlook_mcp_rs::config::{documented_env_keys, ServerConfig};
use mail_outlook_mcp_rs::memory::{InMemoryConnector, InMemoryMailStore};
use mail_outlook_mcp_rs::server::{ServerContext, SERVER_NAME, SERVER_VERSION};
use mail_outlook_mcp_rs::{http, stdio};

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    dotenvy::dotenv().ok();

    if should_print_help(std::env::args().skip(1)) {
        if print_help_output().is_err() {
            return 1;
        }
        return 0;
    }

    let config = match ServerConfig::load_from_env() {
        Ok(config) => config,
        Err(error) => {
            eprintln!("configuration error: {error}");
            return 1;
        }
    };

    // stdout belongs to the line transport; all diagnostics go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .with_writer(std::io::stderr)
        .init();

    let connector = match build_connector() {
        Ok(connector) => connector,
        Err(message) => {
            eprintln!("{message}");
            return 1;
        }
    };

    let ctx = match ServerContext::build(config, connector).await {
        Ok(ctx) => ctx,
        Err(error) => {
            error!(%error, "startup failed");
            return 1;
        }
    };

    let listener = match http::bind(&ctx).await {
        Ok(listener) => listener,
        Err(error) => {
            error!(%error, "startup failed");
            return 1;
        }
    };

    info!(
        name = SERVER_NAME,
        version = SERVER_VERSION,
        "server ready"
    );

    let http_ctx = ctx.clone();
    let http_task = tokio::spawn(async move {
        if let Err(error) = http::serve(http_ctx, listener).await {
            error!(%error, "http transport exited");
        }
    });

    let stdio_ctx = ctx.clone();
    let mut stdio_task = tokio::spawn(async move {
        if let Err(error) = stdio::serve(stdio_ctx).await {
            error!(%error, "line transport exited");
        }
    });

    let mut fatal = ctx.pool.fatal_signal();
    let mut exit_code = 0;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received");
        }
        _ = terminate_signal() => {
            info!("terminate signal received");
        }
        _ = &mut stdio_task => {
            info!("stdio session ended");
        }
        changed = fatal.changed() => {
            if changed.is_ok() {
                if let Some(reason) = fatal.borrow().clone() {
                    error!(%reason, "mail store lost permanently");
                    exit_code = 2;
                }
            }
        }
    }

    ctx.shutdown().await;
    http_task.abort();
    stdio_task.abort();
    exit_code
}

/// Select the adapter backend
///
/// The object-model driver for a locally installed Outlook is an external
/// collaborator wired in through [`MailConnector`]; this build ships the
/// in-memory backend for development and protocol testing.
fn build_connector() -> Result<Arc<dyn MailConnector>, String> {
    let backend =
        std::env::var("OUTLOOK_MCP_BACKEND").unwrap_or_else(|_| "memory".to_owned());
    match backend.as_str() {
        "memory" => Ok(Arc::new(InMemoryConnector::new(
            InMemoryMailStore::with_sample_data(),
        ))),
        other => Err(format!(
            "unknown OUTLOOK_MCP_BACKEND '{other}'; supported backends: memory"
        )),
    }
}

#[cfg(unix)]
async fn terminate_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(_) => std::future::pending::<()>().await,
    }
}

#[cfg(not(unix))]
async fn terminate_signal() {
    std::future::pending::<()>().await
}

fn should_print_help<I>(args: I) -> bool
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    args.into_iter().any(|arg| {
        let arg = arg.as_ref();
        arg == "--help" || arg == "-h"
    })
}

fn print_help_output() -> io::Result<()> {
    let env_map: BTreeMap<String, String> = std::env::vars().collect();
    let output = build_help_output(&env_map);
    let mut stdout = io::stdout().lock();
    stdout.write_all(output.as_bytes())?;
    stdout.flush()
}

fn build_help_output(env_map: &BTreeMap<String, String>) -> String {
    let mut out = String::new();

    out.push_str(SERVER_NAME);
    out.push('\n');
    out.push_str("Outlook bridge server speaking JSON-RPC 2.0 over stdio and HTTP\n\n");

    out.push_str("Usage:\n");
    out.push_str(&format!("  {SERVER_NAME}\n"));
    out.push_str(&format!("  {SERVER_NAME} --help\n\n"));

    out.push_str("Transports\n");
    out.push_str("  stdio: one JSON-RPC object per line; first call must be 'initialize'\n");
    out.push_str("  http:  POST /mcp with one JSON-RPC object per body; GET /health\n\n");

    out.push_str("Backend selection\n");
    out.push_str("  OUTLOOK_MCP_BACKEND=memory (in-memory mailbox for development/testing)\n\n");

    out.push_str("Configuration (environment, current value or default)\n");
    for (key, default) in documented_env_keys() {
        match env_map.get(key) {
            Some(value) => out.push_str(&format!("  {key}={value}\n")),
            None => out.push_str(&format!("  {key}={default} (default)\n")),
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::{build_help_output, should_print_help};

    #[test]
    fn detects_short_and_long_help_flags() {
        assert!(should_print_help(["-h"]));
        assert!(should_print_help(["--help"]));
        assert!(should_print_help(["--verbose", "-h"]));
        assert!(!should_print_help(["--verbose"]));
    }

    #[test]
    fn help_output_lists_knobs_and_marks_overrides() {
        let mut env_map = BTreeMap::new();
        env_map.insert(
            "OUTLOOK_MCP_POOL_MAX_CONNECTIONS".to_owned(),
            "9".to_owned(),
        );

        let help = build_help_output(&env_map);
        assert!(help.contains("OUTLOOK_MCP_POOL_MAX_CONNECTIONS=9\n"));
        assert!(help.contains("OUTLOOK_MCP_RATE_LIMIT_RPS=10 (default)"));
        assert!(help.contains("POST /mcp"));
    }
}
