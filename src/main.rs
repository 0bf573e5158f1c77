mod cache;
mod config;
mod db;
mod grading;
mod ipc;
mod reconcile;
mod store;
mod summary;

use clap::Parser;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Results sidecar: line-delimited JSON requests on stdin, responses on stdout.
#[derive(Debug, Parser)]
#[command(name = "resultsd", version)]
struct Args {
    /// Workspace to open at startup (otherwise sent via `workspace.select`).
    #[arg(long, env = "RESULTSD_WORKSPACE")]
    workspace: Option<PathBuf>,

    /// Log filter, e.g. `info` or `resultsd=debug`. Logs go to stderr.
    #[arg(long, env = "RESULTSD_LOG", default_value = "info")]
    log_level: String,

    /// How long resolved scoring configs stay cached.
    #[arg(long, env = "RESULTSD_CONFIG_TTL_SECS", default_value_t = 300)]
    config_ttl_secs: u64,

    /// How long a fetched grid stays the baseline for its next save.
    #[arg(long, env = "RESULTSD_SNAPSHOT_TTL_SECS", default_value_t = 1800)]
    snapshot_ttl_secs: u64,

    /// SQLite busy timeout; a store call still locked after this fails its row.
    #[arg(long, env = "RESULTSD_BUSY_TIMEOUT_MS", default_value_t = 5000)]
    busy_timeout_ms: u64,
}

fn main() {
    let args = Args::parse();

    // stdout carries responses; everything diagnostic goes to stderr.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_new(&args.log_level)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let mut state = ipc::AppState::new(
        Duration::from_secs(args.config_ttl_secs),
        Duration::from_secs(args.snapshot_ttl_secs),
        Duration::from_millis(args.busy_timeout_ms),
    );
    if let Some(path) = args.workspace.clone() {
        if let Err(e) = ipc::select_workspace(&mut state, path) {
            error!(error = %format!("{e:#}"), "startup workspace could not be opened");
        }
    }
    info!(version = env!("CARGO_PKG_VERSION"), "resultsd ready");

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                // No id to echo back.
                let resp = ipc::err("", "bad_json", e.to_string(), None);
                let _ = writeln!(stdout, "{}", resp);
                let _ = stdout.flush();
                continue;
            }
        };

        let resp = ipc::handle_request(&mut state, req);
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }
}
