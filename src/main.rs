//! remoted: serves MPRIS player state and controls over HTTP and WebSocket.
//!
//! Three long-lived tasks share one `Remote`: the HTTP server, the hub's
//! evaluation loop and the bus signal listener. SIGINT/SIGTERM cancel all of
//! them through one token.

#![deny(unsafe_code)]
#![deny(clippy::all, clippy::pedantic, clippy::nursery, clippy::perf)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::too_many_lines,
    clippy::must_use_candidate,
    clippy::option_if_let_else,
    clippy::significant_drop_tightening
)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use umr_remoted::bus::MprisBus;
use umr_remoted::cache::ArtCache;
use umr_remoted::config::Config;
use umr_remoted::hub::HubTimeouts;
use umr_remoted::listener;
use umr_remoted::remote::Remote;
use umr_remoted::server::{self, AppState, ServerInfo};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to config.toml
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to bind
    #[arg(long)]
    bind: Option<String>,

    /// Port to listen on
    #[arg(long)]
    port: Option<u16>,

    /// Shared secret required on every request except /healthz
    #[arg(long)]
    token: Option<String>,

    /// Directory for cached artwork
    #[arg(long)]
    art_cache: Option<PathBuf>,

    /// Validate configuration and exit
    #[arg(long)]
    check: bool,
}

fn load_config(args: &Args) -> Result<Config> {
    let mut cfg = Config::load(args.config.as_deref())?;
    cfg.apply_env(|key| std::env::var(key).ok());
    if let Some(bind) = &args.bind {
        cfg.server.bind.clone_from(bind);
    }
    if let Some(port) = args.port {
        cfg.server.port = port;
    }
    if let Some(token) = &args.token {
        cfg.server.token = Some(token.clone()).filter(|t| !t.is_empty());
    }
    if let Some(dir) = &args.art_cache {
        cfg.art.cache_dir = Some(dir.to_string_lossy().into_owned());
    }
    Ok(cfg)
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    let terminate = async {
        if let Ok(mut signal) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            signal.recv().await;
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        () = terminate => {},
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let cfg = load_config(&args).context("load config")?;

    if args.check {
        println!("config ok: listen {} art {}", cfg.listen_addr(), cfg.art.cache_dir().display());
        return Ok(());
    }

    init_tracing(&cfg);

    let art = ArtCache::new(cfg.art.cache_dir(), cfg.art.allowed_roots());
    art.prepare()
        .await
        .with_context(|| format!("create art cache dir {}", art.root().display()))?;

    let bus = MprisBus::session(cfg.bus.endpoint_timeout()).await.context("dbus session")?;
    let remote = Arc::new(Remote::new(
        Arc::new(bus),
        art,
        cfg.bus.call_timeout(),
        HubTimeouts {
            evaluate: cfg.bus.hub_timeout(),
            push: cfg.bus.push_timeout(),
        },
    ));

    let cancel = CancellationToken::new();

    let hub_task = {
        let remote = remote.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { remote.hub().run(remote.as_ref(), cancel).await })
    };
    let listener_task = listener::spawn(remote.hub().trigger_handle(), cancel.clone());

    let addr = cfg.listen_addr();
    let tcp = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(%addr, version = %cfg.server.version, requires_token = cfg.server.token.is_some(), "remoted listening");

    let state = AppState::new(
        remote.clone(),
        ServerInfo::new(cfg.server.version.clone(), cfg.server.token.clone()),
        cancel.clone(),
    );
    let shutdown = {
        let cancel = cancel.clone();
        async move {
            tokio::select! {
                () = shutdown_signal() => info!("shutdown requested"),
                () = cancel.cancelled() => {}
            }
            cancel.cancel();
        }
    };

    let served = axum::serve(tcp, server::router(state))
        .with_graceful_shutdown(shutdown)
        .await;
    cancel.cancel();
    let _ = tokio::join!(hub_task, listener_task);

    if let Err(err) = served {
        error!(%err, "http server failed");
        return Err(err).context("serve");
    }
    info!("remoted stopped");
    Ok(())
}
