use clap::Parser;
use crabcast::config::Config;
use crabcast::http::{self, AppState};
use crabcast::mount::{MountManager, Selection, SharedStream};
use crabcast::ndi::discovery;
use crabcast::session::SessionManager;
use crabcast::stream::metrics;
use crabcast::yuv;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::watch;

#[tokio::main]
async fn main() {
    let cfg = Config::parse();
    crabcast::init_logging();
    cfg.apply_env_overrides();

    log::info!("crabcast {}", crabcast::VERSION);
    log::info!("Color conversion: {}", yuv::conversion_impl());
    metrics::reset_counters();
    discovery::start_background_discovery();

    let defaults = cfg.stream_defaults();
    let selection = Selection {
        name: cfg.ndi_source.clone(),
        url: cfg.ndi_source_url.clone(),
    };
    let addr = format!("{}:{}", cfg.host, cfg.port);
    let state = Arc::new(AppState {
        sessions: SessionManager::new(),
        mounts: MountManager::new(defaults),
        shared: Arc::new(SharedStream::new(defaults)),
        selection: Mutex::new(selection),
        cfg,
    });

    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            log::error!("bind {} failed: {}", addr, e);
            std::process::exit(1);
        }
    };
    log::info!("Listening on http://{}", addr);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = tokio::spawn(http::serve(listener, Arc::clone(&state), shutdown_rx));

    wait_for_signal().await;
    log::info!("Signal received, shutting down");
    let _ = shutdown_tx.send(true);
    let _ = server.await;
}

#[cfg(unix)]
async fn wait_for_signal() {
    let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
