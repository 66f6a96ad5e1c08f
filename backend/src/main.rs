// main.rs

mod assembly;
mod cache_index;
mod config;
mod dds;
mod downloader;
mod fallback;
mod geodesy;
mod jobs;
mod mapserver;
mod orchestrator;
mod placement;
mod png;
mod state;
mod telemetry;
mod web;

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use photoscenery_shared::Bounds;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::assembly::AssemblyMonitor;
use crate::cache_index::CacheIndex;
use crate::config::{Args, Config};
use crate::downloader::Downloader;
use crate::fallback::FallbackManager;
use crate::orchestrator::{JobContext, JobParams};
use crate::placement::Placer;
use crate::state::AppState;
use crate::web::WebCtx;

fn init_tracing(cfg: &Config) {
    let default = match (cfg.logger, cfg.debug) {
        (_, d) if d > 0 => "photoscenery_backend=trace",
        (0, _) => "photoscenery_backend=error",
        (1, _) => "photoscenery_backend=info",
        _ => "photoscenery_backend=debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal(state: Arc<AppState>) {
    let mut internal = state.shutdown_subscribe();
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("failed to install Ctrl+C handler: {err}");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!("failed to install SIGTERM handler: {err}");
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
        _ = internal.recv() => {}
    }

    state.request_shutdown();
}

/// Remove leftover `*.tmp` files from interrupted downloads.
fn cleanup_staging_tmp(staging: &Path) {
    let Ok(entries) = fs::read_dir(staging) else {
        return;
    };
    for entry in entries.flatten() {
        if entry.file_name().to_string_lossy().ends_with(".tmp") {
            fs::remove_file(entry.path()).ok();
        }
    }
}

/// Forward queued log lines onto the status broadcast for WS clients.
async fn forward_logs(
    state: Arc<AppState>,
    mut log_rx: mpsc::Receiver<String>,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            line = log_rx.recv() => match line {
                Some(line) => {
                    let _ = state.status_tx.send(crate::state::StatusEvent::Log(line));
                }
                None => break,
            },
        }
    }
}

/// Resolve the one-shot job center from CLI arguments.
fn cli_center(args: &Args, cfg: &Config) -> anyhow::Result<Option<(f64, f64)>> {
    if let Some(tile) = args.tile {
        let c = geodesy::coord_from_index(tile);
        return Ok(Some((c.lat_c, c.lon_c)));
    }
    if let Some(code) = &args.icao {
        let airports = web::load_airports(cfg.airports_file.as_deref());
        let Some((lat, lon)) = airports.get(&code.to_uppercase()).copied() else {
            bail!("unknown ICAO code {code}");
        };
        return Ok(Some((lat, lon)));
    }
    if let (Some(lat), Some(lon)) = (args.lat, args.lon) {
        return Ok(Some((lat, lon)));
    }
    Ok(None)
}

fn cli_bounds(args: &Args) -> Option<Bounds> {
    match (args.latll, args.lonll, args.latur, args.lonur) {
        (Some(south), Some(west), Some(north), Some(east)) => Some(Bounds {
            north,
            south,
            east,
            west,
        }),
        _ => None,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let cfg = Arc::new(Config::from_args(&args)?);
    init_tracing(&cfg);

    // Root paths must exist; failure here is fatal.
    let save_root = cfg.save_root();
    let staging = cfg.staging_dir();
    fs::create_dir_all(&cfg.path)
        .with_context(|| format!("creating scenery root {}", cfg.path.display()))?;
    fs::create_dir_all(&staging)
        .with_context(|| format!("creating staging dir {}", staging.display()))?;

    let (state, log_rx) = AppState::new();

    let index = Arc::new(CacheIndex::new(
        save_root.join("index.json"),
        save_root.join("coverage.json"),
        cfg.path.clone(),
        save_root.clone(),
    ));
    {
        let index = index.clone();
        tokio::task::spawn_blocking(move || index.load_or_rebuild())
            .await
            .context("cache index startup scan")?;
    }
    info!(tiles = index.len(), "cache index ready");

    let servers = mapserver::load_servers(cfg.servers_file.as_deref());
    let Some(server) = mapserver::select(&servers, cfg.map).cloned() else {
        bail!("unknown map server id {}", cfg.map);
    };
    info!("using map server {} ({})", server.id, server.name);

    let (fail_tx, fail_rx) = mpsc::channel(1024);
    let downloader = Downloader::new(cfg.clone(), server, state.clone(), fail_tx)?;
    let mut placer = Placer::new(cfg.path.clone(), save_root.clone(), index.clone());
    if cfg.nosave {
        placer = placer.without_backups();
    }
    let placer = Arc::new(placer);
    let job_ctx = JobContext {
        state: state.clone(),
        index: index.clone(),
        downloader: downloader.clone(),
        cfg: cfg.clone(),
    };

    // --- Background tasks ---
    let mut handles: Vec<JoinHandle<()>> = Vec::new();
    for worker_id in 0..cfg.workers {
        handles.push(tokio::spawn(
            downloader.clone().run_worker(worker_id, state.shutdown_subscribe()),
        ));
    }
    handles.push(tokio::spawn(
        FallbackManager::new(
            index.clone(),
            placer.clone(),
            downloader.clone(),
            state.clone(),
            cfg.clone(),
        )
        .run(fail_rx, state.shutdown_subscribe()),
    ));
    handles.push(tokio::spawn(
        AssemblyMonitor::new(placer.clone(), state.clone(), cfg.clone())
            .run(state.shutdown_subscribe()),
    ));
    handles.push(tokio::spawn(cache_index::run_rescan_task(
        index.clone(),
        cfg.rescan_interval,
        state.shutdown_subscribe(),
    )));
    handles.push(tokio::spawn(forward_logs(
        state.clone(),
        log_rx,
        state.shutdown_subscribe(),
    )));

    let (telemetry_tx, telemetry_rx) = mpsc::channel(8);
    handles.push(tokio::spawn(telemetry::run_supervisor(
        state.clone(),
        telemetry_rx,
        state.shutdown_subscribe(),
    )));

    if let Some(port) = cfg.http_port {
        // --- Control plane ---
        let web_ctx = Arc::new(WebCtx {
            job_ctx,
            telemetry_tx,
            airports: web::load_airports(cfg.airports_file.as_deref()),
            static_root: "./frontend/dist".into(),
        });
        let app = web::router(web_ctx);
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
            .await
            .with_context(|| format!("binding control port {port}"))?;
        info!("control plane listening on http://127.0.0.1:{port}");
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(state.clone()))
            .await?;
    } else if let Some(bounds) = cli_bounds(&args) {
        let job_id = state.allocate_job_id();
        let summary =
            orchestrator::run_fill_holes(&job_ctx, job_id, bounds, cfg.size, cfg.over).await;
        info!(
            tiles = summary.tiles,
            chunks = summary.chunks_enqueued,
            drained = summary.drained,
            "bounds job finished"
        );
    } else if let Some((lat, lon)) = cli_center(&args, &cfg)? {
        let params = JobParams {
            lat,
            lon,
            radius_nm: cfg.radius,
            size: cfg.size,
            over: cfg.over,
            sdwn: cfg.sdwn,
            mode: cfg.mode,
        };
        let job_id = state.allocate_job_id();
        let summary = orchestrator::run_job(&job_ctx, job_id, params).await;
        info!(
            tiles = summary.tiles,
            chunks = summary.chunks_enqueued,
            drained = summary.drained,
            "job finished"
        );
    } else {
        bail!("no work given: pass --http, an area (--lat/--lon, --icao, --tile) or a bbox");
    }

    // Ensure background tasks are signaled even if the server exits early.
    state.request_shutdown();

    let task_shutdown_timeout = Duration::from_secs(5);
    for handle in handles {
        match tokio::time::timeout(task_shutdown_timeout, handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("background task ended with error: {e}"),
            Err(_) => warn!("background task did not stop within {task_shutdown_timeout:?}"),
        }
    }

    index.save();
    cleanup_staging_tmp(&staging);
    Ok(())
}
