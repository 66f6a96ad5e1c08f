use crate::orchestrator::{self, JobContext, JobParams};
use crate::state::StatusEvent;
use crate::telemetry::TelemetryCommand;
use axum::http::{StatusCode, header};
use axum::{
    Json, Router,
    extract::ws::{Message, Utf8Bytes, WebSocket, WebSocketUpgrade},
    extract::{Query, State},
    response::IntoResponse,
    routing::{get, post},
};
use futures::{SinkExt, StreamExt};
use photoscenery_shared::{
    ConnectionState, FgfsStatus, FillHolesRequest, SessionTotalsMsg, StartJobRequest,
    StartJobResponse, TileProgressMsg,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::compression::CompressionLayer;
use tower_http::services::ServeDir;
use tracing::{info, warn};

/// Everything the HTTP handlers need.
pub struct WebCtx {
    pub job_ctx: JobContext,
    pub telemetry_tx: mpsc::Sender<TelemetryCommand>,
    /// ICAO -> (lat, lon), loaded at startup.
    pub airports: HashMap<String, (f64, f64)>,
    /// Directory served for `/` and unmatched paths.
    pub static_root: PathBuf,
}

/// Public router constructor.
pub fn router(ctx: Arc<WebCtx>) -> Router {
    let static_dir = ServeDir::new(&ctx.static_root)
        .precompressed_br()
        .precompressed_gzip();

    Router::new()
        .layer(CompressionLayer::new())
        .route("/api/session-info", get(session_info))
        .route("/api/connection-state", get(connection_state))
        .route("/api/connect", post(connect))
        .route("/api/disconnect", post(disconnect))
        .route("/api/fgfs-status", get(fgfs_status))
        .route("/api/start-job", post(start_job))
        .route("/api/fill-holes", post(fill_holes))
        .route("/api/completed-jobs", get(completed_jobs))
        .route("/api/queue-size", get(queue_size))
        .route("/api/shutdown", post(shutdown))
        .route("/api/resolve-icao", get(resolve_icao_handler))
        .route("/api/tiles", get(active_tiles))
        .route("/preview", get(preview))
        .route("/ws", get(ws_handler))
        // anything that doesn't match the above routes goes to static files
        .fallback_service(static_dir)
        .with_state(ctx)
}

/// Outgoing WebSocket messages to the frontend:
///   { "ty": "tile",   "data": { ...TileProgressMsg... } }
///   { "ty": "totals", "data": { ...SessionTotalsMsg... } }
///   { "ty": "log",    "data": "line" }
#[derive(Serialize)]
#[serde(tag = "ty", content = "data", rename_all = "lowercase")]
enum WsOutMsg {
    Tile(TileProgressMsg),
    Totals(SessionTotalsMsg),
    Log(String),
}

impl From<StatusEvent> for WsOutMsg {
    fn from(ev: StatusEvent) -> Self {
        match ev {
            StatusEvent::Tile(t) => WsOutMsg::Tile(t),
            StatusEvent::Totals(t) => WsOutMsg::Totals(t),
            StatusEvent::Log(l) => WsOutMsg::Log(l),
        }
    }
}

async fn session_info(State(ctx): State<Arc<WebCtx>>) -> impl IntoResponse {
    Json(json!({ "startTime": ctx.job_ctx.state.start_time }))
}

async fn connection_state(State(ctx): State<Arc<WebCtx>>) -> impl IntoResponse {
    Json(json!({ "state": ctx.job_ctx.state.connection_state().as_str() }))
}

#[derive(Deserialize)]
struct ConnectRequest {
    port: u16,
}

async fn connect(
    State(ctx): State<Arc<WebCtx>>,
    Json(req): Json<ConnectRequest>,
) -> impl IntoResponse {
    ctx.job_ctx
        .state
        .set_connection(ConnectionState::Connecting);
    match ctx
        .telemetry_tx
        .send(TelemetryCommand::Connect { port: req.port })
        .await
    {
        Ok(()) => StatusCode::OK,
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn disconnect(State(ctx): State<Arc<WebCtx>>) -> impl IntoResponse {
    match ctx.telemetry_tx.send(TelemetryCommand::Disconnect).await {
        Ok(()) => StatusCode::OK,
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn fgfs_status(State(ctx): State<Arc<WebCtx>>) -> impl IntoResponse {
    let fix = ctx.job_ctx.state.position_snapshot();
    let status = match fix {
        Some(fix) => FgfsStatus {
            active: true,
            lat: fix.lat_deg,
            lon: fix.lon_deg,
            heading: fix.heading_deg,
            altitude: fix.altitude_msl_ft,
            speed: fix.speed_mph,
        },
        None => FgfsStatus {
            active: false,
            lat: 0.0,
            lon: 0.0,
            heading: 0.0,
            altitude: 0.0,
            speed: 0.0,
        },
    };
    Json(status)
}

fn resolve_icao(airports: &HashMap<String, (f64, f64)>, code: &str) -> Option<(f64, f64)> {
    airports.get(&code.to_uppercase()).copied()
}

async fn start_job(
    State(ctx): State<Arc<WebCtx>>,
    Json(req): Json<StartJobRequest>,
) -> impl IntoResponse {
    let cfg = &ctx.job_ctx.cfg;
    if req.size > crate::geodesy::MAX_SIZE_ID || req.over > 2 {
        return (StatusCode::BAD_REQUEST, "invalid size or over").into_response();
    }

    let center = match (&req.icao, req.lat, req.lon) {
        (Some(code), _, _) => match resolve_icao(&ctx.airports, code) {
            Some(c) => c,
            None => {
                return (StatusCode::NOT_FOUND, "unknown ICAO code").into_response();
            }
        },
        (None, Some(lat), Some(lon)) => (lat, lon),
        _ => {
            return (StatusCode::BAD_REQUEST, "need either icao or lat+lon").into_response();
        }
    };

    let params = JobParams {
        lat: center.0,
        lon: center.1,
        radius_nm: req.radius,
        size: req.size,
        over: req.over,
        sdwn: req.sdwn.unwrap_or(cfg.sdwn).min(req.size),
        mode: req.mode.unwrap_or(cfg.mode),
    };
    let job_id = ctx.job_ctx.state.allocate_job_id();
    info!(job_id, "start-job accepted");
    let job_ctx = ctx.job_ctx.clone();
    tokio::spawn(async move {
        let summary = orchestrator::run_job(&job_ctx, job_id, params).await;
        info!(
            job_id,
            tiles = summary.tiles,
            chunks = summary.chunks_enqueued,
            drained = summary.drained,
            "job finished"
        );
    });

    Json(StartJobResponse {
        job_id,
        lat: center.0,
        lon: center.1,
        radius: req.radius,
    })
    .into_response()
}

async fn fill_holes(
    State(ctx): State<Arc<WebCtx>>,
    Json(req): Json<FillHolesRequest>,
) -> impl IntoResponse {
    if req.settings.size > crate::geodesy::MAX_SIZE_ID {
        return (StatusCode::BAD_REQUEST, "invalid size").into_response();
    }
    if req.bounds.north <= req.bounds.south || req.bounds.east <= req.bounds.west {
        return (StatusCode::BAD_REQUEST, "degenerate bounds").into_response();
    }
    if req.settings.over > 2 {
        return (StatusCode::BAD_REQUEST, "invalid over").into_response();
    }
    let job_id = ctx.job_ctx.state.allocate_job_id();
    let job_ctx = ctx.job_ctx.clone();
    let bounds = req.bounds;
    let (size, over) = (req.settings.size, req.settings.over);
    tokio::spawn(async move {
        let summary = orchestrator::run_fill_holes(&job_ctx, job_id, bounds, size, over).await;
        info!(job_id, tiles = summary.tiles, "fill-holes finished");
    });
    Json(json!({ "status": "started", "jobId": job_id })).into_response()
}

async fn completed_jobs(State(ctx): State<Arc<WebCtx>>) -> impl IntoResponse {
    Json(ctx.job_ctx.state.drain_completed_jobs())
}

async fn queue_size(State(ctx): State<Arc<WebCtx>>) -> impl IntoResponse {
    Json(ctx.job_ctx.downloader.queue_len())
}

async fn active_tiles(State(ctx): State<Arc<WebCtx>>) -> impl IntoResponse {
    Json(ctx.job_ctx.state.tile_snapshots())
}

async fn shutdown(State(ctx): State<Arc<WebCtx>>) -> impl IntoResponse {
    info!("shutdown requested over HTTP");
    ctx.job_ctx.state.request_shutdown();
    StatusCode::OK
}

#[derive(Deserialize)]
struct IcaoParams {
    icao: String,
}

async fn resolve_icao_handler(
    State(ctx): State<Arc<WebCtx>>,
    Query(params): Query<IcaoParams>,
) -> impl IntoResponse {
    match resolve_icao(&ctx.airports, &params.icao) {
        Some((lat, lon)) => Json(json!({ "lat": lat, "lon": lon })).into_response(),
        None => (StatusCode::NOT_FOUND, "unknown ICAO code").into_response(),
    }
}

#[derive(Deserialize)]
struct PreviewParams {
    id: u64,
    w: Option<u32>,
}

/// Fast preview: decode the placed tile, downscale, return PNG bytes.
async fn preview(
    State(ctx): State<Arc<WebCtx>>,
    Query(params): Query<PreviewParams>,
) -> impl IntoResponse {
    let width = params.w.unwrap_or(512).clamp(16, 4096);
    let meta = crate::geodesy::TileMetadata::from_id(params.id, 0);
    let root = ctx.job_ctx.index.final_root().to_path_buf();
    let result = tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<u8>> {
        let dir = root.join(meta.dir10()).join(meta.dir1());
        let dds_path = dir.join(format!("{}.dds", meta.id));
        let png_path = dir.join(format!("{}.png", meta.id));
        let img = if dds_path.exists() {
            crate::dds::decode(&dds_path)?
        } else {
            image::open(&png_path)?.to_rgba8()
        };
        let (w, h) = img.dimensions();
        let scaled_h = ((width as f64 / w as f64) * h as f64).round().max(1.0) as u32;
        let small = image::imageops::resize(
            &img,
            width,
            scaled_h,
            image::imageops::FilterType::Triangle,
        );
        let mut buf = std::io::Cursor::new(Vec::new());
        small.write_to(&mut buf, image::ImageFormat::Png)?;
        Ok(buf.into_inner())
    })
    .await;

    match result {
        Ok(Ok(bytes)) => ([(header::CONTENT_TYPE, "image/png")], bytes).into_response(),
        Ok(Err(e)) => {
            warn!("preview for tile {} failed: {e}", params.id);
            (StatusCode::NOT_FOUND, "tile not available").into_response()
        }
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "preview task failed").into_response(),
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(ctx): State<Arc<WebCtx>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, ctx))
}

/// Stream status events to one client until it goes away.
async fn handle_ws(socket: WebSocket, ctx: Arc<WebCtx>) {
    let mut status_rx = ctx.job_ctx.state.status_tx.subscribe();
    let (mut sender, mut receiver) = socket.split();

    // Task: server -> client.
    let send_task = async move {
        // Initial snapshot so a fresh client has the whole picture.
        let totals = ctx.job_ctx.state.totals_snapshot();
        let text = serde_json::to_string(&WsOutMsg::Totals(totals)).unwrap_or_default();
        if sender.send(Message::Text(Utf8Bytes::from(text))).await.is_err() {
            return;
        }
        for tile in ctx.job_ctx.state.tile_snapshots() {
            let text = serde_json::to_string(&WsOutMsg::Tile(tile)).unwrap_or_default();
            if sender.send(Message::Text(Utf8Bytes::from(text))).await.is_err() {
                return;
            }
        }

        loop {
            match status_rx.recv().await {
                Ok(event) => {
                    let msg = WsOutMsg::from(event);
                    let text = serde_json::to_string(&msg).unwrap_or_default();
                    if sender.send(Message::Text(Utf8Bytes::from(text))).await.is_err() {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                    // Keep going; the next events resynchronize the client.
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    // Task: client -> server. Nothing to act on; drain until close.
    let recv_task = async move { while let Some(Ok(_)) = receiver.next().await {} };

    tokio::join!(send_task, recv_task);
}

/// Load the optional ICAO -> coordinates JSON file.
pub fn load_airports(path: Option<&std::path::Path>) -> HashMap<String, (f64, f64)> {
    #[derive(Deserialize)]
    struct Airport {
        lat: f64,
        lon: f64,
    }
    let Some(path) = path else {
        return HashMap::new();
    };
    match std::fs::read_to_string(path) {
        Ok(raw) => match serde_json::from_str::<HashMap<String, Airport>>(&raw) {
            Ok(map) => map
                .into_iter()
                .map(|(k, v)| (k.to_uppercase(), (v.lat, v.lon)))
                .collect(),
            Err(e) => {
                warn!("airport file {} unreadable: {e}", path.display());
                HashMap::new()
            }
        },
        Err(e) => {
            warn!("airport file {} unreadable: {e}", path.display());
            HashMap::new()
        }
    }
}
