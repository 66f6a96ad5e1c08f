use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use photoscenery_shared::{AcquisitionMode, Bounds};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache_index::CacheIndex;
use crate::config::Config;
use crate::downloader::{Downloader, PriorityClass};
use crate::geodesy::{
    self, LAT_STEP, TileMetadata, adaptive_size_id, ellipse_distance_nm, surface_distance_nm,
    tile_width,
};
use crate::jobs;
use crate::state::{AppState, now_ms};

/// One acquisition request, either from the CLI or the HTTP plane.
#[derive(Debug, Clone)]
pub struct JobParams {
    pub lat: f64,
    pub lon: f64,
    pub radius_nm: f64,
    pub size: u8,
    pub over: u8,
    pub sdwn: u8,
    pub mode: AcquisitionMode,
}

/// Everything a job needs, wired once at startup.
#[derive(Clone)]
pub struct JobContext {
    pub state: Arc<AppState>,
    pub index: Arc<CacheIndex>,
    pub downloader: Arc<Downloader>,
    pub cfg: Arc<Config>,
}

/// A tile selected for acquisition, with its ordering metrics.
#[derive(Debug, Clone)]
pub struct TileCandidate {
    pub id: u64,
    pub radial_nm: f64,
    pub metric_nm: f64,
    pub size_id: u8,
}

#[derive(Debug, Clone, Copy)]
pub struct JobSummary {
    pub job_id: u64,
    pub tiles: usize,
    pub chunks_enqueued: usize,
    pub drained: bool,
}

/// Enumerate the tile grid around a center, filter by radial distance, pick
/// the per-tile resolution class, and order by (metric, radial, id).
pub fn enumerate_tiles(
    params: &JobParams,
    heading_deg: Option<f64>,
    alt_ft: f64,
) -> Vec<TileCandidate> {
    let daa = params.mode == AcquisitionMode::Daa && heading_deg.is_some();
    let offset_nm = if daa { params.radius_nm * 0.5 } else { 0.0 };
    let reach_nm = params.radius_nm + offset_nm;

    let dlat = reach_nm / 60.0;
    let cos_lat = params.lat.to_radians().cos().max(0.01);
    let dlon = reach_nm / (60.0 * cos_lat);

    let lat_min = (params.lat - dlat).max(-90.0);
    let lat_max = (params.lat + dlat).min(90.0 - LAT_STEP);
    let lon_min = params.lon - dlon;
    let lon_max = params.lon + dlon;

    let mut out = Vec::new();
    let mut dedupe = HashSet::new();
    let mut lat = (lat_min / LAT_STEP).floor() * LAT_STEP;
    while lat <= lat_max {
        let width = tile_width(lat + LAT_STEP / 2.0);
        let mut lon = (lon_min / width).floor() * width;
        while lon <= lon_max {
            let (cell_lat, cell_lon) = (lat, lon);
            let id = geodesy::index(lat + LAT_STEP / 2.0, lon + width / 2.0);
            lon += width;
            if !dedupe.insert(id) {
                continue;
            }
            let c = geodesy::coord_from_index(id);
            let radial = surface_distance_nm(params.lon, params.lat, c.lon_c, c.lat_c);
            // The tile under the center is always part of the area, however
            // small the radius.
            let contains = params.lat >= cell_lat
                && params.lat < cell_lat + LAT_STEP
                && params.lon >= cell_lon
                && params.lon < cell_lon + width;
            if !contains && radial > params.radius_nm {
                continue;
            }
            let metric = match heading_deg {
                Some(h) if daa => ellipse_distance_nm(
                    params.lat,
                    params.lon,
                    h,
                    params.radius_nm,
                    c.lat_c,
                    c.lon_c,
                ),
                _ => radial,
            };
            let size_id = adaptive_size_id(params.size, alt_ft, metric, params.radius_nm, params.sdwn)
                .max(params.sdwn);
            out.push(TileCandidate {
                id,
                radial_nm: radial,
                metric_nm: metric,
                size_id,
            });
        }
        lat += LAT_STEP;
    }

    out.sort_by(|a, b| {
        (a.metric_nm, a.radial_nm, a.id)
            .partial_cmp(&(b.metric_nm, b.radial_nm, b.id))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    out
}

/// Tiles covering an explicit rectangle (used by fill-holes).
pub fn enumerate_bounds_tiles(bounds: &Bounds, size_id: u8) -> Vec<TileCandidate> {
    let mut out = Vec::new();
    let mut dedupe = HashSet::new();
    let mut lat = (bounds.south / LAT_STEP).floor() * LAT_STEP;
    while lat < bounds.north {
        let width = tile_width(lat + LAT_STEP / 2.0);
        let mut lon = (bounds.west / width).floor() * width;
        while lon < bounds.east {
            let id = geodesy::index(lat + LAT_STEP / 2.0, lon + width / 2.0);
            lon += width;
            if dedupe.insert(id) {
                out.push(TileCandidate {
                    id,
                    radial_nm: 0.0,
                    metric_nm: 0.0,
                    size_id,
                });
            }
        }
        lat += LAT_STEP;
    }
    out
}

/// The pre-coverage resolution class for a tile list.
fn precover_level(candidates: &[TileCandidate], gap: u8) -> u8 {
    let min_required = candidates.iter().map(|c| c.size_id).min().unwrap_or(0);
    min_required.saturating_sub(gap).min(2)
}

/// Run one acquisition job end to end: skip satisfied tiles, queue the
/// pre-coverage pass on HIGH, queue the full-resolution chunks, then wait
/// for the pipeline to drain.
pub async fn run_job(ctx: &JobContext, job_id: u64, params: JobParams) -> JobSummary {
    let position = ctx.state.position_snapshot();
    let daa = params.mode == AcquisitionMode::Daa;
    let heading = if daa {
        position.map(|p| p.heading_deg)
    } else {
        None
    };
    let alt_ft = position.map(|p| p.agl_ft()).unwrap_or(0.0);

    let mut candidates = enumerate_tiles(&params, heading, alt_ft);
    let before_skip = candidates.len();
    candidates.retain(|c| {
        ctx.index
            .best_final_size(c.id)
            .map(|have| have < c.size_id)
            .unwrap_or(true)
    });
    info!(
        job_id,
        tiles = candidates.len(),
        skipped = before_skip - candidates.len(),
        "job starting at ({:.4}, {:.4}) r={} NM",
        params.lat,
        params.lon,
        params.radius_nm
    );
    ctx.state.log_line(format!(
        "job {job_id}: {} tiles to acquire",
        candidates.len()
    ));

    let staging = ctx.cfg.staging_dir();
    let mut chunks_enqueued = 0usize;

    // Phase 1: pre-coverage on the priority queue.
    let level = precover_level(&candidates, ctx.cfg.precover_gap);
    for c in &candidates {
        let meta = TileMetadata::from_id(c.id, c.size_id);
        ctx.state
            .register_tile(c.id, c.size_id, meta.cols, now_ms(), params.over);
        if c.size_id > level
            && let Some(job) = jobs::precover_job(&meta, level, &staging, ctx.cfg.attempts)
        {
            chunks_enqueued += 1;
            ctx.downloader.enqueue(job, PriorityClass::High).await;
        }
    }

    // Phase 2: full resolution. In direction-aware mode the nearest slice
    // of the ordered list is prioritized.
    let high_cut = if daa {
        (candidates.len() as f64 * ctx.cfg.daa_priority_frac).ceil() as usize
    } else {
        0
    };
    for (i, c) in candidates.iter().enumerate() {
        let meta = TileMetadata::from_id(c.id, c.size_id);
        let batch = jobs::chunk_jobs(&meta, &staging, ctx.cfg.attempts);
        if batch.already_staged > 0 {
            debug!(
                "tile {}: {} chunks already staged",
                c.id, batch.already_staged
            );
        }
        let class = if i < high_cut {
            PriorityClass::High
        } else {
            PriorityClass::Low
        };
        for job in batch.jobs {
            chunks_enqueued += 1;
            ctx.downloader.enqueue(job, class).await;
        }
    }

    let drained = wait_for_drain(ctx, job_id).await;
    ctx.state.job_completed(job_id);
    ctx.state.log_line(format!("job {job_id} finished"));
    JobSummary {
        job_id,
        tiles: candidates.len(),
        chunks_enqueued,
        drained,
    }
}

/// Acquire every tile inside `bounds` that the coverage does not already
/// satisfy at `size_id`. Used by the fill-holes endpoint.
pub async fn run_fill_holes(
    ctx: &JobContext,
    job_id: u64,
    bounds: Bounds,
    size_id: u8,
    over: u8,
) -> JobSummary {
    let mut candidates = enumerate_bounds_tiles(&bounds, size_id);
    candidates.retain(|c| {
        ctx.index
            .best_final_size(c.id)
            .map(|have| have < c.size_id)
            .unwrap_or(true)
    });
    info!(job_id, tiles = candidates.len(), "fill-holes job starting");

    let staging = ctx.cfg.staging_dir();
    let mut chunks_enqueued = 0usize;
    for c in &candidates {
        let meta = TileMetadata::from_id(c.id, c.size_id);
        ctx.state
            .register_tile(c.id, c.size_id, meta.cols, now_ms(), over);
        for job in jobs::chunk_jobs(&meta, &staging, ctx.cfg.attempts).jobs {
            chunks_enqueued += 1;
            ctx.downloader.enqueue(job, PriorityClass::Low).await;
        }
    }

    let drained = wait_for_drain(ctx, job_id).await;
    ctx.state.job_completed(job_id);
    JobSummary {
        job_id,
        tiles: candidates.len(),
        chunks_enqueued,
        drained,
    }
}

/// Wait until `pending` stays at zero for the grace interval, or the hard
/// job timeout fires (leaving the remaining work queued).
async fn wait_for_drain(ctx: &JobContext, job_id: u64) -> bool {
    let deadline = Instant::now() + Duration::from_secs(ctx.cfg.job_timeout);
    let grace = Duration::from_secs(ctx.cfg.grace_secs);
    let mut quiet_since: Option<Instant> = None;
    loop {
        if Instant::now() >= deadline {
            warn!(job_id, "job hit the hard timeout, leaving work queued");
            return false;
        }
        if ctx.state.pending_count() <= 0 {
            match quiet_since {
                Some(t) if t.elapsed() >= grace => return true,
                Some(_) => {}
                None => quiet_since = Some(Instant::now()),
            }
        } else {
            quiet_since = None;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}
