use std::fs;
use std::path::{Path, PathBuf};

use crate::geodesy::{Bbox, TileMetadata, width_px_for_size};

/// A full-resolution chunk already staged with at least this many bytes is
/// treated as completed.
pub const MIN_STAGED_CHUNK_BYTES: u64 = 1024;

/// Pre-coverage chunks are single coarse images; much smaller files are
/// still acceptable.
pub const MIN_STAGED_PRECOVER_BYTES: u64 = 64;

/// Longitude spans below this are degenerate (tile at a pole).
const MIN_LON_SPAN: f64 = 1e-12;

/// Descriptor of one chunk download. Owned by the priority channel while
/// queued and by a single worker while in flight.
#[derive(Debug, Clone)]
pub struct ChunkJob {
    pub tile_id: u64,
    pub size_id: u8,
    /// 1-based column within the tile.
    pub x: u32,
    /// 1-based row counting from the top, as encoded in the filename.
    pub y_top: u32,
    pub total_chunks: u32,
    pub bbox: Bbox,
    pub width_px: u32,
    pub height_px: u32,
    pub staging_path: PathBuf,
    pub retries_left: u32,
    /// Minimum byte size for a staged file to count as done.
    pub min_bytes: u64,
}

/// Result of expanding a tile into chunk jobs.
#[derive(Debug, Default)]
pub struct JobBatch {
    pub jobs: Vec<ChunkJob>,
    /// Chunks skipped because a plausible staging file already exists.
    pub already_staged: u32,
}

pub fn staging_filename(tile_id: u64, size_id: u8, total: u32, y_top: u32, x: u32) -> String {
    format!("{tile_id}_{size_id}_{total}_{y_top}_{x}.png")
}

fn staged_ok(path: &Path, min_bytes: u64) -> bool {
    fs::metadata(path).map(|m| m.len() >= min_bytes).unwrap_or(false)
}

/// Chunk pixel height for a bbox, keeping the pixel aspect ratio equal to
/// the geographic aspect ratio.
fn chunk_height(width_px: u32, bbox: &Bbox) -> u32 {
    let dlat = (bbox.lat_ur - bbox.lat_ll).abs();
    let dlon = (bbox.lon_ur - bbox.lon_ll).abs();
    (width_px as f64 * (dlat / dlon)).round() as u32
}

/// Produce the `cols x cols` chunk jobs of a tile. The chunk bboxes
/// partition the tile exactly. Tiles with a degenerate longitude span are
/// dropped.
pub fn chunk_jobs(meta: &TileMetadata, staging_dir: &Path, attempts: u32) -> JobBatch {
    let dlon = meta.lon_ur - meta.lon_ll;
    if dlon.abs() < MIN_LON_SPAN {
        return JobBatch::default();
    }

    let cols = meta.cols;
    let total = cols * cols;
    let chunk_dlon = dlon / cols as f64;
    let chunk_dlat = (meta.lat_ur - meta.lat_ll) / cols as f64;
    let chunk_w = meta.width_px / cols;

    let mut batch = JobBatch::default();
    for y in 1..=cols {
        // `y` counts rows bottom-up; the filename counts from the top.
        let y_top = cols - y + 1;
        let lat_ll = meta.lat_ll + (y - 1) as f64 * chunk_dlat;
        for x in 1..=cols {
            let lon_ll = meta.lon_ll + (x - 1) as f64 * chunk_dlon;
            let bbox = Bbox {
                lat_ll,
                lon_ll,
                lat_ur: lat_ll + chunk_dlat,
                lon_ur: lon_ll + chunk_dlon,
            };
            let staging_path =
                staging_dir.join(staging_filename(meta.id, meta.size_id, total, y_top, x));
            if staged_ok(&staging_path, MIN_STAGED_CHUNK_BYTES) {
                batch.already_staged += 1;
                continue;
            }
            batch.jobs.push(ChunkJob {
                tile_id: meta.id,
                size_id: meta.size_id,
                x,
                y_top,
                total_chunks: total,
                bbox,
                width_px: chunk_w,
                height_px: chunk_height(chunk_w, &bbox),
                staging_path,
                retries_left: attempts,
                min_bytes: MIN_STAGED_CHUNK_BYTES,
            });
        }
    }
    batch
}

/// Produce the single coarse pre-coverage chunk for a tile, or `None` when
/// a plausible staging file already exists or the tile is degenerate.
pub fn precover_job(
    meta: &TileMetadata,
    level: u8,
    staging_dir: &Path,
    attempts: u32,
) -> Option<ChunkJob> {
    let dlon = meta.lon_ur - meta.lon_ll;
    if dlon.abs() < MIN_LON_SPAN {
        return None;
    }
    let bbox = meta.bbox();
    let width_px = width_px_for_size(level);
    let staging_path = staging_dir.join(staging_filename(meta.id, level, 1, 1, 1));
    if staged_ok(&staging_path, MIN_STAGED_PRECOVER_BYTES) {
        return None;
    }
    Some(ChunkJob {
        tile_id: meta.id,
        size_id: level,
        x: 1,
        y_top: 1,
        total_chunks: 1,
        bbox,
        width_px,
        height_px: chunk_height(width_px, &bbox),
        staging_path,
        retries_left: attempts,
        min_bytes: MIN_STAGED_PRECOVER_BYTES,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_partitions_tile_exactly() {
        let meta = TileMetadata::new(47.25, 11.31, 4); // cols = 4
        let dir = tempfile::tempdir().unwrap();
        let batch = chunk_jobs(&meta, dir.path(), 3);
        assert_eq!(batch.jobs.len(), 16);
        assert_eq!(batch.already_staged, 0);

        // Union of bboxes equals the tile bbox; edges shared, no overlap.
        let mut min_lon = f64::MAX;
        let mut max_lon = f64::MIN;
        let mut min_lat = f64::MAX;
        let mut max_lat = f64::MIN;
        let mut area = 0.0;
        for j in &batch.jobs {
            min_lon = min_lon.min(j.bbox.lon_ll);
            max_lon = max_lon.max(j.bbox.lon_ur);
            min_lat = min_lat.min(j.bbox.lat_ll);
            max_lat = max_lat.max(j.bbox.lat_ur);
            area += (j.bbox.lon_ur - j.bbox.lon_ll) * (j.bbox.lat_ur - j.bbox.lat_ll);
        }
        assert_eq!(min_lon, meta.lon_ll);
        assert_eq!(max_lon, meta.lon_ur);
        assert_eq!(min_lat, meta.lat_ll);
        assert_eq!(max_lat, meta.lat_ur);
        let tile_area = (meta.lon_ur - meta.lon_ll) * (meta.lat_ur - meta.lat_ll);
        assert!((area - tile_area).abs() < 1e-12);

        // Pairwise interiors are disjoint.
        for (i, a) in batch.jobs.iter().enumerate() {
            for b in batch.jobs.iter().skip(i + 1) {
                let overlap_lon =
                    a.bbox.lon_ll < b.bbox.lon_ur && b.bbox.lon_ll < a.bbox.lon_ur;
                let overlap_lat =
                    a.bbox.lat_ll < b.bbox.lat_ur && b.bbox.lat_ll < a.bbox.lat_ur;
                assert!(!(overlap_lon && overlap_lat));
            }
        }
    }

    #[test]
    fn filename_scheme_and_flip() {
        let meta = TileMetadata::new(47.25, 11.31, 3); // cols = 2
        let dir = tempfile::tempdir().unwrap();
        let batch = chunk_jobs(&meta, dir.path(), 3);
        assert_eq!(batch.jobs.len(), 4);

        // Bottom row (y=1) encodes as y_top = cols.
        let bottom_left = batch
            .jobs
            .iter()
            .find(|j| j.bbox.lat_ll == meta.lat_ll && j.bbox.lon_ll == meta.lon_ll)
            .unwrap();
        let name = bottom_left.staging_path.file_name().unwrap().to_str().unwrap();
        assert_eq!(name, format!("{}_3_4_2_1.png", meta.id));
        assert_eq!(bottom_left.y_top, 2);

        // Pixel sizes: 4096/2 wide, half as tall (0.125 lon vs 0.0625 lat).
        assert_eq!(bottom_left.width_px, 2048);
        assert_eq!(bottom_left.height_px, 1024);
    }

    #[test]
    fn staged_files_are_skipped() {
        let meta = TileMetadata::new(47.25, 11.31, 3);
        let dir = tempfile::tempdir().unwrap();
        let name = staging_filename(meta.id, 3, 4, 2, 1);
        fs::write(dir.path().join(&name), vec![0u8; 2048]).unwrap();
        // Too small to count.
        let name_small = staging_filename(meta.id, 3, 4, 1, 1);
        fs::write(dir.path().join(&name_small), vec![0u8; 100]).unwrap();

        let batch = chunk_jobs(&meta, dir.path(), 3);
        assert_eq!(batch.already_staged, 1);
        assert_eq!(batch.jobs.len(), 3);
    }

    #[test]
    fn precover_is_single_coarse_chunk() {
        let meta = TileMetadata::new(47.25, 11.31, 5);
        let dir = tempfile::tempdir().unwrap();
        let job = precover_job(&meta, 1, dir.path(), 3).unwrap();
        assert_eq!(job.total_chunks, 1);
        assert_eq!(job.size_id, 1);
        assert_eq!(job.width_px, 1024);
        assert_eq!(job.height_px, 512);
        let name = job.staging_path.file_name().unwrap().to_str().unwrap();
        assert_eq!(name, format!("{}_1_1_1_1.png", meta.id));

        // A tiny staged file satisfies the pre-coverage pass.
        fs::write(&job.staging_path, vec![0u8; 64]).unwrap();
        assert!(precover_job(&meta, 1, dir.path(), 3).is_none());
    }

    #[test]
    fn degenerate_tile_is_dropped() {
        let mut meta = TileMetadata::new(47.25, 11.31, 3);
        meta.lon_ur = meta.lon_ll;
        assert!(chunk_jobs(&meta, Path::new("/tmp"), 3).jobs.is_empty());
        assert!(precover_job(&meta, 0, Path::new("/tmp"), 3).is_none());
    }
}
