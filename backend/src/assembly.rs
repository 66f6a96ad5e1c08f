use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use image::RgbaImage;
use regex::Regex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::dds;
use crate::geodesy::TileMetadata;
use crate::placement::{OverwriteMode, Placer};
use crate::state::AppState;

/// Scans without progress before a stuck group is dropped.
const MAX_ASSEMBLY_PASSES: u32 = 8;

/// (tile_id, size_id, total_chunks)
type GroupKey = (u64, u8, u32);

#[derive(Debug)]
struct GroupFile {
    y_top: u32,
    x: u32,
    path: PathBuf,
    len: u64,
}

/// Periodic staging-directory scanner that mosaics complete chunk groups
/// into tiles, encodes them and hands them to placement.
pub struct AssemblyMonitor {
    staging_dir: PathBuf,
    placer: Arc<Placer>,
    state: Arc<AppState>,
    cfg: Arc<Config>,
    over: OverwriteMode,
    /// Groups currently being assembled.
    claimed: HashSet<GroupKey>,
    /// Groups already assembled; never re-entered.
    seen: HashSet<GroupKey>,
    /// Failed passes per group, for the stall cutoff.
    stalls: HashMap<GroupKey, u32>,
    pattern: Regex,
}

impl AssemblyMonitor {
    pub fn new(placer: Arc<Placer>, state: Arc<AppState>, cfg: Arc<Config>) -> Self {
        let over = OverwriteMode::from_u8(cfg.over).unwrap_or(OverwriteMode::IfLarger);
        AssemblyMonitor {
            staging_dir: cfg.staging_dir(),
            placer,
            state,
            cfg,
            over,
            claimed: HashSet::new(),
            seen: HashSet::new(),
            stalls: HashMap::new(),
            pattern: Regex::new(r"^(\d+)_(\d+)_([1-9]\d*)_([1-9]\d*)_([1-9]\d*)\.png$").unwrap(),
        }
    }

    /// Poll loop; runs until shutdown.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(
            self.cfg.monitor_interval.max(1),
        ));
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    tokio::task::block_in_place(|| self.scan_once());
                }
            }
        }
        debug!("assembly monitor stopped");
    }

    /// One scan pass. Returns the number of tiles assembled and placed.
    pub fn scan_once(&mut self) -> usize {
        let groups = self.collect_groups();
        let mut assembled = 0;
        for (key, files) in groups {
            if self.seen.contains(&key) {
                continue;
            }
            let (tile_id, size_id, total) = key;
            if files.len() as u32 != total
                || files.iter().any(|f| f.len < self.cfg.min_chunk_bytes)
            {
                continue;
            }
            if !self.claimed.insert(key) {
                continue;
            }
            let outcome = self.assemble(tile_id, size_id, total, &files);
            self.claimed.remove(&key);
            match outcome {
                Ok(()) => {
                    self.seen.insert(key);
                    self.stalls.remove(&key);
                    for f in &files {
                        fs::remove_file(&f.path).ok();
                    }
                    assembled += 1;
                }
                Err(e) => {
                    let stalls = self.stalls.entry(key).or_insert(0);
                    *stalls += 1;
                    if *stalls >= MAX_ASSEMBLY_PASSES {
                        warn!("dropping stuck group for tile {tile_id}: {e}");
                        self.seen.insert(key);
                        self.state.set_tile_status(tile_id, "failed");
                        for f in &files {
                            fs::remove_file(&f.path).ok();
                        }
                    } else {
                        debug!("assembly of tile {tile_id} postponed: {e}");
                    }
                }
            }
        }
        assembled
    }

    /// Group staged chunk files by (tile, size, total).
    fn collect_groups(&self) -> HashMap<GroupKey, Vec<GroupFile>> {
        let mut groups: HashMap<GroupKey, Vec<GroupFile>> = HashMap::new();
        let Ok(entries) = fs::read_dir(&self.staging_dir) else {
            return groups;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(caps) = self.pattern.captures(name) else {
                continue;
            };
            let parse = |i: usize| caps.get(i).unwrap().as_str();
            let (Ok(tile_id), Ok(size_id), Ok(total), Ok(y_top), Ok(x)) = (
                parse(1).parse::<u64>(),
                parse(2).parse::<u8>(),
                parse(3).parse::<u32>(),
                parse(4).parse::<u32>(),
                parse(5).parse::<u32>(),
            ) else {
                continue;
            };
            let len = entry.metadata().map(|m| m.len()).unwrap_or(0);
            groups.entry((tile_id, size_id, total)).or_default().push(GroupFile {
                y_top,
                x,
                path: entry.path(),
                len,
            });
        }
        groups
    }

    /// Mosaic a complete group and hand the tile to placement.
    fn assemble(
        &self,
        tile_id: u64,
        size_id: u8,
        total: u32,
        files: &[GroupFile],
    ) -> anyhow::Result<()> {
        let cols = (total as f64).sqrt().round() as u32;
        if cols * cols != total {
            anyhow::bail!("chunk count {total} is not a square");
        }

        let (chunk_w, chunk_h) = image::image_dimensions(&files[0].path)?;
        let mut canvas = RgbaImage::new(chunk_w * cols, chunk_h * cols);
        for f in files {
            if f.x < 1 || f.x > cols || f.y_top < 1 || f.y_top > cols {
                anyhow::bail!("chunk ({}, {}) outside the {cols}x{cols} grid", f.x, f.y_top);
            }
            let img = image::open(&f.path)?.to_rgba8();
            if img.dimensions() != (chunk_w, chunk_h) {
                anyhow::bail!(
                    "chunk {} is {:?}, expected {:?}",
                    f.path.display(),
                    img.dimensions(),
                    (chunk_w, chunk_h)
                );
            }
            let x0 = (f.x - 1) as i64 * chunk_w as i64;
            let y0 = (f.y_top - 1) as i64 * chunk_h as i64;
            image::imageops::replace(&mut canvas, &img, x0, y0);
        }

        self.state.set_tile_status(tile_id, "assembling");
        let meta = TileMetadata::from_id(tile_id, size_id);
        let staged = self.stage_tile(tile_id, &canvas)?;
        // The job that queued the tile may carry its own overwrite policy.
        let over = self
            .state
            .tile_over(tile_id)
            .and_then(OverwriteMode::from_u8)
            .unwrap_or(self.over);
        self.placer.place(&staged, &meta, over)?;
        self.state.set_tile_status(tile_id, "placed");
        self.state.log_line(format!(
            "tile {tile_id} assembled at {}x{}",
            canvas.width(),
            canvas.height()
        ));
        info!("tile {tile_id} assembled ({} chunks)", total);
        Ok(())
    }

    /// Encode the canvas next to the chunks: DDS via a temp name, with a
    /// PNG fallback when the encoder fails or PNG output is configured.
    fn stage_tile(&self, tile_id: u64, canvas: &RgbaImage) -> anyhow::Result<PathBuf> {
        if !self.cfg.png {
            let tmp = self.staging_dir.join(format!("{tile_id}.dds.tmp"));
            let final_dds = self.staging_dir.join(format!("{tile_id}.dds"));
            match dds::convert_image(canvas, &tmp) {
                Ok(()) => {
                    fs::rename(&tmp, &final_dds)?;
                    return Ok(final_dds);
                }
                Err(e) => {
                    fs::remove_file(&tmp).ok();
                    warn!("DDS encode for tile {tile_id} failed ({e}), saving PNG");
                }
            }
        }
        let path = self.staging_dir.join(format!("{tile_id}.png"));
        canvas.save(&path)?;
        Ok(path)
    }
}
