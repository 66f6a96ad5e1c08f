use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tracing::{debug, warn};

use crate::cache_index::CacheIndex;
use crate::dds;
use crate::geodesy::TileMetadata;
use crate::png;

/// Overwrite policy at placement time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverwriteMode {
    /// 0: never touch an existing tile.
    Keep,
    /// 1: replace only when the incoming tile is wider.
    IfLarger,
    /// 2: always replace, moving the old tile to the backup tree.
    Always,
}

impl OverwriteMode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(OverwriteMode::Keep),
            1 => Some(OverwriteMode::IfLarger),
            2 => Some(OverwriteMode::Always),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementOutcome {
    /// Source moved to the final tree.
    Placed,
    /// Existing tile kept; source removed.
    Skipped,
    /// Existing tile moved to the backup tree, then source placed.
    BackedUpThenPlaced,
    /// Source and destination are the same file.
    Identical,
}

/// Moves assembled tiles into the scenery tree, honoring the overwrite
/// policy and keeping the cache index current.
pub struct Placer {
    final_root: PathBuf,
    backup_root: PathBuf,
    index: Arc<CacheIndex>,
    /// When false (--nosave) replaced tiles are deleted instead of archived.
    backups: bool,
}

impl Placer {
    pub fn new(final_root: PathBuf, backup_root: PathBuf, index: Arc<CacheIndex>) -> Self {
        Placer {
            final_root,
            backup_root,
            index,
            backups: true,
        }
    }

    pub fn without_backups(mut self) -> Self {
        self.backups = false;
        self
    }

    pub fn final_root(&self) -> &Path {
        &self.final_root
    }

    /// Destination path of a tile in the final tree, for a given extension.
    pub fn destination(&self, meta: &TileMetadata, ext: &str) -> PathBuf {
        self.final_root
            .join(meta.dir10())
            .join(meta.dir1())
            .join(format!("{}.{ext}", meta.id))
    }

    /// Place `source` (an assembled `.dds` or `.png`) for `meta`.
    pub fn place(
        &self,
        source: &Path,
        meta: &TileMetadata,
        over: OverwriteMode,
    ) -> Result<PlacementOutcome> {
        let ext = source
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("dds")
            .to_string();
        let dest = self.destination(meta, &ext);
        if dest == source {
            return Ok(PlacementOutcome::Identical);
        }

        // An existing tile may carry either extension.
        let existing = ["dds", "png"]
            .iter()
            .map(|e| self.destination(meta, e))
            .find(|p| p.exists());

        let Some(existing) = existing else {
            self.move_into_place(source, &dest)?;
            return Ok(PlacementOutcome::Placed);
        };

        match over {
            OverwriteMode::Keep => {
                fs::remove_file(source).ok();
                debug!("kept existing {}", existing.display());
                Ok(PlacementOutcome::Skipped)
            }
            OverwriteMode::IfLarger => {
                let Some(existing_width) = measure_width(&existing) else {
                    // Unreadable destination is treated as corrupt.
                    warn!("removing unreadable tile {}", existing.display());
                    self.index.forget_file(&existing);
                    fs::remove_file(&existing).ok();
                    self.move_into_place(source, &dest)?;
                    return Ok(PlacementOutcome::Placed);
                };
                let new_width = measure_width(source).unwrap_or(meta.width_px);
                if new_width <= existing_width {
                    fs::remove_file(source).ok();
                    return Ok(PlacementOutcome::Skipped);
                }
                self.backup(&existing, existing_width, meta)?;
                self.move_into_place(source, &dest)?;
                Ok(PlacementOutcome::BackedUpThenPlaced)
            }
            OverwriteMode::Always => {
                match measure_width(&existing) {
                    Some(width) => self.backup(&existing, width, meta)?,
                    None => {
                        warn!("removing unreadable tile {}", existing.display());
                        self.index.forget_file(&existing);
                        fs::remove_file(&existing).ok();
                    }
                }
                self.move_into_place(source, &dest)?;
                Ok(PlacementOutcome::BackedUpThenPlaced)
            }
        }
    }

    fn move_into_place(&self, source: &Path, dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        atomic_move(source, dest)?;
        self.index.note_file(dest);
        self.index.save();
        Ok(())
    }

    /// Move an existing tile to `backup/<width>/dir10/dir1/<id>.<ext>`.
    fn backup(&self, existing: &Path, width: u32, meta: &TileMetadata) -> Result<()> {
        if !self.backups {
            self.index.forget_file(existing);
            fs::remove_file(existing)?;
            return Ok(());
        }
        let name = existing
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{}.dds", meta.id));
        let backup_path = self
            .backup_root
            .join(width.to_string())
            .join(meta.dir10())
            .join(meta.dir1())
            .join(name);
        if let Some(parent) = backup_path.parent() {
            fs::create_dir_all(parent)?;
        }
        atomic_move(existing, &backup_path)?;
        self.index.forget_file(existing);
        self.index.note_file(&backup_path);
        debug!("backed up {} -> {}", existing.display(), backup_path.display());
        Ok(())
    }
}

/// Width in pixels of a tile file, by reading its header only.
pub fn measure_width(path: &Path) -> Option<u32> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("dds") => dds::read_dimensions(path).ok().map(|(w, _)| w),
        Some("png") => png::probe_file(path).ok().flatten().map(|(w, _)| w),
        _ => None,
    }
}

/// Rename within a filesystem; fall back to copy+rename+remove across
/// devices. A failed temp write is cleaned up and retried once.
pub fn atomic_move(src: &Path, dst: &Path) -> Result<()> {
    if fs::rename(src, dst).is_ok() {
        return Ok(());
    }
    for attempt in 0..2 {
        let tmp = dst.with_extension("tmp");
        match fs::copy(src, &tmp).and_then(|_| fs::rename(&tmp, dst)) {
            Ok(_) => {
                fs::remove_file(src).ok();
                return Ok(());
            }
            Err(e) => {
                fs::remove_file(&tmp).ok();
                if attempt == 1 {
                    bail!(
                        "failed to move {} to {}: {e}",
                        src.display(),
                        dst.display()
                    );
                }
            }
        }
    }
    unreachable!()
}
