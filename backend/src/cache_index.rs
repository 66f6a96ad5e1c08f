use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Local};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::dds;
use crate::geodesy::{self, TileMetadata};
use crate::png;

pub const PROGRAM_VERSION: &str = env!("CARGO_PKG_VERSION");

const TIMESTAMP_FMT: &str = "%Y-%m-%d %H:%M:%S";

/// One discovered tile file. Keyed by absolute path in the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub id: u64,
    /// File size in bytes.
    pub size: u64,
    pub last_modified: String,
    #[serde(rename = "sizeId")]
    pub size_id: u8,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexMetadata {
    program_version: String,
    scanned_paths: Vec<String>,
    last_scan: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexFile {
    metadata: IndexMetadata,
    files: BTreeMap<String, CacheRecord>,
}

#[derive(Debug, Serialize)]
struct CoverageEntry {
    id: u64,
    bbox: geodesy::Bbox,
    #[serde(rename = "sizeId")]
    size_id: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_modified: Option<String>,
}

/// A restore candidate handed to the fallback manager.
#[derive(Debug, Clone)]
pub struct CachedTile {
    pub path: PathBuf,
    pub record: CacheRecord,
    pub in_final_tree: bool,
}

/// Process-wide index of tile files under the final and backup trees.
/// All access goes through one mutex; writers persist with temp+rename.
pub struct CacheIndex {
    files: Mutex<HashMap<PathBuf, CacheRecord>>,
    index_path: PathBuf,
    coverage_path: PathBuf,
    final_root: PathBuf,
    backup_root: PathBuf,
    filename_re: Regex,
}

impl CacheIndex {
    pub fn new(
        index_path: PathBuf,
        coverage_path: PathBuf,
        final_root: PathBuf,
        backup_root: PathBuf,
    ) -> Self {
        CacheIndex {
            files: Mutex::new(HashMap::new()),
            index_path,
            coverage_path,
            final_root,
            backup_root,
            filename_re: Regex::new(r"^\d{7}\.(dds|png)$").unwrap(),
        }
    }

    pub fn final_root(&self) -> &Path {
        &self.final_root
    }

    pub fn backup_root(&self) -> &Path {
        &self.backup_root
    }

    fn scanned_paths(&self) -> Vec<String> {
        vec![
            self.final_root.to_string_lossy().into_owned(),
            self.backup_root.to_string_lossy().into_owned(),
        ]
    }

    /// Load the persisted index, falling back to a full rescan when the
    /// file is missing, unparseable, or was written by a different program
    /// version or root set.
    pub fn load_or_rebuild(&self) {
        match fs::read_to_string(&self.index_path) {
            Ok(raw) => match serde_json::from_str::<IndexFile>(&raw) {
                Ok(parsed)
                    if parsed.metadata.program_version == PROGRAM_VERSION
                        && parsed.metadata.scanned_paths == self.scanned_paths() =>
                {
                    let mut map = self.files.lock().unwrap();
                    *map = parsed
                        .files
                        .into_iter()
                        .map(|(k, v)| (PathBuf::from(k), v))
                        .collect();
                    info!(entries = map.len(), "cache index loaded");
                    return;
                }
                Ok(_) => info!("cache index metadata changed, rebuilding"),
                Err(e) => warn!("cache index unreadable ({e}), rebuilding"),
            },
            Err(_) => debug!("no cache index at {}", self.index_path.display()),
        }
        self.rescan();
        self.save();
    }

    /// Walk both roots and refresh the in-memory map. Returns the number of
    /// records added or updated.
    pub fn rescan(&self) -> usize {
        let mut found = HashMap::new();
        for root in [&self.final_root, &self.backup_root] {
            self.scan_dir(root, &mut found);
        }
        let mut map = self.files.lock().unwrap();
        let mut changed = 0;
        for (path, rec) in found {
            if map.get(&path) != Some(&rec) {
                changed += 1;
            }
            map.insert(path, rec);
        }
        // Drop records whose file disappeared.
        map.retain(|path, _| path.exists());
        changed
    }

    fn scan_dir(&self, dir: &Path, out: &mut HashMap<PathBuf, CacheRecord>) {
        let Ok(entries) = fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                self.scan_dir(&path, out);
            } else if let Some(rec) = self.record_for(&path) {
                out.insert(path, rec);
            }
        }
    }

    /// Build a record for a tile file, or `None` when the name, location or
    /// content disqualifies it.
    fn record_for(&self, path: &Path) -> Option<CacheRecord> {
        let name = path.file_name()?.to_str()?;
        if !self.filename_re.is_match(name) {
            return None;
        }
        let id: u64 = name.split('.').next()?.parse().ok()?;

        // The directory labels must agree with the ID.
        let coords = geodesy::coord_from_index(id);
        let dir1 = path.parent()?.file_name()?.to_str()?;
        let dir10 = path.parent()?.parent()?.file_name()?.to_str()?;
        if dir1 != coords.dir1 || dir10 != coords.dir10 {
            debug!("skipping {}: directory does not match id", path.display());
            return None;
        }

        let (width, height) = if name.ends_with(".dds") {
            dds::read_dimensions(path).ok()?
        } else {
            png::probe_file(path).ok().flatten()?
        };

        let meta = fs::metadata(path).ok()?;
        let mtime: DateTime<Local> = meta.modified().ok()?.into();
        Some(CacheRecord {
            id,
            size: meta.len(),
            last_modified: mtime.format(TIMESTAMP_FMT).to_string(),
            size_id: geodesy::size_id_for_width(width)
                .unwrap_or_else(|| nearest_size_id(width)),
            width,
            height,
        })
    }

    /// Register a freshly placed file. Used by placement after each move.
    pub fn note_file(&self, path: &Path) {
        if let Some(rec) = self.record_for(path) {
            self.files.lock().unwrap().insert(path.to_path_buf(), rec);
        }
    }

    pub fn forget_file(&self, path: &Path) {
        self.files.lock().unwrap().remove(path);
    }

    pub fn len(&self) -> usize {
        self.files.lock().unwrap().len()
    }

    /// Highest size_id present in the final tree for a tile.
    pub fn best_final_size(&self, id: u64) -> Option<u8> {
        let map = self.files.lock().unwrap();
        map.iter()
            .filter(|(p, r)| r.id == id && p.starts_with(&self.final_root))
            .map(|(_, r)| r.size_id)
            .max()
    }

    /// Find a cached tile for `id`, trying size classes nearest to
    /// `size_id` first (offsets 0, -1, +1, -2, +2, ...). Final-tree records
    /// outrank backup-tree records at the same class. Classes above the
    /// request are only considered when `allow_higher` is set.
    pub fn find_cached(&self, id: u64, size_id: u8, allow_higher: bool) -> Option<CachedTile> {
        let map = self.files.lock().unwrap();
        for offset in 0..=geodesy::MAX_SIZE_ID as i32 {
            for signed in [-offset, offset] {
                let candidate = size_id as i32 + signed;
                if candidate < 0 || candidate > geodesy::MAX_SIZE_ID as i32 {
                    continue;
                }
                if signed > 0 && !allow_higher {
                    continue;
                }
                let wanted = candidate as u8;
                let mut best: Option<CachedTile> = None;
                for (path, rec) in map.iter() {
                    if rec.id != id || rec.size_id != wanted {
                        continue;
                    }
                    let in_final = path.starts_with(&self.final_root);
                    if best.as_ref().map(|b| !b.in_final_tree && in_final).unwrap_or(true) {
                        best = Some(CachedTile {
                            path: path.clone(),
                            record: rec.clone(),
                            in_final_tree: in_final,
                        });
                    }
                }
                if let Some(found) = best {
                    return Some(found);
                }
                if signed == 0 {
                    // Offset zero only has one candidate class.
                    break;
                }
            }
        }
        None
    }

    /// Persist the index as JSON (temp+rename) and refresh the coverage
    /// snapshot. Failures are logged and never block job progress.
    pub fn save(&self) {
        let body = {
            let map = self.files.lock().unwrap();
            let files: BTreeMap<String, CacheRecord> = map
                .iter()
                .map(|(k, v)| (k.to_string_lossy().into_owned(), v.clone()))
                .collect();
            IndexFile {
                metadata: IndexMetadata {
                    program_version: PROGRAM_VERSION.to_string(),
                    scanned_paths: self.scanned_paths(),
                    last_scan: Local::now().format(TIMESTAMP_FMT).to_string(),
                },
                files,
            }
        };
        if let Err(e) = write_json_atomic(&self.index_path, &body) {
            warn!("failed to save cache index: {e}");
        }
        self.write_coverage();
    }

    /// Emit `coverage.json`: one entry per tile ID, choosing the record by
    /// (final tree over backup tree, then highest size_id).
    pub fn write_coverage(&self) {
        let entries = {
            let map = self.files.lock().unwrap();
            let mut chosen: HashMap<u64, (bool, CacheRecord)> = HashMap::new();
            for (path, rec) in map.iter() {
                let in_final = path.starts_with(&self.final_root);
                let better = match chosen.get(&rec.id) {
                    Some((best_final, best)) => {
                        (in_final && !*best_final)
                            || (in_final == *best_final && rec.size_id > best.size_id)
                    }
                    None => true,
                };
                if better {
                    chosen.insert(rec.id, (in_final, rec.clone()));
                }
            }
            let mut entries: Vec<CoverageEntry> = chosen
                .into_iter()
                .map(|(id, (_, rec))| CoverageEntry {
                    id,
                    bbox: TileMetadata::from_id(id, rec.size_id).bbox(),
                    size_id: rec.size_id,
                    last_modified: Some(rec.last_modified),
                })
                .collect();
            entries.sort_by_key(|e| e.id);
            entries
        };
        if let Err(e) = write_json_atomic(&self.coverage_path, &entries) {
            warn!("failed to save coverage snapshot: {e}");
        }
    }
}

fn nearest_size_id(width: u32) -> u8 {
    let mut best = 0u8;
    for (i, w) in geodesy::SIZE_WIDTHS.iter().enumerate() {
        if *w <= width {
            best = i as u8;
        }
    }
    best
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Background rescan loop. Rewrites the index only when something changed.
pub async fn run_rescan_task(
    index: std::sync::Arc<CacheIndex>,
    interval_secs: u64,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    let mut ticker =
        tokio::time::interval(std::time::Duration::from_secs(interval_secs.max(10)));
    ticker.tick().await; // immediate first tick
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = ticker.tick() => {
                let idx = index.clone();
                let changed =
                    tokio::task::spawn_blocking(move || idx.rescan()).await.unwrap_or(0);
                if changed > 0 {
                    debug!(changed, "cache rescan found updates");
                    index.save();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    struct Fixture {
        _dir: tempfile::TempDir,
        index: CacheIndex,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("Orthophotos");
        let backup = dir.path().join("Orthophotos-saved");
        let index = CacheIndex::new(
            dir.path().join("index.json"),
            dir.path().join("coverage.json"),
            root,
            backup,
        );
        Fixture { _dir: dir, index }
    }

    /// Write a DDS whose header advertises `width` without paying for a
    /// full-size encode: encode a 4x4 stub and patch the dimension fields.
    fn put_tile(root: &Path, extra: Option<&str>, id: u64, width: u32) -> PathBuf {
        let c = geodesy::coord_from_index(id);
        let mut dir = root.to_path_buf();
        if let Some(seg) = extra {
            dir = dir.join(seg);
        }
        let dir = dir.join(&c.dir10).join(&c.dir1);
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("{id}.dds"));
        let img = RgbaImage::from_pixel(4, 4, Rgba([9, 9, 9, 255]));
        let mut bytes = dds::encode(&img);
        bytes[12..16].copy_from_slice(&(width / 2).to_le_bytes());
        bytes[16..20].copy_from_slice(&width.to_le_bytes());
        fs::write(&path, bytes).unwrap();
        path
    }

    fn sample_id() -> u64 {
        geodesy::index(47.25, 11.31)
    }

    #[test]
    fn scan_indexes_well_named_files_only() {
        let f = fixture();
        let id = sample_id();
        let good = put_tile(f.index.final_root(), None, id, 512);
        // Wrong directory for this id.
        let bad_dir = f.index.final_root().join("e000n00").join("e000n00");
        fs::create_dir_all(&bad_dir).unwrap();
        let img = RgbaImage::from_pixel(512, 256, Rgba([1, 1, 1, 255]));
        dds::convert_image(&img, &bad_dir.join(format!("{id}.dds"))).unwrap();
        // Bad filename.
        fs::write(good.parent().unwrap().join("notatile.dds"), b"junk").unwrap();

        f.index.rescan();
        assert_eq!(f.index.len(), 1);
        assert_eq!(f.index.best_final_size(id), Some(0));
    }

    #[test]
    fn save_and_reload_round_trip() {
        let f = fixture();
        let id = sample_id();
        put_tile(f.index.final_root(), None, id, 1024);
        f.index.rescan();
        f.index.save();

        let reloaded = CacheIndex::new(
            f.index.index_path.clone(),
            f.index.coverage_path.clone(),
            f.index.final_root.clone(),
            f.index.backup_root.clone(),
        );
        reloaded.load_or_rebuild();
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.best_final_size(id), Some(1));
    }

    #[test]
    fn version_mismatch_triggers_rebuild() {
        let f = fixture();
        let id = sample_id();
        put_tile(f.index.final_root(), None, id, 512);

        let stale = IndexFile {
            metadata: IndexMetadata {
                program_version: "0.0.0-old".to_string(),
                scanned_paths: f.index.scanned_paths(),
                last_scan: "2000-01-01 00:00:00".to_string(),
            },
            files: BTreeMap::new(),
        };
        write_json_atomic(&f.index.index_path, &stale).unwrap();

        f.index.load_or_rebuild();
        // The stale (empty) file list was discarded in favor of a scan.
        assert_eq!(f.index.len(), 1);
    }

    #[test]
    fn coverage_prefers_final_tree_then_size() {
        let f = fixture();
        let id = sample_id();
        put_tile(f.index.final_root(), None, id, 1024);
        put_tile(f.index.backup_root(), Some("8192"), id, 8192);
        f.index.rescan();
        f.index.save();

        let raw = fs::read_to_string(&f.index.coverage_path).unwrap();
        let entries: Vec<serde_json::Value> = serde_json::from_str(&raw).unwrap();
        assert_eq!(entries.len(), 1);
        // Final-tree 1024 wins over backup 8192.
        assert_eq!(entries[0]["sizeId"], 1);
        assert_eq!(entries[0]["id"], id);
        assert!(entries[0]["bbox"]["latLL"].is_number());
    }

    #[test]
    fn find_cached_nearest_first() {
        let f = fixture();
        let id = sample_id();
        put_tile(f.index.backup_root(), Some("2048"), id, 2048);
        put_tile(f.index.backup_root(), Some("8192"), id, 8192);
        f.index.rescan();

        // Request size 3: nearest is 2 (below) before 4 (above).
        let hit = f.index.find_cached(id, 3, true).unwrap();
        assert_eq!(hit.record.size_id, 2);
        assert!(!hit.in_final_tree);

        // Request size 5 disallowing higher: only ids below qualify.
        let hit = f.index.find_cached(id, 5, false).unwrap();
        assert_eq!(hit.record.size_id, 4);

        assert!(f.index.find_cached(id + 1, 3, true).is_none());
    }
}
