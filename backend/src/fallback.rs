use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::cache_index::CacheIndex;
use crate::config::Config;
use crate::downloader::{Downloader, PermanentFailure, PriorityClass};
use crate::geodesy::TileMetadata;
use crate::jobs;
use crate::placement::{OverwriteMode, Placer};
use crate::state::{AppState, now_ms};

/// Consumes permanent download failures: restores the nearest cached
/// resolution when one exists, otherwise requeues the tile one class lower.
pub struct FallbackManager {
    index: Arc<CacheIndex>,
    placer: Arc<Placer>,
    downloader: Arc<Downloader>,
    state: Arc<AppState>,
    cfg: Arc<Config>,
    staging_dir: PathBuf,
    /// Events already handled this session, keyed by (tile_id, size_id).
    seen: HashSet<(u64, u8)>,
    /// Whether a cached tile above the requested class satisfies a request.
    allow_higher: bool,
}

impl FallbackManager {
    pub fn new(
        index: Arc<CacheIndex>,
        placer: Arc<Placer>,
        downloader: Arc<Downloader>,
        state: Arc<AppState>,
        cfg: Arc<Config>,
    ) -> Self {
        let staging_dir = cfg.staging_dir();
        FallbackManager {
            index,
            placer,
            downloader,
            state,
            cfg,
            staging_dir,
            seen: HashSet::new(),
            allow_higher: true,
        }
    }

    pub async fn run(
        mut self,
        mut rx: mpsc::Receiver<PermanentFailure>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                event = rx.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => break,
                },
            }
        }
        debug!("fallback manager stopped");
    }

    /// Handle one unique failure event.
    pub async fn handle(&mut self, event: PermanentFailure) {
        if !self.seen.insert((event.tile_id, event.size_id)) {
            return;
        }

        // Anything already in the final tree satisfies the event; the
        // nearest-first scan below only restores from the backup tree.
        if let Some(have) = self.index.best_final_size(event.tile_id) {
            info!(
                "tile {} already satisfied by final tree at size {have}",
                event.tile_id
            );
            self.state.set_tile_status(event.tile_id, "cached");
            return;
        }

        if let Some(cached) = self
            .index
            .find_cached(event.tile_id, event.size_id, self.allow_higher)
        {
            let meta = TileMetadata::from_id(event.tile_id, cached.record.size_id);
            match self.placer.place(&cached.path, &meta, OverwriteMode::Keep) {
                Ok(outcome) => {
                    self.index.forget_file(&cached.path);
                    info!(
                        "restored tile {} from cache at size {} ({outcome:?})",
                        event.tile_id, cached.record.size_id
                    );
                    self.state.set_tile_status(event.tile_id, "restored");
                    self.state
                        .log_line(format!("tile {} restored from cache", event.tile_id));
                    return;
                }
                Err(e) => {
                    warn!("cache restore for tile {} failed: {e}", event.tile_id);
                    // Fall through to the downgrade path.
                }
            }
        }

        if event.size_id == 0 {
            warn!("tile {} failed at the lowest resolution, giving up", event.tile_id);
            self.state.set_tile_status(event.tile_id, "abandoned");
            self.state
                .log_line(format!("tile {} abandoned", event.tile_id));
            return;
        }

        // Requeue one class lower on the bulk queue.
        let lower = event.size_id - 1;
        purge_staged_chunks(&self.staging_dir, event.tile_id, event.size_id);
        let meta = TileMetadata::from_id(event.tile_id, lower);
        self.state
            .register_tile(meta.id, lower, meta.cols, now_ms(), self.cfg.over);
        self.state.set_tile_status(meta.id, "downgraded");
        let batch = jobs::chunk_jobs(&meta, &self.staging_dir, self.cfg.attempts);
        info!(
            "requeueing tile {} at size {} ({} chunks)",
            event.tile_id,
            lower,
            batch.jobs.len()
        );
        for job in batch.jobs {
            self.downloader.enqueue(job, PriorityClass::Low).await;
        }
    }
}

/// Remove staged chunk files of a (tile, size) pair.
pub fn purge_staged_chunks(staging_dir: &Path, tile_id: u64, size_id: u8) {
    let prefix = format!("{tile_id}_{size_id}_");
    let Ok(entries) = fs::read_dir(staging_dir) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        if name.to_string_lossy().starts_with(&prefix) {
            fs::remove_file(entry.path()).ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geodesy;
    use crate::mapserver;
    use clap::Parser;
    use image::{Rgba, RgbaImage};

    struct Fixture {
        dir: tempfile::TempDir,
        manager: FallbackManager,
        fail_rx: mpsc::Receiver<PermanentFailure>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("Orthophotos");
        let backup = dir.path().join("Orthophotos-saved");
        let args = crate::config::Args::try_parse_from([
            "photoscenery",
            "--path",
            root.to_str().unwrap(),
        ])
        .unwrap();
        let cfg = Arc::new(Config::from_args(&args).unwrap());
        fs::create_dir_all(cfg.staging_dir()).unwrap();

        let index = Arc::new(CacheIndex::new(
            dir.path().join("index.json"),
            dir.path().join("coverage.json"),
            root.clone(),
            backup.clone(),
        ));
        let placer = Arc::new(Placer::new(root, backup, index.clone()));
        let (state, _log) = AppState::new();
        let (fail_tx, fail_rx) = mpsc::channel(16);
        let downloader = Downloader::new(
            cfg.clone(),
            mapserver::builtin_servers().remove(0),
            state.clone(),
            fail_tx,
        )
        .unwrap();
        let manager = FallbackManager::new(index, placer, downloader, state, cfg);
        Fixture {
            dir,
            manager,
            fail_rx,
        }
    }

    fn put_backup_tile(f: &Fixture, id: u64, size_id: u8) -> PathBuf {
        let c = geodesy::coord_from_index(id);
        let width = geodesy::width_px_for_size(size_id);
        let dir = f
            .dir
            .path()
            .join("Orthophotos-saved")
            .join(width.to_string())
            .join(&c.dir10)
            .join(&c.dir1);
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("{id}.dds"));
        let img = RgbaImage::from_pixel(4, 4, Rgba([3, 3, 3, 255]));
        let mut bytes = crate::dds::encode(&img);
        bytes[12..16].copy_from_slice(&(width / 2).to_le_bytes());
        bytes[16..20].copy_from_slice(&width.to_le_bytes());
        fs::write(&path, bytes).unwrap();
        path
    }

    fn tile_id() -> u64 {
        geodesy::index(47.25, 11.31)
    }

    #[tokio::test]
    async fn restores_nearest_cached_resolution() {
        let mut f = fixture();
        let id = tile_id();
        let backup_path = put_backup_tile(&f, id, 2);
        f.manager.index.rescan();

        f.manager
            .handle(PermanentFailure {
                tile_id: id,
                size_id: 3,
            })
            .await;

        // Moved from backup into the final tree; no new downloads queued.
        assert!(!backup_path.exists());
        let c = geodesy::coord_from_index(id);
        let final_path = f
            .dir
            .path()
            .join("Orthophotos")
            .join(&c.dir10)
            .join(&c.dir1)
            .join(format!("{id}.dds"));
        assert!(final_path.exists());
        assert_eq!(f.manager.downloader.queue_len(), 0);
    }

    #[tokio::test]
    async fn downgrades_one_class_on_cache_miss() {
        let mut f = fixture();
        let id = tile_id();

        // Stale staged chunk at the failing size must be purged.
        let staged = f
            .manager
            .staging_dir
            .join(jobs::staging_filename(id, 3, 4, 1, 1));
        fs::write(&staged, vec![0u8; 2048]).unwrap();

        f.manager
            .handle(PermanentFailure {
                tile_id: id,
                size_id: 3,
            })
            .await;

        assert!(!staged.exists());
        // size 2 has a single chunk, queued on LOW.
        assert_eq!(f.manager.downloader.queue_len(), 1);
        let job = f.manager.downloader.next_job().await.unwrap();
        assert_eq!(job.size_id, 2);
        assert_eq!(job.tile_id, id);

        // The same event again is deduplicated.
        f.manager
            .handle(PermanentFailure {
                tile_id: id,
                size_id: 3,
            })
            .await;
        assert_eq!(f.manager.downloader.queue_len(), 0);
        let _ = &f.fail_rx;
    }

    #[tokio::test]
    async fn lowest_class_is_abandoned() {
        let mut f = fixture();
        let id = tile_id();
        f.manager
            .handle(PermanentFailure {
                tile_id: id,
                size_id: 0,
            })
            .await;
        assert_eq!(f.manager.downloader.queue_len(), 0);
    }
}
