use photoscenery_shared::{
    ChunkState, ConnectionState, PositionFix, SessionTotalsMsg, TileProgressMsg,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};

/// Capacity of the bounded log-line channel. Producers drop on overflow.
const LOG_CHANNEL_CAPACITY: usize = 200;

/// Event fanned out to status consumers (WebSocket clients).
#[derive(Debug, Clone)]
pub enum StatusEvent {
    Tile(TileProgressMsg),
    Totals(SessionTotalsMsg),
    Log(String),
}

/// Download/assembly progress of one active tile. Guarded by its own mutex;
/// the registry map is guarded by the outer `AppState::tiles` mutex.
#[derive(Debug)]
pub struct TileProgress {
    pub size_id: u8,
    /// Overwrite policy of the job that queued this tile.
    pub over: u8,
    pub total_chunks: u32,
    pub chunks_completed: u32,
    /// `cols x cols` chunk states, top row first.
    pub grid: Vec<Vec<ChunkState>>,
    pub downloaded_bytes: u64,
    pub start_ms: u64,
    pub status: String,
}

impl TileProgress {
    fn to_msg(&self, id: u64) -> TileProgressMsg {
        TileProgressMsg {
            id,
            size_id: self.size_id,
            total_chunks: self.total_chunks,
            chunks_completed: self.chunks_completed,
            grid: self.grid.clone(),
            downloaded_bytes: self.downloaded_bytes,
            start_ms: self.start_ms,
            status: self.status.clone(),
        }
    }
}

pub struct AppState {
    /// Chunks queued or in flight.
    pub pending: AtomicI64,
    /// Chunks downloaded and validated.
    pub done: AtomicU64,
    /// Chunks that permanently failed.
    pub failed: AtomicU64,

    /// Session totals.
    pub files_downloaded: AtomicU64,
    pub bytes_downloaded: AtomicU64,

    /// Per-active-tile progress, keyed by tile ID.
    tiles: Mutex<HashMap<u64, Arc<Mutex<TileProgress>>>>,

    /// Status stream -> WebSocket clients.
    pub status_tx: broadcast::Sender<StatusEvent>,

    /// Bounded log-line channel; overflow drops the line.
    log_tx: mpsc::Sender<String>,

    /// Finished job IDs, drained by `GET /api/completed-jobs`.
    pub completed_jobs: Mutex<Vec<u64>>,
    pub next_job_id: AtomicU64,

    /// RFC 3339 timestamp captured at process start.
    pub start_time: String,

    /// Latest simulator position snapshot; `None` while disconnected.
    pub position: Mutex<Option<PositionFix>>,
    pub connection: Mutex<ConnectionState>,

    /// Broadcast shutdown notifications to long-running background tasks.
    pub shutdown_tx: broadcast::Sender<()>,
}

impl AppState {
    pub fn new() -> (Arc<Self>, mpsc::Receiver<String>) {
        let (log_tx, log_rx) = mpsc::channel(LOG_CHANNEL_CAPACITY);
        let (status_tx, _) = broadcast::channel(1024);
        let (shutdown_tx, _) = broadcast::channel(8);
        let state = Arc::new(AppState {
            pending: AtomicI64::new(0),
            done: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            files_downloaded: AtomicU64::new(0),
            bytes_downloaded: AtomicU64::new(0),
            tiles: Mutex::new(HashMap::new()),
            status_tx,
            log_tx,
            completed_jobs: Mutex::new(Vec::new()),
            next_job_id: AtomicU64::new(0),
            start_time: chrono::Local::now().to_rfc3339(),
            position: Mutex::new(None),
            connection: Mutex::new(ConnectionState::Disconnected),
            shutdown_tx,
        });
        (state, log_rx)
    }

    pub fn shutdown_subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Queue a log line for UI consumers; drops silently when the channel
    /// is full.
    pub fn log_line<S: Into<String>>(&self, line: S) {
        let _ = self.log_tx.try_send(line.into());
    }

    pub fn allocate_job_id(&self) -> u64 {
        self.next_job_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn job_completed(&self, job_id: u64) {
        self.completed_jobs.lock().unwrap().push(job_id);
    }

    pub fn drain_completed_jobs(&self) -> Vec<u64> {
        std::mem::take(&mut *self.completed_jobs.lock().unwrap())
    }

    pub fn inc_pending(&self, n: i64) {
        self.pending.fetch_add(n, Ordering::SeqCst);
    }

    pub fn dec_pending(&self) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn pending_count(&self) -> i64 {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn mark_done(&self) {
        self.done.fetch_add(1, Ordering::SeqCst);
        self.dec_pending();
    }

    pub fn mark_failed(&self) {
        self.failed.fetch_add(1, Ordering::SeqCst);
        self.dec_pending();
    }

    pub fn add_downloaded(&self, bytes: u64) {
        self.files_downloaded.fetch_add(1, Ordering::Relaxed);
        self.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn totals_snapshot(&self) -> SessionTotalsMsg {
        SessionTotalsMsg {
            pending: self.pending.load(Ordering::SeqCst),
            done: self.done.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            files_downloaded: self.files_downloaded.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
        }
    }

    pub fn broadcast_totals(&self) {
        let _ = self.status_tx.send(StatusEvent::Totals(self.totals_snapshot()));
    }

    /// Register a tile with a fresh `cols x cols` pending grid. Re-registering
    /// an active tile keeps the existing entry.
    pub fn register_tile(&self, id: u64, size_id: u8, cols: u32, now_ms: u64, over: u8) {
        let mut map = self.tiles.lock().unwrap();
        map.entry(id).or_insert_with(|| {
            Arc::new(Mutex::new(TileProgress {
                size_id,
                over,
                total_chunks: cols * cols,
                chunks_completed: 0,
                grid: vec![vec![ChunkState::Pending; cols as usize]; cols as usize],
                downloaded_bytes: 0,
                start_ms: now_ms,
                status: "queued".to_string(),
            }))
        });
    }

    fn tile_entry(&self, id: u64) -> Option<Arc<Mutex<TileProgress>>> {
        self.tiles.lock().unwrap().get(&id).cloned()
    }

    /// Update one chunk cell. `x` and `y_top` are 1-based, `y_top` counting
    /// from the top row, matching the staging filename convention.
    pub fn set_chunk_state(&self, id: u64, x: u32, y_top: u32, chunk: ChunkState) {
        let Some(entry) = self.tile_entry(id) else {
            return;
        };
        let msg = {
            let mut tile = entry.lock().unwrap();
            let (row, col) = (y_top as usize - 1, x as usize - 1);
            if row < tile.grid.len() && col < tile.grid[row].len() {
                let prev = tile.grid[row][col];
                tile.grid[row][col] = chunk;
                if chunk == ChunkState::Completed && prev != ChunkState::Completed {
                    tile.chunks_completed += 1;
                }
            }
            tile.to_msg(id)
        };
        let _ = self.status_tx.send(StatusEvent::Tile(msg));
    }

    pub fn add_tile_bytes(&self, id: u64, bytes: u64) {
        if let Some(entry) = self.tile_entry(id) {
            entry.lock().unwrap().downloaded_bytes += bytes;
        }
    }

    pub fn set_tile_status(&self, id: u64, status: &str) {
        let Some(entry) = self.tile_entry(id) else {
            return;
        };
        let msg = {
            let mut tile = entry.lock().unwrap();
            tile.status = status.to_string();
            tile.to_msg(id)
        };
        let _ = self.status_tx.send(StatusEvent::Tile(msg));
    }

    /// Overwrite policy recorded when the tile was queued.
    pub fn tile_over(&self, id: u64) -> Option<u8> {
        self.tile_entry(id).map(|e| e.lock().unwrap().over)
    }

    pub fn tile_snapshots(&self) -> Vec<TileProgressMsg> {
        let map = self.tiles.lock().unwrap();
        map.iter().map(|(id, e)| e.lock().unwrap().to_msg(*id)).collect()
    }

    pub fn set_position(&self, fix: Option<PositionFix>) {
        *self.position.lock().unwrap() = fix;
    }

    pub fn position_snapshot(&self) -> Option<PositionFix> {
        *self.position.lock().unwrap()
    }

    pub fn set_connection(&self, c: ConnectionState) {
        *self.connection.lock().unwrap() = c;
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.connection.lock().unwrap()
    }
}

pub fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_grid_tracks_completion() {
        let (state, _rx) = AppState::new();
        state.register_tile(42, 3, 2, 0, 1);
        assert_eq!(state.tile_over(42), Some(1));
        state.set_chunk_state(42, 1, 1, ChunkState::InProgress);
        state.set_chunk_state(42, 1, 1, ChunkState::Completed);
        state.set_chunk_state(42, 2, 2, ChunkState::Completed);
        // Re-completing a cell does not double count.
        state.set_chunk_state(42, 2, 2, ChunkState::Completed);

        let snaps = state.tile_snapshots();
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].chunks_completed, 2);
        assert_eq!(snaps[0].grid[0][0], ChunkState::Completed);
        assert_eq!(snaps[0].grid[1][1], ChunkState::Completed);
        assert_eq!(snaps[0].grid[0][1], ChunkState::Pending);
    }

    #[test]
    fn counters_and_job_drain() {
        let (state, _rx) = AppState::new();
        state.inc_pending(3);
        state.mark_done();
        state.mark_failed();
        let t = state.totals_snapshot();
        assert_eq!(t.pending, 1);
        assert_eq!(t.done, 1);
        assert_eq!(t.failed, 1);

        let a = state.allocate_job_id();
        let b = state.allocate_job_id();
        assert!(b > a);
        state.job_completed(a);
        state.job_completed(b);
        assert_eq!(state.drain_completed_jobs(), vec![a, b]);
        assert!(state.drain_completed_jobs().is_empty());
    }

    #[test]
    fn log_channel_drops_on_overflow() {
        let (state, mut rx) = AppState::new();
        for i in 0..500 {
            state.log_line(format!("line {i}"));
        }
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, LOG_CHANNEL_CAPACITY);
    }
}
